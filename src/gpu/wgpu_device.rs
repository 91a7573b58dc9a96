use std::sync::Arc;

use parking_lot::Mutex;
use wgpu::{
    Buffer, BufferDescriptor, BufferUsages, CommandEncoder, CommandEncoderDescriptor, Device,
    ErrorFilter, Maintain, Queue, SubmissionIndex, COPY_BUFFER_ALIGNMENT,
};

use crate::context::GpuContext;

use super::{BufferDesc, BufferKind, CommandBuffer, CopyRegion, Fence, GpuDevice, GpuError};

/// Set by the device-lost callback, read by every fence wait.
type LostFlag = Arc<Mutex<Option<String>>>;

fn check_lost(lost: &LostFlag) -> Result<(), GpuError> {
    match lost.lock().as_ref() {
        Some(message) => Err(GpuError::DeviceLost(message.clone())),
        None => Ok(()),
    }
}

fn align_up(size: u64) -> u64 {
    size.div_ceil(COPY_BUFFER_ALIGNMENT) * COPY_BUFFER_ALIGNMENT
}

/// [`GpuDevice`] over a wgpu device and queue.
///
/// Copies and uploads must be multiples of 4 bytes, so the allocator's
/// alignment must be at least 4 when running on this device.
pub struct WgpuDevice {
    device: Arc<Device>,
    queue: Arc<Queue>,
    lost: LostFlag,
}

impl WgpuDevice {
    pub fn new(device: Arc<Device>, queue: Arc<Queue>) -> Self {
        let lost: LostFlag = Arc::new(Mutex::new(None));

        let flag = lost.clone();
        device.set_device_lost_callback(move |reason, message| {
            log::error!("Device lost ({:?}): {}", reason, message);
            *flag.lock() = Some(message);
        });

        Self {
            device,
            queue,
            lost,
        }
    }

    pub fn from_context(context: &GpuContext) -> Self {
        Self::new(context.device.clone(), context.queue.clone())
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}

pub struct WgpuFence {
    device: Arc<Device>,
    lost: LostFlag,
    submission: Option<SubmissionIndex>,
}

impl Fence for WgpuFence {
    fn wait(&self) -> Result<(), GpuError> {
        if let Some(index) = &self.submission {
            let _ = self
                .device
                .poll(Maintain::WaitForSubmissionIndex(index.clone()));
        }
        check_lost(&self.lost)
    }
}

pub struct WgpuCommandBuffer {
    encoder: CommandEncoder,
    queue: Arc<Queue>,
}

impl CommandBuffer for WgpuCommandBuffer {
    type Buffer = Buffer;
    type Fence = WgpuFence;

    fn copy_buffer_region(&mut self, src: &Buffer, dst: &Buffer, region: CopyRegion) {
        self.encoder.copy_buffer_to_buffer(
            src,
            region.src_offset as u64,
            dst,
            region.dst_offset as u64,
            region.size as u64,
        );
    }

    fn commit(self, fence: &mut WgpuFence) {
        fence.submission = Some(self.queue.submit(Some(self.encoder.finish())));
    }
}

impl GpuDevice for WgpuDevice {
    type Buffer = Buffer;
    type Fence = WgpuFence;
    type CommandBuffer = WgpuCommandBuffer;

    fn create_buffer(&self, desc: &BufferDesc) -> Result<Buffer, GpuError> {
        check_lost(&self.lost)?;

        let size = align_up(desc.size as u64);
        if size > self.device.limits().max_buffer_size {
            return Err(GpuError::OutOfMemory { size });
        }

        let (label, usage) = match desc.kind {
            BufferKind::Vertex => ("Mesh vertex pool", BufferUsages::VERTEX),
            BufferKind::Index => ("Mesh index pool", BufferUsages::INDEX),
        };

        self.device.push_error_scope(ErrorFilter::OutOfMemory);
        let buffer = self.device.create_buffer(&BufferDescriptor {
            label: Some(label),
            size,
            usage: usage | BufferUsages::COPY_DST | BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });

        if let Some(error) = pollster::block_on(self.device.pop_error_scope()) {
            log::warn!("Creating {} bytes for the {} pool failed: {}", size, desc.kind, error);
            return Err(GpuError::OutOfMemory { size });
        }

        Ok(buffer)
    }

    fn create_fence(&self) -> WgpuFence {
        WgpuFence {
            device: self.device.clone(),
            lost: self.lost.clone(),
            submission: None,
        }
    }

    fn create_command_buffer(&self) -> WgpuCommandBuffer {
        WgpuCommandBuffer {
            encoder: self
                .device
                .create_command_encoder(&CommandEncoderDescriptor {
                    label: Some("Mesh pool growth"),
                }),
            queue: self.queue.clone(),
        }
    }

    fn update_buffer_data(&self, buffer: &Buffer, data: &[u8], offset: u32) {
        // write_buffer wants a multiple of 4 bytes; the arena range is
        // already rounded up, so the padding stays inside it
        if data.len() as u64 % COPY_BUFFER_ALIGNMENT != 0 {
            let mut padded = data.to_vec();
            padded.resize(align_up(data.len() as u64) as usize, 0);
            self.queue.write_buffer(buffer, offset as u64, &padded);
        } else {
            self.queue.write_buffer(buffer, offset as u64, data);
        }
    }
}
