//! A device that keeps its buffers in host memory and executes copies on
//! commit. Behaves like a GPU with an instantly finishing queue, which is what
//! the allocator tests and benchmarks run against.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Weak,
};

use parking_lot::Mutex;

use super::{BufferDesc, CommandBuffer, CopyRegion, Fence, GpuDevice, GpuError};

#[derive(Debug)]
struct Storage {
    desc: BufferDesc,
    bytes: Mutex<Vec<u8>>,
}

/// A buffer created by [`HostDevice`]. Clones share the same storage.
#[derive(Debug, Clone)]
pub struct HostBuffer(Arc<Storage>);

impl HostBuffer {
    /// Reads `count` bytes starting at `start`.
    pub fn read(&self, start: u32, count: u32) -> Vec<u8> {
        let bytes = self.0.bytes.lock();
        bytes[start as usize..(start + count) as usize].to_vec()
    }
}

#[derive(Debug, Default)]
struct Shared {
    memory_limit: Option<u64>,
    buffers: Mutex<Vec<Weak<Storage>>>,
    lost: AtomicBool,
    lose_on_wait: AtomicBool,
    submissions: AtomicU64,
}

impl Shared {
    fn check_lost(&self) -> Result<(), GpuError> {
        if self.lost.load(Ordering::Acquire) {
            return Err(GpuError::DeviceLost("host device marked lost".to_string()));
        }
        Ok(())
    }

    fn resident_bytes(&self) -> u64 {
        let mut buffers = self.buffers.lock();
        buffers.retain(|b| b.strong_count() > 0);
        buffers
            .iter()
            .filter_map(Weak::upgrade)
            .map(|b| b.desc.size as u64)
            .sum()
    }
}

#[derive(Debug, Clone, Default)]
pub struct HostDevice {
    shared: Arc<Shared>,
}

impl HostDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// A device that refuses to create buffers once `bytes` are resident.
    pub fn with_memory_limit(bytes: u64) -> Self {
        Self {
            shared: Arc::new(Shared {
                memory_limit: Some(bytes),
                ..Default::default()
            }),
        }
    }

    /// Buffers created by this device that have not been dropped yet.
    pub fn live_buffers(&self) -> usize {
        let mut buffers = self.shared.buffers.lock();
        buffers.retain(|b| b.strong_count() > 0);
        buffers.len()
    }

    pub fn resident_bytes(&self) -> u64 {
        self.shared.resident_bytes()
    }

    /// Number of command buffers committed so far.
    pub fn submissions(&self) -> u64 {
        self.shared.submissions.load(Ordering::Relaxed)
    }

    /// Simulates device loss: buffer creation and fence waits fail from now on.
    pub fn lose_device(&self) {
        self.shared.lost.store(true, Ordering::Release);
    }

    /// Loses the device the next time a fence is waited on, after the copies
    /// committed against it have already run.
    pub fn lose_on_next_wait(&self) {
        self.shared.lose_on_wait.store(true, Ordering::Release);
    }
}

pub struct HostFence {
    shared: Arc<Shared>,
    signaled: bool,
}

impl Fence for HostFence {
    fn wait(&self) -> Result<(), GpuError> {
        if self.shared.lose_on_wait.swap(false, Ordering::AcqRel) {
            self.shared.lost.store(true, Ordering::Release);
        }
        self.shared.check_lost()?;
        debug_assert!(self.signaled, "waited on a fence nothing was committed against");
        Ok(())
    }
}

pub struct HostCommandBuffer {
    shared: Arc<Shared>,
    copies: Vec<(HostBuffer, HostBuffer, CopyRegion)>,
}

impl CommandBuffer for HostCommandBuffer {
    type Buffer = HostBuffer;
    type Fence = HostFence;

    fn copy_buffer_region(&mut self, src: &HostBuffer, dst: &HostBuffer, region: CopyRegion) {
        self.copies.push((src.clone(), dst.clone(), region));
    }

    fn commit(self, fence: &mut HostFence) {
        self.shared.submissions.fetch_add(1, Ordering::Relaxed);

        for (src, dst, region) in self.copies {
            // staged through a temporary so src and dst may be the same buffer
            let staged = src.read(region.src_offset, region.size);
            let mut bytes = dst.0.bytes.lock();
            let dst_start = region.dst_offset as usize;
            bytes[dst_start..dst_start + staged.len()].copy_from_slice(&staged);
        }

        fence.signaled = true;
    }
}

impl GpuDevice for HostDevice {
    type Buffer = HostBuffer;
    type Fence = HostFence;
    type CommandBuffer = HostCommandBuffer;

    fn create_buffer(&self, desc: &BufferDesc) -> Result<HostBuffer, GpuError> {
        self.shared.check_lost()?;

        if let Some(limit) = self.shared.memory_limit {
            if self.shared.resident_bytes() + desc.size as u64 > limit {
                return Err(GpuError::OutOfMemory {
                    size: desc.size as u64,
                });
            }
        }

        let storage = Arc::new(Storage {
            desc: *desc,
            bytes: Mutex::new(vec![0; desc.size as usize]),
        });
        self.shared.buffers.lock().push(Arc::downgrade(&storage));

        Ok(HostBuffer(storage))
    }

    fn create_fence(&self) -> HostFence {
        HostFence {
            shared: self.shared.clone(),
            signaled: false,
        }
    }

    fn create_command_buffer(&self) -> HostCommandBuffer {
        HostCommandBuffer {
            shared: self.shared.clone(),
            copies: vec![],
        }
    }

    fn update_buffer_data(&self, buffer: &HostBuffer, data: &[u8], offset: u32) {
        let mut bytes = buffer.0.bytes.lock();
        let start = offset as usize;
        bytes[start..start + data.len()].copy_from_slice(data);
    }
}
