//! The narrow device interface the allocator is written against, plus the two
//! devices that implement it.

use std::fmt;

pub mod host;
pub mod wgpu_device;

pub use host::HostDevice;
pub use wgpu_device::WgpuDevice;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    Vertex,
    Index,
}

impl fmt::Display for BufferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferKind::Vertex => f.write_str("vertex"),
            BufferKind::Index => f.write_str("index"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDesc {
    pub kind: BufferKind,
    pub size: u32,
    pub stride: u32,
}

/// One buffer-to-buffer copy, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyRegion {
    pub src_offset: u32,
    pub dst_offset: u32,
    pub size: u32,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum GpuError {
    #[error("device ran out of memory creating a {size} byte buffer")]
    OutOfMemory { size: u64 },
    #[error("device lost: {0}")]
    DeviceLost(String),
}

/// CPU-side wait on submitted GPU work.
pub trait Fence {
    /// Blocks until the work committed against this fence has finished.
    fn wait(&self) -> Result<(), GpuError>;
}

/// Records copy commands and submits them.
pub trait CommandBuffer {
    type Buffer;
    type Fence: Fence;

    fn copy_buffer_region(&mut self, src: &Self::Buffer, dst: &Self::Buffer, region: CopyRegion);

    /// Submits everything recorded so far; `fence` signals when it is done.
    fn commit(self, fence: &mut Self::Fence);
}

/// Device factory and upload sink in one.
pub trait GpuDevice {
    type Buffer;
    type Fence: Fence;
    type CommandBuffer: CommandBuffer<Buffer = Self::Buffer, Fence = Self::Fence>;

    fn create_buffer(&self, desc: &BufferDesc) -> Result<Self::Buffer, GpuError>;

    fn create_fence(&self) -> Self::Fence;

    fn create_command_buffer(&self) -> Self::CommandBuffer;

    /// Writes `data` into `buffer` at `offset`. The data is staged by the time
    /// this returns, so the caller may drop it.
    fn update_buffer_data(&self, buffer: &Self::Buffer, data: &[u8], offset: u32);
}
