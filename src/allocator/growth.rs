use parking_lot::Mutex;

use crate::{
    error::AllocError,
    gpu::{BufferDesc, CommandBuffer, Fence, GpuDevice},
};

use super::{reclaim::RetiredBuffers, Pool};

/// Replaces the pool's buffer with one of `new_size` bytes, packing every
/// live range to the front of it.
///
/// The copies are submitted and waited on before this returns. The old buffer
/// goes to `retired` tagged with `frame`; it is never dropped here since
/// earlier frames may still read it.
pub(crate) fn grow_pool<D: GpuDevice>(
    device: &D,
    pool: &mut Pool<D::Buffer>,
    new_size: u32,
    retired: &Mutex<RetiredBuffers<D::Buffer>>,
    frame: u64,
) -> Result<(), AllocError> {
    let kind = pool.arena.kind();
    let old_size = pool.arena.capacity();

    let desc = BufferDesc {
        kind,
        size: new_size,
        stride: pool.stride,
    };
    let buffer = device.create_buffer(&desc).map_err(|source| {
        log::warn!("Could not grow the {} pool to {} bytes: {}", kind, new_size, source);
        AllocError::Growth {
            kind,
            size: new_size,
            source,
        }
    })?;

    let copies = pool.arena.compact(new_size);
    pool.growths += 1;

    let old = pool.buffer.take();
    let new = pool.buffer.insert(buffer);

    let Some(old) = old else {
        log::info!("Created the {} pool with {} bytes", kind, new_size);
        return Ok(());
    };

    let mut result = Ok(());
    if !copies.is_empty() {
        let mut commands = device.create_command_buffer();
        for region in &copies {
            log::debug!(
                "{} pool: moving {} bytes from {} to {}",
                kind,
                region.size,
                region.src_offset,
                region.dst_offset
            );
            commands.copy_buffer_region(&old, new, *region);
        }

        let mut fence = device.create_fence();
        commands.commit(&mut fence);
        result = fence.wait().map_err(|source| AllocError::Growth {
            kind,
            size: new_size,
            source,
        });
    }

    retired.lock().retire(old, frame);

    log::info!(
        "Grew the {} pool from {} to {} bytes, {} ranges compacted",
        kind,
        old_size,
        new_size,
        copies.len()
    );

    result
}
