use allocator::MeshAllocator;
use config::AllocatorConfig;
use context::GpuContext;
use error::RunError;
use gpu::{GpuDevice, HostDevice, WgpuDevice};

pub mod allocator;
pub mod config;
pub mod context;
pub mod error;
pub mod gpu;
pub mod mesh;

/// Loads the config, brings up a headless device and pushes a batch of meshes
/// through the pools. Falls back to host memory when no adapter is available.
pub fn run(config_path: Option<&str>) -> Result<(), RunError> {
    let config = match config_path {
        Some(path) => AllocatorConfig::from_file(path)?,
        None => AllocatorConfig::default(),
    };

    match pollster::block_on(GpuContext::new(config.backend)) {
        Ok(context) => {
            log::info!("Running on {:?}", context.adapter.get_info().backend);
            let allocator = MeshAllocator::new(WgpuDevice::from_context(&context), config)?;
            churn(&allocator)
        }
        Err(e) => {
            log::warn!("No GPU ({}), using host memory", e);
            let allocator = MeshAllocator::new(HostDevice::new(), config)?;
            churn(&allocator)
        }
    }
}

fn churn<D: GpuDevice>(allocator: &MeshAllocator<D>) -> Result<(), RunError> {
    let (vertices, indices) = mesh::quad();

    let mut meshes = vec![];
    for _ in 0..256 {
        meshes.push(allocator.allocate_mesh(&vertices, &indices)?);
    }

    // free every other quad, then ask for something no hole can hold
    let mut kept = vec![];
    for (i, mesh) in meshes.into_iter().enumerate() {
        if i % 2 == 0 {
            allocator.deallocate_mesh(mesh);
        } else {
            kept.push(mesh);
        }
    }

    let frame = allocator.advance_frame();
    let big: Vec<_> = (0..1024).flat_map(|_| vertices).collect();
    let big_indices: Vec<u32> = (0..1024u32)
        .flat_map(|q| indices.map(|i| i + 4 * q))
        .collect();
    kept.push(allocator.allocate_mesh(&big, &big_indices)?);

    let stats = allocator.stats();
    log::info!(
        "{} meshes live, {} growths, vertex pool {} bytes ({:.1}% full), index pool {} bytes",
        stats.live_meshes,
        stats.growth_count,
        stats.vertex_capacity,
        allocator.snapshot(gpu::BufferKind::Vertex).percent_full() * 100.0,
        stats.index_capacity
    );

    log::info!("Reclaimed {} retired buffers", allocator.reclaim(frame));

    for mesh in kept {
        allocator.deallocate_mesh(mesh);
    }

    Ok(())
}
