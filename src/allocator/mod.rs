//! Sub-allocation of mesh vertex and index data out of two shared GPU
//! buffers.

use std::sync::atomic::{AtomicU64, Ordering};

use bytemuck::Pod;
use parking_lot::Mutex;

use crate::{
    config::AllocatorConfig,
    error::AllocError,
    gpu::{BufferDesc, BufferKind, GpuDevice},
};

pub mod arena;
mod growth;
pub mod range;
pub mod reclaim;

pub use arena::{Arena, ArenaSnapshot};
pub use range::{AllocationId, MeshRange, Range};
pub use reclaim::RetiredBuffers;

/// Ids are unique across allocators so a handle given to the wrong one is
/// caught instead of freeing someone else's range.
static NEXT_ALLOCATION: AtomicU64 = AtomicU64::new(0);

fn next_id() -> AllocationId {
    AllocationId(NEXT_ALLOCATION.fetch_add(1, Ordering::Relaxed))
}

/// One arena and the buffer it describes.
pub(crate) struct Pool<B> {
    arena: Arena,
    buffer: Option<B>,
    stride: u32,
    growths: u64,
}

impl<B> Pool<B> {
    fn new(kind: BufferKind, stride: u32) -> Self {
        Self {
            arena: Arena::new(kind, 0),
            buffer: None,
            stride,
            growths: 0,
        }
    }
}

struct Pools<B> {
    vertex: Pool<B>,
    index: Pool<B>,
}

impl<B> Pools<B> {
    fn get(&self, kind: BufferKind) -> &Pool<B> {
        match kind {
            BufferKind::Vertex => &self.vertex,
            BufferKind::Index => &self.index,
        }
    }

    fn get_mut(&mut self, kind: BufferKind) -> &mut Pool<B> {
        match kind {
            BufferKind::Vertex => &mut self.vertex,
            BufferKind::Index => &mut self.index,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatorStats {
    /// Growth cycles across both pools, including the first buffer creation.
    pub growth_count: u64,
    pub live_meshes: usize,
    pub retired_buffers: usize,
    pub vertex_capacity: u32,
    pub index_capacity: u32,
}

/// The mesh storage of a render engine: a vertex pool and an index pool, each
/// one GPU buffer carved up with a first-fit free list.
///
/// Pools grow on demand. Growth repacks live data to the front of the new
/// buffer, so offsets change; look them up with [`MeshAllocator::resolve`]
/// rather than caching them across allocations.
///
/// All bookkeeping for both pools sits behind one lock, so allocation,
/// deallocation and growth never interleave.
pub struct MeshAllocator<D: GpuDevice> {
    device: D,
    config: AllocatorConfig,
    pools: Mutex<Pools<D::Buffer>>,
    retired: Mutex<RetiredBuffers<D::Buffer>>,
    frame: AtomicU64,
}

impl<D: GpuDevice> MeshAllocator<D> {
    pub fn new(device: D, config: AllocatorConfig) -> Result<Self, AllocError> {
        config.validate().map_err(AllocError::InvalidConfig)?;

        let mut pools = Pools {
            vertex: Pool::new(BufferKind::Vertex, config.vertex_stride),
            index: Pool::new(BufferKind::Index, config.index_stride),
        };

        for (kind, capacity) in [
            (BufferKind::Vertex, config.initial_vertex_capacity),
            (BufferKind::Index, config.initial_index_capacity),
        ] {
            if capacity == 0 {
                continue;
            }

            let pool = pools.get_mut(kind);
            let desc = BufferDesc {
                kind,
                size: capacity,
                stride: pool.stride,
            };
            let buffer = device
                .create_buffer(&desc)
                .map_err(|source| AllocError::Growth {
                    kind,
                    size: capacity,
                    source,
                })?;

            pool.arena = Arena::new(kind, capacity);
            pool.buffer = Some(buffer);
        }

        Ok(Self {
            device,
            config,
            pools: Mutex::new(pools),
            retired: Mutex::new(RetiredBuffers::default()),
            frame: AtomicU64::new(0),
        })
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    /// Places `vertices` and `indices` in their pools, growing either pool if
    /// it has no free range large enough, and uploads them.
    ///
    /// Errors are fatal: the device could not provide a larger buffer, or the
    /// pool would pass `max_capacity`. Nothing stays allocated on failure.
    pub fn allocate_mesh<V: Pod, I: Pod>(
        &self,
        vertices: &[V],
        indices: &[I],
    ) -> Result<MeshRange, AllocError> {
        let vertex_bytes: &[u8] = bytemuck::cast_slice(vertices);
        let index_bytes: &[u8] = bytemuck::cast_slice(indices);

        let mut pools = self.pools.lock();

        let mesh = MeshRange {
            vertex: next_id(),
            index: next_id(),
        };

        let vertex_range = self.place(&mut pools.vertex, vertex_bytes.len(), mesh.vertex)?;
        let index_range = match self.place(&mut pools.index, index_bytes.len(), mesh.index) {
            Ok(range) => range,
            Err(e) => {
                pools.vertex.arena.release(mesh.vertex);
                return Err(e);
            }
        };

        self.upload(&pools.vertex, vertex_range, vertex_bytes);
        self.upload(&pools.index, index_range, index_bytes);

        Ok(mesh)
    }

    /// Returns both of the mesh's ranges to their pools.
    ///
    /// # Panics
    /// If `mesh` was not handed out by this allocator.
    pub fn deallocate_mesh(&self, mesh: MeshRange) {
        let mut pools = self.pools.lock();

        // checked up front so a bad handle leaves both pools untouched
        assert!(
            pools.vertex.arena.is_allocated(mesh.vertex)
                && pools.index.arena.is_allocated(mesh.index),
            "{mesh:?} is not allocated here"
        );

        let vertex = pools.vertex.arena.release(mesh.vertex);
        let index = pools.index.arena.release(mesh.index);
        log::debug!("Freed mesh, vertex {:?}, index {:?}", vertex, index);
    }

    /// Where the mesh's data currently lives, `(vertex, index)`.
    ///
    /// # Panics
    /// If `mesh` was not handed out by this allocator.
    pub fn resolve(&self, mesh: &MeshRange) -> (Range, Range) {
        let pools = self.pools.lock();

        match (
            pools.vertex.arena.range_of(mesh.vertex),
            pools.index.arena.range_of(mesh.index),
        ) {
            (Some(vertex), Some(index)) => (vertex, index),
            _ => panic!("{mesh:?} is not allocated here"),
        }
    }

    pub fn snapshot(&self, kind: BufferKind) -> ArenaSnapshot {
        self.pools.lock().get(kind).arena.snapshot()
    }

    /// Runs `f` with the pool's current buffer, `None` before its first growth.
    /// The allocator is locked for the duration.
    pub fn with_backing_buffer<R>(
        &self,
        kind: BufferKind,
        f: impl FnOnce(Option<&D::Buffer>) -> R,
    ) -> R {
        let pools = self.pools.lock();
        f(pools.get(kind).buffer.as_ref())
    }

    pub fn stats(&self) -> AllocatorStats {
        let pools = self.pools.lock();
        AllocatorStats {
            growth_count: pools.vertex.growths + pools.index.growths,
            live_meshes: pools.vertex.arena.live_allocations(),
            retired_buffers: self.retired.lock().len(),
            vertex_capacity: pools.vertex.arena.capacity(),
            index_capacity: pools.index.arena.capacity(),
        }
    }

    pub fn current_frame(&self) -> u64 {
        self.frame.load(Ordering::Acquire)
    }

    /// Marks a frame boundary. Buffers retired from now on are tagged with the
    /// returned frame.
    pub fn advance_frame(&self) -> u64 {
        self.frame.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drops buffers retired in or before `completed_frame`. Call once the GPU
    /// has finished that frame.
    pub fn reclaim(&self, completed_frame: u64) -> usize {
        let dropped = self.retired.lock().reclaim(completed_frame);
        if dropped > 0 {
            log::debug!("Dropped {} retired pool buffers", dropped);
        }
        dropped
    }

    fn place(
        &self,
        pool: &mut Pool<D::Buffer>,
        len: usize,
        id: AllocationId,
    ) -> Result<Range, AllocError> {
        let kind = pool.arena.kind();
        let capacity = pool.arena.capacity();
        let overflow = || AllocError::CapacityOverflow {
            kind,
            capacity,
            requested: u32::try_from(len).unwrap_or(u32::MAX),
        };

        let size = u32::try_from(len)
            .ok()
            .and_then(|len| self.config.align(len))
            .ok_or_else(overflow)?;

        if let Some(range) = pool.arena.allocate(size, id) {
            return Ok(range);
        }

        let new_size = self.grown_size(capacity, size).ok_or_else(overflow)?;
        growth::grow_pool(&self.device, pool, new_size, &self.retired, self.current_frame())?;

        // the packed live data is at most the old capacity, so the tail left
        // by growth always fits the request
        match pool.arena.allocate(size, id) {
            Some(range) => Ok(range),
            None => unreachable!("{kind} pool grew to {new_size} and still cannot fit {size}"),
        }
    }

    /// Capacity after growing to fit `size` more bytes: at least
    /// `min_growth` more, aligned, clamped to `max_capacity`.
    fn grown_size(&self, capacity: u32, size: u32) -> Option<u32> {
        let needed = capacity.checked_add(size)?;
        if needed > self.config.max_capacity {
            return None;
        }

        let wanted = capacity
            .checked_add(size.max(self.config.min_growth))
            .and_then(|s| self.config.align(s))
            .unwrap_or(u32::MAX);
        Some(wanted.min(self.config.max_capacity).max(needed))
    }

    fn upload(&self, pool: &Pool<D::Buffer>, range: Range, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }

        log::debug!(
            "Uploading {} bytes to the {} pool at {}",
            bytes.len(),
            pool.arena.kind(),
            range.start
        );

        if let Some(buffer) = &pool.buffer {
            self.device.update_buffer_data(buffer, bytes, range.start);
        }
    }
}

#[cfg(test)]
mod test {
    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::{MeshAllocator, MeshRange, Range};
    use crate::{
        config::AllocatorConfig,
        error::AllocError,
        gpu::{BufferKind, GpuError, HostDevice},
        mesh::{quad, VertexNormalUV},
    };

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn config(min_growth: u32) -> AllocatorConfig {
        AllocatorConfig {
            min_growth,
            ..Default::default()
        }
    }

    fn allocator(min_growth: u32) -> (HostDevice, MeshAllocator<HostDevice>) {
        init_logging();
        let device = HostDevice::new();
        let allocator = MeshAllocator::new(device.clone(), config(min_growth)).expect("");
        (device, allocator)
    }

    /// `len` bytes that are different for every `seed`.
    fn pattern(seed: u8, len: usize) -> Vec<u8> {
        (0..len).map(|i| seed.wrapping_mul(31).wrapping_add(i as u8)).collect()
    }

    fn read(allocator: &MeshAllocator<HostDevice>, kind: BufferKind, range: Range) -> Vec<u8> {
        allocator.with_backing_buffer(kind, |buffer| {
            buffer.expect("").read(range.start, range.count)
        })
    }

    fn assert_partitioned(allocator: &MeshAllocator<HostDevice>) {
        for kind in [BufferKind::Vertex, BufferKind::Index] {
            let snapshot = allocator.snapshot(kind);
            assert!(snapshot.is_partitioned(), "{snapshot:?}");
            assert!(snapshot.is_merge_closed(), "{snapshot:?}");
        }
    }

    #[test]
    fn first_allocation_creates_the_pools() {
        let (device, allocator) = allocator(1024);
        assert_eq!(device.live_buffers(), 0);

        let (vertices, indices) = quad();
        let mesh = allocator.allocate_mesh(&vertices, &indices).expect("");

        let (vertex, index) = allocator.resolve(&mesh);
        assert_eq!(vertex, Range::new(0, 128));
        assert_eq!(index, Range::new(0, 24));
        assert_eq!(device.live_buffers(), 2);
        assert_eq!(allocator.stats().growth_count, 2);

        assert_eq!(
            read(&allocator, BufferKind::Vertex, vertex),
            bytemuck::cast_slice::<VertexNormalUV, u8>(&vertices)
        );
        assert_eq!(
            read(&allocator, BufferKind::Index, index),
            bytemuck::cast_slice::<u32, u8>(&indices)
        );
    }

    #[test]
    fn exact_fit_reuses_a_freed_range() {
        let (_, allocator) = allocator(128);

        let a = allocator.allocate_mesh(&[1u8; 64], &[1u8; 64]).expect("");
        assert_eq!(allocator.resolve(&a).0, Range::new(0, 64));
        assert_eq!(allocator.snapshot(BufferKind::Vertex).capacity, 128);

        let b = allocator.allocate_mesh(&[2u8; 32], &[2u8; 32]).expect("");
        assert_eq!(allocator.resolve(&b).0, Range::new(64, 32));
        assert_eq!(allocator.stats().growth_count, 2);

        allocator.deallocate_mesh(a);
        let snapshot = allocator.snapshot(BufferKind::Vertex);
        assert!(snapshot.free.contains(&Range::new(0, 64)));
        assert_eq!(snapshot.allocated, vec![Range::new(64, 32)]);

        let c = allocator.allocate_mesh(&[3u8; 64], &[3u8; 64]).expect("");
        assert_eq!(allocator.resolve(&c).0, Range::new(0, 64));

        let snapshot = allocator.snapshot(BufferKind::Vertex);
        assert_eq!(snapshot.free, vec![Range::new(96, 32)]);
        assert!(snapshot.free.iter().all(|r| !r.is_empty()));
        assert_eq!(allocator.stats().growth_count, 2);
        assert_partitioned(&allocator);
    }

    #[test]
    fn free_right_after_alloc_restores_coverage() {
        let (_, allocator) = allocator(1024);
        let keep = allocator.allocate_mesh(&[0u8; 100], &[0u8; 40]).expect("");
        let before = (
            allocator.snapshot(BufferKind::Vertex),
            allocator.snapshot(BufferKind::Index),
        );

        let mesh = allocator.allocate_mesh(&[0u8; 200], &[0u8; 60]).expect("");
        allocator.deallocate_mesh(mesh);

        assert_eq!(allocator.snapshot(BufferKind::Vertex), before.0);
        assert_eq!(allocator.snapshot(BufferKind::Index), before.1);
        allocator.deallocate_mesh(keep);
    }

    #[test]
    fn oversized_request_grows_exactly_once() {
        let (_, allocator) = allocator(256);
        let meshes: Vec<MeshRange> = (0..4)
            .map(|_| allocator.allocate_mesh(&[0u8; 64], &[0u8; 64]).expect(""))
            .collect();
        assert_eq!(allocator.stats().growth_count, 2);

        // frees 0 and 2: two 64 byte holes, no range of 128
        let mut meshes = meshes.into_iter();
        allocator.deallocate_mesh(meshes.next().expect(""));
        let b = meshes.next().expect("");
        allocator.deallocate_mesh(meshes.next().expect(""));
        let d = meshes.next().expect("");

        let big = allocator.allocate_mesh(&[0u8; 128], &[0u8; 128]).expect("");
        let stats = allocator.stats();
        assert_eq!(stats.growth_count, 4);
        assert_eq!(stats.vertex_capacity, 512);

        // d had the highest offset, so compaction packed it first
        assert_eq!(allocator.resolve(&d).0, Range::new(0, 64));
        assert_eq!(allocator.resolve(&b).0, Range::new(64, 64));
        assert_eq!(allocator.resolve(&big).0, Range::new(128, 128));
        assert_partitioned(&allocator);
    }

    #[test]
    fn growth_preserves_live_data() {
        let (_, allocator) = allocator(256);

        let mut live = vec![];
        for seed in 0..8u8 {
            let vertices = pattern(seed, 32 + 4 * seed as usize);
            let indices = pattern(seed.wrapping_add(100), 12 + 4 * seed as usize);
            let mesh = allocator.allocate_mesh(&vertices, &indices).expect("");
            live.push((mesh, vertices, indices));
        }

        // punch holes, then force both pools to grow
        for i in [6, 4, 1] {
            let (mesh, _, _) = live.remove(i);
            allocator.deallocate_mesh(mesh);
        }
        let growths = allocator.stats().growth_count;
        let vertices = pattern(200, 1024);
        let indices = pattern(201, 1024);
        let big = allocator.allocate_mesh(&vertices, &indices).expect("");
        live.push((big, vertices, indices));
        assert_eq!(allocator.stats().growth_count, growths + 2);

        for (mesh, vertices, indices) in &live {
            let (vertex, index) = allocator.resolve(mesh);
            assert_eq!(&read(&allocator, BufferKind::Vertex, vertex), vertices);
            assert_eq!(&read(&allocator, BufferKind::Index, index), indices);
        }
        assert_partitioned(&allocator);
    }

    #[test]
    fn replaced_buffers_wait_for_their_frame() {
        let (device, allocator) = allocator(64);

        let _a = allocator.allocate_mesh(&[0u8; 64], &[0u8; 64]).expect("");
        assert_eq!(allocator.advance_frame(), 1);
        let _b = allocator.allocate_mesh(&[0u8; 64], &[0u8; 64]).expect("");

        assert_eq!(allocator.stats().retired_buffers, 2);
        assert_eq!(device.live_buffers(), 4);

        assert_eq!(allocator.reclaim(0), 0);
        assert_eq!(device.live_buffers(), 4);

        assert_eq!(allocator.reclaim(1), 2);
        assert_eq!(device.live_buffers(), 2);
        assert_eq!(allocator.stats().retired_buffers, 0);
    }

    #[test]
    fn random_sequences_keep_the_pools_partitioned() {
        let (_, allocator) = allocator(512);
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut live: Vec<MeshRange> = vec![];

        for _ in 0..2000 {
            if live.is_empty() || rng.gen_bool(0.55) {
                let vertices = vec![0u8; rng.gen_range(0..64) * 4];
                let indices = vec![0u32; rng.gen_range(0..48)];
                live.push(allocator.allocate_mesh(&vertices, &indices).expect(""));
            } else {
                let i = rng.gen_range(0..live.len());
                allocator.deallocate_mesh(live.swap_remove(i));
            }
            assert_partitioned(&allocator);
        }

        for mesh in live.drain(..) {
            allocator.deallocate_mesh(mesh);
        }
        for kind in [BufferKind::Vertex, BufferKind::Index] {
            let snapshot = allocator.snapshot(kind);
            assert!(snapshot.allocated.is_empty());
            assert_eq!(snapshot.free, vec![Range::new(0, snapshot.capacity)]);
        }
    }

    #[test]
    fn concurrent_callers_are_serialized() {
        let (_, allocator) = allocator(256);

        std::thread::scope(|s| {
            for t in 0..4u8 {
                let allocator = &allocator;
                s.spawn(move || {
                    let mut mine = vec![];
                    for i in 0..50u8 {
                        let vertices = pattern(t ^ i, 16 + 4 * (i as usize % 7));
                        let indices = pattern(i, 8);
                        let mesh = allocator.allocate_mesh(&vertices, &indices).expect("");
                        mine.push((mesh, vertices));
                        if i % 3 == 0 {
                            let (mesh, _) = mine.swap_remove(0);
                            allocator.deallocate_mesh(mesh);
                        }
                    }
                    for (mesh, vertices) in mine {
                        let (vertex, _) = allocator.resolve(&mesh);
                        assert_eq!(read(allocator, BufferKind::Vertex, vertex), vertices);
                        allocator.deallocate_mesh(mesh);
                    }
                });
            }
        });

        assert_eq!(allocator.stats().live_meshes, 0);
        assert_partitioned(&allocator);
    }

    #[test]
    fn out_of_memory_is_reported_and_rolled_back() {
        init_logging();
        let device = HostDevice::with_memory_limit(256);
        let allocator = MeshAllocator::new(device, config(64)).expect("");

        let mesh = allocator.allocate_mesh(&[0u8; 64], &[0u8; 64]).expect("");

        // the vertex pool can grow, the index pool then cannot
        let err = allocator.allocate_mesh(&[0u8; 4], &[0u8; 128]).unwrap_err();
        assert_eq!(
            err,
            AllocError::Growth {
                kind: BufferKind::Index,
                size: 192,
                source: GpuError::OutOfMemory { size: 192 },
            }
        );

        let stats = allocator.stats();
        assert_eq!(stats.live_meshes, 1);
        assert_eq!(allocator.snapshot(BufferKind::Vertex).allocated.len(), 1);
        assert_eq!(allocator.snapshot(BufferKind::Index).allocated.len(), 1);
        assert_partitioned(&allocator);

        allocator.deallocate_mesh(mesh);
    }

    #[test]
    fn device_loss_is_fatal() {
        let (device, allocator) = allocator(64);
        let _mesh = allocator.allocate_mesh(&[0u8; 64], &[0u8; 64]).expect("");

        device.lose_device();

        let err = allocator.allocate_mesh(&[0u8; 64], &[0u8; 4]).unwrap_err();
        assert!(matches!(
            err,
            AllocError::Growth {
                source: GpuError::DeviceLost(_),
                ..
            }
        ));
    }

    #[test]
    fn device_loss_during_the_growth_copy_is_fatal() {
        let (device, allocator) = allocator(64);
        let _mesh = allocator.allocate_mesh(&[1u8; 64], &[0u8; 64]).expect("");

        device.lose_on_next_wait();

        let err = allocator.allocate_mesh(&[0u8; 64], &[0u8; 4]).unwrap_err();
        assert!(matches!(
            err,
            AllocError::Growth {
                kind: BufferKind::Vertex,
                size: 128,
                source: GpuError::DeviceLost(_),
            }
        ));

        // the replaced buffer is still handed to the retired list
        let stats = allocator.stats();
        assert_eq!(stats.retired_buffers, 1);
        assert_eq!(stats.vertex_capacity, 128);
        assert_eq!(device.submissions(), 1);
        assert_partitioned(&allocator);
    }

    #[test]
    fn invalid_config_is_an_error() {
        init_logging();
        let config = AllocatorConfig {
            alignment: 3,
            ..Default::default()
        };

        let err = MeshAllocator::new(HostDevice::new(), config).err();
        assert!(matches!(err, Some(AllocError::InvalidConfig(_))));
    }

    #[test]
    fn max_capacity_caps_growth() {
        init_logging();
        let config = AllocatorConfig {
            min_growth: 1024,
            max_capacity: 256,
            ..Default::default()
        };
        let allocator = MeshAllocator::new(HostDevice::new(), config).expect("");

        let _a = allocator.allocate_mesh(&[0u8; 200], &[0u8; 4]).expect("");
        assert_eq!(allocator.stats().vertex_capacity, 256);

        let err = allocator.allocate_mesh(&[0u8; 100], &[0u8; 4]).unwrap_err();
        assert_eq!(
            err,
            AllocError::CapacityOverflow {
                kind: BufferKind::Vertex,
                capacity: 256,
                requested: 100,
            }
        );
    }

    #[test]
    fn meshes_without_indices_take_no_index_space() {
        let (_, allocator) = allocator(64);
        let (vertices, _) = quad();

        let mesh = allocator.allocate_mesh(&vertices, &[] as &[u32]).expect("");
        let (_, index) = allocator.resolve(&mesh);

        assert!(index.is_empty());
        assert_eq!(allocator.stats().index_capacity, 0);
        allocator.deallocate_mesh(mesh);
        assert_partitioned(&allocator);
    }

    #[test]
    fn initial_capacity_is_reserved_up_front() {
        init_logging();
        let device = HostDevice::new();
        let config = AllocatorConfig {
            initial_vertex_capacity: 4096,
            initial_index_capacity: 1024,
            ..Default::default()
        };
        let allocator = MeshAllocator::new(device.clone(), config).expect("");
        assert_eq!(device.live_buffers(), 2);

        let _mesh = allocator.allocate_mesh(&[0u8; 64], &[0u8; 64]).expect("");
        assert_eq!(allocator.stats().growth_count, 0);
    }

    #[test]
    #[should_panic(expected = "is not allocated here")]
    fn foreign_handles_are_rejected() {
        let (_, first) = allocator(64);
        let (_, second) = allocator(64);

        let _mine = second.allocate_mesh(&[0u8; 4], &[0u8; 4]).expect("");
        let theirs = first.allocate_mesh(&[0u8; 4], &[0u8; 4]).expect("");
        second.deallocate_mesh(theirs);
    }
}
