/// A half-open interval `[start, start + count)` inside one linear buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Range {
    pub start: u32,
    pub count: u32,
}

impl Range {
    pub fn new(start: u32, count: u32) -> Self {
        Self { start, count }
    }

    pub fn end(&self) -> u32 {
        self.start + self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Empty ranges overlap nothing.
    pub fn overlaps(&self, other: &Range) -> bool {
        !self.is_empty() && !other.is_empty() && self.start < other.end() && other.start < self.end()
    }
}

/// Identifies one live allocation inside an arena. Never reused by the
/// allocator that handed it out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AllocationId(pub(crate) u64);

/// The handle returned by `MeshAllocator::allocate_mesh`, one allocation per
/// arena.
///
/// Growth repacks the arenas, so the handle does not carry offsets; use
/// `MeshAllocator::resolve` to get the current placement. It is deliberately
/// not `Clone`: giving it back to `deallocate_mesh` consumes it.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct MeshRange {
    pub(crate) vertex: AllocationId,
    pub(crate) index: AllocationId,
}
