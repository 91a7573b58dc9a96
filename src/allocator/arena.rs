use crate::gpu::{BufferKind, CopyRegion};

use super::range::{AllocationId, Range};

/// Free/allocated bookkeeping for one linear buffer. Knows nothing about the
/// buffer itself, only which byte spans of it are in use.
///
/// The free list is kept sorted by start address, which makes first-fit pick
/// the lowest fitting address and lets a freed range find its neighbours
/// without scanning. The allocated list is in insertion order.
#[derive(Debug, Clone)]
pub struct Arena {
    kind: BufferKind,
    capacity: u32,
    freelist: Vec<Range>,
    occulist: Vec<(AllocationId, Range)>,
}

impl Arena {
    pub fn new(kind: BufferKind, capacity: u32) -> Self {
        let freelist = if capacity > 0 {
            vec![Range::new(0, capacity)]
        } else {
            vec![]
        };

        Self {
            kind,
            capacity,
            freelist,
            occulist: vec![],
        }
    }

    pub fn kind(&self) -> BufferKind {
        self.kind
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Index of the first free range that can hold `size` bytes.
    pub fn find_placement(&self, size: u32) -> Option<usize> {
        self.freelist.iter().position(|f| f.count >= size)
    }

    /// Takes `size` bytes off the front of the free range at `index` and
    /// records them as allocated under `id`.
    pub fn consume(&mut self, index: usize, size: u32, id: AllocationId) -> Range {
        let free = &mut self.freelist[index];
        let taken = Range::new(free.start, size);

        if free.count == size {
            self.freelist.remove(index);
        } else {
            free.start += size;
            free.count -= size;
        }

        self.occulist.push((id, taken));
        taken
    }

    /// First-fit allocation. `None` means no free range is large enough and
    /// the arena has to grow.
    ///
    /// Zero-sized requests always succeed with an empty range at offset 0 and
    /// consume nothing.
    pub fn allocate(&mut self, size: u32, id: AllocationId) -> Option<Range> {
        if size == 0 {
            let empty = Range::new(0, 0);
            self.occulist.push((id, empty));
            return Some(empty);
        }

        let index = self.find_placement(size)?;
        Some(self.consume(index, size, id))
    }

    pub fn range_of(&self, id: AllocationId) -> Option<Range> {
        self.occulist
            .iter()
            .find(|(occupant, _)| *occupant == id)
            .map(|(_, range)| *range)
    }

    pub fn is_allocated(&self, id: AllocationId) -> bool {
        self.range_of(id).is_some()
    }

    /// Removes `id` from the allocated list and returns its span to the free
    /// list, merged with whatever free neighbours it touches. Returns the
    /// freed range, or `None` if `id` is not allocated here.
    pub fn release(&mut self, id: AllocationId) -> Option<Range> {
        let i = self.occulist.iter().position(|(occupant, _)| *occupant == id)?;
        let (_, space) = self.occulist.remove(i);

        self.coalesce(space);
        Some(space)
    }

    fn coalesce(&mut self, space: Range) {
        if space.is_empty() {
            return;
        }

        let i = self.freelist.partition_point(|f| f.start < space.start);

        debug_assert!(
            i == 0 || !self.freelist[i - 1].overlaps(&space),
            "freed {space:?} overlaps free {:?}",
            self.freelist[i - 1]
        );
        debug_assert!(
            i == self.freelist.len() || !self.freelist[i].overlaps(&space),
            "freed {space:?} overlaps free {:?}",
            self.freelist[i]
        );

        let merges_prev = i > 0 && self.freelist[i - 1].end() == space.start;
        let merges_next = i < self.freelist.len() && space.end() == self.freelist[i].start;

        match (merges_prev, merges_next) {
            // xxxxx------xxxxx --> ----------------
            (true, true) => {
                let next = self.freelist.remove(i);
                self.freelist[i - 1].count += space.count + next.count;
            }
            (true, false) => self.freelist[i - 1].count += space.count,
            (false, true) => {
                let next = &mut self.freelist[i];
                next.start = space.start;
                next.count += space.count;
            }
            (false, false) => self.freelist.insert(i, space),
        }
    }

    /// Resizes the arena to `new_capacity` and packs every live range
    /// contiguously from offset 0, highest old offset first.
    ///
    /// Returns the copies that move the live bytes from the old buffer into
    /// the new one. The free list collapses into the single tail range left
    /// after the packed region.
    pub fn compact(&mut self, new_capacity: u32) -> Vec<CopyRegion> {
        let mut order: Vec<usize> = (0..self.occulist.len()).collect();
        // stable, so ranges with equal starts keep insertion order
        order.sort_by(|&a, &b| self.occulist[b].1.start.cmp(&self.occulist[a].1.start));

        let mut copies = Vec::with_capacity(order.len());
        let mut offset = 0u32;
        for i in order {
            let range = &mut self.occulist[i].1;
            if !range.is_empty() {
                copies.push(CopyRegion {
                    src_offset: range.start,
                    dst_offset: offset,
                    size: range.count,
                });
            }
            range.start = offset;
            offset += range.count;
        }

        assert!(
            offset <= new_capacity,
            "{} arena cannot pack {offset} live bytes into {new_capacity}",
            self.kind
        );

        self.capacity = new_capacity;
        self.freelist.clear();
        if offset < new_capacity {
            self.freelist.push(Range::new(offset, new_capacity - offset));
        }

        copies
    }

    pub fn allocated_bytes(&self) -> u64 {
        self.occulist.iter().map(|(_, r)| r.count as u64).sum()
    }

    pub fn live_allocations(&self) -> usize {
        self.occulist.len()
    }

    pub fn percent_full(&self) -> f32 {
        if self.capacity == 0 {
            return 0.0;
        }
        self.allocated_bytes() as f32 / self.capacity as f32
    }

    pub fn snapshot(&self) -> ArenaSnapshot {
        ArenaSnapshot {
            kind: self.kind,
            capacity: self.capacity,
            free: self.freelist.clone(),
            allocated: self.occulist.iter().map(|(_, r)| *r).collect(),
        }
    }
}

/// A copy of an arena's bookkeeping at one point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArenaSnapshot {
    pub kind: BufferKind,
    pub capacity: u32,
    pub free: Vec<Range>,
    pub allocated: Vec<Range>,
}

impl ArenaSnapshot {
    /// True when the free and allocated ranges cover `[0, capacity)` exactly,
    /// with no gaps and no overlaps.
    pub fn is_partitioned(&self) -> bool {
        let mut spans: Vec<Range> = self
            .free
            .iter()
            .chain(self.allocated.iter())
            .filter(|r| !r.is_empty())
            .copied()
            .collect();
        spans.sort_by_key(|r| r.start);

        let mut cursor = 0u32;
        for span in spans {
            if span.start != cursor {
                return false;
            }
            cursor = span.end();
        }
        cursor == self.capacity
    }

    /// True when no free range is empty and no two free ranges touch.
    pub fn is_merge_closed(&self) -> bool {
        let mut free = self.free.clone();
        free.sort_by_key(|r| r.start);

        free.iter().all(|r| !r.is_empty()) && free.windows(2).all(|w| w[0].end() < w[1].start)
    }

    pub fn percent_full(&self) -> f32 {
        if self.capacity == 0 {
            return 0.0;
        }
        let used: u64 = self.allocated.iter().map(|r| r.count as u64).sum();
        used as f32 / self.capacity as f32
    }
}
