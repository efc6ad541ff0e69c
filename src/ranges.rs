//! Source-address interval map.  Each range covers a half-open span of
//! the flattened process's address space and owns the chunk holding its
//! byte snapshot.  Ranges never overlap; `acquire` is the only routine
//! that creates them, synthesizing chunks for any uncovered gaps and
//! splicing those chunks next to their address-order neighbors so that
//! contiguous source memory stays contiguous in the payload.
#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use contracts::*;
#[cfg(not(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
)))]
use disabled_contracts::*;

use std::collections::BTreeMap;
use std::slice;

use crate::arena::Arena;
use crate::error::Result;
use crate::stream::ChunkId;
use crate::stream::Stream;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RangeId(u32);

/// A resolved location in flattened space: a range plus a byte offset
/// into it.  This is what fix-up targets are made of.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlatPtr {
    pub range: RangeId,
    pub offset: usize,
}

#[derive(Clone, Copy, Debug)]
pub struct Range {
    /// First source address in the interval.
    pub start: usize,
    /// Last source address _in_ the interval.
    pub last: usize,
    pub chunk: ChunkId,
}

impl Range {
    pub fn size(&self) -> usize {
        self.last - self.start + 1
    }
}

pub struct RangeMap {
    entries: Vec<Range>,
    by_start: BTreeMap<usize, RangeId>,
}

impl RangeMap {
    pub fn new() -> RangeMap {
        RangeMap {
            entries: Vec::new(),
            by_start: BTreeMap::new(),
        }
    }

    pub fn get(&self, id: RangeId) -> &Range {
        &self.entries[id.0 as usize]
    }

    /// The first range (in address order) intersecting `[lo, hi]`
    /// (inclusive bounds).
    pub fn find_first_overlap(&self, lo: usize, hi: usize) -> Option<RangeId> {
        if let Some((_, &id)) = self.by_start.range(..=lo).next_back() {
            if self.get(id).last >= lo {
                return Some(id);
            }
        }
        self.by_start
            .range(lo..=hi)
            .next()
            .map(|(_, &id)| id)
            .filter(|&id| self.get(id).start <= hi)
    }

    /// The next range after `id` still intersecting `[lo, hi]`.
    pub fn find_next_overlap(&self, id: RangeId, _lo: usize, hi: usize) -> Option<RangeId> {
        let start = self.get(id).start;
        if start >= hi {
            // No later range can begin within the query.
            return None;
        }
        self.by_start
            .range(start + 1..=hi)
            .next()
            .map(|(_, &id)| id)
    }

    /// The range covering a single address, if any.
    pub fn lookup(&self, addr: usize) -> Option<RangeId> {
        self.find_first_overlap(addr, addr)
    }

    /// Resolves `addr` to its range and intra-range offset.
    pub fn resolve(&self, addr: usize) -> Option<FlatPtr> {
        let id = self.lookup(addr)?;
        Some(FlatPtr {
            range: id,
            offset: addr - self.get(id).start,
        })
    }

    #[requires(self.find_first_overlap(start, last).is_none(),
               "ranges must never overlap")]
    pub fn insert(&mut self, start: usize, last: usize, chunk: ChunkId) -> RangeId {
        let id = RangeId(self.entries.len() as u32);
        self.entries.push(Range { start, last, chunk });
        self.by_start.insert(start, id);
        id
    }

    pub fn remove(&mut self, id: RangeId) {
        let start = self.get(id).start;
        self.by_start.remove(&start);
    }

    /// All ranges in address order.
    pub fn iter(&self) -> impl Iterator<Item = RangeId> + '_ {
        self.by_start.values().copied()
    }

    pub fn len(&self) -> usize {
        self.by_start.len()
    }

    /// Ensures `[addr, addr + size)` is fully covered by ranges,
    /// snapshotting any bytes not yet captured, and returns the range
    /// covering `addr`.
    ///
    /// # Safety
    ///
    /// The caller must have established (through the host oracle) that
    /// the whole span is readable; uncovered gaps are copied straight
    /// out of source memory.
    pub unsafe fn acquire(
        &mut self,
        arena: &mut Arena,
        stream: &mut Stream,
        addr: usize,
        size: usize,
    ) -> Result<RangeId> {
        debug_assert!(size > 0);
        let q_last = addr + size - 1;

        let overlaps: Vec<RangeId> = {
            let mut v = Vec::new();
            let mut cur = self.find_first_overlap(addr, q_last);
            while let Some(id) = cur {
                v.push(id);
                cur = self.find_next_overlap(id, addr, q_last);
            }
            v
        };

        if overlaps.is_empty() {
            let data = slice::from_raw_parts(addr as *const u8, size);
            let chunk = match self.by_start.range(addr..).next() {
                Some((_, &succ)) => {
                    let at = self.get(succ).chunk;
                    stream.insert_before(arena, at, data)?
                }
                None => match self.by_start.range(..addr).next_back() {
                    Some((_, &pred)) => {
                        let at = self.get(pred).chunk;
                        stream.insert_after(arena, at, data)?
                    }
                    None => stream.append(arena, data)?,
                },
            };
            return Ok(self.insert(addr, q_last, chunk));
        }

        let mut p = addr;
        for &id in &overlaps {
            let (r_start, r_last, r_chunk) = {
                let r = self.get(id);
                (r.start, r.last, r.chunk)
            };
            if r_start > p {
                let data = slice::from_raw_parts(p as *const u8, r_start - p);
                let chunk = stream.insert_before(arena, r_chunk, data)?;
                self.insert(p, r_start - 1, chunk);
            }
            p = r_last + 1;
        }

        if q_last >= p {
            let tail_chunk = self.get(*overlaps.last().expect("non-empty")).chunk;
            let data = slice::from_raw_parts(p as *const u8, q_last - p + 1);
            let chunk = stream.insert_after(arena, tail_chunk, data)?;
            self.insert(p, q_last, chunk);
        }

        Ok(self.lookup(addr).expect("query span was just covered"))
    }
}

#[cfg(test)]
mod test {
    use proptest::collection::vec;
    use proptest::prelude::*;

    use super::*;
    use crate::arena::ArenaMode;

    struct Fixture {
        arena: Arena,
        stream: Stream,
        map: RangeMap,
        // Source bytes the acquired addresses point into.
        buf: Vec<u8>,
    }

    impl Fixture {
        fn new(len: usize) -> Fixture {
            let buf: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            Fixture {
                arena: Arena::new(ArenaMode::Passthrough),
                stream: Stream::new(),
                map: RangeMap::new(),
                buf,
            }
        }

        fn base(&self) -> usize {
            self.buf.as_ptr() as usize
        }

        fn acquire(&mut self, off: usize, size: usize) -> RangeId {
            let addr = self.base() + off;
            unsafe {
                self.map
                    .acquire(&mut self.arena, &mut self.stream, addr, size)
                    .expect("acquire should succeed")
            }
        }

        // After layout, every acquired byte must appear in the payload at
        // `chunk offset + delta` with its source value.
        fn check_payload(&mut self) {
            self.stream
                .assign_offsets(&mut self.arena)
                .expect("layout");
            let mut payload = Vec::new();
            self.stream
                .write_all(&self.arena, &mut payload)
                .expect("write");

            for id in self.map.iter().collect::<Vec<_>>() {
                let r = *self.map.get(id);
                let off = self.stream.chunk(r.chunk).image_offset();
                let src = r.start - self.base();
                assert_eq!(
                    &payload[off..off + r.size()],
                    &self.buf[src..src + r.size()],
                    "range snapshot must match source"
                );
            }
        }
    }

    #[test]
    fn fresh_acquire() {
        let mut fx = Fixture::new(64);
        let id = fx.acquire(8, 16);
        let r = *fx.map.get(id);
        assert_eq!(r.start, fx.base() + 8);
        assert_eq!(r.size(), 16);
        fx.check_payload();
    }

    #[test]
    fn overlap_extends_tail() {
        // [a, a+32) then [a+16, a+48): one range per byte, 48 covered.
        let mut fx = Fixture::new(64);
        fx.acquire(0, 32);
        let id = fx.acquire(16, 48 - 16);

        // The returned range covers the query start.
        assert_eq!(fx.map.get(id).start, fx.base() + 16);

        let total: usize = {
            let ids: Vec<_> = fx.map.iter().collect();
            ids.iter().map(|&i| fx.map.get(i).size()).sum()
        };
        assert_eq!(total, 48);
        fx.check_payload();
    }

    #[test]
    fn gap_fill_between_ranges() {
        let mut fx = Fixture::new(64);
        fx.acquire(0, 8);
        fx.acquire(24, 8);
        fx.acquire(0, 32);

        let ids: Vec<_> = fx.map.iter().collect();
        let sizes: Vec<usize> = ids.iter().map(|&i| fx.map.get(i).size()).collect();
        assert_eq!(sizes.iter().sum::<usize>(), 32);

        // Contiguous source ranges must be laid out contiguously.
        fx.check_payload();
        let mut prev: Option<Range> = None;
        for id in fx.map.iter() {
            let r = *fx.map.get(id);
            if let Some(p) = prev {
                if p.last + 1 == r.start {
                    assert_eq!(
                        fx.stream.chunk(p.chunk).image_offset() + p.size(),
                        fx.stream.chunk(r.chunk).image_offset(),
                        "adjacent ranges must be adjacent in the payload"
                    );
                }
            }
            prev = Some(r);
        }
    }

    #[test]
    fn acquire_inside_existing_is_noop() {
        let mut fx = Fixture::new(64);
        fx.acquire(0, 32);
        let before = fx.map.len();
        let id = fx.acquire(8, 8);
        assert_eq!(fx.map.len(), before);
        assert_eq!(fx.map.get(id).start, fx.base());

        // Single-byte queries at the range boundaries.
        let id = fx.acquire(0, 1);
        assert_eq!(fx.map.get(id).start, fx.base());
        let id = fx.acquire(31, 1);
        assert_eq!(fx.map.get(id).start, fx.base());
        assert_eq!(fx.map.len(), before);
    }

    #[test]
    fn removed_range_is_invisible() {
        let mut fx = Fixture::new(64);
        let id = fx.acquire(0, 16);
        fx.map.remove(id);
        assert!(fx.map.lookup(fx.base()).is_none());
        assert_eq!(fx.map.len(), 0);

        // The span can be acquired again afterwards.
        fx.acquire(0, 16);
        assert_eq!(fx.map.len(), 1);
    }

    #[test]
    fn resolve_interior() {
        let mut fx = Fixture::new(64);
        fx.acquire(16, 16);
        let ptr = fx.map.resolve(fx.base() + 20).expect("covered");
        assert_eq!(ptr.offset, 4);
        assert!(fx.map.resolve(fx.base() + 40).is_none());
    }

    proptest! {
        // Random acquisition orders must always yield a disjoint cover
        // whose payload bytes match the source exactly.
        #[test]
        fn disjoint_cover(spans in vec((0usize..120, 1usize..40), 1..20)) {
            let mut fx = Fixture::new(160);
            for (off, len) in spans {
                fx.acquire(off, len);
            }

            let ids: Vec<_> = fx.map.iter().collect();
            for w in ids.windows(2) {
                let a = fx.map.get(w[0]);
                let b = fx.map.get(w[1]);
                prop_assert!(a.last < b.start, "ranges must stay disjoint and sorted");
            }

            fx.check_payload();
        }
    }
}
