//! A `Memory` oracle for the current process, built by parsing
//! `/proc/self/maps`.  Regions are kept in an ordered map with adjacent
//! same-protection regions coalesced; a lookup miss triggers one
//! re-scan, since mappings appear while a dump is running (the engine
//! itself allocates).
use log::debug;

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::slice;

use crate::oracle::Memory;

const PROT_READ: u8 = 1 << 0;
const PROT_WRITE: u8 = 1 << 1;
const PROT_EXEC: u8 = 1 << 2;

/// Bytes probed by the string fast path before falling back to
/// geometrically growing scans.
const STRING_FAST_PROBE: usize = 1000;

#[derive(Clone, Copy, Debug)]
struct Region {
    /// One past the last address in the region.
    end: usize,
    prot: u8,
}

#[derive(Debug)]
pub struct ProcessMemory {
    /// start -> region; non-overlapping, coalesced.
    regions: RefCell<BTreeMap<usize, Region>>,
    /// Optional code-address symbolication table.
    symbols: Vec<(usize, String)>,
}

impl ProcessMemory {
    pub fn new() -> io::Result<ProcessMemory> {
        let mem = ProcessMemory {
            regions: RefCell::new(BTreeMap::new()),
            symbols: Vec::new(),
        };
        mem.rescan()?;
        Ok(mem)
    }

    /// Like `new`, with a table resolving code addresses to names for
    /// the function-pointer symbol section.
    pub fn with_symbols(symbols: Vec<(usize, String)>) -> io::Result<ProcessMemory> {
        let mut mem = ProcessMemory::new()?;
        mem.symbols = symbols;
        Ok(mem)
    }

    fn rescan(&self) -> io::Result<()> {
        let maps = fs::read_to_string("/proc/self/maps")?;
        let mut regions = self.regions.borrow_mut();
        regions.clear();

        let mut count = 0;
        for line in maps.lines() {
            if let Some((start, end, prot)) = parse_maps_line(line) {
                insert_coalesced(&mut regions, start, end, prot);
                count += 1;
            }
        }

        debug!("scanned {} mapped regions of the current process", count);
        if count == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "no parseable lines in /proc/self/maps",
            ));
        }
        Ok(())
    }

    /// Readable bytes available at `addr`, capped at `size`; 0 when the
    /// first byte is not readable.
    fn readable_len(&self, addr: usize, size: usize) -> usize {
        let regions = self.regions.borrow();
        match regions.range(..=addr).next_back() {
            Some((_, region)) if addr < region.end && region.prot & PROT_READ != 0 => {
                (region.end - addr).min(size)
            }
            _ => 0,
        }
    }

    fn readable_len_rescan(&self, addr: usize, size: usize) -> usize {
        let got = self.readable_len(addr, size);
        if got >= size {
            return got;
        }
        // New mappings may have appeared since the last scan.
        if self.rescan().is_err() {
            return got;
        }
        self.readable_len(addr, size)
    }
}

fn parse_maps_line(line: &str) -> Option<(usize, usize, u8)> {
    let mut parts = line.split_whitespace();
    let range = parts.next()?;
    let perms = parts.next()?;

    let dash = range.find('-')?;
    let start = usize::from_str_radix(&range[..dash], 16).ok()?;
    let end = usize::from_str_radix(&range[dash + 1..], 16).ok()?;

    let perms = perms.as_bytes();
    let mut prot = 0;
    if perms.get(0) == Some(&b'r') {
        prot |= PROT_READ;
    }
    if perms.get(1) == Some(&b'w') {
        prot |= PROT_WRITE;
    }
    if perms.get(2) == Some(&b'x') {
        prot |= PROT_EXEC;
    }

    Some((start, end, prot))
}

fn insert_coalesced(regions: &mut BTreeMap<usize, Region>, start: usize, mut end: usize, prot: u8) {
    // Swallow an adjacent successor of equal protection.
    if let Some(next) = regions.get(&end).copied() {
        if next.prot == prot {
            regions.remove(&end);
            end = next.end;
        }
    }

    // Extend an adjacent predecessor of equal protection.
    let prev = regions
        .range(..start)
        .next_back()
        .map(|(&s, r)| (s, *r));
    if let Some((prev_start, prev)) = prev {
        if prev.end == start && prev.prot == prot {
            regions.get_mut(&prev_start).expect("present").end = end;
            return;
        }
    }

    regions.insert(start, Region { end, prot });
}

impl Memory for ProcessMemory {
    fn range_valid(&self, addr: usize, size: usize) -> bool {
        if addr == 0 || size == 0 {
            return false;
        }
        let mut covered = 0;
        // A span may cross several coalesced regions with different
        // write/exec bits; walk until the request is satisfied.
        while covered < size {
            let got = self.readable_len_rescan(addr + covered, size - covered);
            if got == 0 {
                debug!(
                    "access violation at {:#x} ({} of {} bytes readable)",
                    addr, covered, size
                );
                return false;
            }
            covered += got;
        }
        true
    }

    fn text_valid(&self, addr: usize) -> bool {
        let check = |regions: &BTreeMap<usize, Region>| match regions.range(..=addr).next_back() {
            Some((_, region)) => addr < region.end && region.prot & PROT_EXEC != 0,
            None => false,
        };

        if check(&self.regions.borrow()) {
            return true;
        }
        if self.rescan().is_err() {
            return false;
        }
        check(&self.regions.borrow())
    }

    fn string_len(&self, addr: usize) -> usize {
        let avail = self.readable_len_rescan(addr, STRING_FAST_PROBE);
        if avail == 0 {
            return 0;
        }

        let head = unsafe { slice::from_raw_parts(addr as *const u8, avail) };
        if let Some(nul) = head.iter().position(|&b| b == 0) {
            return nul + 1;
        }
        if avail < STRING_FAST_PROBE {
            // Ran into unreadable memory before a terminator.
            return avail;
        }

        // Slow path: probe in growing windows past the first block.
        let mut off = avail;
        let mut window = 8 * 4096;
        while window < i32::MAX as usize {
            let got = self.readable_len_rescan(addr + off, window);
            if got == 0 {
                return off;
            }
            let part = unsafe { slice::from_raw_parts((addr + off) as *const u8, got) };
            if let Some(nul) = part.iter().position(|&b| b == 0) {
                return off + nul + 1;
            }
            if got < window {
                return off + got;
            }
            off += got;
            window *= 2;
        }
        off
    }

    fn func_name(&self, addr: usize) -> Option<String> {
        self.symbols
            .iter()
            .find(|(a, _)| *a == addr)
            .map(|(_, name)| name.clone())
    }
}
