//! The fix-up table: every pointer site discovered during traversal,
//! keyed by the absolute source address of the pointer location.  A site
//! either resolves to a location in flattened space (data pointer), to a
//! code address (function pointer), or is a bare reservation marking an
//! address whose traversal job is already queued.
use log::warn;

use std::collections::btree_map;
use std::collections::BTreeMap;

use crate::error::Error;
use crate::error::Result;
use crate::ranges::FlatPtr;
use crate::ranges::RangeMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FixTarget {
    /// Reserved, target not yet known.
    Unresolved,
    /// Points at flattened data.
    Data(FlatPtr),
    /// Points at code; resolved by name at load time.
    Func(usize),
}

/// What an insertion did.  `Retried` is only produced by the force
/// variants, when an existing resolution was overwritten.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FixOutcome {
    Inserted,
    AlreadyExists,
    Retried,
}

#[derive(Clone, Copy, Debug)]
pub struct FixEntry {
    /// Where the pointer lives.  `None` for bare reservations.
    pub site: Option<FlatPtr>,
    pub target: FixTarget,
}

pub struct FixupMap {
    entries: BTreeMap<usize, FixEntry>,
}

impl FixupMap {
    pub fn new() -> FixupMap {
        FixupMap {
            entries: BTreeMap::new(),
        }
    }

    pub fn search(&self, addr: usize) -> Option<&FixEntry> {
        self.entries.get(&addr)
    }

    /// Marks `addr` as pending so the walker queues at most one job for
    /// it.
    pub fn reserve(&mut self, addr: usize) -> Result<()> {
        match self.entries.entry(addr) {
            btree_map::Entry::Occupied(_) => Err(Error::AlreadyExists),
            btree_map::Entry::Vacant(slot) => {
                slot.insert(FixEntry {
                    site: None,
                    target: FixTarget::Unresolved,
                });
                Ok(())
            }
        }
    }

    pub fn insert(
        &mut self,
        ranges: &RangeMap,
        site: FlatPtr,
        target: FixTarget,
    ) -> Result<FixOutcome> {
        self.insert_impl(ranges, site, target, false)
    }

    pub fn insert_force(
        &mut self,
        ranges: &RangeMap,
        site: FlatPtr,
        target: FixTarget,
    ) -> Result<FixOutcome> {
        self.insert_impl(ranges, site, target, true)
    }

    pub fn insert_fptr(&mut self, ranges: &RangeMap, site: FlatPtr, fn_addr: usize) -> Result<FixOutcome> {
        self.insert_impl(ranges, site, FixTarget::Func(fn_addr), false)
    }

    pub fn insert_fptr_force(
        &mut self,
        ranges: &RangeMap,
        site: FlatPtr,
        fn_addr: usize,
    ) -> Result<FixOutcome> {
        self.insert_impl(ranges, site, FixTarget::Func(fn_addr), true)
    }

    fn insert_impl(
        &mut self,
        ranges: &RangeMap,
        site: FlatPtr,
        target: FixTarget,
        force: bool,
    ) -> Result<FixOutcome> {
        debug_assert!(!matches!(target, FixTarget::Unresolved));
        let range = ranges.get(site.range);
        // The site's first byte must lie inside its declared range (the
        // pointer may still straddle into the next chunk).
        if site.offset >= range.size() {
            return Err(Error::InvariantViolated {
                addr: range.start + site.offset,
            });
        }
        let addr = range.start + site.offset;

        match self.entries.get_mut(&addr) {
            None => {
                self.entries.insert(
                    addr,
                    FixEntry {
                        site: Some(site),
                        target,
                    },
                );
                Ok(FixOutcome::Inserted)
            }
            Some(existing) if existing.site.is_none() => {
                // Filling in a reservation.  The map is keyed by the
                // site's absolute address, so only a site at exactly the
                // reserved address can land here.
                existing.site = Some(site);
                existing.target = target;
                Ok(FixOutcome::Inserted)
            }
            Some(existing) => {
                if Self::same_target(ranges, existing.target, target) {
                    return Ok(FixOutcome::AlreadyExists);
                }
                if force {
                    warn!(
                        "overwriting fix-up target for site {:#x} ({:?} -> {:?})",
                        addr, existing.target, target
                    );
                    existing.target = target;
                    Ok(FixOutcome::Retried)
                } else {
                    warn!(
                        "conflicting fix-up targets for site {:#x} ({:?} vs {:?})",
                        addr, existing.target, target
                    );
                    Err(Error::FixupConflict { addr })
                }
            }
        }
    }

    /// Compares targets by where they point in source space, not by
    /// handle identity.
    fn same_target(ranges: &RangeMap, a: FixTarget, b: FixTarget) -> bool {
        match (a, b) {
            (FixTarget::Data(x), FixTarget::Data(y)) => {
                ranges.get(x.range).start + x.offset == ranges.get(y.range).start + y.offset
            }
            (FixTarget::Func(x), FixTarget::Func(y)) => x == y,
            (FixTarget::Unresolved, FixTarget::Unresolved) => true,
            _ => false,
        }
    }

    /// Entries in source-address order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &FixEntry)> {
        self.entries.iter().map(|(&k, v)| (k, v))
    }

    /// Resolved data-pointer sites, in address order.
    pub fn data_sites(&self) -> impl Iterator<Item = (FlatPtr, FlatPtr)> + '_ {
        self.entries.values().filter_map(|e| match (e.site, e.target) {
            (Some(site), FixTarget::Data(target)) => Some((site, target)),
            _ => None,
        })
    }

    /// Resolved function-pointer sites, in address order.
    pub fn func_sites(&self) -> impl Iterator<Item = (FlatPtr, usize)> + '_ {
        self.entries.values().filter_map(|e| match (e.site, e.target) {
            (Some(site), FixTarget::Func(addr)) => Some((site, addr)),
            _ => None,
        })
    }

    pub fn count_data(&self) -> usize {
        self.data_sites().count()
    }

    pub fn count_func(&self) -> usize {
        self.func_sites().count()
    }
}
