//! The seam between the engine and the host's knowledge of the source
//! address space.  The engine never reads source memory without first
//! consulting this trait.
use std::fmt::Debug;

/// Host-supplied memory-validity oracle.
///
/// `range_valid` is the load-bearing contract: when it returns true for
/// `[addr, addr + size)`, the engine will read those bytes directly.
pub trait Memory: Debug {
    /// True iff `[addr, addr + size)` is safely readable.
    fn range_valid(&self, addr: usize, size: usize) -> bool;

    /// True iff `addr` is safely readable.
    fn addr_valid(&self, addr: usize) -> bool {
        self.range_valid(addr, 1)
    }

    /// True iff `addr` points into executable memory.
    fn text_valid(&self, addr: usize) -> bool;

    /// Length of the NUL-terminated string at `addr`, including the
    /// terminator, bounded by readability: a string running off the end
    /// of readable memory yields the readable prefix length (no NUL),
    /// and an unreadable `addr` yields 0.
    fn string_len(&self, addr: usize) -> usize;

    /// Bounds `(start, end)` of the heap object containing `addr`, when
    /// the host can tell.  Used to size flexible trailing arrays.
    fn object_bounds(&self, _addr: usize) -> Option<(usize, usize)> {
        None
    }

    /// Symbolizes a code address.  Only consulted when function-pointer
    /// recipes were used; unresolvable addresses serialize as empty
    /// names and load as null.
    fn func_name(&self, _addr: usize) -> Option<String> {
        None
    }
}
