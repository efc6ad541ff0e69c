//! The recipe surface: the verbs a flattening description may issue.
//! Recipes are plain functions over a `RecipeCtx`; everything here is a
//! thin facade over the engine, and every verb is a no-op once the
//! engine has latched an error.
//!
//! A recipe describes *what* to copy.  Fields not mentioned are carried
//! verbatim inside their record's snapshot; raw pointers among them stay
//! source addresses and dangle after loading, which is the recipe
//! author's responsibility.
//!
//! A record type may have several recipes (e.g. different treatments of
//! an opaque pointer field); specialization is just picking a different
//! `RecipeFn` at the call site, optionally steered by the `custom`
//! cookie of the `_with` verbs.
//!
//! ```no_run
//! use memoffset::offset_of;
//! use std::mem::size_of;
//! # use memimage::{RecipeCtx};
//!
//! #[repr(C)]
//! struct Node {
//!     value: u64,
//!     label: *const std::os::raw::c_char,
//!     next: *const Node,
//! }
//!
//! fn node_recipe(c: &mut RecipeCtx<'_>) {
//!     c.field_string(offset_of!(Node, label));
//!     c.field_struct(offset_of!(Node, next), size_of::<Node>(), 1, node_recipe);
//! }
//! ```
use crate::engine::Flattener;
use crate::ranges::FlatPtr;

/// A per-type flattening description, invoked once per record element.
pub type RecipeFn = fn(&mut RecipeCtx<'_>);

/// Extracts the real target from a stored pointer value (e.g. masks the
/// low bits of a tagged pointer).
pub type PreExtract = fn(usize) -> usize;

/// Re-applies bits of the original stored value onto the resolved
/// location before it is written into the image.
pub type PostConvert = fn(FlatPtr, usize) -> FlatPtr;

/// A deferred traversal unit.
#[derive(Clone, Copy)]
pub(crate) struct Job {
    /// Back-pointer fix-up site; `None` when the result is discarded.
    pub site: Option<FlatPtr>,
    pub el_size: usize,
    pub count: usize,
    /// User cookie, passed through to the recipe.
    pub custom: usize,
    /// Element index at the enqueue site.
    pub index: usize,
    /// Source address of the first element.
    pub target: usize,
    pub recipe: RecipeFn,
    pub convert: Option<PostConvert>,
    /// Original stored pointer value, for `convert`.
    pub orig_ptr: usize,
}

/// Context handed to root bodies and `foreach_pointer` iterations: the
/// ambient fix-up site plus the root-level verbs.
pub struct RootCtx<'f> {
    flat: &'f mut Flattener,
    site: Option<FlatPtr>,
}

impl<'f> RootCtx<'f> {
    pub(crate) fn new(flat: &'f mut Flattener, site: Option<FlatPtr>) -> RootCtx<'f> {
        RootCtx { flat, site }
    }

    /// Snapshot `size` raw bytes at `addr`.
    pub fn flatten_bytes(&mut self, addr: usize, size: usize) {
        self.flat.flatten_bytes(self.site, addr, size);
    }

    /// Flatten `count` records of `el_size` bytes at `addr` with
    /// `recipe`.
    pub fn flatten_struct(&mut self, addr: usize, el_size: usize, count: usize, recipe: RecipeFn) {
        self.flat
            .flatten_generic(self.site, addr, el_size, count, 0, 0, recipe, None, 0);
    }

    /// Like `flatten_struct` with a user cookie the recipe can read.
    pub fn flatten_struct_with(
        &mut self,
        addr: usize,
        el_size: usize,
        count: usize,
        custom: usize,
        recipe: RecipeFn,
    ) {
        self.flat
            .flatten_generic(self.site, addr, el_size, count, custom, 0, recipe, None, 0);
    }

    /// `addr` points inside a record whose first byte lies at
    /// `addr + shift` (`shift` is negative for interior pointers);
    /// flatten the whole enclosing record while the recorded pointer
    /// keeps aiming at `addr`.
    pub fn flatten_struct_shifted(
        &mut self,
        addr: usize,
        el_size: usize,
        count: usize,
        shift: isize,
        recipe: RecipeFn,
    ) {
        let target = (addr as isize + shift) as usize;
        self.flat
            .flatten_generic(self.site, target, el_size, count, 0, shift, recipe, None, 0);
    }

    /// Snapshot the NUL-terminated string at `addr`.
    pub fn flatten_string(&mut self, addr: usize) {
        self.flat.flatten_string(self.site, addr);
    }

    /// Record a function-pointer fix-up for the code address `addr`.
    pub fn flatten_fptr(&mut self, addr: usize) {
        self.flat.flatten_fptr(self.site, addr);
    }

    /// Iterate a plain array of `count` pointers at `array`; each
    /// iteration rebinds the ambient site to that slot, so nested verbs
    /// resolve to it.
    pub fn foreach_pointer<F>(&mut self, array: usize, count: usize, mut body: F)
    where
        F: FnMut(&mut RootCtx<'_>, usize, usize),
    {
        self.flat.foreach_pointer(array, count, &mut body);
    }
}

/// Context handed to a recipe for one record element.
pub struct RecipeCtx<'f> {
    flat: &'f mut Flattener,
    base: usize,
    size: usize,
    custom: usize,
    index: usize,
    alignment: usize,
}

impl<'f> RecipeCtx<'f> {
    pub(crate) fn new(
        flat: &'f mut Flattener,
        base: usize,
        size: usize,
        custom: usize,
        index: usize,
    ) -> RecipeCtx<'f> {
        RecipeCtx {
            flat,
            base,
            size,
            custom,
            index,
            alignment: 1,
        }
    }

    /// Source address of the record being flattened.
    pub fn base(&self) -> usize {
        self.base
    }

    /// Byte size of one element, as declared at the call site.
    pub fn size(&self) -> usize {
        self.size
    }

    /// The user cookie from the enqueueing verb.
    pub fn custom(&self) -> usize {
        self.custom
    }

    /// Element index at the enqueueing verb.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Require `alignment` for this record's snapshot in the image.
    pub fn align(&mut self, alignment: usize) {
        self.alignment = alignment;
    }

    pub(crate) fn set_alignment(&mut self, alignment: usize) {
        self.alignment = alignment;
    }

    pub(crate) fn alignment(&self) -> usize {
        self.alignment
    }

    /// Follow the record pointer at field `off` and flatten `count`
    /// records of `el_size` bytes behind it.
    pub fn field_struct(&mut self, off: usize, el_size: usize, count: usize, recipe: RecipeFn) {
        self.flat
            .aggregate_generic(self.base, off, el_size, count, 0, 0, recipe, None, None);
    }

    /// Like `field_struct` with a user cookie.
    pub fn field_struct_with(
        &mut self,
        off: usize,
        el_size: usize,
        count: usize,
        custom: usize,
        recipe: RecipeFn,
    ) {
        self.flat
            .aggregate_generic(self.base, off, el_size, count, custom, 0, recipe, None, None);
    }

    /// The pointer at `off` aims inside a record beginning `shift`
    /// bytes away (negative for interior pointers); flatten the
    /// enclosing record.
    pub fn field_struct_shifted(
        &mut self,
        off: usize,
        el_size: usize,
        count: usize,
        shift: isize,
        recipe: RecipeFn,
    ) {
        self.flat
            .aggregate_generic(self.base, off, el_size, count, 0, shift, recipe, None, None);
    }

    /// Tagged-pointer field: `pre` recovers the real target from the
    /// stored value, `post` re-stamps the surviving bits onto the
    /// resolved location.
    pub fn field_embedded(
        &mut self,
        off: usize,
        el_size: usize,
        count: usize,
        recipe: RecipeFn,
        pre: Option<PreExtract>,
        post: Option<PostConvert>,
    ) {
        self.flat
            .aggregate_generic(self.base, off, el_size, count, 0, 0, recipe, pre, post);
    }

    /// Follow the pointer at `off` to `len` plain bytes; no recursion.
    pub fn field_bytes(&mut self, off: usize, len: usize) {
        if !self.flat.ok() {
            return;
        }
        let held: usize = unsafe { std::ptr::read_unaligned((self.base + off) as *const usize) };
        if held == 0 || !self.flat.mem.range_valid(held, len) {
            return;
        }
        let site = self.flat.ranges.resolve(self.base + off);
        self.flat.flatten_bytes(site, held, len);
    }

    /// Snapshot the string behind the pointer at `off`.
    pub fn field_string(&mut self, off: usize) {
        if !self.flat.ok() {
            return;
        }
        let held: usize = unsafe { std::ptr::read_unaligned((self.base + off) as *const usize) };
        if held == 0 {
            return;
        }
        let site = self.flat.ranges.resolve(self.base + off);
        self.flat.flatten_string(site, held);
    }

    /// Record a function-pointer fix-up for the code pointer at `off`.
    pub fn field_fptr(&mut self, off: usize) {
        if !self.flat.ok() {
            return;
        }
        let held: usize = unsafe { std::ptr::read_unaligned((self.base + off) as *const usize) };
        if held == 0 {
            return;
        }
        let site = self.flat.ranges.resolve(self.base + off);
        self.flat.flatten_fptr(site, held);
    }

    /// Run `recipe` over an aggregate embedded by value at `off`.
    pub fn storage(&mut self, off: usize, el_size: usize, count: usize, recipe: RecipeFn) {
        self.flat
            .aggregate_storage(self.base, off, el_size, count, 0, recipe);
    }

    /// Flexible trailing array of records: element count is derived from
    /// the heap-object bounds oracle.  Skipped when the host cannot tell.
    pub fn storage_flexible(&mut self, off: usize, el_size: usize, recipe: RecipeFn) {
        if let Some(count) = self.flexible_count(off, el_size) {
            self.flat
                .aggregate_storage(self.base, off, el_size, count, 0, recipe);
        }
    }

    /// Flexible trailing array of plain bytes: snapshot without
    /// recursing.
    pub fn bytes_flexible(&mut self, off: usize, el_size: usize) {
        if let Some(count) = self.flexible_count(off, el_size) {
            let start = self.base + off;
            if self.flat.mem.range_valid(start, count * el_size) {
                self.flat.flatten_plain(start, count * el_size);
            }
        }
    }

    fn flexible_count(&mut self, off: usize, el_size: usize) -> Option<usize> {
        if !self.flat.ok() {
            return None;
        }
        let (_, end) = self.flat.mem.object_bounds(self.base)?;
        let start = self.base + off;
        if end <= start || el_size == 0 {
            return None;
        }
        let count = (end - start) / el_size;
        if count == 0 {
            None
        } else {
            Some(count)
        }
    }

    /// Iterate a plain pointer array embedded at `off`.
    pub fn foreach_pointer<F>(&mut self, off: usize, count: usize, mut body: F)
    where
        F: FnMut(&mut RootCtx<'_>, usize, usize),
    {
        let array = self.base + off;
        self.flat.foreach_pointer(array, count, &mut body);
    }
}

impl Flattener {
    /// Shared implementation of the `foreach_pointer` verbs: every slot
    /// gets its own captured 8-byte range as the ambient fix-up site.
    pub(crate) fn foreach_pointer(
        &mut self,
        array: usize,
        count: usize,
        body: &mut dyn FnMut(&mut RootCtx<'_>, usize, usize),
    ) {
        if !self.ok() || !self.mem.range_valid(array, count * 8) {
            return;
        }

        for i in 0..count {
            if !self.ok() {
                break;
            }
            let slot = array + i * 8;
            let site = match self.flatten_plain(slot, 8) {
                Some(fp) => Some(fp),
                None => break,
            };
            let value: usize = unsafe { std::ptr::read_unaligned(slot as *const usize) };
            let mut ctx = RootCtx::new(self, site);
            body(&mut ctx, value, i);
        }
    }
}
