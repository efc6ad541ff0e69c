//! The image loader: validates a flattened image, materializes its
//! payload (continuous or chunked), rewrites stored offsets back into
//! pointers at the load address, and exposes the roots.
//!
//! Three open strategies, attempted in order when the caller allows a
//! continuous mapping:
//!
//! 1. exclusive-lock the file and, if no loader has rewritten it yet,
//!    map it shared, fix pointers in place, and persist the mapping base
//!    in the header so later loads can skip the fix-up pass entirely;
//! 2. shared-lock and map copy-on-write at the recorded base address;
//! 3. shared-lock, copy the whole image, and fix the copy.
//!
//! Chunked loads always use the copy strategy: per-fragment allocations
//! are not portable across processes.
use lazy_static::lazy_static;
use log::debug;
use log::info;
use log::warn;

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::ffi::c_void;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::ptr;
use std::ptr::NonNull;

use crate::error::Error;
use crate::error::Result;
use crate::image::ImageHeader;
use crate::image::HEADER_SIZE;

/// Maps a symbol name to a code address in the loading process.
pub type SymbolResolver = Box<dyn Fn(&str) -> Option<usize>>;

pub struct LoadOptions {
    pub resolver: Option<SymbolResolver>,
    /// Materialize the payload as one region.  When false, each
    /// fragment is allocated separately so host sanitizers can catch
    /// over-reads between objects.
    pub continuous: bool,
}

impl Default for LoadOptions {
    fn default() -> LoadOptions {
        LoadOptions {
            resolver: None,
            continuous: false,
        }
    }
}

lazy_static! {
    static ref PAGE_SIZE: usize =
        unsafe { libc::sysconf(libc::_SC_PAGESIZE) }.max(4096) as usize;
}

/// Returns the system page size.
#[inline]
fn page_size() -> usize {
    *PAGE_SIZE
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum OpenMode {
    /// Shared writable mapping; first fixer of the file.
    MmapWrite,
    /// Private mapping of an already-fixed image at its recorded base.
    MmapCow,
    /// Owned copy, fixed locally.
    Copy,
}

struct Mapping {
    base: *mut u8,
    len: usize,
}

struct Fragment {
    start: usize,
    buf: Box<[u8]>,
}

pub struct Loader {
    file: File,
    mode: OpenMode,
    header: ImageHeader,
    continuous: bool,
    mapping: Option<Mapping>,
    image_copy: Option<Vec<u8>>,
    /// File offset of the memory block (fix-up arrays + fragment index
    /// + payload).
    mem_off: usize,
    /// Fragments for chunked mode, plus a start-offset index.
    fragments: Vec<Fragment>,
    frag_index: BTreeMap<usize, usize>,
    /// Resolved root pointers, in image order; `None` for roots that
    /// captured nothing.
    roots: Vec<Option<usize>>,
    named: HashMap<String, (usize, usize)>,
    /// Site payload offset -> symbol name.
    fptr_names: HashMap<usize, String>,
    cursor: usize,
    unlocked: bool,
}

fn set_lock(file: &File, kind: libc::c_int, wait: bool) -> std::io::Result<()> {
    let mut lock: libc::flock = unsafe { std::mem::zeroed() };
    lock.l_type = kind as libc::c_short;
    lock.l_whence = libc::SEEK_SET as libc::c_short;

    let cmd = if wait { libc::F_SETLKW } else { libc::F_SETLK };
    let rv = unsafe { libc::fcntl(file.as_raw_fd(), cmd, &lock) };
    if rv < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn mmap_file(
    file: &File,
    len: usize,
    addr: usize,
    shared: bool,
    fixed_noreplace: bool,
) -> Option<Mapping> {
    let mut flags = if shared {
        libc::MAP_SHARED
    } else {
        libc::MAP_PRIVATE
    };
    if fixed_noreplace {
        flags |= libc::MAP_FIXED_NOREPLACE;
    }

    let base = unsafe {
        libc::mmap(
            addr as *mut c_void,
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            flags,
            file.as_raw_fd(),
            0,
        )
    };
    if base == libc::MAP_FAILED {
        debug!(
            "mmap of image failed (addr {:#x}): {}",
            addr,
            std::io::Error::last_os_error()
        );
        return None;
    }
    Some(Mapping {
        base: base as *mut u8,
        len,
    })
}

impl Loader {
    /// Opens `file` as a flattened image, fixes pointers, and resolves
    /// the roots.  The file stays locked (shared) for the loader's
    /// lifetime in the mapped modes.
    pub fn load(file: File, opts: LoadOptions) -> Result<Loader> {
        let file_size = file.metadata()?.len() as usize;
        if file_size < HEADER_SIZE {
            return Err(Error::TruncatedImage);
        }

        let (mode, mapping, image_copy) = Self::open(&file, file_size, opts.continuous)?;

        let mut loader = Loader {
            file,
            mode,
            header: ImageHeader::default(),
            continuous: opts.continuous,
            mapping,
            image_copy,
            mem_off: 0,
            fragments: Vec::new(),
            frag_index: BTreeMap::new(),
            roots: Vec::new(),
            named: HashMap::new(),
            fptr_names: HashMap::new(),
            cursor: 0,
            unlocked: false,
        };

        match loader.parse_and_fix(opts.resolver.as_deref()) {
            Ok(()) => Ok(loader),
            Err(e) => {
                // The process VM is left untouched on failure.
                loader.release();
                Err(e)
            }
        }
    }

    /// Picks the fastest usable open strategy.
    fn open(
        file: &File,
        file_size: usize,
        continuous: bool,
    ) -> Result<(OpenMode, Option<Mapping>, Option<Vec<u8>>)> {
        let mut header_buf = [0u8; HEADER_SIZE];

        // Strategy 1: exclusive lock, fix the file in place.  Only
        // worth it for continuous mappings.
        if continuous && set_lock(file, libc::F_WRLCK, false).is_ok() {
            file.read_exact_at(&mut header_buf, 0)?;
            let header = ImageHeader::from_bytes(&header_buf)?;
            if header.last_load_addr == 0 {
                if let Some(mapping) = mmap_file(file, file_size, 0, true, false) {
                    info!("opened image in write mode @ {:p}", mapping.base);
                    return Ok((OpenMode::MmapWrite, Some(mapping), None));
                }
            }
            // Fall through to a shared lock.
        }

        if set_lock(file, libc::F_RDLCK, true).is_err() {
            return Err(Error::FileLocked);
        }

        // Strategy 2: the image was fixed before; map it privately at
        // the same base and skip fixing entirely.
        if continuous {
            file.read_exact_at(&mut header_buf, 0)?;
            let header = ImageHeader::from_bytes(&header_buf)?;
            let base = header.last_load_addr;
            if base != 0 && base % page_size() == 0 {
                if let Some(mapping) = mmap_file(file, file_size, base, false, true) {
                    info!("opened image copy-on-write @ {:p}", mapping.base);
                    return Ok((OpenMode::MmapCow, Some(mapping), None));
                }
            }
        }

        // Strategy 3: plain copy.
        let mut image = vec![0u8; file_size];
        file.read_exact_at(&mut image, 0)?;
        info!("opened image in copy mode ({} bytes)", file_size);
        Ok((OpenMode::Copy, None, Some(image)))
    }

    fn image(&self) -> &[u8] {
        match (&self.image_copy, &self.mapping) {
            (Some(copy), _) => copy,
            (None, Some(mapping)) => unsafe {
                std::slice::from_raw_parts(mapping.base, mapping.len)
            },
            (None, None) => &[],
        }
    }

    /// Base of the memory block (fix-up arrays + fragment index +
    /// payload).
    fn block_base(&self) -> *const u8 {
        let base = match (&self.image_copy, &self.mapping) {
            (Some(copy), _) => copy.as_ptr(),
            (None, Some(mapping)) => mapping.base as *const u8,
            (None, None) => ptr::null(),
        };
        unsafe { base.add(self.mem_off) }
    }

    fn block_base_mut(&mut self) -> *mut u8 {
        let mem_off = self.mem_off;
        let base = match (&mut self.image_copy, &self.mapping) {
            (Some(copy), _) => copy.as_mut_ptr(),
            (None, Some(mapping)) => mapping.base,
            (None, None) => ptr::null_mut(),
        };
        unsafe { base.add(mem_off) }
    }

    fn payload_base(&self) -> *const u8 {
        unsafe { self.block_base().add(self.header.payload_offset_in_block()) }
    }

    fn payload_base_mut(&mut self) -> *mut u8 {
        let off = self.header.payload_offset_in_block();
        unsafe { self.block_base_mut().add(off) }
    }

    fn block_usize(&self, index: usize) -> usize {
        unsafe { ptr::read_unaligned((self.block_base() as *const usize).add(index)) }
    }

    fn parse_and_fix(&mut self, resolver: Option<&dyn Fn(&str) -> Option<usize>>) -> Result<()> {
        let image_len = self.image().len();
        self.header = ImageHeader::from_bytes(self.image())?;
        self.header.validate(image_len)?;
        let header = self.header;

        // Root offset table and named-root table follow the header.
        let mut at = HEADER_SIZE;
        let read_usize = |image: &[u8], at: usize| -> Result<usize> {
            let end = at.checked_add(8).ok_or(Error::Overflow)?;
            if end > image.len() {
                return Err(Error::TruncatedImage);
            }
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&image[at..end]);
            Ok(usize::from_ne_bytes(buf))
        };

        let mut root_offsets = Vec::with_capacity(header.root_addr_count);
        for _ in 0..header.root_addr_count {
            root_offsets.push(read_usize(self.image(), at)?);
            at += 8;
        }

        let mut named: Vec<(String, usize, usize)> = Vec::new();
        for _ in 0..header.root_addr_extended_count {
            let name_len = read_usize(self.image(), at)?;
            at += 8;
            let end = at.checked_add(name_len).ok_or(Error::Overflow)?;
            if end > self.image().len() {
                return Err(Error::TruncatedImage);
            }
            let raw = &self.image()[at..end];
            let name = String::from_utf8_lossy(raw)
                .trim_end_matches('\0')
                .to_owned();
            at = end;
            let index = read_usize(self.image(), at)?;
            at += 8;
            let size = read_usize(self.image(), at)?;
            at += 8;
            named.push((name, index, size));
        }

        self.mem_off = at;
        let block_len = header.mem_block_size()?;
        if self
            .mem_off
            .checked_add(block_len)
            .map_or(true, |end| end > image_len)
        {
            return Err(Error::TruncatedImage);
        }

        // Function-pointer symbol table sits after the memory block.
        if resolver.is_some() && header.fptr_count > 0 && header.fptrmapsz >= 8 {
            let mut at = self.mem_off + block_len;
            let table_end = at + header.fptrmapsz.min(image_len - at);
            let count = read_usize(self.image(), at)?;
            at += 8;
            for _ in 0..count {
                let offset = read_usize(self.image(), at)?;
                at += 8;
                let len = read_usize(self.image(), at)?;
                at += 8;
                let end = at.checked_add(len).ok_or(Error::Overflow)?;
                if end > table_end {
                    return Err(Error::TruncatedImage);
                }
                let name = String::from_utf8_lossy(&self.image()[at..end]).into_owned();
                at = end;
                self.fptr_names.insert(offset, name);
            }
        }

        // A fragment-less image loads continuously no matter what was
        // asked for.
        if header.mcount == 0 {
            self.continuous = true;
        }

        if !self.continuous {
            self.build_fragments()?;
        }

        self.fix_data_pointers()?;
        self.persist_if_writer()?;
        if let Some(resolver) = resolver {
            self.fix_function_pointers(resolver)?;
        }
        self.resolve_roots(&root_offsets, &named)?;

        // A local copy no longer needs the file lock.
        if self.mode == OpenMode::Copy {
            let _ = set_lock(&self.file, libc::F_UNLCK, false);
            self.unlocked = true;
        }

        info!(
            "image loaded: {} payload bytes, {} pointers fixed, {} roots, {}",
            header.memory_size,
            header.ptr_count,
            header.root_addr_count,
            if self.continuous {
                "continuous"
            } else {
                "chunked"
            }
        );
        Ok(())
    }

    fn build_fragments(&mut self) -> Result<()> {
        let header = self.header;
        let frag_table = header.ptr_count + header.fptr_count;
        let payload = self.payload_base();

        for i in 0..header.mcount {
            let start = self.block_usize(frag_table + 2 * i);
            let size = self.block_usize(frag_table + 2 * i + 1);
            let end = start.checked_add(size).ok_or(Error::Overflow)?;
            if end > header.memory_size {
                return Err(Error::MemoryFragmentDoesNotFit);
            }

            let mut buf = vec![0u8; size].into_boxed_slice();
            unsafe {
                ptr::copy_nonoverlapping(payload.add(start), buf.as_mut_ptr(), size);
            }
            self.frag_index.insert(start, self.fragments.len());
            self.fragments.push(Fragment { start, buf });
        }
        Ok(())
    }

    /// Fragment containing `offset`, as (fragment index, intra-fragment
    /// offset).
    fn fragment_at(&self, offset: usize) -> Option<(usize, usize)> {
        let (_, &idx) = self.frag_index.range(..=offset).next_back()?;
        let frag = &self.fragments[idx];
        if offset < frag.start + frag.buf.len() {
            Some((idx, offset - frag.start))
        } else {
            None
        }
    }

    /// Live address of a payload offset.
    fn payload_addr(&self, offset: usize) -> Option<usize> {
        if self.continuous {
            Some(self.payload_base() as usize + offset)
        } else {
            self.fragment_at(offset)
                .map(|(idx, delta)| self.fragments[idx].buf.as_ptr() as usize + delta)
        }
    }

    /// Like `payload_addr`, but derived mutably so the caller may write
    /// through it.
    fn payload_addr_mut(&mut self, offset: usize) -> Option<usize> {
        if self.continuous {
            Some(self.payload_base_mut() as usize + offset)
        } else {
            let (idx, delta) = self.fragment_at(offset)?;
            Some(self.fragments[idx].buf.as_mut_ptr() as usize + delta)
        }
    }

    /// The fix-up pass: each recorded site holds an offset relative to
    /// `last_mem_addr`; rebase it onto the loaded memory.
    fn fix_data_pointers(&mut self) -> Result<()> {
        if self.mode == OpenMode::MmapCow {
            // Already fixed, loaded at the same address as before.
            return Ok(());
        }
        let header = self.header;

        for i in 0..header.ptr_count {
            let fix_loc = self.block_usize(i);
            let end = fix_loc.checked_add(8).ok_or(Error::Overflow)?;
            if end > header.memory_size {
                return Err(Error::InvalidFixLocation(fix_loc));
            }

            let stored: usize =
                unsafe { ptr::read_unaligned(self.payload_base().add(fix_loc) as *const usize) };
            if stored < header.last_mem_addr {
                return Err(Error::InvalidFixDestination(stored));
            }
            let target_off = stored - header.last_mem_addr;
            if target_off > header.memory_size {
                return Err(Error::InvalidFixDestination(target_off));
            }

            if !self.continuous {
                // The whole pointer must land inside one fragment.
                let (idx, delta) = self
                    .fragment_at(fix_loc)
                    .ok_or(Error::InvalidFixLocation(fix_loc))?;
                if delta + 8 > self.fragments[idx].buf.len() {
                    return Err(Error::InvalidFixLocation(fix_loc));
                }
            }

            let target = self
                .payload_addr(target_off)
                .ok_or(Error::InvalidFixDestination(target_off))?;
            let site = self
                .payload_addr_mut(fix_loc)
                .ok_or(Error::InvalidFixLocation(fix_loc))?;
            unsafe { ptr::write_unaligned(site as *mut usize, target) };
        }

        // Pointers in the payload are now live addresses relative to
        // this base; remember it for `replace_variable`.
        if self.continuous {
            self.header.last_mem_addr = self.payload_base() as usize;
        }
        Ok(())
    }

    /// First fixer of the file: publish the mapping base so later loads
    /// can map copy-on-write, then demote to a shared lock and keep a
    /// private view.
    fn persist_if_writer(&mut self) -> Result<()> {
        if self.mode != OpenMode::MmapWrite {
            return Ok(());
        }

        let mapping = self.mapping.as_ref().expect("write mode is mapped");
        let base = mapping.base as usize;
        let len = mapping.len;
        let mut on_disk = self.header;
        on_disk.last_load_addr = base;
        on_disk.last_mem_addr = self.payload_base() as usize;
        unsafe {
            ptr::copy_nonoverlapping(on_disk.to_bytes().as_ptr(), mapping.base, HEADER_SIZE);
            libc::msync(mapping.base as *mut c_void, len, libc::MS_SYNC);
        }
        let _ = set_lock(&self.file, libc::F_RDLCK, false);

        unsafe {
            libc::munmap(mapping.base as *mut c_void, len);
        }
        self.mapping = None;

        // Reacquire a private view at the same base; the image there is
        // already fixed.
        match mmap_file(&self.file, len, base, false, true) {
            Some(mapping) => {
                self.mapping = Some(mapping);
                self.mode = OpenMode::MmapCow;
                self.header.last_mem_addr = self.payload_base() as usize;
            }
            None => {
                // Lost the address while remapping; fall back to a local
                // copy and rebase its pointers off the on-disk values.
                let mut image = vec![0u8; len];
                self.file.read_exact_at(&mut image, 0)?;
                self.image_copy = Some(image);
                self.mode = OpenMode::Copy;
                self.header.last_mem_addr = on_disk.last_mem_addr;
                self.fix_data_pointers()?;
            }
        }
        Ok(())
    }

    fn fix_function_pointers(&mut self, resolver: &dyn Fn(&str) -> Option<usize>) -> Result<()> {
        let header = self.header;
        for i in 0..header.fptr_count {
            let fix_loc = self.block_usize(header.ptr_count + i);
            let name = match self.fptr_names.get(&fix_loc) {
                Some(name) => name.clone(),
                None => continue,
            };
            // Unresolvable names load as null.
            let value = resolver(&name).unwrap_or(0);
            let site = self
                .payload_addr_mut(fix_loc)
                .ok_or(Error::InvalidFixLocation(fix_loc))?;
            unsafe { ptr::write_unaligned(site as *mut usize, value) };
        }
        Ok(())
    }

    fn resolve_roots(
        &mut self,
        offsets: &[usize],
        named: &[(String, usize, usize)],
    ) -> Result<()> {
        for &offset in offsets {
            if offset == usize::MAX {
                self.roots.push(None);
                continue;
            }
            let addr = self
                .payload_addr(offset)
                .ok_or(Error::InvalidFixDestination(offset))?;
            self.roots.push(Some(addr));
        }

        for (name, index, size) in named {
            if let Some(Some(addr)) = self.roots.get(*index) {
                self.named.insert(name.clone(), (*addr, *size));
            }
        }
        Ok(())
    }

    /// Stateful root cursor, in image order.
    pub fn root_next(&mut self) -> Option<NonNull<c_void>> {
        while self.cursor < self.roots.len() {
            let root = self.roots[self.cursor];
            self.cursor += 1;
            if let Some(addr) = root {
                return NonNull::new(addr as *mut c_void);
            }
        }
        None
    }

    pub fn root_by_index(&self, index: usize) -> Option<NonNull<c_void>> {
        self.roots
            .get(index)
            .copied()
            .flatten()
            .and_then(|addr| NonNull::new(addr as *mut c_void))
    }

    pub fn root_by_name(&self, name: &str) -> Option<(NonNull<c_void>, usize)> {
        let &(addr, size) = self.named.get(name)?;
        NonNull::new(addr as *mut c_void).map(|p| (p, size))
    }

    pub fn header(&self) -> &ImageHeader {
        &self.header
    }

    /// Rewrites every data pointer whose target falls inside
    /// `[old, old + size)` to the corresponding offset from `new`, and
    /// updates root pointers in that window.  Returns how many pointers
    /// changed.
    pub fn replace_variable(&mut self, old: usize, new: usize, size: usize) -> Result<usize> {
        if self.mode == OpenMode::MmapWrite {
            return Err(Error::UnexpectedOpenMode);
        }
        if old == 0 || new == 0 || size < 8 {
            warn!(
                "replace_variable called with a degenerate window ({:#x}, {:#x}, {})",
                old, new, size
            );
            return Ok(0);
        }

        let header = self.header;
        let mut fixed = 0;

        for i in 0..header.ptr_count {
            let fix_loc = self.block_usize(i);

            if self.continuous {
                let stored: usize = unsafe {
                    ptr::read_unaligned(self.payload_base().add(fix_loc) as *const usize)
                };
                let target = stored
                    .wrapping_sub(header.last_mem_addr)
                    .wrapping_add(self.payload_base() as usize);
                if target >= old && target <= old + size - 8 {
                    let value = new + (target - old);
                    let site = unsafe { self.payload_base_mut().add(fix_loc) };
                    unsafe { ptr::write_unaligned(site as *mut usize, value) };
                    fixed += 1;
                }
            } else {
                // Fragment sites already hold live pointers after the
                // fix-up pass; reading them (rather than the raw offsets
                // in the pristine copy) keeps a second replace aware of
                // the first.
                let site = self
                    .payload_addr_mut(fix_loc)
                    .ok_or(Error::InvalidFixLocation(fix_loc))?;
                let target: usize = unsafe { ptr::read_unaligned(site as *const usize) };

                if target >= old && target <= old + size - 8 {
                    let value = new + (target - old);
                    unsafe { ptr::write_unaligned(site as *mut usize, value) };
                    fixed += 1;
                }
            }
        }

        for root in self.roots.iter_mut() {
            if let Some(addr) = *root {
                if addr >= old && addr < old + size {
                    *root = Some(new + (addr - old));
                    fixed += 1;
                }
            }
        }
        for (_, entry) in self.named.iter_mut() {
            if entry.0 >= old && entry.0 < old + size {
                entry.0 = new + (entry.0 - old);
                fixed += 1;
            }
        }

        Ok(fixed)
    }

    /// Releases mappings, locks, and owned memory.  Dropping the loader
    /// does the same; this form just makes the point explicit.
    pub fn unload(self) {}

    fn release(&mut self) {
        if let Some(mapping) = self.mapping.take() {
            unsafe { libc::munmap(mapping.base as *mut c_void, mapping.len) };
        }
        if !self.unlocked {
            let _ = set_lock(&self.file, libc::F_UNLCK, false);
            self.unlocked = true;
        }
        self.fragments.clear();
        self.frag_index.clear();
        self.image_copy = None;
        self.roots.clear();
        self.named.clear();
    }
}

impl Drop for Loader {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod test {
    use memoffset::offset_of;

    use std::ffi::CStr;
    use std::fs::OpenOptions;
    use std::mem::size_of;
    use std::os::raw::c_char;
    use std::ptr;

    use super::*;
    use crate::arena::ArenaMode;
    use crate::engine::FlattenOptions;
    use crate::engine::Flattener;
    use crate::process::ProcessMemory;
    use crate::ranges::FlatPtr;
    use crate::recipe::RecipeCtx;

    fn flattener() -> Flattener {
        let mem = ProcessMemory::new().expect("maps should parse");
        Flattener::new(
            Box::new(mem),
            FlattenOptions {
                arena: ArenaMode::Passthrough,
                ..Default::default()
            },
        )
    }

    fn dump(flat: &mut Flattener) -> tempfile::NamedTempFile {
        let mut tmp = tempfile::NamedTempFile::new().expect("temp file");
        flat.write(tmp.as_file_mut()).expect("write image");
        tmp
    }

    fn reopen(tmp: &tempfile::NamedTempFile) -> File {
        OpenOptions::new()
            .read(true)
            .write(true)
            .open(tmp.path())
            .expect("reopen image")
    }

    fn load(tmp: &tempfile::NamedTempFile, continuous: bool) -> Loader {
        Loader::load(
            reopen(tmp),
            LoadOptions {
                resolver: None,
                continuous,
            },
        )
        .expect("load image")
    }

    // --- SIMPLE -------------------------------------------------------

    #[repr(C)]
    struct Inner {
        t: *const c_char,
    }
    #[repr(C)]
    struct Outer {
        x: u64,
        pb: *const Inner,
    }

    fn inner_recipe(c: &mut RecipeCtx<'_>) {
        c.field_string(offset_of!(Inner, t));
    }
    fn outer_recipe(c: &mut RecipeCtx<'_>) {
        c.field_struct(offset_of!(Outer, pb), size_of::<Inner>(), 1, inner_recipe);
    }

    #[test]
    fn simple_round_trip() {
        for &continuous in &[false, true] {
            let text = b"ABC\0";
            let inner = Inner {
                t: text.as_ptr() as *const c_char,
            };
            let outer = Outer {
                x: 0x0000_404F,
                pb: &inner,
            };
            let addr = &outer as *const Outer as usize;

            let mut flat = flattener();
            flat.for_root(addr, |r| {
                r.flatten_struct(addr, size_of::<Outer>(), 1, outer_recipe)
            })
            .expect("flatten");
            let tmp = dump(&mut flat);

            let loader = load(&tmp, continuous);
            let root = loader.root_by_index(0).expect("root captured");
            let out = unsafe { &*(root.as_ptr() as *const Outer) };
            assert_eq!(out.x, 0x0000_404F);
            let s = unsafe { CStr::from_ptr((*out.pb).t) };
            assert_eq!(s.to_bytes(), b"ABC");
        }
    }

    #[test]
    fn empty_string_round_trips_as_one_nul() {
        // One heap block: the record sits directly below its string, so
        // the payload layout is deterministic.
        #[repr(C)]
        struct Fx {
            inner: Inner,
            text: [u8; 1],
        }
        let mut fx = Box::new(Fx {
            inner: Inner { t: ptr::null() },
            text: [0],
        });
        let text_ptr: *const c_char = fx.text.as_ptr() as *const c_char;
        fx.inner.t = text_ptr;
        let addr = &fx.inner as *const Inner as usize;

        let mut flat = flattener();
        flat.for_root(addr, |r| {
            r.flatten_struct(addr, size_of::<Inner>(), 1, inner_recipe)
        })
        .expect("flatten");
        let tmp = dump(&mut flat);

        let loader = load(&tmp, false);
        assert_eq!(loader.header().memory_size, size_of::<Inner>() + 1);
        let root = loader.root_by_index(0).expect("root");
        let s = unsafe { CStr::from_ptr((*(root.as_ptr() as *const Inner)).t) };
        assert_eq!(s.to_bytes(), b"");
    }

    // --- OVERLAP_LIST (cyclic, interior pointers) ---------------------

    #[repr(C)]
    struct ListHead {
        next: *const ListHead,
        prev: *const ListHead,
    }
    #[repr(C)]
    struct Im {
        plh: *const ListHead,
    }
    #[repr(C)]
    struct Task {
        pid: u64,
        im: *const Im,
        u: ListHead,
        w: f64,
    }

    fn head_recipe(c: &mut RecipeCtx<'_>) {
        c.field_struct(offset_of!(ListHead, next), size_of::<ListHead>(), 1, head_recipe);
        c.field_struct(offset_of!(ListHead, prev), size_of::<ListHead>(), 1, head_recipe);
    }
    fn im_recipe(c: &mut RecipeCtx<'_>) {
        c.field_struct(offset_of!(Im, plh), size_of::<ListHead>(), 1, head_recipe);
    }
    fn task_recipe(c: &mut RecipeCtx<'_>) {
        c.field_struct(offset_of!(Task, im), size_of::<Im>(), 1, im_recipe);
        c.storage(offset_of!(Task, u), size_of::<ListHead>(), 1, head_recipe);
    }

    #[test]
    fn cyclic_interior_pointers_round_trip() {
        for &continuous in &[false, true] {
            let mut task = Box::new(Task {
                pid: 123,
                im: ptr::null(),
                u: ListHead {
                    next: ptr::null(),
                    prev: ptr::null(),
                },
                w: 1.0,
            });
            let u_addr = &task.u as *const ListHead;
            task.u.next = u_addr;
            task.u.prev = u_addr;
            let im = Im { plh: u_addr };
            task.im = &im;
            let addr = &*task as *const Task as usize;

            let mut flat = flattener();
            flat.for_root(addr, |r| {
                r.flatten_struct(addr, size_of::<Task>(), 1, task_recipe)
            })
            .expect("cyclic flatten must terminate");
            let tmp = dump(&mut flat);

            let loader = load(&tmp, continuous);
            let root = loader.root_by_index(0).expect("root");
            let t = unsafe { &*(root.as_ptr() as *const Task) };

            assert_eq!(t.pid, 123);
            assert_eq!(t.w, 1.0);
            let u = &t.u as *const ListHead;
            assert_eq!(t.u.next, u);
            assert_eq!(t.u.prev, u);
            assert_eq!(unsafe { (*t.im).plh }, u);
        }
    }

    // --- Tagged-parent intset (color bits through embedded pointers) --

    #[repr(C)]
    struct TNode {
        parent_color: usize,
        left: *const TNode,
        right: *const TNode,
        value: u64,
    }

    fn untag(v: usize) -> usize {
        v & !3
    }
    fn retag(fp: FlatPtr, orig: usize) -> FlatPtr {
        FlatPtr {
            range: fp.range,
            offset: fp.offset | (orig & 3),
        }
    }

    fn tnode_recipe(c: &mut RecipeCtx<'_>) {
        c.field_embedded(
            offset_of!(TNode, parent_color),
            size_of::<TNode>(),
            1,
            tnode_recipe,
            Some(untag),
            Some(retag),
        );
        c.field_struct(offset_of!(TNode, left), size_of::<TNode>(), 1, tnode_recipe);
        c.field_struct(offset_of!(TNode, right), size_of::<TNode>(), 1, tnode_recipe);
    }

    unsafe fn bst_insert(root: *mut TNode, node: *mut TNode) {
        let mut cur = root;
        loop {
            let slot = if (*node).value < (*cur).value {
                &mut (*cur).left
            } else {
                &mut (*cur).right
            };
            if slot.is_null() {
                *slot = node;
                let color = ((*node).value % 2) as usize;
                (*node).parent_color = cur as usize | color;
                return;
            }
            cur = *slot as *mut TNode;
        }
    }

    fn in_order(node: *const TNode, out: &mut Vec<u64>) {
        if node.is_null() {
            return;
        }
        unsafe {
            in_order((*node).left, out);
            out.push((*node).value);
            in_order((*node).right, out);
        }
    }

    #[test]
    fn tagged_intset_round_trip() {
        let order = [3u64, 7, 1, 9, 4, 0, 8, 2, 6, 5];
        let mut nodes: Vec<Box<TNode>> = order
            .iter()
            .map(|&value| {
                Box::new(TNode {
                    parent_color: 0,
                    left: ptr::null(),
                    right: ptr::null(),
                    value,
                })
            })
            .collect();

        let root: *mut TNode = &mut *nodes[0];
        for i in 1..nodes.len() {
            let node: *mut TNode = &mut *nodes[i];
            unsafe { bst_insert(root, node) };
        }

        let mut flat = flattener();
        flat.for_root(root as usize, |r| {
            r.flatten_struct(root as usize, size_of::<TNode>(), 1, tnode_recipe)
        })
        .expect("flatten");
        let tmp = dump(&mut flat);

        for &continuous in &[false, true] {
            let loader = load(&tmp, continuous);
            let loaded = loader.root_by_index(0).expect("root").as_ptr() as *const TNode;

            let mut values = Vec::new();
            in_order(loaded, &mut values);
            assert_eq!(values, (0..10).collect::<Vec<u64>>());

            // Walk again checking the tagged parent links.
            fn check(node: *const TNode, count: &mut usize) {
                if node.is_null() {
                    return;
                }
                unsafe {
                    *count += 1;
                    let pc = (*node).parent_color;
                    if pc != 0 {
                        assert_eq!(pc & 3, ((*node).value % 2) as usize, "color bits survive");
                        let parent = (pc & !3) as *const TNode;
                        assert!(
                            (*parent).left == node || (*parent).right == node,
                            "parent link must point back at the child"
                        );
                    }
                    check((*node).left, count);
                    check((*node).right, count);
                }
            }
            let mut count = 0;
            check(loaded, &mut count);
            assert_eq!(count, 10);
        }
    }

    // --- STRINGSET ----------------------------------------------------

    #[repr(C)]
    struct SNode {
        next: *const SNode,
        s: *const c_char,
    }

    fn snode_recipe(c: &mut RecipeCtx<'_>) {
        c.field_struct(offset_of!(SNode, next), size_of::<SNode>(), 1, snode_recipe);
        c.field_string(offset_of!(SNode, s));
    }

    /// Sorted-insert with byte-equal dedup; returns false on duplicate.
    unsafe fn set_insert(head: &mut *const SNode, node: *mut SNode) -> bool {
        let key = CStr::from_ptr((*node).s);
        let mut slot: *mut *const SNode = head;
        while !(*slot).is_null() {
            let cur = CStr::from_ptr((**slot).s);
            if cur == key {
                return false;
            }
            if cur > key {
                break;
            }
            slot = &mut (*(*slot as *mut SNode)).next;
        }
        (*node).next = *slot;
        *slot = node;
        true
    }

    #[test]
    fn stringset_round_trip() {
        let strings: Vec<std::ffi::CString> = (0..50)
            .map(|i| {
                let len = 3 + i % 5;
                let bytes: Vec<u8> = (0..len).map(|j| ((i + j + 1) % 250 + 1) as u8).collect();
                std::ffi::CString::new(bytes).expect("no interior NUL")
            })
            .collect();

        let mut nodes: Vec<Box<SNode>> = strings
            .iter()
            .map(|s| {
                Box::new(SNode {
                    next: ptr::null(),
                    s: s.as_ptr(),
                })
            })
            .collect();
        let mut dups: Vec<Box<SNode>> = strings
            .iter()
            .map(|s| {
                Box::new(SNode {
                    next: ptr::null(),
                    s: s.as_ptr(),
                })
            })
            .collect();

        let mut head: *const SNode = ptr::null();
        for node in nodes.iter_mut() {
            assert!(unsafe { set_insert(&mut head, &mut **node) });
        }
        // Byte-equal duplicates leave the set unchanged.
        for dup in dups.iter_mut() {
            assert!(!unsafe { set_insert(&mut head, &mut **dup) });
        }

        let live_count = {
            let mut n = 0;
            let mut cur = head;
            while !cur.is_null() {
                n += 1;
                cur = unsafe { (*cur).next };
            }
            n
        };
        assert_eq!(live_count, 50);

        let mut flat = flattener();
        flat.for_root(head as usize, |r| {
            r.flatten_struct(head as usize, size_of::<SNode>(), 1, snode_recipe)
        })
        .expect("flatten");
        let tmp = dump(&mut flat);

        let loader = load(&tmp, false);
        let mut cur = loader.root_by_index(0).expect("root").as_ptr() as *const SNode;

        let mut loaded: Vec<Vec<u8>> = Vec::new();
        while !cur.is_null() {
            let s = unsafe { CStr::from_ptr((*cur).s) };
            loaded.push(s.to_bytes().to_vec());
            cur = unsafe { (*cur).next };
        }

        assert_eq!(loaded.len(), 50);
        let mut expected: Vec<Vec<u8>> =
            strings.iter().map(|s| s.as_bytes().to_vec()).collect();
        expected.sort();
        assert_eq!(loaded, expected);
    }

    // --- FPOINTERS ----------------------------------------------------

    #[repr(C)]
    struct Ops {
        alloc: usize,
        set_reserve: usize,
        write: usize,
        bq_clear: usize,
        puts: usize,
    }

    fn op_alloc() {}
    fn op_set_reserve() {}
    fn op_write() {}
    fn op_bq_clear() {}
    fn op_puts() {}

    fn ops_recipe(c: &mut RecipeCtx<'_>) {
        c.field_fptr(offset_of!(Ops, alloc));
        c.field_fptr(offset_of!(Ops, set_reserve));
        c.field_fptr(offset_of!(Ops, write));
        c.field_fptr(offset_of!(Ops, bq_clear));
        c.field_fptr(offset_of!(Ops, puts));
    }

    #[test]
    fn function_pointers_resolve_to_sentinels() {
        let table = [
            (op_alloc as fn() as usize, "op_alloc", 0x5100_0010usize),
            (op_set_reserve as fn() as usize, "op_set_reserve", 0x5100_0020),
            (op_write as fn() as usize, "op_write", 0x5100_0030),
            (op_bq_clear as fn() as usize, "op_bq_clear", 0x5100_0040),
            (op_puts as fn() as usize, "op_puts", 0x5100_0050),
        ];

        let ops = Ops {
            alloc: table[0].0,
            set_reserve: table[1].0,
            write: table[2].0,
            bq_clear: table[3].0,
            puts: table[4].0,
        };
        let addr = &ops as *const Ops as usize;

        let symbols: Vec<(usize, String)> =
            table.iter().map(|&(a, n, _)| (a, n.to_owned())).collect();
        let mem = ProcessMemory::with_symbols(symbols).expect("maps should parse");
        let mut flat = Flattener::new(
            Box::new(mem),
            FlattenOptions {
                arena: ArenaMode::Passthrough,
                ..Default::default()
            },
        );

        flat.for_root(addr, |r| {
            r.flatten_struct(addr, size_of::<Ops>(), 1, ops_recipe)
        })
        .expect("flatten");
        let tmp = dump(&mut flat);

        let sentinels: std::collections::HashMap<String, usize> = table
            .iter()
            .map(|&(_, n, s)| (n.to_owned(), s))
            .collect();
        let loader = Loader::load(
            reopen(&tmp),
            LoadOptions {
                resolver: Some(Box::new(move |name| sentinels.get(name).copied())),
                continuous: false,
            },
        )
        .expect("load");

        assert_eq!(loader.header().fptr_count, 5);
        let loaded = unsafe { &*(loader.root_by_index(0).expect("root").as_ptr() as *const Ops) };
        assert_eq!(loaded.alloc, table[0].2);
        assert_eq!(loaded.set_reserve, table[1].2);
        assert_eq!(loaded.write, table[2].2);
        assert_eq!(loaded.bq_clear, table[3].2);
        assert_eq!(loaded.puts, table[4].2);
    }

    // --- REPLACE ------------------------------------------------------

    #[repr(C)]
    struct RefT {
        p: *const u64,
    }

    fn ref_recipe(c: &mut RecipeCtx<'_>) {
        c.field_bytes(offset_of!(RefT, p), size_of::<u64>());
    }

    #[test]
    fn replace_variable_rewrites_back_references() {
        #[repr(C)]
        struct Fixture {
            refs: [RefT; 10],
            target: u64,
        }

        let mut fixture = Box::new(Fixture {
            refs: unsafe { std::mem::zeroed() },
            target: 0x5A5A,
        });
        let target_ptr: *const u64 = &fixture.target;
        for i in 0..10 {
            fixture.refs[i].p = target_ptr;
        }
        let addr = fixture.refs.as_ptr() as usize;

        let mut flat = flattener();
        flat.for_root(addr, |r| r.flatten_struct(addr, size_of::<RefT>(), 10, ref_recipe))
            .expect("flatten");
        let tmp = dump(&mut flat);

        let mut loader = load(&tmp, false);
        let refs = loader.root_by_index(0).expect("root").as_ptr() as *const RefT;

        let old = unsafe { (*refs).p } as usize;
        for i in 0..10 {
            assert_eq!(unsafe { (*refs.add(i)).p } as usize, old);
        }
        assert_eq!(unsafe { *(old as *const u64) }, 0x5A5A);

        let host: Box<u64> = Box::new(0x1111);
        let new = &*host as *const u64 as usize;
        let fixed = loader.replace_variable(old, new, 8).expect("replace");
        assert_eq!(fixed, 10);

        for i in 0..10 {
            assert_eq!(unsafe { (*refs.add(i)).p } as usize, new);
        }
        // The grafted host object itself is untouched.
        assert_eq!(*host, 0x1111);

        // Replacing back restores the original graph.
        let restored = loader.replace_variable(new, old, 8).expect("replace back");
        assert_eq!(restored, 10);
        for i in 0..10 {
            assert_eq!(unsafe { (*refs.add(i)).p } as usize, old);
        }
    }

    #[test]
    fn replace_variable_keeps_self_references_relative() {
        #[repr(C)]
        struct L {
            next: *const L,
            prev: *const L,
        }
        fn l_recipe(c: &mut RecipeCtx<'_>) {
            c.field_struct(offset_of!(L, next), size_of::<L>(), 1, l_recipe);
            c.field_struct(offset_of!(L, prev), size_of::<L>(), 1, l_recipe);
        }

        let mut l = Box::new(L {
            next: ptr::null(),
            prev: ptr::null(),
        });
        let l_addr: *const L = &*l;
        l.next = l_addr;
        l.prev = l_addr;

        let mut flat = flattener();
        flat.for_root(l_addr as usize, |r| {
            r.flatten_struct(l_addr as usize, size_of::<L>(), 1, l_recipe)
        })
        .expect("flatten");
        let tmp = dump(&mut flat);

        let mut loader = load(&tmp, false);
        let loaded = loader.root_by_index(0).expect("root").as_ptr() as *const L;
        assert_eq!(unsafe { (*loaded).next }, loaded);
        assert_eq!(unsafe { (*loaded).prev }, loaded);

        let host: Box<L> = Box::new(L {
            next: ptr::null(),
            prev: ptr::null(),
        });
        let new = &*host as *const L as usize;
        // Two pointer sites plus the root land in the window.
        let fixed = loader
            .replace_variable(loaded as usize, new, size_of::<L>())
            .expect("replace");
        assert_eq!(fixed, 3);

        // The old copy's links now aim at the new location's self.
        assert_eq!(unsafe { (*loaded).next } as usize, new);
        assert_eq!(unsafe { (*loaded).prev } as usize, new);
        assert_eq!(
            loader.root_by_index(0).expect("root").as_ptr() as usize,
            new
        );
    }

    // --- Shifted interior pointers -----------------------------------

    #[test]
    fn interior_pointer_round_trips_to_interior() {
        #[repr(C)]
        struct Wide {
            a: u64,
            inner: u64,
        }
        #[repr(C)]
        struct Holder {
            p: *const u64,
        }
        fn wide_recipe(_c: &mut RecipeCtx<'_>) {}
        fn holder_recipe(c: &mut RecipeCtx<'_>) {
            c.field_struct_shifted(
                offset_of!(Holder, p),
                size_of::<Wide>(),
                1,
                -(offset_of!(Wide, inner) as isize),
                wide_recipe,
            );
        }

        let wide = Wide {
            a: 0xAAAA,
            inner: 0xBBBB,
        };
        let holder = Holder { p: &wide.inner };
        let addr = &holder as *const Holder as usize;

        let mut flat = flattener();
        flat.for_root(addr, |r| {
            r.flatten_struct(addr, size_of::<Holder>(), 1, holder_recipe)
        })
        .expect("flatten");
        let tmp = dump(&mut flat);

        for &continuous in &[false, true] {
            let loader = load(&tmp, continuous);
            let h = unsafe { &*(loader.root_by_index(0).expect("root").as_ptr() as *const Holder) };
            // The pointer still aims at the interior field...
            assert_eq!(unsafe { *h.p }, 0xBBBB);
            // ...and the enclosing record was captured around it.
            let enclosing =
                (h.p as usize - offset_of!(Wide, inner)) as *const Wide;
            assert_eq!(unsafe { (*enclosing).a }, 0xAAAA);
        }
    }

    // --- Roots, names, cursor ----------------------------------------

    #[test]
    fn named_roots_and_cursor() {
        let one = [0x11u8; 16];
        let two = [0x22u8; 16];
        let a = one.as_ptr() as usize;
        let b = two.as_ptr() as usize;

        let mut flat = flattener();
        flat.for_root_named(a, "first", 16, |r| r.flatten_bytes(a, 16))
            .expect("root a");
        flat.for_root(b, |r| r.flatten_bytes(b, 16)).expect("root b");
        let tmp = dump(&mut flat);

        let mut loader = load(&tmp, false);
        let (named, size) = loader.root_by_name("first").expect("named root");
        assert_eq!(size, 16);
        assert_eq!(
            named.as_ptr() as usize,
            loader.root_by_index(0).expect("root 0").as_ptr() as usize
        );
        assert!(loader.root_by_name("missing").is_none());

        let first = loader.root_next().expect("cursor 0");
        let second = loader.root_next().expect("cursor 1");
        assert!(loader.root_next().is_none());
        assert_eq!(unsafe { *(first.as_ptr() as *const u8) }, 0x11);
        assert_eq!(unsafe { *(second.as_ptr() as *const u8) }, 0x22);
    }

    // --- Re-load idempotence -----------------------------------------

    #[test]
    fn reload_is_idempotent() {
        let text = b"persist\0";
        let inner = Inner {
            t: text.as_ptr() as *const c_char,
        };
        let outer = Outer {
            x: 77,
            pb: &inner,
        };
        let addr = &outer as *const Outer as usize;

        let mut flat = flattener();
        flat.for_root(addr, |r| {
            r.flatten_struct(addr, size_of::<Outer>(), 1, outer_recipe)
        })
        .expect("flatten");
        let tmp = dump(&mut flat);

        let check = |loader: &Loader| {
            let out = unsafe { &*(loader.root_by_index(0).expect("root").as_ptr() as *const Outer) };
            assert_eq!(out.x, 77);
            assert_eq!(
                unsafe { CStr::from_ptr((*out.pb).t) }.to_bytes(),
                b"persist"
            );
        };

        // First continuous load rewrites the file in place.
        {
            let loader = load(&tmp, true);
            check(&loader);
        }

        let mut header_buf = [0u8; HEADER_SIZE];
        reopen(&tmp)
            .read_exact_at(&mut header_buf, 0)
            .expect("read header");
        let header = ImageHeader::from_bytes(&header_buf).expect("parse");
        assert_ne!(header.last_load_addr, 0, "first load must publish its base");

        // Later loads see the fixed image; contents stay identical.
        {
            let loader = load(&tmp, true);
            check(&loader);
        }
        {
            let loader = load(&tmp, false);
            check(&loader);
        }
    }

    // --- Invalid images ----------------------------------------------

    #[test]
    fn rejects_garbage_and_truncation() {
        use std::io::Write;

        let mut tmp = tempfile::NamedTempFile::new().expect("temp file");
        tmp.as_file_mut()
            .write_all(&[0u8; 256])
            .expect("write garbage");
        assert!(matches!(
            Loader::load(reopen(&tmp), LoadOptions::default()),
            Err(Error::InvalidMagic)
        ));

        let data = [9u8; 32];
        let a = data.as_ptr() as usize;
        let mut flat = flattener();
        flat.for_root(a, |r| r.flatten_bytes(a, 32)).expect("root");
        let tmp = dump(&mut flat);

        let full = tmp.as_file().metadata().expect("meta").len();
        reopen(&tmp).set_len(full - 10).expect("truncate");
        assert!(matches!(
            Loader::load(reopen(&tmp), LoadOptions::default()),
            Err(Error::TruncatedImage)
        ));
    }
}
