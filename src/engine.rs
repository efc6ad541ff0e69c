//! The flatten engine: owns every per-dump structure, drives the
//! work-queue traversal, and carries the sticky error slot that makes
//! recipe verbs no-ops once anything has failed.
//!
//! `Flattener` is intentionally `!Sync`: one engine instance is
//! single-writer for the duration of a dump.
use log::info;
use log::warn;

use std::ptr;
use std::time::Duration;
use std::time::Instant;

use crate::arena::Arena;
use crate::arena::ArenaMode;
use crate::error::Error;
use crate::error::Result;
use crate::fixups::FixOutcome;
use crate::fixups::FixTarget;
use crate::fixups::FixupMap;
use crate::oracle::Memory;
use crate::queue::BlockQueue;
use crate::ranges::FlatPtr;
use crate::ranges::RangeMap;
use crate::recipe::Job;
use crate::recipe::PostConvert;
use crate::recipe::PreExtract;
use crate::recipe::RecipeCtx;
use crate::recipe::RecipeFn;
use crate::recipe::RootCtx;
use crate::roots::RootSet;
use crate::stream::Stream;

/// Record alignment inferred from the low bits of its source address:
/// an 8-aligned record keeps 8-byte alignment in the image, and so on.
const ADDR_ALIGNMENTS: [usize; 8] = [8, 1, 2, 1, 4, 1, 2, 1];

pub struct FlattenOptions {
    pub arena: ArenaMode,
    /// Omit the fragment index; the payload then loads as one region.
    pub skip_fragments: bool,
    /// Wall-clock budget for one root's traversal.
    pub max_time: Duration,
    /// Interval between progress log lines.
    pub ping_time: Duration,
    /// Byte footprint of one work-queue block.
    pub queue_block: usize,
}

impl Default for FlattenOptions {
    fn default() -> FlattenOptions {
        FlattenOptions {
            arena: ArenaMode::Linear(64 << 20),
            skip_fragments: false,
            max_time: Duration::from_secs(8),
            ping_time: Duration::from_secs(1),
            queue_block: 8 << 20,
        }
    }
}

pub struct Flattener {
    pub(crate) mem: Box<dyn Memory>,
    pub(crate) arena: Arena,
    pub(crate) stream: Stream,
    pub(crate) ranges: RangeMap,
    pub(crate) fixups: FixupMap,
    pub(crate) roots: RootSet,
    pub(crate) queue: BlockQueue<Job>,
    pub(crate) skip_fragments: bool,
    max_time: Duration,
    ping_time: Duration,
    /// First error wins; every verb checks this and short-circuits.
    error: Option<Error>,
    // One engine per flattener thread.
    _not_sync: std::marker::PhantomData<*const ()>,
}

impl Flattener {
    pub fn new(mem: Box<dyn Memory>, opts: FlattenOptions) -> Flattener {
        Flattener {
            mem,
            arena: Arena::new(opts.arena),
            stream: Stream::new(),
            ranges: RangeMap::new(),
            fixups: FixupMap::new(),
            roots: RootSet::new(),
            queue: BlockQueue::new(opts.queue_block),
            skip_fragments: opts.skip_fragments,
            max_time: opts.max_time,
            ping_time: opts.ping_time,
            error: None,
            _not_sync: std::marker::PhantomData,
        }
    }

    /// The latched error, if any.
    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    pub(crate) fn ok(&self) -> bool {
        self.error.is_none()
    }

    pub(crate) fn latch(&mut self, err: Error) {
        if self.error.is_none() {
            warn!("flatten error latched: {}", err);
            self.error = Some(err);
        }
    }

    pub(crate) fn latched(&self) -> Result<()> {
        match &self.error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    /// Registers an anonymous root, runs `body` against it, and pumps
    /// the work queue to exhaustion.
    pub fn for_root<F>(&mut self, addr: usize, body: F) -> Result<()>
    where
        F: FnOnce(&mut RootCtx<'_>),
    {
        self.root_inner(addr, None, body)
    }

    /// Like `for_root`, with a unique name and declared size recorded in
    /// the image.
    pub fn for_root_named<F>(&mut self, addr: usize, name: &str, size: usize, body: F) -> Result<()>
    where
        F: FnOnce(&mut RootCtx<'_>),
    {
        self.root_inner(addr, Some((name, size)), body)
    }

    fn root_inner<F>(&mut self, addr: usize, named: Option<(&str, usize)>, body: F) -> Result<()>
    where
        F: FnOnce(&mut RootCtx<'_>),
    {
        self.queue.clear();

        if self.ok() && self.mem.addr_valid(addr) {
            let mut ctx = RootCtx::new(self, None);
            body(&mut ctx);
        }

        if self.ok() {
            match named {
                // A root the oracle rejected is still registered; its
                // image offset becomes the all-ones sentinel.
                Some((name, size)) => self.roots.append_named(addr, name, size)?,
                None => self.roots.append(addr),
            }
        }

        self.run_queue();
        self.latched()
    }

    /// Snapshots `[addr, addr + size)` and returns its flattened
    /// location.  The caller must have validated the span through the
    /// oracle.
    pub(crate) fn flatten_plain(&mut self, addr: usize, size: usize) -> Option<FlatPtr> {
        if size == 0 {
            warn!("refusing to flatten a zero-sized span at {:#x}", addr);
            return None;
        }

        let acquired = unsafe {
            self.ranges
                .acquire(&mut self.arena, &mut self.stream, addr, size)
        };
        match acquired {
            Ok(_) => self.ranges.resolve(addr),
            Err(e) => {
                self.latch(e);
                None
            }
        }
    }

    /// Installs `target` at `site` with force-update semantics, treating
    /// duplicate and overwrite outcomes as success.  Returns the outcome
    /// (`None` for a virtual site).
    pub(crate) fn install(&mut self, site: Option<FlatPtr>, target: FixTarget) -> Option<FixOutcome> {
        let site = site?;
        let outcome = match target {
            FixTarget::Func(addr) => self.fixups.insert_fptr_force(&self.ranges, site, addr),
            _ => self.fixups.insert_force(&self.ranges, site, target),
        };
        match outcome {
            Ok(o) => Some(o),
            Err(e) => {
                self.latch(e);
                None
            }
        }
    }

    /// Shared tail of the struct-flatten verbs: capture the pointee
    /// span, retarget interior pointers, install the site fix-up, and
    /// queue per-element traversal jobs.
    pub(crate) fn flatten_generic(
        &mut self,
        site: Option<FlatPtr>,
        target: usize,
        el_size: usize,
        count: usize,
        custom: usize,
        shift: isize,
        recipe: RecipeFn,
        post: Option<PostConvert>,
        orig_ptr: usize,
    ) {
        let span = match count.checked_mul(el_size) {
            Some(s) => s,
            None => return self.latch(Error::Overflow),
        };
        if !self.ok() || !self.mem.range_valid(target, span) {
            return;
        }

        let mut flat = match self.flatten_plain(target, span) {
            Some(fp) => fp,
            None => {
                self.latch(Error::AddressUnreadable {
                    addr: target,
                    size: span,
                });
                return;
            }
        };

        // An interior pointer records the address it actually held, not
        // the start of the enclosing record.
        if shift != 0 {
            let held = (target as isize - shift) as usize;
            match self.ranges.resolve(held) {
                Some(fp) => flat = fp,
                None => {
                    self.latch(Error::AddressUnreadable {
                        addr: held,
                        size: 1,
                    });
                    return;
                }
            }
        }

        if let Some(post) = post {
            flat = post(flat, orig_ptr);
        }

        if self.install(site, FixTarget::Data(flat)) == Some(FixOutcome::AlreadyExists) {
            return;
        }
        if !self.ok() {
            return;
        }

        for i in 0..count {
            let element = target + i * el_size;
            if self.fixups.search(element).is_none() {
                if self.fixups.reserve(element).is_err() {
                    continue;
                }
                self.queue.push_back(Job {
                    site: None,
                    el_size,
                    count: 1,
                    custom,
                    index: i,
                    target: element,
                    recipe,
                    convert: None,
                    orig_ptr: 0,
                });
            }
        }
    }

    /// Pointer-field verb: follow the pointer stored at `base + off`
    /// and flatten what it references.
    pub(crate) fn aggregate_generic(
        &mut self,
        base: usize,
        off: usize,
        el_size: usize,
        count: usize,
        custom: usize,
        shift: isize,
        recipe: RecipeFn,
        pre: Option<PreExtract>,
        post: Option<PostConvert>,
    ) {
        if !self.ok() {
            return;
        }

        let held: usize = unsafe { ptr::read_unaligned((base + off) as *const usize) };
        let extracted = match pre {
            Some(pre) => pre(held),
            None => held,
        };
        if extracted == 0 {
            return;
        }
        let target = (extracted as isize + shift) as usize;

        let span = match count.checked_mul(el_size) {
            Some(s) => s,
            None => return self.latch(Error::Overflow),
        };
        if !self.mem.range_valid(target, span) {
            return;
        }

        // The containing record must already be captured for the site
        // to have a home.
        let site = match self.ranges.resolve(base + off) {
            Some(fp) => fp,
            None => {
                self.latch(Error::AddressUnreadable {
                    addr: base + off,
                    size: 8,
                });
                return;
            }
        };

        self.flatten_generic(
            Some(site),
            target,
            el_size,
            count,
            custom,
            shift,
            recipe,
            post,
            held,
        );
    }

    /// Inline-member verb: run `recipe` over an aggregate embedded by
    /// value at `base + off`.  No pointer, no fix-up.
    pub(crate) fn aggregate_storage(
        &mut self,
        base: usize,
        off: usize,
        el_size: usize,
        count: usize,
        custom: usize,
        recipe: RecipeFn,
    ) {
        let span = match count.checked_mul(el_size) {
            Some(s) => s,
            None => return self.latch(Error::Overflow),
        };
        let start = base + off;
        if !self.ok() || !self.mem.range_valid(start, span) {
            return;
        }

        for i in 0..count {
            if !self.ok() {
                break;
            }
            let element = start + i * el_size;
            if self.fixups.search(element).is_none() {
                if let Err(e) = self.fixups.reserve(element) {
                    self.latch(e);
                    break;
                }
            }
            self.queue.push_back(Job {
                site: None,
                el_size,
                count: 1,
                custom,
                index: i,
                target: element,
                recipe,
                convert: None,
                orig_ptr: 0,
            });
        }
    }

    /// Captures the NUL-terminated string at `addr` and installs a
    /// fix-up at `site`.  Length comes from the oracle: truncation at an
    /// unreadable page yields the readable prefix without a terminator.
    pub(crate) fn flatten_string(&mut self, site: Option<FlatPtr>, addr: usize) {
        if !self.ok() || !self.mem.addr_valid(addr) {
            return;
        }

        let len = self.mem.string_len(addr);
        if len == 0 {
            return;
        }
        if let Some(fp) = self.flatten_plain(addr, len) {
            self.install(site, FixTarget::Data(fp));
        }
    }

    /// Installs a function-pointer fix-up at `site` when the oracle
    /// accepts `addr` as code.
    pub(crate) fn flatten_fptr(&mut self, site: Option<FlatPtr>, addr: usize) {
        if !self.ok() || !self.mem.text_valid(addr) {
            return;
        }
        self.install(site, FixTarget::Func(addr));
    }

    /// Plain-bytes verb: snapshot `[addr, addr + size)` and point `site`
    /// at it.  No recursion.
    pub(crate) fn flatten_bytes(&mut self, site: Option<FlatPtr>, addr: usize, size: usize) {
        if !self.ok() || !self.mem.range_valid(addr, size) {
            return;
        }
        if let Some(fp) = self.flatten_plain(addr, size) {
            self.install(site, FixTarget::Data(fp));
        }
    }

    /// Runs one job's recipe over its elements, in the order the
    /// original record's bytes appear.  Returns the flattened location
    /// of the first element.
    fn execute_job(&mut self, job: &Job) -> Option<FlatPtr> {
        let mut first: Option<FlatPtr> = None;

        for i in 0..job.count {
            let addr = job.target + i * job.el_size;
            let fp = self.execute_element(addr, job)?;
            if first.is_none() {
                first = Some(fp);
            }
        }

        if !self.ok() {
            return None;
        }
        first
    }

    fn execute_element(&mut self, addr: usize, job: &Job) -> Option<FlatPtr> {
        let acquired = unsafe {
            self.ranges
                .acquire(&mut self.arena, &mut self.stream, addr, job.el_size)
        };
        if let Err(e) = acquired {
            self.latch(e);
            return None;
        }

        let alignment = {
            let mut ctx = RecipeCtx::new(self, addr, job.el_size, job.custom, job.index);
            ctx.set_alignment(ADDR_ALIGNMENTS[addr % 8]);
            (job.recipe)(&mut ctx);
            ctx.alignment()
        };
        if !self.ok() {
            return None;
        }

        match self.ranges.resolve(addr) {
            Some(fp) => {
                let chunk = self.ranges.get(fp.range).chunk;
                self.stream.set_alignment(chunk, alignment);
                Some(fp)
            }
            None => {
                self.latch(Error::AddressUnreadable {
                    addr,
                    size: job.el_size,
                });
                None
            }
        }
    }

    /// The iter harness: drains the work queue, installing each job's
    /// result into its back-pointer site.  On error or timeout the
    /// remaining jobs are dropped without executing.
    pub(crate) fn run_queue(&mut self) {
        let mut done = 0usize;
        let mut total = Duration::from_secs(0);
        let mut window_start = Instant::now();

        while self.ok() && !self.queue.is_empty() {
            let job = match self.queue.pop_front() {
                Some(j) => j,
                None => break,
            };

            let mut result = self.execute_job(&job);
            if let Some(convert) = job.convert {
                result = result.map(|fp| convert(fp, job.orig_ptr));
            }

            match job.site {
                Some(site) => {
                    if let Some(fp) = result {
                        self.install(Some(site), FixTarget::Data(fp));
                    }
                }
                None => {
                    if result.is_none() {
                        break;
                    }
                }
            }

            done += 1;
            let now = Instant::now();
            if now.duration_since(window_start) >= self.ping_time {
                total += now.duration_since(window_start);
                if total >= self.max_time {
                    warn!(
                        "flattening timed out after {} recipes ({:?} elapsed)",
                        done, total
                    );
                    self.latch(Error::Timeout);
                    break;
                }
                info!(
                    "still flattening: {} recipes done, queue {} jobs, arena {}/{} bytes",
                    done,
                    self.queue.element_count(),
                    self.arena.used(),
                    self.arena.capacity()
                );
                window_start = now;
            }
        }

        // Cancellation policy: drained, not executed.
        self.queue.clear();
        info!("traversal finished: {} recipes executed", done);
    }
}
