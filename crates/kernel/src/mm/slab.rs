//! SLAB allocator: per-CPU object caches for fixed-size kernel objects,
//! backed by buddy pages.
//!
//! A cache owns slabs: one buddy block each, carved into equal object
//! slots with the free list threaded through the free slots themselves.
//! Slabs live on exactly one of three queues: the global *free* list (all
//! slots free), the global *full* list (none free), or one CPU's *partial*
//! list. The authoritative queue membership is the slab's `owner` byte,
//! which only changes under the owning queue's lock (detach) or by the
//! thread that detached it (refile), so a pop and a concurrent free stay
//! ordered without nesting queue locks inside slab locks.
//!
//! The size-class front end (`allocate`/`deallocate`) mirrors what the
//! global heap expects: small allocations are served from five static
//! caches, everything else falls through to the linked-list heap.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use spin::Once;

use super::buddy;
use super::page::{PageKind, PhysAddr, PAGE_SIZE};
use crate::klib::error::Errno;
use crate::smp::MAX_CPUS;
use crate::sync::SpinLock;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SlabFlags: u32 {
        /// Cache cannot be destroyed
        const STATIC = 1 << 0;
        /// Slab descriptor lives at the start of the slab block
        const EMBEDDED = 1 << 1;
    }
}

/// Queue membership markers beyond the per-CPU indices
const OWNER_NONE: u8 = 0xff;
const OWNER_FREE: u8 = 0xfe;
const OWNER_FULL: u8 = 0xfd;

/// Free object header, stored in the freed slots themselves.
#[repr(C)]
struct FreeObject {
    next: Option<NonNull<FreeObject>>,
}

struct SlabInner {
    free_head: Option<NonNull<FreeObject>>,
    in_use: usize,
}

// SAFETY: the raw free-list pointers are only dereferenced under the slab
// lock and point into the slab's own pages.
unsafe impl Send for SlabInner {}

impl SlabInner {
    /// Thread the free list through every slot, last to first so the head
    /// ends up at the lowest address.
    fn init_free_list(&mut self, base: usize, offset: usize, obj_size: usize, n: usize) {
        let mut prev: Option<NonNull<FreeObject>> = None;
        for i in (0..n).rev() {
            let obj = (base + offset + i * obj_size) as *mut FreeObject;
            unsafe { obj.write(FreeObject { next: prev }) };
            prev = NonNull::new(obj);
        }
        self.free_head = prev;
    }

    fn pop_free(&mut self) -> Option<NonNull<u8>> {
        let obj = self.free_head?;
        unsafe {
            self.free_head = (*obj.as_ptr()).next;
        }
        Some(obj.cast())
    }

    fn push_free(&mut self, ptr: NonNull<u8>) {
        let obj = ptr.cast::<FreeObject>();
        unsafe {
            obj.as_ptr().write(FreeObject {
                next: self.free_head,
            });
        }
        self.free_head = Some(obj);
    }
}

/// Slab descriptor: one buddy block carved into object slots.
pub struct Slab {
    cache: *const SlabCache,
    base: PhysAddr,
    owner: AtomicU8,
    inner: SpinLock<SlabInner>,
}

unsafe impl Send for Slab {}
unsafe impl Sync for Slab {}

impl Slab {
    fn new(cache: &SlabCache, base: PhysAddr) -> Self {
        Self {
            cache: cache as *const _,
            base,
            owner: AtomicU8::new(OWNER_NONE),
            inner: SpinLock::new("slab", SlabInner {
                free_head: None,
                in_use: 0,
            }),
        }
    }
}

#[derive(Clone, Copy)]
struct SlabRef(NonNull<Slab>);

unsafe impl Send for SlabRef {}

impl PartialEq for SlabRef {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_ptr() == other.0.as_ptr()
    }
}

impl SlabRef {
    fn slab(&self) -> &Slab {
        unsafe { self.0.as_ref() }
    }
}

struct CacheInner {
    free: Vec<SlabRef>,
    full: Vec<SlabRef>,
}

/// A named collection of fixed-size objects.
///
/// The cache must not move once objects have been allocated from it: slabs
/// carry a back-pointer. Kernel caches are created once and leaked.
pub struct SlabCache {
    name: &'static str,
    obj_size: usize,
    obj_per_slab: usize,
    slab_order: u8,
    obj_offset: usize,
    flags: SlabFlags,
    /// Free-capacity high-water mark (objects) that triggers shrinking
    shrink_mark: usize,
    inner: SpinLock<CacheInner>,
    cpu_partial: [SpinLock<Vec<SlabRef>>; MAX_CPUS],
    obj_active: AtomicUsize,
    obj_total: AtomicUsize,
    slab_total: AtomicUsize,
    destroyed: AtomicBool,
}

unsafe impl Send for SlabCache {}
unsafe impl Sync for SlabCache {}

/// Per-cache statistics snapshot
#[derive(Debug, Clone, Copy)]
pub struct SlabStats {
    pub name: &'static str,
    pub obj_size: usize,
    pub obj_per_slab: usize,
    pub obj_active: usize,
    pub obj_total: usize,
    pub slab_total: usize,
    pub free_slabs: usize,
    pub full_slabs: usize,
    pub partial_slabs: usize,
}

impl SlabCache {
    /// Create a cache of `obj_size`-byte objects (rounded up to 8).
    pub fn new(name: &'static str, obj_size: usize, flags: SlabFlags) -> Self {
        let obj_size = (obj_size.max(core::mem::size_of::<FreeObject>()) + 7) & !7;
        let obj_offset = if flags.contains(SlabFlags::EMBEDDED) {
            (core::mem::size_of::<Slab>() + 63) & !63
        } else {
            0
        };

        // Smallest block that fits a useful number of objects
        let mut slab_order = 0u8;
        while slab_order < buddy::MAX_ORDER {
            let space = (PAGE_SIZE << slab_order) - obj_offset;
            if space / obj_size >= 8 || (slab_order >= 4 && space / obj_size >= 1) {
                break;
            }
            slab_order += 1;
        }
        let obj_per_slab = ((PAGE_SIZE << slab_order) - obj_offset) / obj_size;
        assert!(obj_per_slab >= 1, "slab cache {}: objects too large", name);

        Self {
            name,
            obj_size,
            obj_per_slab,
            slab_order,
            obj_offset,
            flags,
            shrink_mark: obj_per_slab * 2,
            inner: SpinLock::new("slab.cache", CacheInner {
                free: Vec::new(),
                full: Vec::new(),
            }),
            cpu_partial: [const { SpinLock::new("slab.partial", Vec::new()) }; MAX_CPUS],
            obj_active: AtomicUsize::new(0),
            obj_total: AtomicUsize::new(0),
            slab_total: AtomicUsize::new(0),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn obj_size(&self) -> usize {
        self.obj_size
    }

    /// Allocate one object, preferring the current CPU's partial slabs.
    pub fn alloc(&self) -> Option<NonNull<u8>> {
        if self.destroyed.load(Ordering::Acquire) {
            return None;
        }
        let latch = kmem_enter();
        let obj = self.alloc_inner();
        kmem_exit(latch);
        obj
    }

    fn alloc_inner(&self) -> Option<NonNull<u8>> {
        loop {
            let (r, cpu) = self.pop_candidate()?;
            let slab = r.slab();
            let mut si = slab.inner.lock();

            let obj = match si.pop_free() {
                Some(obj) => obj,
                None => {
                    // Turned full between pop and lock; refile globally and retry
                    let mut ci = self.inner.lock();
                    ci.full.push(r);
                    slab.owner.store(OWNER_FULL, Ordering::SeqCst);
                    drop(ci);
                    drop(si);
                    continue;
                }
            };
            si.in_use += 1;
            self.obj_active.fetch_add(1, Ordering::SeqCst);

            if si.free_head.is_none() {
                let mut ci = self.inner.lock();
                ci.full.push(r);
                slab.owner.store(OWNER_FULL, Ordering::SeqCst);
            } else {
                let mut q = self.cpu_partial[cpu].lock();
                q.push(r);
                slab.owner.store(cpu as u8, Ordering::SeqCst);
            }
            drop(si);
            return Some(obj);
        }
    }

    /// Pop a slab with free slots: this CPU's partial list, then the global
    /// free list, then a fresh slab from the page allocator.
    fn pop_candidate(&self) -> Option<(SlabRef, usize)> {
        let cpu = crate::smp::cpu_id() % MAX_CPUS;
        {
            let mut q = self.cpu_partial[cpu].lock();
            if let Some(r) = q.pop() {
                r.slab().owner.store(OWNER_NONE, Ordering::SeqCst);
                return Some((r, cpu));
            }
        }
        {
            let mut ci = self.inner.lock();
            if let Some(r) = ci.free.pop() {
                r.slab().owner.store(OWNER_NONE, Ordering::SeqCst);
                return Some((r, cpu));
            }
        }
        self.grow().map(|r| (r, cpu))
    }

    /// Build a new slab on a fresh buddy block.
    fn grow(&self) -> Option<SlabRef> {
        let pool = buddy::pool()?;
        let pa = pool.alloc_pages(self.slab_order, PageKind::Slab)?;
        let base_va = pa as usize; // identity mapped

        let slab_ptr: *mut Slab = if self.flags.contains(SlabFlags::EMBEDDED) {
            let p = base_va as *mut Slab;
            unsafe { p.write(Slab::new(self, pa)) };
            p
        } else {
            Box::into_raw(Box::new(Slab::new(self, pa)))
        };

        {
            let slab = unsafe { &*slab_ptr };
            let mut si = slab.inner.lock();
            si.init_free_list(base_va, self.obj_offset, self.obj_size, self.obj_per_slab);
        }

        // Every page of the block points back at the descriptor
        for i in 0..(1usize << self.slab_order) {
            let page = pool
                .page_at(pa + (i * PAGE_SIZE) as u64)
                .expect("slab: block outside managed region");
            page.set_payload(slab_ptr as usize);
        }

        self.slab_total.fetch_add(1, Ordering::SeqCst);
        self.obj_total.fetch_add(self.obj_per_slab, Ordering::SeqCst);
        NonNull::new(slab_ptr).map(SlabRef)
    }

    /// Return an object to its slab.
    ///
    /// A pointer whose page is not a slab page, or whose slab belongs to a
    /// different cache, is a programmer error and panics.
    pub fn free(&self, ptr: NonNull<u8>) {
        let latch = kmem_enter();
        let spared = self.free_inner(ptr);
        self.maybe_shrink(spared);
        kmem_exit(latch);
    }

    fn free_inner(&self, ptr: NonNull<u8>) -> SlabRef {
        let (r, _) = resolve_slab(ptr);
        let slab = r.slab();
        assert!(
            core::ptr::eq(slab.cache, self as *const _),
            "slab cache {}: freeing a pointer that belongs to another cache",
            self.name
        );
        let off = ptr.as_ptr() as usize - slab.base as usize - self.obj_offset;
        assert!(
            off % self.obj_size == 0 && off / self.obj_size < self.obj_per_slab,
            "slab cache {}: free of a misaligned object pointer",
            self.name
        );

        let mut si = slab.inner.lock();
        assert!(si.in_use > 0, "slab cache {}: free of an unallocated object", self.name);
        let was_full = si.free_head.is_none();
        si.push_free(ptr);
        si.in_use -= 1;
        let now_empty = si.in_use == 0;
        self.obj_active.fetch_sub(1, Ordering::SeqCst);

        if was_full || now_empty {
            self.refile(r, now_empty);
        }
        drop(si);
        r
    }

    /// Move a slab whose fullness category changed onto the right queue.
    /// Called with the slab lock held.
    fn refile(&self, r: SlabRef, now_empty: bool) {
        let slab = r.slab();
        loop {
            match slab.owner.load(Ordering::SeqCst) {
                OWNER_NONE => return, // a detacher holds it and will refile
                o @ (OWNER_FREE | OWNER_FULL) => {
                    let mut ci = self.inner.lock();
                    if slab.owner.load(Ordering::SeqCst) != o {
                        continue;
                    }
                    let list = if o == OWNER_FULL {
                        &mut ci.full
                    } else {
                        &mut ci.free
                    };
                    if let Some(i) = list.iter().position(|x| *x == r) {
                        list.swap_remove(i);
                    }
                    if now_empty {
                        ci.free.push(r);
                        slab.owner.store(OWNER_FREE, Ordering::SeqCst);
                    } else {
                        slab.owner.store(OWNER_NONE, Ordering::SeqCst);
                        drop(ci);
                        let cpu = crate::smp::cpu_id() % MAX_CPUS;
                        let mut q = self.cpu_partial[cpu].lock();
                        q.push(r);
                        slab.owner.store(cpu as u8, Ordering::SeqCst);
                    }
                    return;
                }
                c => {
                    let mut q = self.cpu_partial[c as usize % MAX_CPUS].lock();
                    if slab.owner.load(Ordering::SeqCst) != c {
                        continue;
                    }
                    if let Some(i) = q.iter().position(|x| *x == r) {
                        q.swap_remove(i);
                    }
                    slab.owner.store(OWNER_NONE, Ordering::SeqCst);
                    drop(q);
                    if now_empty {
                        let mut ci = self.inner.lock();
                        ci.free.push(r);
                        slab.owner.store(OWNER_FREE, Ordering::SeqCst);
                    } else {
                        let cpu = crate::smp::cpu_id() % MAX_CPUS;
                        let mut q = self.cpu_partial[cpu].lock();
                        q.push(r);
                        slab.owner.store(cpu as u8, Ordering::SeqCst);
                    }
                    return;
                }
            }
        }
    }

    /// Destroy surplus empty slabs once free capacity exceeds the mark,
    /// sparing the slab the triggering object lives in.
    fn maybe_shrink(&self, spared: SlabRef) {
        let free_capacity = self
            .obj_total
            .load(Ordering::SeqCst)
            .saturating_sub(self.obj_active.load(Ordering::SeqCst));
        if free_capacity <= self.shrink_mark {
            return;
        }
        let excess_slabs = (free_capacity - self.shrink_mark) / self.obj_per_slab;
        if excess_slabs == 0 {
            return;
        }
        self.shrink((excess_slabs + 1) / 2, Some(spared));
    }

    /// Release up to `n` empty slabs back to the page allocator.
    /// Returns how many were destroyed.
    pub fn cache_shrink(&self, n: usize) -> usize {
        self.shrink(n, None)
    }

    fn shrink(&self, n: usize, spare: Option<SlabRef>) -> usize {
        let latch = kmem_enter();
        let destroyed = self.shrink_inner(n, spare);
        kmem_exit(latch);
        destroyed
    }

    fn shrink_inner(&self, n: usize, spare: Option<SlabRef>) -> usize {
        let mut victims: Vec<SlabRef> = Vec::new();
        {
            let mut ci = self.inner.lock();
            let mut kept: Option<SlabRef> = None;
            while victims.len() < n {
                let r = match ci.free.pop() {
                    Some(r) => r,
                    None => break,
                };
                if spare.map_or(false, |s| s == r) {
                    kept = Some(r);
                    continue;
                }
                r.slab().owner.store(OWNER_NONE, Ordering::SeqCst);
                victims.push(r);
            }
            if let Some(r) = kept {
                ci.free.push(r);
            }
        }
        for r in &victims {
            self.reclaim(*r);
        }
        victims.len()
    }

    fn reclaim(&self, r: SlabRef) {
        let slab = r.slab();
        {
            let si = slab.inner.lock();
            assert!(si.in_use == 0, "slab cache {}: reclaiming a live slab", self.name);
        }
        let base = slab.base;

        let pool = buddy::pool().expect("slab: page allocator gone");
        for i in 0..(1usize << self.slab_order) {
            if let Some(page) = pool.page_at(base + (i * PAGE_SIZE) as u64) {
                page.set_payload(0);
            }
        }

        let raw = r.0.as_ptr();
        if self.flags.contains(SlabFlags::EMBEDDED) {
            unsafe { core::ptr::drop_in_place(raw) };
        } else {
            drop(unsafe { Box::from_raw(raw) });
        }
        pool.page_put(base);

        self.slab_total.fetch_sub(1, Ordering::SeqCst);
        self.obj_total.fetch_sub(self.obj_per_slab, Ordering::SeqCst);
    }

    /// Tear the cache down. Fails on STATIC caches and while objects are
    /// still allocated.
    pub fn destroy(&self) -> Result<(), Errno> {
        if self.flags.contains(SlabFlags::STATIC) {
            return Err(Errno::EPERM);
        }
        if self.obj_active.load(Ordering::SeqCst) > 0 {
            return Err(Errno::EBUSY);
        }
        self.destroyed.store(true, Ordering::Release);
        self.shrink(usize::MAX, None);
        assert!(
            self.slab_total.load(Ordering::SeqCst) == 0,
            "slab cache {}: slabs leaked across destroy",
            self.name
        );
        unregister(self);
        Ok(())
    }

    pub fn stats(&self) -> SlabStats {
        let (free_slabs, full_slabs) = {
            let ci = self.inner.lock();
            (ci.free.len(), ci.full.len())
        };
        let mut partial_slabs = 0;
        for q in &self.cpu_partial {
            partial_slabs += q.lock().len();
        }
        SlabStats {
            name: self.name,
            obj_size: self.obj_size,
            obj_per_slab: self.obj_per_slab,
            obj_active: self.obj_active.load(Ordering::SeqCst),
            obj_total: self.obj_total.load(Ordering::SeqCst),
            slab_total: self.slab_total.load(Ordering::SeqCst),
            free_slabs,
            full_slabs,
            partial_slabs,
        }
    }
}

/// Find the slab a pointer belongs to via the page descriptor back-pointer.
fn resolve_slab(ptr: NonNull<u8>) -> (SlabRef, PhysAddr) {
    let pa = ptr.as_ptr() as u64;
    let page = buddy::lookup_page(pa)
        .unwrap_or_else(|| panic!("slab: pointer {:p} outside managed memory", ptr.as_ptr()));
    assert!(
        page.kind() == PageKind::Slab,
        "slab: pointer {:p} does not map to a slab page",
        ptr.as_ptr()
    );
    let raw = page.payload() as *mut Slab;
    let nn = NonNull::new(raw).expect("slab: page with no descriptor back-pointer");
    (SlabRef(nn), pa)
}

// ── Cache registry ──────────────────────────────────────────────────────

static CACHES: SpinLock<Vec<&'static SlabCache>> = SpinLock::new("slab.registry", Vec::new());

pub fn register(cache: &'static SlabCache) {
    CACHES.lock().push(cache);
}

fn unregister(cache: &SlabCache) {
    CACHES
        .lock()
        .retain(|c| !core::ptr::eq(*c as *const SlabCache, cache as *const SlabCache));
}

pub fn all_stats() -> Vec<SlabStats> {
    CACHES.lock().iter().map(|c| c.stats()).collect()
}

// ── Size-class front end for the kernel heap ────────────────────────────

/// Size classes served by the static caches
const KMEM_SIZES: [usize; 5] = [16, 32, 64, 128, 256];

static KMEM: Once<[&'static SlabCache; 5]> = Once::new();
static SLAB_ENABLED: AtomicBool = AtomicBool::new(false);

/// Reentrancy latch: cache internals allocate (queue growth, descriptors),
/// and on bare metal those allocations come back through the global heap.
/// Routing is parked on the heap for the duration of a cache operation.
/// Hosted builds never route the global allocator here, so no latch.
fn kmem_enter() -> bool {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    {
        SLAB_ENABLED.swap(false, Ordering::SeqCst)
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        true
    }
}

fn kmem_exit(latch: bool) {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    SLAB_ENABLED.store(latch, Ordering::SeqCst);
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    let _ = latch;
}

pub fn is_enabled() -> bool {
    SLAB_ENABLED.load(Ordering::Acquire)
}

/// Create and register the size-class caches. Requires the buddy allocator.
pub fn init() {
    KMEM.call_once(|| {
        let mk = |name, size| -> &'static SlabCache {
            let cache: &'static SlabCache = Box::leak(Box::new(SlabCache::new(
                name,
                size,
                SlabFlags::STATIC | SlabFlags::EMBEDDED,
            )));
            register(cache);
            cache
        };
        [
            mk("kmem-16", 16),
            mk("kmem-32", 32),
            mk("kmem-64", 64),
            mk("kmem-128", 128),
            mk("kmem-256", 256),
        ]
    });
    SLAB_ENABLED.store(true, Ordering::Release);
    crate::info!("slab: size classes {:?} ready", KMEM_SIZES);
}

fn class_index(size: usize) -> Option<usize> {
    match size {
        1..=16 => Some(0),
        17..=32 => Some(1),
        33..=64 => Some(2),
        65..=128 => Some(3),
        129..=256 => Some(4),
        _ => None,
    }
}

/// Allocate from the size-class caches; `None` sends the caller to the
/// fallback heap.
pub fn allocate(layout: core::alloc::Layout) -> Option<NonNull<u8>> {
    if !is_enabled() || layout.align() > 8 {
        return None;
    }
    let idx = class_index(layout.size())?;
    KMEM.get()?[idx].alloc()
}

/// Free a pointer if it came from any slab cache. Returns false when the
/// pointer is not slab-backed (caller frees it through the heap).
///
/// # Safety
/// `ptr` must be a live allocation matching `_layout`.
pub unsafe fn deallocate(ptr: NonNull<u8>, _layout: core::alloc::Layout) -> bool {
    let pa = ptr.as_ptr() as u64;
    let page = match buddy::lookup_page(pa) {
        Some(p) => p,
        None => return false,
    };
    if page.kind() != PageKind::Slab {
        return false;
    }
    let cache = {
        let (r, _) = resolve_slab(ptr);
        unsafe { &*r.slab().cache }
    };
    cache.free(ptr);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::buddy::test_support::ensure_global_pool;

    fn test_cache(name: &'static str, size: usize, flags: SlabFlags) -> &'static SlabCache {
        ensure_global_pool();
        Box::leak(Box::new(SlabCache::new(name, size, flags)))
    }

    #[test]
    fn object_size_rounds_up_to_eight() {
        ensure_global_pool();
        let c = SlabCache::new("round", 20, SlabFlags::empty());
        assert_eq!(c.obj_size, 24);
        let c = SlabCache::new("round2", 3, SlabFlags::empty());
        assert_eq!(c.obj_size, 8);
    }

    #[test]
    fn alloc_free_realloc_reuses_the_slot() {
        let c = test_cache("reuse", 64, SlabFlags::empty());
        let a = c.alloc().expect("first alloc");
        assert_eq!(c.stats().obj_active, 1);
        c.free(a);
        assert_eq!(c.stats().obj_active, 0);
        let b = c.alloc().expect("second alloc");
        assert_eq!(a.as_ptr(), b.as_ptr());
        assert_eq!(c.stats().obj_active, 1);
        c.free(b);
    }

    #[test]
    fn counters_obey_cache_invariants() {
        let c = test_cache("inv", 48, SlabFlags::empty());
        let mut held = Vec::new();
        for _ in 0..10 {
            held.push(c.alloc().expect("alloc"));
        }
        let s = c.stats();
        assert_eq!(s.obj_total, s.slab_total * s.obj_per_slab);
        assert!(s.obj_active <= s.obj_total);
        assert_eq!(s.obj_active, 10);
        for p in held {
            c.free(p);
        }
        assert_eq!(c.stats().obj_active, 0);
    }

    #[test]
    fn full_slab_moves_between_lists() {
        let c = test_cache("lists", 1024, SlabFlags::empty());
        let cap = c.obj_per_slab;
        let mut held = Vec::new();
        for _ in 0..cap {
            held.push(c.alloc().expect("fill"));
        }
        let s = c.stats();
        assert_eq!(s.full_slabs, 1);
        assert_eq!(s.partial_slabs, 0);

        c.free(held.pop().unwrap());
        let s = c.stats();
        assert_eq!(s.full_slabs, 0);
        assert_eq!(s.partial_slabs, 1);
        for p in held {
            c.free(p);
        }
    }

    #[test]
    fn destroy_fails_while_objects_live() {
        let c = test_cache("busy", 64, SlabFlags::empty());
        let p = c.alloc().expect("alloc");
        assert_eq!(c.destroy(), Err(Errno::EBUSY));
        c.free(p);
    }

    #[test]
    fn static_cache_never_destroys() {
        let c = test_cache("static", 64, SlabFlags::STATIC);
        assert_eq!(c.destroy(), Err(Errno::EPERM));
    }

    #[test]
    fn destroy_returns_pages() {
        let c = test_cache("gone", 64, SlabFlags::empty());
        let p = c.alloc().expect("alloc");
        c.free(p);
        c.destroy().expect("destroy");
        assert_eq!(c.stats().slab_total, 0);
        assert!(c.alloc().is_none());
    }

    #[test]
    fn embedded_descriptor_reserves_slot_space() {
        let c = test_cache("embed", 64, SlabFlags::EMBEDDED);
        let plain = test_cache("plain", 64, SlabFlags::empty());
        assert!(c.obj_per_slab < plain.obj_per_slab);
        let p = c.alloc().expect("alloc");
        // The object must sit past the embedded descriptor
        let (r, _) = resolve_slab(p);
        assert!(p.as_ptr() as u64 >= r.slab().base + c.obj_offset as u64);
        c.free(p);
    }

    #[test]
    fn shrink_releases_empty_slabs() {
        let c = test_cache("shrink", 2048, SlabFlags::empty());
        let cap = c.obj_per_slab;
        // Force several slabs into existence, then free everything
        let mut held = Vec::new();
        for _ in 0..cap * 3 {
            held.push(c.alloc().expect("alloc"));
        }
        assert!(c.stats().slab_total >= 3);
        for p in held {
            c.free(p);
        }
        // The high-water mark caps retained free capacity at two slabs
        assert!(c.stats().slab_total <= 2);
        assert_eq!(c.stats().obj_active, 0);
    }

    #[test]
    #[should_panic(expected = "another cache")]
    fn foreign_cache_free_panics() {
        let a = test_cache("owner-a", 64, SlabFlags::empty());
        let b = test_cache("owner-b", 64, SlabFlags::empty());
        let p = a.alloc().expect("alloc");
        b.free(p);
    }
}
