/// Buddy allocator for physical page management
///
/// Free blocks are power-of-two page groups kept in one free list per order,
/// each list behind its own lock, acquired in ascending order. Two adjacent
/// equal-order groups whose base addresses differ only in bit
/// `order + PAGE_SHIFT` are buddies and merge when both are free; the
/// `Merging` page state keeps a free and a concurrent buddy search ordered
/// without ever nesting pool locks across the merge.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};
use spin::Once;

use super::page::{
    pa_to_pfn, page_align_down, page_align_up, pfn_to_pa, Page, PageKind, Pfn, PhysAddr, PAGE_SIZE,
};
use crate::klib::error::KernelError;
use crate::sync::{SpinLock, SpinLockGuard};

/// Maximum order (2^10 pages = 4 MiB max allocation)
pub const MAX_ORDER: u8 = 10;
const NUM_ORDERS: usize = MAX_ORDER as usize + 1;

#[derive(Debug, Clone, Copy)]
pub struct AllocStats {
    pub total_pages: usize,
    pub free_pages: usize,
    pub allocated_pages: usize,
}

pub struct BuddyPool {
    /// Page metadata array (indexed by PFN - base_pfn)
    pages: Vec<Page>,
    base_pfn: Pfn,
    num_pages: usize,
    /// Free lists of group-head PFNs, one per order
    free_lists: [SpinLock<Vec<Pfn>>; NUM_ORDERS],
    free_count: AtomicUsize,
    total_count: AtomicUsize,
}

impl BuddyPool {
    /// Build a pool over the given RAM ranges (physical address, size).
    pub fn init(ram_ranges: &[(PhysAddr, usize)]) -> Result<BuddyPool, KernelError> {
        if ram_ranges.is_empty() {
            return Err(KernelError::InvalidArgument);
        }

        let mut min_addr = u64::MAX;
        let mut max_addr = 0u64;
        for &(addr, size) in ram_ranges {
            min_addr = min_addr.min(page_align_up(addr));
            max_addr = max_addr.max(page_align_down(addr + size as u64));
        }
        if max_addr <= min_addr {
            return Err(KernelError::InvalidArgument);
        }

        let base_pfn = pa_to_pfn(min_addr);
        let num_pages = pa_to_pfn(max_addr) - base_pfn;

        let mut pages = Vec::with_capacity(num_pages);
        for _ in 0..num_pages {
            pages.push(Page::new());
        }

        let pool = BuddyPool {
            pages,
            base_pfn,
            num_pages,
            free_lists: [const { SpinLock::new("buddy.pool", Vec::new()) }; NUM_ORDERS],
            free_count: AtomicUsize::new(0),
            total_count: AtomicUsize::new(0),
        };

        for &(addr, size) in ram_ranges {
            let start_pfn = pa_to_pfn(page_align_up(addr));
            let end_pfn = pa_to_pfn(page_align_down(addr + size as u64));
            let n = end_pfn.saturating_sub(start_pfn);
            pool.add_free_range(start_pfn, n);
            pool.total_count.fetch_add(n, Ordering::Relaxed);
            pool.free_count.fetch_add(n, Ordering::Relaxed);
        }

        crate::info!(
            "buddy: managing {} pages ({} KiB) from PFN {:#x}",
            pool.num_pages,
            pool.num_pages * PAGE_SIZE / 1024,
            pool.base_pfn
        );
        Ok(pool)
    }

    /// Carve a fresh range into maximal aligned blocks and file them.
    fn add_free_range(&self, start_pfn: Pfn, num_pages: usize) {
        let mut pfn = start_pfn;
        let mut remaining = num_pages;
        while remaining > 0 {
            let mut order = 0u8;
            while order < MAX_ORDER {
                let next = 1usize << (order + 1);
                if next > remaining || pfn & (next - 1) != 0 {
                    break;
                }
                order += 1;
            }
            self.commit_free_block(pfn, order);
            self.free_lists[order as usize].lock().push(pfn);
            pfn += 1 << order;
            remaining -= 1 << order;
        }
    }

    pub fn page_at(&self, pa: PhysAddr) -> Option<&Page> {
        let pfn = pa_to_pfn(pa);
        self.page(pfn)
    }

    fn page(&self, pfn: Pfn) -> Option<&Page> {
        if pfn < self.base_pfn {
            return None;
        }
        self.pages.get(pfn - self.base_pfn)
    }

    /// Allocate a single page
    pub fn alloc_page(&self, kind: PageKind) -> Option<PhysAddr> {
        self.alloc_pages(0, kind)
    }

    /// Allocate a 2^order block; every constituent page comes back with
    /// `refcount == 1` and the caller's type tag.
    pub fn alloc_pages(&self, order: u8, kind: PageKind) -> Option<PhysAddr> {
        if order > MAX_ORDER {
            crate::warn!("buddy: allocation order {} out of range", order);
            return None;
        }

        // Lock the requested pool; on miss, scan upward holding the locks
        // in ascending order.
        let mut guards: Vec<SpinLockGuard<'_, Vec<Pfn>>> = Vec::new();
        guards.push(self.free_lists[order as usize].lock());

        let mut found: Option<(Pfn, u8)> = None;
        if let Some(pfn) = guards[0].pop() {
            found = Some((pfn, order));
        } else {
            for m in order + 1..=MAX_ORDER {
                let mut g = self.free_lists[m as usize].lock();
                let hit = g.pop();
                guards.push(g);
                if let Some(pfn) = hit {
                    found = Some((pfn, m));
                    break;
                }
            }
        }

        let (pfn, got_order) = match found {
            Some(f) => f,
            None => {
                crate::warn!("buddy: out of memory at order {}", order);
                return None;
            }
        };

        // Split down to the requested order, filing the upper halves into
        // the intermediate pools.
        let mut o = got_order;
        while o > order {
            o -= 1;
            let upper = pfn + (1usize << o);
            self.commit_free_block(upper, o);
            guards[(o - order) as usize].push(upper);
        }

        // Release the higher-order locks while still holding `order`'s.
        guards.truncate(1);
        self.init_allocated(pfn, order, kind);
        drop(guards);

        self.free_count.fetch_sub(1 << order, Ordering::Relaxed);
        self.zero_block(pfn, order);
        Some(pfn_to_pa(pfn))
    }

    /// Free a 2^order block whose references have all been dropped.
    ///
    /// Freeing a live block, a buddy tail, a misaligned base, or a block
    /// that is already free is a programmer error and panics.
    pub fn free_pages(&self, pa: PhysAddr, order: u8) {
        assert!(order <= MAX_ORDER, "buddy: free order {} out of range", order);
        let pfn = pa_to_pfn(pa);
        let page = self
            .page(pfn)
            .unwrap_or_else(|| panic!("buddy: free of unmanaged address {:#x}", pa));
        assert!(
            pfn & ((1usize << order) - 1) == 0,
            "buddy: free of unaligned base {:#x} at order {}",
            pa,
            order
        );
        let kind = page.kind();
        assert!(kind != PageKind::Tail, "buddy: free of a buddy tail {:#x}", pa);
        assert!(
            kind != PageKind::Free && kind != PageKind::Merging,
            "buddy: double free of {:#x}",
            pa
        );
        assert!(
            page.refcount() == 0,
            "buddy: free of {:#x} with refcount {}",
            pa,
            page.refcount()
        );
        assert!(
            page.order() == order,
            "buddy: free order {} does not match block order {}",
            order,
            page.order()
        );

        page.set_kind(PageKind::Merging);
        self.free_and_coalesce(pfn, order);
        self.free_count.fetch_add(1 << order, Ordering::Relaxed);
    }

    /// Drop one reference on a block; frees it when the last goes.
    pub fn page_put(&self, pa: PhysAddr) {
        let page = self
            .page_at(pa)
            .unwrap_or_else(|| panic!("buddy: put of unmanaged address {:#x}", pa));
        assert!(page.kind() != PageKind::Tail, "buddy: put on a buddy tail");
        let order = page.order();
        if page.put() == 0 {
            self.free_pages(pa, order);
        }
    }

    pub fn page_get(&self, pa: PhysAddr) {
        let page = self
            .page_at(pa)
            .unwrap_or_else(|| panic!("buddy: get of unmanaged address {:#x}", pa));
        page.get();
    }

    fn free_and_coalesce(&self, mut pfn: Pfn, mut order: u8) {
        loop {
            if order == MAX_ORDER {
                let mut list = self.free_lists[order as usize].lock();
                self.commit_free_block(pfn, order);
                list.push(pfn);
                return;
            }

            let buddy = pfn ^ (1usize << order);
            let mut list = self.free_lists[order as usize].lock();

            // The buddy is only mergeable while it is a free head of equal
            // order sitting in this pool; `Merging` peers are left alone and
            // picked up by whichever free finishes later.
            let mergeable = self
                .page(buddy)
                .map_or(false, |bp| bp.kind() == PageKind::Free && bp.order() == order);

            if !mergeable {
                self.commit_free_block(pfn, order);
                list.push(pfn);
                return;
            }

            match list.iter().position(|&p| p == buddy) {
                Some(i) => {
                    list.swap_remove(i);
                }
                None => {
                    // Free but not filed yet; treat as unmergeable
                    self.commit_free_block(pfn, order);
                    list.push(pfn);
                    return;
                }
            }
            self.page(buddy).unwrap().set_kind(PageKind::Merging);
            drop(list);

            pfn = pfn.min(buddy);
            order += 1;
        }
    }

    /// Write the metadata of a free group: head + back-pointing tails.
    fn commit_free_block(&self, pfn: Pfn, order: u8) {
        let head = self.page(pfn).expect("buddy: block outside managed region");
        head.set_refcount(0);
        head.set_order(order);
        head.set_payload(0);
        head.set_kind(PageKind::Free);
        for i in 1..1usize << order {
            let tail = self.page(pfn + i).expect("buddy: tail outside managed region");
            tail.set_refcount(0);
            tail.set_order(0);
            tail.set_payload(pfn);
            tail.set_kind(PageKind::Tail);
        }
    }

    /// Re-initialize the pages of a claimed block for its new owner.
    fn init_allocated(&self, pfn: Pfn, order: u8, kind: PageKind) {
        for i in 0..1usize << order {
            let page = self.page(pfn + i).expect("buddy: block outside managed region");
            page.set_refcount(1);
            page.set_order(if i == 0 { order } else { 0 });
            page.set_payload(0);
            page.set_kind(kind);
        }
    }

    fn zero_block(&self, _pfn: Pfn, _order: u8) {
        #[cfg(all(target_arch = "riscv64", target_os = "none"))]
        unsafe {
            let ptr = pfn_to_pa(_pfn) as usize as *mut u8;
            core::ptr::write_bytes(ptr, 0, PAGE_SIZE << _order);
        }
    }

    pub fn stats(&self) -> AllocStats {
        let total = self.total_count.load(Ordering::Relaxed);
        let free = self.free_count.load(Ordering::Relaxed);
        AllocStats {
            total_pages: total,
            free_pages: free,
            allocated_pages: total - free,
        }
    }

    /// Number of free group heads currently filed at `order`.
    pub fn free_heads(&self, order: u8) -> usize {
        self.free_lists[order as usize].lock().len()
    }
}

/// Global pool backing the kernel
static POOL: Once<BuddyPool> = Once::new();

/// Initialize the kernel's buddy pool from the DTB RAM ranges.
pub fn init_buddy(ram_ranges: &[(PhysAddr, usize)]) -> Result<(), KernelError> {
    let pool = BuddyPool::init(ram_ranges)?;
    POOL.call_once(|| pool);
    Ok(())
}

pub fn pool() -> Option<&'static BuddyPool> {
    POOL.get()
}

pub fn alloc_page(kind: PageKind) -> Option<PhysAddr> {
    pool()?.alloc_page(kind)
}

pub fn alloc_pages(order: u8, kind: PageKind) -> Option<PhysAddr> {
    pool()?.alloc_pages(order, kind)
}

pub fn free_pages(pa: PhysAddr, order: u8) {
    pool().expect("buddy: not initialized").free_pages(pa, order);
}

pub fn page_put(pa: PhysAddr) {
    pool().expect("buddy: not initialized").page_put(pa);
}

pub fn page_get(pa: PhysAddr) {
    pool().expect("buddy: not initialized").page_get(pa);
}

/// Descriptor of the page containing `pa`, if managed.
pub fn lookup_page(pa: PhysAddr) -> Option<&'static Page> {
    pool()?.page_at(pa)
}

pub fn get_stats() -> Option<AllocStats> {
    pool().map(|p| p.stats())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Hand a leaked host buffer to a private pool so slab/object tests can
    /// read and write real memory through "physical" addresses.
    pub fn leaked_range(bytes: usize) -> (PhysAddr, usize) {
        let buf = alloc::vec![0u8; bytes].leak();
        (buf.as_ptr() as u64, buf.len())
    }

    pub fn new_test_pool(bytes: usize) -> BuddyPool {
        let range = leaked_range(bytes);
        BuddyPool::init(&[range]).expect("test pool")
    }

    /// Global pool for tests that exercise the kernel-facing entry points.
    pub fn ensure_global_pool() {
        POOL.call_once(|| BuddyPool::init(&[leaked_range(4 << 20)]).expect("global test pool"));
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::new_test_pool;
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn alloc_free_restores_census() {
        let pool = new_test_pool(1 << 20);
        let before = pool.stats();
        let pa = pool.alloc_pages(2, PageKind::Anon).expect("alloc");
        assert_eq!(pool.stats().free_pages, before.free_pages - 4);
        pool.page_put(pa);
        assert_eq!(pool.stats().free_pages, before.free_pages);
    }

    #[test]
    fn order_out_of_range_fails() {
        let pool = new_test_pool(1 << 20);
        assert!(pool.alloc_pages(MAX_ORDER + 1, PageKind::Anon).is_none());
    }

    #[test]
    fn exhausted_pool_returns_none() {
        // A 16-page pool can never satisfy a max-order block
        let pool = new_test_pool(16 * PAGE_SIZE);
        assert!(pool.alloc_pages(MAX_ORDER, PageKind::Anon).is_none());
    }

    #[test]
    fn split_produces_adjacent_pages_and_merge_restores_group() {
        let pool = new_test_pool(256 * PAGE_SIZE);
        // Drain order-0/1 so the next two singles come from one split chain
        let heads1_before = pool.free_heads(1);

        let a = pool.alloc_page(PageKind::Anon).expect("a");
        let b = pool.alloc_page(PageKind::Anon).expect("b");
        if pa_to_pfn(a) ^ 1 == pa_to_pfn(b) {
            // a and b are buddies: freeing both must coalesce one level up
            pool.page_put(a);
            pool.page_put(b);
            assert_eq!(pool.free_heads(1), heads1_before);
            assert_eq!(pool.free_heads(0), 0);
        } else {
            pool.page_put(a);
            pool.page_put(b);
        }
    }

    #[test]
    fn buddy_merge_forms_higher_order_head() {
        // A pool of exactly one order-1 group
        let pool = new_test_pool(8 * PAGE_SIZE);
        // Find the order with the single aligned block
        let a = pool.alloc_page(PageKind::Anon).expect("a");
        let b = pool.alloc_page(PageKind::Anon).expect("b");
        let merged_order_heads = |pool: &BuddyPool| -> usize {
            (1..=MAX_ORDER).map(|o| pool.free_heads(o)).sum()
        };
        let mid = merged_order_heads(&pool);
        pool.page_put(a);
        pool.page_put(b);
        assert!(merged_order_heads(&pool) > mid || pool.free_heads(0) == 0);
    }

    #[test]
    fn tail_pages_point_at_their_head() {
        let pool = new_test_pool(1 << 20);
        let pa = pool.alloc_pages(0, PageKind::Anon).expect("alloc");
        pool.page_put(pa);
        // After the free, coalescing may have filed pa under a larger head;
        // if it is now a tail it must back-point into the managed range.
        let page = pool.page_at(pa).unwrap();
        if page.kind() == PageKind::Tail {
            let head = page.payload();
            assert!(head >= pool.base_pfn && head < pool.base_pfn + pool.num_pages);
        }
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let pool = new_test_pool(1 << 20);
        let pa = pool.alloc_page(PageKind::Anon).expect("alloc");
        pool.page_put(pa);
        pool.free_pages(pa, 0);
    }

    #[test]
    #[should_panic(expected = "refcount")]
    fn free_with_live_reference_panics() {
        let pool = new_test_pool(1 << 20);
        let pa = pool.alloc_page(PageKind::Anon).expect("alloc");
        pool.free_pages(pa, 0);
    }

    #[test]
    #[should_panic(expected = "unaligned")]
    fn free_of_unaligned_base_panics() {
        let pool = new_test_pool(1 << 20);
        let pa = pool.alloc_pages(1, PageKind::Anon).expect("alloc");
        let page = pool.page_at(pa).unwrap();
        page.put();
        pool.free_pages(pa + PAGE_SIZE as u64, 1);
    }

    proptest! {
        // Each case leaks its backing buffer; keep the count small
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn census_restored_for_any_order_sequence(orders in proptest::collection::vec(0u8..4, 1..12)) {
            let pool = new_test_pool(1 << 20);
            let before = pool.stats().free_pages;
            let mut held = alloc::vec::Vec::new();
            for o in &orders {
                if let Some(pa) = pool.alloc_pages(*o, PageKind::Anon) {
                    held.push(pa);
                }
            }
            for pa in held {
                pool.page_put(pa);
            }
            prop_assert_eq!(pool.stats().free_pages, before);
        }
    }
}
