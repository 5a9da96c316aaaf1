//! Kernel heap allocator
//!
//! The `alloc` containers are backed by a linked-list heap over a static
//! region; small allocations are routed through the slab size classes once
//! those are up. Hosted builds use the host allocator, so everything here
//! is bare-metal only apart from the statistics plumbing.

use core::sync::atomic::{AtomicUsize, Ordering};

/// Static heap region size
pub const HEAP_SIZE: usize = 4 * 1024 * 1024;

pub const fn heap_total_size() -> usize {
    HEAP_SIZE
}

static TOTAL_ALLOCS: AtomicUsize = AtomicUsize::new(0);
static TOTAL_FREES: AtomicUsize = AtomicUsize::new(0);

pub fn alloc_count() -> usize {
    TOTAL_ALLOCS.load(Ordering::Relaxed)
}

pub fn free_count() -> usize {
    TOTAL_FREES.load(Ordering::Relaxed)
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
mod bare {
    use super::*;
    use core::alloc::{GlobalAlloc, Layout};
    use core::ptr::NonNull;
    use linked_list_allocator::LockedHeap;

    #[repr(align(64))]
    struct HeapRegion([u8; HEAP_SIZE]);

    static mut HEAP_MEMORY: HeapRegion = HeapRegion([0; HEAP_SIZE]);

    static FALLBACK: LockedHeap = LockedHeap::empty();

    /// Initialize the linked-list heap over the static region. Once, before
    /// the first allocation.
    pub unsafe fn init_heap() {
        let base = core::ptr::addr_of_mut!(HEAP_MEMORY) as *mut u8;
        unsafe { FALLBACK.lock().init(base, HEAP_SIZE) };
        crate::info!("heap: {} KiB linked-list region ready", HEAP_SIZE / 1024);
    }

    struct KernelAllocator;

    unsafe impl GlobalAlloc for KernelAllocator {
        unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
            TOTAL_ALLOCS.fetch_add(1, Ordering::Relaxed);
            if let Some(p) = crate::mm::slab::allocate(layout) {
                return p.as_ptr();
            }
            FALLBACK
                .lock()
                .allocate_first_fit(layout)
                .map(|p| p.as_ptr())
                .unwrap_or(core::ptr::null_mut())
        }

        unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
            TOTAL_FREES.fetch_add(1, Ordering::Relaxed);
            let nn = match NonNull::new(ptr) {
                Some(nn) => nn,
                None => return,
            };
            if unsafe { crate::mm::slab::deallocate(nn, layout) } {
                return;
            }
            unsafe { FALLBACK.lock().deallocate(nn, layout) };
        }
    }

    #[global_allocator]
    static ALLOCATOR: KernelAllocator = KernelAllocator;
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub use bare::init_heap;

/// Hosted builds allocate through the host; nothing to set up.
#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
pub unsafe fn init_heap() {}
