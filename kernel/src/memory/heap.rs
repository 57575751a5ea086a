use linked_list_allocator::LockedHeap;
use x86_64::VirtAddr;

#[cfg_attr(target_os = "none", global_allocator)]
static HEAP: LockedHeap = LockedHeap::empty();

/// # Safety
///
/// The region must be mapped, unused and must only be handed over once.
pub unsafe fn init(start: VirtAddr, size: usize) {
    unsafe {
        HEAP.lock().init(start.as_mut_ptr(), size);
    }
}
