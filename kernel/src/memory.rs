pub mod frame;
pub mod heap;
pub mod pagetable;
pub mod tlb;
