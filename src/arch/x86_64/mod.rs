pub mod kernel;

pub use memory_addresses::{PhysAddr, VirtAddr};
