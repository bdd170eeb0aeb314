pub mod interface;
pub mod manager;
pub mod memory;

pub use interface::*;
pub use manager::*;
pub use memory::*;
