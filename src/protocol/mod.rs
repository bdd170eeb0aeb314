pub mod frame;
pub mod lsdb;
pub mod message_handler;
pub mod messages;
pub mod neighbor;
pub mod router;
pub mod routing_table;
pub mod spf;
pub mod task_manager;

pub use lsdb::*;
pub use messages::*;
pub use neighbor::*;
pub use router::*;
pub use routing_table::*;
