pub mod cache;
pub mod common;
pub mod host;

pub use cache::{db_get_block, Block, Region};
pub use common::HostError;
pub use host::{AmbientContext, EmulatorHost};
