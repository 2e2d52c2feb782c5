pub mod header;
pub mod spv;

pub use header::WrappedHeader;
pub use spv::{AddHeaderResult, BtcHeaderIndex, Store as SpvStore};
