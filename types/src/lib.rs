pub mod adapter;
pub mod error;
pub mod txtype;

pub use adapter::Adapter;
pub use error::{rejects, BathronError, BathronResult, Reject, ValidationResult};
pub use txtype::{FeeCurrency, TxType};
