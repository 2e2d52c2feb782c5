//! `bathron-consensus`: the settlement-rail consensus core (§0-§9). Five
//! components — SPV header store, on-chain header ledger, burn claim engine,
//! settlement engine, and script engine — wired together by a transaction
//! dispatcher and block-level orchestration.

pub mod block;
pub mod btc;
pub mod burn;
pub mod config;
pub mod kv;
pub mod ledger;
pub mod publisher;
pub mod script;
pub mod settlement;
pub mod tx;

pub use block::{Block, BlockProcessor};
pub use burn::BurnEngine;
pub use config::NetworkParams;
pub use kv::Database;
pub use ledger::{Ledger, MasternodeRegistry};
pub use publisher::{MempoolSink, Publisher};
pub use script::HtlcEngine;
pub use settlement::Settlement;
pub use tx::{Tx, TxPayload, TxProcessor, TxUndo};
