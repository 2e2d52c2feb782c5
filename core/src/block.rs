//! Block connect/disconnect orchestration (§2 "Data flow per block", §5
//! "Concurrency & Resource Model"): one ordering lock serializes every
//! block, `TxProcessor` dispatches each transaction, and the resulting
//! `WriteBatch` spanning all four component databases commits atomically.
//!
//! Undo data is kept in memory, keyed by height, rather than given its own
//! on-disk file the way Bitcoin Core's `CBlockUndo` is — `settlement/`'s key
//! schema has no undo keys of its own (§6.4), and the spec names the block
//! index and coins view as resources that exist *alongside* the four named
//! component databases, not inside them. Reorg depth is therefore bounded
//! by process lifetime, the same "best effort below min_supported_height"
//! stance C1/C2 already take.

use std::collections::HashMap;
use std::sync::Mutex;

use bitcoin::Txid;

use bathron_types::{rejects, BathronError, BathronResult, TxType, ValidationResult};

use crate::btc::spv::Store as SpvStore;
use crate::burn::BurnEngine;
use crate::kv::Database;
use crate::ledger::{Ledger, MasternodeRegistry};
use crate::script::HtlcEngine;
use crate::settlement::{BlockDelta, Settlement, SettlementTx};
use crate::tx::{MintPayload, Tx, TxPayload, TxProcessor, TxUndo};

/// One BATHRON block as seen by the processor: just its ordered
/// transactions. Header fields, PoW, and weight accounting belong to
/// whatever owns the block index — out of scope here (§1).
pub struct Block {
    pub height: u32,
    pub txs: Vec<Tx>,
}

struct BlockUndo {
    applied: Vec<(Tx, TxUndo)>,
}

/// Serializes block connect/disconnect behind one lock, mirroring Bitcoin
/// Core's `cs_main` (§5 "single ordering lock"). Holds no component state of
/// its own — only the undo history needed to reverse what it applied.
pub struct BlockProcessor<'a> {
    settlement: &'a Settlement,
    burn: &'a BurnEngine,
    ledger: &'a Ledger,
    spv: &'a SpvStore,
    htlc: &'a HtlcEngine,
    registry: &'a dyn MasternodeRegistry,
    db: &'a Database,
    order_lock: Mutex<()>,
    undo_log: Mutex<HashMap<u32, BlockUndo>>,
}

impl<'a> BlockProcessor<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settlement: &'a Settlement,
        burn: &'a BurnEngine,
        ledger: &'a Ledger,
        spv: &'a SpvStore,
        htlc: &'a HtlcEngine,
        registry: &'a dyn MasternodeRegistry,
        db: &'a Database,
    ) -> Self {
        BlockProcessor {
            settlement,
            burn,
            ledger,
            spv,
            htlc,
            registry,
            db,
            order_lock: Mutex::new(()),
            undo_log: Mutex::new(HashMap::new()),
        }
    }

    fn processor(&self) -> TxProcessor<'_> {
        TxProcessor::new(self.settlement, self.burn, self.ledger, self.spv, self.htlc, self.registry)
    }

    /// Connects one block: applies every submitted transaction in order
    /// (§5 "Ordering guarantees" — within a block, settlement TXs are
    /// applied in the order they appear), then auto-emits a `TX_MINT_M0BTC`
    /// for every burn claim that has matured by C2's current tip (§4.3
    /// "Delayed mint"), then checks I6 once over the whole batch before
    /// committing atomically.
    pub fn connect(&self, block: Block) -> ValidationResult<()> {
        let _guard = self.order_lock.lock().unwrap();

        let is_genesis_block = block.height == 0;
        let processor = self.processor();

        let mut batch = self.db.batch();
        let mut delta = BlockDelta::default();
        let mut applied = Vec::with_capacity(block.txs.len());

        for tx in block.txs {
            let (tx_delta, undo) = processor.apply(&mut batch, &tx, is_genesis_block, block.height)?;
            delta.add(tx_delta);
            applied.push((tx, undo));
        }

        let ledger_tip = self
            .ledger
            .tip_height()
            .map_err(|e| rejects::custom(100, "bad-block-ledger-unavailable", e.to_string()))?;
        let matured = self
            .burn
            .matured_at(ledger_tip)
            .map_err(|e| rejects::custom(100, "bad-block-burn-unavailable", e.to_string()))?;
        for pending in matured {
            let mint_tx = Tx {
                txid: Txid::from_slice(&pending.btc_txid).expect("32-byte hash is always a valid txid"),
                height: block.height,
                is_coinbase: false,
                settlement: SettlementTx {
                    n_type: TxType::MintM0Btc,
                    version: 1,
                    vin: Vec::new(),
                    vout: Vec::new(),
                    size_bytes: 0,
                    fee_rate_sat_per_kvb: 0,
                },
                payload: TxPayload::Mint(MintPayload {
                    btc_txid: pending.btc_txid,
                }),
            };
            let (tx_delta, undo) = processor.apply(&mut batch, &mint_tx, is_genesis_block, block.height)?;
            delta.add(tx_delta);
            applied.push((mint_tx, undo));
        }

        self.settlement.finalize_block(&mut batch, delta)?;

        batch
            .commit()
            .map_err(|e| rejects::custom(100, "bad-block-commit-failed", e.to_string()))?;

        self.undo_log
            .lock()
            .unwrap()
            .insert(block.height, BlockUndo { applied });
        Ok(())
    }

    /// Disconnects the block at `height` (reorg path): replays its stored
    /// undo entries in reverse transaction order, including any
    /// auto-emitted `TX_MINT_M0BTC` entries from that block's connect.
    pub fn disconnect(&self, height: u32) -> BathronResult<()> {
        let _guard = self.order_lock.lock().unwrap();

        let undo = self
            .undo_log
            .lock()
            .unwrap()
            .remove(&height)
            .ok_or_else(|| BathronError::Other(format!("no undo data for height {height}")))?;

        let processor = self.processor();
        let mut batch = self.db.batch();
        for (tx, tx_undo) in undo.applied.into_iter().rev() {
            processor.disconnect(&mut batch, &tx, tx_undo)?;
        }
        batch.commit()
    }
}
