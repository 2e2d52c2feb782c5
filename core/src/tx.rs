//! Transaction dispatcher (§9 "Deep inheritance / dynamic dispatch"): a
//! closed tagged union over `nType`. Each variant carries its own payload
//! struct; validation and apply functions are selected by a `match`, never
//! by virtual dispatch — mirrors the teacher's `entrypoints/execute.rs`
//! dispatch-by-message-variant shape, generalized off `ExecuteMsg` onto
//! `TxType`.
//!
//! HTLC CREATE/CLAIM/REFUND (§4.5.5) have no `nType` of their own: they ride
//! on `TX_TRANSFER_M1`'s shape, since an HTLC output is still M1 value, just
//! held in a P2SH-shaped output instead of a receipt UTXO. `TransferPayload`
//! carries an optional [`HtlcAction`] recognized by the submitter (the
//! on-chain script alone cannot reveal which P2SH outputs are HTLCs; that
//! binding is asserted here and checked against the redeem script).

use bitcoin::{OutPoint, Transaction, Txid};

use bathron_types::{rejects, BathronResult, ValidationResult};

use crate::btc::spv::Store as SpvStore;
use crate::burn::{BurnEngine, MerkleBlockProof, PendingMint};
use crate::kv::WriteBatch;
use crate::ledger::{BtcHeadersPayload, Ledger, MasternodeRegistry};
use crate::script::{
    build_htlc3s_redeem_script, build_htlc_redeem_script, Hash256, Htlc3sRecord, HtlcEngine,
    HtlcRecord, HtlcStatus, Resolve3Branch, ResolveBranch,
};
use crate::settlement::{Address, BlockDelta, M1Receipt, Settlement, SettlementTx};

fn txid_bytes(txid: &Txid) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&txid.to_vec());
    out
}

// --- per-type payloads -------------------------------------------------

pub struct LockPayload {
    pub source: Address,
    pub receipt_vout: u32,
}

pub struct UnlockPayload {
    pub receipt_outpoint: OutPoint,
    pub vault_outpoint: OutPoint,
    pub dest: Address,
    pub canonical_fee_index: usize,
}

/// Parameters for an HTLC CREATE riding on a `TX_TRANSFER_M1` (§4.5.5).
pub struct HtlcCreateIntent {
    pub htlc_vout: u32,
    pub source_receipt: OutPoint,
    pub hashlock: Hash256,
    pub timelock: i64,
    pub dest_a: [u8; 20],
    pub dest_b: [u8; 20],
    pub covenant: Option<Hash256>,
    pub claim_key_id: [u8; 20],
    pub refund_key_id: [u8; 20],
    pub covenant_fee: u64,
    pub expiry_height: u32,
}

pub struct Htlc3sCreateIntent {
    pub htlc_vout: u32,
    pub source_receipt: OutPoint,
    pub hashlocks: (Hash256, Hash256, Hash256),
    pub timelock: i64,
    pub dest_a: [u8; 20],
    pub dest_b: [u8; 20],
    pub covenant: Option<Hash256>,
    pub claim_key_id: [u8; 20],
    pub refund_key_id: [u8; 20],
    pub covenant_fee: u64,
    pub expiry_height: u32,
}

pub enum HtlcAction {
    Create(HtlcCreateIntent),
    Create3(Htlc3sCreateIntent),
    Resolve {
        outpoint: OutPoint,
        result_vout: u32,
        branch: ResolveBranch,
    },
    Resolve3 {
        outpoint: OutPoint,
        result_vout: u32,
        branch: Resolve3Branch,
    },
}

pub struct TransferPayload {
    pub inputs: Vec<OutPoint>,
    pub canonical_fee_index: usize,
    pub htlc_action: Option<HtlcAction>,
}

pub struct BurnClaimPayload {
    pub raw_tx: Transaction,
    pub proof: MerkleBlockProof,
}

/// `TX_MINT_M0BTC` (§6.1): the only field an external submitter could
/// supply is `btc_txid` — everything else (`dest`, `amount`) is looked up
/// from the matching `PendingMint` so a forged payload can't mint to the
/// wrong address. In practice this variant is only ever manufactured by the
/// block processor's matured-claim scan (§4.3 "Delayed mint"), never by an
/// external submitter, but it still goes through this same dispatcher.
pub struct MintPayload {
    pub btc_txid: [u8; 32],
}

pub struct BtcHeadersTxPayload {
    pub payload: BtcHeadersPayload,
}

pub enum TxPayload {
    Lock(LockPayload),
    Unlock(UnlockPayload),
    Transfer(TransferPayload),
    BurnClaim(BurnClaimPayload),
    Mint(MintPayload),
    BtcHeaders(BtcHeadersTxPayload),
}

/// One transaction as seen by the dispatcher: the generic settlement shape
/// (used uniformly by `CheckTransaction`, §4.4.3) plus the variant-specific
/// payload.
pub struct Tx {
    pub txid: Txid,
    pub height: u32,
    pub is_coinbase: bool,
    pub settlement: SettlementTx,
    pub payload: TxPayload,
}

impl Tx {
    fn txid_bytes(&self) -> [u8; 32] {
        txid_bytes(&self.txid)
    }

    fn outpoint(&self, vout: u32) -> OutPoint {
        OutPoint {
            txid: self.txid,
            vout,
        }
    }
}

/// Undo data a caller (the block processor) must keep around to disconnect
/// this transaction later — settlement/ itself has no undo keys (§6.4), so
/// whatever apply() can't recompute from the transaction body alone comes
/// back here, the same way Bitcoin Core's `CTxUndo` carries spent coins
/// alongside the block it disconnects.
pub enum TxUndo {
    Lock,
    Unlock {
        original_receipt: M1Receipt,
        vault_outpoint: OutPoint,
        credited: u64,
    },
    Transfer {
        output_outpoints: Vec<OutPoint>,
        consumed_receipts: Vec<(OutPoint, M1Receipt)>,
    },
    BurnClaim {
        mature_at: u32,
    },
    Mint {
        pending: PendingMint,
    },
    BtcHeaders,
}

/// Wires C2-C5 together behind the single dispatch point (§2 "Data flow per
/// block"). Holds no state of its own; every component keeps its own.
pub struct TxProcessor<'a> {
    pub settlement: &'a Settlement,
    pub burn: &'a BurnEngine,
    pub ledger: &'a Ledger,
    pub spv: &'a SpvStore,
    pub htlc: &'a HtlcEngine,
    pub registry: &'a dyn MasternodeRegistry,
}

impl<'a> TxProcessor<'a> {
    pub fn new(
        settlement: &'a Settlement,
        burn: &'a BurnEngine,
        ledger: &'a Ledger,
        spv: &'a SpvStore,
        htlc: &'a HtlcEngine,
        registry: &'a dyn MasternodeRegistry,
    ) -> Self {
        TxProcessor {
            settlement,
            burn,
            ledger,
            spv,
            htlc,
            registry,
        }
    }

    /// Validates and applies one transaction, returning its net settlement
    /// delta (zero for variants that never touch the vault) and the undo
    /// data needed to disconnect it.
    pub fn apply(
        &self,
        batch: &mut WriteBatch,
        tx: &Tx,
        is_genesis_block: bool,
        current_bathron_height: u32,
    ) -> ValidationResult<(BlockDelta, TxUndo)> {
        self.settlement.check_transaction(&tx.settlement, tx.is_coinbase)?;

        match &tx.payload {
            TxPayload::Lock(p) => {
                let receipt_outpoint = tx.outpoint(p.receipt_vout);
                let delta = self.settlement.apply_lock(
                    batch,
                    &tx.settlement,
                    receipt_outpoint,
                    &p.source,
                    tx.height,
                )?;
                Ok((delta, TxUndo::Lock))
            }
            TxPayload::Unlock(p) => {
                let original_receipt = self
                    .settlement
                    .receipt(&p.receipt_outpoint)
                    .map_err(|e| rejects::bad_settlement_receipt_missing(e.to_string()))?
                    .ok_or_else(|| rejects::bad_settlement_receipt_missing("receipt not found"))?;
                let fee = self
                    .settlement
                    .verify_fee_output(&tx.settlement, p.canonical_fee_index)?;
                let credited = original_receipt
                    .amount
                    .checked_sub(fee)
                    .ok_or_else(|| rejects::bad_settlement_invariant("fee exceeds receipt amount"))?;
                let delta = self.settlement.apply_unlock(
                    batch,
                    &tx.settlement,
                    &p.receipt_outpoint,
                    &p.vault_outpoint,
                    &p.dest,
                    p.canonical_fee_index,
                )?;
                Ok((
                    delta,
                    TxUndo::Unlock {
                        original_receipt,
                        vault_outpoint: p.vault_outpoint,
                        credited,
                    },
                ))
            }
            TxPayload::Transfer(p) => self.apply_transfer(batch, tx, p),
            TxPayload::BurnClaim(p) => self.apply_burn_claim(batch, tx, p),
            TxPayload::Mint(p) => self.apply_mint(batch, tx, p),
            TxPayload::BtcHeaders(p) => {
                self.ledger.validate_publication(
                    &p.payload,
                    self.spv,
                    self.registry,
                    is_genesis_block,
                    current_bathron_height,
                )?;
                self.ledger
                    .apply(batch, &p.payload, current_bathron_height)
                    .map_err(|e| rejects::bad_btcheaders_payload(e.to_string()))?;
                Ok((BlockDelta::default(), TxUndo::BtcHeaders))
            }
        }
    }

    fn apply_transfer(
        &self,
        batch: &mut WriteBatch,
        tx: &Tx,
        p: &TransferPayload,
    ) -> ValidationResult<(BlockDelta, TxUndo)> {
        match &p.htlc_action {
            None => {
                let output_outpoints = plain_output_outpoints(tx, p.canonical_fee_index);
                let mut consumed_receipts = Vec::with_capacity(p.inputs.len());
                for op in &p.inputs {
                    let receipt = self
                        .settlement
                        .receipt(op)
                        .map_err(|e| rejects::bad_settlement_receipt_missing(e.to_string()))?
                        .ok_or_else(|| rejects::bad_settlement_receipt_missing("receipt not found"))?;
                    consumed_receipts.push((*op, receipt));
                }
                let delta = self.settlement.apply_transfer(
                    batch,
                    &tx.settlement,
                    &p.inputs,
                    &output_outpoints,
                    tx.height,
                    p.canonical_fee_index,
                )?;
                Ok((
                    delta,
                    TxUndo::Transfer {
                        output_outpoints,
                        consumed_receipts,
                    },
                ))
            }
            Some(HtlcAction::Create(intent)) => self.apply_htlc_create(batch, tx, p, intent),
            Some(HtlcAction::Create3(intent)) => self.apply_htlc_create3(batch, tx, p, intent),
            Some(HtlcAction::Resolve {
                outpoint,
                result_vout,
                branch,
            }) => self.apply_htlc_resolve(batch, tx, *outpoint, *result_vout, branch),
            Some(HtlcAction::Resolve3 {
                outpoint,
                result_vout,
                branch,
            }) => self.apply_htlc_resolve3(batch, tx, *outpoint, *result_vout, branch),
        }
    }

    /// CREATE, 1-secret (§4.5.5): consume one M1 receipt, verify the fee and
    /// the P2SH output's redeem script/amount, emit the HTLC record.
    fn apply_htlc_create(
        &self,
        batch: &mut WriteBatch,
        tx: &Tx,
        p: &TransferPayload,
        intent: &HtlcCreateIntent,
    ) -> ValidationResult<(BlockDelta, TxUndo)> {
        let fee = self
            .settlement
            .verify_fee_output(&tx.settlement, p.canonical_fee_index)?;
        let receipt = self.settlement.consume_receipt(batch, &intent.source_receipt)?;
        let amount = receipt
            .amount
            .checked_sub(fee)
            .ok_or_else(|| rejects::bad_settlement_invariant("fee exceeds receipt amount"))?;

        let redeem_script = build_htlc_redeem_script(
            &intent.hashlock,
            intent.timelock,
            &intent.dest_a,
            &intent.dest_b,
            intent.covenant.as_ref(),
        );
        let out = tx
            .settlement
            .vout
            .get(intent.htlc_vout as usize)
            .ok_or_else(|| rejects::bad_htlc_script_malformed("htlc output index out of range"))?;
        if out.script_pubkey != redeem_script.to_p2sh() {
            return Err(rejects::bad_htlc_script_malformed(
                "htlc output does not match redeem script",
            ));
        }
        if out.value != amount {
            return Err(rejects::bad_settlement_invariant(
                "htlc output value does not equal receipt amount minus fee",
            ));
        }

        let htlc_outpoint = tx.outpoint(intent.htlc_vout);
        let record = HtlcRecord {
            htlc_outpoint,
            hashlock: intent.hashlock,
            source_receipt: intent.source_receipt,
            amount,
            redeem_script: redeem_script.into_bytes(),
            claim_key_id: intent.claim_key_id,
            refund_key_id: intent.refund_key_id,
            template_commitment: intent.covenant,
            covenant_fee: intent.covenant_fee,
            create_height: tx.height,
            expiry_height: intent.expiry_height,
            status: HtlcStatus::Active,
            resolve_txid: None,
            preimage: None,
            result_receipt: None,
        };
        self.htlc.create(batch, &record, tx.txid_bytes())?;
        Ok((
            BlockDelta::default(),
            TxUndo::Transfer {
                output_outpoints: Vec::new(),
                consumed_receipts: vec![(intent.source_receipt, receipt)],
            },
        ))
    }

    /// CREATE, 3-secret (§4.5.3/§4.5.5).
    fn apply_htlc_create3(
        &self,
        batch: &mut WriteBatch,
        tx: &Tx,
        p: &TransferPayload,
        intent: &Htlc3sCreateIntent,
    ) -> ValidationResult<(BlockDelta, TxUndo)> {
        let fee = self
            .settlement
            .verify_fee_output(&tx.settlement, p.canonical_fee_index)?;
        let receipt = self.settlement.consume_receipt(batch, &intent.source_receipt)?;
        let amount = receipt
            .amount
            .checked_sub(fee)
            .ok_or_else(|| rejects::bad_settlement_invariant("fee exceeds receipt amount"))?;

        let redeem_script = build_htlc3s_redeem_script(
            &intent.hashlocks,
            intent.timelock,
            &intent.dest_a,
            &intent.dest_b,
            intent.covenant.as_ref(),
        );
        let out = tx
            .settlement
            .vout
            .get(intent.htlc_vout as usize)
            .ok_or_else(|| rejects::bad_htlc3s_script_malformed("htlc output index out of range"))?;
        if out.script_pubkey != redeem_script.to_p2sh() {
            return Err(rejects::bad_htlc3s_script_malformed(
                "htlc output does not match redeem script",
            ));
        }
        if out.value != amount {
            return Err(rejects::bad_settlement_invariant(
                "htlc output value does not equal receipt amount minus fee",
            ));
        }

        let htlc_outpoint = tx.outpoint(intent.htlc_vout);
        let record = Htlc3sRecord {
            htlc_outpoint,
            hashlock_user: intent.hashlocks.0,
            hashlock_lp1: intent.hashlocks.1,
            hashlock_lp2: intent.hashlocks.2,
            source_receipt: intent.source_receipt,
            amount,
            redeem_script: redeem_script.into_bytes(),
            claim_key_id: intent.claim_key_id,
            refund_key_id: intent.refund_key_id,
            template_commitment: intent.covenant,
            covenant_fee: intent.covenant_fee,
            create_height: tx.height,
            expiry_height: intent.expiry_height,
            status: HtlcStatus::Active,
            resolve_txid: None,
            preimages: None,
            result_receipt: None,
        };
        self.htlc.create3(batch, &record, tx.txid_bytes())?;
        Ok((
            BlockDelta::default(),
            TxUndo::Transfer {
                output_outpoints: Vec::new(),
                consumed_receipts: vec![(intent.source_receipt, receipt)],
            },
        ))
    }

    /// CLAIM or REFUND, 1-secret (§4.5.5): no fee output required.
    fn apply_htlc_resolve(
        &self,
        batch: &mut WriteBatch,
        tx: &Tx,
        outpoint: OutPoint,
        result_vout: u32,
        branch: &ResolveBranch,
    ) -> ValidationResult<(BlockDelta, TxUndo)> {
        let result_receipt = tx.outpoint(result_vout);
        let branch_owned = clone_resolve_branch(branch);
        let record = self.htlc.resolve(
            batch,
            &outpoint,
            tx.txid_bytes(),
            tx.height,
            branch_owned,
            result_receipt,
        )?;
        self.settlement
            .create_receipt(batch, &result_receipt, record.amount, tx.height)
            .map_err(|e| rejects::bad_htlc_script_malformed(e.to_string()))?;
        Ok((
            BlockDelta::default(),
            TxUndo::Transfer {
                output_outpoints: vec![result_receipt],
                consumed_receipts: Vec::new(),
            },
        ))
    }

    fn apply_htlc_resolve3(
        &self,
        batch: &mut WriteBatch,
        tx: &Tx,
        outpoint: OutPoint,
        result_vout: u32,
        branch: &Resolve3Branch,
    ) -> ValidationResult<(BlockDelta, TxUndo)> {
        let result_receipt = tx.outpoint(result_vout);
        let branch_owned = clone_resolve3_branch(branch);
        let record = self.htlc.resolve3(
            batch,
            &outpoint,
            tx.txid_bytes(),
            tx.height,
            branch_owned,
            result_receipt,
        )?;
        self.settlement
            .create_receipt(batch, &result_receipt, record.amount, tx.height)
            .map_err(|e| rejects::bad_htlc3s_script_malformed(e.to_string()))?;
        Ok((
            BlockDelta::default(),
            TxUndo::Transfer {
                output_outpoints: vec![result_receipt],
                consumed_receipts: Vec::new(),
            },
        ))
    }

    /// `TX_BURN_CLAIM` (§4.3 steps 1-7): parse the burn outputs, validate
    /// the merkle proof and confirmation depth against C2, schedule the
    /// delayed mint.
    fn apply_burn_claim(
        &self,
        batch: &mut WriteBatch,
        tx: &Tx,
        p: &BurnClaimPayload,
    ) -> ValidationResult<(BlockDelta, TxUndo)> {
        let btc_txid = p.raw_tx.txid();
        let burn_height = self
            .burn
            .validate_claim(self.ledger, self.spv, &btc_txid, &p.proof)?;
        let (dest_hash160, amount_sats, _network_tag) = self.burn.parse_burn_outputs(&p.raw_tx)?;
        self.burn
            .submit(batch, &btc_txid, burn_height, dest_hash160, amount_sats)
            .map_err(|e| rejects::bad_burn_unknown_block(e.to_string()))?;
        let mature_at = burn_height + self.burn.confirmations_k();
        let _ = tx;
        Ok((BlockDelta::default(), TxUndo::BurnClaim { mature_at }))
    }

    /// `TX_MINT_M0BTC` (§4.3 "Delayed mint"): looks up the matured claim by
    /// `btc_txid` and credits M0, rather than trusting a submitted amount.
    fn apply_mint(
        &self,
        batch: &mut WriteBatch,
        tx: &Tx,
        p: &MintPayload,
    ) -> ValidationResult<(BlockDelta, TxUndo)> {
        let _ = tx;
        let pending = self
            .burn
            .get_pending(&p.btc_txid)
            .map_err(|e| rejects::bad_burn_not_pending(e.to_string()))?
            .ok_or_else(|| rejects::bad_burn_not_pending("no matching pending mint"))?;
        self.settlement
            .apply_mint(batch, &pending.dest_hash160, pending.amount_sats)
            .map_err(|e| rejects::bad_burn_not_pending(e.to_string()))?;
        self.burn.mark_minted(batch, &pending);
        Ok((BlockDelta::default(), TxUndo::Mint { pending }))
    }

    /// Disconnects a previously-applied transaction (reorg path), the
    /// mirror image of [`Self::apply`].
    pub fn disconnect(&self, batch: &mut WriteBatch, tx: &Tx, undo: TxUndo) -> BathronResult<BlockDelta> {
        match (&tx.payload, undo) {
            (TxPayload::Lock(p), TxUndo::Lock) => {
                let receipt_outpoint = tx.outpoint(p.receipt_vout);
                self.settlement
                    .disconnect_lock(batch, &tx.settlement, &receipt_outpoint, &p.source)
            }
            (
                TxPayload::Unlock(p),
                TxUndo::Unlock {
                    original_receipt,
                    vault_outpoint,
                    credited,
                },
            ) => self.settlement.disconnect_unlock(
                batch,
                &p.receipt_outpoint,
                &vault_outpoint,
                &original_receipt,
                &p.dest,
                credited,
            ),
            (
                TxPayload::Transfer(_),
                TxUndo::Transfer {
                    output_outpoints,
                    consumed_receipts,
                },
            ) => self
                .settlement
                .disconnect_transfer(batch, &output_outpoints, &consumed_receipts),
            (TxPayload::BurnClaim(p), TxUndo::BurnClaim { mature_at }) => {
                let btc_txid = p.raw_tx.txid();
                self.burn.disconnect_claim(batch, &btc_txid, mature_at);
                Ok(BlockDelta::default())
            }
            (TxPayload::Mint(_), TxUndo::Mint { pending }) => {
                self.settlement
                    .disconnect_mint(batch, &pending.dest_hash160, pending.amount_sats)?;
                self.burn.restore_pending(batch, &pending)?;
                Ok(BlockDelta::default())
            }
            (TxPayload::BtcHeaders(p), TxUndo::BtcHeaders) => {
                self.ledger.disconnect(batch, &p.payload)?;
                Ok(BlockDelta::default())
            }
            _ => Err(bathron_types::BathronError::Other(
                "tx/undo variant mismatch".into(),
            )),
        }
    }
}

/// The outpoints `TX_TRANSFER_M1` (without an HTLC action) assigns new
/// receipts to: every output except the canonical fee index and any
/// `OP_TRUE` vault-shaped output (which would be rejected by the OP_TRUE
/// gate anyway, but this mirrors `Settlement::apply_transfer`'s own filter).
fn plain_output_outpoints(tx: &Tx, canonical_fee_index: usize) -> Vec<OutPoint> {
    tx.settlement
        .vout
        .iter()
        .enumerate()
        .filter(|(i, o)| *i != canonical_fee_index && !crate::settlement::is_vault_output(&o.script_pubkey))
        .map(|(i, _)| tx.outpoint(i as u32))
        .collect()
}

fn clone_resolve_branch(branch: &ResolveBranch) -> ResolveBranch {
    match branch {
        ResolveBranch::Claim {
            preimage,
            claim_tx_template,
        } => ResolveBranch::Claim {
            preimage: preimage.clone(),
            claim_tx_template: claim_tx_template.as_ref().map(clone_template_tx),
        },
        ResolveBranch::Refund => ResolveBranch::Refund,
    }
}

fn clone_resolve3_branch(branch: &Resolve3Branch) -> Resolve3Branch {
    match branch {
        Resolve3Branch::Claim {
            preimages,
            claim_tx_template,
        } => Resolve3Branch::Claim {
            preimages: preimages.clone(),
            claim_tx_template: claim_tx_template.as_ref().map(clone_template_tx),
        },
        Resolve3Branch::Refund => Resolve3Branch::Refund,
    }
}

fn clone_template_tx(tx: &crate::script::TemplateTx) -> crate::script::TemplateTx {
    crate::script::TemplateTx {
        version: tx.version,
        tx_type: tx.tx_type,
        locktime: tx.locktime,
        inputs: tx.inputs.clone(),
        outputs: tx.outputs.clone(),
    }
}
