//! C4 Settlement Engine (M0/M1) (§3.4, §4.4): per-address M0 balances, the
//! M1 receipt UTXO set, the communal vault, and the supply invariants.

use bitcoin::blockdata::opcodes::all::OP_RETURN;
use bitcoin::blockdata::script::Script;
use bitcoin::OutPoint;

use bathron_types::{rejects, BathronResult, TxType, ValidationResult};

use crate::kv::{Column, Database, WriteBatch, CF_SETTLEMENT};

pub const MAX_MONEY: u64 = 21_000_000 * 100_000_000;
pub const MAX_TX_SIZE_AFTER_SAPLING: usize = 2_000_000;

/// A 20-byte hash160, used both as a settlement address and as the burn
/// destination (§3.3, §3.4).
pub type Address = [u8; 20];

/// `OP_TRUE` is the single byte `0x51` (Bitcoin's `OP_1`/`OP_TRUE` opcode);
/// the vault/fee-output gate checks for byte-exact equality with this,
/// nothing more (§4.4.1).
pub fn op_true_script() -> Script {
    Script::from(vec![0x51])
}

fn is_exactly_op_true(script: &Script) -> bool {
    script.as_bytes() == [0x51]
}

/// Public alias for C5: HTLC CREATE must confirm a candidate output is *not*
/// a vault output before treating it as the HTLC's P2SH output (§4.4.1's
/// OP_TRUE gate applies just as much to a TRANSFER_M1-shaped HTLC tx).
pub fn is_vault_output(script: &Script) -> bool {
    is_exactly_op_true(script)
}

/// A settlement output: value plus scriptPubKey, the same shape Bitcoin
/// itself uses (§4.4 table, §4.4.1, §4.4.3).
#[derive(Clone, Debug)]
pub struct TxOutput {
    pub value: u64,
    pub script_pubkey: Script,
}

/// A settlement input: a reference to a previously-created receipt or vault
/// output.
#[derive(Clone, Debug)]
pub struct TxInput {
    pub prevout: OutPoint,
}

/// A settlement transaction body, shared by `TX_LOCK`/`TX_UNLOCK`/
/// `TX_TRANSFER_M1` (§4.4). `n_type` drives which validation/apply path runs
/// (§9 "Deep inheritance" — dispatch by variant, never virtual methods).
#[derive(Clone, Debug)]
pub struct SettlementTx {
    pub n_type: TxType,
    pub version: i32,
    pub vin: Vec<TxInput>,
    pub vout: Vec<TxOutput>,
    pub size_bytes: usize,
    pub fee_rate_sat_per_kvb: u64,
}

/// `M1Receipt` (§3.4): a bearer asset, ownership = ability to spend the
/// outpoint.
#[derive(Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct M1Receipt {
    pub amount: u64,
    pub create_height: u32,
}

#[derive(Clone, Copy, Default, serde::Serialize, serde::Deserialize)]
pub struct SupplyCounters {
    pub m0_total: u64,
    pub m0_vaulted: u64,
    pub m1_supply: u64,
}

fn key_balance(addr: &Address) -> Vec<u8> {
    let mut k = vec![b'B'];
    k.extend_from_slice(addr);
    k
}
fn key_receipt(op: &OutPoint) -> Vec<u8> {
    let mut k = vec![b'U'];
    k.extend_from_slice(&op.txid.to_vec());
    k.extend_from_slice(&op.vout.to_be_bytes());
    k
}
fn key_vault(op: &OutPoint) -> Vec<u8> {
    let mut k = vec![b'V'];
    k.extend_from_slice(&op.txid.to_vec());
    k.extend_from_slice(&op.vout.to_be_bytes());
    k
}
fn key_supply() -> Vec<u8> {
    vec![b'S']
}

/// Net change to the vault pool and the receipt supply within one block,
/// accumulated across every settlement TX so I6 can be checked once at
/// end-of-block rather than per-TX (§5 "Ordering guarantees", §4.4 "I6
/// enforcement").
#[derive(Default, Clone, Copy)]
pub struct BlockDelta {
    pub vault_delta: i64,
    pub receipt_delta: i64,
}

impl BlockDelta {
    pub fn add(&mut self, other: BlockDelta) {
        self.vault_delta += other.vault_delta;
        self.receipt_delta += other.receipt_delta;
    }

    /// I6: `Δ M0_vaulted == Δ M1_supply` (§3.4, §4.4, P2).
    pub fn check_i6(&self) -> ValidationResult<()> {
        if self.vault_delta != self.receipt_delta {
            return Err(rejects::bad_settlement_invariant(
                "vault delta does not equal M1 supply delta for this block",
            ));
        }
        Ok(())
    }
}

pub struct Settlement {
    balances: Column<Vec<u8>, u64>,
    receipts: Column<Vec<u8>, M1Receipt>,
    vaults: Column<Vec<u8>, u64>,
    supply: Column<Vec<u8>, SupplyCounters>,
}

impl Settlement {
    pub fn new(db: &Database) -> Self {
        Settlement {
            balances: db.column(CF_SETTLEMENT),
            receipts: db.column(CF_SETTLEMENT),
            vaults: db.column(CF_SETTLEMENT),
            supply: db.column(CF_SETTLEMENT),
        }
    }

    pub fn balance(&self, addr: &Address) -> BathronResult<u64> {
        Ok(self.balances.get(&key_balance(addr))?.unwrap_or(0))
    }

    pub fn receipt(&self, outpoint: &OutPoint) -> BathronResult<Option<M1Receipt>> {
        self.receipts.get(&key_receipt(outpoint))
    }

    /// The vaulted BTC value still backing a `TX_LOCK`-created vault output,
    /// or `None` once it's been consumed by `TX_UNLOCK` (§4.4 vault table).
    pub fn vault(&self, outpoint: &OutPoint) -> BathronResult<Option<u64>> {
        self.vaults.get(&key_vault(outpoint))
    }

    pub fn supply(&self) -> BathronResult<SupplyCounters> {
        Ok(self.supply.get(&key_supply())?.unwrap_or_default())
    }

    /// `CheckTransaction` pre-context checks (§4.4.3), applicable to every
    /// settlement transaction type regardless of component.
    pub fn check_transaction(&self, tx: &SettlementTx, is_coinbase: bool) -> ValidationResult<()> {
        let allows_empty_vin =
            matches!(tx.n_type, TxType::BurnClaim | TxType::MintM0Btc | TxType::BtcHeaders);
        if tx.vin.is_empty() && !allows_empty_vin {
            return Err(rejects::bad_txns_vin_empty("empty vin"));
        }
        if tx.vout.is_empty() {
            return Err(rejects::bad_txns_vout_empty("empty vout"));
        }
        if tx.version < 1 {
            return Err(rejects::bad_tx_version_too_high("version must be >= 1"));
        }
        if tx.size_bytes > MAX_TX_SIZE_AFTER_SAPLING {
            return Err(rejects::bad_txns_oversize("tx exceeds max size"));
        }

        let mut running = 0u64;
        for out in &tx.vout {
            if out.value > MAX_MONEY {
                return Err(rejects::bad_txns_vout_toolarge("output exceeds MAX_MONEY"));
            }
            running = running
                .checked_add(out.value)
                .ok_or_else(|| rejects::bad_txns_txouttotal_toolarge("output sum overflow"))?;
            if running > MAX_MONEY {
                return Err(rejects::bad_txns_txouttotal_toolarge(
                    "running output total exceeds MAX_MONEY",
                ));
            }
        }

        if !tx.n_type.may_carry_optrue_output() {
            for out in &tx.vout {
                if is_exactly_op_true(&out.script_pubkey) {
                    return Err(rejects::bad_txns_optrue_forbidden(
                        "OP_TRUE output outside LOCK/UNLOCK/TRANSFER_M1",
                    ));
                }
            }
        }

        let mut seen = std::collections::HashSet::new();
        for input in &tx.vin {
            if !seen.insert(input.prevout) {
                return Err(rejects::bad_txns_inputs_duplicate("duplicate input"));
            }
            if !is_coinbase && input.prevout.txid == bitcoin::Txid::all_zeros() {
                return Err(rejects::bad_txns_prevout_null("null prevout"));
            }
        }

        Ok(())
    }

    /// Public entry point for C5: HTLC CREATE rides on the `TX_TRANSFER_M1`
    /// fee rule (§4.5.5 "CREATE" row, "+ mandatory fee output").
    pub fn verify_fee_output(&self, tx: &SettlementTx, canonical_fee_index: usize) -> ValidationResult<u64> {
        self.check_fee_output(tx, canonical_fee_index)
    }

    /// Locates the canonical fee index and validates the mandatory
    /// `OP_TRUE` output for `TX_UNLOCK`/`TX_TRANSFER_M1` (§4.4.1).
    fn check_fee_output(&self, tx: &SettlementTx, canonical_fee_index: usize) -> ValidationResult<u64> {
        let is_unlock = match tx.n_type {
            TxType::Unlock => true,
            TxType::TransferM1 => false,
            _ => unreachable!("fee output only applies to UNLOCK/TRANSFER_M1"),
        };

        let out = tx.vout.get(canonical_fee_index).ok_or_else(|| {
            if is_unlock {
                rejects::bad_unlock_fee_missing("canonical fee index out of range")
            } else {
                rejects::bad_txtransfer_fee_missing("canonical fee index out of range")
            }
        })?;
        if !is_exactly_op_true(&out.script_pubkey) {
            return Err(if is_unlock {
                rejects::bad_unlock_fee_script("fee output script is not byte-exact OP_TRUE")
            } else {
                rejects::bad_txtransfer_fee_script("fee output script is not byte-exact OP_TRUE")
            });
        }
        let min_fee = ((tx.size_bytes as u64 * tx.fee_rate_sat_per_kvb) + 999) / 1000;
        let min_fee = min_fee.max(1);
        if out.value < min_fee {
            return Err(if is_unlock {
                rejects::bad_unlock_fee_too_low("fee output below minimum")
            } else {
                rejects::bad_txtransfer_fee_too_low("fee output below minimum")
            });
        }
        Ok(out.value)
    }

    /// TX_LOCK: consume M0 balance `a`; create one vault output (`a`,
    /// `OP_TRUE`) and one M1 receipt output (`a`, normal script). The vault
    /// output is tracked by its own outpoint so a later `TX_UNLOCK` has a
    /// real UTXO to consume, not just the receipt's stored amount.
    pub fn apply_lock(
        &self,
        batch: &mut WriteBatch,
        tx: &SettlementTx,
        receipt_outpoint: OutPoint,
        source: &Address,
        height: u32,
    ) -> ValidationResult<BlockDelta> {
        let (vault_vout, vault_out) = tx
            .vout
            .iter()
            .enumerate()
            .find(|(_, o)| is_exactly_op_true(&o.script_pubkey))
            .ok_or_else(|| rejects::bad_settlement_vault_missing("TX_LOCK missing vault output"))?;
        let receipt_out = tx
            .vout
            .iter()
            .find(|o| !is_exactly_op_true(&o.script_pubkey))
            .ok_or_else(|| {
                rejects::bad_settlement_receipt_missing("TX_LOCK missing M1 receipt output")
            })?;
        if vault_out.value != receipt_out.value {
            return Err(rejects::bad_settlement_invariant(
                "TX_LOCK vault/receipt value mismatch",
            ));
        }

        let balance = self
            .balance(source)
            .map_err(|e| rejects::bad_settlement_balance(e.to_string()))?;
        let amount = vault_out.value;
        if balance < amount {
            return Err(rejects::bad_settlement_balance("insufficient M0 balance"));
        }

        let vault_outpoint = OutPoint {
            txid: receipt_outpoint.txid,
            vout: vault_vout as u32,
        };
        batch
            .put(CF_SETTLEMENT, &key_balance(source), &(balance - amount))
            .map_err(|e| rejects::bad_settlement_balance(e.to_string()))?;
        batch
            .put(
                CF_SETTLEMENT,
                &key_receipt(&receipt_outpoint),
                &M1Receipt {
                    amount,
                    create_height: height,
                },
            )
            .map_err(|e| rejects::bad_settlement_balance(e.to_string()))?;
        batch
            .put(CF_SETTLEMENT, &key_vault(&vault_outpoint), &amount)
            .map_err(|e| rejects::bad_settlement_balance(e.to_string()))?;

        Ok(BlockDelta {
            vault_delta: amount as i64,
            receipt_delta: amount as i64,
        })
    }

    /// TX_UNLOCK: consume one M1 receipt and the vault output it was created
    /// with (§8 Scenario 1 "r1 + v1"), requiring both to actually be spent by
    /// this transaction's `vin`; credit M0 back to the destination minus the
    /// mandatory fee.
    pub fn apply_unlock(
        &self,
        batch: &mut WriteBatch,
        tx: &SettlementTx,
        receipt_outpoint: &OutPoint,
        vault_outpoint: &OutPoint,
        dest: &Address,
        canonical_fee_index: usize,
    ) -> ValidationResult<BlockDelta> {
        let receipt = self
            .receipt(receipt_outpoint)
            .map_err(|e| rejects::bad_settlement_receipt_missing(e.to_string()))?
            .ok_or_else(|| rejects::bad_settlement_receipt_missing("receipt not found"))?;
        let vault_amount = self
            .vault(vault_outpoint)
            .map_err(|e| rejects::bad_settlement_vault_missing(e.to_string()))?
            .ok_or_else(|| rejects::bad_settlement_vault_missing("vault output not found"))?;
        if vault_amount != receipt.amount {
            return Err(rejects::bad_settlement_invariant(
                "TX_UNLOCK vault/receipt value mismatch",
            ));
        }
        if !tx.vin.iter().any(|i| &i.prevout == receipt_outpoint)
            || !tx.vin.iter().any(|i| &i.prevout == vault_outpoint)
        {
            return Err(rejects::bad_settlement_vault_missing(
                "TX_UNLOCK must spend both the receipt and its vault output",
            ));
        }

        let fee = self.check_fee_output(tx, canonical_fee_index)?;
        let credited = receipt
            .amount
            .checked_sub(fee)
            .ok_or_else(|| rejects::bad_settlement_invariant("fee exceeds receipt amount"))?;

        batch.delete(CF_SETTLEMENT, &key_receipt(receipt_outpoint));
        batch.delete(CF_SETTLEMENT, &key_vault(vault_outpoint));
        let balance = self
            .balance(dest)
            .map_err(|e| rejects::bad_settlement_balance(e.to_string()))?;
        batch
            .put(CF_SETTLEMENT, &key_balance(dest), &(balance + credited))
            .map_err(|e| rejects::bad_settlement_balance(e.to_string()))?;

        Ok(BlockDelta {
            vault_delta: -(receipt.amount as i64),
            receipt_delta: -(receipt.amount as i64),
        })
    }

    /// TX_TRANSFER_M1: consume one or more M1 receipts; produce one or more
    /// M1 receipt outputs to recipients, minus the mandatory fee.
    pub fn apply_transfer(
        &self,
        batch: &mut WriteBatch,
        tx: &SettlementTx,
        inputs: &[OutPoint],
        output_outpoints: &[OutPoint],
        height: u32,
        canonical_fee_index: usize,
    ) -> ValidationResult<BlockDelta> {
        let fee = self.check_fee_output(tx, canonical_fee_index)?;

        let mut total_in = 0u64;
        for op in inputs {
            let receipt = self
                .receipt(op)
                .map_err(|e| rejects::bad_settlement_receipt_missing(e.to_string()))?
                .ok_or_else(|| rejects::bad_settlement_receipt_missing("receipt not found"))?;
            total_in += receipt.amount;
            batch.delete(CF_SETTLEMENT, &key_receipt(op));
        }

        let non_fee_outputs: Vec<&TxOutput> = tx
            .vout
            .iter()
            .enumerate()
            .filter(|(i, o)| *i != canonical_fee_index && !is_exactly_op_true(o.script_pubkey_ref()))
            .map(|(_, o)| o)
            .collect();

        let total_out: u64 = non_fee_outputs.iter().map(|o| o.value).sum();
        if total_out + fee != total_in {
            return Err(rejects::bad_settlement_invariant(
                "TX_TRANSFER_M1 inputs do not equal outputs plus fee",
            ));
        }

        for (op, out) in output_outpoints.iter().zip(non_fee_outputs.iter()) {
            batch
                .put(
                    CF_SETTLEMENT,
                    &key_receipt(op),
                    &M1Receipt {
                        amount: out.value,
                        create_height: height,
                    },
                )
                .map_err(|e| rejects::bad_settlement_invariant(e.to_string()))?;
        }

        // Receipt supply is conserved by TRANSFER_M1 (no vault movement);
        // net delta is zero and I6 holds trivially for this TX.
        Ok(BlockDelta::default())
    }

    /// Consumes one M1 receipt, returning it so the caller can either bank
    /// its value as an M0 credit (`TX_UNLOCK`) or re-shape it into something
    /// else entirely — an HTLC P2SH output (C5 CREATE) or a fresh receipt
    /// elsewhere (`TX_TRANSFER_M1`).
    pub fn consume_receipt(&self, batch: &mut WriteBatch, outpoint: &OutPoint) -> ValidationResult<M1Receipt> {
        let receipt = self
            .receipt(outpoint)
            .map_err(|e| rejects::bad_settlement_receipt_missing(e.to_string()))?
            .ok_or_else(|| rejects::bad_settlement_receipt_missing("receipt not found"))?;
        batch.delete(CF_SETTLEMENT, &key_receipt(outpoint));
        Ok(receipt)
    }

    /// Creates a fresh M1 receipt at `outpoint` (the counterpart to
    /// [`Self::consume_receipt`] — used by `TX_TRANSFER_M1` and by C5's
    /// HTLC CLAIM/REFUND, which both mint a new receipt out of value that
    /// was never vaulted or un-vaulted).
    pub fn create_receipt(
        &self,
        batch: &mut WriteBatch,
        outpoint: &OutPoint,
        amount: u64,
        height: u32,
    ) -> BathronResult<()> {
        batch.put(
            CF_SETTLEMENT,
            &key_receipt(outpoint),
            &M1Receipt {
                amount,
                create_height: height,
            },
        )
    }

    /// Disconnects `TX_LOCK` (§5 "Ordering guarantees" — reorg symmetry):
    /// recomputes the vaulted amount straight from the transaction body,
    /// exactly as `apply_lock` did, rather than from a stored undo record
    /// (settlement/ has no undo keys, unlike htlc/ — §6.4).
    pub fn disconnect_lock(
        &self,
        batch: &mut WriteBatch,
        tx: &SettlementTx,
        receipt_outpoint: &OutPoint,
        source: &Address,
    ) -> BathronResult<BlockDelta> {
        let vault_vout = tx.vout.iter().position(|o| is_exactly_op_true(&o.script_pubkey));
        let amount = tx
            .vout
            .iter()
            .find(|o| !is_exactly_op_true(&o.script_pubkey))
            .map(|o| o.value)
            .unwrap_or(0);
        batch.delete(CF_SETTLEMENT, &key_receipt(receipt_outpoint));
        if let Some(vault_vout) = vault_vout {
            let vault_outpoint = OutPoint {
                txid: receipt_outpoint.txid,
                vout: vault_vout as u32,
            };
            batch.delete(CF_SETTLEMENT, &key_vault(&vault_outpoint));
        }
        let balance = self.balance(source)?;
        batch.put(CF_SETTLEMENT, &key_balance(source), &(balance + amount))?;
        Ok(BlockDelta {
            vault_delta: -(amount as i64),
            receipt_delta: -(amount as i64),
        })
    }

    /// Disconnects `TX_UNLOCK`: restores the consumed receipt (the caller
    /// supplies it from its own undo log — the receipt no longer exists in
    /// `settlement/` once unlocked) and claws back the credited M0.
    pub fn disconnect_unlock(
        &self,
        batch: &mut WriteBatch,
        receipt_outpoint: &OutPoint,
        vault_outpoint: &OutPoint,
        original_receipt: &M1Receipt,
        dest: &Address,
        credited: u64,
    ) -> BathronResult<BlockDelta> {
        let balance = self.balance(dest)?;
        batch.put(CF_SETTLEMENT, &key_balance(dest), &balance.saturating_sub(credited))?;
        batch.put(CF_SETTLEMENT, &key_receipt(receipt_outpoint), original_receipt)?;
        batch.put(CF_SETTLEMENT, &key_vault(vault_outpoint), &original_receipt.amount)?;
        Ok(BlockDelta {
            vault_delta: original_receipt.amount as i64,
            receipt_delta: original_receipt.amount as i64,
        })
    }

    /// Disconnects `TX_TRANSFER_M1`: deletes the receipts it created and
    /// restores the ones it consumed, both supplied by the caller's undo log.
    pub fn disconnect_transfer(
        &self,
        batch: &mut WriteBatch,
        output_outpoints: &[OutPoint],
        consumed_receipts: &[(OutPoint, M1Receipt)],
    ) -> BathronResult<BlockDelta> {
        for op in output_outpoints {
            batch.delete(CF_SETTLEMENT, &key_receipt(op));
        }
        for (op, receipt) in consumed_receipts {
            batch.put(CF_SETTLEMENT, &key_receipt(op), receipt)?;
        }
        Ok(BlockDelta::default())
    }

    /// Applies an M0 mint from a matured burn claim (§4.3 "Delayed mint",
    /// I5): `M0_total += amount`, `balance[dest] += amount`.
    pub fn apply_mint(
        &self,
        batch: &mut WriteBatch,
        dest: &Address,
        amount: u64,
    ) -> BathronResult<()> {
        let balance = self.balance(dest)?;
        batch.put(CF_SETTLEMENT, &key_balance(dest), &(balance + amount))?;
        let mut supply = self.supply()?;
        supply.m0_total += amount;
        batch.put(CF_SETTLEMENT, &key_supply(), &supply)
    }

    /// Disconnects a mint on reorg: decrements `M0_total` and the
    /// destination balance (§4.3 "Reorg of BATHRON", scenario 6).
    pub fn disconnect_mint(&self, batch: &mut WriteBatch, dest: &Address, amount: u64) -> BathronResult<()> {
        let balance = self.balance(dest)?;
        batch.put(CF_SETTLEMENT, &key_balance(dest), &balance.saturating_sub(amount))?;
        let mut supply = self.supply()?;
        supply.m0_total = supply.m0_total.saturating_sub(amount);
        batch.put(CF_SETTLEMENT, &key_supply(), &supply)
    }

    /// End-of-block: checks I6 over the batch's net delta and commits the
    /// updated vault/receipt supply counters (§4.4 "I6 enforcement", P2).
    pub fn finalize_block(&self, batch: &mut WriteBatch, delta: BlockDelta) -> ValidationResult<()> {
        delta.check_i6()?;
        let mut supply = self
            .supply()
            .map_err(|e| rejects::bad_settlement_invariant(e.to_string()))?;
        supply.m0_vaulted = (supply.m0_vaulted as i64 + delta.vault_delta) as u64;
        supply.m1_supply = (supply.m1_supply as i64 + delta.receipt_delta) as u64;
        if supply.m0_vaulted != supply.m1_supply {
            return Err(rejects::bad_settlement_invariant(
                "M0_vaulted != M1_supply after block",
            ));
        }
        batch
            .put(CF_SETTLEMENT, &key_supply(), &supply)
            .map_err(|e| rejects::bad_settlement_invariant(e.to_string()))?;
        Ok(())
    }
}

impl TxOutput {
    fn script_pubkey_ref(&self) -> &Script {
        &self.script_pubkey
    }
}

/// Scans a non-coinbase, non-vault-producing script for a forbidden
/// `OP_RETURN`-shaped output when it would otherwise collide with burn
/// detection heuristics; kept as a standalone helper since §4.4.3 rule 5
/// is about `OP_TRUE`, not `OP_RETURN` — `OP_RETURN` is only relevant to C3.
pub fn is_op_return(script: &Script) -> bool {
    script.as_bytes().first() == Some(&OP_RETURN.to_u8())
}
