//! C3 Burn Claim Engine (§3.3, §4.3): parse, verify, deduplicate BTC burn
//! proofs against C2; schedule delayed M0 mints after K confirmations.

use bitcoin::hash_types::{BlockHash, Txid};
use bitcoin::{Script, Transaction};

use bathron_types::{rejects, BathronResult, ValidationResult};

use crate::config::NetworkParams;
use crate::kv::{Column, Database, WriteBatch, CF_SETTLEMENT};
use crate::ledger::Ledger;

/// `BurnClaim` (§3.3).
#[derive(Clone, serde::Serialize, serde::Deserialize)]
pub struct BurnClaim {
    pub btc_txid: [u8; 32],
    pub btc_block_height: u32,
    pub dest_hash160: [u8; 20],
    pub amount_sats: u64,
    pub network_tag: u8,
}

/// `PendingMint` (§3.3), also indexed by `mature_at_btc_height`.
#[derive(Clone, serde::Serialize, serde::Deserialize)]
pub struct PendingMint {
    pub btc_txid: [u8; 32],
    pub mature_at_btc_height: u32,
    pub dest_hash160: [u8; 20],
    pub amount_sats: u64,
}

/// A fully parsed merkle block proof, as provided by an off-chain submitter
/// (§4.3 step 2).
pub struct MerkleBlockProof {
    pub btc_block_hash: BlockHash,
    pub merkle_root: bitcoin::hash_types::TxMerkleNode,
    pub siblings: Vec<[u8; 32]>,
    pub tx_index: u32,
}

fn key_dedup(txid: &[u8; 32]) -> Vec<u8> {
    let mut k = vec![b'D'];
    k.extend_from_slice(txid);
    k
}
fn key_pending(txid: &[u8; 32]) -> Vec<u8> {
    let mut k = vec![b'P'];
    k.extend_from_slice(txid);
    k
}
fn key_pending_by_height(height: u32, txid: &[u8; 32]) -> Vec<u8> {
    let mut k = vec![b'Q'];
    k.extend_from_slice(&height.to_be_bytes());
    k.extend_from_slice(txid);
    k
}

pub struct BurnEngine {
    dedup: Column<Vec<u8>, ()>,
    pending: Column<Vec<u8>, PendingMint>,
    pending_by_height: Column<Vec<u8>, ()>,
    params: NetworkParams,
}

impl BurnEngine {
    pub fn new(db: &Database, params: NetworkParams) -> Self {
        BurnEngine {
            dedup: db.column(CF_SETTLEMENT),
            pending: db.column(CF_SETTLEMENT),
            pending_by_height: db.column(CF_SETTLEMENT),
            params,
        }
    }

    pub fn is_seen(&self, txid: &[u8; 32]) -> BathronResult<bool> {
        self.dedup.exists(&key_dedup(txid))
    }

    /// Scans a raw Bitcoin transaction for the burn output pair: an
    /// `OP_RETURN` carrying `MAGIC || version || network_tag || dest_hash160`
    /// and a sibling provably-unspendable output carrying the burned amount
    /// (§4.3 step 6, §6.2).
    pub fn parse_burn_outputs(
        &self,
        tx: &Transaction,
    ) -> ValidationResult<([u8; 20], u64, u8)> {
        let magic = self.params.magic;
        let mut metadata = None;
        for out in &tx.output {
            if let Some(data) = extract_op_return(&out.script_pubkey) {
                if data.len() == magic.len() + 1 + 1 + 20 && &data[..magic.len()] == &magic[..] {
                    let version = data[magic.len()];
                    let network_tag = data[magic.len() + 1];
                    if version != 1 {
                        continue;
                    }
                    let mut dest = [0u8; 20];
                    dest.copy_from_slice(&data[magic.len() + 2..magic.len() + 22]);
                    metadata = Some((dest, network_tag));
                    break;
                }
            }
        }
        let Some((dest_hash160, network_tag)) = metadata else {
            return Err(rejects::bad_burn_no_metadata("no OP_RETURN burn metadata found"));
        };
        if network_tag != self.params.burn_network_tag {
            return Err(rejects::bad_burn_bad_magic("network tag mismatch"));
        }

        let burned = tx
            .output
            .iter()
            .find(|o| is_burn_sink(&o.script_pubkey))
            .map(|o| o.value)
            .ok_or_else(|| rejects::bad_burn_no_burn_output("no P2WSH(OP_FALSE) burn output found"))?;

        const MIN_BURN_SATS: u64 = 1000;
        if burned < MIN_BURN_SATS {
            return Err(rejects::bad_burn_below_min_amount("burn output below minimum"));
        }

        Ok((dest_hash160, burned, network_tag))
    }

    /// Full claim-submission pipeline (§4.3 steps 1-5): dedup, locate the
    /// block in C2, check min-supported-height, verify the merkle proof,
    /// and require K confirmations. Does not parse/emit — callers combine
    /// this with [`Self::parse_burn_outputs`] and then [`Self::submit`].
    pub fn validate_claim(
        &self,
        ledger: &Ledger,
        spv: &crate::btc::spv::Store,
        txid: &Txid,
        proof: &MerkleBlockProof,
    ) -> ValidationResult<u32> {
        let txid_bytes: [u8; 32] = txid.to_vec().try_into().unwrap();
        if self
            .is_seen(&txid_bytes)
            .map_err(|e| rejects::custom(10, "bad-burn-duplicate", e.to_string()))?
        {
            return Err(rejects::bad_burn_duplicate("btc_txid already claimed"));
        }

        let burn_height = self.find_height_in_ledger(ledger, &proof.btc_block_hash)?;

        if burn_height < spv.get_min_supported_height() {
            return Err(rejects::bad_burn_below_min_height(
                "burn block below min_supported_height",
            ));
        }

        spv.verify_merkle_proof(txid, &proof.merkle_root, &proof.siblings, proof.tx_index)?;

        let tip = ledger
            .tip_height()
            .map_err(|e| rejects::custom(100, "bad-burn-unknown-block", e.to_string()))?;
        if tip < burn_height || tip - burn_height < self.params.limits.btc_confirmations_k {
            return Err(rejects::bad_burn_immature(
                "fewer than K confirmations on C2",
            ));
        }

        Ok(burn_height)
    }

    fn find_height_in_ledger(&self, ledger: &Ledger, hash: &BlockHash) -> ValidationResult<u32> {
        let tip = ledger
            .tip()
            .map_err(|e| rejects::bad_burn_unknown_block(e.to_string()))?
            .ok_or_else(|| rejects::bad_burn_unknown_block("ledger is empty"))?;
        // Walk back from the tip looking for the block; bounded by
        // min_supported_height so this terminates even for an unknown hash.
        let mut height = tip.height;
        loop {
            match ledger.get_hash_at_height(height) {
                Ok(Some(h)) if h == *hash => return Ok(height),
                _ => {}
            }
            if height == 0 {
                break;
            }
            height -= 1;
        }
        Err(rejects::bad_burn_unknown_block(
            "block not found in C2 active chain",
        ))
    }

    /// Step 7: emits the pending-mint record (the `TX_BURN_CLAIM` effect).
    pub fn submit(
        &self,
        batch: &mut WriteBatch,
        txid: &Txid,
        burn_height: u32,
        dest_hash160: [u8; 20],
        amount_sats: u64,
    ) -> BathronResult<()> {
        let txid_bytes: [u8; 32] = txid.to_vec().try_into().unwrap();
        let mature_at = burn_height + self.params.limits.btc_confirmations_k;
        batch.put(CF_SETTLEMENT, &key_dedup(&txid_bytes), &())?;
        batch.put(
            CF_SETTLEMENT,
            &key_pending(&txid_bytes),
            &PendingMint {
                btc_txid: txid_bytes,
                mature_at_btc_height: mature_at,
                dest_hash160,
                amount_sats,
            },
        )?;
        batch.put(CF_SETTLEMENT, &key_pending_by_height(mature_at, &txid_bytes), &())?;
        Ok(())
    }

    /// Disconnects a `TX_BURN_CLAIM`: removes the pending record and the
    /// dedup marker (§4.3 "Reorg").
    pub fn disconnect_claim(&self, batch: &mut WriteBatch, txid: &Txid, mature_at: u32) {
        let txid_bytes: [u8; 32] = txid.to_vec().try_into().unwrap();
        batch.delete(CF_SETTLEMENT, &key_dedup(&txid_bytes));
        batch.delete(CF_SETTLEMENT, &key_pending(&txid_bytes));
        batch.delete(CF_SETTLEMENT, &key_pending_by_height(mature_at, &txid_bytes));
    }

    pub fn get_pending(&self, txid: &[u8; 32]) -> BathronResult<Option<PendingMint>> {
        self.pending.get(&key_pending(txid))
    }

    /// The confirmation depth `submit` applies when computing
    /// `mature_at_btc_height`; exposed so callers can recompute a claim's
    /// maturity height without re-reading storage (e.g. to build a
    /// disconnect undo record in the same batch `submit` just wrote to).
    pub fn confirmations_k(&self) -> u32 {
        self.params.limits.btc_confirmations_k
    }

    /// `TX_MINT_M0BTC` effect (§4.3 "Delayed mint"): removes the matured
    /// entry so `matured_at` never re-offers it. The dedup marker stays
    /// forever — a btc_txid is claimed exactly once even across remints.
    pub fn mark_minted(&self, batch: &mut WriteBatch, pending: &PendingMint) {
        batch.delete(CF_SETTLEMENT, &key_pending(&pending.btc_txid));
        batch.delete(
            CF_SETTLEMENT,
            &key_pending_by_height(pending.mature_at_btc_height, &pending.btc_txid),
        );
    }

    /// Disconnects `TX_MINT_M0BTC` (§4.3 "Reorg of BATHRON", scenario 6):
    /// reinstates the pending entry; the dedup marker was never removed.
    pub fn restore_pending(&self, batch: &mut WriteBatch, pending: &PendingMint) -> BathronResult<()> {
        batch.put(CF_SETTLEMENT, &key_pending(&pending.btc_txid), pending)?;
        batch.put(
            CF_SETTLEMENT,
            &key_pending_by_height(pending.mature_at_btc_height, &pending.btc_txid),
            &(),
        )?;
        Ok(())
    }

    /// Scans all `PendingMint` entries that have matured by `ledger_tip`
    /// (§4.3 "Delayed mint"). Real implementations would keep a height index
    /// to avoid a full scan; this mirrors the spec's description directly.
    pub fn matured_at(&self, ledger_tip_height: u32) -> BathronResult<Vec<PendingMint>> {
        let mut out = Vec::new();
        for height in 0..=ledger_tip_height {
            let prefix_entries = self
                .pending_by_height
                .iter_prefix(&{
                    let mut k = vec![b'Q'];
                    k.extend_from_slice(&height.to_be_bytes());
                    k
                })?;
            for (key, _) in prefix_entries {
                let mut txid = [0u8; 32];
                txid.copy_from_slice(&key[5..37]);
                if let Some(pending) = self.get_pending(&txid)? {
                    out.push(pending);
                }
            }
        }
        Ok(out)
    }
}

fn extract_op_return(script: &Script) -> Option<Vec<u8>> {
    let bytes = script.as_bytes();
    if bytes.first() != Some(&bitcoin::blockdata::opcodes::all::OP_RETURN.to_u8()) {
        return None;
    }
    Some(bytes[1..].to_vec())
}

/// The exact burn sink shape (§4.3 step 6, §6.2): a v0 P2WSH output whose
/// witness program is `sha256(&[OP_FALSE])`, i.e. the hash of a trivial
/// always-false witness script — distinct from any other spendable P2WSH
/// output, and never an `OP_RETURN` (that's the metadata output, scanned
/// separately).
fn is_burn_sink(script: &Script) -> bool {
    if !script.is_v0_p2wsh() {
        return false;
    }
    let program = &script.as_bytes()[2..];
    use sha2::{Digest, Sha256};
    program == Sha256::digest([0x00]).as_slice()
}
