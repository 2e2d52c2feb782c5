//! C2 On-chain Header Ledger and the `TX_BTC_HEADERS` publication transaction
//! (§3.2, §4.2). A consensus-replicated copy of a prefix of the SPV best
//! chain, mutated only by validated publication transactions.

use bitcoin::hash_types::BlockHash;
use bitcoin::hashes::{sha256d, Hash, HashEngine};
use bitcoin::secp256k1::{self, ecdsa, Message as SecpMessage};
use bitcoin::BlockHeader;

use bathron_types::{rejects, BathronResult, ValidationResult};

use crate::btc::header::WrappedHeader;
use crate::btc::spv::Store as SpvStore;
use crate::config::NetworkParams;
use crate::kv::{Column, Database, WriteBatch, CF_BTCHEADERSDB};

/// Domain separation tag for the publication signature (§4.2, §6.3):
/// prevents cross-protocol signature replay.
pub const SIG_DOMAIN_TAG: &[u8] = b"BTCHDR";

/// A compressed secp256k1 public key identifying a masternode operator.
pub type OperatorPubkey = secp256k1::PublicKey;

/// Resolves a masternode's registration at the point it signed; governance
/// itself (how masternodes register/deregister) is out of scope (§1) — this
/// is the seam C2 needs to validate R1 (`SPEC_FULL.md` §2).
pub trait MasternodeRegistry {
    fn is_registered(&self, pro_tx_hash: &[u8; 32]) -> Option<OperatorPubkey>;
}

/// `BtcHeadersPayload` (§4.2).
#[derive(Clone, Debug)]
pub struct BtcHeadersPayload {
    pub version: u8,
    pub publisher_pro_tx_hash: [u8; 32],
    pub start_height: u32,
    pub count: u16,
    pub headers: Vec<BlockHeader>,
    pub sig: Vec<u8>,
}

const CURRENT_PAYLOAD_VERSION: u8 = 1;

impl BtcHeadersPayload {
    /// Domain-separated signature hash (§4.2):
    /// `HASH("BTCHDR" || version || publisher_pro_tx_hash || start_height || count || headers[0..count])`.
    pub fn sighash(&self) -> sha256d::Hash {
        let mut engine = sha256d::Hash::engine();
        engine.input(SIG_DOMAIN_TAG);
        engine.input(&[self.version]);
        engine.input(&self.publisher_pro_tx_hash);
        engine.input(&self.start_height.to_le_bytes());
        engine.input(&self.count.to_le_bytes());
        for h in &self.headers {
            let mut bytes = Vec::with_capacity(80);
            use bitcoin::consensus::Encodable;
            h.consensus_encode(&mut bytes).expect("header encode is infallible");
            engine.input(&bytes);
        }
        sha256d::Hash::from_engine(engine)
    }

    /// Rough serialized payload size, for the R7 500 KB bound (§4.2, §6.5).
    pub fn approx_encoded_size(&self) -> usize {
        1 + 32 + 4 + 2 + self.headers.len() * 80 + self.sig.len()
    }
}

/// `(proTxHash, bathron_block_height)` anti-spam cooldown marker (§3.2).
#[derive(Clone, serde::Serialize, serde::Deserialize)]
pub struct LastPublisher {
    pub pro_tx_hash: [u8; 32],
    pub bathron_height: u32,
}

fn key_tip() -> Vec<u8> {
    vec![b't']
}
fn key_height_hash(height: u32) -> Vec<u8> {
    let mut k = vec![b'h'];
    k.extend_from_slice(&height.to_be_bytes());
    k
}
fn key_hash_header(hash: &BlockHash) -> Vec<u8> {
    let mut k = vec![b'H'];
    k.extend_from_slice(&hash[..]);
    k
}
fn key_best_bathron_block() -> Vec<u8> {
    vec![b'b']
}
fn key_last_publisher() -> Vec<u8> {
    vec![b'p']
}

/// `(height, hash)`, persisted at key `t` (§6.4 `btcheadersdb/`).
#[derive(Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct Tip {
    pub height: u32,
    pub hash: BlockHash,
}

pub struct Ledger {
    tip: Column<Vec<u8>, Tip>,
    height_hash: Column<Vec<u8>, BlockHash>,
    hash_header: Column<Vec<u8>, bathron_types::Adapter<BlockHeader>>,
    best_bathron_block: Column<Vec<u8>, u32>,
    last_publisher: Column<Vec<u8>, LastPublisher>,
    params: NetworkParams,
}

impl Ledger {
    pub fn new(db: &Database, params: NetworkParams) -> Self {
        Ledger {
            tip: db.column(CF_BTCHEADERSDB),
            height_hash: db.column(CF_BTCHEADERSDB),
            hash_header: db.column(CF_BTCHEADERSDB),
            best_bathron_block: db.column(CF_BTCHEADERSDB),
            last_publisher: db.column(CF_BTCHEADERSDB),
            params,
        }
    }

    pub fn tip(&self) -> BathronResult<Option<Tip>> {
        self.tip.get(&key_tip())
    }

    pub fn tip_height(&self) -> BathronResult<u32> {
        Ok(self.tip()?.map(|t| t.height).unwrap_or(0))
    }

    pub fn is_empty(&self) -> BathronResult<bool> {
        Ok(self.tip()?.is_none())
    }

    pub fn get_hash_at_height(&self, height: u32) -> BathronResult<Option<BlockHash>> {
        self.height_hash.get(&key_height_hash(height))
    }

    pub fn get_header_at_hash(&self, hash: &BlockHash) -> BathronResult<Option<BlockHeader>> {
        Ok(self.hash_header.get(&key_hash_header(hash))?.map(|a| *a))
    }

    pub fn get_header_at_height(&self, height: u32) -> BathronResult<Option<BlockHeader>> {
        match self.get_hash_at_height(height)? {
            Some(hash) => self.get_header_at_hash(&hash),
            None => Ok(None),
        }
    }

    /// Startup consistency check (§4.2): if `best_bathron_block` is on the
    /// active chain (equal to tip, or an ancestor), do nothing; otherwise
    /// update the marker. Header data itself always survives reindex since
    /// BTC headers are chain-independent of BATHRON's own chain.
    pub fn check_consistency_at_startup(&self, bathron_active_tip: u32) -> BathronResult<()> {
        let marker = self.best_bathron_block.get(&key_best_bathron_block())?;
        match marker {
            Some(h) if h <= bathron_active_tip => Ok(()),
            _ => {
                let batch_marker = bathron_active_tip;
                self.best_bathron_block
                    .put(&key_best_bathron_block(), &batch_marker)
            }
        }
    }

    /// Validates a `TX_BTC_HEADERS` payload, in R7-first order (§4.2).
    /// `is_genesis_block` relaxes R1/R2/R7's publisher/signature checks and
    /// raises the count ceiling, exactly as at BATHRON's genesis block.
    #[allow(clippy::too_many_arguments)]
    pub fn validate_publication(
        &self,
        payload: &BtcHeadersPayload,
        spv: &SpvStore,
        registry: &dyn MasternodeRegistry,
        is_genesis_block: bool,
        current_bathron_height: u32,
    ) -> ValidationResult<()> {
        // R7: trivial shape, checked first so `headers[0]` is safe to touch.
        if payload.version != CURRENT_PAYLOAD_VERSION {
            return Err(rejects::bad_btcheaders_version("unsupported payload version"));
        }
        let max_count = if is_genesis_block {
            self.params.limits.btcheaders_genesis_max_count
        } else {
            self.params.limits.btcheaders_max_count
        };
        if payload.count == 0 || payload.count > max_count {
            return Err(rejects::bad_btcheaders_count("count out of range"));
        }
        if payload.headers.len() != payload.count as usize {
            return Err(rejects::bad_btcheaders_count_mismatch(
                "headers.len() != count",
            ));
        }
        if payload.approx_encoded_size() > self.params.limits.btcheaders_max_payload_size {
            return Err(rejects::bad_btcheaders_size("payload exceeds 500 KB"));
        }
        if !is_genesis_block {
            if payload.publisher_pro_tx_hash == [0u8; 32] {
                return Err(rejects::bad_btcheaders_null_publisher("null publisher"));
            }
            if payload.sig.is_empty() {
                return Err(rejects::bad_btcheaders_empty_sig("empty signature"));
            }
        }

        // R1: publisher.
        let operator_pubkey = if is_genesis_block {
            None
        } else {
            let pk = registry
                .is_registered(&payload.publisher_pro_tx_hash)
                .ok_or_else(|| rejects::bad_btcheaders_unknown_mn("unregistered masternode"))?;
            Some(pk)
        };

        // R2: signature.
        if let Some(pubkey) = operator_pubkey {
            let sighash = payload.sighash();
            let msg = SecpMessage::from_slice(sighash.as_ref())
                .map_err(|_| rejects::bad_btcheaders_sig("bad sighash length"))?;
            let sig = ecdsa::Signature::from_der(&payload.sig)
                .or_else(|_| ecdsa::Signature::from_compact(&payload.sig))
                .map_err(|_| rejects::bad_btcheaders_sig("malformed signature"))?;
            let secp = secp256k1::Secp256k1::verification_only();
            secp.verify_ecdsa(&msg, &sig, &pubkey)
                .map_err(|_| rejects::bad_btcheaders_sig("signature verification failed"))?;
        }

        // R3: extend tip, with replay/catch-up special case: if the exact
        // height range already exists with a matching first hash, treat this
        // as a valid replay rather than re-checking against the live tip.
        let tip = self.tip()?;
        let is_replay = match self.get_hash_at_height(payload.start_height)? {
            Some(existing_hash) => existing_hash == payload.headers[0].block_hash(),
            None => false,
        };
        if let Some(tip) = tip {
            if !is_replay
                && (payload.start_height != tip.height + 1
                    || payload.headers[0].prev_blockhash != tip.hash)
            {
                return Err(rejects::bad_btcheaders_not_extending_tip(
                    "does not extend ledger tip",
                ));
            }
        }

        // R4: internal chain linkage.
        for i in 1..payload.headers.len() {
            if payload.headers[i].prev_blockhash != payload.headers[i - 1].block_hash() {
                return Err(rejects::bad_btcheaders_broken_chain(
                    "headers[i].prev_hash != hash(headers[i-1])",
                ));
            }
        }

        // R5: PoW (delegate to C1).
        for (i, h) in payload.headers.iter().enumerate() {
            let wrapped = WrappedHeader::new(payload.start_height + i as u32, *h);
            if wrapped.validate_pow(&self.params.pow_limit).is_err() {
                return Err(rejects::bad_btcheaders_pow("header fails PoW check"));
            }
        }

        // R6: retarget, re-derived against C1's live SPV chain (§4.1 step 5).
        // A header whose parent C1 hasn't validated yet can't be
        // retarget-checked at all, so it's rejected rather than waved through.
        for (i, h) in payload.headers.iter().enumerate() {
            let height = payload.start_height + i as u32;
            match spv.expected_retarget(height, h)? {
                Some(expected) => {
                    if crate::btc::header::u256_from_compact(h.bits) != expected {
                        if self.params.retarget_log_only {
                            log::warn!(
                                "publication retarget mismatch at height {} (log-only on {})",
                                height,
                                self.params.name
                            );
                        } else {
                            return Err(rejects::bad_btcheaders_retarget(
                                "header fails C1 retarget check",
                            ));
                        }
                    }
                }
                None => {
                    return Err(rejects::bad_btcheaders_retarget(
                        "header's parent not yet validated by C1; cannot verify retarget",
                    ));
                }
            }
        }

        // Anti-spam cooldown, with catch-up bypass.
        if let Some(last) = self.last_publisher.get(&key_last_publisher())? {
            let sync_behind = tip
                .map(|t| {
                    spv.best_height().saturating_sub(t.height) > payload.count as u32
                        || payload.start_height == t.height + 1
                })
                .unwrap_or(true);
            if last.pro_tx_hash == payload.publisher_pro_tx_hash
                && current_bathron_height.saturating_sub(last.bathron_height)
                    < self.params.limits.btcheaders_publisher_cooldown
                && !sync_behind
            {
                return Err(rejects::btcheaders_publisher_cooldown(
                    "publisher cooldown not elapsed",
                ));
            }
        }

        Ok(())
    }

    /// Applies a validated publication to the given batch (§4.2 "Effect").
    pub fn apply(
        &self,
        batch: &mut WriteBatch,
        payload: &BtcHeadersPayload,
        bathron_height: u32,
    ) -> BathronResult<()> {
        let mut height = payload.start_height;
        for header in &payload.headers {
            let hash = header.block_hash();
            batch.put(CF_BTCHEADERSDB, &key_height_hash(height), &hash)?;
            batch.put(
                CF_BTCHEADERSDB,
                &key_hash_header(&hash),
                &bathron_types::Adapter::from(*header),
            )?;
            height += 1;
        }
        let new_tip = Tip {
            height: height - 1,
            hash: payload.headers.last().unwrap().block_hash(),
        };
        batch.put(CF_BTCHEADERSDB, &key_tip(), &new_tip)?;
        batch.put(
            CF_BTCHEADERSDB,
            &key_last_publisher(),
            &LastPublisher {
                pro_tx_hash: payload.publisher_pro_tx_hash,
                bathron_height,
            },
        )?;
        Ok(())
    }

    /// Disconnects a publication on reorg (§4.2 "Disconnect"): erases the
    /// newly-added heights and restores the old tip.
    pub fn disconnect(&self, batch: &mut WriteBatch, payload: &BtcHeadersPayload) -> BathronResult<()> {
        for i in 0..payload.headers.len() as u32 {
            let height = payload.start_height + i;
            let hash = payload.headers[i as usize].block_hash();
            batch.delete(CF_BTCHEADERSDB, &key_height_hash(height));
            batch.delete(CF_BTCHEADERSDB, &key_hash_header(&hash));
        }
        let restored_tip = Tip {
            height: payload.start_height.saturating_sub(1),
            hash: payload.headers[0].prev_blockhash,
        };
        batch.put(CF_BTCHEADERSDB, &key_tip(), &restored_tip)?;
        Ok(())
    }
}
