//! C1 SPV Header Store: validate and persist a best-work chain of Bitcoin
//! headers; answer height/hash/inclusion/confirmation queries; verify merkle
//! inclusion proofs (§3.1, §4.1). Generalizes the teacher's `HeaderQueue`
//! (`header.rs`) off a RocksDB column family instead of `cw-storage-plus`.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use bitcoin::hash_types::{BlockHash, TxMerkleNode, Txid};
use bitcoin::hashes::Hash;
use bitcoin::util::uint::Uint256;
use bitcoin::BlockHeader;

use bathron_types::{rejects, BathronError, BathronResult, Reject, ValidationResult};

use crate::btc::header::{u256_from_compact, u32_to_u256, WrappedHeader};
use crate::config::NetworkParams;
use crate::kv::{Column, Database, CF_BTCSPV};

const KEY_TIP: &[u8] = b"t";
const KEY_WORK: &[u8] = b"w";
const KEY_HEIGHT: &[u8] = b"h";
const KEY_MIN_SUPPORTED: &[u8] = b"m";

fn height_hash_key(height: u32) -> Vec<u8> {
    let mut k = vec![b'b'];
    k.extend_from_slice(&height.to_be_bytes());
    k
}

fn hash_index_key(hash: &BlockHash) -> Vec<u8> {
    let mut k = vec![b'H'];
    k.extend_from_slice(&hash[..]);
    k
}

fn meta_key(tag: &[u8]) -> Vec<u8> {
    tag.to_vec()
}

/// Persisted per-header record (§3.1 `BtcHeaderIndex`). `chain_work` is
/// stored as big-endian bytes since `Uint256` has no native `serde` support.
#[derive(Clone, serde::Serialize, serde::Deserialize)]
pub struct BtcHeaderIndex {
    pub height: u32,
    pub chain_work: [u8; 32],
    pub header: bathron_types::Adapter<BlockHeader>,
}

impl BtcHeaderIndex {
    pub fn chain_work(&self) -> Uint256 {
        Uint256::from_be_bytes(self.chain_work)
    }

    pub fn wrapped(&self) -> WrappedHeader {
        WrappedHeader::new(self.height, *self.header)
    }
}

/// Outcome of [`Store::add_header`] (§4.1 operations: the full result set,
/// not just a success/failure split — callers branch on the variant rather
/// than catching an error).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddHeaderResult {
    Valid,
    InvalidPoW,
    InvalidPrev,
    InvalidTimestampFuture,
    InvalidTimestampMtp,
    InvalidRetarget,
    InvalidCheckpoint,
    Duplicate,
    Orphan,
}

/// A small insertion-order ring cache of recently-touched headers (§9 open
/// question resolved in `SPEC_FULL.md` §2: plain ring, not a recency-tracking
/// LRU). Bounded at `max_entries`; eviction happens on insert past capacity.
struct HeaderCache {
    max_entries: usize,
    order: VecDeque<BlockHash>,
    map: HashMap<BlockHash, BtcHeaderIndex>,
}

impl HeaderCache {
    fn new(max_entries: usize) -> Self {
        HeaderCache {
            max_entries,
            order: VecDeque::new(),
            map: HashMap::new(),
        }
    }

    fn insert(&mut self, hash: BlockHash, idx: BtcHeaderIndex) {
        if !self.map.contains_key(&hash) {
            self.order.push_back(hash);
            while self.order.len() > self.max_entries {
                if let Some(old) = self.order.pop_front() {
                    self.map.remove(&old);
                }
            }
        }
        self.map.insert(hash, idx);
    }

    fn get(&self, hash: &BlockHash) -> Option<&BtcHeaderIndex> {
        self.map.get(hash)
    }
}

struct Inner {
    by_hash: Column<Vec<u8>, BtcHeaderIndex>,
    by_height: Column<Vec<u8>, BlockHash>,
    meta_hash: Column<Vec<u8>, BlockHash>,
    meta_u32: Column<Vec<u8>, u32>,
    meta_bytes32: Column<Vec<u8>, [u8; 32]>,
    cache: HeaderCache,
    available: bool,
}

/// The SPV header store. One coarse mutex guards the DB handle and cache
/// (§4.1 "Concurrency"); every public method takes the lock for its whole
/// duration.
pub struct Store {
    params: NetworkParams,
    inner: Mutex<Inner>,
}

impl Store {
    pub fn new(db: &Database, params: NetworkParams) -> Self {
        Store {
            params,
            inner: Mutex::new(Inner {
                by_hash: db.column(CF_BTCSPV),
                by_height: db.column(CF_BTCSPV),
                meta_hash: db.column(CF_BTCSPV),
                meta_u32: db.column(CF_BTCSPV),
                meta_bytes32: db.column(CF_BTCSPV),
                cache: HeaderCache::new(1000),
                available: true,
            }),
        }
    }

    /// Re-opens the DB handle at `path`, as if after a process restart
    /// (§4.1 "Hot reload"). On failure the store is marked unavailable
    /// until the process restarts.
    pub fn reload(&self, db: &mut Database, path: impl AsRef<std::path::Path>) {
        let mut inner = self.inner.lock().unwrap();
        match db.reload(path) {
            Ok(()) => {
                inner.by_hash = db.column(CF_BTCSPV);
                inner.by_height = db.column(CF_BTCSPV);
                inner.meta_hash = db.column(CF_BTCSPV);
                inner.meta_u32 = db.column(CF_BTCSPV);
                inner.meta_bytes32 = db.column(CF_BTCSPV);
                inner.cache = HeaderCache::new(1000);
                inner.available = true;
            }
            Err(_) => inner.available = false,
        }
    }

    pub fn is_available(&self) -> bool {
        self.inner.lock().unwrap().available
    }

    pub fn get_min_supported_height(&self) -> u32 {
        let inner = self.inner.lock().unwrap();
        inner
            .meta_u32
            .get(&meta_key(KEY_MIN_SUPPORTED))
            .ok()
            .flatten()
            .unwrap_or_else(|| self.params.min_supported_height())
    }

    pub fn best_height(&self) -> u32 {
        let inner = self.inner.lock().unwrap();
        inner.meta_u32.get(&meta_key(KEY_HEIGHT)).ok().flatten().unwrap_or(0)
    }

    pub fn best_tip_hash(&self) -> Option<BlockHash> {
        let inner = self.inner.lock().unwrap();
        inner.meta_hash.get(&meta_key(KEY_TIP)).ok().flatten()
    }

    pub fn best_chain_work(&self) -> Uint256 {
        let inner = self.inner.lock().unwrap();
        inner
            .meta_bytes32
            .get(&meta_key(KEY_WORK))
            .ok()
            .flatten()
            .map(Uint256::from_be_bytes)
            .unwrap_or_else(|| u32_to_u256(0))
    }

    pub fn get_header_by_hash(&self, hash: &BlockHash) -> BathronResult<Option<BtcHeaderIndex>> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(idx) = inner.cache.get(hash) {
            return Ok(Some(idx.clone()));
        }
        let idx = inner.by_hash.get(&hash_index_key(hash))?;
        if let Some(idx) = &idx {
            inner.cache.insert(*hash, idx.clone());
        }
        Ok(idx)
    }

    pub fn get_hash_by_height(&self, height: u32) -> BathronResult<Option<BlockHash>> {
        let inner = self.inner.lock().unwrap();
        inner.by_height.get(&height_hash_key(height))
    }

    pub fn get_header_by_height(&self, height: u32) -> BathronResult<Option<BtcHeaderIndex>> {
        match self.get_hash_by_height(height)? {
            Some(hash) => self.get_header_by_hash(&hash),
            None => Ok(None),
        }
    }

    pub fn is_in_best_chain(&self, hash: &BlockHash) -> BathronResult<bool> {
        let idx = match self.get_header_by_hash(hash)? {
            Some(idx) => idx,
            None => return Ok(false),
        };
        Ok(self.get_hash_by_height(idx.height)?.as_ref() == Some(hash))
    }

    /// `confirmations = best_height - height + 1` for a header on the best
    /// chain; `0` otherwise.
    pub fn get_confirmations(&self, hash: &BlockHash) -> BathronResult<u32> {
        let idx = match self.get_header_by_hash(hash)? {
            Some(idx) => idx,
            None => return Ok(0),
        };
        if !self.is_in_best_chain(hash)? {
            return Ok(0);
        }
        Ok(self.best_height().saturating_sub(idx.height) + 1)
    }

    /// Computes the median of the last 11 ancestor timestamps walking
    /// backward from `parent`, stopping if it runs out of stored ancestors
    /// (§4.1 step 4 "MTP").
    fn median_time_past(&self, parent: &BtcHeaderIndex) -> BathronResult<u32> {
        let mut times = Vec::with_capacity(11);
        let mut cur = Some(parent.clone());
        for _ in 0..11 {
            let Some(h) = cur else { break };
            times.push(h.header.time);
            cur = if h.height == 0 {
                None
            } else {
                self.get_header_by_height(h.height - 1)?
            };
        }
        times.sort_unstable();
        Ok(times[times.len() / 2])
    }

    /// Computes the next required `bits` for a header at `new_height`
    /// (§4.1 step 5, Bitcoin's classic retarget formula).
    fn next_target(&self, new_height: u32, parent: &BtcHeaderIndex) -> BathronResult<Uint256> {
        if new_height % self.params.retarget_interval != 0 {
            return Ok(u256_from_compact(parent.header.bits));
        }
        let first_height = new_height.saturating_sub(self.params.retarget_interval);
        let first = self
            .get_header_by_height(first_height)?
            .ok_or_else(|| BathronError::Storage("missing retarget anchor header".into()))?;

        let actual_timespan = parent.header.time as i64 - first.header.time as i64;
        let target_timespan = self.params.pow_target_timespan as i64;
        let clamped = actual_timespan.clamp(target_timespan / 4, target_timespan * 4) as u32;

        let parent_target = u256_from_compact(parent.header.bits);
        let mut new_target = parent_target * u32_to_u256(clamped) / u32_to_u256(target_timespan as u32);
        // round-trip through compact form, as Bitcoin Core does, so the
        // target we require matches the precision `bits` can actually encode
        new_target = u256_from_compact(crate::btc::header::compact_from_u256(&new_target));

        if new_target > self.params.pow_limit {
            new_target = self.params.pow_limit;
        }
        Ok(new_target)
    }

    /// Re-derives the expected `bits` for a header at `new_height` against
    /// this store's persisted chain (§4.1 step 5). Returns `Ok(None)` if the
    /// header's parent is not yet present in C1 — callers must treat that as
    /// "not yet validated", never as a free pass, since the retarget formula
    /// has nothing to check against.
    pub fn expected_retarget(&self, new_height: u32, header: &BlockHeader) -> BathronResult<Option<Uint256>> {
        match self.get_header_by_hash(&header.prev_blockhash)? {
            Some(parent) => Ok(Some(self.next_target(new_height, &parent)?)),
            None => Ok(None),
        }
    }

    /// Validates and adds a single header (§4.1 "Operations", validation
    /// order 1-8). Returns the outcome directly; only a storage failure
    /// propagates as a `BathronError`.
    pub fn add_header(&self, header: BlockHeader) -> BathronResult<AddHeaderResult> {
        let hash = header.block_hash();

        // 1. Duplicate.
        if let Some(existing) = self.get_header_by_hash(&hash)? {
            let work = existing.chain_work();
            if work > self.best_chain_work() {
                self.activate(&existing)?;
            }
            return Ok(AddHeaderResult::Duplicate);
        }

        // 2. Parent lookup.
        let parent = self.get_header_by_hash(&header.prev_blockhash)?;

        let (new_height, anchor_work) = match &parent {
            Some(parent) => (parent.height + 1, None),
            None => {
                let checkpoint = self
                    .params
                    .spv_checkpoints
                    .iter()
                    .find(|c| c.hash == hash);
                let Some(checkpoint) = checkpoint else {
                    return Ok(AddHeaderResult::Orphan);
                };
                (
                    checkpoint.height,
                    Some(Uint256::from_be_bytes(checkpoint.cumulative_chain_work)),
                )
            }
        };

        // 3. PoW.
        let wrapped = WrappedHeader::new(new_height, header);
        if wrapped.validate_pow(&self.params.pow_limit).is_err() {
            return Ok(AddHeaderResult::InvalidPoW);
        }

        // 4. Timestamp.
        if let Some(parent) = &parent {
            let now = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs() as u32)
                .unwrap_or(0);
            if header.time > now + 2 * 60 * 60 {
                return Ok(AddHeaderResult::InvalidTimestampFuture);
            }
            let mtp = self.median_time_past(parent)?;
            if header.time <= mtp {
                return Ok(AddHeaderResult::InvalidTimestampMtp);
            }
        }

        // 5. Retarget.
        if let Some(parent) = &parent {
            let expected = self.next_target(new_height, parent)?;
            let got = u256_from_compact(header.bits);
            if got != expected {
                if self.params.retarget_log_only {
                    log::warn!(
                        "retarget mismatch at height {} (log-only on {})",
                        new_height,
                        self.params.name
                    );
                } else {
                    return Ok(AddHeaderResult::InvalidRetarget);
                }
            }
        }

        // 6. A7 canonical check.
        if let Some(a7) = self
            .params
            .a7_checkpoints
            .iter()
            .find(|c| c.height == new_height)
        {
            if a7.hash != hash {
                return Ok(AddHeaderResult::InvalidCheckpoint);
            }
        }

        // 7. SPV checkpoint check.
        if let Some(cp) = self
            .params
            .spv_checkpoints
            .iter()
            .find(|c| c.height == new_height)
        {
            if cp.hash != hash {
                return Ok(AddHeaderResult::InvalidCheckpoint);
            }
        }

        // 8. Persist.
        let parent_work = parent
            .as_ref()
            .map(|p| p.chain_work())
            .unwrap_or_else(|| u32_to_u256(0));
        let work = anchor_work.unwrap_or_else(|| parent_work + wrapped.work());
        let idx = BtcHeaderIndex {
            height: new_height,
            chain_work: work.to_be_bytes(),
            header: header.into(),
        };

        {
            let mut inner = self.inner.lock().unwrap();
            inner.by_hash.put(&hash_index_key(&hash), &idx)?;
            inner.cache.insert(hash, idx.clone());
        }

        if work > self.best_chain_work() {
            self.activate(&idx)?;
        }

        Ok(AddHeaderResult::Valid)
    }

    /// `UpdateBestChain`: walks back from `tip` collecting `(height, hash)`
    /// pairs until reaching the old best height, re-verifies every
    /// checkpoint on the new path, and only then writes the new tip
    /// metadata (§4.1).
    fn activate(&self, tip: &BtcHeaderIndex) -> BathronResult<()> {
        let mut path = Vec::new();
        let mut cur = tip.clone();
        loop {
            path.push((cur.height, cur.header.block_hash()));
            if cur.height == 0 {
                break;
            }
            let prev_hash = cur.header.prev_blockhash;
            match self.get_header_by_hash(&prev_hash)? {
                Some(prev) if prev.height + 1 == cur.height => {
                    if prev.height <= self.best_height() && self.is_in_best_chain(&prev_hash)? {
                        break;
                    }
                    cur = prev;
                }
                _ => break,
            }
        }

        let min_supported = self.get_min_supported_height();
        for checkpoint in &self.params.spv_checkpoints {
            if checkpoint.height < min_supported || checkpoint.height > tip.height {
                continue;
            }
            let on_path = path
                .iter()
                .find(|(h, _)| *h == checkpoint.height)
                .map(|(_, hash)| *hash == checkpoint.hash)
                .unwrap_or(true); // below the walked range: assumed already-committed
            if !on_path {
                return Err(BathronError::Storage(
                    "checkpoint violated on activation path; tip not updated".into(),
                ));
            }
        }

        let mut inner = self.inner.lock().unwrap();
        for (height, hash) in path {
            inner.by_height.put(&height_hash_key(height), &hash)?;
        }
        inner
            .meta_hash
            .put(&meta_key(KEY_TIP), &tip.header.block_hash())?;
        inner.meta_u32.put(&meta_key(KEY_HEIGHT), &tip.height)?;
        inner
            .meta_bytes32
            .put(&meta_key(KEY_WORK), &tip.chain_work)?;
        Ok(())
    }

    /// Adds a batch of headers, stopping at the first non-duplicate
    /// rejection (§4.1 `add_headers`).
    pub fn add_headers(
        &self,
        headers: &[BlockHeader],
    ) -> BathronResult<(usize, usize, Option<AddHeaderResult>, Option<BlockHash>)> {
        let mut accepted = 0;
        let mut rejected = 0;
        for h in headers {
            match self.add_header(*h)? {
                AddHeaderResult::Valid | AddHeaderResult::Duplicate => accepted += 1,
                other => {
                    rejected += 1;
                    return Ok((accepted, rejected, Some(other), self.best_tip_hash()));
                }
            }
        }
        Ok((accepted, rejected, None, self.best_tip_hash()))
    }

    /// Verifies a merkle inclusion proof, trying original byte order, fully
    /// reversed, and "txid correct, siblings reversed", succeeding if any
    /// variant matches (§4.1 "Merkle proof verification", R5).
    pub fn verify_merkle_proof(
        &self,
        txid: &Txid,
        merkle_root: &TxMerkleNode,
        siblings: &[[u8; 32]],
        tx_index: u32,
    ) -> ValidationResult<()> {
        if siblings.len() > 30 {
            return Err(rejects::bad_burn_merkle("proof depth exceeds 30"));
        }
        if tx_index >= (1u32 << siblings.len()) {
            return Err(rejects::bad_burn_merkle("tx_index out of range for depth"));
        }

        let txid_bytes: [u8; 32] = txid.to_vec().try_into().unwrap();
        let root_bytes: [u8; 32] = merkle_root.to_vec().try_into().unwrap();

        let reversed = |b: [u8; 32]| -> [u8; 32] {
            let mut r = b;
            r.reverse();
            r
        };

        let attempts: [([u8; 32], [u8; 32], Box<dyn Fn([u8; 32]) -> [u8; 32]>); 3] = [
            (txid_bytes, root_bytes, Box::new(|s| s)),
            (reversed(txid_bytes), reversed(root_bytes), Box::new(reversed)),
            (txid_bytes, root_bytes, Box::new(reversed)),
        ];

        for (leaf, root, sibling_transform) in attempts {
            if merkle_climb(leaf, siblings, tx_index, &sibling_transform) == root {
                return Ok(());
            }
        }
        Err(rejects::bad_burn_merkle(
            "merkle proof did not match root under any byte-order variant",
        ))
    }
}

fn merkle_climb(
    mut cur: [u8; 32],
    siblings: &[[u8; 32]],
    mut index: u32,
    sibling_transform: &dyn Fn([u8; 32]) -> [u8; 32],
) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    for sibling in siblings {
        let sibling = sibling_transform(*sibling);
        let mut buf = [0u8; 64];
        if index & 1 == 1 {
            buf[..32].copy_from_slice(&sibling);
            buf[32..].copy_from_slice(&cur);
        } else {
            buf[..32].copy_from_slice(&cur);
            buf[32..].copy_from_slice(&sibling);
        }
        let first = Sha256::digest(buf);
        let second = Sha256::digest(first);
        cur.copy_from_slice(&second);
        index >>= 1;
    }
    cur
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merkle_climb_single_leaf_is_identity() {
        let leaf = [7u8; 32];
        let result = merkle_climb(leaf, &[], 0, &|b| b);
        assert_eq!(result, leaf);
    }
}
