//! Bitcoin header wire type and PoW/work math (§3.1), generalizing the
//! teacher's `WrappedHeader` (`header.rs`) off `bitcoin::BlockHeader` rather
//! than a cosmwasm-serializable wrapper.

use bitcoin::hash_types::BlockHash;
use bitcoin::util::uint::Uint256;
use bitcoin::BlockHeader;

use bathron_types::{rejects, ValidationResult};

/// 80-byte Bitcoin header, stored and hashed exactly as upstream Bitcoin
/// (§3.1 `BtcHeader`). `bitcoin::BlockHeader` already has this layout; we
/// keep a thin wrapper so this module is the single place BATHRON-specific
/// header helpers (`chain_work`, `validate_pow`) live.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WrappedHeader {
    pub height: u32,
    pub header: BlockHeader,
}

impl WrappedHeader {
    pub fn new(height: u32, header: BlockHeader) -> Self {
        WrappedHeader { height, header }
    }

    pub fn block_hash(&self) -> BlockHash {
        self.header.block_hash()
    }

    pub fn prev_blockhash(&self) -> BlockHash {
        self.header.prev_blockhash
    }

    pub fn time(&self) -> u32 {
        self.header.time
    }

    pub fn bits(&self) -> u32 {
        self.header.bits
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Target decoded from `bits`, per the compact representation used by
    /// Bitcoin (§3.1 "target is decoded from `bits`").
    pub fn target(&self) -> Uint256 {
        self.header.target()
    }

    /// `work = (~target / (target + 1)) + 1` (§3.1).
    pub fn work(&self) -> Uint256 {
        self.header.work()
    }

    /// PoW check: decode `bits` into a target in `(0, pow_limit]`, non-zero,
    /// non-overflowing, and require `hash_as_int <= target` (§4.1 step 3).
    pub fn validate_pow(&self, pow_limit: &Uint256) -> ValidationResult<BlockHash> {
        let target = u256_from_compact(self.header.bits);
        if target > *pow_limit || target == u32_to_u256(0) {
            return Err(rejects::bad_btcheaders_pow(
                "target out of bounds [1, pow_limit]",
            ));
        }
        self.header
            .validate_pow(&target)
            .map_err(|_| rejects::bad_btcheaders_pow("hash does not satisfy target"))
    }
}

/// Converts a compact target to a `Uint256` (§3.1 "target is decoded from
/// `bits`").
pub fn u256_from_compact(compact: u32) -> Uint256 {
    BlockHeader::u256_from_compact_target(compact)
}

/// Converts a `Uint256` to a compact target.
pub fn compact_from_u256(target: &Uint256) -> u32 {
    BlockHeader::compact_target_from_u256(target)
}

/// Converts a `u32` to a `Uint256`, used for timespan arithmetic during
/// retarget (§4.1 step 5).
pub fn u32_to_u256(value: u32) -> Uint256 {
    let bytes = value.to_be_bytes();
    let mut buffer = [0u8; 32];
    buffer[32 - bytes.len()..].copy_from_slice(&bytes);
    Uint256::from_be_bytes(buffer)
}
