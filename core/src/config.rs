//! Network parameters, checkpoint tables, and the numeric limits from §6.5.
//!
//! These are plain in-memory structs with per-network defaults; parsing them
//! from a config file is out of scope (§1) and left to a caller.

use bitcoin::BlockHash;

/// `BTCHEADERS_*` and HTLC/CTV limits (§6.5).
#[derive(Clone, Copy, Debug)]
pub struct Limits {
    pub btcheaders_max_count: u16,
    pub btcheaders_default_count: u16,
    pub btcheaders_genesis_max_count: u16,
    pub btcheaders_max_payload_size: usize,
    pub btcheaders_publisher_cooldown: u32,
    pub htlc_min_expiry_blocks: u32,
    pub htlc_max_expiry_blocks: u32,
    pub htlc_preimage_size: usize,
    pub ctv_max_outputs: usize,
    pub ctv_fixed_fee: u64,
    pub btc_confirmations_k: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            btcheaders_max_count: 1000,
            btcheaders_default_count: 100,
            btcheaders_genesis_max_count: 5000,
            btcheaders_max_payload_size: 500_000,
            btcheaders_publisher_cooldown: 3,
            htlc_min_expiry_blocks: 6,
            htlc_max_expiry_blocks: 4320,
            htlc_preimage_size: 32,
            ctv_max_outputs: 4,
            ctv_fixed_fee: 200,
            btc_confirmations_k: 6,
        }
    }
}

/// An SPV checkpoint: `(height, hash, cumulative_chain_work)` (§3.1).
#[derive(Clone, Copy, Debug)]
pub struct SpvCheckpoint {
    pub height: u32,
    pub hash: BlockHash,
    /// Cumulative chain work at this checkpoint, big-endian bytes (no native
    /// `serde`/`Copy`-friendly encoding for `Uint256`).
    pub cumulative_chain_work: [u8; 32],
}

/// An A7 canonical-chain checkpoint: `(height, expected_hash)` (§3.1, §4.1 rule 6).
#[derive(Clone, Copy, Debug)]
pub struct A7Checkpoint {
    pub height: u32,
    pub hash: BlockHash,
}

/// Bitcoin consensus parameters needed by C1's PoW/retarget math (§4.1).
#[derive(Clone, Debug)]
pub struct NetworkParams {
    pub name: &'static str,
    pub pow_limit: bitcoin::util::uint::Uint256,
    pub pow_target_timespan: u32,
    pub pow_target_spacing: u32,
    pub retarget_interval: u32,
    /// Downgrades retarget mismatches to a log-only warning (§4.1 step 5,
    /// §9 open question — kept as an explicit escape hatch, defaulting off).
    pub retarget_log_only: bool,
    pub magic: &'static [u8; 7],
    pub burn_network_tag: u8,
    pub spv_checkpoints: Vec<SpvCheckpoint>,
    pub a7_checkpoints: Vec<A7Checkpoint>,
    pub limits: Limits,
}

impl NetworkParams {
    /// `min_supported_height` is defined by the lowest SPV checkpoint (§3.1).
    pub fn min_supported_height(&self) -> u32 {
        self.spv_checkpoints
            .iter()
            .map(|c| c.height)
            .min()
            .unwrap_or(0)
    }

    pub fn retarget_interval(&self) -> u32 {
        self.pow_target_timespan / self.pow_target_spacing
    }

    pub fn mainnet() -> Self {
        NetworkParams {
            name: "mainnet",
            pow_limit: bitcoin::util::uint::Uint256::from_be_bytes([
                0x00, 0x00, 0x00, 0x00, 0xff, 0xff, 0xff, 0xff, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
                0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
                0x00, 0x00, 0x00, 0x00,
            ]),
            pow_target_timespan: 14 * 24 * 60 * 60,
            pow_target_spacing: 10 * 60,
            retarget_interval: 2016,
            retarget_log_only: false,
            magic: b"BATHRON",
            burn_network_tag: 0x01,
            spv_checkpoints: Vec::new(),
            a7_checkpoints: Vec::new(),
            limits: Limits::default(),
        }
    }

    pub fn testnet() -> Self {
        NetworkParams {
            name: "testnet",
            retarget_log_only: true,
            burn_network_tag: 0x02,
            ..Self::mainnet()
        }
    }
}
