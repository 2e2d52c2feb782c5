//! Cooperative header publisher (§4.2.4 "Auxiliary tasks"): a masternode
//! operator's periodic task that notices C1's SPV tip has pulled ahead of
//! C2's on-chain ledger and emits a signed `TX_BTC_HEADERS` to catch it up.
//! Validation itself lives in [`crate::ledger::Ledger::validate_publication`]
//! — this module only decides *when* to try and how hard to back off after
//! a rejection.

use std::sync::Mutex;
use std::time::Duration;

use bitcoin::secp256k1::{self, ecdsa, Message as SecpMessage, Secp256k1, SecretKey};

use crate::btc::spv::Store as SpvStore;
use crate::config::NetworkParams;
use crate::ledger::{BtcHeadersPayload, Ledger, OperatorPubkey};

/// Default tick period; callers are free to drive [`Publisher::tick`] on
/// whatever schedule they like, clamped the same way at construction.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(60);
const MIN_TICK_INTERVAL: Duration = Duration::from_secs(10);
const MAX_TICK_INTERVAL: Duration = Duration::from_secs(600);

/// Where a built, signed payload goes next. Mempool admission and gossip are
/// out of scope (§1) — this is the seam a caller wires to its own relay.
pub trait MempoolSink {
    fn submit(&self, payload: &BtcHeadersPayload) -> Result<(), String>;
}

struct BackoffState {
    consecutive_failures: u32,
    next_attempt_after: Option<std::time::Instant>,
}

/// Drives the catch-up decision and exponential backoff for one masternode
/// operator identity. Stateless about validation rules — it builds a
/// candidate payload and lets the caller's submitter decide whether it was
/// accepted.
pub struct Publisher {
    pro_tx_hash: [u8; 32],
    operator_key: SecretKey,
    operator_pubkey: OperatorPubkey,
    tick_interval: Duration,
    backoff: Mutex<BackoffState>,
}

impl Publisher {
    pub fn new(pro_tx_hash: [u8; 32], operator_key: SecretKey, tick_interval: Duration) -> Self {
        let secp = Secp256k1::signing_only();
        let operator_pubkey = OperatorPubkey::from_secret_key(&secp, &operator_key);
        let clamped = tick_interval.clamp(MIN_TICK_INTERVAL, MAX_TICK_INTERVAL);
        Publisher {
            pro_tx_hash,
            operator_key,
            operator_pubkey,
            tick_interval: clamped,
            backoff: Mutex::new(BackoffState {
                consecutive_failures: 0,
                next_attempt_after: None,
            }),
        }
    }

    pub fn operator_pubkey(&self) -> OperatorPubkey {
        self.operator_pubkey
    }

    pub fn tick_interval(&self) -> Duration {
        self.tick_interval
    }

    /// One tick: if C1 is ahead of C2 and backoff allows it, builds, signs,
    /// and submits a catch-up `TX_BTC_HEADERS` payload. Returns `None` when
    /// there was nothing to publish or backoff is still in effect.
    pub fn tick(
        &self,
        ledger: &Ledger,
        spv: &SpvStore,
        params: &NetworkParams,
        submitter: &dyn MempoolSink,
    ) -> Option<Result<(), String>> {
        {
            let backoff = self.backoff.lock().unwrap();
            if let Some(not_before) = backoff.next_attempt_after {
                if std::time::Instant::now() < not_before {
                    return None;
                }
            }
        }

        let payload = self.build_catchup_payload(ledger, spv, params)?;
        let result = submitter.submit(&payload);
        self.record_outcome(&result);
        Some(result)
    }

    fn build_catchup_payload(
        &self,
        ledger: &Ledger,
        spv: &SpvStore,
        params: &NetworkParams,
    ) -> Option<BtcHeadersPayload> {
        let tip_height = ledger.tip_height().ok()?;
        let start_height = if ledger.is_empty().ok()? { 0 } else { tip_height + 1 };
        let spv_best = spv.best_height();
        if spv_best < start_height {
            return None;
        }
        let available = spv_best - start_height + 1;
        let count = available.min(params.limits.btcheaders_default_count as u32);
        if count == 0 {
            return None;
        }

        let mut headers = Vec::with_capacity(count as usize);
        for h in start_height..start_height + count {
            let idx = spv.get_header_by_height(h).ok()??;
            headers.push(idx.wrapped().header);
        }

        let mut payload = BtcHeadersPayload {
            version: 1,
            publisher_pro_tx_hash: self.pro_tx_hash,
            start_height,
            count: count as u16,
            headers,
            sig: Vec::new(),
        };
        payload.sig = self.sign(&payload);
        Some(payload)
    }

    fn sign(&self, payload: &BtcHeadersPayload) -> Vec<u8> {
        let sighash = payload.sighash();
        let msg = SecpMessage::from_slice(sighash.as_ref()).expect("sha256d output is 32 bytes");
        let secp = Secp256k1::signing_only();
        let sig: ecdsa::Signature = secp.sign_ecdsa(&msg, &self.operator_key);
        sig.serialize_der().to_vec()
    }

    fn record_outcome(&self, result: &Result<(), String>) {
        let mut backoff = self.backoff.lock().unwrap();
        match result {
            Ok(()) => {
                backoff.consecutive_failures = 0;
                backoff.next_attempt_after = None;
            }
            Err(_) => {
                backoff.consecutive_failures = backoff.consecutive_failures.saturating_add(1);
                let exp = backoff.consecutive_failures.min(6);
                let secs = self.tick_interval.as_secs().saturating_mul(1u64 << exp);
                let capped = secs.min(MAX_TICK_INTERVAL.as_secs() * 8);
                backoff.next_attempt_after =
                    Some(std::time::Instant::now() + Duration::from_secs(capped));
            }
        }
    }
}
