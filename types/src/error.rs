use std::fmt;

/// A consensus-visible rejection, returned by every validation path instead of
/// a generic error. Mirrors the source's `CValidationState`: a DoS score, a
/// short stable machine-readable code, and a free-form human reason.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reject {
    pub dos: u32,
    pub code: &'static str,
    pub reason: String,
}

impl Reject {
    pub fn new(dos: u32, code: &'static str, reason: impl Into<String>) -> Self {
        Reject {
            dos,
            code,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for Reject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (dos={}): {}", self.code, self.dos, self.reason)
    }
}

impl std::error::Error for Reject {}

/// Fatal, non-consensus failures: storage I/O, corruption, or bugs. These
/// abort the in-progress block commit rather than reject the transaction.
#[derive(thiserror::Error, Debug)]
pub enum BathronError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("bitcoin consensus encode/decode error: {0}")]
    BitcoinEncode(#[from] bitcoin::consensus::encode::Error),

    #[error("secp256k1 error: {0}")]
    Secp(#[from] bitcoin::secp256k1::Error),

    #[error(transparent)]
    Reject(#[from] Reject),

    #[error("{0}")]
    Other(String),
}

pub type BathronResult<T> = Result<T, BathronError>;

/// Consensus validation result: either accepted, or rejected with a `Reject`.
/// Kept distinct from `BathronResult` so fatal I/O errors (which must abort
/// the block commit) can never be silently treated as a mere rejection.
pub type ValidationResult<T> = Result<T, Reject>;

macro_rules! reject_ctor {
    ($name:ident, $dos:expr, $code:expr) => {
        pub fn $name(reason: impl Into<String>) -> Reject {
            Reject::new($dos, $code, reason)
        }
    };
}

/// Constructors for the stable reject codes named in the external interface.
/// Grouped by DoS score so callers pick the right severity by construction
/// rather than by remembering the right number.
pub mod rejects {
    use super::Reject;

    // --- transaction shape (§7, §4.4.3) ---
    reject_ctor!(bad_tx_version_too_high, 10, "bad-tx-version-too-high");
    reject_ctor!(bad_txns_oversize, 100, "bad-txns-oversize");
    reject_ctor!(bad_txns_vin_empty, 10, "bad-txns-vin-empty");
    reject_ctor!(bad_txns_vout_empty, 10, "bad-txns-vout-empty");
    reject_ctor!(bad_txns_vout_negative, 100, "bad-txns-vout-negative");
    reject_ctor!(bad_txns_vout_toolarge, 100, "bad-txns-vout-toolarge");
    reject_ctor!(
        bad_txns_txouttotal_toolarge,
        100,
        "bad-txns-txouttotal-toolarge"
    );
    reject_ctor!(
        bad_txns_inputs_duplicate,
        100,
        "bad-txns-inputs-duplicate"
    );
    reject_ctor!(bad_txns_prevout_null, 100, "bad-txns-prevout-null");
    reject_ctor!(bad_cb_length, 100, "bad-cb-length");
    reject_ctor!(
        bad_txns_optrue_forbidden,
        100,
        "bad-txns-optrue-forbidden"
    );

    // --- settlement fee (§4.4.1) ---
    reject_ctor!(bad_unlock_fee_missing, 10, "bad-unlock-fee-missing");
    reject_ctor!(bad_unlock_fee_index, 10, "bad-unlock-fee-index");
    reject_ctor!(bad_unlock_fee_script, 100, "bad-unlock-fee-script");
    reject_ctor!(bad_unlock_fee_too_low, 10, "bad-unlock-fee-too-low");
    reject_ctor!(bad_txtransfer_fee_missing, 10, "bad-txtransfer-fee-missing");
    reject_ctor!(bad_txtransfer_fee_index, 10, "bad-txtransfer-fee-index");
    reject_ctor!(bad_txtransfer_fee_script, 100, "bad-txtransfer-fee-script");
    reject_ctor!(bad_txtransfer_fee_too_low, 10, "bad-txtransfer-fee-too-low");

    // --- settlement balance/supply ---
    reject_ctor!(bad_settlement_balance, 100, "bad-settlement-balance");
    reject_ctor!(bad_settlement_invariant, 100, "bad-settlement-invariant");
    reject_ctor!(bad_settlement_receipt_missing, 100, "bad-settlement-receipt-missing");
    reject_ctor!(bad_settlement_vault_missing, 100, "bad-settlement-vault-missing");

    // --- HTLC (§4.5) ---
    reject_ctor!(bad_htlc_version, 100, "bad-htlc-version");
    reject_ctor!(bad_htlc_null_hashlock, 100, "bad-htlc-null-hashlock");
    reject_ctor!(bad_htlc_zero_expiry, 10, "bad-htlc-zero-expiry");
    reject_ctor!(bad_htlc_null_claim, 100, "bad-htlc-null-claim");
    reject_ctor!(bad_htlc_null_refund, 100, "bad-htlc-null-refund");
    reject_ctor!(bad_htlc_covenant_mismatch, 100, "bad-htlc-covenant-mismatch");
    reject_ctor!(bad_htlc_covenant_outputs, 100, "bad-htlc-covenant-outputs");
    reject_ctor!(bad_htlc_not_found, 10, "bad-htlc-not-found");
    reject_ctor!(bad_htlc_not_active, 10, "bad-htlc-not-active");
    reject_ctor!(bad_htlc_expired, 10, "bad-htlc-expired");
    reject_ctor!(bad_htlc_not_expired, 10, "bad-htlc-not-expired");
    reject_ctor!(bad_htlc_script_malformed, 100, "bad-htlc-script-malformed");
    reject_ctor!(bad_htlc3s_version, 100, "bad-htlc3s-version");
    reject_ctor!(bad_htlc3s_null_hashlock, 100, "bad-htlc3s-null-hashlock");
    reject_ctor!(bad_htlc3s_preimage_order, 100, "bad-htlc3s-preimage-order");
    reject_ctor!(bad_htlc3s_script_malformed, 100, "bad-htlc3s-script-malformed");

    // --- header publication (§4.2) ---
    reject_ctor!(bad_btcheaders_payload, 100, "bad-btcheaders-payload");
    reject_ctor!(bad_btcheaders_version, 100, "bad-btcheaders-version");
    reject_ctor!(bad_btcheaders_count, 100, "bad-btcheaders-count");
    reject_ctor!(
        bad_btcheaders_count_mismatch,
        100,
        "bad-btcheaders-count-mismatch"
    );
    reject_ctor!(bad_btcheaders_size, 100, "bad-btcheaders-size");
    reject_ctor!(
        bad_btcheaders_null_publisher,
        100,
        "bad-btcheaders-null-publisher"
    );
    reject_ctor!(bad_btcheaders_empty_sig, 100, "bad-btcheaders-empty-sig");
    reject_ctor!(bad_btcheaders_unknown_mn, 100, "bad-btcheaders-unknown-mn");
    reject_ctor!(bad_btcheaders_sig, 100, "bad-btcheaders-sig");
    reject_ctor!(bad_btcheaders_startheight, 50, "bad-btcheaders-startheight");
    reject_ctor!(
        bad_btcheaders_not_extending_tip,
        50,
        "bad-btcheaders-not-extending-tip"
    );
    reject_ctor!(
        bad_btcheaders_broken_chain,
        100,
        "bad-btcheaders-broken-chain"
    );
    reject_ctor!(bad_btcheaders_pow, 100, "bad-btcheaders-pow");
    reject_ctor!(bad_btcheaders_retarget, 100, "bad-btcheaders-retarget");
    reject_ctor!(
        bad_btcheaders_replay_mismatch,
        100,
        "bad-btcheaders-replay-mismatch"
    );
    reject_ctor!(
        btcheaders_publisher_cooldown,
        10,
        "btcheaders-publisher-cooldown"
    );

    // --- burn claims (§4.3) ---
    reject_ctor!(bad_burn_duplicate, 10, "bad-burn-duplicate");
    reject_ctor!(bad_burn_unknown_block, 100, "bad-burn-unknown-block");
    reject_ctor!(bad_burn_below_min_height, 10, "bad-burn-below-min-height");
    reject_ctor!(bad_burn_merkle, 100, "bad-burn-merkle");
    reject_ctor!(bad_burn_immature, 10, "bad-burn-immature");
    reject_ctor!(bad_burn_no_metadata, 100, "bad-burn-no-metadata");
    reject_ctor!(bad_burn_no_burn_output, 100, "bad-burn-no-burn-output");
    reject_ctor!(bad_burn_bad_magic, 100, "bad-burn-bad-magic");
    reject_ctor!(bad_burn_below_min_amount, 100, "bad-burn-below-min-amount");
    reject_ctor!(bad_burn_not_pending, 100, "bad-burn-not-pending");

    pub fn custom(dos: u32, code: &'static str, reason: impl Into<String>) -> Reject {
        Reject::new(dos, code, reason)
    }
}
