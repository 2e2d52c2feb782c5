/// The closed tagged union of BATHRON transaction types (§6.1, §9 "Deep
/// inheritance / dynamic dispatch"). Dispatch on `nType` is exhaustive match,
/// never virtual method calls.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[repr(u8)]
pub enum TxType {
    Lock = 20,
    Unlock = 21,
    TransferM1 = 22,
    BurnClaim = 31,
    MintM0Btc = 32,
    BtcHeaders = 33,
}

impl TxType {
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            20 => TxType::Lock,
            21 => TxType::Unlock,
            22 => TxType::TransferM1,
            31 => TxType::BurnClaim,
            32 => TxType::MintM0Btc,
            33 => TxType::BtcHeaders,
            _ => return None,
        })
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    /// Types allowed to carry an output whose scriptPubKey is exactly
    /// `OP_TRUE` (§4.4.3 rule 5, §4.4.1).
    pub fn may_carry_optrue_output(self) -> bool {
        matches!(self, TxType::Lock | TxType::Unlock | TxType::TransferM1)
    }

    pub fn fee_paid_in(self) -> FeeCurrency {
        match self {
            TxType::Lock => FeeCurrency::M0,
            TxType::Unlock | TxType::TransferM1 => FeeCurrency::M1,
            TxType::BurnClaim | TxType::MintM0Btc | TxType::BtcHeaders => FeeCurrency::None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FeeCurrency {
    M0,
    M1,
    None,
}
