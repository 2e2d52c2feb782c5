//! C5 Script Engine (§3.5, §4.5): P2SH redeem scripts for 1- and 3-secret
//! HTLCs, CTV-lite template commitments, and the HTLC record lifecycle.
//!
//! Script construction mirrors the teacher's weighted-multisig builder
//! (`signatory.rs`'s `redeem_script`/`from_script` pair): build with the
//! `bitcoin_script!` macro, decode with a token-by-token `Instruction`
//! iterator that rejects anything but the exact expected grammar.

use bitcoin::blockdata::opcodes::all::{
    OP_CHECKSIG, OP_CLTV, OP_DROP, OP_DUP, OP_ELSE, OP_ENDIF, OP_EQUALVERIFY, OP_HASH160, OP_IF,
    OP_SHA256, OP_SIZE,
};
use bitcoin::blockdata::opcodes::{self, all::OP_NOP4};
use bitcoin::blockdata::script::{read_scriptint, Instruction};
use bitcoin::consensus::encode::{Encodable, VarInt};
use bitcoin::hashes::{sha256d, Hash};
use bitcoin::{OutPoint, Script};
use bitcoin_script::bitcoin_script as script;

use bathron_types::{rejects, BathronResult, ValidationResult};

use crate::kv::{Column, Database, WriteBatch, CF_HTLC};
use crate::settlement::TxOutput;

/// `OP_TEMPLATEVERIFY` is not a real rust-bitcoin opcode; per BIP-119 it
/// repurposes the reserved `OP_NOP4` slot. We do the same locally.
const OP_TEMPLATEVERIFY: opcodes::All = OP_NOP4;

pub type Hash256 = [u8; 32];

#[derive(Clone, Copy, PartialEq, Eq, Debug, serde::Serialize, serde::Deserialize)]
pub enum HtlcStatus {
    Active,
    Claimed,
    Refunded,
}

/// `HTLCRecord` (§3.5).
#[derive(Clone, serde::Serialize, serde::Deserialize)]
pub struct HtlcRecord {
    pub htlc_outpoint: OutPoint,
    pub hashlock: Hash256,
    pub source_receipt: OutPoint,
    pub amount: u64,
    pub redeem_script: Vec<u8>,
    pub claim_key_id: [u8; 20],
    pub refund_key_id: [u8; 20],
    pub template_commitment: Option<Hash256>,
    pub covenant_fee: u64,
    pub create_height: u32,
    pub expiry_height: u32,
    pub status: HtlcStatus,
    pub resolve_txid: Option<[u8; 32]>,
    pub preimage: Option<Vec<u8>>,
    pub result_receipt: Option<OutPoint>,
}

/// `HTLC3SRecord` (§3.5): three hashlocks in canonical order
/// `(user, lp1, lp2)`, three preimages revealed together on claim.
#[derive(Clone, serde::Serialize, serde::Deserialize)]
pub struct Htlc3sRecord {
    pub htlc_outpoint: OutPoint,
    pub hashlock_user: Hash256,
    pub hashlock_lp1: Hash256,
    pub hashlock_lp2: Hash256,
    pub source_receipt: OutPoint,
    pub amount: u64,
    pub redeem_script: Vec<u8>,
    pub claim_key_id: [u8; 20],
    pub refund_key_id: [u8; 20],
    pub template_commitment: Option<Hash256>,
    pub covenant_fee: u64,
    pub create_height: u32,
    pub expiry_height: u32,
    pub status: HtlcStatus,
    pub resolve_txid: Option<[u8; 32]>,
    pub preimages: Option<(Vec<u8>, Vec<u8>, Vec<u8>)>,
    pub result_receipt: Option<OutPoint>,
}

#[derive(Clone, serde::Serialize, serde::Deserialize)]
pub struct CreateUndo {
    pub original_receipt_outpoint: OutPoint,
    pub amount: u64,
    pub create_height: u32,
}

// --- 4.5.1 / 4.5.2: 1-secret HTLC, plain and covenant ----------------------

/// Builds the 1-secret HTLC redeem script (§4.5.1/4.5.2).
///
/// Branch A (claim): `OP_IF OP_SIZE 32 OP_EQUALVERIFY OP_SHA256 <H>
/// OP_EQUALVERIFY [<C3> OP_TEMPLATEVERIFY OP_DROP] OP_DUP OP_HASH160
/// <destA>`. Branch B (refund): `OP_ELSE <timelock> OP_CLTV OP_DROP OP_DUP
/// OP_HASH160 <destB>`. Common tail: `OP_ENDIF OP_EQUALVERIFY OP_CHECKSIG`.
pub fn build_htlc_redeem_script(
    hashlock: &Hash256,
    timelock: i64,
    dest_a: &[u8; 20],
    dest_b: &[u8; 20],
    covenant: Option<&Hash256>,
) -> Script {
    let branch_a = script! {
        OP_IF
            OP_SIZE 32 OP_EQUALVERIFY
            OP_SHA256 <hashlock.as_slice()> OP_EQUALVERIFY
            OP_DUP OP_HASH160 <dest_a.as_slice()>
    };
    let mut bytes = branch_a.into_bytes();
    if let Some(commitment) = covenant {
        let covenant_script = script! {
            <commitment.as_slice()> OP_TEMPLATEVERIFY OP_DROP
        };
        bytes.extend(covenant_script.into_bytes());
    }
    let branch_b = script! {
        OP_ELSE
            <timelock> OP_CLTV OP_DROP
            OP_DUP OP_HASH160 <dest_b.as_slice()>
        OP_ENDIF
        OP_EQUALVERIFY OP_CHECKSIG
    };
    bytes.extend(branch_b.into_bytes());
    bytes.into()
}

pub struct HtlcScriptParams {
    pub hashlock: Hash256,
    pub timelock: i64,
    pub dest_a: [u8; 20],
    pub dest_b: [u8; 20],
    pub covenant: Option<Hash256>,
}

/// Decoder contract (§4.5.1 "Decoder contract"): a token-by-token match of
/// the exact expected sequence, rejecting any trailing garbage.
pub fn decode_htlc_redeem_script(script: &Script) -> ValidationResult<HtlcScriptParams> {
    let mut ins = script.instructions().peekable();

    take_op(&mut ins, opcodes::all::OP_IF)?;
    take_op(&mut ins, OP_SIZE)?;
    let size = take_number(&mut ins)?;
    if size != 32 {
        return Err(rejects::bad_htlc_script_malformed("expected size push of 32"));
    }
    take_op(&mut ins, OP_EQUALVERIFY)?;
    take_op(&mut ins, OP_SHA256)?;
    let hashlock = take_hash(&mut ins)?;
    take_op(&mut ins, OP_EQUALVERIFY)?;

    let mut covenant = None;
    // Peek: a covenant script starts with a 32-byte push instead of OP_DUP.
    let is_covenant_push = matches!(ins.peek(), Some(Ok(Instruction::PushBytes(bytes))) if bytes.len() == 32);
    if is_covenant_push {
        let commitment = take_hash(&mut ins)?;
        take_op(&mut ins, OP_TEMPLATEVERIFY)?;
        take_op(&mut ins, OP_DROP)?;
        covenant = Some(commitment);
    }

    take_op(&mut ins, OP_DUP)?;
    take_op(&mut ins, OP_HASH160)?;
    let dest_a = take_hash160(&mut ins)?;
    take_op(&mut ins, OP_ELSE)?;
    let timelock = take_number(&mut ins)?;
    if timelock <= 0 {
        return Err(rejects::bad_htlc_zero_expiry("timelock must be strictly positive"));
    }
    take_op(&mut ins, OP_CLTV)?;
    take_op(&mut ins, OP_DROP)?;
    take_op(&mut ins, OP_DUP)?;
    take_op(&mut ins, OP_HASH160)?;
    let dest_b = take_hash160(&mut ins)?;
    take_op(&mut ins, OP_ENDIF)?;
    take_op(&mut ins, OP_EQUALVERIFY)?;
    take_op(&mut ins, OP_CHECKSIG)?;

    if ins.next().is_some() {
        return Err(rejects::bad_htlc_script_malformed("trailing garbage after script"));
    }

    Ok(HtlcScriptParams {
        hashlock,
        timelock,
        dest_a,
        dest_b,
        covenant,
    })
}

// --- 4.5.3: 3-secret HTLC ---------------------------------------------------

/// Builds the 3-secret HTLC redeem script (§4.5.3): branch A verifies three
/// hashlocks in canonical order `(H_user, H_lp1, H_lp2)`, then a standard
/// P2PKH pattern for `claimDest`; branch B is the CLTV refund.
pub fn build_htlc3s_redeem_script(
    hashlocks: &(Hash256, Hash256, Hash256),
    timelock: i64,
    dest_a: &[u8; 20],
    dest_b: &[u8; 20],
    covenant: Option<&Hash256>,
) -> Script {
    let mut bytes = script! { OP_IF }.into_bytes();
    for h in [&hashlocks.0, &hashlocks.1, &hashlocks.2] {
        let leg = script! {
            OP_SIZE 32 OP_EQUALVERIFY
            OP_SHA256 <h.as_slice()> OP_EQUALVERIFY
        };
        bytes.extend(leg.into_bytes());
    }
    if let Some(commitment) = covenant {
        let covenant_script = script! {
            <commitment.as_slice()> OP_TEMPLATEVERIFY OP_DROP
        };
        bytes.extend(covenant_script.into_bytes());
    }
    let branch_a_tail = script! { OP_DUP OP_HASH160 <dest_a.as_slice()> };
    bytes.extend(branch_a_tail.into_bytes());
    let branch_b = script! {
        OP_ELSE
            <timelock> OP_CLTV OP_DROP
            OP_DUP OP_HASH160 <dest_b.as_slice()>
        OP_ENDIF
        OP_EQUALVERIFY OP_CHECKSIG
    };
    bytes.extend(branch_b.into_bytes());
    bytes.into()
}

pub struct Htlc3sScriptParams {
    pub hashlocks: (Hash256, Hash256, Hash256),
    pub timelock: i64,
    pub dest_a: [u8; 20],
    pub dest_b: [u8; 20],
    pub covenant: Option<Hash256>,
}

pub fn decode_htlc3s_redeem_script(script: &Script) -> ValidationResult<Htlc3sScriptParams> {
    let mut ins = script.instructions().peekable();
    take_op(&mut ins, opcodes::all::OP_IF)?;

    let mut hashes = Vec::with_capacity(3);
    for _ in 0..3 {
        take_op(&mut ins, OP_SIZE)?;
        if take_number(&mut ins)? != 32 {
            return Err(rejects::bad_htlc3s_script_malformed("expected size push of 32"));
        }
        take_op(&mut ins, OP_EQUALVERIFY)?;
        take_op(&mut ins, OP_SHA256)?;
        hashes.push(take_hash(&mut ins)?);
        take_op(&mut ins, OP_EQUALVERIFY)?;
    }
    let hashlocks = (hashes[0], hashes[1], hashes[2]);

    let mut covenant = None;
    let is_covenant_push = matches!(ins.peek(), Some(Ok(Instruction::PushBytes(bytes))) if bytes.len() == 32);
    if is_covenant_push {
        let commitment = take_hash(&mut ins)?;
        take_op(&mut ins, OP_TEMPLATEVERIFY)?;
        take_op(&mut ins, OP_DROP)?;
        covenant = Some(commitment);
    }

    take_op(&mut ins, OP_DUP)?;
    take_op(&mut ins, OP_HASH160)?;
    let dest_a = take_hash160(&mut ins)?;
    take_op(&mut ins, OP_ELSE)?;
    let timelock = take_number(&mut ins)?;
    if timelock <= 0 {
        return Err(rejects::bad_htlc_zero_expiry("timelock must be strictly positive"));
    }
    take_op(&mut ins, OP_CLTV)?;
    take_op(&mut ins, OP_DROP)?;
    take_op(&mut ins, OP_DUP)?;
    take_op(&mut ins, OP_HASH160)?;
    let dest_b = take_hash160(&mut ins)?;
    take_op(&mut ins, OP_ENDIF)?;
    take_op(&mut ins, OP_EQUALVERIFY)?;
    take_op(&mut ins, OP_CHECKSIG)?;

    if ins.next().is_some() {
        return Err(rejects::bad_htlc3s_script_malformed("trailing garbage after script"));
    }

    Ok(Htlc3sScriptParams {
        hashlocks,
        timelock,
        dest_a,
        dest_b,
        covenant,
    })
}

/// Validates that preimages, in canonical `(user, lp1, lp2)` order, hash to
/// the recorded hashlocks (P6).
pub fn check_htlc3s_preimage_order(
    record: &Htlc3sRecord,
    preimages: &(Vec<u8>, Vec<u8>, Vec<u8>),
) -> ValidationResult<()> {
    let checks = [
        (&preimages.0, record.hashlock_user),
        (&preimages.1, record.hashlock_lp1),
        (&preimages.2, record.hashlock_lp2),
    ];
    for (preimage, expected) in checks {
        if sha256(preimage) != expected {
            return Err(rejects::bad_htlc3s_preimage_order(
                "preimage does not match recorded hashlock in canonical order",
            ));
        }
    }
    Ok(())
}

fn sha256(data: &[u8]) -> Hash256 {
    use bitcoin::hashes::sha256;
    sha256::Hash::hash(data).into_inner()
}

// --- script decode helpers (mirrors signatory.rs's take_*) -----------------

type Instructions<'a> = std::iter::Peekable<bitcoin::blockdata::script::Instructions<'a>>;

fn take_instruction<'a>(ins: &mut Instructions<'a>) -> ValidationResult<Instruction<'a>> {
    ins.next()
        .ok_or_else(|| rejects::bad_htlc_script_malformed("unexpected end of script"))?
        .map_err(|_| rejects::bad_htlc_script_malformed("failed to read script"))
}

fn take_bytes<'a>(ins: &mut Instructions<'a>) -> ValidationResult<&'a [u8]> {
    match take_instruction(ins)? {
        Instruction::PushBytes(bytes) => Ok(bytes),
        _ => Err(rejects::bad_htlc_script_malformed("expected data push")),
    }
}

fn take_hash(ins: &mut Instructions<'_>) -> ValidationResult<Hash256> {
    let bytes = take_bytes(ins)?;
    if bytes.len() != 32 {
        return Err(rejects::bad_htlc_script_malformed("expected 32-byte push"));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(bytes);
    Ok(out)
}

fn take_hash160(ins: &mut Instructions<'_>) -> ValidationResult<[u8; 20]> {
    let bytes = take_bytes(ins)?;
    if bytes.len() != 20 {
        return Err(rejects::bad_htlc_script_malformed("expected 20-byte push"));
    }
    let mut out = [0u8; 20];
    out.copy_from_slice(bytes);
    Ok(out)
}

fn take_number(ins: &mut Instructions<'_>) -> ValidationResult<i64> {
    let bytes = take_bytes(ins)?;
    read_scriptint(bytes).map_err(|_| rejects::bad_htlc_script_malformed("failed to read scriptint"))
}

fn take_op(ins: &mut Instructions<'_>, expected: opcodes::All) -> ValidationResult<()> {
    match take_instruction(ins)? {
        Instruction::Op(op) if op == expected => Ok(()),
        _ => Err(rejects::bad_htlc_script_malformed("unexpected opcode")),
    }
}

// --- 4.5.4: template hash (CTV-lite) ----------------------------------------

/// One input as seen by `ComputeTemplateHash`: only the sequence number is
/// committed, never the prevout (§4.5.4).
#[derive(Clone, Copy)]
pub struct TemplateInput {
    pub sequence: u32,
}

/// The subset of a transaction that `ComputeTemplateHash` commits to.
pub struct TemplateTx {
    pub version: i32,
    pub tx_type: u8,
    pub locktime: u32,
    pub inputs: Vec<TemplateInput>,
    pub outputs: Vec<TxOutput>,
}

/// `ComputeTemplateHash(tx)` (§4.5.4): double-SHA256 of `version || type ||
/// locktime || varint(input_count) || sequences[..] || varint(output_count)
/// || for each out: value || scriptPubKey`. Does not commit to prevouts or
/// witnesses.
pub fn compute_template_hash(tx: &TemplateTx) -> Hash256 {
    let mut engine = sha256d::Hash::engine();
    use std::io::Write;
    engine.write_all(&tx.version.to_le_bytes()).unwrap();
    engine.write_all(&[tx.tx_type]).unwrap();
    engine.write_all(&tx.locktime.to_le_bytes()).unwrap();

    let input_count = VarInt(tx.inputs.len() as u64);
    input_count.consensus_encode(&mut engine).unwrap();
    for input in &tx.inputs {
        engine.write_all(&input.sequence.to_le_bytes()).unwrap();
    }

    let output_count = VarInt(tx.outputs.len() as u64);
    output_count.consensus_encode(&mut engine).unwrap();
    for out in &tx.outputs {
        engine.write_all(&out.value.to_le_bytes()).unwrap();
        let script_bytes = out.script_pubkey.as_bytes();
        VarInt(script_bytes.len() as u64)
            .consensus_encode(&mut engine)
            .unwrap();
        engine.write_all(script_bytes).unwrap();
    }

    sha256d::Hash::from_engine(engine).into_inner()
}

/// `OP_TEMPLATEVERIFY` semantics: pops a 32-byte commitment (already done by
/// the caller via the script interpreter) and fails unless it equals the
/// hash of the transaction currently being verified (§4.5.4, P5).
pub fn verify_template(commitment: &Hash256, tx: &TemplateTx) -> ValidationResult<()> {
    if tx.outputs.len() > crate::config::Limits::default().ctv_max_outputs as usize {
        return Err(rejects::bad_htlc_covenant_outputs("template tx exceeds CTV_MAX_OUTPUTS"));
    }
    if &compute_template_hash(tx) != commitment {
        return Err(rejects::bad_htlc_covenant_mismatch(
            "claim tx template hash does not match recorded commitment",
        ));
    }
    Ok(())
}

// --- 4.5.6: key schema and HTLC engine --------------------------------------

fn key_htlc(outpoint: &OutPoint) -> Vec<u8> {
    let mut k = vec![b'H'];
    k.extend_from_slice(&outpoint.txid.to_vec());
    k.extend_from_slice(&outpoint.vout.to_be_bytes());
    k
}
fn key_htlc3s(outpoint: &OutPoint) -> Vec<u8> {
    let mut k = vec![b'3'];
    k.extend_from_slice(&outpoint.txid.to_vec());
    k.extend_from_slice(&outpoint.vout.to_be_bytes());
    k
}
fn key_hashlock(hash: &Hash256, outpoint: &OutPoint) -> Vec<u8> {
    let mut k = vec![b'L'];
    k.extend_from_slice(hash);
    k.extend_from_slice(&outpoint.txid.to_vec());
    k.extend_from_slice(&outpoint.vout.to_be_bytes());
    k
}
fn key_hashlock_prefix(hash: &Hash256) -> Vec<u8> {
    let mut k = vec![b'L'];
    k.extend_from_slice(hash);
    k
}
fn key_hashlock3_user(hash: &Hash256, outpoint: &OutPoint) -> Vec<u8> {
    key_hashlock3_with_prefix(b'U', hash, outpoint)
}
fn key_hashlock3_lp1(hash: &Hash256, outpoint: &OutPoint) -> Vec<u8> {
    key_hashlock3_with_prefix(b'P', hash, outpoint)
}
fn key_hashlock3_lp2(hash: &Hash256, outpoint: &OutPoint) -> Vec<u8> {
    key_hashlock3_with_prefix(b'Q', hash, outpoint)
}
fn key_hashlock3_with_prefix(prefix: u8, hash: &Hash256, outpoint: &OutPoint) -> Vec<u8> {
    let mut k = vec![prefix];
    k.extend_from_slice(hash);
    k.extend_from_slice(&outpoint.txid.to_vec());
    k.extend_from_slice(&outpoint.vout.to_be_bytes());
    k
}
fn key_hashlock3_user_prefix(hash: &Hash256) -> Vec<u8> {
    let mut k = vec![b'U'];
    k.extend_from_slice(hash);
    k
}
fn key_create_undo(txid: &[u8; 32]) -> Vec<u8> {
    let mut k = vec![b'C'];
    k.extend_from_slice(txid);
    k
}
fn key_create_undo3(txid: &[u8; 32]) -> Vec<u8> {
    let mut k = vec![b'Z'];
    k.extend_from_slice(txid);
    k
}
fn key_resolve_undo(txid: &[u8; 32]) -> Vec<u8> {
    let mut k = vec![b'D'];
    k.extend_from_slice(txid);
    k
}
fn key_resolve_undo3(txid: &[u8; 32]) -> Vec<u8> {
    let mut k = vec![b'R'];
    k.extend_from_slice(txid);
    k
}

#[derive(Clone, serde::Serialize, serde::Deserialize)]
pub struct ResolveUndo {
    pub record: HtlcRecordEnum,
}

/// Tagged union so the resolve-undo table can hold either family's
/// pre-resolution record (§4.5.5 "Reorg").
#[derive(Clone, serde::Serialize, serde::Deserialize)]
pub enum HtlcRecordEnum {
    OneSecret(HtlcRecord),
    ThreeSecret(Htlc3sRecord),
}

pub struct HtlcEngine {
    records: Column<Vec<u8>, HtlcRecord>,
    records3: Column<Vec<u8>, Htlc3sRecord>,
    hashlocks: Column<Vec<u8>, ()>,
    hashlocks3: Column<Vec<u8>, ()>,
    create_undo: Column<Vec<u8>, CreateUndo>,
    create_undo3: Column<Vec<u8>, CreateUndo>,
    resolve_undo: Column<Vec<u8>, ResolveUndo>,
}

impl HtlcEngine {
    pub fn new(db: &Database) -> Self {
        HtlcEngine {
            records: db.column(CF_HTLC),
            records3: db.column(CF_HTLC),
            hashlocks: db.column(CF_HTLC),
            hashlocks3: db.column(CF_HTLC),
            create_undo: db.column(CF_HTLC),
            create_undo3: db.column(CF_HTLC),
            resolve_undo: db.column(CF_HTLC),
        }
    }

    pub fn get(&self, outpoint: &OutPoint) -> BathronResult<Option<HtlcRecord>> {
        self.records.get(&key_htlc(outpoint))
    }
    pub fn get3(&self, outpoint: &OutPoint) -> BathronResult<Option<Htlc3sRecord>> {
        self.records3.get(&key_htlc3s(outpoint))
    }

    pub fn get_create_undo(&self, create_txid: &[u8; 32]) -> BathronResult<Option<CreateUndo>> {
        self.create_undo.get(&key_create_undo(create_txid))
    }
    pub fn get_create_undo3(&self, create_txid: &[u8; 32]) -> BathronResult<Option<CreateUndo>> {
        self.create_undo3.get(&key_create_undo3(create_txid))
    }

    /// CREATE (§4.5.5): one 1-secret HTLC record, fed from an M1 receipt.
    pub fn create(
        &self,
        batch: &mut WriteBatch,
        record: &HtlcRecord,
        create_txid: [u8; 32],
    ) -> ValidationResult<()> {
        if record.expiry_height <= record.create_height {
            return Err(rejects::bad_htlc_zero_expiry("expiry must be after create height"));
        }
        let limits = crate::config::Limits::default();
        let span = record.expiry_height - record.create_height;
        if span < limits.htlc_min_expiry_blocks {
            return Err(rejects::bad_htlc_zero_expiry("expiry span below HTLC_MIN_EXPIRY_BLOCKS"));
        }
        if span > limits.htlc_max_expiry_blocks {
            return Err(rejects::bad_htlc_zero_expiry("expiry span above HTLC_MAX_EXPIRY_BLOCKS"));
        }

        batch
            .put(CF_HTLC, &key_htlc(&record.htlc_outpoint), record)
            .map_err(|e| rejects::bad_htlc_script_malformed(e.to_string()))?;
        batch
            .put(
                CF_HTLC,
                &key_hashlock(&record.hashlock, &record.htlc_outpoint),
                &(),
            )
            .map_err(|e| rejects::bad_htlc_script_malformed(e.to_string()))?;
        batch
            .put(
                CF_HTLC,
                &key_create_undo(&create_txid),
                &CreateUndo {
                    original_receipt_outpoint: record.source_receipt,
                    amount: record.amount,
                    create_height: record.create_height,
                },
            )
            .map_err(|e| rejects::bad_htlc_script_malformed(e.to_string()))?;
        Ok(())
    }

    /// CREATE for the 3-secret variant; indexes all three hashlock tables in
    /// canonical `(user, lp1, lp2)` order.
    pub fn create3(
        &self,
        batch: &mut WriteBatch,
        record: &Htlc3sRecord,
        create_txid: [u8; 32],
    ) -> ValidationResult<()> {
        let limits = crate::config::Limits::default();
        if record.expiry_height <= record.create_height {
            return Err(rejects::bad_htlc_zero_expiry("expiry must be after create height"));
        }
        let span = record.expiry_height - record.create_height;
        if span < limits.htlc_min_expiry_blocks || span > limits.htlc_max_expiry_blocks {
            return Err(rejects::bad_htlc_zero_expiry("expiry span out of bounds"));
        }

        batch
            .put(CF_HTLC, &key_htlc3s(&record.htlc_outpoint), record)
            .map_err(|e| rejects::bad_htlc3s_script_malformed(e.to_string()))?;
        batch
            .put(
                CF_HTLC,
                &key_hashlock3_user(&record.hashlock_user, &record.htlc_outpoint),
                &(),
            )
            .map_err(|e| rejects::bad_htlc3s_script_malformed(e.to_string()))?;
        batch
            .put(
                CF_HTLC,
                &key_hashlock3_lp1(&record.hashlock_lp1, &record.htlc_outpoint),
                &(),
            )
            .map_err(|e| rejects::bad_htlc3s_script_malformed(e.to_string()))?;
        batch
            .put(
                CF_HTLC,
                &key_hashlock3_lp2(&record.hashlock_lp2, &record.htlc_outpoint),
                &(),
            )
            .map_err(|e| rejects::bad_htlc3s_script_malformed(e.to_string()))?;
        batch
            .put(
                CF_HTLC,
                &key_create_undo3(&create_txid),
                &CreateUndo {
                    original_receipt_outpoint: record.source_receipt,
                    amount: record.amount,
                    create_height: record.create_height,
                },
            )
            .map_err(|e| rejects::bad_htlc3s_script_malformed(e.to_string()))?;
        Ok(())
    }

    /// CLAIM or REFUND for the 1-secret variant (§4.5.5): checks status,
    /// hashlock/covenant/timelock depending on branch, then transitions.
    pub fn resolve(
        &self,
        batch: &mut WriteBatch,
        outpoint: &OutPoint,
        resolve_txid: [u8; 32],
        current_height: u32,
        branch: ResolveBranch,
        result_receipt: OutPoint,
    ) -> ValidationResult<HtlcRecord> {
        let mut record = self
            .get(outpoint)
            .map_err(|e| rejects::bad_htlc_not_found(e.to_string()))?
            .ok_or_else(|| rejects::bad_htlc_not_found("htlc record not found"))?;
        if record.status != HtlcStatus::Active {
            return Err(rejects::bad_htlc_not_active("htlc is not active"));
        }

        match &branch {
            ResolveBranch::Claim { preimage, claim_tx_template } => {
                if sha256(preimage) != record.hashlock {
                    return Err(rejects::bad_htlc_null_claim("preimage does not match hashlock"));
                }
                if let Some(commitment) = &record.template_commitment {
                    let template = claim_tx_template.as_ref().ok_or_else(|| {
                        rejects::bad_htlc_covenant_mismatch("covenant htlc claimed without a template")
                    })?;
                    verify_template(commitment, template)?;
                }
            }
            ResolveBranch::Refund => {
                if current_height < record.expiry_height {
                    return Err(rejects::bad_htlc_not_expired("refund before expiry height"));
                }
            }
        }

        let pre_resolution = record.clone();
        batch
            .put(
                CF_HTLC,
                &key_resolve_undo(&resolve_txid),
                &ResolveUndo {
                    record: HtlcRecordEnum::OneSecret(pre_resolution),
                },
            )
            .map_err(|e| rejects::bad_htlc_script_malformed(e.to_string()))?;

        record.status = match &branch {
            ResolveBranch::Claim { .. } => HtlcStatus::Claimed,
            ResolveBranch::Refund => HtlcStatus::Refunded,
        };
        record.resolve_txid = Some(resolve_txid);
        record.result_receipt = Some(result_receipt);
        if let ResolveBranch::Claim { preimage, .. } = &branch {
            record.preimage = Some(preimage.clone());
        }

        batch
            .put(CF_HTLC, &key_htlc(outpoint), &record)
            .map_err(|e| rejects::bad_htlc_script_malformed(e.to_string()))?;
        Ok(record)
    }

    /// CLAIM or REFUND for the 3-secret variant.
    pub fn resolve3(
        &self,
        batch: &mut WriteBatch,
        outpoint: &OutPoint,
        resolve_txid: [u8; 32],
        current_height: u32,
        branch: Resolve3Branch,
        result_receipt: OutPoint,
    ) -> ValidationResult<Htlc3sRecord> {
        let mut record = self
            .get3(outpoint)
            .map_err(|e| rejects::bad_htlc_not_found(e.to_string()))?
            .ok_or_else(|| rejects::bad_htlc_not_found("htlc3s record not found"))?;
        if record.status != HtlcStatus::Active {
            return Err(rejects::bad_htlc_not_active("htlc3s is not active"));
        }

        match &branch {
            Resolve3Branch::Claim { preimages, claim_tx_template } => {
                check_htlc3s_preimage_order(&record, preimages)?;
                if let Some(commitment) = &record.template_commitment {
                    let template = claim_tx_template.as_ref().ok_or_else(|| {
                        rejects::bad_htlc_covenant_mismatch("covenant htlc3s claimed without a template")
                    })?;
                    verify_template(commitment, template)?;
                }
            }
            Resolve3Branch::Refund => {
                if current_height < record.expiry_height {
                    return Err(rejects::bad_htlc_not_expired("refund before expiry height"));
                }
            }
        }

        let pre_resolution = record.clone();
        batch
            .put(
                CF_HTLC,
                &key_resolve_undo3(&resolve_txid),
                &ResolveUndo {
                    record: HtlcRecordEnum::ThreeSecret(pre_resolution),
                },
            )
            .map_err(|e| rejects::bad_htlc3s_script_malformed(e.to_string()))?;

        record.status = match &branch {
            Resolve3Branch::Claim { .. } => HtlcStatus::Claimed,
            Resolve3Branch::Refund => HtlcStatus::Refunded,
        };
        record.resolve_txid = Some(resolve_txid);
        record.result_receipt = Some(result_receipt);
        if let Resolve3Branch::Claim { preimages, .. } = &branch {
            record.preimages = Some(preimages.clone());
        }

        batch
            .put(CF_HTLC, &key_htlc3s(outpoint), &record)
            .map_err(|e| rejects::bad_htlc3s_script_malformed(e.to_string()))?;
        Ok(record)
    }

    /// Disconnects a CREATE (§4.5.5 "Reorg"): deletes the record, restores
    /// the original receipt (caller's responsibility via settlement), and
    /// erases the hashlock index.
    pub fn disconnect_create(&self, batch: &mut WriteBatch, record: &HtlcRecord, create_txid: &[u8; 32]) {
        batch.delete(CF_HTLC, &key_htlc(&record.htlc_outpoint));
        batch.delete(CF_HTLC, &key_hashlock(&record.hashlock, &record.htlc_outpoint));
        batch.delete(CF_HTLC, &key_create_undo(create_txid));
    }

    pub fn disconnect_create3(&self, batch: &mut WriteBatch, record: &Htlc3sRecord, create_txid: &[u8; 32]) {
        batch.delete(CF_HTLC, &key_htlc3s(&record.htlc_outpoint));
        batch.delete(
            CF_HTLC,
            &key_hashlock3_user(&record.hashlock_user, &record.htlc_outpoint),
        );
        batch.delete(
            CF_HTLC,
            &key_hashlock3_lp1(&record.hashlock_lp1, &record.htlc_outpoint),
        );
        batch.delete(
            CF_HTLC,
            &key_hashlock3_lp2(&record.hashlock_lp2, &record.htlc_outpoint),
        );
        batch.delete(CF_HTLC, &key_create_undo3(create_txid));
    }

    /// Disconnects a CLAIM/REFUND: rewrites the HTLC back to `Active`,
    /// re-inserts the hashlock index, and erases the resolve-undo record.
    pub fn disconnect_resolve(&self, batch: &mut WriteBatch, resolve_txid: &[u8; 32]) -> BathronResult<()> {
        if let Some(ResolveUndo { record }) = self.resolve_undo.get(&key_resolve_undo(resolve_txid))? {
            match record {
                HtlcRecordEnum::OneSecret(r) => {
                    batch.put(CF_HTLC, &key_htlc(&r.htlc_outpoint), &r)?;
                    batch.put(CF_HTLC, &key_hashlock(&r.hashlock, &r.htlc_outpoint), &())?;
                }
                HtlcRecordEnum::ThreeSecret(_) => {}
            }
        } else if let Some(ResolveUndo { record }) =
            self.resolve_undo.get(&key_resolve_undo3(resolve_txid))?
        {
            if let HtlcRecordEnum::ThreeSecret(r) = record {
                batch.put(CF_HTLC, &key_htlc3s(&r.htlc_outpoint), &r)?;
                batch.put(CF_HTLC, &key_hashlock3_user(&r.hashlock_user, &r.htlc_outpoint), &())?;
                batch.put(CF_HTLC, &key_hashlock3_lp1(&r.hashlock_lp1, &r.htlc_outpoint), &())?;
                batch.put(CF_HTLC, &key_hashlock3_lp2(&r.hashlock_lp2, &r.htlc_outpoint), &())?;
            }
        }
        batch.delete(CF_HTLC, &key_resolve_undo(resolve_txid));
        batch.delete(CF_HTLC, &key_resolve_undo3(resolve_txid));
        Ok(())
    }

    /// Lookup by hashlock (§4.5.6): iterates by prefix, returns all matching
    /// outpoints. Used by off-chain swap agents watching for a revealed
    /// secret on another chain.
    pub fn find_by_hashlock(&self, hash: &Hash256) -> BathronResult<Vec<OutPoint>> {
        let entries = self.hashlocks.iter_prefix(&key_hashlock_prefix(hash))?;
        Ok(entries
            .into_iter()
            .filter_map(|(key, _)| parse_hashlock_key_outpoint(&key, 1))
            .collect())
    }

    pub fn find_by_hashlock_user(&self, hash: &Hash256) -> BathronResult<Vec<OutPoint>> {
        let entries = self.hashlocks3.iter_prefix(&key_hashlock3_user_prefix(hash))?;
        Ok(entries
            .into_iter()
            .filter_map(|(key, _)| parse_hashlock_key_outpoint(&key, 1))
            .collect())
    }
}

fn parse_hashlock_key_outpoint(key: &[u8], prefix_and_hash_len: usize) -> Option<OutPoint> {
    let body = &key[prefix_and_hash_len + 32..];
    if body.len() != 36 {
        return None;
    }
    let txid = bitcoin::Txid::from_slice(&body[..32]).ok()?;
    let vout = u32::from_be_bytes(body[32..36].try_into().ok()?);
    Some(OutPoint { txid, vout })
}

pub enum ResolveBranch {
    Claim {
        preimage: Vec<u8>,
        claim_tx_template: Option<TemplateTx>,
    },
    Refund,
}

pub enum Resolve3Branch {
    Claim {
        preimages: (Vec<u8>, Vec<u8>, Vec<u8>),
        claim_tx_template: Option<TemplateTx>,
    },
    Refund,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn htlc_redeem_script_round_trips() {
        let hashlock = [7u8; 32];
        let dest_a = [1u8; 20];
        let dest_b = [2u8; 20];
        let script = build_htlc_redeem_script(&hashlock, 500_000, &dest_a, &dest_b, None);
        let decoded = decode_htlc_redeem_script(&script).unwrap();
        assert_eq!(decoded.hashlock, hashlock);
        assert_eq!(decoded.timelock, 500_000);
        assert_eq!(decoded.dest_a, dest_a);
        assert_eq!(decoded.dest_b, dest_b);
        assert!(decoded.covenant.is_none());
    }

    #[test]
    fn htlc_redeem_script_with_covenant_round_trips() {
        let hashlock = [9u8; 32];
        let commitment = [3u8; 32];
        let dest_a = [4u8; 20];
        let dest_b = [5u8; 20];
        let script = build_htlc_redeem_script(&hashlock, 10, &dest_a, &dest_b, Some(&commitment));
        let decoded = decode_htlc_redeem_script(&script).unwrap();
        assert_eq!(decoded.covenant, Some(commitment));
    }

    #[test]
    fn htlc3s_redeem_script_round_trips() {
        let hashlocks = ([1u8; 32], [2u8; 32], [3u8; 32]);
        let dest_a = [6u8; 20];
        let dest_b = [7u8; 20];
        let script = build_htlc3s_redeem_script(&hashlocks, 777, &dest_a, &dest_b, None);
        let decoded = decode_htlc3s_redeem_script(&script).unwrap();
        assert_eq!(decoded.hashlocks, hashlocks);
        assert_eq!(decoded.timelock, 777);
    }

    #[test]
    fn template_hash_is_order_sensitive_on_outputs() {
        let tx = TemplateTx {
            version: 1,
            tx_type: 21,
            locktime: 0,
            inputs: vec![TemplateInput { sequence: 0xffffffff }],
            outputs: vec![TxOutput {
                value: 1000,
                script_pubkey: crate::settlement::op_true_script(),
            }],
        };
        let h1 = compute_template_hash(&tx);
        let mut tx2 = tx;
        tx2.outputs.push(TxOutput {
            value: 1,
            script_pubkey: crate::settlement::op_true_script(),
        });
        let h2 = compute_template_hash(&tx2);
        assert_ne!(h1, h2);
    }
}
