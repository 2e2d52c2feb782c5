//! Cross-component scenarios for C4 (§8): LOCK → UNLOCK round trip and
//! TRANSFER_M1, each checked for I6 and then undone, mirroring the teacher's
//! own `tests/helper.rs` fixture-per-file style. Seeds state only through
//! `Settlement`'s own public apply methods, never by hand-crafting storage
//! keys.

use bitcoin::hashes::Hash;
use bitcoin::{OutPoint, Txid};

use bathron_consensus::kv::Database;
use bathron_consensus::settlement::{op_true_script, M1Receipt, Settlement, SettlementTx, TxInput, TxOutput};
use bathron_types::TxType;

fn fixture() -> (tempfile::TempDir, Database) {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path()).unwrap();
    (dir, db)
}

fn txid_n(n: u8) -> Txid {
    Txid::from_slice(&[n; 32]).unwrap()
}

fn plain_script() -> bitcoin::Script {
    bitcoin::Script::from(vec![0x76, 0xa9, 0x14]) // arbitrary non-OP_TRUE bytes
}

#[test]
fn lock_then_unlock_round_trip_and_disconnect() {
    let (_dir, db) = fixture();
    let settlement = Settlement::new(&db);
    let source: [u8; 20] = [1u8; 20];

    // Seed an M0 balance the way a matured burn claim would (C3's pipeline
    // itself is covered in burn_lifecycle.rs).
    let mut batch = db.batch();
    settlement.apply_mint(&mut batch, &source, 1_000).unwrap();
    batch.commit().unwrap();
    assert_eq!(settlement.balance(&source).unwrap(), 1_000);

    let lock_tx = SettlementTx {
        n_type: TxType::Lock,
        version: 1,
        vin: vec![],
        vout: vec![
            TxOutput { value: 400, script_pubkey: op_true_script() },
            TxOutput { value: 400, script_pubkey: plain_script() },
        ],
        size_bytes: 200,
        fee_rate_sat_per_kvb: 1000,
    };
    settlement.check_transaction(&lock_tx, false).unwrap();

    let receipt_outpoint = OutPoint { txid: txid_n(1), vout: 1 };
    let vault_outpoint = OutPoint { txid: txid_n(1), vout: 0 };
    let mut batch = db.batch();
    let delta = settlement
        .apply_lock(&mut batch, &lock_tx, receipt_outpoint, &source, 10)
        .unwrap();
    assert_eq!(delta.vault_delta, 400);
    assert_eq!(delta.receipt_delta, 400);
    batch.commit().unwrap();

    assert_eq!(settlement.balance(&source).unwrap(), 600);
    let receipt = settlement.receipt(&receipt_outpoint).unwrap().unwrap();
    assert_eq!(receipt.amount, 400);
    assert_eq!(settlement.vault(&vault_outpoint).unwrap(), Some(400));

    // UNLOCK spends both the receipt and its paired vault output back,
    // minus a fee.
    let unlock_tx = SettlementTx {
        n_type: TxType::Unlock,
        version: 1,
        vin: vec![
            TxInput { prevout: receipt_outpoint },
            TxInput { prevout: vault_outpoint },
        ],
        vout: vec![TxOutput { value: 5, script_pubkey: op_true_script() }],
        size_bytes: 200,
        fee_rate_sat_per_kvb: 1000,
    };
    settlement.check_transaction(&unlock_tx, false).unwrap();

    let mut batch = db.batch();
    let delta = settlement
        .apply_unlock(&mut batch, &unlock_tx, &receipt_outpoint, &vault_outpoint, &source, 0)
        .unwrap();
    assert_eq!(delta.vault_delta, -400);
    assert_eq!(delta.receipt_delta, -400);
    batch.commit().unwrap();

    assert_eq!(settlement.balance(&source).unwrap(), 600 + (400 - 5));
    assert!(settlement.receipt(&receipt_outpoint).unwrap().is_none());
    assert!(settlement.vault(&vault_outpoint).unwrap().is_none());

    // Disconnect restores the receipt and vault, and claws back exactly
    // what was credited, not the full original amount.
    let mut batch = db.batch();
    let original = M1Receipt { amount: 400, create_height: 10 };
    settlement
        .disconnect_unlock(&mut batch, &receipt_outpoint, &vault_outpoint, &original, &source, 395)
        .unwrap();
    batch.commit().unwrap();

    assert_eq!(settlement.balance(&source).unwrap(), 600);
    assert_eq!(settlement.receipt(&receipt_outpoint).unwrap().unwrap().amount, 400);
    assert_eq!(settlement.vault(&vault_outpoint).unwrap(), Some(400));
}

#[test]
fn transfer_m1_conserves_value_and_i6_holds_trivially() {
    let (_dir, db) = fixture();
    let settlement = Settlement::new(&db);
    let source: [u8; 20] = [2u8; 20];

    // Seed one M1 receipt via a legitimate LOCK, as a real TRANSFER_M1's
    // input receipt would have been created.
    let mut batch = db.batch();
    settlement.apply_mint(&mut batch, &source, 1_000).unwrap();
    batch.commit().unwrap();

    let seed_lock_tx = SettlementTx {
        n_type: TxType::Lock,
        version: 1,
        vin: vec![],
        vout: vec![
            TxOutput { value: 1000, script_pubkey: op_true_script() },
            TxOutput { value: 1000, script_pubkey: plain_script() },
        ],
        size_bytes: 200,
        fee_rate_sat_per_kvb: 1000,
    };
    let in_outpoint = OutPoint { txid: txid_n(2), vout: 0 };
    let mut batch = db.batch();
    settlement
        .apply_lock(&mut batch, &seed_lock_tx, in_outpoint, &source, 1)
        .unwrap();
    batch.commit().unwrap();

    let transfer_tx = SettlementTx {
        n_type: TxType::TransferM1,
        version: 1,
        vin: vec![TxInput { prevout: in_outpoint }],
        vout: vec![
            TxOutput { value: 990, script_pubkey: plain_script() },
            TxOutput { value: 10, script_pubkey: op_true_script() },
        ],
        size_bytes: 200,
        fee_rate_sat_per_kvb: 1000,
    };
    settlement.check_transaction(&transfer_tx, false).unwrap();

    let out_outpoint = OutPoint { txid: txid_n(3), vout: 1 };
    let mut batch = db.batch();
    let delta = settlement
        .apply_transfer(&mut batch, &transfer_tx, &[in_outpoint], &[out_outpoint], 11, 1)
        .unwrap();
    batch.commit().unwrap();

    delta.check_i6().unwrap();
    assert!(settlement.receipt(&in_outpoint).unwrap().is_none());
    assert_eq!(settlement.receipt(&out_outpoint).unwrap().unwrap().amount, 990);

    // Disconnect restores the consumed receipt and deletes the created one.
    let mut batch = db.batch();
    settlement
        .disconnect_transfer(&mut batch, &[out_outpoint], &[(in_outpoint, M1Receipt { amount: 1000, create_height: 1 })])
        .unwrap();
    batch.commit().unwrap();

    assert_eq!(settlement.receipt(&in_outpoint).unwrap().unwrap().amount, 1000);
    assert!(settlement.receipt(&out_outpoint).unwrap().is_none());
}
