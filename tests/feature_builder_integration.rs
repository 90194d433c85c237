//! Feature Builder scenarios that need real SQLite-backed ordering:
//! point-in-time integrity of the subscription heuristic, and idempotent
//! re-runs of `build()`.

use chrono::{TimeZone, Utc};

use txn_ml_pipeline::db::Db;
use txn_ml_pipeline::features::FeatureBuilder;
use txn_ml_pipeline::model::Transaction;

fn txn(id: i64, day: u32, merchant: &str, amount: f64) -> Transaction {
    Transaction {
        id,
        user_id: 1,
        date: Utc.with_ymd_and_hms(2026, 1, day, 12, 0, 0).unwrap(),
        merchant: merchant.to_string(),
        description: "POS PURCHASE".to_string(),
        amount,
        category: None,
        deleted: false,
    }
}

#[test]
fn subscription_heuristic_ignores_future_dated_occurrences() {
    let db = Db::in_memory().unwrap();
    // Two prior monthly-cadence hits, then a third that would complete the
    // pattern — but it's dated AFTER the transaction being scored, so it
    // must not count toward that earlier transaction's heuristic.
    db.upsert_transaction(&Transaction {
        id: 1,
        user_id: 1,
        date: Utc.with_ymd_and_hms(2026, 1, 10, 0, 0, 0).unwrap(),
        merchant: "NETFLIX.COM".to_string(),
        description: "POS PURCHASE".to_string(),
        amount: -15.99,
        category: None,
        deleted: false,
    })
    .unwrap();
    db.upsert_transaction(&Transaction {
        id: 2,
        user_id: 1,
        date: Utc.with_ymd_and_hms(2026, 2, 9, 0, 0, 0).unwrap(),
        merchant: "NETFLIX.COM".to_string(),
        description: "POS PURCHASE".to_string(),
        amount: -15.99,
        category: None,
        deleted: false,
    })
    .unwrap();
    // Scored transaction: only two prior monthly hits exist at-or-before it.
    db.upsert_transaction(&Transaction {
        id: 3,
        user_id: 1,
        date: Utc.with_ymd_and_hms(2026, 3, 11, 0, 0, 0).unwrap(),
        merchant: "NETFLIX.COM".to_string(),
        description: "POS PURCHASE".to_string(),
        amount: -15.99,
        category: None,
        deleted: false,
    })
    .unwrap();
    // Future-dated third monthly hit, which would bring the count to 3 if
    // the heuristic incorrectly looked ahead.
    db.upsert_transaction(&Transaction {
        id: 4,
        user_id: 1,
        date: Utc.with_ymd_and_hms(2026, 4, 11, 0, 0, 0).unwrap(),
        merchant: "NETFLIX.COM".to_string(),
        description: "POS PURCHASE".to_string(),
        amount: -15.99,
        category: None,
        deleted: false,
    })
    .unwrap();

    let builder = FeatureBuilder::new(db.clone());
    builder.build(3650).unwrap();

    let row = db.feature_row_for_txn(3).unwrap().unwrap();
    assert!(!row.is_subscription);
}

#[test]
fn build_is_idempotent_across_overlapping_windows() {
    let db = Db::in_memory().unwrap();
    db.upsert_transaction(&txn(10, 5, "WHOLE FOODS", -40.0)).unwrap();

    let builder = FeatureBuilder::new(db.clone());
    let first = builder.build(3650).unwrap();
    let second = builder.build(3650).unwrap();

    assert_eq!(first.upserted, 1);
    assert_eq!(second.upserted, 1);
    assert_eq!(db.feature_row_for_txn(10).unwrap().unwrap().merchant_canonical, "whole_foods");
}

#[test]
fn monthly_cadence_across_real_months_is_detected() {
    let db = Db::in_memory().unwrap();
    // Four transactions roughly 30 days apart, across four different months.
    let dates = [
        Utc.with_ymd_and_hms(2026, 1, 10, 0, 0, 0).unwrap(),
        Utc.with_ymd_and_hms(2026, 2, 9, 0, 0, 0).unwrap(),
        Utc.with_ymd_and_hms(2026, 3, 11, 0, 0, 0).unwrap(),
        Utc.with_ymd_and_hms(2026, 4, 10, 0, 0, 0).unwrap(),
    ];
    for (i, date) in dates.iter().enumerate() {
        db.upsert_transaction(&Transaction {
            id: i as i64 + 1,
            user_id: 1,
            date: *date,
            merchant: "SPOTIFY USA".to_string(),
            description: "POS PURCHASE".to_string(),
            amount: -9.99,
            category: None,
            deleted: false,
        })
        .unwrap();
    }

    let builder = FeatureBuilder::new(db.clone());
    builder.build(3650).unwrap();
    let last = db.feature_row_for_txn(4).unwrap().unwrap();
    assert!(last.is_subscription);
}
