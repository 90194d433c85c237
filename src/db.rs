//! SQLite-backed storage for transactions, labels, feature rows, and the
//! training-run audit log.
//!
//! Schema and pragma choices follow the teacher's artifact-store convention:
//! WAL mode for concurrent reads during writes, a `schema_version` table for
//! forward migrations, and `INSERT ... ON CONFLICT DO UPDATE` upserts instead
//! of `INSERT OR REPLACE` so covering indexes aren't rebuilt on every write.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::model::{EvalMetrics, FeatureRow, Label, LabelSource, Transaction};

const SCHEMA_VERSION: u32 = 1;

#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path).context("opening sqlite database")?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("opening in-memory sqlite database")?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY);

            CREATE TABLE IF NOT EXISTS transactions (
                id INTEGER PRIMARY KEY,
                user_id INTEGER NOT NULL,
                date TEXT NOT NULL,
                merchant TEXT NOT NULL,
                description TEXT NOT NULL,
                amount REAL NOT NULL,
                category TEXT,
                deleted INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_transactions_date ON transactions(date);
            CREATE INDEX IF NOT EXISTS idx_transactions_user ON transactions(user_id);

            CREATE TABLE IF NOT EXISTS labels (
                txn_id INTEGER NOT NULL,
                label TEXT NOT NULL,
                source TEXT NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY (txn_id) REFERENCES transactions(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_labels_txn ON labels(txn_id, created_at DESC);

            CREATE TABLE IF NOT EXISTS features (
                txn_id INTEGER PRIMARY KEY,
                ts_month TEXT NOT NULL,
                merchant_canonical TEXT NOT NULL,
                tokens_json TEXT NOT NULL,
                abs_amount REAL NOT NULL,
                channel TEXT NOT NULL,
                dow INTEGER NOT NULL,
                is_weekend INTEGER NOT NULL,
                is_subscription INTEGER NOT NULL,
                norm_desc TEXT NOT NULL,
                FOREIGN KEY (txn_id) REFERENCES transactions(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_features_month ON features(ts_month);

            CREATE TABLE IF NOT EXISTS training_runs (
                run_id TEXT PRIMARY KEY,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                rows_train INTEGER NOT NULL,
                rows_val INTEGER NOT NULL,
                classes_json TEXT NOT NULL,
                metrics_json TEXT NOT NULL,
                passed_gate INTEGER NOT NULL,
                deployed INTEGER NOT NULL,
                config_snapshot_json TEXT NOT NULL,
                error TEXT
            );
            "#,
        )
        .context("creating schema")?;

        let current: Option<u32> = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                row.get(0)
            })
            .optional()?;
        if current.is_none() {
            conn.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                params![SCHEMA_VERSION],
            )?;
            info!("created txn-ml-pipeline schema v{}", SCHEMA_VERSION);
        }
        Ok(())
    }

    /// Inserts or replaces a transaction by id. Upstream ingestion is out of
    /// this pipeline's scope; this exists for backfills and tests.
    pub fn upsert_transaction(&self, txn: &Transaction) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO transactions (id, user_id, date, merchant, description, amount, category, deleted)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                user_id = excluded.user_id,
                date = excluded.date,
                merchant = excluded.merchant,
                description = excluded.description,
                amount = excluded.amount,
                category = excluded.category,
                deleted = excluded.deleted",
            params![
                txn.id,
                txn.user_id,
                txn.date.to_rfc3339(),
                txn.merchant,
                txn.description,
                txn.amount,
                txn.category,
                txn.deleted as i64,
            ],
        )?;
        Ok(())
    }

    pub fn insert_label(&self, label: &Label) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO labels (txn_id, label, source, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                label.txn_id,
                label.label,
                label.source.as_str(),
                label.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Non-deleted transactions whose date falls within the last `window_days`.
    pub fn transactions_in_window(&self, window_days: u32) -> Result<Vec<Transaction>> {
        let conn = self.conn.lock();
        let cutoff = chrono::Utc::now() - chrono::Duration::days(window_days as i64);
        let mut stmt = conn.prepare(
            "SELECT id, user_id, date, merchant, description, amount, category, deleted
             FROM transactions WHERE deleted = 0 AND date >= ?1",
        )?;
        let rows = stmt
            .query_map(params![cutoff.to_rfc3339()], |row| {
                Ok(Transaction {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    date: row
                        .get::<_, String>(2)?
                        .parse()
                        .unwrap_or_else(|_| chrono::Utc::now()),
                    merchant: row.get(3)?,
                    description: row.get(4)?,
                    amount: row.get(5)?,
                    category: row.get(6)?,
                    deleted: row.get::<_, i64>(7)? != 0,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// All transactions by the same user, with the same canonical merchant,
    /// at or before `as_of` — used by the subscription-cadence heuristic.
    /// Strictly historical: never looks at transactions dated after `as_of`.
    pub fn prior_transactions_for_merchant(
        &self,
        user_id: i64,
        merchant_like: &str,
        as_of: chrono::DateTime<chrono::Utc>,
    ) -> Result<Vec<chrono::DateTime<chrono::Utc>>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT date FROM transactions
             WHERE user_id = ?1 AND deleted = 0 AND date <= ?2
               AND lower(merchant) LIKE ?3
             ORDER BY date ASC",
        )?;
        let pattern = format!("%{}%", merchant_like.to_lowercase());
        let rows = stmt
            .query_map(params![user_id, as_of.to_rfc3339(), pattern], |row| {
                row.get::<_, String>(0)
            })?
            .filter_map(|r| r.ok())
            .filter_map(|s| s.parse::<chrono::DateTime<chrono::Utc>>().ok())
            .collect();
        Ok(rows)
    }

    pub fn upsert_feature_row(&self, row: &FeatureRow) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO features
                (txn_id, ts_month, merchant_canonical, tokens_json, abs_amount,
                 channel, dow, is_weekend, is_subscription, norm_desc)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(txn_id) DO UPDATE SET
                ts_month = excluded.ts_month,
                merchant_canonical = excluded.merchant_canonical,
                tokens_json = excluded.tokens_json,
                abs_amount = excluded.abs_amount,
                channel = excluded.channel,
                dow = excluded.dow,
                is_weekend = excluded.is_weekend,
                is_subscription = excluded.is_subscription,
                norm_desc = excluded.norm_desc",
            params![
                row.txn_id,
                row.ts_month,
                row.merchant_canonical,
                serde_json::to_string(&row.tokens)?,
                row.abs_amount,
                row.channel.as_str(),
                row.dow as i64,
                row.is_weekend as i64,
                row.is_subscription as i64,
                row.norm_desc,
            ],
        )?;
        Ok(())
    }

    pub fn feature_row_for_txn(&self, txn_id: i64) -> Result<Option<FeatureRow>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT txn_id, ts_month, merchant_canonical, tokens_json, abs_amount,
                    channel, dow, is_weekend, is_subscription, norm_desc
             FROM features WHERE txn_id = ?1",
            params![txn_id],
            |row| {
                let tokens_json: String = row.get(3)?;
                let channel_str: String = row.get(5)?;
                Ok(FeatureRow {
                    txn_id: row.get(0)?,
                    ts_month: row.get(1)?,
                    merchant_canonical: row.get(2)?,
                    tokens: serde_json::from_str(&tokens_json).unwrap_or_default(),
                    abs_amount: row.get(4)?,
                    channel: parse_channel(&channel_str),
                    dow: row.get::<_, i64>(6)? as u8,
                    is_weekend: row.get::<_, i64>(7)? != 0,
                    is_subscription: row.get::<_, i64>(8)? != 0,
                    norm_desc: row.get(9)?,
                })
            },
        )
        .optional()
        .context("reading feature row")
    }

    /// Looks up a single non-deleted transaction by id, used when serving
    /// needs to fall back to the rule engine for a txn whose feature row
    /// hasn't been built yet (spec §4.5 step 1).
    pub fn transaction_by_id(&self, txn_id: i64) -> Result<Option<Transaction>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, user_id, date, merchant, description, amount, category, deleted
             FROM transactions WHERE id = ?1 AND deleted = 0",
            params![txn_id],
            |row| {
                let date_str: String = row.get(2)?;
                Ok(Transaction {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    date: chrono::DateTime::parse_from_rfc3339(&date_str)
                        .map(|d| d.with_timezone(&chrono::Utc))
                        .unwrap_or_else(|_| chrono::Utc::now()),
                    merchant: row.get(3)?,
                    description: row.get(4)?,
                    amount: row.get(5)?,
                    category: row.get(6)?,
                    deleted: row.get::<_, i64>(7)? != 0,
                })
            },
        )
        .optional()
        .context("reading transaction")
    }

    /// Every feature row joined with its latest label, restricted to the
    /// allowed label sources. Rows without any matching label are omitted.
    pub fn labeled_feature_rows(&self) -> Result<Vec<(FeatureRow, Label)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT f.txn_id, f.ts_month, f.merchant_canonical, f.tokens_json, f.abs_amount,
                    f.channel, f.dow, f.is_weekend, f.is_subscription, f.norm_desc,
                    l.label, l.source, l.created_at
             FROM features f
             JOIN labels l ON l.txn_id = f.txn_id
             WHERE l.created_at = (
                 SELECT MAX(l2.created_at) FROM labels l2 WHERE l2.txn_id = f.txn_id
             )",
        )?;
        let rows = stmt
            .query_map([], |row| {
                let tokens_json: String = row.get(3)?;
                let channel_str: String = row.get(5)?;
                let source_str: String = row.get(11)?;
                let feature = FeatureRow {
                    txn_id: row.get(0)?,
                    ts_month: row.get(1)?,
                    merchant_canonical: row.get(2)?,
                    tokens: serde_json::from_str(&tokens_json).unwrap_or_default(),
                    abs_amount: row.get(4)?,
                    channel: parse_channel(&channel_str),
                    dow: row.get::<_, i64>(6)? as u8,
                    is_weekend: row.get::<_, i64>(7)? != 0,
                    is_subscription: row.get::<_, i64>(8)? != 0,
                    norm_desc: row.get(9)?,
                };
                let label = Label {
                    txn_id: feature.txn_id,
                    label: row.get(10)?,
                    source: parse_label_source(&source_str),
                    created_at: row
                        .get::<_, String>(12)?
                        .parse()
                        .unwrap_or_else(|_| chrono::Utc::now()),
                };
                Ok((feature, label))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn insert_training_run(
        &self,
        run_id: &str,
        started_at: chrono::DateTime<chrono::Utc>,
        finished_at: Option<chrono::DateTime<chrono::Utc>>,
        rows_train: usize,
        rows_val: usize,
        classes: &[String],
        metrics: &EvalMetrics,
        passed_gate: bool,
        deployed: bool,
        config_snapshot: &serde_json::Value,
        error: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO training_runs
                (run_id, started_at, finished_at, rows_train, rows_val, classes_json,
                 metrics_json, passed_gate, deployed, config_snapshot_json, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(run_id) DO UPDATE SET
                finished_at = excluded.finished_at,
                metrics_json = excluded.metrics_json,
                passed_gate = excluded.passed_gate,
                deployed = excluded.deployed,
                error = excluded.error",
            params![
                run_id,
                started_at.to_rfc3339(),
                finished_at.map(|d| d.to_rfc3339()),
                rows_train as i64,
                rows_val as i64,
                serde_json::to_string(classes)?,
                serde_json::to_string(metrics)?,
                passed_gate as i64,
                deployed as i64,
                config_snapshot.to_string(),
                error,
            ],
        )?;
        Ok(())
    }

    /// Flips a training run's audit record to `deployed = true` after the
    /// registry publish that followed it succeeds. Training records the run
    /// as `deployed = false` the moment the gate decision is made, since
    /// publication is a separate filesystem step that can still fail.
    pub fn mark_training_run_deployed(&self, run_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE training_runs SET deployed = 1 WHERE run_id = ?1",
            params![run_id],
        )?;
        Ok(())
    }
}

fn parse_channel(s: &str) -> crate::model::Channel {
    use crate::model::Channel;
    match s {
        "pos" => Channel::Pos,
        "online" => Channel::Online,
        "transfer" => Channel::Transfer,
        _ => Channel::Unknown,
    }
}

fn parse_label_source(s: &str) -> LabelSource {
    match s {
        "human" => LabelSource::Human,
        "rule" => LabelSource::Rule,
        _ => LabelSource::Import,
    }
}
