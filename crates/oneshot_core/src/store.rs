/*
 * SPDX-FileCopyrightText: 2026 Oneshot Labeler Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{bail, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

const DB_VERSION: i64 = 1;

/// Application state on disk: config keys, interned users, per-(user, kind)
/// upstream counters, block decisions and the rolling feed window.
///
/// One serialized write connection (immediate transactions) and one read
/// connection. DIDs are stored in compact form (`did:` prefix stripped).
#[derive(Clone)]
pub struct Store {
    write: Arc<Mutex<Connection>>,
    read: Arc<Mutex<Connection>>,
}

#[derive(Debug, Clone)]
pub struct BlockRow {
    pub id: i64,
    pub compact_did: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct InsertedBlock {
    pub id: i64,
    pub created_at: i64,
    /// False when the uid already had a block row.
    pub created: bool,
}

pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

impl Store {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let path = db_path.as_ref();
        let write = Connection::open(path)
            .with_context(|| format!("open db for writing: {}", path.display()))?;
        write.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA auto_vacuum=INCREMENTAL;
            PRAGMA busy_timeout=5000;
            "#,
        )?;
        write.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS config (
              key TEXT PRIMARY KEY,
              value TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS user (
              uid INTEGER PRIMARY KEY AUTOINCREMENT,
              did TEXT NOT NULL UNIQUE
            );
            CREATE TABLE IF NOT EXISTS upstream_stats (
              uid INTEGER NOT NULL,
              kind INTEGER NOT NULL,
              count INTEGER NOT NULL DEFAULT 0,
              PRIMARY KEY (uid, kind)
            );
            CREATE TABLE IF NOT EXISTS upstream_seen (
              uid INTEGER NOT NULL,
              kind INTEGER NOT NULL,
              rkey TEXT NOT NULL,
              PRIMARY KEY (uid, kind, rkey)
            );
            CREATE TABLE IF NOT EXISTS blocked_user (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              uid INTEGER NOT NULL UNIQUE,
              created_at INTEGER NOT NULL
            );
            -- No index on cts: the pruner scans by primary key on purpose.
            CREATE TABLE IF NOT EXISTS feed_list (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              uri TEXT NOT NULL,
              cts INTEGER NOT NULL
            );
            "#,
        )?;

        let read = Connection::open(path)
            .with_context(|| format!("open db for reading: {}", path.display()))?;
        read.execute_batch("PRAGMA busy_timeout=5000;")?;

        let store = Self {
            write: Arc::new(Mutex::new(write)),
            read: Arc::new(Mutex::new(read)),
        };
        store.upgrade()?;
        Ok(store)
    }

    fn upgrade(&self) -> Result<()> {
        let version = self.get_config_int("dbversion", 0)?;
        match version {
            0 => {
                // Fresh database.
                self.set_config_int("dbversion", DB_VERSION)?;
            }
            DB_VERSION => {}
            other => bail!("unknown database version {other}, refusing to run"),
        }
        Ok(())
    }

    fn writer(&self) -> MutexGuard<'_, Connection> {
        self.write.lock().unwrap()
    }

    fn reader(&self) -> MutexGuard<'_, Connection> {
        self.read.lock().unwrap()
    }

    pub fn get_config(&self, key: &str) -> Result<Option<String>> {
        let conn = self.reader();
        let mut stmt = conn.prepare_cached("SELECT value FROM config WHERE key = ?1")?;
        Ok(stmt
            .query_row(params![key], |row| row.get(0))
            .optional()?)
    }

    pub fn set_config(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.writer();
        let mut stmt = conn.prepare_cached(
            "INSERT INTO config (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )?;
        stmt.execute(params![key, value])?;
        Ok(())
    }

    pub fn get_config_int(&self, key: &str, default: i64) -> Result<i64> {
        match self.get_config(key)? {
            Some(v) => v
                .parse::<i64>()
                .with_context(|| format!("config {key} is not an integer: {v}")),
            None => Ok(default),
        }
    }

    pub fn set_config_int(&self, key: &str, value: i64) -> Result<()> {
        self.set_config(key, &value.to_string())
    }

    /// Interns a compact DID, returning its stable uid.
    pub fn get_or_create_uid(&self, compact_did: &str) -> Result<i64> {
        let mut conn = self.writer();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.prepare_cached("INSERT OR IGNORE INTO user (did) VALUES (?1)")?
            .execute(params![compact_did])?;
        let uid: i64 = tx
            .prepare_cached("SELECT uid FROM user WHERE did = ?1")?
            .query_row(params![compact_did], |row| row.get(0))?;
        tx.commit()?;
        Ok(uid)
    }

    pub fn did_for_uid(&self, uid: i64) -> Result<Option<String>> {
        let conn = self.reader();
        let mut stmt = conn.prepare_cached("SELECT did FROM user WHERE uid = ?1")?;
        Ok(stmt.query_row(params![uid], |row| row.get(0)).optional()?)
    }

    /// Counts one upstream label for `(uid, kind)`. Keyed by the label's
    /// record key so replaying the stream never double-counts: returns
    /// `None` when this `(uid, kind, rkey)` was already recorded, otherwise
    /// the post-increment count.
    pub fn increment_counter(&self, uid: i64, kind: i64, rkey: &str) -> Result<Option<i64>> {
        let mut conn = self.writer();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let inserted = tx
            .prepare_cached(
                "INSERT OR IGNORE INTO upstream_seen (uid, kind, rkey) VALUES (?1, ?2, ?3)",
            )?
            .execute(params![uid, kind, rkey])?;
        if inserted == 0 {
            tx.commit()?;
            return Ok(None);
        }
        let count: i64 = tx
            .prepare_cached(
                "INSERT INTO upstream_stats (uid, kind, count) VALUES (?1, ?2, 1)
                 ON CONFLICT(uid, kind) DO UPDATE SET count = count + 1
                 RETURNING count",
            )?
            .query_row(params![uid, kind], |row| row.get(0))?;
        tx.commit()?;
        Ok(Some(count))
    }

    /// Doubles the counter for `(uid, kind)`. Used by the profile-label
    /// policy hook; an absent or zero counter becomes 2.
    pub fn multiply_counter(&self, uid: i64, kind: i64) -> Result<i64> {
        let mut conn = self.writer();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.prepare_cached(
            "INSERT OR IGNORE INTO upstream_stats (uid, kind, count) VALUES (?1, ?2, 0)",
        )?
        .execute(params![uid, kind])?;
        let count: i64 = tx
            .prepare_cached(
                "UPDATE upstream_stats SET count = MAX(count, 1) * 2
                 WHERE uid = ?1 AND kind = ?2
                 RETURNING count",
            )?
            .query_row(params![uid, kind], |row| row.get(0))?;
        tx.commit()?;
        Ok(count)
    }

    pub fn sum_counts_for_user(&self, uid: i64) -> Result<i64> {
        let conn = self.reader();
        let mut stmt = conn.prepare_cached(
            "SELECT COALESCE(SUM(count), 0) FROM upstream_stats WHERE uid = ?1",
        )?;
        Ok(stmt.query_row(params![uid], |row| row.get(0))?)
    }

    pub fn is_blocked(&self, compact_did: &str) -> Result<bool> {
        let conn = self.reader();
        let mut stmt = conn.prepare_cached(
            "SELECT 1 FROM blocked_user b JOIN user u ON u.uid = b.uid WHERE u.did = ?1",
        )?;
        Ok(stmt
            .query_row(params![compact_did], |_| Ok(()))
            .optional()?
            .is_some())
    }

    pub fn last_block_id(&self) -> Result<i64> {
        let conn = self.reader();
        let mut stmt = conn.prepare_cached("SELECT COALESCE(MAX(id), 0) FROM blocked_user")?;
        Ok(stmt.query_row([], |row| row.get(0))?)
    }

    /// Promotes a uid to blocked. Idempotent: an existing row is returned
    /// with `created = false` and no new id is allocated.
    pub fn insert_block(&self, uid: i64) -> Result<InsertedBlock> {
        let mut conn = self.writer();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let existing: Option<(i64, i64)> = tx
            .prepare_cached("SELECT id, created_at FROM blocked_user WHERE uid = ?1")?
            .query_row(params![uid], |row| Ok((row.get(0)?, row.get(1)?)))
            .optional()?;
        if let Some((id, created_at)) = existing {
            tx.commit()?;
            return Ok(InsertedBlock {
                id,
                created_at,
                created: false,
            });
        }
        let created_at = now_ms();
        let id: i64 = tx
            .prepare_cached(
                "INSERT INTO blocked_user (uid, created_at) VALUES (?1, ?2) RETURNING id",
            )?
            .query_row(params![uid, created_at], |row| row.get(0))?;
        tx.commit()?;
        Ok(InsertedBlock {
            id,
            created_at,
            created: true,
        })
    }

    /// Block decisions with `from < id <= to`, ascending.
    pub fn blocks_in_range(&self, from_exclusive: i64, to_inclusive: i64) -> Result<Vec<BlockRow>> {
        let conn = self.reader();
        let mut stmt = conn.prepare_cached(
            "SELECT b.id, u.did, b.created_at FROM blocked_user b
             JOIN user u ON u.uid = b.uid
             WHERE b.id > ?1 AND b.id <= ?2
             ORDER BY b.id ASC",
        )?;
        let rows = stmt.query_map(params![from_exclusive, to_inclusive], |row| {
            Ok(BlockRow {
                id: row.get(0)?,
                compact_did: row.get(1)?,
                created_at: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Block decisions whose compact DID matches any of the LIKE patterns,
    /// paged by id. Patterns use `\` as the escape character.
    pub fn query_blocks(
        &self,
        patterns: &[String],
        after_id: i64,
        limit: i64,
    ) -> Result<Vec<BlockRow>> {
        let conn = self.reader();
        let mut sql = String::from(
            "SELECT b.id, u.did, b.created_at FROM blocked_user b
             JOIN user u ON u.uid = b.uid
             WHERE b.id > ?1",
        );
        if !patterns.is_empty() {
            sql.push_str(" AND (");
            for i in 0..patterns.len() {
                if i > 0 {
                    sql.push_str(" OR ");
                }
                sql.push_str(&format!("u.did LIKE ?{} ESCAPE '\\'", i + 3));
            }
            sql.push(')');
        }
        sql.push_str(" ORDER BY b.id ASC LIMIT ?2");

        let mut stmt = conn.prepare_cached(&sql)?;
        let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> =
            vec![Box::new(after_id), Box::new(limit)];
        for p in patterns {
            params_vec.push(Box::new(p.clone()));
        }
        let rows = stmt.query_map(
            rusqlite::params_from_iter(params_vec.iter().map(|p| p.as_ref())),
            |row| {
                Ok(BlockRow {
                    id: row.get(0)?,
                    compact_did: row.get(1)?,
                    created_at: row.get(2)?,
                })
            },
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Uids whose summed counters exceed the threshold. Drives the offline
    /// rebuild of the block table.
    pub fn uids_over_threshold(&self, threshold: i64) -> Result<Vec<i64>> {
        let conn = self.reader();
        let mut stmt = conn.prepare_cached(
            "SELECT uid FROM upstream_stats GROUP BY uid HAVING SUM(count) > ?1 ORDER BY uid",
        )?;
        let rows = stmt.query_map(params![threshold], |row| row.get(0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn insert_feed_item(&self, compact_uri: &str) -> Result<()> {
        let conn = self.writer();
        let mut stmt =
            conn.prepare_cached("INSERT INTO feed_list (uri, cts) VALUES (?1, ?2)")?;
        stmt.execute(params![compact_uri, now_ms()])?;
        Ok(())
    }

    /// Deletes one occurrence only.
    pub fn delete_feed_item(&self, compact_uri: &str) -> Result<()> {
        let conn = self.writer();
        let mut stmt = conn.prepare_cached(
            "DELETE FROM feed_list WHERE id IN (
               SELECT id FROM feed_list WHERE uri = ?1 LIMIT 1
             )",
        )?;
        stmt.execute(params![compact_uri])?;
        Ok(())
    }

    /// Feed entries strictly older than `cursor`, newest first. Returns the
    /// lowest id seen (the next cursor) along with the uris.
    pub fn feed_items_before(&self, cursor: i64, limit: i64) -> Result<(i64, Vec<String>)> {
        let conn = self.reader();
        let mut stmt = conn.prepare_cached(
            "SELECT id, uri FROM feed_list WHERE id < ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let mut next_cursor = cursor;
        let mut uris = Vec::new();
        let mut rows = stmt.query(params![cursor, limit])?;
        while let Some(row) = rows.next()? {
            next_cursor = row.get(0)?;
            uris.push(row.get(1)?);
        }
        Ok((next_cursor, uris))
    }

    /// Drops every entry older than the wall-clock cutoff. There is no cts
    /// index; the smallest id with `cts >= cutoff` bounds a primary-key
    /// range delete instead.
    pub fn prune_feed_older_than(&self, cutoff_ms: i64) -> Result<()> {
        let keep_from: Option<i64> = {
            let conn = self.reader();
            let mut stmt = conn.prepare_cached(
                "SELECT id FROM feed_list WHERE cts >= ?1 ORDER BY id ASC LIMIT 1",
            )?;
            stmt.query_row(params![cutoff_ms], |row| row.get(0))
                .optional()?
        };
        let Some(keep_from) = keep_from else {
            return Ok(());
        };
        let conn = self.writer();
        let mut stmt = conn.prepare_cached("DELETE FROM feed_list WHERE id < ?1")?;
        stmt.execute(params![keep_from])?;
        Ok(())
    }

    /// Scans the feed from the tail in 500-row windows and deletes entries
    /// the predicate rejects. The write connection is held only for each
    /// delete batch.
    pub fn prune_feed_by_predicate(&self, pred: impl Fn(&str) -> bool) -> Result<()> {
        const WINDOW: usize = 500;
        let mut cursor = i64::MAX;
        loop {
            let mut window: Vec<(i64, String)> = Vec::with_capacity(WINDOW);
            {
                let conn = self.reader();
                let mut stmt = conn.prepare_cached(
                    "SELECT id, uri FROM feed_list WHERE id < ?1 ORDER BY id DESC LIMIT ?2",
                )?;
                let mut rows = stmt.query(params![cursor, WINDOW as i64])?;
                while let Some(row) = rows.next()? {
                    window.push((row.get(0)?, row.get(1)?));
                }
            }
            if window.is_empty() {
                return Ok(());
            }
            cursor = window.last().map(|(id, _)| *id).unwrap_or(0);

            let unwanted: Vec<i64> = window
                .iter()
                .filter(|(_, uri)| pred(uri))
                .map(|(id, _)| *id)
                .collect();
            if !unwanted.is_empty() {
                let conn = self.writer();
                let placeholders = vec!["?"; unwanted.len()].join(",");
                let sql = format!("DELETE FROM feed_list WHERE id IN ({placeholders})");
                let mut stmt = conn.prepare(&sql)?;
                stmt.execute(rusqlite::params_from_iter(unwanted.iter()))?;
            }
            if cursor <= 0 {
                return Ok(());
            }
        }
    }

    /// Reclaims free pages incrementally; cheap enough for the persist loop.
    pub fn incremental_vacuum(&self) -> Result<()> {
        let conn = self.writer();
        conn.execute_batch("PRAGMA incremental_vacuum;")?;
        Ok(())
    }
}
