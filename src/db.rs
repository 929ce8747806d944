//! Per-user state database.
//!
//! A small sqlite file (`asimap.db` in the MH root) persists what cannot
//! be recomputed from the store alone: the uid-validity counter, each
//! mailbox's UID bookkeeping, and the last-observed sequences used to
//! synthesise `FETCH (FLAGS ...)` notifications after external changes.
//! Migrations are ordered functions, applied once and recorded in the
//! `versions` table.

use std::{collections::BTreeSet, path::Path};

use log::info;
use sqlx::{sqlite::SqlitePool, Row};

use crate::{mh::Sequences, types::MailboxAttribute};

const DB_FILE_NAME: &str = "asimap.db";

/// One row of the `mailboxes` table, in engine terms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxRow {
    pub id: i64,
    pub name: String,
    pub uid_vv: u32,
    pub attributes: Vec<MailboxAttribute>,
    pub mtime: i64,
    pub next_uid: u32,
    pub num_msgs: u32,
    pub num_recent: u32,
    pub uids: Vec<u32>,
    pub last_resync: i64,
    pub subscribed: bool,
}

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn open(mh_root: &Path) -> Result<Database, sqlx::Error> {
        let path = mh_root.join(DB_FILE_NAME);
        let url = format!("sqlite://{}?mode=rwc", path.display());
        let pool = SqlitePool::connect(&url).await?;

        let db = Database { pool };
        db.apply_migrations().await?;
        Ok(db)
    }

    /// Bring the schema up to the latest version, applying each migration
    /// at most once.
    async fn apply_migrations(&self) -> Result<(), sqlx::Error> {
        let version: i64 = match sqlx::query(
            "SELECT version FROM versions ORDER BY version DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        {
            Ok(Some(row)) => row.get::<i64, _>(0) + 1,
            // No versions table yet: brand new database.
            Ok(None) | Err(_) => 0,
        };

        for (index, (name, sql)) in MIGRATIONS.iter().copied().enumerate() {
            if (index as i64) < version {
                continue;
            }
            info!("applying database migration {index} ({name})");
            sqlx::query(sql).execute(&self.pool).await?;
            sqlx::query("INSERT INTO versions (version) VALUES (?1)")
                .bind(index as i64)
                .execute(&self.pool)
                .await?;
        }

        // Make sure the singleton user_server row exists.
        sqlx::query(
            "INSERT INTO user_server (id, uid_vv) SELECT 1, 0
             WHERE NOT EXISTS (SELECT 1 FROM user_server WHERE id = 1)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Bump and return the user-wide uid-validity counter.
    pub async fn next_uid_vv(&self) -> Result<u32, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let current: i64 = sqlx::query("SELECT uid_vv FROM user_server WHERE id = 1")
            .fetch_one(&mut *tx)
            .await?
            .get(0);
        let next = current + 1;
        sqlx::query("UPDATE user_server SET uid_vv = ?1 WHERE id = 1")
            .bind(next)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(next as u32)
    }

    pub async fn fetch_mailbox(&self, name: &str) -> Result<Option<MailboxRow>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT id, name, uid_vv, attributes, mtime, next_uid, num_msgs,
                    num_recent, uids, last_resync, subscribed
             FROM mailboxes WHERE name = ?1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| MailboxRow {
            id: row.get("id"),
            name: row.get("name"),
            uid_vv: row.get::<i64, _>("uid_vv") as u32,
            attributes: parse_attributes(row.get("attributes")),
            mtime: row.get("mtime"),
            next_uid: row.get::<i64, _>("next_uid") as u32,
            num_msgs: row.get::<i64, _>("num_msgs") as u32,
            num_recent: row.get::<i64, _>("num_recent") as u32,
            uids: parse_uids(row.get("uids")),
            last_resync: row.get("last_resync"),
            subscribed: row.get::<i64, _>("subscribed") != 0,
        }))
    }

    /// Insert or update a mailbox row; returns its id.
    pub async fn save_mailbox(&self, row: &MailboxRow) -> Result<i64, sqlx::Error> {
        sqlx::query(
            "INSERT INTO mailboxes
                 (name, uid_vv, attributes, mtime, next_uid, num_msgs,
                  num_recent, uids, last_resync, subscribed)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(name) DO UPDATE SET
                 uid_vv = excluded.uid_vv,
                 attributes = excluded.attributes,
                 mtime = excluded.mtime,
                 next_uid = excluded.next_uid,
                 num_msgs = excluded.num_msgs,
                 num_recent = excluded.num_recent,
                 uids = excluded.uids,
                 last_resync = excluded.last_resync,
                 subscribed = excluded.subscribed",
        )
        .bind(&row.name)
        .bind(row.uid_vv as i64)
        .bind(render_attributes(&row.attributes))
        .bind(row.mtime)
        .bind(row.next_uid as i64)
        .bind(row.num_msgs as i64)
        .bind(row.num_recent as i64)
        .bind(render_uids(&row.uids))
        .bind(row.last_resync)
        .bind(row.subscribed as i64)
        .execute(&self.pool)
        .await?;

        let id: i64 = sqlx::query("SELECT id FROM mailboxes WHERE name = ?1")
            .bind(&row.name)
            .fetch_one(&self.pool)
            .await?
            .get(0);
        Ok(id)
    }

    pub async fn delete_mailbox(&self, name: &str) -> Result<(), sqlx::Error> {
        if let Some(row) = self.fetch_mailbox(name).await? {
            sqlx::query("DELETE FROM sequences WHERE mailbox_id = ?1")
                .bind(row.id)
                .execute(&self.pool)
                .await?;
        }
        sqlx::query("DELETE FROM mailboxes WHERE name = ?1")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Rename a mailbox row and every inferior mailbox under it.
    pub async fn rename_mailbox(&self, from: &str, to: &str) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE mailboxes SET name = ?2 WHERE name = ?1")
            .bind(from)
            .bind(to)
            .execute(&self.pool)
            .await?;

        let prefix = format!("{from}/");
        let children: Vec<(i64, String)> =
            sqlx::query("SELECT id, name FROM mailboxes WHERE name LIKE ?1")
                .bind(format!("{prefix}%"))
                .fetch_all(&self.pool)
                .await?
                .into_iter()
                .map(|row| (row.get(0), row.get(1)))
                .collect();

        for (id, name) in children {
            let renamed = format!("{to}/{}", &name[prefix.len()..]);
            sqlx::query("UPDATE mailboxes SET name = ?2 WHERE id = ?1")
                .bind(id)
                .bind(renamed)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    pub async fn all_mailboxes(&self) -> Result<Vec<MailboxRow>, sqlx::Error> {
        let names: Vec<String> = sqlx::query("SELECT name FROM mailboxes ORDER BY name")
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(|row| row.get(0))
            .collect();

        let mut rows = Vec::with_capacity(names.len());
        for name in names {
            if let Some(row) = self.fetch_mailbox(&name).await? {
                rows.push(row);
            }
        }
        Ok(rows)
    }

    pub async fn set_subscribed(&self, name: &str, subscribed: bool) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE mailboxes SET subscribed = ?2 WHERE name = ?1")
            .bind(name)
            .bind(subscribed as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Replace the persisted sequences snapshot for a mailbox.
    pub async fn save_sequences(
        &self,
        mailbox_id: i64,
        sequences: &Sequences,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM sequences WHERE mailbox_id = ?1")
            .bind(mailbox_id)
            .execute(&self.pool)
            .await?;

        for (name, keys) in sequences {
            let rendered: Vec<String> = keys.iter().map(u32::to_string).collect();
            sqlx::query(
                "INSERT INTO sequences (name, mailbox_id, sequence) VALUES (?1, ?2, ?3)",
            )
            .bind(name)
            .bind(mailbox_id)
            .bind(rendered.join(","))
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    pub async fn load_sequences(&self, mailbox_id: i64) -> Result<Sequences, sqlx::Error> {
        let rows = sqlx::query("SELECT name, sequence FROM sequences WHERE mailbox_id = ?1")
            .bind(mailbox_id)
            .fetch_all(&self.pool)
            .await?;

        let mut sequences = Sequences::new();
        for row in rows {
            let name: String = row.get(0);
            let rendered: String = row.get(1);
            let keys: BTreeSet<u32> = rendered
                .split(',')
                .filter(|piece| !piece.is_empty())
                .filter_map(|piece| piece.parse().ok())
                .collect();
            sequences.insert(name, keys);
        }
        Ok(sequences)
    }
}

fn parse_attributes(rendered: String) -> Vec<MailboxAttribute> {
    rendered
        .split(',')
        .filter_map(MailboxAttribute::from_str)
        .collect()
}

fn render_attributes(attributes: &[MailboxAttribute]) -> String {
    attributes
        .iter()
        .map(MailboxAttribute::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

fn parse_uids(rendered: String) -> Vec<u32> {
    rendered
        .split(',')
        .filter(|piece| !piece.is_empty())
        .filter_map(|piece| piece.parse().ok())
        .collect()
}

fn render_uids(uids: &[u32]) -> String {
    uids.iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Ordered migrations; each runs once and is recorded in `versions`.
/// Nothing here may ever be edited in place; append only.
const MIGRATIONS: &[(&str, &str)] = &[
    (
        "initial",
        "CREATE TABLE versions (
             version INTEGER PRIMARY KEY,
             date TEXT DEFAULT CURRENT_TIMESTAMP
         );
         CREATE TABLE user_server (
             id INTEGER PRIMARY KEY,
             uid_vv INTEGER,
             date TEXT DEFAULT CURRENT_TIMESTAMP
         );
         CREATE TABLE mailboxes (
             id INTEGER PRIMARY KEY,
             name TEXT,
             uid_vv INTEGER,
             attributes TEXT,
             mtime INTEGER,
             next_uid INTEGER,
             num_msgs INTEGER,
             num_recent INTEGER,
             date TEXT DEFAULT CURRENT_TIMESTAMP
         );
         CREATE UNIQUE INDEX mailbox_names ON mailboxes (name);
         CREATE TABLE sequences (
             id INTEGER PRIMARY KEY,
             name TEXT,
             mailbox_id INTEGER,
             sequence TEXT,
             date TEXT DEFAULT CURRENT_TIMESTAMP
         );
         CREATE UNIQUE INDEX seq_name_mbox ON sequences (name, mailbox_id);
         CREATE INDEX seq_mbox_id ON sequences (mailbox_id);",
    ),
    (
        "add_uids_to_mbox",
        "ALTER TABLE mailboxes ADD COLUMN uids TEXT DEFAULT ''",
    ),
    (
        "add_last_resync_to_mbox",
        "ALTER TABLE mailboxes ADD COLUMN last_resync INTEGER DEFAULT 0",
    ),
    (
        "folders_can_be_subscribed",
        "ALTER TABLE mailboxes ADD COLUMN subscribed INTEGER DEFAULT 0",
    ),
];

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    async fn open_in(dir: &Path) -> Database {
        Database::open(dir).await.unwrap()
    }

    fn sample_row() -> MailboxRow {
        MailboxRow {
            id: 0,
            name: "inbox".to_string(),
            uid_vv: 1,
            attributes: vec![MailboxAttribute::Marked, MailboxAttribute::HasNoChildren],
            mtime: 1234,
            next_uid: 10,
            num_msgs: 3,
            num_recent: 1,
            uids: vec![4, 7, 9],
            last_resync: 1200,
            subscribed: false,
        }
    }

    #[tokio::test]
    async fn migrations_are_recorded_and_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_in(dir.path()).await;
        drop(db);

        // Re-opening applies nothing new and keeps the data.
        let db = open_in(dir.path()).await;
        assert_eq!(db.next_uid_vv().await.unwrap(), 1);
        assert_eq!(db.next_uid_vv().await.unwrap(), 2);
        drop(db);

        let db = open_in(dir.path()).await;
        assert_eq!(db.next_uid_vv().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn mailbox_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_in(dir.path()).await;

        let row = sample_row();
        let id = db.save_mailbox(&row).await.unwrap();
        assert!(id > 0);

        let loaded = db.fetch_mailbox("inbox").await.unwrap().unwrap();
        assert_eq!(loaded.uid_vv, 1);
        assert_eq!(loaded.attributes, row.attributes);
        assert_eq!(loaded.uids, vec![4, 7, 9]);
        assert!(!loaded.subscribed);

        // Update path of the upsert.
        let mut updated = row.clone();
        updated.next_uid = 11;
        updated.uids = vec![4, 7, 9, 10];
        let same_id = db.save_mailbox(&updated).await.unwrap();
        assert_eq!(same_id, id);
        let loaded = db.fetch_mailbox("inbox").await.unwrap().unwrap();
        assert_eq!(loaded.next_uid, 11);
        assert_eq!(loaded.uids, vec![4, 7, 9, 10]);

        assert!(db.fetch_mailbox("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sequences_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_in(dir.path()).await;
        let id = db.save_mailbox(&sample_row()).await.unwrap();

        let mut sequences = Sequences::new();
        sequences.insert("unseen".to_string(), BTreeSet::from([1, 2, 5]));
        sequences.insert("replied".to_string(), BTreeSet::from([3]));
        db.save_sequences(id, &sequences).await.unwrap();
        assert_eq!(db.load_sequences(id).await.unwrap(), sequences);

        // Replacement drops stale rows.
        let mut replacement = Sequences::new();
        replacement.insert("unseen".to_string(), BTreeSet::from([9]));
        db.save_sequences(id, &replacement).await.unwrap();
        assert_eq!(db.load_sequences(id).await.unwrap(), replacement);
    }

    #[tokio::test]
    async fn rename_fixes_up_inferiors() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_in(dir.path()).await;

        for name in ["Archive", "Archive/2022", "Archive/2023", "Archivenot"] {
            let mut row = sample_row();
            row.name = name.to_string();
            db.save_mailbox(&row).await.unwrap();
        }

        db.rename_mailbox("Archive", "Old").await.unwrap();

        let names: Vec<String> = db
            .all_mailboxes()
            .await
            .unwrap()
            .into_iter()
            .map(|row| row.name)
            .collect();
        assert_eq!(
            names,
            vec![
                "Archivenot".to_string(),
                "Old".to_string(),
                "Old/2022".to_string(),
                "Old/2023".to_string()
            ]
        );
    }
}
