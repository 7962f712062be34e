use crate::types::{
    now_ts, Account, FolderCursor, FolderMembership, GMsgId, MessageMeta, MessagePart, Uid,
};
use anyhow::{Context, Result};
use dirs::home_dir;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::collections::{HashMap, HashSet};
use std::env;
use std::path::{Path, PathBuf};
use tracing::warn;

const DB_FILE_NAME: &str = "spool.db";

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    path: PathBuf,
}

impl Store {
    pub async fn new_default() -> Result<Self> {
        let base = default_data_dir()?;
        Self::open(&base.join(DB_FILE_NAME)).await
    }

    pub async fn open(db_path: &Path) -> Result<Self> {
        let url = format!("sqlite://{}?mode=rwc", db_path.display());

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating data directory {}", parent.display()))?;
        }

        let pool = SqlitePool::connect(&url)
            .await
            .with_context(|| format!("connecting to sqlite at {}", db_path.display()))?;

        let store = Store {
            pool,
            path: db_path.to_path_buf(),
        };
        store.migrate().await?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query("PRAGMA foreign_keys = ON;")
            .execute(&self.pool)
            .await
            .context("enabling foreign keys")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS accounts (
                email TEXT PRIMARY KEY,
                initial_sync_done INTEGER NOT NULL DEFAULT 0,
                sync_folders TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS folder_cursors (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_email TEXT NOT NULL,
                folder TEXT NOT NULL,
                uid_validity INTEGER NOT NULL,
                highestmodseq INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                UNIQUE(account_email, folder),
                FOREIGN KEY (account_email) REFERENCES accounts(email) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS folder_memberships (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_email TEXT NOT NULL,
                folder TEXT NOT NULL,
                uid INTEGER NOT NULL,
                g_msgid INTEGER NOT NULL,
                flags TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                UNIQUE(account_email, folder, uid),
                FOREIGN KEY (account_email) REFERENCES accounts(email) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_memberships_account_gmsgid
                ON folder_memberships(account_email, g_msgid);

            CREATE TABLE IF NOT EXISTS message_meta (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_email TEXT NOT NULL,
                g_msgid INTEGER NOT NULL,
                subject TEXT,
                from_addr TEXT,
                to_addrs TEXT,
                cc_addrs TEXT,
                bcc_addrs TEXT,
                internal_date INTEGER,
                size_bytes INTEGER,
                created_at INTEGER NOT NULL,
                UNIQUE(account_email, g_msgid),
                FOREIGN KEY (account_email) REFERENCES accounts(email) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS message_parts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_email TEXT NOT NULL,
                g_msgid INTEGER NOT NULL,
                part_id INTEGER NOT NULL,
                mime_type TEXT NOT NULL,
                filename TEXT,
                blob_ref TEXT NOT NULL,
                size_bytes INTEGER NOT NULL,
                UNIQUE(account_email, g_msgid, part_id),
                FOREIGN KEY (account_email) REFERENCES accounts(email) ON DELETE CASCADE
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("running migrations")?;

        Ok(())
    }

    pub async fn upsert_account(&self, account: &Account) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO accounts (email, initial_sync_done, sync_folders, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(email) DO UPDATE SET
                initial_sync_done = excluded.initial_sync_done,
                sync_folders = excluded.sync_folders,
                updated_at = excluded.updated_at;
            "#,
        )
        .bind(&account.email)
        .bind(if account.initial_sync_done { 1 } else { 0 })
        .bind(serde_json::to_string(&account.sync_folders).unwrap_or_else(|_| "[]".into()))
        .bind(account.created_at)
        .bind(account.updated_at)
        .execute(&self.pool)
        .await
        .context("upserting account")?;
        Ok(())
    }

    pub async fn load_account(&self, email: &str) -> Result<Option<Account>> {
        let row = sqlx::query(
            r#"
            SELECT initial_sync_done, sync_folders, created_at, updated_at
            FROM accounts
            WHERE email = ?1;
            "#,
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await
        .context("loading account")?;

        Ok(row.map(|row| {
            let folders_json: String = row.get(1);
            let sync_folders: Vec<String> =
                serde_json::from_str(&folders_json).unwrap_or_else(|_| vec!["INBOX".into()]);
            Account {
                email: email.to_string(),
                initial_sync_done: row.get::<i64, _>(0) == 1,
                sync_folders,
                created_at: row.get(2),
                updated_at: row.get(3),
            }
        }))
    }

    pub async fn list_accounts(&self) -> Result<Vec<Account>> {
        let rows = sqlx::query(
            r#"
            SELECT email, initial_sync_done, sync_folders, created_at, updated_at
            FROM accounts
            ORDER BY email ASC;
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("loading accounts")?;

        let mut out = Vec::new();
        for row in rows {
            let folders_json: String = row.get(2);
            let sync_folders: Vec<String> =
                serde_json::from_str(&folders_json).unwrap_or_else(|_| vec!["INBOX".into()]);
            out.push(Account {
                email: row.get(0),
                initial_sync_done: row.get::<i64, _>(1) == 1,
                sync_folders,
                created_at: row.get(3),
                updated_at: row.get(4),
            });
        }
        Ok(out)
    }

    pub async fn mark_initial_sync_done(&self, email: &str) -> Result<()> {
        sqlx::query("UPDATE accounts SET initial_sync_done = 1, updated_at = ?1 WHERE email = ?2;")
            .bind(now_ts())
            .bind(email)
            .execute(&self.pool)
            .await
            .context("marking initial sync done")?;
        Ok(())
    }

    pub async fn load_cursors(&self, email: &str) -> Result<Vec<FolderCursor>> {
        let rows = sqlx::query(
            r#"
            SELECT folder, uid_validity, highestmodseq
            FROM folder_cursors
            WHERE account_email = ?1
            ORDER BY folder ASC;
            "#,
        )
        .bind(email)
        .fetch_all(&self.pool)
        .await
        .context("loading folder cursors")?;

        let mut out = Vec::new();
        for row in rows {
            out.push(FolderCursor {
                account_email: email.to_string(),
                folder: row.get(0),
                uid_validity: row.get::<i64, _>(1) as u32,
                highestmodseq: row.get::<i64, _>(2) as u64,
            });
        }
        Ok(out)
    }

    pub async fn load_cursor(&self, email: &str, folder: &str) -> Result<Option<FolderCursor>> {
        let row = sqlx::query(
            r#"
            SELECT uid_validity, highestmodseq
            FROM folder_cursors
            WHERE account_email = ?1 AND folder = ?2;
            "#,
        )
        .bind(email)
        .bind(folder)
        .fetch_optional(&self.pool)
        .await
        .context("loading folder cursor")?;

        Ok(row.map(|row| FolderCursor {
            account_email: email.to_string(),
            folder: folder.to_string(),
            uid_validity: row.get::<i64, _>(0) as u32,
            highestmodseq: row.get::<i64, _>(1) as u64,
        }))
    }

    /// Insert or advance the cursor for a folder. The update only applies
    /// forward: a `highestmodseq` lower than the stored one is a no-op, and
    /// the return value reports whether anything was written.
    pub async fn advance_cursor(
        &self,
        email: &str,
        folder: &str,
        uid_validity: u32,
        highestmodseq: u64,
    ) -> Result<bool> {
        let now = now_ts();
        let res = sqlx::query(
            r#"
            INSERT INTO folder_cursors (account_email, folder, uid_validity, highestmodseq, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(account_email, folder) DO UPDATE SET
                uid_validity = excluded.uid_validity,
                highestmodseq = excluded.highestmodseq,
                updated_at = excluded.updated_at
            WHERE excluded.highestmodseq >= folder_cursors.highestmodseq;
            "#,
        )
        .bind(email)
        .bind(folder)
        .bind(uid_validity as i64)
        .bind(highestmodseq as i64)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("advancing folder cursor")?;

        let applied = res.rows_affected() > 0;
        if !applied {
            warn!(
                account = %email,
                folder = %folder,
                highestmodseq,
                "Rejected non-monotone cursor advance"
            );
        }
        Ok(applied)
    }

    pub async fn membership_uids(&self, email: &str, folder: &str) -> Result<Vec<Uid>> {
        let rows = sqlx::query(
            r#"
            SELECT uid
            FROM folder_memberships
            WHERE account_email = ?1 AND folder = ?2;
            "#,
        )
        .bind(email)
        .bind(folder)
        .fetch_all(&self.pool)
        .await
        .context("loading membership uids")?;

        Ok(rows
            .into_iter()
            .map(|row| row.get::<i64, _>(0) as Uid)
            .collect())
    }

    pub async fn load_memberships(&self, email: &str, folder: &str) -> Result<Vec<FolderMembership>> {
        let rows = sqlx::query(
            r#"
            SELECT uid, g_msgid, flags
            FROM folder_memberships
            WHERE account_email = ?1 AND folder = ?2
            ORDER BY uid ASC;
            "#,
        )
        .bind(email)
        .bind(folder)
        .fetch_all(&self.pool)
        .await
        .context("loading memberships")?;

        Ok(rows
            .into_iter()
            .map(|row| membership_from_row(email, folder, &row))
            .collect())
    }

    pub async fn load_memberships_by_uids(
        &self,
        email: &str,
        folder: &str,
        uids: &[Uid],
    ) -> Result<HashMap<Uid, FolderMembership>> {
        if uids.is_empty() {
            return Ok(HashMap::new());
        }

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT uid, g_msgid, flags FROM folder_memberships WHERE account_email = ",
        );
        qb.push_bind(email);
        qb.push(" AND folder = ");
        qb.push_bind(folder);
        qb.push(" AND uid IN (");
        {
            let mut separated = qb.separated(", ");
            for uid in uids {
                separated.push_bind(*uid as i64);
            }
        }
        qb.push(")");

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .context("loading memberships by uid list")?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let m = membership_from_row(email, folder, &row);
                (m.uid, m)
            })
            .collect())
    }

    pub async fn distinct_g_msgids(&self, email: &str) -> Result<HashSet<GMsgId>> {
        let rows = sqlx::query(
            "SELECT DISTINCT g_msgid FROM folder_memberships WHERE account_email = ?1;",
        )
        .bind(email)
        .fetch_all(&self.pool)
        .await
        .context("loading distinct g_msgids")?;

        Ok(rows
            .into_iter()
            .map(|row| row.get::<i64, _>(0) as GMsgId)
            .collect())
    }

    /// Batch insert for link-only memberships (single transaction).
    pub async fn insert_memberships(&self, memberships: &[FolderMembership]) -> Result<()> {
        if memberships.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await.context("beginning transaction")?;
        for m in memberships {
            upsert_membership(&mut tx, m).await?;
        }
        tx.commit().await.context("committing membership insert tx")?;
        Ok(())
    }

    pub async fn update_membership_flags(
        &self,
        email: &str,
        folder: &str,
        updates: &[(Uid, Vec<String>)],
    ) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }

        let now = now_ts();
        let mut tx = self.pool.begin().await.context("beginning transaction")?;
        for (uid, flags) in updates {
            sqlx::query(
                r#"
                UPDATE folder_memberships
                SET flags = ?1, updated_at = ?2
                WHERE account_email = ?3 AND folder = ?4 AND uid = ?5;
                "#,
            )
            .bind(serde_json::to_string(flags).unwrap_or_else(|_| "[]".into()))
            .bind(now)
            .bind(email)
            .bind(folder)
            .bind(*uid as i64)
            .execute(&mut *tx)
            .await
            .context("updating membership flags")?;
        }
        tx.commit().await.context("committing flag update tx")?;
        Ok(())
    }

    pub async fn delete_memberships(&self, email: &str, folder: &str, uids: &[Uid]) -> Result<u64> {
        if uids.is_empty() {
            return Ok(0);
        }

        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("DELETE FROM folder_memberships WHERE account_email = ");
        qb.push_bind(email);
        qb.push(" AND folder = ");
        qb.push_bind(folder);
        qb.push(" AND uid IN (");
        {
            let mut separated = qb.separated(", ");
            for uid in uids {
                separated.push_bind(*uid as i64);
            }
        }
        qb.push(")");

        let res = qb
            .build()
            .execute(&self.pool)
            .await
            .context("deleting memberships by uid list")?;
        Ok(res.rows_affected())
    }

    /// Commit one fetched chunk atomically: message meta and parts are
    /// written once and never rewritten (later sightings of the same
    /// g_msgid are ignored); memberships are upserted.
    pub async fn persist_chunk(
        &self,
        memberships: &[FolderMembership],
        metas: &[MessageMeta],
        parts: &[MessagePart],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.context("beginning transaction")?;

        for meta in metas {
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO message_meta (
                    account_email, g_msgid, subject, from_addr, to_addrs, cc_addrs, bcc_addrs,
                    internal_date, size_bytes, created_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10);
                "#,
            )
            .bind(&meta.account_email)
            .bind(meta.g_msgid as i64)
            .bind(&meta.subject)
            .bind(&meta.from_addr)
            .bind(&meta.to_addrs)
            .bind(&meta.cc_addrs)
            .bind(&meta.bcc_addrs)
            .bind(meta.internal_date)
            .bind(meta.size_bytes.map(|v| v as i64))
            .bind(meta.created_at)
            .execute(&mut *tx)
            .await
            .context("inserting message meta")?;
        }

        for part in parts {
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO message_parts (
                    account_email, g_msgid, part_id, mime_type, filename, blob_ref, size_bytes
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7);
                "#,
            )
            .bind(&part.account_email)
            .bind(part.g_msgid as i64)
            .bind(part.part_id as i64)
            .bind(&part.mime_type)
            .bind(&part.filename)
            .bind(&part.blob_ref)
            .bind(part.size_bytes as i64)
            .execute(&mut *tx)
            .await
            .context("inserting message part")?;
        }

        for m in memberships {
            upsert_membership(&mut tx, m).await?;
        }

        tx.commit().await.context("committing chunk tx")?;
        Ok(())
    }

    /// UIDVALIDITY reset: replace every membership row for the folder with
    /// the rewritten set and reset the cursor, in one transaction. Nothing
    /// is observable in a half-rewritten state.
    pub async fn resync_folder(
        &self,
        email: &str,
        folder: &str,
        rewritten: &[FolderMembership],
        uid_validity: u32,
        highestmodseq: u64,
    ) -> Result<()> {
        let now = now_ts();
        let mut tx = self.pool.begin().await.context("beginning resync tx")?;

        sqlx::query("DELETE FROM folder_memberships WHERE account_email = ?1 AND folder = ?2;")
            .bind(email)
            .bind(folder)
            .execute(&mut *tx)
            .await
            .context("clearing memberships for resync")?;

        for m in rewritten {
            upsert_membership(&mut tx, m).await?;
        }

        sqlx::query(
            r#"
            INSERT INTO folder_cursors (account_email, folder, uid_validity, highestmodseq, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(account_email, folder) DO UPDATE SET
                uid_validity = excluded.uid_validity,
                highestmodseq = excluded.highestmodseq,
                updated_at = excluded.updated_at;
            "#,
        )
        .bind(email)
        .bind(folder)
        .bind(uid_validity as i64)
        .bind(highestmodseq as i64)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await
        .context("resetting cursor for resync")?;

        tx.commit().await.context("committing resync tx")?;
        Ok(())
    }

    pub async fn count_message_meta(&self, email: &str) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) FROM message_meta WHERE account_email = ?1;")
            .bind(email)
            .fetch_one(&self.pool)
            .await
            .context("counting message meta")?;
        Ok(row.get::<i64, _>(0))
    }

    pub async fn count_memberships(&self, email: &str) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) FROM folder_memberships WHERE account_email = ?1;")
            .bind(email)
            .fetch_one(&self.pool)
            .await
            .context("counting memberships")?;
        Ok(row.get::<i64, _>(0))
    }

    pub async fn count_message_parts(&self, email: &str) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) FROM message_parts WHERE account_email = ?1;")
            .bind(email)
            .fetch_one(&self.pool)
            .await
            .context("counting message parts")?;
        Ok(row.get::<i64, _>(0))
    }
}

fn membership_from_row(email: &str, folder: &str, row: &sqlx::sqlite::SqliteRow) -> FolderMembership {
    let flags: Vec<String> =
        serde_json::from_str(&row.get::<String, _>(2)).unwrap_or_default();
    FolderMembership {
        account_email: email.to_string(),
        folder: folder.to_string(),
        uid: row.get::<i64, _>(0) as Uid,
        g_msgid: row.get::<i64, _>(1) as GMsgId,
        flags,
    }
}

async fn upsert_membership(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    m: &FolderMembership,
) -> Result<()> {
    let now = now_ts();
    sqlx::query(
        r#"
        INSERT INTO folder_memberships (account_email, folder, uid, g_msgid, flags, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ON CONFLICT(account_email, folder, uid) DO UPDATE SET
            g_msgid = excluded.g_msgid,
            flags = excluded.flags,
            updated_at = excluded.updated_at;
        "#,
    )
    .bind(&m.account_email)
    .bind(&m.folder)
    .bind(m.uid as i64)
    .bind(m.g_msgid as i64)
    .bind(serde_json::to_string(&m.flags).unwrap_or_else(|_| "[]".into()))
    .bind(now)
    .bind(now)
    .execute(&mut **tx)
    .await
    .context("upserting membership")?;
    Ok(())
}

pub fn default_data_dir() -> Result<PathBuf> {
    if let Ok(custom) = env::var("SPOOL_DATA_DIR") {
        let path = PathBuf::from(custom);
        std::fs::create_dir_all(&path)
            .with_context(|| format!("creating SPOOL_DATA_DIR at {}", path.display()))?;
        return Ok(path);
    }

    if let Some(home) = home_dir() {
        let path = home.join(".spool");
        if std::fs::create_dir_all(&path).is_ok() {
            return Ok(path);
        }
        warn!(
            "Unable to create {}/.spool; falling back to workspace-local storage",
            home.display()
        );
    }

    let cwd = env::current_dir().context("determining current directory")?;
    let path = cwd.join("spool-data");
    std::fs::create_dir_all(&path)
        .with_context(|| format!("creating fallback data directory {}", path.display()))?;
    Ok(path)
}
