//! SQLite-backed state. The database is the single source of truth: every
//! lifecycle transition travels through it, and workers coordinate purely
//! via single-statement atomic updates.
//!
//! Each worker opens its own connection; WAL plus a busy timeout keeps
//! concurrent writers honest.

pub mod index;
pub mod jobs;
pub mod models;

use std::path::Path;

use rand::RngCore;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};

use crate::error::{Error, Result};
use crate::now_s;
use models::{
    Asset, AssetKind, Campaign, CampaignCounters, CampaignState, DownloadToken, Recipient,
    TokenState, TokenWithRecipient,
};

pub struct Store {
    pub(crate) conn: Connection,
    /// The resolved path/URI, so workers can open sibling connections.
    db_path: String,
}

/// A process-unique shared in-memory database URI, for tests and tooling.
pub fn shared_memory_uri() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!(
        "file:tracemark_{:x}?mode=memory&cache=shared",
        u64::from_le_bytes(bytes)
    )
}

fn open_connection(db_path: &str) -> Result<Connection> {
    let conn = if db_path.starts_with("file:") {
        Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?
    } else {
        Connection::open(db_path)?
    };
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    Ok(conn)
}

impl Store {
    /// Open (or create) the database and ensure the schema.
    pub fn open(db_path: &str) -> Result<Self> {
        let resolved = if db_path == ":memory:" {
            shared_memory_uri()
        } else {
            db_path.to_string()
        };
        let conn = open_connection(&resolved)?;
        let store = Self {
            conn,
            db_path: resolved,
        };
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn open_at(path: &Path) -> Result<Self> {
        Self::open(&path.display().to_string())
    }

    /// A sibling connection to the same database (one per worker).
    pub fn reopen(&self) -> Result<Self> {
        Ok(Self {
            conn: open_connection(&self.db_path)?,
            db_path: self.db_path.clone(),
        })
    }

    pub fn db_path(&self) -> &str {
        &self.db_path
    }

    fn ensure_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS assets (
              id TEXT PRIMARY KEY,
              owner_id TEXT NOT NULL,
              kind TEXT NOT NULL,
              path TEXT NOT NULL,
              size_bytes INTEGER NOT NULL,
              sha256 TEXT NOT NULL,
              mime TEXT NOT NULL,
              width INTEGER,
              height INTEGER,
              duration_secs REAL,
              created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS recipients (
              id TEXT PRIMARY KEY,
              name TEXT NOT NULL,
              email TEXT NOT NULL,
              organisation TEXT,
              created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS campaigns (
              id TEXT PRIMARY KEY,
              owner_id TEXT NOT NULL,
              asset_id TEXT NOT NULL,
              name TEXT NOT NULL,
              max_downloads INTEGER,
              expires_at INTEGER,
              visible_wm INTEGER NOT NULL DEFAULT 1,
              invisible_wm INTEGER NOT NULL DEFAULT 1,
              state TEXT NOT NULL,
              created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS download_tokens (
              id TEXT PRIMARY KEY,
              campaign_id TEXT NOT NULL,
              recipient_id TEXT NOT NULL,
              max_downloads INTEGER,
              download_count INTEGER NOT NULL DEFAULT 0,
              state TEXT NOT NULL,
              watermarked_path TEXT,
              payload BLOB,
              output_sha256 TEXT,
              output_size INTEGER,
              expires_at INTEGER,
              created_at INTEGER NOT NULL
            );

            -- For detect jobs campaign_id carries the submitter's account id
            -- and token_id is NULL.
            CREATE TABLE IF NOT EXISTS jobs (
              id TEXT PRIMARY KEY,
              kind TEXT NOT NULL,
              campaign_id TEXT NOT NULL,
              token_id TEXT,
              state TEXT NOT NULL,
              progress INTEGER NOT NULL DEFAULT 0,
              error TEXT,
              input_path TEXT,
              result_json TEXT,
              created_at INTEGER NOT NULL,
              started_at INTEGER,
              completed_at INTEGER
            );

            CREATE TABLE IF NOT EXISTS watermark_index (
              payload_hex TEXT PRIMARY KEY,
              token_id TEXT NOT NULL,
              campaign_id TEXT NOT NULL,
              recipient_id TEXT NOT NULL,
              algorithm TEXT NOT NULL,
              created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_claim ON jobs(state, kind, created_at);
            CREATE INDEX IF NOT EXISTS idx_jobs_campaign ON jobs(campaign_id);
            CREATE INDEX IF NOT EXISTS idx_tokens_campaign ON download_tokens(campaign_id);
            "#,
        )?;
        Ok(())
    }

    // -------------------- assets --------------------

    pub fn insert_asset(&self, asset: &Asset) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO assets (id, owner_id, kind, path, size_bytes, sha256, mime,
                                width, height, duration_secs, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                asset.id,
                asset.owner_id,
                asset.kind.as_str(),
                asset.path,
                asset.size_bytes,
                asset.sha256,
                asset.mime,
                asset.width,
                asset.height,
                asset.duration_secs,
                asset.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn asset(&self, id: &str) -> Result<Option<Asset>> {
        self.conn
            .query_row(
                "SELECT id, owner_id, kind, path, size_bytes, sha256, mime, width, height,
                        duration_secs, created_at
                 FROM assets WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Asset {
                        id: row.get(0)?,
                        owner_id: row.get(1)?,
                        kind: AssetKind::parse_row(row.get::<_, String>(2)?),
                        path: row.get(3)?,
                        size_bytes: row.get(4)?,
                        sha256: row.get(5)?,
                        mime: row.get(6)?,
                        width: row.get(7)?,
                        height: row.get(8)?,
                        duration_secs: row.get(9)?,
                        created_at: row.get(10)?,
                    })
                },
            )
            .optional()
            .map_err(Error::from)
    }

    // -------------------- recipients --------------------

    pub fn insert_recipient(&self, recipient: &Recipient) -> Result<()> {
        self.conn.execute(
            "INSERT INTO recipients (id, name, email, organisation, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                recipient.id,
                recipient.name,
                recipient.email,
                recipient.organisation,
                recipient.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn recipient(&self, id: &str) -> Result<Option<Recipient>> {
        self.conn
            .query_row(
                "SELECT id, name, email, organisation, created_at FROM recipients WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Recipient {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        email: row.get(2)?,
                        organisation: row.get(3)?,
                        created_at: row.get(4)?,
                    })
                },
            )
            .optional()
            .map_err(Error::from)
    }

    // -------------------- campaigns --------------------

    pub fn insert_campaign(&self, campaign: &Campaign) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO campaigns (id, owner_id, asset_id, name, max_downloads, expires_at,
                                   visible_wm, invisible_wm, state, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                campaign.id,
                campaign.owner_id,
                campaign.asset_id,
                campaign.name,
                campaign.max_downloads,
                campaign.expires_at,
                campaign.visible_wm,
                campaign.invisible_wm,
                campaign.state.as_str(),
                campaign.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn campaign(&self, id: &str) -> Result<Option<Campaign>> {
        self.conn
            .query_row(
                "SELECT id, owner_id, asset_id, name, max_downloads, expires_at, visible_wm,
                        invisible_wm, state, created_at
                 FROM campaigns WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Campaign {
                        id: row.get(0)?,
                        owner_id: row.get(1)?,
                        asset_id: row.get(2)?,
                        name: row.get(3)?,
                        max_downloads: row.get(4)?,
                        expires_at: row.get(5)?,
                        visible_wm: row.get(6)?,
                        invisible_wm: row.get(7)?,
                        state: CampaignState::parse_row(row.get::<_, String>(8)?),
                        created_at: row.get(9)?,
                    })
                },
            )
            .optional()
            .map_err(Error::from)
    }

    /// Guarded transition; terminal states never move (EXPIRED stays).
    pub fn set_campaign_state(
        &self,
        id: &str,
        from: &[CampaignState],
        to: CampaignState,
    ) -> Result<bool> {
        let mut sql = String::from("UPDATE campaigns SET state = ? WHERE id = ? AND state IN (");
        sql.push_str(&vec!["?"; from.len()].join(", "));
        sql.push(')');

        let to_state = to.as_str();
        let mut values: Vec<&dyn rusqlite::ToSql> = vec![&to_state, &id];
        let from_states: Vec<&str> = from.iter().map(|s| s.as_str()).collect();
        for state in &from_states {
            values.push(state);
        }
        let changed = self.conn.execute(&sql, values.as_slice())?;
        Ok(changed > 0)
    }

    // -------------------- tokens --------------------

    pub fn insert_token(&self, token: &DownloadToken) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO download_tokens (id, campaign_id, recipient_id, max_downloads,
                                         download_count, state, watermarked_path, payload,
                                         output_sha256, output_size, expires_at, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
            params![
                token.id,
                token.campaign_id,
                token.recipient_id,
                token.max_downloads,
                token.download_count,
                token.state.as_str(),
                token.watermarked_path,
                token.payload,
                token.output_sha256,
                token.output_size,
                token.expires_at,
                token.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn token(&self, id: &str) -> Result<Option<DownloadToken>> {
        self.conn
            .query_row(
                "SELECT id, campaign_id, recipient_id, max_downloads, download_count, state,
                        watermarked_path, payload, output_sha256, output_size, expires_at,
                        created_at
                 FROM download_tokens WHERE id = ?1",
                params![id],
                models::token_from_row,
            )
            .optional()
            .map_err(Error::from)
    }

    pub fn tokens_for_campaign(&self, campaign_id: &str) -> Result<Vec<DownloadToken>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, campaign_id, recipient_id, max_downloads, download_count, state,
                    watermarked_path, payload, output_sha256, output_size, expires_at, created_at
             FROM download_tokens WHERE campaign_id = ?1 ORDER BY rowid ASC",
        )?;
        let rows = stmt.query_map(params![campaign_id], models::token_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Token joined with its recipient, for overlay text and detect results.
    pub fn token_with_recipient(&self, id: &str) -> Result<Option<TokenWithRecipient>> {
        let Some(token) = self.token(id)? else {
            return Ok(None);
        };
        let Some(recipient) = self.recipient(&token.recipient_id)? else {
            return Ok(None);
        };
        Ok(Some(TokenWithRecipient { token, recipient }))
    }

    /// Activate a token after a successful embed: state, output metadata and
    /// (when an invisible mark was applied) the forensic index row become
    /// visible in one transaction.
    #[allow(clippy::too_many_arguments)]
    pub fn activate_token(
        &mut self,
        token_id: &str,
        watermarked_path: &str,
        payload: Option<&[u8; 16]>,
        output_sha256: &str,
        output_size: i64,
        campaign_id: &str,
        recipient_id: &str,
        algorithm: &str,
    ) -> Result<()> {
        let tx = self.conn.transaction().map_err(Error::from)?;
        let changed = tx.execute(
            r#"
            UPDATE download_tokens
            SET state = ?2, watermarked_path = ?3, payload = ?4, output_sha256 = ?5,
                output_size = ?6
            WHERE id = ?1 AND state = ?7
            "#,
            params![
                token_id,
                TokenState::Active.as_str(),
                watermarked_path,
                payload.map(|p| p.to_vec()),
                output_sha256,
                output_size,
                TokenState::Pending.as_str(),
            ],
        )?;
        if changed == 0 {
            return Err(Error::StoreConflict(format!(
                "token {token_id} is not pending"
            )));
        }
        if let Some(payload) = payload {
            tx.execute(
                r#"
                INSERT OR IGNORE INTO watermark_index
                    (payload_hex, token_id, campaign_id, recipient_id, algorithm, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
                params![
                    hex::encode(payload),
                    token_id,
                    campaign_id,
                    recipient_id,
                    algorithm,
                    now_s(),
                ],
            )?;
        }
        tx.commit().map_err(Error::from)
    }

    /// Count one download; reaching max_downloads flips the token to
    /// CONSUMED in the same statement. Returns the post-increment state.
    pub fn register_download(&self, token_id: &str) -> Result<TokenState> {
        let changed = self.conn.execute(
            r#"
            UPDATE download_tokens
            SET download_count = download_count + 1,
                state = CASE
                    WHEN max_downloads IS NOT NULL AND download_count + 1 >= max_downloads
                        THEN 'consumed'
                    ELSE state
                END
            WHERE id = ?1 AND state = 'active'
              AND (max_downloads IS NULL OR download_count < max_downloads)
            "#,
            params![token_id],
        )?;
        if changed == 0 {
            return Err(Error::StoreConflict(format!(
                "token {token_id} is not downloadable"
            )));
        }
        let token = self
            .token(token_id)?
            .ok_or_else(|| Error::Internal(format!("token {token_id} vanished")))?;
        Ok(token.state)
    }

    /// Move expired campaigns and tokens to their terminal EXPIRED state.
    /// Returns (campaigns, tokens) affected.
    pub fn expire_overdue(&self, now: i64) -> Result<(usize, usize)> {
        let campaigns = self.conn.execute(
            "UPDATE campaigns SET state = 'expired'
             WHERE expires_at IS NOT NULL AND expires_at <= ?1 AND state != 'expired'",
            params![now],
        )?;
        let tokens = self.conn.execute(
            "UPDATE download_tokens SET state = 'expired'
             WHERE expires_at IS NOT NULL AND expires_at <= ?1
               AND state IN ('pending', 'active')",
            params![now],
        )?;
        Ok((campaigns, tokens))
    }

    /// Embed-job counters for a campaign, for the READY transition.
    pub fn campaign_counters(&self, campaign_id: &str) -> Result<CampaignCounters> {
        self.conn
            .query_row(
                r#"
                SELECT COUNT(*),
                       SUM(CASE WHEN state = 'completed' THEN 1 ELSE 0 END),
                       SUM(CASE WHEN state = 'failed' THEN 1 ELSE 0 END)
                FROM jobs
                WHERE campaign_id = ?1 AND kind IN ('embed_image', 'embed_video')
                "#,
                params![campaign_id],
                |row| {
                    Ok(CampaignCounters {
                        total: row.get::<_, i64>(0)? as usize,
                        completed: row.get::<_, Option<i64>>(1)?.unwrap_or(0) as usize,
                        failed: row.get::<_, Option<i64>>(2)?.unwrap_or(0) as usize,
                    })
                },
            )
            .map_err(Error::from)
    }
}
