//! Core entities and their state machines.
//!
//! Identifiers are opaque 128-bit values rendered as 36-char canonical
//! strings; timestamps are unix seconds. View structs compose a base entity
//! with joined data instead of inheriting from it.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetKind {
    Image,
    Video,
}

impl AssetKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AssetKind::Image => "image",
            AssetKind::Video => "video",
        }
    }

    /// Row values are written by this crate; anything else is corruption,
    /// mapped to Image so reads stay total (callers re-validate kind).
    pub(crate) fn parse_row(raw: String) -> Self {
        match raw.as_str() {
            "video" => AssetKind::Video,
            _ => AssetKind::Image,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CampaignState {
    Draft,
    Processing,
    Ready,
    Expired,
}

impl CampaignState {
    pub fn as_str(self) -> &'static str {
        match self {
            CampaignState::Draft => "draft",
            CampaignState::Processing => "processing",
            CampaignState::Ready => "ready",
            CampaignState::Expired => "expired",
        }
    }

    pub(crate) fn parse_row(raw: String) -> Self {
        match raw.as_str() {
            "processing" => CampaignState::Processing,
            "ready" => CampaignState::Ready,
            "expired" => CampaignState::Expired,
            _ => CampaignState::Draft,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenState {
    Pending,
    Active,
    Consumed,
    Expired,
}

impl TokenState {
    pub fn as_str(self) -> &'static str {
        match self {
            TokenState::Pending => "pending",
            TokenState::Active => "active",
            TokenState::Consumed => "consumed",
            TokenState::Expired => "expired",
        }
    }

    pub(crate) fn parse_row(raw: String) -> Self {
        match raw.as_str() {
            "active" => TokenState::Active,
            "consumed" => TokenState::Consumed,
            "expired" => TokenState::Expired,
            _ => TokenState::Pending,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    EmbedImage,
    EmbedVideo,
    Detect,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::EmbedImage => "embed_image",
            JobKind::EmbedVideo => "embed_video",
            JobKind::Detect => "detect",
        }
    }

    pub fn is_embed(self) -> bool {
        matches!(self, JobKind::EmbedImage | JobKind::EmbedVideo)
    }

    pub(crate) fn parse_row(raw: String) -> Self {
        match raw.as_str() {
            "embed_image" => JobKind::EmbedImage,
            "embed_video" => JobKind::EmbedVideo,
            _ => JobKind::Detect,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    pub(crate) fn parse_row(raw: String) -> Self {
        match raw.as_str() {
            "running" => JobState::Running,
            "completed" => JobState::Completed,
            "failed" => JobState::Failed,
            _ => JobState::Pending,
        }
    }
}

/// Immutable master media file.
#[derive(Clone, Debug)]
pub struct Asset {
    pub id: String,
    pub owner_id: String,
    pub kind: AssetKind,
    pub path: String,
    pub size_bytes: i64,
    pub sha256: String,
    pub mime: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub duration_secs: Option<f64>,
    pub created_at: i64,
}

/// Publication unit tying an asset to a set of recipients.
#[derive(Clone, Debug)]
pub struct Campaign {
    pub id: String,
    pub owner_id: String,
    pub asset_id: String,
    pub name: String,
    pub max_downloads: Option<u32>,
    pub expires_at: Option<i64>,
    pub visible_wm: bool,
    pub invisible_wm: bool,
    pub state: CampaignState,
    pub created_at: i64,
}

#[derive(Clone, Debug)]
pub struct Recipient {
    pub id: String,
    pub name: String,
    pub email: String,
    pub organisation: Option<String>,
    pub created_at: i64,
}

/// Per-recipient receipt; ACTIVE only after its embed job completed.
#[derive(Clone, Debug)]
pub struct DownloadToken {
    pub id: String,
    pub campaign_id: String,
    pub recipient_id: String,
    pub max_downloads: Option<u32>,
    pub download_count: u32,
    pub state: TokenState,
    pub watermarked_path: Option<String>,
    pub payload: Option<Vec<u8>>,
    pub output_sha256: Option<String>,
    pub output_size: Option<i64>,
    pub expires_at: Option<i64>,
    pub created_at: i64,
}

/// Unit of asynchronous work. For detect jobs `campaign_id` carries the
/// submitter's account id and `token_id` is None.
#[derive(Clone, Debug)]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    pub campaign_id: String,
    pub token_id: Option<String>,
    pub state: JobState,
    pub progress: u8,
    pub error: Option<String>,
    pub input_path: Option<String>,
    pub result_json: Option<String>,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

/// Token plus its recipient (composition, not inheritance).
#[derive(Clone, Debug)]
pub struct TokenWithRecipient {
    pub token: DownloadToken,
    pub recipient: Recipient,
}

/// Embed-job counters joined to a campaign for the READY check.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CampaignCounters {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
}

impl CampaignCounters {
    /// All jobs terminal, and at least one of them exists.
    pub fn all_terminal(self) -> bool {
        self.total >= 1 && self.completed + self.failed == self.total
    }
}

pub(crate) fn token_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DownloadToken> {
    Ok(DownloadToken {
        id: row.get(0)?,
        campaign_id: row.get(1)?,
        recipient_id: row.get(2)?,
        max_downloads: row.get(3)?,
        download_count: row.get(4)?,
        state: TokenState::parse_row(row.get::<_, String>(5)?),
        watermarked_path: row.get(6)?,
        payload: row.get(7)?,
        output_sha256: row.get(8)?,
        output_size: row.get(9)?,
        expires_at: row.get(10)?,
        created_at: row.get(11)?,
    })
}

pub(crate) fn job_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Job> {
    Ok(Job {
        id: row.get(0)?,
        kind: JobKind::parse_row(row.get::<_, String>(1)?),
        campaign_id: row.get(2)?,
        token_id: row.get(3)?,
        state: JobState::parse_row(row.get::<_, String>(4)?),
        progress: row.get::<_, i64>(5)?.clamp(0, 100) as u8,
        error: row.get(6)?,
        input_path: row.get(7)?,
        result_json: row.get(8)?,
        created_at: row.get(9)?,
        started_at: row.get(10)?,
        completed_at: row.get(11)?,
    })
}

/// Fresh 128-bit identifier in canonical 36-char form.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use super::*;

    pub fn asset(id: &str) -> Asset {
        Asset {
            id: id.to_string(),
            owner_id: "owner-1".to_string(),
            kind: AssetKind::Image,
            path: format!("/data/originals/{id}/source.png"),
            size_bytes: 4096,
            sha256: "aa".repeat(32),
            mime: "image/png".to_string(),
            width: Some(512),
            height: Some(512),
            duration_secs: None,
            created_at: 1_700_000_000,
        }
    }

    pub fn campaign(id: &str, asset_id: &str) -> Campaign {
        Campaign {
            id: id.to_string(),
            owner_id: "owner-1".to_string(),
            asset_id: asset_id.to_string(),
            name: format!("campaign {id}"),
            max_downloads: None,
            expires_at: None,
            visible_wm: true,
            invisible_wm: true,
            state: CampaignState::Draft,
            created_at: 1_700_000_000,
        }
    }

    pub fn recipient(id: &str) -> Recipient {
        Recipient {
            id: id.to_string(),
            name: format!("Recipient {id}"),
            email: format!("{id}@example.org"),
            organisation: None,
            created_at: 1_700_000_000,
        }
    }

    pub fn token(id: &str, campaign_id: &str, recipient_id: &str) -> DownloadToken {
        DownloadToken {
            id: id.to_string(),
            campaign_id: campaign_id.to_string(),
            recipient_id: recipient_id.to_string(),
            max_downloads: None,
            download_count: 0,
            state: TokenState::Pending,
            watermarked_path: None,
            payload: None,
            output_sha256: None,
            output_size: None,
            expires_at: None,
            created_at: 1_700_000_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_strings_round_trip() {
        for state in [
            JobState::Pending,
            JobState::Running,
            JobState::Completed,
            JobState::Failed,
        ] {
            assert_eq!(JobState::parse_row(state.as_str().to_string()), state);
        }
        for kind in [JobKind::EmbedImage, JobKind::EmbedVideo, JobKind::Detect] {
            assert_eq!(JobKind::parse_row(kind.as_str().to_string()), kind);
        }
    }

    #[test]
    fn terminal_classification() {
        assert!(!JobState::Pending.is_terminal());
        assert!(!JobState::Running.is_terminal());
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Failed.is_terminal());
    }

    #[test]
    fn counters_ready_condition() {
        assert!(!CampaignCounters::default().all_terminal());
        assert!(!CampaignCounters {
            total: 3,
            completed: 2,
            failed: 0
        }
        .all_terminal());
        // Failed embeds still count toward READY.
        assert!(CampaignCounters {
            total: 3,
            completed: 2,
            failed: 1
        }
        .all_terminal());
    }

    #[test]
    fn new_ids_are_canonical_36_chars() {
        let id = new_id();
        assert_eq!(id.len(), 36);
        assert!(!id.chars().any(|c| c.is_ascii_uppercase()));
    }
}
