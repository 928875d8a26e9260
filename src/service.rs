//! High-level operations that sit above the store and below the (external)
//! HTTP surface: campaign publication, suspect-file intake, asset ingest,
//! and the periodic expiry sweep.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::layout::{self, DataLayout};
use crate::now_s;
use crate::sha256_file;
use crate::store::jobs::new_job;
use crate::store::models::{
    new_id, Asset, AssetKind, CampaignState, Job, JobKind, TokenState,
};
use crate::store::Store;
use crate::watermark::image as wm_image;

/// Structured finding written onto a detect job row.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DetectResult {
    pub found: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_hex: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub campaign_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub campaign_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient_email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient_org: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl DetectResult {
    pub fn not_found(payload_hex: Option<String>, message: impl Into<String>) -> Self {
        DetectResult {
            found: false,
            payload_hex,
            message: Some(message.into()),
            ..Default::default()
        }
    }
}

/// Move a campaign into PROCESSING and enqueue one embed job per pending
/// token. Re-publishing is a silent no-op for tokens whose embed is already
/// queued or running. Returns the number of jobs inserted.
pub fn publish_campaign(store: &Store, campaign_id: &str) -> Result<usize> {
    let campaign = store
        .campaign(campaign_id)?
        .ok_or_else(|| Error::Internal(format!("campaign {campaign_id} not found")))?;
    match campaign.state {
        CampaignState::Draft | CampaignState::Processing => {}
        other => {
            return Err(Error::StoreConflict(format!(
                "campaign {campaign_id} is {}, not publishable",
                other.as_str()
            )))
        }
    }
    let asset = store
        .asset(&campaign.asset_id)?
        .ok_or_else(|| Error::Internal(format!("asset {} not found", campaign.asset_id)))?;
    let kind = match asset.kind {
        AssetKind::Image => JobKind::EmbedImage,
        AssetKind::Video => JobKind::EmbedVideo,
    };

    store.set_campaign_state(
        campaign_id,
        &[CampaignState::Draft],
        CampaignState::Processing,
    )?;

    let mut inserted = 0;
    for token in store.tokens_for_campaign(campaign_id)? {
        if token.state != TokenState::Pending {
            continue;
        }
        if store.enqueue(&new_job(kind, campaign_id, Some(&token.id)))? {
            inserted += 1;
        }
    }
    log::info!("campaign {campaign_id}: queued {inserted} embed job(s)");
    Ok(inserted)
}

/// Ingest a suspect file and enqueue a detect job for it. The job's
/// campaign column carries the submitting account id.
pub fn submit_detect(
    store: &Store,
    data: &DataLayout,
    account_id: &str,
    suspect_path: &Path,
) -> Result<Job> {
    let ext = layout::extension_of(suspect_path)
        .ok_or_else(|| Error::UnsupportedMedia("input has no file extension".into()))?;
    if !layout::is_image_extension(&ext) && !layout::is_video_extension(&ext) {
        return Err(Error::UnsupportedMedia(format!(
            "extension '{ext}' is not a known media type"
        )));
    }

    let mut job = new_job(JobKind::Detect, account_id, None);
    let input = data.detect_input(&job.id, &format!(".{ext}"));
    data.ensure_dir(&data.detect_dir(&job.id))?;
    fs::copy(suspect_path, &input)?;
    job.input_path = Some(input.display().to_string());
    store.enqueue(&job)?;
    log::info!("detect job {} queued for {}", job.id, input.display());
    Ok(job)
}

/// Register an uploaded master: copy it under `originals/`, hash it, write
/// the thumbnail for images (video thumbs go through the tool adapter in
/// the worker), and insert the row.
pub fn ingest_asset(
    store: &Store,
    data: &DataLayout,
    owner_id: &str,
    source: &Path,
) -> Result<Asset> {
    let ext = layout::extension_of(source)
        .ok_or_else(|| Error::UnsupportedMedia("upload has no file extension".into()))?;
    let kind = if layout::is_image_extension(&ext) {
        AssetKind::Image
    } else if layout::is_video_extension(&ext) {
        AssetKind::Video
    } else {
        return Err(Error::UnsupportedMedia(format!(
            "extension '{ext}' is not a known media type"
        )));
    };

    let id = new_id();
    data.ensure_dir(&data.asset_dir(&id))?;
    let stored = data.asset_source(&id, &format!(".{ext}"));
    fs::copy(source, &stored)?;

    let sha256 = sha256_file(&stored)?;
    let size_bytes = fs::metadata(&stored)?.len() as i64;

    let (width, height) = match kind {
        AssetKind::Image => {
            let frame = wm_image::load_frame(&stored)?;
            write_image_thumbnail(&frame, &data.asset_thumb(&id))?;
            (Some(frame.width()), Some(frame.height()))
        }
        AssetKind::Video => (None, None),
    };

    let asset = Asset {
        id,
        owner_id: owner_id.to_string(),
        kind,
        path: stored.display().to_string(),
        size_bytes,
        sha256,
        mime: mime_for_extension(&ext),
        width,
        height,
        duration_secs: None,
        created_at: now_s(),
    };
    store.insert_asset(&asset)?;
    Ok(asset)
}

/// Expire overdue campaigns and tokens, and surface stuck RUNNING jobs.
/// Returns (campaigns, tokens) expired.
pub fn expiry_sweep(store: &Store, stuck_after_secs: i64) -> Result<(usize, usize)> {
    let (campaigns, tokens) = store.expire_overdue(now_s())?;
    if campaigns > 0 || tokens > 0 {
        log::info!("expiry sweep: {campaigns} campaign(s), {tokens} token(s) expired");
    }
    for job in store.stale_running_jobs(stuck_after_secs)? {
        log::warn!(
            "job {} ({}) has been RUNNING since {:?}; crash recovery is manual",
            job.id,
            job.kind.as_str(),
            job.started_at
        );
    }
    Ok((campaigns, tokens))
}

const THUMB_LONG_SIDE: u32 = 320;
const THUMB_JPEG_QUALITY: u8 = 80;

fn write_image_thumbnail(frame: &image::RgbaImage, out: &Path) -> Result<()> {
    let (w, h) = (frame.width(), frame.height());
    let scale = THUMB_LONG_SIDE as f64 / w.max(h).max(1) as f64;
    let thumb = if scale < 1.0 {
        image::imageops::resize(
            frame,
            ((w as f64 * scale) as u32).max(1),
            ((h as f64 * scale) as u32).max(1),
            image::imageops::FilterType::Triangle,
        )
    } else {
        frame.clone()
    };
    wm_image::save_frame(&thumb, out, THUMB_JPEG_QUALITY)
}

fn mime_for_extension(ext: &str) -> String {
    match ext {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "bmp" => "image/bmp",
        "webp" => "image/webp",
        "mp4" => "video/mp4",
        "mov" => "video/quicktime",
        "mkv" => "video/x-matroska",
        "avi" => "video/x-msvideo",
        "webm" => "video/webm",
        _ => "application/octet-stream",
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::models::test_fixtures::{asset, campaign, recipient, token};
    use crate::store::models::JobState;

    fn seeded_store() -> Store {
        let store = Store::open(":memory:").expect("open");
        store.insert_asset(&asset("a1")).unwrap();
        store.insert_recipient(&recipient("r1")).unwrap();
        store.insert_recipient(&recipient("r2")).unwrap();
        store.insert_campaign(&campaign("c1", "a1")).unwrap();
        store.insert_token(&token("t1", "c1", "r1")).unwrap();
        store.insert_token(&token("t2", "c1", "r2")).unwrap();
        store
    }

    #[test]
    fn publish_enqueues_one_job_per_pending_token() {
        let store = seeded_store();
        assert_eq!(publish_campaign(&store, "c1").unwrap(), 2);
        assert_eq!(
            store.campaign("c1").unwrap().unwrap().state,
            CampaignState::Processing
        );

        // Republishing while jobs are open inserts nothing.
        assert_eq!(publish_campaign(&store, "c1").unwrap(), 0);
    }

    #[test]
    fn publish_rejects_terminal_campaigns() {
        let store = seeded_store();
        store
            .set_campaign_state("c1", &[CampaignState::Draft], CampaignState::Expired)
            .unwrap();
        assert!(matches!(
            publish_campaign(&store, "c1"),
            Err(Error::StoreConflict(_))
        ));
    }

    #[test]
    fn submit_detect_copies_input_and_enqueues() {
        let dir = tempfile::tempdir().expect("tempdir");
        let data = DataLayout::new(dir.path());
        let store = Store::open(":memory:").expect("open");

        let suspect = dir.path().join("suspect.jpg");
        fs::write(&suspect, b"not really a jpeg").unwrap();
        let job = submit_detect(&store, &data, "account-1", &suspect).expect("submit");

        assert_eq!(job.kind, JobKind::Detect);
        assert_eq!(job.campaign_id, "account-1");
        let stored = store.job(&job.id).unwrap().unwrap();
        assert_eq!(stored.state, JobState::Pending);
        let input = stored.input_path.expect("input path");
        assert!(input.ends_with("input.jpg"), "{input}");
        assert!(Path::new(&input).exists());
    }

    #[test]
    fn submit_detect_rejects_unknown_media() {
        let dir = tempfile::tempdir().expect("tempdir");
        let data = DataLayout::new(dir.path());
        let store = Store::open(":memory:").expect("open");
        let suspect = dir.path().join("suspect.pdf");
        fs::write(&suspect, b"%PDF").unwrap();
        assert!(matches!(
            submit_detect(&store, &data, "acct", &suspect),
            Err(Error::UnsupportedMedia(_))
        ));
    }

    #[test]
    fn detect_result_serialization_omits_absent_fields() {
        let not_found = DetectResult::not_found(None, "no payload");
        let json = serde_json::to_string(&not_found).unwrap();
        assert_eq!(json, r#"{"found":false,"message":"no payload"}"#);

        let found = DetectResult {
            found: true,
            payload_hex: Some("00".repeat(16)),
            token_id: Some("t1".into()),
            campaign_id: Some("c1".into()),
            campaign_name: Some("launch".into()),
            recipient_name: Some("Ada".into()),
            recipient_email: Some("ada@example.org".into()),
            recipient_org: None,
            message: None,
        };
        let json = serde_json::to_string(&found).unwrap();
        assert!(json.contains("\"recipient_name\":\"Ada\""));
        assert!(!json.contains("recipient_org"));
        assert!(!json.contains("message"));
    }
}
