//! Worker pool driving the embed and detect pipelines.
//!
//! W OS threads run the same loop: claim the oldest pending job, execute
//! it, record the terminal state, and check whether the owning campaign is
//! done. Workers share nothing but the database and the event bus; each
//! holds its own connection. A job interrupted by shutdown is left RUNNING
//! on purpose and surfaced as stuck, never silently retried.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::events::{campaign_topic, token_topic, Event, EventBus};
use crate::layout::{self, DataLayout};
use crate::payload;
use crate::service::DetectResult;
use crate::sha256_file;
use crate::store::index::{IndexEntry, DEFAULT_MAX_HEX_DIFF};
use crate::store::models::{CampaignState, Job, JobKind};
use crate::store::Store;
use crate::tool::{overlay_text, OverlayKind, ToolAdapter};
use crate::watermark::{image as wm_image, video as wm_video, ALGORITHM_TAG};

/// Kinds every worker claims.
pub const CLAIM_KINDS: &[JobKind] = &[JobKind::EmbedImage, JobKind::EmbedVideo, JobKind::Detect];
/// Idle poll interval (interruptible by cancellation).
const IDLE_SLEEP: Duration = Duration::from_secs(2);

/// Everything a worker needs besides its own database connection.
#[derive(Clone)]
pub struct WorkerEnv {
    pub bus: EventBus,
    pub tool: ToolAdapter,
    pub data: DataLayout,
    pub cancel: CancelToken,
    pub jpeg_quality: u8,
}

pub struct WorkerPool {
    handles: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `count` workers, each with a fresh connection to `store`'s
    /// database.
    pub fn spawn(count: usize, store: &Store, env: &WorkerEnv) -> Result<Self> {
        let mut handles = Vec::with_capacity(count);
        for idx in 0..count {
            let worker_store = store.reopen()?;
            let env = env.clone();
            let handle = thread::Builder::new()
                .name(format!("tracemark-worker-{idx}"))
                .spawn(move || worker_loop(idx, worker_store, env))
                .map_err(|e| Error::Internal(format!("spawn worker {idx}: {e}")))?;
            handles.push(handle);
        }
        Ok(Self { handles })
    }

    /// Wait for every worker to observe cancellation and exit.
    pub fn join(self) {
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

fn worker_loop(idx: usize, mut store: Store, env: WorkerEnv) {
    log::info!("worker {idx} up");
    while !env.cancel.is_cancelled() {
        match store.claim_next(CLAIM_KINDS) {
            Ok(Some(job)) => run_job(&mut store, &env, job),
            Ok(None) => {
                env.cancel.sleep(IDLE_SLEEP);
            }
            Err(Error::StoreConflict(_)) => {
                // Lost the claim race; go straight back around.
            }
            Err(e) => {
                log::error!("worker {idx}: claim failed: {e}");
                env.cancel.sleep(IDLE_SLEEP);
            }
        }
    }
    log::info!("worker {idx} down");
}

/// Execute one claimed job and record its terminal state.
pub fn run_job(store: &mut Store, env: &WorkerEnv, job: Job) {
    log::info!("job {} claimed ({})", job.id, job.kind.as_str());
    let outcome = match job.kind {
        JobKind::EmbedImage | JobKind::EmbedVideo => run_embed(store, env, &job),
        JobKind::Detect => run_detect(store, env, &job),
    };

    match outcome {
        Ok(()) => {
            if let Err(e) = store.complete_job(&job.id) {
                log::warn!("job {}: completion not recorded: {e}", job.id);
            } else {
                log::info!("job {} completed", job.id);
            }
        }
        Err(Error::Cancelled) => {
            // Shutdown mid-run: leave the row RUNNING for the operator.
            log::info!("job {} interrupted by shutdown", job.id);
            return;
        }
        Err(e) => {
            let message = format!("{}:{e}", job.kind.as_str());
            log::warn!("job {} failed: {message}", job.id);
            if let Err(e2) = store.fail_job(&job.id, &message) {
                log::warn!("job {}: failure not recorded: {e2}", job.id);
            }
        }
    }

    if job.kind.is_embed() {
        check_campaign_ready(store, env, &job.campaign_id);
    }
}

/// READY once every embed job of the campaign is terminal (failures count).
fn check_campaign_ready(store: &Store, env: &WorkerEnv, campaign_id: &str) {
    let counters = match store.campaign_counters(campaign_id) {
        Ok(c) => c,
        Err(e) => {
            log::warn!("campaign {campaign_id}: counter query failed: {e}");
            return;
        }
    };
    if !counters.all_terminal() {
        return;
    }
    match store.set_campaign_state(
        campaign_id,
        &[CampaignState::Processing],
        CampaignState::Ready,
    ) {
        Ok(true) => {
            log::info!(
                "campaign {campaign_id} ready ({} ok, {} failed)",
                counters.completed,
                counters.failed
            );
            env.bus.publish(
                &campaign_topic(campaign_id),
                Event::CampaignReady {
                    campaign_id: campaign_id.to_string(),
                },
            );
        }
        Ok(false) => {}
        Err(e) => log::warn!("campaign {campaign_id}: ready transition failed: {e}"),
    }
}

fn publish_progress(store: &Store, env: &WorkerEnv, job_id: &str, token_id: &str, pct: u8) {
    if let Err(e) = store.update_progress(job_id, pct) {
        log::warn!("job {job_id}: progress write failed: {e}");
    }
    env.bus.publish(
        &token_topic(token_id),
        Event::Progress {
            token_id: token_id.to_string(),
            progress: pct,
        },
    );
}

fn check_cancel(cancel: &CancelToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    Ok(())
}

// -------------------- embed --------------------

fn run_embed(store: &mut Store, env: &WorkerEnv, job: &Job) -> Result<()> {
    let token_id = job
        .token_id
        .as_deref()
        .ok_or_else(|| Error::Internal("embed job carries no token id".into()))?;

    let joined = store
        .token_with_recipient(token_id)?
        .ok_or_else(|| Error::Internal(format!("token {token_id} not found")))?;
    let campaign = store
        .campaign(&joined.token.campaign_id)?
        .ok_or_else(|| Error::Internal(format!("campaign {} not found", joined.token.campaign_id)))?;
    let asset = store
        .asset(&campaign.asset_id)?
        .ok_or_else(|| Error::Internal(format!("asset {} not found", campaign.asset_id)))?;

    let payload_bytes = payload::build(token_id, &campaign.id);
    let caption = overlay_text(token_id, &joined.recipient.name);
    env.data.ensure_dir(&env.data.campaign_dir(&campaign.id))?;
    publish_progress(store, env, &job.id, token_id, 10);
    check_cancel(&env.cancel)?;

    let is_video = job.kind == JobKind::EmbedVideo;
    let ext = if is_video { ".mp4" } else { ".jpg" };
    let out = env.data.token_output(&campaign.id, token_id, ext);
    let frames_dir = env.data.token_frames_dir(&campaign.id, token_id);

    let produced = if is_video {
        embed_video(store, env, job, token_id, &campaign_inputs(&asset, &campaign), &out, &frames_dir, &payload_bytes, &caption)
    } else {
        embed_image(store, env, job, token_id, &campaign_inputs(&asset, &campaign), &out, &payload_bytes, &caption)
    };

    if let Err(e) = produced {
        remove_partial_outputs(&out, &frames_dir);
        return Err(e);
    }

    check_cancel(&env.cancel)?;
    let output_sha256 = sha256_file(&out)?;
    let output_size = fs::metadata(&out)?.len() as i64;
    let index_payload = campaign.invisible_wm.then_some(&payload_bytes);
    store.activate_token(
        token_id,
        &out.display().to_string(),
        index_payload,
        &output_sha256,
        output_size,
        &campaign.id,
        &joined.token.recipient_id,
        ALGORITHM_TAG,
    )?;

    env.bus.publish(
        &token_topic(token_id),
        Event::TokenReady {
            token_id: token_id.to_string(),
        },
    );
    Ok(())
}

struct EmbedInputs {
    asset_path: PathBuf,
    visible_wm: bool,
    invisible_wm: bool,
}

fn campaign_inputs(asset: &crate::store::models::Asset, campaign: &crate::store::models::Campaign) -> EmbedInputs {
    EmbedInputs {
        asset_path: PathBuf::from(&asset.path),
        visible_wm: campaign.visible_wm,
        invisible_wm: campaign.invisible_wm,
    }
}

#[allow(clippy::too_many_arguments)]
fn embed_image(
    store: &Store,
    env: &WorkerEnv,
    job: &Job,
    token_id: &str,
    inputs: &EmbedInputs,
    out: &Path,
    payload_bytes: &[u8; 16],
    caption: &str,
) -> Result<()> {
    // The visible-overlay intermediate stays lossless so the invisible
    // layer embeds into unquantised pixels.
    let visible_tmp = out.with_extension("visible.png");

    let embed_source = if inputs.visible_wm {
        env.tool.render_visible_overlay(
            OverlayKind::Image,
            &inputs.asset_path,
            &visible_tmp,
            caption,
            &env.cancel,
        )?;
        visible_tmp.clone()
    } else {
        inputs.asset_path.clone()
    };
    publish_progress(store, env, &job.id, token_id, 30);
    check_cancel(&env.cancel)?;

    let result = if inputs.invisible_wm {
        wm_image::embed_image_file(&embed_source, out, payload_bytes, env.jpeg_quality)
    } else {
        // Overlay-only campaigns still publish a normalised JPEG.
        wm_image::load_frame(&embed_source)
            .and_then(|frame| wm_image::save_frame(&frame, out, env.jpeg_quality))
    };
    if visible_tmp.exists() {
        let _ = fs::remove_file(&visible_tmp);
    }
    result?;

    publish_progress(store, env, &job.id, token_id, 90);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn embed_video(
    store: &Store,
    env: &WorkerEnv,
    job: &Job,
    token_id: &str,
    inputs: &EmbedInputs,
    out: &Path,
    frames_dir: &Path,
    payload_bytes: &[u8; 16],
    caption: &str,
) -> Result<()> {
    if inputs.visible_wm {
        env.tool.render_visible_overlay(
            OverlayKind::Video,
            &inputs.asset_path,
            out,
            caption,
            &env.cancel,
        )?;
    } else {
        fs::copy(&inputs.asset_path, out)?;
    }
    publish_progress(store, env, &job.id, token_id, 30);
    check_cancel(&env.cancel)?;

    if inputs.invisible_wm {
        // Reference stills come from the published file so they match what
        // recipients actually receive.
        let extract_dir = out.with_extension("extract");
        let stills = wm_video::embed_video_frames(
            &env.tool,
            out,
            &extract_dir,
            frames_dir,
            payload_bytes,
            &env.cancel,
        );
        let _ = fs::remove_dir_all(&extract_dir);
        let stills = stills?;
        publish_progress(store, env, &job.id, token_id, 60);
        log::info!(
            "token {token_id}: {} watermarked reference frame(s)",
            stills.len()
        );
    }

    publish_progress(store, env, &job.id, token_id, 90);
    Ok(())
}

fn remove_partial_outputs(out: &Path, frames_dir: &Path) {
    if out.exists() {
        let _ = fs::remove_file(out);
    }
    let visible_tmp = out.with_extension("visible.png");
    if visible_tmp.exists() {
        let _ = fs::remove_file(visible_tmp);
    }
    let extract_dir = out.with_extension("extract");
    if extract_dir.exists() {
        let _ = fs::remove_dir_all(extract_dir);
    }
    if frames_dir.exists() {
        let _ = fs::remove_dir_all(frames_dir);
    }
}

// -------------------- detect --------------------

fn run_detect(store: &mut Store, env: &WorkerEnv, job: &Job) -> Result<()> {
    let input = job
        .input_path
        .as_deref()
        .ok_or_else(|| Error::Internal("detect job carries no input path".into()))?;
    let input = Path::new(input);
    let ext = layout::extension_of(input)
        .ok_or_else(|| Error::UnsupportedMedia("detect input has no extension".into()))?;

    store.update_progress(&job.id, 10)?;
    check_cancel(&env.cancel)?;

    let extracted = if layout::is_video_extension(&ext) {
        let frames_dir = env.data.detect_dir(&job.id).join("frames");
        wm_video::detect_video(&env.tool, input, &frames_dir, &env.cancel)?
    } else if layout::is_image_extension(&ext) {
        decode_still(env, input)?
    } else {
        return Err(Error::UnsupportedMedia(format!(
            "extension '{ext}' is not a known media type"
        )));
    };
    store.update_progress(&job.id, 60)?;
    check_cancel(&env.cancel)?;

    let result = resolve_payload(store, extracted)?;
    if result.found {
        log::info!(
            "detect job {}: attributed to token {}",
            job.id,
            result.token_id.as_deref().unwrap_or("?")
        );
    } else {
        log::info!("detect job {}: no attribution", job.id);
    }
    store.set_job_result(&job.id, &serde_json::to_string(&result)?)?;
    store.update_progress(&job.id, 90)?;
    Ok(())
}

/// Decode a still, falling back to the legacy helper when the native
/// decoder finds nothing and a helper is configured. A frame that simply
/// carries no payload is not an error here.
fn decode_still(env: &WorkerEnv, input: &Path) -> Result<Option<[u8; 16]>> {
    match wm_image::decode_image_file(input) {
        Ok(payload) => Ok(Some(payload)),
        Err(Error::Cancelled) => Err(Error::Cancelled),
        Err(e) => {
            log::debug!("native decode of {} failed: {e}", input.display());
            if env.tool.has_fallback() {
                match env.tool.fallback_decode(input, &env.cancel)? {
                    Some(hex_payload) => {
                        let bytes = hex::decode(hex_payload.trim()).map_err(|e| {
                            Error::ExternalToolFailed(format!("fallback payload not hex: {e}"))
                        })?;
                        let payload: [u8; 16] = bytes.as_slice().try_into().map_err(|_| {
                            Error::ExternalToolFailed(format!(
                                "fallback payload is {} bytes, wanted 16",
                                bytes.len()
                            ))
                        })?;
                        Ok(Some(payload))
                    }
                    None => Ok(None),
                }
            } else {
                Ok(None)
            }
        }
    }
}

/// Turn extracted payload bytes into the structured finding: strict parse
/// with exact lookup first, then the fuzzy parse and Hamming scan.
fn resolve_payload(store: &Store, extracted: Option<[u8; 16]>) -> Result<DetectResult> {
    let Some(bytes) = extracted else {
        return Ok(DetectResult::not_found(
            None,
            "no watermark payload could be extracted",
        ));
    };
    let payload_hex = hex::encode(bytes);

    match payload::parse_strict(&bytes) {
        Ok(parsed) => {
            if let Some(entry) = store.lookup_exact(&parsed.token_hash_hex)? {
                return Ok(attributed(store, &entry, &payload_hex));
            }
            // Valid packet from a foreign or purged deployment; a near
            // match is still worth reporting.
            if let Some((entry, diff)) =
                store.lookup_fuzzy(&parsed.token_hash_hex, DEFAULT_MAX_HEX_DIFF)?
            {
                log::info!("exact miss, fuzzy hit at distance {diff}");
                return Ok(attributed(store, &entry, &payload_hex));
            }
            Ok(DetectResult::not_found(
                Some(payload_hex),
                "payload validated but matches no stored token",
            ))
        }
        Err(strict_err) => match payload::parse_fuzzy(&bytes) {
            Ok(parsed) => {
                if let Some((entry, diff)) =
                    store.lookup_fuzzy(&parsed.token_hash_hex, DEFAULT_MAX_HEX_DIFF)?
                {
                    log::info!("fuzzy attribution at distance {diff} ({strict_err})");
                    return Ok(attributed(store, &entry, &payload_hex));
                }
                Ok(DetectResult::not_found(
                    Some(payload_hex),
                    "payload did not validate and no stored token is close enough",
                ))
            }
            Err(_) => Ok(DetectResult::not_found(
                Some(payload_hex),
                "extracted bytes do not resemble a payload",
            )),
        },
    }
}

fn attributed(store: &Store, entry: &IndexEntry, payload_hex: &str) -> DetectResult {
    let campaign_name = store
        .campaign(&entry.campaign_id)
        .ok()
        .flatten()
        .map(|c| c.name);
    let recipient = store.recipient(&entry.recipient_id).ok().flatten();

    DetectResult {
        found: true,
        payload_hex: Some(payload_hex.to_string()),
        token_id: Some(entry.token_id.clone()),
        campaign_id: Some(entry.campaign_id.clone()),
        campaign_name,
        recipient_name: recipient.as_ref().map(|r| r.name.clone()),
        recipient_email: recipient.as_ref().map(|r| r.email.clone()),
        recipient_org: recipient.and_then(|r| r.organisation),
        message: None,
    }
}
