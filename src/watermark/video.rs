//! I-frame watermarking for video assets.
//!
//! Embedding marks the extracted stills and persists them next to the
//! published video; re-injection into the coded stream is not attempted
//! (the visible overlay carries the playback-time protection). Detection
//! decodes every extracted I-frame and majority-votes the payloads.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::payload::PAYLOAD_LEN;
use crate::tool::ToolAdapter;
use crate::watermark::image;

/// Extract I-frames from `video_path` and embed `payload` into each,
/// writing `wm_frame_NNN.png` stills into `frames_dir`. Returns the stills
/// in frame order. Frames too small to carry the payload are skipped; it is
/// an error when every frame is skipped.
pub fn embed_video_frames(
    tool: &ToolAdapter,
    video_path: &Path,
    work_dir: &Path,
    frames_dir: &Path,
    payload: &[u8; PAYLOAD_LEN],
    cancel: &CancelToken,
) -> Result<Vec<PathBuf>> {
    let extracted = tool.extract_iframes(video_path, work_dir, cancel)?;
    std::fs::create_dir_all(frames_dir)?;

    let mut written = Vec::new();
    let mut last_reject = None;
    for (idx, frame_path) in extracted.iter().enumerate() {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let out = frames_dir.join(format!("wm_frame_{:03}.png", idx + 1));
        match image::embed_image_file(frame_path, &out, payload, 100) {
            Ok(()) => written.push(out),
            Err(e @ Error::ImageTooSmall(_)) => {
                log::warn!("skipping undersized I-frame {}: {e}", frame_path.display());
                last_reject = Some(e);
            }
            Err(e) => return Err(e),
        }
    }

    if written.is_empty() {
        return Err(last_reject.unwrap_or_else(|| {
            Error::ImageTooSmall("no I-frame could carry the payload".into())
        }));
    }
    Ok(written)
}

/// Decode a suspect video: extract up to 10 I-frames, run the image decoder
/// on each, and majority-vote across every frame that produced a 16-byte
/// payload. Ties break toward the earliest occurrence. Returns `None` when
/// no frame decodes at all.
pub fn detect_video(
    tool: &ToolAdapter,
    video_path: &Path,
    work_dir: &Path,
    cancel: &CancelToken,
) -> Result<Option<[u8; PAYLOAD_LEN]>> {
    let extracted = tool.extract_iframes(video_path, work_dir, cancel)?;

    let mut candidates = Vec::new();
    for frame_path in &extracted {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        match image::decode_image_file(frame_path) {
            Ok(payload) => candidates.push(payload),
            Err(e) => {
                log::debug!("I-frame {} yielded no payload: {e}", frame_path.display());
            }
        }
    }

    Ok(majority_vote(&candidates))
}

/// Strict-mode majority vote over payloads: the most frequent wins, ties
/// break toward the payload seen first.
pub fn majority_vote(candidates: &[[u8; PAYLOAD_LEN]]) -> Option<[u8; PAYLOAD_LEN]> {
    if candidates.is_empty() {
        return None;
    }
    let mut counts: HashMap<[u8; PAYLOAD_LEN], usize> = HashMap::new();
    for payload in candidates {
        *counts.entry(*payload).or_insert(0) += 1;
    }

    let mut best: Option<([u8; PAYLOAD_LEN], usize)> = None;
    for payload in candidates {
        let count = counts[payload];
        match best {
            Some((_, best_count)) if best_count >= count => {}
            _ => best = Some((*payload, count)),
        }
    }
    best.map(|(payload, _)| payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(tag: u8) -> [u8; PAYLOAD_LEN] {
        [tag; PAYLOAD_LEN]
    }

    #[test]
    fn vote_empty_is_none() {
        assert_eq!(majority_vote(&[]), None);
    }

    #[test]
    fn vote_picks_most_frequent() {
        let got = majority_vote(&[p(1), p(2), p(2), p(3), p(2)]);
        assert_eq!(got, Some(p(2)));
    }

    #[test]
    fn vote_tie_breaks_to_earliest() {
        let got = majority_vote(&[p(7), p(9), p(9), p(7)]);
        assert_eq!(got, Some(p(7)));

        let got = majority_vote(&[p(9), p(7)]);
        assert_eq!(got, Some(p(9)));
    }

    #[test]
    fn vote_single_candidate_wins() {
        assert_eq!(majority_vote(&[p(42)]), Some(p(42)));
    }
}
