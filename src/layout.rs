//! On-disk data layout under the configured data root.
//!
//! originals/<asset-id>/source<ext>          uploaded master
//! originals/<asset-id>/thumb.jpg            thumbnail
//! watermarked/<campaign-id>/<token-id><ext> per-recipient output
//! watermarked/<campaign-id>/<token-id>_frames/wm_frame_NNN.png
//! detect/<job-id>/input<ext>                suspect file under analysis

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;

#[derive(Clone, Debug)]
pub struct DataLayout {
    root: PathBuf,
}

impl DataLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn asset_dir(&self, asset_id: &str) -> PathBuf {
        self.root.join("originals").join(asset_id)
    }

    pub fn asset_source(&self, asset_id: &str, ext: &str) -> PathBuf {
        self.asset_dir(asset_id).join(format!("source{ext}"))
    }

    pub fn asset_thumb(&self, asset_id: &str) -> PathBuf {
        self.asset_dir(asset_id).join("thumb.jpg")
    }

    pub fn campaign_dir(&self, campaign_id: &str) -> PathBuf {
        self.root.join("watermarked").join(campaign_id)
    }

    /// Final per-recipient output: `.mp4` for video, `.jpg` for images.
    pub fn token_output(&self, campaign_id: &str, token_id: &str, ext: &str) -> PathBuf {
        self.campaign_dir(campaign_id).join(format!("{token_id}{ext}"))
    }

    /// Watermarked reference stills for a video token.
    pub fn token_frames_dir(&self, campaign_id: &str, token_id: &str) -> PathBuf {
        self.campaign_dir(campaign_id).join(format!("{token_id}_frames"))
    }

    pub fn detect_dir(&self, job_id: &str) -> PathBuf {
        self.root.join("detect").join(job_id)
    }

    pub fn detect_input(&self, job_id: &str, ext: &str) -> PathBuf {
        self.detect_dir(job_id).join(format!("input{ext}"))
    }

    /// Create the directory and return it; used before any write.
    pub fn ensure_dir(&self, dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dir)?;
        Ok(dir.to_path_buf())
    }
}

/// Extensions the pipeline accepts, split by kind.
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "webp"];
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "mkv", "avi", "webm"];

/// Lower-case extension of a path, with the leading dot stripped.
pub fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
}

pub fn is_video_extension(ext: &str) -> bool {
    VIDEO_EXTENSIONS.contains(&ext)
}

pub fn is_image_extension(ext: &str) -> bool {
    IMAGE_EXTENSIONS.contains(&ext)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_follow_the_documented_scheme() {
        let layout = DataLayout::new("/data");
        assert_eq!(
            layout.asset_source("a1", ".png"),
            PathBuf::from("/data/originals/a1/source.png")
        );
        assert_eq!(
            layout.token_output("c1", "t1", ".jpg"),
            PathBuf::from("/data/watermarked/c1/t1.jpg")
        );
        assert_eq!(
            layout.token_frames_dir("c1", "t1"),
            PathBuf::from("/data/watermarked/c1/t1_frames")
        );
        assert_eq!(
            layout.detect_input("j1", ".mp4"),
            PathBuf::from("/data/detect/j1/input.mp4")
        );
    }

    #[test]
    fn extension_classification() {
        assert!(is_image_extension("jpeg"));
        assert!(is_video_extension("mkv"));
        assert!(!is_image_extension("mp4"));
        assert_eq!(
            extension_of(Path::new("/x/y/clip.MOV")),
            Some("mov".to_string())
        );
        assert_eq!(extension_of(Path::new("/x/noext")), None);
    }
}
