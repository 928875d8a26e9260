//! External-tool adapter.
//!
//! Everything the pipeline cannot do natively goes through one narrow
//! contract: spawn a process with a cancellation handle, capture combined
//! stdout/stderr on failure, and (for the legacy helper) parse a JSON
//! result document with `status`, `message` and optional `payload_hex`.
//!
//! Operations: I-frame extraction, visible-overlay rendering (ffmpeg
//! drawtext), video thumbnails, and the optional fallback invisible-mark
//! helper configured via SCRIPTS_DIR / VENV_PATH.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::Duration;

use serde::Deserialize;

use crate::cancel::CancelToken;
use crate::error::{Error, Result};

/// How often a running child is polled for exit and cancellation.
const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Cap on captured output carried into an error message.
const OUTPUT_CAP: usize = 4096;
/// Upper bound on extracted I-frames per asset.
pub const MAX_IFRAMES: usize = 10;

/// Media kind for overlay rendering.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OverlayKind {
    Image,
    Video,
}

/// Result document produced by the fallback helper tool.
#[derive(Debug, Deserialize)]
pub struct ToolReport {
    pub status: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub payload_hex: Option<String>,
}

#[derive(Clone, Debug)]
pub struct ToolAdapter {
    ffmpeg: String,
    font_path: Option<PathBuf>,
    scripts_dir: Option<PathBuf>,
    venv_path: Option<PathBuf>,
}

impl ToolAdapter {
    pub fn new(
        font_path: Option<PathBuf>,
        scripts_dir: Option<PathBuf>,
        venv_path: Option<PathBuf>,
    ) -> Self {
        Self {
            ffmpeg: "ffmpeg".to_string(),
            font_path,
            scripts_dir,
            venv_path,
        }
    }

    /// Override the ffmpeg binary (tests point this at a stub script).
    pub fn with_ffmpeg(mut self, ffmpeg: impl Into<String>) -> Self {
        self.ffmpeg = ffmpeg.into();
        self
    }

    /// Extract up to [`MAX_IFRAMES`] I-frames as `frame_NNN.png` into
    /// `out_dir`, returning the produced paths in frame order.
    pub fn extract_iframes(
        &self,
        video_path: &Path,
        out_dir: &Path,
        cancel: &CancelToken,
    ) -> Result<Vec<PathBuf>> {
        std::fs::create_dir_all(out_dir)?;
        let pattern = out_dir.join("frame_%03d.png");
        let mut cmd = Command::new(&self.ffmpeg);
        cmd.arg("-hide_banner")
            .arg("-y")
            .arg("-i")
            .arg(video_path)
            .arg("-vf")
            .arg("select='eq(pict_type,I)'")
            .arg("-vsync")
            .arg("vfr")
            .arg("-frames:v")
            .arg(MAX_IFRAMES.to_string())
            .arg(&pattern);
        self.run(cmd, cancel)?;

        let mut frames: Vec<PathBuf> = std::fs::read_dir(out_dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with("frame_") && n.ends_with(".png"))
                    .unwrap_or(false)
            })
            .collect();
        frames.sort();
        frames.truncate(MAX_IFRAMES);
        if frames.is_empty() {
            return Err(Error::ExternalToolFailed(format!(
                "no I-frames extracted from {}",
                video_path.display()
            )));
        }
        Ok(frames)
    }

    /// Render the visible overlay. `text` is the per-token caption; escaping
    /// for the drawtext filter grammar happens here.
    pub fn render_visible_overlay(
        &self,
        kind: OverlayKind,
        input: &Path,
        output: &Path,
        text: &str,
        cancel: &CancelToken,
    ) -> Result<()> {
        let filter = match kind {
            OverlayKind::Image => self.image_overlay_filter(text),
            OverlayKind::Video => self.video_overlay_filter(text),
        };

        let mut cmd = Command::new(&self.ffmpeg);
        cmd.arg("-hide_banner").arg("-y").arg("-i").arg(input).arg("-vf").arg(&filter);
        if kind == OverlayKind::Video {
            // Re-encode video, keep the audio stream untouched.
            cmd.arg("-c:a").arg("copy");
        }
        cmd.arg(output);
        self.run(cmd, cancel)
    }

    /// Still-video thumbnail (first frame, scaled to 320 on the long side).
    pub fn video_thumbnail(&self, input: &Path, output: &Path, cancel: &CancelToken) -> Result<()> {
        let mut cmd = Command::new(&self.ffmpeg);
        cmd.arg("-hide_banner")
            .arg("-y")
            .arg("-i")
            .arg(input)
            .arg("-frames:v")
            .arg("1")
            .arg("-vf")
            .arg("scale='if(gt(iw,ih),320,-2)':'if(gt(iw,ih),-2,320)'")
            .arg(output);
        self.run(cmd, cancel)
    }

    /// Whether the legacy helper is configured.
    pub fn has_fallback(&self) -> bool {
        self.scripts_dir.is_some()
    }

    /// Invoke the legacy invisible-mark helper in decode mode. Returns the
    /// payload hex from its JSON report when `status` is "ok".
    pub fn fallback_decode(&self, input: &Path, cancel: &CancelToken) -> Result<Option<String>> {
        let report = self.run_fallback(&["decode", "--input"], input, cancel)?;
        if report.status == "ok" {
            Ok(report.payload_hex)
        } else {
            Err(Error::ExternalToolFailed(format!(
                "fallback decode: {}",
                report.message
            )))
        }
    }

    fn run_fallback(&self, args: &[&str], input: &Path, cancel: &CancelToken) -> Result<ToolReport> {
        let scripts = self.scripts_dir.as_ref().ok_or_else(|| {
            Error::ExternalToolFailed("fallback tool requested but SCRIPTS_DIR not set".into())
        })?;
        let python = match &self.venv_path {
            Some(venv) => venv.join("bin").join("python"),
            None => PathBuf::from("python3"),
        };
        let mut cmd = Command::new(python);
        cmd.arg(scripts.join("invisible_wm.py"));
        cmd.args(args);
        cmd.arg(input);
        let stdout = self.run_capture(cmd, cancel)?;
        parse_report(&stdout)
    }

    fn image_overlay_filter(&self, text: &str) -> String {
        let caption = escape_filter_text(text);
        let font = self.font_clause();
        // Tiled at three positions so cropping any one corner leaves a mark.
        let spots = [
            ("w*0.04", "h*0.06"),
            ("(w-text_w)/2", "(h-text_h)/2"),
            ("w*0.96-text_w", "h*0.92"),
        ];
        spots
            .iter()
            .map(|(x, y)| {
                format!(
                    "drawtext=text='{caption}'{font}:fontsize=h/28:fontcolor=white@0.45:\
borderw=1:bordercolor=black@0.35:x={x}:y={y}"
                )
            })
            .collect::<Vec<_>>()
            .join(",")
    }

    fn video_overlay_filter(&self, text: &str) -> String {
        let caption = escape_filter_text(text);
        let font = self.font_clause();
        // The corner mark rotates every 30 s of media time through a 120 s
        // cycle; a faint centred copy is always on.
        let corners = [
            ("w*0.04", "h*0.06", "lt(mod(t\\,120)\\,30)"),
            ("w*0.96-text_w", "h*0.06", "between(mod(t\\,120)\\,30\\,60)"),
            ("w*0.96-text_w", "h*0.92", "between(mod(t\\,120)\\,60\\,90)"),
            ("w*0.04", "h*0.92", "gte(mod(t\\,120)\\,90)"),
        ];
        let mut parts: Vec<String> = corners
            .iter()
            .map(|(x, y, enable)| {
                format!(
                    "drawtext=text='{caption}'{font}:fontsize=h/24:fontcolor=white@0.5:\
borderw=1:bordercolor=black@0.4:x={x}:y={y}:enable='{enable}'"
                )
            })
            .collect();
        parts.push(format!(
            "drawtext=text='{caption}'{font}:fontsize=h/14:fontcolor=white@0.12:\
x=(w-text_w)/2:y=(h-text_h)/2"
        ));
        parts.join(",")
    }

    fn font_clause(&self) -> String {
        match &self.font_path {
            Some(path) => format!(":fontfile='{}'", escape_filter_text(&path.display().to_string())),
            None => String::new(),
        }
    }

    fn run(&self, cmd: Command, cancel: &CancelToken) -> Result<()> {
        self.run_capture(cmd, cancel).map(|_| ())
    }

    /// Spawn, poll for exit or cancellation, and return stdout. Non-zero
    /// exits surface the combined (capped) output.
    fn run_capture(&self, mut cmd: Command, cancel: &CancelToken) -> Result<String> {
        cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
        let program = format!("{:?}", cmd.get_program());
        let mut child = cmd
            .spawn()
            .map_err(|e| Error::ExternalToolFailed(format!("spawn {program}: {e}")))?;

        let stdout_handle = drain(child.stdout.take());
        let stderr_handle = drain(child.stderr.take());

        let status = loop {
            if cancel.is_cancelled() {
                let _ = child.kill();
                let _ = child.wait();
                return Err(Error::Cancelled);
            }
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    cancel.sleep(POLL_INTERVAL);
                }
                Err(e) => {
                    kill_quietly(&mut child);
                    return Err(Error::ExternalToolFailed(format!("wait {program}: {e}")));
                }
            }
        };

        let stdout = stdout_handle.join().unwrap_or_default();
        let stderr = stderr_handle.join().unwrap_or_default();
        if !status.success() {
            let mut combined = String::new();
            combined.push_str(&stdout);
            combined.push_str(&stderr);
            let mut cap = OUTPUT_CAP.min(combined.len());
            while !combined.is_char_boundary(cap) {
                cap -= 1;
            }
            combined.truncate(cap);
            return Err(Error::ExternalToolFailed(format!(
                "{program} exited with {status}: {combined}"
            )));
        }
        Ok(stdout)
    }
}

fn drain(pipe: Option<impl Read + Send + 'static>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = String::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_string(&mut buf);
        }
        buf
    })
}

fn kill_quietly(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

/// Parse the helper's JSON report. The document is the last non-empty line
/// of stdout so the helper may log freely above it.
fn parse_report(stdout: &str) -> Result<ToolReport> {
    let line = stdout
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .ok_or_else(|| Error::ExternalToolFailed("fallback tool produced no output".into()))?;
    serde_json::from_str(line)
        .map_err(|e| Error::ExternalToolFailed(format!("unparsable tool report: {e}")))
}

/// Escape text for ffmpeg's filter grammar: the filter string is quoted
/// with single quotes, so quotes, backslashes, colons, commas, percent and
/// brackets all need a backslash.
pub fn escape_filter_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 8);
    for ch in text.chars() {
        match ch {
            '\\' | '\'' | ':' | ',' | '%' | '[' | ']' | '=' | ';' => {
                out.push('\\');
                out.push(ch);
            }
            _ => out.push(ch),
        }
    }
    out
}

/// The caption stamped onto every visible overlay:
/// `[<first 8 hex of SHA-256(token id)> | <recipient name>]`.
pub fn overlay_text(token_id: &str, recipient_name: &str) -> String {
    format!(
        "[{} | {}]",
        crate::payload::token_short_hash(token_id),
        recipient_name
    )
}
