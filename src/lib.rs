//! Tracemark issues per-recipient copies of a master media asset carrying
//! a visible overlay and an invisible, blind, frequency-domain watermark,
//! then attributes suspect files back to the responsible recipient.
//!
//! # Architecture
//!
//! - `dsp`: Haar DWT, orthonormal DCT-II/III and a small Jacobi SVD
//! - `payload`: the 16-byte forensic packet (CRC-16, fuzzy parsing)
//! - `watermark`: the blind image engine and the I-frame video wrapper
//! - `store`: sqlite-backed entities, the durable job queue and the
//!   forensic index
//! - `events`: in-process pub/sub for progress streaming
//! - `tool`: the ffmpeg / fallback-helper process adapter
//! - `worker`: the claim-execute pool driving embeds and detects
//! - `service`: publish, detect intake, asset ingest, expiry sweep
//!
//! The database is the single source of truth; workers coordinate only
//! through single-statement atomic updates on it.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};

pub mod cancel;
pub mod config;
pub mod dsp;
pub mod error;
pub mod events;
pub mod layout;
pub mod payload;
pub mod service;
pub mod store;
pub mod tool;
pub mod watermark;
pub mod worker;

pub use cancel::CancelToken;
pub use config::Config;
pub use error::{Error, Result};
pub use events::EventBus;
pub use layout::DataLayout;
pub use store::Store;
pub use tool::ToolAdapter;
pub use worker::{WorkerEnv, WorkerPool};

/// Seconds since the unix epoch. Clock regressions degrade to 0 instead of
/// failing calls that only want a timestamp.
pub fn now_s() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// SHA-256 of a file's contents, hex-rendered lower-case.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}
