//! Daemon configuration.
//!
//! An optional TOML or JSON file (path in `TRACEMARK_CONFIG`) provides the
//! base values; the documented environment options override it; validation
//! runs last. Recognised environment options: WORKER_COUNT, DATA_DIR,
//! FONT_PATH, SCRIPTS_DIR, VENV_PATH, CLEANUP_INTERVAL_MINS.

use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_WORKER_COUNT: usize = 2;
const DEFAULT_DATA_DIR: &str = "./data";
const DEFAULT_DB_FILE: &str = "tracemark.db";
const DEFAULT_CLEANUP_INTERVAL_MINS: u64 = 10;
const DEFAULT_JPEG_QUALITY: u8 = 92;
/// RUNNING jobs older than this are reported as stuck by the sweep.
const DEFAULT_STUCK_AFTER_SECS: i64 = 60 * 30;

#[derive(Debug, Deserialize, Default)]
struct ConfigFile {
    worker_count: Option<usize>,
    data_dir: Option<String>,
    db_path: Option<String>,
    font_path: Option<PathBuf>,
    scripts_dir: Option<PathBuf>,
    venv_path: Option<PathBuf>,
    cleanup_interval_mins: Option<u64>,
    jpeg_quality: Option<u8>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub worker_count: usize,
    pub data_dir: PathBuf,
    pub db_path: String,
    pub font_path: Option<PathBuf>,
    pub scripts_dir: Option<PathBuf>,
    pub venv_path: Option<PathBuf>,
    pub cleanup_interval: Duration,
    pub jpeg_quality: u8,
    pub stuck_after_secs: i64,
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("TRACEMARK_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: ConfigFile) -> Self {
        let data_dir = PathBuf::from(file.data_dir.unwrap_or_else(|| DEFAULT_DATA_DIR.to_string()));
        let db_path = file
            .db_path
            .unwrap_or_else(|| data_dir.join(DEFAULT_DB_FILE).display().to_string());
        Self {
            worker_count: file.worker_count.unwrap_or(DEFAULT_WORKER_COUNT),
            data_dir,
            db_path,
            font_path: file.font_path,
            scripts_dir: file.scripts_dir,
            venv_path: file.venv_path,
            cleanup_interval: Duration::from_secs(
                file.cleanup_interval_mins
                    .unwrap_or(DEFAULT_CLEANUP_INTERVAL_MINS)
                    * 60,
            ),
            jpeg_quality: file.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
            stuck_after_secs: DEFAULT_STUCK_AFTER_SECS,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(count) = std::env::var("WORKER_COUNT") {
            if !count.trim().is_empty() {
                self.worker_count = count
                    .trim()
                    .parse()
                    .map_err(|_| anyhow!("WORKER_COUNT must be an integer"))?;
            }
        }
        if let Ok(dir) = std::env::var("DATA_DIR") {
            if !dir.trim().is_empty() {
                self.data_dir = PathBuf::from(dir.trim());
                self.db_path = self.data_dir.join(DEFAULT_DB_FILE).display().to_string();
            }
        }
        if let Ok(path) = std::env::var("FONT_PATH") {
            if !path.trim().is_empty() {
                self.font_path = Some(PathBuf::from(path.trim()));
            }
        }
        if let Ok(path) = std::env::var("SCRIPTS_DIR") {
            if !path.trim().is_empty() {
                self.scripts_dir = Some(PathBuf::from(path.trim()));
            }
        }
        if let Ok(path) = std::env::var("VENV_PATH") {
            if !path.trim().is_empty() {
                self.venv_path = Some(PathBuf::from(path.trim()));
            }
        }
        if let Ok(mins) = std::env::var("CLEANUP_INTERVAL_MINS") {
            if !mins.trim().is_empty() {
                let mins: u64 = mins
                    .trim()
                    .parse()
                    .map_err(|_| anyhow!("CLEANUP_INTERVAL_MINS must be an integer"))?;
                self.cleanup_interval = Duration::from_secs(mins * 60);
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(anyhow!("worker_count must be at least 1"));
        }
        if self.cleanup_interval.as_secs() == 0 {
            return Err(anyhow!("cleanup interval must be greater than zero"));
        }
        if !(50..=100).contains(&self.jpeg_quality) {
            return Err(anyhow!("jpeg_quality must be between 50 and 100"));
        }
        if self.venv_path.is_some() && self.scripts_dir.is_none() {
            return Err(anyhow!("VENV_PATH is set but SCRIPTS_DIR is not"));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<ConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;

    if path.extension().map(|e| e == "toml").unwrap_or(false) {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid TOML config file {}: {}", path.display(), e))
    } else if path.extension().map(|e| e == "json").unwrap_or(false) {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid JSON config file {}: {}", path.display(), e))
    } else {
        match serde_json::from_str(&raw) {
            Ok(cfg) => Ok(cfg),
            Err(json_err) => match toml::from_str(&raw) {
                Ok(cfg) => Ok(cfg),
                Err(toml_err) => Err(anyhow!(
                    "invalid config file {} (tried JSON and TOML): json error: {}; toml error: {}",
                    path.display(),
                    json_err,
                    toml_err
                )),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::from_file(ConfigFile::default());
        assert_eq!(cfg.worker_count, 2);
        assert_eq!(cfg.data_dir, PathBuf::from("./data"));
        assert!(cfg.db_path.ends_with("tracemark.db"));
        assert_eq!(cfg.cleanup_interval, Duration::from_secs(600));
        assert_eq!(cfg.jpeg_quality, 92);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn file_values_override_defaults() {
        let file: ConfigFile = toml::from_str(
            "worker_count = 6\ndata_dir = \"/srv/marks\"\ncleanup_interval_mins = 1\n",
        )
        .expect("toml");
        let cfg = Config::from_file(file);
        assert_eq!(cfg.worker_count, 6);
        assert_eq!(cfg.data_dir, PathBuf::from("/srv/marks"));
        assert_eq!(cfg.cleanup_interval, Duration::from_secs(60));
    }

    #[test]
    fn json_config_parses_too() {
        let file: ConfigFile =
            serde_json::from_str(r#"{"worker_count": 3, "jpeg_quality": 88}"#).expect("json");
        let cfg = Config::from_file(file);
        assert_eq!(cfg.worker_count, 3);
        assert_eq!(cfg.jpeg_quality, 88);
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut cfg = Config::from_file(ConfigFile::default());
        cfg.worker_count = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::from_file(ConfigFile::default());
        cfg.jpeg_quality = 10;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::from_file(ConfigFile::default());
        cfg.venv_path = Some(PathBuf::from("/opt/venv"));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn config_file_read_reports_both_parse_errors() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config");
        std::fs::write(&path, "{not: json").unwrap();
        let err = read_config_file(&path).expect_err("should fail");
        let message = err.to_string();
        assert!(message.contains("json error"));
        assert!(message.contains("toml error"));
    }
}
