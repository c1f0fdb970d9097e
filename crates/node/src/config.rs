use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Largest payload a single UDP datagram can carry over IPv4.
pub const MAX_DATAGRAM: usize = 65_507;

/// Timing and storage knobs shared by every cell. All intervals are in
/// milliseconds so the file format stays plain JSON numbers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CellConfig {
    pub host: IpAddr,
    pub storage_root: PathBuf,
    pub heartbeat_interval_ms: u64,
    pub dead_check_interval_ms: u64,
    /// A neighbor silent for longer than this is declared dead.
    pub dead_after_ms: u64,
    pub differentiate_after_ms: u64,
    pub max_datagram: usize,
}

impl Default for CellConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            storage_root: PathBuf::from("."),
            heartbeat_interval_ms: 2_000,
            dead_check_interval_ms: 3_000,
            dead_after_ms: 6_000,
            differentiate_after_ms: 10_000,
            max_datagram: MAX_DATAGRAM,
        }
    }
}

impl CellConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn dead_check_interval(&self) -> Duration {
        Duration::from_millis(self.dead_check_interval_ms.max(1))
    }

    pub fn dead_after(&self) -> Duration {
        Duration::from_millis(self.dead_after_ms)
    }

    pub fn differentiate_after(&self) -> Duration {
        Duration::from_millis(self.differentiate_after_ms)
    }

    pub fn storage_dir(&self, port: u16) -> PathBuf {
        self.storage_root.join(format!("storage_{port}"))
    }
}

pub fn load_config(path: &Path) -> anyhow::Result<CellConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read cell config {}", path.display()))?;
    let cfg: CellConfig = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse cell config {}", path.display()))?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_protocol_timings() {
        let cfg = CellConfig::default();
        assert_eq!(cfg.heartbeat_interval(), Duration::from_secs(2));
        assert_eq!(cfg.dead_check_interval(), Duration::from_secs(3));
        assert_eq!(cfg.dead_after(), Duration::from_secs(6));
        assert_eq!(cfg.differentiate_after(), Duration::from_secs(10));
        assert_eq!(cfg.storage_dir(5001), PathBuf::from("./storage_5001"));
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cell.json");
        fs::write(&path, r#"{"heartbeat_interval_ms": 250, "storage_root": "/var/cells"}"#).unwrap();

        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.heartbeat_interval_ms, 250);
        assert_eq!(cfg.storage_root, PathBuf::from("/var/cells"));
        assert_eq!(cfg.dead_after_ms, 6_000);
    }

    #[test]
    fn bad_files_report_their_path() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.json");
        let err = load_config(&missing).unwrap_err();
        assert!(format!("{err:#}").contains("absent.json"));

        let broken = dir.path().join("broken.json");
        fs::write(&broken, "{ not json").unwrap();
        let err = load_config(&broken).unwrap_err();
        assert!(err.to_string().contains("failed to parse"));
    }
}
