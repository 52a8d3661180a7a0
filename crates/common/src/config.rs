//! Harness configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{Error, Result};

/// Harness configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Directory receiving one timestamped directory per run
    pub log_dir: PathBuf,

    /// Hypervisor configuration
    pub hypervisor: HypervisorConfig,

    /// Remote display configuration
    pub display: DisplayConfig,

    /// Video recording configuration
    pub recording: RecordingConfig,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("logs"),
            hypervisor: HypervisorConfig::default(),
            display: DisplayConfig::default(),
            recording: RecordingConfig::default(),
        }
    }
}

/// Hypervisor-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HypervisorConfig {
    /// Connection URI
    pub uri: String,

    /// Path to the virsh binary
    pub virsh: String,

    /// Name of the storage pool shared by all machines of a run
    pub pool_name: String,

    /// Filesystem path the pool is rooted at
    pub pool_path: PathBuf,

    /// Pool descriptor template overriding the built-in directory pool
    pub pool_template: Option<PathBuf>,

    /// First machine identifier handed out
    pub first_id: u32,

    /// Identifiers tried before a build gives up on collisions
    pub max_id_attempts: u32,

    /// How long cleanup waits for an interrupted creation to finish
    pub settle_timeout_secs: u64,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            uri: "qemu:///system".to_string(),
            virsh: "virsh".to_string(),
            pool_name: "sightline-disks".to_string(),
            pool_path: PathBuf::from("/var/lib/sightline/pool"),
            pool_template: None,
            first_id: 0,
            max_id_attempts: 32,
            settle_timeout_secs: 30,
        }
    }
}

/// Remote display configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// Path to the vncdo binary
    pub vncdo: String,

    /// VNC password, empty for none
    pub password: String,

    /// Sleep between two screen captures while polling
    pub poll_interval_ms: u64,

    /// Default timeout of find and of clicks resolved from an image
    pub find_timeout_secs: u64,

    /// Default timeout of wait
    pub wait_timeout_secs: u64,

    /// Pause between typed characters
    pub typing_delay_ms: u64,

    /// Pause between the two presses of a double click
    pub double_click_gap_ms: u64,

    /// Captures no wider than this and no taller than `min_screen_height`
    /// are treated as incomplete framebuffers
    pub min_screen_width: u32,

    pub min_screen_height: u32,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            vncdo: "vncdo".to_string(),
            password: String::new(),
            poll_interval_ms: 250,
            find_timeout_secs: 10,
            wait_timeout_secs: 30,
            typing_delay_ms: 100,
            double_click_gap_ms: 100,
            min_screen_width: 720,
            min_screen_height: 400,
        }
    }
}

impl DisplayConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn find_timeout(&self) -> Duration {
        Duration::from_secs(self.find_timeout_secs)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }

    pub fn typing_delay(&self) -> Duration {
        Duration::from_millis(self.typing_delay_ms)
    }

    pub fn double_click_gap(&self) -> Duration {
        Duration::from_millis(self.double_click_gap_ms)
    }
}

/// Video recording configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    /// Path to the ffmpeg binary
    pub ffmpeg: String,

    /// Video codec passed to ffmpeg
    pub codec: String,

    /// Frames per second of the output stream
    pub fps: u32,

    pub width: u32,

    pub height: u32,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            ffmpeg: "ffmpeg".to_string(),
            codec: "libtheora".to_string(),
            fps: 2,
            width: 1024,
            height: 768,
        }
    }
}

impl HarnessConfig {
    /// Load configuration from file, falling back to defaults when it is absent
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Reject values the harness cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.hypervisor.max_id_attempts == 0 {
            return Err(Error::InvalidConfig(
                "hypervisor.max_id_attempts must be at least 1".to_string(),
            ));
        }
        if self.display.poll_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "display.poll_interval_ms must be positive".to_string(),
            ));
        }
        if self.recording.fps == 0 || self.recording.width == 0 || self.recording.height == 0 {
            return Err(Error::InvalidConfig(
                "recording fps and size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = HarnessConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.hypervisor.uri, "qemu:///system");
        assert_eq!(config.display.poll_interval(), Duration::from_millis(250));
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sightline.toml");
        std::fs::write(
            &path,
            r#"
log_dir = "/tmp/runs"

[hypervisor]
uri = "qemu:///session"
max_id_attempts = 4

[display]
wait_timeout_secs = 90
"#,
        )
        .unwrap();

        let config = HarnessConfig::load(&path).unwrap();
        assert_eq!(config.log_dir, PathBuf::from("/tmp/runs"));
        assert_eq!(config.hypervisor.uri, "qemu:///session");
        assert_eq!(config.hypervisor.max_id_attempts, 4);
        assert_eq!(config.hypervisor.pool_name, "sightline-disks");
        assert_eq!(config.display.wait_timeout(), Duration::from_secs(90));
        assert_eq!(config.display.find_timeout(), Duration::from_secs(10));
        assert_eq!(config.recording.codec, "libtheora");
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sightline.toml");
        std::fs::write(&path, "[hypervisor]\nmax_id_attempts = 0\n").unwrap();
        assert!(matches!(
            HarnessConfig::load(&path),
            Err(Error::InvalidConfig(_))
        ));
    }
}
