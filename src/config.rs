use anyhow::{Context, Result};
use kiosk_vision::{CaptureSettings, MatchThresholds};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub static CONFIG_PATH: Lazy<&'static Path> = Lazy::new(|| {
    Path::new(
        option_env!("KIOSK_CONFIG_PATH").unwrap_or("/usr/local/etc/kiosk-checkin/config.toml"),
    )
});

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub camera: CameraConfig,
    pub matching: MatchingConfig,
    pub engine: EngineConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub min_emit_interval_ms: u64,
    pub mirror: bool,
    pub grab_timeout_ms: u64,
    pub stop_timeout_ms: u64,
    pub best_shot_ttl_secs: u64,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            width: 1440,
            height: 1920,
            fps: 30,
            min_emit_interval_ms: 200,
            mirror: true,
            grab_timeout_ms: 100,
            stop_timeout_ms: 2000,
            best_shot_ttl_secs: 8,
        }
    }
}

impl CameraConfig {
    pub fn capture_settings(&self) -> CaptureSettings {
        CaptureSettings {
            device: self.device.clone(),
            width: self.width,
            height: self.height,
            fps: self.fps,
            min_emit_interval: Duration::from_millis(self.min_emit_interval_ms),
            mirror: self.mirror,
            grab_timeout: Duration::from_millis(self.grab_timeout_ms),
            stop_timeout: Duration::from_millis(self.stop_timeout_ms),
            best_shot_ttl: Duration::from_secs(self.best_shot_ttl_secs),
        }
    }
}

/// Decision thresholds. The defaults are a starting point; tune them against
/// the deployed engine before going live.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    pub distance_threshold: f32,
    pub cosine_threshold: f32,
    pub margin: f32,
    pub quality_unmasked: f32,
    pub quality_masked: f32,
    pub prewarm_cycles: u32,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        let t = MatchThresholds::default();
        Self {
            distance_threshold: t.distance,
            cosine_threshold: t.cosine,
            margin: t.margin,
            quality_unmasked: t.quality_unmasked,
            quality_masked: t.quality_masked,
            prewarm_cycles: t.prewarm_cycles,
        }
    }
}

impl MatchingConfig {
    pub fn thresholds(&self) -> MatchThresholds {
        MatchThresholds {
            distance: self.distance_threshold,
            cosine: self.cosine_threshold,
            margin: self.margin,
            quality_unmasked: self.quality_unmasked,
            quality_masked: self.quality_masked,
            prewarm_cycles: self.prewarm_cycles,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Shared library exporting the face engine entry points.
    pub library: PathBuf,
    pub model_path: PathBuf,
    pub sdk_path: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            library: PathBuf::from("/usr/local/lib/libfacesdkwrapper.so"),
            model_path: PathBuf::from("/usr/local/share/kiosk-checkin/models"),
            sdk_path: PathBuf::from("/usr/local/share/kiosk-checkin/sdk"),
        }
    }
}

pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = path.unwrap_or(&CONFIG_PATH);
    if !path.exists() {
        log::debug!("no config at {}, using defaults", path.display());
        return Ok(Config::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config at {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
}

pub fn save_config(cfg: &Config, path: Option<&Path>) -> Result<()> {
    let path = path.unwrap_or(&CONFIG_PATH);
    let data = toml::to_string_pretty(cfg)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, data).with_context(|| format!("writing config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let cfg = load_config(Some(&dir.path().join("absent.toml")))?;
        assert_eq!(cfg, Config::default());
        assert_eq!(cfg.matching.thresholds(), MatchThresholds::default());
        Ok(())
    }

    #[test]
    fn partial_file_keeps_other_defaults() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[camera]\ndevice = \"/dev/video2\"\nmirror = false\n\n[matching]\nmargin = 0.05\n",
        )?;

        let cfg = load_config(Some(&path))?;
        assert_eq!(cfg.camera.device, "/dev/video2");
        assert!(!cfg.camera.mirror);
        assert_eq!(cfg.camera.width, 1440);
        assert_eq!(cfg.matching.margin, 0.05);
        assert_eq!(cfg.matching.distance_threshold, 0.263);
        assert_eq!(cfg.engine, EngineConfig::default());
        Ok(())
    }

    #[test]
    fn save_then_load_creates_parent_dirs() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nested/etc/config.toml");
        let mut cfg = Config::default();
        cfg.camera.fps = 15;
        cfg.engine.library = PathBuf::from("/opt/engine/libface.so");

        save_config(&cfg, Some(&path))?;
        assert_eq!(load_config(Some(&path))?, cfg);
        Ok(())
    }

    #[test]
    fn camera_section_converts_to_durations() {
        let settings = CameraConfig::default().capture_settings();
        assert_eq!(settings.min_emit_interval, Duration::from_millis(200));
        assert_eq!(settings.stop_timeout, Duration::from_secs(2));
        assert_eq!(settings.best_shot_ttl, Duration::from_secs(8));
        assert!(settings.mirror);
    }

    #[test]
    fn malformed_file_is_an_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[camera\nwidth = ")?;
        assert!(load_config(Some(&path)).is_err());
        Ok(())
    }
}
