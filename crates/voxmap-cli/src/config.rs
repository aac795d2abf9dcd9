//! Configuration vault – reads/writes `~/.voxmap/config.toml`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use voxmap_perception::{Block, GridParams, PreprocessConfig, Reduction};
use voxmap_runtime::{DecayConfig, PipelineConfig};
use voxmap_types::{MapDefinition, MapError};

/// Persisted mapping configuration stored in `~/.voxmap/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Depth sensor resolution, columns.
    #[serde(default = "default_sensor_width")]
    pub sensor_width: usize,

    /// Depth sensor resolution, rows.
    #[serde(default = "default_sensor_height")]
    pub sensor_height: usize,

    /// Nearest accepted depth (meters).
    #[serde(default = "default_depth_min")]
    pub depth_min: f64,

    /// Farthest accepted depth (meters).
    #[serde(default = "default_depth_max")]
    pub depth_max: f64,

    #[serde(default = "default_block_side")]
    pub downsample_block_width: usize,

    #[serde(default = "default_block_side")]
    pub downsample_block_height: usize,

    /// `"min"`, `"max"` or `"mean"`.  Checked when the pipeline is built.
    #[serde(default = "default_downsample_method")]
    pub downsample_method: String,

    /// Merge duplicate voxels within a frame before applying them.
    #[serde(default = "default_enable_compression")]
    pub enable_compression: bool,

    /// Half edge length of the decay window around the platform (meters).
    #[serde(default = "default_decay_half_extent")]
    pub decay_half_extent: f64,

    /// Weight removed per frame inside the decay window; `0` disables decay.
    #[serde(default = "default_decay_amount")]
    pub decay_amount: u16,

    #[serde(default = "default_max_weight")]
    pub max_weight: u16,

    #[serde(default = "default_hit_gain")]
    pub hit_gain: u16,

    /// Longest single worker wait in milliseconds; `0` waits until woken.
    #[serde(default = "default_recv_timeout_ms")]
    pub recv_timeout_ms: u64,

    /// Rate of the built-in synthetic sensor (frames per second).
    #[serde(default = "default_frame_rate_hz")]
    pub frame_rate_hz: f64,

    /// Where to write the JSON map snapshot on exit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export_path: Option<PathBuf>,

    /// Mapped volume.  Kept last so TOML emits it as a trailing table.
    #[serde(default = "default_map")]
    pub map: MapDefinition,
}

fn default_sensor_width() -> usize {
    640
}
fn default_sensor_height() -> usize {
    480
}
fn default_depth_min() -> f64 {
    0.1
}
fn default_depth_max() -> f64 {
    10.0
}
fn default_block_side() -> usize {
    1
}
fn default_downsample_method() -> String {
    Reduction::default().to_string()
}
fn default_enable_compression() -> bool {
    true
}
fn default_decay_half_extent() -> f64 {
    DecayConfig::default().half_extent
}
fn default_decay_amount() -> u16 {
    DecayConfig::default().amount
}
fn default_max_weight() -> u16 {
    GridParams::default().max_weight
}
fn default_hit_gain() -> u16 {
    GridParams::default().hit_gain
}
fn default_recv_timeout_ms() -> u64 {
    100
}
fn default_frame_rate_hz() -> f64 {
    30.0
}
/// 24 m × 24 m × 6 m around the start position at 0.2 m resolution.
fn default_map() -> MapDefinition {
    MapDefinition {
        x_min: -12.0,
        y_min: -12.0,
        z_min: -3.0,
        x_max: 12.0,
        y_max: 12.0,
        z_max: 3.0,
        x_div: 121,
        y_div: 121,
        z_div: 31,
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sensor_width: default_sensor_width(),
            sensor_height: default_sensor_height(),
            depth_min: default_depth_min(),
            depth_max: default_depth_max(),
            downsample_block_width: default_block_side(),
            downsample_block_height: default_block_side(),
            downsample_method: default_downsample_method(),
            enable_compression: default_enable_compression(),
            decay_half_extent: default_decay_half_extent(),
            decay_amount: default_decay_amount(),
            max_weight: default_max_weight(),
            hit_gain: default_hit_gain(),
            recv_timeout_ms: default_recv_timeout_ms(),
            frame_rate_hz: default_frame_rate_hz(),
            export_path: None,
            map: default_map(),
        }
    }
}

impl Config {
    pub fn map_definition(&self) -> MapDefinition {
        self.map
    }

    pub fn grid_params(&self) -> GridParams {
        GridParams {
            max_weight: self.max_weight,
            hit_gain: self.hit_gain,
        }
    }

    /// Convert to the runtime's value-only pipeline configuration.
    ///
    /// # Errors
    ///
    /// [`MapError::Config`] for an unknown `downsample_method`.  Geometry
    /// checks happen later, in `Pipeline::spawn`.
    pub fn pipeline_config(&self) -> Result<PipelineConfig, MapError> {
        let reduction: Reduction = self.downsample_method.parse()?;
        Ok(PipelineConfig {
            width: self.sensor_width,
            height: self.sensor_height,
            preprocess: PreprocessConfig {
                min_range: self.depth_min,
                max_range: self.depth_max,
                block: Block::new(self.downsample_block_width, self.downsample_block_height),
                reduction,
            },
            enable_compression: self.enable_compression,
            decay: DecayConfig {
                half_extent: self.decay_half_extent,
                amount: self.decay_amount,
            },
            recv_timeout: (self.recv_timeout_ms > 0)
                .then(|| Duration::from_millis(self.recv_timeout_ms)),
        })
    }
}

/// Return the path to `~/.voxmap/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".voxmap").join("config.toml")
}

/// Load the config from a specific path.  Returns `None` if the file does
/// not exist.
pub fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let mut cfg: Config =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Apply `VOXMAP_*` environment variable overrides to `cfg`.  Values that do
/// not parse are ignored.
///
/// | Variable | Config field |
/// |---|---|
/// | `VOXMAP_DEPTH_MIN` | `depth_min` |
/// | `VOXMAP_DEPTH_MAX` | `depth_max` |
/// | `VOXMAP_DOWNSAMPLE_METHOD` | `downsample_method` |
/// | `VOXMAP_ENABLE_COMPRESSION` | `enable_compression` |
/// | `VOXMAP_EXPORT_PATH` | `export_path` |
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("VOXMAP_DEPTH_MIN")
        && let Ok(min) = v.trim().parse::<f64>()
    {
        cfg.depth_min = min;
    }
    if let Ok(v) = std::env::var("VOXMAP_DEPTH_MAX")
        && let Ok(max) = v.trim().parse::<f64>()
    {
        cfg.depth_max = max;
    }
    if let Ok(v) = std::env::var("VOXMAP_DOWNSAMPLE_METHOD")
        && let Ok(method) = v.parse::<Reduction>()
    {
        cfg.downsample_method = method.to_string();
    }
    if let Ok(v) = std::env::var("VOXMAP_ENABLE_COMPRESSION")
        && let Ok(enabled) = v.trim().parse::<bool>()
    {
        cfg.enable_compression = enabled;
    }
    if let Ok(v) = std::env::var("VOXMAP_EXPORT_PATH")
        && !v.trim().is_empty()
    {
        cfg.export_path = Some(PathBuf::from(v));
    }
}

/// Save the config to a specific path, creating its directory if necessary.
pub fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
    }
    let raw =
        toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Every test touching `VOXMAP_*` variables holds this lock, since the
    /// test harness runs tests on parallel threads.
    static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    fn env_guard() -> std::sync::MutexGuard<'static, ()> {
        ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    #[test]
    fn defaults_build_a_valid_pipeline_config() {
        let cfg = Config::default();
        let pipeline = cfg.pipeline_config().expect("defaults are valid");
        assert_eq!(pipeline.width, 640);
        assert_eq!(pipeline.height, 480);
        assert_eq!(pipeline.preprocess.reduction, Reduction::Min);
        assert!(pipeline.preprocess.block.is_identity());
        assert_eq!(pipeline.decay.amount, 40);
        assert!((pipeline.decay.half_extent - 10.0).abs() < 1e-12);
        assert_eq!(pipeline.recv_timeout, Some(Duration::from_millis(100)));
        assert!(cfg.map_definition().validate().is_ok());
        assert_eq!(cfg.grid_params().max_weight, 2000);
    }

    #[test]
    fn unknown_downsample_method_is_a_config_error() {
        let cfg = Config {
            downsample_method: "median".to_string(),
            ..Config::default()
        };
        assert!(matches!(cfg.pipeline_config(), Err(MapError::Config(_))));
    }

    #[test]
    fn zero_timeout_waits_until_woken() {
        let cfg = Config {
            recv_timeout_ms: 0,
            ..Config::default()
        };
        assert_eq!(cfg.pipeline_config().unwrap().recv_timeout, None);
    }

    #[test]
    fn save_to_creates_missing_config_directory() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(!path.parent().unwrap().exists());

        save_to(&Config::default(), &path).expect("save");
        assert!(path.is_file());
    }

    #[test]
    fn roundtrip_custom_config() {
        let _env = env_guard();
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        let cfg = Config {
            depth_max: 6.5,
            downsample_block_width: 4,
            downsample_block_height: 4,
            downsample_method: "mean".to_string(),
            decay_amount: 0,
            export_path: Some(PathBuf::from("/tmp/map.json")),
            ..Config::default()
        };
        save_to(&cfg, &path).expect("save");

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let _env = env_guard();
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "depth_max = 4.0\n").unwrap();

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert!((loaded.depth_max - 4.0).abs() < 1e-12);
        assert_eq!(loaded.map, Config::default().map);
        assert_eq!(loaded.downsample_method, "min");
    }

    #[test]
    fn malformed_file_reports_parse_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "depth_max = \"far\"\n").unwrap();

        let err = load_from(&path).unwrap_err();
        assert!(err.contains("Failed to parse config"), "got: {err}");
    }

    #[test]
    fn config_path_points_to_voxmap_dir() {
        let p = config_path_for_home("/home/testuser");
        assert!(p.to_string_lossy().contains(".voxmap"));
        assert!(p.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).expect("no error").is_none());
    }

    #[test]
    fn apply_env_overrides_changes_depth_range() {
        let _env = env_guard();
        // SAFETY: env access is serialised by ENV_LOCK.
        unsafe {
            std::env::set_var("VOXMAP_DEPTH_MIN", "0.3");
            std::env::set_var("VOXMAP_DEPTH_MAX", " 7.5 ");
        }
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert!((cfg.depth_min - 0.3).abs() < 1e-12);
        assert!((cfg.depth_max - 7.5).abs() < 1e-12);
        unsafe {
            std::env::remove_var("VOXMAP_DEPTH_MIN");
            std::env::remove_var("VOXMAP_DEPTH_MAX");
        }
    }

    #[test]
    fn apply_env_overrides_changes_method_and_compression() {
        let _env = env_guard();
        // SAFETY: env access is serialised by ENV_LOCK.
        unsafe {
            std::env::set_var("VOXMAP_DOWNSAMPLE_METHOD", "MAX");
            std::env::set_var("VOXMAP_ENABLE_COMPRESSION", "false");
            std::env::set_var("VOXMAP_EXPORT_PATH", "/var/tmp/voxmap.json");
        }
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.downsample_method, "max");
        assert!(!cfg.enable_compression);
        assert_eq!(cfg.export_path, Some(PathBuf::from("/var/tmp/voxmap.json")));
        unsafe {
            std::env::remove_var("VOXMAP_DOWNSAMPLE_METHOD");
            std::env::remove_var("VOXMAP_ENABLE_COMPRESSION");
            std::env::remove_var("VOXMAP_EXPORT_PATH");
        }
    }

    #[test]
    fn apply_env_overrides_ignores_invalid_values() {
        let _env = env_guard();
        // SAFETY: env access is serialised by ENV_LOCK.
        unsafe {
            std::env::set_var("VOXMAP_DEPTH_MAX", "far");
            std::env::set_var("VOXMAP_DOWNSAMPLE_METHOD", "median");
            std::env::set_var("VOXMAP_ENABLE_COMPRESSION", "sometimes");
        }
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg, Config::default());
        unsafe {
            std::env::remove_var("VOXMAP_DEPTH_MAX");
            std::env::remove_var("VOXMAP_DOWNSAMPLE_METHOD");
            std::env::remove_var("VOXMAP_ENABLE_COMPRESSION");
        }
    }
}
