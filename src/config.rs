use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::ai::ProcessingMode;
use crate::document::{DEFAULT_HEIGHT, DEFAULT_WIDTH};
use crate::error::ConfigError;

const SETTINGS_FILE: &str = "layerforge_settings.cfg";

#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    pub max_undo_steps: usize,
    pub max_undo_memory_mb: usize,
    pub default_width: u32,
    pub default_height: u32,
    pub parallel_compositing: bool,
    pub merge_brush_strokes: bool,
    pub ai_mode: ProcessingMode,
    pub ai_max_concurrent: usize,
    pub ai_timeout_secs: u64,
    pub default_font: String,
    /// Fallback tracing filter when `LAYERFORGE_LOG` is unset.
    pub log_level: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_undo_steps: 50,
            max_undo_memory_mb: 100,
            default_width: DEFAULT_WIDTH,
            default_height: DEFAULT_HEIGHT,
            parallel_compositing: true,
            merge_brush_strokes: false,
            ai_mode: ProcessingMode::Offline,
            ai_max_concurrent: 2,
            ai_timeout_secs: 30,
            default_font: "Arial".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Per-user directory for layerforge files, or `None` when the platform
/// gives no usable home.
/// On Linux:   $XDG_CONFIG_HOME/layerforge (or ~/.config/layerforge)
/// On Windows: %APPDATA%\Layerforge
/// On macOS:   ~/Library/Application Support/Layerforge
pub fn config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        let base = std::env::var("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .ok()
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("layerforge"))
    }
    #[cfg(target_os = "windows")]
    {
        let appdata = std::env::var("APPDATA").or_else(|_| std::env::var("USERPROFILE")).ok()?;
        Some(PathBuf::from(appdata).join("Layerforge"))
    }
    #[cfg(target_os = "macos")]
    {
        let home = std::env::var("HOME").ok()?;
        Some(
            PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("Layerforge"),
        )
    }
    #[cfg(not(any(target_os = "linux", target_os = "windows", target_os = "macos")))]
    {
        std::env::current_exe().ok().and_then(|p| p.parent().map(Path::to_path_buf))
    }
}

/// Directory for session logs. Linux keeps them under the XDG data dir;
/// other platforms share the config dir.
pub fn data_dir() -> Option<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        let base = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .ok()
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".local").join("share")))?;
        Some(base.join("layerforge"))
    }
    #[cfg(not(target_os = "linux"))]
    {
        config_dir()
    }
}

impl EngineSettings {
    pub fn settings_path() -> Option<PathBuf> {
        config_dir().map(|d| d.join(SETTINGS_FILE))
    }

    pub fn max_undo_memory_bytes(&self) -> usize {
        self.max_undo_memory_mb.saturating_mul(1024 * 1024)
    }

    /// Load from the platform settings file. Missing or unreadable files
    /// give defaults.
    pub fn load() -> Self {
        match Self::settings_path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        }
    }

    pub fn load_from(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => {
                debug!(path = %path.display(), "settings loaded");
                Self::parse(&content)
            }
            Err(_) => Self::default(),
        }
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        let path = Self::settings_path().ok_or(ConfigError::NoConfigDir)?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(path, self.to_config_string())?;
        debug!(path = %path.display(), "settings saved");
        Ok(())
    }

    pub fn to_config_string(&self) -> String {
        format!(
            "max_undo_steps={}\n\
             max_undo_memory_mb={}\n\
             default_width={}\n\
             default_height={}\n\
             parallel_compositing={}\n\
             merge_brush_strokes={}\n\
             ai_mode={}\n\
             ai_max_concurrent={}\n\
             ai_timeout_secs={}\n\
             default_font={}\n\
             log_level={}\n",
            self.max_undo_steps,
            self.max_undo_memory_mb,
            self.default_width,
            self.default_height,
            self.parallel_compositing,
            self.merge_brush_strokes,
            self.ai_mode.name(),
            self.ai_max_concurrent,
            self.ai_timeout_secs,
            self.default_font,
            self.log_level,
        )
    }

    /// Lenient parse: bad values keep their default and are logged.
    pub fn parse(content: &str) -> Self {
        let mut s = Self::default();
        for (line_no, line) in content.lines().enumerate() {
            if let Err(e) = s.apply_line(line_no + 1, line) {
                warn!(error = %e, "ignoring settings line");
            }
        }
        s
    }

    /// Strict parse: the first bad value is an error. Unknown keys are
    /// still ignored.
    pub fn try_parse(content: &str) -> Result<Self, ConfigError> {
        let mut s = Self::default();
        for (line_no, line) in content.lines().enumerate() {
            s.apply_line(line_no + 1, line)?;
        }
        Ok(s)
    }

    fn apply_line(&mut self, line_no: usize, line: &str) -> Result<(), ConfigError> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(());
        }
        let Some((key, val)) = line.split_once('=') else {
            return Ok(());
        };
        let key = key.trim();
        let val = val.trim();
        let bad = || ConfigError::Parse {
            line: line_no,
            key: key.to_string(),
            value: val.to_string(),
        };
        match key {
            "max_undo_steps" => self.max_undo_steps = val.parse().map_err(|_| bad())?,
            "max_undo_memory_mb" => self.max_undo_memory_mb = val.parse().map_err(|_| bad())?,
            "default_width" => self.default_width = parse_dimension(val).ok_or_else(bad)?,
            "default_height" => self.default_height = parse_dimension(val).ok_or_else(bad)?,
            "parallel_compositing" => self.parallel_compositing = parse_bool(val).ok_or_else(bad)?,
            "merge_brush_strokes" => self.merge_brush_strokes = parse_bool(val).ok_or_else(bad)?,
            "ai_mode" => self.ai_mode = ProcessingMode::from_name(val).ok_or_else(bad)?,
            "ai_max_concurrent" => {
                self.ai_max_concurrent = val.parse::<usize>().ok().filter(|n| *n > 0).ok_or_else(bad)?
            }
            "ai_timeout_secs" => self.ai_timeout_secs = val.parse().map_err(|_| bad())?,
            "default_font" if !val.is_empty() => self.default_font = val.to_string(),
            "log_level" if !val.is_empty() => self.log_level = val.to_string(),
            _ => {}
        }
        Ok(())
    }
}

fn parse_bool(val: &str) -> Option<bool> {
    match val {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

fn parse_dimension(val: &str) -> Option<u32> {
    val.parse::<u32>().ok().filter(|v| (1..=32768).contains(v))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn written_settings_parse_back() {
        let settings = EngineSettings {
            max_undo_steps: 12,
            merge_brush_strokes: true,
            ai_mode: ProcessingMode::Hybrid,
            default_font: "DejaVu Sans".to_string(),
            ..EngineSettings::default()
        };
        assert_eq!(EngineSettings::parse(&settings.to_config_string()), settings);
    }

    #[test]
    fn bad_values_keep_defaults() {
        let s = EngineSettings::parse("max_undo_steps=lots\ndefault_width=0\nai_mode=cloud\nmystery=1\ndefault_height=720");
        assert_eq!(s.max_undo_steps, 50);
        assert_eq!(s.default_width, 800);
        assert_eq!(s.ai_mode, ProcessingMode::Offline);
        assert_eq!(s.default_height, 720);
    }

    #[test]
    fn strict_parse_reports_line() {
        let err = EngineSettings::try_parse("# comment\nparallel_compositing=maybe").unwrap_err();
        match err {
            ConfigError::Parse { line, key, value } => {
                assert_eq!(line, 2);
                assert_eq!(key, "parallel_compositing");
                assert_eq!(value, "maybe");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(EngineSettings::try_parse("unknown_key=whatever").is_ok());
    }

    #[test]
    fn save_and_load_file() {
        let dir = std::env::temp_dir().join(format!("layerforge-cfg-{}", uuid::Uuid::new_v4()));
        let path = dir.join(SETTINGS_FILE);
        let settings = EngineSettings {
            ai_max_concurrent: 4,
            log_level: "debug".to_string(),
            ..EngineSettings::default()
        };
        settings.save_to(&path).unwrap();
        assert_eq!(EngineSettings::load_from(&path), settings);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_file_gives_defaults() {
        let path = std::env::temp_dir().join("layerforge-no-such-dir").join(SETTINGS_FILE);
        assert_eq!(EngineSettings::load_from(&path), EngineSettings::default());
    }

    #[test]
    fn memory_limit_in_bytes() {
        assert_eq!(EngineSettings::default().max_undo_memory_bytes(), 100 * 1024 * 1024);
    }
}
