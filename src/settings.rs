//! Configuration management for OpenNEB.
//!
//! Program defaults can be changed through INI-format configuration files
//! without touching the command line every time. Files are applied in the
//! following order, later files overriding earlier ones key by key:
//!
//! 1. Built-in defaults
//! 2. System configuration (`/etc/openneb/openneb_config.cfg`)
//! 3. User configuration (`~/.config/openneb/openneb_config.cfg`)
//! 4. Local configuration (`./openneb_config.cfg`)
//!
//! # Configuration File Format
//!
//! ```ini
//! [general]
//! default_model = lj
//! print_level = 1
//!
//! [logging]
//! level = info
//!
//! [neb]
//! spring_constant = 0.1
//! fmax = 0.05
//! max_steps = 1000
//! optimizer = bfgs
//! interpolation = idpp
//!
//! [similarity]
//! energy = 0.02
//! displacement = 0.5
//!
//! [restart]
//! grace_period_secs = 10
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use openneb::settings::SettingsManager;
//!
//! let settings = SettingsManager::load()?;
//! println!("default spring constant: {}", settings.neb().spring_constant);
//! # Ok::<(), openneb::settings::SettingsError>(())
//! ```

use crate::checkpoint::Interpolation;
use crate::endpoint::SimilarityThresholds;
use crate::optimizer::OptimizerKind;
use configparser::ini::Ini;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Name of the configuration file at every level.
pub const CONFIG_FILE_NAME: &str = "openneb_config.cfg";

/// Errors that can occur during configuration loading and processing.
#[derive(Error, Debug)]
pub enum SettingsError {
    /// I/O error when reading configuration files
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// INI parsing error
    #[error("INI parsing error: {0}")]
    IniParse(String),
    /// Invalid configuration value
    #[error("Invalid value for [{section}] {key}: {value}")]
    InvalidValue {
        /// INI section
        section: String,
        /// Key within the section
        key: String,
        /// Raw value
        value: String,
    },
}

/// Result type for settings operations
pub type Result<T> = std::result::Result<T, SettingsError>;

/// All program settings.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Settings {
    /// General program settings
    pub general: GeneralSettings,
    /// Logging configuration
    pub logging: LoggingSettings,
    /// Default band parameters
    pub neb: NebSettings,
    /// Endpoint similarity thresholds
    pub similarity: SimilarityThresholds,
    /// Restart behaviour
    pub restart: RestartSettings,
}

/// General program settings.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneralSettings {
    /// Potential used when `--model` is not given (default: "lj")
    pub default_model: String,
    /// 0 = quiet, 1 = print the resolved parameters before a run
    pub print_level: u32,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            default_model: "lj".to_string(),
            print_level: 0,
        }
    }
}

/// Logging configuration settings.
#[derive(Debug, Clone, PartialEq)]
pub struct LoggingSettings {
    /// Log level: error, warn, info, debug or trace (default: "info")
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl LoggingSettings {
    /// Parsed log level, falling back to Info for unknown names.
    pub fn level_filter(&self) -> log::LevelFilter {
        log::LevelFilter::from_str(&self.level).unwrap_or(log::LevelFilter::Info)
    }
}

/// Defaults for band construction and relaxation.
#[derive(Debug, Clone, PartialEq)]
pub struct NebSettings {
    /// Spring constant (eV/Å²)
    pub spring_constant: f64,
    /// Convergence threshold (eV/Å)
    pub fmax: f64,
    /// Step budget
    pub max_steps: usize,
    /// Optimizer for band and endpoint relaxations
    pub optimizer: OptimizerKind,
    /// Initial path guess
    pub interpolation: Interpolation,
    /// IDPP force threshold
    pub interp_fmax: f64,
    /// IDPP step budget
    pub interp_steps: usize,
    /// Band fmax at which the climbing image switches on
    pub climb_activation_fmax: f64,
}

impl Default for NebSettings {
    fn default() -> Self {
        Self {
            spring_constant: 0.1,
            fmax: 0.05,
            max_steps: 1000,
            optimizer: OptimizerKind::Bfgs,
            interpolation: Interpolation::Idpp,
            interp_fmax: 0.1,
            interp_steps: 1000,
            climb_activation_fmax: 0.5,
        }
    }
}

/// Restart behaviour.
#[derive(Debug, Clone, PartialEq)]
pub struct RestartSettings {
    /// Pause before loading a trajectory with dangling frames
    pub grace_period: Duration,
}

impl Default for RestartSettings {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(10),
        }
    }
}

/// Configuration manager that handles loading and accessing program settings.
pub struct SettingsManager {
    settings: Settings,
    config_source: String,
}

impl SettingsManager {
    /// Loads configuration from the system, user and local files, in that
    /// order. Missing files are skipped; a file that fails to parse is
    /// reported and skipped.
    pub fn load() -> Result<Self> {
        let mut paths = Vec::new();
        paths.extend(Self::get_system_config_path());
        paths.extend(Self::get_user_config_path());
        paths.push(PathBuf::from(CONFIG_FILE_NAME));
        let manager = Self::load_from_paths(&paths)?;
        info!("Configuration loaded from: {}", manager.config_source);
        Ok(manager)
    }

    /// Applies every existing file in `paths` on top of the defaults, in order.
    pub fn load_from_paths(paths: &[PathBuf]) -> Result<Self> {
        let mut settings = Settings::default();
        let mut config_source = "built-in defaults".to_string();
        for path in paths {
            if !path.exists() {
                continue;
            }
            match Self::apply_file(&mut settings, path) {
                Ok(()) => {
                    config_source = path.display().to_string();
                    debug!("Loaded configuration from: {}", path.display());
                }
                Err(e) => {
                    warn!("Failed to load config from {}: {}", path.display(), e);
                }
            }
        }
        Ok(Self {
            settings,
            config_source,
        })
    }

    /// Returns the last file that contributed, or "built-in defaults".
    pub fn config_source(&self) -> &str {
        &self.config_source
    }

    /// Gets a reference to the settings.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Gets the general settings.
    pub fn general(&self) -> &GeneralSettings {
        &self.settings.general
    }

    /// Gets the logging settings.
    pub fn logging(&self) -> &LoggingSettings {
        &self.settings.logging
    }

    /// Gets the band defaults.
    pub fn neb(&self) -> &NebSettings {
        &self.settings.neb
    }

    /// Gets the similarity thresholds.
    pub fn similarity(&self) -> &SimilarityThresholds {
        &self.settings.similarity
    }

    /// Gets the restart settings.
    pub fn restart(&self) -> &RestartSettings {
        &self.settings.restart
    }

    /// Applies one INI file on top of `settings`. The file is parsed and
    /// validated completely before anything is changed.
    fn apply_file(settings: &mut Settings, path: &Path) -> Result<()> {
        let content = fs::read_to_string(path)?;
        let mut ini = Ini::new();
        let map = ini
            .read(content)
            .map_err(|e| SettingsError::IniParse(format!("Failed to parse INI: {}", e)))?;

        let mut updated = settings.clone();
        if let Some(section) = map.get("general") {
            Self::parse_general(&mut updated.general, section)?;
        }
        if let Some(section) = map.get("logging") {
            if let Some(Some(level)) = section.get("level") {
                updated.logging.level = level.clone();
            }
        }
        if let Some(section) = map.get("neb") {
            Self::parse_neb(&mut updated.neb, section)?;
        }
        if let Some(section) = map.get("similarity") {
            if let Some(v) = parse_value(section, "similarity", "energy")? {
                updated.similarity.energy = v;
            }
            if let Some(v) = parse_value(section, "similarity", "displacement")? {
                updated.similarity.displacement = v;
            }
        }
        if let Some(section) = map.get("restart") {
            if let Some(secs) = parse_value::<u64>(section, "restart", "grace_period_secs")? {
                updated.restart.grace_period = Duration::from_secs(secs);
            }
        }
        *settings = updated;
        Ok(())
    }

    fn parse_general(general: &mut GeneralSettings, section: &HashMap<String, Option<String>>) -> Result<()> {
        if let Some(Some(model)) = section.get("default_model") {
            general.default_model = model.clone();
        }
        if let Some(level) = parse_value(section, "general", "print_level")? {
            general.print_level = level;
        }
        Ok(())
    }

    fn parse_neb(neb: &mut NebSettings, section: &HashMap<String, Option<String>>) -> Result<()> {
        if let Some(v) = parse_value(section, "neb", "spring_constant")? {
            neb.spring_constant = v;
        }
        if let Some(v) = parse_value(section, "neb", "fmax")? {
            neb.fmax = v;
        }
        if let Some(v) = parse_value(section, "neb", "max_steps")? {
            neb.max_steps = v;
        }
        if let Some(v) = parse_value(section, "neb", "optimizer")? {
            neb.optimizer = v;
        }
        if let Some(v) = parse_value(section, "neb", "interpolation")? {
            neb.interpolation = v;
        }
        if let Some(v) = parse_value(section, "neb", "interp_fmax")? {
            neb.interp_fmax = v;
        }
        if let Some(v) = parse_value(section, "neb", "interp_steps")? {
            neb.interp_steps = v;
        }
        if let Some(v) = parse_value(section, "neb", "climb_activation_fmax")? {
            neb.climb_activation_fmax = v;
        }
        Ok(())
    }

    /// Gets the system configuration file path.
    fn get_system_config_path() -> Option<PathBuf> {
        #[cfg(unix)]
        {
            Some(PathBuf::from("/etc/openneb").join(CONFIG_FILE_NAME))
        }
        #[cfg(windows)]
        {
            std::env::var("PROGRAMDATA")
                .ok()
                .map(|pd| PathBuf::from(pd).join("openneb").join(CONFIG_FILE_NAME))
        }
    }

    /// Gets the user configuration file path.
    fn get_user_config_path() -> Option<PathBuf> {
        #[cfg(unix)]
        {
            std::env::var("HOME")
                .ok()
                .map(|home| PathBuf::from(home).join(".config").join("openneb").join(CONFIG_FILE_NAME))
        }
        #[cfg(windows)]
        {
            std::env::var("APPDATA")
                .ok()
                .map(|appdata| PathBuf::from(appdata).join("openneb").join(CONFIG_FILE_NAME))
        }
    }

    /// Writes a commented configuration file listing every option with its
    /// default value.
    pub fn create_template(path: &Path) -> Result<()> {
        fs::write(path, Self::generate_template_content())?;
        info!("Created settings template at: {}", path.display());
        Ok(())
    }

    fn generate_template_content() -> String {
        let general = GeneralSettings::default();
        let logging = LoggingSettings::default();
        let neb = NebSettings::default();
        let similarity = SimilarityThresholds::default();
        let restart = RestartSettings::default();
        format!(
            r#"# OpenNEB Configuration File
#
# Files are applied in this order, later ones overriding earlier ones:
#
# 1. Built-in defaults
# 2. /etc/openneb/openneb_config.cfg
# 3. ~/.config/openneb/openneb_config.cfg
# 4. ./openneb_config.cfg
#
# Missing sections or keys keep the values shown below.

[general]
# Potential used when --model is not given: lj, morse, external:<command>
default_model = {}

# 0 = quiet, 1 = print the resolved run parameters before starting
print_level = {}

[logging]
# error, warn, info, debug, trace (RUST_LOG still wins when set)
level = {}

[neb]
# Spring constant in eV/A^2
spring_constant = {}

# Force convergence threshold in eV/A
fmax = {}

# Step budget for band and endpoint relaxations
max_steps = {}

# fire, bfgs, lbfgs, mdmin
optimizer = {}

# linear or idpp
interpolation = {}

# IDPP refinement threshold and step budget
interp_fmax = {}
interp_steps = {}

# Band fmax at which the climbing image switches on
climb_activation_fmax = {}

[similarity]
# Endpoints closer than either threshold are reported as a likely
# degenerate path (energy in eV, largest atomic displacement in A)
energy = {}
displacement = {}

[restart]
# Seconds to wait before loading a trajectory with dangling frames
grace_period_secs = {}
"#,
            general.default_model,
            general.print_level,
            logging.level,
            neb.spring_constant,
            neb.fmax,
            neb.max_steps,
            neb.optimizer,
            neb.interpolation,
            neb.interp_fmax,
            neb.interp_steps,
            neb.climb_activation_fmax,
            similarity.energy,
            similarity.displacement,
            restart.grace_period.as_secs(),
        )
    }
}

fn parse_value<T: FromStr>(section: &HashMap<String, Option<String>>, name: &str, key: &str) -> Result<Option<T>> {
    match section.get(key) {
        Some(Some(raw)) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| SettingsError::InvalidValue {
                section: name.to_string(),
                key: key.to_string(),
                value: raw.clone(),
            }),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_without_files() {
        let manager = SettingsManager::load_from_paths(&[PathBuf::from("/nonexistent/openneb.cfg")]).unwrap();
        assert_eq!(manager.config_source(), "built-in defaults");
        assert_eq!(manager.settings(), &Settings::default());
        assert_eq!(manager.restart().grace_period, Duration::from_secs(10));
    }

    #[test]
    fn test_later_files_override_earlier_ones() {
        let tmp = TempDir::new().unwrap();
        let user = tmp.path().join("user.cfg");
        let local = tmp.path().join("local.cfg");
        fs::write(&user, "[neb]\nspring_constant = 0.5\noptimizer = fire\n[similarity]\nenergy = 0.1\n").unwrap();
        fs::write(&local, "[neb]\nspring_constant = 0.2\n[restart]\ngrace_period_secs = 0\n").unwrap();

        let manager = SettingsManager::load_from_paths(&[user, local.clone()]).unwrap();
        assert_eq!(manager.neb().spring_constant, 0.2);
        assert_eq!(manager.neb().optimizer, OptimizerKind::Fire);
        assert_eq!(manager.similarity().energy, 0.1);
        assert_eq!(manager.similarity().displacement, 0.5);
        assert_eq!(manager.restart().grace_period, Duration::ZERO);
        assert_eq!(manager.config_source(), local.display().to_string());
    }

    #[test]
    fn test_invalid_file_is_skipped_whole() {
        let tmp = TempDir::new().unwrap();
        let bad = tmp.path().join("bad.cfg");
        fs::write(&bad, "[neb]\nfmax = 0.01\noptimizer = newton\n").unwrap();
        let manager = SettingsManager::load_from_paths(&[bad]).unwrap();
        assert_eq!(manager.neb(), &NebSettings::default());
    }

    #[test]
    fn test_template_round_trips_to_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(CONFIG_FILE_NAME);
        SettingsManager::create_template(&path).unwrap();
        let manager = SettingsManager::load_from_paths(&[path]).unwrap();
        assert_eq!(manager.settings(), &Settings::default());
    }

    #[test]
    fn test_level_filter_falls_back_to_info() {
        let logging = LoggingSettings {
            level: "chatty".to_string(),
        };
        assert_eq!(logging.level_filter(), log::LevelFilter::Info);
        let logging = LoggingSettings {
            level: "debug".to_string(),
        };
        assert_eq!(logging.level_filter(), log::LevelFilter::Debug);
    }
}
