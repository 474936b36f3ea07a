//! Configuration management.
//!
//! `spkflow.toml` has one table per concern: `[toolkit]`, `[logging]`, and
//! one table of options per procedure family. Missing keys take their
//! defaults on load and are reported in a [`ConfigReport`].
//!
//! # Example
//!
//! ```no_run
//! use spkflow_core::config::{ConfigManager, ConfigSection};
//!
//! let mut config = ConfigManager::new(".config/spkflow.toml");
//! let report = config.load_or_create()?;
//! for key in &report.defaulted_keys {
//!     println!("using default for {}", key);
//! }
//!
//! config.settings_mut().diag_ubm.num_gauss = 512;
//! config.update_section(ConfigSection::DiagUbm)?;
//! # Ok::<(), spkflow_core::config::ConfigError>(())
//! ```

mod manager;
mod settings;

pub use manager::{ConfigError, ConfigManager, ConfigReport, ConfigResult};
pub use settings::{ConfigSection, LoggingSettings, Settings, ToolkitSettings};
