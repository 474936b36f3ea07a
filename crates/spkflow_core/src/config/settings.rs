//! The contents of `spkflow.toml`, one struct per table.
//!
//! Procedure sections are the procedures' own option structs, so a
//! `Settings` value doubles as the default option set for every call.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::logging::{LogConfig, LogLevel};
use crate::procedures::dnn::NnetOptions;
use crate::procedures::features::{CepstralOptions, VadOptions};
use crate::procedures::gmm::{DiagUbmOptions, FullUbmOptions};
use crate::procedures::hmm::MonoOptions;
use crate::procedures::ivector::IvectorOptions;
use crate::procedures::plda::PldaOptions;

/// Everything a procedure run can be configured with.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Where the external programs live and where scratch files go.
    #[serde(default)]
    pub toolkit: ToolkitSettings,

    /// Run-log behaviour.
    #[serde(default)]
    pub logging: LoggingSettings,

    #[serde(default)]
    pub diag_ubm: DiagUbmOptions,

    #[serde(default)]
    pub full_ubm: FullUbmOptions,

    #[serde(default)]
    pub ivector: IvectorOptions,

    #[serde(default)]
    pub plda: PldaOptions,

    #[serde(default)]
    pub mono: MonoOptions,

    /// Cepstral feature extraction.
    #[serde(default)]
    pub features: CepstralOptions,

    /// Neural network forward pass.
    #[serde(default)]
    pub nnet: NnetOptions,

    /// Energy-based voice activity detection.
    #[serde(default)]
    pub vad: VadOptions,
}

/// External toolkit location and scratch space.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolkitSettings {
    /// Directory holding the toolkit binaries. Bare program names resolve
    /// through `PATH` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bin_dir: Option<PathBuf>,

    /// Root for per-call scratch directories. System temp dir when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_root: Option<PathBuf>,

    /// Caller-level timeout for one procedure call, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_timeout_secs: Option<u64>,
}

impl ToolkitSettings {
    pub fn timeout(&self) -> Option<Duration> {
        self.stage_timeout_secs.map(Duration::from_secs)
    }
}

/// `[logging]`: how run logs are written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Minimum level written to run logs.
    #[serde(default)]
    pub level: LogLevel,

    /// Keep successful stage diagnostics out of the log.
    #[serde(default = "default_true")]
    pub compact: bool,

    /// Number of diagnostic lines kept for failure reports.
    #[serde(default = "default_error_tail")]
    pub error_tail: u32,

    /// In compact mode, only progress crossing a multiple of this is logged.
    #[serde(default = "default_progress_step")]
    pub progress_step: u32,

    /// Log each stage's argument vector as JSON.
    #[serde(default)]
    pub show_commands_json: bool,

    /// Write one log file per procedure call into this folder.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

fn default_error_tail() -> u32 {
    20
}

fn default_progress_step() -> u32 {
    20
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            compact: true,
            error_tail: default_error_tail(),
            progress_step: default_progress_step(),
            show_commands_json: false,
            log_dir: None,
        }
    }
}

impl LoggingSettings {
    /// Run-log configuration for these settings.
    pub fn to_log_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            compact: self.compact,
            progress_step: self.progress_step,
            error_tail: self.error_tail as usize,
            show_timestamps: true,
            show_commands_json: self.show_commands_json,
        }
    }
}

/// Configuration sections for targeted updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSection {
    Toolkit,
    Logging,
    DiagUbm,
    FullUbm,
    Ivector,
    Plda,
    Mono,
    Features,
    Nnet,
    Vad,
}

impl ConfigSection {
    /// Every section, in file order.
    pub const ALL: [ConfigSection; 10] = [
        ConfigSection::Toolkit,
        ConfigSection::Logging,
        ConfigSection::DiagUbm,
        ConfigSection::FullUbm,
        ConfigSection::Ivector,
        ConfigSection::Plda,
        ConfigSection::Mono,
        ConfigSection::Features,
        ConfigSection::Nnet,
        ConfigSection::Vad,
    ];

    /// Table name in `spkflow.toml`.
    pub fn table_name(&self) -> &'static str {
        match self {
            ConfigSection::Toolkit => "toolkit",
            ConfigSection::Logging => "logging",
            ConfigSection::DiagUbm => "diag_ubm",
            ConfigSection::FullUbm => "full_ubm",
            ConfigSection::Ivector => "ivector",
            ConfigSection::Plda => "plda",
            ConfigSection::Mono => "mono",
            ConfigSection::Features => "features",
            ConfigSection::Nnet => "nnet",
            ConfigSection::Vad => "vad",
        }
    }

    /// Comment written above the section in generated files.
    pub fn description(&self) -> &'static str {
        match self {
            ConfigSection::Toolkit => "External toolkit location and scratch space",
            ConfigSection::Logging => "Logging configuration",
            ConfigSection::DiagUbm => "Diagonal-covariance UBM training",
            ConfigSection::FullUbm => "Full-covariance UBM training",
            ConfigSection::Ivector => "I-vector extractor training and extraction",
            ConfigSection::Plda => "PLDA scoring",
            ConfigSection::Mono => "Monophone HMM training",
            ConfigSection::Features => "Cepstral feature extraction",
            ConfigSection::Nnet => "Neural network forward pass",
            ConfigSection::Vad => "Energy-based voice activity detection",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_serializes() {
        let settings = Settings::default();
        let toml = toml::to_string_pretty(&settings).unwrap();
        assert!(toml.contains("[logging]"));
        assert!(toml.contains("[diag_ubm]"));
        assert!(toml.contains("num_gauss"));
    }

    #[test]
    fn settings_round_trip() {
        let settings = Settings::default();
        let toml = toml::to_string_pretty(&settings).unwrap();
        let parsed: Settings = toml::from_str(&toml).unwrap();
        assert_eq!(parsed.logging.compact, settings.logging.compact);
        assert_eq!(parsed.diag_ubm.num_gauss, settings.diag_ubm.num_gauss);
        assert_eq!(parsed.mono.num_iters, settings.mono.num_iters);
    }

    #[test]
    fn missing_fields_use_defaults() {
        let minimal = "[toolkit]\nbin_dir = \"/opt/kaldi/bin\"\n[diag_ubm]\nnum_gauss = 64\n";
        let parsed: Settings = toml::from_str(minimal).unwrap();
        assert_eq!(parsed.toolkit.bin_dir, Some(PathBuf::from("/opt/kaldi/bin")));
        assert_eq!(parsed.diag_ubm.num_gauss, 64);
        assert_eq!(parsed.diag_ubm.num_iters, 4);
        assert!(parsed.logging.compact);
        assert_eq!(parsed.ivector.ivector_dim, 600);
    }

    #[test]
    fn timeout_converts_to_duration() {
        let toolkit = ToolkitSettings {
            stage_timeout_secs: Some(90),
            ..Default::default()
        };
        assert_eq!(toolkit.timeout(), Some(Duration::from_secs(90)));
        assert_eq!(ToolkitSettings::default().timeout(), None);
    }

    #[test]
    fn table_names_are_unique() {
        let mut names: Vec<_> = ConfigSection::ALL.iter().map(|s| s.table_name()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), ConfigSection::ALL.len());
    }
}
