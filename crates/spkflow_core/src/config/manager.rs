//! Loading and saving `spkflow.toml`.
//!
//! Writes go to a temp file in the same directory which is then renamed
//! over the config, so a crash never leaves a half-written file. Section
//! updates edit the on-disk document with `toml_edit`, keeping the user's
//! comments in the other sections.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use thiserror::Error;
use toml_edit::{DocumentMut, Item, Table};

use super::settings::{ConfigSection, Settings};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to {operation} {path}: {source}")]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid settings in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Config is not valid TOML: {0}")]
    Syntax(#[from] toml_edit::TomlError),

    #[error("Failed to serialize settings: {0}")]
    Serialize(#[from] toml::ser::Error),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

const HEADER: &str =
    "# spkflow configuration\n# Generated file; comments inside a section survive section updates.\n";

/// Differences between a config file and the settings it parses to.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConfigReport {
    /// Tables the crate does not know about.
    pub unknown_sections: Vec<String>,
    /// `section.key` entries that were filled from defaults.
    pub defaulted_keys: Vec<String>,
}

impl ConfigReport {
    pub fn is_clean(&self) -> bool {
        self.unknown_sections.is_empty() && self.defaulted_keys.is_empty()
    }
}

/// Loads and persists [`Settings`].
pub struct ConfigManager {
    config_path: PathBuf,
    settings: Settings,
}

impl ConfigManager {
    /// Nothing is read until `load()` or `load_or_create()`.
    pub fn new(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
            settings: Settings::default(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Changes stay in memory until `save()` or `update_section()`.
    pub fn settings_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn into_settings(self) -> Settings {
        self.settings
    }

    /// Load an existing file; missing keys take their defaults.
    pub fn load(&mut self) -> ConfigResult<ConfigReport> {
        if !self.config_path.exists() {
            return Err(ConfigError::NotFound(self.config_path.clone()));
        }
        let content = self.read()?;
        let (settings, report) = parse_and_check(&self.config_path, &content)?;
        self.settings = settings;
        Ok(report)
    }

    /// Load the file, or create it with defaults.
    ///
    /// A file with defaulted keys or unknown sections is rewritten in full
    /// so it lists every option.
    pub fn load_or_create(&mut self) -> ConfigResult<ConfigReport> {
        if !self.config_path.exists() {
            self.settings = Settings::default();
            self.save()?;
            return Ok(ConfigReport::default());
        }

        let report = self.load()?;
        if !report.is_clean() {
            for section in &report.unknown_sections {
                tracing::warn!("Dropping unknown config section [{}]", section);
            }
            tracing::debug!(
                "Rewriting {} ({} keys defaulted)",
                self.config_path.display(),
                report.defaulted_keys.len()
            );
            self.save()?;
        }
        Ok(report)
    }

    /// Write every section, each preceded by its description.
    pub fn save(&self) -> ConfigResult<()> {
        let mut doc = render_sections(&self.settings)?;
        for section in ConfigSection::ALL {
            let name = section.table_name();
            ensure_section(&mut doc, name);
            if let Some(table) = doc.get_mut(name).and_then(Item::as_table_mut) {
                table
                    .decor_mut()
                    .set_prefix(format!("\n# {}\n", section.description()));
            }
        }
        self.write_atomic(&format!("{}{}", HEADER, doc))
    }

    /// Replace the values of one table in the on-disk document, keeping its
    /// place and the comment above it.
    pub fn update_section(&mut self, section: ConfigSection) -> ConfigResult<()> {
        let mut doc = if self.config_path.exists() {
            self.read()?.parse::<DocumentMut>()?
        } else {
            DocumentMut::new()
        };

        let name = section.table_name();
        let fresh = section_table(&render_sections(&self.settings)?, name);
        ensure_section(&mut doc, name);
        if let Some(target) = doc.get_mut(name).and_then(Item::as_table_mut) {
            target.clear();
            for (key, item) in fresh.iter() {
                target.insert(key, item.clone());
            }
        }

        self.write_atomic(&doc.to_string())
    }

    fn read(&self) -> ConfigResult<String> {
        fs::read_to_string(&self.config_path).map_err(|source| ConfigError::Io {
            operation: "read",
            path: self.config_path.clone(),
            source,
        })
    }

    fn write_atomic(&self, content: &str) -> ConfigResult<()> {
        let io_err = |operation| {
            let path = self.config_path.clone();
            move |source| ConfigError::Io {
                operation,
                path,
                source,
            }
        };

        let dir = match self.config_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir).map_err(io_err("create directory for"))?;

        let mut staged = NamedTempFile::new_in(&dir).map_err(io_err("stage"))?;
        staged
            .write_all(content.as_bytes())
            .and_then(|_| staged.as_file().sync_all())
            .map_err(io_err("write"))?;
        staged
            .persist(&self.config_path)
            .map_err(|e| io_err("replace")(e.error))?;
        Ok(())
    }
}

/// Settings rendered as a TOML document, one table per section.
fn render_sections(settings: &Settings) -> ConfigResult<DocumentMut> {
    Ok(toml::to_string_pretty(settings)?.parse()?)
}

/// Make `name` an explicit table of `doc`. Sections whose options are all
/// unset do not render at all.
fn ensure_section(doc: &mut DocumentMut, name: &str) {
    match doc.get_mut(name) {
        Some(Item::Table(table)) => table.set_implicit(false),
        _ => {
            doc.insert(name, Item::Table(Table::new()));
        }
    }
}

/// A copy of table `name` in `doc`, empty when absent.
fn section_table(doc: &DocumentMut, name: &str) -> Table {
    doc.get(name)
        .and_then(Item::as_table)
        .cloned()
        .unwrap_or_default()
}

/// Parse `content` and list what differs from what `save()` would write.
fn parse_and_check(path: &Path, content: &str) -> ConfigResult<(Settings, ConfigReport)> {
    let doc: DocumentMut = content.parse()?;
    let settings: Settings = toml::from_str(content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    let mut report = ConfigReport::default();
    for (key, _) in doc.iter() {
        if !ConfigSection::ALL.iter().any(|s| s.table_name() == key) {
            report.unknown_sections.push(key.to_string());
        }
    }

    let rendered = render_sections(&settings)?;
    for section in ConfigSection::ALL {
        let name = section.table_name();
        let have = doc.get(name).and_then(Item::as_table);
        for (key, _) in section_table(&rendered, name).iter() {
            if !have.is_some_and(|t| t.contains_key(key)) {
                report.defaulted_keys.push(format!("{}.{}", name, key));
            }
        }
    }

    Ok((settings, report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn load_or_create_writes_every_section() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join(".config").join("spkflow.toml");

        let mut manager = ConfigManager::new(&config_path);
        let report = manager.load_or_create().unwrap();
        assert!(report.is_clean());

        let content = fs::read_to_string(&config_path).unwrap();
        for section in ConfigSection::ALL {
            assert!(content.contains(&format!("[{}]", section.table_name())));
        }
        assert!(content.contains("# Diagonal-covariance UBM training"));

        let reparsed: Settings = toml::from_str(&content).unwrap();
        assert_eq!(reparsed, Settings::default());
    }

    #[test]
    fn existing_values_survive_and_gaps_are_filled() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("spkflow.toml");
        fs::write(
            &config_path,
            "[toolkit]\nbin_dir = \"/opt/kaldi/bin\"\n\n[mono]\nnum_iters = 10\n",
        )
        .unwrap();

        let mut manager = ConfigManager::new(&config_path);
        let report = manager.load_or_create().unwrap();

        assert_eq!(
            manager.settings().toolkit.bin_dir,
            Some(PathBuf::from("/opt/kaldi/bin"))
        );
        assert_eq!(manager.settings().mono.num_iters, 10);
        assert!(report.defaulted_keys.contains(&"mono.beam".to_string()));
        assert!(report.defaulted_keys.contains(&"plda.smoothing".to_string()));
        assert!(!report.defaulted_keys.contains(&"mono.num_iters".to_string()));

        let content = fs::read_to_string(&config_path).unwrap();
        assert!(content.contains("[plda]"));
        assert!(content.contains("/opt/kaldi/bin"));

        let again = ConfigManager::new(&config_path).load().unwrap();
        assert!(again.is_clean());
    }

    #[test]
    fn load_requires_file() {
        let dir = tempdir().unwrap();
        let mut manager = ConfigManager::new(dir.path().join("absent.toml"));
        assert!(matches!(manager.load(), Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn bad_values_name_the_file() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("spkflow.toml");
        fs::write(&config_path, "[diag_ubm]\nnum_gauss = \"many\"\n").unwrap();

        let err = ConfigManager::new(&config_path).load().unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("spkflow.toml"));
    }

    #[test]
    fn update_section_only_changes_target() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("spkflow.toml");

        let mut manager = ConfigManager::new(&config_path);
        manager.load_or_create().unwrap();
        let with_note = fs::read_to_string(&config_path)
            .unwrap()
            .replace("[vad]\n", "[vad]\n# tuned for telephone speech\n");
        fs::write(&config_path, with_note).unwrap();

        manager.settings_mut().logging.compact = false;
        manager.settings_mut().diag_ubm.num_gauss = 8;
        manager.update_section(ConfigSection::Logging).unwrap();

        let content = fs::read_to_string(&config_path).unwrap();
        assert!(content.contains("compact = false"));
        assert!(content.contains("# tuned for telephone speech"));
        assert!(content.contains("# Logging configuration"));

        let on_disk: Settings = toml::from_str(&content).unwrap();
        assert_eq!(on_disk.diag_ubm.num_gauss, 2048);
        assert!(!on_disk.logging.compact);
    }

    #[test]
    fn no_staging_files_are_left_behind() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("spkflow.toml");

        let mut manager = ConfigManager::new(&config_path);
        manager.load_or_create().unwrap();
        manager.update_section(ConfigSection::Plda).unwrap();

        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn unknown_sections_are_reported() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("spkflow.toml");
        let mut manager = ConfigManager::new(&config_path);
        manager.load_or_create().unwrap();
        let full = fs::read_to_string(&config_path).unwrap();

        let (_, report) = parse_and_check(&config_path, &full).unwrap();
        assert!(report.is_clean());

        let extended = format!("{}\n[paths]\nx = 1\n", full);
        let (_, report) = parse_and_check(&config_path, &extended).unwrap();
        assert_eq!(report.unknown_sections, vec!["paths".to_string()]);
    }
}
