//! Engine configuration (`stanza.toml`).
//!
//! | Key | Default | Meaning |
//! |-----|---------|---------|
//! | `tag_prefix` | `"c"` | prefix that marks library tags, `<c:if>` |
//! | `default_extension` | `"tpl"` | appended to template URIs without one |
//! | `strip_comments` | `true` | drop `<!-- … -->` before scanning for tags |
//! | `strict` | `false` | unresolved names raise instead of yielding null |
//! | `template_root` | none | directory the file loader reads from |
//! | `max_include_depth` | `32` | nested `include` limit |
//! | `cache_templates` | `true` | keep built templates per URI |
//!
//! Lookup order for [`EngineConfig::discover`]: `$STANZA_CONFIG`,
//! `./stanza.toml`, then `stanza.toml` in the platform config directory.
//! Missing files fall back to the defaults.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const CONFIG_ENV: &str = "STANZA_CONFIG";
pub const CONFIG_FILE: &str = "stanza.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("invalid config {path}: {source}")]
    Parse { path: PathBuf, source: toml::de::Error },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub tag_prefix: String,
    pub default_extension: String,
    pub strip_comments: bool,
    pub strict: bool,
    pub template_root: Option<PathBuf>,
    pub max_include_depth: usize,
    pub cache_templates: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            tag_prefix: "c".into(),
            default_extension: "tpl".into(),
            strip_comments: true,
            strict: false,
            template_root: None,
            max_include_depth: 32,
            cache_templates: true,
        }
    }
}

impl EngineConfig {
    pub fn from_toml(text: &str, path: &Path) -> Result<Self, ConfigError> {
        let config: EngineConfig =
            toml::from_str(text).map_err(|source| ConfigError::Parse { path: path.to_owned(), source })?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text =
            std::fs::read_to_string(path).map_err(|source| ConfigError::Read { path: path.to_owned(), source })?;
        let mut config = Self::from_toml(&text, path)?;
        // A relative root is relative to the file that names it.
        if let (Some(root), Some(dir)) = (&config.template_root, path.parent()) {
            if root.is_relative() {
                config.template_root = Some(dir.join(root));
            }
        }
        debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    /// The first config file found, or the defaults.
    pub fn discover() -> Result<Self, ConfigError> {
        match Self::candidates().into_iter().find(|p| p.is_file()) {
            Some(path) => Self::load(&path),
            None => {
                debug!("no config file, using defaults");
                Ok(Self::default())
            }
        }
    }

    fn candidates() -> Vec<PathBuf> {
        let mut out = Vec::new();
        if let Some(p) = std::env::var_os(CONFIG_ENV) {
            out.push(PathBuf::from(p));
        }
        out.push(PathBuf::from(CONFIG_FILE));
        if let Some(dirs) = ProjectDirs::from("", "", "stanza") {
            out.push(dirs.config_dir().join(CONFIG_FILE));
        }
        out
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let prefix_ok = !self.tag_prefix.is_empty()
            && self.tag_prefix.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !prefix_ok {
            return Err(ConfigError::Invalid(format!("bad tag_prefix '{}'", self.tag_prefix)));
        }
        if self.default_extension.contains(['/', '.']) {
            return Err(ConfigError::Invalid(format!(
                "default_extension must be a bare extension, got '{}'",
                self.default_extension
            )));
        }
        if self.max_include_depth == 0 {
            return Err(ConfigError::Invalid("max_include_depth must be at least 1".into()));
        }
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let c = EngineConfig::from_toml("tag_prefix = \"t\"\nstrict = true\n", Path::new("x.toml")).unwrap();
        assert_eq!(c.tag_prefix, "t");
        assert!(c.strict);
        assert_eq!(c.default_extension, "tpl");
        assert_eq!(c.max_include_depth, 32);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = EngineConfig::from_toml("prefix = \"t\"", Path::new("x.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn bad_values_are_rejected() {
        for text in ["tag_prefix = \"a b\"", "default_extension = \".tpl\"", "max_include_depth = 0"] {
            let err = EngineConfig::from_toml(text, Path::new("x.toml")).unwrap_err();
            assert!(matches!(err, ConfigError::Invalid(_)), "{text}: {err}");
        }
    }

    #[test]
    fn load_resolves_relative_root() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "template_root = \"pages\"\ncache_templates = false\n").unwrap();
        let c = EngineConfig::load(&path).unwrap();
        assert_eq!(c.template_root, Some(dir.path().join("pages")));
        assert!(!c.cache_templates);
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = EngineConfig::load(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
