//! Safe-bin configuration layers.
//!
//! A layer is the JSON object found in either the global gateway config or a
//! per-agent profile:
//!
//! ```json
//! {
//!   "safeBins": ["jq", "myfilter"],
//!   "safeBinProfiles": { "myfilter": { "deniedFlags": ["--file"], "maxPositional": 0 } },
//!   "safeBinTrustedDirs": ["/opt/tools/bin"]
//! }
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConfigError;

/// Restrictions declared for one safe bin.
///
/// An empty profile (`{}`) trusts the binary unconditionally, which is
/// different from having no entry at all.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SafeBinProfileConfig {
    /// Flags that make an invocation unsafe.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub denied_flags: Option<Vec<String>>,

    /// Maximum number of positional arguments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_positional: Option<usize>,
}

impl SafeBinProfileConfig {
    /// Creates a profile with the given denied flags.
    #[must_use]
    pub fn with_denied_flags<I, S>(mut self, flags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.denied_flags = Some(flags.into_iter().map(Into::into).collect());
        self
    }

    /// Sets the positional argument limit.
    #[must_use]
    pub fn with_max_positional(mut self, max: usize) -> Self {
        self.max_positional = Some(max);
        self
    }
}

/// One safe-bin configuration layer (global or per-agent).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SafeBinConfigLayer {
    /// Binaries allowed to run without approval.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safe_bins: Option<Vec<String>>,

    /// Per-binary restrictions keyed by binary name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safe_bin_profiles: Option<BTreeMap<String, SafeBinProfileConfig>>,

    /// Extra directories trusted to contain safe bins.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safe_bin_trusted_dirs: Option<Vec<String>>,
}

impl SafeBinConfigLayer {
    /// Sets the safe-bin list.
    #[must_use]
    pub fn with_safe_bins<I, S>(mut self, bins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.safe_bins = Some(bins.into_iter().map(Into::into).collect());
        self
    }

    /// Adds a profile for `bin`.
    #[must_use]
    pub fn with_profile(mut self, bin: impl Into<String>, profile: SafeBinProfileConfig) -> Self {
        self.safe_bin_profiles
            .get_or_insert_with(BTreeMap::new)
            .insert(bin.into(), profile);
        self
    }

    /// Adds an extra trusted directory.
    #[must_use]
    pub fn with_trusted_dir(mut self, dir: impl Into<String>) -> Self {
        self.safe_bin_trusted_dirs
            .get_or_insert_with(Vec::new)
            .push(dir.into());
        self
    }

    /// Parses a layer from JSON text.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Parse` if the text is not a valid layer.
    pub fn from_json(source: &Path, text: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(text).map_err(|e| ConfigError::Parse {
            path: source.to_path_buf(),
            source: e,
        })
    }

    /// Loads a layer from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Read` if the file cannot be read and
    /// `ConfigError::Parse` if it is not a valid layer.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            context: format!("reading {}", path.display()),
            source: e,
        })?;
        let layer = Self::from_json(path, &content)?;
        debug!(path = %path.display(), "Loaded safe-bin config layer");
        Ok(layer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_camel_case_layer() {
        let layer = SafeBinConfigLayer::from_json(
            Path::new("inline"),
            r#"{
                "safeBins": ["jq", "myfilter"],
                "safeBinProfiles": {
                    "myfilter": {"deniedFlags": ["--file"], "maxPositional": 0},
                    "jq": {}
                },
                "safeBinTrustedDirs": ["/opt/tools/bin"]
            }"#,
        )
        .expect("valid layer");

        assert_eq!(
            layer.safe_bins.as_deref(),
            Some(&["jq".to_string(), "myfilter".to_string()][..])
        );
        let profiles = layer.safe_bin_profiles.expect("profiles");
        assert_eq!(profiles["jq"], SafeBinProfileConfig::default());
        assert_eq!(profiles["myfilter"].max_positional, Some(0));
        assert_eq!(layer.safe_bin_trusted_dirs.expect("trusted dirs"), vec!["/opt/tools/bin"]);
    }

    #[test]
    fn test_empty_object_is_empty_layer() {
        let layer = SafeBinConfigLayer::from_json(Path::new("inline"), "{}").expect("empty layer");
        assert_eq!(layer, SafeBinConfigLayer::default());
    }

    #[test]
    fn test_load_missing_and_invalid_files() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let missing = SafeBinConfigLayer::load(&tmp.path().join("nope.json"));
        assert!(matches!(missing, Err(ConfigError::Read { .. })));

        let bad = tmp.path().join("bad.json");
        std::fs::write(&bad, r#"{"safeBins": "jq"}"#).expect("write bad layer");
        assert!(matches!(SafeBinConfigLayer::load(&bad), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_round_trip_through_file() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let layer = SafeBinConfigLayer::default()
            .with_safe_bins(["myfilter"])
            .with_profile("myfilter", SafeBinProfileConfig::default().with_max_positional(1))
            .with_trusted_dir("/opt/tools/bin");
        let path = tmp.path().join("layer.json");
        let json = serde_json::to_string_pretty(&layer).expect("serialize layer");
        std::fs::write(&path, json).expect("write layer");
        assert_eq!(SafeBinConfigLayer::load(&path).expect("load layer"), layer);
    }
}
