use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, IoResultExt, Result};

/// storage variant selected at repository creation; immutable thereafter.
///
/// `archive-z2` and `archive` are accepted as synonyms on read (§9 open
/// question: the original treats them identically in the write path and
/// only differs in legacy config files) but always written back as
/// `archive-z2`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RepoMode {
    Archive,
    Bare,
    BareUser,
    BareUserOnly,
}

impl RepoMode {
    pub fn as_config_str(&self) -> &'static str {
        match self {
            RepoMode::Archive => "archive-z2",
            RepoMode::Bare => "bare",
            RepoMode::BareUser => "bare-user",
            RepoMode::BareUserOnly => "bare-user-only",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "archive" | "archive-z2" => Ok(RepoMode::Archive),
            "bare" => Ok(RepoMode::Bare),
            "bare-user" => Ok(RepoMode::BareUser),
            "bare-user-only" => Ok(RepoMode::BareUserOnly),
            other => Err(Error::InvalidArgument(format!("unknown core.mode: {other}"))),
        }
    }
}

/// `core.min-free-space-percent` / `core.min-free-space-size`; mutually
/// exclusive per §4.3.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum FreeSpacePolicy {
    #[default]
    None,
    Percent(u8),
    Bytes(u64),
}

impl FreeSpacePolicy {
    fn parse_size(s: &str) -> Result<u64> {
        let s = s.trim();
        let (digits, mult) = if let Some(d) = s.strip_suffix("GB") {
            (d, 1024 * 1024 * 1024)
        } else if let Some(d) = s.strip_suffix("MB") {
            (d, 1024 * 1024)
        } else if let Some(d) = s.strip_suffix("KB") {
            (d, 1024)
        } else {
            (s, 1)
        };
        let n: u64 = digits
            .trim()
            .parse()
            .map_err(|_| Error::InvalidArgument(format!("invalid size: {s}")))?;
        Ok(n * mult)
    }
}

/// per-repository config, the typed form of the on-disk `config` file
/// (§6's on-disk layout table).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RepoConfig {
    pub core: CoreConfig,
    #[serde(rename = "remote", default, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub remotes: std::collections::BTreeMap<String, RemoteConfig>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CoreConfig {
    pub mode: String,
    #[serde(rename = "repo-version", default = "default_repo_version")]
    pub repo_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(rename = "min-free-space-percent", default, skip_serializing_if = "Option::is_none")]
    pub min_free_space_percent: Option<u8>,
    #[serde(rename = "min-free-space-size", default, skip_serializing_if = "Option::is_none")]
    pub min_free_space_size: Option<String>,
    #[serde(default = "default_true")]
    pub fsync: bool,
    #[serde(rename = "collection-id", default, skip_serializing_if = "Option::is_none")]
    pub collection_id: Option<String>,
    #[serde(rename = "tmp-expiry-seconds", default = "default_tmp_expiry")]
    pub tmp_expiry_seconds: u64,
    #[serde(rename = "zlib-level", default = "default_zlib_level")]
    pub zlib_level: u32,
}

fn default_repo_version() -> u32 {
    1
}

fn default_zlib_level() -> u32 {
    6
}

fn default_true() -> bool {
    true
}

fn default_tmp_expiry() -> u64 {
    86400
}

impl CoreConfig {
    pub fn mode(&self) -> Result<RepoMode> {
        RepoMode::parse(&self.mode)
    }

    pub fn free_space_policy(&self) -> Result<FreeSpacePolicy> {
        match (self.min_free_space_percent, &self.min_free_space_size) {
            (Some(_), Some(_)) => Err(Error::InvalidArgument(
                "min-free-space-percent and min-free-space-size are mutually exclusive".into(),
            )),
            (Some(p), None) => {
                if p > 99 {
                    return Err(Error::InvalidArgument(format!(
                        "min-free-space-percent out of range 0-99: {p}"
                    )));
                }
                Ok(FreeSpacePolicy::Percent(p))
            }
            (None, Some(s)) => Ok(FreeSpacePolicy::Bytes(FreeSpacePolicy::parse_size(s)?)),
            (None, None) => Ok(FreeSpacePolicy::None),
        }
    }
}

/// `[remote "<name>"]` section: a candidate source repository and its
/// verification policy (§4.6, §6).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub url: String,
    #[serde(rename = "collection-id", default, skip_serializing_if = "Option::is_none")]
    pub collection_id: Option<String>,
    #[serde(rename = "gpg-verify", default)]
    pub gpg_verify: bool,
    #[serde(rename = "sign-verify", default, skip_serializing_if = "Option::is_none")]
    pub sign_verify: Option<SignVerifyOption>,
    #[serde(rename = "sign-verify-summary", default, skip_serializing_if = "Option::is_none")]
    pub sign_verify_summary: Option<SignVerifyOption>,
    /// `verification-<algo>-key` / `verification-<algo>-file`, algorithm name -> source.
    #[serde(default, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub verification_keys: std::collections::BTreeMap<String, KeySource>,
}

/// either "verify with every algorithm that has configured keys" (`true`)
/// or an explicit list of required algorithm names.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SignVerifyOption {
    Enabled(bool),
    Algorithms(Vec<String>),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeySource {
    InlineKey(String),
    KeyFile(String),
}

impl RepoConfig {
    pub fn new(mode: RepoMode) -> Self {
        Self {
            core: CoreConfig {
                mode: mode.as_config_str().to_string(),
                repo_version: default_repo_version(),
                parent: None,
                min_free_space_percent: None,
                min_free_space_size: None,
                fsync: true,
                collection_id: None,
                tmp_expiry_seconds: default_tmp_expiry(),
                zlib_level: default_zlib_level(),
            },
            remotes: Default::default(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).with_path(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// merges any `remotes.d/<name>.conf` drop-ins found alongside the
    /// primary config, each contributing one `[remote]` section that
    /// overrides an inline one of the same name.
    pub fn load_with_dropins(path: &Path, remotes_d: &Path) -> Result<Self> {
        let mut config = Self::load(path)?;
        if remotes_d.is_dir() {
            let mut entries: Vec<_> = std::fs::read_dir(remotes_d)
                .with_path(remotes_d)?
                .filter_map(|e| e.ok())
                .collect();
            entries.sort_by_key(|e| e.file_name());
            for entry in entries {
                let p = entry.path();
                if p.extension().and_then(|e| e.to_str()) != Some("conf") {
                    continue;
                }
                let name = p
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .ok_or_else(|| Error::InvalidArgument(format!("bad drop-in filename: {p:?}")))?
                    .to_string();
                let content = std::fs::read_to_string(&p).with_path(&p)?;
                let remote: RemoteConfig = toml::from_str(&content)?;
                config.remotes.insert(name, remote);
            }
        }
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).with_path(path)?;
        Ok(())
    }

    pub fn add_remote(&mut self, name: impl Into<String>, remote: RemoteConfig) -> Result<()> {
        let name = name.into();
        if self.remotes.contains_key(&name) {
            return Err(Error::AlreadyExists(format!("remote '{name}' already exists")));
        }
        self.remotes.insert(name, remote);
        Ok(())
    }

    pub fn remove_remote(&mut self, name: &str) -> Result<()> {
        self.remotes
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("remote '{name}'")))
    }

    pub fn get_remote(&self, name: &str) -> Option<&RemoteConfig> {
        self.remotes.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_roundtrip() {
        let mut config = RepoConfig::new(RepoMode::Archive);
        config
            .add_remote(
                "origin",
                RemoteConfig {
                    url: "https://example.invalid/repo".into(),
                    collection_id: Some("org.example.Repo".into()),
                    gpg_verify: true,
                    ..Default::default()
                },
            )
            .unwrap();

        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: RepoConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.core.mode().unwrap(), RepoMode::Archive);
        assert_eq!(parsed.get_remote("origin").unwrap().url, "https://example.invalid/repo");
    }

    #[test]
    fn mode_parses_archive_synonyms() {
        assert_eq!(RepoMode::parse("archive").unwrap(), RepoMode::Archive);
        assert_eq!(RepoMode::parse("archive-z2").unwrap(), RepoMode::Archive);
    }

    #[test]
    fn mode_rejects_unknown() {
        assert!(RepoMode::parse("weird").is_err());
    }

    #[test]
    fn free_space_percent_and_size_are_exclusive() {
        let core = CoreConfig {
            mode: "bare".into(),
            repo_version: 1,
            parent: None,
            min_free_space_percent: Some(5),
            min_free_space_size: Some("100MB".into()),
            fsync: true,
            collection_id: None,
            tmp_expiry_seconds: 86400,
            zlib_level: 6,
        };
        assert!(core.free_space_policy().is_err());
    }

    #[test]
    fn free_space_size_suffix_parses() {
        let core = CoreConfig {
            mode: "bare".into(),
            repo_version: 1,
            parent: None,
            min_free_space_percent: None,
            min_free_space_size: Some("10MB".into()),
            fsync: true,
            collection_id: None,
            tmp_expiry_seconds: 86400,
            zlib_level: 6,
        };
        assert_eq!(core.free_space_policy().unwrap(), FreeSpacePolicy::Bytes(10 * 1024 * 1024));
    }

    #[test]
    fn free_space_percent_out_of_range_rejected() {
        let core = CoreConfig {
            mode: "bare".into(),
            repo_version: 1,
            parent: None,
            min_free_space_percent: Some(100),
            min_free_space_size: None,
            fsync: true,
            collection_id: None,
            tmp_expiry_seconds: 86400,
            zlib_level: 6,
        };
        assert!(core.free_space_policy().is_err());
    }

    #[test]
    fn add_remove_remote() {
        let mut config = RepoConfig::new(RepoMode::Bare);
        config
            .add_remote("a", RemoteConfig { url: "u".into(), ..Default::default() })
            .unwrap();
        assert!(config.add_remote("a", RemoteConfig::default()).is_err());
        config.remove_remote("a").unwrap();
        assert!(config.remove_remote("a").is_err());
    }
}
