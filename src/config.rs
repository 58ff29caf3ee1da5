use crate::engine::{CacheSharing, Secret};
use crate::installers::{InstallSource, SigningKey, DEFAULT_BASE_URL};
use crate::terraform::Terraform;
use crate::util::xdg;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE_NAME: &str = "config.toml";

/// User configuration, read from `$XDG_CONFIG_HOME/tfws/config.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Terraform version used when the source has no `.terraform-version`.
    pub version: Option<String>,
    /// Installation prefix inside the container (`/usr/local`).
    pub prefix: Option<String>,
    pub plugin_cache_sharing: CacheSharing,
    pub release: ReleaseConfig,
    /// Variables set on every Terraform container.
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReleaseConfig {
    pub base_url: String,
    /// Armored public key for SHA256SUMS signatures; defaults to
    /// `$XDG_CONFIG_HOME/tfws/hashicorp.asc`.
    pub signing_key: Option<String>,
    pub verify_signature: bool,
    /// Preinstalled binary used instead of downloading releases.
    pub binary: Option<String>,
}

impl Default for ReleaseConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            signing_key: None,
            verify_signature: true,
            binary: None,
        }
    }
}

impl Config {
    pub fn default_path() -> Result<PathBuf> {
        Ok(xdg::config_dir()?.join(CONFIG_FILE_NAME))
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        toml::from_str(&contents).with_context(|| format!("Failed to parse config file {:?}", path))
    }

    pub fn install_source(&self) -> Result<InstallSource> {
        if let Some(binary) = &self.release.binary {
            return Ok(InstallSource::Local(expand_path(binary)?));
        }

        let signing_key = match (&self.release.signing_key, self.release.verify_signature) {
            (_, false) => SigningKey::Skip,
            (Some(path), true) => SigningKey::File(expand_path(path)?),
            (None, true) => SigningKey::Default,
        };
        Ok(InstallSource::Release {
            base_url: self.release.base_url.clone(),
            signing_key,
        })
    }

    /// Terraform settings described by this configuration; downloads are cached in `cache_dir`.
    pub fn terraform(&self, cache_dir: &Path) -> Result<Terraform> {
        let mut terraform = Terraform::new(cache_dir)
            .with_cache_sharing(self.plugin_cache_sharing)
            .with_install_source(self.install_source()?);

        if let Some(version) = &self.version {
            terraform = terraform.with_version(version);
        }
        if let Some(prefix) = &self.prefix {
            terraform = terraform.with_prefix(prefix);
        }
        for (name, value) in &self.env {
            terraform = terraform.with_env_variable(name, value);
        }

        Ok(terraform)
    }
}

/// Secret `name` holding the value of host variable `variable`.
pub fn secret_from_binding(name: &str, variable: &str) -> Result<Secret> {
    Secret::from_env(name, variable).with_context(|| format!("Failed to read secret {name}"))
}

fn expand_path(value: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(value)
        .map_err(|err| anyhow::anyhow!("Failed to expand path '{}': {}", value, err))?;
    Ok(PathBuf::from(expanded.as_ref()))
}
