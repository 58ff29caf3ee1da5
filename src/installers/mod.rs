use crate::engine::Platform;
use crate::error::{Error, Result};
use crate::util::fs::set_executable;
use crate::util::xdg;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

mod release;

pub use release::{
    binary_name, compute_sha256, extract_archive, format_digest, parse_checksums,
    resolve_binary_path, verify_signature, ReleaseArtifacts, ReleaseClient, DEFAULT_BASE_URL,
};

/// Public key looked up in the config directory when no key path is configured.
pub const SIGNING_KEY_FILE_NAME: &str = "hashicorp.asc";

/// Key used to check the signature on a release's SHA256SUMS.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum SigningKey {
    /// `$XDG_CONFIG_HOME/tfws/hashicorp.asc`
    #[default]
    Default,
    File(PathBuf),
    /// Trust the SHA256SUMS digest alone.
    Skip,
}

impl SigningKey {
    /// Key file to verify with, or `None` when verification is turned off.
    fn resolve(&self) -> Result<Option<PathBuf>> {
        let path = match self {
            Self::Skip => return Ok(None),
            Self::File(path) => path.clone(),
            Self::Default => xdg::config_dir()?.join(SIGNING_KEY_FILE_NAME),
        };
        if !path.is_file() {
            return Err(Error::transfer(format!(
                "release signing key {} not found; configure release.signing_key \
                 or set release.verify_signature = false",
                path.display()
            )));
        }
        Ok(Some(path))
    }
}

/// Where a tool binary comes from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InstallSource {
    /// Published release archives, signature checked against `signing_key`.
    Release {
        base_url: String,
        signing_key: SigningKey,
    },
    /// A binary already present on the host.
    Local(PathBuf),
}

impl Default for InstallSource {
    fn default() -> Self {
        Self::Release {
            base_url: DEFAULT_BASE_URL.to_string(),
            signing_key: SigningKey::Default,
        }
    }
}

pub trait ToolInstaller: Send + Sync {
    /// Host path of a verified executable for `platform`.
    fn install(&self, platform: &Platform) -> Result<PathBuf>;
}

pub(crate) struct ReleaseInstaller {
    tool: String,
    version: String,
    signing_key: SigningKey,
    downloads_dir: PathBuf,
    client: ReleaseClient,
}

impl ReleaseInstaller {
    fn new(
        tool: &str,
        version: &str,
        base_url: &str,
        signing_key: SigningKey,
        cache_dir: &Path,
    ) -> Result<Self> {
        Ok(Self {
            tool: tool.to_string(),
            version: version.to_string(),
            signing_key,
            downloads_dir: cache_dir.join("downloads"),
            client: ReleaseClient::new(base_url)?,
        })
    }

    fn target_dir(&self, platform: &Platform) -> PathBuf {
        self.downloads_dir
            .join(sanitize_component(&self.tool))
            .join(sanitize_component(&self.version))
            .join(sanitize_component(&format!(
                "{}_{}",
                platform.os(),
                platform.arch()
            )))
    }

    fn fetch(&self, platform: &Platform, staging: &Path) -> Result<PathBuf> {
        let artifacts = ReleaseArtifacts::new(&self.tool, &self.version, platform);
        let signing_key = self.signing_key.resolve()?;

        let sums_path = staging.join(&artifacts.checksums);
        self.client
            .download(&self.version, &artifacts.checksums, &sums_path)?;

        match &signing_key {
            Some(key) => {
                let signature_path = staging.join(&artifacts.signature);
                self.client
                    .download(&self.version, &artifacts.signature, &signature_path)?;
                verify_signature(key, &signature_path, &sums_path, &staging.join("gnupg"))?;
            }
            None => warn!(
                tool = %self.tool,
                version = %self.version,
                "signature verification disabled; trusting SHA256SUMS as downloaded"
            ),
        }

        let sums = fs::read_to_string(&sums_path).map_err(|err| Error::io(&sums_path, err))?;
        let expected = parse_checksums(&sums, &artifacts.archive)?;

        let archive_path = staging.join(&artifacts.archive);
        let actual = self
            .client
            .download(&self.version, &artifacts.archive, &archive_path)?;
        if actual != expected {
            return Err(Error::transfer(format!(
                "checksum mismatch for {}: expected {}, got {}",
                artifacts.archive,
                format_digest(&expected),
                format_digest(&actual)
            )));
        }

        let extract_dir = staging.join("extract");
        fs::create_dir_all(&extract_dir).map_err(|err| Error::io(&extract_dir, err))?;
        extract_archive(&archive_path, &extract_dir)?;
        resolve_binary_path(&extract_dir, &binary_name(&self.tool, platform))
    }
}

impl ToolInstaller for ReleaseInstaller {
    fn install(&self, platform: &Platform) -> Result<PathBuf> {
        let target_dir = self.target_dir(platform);
        let target = target_dir.join(binary_name(&self.tool, platform));
        if target.is_file() {
            debug!(path = ?target, "using cached binary");
            return Ok(target);
        }

        info!(tool = %self.tool, version = %self.version, platform = %platform, "installing");

        let staging = target_dir.with_extension("partial");
        crate::util::fs::remove_path(&staging)?;
        fs::create_dir_all(&staging).map_err(|err| Error::io(&staging, err))?;

        let result = self.fetch(platform, &staging).and_then(|binary| {
            fs::create_dir_all(&target_dir).map_err(|err| Error::io(&target_dir, err))?;
            fs::copy(&binary, &target).map_err(|err| Error::io(&target, err))?;
            set_executable(&target)
        });

        if let Err(err) = crate::util::fs::remove_path(&staging) {
            debug!(error = %err, "failed to remove staging directory");
        }
        result?;

        Ok(target)
    }
}

pub(crate) struct LocalInstaller {
    path: PathBuf,
}

impl ToolInstaller for LocalInstaller {
    fn install(&self, _platform: &Platform) -> Result<PathBuf> {
        if !self.path.is_file() {
            return Err(Error::NotFound {
                path: self.path.display().to_string(),
            });
        }
        Ok(self.path.clone())
    }
}

pub fn create_installer(
    tool: &str,
    version: &str,
    source: &InstallSource,
    cache_dir: &Path,
) -> Result<Box<dyn ToolInstaller>> {
    match source {
        InstallSource::Release {
            base_url,
            signing_key,
        } => Ok(Box::new(ReleaseInstaller::new(
            tool,
            version,
            base_url,
            signing_key.clone(),
            cache_dir,
        )?)),
        InstallSource::Local(path) => Ok(Box::new(LocalInstaller { path: path.clone() })),
    }
}

pub(crate) fn sanitize_component(value: &str) -> String {
    let mut result = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '-' | '_' => result.push(ch),
            _ => result.push('-'),
        }
    }

    if result.trim_matches('-').is_empty() {
        "default".to_string()
    } else {
        result
    }
}
