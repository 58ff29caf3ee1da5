//! Execution capability consumed by workspaces and installers.
//!
//! Every value here is immutable: builders on [`Container`] return a new
//! value, and engines hand out fresh [`Directory`] snapshots instead of
//! modifying existing ones.

use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

mod changeset;
mod local;

pub use changeset::{Change, ChangeKind, Changeset};
pub use local::LocalEngine;

/// Target operating system and architecture, e.g. `linux/amd64`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Platform {
    os: String,
    arch: String,
}

impl Platform {
    pub fn new(os: impl Into<String>, arch: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            arch: arch.into(),
        }
    }

    /// Platform of the running process, using release naming (`darwin`, `amd64`).
    pub fn host() -> Self {
        let os = match std::env::consts::OS {
            "macos" => "darwin",
            other => other,
        };
        let arch = match std::env::consts::ARCH {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            "x86" => "386",
            other => other,
        };
        Self::new(os, arch)
    }

    pub fn os(&self) -> &str {
        &self.os
    }

    pub fn arch(&self) -> &str {
        &self.arch
    }
}

impl FromStr for Platform {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        let mut parts = value.trim().split('/');
        match (parts.next(), parts.next()) {
            (Some(os), Some(arch)) if !os.is_empty() && !arch.is_empty() => {
                Ok(Self::new(os, arch))
            }
            _ => Err(Error::configuration(format!(
                "invalid platform '{value}', expected <os>/<arch>"
            ))),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.arch)
    }
}

/// Immutable directory snapshot owned by an engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directory {
    root: PathBuf,
}

impl Directory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }
}

/// Immutable file snapshot owned by an engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct File {
    path: PathBuf,
}

impl File {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contents(&self) -> Result<Vec<u8>> {
        std::fs::read(&self.path).map_err(|err| Error::io(&self.path, err))
    }

    /// Hex encoded SHA-256 of the file contents.
    pub fn digest(&self) -> Result<String> {
        let digest = crate::installers::compute_sha256(&self.path)?;
        Ok(crate::installers::format_digest(&digest))
    }
}

/// Secret value bound to an environment variable at execution time.
///
/// The value never shows up in `Debug` output or captured command output.
#[derive(Clone)]
pub struct Secret {
    name: String,
    value: String,
}

impl Secret {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Read a secret from a host environment variable.
    pub fn from_env(name: impl Into<String>, variable: &str) -> Result<Self> {
        let value = std::env::var(variable).map_err(|_| {
            Error::configuration(format!("environment variable {variable} is not set"))
        })?;
        Ok(Self::new(name, value))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn plaintext(&self) -> &str {
        &self.value
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secret")
            .field("name", &self.name)
            .field("value", &"***")
            .finish()
    }
}

/// Persistent cache shared across containers, keyed by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheVolume {
    key: String,
}

impl CacheVolume {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

/// How concurrent executions share a cache volume.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheSharing {
    #[default]
    Shared,
    Private,
    Locked,
}

#[derive(Debug, Clone)]
pub enum Mount {
    Directory(Directory),
    File(File),
    Cache {
        volume: CacheVolume,
        sharing: CacheSharing,
    },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ExecOptions {
    /// Prefix the arguments with the container entrypoint.
    pub use_entrypoint: bool,
}

impl ExecOptions {
    pub fn entrypoint() -> Self {
        Self {
            use_entrypoint: true,
        }
    }
}

/// Outcome of one command run inside a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRecord {
    /// Full argument vector, entrypoint included.
    pub command: Vec<String>,
    pub stdout: String,
    pub stderr: String,
    /// Interleaved stdout and stderr in arrival order.
    pub combined: String,
    pub exit_code: i32,
}

impl ExecRecord {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Result of [`Engine::exec`]. A non-zero exit is reported in `record`, not as an error.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub container: Container,
    pub record: ExecRecord,
}

/// Execution environment value: filesystem, entrypoint, variables and mounts.
#[derive(Debug, Clone)]
pub struct Container {
    platform: Platform,
    rootfs: Directory,
    workdir: String,
    entrypoint: Vec<String>,
    env: BTreeMap<String, String>,
    secrets: BTreeMap<String, Secret>,
    mounts: BTreeMap<String, Mount>,
    overlays: Vec<(String, Directory)>,
    last_exec: Option<ExecRecord>,
}

impl Container {
    pub fn new(platform: Platform, rootfs: Directory, workdir: &str) -> Self {
        Self {
            platform,
            rootfs,
            workdir: join_path("/", workdir),
            entrypoint: Vec::new(),
            env: BTreeMap::new(),
            secrets: BTreeMap::new(),
            mounts: BTreeMap::new(),
            overlays: Vec::new(),
            last_exec: None,
        }
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    pub fn rootfs(&self) -> &Directory {
        &self.rootfs
    }

    pub fn workdir(&self) -> &str {
        &self.workdir
    }

    pub fn entrypoint(&self) -> &[String] {
        &self.entrypoint
    }

    pub fn env_variable(&self, name: &str) -> Option<&str> {
        self.env.get(name).map(String::as_str)
    }

    pub fn env_variables(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn secret_variables(&self) -> impl Iterator<Item = &Secret> {
        self.secrets.values()
    }

    /// Mounts keyed by absolute container path.
    pub fn mounts(&self) -> &BTreeMap<String, Mount> {
        &self.mounts
    }

    /// Directories to copy onto the filesystem before the next command, in order.
    pub fn overlays(&self) -> &[(String, Directory)] {
        &self.overlays
    }

    pub fn last_exec(&self) -> Option<&ExecRecord> {
        self.last_exec.as_ref()
    }

    /// Interleaved output of the last command run in this container.
    pub fn combined_output(&self) -> Option<&str> {
        self.last_exec.as_ref().map(|record| record.combined.as_str())
    }

    /// Resolve `path` against the working directory.
    pub fn resolve(&self, path: &str) -> String {
        join_path(&self.workdir, path)
    }

    pub fn with_workdir(mut self, path: &str) -> Self {
        self.workdir = self.resolve(path);
        self
    }

    pub fn with_entrypoint<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entrypoint = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env_variable(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(name.into(), value.into());
        self
    }

    pub fn with_secret_variable(mut self, secret: Secret) -> Self {
        self.secrets.insert(secret.name.clone(), secret);
        self
    }

    /// Copy `directory` onto the filesystem at `path`.
    pub fn with_directory(mut self, path: &str, directory: Directory) -> Self {
        let path = self.resolve(path);
        self.overlays.push((path, directory));
        self
    }

    pub fn with_mounted_directory(mut self, path: &str, directory: Directory) -> Self {
        let path = self.resolve(path);
        self.mounts.insert(path, Mount::Directory(directory));
        self
    }

    pub fn with_mounted_file(mut self, path: &str, file: File) -> Self {
        let path = self.resolve(path);
        self.mounts.insert(path, Mount::File(file));
        self
    }

    pub fn with_mounted_cache(
        mut self,
        path: &str,
        volume: CacheVolume,
        sharing: CacheSharing,
    ) -> Self {
        let path = self.resolve(path);
        self.mounts.insert(path, Mount::Cache { volume, sharing });
        self
    }

    /// Container after a command ran: `rootfs` holds the materialized filesystem,
    /// so pending overlays and directory/file mounts are dropped. Cache mounts stay.
    pub fn with_exec_result(&self, rootfs: Directory, record: ExecRecord) -> Self {
        let mut next = self.clone();
        next.rootfs = rootfs;
        next.overlays.clear();
        next.mounts
            .retain(|_, mount| matches!(mount, Mount::Cache { .. }));
        next.last_exec = Some(record);
        next
    }
}

/// Join a container path onto `base` and normalize it to an absolute path.
pub fn join_path(base: &str, path: &str) -> String {
    let combined = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{base}/{path}")
    };

    let mut parts: Vec<&str> = Vec::new();
    for part in combined.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    format!("/{}", parts.join("/"))
}

/// Root-relative ignore patterns: `name` matches a path exactly, `name/` only directories.
pub fn is_ignored(relative: &str, is_dir: bool, patterns: &[&str]) -> bool {
    patterns.iter().any(|pattern| {
        let dir_only = pattern.ends_with('/');
        let pattern = pattern.trim_end_matches('/');
        (!dir_only || is_dir) && relative == pattern
    })
}

/// Capability interface to the build engine.
///
/// Implementations own the storage behind [`Directory`] and [`File`] values and
/// must keep them alive at least as long as the engine itself.
pub trait Engine: Send + Sync {
    /// Default platform for containers and downloads.
    fn platform(&self) -> Result<Platform>;

    /// Empty base container for `platform` (engine default when `None`).
    fn container(&self, platform: Option<&Platform>) -> Result<Container>;

    /// New empty directory.
    fn scratch(&self) -> Result<Directory>;

    /// Snapshot a host directory, leaving out root-relative `ignore` patterns.
    fn host_directory(&self, path: &Path, ignore: &[&str]) -> Result<Directory>;

    fn host_file(&self, path: &Path) -> Result<File>;

    /// Copy of `directory` with `file` placed at relative `path`.
    fn with_file(&self, directory: &Directory, path: &str, file: &File) -> Result<Directory>;

    fn cache_volume(&self, key: &str) -> CacheVolume {
        CacheVolume::new(key)
    }

    /// Run `args` in `container`. Non-zero exit status is not an error here.
    fn exec(&self, container: &Container, args: &[String], options: ExecOptions)
        -> Result<ExecOutput>;

    /// Read a file from a directory; `Ok(None)` when it does not exist.
    fn read_file(&self, directory: &Directory, path: &str) -> Result<Option<Vec<u8>>>;

    fn container_file(&self, container: &Container, path: &str) -> Result<File>;

    fn container_directory(&self, container: &Container, path: &str) -> Result<Directory>;

    fn diff(&self, base: &Directory, current: &Directory) -> Result<Changeset> {
        Changeset::compute(base, current)
    }

    /// Force pending work on `container` and surface deferred failures.
    fn sync(&self, container: &Container) -> Result<Container>;
}
