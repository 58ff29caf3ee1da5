//! Terraform binary installation and container construction.

use crate::engine::{join_path, CacheSharing, Container, Directory, Engine, File, Platform, Secret};
use crate::error::{Error, Result};
use crate::installers::{create_installer, InstallSource};
use crate::version;
use crate::workspace::{Workspace, NO_ARGS};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const BINARY_NAME: &str = "terraform";
pub const PLAN_FILE_NAME: &str = "terraform.tfplan";
pub const PLUGIN_CACHE_DIR: &str = "/var/cache/terraform";
pub const PLUGIN_CACHE_ENV: &str = "TF_PLUGIN_CACHE_DIR";
pub const DEFAULT_PREFIX: &str = "/usr/local";
pub const WORKDIR: &str = "/workspace";

/// Local state never imported with a workspace source.
pub const WORKSPACE_IGNORE: &[&str] = &[
    "terraform.tfstate",
    "terraform.tfstate.backup",
    PLAN_FILE_NAME,
];

/// Check runs also leave out a previously initialized `.terraform/` directory.
pub const CHECK_IGNORE: &[&str] = &[
    ".terraform/",
    "terraform.tfstate",
    "terraform.tfstate.backup",
    PLAN_FILE_NAME,
];

#[derive(Debug, Clone)]
pub struct Terraform {
    version: Option<String>,
    prefix: String,
    sharing: CacheSharing,
    source: InstallSource,
    cache_dir: PathBuf,
    env: BTreeMap<String, String>,
    secrets: Vec<Secret>,
}

impl Terraform {
    /// Downloads are cached below `cache_dir`.
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            version: None,
            prefix: DEFAULT_PREFIX.to_string(),
            sharing: CacheSharing::default(),
            source: InstallSource::default(),
            cache_dir: cache_dir.into(),
            env: BTreeMap::new(),
            secrets: Vec::new(),
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into()).filter(|value: &String| !value.is_empty());
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_cache_sharing(mut self, sharing: CacheSharing) -> Self {
        self.sharing = sharing;
        self
    }

    pub fn with_install_source(mut self, source: InstallSource) -> Self {
        self.source = source;
        self
    }

    /// Variable set on every container built from this configuration.
    pub fn with_env_variable(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(name.into(), value.into());
        self
    }

    pub fn with_secret_variable(mut self, secret: Secret) -> Self {
        self.secrets.push(secret);
        self
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Container path of the installed binary.
    pub fn entrypoint(&self, prefix: Option<&str>) -> String {
        join_path(prefix.unwrap_or(&self.prefix), &format!("bin/{BINARY_NAME}"))
    }

    /// Verified binary for `platform`, or the engine's platform.
    pub fn binary(&self, engine: &dyn Engine, platform: Option<&Platform>) -> Result<File> {
        let version = self.version.as_deref().ok_or_else(|| {
            Error::configuration("a Terraform version is required to fetch the binary")
        })?;
        let platform = match platform {
            Some(platform) => platform.clone(),
            None => engine.platform()?,
        };

        let installer = create_installer(BINARY_NAME, version, &self.source, &self.cache_dir)?;
        let path = installer.install(&platform)?;
        debug!(path = ?path, version, platform = %platform, "terraform binary ready");
        engine.host_file(&path)
    }

    /// Directory holding the binary at `<prefix>/bin/terraform`.
    pub fn overlay(
        &self,
        engine: &dyn Engine,
        platform: Option<&Platform>,
        prefix: Option<&str>,
    ) -> Result<Directory> {
        let binary = self.binary(engine, platform)?;
        engine.with_file(&engine.scratch()?, &self.entrypoint(prefix), &binary)
    }

    /// Install the binary into `container` and attach the shared plugin cache.
    pub fn installation(
        &self,
        engine: &dyn Engine,
        container: Container,
        prefix: Option<&str>,
    ) -> Result<Container> {
        let overlay = self.overlay(engine, Some(container.platform()), prefix)?;
        Ok(container
            .with_directory("/", overlay)
            .with_mounted_cache(
                PLUGIN_CACHE_DIR,
                engine.cache_volume(BINARY_NAME),
                self.sharing,
            )
            .with_env_variable(PLUGIN_CACHE_ENV, PLUGIN_CACHE_DIR))
    }

    pub fn base_container(&self, engine: &dyn Engine) -> Result<Container> {
        let container = engine.container(None)?.with_workdir(WORKDIR);
        let container = self
            .env
            .iter()
            .fold(container, |container, (name, value)| {
                container.with_env_variable(name, value)
            });
        Ok(self
            .secrets
            .iter()
            .cloned()
            .fold(container, Container::with_secret_variable))
    }

    /// Container running Terraform as its entrypoint, built on `base` or the default base.
    pub fn container(
        &self,
        engine: &dyn Engine,
        base: Option<Container>,
        prefix: Option<&str>,
    ) -> Result<Container> {
        let base = match base {
            Some(base) => base,
            None => self.base_container(engine)?,
        };
        let entrypoint = self.entrypoint(prefix);
        Ok(self
            .installation(engine, base, prefix)?
            .with_entrypoint([entrypoint]))
    }

    /// Import a host source tree, leaving out local state and plan files.
    pub fn import_source(&self, engine: &dyn Engine, path: &Path) -> Result<Directory> {
        engine.host_directory(path, WORKSPACE_IGNORE)
    }

    /// Build a workspace for `source`; the version comes from configuration or the marker file.
    pub fn workspace<'e>(
        &self,
        engine: &'e dyn Engine,
        source: Directory,
    ) -> Result<Workspace<'e>> {
        let version = version::resolve(engine, self.version.as_deref(), &source)?;
        let terraform = self.clone().with_version(version.clone());

        let container = terraform
            .container(engine, None, None)?
            .with_mounted_directory(".", source.clone());

        info!(version = %version, "workspace ready");
        Ok(Workspace::new(engine, version, source, container))
    }

    /// Initialize without a backend, check formatting and validate the configuration.
    pub fn check(&self, engine: &dyn Engine, source_dir: &Path) -> Result<()> {
        let source = engine.host_directory(source_dir, CHECK_IGNORE)?;
        let mut workspace = self.workspace(engine, source)?;
        Self::check_workspace(&mut workspace)
    }

    /// The check sequence on an existing workspace; stops at the first failure.
    pub fn check_workspace(workspace: &mut Workspace<'_>) -> Result<()> {
        workspace
            .init(["-backend=false"])?
            .format(["-check", "-recursive", "-diff"])?
            .validate(NO_ARGS)?
            .sync()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::LocalEngine;
    use crate::engine::Mount;
    use rstest::rstest;
    use std::fs;
    use tempfile::TempDir;

    fn local_terraform(temp: &TempDir) -> Terraform {
        let binary = temp.path().join("terraform-bin");
        fs::write(&binary, "#!/bin/sh\n").unwrap();
        crate::util::fs::set_executable(&binary).unwrap();
        Terraform::new(temp.path().join("cache"))
            .with_version("1.9.0")
            .with_install_source(InstallSource::Local(binary))
    }

    #[rstest]
    #[case(None, "/usr/local/bin/terraform")]
    #[case(Some("/opt/tf"), "/opt/tf/bin/terraform")]
    #[case(Some("/"), "/bin/terraform")]
    fn test_entrypoint(#[case] prefix: Option<&str>, #[case] expected: &str) {
        let terraform = Terraform::new("/tmp/cache");
        assert_eq!(terraform.entrypoint(prefix), expected);
    }

    #[test]
    fn test_binary_requires_version() {
        let temp = TempDir::new().unwrap();
        let engine = LocalEngine::with_root(&temp.path().join("engine")).unwrap();
        let terraform = Terraform::new(temp.path().join("cache"));

        let err = terraform.binary(&engine, None).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_overlay_places_binary_under_prefix() {
        let temp = TempDir::new().unwrap();
        let engine = LocalEngine::with_root(&temp.path().join("engine")).unwrap();
        let terraform = local_terraform(&temp);

        let overlay = terraform.overlay(&engine, None, Some("/opt/tf")).unwrap();
        assert!(overlay.path().join("opt/tf/bin/terraform").is_file());
    }

    #[test]
    fn test_container_configuration() {
        let temp = TempDir::new().unwrap();
        let engine = LocalEngine::with_root(&temp.path().join("engine")).unwrap();
        let terraform = local_terraform(&temp)
            .with_cache_sharing(CacheSharing::Locked)
            .with_env_variable("TF_IN_AUTOMATION", "1")
            .with_secret_variable(Secret::new("TF_VAR_token", "hunter2"));

        let container = terraform.container(&engine, None, None).unwrap();

        assert_eq!(container.workdir(), WORKDIR);
        assert_eq!(container.entrypoint(), ["/usr/local/bin/terraform"]);
        assert_eq!(container.env_variable(PLUGIN_CACHE_ENV), Some(PLUGIN_CACHE_DIR));
        assert_eq!(container.env_variable("TF_IN_AUTOMATION"), Some("1"));
        assert_eq!(
            container.secret_variables().map(Secret::name).collect::<Vec<_>>(),
            vec!["TF_VAR_token"]
        );
        assert!(matches!(
            container.mounts().get(PLUGIN_CACHE_DIR),
            Some(Mount::Cache {
                volume,
                sharing: CacheSharing::Locked,
            }) if volume.key() == BINARY_NAME
        ));
        assert_eq!(container.overlays().len(), 1);
    }

    #[test]
    fn test_import_source_skips_local_state() {
        let temp = TempDir::new().unwrap();
        let engine = LocalEngine::with_root(&temp.path().join("engine")).unwrap();
        let source = temp.path().join("source");
        fs::create_dir_all(source.join(".terraform")).unwrap();
        fs::write(source.join("main.tf"), "").unwrap();
        fs::write(source.join("terraform.tfstate"), "{}").unwrap();
        fs::write(source.join(PLAN_FILE_NAME), "plan").unwrap();

        let terraform = Terraform::new(temp.path().join("cache"));
        let directory = terraform.import_source(&engine, &source).unwrap();

        assert!(directory.path().join("main.tf").exists());
        assert!(directory.path().join(".terraform").exists());
        assert!(!directory.path().join("terraform.tfstate").exists());
        assert!(!directory.path().join(PLAN_FILE_NAME).exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_check_stops_at_first_failure() {
        let temp = TempDir::new().unwrap();
        let engine = LocalEngine::with_root(&temp.path().join("engine")).unwrap();
        let binary = temp.path().join("fake-terraform");
        fs::write(
            &binary,
            "#!/bin/sh\n\
             echo \"$*\" >> \"$TRACE_FILE\"\n\
             if [ \"$1\" = fmt ] && [ -f unformatted.tf ]; then\n\
               echo unformatted.tf >&2; exit 3\n\
             fi\n",
        )
        .unwrap();
        crate::util::fs::set_executable(&binary).unwrap();

        let trace = temp.path().join("trace");
        let terraform = Terraform::new(temp.path().join("cache"))
            .with_version("1.9.0")
            .with_install_source(InstallSource::Local(binary))
            .with_env_variable("TRACE_FILE", trace.display().to_string());

        let source = temp.path().join("source");
        fs::create_dir_all(source.join(".terraform")).unwrap();
        fs::write(source.join("main.tf"), "").unwrap();
        terraform.check(&engine, &source).unwrap();
        assert_eq!(
            fs::read_to_string(&trace).unwrap(),
            "init -backend=false\nfmt -check -recursive -diff\nvalidate\n"
        );

        fs::remove_file(&trace).unwrap();
        fs::write(source.join("unformatted.tf"), "").unwrap();
        let err = terraform.check(&engine, &source).unwrap_err();
        assert_eq!(err.stderr(), Some("unformatted.tf\n"));
        assert_eq!(
            fs::read_to_string(&trace).unwrap(),
            "init -backend=false\nfmt -check -recursive -diff\n"
        );
    }
}
