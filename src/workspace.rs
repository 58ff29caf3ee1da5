use crate::engine::{
    Changeset, Container, Directory, Engine, ExecOptions, ExecOutput, ExecRecord, File, Secret,
};
use crate::error::{Error, Result};
use crate::terraform::PLAN_FILE_NAME;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

static NEXT_WORKSPACE_ID: AtomicU64 = AtomicU64::new(1);

/// Empty argument list for operations called without extra arguments.
pub const NO_ARGS: [&str; 0] = [];

/// Process-unique identity of a [`Workspace`], carried by the plans it produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkspaceId(u64);

impl WorkspaceId {
    fn next() -> Self {
        Self(NEXT_WORKSPACE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for WorkspaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "workspace-{}", self.0)
    }
}

/// Plan file produced by [`Workspace::plan`].
///
/// Holds only the id of the producing workspace, so it never keeps the
/// workspace alive and may be applied or shown any number of times.
#[derive(Debug, Clone)]
pub struct Plan {
    workspace: WorkspaceId,
    file: File,
}

impl Plan {
    pub fn workspace(&self) -> WorkspaceId {
        self.workspace
    }

    pub fn file(&self) -> &File {
        &self.file
    }
}

/// Terraform working tree bound to a configured container.
///
/// Every command runs against the current container; successful mutating
/// commands replace it with the resulting value, failed ones leave it as is.
/// The imported source snapshot is kept for [`Workspace::changes`].
pub struct Workspace<'e> {
    engine: &'e dyn Engine,
    id: WorkspaceId,
    version: String,
    source: Directory,
    container: Container,
    last_run: Option<ExecRecord>,
}

impl<'e> Workspace<'e> {
    pub(crate) fn new(
        engine: &'e dyn Engine,
        version: String,
        source: Directory,
        container: Container,
    ) -> Self {
        Self {
            engine,
            id: WorkspaceId::next(),
            version,
            source,
            container,
            last_run: None,
        }
    }

    pub fn id(&self) -> WorkspaceId {
        self.id
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn source(&self) -> &Directory {
        &self.source
    }

    pub fn container(&self) -> &Container {
        &self.container
    }

    pub fn with_env_variable(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> &mut Self {
        self.container = self.container.clone().with_env_variable(name, value);
        self
    }

    pub fn with_secret_variable(&mut self, secret: Secret) -> &mut Self {
        self.container = self.container.clone().with_secret_variable(secret);
        self
    }

    pub fn init<I, S>(&mut self, args: I) -> Result<&mut Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.commit("init", args)
    }

    pub fn format<I, S>(&mut self, args: I) -> Result<&mut Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.commit("fmt", args)
    }

    pub fn validate<I, S>(&mut self, args: I) -> Result<&mut Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.commit("validate", args)
    }

    /// Run `plan -out=terraform.tfplan` on a copy of the current container.
    ///
    /// The workspace container is not replaced; the plan file is taken from
    /// the copy.
    pub fn plan<I, S>(&mut self, args: I) -> Result<Plan>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut command = vec!["plan".to_string(), format!("-out={PLAN_FILE_NAME}")];
        command.extend(args.into_iter().map(|arg| arg.as_ref().to_string()));

        let current = self.container.clone();
        let output = self.run(&current, command)?;
        let file = self
            .engine
            .container_file(&output.container, PLAN_FILE_NAME)?;

        Ok(Plan {
            workspace: self.id,
            file,
        })
    }

    /// Run `show`, with `plan` mounted and appended when given, and return stdout.
    pub fn show<I, S>(&mut self, plan: Option<&Plan>, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let (container, command) = self.with_plan("show", plan, args)?;
        Ok(self.run(&container, command)?.record.stdout)
    }

    /// Run `apply`, with `plan` mounted and appended when given.
    ///
    /// Pass `-auto-approve` in `args` when applying without a plan.
    pub fn apply<I, S>(&mut self, plan: Option<&Plan>, args: I) -> Result<&mut Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let (container, command) = self.with_plan("apply", plan, args)?;
        self.container = self.run(&container, command)?.container;
        Ok(self)
    }

    /// Run `output`, appending `name` after `args`; `None` lists every output.
    pub fn output<I, S>(&mut self, name: Option<&str>, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut command = vec!["output".to_string()];
        command.extend(args.into_iter().map(|arg| arg.as_ref().to_string()));
        command.extend(name.filter(|name| !name.is_empty()).map(str::to_string));

        let current = self.container.clone();
        Ok(self.run(&current, command)?.record.stdout)
    }

    /// Differences between the working directory and the imported source.
    pub fn changes(&self) -> Result<Changeset> {
        let current = self.engine.container_directory(&self.container, ".")?;
        self.engine.diff(&self.source, &current)
    }

    /// Interleaved output of the last command, including a failed one.
    pub fn combined_output(&self) -> Option<&str> {
        self.last_run.as_ref().map(|record| record.combined.as_str())
    }

    pub fn sync(&mut self) -> Result<&mut Self> {
        self.container = self.engine.sync(&self.container)?;
        Ok(self)
    }

    fn commit<I, S>(&mut self, subcommand: &str, args: I) -> Result<&mut Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut command = vec![subcommand.to_string()];
        command.extend(args.into_iter().map(|arg| arg.as_ref().to_string()));

        let current = self.container.clone();
        self.container = self.run(&current, command)?.container;
        Ok(self)
    }

    fn with_plan<I, S>(
        &self,
        subcommand: &str,
        plan: Option<&Plan>,
        args: I,
    ) -> Result<(Container, Vec<String>)>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut command = vec![subcommand.to_string()];
        command.extend(args.into_iter().map(|arg| arg.as_ref().to_string()));

        let Some(plan) = plan else {
            return Ok((self.container.clone(), command));
        };
        if plan.workspace != self.id {
            return Err(Error::configuration(format!(
                "plan was produced by {}, not {}",
                plan.workspace, self.id
            )));
        }

        command.push(PLAN_FILE_NAME.to_string());
        let container = self
            .container
            .clone()
            .with_mounted_file(PLAN_FILE_NAME, plan.file.clone());
        Ok((container, command))
    }

    fn run(&mut self, container: &Container, command: Vec<String>) -> Result<ExecOutput> {
        debug!(workspace = %self.id, command = ?command, "running terraform");
        let output = self
            .engine
            .exec(container, &command, ExecOptions::entrypoint())?;
        self.last_run = Some(output.record.clone());

        if !output.record.success() {
            return Err(Error::CommandExecution {
                command: output.record.command,
                stderr: output.record.stderr,
                exit_status: output.record.exit_code,
            });
        }
        Ok(output)
    }
}

impl fmt::Debug for Workspace<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workspace")
            .field("id", &self.id)
            .field("version", &self.version)
            .field("source", &self.source)
            .field("container", &self.container)
            .finish_non_exhaustive()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::engine::LocalEngine;
    use crate::installers::InstallSource;
    use crate::terraform::{Terraform, PLUGIN_CACHE_DIR};
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    const FAKE_TERRAFORM: &str = r#"#!/bin/sh
echo "$*" >> "$TRACE_FILE"
cmd="$1"
shift
case "$cmd" in
  init)
    mkdir -p .terraform
    touch "$TF_PLUGIN_CACHE_DIR/provider"
    if [ -n "$TF_VAR_token" ]; then echo "token=$TF_VAR_token"; fi
    echo "Terraform has been successfully initialized!"
    ;;
  fmt)
    if [ -n "$FAIL_FMT" ]; then
      echo "main.tf"
      echo "Error: main.tf is not formatted" >&2
      exit 3
    fi
    ;;
  validate)
    echo "Success! The configuration is valid."
    ;;
  plan)
    for arg in "$@"; do
      case "$arg" in
        -out=*) { echo "plan"; cat main.tf; } > "${arg#-out=}" ;;
      esac
    done
    echo "Plan: 1 to add, 0 to change, 0 to destroy."
    ;;
  apply)
    for arg in "$@"; do
      if [ -f "$arg" ]; then cp "$arg" applied.tfplan; fi
    done
    echo 'greeting = "hello"' > outputs
    echo "Apply complete! Resources: 1 added, 0 changed, 0 destroyed."
    ;;
  show)
    for arg in "$@"; do
      if [ -f "$arg" ]; then cat "$arg"; exit 0; fi
    done
    echo "No state."
    ;;
  output)
    if [ ! -f outputs ]; then
      echo "No outputs found" >&2
      exit 1
    fi
    for arg in "$@"; do
      case "$arg" in
        -*) ;;
        *) sed -n "s/^$arg = //p" outputs; exit 0 ;;
      esac
    done
    cat outputs
    ;;
esac
"#;

    struct Fixture {
        temp: TempDir,
        engine: LocalEngine,
        terraform: Terraform,
        trace: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let temp = TempDir::new().unwrap();
            let binary = temp.path().join("fake-terraform");
            fs::write(&binary, FAKE_TERRAFORM).unwrap();
            crate::util::fs::set_executable(&binary).unwrap();

            let source = temp.path().join("source");
            fs::create_dir_all(&source).unwrap();
            fs::write(
                source.join("main.tf"),
                "output \"greeting\" {\n  value = \"hello\"\n}\n",
            )
            .unwrap();

            let engine = LocalEngine::with_root(&temp.path().join("engine")).unwrap();
            let terraform = Terraform::new(temp.path().join("cache"))
                .with_install_source(InstallSource::Local(binary));
            let trace = temp.path().join("trace");

            Self {
                temp,
                engine,
                terraform,
                trace,
            }
        }

        fn source_dir(&self) -> PathBuf {
            self.temp.path().join("source")
        }

        fn workspace(&self, version: Option<&str>) -> Workspace<'_> {
            let terraform = match version {
                Some(version) => self.terraform.clone().with_version(version),
                None => self.terraform.clone(),
            };
            let source = terraform
                .import_source(&self.engine, &self.source_dir())
                .unwrap();
            let mut workspace = terraform.workspace(&self.engine, source).unwrap();
            workspace.with_env_variable("TRACE_FILE", self.trace.display().to_string());
            workspace
        }

        fn trace(&self) -> Vec<String> {
            fs::read_to_string(&self.trace)
                .unwrap_or_default()
                .lines()
                .map(str::to_string)
                .collect()
        }
    }

    fn read(engine: &LocalEngine, container: &Container, path: &str) -> String {
        let file = engine.container_file(container, path).unwrap();
        String::from_utf8(file.contents().unwrap()).unwrap()
    }

    #[test]
    fn test_commands_run_in_call_order() {
        let fixture = Fixture::new();
        let mut workspace = fixture.workspace(Some("1.9.0"));

        workspace
            .init(["-backend=false"])
            .unwrap()
            .validate(NO_ARGS)
            .unwrap()
            .format(["-check"])
            .unwrap()
            .init(["-upgrade"])
            .unwrap();

        assert_eq!(
            fixture.trace(),
            vec!["init -backend=false", "validate", "fmt -check", "init -upgrade"]
        );
    }

    #[test]
    fn test_version_from_marker_file() {
        let fixture = Fixture::new();
        fs::write(fixture.source_dir().join(".terraform-version"), " 1.5.0\n").unwrap();

        let workspace = fixture.workspace(None);
        assert_eq!(workspace.version(), "1.5.0");
    }

    #[test]
    fn test_missing_marker_aborts_construction() {
        let fixture = Fixture::new();
        let source = fixture
            .terraform
            .import_source(&fixture.engine, &fixture.source_dir())
            .unwrap();

        let err = fixture
            .terraform
            .workspace(&fixture.engine, source)
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_changes_empty_after_construction() {
        let fixture = Fixture::new();
        let mut workspace = fixture.workspace(Some("1.9.0"));
        assert!(workspace.changes().unwrap().is_empty());

        workspace.init(NO_ARGS).unwrap();
        let changes = workspace.changes().unwrap();
        assert_eq!(changes.added_paths(), vec![".terraform/"]);
        assert!(changes.removed_paths().is_empty());
    }

    #[test]
    fn test_failed_format_keeps_environment() {
        let fixture = Fixture::new();
        let mut workspace = fixture.workspace(Some("1.9.0"));
        workspace.init(NO_ARGS).unwrap();
        workspace.with_env_variable("FAIL_FMT", "1");
        let before = workspace.container().clone();

        let err = workspace.format(["-check"]).unwrap_err();

        match &err {
            Error::CommandExecution {
                command,
                stderr,
                exit_status,
            } => {
                assert_eq!(command, &["/usr/local/bin/terraform", "fmt", "-check"]);
                assert!(stderr.contains("main.tf is not formatted"));
                assert_eq!(*exit_status, 3);
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let after = workspace.container();
        assert_eq!(after.rootfs(), before.rootfs());
        assert_eq!(after.last_exec(), before.last_exec());
        assert!(workspace
            .combined_output()
            .unwrap()
            .contains("main.tf is not formatted"));
        assert!(fixture.trace().ends_with(&["fmt -check".to_string()]));
    }

    #[test]
    fn test_plan_leaves_container_and_apply_uses_same_artifact() {
        let fixture = Fixture::new();
        let mut workspace = fixture.workspace(Some("1.9.0"));
        workspace.init(NO_ARGS).unwrap();
        let before = workspace.container().rootfs().clone();

        let plan = workspace.plan(["-input=false"]).unwrap();
        assert_eq!(workspace.container().rootfs(), &before);
        assert_eq!(plan.workspace(), workspace.id());
        assert!(!plan.file().contents().unwrap().is_empty());

        workspace.apply(Some(&plan), ["-auto-approve"]).unwrap();

        assert_eq!(
            fixture.trace().last().map(String::as_str),
            Some("apply -auto-approve terraform.tfplan")
        );
        let applied = fixture
            .engine
            .container_file(workspace.container(), "applied.tfplan")
            .unwrap();
        assert_eq!(applied.digest().unwrap(), plan.file().digest().unwrap());
        let mounted = fixture
            .engine
            .container_file(workspace.container(), PLAN_FILE_NAME)
            .unwrap();
        assert_eq!(mounted.digest().unwrap(), plan.file().digest().unwrap());
    }

    #[test]
    fn test_show_mounts_plan_without_committing() {
        let fixture = Fixture::new();
        let mut workspace = fixture.workspace(Some("1.9.0"));
        workspace.init(NO_ARGS).unwrap();
        let plan = workspace.plan(NO_ARGS).unwrap();
        let before = workspace.container().rootfs().clone();

        let shown = workspace.show(Some(&plan), ["-no-color"]).unwrap();
        assert!(shown.starts_with("plan\n"));
        assert_eq!(workspace.container().rootfs(), &before);

        // Repeated use mounts the same artifact again.
        assert_eq!(workspace.show(Some(&plan), NO_ARGS).unwrap(), shown);
        assert_eq!(workspace.show(None, NO_ARGS).unwrap(), "No state.\n");
    }

    #[test]
    fn test_apply_without_plan_commits_working_tree() {
        let fixture = Fixture::new();
        let mut workspace = fixture.workspace(Some("1.9.0"));
        workspace.init(NO_ARGS).unwrap();

        workspace.apply(None, ["-auto-approve"]).unwrap();

        assert_eq!(
            fixture.trace().last().map(String::as_str),
            Some("apply -auto-approve")
        );
        assert_eq!(
            read(&fixture.engine, workspace.container(), "outputs"),
            "greeting = \"hello\"\n"
        );
        assert!(fixture
            .engine
            .container_file(workspace.container(), "applied.tfplan")
            .is_err());
        assert!(!workspace.container().mounts().contains_key("/workspace/terraform.tfplan"));
    }

    #[test]
    fn test_sync_surfaces_missing_filesystem() {
        let fixture = Fixture::new();
        let mut workspace = fixture.workspace(Some("1.9.0"));
        workspace.init(NO_ARGS).unwrap();
        assert!(workspace.sync().is_ok());

        fs::remove_dir_all(workspace.container().rootfs().path()).unwrap();
        let err = workspace.sync().unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[test]
    fn test_plan_from_other_workspace_is_rejected() {
        let fixture = Fixture::new();
        let mut first = fixture.workspace(Some("1.9.0"));
        let mut second = fixture.workspace(Some("1.9.0"));
        let plan = first.plan(NO_ARGS).unwrap();

        let err = second.apply(Some(&plan), NO_ARGS).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        let err = second.show(Some(&plan), NO_ARGS).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_plugin_cache_is_shared_between_workspaces() {
        let fixture = Fixture::new();
        fixture.workspace(Some("1.9.0")).init(NO_ARGS).unwrap();

        let volume = fixture.engine.volume_dir("terraform");
        assert!(volume.join("provider").exists());
        assert_eq!(
            fixture.workspace(Some("1.9.0")).container().env_variable("TF_PLUGIN_CACHE_DIR"),
            Some(PLUGIN_CACHE_DIR)
        );
    }

    #[test]
    fn test_secret_is_passed_but_never_printed() {
        let fixture = Fixture::new();
        let mut workspace = fixture.workspace(Some("1.9.0"));
        workspace.with_secret_variable(Secret::new("TF_VAR_token", "hunter2"));

        workspace.init(NO_ARGS).unwrap();
        let output = workspace.combined_output().unwrap();
        assert!(output.contains("token=***"));
        assert!(!output.contains("hunter2"));
        assert!(!format!("{:?}", workspace.container()).contains("hunter2"));
    }

    #[test]
    fn test_end_to_end() {
        let fixture = Fixture::new();
        let mut workspace = fixture.workspace(Some("1.9.0"));

        workspace
            .init(["-backend=false"])
            .unwrap()
            .format(["-check"])
            .unwrap()
            .validate(NO_ARGS)
            .unwrap();
        assert_eq!(workspace.combined_output(), Some("Success! The configuration is valid.\n"));

        let plan = workspace.plan(NO_ARGS).unwrap();
        assert!(!plan.file().contents().unwrap().is_empty());

        workspace.apply(Some(&plan), NO_ARGS).unwrap();
        assert_eq!(workspace.output(Some("greeting"), ["-raw"]).unwrap(), "\"hello\"\n");
        assert_eq!(workspace.output(None, NO_ARGS).unwrap(), "greeting = \"hello\"\n");

        assert_eq!(
            fixture.trace(),
            vec![
                "init -backend=false",
                "fmt -check",
                "validate",
                "plan -out=terraform.tfplan",
                "apply terraform.tfplan",
                "output -raw greeting",
                "output",
            ]
        );
        assert_eq!(
            read(&fixture.engine, workspace.container(), "outputs"),
            "greeting = \"hello\"\n"
        );
    }

    #[test]
    fn test_output_failure_reports_stderr() {
        let fixture = Fixture::new();
        let mut workspace = fixture.workspace(Some("1.9.0"));

        let err = workspace.output(None, NO_ARGS).unwrap_err();
        assert_eq!(err.stderr(), Some("No outputs found\n"));
    }
}
