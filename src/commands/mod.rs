use crate::cli::{Cli, Commands};
use crate::config::{secret_from_binding, Config};
use crate::engine::{Changeset, Engine, LocalEngine};
use crate::terraform::{Terraform, WORKSPACE_IGNORE};
use crate::ui;
use crate::util::xdg;
use crate::workspace::Workspace;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::debug;

mod apply;
mod binary;
mod check;
mod fmt;
mod output;
mod plan;
mod show;
mod validate;
mod version;

/// Settings shared by every command: Terraform configuration and the source directory.
pub(crate) struct Project {
    pub terraform: Terraform,
    pub source: PathBuf,
}

impl Project {
    fn from_cli(cli: &Cli) -> Result<Self> {
        let config_path = match &cli.config {
            Some(path) => path.clone(),
            None => Config::default_path()?,
        };
        let config = Config::load(&config_path)?;
        debug!(path = ?config_path, "loaded configuration");

        let mut terraform = config.terraform(&xdg::cache_dir()?)?;
        if let Some(version) = &cli.tf_version {
            terraform = terraform.with_version(version);
        }
        for (name, value) in &cli.env {
            terraform = terraform.with_env_variable(name, value);
        }
        for (name, variable) in &cli.secrets {
            terraform = terraform.with_secret_variable(secret_from_binding(name, variable)?);
        }

        Ok(Self {
            terraform,
            source: cli.source.clone(),
        })
    }

    pub fn open_workspace<'e>(&self, engine: &'e dyn Engine) -> Result<Workspace<'e>> {
        let source = self
            .terraform
            .import_source(engine, &self.source)
            .with_context(|| format!("Failed to import source directory {:?}", self.source))?;
        Ok(self.terraform.workspace(engine, source)?)
    }
}

pub fn execute(cli: Cli) -> Result<()> {
    let project = Project::from_cli(&cli)?;
    let engine = LocalEngine::new().context("Failed to initialize local engine")?;

    match cli.command {
        Commands::Check => check::execute(&engine, &project),

        Commands::Fmt { export, args } => fmt::execute(&engine, &project, export, &args),

        Commands::Validate { args } => validate::execute(&engine, &project, &args),

        Commands::Plan { out, args } => plan::execute(&engine, &project, out.as_deref(), &args),

        Commands::Apply { export, args } => apply::execute(&engine, &project, export, &args),

        Commands::Show { args } => show::execute(&engine, &project, &args),

        Commands::Output { name, args } => {
            output::execute(&engine, &project, name.as_deref(), &args)
        }

        Commands::Binary { platform, dest } => {
            binary::execute(&engine, &project, platform.as_deref(), &dest)
        }

        Commands::Version => version::execute(&engine, &project),
    }
}

/// Turn a failed step into an error, printing the command output first.
pub(crate) fn diagnose<T>(workspace: &Workspace<'_>, result: crate::Result<T>) -> Result<T> {
    result.map_err(|err| {
        if let (Some(output), Some(_)) = (workspace.combined_output(), err.stderr()) {
            eprint!("{output}");
        }
        anyhow::Error::new(err)
    })
}

/// Write workspace changes back to the source, leaving out local state and `.terraform/`.
pub(crate) fn export_changes(changes: Changeset, source: &Path) -> Result<()> {
    let changes = changes
        .excluding(&[".terraform"])
        .excluding(WORKSPACE_IGNORE);
    if changes.is_empty() {
        ui::info("No changes to export.");
        return Ok(());
    }

    changes
        .export(source)
        .with_context(|| format!("Failed to export changes to {:?}", source))?;
    let summary = format!(
        "{} change(s) to {}\n{}",
        changes.changes().len(),
        source.display(),
        changes
    );
    ui::success("Exported", summary.trim_end());
    Ok(())
}
