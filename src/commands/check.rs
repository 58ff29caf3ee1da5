use super::{diagnose, Project};
use crate::engine::Engine;
use crate::terraform::{Terraform, CHECK_IGNORE};
use crate::ui;
use anyhow::{Context, Result};

pub fn execute(engine: &dyn Engine, project: &Project) -> Result<()> {
    let source = engine
        .host_directory(&project.source, CHECK_IGNORE)
        .with_context(|| format!("Failed to import source directory {:?}", project.source))?;
    let mut workspace = project.terraform.workspace(engine, source)?;

    let progress = ui::Progress::new("Checking", project.source.display().to_string());
    let result = Terraform::check_workspace(&mut workspace);
    match &result {
        Ok(()) => progress.success("Checked", Some("(init, fmt, validate)".to_string())),
        Err(err) => progress.fail("Failed", err),
    }
    diagnose(&workspace, result)
}
