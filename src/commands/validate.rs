use super::{diagnose, Project};
use crate::engine::Engine;
use crate::ui;
use anyhow::Result;

pub fn execute(engine: &dyn Engine, project: &Project, args: &[String]) -> Result<()> {
    let mut workspace = project.open_workspace(engine)?;

    let result = workspace
        .init(["-backend=false", "-input=false"])
        .and_then(|workspace| workspace.validate(args))
        .map(|_| ());
    diagnose(&workspace, result)?;

    ui::success("Valid", project.source.display());
    Ok(())
}
