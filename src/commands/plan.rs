use super::{diagnose, Project};
use crate::engine::Engine;
use crate::ui;
use crate::workspace::NO_ARGS;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

pub fn execute(
    engine: &dyn Engine,
    project: &Project,
    out: Option<&Path>,
    args: &[String],
) -> Result<()> {
    let mut workspace = project.open_workspace(engine)?;

    let result = workspace.init(["-input=false"]).map(|_| ());
    diagnose(&workspace, result)?;

    let result = workspace.plan(args);
    let plan = diagnose(&workspace, result)?;

    let result = workspace.show(Some(&plan), NO_ARGS);
    print!("{}", diagnose(&workspace, result)?);

    if let Some(out) = out {
        fs::copy(plan.file().path(), out)
            .with_context(|| format!("Failed to copy plan file to {:?}", out))?;
        ui::success("Saved", format!("plan to {}", out.display()));
    }
    Ok(())
}
