use super::{diagnose, Project};
use crate::engine::Engine;
use anyhow::Result;

pub fn execute(
    engine: &dyn Engine,
    project: &Project,
    name: Option<&str>,
    args: &[String],
) -> Result<()> {
    let mut workspace = project.open_workspace(engine)?;

    let result = workspace.init(["-input=false"]).map(|_| ());
    diagnose(&workspace, result)?;

    let result = workspace.output(name, args);
    print!("{}", diagnose(&workspace, result)?);
    Ok(())
}
