use super::{diagnose, export_changes, Project};
use crate::engine::Engine;
use crate::ui;
use crate::workspace::NO_ARGS;
use anyhow::Result;

pub fn execute(
    engine: &dyn Engine,
    project: &Project,
    export: bool,
    args: &[String],
) -> Result<()> {
    let mut workspace = project.open_workspace(engine)?;

    let result = workspace.init(["-input=false"]).map(|_| ());
    diagnose(&workspace, result)?;

    let result = workspace.plan(args);
    let plan = diagnose(&workspace, result)?;

    let progress = ui::Progress::new("Applying", project.source.display().to_string());
    let result = workspace.apply(Some(&plan), ["-input=false"]).map(|_| ());
    if let Err(err) = &result {
        progress.fail("Failed", err);
    } else {
        progress.success("Applied", None);
    }
    diagnose(&workspace, result)?;

    if let Some(output) = workspace.combined_output() {
        print!("{output}");
    }

    let result = workspace.output(None, NO_ARGS);
    print!("{}", diagnose(&workspace, result)?);

    if export {
        export_changes(workspace.changes()?, &project.source)?;
    }
    Ok(())
}
