use super::{diagnose, export_changes, Project};
use crate::engine::Engine;
use crate::ui;
use anyhow::Result;

pub fn execute(
    engine: &dyn Engine,
    project: &Project,
    export: bool,
    args: &[String],
) -> Result<()> {
    let mut workspace = project.open_workspace(engine)?;

    let result = workspace.format(args).map(|_| ());
    diagnose(&workspace, result)?;

    if let Some(output) = workspace.combined_output() {
        print!("{output}");
    }

    let changes = workspace.changes()?;
    if export {
        export_changes(changes, &project.source)?;
    } else if !changes.is_empty() {
        ui::info(format!(
            "{} file(s) would change; rerun with --export to write them",
            changes.modified_paths().len()
        ));
    }
    Ok(())
}
