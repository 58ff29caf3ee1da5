use super::Project;
use crate::engine::Engine;
use crate::version;
use anyhow::Result;

pub fn execute(engine: &dyn Engine, project: &Project) -> Result<()> {
    let source = project.terraform.import_source(engine, &project.source)?;
    let version = version::resolve(engine, project.terraform.version(), &source)?;
    println!("{version}");
    Ok(())
}
