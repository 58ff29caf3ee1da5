use super::Project;
use crate::engine::{Engine, Platform};
use crate::installers::binary_name;
use crate::terraform::BINARY_NAME;
use crate::ui;
use crate::util::fs::set_executable;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

pub fn execute(
    engine: &dyn Engine,
    project: &Project,
    platform: Option<&str>,
    dest: &Path,
) -> Result<()> {
    let platform: Platform = match platform {
        Some(value) => value.parse()?,
        None => engine.platform()?,
    };

    let progress = ui::Progress::new("Fetching", format!("{BINARY_NAME} for {platform}"));
    let file = match project.terraform.binary(engine, Some(&platform)) {
        Ok(file) => file,
        Err(err) => {
            progress.fail("Failed", &err);
            return Err(err.into());
        }
    };

    fs::create_dir_all(dest).with_context(|| format!("Failed to create directory {:?}", dest))?;
    let target = dest.join(binary_name(BINARY_NAME, &platform));
    fs::copy(file.path(), &target)
        .with_context(|| format!("Failed to copy binary to {:?}", target))?;
    set_executable(&target)?;

    progress.success("Fetched", Some(format!("to {}", target.display())));
    Ok(())
}
