use std::path::PathBuf;

use kiln_build::weights;
use kiln_build::DiskWalker;

pub fn weights_manifest() -> anyhow::Result<()> {
    let project_dir = PathBuf::from(".");
    let walker = DiskWalker::new(&project_dir);

    let (dirs, files) = weights::find_weights(&walker)?;
    let manifest = weights::build_manifest(&walker, &project_dir, &dirs, &files)?;

    println!("{}", serde_json::to_string_pretty(&manifest)?);
    Ok(())
}
