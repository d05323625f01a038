use std::fs;

use anyhow::Context;

use crate::context::BuildContext;
use crate::metadata::{load_metadata, load_versions, write_version};

pub(super) fn clean(ctx: &BuildContext) -> anyhow::Result<()> {
    let nupkgs = ctx.settings.checked_game_directory()?.join("nupkgs");
    tracing::info!("Cleaning up previous build artifacts...");
    if nupkgs.exists() {
        fs::remove_dir_all(&nupkgs).with_context(|| format!("Couldn't remove '{nupkgs}'"))?;
    }
    Ok(())
}

pub(super) fn prepare(ctx: &BuildContext) -> anyhow::Result<()> {
    let game_dir = ctx.settings.checked_game_directory()?;

    tracing::info!("Deserializing game metadata...");
    let metadata = load_metadata(&game_dir)?;
    let versions = load_versions(&game_dir)?;
    tracing::info!(
        "{}: {} depots, {} known versions",
        metadata.nuget.name,
        metadata.steam.distribution_depots.len(),
        versions.0.len()
    );

    ctx.metadata.set(metadata)?;
    ctx.versions.set(versions)?;
    Ok(())
}

pub(super) fn dump_game_versions(ctx: &BuildContext) -> anyhow::Result<()> {
    let game_dir = ctx.game_directory();
    for entry in ctx.versions.get()?.iter() {
        let path = write_version(&game_dir, entry)?;
        tracing::debug!("Wrote {path}");
    }
    Ok(())
}
