use std::collections::BTreeMap;

use anyhow::anyhow;
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};

use crate::context::BuildContext;
use crate::framework::{Family, Framework};
use crate::git::PullRequest;
use crate::metadata::{DepotVersion, FrameworkTarget, GameMetadata, GameVersions, VersionEntry, write_version};
use crate::steam::{AppBranch, AppInfo, PUBLIC_BRANCH};

const FALLBACK_FRAMEWORK: Framework = Framework::new(Family::NetStandard, 2, 0);

pub(super) fn fetch_app_info(ctx: &BuildContext) -> anyhow::Result<()> {
    let app_id = ctx.metadata.get()?.steam.app_id;
    let info = ctx.services.content.app_info(app_id)?;
    ctx.app_info.set(info)?;
    Ok(())
}

pub(super) fn handle_unknown_build(ctx: &BuildContext) -> anyhow::Result<()> {
    let app = ctx.app_info.get()?;
    let versions = ctx.versions.get()?;
    let current = app.public_branch()?;

    match versions.latest() {
        Some(latest) if latest.build_id == current.build_id => {
            if latest.time_updated != current.time_updated {
                tracing::warn!(
                    "TimeUpdated for most recent known version is inaccurate - Should be {}",
                    current.time_updated
                );
            }
            Ok(())
        }
        Some(_) if versions.contains(current.build_id) => {
            tracing::warn!("Current version is known, but is not latest?");
            Ok(())
        }
        _ => open_version_pull_request(ctx, app, current),
    }
}

/// The partial entry proposed for an unknown build. The game version is left
/// for a human to fill in.
fn partial_version_entry(
    metadata: &GameMetadata,
    versions: &GameVersions,
    app: &AppInfo,
    branch: &AppBranch,
) -> anyhow::Result<VersionEntry> {
    let mut depots = BTreeMap::new();
    for &depot_id in metadata.steam.distribution_depots.keys() {
        let manifest_id = app.manifest(depot_id, PUBLIC_BRANCH).ok_or_else(|| {
            anyhow!("Depot {depot_id} has no manifest on the {PUBLIC_BRANCH} branch")
        })?;
        depots.insert(
            depot_id,
            DepotVersion {
                depot_id,
                manifest_id,
            },
        );
    }

    let framework_targets = versions
        .latest()
        .map(|latest| latest.framework_targets.clone())
        .unwrap_or_else(|| vec![FrameworkTarget::without_dependencies(FALLBACK_FRAMEWORK)]);

    Ok(VersionEntry {
        build_id: branch.build_id,
        time_updated: branch.time_updated,
        game_version: String::new(),
        depots,
        framework_targets,
    })
}

fn open_version_pull_request(ctx: &BuildContext, app: &AppInfo, current: &AppBranch) -> anyhow::Result<()> {
    let vcs = &ctx.services.vcs;
    let game = &ctx.settings.game;
    let game_dir = ctx.game_directory();
    let branch = format!("{game}-build-{}", current.build_id);

    vcs.fetch()?;
    if vcs.remote_branch_exists(&branch)? {
        return Err(anyhow!(
            "Version entry branch already exists on 'origin', assuming pull request is already open."
        ));
    }

    tracing::info!("Adding new (partial) version entry to game metadata...");
    let entry = partial_version_entry(ctx.metadata.get()?, ctx.versions.get()?, app, current)?;
    write_version(&game_dir, &entry)?;

    tracing::info!("Opening version entry pull request...");
    vcs.create_branch(&branch)?;
    vcs.stage(&game_dir.join("versions"))?;
    vcs.commit(&format!(
        "add game version entry for {} build {}",
        app.name, current.build_id
    ))?;
    vcs.push(&branch)?;
    vcs.open_pull_request(&PullRequest {
        title: format!("[{game}] Version entry - Build {}", current.build_id),
        body: format!(
            "Contains partially patched `metadata.json` for {name} build {build}.\n\
             Game version number must be populated before merging.\n\
             Game version number can likely be inferred from \
             [Patchnotes for {name} - SteamDB](https://steamdb.info/app/{app_id}/patchnotes/)",
            name = app.name,
            build = current.build_id,
            app_id = app.app_id,
        ),
        head: branch,
    })?;

    tracing::warn!("Version number for new build is unknown. Opened pull request to resolve.");
    Ok(())
}

pub(super) fn download_depots(ctx: &BuildContext) -> anyhow::Result<()> {
    let metadata = ctx.metadata.get()?;
    let target = ctx.target_version()?;
    let app_id = metadata.steam.app_id;

    let depots: Vec<_> = metadata.steam.distribution_depots.values().collect();
    depots.par_iter().try_for_each(|depot| {
        let manifest = target.depots.get(&depot.depot_id).ok_or_else(|| {
            anyhow!(
                "Build {} has no manifest for depot {}",
                target.build_id,
                depot.depot_id
            )
        })?;
        let dir = ctx
            .services
            .content
            .download_depot(app_id, depot.depot_id, manifest.manifest_id)?;
        tracing::info!("Depot {} downloaded to {dir}", depot.depot_id);
        ctx.record_depot_dir(depot.depot_id, &dir);
        Ok(())
    })
}
