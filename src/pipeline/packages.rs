use std::collections::{BTreeMap, BTreeSet};
use std::fs::OpenOptions;
use std::io::Write;

use anyhow::{Context, anyhow};
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, FixedOffset};
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};

use crate::context::BuildContext;
use crate::metadata::{Dependency, VersionEntry};
use crate::nuget::{PackagePublisher, PackageSpec, PublishedVersion, next_revision, package_version};

pub const PROJECT_URL: &str = "https://github.com/Lordfirespeed/NuGet-GameLib-Dehumidifier";
pub const DESCRIPTION_TRAILER: &str = "\n\nGenerated and managed by GameLib Dehumidifier.";
const OUTDATED_OUTPUT: &str = "outdated-version-buildIds";

pub(super) fn list_deployed(ctx: &BuildContext) -> anyhow::Result<()> {
    let ids = ctx.metadata.get()?.package_ids();

    let deployed = ids
        .par_iter()
        .map(|id| -> anyhow::Result<_> {
            tracing::info!("Fetching index for NuGet package '{id}'");
            let versions = ctx.services.registry.published_versions(id)?;
            Ok((id.clone(), versions))
        })
        .collect::<anyhow::Result<BTreeMap<_, _>>>()?;

    ctx.deployed.set(deployed)?;
    Ok(())
}

/// Whether any package of `entry` lacks a deploy made since the last change
/// to this tool's version.
///
/// A package's deploys for an entry are the versions starting with its game
/// version; only the most recently published one counts.
pub fn is_outdated(
    entry: &VersionEntry,
    package_ids: &[String],
    deployed: &BTreeMap<String, Vec<PublishedVersion>>,
    since: DateTime<FixedOffset>,
) -> bool {
    package_ids.iter().any(|id| {
        let latest = deployed
            .get(id)
            .into_iter()
            .flatten()
            .filter(|v| v.version.starts_with(&entry.game_version))
            .filter_map(|v| v.published)
            .max();
        !latest.is_some_and(|published| published >= since)
    })
}

/// Publishes the outdated build ids as a step output, either into the
/// `GITHUB_OUTPUT` file or as a workflow command on stdout.
pub fn write_outdated_build_ids(github_output: Option<&Utf8Path>, build_ids: &[u32]) -> anyhow::Result<()> {
    let json = serde_json::to_string(build_ids)?;

    match github_output {
        Some(path) => {
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Couldn't open GitHub output file '{path}'"))?;
            writeln!(file, "{OUTDATED_OUTPUT}<<EOF")?;
            writeln!(file, "{json}")?;
            writeln!(file, "EOF")?;
        }
        None => println!("::set-output name={OUTDATED_OUTPUT}::{json}"),
    }
    Ok(())
}

pub(super) fn check_up_to_date(ctx: &BuildContext) -> anyhow::Result<()> {
    let metadata = ctx.metadata.get()?;
    let versions = ctx.versions.get()?;
    let deployed = ctx.deployed.get()?;
    let since = ctx.services.vcs.last_version_change()?;
    let ids = metadata.package_ids();

    let outdated: Vec<u32> = versions
        .iter()
        .filter(|entry| is_outdated(entry, &ids, deployed, since))
        .map(|entry| entry.build_id)
        .collect();
    tracing::info!("{} of {} versions are outdated", outdated.len(), versions.0.len());
    write_outdated_build_ids(ctx.settings.github_output.as_deref(), &outdated)?;

    if let Some(build_id) = ctx.settings.build_id.filter(|&id| versions.contains(id)) {
        let up_to_date = !outdated.contains(&build_id);
        if up_to_date {
            tracing::info!("Packages for build {build_id} are up to date");
        }
        ctx.target_up_to_date.set(up_to_date)?;
    }
    Ok(())
}

pub(super) fn download_dependencies(ctx: &BuildContext) -> anyhow::Result<()> {
    let target = ctx.target_version()?;

    let unique: BTreeMap<(String, String), &Dependency> = target
        .framework_targets
        .iter()
        .flat_map(|t| &t.dependencies)
        .map(|d| ((d.name.to_lowercase(), d.version.to_lowercase()), d))
        .collect();
    let dependencies: Vec<_> = unique.into_values().collect();

    let packages = dependencies
        .par_iter()
        .map(|dependency| ctx.services.registry.download(dependency))
        .collect::<anyhow::Result<Vec<_>>>()?;

    ctx.dependency_packages.set(packages)?;
    Ok(())
}

pub(super) fn cache_dependency_assembly_names(ctx: &BuildContext) -> anyhow::Result<()> {
    let target = ctx.target_version()?;
    let packages = ctx.dependency_packages.get()?;

    let mut names = BTreeMap::new();
    for framework_target in &target.framework_targets {
        let mut supplied = BTreeSet::new();
        for dependency in &framework_target.dependencies {
            let package = packages
                .iter()
                .find(|p| {
                    p.id.eq_ignore_ascii_case(&dependency.name)
                        && p.version.eq_ignore_ascii_case(&dependency.version)
                })
                .ok_or_else(|| anyhow!("{} {} was not downloaded", dependency.name, dependency.version))?;
            supplied.extend(
                ctx.services
                    .registry
                    .assembly_names(package, &framework_target.framework)?,
            );
        }
        tracing::debug!(
            "{}: {} assemblies supplied by dependencies",
            framework_target.framework,
            supplied.len()
        );
        names.insert(framework_target.framework, supplied);
    }

    ctx.dependency_assemblies.set(names)?;
    Ok(())
}

pub(super) fn make_packages(ctx: &BuildContext) -> anyhow::Result<()> {
    let metadata = ctx.metadata.get()?;
    let target = ctx.target_version()?;
    let deployed = ctx.deployed.get()?;
    let nupkgs = ctx.settings.nupkgs_directory();

    let all_versions: Vec<&PublishedVersion> = deployed.values().flatten().collect();
    let dependency_groups: Vec<_> = target
        .framework_targets
        .iter()
        .map(|t| (t.framework, t.dependencies.clone()))
        .collect();

    let depots: Vec<_> = metadata.steam.distribution_depots.values().collect();
    depots.par_iter().try_for_each(|depot| {
        let id = metadata.package_id(depot);
        let revision = next_revision(all_versions.iter().copied(), &id, &target.game_version);
        let spec = PackageSpec {
            version: package_version(&target.game_version, revision),
            authors: metadata.nuget.authors.clone(),
            description: format!("{}{DESCRIPTION_TRAILER}", metadata.nuget.description),
            project_url: Some(PROJECT_URL.to_string()),
            dependency_groups: dependency_groups.clone(),
            id,
        };

        let source = nupkgs.join(&spec.id);
        let output = nupkgs.join(format!("{}.nupkg", spec.id));
        ctx.services.publisher.pack(&spec, &source, &output)
    })
}

pub(super) fn push_packages(ctx: &BuildContext) -> anyhow::Result<()> {
    let nupkgs = ctx.settings.nupkgs_directory();
    let pushed = push_all(ctx.services.publisher.as_ref(), &nupkgs)?;
    if pushed == 0 {
        tracing::warn!("No packages to push in '{nupkgs}'");
    } else {
        tracing::info!("Pushed {pushed} packages");
    }
    Ok(())
}

/// Pushes every `*.nupkg` directly in `nupkgs` and returns how many there were.
fn push_all(publisher: &dyn PackagePublisher, nupkgs: &Utf8Path) -> anyhow::Result<usize> {
    let pattern = glob::Pattern::escape(nupkgs.as_str()) + "/*.nupkg";

    let mut packages = Vec::new();
    for path in glob::glob(&pattern)? {
        packages.push(Utf8PathBuf::try_from(path?)?);
    }
    packages.sort();

    for package in &packages {
        publisher.push(package)?;
    }
    Ok(packages.len())
}
