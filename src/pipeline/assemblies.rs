use anyhow::{Context, anyhow};

use crate::context::BuildContext;
use crate::processor::{AssemblyProcessor, AssemblySelection, DistributionUnit, ProcessTarget, managed_dir};

pub(super) fn process_assemblies(ctx: &BuildContext) -> anyhow::Result<()> {
    let metadata = ctx.metadata.get()?;
    let target = ctx.target_version()?;
    let supplied = ctx.dependency_assemblies.get()?;
    let settings = &metadata.process_settings;

    let selection = AssemblySelection::new(&settings.exclude_assemblies, &settings.assemblies_to_publicize)
        .context("Invalid assembly pattern")?;

    let mut units = Vec::new();
    for depot in metadata.steam.distribution_depots.values() {
        let depot_dir = ctx
            .depot_dir(depot.depot_id)
            .ok_or_else(|| anyhow!("Depot {} has not been downloaded", depot.depot_id))?;
        let source_dir = managed_dir(&depot_dir)?;
        let assemblies = selection.select(&source_dir)?;
        tracing::info!(
            "Depot {}: {} assemblies in {source_dir}",
            depot.depot_id,
            assemblies.len()
        );

        units.push(DistributionUnit {
            id: depot.depot_id,
            source_dir,
            assemblies,
            output_root: ctx.package_directory(depot)?.join("ref"),
        });
    }

    let targets: Vec<_> = target
        .framework_targets
        .iter()
        .map(|t| ProcessTarget {
            folder: t.framework.folder_name(),
            excluded: supplied.get(&t.framework).cloned().unwrap_or_default(),
        })
        .collect();

    AssemblyProcessor::new(ctx.services.transform.as_ref(), &selection, &ctx.processed)
        .process(&units, &targets)
        .into_result()?;
    Ok(())
}
