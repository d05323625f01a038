//! The packaging pipeline: every task, wired into one graph.

mod assemblies;
mod packages;
mod prepare;
mod steam;

use crate::context::BuildContext;
use crate::engine::{GraphBuilder, Report, TaskGraph};
use crate::error::{BuildError, GraphError};

pub use packages::{DESCRIPTION_TRAILER, PROJECT_URL, is_outdated, write_outdated_build_ids};

pub const CLEAN: &str = "Clean";
pub const PREPARE: &str = "Prepare";
pub const FETCH_STEAM_APP_INFO: &str = "FetchSteamAppInfo";
pub const HANDLE_UNKNOWN_STEAM_BUILD: &str = "HandleUnknownSteamBuild";
pub const LIST_DEPLOYED_PACKAGE_VERSIONS: &str = "ListDeployedPackageVersions";
pub const CHECK_PACKAGE_VERSIONS_UP_TO_DATE: &str = "CheckPackageVersionsUpToDate";
pub const DOWNLOAD_NUGET_DEPENDENCIES: &str = "DownloadNuGetDependencies";
pub const CACHE_DEPENDENCY_ASSEMBLY_NAMES: &str = "CacheDependencyAssemblyNames";
pub const DOWNLOAD_DEPOTS: &str = "DownloadDepots";
pub const PROCESS_ASSEMBLIES: &str = "ProcessAssemblies";
pub const MAKE_PACKAGES: &str = "MakePackages";
pub const PUSH_NUGET_PACKAGES: &str = "PushNuGetPackages";
pub const DUMP_GAME_VERSIONS: &str = "DumpGameVersions";

/// Packaging work only happens while the target version's packages are not
/// known to be current.
fn needs_packaging(ctx: &BuildContext) -> bool {
    !matches!(ctx.target_up_to_date.get(), Ok(true))
}

/// Builds the pipeline graph.
pub fn build_graph() -> Result<TaskGraph<BuildContext>, GraphError> {
    let mut builder = GraphBuilder::<BuildContext>::new();

    builder
        .task(CLEAN)
        .describe("Remove previous package output")
        .run(prepare::clean);

    builder
        .task(PREPARE)
        .describe("Decode game metadata and known versions")
        .after([CLEAN])
        .run(prepare::prepare);

    builder
        .task(FETCH_STEAM_APP_INFO)
        .describe("Read live app info from Steam")
        .after([PREPARE])
        .run(steam::fetch_app_info);

    builder
        .task(HANDLE_UNKNOWN_STEAM_BUILD)
        .describe("Open a version entry pull request for an unknown public build")
        .after([FETCH_STEAM_APP_INFO])
        .run(steam::handle_unknown_build);

    builder
        .task(LIST_DEPLOYED_PACKAGE_VERSIONS)
        .describe("List published versions of every package")
        .after([PREPARE])
        .run(packages::list_deployed);

    builder
        .task(CHECK_PACKAGE_VERSIONS_UP_TO_DATE)
        .describe("Report versions whose packages are outdated")
        .after([HANDLE_UNKNOWN_STEAM_BUILD, LIST_DEPLOYED_PACKAGE_VERSIONS])
        .run(packages::check_up_to_date);

    builder
        .task(DOWNLOAD_NUGET_DEPENDENCIES)
        .describe("Download dependency packages of the target version")
        .after([PREPARE])
        .run(packages::download_dependencies);

    builder
        .task(CACHE_DEPENDENCY_ASSEMBLY_NAMES)
        .describe("Collect assembly names supplied by dependencies")
        .after([DOWNLOAD_NUGET_DEPENDENCIES])
        .run(packages::cache_dependency_assembly_names);

    builder
        .task(DOWNLOAD_DEPOTS)
        .describe("Download every distribution depot")
        .after([CHECK_PACKAGE_VERSIONS_UP_TO_DATE])
        .only_if(needs_packaging)
        .run(steam::download_depots);

    builder
        .task(PROCESS_ASSEMBLIES)
        .describe("Strip and publicize assemblies into package folders")
        .after([DOWNLOAD_DEPOTS, CACHE_DEPENDENCY_ASSEMBLY_NAMES])
        .only_if(needs_packaging)
        .run(assemblies::process_assemblies);

    builder
        .task(MAKE_PACKAGES)
        .describe("Pack one package per distribution depot")
        .after([LIST_DEPLOYED_PACKAGE_VERSIONS, PROCESS_ASSEMBLIES])
        .only_if(needs_packaging)
        .run(packages::make_packages);

    builder
        .task(PUSH_NUGET_PACKAGES)
        .describe("Push packed packages")
        .after([MAKE_PACKAGES])
        .only_if(needs_packaging)
        .run(packages::push_packages);

    builder
        .task(DUMP_GAME_VERSIONS)
        .describe("Rewrite every version entry file")
        .after([PREPARE])
        .run(prepare::dump_game_versions);

    builder.default_target([MAKE_PACKAGES]);
    builder.build()
}

/// Runs `target` and everything it depends on, failing if any task failed.
pub fn run(context: &BuildContext, target: &str) -> Result<Report, BuildError> {
    let graph = build_graph()?;
    graph.run(target, context)?.into_result()
}
