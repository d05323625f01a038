//! Package registry access: reading what is published, fetching dependency
//! packages, and producing and pushing our own packages.

mod package;
mod registry;

use std::collections::BTreeSet;
use std::sync::LazyLock;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, FixedOffset};
use regex::Regex;

use crate::framework::Framework;
use crate::metadata::Dependency;

pub use package::{PackageSpec, assembly_names_in, extract_package, pack};
pub use registry::NuGet;

pub const NUGET_ORG: &str = "https://api.nuget.org/v3/index.json";
pub const BEPINEX_FEED: &str = "https://nuget.bepinex.dev/v3/index.json";

/// Marks package versions produced by this tool, as in `1.2.3-ngd.4`.
pub const VERSION_DISCRIMINATOR: &str = "ngd";

/// A version of a package as listed by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedVersion {
    pub id: String,
    pub version: String,
    pub published: Option<DateTime<FixedOffset>>,
}

/// A dependency package unpacked on local disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalPackage {
    pub id: String,
    pub version: String,
    pub root: Utf8PathBuf,
}

/// Read access to a package registry.
pub trait PackageRegistry: Send + Sync {
    /// Every listed version of `package_id`. An unknown package has none.
    fn published_versions(&self, package_id: &str) -> anyhow::Result<Vec<PublishedVersion>>;

    /// Makes `dependency` available on disk.
    fn download(&self, dependency: &Dependency) -> anyhow::Result<LocalPackage>;

    /// File names of the assemblies `package` supplies to a project
    /// targeting `framework`.
    fn assembly_names(
        &self,
        package: &LocalPackage,
        framework: &Framework,
    ) -> anyhow::Result<BTreeSet<String>> {
        assembly_names_in(&package.root, framework)
    }
}

/// Produces and publishes packages.
pub trait PackagePublisher: Send + Sync {
    /// Packs `source_dir` into a package archive at `output`.
    fn pack(&self, spec: &PackageSpec, source_dir: &Utf8Path, output: &Utf8Path) -> anyhow::Result<()> {
        pack(spec, source_dir, output)
    }

    /// Pushes a package archive. Pushing a version that already exists is
    /// not an error.
    fn push(&self, package: &Utf8Path) -> anyhow::Result<()>;
}

/// Next revision number for `<base>-ngd.<n>` versions of `package_id`: one
/// more than the highest published, or zero.
pub fn next_revision<'a>(
    versions: impl IntoIterator<Item = &'a PublishedVersion>,
    package_id: &str,
    base: &str,
) -> u32 {
    let pattern = format!(
        r"^{}-{}\.(\d+)$",
        regex::escape(base),
        VERSION_DISCRIMINATOR
    );
    let Ok(pattern) = Regex::new(&pattern) else {
        return 0;
    };

    versions
        .into_iter()
        .filter(|v| v.id.eq_ignore_ascii_case(package_id))
        .filter_map(|v| pattern.captures(&v.version))
        .filter_map(|c| c[1].parse::<u32>().ok())
        .max()
        .map_or(0, |max| max + 1)
}

/// Formats a version produced by this tool.
pub fn package_version(base: &str, revision: u32) -> String {
    format!("{base}-{VERSION_DISCRIMINATOR}.{revision}")
}

static UNLISTED_YEAR: LazyLock<DateTime<FixedOffset>> = LazyLock::new(|| {
    DateTime::parse_from_rfc3339("1901-01-01T00:00:00+00:00").unwrap_or_default()
});

/// The registry marks unlisted versions with a publish date in 1900.
pub(crate) fn is_unlisted(published: Option<&DateTime<FixedOffset>>) -> bool {
    published.is_some_and(|p| *p < *UNLISTED_YEAR)
}
