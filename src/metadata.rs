//! Typed view of a game's `metadata.json` and its `versions/*.json` entries.
//!
//! Everything is validated while decoding, so the rest of the pipeline never
//! has to deal with missing fields or malformed identifiers.

use std::collections::BTreeMap;
use std::fs;
use std::sync::LazyLock;

use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::MetadataError;
use crate::framework::Framework;

/// Values stored in lists on disk but keyed by one of their fields in memory.
pub trait Keyed {
    type Key: Ord + Copy + std::fmt::Display;

    fn key(&self) -> Self::Key;
}

/// (De)serializes a `BTreeMap<K, V>` as a list of `V`, rejecting duplicates.
mod entries {
    use std::collections::BTreeMap;

    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use super::Keyed;

    pub fn serialize<S, V>(map: &BTreeMap<V::Key, V>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        V: Keyed + Serialize,
    {
        serializer.collect_seq(map.values())
    }

    pub fn deserialize<'de, D, V>(deserializer: D) -> Result<BTreeMap<V::Key, V>, D::Error>
    where
        D: Deserializer<'de>,
        V: Keyed + Deserialize<'de>,
    {
        let mut map = BTreeMap::new();
        for value in Vec::<V>::deserialize(deserializer)? {
            let key = value.key();
            if map.insert(key, value).is_some() {
                return Err(D::Error::custom(format!("duplicate entry for id {key}")));
            }
        }
        Ok(map)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameMetadata {
    pub steam: SteamMetadata,
    pub process_settings: ProcessSettings,
    pub nuget: NuGetMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SteamMetadata {
    pub app_id: u32,
    #[serde(rename = "gameDistDepots", with = "entries")]
    pub distribution_depots: BTreeMap<u32, DistributionDepot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributionDepot {
    pub depot_id: u32,
    pub distribution_name: String,
    #[serde(default)]
    pub is_default: bool,
}

impl DistributionDepot {
    /// Appended to the package name to form this depot's package id.
    pub fn package_suffix(&self) -> String {
        if self.is_default {
            String::new()
        } else {
            format!(".{}", self.distribution_name)
        }
    }
}

impl Keyed for DistributionDepot {
    type Key = u32;

    fn key(&self) -> u32 {
        self.depot_id
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessSettings {
    #[serde(default)]
    pub exclude_assemblies: Vec<String>,
    #[serde(default, rename = "assembliesToPublicise")]
    pub assemblies_to_publicize: Vec<String>,
    #[serde(default, rename = "isIL2Cpp")]
    pub is_il2cpp: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NuGetMetadata {
    pub name: String,
    pub description: String,
    pub authors: Vec<String>,
}

impl GameMetadata {
    /// Package id for a distribution depot.
    pub fn package_id(&self, depot: &DistributionDepot) -> String {
        format!("{}{}", self.nuget.name, depot.package_suffix())
    }

    /// Package ids of every distribution depot, ordered by depot id.
    pub fn package_ids(&self) -> Vec<String> {
        self.steam
            .distribution_depots
            .values()
            .map(|depot| self.package_id(depot))
            .collect()
    }

    fn validate(&self) -> Result<(), String> {
        if self.nuget.name.trim().is_empty() {
            return Err("nuget.name must not be empty".into());
        }
        if self.nuget.authors.is_empty() {
            return Err("nuget.authors must list at least one author".into());
        }
        if self.steam.distribution_depots.is_empty() {
            return Err("steam.gameDistDepots must list at least one depot".into());
        }
        let defaults = self
            .steam
            .distribution_depots
            .values()
            .filter(|d| d.is_default)
            .count();
        if defaults > 1 {
            return Err(format!("{defaults} depots are marked as default, at most one may be"));
        }
        for depot in self.steam.distribution_depots.values() {
            if !depot.is_default && depot.distribution_name.trim().is_empty() {
                return Err(format!("depot {} needs a distributionName", depot.depot_id));
            }
        }
        for pattern in self
            .process_settings
            .exclude_assemblies
            .iter()
            .chain(&self.process_settings.assemblies_to_publicize)
        {
            glob::Pattern::new(pattern).map_err(|e| format!("pattern '{pattern}': {e}"))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepotVersion {
    pub depot_id: u32,
    #[serde(with = "manifest_id")]
    pub manifest_id: u64,
}

impl Keyed for DepotVersion {
    type Key = u32;

    fn key(&self) -> u32 {
        self.depot_id
    }
}

/// Manifest ids exceed what JSON numbers hold exactly in most tooling, so
/// they are accepted as either numbers or strings and written back as numbers.
mod manifest_id {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(id: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(*id)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Number(id) => Ok(id),
            Raw::Text(text) => text.trim().parse().map_err(D::Error::custom),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameworkTarget {
    #[serde(rename = "tfm")]
    pub framework: Framework,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
}

impl FrameworkTarget {
    pub fn without_dependencies(framework: Framework) -> Self {
        Self {
            framework,
            dependencies: Vec::new(),
        }
    }
}

/// One known build of the game.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionEntry {
    pub build_id: u32,
    pub time_updated: u64,
    /// Empty until a human fills it in on the version entry pull request.
    #[serde(default)]
    pub game_version: String,
    #[serde(with = "entries")]
    pub depots: BTreeMap<u32, DepotVersion>,
    pub framework_targets: Vec<FrameworkTarget>,
}

impl Keyed for VersionEntry {
    type Key = u32;

    fn key(&self) -> u32 {
        self.build_id
    }
}

impl VersionEntry {
    fn validate(&self, pattern: &Regex) -> Result<(), String> {
        let version = self.game_version.as_str();
        let dotted = pattern.is_match(version);
        if !version.is_empty() && !dotted && semver::Version::parse(version).is_err() {
            return Err(format!(
                "gameVersion '{version}' is neither a dotted number nor a semantic version"
            ));
        }
        let mut seen = Vec::new();
        for target in &self.framework_targets {
            if seen.contains(&target.framework) {
                return Err(format!("framework target {} is listed twice", target.framework));
            }
            seen.push(target.framework);
        }
        for dependency in self.framework_targets.iter().flat_map(|t| &t.dependencies) {
            if dependency.name.trim().is_empty() || dependency.version.trim().is_empty() {
                return Err("dependencies need both a name and a version".into());
            }
        }
        Ok(())
    }
}

/// All known builds of a game, keyed by build id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GameVersions(pub BTreeMap<u32, VersionEntry>);

impl GameVersions {
    pub fn get(&self, build_id: u32) -> Option<&VersionEntry> {
        self.0.get(&build_id)
    }

    pub fn contains(&self, build_id: u32) -> bool {
        self.0.contains_key(&build_id)
    }

    /// The most recently updated entry.
    pub fn latest(&self) -> Option<&VersionEntry> {
        self.0.values().max_by_key(|entry| (entry.time_updated, entry.build_id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &VersionEntry> {
        self.0.values()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

static GAME_VERSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d+(\.\d+){0,3}$").expect("Error compiling game version pattern")
});

fn read(path: &Utf8Path) -> Result<String, MetadataError> {
    fs::read_to_string(path).map_err(|e| MetadataError::Io(path.to_owned(), e))
}

/// Decodes and validates `<game dir>/metadata.json`.
pub fn load_metadata(game_dir: &Utf8Path) -> Result<GameMetadata, MetadataError> {
    let path = game_dir.join("metadata.json");
    let metadata: GameMetadata =
        serde_json::from_str(&read(&path)?).map_err(|e| MetadataError::Json(path.clone(), e))?;
    metadata
        .validate()
        .map_err(|reason| MetadataError::Invalid(path, reason))?;
    Ok(metadata)
}

/// Decodes and validates a single version entry file.
pub fn load_version(path: &Utf8Path) -> Result<VersionEntry, MetadataError> {
    let entry: VersionEntry = serde_json::from_str(&read(path)?)
        .map_err(|e| MetadataError::Json(path.to_owned(), e))?;
    entry
        .validate(&GAME_VERSION)
        .map_err(|reason| MetadataError::Invalid(path.to_owned(), reason))?;
    Ok(entry)
}

/// Decodes every `<game dir>/versions/*.json`. A missing directory means no
/// versions are known yet.
pub fn load_versions(game_dir: &Utf8Path) -> Result<GameVersions, MetadataError> {
    let dir = game_dir.join("versions");
    let mut versions = BTreeMap::new();
    if !dir.is_dir() {
        return Ok(GameVersions(versions));
    }

    let pattern = glob::Pattern::escape(dir.as_str()) + "/*.json";
    for path in glob::glob(&pattern)? {
        let path = Utf8PathBuf::try_from(path?)?;
        let entry = load_version(&path)?;
        if let Some(previous) = versions.insert(entry.build_id, entry) {
            return Err(MetadataError::Invalid(
                path,
                format!("build {} is described by more than one file", previous.build_id),
            ));
        }
    }

    Ok(GameVersions(versions))
}

/// Path of the file a version entry is stored in.
pub fn version_path(game_dir: &Utf8Path, build_id: u32) -> Utf8PathBuf {
    game_dir.join("versions").join(format!("{build_id}.json"))
}

/// Writes a version entry to `versions/<buildId>.json`, pretty printed.
pub fn write_version(game_dir: &Utf8Path, entry: &VersionEntry) -> Result<Utf8PathBuf, MetadataError> {
    let path = version_path(game_dir, entry.build_id);
    let dir = game_dir.join("versions");
    fs::create_dir_all(&dir).map_err(|e| MetadataError::Io(dir, e))?;

    let mut json =
        serde_json::to_string_pretty(entry).map_err(|e| MetadataError::Json(path.clone(), e))?;
    json.push('\n');
    fs::write(&path, json).map_err(|e| MetadataError::Io(path.clone(), e))?;
    Ok(path)
}
