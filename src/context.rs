//! State shared by every task of a pipeline run.
//!
//! Values produced by a single task live in write-once [`Slot`]s and are read
//! by tasks ordered after their producer. Values that concurrent branches
//! build up together sit behind a lock or in the [`WorkLedger`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};

use crate::error::{ConfigError, ContextError};
use crate::framework::Framework;
use crate::git::{GitCli, VersionControl};
use crate::ledger::WorkLedger;
use crate::metadata::{DistributionDepot, GameMetadata, GameVersions, VersionEntry};
use crate::nuget::{LocalPackage, NuGet, PackagePublisher, PackageRegistry, PublishedVersion};
use crate::processor::{AssemblyTransform, Publicizer};
use crate::steam::{AppInfo, ContentClient, SteamCmd};

/// Everything a run is configured with.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Folder name of the game under `Games/`.
    pub game: String,
    /// Build to package, when packaging.
    pub build_id: Option<u32>,
    pub steam_username: String,
    pub nuget_api_key: Option<String>,
    /// Root of the metadata repository.
    pub root: Utf8PathBuf,
    /// File receiving step outputs when running on GitHub Actions.
    pub github_output: Option<Utf8PathBuf>,
}

impl Settings {
    pub fn new(game: impl Into<String>, root: impl Into<Utf8PathBuf>) -> Self {
        Self {
            game: game.into(),
            build_id: None,
            steam_username: "anonymous".into(),
            nuget_api_key: None,
            root: root.into(),
            github_output: None,
        }
    }

    pub fn game_directory(&self) -> Utf8PathBuf {
        self.root.join("Games").join(&self.game)
    }

    /// The game directory, once the game is known to be a single folder name
    /// that exists under `Games/`.
    pub fn checked_game_directory(&self) -> Result<Utf8PathBuf, ConfigError> {
        let game = self.game.as_str();
        let mut components = Utf8Path::new(game).components();
        let single = matches!(
            (components.next(), components.next()),
            (Some(Utf8Component::Normal(name)), None) if name == game
        );
        if !single || game.contains(['/', '\\']) {
            return Err(ConfigError::InvalidGame(self.game.clone()));
        }

        let dir = self.game_directory();
        if !dir.is_dir() {
            return Err(ConfigError::MissingGame(dir));
        }
        Ok(dir)
    }

    pub fn nupkgs_directory(&self) -> Utf8PathBuf {
        self.game_directory().join("nupkgs")
    }

    pub fn nuget_cache(&self) -> Utf8PathBuf {
        self.root.join(".cache").join("nuget")
    }
}

/// Handles to the external collaborators.
#[derive(Clone)]
pub struct Services {
    pub content: Arc<dyn ContentClient>,
    pub registry: Arc<dyn PackageRegistry>,
    pub publisher: Arc<dyn PackagePublisher>,
    pub vcs: Arc<dyn VersionControl>,
    pub transform: Arc<dyn AssemblyTransform>,
}

impl Services {
    /// SteamCMD, nuget.org, git and the assembly publicizer, configured from
    /// `settings`.
    pub fn standard(settings: &Settings) -> anyhow::Result<Self> {
        let nuget = Arc::new(NuGet::new(
            settings.nuget_cache(),
            settings.nuget_api_key.clone(),
        )?);
        Ok(Self {
            content: Arc::new(SteamCmd::new(&settings.steam_username)),
            registry: nuget.clone(),
            publisher: nuget,
            vcs: Arc::new(GitCli::new(settings.root.clone())),
            transform: Arc::new(Publicizer::new()),
        })
    }
}

/// A value produced once during a run.
pub struct Slot<T> {
    name: &'static str,
    cell: OnceLock<T>,
}

impl<T> Slot<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            cell: OnceLock::new(),
        }
    }

    pub fn set(&self, value: T) -> Result<(), ContextError> {
        self.cell
            .set(value)
            .map_err(|_| ContextError::AlreadySet(self.name))
    }

    pub fn get(&self) -> Result<&T, ContextError> {
        self.cell.get().ok_or(ContextError::Unset(self.name))
    }

    pub fn is_set(&self) -> bool {
        self.cell.get().is_some()
    }
}

pub struct BuildContext {
    pub settings: Settings,
    pub services: Services,

    pub metadata: Slot<GameMetadata>,
    pub versions: Slot<GameVersions>,
    pub app_info: Slot<AppInfo>,
    /// Listed versions per package id.
    pub deployed: Slot<BTreeMap<String, Vec<PublishedVersion>>>,
    pub target_up_to_date: Slot<bool>,
    pub dependency_packages: Slot<Vec<LocalPackage>>,
    /// Per framework, assembly names supplied by that framework's dependencies.
    pub dependency_assemblies: Slot<BTreeMap<Framework, BTreeSet<String>>>,

    /// Downloaded directory per depot id, filled by concurrent downloads.
    pub depot_dirs: Mutex<BTreeMap<u32, Utf8PathBuf>>,
    /// One entry per source assembly processed during this run.
    pub processed: WorkLedger<Utf8PathBuf>,
}

impl BuildContext {
    pub fn new(settings: Settings, services: Services) -> Self {
        Self {
            settings,
            services,
            metadata: Slot::new("game metadata"),
            versions: Slot::new("game versions"),
            app_info: Slot::new("app info"),
            deployed: Slot::new("deployed package versions"),
            target_up_to_date: Slot::new("target version up to date"),
            dependency_packages: Slot::new("dependency packages"),
            dependency_assemblies: Slot::new("dependency assembly names"),
            depot_dirs: Mutex::new(BTreeMap::new()),
            processed: WorkLedger::new(),
        }
    }

    pub fn game_directory(&self) -> Utf8PathBuf {
        self.settings.game_directory()
    }

    /// The version entry of the requested build.
    pub fn target_version(&self) -> anyhow::Result<&VersionEntry> {
        let build_id = self.settings.build_id.ok_or(ConfigError::MissingBuildId)?;
        let versions = self.versions.get()?;
        Ok(versions
            .get(build_id)
            .ok_or(ConfigError::UnknownBuild(build_id))?)
    }

    pub fn package_id(&self, depot: &DistributionDepot) -> anyhow::Result<String> {
        Ok(self.metadata.get()?.package_id(depot))
    }

    /// Folder the `ref/` tree of a depot's package is assembled in.
    pub fn package_directory(&self, depot: &DistributionDepot) -> anyhow::Result<Utf8PathBuf> {
        Ok(self.settings.nupkgs_directory().join(self.package_id(depot)?))
    }

    pub fn record_depot_dir(&self, depot_id: u32, dir: &Utf8Path) {
        self.depot_dirs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(depot_id, dir.to_owned());
    }

    pub fn depot_dir(&self, depot_id: u32) -> Option<Utf8PathBuf> {
        self.depot_dirs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&depot_id)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_is_write_once() {
        let slot = Slot::new("answer");
        assert!(matches!(slot.get(), Err(ContextError::Unset("answer"))));

        slot.set(42).unwrap();
        assert!(matches!(slot.set(43), Err(ContextError::AlreadySet("answer"))));
        assert_eq!(*slot.get().unwrap(), 42);
        assert!(slot.is_set());
    }

    #[test]
    fn test_settings_layout() {
        let settings = Settings::new("LethalCompany", "/repo");

        assert_eq!(settings.game_directory(), "/repo/Games/LethalCompany");
        assert_eq!(settings.nupkgs_directory(), "/repo/Games/LethalCompany/nupkgs");
        assert_eq!(settings.nuget_cache(), "/repo/.cache/nuget");
        assert_eq!(settings.steam_username, "anonymous");
    }

    #[test]
    fn test_game_must_be_an_existing_folder_name() {
        let tmp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(tmp.path().to_path_buf()).unwrap();
        std::fs::create_dir_all(root.join("Games/Game")).unwrap();
        let outside = root.join("Games/Game").to_string();

        let checked = |game: &str| Settings::new(game, root.clone()).checked_game_directory();

        assert_eq!(checked("Game").unwrap(), root.join("Games/Game"));
        for game in ["", ".", "..", "../Games/Game", "Games/Game", "Game/", "a\\b", outside.as_str()] {
            assert!(matches!(checked(game), Err(ConfigError::InvalidGame(_))), "{game:?}");
        }
        assert!(matches!(checked("Other"), Err(ConfigError::MissingGame(_))));
    }
}
