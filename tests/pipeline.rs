use std::collections::BTreeMap;
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, FixedOffset};

use dehumidifier::engine::{Failure, NodeState, Report};
use dehumidifier::git::{PullRequest, VersionControl};
use dehumidifier::metadata::{Dependency, load_version};
use dehumidifier::nuget::{LocalPackage, PackagePublisher, PackageRegistry, PublishedVersion, extract_package};
use dehumidifier::pipeline::{self, *};
use dehumidifier::processor::{AssemblyTransform, TransformKind};
use dehumidifier::steam::{AppBranch, AppDepot, AppInfo, ContentClient};
use dehumidifier::{BuildContext, BuildError, DEFAULT_TARGET, Services, Settings};

const WINDOWS: u32 = 1966721;
const LINUX: u32 = 1966722;

const METADATA: &str = r#"{
  "steam": {
    "appId": 1966720,
    "gameDistDepots": [
      { "depotId": 1966721, "distributionName": "Windows", "isDefault": true },
      { "depotId": 1966722, "distributionName": "Linux" }
    ]
  },
  "processSettings": {
    "excludeAssemblies": ["System.*"],
    "assembliesToPublicise": ["Assembly-CSharp.dll"]
  },
  "nuget": {
    "name": "Game.GameLibs",
    "description": "Game assemblies",
    "authors": ["someone"]
  }
}"#;

const VERSION_100: &str = r#"{
  "buildId": 100,
  "timeUpdated": 1000,
  "gameVersion": "45",
  "depots": [
    { "depotId": 1966721, "manifestId": "111" },
    { "depotId": 1966722, "manifestId": 222 }
  ],
  "frameworkTargets": [
    {
      "tfm": "netstandard2.1",
      "dependencies": [{ "name": "UnityEngine.Modules", "version": "2022.3.9" }]
    }
  ]
}"#;

fn date(s: &str) -> DateTime<FixedOffset> {
    DateTime::parse_from_rfc3339(s).unwrap()
}

fn touch(path: &Utf8Path, content: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

struct FakeSteam {
    root: Utf8PathBuf,
    build_id: u32,
    time_updated: u64,
    downloads: Mutex<Vec<(u32, u64)>>,
}

impl ContentClient for FakeSteam {
    fn app_info(&self, app_id: u32) -> anyhow::Result<AppInfo> {
        let branch = AppBranch {
            name: "public".into(),
            build_id: self.build_id,
            time_updated: self.time_updated,
        };
        let depots = [(WINDOWS, 311), (LINUX, 322)]
            .into_iter()
            .map(|(depot_id, manifest)| {
                let manifests = BTreeMap::from([("public".to_string(), manifest)]);
                (depot_id, AppDepot { depot_id, manifests })
            })
            .collect();

        Ok(AppInfo {
            app_id,
            name: "Game".into(),
            depots,
            branches: BTreeMap::from([("public".to_string(), branch)]),
        })
    }

    fn download_depot(&self, _app_id: u32, depot_id: u32, manifest_id: u64) -> anyhow::Result<Utf8PathBuf> {
        self.downloads.lock().unwrap().push((depot_id, manifest_id));

        let dir = self.root.join("depots").join(depot_id.to_string());
        let executable = if depot_id == WINDOWS { "Game.exe" } else { "Game.x86_64" };
        touch(&dir.join(executable), "");
        touch(&dir.join("UnityCrashHandler64.exe"), "");
        for dll in ["Assembly-CSharp.dll", "UnityEngine.UI.dll", "System.Core.dll"] {
            touch(&dir.join("Game_Data/Managed").join(dll), dll);
        }
        Ok(dir)
    }
}

struct FakeRegistry {
    root: Utf8PathBuf,
    deployed: BTreeMap<String, Vec<PublishedVersion>>,
}

impl PackageRegistry for FakeRegistry {
    fn published_versions(&self, package_id: &str) -> anyhow::Result<Vec<PublishedVersion>> {
        Ok(self.deployed.get(package_id).cloned().unwrap_or_default())
    }

    fn download(&self, dependency: &Dependency) -> anyhow::Result<LocalPackage> {
        let root = self
            .root
            .join("packages")
            .join(dependency.name.to_lowercase())
            .join(&dependency.version);
        touch(&root.join("lib/netstandard2.0/UnityEngine.UI.dll"), "");
        Ok(LocalPackage {
            id: dependency.name.clone(),
            version: dependency.version.clone(),
            root,
        })
    }
}

#[derive(Default)]
struct FakePublisher {
    pushed: Mutex<Vec<Utf8PathBuf>>,
}

impl PackagePublisher for FakePublisher {
    fn push(&self, package: &Utf8Path) -> anyhow::Result<()> {
        self.pushed.lock().unwrap().push(package.to_owned());
        Ok(())
    }
}

#[derive(Default)]
struct FakeVcs {
    branch_exists: bool,
    calls: Mutex<Vec<String>>,
}

impl FakeVcs {
    fn record(&self, call: String) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push(call);
        Ok(())
    }
}

impl VersionControl for FakeVcs {
    fn fetch(&self) -> anyhow::Result<()> {
        self.record("fetch".into())
    }

    fn remote_branch_exists(&self, _branch: &str) -> anyhow::Result<bool> {
        Ok(self.branch_exists)
    }

    fn create_branch(&self, branch: &str) -> anyhow::Result<()> {
        self.record(format!("branch {branch}"))
    }

    fn stage(&self, path: &Utf8Path) -> anyhow::Result<()> {
        self.record(format!("stage {}", path.file_name().unwrap_or_default()))
    }

    fn commit(&self, message: &str) -> anyhow::Result<()> {
        self.record(format!("commit {message}"))
    }

    fn push(&self, branch: &str) -> anyhow::Result<()> {
        self.record(format!("push {branch}"))
    }

    fn open_pull_request(&self, request: &PullRequest) -> anyhow::Result<()> {
        self.record(format!("pr {}", request.title))
    }

    fn last_version_change(&self) -> anyhow::Result<DateTime<FixedOffset>> {
        Ok(date("2024-03-01T00:00:00+00:00"))
    }
}

#[derive(Default)]
struct FakeTransform {
    runs: AtomicUsize,
}

impl AssemblyTransform for FakeTransform {
    fn transform(&self, kind: TransformKind, source: &Utf8Path, output: &Utf8Path) -> anyhow::Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let content = fs::read_to_string(source)?;
        fs::write(output, format!("{kind:?}:{content}"))?;
        Ok(())
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    root: Utf8PathBuf,
    steam: Arc<FakeSteam>,
    publisher: Arc<FakePublisher>,
    vcs: Arc<FakeVcs>,
    transform: Arc<FakeTransform>,
    registry: Arc<FakeRegistry>,
}

impl Fixture {
    fn new(public_build: u32, deployed: BTreeMap<String, Vec<PublishedVersion>>, branch_exists: bool) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        let game = root.join("Games/Game");
        touch(&game.join("metadata.json"), METADATA);
        touch(&game.join("versions/100.json"), VERSION_100);

        Self {
            steam: Arc::new(FakeSteam {
                root: root.join("steam"),
                build_id: public_build,
                time_updated: 1000,
                downloads: Mutex::new(Vec::new()),
            }),
            registry: Arc::new(FakeRegistry {
                root: root.join("nuget"),
                deployed,
            }),
            publisher: Arc::default(),
            vcs: Arc::new(FakeVcs {
                branch_exists,
                ..FakeVcs::default()
            }),
            transform: Arc::default(),
            root,
            _dir: dir,
        }
    }

    fn context(&self, build_id: Option<u32>) -> BuildContext {
        self.context_for("Game", build_id)
    }

    fn context_for(&self, game: &str, build_id: Option<u32>) -> BuildContext {
        let mut settings = Settings::new(game, self.root.clone());
        settings.build_id = build_id;
        settings.github_output = Some(self.root.join("github_output"));

        let services = Services {
            content: self.steam.clone(),
            registry: self.registry.clone(),
            publisher: self.publisher.clone(),
            vcs: self.vcs.clone(),
            transform: self.transform.clone(),
        };
        BuildContext::new(settings, services)
    }

    fn game_dir(&self) -> Utf8PathBuf {
        self.root.join("Games/Game")
    }
}

fn deployed_now() -> BTreeMap<String, Vec<PublishedVersion>> {
    ["Game.GameLibs", "Game.GameLibs.Linux"]
        .into_iter()
        .map(|id| {
            let version = PublishedVersion {
                id: id.into(),
                version: "45-ngd.0".into(),
                published: Some(date("2024-04-01T00:00:00+00:00")),
            };
            (id.to_string(), vec![version])
        })
        .collect()
}

#[test]
fn test_default_target_builds_packages() {
    let fixture = Fixture::new(100, BTreeMap::new(), false);
    let context = fixture.context(Some(100));

    let report = pipeline::run(&context, DEFAULT_TARGET).unwrap();

    assert!(report.is_success());
    assert!(matches!(report.state(DEFAULT_TARGET), Some(NodeState::Succeeded)));
    assert!(report.state(PUSH_NUGET_PACKAGES).is_none());

    let mut downloads = fixture.steam.downloads.lock().unwrap().clone();
    downloads.sort();
    assert_eq!(downloads, vec![(WINDOWS, 111), (LINUX, 222)]);

    // UnityEngine.UI comes from the dependency package, System.Core is excluded
    assert_eq!(fixture.transform.runs.load(Ordering::SeqCst), 2);

    let nupkgs = fixture.game_dir().join("nupkgs");
    let windows_ref = nupkgs.join("Game.GameLibs/ref/netstandard2.1");
    assert_eq!(
        fs::read_to_string(windows_ref.join("Assembly-CSharp.dll")).unwrap(),
        "Publicize:Assembly-CSharp.dll"
    );
    assert!(!windows_ref.join("UnityEngine.UI.dll").exists());
    assert!(!windows_ref.join("System.Core.dll").exists());
    assert!(nupkgs.join("Game.GameLibs.Linux/ref/netstandard2.1/Assembly-CSharp.dll").is_file());

    let unpacked = fixture.root.join("unpacked");
    let bytes = fs::read(nupkgs.join("Game.GameLibs.Linux.nupkg")).unwrap();
    extract_package(&bytes, &unpacked).unwrap();
    let nuspec = fs::read_to_string(unpacked.join("Game.GameLibs.Linux.nuspec")).unwrap();
    assert!(nuspec.contains("<version>45-ngd.0</version>"));
    assert!(nuspec.contains("Generated and managed by GameLib Dehumidifier."));
    assert!(nuspec.contains("UnityEngine.Modules"));
    assert!(nupkgs.join("Game.GameLibs.nupkg").is_file());

    let output = fs::read_to_string(fixture.root.join("github_output")).unwrap();
    assert_eq!(output, "outdated-version-buildIds<<EOF\n[100]\nEOF\n");
    assert!(fixture.vcs.calls.lock().unwrap().is_empty());
}

#[test]
fn test_push_target_pushes_every_package() {
    let fixture = Fixture::new(100, BTreeMap::new(), false);
    let context = fixture.context(Some(100));

    pipeline::run(&context, PUSH_NUGET_PACKAGES).unwrap();

    let mut pushed: Vec<_> = fixture
        .publisher
        .pushed
        .lock()
        .unwrap()
        .iter()
        .map(|p| p.file_name().unwrap().to_string())
        .collect();
    pushed.sort();
    assert_eq!(pushed, vec!["Game.GameLibs.Linux.nupkg", "Game.GameLibs.nupkg"]);
}

#[test]
fn test_up_to_date_build_skips_packaging() {
    let fixture = Fixture::new(100, deployed_now(), false);
    let context = fixture.context(Some(100));

    let report = pipeline::run(&context, DEFAULT_TARGET).unwrap();

    assert!(report.is_success());
    for task in [DOWNLOAD_DEPOTS, PROCESS_ASSEMBLIES, MAKE_PACKAGES] {
        assert!(matches!(report.state(task), Some(NodeState::Skipped)), "{task}");
    }
    assert!(fixture.steam.downloads.lock().unwrap().is_empty());
    assert!(!fixture.game_dir().join("nupkgs").exists());

    let output = fs::read_to_string(fixture.root.join("github_output")).unwrap();
    assert_eq!(output, "outdated-version-buildIds<<EOF\n[]\nEOF\n");
}

#[test]
fn test_unknown_build_opens_pull_request() {
    let fixture = Fixture::new(200, BTreeMap::new(), false);
    let context = fixture.context(None);

    pipeline::run(&context, HANDLE_UNKNOWN_STEAM_BUILD).unwrap();

    let entry = load_version(&fixture.game_dir().join("versions/200.json")).unwrap();
    assert_eq!(entry.build_id, 200);
    assert_eq!(entry.game_version, "");
    assert_eq!(entry.depots[&WINDOWS].manifest_id, 311);
    assert_eq!(entry.depots[&LINUX].manifest_id, 322);
    assert_eq!(entry.framework_targets.len(), 1);
    assert_eq!(entry.framework_targets[0].framework.folder_name(), "netstandard2.1");

    assert_eq!(
        *fixture.vcs.calls.lock().unwrap(),
        vec![
            "fetch".to_string(),
            "branch Game-build-200".to_string(),
            "stage versions".to_string(),
            "commit add game version entry for Game build 200".to_string(),
            "push Game-build-200".to_string(),
            "pr [Game] Version entry - Build 200".to_string(),
        ]
    );
}

#[test]
fn test_existing_version_branch_fails() {
    let fixture = Fixture::new(200, BTreeMap::new(), true);
    let context = fixture.context(None);

    let error = pipeline::run(&context, HANDLE_UNKNOWN_STEAM_BUILD).unwrap_err();

    match error {
        BuildError::Task(task, cause) => {
            assert_eq!(task, HANDLE_UNKNOWN_STEAM_BUILD);
            assert!(cause.to_string().contains("already exists"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!fixture.game_dir().join("versions/200.json").exists());
}

#[test]
fn test_missing_build_id_fails_packaging() {
    let fixture = Fixture::new(100, BTreeMap::new(), false);
    let context = fixture.context(None);

    let error = pipeline::run(&context, DEFAULT_TARGET).unwrap_err();

    match error {
        BuildError::Task(_, cause) => {
            let message = format!("{:#}", cause.inner());
            assert!(message.contains("Build ID not provided."), "{message}");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(fixture.steam.downloads.lock().unwrap().is_empty());
}

#[test]
fn test_dump_rewrites_version_files() {
    let fixture = Fixture::new(100, BTreeMap::new(), false);
    let context = fixture.context(None);

    pipeline::run(&context, DUMP_GAME_VERSIONS).unwrap();

    let written = fs::read_to_string(fixture.game_dir().join("versions/100.json")).unwrap();
    assert!(written.contains("\"manifestId\": 111"));
    assert!(written.ends_with("}\n"));
}

/// Runs `target` and keeps the report even when tasks fail.
fn report_for(context: &BuildContext, target: &str) -> Report {
    pipeline::build_graph().unwrap().run(target, context).unwrap()
}

fn assert_fails_at_clean(report: &Report, expected: &str) {
    match report.state(CLEAN) {
        Some(NodeState::Failed(Failure::Error(error))) => {
            assert!(error.to_string().contains(expected), "{error}");
        }
        other => panic!("Clean ended as {other:?}"),
    }
    for (name, state) in &report.states {
        if name != CLEAN {
            assert!(
                matches!(state, NodeState::Failed(Failure::Upstream(origin)) if origin == CLEAN),
                "{name} ended as {state:?}"
            );
        }
    }
}

#[test]
fn test_invalid_game_names_fail_before_any_work() {
    let fixture = Fixture::new(100, BTreeMap::new(), false);
    fs::create_dir_all(fixture.root.join("nupkgs")).unwrap();

    for game in ["", "..", "../Games/Game", "Games/Game", "Game/.."] {
        let context = fixture.context_for(game, Some(100));

        let report = report_for(&context, DEFAULT_TARGET);

        assert_fails_at_clean(&report, "is not a game folder name");
        assert!(fixture.root.join("nupkgs").is_dir(), "{game:?}");
    }
    assert!(fixture.steam.downloads.lock().unwrap().is_empty());
}

#[test]
fn test_absolute_game_path_is_never_cleaned() {
    let fixture = Fixture::new(100, BTreeMap::new(), false);
    let outside = tempfile::tempdir().unwrap();
    let elsewhere = Utf8PathBuf::try_from(outside.path().to_path_buf()).unwrap();
    touch(&elsewhere.join("nupkgs/keep.txt"), "keep");
    let context = fixture.context_for(elsewhere.as_str(), None);

    let error = pipeline::run(&context, CLEAN).unwrap_err();

    assert!(matches!(error, BuildError::Task(ref task, _) if task == CLEAN), "{error}");
    assert!(elsewhere.join("nupkgs/keep.txt").is_file());
}

#[test]
fn test_missing_game_directory_fails() {
    let fixture = Fixture::new(100, BTreeMap::new(), false);
    let context = fixture.context_for("OtherGame", Some(100));

    let report = report_for(&context, DEFAULT_TARGET);

    assert_fails_at_clean(&report, "does not exist");
    assert!(!report.is_success());
}
