//! Stripping and publicizing game assemblies, then fanning the results out to
//! every framework folder of every package that needs them.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;

use anyhow::{Context, anyhow};
use camino::{Utf8Path, Utf8PathBuf};
use rayon::iter::{IntoParallelIterator, ParallelIterator};

use crate::core::Hash32;
use crate::error::SharedError;
use crate::ledger::{Execution, WorkLedger};
use crate::process::Tool;

/// Suffix of every processed assembly. Files already carrying it are outputs
/// of an earlier run and never inputs.
pub const PROCESSED_SUFFIX: &str = "-stubs.dll";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformKind {
    /// Strip method bodies and make every member public.
    Publicize,
    /// Strip method bodies only.
    StripOnly,
}

/// Rewrites one assembly into a reference assembly.
pub trait AssemblyTransform: Send + Sync {
    fn transform(&self, kind: TransformKind, source: &Utf8Path, output: &Utf8Path) -> anyhow::Result<()>;
}

/// [`AssemblyTransform`] through the `assembly-publicizer` tool.
#[derive(Debug, Clone)]
pub struct Publicizer {
    program: String,
}

impl Publicizer {
    pub fn new() -> Self {
        Self::with_program("assembly-publicizer")
    }

    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for Publicizer {
    fn default() -> Self {
        Self::new()
    }
}

impl AssemblyTransform for Publicizer {
    fn transform(&self, kind: TransformKind, source: &Utf8Path, output: &Utf8Path) -> anyhow::Result<()> {
        let mode = match kind {
            TransformKind::Publicize => "--strip",
            TransformKind::StripOnly => "--strip-only",
        };
        Tool::new("AssemblyPublicizer", &self.program)
            .args([source.as_str(), "--output", output.as_str(), mode])
            .run()?;
        Ok(())
    }
}

/// Path the processed form of `source` is written to, next to it.
pub fn processed_path(source: &Utf8Path) -> Utf8PathBuf {
    let stem = source.file_stem().unwrap_or_default();
    source.with_file_name(format!("{stem}{PROCESSED_SUFFIX}"))
}

pub fn is_processed(file_name: &str) -> bool {
    file_name.ends_with(PROCESSED_SUFFIX)
}

fn executable<'a>(entries: &'a [(String, bool)], extension: &str) -> Option<&'a str> {
    entries
        .iter()
        .filter(|(name, is_dir)| !is_dir && !name.starts_with("UnityCrashHandler"))
        .find_map(|(name, _)| name.strip_suffix(extension))
}

/// Finds the `Managed` assembly folder of a Unity game distribution.
///
/// Tries a Windows executable, then a Linux one, then a macOS app bundle.
/// Crash handler executables are ignored.
pub fn managed_dir(depot_dir: &Utf8Path) -> anyhow::Result<Utf8PathBuf> {
    let mut entries = Vec::new();
    for entry in depot_dir
        .read_dir_utf8()
        .with_context(|| format!("Couldn't read depot directory '{depot_dir}'"))?
    {
        let entry = entry?;
        entries.push((entry.file_name().to_string(), entry.file_type()?.is_dir()));
    }
    entries.sort();

    if let Some(stem) =
        executable(&entries, ".exe").or_else(|| executable(&entries, ".x86_64"))
    {
        return Ok(depot_dir.join(format!("{stem}_Data")).join("Managed"));
    }

    if let Some((bundle, _)) = entries.iter().find(|(name, _)| name.ends_with(".app")) {
        return Ok(depot_dir
            .join(bundle)
            .join("Contents")
            .join("Resources")
            .join("Data")
            .join("Managed"));
    }

    Err(anyhow!(
        "Unsupported distribution platform - couldn't find executable/app bundle."
    ))
}

/// Include and exclude rules for which files of a `Managed` folder are
/// processed, and which of those get publicized.
#[derive(Debug, Clone, Default)]
pub struct AssemblySelection {
    exclude: Vec<glob::Pattern>,
    publicize: Vec<glob::Pattern>,
}

impl AssemblySelection {
    pub fn new<S: AsRef<str>>(exclude: &[S], publicize: &[S]) -> Result<Self, glob::PatternError> {
        let compile = |patterns: &[S]| {
            patterns
                .iter()
                .map(|p| glob::Pattern::new(p.as_ref()))
                .collect::<Result<Vec<_>, _>>()
        };
        Ok(Self {
            exclude: compile(exclude)?,
            publicize: compile(publicize)?,
        })
    }

    /// Relative paths of the `*.dll` files directly in `dir` that no exclude
    /// pattern matches, sorted.
    pub fn select(&self, dir: &Utf8Path) -> anyhow::Result<Vec<Utf8PathBuf>> {
        let mut selected = Vec::new();
        for entry in dir
            .read_dir_utf8()
            .with_context(|| format!("Couldn't read assembly directory '{dir}'"))?
        {
            let entry = entry?;
            let name = entry.file_name();
            if !entry.file_type()?.is_file() || !name.ends_with(".dll") {
                continue;
            }
            if self.exclude.iter().any(|p| p.matches(name)) {
                continue;
            }
            selected.push(Utf8PathBuf::from(name));
        }
        selected.sort();
        Ok(selected)
    }

    pub fn kind(&self, relative: &Utf8Path) -> TransformKind {
        if self.publicize.iter().any(|p| p.matches(relative.as_str())) {
            TransformKind::Publicize
        } else {
            TransformKind::StripOnly
        }
    }
}

/// One source directory of binaries and the package folder its outputs go to.
#[derive(Debug, Clone)]
pub struct DistributionUnit {
    pub id: u32,
    pub source_dir: Utf8PathBuf,
    /// Paths relative to `source_dir`.
    pub assemblies: Vec<Utf8PathBuf>,
    /// Outputs land in `<output_root>/<target folder>/`.
    pub output_root: Utf8PathBuf,
}

/// One framework folder, minus the assemblies its dependencies provide.
#[derive(Debug, Clone)]
pub struct ProcessTarget {
    pub folder: String,
    pub excluded: BTreeSet<String>,
}

#[derive(Debug, Default)]
pub struct ProcessReport {
    pub copies: usize,
    /// Transforms that actually ran.
    pub transforms: usize,
    /// Copies served by a transform somebody else ran or an earlier run left.
    pub reused: usize,
    /// Copies skipped because a dependency provides the assembly.
    pub excluded: usize,
    /// Copy destination and the failure that prevented it.
    pub failures: Vec<(Utf8PathBuf, SharedError)>,
    /// Fingerprint of every copied file.
    pub hashes: BTreeMap<Utf8PathBuf, Hash32>,
}

impl ProcessReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Fails with the first failure when any copy failed.
    pub fn into_result(self) -> anyhow::Result<Self> {
        match self.failures.first() {
            None => Ok(self),
            Some((path, error)) => Err(anyhow!(
                "{} of {} assembly copies failed, first was '{path}': {error:#}",
                self.failures.len(),
                self.failures.len() + self.copies
            )),
        }
    }
}

enum Outcome {
    Copied {
        dest: Utf8PathBuf,
        hash: Hash32,
        execution: Execution,
    },
    Excluded,
    Failed(Utf8PathBuf, SharedError),
}

/// Runs the transform at most once per source file and copies the result to
/// every target that needs it.
///
/// The ledger is keyed by the absolute source path and may be shared between
/// concurrent processors; only the claimant of a key writes the processed
/// artifact, so no one copies a half-written file.
pub struct AssemblyProcessor<'a> {
    transform: &'a dyn AssemblyTransform,
    selection: &'a AssemblySelection,
    ledger: &'a WorkLedger<Utf8PathBuf>,
}

impl<'a> AssemblyProcessor<'a> {
    pub fn new(
        transform: &'a dyn AssemblyTransform,
        selection: &'a AssemblySelection,
        ledger: &'a WorkLedger<Utf8PathBuf>,
    ) -> Self {
        Self {
            transform,
            selection,
            ledger,
        }
    }

    pub fn process(&self, units: &[DistributionUnit], targets: &[ProcessTarget]) -> ProcessReport {
        let jobs: Vec<_> = units
            .iter()
            .flat_map(|unit| {
                targets.iter().flat_map(move |target| {
                    unit.assemblies
                        .iter()
                        .filter(|relative| !is_processed(relative.as_str()))
                        .map(move |relative| (unit, target, relative))
                })
            })
            .collect();

        let outcomes: Vec<_> = jobs
            .into_par_iter()
            .map(|(unit, target, relative)| self.process_one(unit, target, relative))
            .collect();

        let mut report = ProcessReport::default();
        for outcome in outcomes {
            match outcome {
                Outcome::Copied {
                    dest,
                    hash,
                    execution,
                } => {
                    report.copies += 1;
                    match execution {
                        Execution::Ran => report.transforms += 1,
                        Execution::Reused => report.reused += 1,
                    }
                    report.hashes.insert(dest, hash);
                }
                Outcome::Excluded => report.excluded += 1,
                Outcome::Failed(dest, error) => report.failures.push((dest, error)),
            }
        }

        tracing::info!(
            "Processed assemblies: {} copies, {} transforms, {} excluded, {} failed",
            report.copies,
            report.transforms,
            report.excluded,
            report.failures.len()
        );
        report
    }

    fn process_one(&self, unit: &DistributionUnit, target: &ProcessTarget, relative: &Utf8Path) -> Outcome {
        let file_name = relative.file_name().unwrap_or(relative.as_str());
        if target.excluded.contains(file_name) {
            return Outcome::Excluded;
        }

        let source = unit.source_dir.join(relative);
        let source = source.canonicalize_utf8().unwrap_or(source);
        let processed = processed_path(&source);
        let dest = unit.output_root.join(&target.folder).join(file_name);

        let (execution, outcome) = self.ledger.run_once(
            &source,
            || processed.is_file(),
            || self.transform_into_place(unit, relative, &source, &processed),
        );

        let copied = outcome.map_err(|e| {
            SharedError::new(anyhow!("{e:#}").context(format!("Processing '{source}' failed")))
        });
        let copied = copied.and_then(|()| copy(&processed, &dest).map_err(SharedError::from));

        match copied {
            Ok(hash) => Outcome::Copied {
                dest,
                hash,
                execution,
            },
            Err(error) => {
                tracing::error!("Couldn't produce '{dest}': {error:#}");
                Outcome::Failed(dest, error)
            }
        }
    }

    fn transform_into_place(
        &self,
        unit: &DistributionUnit,
        relative: &Utf8Path,
        source: &Utf8Path,
        processed: &Utf8Path,
    ) -> anyhow::Result<()> {
        let kind = self.selection.kind(relative);
        let verb = match kind {
            TransformKind::Publicize => "Stripping and publicizing",
            TransformKind::StripOnly => "Stripping",
        };
        tracing::info!("{verb} {}/{relative}...", unit.id);

        let partial = Utf8PathBuf::from(format!("{processed}.partial"));
        self.transform
            .transform(kind, source, &partial)
            .with_context(|| format!("{verb} '{source}' failed"))?;
        fs::rename(&partial, processed)
            .with_context(|| format!("Couldn't move processed assembly to '{processed}'"))?;
        Ok(())
    }
}

fn copy(from: &Utf8Path, to: &Utf8Path) -> anyhow::Result<Hash32> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).with_context(|| format!("Couldn't create '{parent}'"))?;
    }
    fs::copy(from, to).with_context(|| format!("Couldn't copy '{from}' to '{to}'"))?;
    Ok(Hash32::hash_file(to)?)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Writes a deterministic "processed" file and records every call.
    #[derive(Default)]
    struct Recorder {
        calls: AtomicUsize,
        kinds: Mutex<Vec<(String, TransformKind)>>,
        fail_on: Option<&'static str>,
    }

    impl AssemblyTransform for Recorder {
        fn transform(&self, kind: TransformKind, source: &Utf8Path, output: &Utf8Path) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let name = source.file_name().unwrap().to_string();
            self.kinds.lock().unwrap().push((name.clone(), kind));
            if self.fail_on == Some(name.as_str()) {
                return Err(anyhow!("corrupt image"));
            }
            let mut bytes = fs::read(source)?;
            bytes.extend_from_slice(format!("{kind:?}").as_bytes());
            fs::write(output, bytes)?;
            Ok(())
        }
    }

    struct Fixture {
        _tmp: tempfile::TempDir,
        root: Utf8PathBuf,
        unit: DistributionUnit,
    }

    fn fixture(files: &[&str]) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(tmp.path().to_path_buf()).unwrap();
        let managed = root.join("depot_1/Game_Data/Managed");
        fs::create_dir_all(&managed).unwrap();
        for file in files {
            fs::write(managed.join(file), file.as_bytes()).unwrap();
        }
        let assemblies = AssemblySelection::default().select(&managed).unwrap();
        Fixture {
            unit: DistributionUnit {
                id: 1,
                source_dir: managed,
                assemblies,
                output_root: root.join("nupkgs/Game.Libs/ref"),
            },
            root,
            _tmp: tmp,
        }
    }

    fn target(folder: &str, excluded: &[&str]) -> ProcessTarget {
        ProcessTarget {
            folder: folder.into(),
            excluded: excluded.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_three_targets_one_excluding() {
        let f = fixture(&["Foo.dll"]);
        let recorder = Recorder::default();
        let selection = AssemblySelection::default();
        let ledger = WorkLedger::new();
        let targets = [
            target("netstandard2.0", &[]),
            target("netstandard2.1", &["Foo.dll"]),
            target("net472", &[]),
        ];

        let report = AssemblyProcessor::new(&recorder, &selection, &ledger).process(&[f.unit.clone()], &targets);

        assert!(report.is_success());
        assert_eq!(report.copies, 2);
        assert_eq!(report.transforms, 1);
        assert_eq!(report.reused, 1);
        assert_eq!(report.excluded, 1);
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 1);
        assert!(f.root.join("nupkgs/Game.Libs/ref/netstandard2.0/Foo.dll").is_file());
        assert!(f.root.join("nupkgs/Game.Libs/ref/net472/Foo.dll").is_file());
        assert!(!f.root.join("nupkgs/Game.Libs/ref/netstandard2.1/Foo.dll").exists());
        assert!(f.unit.source_dir.join("Foo-stubs.dll").is_file());
    }

    #[test]
    fn test_second_run_is_identical_and_does_no_work() {
        let f = fixture(&["A.dll", "B.dll"]);
        let recorder = Recorder::default();
        let selection = AssemblySelection::default();
        let targets = [target("netstandard2.1", &[])];

        let first = AssemblyProcessor::new(&recorder, &selection, &WorkLedger::new())
            .process(&[f.unit.clone()], &targets);
        let second = AssemblyProcessor::new(&recorder, &selection, &WorkLedger::new())
            .process(&[f.unit.clone()], &targets);

        assert_eq!(first.transforms, 2);
        assert_eq!(second.transforms, 0);
        assert_eq!(second.reused, 2);
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 2);
        assert_eq!(first.hashes, second.hashes);
    }

    #[test]
    fn test_units_sharing_a_source_transform_once() {
        let f = fixture(&["Shared.dll"]);
        fs::create_dir_all(f.root.join("depot_2")).unwrap();
        let other = DistributionUnit {
            id: 2,
            source_dir: f.root.join("depot_2/../depot_1/Game_Data/Managed"),
            assemblies: f.unit.assemblies.clone(),
            output_root: f.root.join("nupkgs/Game.Libs.Linux/ref"),
        };
        let recorder = Recorder::default();
        let selection = AssemblySelection::default();
        let ledger = WorkLedger::new();

        let report = AssemblyProcessor::new(&recorder, &selection, &ledger)
            .process(&[f.unit.clone(), other], &[target("netstandard2.1", &[])]);

        assert!(report.is_success());
        assert_eq!(report.copies, 2);
        assert_eq!(report.transforms, 1);
        assert_eq!(report.reused, 1);
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 1);

        let hashes: Vec<_> = report.hashes.values().collect();
        assert_eq!(hashes.len(), 2);
        assert_eq!(hashes[0], hashes[1]);
        assert!(f.root.join("nupkgs/Game.Libs.Linux/ref/netstandard2.1/Shared.dll").is_file());
    }

    #[test]
    fn test_failure_is_isolated_to_its_file() {
        let f = fixture(&["Bad.dll", "Good.dll"]);
        let recorder = Recorder {
            fail_on: Some("Bad.dll"),
            ..Default::default()
        };
        let selection = AssemblySelection::default();
        let ledger = WorkLedger::new();
        let targets = [target("netstandard2.0", &[]), target("net472", &[])];

        let report = AssemblyProcessor::new(&recorder, &selection, &ledger).process(&[f.unit.clone()], &targets);

        assert_eq!(report.copies, 2);
        assert_eq!(report.failures.len(), 2);
        assert!(report.failures.iter().all(|(dest, _)| dest.file_name() == Some("Bad.dll")));
        assert!(report.failures[0].1.to_string().contains("Bad.dll"));
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 2);
        assert!(!f.unit.source_dir.join("Bad-stubs.dll").exists());
        assert!(!f.unit.source_dir.join("Bad-stubs.dll.partial").exists());
        assert!(report.into_result().is_err());
    }

    #[test]
    fn test_processed_files_are_never_inputs() {
        let f = fixture(&["A.dll", "A-stubs.dll"]);
        let recorder = Recorder::default();
        let selection = AssemblySelection::default();
        let ledger = WorkLedger::new();

        let report = AssemblyProcessor::new(&recorder, &selection, &ledger)
            .process(&[f.unit.clone()], &[target("netstandard2.1", &[])]);

        // A-stubs.dll already exists, so A.dll counts as processed too.
        assert_eq!(report.copies, 1);
        assert_eq!(report.transforms, 0);
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 0);
        assert!(f.root.join("nupkgs/Game.Libs/ref/netstandard2.1/A.dll").is_file());
        assert!(!f.root.join("nupkgs/Game.Libs/ref/netstandard2.1/A-stubs.dll").exists());
    }

    #[test]
    fn test_selection_and_publicize_kind() {
        let f = fixture(&["Assembly-CSharp.dll", "System.Core.dll", "mscorlib.dll", "Unity.TextMeshPro.dll"]);
        fs::write(f.unit.source_dir.join("notes.txt"), "").unwrap();
        let selection = AssemblySelection::new(&["System.*.dll", "mscorlib.dll"], &["Assembly-*.dll"]).unwrap();

        let selected = selection.select(&f.unit.source_dir).unwrap();

        assert_eq!(
            selected,
            vec![
                Utf8PathBuf::from("Assembly-CSharp.dll"),
                Utf8PathBuf::from("Unity.TextMeshPro.dll")
            ]
        );
        assert_eq!(selection.kind(&selected[0]), TransformKind::Publicize);
        assert_eq!(selection.kind(&selected[1]), TransformKind::StripOnly);

        let recorder = Recorder::default();
        let ledger = WorkLedger::new();
        let unit = DistributionUnit {
            assemblies: selected,
            ..f.unit.clone()
        };
        AssemblyProcessor::new(&recorder, &selection, &ledger).process(&[unit], &[target("net472", &[])]);

        let mut kinds = recorder.kinds.into_inner().unwrap();
        kinds.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            kinds,
            vec![
                ("Assembly-CSharp.dll".to_string(), TransformKind::Publicize),
                ("Unity.TextMeshPro.dll".to_string(), TransformKind::StripOnly),
            ]
        );
    }

    #[test]
    fn test_managed_dir_per_platform() {
        let tmp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(tmp.path().to_path_buf()).unwrap();

        let windows = root.join("windows");
        fs::create_dir_all(&windows).unwrap();
        fs::write(windows.join("UnityCrashHandler64.exe"), "").unwrap();
        fs::write(windows.join("Game.exe"), "").unwrap();
        assert_eq!(managed_dir(&windows).unwrap(), windows.join("Game_Data/Managed"));

        let linux = root.join("linux");
        fs::create_dir_all(&linux).unwrap();
        fs::write(linux.join("Game.x86_64"), "").unwrap();
        assert_eq!(managed_dir(&linux).unwrap(), linux.join("Game_Data/Managed"));

        let mac = root.join("mac");
        fs::create_dir_all(mac.join("Game.app")).unwrap();
        assert_eq!(
            managed_dir(&mac).unwrap(),
            mac.join("Game.app/Contents/Resources/Data/Managed")
        );

        let empty = root.join("empty");
        fs::create_dir_all(&empty).unwrap();
        assert!(managed_dir(&empty).unwrap_err().to_string().contains("Unsupported"));
    }
}
