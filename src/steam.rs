//! Content distribution: live app metadata and depot downloads.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use anyhow::{Context, anyhow};
use camino::Utf8PathBuf;
use regex::Regex;

use crate::error::ToolError;
use crate::keyvalues::{self, KeyValues, Value};
use crate::process::Tool;

pub const PUBLIC_BRANCH: &str = "public";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppDepot {
    pub depot_id: u32,
    /// Manifest id per branch name.
    pub manifests: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppBranch {
    pub name: String,
    pub build_id: u32,
    pub time_updated: u64,
}

/// The subset of an app's live metadata the pipeline cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppInfo {
    pub app_id: u32,
    pub name: String,
    pub depots: BTreeMap<u32, AppDepot>,
    pub branches: BTreeMap<String, AppBranch>,
}

fn number<T: std::str::FromStr>(object: &KeyValues, key: &str, what: &str) -> anyhow::Result<T> {
    let text = object
        .text(key)
        .ok_or_else(|| anyhow!("{what} has no '{key}'"))?;
    text.trim()
        .parse()
        .map_err(|_| anyhow!("{what} has a malformed '{key}': '{text}'"))
}

impl AppInfo {
    /// Reads app info from a parsed document whose single root key is the
    /// app id.
    pub fn from_keyvalues(document: &KeyValues) -> anyhow::Result<Self> {
        let (id, root) = document
            .iter()
            .next()
            .ok_or_else(|| anyhow!("App info document is empty"))?;
        let app_id: u32 = id
            .parse()
            .with_context(|| format!("App info root key '{id}' is not an app id"))?;
        let root = root
            .as_object()
            .ok_or_else(|| anyhow!("App info for {app_id} is not an object"))?;

        let name = root
            .path(&["common", "name"])
            .and_then(Value::as_text)
            .unwrap_or_default()
            .to_string();

        let mut depots = BTreeMap::new();
        let mut branches = BTreeMap::new();

        if let Some(section) = root.object("depots") {
            for (key, value) in section.iter() {
                let Some(object) = value.as_object() else {
                    continue;
                };

                if key.eq_ignore_ascii_case("branches") {
                    for (branch, info) in object.iter() {
                        let Some(info) = info.as_object() else {
                            continue;
                        };
                        let what = format!("Branch '{branch}'");
                        branches.insert(
                            branch.to_ascii_lowercase(),
                            AppBranch {
                                name: branch.to_string(),
                                build_id: number(info, "buildid", &what)?,
                                time_updated: number(info, "timeupdated", &what).unwrap_or(0),
                            },
                        );
                    }
                    continue;
                }

                let Ok(depot_id) = key.parse::<u32>() else {
                    continue;
                };

                let mut manifests = BTreeMap::new();
                if let Some(section) = object.object("manifests") {
                    for (branch, manifest) in section.iter() {
                        let gid = match manifest {
                            Value::Text(gid) => Some(gid.as_str()),
                            Value::Object(object) => object.text("gid"),
                        };
                        if let Some(gid) = gid.and_then(|gid| gid.trim().parse().ok()) {
                            manifests.insert(branch.to_ascii_lowercase(), gid);
                        }
                    }
                }
                depots.insert(depot_id, AppDepot { depot_id, manifests });
            }
        }

        Ok(AppInfo {
            app_id,
            name,
            depots,
            branches,
        })
    }

    pub fn branch(&self, name: &str) -> Option<&AppBranch> {
        self.branches.get(&name.to_ascii_lowercase())
    }

    pub fn public_branch(&self) -> anyhow::Result<&AppBranch> {
        self.branch(PUBLIC_BRANCH)
            .ok_or_else(|| anyhow!("App {} has no public branch", self.app_id))
    }

    pub fn manifest(&self, depot_id: u32, branch: &str) -> Option<u64> {
        self.depots
            .get(&depot_id)?
            .manifests
            .get(&branch.to_ascii_lowercase())
            .copied()
    }
}

/// Access to the content distribution network.
pub trait ContentClient: Send + Sync {
    /// Live metadata for `app_id`.
    fn app_info(&self, app_id: u32) -> anyhow::Result<AppInfo>;

    /// Downloads one depot at one manifest and returns the directory it was
    /// written to.
    fn download_depot(&self, app_id: u32, depot_id: u32, manifest_id: u64)
    -> anyhow::Result<Utf8PathBuf>;
}

/// Pulls out the KeyValues block following the `AppID` line of an
/// `app_info_print` dump.
pub fn extract_app_info(output: &str) -> anyhow::Result<String> {
    let mut lines = output.lines().skip_while(|line| !line.starts_with("AppID"));
    if lines.next().is_none() {
        return Err(anyhow!("Couldn't find app info in SteamCMD output."));
    }

    let mut block = String::new();
    let mut depth = 0usize;
    for line in lines {
        block.push_str(line);
        block.push('\n');
        match line.trim() {
            "{" => depth += 1,
            "}" => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    break;
                }
            }
            _ => {}
        }
    }

    Ok(block)
}

static DOWNLOAD_COMPLETE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"Depot download complete : "(.+?)""#).expect("Error compiling download pattern")
});

/// Finds the directory reported by a successful `download_depot`.
pub fn download_location(output: &str) -> Option<Utf8PathBuf> {
    DOWNLOAD_COMPLETE
        .captures_iter(output)
        .last()
        .map(|captures| Utf8PathBuf::from(&captures[1]))
}

/// [`ContentClient`] backed by the `steamcmd` executable.
#[derive(Debug, Clone)]
pub struct SteamCmd {
    program: String,
    username: String,
}

impl SteamCmd {
    pub fn new(username: impl Into<String>) -> Self {
        Self::with_program("steamcmd", username)
    }

    pub fn with_program(program: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            username: username.into(),
        }
    }

    fn command(&self) -> Tool {
        Tool::new("SteamCMD", &self.program)
            .arg("+login")
            .secret_arg(&self.username)
    }

    fn execute(&self, args: &[String]) -> Result<String, ToolError> {
        self.command()
            .args(args.iter().cloned())
            .arg("+quit")
            // Ends any interactive prompt, e.g. a Steam Guard code request.
            .stdin("\u{4}\n")
            .output()
    }
}

impl ContentClient for SteamCmd {
    fn app_info(&self, app_id: u32) -> anyhow::Result<AppInfo> {
        tracing::info!("Getting app info from SteamCMD...");
        let output = self.execute(&["+app_info_print".into(), app_id.to_string()])?;
        let block = extract_app_info(&output)?;
        let document = keyvalues::parse(&block).context("Couldn't parse SteamCMD app info")?;
        let info = AppInfo::from_keyvalues(&document)?;
        tracing::info!(
            "App info for {}: {} depots, {} branches",
            info.name,
            info.depots.len(),
            info.branches.len()
        );
        Ok(info)
    }

    fn download_depot(
        &self,
        app_id: u32,
        depot_id: u32,
        manifest_id: u64,
    ) -> anyhow::Result<Utf8PathBuf> {
        tracing::info!("Downloading depot {depot_id} at manifest {manifest_id}...");
        let output = self.execute(&[
            "+download_depot".into(),
            app_id.to_string(),
            depot_id.to_string(),
            manifest_id.to_string(),
        ])?;

        download_location(&output).ok_or_else(|| {
            ToolError::Output {
                tool: "SteamCMD".into(),
                message: format!("depot {depot_id} download did not report completion"),
            }
            .into()
        })
    }
}
