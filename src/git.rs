//! Version control: the version-entry pull request flow and the time this
//! tool's own version last changed.

use anyhow::{Context, anyhow};
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, FixedOffset};

use crate::process::Tool;

pub const GIT_EXEC: &str = "git";
pub const GH_EXEC: &str = "gh";

const VERSION_TAG_PREFIX: &str = "v";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequest {
    pub title: String,
    pub body: String,
    pub head: String,
}

/// Operations on the repository holding the game metadata.
pub trait VersionControl: Send + Sync {
    /// Updates remote tracking branches, dropping deleted ones.
    fn fetch(&self) -> anyhow::Result<()>;

    fn remote_branch_exists(&self, branch: &str) -> anyhow::Result<bool>;

    /// Creates `branch` at HEAD and checks it out.
    fn create_branch(&self, branch: &str) -> anyhow::Result<()>;

    fn stage(&self, path: &Utf8Path) -> anyhow::Result<()>;

    /// Commits the index as the identity configured for the repository.
    fn commit(&self, message: &str) -> anyhow::Result<()>;

    fn push(&self, branch: &str) -> anyhow::Result<()>;

    fn open_pull_request(&self, request: &PullRequest) -> anyhow::Result<()>;

    /// Commit time of the highest version tag reachable from HEAD, or of the
    /// root commit when there is none.
    fn last_version_change(&self) -> anyhow::Result<DateTime<FixedOffset>>;
}

/// [`VersionControl`] through the `git` and `gh` executables.
#[derive(Debug, Clone)]
pub struct GitCli {
    root: Utf8PathBuf,
}

impl GitCli {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn git(&self) -> Tool {
        Tool::new("git", GIT_EXEC).current_dir(&self.root)
    }

    fn config(&self, key: &str) -> anyhow::Result<String> {
        let value = self
            .git()
            .args(["config", "--get", key])
            .output()
            .with_context(|| format!("Couldn't read git config '{key}'"))?;
        let value = value.trim();
        if value.is_empty() {
            return Err(anyhow!("git config '{key}' is empty"));
        }
        Ok(value.to_string())
    }

    fn commit_date(&self, revision: &str) -> anyhow::Result<DateTime<FixedOffset>> {
        let out = self
            .git()
            .args(["log", "-1", "--format=%ci", revision])
            .output()?;
        parse_commit_date(out.trim())
    }
}

/// Parses the `%ci` format, e.g. `2024-04-10 12:00:00 +0200`.
fn parse_commit_date(text: &str) -> anyhow::Result<DateTime<FixedOffset>> {
    DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S %z")
        .with_context(|| format!("parsing commit date: {text}"))
}

/// The highest `v<semver>` tag in `tags`, ignoring anything else.
fn highest_version_tag<'a>(tags: impl IntoIterator<Item = &'a str>) -> Option<&'a str> {
    tags.into_iter()
        .filter_map(|tag| {
            let version = tag.strip_prefix(VERSION_TAG_PREFIX)?;
            semver::Version::parse(version).ok().map(|v| (v, tag))
        })
        .max()
        .map(|(_, tag)| tag)
}

impl VersionControl for GitCli {
    fn fetch(&self) -> anyhow::Result<()> {
        self.git().args(["fetch", "--prune", "origin"]).run()?;
        Ok(())
    }

    fn remote_branch_exists(&self, branch: &str) -> anyhow::Result<bool> {
        let remote = format!("origin/{branch}");
        let out = self
            .git()
            .args(["branch", "--remotes", "--list", remote.as_str()])
            .output()?;
        Ok(out.lines().any(|line| line.trim() == remote))
    }

    fn create_branch(&self, branch: &str) -> anyhow::Result<()> {
        self.git().args(["checkout", "-b", branch]).run()?;
        Ok(())
    }

    fn stage(&self, path: &Utf8Path) -> anyhow::Result<()> {
        self.git().args(["add", "--", path.as_str()]).run()?;
        Ok(())
    }

    fn commit(&self, message: &str) -> anyhow::Result<()> {
        let name = self.config("user.name")?;
        let email = self.config("user.email")?;
        self.git()
            .arg("-c")
            .arg(format!("user.name={name}"))
            .arg("-c")
            .arg(format!("user.email={email}"))
            .args(["commit", "--message", message])
            .run()?;
        Ok(())
    }

    fn push(&self, branch: &str) -> anyhow::Result<()> {
        self.git()
            .args(["push", "--set-upstream", "origin", branch])
            .run()?;
        Ok(())
    }

    fn open_pull_request(&self, request: &PullRequest) -> anyhow::Result<()> {
        Tool::new("gh", GH_EXEC)
            .current_dir(&self.root)
            .args(["pr", "create", "--title", request.title.as_str()])
            .args(["--body", request.body.as_str()])
            .args(["--head", request.head.as_str()])
            .run()?;
        Ok(())
    }

    fn last_version_change(&self) -> anyhow::Result<DateTime<FixedOffset>> {
        let tags = self
            .git()
            .args(["tag", "--merged", "HEAD", "--list", "v*"])
            .output()?;

        if let Some(tag) = highest_version_tag(tags.lines().map(str::trim)) {
            tracing::debug!("Last version change at tag {tag}");
            return self.commit_date(&format!("{tag}^{{commit}}"));
        }

        let roots = self
            .git()
            .args(["rev-list", "--max-parents=0", "HEAD"])
            .output()?;
        let root = roots
            .lines()
            .next()
            .ok_or_else(|| anyhow!("Repository at '{}' has no commits", self.root))?;
        tracing::debug!("No version tags, using root commit {root}");
        self.commit_date(root.trim())
    }
}

#[cfg(test)]
mod tests {
    use std::process::Command;

    use super::*;

    #[test]
    fn test_highest_version_tag() {
        let tags = ["v0.9.0", "v1.10.0", "v1.2.0", "release", "vNext", "v1.10.0-rc.1"];
        assert_eq!(highest_version_tag(tags), Some("v1.10.0"));
        assert_eq!(highest_version_tag(["latest"]), None);
    }

    #[test]
    fn test_parse_commit_date() {
        let date = parse_commit_date("2024-04-10 12:00:00 +0200").unwrap();
        assert_eq!(date.to_rfc3339(), "2024-04-10T12:00:00+02:00");
        assert!(parse_commit_date("yesterday").is_err());
    }

    fn git(dir: &Utf8Path, args: &[&str], date: &str) {
        let status = Command::new(GIT_EXEC)
            .args(args)
            .current_dir(dir)
            .env("GIT_AUTHOR_DATE", date)
            .env("GIT_COMMITTER_DATE", date)
            .env("GIT_AUTHOR_NAME", "Test")
            .env("GIT_AUTHOR_EMAIL", "test@example.com")
            .env("GIT_COMMITTER_NAME", "Test")
            .env("GIT_COMMITTER_EMAIL", "test@example.com")
            .status()
            .unwrap();
        assert!(status.success(), "git {args:?}");
    }

    #[test]
    fn test_last_version_change_follows_tags() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = Utf8PathBuf::try_from(tmp.path().to_path_buf()).unwrap();

        git(&dir, &["init", "--quiet"], "2024-01-01T00:00:00+00:00");
        git(&dir, &["commit", "--quiet", "--allow-empty", "-m", "root"], "2024-01-01T00:00:00+00:00");

        let repo = GitCli::new(dir.clone());
        assert_eq!(
            repo.last_version_change().unwrap().to_rfc3339(),
            "2024-01-01T00:00:00+00:00"
        );

        git(&dir, &["commit", "--quiet", "--allow-empty", "-m", "one"], "2024-02-01T00:00:00+00:00");
        git(&dir, &["tag", "v1.0.0"], "2024-02-01T00:00:00+00:00");
        git(&dir, &["commit", "--quiet", "--allow-empty", "-m", "two"], "2024-03-01T00:00:00+00:00");
        git(&dir, &["tag", "v0.5.0"], "2024-03-01T00:00:00+00:00");
        git(&dir, &["commit", "--quiet", "--allow-empty", "-m", "three"], "2024-04-01T00:00:00+00:00");

        assert_eq!(
            repo.last_version_change().unwrap().to_rfc3339(),
            "2024-02-01T00:00:00+00:00"
        );
    }

    #[test]
    fn test_remote_branch_absent_without_remote() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = Utf8PathBuf::try_from(tmp.path().to_path_buf()).unwrap();
        git(&dir, &["init", "--quiet"], "2024-01-01T00:00:00+00:00");

        assert!(!GitCli::new(dir).remote_branch_exists("Game-build-1").unwrap());
    }
}
