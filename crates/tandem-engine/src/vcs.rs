//! Version control detection for the working directory (Git, then Jujutsu).
//!
//! Every query shells out to the VCS binary. A query that fails to run leaves
//! the corresponding status field at its default.

use std::path::{Path, PathBuf};
use std::process::Output;

use serde::Serialize;
use tokio::process::Command;
use tracing::debug;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VcsKind {
    Git,
    Jujutsu,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct VcsStatus {
    pub has_uncommitted: bool,
    pub has_untracked: bool,
    pub has_conflicts: bool,
    pub has_staged: bool,
    pub ahead: u32,
    pub behind: u32,
    /// Branch name, short commit hash when detached, or jj change id.
    pub current_branch: String,
    pub is_detached: bool,
    pub has_unpushed: bool,
    pub remote_tracking_ok: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct VcsInfo {
    pub kind: VcsKind,
    pub repo_name: String,
    pub root: PathBuf,
    pub status: VcsStatus,
}

/// Condensed repository state, most urgent first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VcsState {
    Conflict,
    Detached,
    Staged,
    Dirty,
    Untracked,
    Diverged,
    Unpushed,
    Behind,
    Clean,
}

impl VcsState {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Conflict => "conflict",
            Self::Detached => "detached",
            Self::Staged => "staged",
            Self::Dirty => "dirty",
            Self::Untracked => "untracked",
            Self::Diverged => "diverged",
            Self::Unpushed => "unpushed",
            Self::Behind => "behind",
            Self::Clean => "clean",
        }
    }
}

impl VcsInfo {
    pub fn state(&self) -> VcsState {
        let s = &self.status;
        match self.kind {
            VcsKind::Git => {
                if s.has_conflicts {
                    VcsState::Conflict
                } else if s.is_detached {
                    VcsState::Detached
                } else if s.has_staged {
                    VcsState::Staged
                } else if s.has_uncommitted {
                    VcsState::Dirty
                } else if s.has_untracked {
                    VcsState::Untracked
                } else if s.ahead > 0 && s.behind > 0 {
                    VcsState::Diverged
                } else if s.has_unpushed || s.ahead > 0 {
                    VcsState::Unpushed
                } else if s.behind > 0 {
                    VcsState::Behind
                } else {
                    VcsState::Clean
                }
            }
            VcsKind::Jujutsu => {
                if s.has_conflicts {
                    VcsState::Conflict
                } else if s.has_uncommitted {
                    VcsState::Dirty
                } else {
                    VcsState::Clean
                }
            }
        }
    }

    /// `"<state> <branch>"`, falling back to the repository name.
    pub fn indicator(&self) -> String {
        let name = if self.status.current_branch.is_empty() {
            &self.repo_name
        } else {
            &self.status.current_branch
        };
        format!("{} {}", self.state().label(), name)
    }
}

/// Detect the repository containing `path`, trying Git first.
pub async fn detect(path: &Path) -> Option<VcsInfo> {
    if let Some(root) = find_root(path, ".git", false) {
        let status = git_status(&root).await;
        return Some(info(VcsKind::Git, root, status));
    }
    if let Some(root) = find_root(path, ".jj", true) {
        let status = jj_status(&root).await;
        return Some(info(VcsKind::Jujutsu, root, status));
    }
    None
}

fn info(kind: VcsKind, root: PathBuf, status: VcsStatus) -> VcsInfo {
    let repo_name = root
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    VcsInfo {
        kind,
        repo_name,
        root,
        status,
    }
}

/// Walk up from `start` to the first directory holding `marker`. Worktrees and
/// submodules use a `.git` file, so `dir_only` is false for Git.
pub fn find_root(start: &Path, marker: &str, dir_only: bool) -> Option<PathBuf> {
    let start = std::path::absolute(start).ok()?;
    start
        .ancestors()
        .find(|dir| {
            let candidate = dir.join(marker);
            if dir_only {
                candidate.is_dir()
            } else {
                candidate.exists()
            }
        })
        .map(Path::to_path_buf)
}

/// Parse `git rev-list --left-right --count` output (`"<ahead>\t<behind>"`).
pub fn parse_ahead_behind(output: &str) -> Option<(u32, u32)> {
    let mut parts = output.split_whitespace();
    let ahead = parts.next()?.parse().ok()?;
    let behind = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((ahead, behind))
}

async fn run(dir: &Path, program: &str, args: &[&str]) -> Option<Output> {
    match Command::new(program)
        .args(args)
        .current_dir(dir)
        .kill_on_drop(true)
        .output()
        .await
    {
        Ok(output) => Some(output),
        Err(e) => {
            debug!(program, ?args, error = %e, "vcs query failed to run");
            None
        }
    }
}

/// Trimmed stdout of a successful command.
async fn stdout_of(dir: &Path, program: &str, args: &[&str]) -> Option<String> {
    run(dir, program, args)
        .await
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
}

/// Whether the command ran and exited non-zero.
async fn exits_nonzero(dir: &Path, program: &str, args: &[&str]) -> bool {
    run(dir, program, args)
        .await
        .is_some_and(|o| !o.status.success())
}

async fn git_status(root: &Path) -> VcsStatus {
    let mut status = VcsStatus::default();

    if let Some(branch) = stdout_of(root, "git", &["symbolic-ref", "--short", "HEAD"]).await {
        status.current_branch = branch;
    } else if let Some(hash) = stdout_of(root, "git", &["rev-parse", "--short", "HEAD"]).await {
        status.current_branch = hash;
        status.is_detached = true;
    }

    status.has_conflicts = stdout_of(root, "git", &["diff", "--name-only", "--diff-filter=U"])
        .await
        .is_some_and(|o| !o.is_empty());
    status.has_staged = exits_nonzero(root, "git", &["diff", "--cached", "--quiet"]).await;
    status.has_uncommitted = exits_nonzero(root, "git", &["diff", "--quiet"]).await;
    status.has_untracked = stdout_of(root, "git", &["ls-files", "--others", "--exclude-standard"])
        .await
        .is_some_and(|o| !o.is_empty());

    if !status.is_detached && !status.current_branch.is_empty() {
        let counts = stdout_of(
            root,
            "git",
            &["rev-list", "--left-right", "--count", "HEAD...@{u}"],
        )
        .await
        .and_then(|o| parse_ahead_behind(&o));
        if let Some((ahead, behind)) = counts {
            status.remote_tracking_ok = true;
            status.ahead = ahead;
            status.behind = behind;
            status.has_unpushed = ahead > 0;
        }
    }

    status
}

async fn jj_status(root: &Path) -> VcsStatus {
    let mut status = VcsStatus::default();

    let branch = stdout_of(root, "jj", &["log", "-r", "@", "--no-graph", "-T", "branches"])
        .await
        .and_then(|o| o.split_whitespace().next().map(str::to_string));
    status.current_branch = match branch {
        Some(b) => b,
        None => stdout_of(
            root,
            "jj",
            &["log", "-r", "@", "--no-graph", "-T", "change_id.short()"],
        )
        .await
        .unwrap_or_default(),
    };

    if let Some(out) = stdout_of(root, "jj", &["status"]).await {
        status.has_uncommitted = out.contains("Working copy changes:");
        status.has_conflicts = out.contains("conflict");
    }

    status
}

#[cfg(test)]
mod tests {
    use super::*;

    fn git(status: VcsStatus) -> VcsInfo {
        VcsInfo {
            kind: VcsKind::Git,
            repo_name: "repo".into(),
            root: PathBuf::from("/repo"),
            status,
        }
    }

    #[test]
    fn ahead_behind_parses_integers() {
        assert_eq!(parse_ahead_behind("3\t12\n"), Some((3, 12)));
        assert_eq!(parse_ahead_behind("0 0"), Some((0, 0)));
        assert_eq!(parse_ahead_behind("12"), None);
        assert_eq!(parse_ahead_behind("a b"), None);
        assert_eq!(parse_ahead_behind("1 2 3"), None);
    }

    #[test]
    fn git_state_priority() {
        let conflicted = git(VcsStatus {
            has_conflicts: true,
            has_staged: true,
            is_detached: true,
            ..Default::default()
        });
        assert_eq!(conflicted.state(), VcsState::Conflict);

        let staged_and_dirty = git(VcsStatus {
            has_staged: true,
            has_uncommitted: true,
            ..Default::default()
        });
        assert_eq!(staged_and_dirty.state(), VcsState::Staged);

        let diverged = git(VcsStatus {
            ahead: 2,
            behind: 11,
            has_unpushed: true,
            ..Default::default()
        });
        assert_eq!(diverged.state(), VcsState::Diverged);

        let unpushed = git(VcsStatus {
            ahead: 2,
            has_unpushed: true,
            ..Default::default()
        });
        assert_eq!(unpushed.state(), VcsState::Unpushed);

        let behind = git(VcsStatus {
            behind: 1,
            ..Default::default()
        });
        assert_eq!(behind.state(), VcsState::Behind);
        assert_eq!(git(VcsStatus::default()).state(), VcsState::Clean);
    }

    #[test]
    fn jj_ignores_git_only_fields() {
        let info = VcsInfo {
            kind: VcsKind::Jujutsu,
            repo_name: "repo".into(),
            root: PathBuf::from("/repo"),
            status: VcsStatus {
                has_staged: true,
                ahead: 3,
                ..Default::default()
            },
        };
        assert_eq!(info.state(), VcsState::Clean);
    }

    #[test]
    fn indicator_prefers_branch_over_repo_name() {
        let mut info = git(VcsStatus {
            has_untracked: true,
            current_branch: "main".into(),
            ..Default::default()
        });
        assert_eq!(info.indicator(), "untracked main");
        info.status.current_branch.clear();
        assert_eq!(info.indicator(), "untracked repo");
    }

    #[tokio::test]
    async fn detects_git_from_nested_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join(".git")).unwrap();
        let nested = dir.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();

        let info = detect(&nested).await.unwrap();
        assert_eq!(info.kind, VcsKind::Git);
        assert_eq!(info.root, dir.path());
        assert_eq!(
            info.repo_name,
            dir.path().file_name().unwrap().to_string_lossy()
        );
    }

    #[tokio::test]
    async fn git_file_marks_a_worktree() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".git"), "gitdir: /elsewhere/.git\n").unwrap();
        let info = detect(dir.path()).await.unwrap();
        assert_eq!(info.kind, VcsKind::Git);
    }

    #[tokio::test]
    async fn detects_jujutsu() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join(".jj")).unwrap();
        let info = detect(dir.path()).await.unwrap();
        assert_eq!(info.kind, VcsKind::Jujutsu);
    }

    #[test]
    fn no_marker_no_root() {
        let dir = tempfile::tempdir().unwrap();
        assert!(find_root(dir.path(), ".jj", true).is_none());
    }
}
