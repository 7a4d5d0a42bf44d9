//! Per-task git worktrees under the workspace root.
//!
//! Every dispatched task gets an isolated working directory at
//! `<root>/.worktrees/<sanitized-task-id>` on its own branch. All git
//! interaction goes through explicit argument arrays — no shell
//! strings — with inputs sanitized to the task-id alphabet.

use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::{FoundryError, Result};

/// A created worktree.
#[derive(Debug, Clone)]
pub struct Worktree {
    pub task_id: String,
    pub path: PathBuf,
    pub branch: String,
}

/// One entry from `git worktree list`.
#[derive(Debug, Clone)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub branch: Option<String>,
    pub head: Option<String>,
}

#[derive(Debug, Clone)]
pub struct WorktreeManager {
    root: PathBuf,
}

impl WorktreeManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn worktrees_dir(&self) -> PathBuf {
        self.root.join(".worktrees")
    }

    /// Ensure the workspace root is a git repository and `.worktrees/`
    /// exists. Idempotent.
    pub async fn init_workspace(&self) -> Result<()> {
        let output = self
            .git(&["rev-parse", "--git-dir"])
            .await?;
        if !output.status.success() {
            return Err(FoundryError::Git {
                message: format!(
                    "{} is not a git repository",
                    self.root.display()
                ),
            });
        }

        tokio::fs::create_dir_all(self.worktrees_dir()).await?;
        debug!(root = %self.root.display(), "workspace initialized");
        Ok(())
    }

    /// Path a task's worktree would occupy.
    pub fn path_for_task(&self, task_id: &str) -> PathBuf {
        self.worktrees_dir().join(sanitize_task_id(task_id))
    }

    /// Create a worktree for `task_id` on a fresh branch off
    /// `base_ref`. Fails if the path already exists unless `force`.
    pub async fn create_worktree(
        &self,
        task_id: &str,
        base_ref: &str,
        force: bool,
    ) -> Result<Worktree> {
        let sanitized = sanitize_task_id(task_id);
        let path = self.worktrees_dir().join(&sanitized);
        let branch = format!("task/{sanitized}");

        if path.exists() && !force {
            return Err(FoundryError::AlreadyExists(format!(
                "worktree path {} already exists",
                path.display()
            )));
        }

        let path_str = path.to_string_lossy().to_string();
        let mut args: Vec<&str> = vec!["worktree", "add"];
        if force {
            args.push("--force");
        }
        // -B: a branch left behind by a removed worktree is reset to
        // the base ref, so a redispatched task starts clean.
        args.extend(["-B", branch.as_str(), path_str.as_str(), base_ref]);

        let output = self.git(&args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FoundryError::Git {
                message: format!("worktree add for {task_id} failed: {}", stderr.trim()),
            });
        }

        info!(task = %task_id, path = %path.display(), branch = %branch, "worktree created");
        Ok(Worktree {
            task_id: task_id.to_string(),
            path,
            branch,
        })
    }

    /// Worktrees registered with git, porcelain-parsed. The main
    /// checkout is excluded.
    pub async fn list_worktrees(&self) -> Result<Vec<WorktreeInfo>> {
        let output = self.git(&["worktree", "list", "--porcelain"]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FoundryError::Git {
                message: format!("worktree list failed: {}", stderr.trim()),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut entries = parse_worktree_list(&stdout);
        // First porcelain entry is the primary checkout.
        if !entries.is_empty() {
            entries.remove(0);
        }
        Ok(entries)
    }

    /// Detach a worktree from git and delete the directory. Best-effort
    /// on the directory: a failed delete is logged, not surfaced.
    pub async fn remove_worktree(&self, path: &Path, force: bool) -> Result<()> {
        let path_str = path.to_string_lossy().to_string();
        let mut args: Vec<&str> = vec!["worktree", "remove"];
        if force {
            args.push("--force");
        }
        args.push(path_str.as_str());

        let output = self.git(&args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // The registration may already be gone; prune and fall
            // through to the directory delete.
            warn!(path = %path.display(), "git worktree remove failed: {}", stderr.trim());
            let _ = self.git(&["worktree", "prune"]).await;
        }

        if path.exists() {
            if let Err(e) = tokio::fs::remove_dir_all(path).await {
                warn!(path = %path.display(), "failed to delete worktree directory: {e}");
            }
        }

        info!(path = %path.display(), "worktree removed");
        Ok(())
    }

    /// Remove the worktree owned by a task, if any.
    pub async fn remove_for_task(&self, task_id: &str) -> Result<()> {
        let path = self.path_for_task(task_id);
        if path.exists() {
            self.remove_worktree(&path, true).await?;
        }
        Ok(())
    }

    async fn git(&self, args: &[&str]) -> Result<std::process::Output> {
        debug!(?args, "running git");
        Command::new("git")
            .args(args)
            .current_dir(&self.root)
            .output()
            .await
            .map_err(|e| FoundryError::Git {
                message: format!("failed to run git: {e}"),
            })
    }
}

/// Task ids are already alphabet-constrained; dots (hierarchical child
/// separators) become hyphens so the path has no special characters.
fn sanitize_task_id(task_id: &str) -> String {
    task_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

fn parse_worktree_list(porcelain: &str) -> Vec<WorktreeInfo> {
    let mut entries = Vec::new();
    let mut current: Option<WorktreeInfo> = None;

    for line in porcelain.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            if let Some(entry) = current.take() {
                entries.push(entry);
            }
            current = Some(WorktreeInfo {
                path: PathBuf::from(path),
                branch: None,
                head: None,
            });
        } else if let Some(head) = line.strip_prefix("HEAD ") {
            if let Some(entry) = current.as_mut() {
                entry.head = Some(head.to_string());
            }
        } else if let Some(branch) = line.strip_prefix("branch ") {
            if let Some(entry) = current.as_mut() {
                entry.branch = Some(
                    branch
                        .strip_prefix("refs/heads/")
                        .unwrap_or(branch)
                        .to_string(),
                );
            }
        }
    }
    if let Some(entry) = current.take() {
        entries.push(entry);
    }
    entries
}
