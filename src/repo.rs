use std::path::{Component, Path, PathBuf};
use std::process::Command;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// Validate that a revision name is safe to hand to git: non-empty, no
/// leading dash, and only ref-safe characters.
pub fn validate_rev(rev: &str) -> Result<()> {
    if rev.is_empty() {
        return Err(Error::Repo("no_such_ref: empty revision".to_string()));
    }
    if rev.starts_with('-') {
        return Err(Error::Repo(format!(
            "no_such_ref: revision must not start with '-': {rev}"
        )));
    }
    if !rev
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "/_.~^-".contains(c))
    {
        return Err(Error::Repo(format!(
            "no_such_ref: revision contains invalid characters: {rev}"
        )));
    }
    Ok(())
}

/// Reject paths that escape the repository root: absolute paths and any
/// `..` component fail the traversal check.
pub fn validate_path(root: &Path, path: &str) -> Result<PathBuf> {
    let rel = Path::new(path);
    if rel.is_absolute() {
        return Err(Error::Repo(format!("no_such_path: absolute path {path}")));
    }
    let mut normalized = PathBuf::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            _ => {
                return Err(Error::Repo(format!(
                    "no_such_path: path escapes repository root: {path}"
                )));
            }
        }
    }
    if normalized.as_os_str().is_empty() {
        return Err(Error::Repo("no_such_path: empty path".to_string()));
    }
    Ok(root.join(normalized))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoInfo {
    pub valid: bool,
    pub root: String,
    pub current_branch: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BranchType {
    Local,
    Remote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Branch {
    pub name: String,
    #[serde(rename = "type")]
    pub branch_type: BranchType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Added,
    Modified,
    Deleted,
    Renamed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub status: FileStatus,
    pub additions: u32,
    pub deletions: u32,
}

/// One line of a file read: 1-based number plus content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileLine {
    pub number: u32,
    pub content: String,
}

fn git(root: &Path, args: &[&str]) -> Result<String> {
    debug!(root = %root.display(), ?args, "git");
    let output = Command::new("git")
        .args(args)
        .current_dir(root)
        .output()
        .map_err(|e| Error::Repo(format!("failed to run git: {e}")))?;

    if output.status.success() {
        String::from_utf8(output.stdout)
            .map_err(|e| Error::Repo(format!("invalid utf8 from git: {e}")))
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(classify_git_error(&stderr))
    }
}

fn classify_git_error(stderr: &str) -> Error {
    let lower = stderr.to_lowercase();
    if lower.contains("not a git repository") {
        Error::Repo(format!("not_a_repo: {}", stderr.trim()))
    } else if lower.contains("bad revision")
        || lower.contains("unknown revision")
        || lower.contains("bad object")
        || lower.contains("invalid object name")
    {
        Error::Repo(format!("no_such_ref: {}", stderr.trim()))
    } else if lower.contains("does not exist") || lower.contains("exists on disk, but not in") {
        Error::Repo(format!("no_such_path: {}", stderr.trim()))
    } else {
        Error::Repo(stderr.trim().to_string())
    }
}

/// Read-only facade over a working tree (C1). All operations are stateless
/// and reentrant; the core never writes to the tree.
pub struct RepoReader;

impl RepoReader {
    /// Resolve a user-supplied path to a repository root and current branch.
    pub fn validate(path: &str) -> Result<RepoInfo> {
        let dir = Path::new(path);
        if !dir.is_dir() {
            return Err(Error::Repo(format!("invalid_path: {path}")));
        }
        let root = git(dir, &["rev-parse", "--show-toplevel"])?;
        let root = root.trim().to_string();
        let branch = git(dir, &["rev-parse", "--abbrev-ref", "HEAD"])?;
        Ok(RepoInfo {
            valid: true,
            root,
            current_branch: branch.trim().to_string(),
        })
    }

    /// Local and remote branches.
    pub fn branches(root: &Path) -> Result<Vec<Branch>> {
        let mut branches = Vec::new();
        let local = git(root, &["branch", "--format=%(refname:short)"])?;
        for name in local.lines().filter(|l| !l.is_empty()) {
            branches.push(Branch {
                name: name.to_string(),
                branch_type: BranchType::Local,
            });
        }
        let remote = git(root, &["branch", "-r", "--format=%(refname:short)"])?;
        for name in remote.lines().filter(|l| !l.is_empty() && !l.contains("HEAD")) {
            branches.push(Branch {
                name: name.to_string(),
                branch_type: BranchType::Remote,
            });
        }
        Ok(branches)
    }

    /// Ordered changed-file list between two revisions.
    pub fn files(root: &Path, base: &str, head: &str) -> Result<Vec<FileChange>> {
        validate_rev(base)?;
        validate_rev(head)?;

        let name_status = git(root, &["diff", "--name-status", "-M", base, head])?;
        let numstat = git(root, &["diff", "--numstat", "-M", base, head])?;

        // numstat rows: "<adds>\t<dels>\t<path>" ("-" for binary).
        let mut counts = std::collections::HashMap::new();
        for line in numstat.lines() {
            let mut parts = line.split('\t');
            let adds = parts.next().unwrap_or("0");
            let dels = parts.next().unwrap_or("0");
            let path = match parts.next_back() {
                Some(p) => p,
                None => continue,
            };
            counts.insert(
                path.to_string(),
                (
                    adds.parse::<u32>().unwrap_or(0),
                    dels.parse::<u32>().unwrap_or(0),
                ),
            );
        }

        let mut files = Vec::new();
        for line in name_status.lines() {
            let mut parts = line.split('\t');
            let status_code = match parts.next() {
                Some(s) if !s.is_empty() => s,
                _ => continue,
            };
            let status = match status_code.chars().next() {
                Some('A') => FileStatus::Added,
                Some('M') => FileStatus::Modified,
                Some('D') => FileStatus::Deleted,
                Some('R') => FileStatus::Renamed,
                _ => FileStatus::Modified,
            };
            // Renames carry "old\tnew"; the new path is authoritative.
            let path = match parts.next_back() {
                Some(p) => p.to_string(),
                None => continue,
            };
            let (additions, deletions) = counts.get(&path).copied().unwrap_or((0, 0));
            files.push(FileChange {
                path,
                status,
                additions,
                deletions,
            });
        }
        Ok(files)
    }

    /// Unified diff for one file; empty string when unchanged.
    pub fn diff(root: &Path, base: &str, head: &str, path: &str) -> Result<String> {
        validate_rev(base)?;
        validate_rev(head)?;
        validate_path(root, path)?;
        git(root, &["diff", base, head, "--", path])
    }

    /// Inclusive line range of a file at a revision.
    pub fn read(root: &Path, rev: &str, path: &str, start: u32, end: u32) -> Result<Vec<FileLine>> {
        validate_rev(rev)?;
        validate_path(root, path)?;
        if start == 0 || start > end {
            return Err(Error::Repo(format!("range_invalid: {start}-{end}")));
        }
        let spec = format!("{rev}:{path}");
        let content = git(root, &["show", &spec])?;
        let lines: Vec<&str> = content.lines().collect();
        if start as usize > lines.len() {
            return Err(Error::Repo(format!(
                "range_invalid: start {start} past end of file ({} lines)",
                lines.len()
            )));
        }
        let end = (end as usize).min(lines.len());
        Ok(lines[(start as usize - 1)..end]
            .iter()
            .enumerate()
            .map(|(offset, content)| FileLine {
                number: start + offset as u32,
                content: (*content).to_string(),
            })
            .collect())
    }

    /// File-scoped delta diff between two heads, used by verification.
    pub fn delta(root: &Path, prev_head: &str, new_head: &str, paths: &[String]) -> Result<String> {
        validate_rev(prev_head)?;
        validate_rev(new_head)?;
        let mut args: Vec<&str> = vec!["diff", prev_head, new_head];
        if !paths.is_empty() {
            args.push("--");
            for path in paths {
                validate_path(root, path)?;
                args.push(path);
            }
        }
        git(root, &args)
    }
}
