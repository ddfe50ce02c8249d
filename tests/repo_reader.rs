mod common;

use std::path::Path;

use arv::repo::{BranchType, FileStatus, RepoReader};
use common::*;

#[test]
fn validate_resolves_root_and_branch() {
    let repo = setup_review_repo();
    let info = RepoReader::validate(&repo.path().to_string_lossy()).unwrap();
    assert!(info.valid);
    assert_eq!(info.current_branch, "main");
    assert_eq!(
        std::fs::canonicalize(&info.root).unwrap(),
        std::fs::canonicalize(repo.path()).unwrap()
    );
}

#[test]
fn validate_rejects_non_repo_and_missing_paths() {
    let plain = tempfile::TempDir::new().unwrap();
    let err = RepoReader::validate(&plain.path().to_string_lossy()).unwrap_err();
    assert!(err.to_string().contains("not_a_repo"));

    let err = RepoReader::validate("/no/such/dir").unwrap_err();
    assert!(err.to_string().contains("invalid_path"));
}

#[test]
fn branches_lists_local_heads() {
    let repo = setup_review_repo();
    let branches = RepoReader::branches(repo.path()).unwrap();
    let locals: Vec<&str> = branches
        .iter()
        .filter(|b| b.branch_type == BranchType::Local)
        .map(|b| b.name.as_str())
        .collect();
    assert!(locals.contains(&"main"));
    assert!(locals.contains(&"feature"));
}

#[test]
fn files_reports_status_and_counts() {
    let repo = setup_review_repo();
    let files = RepoReader::files(repo.path(), "main", "feature").unwrap();
    assert_eq!(files.len(), 2);

    let added = files.iter().find(|f| f.path == "src/loop.rs").unwrap();
    assert_eq!(added.status, FileStatus::Added);
    assert!(added.additions > 0);
    assert_eq!(added.deletions, 0);

    let modified = files.iter().find(|f| f.path == "src/parse.go").unwrap();
    assert_eq!(modified.status, FileStatus::Modified);
    assert!(modified.additions > 0);
}

#[test]
fn files_rejects_unknown_refs() {
    let repo = setup_review_repo();
    let err = RepoReader::files(repo.path(), "main", "no-such-branch").unwrap_err();
    assert!(err.to_string().contains("no_such_ref"));
    assert_eq!(err.http_status(), 422);
}

#[test]
fn diff_returns_unified_text_and_empty_for_unchanged() {
    let repo = setup_review_repo();
    let diff = RepoReader::diff(repo.path(), "main", "feature", "src/parse.go").unwrap();
    assert!(diff.contains("--- a/src/parse.go"));
    assert!(diff.contains("+\tif s == \"\" {"));

    // A path untouched by the range diffs to nothing.
    let diff = RepoReader::diff(repo.path(), "main", "main", "src/parse.go").unwrap();
    assert!(diff.is_empty());
}

#[test]
fn diff_rejects_traversal() {
    let repo = setup_review_repo();
    let err = RepoReader::diff(repo.path(), "main", "feature", "../outside.txt").unwrap_err();
    assert!(err.to_string().contains("no_such_path"));
}

#[test]
fn read_returns_numbered_inclusive_range() {
    let repo = setup_review_repo();
    let lines = RepoReader::read(repo.path(), "feature", "src/loop.rs", 1, 3).unwrap();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0].number, 1);
    assert_eq!(lines[0].content, "fn total(xs: &[u32]) -> u32 {");
    assert_eq!(lines[2].number, 3);

    // End past EOF clamps; start past EOF is range_invalid.
    let lines = RepoReader::read(repo.path(), "feature", "src/loop.rs", 6, 99).unwrap();
    assert_eq!(lines.last().unwrap().number, 7);
    let err = RepoReader::read(repo.path(), "feature", "src/loop.rs", 100, 200).unwrap_err();
    assert!(err.to_string().contains("range_invalid"));
    let err = RepoReader::read(repo.path(), "feature", "src/loop.rs", 5, 2).unwrap_err();
    assert!(err.to_string().contains("range_invalid"));
    let err = RepoReader::read(repo.path(), "feature", "src/loop.rs", 0, 2).unwrap_err();
    assert!(err.to_string().contains("range_invalid"));
}

#[test]
fn delta_scopes_to_requested_paths() {
    let repo = setup_review_repo();
    let fix = add_fix_commit(repo.path());

    // The fix touched src/loop.rs only.
    let delta =
        RepoReader::delta(repo.path(), "feature", &fix, &["src/loop.rs".to_string()]).unwrap();
    assert!(delta.contains("src/loop.rs"));
    assert!(delta.contains("xs.iter().sum()"));

    let delta =
        RepoReader::delta(repo.path(), "feature", &fix, &["src/parse.go".to_string()]).unwrap();
    assert!(delta.is_empty());

    // Unscoped delta covers everything that changed.
    let delta = RepoReader::delta(repo.path(), "feature", &fix, &[]).unwrap();
    assert!(delta.contains("src/loop.rs"));
}

#[test]
fn read_missing_file_is_no_such_path() {
    let repo = setup_review_repo();
    let err = RepoReader::read(repo.path(), "feature", "src/nope.rs", 1, 5).unwrap_err();
    let msg = err.to_string();
    assert!(
        msg.contains("no_such_path") || msg.contains("does not exist"),
        "unexpected error: {msg}"
    );
}

#[test]
fn operations_are_reentrant() {
    let repo = setup_review_repo();
    let path: &Path = repo.path();
    // Same inputs, same outputs, no hidden state between calls.
    let first = RepoReader::files(path, "main", "feature").unwrap();
    let second = RepoReader::files(path, "main", "feature").unwrap();
    assert_eq!(
        first.iter().map(|f| &f.path).collect::<Vec<_>>(),
        second.iter().map(|f| &f.path).collect::<Vec<_>>()
    );
}
