//! Git adapter: every interaction with a repository goes through a spawned
//! `git` subprocess with a normalized environment.
//!
//! Calls take an explicit [`GitContext`] so parallel tasks can operate on
//! different working directories at the same time. The context forces
//! `TZ=UTC` and `LANG=C` into the child so porcelain output is stable, caps
//! captured stdout, and turns every non-zero exit into a structured
//! [`GitvanError::GitError`]. Diagnostics go to `tracing`, never stdout.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use tracing::debug;

use crate::error::GitvanError;
use crate::process::{CommandOutput, run_command};

/// Ambient state for git calls: where to run, what binary, extra env.
#[derive(Debug, Clone)]
pub struct GitContext {
    pub repo_dir: PathBuf,
    /// Extra environment on top of the forced `TZ`/`LANG`.
    pub env: Vec<(String, String)>,
    binary: String,
    /// Per-call deadline; expiry kills the subprocess.
    pub timeout: Option<Duration>,
}

impl GitContext {
    /// Context for a repository directory. The binary comes from
    /// `GITVAN_GIT_BIN` when set, else `git` on PATH.
    pub fn new(repo_dir: impl Into<PathBuf>) -> Self {
        Self {
            repo_dir: repo_dir.into(),
            env: Vec::new(),
            binary: env::var("GITVAN_GIT_BIN").unwrap_or_else(|_| "git".to_string()),
            timeout: Some(Duration::from_secs(120)),
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Same binary and env, different working directory.
    pub fn at(&self, repo_dir: impl Into<PathBuf>) -> Self {
        Self {
            repo_dir: repo_dir.into(),
            env: self.env.clone(),
            binary: self.binary.clone(),
            timeout: self.timeout,
        }
    }

    fn exec(&self, args: &[&str]) -> Result<CommandOutput> {
        let mut env: Vec<(&str, &str)> = vec![("TZ", "UTC"), ("LANG", "C"), ("LC_ALL", "C")];
        for (k, v) in &self.env {
            env.push((k, v));
        }

        debug!(target: "gitvan::git", args = ?args, cwd = %self.repo_dir.display(), "spawning git");
        let out = run_command(&self.binary, args, &self.repo_dir, &env, self.timeout)
            .with_context(|| format!("failed to run git {}", args.first().unwrap_or(&"")))?;

        let command = args.first().copied().unwrap_or("").to_string();
        if out.timed_out {
            return Err(GitvanError::GitError {
                command,
                exit_code: out.exit_code,
                stderr: "killed: deadline exceeded".to_string(),
            }
            .into());
        }
        if out.truncated {
            return Err(GitvanError::GitError {
                command,
                exit_code: out.exit_code,
                stderr: "stdout exceeded the 12 MiB capture cap".to_string(),
            }
            .into());
        }
        if out.exit_code != 0 {
            return Err(GitvanError::GitError {
                command,
                exit_code: out.exit_code,
                stderr: out.stderr.trim().to_string(),
            }
            .into());
        }
        Ok(out)
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        Ok(self.exec(args)?.stdout)
    }

    /// `git log` with an explicit format and entry limit.
    pub fn log(&self, format: &str, limit: usize) -> Result<String> {
        let n = limit.to_string();
        let fmt = format!("--pretty=format:{format}");
        self.run(&["log", "-n", &n, &fmt])
    }

    /// Subject and body of the HEAD commit.
    pub fn head_message(&self) -> Result<String> {
        self.run(&["log", "-1", "--pretty=format:%s%n%b"])
    }

    /// `git status --porcelain` lines.
    pub fn status_porcelain(&self) -> Result<String> {
        self.run(&["status", "--porcelain"])
    }

    /// Current branch name; `None` when HEAD is detached.
    pub fn current_branch(&self) -> Result<Option<String>> {
        let out = self.run(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let branch = out.trim().to_string();
        Ok(if branch == "HEAD" { None } else { Some(branch) })
    }

    pub fn add(&self, paths: &[&str]) -> Result<()> {
        let mut args = vec!["add", "--"];
        args.extend_from_slice(paths);
        self.run(&args).map(|_| ())
    }

    pub fn commit(&self, message: &str) -> Result<()> {
        self.run(&["commit", "-m", message]).map(|_| ())
    }

    pub fn checkout(&self, reference: &str) -> Result<()> {
        self.run(&["checkout", reference]).map(|_| ())
    }

    pub fn merge(&self, reference: &str) -> Result<()> {
        self.run(&["merge", "--no-edit", reference]).map(|_| ())
    }

    /// Overwrite the note on `object` under `notes_ref` with `payload`.
    /// Append semantics belong to the receipt store, which rewrites the
    /// whole note in one add.
    pub fn notes_add(&self, notes_ref: &str, object: &str, payload: &str) -> Result<()> {
        self.run(&["notes", "--ref", notes_ref, "add", "-f", "-m", payload, object])
            .map(|_| ())
    }

    /// The note attached to `object`, or `None` when absent.
    pub fn notes_show(&self, notes_ref: &str, object: &str) -> Result<Option<String>> {
        match self.run(&["notes", "--ref", notes_ref, "show", object]) {
            Ok(out) => Ok(Some(out)),
            Err(err) => {
                // "no note found" is an expected miss, not a failure.
                if let Some(GitvanError::GitError { stderr, .. }) =
                    err.downcast_ref::<GitvanError>()
                {
                    if stderr.contains("no note found") {
                        return Ok(None);
                    }
                }
                Err(err)
            }
        }
    }

    /// `(note_object, annotated_object)` pairs under `notes_ref`.
    pub fn notes_list(&self, notes_ref: &str) -> Result<Vec<(String, String)>> {
        let out = match self.run(&["notes", "--ref", notes_ref, "list"]) {
            Ok(out) => out,
            Err(err) => {
                // A never-written notes ref lists as an error; treat as empty.
                if let Some(GitvanError::GitError { .. }) = err.downcast_ref::<GitvanError>() {
                    return Ok(Vec::new());
                }
                return Err(err);
            }
        };
        Ok(out
            .lines()
            .filter_map(|line| {
                let mut it = line.split_whitespace();
                Some((it.next()?.to_string(), it.next()?.to_string()))
            })
            .collect())
    }

    /// Hash a ref resolves to, or `None` when it does not exist.
    pub fn show_ref(&self, name: &str) -> Result<Option<String>> {
        match self.run(&["show-ref", "--hash", "--verify", name]) {
            Ok(out) => Ok(Some(out.trim().to_string())),
            Err(err) => {
                if let Some(GitvanError::GitError { .. }) = err.downcast_ref::<GitvanError>() {
                    return Ok(None);
                }
                Err(err)
            }
        }
    }

    pub fn rev_parse(&self, rev: &str) -> Result<String> {
        Ok(self.run(&["rev-parse", rev])?.trim().to_string())
    }

    /// Parent hashes of a commit; more than one means a merge.
    pub fn parents(&self, rev: &str) -> Result<Vec<String>> {
        let fmt = format!("{rev}^@");
        match self.run(&["rev-parse", &fmt]) {
            Ok(out) => Ok(out.lines().map(|l| l.trim().to_string()).collect()),
            // Root commits have no parents to parse.
            Err(_) => Ok(Vec::new()),
        }
    }

    /// Paths changed between two commits.
    pub fn diff_name_only(&self, from: &str, to: &str) -> Result<Vec<String>> {
        let range = format!("{from}..{to}");
        let out = self.run(&["diff", "--name-only", &range])?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Tags pointing at the given commit.
    pub fn tags_at(&self, rev: &str) -> Result<Vec<String>> {
        let out = self.run(&["tag", "--points-at", rev])?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Shallow clone into `dest`, optionally pinned to a branch or tag.
    pub fn clone_repo(&self, url: &str, reference: Option<&str>, dest: &Path) -> Result<()> {
        let dest_str = dest.to_string_lossy().to_string();
        let mut args = vec!["clone", "--depth", "1"];
        if let Some(r) = reference {
            args.push("--branch");
            args.push(r);
        }
        args.push(url);
        args.push(&dest_str);
        self.run(&args).map(|_| ())
    }

    /// Initialize a repository (scaffolding and tests).
    pub fn init(&self) -> Result<()> {
        self.run(&["init", "--quiet", "--initial-branch", "main"])
            .map(|_| ())
    }

    /// Current instant as an ISO-8601 UTC string, the timestamp format used
    /// in receipts.
    pub fn now_iso(&self) -> String {
        Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::fs;
    use std::path::Path;

    use super::*;

    /// `git init` plus identity config, ready for commits.
    pub(crate) fn scratch_repo(dir: &Path) -> GitContext {
        let ctx = GitContext::new(dir);
        ctx.init().expect("git init");
        ctx.run(&["config", "user.email", "test@gitvan.dev"])
            .expect("config email");
        ctx.run(&["config", "user.name", "gitvan test"])
            .expect("config name");
        ctx
    }

    pub(crate) fn commit_file(ctx: &GitContext, rel: &str, content: &str, message: &str) -> String {
        let path = ctx.repo_dir.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("mkdir");
        }
        fs::write(&path, content).expect("write");
        ctx.add(&[rel]).expect("git add");
        ctx.commit(message).expect("git commit");
        ctx.rev_parse("HEAD").expect("rev-parse")
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::testutil::{commit_file, scratch_repo};
    use super::*;
    use crate::error::{ErrorKind, GitvanError};

    #[test]
    fn rev_parse_returns_head_hash() {
        let td = tempdir().expect("tempdir");
        let ctx = scratch_repo(td.path());
        let sha = commit_file(&ctx, "a.txt", "one", "first");
        assert_eq!(sha.len(), 40);
        assert_eq!(ctx.rev_parse("HEAD").expect("rev-parse"), sha);
    }

    #[test]
    fn current_branch_is_main_for_scratch_repo() {
        let td = tempdir().expect("tempdir");
        let ctx = scratch_repo(td.path());
        commit_file(&ctx, "a.txt", "one", "first");
        assert_eq!(ctx.current_branch().expect("branch").as_deref(), Some("main"));
    }

    #[test]
    fn head_message_includes_subject_and_body() {
        let td = tempdir().expect("tempdir");
        let ctx = scratch_repo(td.path());
        commit_file(&ctx, "a.txt", "one", "release: v1.0.0\n\nnotes here");
        let msg = ctx.head_message().expect("message");
        assert!(msg.starts_with("release: v1.0.0"));
        assert!(msg.contains("notes here"));
    }

    #[test]
    fn diff_name_only_lists_changed_paths() {
        let td = tempdir().expect("tempdir");
        let ctx = scratch_repo(td.path());
        let first = commit_file(&ctx, "a.txt", "one", "first");
        let second = commit_file(&ctx, "src/lib.rs", "pub fn x() {}", "second");
        let changed = ctx.diff_name_only(&first, &second).expect("diff");
        assert_eq!(changed, vec!["src/lib.rs".to_string()]);
    }

    #[test]
    fn notes_roundtrip_and_missing_note_is_none() {
        let td = tempdir().expect("tempdir");
        let ctx = scratch_repo(td.path());
        let sha = commit_file(&ctx, "a.txt", "one", "first");

        let notes_ref = "refs/notes/gitvan/results";
        assert!(ctx.notes_show(notes_ref, &sha).expect("show").is_none());

        ctx.notes_add(notes_ref, &sha, "{\"role\":\"receipt\"}")
            .expect("add note");
        let shown = ctx.notes_show(notes_ref, &sha).expect("show").expect("note");
        assert!(shown.contains("receipt"));

        let listed = ctx.notes_list(notes_ref).expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].1, sha);
    }

    #[test]
    fn notes_list_of_unwritten_ref_is_empty() {
        let td = tempdir().expect("tempdir");
        let ctx = scratch_repo(td.path());
        commit_file(&ctx, "a.txt", "one", "first");
        assert!(ctx.notes_list("refs/notes/gitvan/results").expect("list").is_empty());
    }

    #[test]
    fn parents_detect_merges() {
        let td = tempdir().expect("tempdir");
        let ctx = scratch_repo(td.path());
        commit_file(&ctx, "a.txt", "one", "first");
        assert!(ctx.parents("HEAD").expect("parents").len() <= 1);

        ctx.run(&["checkout", "-b", "feature"]).expect("branch");
        commit_file(&ctx, "b.txt", "two", "feature work");
        ctx.checkout("main").expect("checkout");
        commit_file(&ctx, "c.txt", "three", "main work");
        ctx.merge("feature").expect("merge");

        assert_eq!(ctx.parents("HEAD").expect("parents").len(), 2);
    }

    #[test]
    fn tags_at_head_after_tagging() {
        let td = tempdir().expect("tempdir");
        let ctx = scratch_repo(td.path());
        commit_file(&ctx, "a.txt", "one", "first");
        ctx.run(&["tag", "v1.0.0"]).expect("tag");
        assert_eq!(ctx.tags_at("HEAD").expect("tags"), vec!["v1.0.0".to_string()]);
    }

    #[test]
    fn failures_carry_git_error_kind() {
        let td = tempdir().expect("tempdir");
        let ctx = scratch_repo(td.path());
        let err = ctx.rev_parse("HEAD").expect_err("empty repo has no HEAD");
        assert_eq!(ErrorKind::classify(&err), ErrorKind::GitError);
        let git_err = err.downcast_ref::<GitvanError>().expect("structured");
        assert!(matches!(git_err, GitvanError::GitError { exit_code, .. } if *exit_code != 0));
    }

    #[allow(unsafe_code)]
    mod binary_override {
        use std::env;
        use std::fs;

        use serial_test::serial;

        use super::*;

        struct EnvGuard {
            key: String,
            old: Option<String>,
        }

        impl EnvGuard {
            fn set(key: &str, value: &str) -> Self {
                let old = env::var(key).ok();
                unsafe { env::set_var(key, value) };
                Self {
                    key: key.to_string(),
                    old,
                }
            }
        }

        impl Drop for EnvGuard {
            fn drop(&mut self) {
                match &self.old {
                    Some(v) => unsafe { env::set_var(&self.key, v) },
                    None => unsafe { env::remove_var(&self.key) },
                }
            }
        }

        #[cfg(unix)]
        fn write_fake_git(bin_dir: &std::path::Path) -> std::path::PathBuf {
            use std::os::unix::fs::PermissionsExt;

            let path = bin_dir.join("git");
            fs::write(
                &path,
                "#!/usr/bin/env sh\necho 'fatal: fake git always fails' >&2\nexit 128\n",
            )
            .expect("write fake git");
            let mut perms = fs::metadata(&path).expect("meta").permissions();
            perms.set_mode(0o755);
            fs::set_permissions(&path, perms).expect("chmod");
            path
        }

        #[cfg(unix)]
        #[test]
        #[serial]
        fn gitvan_git_bin_overrides_the_binary() {
            let td = tempdir().expect("tempdir");
            let bin = td.path().join("bin");
            fs::create_dir_all(&bin).expect("mkdir");
            let fake = write_fake_git(&bin);
            let _guard = EnvGuard::set("GITVAN_GIT_BIN", fake.to_str().expect("utf8"));

            let ctx = GitContext::new(td.path());
            let err = ctx.rev_parse("HEAD").expect_err("fake git fails");
            let git_err = err.downcast_ref::<GitvanError>().expect("structured");
            assert!(matches!(
                git_err,
                GitvanError::GitError { exit_code: 128, stderr, .. }
                    if stderr.contains("fake git always fails")
            ));
        }
    }

    #[test]
    fn show_ref_none_for_missing_ref() {
        let td = tempdir().expect("tempdir");
        let ctx = scratch_repo(td.path());
        commit_file(&ctx, "a.txt", "one", "first");
        assert!(ctx.show_ref("refs/heads/nope").expect("show-ref").is_none());
        assert!(ctx.show_ref("refs/heads/main").expect("show-ref").is_some());
    }
}
