//! Git backend driven through the `git` command line.

use std::collections::BTreeSet;
use std::ffi::OsStr;
use std::io::Write;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::sync::Mutex;

use chrono::{DateTime, TimeZone, Utc};
use lru::LruCache;
use tracing::{debug, info, trace};

use super::{CommitInfo, LogEntry, Vcs, VcsError, VcsResult};
use crate::config::CommitConfig;
use crate::core::events::{ChangeKind, CommitRef, PathChange, SnapshotKind};
use crate::core::lock;

const BLOB_CACHE_SIZE: usize = 256;
const FIELD_SEP: char = '\x1f';
const RECORD_SEP: char = '\x1e';
const HEADER_END: char = '\x1d';

type BlobKey = (String, PathBuf);

/// Runs `git` in the watched root.
pub struct GitCli {
    root: PathBuf,
    author_name: String,
    author_email: String,
    blobs: Mutex<LruCache<BlobKey, Option<Vec<u8>>>>,
}

impl std::fmt::Debug for GitCli {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitCli").field("root", &self.root).finish()
    }
}

impl GitCli {
    pub fn new(root: impl Into<PathBuf>, commit: &CommitConfig) -> Self {
        let capacity = NonZeroUsize::new(BLOB_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN);
        Self {
            root: root.into(),
            author_name: commit.author_name.clone(),
            author_email: commit.author_email.clone(),
            blobs: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Whether a usable `git` binary is on the PATH.
    pub fn is_available() -> bool {
        Command::new("git")
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_or(false, |status| status.success())
    }

    /// Paths given to this command are taken literally.
    fn command(&self) -> Command {
        let mut cmd = self.bare_command();
        cmd.arg("--literal-pathspecs");
        cmd
    }

    fn bare_command(&self) -> Command {
        let mut cmd = Command::new("git");
        cmd.arg("-C")
            .arg(&self.root)
            .args(["-c", "core.quotepath=off", "-c", "commit.gpgsign=false"])
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("GIT_AUTHOR_NAME", &self.author_name)
            .env("GIT_AUTHOR_EMAIL", &self.author_email)
            .env("GIT_COMMITTER_NAME", &self.author_name)
            .env("GIT_COMMITTER_EMAIL", &self.author_email)
            .stdin(Stdio::null());
        cmd
    }

    /// Run a git command and return its output whatever the exit status.
    fn output<I, S>(&self, args: I) -> VcsResult<(String, Output)>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let args: Vec<S> = args.into_iter().collect();
        let described = describe(&args);
        trace!(command = %described, "Running git");
        let output = self
            .command()
            .args(&args)
            .output()
            .map_err(|source| VcsError::Spawn {
                program: "git".to_string(),
                source,
            })?;
        Ok((described, output))
    }

    /// Run a git command that has to succeed.
    fn run<I, S>(&self, args: I) -> VcsResult<Vec<u8>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let (command, output) = self.output(args)?;
        if output.status.success() {
            Ok(output.stdout)
        } else {
            Err(failure(command, &output))
        }
    }

    fn run_text<I, S>(&self, args: I) -> VcsResult<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        Ok(String::from_utf8_lossy(&self.run(args)?).into_owned())
    }

    fn in_work_tree(&self) -> VcsResult<bool> {
        let (_, output) = self.output(["rev-parse", "--is-inside-work-tree"])?;
        Ok(output.status.success() && String::from_utf8_lossy(&output.stdout).trim() == "true")
    }

    fn tracked(&self, paths: &[PathBuf]) -> VcsResult<BTreeSet<PathBuf>> {
        let mut args: Vec<&OsStr> = vec![OsStr::new("ls-files"), OsStr::new("-z"), OsStr::new("--")];
        args.extend(paths.iter().map(|p| p.as_os_str()));
        Ok(split_nul(&self.run(args)?).map(PathBuf::from).collect())
    }

    /// Paths excluded by the repository's ignore rules. Tracked files never count.
    ///
    /// `check-ignore` rejects pathspec magic, so the paths go in on stdin.
    fn ignored(&self, paths: &[PathBuf]) -> VcsResult<BTreeSet<PathBuf>> {
        let command = "git check-ignore --stdin -z".to_string();
        let mut input = Vec::new();
        for path in paths {
            input.extend_from_slice(path_for_git(path).as_bytes());
            input.push(0);
        }

        trace!(command = %command, paths = paths.len(), "Running git");
        let mut child = self
            .bare_command()
            .args(["check-ignore", "--stdin", "-z"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| VcsError::Spawn {
                program: "git".to_string(),
                source,
            })?;
        let writer = child
            .stdin
            .take()
            .map(|mut stdin| std::thread::spawn(move || stdin.write_all(&input)));
        let output = child.wait_with_output()?;

        match output.status.code() {
            Some(0) | Some(1) => {}
            _ => return Err(failure(command, &output)),
        }
        if let Some(writer) = writer {
            writer
                .join()
                .map_err(|_| VcsError::backend("check-ignore input writer panicked"))??;
        }
        Ok(split_nul(&output.stdout).map(PathBuf::from).collect())
    }

    fn last_commit(&self) -> VcsResult<CommitInfo> {
        let command = "log -1";
        let text = self.run_text(["log", "-1", "--format=%H%x1f%P%x1f%ct"])?;
        let fields: Vec<&str> = text.trim().split(FIELD_SEP).collect();
        match fields.as_slice() {
            [hash, parents, time] => Ok(CommitInfo {
                commit: parse_commit(command, hash)?,
                parent: first_parent(parents),
                timestamp: parse_time(command, time)?,
                changes: Vec::new(),
            }),
            _ => Err(malformed(command, &text)),
        }
    }
}

impl Vcs for GitCli {
    fn name(&self) -> &'static str {
        "git"
    }

    fn root(&self) -> &Path {
        &self.root
    }

    fn ensure_initialized(&self) -> VcsResult<CommitRef> {
        if !self.in_work_tree()? {
            info!("Initializing git repository in {}", self.root.display());
            self.run(["init", "-q"])?;
        }

        if let Some(head) = self.head()? {
            return Ok(head);
        }

        let name = self
            .root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.root.display().to_string());
        let message = SnapshotKind::Initial.commit_message(&format!("Start tracking {}", name));
        self.run(["commit", "-q", "--no-verify", "--allow-empty", "-m", message.as_str()])?;

        let head = self.last_commit()?.commit;
        debug!(commit = %head, "Recorded initial snapshot");
        Ok(head)
    }

    fn head(&self) -> VcsResult<Option<CommitRef>> {
        let (command, output) = self.output(["rev-parse", "--verify", "--quiet", "HEAD"])?;
        if !output.status.success() {
            return Ok(None);
        }
        let text = String::from_utf8_lossy(&output.stdout);
        parse_commit(&command, text.trim()).map(Some)
    }

    fn commit(&self, changes: &[PathChange], message: &str) -> VcsResult<CommitInfo> {
        let paths: Vec<PathBuf> = changes
            .iter()
            .flat_map(|c| c.staged_paths())
            .map(Path::to_path_buf)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if paths.is_empty() {
            return Err(VcsError::NothingToCommit);
        }

        self.run(["reset", "-q", "--", "."])?;

        let tracked = self.tracked(&paths)?;
        let ignored = self.ignored(&paths)?;
        let stage: Vec<&PathBuf> = paths
            .iter()
            .filter(|p| {
                tracked.contains(*p) || (self.root.join(p).exists() && !ignored.contains(*p))
            })
            .collect();
        if stage.is_empty() {
            return Err(VcsError::NothingToCommit);
        }

        let mut add: Vec<&OsStr> = vec![OsStr::new("add"), OsStr::new("-A"), OsStr::new("--")];
        add.extend(stage.iter().map(|p| p.as_os_str()));
        self.run(add)?;

        let (command, output) = self.output(["diff", "--cached", "--quiet", "--", "."])?;
        match output.status.code() {
            Some(0) => return Err(VcsError::NothingToCommit),
            Some(1) => {}
            _ => return Err(failure(command, &output)),
        }

        self.run(["commit", "-q", "--no-verify", "-m", message])?;
        let mut info = self.last_commit()?;
        let recorded = self.run_text([
            "show",
            "--format=",
            "--relative",
            "-M",
            "--name-status",
            "-z",
            info.commit.as_str(),
        ])?;
        info.changes = parse_name_status(&recorded);
        debug!(commit = %info.commit, paths = stage.len(), "Committed");
        Ok(info)
    }

    fn resolve(&self, commit: &CommitRef) -> VcsResult<Option<CommitRef>> {
        let spec = format!("{}^{{commit}}", commit.as_str());
        let (command, output) = self.output(["rev-parse", "--verify", "--quiet", spec.as_str()])?;
        if !output.status.success() {
            return Ok(None);
        }
        let text = String::from_utf8_lossy(&output.stdout);
        parse_commit(&command, text.trim()).map(Some)
    }

    fn read(&self, commit: &CommitRef, path: &Path) -> VcsResult<Option<Vec<u8>>> {
        let key = (commit.as_str().to_string(), path.to_path_buf());
        if let Some(cached) = lock(&self.blobs).get(&key) {
            return Ok(cached.clone());
        }

        // Only a path missing from the snapshot's tree reads as `None`. A
        // listed object that cannot be read means the snapshot is damaged.
        let name = path_for_git(path);
        let unreadable = || VcsError::UnknownRevision(format!("{}:{}", commit.as_str(), name));
        let (_, listing) = self.output(["ls-tree", "-z", commit.as_str(), "--", name.as_str()])?;
        if !listing.status.success() {
            return Err(unreadable());
        }
        let content = match find_tree_entry(&listing.stdout, &name) {
            Some(entry) if entry.kind == "blob" => {
                let (_, output) = self.output(["cat-file", "blob", entry.object.as_str()])?;
                if !output.status.success() {
                    return Err(unreadable());
                }
                Some(output.stdout)
            }
            _ => None,
        };

        lock(&self.blobs).put(key, content.clone());
        Ok(content)
    }

    fn list_files(&self, commit: &CommitRef) -> VcsResult<Vec<PathBuf>> {
        let (_, output) = self.output(["ls-tree", "-r", "--name-only", "-z", commit.as_str()])?;
        if !output.status.success() {
            return Err(VcsError::UnknownRevision(commit.to_string()));
        }
        let mut files: Vec<PathBuf> = split_nul(&output.stdout).map(PathBuf::from).collect();
        files.sort();
        Ok(files)
    }

    fn log(&self) -> VcsResult<Vec<LogEntry>> {
        if self.head()?.is_none() {
            return Ok(Vec::new());
        }
        let command = "log";
        let text = self.run_text([
            "log",
            "--reverse",
            "--relative",
            "-M",
            "--name-status",
            "-z",
            "--format=%x1e%H%x1f%P%x1f%ct%x1f%B%x1d",
        ])?;

        let mut entries = Vec::new();
        for record in text.split(RECORD_SEP).filter(|r| !r.trim().is_empty()) {
            let (header, body) = record
                .split_once(HEADER_END)
                .ok_or_else(|| malformed(command, record))?;
            let mut fields = header.splitn(4, FIELD_SEP);
            let (hash, parents, time, message) =
                match (fields.next(), fields.next(), fields.next(), fields.next()) {
                    (Some(h), Some(p), Some(t), Some(m)) => (h, p, t, m),
                    _ => return Err(malformed(command, header)),
                };

            entries.push(LogEntry {
                commit: parse_commit(command, hash.trim())?,
                parent: first_parent(parents),
                timestamp: parse_time(command, time)?,
                message: message.trim().to_string(),
                changes: parse_name_status(body),
            });
        }
        Ok(entries)
    }

    fn dirty_paths(&self) -> VcsResult<Vec<PathBuf>> {
        let mut dirty: BTreeSet<PathBuf> = split_nul(&self.run([
            "ls-files",
            "-z",
            "--modified",
            "--deleted",
            "--others",
            "--exclude-standard",
        ])?)
        .map(PathBuf::from)
        .collect();
        dirty.extend(
            split_nul(&self.run(["diff", "--cached", "--name-only", "-z", "--relative"])?)
                .map(PathBuf::from),
        );
        Ok(dirty.into_iter().collect())
    }

    fn metadata_dir(&self) -> Option<PathBuf> {
        self.run_text(["rev-parse", "--absolute-git-dir"])
            .ok()
            .map(|dir| PathBuf::from(dir.trim()))
            .filter(|dir| !dir.as_os_str().is_empty())
    }

    fn supports_renames(&self) -> bool {
        true
    }
}

fn describe<S: AsRef<OsStr>>(args: &[S]) -> String {
    let mut parts = vec!["git".to_string()];
    parts.extend(args.iter().map(|a| a.as_ref().to_string_lossy().into_owned()));
    parts.join(" ")
}

fn failure(command: String, output: &Output) -> VcsError {
    VcsError::Command {
        command,
        status: output.status.to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    }
}

fn malformed(command: &str, detail: &str) -> VcsError {
    VcsError::Malformed {
        command: command.to_string(),
        detail: detail.chars().take(200).collect(),
    }
}

fn parse_commit(command: &str, text: &str) -> VcsResult<CommitRef> {
    CommitRef::parse(text).ok_or_else(|| malformed(command, text))
}

fn first_parent(parents: &str) -> Option<CommitRef> {
    parents.split_whitespace().next().and_then(CommitRef::parse)
}

fn parse_time(command: &str, text: &str) -> VcsResult<DateTime<Utc>> {
    text.trim()
        .parse::<i64>()
        .ok()
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        .ok_or_else(|| malformed(command, text))
}

fn split_nul(bytes: &[u8]) -> impl Iterator<Item = String> + '_ {
    bytes
        .split(|b| *b == 0)
        .filter(|part| !part.is_empty())
        .map(|part| String::from_utf8_lossy(part).into_owned())
}

/// Git revision syntax always uses forward slashes.
fn path_for_git(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

struct TreeEntry {
    kind: String,
    object: String,
}

/// Find `name` in `ls-tree -z` output (`<mode> <type> <object>\t<name>`).
fn find_tree_entry(listing: &[u8], name: &str) -> Option<TreeEntry> {
    split_nul(listing).find_map(|record| {
        let (meta, entry_name) = record.split_once('\t')?;
        if entry_name != name {
            return None;
        }
        let mut fields = meta.split(' ');
        let (_mode, kind, object) = (fields.next()?, fields.next()?, fields.next()?);
        Some(TreeEntry {
            kind: kind.to_string(),
            object: object.to_string(),
        })
    })
}

/// Parse `--name-status -z` output. Status letters and paths are separate
/// NUL-terminated fields; renames and copies carry two paths. Names are never
/// quoted in this form.
fn parse_name_status(body: &str) -> Vec<PathChange> {
    let mut changes = Vec::new();
    let mut fields = body.split('\0');
    while let Some(field) = fields.next() {
        let status = field.trim_matches(|c: char| c == '\n' || c == '\r');
        let change = match status.chars().next() {
            None => continue,
            Some('A') => fields.next().map(|path| PathChange::new(path, ChangeKind::Added)),
            Some('M') | Some('T') => {
                fields.next().map(|path| PathChange::new(path, ChangeKind::Modified))
            }
            Some('D') => fields.next().map(|path| PathChange::new(path, ChangeKind::Deleted)),
            Some('R') => match (fields.next(), fields.next()) {
                (Some(from), Some(to)) => Some(PathChange::new(
                    to,
                    ChangeKind::Renamed {
                        from: PathBuf::from(from),
                    },
                )),
                _ => None,
            },
            Some('C') => match (fields.next(), fields.next()) {
                (Some(_), Some(to)) => Some(PathChange::new(to, ChangeKind::Added)),
                _ => None,
            },
            Some(_) => {
                trace!(status, "Skipping unrecognised name-status field");
                continue;
            }
        };
        match change {
            Some(change) => changes.push(change),
            None => trace!(status, "Name-status entry without its path"),
        }
    }
    changes.sort_by(|a, b| a.path.cmp(&b.path));
    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn repo() -> Option<(TempDir, GitCli)> {
        if !GitCli::is_available() {
            eprintln!("git not found on PATH, skipping");
            return None;
        }
        let dir = TempDir::new().unwrap();
        let git = GitCli::new(dir.path(), &CommitConfig::default());
        git.ensure_initialized().unwrap();
        Some((dir, git))
    }

    fn msg(subject: &str) -> String {
        SnapshotKind::Auto.commit_message(subject)
    }

    #[test]
    fn test_parse_name_status() {
        let body = "\0\nM\0notes.txt\0R100\0old.txt\0new.txt\0A\0docs/a.md\0D\0gone.txt\0";
        let changes = parse_name_status(body);

        assert_eq!(
            changes,
            vec![
                PathChange::new("docs/a.md", ChangeKind::Added),
                PathChange::new("gone.txt", ChangeKind::Deleted),
                PathChange::new(
                    "new.txt",
                    ChangeKind::Renamed {
                        from: PathBuf::from("old.txt")
                    }
                ),
                PathChange::new("notes.txt", ChangeKind::Modified),
            ]
        );
    }

    #[test]
    fn test_bootstrap_records_initial_snapshot() {
        let Some((_dir, git)) = repo() else { return };

        let log = git.log().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(SnapshotKind::from_message(&log[0].message), SnapshotKind::Initial);
        assert!(log[0].changes.is_empty());

        // Idempotent
        let head = git.head().unwrap().unwrap();
        assert_eq!(git.ensure_initialized().unwrap(), head);
    }

    #[test]
    fn test_commit_and_read_back() {
        let Some((dir, git)) = repo() else { return };

        fs::write(dir.path().join("notes.txt"), "v1").unwrap();
        let first = git
            .commit(&[PathChange::new("notes.txt", ChangeKind::Added)], &msg("Add notes.txt"))
            .unwrap();

        fs::write(dir.path().join("notes.txt"), "v2").unwrap();
        let second = git
            .commit(&[PathChange::new("notes.txt", ChangeKind::Modified)], &msg("Modify notes.txt"))
            .unwrap();

        assert_eq!(second.parent, Some(first.commit.clone()));
        assert_eq!(
            git.read(&first.commit, Path::new("notes.txt")).unwrap(),
            Some(b"v1".to_vec())
        );
        assert_eq!(
            git.read(&second.commit, Path::new("notes.txt")).unwrap(),
            Some(b"v2".to_vec())
        );
        assert_eq!(git.read(&first.commit, Path::new("missing.txt")).unwrap(), None);
        assert_eq!(git.list_files(&second.commit).unwrap(), vec![PathBuf::from("notes.txt")]);
    }

    #[test]
    fn test_unchanged_content_is_nothing_to_commit() {
        let Some((dir, git)) = repo() else { return };

        fs::write(dir.path().join("a.txt"), "same").unwrap();
        git.commit(&[PathChange::new("a.txt", ChangeKind::Added)], &msg("Add a.txt"))
            .unwrap();

        let again = git.commit(&[PathChange::new("a.txt", ChangeKind::Modified)], &msg("Modify a.txt"));
        assert!(matches!(again, Err(VcsError::NothingToCommit)));
    }

    #[test]
    fn test_log_reports_renames_and_deletes() {
        let Some((dir, git)) = repo() else { return };

        fs::write(dir.path().join("old.txt"), "some reasonably long content\n").unwrap();
        git.commit(&[PathChange::new("old.txt", ChangeKind::Added)], &msg("Add old.txt"))
            .unwrap();

        fs::rename(dir.path().join("old.txt"), dir.path().join("new.txt")).unwrap();
        let rename = PathChange::new(
            "new.txt",
            ChangeKind::Renamed {
                from: PathBuf::from("old.txt"),
            },
        );
        git.commit(&[rename.clone()], &msg("Rename old.txt to new.txt"))
            .unwrap();

        let log = git.log().unwrap();
        assert_eq!(log.len(), 3);
        assert_eq!(log[2].changes, vec![rename]);
        assert_eq!(log[2].subject(), "Rename old.txt to new.txt");
    }

    #[test]
    fn test_resolve_abbreviated_and_unknown() {
        let Some((_dir, git)) = repo() else { return };

        let head = git.head().unwrap().unwrap();
        let short = CommitRef::parse(head.short()).unwrap();

        assert_eq!(git.resolve(&short).unwrap(), Some(head));
        let unknown = CommitRef::parse("deadbeefdeadbeefdeadbeefdeadbeefdeadbeef").unwrap();
        assert_eq!(git.resolve(&unknown).unwrap(), None);
    }

    #[test]
    fn test_dirty_paths_and_ignored_files() {
        let Some((dir, git)) = repo() else { return };

        fs::write(dir.path().join(".gitignore"), "*.log\n").unwrap();
        fs::write(dir.path().join("draft.txt"), "draft").unwrap();
        fs::write(dir.path().join("debug.log"), "noise").unwrap();

        let dirty = git.dirty_paths().unwrap();
        assert!(dirty.contains(&PathBuf::from("draft.txt")));
        assert!(dirty.contains(&PathBuf::from(".gitignore")));
        assert!(!dirty.contains(&PathBuf::from("debug.log")));

        let info = git
            .commit(
                &[
                    PathChange::new("draft.txt", ChangeKind::Added),
                    PathChange::new("debug.log", ChangeKind::Added),
                ],
                &msg("Update 2 files"),
            )
            .unwrap();
        assert_eq!(git.list_files(&info.commit).unwrap(), vec![PathBuf::from("draft.txt")]);
    }

    #[test]
    fn test_names_git_would_quote_are_kept_verbatim() {
        let Some((dir, git)) = repo() else { return };

        let name = "say \"hi\" \\ twice.txt";
        fs::write(dir.path().join(name), "hi").unwrap();
        let info = git
            .commit(&[PathChange::new(name, ChangeKind::Added)], &msg("Add quoted file"))
            .unwrap();

        assert_eq!(info.changes, vec![PathChange::new(name, ChangeKind::Added)]);
        let log = git.log().unwrap();
        assert_eq!(log[1].changes, info.changes);
        assert_eq!(git.read(&info.commit, Path::new(name)).unwrap(), Some(b"hi".to_vec()));
    }

    #[test]
    fn test_missing_blob_is_unreadable_not_absent() {
        let Some((dir, git)) = repo() else { return };

        fs::write(dir.path().join("a.txt"), "only stored once").unwrap();
        let info = git
            .commit(&[PathChange::new("a.txt", ChangeKind::Added)], &msg("Add a.txt"))
            .unwrap();

        let spec = format!("{}:a.txt", info.commit.as_str());
        let output = Command::new("git")
            .arg("-C")
            .arg(dir.path())
            .args(["rev-parse", spec.as_str()])
            .output()
            .unwrap();
        let blob = String::from_utf8(output.stdout).unwrap().trim().to_string();
        fs::remove_file(dir.path().join(".git/objects").join(&blob[..2]).join(&blob[2..])).unwrap();

        assert!(matches!(
            git.read(&info.commit, Path::new("a.txt")),
            Err(VcsError::UnknownRevision(_))
        ));
        assert_eq!(git.read(&info.commit, Path::new("never.txt")).unwrap(), None);
    }
}
