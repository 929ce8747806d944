//! Async adapter over an MH mail store.
//!
//! An MH folder is a directory; each message is a file named by a decimal
//! *message key*, and named key sets live in the `.mh_sequences` text file
//! (`name: 1 3-5 9`). External agents (delivery, other MH tools) mutate
//! folders behind our back; the advisory dot-lock is the only coordination
//! between processes.

use std::{
    collections::{BTreeMap, BTreeSet},
    io::ErrorKind,
    path::{Path, PathBuf},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use log::{debug, warn};
use tokio::io::AsyncWriteExt;

use crate::error::MailboxError;

/// Name-to-ordered-key-set mapping from `.mh_sequences`.
pub type Sequences = BTreeMap<String, BTreeSet<u32>>;

const SEQUENCES_FILE: &str = ".mh_sequences";
const LOCK_SUFFIX: &str = ".lock";

/// One MH folder on disk.
#[derive(Debug, Clone)]
pub struct MhFolder {
    name: String,
    path: PathBuf,
    lock_timeout: Duration,
}

/// Advisory dot-lock over a folder. Dropped (or [`unlock`]ed) it removes
/// the lock file; other *processes* honouring the convention stay out while
/// it exists.
///
/// [`unlock`]: FolderLock::unlock
#[derive(Debug)]
pub struct FolderLock {
    lock_path: Option<PathBuf>,
}

impl FolderLock {
    pub fn unlock(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(path) = self.lock_path.take() {
            if let Err(error) = std::fs::remove_file(&path) {
                warn!("failed to remove lock file {}: {error}", path.display());
            }
        }
    }
}

impl Drop for FolderLock {
    fn drop(&mut self) {
        self.release();
    }
}

impl MhFolder {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, lock_timeout: Duration) -> Self {
        MhFolder {
            name: name.into(),
            path: path.into(),
            lock_timeout,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn message_path(&self, key: u32) -> PathBuf {
        self.path.join(key.to_string())
    }

    fn sequences_path(&self) -> PathBuf {
        self.path.join(SEQUENCES_FILE)
    }

    fn inconsistency(&self, reason: impl Into<String>) -> MailboxError {
        MailboxError::Inconsistency {
            mailbox: self.name.clone(),
            reason: reason.into(),
        }
    }

    /// Acquire the advisory dot-lock, polling until the configured timeout.
    ///
    /// Dot-locking touches the folder, so callers must read the folder
    /// mtime before locking if they intend to compare it later.
    pub async fn lock(&self) -> Result<FolderLock, MailboxError> {
        let lock_path = self.path.join(format!("{SEQUENCES_FILE}{LOCK_SUFFIX}"));
        let deadline = tokio::time::Instant::now() + self.lock_timeout;

        loop {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
            {
                Ok(_) => {
                    return Ok(FolderLock {
                        lock_path: Some(lock_path),
                    })
                }
                Err(error) if error.kind() == ErrorKind::AlreadyExists => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(MailboxError::Lock(self.name.clone()));
                    }
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                Err(error) => return Err(error.into()),
            }
        }
    }

    /// Sorted message keys currently in the folder.
    pub async fn keys(&self) -> Result<Vec<u32>, MailboxError> {
        let mut dir = tokio::fs::read_dir(&self.path).await?;
        let mut keys = Vec::new();

        while let Some(entry) = dir.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry.file_name();
            if let Some(name) = name.to_str() {
                if !name.is_empty() && name.bytes().all(|b| b.is_ascii_digit()) {
                    if let Ok(key) = name.parse::<u32>() {
                        keys.push(key);
                    }
                }
            }
        }

        keys.sort_unstable();
        Ok(keys)
    }

    pub async fn get_bytes(&self, key: u32) -> Result<Vec<u8>, MailboxError> {
        match tokio::fs::read(self.message_path(key)).await {
            Ok(bytes) => Ok(bytes),
            Err(error) if error.kind() == ErrorKind::NotFound => {
                Err(MailboxError::NoSuchMessage {
                    mailbox: self.name.clone(),
                    key,
                })
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Overwrite a message in place, keeping the file's mtime; the mtime
    /// is the message's INTERNALDATE and re-stamping a UID header must not
    /// move it.
    pub async fn set_bytes_preserving_mtime(
        &self,
        key: u32,
        bytes: &[u8],
    ) -> Result<(), MailboxError> {
        let path = self.message_path(key);
        let mtime = tokio::fs::metadata(&path).await?.modified()?;
        tokio::fs::write(&path, bytes).await?;
        set_file_mtime(&path, mtime)?;
        Ok(())
    }

    /// Add a message; the new key is one past the highest in use (`0` in an
    /// empty folder). `sequences` names the sequences the message starts
    /// out in.
    pub async fn add(&self, bytes: &[u8], sequences: &[String]) -> Result<u32, MailboxError> {
        let keys = self.keys().await?;
        let new_key = keys.last().map(|key| key + 1).unwrap_or(0);
        let path = self.message_path(new_key);

        let mut file = tokio::fs::File::create(&path).await?;
        file.write_all(bytes).await?;
        if !bytes.ends_with(b"\n") {
            file.write_all(b"\n").await?;
        }
        file.sync_all().await?;

        if !sequences.is_empty() {
            let mut on_disk = self.get_sequences().await?;
            for name in sequences {
                on_disk.entry(name.clone()).or_default().insert(new_key);
            }
            self.set_sequences(&on_disk).await?;
        }

        debug!("{}: added message key {new_key}", self.name);
        Ok(new_key)
    }

    pub async fn remove(&self, key: u32) -> Result<(), MailboxError> {
        match tokio::fs::remove_file(self.message_path(key)).await {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == ErrorKind::NotFound => {
                Err(MailboxError::NoSuchMessage {
                    mailbox: self.name.clone(),
                    key,
                })
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Read `.mh_sequences`. Keys no longer present in the folder are
    /// dropped, as are sequences that end up empty. A missing file is an
    /// empty map; a malformed line is an inconsistency.
    pub async fn get_sequences(&self) -> Result<Sequences, MailboxError> {
        let text = match tokio::fs::read_to_string(self.sequences_path()).await {
            Ok(text) => text,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(Sequences::new()),
            Err(error) => return Err(error.into()),
        };

        let all_keys: BTreeSet<u32> = self.keys().await?.into_iter().collect();
        let mut sequences = Sequences::new();

        for line in text.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let Some((name, specs)) = line.split_once(':') else {
                return Err(
                    self.inconsistency(format!("invalid sequence specification: {line}"))
                );
            };

            let mut keys = BTreeSet::new();
            for spec in specs.split_whitespace() {
                if let Some((start, stop)) = spec.split_once('-') {
                    let (start, stop) = (
                        start.parse::<u32>().map_err(|_| {
                            self.inconsistency(format!("invalid sequence specification: {line}"))
                        })?,
                        stop.parse::<u32>().map_err(|_| {
                            self.inconsistency(format!("invalid sequence specification: {line}"))
                        })?,
                    );
                    keys.extend(start..=stop);
                } else {
                    keys.insert(spec.parse::<u32>().map_err(|_| {
                        self.inconsistency(format!("invalid sequence specification: {line}"))
                    })?);
                }
            }

            keys.retain(|key| all_keys.contains(key));
            if !keys.is_empty() {
                sequences.insert(name.trim().to_string(), keys);
            }
        }

        Ok(sequences)
    }

    /// Rewrite `.mh_sequences` atomically (write-to-temp then rename).
    /// Empty sequences are omitted; runs collapse to `a-b`.
    pub async fn set_sequences(&self, sequences: &Sequences) -> Result<(), MailboxError> {
        let mut text = String::new();
        for (name, keys) in sequences {
            if keys.is_empty() {
                continue;
            }
            text.push_str(name);
            text.push(':');
            for (start, stop) in collapse_runs(keys) {
                if start == stop {
                    text.push_str(&format!(" {start}"));
                } else {
                    text.push_str(&format!(" {start}-{stop}"));
                }
            }
            text.push('\n');
        }

        let tmp = self.path.join(format!("{SEQUENCES_FILE}.tmp"));
        tokio::fs::write(&tmp, text.as_bytes()).await?;
        tokio::fs::rename(&tmp, self.sequences_path()).await?;
        Ok(())
    }

    /// Renumber message keys to close gaps (1..N), fixing up all sequences.
    /// Returns the `(old, new)` renames performed.
    pub async fn pack(&self) -> Result<Vec<(u32, u32)>, MailboxError> {
        let mut sequences = self.get_sequences().await?;
        let mut changes = Vec::new();
        let mut next = 0u32;

        for key in self.keys().await? {
            next += 1;
            if key != next {
                let from = self.message_path(key);
                let to = self.message_path(next);
                tokio::fs::rename(&from, &to).await?;
                changes.push((key, next));
            }
        }

        if changes.is_empty() {
            return Ok(changes);
        }

        for keys in sequences.values_mut() {
            for (old, new) in &changes {
                if keys.remove(old) {
                    keys.insert(*new);
                }
            }
        }
        self.set_sequences(&sequences).await?;

        debug!("{}: packed, {} keys renumbered", self.name, changes.len());
        Ok(changes)
    }

    /// The folder's observed mtime: the later of the directory and the
    /// `.mh_sequences` file, in whole seconds since the epoch.
    pub async fn mtime(&self) -> Result<i64, MailboxError> {
        let dir_mtime = mtime_seconds(tokio::fs::metadata(&self.path).await?.modified()?);
        let seq_mtime = match tokio::fs::metadata(self.sequences_path()).await {
            Ok(metadata) => mtime_seconds(metadata.modified()?),
            Err(error) if error.kind() == ErrorKind::NotFound => 0,
            Err(error) => return Err(error.into()),
        };
        Ok(dir_mtime.max(seq_mtime))
    }

    pub async fn message_mtime(&self, key: u32) -> Result<i64, MailboxError> {
        match tokio::fs::metadata(self.message_path(key)).await {
            Ok(metadata) => Ok(mtime_seconds(metadata.modified()?)),
            Err(error) if error.kind() == ErrorKind::NotFound => {
                Err(MailboxError::NoSuchMessage {
                    mailbox: self.name.clone(),
                    key,
                })
            }
            Err(error) => Err(error.into()),
        }
    }
}

/// The MH root: folder-level operations.
#[derive(Debug, Clone)]
pub struct MhStore {
    root: PathBuf,
    lock_timeout: Duration,
}

impl MhStore {
    pub fn new(root: impl Into<PathBuf>, lock_timeout: Duration) -> MhStore {
        MhStore {
            root: root.into(),
            lock_timeout,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn folder(&self, name: &str) -> MhFolder {
        MhFolder::new(name, self.root.join(name), self.lock_timeout)
    }

    pub fn folder_exists(&self, name: &str) -> bool {
        self.root.join(name).is_dir()
    }

    /// All folder names, recursively, `/`-separated, sorted.
    pub async fn list_folders(&self) -> Result<Vec<String>, MailboxError> {
        let mut found = Vec::new();
        let mut pending = vec![String::new()];

        while let Some(prefix) = pending.pop() {
            let dir = if prefix.is_empty() {
                self.root.clone()
            } else {
                self.root.join(&prefix)
            };
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                if !entry.file_type().await?.is_dir() {
                    continue;
                }
                let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                    continue;
                };
                if name.starts_with('.') {
                    continue;
                }
                let full = if prefix.is_empty() {
                    name
                } else {
                    format!("{prefix}/{name}")
                };
                found.push(full.clone());
                pending.push(full);
            }
        }

        found.sort();
        Ok(found)
    }

    pub async fn create_folder(&self, name: &str) -> Result<(), MailboxError> {
        let path = self.root.join(name);
        if path.is_dir() {
            return Err(MailboxError::MailboxExists(name.to_string()));
        }
        tokio::fs::create_dir_all(&path).await?;
        Ok(())
    }

    /// Remove a folder. Refuses anything still holding messages or
    /// sub-folders; an empty (or sequences-only) folder goes away.
    pub async fn remove_folder(&self, name: &str) -> Result<(), MailboxError> {
        let path = self.root.join(name);
        let mut entries = tokio::fs::read_dir(&path).await?;
        let mut sequences_file = None;

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_name() == SEQUENCES_FILE {
                sequences_file = Some(entry.path());
                continue;
            }
            return Err(MailboxError::Inconsistency {
                mailbox: name.to_string(),
                reason: "folder not empty".to_string(),
            });
        }

        if let Some(sequences_file) = sequences_file {
            tokio::fs::remove_file(sequences_file).await?;
        }
        tokio::fs::remove_dir(&path).await?;
        Ok(())
    }

    pub async fn rename_folder(&self, from: &str, to: &str) -> Result<(), MailboxError> {
        let to_path = self.root.join(to);
        if to_path.exists() {
            return Err(MailboxError::MailboxExists(to.to_string()));
        }
        if let Some(parent) = to_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(self.root.join(from), to_path).await?;
        Ok(())
    }
}

fn mtime_seconds(mtime: SystemTime) -> i64 {
    match mtime.duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_secs() as i64,
        Err(_) => 0,
    }
}

/// Collapse a sorted key set into inclusive runs.
fn collapse_runs(keys: &BTreeSet<u32>) -> Vec<(u32, u32)> {
    let mut runs: Vec<(u32, u32)> = Vec::new();
    for &key in keys {
        match runs.last_mut() {
            Some((_, stop)) if *stop + 1 == key => *stop = key,
            _ => runs.push((key, key)),
        }
    }
    runs
}

/// Set a file's mtime, leaving atime alone.
pub(crate) fn set_file_mtime(path: &Path, mtime: SystemTime) -> std::io::Result<()> {
    use std::os::unix::ffi::OsStrExt;

    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|_| std::io::Error::new(ErrorKind::InvalidInput, "path contains NUL"))?;
    let since_epoch = mtime
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO);
    let times = [
        libc::timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_OMIT,
        },
        libc::timespec {
            tv_sec: since_epoch.as_secs() as libc::time_t,
            tv_nsec: since_epoch.subsec_nanos() as _,
        },
    ];

    let rc = unsafe { libc::utimensat(libc::AT_FDCWD, c_path.as_ptr(), times.as_ptr(), 0) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn folder_in(dir: &Path) -> MhFolder {
        MhFolder::new("test", dir, Duration::from_secs(2))
    }

    #[tokio::test]
    async fn keys_are_sorted_numerics() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["3", "1", "10", ".mh_sequences", "notes.txt"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }

        let folder = folder_in(dir.path());
        assert_eq!(folder.keys().await.unwrap(), vec![1, 3, 10]);
    }

    #[tokio::test]
    async fn add_assigns_next_key() {
        let dir = tempfile::tempdir().unwrap();
        let folder = folder_in(dir.path());

        assert_eq!(folder.add(b"From: a\r\n\r\nhi\n", &[]).await.unwrap(), 0);
        assert_eq!(
            folder
                .add(b"From: b\r\n\r\nho\n", &["unseen".to_string()])
                .await
                .unwrap(),
            1
        );

        let sequences = folder.get_sequences().await.unwrap();
        assert_eq!(
            sequences.get("unseen"),
            Some(&BTreeSet::from([1u32]))
        );
    }

    #[tokio::test]
    async fn sequences_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let folder = folder_in(dir.path());
        for key in 1..=6 {
            std::fs::write(dir.path().join(key.to_string()), b"x").unwrap();
        }

        let mut sequences = Sequences::new();
        sequences.insert("unseen".to_string(), BTreeSet::from([1, 2, 3, 5]));
        sequences.insert("replied".to_string(), BTreeSet::from([6]));
        folder.set_sequences(&sequences).await.unwrap();

        let text = std::fs::read_to_string(dir.path().join(SEQUENCES_FILE)).unwrap();
        assert_eq!(text, "replied: 6\nunseen: 1-3 5\n");

        assert_eq!(folder.get_sequences().await.unwrap(), sequences);
    }

    #[tokio::test]
    async fn sequences_drop_missing_keys() {
        let dir = tempfile::tempdir().unwrap();
        let folder = folder_in(dir.path());
        std::fs::write(dir.path().join("2"), b"x").unwrap();
        std::fs::write(
            dir.path().join(SEQUENCES_FILE),
            "unseen: 1-3\nflagged: 9\n",
        )
        .unwrap();

        let sequences = folder.get_sequences().await.unwrap();
        assert_eq!(sequences.get("unseen"), Some(&BTreeSet::from([2u32])));
        assert!(!sequences.contains_key("flagged"));
    }

    #[tokio::test]
    async fn malformed_sequences_are_inconsistent() {
        let dir = tempfile::tempdir().unwrap();
        let folder = folder_in(dir.path());
        std::fs::write(dir.path().join(SEQUENCES_FILE), "no colon here\n").unwrap();

        assert!(matches!(
            folder.get_sequences().await,
            Err(MailboxError::Inconsistency { .. })
        ));
    }

    #[tokio::test]
    async fn pack_renumbers_and_rewrites_sequences() {
        let dir = tempfile::tempdir().unwrap();
        let folder = folder_in(dir.path());
        for key in [2u32, 5, 9] {
            std::fs::write(dir.path().join(key.to_string()), b"x").unwrap();
        }
        std::fs::write(dir.path().join(SEQUENCES_FILE), "unseen: 5 9\n").unwrap();

        let changes = folder.pack().await.unwrap();
        assert_eq!(changes, vec![(2, 1), (5, 2), (9, 3)]);
        assert_eq!(folder.keys().await.unwrap(), vec![1, 2, 3]);

        let sequences = folder.get_sequences().await.unwrap();
        assert_eq!(sequences.get("unseen"), Some(&BTreeSet::from([2u32, 3])));
    }

    #[tokio::test]
    async fn lock_excludes_and_releases() {
        let dir = tempfile::tempdir().unwrap();
        let folder = MhFolder::new("test", dir.path(), Duration::from_millis(200));

        let guard = folder.lock().await.unwrap();
        assert!(matches!(
            folder.lock().await,
            Err(MailboxError::Lock(_))
        ));
        guard.unlock();
        folder.lock().await.unwrap();
    }

    #[tokio::test]
    async fn preserving_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let folder = folder_in(dir.path());
        std::fs::write(dir.path().join("1"), b"before").unwrap();

        let past = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000_000);
        set_file_mtime(&dir.path().join("1"), past).unwrap();
        let before = folder.message_mtime(1).await.unwrap();

        folder
            .set_bytes_preserving_mtime(1, b"after")
            .await
            .unwrap();
        assert_eq!(folder.message_mtime(1).await.unwrap(), before);
        assert_eq!(folder.get_bytes(1).await.unwrap(), b"after");
    }

    #[tokio::test]
    async fn store_folder_operations() {
        let dir = tempfile::tempdir().unwrap();
        let store = MhStore::new(dir.path(), Duration::from_secs(2));

        store.create_folder("inbox").await.unwrap();
        store.create_folder("Archive/2023").await.unwrap();
        assert!(matches!(
            store.create_folder("inbox").await,
            Err(MailboxError::MailboxExists(_))
        ));

        assert_eq!(
            store.list_folders().await.unwrap(),
            vec![
                "Archive".to_string(),
                "Archive/2023".to_string(),
                "inbox".to_string()
            ]
        );

        // A folder holding a message refuses removal.
        std::fs::write(dir.path().join("Archive/2023/1"), b"x").unwrap();
        assert!(store.remove_folder("Archive/2023").await.is_err());
        std::fs::remove_file(dir.path().join("Archive/2023/1")).unwrap();
        store.remove_folder("Archive/2023").await.unwrap();

        store.rename_folder("Archive", "OldMail").await.unwrap();
        assert!(store.folder_exists("OldMail"));
        assert!(!store.folder_exists("Archive"));
    }
}
