//! src/services/storage_service.rs
//!
//! ImageStorage: the filesystem half of the gallery. Image payloads live
//! flat beneath `base_path/{filename}`; the directory is shared by every
//! worker process, so all writes go through a temp file and are published
//! with a no-clobber link. A reader never observes a partially written file
//! and two workers racing on one name can never overwrite each other.

use bytes::Bytes;
use std::{
    collections::BTreeSet,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid filename `{name}`: {reason}")]
    InvalidFilename { name: String, reason: &'static str },
    #[error("file `{0}` not found")]
    NotFound(String),
    #[error("file `{0}` already exists")]
    AlreadyExists(String),
    #[error("storage is full")]
    StorageFull,
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

const MAX_FILENAME_LEN: usize = 255;
const RESERVED_CHARS: [char; 10] = ['/', '\\', '<', '>', ':', '"', '|', '?', '*', '%'];
const TEMP_PREFIX: &str = ".tmp-";

/// Check that `name` can be used verbatim as a file name inside the storage
/// root.
///
/// The name must already be percent-decoded. `%` itself is rejected, so a
/// value that was encoded twice (`%252e%252e`) fails here instead of being
/// decoded again further down.
pub fn sanitize_filename(name: &str) -> StorageResult<&str> {
    let invalid = |reason| {
        Err(StorageError::InvalidFilename {
            name: name.to_string(),
            reason,
        })
    };

    if name.is_empty() {
        return invalid("must not be empty");
    }
    if name.len() > MAX_FILENAME_LEN {
        return invalid("must be at most 255 bytes");
    }
    if name.contains("..") {
        return invalid("must not contain `..`");
    }
    if name.starts_with('.') {
        return invalid("must not start with `.`");
    }
    if name.chars().any(|c| c.is_control()) {
        return invalid("must not contain control characters");
    }
    if name.chars().any(|c| RESERVED_CHARS.contains(&c)) {
        return invalid("must not contain path separators or reserved characters");
    }
    if name.trim() != name {
        return invalid("must not begin or end with whitespace");
    }
    Ok(name)
}

/// Filesystem-backed image storage.
///
/// Cheap to clone; holds only the root path. The root is created on the
/// first write if it does not exist yet.
#[derive(Clone, Debug)]
pub struct ImageStorage {
    base_path: PathBuf,
}

impl ImageStorage {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Resolve a sanitized filename to its path. Does not check existence.
    fn file_path(&self, filename: &str) -> StorageResult<PathBuf> {
        let name = sanitize_filename(filename)?;
        Ok(self.base_path.join(name))
    }

    /// Write `bytes` under `filename`.
    ///
    /// - Writes and fsyncs a hidden temp file in the storage root.
    /// - Publishes it with a hard link, which fails if the name is taken.
    /// - Removes the temp file whatever the outcome.
    ///
    /// Returns `AlreadyExists` when another upload already owns the name.
    pub async fn write(&self, filename: &str, bytes: &[u8]) -> StorageResult<PathBuf> {
        let final_path = self.file_path(filename)?;
        fs::create_dir_all(&self.base_path)
            .await
            .map_err(classify_io)?;

        let tmp_path = self
            .base_path
            .join(format!("{}{}", TEMP_PREFIX, Uuid::new_v4()));
        if let Err(err) = write_synced(&tmp_path, bytes).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(classify_io(err));
        }

        let published = fs::hard_link(&tmp_path, &final_path).await;
        if let Err(err) = fs::remove_file(&tmp_path).await {
            debug!("failed to remove temp file {}: {}", tmp_path.display(), err);
        }

        match published {
            Ok(()) => {
                debug!("stored {} ({} bytes)", final_path.display(), bytes.len());
                Ok(final_path)
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                Err(StorageError::AlreadyExists(filename.to_string()))
            }
            Err(err) => Err(classify_io(err)),
        }
    }

    /// Read the whole file into memory.
    pub async fn read(&self, filename: &str) -> StorageResult<Bytes> {
        let path = self.file_path(filename)?;
        fs::read(&path)
            .await
            .map(Bytes::from)
            .map_err(|err| not_found_or_io(err, filename))
    }

    /// Open the file for streaming. Returns the handle and its length.
    pub async fn open(&self, filename: &str) -> StorageResult<(File, u64)> {
        let path = self.file_path(filename)?;
        let file = File::open(&path)
            .await
            .map_err(|err| not_found_or_io(err, filename))?;
        let metadata = file.metadata().await?;
        if !metadata.is_file() {
            return Err(StorageError::NotFound(filename.to_string()));
        }
        Ok((file, metadata.len()))
    }

    /// Remove `filename` if it was last written at least `older_than` ago.
    ///
    /// A recent file is left untouched. A stale one is first moved to a
    /// private temp name and its age checked again there, so a file another
    /// writer published in the meantime is linked back instead of deleted.
    /// Returns `true` when the name is free afterwards and `false` when a
    /// recent file was kept.
    pub async fn remove_if_stale(&self, filename: &str, older_than: Duration) -> StorageResult<bool> {
        let path = self.file_path(filename)?;
        let metadata = match fs::symlink_metadata(&path).await {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(true),
            Err(err) => return Err(classify_io(err)),
        };
        if !metadata.is_file() {
            return Err(StorageError::Io(io::Error::other(format!(
                "{} is not a regular file",
                path.display()
            ))));
        }
        if age_of(&metadata)? < older_than {
            return Ok(false);
        }

        let claimed = self
            .base_path
            .join(format!("{}{}", TEMP_PREFIX, Uuid::new_v4()));
        match fs::rename(&path, &claimed).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(true),
            Err(err) => return Err(classify_io(err)),
        }

        let age = age_of(&fs::metadata(&claimed).await?)?;
        if age < older_than {
            let restored = fs::hard_link(&claimed, &path).await;
            if let Err(err) = fs::remove_file(&claimed).await {
                debug!("failed to remove temp file {}: {}", claimed.display(), err);
            }
            return match restored {
                Ok(()) => Ok(false),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(false),
                Err(err) => Err(classify_io(err)),
            };
        }

        fs::remove_file(&claimed).await.map_err(classify_io)?;
        debug!("removed stale {} (age {:?})", path.display(), age);
        Ok(true)
    }

    pub async fn delete(&self, filename: &str) -> StorageResult<()> {
        let path = self.file_path(filename)?;
        fs::remove_file(&path)
            .await
            .map_err(|err| not_found_or_io(err, filename))?;
        debug!("removed {}", path.display());
        Ok(())
    }

    /// Names of all regular files currently in the storage root.
    ///
    /// Hidden entries (including in-flight temp files) are skipped. A missing
    /// root is an empty listing.
    pub async fn list(&self) -> StorageResult<BTreeSet<String>> {
        let mut names = BTreeSet::new();
        let mut entries = match fs::read_dir(&self.base_path).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(names),
            Err(err) => return Err(StorageError::Io(err)),
        };

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            match entry.file_name().into_string() {
                Ok(name) if name.starts_with('.') => {}
                Ok(name) => {
                    names.insert(name);
                }
                Err(raw) => debug!("skipping non UTF-8 file name {:?}", raw),
            }
        }
        Ok(names)
    }

    /// Remove temp files left behind by writers that died mid-upload.
    ///
    /// Only safe while no worker is writing, i.e. before workers start.
    pub async fn purge_temp_files(&self) -> StorageResult<usize> {
        let mut removed = 0;
        let mut entries = match fs::read_dir(&self.base_path).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(StorageError::Io(err)),
        };

        while let Some(entry) = entries.next_entry().await? {
            let is_temp = entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(TEMP_PREFIX));
            if is_temp {
                fs::remove_file(entry.path()).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

async fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = File::create(path).await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_all().await
}

fn classify_io(err: io::Error) -> StorageError {
    if err.kind() == ErrorKind::StorageFull {
        StorageError::StorageFull
    } else {
        StorageError::Io(err)
    }
}

/// Time since last modification; a clock that runs backwards reads as zero.
fn age_of(metadata: &std::fs::Metadata) -> io::Result<Duration> {
    Ok(SystemTime::now()
        .duration_since(metadata.modified()?)
        .unwrap_or_default())
}

fn not_found_or_io(err: io::Error, filename: &str) -> StorageError {
    if err.kind() == ErrorKind::NotFound {
        StorageError::NotFound(filename.to_string())
    } else {
        classify_io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn storage() -> (TempDir, ImageStorage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = ImageStorage::new(dir.path().join("images"));
        (dir, storage)
    }

    #[test]
    fn sanitize_rejects_traversal_and_reserved_characters() {
        for bad in [
            "",
            "..",
            "../etc/passwd",
            "a/../b.png",
            "dir/file.png",
            "dir\\file.png",
            ".hidden.png",
            "%2e%2e%2fsecret.png",
            "%252e%252e",
            "what?.png",
            "star*.png",
            "nul\0.png",
            "tab\t.png",
            " padded.png",
        ] {
            assert!(
                matches!(sanitize_filename(bad), Err(StorageError::InvalidFilename { .. })),
                "{bad:?} should be rejected"
            );
        }
        assert!(sanitize_filename(&"a".repeat(256)).is_err());
    }

    #[test]
    fn sanitize_accepts_ordinary_names() {
        for good in ["cat.png", "my photo (1).jpg", "IMG_0001.JPEG", "über.gif"] {
            assert_eq!(sanitize_filename(good).unwrap(), good);
        }
    }

    #[tokio::test]
    async fn write_read_delete_round_trip() {
        let (_dir, storage) = storage();
        let path = storage.write("cat.png", b"meow").await.unwrap();
        assert_eq!(path, storage.base_path().join("cat.png"));

        assert_eq!(storage.read("cat.png").await.unwrap(), Bytes::from_static(b"meow"));
        let (_file, len) = storage.open("cat.png").await.unwrap();
        assert_eq!(len, 4);

        storage.delete("cat.png").await.unwrap();
        assert!(matches!(
            storage.read("cat.png").await,
            Err(StorageError::NotFound(_))
        ));
        assert!(matches!(
            storage.delete("cat.png").await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn write_never_replaces_an_existing_file() {
        let (_dir, storage) = storage();
        storage.write("dup.png", b"first").await.unwrap();

        let second = storage.write("dup.png", b"second").await;
        assert!(matches!(second, Err(StorageError::AlreadyExists(name)) if name == "dup.png"));
        assert_eq!(storage.read("dup.png").await.unwrap(), Bytes::from_static(b"first"));

        let leftovers = std::fs::read_dir(storage.base_path()).unwrap().count();
        assert_eq!(leftovers, 1, "temp file must not survive a failed publish");
    }

    #[tokio::test]
    async fn invalid_names_never_touch_the_filesystem() {
        let (dir, storage) = storage();
        let err = storage.write("../escape.png", b"x").await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidFilename { .. }));
        assert!(!dir.path().join("escape.png").exists());
        assert!(!storage.base_path().exists());
    }

    #[tokio::test]
    async fn list_skips_hidden_entries_and_directories() {
        let (_dir, storage) = storage();
        assert!(storage.list().await.unwrap().is_empty());

        storage.write("b.png", b"b").await.unwrap();
        storage.write("a.gif", b"a").await.unwrap();
        std::fs::write(storage.base_path().join(".tmp-stale"), b"junk").unwrap();
        std::fs::create_dir(storage.base_path().join("subdir")).unwrap();

        let names: Vec<_> = storage.list().await.unwrap().into_iter().collect();
        assert_eq!(names, ["a.gif", "b.png"]);
    }

    #[tokio::test]
    async fn open_refuses_directories_under_an_image_name() {
        let (_dir, storage) = storage();
        std::fs::create_dir_all(storage.base_path().join("folder.png")).unwrap();
        assert!(matches!(
            storage.open("folder.png").await,
            Err(StorageError::NotFound(name)) if name == "folder.png"
        ));
    }

    fn backdate(path: &Path, by: Duration) {
        std::fs::File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(SystemTime::now() - by)
            .unwrap();
    }

    #[tokio::test]
    async fn remove_if_stale_keeps_recent_files() {
        let (_dir, storage) = storage();
        storage.write("fresh.png", b"f").await.unwrap();

        let freed = storage
            .remove_if_stale("fresh.png", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(!freed);
        assert_eq!(storage.read("fresh.png").await.unwrap(), Bytes::from_static(b"f"));
        // Only the image itself: the claimed temp copy is gone again.
        assert_eq!(std::fs::read_dir(storage.base_path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn remove_if_stale_frees_old_names() {
        let (_dir, storage) = storage();
        storage.write("old.png", b"o").await.unwrap();
        backdate(&storage.base_path().join("old.png"), Duration::from_secs(3600));

        let freed = storage
            .remove_if_stale("old.png", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(freed);
        assert_eq!(std::fs::read_dir(storage.base_path()).unwrap().count(), 0);

        // A missing file leaves the name free as well.
        assert!(storage
            .remove_if_stale("old.png", Duration::from_secs(60))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn remove_if_stale_refuses_directories() {
        let (_dir, storage) = storage();
        std::fs::create_dir_all(storage.base_path().join("folder.png")).unwrap();
        assert!(matches!(
            storage.remove_if_stale("folder.png", Duration::ZERO).await,
            Err(StorageError::Io(_))
        ));
        assert!(storage.base_path().join("folder.png").is_dir());
    }

    #[tokio::test]
    async fn purge_removes_only_temp_files() {
        let (_dir, storage) = storage();
        storage.write("keep.png", b"k").await.unwrap();
        std::fs::write(storage.base_path().join(".tmp-one"), b"1").unwrap();
        std::fs::write(storage.base_path().join(".tmp-two"), b"2").unwrap();

        assert_eq!(storage.purge_temp_files().await.unwrap(), 2);
        assert_eq!(storage.purge_temp_files().await.unwrap(), 0);
        assert!(storage.base_path().join("keep.png").exists());
    }
}
