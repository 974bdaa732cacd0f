//! Server directory: the flat shared folder behind `/store`, `/get` and `/dir`.
//!
//! Uploads are streamed into a part file under `<root>/.incoming/` and only
//! renamed onto their final name once every declared byte has arrived, so a
//! reader never observes a half-written file. Each upload gets its own part
//! file; concurrent uploads of the same name end with the last rename.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::fs::{self, File};
use tokio::io::AsyncRead;
use tracing::{debug, warn};

use relay_core::{FileName, TransferDescriptor};
use relay_protocol::{ChannelError, Delivery, FrameReader};

/// Staging directory for in-flight uploads, relative to the root.
pub const INCOMING_DIR: &str = ".incoming";

/// Errors raised by the server directory.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The root is missing or not a directory.
    #[error("Storage root {path} is unusable: {error}")]
    Root { path: PathBuf, error: io::Error },

    /// A local filesystem operation failed for one file.
    ///
    /// During a store, the channel has already been drained when this is
    /// returned, so the session can carry on.
    #[error("I/O error on {name}: {error}")]
    Io { name: String, error: io::Error },

    /// The channel failed mid-payload; the session cannot continue.
    #[error(transparent)]
    Transfer(#[from] ChannelError),
}

impl StorageError {
    fn io(name: &FileName, error: io::Error) -> Self {
        Self::Io {
            name: name.to_string(),
            error,
        }
    }

    /// Whether the session's channel is still usable after this error.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Transfer(_))
    }
}

/// Handle to the server directory. Cheap to clone.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
    incoming: PathBuf,
    next_part: Arc<AtomicU64>,
}

impl FileStore {
    /// Opens `root`, creating the staging directory if needed.
    ///
    /// # Errors
    ///
    /// `StorageError::Root` if `root` is not an existing directory or the
    /// staging directory cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        let root_error = |error| StorageError::Root {
            path: root.clone(),
            error,
        };

        let meta = std::fs::metadata(&root).map_err(root_error)?;
        if !meta.is_dir() {
            return Err(root_error(io::Error::new(
                io::ErrorKind::InvalidInput,
                "not a directory",
            )));
        }

        let incoming = root.join(INCOMING_DIR);
        std::fs::create_dir_all(&incoming).map_err(root_error)?;
        sweep_part_files(&incoming);

        Ok(Self {
            root,
            incoming,
            next_part: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Names of the regular files in the root, sorted.
    pub async fn list(&self) -> io::Result<Vec<String>> {
        let mut entries = fs::read_dir(&self.root).await?;
        let mut names = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let Ok(meta) = fs::metadata(entry.path()).await else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            // Names that could never be requested back are not listed
            if let Some(name) = entry.file_name().to_str() {
                if FileName::new(name).is_ok() {
                    names.push(name.to_string());
                }
            }
        }

        names.sort();
        Ok(names)
    }

    /// Opens a stored file for sending.
    ///
    /// Returns `Ok(None)` if no regular file by that name exists.
    ///
    /// The size comes from the opened handle, so it always matches the
    /// bytes that handle yields even if a store renames a new version
    /// over the name afterwards.
    pub async fn open_file(&self, name: &FileName) -> Result<Option<(File, u64)>, StorageError> {
        let file = match File::open(self.path_of(name)).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StorageError::io(name, e)),
        };

        let meta = file
            .metadata()
            .await
            .map_err(|e| StorageError::io(name, e))?;
        if !meta.is_file() {
            return Ok(None);
        }

        Ok(Some((file, meta.len())))
    }

    /// Streams exactly `descriptor.size` bytes from `reader` into the file.
    ///
    /// The declared bytes are always consumed from the channel, even when
    /// the local write fails, so the next control frame lines up.
    ///
    /// # Errors
    ///
    /// - `StorageError::Transfer` if the channel ended early; nothing is stored
    /// - `StorageError::Io` if the file could not be written or renamed
    pub async fn store<R>(
        &self,
        descriptor: &TransferDescriptor,
        reader: &mut FrameReader<R>,
    ) -> Result<u64, StorageError>
    where
        R: AsyncRead + Unpin,
    {
        let name = &descriptor.name;
        let part = self.part_path(name);

        let mut file = match File::create(&part).await {
            Ok(file) => file,
            Err(e) => {
                warn!(name = %name, error = %e, "Cannot create part file, discarding upload");
                reader
                    .receive_into(descriptor.size, &mut tokio::io::sink())
                    .await?;
                return Err(StorageError::io(name, e));
            }
        };

        let delivery = match reader.receive_into(descriptor.size, &mut file).await {
            Ok(delivery) => delivery,
            Err(e) => {
                drop(file);
                discard(&part).await;
                return Err(e.into());
            }
        };

        if let Delivery::SinkFailed(e) = delivery {
            drop(file);
            discard(&part).await;
            return Err(StorageError::io(name, e));
        }

        if let Err(e) = file.sync_all().await {
            drop(file);
            discard(&part).await;
            return Err(StorageError::io(name, e));
        }
        drop(file);

        if let Err(e) = fs::rename(&part, self.path_of(name)).await {
            discard(&part).await;
            return Err(StorageError::io(name, e));
        }

        debug!(name = %name, size = descriptor.size, "Stored file");
        Ok(descriptor.size)
    }

    fn path_of(&self, name: &FileName) -> PathBuf {
        self.root.join(name.as_str())
    }

    fn part_path(&self, name: &FileName) -> PathBuf {
        let seq = self.next_part.fetch_add(1, Ordering::Relaxed);
        self.incoming
            .join(format!("{}.{}.{}.part", name, std::process::id(), seq))
    }
}

/// Removes part files left behind by uploads that never finished.
fn sweep_part_files(incoming: &Path) {
    let entries = match std::fs::read_dir(incoming) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(path = %incoming.display(), error = %e, "Cannot scan staging directory");
            return;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("part") {
            continue;
        }
        match std::fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "Removed stale part file"),
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove stale part file"),
        }
    }
}

async fn discard(part: &Path) {
    if let Err(e) = fs::remove_file(part).await {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %part.display(), error = %e, "Failed to remove part file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_protocol::FrameWriter;
    use tokio::io::{duplex, AsyncReadExt};

    fn descriptor(name: &str, size: u64) -> TransferDescriptor {
        TransferDescriptor::new(FileName::new(name).unwrap(), size)
    }

    fn part_files(store: &FileStore) -> usize {
        std::fs::read_dir(&store.incoming).unwrap().count()
    }

    #[test]
    fn test_open_rejects_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        let err = FileStore::open(dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, StorageError::Root { .. }));
    }

    #[test]
    fn test_open_rejects_file_root() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain");
        std::fs::write(&path, b"x").unwrap();
        assert!(matches!(
            FileStore::open(&path),
            Err(StorageError::Root { .. })
        ));
    }

    #[tokio::test]
    async fn test_list_files_only_sorted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.txt"), b"b").unwrap();
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();
        std::fs::create_dir(dir.path().join("subdir")).unwrap();

        let store = FileStore::open(dir.path()).unwrap();
        assert_eq!(store.list().await.unwrap(), vec!["a.txt", "b.txt"]);
    }

    #[tokio::test]
    async fn test_list_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_open_file_missing_or_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("folder")).unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        let missing = FileName::new("missing.txt").unwrap();
        assert!(store.open_file(&missing).await.unwrap().is_none());

        let folder = FileName::new("folder").unwrap();
        assert!(store.open_file(&folder).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_store_then_open() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        let (client, server) = duplex(1024);
        let mut writer = FrameWriter::new(client);
        writer.send_bytes(b"hello world").await.unwrap();

        let mut reader = FrameReader::new(server);
        let stored = store
            .store(&descriptor("report.txt", 11), &mut reader)
            .await
            .unwrap();
        assert_eq!(stored, 11);
        assert_eq!(part_files(&store), 0);

        let (mut file, size) = store
            .open_file(&FileName::new("report.txt").unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(size, 11);
        let mut contents = String::new();
        file.read_to_string(&mut contents).await.unwrap();
        assert_eq!(contents, "hello world");
    }

    #[tokio::test]
    async fn test_open_file_size_matches_handle_after_replace() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f.bin"), vec![1u8; 4096]).unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        let (mut file, size) = store
            .open_file(&FileName::new("f.bin").unwrap())
            .await
            .unwrap()
            .unwrap();

        // A store publishes a shorter version while the fetch is pending
        let replacement = dir.path().join("replacement");
        std::fs::write(&replacement, b"short").unwrap();
        std::fs::rename(&replacement, dir.path().join("f.bin")).unwrap();

        let mut contents = Vec::new();
        file.read_to_end(&mut contents).await.unwrap();
        assert_eq!(size, 4096);
        assert_eq!(contents.len() as u64, size);
    }

    #[test]
    fn test_open_sweeps_stale_part_files() {
        let dir = tempfile::tempdir().unwrap();
        let incoming = dir.path().join(INCOMING_DIR);
        std::fs::create_dir(&incoming).unwrap();
        std::fs::write(incoming.join("big.bin.4242.0.part"), b"half").unwrap();
        std::fs::write(incoming.join("notes.txt"), b"kept").unwrap();

        let store = FileStore::open(dir.path()).unwrap();
        assert!(!incoming.join("big.bin.4242.0.part").exists());
        assert!(incoming.join("notes.txt").exists());
        assert_eq!(part_files(&store), 1);
    }

    #[tokio::test]
    async fn test_store_overwrites_existing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"old contents here").unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        let (client, server) = duplex(1024);
        let mut writer = FrameWriter::new(client);
        writer.send_bytes(b"new").await.unwrap();

        let mut reader = FrameReader::new(server);
        store
            .store(&descriptor("notes.txt", 3), &mut reader)
            .await
            .unwrap();
        assert_eq!(std::fs::read(dir.path().join("notes.txt")).unwrap(), b"new");
    }

    #[tokio::test]
    async fn test_store_zero_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        let (_client, server) = duplex(64);
        let mut reader = FrameReader::new(server);
        store
            .store(&descriptor("empty.bin", 0), &mut reader)
            .await
            .unwrap();
        assert_eq!(std::fs::read(dir.path().join("empty.bin")).unwrap(), b"");
    }

    #[tokio::test]
    async fn test_truncated_store_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        let (client, server) = duplex(1024);
        let mut writer = FrameWriter::new(client);
        writer.send_bytes(b"only part").await.unwrap();
        drop(writer);

        let mut reader = FrameReader::new(server);
        let err = store
            .store(&descriptor("big.bin", 100), &mut reader)
            .await
            .unwrap_err();
        assert!(!err.is_recoverable());
        assert!(matches!(
            err,
            StorageError::Transfer(ChannelError::TruncatedTransfer {
                expected: 100,
                received: 9
            })
        ));
        assert!(!dir.path().join("big.bin").exists());
        assert_eq!(part_files(&store), 0);
    }

    #[tokio::test]
    async fn test_failed_store_still_drains_channel() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        // Make the staging directory unusable
        std::fs::remove_dir(&store.incoming).unwrap();
        std::fs::write(&store.incoming, b"in the way").unwrap();

        let (client, server) = duplex(1024);
        let mut writer = FrameWriter::new(client);
        writer.send_bytes(b"payload").await.unwrap();
        writer.send_line("/dir").await.unwrap();

        let mut reader = FrameReader::new(server);
        let err = store
            .store(&descriptor("lost.txt", 7), &mut reader)
            .await
            .unwrap_err();
        assert!(err.is_recoverable());
        assert_eq!(reader.receive_line().await.unwrap(), "/dir");
        assert!(!dir.path().join("lost.txt").exists());
    }
}
