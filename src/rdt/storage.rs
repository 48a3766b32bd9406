// rdt/storage.rs

#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)]
use mockall::automock;
use tokio::sync::RwLock;
use tracing::debug;

use crate::rdt::common::{RoomCode, TransferError};

/// Answers whether a room code is currently open for transfers
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RoomDirectory: Send + Sync + 'static {
    async fn room_exists(&self, room: &RoomCode) -> bool;
}

/// Where uploaded files land and downloads are served from
#[cfg_attr(test, automock)]
#[async_trait]
pub trait FileStore: Send + Sync + 'static {
    async fn read(&self, room: &RoomCode, filename: &str) -> Result<Bytes, TransferError>;
    async fn write(&self, room: &RoomCode, filename: &str, data: &[u8]) -> Result<(), TransferError>;
}

/// Filenames are single path components: no separators, no `..`, not empty.
pub fn validate_filename(filename: &str) -> Result<(), TransferError> {
    let bad = filename.is_empty()
        || filename == "."
        || filename.contains("..")
        || filename.contains(['/', '\\', '\0']);
    if bad {
        return Err(TransferError::InvalidFilename(filename.to_string()));
    }
    Ok(())
}

/// A fixed set of rooms
#[derive(Debug, Default)]
pub struct StaticRooms {
    rooms: HashSet<RoomCode>,
}

impl StaticRooms {
    pub fn new(rooms: impl IntoIterator<Item = RoomCode>) -> Self {
        Self { rooms: rooms.into_iter().collect() }
    }
}

#[async_trait]
impl RoomDirectory for StaticRooms {
    async fn room_exists(&self, room: &RoomCode) -> bool {
        self.rooms.contains(room)
    }
}

/// A room exists iff `root/<room>` is a directory
#[derive(Debug, Clone)]
pub struct DirRooms {
    root: PathBuf,
}

impl DirRooms {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl RoomDirectory for DirRooms {
    async fn room_exists(&self, room: &RoomCode) -> bool {
        match tokio::fs::metadata(self.root.join(room.as_str())).await {
            Ok(meta) => meta.is_dir(),
            Err(_) => false,
        }
    }
}

/// Files stored as `root/<room>/<filename>`
#[derive(Debug, Clone)]
pub struct DirFileStore {
    root: PathBuf,
}

impl DirFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, room: &RoomCode, filename: &str) -> Result<PathBuf, TransferError> {
        validate_filename(filename)?;
        Ok(self.root.join(room.as_str()).join(filename))
    }
}

#[async_trait]
impl FileStore for DirFileStore {
    async fn read(&self, room: &RoomCode, filename: &str) -> Result<Bytes, TransferError> {
        let path = self.path_for(room, filename)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(TransferError::FileNotFound {
                room: room.to_string(),
                filename: filename.to_string(),
            }),
            Err(e) => Err(TransferError::Storage(format!("{}: {e}", path.display()))),
        }
    }

    async fn write(&self, room: &RoomCode, filename: &str, data: &[u8]) -> Result<(), TransferError> {
        let path = self.path_for(room, filename)?;
        let dir = self.root.join(room.as_str());
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| TransferError::Storage(format!("{}: {e}", dir.display())))?;

        // Readers never observe a half-written file. Each write stages under its own name.
        let partial = dir.join(format!(".{filename}.{:016x}.part", rand::random::<u64>()));
        tokio::fs::write(&partial, data)
            .await
            .map_err(|e| TransferError::Storage(format!("{}: {e}", partial.display())))?;
        if let Err(e) = tokio::fs::rename(&partial, &path).await {
            tokio::fs::remove_file(&partial).await.ok();
            return Err(TransferError::Storage(format!("{}: {e}", path.display())));
        }
        debug!(path = %path.display(), bytes = data.len(), "file stored");
        Ok(())
    }
}

/// In-process store, mostly for tests and embedding
#[derive(Debug, Default)]
pub struct MemoryFileStore {
    files: RwLock<HashMap<(RoomCode, String), Bytes>>,
}

impl MemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, room: &RoomCode, filename: &str, data: impl Into<Bytes>) {
        self.files.write().await.insert((room.clone(), filename.to_string()), data.into());
    }

    pub async fn get(&self, room: &RoomCode, filename: &str) -> Option<Bytes> {
        self.files.read().await.get(&(room.clone(), filename.to_string())).cloned()
    }

    pub async fn len(&self) -> usize {
        self.files.read().await.len()
    }
}

#[async_trait]
impl FileStore for MemoryFileStore {
    async fn read(&self, room: &RoomCode, filename: &str) -> Result<Bytes, TransferError> {
        self.get(room, filename).await.ok_or_else(|| TransferError::FileNotFound {
            room: room.to_string(),
            filename: filename.to_string(),
        })
    }

    async fn write(&self, room: &RoomCode, filename: &str, data: &[u8]) -> Result<(), TransferError> {
        validate_filename(filename)?;
        self.insert(room, filename, Bytes::copy_from_slice(data)).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room(code: &str) -> RoomCode {
        code.parse().unwrap()
    }

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("roomdrop-{name}-{}-{}", std::process::id(), rand::random::<u32>()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_validate_filename() {
        assert!(validate_filename("report.pdf").is_ok());
        assert!(validate_filename("a b c.txt").is_ok());
        for bad in ["", ".", "..", "../etc/passwd", "a/b", "a\\b", "x..y", "nul\0"] {
            assert!(matches!(validate_filename(bad), Err(TransferError::InvalidFilename(_))), "{bad:?}");
        }
    }

    #[tokio::test]
    async fn test_static_rooms() {
        let rooms = StaticRooms::new([room("1234"), room("0001")]);
        assert!(rooms.room_exists(&room("1234")).await);
        assert!(!rooms.room_exists(&room("9999")).await);
    }

    #[tokio::test]
    async fn test_dir_rooms() {
        let root = scratch_dir("rooms");
        std::fs::create_dir(root.join("4321")).unwrap();
        std::fs::write(root.join("5555"), b"not a dir").unwrap();

        let rooms = DirRooms::new(&root);
        assert!(rooms.room_exists(&room("4321")).await);
        assert!(!rooms.room_exists(&room("5555")).await);
        assert!(!rooms.room_exists(&room("0000")).await);
        std::fs::remove_dir_all(root).ok();
    }

    #[tokio::test]
    async fn test_dir_file_store() {
        let root = scratch_dir("store");
        let store = DirFileStore::new(&root);
        let code = room("1234");

        assert!(matches!(store.read(&code, "a.txt").await, Err(TransferError::FileNotFound { .. })));
        store.write(&code, "a.txt", b"hello").await.unwrap();
        assert_eq!(std::fs::read(root.join("1234").join("a.txt")).unwrap(), b"hello");
        assert_eq!(store.read(&code, "a.txt").await.unwrap().as_ref(), b"hello");
        let staged = std::fs::read_dir(root.join("1234"))
            .unwrap()
            .filter(|e| e.as_ref().unwrap().file_name().to_string_lossy().ends_with(".part"))
            .count();
        assert_eq!(staged, 0);

        assert!(matches!(
            store.write(&code, "../escape", b"x").await,
            Err(TransferError::InvalidFilename(_))
        ));
        std::fs::remove_dir_all(root).ok();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_dir_file_store_concurrent_same_name() {
        let root = scratch_dir("race");
        let store = std::sync::Arc::new(DirFileStore::new(&root));
        let code = room("1234");

        for round in 0..50 {
            let name = format!("f{round}");
            let writers: Vec<_> = [b'a', b'b']
                .into_iter()
                .map(|fill| {
                    let (store, code, name) = (store.clone(), code.clone(), name.clone());
                    tokio::spawn(async move { store.write(&code, &name, &vec![fill; 8192]).await })
                })
                .collect();
            for writer in writers {
                writer.await.unwrap().unwrap();
            }
            // One writer wins; nothing interleaves
            let stored = store.read(&code, &name).await.unwrap();
            assert_eq!(stored.len(), 8192);
            assert!(stored.iter().all(|&b| b == stored[0]));
        }
        std::fs::remove_dir_all(root).ok();
    }

    #[tokio::test]
    async fn test_memory_file_store() {
        let store = MemoryFileStore::new();
        let code = room("1234");
        assert!(store.read(&code, "f").await.is_err());
        store.write(&code, "f", b"abc").await.unwrap();
        assert_eq!(store.read(&code, "f").await.unwrap().as_ref(), b"abc");
        assert_eq!(store.len().await, 1);
    }
}
