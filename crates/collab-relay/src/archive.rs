//! Room bodies on disk.
//!
//! Each closed room is stored as a Loro snapshot in `<dir>/<hex room id>.loro`,
//! so any room name maps to a safe file name.

use collab_core::relay::RoomArchive;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

/// `RoomArchive` backed by a directory.
pub struct FileRoomArchive {
    dir: PathBuf,
}

impl FileRoomArchive {
    /// Use `dir`, creating it if needed.
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, room_id: &str) -> PathBuf {
        let name: String = room_id.bytes().map(|b| format!("{b:02x}")).collect();
        self.dir.join(format!("{name}.loro"))
    }
}

impl RoomArchive for FileRoomArchive {
    fn load(&self, room_id: &str) -> io::Result<Option<Vec<u8>>> {
        match fs::read(self.path(room_id)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn save(&self, room_id: &str, snapshot: &[u8]) -> io::Result<()> {
        // Replace the old snapshot only once the new one is fully written
        let path = self.path(room_id);
        let partial = path.with_extension("loro.partial");
        fs::write(&partial, snapshot)?;
        fs::rename(&partial, &path)?;
        debug!("Archived room {} ({} bytes)", room_id, snapshot.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use collab_core::{
        BlockKind, Hello, Identity, LocalEdit, NoteBody, RelayMessage, ReplicaId, RoomHub,
        SyncMessage,
    };
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    #[test]
    fn test_missing_room_loads_none() {
        let temp = TempDir::new().unwrap();
        let archive = FileRoomArchive::new(temp.path().join("rooms")).unwrap();
        assert!(archive.dir().is_dir());
        assert_eq!(archive.load("n1").unwrap(), None);
    }

    #[test]
    fn test_save_overwrites_and_names_are_safe() {
        let temp = TempDir::new().unwrap();
        let archive = FileRoomArchive::new(temp.path()).unwrap();

        archive.save("../escape/n1", b"first").unwrap();
        archive.save("../escape/n1", b"second").unwrap();
        assert_eq!(archive.load("../escape/n1").unwrap(), Some(b"second".to_vec()));

        let files: Vec<_> = fs::read_dir(temp.path()).unwrap().collect();
        assert_eq!(files.len(), 1);
    }

    fn hello(id: u64) -> Hello {
        Hello {
            replica_id: ReplicaId::from(id),
            identity: Identity::new(format!("user{id}"), format!("user{id}@example.com")),
        }
    }

    #[test]
    fn test_room_survives_relay_restart() {
        let temp = TempDir::new().unwrap();
        let hub = RoomHub::with_archive(Arc::new(FileRoomArchive::new(temp.path()).unwrap()));
        let (tx, _rx) = mpsc::unbounded_channel();
        hub.join("n1", hello(1), tx).unwrap();

        let mut body = NoteBody::new(ReplicaId::from(1)).unwrap();
        let change = body
            .apply_local_edit(&LocalEdit::InsertBlock {
                parent: None,
                index: 0,
                kind: BlockKind::Paragraph,
                text: "on disk".into(),
            })
            .unwrap();
        let frame = RelayMessage::Sync {
            from: ReplicaId::from(1),
            message: SyncMessage::Update {
                data: change.update,
            },
        };
        hub.handle("n1", ReplicaId::from(1), &frame.encode().unwrap())
            .unwrap();
        hub.leave("n1", ReplicaId::from(1));
        assert_eq!(hub.room_count(), 0);
        drop(hub);

        let hub = RoomHub::with_archive(Arc::new(FileRoomArchive::new(temp.path()).unwrap()));
        let (tx, _rx) = mpsc::unbounded_channel();
        hub.join("n1", hello(2), tx).unwrap();
        assert_eq!(hub.room_text("n1").as_deref(), Some("on disk"));
    }

    #[test]
    fn test_unused_room_writes_nothing() {
        let temp = TempDir::new().unwrap();
        let hub = RoomHub::with_archive(Arc::new(FileRoomArchive::new(temp.path()).unwrap()));
        let (tx, _rx) = mpsc::unbounded_channel();
        hub.join("n1", hello(1), tx).unwrap();
        hub.leave("n1", ReplicaId::from(1));

        assert_eq!(hub.room_count(), 0);
        assert_eq!(fs::read_dir(temp.path()).unwrap().count(), 0);
    }
}
