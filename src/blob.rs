use std::fs::{self, File};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, instrument};

use crate::error::{Result, StoreError};
use crate::event::{EventChannel, EventKind, StoreEvent};
use crate::store::StoreId;

/// Default read buffer size.
pub const DEFAULT_CHUNK_SIZE: usize = 255;

/// One file per store under a root directory. Knows nothing about encryption.
pub struct BlobStore {
    root: PathBuf,
    chunk_size: usize,
    events: EventChannel,
}

impl BlobStore {
    pub fn new(root: impl Into<PathBuf>, chunk_size: usize, events: EventChannel) -> Self {
        Self {
            root: root.into(),
            chunk_size: chunk_size.max(1),
            events,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, store: &StoreId) -> PathBuf {
        self.root.join(store.as_str())
    }

    /// Replace the store's content. On error the content is indeterminate.
    #[instrument(level = "debug", skip(self, bytes), fields(len = bytes.len()))]
    pub fn write(&self, store: &StoreId, bytes: &[u8]) -> Result<()> {
        let io = |e| StoreError::io(store.as_str(), e);
        fs::create_dir_all(&self.root).map_err(io)?;

        let mut file = File::create(self.path(store)).map_err(io)?;
        file.write_all(bytes).map_err(io)?;
        file.sync_all().map_err(io)?;
        Ok(())
    }

    /// Full content, or empty if the store was never written.
    #[instrument(level = "debug", skip(self))]
    pub fn read(&self, store: &StoreId) -> Result<Vec<u8>> {
        let io = |e| StoreError::io(store.as_str(), e);
        let mut file = match File::open(self.path(store)) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("store has never been written");
                return Ok(Vec::new());
            }
            Err(e) => return Err(io(e)),
        };

        let mut payload = Vec::new();
        let mut buffer = vec![0u8; self.chunk_size];
        loop {
            match file.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => payload.extend_from_slice(&buffer[..n]),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(io(e)),
            }
        }
        Ok(payload)
    }

    /// Delete the store's file. Emits [`EventKind::StoreCleared`] when a file
    /// was actually removed.
    #[instrument(level = "debug", skip(self))]
    pub fn clear(&self, store: &StoreId) -> Result<bool> {
        match fs::remove_file(self.path(store)) {
            Ok(()) => {
                self.events
                    .emit(StoreEvent::new(EventKind::StoreCleared, store.clone()));
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::io(store.as_str(), e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blobs(dir: &Path, chunk: usize) -> (BlobStore, crate::event::EventReceiver) {
        let events = EventChannel::default();
        let rx = events.subscribe();
        (BlobStore::new(dir.join("blobs"), chunk, events), rx)
    }

    #[test]
    fn test_unwritten_store_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let (blobs, _rx) = blobs(dir.path(), DEFAULT_CHUNK_SIZE);
        assert!(blobs.read(&StoreId::user()).unwrap().is_empty());
    }

    #[test]
    fn test_write_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let (blobs, _rx) = blobs(dir.path(), DEFAULT_CHUNK_SIZE);
        let store = StoreId::mpin();

        blobs.write(&store, b"a much longer first payload").unwrap();
        blobs.write(&store, b"short").unwrap();
        assert_eq!(blobs.read(&store).unwrap(), b"short");
    }

    #[test]
    fn test_chunked_read_reassembles_payload() {
        let dir = tempfile::tempdir().unwrap();
        let (blobs, _rx) = blobs(dir.path(), 7);
        let payload: Vec<u8> = (0..=255u8).cycle().take(1000).collect();

        blobs.write(&StoreId::user(), &payload).unwrap();
        assert_eq!(blobs.read(&StoreId::user()).unwrap(), payload);
    }

    #[test]
    fn test_clear_emits_only_on_deletion() {
        let dir = tempfile::tempdir().unwrap();
        let (blobs, rx) = blobs(dir.path(), DEFAULT_CHUNK_SIZE);
        let store = StoreId::user();

        assert!(!blobs.clear(&store).unwrap());
        assert!(rx.try_recv().is_none());

        blobs.write(&store, b"x").unwrap();
        assert!(blobs.clear(&store).unwrap());
        assert_eq!(
            rx.try_recv(),
            Some(StoreEvent::new(EventKind::StoreCleared, store.clone()))
        );
        assert!(!blobs.path(&store).exists());
    }
}
