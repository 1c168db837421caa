use crate::error::StoreError;
use crate::persist::{Index, ServerAddress, Term};
use bytes::Bytes;
use std::fmt;
use std::sync::{Arc, Mutex};

#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SnapshotId(u64);

impl SnapshotId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "snapshot-{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotMeta {
    pub id: SnapshotId,
    pub last_included_index: Index,
    pub last_included_term: Term,
    pub servers: Vec<ServerAddress>,
    pub size: u64,
}

/// SnapshotWriter receives a snapshot as contiguous chunks. `commit` makes the
/// snapshot visible in the store; dropping the writer discards it.
pub trait SnapshotWriter: Send {
    /// `offset` must equal the number of bytes written so far.
    fn write_chunk(&mut self, offset: u64, data: &[u8]) -> Result<(), StoreError>;

    fn commit(self: Box<Self>) -> Result<SnapshotMeta, StoreError>;
}

pub trait SnapshotReader: Send {
    fn size(&self) -> u64;

    /// Up to `max_len` bytes starting at `offset`; empty past the end.
    fn read_chunk(&mut self, offset: u64, max_len: u64) -> Result<Bytes, StoreError>;
}

/// SnapshotStore persists snapshots of the host state machine. Triggering
/// snapshot creation is the host's decision; the engine only transfers and
/// recovers from whatever the store holds.
pub trait SnapshotStore: Send + Sync {
    fn create(
        &self,
        last_included_index: Index,
        last_included_term: Term,
        servers: Vec<ServerAddress>,
    ) -> Result<Box<dyn SnapshotWriter>, StoreError>;

    /// Metadata of every stored snapshot, oldest first.
    fn list(&self) -> Result<Vec<SnapshotMeta>, StoreError>;

    fn open(&self, id: &SnapshotId) -> Result<(SnapshotMeta, Box<dyn SnapshotReader>), StoreError>;
}

struct StoredSnapshot {
    meta: SnapshotMeta,
    data: Bytes,
}

struct MemorySnapshotInner {
    snapshots: Vec<StoredSnapshot>,
    next_id: u64,
}

pub struct MemorySnapshotStore {
    inner: Arc<Mutex<MemorySnapshotInner>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        MemorySnapshotStore {
            inner: Arc::new(Mutex::new(MemorySnapshotInner {
                snapshots: Vec::new(),
                next_id: 1,
            })),
        }
    }
}

impl Default for MemorySnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn create(
        &self,
        last_included_index: Index,
        last_included_term: Term,
        servers: Vec<ServerAddress>,
    ) -> Result<Box<dyn SnapshotWriter>, StoreError> {
        let id = {
            let mut inner = self.inner.lock().expect("snapshot store mutex poisoned");
            let id = inner.next_id;
            inner.next_id += 1;
            SnapshotId(id)
        };
        Ok(Box::new(MemorySnapshotWriter {
            store: Arc::clone(&self.inner),
            meta: SnapshotMeta {
                id,
                last_included_index,
                last_included_term,
                servers,
                size: 0,
            },
            buffer: Vec::new(),
        }))
    }

    fn list(&self) -> Result<Vec<SnapshotMeta>, StoreError> {
        let inner = self.inner.lock().expect("snapshot store mutex poisoned");
        Ok(inner.snapshots.iter().map(|s| s.meta.clone()).collect())
    }

    fn open(&self, id: &SnapshotId) -> Result<(SnapshotMeta, Box<dyn SnapshotReader>), StoreError> {
        let inner = self.inner.lock().expect("snapshot store mutex poisoned");
        let stored = inner
            .snapshots
            .iter()
            .find(|s| &s.meta.id == id)
            .ok_or_else(|| StoreError::Corrupted(format!("unknown {:?}", id)))?;
        Ok((
            stored.meta.clone(),
            Box::new(MemorySnapshotReader {
                data: stored.data.clone(),
            }),
        ))
    }
}

struct MemorySnapshotWriter {
    store: Arc<Mutex<MemorySnapshotInner>>,
    meta: SnapshotMeta,
    buffer: Vec<u8>,
}

impl SnapshotWriter for MemorySnapshotWriter {
    fn write_chunk(&mut self, offset: u64, data: &[u8]) -> Result<(), StoreError> {
        if offset != self.buffer.len() as u64 {
            return Err(StoreError::Corrupted(format!(
                "snapshot chunk at offset {} but {} bytes written",
                offset,
                self.buffer.len()
            )));
        }
        self.buffer.extend_from_slice(data);
        Ok(())
    }

    fn commit(self: Box<Self>) -> Result<SnapshotMeta, StoreError> {
        let mut meta = self.meta;
        meta.size = self.buffer.len() as u64;
        let mut inner = self.store.lock().expect("snapshot store mutex poisoned");
        inner.snapshots.push(StoredSnapshot {
            meta: meta.clone(),
            data: Bytes::from(self.buffer),
        });
        Ok(meta)
    }
}

struct MemorySnapshotReader {
    data: Bytes,
}

impl SnapshotReader for MemorySnapshotReader {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_chunk(&mut self, offset: u64, max_len: u64) -> Result<Bytes, StoreError> {
        if offset >= self.data.len() as u64 {
            return Ok(Bytes::new());
        }
        let end = (offset + max_len).min(self.data.len() as u64);
        Ok(self.data.slice(offset as usize..end as usize))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunked_write_then_read() {
        let store = MemorySnapshotStore::new();
        let mut writer = store
            .create(Index::new(5), Term::new(2), vec![ServerAddress::new("a")])
            .unwrap();
        writer.write_chunk(0, b"hello ").unwrap();
        writer.write_chunk(6, b"world").unwrap();
        let meta = writer.commit().unwrap();
        assert_eq!(meta.size, 11);

        let (meta, mut reader) = store.open(&meta.id).unwrap();
        assert_eq!(meta.last_included_index, Index::new(5));
        assert_eq!(reader.read_chunk(0, 6).unwrap(), Bytes::from_static(b"hello "));
        assert_eq!(reader.read_chunk(6, 100).unwrap(), Bytes::from_static(b"world"));
        assert!(reader.read_chunk(11, 100).unwrap().is_empty());
    }

    #[test]
    fn out_of_order_chunk_rejected() {
        let store = MemorySnapshotStore::new();
        let mut writer = store.create(Index::new(1), Term::new(1), Vec::new()).unwrap();
        assert!(writer.write_chunk(4, b"late").is_err());
    }

    #[test]
    fn uncommitted_snapshot_is_invisible() {
        let store = MemorySnapshotStore::new();
        let writer = store.create(Index::new(1), Term::new(1), Vec::new()).unwrap();
        drop(writer);
        assert!(store.list().unwrap().is_empty());
    }
}
