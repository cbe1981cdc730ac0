//! Persistent mapping (box, tag) → (file offset, length).
//!
//! In memory this is two levels of hash map; on disk it is the flat,
//! length-prefixed binary layout described by the storage engine's wire
//! format (box-count, then per box an id and its tags, then per tag an id
//! and an (offset, length) pair). The index is always rewritten in full on
//! save — there is no incremental/WAL form, since a truck's index is small
//! relative to its data file and a full rewrite keeps recovery simple.

use std::collections::HashMap;
use std::io;
use std::path::Path;

use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::IndexError;

/// A byte range inside a truck's data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Address {
    pub offset: u32,
    pub length: u32,
}

#[derive(Debug, Default)]
pub struct OffsetIndex {
    boxes: HashMap<String, HashMap<String, Address>>,
}

impl OffsetIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, box_id: &str, tag: &str) -> Option<Address> {
        self.boxes.get(box_id)?.get(tag).copied()
    }

    pub fn insert(&mut self, box_id: &str, tag: &str, address: Address) {
        self.boxes
            .entry(box_id.to_string())
            .or_default()
            .insert(tag.to_string(), address);
    }

    /// Removes a tag from the index. If the box has no remaining tags it
    /// is dropped too, since a box exists only as long as the index
    /// contains at least one tag under it.
    pub fn remove(&mut self, box_id: &str, tag: &str) {
        if let Some(tags) = self.boxes.get_mut(box_id) {
            tags.remove(tag);
            if tags.is_empty() {
                self.boxes.remove(box_id);
            }
        }
    }

    pub fn remove_box(&mut self, box_id: &str) {
        self.boxes.remove(box_id);
    }

    pub fn contains_box(&self, box_id: &str) -> bool {
        self.boxes.contains_key(box_id)
    }

    pub fn tags_in_box(&self, box_id: &str) -> impl Iterator<Item = (&str, Address)> {
        self.boxes
            .get(box_id)
            .into_iter()
            .flat_map(|tags| tags.iter().map(|(tag, addr)| (tag.as_str(), *addr)))
    }

    /// Box ids present in the index, excluding the reserved transaction box.
    pub fn box_ids(&self) -> impl Iterator<Item = &str> {
        self.boxes
            .keys()
            .filter(|id| id.as_str() != crate::record::SYS_BOX)
            .map(String::as_str)
    }

    pub fn all_entries(&self) -> impl Iterator<Item = (&str, &str, Address)> {
        self.boxes.iter().flat_map(|(box_id, tags)| {
            tags.iter()
                .map(move |(tag, addr)| (box_id.as_str(), tag.as_str(), *addr))
        })
    }

    /// The smallest file offset not yet covered by any indexed record,
    /// used by recovery to find the tail to resume scanning from.
    pub fn max_indexed_end(&self) -> u64 {
        self.boxes
            .values()
            .flat_map(|tags| tags.values())
            .map(|addr| u64::from(addr.offset) + u64::from(addr.length))
            .max()
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.boxes.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Loads an index from disk. A missing or empty file yields an empty
    /// index; a parse failure also yields an empty index, with the error
    /// logged by the caller (the storage engine's design treats a corrupt
    /// index as recoverable via the full recovery scan).
    pub async fn load(path: &Path) -> Self {
        match Self::load_inner(path).await {
            Ok(index) => index,
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "failed to load offset index, starting empty");
                Self::new()
            }
        }
    }

    async fn load_inner(path: &Path) -> Result<Self, IndexError> {
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Self::new()),
            Err(err) => return Err(err.into()),
        };
        if bytes.is_empty() {
            return Ok(Self::new());
        }
        Self::parse(&bytes)
    }

    fn parse(bytes: &[u8]) -> Result<Self, IndexError> {
        let mut pos = 0usize;
        let box_count = take_u32(bytes, &mut pos)?;
        let mut index = Self::new();
        for _ in 0..box_count {
            let box_id = take_string(bytes, &mut pos)?;
            let tag_count = take_u32(bytes, &mut pos)?;
            for _ in 0..tag_count {
                let tag = take_string(bytes, &mut pos)?;
                let offset = take_u32(bytes, &mut pos)?;
                let length = take_u32(bytes, &mut pos)?;
                index.insert(&box_id, &tag, Address { offset, length });
            }
        }
        Ok(index)
    }

    /// Rewrites the index file in full and fsyncs it before returning.
    pub async fn save(&self, path: &Path) -> io::Result<()> {
        let bytes = self.serialize();
        let tmp_path = path.with_extension("idx.tmp");
        let mut file = fs::File::create(&tmp_path).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp_path, path).await?;
        Ok(())
    }

    fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(self.boxes.len() as u32).to_le_bytes());
        for (box_id, tags) in &self.boxes {
            put_string(&mut buf, box_id);
            buf.extend_from_slice(&(tags.len() as u32).to_le_bytes());
            for (tag, addr) in tags {
                put_string(&mut buf, tag);
                buf.extend_from_slice(&addr.offset.to_le_bytes());
                buf.extend_from_slice(&addr.length.to_le_bytes());
            }
        }
        buf
    }
}

fn take_u32(data: &[u8], pos: &mut usize) -> Result<u32, IndexError> {
    if *pos + 4 > data.len() {
        return Err(IndexError::Truncated);
    }
    let v = u32::from_le_bytes(data[*pos..*pos + 4].try_into().unwrap());
    *pos += 4;
    Ok(v)
}

fn take_string(data: &[u8], pos: &mut usize) -> Result<String, IndexError> {
    let len = take_u32(data, pos)? as usize;
    if *pos + len > data.len() {
        return Err(IndexError::Truncated);
    }
    let s = String::from_utf8(data[*pos..*pos + len].to_vec())
        .map_err(|_| crate::error::CodecError::InvalidUtf8)?;
    *pos += len;
    Ok(s)
}

fn put_string(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn lookup_and_remove() {
        let mut index = OffsetIndex::new();
        index.insert("users", "u1", Address { offset: 0, length: 10 });
        assert_eq!(
            index.lookup("users", "u1"),
            Some(Address { offset: 0, length: 10 })
        );
        index.remove("users", "u1");
        assert_eq!(index.lookup("users", "u1"), None);
        assert!(!index.contains_box("users"));
    }

    #[test]
    fn max_indexed_end_is_sup_of_ranges() {
        let mut index = OffsetIndex::new();
        index.insert("b", "t1", Address { offset: 0, length: 10 });
        index.insert("b", "t2", Address { offset: 10, length: 20 });
        assert_eq!(index.max_indexed_end(), 30);
    }

    #[test]
    fn box_ids_exclude_sys_box() {
        let mut index = OffsetIndex::new();
        index.insert("users", "u1", Address { offset: 0, length: 1 });
        index.insert(crate::record::SYS_BOX, "TX_START_1", Address { offset: 1, length: 1 });
        let ids: Vec<_> = index.box_ids().collect();
        assert_eq!(ids, vec!["users"]);
    }

    #[tokio::test]
    async fn save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.idx");
        let mut index = OffsetIndex::new();
        index.insert("users", "u1", Address { offset: 0, length: 10 });
        index.insert("users", "u2", Address { offset: 10, length: 20 });
        index.insert("orders", "o1", Address { offset: 30, length: 5 });
        index.save(&path).await.unwrap();

        let loaded = OffsetIndex::load(&path).await;
        assert_eq!(loaded.lookup("users", "u1"), Some(Address { offset: 0, length: 10 }));
        assert_eq!(loaded.lookup("users", "u2"), Some(Address { offset: 10, length: 20 }));
        assert_eq!(loaded.lookup("orders", "o1"), Some(Address { offset: 30, length: 5 }));
        assert_eq!(loaded.len(), 3);
    }

    #[tokio::test]
    async fn missing_file_loads_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing.idx");
        let loaded = OffsetIndex::load(&path).await;
        assert!(loaded.is_empty());
    }

    #[tokio::test]
    async fn corrupt_file_loads_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.idx");
        fs::write(&path, b"\xFF\xFF\xFF\xFF").await.unwrap();
        let loaded = OffsetIndex::load(&path).await;
        assert!(loaded.is_empty());
    }
}
