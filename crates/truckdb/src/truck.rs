//! The core engine: owns one data file and one index file, and
//! orchestrates the write buffer, flush pipeline, transaction framing,
//! compare-and-swap, compaction, and crash recovery.
//!
//! A `Truck` is not `Sync` across concurrent callers by itself — it relies
//! on its host (`TruckWorker`) to serialize access; every method here takes
//! `&mut self` and there is exactly one mutable borrow in flight at a time
//! by construction.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use bytes::{Bytes, BytesMut};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::time::Instant;

use crate::config::TruckConfig;
use crate::error::{Result, TruckDbError};
use crate::field_index::FieldIndex;
use crate::index::{Address, OffsetIndex};
use crate::lru::Lru;
use crate::record::{self, Record};
use crate::value::Value;

type BufferKey = (String, String);

pub struct Truck {
    id: String,
    data_path: PathBuf,
    index_path: PathBuf,
    writer: Option<fs::File>,
    reader: Option<fs::File>,
    writer_offset: u64,
    index: OffsetIndex,
    tag_lru: Lru<BufferKey, Value>,
    field_index: FieldIndex,
    /// Keyed by (box, tag); `None` is the tombstone sentinel.
    write_buffer: HashMap<BufferKey, Option<Value>>,
    flush_deadline: Option<Instant>,
    ops_since_compact: u64,
    next_tx_id: u64,
    config: TruckConfig,
}

impl Truck {
    /// Opens (creating if needed) the truck `id` under `root`: loads the
    /// index, runs crash recovery if the data file outgrew it, rebuilds the
    /// field index, and opens the writer in append mode.
    pub async fn open(root: &Path, id: &str, config: TruckConfig) -> Result<Self> {
        fs::create_dir_all(root).await?;
        probe_write_permission(root).await?;

        let data_path = root.join(format!("{id}.dat"));
        let index_path = root.join(format!("{id}.idx"));
        let index = OffsetIndex::load(&index_path).await;

        let mut truck = Self {
            id: id.to_string(),
            data_path,
            index_path,
            writer: None,
            reader: None,
            writer_offset: 0,
            index,
            tag_lru: Lru::new(config.tag_lru_capacity),
            field_index: FieldIndex::new(),
            write_buffer: HashMap::new(),
            flush_deadline: None,
            ops_since_compact: 0,
            next_tx_id: 0,
            config,
        };

        truck.recover_if_needed().await?;
        truck.reopen_handles().await?;
        truck.rebuild_field_index().await?;
        Ok(truck)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn key(box_id: &str, tag: &str) -> BufferKey {
        (box_id.to_string(), tag.to_string())
    }

    async fn reopen_handles(&mut self) -> Result<()> {
        let writer = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.data_path)
            .await?;
        let reader = fs::OpenOptions::new().read(true).open(&self.data_path).await?;
        self.writer_offset = fs::metadata(&self.data_path).await?.len();
        self.writer = Some(writer);
        self.reader = Some(reader);
        Ok(())
    }

    async fn rebuild_field_index(&mut self) -> Result<()> {
        let tags: Vec<BufferKey> = self
            .index
            .all_entries()
            .map(|(b, t, _)| (b.to_string(), t.to_string()))
            .collect();
        for (box_id, tag) in tags {
            if let Some(value) = self.read_internal(&box_id, &tag).await? {
                self.field_index.index_value(&box_id, &tag, &value);
            }
        }
        Ok(())
    }

    /// Time at which a scheduled (non-synchronous) flush becomes due, if
    /// one is pending. The owning worker awaits this to fire the timer.
    pub fn flush_deadline(&self) -> Option<Instant> {
        self.flush_deadline
    }

    // ---- recovery -----------------------------------------------------

    async fn recover_if_needed(&mut self) -> Result<()> {
        let data = match fs::read(&self.data_path).await {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        let start = self.index.max_indexed_end() as usize;
        if start >= data.len() {
            return Ok(());
        }

        tracing::info!(truck_id = %self.id, start, len = data.len(), "running crash recovery scan");

        struct TxState {
            id: String,
            pending: Vec<(String, String, Address, bool)>,
        }

        let mut pos = start;
        let mut tx_state: Option<TxState> = None;
        let mut skipped = 0usize;

        while pos < data.len() {
            match try_parse_record_at(&data, pos, self.config.max_id_len) {
                None => {
                    pos += 1;
                    skipped += 1;
                    continue;
                }
                Some((record, len)) => {
                    let addr = Address {
                        offset: pos as u32,
                        length: len as u32,
                    };
                    if let Some(tx_id) = record::is_tx_start(&record.box_id, &record.tag) {
                        tx_state = Some(TxState {
                            id: tx_id.to_string(),
                            pending: Vec::new(),
                        });
                    } else if let Some(tx_id) = record::is_tx_commit(&record.box_id, &record.tag) {
                        if let Some(state) = tx_state.take() {
                            if state.id == tx_id {
                                for (box_id, tag, addr, is_tombstone) in state.pending {
                                    if is_tombstone {
                                        self.index.remove(&box_id, &tag);
                                    } else {
                                        self.index.insert(&box_id, &tag, addr);
                                    }
                                }
                            } else {
                                tracing::warn!(
                                    truck_id = %self.id,
                                    expected = %state.id,
                                    found = %tx_id,
                                    "discarding transaction with mismatched commit id"
                                );
                            }
                        }
                    } else if let Some(state) = tx_state.as_mut() {
                        state
                            .pending
                            .push((record.box_id.clone(), record.tag.clone(), addr, record.is_tombstone()));
                    } else if record.is_tombstone() {
                        self.index.remove(&record.box_id, &record.tag);
                    } else {
                        self.index.insert(&record.box_id, &record.tag, addr);
                    }
                    pos += len;
                }
            }
        }

        if tx_state.is_some() {
            tracing::warn!(truck_id = %self.id, "discarding incomplete trailing transaction");
        }
        if skipped > 0 {
            tracing::warn!(truck_id = %self.id, skipped, "recovery skipped unreadable bytes");
        }

        self.index.save(&self.index_path).await?;
        Ok(())
    }

    // ---- read path ------------------------------------------------------

    async fn read_block(&mut self, addr: Address) -> Result<Bytes> {
        let reader = self.reader.as_mut().ok_or(TruckDbError::NotInitialized)?;
        reader.seek(std::io::SeekFrom::Start(u64::from(addr.offset))).await?;
        let mut buf = vec![0u8; addr.length as usize];
        reader.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    async fn read_internal(&mut self, box_id: &str, tag: &str) -> Result<Option<Value>> {
        let key = Self::key(box_id, tag);
        if let Some(buffered) = self.write_buffer.get(&key).cloned() {
            return Ok(buffered);
        }
        if let Some(value) = self.tag_lru.get(&key) {
            return Ok(Some(value));
        }
        let Some(addr) = self.index.lookup(box_id, tag) else {
            return Ok(None);
        };
        let block = self.read_block(addr).await?;
        let record = match Record::from_bytes(&block) {
            Ok((record, _)) => record,
            Err(err) => {
                tracing::warn!(truck_id = %self.id, box_id, tag, error = %err, "record failed validation on read, treating as absent");
                return Ok(None);
            }
        };
        if record.is_tombstone() {
            return Ok(None);
        }
        let value = match Value::decode(&record.data) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(truck_id = %self.id, box_id, tag, error = %err, "failed to decode stored value, treating as absent");
                return Ok(None);
            }
        };
        self.tag_lru.put(key, value.clone());
        Ok(Some(value))
    }

    pub async fn read(&mut self, box_id: &str, tag: &str) -> Result<Option<Value>> {
        self.read_internal(box_id, tag).await
    }

    pub async fn read_box(&mut self, box_id: &str) -> Result<Vec<(String, Value)>> {
        let mut tags = self.live_tags_in_box(box_id);
        let mut result = Vec::with_capacity(tags.len());
        for tag in tags.drain() {
            if let Some(value) = self.read_internal(box_id, &tag).await? {
                result.push((tag, value));
            }
        }
        Ok(result)
    }

    pub async fn query(&mut self, box_id: &str, field: &str, prefix: &str) -> Result<Vec<Value>> {
        let tags = self.field_index.query_prefix(box_id, field, prefix);
        let mut results = Vec::with_capacity(tags.len());
        for tag in tags {
            if let Some(value) = self.read_internal(box_id, &tag).await? {
                results.push(value);
            }
        }
        Ok(results)
    }

    pub async fn contains(&mut self, box_id: &str, tag: &str) -> Result<bool> {
        Ok(self.read_internal(box_id, tag).await?.is_some())
    }

    pub fn get_all_boxes(&self) -> Vec<String> {
        self.index.box_ids().map(str::to_string).collect()
    }

    fn live_tags_in_box(&self, box_id: &str) -> HashSet<String> {
        let mut tags: HashSet<String> = self
            .index
            .tags_in_box(box_id)
            .map(|(tag, _)| tag.to_string())
            .collect();
        for (b, t) in self.write_buffer.keys() {
            if b == box_id {
                tags.insert(t.clone());
            }
        }
        tags
    }

    // ---- write path -----------------------------------------------------

    /// # Panics
    /// Debug-asserts `box_id` is not the reserved transaction-framing box.
    pub async fn write(&mut self, box_id: &str, tag: &str, value: Value, sync: bool) -> Result<()> {
        debug_assert_ne!(box_id, record::SYS_BOX, "user writes must not target the reserved box");
        let key = Self::key(box_id, tag);
        let old = self.read_internal(box_id, tag).await?;
        self.field_index.update(box_id, tag, old.as_ref(), Some(&value));
        self.tag_lru.put(key.clone(), value.clone());
        self.write_buffer.insert(key, Some(value));
        self.after_mutation(sync).await
    }

    pub async fn put_cas(
        &mut self,
        box_id: &str,
        tag: &str,
        new_value: Value,
        field: &str,
        expected: &Value,
        sync: bool,
    ) -> Result<bool> {
        match self.put_cas_inner(box_id, tag, new_value, field, expected, sync).await {
            Ok(()) => Ok(true),
            Err(TruckDbError::CasMiss) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Internal CAS path: fails with `CasMiss` on a precondition mismatch
    /// rather than returning a boolean, so the public `put_cas` is the only
    /// place that translates a miss into a normal `Ok(false)` result.
    async fn put_cas_inner(
        &mut self,
        box_id: &str,
        tag: &str,
        new_value: Value,
        field: &str,
        expected: &Value,
        sync: bool,
    ) -> Result<()> {
        let current = self.read_internal(box_id, tag).await?;
        let current_field = current
            .as_ref()
            .and_then(|v| v.get_field(field))
            .cloned()
            .unwrap_or(Value::Null);
        if !current_field.cas_eq(expected) {
            return Err(TruckDbError::CasMiss);
        }
        self.write(box_id, tag, new_value, sync).await
    }

    pub async fn batch(&mut self, box_id: &str, entries: Vec<(String, Value)>) -> Result<()> {
        for (tag, value) in entries {
            debug_assert_ne!(box_id, record::SYS_BOX);
            let old = self.read_internal(box_id, &tag).await?;
            self.field_index.update(box_id, &tag, old.as_ref(), Some(&value));
            let key = Self::key(box_id, &tag);
            self.tag_lru.put(key.clone(), value.clone());
            self.write_buffer.insert(key, Some(value));
        }
        self.flush_core().await
    }

    pub async fn remove_tag(&mut self, box_id: &str, tag: &str, sync: bool) -> Result<()> {
        let key = Self::key(box_id, tag);
        let old = self.read_internal(box_id, tag).await?;
        self.field_index.update(box_id, tag, old.as_ref(), None);
        self.tag_lru.remove(&key);
        self.write_buffer.insert(key, None);
        self.after_mutation(sync).await
    }

    pub async fn remove_box(&mut self, box_id: &str, sync: bool) -> Result<()> {
        let tags = self.live_tags_in_box(box_id);
        for tag in &tags {
            let key = Self::key(box_id, tag);
            self.tag_lru.remove(&key);
            self.write_buffer.insert(key, None);
        }
        self.field_index.remove_box(box_id);
        self.index.remove_box(box_id);
        self.after_mutation(sync).await
    }

    async fn after_mutation(&mut self, sync: bool) -> Result<()> {
        if sync {
            self.flush_core().await
        } else if self.write_buffer.len() >= self.config.flush_count_threshold {
            self.flush_core().await
        } else {
            if self.flush_deadline.is_none() {
                self.flush_deadline = Some(Instant::now() + self.config.flush_time_threshold);
            }
            Ok(())
        }
    }

    /// Serializes every buffered entry into one transaction envelope,
    /// appends it, syncs, then applies the address updates to the index.
    pub async fn flush_core(&mut self) -> Result<()> {
        self.flush_deadline = None;
        if self.write_buffer.is_empty() {
            return Ok(());
        }

        let entries: Vec<(BufferKey, Option<Value>)> = self.write_buffer.drain().collect();
        let tx_id = self.next_tx_id;
        self.next_tx_id += 1;

        let mut batch = BytesMut::new();
        batch.extend_from_slice(&record::tx_start(tx_id, entries.len()).to_bytes_v2());

        let mut cursor = self.writer_offset + batch.len() as u64;
        let mut addresses: Vec<((String, String), bool, Address)> = Vec::with_capacity(entries.len());
        for ((box_id, tag), value) in &entries {
            let rec = match value {
                Some(v) => Record::new(box_id.clone(), tag.clone(), v.encode()),
                None => Record::tombstone(box_id.clone(), tag.clone()),
            };
            let encoded = rec.to_bytes_v2();
            let addr = Address {
                offset: cursor as u32,
                length: encoded.len() as u32,
            };
            addresses.push(((box_id.clone(), tag.clone()), value.is_none(), addr));
            cursor += encoded.len() as u64;
            batch.extend_from_slice(&encoded);
        }
        batch.extend_from_slice(&record::tx_commit(tx_id).to_bytes_v2());

        let writer = self.writer.as_mut().ok_or(TruckDbError::NotInitialized)?;
        writer.write_all(&batch).await?;
        writer.flush().await?;
        writer.sync_all().await?;
        self.writer_offset += batch.len() as u64;

        for ((box_id, tag), is_tombstone, addr) in addresses {
            if is_tombstone {
                self.index.remove(&box_id, &tag);
            } else {
                self.index.insert(&box_id, &tag, addr);
            }
        }
        self.index.save(&self.index_path).await?;

        self.ops_since_compact += entries.len() as u64;
        if self.ops_since_compact >= self.config.compact_threshold {
            self.compact().await?;
        }
        Ok(())
    }

    pub async fn close(&mut self) -> Result<()> {
        self.flush_core().await?;
        self.index.save(&self.index_path).await?;
        self.writer = None;
        self.reader = None;
        Ok(())
    }

    // ---- compaction -----------------------------------------------------

    fn sibling_path(&self, suffix: &str, extension: &str) -> PathBuf {
        self.data_path
            .with_file_name(format!("{}{suffix}.{extension}", self.id))
    }

    /// Rewrites the data file to contain only the latest live records, in
    /// index order, then atomically swaps it into place using a
    /// backup-rename strategy so a crash mid-compaction leaves either the
    /// complete old files or the complete new ones.
    pub async fn compact(&mut self) -> Result<()> {
        if !self.write_buffer.is_empty() {
            self.flush_core().await?;
        }

        let temp_data_path = self.sibling_path("_temp", "dat");
        let temp_index_path = self.sibling_path("_temp", "idx");

        let build_result = self.build_compacted_files(&temp_data_path, &temp_index_path).await;
        let new_index = match build_result {
            Ok(index) => index,
            Err(err) => {
                let _ = fs::remove_file(&temp_data_path).await;
                let _ = fs::remove_file(&temp_index_path).await;
                tracing::error!(truck_id = %self.id, error = %err, "compaction failed before swap, aborting");
                return Err(err);
            }
        };

        self.writer = None;
        self.reader = None;

        let bak_data_path = self.sibling_path("_bak", "dat");
        let bak_index_path = self.sibling_path("_bak", "idx");

        let swap_result: std::io::Result<()> = async {
            fs::rename(&self.data_path, &bak_data_path).await?;
            fs::rename(&self.index_path, &bak_index_path).await?;
            fs::rename(&temp_data_path, &self.data_path).await?;
            fs::rename(&temp_index_path, &self.index_path).await?;
            Ok(())
        }
        .await;

        if let Err(err) = swap_result {
            tracing::error!(truck_id = %self.id, error = %err, "compaction swap failed, restoring from backup");
            let _ = fs::rename(&bak_data_path, &self.data_path).await;
            let _ = fs::rename(&bak_index_path, &self.index_path).await;
            self.reopen_handles().await?;
            return Err(err.into());
        }

        self.index = new_index;
        self.reopen_handles().await?;
        let _ = fs::remove_file(&bak_data_path).await;
        let _ = fs::remove_file(&bak_index_path).await;
        self.ops_since_compact = 0;
        Ok(())
    }

    async fn build_compacted_files(&mut self, temp_data_path: &Path, temp_index_path: &Path) -> Result<OffsetIndex> {
        let live: Vec<(String, String)> = self
            .index
            .all_entries()
            .map(|(b, t, _)| (b.to_string(), t.to_string()))
            .collect();

        let mut writer = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(temp_data_path)
            .await?;

        let mut new_index = OffsetIndex::new();
        let mut cursor: u64 = 0;
        for (box_id, tag) in live {
            let Some(value) = self.read_internal(&box_id, &tag).await? else {
                continue;
            };
            let encoded = Record::new(box_id.clone(), tag.clone(), value.encode()).to_bytes_v2();
            writer.write_all(&encoded).await?;
            new_index.insert(&box_id, &tag, Address {
                offset: cursor as u32,
                length: encoded.len() as u32,
            });
            cursor += encoded.len() as u64;
        }
        writer.flush().await?;
        writer.sync_all().await?;
        drop(writer);

        new_index.save(temp_index_path).await?;
        Ok(new_index)
    }
}

async fn probe_write_permission(root: &Path) -> Result<()> {
    let probe = root.join(".test");
    fs::write(&probe, b"").await?;
    fs::remove_file(&probe).await?;
    Ok(())
}

/// Tolerant single-record parse used by crash recovery: returns `None`
/// (rather than an error) for anything that looks like corruption, so the
/// caller can advance one byte and keep scanning.
fn try_parse_record_at(data: &[u8], pos: usize, max_id_len: u32) -> Option<(Record, usize)> {
    let magic = *data.get(pos)?;
    let versioned = match magic {
        record::MAGIC_V1 => false,
        record::MAGIC_V2 => true,
        _ => return None,
    };

    let mut cursor = pos + 1;
    let box_id_len = read_u32_at(data, cursor)?;
    if box_id_len == 0 || box_id_len > max_id_len {
        return None;
    }
    cursor += 4;
    let box_id = take_str(data, cursor, box_id_len as usize)?;
    cursor += box_id_len as usize;

    let tag_len = read_u32_at(data, cursor)?;
    if tag_len == 0 || tag_len > max_id_len {
        return None;
    }
    cursor += 4;
    let tag = take_str(data, cursor, tag_len as usize)?;
    cursor += tag_len as usize;

    let data_len = read_u32_at(data, cursor)? as usize;
    cursor += 4;

    let header_len = cursor - pos;
    let trailer_len = if versioned { 4 } else { 0 };
    let total_len = header_len + data_len + trailer_len;
    if pos + total_len > data.len() {
        return None;
    }

    let payload = Bytes::copy_from_slice(&data[cursor..cursor + data_len]);
    cursor += data_len;

    if versioned {
        let stored_crc = u32::from_le_bytes(data[cursor..cursor + 4].try_into().ok()?);
        let computed_crc = crate::crc32::crc32(&data[pos..cursor]);
        if stored_crc != computed_crc {
            return None;
        }
    }

    Some((
        Record {
            box_id,
            tag,
            data: payload,
        },
        total_len,
    ))
}

fn read_u32_at(data: &[u8], pos: usize) -> Option<u32> {
    let bytes = data.get(pos..pos + 4)?;
    Some(u32::from_le_bytes(bytes.try_into().ok()?))
}

fn take_str(data: &[u8], pos: usize, len: usize) -> Option<String> {
    let bytes = data.get(pos..pos + len)?;
    String::from_utf8(bytes.to_vec()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn user_value(name: &str, age: i64) -> Value {
        Value::Map(vec![
            ("name".to_string(), Value::String(name.to_string())),
            ("age".to_string(), Value::Int(age)),
        ])
    }

    #[tokio::test]
    async fn basic_put_and_get() {
        let dir = tempdir().unwrap();
        let mut truck = Truck::open(dir.path(), "t", TruckConfig::default()).await.unwrap();
        truck
            .write("users", "u1", user_value("Alice", 30), true)
            .await
            .unwrap();
        let value = truck.read("users", "u1").await.unwrap();
        assert_eq!(value, Some(user_value("Alice", 30)));
    }

    #[tokio::test]
    async fn write_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let mut truck = Truck::open(dir.path(), "t", TruckConfig::default()).await.unwrap();
            truck
                .write("users", "u1", user_value("Alice", 30), true)
                .await
                .unwrap();
        }
        let mut truck = Truck::open(dir.path(), "t", TruckConfig::default()).await.unwrap();
        let value = truck.read("users", "u1").await.unwrap();
        assert_eq!(value, Some(user_value("Alice", 30)));
    }

    #[tokio::test]
    async fn crc_corruption_on_disk_is_treated_as_absent() {
        let dir = tempdir().unwrap();
        {
            let mut truck = Truck::open(dir.path(), "t", TruckConfig::default()).await.unwrap();
            truck
                .write("users", "u1", user_value("Alice", 30), true)
                .await
                .unwrap();
        }

        let data_path = dir.path().join("t.dat");
        let mut bytes = fs::read(&data_path).await.unwrap();
        let last = bytes.len() - 10;
        bytes[last] ^= 0xFF;
        fs::write(&data_path, &bytes).await.unwrap();

        let mut truck = Truck::open(dir.path(), "t", TruckConfig::default()).await.unwrap();
        let value = truck.read("users", "u1").await.unwrap();
        assert_eq!(value, None);
    }

    #[tokio::test]
    async fn incomplete_batch_is_invisible_after_recovery() {
        let dir = tempdir().unwrap();
        {
            let mut truck = Truck::open(dir.path(), "t", TruckConfig::default()).await.unwrap();
            truck
                .write("b", "a", Value::Map(vec![("v".to_string(), Value::Int(1))]), false)
                .await
                .unwrap();
            truck.flush_core().await.unwrap();
        }

        // Truncate off the TX_COMMIT record to simulate a crash mid-batch.
        let data_path = dir.path().join("t.dat");
        let bytes = fs::read(&data_path).await.unwrap();
        let commit_len = record::tx_commit(0).to_bytes_v2().len();
        let truncated = &bytes[..bytes.len() - commit_len];
        fs::write(&data_path, truncated).await.unwrap();
        fs::remove_file(dir.path().join("t.idx")).await.unwrap();

        let mut truck = Truck::open(dir.path(), "t", TruckConfig::default()).await.unwrap();
        assert_eq!(truck.read("b", "a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn cas_success_then_failure() {
        let dir = tempdir().unwrap();
        let mut truck = Truck::open(dir.path(), "t", TruckConfig::default()).await.unwrap();
        let v1 = Value::Map(vec![("ver".to_string(), Value::Int(1))]);
        let v2 = Value::Map(vec![("ver".to_string(), Value::Int(2))]);
        let v3 = Value::Map(vec![("ver".to_string(), Value::Int(3))]);

        truck.write("k", "t", v1, true).await.unwrap();
        let ok = truck
            .put_cas("k", "t", v2.clone(), "ver", &Value::Int(1), true)
            .await
            .unwrap();
        assert!(ok);

        let miss = truck
            .put_cas("k", "t", v3, "ver", &Value::Int(1), true)
            .await
            .unwrap();
        assert!(!miss);

        assert_eq!(truck.read("k", "t").await.unwrap(), Some(v2));
    }

    #[tokio::test]
    async fn prefix_query_across_mixed_names() {
        let dir = tempdir().unwrap();
        let mut truck = Truck::open(dir.path(), "t", TruckConfig::default()).await.unwrap();
        for name in ["Alice", "Alan", "Albert", "Alma", "Alta", "Bob", "Carl", "Dan"] {
            truck
                .write("users", name, user_value(name, 1), true)
                .await
                .unwrap();
        }
        let results = truck.query("users", "name", "Al").await.unwrap();
        assert_eq!(results.len(), 5);
    }

    #[tokio::test]
    async fn compact_preserves_live_values_and_shrinks_file() {
        let dir = tempdir().unwrap();
        let mut truck = Truck::open(dir.path(), "t", TruckConfig::default()).await.unwrap();
        for i in 0..20 {
            let tag = format!("t{i}");
            for v in 0..3 {
                truck
                    .write("b", &tag, Value::Map(vec![("v".to_string(), Value::Int(v))]), false)
                    .await
                    .unwrap();
            }
        }
        truck.flush_core().await.unwrap();
        for i in 0..10 {
            truck.remove_tag("b", &format!("t{i}"), false).await.unwrap();
        }
        truck.flush_core().await.unwrap();

        let size_before = fs::metadata(dir.path().join("t.dat")).await.unwrap().len();
        truck.compact().await.unwrap();
        let size_after = fs::metadata(dir.path().join("t.dat")).await.unwrap().len();
        assert!(size_after < size_before);

        let remaining = truck.read_box("b").await.unwrap();
        assert_eq!(remaining.len(), 10);
        for (tag, value) in remaining {
            let idx: i64 = tag.trim_start_matches('t').parse().unwrap();
            assert!(idx >= 10);
            assert_eq!(value, Value::Map(vec![("v".to_string(), Value::Int(2))]));
        }
    }

    #[tokio::test]
    async fn remove_box_tombstones_every_live_tag() {
        let dir = tempdir().unwrap();
        let mut truck = Truck::open(dir.path(), "t", TruckConfig::default()).await.unwrap();
        truck.write("b", "x", Value::Int(1), true).await.unwrap();
        truck.write("b", "y", Value::Int(2), true).await.unwrap();
        truck.remove_box("b", true).await.unwrap();
        assert_eq!(truck.read("b", "x").await.unwrap(), None);
        assert_eq!(truck.read("b", "y").await.unwrap(), None);
        assert!(!truck.get_all_boxes().contains(&"b".to_string()));
    }

    #[tokio::test]
    async fn get_all_boxes_excludes_reserved_sys_box() {
        let dir = tempdir().unwrap();
        let mut truck = Truck::open(dir.path(), "t", TruckConfig::default()).await.unwrap();
        truck.write("users", "u1", Value::Int(1), true).await.unwrap();
        assert_eq!(truck.get_all_boxes(), vec!["users".to_string()]);
    }
}
