//! RocksDB-backed operation store.
//!
//! Column families:
//! - `operations`: Operation records (bincode), keyed by `workspace_id:ts`
//! - `element_ops`: Same records indexed by `element_id:ts` for history reads
//! - `snapshots`: Workspace checkpoints (bincode + LZ4), keyed by `workspace_id:version`
//! - `metadata`: Per-workspace [`LogMetadata`] (high-water, floor, counts)
//!
//! Keys are 16-byte UUIDs followed by an 8-byte big-endian timestamp, so a
//! forward iterator over a workspace prefix yields the log in timestamp order.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode, Direction,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use super::{verify_ascending, OperationStore, Snapshot};
use crate::element::{ElementId, WorkspaceId};
use crate::error::{StoreError, StoreResult};
use crate::operation::{Operation, Timestamp};

const CF_OPERATIONS: &str = "operations";
const CF_ELEMENT_OPS: &str = "element_ops";
const CF_SNAPSHOTS: &str = "snapshots";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_OPERATIONS, CF_ELEMENT_OPS, CF_SNAPSHOTS, CF_METADATA];

const KEY_LEN: usize = 24;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every append (default: true, an acked operation must survive a crash)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("logos_sync_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Small caches, no fsync.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Per-workspace bookkeeping stored in the `metadata` column family.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogMetadata {
    pub high_water: Timestamp,
    /// Operations below this timestamp have been pruned.
    pub floor: Timestamp,
    pub operation_count: u64,
    pub snapshot_count: u64,
}

impl LogMetadata {
    fn encode(&self) -> StoreResult<Vec<u8>> {
        encode(self)
    }

    fn decode(bytes: &[u8]) -> StoreResult<Self> {
        decode(bytes)
    }
}

fn encode<T: Serialize>(value: &T) -> StoreResult<Vec<u8>> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> StoreResult<T> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(value)
}

/// RocksDB-backed [`OperationStore`].
pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Held across every read-modify-write of a [`LogMetadata`] record.
    meta_lock: Mutex<()>,
}

impl RocksStore {
    /// Open the store, creating the database and column families if missing.
    pub fn open(config: StoreConfig) -> StoreResult<Self> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cache = Cache::new_lru_cache(config.block_cache_size);
        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config, &cache)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(&db_opts, &config.path, cf_descriptors)?;
        log::info!("Opened operation store at {}", config.path.display());

        Ok(Self {
            db,
            config,
            meta_lock: Mutex::new(()),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig, cache: &Cache) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_block_cache(cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_OPERATIONS | CF_ELEMENT_OPS => {
                // Many small appends, prefix-scanned by uuid
                opts.set_max_write_buffer_number(4);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            }
            CF_SNAPSHOTS => {
                // Values are already LZ4 compressed
                opts.set_max_write_buffer_number(2);
                opts.set_compression_type(DBCompressionType::None);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            }
            CF_METADATA => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Flush memtables to disk.
    pub fn flush(&self) -> StoreResult<()> {
        self.db.flush()?;
        Ok(())
    }

    pub fn metadata(&self, workspace_id: WorkspaceId) -> StoreResult<Option<LogMetadata>> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, workspace_id.as_bytes())? {
            Some(bytes) => LogMetadata::decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    fn write_options(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        write_opts
    }

    fn cf(&self, name: &str) -> StoreResult<&rocksdb::ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    /// Walk `cf` forward from `prefix ‖ from` while keys share `prefix`.
    fn scan_prefix(
        &self,
        cf: &rocksdb::ColumnFamily,
        prefix: &Uuid,
        from: Timestamp,
        mut visit: impl FnMut(Timestamp, &[u8], &[u8]) -> StoreResult<bool>,
    ) -> StoreResult<()> {
        let start = make_key(prefix, from);
        let iter = self.db.iterator_cf(cf, IteratorMode::From(&start, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if key.len() != KEY_LEN || &key[..16] != prefix.as_bytes() {
                break;
            }
            if !visit(key_timestamp(&key), &key[..], &value[..])? {
                break;
            }
        }
        Ok(())
    }

    fn decode_snapshot(workspace_id: WorkspaceId, compressed: &[u8]) -> StoreResult<Snapshot> {
        let bytes = lz4_flex::decompress_size_prepended(compressed)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        let snapshot: Snapshot = decode(&bytes)?;
        if snapshot.workspace_id != workspace_id {
            return Err(StoreError::Corrupted {
                workspace_id,
                timestamp: snapshot.version,
            });
        }
        Ok(snapshot)
    }
}

impl OperationStore for RocksStore {
    fn append(&self, op: Operation) -> StoreResult<Operation> {
        let cf_ops = self.cf(CF_OPERATIONS)?;
        let cf_elements = self.cf(CF_ELEMENT_OPS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let _meta_guard = self.meta_lock.lock();
        let mut meta = self.metadata(op.workspace_id)?.unwrap_or_default();
        if op.timestamp <= meta.high_water {
            return Err(StoreError::OutOfOrder {
                workspace_id: op.workspace_id,
                timestamp: op.timestamp,
                high_water: meta.high_water,
            });
        }
        meta.high_water = op.timestamp;
        meta.operation_count += 1;

        let value = encode(&op)?;

        // Record, index and metadata land together or not at all
        let mut batch = WriteBatch::default();
        batch.put_cf(cf_ops, make_key(&op.workspace_id, op.timestamp), &value);
        batch.put_cf(cf_elements, make_key(&op.element_id, op.timestamp), &value);
        batch.put_cf(cf_meta, op.workspace_id.as_bytes(), meta.encode()?);
        self.db.write_opt(batch, &self.write_options())?;

        log::trace!("Appended op at t={} to workspace {}", op.timestamp, op.workspace_id);
        Ok(op)
    }

    fn since(&self, workspace_id: WorkspaceId, after: Timestamp, limit: usize) -> StoreResult<Vec<Operation>> {
        let cf = self.cf(CF_OPERATIONS)?;
        let mut ops = Vec::new();
        if limit == 0 || after == Timestamp::MAX {
            return Ok(ops);
        }

        self.scan_prefix(cf, &workspace_id, after + 1, |ts, _, value| {
            let op: Operation = decode(value)?;
            if op.timestamp != ts {
                return Err(StoreError::Corrupted { workspace_id, timestamp: ts });
            }
            ops.push(op);
            Ok(ops.len() < limit)
        })?;

        verify_ascending(workspace_id, after, &ops)?;
        Ok(ops)
    }

    fn by_element(&self, element_id: ElementId) -> StoreResult<Vec<Operation>> {
        let cf = self.cf(CF_ELEMENT_OPS)?;
        let mut ops = Vec::new();
        self.scan_prefix(cf, &element_id, 0, |_, _, value| {
            ops.push(decode::<Operation>(value)?);
            Ok(true)
        })?;
        Ok(ops)
    }

    fn high_water(&self, workspace_id: WorkspaceId) -> StoreResult<Timestamp> {
        Ok(self.metadata(workspace_id)?.map(|m| m.high_water).unwrap_or(0))
    }

    fn log_floor(&self, workspace_id: WorkspaceId) -> StoreResult<Timestamp> {
        Ok(self.metadata(workspace_id)?.map(|m| m.floor).unwrap_or(0))
    }

    fn save_snapshot(&self, snapshot: &Snapshot) -> StoreResult<()> {
        let cf_snapshots = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let workspace_id = snapshot.workspace_id;

        let _meta_guard = self.meta_lock.lock();
        if let Some(latest) = self.snapshot_versions(workspace_id)?.last().copied() {
            if snapshot.version <= latest {
                return Err(StoreError::StaleSnapshot {
                    workspace_id,
                    version: snapshot.version,
                    latest,
                });
            }
        }

        let raw = encode(snapshot)?;
        let compressed = lz4_flex::compress_prepend_size(&raw);

        let mut meta = self.metadata(workspace_id)?.unwrap_or_default();
        meta.snapshot_count += 1;

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_snapshots, make_key(&workspace_id, snapshot.version), &compressed);
        batch.put_cf(cf_meta, workspace_id.as_bytes(), meta.encode()?);
        self.db.write_opt(batch, &self.write_options())?;

        log::debug!(
            "Saved snapshot v{} for workspace {} ({} elements, {} -> {} bytes)",
            snapshot.version,
            workspace_id,
            snapshot.element_count,
            raw.len(),
            compressed.len()
        );
        Ok(())
    }

    fn latest_snapshot(&self, workspace_id: WorkspaceId) -> StoreResult<Option<Snapshot>> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        let start = make_key(&workspace_id, Timestamp::MAX);
        let mut iter = self.db.iterator_cf(cf, IteratorMode::From(&start, Direction::Reverse));
        match iter.next() {
            Some(item) => {
                let (key, value) = item?;
                if key.len() != KEY_LEN || &key[..16] != workspace_id.as_bytes() {
                    return Ok(None);
                }
                Self::decode_snapshot(workspace_id, &value).map(Some)
            }
            None => Ok(None),
        }
    }

    fn snapshot_versions(&self, workspace_id: WorkspaceId) -> StoreResult<Vec<Timestamp>> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        let mut versions = Vec::new();
        self.scan_prefix(cf, &workspace_id, 0, |version, _, _| {
            versions.push(version);
            Ok(true)
        })?;
        Ok(versions)
    }

    fn delete_snapshots_before(&self, workspace_id: WorkspaceId, before: Timestamp) -> StoreResult<usize> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        let mut batch = WriteBatch::default();
        let mut count = 0usize;
        self.scan_prefix(cf, &workspace_id, 0, |version, key, _| {
            if version >= before {
                return Ok(false);
            }
            batch.delete_cf(cf, key);
            count += 1;
            Ok(true)
        })?;

        if count > 0 {
            let cf_meta = self.cf(CF_METADATA)?;
            let _meta_guard = self.meta_lock.lock();
            let mut meta = self.metadata(workspace_id)?.unwrap_or_default();
            meta.snapshot_count = meta.snapshot_count.saturating_sub(count as u64);
            batch.put_cf(cf_meta, workspace_id.as_bytes(), meta.encode()?);
            self.db.write_opt(batch, &self.write_options())?;
        }
        Ok(count)
    }

    fn prune_operations_before(&self, workspace_id: WorkspaceId, before: Timestamp) -> StoreResult<usize> {
        let cf_ops = self.cf(CF_OPERATIONS)?;
        let cf_elements = self.cf(CF_ELEMENT_OPS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let mut batch = WriteBatch::default();
        let mut count = 0usize;
        self.scan_prefix(cf_ops, &workspace_id, 0, |ts, key, value| {
            if ts >= before {
                return Ok(false);
            }
            let op: Operation = decode(value)?;
            batch.delete_cf(cf_ops, key);
            batch.delete_cf(cf_elements, make_key(&op.element_id, ts));
            count += 1;
            Ok(true)
        })?;

        let _meta_guard = self.meta_lock.lock();
        let mut meta = self.metadata(workspace_id)?.unwrap_or_default();
        meta.floor = meta.floor.max(before);
        meta.operation_count = meta.operation_count.saturating_sub(count as u64);
        batch.put_cf(cf_meta, workspace_id.as_bytes(), meta.encode()?);
        self.db.write_opt(batch, &self.write_options())?;

        Ok(count)
    }

    fn workspaces(&self) -> StoreResult<Vec<WorkspaceId>> {
        let cf = self.cf(CF_METADATA)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            let bytes: [u8; 16] = key
                .as_ref()
                .try_into()
                .map_err(|_| StoreError::Deserialization("Invalid UUID key".into()))?;
            ids.push(Uuid::from_bytes(bytes));
        }
        Ok(ids)
    }
}

/// `uuid (16 bytes) ‖ timestamp (8 bytes big-endian)`.
fn make_key(prefix: &Uuid, timestamp: Timestamp) -> Vec<u8> {
    let mut key = Vec::with_capacity(KEY_LEN);
    key.extend_from_slice(prefix.as_bytes());
    key.extend_from_slice(&timestamp.to_be_bytes());
    key
}

fn key_timestamp(key: &[u8]) -> Timestamp {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&key[16..KEY_LEN]);
    u64::from_be_bytes(buf)
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::{Element, ElementContent};
    use crate::operation::Change;
    use tempfile::TempDir;

    fn open_temp() -> (TempDir, RocksStore) {
        let dir = TempDir::new().unwrap();
        let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        (dir, store)
    }

    fn op(ws: Uuid, element: Uuid, ts: Timestamp) -> Operation {
        let element_state = Element::new(element, ws, ElementContent::Text { text: format!("t{ts}") });
        Operation::new(ws, element, Uuid::new_v4(), ts, Change::Create {
            element: element_state,
            provisional_id: None,
        })
    }

    #[test]
    fn test_store_open() {
        let (_dir, store) = open_temp();
        assert!(store.path().exists());
        assert!(store.workspaces().unwrap().is_empty());
    }

    #[test]
    fn test_append_since_roundtrip() {
        let (_dir, store) = open_temp();
        let ws = Uuid::new_v4();
        let written: Vec<Operation> = (1..=10)
            .map(|ts| store.append(op(ws, Uuid::new_v4(), ts)).unwrap())
            .collect();

        let all = store.since(ws, 0, usize::MAX).unwrap();
        assert_eq!(all, written);

        let tail = store.since(ws, 8, usize::MAX).unwrap();
        assert_eq!(tail.iter().map(|o| o.timestamp).collect::<Vec<_>>(), vec![9, 10]);

        let page = store.since(ws, 2, 3).unwrap();
        assert_eq!(page.iter().map(|o| o.timestamp).collect::<Vec<_>>(), vec![3, 4, 5]);

        assert!(store.since(ws, 10, 100).unwrap().is_empty());
        assert_eq!(store.high_water(ws).unwrap(), 10);
    }

    #[test]
    fn test_append_out_of_order_rejected() {
        let (_dir, store) = open_temp();
        let ws = Uuid::new_v4();
        store.append(op(ws, Uuid::new_v4(), 3)).unwrap();
        assert!(matches!(
            store.append(op(ws, Uuid::new_v4(), 2)),
            Err(StoreError::OutOfOrder { high_water: 3, .. })
        ));
    }

    #[test]
    fn test_workspace_isolation() {
        let (_dir, store) = open_temp();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        for ts in 1..=5 {
            store.append(op(a, Uuid::new_v4(), ts)).unwrap();
        }
        for ts in 1..=3 {
            store.append(op(b, Uuid::new_v4(), ts)).unwrap();
        }

        assert_eq!(store.since(a, 0, 100).unwrap().len(), 5);
        assert_eq!(store.since(b, 0, 100).unwrap().len(), 3);
        let mut ids = store.workspaces().unwrap();
        ids.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(ids, expected);
    }

    #[test]
    fn test_by_element_history() {
        let (_dir, store) = open_temp();
        let ws = Uuid::new_v4();
        let element = Uuid::new_v4();
        store.append(op(ws, element, 1)).unwrap();
        store.append(op(ws, Uuid::new_v4(), 2)).unwrap();
        store
            .append(Operation::new(ws, element, Uuid::new_v4(), 3, Change::Delete))
            .unwrap();

        let history = store.by_element(element).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].change, Change::Delete);
    }

    #[test]
    fn test_snapshot_save_load_compressed() {
        let (_dir, store) = open_temp();
        let ws = Uuid::new_v4();
        let elements: Vec<Element> = (0..200)
            .map(|i| Element::new(Uuid::new_v4(), ws, ElementContent::Text { text: format!("note {i}") }))
            .collect();
        let snapshot = Snapshot::new(ws, 42, elements, None);

        assert!(store.latest_snapshot(ws).unwrap().is_none());
        store.save_snapshot(&snapshot).unwrap();
        let loaded = store.latest_snapshot(ws).unwrap().unwrap();
        assert_eq!(loaded, snapshot);
        assert_eq!(store.metadata(ws).unwrap().unwrap().snapshot_count, 1);
    }

    #[test]
    fn test_snapshot_versions_and_stale_rejection() {
        let (_dir, store) = open_temp();
        let ws = Uuid::new_v4();
        let other = Uuid::new_v4();
        store.save_snapshot(&Snapshot::new(ws, 5, vec![], None)).unwrap();
        store.save_snapshot(&Snapshot::new(ws, 9, vec![], None)).unwrap();
        store.save_snapshot(&Snapshot::new(other, 100, vec![], None)).unwrap();

        assert!(matches!(
            store.save_snapshot(&Snapshot::new(ws, 9, vec![], None)),
            Err(StoreError::StaleSnapshot { latest: 9, .. })
        ));
        assert_eq!(store.snapshot_versions(ws).unwrap(), vec![5, 9]);
        assert_eq!(store.latest_snapshot(ws).unwrap().unwrap().version, 9);
    }

    #[test]
    fn test_concurrent_append_and_compaction_keep_metadata() {
        let (_dir, store) = open_temp();
        let ws = Uuid::new_v4();

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for ts in 1..=200 {
                    store.append(op(ws, Uuid::new_v4(), ts)).unwrap();
                }
            });
            scope.spawn(|| {
                for v in 1..=100 {
                    store.save_snapshot(&Snapshot::new(ws, v, vec![], None)).unwrap();
                    if v % 10 == 0 {
                        store.delete_snapshots_before(ws, v).unwrap();
                    }
                }
            });
        });

        assert_eq!(store.high_water(ws).unwrap(), 200);
        let meta = store.metadata(ws).unwrap().unwrap();
        assert_eq!(meta.operation_count, 200);
        assert_eq!(meta.snapshot_count, store.snapshot_versions(ws).unwrap().len() as u64);
        assert_eq!(store.since(ws, 0, 1000).unwrap().len(), 200);
    }

    #[test]
    fn test_prune_operations_and_snapshots() {
        let (_dir, store) = open_temp();
        let ws = Uuid::new_v4();
        let element = Uuid::new_v4();
        store.append(op(ws, element, 1)).unwrap();
        for ts in 2..=10 {
            store.append(op(ws, Uuid::new_v4(), ts)).unwrap();
        }
        for v in [3, 6, 9] {
            store.save_snapshot(&Snapshot::new(ws, v, vec![], None)).unwrap();
        }

        assert_eq!(store.prune_operations_before(ws, 6).unwrap(), 5);
        assert_eq!(store.delete_snapshots_before(ws, 6).unwrap(), 1);

        assert_eq!(store.log_floor(ws).unwrap(), 6);
        assert_eq!(store.since(ws, 0, 100).unwrap().first().unwrap().timestamp, 6);
        assert!(store.by_element(element).unwrap().is_empty());
        assert_eq!(store.snapshot_versions(ws).unwrap(), vec![6, 9]);

        let meta = store.metadata(ws).unwrap().unwrap();
        assert_eq!(meta.operation_count, 5);
        assert_eq!(meta.snapshot_count, 2);
        assert_eq!(meta.high_water, 10);
    }

    #[test]
    fn test_reopen_preserves_log() {
        let dir = TempDir::new().unwrap();
        let ws = Uuid::new_v4();
        {
            let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();
            for ts in 1..=3 {
                store.append(op(ws, Uuid::new_v4(), ts)).unwrap();
            }
            store.flush().unwrap();
        }

        let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        assert_eq!(store.high_water(ws).unwrap(), 3);
        assert_eq!(store.since(ws, 0, 100).unwrap().len(), 3);
        store.append(op(ws, Uuid::new_v4(), 4)).unwrap();
    }

    #[test]
    fn test_store_config_default() {
        let config = StoreConfig::default();
        assert!(config.sync_writes);
        assert_eq!(config.bloom_filter_bits, 10);
        assert!(!StoreConfig::for_testing("x").sync_writes);
    }
}
