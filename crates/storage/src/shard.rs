//! Per-shard vector storage: CRUD over the `vectors` table plus the
//! changelog every mutation appends to.

use crate::codec::{
    decode_embedding, decode_metadata, decode_version_vector, encode_embedding, encode_metadata,
    encode_version_vector,
};
use crate::error::{StorageError, StorageResult};
use crate::substrate::SqlSubstrate;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use synapse_core::{ChangeOp, ChangelogEntry, ShardId, VectorId, VectorRecord, VersionVector};
use tracing::{debug, trace};

/// Aggregate counters for a shard, per the storage engine's public `stats`
/// operation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShardStats {
    /// Live (non-deleted) record count.
    pub count: u64,
    /// Approximate bytes occupied by embeddings and metadata.
    pub bytes: u64,
    /// Embedding dimension fixed for this shard.
    pub dimension: usize,
    /// Whether the HNSW index has finished building (`hnsw_metadata.built`).
    pub index_ready: bool,
    /// Whether a trained quantizer codec is persisted for this shard.
    pub quantizer_ready: bool,
}

/// Durable primary storage for one shard: vector records and the
/// changelog recording their mutation history.
///
/// Concurrent writers within a process are serialised via `lock`; readers
/// take only a shared guard. The lock guards in-memory bookkeeping only —
/// SQLite's own transaction isolation protects the rows themselves — but
/// holding it for the full duration of a write keeps this engine's
/// observable behaviour (no interleaved writer-visible partial state)
/// simple to reason about.
pub struct ShardStorage {
    substrate: Arc<SqlSubstrate>,
    shard_id: ShardId,
    dimension: usize,
    local_node: String,
    lock: RwLock<()>,
    next_change_id: AtomicI64,
    current_vv: Mutex<VersionVector>,
}

impl ShardStorage {
    /// Open storage for `shard_id`, restoring the changelog position and
    /// current version vector from persisted state.
    pub fn open(
        substrate: Arc<SqlSubstrate>,
        shard_id: ShardId,
        dimension: usize,
        local_node: impl Into<String>,
    ) -> StorageResult<Self> {
        let latest: Option<(i64, Vec<u8>)> = substrate.with_connection(|conn| {
            conn.query_row(
                "SELECT change_id, version_vector_bytes FROM changelog \
                 WHERE shard_id = ?1 ORDER BY change_id DESC LIMIT 1",
                [shard_id.as_str()],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?)),
            )
            .optional()
        })?;
        let (last_change_id, vv) = match latest {
            Some((id, bytes)) => (id, decode_version_vector(&bytes)?),
            None => (0, VersionVector::new()),
        };

        Ok(ShardStorage {
            substrate,
            shard_id,
            dimension,
            local_node: local_node.into(),
            lock: RwLock::new(()),
            next_change_id: AtomicI64::new(last_change_id + 1),
            current_vv: Mutex::new(vv),
        })
    }

    /// Shard identifier this storage instance serves.
    pub fn shard_id(&self) -> &ShardId {
        &self.shard_id
    }

    /// Embedding dimension fixed for this shard.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    fn next_version_vector(&self) -> (i64, VersionVector) {
        let change_id = self.next_change_id.fetch_add(1, Ordering::SeqCst);
        let mut vv = self.current_vv.lock();
        vv.observe(&self.local_node, change_id as u64);
        (change_id, vv.clone())
    }

    #[allow(clippy::too_many_arguments)]
    fn append_changelog(
        &self,
        change_id: i64,
        vector_id: &VectorId,
        op: ChangeOp,
        embedding: Option<&[f32]>,
        metadata: &Option<serde_json::Value>,
        source_node: &str,
        timestamp_us: u64,
        version_vector: &VersionVector,
    ) -> StorageResult<()> {
        let op_str = match op {
            ChangeOp::Insert => "insert",
            ChangeOp::Update => "update",
            ChangeOp::Delete => "delete",
        };
        let embedding_bytes = embedding.map(encode_embedding);
        let metadata_bytes = encode_metadata(metadata)?;
        let vv_bytes = encode_version_vector(version_vector)?;

        self.substrate.with_connection(|conn| {
            conn.execute(
                "INSERT INTO changelog \
                 (change_id, shard_id, vector_id, op, embedding_bytes, metadata_bytes, \
                  source_node, timestamp_us, version_vector_bytes) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                rusqlite::params![
                    change_id,
                    self.shard_id.as_str(),
                    vector_id.as_str(),
                    op_str,
                    embedding_bytes,
                    metadata_bytes,
                    source_node,
                    timestamp_us as i64,
                    vv_bytes,
                ],
            )
        })?;
        Ok(())
    }

    /// The highest change id appended to this shard's changelog so far.
    /// Used by the sync engine to record a watermark before computing a
    /// delta to send a peer.
    pub fn latest_change_id(&self) -> u64 {
        (self.next_change_id.load(Ordering::SeqCst) - 1).max(0) as u64
    }

    /// The current version vector, merged across every local and remote
    /// change observed by this shard.
    pub fn version_vector(&self) -> VersionVector {
        self.current_vv.lock().clone()
    }

    /// Apply a changelog entry received from a remote peer: upsert (or
    /// tombstone) the affected vector, and append a changelog row
    /// attributed to the entry's original `source_node` and `timestamp_us`
    /// rather than this node's own clock. The local version vector is
    /// merged with the entry's, and local changelog numbering continues
    /// independently of the remote's own `change_id` sequence.
    pub fn apply_remote_change(&self, entry: &ChangelogEntry) -> StorageResult<()> {
        let _guard = self.lock.write();

        self.substrate.transaction(|s| {
            match entry.op {
                ChangeOp::Insert | ChangeOp::Update => {
                    let embedding = entry.embedding.as_ref().ok_or_else(|| {
                        StorageError::CorruptRecord(
                            "remote insert/update change missing embedding".to_string(),
                        )
                    })?;
                    if embedding.len() != self.dimension {
                        return Err(StorageError::DimensionMismatch {
                            expected: self.dimension,
                            got: embedding.len(),
                        });
                    }
                    let embedding_bytes = encode_embedding(embedding);
                    let metadata_bytes = encode_metadata(&entry.metadata)?;
                    let exists = self.fetch_row(s, &entry.vector_id)?.is_some();

                    if exists {
                        s.with_connection(|conn| {
                            conn.execute(
                                "UPDATE vectors SET embedding_bytes = ?1, metadata_bytes = ?2, \
                                 timestamp_us = ?3 WHERE id = ?4",
                                rusqlite::params![
                                    embedding_bytes,
                                    metadata_bytes,
                                    entry.timestamp_us as i64,
                                    entry.vector_id.as_str(),
                                ],
                            )
                        })?;
                    } else {
                        let seq = self.next_seq(s)?;
                        s.with_connection(|conn| {
                            conn.execute(
                                "INSERT INTO vectors (id, shard_id, embedding_bytes, \
                                 metadata_bytes, timestamp_us, seq) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                                rusqlite::params![
                                    entry.vector_id.as_str(),
                                    self.shard_id.as_str(),
                                    embedding_bytes,
                                    metadata_bytes,
                                    entry.timestamp_us as i64,
                                    seq,
                                ],
                            )
                        })?;
                    }
                }
                ChangeOp::Delete => {
                    s.with_connection(|conn| {
                        conn.execute(
                            "DELETE FROM vectors WHERE id = ?1",
                            [entry.vector_id.as_str()],
                        )
                    })?;
                }
            }

            let change_id = self.next_change_id.fetch_add(1, Ordering::SeqCst);
            let vv = {
                let mut vv = self.current_vv.lock();
                *vv = vv.merge(&entry.version_vector);
                vv.clone()
            };
            self.append_changelog(
                change_id,
                &entry.vector_id,
                entry.op,
                entry.embedding.as_deref(),
                &entry.metadata,
                &entry.source_node,
                entry.timestamp_us,
                &vv,
            )?;
            Ok(())
        })?;

        trace!(
            shard = %self.shard_id,
            id = %entry.vector_id,
            source = %entry.source_node,
            "applied remote change"
        );
        Ok(())
    }

    /// Insert a new record, generating an id if `record.id` is blank.
    /// Fails with [`StorageError::DuplicateId`] if the id already exists.
    pub fn insert(&self, mut record: VectorRecord) -> StorageResult<VectorId> {
        let _guard = self.lock.write();
        if record.id.as_str().is_empty() {
            record.id = VectorId::generate();
        }
        self.insert_locked(&record)?;
        Ok(record.id)
    }

    fn insert_locked(&self, record: &VectorRecord) -> StorageResult<()> {
        self.substrate.transaction(|s| self.insert_row(s, record))?;
        trace!(shard = %self.shard_id, id = %record.id, "inserted vector");
        Ok(())
    }

    /// Insert one row plus its changelog entry against an already-open
    /// transaction on `s`. Does not begin or commit a transaction of its
    /// own, so callers that need to insert many rows atomically (e.g.
    /// [`Self::insert_batch`]) can call this repeatedly inside one
    /// `substrate.transaction` instead of nesting transactions, which
    /// SQLite rejects.
    fn insert_row(&self, s: &SqlSubstrate, record: &VectorRecord) -> StorageResult<()> {
        if record.embedding.len() != self.dimension {
            return Err(StorageError::DimensionMismatch {
                expected: self.dimension,
                got: record.embedding.len(),
            });
        }

        let exists: bool = s.with_connection(|conn| {
            conn.query_row(
                "SELECT 1 FROM vectors WHERE id = ?1",
                [record.id.as_str()],
                |_| Ok(()),
            )
            .optional()
            .map(|r| r.is_some())
        })?;
        if exists {
            return Err(StorageError::DuplicateId(record.id.as_str().to_string()));
        }

        let embedding_bytes = encode_embedding(&record.embedding);
        let metadata_bytes = encode_metadata(&record.metadata)?;
        let seq = self.next_seq(s)?;

        s.with_connection(|conn| {
            conn.execute(
                "INSERT INTO vectors (id, shard_id, embedding_bytes, metadata_bytes, \
                 timestamp_us, seq) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    record.id.as_str(),
                    self.shard_id.as_str(),
                    embedding_bytes,
                    metadata_bytes,
                    record.timestamp_us as i64,
                    seq,
                ],
            )
        })?;

        let (change_id, vv) = self.next_version_vector();
        self.append_changelog(
            change_id,
            &record.id,
            ChangeOp::Insert,
            Some(&record.embedding),
            &record.metadata,
            &self.local_node,
            record.timestamp_us,
            &vv,
        )?;
        Ok(())
    }

    fn next_seq(&self, substrate: &SqlSubstrate) -> StorageResult<i64> {
        substrate.with_connection(|conn| {
            conn.query_row(
                "SELECT COALESCE(MAX(seq), -1) + 1 FROM vectors WHERE shard_id = ?1",
                [self.shard_id.as_str()],
                |row| row.get(0),
            )
        })
    }

    /// Insert every record in `records` as a single atomic unit: either
    /// all of them (and their changelog entries) become durable, or none
    /// do.
    pub fn insert_batch(&self, mut records: Vec<VectorRecord>) -> StorageResult<Vec<VectorId>> {
        let _guard = self.lock.write();
        for record in &mut records {
            if record.id.as_str().is_empty() {
                record.id = VectorId::generate();
            }
        }

        self.substrate.transaction(|s| {
            for record in &records {
                self.insert_row(s, record)?;
            }
            Ok(())
        })?;

        debug!(shard = %self.shard_id, count = records.len(), "inserted batch");
        Ok(records.into_iter().map(|r| r.id).collect())
    }

    /// Replace `id`'s embedding and/or metadata. `None` for either leaves
    /// that field unchanged. Fails with [`StorageError::NotFound`] if the
    /// id does not exist.
    pub fn update(
        &self,
        id: &VectorId,
        new_embedding: Option<Vec<f32>>,
        new_metadata: Option<Option<serde_json::Value>>,
    ) -> StorageResult<()> {
        let _guard = self.lock.write();

        if let Some(ref e) = new_embedding {
            if e.len() != self.dimension {
                return Err(StorageError::DimensionMismatch {
                    expected: self.dimension,
                    got: e.len(),
                });
            }
        }

        self.substrate.transaction(|s| {
            let existing = self.fetch_row(s, id)?.ok_or_else(|| {
                StorageError::NotFound(id.as_str().to_string())
            })?;

            let embedding = new_embedding.clone().unwrap_or(existing.embedding.clone());
            let metadata = new_metadata.clone().unwrap_or(existing.metadata.clone());
            let timestamp_us = synapse_core::record::now_micros();

            let embedding_bytes = encode_embedding(&embedding);
            let metadata_bytes = encode_metadata(&metadata)?;

            s.with_connection(|conn| {
                conn.execute(
                    "UPDATE vectors SET embedding_bytes = ?1, metadata_bytes = ?2, \
                     timestamp_us = ?3 WHERE id = ?4",
                    rusqlite::params![
                        embedding_bytes,
                        metadata_bytes,
                        timestamp_us as i64,
                        id.as_str(),
                    ],
                )
            })?;

            let (change_id, vv) = self.next_version_vector();
            self.append_changelog(
                change_id,
                id,
                ChangeOp::Update,
                Some(&embedding),
                &metadata,
                &self.local_node,
                timestamp_us,
                &vv,
            )?;
            Ok(())
        })?;

        trace!(shard = %self.shard_id, id = %id, "updated vector");
        Ok(())
    }

    /// Remove `id`. Returns `true` if a record was present (and a
    /// changelog tombstone was emitted); `false` if it was already
    /// absent, in which case nothing is recorded.
    pub fn delete(&self, id: &VectorId) -> StorageResult<bool> {
        let _guard = self.lock.write();

        self.substrate.transaction(|s| {
            let existed = self.fetch_row(s, id)?.is_some();
            if !existed {
                return Ok(false);
            }

            s.with_connection(|conn| {
                conn.execute("DELETE FROM vectors WHERE id = ?1", [id.as_str()])
            })?;

            let (change_id, vv) = self.next_version_vector();
            let timestamp_us = synapse_core::record::now_micros();
            self.append_changelog(
                change_id,
                id,
                ChangeOp::Delete,
                None,
                &None,
                &self.local_node,
                timestamp_us,
                &vv,
            )?;
            Ok(true)
        })
    }

    fn fetch_row(
        &self,
        substrate: &SqlSubstrate,
        id: &VectorId,
    ) -> StorageResult<Option<VectorRecord>> {
        let row = substrate.with_connection(|conn| {
            conn.query_row(
                "SELECT embedding_bytes, metadata_bytes, timestamp_us FROM vectors WHERE id = ?1",
                [id.as_str()],
                |row| {
                    Ok((
                        row.get::<_, Vec<u8>>(0)?,
                        row.get::<_, Option<Vec<u8>>>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()
        })?;

        row.map(|(embedding_bytes, metadata_bytes, timestamp_us)| {
            Ok(VectorRecord {
                id: id.clone(),
                embedding: decode_embedding(&embedding_bytes, self.dimension)?,
                metadata: decode_metadata(metadata_bytes.as_deref())?,
                timestamp_us: timestamp_us as u64,
            })
        })
        .transpose()
    }

    /// Fetch `id`, or `None` if it does not exist.
    pub fn get(&self, id: &VectorId) -> StorageResult<Option<VectorRecord>> {
        let _guard = self.lock.read();
        self.fetch_row(&self.substrate, id)
    }

    /// A restartable cursor over every record in insertion order. Each
    /// call to `scan` starts a fresh cursor from the beginning; the
    /// cursor itself only buffers one batch at a time, so scanning a
    /// shard larger than memory is safe.
    pub fn scan(&self) -> ScanCursor<'_> {
        ScanCursor {
            storage: self,
            next_seq: 0,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    /// Aggregate counters for this shard.
    pub fn stats(&self) -> StorageResult<ShardStats> {
        let _guard = self.lock.read();

        let (count, bytes): (i64, i64) = self.substrate.with_connection(|conn| {
            conn.query_row(
                "SELECT COUNT(*), COALESCE(SUM(LENGTH(embedding_bytes) + \
                 COALESCE(LENGTH(metadata_bytes), 0)), 0) FROM vectors WHERE shard_id = ?1",
                [self.shard_id.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
        })?;

        let index_ready: bool = self
            .substrate
            .with_connection(|conn| {
                conn.query_row(
                    "SELECT value FROM hnsw_metadata WHERE shard_id = ?1 AND key = 'built'",
                    [self.shard_id.as_str()],
                    |row| row.get::<_, String>(0),
                )
                .optional()
            })?
            .map(|v| v == "true")
            .unwrap_or(false);

        let quantizer_ready: bool = self
            .substrate
            .with_connection(|conn| {
                conn.query_row(
                    "SELECT 1 FROM quantizer_state WHERE shard_id = ?1 LIMIT 1",
                    [self.shard_id.as_str()],
                    |_| Ok(()),
                )
                .optional()
            })?
            .is_some();

        Ok(ShardStats {
            count: count as u64,
            bytes: bytes as u64,
            dimension: self.dimension,
            index_ready,
            quantizer_ready,
        })
    }

    /// Changelog entries for this shard with `change_id > from_change_id_exclusive`,
    /// ordered by `change_id`. Used by the sync engine to build deltas.
    pub fn read_changes(&self, from_change_id_exclusive: u64) -> StorageResult<Vec<ChangelogEntry>> {
        let _guard = self.lock.read();
        self.substrate.prepared_statement(
            "SELECT change_id, vector_id, op, embedding_bytes, metadata_bytes, source_node, \
             timestamp_us, version_vector_bytes FROM changelog \
             WHERE shard_id = ?1 AND change_id > ?2 ORDER BY change_id",
            |stmt| {
                let rows = stmt.query_map(
                    rusqlite::params![self.shard_id.as_str(), from_change_id_exclusive as i64],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, Option<Vec<u8>>>(3)?,
                            row.get::<_, Option<Vec<u8>>>(4)?,
                            row.get::<_, String>(5)?,
                            row.get::<_, i64>(6)?,
                            row.get::<_, Vec<u8>>(7)?,
                        ))
                    },
                )?;
                rows.collect::<Result<Vec<_>, _>>()
            },
        )?
        .into_iter()
        .map(
            |(change_id, vector_id, op, embedding_bytes, metadata_bytes, source_node, ts, vv_bytes)| {
                let op = match op.as_str() {
                    "insert" => ChangeOp::Insert,
                    "update" => ChangeOp::Update,
                    "delete" => ChangeOp::Delete,
                    other => {
                        return Err(StorageError::CorruptRecord(format!(
                            "unknown changelog op {other}"
                        )))
                    }
                };
                Ok(ChangelogEntry {
                    change_id: change_id as u64,
                    shard_id: self.shard_id.clone(),
                    vector_id: VectorId::from(vector_id),
                    op,
                    embedding: embedding_bytes
                        .map(|b| decode_embedding(&b, self.dimension))
                        .transpose()?,
                    metadata: decode_metadata(metadata_bytes.as_deref())?,
                    source_node,
                    timestamp_us: ts as u64,
                    version_vector: decode_version_vector(&vv_bytes)?,
                })
            },
        )
        .collect()
    }
}

use rusqlite::OptionalExtension;

/// A restartable, batch-buffered iterator over a shard's records in
/// insertion order, produced by [`ShardStorage::scan`].
pub struct ScanCursor<'a> {
    storage: &'a ShardStorage,
    next_seq: i64,
    buffer: VecDeque<VectorRecord>,
    exhausted: bool,
}

const SCAN_BATCH_SIZE: i64 = 256;

impl<'a> ScanCursor<'a> {
    fn refill(&mut self) -> StorageResult<()> {
        let shard_id = self.storage.shard_id.clone();
        let dimension = self.storage.dimension;
        let rows = self.storage.substrate.prepared_statement(
            "SELECT id, embedding_bytes, metadata_bytes, timestamp_us, seq FROM vectors \
             WHERE shard_id = ?1 AND seq >= ?2 ORDER BY seq LIMIT ?3",
            |stmt| {
                let mapped = stmt.query_map(
                    rusqlite::params![shard_id.as_str(), self.next_seq, SCAN_BATCH_SIZE],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, Vec<u8>>(1)?,
                            row.get::<_, Option<Vec<u8>>>(2)?,
                            row.get::<_, i64>(3)?,
                            row.get::<_, i64>(4)?,
                        ))
                    },
                )?;
                mapped.collect::<Result<Vec<_>, _>>()
            },
        )?;

        if rows.is_empty() {
            self.exhausted = true;
            return Ok(());
        }

        let mut max_seq = self.next_seq;
        for (id, embedding_bytes, metadata_bytes, timestamp_us, seq) in rows {
            max_seq = max_seq.max(seq + 1);
            self.buffer.push_back(VectorRecord {
                id: VectorId::from(id),
                embedding: decode_embedding(&embedding_bytes, dimension)?,
                metadata: decode_metadata(metadata_bytes.as_deref())?,
                timestamp_us: timestamp_us as u64,
            });
        }
        self.next_seq = max_seq;
        Ok(())
    }
}

impl<'a> Iterator for ScanCursor<'a> {
    type Item = StorageResult<VectorRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(e) = self.refill() {
                return Some(Err(e));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use synapse_core::record::now_micros;

    fn new_storage(dimension: usize) -> ShardStorage {
        let substrate = Arc::new(SqlSubstrate::open(None).unwrap());
        ShardStorage::open(substrate, ShardId::new("s1"), dimension, "node-a").unwrap()
    }

    fn record(embedding: Vec<f32>) -> VectorRecord {
        VectorRecord {
            id: VectorId::from(""),
            embedding,
            metadata: None,
            timestamp_us: now_micros(),
        }
    }

    #[test]
    fn insert_generates_id_and_is_retrievable() {
        let storage = new_storage(3);
        let id = storage.insert(record(vec![1.0, 2.0, 3.0])).unwrap();
        let fetched = storage.get(&id).unwrap().unwrap();
        assert_eq!(fetched.embedding, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn insert_duplicate_id_fails() {
        let storage = new_storage(2);
        let mut r = record(vec![1.0, 1.0]);
        r.id = VectorId::from("dup");
        storage.insert(r.clone()).unwrap();
        assert!(matches!(
            storage.insert(r),
            Err(StorageError::DuplicateId(_))
        ));
    }

    #[test]
    fn update_missing_id_fails() {
        let storage = new_storage(2);
        assert!(matches!(
            storage.update(&VectorId::from("ghost"), Some(vec![0.0, 0.0]), None),
            Err(StorageError::NotFound(_))
        ));
    }

    #[test]
    fn delete_is_idempotent_and_reports_presence() {
        let storage = new_storage(2);
        let id = storage.insert(record(vec![0.0, 0.0])).unwrap();
        assert!(storage.delete(&id).unwrap());
        assert!(!storage.delete(&id).unwrap());
    }

    #[test]
    fn insert_batch_is_atomic_on_duplicate() {
        let storage = new_storage(2);
        let mut first = record(vec![1.0, 1.0]);
        first.id = VectorId::from("a");
        storage.insert(first.clone()).unwrap();

        let mut second = record(vec![2.0, 2.0]);
        second.id = VectorId::from("b");
        let result = storage.insert_batch(vec![second, first]);
        assert!(result.is_err());
        assert!(storage.get(&VectorId::from("b")).unwrap().is_none());
    }

    #[test]
    fn insert_batch_commits_every_record() {
        let storage = new_storage(2);
        let records = vec![
            record(vec![1.0, 1.0]),
            record(vec![2.0, 2.0]),
            record(vec![3.0, 3.0]),
        ];
        let ids = storage.insert_batch(records).unwrap();
        assert_eq!(ids.len(), 3);
        for id in &ids {
            assert!(storage.get(id).unwrap().is_some());
        }
    }

    #[test]
    fn scan_visits_every_record_in_insertion_order() {
        let storage = new_storage(1);
        let mut ids = Vec::new();
        for i in 0..5 {
            ids.push(storage.insert(record(vec![i as f32])).unwrap());
        }

        let scanned: Vec<VectorId> = storage.scan().map(|r| r.unwrap().id).collect();
        assert_eq!(scanned, ids);
    }

    #[test]
    fn changelog_records_one_entry_per_mutation() {
        let storage = new_storage(1);
        let id = storage.insert(record(vec![1.0])).unwrap();
        storage
            .update(&id, Some(vec![2.0]), None)
            .unwrap();
        storage.delete(&id).unwrap();

        let changes = storage.read_changes(0).unwrap();
        assert_eq!(changes.len(), 3);
        assert!(changes[2].is_delete());
    }

    #[test]
    fn apply_remote_change_inserts_with_preserved_attribution() {
        let storage = new_storage(2);
        let entry = ChangelogEntry {
            change_id: 999,
            shard_id: ShardId::new("s1"),
            vector_id: VectorId::from("remote-1"),
            op: ChangeOp::Insert,
            embedding: Some(vec![1.0, 2.0]),
            metadata: None,
            source_node: "node-b".to_string(),
            timestamp_us: 42,
            version_vector: VersionVector::single("node-b", 3),
        };
        storage.apply_remote_change(&entry).unwrap();

        let fetched = storage.get(&VectorId::from("remote-1")).unwrap().unwrap();
        assert_eq!(fetched.embedding, vec![1.0, 2.0]);
        assert_eq!(fetched.timestamp_us, 42);

        let changes = storage.read_changes(0).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].source_node, "node-b");
        assert_eq!(storage.version_vector().get("node-b"), 3);
    }

    #[test]
    fn apply_remote_change_delete_removes_row() {
        let storage = new_storage(1);
        let id = storage.insert(record(vec![1.0])).unwrap();
        let entry = ChangelogEntry {
            change_id: 1000,
            shard_id: ShardId::new("s1"),
            vector_id: id.clone(),
            op: ChangeOp::Delete,
            embedding: None,
            metadata: None,
            source_node: "node-b".to_string(),
            timestamp_us: 99,
            version_vector: VersionVector::single("node-b", 1),
        };
        storage.apply_remote_change(&entry).unwrap();
        assert!(storage.get(&id).unwrap().is_none());
    }

    #[test]
    fn latest_change_id_tracks_appended_changes() {
        let storage = new_storage(1);
        assert_eq!(storage.latest_change_id(), 0);
        storage.insert(record(vec![1.0])).unwrap();
        assert_eq!(storage.latest_change_id(), 1);
        storage.insert(record(vec![2.0])).unwrap();
        assert_eq!(storage.latest_change_id(), 2);
    }

    #[test]
    fn stats_reflects_live_count() {
        let storage = new_storage(2);
        storage.insert(record(vec![1.0, 1.0])).unwrap();
        let id = storage.insert(record(vec![2.0, 2.0])).unwrap();
        storage.delete(&id).unwrap();

        let stats = storage.stats().unwrap();
        assert_eq!(stats.count, 1);
        assert!(!stats.index_ready);
        assert!(!stats.quantizer_ready);
    }
}
