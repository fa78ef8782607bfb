use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock, mpsc, oneshot};

use crate::wal::{Wal, WalOp, WalRecord};

use super::{
    Collection, Doc, DocKey, DocumentStore, Expect, Mutator, Predicate, StoreError, Version,
    Versioned, WriteOp,
};

struct Slot {
    version: Version,
    doc: Option<Doc>,
}

type SharedSlot = Arc<Mutex<Slot>>;

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        record: WalRecord,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        records: Vec<WalRecord>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit:
/// block for the first append, drain whatever else is already queued, then
/// fsync once and answer every sender with the batch result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { record, response } => {
                let mut batch = vec![(record, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { record, response }) => batch.push((record, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }
                flush_and_respond(&mut wal, batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: Vec<(WalRecord, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();

    let mut result = Ok(());
    for (record, _) in &batch {
        if let Err(e) = wal.append_buffered(record) {
            result = Err(e);
            break;
        }
    }
    // Flush even after a failed append so half-written bytes don't bleed into
    // the next batch; callers of this batch are told it failed.
    let flushed = wal.flush_sync();
    if result.is_ok() {
        result = flushed;
    }

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());

    for (_, tx) in batch {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { records, response } => {
            let result = Wal::write_compact_file(wal.path(), &records)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// In-process document store made durable by a write-ahead log.
///
/// Each key owns a slot behind its own mutex; multi-key commits lock their
/// slots in sorted key order. Every commit is one WAL record, so a commit is
/// either fully replayed or not at all.
pub struct LocalStore {
    slots: DashMap<DocKey, SharedSlot>,
    wal_tx: mpsc::Sender<WalCommand>,
    /// Commits hold it shared; compaction holds it exclusively so no commit
    /// lands between the snapshot and the file swap.
    commit_gate: RwLock<()>,
    transactional: bool,
}

impl LocalStore {
    /// Replay the log at `path` and start the group-commit writer.
    /// With `transactional == false` the store refuses `transaction`.
    pub fn open(path: PathBuf, transactional: bool) -> io::Result<Self> {
        let records = Wal::recover(&path)?;
        let wal = Wal::open(&path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = Self {
            slots: DashMap::new(),
            wal_tx,
            commit_gate: RwLock::new(()),
            transactional,
        };

        // Sole owner during replay: try_lock never contends.
        for record in &records {
            for op in &record.ops {
                let (key, version, doc) = match op {
                    WalOp::Put { key, version, body } => {
                        let doc = Doc::from_json(key.collection, body)
                            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                        (key, *version, Some(doc))
                    }
                    WalOp::Delete { key, version } => (key, *version, None),
                };
                let slot = store.slot(key);
                let mut guard = slot.try_lock().expect("replay: uncontended lock");
                guard.version = version;
                guard.doc = doc;
            }
        }

        Ok(store)
    }

    fn slot(&self, key: &DocKey) -> SharedSlot {
        if let Some(slot) = self.slots.get(key) {
            return slot.value().clone();
        }
        self.slots
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(Slot { version: 0, doc: None })))
            .value()
            .clone()
    }

    fn existing_slot(&self, key: &DocKey) -> Option<SharedSlot> {
        self.slots.get(key).map(|e| e.value().clone())
    }

    async fn wal_append(&self, record: WalRecord) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { record, response: tx })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()))
    }

    /// Lock, check, log, apply. Returns the new version of each op's key, in op order.
    async fn write_ops(&self, ops: Vec<WriteOp>) -> Result<Vec<Version>, StoreError> {
        let _gate = self.commit_gate.read().await;

        let mut keys: Vec<DocKey> = ops.iter().map(WriteOp::key).collect();
        keys.sort();
        keys.dedup();
        if keys.len() != ops.len() {
            return Err(StoreError::InvalidRequest("same key written twice in one commit".into()));
        }

        let mut guards: HashMap<DocKey, OwnedMutexGuard<Slot>> = HashMap::with_capacity(keys.len());
        for key in keys {
            let guard = self.slot(&key).lock_owned().await;
            guards.insert(key, guard);
        }

        let mut wal_ops = Vec::with_capacity(ops.len());
        for op in &ops {
            let key = op.key();
            let slot = &guards[&key];
            let holds = match op.expect() {
                Expect::Any => true,
                Expect::Absent => slot.doc.is_none(),
                Expect::Version(v) => slot.doc.is_some() && slot.version == v,
            };
            if !holds {
                return Err(StoreError::Conflict(key));
            }
            let version = slot.version + 1;
            match op {
                WriteOp::Put { doc, .. } => {
                    wal_ops.push(WalOp::Put { key, version, body: doc.to_json()? });
                }
                WriteOp::Delete { .. } => {
                    if slot.doc.is_none() {
                        return Err(StoreError::NotFound(key));
                    }
                    wal_ops.push(WalOp::Delete { key, version });
                }
            }
        }

        self.wal_append(WalRecord { ops: wal_ops }).await?;

        let mut versions = Vec::with_capacity(ops.len());
        for op in ops {
            let key = op.key();
            let Some(slot) = guards.get_mut(&key) else {
                continue;
            };
            slot.version += 1;
            slot.doc = match op {
                WriteOp::Put { doc, .. } => Some(doc),
                WriteOp::Delete { .. } => None,
            };
            versions.push(slot.version);
        }
        Ok(versions)
    }

    /// Rewrite the WAL as one record per key (tombstones included, so
    /// versions stay monotonic across restarts).
    pub async fn compact(&self) -> Result<(), StoreError> {
        let _gate = self.commit_gate.write().await;

        let slots: Vec<(DocKey, SharedSlot)> = self
            .slots
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let mut records = Vec::with_capacity(slots.len());
        for (key, slot) in slots {
            let guard = slot.lock().await;
            let op = match &guard.doc {
                Some(doc) => WalOp::Put { key, version: guard.version, body: doc.to_json()? },
                None if guard.version > 0 => WalOp::Delete { key, version: guard.version },
                None => continue,
            };
            records.push(WalRecord { ops: vec![op] });
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { records, response: tx })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()))
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

#[async_trait]
impl DocumentStore for LocalStore {
    async fn get(&self, key: &DocKey) -> Result<Option<Versioned<Doc>>, StoreError> {
        let Some(slot) = self.existing_slot(key) else {
            return Ok(None);
        };
        let guard = slot.lock().await;
        Ok(guard
            .doc
            .as_ref()
            .map(|doc| Versioned { doc: doc.clone(), version: guard.version }))
    }

    async fn put(&self, doc: Doc, expect: Expect) -> Result<Version, StoreError> {
        let key = doc.key();
        let versions = self.write_ops(vec![WriteOp::Put { doc, expect }]).await?;
        versions
            .first()
            .copied()
            .ok_or(StoreError::NotFound(key))
    }

    async fn delete(&self, key: &DocKey, expect: Expect) -> Result<(), StoreError> {
        self.write_ops(vec![WriteOp::Delete { key: key.clone(), expect }])
            .await
            .map(|_| ())
    }

    async fn conditional_update(
        &self,
        key: &DocKey,
        predicate: Predicate<'_>,
        mutator: Mutator<'_>,
    ) -> Result<Versioned<Doc>, StoreError> {
        let _gate = self.commit_gate.read().await;
        let slot = self
            .existing_slot(key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        let mut guard = slot.lock().await;

        let current = match &guard.doc {
            Some(doc) => Versioned { doc: doc.clone(), version: guard.version },
            None => return Err(StoreError::NotFound(key.clone())),
        };
        if !predicate(&current) {
            return Err(StoreError::PreconditionFailed(key.clone()));
        }

        let mut next = current.doc;
        mutator(&mut next);
        if next.key() != *key {
            return Err(StoreError::InvalidRequest("mutator changed the document id".into()));
        }

        let version = guard.version + 1;
        let body = next.to_json()?;
        self.wal_append(WalRecord { ops: vec![WalOp::Put { key: key.clone(), version, body }] })
            .await?;
        guard.version = version;
        guard.doc = Some(next.clone());
        Ok(Versioned { doc: next, version })
    }

    fn supports_transactions(&self) -> bool {
        self.transactional
    }

    async fn transaction(&self, ops: Vec<WriteOp>) -> Result<(), StoreError> {
        if !self.transactional {
            return Err(StoreError::TransactionsUnsupported);
        }
        if ops.is_empty() {
            return Ok(());
        }
        self.write_ops(ops).await.map(|_| ())
    }

    async fn scan(&self, collection: Collection) -> Result<Vec<Versioned<Doc>>, StoreError> {
        let mut slots: Vec<(DocKey, SharedSlot)> = self
            .slots
            .iter()
            .filter(|e| e.key().collection == collection)
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        slots.sort_by(|a, b| a.0.cmp(&b.0));

        let mut docs = Vec::with_capacity(slots.len());
        for (_, slot) in slots {
            let guard = slot.lock().await;
            if let Some(doc) = &guard.doc {
                docs.push(Versioned { doc: doc.clone(), version: guard.version });
            }
        }
        Ok(docs)
    }
}
