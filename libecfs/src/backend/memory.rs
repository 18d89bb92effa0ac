//! In-process storage backend.
//!
//! [`MemoryBackend`] keeps volumes and snapshots in concurrent maps and
//! honours the same ensure-exists / ensure-absent contract as the REST
//! backend.  It counts the resources it actually creates so tests can assert
//! that retried calls converge instead of duplicating work.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::debug;

use super::{
    BackendError, BackendSnapshot, BackendVolume, Connector, DataContainer, Export, SnapshotPage,
    SnapshotQuery, StorageBackend, VolumeSpec, export_path,
};

/// Backend state held entirely in memory.
#[derive(Default)]
pub struct MemoryBackend {
    volumes: DashMap<String, (DataContainer, BackendVolume)>,
    snapshots: DashMap<String, BackendSnapshot>,
    next_id: AtomicU64,
    volumes_created: AtomicUsize,
    snapshots_created: AtomicUsize,
    calls: AtomicUsize,
    offline: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of volumes actually created (not counting idempotent hits).
    pub fn volumes_created(&self) -> usize {
        self.volumes_created.load(Ordering::SeqCst)
    }

    /// Number of snapshots actually created.
    pub fn snapshots_created(&self) -> usize {
        self.snapshots_created.load(Ordering::SeqCst)
    }

    /// Number of backend operations invoked so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn has_volume(&self, name: &str) -> bool {
        self.volumes.contains_key(name)
    }

    /// Simulate an unreachable management endpoint.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Seed a snapshot record verbatim, bypassing validation.
    pub fn insert_snapshot(&self, snapshot: BackendSnapshot) {
        self.snapshots.insert(snapshot.name.clone(), snapshot);
    }

    fn enter(&self) -> Result<(), BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("memory backend is offline".into()));
        }
        Ok(())
    }

    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn ensure_volume(&self, spec: &VolumeSpec) -> Result<BackendVolume, BackendError> {
        self.enter()?;
        match self.volumes.entry(spec.name.clone()) {
            Entry::Occupied(existing) => {
                debug!(name = %spec.name, "volume already exists");
                Ok(existing.get().1.clone())
            }
            Entry::Vacant(slot) => {
                let container = DataContainer {
                    id: self.allocate_id(),
                    name: spec.name.clone(),
                    hard_quota_bytes: spec.capacity_bytes,
                };
                let volume = BackendVolume {
                    name: spec.name.clone(),
                    capacity_bytes: spec.capacity_bytes,
                    export_path: export_path(&spec.name),
                };
                slot.insert((container, volume.clone()));
                self.volumes_created.fetch_add(1, Ordering::SeqCst);
                Ok(volume)
            }
        }
    }

    async fn ensure_volume_absent(&self, name: &str) -> Result<(), BackendError> {
        self.enter()?;
        if self.volumes.remove(name).is_none() {
            debug!(%name, "volume already absent");
        }
        Ok(())
    }

    async fn create_snapshot(
        &self,
        name: &str,
        source_volume: &str,
        _parameters: &HashMap<String, String>,
    ) -> Result<BackendSnapshot, BackendError> {
        self.enter()?;
        if !self.volumes.contains_key(source_volume) {
            return Err(BackendError::NotFound {
                kind: "volume",
                name: source_volume.to_owned(),
            });
        }
        match self.snapshots.entry(name.to_owned()) {
            Entry::Occupied(existing) if existing.get().source_volume == source_volume => {
                Ok(existing.get().clone())
            }
            Entry::Occupied(_) => Err(BackendError::Api {
                operation: "create snapshot".into(),
                status: 409,
                message: format!("snapshot {name} exists for another volume"),
            }),
            Entry::Vacant(slot) => {
                let snapshot = BackendSnapshot {
                    id: self.allocate_id().to_string(),
                    name: name.to_owned(),
                    source_volume: source_volume.to_owned(),
                    created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
                    status: "READY".to_owned(),
                    size_bytes: 0,
                };
                slot.insert(snapshot.clone());
                self.snapshots_created.fetch_add(1, Ordering::SeqCst);
                Ok(snapshot)
            }
        }
    }

    async fn ensure_snapshot_absent(&self, id: &str) -> Result<(), BackendError> {
        self.enter()?;
        self.snapshots.remove(id);
        Ok(())
    }

    async fn list_snapshots(&self, query: &SnapshotQuery) -> Result<SnapshotPage, BackendError> {
        self.enter()?;
        let offset = match &query.starting_token {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| BackendError::InvalidToken(token.clone()))?,
            None => 0,
        };

        let mut matching: Vec<BackendSnapshot> = self
            .snapshots
            .iter()
            .map(|entry| entry.value().clone())
            .filter(|s| query.snapshot_id.as_ref().is_none_or(|id| &s.name == id))
            .filter(|s| {
                query
                    .source_volume
                    .as_ref()
                    .is_none_or(|vol| &s.source_volume == vol)
            })
            .collect();
        matching.sort_by(|a, b| a.name.cmp(&b.name));

        if offset > matching.len() {
            return Err(BackendError::InvalidToken(offset.to_string()));
        }
        let limit = match query.max_entries {
            0 => matching.len() - offset,
            n => n as usize,
        };
        let end = (offset + limit).min(matching.len());
        let next_token = (end < matching.len()).then(|| end.to_string());
        Ok(SnapshotPage {
            snapshots: matching.drain(offset..end).collect(),
            next_token,
        })
    }

    async fn find_data_container(
        &self,
        name: &str,
    ) -> Result<Option<DataContainer>, BackendError> {
        self.enter()?;
        Ok(self.volumes.get(name).map(|entry| entry.0.clone()))
    }

    async fn find_export(
        &self,
        container: &DataContainer,
        name: &str,
    ) -> Result<Option<Export>, BackendError> {
        self.enter()?;
        Ok(self
            .volumes
            .get(name)
            .filter(|entry| entry.0.id == container.id)
            .map(|entry| Export {
                id: entry.0.id,
                name: name.to_owned(),
                data_container_id: entry.0.id,
            }))
    }
}

#[async_trait]
impl Connector for Arc<MemoryBackend> {
    type Backend = MemoryBackend;

    async fn connect(&self) -> Result<Arc<MemoryBackend>, BackendError> {
        Ok(Arc::clone(self))
    }
}
