//! The controller document: installed snaps, their opaque state and the crash log.
//!
//! Mutations that must be reversible (installs, updates) go through [`SnapStore::update_snap`],
//! which diffs the snap's scoped document `{snap, state}` before and after the change and returns
//! the inverse patch. Rollback replays those patches newest first.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use json_patch::Patch;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use snaps_core::{Snap, SnapId, SnapStatus};
use tracing::{debug, info, warn};

use crate::error::SnapError;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("snap `{0}` is not in the store")]
    Missing(SnapId),
    #[error("patch failed: {0}")]
    Patch(String),
    #[error("decode failed: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<StoreError> for SnapError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Missing(id) => SnapError::NotFound(id),
            other => SnapError::Store(other.to_string()),
        }
    }
}

/// One entry in the crash log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapErrorEntry {
    pub internal_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snap_id: Option<SnapId>,
    pub message: String,
    pub code: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerState {
    #[serde(default)]
    pub snaps: BTreeMap<SnapId, Snap>,
    #[serde(default)]
    pub snap_states: BTreeMap<SnapId, Value>,
    #[serde(default)]
    pub snap_errors: BTreeMap<String, SnapErrorEntry>,
}

impl ControllerState {
    /// Records restored from disk have no live session behind them.
    fn settle_after_restart(&mut self) {
        let installing: Vec<SnapId> = self
            .snaps
            .values()
            .filter(|snap| snap.status == SnapStatus::Installing)
            .map(|snap| snap.id.clone())
            .collect();
        for id in installing {
            warn!(target: "snaps::store", snap = %id, "dropping half-installed snap");
            self.snaps.remove(&id);
            self.snap_states.remove(&id);
        }
        for snap in self.snaps.values_mut() {
            if matches!(snap.status, SnapStatus::Running | SnapStatus::Updating) {
                snap.status = SnapStatus::Stopped;
            }
        }
    }

    fn scoped(&self, id: &SnapId) -> Result<Value, StoreError> {
        let snap = self
            .snaps
            .get(id)
            .ok_or_else(|| StoreError::Missing(id.clone()))?;
        Ok(json!({
            "snap": serde_json::to_value(snap)?,
            "state": self.snap_states.get(id).cloned().unwrap_or(Value::Null),
        }))
    }

    fn write_scoped(&mut self, id: &SnapId, doc: Value) -> Result<(), StoreError> {
        let mut doc = doc;
        let mut field = |name: &str| doc.get_mut(name).map(Value::take).unwrap_or(Value::Null);
        let snap: Snap = serde_json::from_value(field("snap"))?;
        match field("state") {
            Value::Null => {
                self.snap_states.remove(id);
            }
            state => {
                self.snap_states.insert(id.clone(), state);
            }
        }
        self.snaps.insert(id.clone(), snap);
        Ok(())
    }
}

pub struct SnapStore {
    state: Mutex<ControllerState>,
    path: Option<PathBuf>,
    write_lock: tokio::sync::Mutex<()>,
}

impl SnapStore {
    pub fn in_memory() -> Self {
        Self::with_state(ControllerState::default(), None)
    }

    fn with_state(state: ControllerState, path: Option<PathBuf>) -> Self {
        Self {
            state: Mutex::new(state),
            path,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Open a file-backed store. A missing file starts empty.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let mut state = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<ControllerState>(&bytes)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => ControllerState::default(),
            Err(err) => return Err(err.into()),
        };
        state.settle_after_restart();
        info!(
            target: "snaps::store",
            path = %path.display(),
            snaps = state.snaps.len(),
            "controller state loaded"
        );
        Ok(Self::with_state(state, Some(path)))
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn read<R>(&self, f: impl FnOnce(&ControllerState) -> R) -> R {
        f(&self.state.lock())
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut ControllerState) -> R) -> R {
        f(&mut self.state.lock())
    }

    pub fn snapshot(&self) -> ControllerState {
        self.state.lock().clone()
    }

    /// Mutate one snap and its state, returning the patch that undoes the change.
    pub fn update_snap<F>(&self, id: &SnapId, f: F) -> Result<Patch, StoreError>
    where
        F: FnOnce(&mut Snap, &mut Option<Value>),
    {
        let mut state = self.state.lock();
        let before = state.scoped(id)?;
        let mut stored_state = state.snap_states.remove(id);
        if let Some(snap) = state.snaps.get_mut(id) {
            f(snap, &mut stored_state);
        }
        if let Some(value) = stored_state {
            state.snap_states.insert(id.clone(), value);
        }
        let after = state.scoped(id)?;
        Ok(json_patch::diff(&after, &before))
    }

    /// Replay inverse patches, newest first, onto the snap's scoped document.
    pub fn apply_inverse(&self, id: &SnapId, patches: &[Patch]) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let mut doc = state.scoped(id)?;
        for patch in patches.iter().rev() {
            json_patch::patch(&mut doc, &patch.0).map_err(|err| StoreError::Patch(err.to_string()))?;
        }
        state.write_scoped(id, doc)
    }

    /// Write the document to disk, if file-backed. Concurrent calls are serialized and each
    /// writes the state as of the moment it acquires the writer.
    pub async fn persist(&self) -> Result<(), StoreError> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };
        let _writer = self.write_lock.lock().await;
        let bytes = {
            let state = self.state.lock();
            serde_json::to_vec_pretty(&*state)?
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        if let Err(err) = tokio::fs::rename(&tmp, path).await {
            tokio::fs::remove_file(&tmp).await.ok();
            return Err(err.into());
        }
        debug!(target: "snaps::store", path = %path.display(), bytes = bytes.len(), "persisted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use semver::Version;
    use snaps_core::{ManifestSource, SnapManifest};

    fn snap(id: &str, status: SnapStatus) -> Snap {
        let manifest = SnapManifest {
            version: Version::new(1, 0, 0),
            proposed_name: "Example".into(),
            description: None,
            source: ManifestSource {
                shasum: String::new(),
                file_path: "dist/bundle.js".into(),
            },
            initial_permissions: Default::default(),
        };
        let mut snap = Snap::new(SnapId::parse(id).expect("id"), manifest, "v1".into(), "test");
        snap.status = status;
        snap
    }

    fn seeded(store: &SnapStore, snap: Snap) -> SnapId {
        let id = snap.id.clone();
        store.update(|state| {
            state.snaps.insert(id.clone(), snap);
        });
        id
    }

    #[test]
    fn inverse_patches_restore_snap_and_state() {
        let store = SnapStore::in_memory();
        let id = seeded(&store, snap("npm:example", SnapStatus::Stopped));
        store.update(|state| {
            state.snap_states.insert(id.clone(), json!({"count": 1}));
        });

        let first = store
            .update_snap(&id, |snap, state| {
                snap.status = SnapStatus::Updating;
                *state = Some(json!({"count": 2}));
            })
            .expect("first");
        let second = store
            .update_snap(&id, |snap, state| {
                snap.source_code = "v2".into();
                snap.version = Version::new(2, 0, 0);
                *state = None;
            })
            .expect("second");
        let patches = vec![first, second];

        store.apply_inverse(&id, &patches).expect("rollback");
        store.read(|state| {
            let restored = &state.snaps[&id];
            assert_eq!(restored.source_code, "v1");
            assert_eq!(restored.version, Version::new(1, 0, 0));
            assert_eq!(restored.status, SnapStatus::Stopped);
            assert_eq!(state.snap_states.get(&id), Some(&json!({"count": 1})));
        });
    }

    #[test]
    fn unknown_snaps_are_reported() {
        let store = SnapStore::in_memory();
        let id = SnapId::parse("npm:missing").expect("id");
        assert!(matches!(
            store.update_snap(&id, |_, _| {}),
            Err(StoreError::Missing(_))
        ));
        assert!(matches!(
            SnapError::from(StoreError::Missing(id)),
            SnapError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn persisted_state_settles_on_reload() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("snaps.json");

        let store = SnapStore::open(&path).await.expect("open empty");
        assert!(store.read(|state| state.snaps.is_empty()));
        seeded(&store, snap("npm:running", SnapStatus::Running));
        seeded(&store, snap("npm:half", SnapStatus::Installing));
        let crashed = seeded(&store, snap("npm:crashed", SnapStatus::Crashed));
        store.persist().await.expect("persist");
        assert!(!path.with_extension("tmp").exists());

        let reloaded = SnapStore::open(&path).await.expect("reload");
        reloaded.read(|state| {
            assert_eq!(state.snaps.len(), 2);
            let running = SnapId::parse("npm:running").expect("id");
            assert_eq!(state.snaps[&running].status, SnapStatus::Stopped);
            assert_eq!(state.snaps[&crashed].status, SnapStatus::Crashed);
        });
    }

    #[tokio::test]
    async fn in_memory_persist_is_a_no_op() {
        let store = SnapStore::in_memory();
        assert!(store.path().is_none());
        store.persist().await.expect("noop");
    }
}
