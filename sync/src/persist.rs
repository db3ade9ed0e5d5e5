//! Metadata store persisted as a JSON file.
//!
//! The whole [`SyncSnapshot`] is rewritten on every change: serialized to a
//! sibling temp file, flushed to disk, then renamed over the target, so the
//! file on disk is always a complete snapshot.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockReadGuard};
use tether_engine::{
    DocumentKey, DocumentMeta, Error, InstanceId, MetadataStore, Namespace, ResumeToken,
    SyncSnapshot, UndoRecord,
};

type Result<T> = tether_engine::error::Result<T>;

fn io_error(context: &str, path: &Path, err: std::io::Error) -> Error {
    Error::MetadataStore(format!("{context} {}: {err}", path.display()))
}

fn poisoned<T>(_: PoisonError<T>) -> Error {
    Error::MetadataStore("lock poisoned".into())
}

#[derive(Debug)]
pub struct JsonFileMetadataStore {
    path: PathBuf,
    state: RwLock<SyncSnapshot>,
}

impl JsonFileMetadataStore {
    /// Open the store at `path`, creating an empty one if the file does not exist.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let snapshot = match fs::read_to_string(&path) {
            Ok(json) => SyncSnapshot::from_json(&json)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => SyncSnapshot::new(),
            Err(err) => return Err(io_error("failed to read", &path, err)),
        };

        tracing::debug!(
            path = %path.display(),
            documents = snapshot.document_count(),
            "Opened metadata file"
        );
        Ok(Self {
            path,
            state: RwLock::new(snapshot),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> Result<SyncSnapshot> {
        Ok(self.read()?.clone())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, SyncSnapshot>> {
        self.state.read().map_err(poisoned)
    }

    /// Apply `f` and persist the result. Memory is only updated once the
    /// file is written.
    fn update(&self, f: impl FnOnce(&mut SyncSnapshot)) -> Result<()> {
        let mut state = self.state.write().map_err(poisoned)?;
        let mut next = state.clone();
        f(&mut next);
        self.write_file(&next)?;
        *state = next;
        Ok(())
    }

    fn write_file(&self, snapshot: &SyncSnapshot) -> Result<()> {
        let json = snapshot.to_json_pretty()?;
        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp = PathBuf::from(tmp_name);

        let mut file = File::create(&tmp).map_err(|e| io_error("failed to create", &tmp, e))?;
        file.write_all(json.as_bytes())
            .and_then(|()| file.sync_all())
            .map_err(|e| io_error("failed to write", &tmp, e))?;
        fs::rename(&tmp, &self.path).map_err(|e| io_error("failed to replace", &self.path, e))
    }
}

impl MetadataStore for JsonFileMetadataStore {
    fn instance_id(&self) -> Result<Option<InstanceId>> {
        Ok(self.read()?.instance_id.clone())
    }

    fn set_instance_id(&self, instance_id: &str) -> Result<()> {
        self.update(|s| s.instance_id = Some(instance_id.to_string()))
    }

    fn load_metas(&self) -> Result<Vec<DocumentMeta>> {
        Ok(self.read()?.metas().cloned().collect())
    }

    fn put_meta(&self, meta: &DocumentMeta) -> Result<()> {
        self.update(|s| s.put_meta(meta.clone()))
    }

    fn remove_meta(&self, key: &DocumentKey) -> Result<()> {
        self.update(|s| s.remove_meta(key))
    }

    fn undo_records(&self) -> Result<Vec<UndoRecord>> {
        Ok(self.read()?.undo_records().cloned().collect())
    }

    fn put_undo(&self, record: &UndoRecord) -> Result<()> {
        self.update(|s| s.put_undo(record.clone()))
    }

    fn remove_undo(&self, key: &DocumentKey) -> Result<()> {
        self.update(|s| s.remove_undo(key))
    }

    fn resume_token(&self, namespace: &Namespace) -> Result<Option<ResumeToken>> {
        Ok(self.read()?.resume_token(namespace).cloned())
    }

    fn set_resume_token(&self, namespace: &Namespace, token: &str) -> Result<()> {
        self.update(|s| s.set_resume_token(namespace, token.to_string()))
    }
}
