use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::Arc,
    time::Duration,
};

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::{sync::Mutex, time::Instant};

use crate::{
    error::StorageError,
    storage::{CompletedPart, DynBackend, MultipartUpload, UploadedPart},
};

/// Lifecycle of a multipart session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, no parts yet.
    Initiated,
    /// At least one part recorded.
    Accumulating,
    /// Finalized by the backend.
    Completed,
    /// Discarded.
    Aborted,
}

impl SessionState {
    /// Returns `true` for `Completed` and `Aborted`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    /// Backend upload handle.
    pub upload: MultipartUpload,
    /// Current state.
    pub state: SessionState,
    /// Recorded parts ordered by part number.
    pub parts: Vec<UploadedPart>,
    /// Sum of recorded part sizes.
    pub total_size: u64,
}

#[derive(Debug)]
struct MultipartSession {
    upload: MultipartUpload,
    state: SessionState,
    parts: BTreeMap<u32, UploadedPart>,
    started: Instant,
}

impl MultipartSession {
    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            upload: self.upload.clone(),
            state: self.state,
            parts: self.parts.values().cloned().collect(),
            total_size: self.parts.values().map(|part| part.size).sum(),
        }
    }

    /// Checks `manifest` against the recorded parts and returns the assembled size.
    fn verify(&self, manifest: &[CompletedPart]) -> Result<u64, StorageError> {
        let upload_id = self.upload.upload_id.as_str();
        if manifest.is_empty() {
            return Err(StorageError::conflict(upload_id, "manifest lists no parts"));
        }

        let mut seen = Vec::with_capacity(manifest.len());
        let mut size = 0u64;
        for entry in manifest {
            if seen.contains(&entry.part_number) {
                return Err(StorageError::conflict(
                    upload_id,
                    format!("part {} listed more than once", entry.part_number),
                ));
            }
            seen.push(entry.part_number);

            let recorded = self.parts.get(&entry.part_number).ok_or_else(|| {
                StorageError::conflict(
                    upload_id,
                    format!("part {} was never uploaded", entry.part_number),
                )
            })?;
            if recorded.etag != entry.etag {
                return Err(StorageError::conflict(
                    upload_id,
                    format!(
                        "part {} tag `{}` does not match recorded `{}`",
                        entry.part_number, entry.etag, recorded.etag
                    ),
                ));
            }
            size += recorded.size;
        }
        Ok(size)
    }
}

type SharedSession = Arc<Mutex<MultipartSession>>;

/// Tracks multipart uploads across independent requests.
///
/// Parts of one session are serialized; separate sessions proceed in
/// parallel. A session ends exactly once, by `complete` or `abort`.
pub struct MultipartCoordinator {
    backend: DynBackend,
    sessions: RwLock<HashMap<String, SharedSession>>,
}

impl fmt::Debug for MultipartCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultipartCoordinator")
            .field("backend", &self.backend.provider_info().name)
            .field("sessions", &self.sessions.read().len())
            .finish()
    }
}

impl MultipartCoordinator {
    /// Creates a coordinator for `backend`.
    pub fn new(backend: DynBackend) -> Self {
        Self {
            backend,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Starts an upload targeting `key`.
    pub async fn initiate(&self, key: &str) -> Result<MultipartUpload, StorageError> {
        let upload = self.backend.initiate_multipart(key).await?;

        #[cfg(feature = "tracing")]
        tracing::debug!(
            upload_id = upload.upload_id.as_str(),
            key,
            provider = upload.provider.as_str(),
            "multipart: session initiated"
        );

        let session = MultipartSession {
            upload: upload.clone(),
            state: SessionState::Initiated,
            parts: BTreeMap::new(),
            started: Instant::now(),
        };
        self.sessions
            .write()
            .insert(upload.upload_id.clone(), Arc::new(Mutex::new(session)));
        Ok(upload)
    }

    /// Stores part `part_number` (from 1). Uploading the same number again
    /// replaces the earlier part.
    pub async fn upload_part(
        &self,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<UploadedPart, StorageError> {
        let shared = self.lookup(upload_id)?;
        let mut session = shared.lock().await;
        ensure_open(&session)?;

        if part_number == 0 {
            return Err(StorageError::InvalidPartNumber {
                upload_id: upload_id.to_owned(),
                part_number,
            });
        }

        let part = self
            .backend
            .upload_part(upload_id, &session.upload.key, part_number, data)
            .await?;

        #[cfg(feature = "tracing")]
        tracing::debug!(
            upload_id,
            part_number,
            size = part.size,
            replaced = session.parts.contains_key(&part_number),
            "multipart: part recorded"
        );

        session.parts.insert(part_number, part.clone());
        session.state = SessionState::Accumulating;
        Ok(part)
    }

    /// Finalizes the upload from `manifest` and returns the object size.
    ///
    /// A manifest that names unknown parts, repeats a part or carries a stale
    /// tag fails with [`StorageError::Conflict`] and leaves the session open.
    pub async fn complete(
        &self,
        upload_id: &str,
        manifest: &[CompletedPart],
    ) -> Result<u64, StorageError> {
        let shared = self.lookup(upload_id)?;
        let mut session = shared.lock().await;
        ensure_open(&session)?;

        let size = session.verify(manifest)?;
        self.backend
            .complete_multipart(upload_id, &session.upload.key, manifest)
            .await?;

        session.state = SessionState::Completed;
        self.sessions.write().remove(upload_id);

        #[cfg(feature = "tracing")]
        tracing::debug!(
            upload_id,
            key = session.upload.key.as_str(),
            parts = manifest.len(),
            size,
            "multipart: session completed"
        );

        Ok(size)
    }

    /// Discards the upload and its parts.
    pub async fn abort(&self, upload_id: &str) -> Result<(), StorageError> {
        let shared = self.lookup(upload_id)?;
        let mut session = shared.lock().await;
        ensure_open(&session)?;

        match self
            .backend
            .abort_multipart(upload_id, &session.upload.key)
            .await
        {
            Ok(()) | Err(StorageError::UploadNotFound { .. }) => {}
            Err(err) => return Err(err),
        }

        session.state = SessionState::Aborted;
        self.sessions.write().remove(upload_id);

        #[cfg(feature = "tracing")]
        tracing::debug!(upload_id, "multipart: session aborted");

        Ok(())
    }

    /// Returns a snapshot of an open session.
    pub async fn session(&self, upload_id: &str) -> Result<SessionSnapshot, StorageError> {
        let shared = self.lookup(upload_id)?;
        let session = shared.lock().await;
        ensure_open(&session)?;
        Ok(session.snapshot())
    }

    /// Number of open sessions.
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    /// Returns `true` when no session is open.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Aborts every session older than `max_age` and returns their ids.
    ///
    /// Sessions are never expired implicitly; callers schedule this.
    pub async fn abort_stale(&self, max_age: Duration) -> Vec<String> {
        let candidates: Vec<(String, SharedSession)> = self
            .sessions
            .read()
            .iter()
            .map(|(id, session)| (id.clone(), Arc::clone(session)))
            .collect();

        let mut aborted = Vec::new();
        for (upload_id, shared) in candidates {
            let stale = {
                let session = shared.lock().await;
                !session.state.is_terminal() && session.started.elapsed() >= max_age
            };
            if !stale {
                continue;
            }

            match self.abort(&upload_id).await {
                Ok(()) => aborted.push(upload_id),
                Err(_err) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(
                        upload_id = upload_id.as_str(),
                        error = %_err,
                        "multipart: failed to abort stale session"
                    );
                }
            }
        }
        aborted
    }

    fn lookup(&self, upload_id: &str) -> Result<SharedSession, StorageError> {
        self.sessions
            .read()
            .get(upload_id)
            .cloned()
            .ok_or_else(|| StorageError::UploadNotFound {
                upload_id: upload_id.to_owned(),
            })
    }
}

fn ensure_open(session: &MultipartSession) -> Result<(), StorageError> {
    if session.state.is_terminal() {
        return Err(StorageError::UploadNotFound {
            upload_id: session.upload.upload_id.clone(),
        });
    }
    Ok(())
}
