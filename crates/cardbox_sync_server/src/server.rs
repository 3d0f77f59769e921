//! The sync server: session resolution, payload decoding, and typed
//! dispatch of every operation onto the owning collection worker.
//!
//! The transport hands over a [`SyncRequest`] — the already-parsed form
//! fields plus the raw `data` part — and gets response bytes back.
//! Every operation that touches a collection runs as a queued job on
//! that collection's worker, so request handling itself can be as
//! concurrent as the transport likes.

use crate::collection_sync::CollectionSyncHandler;
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::executor::CollectionManager;
use crate::full_sync;
use crate::media_sync::MediaSyncHandler;
use crate::session::{SessionStore, SyncSession};
use crate::users::{valid_username, UserStore};
use cardbox_sync_protocol::{
    ApplyChangesRequest, ApplyChunkRequest, ApplyGravesRequest, HostKeyRequest, HostKeyResponse,
    MediaChangesRequest, MediaDownloadRequest, MediaOp, MediaSanityRequest, MetaRequest,
    Operation, SanityCheckRequest, StartRequest, SyncOp,
};
use flate2::read::GzDecoder;
use serde::de::DeserializeOwned;
use std::io::Read;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One decoded sync request, as handed over by the transport.
#[derive(Debug, Clone)]
pub struct SyncRequest {
    /// The resolved operation.
    pub operation: Operation,
    /// The `k` form field: long-lived host key.
    pub host_key: Option<String>,
    /// The `s`/`sk` form field: per-cycle session key.
    pub session_key: Option<String>,
    /// The `c` form field: whether `data` is gzip-compressed.
    pub compressed: bool,
    /// The `data` part: JSON for structured calls, raw bytes for
    /// uploads and downloads.
    pub data: Vec<u8>,
}

impl SyncRequest {
    /// A bare request for the given operation.
    pub fn new(operation: Operation) -> Self {
        Self {
            operation,
            host_key: None,
            session_key: None,
            compressed: false,
            data: Vec::new(),
        }
    }

    /// Attaches the host key.
    pub fn with_host_key(mut self, key: impl Into<String>) -> Self {
        self.host_key = Some(key.into());
        self
    }

    /// Attaches the session key.
    pub fn with_session_key(mut self, key: impl Into<String>) -> Self {
        self.session_key = Some(key.into());
        self
    }

    /// Attaches the payload.
    pub fn with_data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.data = data.into();
        self
    }
}

/// The sync server.
///
/// Owns the worker registry, the session registry and the user store;
/// every protocol operation enters through [`SyncServer::handle`].
pub struct SyncServer {
    config: ServerConfig,
    manager: Arc<CollectionManager>,
    sessions: SessionStore,
    users: Option<UserStore>,
}

impl SyncServer {
    /// Builds a server from its configuration.
    pub fn new(config: ServerConfig) -> ServerResult<Self> {
        std::fs::create_dir_all(&config.data_root)?;
        let manager =
            CollectionManager::new(config.monitor_frequency, config.monitor_inactivity);
        let sessions = match &config.session_db_path {
            Some(path) => SessionStore::persistent(path)?,
            None => {
                warn!("no session db configured; clients reauthenticate after a restart");
                SessionStore::in_memory()
            }
        };
        let users = match &config.auth_db_path {
            Some(path) => Some(UserStore::open(path, &config.data_root)?),
            None => {
                warn!("no auth db configured; any credentials are accepted");
                None
            }
        };
        Ok(Self {
            config,
            manager,
            sessions,
            users,
        })
    }

    /// Handles one request and returns the response body.
    ///
    /// Errors map to transport statuses via
    /// [`ServerError::http_status`]; the detail stays in the log.
    pub fn handle(&self, request: SyncRequest) -> ServerResult<Vec<u8>> {
        debug!(operation = request.operation.name(), "dispatching");
        match request.operation {
            Operation::HostKey => self.handle_host_key(&request),
            Operation::Collection(op) => self.handle_collection(op, request),
            Operation::Media(op) => self.handle_media(op, request),
            Operation::Upload => self.handle_upload(request),
            Operation::Download => self.handle_download(&request),
        }
    }

    /// Drains and stops every collection worker.
    pub fn shutdown(&self) {
        self.manager.shutdown();
    }

    fn handle_host_key(&self, request: &SyncRequest) -> ServerResult<Vec<u8>> {
        let req: HostKeyRequest = decode_json(&request.data, request.compressed)?;
        let authenticated = match &self.users {
            Some(store) => store.authenticate(&req.u, &req.p)?,
            // no auth db: accept anyone whose name is filesystem-safe
            None => valid_username(&req.u),
        };
        if !authenticated {
            info!(username = %req.u, "authentication failed");
            return Err(ServerError::Forbidden);
        }

        let user_dir = match &self.users {
            Some(store) => store.user_dir(&req.u),
            None => self.config.data_root.join(&req.u),
        };
        let session = Arc::new(SyncSession::new(&req.u, user_dir));
        self.sessions.save(&session)?;
        info!(username = %req.u, "session created");
        Ok(serde_json::to_vec(&HostKeyResponse {
            key: session.host_key().to_string(),
        })?)
    }

    fn handle_collection(&self, op: SyncOp, request: SyncRequest) -> ServerResult<Vec<u8>> {
        let session = self.resolve_session(&request)?;
        if op == SyncOp::Meta {
            // the client announces its own media session key here; adopt
            // it so later media requests resolve by `sk`
            if let Some(skey) = &request.session_key {
                session.set_session_key(skey);
            }
            self.sessions.save(&session)?;
        }

        let worker = self.manager.worker_for(&session.collection_path())?;
        let job_session = Arc::clone(&session);
        match op {
            SyncOp::Meta => {
                let req: MetaRequest = decode_json(&request.data, request.compressed)?;
                worker.execute("meta", move |col| {
                    let resp = CollectionSyncHandler::new(col, &job_session).meta(req)?;
                    Ok(serde_json::to_vec(&resp)?)
                })
            }
            SyncOp::Start => {
                let req: StartRequest = decode_json(&request.data, request.compressed)?;
                worker.execute("start", move |col| {
                    let resp = CollectionSyncHandler::new(col, &job_session).start(req)?;
                    Ok(serde_json::to_vec(&resp)?)
                })
            }
            SyncOp::ApplyGraves => {
                let req: ApplyGravesRequest = decode_json(&request.data, request.compressed)?;
                worker.execute("applyGraves", move |col| {
                    CollectionSyncHandler::new(col, &job_session).apply_graves(req)?;
                    Ok(b"null".to_vec())
                })
            }
            SyncOp::ApplyChanges => {
                let req: ApplyChangesRequest = decode_json(&request.data, request.compressed)?;
                worker.execute("applyChanges", move |col| {
                    let resp = CollectionSyncHandler::new(col, &job_session).apply_changes(req)?;
                    Ok(serde_json::to_vec(&resp)?)
                })
            }
            SyncOp::Chunk => worker.execute("chunk", move |col| {
                let resp = CollectionSyncHandler::new(col, &job_session).chunk()?;
                Ok(serde_json::to_vec(&resp)?)
            }),
            SyncOp::ApplyChunk => {
                let req: ApplyChunkRequest = decode_json(&request.data, request.compressed)?;
                worker.execute("applyChunk", move |col| {
                    CollectionSyncHandler::new(col, &job_session).apply_chunk(req)?;
                    Ok(b"null".to_vec())
                })
            }
            SyncOp::SanityCheck2 => {
                let req: SanityCheckRequest = decode_json(&request.data, request.compressed)?;
                worker.execute("sanityCheck2", move |col| {
                    let resp = CollectionSyncHandler::new(col, &job_session).sanity_check(req)?;
                    Ok(serde_json::to_vec(&resp)?)
                })
            }
            SyncOp::Finish => worker.execute("finish", move |col| {
                let ts = CollectionSyncHandler::new(col, &job_session).finish()?;
                Ok(ts.to_string().into_bytes())
            }),
        }
    }

    fn handle_media(&self, op: MediaOp, request: SyncRequest) -> ServerResult<Vec<u8>> {
        let session = self.resolve_session(&request)?;
        let worker = self.manager.worker_for(&session.collection_path())?;
        let job_session = Arc::clone(&session);
        match op {
            MediaOp::Begin => worker.execute("begin", move |col| {
                let resp = MediaSyncHandler::new(col, &job_session).begin()?;
                Ok(serde_json::to_vec(&resp)?)
            }),
            MediaOp::MediaChanges => {
                let req: MediaChangesRequest = decode_json(&request.data, request.compressed)?;
                worker.execute("mediaChanges", move |col| {
                    let resp = MediaSyncHandler::new(col, &job_session).media_changes(req)?;
                    Ok(serde_json::to_vec(&resp)?)
                })
            }
            MediaOp::MediaSanity => {
                let req: MediaSanityRequest = decode_json(&request.data, request.compressed)?;
                worker.execute("mediaSanity", move |col| {
                    let resp = MediaSyncHandler::new(col, &job_session).media_sanity(req)?;
                    Ok(serde_json::to_vec(&resp)?)
                })
            }
            MediaOp::UploadChanges => {
                let data = decode_raw(&request.data, request.compressed)?;
                worker.execute("uploadChanges", move |col| {
                    let resp = MediaSyncHandler::new(col, &job_session).upload_changes(&data)?;
                    Ok(serde_json::to_vec(&resp)?)
                })
            }
            MediaOp::DownloadFiles => {
                let req: MediaDownloadRequest = decode_json(&request.data, request.compressed)?;
                worker.execute("downloadFiles", move |col| {
                    MediaSyncHandler::new(col, &job_session).download_files(req)
                })
            }
        }
    }

    fn handle_upload(&self, request: SyncRequest) -> ServerResult<Vec<u8>> {
        let session = self.resolve_session(&request)?;
        let worker = self.manager.worker_for(&session.collection_path())?;
        let data = decode_raw(&request.data, request.compressed)?;
        worker.execute("upload", move |col| full_sync::upload(col, &data))
    }

    fn handle_download(&self, request: &SyncRequest) -> ServerResult<Vec<u8>> {
        let session = self.resolve_session(request)?;
        let worker = self.manager.worker_for(&session.collection_path())?;
        worker.execute("download", full_sync::download)
    }

    fn resolve_session(&self, request: &SyncRequest) -> ServerResult<Arc<SyncSession>> {
        if let Some(host_key) = &request.host_key {
            if let Some(session) = self.sessions.load(host_key)? {
                return Ok(session);
            }
        }
        if let Some(session_key) = &request.session_key {
            if let Some(session) = self.sessions.load_from_session_key(session_key)? {
                return Ok(session);
            }
        }
        Err(ServerError::Forbidden)
    }
}

/// Decompresses (when flagged) and parses a JSON payload. An empty
/// payload reads as the empty object, which several operations send.
fn decode_json<T: DeserializeOwned>(data: &[u8], compressed: bool) -> ServerResult<T> {
    let bytes = decode_raw(data, compressed)?;
    let bytes = if bytes.is_empty() {
        b"{}".to_vec()
    } else {
        bytes
    };
    serde_json::from_slice(&bytes)
        .map_err(|err| ServerError::InvalidRequest(format!("malformed payload: {err}")))
}

/// Undoes the transport's optional gzip compression.
fn decode_raw(data: &[u8], compressed: bool) -> ServerResult<Vec<u8>> {
    if !compressed {
        return Ok(data.to_vec());
    }
    let mut out = Vec::new();
    GzDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|err| ServerError::InvalidRequest(format!("bad gzip payload: {err}")))?;
    Ok(out)
}
