//! The incremental collection sync state machine.
//!
//! One sync cycle runs `meta` → `start` → `applyGraves` →
//! `applyChanges` → `chunk`* → `applyChunk`* → `sanityCheck2` →
//! `finish`, arriving as separate requests that all execute on the
//! session's worker. `start` captures the cycle window (`min_usn`,
//! `max_usn`) once; every later step reuses it. A cycle that never
//! reaches `finish` is harmless: rows stamped along the way stay
//! identifiable and the collection usn itself only moves at `finish`.
//!
//! Merge rules, deliberately asymmetric and to be kept that way:
//! metadata and card/note rows adopt the incoming copy only when it is
//! strictly newer by `mod` (ties keep local), while graves always apply
//! regardless of timestamps.

use crate::error::{ServerError, ServerResult};
use crate::session::{ChunkTable, SyncCycleState, SyncSession};
use cardbox_core::{pending_objects, time, Collection, GraveKind};
use cardbox_sync_protocol::{
    client_too_old, ApplyChangesRequest, ApplyChunkRequest, ApplyGravesRequest, Changes, Chunk,
    Graves, MetaRequest, MetaResponse, SanityCheckRequest, SanityCheckResponse, StartRequest,
    MIN_SYNC_VERSION, SYNC_VERSION,
};
use tracing::{debug, info, warn};

/// Handles the collection-sync steps for one session, bound to the
/// collection instance its worker currently holds.
pub struct CollectionSyncHandler<'a> {
    col: &'a mut Collection,
    session: &'a SyncSession,
}

impl<'a> CollectionSyncHandler<'a> {
    /// Binds a handler to the live collection and session.
    pub fn new(col: &'a mut Collection, session: &'a SyncSession) -> Self {
        Self { col, session }
    }

    /// Version gates plus the collection summary.
    ///
    /// Unsupported protocol versions get a structured `cont: false`
    /// notice; clients known to be broken get a hard
    /// [`ServerError::ObsoleteClient`]. The media usn reported here is
    /// what the client measures its media baseline against.
    pub fn meta(&mut self, req: MetaRequest) -> ServerResult<MetaResponse> {
        if let Some(cv) = req.cv.as_deref() {
            if client_too_old(cv) {
                info!(cv, "rejecting obsolete client");
                return Err(ServerError::ObsoleteClient);
            }
        }
        if req.v > SYNC_VERSION {
            return Ok(MetaResponse::incompatible(format!(
                "Your client is using an unsupported sync protocol ({}, supported: {})",
                req.v, SYNC_VERSION
            )));
        }
        if req.v < MIN_SYNC_VERSION {
            return Ok(MetaResponse::incompatible(
                "Your client does not support the v2 scheduler",
            ));
        }

        Ok(MetaResponse {
            modified: self.col.modified()?,
            scm: self.col.schema_modified()?,
            usn: self.col.usn()?,
            ts: time::now_secs(),
            musn: self.col.media().last_usn()?,
            uname: self.session.username().to_string(),
            msg: String::new(),
            cont: true,
            host_num: 0,
        })
    }

    /// Opens the cycle: captures the usn window, returns the graves the
    /// client is missing, and applies any graves older clients sent
    /// inline.
    ///
    /// The outgoing graves are collected before the client's are
    /// applied, so a client never gets its own deletions echoed back.
    pub fn start(&mut self, req: StartRequest) -> ServerResult<Graves> {
        let max_usn = self.col.usn()?;
        let server_graves = self.col.graves_since(req.min_usn)?;
        if let Some(graves) = &req.graves {
            self.apply_graves_at(graves, max_usn)?;
        }
        debug!(
            min_usn = req.min_usn,
            max_usn,
            cards = server_graves.cards.len(),
            notes = server_graves.notes.len(),
            decks = server_graves.decks.len(),
            "sync cycle started"
        );
        *self.session.cycle() = Some(SyncCycleState::new(req.min_usn, max_usn, !req.lnewer));
        Ok(server_graves)
    }

    /// Applies one chunk of client deletions, tombstoning each at the
    /// cycle's `max_usn`.
    pub fn apply_graves(&mut self, req: ApplyGravesRequest) -> ServerResult<()> {
        let max_usn = self.cycle_window()?.1;
        self.apply_graves_at(&req.chunk, max_usn)
    }

    /// Two-way merge of the fully-bundled small objects. Returns the
    /// server's own pending objects, collected before the client's are
    /// merged in, and resets the chunk queue for the transfer phase.
    pub fn apply_changes(&mut self, req: ApplyChangesRequest) -> ServerResult<Changes> {
        let (min_usn, max_usn) = self.cycle_window()?;
        let server_newer = self
            .cycle_state(|state| state.server_newer)?;

        let mut reply = Changes {
            models: pending_objects(&self.col.models_map()?, min_usn),
            decks: (
                pending_objects(&self.col.decks_map()?, min_usn),
                pending_objects(&self.col.deck_config_map()?, min_usn),
            ),
            tags: self.col.pending_tags(min_usn)?,
            conf: None,
            crt: None,
        };
        if server_newer {
            reply.conf = Some(self.col.conf_map()?);
            reply.crt = Some(self.col.created()?);
        }

        let incoming = req.changes;
        self.col.merge_objects("models", incoming.models)?;
        self.col.merge_objects("decks", incoming.decks.0)?;
        self.col.merge_objects("dconf", incoming.decks.1)?;
        self.col.register_tags(&incoming.tags, max_usn)?;
        if let Some(conf) = incoming.conf {
            self.col.merge_conf(conf)?;
        }
        if let Some(crt) = incoming.crt {
            self.col.set_created(crt)?;
        }

        if let Some(state) = self.session.cycle().as_mut() {
            state.tables_left = ChunkTable::ALL.to_vec();
        }
        Ok(reply)
    }

    /// Pops the next table and returns its unsynchronized rows, stamped
    /// with the cycle's `max_usn` on the way out. `done` once all three
    /// tables have been drained.
    pub fn chunk(&mut self) -> ServerResult<Chunk> {
        let (min_usn, max_usn) = self.cycle_window()?;
        let table = self.cycle_state(|state| {
            if state.tables_left.is_empty() {
                None
            } else {
                Some(state.tables_left.remove(0))
            }
        })?;

        let mut chunk = Chunk::default();
        match table {
            Some(ChunkTable::Revlog) => {
                chunk.revlog = Some(self.col.take_pending_revlog(min_usn, max_usn)?);
            }
            Some(ChunkTable::Cards) => {
                chunk.cards = Some(self.col.take_pending_cards(min_usn, max_usn)?);
            }
            Some(ChunkTable::Notes) => {
                chunk.notes = Some(self.col.take_pending_notes(min_usn, max_usn)?);
            }
            None => {}
        }
        chunk.done = self.cycle_state(|state| state.tables_left.is_empty())?;
        Ok(chunk)
    }

    /// Merges whichever tables the client chunk carries. Revlog rows
    /// append; card and note rows follow newer-row-wins.
    pub fn apply_chunk(&mut self, req: ApplyChunkRequest) -> ServerResult<()> {
        let (min_usn, _) = self.cycle_window()?;
        let chunk = req.chunk;
        if let Some(revlog) = &chunk.revlog {
            self.col.merge_revlog(revlog)?;
        }
        if let Some(cards) = &chunk.cards {
            self.col.merge_cards(cards, min_usn)?;
        }
        if let Some(notes) = &chunk.notes {
            self.col.merge_notes(notes, min_usn)?;
        }
        Ok(())
    }

    /// Compares structural summaries. Divergence is a soft failure — the
    /// client is expected to fall back to full sync, the server never
    /// attempts repair.
    pub fn sanity_check(&mut self, req: SanityCheckRequest) -> ServerResult<SanityCheckResponse> {
        let server = self.col.sanity_summary()?;
        if let Some(table) = self.col.unstamped_table()? {
            warn!(table, "sanity check failed: unstamped rows after sync");
            return Ok(SanityCheckResponse::bad(req.client, server));
        }
        if req.client != server {
            info!(client = ?req.client, server = ?server, "sanity check mismatch");
            return Ok(SanityCheckResponse::bad(req.client, server));
        }
        Ok(SanityCheckResponse::ok())
    }

    /// Closes the cycle: stamps `mod` and the last-sync time, bumps the
    /// collection usn, and returns the timestamp.
    pub fn finish(&mut self) -> ServerResult<i64> {
        let now = time::now_millis();
        self.col.set_modified(now)?;
        self.col.set_last_sync(now)?;
        self.col.increment_usn()?;
        *self.session.cycle() = None;
        debug!(usn = self.col.usn()?, "sync cycle finished");
        Ok(now)
    }

    fn apply_graves_at(&mut self, graves: &Graves, max_usn: i64) -> ServerResult<()> {
        self.col.remove_cards(&graves.cards)?;
        self.col.add_graves(&graves.cards, GraveKind::Card, max_usn)?;
        self.col.remove_notes(&graves.notes)?;
        self.col.add_graves(&graves.notes, GraveKind::Note, max_usn)?;
        self.col.remove_decks(&graves.decks)?;
        self.col.add_graves(&graves.decks, GraveKind::Deck, max_usn)?;
        Ok(())
    }

    fn cycle_window(&self) -> ServerResult<(i64, i64)> {
        self.cycle_state(|state| (state.min_usn, state.max_usn))
    }

    fn cycle_state<R>(&self, f: impl FnOnce(&mut SyncCycleState) -> R) -> ServerResult<R> {
        let mut guard = self.session.cycle();
        match guard.as_mut() {
            Some(state) => Ok(f(state)),
            None => Err(ServerError::InvalidRequest(
                "no sync cycle in progress; call start first".into(),
            )),
        }
    }
}
