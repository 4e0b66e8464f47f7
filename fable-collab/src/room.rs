//! Room multiplexing and the engine surface.
//!
//! ```text
//! envelope in ──▶ CollabEngine ──▶ Room (room_id)
//!                                   │
//!                                   ├── Document + UndoHistory
//!                                   ├── PresenceTracker ──┐
//!                                   └── RoomChannel ◀─────┘
//!                                        │
//!                              ┌─────────┼─────────┐
//!                              ▼         ▼         ▼
//!                           rx (A)    rx (B)    rx (C)
//! ```
//!
//! The engine is transport-agnostic: a caller feeds decoded envelopes
//! into [`CollabEngine::handle`], sends the optional direct reply back
//! to the sender, and pumps the room's broadcast receiver to every
//! connected client. Each room holds one authoritative document plus
//! its undo history behind an async lock, presence behind a sync lock,
//! and a fan-out channel. Presence transitions broadcast themselves:
//! the tracker's subscriber hook feeds straight into the channel, so
//! sweeps and revives reach peers without any plumbing at the call
//! sites.
//!
//! Locks are never nested. Every handler takes the document lock,
//! drops it, then touches presence, then broadcasts.
//!
//! Reference: Kleppmann, Chapters 5 & 8

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as SyncMutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex, RwLock};
use uuid::Uuid;

use crate::broadcast::{ChannelStats, RoomChannel};
use crate::document::{ApplyError, ApplyReport, Document, Snapshot};
use crate::history::{
    apply_batch, create_snapshot, merge_branch, restore_snapshot, HistoryError, MergeReport,
    UndoHistory, DEFAULT_UNDO_DEPTH,
};
use crate::operation::Operation;
use crate::presence::{ActivityType, PresenceConfig, PresenceTracker, SessionSnapshot};
use crate::protocol::{Envelope, MessageBody, MessageKind, ProtocolError};
use crate::storage::{MemoryStore, SnapshotStore};
use crate::transform::ConcurrentInsertPolicy;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Per-subscriber broadcast buffer, in envelopes.
    pub broadcast_capacity: usize,
    /// How often the background sweeper applies presence timeouts and
    /// closes idle rooms.
    pub sweep_interval: Duration,
    /// Undo records retained per participant per room.
    pub undo_depth: usize,
    /// How concurrent inserts fare against overlapping deletes.
    pub insert_policy: ConcurrentInsertPolicy,
    pub presence: PresenceConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: 256,
            sweep_interval: Duration::from_secs(10),
            undo_depth: DEFAULT_UNDO_DEPTH,
            insert_policy: ConcurrentInsertPolicy::ExtendDelete,
            presence: PresenceConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Short windows for tests.
    pub fn for_testing() -> Self {
        Self {
            broadcast_capacity: 16,
            sweep_interval: Duration::from_millis(25),
            undo_depth: 32,
            insert_policy: ConcurrentInsertPolicy::ExtendDelete,
            presence: PresenceConfig::for_testing(),
        }
    }
}

/// Engine-wide counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub rooms_opened: u64,
    pub active_rooms: usize,
    pub envelopes_routed: u64,
    pub ops_committed: u64,
    pub ops_annulled: u64,
    pub ops_rejected: u64,
    pub snapshots_taken: u64,
}

/// Lock-free counter cells behind `EngineStats`.
struct AtomicEngineStats {
    rooms_opened: AtomicU64,
    envelopes_routed: AtomicU64,
    ops_committed: AtomicU64,
    ops_annulled: AtomicU64,
    ops_rejected: AtomicU64,
    snapshots_taken: AtomicU64,
}

impl AtomicEngineStats {
    fn new() -> Self {
        Self {
            rooms_opened: AtomicU64::new(0),
            envelopes_routed: AtomicU64::new(0),
            ops_committed: AtomicU64::new(0),
            ops_annulled: AtomicU64::new(0),
            ops_rejected: AtomicU64::new(0),
            snapshots_taken: AtomicU64::new(0),
        }
    }
}

/// Document plus the undo stacks that shadow it. Kept under one lock
/// so a commit and its history record can never be torn apart.
struct DocumentState {
    doc: Document,
    history: UndoHistory,
}

/// One shared document with everything attached to it.
pub struct Room {
    pub id: Uuid,
    state: Mutex<DocumentState>,
    presence: SyncMutex<PresenceTracker>,
    channel: Arc<RoomChannel>,
    created_at: Instant,
}

impl Room {
    fn new(id: Uuid, config: &EngineConfig) -> Self {
        let channel = Arc::new(RoomChannel::new(config.broadcast_capacity));

        // Presence transitions fan out by themselves; the tracker does
        // not know it is being broadcast.
        let mut tracker = PresenceTracker::new(config.presence.clone());
        let fan_out = channel.clone();
        tracker.subscribe(move |session, old, new| {
            let envelope = Envelope::presence_changed(id, session.clone(), old, new);
            match envelope.encode() {
                Ok(bytes) => {
                    fan_out.fan_out(Arc::new(bytes));
                }
                Err(e) => log::warn!("room {id}: presence change not encodable: {e}"),
            }
        });

        Self {
            id,
            state: Mutex::new(DocumentState {
                doc: Document::new(id),
                history: UndoHistory::new(config.undo_depth),
            }),
            presence: SyncMutex::new(tracker),
            channel,
            created_at: Instant::now(),
        }
    }

    /// Attach a broadcast receiver for one connected client.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.channel.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.channel.subscriber_count()
    }

    pub fn channel_stats(&self) -> ChannelStats {
        self.channel.stats()
    }

    /// Sessions currently visible to peers.
    pub fn sessions(&self) -> Vec<SessionSnapshot> {
        self.presence().active_sessions()
    }

    pub fn session_count(&self) -> usize {
        self.presence().session_count()
    }

    pub async fn content(&self) -> String {
        self.state.lock().await.doc.content().to_string()
    }

    pub async fn head_version(&self) -> u64 {
        self.state.lock().await.doc.head_version()
    }

    /// Materialized content of one branch, if it exists.
    pub async fn branch_content(&self, branch_id: Uuid) -> Option<String> {
        let state = self.state.lock().await;
        state.doc.branch(branch_id).map(|b| b.content.clone())
    }

    pub async fn branch_ids(&self) -> Vec<Uuid> {
        self.state.lock().await.doc.branch_ids()
    }

    /// Whether the document holds labeled snapshots. Labels keep the
    /// room resident across sweeps.
    pub async fn has_snapshots(&self) -> bool {
        self.state.lock().await.doc.has_snapshots()
    }

    pub fn uptime(&self) -> Duration {
        self.created_at.elapsed()
    }

    fn presence(&self) -> MutexGuard<'_, PresenceTracker> {
        // A poisoned tracker is still a valid tracker.
        self.presence.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// The multiplexer: routes envelopes to rooms, creating them on first
/// join and closing them once idle.
pub struct CollabEngine {
    config: EngineConfig,
    rooms: RwLock<HashMap<Uuid, Arc<Room>>>,
    store: Arc<dyn SnapshotStore>,
    stats: AtomicEngineStats,
}

impl CollabEngine {
    pub fn new(config: EngineConfig, store: Arc<dyn SnapshotStore>) -> Self {
        Self {
            config,
            rooms: RwLock::new(HashMap::new()),
            store,
            stats: AtomicEngineStats::new(),
        }
    }

    /// In-memory snapshot store, default timeouts.
    pub fn with_defaults() -> Self {
        Self::new(EngineConfig::default(), Arc::new(MemoryStore::new()))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Get or create the room for `room_id`.
    pub async fn open_room(&self, room_id: Uuid) -> Arc<Room> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(&room_id) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring the write lock.
        if let Some(room) = rooms.get(&room_id) {
            return room.clone();
        }

        let room = Arc::new(Room::new(room_id, &self.config));
        rooms.insert(room_id, room.clone());
        self.stats.rooms_opened.fetch_add(1, Ordering::Relaxed);
        log::info!("room {room_id} opened");
        room
    }

    pub async fn room(&self, room_id: Uuid) -> Option<Arc<Room>> {
        self.rooms.read().await.get(&room_id).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn room_ids(&self) -> Vec<Uuid> {
        self.rooms.read().await.keys().copied().collect()
    }

    async fn require_room(&self, room_id: Uuid) -> Result<Arc<Room>, EngineError> {
        self.room(room_id)
            .await
            .ok_or(EngineError::UnknownRoom(room_id))
    }

    /// Route one envelope. Returns the direct reply for the sender, if
    /// the message warrants one; everything room-wide goes out through
    /// the broadcast channel instead.
    ///
    /// Domain refusals (bad base version, unknown room) come back
    /// in-band as [`MessageBody::Rejected`]; only infrastructure
    /// failures surface as errors.
    pub async fn handle(&self, envelope: Envelope) -> Result<Option<Envelope>, EngineError> {
        self.stats.envelopes_routed.fetch_add(1, Ordering::Relaxed);
        let kind = envelope.kind();
        log::debug!(
            "routing {kind:?} from {} to room {}",
            envelope.sender_id,
            envelope.room_id
        );

        // Join creates the room; everything else needs it to exist.
        let room = if kind == MessageKind::Join {
            self.open_room(envelope.room_id).await
        } else {
            match self.room(envelope.room_id).await {
                Some(room) => room,
                None => {
                    log::debug!("{kind:?} for unknown room {}", envelope.room_id);
                    return Ok(Some(Envelope::rejected(
                        envelope.room_id,
                        envelope.sender_id,
                        format!("unknown room {}", envelope.room_id),
                    )));
                }
            }
        };

        let Envelope {
            room_id,
            sender_id,
            body,
            ..
        } = envelope;

        match body {
            MessageBody::Join { display_name } => {
                let snapshot = room.presence().join(sender_id, display_name);
                log::info!(
                    "{} ({sender_id}) joined room {room_id}",
                    snapshot.display_name
                );
                let sessions = room.sessions();
                let state = room.state.lock().await;
                Ok(Some(Envelope::new(
                    room_id,
                    Uuid::nil(),
                    MessageBody::JoinAck {
                        content: state.doc.content().to_string(),
                        head_version: state.doc.head_version(),
                        vector: state.doc.vector().clone(),
                        sessions,
                        // Joiners start on the root branch.
                        branch_id: Uuid::nil(),
                    },
                )))
            }

            MessageBody::Leave => {
                if let Some(snapshot) = room.presence().leave(sender_id) {
                    log::info!("{} ({sender_id}) left room {room_id}", snapshot.display_name);
                }
                Ok(None)
            }

            MessageBody::Change { op } => self.apply_change(&room, sender_id, op).await,

            MessageBody::Batch { ops } => self.apply_change_batch(&room, sender_id, ops).await,

            MessageBody::Cursor {
                position,
                selection,
            } => {
                let verdict = room.presence().update_cursor(sender_id, position, selection);
                match verdict {
                    Some(true) => {
                        log::trace!("cursor broadcast for {sender_id} in room {room_id}");
                        let echo = Envelope::cursor(room_id, sender_id, position, selection);
                        room.channel.send(&echo)?;
                    }
                    Some(false) => {
                        log::trace!("cursor throttled for {sender_id} in room {room_id}");
                    }
                    None => {
                        log::debug!("cursor from non-member {sender_id} in room {room_id}");
                    }
                }
                Ok(None)
            }

            MessageBody::Sync => {
                room.presence()
                    .record_activity(sender_id, ActivityType::Viewing);
                let state = room.state.lock().await;
                Ok(Some(Envelope::new(
                    room_id,
                    Uuid::nil(),
                    MessageBody::SyncState {
                        content: state.doc.content().to_string(),
                        head_version: state.doc.head_version(),
                        vector: state.doc.vector().clone(),
                    },
                )))
            }

            MessageBody::Heartbeat => {
                room.presence().record_heartbeat(sender_id);
                Ok(Some(Envelope::new(
                    room_id,
                    Uuid::nil(),
                    MessageBody::HeartbeatAck,
                )))
            }

            other => {
                // Server-to-client kinds have no business arriving here.
                log::debug!("ignoring inbound {:?} from {sender_id}", other.kind());
                Ok(None)
            }
        }
    }

    async fn apply_change(
        &self,
        room: &Arc<Room>,
        sender_id: Uuid,
        op: Operation,
    ) -> Result<Option<Envelope>, EngineError> {
        let op_id = op.id;
        let outcome = {
            let mut state = room.state.lock().await;
            match state.doc.apply_operation(op, self.config.insert_policy) {
                Ok(report) => {
                    state.history.record(&report);
                    Ok(report)
                }
                Err(err) => Err(err),
            }
        };
        room.presence()
            .record_activity(sender_id, ActivityType::Typing);

        match outcome {
            Ok(report) if report.is_annulled() => {
                self.stats.ops_annulled.fetch_add(1, Ordering::Relaxed);
                let annulled_by = report.annulled_by.unwrap_or(op_id);
                log::debug!("operation {op_id} annulled by {annulled_by} in room {}", room.id);
                Ok(Some(Envelope::annulled(
                    room.id,
                    sender_id,
                    op_id,
                    annulled_by,
                )))
            }
            Ok(report) => {
                self.stats
                    .ops_committed
                    .fetch_add(report.committed.len() as u64, Ordering::Relaxed);
                self.broadcast_committed(room, sender_id, &report)?;
                Ok(None)
            }
            Err(err) => {
                self.stats.ops_rejected.fetch_add(1, Ordering::Relaxed);
                log::warn!("operation {op_id} rejected in room {}: {err}", room.id);
                Ok(Some(Envelope::rejected(room.id, sender_id, err.to_string())))
            }
        }
    }

    async fn apply_change_batch(
        &self,
        room: &Arc<Room>,
        sender_id: Uuid,
        ops: Vec<Operation>,
    ) -> Result<Option<Envelope>, EngineError> {
        if ops.is_empty() {
            return Ok(None);
        }

        let summary = {
            let mut state = room.state.lock().await;
            let DocumentState { doc, history } = &mut *state;
            let summary = apply_batch(doc, ops, self.config.insert_policy);
            for report in &summary.reports {
                history.record(report);
            }
            summary
        };
        room.presence()
            .record_activity(sender_id, ActivityType::Typing);

        self.stats
            .ops_annulled
            .fetch_add(summary.annulled as u64, Ordering::Relaxed);
        let committed: Vec<Operation> = summary
            .reports
            .iter()
            .flat_map(|r| r.committed.iter().map(|a| a.op.clone()))
            .collect();
        self.stats
            .ops_committed
            .fetch_add(committed.len() as u64, Ordering::Relaxed);
        if !committed.is_empty() {
            room.channel
                .send(&Envelope::committed(room.id, sender_id, committed))?;
        }

        if let Some((index, err)) = summary.failed {
            self.stats.ops_rejected.fetch_add(1, Ordering::Relaxed);
            log::warn!(
                "batch from {sender_id} stopped at operation {index} in room {}: {err}",
                room.id
            );
            return Ok(Some(Envelope::rejected(
                room.id,
                sender_id,
                format!("batch stopped at operation {index}: {err}"),
            )));
        }
        Ok(None)
    }

    fn broadcast_committed(
        &self,
        room: &Arc<Room>,
        author: Uuid,
        report: &ApplyReport,
    ) -> Result<(), EngineError> {
        let ops: Vec<Operation> = report.committed.iter().map(|a| a.op.clone()).collect();
        if ops.is_empty() {
            return Ok(());
        }
        room.channel.send(&Envelope::committed(room.id, author, ops))?;
        Ok(())
    }

    // ── Document surface ─────────────────────────────────────────

    /// Reverse `user_id`'s latest edit and broadcast the committed
    /// inverse so every peer converges.
    pub async fn undo(&self, room_id: Uuid, user_id: Uuid) -> Result<ApplyReport, EngineError> {
        let room = self.require_room(room_id).await?;
        let report = {
            let mut state = room.state.lock().await;
            let DocumentState { doc, history } = &mut *state;
            history.undo(doc, user_id, self.config.insert_policy)?
        };
        self.stats
            .ops_committed
            .fetch_add(report.committed.len() as u64, Ordering::Relaxed);
        self.broadcast_committed(&room, user_id, &report)?;
        Ok(report)
    }

    /// Re-apply `user_id`'s latest undone edit.
    pub async fn redo(&self, room_id: Uuid, user_id: Uuid) -> Result<ApplyReport, EngineError> {
        let room = self.require_room(room_id).await?;
        let report = {
            let mut state = room.state.lock().await;
            let DocumentState { doc, history } = &mut *state;
            history.redo(doc, user_id, self.config.insert_policy)?
        };
        self.stats
            .ops_committed
            .fetch_add(report.committed.len() as u64, Ordering::Relaxed);
        self.broadcast_committed(&room, user_id, &report)?;
        Ok(report)
    }

    pub async fn create_branch(
        &self,
        room_id: Uuid,
        name: impl Into<String>,
        parent: Uuid,
        fork_version: u64,
    ) -> Result<Uuid, EngineError> {
        let room = self.require_room(room_id).await?;
        let mut state = room.state.lock().await;
        let branch_id = state.doc.create_branch(name, parent, fork_version)?;
        log::info!("room {room_id}: branch {branch_id} forked from {parent} at version {fork_version}");
        Ok(branch_id)
    }

    /// Merge `source` into its parent `target`. A merge that lands on
    /// the root branch refreshes every peer with the merged state.
    pub async fn merge(
        &self,
        room_id: Uuid,
        source: Uuid,
        target: Uuid,
    ) -> Result<MergeReport, EngineError> {
        let room = self.require_room(room_id).await?;
        let (report, refreshed) = {
            let mut state = room.state.lock().await;
            let report = merge_branch(&mut state.doc, source, target, self.config.insert_policy)?;
            let refreshed = (target == Uuid::nil()).then(|| MessageBody::SyncState {
                content: state.doc.content().to_string(),
                head_version: state.doc.head_version(),
                vector: state.doc.vector().clone(),
            });
            (report, refreshed)
        };
        if let Some(body) = refreshed {
            room.channel.send(&Envelope::new(room_id, Uuid::nil(), body))?;
        }
        log::info!(
            "room {room_id}: merged {source} into {target} ({} replayed, {} annulled)",
            report.replayed,
            report.annulled
        );
        Ok(report)
    }

    pub async fn snapshot(
        &self,
        room_id: Uuid,
        branch_id: Uuid,
        label: &str,
    ) -> Result<Snapshot, EngineError> {
        let room = self.require_room(room_id).await?;
        let snapshot = {
            let mut state = room.state.lock().await;
            create_snapshot(&mut state.doc, branch_id, label, self.store.as_ref())?
        };
        self.stats.snapshots_taken.fetch_add(1, Ordering::Relaxed);
        log::info!(
            "room {room_id}: snapshot {label:?} taken at version {}",
            snapshot.version
        );
        Ok(snapshot)
    }

    /// Restore `label` as a fresh branch; no live branch is rewound.
    pub async fn restore(&self, room_id: Uuid, label: &str) -> Result<Uuid, EngineError> {
        let room = self.require_room(room_id).await?;
        let branch_id = {
            let mut state = room.state.lock().await;
            restore_snapshot(&mut state.doc, label, self.store.as_ref())?
        };
        log::info!("room {room_id}: snapshot {label:?} restored as branch {branch_id}");
        Ok(branch_id)
    }

    // ── Maintenance ──────────────────────────────────────────────

    /// Apply presence timeouts in every room and close rooms with no
    /// sessions, no subscribers, and no labeled snapshots. Returns how
    /// many rooms closed.
    pub async fn sweep_rooms(&self) -> usize {
        let rooms: Vec<Arc<Room>> = self.rooms.read().await.values().cloned().collect();
        let mut idle: Vec<Uuid> = Vec::new();
        for room in rooms {
            let report = room.presence().sweep();
            if !report.is_empty() {
                log::debug!(
                    "room {}: sweep marked {} away, {} offline, removed {}",
                    room.id,
                    report.away.len(),
                    report.offline.len(),
                    report.removed.len()
                );
            }
            if room.session_count() == 0
                && room.subscriber_count() == 0
                && !room.has_snapshots().await
            {
                idle.push(room.id);
            }
        }

        if idle.is_empty() {
            return 0;
        }
        let mut rooms = self.rooms.write().await;
        let mut closed = 0;
        for id in idle {
            // Re-check under the write lock; a join may have raced us.
            let still_idle = match rooms.get(&id) {
                Some(room) => {
                    room.session_count() == 0
                        && room.subscriber_count() == 0
                        && !room.has_snapshots().await
                }
                None => false,
            };
            if still_idle {
                rooms.remove(&id);
                closed += 1;
                log::info!("room {id} closed (idle)");
            }
        }
        closed
    }

    /// Run the sweeper on `sweep_interval` until the handle is
    /// aborted.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(engine.config.sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                engine.sweep_rooms().await;
            }
        })
    }

    pub async fn stats(&self) -> EngineStats {
        EngineStats {
            rooms_opened: self.stats.rooms_opened.load(Ordering::Relaxed),
            active_rooms: self.rooms.read().await.len(),
            envelopes_routed: self.stats.envelopes_routed.load(Ordering::Relaxed),
            ops_committed: self.stats.ops_committed.load(Ordering::Relaxed),
            ops_annulled: self.stats.ops_annulled.load(Ordering::Relaxed),
            ops_rejected: self.stats.ops_rejected.load(Ordering::Relaxed),
            snapshots_taken: self.stats.snapshots_taken.load(Ordering::Relaxed),
        }
    }
}

/// Engine errors. Domain refusals travel in-band as `Rejected`
/// envelopes; these are the failures the caller has to handle.
#[derive(Debug)]
pub enum EngineError {
    UnknownRoom(Uuid),
    Protocol(ProtocolError),
    History(HistoryError),
    Apply(ApplyError),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownRoom(id) => write!(f, "unknown room: {id}"),
            Self::Protocol(e) => write!(f, "protocol: {e}"),
            Self::History(e) => write!(f, "history: {e}"),
            Self::Apply(e) => write!(f, "apply: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<ProtocolError> for EngineError {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

impl From<HistoryError> for EngineError {
    fn from(e: HistoryError) -> Self {
        Self::History(e)
    }
}

impl From<ApplyError> for EngineError {
    fn from(e: ApplyError) -> Self {
        Self::Apply(e)
    }
}

// ===================================================================
// Tests
// ===================================================================
