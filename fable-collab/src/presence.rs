//! Session presence: who is in the room, how engaged they are, and
//! when they fade out.
//!
//! ## Architecture
//!
//! ```text
//! join ──► Online ◄───────────── record_activity / update_cursor
//!            │                                  ▲
//!            │ sweep: idle ≥ away_after         │
//!            ▼                                  │
//!          Away ────────────────────────────────┘
//!            │
//!            │ sweep: heartbeat silent ≥ offline_after
//!            ▼
//!         Offline ──► removed after offline_after + offline_linger
//! ```
//!
//! ## Transitions
//!
//! | From    | To          | Trigger                                     |
//! |---------|-------------|---------------------------------------------|
//! | (none)  | Online      | `join`                                      |
//! | Online  | Away        | sweep: no activity for `away_after`         |
//! | Away    | Online      | `record_activity` / `update_cursor`         |
//! | any     | Offline     | sweep: no heartbeat for `offline_after`     |
//! | Offline | Online/Away | `record_heartbeat`, by activity recency     |
//! | Offline | removed     | sweep: silent for `offline_after + linger`  |
//!
//! Absence is decided only by [`PresenceTracker::sweep`]; every other
//! call moves a session toward presence. Status changes fan out to
//! subscribers, and a panicking subscriber is isolated so it cannot
//! take the tracker down with it.
//!
//! Reference: Kleppmann, Chapter 8 — Timeouts and Unbounded Delays

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ───────────────────────────────────────────────────────────────────
// Core types
// ───────────────────────────────────────────────────────────────────

/// Visibility of a participant to the rest of the room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    Online,
    Away,
    Offline,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Online => write!(f, "online"),
            SessionStatus::Away => write!(f, "away"),
            SessionStatus::Offline => write!(f, "offline"),
        }
    }
}

/// What a participant was last seen doing. `Idle` is a hint and does
/// not refresh activity recency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivityType {
    Typing,
    Viewing,
    Idle,
}

/// One participant's live state, tracked with monotonic clocks.
#[derive(Debug, Clone)]
struct Session {
    user_id: Uuid,
    display_name: String,
    status: SessionStatus,
    /// Last reported activity kind.
    activity: ActivityType,
    joined_at: Instant,
    /// Last edit, cursor move, or explicit activity report.
    last_activity: Instant,
    /// Last heartbeat or any other sign of a live connection.
    last_heartbeat: Instant,
    /// Last cursor broadcast that passed the throttle.
    last_cursor_sent: Instant,
    /// Edits and activity reports since join.
    activity_count: u64,
    cursor: Option<usize>,
    selection: Option<(usize, usize)>,
}

/// Serializable view of a session, safe to put on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub user_id: Uuid,
    pub display_name: String,
    pub status: SessionStatus,
    pub activity: ActivityType,
    pub cursor: Option<usize>,
    pub selection: Option<(usize, usize)>,
    /// Seconds since the last activity.
    pub idle_secs: u64,
    /// Engagement score in `[0, 1]`.
    pub engagement: f32,
}

/// Presence timing knobs.
#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// No activity for this long flips Online to Away. Default: 5 min.
    pub away_after: Duration,
    /// No heartbeat for this long flips anyone to Offline. Default: 90s.
    pub offline_after: Duration,
    /// How long an Offline session lingers before the sweep drops it.
    /// Default: 10 min.
    pub offline_linger: Duration,
    /// Minimum gap between cursor broadcasts. Default: 33ms (30fps).
    pub cursor_interval: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            away_after: Duration::from_secs(300),
            offline_after: Duration::from_secs(90),
            offline_linger: Duration::from_secs(600),
            cursor_interval: Duration::from_millis(33),
        }
    }
}

impl PresenceConfig {
    /// Config for testing (tiny windows, sleep-friendly).
    pub fn for_testing() -> Self {
        Self {
            away_after: Duration::from_millis(50),
            offline_after: Duration::from_millis(200),
            offline_linger: Duration::from_millis(100),
            cursor_interval: Duration::from_millis(20),
        }
    }
}

/// What one sweep did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub away: Vec<Uuid>,
    pub offline: Vec<Uuid>,
    pub removed: Vec<Uuid>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.away.is_empty() && self.offline.is_empty() && self.removed.is_empty()
    }
}

type PresenceCallback = Box<dyn Fn(&SessionSnapshot, SessionStatus, SessionStatus) + Send + Sync>;

// ───────────────────────────────────────────────────────────────────
// Tracker
// ───────────────────────────────────────────────────────────────────

/// Tracks every session in one room and fans status changes out to
/// subscribers.
pub struct PresenceTracker {
    sessions: HashMap<Uuid, Session>,
    config: PresenceConfig,
    subscribers: Vec<PresenceCallback>,
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new(PresenceConfig::default())
    }
}

impl PresenceTracker {
    pub fn new(config: PresenceConfig) -> Self {
        Self {
            sessions: HashMap::new(),
            config,
            subscribers: Vec::new(),
        }
    }

    /// Register a status-change callback. Subscribers see the session
    /// snapshot after the change plus the old and new status.
    pub fn subscribe<F>(&mut self, subscriber: F)
    where
        F: Fn(&SessionSnapshot, SessionStatus, SessionStatus) + Send + Sync + 'static,
    {
        self.subscribers.push(Box::new(subscriber));
    }

    /// Admit a participant as Online. Re-joining refreshes the session
    /// clocks and display name instead of duplicating it.
    pub fn join(&mut self, user_id: Uuid, display_name: impl Into<String>) -> SessionSnapshot {
        use std::collections::hash_map::Entry;

        let now = Instant::now();
        let name = display_name.into();
        let (snapshot, old, changed) = {
            let session = match self.sessions.entry(user_id) {
                Entry::Occupied(entry) => {
                    let session = entry.into_mut();
                    session.display_name = name;
                    session
                }
                Entry::Vacant(entry) => entry.insert(Session {
                    user_id,
                    display_name: name,
                    status: SessionStatus::Offline,
                    activity: ActivityType::Viewing,
                    joined_at: now,
                    last_activity: now,
                    last_heartbeat: now,
                    // Allow an immediate first cursor broadcast.
                    last_cursor_sent: now - self.config.cursor_interval,
                    activity_count: 0,
                    cursor: None,
                    selection: None,
                }),
            };
            let old = session.status;
            session.status = SessionStatus::Online;
            session.activity = ActivityType::Viewing;
            session.last_activity = now;
            session.last_heartbeat = now;
            (
                Self::snapshot_session(session, &self.config),
                old,
                old != SessionStatus::Online,
            )
        };
        if changed {
            self.notify(&snapshot, old, SessionStatus::Online);
        }
        snapshot
    }

    /// Drop a participant on clean disconnect. Subscribers see the
    /// transition to Offline before the session disappears.
    pub fn leave(&mut self, user_id: Uuid) -> Option<SessionSnapshot> {
        let mut session = self.sessions.remove(&user_id)?;
        let old = session.status;
        session.status = SessionStatus::Offline;
        let snapshot = Self::snapshot_session(&session, &self.config);
        if old != SessionStatus::Offline {
            self.notify(&snapshot, old, SessionStatus::Offline);
        }
        Some(snapshot)
    }

    /// Note that a participant did something. The reported kind is
    /// stored on the session either way; typing and viewing also
    /// refresh the activity clock and bump the activity counter, while
    /// an explicit `Idle` report leaves both alone.
    pub fn record_activity(
        &mut self,
        user_id: Uuid,
        activity: ActivityType,
    ) -> Option<SessionStatus> {
        if activity == ActivityType::Idle {
            let session = self.sessions.get_mut(&user_id)?;
            session.activity = ActivityType::Idle;
            return Some(session.status);
        }

        let now = Instant::now();
        let (snapshot, old, revived) = {
            let session = self.sessions.get_mut(&user_id)?;
            let old = session.status;
            session.activity = activity;
            session.last_activity = now;
            session.last_heartbeat = now;
            session.activity_count += 1;
            session.status = SessionStatus::Online;
            (
                Self::snapshot_session(session, &self.config),
                old,
                old != SessionStatus::Online,
            )
        };
        if revived {
            self.notify(&snapshot, old, SessionStatus::Online);
        }
        Some(SessionStatus::Online)
    }

    /// Record a heartbeat. A heartbeat alone never promotes Away back
    /// to Online, but it does re-admit an Offline session at whichever
    /// status its activity recency warrants.
    pub fn record_heartbeat(&mut self, user_id: Uuid) -> Option<SessionStatus> {
        let now = Instant::now();
        let (snapshot, old, new) = {
            let session = self.sessions.get_mut(&user_id)?;
            let old = session.status;
            session.last_heartbeat = now;
            if old == SessionStatus::Offline {
                let idle = now.duration_since(session.last_activity);
                session.status = if idle < self.config.away_after {
                    SessionStatus::Online
                } else {
                    SessionStatus::Away
                };
            }
            (
                Self::snapshot_session(session, &self.config),
                old,
                session.status,
            )
        };
        if old != new {
            self.notify(&snapshot, old, new);
        }
        Some(new)
    }

    /// Move a participant's cursor. The stored position always
    /// updates; the return value says whether this move should be
    /// broadcast or swallowed by the throttle.
    pub fn update_cursor(
        &mut self,
        user_id: Uuid,
        position: usize,
        selection: Option<(usize, usize)>,
    ) -> Option<bool> {
        let now = Instant::now();
        let (snapshot, old, revived, broadcast) = {
            let session = self.sessions.get_mut(&user_id)?;
            let old = session.status;
            session.cursor = Some(position);
            session.selection = selection;
            session.activity = ActivityType::Viewing;
            session.last_activity = now;
            session.last_heartbeat = now;
            session.status = SessionStatus::Online;

            let broadcast =
                now.duration_since(session.last_cursor_sent) >= self.config.cursor_interval;
            if broadcast {
                session.last_cursor_sent = now;
            }
            (
                Self::snapshot_session(session, &self.config),
                old,
                old != SessionStatus::Online,
                broadcast,
            )
        };
        if revived {
            self.notify(&snapshot, old, SessionStatus::Online);
        }
        Some(broadcast)
    }

    /// Apply the timeout rules. This is the only place a session moves
    /// toward Away, Offline, or removal.
    pub fn sweep(&mut self) -> SweepReport {
        let now = Instant::now();
        let mut report = SweepReport::default();
        let mut events: Vec<(SessionSnapshot, SessionStatus, SessionStatus)> = Vec::new();
        let config = self.config.clone();

        self.sessions.retain(|id, session| {
            let heartbeat_silence = now.duration_since(session.last_heartbeat);
            let idle = now.duration_since(session.last_activity);

            if session.status == SessionStatus::Offline {
                if heartbeat_silence >= config.offline_after + config.offline_linger {
                    report.removed.push(*id);
                    return false;
                }
                return true;
            }

            if heartbeat_silence >= config.offline_after {
                let old = session.status;
                session.status = SessionStatus::Offline;
                events.push((
                    Self::snapshot_session(session, &config),
                    old,
                    SessionStatus::Offline,
                ));
                report.offline.push(*id);
            } else if session.status == SessionStatus::Online && idle >= config.away_after {
                session.status = SessionStatus::Away;
                events.push((
                    Self::snapshot_session(session, &config),
                    SessionStatus::Online,
                    SessionStatus::Away,
                ));
                report.away.push(*id);
            }
            true
        });

        for (snapshot, old, new) in &events {
            self.notify(snapshot, *old, *new);
        }
        report
    }

    // ── Queries ──────────────────────────────────────────────────

    pub fn session(&self, user_id: Uuid) -> Option<SessionSnapshot> {
        self.sessions
            .get(&user_id)
            .map(|s| Self::snapshot_session(s, &self.config))
    }

    /// Everyone currently visible to the room (Offline excluded).
    pub fn active_sessions(&self) -> Vec<SessionSnapshot> {
        self.sessions
            .values()
            .filter(|s| s.status != SessionStatus::Offline)
            .map(|s| Self::snapshot_session(s, &self.config))
            .collect()
    }

    /// All tracked sessions, lingering Offline ones included.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn engagement(&self, user_id: Uuid) -> Option<f32> {
        self.sessions.get(&user_id).map(|s| {
            compute_engagement(
                s.activity_count,
                s.joined_at.elapsed(),
                s.last_activity.elapsed(),
                self.config.away_after,
            )
        })
    }

    // ── Internals ────────────────────────────────────────────────

    fn snapshot_session(session: &Session, config: &PresenceConfig) -> SessionSnapshot {
        SessionSnapshot {
            user_id: session.user_id,
            display_name: session.display_name.clone(),
            status: session.status,
            activity: session.activity,
            cursor: session.cursor,
            selection: session.selection,
            idle_secs: session.last_activity.elapsed().as_secs(),
            engagement: compute_engagement(
                session.activity_count,
                session.joined_at.elapsed(),
                session.last_activity.elapsed(),
                config.away_after,
            ),
        }
    }

    fn notify(&self, snapshot: &SessionSnapshot, old: SessionStatus, new: SessionStatus) {
        for subscriber in &self.subscribers {
            let outcome = catch_unwind(AssertUnwindSafe(|| subscriber(snapshot, old, new)));
            if outcome.is_err() {
                log::warn!(
                    "presence subscriber panicked on {} ({old} -> {new}); continuing",
                    snapshot.user_id
                );
            }
        }
    }
}

/// Blend of how much, how long, and how recently a participant has
/// been active, clamped to `[0, 1]`.
///
/// Weights: 0.4 volume (100 actions saturates), 0.2 tenure (an hour
/// saturates), 0.4 recency (decays to zero over `away_after`).
pub fn compute_engagement(
    activity_count: u64,
    session_age: Duration,
    idle: Duration,
    away_after: Duration,
) -> f32 {
    let volume = (activity_count as f32 / 100.0).min(1.0);
    let tenure = (session_age.as_secs_f32() / 3600.0).min(1.0);
    let away_secs = away_after.as_secs_f32().max(f32::EPSILON);
    let recency = (1.0 - idle.as_secs_f32() / away_secs).clamp(0.0, 1.0);
    (0.4 * volume + 0.2 * tenure + 0.4 * recency).clamp(0.0, 1.0)
}

// ===================================================================
// Tests
// ===================================================================
