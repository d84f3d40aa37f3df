//! Presence tracking: who is on a page and where their cursor is.
//!
//! ## Architecture
//!
//! ```text
//! PresenceUpdate / Heartbeat (client)
//!       │
//!       ▼
//! PresenceTracker::update() / heartbeat()     last_seen = now
//!       │
//!       ▼
//! PresenceChange::Updated  ──▶ page broadcast ──▶ other sessions
//!
//! maintenance sweep
//!       │
//!       ▼
//! PresenceTracker::expire(now)  ──▶ PresenceChange::Left { TimedOut }
//! ```
//!
//! Presence is ephemeral: it is never persisted and never part of a
//! snapshot's block tree. Time comes from `tokio::time::Instant` so tests
//! can drive expiry with a paused clock.
//!
//! Reference: Kleppmann, Chapter 8, Broadcast Protocols

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

use crate::block::{BlockId, PageId, SessionId, UserId};

// ───────────────────────────────────────────────────────────────────
// Core types
// ───────────────────────────────────────────────────────────────────

/// RGBA color for cursor/selection rendering.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl CursorColor {
    /// Stable, vivid color derived from a user id.
    pub fn from_uuid(id: Uuid) -> Self {
        let hue = ((id.as_u128() % 360) as f32) / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self { r, g, b, a: 1.0 }
    }

    /// `#rrggbb` form for web clients.
    pub fn to_hex(&self) -> String {
        let channel = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        format!(
            "#{:02x}{:02x}{:02x}",
            channel(self.r),
            channel(self.g),
            channel(self.b)
        )
    }
}

impl Default for CursorColor {
    fn default() -> Self {
        Self { r: 0.26, g: 0.52, b: 0.96, a: 1.0 }
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }
    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;
    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// Caret location inside a block's text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub block_id: BlockId,
    /// Character offset within the block
    pub offset: u32,
}

/// Text selection, possibly spanning blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionRange {
    pub anchor: CursorPosition,
    pub head: CursorPosition,
}

/// One session's presence on one page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub display_name: String,
    pub page_id: PageId,
    pub color: CursorColor,
    pub cursor: Option<CursorPosition>,
    pub selection: Option<SelectionRange>,
    pub typing: bool,
}

/// Why a session left a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DepartureReason {
    Unsubscribed,
    Disconnected,
    TimedOut,
}

/// Presence event broadcast to a page's other sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PresenceChange {
    Joined(PresenceEntry),
    Updated(PresenceEntry),
    Left {
        session_id: SessionId,
        user_id: UserId,
        reason: DepartureReason,
    },
}

impl PresenceChange {
    pub fn session_id(&self) -> SessionId {
        match self {
            PresenceChange::Joined(e) | PresenceChange::Updated(e) => e.session_id,
            PresenceChange::Left { session_id, .. } => *session_id,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Tracker
// ───────────────────────────────────────────────────────────────────

struct Tracked {
    entry: PresenceEntry,
    last_seen: Instant,
}

/// Presence of every session on one page.
pub struct PresenceTracker {
    page_id: PageId,
    timeout: Duration,
    sessions: HashMap<SessionId, Tracked>,
}

impl PresenceTracker {
    pub fn new(page_id: PageId, timeout: Duration) -> Self {
        Self {
            page_id,
            timeout,
            sessions: HashMap::new(),
        }
    }

    /// Register a session. Re-joining refreshes and returns the existing entry.
    pub fn join(
        &mut self,
        session_id: SessionId,
        user_id: UserId,
        display_name: &str,
        now: Instant,
    ) -> PresenceEntry {
        let page_id = self.page_id;
        let tracked = self.sessions.entry(session_id).or_insert_with(|| Tracked {
            entry: PresenceEntry {
                session_id,
                user_id,
                display_name: display_name.to_string(),
                page_id,
                color: CursorColor::from_uuid(user_id),
                cursor: None,
                selection: None,
                typing: false,
            },
            last_seen: now,
        });
        tracked.last_seen = now;
        tracked.entry.clone()
    }

    /// Replace a session's cursor, selection, and typing flag.
    ///
    /// Returns `None` for sessions that are not on the page.
    pub fn update(
        &mut self,
        session_id: SessionId,
        cursor: Option<CursorPosition>,
        selection: Option<SelectionRange>,
        typing: bool,
        now: Instant,
    ) -> Option<PresenceEntry> {
        let tracked = self.sessions.get_mut(&session_id)?;
        tracked.entry.cursor = cursor;
        tracked.entry.selection = selection;
        tracked.entry.typing = typing;
        tracked.last_seen = now;
        Some(tracked.entry.clone())
    }

    /// Refresh liveness. Returns false for unknown sessions.
    pub fn heartbeat(&mut self, session_id: SessionId, now: Instant) -> bool {
        match self.sessions.get_mut(&session_id) {
            Some(tracked) => {
                tracked.last_seen = now;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, session_id: SessionId) -> Option<PresenceEntry> {
        self.sessions.remove(&session_id).map(|t| t.entry)
    }

    pub fn get(&self, session_id: SessionId) -> Option<&PresenceEntry> {
        self.sessions.get(&session_id).map(|t| &t.entry)
    }

    /// Entries ordered by display name, then session id.
    pub fn list(&self) -> Vec<PresenceEntry> {
        let mut entries: Vec<PresenceEntry> =
            self.sessions.values().map(|t| t.entry.clone()).collect();
        entries.sort_by(|a, b| {
            a.display_name
                .cmp(&b.display_name)
                .then(a.session_id.cmp(&b.session_id))
        });
        entries
    }

    /// Remove and return every session silent for longer than the timeout.
    pub fn expire(&mut self, now: Instant) -> Vec<PresenceEntry> {
        let timeout = self.timeout;
        let stale: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(_, t)| now.saturating_duration_since(t.last_seen) > timeout)
            .map(|(id, _)| *id)
            .collect();
        stale.into_iter().filter_map(|id| self.remove(id)).collect()
    }

    /// Clear cursors and selections that point at a block no longer live.
    ///
    /// Returns the entries that changed.
    pub fn clear_block(&mut self, is_live: impl Fn(BlockId) -> bool) -> Vec<PresenceEntry> {
        let mut changed = Vec::new();
        for tracked in self.sessions.values_mut() {
            let entry = &mut tracked.entry;
            let mut touched = false;
            if entry.cursor.is_some_and(|c| !is_live(c.block_id)) {
                entry.cursor = None;
                touched = true;
            }
            if entry
                .selection
                .is_some_and(|s| !is_live(s.anchor.block_id) || !is_live(s.head.block_id))
            {
                entry.selection = None;
                touched = true;
            }
            if touched {
                changed.push(entry.clone());
            }
        }
        changed
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(30);

    fn tracker() -> PresenceTracker {
        PresenceTracker::new(Uuid::new_v4(), TIMEOUT)
    }

    #[test]
    fn test_cursor_color_from_uuid_stable() {
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        assert_eq!(CursorColor::from_uuid(id), CursorColor::from_uuid(id));
        let c = CursorColor::from_uuid(id);
        assert!(c.r >= 0.0 && c.r <= 1.0);
        assert_eq!(c.a, 1.0);
    }

    #[test]
    fn test_hsl_to_rgb_red() {
        let (r, g, b) = hsl_to_rgb(0.0, 1.0, 0.5);
        assert!((r - 1.0).abs() < 0.01);
        assert!(g.abs() < 0.01);
        assert!(b.abs() < 0.01);
    }

    #[test]
    fn test_color_hex() {
        assert_eq!(CursorColor { r: 1.0, g: 0.0, b: 0.5, a: 1.0 }.to_hex(), "#ff0080");
    }

    #[test]
    fn test_join_is_idempotent() {
        let mut t = tracker();
        let now = Instant::now();
        let session = Uuid::new_v4();
        let user = Uuid::new_v4();
        let first = t.join(session, user, "Alice", now);
        let again = t.join(session, user, "Alice", now);
        assert_eq!(first, again);
        assert_eq!(t.len(), 1);
        assert_eq!(first.color, CursorColor::from_uuid(user));
    }

    #[test]
    fn test_update_unknown_session() {
        let mut t = tracker();
        assert!(t
            .update(Uuid::new_v4(), None, None, true, Instant::now())
            .is_none());
        assert!(!t.heartbeat(Uuid::new_v4(), Instant::now()));
    }

    #[test]
    fn test_list_is_sorted_by_name() {
        let mut t = tracker();
        let now = Instant::now();
        t.join(Uuid::new_v4(), Uuid::new_v4(), "Zoe", now);
        t.join(Uuid::new_v4(), Uuid::new_v4(), "Ada", now);
        let names: Vec<_> = t.list().into_iter().map(|e| e.display_name).collect();
        assert_eq!(names, vec!["Ada", "Zoe"]);
    }

    #[test]
    fn test_expire_after_timeout() {
        let mut t = tracker();
        let start = Instant::now();
        let quiet = Uuid::new_v4();
        let chatty = Uuid::new_v4();
        t.join(quiet, Uuid::new_v4(), "quiet", start);
        t.join(chatty, Uuid::new_v4(), "chatty", start);

        assert!(t.expire(start + TIMEOUT).is_empty());

        t.heartbeat(chatty, start + Duration::from_secs(20));
        let gone = t.expire(start + TIMEOUT + Duration::from_secs(1));
        assert_eq!(gone.len(), 1);
        assert_eq!(gone[0].session_id, quiet);
        assert!(t.get(chatty).is_some());
        assert!(t.expire(start + TIMEOUT + Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn test_clear_cursors_on_dead_blocks() {
        let mut t = tracker();
        let now = Instant::now();
        let session = Uuid::new_v4();
        let dead = Uuid::new_v4();
        t.join(session, Uuid::new_v4(), "Alice", now);
        t.update(
            session,
            Some(CursorPosition {
                block_id: dead,
                offset: 3,
            }),
            None,
            true,
            now,
        );
        let changed = t.clear_block(|id| id != dead);
        assert_eq!(changed.len(), 1);
        assert!(t.get(session).unwrap().cursor.is_none());
        assert!(t.clear_block(|id| id != dead).is_empty());
    }
}
