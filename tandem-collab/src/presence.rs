//! Client-side presence: who else is connected and what they have selected.
//!
//! ```text
//! server `user` / `remove-user`
//!       │
//!       ▼
//! PresenceRoster::handle_event()  ──▶ host renders remote selections
//!
//! local selection change
//!       │
//!       ▼
//! SelectionThrottle::offer()  (trailing edge, 250ms)
//!       │
//!       ▼
//! `selection` message
//! ```
//!
//! Presence is last-write-wins: a `user` message replaces everything known
//! about that user.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::client::SyncEvent;
use crate::protocol::{Selection, SelectionUpdate, UserInfo};

/// A remote user as last reported by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteUser {
    pub id: Uuid,
    pub username: String,
    pub selections: HashMap<String, Vec<Selection>>,
}

impl From<UserInfo> for RemoteUser {
    fn from(info: UserInfo) -> Self {
        Self {
            id: info.id,
            username: info.username,
            selections: info.selections,
        }
    }
}

/// Everyone else connected to the server.
#[derive(Debug, Default)]
pub struct PresenceRoster {
    users: HashMap<Uuid, RemoteUser>,
}

impl PresenceRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a client event into the roster. Returns `true` if the roster
    /// changed.
    pub fn handle_event(&mut self, event: &SyncEvent) -> bool {
        match event {
            SyncEvent::User(info) => {
                self.upsert(info.clone());
                true
            }
            SyncEvent::RemoveUser(id) => self.remove(id).is_some(),
            SyncEvent::Disconnected => {
                let changed = !self.users.is_empty();
                self.clear();
                changed
            }
            SyncEvent::Connected | SyncEvent::Saved(_) => false,
        }
    }

    pub fn upsert(&mut self, info: UserInfo) {
        log::trace!("Presence update for {} ({})", info.username, info.id);
        self.users.insert(info.id, info.into());
    }

    pub fn remove(&mut self, id: &Uuid) -> Option<RemoteUser> {
        self.users.remove(id)
    }

    pub fn get(&self, id: &Uuid) -> Option<&RemoteUser> {
        self.users.get(id)
    }

    pub fn users(&self) -> impl Iterator<Item = &RemoteUser> {
        self.users.values()
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn clear(&mut self) {
        self.users.clear();
    }

    /// Remote selections to draw in one document, ordered by username.
    pub fn selections_for(&self, doc_id: &str) -> Vec<(&RemoteUser, &[Selection])> {
        let mut found: Vec<_> = self
            .users
            .values()
            .filter_map(|user| {
                user.selections
                    .get(doc_id)
                    .filter(|ranges| !ranges.is_empty())
                    .map(|ranges| (user, ranges.as_slice()))
            })
            .collect();
        found.sort_by(|a, b| a.0.username.cmp(&b.0.username));
        found
    }
}

/// Trailing-edge throttle for outgoing selection updates.
///
/// The first update opens a window; updates inside it replace each other
/// and only the latest is released once the window has elapsed.
#[derive(Debug)]
pub struct SelectionThrottle {
    interval: Duration,
    window_start: Option<Instant>,
    pending: Option<SelectionUpdate>,
}

impl SelectionThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            window_start: None,
            pending: None,
        }
    }

    /// Record the latest selection.
    pub fn offer(&mut self, update: SelectionUpdate, now: Instant) {
        if self.window_start.is_none() {
            self.window_start = Some(now);
        }
        self.pending = Some(update);
    }

    /// Release the pending update if its window has elapsed.
    pub fn flush(&mut self, now: Instant) -> Option<SelectionUpdate> {
        let deadline = self.next_deadline()?;
        if now < deadline {
            return None;
        }
        self.window_start = None;
        self.pending.take()
    }

    /// When the pending update becomes due, if there is one.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.as_ref()?;
        self.window_start.map(|start| start + self.interval)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SavedDocument;

    fn info(name: &str, doc: &str, ranges: Vec<Selection>) -> UserInfo {
        UserInfo {
            id: Uuid::new_v4(),
            username: name.into(),
            selections: HashMap::from([(doc.to_string(), ranges)]),
        }
    }

    fn update(line: u32) -> SelectionUpdate {
        SelectionUpdate {
            id: "a.txt".into(),
            selections: vec![[line, 0, line, 1]],
        }
    }

    #[test]
    fn test_roster_user_and_remove() {
        let mut roster = PresenceRoster::new();
        let alice = info("alice", "a.txt", vec![[0, 0, 0, 1]]);
        let id = alice.id;

        assert!(roster.handle_event(&SyncEvent::User(alice)));
        assert_eq!(roster.len(), 1);
        assert_eq!(roster.get(&id).unwrap().username, "alice");

        assert!(roster.handle_event(&SyncEvent::RemoveUser(id)));
        assert!(roster.is_empty());
        assert!(!roster.handle_event(&SyncEvent::RemoveUser(id)));
    }

    #[test]
    fn test_roster_last_write_wins() {
        let mut roster = PresenceRoster::new();
        let mut alice = info("alice", "a.txt", vec![[0, 0, 0, 1]]);
        roster.upsert(alice.clone());

        alice.username = "alice2".into();
        alice.selections = HashMap::new();
        roster.upsert(alice.clone());

        let user = roster.get(&alice.id).unwrap();
        assert_eq!(user.username, "alice2");
        assert!(user.selections.is_empty());
    }

    #[test]
    fn test_roster_disconnect_clears() {
        let mut roster = PresenceRoster::new();
        roster.upsert(info("alice", "a.txt", vec![]));
        roster.upsert(info("bob", "a.txt", vec![]));

        assert!(roster.handle_event(&SyncEvent::Disconnected));
        assert!(roster.is_empty());
        assert!(!roster.handle_event(&SyncEvent::Disconnected));
    }

    #[test]
    fn test_roster_ignores_other_events() {
        let mut roster = PresenceRoster::new();
        assert!(!roster.handle_event(&SyncEvent::Connected));
        assert!(!roster.handle_event(&SyncEvent::Saved(SavedDocument {
            id: "a.txt".into(),
            text: String::new(),
        })));
    }

    #[test]
    fn test_selections_for_document() {
        let mut roster = PresenceRoster::new();
        roster.upsert(info("zoe", "a.txt", vec![[1, 0, 1, 4]]));
        roster.upsert(info("adam", "a.txt", vec![[2, 0, 2, 1], [3, 0, 3, 2]]));
        roster.upsert(info("bob", "b.txt", vec![[0, 0, 0, 1]]));
        roster.upsert(info("carl", "a.txt", vec![]));

        let found = roster.selections_for("a.txt");
        let names: Vec<&str> = found.iter().map(|(u, _)| u.username.as_str()).collect();
        assert_eq!(names, vec!["adam", "zoe"]);
        assert_eq!(found[0].1.len(), 2);
        assert!(roster.selections_for("c.txt").is_empty());
    }

    #[test]
    fn test_throttle_is_trailing_edge() {
        let mut throttle = SelectionThrottle::new(Duration::from_millis(250));
        let start = Instant::now();

        throttle.offer(update(1), start);
        // Nothing goes out on the leading edge.
        assert!(throttle.flush(start).is_none());
        assert_eq!(throttle.next_deadline(), Some(start + Duration::from_millis(250)));
    }

    #[test]
    fn test_throttle_keeps_latest() {
        let mut throttle = SelectionThrottle::new(Duration::from_millis(250));
        let start = Instant::now();

        throttle.offer(update(1), start);
        throttle.offer(update(2), start + Duration::from_millis(100));
        throttle.offer(update(3), start + Duration::from_millis(200));

        assert!(throttle.flush(start + Duration::from_millis(249)).is_none());
        assert_eq!(throttle.flush(start + Duration::from_millis(250)), Some(update(3)));
        assert!(throttle.flush(start + Duration::from_millis(300)).is_none());
        assert!(throttle.next_deadline().is_none());
    }

    #[test]
    fn test_throttle_new_window_after_flush() {
        let mut throttle = SelectionThrottle::new(Duration::from_millis(250));
        let start = Instant::now();

        throttle.offer(update(1), start);
        assert!(throttle.flush(start + Duration::from_millis(250)).is_some());

        let later = start + Duration::from_millis(1000);
        throttle.offer(update(2), later);
        assert_eq!(throttle.next_deadline(), Some(later + Duration::from_millis(250)));
        assert!(throttle.flush(later + Duration::from_millis(10)).is_none());
    }

    #[test]
    fn test_throttle_empty() {
        let mut throttle = SelectionThrottle::new(Duration::from_millis(250));
        assert!(throttle.flush(Instant::now()).is_none());
        assert!(throttle.next_deadline().is_none());
        assert_eq!(throttle.interval(), Duration::from_millis(250));
    }
}
