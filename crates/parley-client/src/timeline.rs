use std::collections::{HashMap, HashSet};

use tracing::debug;

use parley_types::models::ChatMessage;

/// The two correlation keys a logical message can be known by. A pending
/// upload starts with only a client id; the server's init response adds a
/// file id. Both resolve to the same placeholder record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageKey {
    Client(String),
    File(String),
}

/// Stable identity of one rendered timeline slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaceholderState {
    Uploading { percent: u8 },
    Failed { reason: String },
}

/// A provisional timeline entry for an upload that has not been confirmed
/// by the server. Replaced in place by the confirming message, or flagged
/// failed — never silently removed.
#[derive(Debug, Clone)]
pub struct Placeholder {
    pub client_msg_id: String,
    pub upload_id: Option<String>,
    pub filename: String,
    pub size: u64,
    pub state: PlaceholderState,
}

#[derive(Debug, Clone)]
pub enum TimelineEntry {
    Pending(Placeholder),
    Final(ChatMessage),
}

/// What the view layer must do after one timeline mutation. The engine
/// renders nothing itself.
#[derive(Debug, Clone)]
pub enum TimelineUpdate {
    /// A new entry was appended (message or placeholder).
    Appended(EntryId),
    /// A pending placeholder became its final message, same slot.
    Replaced(EntryId),
    /// A placeholder's upload progressed.
    Progress(EntryId, u8),
    /// A placeholder's upload failed.
    Failed(EntryId),
    /// The whole view was discarded (history replay follows as Appended).
    Reset,
    /// The presence list was replaced.
    Presence(Vec<String>),
}

/// The reconciliation engine: folds locally created placeholders and
/// server-confirmed messages into one duplicate-free timeline.
///
/// Every logical message renders at most once per distinct client or file
/// id, no matter how often or in what order its events arrive. Each method
/// takes `&mut self`, so an event's check-then-mark sequence is atomic
/// with respect to any other event.
#[derive(Debug, Default)]
pub struct Timeline {
    entries: Vec<(EntryId, TimelineEntry)>,
    /// Open placeholders, indexed under every key they are known by.
    placeholders: HashMap<MessageKey, EntryId>,
    /// Ids already rendered in this view. Cleared on history replay.
    rendered: HashSet<MessageKey>,
    presence: Vec<String>,
    next_id: u64,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    fn alloc_id(&mut self) -> EntryId {
        self.next_id += 1;
        EntryId(self.next_id)
    }

    fn slot(&mut self, id: EntryId) -> Option<&mut TimelineEntry> {
        self.entries
            .iter_mut()
            .find(|(eid, _)| *eid == id)
            .map(|(_, entry)| entry)
    }

    /// Create a pending entry for a just-started upload, keyed by its
    /// client-generated id.
    pub fn create_placeholder(
        &mut self,
        client_msg_id: &str,
        filename: &str,
        size: u64,
    ) -> (EntryId, TimelineUpdate) {
        let id = self.alloc_id();
        self.entries.push((
            id,
            TimelineEntry::Pending(Placeholder {
                client_msg_id: client_msg_id.to_string(),
                upload_id: None,
                filename: filename.to_string(),
                size,
                state: PlaceholderState::Uploading { percent: 0 },
            }),
        ));
        self.placeholders
            .insert(MessageKey::Client(client_msg_id.to_string()), id);
        (id, TimelineUpdate::Appended(id))
    }

    /// Record the server-assigned upload id as a second key for an open
    /// placeholder. Both keys now resolve to the same entry.
    pub fn bind_upload(&mut self, client_msg_id: &str, upload_id: &str) {
        let key = MessageKey::Client(client_msg_id.to_string());
        let Some(&id) = self.placeholders.get(&key) else {
            debug!("bind_upload for unknown placeholder {}", client_msg_id);
            return;
        };
        self.placeholders
            .insert(MessageKey::File(upload_id.to_string()), id);
        if let Some(TimelineEntry::Pending(p)) = self.slot(id) {
            p.upload_id = Some(upload_id.to_string());
        }
    }

    /// Update upload progress on an open placeholder.
    pub fn set_progress(&mut self, client_msg_id: &str, percent: u8) -> Option<TimelineUpdate> {
        let key = MessageKey::Client(client_msg_id.to_string());
        let id = *self.placeholders.get(&key)?;
        if let Some(TimelineEntry::Pending(p)) = self.slot(id) {
            if matches!(p.state, PlaceholderState::Failed { .. }) {
                return None;
            }
            p.state = PlaceholderState::Uploading { percent };
            return Some(TimelineUpdate::Progress(id, percent));
        }
        None
    }

    /// Flag an open placeholder as failed. The entry stays in the timeline;
    /// its keys are unindexed so a later unrelated message cannot claim it,
    /// but they are NOT marked rendered — the upload produced no message.
    pub fn mark_failed(&mut self, client_msg_id: &str, reason: &str) -> Option<TimelineUpdate> {
        let key = MessageKey::Client(client_msg_id.to_string());
        let id = self.placeholders.remove(&key)?;
        if let Some(TimelineEntry::Pending(p)) = self.slot(id) {
            p.state = PlaceholderState::Failed {
                reason: reason.to_string(),
            };
            let upload_id = p.upload_id.clone();
            if let Some(upload_id) = upload_id {
                self.placeholders.remove(&MessageKey::File(upload_id));
            }
            return Some(TimelineUpdate::Failed(id));
        }
        None
    }

    /// Fold one server-confirmed message into the view.
    ///
    /// Resolution order: (1) an open placeholder under the message's client
    /// id is replaced in place; (2) else one under its file id; (3) else an
    /// already-rendered id means a duplicate delivery, dropped silently;
    /// (4) else the message is new and appended. In every non-duplicate
    /// case both of the message's ids are marked rendered.
    pub fn apply_message(&mut self, msg: ChatMessage) -> Option<TimelineUpdate> {
        let client_key = msg
            .client_msg_id
            .as_ref()
            .map(|id| MessageKey::Client(id.clone()));
        let file_key = msg.file_id().map(|id| MessageKey::File(id.to_string()));

        let matched = client_key
            .as_ref()
            .and_then(|k| self.placeholders.get(k).copied())
            .or_else(|| {
                file_key
                    .as_ref()
                    .and_then(|k| self.placeholders.get(k).copied())
            });

        if let Some(id) = matched {
            // Replace in place and purge every key the placeholder was
            // indexed under — client id and file id name the same entry.
            if let Some(TimelineEntry::Pending(p)) = self.slot(id) {
                let bound_upload = p.upload_id.clone();
                let bound_client = p.client_msg_id.clone();
                self.placeholders.remove(&MessageKey::Client(bound_client));
                if let Some(upload_id) = bound_upload {
                    self.placeholders.remove(&MessageKey::File(upload_id));
                }
            }
            if let Some(k) = &client_key {
                self.placeholders.remove(k);
            }
            if let Some(k) = &file_key {
                self.placeholders.remove(k);
            }
            self.mark_rendered(client_key, file_key);
            *self.slot(id).expect("placeholder entry must exist") =
                TimelineEntry::Final(msg);
            return Some(TimelineUpdate::Replaced(id));
        }

        let already_rendered = client_key
            .as_ref()
            .map(|k| self.rendered.contains(k))
            .unwrap_or(false)
            || file_key
                .as_ref()
                .map(|k| self.rendered.contains(k))
                .unwrap_or(false);

        if already_rendered {
            debug!("dropping duplicate delivery of {}", msg.msg_id);
            return None;
        }

        self.mark_rendered(client_key, file_key);
        let id = self.alloc_id();
        self.entries.push((id, TimelineEntry::Final(msg)));
        Some(TimelineUpdate::Appended(id))
    }

    fn mark_rendered(&mut self, client_key: Option<MessageKey>, file_key: Option<MessageKey>) {
        if let Some(k) = client_key {
            self.rendered.insert(k);
        }
        if let Some(k) = file_key {
            self.rendered.insert(k);
        }
    }

    /// Replace the whole view with a server history replay. All rendered-id
    /// bookkeeping from the previous view is discarded first, so messages
    /// seen before the replay render again exactly once.
    pub fn apply_history(&mut self, msgs: Vec<ChatMessage>) -> Vec<TimelineUpdate> {
        self.entries.clear();
        self.placeholders.clear();
        self.rendered.clear();

        let mut updates = vec![TimelineUpdate::Reset];
        for msg in msgs {
            updates.extend(self.apply_message(msg));
        }
        updates
    }

    /// Replace the presence list wholesale.
    pub fn apply_clients(&mut self, names: Vec<String>) -> TimelineUpdate {
        self.presence = names.clone();
        TimelineUpdate::Presence(names)
    }

    pub fn presence(&self) -> &[String] {
        &self.presence
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = (EntryId, &TimelineEntry)> {
        self.entries.iter().map(|(id, entry)| (*id, entry))
    }

    pub fn entry(&self, id: EntryId) -> Option<&TimelineEntry> {
        self.entries
            .iter()
            .find(|(eid, _)| *eid == id)
            .map(|(_, entry)| entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_types::models::FileMeta;

    fn text_msg(msg_id: &str, text: &str) -> ChatMessage {
        ChatMessage::text(msg_id.into(), "alice".into(), text.into(), "10:00:00".into())
    }

    fn file_msg(msg_id: &str, file_id: &str, client_msg_id: Option<&str>) -> ChatMessage {
        ChatMessage::file(
            msg_id.into(),
            "alice".into(),
            "10:00:01".into(),
            FileMeta {
                file_id: file_id.into(),
                original_name: "photo.png".into(),
                mime: "image/png".into(),
                size: 42,
                url: format!("/media/{}", file_id),
            },
            client_msg_id.map(Into::into),
        )
    }

    #[test]
    fn duplicate_delivery_renders_once() {
        let mut tl = Timeline::new();
        let msg = file_msg("m1", "f1", None);
        assert!(matches!(
            tl.apply_message(msg.clone()),
            Some(TimelineUpdate::Appended(_))
        ));
        assert!(tl.apply_message(msg).is_none());
        assert_eq!(tl.len(), 1);
    }

    #[test]
    fn placeholder_replaced_by_client_id_keeps_length() {
        let mut tl = Timeline::new();
        tl.create_placeholder("c1", "photo.png", 42);
        tl.bind_upload("c1", "f1");
        assert_eq!(tl.len(), 1);

        let update = tl.apply_message(file_msg("m1", "f1", Some("c1")));
        let id = match update {
            Some(TimelineUpdate::Replaced(id)) => id,
            other => panic!("expected replacement, got {:?}", other),
        };
        assert_eq!(tl.len(), 1);
        assert!(matches!(tl.entry(id), Some(TimelineEntry::Final(_))));

        // The echo of the same completion is now a duplicate.
        assert!(tl.apply_message(file_msg("m1", "f1", Some("c1"))).is_none());
        assert_eq!(tl.len(), 1);
    }

    #[test]
    fn placeholder_replaced_by_client_id_with_different_file_id() {
        // The confirming message may carry a file id the placeholder never
        // learned. Client id alone must correlate.
        let mut tl = Timeline::new();
        tl.create_placeholder("c1", "photo.png", 42);
        assert!(matches!(
            tl.apply_message(file_msg("m1", "f-other", Some("c1"))),
            Some(TimelineUpdate::Replaced(_))
        ));
        assert_eq!(tl.len(), 1);
        // Both ids of the message are now rendered.
        assert!(tl.apply_message(file_msg("m2", "f-other", None)).is_none());
    }

    #[test]
    fn placeholder_replaced_by_file_id_when_client_id_absent() {
        let mut tl = Timeline::new();
        tl.create_placeholder("c1", "photo.png", 42);
        tl.bind_upload("c1", "f1");

        // Broadcast lost the client id (e.g. another device's view of it).
        assert!(matches!(
            tl.apply_message(file_msg("m1", "f1", None)),
            Some(TimelineUpdate::Replaced(_))
        ));
        assert_eq!(tl.len(), 1);

        // The client-id key was purged with the placeholder: a later
        // message reusing it would not find a pending slot.
        assert!(tl.placeholders.is_empty());
    }

    #[test]
    fn unrelated_messages_append() {
        let mut tl = Timeline::new();
        tl.create_placeholder("c1", "photo.png", 42);
        tl.apply_message(text_msg("m1", "hi"));
        tl.apply_message(file_msg("m2", "f9", Some("c-other")));
        assert_eq!(tl.len(), 3);
    }

    #[test]
    fn history_clears_rendered_state() {
        let mut tl = Timeline::new();
        let msg = file_msg("m1", "f1", None);
        tl.apply_message(msg.clone());

        let updates = tl.apply_history(vec![msg.clone(), text_msg("m2", "again")]);
        assert!(matches!(updates[0], TimelineUpdate::Reset));
        // The replayed message rendered again exactly once.
        assert_eq!(tl.len(), 2);

        // And duplicate suppression works within the new view.
        assert!(tl.apply_message(msg).is_none());
        assert_eq!(tl.len(), 2);
    }

    #[test]
    fn history_discards_open_placeholders() {
        let mut tl = Timeline::new();
        tl.create_placeholder("c1", "photo.png", 42);
        tl.apply_history(vec![]);
        assert!(tl.is_empty());
        // A completion for the old placeholder appends as a new message.
        assert!(matches!(
            tl.apply_message(file_msg("m1", "f1", Some("c1"))),
            Some(TimelineUpdate::Appended(_))
        ));
    }

    #[test]
    fn progress_and_failure_lifecycle() {
        let mut tl = Timeline::new();
        let (id, _) = tl.create_placeholder("c1", "photo.png", 42);
        tl.bind_upload("c1", "f1");

        assert!(matches!(
            tl.set_progress("c1", 33),
            Some(TimelineUpdate::Progress(pid, 33)) if pid == id
        ));

        assert!(matches!(
            tl.mark_failed("c1", "chunk 1 failed"),
            Some(TimelineUpdate::Failed(pid)) if pid == id
        ));
        // Failed entry stays visible.
        assert_eq!(tl.len(), 1);
        assert!(matches!(
            tl.entry(id),
            Some(TimelineEntry::Pending(Placeholder {
                state: PlaceholderState::Failed { .. },
                ..
            }))
        ));

        // No further progress on a failed entry; its keys are unindexed.
        assert!(tl.set_progress("c1", 50).is_none());
        assert!(matches!(
            tl.apply_message(file_msg("m1", "f1", Some("c1"))),
            Some(TimelineUpdate::Appended(_))
        ));
        assert_eq!(tl.len(), 2);
    }

    #[test]
    fn racing_completion_events_resolve_to_one_entry() {
        // Two deliveries of the same completion arriving back-to-back:
        // the first replaces the placeholder, the second is a duplicate.
        let mut tl = Timeline::new();
        tl.create_placeholder("c1", "photo.png", 42);
        tl.bind_upload("c1", "f1");

        let by_client = file_msg("m1", "f1", Some("c1"));
        let by_file = file_msg("m1", "f1", None);
        assert!(tl.apply_message(by_client).is_some());
        assert!(tl.apply_message(by_file).is_none());
        assert_eq!(tl.len(), 1);
    }

    #[test]
    fn presence_is_replaced_wholesale() {
        let mut tl = Timeline::new();
        tl.apply_clients(vec!["alice".into(), "bob".into()]);
        assert_eq!(tl.presence(), ["alice", "bob"]);
        tl.apply_clients(vec!["bob".into()]);
        assert_eq!(tl.presence(), ["bob"]);
    }
}
