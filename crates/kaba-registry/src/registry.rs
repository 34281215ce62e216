use std::collections::HashMap;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use kaba_types::models::UserRecord;
use kaba_types::{Conversation, IncomingMessage, PeerId, parse_timestamp};

use crate::color::color_for_peer;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("message {sender_id} -> {receiver_id} does not involve the service identity")]
    UnrelatedMessage {
        sender_id: PeerId,
        receiver_id: PeerId,
    },

    #[error("message addressed from the service identity to itself")]
    SelfAddressed,
}

/// Recency-ordered conversation list for one service identity.
///
/// Fed by two sources: a bulk snapshot (`load_snapshot`) and the live message
/// feed (`apply_incoming_message`). Either may arrive first. The list is kept
/// sorted descending by `last_message_at` after every mutation.
///
/// When two messages for the same peer arrive out of order, the one that
/// arrived last sets the timestamp, even if it is older. The sort position
/// follows arrival, not the maximum timestamp seen.
#[derive(Debug)]
pub struct ConversationRegistry {
    service_id: PeerId,
    entries: Vec<Conversation>,
    active: Option<PeerId>,
    /// Tentatively deleted entries awaiting backend confirmation.
    pending_deletes: HashMap<Uuid, Conversation>,
}

impl ConversationRegistry {
    pub fn new(service_id: PeerId) -> Self {
        Self {
            service_id,
            entries: Vec::new(),
            active: None,
            pending_deletes: HashMap::new(),
        }
    }

    pub fn service_id(&self) -> PeerId {
        self.service_id
    }

    /// Current list, most recent first.
    pub fn conversations(&self) -> &[Conversation] {
        &self.entries
    }

    pub fn get(&self, peer_id: PeerId) -> Option<&Conversation> {
        self.entries.iter().find(|c| c.peer_id == peer_id)
    }

    pub fn unread_count(&self, peer_id: PeerId) -> Option<u32> {
        self.get(peer_id).map(|c| c.unread_count)
    }

    pub fn total_unread(&self) -> u64 {
        self.entries.iter().map(|c| u64::from(c.unread_count)).sum()
    }

    pub fn active(&self) -> Option<PeerId> {
        self.active
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn pending_deletes(&self) -> usize {
        self.pending_deletes.len()
    }

    /// Merge a bulk fetch into the registry and return the sorted list.
    ///
    /// Records for peers we already know (typically provisional entries created
    /// by events that beat the snapshot) only overwrite the message fields when
    /// the existing entry is not newer. Name, color and label are adopted only
    /// when the row carries them, so a sparse feed never erases what a richer
    /// one supplied. Peers missing from the snapshot are kept.
    pub fn load_snapshot(&mut self, records: Vec<UserRecord>) -> Vec<Conversation> {
        let count = records.len();

        for row in records.into_iter().filter_map(SnapshotRow::from_record) {
            let Some(idx) = self.position(row.peer_id) else {
                self.entries.push(row.into_conversation());
                continue;
            };

            let existing = &mut self.entries[idx];
            if let Some(name) = row.display_name {
                existing.display_name = name;
            }
            if let Some(color) = row.color_tag {
                existing.color_tag = color;
            }
            if row.label.is_some() {
                existing.label = row.label;
            }

            let row_at = row.last_message_at.unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
            if existing.last_message_at <= row_at {
                if let Some(text) = row.last_message_text {
                    existing.last_message_text = text;
                }
                existing.last_message_at = row_at;
                existing.unread_count = existing.unread_count.max(row.unread_count);
            } else {
                debug!(
                    "Snapshot row for peer {} is older than live state, keeping live message",
                    existing.peer_id
                );
            }
        }

        if let Some(active) = self.active {
            if let Some(idx) = self.position(active) {
                self.entries[idx].unread_count = 0;
            }
        }

        self.sort();
        debug!("Snapshot merged: {} rows, {} conversations", count, self.entries.len());
        self.entries.clone()
    }

    /// Fold one message from the event stream into the registry.
    ///
    /// Returns the counterpart peer. Inbound messages bump the unread count
    /// unless the conversation is open; outbound ones never do.
    pub fn apply_incoming_message(
        &mut self,
        message: &IncomingMessage,
    ) -> Result<PeerId, RegistryError> {
        let (peer_id, inbound) = self.counterpart(message)?;
        let at = message.created_at.unwrap_or_else(Utc::now);
        let is_active = self.active == Some(peer_id);
        let bump = inbound && !is_active;

        match self.position(peer_id) {
            Some(idx) => {
                let conv = &mut self.entries[idx];
                if at < conv.last_message_at {
                    debug!(
                        "Out-of-order message for peer {} ({} < {}), applying in arrival order",
                        peer_id, at, conv.last_message_at
                    );
                }
                conv.last_message_text = message.text.clone();
                conv.last_message_at = at;
                if bump {
                    conv.unread_count = conv.unread_count.saturating_add(1);
                } else if is_active {
                    conv.unread_count = 0;
                }
            }
            None => {
                let display_name = message
                    .sender_name
                    .clone()
                    .filter(|name| inbound && !name.trim().is_empty())
                    .unwrap_or_else(|| default_display_name(peer_id));

                self.entries.push(Conversation {
                    peer_id,
                    display_name,
                    color_tag: color_for_peer(peer_id),
                    last_message_text: message.text.clone(),
                    last_message_at: at,
                    unread_count: u32::from(bump),
                    label: None,
                });
            }
        }

        self.sort();
        Ok(peer_id)
    }

    /// Mark a conversation as the one on screen and clear its unread count.
    /// Peers without an entry can still be opened; their first message will
    /// then arrive already read. Returns whether the peer had an entry.
    pub fn open_conversation(&mut self, peer_id: PeerId) -> bool {
        self.active = Some(peer_id);
        match self.position(peer_id) {
            Some(idx) => {
                self.entries[idx].unread_count = 0;
                true
            }
            None => false,
        }
    }

    pub fn close_conversation(&mut self) {
        self.active = None;
    }

    /// Remove a conversation outright, without a pending phase.
    pub fn delete_conversation(&mut self, peer_id: PeerId) -> Option<Conversation> {
        let idx = self.position(peer_id)?;
        if self.active == Some(peer_id) {
            self.active = None;
        }
        Some(self.entries.remove(idx))
    }

    /// First phase of a delete: remove the entry locally and keep it aside
    /// under the returned token until the backend answers.
    pub fn begin_delete(&mut self, peer_id: PeerId) -> Option<Uuid> {
        let removed = self.delete_conversation(peer_id)?;
        let token = Uuid::new_v4();
        self.pending_deletes.insert(token, removed);
        Some(token)
    }

    /// The delete stands; forget the saved entry.
    pub fn commit_delete(&mut self, token: Uuid) -> bool {
        self.pending_deletes.remove(&token).is_some()
    }

    /// Put a tentatively deleted entry back. A conversation recreated for the
    /// same peer in the meantime wins and the saved copy is dropped.
    pub fn rollback_delete(&mut self, token: Uuid) -> bool {
        let Some(saved) = self.pending_deletes.remove(&token) else {
            return false;
        };

        if self.position(saved.peer_id).is_some() {
            warn!(
                "Not restoring peer {}: conversation was recreated while the delete was pending",
                saved.peer_id
            );
            return false;
        }

        self.entries.push(saved);
        self.sort();
        true
    }

    /// Attach or clear a label. Returns false for unknown peers.
    pub fn set_label(&mut self, peer_id: PeerId, label: Option<String>) -> bool {
        match self.position(peer_id) {
            Some(idx) => {
                self.entries[idx].label = label.filter(|l| !l.trim().is_empty());
                true
            }
            None => false,
        }
    }

    /// Case-insensitive filter over display name, last message text and the
    /// peer id. A blank query matches everything.
    pub fn search(&self, query: &str) -> Vec<Conversation> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return self.entries.clone();
        }

        self.entries
            .iter()
            .filter(|c| {
                c.display_name.to_lowercase().contains(&needle)
                    || c.last_message_text.to_lowercase().contains(&needle)
                    || c.peer_id.to_string().contains(&needle)
            })
            .cloned()
            .collect()
    }

    fn counterpart(&self, message: &IncomingMessage) -> Result<(PeerId, bool), RegistryError> {
        let me = self.service_id;
        match (message.sender_id == me, message.receiver_id == me) {
            (true, true) => Err(RegistryError::SelfAddressed),
            (false, true) => Ok((message.sender_id, true)),
            (true, false) => Ok((message.receiver_id, false)),
            (false, false) => Err(RegistryError::UnrelatedMessage {
                sender_id: message.sender_id,
                receiver_id: message.receiver_id,
            }),
        }
    }

    fn position(&self, peer_id: PeerId) -> Option<usize> {
        self.entries.iter().position(|c| c.peer_id == peer_id)
    }

    // Stable: equal timestamps keep their previous relative order.
    fn sort(&mut self) {
        self.entries
            .sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));
    }
}

fn default_display_name(peer_id: PeerId) -> String {
    format!("User {}", peer_id)
}

/// A snapshot row reduced to what it actually says about one peer.
struct SnapshotRow {
    peer_id: PeerId,
    display_name: Option<String>,
    color_tag: Option<String>,
    last_message_text: Option<String>,
    last_message_at: Option<DateTime<Utc>>,
    unread_count: u32,
    label: Option<String>,
}

impl SnapshotRow {
    fn from_record(record: UserRecord) -> Option<Self> {
        let Some(peer_id) = record.peer_id() else {
            warn!("Snapshot row without a peer id, skipping");
            return None;
        };

        let last_message_at = record.timestamp().map(|raw| {
            parse_timestamp(raw).unwrap_or_else(|| {
                warn!("Unparseable timestamp '{}', sorting as epoch", raw);
                DateTime::<Utc>::UNIX_EPOCH
            })
        });

        Some(Self {
            peer_id,
            display_name: record.display_name().map(str::to_string),
            color_tag: record.color.filter(|c| !c.trim().is_empty()),
            last_message_text: record.last_message,
            last_message_at,
            unread_count: record.unread_count.unwrap_or(0),
            label: record.label.filter(|l| !l.trim().is_empty()),
        })
    }

    fn into_conversation(self) -> Conversation {
        let peer_id = self.peer_id;
        Conversation {
            peer_id,
            display_name: self
                .display_name
                .unwrap_or_else(|| default_display_name(peer_id)),
            color_tag: self.color_tag.unwrap_or_else(|| color_for_peer(peer_id)),
            last_message_text: self.last_message_text.unwrap_or_default(),
            last_message_at: self.last_message_at.unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
            unread_count: self.unread_count,
            label: self.label,
        }
    }
}
