use kaba_types::{IncomingMessage, PeerId};

/// Message history for one peer: the backend's reply to a history request,
/// extended with live messages as they arrive.
///
/// Messages carrying a backend `id` appear at most once. The live echo of a
/// message that is also in the history is therefore dropped. Messages without
/// an id are always kept.
#[derive(Debug, Clone)]
pub struct Thread {
    peer_id: PeerId,
    messages: Vec<IncomingMessage>,
}

impl Thread {
    pub fn new(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            messages: Vec::new(),
        }
    }

    pub fn from_history(peer_id: PeerId, history: Vec<IncomingMessage>) -> Self {
        let mut thread = Self::new(peer_id);
        for message in history {
            thread.push(message);
        }
        thread
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn messages(&self) -> &[IncomingMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Append a message unless its id is already present or it belongs to a
    /// different peer. Returns whether it was appended.
    pub fn push(&mut self, message: IncomingMessage) -> bool {
        if message.sender_id != self.peer_id && message.receiver_id != self.peer_id {
            return false;
        }
        if let Some(id) = message.id {
            if self.messages.iter().any(|m| m.id == Some(id)) {
                return false;
            }
        }
        self.messages.push(message);
        true
    }

    /// Replace the contents with a fresh history, keeping any message seen
    /// live that the history does not contain yet.
    pub fn reload(&mut self, history: Vec<IncomingMessage>) {
        let live = std::mem::take(&mut self.messages);
        for message in history {
            self.push(message);
        }
        for message in live {
            if message.id.is_none() && self.messages.contains(&message) {
                continue;
            }
            self.push(message);
        }
    }
}
