//! Per-conversation message ordering.
//!
//! A [`Timeline`] keeps three groups of messages:
//!
//! - `confirmed`: rendered, keyed by sequence number. Its tail is gap-free.
//! - `held`: server messages that arrived past a gap, waiting for the
//!   missing sequence numbers.
//! - `local`: the device's own entries that have no rendered slot yet
//!   (pending, failed, or confirmed past a gap), in creation order. They
//!   render after `confirmed`.
//!
//! Two indexes map canonical and client ids to the sequence numbers of
//! `confirmed` and `held` entries so merges are keyed lookups.

use std::collections::{BTreeMap, HashMap};

use convosync_proto::message::{ClientId, PrincipalId, SequenceNumber, ServerId};
use convosync_proto::notification::SendReceipt;

use super::message::{DeliveryStatus, FailureReason, Message};

/// A missing sequence range, bounds exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gap {
    /// Last rendered sequence number.
    pub after: SequenceNumber,
    /// First sequence number held past the gap.
    pub before: SequenceNumber,
}

/// Ordered messages of one conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Timeline {
    confirmed: BTreeMap<SequenceNumber, Message>,
    held: BTreeMap<SequenceNumber, Message>,
    local: Vec<Message>,
    by_server: HashMap<ServerId, SequenceNumber>,
    by_client: HashMap<ClientId, SequenceNumber>,
    read_mark: Option<SequenceNumber>,
    requested_gap: Option<Gap>,
}

impl Timeline {
    /// Messages in render order: confirmed by sequence, then the local tail.
    pub fn rendered(&self) -> impl Iterator<Item = &Message> {
        self.confirmed.values().chain(self.local.iter())
    }

    /// Number of rendered messages.
    #[must_use]
    pub fn rendered_len(&self) -> usize {
        self.confirmed.len() + self.local.len()
    }

    /// Number of messages held behind a gap.
    #[must_use]
    pub fn held_len(&self) -> usize {
        self.held.len()
    }

    /// Highest rendered sequence number.
    #[must_use]
    pub fn last_sequence(&self) -> Option<SequenceNumber> {
        self.confirmed.last_key_value().map(|(seq, _)| *seq)
    }

    /// Returns `true` if no server-confirmed message has been rendered.
    #[must_use]
    pub fn has_confirmed(&self) -> bool {
        !self.confirmed.is_empty()
    }

    /// Looks up any message (rendered, held or local) by client id.
    #[must_use]
    pub fn find_by_client(&self, client_id: &ClientId) -> Option<&Message> {
        if let Some(msg) = self
            .local
            .iter()
            .find(|m| m.client_id.as_ref() == Some(client_id))
        {
            return Some(msg);
        }
        let seq = self.by_client.get(client_id)?;
        self.confirmed.get(seq).or_else(|| self.held.get(seq))
    }

    /// Unread messages: rendered, authored by someone other than `viewer`,
    /// past the read mark.
    #[must_use]
    pub fn unread_for(&self, viewer: &PrincipalId) -> u32 {
        let count = match self.read_mark {
            Some(mark) => self
                .confirmed
                .range(mark.next()..)
                .filter(|(_, m)| &m.sender_id != viewer)
                .count(),
            None => self
                .confirmed
                .values()
                .filter(|m| &m.sender_id != viewer)
                .count(),
        };
        u32::try_from(count).unwrap_or(u32::MAX)
    }

    /// Moves the read mark to the last rendered message.
    pub fn mark_read(&mut self) {
        if let Some(last) = self.last_sequence() {
            self.read_mark = Some(self.read_mark.map_or(last, |mark| mark.max(last)));
        }
    }

    /// Adds an optimistic entry, or re-arms a failed one with the same
    /// client id. Returns `false` if nothing changed.
    pub fn push_pending(&mut self, pending: Message) -> bool {
        let Some(client_id) = pending.client_id else {
            return false;
        };
        if let Some(existing) = self
            .local
            .iter_mut()
            .find(|m| m.client_id == Some(client_id))
        {
            if existing.status.is_failed() {
                existing.status = DeliveryStatus::Pending;
                return true;
            }
            return false;
        }
        if self.by_client.contains_key(&client_id) {
            // Already confirmed and placed.
            return false;
        }
        self.local.push(pending);
        true
    }

    /// Marks a local entry failed. Confirmed entries are left alone.
    pub fn fail_local(&mut self, client_id: ClientId, reason: FailureReason) -> bool {
        match self
            .local
            .iter_mut()
            .find(|m| m.client_id == Some(client_id))
        {
            Some(entry) if !entry.status.is_confirmed() => {
                entry.status = DeliveryStatus::Failed(reason);
                true
            }
            _ => false,
        }
    }

    /// Applies a send receipt to the local entry with `client_id`.
    ///
    /// Returns the gap to backfill if the confirmed sequence number lies
    /// past the rendered tail.
    pub fn confirm_local(&mut self, client_id: ClientId, receipt: &SendReceipt) -> Option<Gap> {
        let Some(pos) = self
            .local
            .iter()
            .position(|m| m.client_id == Some(client_id))
        else {
            self.alias_confirmed(client_id, &receipt.server_id);
            return None;
        };
        let mut entry = self.local.remove(pos);
        entry.confirm(receipt);

        // The realtime echo may have landed first without our client id.
        if let Some(seq) = self.by_server.get(&receipt.server_id).copied() {
            self.merge_at(seq, entry);
            return None;
        }
        self.place_own(entry, pos)
    }

    /// Merges a server message. Idempotent: applying the same message twice
    /// leaves the timeline unchanged.
    ///
    /// Returns the gap to backfill if the message had to be held.
    pub fn upsert(&mut self, incoming: Message) -> Option<Gap> {
        let (Some(seq), Some(server_id)) = (incoming.sequence, incoming.server_id.clone()) else {
            tracing::warn!("ignoring server message without sequence or id");
            return None;
        };

        // Server version replaces a local optimistic entry with the same
        // client id (or an entry already confirmed by receipt).
        let local_pos = self.local.iter().position(|m| {
            (incoming.client_id.is_some() && m.client_id == incoming.client_id)
                || m.server_id.as_ref() == Some(&server_id)
        });
        if let Some(pos) = local_pos {
            let entry = self.local.remove(pos).merged_with(incoming);
            return self.place_own(entry, pos);
        }

        if let Some(known) = self.by_server.get(&server_id).copied() {
            if known == seq {
                self.merge_at(seq, incoming);
                return None;
            }
            tracing::warn!(
                server_id = %server_id,
                old = %known,
                new = %seq,
                "message sequence changed, re-placing"
            );
            let previous = self.remove_at(known);
            let entry = match previous {
                Some(prev) => prev.merged_with(incoming),
                None => incoming,
            };
            return self.place_remote(entry);
        }

        self.place_remote(incoming)
    }

    /// Releases every held message below `before`, accepting that the
    /// sequence numbers still missing there do not exist.
    ///
    /// Returns a new gap if one remains further along.
    pub fn release_held(&mut self, before: SequenceNumber) -> Option<Gap> {
        let releasable: Vec<SequenceNumber> = self.held.range(..before).map(|(s, _)| *s).collect();
        let own_releasable: Vec<usize> = self
            .local
            .iter()
            .enumerate()
            .filter(|(_, m)| m.sequence.is_some_and(|s| s < before))
            .map(|(i, _)| i)
            .collect();

        for seq in releasable {
            if let Some(msg) = self.held.remove(&seq) {
                self.confirmed.insert(seq, msg);
            }
        }
        for idx in own_releasable.into_iter().rev() {
            let msg = self.local.remove(idx);
            if let Some(seq) = msg.sequence {
                self.index(seq, &msg);
                self.confirmed.insert(seq, msg);
            }
        }
        if self
            .requested_gap
            .is_some_and(|gap| gap.before <= before)
        {
            self.requested_gap = None;
        }
        self.drain();
        self.pending_gap()
    }

    /// Forgets that the open gap was already requested and reports it
    /// again, if it is still open.
    pub fn retry_gap(&mut self) -> Option<Gap> {
        self.requested_gap = None;
        self.new_gap()
    }

    /// The first gap still open, if any.
    #[must_use]
    pub fn pending_gap(&self) -> Option<Gap> {
        let last = self.last_sequence()?;
        let first_held = self.held.keys().next().copied();
        let first_own = self.local.iter().filter_map(|m| m.sequence).min();
        let before = match (first_held, first_own) {
            (Some(a), Some(b)) => a.min(b),
            (Some(a), None) | (None, Some(a)) => a,
            (None, None) => return None,
        };
        Some(Gap {
            after: last,
            before,
        })
    }

    /// Places a server message: renders it if it fits the tail, otherwise
    /// holds it behind the gap.
    fn place_remote(&mut self, msg: Message) -> Option<Gap> {
        let Some(seq) = msg.sequence else {
            return None;
        };
        if self.fits(seq) {
            self.insert_confirmed(seq, msg);
            self.drain();
            return self.new_gap();
        }
        self.index(seq, &msg);
        if let Some(displaced) = self.held.insert(seq, msg) {
            tracing::warn!(sequence = %seq, ?displaced.server_id, "held message replaced");
        }
        self.new_gap()
    }

    /// Places one of our own confirmed messages. Past a gap it stays in
    /// the local tail at `pos` so it remains visible.
    fn place_own(&mut self, msg: Message, pos: usize) -> Option<Gap> {
        let Some(seq) = msg.sequence else {
            self.local.insert(pos.min(self.local.len()), msg);
            return None;
        };
        if self.fits(seq) {
            self.insert_confirmed(seq, msg);
            self.drain();
            return self.new_gap();
        }
        self.local.insert(pos.min(self.local.len()), msg);
        self.new_gap()
    }

    /// A sequence fits if the timeline is empty, it is at or below the
    /// rendered tail, or it directly follows it.
    fn fits(&self, seq: SequenceNumber) -> bool {
        self.last_sequence()
            .is_none_or(|last| seq <= last || seq == last.next())
    }

    fn insert_confirmed(&mut self, seq: SequenceNumber, msg: Message) {
        self.index(seq, &msg);
        if let Some(displaced) = self.confirmed.insert(seq, msg)
            && displaced.server_id != self.confirmed.get(&seq).and_then(|m| m.server_id.clone())
        {
            tracing::warn!(sequence = %seq, "two messages claimed one sequence number, server version kept");
            if let Some(id) = displaced.server_id {
                self.by_server.remove(&id);
            }
        }
    }

    /// Moves held and own messages that now directly follow the tail into
    /// the rendered set.
    fn drain(&mut self) {
        while let Some(last) = self.last_sequence() {
            let next = last.next();
            if next == last {
                break;
            }
            if let Some(msg) = self.held.remove(&next) {
                self.confirmed.insert(next, msg);
                continue;
            }
            if let Some(pos) = self.local.iter().position(|m| m.sequence == Some(next)) {
                let msg = self.local.remove(pos);
                self.index(next, &msg);
                self.confirmed.insert(next, msg);
                continue;
            }
            break;
        }
    }

    /// Reports the open gap once; repeated calls for the same gap return
    /// `None` so one gap produces one backfill request.
    fn new_gap(&mut self) -> Option<Gap> {
        let gap = self.pending_gap();
        if gap == self.requested_gap {
            return None;
        }
        self.requested_gap = gap;
        gap
    }

    fn merge_at(&mut self, seq: SequenceNumber, incoming: Message) {
        let slot = if self.confirmed.contains_key(&seq) {
            self.confirmed.get_mut(&seq)
        } else {
            self.held.get_mut(&seq)
        };
        if let Some(existing) = slot {
            let merged = existing.clone().merged_with(incoming);
            *existing = merged;
            let snapshot = existing.clone();
            self.index(seq, &snapshot);
        }
    }

    fn remove_at(&mut self, seq: SequenceNumber) -> Option<Message> {
        let msg = self.confirmed.remove(&seq).or_else(|| self.held.remove(&seq))?;
        if let Some(id) = &msg.server_id {
            self.by_server.remove(id);
        }
        if let Some(id) = &msg.client_id {
            self.by_client.remove(id);
        }
        Some(msg)
    }

    fn index(&mut self, seq: SequenceNumber, msg: &Message) {
        if let Some(id) = &msg.server_id {
            self.by_server.insert(id.clone(), seq);
        }
        if let Some(id) = msg.client_id {
            self.by_client.insert(id, seq);
        }
    }

    /// Records the client id alias on an already-placed message.
    fn alias_confirmed(&mut self, client_id: ClientId, server_id: &ServerId) {
        let Some(seq) = self.by_server.get(server_id).copied() else {
            return;
        };
        let slot = if self.confirmed.contains_key(&seq) {
            self.confirmed.get_mut(&seq)
        } else {
            self.held.get_mut(&seq)
        };
        if let Some(msg) = slot
            && msg.client_id.is_none()
        {
            msg.client_id = Some(client_id);
            self.by_client.insert(client_id, seq);
        }
    }
}
