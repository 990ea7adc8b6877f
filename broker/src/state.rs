//! Broker state guarded by the broker mutex.
//!
//! Every function here is synchronous and runs with the lock held. Deliveries go
//! into unbounded per-subscription channels, so nothing here ever waits.

use event_octopus_core::transport::{Acknowledger, Message, StartPosition};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

/// Stand-in deadline for ack waits too long to represent as an [`Instant`].
const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

/// Redelivery deadline of a message sent at `now`. Saturates instead of
/// overflowing the clock.
pub(crate) fn ack_deadline(now: Instant, ack_wait: Duration) -> Instant {
    now.checked_add(ack_wait)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// Identity of a durable subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct DurableKey {
    pub client_id: String,
    pub subject: String,
    pub name: String,
}

/// Remembered position of a durable subscription that is not currently open.
#[derive(Debug, Default)]
pub(crate) struct DurablePosition {
    pub last_sent: u64,
    pub pending: BTreeSet<u64>,
}

/// Retained message log of one subject.
#[derive(Debug, Default)]
pub(crate) struct Channel {
    last_sequence: u64,
    messages: VecDeque<(u64, Vec<u8>)>,
}

impl Channel {
    pub(crate) fn append(&mut self, data: Vec<u8>, retention: usize) -> u64 {
        self.last_sequence += 1;
        self.messages.push_back((self.last_sequence, data));
        while self.messages.len() > retention {
            self.messages.pop_front();
        }
        self.last_sequence
    }

    pub(crate) const fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    pub(crate) fn len(&self) -> usize {
        self.messages.len()
    }

    pub(crate) fn get(&self, sequence: u64) -> Option<&[u8]> {
        let (first, _) = self.messages.front()?;
        let index = usize::try_from(sequence.checked_sub(*first)?).ok()?;
        self.messages.get(index).map(|(_, data)| data.as_slice())
    }

    pub(crate) fn after(&self, sequence: u64) -> impl Iterator<Item = (u64, &[u8])> {
        self.messages
            .iter()
            .filter(move |(seq, _)| *seq > sequence)
            .map(|(seq, data)| (*seq, data.as_slice()))
    }

    pub(crate) fn last(&self) -> Option<(u64, &[u8])> {
        self.messages.back().map(|(seq, data)| (*seq, data.as_slice()))
    }
}

/// An open subscription.
pub(crate) struct ActiveSubscription {
    pub client_id: String,
    pub connection_id: u64,
    pub subject: String,
    pub durable: Option<DurableKey>,
    pub ack_wait: Duration,
    /// Present for manual-ack subscriptions.
    pub acker: Option<Arc<dyn Acknowledger>>,
    pub sender: mpsc::UnboundedSender<Message>,
    pub last_sent: u64,
    /// Unacknowledged sequence → redelivery deadline.
    pub pending: BTreeMap<u64, Instant>,
}

impl ActiveSubscription {
    /// Push one delivery. Returns `false` when the receiving stream is gone.
    pub(crate) fn send(&mut self, sequence: u64, data: &[u8], redelivered: bool) -> bool {
        let mut message =
            Message::new(self.subject.clone(), sequence, data.to_vec()).with_redelivered(redelivered);
        if let Some(acker) = &self.acker {
            message = message.with_acker(Arc::clone(acker));
            self.pending.insert(sequence, ack_deadline(Instant::now(), self.ack_wait));
        }
        self.last_sent = self.last_sent.max(sequence);
        self.sender.send(message).is_ok()
    }

    fn position(&self) -> DurablePosition {
        DurablePosition {
            last_sent: self.last_sent,
            pending: self.pending.keys().copied().collect(),
        }
    }
}

/// Everything the broker knows.
#[derive(Default)]
pub(crate) struct BrokerState {
    pub running: bool,
    pub last_error: Option<String>,
    pub stop_sweeper: Option<watch::Sender<bool>>,
    /// Client id → id of the live connection registered under it.
    pub clients: HashMap<String, u64>,
    pub channels: HashMap<String, Channel>,
    pub subscriptions: HashMap<u64, ActiveSubscription>,
    pub durables: HashMap<DurableKey, DurablePosition>,
}

impl BrokerState {
    /// Whether `connection_id` is the live connection of `client_id`.
    pub(crate) fn is_live(&self, client_id: &str, connection_id: u64) -> bool {
        self.running && self.clients.get(client_id) == Some(&connection_id)
    }

    pub(crate) fn has_active_durable(&self, key: &DurableKey) -> bool {
        self.subscriptions
            .values()
            .any(|sub| sub.durable.as_ref() == Some(key))
    }

    /// Append to the channel and fan out to every subscription on the subject.
    pub(crate) fn publish(&mut self, subject: &str, data: Vec<u8>, retention: usize) -> u64 {
        let channel = self.channels.entry(subject.to_string()).or_default();
        let sequence = channel.append(data.clone(), retention);

        let mut gone = Vec::new();
        for (id, sub) in &mut self.subscriptions {
            if sub.subject == subject && !sub.send(sequence, &data, false) {
                gone.push(*id);
            }
        }
        self.drop_abandoned(gone);
        sequence
    }

    /// Register a subscription and push its backlog.
    ///
    /// A durable subscription with a remembered position resumes from it: pending
    /// messages are redelivered first, then everything after the last delivered
    /// sequence. Otherwise `start` decides.
    pub(crate) fn open(&mut self, id: u64, mut sub: ActiveSubscription, start: StartPosition) {
        let resumed = sub.durable.as_ref().and_then(|key| self.durables.remove(key));

        if let Some(channel) = self.channels.get(&sub.subject) {
            match resumed {
                Some(position) => {
                    sub.last_sent = position.last_sent;
                    for sequence in position.pending {
                        if let Some(data) = channel.get(sequence) {
                            sub.send(sequence, data, true);
                        }
                    }
                    for (sequence, data) in channel.after(position.last_sent) {
                        sub.send(sequence, data, false);
                    }
                },
                None => match start {
                    StartPosition::NewOnly => sub.last_sent = channel.last_sequence(),
                    StartPosition::LastReceived => {
                        if let Some((sequence, data)) = channel.last() {
                            sub.send(sequence, data, false);
                        }
                    },
                    StartPosition::First => {
                        for (sequence, data) in channel.after(0) {
                            sub.send(sequence, data, false);
                        }
                    },
                },
            }
        } else if let Some(position) = resumed {
            sub.last_sent = position.last_sent;
        }

        self.subscriptions.insert(id, sub);
    }

    /// Remove a subscription, remembering or forgetting its durable position.
    ///
    /// Dropping the returned subscription drops its sender, which ends the stream.
    pub(crate) fn remove(&mut self, id: u64, forget_durable: bool) -> Option<ActiveSubscription> {
        let sub = self.subscriptions.remove(&id)?;
        if let Some(key) = &sub.durable {
            if forget_durable {
                self.durables.remove(key);
            } else {
                self.durables.insert(key.clone(), sub.position());
            }
        }
        Some(sub)
    }

    /// Close every subscription opened by a connection.
    pub(crate) fn remove_connection(&mut self, connection_id: u64) -> usize {
        let ids: Vec<u64> = self
            .subscriptions
            .iter()
            .filter(|(_, sub)| sub.connection_id == connection_id)
            .map(|(id, _)| *id)
            .collect();
        let count = ids.len();
        for id in ids {
            self.remove(id, false);
        }
        count
    }

    /// Close every subscription and forget every client.
    pub(crate) fn remove_all(&mut self) {
        let ids: Vec<u64> = self.subscriptions.keys().copied().collect();
        for id in ids {
            self.remove(id, false);
        }
        self.clients.clear();
    }

    /// Record an acknowledgment. Returns `false` if nothing knows the subscription.
    pub(crate) fn ack(
        &mut self,
        subscription_id: u64,
        durable: Option<&DurableKey>,
        sequence: u64,
    ) -> bool {
        if let Some(sub) = self.subscriptions.get_mut(&subscription_id) {
            sub.pending.remove(&sequence);
            return true;
        }
        let Some(key) = durable else {
            return false;
        };
        // The durable may have been resumed by a newer subscription.
        if let Some(sub) = self
            .subscriptions
            .values_mut()
            .find(|sub| sub.durable.as_ref() == Some(key))
        {
            sub.pending.remove(&sequence);
            return true;
        }
        if let Some(position) = self.durables.get_mut(key) {
            position.pending.remove(&sequence);
            return true;
        }
        false
    }

    /// Redeliver every pending message whose deadline has passed.
    pub(crate) fn redeliver_expired(&mut self, now: Instant) -> u64 {
        let mut redelivered = 0;
        let mut gone = Vec::new();
        let channels = &self.channels;

        for (id, sub) in &mut self.subscriptions {
            let expired: Vec<u64> = sub
                .pending
                .iter()
                .filter(|(_, deadline)| **deadline <= now)
                .map(|(sequence, _)| *sequence)
                .collect();

            for sequence in expired {
                match channels.get(&sub.subject).and_then(|c| c.get(sequence)) {
                    Some(data) => {
                        if !sub.send(sequence, data, true) {
                            gone.push(*id);
                            break;
                        }
                        redelivered += 1;
                    },
                    // Fell out of retention.
                    None => {
                        sub.pending.remove(&sequence);
                    },
                }
            }
        }

        self.drop_abandoned(gone);
        redelivered
    }

    fn drop_abandoned(&mut self, ids: Vec<u64>) {
        for id in ids {
            if let Some(sub) = self.remove(id, false) {
                tracing::warn!(
                    subject = %sub.subject,
                    client_id = %sub.client_id,
                    "Subscriber dropped its message stream, subscription closed"
                );
                self.last_error = Some(format!(
                    "subscriber '{}' on '{}' dropped its stream",
                    sub.client_id, sub.subject
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_retention_drops_oldest() {
        let mut channel = Channel::default();
        for i in 0..5u8 {
            channel.append(vec![i], 3);
        }
        assert_eq!(channel.len(), 3);
        assert_eq!(channel.last_sequence(), 5);
        assert!(channel.get(2).is_none());
        assert_eq!(channel.get(3), Some(&[2u8][..]));
        assert_eq!(channel.last(), Some((5, &[4u8][..])));
    }

    #[test]
    fn ack_deadline_saturates() {
        let now = Instant::now();
        assert_eq!(
            ack_deadline(now, Duration::from_secs(5)),
            now + Duration::from_secs(5)
        );

        let deadline = ack_deadline(now, Duration::MAX);
        assert!(deadline > now + Duration::from_secs(60 * 60 * 24 * 365));
    }

    #[test]
    fn channel_after_skips_delivered() {
        let mut channel = Channel::default();
        for i in 0..4u8 {
            channel.append(vec![i], 10);
        }
        let sequences: Vec<u64> = channel.after(2).map(|(seq, _)| seq).collect();
        assert_eq!(sequences, vec![3, 4]);
    }
}
