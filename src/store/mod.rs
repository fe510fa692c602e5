//! Quorum-aware mailbox for consensus messages.
//!
//! Messages are indexed by `(type, height, round, sender)`, so a sender
//! contributes at most one message per slot and feeding the same message
//! twice is a no-op. Workers observe the store through [`Subscription`]s:
//! a subscription names a message type and a view (exact round, or a
//! minimum round) together with a quorum predicate, and is woken with the
//! triggering round whenever the predicate holds. Wakeups are delivered
//! at least once; subscribers are expected to re-run their handler on every
//! wakeup and tolerate finding nothing new.
use crate::messages::{Message, MessageType, ValidatorId, View};
use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::{Arc, Mutex},
};
use zksync_concurrency::ctx;


/// Quorum predicate attached to a subscription:
/// `(height, messages, message_type) -> reached`.
pub type QuorumFn = Arc<dyn Fn(u64, &[Message], MessageType) -> bool + Send + Sync>;

/// Identifier of a registered subscription.
pub type SubscriptionId = u64;

/// Criteria for waking a subscriber.
pub struct SubscriptionDetails {
    /// Message type of interest.
    pub message_type: MessageType,
    /// View of interest. With `has_min_round` unset only this exact view
    /// matches; otherwise any round at or above `view.round` does.
    pub view: View,
    /// Treat `view.round` as a lower bound instead of an exact match.
    pub has_min_round: bool,
    /// Predicate over the messages stored at the triggering view.
    pub has_quorum: QuorumFn,
}

/// A live subscription to the store. Unsubscribes itself when dropped.
pub struct Subscription {
    id: SubscriptionId,
    inner: Arc<Mutex<Inner>>,
    recv: ctx::channel::UnboundedReceiver<u64>,
}

impl Subscription {
    /// Identifier under which the subscription is registered.
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Waits until the subscription criteria are met, returning the round
    /// that triggered the wakeup.
    pub async fn notified(&mut self, ctx: &ctx::Ctx) -> ctx::OrCanceled<u64> {
        self.recv.recv(ctx).await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.inner.lock().unwrap().subscribers.remove(&self.id);
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

/// `height -> round -> sender -> message`.
type MessageMap = BTreeMap<u64, BTreeMap<u64, BTreeMap<ValidatorId, Message>>>;

struct Subscriber {
    details: SubscriptionDetails,
    send: ctx::channel::UnboundedSender<u64>,
}

#[derive(Default)]
struct Inner {
    pre_prepare: MessageMap,
    prepare: MessageMap,
    commit: MessageMap,
    round_change: MessageMap,
    subscribers: HashMap<SubscriptionId, Subscriber>,
    next_subscription_id: SubscriptionId,
}

impl Inner {
    fn map(&self, message_type: MessageType) -> &MessageMap {
        match message_type {
            MessageType::PrePrepare => &self.pre_prepare,
            MessageType::Prepare => &self.prepare,
            MessageType::Commit => &self.commit,
            MessageType::RoundChange => &self.round_change,
        }
    }

    fn map_mut(&mut self, message_type: MessageType) -> &mut MessageMap {
        match message_type {
            MessageType::PrePrepare => &mut self.pre_prepare,
            MessageType::Prepare => &mut self.prepare,
            MessageType::Commit => &mut self.commit,
            MessageType::RoundChange => &mut self.round_change,
        }
    }

    /// All messages of the given type stored at the view.
    fn at_view(&self, message_type: MessageType, view: &View) -> Vec<Message> {
        self.map(message_type)
            .get(&view.height)
            .and_then(|rounds| rounds.get(&view.round))
            .map(|senders| senders.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether `round` matches the subscriber's round criteria.
    fn round_matches(details: &SubscriptionDetails, round: u64) -> bool {
        if details.has_min_round {
            round >= details.view.round
        } else {
            round == details.view.round
        }
    }

    /// Wakes `subscriber` if the messages stored at `(height, round)`
    /// satisfy its quorum predicate.
    fn evaluate(&self, subscriber: &Subscriber, round: u64) {
        let details = &subscriber.details;
        let view = View::new(details.view.height, round);
        let messages = self.at_view(details.message_type, &view);
        if (details.has_quorum)(view.height, &messages, details.message_type) {
            subscriber.send.send(round);
        }
    }
}

/// Thread-safe store of inbound consensus messages, the source of truth the
/// round workers poll through their subscriptions.
#[derive(Default)]
pub struct MessageStore {
    inner: Arc<Mutex<Inner>>,
}

impl fmt::Debug for MessageStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageStore").finish_non_exhaustive()
    }
}

impl MessageStore {
    /// Stores a message. A message from a sender that already has one stored
    /// for the same view and type is dropped.
    pub fn add_message(&self, message: Message) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .map_mut(message.message_type())
            .entry(message.view.height)
            .or_default()
            .entry(message.view.round)
            .or_default()
            .entry(message.from.clone())
            .or_insert(message);
    }

    /// Removes every message with a height strictly below `height`.
    pub fn prune_by_height(&self, height: u64) {
        let mut inner = self.inner.lock().unwrap();
        for message_type in [
            MessageType::PrePrepare,
            MessageType::Prepare,
            MessageType::Commit,
            MessageType::RoundChange,
        ] {
            let map = inner.map_mut(message_type);
            *map = map.split_off(&height);
        }
    }

    /// Re-evaluates every subscription matching the message's type and view,
    /// waking those whose quorum predicate now holds.
    pub fn signal_event(&self, message: &Message) {
        let inner = self.inner.lock().unwrap();
        for subscriber in inner.subscribers.values() {
            let details = &subscriber.details;
            if details.message_type != message.message_type() {
                continue;
            }
            if details.view.height != message.view.height {
                continue;
            }
            if !Inner::round_matches(details, message.view.round) {
                continue;
            }
            inner.evaluate(subscriber, message.view.round);
        }
    }

    /// Messages of the given type stored at exactly `view` that pass
    /// `is_valid`.
    pub fn get_valid_messages(
        &self,
        view: &View,
        message_type: MessageType,
        is_valid: impl Fn(&Message) -> bool,
    ) -> Vec<Message> {
        let inner = self.inner.lock().unwrap();
        let mut messages = inner.at_view(message_type, view);
        messages.retain(|msg| is_valid(msg));
        messages
    }

    /// Looks for a set of round change messages at `height` that individually
    /// pass `is_valid_message` and collectively pass `is_valid_rcc` for their
    /// round. Rounds are scanned highest first, so the returned set belongs
    /// to the highest round currently justifiable.
    pub fn get_extended_rcc(
        &self,
        height: u64,
        is_valid_message: impl Fn(&Message) -> bool,
        is_valid_rcc: impl Fn(u64, &[Message]) -> bool,
    ) -> Option<Vec<Message>> {
        let inner = self.inner.lock().unwrap();
        let rounds = inner.round_change.get(&height)?;
        for (&round, senders) in rounds.iter().rev() {
            let messages: Vec<_> = senders
                .values()
                .filter(|msg| is_valid_message(msg))
                .cloned()
                .collect();
            if is_valid_rcc(round, &messages) {
                return Some(messages);
            }
        }
        None
    }

    /// The round change messages of the round at or above `min_round` that
    /// holds the most messages, preferring higher rounds on ties. Useful for
    /// detecting that the rest of the network has moved on to a higher round.
    pub fn get_most_round_change_messages(&self, min_round: u64, height: u64) -> Vec<Message> {
        let inner = self.inner.lock().unwrap();
        let Some(rounds) = inner.round_change.get(&height) else {
            return Vec::new();
        };
        rounds
            .range(min_round..)
            .max_by_key(|(round, senders)| (senders.len(), **round))
            .map(|(_, senders)| senders.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Registers a subscription. Messages already in the store are evaluated
    /// immediately, so a subscriber arriving after the interesting messages
    /// still gets woken.
    pub fn subscribe(&self, details: SubscriptionDetails) -> Subscription {
        let (send, recv) = ctx::channel::unbounded();
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_subscription_id;
        inner.next_subscription_id += 1;

        let subscriber = Subscriber { details, send };
        let rounds: Vec<u64> = inner
            .map(subscriber.details.message_type)
            .get(&subscriber.details.view.height)
            .map(|rounds| rounds.keys().copied().collect())
            .unwrap_or_default();
        for round in rounds {
            if Inner::round_matches(&subscriber.details, round) {
                inner.evaluate(&subscriber, round);
            }
        }
        inner.subscribers.insert(id, subscriber);

        Subscription {
            id,
            inner: self.inner.clone(),
            recv,
        }
    }

    /// Removes a subscription. Dropping the [`Subscription`] handle does the
    /// same thing.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.inner.lock().unwrap().subscribers.remove(&id);
    }
}
