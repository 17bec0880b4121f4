use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::session::{EventHandler, Options, SubscriptionHandle};

/// Caller-visible subscription identifier, stable across reconnects.
///
/// Generated ids are 64 random bits rendered as 16 lowercase hex digits.
/// Collisions are not checked for.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(String);

impl SubscriptionId {
    pub fn generate() -> Self {
        Self(format!("{:016x}", rand::random::<u64>()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SubscriptionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for SubscriptionId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

/// Everything needed to re-establish a subscription on a new session
#[derive(Clone)]
pub struct SubscriptionRecord {
    pub topic: String,
    pub handler: EventHandler,
    pub options: Options,
    /// Set each time the subscription is sent to a session
    issuance: Option<Issuance>,
    /// Confirmed handle on the session of `issuance`
    handle: Option<SubscriptionHandle>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Issuance {
    generation: u64,
    ticket: u64,
}

impl SubscriptionRecord {
    pub fn new(topic: impl Into<String>, handler: EventHandler, options: Options) -> Self {
        Self {
            topic: topic.into(),
            handler,
            options,
            issuance: None,
            handle: None,
        }
    }

    /// Handle usable on the session of `generation`, if confirmed there.
    pub(crate) fn live_handle(&self, generation: u64) -> Option<SubscriptionHandle> {
        match self.issuance {
            Some(issuance) if issuance.generation == generation => self.handle,
            _ => None,
        }
    }
}

impl fmt::Debug for SubscriptionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRecord")
            .field("topic", &self.topic)
            .field("options", &self.options)
            .field("issuance", &self.issuance)
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

/// A subscription request about to be sent to a session
pub(crate) struct IssuedSubscription {
    pub(crate) sub_id: SubscriptionId,
    pub(crate) ticket: u64,
    pub(crate) topic: String,
    pub(crate) handler: EventHandler,
    pub(crate) options: Options,
}

/// Subscriptions to keep alive across reconnects, keyed by caller id
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    records: BTreeMap<SubscriptionId, SubscriptionRecord>,
    next_ticket: u64,
}

impl SubscriptionRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Stores `record`, returning the one it replaced.
    pub(crate) fn insert(
        &mut self,
        sub_id: SubscriptionId,
        record: SubscriptionRecord,
    ) -> Option<SubscriptionRecord> {
        self.records.insert(sub_id, record)
    }

    pub(crate) fn get(&self, sub_id: &SubscriptionId) -> Option<&SubscriptionRecord> {
        self.records.get(sub_id)
    }

    pub(crate) fn remove(&mut self, sub_id: &SubscriptionId) -> Option<SubscriptionRecord> {
        self.records.remove(sub_id)
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }

    pub(crate) fn ids(&self) -> Vec<SubscriptionId> {
        self.records.keys().cloned().collect()
    }

    /// Marks the record as sent to the session of `generation` and hands back
    /// what the session needs. Any previously confirmed handle is forgotten.
    pub(crate) fn issue(
        &mut self,
        sub_id: &SubscriptionId,
        generation: u64,
    ) -> Option<IssuedSubscription> {
        let record = self.records.get_mut(sub_id)?;
        self.next_ticket += 1;
        let ticket = self.next_ticket;

        record.issuance = Some(Issuance { generation, ticket });
        record.handle = None;

        Some(IssuedSubscription {
            sub_id: sub_id.clone(),
            ticket,
            topic: record.topic.clone(),
            handler: record.handler.clone(),
            options: record.options.clone(),
        })
    }

    /// Issues every record not yet sent to the session of `generation`.
    pub(crate) fn replay(&mut self, generation: u64) -> Vec<IssuedSubscription> {
        let stale: Vec<SubscriptionId> = self
            .records
            .iter()
            .filter(|(_, record)| {
                record
                    .issuance
                    .is_none_or(|issuance| issuance.generation != generation)
            })
            .map(|(sub_id, _)| sub_id.clone())
            .collect();

        stale
            .iter()
            .filter_map(|sub_id| self.issue(sub_id, generation))
            .collect()
    }

    /// Records the handle for the issuance identified by `ticket`.
    ///
    /// Returns `false` when the record was removed or re-issued meanwhile;
    /// the handle then belongs to nobody and should be released.
    pub(crate) fn confirm(
        &mut self,
        sub_id: &SubscriptionId,
        ticket: u64,
        handle: SubscriptionHandle,
    ) -> bool {
        match self.records.get_mut(sub_id) {
            Some(record) if record.issuance.is_some_and(|issuance| issuance.ticket == ticket) => {
                record.handle = Some(handle);
                true
            }
            _ => false,
        }
    }

    /// Drops the record if its latest issuance is `ticket`.
    pub(crate) fn discard(&mut self, sub_id: &SubscriptionId, ticket: u64) -> bool {
        let current = self
            .records
            .get(sub_id)
            .and_then(|record| record.issuance)
            .is_some_and(|issuance| issuance.ticket == ticket);

        if current {
            self.records.remove(sub_id);
        }
        current
    }

    /// Removes the record once `handle` has been unsubscribed, unless the
    /// subscription was re-established under another handle meanwhile.
    pub(crate) fn remove_if_handle(
        &mut self,
        sub_id: &SubscriptionId,
        handle: SubscriptionHandle,
    ) -> bool {
        let matches = self
            .records
            .get(sub_id)
            .is_some_and(|record| record.handle == Some(handle));

        if matches {
            self.records.remove(sub_id);
        }
        matches
    }
}
