use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use run_protocol::RunId;

use super::{ChannelEvent, ChannelStatus, EventKind, HandlerId, SubscriptionId};

pub(super) type Handler = Arc<dyn Fn(&ChannelEvent) + Send + Sync>;

/// Binds a handler to the subscription that registered it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct Scope {
    pub(super) run_id: RunId,
    pub(super) subscription: SubscriptionId,
}

struct HandlerEntry {
    id: HandlerId,
    kind: EventKind,
    scope: Option<Scope>,
    handler: Handler,
}

#[derive(Debug, PartialEq, Eq)]
pub(super) enum JoinEffect {
    Closed,
    /// Another subscription already holds the topic.
    AlreadyJoined,
    /// Not connected yet; flushed by the next connect.
    Queued,
    Send { epoch: u64 },
}

#[derive(Debug, PartialEq, Eq)]
pub(super) enum LeaveEffect {
    NotJoined,
    /// Other subscriptions still hold the topic.
    StillHeld { holders: usize },
    Removed,
    Send { epoch: u64 },
}

/// Bookkeeping shared by the channel handle and its driver task.
pub(super) struct Registry {
    status: ChannelStatus,
    /// Incremented on every established connection. Commands queued for an
    /// older connection are discarded by the driver.
    epoch: u64,
    /// Live subscriptions per joined topic. A topic is joined on the wire
    /// while its set is non-empty.
    topics: BTreeMap<RunId, BTreeSet<SubscriptionId>>,
    handlers: Vec<HandlerEntry>,
    next_handler: u64,
    next_subscription: u64,
}

impl Registry {
    pub(super) fn new() -> Self {
        Self {
            status: ChannelStatus::Connecting,
            epoch: 0,
            topics: BTreeMap::new(),
            handlers: Vec::new(),
            next_handler: 1,
            next_subscription: 1,
        }
    }

    pub(super) fn status(&self) -> ChannelStatus {
        self.status
    }

    pub(super) fn epoch(&self) -> u64 {
        self.epoch
    }

    pub(super) fn is_joined(&self, run_id: &RunId) -> bool {
        self.topics.contains_key(run_id)
    }

    pub(super) fn holders(&self, run_id: &RunId) -> usize {
        self.topics.get(run_id).map_or(0, BTreeSet::len)
    }

    pub(super) fn topics(&self) -> Vec<RunId> {
        self.topics.keys().cloned().collect()
    }

    pub(super) fn register(
        &mut self,
        kind: EventKind,
        scope: Option<Scope>,
        handler: Handler,
    ) -> HandlerId {
        let id = HandlerId(self.next_handler);
        self.next_handler += 1;
        self.handlers.push(HandlerEntry {
            id,
            kind,
            scope,
            handler,
        });
        id
    }

    /// Removed handlers are handed back so they are dropped after the lock
    /// is released; a handler may own the last channel handle.
    pub(super) fn remove(&mut self, id: HandlerId) -> Option<Handler> {
        let index = self.handlers.iter().position(|entry| entry.id == id)?;
        Some(self.handlers.remove(index).handler)
    }

    fn retire(&mut self, keep: impl Fn(&HandlerEntry) -> bool) -> Vec<Handler> {
        let (kept, retired): (Vec<HandlerEntry>, Vec<HandlerEntry>) =
            std::mem::take(&mut self.handlers)
                .into_iter()
                .partition(|entry| keep(entry));
        self.handlers = kept;
        retired.into_iter().map(|entry| entry.handler).collect()
    }

    pub(super) fn join(&mut self, run_id: RunId) -> (SubscriptionId, JoinEffect) {
        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;
        if self.status == ChannelStatus::Closed {
            return (id, JoinEffect::Closed);
        }
        let holders = self.topics.entry(run_id).or_default();
        let first = holders.is_empty();
        holders.insert(id);
        let effect = if !first {
            JoinEffect::AlreadyJoined
        } else if self.status == ChannelStatus::Connected {
            JoinEffect::Send { epoch: self.epoch }
        } else {
            JoinEffect::Queued
        };
        (id, effect)
    }

    /// Releases one subscription together with the handlers bound to it. The
    /// topic itself is left once its last subscription is released.
    pub(super) fn leave(
        &mut self,
        run_id: &RunId,
        subscription: SubscriptionId,
    ) -> (LeaveEffect, Vec<Handler>) {
        let retired = self.retire(|entry| {
            entry
                .scope
                .as_ref()
                .map_or(true, |scope| scope.subscription != subscription)
        });
        let Some(holders) = self.topics.get_mut(run_id) else {
            return (LeaveEffect::NotJoined, retired);
        };
        if !holders.remove(&subscription) {
            return (LeaveEffect::NotJoined, retired);
        }
        if !holders.is_empty() {
            let holders = holders.len();
            return (LeaveEffect::StillHeld { holders }, retired);
        }
        self.topics.remove(run_id);
        let effect = if self.status == ChannelStatus::Connected {
            LeaveEffect::Send { epoch: self.epoch }
        } else {
            LeaveEffect::Removed
        };
        (effect, retired)
    }

    /// Records a new connection and returns its epoch with the topics that
    /// must be (re)joined on it.
    pub(super) fn mark_connected(&mut self) -> (u64, Vec<RunId>) {
        self.epoch += 1;
        self.status = ChannelStatus::Connected;
        (self.epoch, self.topics())
    }

    pub(super) fn mark_down(&mut self) {
        if self.status != ChannelStatus::Closed {
            self.status = ChannelStatus::Reconnecting;
        }
    }

    pub(super) fn close(&mut self) -> Vec<Handler> {
        self.status = ChannelStatus::Closed;
        self.topics.clear();
        self.retire(|_| false)
    }

    pub(super) fn candidates(&self, event: &ChannelEvent) -> Vec<(HandlerId, Handler)> {
        let kind = event.kind();
        self.handlers
            .iter()
            .filter(|entry| entry.kind == kind)
            .filter(|entry| self.in_scope(entry.scope.as_ref(), event))
            .map(|entry| (entry.id, Arc::clone(&entry.handler)))
            .collect()
    }

    /// Checked right before each handler call so that teardown performed by
    /// an earlier handler of the same dispatch takes effect immediately.
    pub(super) fn is_live(&self, id: HandlerId, event: &ChannelEvent) -> bool {
        if self.status == ChannelStatus::Closed {
            return false;
        }
        self.handlers
            .iter()
            .find(|entry| entry.id == id)
            .map(|entry| self.in_scope(entry.scope.as_ref(), event))
            .unwrap_or(false)
    }

    fn holds(&self, scope: &Scope) -> bool {
        self.topics
            .get(&scope.run_id)
            .map_or(false, |holders| holders.contains(&scope.subscription))
    }

    fn in_scope(&self, scope: Option<&Scope>, event: &ChannelEvent) -> bool {
        let named = match event {
            ChannelEvent::Run(push) => push.run_id.as_ref(),
            _ => None,
        };
        match (scope, named) {
            (Some(scope), Some(named)) => scope.run_id == *named && self.holds(scope),
            (Some(scope), None) => self.holds(scope),
            (None, Some(named)) => self.topics.contains_key(named),
            (None, None) if event.is_run_event() => !self.topics.is_empty(),
            (None, None) => true,
        }
    }
}
