// src/core/events.rs

//! Defines the event bus: named domain events, a subscriber registry, and
//! the trigger pipeline that turns one event into one executor job per
//! subscriber.

use crate::core::errors::FabricError;
use crate::core::executor::Executor;
use crate::core::executor::procedure::{Action, Procedure};
use dashmap::DashMap;
use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;
use uuid::Uuid;

/// Event names the daemon itself fires. They are pre-registered so that
/// triggering one by name never fails, even with no subscribers yet.
pub const BUILTIN_EVENTS: &[&str] = &[
    "SERVER_LOST",
    "SERVER_PROMOTED",
    "SERVER_DEMOTED",
    "SHARD_SPLIT",
    "SHARD_MOVED",
];

pub static SERVER_LOST: Lazy<Event> = Lazy::new(|| Event::named("SERVER_LOST"));
pub static SERVER_PROMOTED: Lazy<Event> = Lazy::new(|| Event::named("SERVER_PROMOTED"));
pub static SERVER_DEMOTED: Lazy<Event> = Lazy::new(|| Event::named("SERVER_DEMOTED"));
pub static SHARD_SPLIT: Lazy<Event> = Lazy::new(|| Event::named("SHARD_SPLIT"));
pub static SHARD_MOVED: Lazy<Event> = Lazy::new(|| Event::named("SHARD_MOVED"));

static NEXT_ANON_EVENT: AtomicU64 = AtomicU64::new(1);
static NEXT_SUBSCRIBER: AtomicU64 = AtomicU64::new(1);

/// Arguments carried by a trigger, delivered verbatim to every subscriber.
pub type EventArgs = Vec<serde_json::Value>;

pub type SubscriberFn =
    Arc<dyn Fn(EventArgs) -> BoxFuture<'static, Result<(), FabricError>> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum EventKey {
    Named(String),
    Anonymous(u64),
}

/// A domain event. Named events compare by name; anonymous events are
/// distinct from every other event.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Event {
    key: EventKey,
}

impl Event {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            key: EventKey::Named(name.into()),
        }
    }

    pub fn anonymous() -> Self {
        Self {
            key: EventKey::Anonymous(NEXT_ANON_EVENT.fetch_add(1, Ordering::Relaxed)),
        }
    }

    pub fn name(&self) -> Option<&str> {
        match &self.key {
            EventKey::Named(name) => Some(name),
            EventKey::Anonymous(_) => None,
        }
    }

    fn label(&self) -> String {
        match &self.key {
            EventKey::Named(name) => name.clone(),
            EventKey::Anonymous(id) => format!("<anonymous:{id}>"),
        }
    }
}

/// Stable identity of a registered subscriber, used by `is_registered` and
/// `unregister`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

/// A subscriber: a forward callable and an optional undo invoked when the
/// subscriber's job is rolled back. Both halves share one identity.
#[derive(Clone)]
pub struct Subscriber {
    id: SubscriberId,
    name: String,
    forward: SubscriberFn,
    undo: Option<SubscriberFn>,
}

impl Subscriber {
    pub fn new<F, Fut>(name: impl Into<String>, forward: F) -> Self
    where
        F: Fn(EventArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), FabricError>> + Send + 'static,
    {
        Self {
            id: SubscriberId(NEXT_SUBSCRIBER.fetch_add(1, Ordering::Relaxed)),
            name: name.into(),
            forward: Arc::new(move |args| Box::pin(forward(args))),
            undo: None,
        }
    }

    pub fn with_undo<F, Fut>(mut self, undo: F) -> Self
    where
        F: Fn(EventArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), FabricError>> + Send + 'static,
    {
        self.undo = Some(Arc::new(move |args| Box::pin(undo(args))));
        self
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }
}

/// The central registry of events and their subscribers. Triggering an event
/// schedules one single-action procedure per subscriber on the executor, so
/// a raising subscriber never affects its peers.
pub struct EventBus {
    executor: Arc<Executor>,
    subscribers: DashMap<EventKey, Vec<Subscriber>>,
}

impl EventBus {
    pub fn new(executor: Arc<Executor>) -> Self {
        let bus = Self {
            executor,
            subscribers: DashMap::new(),
        };
        for name in BUILTIN_EVENTS {
            bus.subscribers
                .insert(EventKey::Named(name.to_string()), Vec::new());
        }
        bus
    }

    /// Resolves a trigger-by-name to an event. Only events that have been
    /// seen by this bus (builtin or registered) resolve.
    pub fn lookup(&self, name: &str) -> Result<Event, FabricError> {
        let key = EventKey::Named(name.to_string());
        if self.subscribers.contains_key(&key) {
            Ok(Event { key })
        } else {
            Err(FabricError::NotEvent(name.to_string()))
        }
    }

    /// Registers subscribers for an event, all-or-nothing. Registering an
    /// event the bus has not seen before makes it known.
    pub fn register(&self, event: &Event, subscribers: Vec<Subscriber>) -> Result<(), FabricError> {
        if subscribers.is_empty() {
            return Err(FabricError::NotCallable(event.label()));
        }
        let mut entry = self.subscribers.entry(event.key.clone()).or_default();
        for subscriber in subscribers {
            debug!(
                "registering subscriber '{}' for event {}",
                subscriber.name,
                event.label()
            );
            entry.push(subscriber);
        }
        Ok(())
    }

    pub fn is_registered(&self, event: &Event, id: SubscriberId) -> Result<bool, FabricError> {
        let entry = self
            .subscribers
            .get(&event.key)
            .ok_or_else(|| FabricError::NotEvent(event.label()))?;
        Ok(entry.iter().any(|s| s.id == id))
    }

    /// Removes one subscriber. Unknown event and unknown subscriber are
    /// distinct failures.
    pub fn unregister(&self, event: &Event, id: SubscriberId) -> Result<(), FabricError> {
        let mut entry = self
            .subscribers
            .get_mut(&event.key)
            .ok_or_else(|| FabricError::NotEvent(event.label()))?;
        let before = entry.len();
        entry.retain(|s| s.id != id);
        if entry.len() == before {
            return Err(FabricError::UnknownCallable(event.label()));
        }
        Ok(())
    }

    /// Schedules one job per registered subscriber and returns the procedure
    /// ids. Subscribers registered after the snapshot is taken are not
    /// invoked for this trigger.
    pub fn trigger(&self, event: &Event, args: EventArgs) -> Result<Vec<Uuid>, FabricError> {
        let snapshot: Vec<Subscriber> = self
            .subscribers
            .get(&event.key)
            .ok_or_else(|| FabricError::NotEvent(event.label()))?
            .clone();

        let mut jobs = Vec::with_capacity(snapshot.len());
        for subscriber in snapshot {
            let forward = subscriber.forward.clone();
            let forward_args = args.clone();
            let mut action = Action::new(subscriber.name.clone(), move || {
                let forward = forward.clone();
                let args = forward_args.clone();
                async move { forward(args).await.map(|_| None) }
            });
            if let Some(undo) = subscriber.undo.clone() {
                let undo_args = args.clone();
                action = action.with_undo(move || {
                    let undo = undo.clone();
                    let args = undo_args.clone();
                    async move { undo(args).await.map(|_| None) }
                });
            }
            let procedure = Procedure::new(format!(
                "event {} -> {}",
                event.label(),
                subscriber.name
            ))
            .push(action);
            jobs.push(self.executor.schedule(procedure)?);
        }
        debug!(
            "triggered event {} with {} job(s)",
            event.label(),
            jobs.len()
        );
        Ok(jobs)
    }

    /// Triggers an event by its registered name.
    pub fn trigger_by_name(&self, name: &str, args: EventArgs) -> Result<Vec<Uuid>, FabricError> {
        let event = self.lookup(name)?;
        self.trigger(&event, args)
    }
}
