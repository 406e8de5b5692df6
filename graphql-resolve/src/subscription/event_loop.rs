//! The task owning every trigger and subscriber.
//!
//! Nothing else touches trigger state: callers, updaters and subscriber workers talk to
//! the loop through [`Event`]s, handled strictly in arrival order. Each subscriber has a
//! worker task fed through its own queue, so updates reach one client in order while the
//! loop fans out to many.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use indexmap::IndexMap;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio::time::Interval;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::GraphQLSubscription;
use super::SubscriptionFilter;
use super::SubscriptionId;
use super::SubscriptionWriter;
use super::Updater;
use crate::context::Context;
use crate::error::ResolveError;
use crate::graphql;
use crate::resolvable::Resolvable;
use crate::singleflight::SingleFlight;
use crate::store::DocumentStore;
use crate::store::NodeId;
use crate::template::RenderScope;

pub(crate) enum Event {
    AddSubscription(Box<AddSubscription>),
    RemoveSubscription(SubscriptionId),
    /// Removes every subscription of a client connection.
    RemoveClient(u64),
    TriggerUpdate { trigger_id: u64, data: Bytes },
    TriggerDone(u64),
    TriggerInitialized(u64),
    /// Tears a trigger down. `reason` is set when the upstream failed to start.
    TriggerShutdown { trigger_id: u64, reason: Option<String> },
}

pub(crate) struct AddSubscription {
    pub(crate) trigger_id: u64,
    pub(crate) id: SubscriptionId,
    pub(crate) ctx: Context,
    pub(crate) input: Bytes,
    pub(crate) subscription: Arc<GraphQLSubscription>,
    pub(crate) writer: Box<dyn SubscriptionWriter>,
    /// Cancelled once the subscriber has written its last frame.
    pub(crate) completed: CancellationToken,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct Settings {
    pub(crate) heartbeat_interval: Option<Duration>,
    pub(crate) fetch_timeout: Duration,
}

struct Trigger {
    cancellation: CancellationToken,
    initialized: bool,
    subscribers: IndexMap<SubscriptionId, Subscriber>,
}

struct Subscriber {
    ctx: Context,
    filter: Option<SubscriptionFilter>,
    variables: DocumentStore,
    variables_root: Option<NodeId>,
    work: mpsc::UnboundedSender<Work>,
    completed: CancellationToken,
}

enum Work {
    Update(Bytes),
    /// Written as is.
    Message(Bytes),
    /// Last item of every queue.
    Complete,
}

impl Subscriber {
    fn complete(self) {
        // a worker that already stopped has nothing left to complete
        let _ = self.work.send(Work::Complete);
    }
}

pub(crate) struct EventLoop {
    triggers: HashMap<u64, Trigger>,
    events: mpsc::Sender<Event>,
    shutdown: CancellationToken,
    single_flight: Arc<SingleFlight>,
    settings: Settings,
}

impl EventLoop {
    pub(crate) fn new(
        events: mpsc::Sender<Event>,
        shutdown: CancellationToken,
        single_flight: Arc<SingleFlight>,
        settings: Settings,
    ) -> Self {
        Self {
            triggers: HashMap::new(),
            events,
            shutdown,
            single_flight,
            settings,
        }
    }

    pub(crate) async fn run(mut self, mut events: mpsc::Receiver<Event>) {
        let shutdown = self.shutdown.clone();
        async move {
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => self.handle(event),
                        None => break,
                    },
                }
            }
            self.handle_shutdown();
        }
        .instrument(tracing::info_span!("subscription_event_loop"))
        .await
    }

    fn handle(&mut self, event: Event) {
        match event {
            Event::AddSubscription(add) => self.handle_add_subscription(*add),
            Event::RemoveSubscription(id) => self.handle_remove_subscription(id),
            Event::RemoveClient(connection_id) => self.handle_remove_client(connection_id),
            Event::TriggerUpdate { trigger_id, data } => self.handle_trigger_update(trigger_id, data),
            Event::TriggerDone(trigger_id) => {
                tracing::debug!(trigger_id, "trigger done");
                self.shutdown_trigger(trigger_id);
            }
            Event::TriggerInitialized(trigger_id) => {
                if let Some(trigger) = self.triggers.get_mut(&trigger_id) {
                    trigger.initialized = true;
                    tracing::debug!(trigger_id, "trigger started");
                }
            }
            Event::TriggerShutdown { trigger_id, reason } => {
                if let Some(reason) = reason {
                    self.fail_trigger(trigger_id, &reason);
                }
                self.shutdown_trigger(trigger_id);
            }
        }
    }

    fn handle_add_subscription(&mut self, add: AddSubscription) {
        let AddSubscription {
            trigger_id,
            id,
            ctx,
            input,
            subscription,
            writer,
            completed,
        } = add;
        let subscriber = self.spawn_subscriber(id, &ctx, subscription.clone(), writer, completed);

        if let Some(trigger) = self.triggers.get_mut(&trigger_id) {
            tracing::debug!(trigger_id, ?id, "subscriber joined trigger");
            trigger.subscribers.insert(id, subscriber);
            return;
        }

        let cancellation = self.shutdown.child_token();
        let mut trigger = Trigger {
            cancellation: cancellation.clone(),
            initialized: false,
            subscribers: IndexMap::new(),
        };
        trigger.subscribers.insert(id, subscriber);
        self.triggers.insert(trigger_id, trigger);
        tracing::debug!(trigger_id, ?id, "starting trigger");

        let updater = Updater::new(trigger_id, self.events.clone(), cancellation);
        let source = subscription.trigger.source.clone();
        let events = self.events.clone();
        let start_ctx = ctx.detached_clone();
        tokio::spawn(
            async move {
                let event = match source.start(start_ctx, input, updater).await {
                    Ok(()) => Event::TriggerInitialized(trigger_id),
                    Err(err) => Event::TriggerShutdown {
                        trigger_id,
                        reason: Some(err.to_string()),
                    },
                };
                let _ = events.send(event).await;
            }
            .instrument(tracing::debug_span!("subscription_start", trigger_id)),
        );
    }

    fn spawn_subscriber(
        &self,
        id: SubscriptionId,
        ctx: &Context,
        subscription: Arc<GraphQLSubscription>,
        writer: Box<dyn SubscriptionWriter>,
        completed: CancellationToken,
    ) -> Subscriber {
        let (work, queue) = mpsc::unbounded_channel();
        let worker = Worker {
            id,
            ctx: ctx.clone(),
            subscription: subscription.clone(),
            writer,
            single_flight: self.single_flight.clone(),
            events: self.events.clone(),
            settings: self.settings,
            completed: completed.clone(),
            failed: false,
        };
        tokio::spawn(
            worker
                .run(queue)
                .instrument(tracing::debug_span!("subscriber", connection_id = id.connection_id, subscription_id = id.subscription_id)),
        );

        let mut variables = DocumentStore::new();
        let variables_root = match serde_json::to_value(&ctx.variables) {
            Ok(value) => Some(variables.append_value(&value)),
            Err(err) => {
                failfast_debug!("subscription variables are not JSON: {}", err);
                None
            }
        };
        Subscriber {
            ctx: ctx.clone(),
            filter: subscription.filter.clone(),
            variables,
            variables_root,
            work,
            completed,
        }
    }

    fn handle_trigger_update(&mut self, trigger_id: u64, data: Bytes) {
        let Some(trigger) = self.triggers.get(&trigger_id) else {
            return;
        };
        let parsed = trigger
            .subscribers
            .values()
            .any(|subscriber| subscriber.filter.is_some())
            .then(|| serde_json::from_slice::<serde_json::Value>(&data).ok())
            .flatten();
        let mut buf = Vec::new();
        for subscriber in trigger.subscribers.values() {
            if self.shutdown.is_cancelled() {
                return;
            }
            if subscriber.ctx.is_cancelled() || subscriber.completed.is_cancelled() {
                continue;
            }
            if let Some(filter) = &subscriber.filter {
                let Some(update) = &parsed else {
                    continue;
                };
                let scope = RenderScope {
                    store: &subscriber.variables,
                    variables: subscriber.variables_root,
                    headers: &subscriber.ctx.headers,
                };
                match filter.skip_event(&scope, update, &mut buf) {
                    Ok(true) => continue,
                    Ok(false) => {}
                    Err(err) => {
                        let _ = subscriber.work.send(Work::Message(error_response(&err.to_string())));
                        continue;
                    }
                }
            }
            let _ = subscriber.work.send(Work::Update(data.clone()));
        }
    }

    fn handle_remove_subscription(&mut self, id: SubscriptionId) {
        self.remove_subscribers(|subscriber| *subscriber == id);
    }

    fn handle_remove_client(&mut self, connection_id: u64) {
        self.remove_subscribers(|id| id.connection_id == connection_id && !id.internal);
    }

    fn remove_subscribers(&mut self, matches: impl Fn(&SubscriptionId) -> bool) {
        let mut emptied = Vec::new();
        for (trigger_id, trigger) in &mut self.triggers {
            let removed: Vec<_> = trigger
                .subscribers
                .keys()
                .filter(|id| matches(id))
                .copied()
                .collect();
            if removed.is_empty() {
                continue;
            }
            for id in removed {
                if let Some(subscriber) = trigger.subscribers.shift_remove(&id) {
                    tracing::debug!(trigger_id, ?id, "subscriber removed");
                    subscriber.complete();
                }
            }
            if trigger.subscribers.is_empty() {
                emptied.push(*trigger_id);
            }
        }
        for trigger_id in emptied {
            self.shutdown_trigger(trigger_id);
        }
    }

    fn fail_trigger(&mut self, trigger_id: u64, reason: &str) {
        let Some(trigger) = self.triggers.get(&trigger_id) else {
            return;
        };
        tracing::warn!(trigger_id, reason, "subscription failed to start");
        let message = error_response(&format!("failed to start subscription: {reason}"));
        for subscriber in trigger.subscribers.values() {
            let _ = subscriber.work.send(Work::Message(message.clone()));
        }
    }

    fn shutdown_trigger(&mut self, trigger_id: u64) {
        let Some(trigger) = self.triggers.remove(&trigger_id) else {
            return;
        };
        trigger.cancellation.cancel();
        for (_, subscriber) in trigger.subscribers {
            subscriber.complete();
        }
        tracing::debug!(trigger_id, initialized = trigger.initialized, "trigger shut down");
    }

    fn handle_shutdown(&mut self) {
        let trigger_ids: Vec<_> = self.triggers.keys().copied().collect();
        for trigger_id in trigger_ids {
            self.shutdown_trigger(trigger_id);
        }
    }
}

/// `{"errors":[{"message":...}]}`
pub(crate) fn error_response(message: &str) -> Bytes {
    let error = graphql::Error::builder().message(message).build();
    Bytes::from(format!(r#"{{"errors":[{}]}}"#, error.to_json()))
}

/// Writes the updates of one subscriber.
struct Worker {
    id: SubscriptionId,
    ctx: Context,
    subscription: Arc<GraphQLSubscription>,
    writer: Box<dyn SubscriptionWriter>,
    single_flight: Arc<SingleFlight>,
    events: mpsc::Sender<Event>,
    settings: Settings,
    completed: CancellationToken,
    failed: bool,
}

impl Worker {
    async fn run(mut self, mut queue: mpsc::UnboundedReceiver<Work>) {
        let mut heartbeat = self.settings.heartbeat_interval.map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        loop {
            tokio::select! {
                biased;
                work = queue.recv() => {
                    match work {
                        Some(Work::Update(data)) => self.write_update(&data).await,
                        Some(Work::Message(message)) => self.write(&message),
                        Some(Work::Complete) | None => break,
                    }
                    if let Some(interval) = heartbeat.as_mut() {
                        interval.reset();
                    }
                }
                _ = tick(&mut heartbeat) => {
                    if !self.failed && let Err(err) = self.writer.heartbeat() {
                        self.unsubscribe(&err);
                    }
                }
            }
        }
        self.writer.complete();
        self.completed.cancel();
    }

    async fn write_update(&mut self, data: &Bytes) {
        if self.failed || self.ctx.is_cancelled() {
            return;
        }
        let mut out = Vec::new();
        let resolved = tokio::time::timeout(
            self.settings.fetch_timeout,
            resolve_update(&self.ctx, &self.subscription, &self.single_flight, data, &mut out),
        )
        .await;
        match resolved {
            Ok(Ok(())) => self.write(&out),
            Ok(Err(err)) => tracing::debug!(error = %err, "subscription update not resolved"),
            Err(_) => tracing::warn!(
                timeout = ?self.settings.fetch_timeout,
                "subscription update timed out"
            ),
        }
    }

    fn write(&mut self, bytes: &[u8]) {
        if self.failed {
            return;
        }
        if let Err(err) = self.writer.write(bytes).and_then(|()| self.writer.flush()) {
            self.unsubscribe(&err);
        }
    }

    /// The transport is gone: stop writing and let the loop drop this subscriber.
    fn unsubscribe(&mut self, err: &std::io::Error) {
        tracing::warn!(error = %err, id = ?self.id, "subscription write failed, unsubscribing");
        self.failed = true;
        let events = self.events.clone();
        let id = self.id;
        tokio::spawn(async move {
            let _ = events.send(Event::RemoveSubscription(id)).await;
        });
    }
}

async fn tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn resolve_update(
    ctx: &Context,
    subscription: &GraphQLSubscription,
    single_flight: &SingleFlight,
    data: &[u8],
    out: &mut Vec<u8>,
) -> Result<(), ResolveError> {
    let root = &subscription.response.data;
    let mut resolvable =
        Resolvable::init_subscription(ctx, data, &subscription.trigger.post_processing)?;
    if !ctx.execution_options.skip_loader {
        resolvable.load(ctx, single_flight, root).await?;
    }
    resolvable.resolve(ctx, root, out)
}
