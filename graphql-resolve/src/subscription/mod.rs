//! GraphQL subscriptions: triggers shared between subscribers with identical upstream
//! input, and the event loop that owns them.

use std::hash::Hasher;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use derivative::Derivative;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower::BoxError;

use crate::context::Context;
use crate::plan::GraphQLResponse;
use crate::plan::PostProcessing;
use crate::template::InputTemplate;

pub(crate) mod event_loop;
mod filter;

pub use filter::FieldFilter;
pub use filter::SubscriptionFilter;

use self::event_loop::Event;

/// A planned subscription.
#[derive(Clone, Debug)]
pub struct GraphQLSubscription {
    pub trigger: SubscriptionTrigger,
    /// Resolved once per update, starting from the update payload.
    pub response: GraphQLResponse,
    pub filter: Option<SubscriptionFilter>,
}

#[derive(Clone, Derivative)]
#[derivative(Debug)]
pub struct SubscriptionTrigger {
    pub input: InputTemplate,
    #[derivative(Debug = "ignore")]
    pub source: Arc<dyn SubscriptionDataSource>,
    /// Selects data and errors from every update.
    pub post_processing: PostProcessing,
}

/// An upstream able to push updates.
#[async_trait]
pub trait SubscriptionDataSource: Send + Sync {
    /// Starts the upstream subscription and returns once it is established. Updates
    /// are pushed through `updater` until it is cancelled.
    async fn start(&self, ctx: Context, input: Bytes, updater: Updater) -> Result<(), BoxError>;

    /// Feeds what identifies the upstream subscription into `hasher`. Subscriptions
    /// hashing alike share one trigger.
    fn unique_request_id(
        &self,
        _ctx: &Context,
        input: &[u8],
        hasher: &mut dyn Hasher,
    ) -> Result<(), BoxError> {
        hasher.write(input);
        Ok(())
    }
}

/// Receives the resolved updates of one subscriber, in order.
pub trait SubscriptionWriter: Send + 'static {
    fn write(&mut self, bytes: &[u8]) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()>;

    /// Keeps an idle connection alive.
    fn heartbeat(&mut self) -> io::Result<()> {
        self.write(b"{}")?;
        self.flush()
    }

    /// The subscription is over. Nothing is written afterwards.
    fn complete(&mut self);
}

/// Identifies a subscriber. Subscriptions started through
/// [`Resolver::resolve_graphql_subscription`](crate::Resolver::resolve_graphql_subscription)
/// get an internal id and are not affected by client removal.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct SubscriptionId {
    pub connection_id: u64,
    pub subscription_id: u64,
    pub(crate) internal: bool,
}

impl SubscriptionId {
    pub fn new(connection_id: u64, subscription_id: u64) -> Self {
        Self {
            connection_id,
            subscription_id,
            internal: false,
        }
    }
}

/// Handle a [`SubscriptionDataSource`] pushes updates through.
#[derive(Clone, Debug)]
pub struct Updater {
    trigger_id: u64,
    events: mpsc::Sender<Event>,
    cancellation: CancellationToken,
}

impl Updater {
    pub(crate) fn new(
        trigger_id: u64,
        events: mpsc::Sender<Event>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            trigger_id,
            events,
            cancellation,
        }
    }

    /// Delivers one upstream payload to every subscriber of the trigger.
    pub async fn update(&self, data: impl Into<Bytes>) {
        self.send(Event::TriggerUpdate {
            trigger_id: self.trigger_id,
            data: data.into(),
        })
        .await;
    }

    /// The upstream subscription ended. Subscribers complete once their pending updates
    /// are written.
    pub async fn done(&self) {
        self.send(Event::TriggerDone(self.trigger_id)).await;
    }

    /// Resolves when the trigger is shut down and the upstream should stop.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    async fn send(&self, event: Event) {
        tokio::select! {
            biased;
            _ = self.cancellation.cancelled() => {}
            _ = self.events.send(event) => {}
        }
    }
}
