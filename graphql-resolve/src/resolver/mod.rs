//! Entry points: resolving responses and serving subscriptions.

use std::hash::BuildHasher;
use std::hash::Hasher;
use std::io;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use bytes::Bytes;
use static_assertions::assert_impl_all;
use tokio::sync::Semaphore;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::cache::InMemoryLoaderCache;
use crate::configuration::ResolverConfig;
use crate::context::Context;
use crate::error::RenderError;
use crate::error::ResolveError;
use crate::plan::GraphQLResponse;
use crate::resolvable::Resolvable;
use crate::singleflight::SingleFlight;
use crate::store::DocumentStore;
use crate::subscription::GraphQLSubscription;
use crate::subscription::SubscriptionId;
use crate::subscription::SubscriptionWriter;
use crate::subscription::event_loop::AddSubscription;
use crate::subscription::event_loop::Event;
use crate::subscription::event_loop::EventLoop;
use crate::subscription::event_loop::Settings;
use crate::template::RenderScope;

mod multipart;

pub use multipart::MultipartWriter;

/// Where a resolved response is written.
pub trait ResponseWriter: Send {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Writers able to send a response in several parts return themselves.
    fn as_flush_writer(&mut self) -> Option<&mut dyn FlushWriter> {
        None
    }
}

/// A writer that can end a part of an incremental response.
pub trait FlushWriter: ResponseWriter {
    fn flush(&mut self) -> io::Result<()>;
}

impl ResponseWriter for Vec<u8> {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.extend_from_slice(bytes);
        Ok(())
    }
}

/// Runs response trees against their data sources and serves subscriptions.
///
/// Creating a resolver spawns the subscription event loop, so it must happen inside a
/// tokio runtime. Dropping it shuts every subscription down.
pub struct Resolver {
    config: ResolverConfig,
    concurrency: Semaphore,
    single_flight: Arc<SingleFlight>,
    l2_cache: Option<(String, Arc<InMemoryLoaderCache>)>,
    events: mpsc::Sender<Event>,
    shutdown: CancellationToken,
    connection_ids: AtomicU64,
    hasher: ahash::RandomState,
}

impl Resolver {
    pub fn new(config: ResolverConfig) -> Self {
        let single_flight = Arc::new(SingleFlight::new(config.single_flight_shards));
        let (events, receiver) = mpsc::channel(config.subscription_update_buffer.max(1));
        let shutdown = CancellationToken::new();
        let event_loop = EventLoop::new(
            events.clone(),
            shutdown.clone(),
            single_flight.clone(),
            Settings {
                heartbeat_interval: config.heartbeat_interval,
                fetch_timeout: config.subscription_fetch_timeout,
            },
        );
        tokio::spawn(event_loop.run(receiver));

        let l2_cache = config.l2_cache.as_ref().map(|l2| {
            let mut cache = InMemoryLoaderCache::new(l2.capacity);
            if let Some(ttl) = l2.default_ttl {
                cache = cache.with_default_ttl(ttl);
            }
            (l2.name.clone(), Arc::new(cache))
        });

        Self {
            concurrency: Semaphore::new(config.max_concurrency.max(1)),
            single_flight,
            l2_cache,
            events,
            shutdown,
            connection_ids: AtomicU64::new(0),
            hasher: ahash::RandomState::new(),
            config,
        }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// A request context with the configured L2 cache registered.
    pub fn new_context(&self) -> Context {
        let ctx = Context::new();
        match &self.l2_cache {
            Some((name, cache)) => ctx.with_loader_cache(name.clone(), cache.clone()),
            None => ctx,
        }
    }

    /// Loads `response` starting from `initial_data` and writes the result. Deferred
    /// parts are written as separate parts afterwards, which requires a writer
    /// supporting [`FlushWriter`].
    pub async fn resolve_graphql_response(
        &self,
        ctx: &Context,
        response: &GraphQLResponse,
        initial_data: Option<&[u8]>,
        writer: &mut dyn ResponseWriter,
    ) -> Result<(), ResolveError> {
        let span = tracing::info_span!("resolve", operation_type = response.operation_type.as_str());
        async {
            if !response.deferred.is_empty() && writer.as_flush_writer().is_none() {
                return Err(ResolveError::DeferredRequiresFlushingWriter);
            }
            let _permit = tokio::select! {
                biased;
                _ = ctx.cancellation_token().cancelled() => return Err(ResolveError::Cancelled),
                permit = self.concurrency.acquire() => permit.map_err(|_| ResolveError::ResolverClosed)?,
            };

            let mut resolvable = Resolvable::init(ctx, initial_data, response.operation_type)?;
            if !ctx.execution_options.skip_loader {
                resolvable
                    .load(ctx, &self.single_flight, &response.data)
                    .await?;
            }
            let mut out = Vec::new();
            resolvable.resolve(ctx, &response.data, &mut out)?;
            writer.write_all(&out)?;

            let Some(writer) = writer.as_flush_writer() else {
                return Ok(());
            };
            writer.flush()?;
            for deferred in &response.deferred {
                tracing::debug!(label = ?deferred.label, "resolving deferred part");
                // errors of earlier parts have been written already
                resolvable.clear_errors();
                if !ctx.execution_options.skip_loader {
                    resolvable
                        .load(ctx, &self.single_flight, &deferred.data)
                        .await?;
                }
                out.clear();
                resolvable.resolve(ctx, &deferred.data, &mut out)?;
                writer.write_all(&out)?;
                writer.flush()?;
            }
            Ok(())
        }
        .instrument(span)
        .await
    }

    /// Serves a subscription until the client goes away, the upstream is done or the
    /// resolver shuts down.
    pub async fn resolve_graphql_subscription(
        &self,
        ctx: &Context,
        subscription: Arc<GraphQLSubscription>,
        writer: Box<dyn SubscriptionWriter>,
    ) -> Result<(), ResolveError> {
        let id = SubscriptionId {
            connection_id: self.connection_ids.fetch_add(1, Ordering::Relaxed) + 1,
            subscription_id: 0,
            internal: true,
        };
        let Some(completed) = self.subscribe(ctx, subscription, writer, id).await? else {
            return Ok(());
        };
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return Err(ResolveError::ResolverClosed),
            _ = completed.cancelled() => return Ok(()),
            _ = ctx.cancellation_token().cancelled() => {}
        }
        self.send(Event::RemoveSubscription(id)).await
    }

    /// Registers a subscription and returns right away. The caller removes it with
    /// [`Resolver::async_unsubscribe_subscription`] or
    /// [`Resolver::async_unsubscribe_client`].
    pub async fn async_resolve_graphql_subscription(
        &self,
        ctx: &Context,
        subscription: Arc<GraphQLSubscription>,
        writer: Box<dyn SubscriptionWriter>,
        id: SubscriptionId,
    ) -> Result<(), ResolveError> {
        self.subscribe(ctx, subscription, writer, id).await.map(|_| ())
    }

    pub async fn async_unsubscribe_subscription(&self, id: SubscriptionId) -> Result<(), ResolveError> {
        self.send(Event::RemoveSubscription(id)).await
    }

    pub async fn async_unsubscribe_client(&self, connection_id: u64) -> Result<(), ResolveError> {
        self.send(Event::RemoveClient(connection_id)).await
    }

    /// Completes every subscription and stops the event loop.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn subscribe(
        &self,
        ctx: &Context,
        subscription: Arc<GraphQLSubscription>,
        mut writer: Box<dyn SubscriptionWriter>,
        id: SubscriptionId,
    ) -> Result<Option<CancellationToken>, ResolveError> {
        let input = match subscription_input(ctx, &subscription) {
            Ok(input) => input,
            Err(err) => {
                tracing::debug!(error = %err, "subscription input not rendered");
                write_flush_complete(writer.as_mut(), br#"{"errors":[{"message":"invalid input"}]}"#)?;
                return Ok(None);
            }
        };
        let mut hasher = self.hasher.build_hasher();
        if let Err(err) = subscription
            .trigger
            .source
            .unique_request_id(ctx, &input, &mut hasher)
        {
            tracing::debug!(error = %err, "subscription request id not computed");
            write_flush_complete(writer.as_mut(), br#"{"errors":[{"message":"unable to resolve"}]}"#)?;
            return Ok(None);
        }
        let completed = CancellationToken::new();
        self.send(Event::AddSubscription(Box::new(AddSubscription {
            trigger_id: hasher.finish(),
            id,
            ctx: ctx.clone(),
            input: Bytes::from(input),
            subscription,
            writer,
            completed: completed.clone(),
        })))
        .await?;
        Ok(Some(completed))
    }

    async fn send(&self, event: Event) -> Result<(), ResolveError> {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(ResolveError::ResolverClosed),
            sent = self.events.send(event) => sent.map_err(|_| ResolveError::ResolverClosed),
        }
    }
}

assert_impl_all!(Resolver: Send, Sync);

impl Drop for Resolver {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Renders the trigger input, then adds the connection `initial_payload` and the
/// request extensions as `body.extensions`.
fn subscription_input(ctx: &Context, subscription: &GraphQLSubscription) -> Result<Vec<u8>, ResolveError> {
    let mut store = DocumentStore::new();
    let variables = if ctx.variables.is_empty() {
        None
    } else {
        Some(store.append_value(&serde_json::to_value(&ctx.variables)?))
    };
    let scope = RenderScope {
        store: &store,
        variables,
        headers: &ctx.headers,
    };
    let mut input = Vec::new();
    subscription.trigger.input.render(&scope, None, &mut input)?;

    let initial_payload = ctx.initial_payload.as_ref().filter(|payload| !payload.is_empty());
    if initial_payload.is_none() && ctx.extensions.is_none() {
        return Ok(input);
    }
    let mut value: serde_json::Value = serde_json::from_slice(&input)?;
    let Some(object) = value.as_object_mut() else {
        return Err(RenderError::Unrenderable {
            reason: "subscription input is not an object".to_string(),
        }
        .into());
    };
    if let Some(payload) = initial_payload {
        object.insert("initial_payload".to_string(), serde_json::from_slice(payload)?);
    }
    if let Some(extensions) = &ctx.extensions {
        let extensions = serde_json::from_slice(extensions)?;
        match object
            .entry("body")
            .or_insert_with(|| serde_json::json!({}))
            .as_object_mut()
        {
            Some(body) => {
                body.insert("extensions".to_string(), extensions);
            }
            None => {
                return Err(RenderError::Unrenderable {
                    reason: "subscription input body is not an object".to_string(),
                }
                .into());
            }
        }
    }
    Ok(serde_json::to_vec(&value)?)
}

fn write_flush_complete(writer: &mut dyn SubscriptionWriter, message: &[u8]) -> Result<(), ResolveError> {
    writer.write(message)?;
    writer.flush()?;
    writer.complete();
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use async_trait::async_trait;
    use http::HeaderMap;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use tower::BoxError;

    use super::*;
    use crate::plan::DataSource;
    use crate::plan::DeferredResponse;
    use crate::plan::Fetch;
    use crate::plan::FetchConfiguration;
    use crate::plan::Field;
    use crate::plan::Node;
    use crate::plan::Object;
    use crate::plan::PostProcessing;
    use crate::plan::Scalar;
    use crate::plan::SingleFetch;
    use crate::subscription::SubscriptionDataSource;
    use crate::subscription::SubscriptionTrigger;
    use crate::subscription::Updater;
    use crate::template::InputTemplate;
    use crate::template::JsonVariableRenderer;
    use crate::template::TemplateSegment;
    use crate::template::Variable;

    struct Static(&'static str);

    #[async_trait]
    impl DataSource for Static {
        async fn load(&self, _headers: &HeaderMap, _input: Bytes) -> Result<Bytes, BoxError> {
            Ok(Bytes::from_static(self.0.as_bytes()))
        }
    }

    fn fetch(response: &'static str) -> Fetch {
        Fetch::single(SingleFetch {
            input: InputTemplate::new(vec![TemplateSegment::text(r#"{"query":"{hero}"}"#)]),
            config: FetchConfiguration::builder()
                .data_source(Arc::new(Static(response)) as Arc<dyn DataSource>)
                .post_processing(PostProcessing::data_and_errors(["data"]))
                .build(),
        })
    }

    fn string(name: &str) -> Field {
        Field::new(name, Node::String(Scalar::at([name])))
    }

    /// Collects everything written to a subscriber.
    #[derive(Clone, Default)]
    struct Recorder {
        messages: Arc<Mutex<Vec<String>>>,
        pending: Arc<Mutex<Vec<u8>>>,
        completed: Arc<AtomicUsize>,
    }

    impl Recorder {
        fn messages(&self) -> Vec<String> {
            self.messages.lock().clone()
        }

        fn completions(&self) -> usize {
            self.completed.load(Ordering::SeqCst)
        }
    }

    impl SubscriptionWriter for Recorder {
        fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
            self.pending.lock().extend_from_slice(bytes);
            Ok(())
        }

        fn flush(&mut self) -> io::Result<()> {
            let pending = std::mem::take(&mut *self.pending.lock());
            self.messages
                .lock()
                .push(String::from_utf8_lossy(&pending).into_owned());
            Ok(())
        }

        fn complete(&mut self) {
            self.completed.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Pushes the given updates once started, then reports done.
    struct Counter {
        updates: Vec<&'static str>,
        starts: AtomicUsize,
        inputs: Mutex<Vec<String>>,
        fail: bool,
    }

    impl Counter {
        fn new(updates: Vec<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                updates,
                starts: AtomicUsize::new(0),
                inputs: Mutex::default(),
                fail: false,
            })
        }
    }

    #[async_trait]
    impl SubscriptionDataSource for Counter {
        async fn start(&self, _ctx: Context, input: Bytes, updater: Updater) -> Result<(), BoxError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            self.inputs
                .lock()
                .push(String::from_utf8_lossy(&input).into_owned());
            if self.fail {
                return Err("connection refused".into());
            }
            let updates = self.updates.clone();
            tokio::spawn(async move {
                // give every subscriber time to join
                tokio::time::sleep(Duration::from_millis(50)).await;
                for update in updates {
                    updater.update(update).await;
                }
                updater.done().await;
            });
            Ok(())
        }
    }

    /// Starts and never pushes anything.
    struct Silent;

    #[async_trait]
    impl SubscriptionDataSource for Silent {
        async fn start(&self, _ctx: Context, _input: Bytes, _updater: Updater) -> Result<(), BoxError> {
            Ok(())
        }
    }

    fn counter_subscription(source: Arc<dyn SubscriptionDataSource>) -> Arc<GraphQLSubscription> {
        Arc::new(GraphQLSubscription {
            trigger: SubscriptionTrigger {
                input: InputTemplate::new(vec![TemplateSegment::text(
                    r#"{"url":"ws://counter","body":{"query":"subscription { counter }"}}"#,
                )]),
                source,
                post_processing: PostProcessing::data_and_errors(["data"]),
            },
            response: GraphQLResponse::new(Object::new(vec![Field::new(
                "counter",
                Node::Integer(Scalar::at(["counter"])),
            )])),
            filter: None,
        })
    }

    fn resolver() -> Resolver {
        Resolver::new(ResolverConfig {
            heartbeat_interval: None,
            ..ResolverConfig::default()
        })
    }

    async fn wait_for_completions(recorder: &Recorder, count: usize) {
        for _ in 0..200 {
            if recorder.completions() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("subscriber did not complete");
    }

    #[tokio::test]
    async fn resolves_a_response() {
        let resolver = resolver();
        let response = GraphQLResponse::new(
            Object::new(vec![Field::new(
                "hero",
                Object::new(vec![string("name")]).at(["hero"]),
            )])
            .with_fetch(fetch(r#"{"data":{"hero":{"name":"R2-D2"}}}"#)),
        );
        let ctx = resolver.new_context();
        let mut out = Vec::new();
        resolver
            .resolve_graphql_response(&ctx, &response, None, &mut out)
            .await
            .unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), r#"{"data":{"hero":{"name":"R2-D2"}}}"#);
    }

    #[tokio::test]
    async fn skip_loader_serializes_initial_data() {
        let resolver = resolver();
        let response = GraphQLResponse::new(
            Object::new(vec![string("name")]).with_fetch(fetch(r#"{"data":{"name":"fetched"}}"#)),
        );
        let mut ctx = Context::new();
        ctx.execution_options.skip_loader = true;
        let mut out = Vec::new();
        resolver
            .resolve_graphql_response(&ctx, &response, Some(br#"{"name":"initial"}"#), &mut out)
            .await
            .unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), r#"{"data":{"name":"initial"}}"#);
    }

    #[tokio::test]
    async fn deferred_parts_need_a_flushing_writer() {
        let resolver = resolver();
        let mut response = GraphQLResponse::new(Object::new(vec![string("id")]));
        response.deferred.push(DeferredResponse {
            label: Some("details".to_string()),
            data: Object::new(vec![string("name")]).with_fetch(fetch(r#"{"data":{"name":"Luke"}}"#)),
        });
        let ctx = Context::new();

        let err = resolver
            .resolve_graphql_response(&ctx, &response, Some(br#"{"id":"1"}"#), &mut Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::DeferredRequiresFlushingWriter));

        let mut writer = MultipartWriter::new(Vec::new(), &resolver.config().multipart);
        resolver
            .resolve_graphql_response(&ctx, &response, Some(br#"{"id":"1"}"#), &mut writer)
            .await
            .unwrap();
        let out = String::from_utf8(writer.finish().unwrap()).unwrap();
        assert_eq!(
            out,
            "--graphql\r\ncontent-type: application/json; charset=utf-8\r\n\r\n{\"data\":{\"id\":\"1\"}}\r\n\
             --graphql\r\ncontent-type: application/json; charset=utf-8\r\n\r\n{\"data\":{\"name\":\"Luke\"}}\r\n\
             --graphql--\r\n"
        );
    }

    #[tokio::test]
    async fn cancelled_requests_do_not_resolve() {
        let resolver = resolver();
        let ctx = Context::new();
        ctx.cancellation_token().cancel();
        let response = GraphQLResponse::new(Object::new(vec![string("id")]));
        let err = resolver
            .resolve_graphql_response(&ctx, &response, Some(br#"{"id":"1"}"#), &mut Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::Cancelled));
    }

    #[tokio::test]
    async fn subscribers_with_identical_input_share_a_trigger() {
        let resolver = resolver();
        let source = Counter::new(vec![r#"{"data":{"counter":1}}"#, r#"{"data":{"counter":2}}"#]);
        let subscription = counter_subscription(source.clone());
        let first = Recorder::default();
        let second = Recorder::default();
        let ctx = Context::new();
        resolver
            .async_resolve_graphql_subscription(&ctx, subscription.clone(), Box::new(first.clone()), SubscriptionId::new(1, 1))
            .await
            .unwrap();
        resolver
            .async_resolve_graphql_subscription(&ctx, subscription, Box::new(second.clone()), SubscriptionId::new(2, 1))
            .await
            .unwrap();

        wait_for_completions(&first, 1).await;
        wait_for_completions(&second, 1).await;
        assert_eq!(source.starts.load(Ordering::SeqCst), 1);
        let expected = vec![
            r#"{"data":{"counter":1}}"#.to_string(),
            r#"{"data":{"counter":2}}"#.to_string(),
        ];
        assert_eq!(first.messages(), expected);
        assert_eq!(second.messages(), expected);
    }

    #[tokio::test]
    async fn filters_are_applied_per_subscriber() {
        let resolver = resolver();
        let source = Counter::new(vec![
            r#"{"data":{"counter":1,"owner":"a"}}"#,
            r#"{"data":{"counter":2,"owner":"b"}}"#,
        ]);
        let mut subscription = (*counter_subscription(source)).clone();
        subscription.filter = Some(crate::subscription::SubscriptionFilter::In(
            crate::subscription::FieldFilter {
                field_path: vec!["data".to_string(), "owner".to_string()],
                values: vec![InputTemplate::new(vec![TemplateSegment::Variable(
                    Variable::Context {
                        path: vec!["owner".to_string()],
                        renderer: Arc::new(JsonVariableRenderer),
                    },
                )])],
            },
        ));
        let variables = serde_json_bytes::json!({"owner": "b"})
            .as_object()
            .cloned()
            .unwrap();
        let ctx = Context::new().with_variables(variables);
        let recorder = Recorder::default();
        resolver
            .async_resolve_graphql_subscription(&ctx, Arc::new(subscription), Box::new(recorder.clone()), SubscriptionId::new(1, 1))
            .await
            .unwrap();
        wait_for_completions(&recorder, 1).await;
        assert_eq!(recorder.messages(), vec![r#"{"data":{"counter":2}}"#.to_string()]);
    }

    #[tokio::test]
    async fn start_failures_are_written_to_the_subscriber() {
        let resolver = resolver();
        let source = Arc::new(Counter {
            updates: Vec::new(),
            starts: AtomicUsize::new(0),
            inputs: Mutex::default(),
            fail: true,
        });
        let recorder = Recorder::default();
        resolver
            .resolve_graphql_subscription(&Context::new(), counter_subscription(source), Box::new(recorder.clone()))
            .await
            .unwrap();
        assert_eq!(
            recorder.messages(),
            vec![r#"{"errors":[{"message":"failed to start subscription: connection refused"}]}"#.to_string()]
        );
        assert_eq!(recorder.completions(), 1);
    }

    #[tokio::test]
    async fn subscription_input_carries_initial_payload_and_extensions() {
        let resolver = resolver();
        let source = Counter::new(Vec::new());
        let mut ctx = Context::new();
        ctx.initial_payload = Some(Bytes::from_static(br#"{"token":"secret"}"#));
        ctx.extensions = Some(Bytes::from_static(br#"{"trace":true}"#));
        let recorder = Recorder::default();
        resolver
            .async_resolve_graphql_subscription(&ctx, counter_subscription(source.clone()), Box::new(recorder.clone()), SubscriptionId::new(1, 1))
            .await
            .unwrap();
        wait_for_completions(&recorder, 1).await;
        let input: serde_json::Value = serde_json::from_str(&source.inputs.lock()[0]).unwrap();
        assert_eq!(
            input,
            serde_json::json!({
                "url": "ws://counter",
                "body": {"query": "subscription { counter }", "extensions": {"trace": true}},
                "initial_payload": {"token": "secret"}
            })
        );
    }

    #[tokio::test]
    async fn unrenderable_input_is_reported() {
        let resolver = resolver();
        let mut subscription = (*counter_subscription(Counter::new(Vec::new()))).clone();
        subscription.trigger.input = InputTemplate::new(vec![TemplateSegment::Variable(Variable::Header {
            path: vec!["a".to_string(), "b".to_string()],
        })]);
        let recorder = Recorder::default();
        resolver
            .resolve_graphql_subscription(&Context::new(), Arc::new(subscription), Box::new(recorder.clone()))
            .await
            .unwrap();
        assert_eq!(
            recorder.messages(),
            vec![r#"{"errors":[{"message":"invalid input"}]}"#.to_string()]
        );
        assert_eq!(recorder.completions(), 1);
    }

    #[tokio::test]
    async fn removing_a_client_completes_its_subscriptions() {
        let resolver = resolver();
        let recorder = Recorder::default();
        resolver
            .async_resolve_graphql_subscription(
                &Context::new(),
                counter_subscription(Arc::new(Silent)),
                Box::new(recorder.clone()),
                SubscriptionId::new(7, 1),
            )
            .await
            .unwrap();
        resolver.async_unsubscribe_client(7).await.unwrap();
        wait_for_completions(&recorder, 1).await;
        assert!(recorder.messages().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_subscribers_get_heartbeats() {
        let resolver = Resolver::new(ResolverConfig {
            heartbeat_interval: Some(Duration::from_secs(5)),
            ..ResolverConfig::default()
        });
        let recorder = Recorder::default();
        resolver
            .async_resolve_graphql_subscription(
                &Context::new(),
                counter_subscription(Arc::new(Silent)),
                Box::new(recorder.clone()),
                SubscriptionId::new(1, 1),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(recorder.messages(), vec!["{}".to_string(), "{}".to_string()]);
    }
}
