//! Runs the fetches attached to the response tree and merges their results.
//!
//! A fetch is prepared against the document first: its input is rendered, the policies
//! are consulted and the L1 cache is checked. Loading happens without touching the
//! document, so the fetches of a parallel group load concurrently. Their results are
//! merged one after the other, in declared order.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::future::try_join_all;
use http::HeaderMap;
use tower::BoxError;
use tracing::Instrument;

use crate::cache::CacheEntry;
use crate::cache::CacheKey;
use crate::cache::CacheKeyTemplate;
use crate::cache::L1Cache;
use crate::cache::LoaderCache;
use crate::context::Context;
use crate::context::SubgraphErrorPropagation;
use crate::error::FetchError;
use crate::error::ResolveError;
use crate::graphql;
use crate::plan;
use crate::plan::BatchEntityFetch;
use crate::plan::EntityFetch;
use crate::plan::Fetch;
use crate::plan::FetchConfiguration;
use crate::plan::OperationType;
use crate::plan::SingleFetch;
use crate::singleflight::SingleFlight;
use crate::store::DocumentStore;
use crate::store::NodeId;
use crate::store::NodeKind;
use crate::template::RenderScope;
use crate::template::Source;
use crate::template::set_undefined_variables;

/// Slots of each item in a batch response. `None` marks a representation that was not
/// sent.
type BatchStats = Vec<Vec<Option<usize>>>;

#[derive(Debug, Default)]
struct Request {
    input: Bytes,
    batch_stats: Option<BatchStats>,
}

enum CacheHit {
    /// Payload nodes already in the document, one per item.
    L1(Vec<NodeId>),
    /// Serialized payloads, one per item.
    L2(Vec<Bytes>),
}

enum FetchState {
    Skipped,
    AuthorizationDenied(Vec<String>),
    RateLimitDenied(String),
    CacheHit(CacheHit),
    Pending(Request),
    Loaded { request: Request, response: Bytes },
    Failed(BoxError),
}

/// One upstream request of a fetch node and the items its result is merged into.
struct Job<'f> {
    config: &'f FetchConfiguration,
    items: Vec<NodeId>,
    /// Aligned with `items` when not empty.
    cache_keys: Vec<CacheKey>,
    state: FetchState,
}

impl<'f> Job<'f> {
    fn new(config: &'f FetchConfiguration, items: Vec<NodeId>, state: FetchState) -> Self {
        Self {
            config,
            items,
            cache_keys: Vec::new(),
            state,
        }
    }
}

/// An L2 write produced while merging, sent once the merge is done.
struct CacheWrite {
    cache: Arc<dyn LoaderCache>,
    entries: Vec<CacheEntry>,
    ttl: Duration,
}

pub(crate) struct Loader<'a> {
    ctx: &'a Context,
    single_flight: &'a SingleFlight,
    operation_type: OperationType,
    data: NodeId,
    errors: NodeId,
    variables: Option<NodeId>,
    /// Response path of the object being walked. List levels are written `@`.
    path: Vec<String>,
    l1: L1Cache,
}

impl<'a> Loader<'a> {
    pub(crate) fn new(
        ctx: &'a Context,
        single_flight: &'a SingleFlight,
        operation_type: OperationType,
        data: NodeId,
        errors: NodeId,
        variables: Option<NodeId>,
    ) -> Self {
        Self {
            ctx,
            single_flight,
            operation_type,
            data,
            errors,
            variables,
            path: Vec::new(),
            l1: L1Cache::default(),
        }
    }

    /// Runs every fetch of `object`, which is resolved against the data root.
    pub(crate) async fn load(
        &mut self,
        store: &mut DocumentStore,
        object: &plan::Object,
    ) -> Result<(), ResolveError> {
        let items = vec![self.data];
        self.walk_object(store, object, items).await
    }

    pub(crate) fn free(&mut self) {
        self.path.clear();
        self.l1.clear();
    }

    fn walk_node<'s>(
        &'s mut self,
        store: &'s mut DocumentStore,
        node: &'s plan::Node,
        items: Vec<NodeId>,
    ) -> BoxFuture<'s, Result<(), ResolveError>> {
        Box::pin(async move {
            match node {
                plan::Node::Object(object) => self.walk_object(store, object, items).await,
                plan::Node::Array(array) => {
                    let items = select_node_items(store, &items, &array.path);
                    if items.is_empty() {
                        return Ok(());
                    }
                    self.path.extend(array.path.iter().cloned());
                    self.path.push("@".to_string());
                    let result = self.walk_node(store, &array.item, items).await;
                    self.pop_path(array.path.len() + 1);
                    result
                }
                _ => Ok(()),
            }
        })
    }

    async fn walk_object(
        &mut self,
        store: &mut DocumentStore,
        object: &plan::Object,
        parent_items: Vec<NodeId>,
    ) -> Result<(), ResolveError> {
        if self.ctx.is_cancelled() {
            return Err(ResolveError::Cancelled);
        }
        let items = select_node_items(store, &parent_items, &object.path);
        if items.is_empty() {
            return Ok(());
        }
        self.path.extend(object.path.iter().cloned());
        let result = self.walk_fields(store, object, items).await;
        self.pop_path(object.path.len());
        result
    }

    async fn walk_fields(
        &mut self,
        store: &mut DocumentStore,
        object: &plan::Object,
        items: Vec<NodeId>,
    ) -> Result<(), ResolveError> {
        if let Some(fetch) = &object.fetch {
            self.resolve_fetch(store, fetch, &items).await?;
        }
        for field in &object.fields {
            self.walk_node(store, &field.value, items.clone()).await?;
        }
        Ok(())
    }

    fn pop_path(&mut self, len: usize) {
        let len = self.path.len().saturating_sub(len);
        self.path.truncate(len);
    }

    fn render_path(&self) -> String {
        let mut path = self.operation_type.as_str().to_string();
        for element in &self.path {
            path.push('.');
            path.push_str(element);
        }
        path
    }

    fn scope<'s>(&'s self, store: &'s DocumentStore) -> RenderScope<'s> {
        RenderScope {
            store,
            variables: self.variables,
            headers: &self.ctx.headers,
        }
    }

    fn resolve_fetch<'s>(
        &'s mut self,
        store: &'s mut DocumentStore,
        fetch: &'s Fetch,
        items: &'s [NodeId],
    ) -> BoxFuture<'s, Result<(), ResolveError>> {
        Box::pin(async move {
            match fetch {
                Fetch::Serial(fetches) => {
                    for fetch in fetches {
                        self.resolve_fetch(store, fetch, items).await?;
                    }
                    Ok(())
                }
                Fetch::Parallel(fetches) => self.resolve_parallel(store, fetches, items).await,
                fetch => {
                    let jobs = self.prepare(store, fetch, items)?;
                    let jobs = self.execute_all(jobs).await?;
                    self.merge_all(store, jobs).await
                }
            }
        })
    }

    async fn resolve_parallel(
        &mut self,
        store: &mut DocumentStore,
        fetches: &[Fetch],
        items: &[NodeId],
    ) -> Result<(), ResolveError> {
        let mut prepared = Vec::with_capacity(fetches.len());
        for fetch in fetches {
            prepared.push(match fetch {
                // a group merges between its own steps, which needs the store
                // exclusively, so it loads in turn while the siblings are merged
                Fetch::Serial(_) | Fetch::Parallel(_) => None,
                fetch => Some(self.prepare(store, fetch, items)?),
            });
        }
        let this = &*self;
        let loaded = try_join_all(prepared.into_iter().map(|jobs| async move {
            match jobs {
                Some(jobs) => this.execute_all(jobs).await.map(Some),
                None => Ok(None),
            }
        }))
        .await?;
        for (fetch, jobs) in fetches.iter().zip(loaded) {
            match jobs {
                Some(jobs) => self.merge_all(store, jobs).await?,
                None => self.resolve_fetch(store, fetch, items).await?,
            }
        }
        Ok(())
    }

    fn prepare<'f>(
        &self,
        store: &DocumentStore,
        fetch: &'f Fetch,
        items: &[NodeId],
    ) -> Result<Vec<Job<'f>>, ResolveError> {
        match fetch {
            Fetch::Single(fetch) => Ok(vec![self.prepare_single(store, fetch, items)?]),
            Fetch::ParallelListItem(fetch) => items
                .iter()
                .map(|item| self.prepare_single(store, fetch, std::slice::from_ref(item)))
                .collect(),
            Fetch::Entity(fetch) => items
                .iter()
                .map(|item| self.prepare_entity(store, fetch, *item))
                .collect(),
            Fetch::BatchEntity(fetch) => Ok(vec![self.prepare_batch(store, fetch, items)?]),
            Fetch::Serial(_) | Fetch::Parallel(_) => {
                failfast_debug!("fetch groups cannot be prepared as a single request");
                Ok(Vec::new())
            }
        }
    }

    fn prepare_single<'f>(
        &self,
        store: &DocumentStore,
        fetch: &'f SingleFetch,
        items: &[NodeId],
    ) -> Result<Job<'f>, ResolveError> {
        let mut input = Vec::new();
        if let Err(err) =
            fetch
                .input
                .render(&self.scope(store), Source::from_items(items), &mut input)
        {
            tracing::debug!(error = %err, path = %self.render_path(), "fetch input did not render");
            return Ok(self.invalid_input(&fetch.config, items.to_vec()));
        }
        self.gate(store, &fetch.config, items.to_vec(), input, None)
    }

    fn prepare_entity<'f>(
        &self,
        store: &DocumentStore,
        fetch: &'f EntityFetch,
        item: NodeId,
    ) -> Result<Job<'f>, ResolveError> {
        let scope = self.scope(store);
        let input = &fetch.input;
        let config = &fetch.config;

        let mut rendered = Vec::new();
        if let Err(err) = input.item.render(&scope, Some(Source::Node(item)), &mut rendered) {
            tracing::debug!(error = %err, path = %self.render_path(), "entity did not render");
            if input.skip_err_item {
                return Ok(Job::new(config, vec![item], FetchState::Skipped));
            }
            return Ok(self.invalid_input(config, vec![item]));
        }
        if rendered == b"null" || rendered == b"{}" {
            return Ok(Job::new(config, vec![item], FetchState::Skipped));
        }

        let mut undefined = Vec::new();
        let mut out = Vec::new();
        let framed = input
            .header
            .render_and_collect_undefined(&scope, None, &mut out, &mut undefined)
            .and_then(|()| {
                out.extend_from_slice(&rendered);
                input
                    .footer
                    .render_and_collect_undefined(&scope, None, &mut out, &mut undefined)
            })
            .and_then(|()| with_undefined_variables(out, &undefined));
        match framed {
            Ok(out) => self.gate(store, config, vec![item], out, None),
            Err(err) => {
                tracing::debug!(error = %err, "entity fetch input did not render");
                Ok(self.invalid_input(config, vec![item]))
            }
        }
    }

    fn prepare_batch<'f>(
        &self,
        store: &DocumentStore,
        fetch: &'f BatchEntityFetch,
        items: &[NodeId],
    ) -> Result<Job<'f>, ResolveError> {
        let scope = self.scope(store);
        let input = &fetch.input;
        let config = &fetch.config;

        let hasher = ahash::RandomState::new();
        let mut index: HashMap<u64, Vec<usize>> = HashMap::new();
        let mut representations: Vec<Vec<u8>> = Vec::new();
        let mut batch_stats: BatchStats = vec![Vec::new(); items.len()];

        for (i, item) in items.iter().enumerate() {
            for template in &input.items {
                let mut rendered = Vec::new();
                if let Err(err) = template.render(&scope, Some(Source::Node(*item)), &mut rendered) {
                    if input.skip_err_items {
                        batch_stats[i].push(None);
                        continue;
                    }
                    tracing::debug!(error = %err, path = %self.render_path(), "batch item did not render");
                    return Ok(self.invalid_input(config, items.to_vec()));
                }
                if (input.skip_null_items && rendered == b"null")
                    || (input.skip_empty_object_items && rendered == b"{}")
                {
                    batch_stats[i].push(None);
                    continue;
                }
                let slots = index.entry(hasher.hash_one(&rendered)).or_default();
                let slot = match slots
                    .iter()
                    .find(|slot| representations[**slot] == rendered)
                {
                    Some(slot) => *slot,
                    None => {
                        representations.push(rendered);
                        slots.push(representations.len() - 1);
                        representations.len() - 1
                    }
                };
                batch_stats[i].push(Some(slot));
            }
        }

        if representations.is_empty() {
            tracing::debug!(path = %self.render_path(), "every batch item was skipped");
            return Ok(Job::new(config, items.to_vec(), FetchState::Skipped));
        }

        let mut undefined = Vec::new();
        let mut out = Vec::new();
        let framed = input
            .header
            .render_and_collect_undefined(&scope, None, &mut out, &mut undefined)
            .and_then(|()| {
                for (i, representation) in representations.iter().enumerate() {
                    if i != 0 {
                        input.separator.render_and_collect_undefined(
                            &scope,
                            None,
                            &mut out,
                            &mut undefined,
                        )?;
                    }
                    out.extend_from_slice(representation);
                }
                input
                    .footer
                    .render_and_collect_undefined(&scope, None, &mut out, &mut undefined)
            })
            .and_then(|()| with_undefined_variables(out, &undefined));
        match framed {
            Ok(out) => self.gate(store, config, items.to_vec(), out, Some(batch_stats)),
            Err(err) => {
                tracing::debug!(error = %err, "batch fetch input did not render");
                Ok(self.invalid_input(config, items.to_vec()))
            }
        }
    }

    /// The fetch output standing in for a request that could not be rendered.
    fn invalid_input<'f>(&self, config: &'f FetchConfiguration, items: Vec<NodeId>) -> Job<'f> {
        let response = serde_json::json!({
            "errors": [{ "message": "invalid input", "path": self.path }]
        });
        Job::new(
            config,
            items,
            FetchState::Loaded {
                request: Request::default(),
                response: Bytes::from(response.to_string()),
            },
        )
    }

    /// Policy checks and L1 lookup of a rendered request.
    fn gate<'f>(
        &self,
        store: &DocumentStore,
        config: &'f FetchConfiguration,
        items: Vec<NodeId>,
        input: Vec<u8>,
        batch_stats: Option<BatchStats>,
    ) -> Result<Job<'f>, ResolveError> {
        let input = self.with_request_extensions(input);
        if let Some(reasons) = self.authorize_pre_fetch(config, &input)? {
            return Ok(Job::new(config, items, FetchState::AuthorizationDenied(reasons)));
        }
        if let Some(reason) = self.rate_limit_pre_fetch(config, &input)? {
            return Ok(Job::new(config, items, FetchState::RateLimitDenied(reason)));
        }
        let cache_keys = self.cache_keys(store, config, &items);
        let state = match self.load_from_l1(config, &cache_keys) {
            Some(nodes) => FetchState::CacheHit(CacheHit::L1(nodes)),
            None => FetchState::Pending(Request {
                input: Bytes::from(input),
                batch_stats,
            }),
        };
        Ok(Job {
            config,
            items,
            cache_keys,
            state,
        })
    }

    /// Forwards the client request extensions as `body.extensions`.
    fn with_request_extensions(&self, input: Vec<u8>) -> Vec<u8> {
        let Some(extensions) = &self.ctx.extensions else {
            return input;
        };
        let spliced = serde_json::from_slice::<serde_json::Value>(&input).and_then(|mut value| {
            let extensions: serde_json::Value = serde_json::from_slice(extensions)?;
            if let Some(body) = value
                .as_object_mut()
                .map(|object| object.entry("body").or_insert_with(|| serde_json::json!({})))
                .and_then(serde_json::Value::as_object_mut)
            {
                body.insert("extensions".to_string(), extensions);
            }
            serde_json::to_vec(&value)
        });
        match spliced {
            Ok(spliced) => spliced,
            Err(err) => {
                tracing::debug!(error = %err, "request extensions not forwarded");
                input
            }
        }
    }

    fn authorize_pre_fetch(
        &self,
        config: &FetchConfiguration,
        input: &[u8],
    ) -> Result<Option<Vec<String>>, ResolveError> {
        let (Some(authorizer), Some(info)) = (&self.ctx.authorizer, &config.info) else {
            return Ok(None);
        };
        let mut reasons = Vec::new();
        for coordinate in info
            .root_fields
            .iter()
            .filter(|coordinate| coordinate.has_authorization_rule)
        {
            let deny = authorizer
                .authorize_pre_fetch(self.ctx, &info.data_source_id, input, coordinate)
                .map_err(|err| ResolveError::Authorization(err.to_string()))?;
            if let Some(deny) = deny {
                tracing::debug!(
                    data_source = %info.data_source_id,
                    type_name = %coordinate.type_name,
                    field_name = %coordinate.field_name,
                    "fetch denied by authorizer"
                );
                reasons.push(deny.reason);
            }
        }
        Ok((!reasons.is_empty()).then_some(reasons))
    }

    fn rate_limit_pre_fetch(
        &self,
        config: &FetchConfiguration,
        input: &[u8],
    ) -> Result<Option<String>, ResolveError> {
        if !self.ctx.rate_limit_options.enable {
            return Ok(None);
        }
        let Some(rate_limiter) = &self.ctx.rate_limiter else {
            return Ok(None);
        };
        let deny = rate_limiter
            .rate_limit_pre_fetch(self.ctx, config.info.as_ref(), input)
            .map_err(|err| ResolveError::RateLimit(err.to_string()))?;
        Ok(deny.map(|deny| deny.reason))
    }

    fn cache_keys(
        &self,
        store: &DocumentStore,
        config: &FetchConfiguration,
        items: &[NodeId],
    ) -> Vec<CacheKey> {
        let caching = &config.caching;
        let options = self.ctx.execution_options.caching;
        if !caching.enabled || !(options.enable_l1 || options.enable_l2) {
            return Vec::new();
        }
        let Some(template) = &caching.key_template else {
            return Vec::new();
        };
        match template.render_keys(&self.scope(store), items, caching.key_prefix.as_deref()) {
            Ok(keys) => keys,
            Err(err) => {
                tracing::debug!(error = %err, "cache keys did not render, fetch is not cached");
                Vec::new()
            }
        }
    }

    fn uses_l1(&self, config: &FetchConfiguration) -> bool {
        self.ctx.execution_options.caching.enable_l1
            && config.caching.enabled
            && config
                .caching
                .key_template
                .as_ref()
                .is_some_and(CacheKeyTemplate::is_entity)
    }

    fn l2_cache(&self, config: &FetchConfiguration) -> Option<&Arc<dyn LoaderCache>> {
        if !self.ctx.execution_options.caching.enable_l2 || !config.caching.enabled {
            return None;
        }
        self.ctx.loader_cache(&config.caching.cache_name)
    }

    fn load_from_l1(&self, config: &FetchConfiguration, cache_keys: &[CacheKey]) -> Option<Vec<NodeId>> {
        if cache_keys.is_empty() || !self.uses_l1(config) {
            return None;
        }
        let hit = self.l1.get_all(cache_keys);
        let count = cache_keys.len();
        match &hit {
            Some(_) => {
                tracing::debug!(path = %self.render_path(), count, "fetch satisfied by L1 cache");
                self.ctx.record_stats(|stats| stats.l1_hits += count);
            }
            None => self.ctx.record_stats(|stats| stats.l1_misses += count),
        }
        hit
    }

    async fn execute_all<'f>(&self, jobs: Vec<Job<'f>>) -> Result<Vec<Job<'f>>, ResolveError> {
        try_join_all(jobs.into_iter().map(|job| self.execute(job))).await
    }

    async fn execute<'f>(&self, mut job: Job<'f>) -> Result<Job<'f>, ResolveError> {
        let request = match job.state {
            FetchState::Pending(request) => request,
            state => {
                job.state = state;
                return Ok(job);
            }
        };
        let span = tracing::debug_span!(
            "fetch",
            data_source = job.config.data_source_id(),
            path = %self.render_path(),
        );
        job.state = self
            .load_request(job.config, &job.cache_keys, request)
            .instrument(span)
            .await?;
        Ok(job)
    }

    async fn load_request(
        &self,
        config: &FetchConfiguration,
        cache_keys: &[CacheKey],
        request: Request,
    ) -> Result<FetchState, ResolveError> {
        if let Some(values) = self.load_from_l2(config, cache_keys).await {
            return Ok(FetchState::CacheHit(CacheHit::L2(values)));
        }
        match self.load_from_source(config, request.input.clone()).await {
            Ok(response) => Ok(FetchState::Loaded { request, response }),
            Err(err) if is_cancellation(&err) => Err(ResolveError::Cancelled),
            Err(err) => {
                tracing::debug!(error = %err, "fetch failed");
                Ok(FetchState::Failed(err))
            }
        }
    }

    async fn load_from_l2(&self, config: &FetchConfiguration, cache_keys: &[CacheKey]) -> Option<Vec<Bytes>> {
        if cache_keys.is_empty() {
            return None;
        }
        let cache = self.l2_cache(config)?;
        let keys: Vec<String> = cache_keys
            .iter()
            .flat_map(|key| key.keys.iter().cloned())
            .collect();
        let entries = match cache.get(&keys).await {
            Ok(entries) => entries,
            Err(err) => {
                tracing::debug!(error = %err, cache = %config.caching.cache_name, "L2 cache lookup failed");
                return None;
            }
        };
        let mut entries = entries.into_iter();
        let mut values = Vec::with_capacity(cache_keys.len());
        for key in cache_keys {
            let item: Vec<_> = entries.by_ref().take(key.keys.len()).collect();
            match item.first() {
                Some(Some(entry)) if item.iter().all(Option::is_some) => {
                    values.push(entry.value.clone());
                }
                _ => break,
            }
        }
        let count = cache_keys.len();
        if values.len() == count {
            tracing::debug!(count, "fetch satisfied by L2 cache");
            self.ctx.record_stats(|stats| stats.l2_hits += count);
            Some(values)
        } else {
            self.ctx.record_stats(|stats| stats.l2_misses += count);
            None
        }
    }

    fn deduplicates(&self, config: &FetchConfiguration) -> bool {
        !self.ctx.execution_options.disable_subgraph_request_deduplication
            && self.operation_type != OperationType::Mutation
            && config
                .info
                .as_ref()
                .is_none_or(|info| info.operation_type != OperationType::Mutation)
    }

    async fn load_from_source(&self, config: &FetchConfiguration, input: Bytes) -> Result<Bytes, BoxError> {
        let data_source = &config.data_source;
        let headers = &self.ctx.headers;
        let cancellation = self.ctx.cancellation_token();
        if !self.deduplicates(config) {
            return tokio::select! {
                biased;
                _ = cancellation.cancelled() => Err(ResolveError::Cancelled.into()),
                response = data_source.load(headers, input) => response,
            };
        }
        let data_source_id = config.data_source_id();
        let key = self
            .single_flight
            .request_key(data_source_id, &input, &header_fingerprint(headers));
        let fetch_key = self.single_flight.fetch_key(
            data_source_id,
            config
                .info
                .iter()
                .flat_map(|info| info.root_fields.iter())
                .map(|coordinate| coordinate.field_name.as_str()),
        );
        tracing::trace!(
            size_hint = self.single_flight.size_hint(fetch_key),
            "loading through single flight"
        );
        let loaded = self
            .single_flight
            .load(key, fetch_key, cancellation, move || data_source.load(headers, input))
            .await?;
        if loaded.shared {
            self.ctx
                .record_stats(|stats| stats.single_flight_shared_loads += 1);
        }
        Ok(loaded.bytes)
    }

    async fn merge_all(&mut self, store: &mut DocumentStore, jobs: Vec<Job<'_>>) -> Result<(), ResolveError> {
        let mut writes = Vec::new();
        for job in jobs {
            self.merge(store, job, &mut writes);
        }
        for write in writes {
            if let Err(err) = write.cache.set(write.entries, write.ttl).await {
                tracing::debug!(error = %err, "L2 cache write failed");
            }
        }
        Ok(())
    }

    fn merge(&mut self, store: &mut DocumentStore, job: Job<'_>, writes: &mut Vec<CacheWrite>) {
        let Job {
            config,
            items,
            cache_keys,
            state,
        } = job;
        let merge_path = &config.post_processing.merge_path;
        match state {
            FetchState::Skipped => {}
            FetchState::Pending(_) => {
                failfast_debug!("fetch reached the merge without being loaded");
            }
            FetchState::AuthorizationDenied(reasons) => {
                let path = self.render_path();
                for reason in reasons {
                    let message = match (config.data_source_name(), reason.as_str()) {
                        ("", "") => format!("Unauthorized Subgraph request at path '{path}'."),
                        ("", reason) => {
                            format!("Unauthorized Subgraph request at path '{path}'. Reason: {reason}.")
                        }
                        (name, "") => format!("Unauthorized request to Subgraph '{name}' at path '{path}'."),
                        (name, reason) => format!(
                            "Unauthorized request to Subgraph '{name}' at path '{path}'. Reason: {reason}."
                        ),
                    };
                    self.push_error(store, &graphql::Error::builder().message(message).build());
                }
                self.merge_null_skip_error(store, &items, merge_path);
            }
            FetchState::RateLimitDenied(reason) => {
                let path = self.render_path();
                let message = match (config.data_source_name(), reason.as_str()) {
                    ("", "") => format!("Rate limit exceeded for Subgraph request at Path '{path}'."),
                    ("", reason) => {
                        format!("Rate limit exceeded for Subgraph request at Path '{path}', Reason: {reason}.")
                    }
                    (name, "") => format!("Rate limit exceeded for Subgraph '{name}' at Path '{path}'."),
                    (name, reason) => format!(
                        "Rate limit exceeded for Subgraph '{name}' at Path '{path}', Reason: {reason}."
                    ),
                };
                self.push_error(store, &graphql::Error::builder().message(message).build());
                self.merge_null_skip_error(store, &items, merge_path);
            }
            FetchState::CacheHit(CacheHit::L1(nodes)) => {
                for (item, node) in items.iter().zip(nodes) {
                    // the cached payload is already grafted where it was first loaded
                    let node = store.copy_subtree(node);
                    store.merge_nodes_with_path(*item, node, merge_path);
                }
            }
            FetchState::CacheHit(CacheHit::L2(values)) => {
                let mut payloads = Vec::with_capacity(values.len());
                for (i, value) in values.iter().enumerate() {
                    match store.append_json(value) {
                        Ok(node) => payloads.push((i, node)),
                        Err(err) => tracing::debug!(error = %err, "L2 cache entry is not valid JSON"),
                    }
                }
                for (i, payload) in &payloads {
                    store.merge_nodes_with_path(items[*i], *payload, merge_path);
                }
                if self.uses_l1(config) {
                    self.remember_in_l1(&cache_keys, &payloads);
                }
            }
            FetchState::Loaded { request, response } => {
                self.merge_response(
                    store,
                    config,
                    &items,
                    &cache_keys,
                    request.batch_stats.as_ref(),
                    &response,
                    writes,
                );
            }
            FetchState::Failed(err) => {
                let cause = FetchError::SubrequestFailed {
                    service: config.data_source_name().to_string(),
                    reason: err.to_string(),
                };
                self.push_fetch_failure(store, config, vec![cause.to_graphql_error(None).to_json()]);
            }
        }
    }

    /// Leaves a placeholder at the merge path of every item so that the serializer nulls
    /// the subtree without reporting it again.
    fn merge_null_skip_error(&self, store: &mut DocumentStore, items: &[NodeId], merge_path: &[String]) {
        if merge_path.is_empty() {
            return;
        }
        for item in items {
            let placeholder = store.append_null_skip_error();
            store.merge_nodes_with_path(*item, placeholder, merge_path);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn merge_response(
        &mut self,
        store: &mut DocumentStore,
        config: &FetchConfiguration,
        items: &[NodeId],
        cache_keys: &[CacheKey],
        batch_stats: Option<&BatchStats>,
        response: &[u8],
        writes: &mut Vec<CacheWrite>,
    ) {
        let post_processing = &config.post_processing;
        let root = match store.append_json(response) {
            Ok(root) => root,
            Err(err) => {
                self.push_malformed_response(store, config, err.to_string());
                return;
            }
        };
        if !post_processing.select_response_errors_path.is_empty()
            && let Some(errors) = store
                .get(root, &post_processing.select_response_errors_path)
                .filter(|errors| !store.array_values(*errors).is_empty())
        {
            self.merge_subgraph_errors(store, config, errors);
        }
        let data = if post_processing.select_response_data_path.is_empty() {
            Some(root)
        } else {
            store.get(root, &post_processing.select_response_data_path)
        };
        let Some(data) = data.filter(|data| store.is_defined(Some(*data))) else {
            return;
        };

        let merge_path = &post_processing.merge_path;
        let payloads: Vec<(usize, NodeId)> = match batch_stats {
            Some(batch_stats) => {
                let values = store.array_values(data).to_vec();
                let mut payloads = Vec::new();
                for (i, slots) in batch_stats.iter().enumerate() {
                    for slot in slots.iter().flatten() {
                        let Some(value) = values.get(*slot) else {
                            self.push_malformed_response(
                                store,
                                config,
                                format!("expected at least {} entities", slot + 1),
                            );
                            return;
                        };
                        payloads.push((i, *value));
                    }
                }
                payloads
            }
            None if spreads_over_items(store, items, data, merge_path) => {
                let values = store.array_values(data).to_vec();
                if values.len() != items.len() {
                    let reason = format!("expected {} entities, got {}", items.len(), values.len());
                    self.push_malformed_response(store, config, reason);
                    return;
                }
                values.into_iter().enumerate().collect()
            }
            None => vec![(0, data)],
        };
        let mut grafted = HashSet::with_capacity(payloads.len());
        for (i, payload) in &payloads {
            if let Some(item) = items.get(*i) {
                // deduplicated items were answered by the same entity
                let payload = if grafted.insert(*payload) {
                    *payload
                } else {
                    store.copy_subtree(*payload)
                };
                store.merge_nodes_with_path(*item, payload, merge_path);
            }
        }

        if cache_keys.is_empty() {
            return;
        }
        if self.uses_l1(config) {
            self.remember_in_l1(cache_keys, &payloads);
        }
        if let Some(cache) = self.l2_cache(config).cloned() {
            let entries: Vec<CacheEntry> = payloads
                .iter()
                .filter_map(|(i, payload)| Some((cache_keys.get(*i)?, payload)))
                .flat_map(|(key, payload)| {
                    let value = Bytes::from(store.to_json_bytes(*payload));
                    key.keys.iter().map(move |key| CacheEntry {
                        key: key.clone(),
                        value: value.clone(),
                    })
                })
                .collect();
            if !entries.is_empty() {
                writes.push(CacheWrite {
                    cache,
                    entries,
                    ttl: config.caching.ttl,
                });
            }
        }
    }

    fn remember_in_l1(&mut self, cache_keys: &[CacheKey], payloads: &[(usize, NodeId)]) {
        for (i, payload) in payloads {
            let Some(key) = cache_keys.get(*i) else {
                continue;
            };
            for key in &key.keys {
                self.l1.insert(key.clone(), *payload);
            }
        }
    }

    fn merge_subgraph_errors(&self, store: &mut DocumentStore, config: &FetchConfiguration, errors: NodeId) {
        match self.ctx.execution_options.subgraph_errors {
            SubgraphErrorPropagation::Wrapped => {
                let errors = store
                    .array_values(errors)
                    .iter()
                    .map(|error| store.to_value(*error))
                    .collect();
                self.push_fetch_failure(store, config, errors);
            }
            SubgraphErrorPropagation::PassThrough => {
                for error in store.array_values(errors).to_vec() {
                    let mut value = store.to_value(error);
                    if value.pointer("/path/0").and_then(serde_json::Value::as_str) == Some("_entities")
                        && let Some(object) = value.as_object_mut()
                    {
                        object.remove("path");
                    }
                    let node = store.append_value(&value);
                    store.array_push(self.errors, node);
                }
            }
        }
    }

    fn push_malformed_response(&self, store: &mut DocumentStore, config: &FetchConfiguration, reason: String) {
        let cause = FetchError::SubrequestMalformedResponse {
            service: config.data_source_name().to_string(),
            reason,
        };
        self.push_fetch_failure(store, config, vec![cause.to_graphql_error(None).to_json()]);
    }

    fn push_fetch_failure(
        &self,
        store: &mut DocumentStore,
        config: &FetchConfiguration,
        causes: Vec<serde_json::Value>,
    ) {
        let path = self.render_path();
        let message = match config.data_source_name() {
            "" => format!("Failed to fetch from Subgraph at Path '{path}'."),
            name => format!("Failed to fetch from Subgraph '{name}' at Path '{path}'."),
        };
        let causes = serde_json_bytes::to_value(&causes).unwrap_or_default();
        let error = graphql::Error::builder()
            .message(message)
            .extension("errors", causes)
            .build();
        self.push_error(store, &error);
    }

    fn push_error(&self, store: &mut DocumentStore, error: &graphql::Error) {
        let node = store.append_error(error);
        store.array_push(self.errors, node);
    }
}

/// Values found at `path` below each parent. Lists are flattened and absent or null
/// values dropped.
pub(crate) fn select_node_items<S: AsRef<str>>(
    store: &DocumentStore,
    parents: &[NodeId],
    path: &[S],
) -> Vec<NodeId> {
    let mut items = Vec::with_capacity(parents.len());
    for parent in parents {
        let Some(value) = store.get(*parent, path) else {
            continue;
        };
        match store.kind(value) {
            NodeKind::Array => items.extend(
                store
                    .array_values(value)
                    .iter()
                    .filter(|item| store.is_defined(Some(**item))),
            ),
            NodeKind::Null | NodeKind::NullSkipError => {}
            _ => items.push(value),
        }
    }
    items
}

/// Whether a list payload holds one entry per item rather than a value for one item.
fn spreads_over_items(store: &DocumentStore, items: &[NodeId], data: NodeId, merge_path: &[String]) -> bool {
    if store.kind(data) != NodeKind::Array {
        return false;
    }
    match items {
        [item] => merge_path.is_empty() && store.kind(*item) == NodeKind::Object,
        _ => true,
    }
}

fn with_undefined_variables(
    out: Vec<u8>,
    undefined: &[String],
) -> Result<Vec<u8>, crate::error::RenderError> {
    if undefined.is_empty() {
        return Ok(out);
    }
    set_undefined_variables(&out, undefined)
}

fn header_fingerprint(headers: &HeaderMap) -> Vec<u8> {
    let mut out = Vec::new();
    for (name, value) in headers {
        out.extend_from_slice(name.as_str().as_bytes());
        out.push(b':');
        out.extend_from_slice(value.as_bytes());
        out.push(b'\n');
    }
    out
}

fn is_cancellation(err: &BoxError) -> bool {
    matches!(err.downcast_ref::<ResolveError>(), Some(ResolveError::Cancelled))
}
