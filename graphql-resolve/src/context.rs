//! Per-request execution state.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use derivative::Derivative;
use http::HeaderMap;
use parking_lot::Mutex;
use serde::Deserialize;
use serde::Serialize;
use static_assertions::assert_impl_all;
use tokio_util::sync::CancellationToken;

use crate::cache::LoaderCache;
use crate::json_ext::Object;
use crate::policy::Authorizer;
use crate::policy::RateLimiter;

/// How the serializer reacts to a `null` in a non-nullable position.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ErrorBehavior {
    /// The null bubbles up to the nearest nullable ancestor.
    #[default]
    Propagate,
    /// The offending field becomes null and its siblings are kept.
    Null,
    /// The whole `data` becomes null and only the first error is reported.
    Halt,
}

impl fmt::Display for ErrorBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ErrorBehavior::Propagate => "PROPAGATE",
            ErrorBehavior::Null => "NULL",
            ErrorBehavior::Halt => "HALT",
        })
    }
}

impl FromStr for ErrorBehavior {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PROPAGATE" => Ok(ErrorBehavior::Propagate),
            "NULL" => Ok(ErrorBehavior::Null),
            "HALT" => Ok(ErrorBehavior::Halt),
            _ => Err(format!("invalid error behavior '{s}'")),
        }
    }
}

/// How errors returned by a subgraph reach the client.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubgraphErrorPropagation {
    /// One error per failed fetch, carrying the subgraph errors under `extensions.errors`.
    #[default]
    Wrapped,
    /// Subgraph errors are copied as they are. Paths into `_entities` are dropped since
    /// they do not exist in the client response.
    PassThrough,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CachingOptions {
    pub enable_l1: bool,
    pub enable_l2: bool,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ExecutionOptions {
    /// Serialize the initial data without running any fetch.
    pub skip_loader: bool,
    pub disable_subgraph_request_deduplication: bool,
    pub error_behavior: ErrorBehavior,
    pub subgraph_errors: SubgraphErrorPropagation,
    pub caching: CachingOptions,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RateLimitOptions {
    pub enable: bool,
    pub include_stats_in_response_extension: bool,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TracingOptions {
    pub enable: bool,
    /// Leave timings out of span fields so traces compare equal between runs.
    pub predictable: bool,
}

/// Counters collected while resolving.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Stats {
    pub resolved_nodes: usize,
    pub resolved_objects: usize,
    pub resolved_leafs: usize,
    pub combined_response_size: usize,
    pub l1_hits: usize,
    pub l1_misses: usize,
    pub l2_hits: usize,
    pub l2_misses: usize,
    pub single_flight_shared_loads: usize,
}

/// State of one client request, read by every fetch of the resolve pass.
#[derive(Clone, Derivative)]
#[derivative(Debug)]
pub struct Context {
    pub variables: Object,
    pub headers: HeaderMap,
    /// Sent along with the subscription start request.
    pub initial_payload: Option<Bytes>,
    /// The `extensions` of the client request body, forwarded on subscription starts.
    pub extensions: Option<Bytes>,
    pub execution_options: ExecutionOptions,
    pub rate_limit_options: RateLimitOptions,
    pub tracing_options: TracingOptions,
    #[derivative(Debug = "ignore")]
    pub authorizer: Option<Arc<dyn Authorizer>>,
    #[derivative(Debug = "ignore")]
    pub rate_limiter: Option<Arc<dyn RateLimiter>>,
    #[derivative(Debug = "ignore")]
    loader_caches: HashMap<String, Arc<dyn LoaderCache>>,
    stats: Arc<Mutex<Stats>>,
    cancellation: CancellationToken,
}

assert_impl_all!(Context: Send, Sync);

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    pub fn new() -> Self {
        Self {
            variables: Object::default(),
            headers: HeaderMap::new(),
            initial_payload: None,
            extensions: None,
            execution_options: ExecutionOptions::default(),
            rate_limit_options: RateLimitOptions::default(),
            tracing_options: TracingOptions::default(),
            authorizer: None,
            rate_limiter: None,
            loader_caches: HashMap::new(),
            stats: Arc::default(),
            cancellation: CancellationToken::new(),
        }
    }

    pub fn with_variables(mut self, variables: Object) -> Self {
        self.variables = variables;
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    pub fn with_rate_limiter(mut self, rate_limiter: Arc<dyn RateLimiter>) -> Self {
        self.rate_limiter = Some(rate_limiter);
        self.rate_limit_options.enable = true;
        self
    }

    /// Registers an L2 cache under the name fetches refer to.
    pub fn with_loader_cache(mut self, name: impl Into<String>, cache: Arc<dyn LoaderCache>) -> Self {
        self.loader_caches.insert(name.into(), cache);
        self
    }

    pub fn loader_cache(&self, name: &str) -> Option<&Arc<dyn LoaderCache>> {
        self.loader_caches.get(name)
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn stats(&self) -> Stats {
        *self.stats.lock()
    }

    pub(crate) fn record_stats(&self, update: impl FnOnce(&mut Stats)) {
        update(&mut self.stats.lock());
    }

    /// A copy that outlives this request: it has its own cancellation token and stats, so
    /// cancelling or freeing the original leaves it untouched.
    pub fn detached_clone(&self) -> Self {
        Self {
            stats: Arc::default(),
            cancellation: CancellationToken::new(),
            ..self.clone()
        }
    }

    /// Drops everything the request holds on to.
    pub fn free(&mut self) {
        self.variables = Object::default();
        self.headers.clear();
        self.initial_payload = None;
        self.extensions = None;
        self.authorizer = None;
        self.rate_limiter = None;
        self.loader_caches.clear();
        *self.stats.lock() = Stats::default();
    }
}
