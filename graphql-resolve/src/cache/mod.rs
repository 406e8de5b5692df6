//! Entity and root field caching.
//!
//! Two layers sit in front of a fetch. The L1 layer lives for one resolve pass and maps
//! entity keys to nodes already present in the document. The L2 layer is a
//! [`LoaderCache`] shared across requests and stores serialized payloads with a TTL.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tower::BoxError;

use crate::error::RenderError;
use crate::plan;
use crate::plan::GraphCoordinate;
use crate::store::NodeId;
use crate::template::RenderScope;
use crate::template::Source;

mod storage;

pub use storage::InMemoryLoaderCache;

/// Caching settings of one fetch.
#[derive(Clone, Debug, Default)]
pub struct FetchCacheConfiguration {
    pub enabled: bool,
    /// Selects the [`LoaderCache`] registered on the context under this name.
    pub cache_name: String,
    /// Zero falls back to the cache default.
    pub ttl: Duration,
    pub key_template: Option<CacheKeyTemplate>,
    /// Prepended to every key as `prefix:`.
    pub key_prefix: Option<String>,
}

impl FetchCacheConfiguration {
    pub fn new(cache_name: impl Into<String>, key_template: CacheKeyTemplate) -> Self {
        Self {
            enabled: true,
            cache_name: cache_name.into(),
            ttl: Duration::ZERO,
            key_template: Some(key_template),
            key_prefix: None,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }
}

#[derive(Clone, Debug)]
pub enum CacheKeyTemplate {
    /// One key per root field, built from the field coordinate and its arguments.
    RootQuery { root_fields: Vec<QueryField> },
    /// One key per entity, built from its key fields.
    Entity { keys: plan::Object },
}

#[derive(Clone, Debug)]
pub struct QueryField {
    pub coordinate: GraphCoordinate,
    pub args: Vec<FieldArgument>,
}

#[derive(Clone, Debug)]
pub struct FieldArgument {
    pub name: String,
    pub value: ArgumentValue,
}

#[derive(Clone, Debug)]
pub enum ArgumentValue {
    /// Read from the request variables.
    Variable(Vec<String>),
    /// Read from the current item.
    Object(Vec<String>),
}

/// The cache keys of one item.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CacheKey {
    pub item: NodeId,
    pub keys: Vec<String>,
}

impl CacheKeyTemplate {
    pub fn is_entity(&self) -> bool {
        matches!(self, CacheKeyTemplate::Entity { .. })
    }

    pub fn render_keys(
        &self,
        scope: &RenderScope<'_>,
        items: &[NodeId],
        prefix: Option<&str>,
    ) -> Result<Vec<CacheKey>, RenderError> {
        items
            .iter()
            .map(|item| {
                let keys = match self {
                    CacheKeyTemplate::RootQuery { root_fields } => root_fields
                        .iter()
                        .map(|field| render_root_field_key(scope, *item, field))
                        .collect::<Result<Vec<_>, _>>()?,
                    CacheKeyTemplate::Entity { keys } => {
                        vec![render_entity_key(scope, *item, keys)?]
                    }
                };
                let keys = match prefix.filter(|prefix| !prefix.is_empty()) {
                    Some(prefix) => keys.into_iter().map(|key| format!("{prefix}:{key}")).collect(),
                    None => keys,
                };
                Ok(CacheKey { item: *item, keys })
            })
            .collect()
    }
}

fn render_root_field_key(
    scope: &RenderScope<'_>,
    item: NodeId,
    field: &QueryField,
) -> Result<String, RenderError> {
    let mut out = serde_json::Map::new();
    out.insert(
        "__typename".to_string(),
        field.coordinate.type_name.clone().into(),
    );
    out.insert("field".to_string(), field.coordinate.field_name.clone().into());
    if !field.args.is_empty() {
        let args = field
            .args
            .iter()
            .map(|arg| {
                let value = match &arg.value {
                    ArgumentValue::Variable(path) => scope
                        .variables
                        .and_then(|variables| scope.store.get(variables, path)),
                    ArgumentValue::Object(path) => scope.store.get(item, path),
                };
                let value = value
                    .map(|value| scope.store.to_value(value))
                    .unwrap_or_default();
                (arg.name.clone(), value)
            })
            .collect();
        out.insert("args".to_string(), serde_json::Value::Object(args));
    }
    serde_json::to_string(&out).map_err(|err| RenderError::Unrenderable {
        reason: err.to_string(),
    })
}

fn render_entity_key(
    scope: &RenderScope<'_>,
    item: NodeId,
    keys: &plan::Object,
) -> Result<String, RenderError> {
    let mut rendered = Vec::new();
    crate::template::resolve_object(scope.store, keys, Source::Node(item), &mut rendered)?;
    let mut representation: serde_json::Map<String, serde_json::Value> =
        serde_json::from_slice(&rendered).map_err(|_| RenderError::InvalidSourceData)?;
    let type_name = representation.remove("__typename").unwrap_or_default();
    let mut out = serde_json::Map::new();
    out.insert("__typename".to_string(), type_name);
    out.insert("key".to_string(), serde_json::Value::Object(representation));
    serde_json::to_string(&out).map_err(|err| RenderError::Unrenderable {
        reason: err.to_string(),
    })
}

/// One stored payload.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CacheEntry {
    pub key: String,
    pub value: Bytes,
}

/// A cross-request cache for fetch payloads.
///
/// Implementations are shared between concurrent resolves and must synchronize
/// internally.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LoaderCache: Send + Sync {
    /// Looks up every key, returning hits in key order.
    async fn get(&self, keys: &[String]) -> Result<Vec<Option<CacheEntry>>, BoxError>;

    async fn set(&self, entries: Vec<CacheEntry>, ttl: Duration) -> Result<(), BoxError>;

    async fn delete(&self, keys: &[String]) -> Result<(), BoxError>;
}

/// Entity keys resolved during the current pass, pointing at the payload node merged
/// for them.
#[derive(Debug, Default)]
pub(crate) struct L1Cache {
    entries: HashMap<String, NodeId>,
}

impl L1Cache {
    pub(crate) fn get(&self, key: &str) -> Option<NodeId> {
        self.entries.get(key).copied()
    }

    /// Returns the cached payload of every item, or `None` unless all of them hit.
    pub(crate) fn get_all(&self, keys: &[CacheKey]) -> Option<Vec<NodeId>> {
        if keys.is_empty() {
            return None;
        }
        keys.iter()
            .map(|key| key.keys.first().and_then(|key| self.get(key)))
            .collect()
    }

    pub(crate) fn insert(&mut self, key: String, value: NodeId) {
        self.entries.insert(key, value);
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
