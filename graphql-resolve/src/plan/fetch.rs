use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use derivative::Derivative;
use http::HeaderMap;
use serde::Deserialize;
use serde::Serialize;
use tower::BoxError;

use crate::cache::FetchCacheConfiguration;
use crate::plan::OperationType;
use crate::template::InputTemplate;

/// An upstream service the loader can send a rendered request to.
///
/// Called concurrently from parallel fetches, with no ordering guarantee.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DataSource: Send + Sync {
    async fn load(&self, headers: &HeaderMap, input: Bytes) -> Result<Bytes, BoxError>;
}

/// A planned unit of upstream work, attached to an object of the response tree.
#[derive(Clone, Debug)]
pub enum Fetch {
    Single(Box<SingleFetch>),
    /// Children run one after the other, each merged before the next starts.
    Serial(Vec<Fetch>),
    /// Children run concurrently and are merged in declared order.
    Parallel(Vec<Fetch>),
    /// The fetch runs once per item of the current item set.
    ParallelListItem(Box<SingleFetch>),
    Entity(Box<EntityFetch>),
    BatchEntity(Box<BatchEntityFetch>),
}

impl Fetch {
    pub fn single(fetch: SingleFetch) -> Self {
        Fetch::Single(Box::new(fetch))
    }

    pub fn configuration(&self) -> Option<&FetchConfiguration> {
        match self {
            Fetch::Single(fetch) | Fetch::ParallelListItem(fetch) => Some(&fetch.config),
            Fetch::Entity(fetch) => Some(&fetch.config),
            Fetch::BatchEntity(fetch) => Some(&fetch.config),
            Fetch::Serial(_) | Fetch::Parallel(_) => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SingleFetch {
    pub input: InputTemplate,
    pub config: FetchConfiguration,
}

/// Fetches one entity per item: each request is `header + item + footer`. Items
/// rendering to `null` or `{}` are not sent.
#[derive(Clone, Debug)]
pub struct EntityFetch {
    pub input: EntityInput,
    pub config: FetchConfiguration,
}

#[derive(Clone, Debug, Default)]
pub struct EntityInput {
    pub header: InputTemplate,
    pub item: InputTemplate,
    /// An item that fails to render is skipped instead of failing the fetch.
    pub skip_err_item: bool,
    pub footer: InputTemplate,
}

/// Fetches many entities in one request, sending each distinct representation once.
#[derive(Clone, Debug)]
pub struct BatchEntityFetch {
    pub input: BatchInput,
    pub config: FetchConfiguration,
}

#[derive(Clone, Debug, Default)]
pub struct BatchInput {
    pub header: InputTemplate,
    /// Each item of the item set is rendered with every template.
    pub items: Vec<InputTemplate>,
    pub skip_null_items: bool,
    pub skip_empty_object_items: bool,
    pub skip_err_items: bool,
    pub separator: InputTemplate,
    pub footer: InputTemplate,
}

#[derive(Clone, Derivative)]
#[derivative(Debug)]
pub struct FetchConfiguration {
    #[derivative(Debug = "ignore")]
    pub data_source: Arc<dyn DataSource>,
    pub post_processing: PostProcessing,
    pub caching: FetchCacheConfiguration,
    pub info: Option<FetchInfo>,
}

#[buildstructor::buildstructor]
impl FetchConfiguration {
    #[builder(visibility = "pub")]
    fn new(
        data_source: Arc<dyn DataSource>,
        post_processing: Option<PostProcessing>,
        caching: Option<FetchCacheConfiguration>,
        info: Option<FetchInfo>,
    ) -> Self {
        Self {
            data_source,
            post_processing: post_processing.unwrap_or_default(),
            caching: caching.unwrap_or_default(),
            info,
        }
    }
}

impl FetchConfiguration {
    pub(crate) fn data_source_name(&self) -> &str {
        self.info
            .as_ref()
            .map(|info| info.data_source_name.as_str())
            .unwrap_or_default()
    }

    pub(crate) fn data_source_id(&self) -> &str {
        self.info
            .as_ref()
            .map(|info| info.data_source_id.as_str())
            .unwrap_or_default()
    }
}

/// Where to find payload and errors in an upstream response, and where to graft it.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PostProcessing {
    /// Path of the payload. Empty selects the whole response.
    pub select_response_data_path: Vec<String>,
    /// Path of the error list. Empty disables error selection.
    pub select_response_errors_path: Vec<String>,
    /// Sub-path below each item where the payload is grafted.
    pub merge_path: Vec<String>,
}

impl PostProcessing {
    pub fn data_and_errors<S: Into<String>>(data_path: impl IntoIterator<Item = S>) -> Self {
        Self {
            select_response_data_path: data_path.into_iter().map(Into::into).collect(),
            select_response_errors_path: vec!["errors".to_string()],
            merge_path: Vec::new(),
        }
    }

    pub fn with_merge_path<S: Into<String>>(mut self, merge_path: impl IntoIterator<Item = S>) -> Self {
        self.merge_path = merge_path.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FetchInfo {
    pub data_source_id: String,
    pub data_source_name: String,
    pub root_fields: Vec<GraphCoordinate>,
    pub operation_type: OperationType,
}

impl FetchInfo {
    pub fn new(data_source: impl Into<String>, root_fields: Vec<GraphCoordinate>) -> Self {
        let data_source = data_source.into();
        Self {
            data_source_id: data_source.clone(),
            data_source_name: data_source,
            root_fields,
            operation_type: OperationType::Query,
        }
    }
}

/// Identifies a schema field for policy decisions.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphCoordinate {
    pub type_name: String,
    pub field_name: String,
    #[serde(skip)]
    pub has_authorization_rule: bool,
}

impl GraphCoordinate {
    pub fn new(type_name: impl Into<String>, field_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            field_name: field_name.into(),
            has_authorization_rule: false,
        }
    }

    pub fn with_authorization_rule(mut self) -> Self {
        self.has_authorization_rule = true;
        self
    }
}
