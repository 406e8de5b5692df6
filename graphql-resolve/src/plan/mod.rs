//! The planned response: response nodes with their attached fetch tree.
//!
//! Plans are built once by a query planner and shared read-only between executions.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

pub mod fetch;
pub mod node;

pub use fetch::BatchEntityFetch;
pub use fetch::BatchInput;
pub use fetch::DataSource;
pub use fetch::EntityFetch;
pub use fetch::EntityInput;
pub use fetch::Fetch;
pub use fetch::FetchConfiguration;
pub use fetch::FetchInfo;
pub use fetch::GraphCoordinate;
pub use fetch::PostProcessing;
pub use fetch::SingleFetch;
pub use node::Array;
pub use node::Field;
pub use node::FieldInfo;
pub use node::Node;
pub use node::Object;
pub use node::Scalar;

#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    #[default]
    Query,
    Mutation,
    Subscription,
}

impl OperationType {
    /// Name of the root type, as used in field paths.
    pub fn root_type_name(self) -> &'static str {
        match self {
            OperationType::Query => "Query",
            OperationType::Mutation => "Mutation",
            OperationType::Subscription => "Subscription",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OperationType::Query => "query",
            OperationType::Mutation => "mutation",
            OperationType::Subscription => "subscription",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "query" => Ok(OperationType::Query),
            "mutation" => Ok(OperationType::Mutation),
            "subscription" => Ok(OperationType::Subscription),
            other => Err(format!("unknown operation type '{other}'")),
        }
    }
}

/// A planned synchronous response.
#[derive(Clone, Debug, Default)]
pub struct GraphQLResponse {
    pub data: Object,
    pub operation_type: OperationType,
    /// Parts resolved and flushed after the initial payload, in order.
    pub deferred: Vec<DeferredResponse>,
}

impl GraphQLResponse {
    pub fn new(data: Object) -> Self {
        Self {
            data,
            ..Default::default()
        }
    }
}

/// An incremental part of a response.
#[derive(Clone, Debug, Default)]
pub struct DeferredResponse {
    pub label: Option<String>,
    /// Object resolved against the response root. Its fetches run before it is printed.
    pub data: Object,
}
