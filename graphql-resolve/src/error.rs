//! Resolver errors.
use displaydoc::Display;
use serde::Serialize;
use thiserror::Error;

use crate::graphql;
use crate::graphql::ErrorExtension;
use crate::json_ext::Path;

/// Errors raised while rendering an input template.
#[derive(Error, Display, Debug, Clone, Eq, PartialEq)]
#[non_exhaustive]
pub enum RenderError {
    /// header variable path must contain exactly one element, got {len}
    InvalidHeaderPath { len: usize },

    /// required value missing at '{path}'
    MissingValue { path: String },

    /// source data is not valid JSON
    InvalidSourceData,

    /// value cannot be rendered: {reason}
    Unrenderable { reason: String },
}

/// Error types for a single fetch.
///
/// These are recovered at the fetch node: the loader turns them into GraphQL errors at
/// the fetch path and keeps walking the tree.
#[derive(Error, Display, Debug, Clone, Serialize, Eq, PartialEq)]
#[serde(untagged)]
#[ignore_extra_doc_attributes]
#[non_exhaustive]
pub enum FetchError {
    /// subgraph '{service}' request failed: {reason}
    SubrequestFailed {
        /// The service that failed.
        service: String,

        /// The reason the fetch failed.
        reason: String,
    },

    /// subgraph '{service}' response was malformed: {reason}
    SubrequestMalformedResponse {
        /// The service that responded with the malformed response.
        service: String,

        /// The reason the parsing failed.
        reason: String,
    },

    /// could not render fetch input: {reason}
    InvalidInput {
        /// The render failure.
        reason: String,
    },
}

impl FetchError {
    /// Convert the fetch error to a GraphQL error.
    pub fn to_graphql_error(&self, path: Option<Path>) -> graphql::Error {
        let mut value: serde_json_bytes::Value = serde_json_bytes::to_value(self).unwrap_or_default();
        if let Some(extensions) = value.as_object_mut() {
            extensions
                .entry("code")
                .or_insert_with(|| self.extension_code().into());
        }
        graphql::Error::builder()
            .message(self.to_string())
            .and_path(path)
            .extensions(value.as_object().cloned().unwrap_or_default())
            .build()
    }
}

impl ErrorExtension for FetchError {
    fn extension_code(&self) -> String {
        match self {
            FetchError::SubrequestFailed { .. } => "SUBREQUEST_HTTP_ERROR",
            FetchError::SubrequestMalformedResponse { .. } => "SUBREQUEST_MALFORMED_RESPONSE",
            FetchError::InvalidInput { .. } => "INVALID_FETCH_INPUT",
        }
        .to_string()
    }
}

impl From<RenderError> for FetchError {
    fn from(err: RenderError) -> Self {
        FetchError::InvalidInput {
            reason: err.to_string(),
        }
    }
}

/// Errors that abort a whole resolve call.
#[derive(Error, Display, Debug)]
#[non_exhaustive]
pub enum ResolveError {
    /// the response has deferred parts but the writer cannot flush incremental parts
    DeferredRequiresFlushingWriter,

    /// authorization failed: {0}
    Authorization(String),

    /// rate limiting failed: {0}
    RateLimit(String),

    /// subscription filter template '{0}' renders more than one array
    InvalidSubscriptionFilterTemplate(String),

    /// the resolve was cancelled
    Cancelled,

    /// writing the response failed: {0}
    Write(#[from] std::io::Error),

    /// input template failed to render: {0}
    Render(#[from] RenderError),

    /// response data could not be merged: {0}
    MalformedResponse(String),

    /// the resolver has been shut down
    ResolverClosed,

    /// subscription trigger failed to start: {0}
    SubscriptionStart(String),
}

impl From<serde_json::Error> for ResolveError {
    fn from(err: serde_json::Error) -> Self {
        ResolveError::MalformedResponse(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn fetch_error_to_graphql_error() {
        let error = FetchError::SubrequestFailed {
            service: "products".to_string(),
            reason: "connection refused".to_string(),
        };
        let graphql_error = error.to_graphql_error(Some(Path::from(vec!["me"])));
        assert_eq!(
            graphql_error.to_json(),
            json!({
                "message": "subgraph 'products' request failed: connection refused",
                "path": ["me"],
                "extensions": {
                    "service": "products",
                    "reason": "connection refused",
                    "code": "SUBREQUEST_HTTP_ERROR"
                }
            })
        );
    }

    #[test]
    fn render_error_messages() {
        assert_eq!(
            RenderError::InvalidHeaderPath { len: 2 }.to_string(),
            "header variable path must contain exactly one element, got 2"
        );
        let fetch: FetchError = RenderError::InvalidSourceData.into();
        assert_eq!(
            fetch.to_string(),
            "could not render fetch input: source data is not valid JSON"
        );
    }
}
