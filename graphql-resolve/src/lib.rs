//! Execution core for federated GraphQL responses.
//!
//! A planned response tree carries fetches on its object nodes. The [`Resolver`]
//! loads them against upstream data sources, composes the results in a
//! [`DocumentStore`](store::DocumentStore) and serializes the client response with
//! GraphQL null propagation. Subscriptions run through a single event loop task
//! that fans trigger updates out to per-subscriber workers.

#![cfg_attr(feature = "failfast", allow(unreachable_code))]
#![warn(unreachable_pub)]

macro_rules! failfast_debug {
    ($($tokens:tt)+) => {{
        tracing::debug!($($tokens)+);
        #[cfg(feature = "failfast")]
        panic!(
            "failfast triggered. \
            Please remove the feature failfast if you don't want to see these panics"
        );
    }};
}

macro_rules! failfast_error {
    ($($tokens:tt)+) => {{
        tracing::error!($($tokens)+);
        #[cfg(feature = "failfast")]
        panic!(
            "failfast triggered. \
            Please remove the feature failfast if you don't want to see these panics"
        );
    }};
}

pub mod json_ext;

pub mod cache;
pub mod configuration;
pub mod context;
pub mod error;
pub mod graphql;
mod loader;
pub mod plan;
pub mod policy;
mod resolvable;
pub mod resolver;
pub mod singleflight;
pub mod store;
pub mod subscription;
pub mod template;

pub use configuration::ResolverConfig;
pub use context::Context;
pub use error::ResolveError;
pub use plan::GraphQLResponse;
pub use resolver::Resolver;
