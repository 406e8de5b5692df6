//! Deny decisions consulted around fetches.

mod authorization;
mod rate_limit;

pub use authorization::AuthorizationDeny;
pub use authorization::Authorizer;
pub use authorization::NoopAuthorizer;
#[cfg(test)]
pub(crate) use authorization::MockAuthorizer;
pub use rate_limit::RateLimitDeny;
pub use rate_limit::RateLimiter;
pub use rate_limit::WindowRateLimiter;
#[cfg(test)]
pub(crate) use rate_limit::MockRateLimiter;
