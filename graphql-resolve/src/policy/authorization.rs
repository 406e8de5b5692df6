use tower::BoxError;

use crate::context::Context;
use crate::plan::GraphCoordinate;

/// A refusal to load a field.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct AuthorizationDeny {
    /// Shown to the client. May be empty.
    pub reason: String,
}

impl AuthorizationDeny {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Decides whether fields carrying an authorization rule may be loaded.
///
/// Called concurrently from the fetches of one resolve pass.
#[cfg_attr(test, mockall::automock)]
pub trait Authorizer: Send + Sync {
    /// Checks a root field before its fetch is sent. `input` is the rendered request.
    fn authorize_pre_fetch(
        &self,
        ctx: &Context,
        data_source_id: &str,
        input: &[u8],
        coordinate: &GraphCoordinate,
    ) -> Result<Option<AuthorizationDeny>, BoxError>;

    /// Checks a field of a loaded object. `object` holds the scalar fields of the
    /// enclosing object as JSON.
    fn authorize_object_field(
        &self,
        ctx: &Context,
        data_source_id: &str,
        object: &[u8],
        coordinate: &GraphCoordinate,
    ) -> Result<Option<AuthorizationDeny>, BoxError>;

    /// Whether [`Authorizer::render_response_extension`] has anything to add under
    /// `extensions.authorization`.
    fn has_response_extension_data(&self, _ctx: &Context) -> bool {
        false
    }

    fn render_response_extension(&self, _ctx: &Context, _out: &mut Vec<u8>) -> Result<(), BoxError> {
        Ok(())
    }
}

/// Allows everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopAuthorizer;

impl Authorizer for NoopAuthorizer {
    fn authorize_pre_fetch(
        &self,
        _ctx: &Context,
        _data_source_id: &str,
        _input: &[u8],
        _coordinate: &GraphCoordinate,
    ) -> Result<Option<AuthorizationDeny>, BoxError> {
        Ok(None)
    }

    fn authorize_object_field(
        &self,
        _ctx: &Context,
        _data_source_id: &str,
        _object: &[u8],
        _coordinate: &GraphCoordinate,
    ) -> Result<Option<AuthorizationDeny>, BoxError> {
        Ok(None)
    }
}
