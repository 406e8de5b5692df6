//! Input templates: upstream request bodies with holes filled from the document,
//! the request variables or the request headers.

use std::sync::Arc;

use bytes::Bytes;
use http::HeaderMap;
use itertools::Itertools;

use crate::error::RenderError;
use crate::store::DocumentStore;
use crate::store::NodeId;

mod renderer;

pub use renderer::CsvVariableRenderer;
pub use renderer::GraphQlResolveRenderer;
pub use renderer::GraphQlVariableRenderer;
pub use renderer::JsonVariableRenderer;
pub use renderer::PlainVariableRenderer;
pub use renderer::Source;
pub use renderer::VariableRenderer;
pub(crate) use renderer::resolve_object;

/// Key under which omitted request variables are reported to the upstream.
pub const UNDEFINED_VARIABLES: &str = "undefined";

#[derive(Clone, Debug, Default)]
pub struct InputTemplate {
    pub segments: Vec<TemplateSegment>,
    /// A variable resolving to `null` turns the whole output into `null`.
    ///
    /// Batch fetches rely on this to drop a single item.
    pub set_template_output_to_null_on_variable_null: bool,
}

#[derive(Clone, Debug)]
pub enum TemplateSegment {
    Static(Bytes),
    Variable(Variable),
}

impl TemplateSegment {
    pub fn text(text: impl Into<Bytes>) -> Self {
        TemplateSegment::Static(text.into())
    }
}

#[derive(Clone, Debug)]
pub enum Variable {
    /// A request variable.
    Context {
        path: Vec<String>,
        renderer: Arc<dyn VariableRenderer>,
    },
    /// A value read from the current item.
    Object {
        path: Vec<String>,
        renderer: Arc<dyn VariableRenderer>,
    },
    /// A request header. The path holds exactly the header name.
    Header { path: Vec<String> },
    /// The current item, rendered as a whole.
    ResolvableObject { renderer: Arc<dyn VariableRenderer> },
}

/// What templates read besides the current item.
#[derive(Clone, Copy)]
pub struct RenderScope<'a> {
    pub store: &'a DocumentStore,
    pub variables: Option<NodeId>,
    pub headers: &'a HeaderMap,
}

enum Outcome {
    Rendered,
    Null,
}

impl InputTemplate {
    pub fn new(segments: Vec<TemplateSegment>) -> Self {
        Self {
            segments,
            set_template_output_to_null_on_variable_null: false,
        }
    }

    pub fn null_on_variable_null(mut self) -> Self {
        self.set_template_output_to_null_on_variable_null = true;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Renders the template into `out`, then reports omitted request variables under
    /// [`UNDEFINED_VARIABLES`].
    pub fn render(
        &self,
        scope: &RenderScope<'_>,
        data: Option<Source<'_>>,
        out: &mut Vec<u8>,
    ) -> Result<(), RenderError> {
        let start = out.len();
        let mut undefined = Vec::new();
        self.render_and_collect_undefined(scope, data, out, &mut undefined)?;
        if undefined.is_empty() {
            return Ok(());
        }
        let rendered = out.split_off(start);
        out.extend(set_undefined_variables(&rendered, &undefined)?);
        Ok(())
    }

    /// Renders without the post-pass, collecting the names of omitted request variables.
    pub fn render_and_collect_undefined(
        &self,
        scope: &RenderScope<'_>,
        data: Option<Source<'_>>,
        out: &mut Vec<u8>,
        undefined: &mut Vec<String>,
    ) -> Result<(), RenderError> {
        let start = out.len();
        for segment in &self.segments {
            let outcome = match segment {
                TemplateSegment::Static(bytes) => {
                    out.extend_from_slice(bytes);
                    Outcome::Rendered
                }
                TemplateSegment::Variable(variable) => {
                    self.render_variable(scope, data, variable, out, undefined)?
                }
            };
            if let Outcome::Null = outcome {
                out.truncate(start);
                out.extend_from_slice(b"null");
                return Ok(());
            }
        }
        Ok(())
    }

    fn render_variable(
        &self,
        scope: &RenderScope<'_>,
        data: Option<Source<'_>>,
        variable: &Variable,
        out: &mut Vec<u8>,
        undefined: &mut Vec<String>,
    ) -> Result<Outcome, RenderError> {
        let store = scope.store;
        match variable {
            Variable::Object { path, renderer } => {
                let value = data.and_then(|data| data.select(store, path));
                match value {
                    Some(value) if !is_null(store, value) => {
                        renderer.render(store, value, out)?;
                    }
                    _ if self.set_template_output_to_null_on_variable_null => {
                        return Ok(Outcome::Null);
                    }
                    _ => out.extend_from_slice(b"null"),
                }
            }
            Variable::Context { path, renderer } => {
                let value = scope.variables.and_then(|variables| store.get(variables, path));
                match value {
                    None => {
                        out.extend_from_slice(b"null");
                        if let Some(name) = path.first() {
                            undefined.push(name.clone());
                        }
                    }
                    Some(value) if is_null(store, Source::Node(value)) => {
                        if self.set_template_output_to_null_on_variable_null {
                            return Ok(Outcome::Null);
                        }
                        out.extend_from_slice(b"null");
                    }
                    Some(value) => renderer.render(store, Source::Node(value), out)?,
                }
            }
            Variable::ResolvableObject { renderer } => match data {
                Some(data) => renderer.render(store, data, out)?,
                None => out.extend_from_slice(b"null"),
            },
            Variable::Header { path } => {
                let [name] = path.as_slice() else {
                    return Err(RenderError::InvalidHeaderPath { len: path.len() });
                };
                let joined = scope
                    .headers
                    .get_all(name.as_str())
                    .iter()
                    .map(|value| String::from_utf8_lossy(value.as_bytes()))
                    .join(",");
                out.extend_from_slice(joined.as_bytes());
            }
        }
        Ok(Outcome::Rendered)
    }
}

fn is_null(store: &DocumentStore, value: Source<'_>) -> bool {
    match value {
        Source::Node(id) => !store.is_defined(Some(id)),
        Source::Items(_) => false,
    }
}

/// Sets the top level `"undefined"` key of a rendered JSON object to the list of names.
pub fn set_undefined_variables(rendered: &[u8], undefined: &[String]) -> Result<Vec<u8>, RenderError> {
    let mut value: serde_json::Value =
        serde_json::from_slice(rendered).map_err(|_| RenderError::InvalidSourceData)?;
    let Some(object) = value.as_object_mut() else {
        return Err(RenderError::Unrenderable {
            reason: "undefined variables can only be set on an object".to_string(),
        });
    };
    object.insert(
        UNDEFINED_VARIABLES.to_string(),
        serde_json::Value::from(undefined.to_vec()),
    );
    serde_json::to_vec(&value).map_err(|err| RenderError::Unrenderable {
        reason: err.to_string(),
    })
}
