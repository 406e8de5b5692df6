//! Strategies turning a document value into a fragment of an upstream request.

use std::fmt;

use crate::error::RenderError;
use crate::plan;
use crate::store::DocumentStore;
use crate::store::Node;
use crate::store::NodeId;
use crate::store::NodeKind;
use crate::store::array_index;
use crate::store::write_json_str;

/// The value a renderer is applied to: one node, or a list of items printed as an array.
#[derive(Clone, Copy, Debug)]
pub enum Source<'a> {
    Node(NodeId),
    Items(&'a [NodeId]),
}

impl<'a> Source<'a> {
    /// One item renders as that item, several render as an array of them.
    pub fn from_items(items: &'a [NodeId]) -> Option<Self> {
        match items {
            [] => None,
            [item] => Some(Source::Node(*item)),
            items => Some(Source::Items(items)),
        }
    }

    pub(crate) fn select<S: AsRef<str>>(self, store: &DocumentStore, path: &[S]) -> Option<Self> {
        match self {
            Source::Node(id) => store.get(id, path).map(Source::Node),
            Source::Items(items) => match path.split_first() {
                None => Some(self),
                Some((first, rest)) => {
                    let item = items.get(array_index(first.as_ref())?)?;
                    store.get(*item, rest).map(Source::Node)
                }
            },
        }
    }

    fn node(self) -> Option<NodeId> {
        match self {
            Source::Node(id) => Some(id),
            Source::Items(_) => None,
        }
    }

    fn is_defined(self, store: &DocumentStore) -> bool {
        match self {
            Source::Node(id) => store.is_defined(Some(id)),
            Source::Items(_) => true,
        }
    }
}

pub trait VariableRenderer: fmt::Debug + Send + Sync {
    fn kind(&self) -> &'static str;

    fn render(&self, store: &DocumentStore, value: Source<'_>, out: &mut Vec<u8>) -> Result<(), RenderError>;
}

fn io_error(err: std::io::Error) -> RenderError {
    RenderError::Unrenderable {
        reason: err.to_string(),
    }
}

fn print_json(store: &DocumentStore, value: Source<'_>, out: &mut Vec<u8>) -> Result<(), RenderError> {
    match value {
        Source::Node(id) => store.print_node(id, out),
        Source::Items(items) => store.print_items(items, out),
    }
    .map_err(io_error)
}

/// Strings render without quotes, everything else as JSON.
#[derive(Clone, Copy, Debug, Default)]
pub struct PlainVariableRenderer;

impl VariableRenderer for PlainVariableRenderer {
    fn kind(&self) -> &'static str {
        "plain"
    }

    fn render(&self, store: &DocumentStore, value: Source<'_>, out: &mut Vec<u8>) -> Result<(), RenderError> {
        if let Some(s) = store.string_value(value.node()) {
            out.extend_from_slice(s.as_bytes());
            return Ok(());
        }
        print_json(store, value, out)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct JsonVariableRenderer;

impl VariableRenderer for JsonVariableRenderer {
    fn kind(&self) -> &'static str {
        "json"
    }

    fn render(&self, store: &DocumentStore, value: Source<'_>, out: &mut Vec<u8>) -> Result<(), RenderError> {
        print_json(store, value, out)
    }
}

/// Renders a GraphQL input literal meant to sit inside a JSON-encoded operation string:
/// object keys are bare and strings are wrapped in escaped quotes.
#[derive(Clone, Copy, Debug, Default)]
pub struct GraphQlVariableRenderer;

impl GraphQlVariableRenderer {
    fn render_node(store: &DocumentStore, id: NodeId, out: &mut Vec<u8>) -> Result<(), RenderError> {
        match store.node(id) {
            Node::String(s) => {
                out.extend_from_slice(br#"\""#);
                for byte in s.bytes() {
                    if byte == b'"' {
                        out.extend_from_slice(br#"\\\""#);
                    } else {
                        out.push(byte);
                    }
                }
                out.extend_from_slice(br#"\""#);
            }
            Node::Object(fields) => {
                out.push(b'{');
                for (i, (key, value)) in fields.iter().enumerate() {
                    if i != 0 {
                        out.push(b',');
                    }
                    out.extend_from_slice(key.as_bytes());
                    out.push(b':');
                    Self::render_node(store, *value, out)?;
                }
                out.push(b'}');
            }
            Node::Array(values) => Self::render_list(store, values, out)?,
            _ => store.print_node(id, out).map_err(io_error)?,
        }
        Ok(())
    }

    fn render_list(store: &DocumentStore, values: &[NodeId], out: &mut Vec<u8>) -> Result<(), RenderError> {
        out.push(b'[');
        for (i, value) in values.iter().enumerate() {
            if i != 0 {
                out.push(b',');
            }
            Self::render_node(store, *value, out)?;
        }
        out.push(b']');
        Ok(())
    }
}

impl VariableRenderer for GraphQlVariableRenderer {
    fn kind(&self) -> &'static str {
        "graphql"
    }

    fn render(&self, store: &DocumentStore, value: Source<'_>, out: &mut Vec<u8>) -> Result<(), RenderError> {
        match value {
            Source::Node(id) => Self::render_node(store, id, out),
            Source::Items(items) => Self::render_list(store, items, out),
        }
    }
}

/// Joins the values of a list with commas, strings unquoted. Non-list values render nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct CsvVariableRenderer;

impl VariableRenderer for CsvVariableRenderer {
    fn kind(&self) -> &'static str {
        "csv"
    }

    fn render(&self, store: &DocumentStore, value: Source<'_>, out: &mut Vec<u8>) -> Result<(), RenderError> {
        let values = match value {
            Source::Node(id) => store.array_values(id),
            Source::Items(items) => items,
        };
        for (i, value) in values.iter().enumerate() {
            if i != 0 {
                out.push(b',');
            }
            match store.node(*value) {
                Node::String(s) => out.extend_from_slice(s.as_bytes()),
                _ => store.print_node(*value, out).map_err(io_error)?,
            }
        }
        Ok(())
    }
}

/// Projects the value through a response subtree and prints the result as JSON.
///
/// Used for entity representations: only the selected key fields are sent upstream.
#[derive(Clone, Debug)]
pub struct GraphQlResolveRenderer {
    node: plan::Node,
}

impl GraphQlResolveRenderer {
    pub fn new(node: impl Into<plan::Node>) -> Self {
        Self { node: node.into() }
    }

    pub fn node(&self) -> &plan::Node {
        &self.node
    }
}

impl VariableRenderer for GraphQlResolveRenderer {
    fn kind(&self) -> &'static str {
        "graphqlResolve"
    }

    fn render(&self, store: &DocumentStore, value: Source<'_>, out: &mut Vec<u8>) -> Result<(), RenderError> {
        resolve_node(store, &self.node, Some(value), out)
    }
}

/// Prints `node` as resolved against `value`: nullable misses print `null`, non-null
/// misses fail.
pub(crate) fn resolve_node(
    store: &DocumentStore,
    node: &plan::Node,
    value: Option<Source<'_>>,
    out: &mut Vec<u8>,
) -> Result<(), RenderError> {
    let selected = value.and_then(|value| value.select(store, node.path()));
    let defined = selected.filter(|selected| selected.is_defined(store));
    let Some(selected) = defined else {
        return match node {
            plan::Node::EmptyObject => {
                out.extend_from_slice(b"{}");
                Ok(())
            }
            plan::Node::EmptyArray => {
                out.extend_from_slice(b"[]");
                Ok(())
            }
            node if node.nullable() => {
                out.extend_from_slice(b"null");
                Ok(())
            }
            node => Err(RenderError::MissingValue {
                path: node.path().join("."),
            }),
        };
    };
    match node {
        plan::Node::Object(object) => resolve_object(store, object, selected, out),
        plan::Node::Array(array) => {
            let single;
            let items = match selected {
                Source::Node(id) if store.kind(id) == NodeKind::Array => store.array_values(id),
                Source::Items(items) => items,
                // a lone item of the item set stands for a list of one
                Source::Node(id) if array.path.is_empty() && store.kind(id) == NodeKind::Object => {
                    single = [id];
                    &single[..]
                }
                Source::Node(_) => {
                    return Err(RenderError::Unrenderable {
                        reason: format!("expected a list at '{}'", array.path.join(".")),
                    });
                }
            };
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i != 0 {
                    out.push(b',');
                }
                resolve_node(store, &array.item, Some(Source::Node(*item)), out)?;
            }
            out.push(b']');
            Ok(())
        }
        plan::Node::Null => {
            out.extend_from_slice(b"null");
            Ok(())
        }
        plan::Node::EmptyObject => {
            out.extend_from_slice(b"{}");
            Ok(())
        }
        plan::Node::EmptyArray => {
            out.extend_from_slice(b"[]");
            Ok(())
        }
        _ => print_json(store, selected, out),
    }
}

/// Prints the fields of `object` read from `value`, which must be an object node.
pub(crate) fn resolve_object(
    store: &DocumentStore,
    object: &plan::Object,
    value: Source<'_>,
    out: &mut Vec<u8>,
) -> Result<(), RenderError> {
    let id = match value {
        Source::Node(id) if store.kind(id) == NodeKind::Object => id,
        _ => {
            return Err(RenderError::Unrenderable {
                reason: format!("expected an object at '{}'", object.path.join(".")),
            });
        }
    };
    let type_name = store.string_value(store.object_field(id, "__typename"));
    out.push(b'{');
    let mut first = true;
    for field in &object.fields {
        if !field.on_type_names.is_empty()
            && !type_name.is_some_and(|t| field.on_type_names.iter().any(|n| n == t))
        {
            continue;
        }
        if !first {
            out.push(b',');
        }
        first = false;
        write_json_str(out, &field.name).map_err(io_error)?;
        out.push(b':');
        resolve_node(store, &field.value, Some(Source::Node(id)), out)?;
    }
    out.push(b'}');
    Ok(())
}
