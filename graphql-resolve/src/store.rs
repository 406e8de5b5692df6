//! Arena-backed JSON document used to compose a response.
//!
//! Nodes are addressed by [`NodeId`] handles into a growable vector. Merging grafts
//! handles instead of copying subtrees, and a whole document is released at once with
//! [`DocumentStore::reset`]. Handles stay valid until then.
//!
//! A payload grafted at more than one place must be copied with
//! [`DocumentStore::copy_subtree`] first: [`DocumentStore::set_null`] rewrites a node in
//! place, so it must have a single parent.

use std::io;
use std::io::Write;

use indexmap::IndexMap;
use serde_json::Number;

use crate::graphql;
use crate::json_ext::Path;

/// Handle to a node of a [`DocumentStore`].
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct NodeId(u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A JSON value stored in the arena. Containers hold handles, not values.
#[derive(Clone, Debug, PartialEq)]
pub enum Node {
    Object(IndexMap<String, NodeId>),
    Array(Vec<NodeId>),
    String(String),
    Number(Number),
    Bool(bool),
    Null,
    /// Left behind by a denied fetch. Reads as absent, and the serializer does not
    /// report non-null violations for it since the denial already produced an error.
    NullSkipError,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NodeKind {
    Object,
    Array,
    String,
    Number,
    Bool,
    Null,
    NullSkipError,
}

impl Node {
    pub fn kind(&self) -> NodeKind {
        match self {
            Node::Object(_) => NodeKind::Object,
            Node::Array(_) => NodeKind::Array,
            Node::String(_) => NodeKind::String,
            Node::Number(_) => NodeKind::Number,
            Node::Bool(_) => NodeKind::Bool,
            Node::Null => NodeKind::Null,
            Node::NullSkipError => NodeKind::NullSkipError,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct DocumentStore {
    nodes: Vec<Node>,
}

impl DocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops every node. All handles handed out so far become invalid.
    pub fn reset(&mut self) {
        self.nodes.clear();
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    pub fn kind(&self, id: NodeId) -> NodeKind {
        self.node(id).kind()
    }

    pub fn append(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    pub fn append_object(&mut self) -> NodeId {
        self.append(Node::Object(IndexMap::new()))
    }

    pub fn append_array(&mut self) -> NodeId {
        self.append(Node::Array(Vec::new()))
    }

    pub fn append_null(&mut self) -> NodeId {
        self.append(Node::Null)
    }

    pub fn append_null_skip_error(&mut self) -> NodeId {
        self.append(Node::NullSkipError)
    }

    pub fn append_string(&mut self, value: impl Into<String>) -> NodeId {
        self.append(Node::String(value.into()))
    }

    /// Parses `bytes` as any JSON value and appends it.
    pub fn append_json(&mut self, bytes: &[u8]) -> Result<NodeId, serde_json::Error> {
        let value: serde_json::Value = serde_json::from_slice(bytes)?;
        Ok(self.append_value(&value))
    }

    pub fn append_value(&mut self, value: &serde_json::Value) -> NodeId {
        let node = match value {
            serde_json::Value::Null => Node::Null,
            serde_json::Value::Bool(b) => Node::Bool(*b),
            serde_json::Value::Number(n) => Node::Number(n.clone()),
            serde_json::Value::String(s) => Node::String(s.clone()),
            serde_json::Value::Array(values) => {
                let values = values.iter().map(|v| self.append_value(v)).collect();
                Node::Array(values)
            }
            serde_json::Value::Object(fields) => {
                let fields = fields
                    .iter()
                    .map(|(k, v)| (k.clone(), self.append_value(v)))
                    .collect();
                Node::Object(fields)
            }
        };
        self.append(node)
    }

    /// Creates the data root (an object, merged with `initial_data` when given) and the
    /// errors root (an empty array).
    pub fn init_resolvable(
        &mut self,
        initial_data: Option<&[u8]>,
    ) -> Result<(NodeId, NodeId), serde_json::Error> {
        let data = self.append_object();
        if let Some(initial_data) = initial_data.filter(|data| !data.is_empty()) {
            let initial = self.append_json(initial_data)?;
            self.merge_nodes(data, initial);
        }
        let errors = self.append_array();
        Ok((data, errors))
    }

    /// Resolves `path` from `id`. Object segments are keys, array segments are indices
    /// written as `[0]` or `0`. Returns `None` when any segment is absent.
    pub fn get<S: AsRef<str>>(&self, id: NodeId, path: &[S]) -> Option<NodeId> {
        let mut current = id;
        for segment in path {
            let segment = segment.as_ref();
            match self.node(current) {
                Node::Object(fields) => current = *fields.get(segment)?,
                Node::Array(values) => current = *values.get(array_index(segment)?)?,
                Node::NullSkipError => return Some(current),
                _ => return None,
            }
        }
        Some(current)
    }

    pub fn object_field(&self, id: NodeId, key: &str) -> Option<NodeId> {
        match self.node(id) {
            Node::Object(fields) => fields.get(key).copied(),
            _ => None,
        }
    }

    /// A node is defined when it exists and is neither `null` nor a skip placeholder.
    pub fn is_defined(&self, id: Option<NodeId>) -> bool {
        match id {
            Some(id) => !matches!(self.node(id), Node::Null | Node::NullSkipError),
            None => false,
        }
    }

    pub fn is_null_skip_error(&self, id: Option<NodeId>) -> bool {
        id.is_some_and(|id| matches!(self.node(id), Node::NullSkipError))
    }

    pub fn array_values(&self, id: NodeId) -> &[NodeId] {
        match self.node(id) {
            Node::Array(values) => values,
            _ => &[],
        }
    }

    pub fn string_value(&self, id: Option<NodeId>) -> Option<&str> {
        match id.map(|id| self.node(id)) {
            Some(Node::String(s)) => Some(s),
            _ => None,
        }
    }

    pub fn object_len(&self, id: NodeId) -> usize {
        match self.node(id) {
            Node::Object(fields) => fields.len(),
            _ => 0,
        }
    }

    pub fn set_object_field(&mut self, object: NodeId, key: impl Into<String>, value: NodeId) {
        match &mut self.nodes[object.index()] {
            Node::Object(fields) => {
                fields.insert(key.into(), value);
            }
            other => {
                failfast_debug!("cannot set a field on a {:?} node", other.kind());
            }
        }
    }

    pub fn array_push(&mut self, array: NodeId, value: NodeId) {
        match &mut self.nodes[array.index()] {
            Node::Array(values) => values.push(value),
            other => {
                failfast_debug!("cannot push onto a {:?} node", other.kind());
            }
        }
    }

    pub fn array_truncate(&mut self, array: NodeId, len: usize) {
        if let Node::Array(values) = &mut self.nodes[array.index()] {
            values.truncate(len);
        }
    }

    /// Turns the node into `null` in place, for every path that references it.
    pub fn set_null(&mut self, id: NodeId) {
        self.nodes[id.index()] = Node::Null;
    }

    /// Appends a copy of the subtree below `id` that shares no node with it.
    pub fn copy_subtree(&mut self, id: NodeId) -> NodeId {
        let node = match self.node(id) {
            Node::Object(fields) => {
                let fields = fields.clone();
                Node::Object(
                    fields
                        .into_iter()
                        .map(|(key, value)| (key, self.copy_subtree(value)))
                        .collect(),
                )
            }
            Node::Array(values) => {
                let values = values.clone();
                Node::Array(values.into_iter().map(|value| self.copy_subtree(value)).collect())
            }
            scalar => scalar.clone(),
        };
        self.append(node)
    }

    /// Merges `src` into `dst`. Object keys of `src` overwrite those of `dst`; any other
    /// value replaces `dst` entirely. A `null` source leaves `dst` untouched.
    pub fn merge_nodes(&mut self, dst: NodeId, src: NodeId) {
        if dst == src {
            return;
        }
        match (self.node(dst), self.node(src)) {
            (_, Node::Null) => {}
            (Node::Object(_), Node::Object(src_fields)) => {
                let src_fields = src_fields.clone();
                if let Node::Object(dst_fields) = &mut self.nodes[dst.index()] {
                    dst_fields.extend(src_fields);
                }
            }
            (_, src_node) => {
                let replacement = src_node.clone();
                self.nodes[dst.index()] = replacement;
            }
        }
    }

    /// Grafts `src` at `merge_path` below `dst`. Intermediate objects are created when
    /// missing. Whatever is stored at the insertion point is replaced by `src`.
    pub fn merge_nodes_with_path<S: AsRef<str>>(&mut self, dst: NodeId, src: NodeId, merge_path: &[S]) {
        let Some((last, parents)) = merge_path.split_last() else {
            self.merge_nodes(dst, src);
            return;
        };
        let mut current = dst;
        for segment in parents {
            let segment = segment.as_ref();
            current = match self.object_field(current, segment) {
                Some(child) if self.kind(child) == NodeKind::Object => child,
                _ => {
                    if self.kind(current) != NodeKind::Object {
                        failfast_debug!("merge path '{}' crosses a non-object node", segment);
                        return;
                    }
                    let child = self.append_object();
                    self.set_object_field(current, segment, child);
                    child
                }
            };
        }
        if self.kind(current) != NodeKind::Object {
            failfast_debug!("merge target is not an object");
            return;
        }
        self.set_object_field(current, last.as_ref(), src);
    }

    /// Appends the values of the `src` array to the `dst` array.
    pub fn merge_arrays(&mut self, dst: NodeId, src: NodeId) {
        let values = self.array_values(src).to_vec();
        match &mut self.nodes[dst.index()] {
            Node::Array(dst_values) => dst_values.extend(values),
            other => {
                failfast_debug!("cannot merge an array into a {:?} node", other.kind());
            }
        }
    }

    /// Appends a GraphQL error object.
    pub fn append_error(&mut self, error: &graphql::Error) -> NodeId {
        self.append_value(&error.to_json())
    }

    /// Appends `{"message":...,"path":[...]}`, leaving out an empty path.
    pub fn append_error_with_message(&mut self, message: impl Into<String>, path: &Path) -> NodeId {
        let error = graphql::Error::builder()
            .message(message)
            .and_path((!path.is_empty()).then(|| path.clone()))
            .build();
        self.append_error(&error)
    }

    pub fn append_non_nullable_field_is_null_error(&mut self, field_path: &str, path: &Path) -> NodeId {
        self.append_error_with_message(
            format!("Cannot return null for non-nullable field '{field_path}'."),
            path,
        )
    }

    pub fn print_node<W: Write + ?Sized>(&self, id: NodeId, out: &mut W) -> io::Result<()> {
        match self.node(id) {
            Node::Object(fields) => {
                out.write_all(b"{")?;
                for (i, (key, value)) in fields.iter().enumerate() {
                    if i != 0 {
                        out.write_all(b",")?;
                    }
                    write_json_str(out, key)?;
                    out.write_all(b":")?;
                    self.print_node(*value, out)?;
                }
                out.write_all(b"}")
            }
            Node::Array(values) => self.print_items(values, out),
            Node::String(s) => write_json_str(out, s),
            Node::Number(n) => write!(out, "{n}"),
            Node::Bool(true) => out.write_all(b"true"),
            Node::Bool(false) => out.write_all(b"false"),
            Node::Null | Node::NullSkipError => out.write_all(b"null"),
        }
    }

    /// Prints `items` as one JSON array.
    pub fn print_items<W: Write + ?Sized>(&self, items: &[NodeId], out: &mut W) -> io::Result<()> {
        out.write_all(b"[")?;
        for (i, item) in items.iter().enumerate() {
            if i != 0 {
                out.write_all(b",")?;
            }
            self.print_node(*item, out)?;
        }
        out.write_all(b"]")
    }

    /// Prints only the scalar fields of an object.
    pub fn print_object_flat<W: Write + ?Sized>(&self, id: NodeId, out: &mut W) -> io::Result<()> {
        out.write_all(b"{")?;
        if let Node::Object(fields) = self.node(id) {
            let mut first = true;
            for (key, value) in fields {
                if !matches!(
                    self.node(*value),
                    Node::String(_) | Node::Number(_) | Node::Bool(_) | Node::Null
                ) {
                    continue;
                }
                if !first {
                    out.write_all(b",")?;
                }
                first = false;
                write_json_str(out, key)?;
                out.write_all(b":")?;
                self.print_node(*value, out)?;
            }
        }
        out.write_all(b"}")
    }

    pub fn to_json_bytes(&self, id: NodeId) -> Vec<u8> {
        let mut out = Vec::new();
        // writing into a Vec cannot fail
        let _ = self.print_node(id, &mut out);
        out
    }

    pub fn to_json_string(&self, id: NodeId) -> String {
        String::from_utf8_lossy(&self.to_json_bytes(id)).into_owned()
    }

    pub fn to_value(&self, id: NodeId) -> serde_json::Value {
        match self.node(id) {
            Node::Object(fields) => serde_json::Value::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), self.to_value(*v)))
                    .collect(),
            ),
            Node::Array(values) => {
                serde_json::Value::Array(values.iter().map(|v| self.to_value(*v)).collect())
            }
            Node::String(s) => serde_json::Value::String(s.clone()),
            Node::Number(n) => serde_json::Value::Number(n.clone()),
            Node::Bool(b) => serde_json::Value::Bool(*b),
            Node::Null | Node::NullSkipError => serde_json::Value::Null,
        }
    }
}

pub(crate) fn write_json_str<W: Write + ?Sized>(out: &mut W, value: &str) -> io::Result<()> {
    serde_json::to_writer(out, value).map_err(io::Error::from)
}

pub(crate) fn array_index(segment: &str) -> Option<usize> {
    segment
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .unwrap_or(segment)
        .parse()
        .ok()
}
