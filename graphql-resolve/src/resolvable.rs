//! Serializes the composed document through the response tree.
//!
//! Serialization runs in two passes over the same tree. The first pass validates: it
//! checks field authorization, reports non-null violations and leaf type errors, and
//! writes the resulting nulls into the document. The second pass prints the document,
//! which by then only holds values the client may see.

use std::collections::HashMap;

use ahash::RandomState;

use crate::context::Context;
use crate::context::ErrorBehavior;
use crate::context::Stats;
use crate::error::ResolveError;
use crate::json_ext::Path;
use crate::loader::Loader;
use crate::plan;
use crate::plan::GraphCoordinate;
use crate::plan::OperationType;
use crate::plan::PostProcessing;
use crate::singleflight::SingleFlight;
use crate::store::DocumentStore;
use crate::store::Node;
use crate::store::NodeId;
use crate::store::NodeKind;

/// A value that cannot be represented where it is. It travels up to the nearest parent
/// able to hold a `null`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct InvalidValue;

type Walked = Result<(), InvalidValue>;

#[derive(Clone, Copy)]
enum LeafKind {
    String,
    Boolean,
    Integer,
    Float,
    Scalar,
}

impl LeafKind {
    fn accepts(self, kind: NodeKind) -> bool {
        match self {
            LeafKind::String => kind == NodeKind::String,
            LeafKind::Boolean => kind == NodeKind::Bool,
            LeafKind::Integer | LeafKind::Float => kind == NodeKind::Number,
            LeafKind::Scalar => true,
        }
    }

    fn type_error(self, value: &str) -> String {
        let (type_name, expected) = match self {
            LeafKind::String => ("String", "string"),
            LeafKind::Boolean => ("Bool", "boolean"),
            LeafKind::Integer => ("Int", "integer"),
            LeafKind::Float => ("Float", "float"),
            LeafKind::Scalar => ("Scalar", "scalar"),
        };
        format!("{type_name} cannot represent non-{expected} value: \\\"{value}\\\"")
    }
}

pub(crate) struct Resolvable {
    store: DocumentStore,
    data: NodeId,
    errors: NodeId,
    variables: Option<NodeId>,
    operation_type: OperationType,
    error_behavior: ErrorBehavior,
    path: Path,
    printing: bool,
    stats: Stats,
    /// Field authorization decisions of this pass, `Some` holding the deny reason.
    decisions: HashMap<(String, GraphCoordinate), Option<String>, RandomState>,
    authorization_error: Option<ResolveError>,
}

impl Resolvable {
    pub(crate) fn init(
        ctx: &Context,
        initial_data: Option<&[u8]>,
        operation_type: OperationType,
    ) -> Result<Self, ResolveError> {
        let mut store = DocumentStore::new();
        let (data, errors) = store.init_resolvable(initial_data)?;
        let mut resolvable = Self::with_store(ctx, store, data, errors, operation_type);
        resolvable.append_variables(ctx)?;
        Ok(resolvable)
    }

    /// Starts from one subscription update: its payload and errors are selected with
    /// `post_processing` like a fetch response.
    pub(crate) fn init_subscription(
        ctx: &Context,
        update: &[u8],
        post_processing: &PostProcessing,
    ) -> Result<Self, ResolveError> {
        let mut store = DocumentStore::new();
        let (data, errors) = store.init_resolvable(None)?;
        let mut resolvable =
            Self::with_store(ctx, store, data, errors, OperationType::Subscription);
        resolvable.append_variables(ctx)?;

        let store = &mut resolvable.store;
        let raw = store.append_json(update)?;
        let payload = store.get(raw, &post_processing.select_response_data_path);
        if store.is_defined(payload)
            && let Some(payload) = payload
        {
            store.merge_nodes_with_path(data, payload, &post_processing.merge_path);
        }
        if !post_processing.select_response_errors_path.is_empty()
            && let Some(update_errors) =
                store.get(raw, &post_processing.select_response_errors_path)
        {
            store.merge_arrays(errors, update_errors);
        }
        Ok(resolvable)
    }

    fn with_store(
        ctx: &Context,
        store: DocumentStore,
        data: NodeId,
        errors: NodeId,
        operation_type: OperationType,
    ) -> Self {
        Self {
            store,
            data,
            errors,
            variables: None,
            operation_type,
            error_behavior: ctx.execution_options.error_behavior,
            path: Path::empty(),
            printing: false,
            stats: Stats::default(),
            decisions: HashMap::default(),
            authorization_error: None,
        }
    }

    fn append_variables(&mut self, ctx: &Context) -> Result<(), ResolveError> {
        if ctx.variables.is_empty() {
            return Ok(());
        }
        let variables = serde_json::to_value(&ctx.variables)?;
        self.variables = Some(self.store.append_value(&variables));
        Ok(())
    }

    /// Runs the fetches of `object` against this document.
    pub(crate) async fn load(
        &mut self,
        ctx: &Context,
        single_flight: &SingleFlight,
        object: &plan::Object,
    ) -> Result<(), ResolveError> {
        let mut loader = Loader::new(
            ctx,
            single_flight,
            self.operation_type,
            self.data,
            self.errors,
            self.variables,
        );
        let result = loader.load(&mut self.store, object).await;
        loader.free();
        result
    }

    pub(crate) fn has_errors(&self) -> bool {
        !self.store.array_values(self.errors).is_empty()
    }

    /// Drops the errors already written, before resolving a deferred part.
    pub(crate) fn clear_errors(&mut self) {
        self.store.array_truncate(self.errors, 0);
    }

    fn has_data(&self) -> bool {
        self.store.kind(self.data) == NodeKind::Object && self.store.object_len(self.data) > 0
    }

    /// Writes the response envelope for `root` into `out`.
    pub(crate) fn resolve(
        &mut self,
        ctx: &Context,
        root: &plan::Object,
        out: &mut Vec<u8>,
    ) -> Result<(), ResolveError> {
        self.path = Path::empty();
        self.printing = false;
        self.authorization_error = None;
        let start = out.len();

        // nothing was loaded, walking would only add non-null errors
        if self.has_errors() && !self.has_data() {
            if self.error_behavior == ErrorBehavior::Halt {
                self.store.array_truncate(self.errors, 1);
            }
            out.extend_from_slice(br#"{"errors":"#);
            self.store.print_node(self.errors, out)?;
            out.extend_from_slice(br#","data":null}"#);
            self.record_stats(ctx, out.len() - start);
            return Ok(());
        }

        let mut scratch = Vec::new();
        let validated = self.walk_object(ctx, root, self.data, None, &mut scratch);
        if let Some(err) = self.authorization_error.take() {
            return Err(err);
        }
        if validated.is_err() && self.error_behavior == ErrorBehavior::Halt {
            self.store.array_truncate(self.errors, 1);
        }

        out.push(b'{');
        if self.has_errors() {
            out.extend_from_slice(br#""errors":"#);
            self.store.print_node(self.errors, out)?;
            out.push(b',');
        }
        match validated {
            Err(InvalidValue) => out.extend_from_slice(br#""data":null"#),
            Ok(()) => {
                out.extend_from_slice(br#""data":"#);
                self.printing = true;
                let printed = self.walk_object(ctx, root, self.data, None, out);
                self.printing = false;
                if printed.is_err() {
                    failfast_error!("printing a validated response failed");
                }
                self.print_extensions(ctx, out)?;
            }
        }
        out.push(b'}');
        self.record_stats(ctx, out.len() - start);
        Ok(())
    }

    fn record_stats(&mut self, ctx: &Context, size: usize) {
        let stats = std::mem::take(&mut self.stats);
        ctx.record_stats(|total| {
            total.resolved_nodes += stats.resolved_nodes;
            total.resolved_objects += stats.resolved_objects;
            total.resolved_leafs += stats.resolved_leafs;
            total.combined_response_size += size;
        });
    }

    fn print_extensions(&self, ctx: &Context, out: &mut Vec<u8>) -> Result<(), ResolveError> {
        let authorizer = ctx
            .authorizer
            .as_ref()
            .filter(|authorizer| authorizer.has_response_extension_data(ctx));
        let options = ctx.rate_limit_options;
        let rate_limiter = ctx
            .rate_limiter
            .as_ref()
            .filter(|_| options.enable && options.include_stats_in_response_extension);
        if authorizer.is_none() && rate_limiter.is_none() {
            return Ok(());
        }
        out.extend_from_slice(br#","extensions":{"#);
        if let Some(authorizer) = authorizer {
            out.extend_from_slice(br#""authorization":"#);
            authorizer
                .render_response_extension(ctx, out)
                .map_err(|err| ResolveError::Authorization(err.to_string()))?;
        }
        if let Some(rate_limiter) = rate_limiter {
            if authorizer.is_some() {
                out.push(b',');
            }
            out.extend_from_slice(br#""rateLimit":"#);
            rate_limiter
                .render_response_extension(ctx, out)
                .map_err(|err| ResolveError::RateLimit(err.to_string()))?;
        }
        out.push(b'}');
        Ok(())
    }

    fn nullable(&self, nullable: bool) -> bool {
        nullable && self.error_behavior != ErrorBehavior::Halt
    }

    fn push_path(&mut self, path: &[String]) {
        for element in path {
            self.path.push(element.as_str());
        }
    }

    fn pop_path(&mut self, path: &[String]) {
        self.path.truncate(self.path.len().saturating_sub(path.len()));
    }

    /// `Query.me.reviews`: the root type followed by field names, list indices left out.
    fn render_field_path(&self) -> String {
        let mut rendered = self.operation_type.root_type_name().to_string();
        for name in self.path.field_names() {
            rendered.push('.');
            rendered.push_str(name);
        }
        rendered
    }

    fn add_error(&mut self, message: String, node_path: &[String]) {
        if self.printing {
            return;
        }
        self.push_path(node_path);
        let error = self.store.append_error_with_message(message, &self.path);
        self.store.array_push(self.errors, error);
        self.pop_path(node_path);
    }

    fn add_non_nullable_error(
        &mut self,
        value: Option<NodeId>,
        node_path: &[String],
        parent_type: Option<&str>,
    ) {
        // the denial that left the placeholder has been reported already
        if self.printing || self.store.is_null_skip_error(value) {
            return;
        }
        self.push_path(node_path);
        let field = match (parent_type, node_path.last()) {
            (Some(type_name), Some(field_name)) => format!("{type_name}.{field_name}"),
            _ => self.render_field_path(),
        };
        let error = self
            .store
            .append_non_nullable_field_is_null_error(&field, &self.path);
        self.store.array_push(self.errors, error);
        self.pop_path(node_path);
    }

    /// The outcome of an invalid value: validation reports it upwards, printing settles
    /// for `null` since validation already decided where the nulls go.
    fn invalid(&mut self, out: &mut Vec<u8>) -> Walked {
        if self.printing {
            self.print_null(out);
            return Ok(());
        }
        Err(InvalidValue)
    }

    fn print_null(&mut self, out: &mut Vec<u8>) {
        if self.printing {
            out.extend_from_slice(b"null");
            self.stats.resolved_leafs += 1;
        }
    }

    fn print_value(&mut self, value: NodeId, out: &mut Vec<u8>) {
        if self.printing {
            // writing into a Vec cannot fail
            let _ = self.store.print_node(value, out);
        }
    }

    /// Selects the value at `node_path`, or handles its absence.
    fn select(
        &mut self,
        parent: NodeId,
        node_path: &[String],
        nullable: bool,
        parent_type: Option<&str>,
        out: &mut Vec<u8>,
    ) -> Result<NodeId, Walked> {
        let value = self.store.get(parent, node_path);
        match value {
            Some(value) if self.store.is_defined(Some(value)) => Ok(value),
            _ if self.nullable(nullable) => {
                self.print_null(out);
                Err(Ok(()))
            }
            _ => {
                self.add_non_nullable_error(value, node_path, parent_type);
                Err(self.invalid(out))
            }
        }
    }

    fn walk_node(
        &mut self,
        ctx: &Context,
        node: &plan::Node,
        parent: NodeId,
        parent_type: Option<&str>,
        out: &mut Vec<u8>,
    ) -> Walked {
        if self.authorization_error.is_some() {
            return Err(InvalidValue);
        }
        if self.printing {
            self.stats.resolved_nodes += 1;
        }
        match node {
            plan::Node::Object(object) => self.walk_object(ctx, object, parent, parent_type, out),
            plan::Node::Array(array) => self.walk_array(ctx, array, parent, parent_type, out),
            plan::Node::Null => {
                self.print_null(out);
                Ok(())
            }
            plan::Node::String(scalar) => {
                self.walk_leaf(LeafKind::String, scalar, parent, parent_type, out)
            }
            plan::Node::Boolean(scalar) => {
                self.walk_leaf(LeafKind::Boolean, scalar, parent, parent_type, out)
            }
            plan::Node::Integer(scalar) => {
                self.walk_leaf(LeafKind::Integer, scalar, parent, parent_type, out)
            }
            plan::Node::Float(scalar) => {
                self.walk_leaf(LeafKind::Float, scalar, parent, parent_type, out)
            }
            plan::Node::Scalar(scalar) => {
                self.walk_leaf(LeafKind::Scalar, scalar, parent, parent_type, out)
            }
            plan::Node::EmptyObject => {
                if self.printing {
                    out.extend_from_slice(b"{}");
                }
                Ok(())
            }
            plan::Node::EmptyArray => {
                if self.printing {
                    out.extend_from_slice(b"[]");
                }
                Ok(())
            }
        }
    }

    fn walk_object(
        &mut self,
        ctx: &Context,
        object: &plan::Object,
        parent: NodeId,
        parent_type: Option<&str>,
        out: &mut Vec<u8>,
    ) -> Walked {
        let value = match self.select(parent, &object.path, object.nullable, parent_type, out) {
            Ok(value) => value,
            Err(walked) => return walked,
        };
        if self.store.kind(value) != NodeKind::Object {
            self.add_error("Object cannot represent non-object value.".to_string(), &object.path);
            return self.invalid(out);
        }

        self.push_path(&object.path);
        if self.printing {
            self.stats.resolved_objects += 1;
            out.push(b'{');
        }
        let walked = self.walk_fields(ctx, object, value, out);
        if self.printing {
            out.push(b'}');
        }
        self.pop_path(&object.path);

        match walked {
            Err(InvalidValue) if self.authorization_error.is_none() && self.nullable(object.nullable) => {
                self.store.set_null(value);
                Ok(())
            }
            walked => walked,
        }
    }

    fn walk_fields(
        &mut self,
        ctx: &Context,
        object: &plan::Object,
        value: NodeId,
        out: &mut Vec<u8>,
    ) -> Walked {
        let type_name = object.type_name.as_deref();
        let mut first = true;
        for field in &object.fields {
            if self.skip_field(field, value) {
                continue;
            }
            if !self.printing && self.field_denied(ctx, field, value) {
                if self.authorization_error.is_some() {
                    return Err(InvalidValue);
                }
                if field.value.nullable() {
                    if let Some(field_value) = self.store.get(value, field.value.path())
                        && self.store.is_defined(Some(field_value))
                    {
                        self.store.set_null(field_value);
                    }
                    continue;
                }
                return Err(InvalidValue);
            }
            if self.printing {
                if !first {
                    out.push(b',');
                }
                let _ = crate::store::write_json_str(out, &field.name);
                out.push(b':');
            }
            first = false;
            if let Err(InvalidValue) = self.walk_node(ctx, &field.value, value, type_name, out) {
                if self.authorization_error.is_some()
                    || self.error_behavior != ErrorBehavior::Null
                {
                    return Err(InvalidValue);
                }
                self.null_field(value, field.value.path());
            }
        }
        Ok(())
    }

    /// Leaves a `null` where the field value was, keeping its siblings.
    fn null_field(&mut self, object: NodeId, node_path: &[String]) {
        match self.store.get(object, node_path) {
            Some(field_value) if !node_path.is_empty() => self.store.set_null(field_value),
            _ => {
                let null = self.store.append_null();
                self.store.merge_nodes_with_path(object, null, node_path);
            }
        }
    }

    fn walk_array(
        &mut self,
        ctx: &Context,
        array: &plan::Array,
        parent: NodeId,
        parent_type: Option<&str>,
        out: &mut Vec<u8>,
    ) -> Walked {
        let value = match self.select(parent, &array.path, array.nullable, parent_type, out) {
            Ok(value) => value,
            Err(walked) => return walked,
        };
        if self.store.kind(value) != NodeKind::Array {
            self.add_error("Array cannot represent non-array value.".to_string(), &array.path);
            return self.invalid(out);
        }

        self.push_path(&array.path);
        if self.printing {
            out.push(b'[');
        }
        let mut walked = Ok(());
        let items = self.store.array_values(value).to_vec();
        for (i, item) in items.into_iter().enumerate() {
            if self.printing && i != 0 {
                out.push(b',');
            }
            self.path.push(i);
            let item_walked = self.walk_node(ctx, &array.item, item, parent_type, out);
            self.path.pop();
            if item_walked.is_err() {
                if self.authorization_error.is_none() && self.error_behavior == ErrorBehavior::Null {
                    self.store.set_null(item);
                    continue;
                }
                walked = item_walked;
                break;
            }
        }
        if self.printing {
            out.push(b']');
        }
        self.pop_path(&array.path);

        match walked {
            Err(InvalidValue) if self.authorization_error.is_none() && self.nullable(array.nullable) => {
                self.store.set_null(value);
                Ok(())
            }
            walked => walked,
        }
    }

    fn walk_leaf(
        &mut self,
        kind: LeafKind,
        scalar: &plan::Scalar,
        parent: NodeId,
        parent_type: Option<&str>,
        out: &mut Vec<u8>,
    ) -> Walked {
        let value = match self.select(parent, &scalar.path, scalar.nullable, parent_type, out) {
            Ok(value) => value,
            Err(walked) => return walked,
        };
        if !kind.accepts(self.store.kind(value)) {
            let rendered = match self.store.node(value) {
                Node::String(s) => s.clone(),
                _ => self.store.to_json_string(value),
            };
            self.add_error(kind.type_error(&rendered), &scalar.path);
            return self.invalid(out);
        }
        if self.printing {
            self.stats.resolved_leafs += 1;
        }
        self.print_value(value, out);
        Ok(())
    }

    fn variable(&self, name: &str) -> Option<bool> {
        let variables = self.variables?;
        match self.store.node(self.store.object_field(variables, name)?) {
            Node::Bool(value) => Some(*value),
            _ => None,
        }
    }

    fn skip_field(&self, field: &plan::Field, object: NodeId) -> bool {
        if let Some(skip) = &field.skip_variable
            && self.variable(skip) == Some(true)
        {
            return true;
        }
        if let Some(include) = &field.include_variable
            && self.variable(include) != Some(true)
        {
            return true;
        }
        if !field.on_type_names.is_empty() {
            let type_name = self
                .store
                .string_value(self.store.object_field(object, "__typename"));
            return !type_name.is_some_and(|type_name| {
                field.on_type_names.iter().any(|name| name == type_name)
            });
        }
        false
    }

    /// Asks the authorizer about a field carrying an authorization rule. A denial is
    /// reported at the field path.
    fn field_denied(&mut self, ctx: &Context, field: &plan::Field, object: NodeId) -> bool {
        let Some(info) = field.info.as_ref().filter(|info| info.has_authorization_rule) else {
            return false;
        };
        let (Some(authorizer), Some(data_source_id)) = (&ctx.authorizer, info.source_ids.first())
        else {
            return false;
        };
        let type_name = self
            .store
            .string_value(self.store.object_field(object, "__typename"))
            .unwrap_or(&info.exact_parent_type_name);
        let coordinate = GraphCoordinate::new(type_name, field.name.as_str());
        let key = (data_source_id.clone(), coordinate);

        let reason = match self.decisions.get(&key) {
            Some(decision) => decision.clone(),
            None => {
                let mut flat = Vec::new();
                let _ = self.store.print_object_flat(object, &mut flat);
                match authorizer.authorize_object_field(ctx, data_source_id, &flat, &key.1) {
                    Ok(deny) => {
                        let decision = deny.map(|deny| deny.reason);
                        self.decisions.insert(key, decision.clone());
                        decision
                    }
                    Err(err) => {
                        self.authorization_error = Some(ResolveError::Authorization(err.to_string()));
                        return true;
                    }
                }
            }
        };
        let Some(reason) = reason else {
            return false;
        };

        let node_path = field.value.path();
        self.push_path(node_path);
        let field_path = self.render_field_path();
        self.pop_path(node_path);
        let message = if reason.is_empty() {
            format!("Unauthorized to load field '{field_path}'.")
        } else {
            format!("Unauthorized to load field '{field_path}'. Reason: {reason}")
        };
        tracing::debug!(field = %field_path, "field denied by authorizer");
        self.add_error(message, node_path);
        true
    }
}
