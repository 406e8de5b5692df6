use crate::plan::fetch::Fetch;

/// One node of the response tree: how to project the document into client JSON.
#[derive(Clone, Debug, Default)]
pub enum Node {
    Object(Box<Object>),
    Array(Box<Array>),
    #[default]
    Null,
    String(Scalar),
    Boolean(Scalar),
    Integer(Scalar),
    Float(Scalar),
    /// Any JSON value, printed as is.
    Scalar(Scalar),
    EmptyObject,
    EmptyArray,
}

impl Node {
    pub fn path(&self) -> &[String] {
        match self {
            Node::Object(object) => &object.path,
            Node::Array(array) => &array.path,
            Node::String(s)
            | Node::Boolean(s)
            | Node::Integer(s)
            | Node::Float(s)
            | Node::Scalar(s) => &s.path,
            Node::Null | Node::EmptyObject | Node::EmptyArray => &[],
        }
    }

    pub fn nullable(&self) -> bool {
        match self {
            Node::Object(object) => object.nullable,
            Node::Array(array) => array.nullable,
            Node::String(s)
            | Node::Boolean(s)
            | Node::Integer(s)
            | Node::Float(s)
            | Node::Scalar(s) => s.nullable,
            Node::Null | Node::EmptyObject | Node::EmptyArray => true,
        }
    }
}

impl From<Object> for Node {
    fn from(object: Object) -> Self {
        Node::Object(Box::new(object))
    }
}

impl From<Array> for Node {
    fn from(array: Array) -> Self {
        Node::Array(Box::new(array))
    }
}

#[derive(Clone, Debug, Default)]
pub struct Object {
    /// Path of the object relative to its parent value.
    pub path: Vec<String>,
    pub nullable: bool,
    /// The GraphQL type name, used in non-null error messages.
    pub type_name: Option<String>,
    pub fields: Vec<Field>,
    /// Runs before the fields of this object are loaded.
    pub fetch: Option<Fetch>,
}

impl Object {
    pub fn new(fields: Vec<Field>) -> Self {
        Self {
            fields,
            ..Default::default()
        }
    }

    pub fn at<S: Into<String>>(mut self, path: impl IntoIterator<Item = S>) -> Self {
        self.path = path.into_iter().map(Into::into).collect();
        self
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn with_type_name(mut self, type_name: impl Into<String>) -> Self {
        self.type_name = Some(type_name.into());
        self
    }

    pub fn with_fetch(mut self, fetch: Fetch) -> Self {
        self.fetch = Some(fetch);
        self
    }
}

#[derive(Clone, Debug, Default)]
pub struct Array {
    pub path: Vec<String>,
    pub nullable: bool,
    pub item: Node,
}

impl Array {
    pub fn new(item: impl Into<Node>) -> Self {
        Self {
            item: item.into(),
            ..Default::default()
        }
    }

    pub fn at<S: Into<String>>(mut self, path: impl IntoIterator<Item = S>) -> Self {
        self.path = path.into_iter().map(Into::into).collect();
        self
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }
}

/// A leaf value.
#[derive(Clone, Debug, Default)]
pub struct Scalar {
    pub path: Vec<String>,
    pub nullable: bool,
}

impl Scalar {
    pub fn at<S: Into<String>>(path: impl IntoIterator<Item = S>) -> Self {
        Self {
            path: path.into_iter().map(Into::into).collect(),
            nullable: false,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }
}

#[derive(Clone, Debug, Default)]
pub struct Field {
    pub name: String,
    pub value: Node,
    pub info: Option<FieldInfo>,
    /// Skip the field when this boolean variable is `true`.
    pub skip_variable: Option<String>,
    /// Skip the field unless this boolean variable is `true`.
    pub include_variable: Option<String>,
    /// When not empty, the field only applies to objects whose `__typename` is listed.
    pub on_type_names: Vec<String>,
}

impl Field {
    pub fn new(name: impl Into<String>, value: impl Into<Node>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            ..Default::default()
        }
    }

    pub fn with_info(mut self, info: FieldInfo) -> Self {
        self.info = Some(info);
        self
    }
}

/// Planner metadata about a field, used for authorization.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FieldInfo {
    pub exact_parent_type_name: String,
    /// Data sources able to resolve the field. The first one is used for policy decisions.
    pub source_ids: Vec<String>,
    pub has_authorization_rule: bool,
}

impl FieldInfo {
    pub fn authorized(parent_type_name: impl Into<String>, source_id: impl Into<String>) -> Self {
        Self {
            exact_parent_type_name: parent_type_name.into(),
            source_ids: vec![source_id.into()],
            has_authorization_rule: true,
        }
    }
}
