use once_cell::sync::Lazy;
use regex::bytes::Regex;
use serde_json::Value;

use crate::error::ResolveError;
use crate::store::NodeKind;
use crate::template::InputTemplate;
use crate::template::RenderScope;
use crate::template::TemplateSegment;
use crate::template::Variable;

/// Finds array literals in a rendered value, ignoring text around them: `foo[1, 2]bar`
/// yields `[1, 2]`.
static FIND_ARRAY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[(.*?)\]").expect("array pattern is a valid regex"));

/// Decides per subscriber whether a trigger update is delivered.
#[derive(Clone, Debug)]
pub enum SubscriptionFilter {
    /// Delivered when every child delivers.
    And(Vec<SubscriptionFilter>),
    /// Delivered when any child delivers.
    Or(Vec<SubscriptionFilter>),
    Not(Box<SubscriptionFilter>),
    In(FieldFilter),
}

/// Delivered when the value at `field_path` equals one of `values`. A value rendering
/// to an array matches any of its elements.
#[derive(Clone, Debug)]
pub struct FieldFilter {
    pub field_path: Vec<String>,
    pub values: Vec<InputTemplate>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum JsonType {
    String,
    Number,
    Boolean,
    Null,
    Object,
    Array,
}

impl JsonType {
    fn of(value: &Value) -> Self {
        match value {
            Value::String(_) => JsonType::String,
            Value::Number(_) => JsonType::Number,
            Value::Bool(_) => JsonType::Boolean,
            Value::Null => JsonType::Null,
            Value::Object(_) => JsonType::Object,
            Value::Array(_) => JsonType::Array,
        }
    }

    fn of_kind(kind: NodeKind) -> Self {
        match kind {
            NodeKind::String => JsonType::String,
            NodeKind::Number => JsonType::Number,
            NodeKind::Bool => JsonType::Boolean,
            NodeKind::Null | NodeKind::NullSkipError => JsonType::Null,
            NodeKind::Object => JsonType::Object,
            NodeKind::Array => JsonType::Array,
        }
    }
}

impl SubscriptionFilter {
    /// Returns `true` when `update` must not be delivered.
    pub fn skip_event(
        &self,
        scope: &RenderScope<'_>,
        update: &Value,
        buf: &mut Vec<u8>,
    ) -> Result<bool, ResolveError> {
        match self {
            SubscriptionFilter::And(filters) => {
                for filter in filters {
                    if filter.skip_event(scope, update, buf)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            SubscriptionFilter::Or(filters) => {
                for filter in filters {
                    if !filter.skip_event(scope, update, buf)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            SubscriptionFilter::Not(filter) => Ok(!filter.skip_event(scope, update, buf)?),
            SubscriptionFilter::In(filter) => filter.skip_event(scope, update, buf),
        }
    }
}

impl FieldFilter {
    pub fn skip_event(
        &self,
        scope: &RenderScope<'_>,
        update: &Value,
        buf: &mut Vec<u8>,
    ) -> Result<bool, ResolveError> {
        let Some(expected) = select(update, &self.field_path) else {
            return Ok(true);
        };
        let expected_type = JsonType::of(expected);
        let expected_raw = raw_bytes(expected);

        for template in &self.values {
            buf.clear();
            template.render_and_collect_undefined(scope, None, buf, &mut Vec::new())?;
            let rendered = buf.as_slice();

            if !rendered.contains(&b'[') || !rendered.contains(&b']') {
                let [segment] = template.segments.as_slice() else {
                    // concatenated segments always render text
                    if rendered == expected_raw.as_slice() {
                        return Ok(false);
                    }
                    continue;
                };
                let value_type = match segment {
                    TemplateSegment::Variable(Variable::Context { path, .. }) => {
                        let value = scope
                            .variables
                            .and_then(|variables| scope.store.get(variables, path));
                        match value {
                            Some(value) => Some(JsonType::of_kind(scope.store.kind(value))),
                            None => return Ok(true),
                        }
                    }
                    TemplateSegment::Static(bytes) => {
                        match serde_json::from_slice::<Value>(bytes) {
                            Ok(value) => Some(JsonType::of(&value)),
                            Err(_) => return Ok(true),
                        }
                    }
                    TemplateSegment::Variable(_) => None,
                };
                if value_type.is_some_and(|value_type| value_type != expected_type) {
                    return Ok(true);
                }
                if rendered == expected_raw.as_slice() {
                    return Ok(false);
                }
                if expected_type == JsonType::String
                    && serde_json::to_vec(expected).is_ok_and(|quoted| quoted == rendered)
                {
                    return Ok(false);
                }
                continue;
            }

            let matches: Vec<_> = FIND_ARRAY.find_iter(rendered).collect();
            let [array] = matches.as_slice() else {
                if matches.is_empty() {
                    if rendered == expected_raw.as_slice() {
                        return Ok(false);
                    }
                    continue;
                }
                return Err(ResolveError::InvalidSubscriptionFilterTemplate(
                    String::from_utf8_lossy(rendered).into_owned(),
                ));
            };
            let Ok(Value::Array(elements)) = serde_json::from_slice::<Value>(array.as_bytes())
            else {
                continue;
            };
            let matched = elements
                .iter()
                .filter(|element| JsonType::of(element) == expected_type)
                .any(|element| {
                    let mut replaced = rendered[..array.start()].to_vec();
                    replaced.extend_from_slice(&raw_bytes(element));
                    replaced.extend_from_slice(&rendered[array.end()..]);
                    replaced == expected_raw
                });
            if matched {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

fn select<'a>(value: &'a Value, path: &[String]) -> Option<&'a Value> {
    path.iter().try_fold(value, |current, segment| match current {
        Value::Object(object) => object.get(segment),
        Value::Array(items) => items.get(segment.parse::<usize>().ok()?),
        _ => None,
    })
}

/// Strings without their quotes, everything else as JSON.
fn raw_bytes(value: &Value) -> Vec<u8> {
    match value {
        Value::String(s) => s.as_bytes().to_vec(),
        other => serde_json::to_vec(other).unwrap_or_default(),
    }
}
