//! Compiled schema nodes and their evaluation.
//!
//! A schema document is lowered once into a tree of [`Node`]s. Inline
//! subschemas become child nodes; `$ref`s become calls that look the target
//! unit up in the [`Validators`] table at validation time, which is what makes
//! self-referential schemas terminate.

use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;

use regex::Regex;
use serde_json::{Map, Value};

use crate::compiler::{Target, ValidationState, Validators};
use crate::error::{ErrorCode, ValidationError};
use crate::pointer;
use crate::template::UriTemplate;
use crate::types::{json_equal, json_type_name, Link};

/// Custom `format` checker: `Err(message)` rejects the value.
pub type FormatFn = dyn Fn(&Value) -> Result<(), String> + Send + Sync;

#[derive(Clone)]
pub(crate) struct FormatCheck {
    pub name: String,
    pub check: Arc<FormatFn>,
}

impl PartialEq for FormatCheck {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl fmt::Debug for FormatCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FormatCheck").field(&self.name).finish()
    }
}

/// A compiled regular expression remembering its source.
#[derive(Debug, Clone)]
pub(crate) struct Pattern {
    pub source: String,
    regex: Regex,
}

impl Pattern {
    pub fn new(source: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            source: source.to_string(),
            regex: Regex::new(source)?,
        })
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

/// Runtime JSON type used for dispatch. Integers are numbers here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JsonKind {
    Null,
    Boolean,
    Number,
    String,
    Array,
    Object,
}

impl JsonKind {
    pub const ALL: [JsonKind; 6] = [
        JsonKind::Null,
        JsonKind::Boolean,
        JsonKind::Number,
        JsonKind::String,
        JsonKind::Array,
        JsonKind::Object,
    ];

    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => JsonKind::Null,
            Value::Bool(_) => JsonKind::Boolean,
            Value::Number(_) => JsonKind::Number,
            Value::String(_) => JsonKind::String,
            Value::Array(_) => JsonKind::Array,
            Value::Object(_) => JsonKind::Object,
        }
    }

    fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TypeSet(u8);

impl TypeSet {
    pub const EMPTY: TypeSet = TypeSet(0);
    pub const ALL: TypeSet = TypeSet(0b11_1111);

    pub fn single(kind: JsonKind) -> Self {
        TypeSet(kind.bit())
    }

    pub fn insert(&mut self, kind: JsonKind) {
        self.0 |= kind.bit();
    }

    pub fn contains(self, kind: JsonKind) -> bool {
        self.0 & kind.bit() != 0
    }

    pub fn len(self) -> u32 {
        self.0.count_ones()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Node {
    /// No constraint: absent, `null`, `true` or non-object schemas.
    Accept,
    /// The `false` schema.
    Reject { uri: String },
    Ref { target: String },
    Schema(Box<SchemaNode>),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SchemaNode {
    pub uri: String,
    pub types: TypeSet,
    /// `type` as written, for error parameters.
    pub declared: Vec<String>,
    pub enumeration: Option<Vec<Value>>,
    pub dispatch: Vec<Branch>,
    pub all_of: Vec<Node>,
    pub any_of: Vec<Node>,
    pub one_of: Vec<Node>,
    pub not: Option<Box<Node>>,
    pub format: Option<FormatCheck>,
    pub links: Vec<LinkTemplate>,
}

/// Type-specific checks shared by every type in `types`.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Branch {
    pub types: TypeSet,
    pub checks: Vec<Check>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Check {
    Integer,
    MultipleOf(f64),
    Minimum { limit: f64, exclusive: bool },
    Maximum { limit: f64, exclusive: bool },
    MinLength(u64),
    MaxLength(u64),
    Pattern(Pattern),
    MinItems(u64),
    MaxItems(u64),
    Items(Box<Node>),
    Tuple { items: Vec<Node>, additional: Additional },
    UniqueItems,
    MinProperties(u64),
    MaxProperties(u64),
    Object(Box<ObjectRules>),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Additional {
    Allowed,
    Forbidden,
    Schema(Box<Node>),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ObjectRules {
    /// Union of `properties`, `dependencies` and `required` keys, each once.
    pub keys: Vec<KeyRule>,
    pub patterns: Vec<(Pattern, Node)>,
    pub additional: Additional,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct KeyRule {
    pub key: String,
    pub property: Option<Node>,
    pub required: bool,
    pub dependency: Option<Dependency>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Dependency {
    Keys(Vec<String>),
    Schema(Node),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct LinkTemplate {
    pub rel: String,
    pub method: String,
    pub href: UriTemplate,
}

/// Per-run evaluation context.
pub(crate) struct Scope<'a> {
    pub validators: &'a Validators,
    pub unicode_length: bool,
    /// `(target, path)` pairs currently being evaluated.
    active: RefCell<Vec<(String, String)>>,
}

impl<'a> Scope<'a> {
    pub fn new(validators: &'a Validators) -> Self {
        Self {
            validators,
            unicode_length: validators.options().unicode_length,
            active: RefCell::new(Vec::new()),
        }
    }

    pub fn call(&self, target: &str, value: &Value, path: &str, state: &mut ValidationState) {
        match self.validators.target(target) {
            Target::Unit(unit) => {
                let key = (unit.uri().to_string(), path.to_string());
                if self.active.borrow().contains(&key) {
                    // re-entered without consuming any data: a cycle through composition
                    state.errors.push(
                        ValidationError::new(ErrorCode::CircularReference, path, target)
                            .param("chain", vec![target.to_string()]),
                    );
                    return;
                }
                self.active.borrow_mut().push(key);
                unit.node().validate(value, path, self, state);
                self.active.borrow_mut().pop();
            }
            Target::Circular(chain) => state.errors.push(
                ValidationError::new(ErrorCode::CircularReference, path, target)
                    .param("chain", chain.to_vec()),
            ),
            Target::Missing => state.note_missing(path, target),
        }
    }
}

impl Node {
    pub fn validate(&self, value: &Value, path: &str, scope: &Scope<'_>, state: &mut ValidationState) {
        match self {
            Node::Accept => {}
            Node::Reject { uri } => state
                .errors
                .push(ValidationError::new(ErrorCode::NotPassed, path, uri)),
            Node::Ref { target } => scope.call(target, value, path, state),
            Node::Schema(node) => node.validate(value, path, scope, state),
        }
    }
}

impl SchemaNode {
    fn validate(&self, value: &Value, path: &str, scope: &Scope<'_>, state: &mut ValidationState) {
        state.assign_schema(path, &self.uri);

        let kind = JsonKind::of(value);
        let allowed = self.types.contains(kind);
        if !allowed {
            state.errors.push(
                ValidationError::new(ErrorCode::InvalidType, path, &self.uri)
                    .param("type", json_type_name(value))
                    .param("expected", self.declared.join("/")),
            );
        }

        if let Some(options) = &self.enumeration {
            if !options.iter().any(|option| json_equal(option, value)) {
                state.errors.push(
                    ValidationError::new(ErrorCode::EnumMismatch, path, &self.uri)
                        .param("value", value.to_string()),
                );
            }
        }

        if allowed {
            let last = self.dispatch.len().saturating_sub(1);
            let branch = self
                .dispatch
                .iter()
                .enumerate()
                .find(|(idx, b)| *idx == last || b.types.contains(kind));
            if let Some((_, branch)) = branch {
                for check in &branch.checks {
                    check.validate(value, path, &self.uri, scope, state);
                }
            }
        }

        for sub in &self.all_of {
            sub.validate(value, path, scope, state);
        }
        if !self.any_of.is_empty() {
            self.validate_any_of(value, path, scope, state);
        }
        if !self.one_of.is_empty() {
            self.validate_one_of(value, path, scope, state);
        }
        if let Some(not) = &self.not {
            let mut sub = state.fresh();
            not.validate(value, path, scope, &mut sub);
            if sub.errors.is_empty() {
                state
                    .errors
                    .push(ValidationError::new(ErrorCode::NotPassed, path, &self.uri));
            }
        }

        if let Some(format) = &self.format {
            if let Err(message) = (format.check)(value) {
                state.errors.push(
                    ValidationError::new(ErrorCode::FormatCustom, path, &self.uri)
                        .param("format", format.name.clone())
                        .param("message", message),
                );
            }
        }

        if state.links.is_some() {
            for link in &self.links {
                state.assign_link(
                    path,
                    Link {
                        href: link.href.expand(value),
                        rel: link.rel.clone(),
                        method: link.method.clone(),
                    },
                );
            }
        }
    }

    fn run_branches(
        branches: &[Node],
        value: &Value,
        path: &str,
        scope: &Scope<'_>,
        state: &ValidationState,
    ) -> Vec<ValidationState> {
        branches
            .iter()
            .map(|branch| {
                let mut sub = state.fresh();
                branch.validate(value, path, scope, &mut sub);
                sub
            })
            .collect()
    }

    fn validate_any_of(&self, value: &Value, path: &str, scope: &Scope<'_>, state: &mut ValidationState) {
        let results = Self::run_branches(&self.any_of, value, path, scope, state);
        if results.iter().any(|r| r.errors.is_empty()) {
            for passed in results.into_iter().filter(|r| r.errors.is_empty()) {
                state.merge_assignments(passed);
            }
        } else {
            state.errors.push(
                ValidationError::new(ErrorCode::AnyOfMissing, path, &self.uri)
                    .branches(results.into_iter().map(|r| r.errors).collect()),
            );
        }
    }

    fn validate_one_of(&self, value: &Value, path: &str, scope: &Scope<'_>, state: &mut ValidationState) {
        let results = Self::run_branches(&self.one_of, value, path, scope, state);
        let passing: Vec<usize> = results
            .iter()
            .enumerate()
            .filter(|(_, r)| r.errors.is_empty())
            .map(|(idx, _)| idx)
            .collect();

        match passing.as_slice() {
            [] => state.errors.push(
                ValidationError::new(ErrorCode::OneOfMissing, path, &self.uri)
                    .branches(results.into_iter().map(|r| r.errors).collect()),
            ),
            [only] => {
                let only = *only;
                if let Some(passed) = results.into_iter().nth(only) {
                    state.merge_assignments(passed);
                }
            }
            [first, second, ..] => state.errors.push(
                ValidationError::new(ErrorCode::OneOfMultiple, path, &self.uri)
                    .param("index1", *first)
                    .param("index2", *second),
            ),
        }
    }
}

fn string_length(text: &str, unicode: bool) -> u64 {
    if unicode {
        text.chars().count() as u64
    } else {
        text.encode_utf16().count() as u64
    }
}

pub(crate) fn is_integral(n: f64) -> bool {
    n.is_finite() && n.fract() == 0.0
}

fn is_multiple(value: f64, divisor: f64) -> bool {
    if divisor == 0.0 {
        return true;
    }
    let quotient = value / divisor;
    (quotient - quotient.round()).abs() <= 1e-9 * quotient.abs().max(1.0)
}

impl Check {
    fn validate(
        &self,
        value: &Value,
        path: &str,
        uri: &str,
        scope: &Scope<'_>,
        state: &mut ValidationState,
    ) {
        let error = |code| ValidationError::new(code, path, uri);
        match (self, value) {
            (Check::Integer, Value::Number(n)) => {
                if !n.as_f64().is_some_and(is_integral) {
                    state.errors.push(
                        error(ErrorCode::InvalidType)
                            .param("type", "number")
                            .param("expected", "integer"),
                    );
                }
            }
            (Check::MultipleOf(divisor), Value::Number(n)) => {
                let n = n.as_f64().unwrap_or_default();
                if !is_multiple(n, *divisor) {
                    state.errors.push(
                        error(ErrorCode::NumberMultipleOf)
                            .param("value", n)
                            .param("multipleOf", *divisor),
                    );
                }
            }
            (Check::Minimum { limit, exclusive }, Value::Number(n)) => {
                let n = n.as_f64().unwrap_or_default();
                if n < *limit {
                    state.errors.push(
                        error(ErrorCode::NumberMinimum)
                            .param("value", n)
                            .param("minimum", *limit),
                    );
                } else if *exclusive && n == *limit {
                    state.errors.push(
                        error(ErrorCode::NumberMinimumExclusive)
                            .param("value", n)
                            .param("minimum", *limit),
                    );
                }
            }
            (Check::Maximum { limit, exclusive }, Value::Number(n)) => {
                let n = n.as_f64().unwrap_or_default();
                if n > *limit {
                    state.errors.push(
                        error(ErrorCode::NumberMaximum)
                            .param("value", n)
                            .param("maximum", *limit),
                    );
                } else if *exclusive && n == *limit {
                    state.errors.push(
                        error(ErrorCode::NumberMaximumExclusive)
                            .param("value", n)
                            .param("maximum", *limit),
                    );
                }
            }
            (Check::MinLength(min), Value::String(s)) => {
                let length = string_length(s, scope.unicode_length);
                if length < *min {
                    state.errors.push(
                        error(ErrorCode::StringLengthShort)
                            .param("length", length)
                            .param("minimum", *min),
                    );
                }
            }
            (Check::MaxLength(max), Value::String(s)) => {
                let length = string_length(s, scope.unicode_length);
                if length > *max {
                    state.errors.push(
                        error(ErrorCode::StringLengthLong)
                            .param("length", length)
                            .param("maximum", *max),
                    );
                }
            }
            (Check::Pattern(pattern), Value::String(s)) => {
                if !pattern.is_match(s) {
                    state.errors.push(
                        error(ErrorCode::StringPattern).param("pattern", pattern.source.clone()),
                    );
                }
            }
            (Check::MinItems(min), Value::Array(items)) => {
                if (items.len() as u64) < *min {
                    state.errors.push(
                        error(ErrorCode::ArrayLengthShort)
                            .param("length", items.len())
                            .param("minimum", *min),
                    );
                }
            }
            (Check::MaxItems(max), Value::Array(items)) => {
                if items.len() as u64 > *max {
                    state.errors.push(
                        error(ErrorCode::ArrayLengthLong)
                            .param("length", items.len())
                            .param("maximum", *max),
                    );
                }
            }
            (Check::Items(node), Value::Array(items)) => {
                for (idx, item) in items.iter().enumerate() {
                    node.validate(item, &pointer::child(path, &idx.to_string()), scope, state);
                }
            }
            (Check::Tuple { items: nodes, additional }, Value::Array(items)) => {
                for (idx, item) in items.iter().enumerate() {
                    let item_path = pointer::child(path, &idx.to_string());
                    match (nodes.get(idx), additional) {
                        (Some(node), _) => node.validate(item, &item_path, scope, state),
                        (None, Additional::Schema(node)) => {
                            node.validate(item, &item_path, scope, state)
                        }
                        _ => {}
                    }
                }
                if *additional == Additional::Forbidden && items.len() > nodes.len() {
                    state.errors.push(
                        error(ErrorCode::ArrayAdditionalItems)
                            .param("length", items.len())
                            .param("maximum", nodes.len()),
                    );
                }
            }
            (Check::UniqueItems, Value::Array(items)) => {
                'outer: for (i, a) in items.iter().enumerate() {
                    for (j, b) in items.iter().enumerate().skip(i + 1) {
                        if json_equal(a, b) {
                            state.errors.push(
                                error(ErrorCode::ArrayUnique)
                                    .param("match1", i)
                                    .param("match2", j),
                            );
                            break 'outer;
                        }
                    }
                }
            }
            (Check::MinProperties(min), Value::Object(map)) => {
                if (map.len() as u64) < *min {
                    state.errors.push(
                        error(ErrorCode::ObjectPropertiesMinimum)
                            .param("propertyCount", map.len())
                            .param("minimum", *min),
                    );
                }
            }
            (Check::MaxProperties(max), Value::Object(map)) => {
                if map.len() as u64 > *max {
                    state.errors.push(
                        error(ErrorCode::ObjectPropertiesMaximum)
                            .param("propertyCount", map.len())
                            .param("maximum", *max),
                    );
                }
            }
            (Check::Object(rules), Value::Object(map)) => {
                rules.validate(value, map, path, uri, scope, state)
            }
            _ => {}
        }
    }
}

impl ObjectRules {
    fn validate(
        &self,
        value: &Value,
        map: &Map<String, Value>,
        path: &str,
        uri: &str,
        scope: &Scope<'_>,
        state: &mut ValidationState,
    ) {
        for rule in &self.keys {
            let Some(member) = map.get(&rule.key) else {
                if rule.required {
                    state.errors.push(
                        ValidationError::new(ErrorCode::ObjectRequired, path, uri)
                            .param("key", rule.key.clone()),
                    );
                }
                continue;
            };
            if let Some(node) = &rule.property {
                node.validate(member, &pointer::child(path, &rule.key), scope, state);
            }
            match &rule.dependency {
                Some(Dependency::Keys(keys)) => {
                    for missing in keys.iter().filter(|k| !map.contains_key(k.as_str())) {
                        state.errors.push(
                            ValidationError::new(ErrorCode::ObjectDependencyKey, path, uri)
                                .param("key", rule.key.clone())
                                .param("missing", missing.clone()),
                        );
                    }
                }
                Some(Dependency::Schema(node)) => node.validate(value, path, scope, state),
                None => {}
            }
        }

        if self.patterns.is_empty() && self.additional == Additional::Allowed {
            return;
        }
        for (key, member) in map {
            let member_path = pointer::child(path, key);
            let mut matched = self
                .keys
                .iter()
                .any(|rule| rule.property.is_some() && rule.key == *key);
            for (pattern, node) in &self.patterns {
                if pattern.is_match(key) {
                    matched = true;
                    node.validate(member, &member_path, scope, state);
                }
            }
            if matched {
                continue;
            }
            match &self.additional {
                Additional::Allowed => {}
                Additional::Forbidden => state.errors.push(
                    ValidationError::new(ErrorCode::ObjectAdditionalProperties, &member_path, uri)
                        .param("key", key.clone()),
                ),
                Additional::Schema(node) => node.validate(member, &member_path, scope, state),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_set_membership() {
        let mut set = TypeSet::single(JsonKind::Null);
        set.insert(JsonKind::Boolean);
        assert!(set.contains(JsonKind::Boolean));
        assert!(!set.contains(JsonKind::Object));
        assert_eq!(set.len(), 2);
        assert_eq!(TypeSet::ALL.len(), 6);
        assert_eq!(TypeSet::EMPTY.len(), 0);
    }

    #[test]
    fn multiple_of_tolerates_float_error() {
        assert!(is_multiple(0.3, 0.1));
        assert!(is_multiple(10.0, 2.5));
        assert!(!is_multiple(10.0, 3.0));
        assert!(is_multiple(5.0, 0.0));
    }

    #[test]
    fn string_length_modes() {
        assert_eq!(string_length("h\u{1F600}", true), 2);
        assert_eq!(string_length("h\u{1F600}", false), 3);
    }

    #[test]
    fn patterns_compare_by_source() {
        let a = Pattern::new("^a+$").unwrap();
        let b = Pattern::new("^a+$").unwrap();
        assert_eq!(a, b);
        assert!(a.is_match("aaa"));
        assert!(Pattern::new("(").is_err());
    }
}
