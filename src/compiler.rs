//! Validator compiler.
//!
//! The [`Generator`] owns a [`SchemaStore`] and lowers every reachable schema
//! URI into exactly one [`ValidationUnit`]. Compiling is incremental: URIs
//! whose documents are not available yet stay queued and are reported by
//! [`Generator::missing`] until someone supplies them.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::error::{CompileError, StoreError, ValidationError};
use crate::keywords::{
    is_integral, Additional, Branch, Check, Dependency, FormatCheck, FormatFn, JsonKind, KeyRule,
    LinkTemplate, Node, ObjectRules, Pattern, SchemaNode, Scope, TypeSet,
};
use crate::store::SchemaStore;
use crate::template::UriTemplate;
use crate::types::{GeneratorOptions, Link, PathMap, ValidationResult};
use crate::uri;

/// Compiled validation routine for one schema URI.
#[derive(Debug)]
pub struct ValidationUnit {
    uri: String,
    name: Option<String>,
    node: Node,
}

impl ValidationUnit {
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Display name given when the schema was registered.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub(crate) fn node(&self) -> &Node {
        &self.node
    }

    /// Validate `value` located at `path`, adding to `state`.
    pub fn validate(
        &self,
        value: &Value,
        path: &str,
        validators: &Validators,
        state: &mut ValidationState,
    ) {
        let scope = Scope::new(validators);
        self.node.validate(value, path, &scope, state);
    }
}

#[derive(Debug, Clone)]
enum Entry {
    Unit(Arc<ValidationUnit>),
    Circular(Vec<String>),
}

pub(crate) enum Target<'a> {
    Unit(&'a Arc<ValidationUnit>),
    Circular(&'a [String]),
    Missing,
}

/// Accumulators filled while validating.
///
/// Only `errors` is always collected; the maps are `Some` when the matching
/// [`GeneratorOptions`] flag is on.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationState {
    pub errors: Vec<ValidationError>,
    pub schemas: Option<PathMap<String>>,
    pub links: Option<PathMap<Link>>,
    pub missing: Option<PathMap<String>>,
}

impl ValidationState {
    pub fn new(options: &GeneratorOptions) -> Self {
        Self {
            errors: Vec::new(),
            schemas: options.assign_schemas.then(PathMap::new),
            links: options.assign_links.then(PathMap::new),
            missing: options.track_missing.then(PathMap::new),
        }
    }

    /// Empty accumulators with the same maps enabled.
    pub fn fresh(&self) -> Self {
        Self {
            errors: Vec::new(),
            schemas: self.schemas.as_ref().map(|_| PathMap::new()),
            links: self.links.as_ref().map(|_| PathMap::new()),
            missing: self.missing.as_ref().map(|_| PathMap::new()),
        }
    }

    pub(crate) fn assign_schema(&mut self, path: &str, schema: &str) {
        if let Some(schemas) = &mut self.schemas {
            let entry = schemas.entry(path.to_string()).or_default();
            if !entry.iter().any(|s| s == schema) {
                entry.push(schema.to_string());
            }
        }
    }

    pub(crate) fn assign_link(&mut self, path: &str, link: Link) {
        if let Some(links) = &mut self.links {
            let entry = links.entry(path.to_string()).or_default();
            if !entry.contains(&link) {
                entry.push(link);
            }
        }
    }

    pub(crate) fn note_missing(&mut self, path: &str, schema: &str) {
        if let Some(missing) = &mut self.missing {
            let entry = missing.entry(path.to_string()).or_default();
            if !entry.iter().any(|s| s == schema) {
                entry.push(schema.to_string());
            }
        }
    }

    /// Merge schema, link and missing assignments from a passing branch.
    pub fn merge_assignments(&mut self, other: ValidationState) {
        for (path, schemas) in other.schemas.into_iter().flatten() {
            for schema in schemas {
                self.assign_schema(&path, &schema);
            }
        }
        for (path, links) in other.links.into_iter().flatten() {
            for link in links {
                self.assign_link(&path, link);
            }
        }
        for (path, missing) in other.missing.into_iter().flatten() {
            for schema in missing {
                self.note_missing(&path, &schema);
            }
        }
    }

    pub fn into_result(self) -> ValidationResult {
        ValidationResult {
            valid: self.errors.is_empty(),
            errors: self.errors,
            schemas: self.schemas,
            links: self.links,
            missing: self.missing,
        }
    }
}

/// Immutable snapshot of compiled units.
///
/// Cheap to clone; units are shared with the generator that produced them.
#[derive(Debug, Clone, Default)]
pub struct Validators {
    entries: Arc<HashMap<String, Entry>>,
    aliases: Arc<HashMap<String, String>>,
    options: GeneratorOptions,
}

impl Validators {
    pub fn options(&self) -> &GeneratorOptions {
        &self.options
    }

    /// The unit for `uri`, following `$ref` aliases.
    pub fn unit(&self, uri: &str) -> Option<Arc<ValidationUnit>> {
        match self.target(&uri::normalize(uri)) {
            Target::Unit(unit) => Some(Arc::clone(unit)),
            _ => None,
        }
    }

    /// Whether `uri` has been compiled, as a unit, alias or circular entry.
    pub fn contains(&self, uri: &str) -> bool {
        let uri = uri::normalize(uri);
        self.entries.contains_key(&uri) || self.aliases.contains_key(&uri)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn target(&self, uri: &str) -> Target<'_> {
        let mut current = uri;
        for _ in 0..=self.aliases.len() {
            match self.entries.get(current) {
                Some(Entry::Unit(unit)) => return Target::Unit(unit),
                Some(Entry::Circular(chain)) => return Target::Circular(chain),
                None => match self.aliases.get(current) {
                    Some(next) => current = next,
                    None => return Target::Missing,
                },
            }
        }
        Target::Missing
    }

    /// Run the unit for `uri` over `value` at `path`.
    pub fn run(&self, uri: &str, value: &Value, path: &str, state: &mut ValidationState) {
        let scope = Scope::new(self);
        scope.call(&uri::normalize(uri), value, path, state);
    }

    /// Validate `value` against one schema.
    pub fn validate(&self, uri: &str, value: &Value) -> ValidationResult {
        self.validate_all([uri], value)
    }

    /// Validate `value` against several schemas, collecting into one result.
    pub fn validate_all<I, S>(&self, uris: I, value: &Value) -> ValidationResult
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut state = ValidationState::new(&self.options);
        for uri in uris {
            self.run(uri.as_ref(), value, "", &mut state);
        }
        state.into_result()
    }
}

/// Incremental schema compiler.
pub struct Generator {
    store: SchemaStore,
    options: GeneratorOptions,
    formats: HashMap<String, FormatCheck>,
    class_names: HashMap<String, String>,
    aliases: HashMap<String, String>,
    missing: BTreeSet<String>,
    handled: HashSet<String>,
    queue: VecDeque<String>,
    entries: HashMap<String, Entry>,
    roots: Vec<String>,
}

impl Default for Generator {
    fn default() -> Self {
        Self::new(GeneratorOptions::default())
    }
}

impl Generator {
    pub fn new(options: GeneratorOptions) -> Self {
        Self::with_store(SchemaStore::new(), options)
    }

    /// A generator reading schemas from an existing store.
    pub fn with_store(store: SchemaStore, options: GeneratorOptions) -> Self {
        Self {
            store,
            options,
            formats: HashMap::new(),
            class_names: HashMap::new(),
            aliases: HashMap::new(),
            missing: BTreeSet::new(),
            handled: HashSet::new(),
            queue: VecDeque::new(),
            entries: HashMap::new(),
            roots: Vec::new(),
        }
    }

    pub fn options(&self) -> &GeneratorOptions {
        &self.options
    }

    pub fn store(&self) -> &SchemaStore {
        &self.store
    }

    /// Register a checker for a `format` name. Applies to units compiled later.
    pub fn register_format<F>(&mut self, name: &str, check: F)
    where
        F: Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
    {
        let check: Arc<FormatFn> = Arc::new(check);
        self.formats.insert(
            name.to_string(),
            FormatCheck {
                name: name.to_string(),
                check,
            },
        );
    }

    /// Register a root schema, optionally with its document and display name.
    ///
    /// Without a document the URI is recorded as missing until a later call
    /// supplies it.
    ///
    /// # Errors
    ///
    /// Returns `CompileError::AlreadyCompiled` if a document is given for a
    /// URI whose document has already been compiled.
    pub fn add_schema(
        &mut self,
        uri: &str,
        document: Option<Value>,
        name: Option<&str>,
    ) -> Result<(), CompileError> {
        let uri = uri::normalize(uri);
        let base = uri::base(&uri).to_string();
        match document {
            Some(document) => {
                if self.handled.iter().any(|h| uri::base(h) == base) {
                    return Err(CompileError::AlreadyCompiled { uri });
                }
                tracing::debug!(uri = %uri, "adding schema document");
                self.store.add(&uri, document);
                self.missing.retain(|m| uri::base(m) != base);
            }
            None => {
                if !self.store.contains(&uri) && !self.store.contains(&base) {
                    self.missing.insert(uri.clone());
                    self.store.mark_missing(&uri);
                }
            }
        }

        if let Some(name) = name {
            self.class_names.insert(uri.clone(), name.to_string());
        }
        if !self.roots.contains(&uri) {
            self.roots.push(uri.clone());
        }
        if !self.handled.contains(&uri) {
            self.queue.push_back(uri);
        }
        Ok(())
    }

    /// Root URIs in registration order.
    pub fn roots(&self) -> &[String] {
        &self.roots
    }

    pub fn class_name(&self, uri: &str) -> Option<&str> {
        self.class_names.get(&uri::normalize(uri)).map(String::as_str)
    }

    /// Base URIs that must be supplied before compilation can finish.
    pub fn missing(&self) -> Vec<String> {
        let mut all: BTreeSet<String> = self
            .missing
            .iter()
            .map(|m| uri::base(m).to_string())
            .collect();
        all.extend(self.store.missing());
        all.into_iter()
            .filter(|base| !self.store.contains(base))
            .collect()
    }

    pub fn is_compiled(&self, uri: &str) -> bool {
        self.handled.contains(&uri::normalize(uri))
    }

    /// Compile everything queued and return a snapshot of all units.
    ///
    /// URIs that cannot be resolved yet stay queued for the next call.
    ///
    /// # Errors
    ///
    /// Returns `CompileError::InvalidPattern` for an uncompilable regular
    /// expression. The rest of the queue is still processed.
    pub fn compile(&mut self) -> Result<Validators, CompileError> {
        let mut deferred = Vec::new();
        let mut failure = None;

        while let Some(uri) = self.queue.pop_front() {
            if self.handled.contains(&uri) {
                continue;
            }
            match self.store.resolve(&uri) {
                Err(StoreError::CircularReference { chain }) => {
                    tracing::warn!(uri = %uri, chain = ?chain, "circular schema reference");
                    self.finish(&uri);
                    self.entries.insert(uri, Entry::Circular(chain));
                }
                Ok(None) => {
                    tracing::trace!(uri = %uri, "schema not available yet");
                    self.missing.insert(uri.clone());
                    deferred.push(uri);
                }
                Ok(Some(resolved)) if resolved.uri != uri => {
                    tracing::trace!(uri = %uri, target = %resolved.uri, "schema is an alias");
                    self.finish(&uri);
                    self.enqueue(resolved.uri.clone());
                    self.aliases.insert(uri, resolved.uri);
                }
                Ok(Some(resolved)) => {
                    self.finish(&uri);
                    match self.lower_unit(&uri, &resolved.value) {
                        Ok(unit) => {
                            tracing::debug!(uri = %uri, "compiled schema");
                            self.entries.insert(uri, Entry::Unit(Arc::new(unit)));
                        }
                        Err(err) => {
                            tracing::warn!(uri = %uri, error = %err, "schema failed to compile");
                            failure.get_or_insert(err);
                        }
                    }
                }
            }
        }
        self.queue.extend(deferred);

        match failure {
            Some(err) => Err(err),
            None => Ok(self.validators()),
        }
    }

    /// Snapshot of the units compiled so far.
    pub fn validators(&self) -> Validators {
        Validators {
            entries: Arc::new(self.entries.clone()),
            aliases: Arc::new(self.aliases.clone()),
            options: self.options.clone(),
        }
    }

    fn finish(&mut self, uri: &str) {
        self.handled.insert(uri.to_string());
        self.missing.remove(uri);
    }

    fn enqueue(&mut self, uri: String) {
        if !self.handled.contains(&uri) && !self.queue.contains(&uri) {
            self.queue.push_back(uri);
        }
    }

    fn lower_unit(&mut self, uri: &str, schema: &Value) -> Result<ValidationUnit, CompileError> {
        let mut lowering = Lowering {
            formats: &self.formats,
            refs: Vec::new(),
        };
        // non-object documents (e.g. failed fetches) still record their assignment
        let node = match schema {
            Value::Object(_) | Value::Bool(false) => lowering.node(uri, schema)?,
            _ => lowering.node(uri, &Value::Object(Map::new()))?,
        };
        let refs = lowering.refs;
        for target in refs {
            self.enqueue(target);
        }
        Ok(ValidationUnit {
            uri: uri.to_string(),
            name: self.class_names.get(uri).cloned(),
            node,
        })
    }
}

/// Lowers one schema document into a node tree, collecting `$ref` targets.
struct Lowering<'a> {
    formats: &'a HashMap<String, FormatCheck>,
    refs: Vec<String>,
}

fn count(map: &Map<String, Value>, key: &str) -> Option<u64> {
    map.get(key)?
        .as_f64()
        .filter(|n| *n >= 0.0)
        .map(|n| n as u64)
}

fn flag(map: &Map<String, Value>, key: &str) -> bool {
    map.get(key).and_then(Value::as_bool).unwrap_or(false)
}

impl Lowering<'_> {
    fn node(&mut self, uri: &str, schema: &Value) -> Result<Node, CompileError> {
        let map = match schema {
            Value::Object(map) => map,
            Value::Bool(false) => return Ok(Node::Reject { uri: uri.to_string() }),
            _ => return Ok(Node::Accept),
        };
        // draft 4: keywords next to $ref are ignored
        if let Some(target) = map.get("$ref").and_then(Value::as_str) {
            self.refs.push(target.to_string());
            return Ok(Node::Ref {
                target: target.to_string(),
            });
        }
        Ok(Node::Schema(Box::new(self.schema(uri, map)?)))
    }

    fn child(&mut self, uri: &str, segments: &[&str], schema: &Value) -> Result<Node, CompileError> {
        self.node(&uri::child(uri, segments), schema)
    }

    fn list(&mut self, uri: &str, map: &Map<String, Value>, keyword: &str) -> Result<Vec<Node>, CompileError> {
        let Some(items) = map.get(keyword).and_then(Value::as_array) else {
            return Ok(Vec::new());
        };
        items
            .iter()
            .enumerate()
            .map(|(idx, schema)| self.child(uri, &[keyword, idx.to_string().as_str()], schema))
            .collect()
    }

    fn additional(&mut self, uri: &str, map: &Map<String, Value>, keyword: &str) -> Result<Additional, CompileError> {
        Ok(match map.get(keyword) {
            Some(Value::Bool(false)) => Additional::Forbidden,
            Some(schema @ Value::Object(_)) => {
                Additional::Schema(Box::new(self.child(uri, &[keyword], schema)?))
            }
            _ => Additional::Allowed,
        })
    }

    fn pattern(uri: &str, source: &str) -> Result<Pattern, CompileError> {
        Pattern::new(source).map_err(|source_err| CompileError::InvalidPattern {
            uri: uri.to_string(),
            pattern: source.to_string(),
            source: source_err,
        })
    }

    fn schema(&mut self, uri: &str, map: &Map<String, Value>) -> Result<SchemaNode, CompileError> {
        let (types, declared, integer_only) = type_set(map);

        let mut dispatch: Vec<Branch> = Vec::new();
        for kind in JsonKind::ALL {
            if !types.contains(kind) {
                continue;
            }
            let checks = self.checks(uri, map, kind, integer_only)?;
            match dispatch.iter_mut().find(|branch| branch.checks == checks) {
                Some(branch) => branch.types.insert(kind),
                None => dispatch.push(Branch {
                    types: TypeSet::single(kind),
                    checks,
                }),
            }
        }
        dispatch.sort_by_key(|branch| branch.types.len());

        let not = match map.get("not") {
            Some(schema) => Some(Box::new(self.child(uri, &["not"], schema)?)),
            None => None,
        };

        let links = map
            .get("links")
            .and_then(Value::as_array)
            .map(|ldos| ldos.iter().filter_map(link_template).collect())
            .unwrap_or_default();

        Ok(SchemaNode {
            uri: uri.to_string(),
            types,
            declared,
            enumeration: map.get("enum").and_then(Value::as_array).cloned(),
            dispatch,
            all_of: self.list(uri, map, "allOf")?,
            any_of: self.list(uri, map, "anyOf")?,
            one_of: self.list(uri, map, "oneOf")?,
            not,
            format: map
                .get("format")
                .and_then(Value::as_str)
                .and_then(|name| self.formats.get(name).cloned()),
            links,
        })
    }

    fn checks(
        &mut self,
        uri: &str,
        map: &Map<String, Value>,
        kind: JsonKind,
        integer_only: bool,
    ) -> Result<Vec<Check>, CompileError> {
        let mut checks = Vec::new();
        match kind {
            JsonKind::Null | JsonKind::Boolean => {}
            JsonKind::Number => {
                let divisor = map
                    .get("multipleOf")
                    .or_else(|| map.get("divisibleBy"))
                    .and_then(Value::as_f64)
                    .filter(|d| *d > 0.0);
                if integer_only && !divisor.is_some_and(is_integral) {
                    checks.push(Check::Integer);
                }
                if let Some(divisor) = divisor {
                    checks.push(Check::MultipleOf(divisor));
                }
                if let Some(limit) = map.get("minimum").and_then(Value::as_f64) {
                    checks.push(Check::Minimum {
                        limit,
                        exclusive: flag(map, "exclusiveMinimum"),
                    });
                }
                if let Some(limit) = map.get("maximum").and_then(Value::as_f64) {
                    checks.push(Check::Maximum {
                        limit,
                        exclusive: flag(map, "exclusiveMaximum"),
                    });
                }
            }
            JsonKind::String => {
                if let Some(min) = count(map, "minLength") {
                    checks.push(Check::MinLength(min));
                }
                if let Some(max) = count(map, "maxLength") {
                    checks.push(Check::MaxLength(max));
                }
                if let Some(source) = map.get("pattern").and_then(Value::as_str) {
                    checks.push(Check::Pattern(Self::pattern(uri, source)?));
                }
            }
            JsonKind::Array => {
                if let Some(min) = count(map, "minItems") {
                    checks.push(Check::MinItems(min));
                }
                if let Some(max) = count(map, "maxItems") {
                    checks.push(Check::MaxItems(max));
                }
                match map.get("items") {
                    Some(Value::Array(_)) => checks.push(Check::Tuple {
                        items: self.list(uri, map, "items")?,
                        additional: self.additional(uri, map, "additionalItems")?,
                    }),
                    Some(schema) => {
                        checks.push(Check::Items(Box::new(self.child(uri, &["items"], schema)?)))
                    }
                    None => {}
                }
                if flag(map, "uniqueItems") {
                    checks.push(Check::UniqueItems);
                }
            }
            JsonKind::Object => {
                if let Some(min) = count(map, "minProperties") {
                    checks.push(Check::MinProperties(min));
                }
                if let Some(max) = count(map, "maxProperties") {
                    checks.push(Check::MaxProperties(max));
                }
                if let Some(rules) = self.object_rules(uri, map)? {
                    checks.push(Check::Object(Box::new(rules)));
                }
            }
        }
        Ok(checks)
    }

    fn object_rules(&mut self, uri: &str, map: &Map<String, Value>) -> Result<Option<ObjectRules>, CompileError> {
        let mut keys: Vec<KeyRule> = Vec::new();

        if let Some(properties) = map.get("properties").and_then(Value::as_object) {
            for (key, schema) in properties {
                let node = self.child(uri, &["properties", key.as_str()], schema)?;
                key_rule(&mut keys, key).property = Some(node);
            }
        }
        if let Some(required) = map.get("required").and_then(Value::as_array) {
            for key in required.iter().filter_map(Value::as_str) {
                key_rule(&mut keys, key).required = true;
            }
        }
        if let Some(dependencies) = map.get("dependencies").and_then(Value::as_object) {
            for (key, dependency) in dependencies {
                let dependency = match dependency {
                    Value::Array(names) => Dependency::Keys(
                        names.iter().filter_map(Value::as_str).map(String::from).collect(),
                    ),
                    Value::String(name) => Dependency::Keys(vec![name.clone()]),
                    schema => Dependency::Schema(self.child(uri, &["dependencies", key.as_str()], schema)?),
                };
                key_rule(&mut keys, key).dependency = Some(dependency);
            }
        }

        let mut patterns = Vec::new();
        if let Some(pattern_properties) = map.get("patternProperties").and_then(Value::as_object) {
            for (source, schema) in pattern_properties {
                let pattern = Self::pattern(uri, source)?;
                let node = self.child(uri, &["patternProperties", source.as_str()], schema)?;
                patterns.push((pattern, node));
            }
        }

        let additional = self.additional(uri, map, "additionalProperties")?;
        if keys.is_empty() && patterns.is_empty() && additional == Additional::Allowed {
            return Ok(None);
        }
        Ok(Some(ObjectRules {
            keys,
            patterns,
            additional,
        }))
    }
}

fn key_rule<'r>(keys: &'r mut Vec<KeyRule>, key: &str) -> &'r mut KeyRule {
    let idx = match keys.iter().position(|rule| rule.key == key) {
        Some(idx) => idx,
        None => {
            keys.push(KeyRule {
                key: key.to_string(),
                property: None,
                required: false,
                dependency: None,
            });
            keys.len() - 1
        }
    };
    &mut keys[idx]
}

/// Allowed runtime types, the declared names, and whether only integers pass.
fn type_set(map: &Map<String, Value>) -> (TypeSet, Vec<String>, bool) {
    let declared: Vec<String> = match map.get("type") {
        Some(Value::String(name)) => vec![name.clone()],
        Some(Value::Array(names)) => names
            .iter()
            .filter_map(Value::as_str)
            .map(String::from)
            .collect(),
        _ => Vec::new(),
    };

    let mut types = TypeSet::EMPTY;
    let (mut integer, mut number) = (false, false);
    for name in &declared {
        match name.as_str() {
            "null" => types.insert(JsonKind::Null),
            "boolean" => types.insert(JsonKind::Boolean),
            "integer" => {
                integer = true;
                types.insert(JsonKind::Number);
            }
            "number" => {
                number = true;
                types.insert(JsonKind::Number);
            }
            "string" => types.insert(JsonKind::String),
            "array" => types.insert(JsonKind::Array),
            "object" => types.insert(JsonKind::Object),
            "any" => types = TypeSet::ALL,
            _ => {}
        }
    }
    if types == TypeSet::EMPTY {
        return (TypeSet::ALL, declared, false);
    }
    (types, declared, integer && !number)
}

fn link_template(ldo: &Value) -> Option<LinkTemplate> {
    let href = ldo.get("href")?.as_str()?;
    Some(LinkTemplate {
        rel: ldo
            .get("rel")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        method: ldo
            .get("method")
            .and_then(Value::as_str)
            .map(str::to_ascii_uppercase)
            .unwrap_or_else(|| "GET".to_string()),
        href: UriTemplate::parse(href),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use serde_json::json;

    fn compiled(schema: Value) -> Validators {
        let mut generator = Generator::new(GeneratorOptions::tracking());
        generator.add_schema("s", Some(schema), None).unwrap();
        generator.compile().unwrap()
    }

    fn root_node(validators: &Validators) -> SchemaNode {
        match validators.unit("s").unwrap().node() {
            Node::Schema(node) => (**node).clone(),
            other => panic!("unexpected node {:?}", other),
        }
    }

    #[test]
    fn compiling_twice_reuses_units() {
        let mut generator = Generator::default();
        generator
            .add_schema("s", Some(json!({"type": "object"})), Some("Thing"))
            .unwrap();
        let first = generator.compile().unwrap();
        let second = generator.compile().unwrap();
        let (a, b) = (first.unit("s").unwrap(), second.unit("s").unwrap());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.name(), Some("Thing"));
        assert_eq!(generator.class_name("s#"), Some("Thing"));
    }

    #[test]
    fn equal_type_branches_are_merged() {
        let validators = compiled(json!({"minLength": 2}));
        let node = root_node(&validators);
        assert_eq!(node.dispatch.len(), 2);
        assert_eq!(node.dispatch[0].types, TypeSet::single(JsonKind::String));
        assert_eq!(node.dispatch[1].types.len(), 5);
    }

    #[test]
    fn integer_multiple_of_replaces_integer_check() {
        let validators = compiled(json!({"type": "integer", "multipleOf": 2}));
        let node = root_node(&validators);
        assert_eq!(node.dispatch[0].checks, vec![Check::MultipleOf(2.0)]);

        let validators = compiled(json!({"type": "integer", "multipleOf": 0.5}));
        let node = root_node(&validators);
        assert_eq!(node.dispatch[0].checks[0], Check::Integer);
        let result = validators.validate("s", &json!(1.5));
        assert_eq!(result.errors[0].code, ErrorCode::InvalidType);
    }

    #[test]
    fn pure_reference_becomes_alias() {
        let mut generator = Generator::default();
        generator
            .add_schema("a", Some(json!({"$ref": "b#/definitions/x"})), None)
            .unwrap();
        generator
            .add_schema("b", Some(json!({"definitions": {"x": {"type": "string"}}})), None)
            .unwrap();
        let validators = generator.compile().unwrap();
        assert_eq!(validators.unit("a").unwrap().uri(), "b#/definitions/x");
        assert!(!validators.validate("a", &json!(1)).valid);
        assert!(validators.validate("a", &json!("x")).valid);
    }

    #[test]
    fn circular_alias_reports_error() {
        let mut generator = Generator::default();
        generator.add_schema("a", Some(json!({"$ref": "b"})), None).unwrap();
        generator.add_schema("b", Some(json!({"$ref": "a"})), None).unwrap();
        let validators = generator.compile().unwrap();
        let result = validators.validate("a", &json!({}));
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].code, ErrorCode::CircularReference);
    }

    #[test]
    fn missing_documents_are_reported_and_permissive() {
        let mut generator = Generator::new(GeneratorOptions::tracking());
        generator
            .add_schema("/schemas/foo", Some(json!({"properties": {"x": {"$ref": "/schemas/bar"}}})), None)
            .unwrap();
        let validators = generator.compile().unwrap();
        assert_eq!(generator.missing(), vec!["/schemas/bar"]);

        let result = validators.validate("/schemas/foo", &json!({"x": 1}));
        assert!(result.valid);
        assert_eq!(result.missing.unwrap()["/x"], vec!["/schemas/bar"]);

        generator
            .add_schema("/schemas/bar", Some(json!({"type": "string"})), None)
            .unwrap();
        assert!(generator.missing().is_empty());
        let validators = generator.compile().unwrap();
        assert!(!validators.validate("/schemas/foo", &json!({"x": 1})).valid);
    }

    #[test]
    fn root_without_document_is_missing() {
        let mut generator = Generator::default();
        generator.add_schema("http://x/s", None, None).unwrap();
        assert_eq!(generator.missing(), vec!["http://x/s"]);
        generator.compile().unwrap();
        assert!(!generator.is_compiled("http://x/s"));
        generator
            .add_schema("http://x/s", Some(json!({})), None)
            .unwrap();
        let validators = generator.compile().unwrap();
        assert!(validators.unit("http://x/s").is_some());
    }

    #[test]
    fn recompiling_finalized_uri_fails() {
        let mut generator = Generator::default();
        generator.add_schema("s", Some(json!({})), None).unwrap();
        generator.compile().unwrap();
        let err = generator.add_schema("s", Some(json!({"type": "string"})), None);
        assert!(matches!(err, Err(CompileError::AlreadyCompiled { .. })));
        // re-registering without a document is fine
        generator.add_schema("s", None, None).unwrap();
    }

    #[test]
    fn invalid_pattern_is_a_compile_error() {
        let mut generator = Generator::default();
        generator
            .add_schema("s", Some(json!({"pattern": "(unclosed"})), None)
            .unwrap();
        let err = generator.compile().unwrap_err();
        assert!(matches!(err, CompileError::InvalidPattern { ref pattern, .. } if pattern == "(unclosed"));
    }

    #[test]
    fn custom_formats() {
        let mut generator = Generator::default();
        generator.register_format("even", |value| match value.as_i64() {
            Some(n) if n % 2 == 0 => Ok(()),
            _ => Err("not even".to_string()),
        });
        generator
            .add_schema("s", Some(json!({"format": "even"})), None)
            .unwrap();
        let validators = generator.compile().unwrap();
        assert!(validators.validate("s", &json!(4)).valid);
        let result = validators.validate("s", &json!(3));
        assert_eq!(result.errors[0].code, ErrorCode::FormatCustom);
        assert_eq!(result.errors[0].params.get("message"), Some(&json!("not even")));
    }

    #[test]
    fn links_are_expanded_per_value() {
        let validators = compiled(json!({
            "links": [{"rel": "self", "href": "/items/{id}"}, {"rel": "edit", "href": "/items/{id}/edit", "method": "put"}]
        }));
        let result = validators.validate("s", &json!({"id": 5}));
        let links = result.links.unwrap();
        let links = &links[""];
        assert_eq!(links[0].href, "/items/5");
        assert_eq!(links[0].method, "GET");
        assert_eq!(links[1].method, "PUT");
    }

    #[test]
    fn state_options_control_accumulators() {
        let state = ValidationState::new(&GeneratorOptions::default());
        assert!(state.schemas.is_none() && state.links.is_none() && state.missing.is_none());
        let state = ValidationState::new(&GeneratorOptions::tracking()).fresh();
        assert!(state.schemas.is_some() && state.links.is_some() && state.missing.is_some());
    }
}
