//! Layered store of schema documents keyed by URI.
//!
//! Documents are normalised on insertion: every `$ref` is rewritten to an
//! absolute URI, nested `id`s that stay inside the document's scope become
//! addressable entries of their own, and references to documents the store
//! has never seen are recorded as missing.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::error::StoreError;
use crate::pointer;
use crate::uri;

/// Keywords whose values are instance data rather than subschemas.
const DATA_KEYWORDS: &[&str] = &["enum", "default"];

/// A schema found by [`SchemaStore::resolve`].
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    /// URI of the node after following every `$ref`.
    pub uri: String,
    pub value: Value,
}

/// Schema documents addressed by URI, optionally layered over a parent store.
#[derive(Debug, Default)]
pub struct SchemaStore {
    schemas: HashMap<String, Value>,
    missing: BTreeSet<String>,
    parent: Option<Arc<SchemaStore>>,
}

impl SchemaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that falls back to `parent` for lookups. Writes stay local.
    pub fn layered(parent: Arc<SchemaStore>) -> Self {
        Self {
            parent: Some(parent),
            ..Self::default()
        }
    }

    /// Add `document` under `uri`.
    pub fn add(&mut self, uri: &str, document: Value) {
        let uri = uri::normalize(uri);
        let mut scan = Scan {
            refs: Vec::new(),
            ids: Vec::new(),
        };
        let normalized = scan.visit(&document, &uri, true);

        self.missing.remove(uri::base(&uri));
        self.schemas.insert(uri.clone(), normalized);
        for (id, subschema) in scan.ids {
            self.missing.remove(uri::base(&id));
            self.schemas.entry(id).or_insert(subschema);
        }

        for reference in scan.refs {
            let target_base = uri::base(&reference);
            if !self.contains(&reference) && !self.contains(target_base) {
                tracing::debug!(schema = %uri, target = %reference, "reference target missing");
                self.missing.insert(target_base.to_string());
            }
        }
    }

    /// Whether an entry exists for exactly `uri`, in this store or a parent.
    pub fn contains(&self, uri: &str) -> bool {
        self.find(uri).is_some()
    }

    /// Record `uri`'s base as missing unless it is present.
    pub fn mark_missing(&mut self, uri: &str) {
        let target = uri::base(uri);
        if !self.contains(target) {
            self.missing.insert(target.to_string());
        }
    }

    /// Base URIs referenced but absent, across all layers.
    pub fn missing(&self) -> Vec<String> {
        let mut all = BTreeSet::new();
        self.collect_missing(&mut all);
        all.into_iter().filter(|m| !self.contains(m)).collect()
    }

    fn collect_missing(&self, into: &mut BTreeSet<String>) {
        into.extend(self.missing.iter().cloned());
        if let Some(parent) = &self.parent {
            parent.collect_missing(into);
        }
    }

    /// Look up a schema, following `$ref`s, and mark its base missing if absent.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::CircularReference` if following `$ref`s revisits a
    /// reference already on the chain.
    pub fn get(&mut self, uri: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.resolve(uri)?.map(|resolved| resolved.value))
    }

    /// Like [`get`](Self::get) but also reports the final URI reached.
    pub fn resolve(&mut self, uri: &str) -> Result<Option<Resolved>, StoreError> {
        match self.walk(uri)? {
            Walk::Found(resolved) => Ok(Some(resolved)),
            Walk::BaseAbsent(absent) => {
                self.missing.insert(absent);
                Ok(None)
            }
            Walk::NodeAbsent => Ok(None),
        }
    }

    /// Read-only lookup: same resolution as [`get`](Self::get), no bookkeeping.
    pub fn lookup(&self, uri: &str) -> Result<Option<Value>, StoreError> {
        match self.walk(uri)? {
            Walk::Found(resolved) => Ok(Some(resolved.value)),
            _ => Ok(None),
        }
    }

    fn find(&self, uri: &str) -> Option<&Value> {
        match self.schemas.get(uri) {
            Some(value) => Some(value),
            None => self.parent.as_ref().and_then(|p| p.find(uri)),
        }
    }

    fn walk(&self, uri: &str) -> Result<Walk, StoreError> {
        let mut visited = Vec::new();
        let mut current = uri::normalize(uri);
        loop {
            let node = match self.find(&current) {
                Some(node) => node,
                None => {
                    let (base, fragment) = uri::split(&current);
                    let Some(document) = self.find(base) else {
                        return Ok(Walk::BaseAbsent(base.to_string()));
                    };
                    match self.descend(document, fragment, &mut visited)? {
                        Some(node) => node,
                        None => return Ok(Walk::NodeAbsent),
                    }
                }
            };

            match reference_of(node) {
                Some(target) => {
                    if visited.iter().any(|v| v == target) {
                        visited.push(target.to_string());
                        return Err(StoreError::CircularReference { chain: visited });
                    }
                    visited.push(target.to_string());
                    current = target.to_string();
                }
                None => {
                    return Ok(Walk::Found(Resolved {
                        uri: current,
                        value: node.clone(),
                    }))
                }
            }
        }
    }

    /// Walk a pointer fragment, following `$ref`s met on intermediate nodes.
    fn descend<'a>(
        &'a self,
        document: &'a Value,
        fragment: &str,
        visited: &mut Vec<String>,
    ) -> Result<Option<&'a Value>, StoreError> {
        let mut node = document;
        for token in pointer::split(fragment) {
            while let Some(target) = reference_of(node) {
                if visited.iter().any(|v| v == target) {
                    visited.push(target.to_string());
                    return Err(StoreError::CircularReference {
                        chain: visited.clone(),
                    });
                }
                visited.push(target.to_string());
                let (base, inner) = uri::split(target);
                node = match self.find(target) {
                    Some(found) => found,
                    None => match self.find(base) {
                        Some(doc) => match pointer::get(doc, inner) {
                            Some(found) => found,
                            None => return Ok(None),
                        },
                        None => return Ok(None),
                    },
                };
            }
            node = match node {
                Value::Object(map) => match map.get(&token) {
                    Some(next) => next,
                    None => return Ok(None),
                },
                Value::Array(items) => match token.parse::<usize>().ok().and_then(|i| items.get(i)) {
                    Some(next) => next,
                    None => return Ok(None),
                },
                _ => return Ok(None),
            };
        }
        Ok(Some(node))
    }
}

enum Walk {
    Found(Resolved),
    BaseAbsent(String),
    NodeAbsent,
}

/// `$ref` target of a node, if it is a reference.
pub(crate) fn reference_of(node: &Value) -> Option<&str> {
    node.as_object()?.get("$ref")?.as_str()
}

struct Scan {
    refs: Vec<String>,
    ids: Vec<(String, Value)>,
}

impl Scan {
    fn visit(&mut self, value: &Value, scope: &str, is_root: bool) -> Value {
        match value {
            Value::Object(map) => self.visit_object(map, scope, is_root),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.visit(item, scope, false))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    fn visit_object(&mut self, map: &Map<String, Value>, scope: &str, is_root: bool) -> Value {
        let mut own_id = None;
        let mut scope = scope.to_string();
        if let Some(id) = map.get("id").and_then(Value::as_str) {
            let resolved = uri::resolve(&scope, id);
            // an id escaping its enclosing scope would shadow unrelated documents
            if uri::is_within(&resolved, &scope) {
                scope = resolved.clone();
                if !is_root {
                    own_id = Some(resolved);
                }
            } else {
                tracing::debug!(id = %id, scope = %scope, "ignoring out-of-scope id");
            }
        }

        let mut out = Map::with_capacity(map.len());
        for (key, child) in map {
            let normalized = match (key.as_str(), child) {
                ("$ref", Value::String(reference)) => {
                    let absolute = uri::resolve(&scope, reference);
                    self.refs.push(absolute.clone());
                    Value::String(absolute)
                }
                (k, v) if DATA_KEYWORDS.contains(&k) => v.clone(),
                (_, v) => self.visit(v, &scope, false),
            };
            out.insert(key.clone(), normalized);
        }

        let out = Value::Object(out);
        if let Some(id) = own_id {
            self.ids.push((id, out.clone()));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn add_rewrites_refs_to_absolute() {
        let mut store = SchemaStore::new();
        store.add(
            "http://example.com/schemas/item",
            json!({"properties": {"tag": {"$ref": "tag#/definitions/t"}}}),
        );
        let doc = store.get("http://example.com/schemas/item").unwrap().unwrap();
        assert_eq!(
            doc["properties"]["tag"]["$ref"],
            "http://example.com/schemas/tag#/definitions/t"
        );
        assert_eq!(store.missing(), vec!["http://example.com/schemas/tag"]);
    }

    #[test]
    fn add_clears_missing_for_base() {
        let mut store = SchemaStore::new();
        store.add("/schemas/foo", json!({"$ref": "/schemas/bar#/definitions/x"}));
        assert_eq!(store.missing(), vec!["/schemas/bar"]);
        store.add("/schemas/bar", json!({"definitions": {"x": {"type": "string"}}}));
        assert!(store.missing().is_empty());
        assert_eq!(
            store.get("/schemas/foo").unwrap(),
            Some(json!({"type": "string"}))
        );
    }

    #[test]
    fn get_walks_fragments_with_escapes() {
        let mut store = SchemaStore::new();
        store.add("s", json!({"properties": {"a/b": {"type": "integer"}, "~": {}}}));
        assert_eq!(
            store.get("s#/properties/a~1b").unwrap(),
            Some(json!({"type": "integer"}))
        );
        assert_eq!(store.get("s#/properties/~0").unwrap(), Some(json!({})));
        assert_eq!(store.get("s#/properties/nope").unwrap(), None);
        // fragment failure does not mark the present base as missing
        assert!(store.missing().is_empty());
        assert_eq!(store.get("other#/x").unwrap(), None);
        assert_eq!(store.missing(), vec!["other"]);
    }

    #[test]
    fn get_follows_refs_on_intermediate_nodes() {
        let mut store = SchemaStore::new();
        store.add("a", json!({"properties": {"foo": {"$ref": "b"}}}));
        store.add("b", json!({"items": {"type": "null"}}));
        let resolved = store.resolve("a#/properties/foo/items").unwrap().unwrap();
        assert_eq!(resolved.value, json!({"type": "null"}));
    }

    #[test]
    fn circular_refs_are_reported() {
        let mut store = SchemaStore::new();
        store.add("a", json!({"$ref": "b"}));
        store.add("b", json!({"$ref": "a"}));
        let err = store.get("a").unwrap_err();
        assert_eq!(
            err,
            StoreError::CircularReference {
                chain: vec!["b".into(), "a".into(), "b".into()]
            }
        );
    }

    #[test]
    fn nested_ids_in_scope_are_registered() {
        let mut store = SchemaStore::new();
        store.add(
            "http://x/root",
            json!({
                "definitions": {
                    "inner": {"id": "#inner", "type": "string"},
                    "escape": {"id": "http://other/thing", "type": "number"}
                }
            }),
        );
        assert_eq!(
            store.lookup("http://x/root#inner").unwrap().unwrap()["type"],
            "string"
        );
        assert_eq!(store.lookup("http://other/thing").unwrap(), None);
    }

    #[test]
    fn sibling_prefix_id_does_not_shadow_document() {
        let mut store = SchemaStore::new();
        store.add(
            "http://x/root",
            json!({
                "definitions": {
                    "evil": {"id": "http://x/root2", "type": "string"},
                    "use": {"$ref": "http://x/root2"}
                }
            }),
        );
        assert_eq!(store.lookup("http://x/root2").unwrap(), None);
        assert_eq!(store.missing(), vec!["http://x/root2"]);
    }

    #[test]
    fn nested_id_is_scoped_to_enclosing_id() {
        let mut store = SchemaStore::new();
        store.add(
            "http://x/root",
            json!({
                "definitions": {
                    "inner": {
                        "id": "http://x/root/inner",
                        "definitions": {"away": {"id": "http://x/root/other", "type": "string"}}
                    }
                }
            }),
        );
        assert!(store.lookup("http://x/root/inner").unwrap().is_some());
        assert_eq!(store.lookup("http://x/root/other").unwrap(), None);
    }

    #[test]
    fn refs_resolve_against_enclosing_id() {
        let mut store = SchemaStore::new();
        store.add(
            "http://x/dir/root",
            json!({"definitions": {"sub": {"id": "root/sub", "items": {"$ref": "leaf"}}}}),
        );
        let sub = store.lookup("http://x/dir/root/sub").unwrap().unwrap();
        assert_eq!(sub["items"]["$ref"], "http://x/dir/root/leaf");
    }

    #[test]
    fn enum_values_are_not_scanned() {
        let mut store = SchemaStore::new();
        store.add("e", json!({"enum": [{"$ref": "not-a-schema"}]}));
        assert!(store.missing().is_empty());
        assert_eq!(store.get("e").unwrap().unwrap()["enum"][0]["$ref"], "not-a-schema");
    }

    #[test]
    fn layered_store_reads_through_without_writing_back() {
        let mut parent = SchemaStore::new();
        parent.add("p", json!({"type": "object"}));
        parent.add("q", json!({"$ref": "gone"}));
        let parent = Arc::new(parent);

        let mut child = SchemaStore::layered(Arc::clone(&parent));
        child.add("c", json!({"$ref": "p"}));
        assert_eq!(child.get("c").unwrap(), Some(json!({"type": "object"})));
        assert!(!parent.contains("c"));
        assert_eq!(child.missing(), vec!["gone"]);

        child.add("gone", json!({}));
        assert!(child.missing().is_empty());
        assert_eq!(parent.missing(), vec!["gone"]);
    }
}
