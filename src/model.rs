//! Reactive JSON model.
//!
//! A [`RootModel`] owns one JSON value and keeps, after every write, the
//! schemas, links and errors that apply at each path. [`Model`] handles
//! address a path inside the root and carry listeners.
//!
//! Every write re-runs all root schemas over the whole value and diffs the
//! schema map. Listeners are invoked after the model lock is released, in
//! emission order:
//!
//! 1. [`ModelEvent::Change`] on each handle from the written path up to the root;
//! 2. [`ModelEvent::Change`] with an empty path on each handle below it;
//! 3. [`ModelEvent::SchemaChange`] on each handle whose schema set changed,
//!    parents before children.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::oneshot;

use crate::compiler::ValidationState;
use crate::error::{ErrorCode, ModelError, TransportError, ValidationError};
use crate::fetch::Context;
use crate::pointer;
use crate::types::{json_type_name, Link, PathMap};
use crate::uri;

/// Notification delivered to [`Model`] listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelEvent {
    /// The value changed; `path` is the written location relative to the
    /// listening handle (empty when the handle itself or an ancestor was
    /// written).
    Change { path: String },
    /// The set of schemas applying at the handle's path changed.
    SchemaChange {
        added: Vec<String>,
        removed: Vec<String>,
    },
}

type Listener = Arc<dyn Fn(&Model, &ModelEvent) + Send + Sync>;
type ReadyCallback = Box<dyn FnOnce() + Send>;

/// Which errors [`RootModel::get_path_errors`] returns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ErrorFilter {
    /// Only errors at exactly the path, not below it.
    pub exact: bool,
    /// Also report missing schemas and failed schema/document fetches.
    pub with_schema_errors: bool,
}

impl ErrorFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exact(mut self, exact: bool) -> Self {
        self.exact = exact;
        self
    }

    pub fn with_schema_errors(mut self, enabled: bool) -> Self {
        self.with_schema_errors = enabled;
        self
    }

    fn matches(&self, candidate: &str, path: &str) -> bool {
        if self.exact {
            candidate == path
        } else {
            pointer::is_within(candidate, path)
        }
    }
}

#[derive(Default)]
struct HandleNode {
    children: Vec<String>,
    listeners: Vec<(u64, Listener)>,
}

struct RootState {
    value: Value,
    url: Option<String>,
    schemas: Vec<String>,
    schema_map: PathMap<String>,
    link_map: PathMap<Link>,
    missing_map: PathMap<String>,
    errors: Vec<ValidationError>,
    document_error: Option<Arc<TransportError>>,
    pending: usize,
    dirty: bool,
    ready_callbacks: VecDeque<ReadyCallback>,
    handles: HashMap<String, HandleNode>,
    next_listener: u64,
}

impl RootState {
    /// Register the handle at `path` and its ancestors.
    fn ensure_handle(&mut self, path: &str) {
        if self.handles.contains_key(path) {
            return;
        }
        self.handles.insert(path.to_string(), HandleNode::default());
        if let Some(parent) = pointer::parent(path) {
            self.ensure_handle(parent);
            if let Some(node) = self.handles.get_mut(parent) {
                node.children.push(path.to_string());
            }
        }
    }

    /// Handle paths at and below `from`, parents first.
    fn walk_handles(&self, from: &str) -> Vec<String> {
        let mut order = Vec::new();
        let mut stack = vec![from.to_string()];
        while let Some(path) = stack.pop() {
            if let Some(node) = self.handles.get(&path) {
                stack.extend(node.children.iter().rev().cloned());
                order.push(path);
            }
        }
        order
    }

    fn listeners(&self, path: &str) -> Vec<Listener> {
        self.handles
            .get(path)
            .map(|node| node.listeners.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default()
    }

    fn schema_events(&self, old: &PathMap<String>) -> Vec<(String, ModelEvent)> {
        let empty = Vec::new();
        let mut events = Vec::new();
        for path in self.walk_handles("") {
            let before = old.get(&path).unwrap_or(&empty);
            let after = self.schema_map.get(&path).unwrap_or(&empty);
            let added: Vec<String> = after.iter().filter(|s| !before.contains(s)).cloned().collect();
            let removed: Vec<String> = before.iter().filter(|s| !after.contains(s)).cloned().collect();
            if !added.is_empty() || !removed.is_empty() {
                events.push((path, ModelEvent::SchemaChange { added, removed }));
            }
        }
        events
    }
}

struct RootInner {
    state: Mutex<RootState>,
    context: Context,
}

/// Owner of a JSON value and its schema bookkeeping.
///
/// Cloning is cheap; clones share the same value.
#[derive(Clone)]
pub struct RootModel {
    inner: Arc<RootInner>,
}

type Dispatch = Vec<(String, Listener, ModelEvent)>;

impl RootModel {
    /// A model over `value`. `url` is the document's own URL, used to resolve
    /// relative link targets.
    pub fn new(context: Context, value: Value, url: Option<&str>) -> Self {
        Self {
            inner: Arc::new(RootInner {
                state: Mutex::new(RootState {
                    value,
                    url: url.map(String::from),
                    schemas: Vec::new(),
                    schema_map: PathMap::new(),
                    link_map: PathMap::new(),
                    missing_map: PathMap::new(),
                    errors: Vec::new(),
                    document_error: None,
                    pending: 0,
                    dirty: false,
                    ready_callbacks: VecDeque::new(),
                    handles: HashMap::new(),
                    next_listener: 0,
                }),
                context,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RootState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn context(&self) -> &Context {
        &self.inner.context
    }

    pub fn url(&self) -> Option<String> {
        self.lock().url.clone()
    }

    /// Root schema URIs in registration order.
    pub fn schemas(&self) -> Vec<String> {
        self.lock().schemas.clone()
    }

    /// Apply another root schema to the value.
    ///
    /// The model recomputes immediately with whatever is compiled. If
    /// schemas are still missing, the model stays pending until the context
    /// has fetched them and then recomputes again.
    ///
    /// # Errors
    ///
    /// Returns `ModelError::Compile` if the schema cannot be compiled.
    pub fn add_schema(&self, uri: &str, document: Option<Value>) -> Result<(), ModelError> {
        let uri = uri::normalize(uri);
        self.inner.context.add_schema(&uri, document, None)?;
        let waiting = !self.inner.context.missing().is_empty();

        let dispatch = {
            let mut state = self.lock();
            if !state.schemas.contains(&uri) {
                state.schemas.push(uri.clone());
            }
            if waiting {
                state.pending += 1;
                state.dirty = true;
            }
            let old = self.recompute(&mut state);
            let events = state.schema_events(&old);
            Self::with_listeners(&state, events)
        };
        self.dispatch(dispatch);

        if waiting {
            tracing::debug!(schema = %uri, "model waiting for schemas");
            let root = self.clone();
            self.inner.context.on_schemas_fetched(move || root.settle());
        }
        Ok(())
    }

    pub(crate) fn set_document_error(&self, error: TransportError) {
        self.lock().document_error = Some(Arc::new(error));
    }

    pub fn document_error(&self) -> Option<Arc<TransportError>> {
        self.lock().document_error.clone()
    }

    /// Handle for `path`.
    pub fn model(&self, path: &str) -> Model {
        self.lock().ensure_handle(path);
        Model {
            root: self.clone(),
            path: path.to_string(),
        }
    }

    /// Handle for the whole value.
    pub fn root(&self) -> Model {
        self.model("")
    }

    pub fn get_path_value(&self, path: &str) -> Option<Value> {
        pointer::get(&self.lock().value, path).cloned()
    }

    pub fn value(&self) -> Value {
        self.lock().value.clone()
    }

    /// Write `value` at `path`.
    ///
    /// Returns `false` without any effect when the parent does not exist or
    /// is not a container. Otherwise always recomputes, even if the new value
    /// equals the old one.
    pub fn set_path_value(&self, path: &str, value: Value) -> bool {
        let dispatch = {
            let mut state = self.lock();
            let written = appended_path(&state.value, path);
            if !pointer::set(&mut state.value, path, value) {
                return false;
            }
            if state.pending > 0 {
                state.dirty = true;
            }
            let old = self.recompute(&mut state);

            let mut events = Vec::new();
            let mut current = Some(written.as_str());
            while let Some(path) = current {
                if state.handles.contains_key(path) {
                    let relative = pointer::relative(&written, path).unwrap_or_default();
                    events.push((
                        path.to_string(),
                        ModelEvent::Change {
                            path: relative.to_string(),
                        },
                    ));
                }
                current = pointer::parent(path);
            }
            for below in state.walk_handles(&written).into_iter().skip(1) {
                events.push((below, ModelEvent::Change { path: String::new() }));
            }
            events.extend(state.schema_events(&old));
            Self::with_listeners(&state, events)
        };
        self.dispatch(dispatch);
        true
    }

    /// Schema URIs applying at exactly `path`.
    pub fn get_path_schemas(&self, path: &str) -> Vec<String> {
        self.lock()
            .schema_map
            .get(path)
            .cloned()
            .unwrap_or_default()
    }

    /// Links available at exactly `path`, hrefs resolved against the model URL.
    pub fn get_path_links(&self, path: &str) -> Vec<Link> {
        self.lock().link_map.get(path).cloned().unwrap_or_default()
    }

    /// Validation errors at or below `path`, per `filter`.
    pub fn get_path_errors(&self, path: &str, filter: ErrorFilter) -> Vec<ValidationError> {
        let state = self.lock();
        let mut errors: Vec<ValidationError> = state
            .errors
            .iter()
            .filter(|err| filter.matches(&err.path, path))
            .cloned()
            .collect();
        if !filter.with_schema_errors {
            return errors;
        }

        let url = state.url.clone().unwrap_or_default();
        if let Some(err) = &state.document_error {
            if filter.matches("", path) {
                errors.push(
                    ValidationError::new(ErrorCode::DocumentFetchError, "", &url)
                        .param("url", url.clone())
                        .param("message", err.to_string()),
                );
            }
        }

        let context = &self.inner.context;
        for (at, schemas) in &state.schema_map {
            if !filter.matches(at, path) {
                continue;
            }
            for schema in schemas {
                if let Some(err) = context.fetch_error(schema) {
                    errors.push(
                        ValidationError::new(ErrorCode::SchemaFetchError, at, schema)
                            .param("url", uri::base(schema))
                            .param("message", err.to_string()),
                    );
                }
            }
        }
        for (at, schemas) in &state.missing_map {
            if !filter.matches(at, path) {
                continue;
            }
            for schema in schemas {
                // a failed fetch that will be retried leaves the schema missing
                let error = match context.fetch_error(schema) {
                    Some(err) => ValidationError::new(ErrorCode::SchemaFetchError, at, schema)
                        .param("url", uri::base(schema))
                        .param("message", err.to_string()),
                    None => ValidationError::new(ErrorCode::SchemaMissing, at, schema)
                        .param("url", uri::base(schema)),
                };
                errors.push(error);
            }
        }
        errors
    }

    /// Number of schema batches still being fetched.
    pub fn pending(&self) -> usize {
        self.lock().pending
    }

    pub fn is_ready(&self) -> bool {
        self.pending() == 0
    }

    /// Run `callback` once no schema fetch is pending (immediately if ready).
    pub fn when_ready<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut state = self.lock();
            if state.pending > 0 {
                state.ready_callbacks.push_back(Box::new(callback));
                return;
            }
        }
        callback();
    }

    /// Resolves once no schema fetch is pending.
    pub fn ready(&self) -> impl Future<Output = ()> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        self.when_ready(move || {
            let _ = tx.send(());
        });
        async move {
            let _ = rx.await;
        }
    }

    fn settle(&self) {
        let (dispatch, callbacks) = {
            let mut state = self.lock();
            state.pending = state.pending.saturating_sub(1);
            if state.pending > 0 {
                return;
            }
            let mut events = Vec::new();
            if state.dirty {
                state.dirty = false;
                let old = self.recompute(&mut state);
                events = state.schema_events(&old);
            }
            let callbacks: Vec<ReadyCallback> = state.ready_callbacks.drain(..).collect();
            (Self::with_listeners(&state, events), callbacks)
        };
        tracing::debug!(callbacks = callbacks.len(), "model ready");
        self.dispatch(dispatch);
        for callback in callbacks {
            callback();
        }
    }

    /// Re-run every root schema. Returns the previous schema map.
    fn recompute(&self, state: &mut RootState) -> PathMap<String> {
        let validators = self.inner.context.validators();
        let mut run = ValidationState {
            errors: Vec::new(),
            schemas: Some(PathMap::new()),
            links: Some(PathMap::new()),
            missing: Some(PathMap::new()),
        };
        for schema in &state.schemas {
            validators.run(schema, &state.value, "", &mut run);
        }

        let mut links = run.links.unwrap_or_default();
        if let Some(base) = &state.url {
            for link in links.values_mut().flatten() {
                link.href = uri::resolve(base, &link.href);
            }
        }

        tracing::trace!(errors = run.errors.len(), "model recomputed");
        state.errors = run.errors;
        state.link_map = links;
        state.missing_map = run.missing.unwrap_or_default();
        std::mem::replace(&mut state.schema_map, run.schemas.unwrap_or_default())
    }

    fn with_listeners(state: &RootState, events: Vec<(String, ModelEvent)>) -> Dispatch {
        let mut dispatch = Vec::new();
        for (path, event) in events {
            for listener in state.listeners(&path) {
                dispatch.push((path.clone(), listener, event.clone()));
            }
        }
        dispatch
    }

    fn dispatch(&self, dispatch: Dispatch) {
        for (path, listener, event) in dispatch {
            let model = Model {
                root: self.clone(),
                path,
            };
            listener(&model, &event);
        }
    }

    fn subscribe(&self, path: &str, listener: Listener) -> u64 {
        let mut state = self.lock();
        state.ensure_handle(path);
        let id = state.next_listener;
        state.next_listener += 1;
        if let Some(node) = state.handles.get_mut(path) {
            node.listeners.push((id, listener));
        }
        id
    }

    fn unsubscribe(&self, path: &str, id: u64) {
        if let Some(node) = self.lock().handles.get_mut(path) {
            node.listeners.retain(|(existing, _)| *existing != id);
        }
    }
}

/// Path actually written by `set`: a trailing `-` array token becomes the
/// appended index.
fn appended_path(value: &Value, path: &str) -> String {
    match (path.strip_suffix("/-"), pointer::parent(path)) {
        (Some(parent), Some(_)) => match pointer::get(value, parent) {
            Some(Value::Array(items)) => pointer::child(parent, &items.len().to_string()),
            _ => path.to_string(),
        },
        _ => path.to_string(),
    }
}

/// Handle on one path of a [`RootModel`].
#[derive(Clone)]
pub struct Model {
    root: RootModel,
    path: String,
}

impl Model {
    pub fn root(&self) -> &RootModel {
        &self.root
    }

    /// JSON Pointer of this handle.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Handle at `relative` (a JSON Pointer) below this one.
    pub fn pointer(&self, relative: &str) -> Model {
        self.root.model(&format!("{}{}", self.path, relative))
    }

    pub fn prop(&self, key: &str) -> Model {
        self.root.model(&pointer::child(&self.path, key))
    }

    pub fn item(&self, index: usize) -> Model {
        self.root.model(&pointer::child(&self.path, &index.to_string()))
    }

    pub fn parent(&self) -> Option<Model> {
        pointer::parent(&self.path).map(|parent| self.root.model(parent))
    }

    pub fn get(&self) -> Option<Value> {
        self.root.get_path_value(&self.path)
    }

    pub fn set(&self, value: Value) -> bool {
        self.root.set_path_value(&self.path, value)
    }

    /// JSON type name of the current value, `None` if the path is absent.
    pub fn json_type(&self) -> Option<&'static str> {
        self.get().as_ref().map(json_type_name)
    }

    /// Object keys, or array indices as strings.
    pub fn keys(&self) -> Vec<String> {
        match self.get() {
            Some(Value::Object(map)) => map.keys().cloned().collect(),
            Some(Value::Array(items)) => (0..items.len()).map(|i| i.to_string()).collect(),
            _ => Vec::new(),
        }
    }

    /// Number of members or items; string length in characters; otherwise 0.
    pub fn len(&self) -> usize {
        match self.get() {
            Some(Value::Object(map)) => map.len(),
            Some(Value::Array(items)) => items.len(),
            Some(Value::String(s)) => s.chars().count(),
            _ => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn schemas(&self) -> Vec<String> {
        self.root.get_path_schemas(&self.path)
    }

    pub fn links(&self) -> Vec<Link> {
        self.root.get_path_links(&self.path)
    }

    /// First link with relation `rel`.
    pub fn link(&self, rel: &str) -> Option<Link> {
        self.links().into_iter().find(|link| link.rel == rel)
    }

    pub fn errors(&self, filter: ErrorFilter) -> Vec<ValidationError> {
        self.root.get_path_errors(&self.path, filter)
    }

    /// Listen for events on this path until the subscription is dropped via
    /// [`Subscription::unsubscribe`].
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Model, &ModelEvent) + Send + Sync + 'static,
    {
        let id = self.root.subscribe(&self.path, Arc::new(listener));
        Subscription {
            root: self.root.clone(),
            path: self.path.clone(),
            id,
        }
    }
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model").field("path", &self.path).finish()
    }
}

/// Registered listener. Stays active until [`unsubscribe`](Self::unsubscribe).
#[must_use = "keep the subscription to be able to unsubscribe"]
pub struct Subscription {
    root: RootModel,
    path: String,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {
        self.root.unsubscribe(&self.path, self.id);
    }
}
