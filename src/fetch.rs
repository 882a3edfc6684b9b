//! Schema fetch loop.
//!
//! A [`Context`] owns the generator and drives retrieval of missing schemas
//! through a [`Transport`]. Waiters registered with
//! [`Context::when_schemas_fetched`] or [`Context::on_schemas_fetched`] are
//! released, in registration order, once nothing is missing any more.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use serde_json::Value;
use tokio::sync::oneshot;

use crate::compiler::{Generator, Validators};
use crate::error::{CompileError, TransportError};
use crate::keywords::FormatFn;
use crate::store::SchemaStore;
use crate::transport::{FetchRequest, Transport};
use crate::types::GeneratorOptions;
use crate::uri;

type FetchResult = Result<Value, Arc<TransportError>>;
type SharedFetch = Shared<BoxFuture<'static, FetchResult>>;

enum Waiter {
    Notify(oneshot::Sender<()>),
    Callback(Box<dyn FnOnce() + Send>),
}

impl Waiter {
    fn release(self) {
        match self {
            Waiter::Notify(tx) => {
                let _ = tx.send(());
            }
            Waiter::Callback(callback) => callback(),
        }
    }
}

struct State {
    generator: Generator,
    validators: Validators,
    formats: HashMap<String, Arc<FormatFn>>,
    fetch_errors: HashMap<String, Arc<TransportError>>,
    in_flight: HashMap<String, SharedFetch>,
    waiters: VecDeque<Waiter>,
    driving: bool,
}

impl State {
    fn recompile(&mut self) -> Result<(), CompileError> {
        let result = self.generator.compile();
        self.validators = self.generator.validators();
        result.map(|_| ())
    }
}

struct Inner {
    state: Mutex<State>,
    transport: Arc<dyn Transport>,
    parent: Option<Arc<SchemaStore>>,
    options: GeneratorOptions,
}

/// Schema compilation and retrieval state shared by models.
///
/// Cloning is cheap; clones share the same state.
#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

impl Context {
    pub fn new(transport: Arc<dyn Transport>, options: GeneratorOptions) -> Self {
        Self::build(transport, None, options)
    }

    /// A context whose store is layered over `parent`.
    pub fn layered(
        transport: Arc<dyn Transport>,
        parent: Arc<SchemaStore>,
        options: GeneratorOptions,
    ) -> Self {
        Self::build(transport, Some(parent), options)
    }

    fn build(
        transport: Arc<dyn Transport>,
        parent: Option<Arc<SchemaStore>>,
        options: GeneratorOptions,
    ) -> Self {
        let generator = Self::fresh_generator(parent.as_ref(), &options);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    validators: generator.validators(),
                    generator,
                    formats: HashMap::new(),
                    fetch_errors: HashMap::new(),
                    in_flight: HashMap::new(),
                    waiters: VecDeque::new(),
                    driving: false,
                }),
                transport,
                parent,
                options,
            }),
        }
    }

    fn fresh_generator(parent: Option<&Arc<SchemaStore>>, options: &GeneratorOptions) -> Generator {
        let store = match parent {
            Some(parent) => SchemaStore::layered(Arc::clone(parent)),
            None => SchemaStore::new(),
        };
        Generator::with_store(store, options.clone())
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.inner.transport)
    }

    pub fn options(&self) -> &GeneratorOptions {
        &self.inner.options
    }

    /// Register a root schema and compile whatever is available.
    ///
    /// # Errors
    ///
    /// Propagates `CompileError` from the generator.
    pub fn add_schema(
        &self,
        uri: &str,
        document: Option<Value>,
        name: Option<&str>,
    ) -> Result<(), CompileError> {
        let mut state = self.lock();
        state.generator.add_schema(uri, document, name)?;
        state.recompile()
    }

    /// Register a `format` checker, kept across [`clean`](Self::clean).
    pub fn register_format<F>(&self, name: &str, check: F)
    where
        F: Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
    {
        let check: Arc<FormatFn> = Arc::new(check);
        let mut state = self.lock();
        let registered = Arc::clone(&check);
        state
            .generator
            .register_format(name, move |value| registered(value));
        state.formats.insert(name.to_string(), check);
    }

    /// Base URIs still missing.
    pub fn missing(&self) -> Vec<String> {
        self.lock().generator.missing()
    }

    /// Latest compiled snapshot.
    pub fn validators(&self) -> Validators {
        self.lock().validators.clone()
    }

    /// Error recorded when fetching the schema at `uri`'s base failed.
    pub fn fetch_error(&self, uri: &str) -> Option<Arc<TransportError>> {
        self.lock().fetch_errors.get(uri::base(uri)).cloned()
    }

    /// Discard compiled units, stored documents and fetch state.
    ///
    /// Registered formats and queued waiters are kept.
    pub fn clean(&self) {
        let mut state = self.lock();
        let mut generator = Self::fresh_generator(self.inner.parent.as_ref(), &self.inner.options);
        for (name, check) in &state.formats {
            let check = Arc::clone(check);
            generator.register_format(name, move |value| check(value));
        }
        state.validators = generator.validators();
        state.generator = generator;
        state.fetch_errors.clear();
        state.in_flight.clear();
        tracing::debug!("context cleaned");
    }

    /// Resolves once no schema is missing.
    ///
    /// The waiter is queued when this is called, not when the future is first
    /// polled. Must be called within a Tokio runtime.
    pub fn when_schemas_fetched(&self) -> impl Future<Output = ()> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        self.enqueue(Waiter::Notify(tx));
        async move {
            let _ = rx.await;
        }
    }

    /// Run `callback` once no schema is missing.
    pub fn on_schemas_fetched<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.enqueue(Waiter::Callback(Box::new(callback)));
    }

    fn enqueue(&self, waiter: Waiter) {
        let mut state = self.lock();
        state.waiters.push_back(waiter);
        if state.driving {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                state.driving = true;
                drop(state);
                let ctx = self.clone();
                handle.spawn(async move { ctx.drive().await });
            }
            Err(_) => tracing::warn!("no Tokio runtime, schema fetch loop not started"),
        }
    }

    /// Fetch one schema document, sharing any request already in flight.
    pub async fn fetch_schema(&self, url: &str) -> Result<Value, Arc<TransportError>> {
        let base = uri::base(url).to_string();
        let shared = {
            let mut state = self.lock();
            match state.in_flight.get(&base) {
                Some(shared) => shared.clone(),
                None => {
                    let transport = Arc::clone(&self.inner.transport);
                    let target = base.clone();
                    let shared = async move {
                        tracing::debug!(url = %target, "fetching schema");
                        transport
                            .fetch(FetchRequest::get(&target))
                            .await
                            .and_then(|response| response.into_json(&target))
                            .map_err(Arc::new)
                    }
                    .boxed()
                    .shared();
                    state.in_flight.insert(base.clone(), shared.clone());
                    shared
                }
            }
        };
        let result = shared.await;
        self.lock().in_flight.remove(&base);
        result
    }

    async fn drive(self) {
        // let registrations made in the same tick land first
        tokio::task::yield_now().await;

        let mut attempted = HashSet::new();
        loop {
            let pending: Vec<String> = {
                let mut state = self.lock();
                let pending: Vec<String> = state
                    .generator
                    .missing()
                    .into_iter()
                    .filter(|base| !attempted.contains(base))
                    .collect();
                if pending.is_empty() {
                    state.driving = false;
                    let waiters: Vec<Waiter> = state.waiters.drain(..).collect();
                    drop(state);
                    tracing::debug!(waiters = waiters.len(), "schemas fetched");
                    for waiter in waiters {
                        waiter.release();
                    }
                    return;
                }
                pending
            };

            let ctx = &self;
            let results = join_all(pending.iter().map(|base| async move {
                (base.clone(), ctx.fetch_schema(base).await)
            }))
            .await;

            let mut state = self.lock();
            for (base, result) in results {
                attempted.insert(base.clone());
                let document = match result {
                    Ok(document) => {
                        state.fetch_errors.remove(&base);
                        document
                    }
                    // left missing so a later round retries it
                    Err(err) if err.is_transient() => {
                        tracing::warn!(url = %base, error = %err, "schema fetch failed, will retry");
                        state.fetch_errors.insert(base.clone(), err);
                        continue;
                    }
                    Err(err) => {
                        tracing::warn!(url = %base, error = %err, "schema fetch failed");
                        state.fetch_errors.insert(base.clone(), err);
                        Value::Null
                    }
                };
                if let Err(err) = state.generator.add_schema(&base, Some(document), None) {
                    tracing::warn!(url = %base, error = %err, "fetched schema rejected");
                }
            }
            if let Err(err) = state.recompile() {
                tracing::warn!(error = %err, "schema failed to compile");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{FetchResponse, MemoryTransport};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn context(transport: MemoryTransport) -> (Context, Arc<MemoryTransport>) {
        let transport = Arc::new(transport);
        let ctx = Context::new(transport.clone(), GeneratorOptions::tracking());
        (ctx, transport)
    }

    #[tokio::test]
    async fn fetches_missing_schemas_transitively() {
        let (ctx, transport) = context(
            MemoryTransport::new()
                .with("http://x/a", json!({"properties": {"b": {"$ref": "b"}}}))
                .with("http://x/b", json!({"type": "string"})),
        );
        ctx.add_schema("http://x/a", None, None).unwrap();
        assert_eq!(ctx.missing(), vec!["http://x/a"]);

        ctx.when_schemas_fetched().await;
        assert!(ctx.missing().is_empty());
        assert_eq!(transport.requests(), vec!["http://x/a", "http://x/b"]);

        let result = ctx.validators().validate("http://x/a", &json!({"b": 1}));
        assert!(!result.valid);
    }

    #[tokio::test]
    async fn failed_fetch_records_error_and_accepts() {
        let (ctx, _) = context(MemoryTransport::new().with("s", json!({"$ref": "gone"})));
        ctx.add_schema("s", None, None).unwrap();
        ctx.when_schemas_fetched().await;

        assert!(ctx.missing().is_empty());
        let err = ctx.fetch_error("gone#/x").unwrap();
        assert!(matches!(*err, TransportError::NotFound { .. }));
        assert!(ctx.validators().validate("s", &json!(42)).valid);
    }

    #[tokio::test]
    async fn transient_failure_stays_missing_and_retries() {
        let (ctx, transport) = context(MemoryTransport::new().with("s", json!({"$ref": "flaky"})));
        transport.insert_response("flaky", FetchResponse::text("busy").with_status(503));
        ctx.add_schema("s", None, None).unwrap();
        ctx.when_schemas_fetched().await;

        assert_eq!(ctx.missing(), vec!["flaky"]);
        assert!(ctx.fetch_error("flaky").unwrap().is_transient());
        assert!(ctx.validators().validate("s", &json!(42)).valid);

        transport.insert("flaky", json!({"type": "string"}));
        ctx.when_schemas_fetched().await;
        assert!(ctx.missing().is_empty());
        assert!(ctx.fetch_error("flaky").is_none());
        assert!(!ctx.validators().validate("s", &json!(42)).valid);
    }

    #[tokio::test]
    async fn waiters_release_in_order() {
        let (ctx, _) = context(MemoryTransport::new().with("s", json!({})));
        ctx.add_schema("s", None, None).unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        for idx in 0..3 {
            let order = Arc::clone(&order);
            ctx.on_schemas_fetched(move || order.lock().unwrap().push(idx));
        }
        ctx.when_schemas_fetched().await;
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn nothing_missing_still_releases() {
        let (ctx, transport) = context(MemoryTransport::new());
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        ctx.on_schemas_fetched(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        ctx.when_schemas_fetched().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(transport.requests().is_empty());
    }

    /// Answers after a short delay so requests overlap.
    struct SlowTransport(MemoryTransport);

    #[async_trait::async_trait]
    impl Transport for SlowTransport {
        async fn fetch(
            &self,
            request: FetchRequest,
        ) -> Result<crate::transport::FetchResponse, TransportError> {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            self.0.fetch(request).await
        }
    }

    #[tokio::test]
    async fn concurrent_fetches_share_one_request() {
        let transport = Arc::new(SlowTransport(
            MemoryTransport::new().with("http://x/a", json!({})),
        ));
        let ctx = Context::new(transport.clone(), GeneratorOptions::default());
        let (a, b) = tokio::join!(ctx.fetch_schema("http://x/a"), ctx.fetch_schema("http://x/a#/y"));
        assert_eq!(a.unwrap(), json!({}));
        assert_eq!(b.unwrap(), json!({}));
        assert_eq!(transport.0.requests(), vec!["http://x/a"]);
    }

    #[tokio::test]
    async fn clean_discards_state_but_keeps_formats() {
        let (ctx, _) = context(MemoryTransport::new());
        ctx.register_format("never", |_| Err("no".to_string()));
        ctx.add_schema("s", Some(json!({"format": "never"})), None).unwrap();
        assert!(!ctx.validators().validate("s", &json!(1)).valid);

        ctx.clean();
        assert!(ctx.validators().is_empty());
        ctx.add_schema("s", Some(json!({"format": "never"})), None).unwrap();
        assert!(!ctx.validators().validate("s", &json!(1)).valid);
    }
}
