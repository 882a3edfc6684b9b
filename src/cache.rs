//! Cache of open models.
//!
//! Models are keyed by `"METHOD url"`. Each entry expires after
//! [`ModelOptions::ttl`] without a [`ModelCache::poke`]; expiry only drops the
//! cache's reference, so holders of the model keep using it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::time::Instant;

use crate::error::ModelError;
use crate::fetch::Context;
use crate::model::RootModel;
use crate::transport::{FetchRequest, Headers};
use crate::types::ModelOptions;
use crate::uri;

struct CacheEntry {
    model: RootModel,
    expires: Instant,
}

struct CacheInner {
    context: Context,
    options: ModelOptions,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

/// Entry point for opening documents as models.
#[derive(Clone)]
pub struct ModelCache {
    inner: Arc<CacheInner>,
}

fn cache_key(url: &str) -> String {
    format!("GET {}", url)
}

impl ModelCache {
    pub fn new(context: Context, options: ModelOptions) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                context,
                options,
                entries: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.inner
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn context(&self) -> &Context {
        &self.inner.context
    }

    /// Fetch `url` and wrap it in a model, or return the cached one.
    ///
    /// Schemas named by a `Link: <...>; rel="describedby"` header or a
    /// `profile` parameter on `Content-Type` become the model's root schemas.
    /// A failed fetch still yields a model (with a `null` value) that reports
    /// `DOCUMENT_FETCH_ERROR` through its schema errors.
    ///
    /// # Errors
    ///
    /// Returns `ModelError::Compile` if a discovered schema fails to compile.
    pub async fn open(&self, url: &str) -> Result<RootModel, ModelError> {
        let key = cache_key(url);
        if let Some(model) = self.touch(&key) {
            return Ok(model);
        }

        let model = match self.fetch_document(url).await {
            Ok((value, schemas)) => {
                let model = RootModel::new(self.inner.context.clone(), value, Some(url));
                for schema in schemas {
                    model.add_schema(&schema, None)?;
                }
                model
            }
            Err(ModelError::Document { url: failed, source }) => {
                tracing::warn!(url = %failed, error = %source, "document fetch failed");
                let model = RootModel::new(self.inner.context.clone(), Value::Null, Some(url));
                model.set_document_error(source);
                model
            }
            Err(err) => return Err(err),
        };
        Ok(self.insert(key, model))
    }

    /// Wrap an existing value in a model with the given root schemas.
    ///
    /// With a `url` the model is cached as if it had been opened from there.
    ///
    /// # Errors
    ///
    /// Returns `ModelError::Compile` if a schema fails to compile.
    pub fn create(
        &self,
        url: Option<&str>,
        value: Value,
        schemas: &[&str],
    ) -> Result<RootModel, ModelError> {
        let model = RootModel::new(self.inner.context.clone(), value, url);
        for schema in schemas {
            let schema = match url {
                Some(base) => uri::resolve(base, schema),
                None => uri::normalize(schema),
            };
            model.add_schema(&schema, None)?;
        }
        Ok(match url {
            Some(url) => self.insert(cache_key(url), model),
            None => model,
        })
    }

    /// Cached model for `url`, without fetching or extending its lifetime.
    pub fn get(&self, url: &str) -> Option<RootModel> {
        self.lock().get(&cache_key(url)).map(|entry| entry.model.clone())
    }

    /// Restart the expiry timer of `url`'s model. Returns whether it was cached.
    pub fn poke(&self, url: &str) -> bool {
        self.touch(&cache_key(url)).is_some()
    }

    pub fn evict(&self, url: &str) -> Option<RootModel> {
        self.lock().remove(&cache_key(url)).map(|entry| entry.model)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn touch(&self, key: &str) -> Option<RootModel> {
        let mut entries = self.lock();
        let entry = entries.get_mut(key)?;
        entry.expires = Instant::now() + self.inner.options.ttl;
        Some(entry.model.clone())
    }

    /// Insert unless another task cached the same key first; returns the
    /// cached model either way.
    fn insert(&self, key: String, model: RootModel) -> RootModel {
        let mut entries = self.lock();
        if let Some(existing) = entries.get(&key) {
            return existing.model.clone();
        }
        entries.insert(
            key.clone(),
            CacheEntry {
                model: model.clone(),
                expires: Instant::now() + self.inner.options.ttl,
            },
        );
        drop(entries);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let cache = Arc::downgrade(&self.inner);
                handle.spawn(expire(cache, key));
            }
            Err(_) => tracing::warn!(key = %key, "no Tokio runtime, cached model will not expire"),
        }
        model
    }

    async fn fetch_document(&self, url: &str) -> Result<(Value, Vec<String>), ModelError> {
        let failed = |source| ModelError::Document {
            url: url.to_string(),
            source,
        };
        let request = FetchRequest::get(url).header("accept", "application/json");
        tracing::debug!(url = %url, "fetching document");
        let response = self
            .inner
            .context
            .transport()
            .fetch(request)
            .await
            .map_err(failed)?;
        let schemas = described_by(&response.headers, url);
        let value = response.into_json(url).map_err(failed)?;
        Ok((value, schemas))
    }
}

/// Drop `key` once its deadline passes without being pushed back.
async fn expire(cache: std::sync::Weak<CacheInner>, key: String) {
    loop {
        let deadline = {
            let Some(inner) = cache.upgrade() else { return };
            let entries = inner.entries.lock().unwrap_or_else(PoisonError::into_inner);
            match entries.get(&key) {
                Some(entry) => entry.expires,
                None => return,
            }
        };
        tokio::time::sleep_until(deadline).await;

        let Some(inner) = cache.upgrade() else { return };
        let mut entries = inner.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let expired = entries
            .get(&key)
            .map_or(true, |entry| entry.expires <= Instant::now());
        if expired {
            entries.remove(&key);
            tracing::debug!(key = %key, "evicted cached model");
            return;
        }
    }
}

/// Schema URIs advertised by response headers, resolved against `url`.
pub fn described_by(headers: &Headers, url: &str) -> Vec<String> {
    let mut schemas = Vec::new();
    for header in headers.get_all("link") {
        for link in split_outside_brackets(header) {
            let Some((target, params)) = parse_link(link) else {
                continue;
            };
            let is_described_by = params.iter().any(|(name, value)| {
                name.eq_ignore_ascii_case("rel")
                    && value
                        .split_whitespace()
                        .any(|rel| rel.eq_ignore_ascii_case("describedby"))
            });
            if is_described_by {
                schemas.push(uri::resolve(url, target));
            }
        }
    }
    if let Some(content_type) = headers.get("content-type") {
        for param in content_type.split(';').skip(1) {
            if let Some((name, value)) = param.split_once('=') {
                if name.trim().eq_ignore_ascii_case("profile") {
                    schemas.push(uri::resolve(url, value.trim().trim_matches('"')));
                }
            }
        }
    }
    let mut unique = Vec::new();
    for schema in schemas {
        if !unique.contains(&schema) {
            unique.push(schema);
        }
    }
    unique
}

/// Split a `Link` header value on commas that are not inside `<...>` or quotes.
fn split_outside_brackets(header: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let (mut start, mut in_target, mut in_quotes) = (0, false, false);
    for (idx, c) in header.char_indices() {
        match c {
            '<' if !in_quotes => in_target = true,
            '>' if !in_quotes => in_target = false,
            '"' if !in_target => in_quotes = !in_quotes,
            ',' if !in_target && !in_quotes => {
                parts.push(header[start..idx].trim());
                start = idx + 1;
            }
            _ => {}
        }
    }
    parts.push(header[start..].trim());
    parts.retain(|part| !part.is_empty());
    parts
}

/// `<target>; name="value"; ...` into the target and its parameters.
fn parse_link(link: &str) -> Option<(&str, Vec<(&str, &str)>)> {
    let rest = link.trim().strip_prefix('<')?;
    let close = rest.find('>')?;
    let target = &rest[..close];
    let params = rest[close + 1..]
        .split(';')
        .filter_map(|param| {
            let (name, value) = param.split_once('=')?;
            Some((name.trim(), value.trim().trim_matches('"')))
        })
        .collect();
    Some((target, params))
}
