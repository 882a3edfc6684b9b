//! Schema URI handling.
//!
//! Schema URIs are plain strings. Absolute URIs are resolved with the `url`
//! crate; scheme-less references such as `/schemas/bar` or `item.json` are
//! resolved path-relatively so that stores can be keyed without a host.

use url::Url;

use crate::pointer;

/// Host used to borrow `url`'s path resolution for scheme-less URIs.
const PLACEHOLDER: &str = "http://relative.invalid";

/// Canonical form: a trailing empty fragment is removed.
pub fn normalize(uri: &str) -> String {
    uri.strip_suffix('#').unwrap_or(uri).to_string()
}

/// Split into (base, fragment). The fragment excludes `#` and may be empty.
pub fn split(uri: &str) -> (&str, &str) {
    match uri.find('#') {
        Some(idx) => (&uri[..idx], &uri[idx + 1..]),
        None => (uri, ""),
    }
}

/// The URI without its fragment.
pub fn base(uri: &str) -> &str {
    split(uri).0
}

/// Schema URI of a subschema at `segments` below `uri`.
///
/// `child("x", ["properties", "a"])` is `x#/properties/a`; a URI that already
/// carries a pointer fragment is extended.
pub fn child<I, S>(uri: &str, segments: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let suffix = pointer::join(segments);
    if uri.contains('#') {
        format!("{}{}", uri, suffix)
    } else {
        format!("{}#{}", uri, suffix)
    }
}

/// Whether `candidate` names `scope` itself or a location beneath it.
pub fn is_within(candidate: &str, scope: &str) -> bool {
    let scope = base(scope);
    match candidate.strip_prefix(scope) {
        Some(rest) => rest.is_empty() || scope.ends_with('/') || rest.starts_with(['/', '#']),
        None => false,
    }
}

/// Resolve `reference` against `base_uri` (RFC 3986), returning canonical form.
pub fn resolve(base_uri: &str, reference: &str) -> String {
    if reference.is_empty() {
        return base(base_uri).to_string();
    }
    if reference.starts_with('#') {
        return normalize(&format!("{}{}", base(base_uri), reference));
    }
    if Url::parse(reference).is_ok() {
        return normalize(reference);
    }
    if let Ok(absolute) = Url::parse(base_uri) {
        return match absolute.join(reference) {
            Ok(joined) => normalize(joined.as_str()),
            Err(_) => normalize(reference),
        };
    }

    let rooted = base_uri.starts_with('/');
    let scaffold = if rooted {
        format!("{}{}", PLACEHOLDER, base_uri)
    } else {
        format!("{}/{}", PLACEHOLDER, base_uri)
    };
    let joined = match Url::parse(&scaffold).and_then(|b| b.join(reference)) {
        Ok(joined) => joined,
        Err(_) => return normalize(reference),
    };
    if joined.host_str() != Some("relative.invalid") {
        return normalize(joined.as_str());
    }
    let rest = &joined.as_str()[PLACEHOLDER.len()..];
    if rooted || reference.starts_with('/') {
        normalize(rest)
    } else {
        normalize(rest.strip_prefix('/').unwrap_or(rest))
    }
}
