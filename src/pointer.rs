//! JSON Pointer (RFC 6901) helpers.

use serde_json::Value;

/// Escape one reference token (`~` → `~0`, `/` → `~1`).
pub fn escape(segment: &str) -> String {
    segment.replace('~', "~0").replace('/', "~1")
}

/// Reverse of [`escape`].
pub fn unescape(segment: &str) -> String {
    segment.replace("~1", "/").replace("~0", "~")
}

/// Split a pointer into unescaped tokens. `""` is the root and has none.
pub fn split(pointer: &str) -> Vec<String> {
    if pointer.is_empty() {
        return Vec::new();
    }
    pointer
        .strip_prefix('/')
        .unwrap_or(pointer)
        .split('/')
        .map(unescape)
        .collect()
}

/// Build a pointer from unescaped tokens.
pub fn join<I, S>(segments: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    segments
        .into_iter()
        .map(|s| format!("/{}", escape(s.as_ref())))
        .collect()
}

/// Append one unescaped token to a pointer.
pub fn child(pointer: &str, segment: &str) -> String {
    format!("{}/{}", pointer, escape(segment))
}

/// Parent pointer, or `None` for the root.
pub fn parent(pointer: &str) -> Option<&str> {
    pointer.rfind('/').map(|idx| &pointer[..idx])
}

/// Whether `pointer` is `ancestor` itself or lies below it.
pub fn is_within(pointer: &str, ancestor: &str) -> bool {
    pointer == ancestor || is_below(pointer, ancestor)
}

/// Whether `pointer` lies strictly below `ancestor`.
pub fn is_below(pointer: &str, ancestor: &str) -> bool {
    pointer.len() > ancestor.len()
        && pointer.starts_with(ancestor)
        && pointer.as_bytes()[ancestor.len()] == b'/'
}

/// Pointer of `pointer` relative to `ancestor` (`"/a/b"` under `"/a"` is `"/b"`).
pub fn relative<'a>(pointer: &'a str, ancestor: &str) -> Option<&'a str> {
    if is_within(pointer, ancestor) {
        Some(&pointer[ancestor.len()..])
    } else {
        None
    }
}

fn array_index(token: &str, len: usize) -> Option<usize> {
    if token == "-" {
        return Some(len);
    }
    if token.len() > 1 && token.starts_with('0') {
        return None;
    }
    token.parse().ok()
}

/// Resolve a pointer against a value.
pub fn get<'a>(value: &'a Value, pointer: &str) -> Option<&'a Value> {
    let mut current = value;
    for token in split(pointer) {
        current = match current {
            Value::Object(map) => map.get(&token)?,
            Value::Array(items) => items.get(array_index(&token, items.len())?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Write `new_value` at `pointer`.
///
/// The parent container must already exist. Object members are inserted or
/// replaced; array positions may be replaced, or appended with `-` or an
/// index equal to the length. Returns `false` when nothing was written.
pub fn set(value: &mut Value, pointer: &str, new_value: Value) -> bool {
    let mut tokens = split(pointer);
    let Some(last) = tokens.pop() else {
        *value = new_value;
        return true;
    };

    let mut current = value;
    for token in &tokens {
        current = match current {
            Value::Object(map) => match map.get_mut(token) {
                Some(next) => next,
                None => return false,
            },
            Value::Array(items) => {
                let len = items.len();
                match array_index(token, len).and_then(|idx| items.get_mut(idx)) {
                    Some(next) => next,
                    None => return false,
                }
            }
            _ => return false,
        };
    }

    match current {
        Value::Object(map) => {
            map.insert(last, new_value);
            true
        }
        Value::Array(items) => match array_index(&last, items.len()) {
            Some(idx) if idx < items.len() => {
                items[idx] = new_value;
                true
            }
            Some(idx) if idx == items.len() => {
                items.push(new_value);
                true
            }
            _ => false,
        },
        _ => false,
    }
}
