//! RFC 6570 URI Template expansion.
//!
//! Templates are parsed once into literal and expression parts; variable types
//! are only inspected at expansion time since hyper-schema link templates are
//! filled from arbitrary instance data.
//!
//! Two hyper-schema extensions are supported in variable names:
//! - `{$}` expands the current value itself;
//! - `{(name)}` uses the percent-decoded text between the parentheses as a
//!   literal property key, so `{()}` addresses the empty-string key.

use serde_json::Value;

/// Source of template variables.
pub trait TemplateSubject {
    /// Value of a named variable.
    fn variable(&self, name: &str) -> Option<Value>;

    /// The subject itself, used for `{$}`.
    fn current(&self) -> Option<Value> {
        None
    }
}

impl TemplateSubject for Value {
    fn variable(&self, name: &str) -> Option<Value> {
        match self {
            Value::Object(map) => map.get(name).cloned(),
            _ => None,
        }
    }

    fn current(&self) -> Option<Value> {
        Some(self.clone())
    }
}

impl<F> TemplateSubject for F
where
    F: Fn(&str) -> Option<Value>,
{
    fn variable(&self, name: &str) -> Option<Value> {
        self(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    Simple,
    Reserved,
    Fragment,
    Label,
    Path,
    PathParam,
    Query,
    QueryContinuation,
}

impl Operator {
    fn from_char(c: char) -> Option<Self> {
        match c {
            '+' => Some(Operator::Reserved),
            '#' => Some(Operator::Fragment),
            '.' => Some(Operator::Label),
            '/' => Some(Operator::Path),
            ';' => Some(Operator::PathParam),
            '?' => Some(Operator::Query),
            '&' => Some(Operator::QueryContinuation),
            _ => None,
        }
    }

    fn first(self) -> &'static str {
        match self {
            Operator::Simple | Operator::Reserved => "",
            Operator::Fragment => "#",
            Operator::Label => ".",
            Operator::Path => "/",
            Operator::PathParam => ";",
            Operator::Query => "?",
            Operator::QueryContinuation => "&",
        }
    }

    fn separator(self) -> &'static str {
        match self {
            Operator::Simple | Operator::Reserved | Operator::Fragment => ",",
            Operator::Label => ".",
            Operator::Path => "/",
            Operator::PathParam => ";",
            Operator::Query | Operator::QueryContinuation => "&",
        }
    }

    fn named(self) -> bool {
        matches!(
            self,
            Operator::PathParam | Operator::Query | Operator::QueryContinuation
        )
    }

    /// Text after `name` when the value is empty.
    fn if_empty(self) -> &'static str {
        match self {
            Operator::Query | Operator::QueryContinuation => "=",
            _ => "",
        }
    }

    fn allow_reserved(self) -> bool {
        matches!(self, Operator::Reserved | Operator::Fragment)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum VarName {
    This,
    Key(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct VarSpec {
    name: VarName,
    /// Name as written, used for `name=value` output.
    label: String,
    prefix: Option<usize>,
    explode: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Literal(String),
    Expression {
        operator: Operator,
        vars: Vec<VarSpec>,
    },
}

/// A parsed URI Template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UriTemplate {
    source: String,
    parts: Vec<Part>,
}

impl UriTemplate {
    /// Parse a template. Unterminated expressions are kept as literal text.
    pub fn parse(source: &str) -> Self {
        let mut parts = Vec::new();
        let mut rest = source;
        while let Some(open) = rest.find('{') {
            let Some(close) = rest[open..].find('}').map(|c| c + open) else {
                break;
            };
            if open > 0 {
                parts.push(Part::Literal(rest[..open].to_string()));
            }
            parts.push(parse_expression(&rest[open + 1..close]));
            rest = &rest[close + 1..];
        }
        if !rest.is_empty() {
            parts.push(Part::Literal(rest.to_string()));
        }
        Self {
            source: source.to_string(),
            parts,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Expand against `subject`.
    pub fn expand<S: TemplateSubject + ?Sized>(&self, subject: &S) -> String {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                Part::Literal(text) => out.push_str(&encode(text, true)),
                Part::Expression { operator, vars } => {
                    expand_expression(&mut out, *operator, vars, subject)
                }
            }
        }
        out
    }
}

/// Parse and expand in one step.
pub fn expand<S: TemplateSubject + ?Sized>(template: &str, subject: &S) -> String {
    UriTemplate::parse(template).expand(subject)
}

fn parse_expression(body: &str) -> Part {
    let mut chars = body.chars();
    let (operator, list) = match chars.next().and_then(Operator::from_char) {
        Some(op) => (op, &body[1..]),
        None => (Operator::Simple, body),
    };
    let vars = split_varspecs(list).into_iter().map(parse_varspec).collect();
    Part::Expression { operator, vars }
}

/// Split on commas that are not inside a parenthesised name.
fn split_varspecs(list: &str) -> Vec<&str> {
    let mut specs = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (idx, c) in list.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                specs.push(&list[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    specs.push(&list[start..]);
    specs
}

fn parse_varspec(spec: &str) -> VarSpec {
    let (label, modifiers) = if spec.starts_with('(') {
        match spec.find(')') {
            Some(end) => (&spec[..=end], &spec[end + 1..]),
            None => (spec, ""),
        }
    } else {
        match spec.find([':', '*']) {
            Some(idx) => (&spec[..idx], &spec[idx..]),
            None => (spec, ""),
        }
    };

    let name = if label == "$" {
        VarName::This
    } else if let Some(inner) = label.strip_prefix('(').and_then(|l| l.strip_suffix(')')) {
        VarName::Key(percent_decode(inner))
    } else {
        VarName::Key(percent_decode(label))
    };

    let explode = modifiers == "*";
    let prefix = modifiers
        .strip_prefix(':')
        .and_then(|n| n.parse::<usize>().ok());

    VarSpec {
        name,
        label: label.to_string(),
        prefix,
        explode,
    }
}

fn is_defined(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
        _ => true,
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn expand_expression<S: TemplateSubject + ?Sized>(
    out: &mut String,
    op: Operator,
    vars: &[VarSpec],
    subject: &S,
) {
    let reserved = op.allow_reserved();
    let mut first = true;
    for var in vars {
        let value = match &var.name {
            VarName::This => subject.current(),
            VarName::Key(key) => subject.variable(key),
        };
        let Some(value) = value.filter(is_defined) else {
            continue;
        };

        out.push_str(if first { op.first() } else { op.separator() });
        first = false;
        let name = encode(&var.label, true);

        match &value {
            Value::Array(items) => {
                let texts: Vec<String> = items.iter().map(|v| encode(&scalar_text(v), reserved)).collect();
                if var.explode {
                    let joined: Vec<String> = if op.named() {
                        texts
                            .iter()
                            .map(|t| named_pair(&name, t, op))
                            .collect()
                    } else {
                        texts
                    };
                    out.push_str(&joined.join(op.separator()));
                } else {
                    if op.named() {
                        out.push_str(&name);
                        out.push('=');
                    }
                    out.push_str(&texts.join(","));
                }
            }
            Value::Object(map) => {
                if var.explode {
                    let pairs: Vec<String> = map
                        .iter()
                        .map(|(k, v)| {
                            let key = encode(k, reserved);
                            let text = encode(&scalar_text(v), reserved);
                            if op.named() {
                                named_pair(&key, &text, op)
                            } else {
                                format!("{}={}", key, text)
                            }
                        })
                        .collect();
                    out.push_str(&pairs.join(op.separator()));
                } else {
                    if op.named() {
                        out.push_str(&name);
                        out.push('=');
                    }
                    let pairs: Vec<String> = map
                        .iter()
                        .map(|(k, v)| format!("{},{}", encode(k, reserved), encode(&scalar_text(v), reserved)))
                        .collect();
                    out.push_str(&pairs.join(","));
                }
            }
            scalar => {
                let mut text = scalar_text(scalar);
                if let Some(max) = var.prefix {
                    text = text.chars().take(max).collect();
                }
                let text = encode(&text, reserved);
                if op.named() {
                    out.push_str(&named_pair(&name, &text, op));
                } else {
                    out.push_str(&text);
                }
            }
        }
    }
}

fn named_pair(name: &str, text: &str, op: Operator) -> String {
    if text.is_empty() {
        format!("{}{}", name, op.if_empty())
    } else {
        format!("{}={}", name, text)
    }
}

fn is_unreserved(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~')
}

fn is_reserved(b: u8) -> bool {
    matches!(
        b,
        b':' | b'/' | b'?' | b'#' | b'[' | b']' | b'@' | b'!' | b'$' | b'&' | b'\''
            | b'(' | b')' | b'*' | b'+' | b',' | b';' | b'='
    )
}

/// Percent-encode `text`; with `allow_reserved`, reserved characters and
/// existing `%XX` triplets pass through.
fn encode(text: &str, allow_reserved: bool) -> String {
    let bytes = text.as_bytes();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if is_unreserved(b) || (allow_reserved && is_reserved(b)) {
            out.push(b as char);
        } else if allow_reserved
            && b == b'%'
            && i + 2 < bytes.len()
            && bytes[i + 1].is_ascii_hexdigit()
            && bytes[i + 2].is_ascii_hexdigit()
        {
            out.push_str(&text[i..i + 3]);
            i += 3;
            continue;
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
        i += 1;
    }
    out
}

fn hex_value(digit: u8) -> u8 {
    match digit {
        b'0'..=b'9' => digit - b'0',
        b'a'..=b'f' => digit - b'a' + 10,
        _ => digit - b'A' + 10,
    }
}

fn percent_decode(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%'
            && i + 2 < bytes.len()
            && bytes[i + 1].is_ascii_hexdigit()
            && bytes[i + 2].is_ascii_hexdigit()
        {
            out.push(hex_value(bytes[i + 1]) << 4 | hex_value(bytes[i + 2]));
            i += 3;
            continue;
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars() -> Value {
        json!({
            "var": "value",
            "hello": "Hello World!",
            "path": "/foo/bar",
            "empty": "",
            "list": ["red", "green", "blue"],
            "keys": {"semi": ";", "dot": ".", "comma": ","},
            "x": "1024",
            "y": "768",
            "id": "5",
            "q": "chicken",
            "lang": "fr"
        })
    }

    #[test]
    fn path_and_query_operators() {
        assert_eq!(expand("{/id}", &vars()), "/5");
        assert_eq!(expand("{?q,lang}", &vars()), "?q=chicken&lang=fr");
        assert_eq!(expand("/items{?q}{&lang}", &vars()), "/items?q=chicken&lang=fr");
    }

    #[test]
    fn simple_and_reserved() {
        let v = vars();
        assert_eq!(expand("{var}", &v), "value");
        assert_eq!(expand("{hello}", &v), "Hello%20World%21");
        assert_eq!(expand("{+hello}", &v), "Hello%20World!");
        assert_eq!(expand("{+path}/here", &v), "/foo/bar/here");
        assert_eq!(expand("{#path}", &v), "#/foo/bar");
        assert_eq!(expand("{x,y}", &v), "1024,768");
    }

    #[test]
    fn prefix_and_explode() {
        let v = vars();
        assert_eq!(expand("{var:3}", &v), "val");
        assert_eq!(expand("{list}", &v), "red,green,blue");
        assert_eq!(expand("{list*}", &v), "red,green,blue");
        assert_eq!(expand("{/list*}", &v), "/red/green/blue");
        assert_eq!(expand("{?list*}", &v), "?list=red&list=green&list=blue");
        assert_eq!(expand("{keys}", &v), "semi,%3B,dot,.,comma,%2C");
        assert_eq!(expand("{keys*}", &v), "semi=%3B,dot=.,comma=%2C");
        assert_eq!(expand("{?keys*}", &v), "?semi=%3B&dot=.&comma=%2C");
        assert_eq!(expand("{.list}", &v), ".red,green,blue");
    }

    #[test]
    fn empty_and_undefined() {
        let v = vars();
        assert_eq!(expand("{;x,y,empty}", &v), ";x=1024;y=768;empty");
        assert_eq!(expand("{?x,y,empty}", &v), "?x=1024&y=768&empty=");
        assert_eq!(expand("{?undef}", &v), "");
        assert_eq!(expand("X{.empty}", &v), "X.");
    }

    #[test]
    fn hyper_schema_placeholders() {
        assert_eq!(expand("/things/{$}", &json!("a b")), "/things/a%20b");
        assert_eq!(expand("/things/{()}", &json!({"": "blank"})), "/things/blank");
        assert_eq!(expand("{(a%2Cb)}", &json!({"a,b": "x"})), "x");
        assert_eq!(expand("/n/{$}", &json!(42)), "/n/42");
    }

    #[test]
    fn stray_percent_before_multibyte_char() {
        assert_eq!(expand("/x/{%a\u{e9}}", &json!({"a": 1})), "/x/");
        assert_eq!(expand("/x/{(%\u{e9})}", &json!({"%\u{e9}": "v"})), "/x/v");
        assert_eq!(expand("{(%4)}", &json!({"%4": "tail"})), "tail");
    }

    #[test]
    fn types_are_checked_at_expansion_time() {
        let template = UriTemplate::parse("{?v}");
        assert_eq!(template.expand(&json!({"v": "s"})), "?v=s");
        assert_eq!(template.expand(&json!({"v": [1, 2]})), "?v=1,2");
        assert_eq!(template.expand(&json!({"v": {"a": 1}})), "?v=a,1");
        assert_eq!(template.expand(&json!({"v": true})), "?v=true");
    }

    #[test]
    fn closure_subjects() {
        let lookup = |name: &str| (name == "id").then(|| json!("7"));
        assert_eq!(expand("/a/{id}{/other}", &lookup), "/a/7");
    }

    #[test]
    fn unterminated_expression_is_literal() {
        assert_eq!(expand("/a/{id", &vars()), "/a/%7Bid");
    }
}
