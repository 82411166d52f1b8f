//! Compiled stickiness rule templates
//!
//! A rule is a template rendered against the request; the first rule in a
//! policy producing non-empty text becomes the pinning token. Templates
//! compile once at policy construction, so a malformed rule surfaces as a
//! configuration error rather than per request. Placeholders:
//!
//! - `{method}`, `{path}`, `{host}`, `{client_ip}`
//! - `{header:Name}`, `{cookie:name}`, `{query:name}`
//! - `{{` and `}}` for literal braces
//!
//! Absent fields render as the empty string, so a rule keyed on a missing
//! header simply produces no token.

use tiller_common::errors::{TillerError, TillerResult};

use crate::request::ForwardRequest;

#[derive(Debug, Clone)]
enum Segment {
    Literal(String),
    Field(Field),
}

#[derive(Debug, Clone)]
enum Field {
    Method,
    Path,
    Host,
    ClientIp,
    Header(String),
    Cookie(String),
    Query(String),
}

/// One compiled rule template
#[derive(Debug, Clone)]
pub struct RuleTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl RuleTemplate {
    /// Compile a template. Malformed placeholders are configuration errors.
    pub fn compile(source: &str) -> TillerResult<Self> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = source.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    literal.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    literal.push('}');
                }
                '{' => {
                    let mut placeholder = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some(c) => placeholder.push(c),
                            None => {
                                return Err(TillerError::config(format!(
                                    "unterminated placeholder in rule '{}'",
                                    source
                                )))
                            }
                        }
                    }
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Field(parse_field(&placeholder, source)?));
                }
                '}' => {
                    return Err(TillerError::config(format!(
                        "unmatched '}}' in rule '{}'",
                        source
                    )))
                }
                c => literal.push(c),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    /// Original template text, for log lines
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Render against a request. Errors only for fields that exist but
    /// cannot be read (non-UTF-8 header bytes); absent fields render empty.
    pub fn render(&self, req: &ForwardRequest) -> TillerResult<String> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Field(field) => out.push_str(&render_field(field, req)?),
            }
        }
        Ok(out)
    }
}

fn parse_field(placeholder: &str, source: &str) -> TillerResult<Field> {
    let (kind, arg) = match placeholder.split_once(':') {
        Some((kind, arg)) => (kind.trim(), Some(arg.trim())),
        None => (placeholder.trim(), None),
    };

    match (kind, arg) {
        ("method", None) => Ok(Field::Method),
        ("path", None) => Ok(Field::Path),
        ("host", None) => Ok(Field::Host),
        ("client_ip", None) => Ok(Field::ClientIp),
        ("header", Some(name)) if !name.is_empty() => Ok(Field::Header(name.to_string())),
        ("cookie", Some(name)) if !name.is_empty() => Ok(Field::Cookie(name.to_string())),
        ("query", Some(name)) if !name.is_empty() => Ok(Field::Query(name.to_string())),
        _ => Err(TillerError::config(format!(
            "unknown placeholder '{{{}}}' in rule '{}'",
            placeholder, source
        ))),
    }
}

fn render_field(field: &Field, req: &ForwardRequest) -> TillerResult<String> {
    match field {
        Field::Method => Ok(req.method.as_str().to_string()),
        Field::Path => Ok(req.uri.path().to_string()),
        Field::Host => match req.headers.get(http::header::HOST) {
            Some(value) => value
                .to_str()
                .map(str::to_string)
                .map_err(|_| TillerError::Internal {
                    message: "host header contains non-UTF-8 bytes".to_string(),
                }),
            None => Ok(req.uri.host().unwrap_or("").to_string()),
        },
        Field::ClientIp => Ok(req.forwarded_client_ip().unwrap_or_default()),
        Field::Header(name) => match req.headers.get(name) {
            Some(value) => value
                .to_str()
                .map(str::to_string)
                .map_err(|_| TillerError::Internal {
                    message: format!("header '{}' contains non-UTF-8 bytes", name),
                }),
            None => Ok(String::new()),
        },
        Field::Cookie(name) => Ok(req.cookie(name).unwrap_or_default()),
        Field::Query(name) => Ok(query_param(req, name).unwrap_or_default()),
    }
}

fn query_param(req: &ForwardRequest, name: &str) -> Option<String> {
    req.uri.query()?.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        if key == name {
            Some(value.to_string())
        } else {
            None
        }
    })
}
