//! Interpolation glue: `${! expression }` evaluation against a message
//!
//! Config strings may embed expressions that are evaluated per message at
//! use-site. The expression language proper is an external collaborator; the
//! engine only carries the small pure-function subset its own components
//! need:
//!
//! - `content()` - the raw payload as a string
//! - `json("a.b")` - a field of the payload parsed as a JSON document
//! - `meta("key")` - a metadata value
//! - `count("name")` - a process-wide named counter, starting at 1
//! - `uuid_v4()` - a fresh random identifier
//! - `timestamp_unix()` - seconds since the epoch
//! - string and integer literals
//!
//! Invalid expressions fail at parse time, which is config-lint time: a
//! stream never starts with a template it cannot evaluate.
//!
//! [`Mapping`] is the assignment form used by the `generate` input and the
//! `mapping` processor: one `root.path = expression` per line, producing a
//! fresh JSON document from the incoming message.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::LazyLock;
use virta_core::{Error, Message, Result};

/// Process-wide named counters backing `count("name")`.
static COUNTERS: LazyLock<Mutex<HashMap<String, u64>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

fn next_count(name: &str) -> u64 {
    let mut counters = COUNTERS.lock();
    let entry = counters.entry(name.to_string()).or_insert(0);
    *entry += 1;
    *entry
}

/// A single parsed expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// `content()` - the raw payload.
    Content,
    /// `json("path")` - dotted path into the structured payload.
    Json(Vec<String>),
    /// `meta("key")` - metadata lookup.
    Meta(String),
    /// `count("name")` - shared incrementing counter.
    Count(String),
    /// `uuid_v4()`.
    UuidV4,
    /// `timestamp_unix()`.
    TimestampUnix,
    /// A quoted string literal.
    StringLit(String),
    /// An integer literal.
    IntLit(i64),
}

impl Expr {
    /// Parse a single expression.
    pub fn parse(src: &str) -> Result<Expr> {
        let src = src.trim();
        if src.is_empty() {
            return Err(Error::Config("empty expression".into()));
        }

        if let Some(lit) = parse_string_lit(src) {
            return Ok(Expr::StringLit(lit));
        }
        if let Ok(n) = src.parse::<i64>() {
            return Ok(Expr::IntLit(n));
        }

        let (name, arg) = parse_call(src)?;
        match (name, arg) {
            ("content", None) => Ok(Expr::Content),
            ("json", Some(path)) => Ok(Expr::Json(
                path.split('.').map(str::to_string).collect(),
            )),
            ("json", None) => Ok(Expr::Json(Vec::new())),
            ("meta", Some(key)) => Ok(Expr::Meta(key)),
            ("count", Some(name)) => Ok(Expr::Count(name)),
            ("uuid_v4", None) => Ok(Expr::UuidV4),
            ("timestamp_unix", None) => Ok(Expr::TimestampUnix),
            (name, _) => Err(Error::Config(format!(
                "unrecognised expression function '{name}'"
            ))),
        }
    }

    /// Evaluate against a message, producing a JSON value.
    pub fn eval(&self, msg: &Message) -> Result<serde_json::Value> {
        match self {
            Expr::Content => Ok(serde_json::Value::String(
                msg.payload_str().unwrap_or_default().to_string(),
            )),
            Expr::Json(path) => {
                let doc = msg.structured()?;
                let mut cursor: &serde_json::Value = &doc;
                for seg in path {
                    cursor = cursor.get(seg).ok_or_else(|| {
                        Error::Permanent(format!("field `{}` not found", path.join(".")))
                    })?;
                }
                Ok(cursor.clone())
            }
            Expr::Meta(key) => msg
                .metadata()
                .get(key)
                .map(|v| serde_json::Value::String(v.clone()))
                .ok_or_else(|| Error::Permanent(format!("metadata key `{key}` not found"))),
            Expr::Count(name) => Ok(serde_json::Value::from(next_count(name))),
            Expr::UuidV4 => Ok(serde_json::Value::String(
                uuid::Uuid::new_v4().to_string(),
            )),
            Expr::TimestampUnix => Ok(serde_json::Value::from(chrono::Utc::now().timestamp())),
            Expr::StringLit(s) => Ok(serde_json::Value::String(s.clone())),
            Expr::IntLit(n) => Ok(serde_json::Value::from(*n)),
        }
    }

    /// Evaluate and render as a plain string (strings render unquoted).
    pub fn eval_string(&self, msg: &Message) -> Result<String> {
        Ok(render_value(&self.eval(msg)?))
    }
}

fn render_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn parse_string_lit(src: &str) -> Option<String> {
    let src = src.trim();
    if src.len() >= 2 && src.starts_with('"') && src.ends_with('"') {
        return Some(src[1..src.len() - 1].to_string());
    }
    None
}

/// Parse `name(...)` with an optional single quoted-string argument.
fn parse_call(src: &str) -> Result<(&str, Option<String>)> {
    let open = src
        .find('(')
        .ok_or_else(|| Error::Config(format!("invalid expression: {src}")))?;
    if !src.ends_with(')') {
        return Err(Error::Config(format!("unclosed call in expression: {src}")));
    }
    let name = src[..open].trim();
    let args = src[open + 1..src.len() - 1].trim();
    if args.is_empty() {
        return Ok((name, None));
    }
    let arg = parse_string_lit(args)
        .ok_or_else(|| Error::Config(format!("expected string argument in: {src}")))?;
    Ok((name, Some(arg)))
}

/// A config string with zero or more embedded `${! expr }` spans.
#[derive(Debug, Clone)]
pub struct Template {
    parts: Vec<Part>,
}

#[derive(Debug, Clone)]
enum Part {
    Literal(String),
    Expr(Expr),
}

impl Template {
    /// Parse a template, failing on any invalid embedded expression.
    pub fn parse(raw: &str) -> Result<Template> {
        let mut parts = Vec::new();
        let mut rest = raw;
        while let Some(start) = rest.find("${!") {
            let end = rest[start..]
                .find('}')
                .map(|i| start + i)
                .ok_or_else(|| Error::Config(format!("unclosed interpolation in: {raw}")))?;
            if start > 0 {
                parts.push(Part::Literal(rest[..start].to_string()));
            }
            parts.push(Part::Expr(Expr::parse(&rest[start + 3..end])?));
            rest = &rest[end + 1..];
        }
        if !rest.is_empty() {
            parts.push(Part::Literal(rest.to_string()));
        }
        Ok(Template { parts })
    }

    /// Whether the template contains no expressions.
    pub fn is_static(&self) -> bool {
        self.parts
            .iter()
            .all(|p| matches!(p, Part::Literal(_)))
    }

    /// Render against a message.
    pub fn render(&self, msg: &Message) -> Result<String> {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                Part::Literal(s) => out.push_str(s),
                Part::Expr(e) => out.push_str(&e.eval_string(msg)?),
            }
        }
        Ok(out)
    }
}

/// A newline-separated list of `root.path = expression` assignments.
///
/// Applying a mapping replaces the message payload with a fresh document
/// built from the assignments, evaluated against the *incoming* message.
#[derive(Debug, Clone)]
pub struct Mapping {
    assignments: Vec<(Vec<String>, Expr)>,
}

impl Mapping {
    /// Parse a mapping, failing on malformed assignments.
    pub fn parse(src: &str) -> Result<Mapping> {
        let mut assignments = Vec::new();
        for line in src.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (target, expr) = line
                .split_once('=')
                .ok_or_else(|| Error::Config(format!("mapping line missing `=`: {line}")))?;
            let target = target.trim();
            let path: Vec<String> = if target == "root" {
                Vec::new()
            } else if let Some(sub) = target.strip_prefix("root.") {
                sub.split('.').map(str::to_string).collect()
            } else {
                return Err(Error::Config(format!(
                    "mapping target must start with `root`: {line}"
                )));
            };
            assignments.push((path, Expr::parse(expr)?));
        }
        if assignments.is_empty() {
            return Err(Error::Config("mapping has no assignments".into()));
        }
        Ok(Mapping { assignments })
    }

    /// Build the mapped document for a message.
    pub fn build(&self, msg: &Message) -> Result<serde_json::Value> {
        let mut doc = serde_json::Value::Null;
        for (path, expr) in &self.assignments {
            let value = expr.eval(msg)?;
            if path.is_empty() {
                doc = value;
                continue;
            }
            if !doc.is_object() {
                doc = serde_json::Value::Object(serde_json::Map::new());
            }
            let mut cursor = &mut doc;
            for seg in &path[..path.len() - 1] {
                let obj = cursor
                    .as_object_mut()
                    .ok_or_else(|| Error::Permanent("mapping target is not an object".into()))?;
                cursor = obj
                    .entry(seg.clone())
                    .or_insert_with(|| serde_json::Value::Object(serde_json::Map::new()));
                if !cursor.is_object() {
                    *cursor = serde_json::Value::Object(serde_json::Map::new());
                }
            }
            let obj = cursor
                .as_object_mut()
                .ok_or_else(|| Error::Permanent("mapping target is not an object".into()))?;
            obj.insert(path[path.len() - 1].clone(), value);
        }
        Ok(doc)
    }

    /// Apply in place: the message payload becomes the mapped document.
    pub fn apply(&self, msg: &mut Message) -> Result<()> {
        let doc = self.build(msg)?;
        msg.set_structured(doc)
    }
}
