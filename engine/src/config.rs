//! Configuration model for virta streams
//!
//! Configs are declarative JSON-shaped documents. The outer shape is
//!
//! ```json
//! {
//!   "input": { "type": "generate", "generate": { ... } },
//!   "pipeline": { "threads": 1, "processors": [ ... ] },
//!   "buffer": { "type": "memory", "memory": { ... } },
//!   "output": { "type": "file", "file": { ... } },
//!   "resources": { "caches": { ... }, "rate_limits": { ... } },
//!   "http": { ... },
//!   "logger": { ... },
//!   "system_close_delay": "0s",
//!   "system_close_timeout": "20s"
//! }
//! ```
//!
//! Each component fragment is `{ label?, type?, <type>: { ...body... } }`;
//! the `type` field may be omitted when the fragment contains exactly one
//! non-reserved key. Unknown body fields are lint failures unless the engine
//! runs chilled, in which case they are demoted to warnings.
//!
//! `${VAR}` references anywhere in the raw document are resolved from the
//! process environment before parsing.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use virta_core::{Error, Result};

/// Keys of a component fragment that are not a type name.
const RESERVED_KEYS: &[&str] = &["label", "type"];

/// How strictly lint failures are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LintMode {
    /// Unknown fields fail the config.
    #[default]
    Strict,
    /// Unknown fields are logged as warnings ("chilled" mode).
    Chilled,
}

/// A single component fragment: label, type name, and the type's body.
#[derive(Debug, Clone)]
pub struct ComponentConfig {
    /// Optional label used in logs and metrics paths.
    pub label: Option<String>,
    /// The component type, e.g. `generate`, `fan_out`, `dedupe`.
    pub type_name: String,
    /// The body under the type key, left opaque for the constructor.
    pub body: serde_json::Value,
}

impl ComponentConfig {
    /// Build a fragment programmatically.
    pub fn new(type_name: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            label: None,
            type_name: type_name.into(),
            body,
        }
    }

    /// Extract a fragment from a JSON value.
    pub fn from_value(value: &serde_json::Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| Error::Config("component config must be an object".into()))?;

        let label = match obj.get("label") {
            None => None,
            Some(serde_json::Value::String(s)) => Some(s.clone()),
            Some(_) => return Err(Error::Config("component label must be a string".into())),
        };

        let type_name = match obj.get("type") {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(_) => return Err(Error::Config("component type must be a string".into())),
            None => {
                // Infer from the single non-reserved key.
                let mut candidates = obj.keys().filter(|k| !RESERVED_KEYS.contains(&k.as_str()));
                let first = candidates.next().ok_or_else(|| {
                    Error::Config("component config has no type".into())
                })?;
                if candidates.next().is_some() {
                    return Err(Error::Config(format!(
                        "unable to infer component type, multiple candidates in {}",
                        serde_json::to_string(value).unwrap_or_default()
                    )));
                }
                first.clone()
            }
        };

        let body = obj
            .get(&type_name)
            .cloned()
            .unwrap_or(serde_json::Value::Object(serde_json::Map::new()));

        Ok(Self {
            label,
            type_name,
            body,
        })
    }

    /// Deserialize the body into a typed config. A null body reads as an
    /// empty object so that all-default components need no braces.
    pub fn parse_body<T: DeserializeOwned>(&self) -> Result<T> {
        let body = if self.body.is_null() {
            serde_json::Value::Object(serde_json::Map::new())
        } else {
            self.body.clone()
        };
        serde_json::from_value(body).map_err(|e| {
            Error::Config(format!(
                "failed to parse `{}` config: {e}",
                self.type_name
            ))
        })
    }

    /// Lint the body's top-level keys against the fields a component
    /// declares. Unknown keys fail in strict mode and warn in chilled mode.
    pub fn lint_fields(&self, known: &[&str], mode: LintMode) -> Result<()> {
        let Some(obj) = self.body.as_object() else {
            return Ok(());
        };
        for key in obj.keys() {
            if !known.contains(&key.as_str()) {
                match mode {
                    LintMode::Strict => {
                        return Err(Error::Config(format!(
                            "field {key} not recognised by `{}`",
                            self.type_name
                        )));
                    }
                    LintMode::Chilled => {
                        tracing::warn!(
                            component = %self.type_name,
                            field = %key,
                            "ignoring unrecognised config field"
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Re-assemble the `{label?, type, <type>: body}` shape, for the admin
    /// API and logs.
    pub fn to_value(&self) -> serde_json::Value {
        let mut obj = serde_json::Map::new();
        if let Some(label) = &self.label {
            obj.insert("label".into(), serde_json::Value::String(label.clone()));
        }
        obj.insert(
            "type".into(),
            serde_json::Value::String(self.type_name.clone()),
        );
        obj.insert(self.type_name.clone(), self.body.clone());
        serde_json::Value::Object(obj)
    }
}

impl<'de> Deserialize<'de> for ComponentConfig {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = serde_json::Value::deserialize(deserializer)?;
        ComponentConfig::from_value(&value).map_err(serde::de::Error::custom)
    }
}

impl Serialize for ComponentConfig {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.to_value().serialize(serializer)
    }
}

/// Processor chain configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct PipelineConfig {
    /// Number of parallel processing tasks. Above 1, ordering across
    /// transactions is no longer guaranteed.
    #[serde(default = "default_threads")]
    pub threads: usize,
    /// Processors applied in order to every batch.
    #[serde(default)]
    pub processors: Vec<ComponentConfig>,
}

fn default_threads() -> usize {
    1
}

/// Named resources shared across components of a stream.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ResourcesConfig {
    /// Named caches.
    #[serde(default)]
    pub caches: std::collections::HashMap<String, ComponentConfig>,
    /// Named rate limiters.
    #[serde(default)]
    pub rate_limits: std::collections::HashMap<String, ComponentConfig>,
    /// Named processors, shared live across their referents.
    #[serde(default)]
    pub processors: std::collections::HashMap<String, ComponentConfig>,
    /// Named input fragments, instantiated per referent.
    #[serde(default)]
    pub inputs: std::collections::HashMap<String, ComponentConfig>,
    /// Named output fragments, instantiated per referent.
    #[serde(default)]
    pub outputs: std::collections::HashMap<String, ComponentConfig>,
}

/// Admin HTTP surface configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Whether to serve the admin API at all.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Listen address, e.g. `0.0.0.0:4195`.
    #[serde(default = "default_http_address")]
    pub address: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            address: default_http_address(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_http_address() -> String {
    "127.0.0.1:4195".to_string()
}

/// Logger configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggerConfig {
    /// Log level filter, e.g. `info` or `virta_engine=debug`.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// `json` or `text` line format.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

/// One end-to-end stream: input, optional processors and buffer, output.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    /// The producing component.
    pub input: ComponentConfig,
    /// Optional decoupling buffer between pipeline and output.
    #[serde(default)]
    pub buffer: Option<ComponentConfig>,
    /// Processor chain.
    #[serde(default)]
    pub pipeline: PipelineConfig,
    /// The consuming component.
    pub output: ComponentConfig,
}

/// Full engine configuration: one stream plus the ambient surfaces.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// The stream definition.
    #[serde(flatten)]
    pub stream: StreamConfig,
    /// Shared named resources.
    #[serde(default)]
    pub resources: ResourcesConfig,
    /// Admin HTTP surface.
    #[serde(default)]
    pub http: HttpConfig,
    /// Logging.
    #[serde(default)]
    pub logger: LoggerConfig,
    /// External metrics sink fragment, consumed by sink drivers. The
    /// in-process registry serves `/metrics` regardless.
    #[serde(default)]
    pub metrics: Option<ComponentConfig>,
    /// External tracing sink fragment, consumed by sink drivers.
    #[serde(default)]
    pub tracing: Option<ComponentConfig>,
    /// Grace period before shutdown begins, for draining external
    /// consumers pointed at this stream.
    #[serde(
        default = "default_close_delay",
        deserialize_with = "deserialize_duration"
    )]
    pub system_close_delay: Duration,
    /// Hard ceiling on the whole shutdown.
    #[serde(
        default = "default_close_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub system_close_timeout: Duration,
}

fn default_close_delay() -> Duration {
    Duration::ZERO
}

fn default_close_timeout() -> Duration {
    Duration::from_secs(20)
}

impl EngineConfig {
    /// Parse a raw JSON document, resolving `${VAR}` env references first.
    pub fn from_str(raw: &str) -> Result<Self> {
        let resolved = resolve_env_vars(raw)?;
        serde_json::from_str(&resolved).map_err(|e| Error::Config(e.to_string()))
    }
}

/// Parse a duration string such as `100ms`, `5s`, `1m`, `2h`.
pub fn parse_duration(src: &str) -> Result<Duration> {
    let src = src.trim();
    let split = src
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .ok_or_else(|| Error::Config(format!("duration `{src}` is missing a unit")))?;
    let (num, unit) = src.split_at(split);
    let value: f64 = num
        .parse()
        .map_err(|_| Error::Config(format!("invalid duration value in `{src}`")))?;
    let secs = match unit {
        "us" | "µs" => value / 1_000_000.0,
        "ms" => value / 1_000.0,
        "s" => value,
        "m" => value * 60.0,
        "h" => value * 3_600.0,
        other => {
            return Err(Error::Config(format!(
                "unrecognised duration unit `{other}` in `{src}`"
            )));
        }
    };
    Ok(Duration::from_secs_f64(secs))
}

/// Serde helper for duration strings.
pub fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_duration(&raw).map_err(serde::de::Error::custom)
}

/// Serde helper for optional duration strings.
pub fn deserialize_opt_duration<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<Duration>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    raw.map(|s| parse_duration(&s).map_err(serde::de::Error::custom))
        .transpose()
}

/// Replace `${VAR}` and `${VAR:default}` references with environment values.
///
/// A reference without a default to a variable that is not set is a config
/// error, surfaced before parsing.
pub fn resolve_env_vars(raw: &str) -> Result<String> {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(start) = rest.find("${") {
        // `${!` is interpolation, not an env reference.
        if rest[start..].starts_with("${!") {
            out.push_str(&rest[..start + 3]);
            rest = &rest[start + 3..];
            continue;
        }
        let end = rest[start..]
            .find('}')
            .map(|i| start + i)
            .ok_or_else(|| Error::Config("unclosed environment variable reference".into()))?;
        out.push_str(&rest[..start]);
        let reference = &rest[start + 2..end];
        let (name, default) = match reference.split_once(':') {
            Some((n, d)) => (n, Some(d)),
            None => (reference, None),
        };
        match std::env::var(name) {
            Ok(value) => out.push_str(&value),
            Err(_) => match default {
                Some(d) => out.push_str(d),
                None => {
                    return Err(Error::Config(format!(
                        "environment variable `{name}` is not set"
                    )));
                }
            },
        }
        rest = &rest[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn component_with_explicit_type() {
        let conf = ComponentConfig::from_value(&serde_json::json!({
            "label": "gen",
            "type": "generate",
            "generate": {"interval": "100ms"}
        }))
        .unwrap();
        assert_eq!(conf.type_name, "generate");
        assert_eq!(conf.label.as_deref(), Some("gen"));
        assert_eq!(conf.body["interval"], "100ms");
    }

    #[test]
    fn component_with_inferred_type() {
        let conf = ComponentConfig::from_value(&serde_json::json!({
            "stdout": {}
        }))
        .unwrap();
        assert_eq!(conf.type_name, "stdout");
    }

    #[test]
    fn component_with_ambiguous_type_fails() {
        let res = ComponentConfig::from_value(&serde_json::json!({
            "stdout": {},
            "file": {}
        }));
        assert!(res.is_err());
    }

    #[test]
    fn lint_unknown_field_strict_vs_chilled() {
        let conf = ComponentConfig::new("file", serde_json::json!({"path": "/tmp/x", "bogus": 1}));
        assert!(conf.lint_fields(&["path", "codec"], LintMode::Strict).is_err());
        assert!(conf
            .lint_fields(&["path", "codec"], LintMode::Chilled)
            .is_ok());
    }

    #[test]
    fn round_trip_to_value() {
        let conf = ComponentConfig::new("drop", serde_json::json!({}));
        let value = conf.to_value();
        assert_eq!(value["type"], "drop");
        let back = ComponentConfig::from_value(&value).unwrap();
        assert_eq!(back.type_name, "drop");
    }

    #[test]
    fn duration_parsing() {
        assert_eq!(parse_duration("100ms").unwrap(), Duration::from_millis(100));
        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("10fortnights").is_err());
    }

    #[test]
    fn env_resolution_with_default() {
        let resolved = resolve_env_vars("addr=${VIRTA_TEST_UNSET:127.0.0.1}").unwrap();
        assert_eq!(resolved, "addr=127.0.0.1");

        assert!(resolve_env_vars("addr=${VIRTA_TEST_UNSET}").is_err());
    }

    #[test]
    fn env_resolution_skips_interpolations() {
        let raw = r#"key=${! json("n") }"#;
        assert_eq!(resolve_env_vars(raw).unwrap(), raw);
    }

    #[test]
    fn engine_config_full_document() {
        let raw = r#"{
            "input": {"generate": {"interval": "1s", "mapping": "root.id = \"x\""}},
            "pipeline": {"threads": 2, "processors": [{"mapping": {"mapping": "root = content()"}}]},
            "output": {"stdout": {}},
            "system_close_timeout": "500ms"
        }"#;
        let conf = EngineConfig::from_str(raw).unwrap();
        assert_eq!(conf.stream.input.type_name, "generate");
        assert_eq!(conf.stream.pipeline.threads, 2);
        assert_eq!(conf.system_close_timeout, Duration::from_millis(500));
        assert_eq!(conf.system_close_delay, Duration::ZERO);
        assert!(conf.stream.buffer.is_none());
    }
}
