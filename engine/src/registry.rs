//! Constructor environment: the `type` string → builder tables
//!
//! Every component kind has a table mapping config type names to
//! constructors. The tables are populated once by
//! [`Environment::with_builtins`] before any stream is built; duplicate
//! registration is a startup failure. After init the tables are read-only
//! and lookups take the cheap read path.

use crate::buffer::Buffer;
use crate::cache::{Cache, MemoryCache};
use crate::config::ComponentConfig;
use crate::input::{
    AutoRetryConfig, AutoRetryInput, DynamicFanInConfig, FanInConfig, GenerateConfig,
    GenerateInput, InputHandle, build_fan_in, spawn_input,
};
use crate::input::dynamic::build_dynamic_fan_in;
use crate::manager::Manager;
use crate::output::{
    DropOnConfig, DropOutput, DynamicFanOutConfig, FanOutConfig, FileOutput, FileOutputConfig,
    OutputHandle, RejectOutput, RejectOutputConfig, RetryConfig, StdoutOutput, build_drop_on,
    build_dynamic_fan_out, build_fan_out, build_retry, spawn_output,
};
use crate::processor::{
    BatchPolicyConfig, BatchProcessor, DedupeConfig, DedupeProcessor, MappingProcessor, Processor,
    ResourceProcessor,
};
use crate::ratelimit::{LocalRateLimit, LocalRateLimitConfig, RateLimit};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use virta_core::{Error, Result};

type InputBuilder = Box<dyn Fn(&ComponentConfig, &Manager) -> Result<InputHandle> + Send + Sync>;
type OutputBuilder = Box<dyn Fn(&ComponentConfig, &Manager) -> Result<OutputHandle> + Send + Sync>;
type ProcessorBuilder =
    Box<dyn Fn(&ComponentConfig, &Manager) -> Result<Arc<dyn Processor>> + Send + Sync>;
type CacheBuilder = Box<dyn Fn(&ComponentConfig, &Manager) -> Result<Arc<dyn Cache>> + Send + Sync>;
type RateLimitBuilder =
    Box<dyn Fn(&ComponentConfig, &Manager) -> Result<Arc<dyn RateLimit>> + Send + Sync>;
type BufferBuilder =
    Box<dyn Fn(&ComponentConfig, &Manager) -> Result<Box<dyn Buffer>> + Send + Sync>;

struct Registration<B> {
    fields: &'static [&'static str],
    build: B,
}

/// The constructor tables.
#[derive(Default)]
pub struct Environment {
    inputs: RwLock<HashMap<String, Registration<InputBuilder>>>,
    outputs: RwLock<HashMap<String, Registration<OutputBuilder>>>,
    processors: RwLock<HashMap<String, Registration<ProcessorBuilder>>>,
    caches: RwLock<HashMap<String, Registration<CacheBuilder>>>,
    rate_limits: RwLock<HashMap<String, Registration<RateLimitBuilder>>>,
    buffers: RwLock<HashMap<String, Registration<BufferBuilder>>>,
}

macro_rules! register_fn {
    ($fn_name:ident, $field:ident, $builder:ty, $kind:literal) => {
        /// Register a constructor. Duplicate names fail hard, surfaced as
        /// a startup error.
        pub fn $fn_name(
            &self,
            name: &str,
            fields: &'static [&'static str],
            build: $builder,
        ) -> Result<()> {
            let mut table = self.$field.write();
            if table.contains_key(name) {
                return Err(Error::Config(format!(
                    concat!($kind, " type `{}` registered twice"),
                    name
                )));
            }
            table.insert(name.to_string(), Registration { fields, build });
            Ok(())
        }
    };
}

macro_rules! build_fn {
    ($fn_name:ident, $field:ident, $out:ty, $kind:literal) => {
        pub(crate) fn $fn_name(&self, conf: &ComponentConfig, mgr: &Manager) -> Result<$out> {
            let table = self.$field.read();
            let entry = table.get(&conf.type_name).ok_or_else(|| {
                let mut known: Vec<&str> = table.keys().map(String::as_str).collect();
                known.sort_unstable();
                Error::Config(format!(
                    concat!("unrecognised ", $kind, " type `{}`, expected one of: {}"),
                    conf.type_name,
                    known.join(", ")
                ))
            })?;
            conf.lint_fields(entry.fields, mgr.lint_mode())?;
            (entry.build)(conf, mgr)
        }
    };
}

impl Environment {
    /// An empty environment. Most callers want
    /// [`Environment::with_builtins`].
    pub fn new() -> Self {
        Self::default()
    }

    register_fn!(register_input, inputs, InputBuilder, "input");
    register_fn!(register_output, outputs, OutputBuilder, "output");
    register_fn!(register_processor, processors, ProcessorBuilder, "processor");
    register_fn!(register_cache, caches, CacheBuilder, "cache");
    register_fn!(register_rate_limit, rate_limits, RateLimitBuilder, "rate limit");
    register_fn!(register_buffer, buffers, BufferBuilder, "buffer");

    build_fn!(build_input, inputs, InputHandle, "input");
    build_fn!(build_output, outputs, OutputHandle, "output");
    build_fn!(build_processor, processors, Arc<dyn Processor>, "processor");
    build_fn!(build_cache, caches, Arc<dyn Cache>, "cache");
    build_fn!(build_rate_limit, rate_limits, Arc<dyn RateLimit>, "rate limit");
    build_fn!(build_buffer, buffers, Box<dyn Buffer>, "buffer");

    /// Whether an input type is registered.
    pub fn has_input(&self, name: &str) -> bool {
        self.inputs.read().contains_key(name)
    }

    /// Whether an output type is registered.
    pub fn has_output(&self, name: &str) -> bool {
        self.outputs.read().contains_key(name)
    }

    /// An environment with every builtin component registered.
    pub fn with_builtins() -> Result<Arc<Environment>> {
        let env = Environment::new();
        env.register_builtins()?;
        Ok(Arc::new(env))
    }

    fn register_builtins(&self) -> Result<()> {
        // Inputs
        self.register_input(
            "generate",
            crate::input::generate::CONFIG_FIELDS,
            Box::new(|conf, mgr| {
                let body: GenerateConfig = conf.parse_body()?;
                let driver = AutoRetryInput::new(
                    Box::new(GenerateInput::new(body)?),
                    AutoRetryConfig::default(),
                );
                Ok(spawn_input(Box::new(driver), mgr.path_string()))
            }),
        )?;
        self.register_input(
            "broker",
            crate::input::broker::CONFIG_FIELDS,
            Box::new(|conf, mgr| {
                let body: FanInConfig = conf.parse_body()?;
                build_fan_in(&body, mgr)
            }),
        )?;
        self.register_input(
            "dynamic",
            crate::input::dynamic::CONFIG_FIELDS,
            Box::new(|conf, mgr| {
                let body: DynamicFanInConfig = conf.parse_body()?;
                let (handle, control) = build_dynamic_fan_in(&body, mgr)?;
                mgr.set_dynamic_input_control(control);
                Ok(handle)
            }),
        )?;
        self.register_input(
            "resource",
            &[],
            Box::new(|conf, mgr| {
                let name: String = conf.parse_body()?;
                let fragment = mgr.input_config(&name)?;
                mgr.new_input(&fragment)
            }),
        )?;

        // Outputs
        self.register_output(
            "stdout",
            &[],
            Box::new(|_conf, mgr| Ok(spawn_output(Box::new(StdoutOutput), mgr.path_string()))),
        )?;
        self.register_output(
            "file",
            crate::output::write::FILE_CONFIG_FIELDS,
            Box::new(|conf, mgr| {
                let body: FileOutputConfig = conf.parse_body()?;
                Ok(spawn_output(
                    Box::new(FileOutput::new(body)?),
                    mgr.path_string(),
                ))
            }),
        )?;
        self.register_output(
            "drop",
            &[],
            Box::new(|_conf, mgr| Ok(spawn_output(Box::new(DropOutput), mgr.path_string()))),
        )?;
        self.register_output(
            "reject",
            crate::output::write::REJECT_CONFIG_FIELDS,
            Box::new(|conf, mgr| {
                let body: RejectOutputConfig = conf.parse_body()?;
                Ok(spawn_output(
                    Box::new(RejectOutput::new(body)?),
                    mgr.path_string(),
                ))
            }),
        )?;
        self.register_output(
            "retry",
            crate::output::retry::CONFIG_FIELDS,
            Box::new(|conf, mgr| {
                let body: RetryConfig = conf.parse_body()?;
                build_retry(&body, mgr)
            }),
        )?;
        self.register_output(
            "drop_on",
            crate::output::drop_on::CONFIG_FIELDS,
            Box::new(|conf, mgr| {
                let body: DropOnConfig = conf.parse_body()?;
                build_drop_on(&body, mgr)
            }),
        )?;
        self.register_output(
            "fan_out",
            crate::output::fan_out::CONFIG_FIELDS,
            Box::new(|conf, mgr| {
                let body: FanOutConfig = conf.parse_body()?;
                build_fan_out(&body, mgr)
            }),
        )?;
        self.register_output(
            "dynamic",
            crate::output::dynamic::CONFIG_FIELDS,
            Box::new(|conf, mgr| {
                let body: DynamicFanOutConfig = conf.parse_body()?;
                let (handle, control) = build_dynamic_fan_out(&body, mgr)?;
                mgr.set_dynamic_output_control(control);
                Ok(handle)
            }),
        )?;
        self.register_output(
            "resource",
            &[],
            Box::new(|conf, mgr| {
                let name: String = conf.parse_body()?;
                let fragment = mgr.output_config(&name)?;
                mgr.new_output(&fragment)
            }),
        )?;

        // Processors
        self.register_processor(
            "mapping",
            &[],
            Box::new(|conf, _mgr| {
                let src: String = conf.parse_body()?;
                Ok(Arc::new(MappingProcessor::new(&src)?) as Arc<dyn Processor>)
            }),
        )?;
        self.register_processor(
            "dedupe",
            crate::processor::dedupe::CONFIG_FIELDS,
            Box::new(|conf, mgr| {
                let body: DedupeConfig = conf.parse_body()?;
                Ok(Arc::new(DedupeProcessor::new(body, mgr)?) as Arc<dyn Processor>)
            }),
        )?;
        self.register_processor(
            "batch",
            crate::processor::batching::CONFIG_FIELDS,
            Box::new(|conf, _mgr| {
                let body: BatchPolicyConfig = conf.parse_body()?;
                Ok(Arc::new(BatchProcessor::new(body)?) as Arc<dyn Processor>)
            }),
        )?;
        self.register_processor(
            "resource",
            &[],
            Box::new(|conf, mgr| {
                let name: String = conf.parse_body()?;
                Ok(Arc::new(ResourceProcessor::new(name, mgr)) as Arc<dyn Processor>)
            }),
        )?;

        // Caches
        self.register_cache(
            "memory",
            crate::cache::memory::CONFIG_FIELDS,
            Box::new(|conf, _mgr| {
                let body: crate::cache::MemoryCacheConfig = conf.parse_body()?;
                Ok(Arc::new(MemoryCache::new(body)) as Arc<dyn Cache>)
            }),
        )?;

        // Rate limits
        self.register_rate_limit(
            "local",
            crate::ratelimit::local::CONFIG_FIELDS,
            Box::new(|conf, _mgr| {
                let body: LocalRateLimitConfig = conf.parse_body()?;
                Ok(Arc::new(LocalRateLimit::new(body)?) as Arc<dyn RateLimit>)
            }),
        )?;

        // Buffers
        self.register_buffer(
            "memory",
            crate::buffer::MEMORY_CONFIG_FIELDS,
            Box::new(crate::buffer::build_memory_buffer),
        )?;

        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_registration_fails_hard() {
        let env = Environment::with_builtins().unwrap();
        let res = env.register_output(
            "stdout",
            &[],
            Box::new(|_conf, mgr| Ok(spawn_output(Box::new(StdoutOutput), mgr.path_string()))),
        );
        assert!(matches!(res, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn unknown_type_lists_candidates() {
        let mgr = Manager::for_tests();
        let conf = ComponentConfig::new("warp_drive", serde_json::json!({}));
        let err = mgr.new_output(&conf).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("warp_drive"));
        assert!(msg.contains("stdout"));
    }

    #[tokio::test]
    async fn builds_builtin_components() {
        let mgr = Manager::for_tests();

        let out = mgr
            .new_output(&ComponentConfig::new("drop", serde_json::Value::Null))
            .unwrap();
        out.close().await.unwrap();

        let input = mgr
            .new_input(&ComponentConfig::new(
                "generate",
                serde_json::json!({"mapping": "root.x = 1", "count": 1}),
            ))
            .unwrap();
        let (mut rx, control) = input.split();
        let txn = rx.recv().await.unwrap();
        txn.ack(Ok(()));
        while let Some(txn) = rx.recv().await {
            txn.ack(Ok(()));
        }
        control.join().await;

        let proc = mgr
            .new_processor(&ComponentConfig::new(
                "mapping",
                serde_json::json!("root.y = 2"),
            ))
            .unwrap();
        assert_eq!(proc.name(), "mapping");
    }

    #[tokio::test]
    async fn resource_components_resolve_named_fragments() {
        let mgr = Manager::for_tests();
        mgr.store_output_config(
            "sink",
            ComponentConfig::new("drop", serde_json::Value::Null),
        );
        mgr.store_input_config(
            "source",
            ComponentConfig::new(
                "generate",
                serde_json::json!({"mapping": "root.x = 1", "count": 1}),
            ),
        );

        let out = mgr
            .new_output(&ComponentConfig::new("resource", serde_json::json!("sink")))
            .unwrap();
        out.close().await.unwrap();

        let input = mgr
            .new_input(&ComponentConfig::new("resource", serde_json::json!("source")))
            .unwrap();
        let (mut rx, control) = input.split();
        while let Some(txn) = rx.recv().await {
            txn.ack(Ok(()));
        }
        control.join().await;

        // Unknown names are distinguishable from lint failures.
        assert!(matches!(
            mgr.new_output(&ComponentConfig::new("resource", serde_json::json!("ghost"))),
            Err(Error::ResourceMissing(_))
        ));
    }

    #[tokio::test]
    async fn strict_lint_rejects_unknown_fields() {
        let mgr = Manager::for_tests();
        let conf = ComponentConfig::new(
            "file",
            serde_json::json!({"path": "/tmp/x", "compression": "zstd"}),
        );
        assert!(matches!(mgr.new_output(&conf), Err(Error::Config(_))));

        let chilled = mgr.clone().with_lint_mode(crate::config::LintMode::Chilled);
        let handle = chilled.new_output(&conf).unwrap();
        handle.close().await.unwrap();
    }
}
