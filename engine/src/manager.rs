//! Manager: component construction and shared resource access
//!
//! The manager owns the context shared by every component of a stream: the
//! constructor environment, the named-resource maps, and the label path
//! used for logs and metrics. Components hold a cheap clone of the manager
//! and reach shared state through it; the manager (not the components)
//! owns teardown.
//!
//! Resource access is gated through a closure so the registry can
//! guarantee liveness: the callback runs with the resource held alive by
//! the lease, and returning releases it. Leases must not be held across
//! suspension points other than the operation they were taken for.

use crate::buffer::{Buffer, BufferHandle};
use crate::cache::Cache;
use crate::config::{ComponentConfig, LintMode, ResourcesConfig};
use crate::input::{DynamicInputControl, InputHandle};
use crate::output::{DynamicOutputControl, OutputHandle};
use crate::processor::Processor;
use crate::ratelimit::RateLimit;
use crate::registry::Environment;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use virta_core::{Error, Result};

struct SharedState {
    caches: RwLock<HashMap<String, Arc<dyn Cache>>>,
    rate_limits: RwLock<HashMap<String, Arc<dyn RateLimit>>>,
    processors: RwLock<HashMap<String, Arc<dyn Processor>>>,
    input_configs: RwLock<HashMap<String, ComponentConfig>>,
    output_configs: RwLock<HashMap<String, ComponentConfig>>,
    dynamic_input: Mutex<Option<DynamicInputControl>>,
    dynamic_output: Mutex<Option<DynamicOutputControl>>,
}

/// Shared context handed to every component.
///
/// Clones share the same environment and resources; [`Manager::into_path`]
/// produces a scoped clone whose logs and metrics carry the extended path.
#[derive(Clone)]
pub struct Manager {
    env: Arc<Environment>,
    shared: Arc<SharedState>,
    path: Arc<Vec<String>>,
    lint: LintMode,
}

impl Manager {
    /// Create a manager over a constructor environment.
    pub fn new(env: Arc<Environment>) -> Self {
        Self {
            env,
            shared: Arc::new(SharedState {
                caches: RwLock::new(HashMap::new()),
                rate_limits: RwLock::new(HashMap::new()),
                processors: RwLock::new(HashMap::new()),
                input_configs: RwLock::new(HashMap::new()),
                output_configs: RwLock::new(HashMap::new()),
                dynamic_input: Mutex::new(None),
                dynamic_output: Mutex::new(None),
            }),
            path: Arc::new(vec!["root".to_string()]),
            lint: LintMode::Strict,
        }
    }

    /// A manager with all builtin constructors, for tests and examples.
    #[allow(clippy::expect_used)]
    pub fn for_tests() -> Self {
        Self::new(Environment::with_builtins().expect("builtin registration"))
    }

    /// Set the lint mode applied to component bodies.
    pub fn with_lint_mode(mut self, mode: LintMode) -> Self {
        self.lint = mode;
        self
    }

    /// The lint mode in effect.
    pub fn lint_mode(&self) -> LintMode {
        self.lint
    }

    /// A scoped child manager whose path is extended by `segments`.
    ///
    /// Never fails; the child shares environment and resources.
    pub fn into_path(&self, segments: &[&str]) -> Manager {
        let mut path = (*self.path).clone();
        path.extend(segments.iter().map(|s| s.to_string()));
        Manager {
            env: Arc::clone(&self.env),
            shared: Arc::clone(&self.shared),
            path: Arc::new(path),
            lint: self.lint,
        }
    }

    /// The dotted path label for logs and metrics.
    pub fn path_string(&self) -> String {
        self.path.join(".")
    }

    /// The constructor environment.
    pub fn environment(&self) -> &Arc<Environment> {
        &self.env
    }

    // ────────────────────────────────────────────────────────────────────
    // Component construction
    // ────────────────────────────────────────────────────────────────────

    /// Construct (and start) an input from a component fragment.
    pub fn new_input(&self, conf: &ComponentConfig) -> Result<InputHandle> {
        let scope = conf.label.as_deref().unwrap_or(&conf.type_name);
        self.env.build_input(conf, &self.into_path(&[scope]))
    }

    /// Construct (and start) an output from a component fragment.
    pub fn new_output(&self, conf: &ComponentConfig) -> Result<OutputHandle> {
        let scope = conf.label.as_deref().unwrap_or(&conf.type_name);
        self.env.build_output(conf, &self.into_path(&[scope]))
    }

    /// Construct a processor from a component fragment.
    pub fn new_processor(&self, conf: &ComponentConfig) -> Result<Arc<dyn Processor>> {
        let scope = conf.label.as_deref().unwrap_or(&conf.type_name);
        self.env.build_processor(conf, &self.into_path(&[scope]))
    }

    /// Construct a cache from a component fragment.
    pub fn new_cache(&self, conf: &ComponentConfig) -> Result<Arc<dyn Cache>> {
        self.env.build_cache(conf, self)
    }

    /// Construct a rate limit from a component fragment.
    pub fn new_rate_limit(&self, conf: &ComponentConfig) -> Result<Arc<dyn RateLimit>> {
        self.env.build_rate_limit(conf, self)
    }

    /// Construct a buffer from a component fragment.
    pub fn new_buffer(&self, conf: &ComponentConfig) -> Result<Box<dyn Buffer>> {
        self.env.build_buffer(conf, self)
    }

    /// Wire a configured buffer between a receiver and a fresh downstream
    /// channel.
    pub fn spawn_buffer(
        &self,
        conf: &ComponentConfig,
        rx: tokio::sync::mpsc::Receiver<virta_core::Transaction>,
    ) -> Result<BufferHandle> {
        Ok(self.new_buffer(conf)?.spawn(rx))
    }

    /// Build every resource declared in config, registering each by name.
    pub fn build_resources(&self, conf: &ResourcesConfig) -> Result<()> {
        for (name, cache_conf) in &conf.caches {
            let cache = self.new_cache(cache_conf)?;
            self.store_cache(name, cache);
        }
        for (name, rl_conf) in &conf.rate_limits {
            let rl = self.new_rate_limit(rl_conf)?;
            self.store_rate_limit(name, rl);
        }
        for (name, proc_conf) in &conf.processors {
            let proc = self.new_processor(proc_conf)?;
            self.store_processor(name, proc);
        }
        for (name, input_conf) in &conf.inputs {
            self.store_input_config(name, input_conf.clone());
        }
        for (name, output_conf) in &conf.outputs {
            self.store_output_config(name, output_conf.clone());
        }
        Ok(())
    }

    // ────────────────────────────────────────────────────────────────────
    // Named resources
    // ────────────────────────────────────────────────────────────────────

    /// Register a cache under a name.
    pub fn store_cache(&self, name: &str, cache: Arc<dyn Cache>) {
        tracing::info!(resource = %name, "cache registered");
        self.shared.caches.write().insert(name.to_string(), cache);
    }

    /// Register a rate limit under a name.
    pub fn store_rate_limit(&self, name: &str, rl: Arc<dyn RateLimit>) {
        tracing::info!(resource = %name, "rate limit registered");
        self.shared.rate_limits.write().insert(name.to_string(), rl);
    }

    /// Register a processor under a name.
    pub fn store_processor(&self, name: &str, proc: Arc<dyn Processor>) {
        tracing::info!(resource = %name, "processor registered");
        self.shared.processors.write().insert(name.to_string(), proc);
    }

    /// Register an input fragment under a name. Referents build their own
    /// instance from it.
    pub fn store_input_config(&self, name: &str, conf: ComponentConfig) {
        tracing::info!(resource = %name, "input resource registered");
        self.shared
            .input_configs
            .write()
            .insert(name.to_string(), conf);
    }

    /// Register an output fragment under a name.
    pub fn store_output_config(&self, name: &str, conf: ComponentConfig) {
        tracing::info!(resource = %name, "output resource registered");
        self.shared
            .output_configs
            .write()
            .insert(name.to_string(), conf);
    }

    /// The input fragment registered under a name.
    pub fn input_config(&self, name: &str) -> Result<ComponentConfig> {
        self.shared
            .input_configs
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::ResourceMissing(name.to_string()))
    }

    /// The output fragment registered under a name.
    pub fn output_config(&self, name: &str) -> Result<ComponentConfig> {
        self.shared
            .output_configs
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::ResourceMissing(name.to_string()))
    }

    /// Remove every named resource, in reverse dependency order.
    pub fn clear_resources(&self) {
        self.shared.output_configs.write().clear();
        self.shared.input_configs.write().clear();
        self.shared.processors.write().clear();
        self.shared.rate_limits.write().clear();
        self.shared.caches.write().clear();
    }

    /// Run a closure with a leased cache.
    ///
    /// A missing name yields [`Error::ResourceMissing`], distinguishable
    /// from operational errors of the cache itself.
    pub async fn access_cache<F, Fut, T>(&self, name: &str, f: F) -> Result<T>
    where
        F: FnOnce(Arc<dyn Cache>) -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        let cache = self
            .shared
            .caches
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::ResourceMissing(name.to_string()))?;
        Ok(f(cache).await)
    }

    /// Run a closure with a leased rate limit.
    pub async fn access_rate_limit<F, Fut, T>(&self, name: &str, f: F) -> Result<T>
    where
        F: FnOnce(Arc<dyn RateLimit>) -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        let rl = self
            .shared
            .rate_limits
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::ResourceMissing(name.to_string()))?;
        Ok(f(rl).await)
    }

    /// Run a closure with a leased named processor.
    pub async fn access_processor<F, Fut, T>(&self, name: &str, f: F) -> Result<T>
    where
        F: FnOnce(Arc<dyn Processor>) -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        let proc = self
            .shared
            .processors
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::ResourceMissing(name.to_string()))?;
        Ok(f(proc).await)
    }

    // ────────────────────────────────────────────────────────────────────
    // Dynamic broker controls
    // ────────────────────────────────────────────────────────────────────

    /// Register the dynamic fan-in control, making it reachable from the
    /// admin surface.
    pub fn set_dynamic_input_control(&self, control: DynamicInputControl) {
        *self.shared.dynamic_input.lock() = Some(control);
    }

    /// The dynamic fan-in control, if a dynamic input is running.
    pub fn dynamic_input_control(&self) -> Option<DynamicInputControl> {
        self.shared.dynamic_input.lock().clone()
    }

    /// Register the dynamic fan-out control.
    pub fn set_dynamic_output_control(&self, control: DynamicOutputControl) {
        *self.shared.dynamic_output.lock() = Some(control);
    }

    /// The dynamic fan-out control, if a dynamic output is running.
    pub fn dynamic_output_control(&self) -> Option<DynamicOutputControl> {
        self.shared.dynamic_output.lock().clone()
    }
}
