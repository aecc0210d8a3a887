//! Context options applied by the factory after engine defaults.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::types::DatabaseConfig;

/// Command timeout used when a context is created without a config
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Summary of one successful flush, handed to the tracing hook
#[derive(Debug, Clone)]
pub struct FlushReport {
    pub engine: &'static str,
    pub mutations: usize,
    pub affected: u64,
    pub elapsed: Duration,
}

/// Callback invoked after every successful flush
pub type FlushHook = Arc<dyn Fn(&FlushReport) + Send + Sync>;

/// Defaults an engine applies before caller options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineDefaults {
    pub max_pool_size: u32,
    pub lazy_connect: bool,
}

/// Caller-supplied context configuration; unset fields keep engine defaults
#[derive(Clone, Default)]
pub struct ContextOptions {
    max_pool_size: Option<u32>,
    lazy_connect: Option<bool>,
    command_timeout: Option<Duration>,
    flush_hook: Option<FlushHook>,
}

impl ContextOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Options carried by a validated database configuration
    pub fn from_config(config: &DatabaseConfig) -> Self {
        Self {
            max_pool_size: config.max_pool_size,
            lazy_connect: Some(config.lazy_connect),
            command_timeout: Some(config.command_timeout()),
            flush_hook: None,
        }
    }

    pub fn max_pool_size(mut self, size: u32) -> Self {
        self.max_pool_size = Some(size);
        self
    }

    pub fn lazy_connect(mut self, lazy: bool) -> Self {
        self.lazy_connect = Some(lazy);
        self
    }

    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = Some(timeout);
        self
    }

    pub fn on_flush<F>(mut self, hook: F) -> Self
    where
        F: Fn(&FlushReport) + Send + Sync + 'static,
    {
        self.flush_hook = Some(Arc::new(hook));
        self
    }

    /// Layer `overrides` on top of these options
    pub fn merge(self, overrides: ContextOptions) -> Self {
        Self {
            max_pool_size: overrides.max_pool_size.or(self.max_pool_size),
            lazy_connect: overrides.lazy_connect.or(self.lazy_connect),
            command_timeout: overrides.command_timeout.or(self.command_timeout),
            flush_hook: overrides.flush_hook.or(self.flush_hook),
        }
    }

    /// Apply these options over engine defaults
    pub fn resolve(self, defaults: EngineDefaults) -> ResolvedOptions {
        ResolvedOptions {
            max_pool_size: self.max_pool_size.unwrap_or(defaults.max_pool_size).max(1),
            lazy_connect: self.lazy_connect.unwrap_or(defaults.lazy_connect),
            command_timeout: self.command_timeout.unwrap_or(DEFAULT_COMMAND_TIMEOUT),
            flush_hook: self.flush_hook,
        }
    }
}

impl fmt::Debug for ContextOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextOptions")
            .field("max_pool_size", &self.max_pool_size)
            .field("lazy_connect", &self.lazy_connect)
            .field("command_timeout", &self.command_timeout)
            .field("flush_hook", &self.flush_hook.is_some())
            .finish()
    }
}

/// Options after engine defaults and caller overrides are combined
#[derive(Clone)]
pub struct ResolvedOptions {
    pub max_pool_size: u32,
    pub lazy_connect: bool,
    pub command_timeout: Duration,
    pub flush_hook: Option<FlushHook>,
}

impl fmt::Debug for ResolvedOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedOptions")
            .field("max_pool_size", &self.max_pool_size)
            .field("lazy_connect", &self.lazy_connect)
            .field("command_timeout", &self.command_timeout)
            .field("flush_hook", &self.flush_hook.is_some())
            .finish()
    }
}
