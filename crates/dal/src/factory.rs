//! Context factory
//!
//! Resolves an engine identifier against the static registry and builds an
//! unopened storage context. Construction never touches the network.

use tracing::debug;

use crate::config::{ConfigValidation, ContextOptions, DatabaseConfig};
use crate::context::StorageContext;
use crate::engine;
use crate::error::DalError;

/// Builds storage contexts for registered engines
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextFactory;

impl ContextFactory {
    /// Create a context for `engine_id` over `descriptor`
    ///
    /// Caller options are applied over the engine's defaults. Fails with
    /// `UnsupportedEngine` for unknown engines and `InvalidConfiguration` for
    /// empty or malformed descriptors.
    pub fn create(
        engine_id: &str,
        descriptor: &str,
        options: Option<ContextOptions>,
    ) -> Result<StorageContext, DalError> {
        let engine = engine::lookup(engine_id)?;

        let descriptor = descriptor.trim();
        if descriptor.is_empty() {
            return Err(DalError::invalid_config(
                "connection",
                descriptor,
                "Connection descriptor cannot be empty",
            ));
        }
        engine.validate_descriptor(descriptor)?;

        let resolved = options.unwrap_or_default().resolve(engine.defaults());
        if resolved.command_timeout.is_zero() {
            return Err(DalError::invalid_config(
                "command_timeout",
                format!("{:?}", resolved.command_timeout),
                "Command timeout must be greater than 0",
            ));
        }

        let session = engine.connect(descriptor, &resolved)?;
        debug!(
            engine = engine.id(),
            max_pool_size = resolved.max_pool_size,
            lazy_connect = resolved.lazy_connect,
            "Storage context created"
        );

        Ok(StorageContext::new(engine, session, resolved))
    }

    /// Create a context from a database configuration
    ///
    /// `options` override what the configuration carries.
    pub fn create_from_config(
        config: &DatabaseConfig,
        options: Option<ContextOptions>,
    ) -> Result<StorageContext, DalError> {
        config.validate()?;
        let options = ContextOptions::from_config(config).merge(options.unwrap_or_default());
        Self::create(&config.engine, &config.connection, Some(options))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemoryStore;
    use crate::error::ErrorKind;
    use std::time::Duration;

    #[test]
    fn test_create_is_lazy() {
        MemoryStore::forget("factory-lazy");
        let context = ContextFactory::create("memory", "memory:factory-lazy", None).unwrap();

        assert_eq!(context.engine(), "memory");
        assert!(!context.is_open());
        assert_eq!(MemoryStore::named("factory-lazy").opened_total(), 0);
    }

    #[test]
    fn test_create_rejects_bad_input() {
        let err = ContextFactory::create("oracle-legacy", "memory:x", None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedEngine);

        let err = ContextFactory::create("memory", "  ", None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfiguration);

        let err = ContextFactory::create("memory", "orders", None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfiguration);

        let options = ContextOptions::new().command_timeout(Duration::ZERO);
        let err = ContextFactory::create("memory", "memory:x", Some(options)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfiguration);
    }

    #[test]
    fn test_options_apply_over_defaults() {
        let options = ContextOptions::new().command_timeout(Duration::from_secs(3));
        let context = ContextFactory::create("MEMORY", "memory:factory-opts", Some(options)).unwrap();

        assert_eq!(context.options().command_timeout, Duration::from_secs(3));
        assert_eq!(context.options().max_pool_size, 1);
    }

    #[test]
    fn test_create_from_config_merges_overrides() {
        let config = DatabaseConfig::new("memory", "memory:factory-config", 2, 10)
            .unwrap()
            .with_max_pool_size(4);
        let overrides = ContextOptions::new().command_timeout(Duration::from_secs(1));
        let context = ContextFactory::create_from_config(&config, Some(overrides)).unwrap();

        assert_eq!(context.options().max_pool_size, 4);
        assert_eq!(context.options().command_timeout, Duration::from_secs(1));
    }
}
