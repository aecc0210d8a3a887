//! # DAL Container
//!
//! Binds one storage context, its unit-of-work factory and the configuration
//! it was built from to a single logical scope, typically one request or job.

use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{ConfigValidation, ContextOptions, DatabaseConfig};
use crate::context::StorageContext;
use crate::error::DalError;
use crate::factory::ContextFactory;
use crate::retry::RetryPolicy;
use crate::unit_of_work::UnitOfWork;

/// Per-scope handle to the data-access layer
#[derive(Debug)]
pub struct DalContainer {
    config: DatabaseConfig,
    context: StorageContext,
    scope_id: Uuid,
}

impl DalContainer {
    /// Validate `config` and build an unopened context for it
    pub fn new(config: DatabaseConfig) -> Result<Self, DalError> {
        Self::build(config, None)
    }

    /// Like `new`, with caller options applied over the configuration
    ///
    /// Never opens a connection; use `connect_with_options` to honour
    /// `lazy_connect(false)`.
    pub fn with_options(config: DatabaseConfig, options: ContextOptions) -> Result<Self, DalError> {
        Self::build(config, Some(options))
    }

    /// Build the container and open the connection now unless it resolves lazy
    pub async fn connect(config: DatabaseConfig) -> Result<Self, DalError> {
        Self::connect_inner(config, None).await
    }

    /// Like `connect`, with caller options applied over the configuration
    pub async fn connect_with_options(
        config: DatabaseConfig,
        options: ContextOptions,
    ) -> Result<Self, DalError> {
        Self::connect_inner(config, Some(options)).await
    }

    async fn connect_inner(
        config: DatabaseConfig,
        options: Option<ContextOptions>,
    ) -> Result<Self, DalError> {
        let container = Self::build(config, options)?;
        if !container.context.options().lazy_connect {
            container.context.open().await?;
        }
        Ok(container)
    }

    fn build(config: DatabaseConfig, options: Option<ContextOptions>) -> Result<Self, DalError> {
        for warning in config.warnings() {
            warn!(engine = %config.engine, "{warning}");
        }

        let context = ContextFactory::create_from_config(&config, options)?;
        let scope_id = Uuid::new_v4();
        info!(
            scope_id = %scope_id,
            engine = context.engine(),
            max_retry_attempts = config.max_retry_attempts,
            command_timeout_secs = config.command_timeout_secs,
            "DAL container created"
        );

        Ok(Self {
            config,
            context,
            scope_id,
        })
    }

    pub fn storage_context(&self) -> &StorageContext {
        &self.context
    }

    /// Open a unit of work on this container's context
    pub fn new_unit_of_work(&self) -> Result<UnitOfWork<'_>, DalError> {
        UnitOfWork::begin(&self.context)
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Retry policy matching the configuration; callers decide where to apply it
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from_config(&self.config)
    }

    /// Identifier correlating log lines emitted within this scope
    pub fn scope_id(&self) -> Uuid {
        self.scope_id
    }

    /// Release the storage context at scope end
    pub async fn dispose(&self) {
        self.context.dispose().await;
        info!(scope_id = %self.scope_id, "DAL container disposed");
    }
}
