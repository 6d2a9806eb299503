//! Turning configuration into a ready-to-start [`Daemon`].
//!
//! The order is fixed: load and validate configuration, install logging,
//! connect to the broker when `amqp_uri` is set, then build the server. The
//! first failing step ends bootstrap, and the [`HealthReporter`] hears about
//! it before the caller does.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ortho_config::{OrthoConfig, OrthoError};
use thiserror::Error;

use courier_config::{BrokerUri, Config, ConfigError};

use crate::broker::{AmqpTransport, BrokerError, BrokerTransport, ConnectionObserver};
use crate::health::{BrokerHealth, HealthReporter, ServingSummary};
use crate::orchestrator::LifecycleHooks;
use crate::server::{RpcServer, RpcServerBuilder, ServerError};
use crate::telemetry::{self, TelemetryError, TelemetryHandle};

/// Source of the daemon's [`Config`].
pub trait ConfigLoader: Send + Sync {
    /// Produces the configuration, unvalidated.
    fn load(&self) -> Result<Config, Arc<OrthoError>>;
}

/// Reads CLI flags, `COURIER_*` variables and the config file.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemConfigLoader;

impl ConfigLoader for SystemConfigLoader {
    fn load(&self) -> Result<Config, Arc<OrthoError>> {
        Config::load()
    }
}

/// Loader returning a configuration resolved elsewhere.
#[derive(Debug, Clone)]
pub struct StaticConfigLoader {
    config: Config,
}

impl StaticConfigLoader {
    /// Wraps `config`.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

impl ConfigLoader for StaticConfigLoader {
    fn load(&self) -> Result<Config, Arc<OrthoError>> {
        Ok(self.config.clone())
    }
}

/// Opens the broker transport named in the configuration.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Connects to `uri`. Lost connections are retried after
    /// `reconnect_delay` and reported to `observer`.
    async fn connect(
        &self,
        uri: &BrokerUri,
        reconnect_delay: Duration,
        observer: Arc<dyn ConnectionObserver>,
    ) -> Result<Arc<dyn BrokerTransport>, BrokerError>;
}

/// Connector backed by [`AmqpTransport`].
#[derive(Debug, Default, Clone, Copy)]
pub struct AmqpConnector;

#[async_trait]
impl BrokerConnector for AmqpConnector {
    async fn connect(
        &self,
        uri: &BrokerUri,
        reconnect_delay: Duration,
        observer: Arc<dyn ConnectionObserver>,
    ) -> Result<Arc<dyn BrokerTransport>, BrokerError> {
        let transport = AmqpTransport::connect(uri, reconnect_delay, observer).await?;
        Ok(Arc::new(transport))
    }
}

/// The step at which bootstrap stopped.
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// Flags, environment or config file could not be parsed.
    #[error("failed to load configuration: {source}")]
    Configuration {
        /// Loader diagnostic.
        #[source]
        source: Arc<OrthoError>,
    },
    /// Configuration loaded but is not usable.
    #[error("invalid configuration: {source}")]
    InvalidConfiguration {
        /// Violated constraint.
        #[source]
        source: ConfigError,
    },
    /// Logging could not be installed.
    #[error("failed to initialise telemetry: {source}")]
    Telemetry {
        /// Filter or subscriber problem.
        #[source]
        source: TelemetryError,
    },
    /// The broker could not be reached.
    #[error("failed to connect to broker: {source}")]
    Broker {
        /// Underlying transport error.
        #[source]
        source: BrokerError,
    },
    /// The server could not be built.
    #[error("failed to build server: {source}")]
    Server {
        /// Underlying server error.
        #[source]
        source: ServerError,
    },
}

/// A configured, not yet started server plus what it was built from.
pub struct Daemon {
    config: Arc<Config>,
    server: RpcServer,
    telemetry: TelemetryHandle,
    reporter: Arc<dyn HealthReporter>,
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Daemon")
            .field("config", &self.config)
            .field("server", &self.server)
            .finish_non_exhaustive()
    }
}

impl Daemon {
    /// Validated configuration.
    #[must_use]
    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// The server; register handlers on it before [`Daemon::run`].
    #[must_use]
    pub fn server(&self) -> &RpcServer {
        &self.server
    }

    /// Logging actually in effect.
    #[must_use]
    pub fn telemetry(&self) -> TelemetryHandle {
        self.telemetry
    }

    /// Starts the server, waits for `shutdown` and stops it again, telling
    /// the reporter what is being served and how it ended.
    ///
    /// # Errors
    ///
    /// Propagates start and stop failures.
    pub async fn run<F>(&self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        self.server.start().await?;
        let orchestrator = self.server.orchestrator();
        self.reporter.serving(&ServingSummary {
            display_name: self.server.display_name().to_owned(),
            queue: orchestrator.broker_queue(),
            handlers: orchestrator.registered_keys(),
        });
        shutdown.await;
        let name = self.server.display_name();
        match self.server.stop().await {
            Ok(()) => {
                self.reporter.stopped(name);
                Ok(())
            }
            Err(error) => {
                self.reporter.stop_failed(name, &error);
                Err(error)
            }
        }
    }
}

fn failed(reporter: &dyn HealthReporter, error: BootstrapError) -> BootstrapError {
    reporter.bootstrap_failed(&error);
    error
}

/// Builds a [`Daemon`] from explicit collaborators.
///
/// # Errors
///
/// Returns the first failing step; `reporter` has already seen it.
pub async fn bootstrap_with<C>(
    loader: &dyn ConfigLoader,
    reporter: Arc<dyn HealthReporter>,
    connector: &C,
    hooks: LifecycleHooks,
) -> Result<Daemon, BootstrapError>
where
    C: BrokerConnector + ?Sized,
{
    reporter.bootstrap_starting();

    let config = loader
        .load()
        .map_err(|source| failed(&*reporter, BootstrapError::Configuration { source }))?;
    config.validate().map_err(|source| {
        failed(&*reporter, BootstrapError::InvalidConfiguration { source })
    })?;

    let telemetry = telemetry::initialise(&config)
        .map_err(|source| failed(&*reporter, BootstrapError::Telemetry { source }))?;

    let uri = config.broker_uri().map_err(|source| {
        failed(
            &*reporter,
            BootstrapError::InvalidConfiguration {
                source: source.into(),
            },
        )
    })?;

    let mut builder = RpcServerBuilder::from_config(&config).hooks(hooks);
    if let Some(uri) = uri {
        let endpoint = uri.to_string();
        reporter.broker_connecting(&endpoint);
        let observer = Arc::new(BrokerHealth::new(Arc::clone(&reporter)));
        match connector
            .connect(&uri, config.reconnect_delay(), observer)
            .await
        {
            Ok(transport) => {
                reporter.broker_ready(&endpoint);
                builder = builder.transport(transport);
            }
            Err(source) => {
                reporter.broker_failed(&endpoint, &source);
                return Err(failed(&*reporter, BootstrapError::Broker { source }));
            }
        }
    }

    let server = builder
        .build()
        .map_err(|source| failed(&*reporter, BootstrapError::Server { source }))?;
    reporter.bootstrap_succeeded(&config);

    Ok(Daemon {
        config: Arc::new(config),
        server,
        telemetry,
        reporter,
    })
}

/// Bootstraps with the system configuration, `tracing` health reporting and
/// an AMQP broker when one is configured.
///
/// # Errors
///
/// See [`bootstrap_with`].
pub async fn bootstrap(
    reporter: Arc<dyn HealthReporter>,
    hooks: LifecycleHooks,
) -> Result<Daemon, BootstrapError> {
    bootstrap_with(&SystemConfigLoader, reporter, &AmqpConnector, hooks).await
}
