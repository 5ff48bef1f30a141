//! Per-process service context.
//!
//! Built once at startup and passed to whatever needs a client or a server.

use std::sync::Arc;

use tracing::info;

use crate::broker::{init_broker, Broker, BrokerError};
use crate::client::RpcClient;
use crate::config::{Config, ConfigError};
use crate::server::RpcServer;
use crate::topology::{Topology, TopologyError};
use crate::utils::bootstrap::{connect_with_retry, CONNECT_ATTEMPTS};

/// Errors raised while bringing a service up.
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Broker unavailable: {0}")]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Topology(#[from] TopologyError),
}

/// Shared connection, topology and configuration of one service process.
#[derive(Clone)]
pub struct ServiceContext {
    service: String,
    config: Arc<Config>,
    broker: Arc<dyn Broker>,
    topology: Topology,
}

impl ServiceContext {
    /// Validate `config`, connect to the configured broker and declare the
    /// shared exchange.
    pub async fn connect(service: impl Into<String>, config: Config) -> Result<Self, ContextError> {
        config.validate()?;
        let messaging = &config.messaging;
        let broker =
            connect_with_retry("broker", CONNECT_ATTEMPTS, move || init_broker(messaging)).await?;
        Self::with_broker(service, config, broker).await
    }

    /// Build a context over an already connected broker.
    pub async fn with_broker(
        service: impl Into<String>,
        config: Config,
        broker: Arc<dyn Broker>,
    ) -> Result<Self, ContextError> {
        let service = service.into();
        let topology = Topology::new(&config.topology);
        topology.declare(broker.as_ref()).await?;

        info!(
            service = %service,
            exchange = %topology.exchange(),
            "Service context ready"
        );

        Ok(Self {
            service,
            config: Arc::new(config),
            broker,
            topology,
        })
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn broker(&self) -> Arc<dyn Broker> {
        Arc::clone(&self.broker)
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// New client with its own reply queue.
    pub fn client(&self) -> RpcClient {
        RpcClient::new(
            self.broker(),
            self.topology.clone(),
            self.config.client.clone(),
        )
    }

    /// New server for this service's operations.
    pub fn server(&self) -> RpcServer {
        RpcServer::new(
            self.broker(),
            self.topology.clone(),
            self.config.server.clone(),
            self.service.clone(),
        )
    }
}
