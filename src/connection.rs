// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection Management
//!
//! This module handles the creation of AMQP connections and the connector that channel
//! groups use to declare their topology and open one session per channel.

use crate::{
    configuration::ChannelGroupConfiguration,
    errors::ChannelError,
    group::ChannelConnector,
    session::AmqpSession,
    topology::AmqpTopology,
    transport::TransportSession,
};
use async_trait::async_trait;
use lapin::{types::LongString, Connection, ConnectionProperties};
use serde::Deserialize;
use std::{env, sync::Arc};
use tracing::{debug, error};

/// Settings used to reach the RabbitMQ server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    /// Name the connection is advertised with
    pub app_name: String,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        ConnectionSettings {
            host: "localhost".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: String::new(),
            app_name: "amqp-channel".to_owned(),
        }
    }
}

impl ConnectionSettings {
    /// Reads the settings from `RABBITMQ_HOST`, `RABBITMQ_PORT`, `RABBITMQ_USER`,
    /// `RABBITMQ_PASSWORD`, `RABBITMQ_VHOST` and `APP_NAME`, falling back to the defaults.
    pub fn from_env() -> Result<Self, ChannelError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ChannelError> {
        let mut settings = ConnectionSettings::default();

        if let Some(host) = lookup("RABBITMQ_HOST") {
            settings.host = host;
        }
        if let Some(port) = lookup("RABBITMQ_PORT") {
            settings.port = port
                .parse()
                .map_err(|_| ChannelError::Argument(format!("RABBITMQ_PORT={port}")))?;
        }
        if let Some(user) = lookup("RABBITMQ_USER") {
            settings.user = user;
        }
        if let Some(password) = lookup("RABBITMQ_PASSWORD") {
            settings.password = password;
        }
        if let Some(vhost) = lookup("RABBITMQ_VHOST") {
            settings.vhost = vhost;
        }
        if let Some(app_name) = lookup("APP_NAME") {
            settings.app_name = app_name;
        }

        Ok(settings)
    }

    /// AMQP URI built from the settings.
    pub fn uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.vhost
        )
    }

    /// Establishes a connection to RabbitMQ.
    pub async fn connect(&self) -> Result<Connection, ChannelError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.app_name.clone()));

        match Connection::connect(&self.uri(), options).await {
            Ok(conn) => {
                debug!("amqp connected");
                Ok(conn)
            }
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(ChannelError::ConnectionError)
            }
        }
    }
}

/// Connector opening lapin sessions over one shared connection.
pub struct AmqpConnector {
    connection: Arc<Connection>,
}

impl AmqpConnector {
    /// Wraps an established connection.
    pub fn new(connection: Arc<Connection>) -> Self {
        AmqpConnector { connection }
    }

    /// Connects to the broker described by `settings`.
    pub async fn connect(settings: &ConnectionSettings) -> Result<Self, ChannelError> {
        Ok(AmqpConnector::new(Arc::new(settings.connect().await?)))
    }

    async fn create_channel(&self) -> Result<lapin::Channel, ChannelError> {
        debug!("creating amqp channel...");
        match self.connection.create_channel().await {
            Ok(channel) => {
                debug!("channel created");
                Ok(channel)
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(ChannelError::ChannelError)
            }
        }
    }
}

#[async_trait]
impl ChannelConnector for AmqpConnector {
    async fn initialize(
        &self,
        config: &ChannelGroupConfiguration,
    ) -> Result<ChannelGroupConfiguration, ChannelError> {
        let channel = self.create_channel().await?;
        let topology = AmqpTopology::from_configuration(config);
        let queue = topology.install(&channel).await;

        if let Err(err) = channel.close(200, "topology declared").await {
            debug!(error = err.to_string(), "failure to close the topology channel");
        }

        Ok(match queue? {
            Some(name) => config.with_resolved_input_queue(&name),
            None => config.clone(),
        })
    }

    async fn open_session(&self) -> Result<Arc<dyn TransportSession>, ChannelError> {
        Ok(Arc::new(AmqpSession::new(self.create_channel().await?)))
    }
}
