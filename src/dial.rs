// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Dialing the Broker
//!
//! A `Dialer` produces a live `Connection`. The lapin-backed `AmqpDialer`
//! retries with a fixed delay until it succeeds or the shutdown token fires.

use crate::{
    channel::{Connection, LapinConnection},
    errors::AmqpError,
    log::LogFunc,
};
use async_trait::async_trait;
use lapin::{types::LongString, uri::AMQPUri, ConnectionProperties};
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Delay between two dial attempts.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(4);

/// Produces broker connections.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Dials until a connection is established or `done` is canceled.
    async fn dial(&self, done: &CancellationToken) -> Result<Arc<dyn Connection>, AmqpError>;
}

/// Dials a RabbitMQ broker with lapin.
pub struct AmqpDialer {
    pub(crate) uri: AMQPUri,
    pub(crate) connection_name: Option<String>,
    pub(crate) reconnect_delay: Duration,
    pub(crate) logger: LogFunc,
}

impl AmqpDialer {
    fn properties(&self) -> ConnectionProperties {
        let properties = ConnectionProperties::default();
        match &self.connection_name {
            Some(name) => properties.with_connection_name(LongString::from(name.clone())),
            None => properties,
        }
    }
}

#[async_trait]
impl Dialer for AmqpDialer {
    async fn dial(&self, done: &CancellationToken) -> Result<Arc<dyn Connection>, AmqpError> {
        loop {
            debug!(
                host = %self.uri.authority.host,
                port = self.uri.authority.port,
                "creating amqp connection..."
            );

            let err = match lapin::Connection::connect_uri(self.uri.clone(), self.properties())
                .await
            {
                Ok(conn) => {
                    debug!("amqp connected");
                    return Ok(Arc::new(LapinConnection::new(conn)));
                }
                Err(err) => AmqpError::ConnectionError(err.to_string()),
            };
            (self.logger)(&err);

            tokio::select! {
                _ = done.cancelled() => return Err(err),
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }
        }
    }
}
