// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Supervisor
//!
//! `Client` owns the broker connection. A background task waits for the
//! connection to drop, redials and swaps the new one in under the write lock.
//! Consumers and publishers never hold on to a connection: they ask the
//! client for the current one each time they open a sub-channel, and treat
//! `AmqpError::ConnectionClosed` as "wait for the supervisor".
//!
//! Shutdown is cooperative. `Client::close` cancels the shared token, waits
//! for every supervision task and in-flight handler to finish, then closes
//! the connection.

use crate::{
    channel::Connection,
    config::ClientOptions,
    consumer::{self, ConsumerOptions},
    dial::Dialer,
    errors::{AmqpError, ConsumerError},
    handler::Handler,
    hook::{ConsumeHook, PublishHook},
    log::LogFunc,
    publisher::{Publisher, PublisherOptions},
};
use parking_lot::RwLock;
use std::{mem, sync::Arc, time::Duration};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, warn};

/// State shared by the client and everything it spawned.
pub(crate) struct Shared {
    conn: RwLock<Arc<dyn Connection>>,
    pub(crate) done: CancellationToken,
    pub(crate) tracker: TaskTracker,
    pub(crate) logger: LogFunc,
    pub(crate) consume_hooks: Vec<Arc<dyn ConsumeHook>>,
    pub(crate) publish_hooks: Vec<Arc<dyn PublishHook>>,
    pub(crate) reconnect_delay: Duration,
}

impl Shared {
    /// The active connection, `ConnectionClosed` while it is being replaced
    /// or after shutdown.
    pub(crate) fn connection(&self) -> Result<Arc<dyn Connection>, AmqpError> {
        if self.done.is_cancelled() {
            return Err(AmqpError::ConnectionClosed);
        }

        let conn = self.conn.read().clone();
        if conn.is_closed() {
            return Err(AmqpError::ConnectionClosed);
        }
        Ok(conn)
    }

    /// Replaces the active connection, returns the previous one.
    fn swap(&self, conn: Arc<dyn Connection>) -> Arc<dyn Connection> {
        mem::replace(&mut *self.conn.write(), conn)
    }

    async fn supervise(self: Arc<Self>, dialer: Arc<dyn Dialer>) {
        let mut closed = self.conn.read().notify_close();

        loop {
            tokio::select! {
                _ = self.done.cancelled() => return,
                err = closed.recv() => {
                    let err = err.unwrap_or(AmqpError::ConnectionClosed);
                    warn!(error = err.to_string(), "amqp connection lost, redialing");
                }
            }

            let conn = match dialer.dial(&self.done).await {
                Ok(conn) => conn,
                Err(err) => {
                    debug!(error = err.to_string(), "supervisor stopped while redialing");
                    return;
                }
            };

            closed = conn.notify_close();
            let old = self.swap(conn);
            if let Err(err) = old.close().await {
                debug!(error = err.to_string(), "closing the replaced connection");
            }
            debug!("amqp connection replaced");
        }
    }
}

/// A supervised broker connection.
pub struct Client {
    shared: Arc<Shared>,
}

impl Client {
    /// Dials the broker once, bounded by the connect timeout, and starts the
    /// supervisor.
    ///
    /// # Parameters
    /// * `opts` - Broker address, credentials, hooks and log sink
    ///
    /// # Returns
    /// The client, or the error of the first dial. There is no retry before
    /// the first connection succeeds.
    pub async fn connect(opts: ClientOptions) -> Result<Client, AmqpError> {
        let dialer = opts.validate()?;

        let dialing = CancellationToken::new();
        let conn = tokio::select! {
            conn = dialer.dial(&dialing) => conn?,
            _ = tokio::time::sleep(opts.connect_timeout) => {
                dialing.cancel();
                return Err(AmqpError::ConnectTimeout);
            }
        };

        let shared = Arc::new(Shared {
            conn: RwLock::new(conn),
            done: CancellationToken::new(),
            tracker: TaskTracker::new(),
            logger: opts.logger,
            consume_hooks: opts.consume_hooks,
            publish_hooks: opts.publish_hooks,
            reconnect_delay: opts.reconnect_delay,
        });

        shared.tracker.spawn(shared.clone().supervise(dialer));

        Ok(Client { shared })
    }

    /// Starts consuming `queue` with `handler`.
    ///
    /// The first sub-channel is opened before returning, a failure there is
    /// returned and nothing keeps running. Later channel losses are recovered
    /// in the background.
    ///
    /// # Parameters
    /// * `queue` - Queue to consume
    /// * `handler` - Raw or typed handler run for every delivery
    /// * `opts` - Tag, acknowledgment mode, limits, topology and hooks
    ///
    /// # Returns
    /// A ConsumerError naming the queue and consumer tag on failure
    pub async fn new_consumer(
        &self,
        queue: &str,
        handler: Handler,
        opts: ConsumerOptions,
    ) -> Result<(), ConsumerError> {
        consumer::start(self.shared.clone(), queue, handler, opts).await
    }

    /// Creates a publisher on `exchange`.
    ///
    /// Setup failures are not returned here, every `publish` reports them
    /// until the background task manages to open a channel.
    ///
    /// # Parameters
    /// * `exchange` - Exchange every message goes to, empty for the default one
    /// * `opts` - Marshaler, confirm mode, routing defaults and hooks
    pub async fn new_publisher<T>(&self, exchange: &str, opts: PublisherOptions<T>) -> Publisher<T>
    where
        T: Send + Sync + 'static,
    {
        Publisher::new(self.shared.clone(), exchange, opts).await
    }

    /// Stops every consumer and publisher, waits for in-flight handlers and
    /// closes the connection.
    pub async fn close(&self) -> Result<(), AmqpError> {
        self.shared.done.cancel();
        self.shared.tracker.close();
        self.shared.tracker.wait().await;

        let conn = self.shared.conn.read().clone();
        conn.close().await
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shared.done.cancel();
    }
}
