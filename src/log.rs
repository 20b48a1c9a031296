// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Sink for failures that happen in background tasks, where there is no
//! caller left to return an error to.

use std::{error::Error, sync::Arc};
use tracing::error;

/// Receives runtime failures from supervision and handler tasks.
pub type LogFunc = Arc<dyn Fn(&(dyn Error + 'static)) + Send + Sync>;

/// The default sink, forwarding every failure as a `tracing` error event.
pub fn tracing_sink() -> LogFunc {
    Arc::new(|err: &(dyn Error + 'static)| {
        error!(error = err.to_string(), "amqp runtime failure");
    })
}

/// A sink that drops everything.
pub fn noop() -> LogFunc {
    Arc::new(|_: &(dyn Error + 'static)| {})
}
