// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Gzip body compression.
//!
//! On publish the body is compressed and the content-encoding set to `gzip`.
//! On consume, gzip-encoded bodies are inflated before the handler runs; a
//! body that does not inflate is logged and rejected.

use crate::{
    delivery::{Action, Delivery},
    errors::{AmqpError, DeliveryError},
    handler::Consume,
    hook::{ConsumeHook, PublishHook},
    publisher::{Publish, PublishRequest},
};
use async_trait::async_trait;
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use std::{
    io::{Read, Write},
    sync::Arc,
};

pub const GZIP_ENCODING: &str = "gzip";

/// Compresses published bodies and inflates consumed ones.
#[derive(Debug, Clone, Copy, Default)]
pub struct GzipHook {
    level: Compression,
}

impl GzipHook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compression level from 0 (none) to 9 (best).
    pub fn level(mut self, level: u32) -> Self {
        self.level = Compression::new(level.min(9));
        self
    }
}

fn compress(body: &[u8], level: Compression) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(body.len() / 2), level);
    encoder.write_all(body)?;
    encoder.finish()
}

fn inflate(body: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(body.len() * 2);
    GzDecoder::new(body).read_to_end(&mut out)?;
    Ok(out)
}

impl ConsumeHook for GzipHook {
    fn wrap_consume(&self, next: Arc<dyn Consume>) -> Arc<dyn Consume> {
        Arc::new(Inflate { next })
    }
}

impl PublishHook for GzipHook {
    fn wrap_publish(&self, next: Arc<dyn Publish>) -> Arc<dyn Publish> {
        Arc::new(Deflate {
            level: self.level,
            next,
        })
    }
}

struct Inflate {
    next: Arc<dyn Consume>,
}

#[async_trait]
impl Consume for Inflate {
    async fn serve(&self, delivery: &mut Delivery) -> Action {
        if delivery.info.content_encoding() != GZIP_ENCODING {
            return self.next.serve(delivery).await;
        }

        match inflate(&delivery.body) {
            Ok(body) => delivery.body = body,
            Err(err) => {
                delivery.log(&DeliveryError {
                    exchange: delivery.info.exchange.clone(),
                    routing_key: delivery.info.routing_key.clone(),
                    message: format!("gzip: {err}"),
                });
                return Action::Reject;
            }
        }

        self.next.serve(delivery).await
    }
}

struct Deflate {
    level: Compression,
    next: Arc<dyn Publish>,
}

#[async_trait]
impl Publish for Deflate {
    async fn publish(&self, request: &mut PublishRequest) -> Result<(), AmqpError> {
        request.body = compress(&request.body, self.level)
            .map_err(|err| AmqpError::HookError(format!("gzip: {err}")))?;
        request.set_content_encoding(GZIP_ENCODING);

        self.next.publish(request).await
    }
}
