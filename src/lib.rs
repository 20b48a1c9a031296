// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod consumer;
mod topology;

pub mod channel;
pub mod client;
pub mod config;
pub mod delivery;
pub mod dial;
pub mod errors;
pub mod exchange;
pub mod gzip;
pub mod handler;
pub mod hook;
pub mod log;
pub mod marshal;
pub mod otel;
pub mod pool;
pub mod publisher;
pub mod queue;

#[cfg(test)]
mod testing;

pub use client::Client;
pub use config::ClientOptions;
pub use consumer::ConsumerOptions;
pub use delivery::{Action, Delivery, DeliveryInfo};
pub use errors::{AmqpError, ConsumerError, DeliveryError, PublishError, ReturnError};
pub use handler::{Consume, Envelope, Handler, TypedHandler};
pub use hook::{ConsumeHook, PublishHook};
pub use publisher::{
    Publish, PublishOptions, PublishRequest, Publisher, PublisherOptions, Publishing,
};
