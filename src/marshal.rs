// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Payload Encoding
//!
//! Publishers encode payloads with a `Marshaler`, typed consumer handlers
//! decode bodies with the `Unmarshaler` registered for the delivery's
//! content-type. Both are traits over the payload type so that any serde
//! format, or a hand-written one, can be plugged in.

use crate::errors::AmqpError;
use serde::{de::DeserializeOwned, Serialize};
use std::{any::Any, collections::HashMap, sync::Arc};

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// Content type of raw byte payloads
pub const BYTES_CONTENT_TYPE: &str = "application/octet-stream";

pub trait Marshaler<T>: Send + Sync {
    fn content_type(&self) -> &str;

    fn marshal(&self, value: &T) -> Result<Vec<u8>, AmqpError>;
}

pub trait Unmarshaler<T>: Send + Sync {
    fn content_type(&self) -> &str;

    /// Decodes `body` into `value`, which may hold a previously reset value.
    fn unmarshal(&self, body: &[u8], value: &mut T) -> Result<(), AmqpError>;
}

/// Unmarshalers of one payload type, keyed by content type.
pub struct Unmarshalers<T> {
    by_content_type: HashMap<String, Arc<dyn Unmarshaler<T>>>,
}

impl<T> Unmarshalers<T> {
    pub fn new() -> Self {
        Unmarshalers {
            by_content_type: HashMap::default(),
        }
    }

    /// Registers `unmarshaler`, replacing any previous one for its content type.
    pub fn register(&mut self, unmarshaler: Arc<dyn Unmarshaler<T>>) {
        self.by_content_type
            .insert(unmarshaler.content_type().to_owned(), unmarshaler);
    }

    /// The unmarshaler registered for `content_type`.
    pub fn get(&self, content_type: &str) -> Option<&Arc<dyn Unmarshaler<T>>> {
        self.by_content_type.get(content_type)
    }

    pub fn is_empty(&self) -> bool {
        self.by_content_type.is_empty()
    }
}

impl<T> Default for Unmarshalers<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// JSON through serde_json.
#[derive(Debug, Clone, Copy, Default)]
pub struct Json;

impl<T: Serialize> Marshaler<T> for Json {
    fn content_type(&self) -> &str {
        JSON_CONTENT_TYPE
    }

    fn marshal(&self, value: &T) -> Result<Vec<u8>, AmqpError> {
        serde_json::to_vec(value).map_err(|err| AmqpError::MarshalError(err.to_string()))
    }
}

impl<T: DeserializeOwned> Unmarshaler<T> for Json {
    fn content_type(&self) -> &str {
        JSON_CONTENT_TYPE
    }

    fn unmarshal(&self, body: &[u8], value: &mut T) -> Result<(), AmqpError> {
        *value = serde_json::from_slice(body)
            .map_err(|err| AmqpError::ParsePayloadError(err.to_string()))?;
        Ok(())
    }
}

/// Passes byte payloads through untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct Bytes;

impl Marshaler<Vec<u8>> for Bytes {
    fn content_type(&self) -> &str {
        BYTES_CONTENT_TYPE
    }

    fn marshal(&self, value: &Vec<u8>) -> Result<Vec<u8>, AmqpError> {
        Ok(value.clone())
    }
}

impl Unmarshaler<Vec<u8>> for Bytes {
    fn content_type(&self) -> &str {
        BYTES_CONTENT_TYPE
    }

    fn unmarshal(&self, body: &[u8], value: &mut Vec<u8>) -> Result<(), AmqpError> {
        value.clear();
        value.extend_from_slice(body);
        Ok(())
    }
}

/// The marshaler a payload type gets when none is configured: `Bytes` for
/// `Vec<u8>`, nothing for any other type.
pub(crate) fn default_marshaler<T: 'static>() -> Option<Arc<dyn Marshaler<T>>> {
    let bytes: Box<dyn Any> = Box::new(Arc::new(Bytes) as Arc<dyn Marshaler<Vec<u8>>>);
    bytes
        .downcast::<Arc<dyn Marshaler<T>>>()
        .ok()
        .map(|marshaler| *marshaler)
}
