//! Marshalers convert commands and events into messages and back.
//!
//! The resolved type name travels in the `name` metadata entry, so
//! processors can route a message without decoding its payload.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::message::{Message, new_uuid};
use crate::utils::error::{Error, Result};

/// Metadata key holding the command or event name.
pub const NAME_METADATA_KEY: &str = "name";

pub trait Marshaler: Send + Sync + 'static {
    /// Encodes `value` into a new message carrying its name.
    fn marshal<T: Serialize>(&self, value: &T) -> Result<Message>;

    fn unmarshal<T: DeserializeOwned>(&self, msg: &Message) -> Result<T>;

    /// Name used for `T` in metadata and topic generation.
    fn name<T: ?Sized>(&self) -> String;

    /// Name stored in the message's metadata; empty if missing.
    fn name_from_message(&self, msg: &Message) -> String {
        msg.metadata
            .get(NAME_METADATA_KEY)
            .unwrap_or_default()
            .to_string()
    }
}

/// How type names are derived.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NameStrategy {
    /// Last path segment, e.g. `BookRoom`.
    #[default]
    StructName,
    /// Full path, e.g. `hotel::commands::BookRoom`.
    FullyQualified,
}

impl NameStrategy {
    pub fn name_of<T: ?Sized>(self) -> String {
        let full = std::any::type_name::<T>();
        match self {
            Self::FullyQualified => full.to_string(),
            Self::StructName => struct_name(full).to_string(),
        }
    }
}

fn struct_name(full: &str) -> &str {
    let path = full.split('<').next().unwrap_or(full);
    path.rsplit("::").next().unwrap_or(path)
}

fn named_message(payload: Vec<u8>, name: String) -> Message {
    let mut msg = Message::new(new_uuid(), payload);
    msg.metadata.set(NAME_METADATA_KEY, name);
    msg
}

/// Text codec based on `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonMarshaler {
    pub naming: NameStrategy,
}

impl JsonMarshaler {
    pub fn new(naming: NameStrategy) -> Self {
        Self { naming }
    }
}

impl Marshaler for JsonMarshaler {
    fn marshal<T: Serialize>(&self, value: &T) -> Result<Message> {
        let payload = serde_json::to_vec(value).map_err(|e| Error::Marshal(e.to_string()))?;
        Ok(named_message(payload, self.name::<T>()))
    }

    fn unmarshal<T: DeserializeOwned>(&self, msg: &Message) -> Result<T> {
        serde_json::from_slice(&msg.payload).map_err(|e| Error::Unmarshal(e.to_string()))
    }

    fn name<T: ?Sized>(&self) -> String {
        self.naming.name_of::<T>()
    }
}

/// Compact binary codec based on `bincode`.
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeMarshaler {
    pub naming: NameStrategy,
}

impl BincodeMarshaler {
    pub fn new(naming: NameStrategy) -> Self {
        Self { naming }
    }
}

impl Marshaler for BincodeMarshaler {
    fn marshal<T: Serialize>(&self, value: &T) -> Result<Message> {
        let payload = bincode::serialize(value).map_err(|e| Error::Marshal(e.to_string()))?;
        Ok(named_message(payload, self.name::<T>()))
    }

    fn unmarshal<T: DeserializeOwned>(&self, msg: &Message) -> Result<T> {
        bincode::deserialize(&msg.payload).map_err(|e| Error::Unmarshal(e.to_string()))
    }

    fn name<T: ?Sized>(&self) -> String {
        self.naming.name_of::<T>()
    }
}
