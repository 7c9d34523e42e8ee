//! Wire format for persisted limiter state.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{LimiterError, Result};

/// Encoding used for state written to a shared store.
///
/// Both formats are self-describing with named fields, so a process can read
/// state written by another build that added or dropped fields.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Codec {
    /// JSON via serde_json
    #[default]
    Json,
    /// MessagePack maps via rmp-serde
    MessagePack,
}

impl Codec {
    /// Encode a state record.
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            Codec::Json => {
                serde_json::to_vec(value).map_err(|e| LimiterError::Serialization(e.to_string()))
            }
            Codec::MessagePack => rmp_serde::to_vec_named(value)
                .map_err(|e| LimiterError::Serialization(e.to_string())),
        }
    }

    /// Decode a state record.
    pub fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T> {
        match self {
            Codec::Json => {
                serde_json::from_slice(data).map_err(|e| LimiterError::Serialization(e.to_string()))
            }
            Codec::MessagePack => {
                rmp_serde::from_slice(data).map_err(|e| LimiterError::Serialization(e.to_string()))
            }
        }
    }
}
