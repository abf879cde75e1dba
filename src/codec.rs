//! Body codec used for Body-bound parameters and outcome data.

use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("cannot decode body: {0}")]
    Decode(String),
    #[error("cannot encode data: {0}")]
    Encode(String),
}

/// Converts between wire bytes and structured values.
///
/// Implementations must be safe to share across concurrently dispatched
/// requests.
pub trait BodyCodec: Send + Sync {
    /// Value for the `content-type` header of encoded output.
    fn content_type(&self) -> &str;

    fn decode(&self, bytes: &[u8]) -> Result<Value, CodecError>;

    fn encode(&self, value: &Value) -> Result<Vec<u8>, CodecError>;
}

/// JSON over UTF-8.
#[derive(Debug, Clone)]
pub struct JsonCodec {
    pretty: bool,
}

impl JsonCodec {
    pub fn new(pretty: bool) -> Self {
        Self { pretty }
    }
}

impl Default for JsonCodec {
    fn default() -> Self {
        Self::new(true)
    }
}

impl BodyCodec for JsonCodec {
    fn content_type(&self) -> &str {
        "application/json; charset=utf-8"
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, CodecError> {
        serde_json::from_slice(strip_bom(bytes)).map_err(|err| CodecError::Decode(err.to_string()))
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        let encoded = if self.pretty {
            serde_json::to_vec_pretty(value)
        } else {
            serde_json::to_vec(value)
        };
        encoded.map_err(|err| CodecError::Encode(err.to_string()))
    }
}

/// Decodes `bytes` with `codec` into `T`.
pub fn decode_as<T: DeserializeOwned>(codec: &dyn BodyCodec, bytes: &[u8]) -> Result<T, CodecError> {
    let value = codec.decode(bytes)?;
    serde_json::from_value(value).map_err(|err| CodecError::Decode(err.to_string()))
}

/// True when the body carries nothing but whitespace (or a lone BOM).
pub fn is_blank(bytes: &[u8]) -> bool {
    strip_bom(bytes).iter().all(u8::is_ascii_whitespace)
}

fn strip_bom(bytes: &[u8]) -> &[u8] {
    bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes)
}
