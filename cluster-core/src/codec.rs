//! Pluggable payload codecs: JSON, MessagePack, and a text passthrough,
//! selectable globally per connection or per call.

use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{ClusterError, ClusterResult};

/// JSON payload codec, backed by `serde_json`.
pub struct JsonCodec;

/// MessagePack payload codec, backed by `rmp-serde`.
pub struct MsgPackCodec;

/// Passthrough codec for string / byte-sequence values.
pub struct TextCodec;

impl JsonCodec {
    pub fn marshal<T: Serialize>(&self, value: &T) -> ClusterResult<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| ClusterError::codec(e.to_string()))
    }

    pub fn unmarshal<T: DeserializeOwned>(&self, data: &[u8]) -> ClusterResult<T> {
        serde_json::from_slice(data).map_err(|e| ClusterError::codec(e.to_string()))
    }

    pub fn is_null(&self, data: &[u8]) -> bool {
        data.is_empty() || data == b"null"
    }

    pub fn name(&self) -> &'static str {
        "json"
    }
}

impl MsgPackCodec {
    pub fn marshal<T: Serialize>(&self, value: &T) -> ClusterResult<Vec<u8>> {
        rmp_serde::to_vec(value).map_err(|e| ClusterError::codec(e.to_string()))
    }

    pub fn unmarshal<T: DeserializeOwned>(&self, data: &[u8]) -> ClusterResult<T> {
        rmp_serde::from_slice(data).map_err(|e| ClusterError::codec(e.to_string()))
    }

    pub fn is_null(&self, data: &[u8]) -> bool {
        data.is_empty()
    }

    pub fn name(&self) -> &'static str {
        "msgpack"
    }
}

/// A value the text codec accepts: a UTF-8 string or raw bytes. Anything
/// else is rejected at marshal time.
pub enum TextValue<'a> {
    Str(&'a str),
    Bytes(&'a [u8]),
}

impl TextCodec {
    pub fn marshal(&self, value: TextValue<'_>) -> ClusterResult<Vec<u8>> {
        match value {
            TextValue::Str(s) => Ok(s.as_bytes().to_vec()),
            TextValue::Bytes(b) => Ok(b.to_vec()),
        }
    }

    pub fn unmarshal_string(&self, data: &[u8]) -> ClusterResult<String> {
        String::from_utf8(data.to_vec()).map_err(|e| ClusterError::codec(e.to_string()))
    }

    pub fn is_null(&self, data: &[u8]) -> bool {
        data.is_empty()
    }

    pub fn name(&self) -> &'static str {
        "text"
    }
}

/// Named codec identity used for per-connection/per-call selection. Carrying
/// the concrete codec type per entry (rather than a boxed trait object with
/// type-erased marshal/unmarshal) keeps the `marshal(value)`/
/// `unmarshal(bytes, slot)` contract type-safe without forcing every payload
/// through a single dynamic representation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CodecName {
    Json,
    MsgPack,
    Text,
    Custom(String),
}

impl CodecName {
    pub fn as_str(&self) -> &str {
        match self {
            CodecName::Json => "json",
            CodecName::MsgPack => "msgpack",
            CodecName::Text => "text",
            CodecName::Custom(name) => name,
        }
    }

    pub fn parse(name: &str) -> CodecName {
        match name {
            "json" => CodecName::Json,
            "msgpack" => CodecName::MsgPack,
            "text" => CodecName::Text,
            other => CodecName::Custom(other.to_string()),
        }
    }
}

/// Marshals a value through whichever codec is named, bridging dynamic
/// per-call codec selection with Rust's static `Serialize` bound. The text
/// codec only accepts `String`, `&str`, or `Vec<u8>`; which one `T` actually
/// is gets resolved at runtime via `Any`.
pub fn marshal<T: Serialize + 'static>(value: &T, codec: &CodecName) -> ClusterResult<Vec<u8>> {
    match codec {
        CodecName::Json => JsonCodec.marshal(value),
        CodecName::MsgPack => MsgPackCodec.marshal(value),
        CodecName::Text => {
            let any = value as &dyn std::any::Any;
            if let Some(s) = any.downcast_ref::<String>() {
                TextCodec.marshal(TextValue::Str(s))
            } else if let Some(s) = any.downcast_ref::<&str>() {
                TextCodec.marshal(TextValue::Str(s))
            } else if let Some(b) = any.downcast_ref::<Vec<u8>>() {
                TextCodec.marshal(TextValue::Bytes(b))
            } else {
                Err(ClusterError::codec("text codec only accepts String, &str, or Vec<u8> values"))
            }
        }
        CodecName::Custom(name) => Err(ClusterError::codec(format!("no marshaller registered for codec {:?}", name))),
    }
}

/// Inverse of [`marshal`]. For the text codec, `R` must be `String`; any
/// other target type fails the downcast and returns a codec error.
pub fn unmarshal<R: DeserializeOwned + 'static>(data: &[u8], codec: &CodecName) -> ClusterResult<R> {
    match codec {
        CodecName::Json => JsonCodec.unmarshal(data),
        CodecName::MsgPack => MsgPackCodec.unmarshal(data),
        CodecName::Text => {
            let s = TextCodec.unmarshal_string(data)?;
            downcast_owned::<R>(s).ok_or_else(|| ClusterError::codec("text codec reply type must be String"))
        }
        CodecName::Custom(name) => Err(ClusterError::codec(format!("no unmarshaller registered for codec {:?}", name))),
    }
}

fn downcast_owned<R: 'static>(value: impl std::any::Any) -> Option<R> {
    let boxed: Box<dyn std::any::Any> = Box::new(value);
    boxed.downcast::<R>().ok().map(|b| *b)
}

/// Whether `data` counts as "no value" under the named codec: an empty
/// payload under any codec, or the `null` literal under JSON.
pub fn is_null(data: &[u8], codec: &CodecName) -> bool {
    match codec {
        CodecName::Json => JsonCodec.is_null(data),
        CodecName::MsgPack => MsgPackCodec.is_null(data),
        CodecName::Text => TextCodec.is_null(data),
        CodecName::Custom(_) => data.is_empty(),
    }
}

/// Registry of codec *names*, so a connection or caller can refer to a codec
/// by a short string. Built-ins are always present; `put` registers
/// additional names for application-defined marshalling hooked in by the
/// embedder.
#[derive(Clone)]
pub struct CodecRegistry {
    extra: Arc<HashMap<String, ()>>,
}

impl Default for CodecRegistry {
    fn default() -> Self {
        CodecRegistry { extra: Arc::new(HashMap::new()) }
    }
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, name: &str) -> bool {
        matches!(name, "json" | "msgpack" | "text") || self.extra.contains_key(name)
    }

    pub fn put(&mut self, name: impl Into<String>) {
        Arc::make_mut(&mut self.extra).insert(name.into(), ());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_derive::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Args {
        a: i32,
        b: i32,
    }

    #[test]
    fn json_roundtrips() {
        let codec = JsonCodec;
        let args = Args { a: 7, b: 8 };
        let bytes = codec.marshal(&args).unwrap();
        let back: Args = codec.unmarshal(&bytes).unwrap();
        assert_eq!(args, back);
    }

    #[test]
    fn msgpack_roundtrips() {
        let codec = MsgPackCodec;
        let args = Args { a: 1, b: 2 };
        let bytes = codec.marshal(&args).unwrap();
        let back: Args = codec.unmarshal(&bytes).unwrap();
        assert_eq!(args, back);
    }

    #[test]
    fn json_is_null_recognizes_null_literal() {
        let codec = JsonCodec;
        assert!(codec.is_null(b""));
        assert!(codec.is_null(b"null"));
        assert!(!codec.is_null(b"{}"));
    }

    #[test]
    fn text_codec_passes_through_verbatim() {
        let codec = TextCodec;
        let bytes = codec.marshal(TextValue::Str("hello")).unwrap();
        assert_eq!(bytes, b"hello".to_vec());
        assert_eq!(codec.unmarshal_string(&bytes).unwrap(), "hello");
    }

    #[test]
    fn registry_knows_builtins() {
        let registry = CodecRegistry::new();
        assert!(registry.contains("json"));
        assert!(registry.contains("msgpack"));
        assert!(registry.contains("text"));
        assert!(!registry.contains("yaml"));
    }

    #[test]
    fn registry_put_registers_custom_codec() {
        let mut registry = CodecRegistry::new();
        registry.put("yaml");
        assert!(registry.contains("yaml"));
    }

    #[test]
    fn marshal_unmarshal_roundtrip_json() {
        let args = Args { a: 3, b: 4 };
        let bytes = marshal(&args, &CodecName::Json).unwrap();
        let back: Args = unmarshal(&bytes, &CodecName::Json).unwrap();
        assert_eq!(args, back);
    }

    #[test]
    fn marshal_text_accepts_string_value() {
        let value = String::from("ping");
        let bytes = marshal(&value, &CodecName::Text).unwrap();
        let back: String = unmarshal(&bytes, &CodecName::Text).unwrap();
        assert_eq!(back, "ping");
    }

    #[test]
    fn marshal_text_rejects_non_string_value() {
        let args = Args { a: 1, b: 2 };
        assert!(marshal(&args, &CodecName::Text).is_err());
    }

    #[test]
    fn unmarshal_text_rejects_non_string_target() {
        let value = String::from("ping");
        let bytes = marshal(&value, &CodecName::Text).unwrap();
        let result: ClusterResult<Args> = unmarshal(&bytes, &CodecName::Text);
        assert!(result.is_err());
    }
}
