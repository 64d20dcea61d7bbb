//! Wire frames exchanged between agent connections.
//!
//! Every line on the wire is one JSON envelope:
//!
//! | Shape | Meaning |
//! |-------|---------|
//! | `{"jsonrpc":"2.0","id":"…","payload":"<token>"}` | request, expects a reply |
//! | `{"jsonrpc":"2.0","payload":"<token>"}` | notification |
//! | `{"jsonrpc":"2.0","id":"…","result":<token or value>}` | success response |
//! | `{"jsonrpc":"2.0","id":"…","error":"<plaintext>"}` | error response |
//!
//! `<token>` is the [`Cipher`](crate::crypto::Cipher) encryption of the JSON
//! `{"method": …, "params": …}` call payload (or `{"result": …}` for a
//! success response). Error responses stay plaintext.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::crypto::Cipher;
use crate::{AppError, Result};

/// Protocol version tag carried by every frame.
pub const JSONRPC_VERSION: &str = "2.0";

/// Decrypted body of a request or notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallPayload {
    /// RPC method name.
    pub method: String,
    /// Method parameters; an empty object when absent.
    #[serde(default = "empty_params")]
    pub params: Value,
}

fn empty_params() -> Value {
    Value::Object(Map::new())
}

/// Decrypted body of a success response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultPayload {
    /// Value returned by the remote handler.
    #[serde(default)]
    pub result: Value,
}

/// Outbound envelope as written to the wire.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Frame {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl Frame {
    fn empty() -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id: None,
            payload: None,
            result: None,
            error: None,
        }
    }

    /// Build a request frame carrying an encrypted call payload.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Crypto`] if encryption fails.
    pub fn request(cipher: &dyn Cipher, id: &str, method: &str, params: &Value) -> Result<Self> {
        Ok(Self {
            id: Some(id.to_owned()),
            payload: Some(seal_call(cipher, method, params)?),
            ..Self::empty()
        })
    }

    /// Build a notification frame (no id, no reply expected).
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Crypto`] if encryption fails.
    pub fn notification(cipher: &dyn Cipher, method: &str, params: &Value) -> Result<Self> {
        Ok(Self {
            payload: Some(seal_call(cipher, method, params)?),
            ..Self::empty()
        })
    }

    /// Build a success response whose `result` is the encrypted `{"result": value}`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Crypto`] if encryption fails.
    pub fn success(cipher: &dyn Cipher, id: &str, value: Value) -> Result<Self> {
        let body = serde_json::to_vec(&ResultPayload { result: value })?;
        let token = token_string(cipher.encrypt(&body)?)?;
        Ok(Self {
            id: Some(id.to_owned()),
            result: Some(Value::String(token)),
            ..Self::empty()
        })
    }

    /// Build an error response. The message travels in plaintext.
    #[must_use]
    pub fn failure(id: &str, message: impl Into<String>) -> Self {
        Self {
            id: Some(id.to_owned()),
            error: Some(message.into()),
            ..Self::empty()
        }
    }

    /// Serialise the frame into a single wire line (without the newline).
    ///
    /// # Errors
    ///
    /// Returns [`AppError::MalformedFrame`] if serialisation fails.
    pub fn to_line(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Outcome carried by a response frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    /// `result` field, still encrypted when it is a string.
    Result(Value),
    /// Plaintext `error` field.
    Error(String),
}

/// Classified inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Reply to one of our pending requests.
    Response {
        /// Correlation id allocated by the requester.
        id: String,
        /// Success or error body.
        body: ResponseBody,
    },
    /// Call that expects a reply.
    Request {
        /// Correlation id to echo back.
        id: String,
        /// Encrypted call payload.
        payload: String,
    },
    /// One-way call.
    Notification {
        /// Encrypted call payload.
        payload: String,
    },
}

impl Inbound {
    /// Parse and classify one wire line.
    ///
    /// A frame carrying an `id` and a `result` or `error` is a response; any
    /// other frame must carry a string `payload` and is a request when it
    /// has an `id`, a notification otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::MalformedFrame`] for invalid JSON, a non-object
    /// frame, or a call frame without a string `payload`.
    pub fn parse(line: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(line)
            .map_err(|err| AppError::MalformedFrame(format!("invalid json: {err}")))?;
        let Value::Object(mut frame) = value else {
            return Err(AppError::MalformedFrame("frame is not an object".into()));
        };

        let id = frame.remove("id").and_then(id_string);

        if let Some(ref id) = id {
            if let Some(error) = frame.remove("error") {
                return Ok(Self::Response {
                    id: id.clone(),
                    body: ResponseBody::Error(error_string(error)),
                });
            }
            if let Some(result) = frame.remove("result") {
                return Ok(Self::Response {
                    id: id.clone(),
                    body: ResponseBody::Result(result),
                });
            }
        }

        match frame.remove("payload") {
            Some(Value::String(payload)) => Ok(match id {
                Some(id) => Self::Request { id, payload },
                None => Self::Notification { payload },
            }),
            _ => Err(AppError::MalformedFrame("missing payload in frame".into())),
        }
    }
}

/// Decrypt and parse a call payload token.
///
/// # Errors
///
/// Returns [`AppError::Decryption`] if the token cannot be decrypted and
/// [`AppError::MalformedFrame`] if the plaintext is not a call payload.
pub fn open_call(cipher: &dyn Cipher, token: &str) -> Result<CallPayload> {
    let plaintext = cipher.decrypt(token.as_bytes())?;
    Ok(serde_json::from_slice(&plaintext)?)
}

/// Resolve a success `result` field into the handler's return value.
///
/// String results are decrypted and unwrapped from `{"result": …}`; any
/// other JSON value is passed through as-is.
///
/// # Errors
///
/// Returns [`AppError::Decryption`] or [`AppError::MalformedFrame`] when a
/// string result cannot be opened.
pub fn open_result(cipher: &dyn Cipher, result: Value) -> Result<Value> {
    match result {
        Value::String(token) => {
            let plaintext = cipher.decrypt(token.as_bytes())?;
            let payload: ResultPayload = serde_json::from_slice(&plaintext)?;
            Ok(payload.result)
        }
        other => Ok(other),
    }
}

fn seal_call(cipher: &dyn Cipher, method: &str, params: &Value) -> Result<String> {
    let body = serde_json::to_vec(&serde_json::json!({ "method": method, "params": params }))?;
    token_string(cipher.encrypt(&body)?)
}

fn token_string(token: Vec<u8>) -> Result<String> {
    String::from_utf8(token).map_err(|err| AppError::Crypto(format!("cipher token is not utf-8: {err}")))
}

fn id_string(id: Value) -> Option<String> {
    match id {
        Value::Null => None,
        Value::String(id) => Some(id),
        other => Some(other.to_string()),
    }
}

fn error_string(error: Value) -> String {
    match error {
        Value::String(message) => message,
        other => other.to_string(),
    }
}
