use std::collections::HashMap;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Property carrying a message's verb.
pub const PROFILE: &str = "Profile";
/// Properties carrying an error response's classification.
pub const ERROR_DOMAIN: &str = "Error-Domain";
pub const ERROR_CODE: &str = "Error-Code";
/// The error domain used for HTTP-status-shaped errors.
pub const ERROR_DOMAIN_HTTP: &str = "HTTP";

/// One framed message: a string→string property bag plus an opaque body.
///
/// Requests and responses share this shape; only their position in an
/// exchange distinguishes them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlipMessage {
    properties: HashMap<String, String>,
    body: Bytes,
    compressed: bool,
    no_reply: bool,
}

impl BlipMessage {
    pub fn new() -> Self {
        Self::default()
    }

    /// A request message with its `Profile` property set to `verb`.
    pub fn request(verb: &str) -> Self {
        let mut msg = Self::new();
        msg.set_property(PROFILE, verb);
        msg
    }

    /// The message's verb; empty for responses and untyped messages.
    pub fn profile(&self) -> &str {
        self.property(PROFILE).unwrap_or("")
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.properties.insert(key.into(), value.into());
    }

    pub fn properties(&self) -> &HashMap<String, String> {
        &self.properties
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn take_body(&mut self) -> Bytes {
        std::mem::take(&mut self.body)
    }

    pub fn set_body(&mut self, body: impl Into<Bytes>) {
        self.body = body.into();
    }

    /// Parse the body as JSON. An absent body reads as JSON `null`, so
    /// optional bodies can deserialize into `Option<T>` without a length
    /// check at every call site.
    pub fn read_json_body<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        if self.body.is_empty() {
            serde_json::from_slice(b"null")
        } else {
            serde_json::from_slice(&self.body)
        }
    }

    pub fn set_json_body<T: Serialize>(&mut self, value: &T) -> serde_json::Result<()> {
        self.body = serde_json::to_vec(value)?.into();
        Ok(())
    }

    /// Whether the transport should compress this message's frames.
    pub fn compressed(&self) -> bool {
        self.compressed
    }

    pub fn set_compressed(&mut self, compressed: bool) {
        self.compressed = compressed;
    }

    /// A `noReply` request tells the peer not to produce a paired response.
    pub fn no_reply(&self) -> bool {
        self.no_reply
    }

    pub fn set_no_reply(&mut self, no_reply: bool) {
        self.no_reply = no_reply;
    }

    /// Turn this message into an error response. The transport encodes the
    /// two error properties on the wire; `message` travels as the body.
    pub fn set_error(&mut self, domain: &str, code: u16, message: &str) {
        self.set_property(ERROR_DOMAIN, domain);
        self.set_property(ERROR_CODE, code.to_string());
        self.body = Bytes::copy_from_slice(message.as_bytes());
    }

    pub fn is_error(&self) -> bool {
        self.properties.contains_key(ERROR_DOMAIN)
    }

    pub fn error_code(&self) -> Option<u16> {
        self.property(ERROR_CODE)?.parse().ok()
    }
}
