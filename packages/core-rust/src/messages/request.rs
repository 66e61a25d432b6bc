//! STREST request envelope.

use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};

use serde::{Deserialize, Serialize};

use super::message::Message;
use super::STREST_VERSION;
use crate::types::Value;

pub(crate) const PATH_VERSION: &str = "strest.v";
const PATH_METHOD: &str = "strest.method";
const PATH_URI: &str = "strest.uri";
const PATH_PARAMS: &str = "strest.params";
pub(crate) const PATH_TXN_ID: &str = "strest.txn.id";
const PATH_TXN_ACCEPT: &str = "strest.txn.accept";

/// Whether the caller accepts a single response or a stream of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TxnAccept {
    #[default]
    Single,
    Multi,
}

impl TxnAccept {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Multi => "multi",
        }
    }

    /// Parses the wire value, falling back to `Single` for anything unknown.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("multi") {
            Self::Multi
        } else {
            Self::Single
        }
    }
}

/// A STREST request: a [`Message`] with the `strest` envelope populated.
///
/// Layout:
///
/// ```text
/// { "strest": { "v": 2.0, "method": "GET", "uri": "/ping",
///               "params": { ... }, "txn": { "id": "...", "accept": "single" } } }
/// ```
///
/// The transaction id is chosen by the caller and must be unique among the
/// requests in flight on one connection. The client engine fills in an id
/// when it is left empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Request {
    message: Message,
}

impl Request {
    /// Creates a request for `method` on `uri`. The method is stored
    /// uppercased so verb comparisons are case-insensitive.
    #[must_use]
    pub fn new(method: &str, uri: &str) -> Self {
        let mut message = Message::new();
        message.put(PATH_VERSION, STREST_VERSION);
        message.put(PATH_METHOD, method.to_ascii_uppercase());
        message.put(PATH_URI, uri);
        message.put(PATH_TXN_ACCEPT, TxnAccept::Single.as_str());
        Self { message }
    }

    /// Sets the transaction id.
    #[must_use]
    pub fn with_txn_id(mut self, id: impl Into<String>) -> Self {
        self.set_txn_id(id);
        self
    }

    #[must_use]
    pub fn with_accept(mut self, accept: TxnAccept) -> Self {
        self.message.put(PATH_TXN_ACCEPT, accept.as_str());
        self
    }

    /// Adds a single parameter under `strest.params`.
    #[must_use]
    pub fn with_param(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.set_param(name, value);
        self
    }

    pub fn set_txn_id(&mut self, id: impl Into<String>) {
        self.message.put(PATH_TXN_ID, id.into());
    }

    /// Stores a parameter. `name` is a single key, dots are not interpreted.
    pub fn set_param(&mut self, name: &str, value: impl Into<Value>) {
        let mut params = self.params().cloned().unwrap_or_default();
        params.insert(name.to_string(), value.into());
        self.message.put(PATH_PARAMS, params);
    }

    #[must_use]
    pub fn version(&self) -> f64 {
        self.message.get_f64(PATH_VERSION)
    }

    /// Uppercased verb, e.g. `GET`.
    #[must_use]
    pub fn method(&self) -> String {
        self.message.get_string(PATH_METHOD).to_ascii_uppercase()
    }

    #[must_use]
    pub fn uri(&self) -> &str {
        self.message.get_str(PATH_URI)
    }

    /// The uri without its query string.
    #[must_use]
    pub fn path(&self) -> &str {
        let uri = self.uri();
        uri.split_once('?').map_or(uri, |(path, _)| path)
    }

    #[must_use]
    pub fn params(&self) -> Option<&BTreeMap<String, Value>> {
        self.message.get_map(PATH_PARAMS)
    }

    #[must_use]
    pub fn param(&self, name: &str) -> Option<&Value> {
        self.params()?.get(name)
    }

    /// String view of a parameter, `""` when absent.
    #[must_use]
    pub fn param_str(&self, name: &str) -> String {
        self.param(name)
            .and_then(Value::coerce_string)
            .unwrap_or_default()
    }

    #[must_use]
    pub fn txn_id(&self) -> &str {
        self.message.get_str(PATH_TXN_ID)
    }

    #[must_use]
    pub fn txn_accept(&self) -> TxnAccept {
        TxnAccept::parse(self.message.get_str(PATH_TXN_ACCEPT))
    }

    #[must_use]
    pub fn into_message(self) -> Message {
        self.message
    }
}

/// Rewrites a scalar, non-string txn id as a string so that peers sending
/// numeric ids still correlate.
pub(crate) fn stringify_txn_id(message: &mut Message) {
    let coerced = match message.get(PATH_TXN_ID) {
        None | Some(Value::String(_)) => return,
        Some(other) => other.coerce_string(),
    };
    if let Some(id) = coerced {
        message.put(PATH_TXN_ID, id);
    }
}

impl From<Message> for Request {
    fn from(mut message: Message) -> Self {
        stringify_txn_id(&mut message);
        Self { message }
    }
}

impl Deref for Request {
    type Target = Message;

    fn deref(&self) -> &Message {
        &self.message
    }
}

impl DerefMut for Request {
    fn deref_mut(&mut self) -> &mut Message {
        &mut self.message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_txn_id_is_read_as_string() {
        let mut message = Message::new();
        message.put(PATH_TXN_ID, 42);
        message.put(PATH_URI, "/a");
        assert_eq!(Request::from(message).txn_id(), "42");

        let mut message = Message::new();
        message.put(PATH_TXN_ID, Vec::<Value>::new());
        assert_eq!(Request::from(message).txn_id(), "");
    }

    #[test]
    fn new_populates_envelope() {
        let req = Request::new("get", "/users/7?verbose=1").with_txn_id("t1");
        assert_eq!(req.method(), "GET");
        assert_eq!(req.uri(), "/users/7?verbose=1");
        assert_eq!(req.path(), "/users/7");
        assert_eq!(req.txn_id(), "t1");
        assert_eq!(req.txn_accept(), TxnAccept::Single);
        assert!((req.version() - STREST_VERSION).abs() < f64::EPSILON);
    }

    #[test]
    fn params_are_single_keys() {
        let req = Request::new("POST", "/x")
            .with_param("a.b", 1)
            .with_param("name", "bob");
        assert_eq!(req.param("a.b"), Some(&Value::Int(1)));
        assert_eq!(req.param_str("name"), "bob");
        assert_eq!(req.param_str("missing"), "");
        assert_eq!(req.params().map(BTreeMap::len), Some(2));
    }

    #[test]
    fn accept_parsing_defaults_to_single() {
        assert_eq!(TxnAccept::parse("MULTI"), TxnAccept::Multi);
        assert_eq!(TxnAccept::parse("bogus"), TxnAccept::Single);
        let req = Request::new("GET", "/").with_accept(TxnAccept::Multi);
        assert_eq!(req.txn_accept(), TxnAccept::Multi);
    }

    #[test]
    fn wire_shape_matches_envelope() {
        let req = Request::new("GET", "/ping").with_txn_id("abc");
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["strest"]["method"], "GET");
        assert_eq!(json["strest"]["uri"], "/ping");
        assert_eq!(json["strest"]["txn"]["id"], "abc");
        assert_eq!(json["strest"]["txn"]["accept"], "single");
        assert_eq!(json["strest"]["v"], 2.0);
    }

    #[test]
    fn empty_request_has_no_txn_id() {
        let req = Request::default();
        assert_eq!(req.txn_id(), "");
        assert_eq!(req.method(), "");
    }
}
