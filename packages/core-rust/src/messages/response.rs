//! STREST response envelope.

use std::ops::{Deref, DerefMut};

use serde::{Deserialize, Serialize};

use super::message::Message;
use super::request::{stringify_txn_id, Request, PATH_TXN_ID, PATH_VERSION};
use super::{STREST_VERSION, TXN_COMPLETED};

const PATH_TXN_STATUS: &str = "strest.txn.status";
const PATH_STATUS_CODE: &str = "status.code";
const PATH_STATUS_MESSAGE: &str = "status.message";

/// A STREST response: a [`Message`] carrying the transaction id and status
/// of the request it answers, plus any payload fields.
///
/// A transaction is finished once a response with txn status
/// [`TXN_COMPLETED`] has been sent; any other status marks a partial
/// response in a stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Response {
    message: Message,
}

impl Response {
    /// Creates a `200 OK`, `completed` response for `request`.
    #[must_use]
    pub fn new(request: &Request) -> Self {
        let mut response = Self::default();
        response.set_status(200, "OK");
        response.set_txn_status(TXN_COMPLETED);
        response.set_txn_id(request.txn_id());
        response.message.put(PATH_VERSION, STREST_VERSION);
        response
    }

    /// Creates a completed response for `request` with an error status.
    #[must_use]
    pub fn error(request: &Request, code: i64, message: &str) -> Self {
        let mut response = Self::new(request);
        response.set_status(code, message);
        response
    }

    #[must_use]
    pub fn txn_id(&self) -> &str {
        self.message.get_str(PATH_TXN_ID)
    }

    pub fn set_txn_id(&mut self, id: &str) {
        self.message.put(PATH_TXN_ID, id);
    }

    #[must_use]
    pub fn txn_status(&self) -> &str {
        self.message.get_str(PATH_TXN_STATUS)
    }

    pub fn set_txn_status(&mut self, status: &str) {
        self.message.put(PATH_TXN_STATUS, status);
    }

    /// `true` when no further responses follow for this transaction.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.txn_status() == TXN_COMPLETED
    }

    /// Numeric status code; 200 when the response does not carry one.
    #[must_use]
    pub fn status_code(&self) -> i64 {
        self.message.get_i64_or(PATH_STATUS_CODE, 200)
    }

    #[must_use]
    pub fn status_message(&self) -> String {
        self.message.get_string(PATH_STATUS_MESSAGE)
    }

    pub fn set_status_code(&mut self, code: i64) {
        self.message.put(PATH_STATUS_CODE, code);
    }

    pub fn set_status_message(&mut self, message: &str) {
        self.message.put(PATH_STATUS_MESSAGE, message);
    }

    pub fn set_status(&mut self, code: i64, message: &str) {
        self.set_status_code(code);
        self.set_status_message(message);
    }

    #[must_use]
    pub fn into_message(self) -> Message {
        self.message
    }
}

impl From<Message> for Response {
    fn from(mut message: Message) -> Self {
        stringify_txn_id(&mut message);
        Self { message }
    }
}

impl Deref for Response {
    type Target = Message;

    fn deref(&self) -> &Message {
        &self.message
    }
}

impl DerefMut for Response {
    fn deref_mut(&mut self) -> &mut Message {
        &mut self.message
    }
}
