//! Request dispatch.
//!
//! 1. **Routing** (`router`): path to [`Controller`], with `:name` and `*`
//!    captures copied into the request params
//! 2. **Controllers** (`controller`): application logic, answering through a
//!    [`ResponseSink`](crate::network::sink::ResponseSink)
//! 3. **Configuration** (`config`): the router plus listener settings
//!
//! Nothing here knows which transport a request arrived on.

pub mod config;
pub mod controller;
pub mod router;

pub use config::ServerConfig;
pub use controller::{handler_fn, Controller, Handler, HandlerFn, MethodController, METHOD_ALL};
pub use router::{RouteError, RouteMatch, Router, WILDCARD_PARAM};
