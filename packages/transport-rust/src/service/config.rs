use std::sync::Arc;

use super::controller::Controller;
use super::router::{RouteError, Router};
use crate::network::NetworkConfig;

/// Everything needed to start a server: listener settings plus the
/// controllers requests are dispatched to.
///
/// Built once at startup and handed to
/// [`NetworkModule::new`](crate::network::NetworkModule::new); nothing here
/// is global.
#[derive(Debug, Default)]
pub struct ServerConfig {
    /// Name reported in logs and by `/health`.
    pub name: String,
    pub network: NetworkConfig,
    router: Router,
}

impl ServerConfig {
    #[must_use]
    pub fn new(name: impl Into<String>, network: NetworkConfig) -> Self {
        Self {
            name: name.into(),
            network,
            router: Router::new(),
        }
    }

    /// Adds a controller to the router.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError`] if the route is taken or malformed.
    pub fn register(&mut self, controller: impl Controller + 'static) -> Result<&mut Self, RouteError> {
        self.router.register(controller)?;
        Ok(self)
    }

    #[must_use]
    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Splits into the network settings and a shareable router.
    #[must_use]
    pub fn into_parts(self) -> (String, NetworkConfig, Arc<Router>) {
        (self.name, self.network, Arc::new(self.router))
    }
}
