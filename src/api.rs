//! The per-API ownership object.
//!
//! An [`Api`] binds one configuration snapshot, one session manager (hence at
//! most one live session) and the endpoints declared against that API.
//! Create it at startup, share it behind an `Arc`, and call
//! [`Api::close`] on shutdown.

use std::sync::{Arc, PoisonError, RwLock};

use log::debug;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::{ClientConfig, ConfigUpdate};
use crate::endpoint::{Call, EndpointRegistry, EndpointSpec};
use crate::error::Result;
use crate::http::{Method, RequestExecutor, RequestOutcome, Session, SessionManager, TransportOptions};

#[derive(Debug)]
pub struct Api {
    config: RwLock<Arc<ClientConfig>>,
    executor: RequestExecutor,
    endpoints: EndpointRegistry,
}

impl Api {
    pub fn new(config: ClientConfig) -> Self {
        Self::with_user_agent(config, crate::USER_AGENT)
    }

    pub fn with_user_agent(config: ClientConfig, user_agent: &str) -> Self {
        Self {
            config: RwLock::new(Arc::new(config)),
            executor: RequestExecutor::new(SessionManager::new(user_agent)),
            endpoints: EndpointRegistry::new(),
        }
    }

    /// Declares an endpoint on this API.
    pub fn endpoint(mut self, spec: EndpointSpec) -> Self {
        self.endpoints.register(spec);
        self
    }

    /// Declares an endpoint on an API already in place.
    pub fn declare(&mut self, spec: EndpointSpec) -> &mut Self {
        self.endpoints.register(spec);
        self
    }

    /// Replaces the declared endpoints with `endpoints`.
    pub fn with_endpoints(mut self, endpoints: EndpointRegistry) -> Self {
        self.endpoints = endpoints;
        self
    }

    pub fn name(&self) -> String {
        self.config().name.clone()
    }

    /// Current configuration snapshot.
    pub fn config(&self) -> Arc<ClientConfig> {
        Arc::clone(&self.config.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Applies a partial update by swapping in a new snapshot.
    ///
    /// Requests already running keep the snapshot they started with. The
    /// current session is closed so the next one picks up new defaults, and a
    /// session rebuilt by one of those older requests is replaced again on
    /// the next request made with the new snapshot.
    pub fn configure(&self, update: ConfigUpdate) -> Arc<ClientConfig> {
        let updated = {
            let mut slot = self.config.write().unwrap_or_else(PoisonError::into_inner);
            let updated = Arc::new((**slot).clone().configure(update));
            *slot = Arc::clone(&updated);
            updated
        };
        debug!("Reconfigured {}", updated.name);
        self.executor.sessions().close();
        updated
    }

    pub fn endpoints(&self) -> &EndpointRegistry {
        &self.endpoints
    }

    pub fn sessions(&self) -> &SessionManager {
        self.executor.sessions()
    }

    /// Opens the session ahead of the first request.
    pub async fn open(&self) -> Result<Arc<Session>> {
        self.executor.sessions().ensure_session(&self.config()).await
    }

    /// Closes the session. Later calls open a new one.
    pub fn close(&self) {
        self.executor.sessions().close();
    }

    /// Invokes a registered endpoint by name.
    pub async fn invoke(&self, name: &str, call: &Call) -> Result<Value> {
        let spec = self.endpoints.resolve(name)?;
        self.call(spec, call).await
    }

    /// Like [`Api::invoke`], aborting when `cancel` fires.
    pub async fn invoke_with_cancel(
        &self,
        name: &str,
        call: &Call,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let spec = self.endpoints.resolve(name)?;
        let config = self.config();
        spec.invoke(&self.executor, &config, call, Some(cancel)).await
    }

    /// Invokes an endpoint declared outside the registry, typically one with a typed result.
    pub async fn call<T>(&self, spec: &EndpointSpec<T>, call: &Call) -> Result<T> {
        let config = self.config();
        spec.invoke(&self.executor, &config, call, None).await
    }

    /// Raw access to the executor, bypassing endpoint declarations.
    pub async fn request(
        &self,
        method: Method,
        route: &str,
        path_args: &[String],
        options: &TransportOptions,
    ) -> Result<RequestOutcome> {
        let config = self.config();
        self.executor
            .execute(&config, method, route, path_args, options, None)
            .await
    }
}
