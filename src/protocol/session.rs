//! Session management for AMTP.
//!
//! A [`Session`] owns the agent's connection to its gateway, the
//! authentication token handed out at registration, and (in pull mode) the
//! background delivery loop. It is a cheap handle: clones share the same
//! state, which is how the delivery task and the caller see one session.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{Mutex, Notify};

use super::delivery::{self, ErrorHandler, MessageHandler};
use super::message::{local_part, Message};
use super::DeliveryMode;
use crate::config::{Config, SessionConfig};
use crate::error::{AmtpError, Result};
use crate::schema::{schema_pattern_matches, SchemaRegistry};
use crate::transport::{
    Connector, ExponentialBackoff, GatewayClient, GatewayRequest, HttpConnector, RetryPolicy,
};

/// Session state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No gateway connection
    Idle,
    /// Gateway reachable, not registered
    Connected,
    /// Registered, not serving
    Registered,
    /// Serving; in pull mode the delivery loop is active
    Running,
}

/// Snapshot of session counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Messages accepted by the gateway (replies included)
    pub messages_sent: u64,
    /// Messages pulled from the inbox
    pub messages_received: u64,
    /// Inbox messages acknowledged
    pub messages_acknowledged: u64,
    /// Replies sent by the delivery loop
    pub replies_sent: u64,
    /// Failures reported by the delivery loop
    pub delivery_failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    received: AtomicU64,
    acknowledged: AtomicU64,
    replies: AtomicU64,
    failures: AtomicU64,
}

/// Builder for [`Session`]
pub struct SessionBuilder {
    address: String,
    gateway_url: String,
    mode: DeliveryMode,
    config: SessionConfig,
    api_key: Option<String>,
    supported_schemas: Vec<String>,
    schemas: Option<Arc<SchemaRegistry>>,
    connector: Arc<dyn Connector>,
    retry_policy: Option<Arc<dyn RetryPolicy>>,
}

impl SessionBuilder {
    /// Pull (default) or push delivery
    pub fn delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.mode = mode;
        self
    }

    /// Timeouts, retries and quotas
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Pre-provisioned API key, used until registration returns another
    pub fn api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Schema-id patterns this agent accepts
    pub fn supported_schemas<I>(mut self, patterns: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.supported_schemas = patterns.into_iter().map(Into::into).collect();
        self
    }

    /// Validate outgoing payloads against this registry
    pub fn schema_registry(mut self, registry: Arc<SchemaRegistry>) -> Self {
        self.schemas = Some(registry);
        self
    }

    /// Replace the default HTTP connector
    pub fn connector(mut self, connector: impl Connector + 'static) -> Self {
        self.connector = Arc::new(connector);
        self
    }

    /// Replace the exponential backoff derived from the session config
    pub fn retry_policy(mut self, policy: impl RetryPolicy + 'static) -> Self {
        self.retry_policy = Some(Arc::new(policy));
        self
    }

    /// Build the session
    pub fn build(self) -> Result<Session> {
        if self.address.trim().is_empty() {
            return Err(AmtpError::Config("Agent address cannot be empty".to_string()));
        }

        let url = reqwest::Url::parse(&self.gateway_url).map_err(|e| {
            AmtpError::Config(format!("Invalid gateway URL {}: {e}", self.gateway_url))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(AmtpError::Config(format!(
                "Unsupported gateway URL scheme: {}",
                url.scheme()
            )));
        }

        tracing::info!(
            "AMTP session {} initialized for gateway {}",
            self.address,
            self.gateway_url
        );

        let retry_policy = self
            .retry_policy
            .unwrap_or_else(|| Arc::new(ExponentialBackoff::from_config(&self.config)));

        Ok(Session {
            inner: Arc::new(SessionInner {
                gateway_url: self.gateway_url,
                mode: self.mode,
                config: self.config,
                connector: self.connector,
                retry_policy,
                schemas: self.schemas,
                supported_schemas: self.supported_schemas,
                address: RwLock::new(self.address),
                token: RwLock::new(self.api_key),
                client: RwLock::new(None),
                connected: AtomicBool::new(false),
                registered: AtomicBool::new(false),
                running: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                shutdown: Notify::new(),
                lifecycle: Mutex::new(()),
                message_handler: RwLock::new(None),
                error_handler: RwLock::new(None),
                counters: Counters::default(),
            }),
        })
    }
}

/// AMTP session with a gateway
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    gateway_url: String,
    mode: DeliveryMode,
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    retry_policy: Arc<dyn RetryPolicy>,
    schemas: Option<Arc<SchemaRegistry>>,
    supported_schemas: Vec<String>,

    address: RwLock<String>,
    token: RwLock<Option<String>>,
    client: RwLock<Option<GatewayClient>>,

    connected: AtomicBool,
    registered: AtomicBool,
    running: AtomicBool,
    /// Bumped on every start; a delivery loop only serves its own run
    generation: AtomicU64,
    shutdown: Notify,
    /// Serializes start/stop
    lifecycle: Mutex<()>,

    message_handler: RwLock<Option<Arc<dyn MessageHandler>>>,
    error_handler: RwLock<Option<Arc<dyn ErrorHandler>>>,
    counters: Counters,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("address", &self.address())
            .field("gateway_url", &self.inner.gateway_url)
            .field("mode", &self.inner.mode)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Start building a session for `address` on `gateway_url`
    pub fn builder(address: impl Into<String>, gateway_url: impl Into<String>) -> SessionBuilder {
        SessionBuilder {
            address: address.into(),
            gateway_url: gateway_url.into(),
            mode: DeliveryMode::Pull,
            config: SessionConfig::default(),
            api_key: None,
            supported_schemas: Vec::new(),
            schemas: None,
            connector: Arc::new(HttpConnector),
            retry_policy: None,
        }
    }

    /// Builder pre-filled from a loaded [`Config`]
    pub fn builder_from_config(config: &Config) -> Result<SessionBuilder> {
        let address = config
            .agent
            .address
            .clone()
            .ok_or_else(|| AmtpError::Config("Agent address is not configured".to_string()))?;

        let mut builder = Self::builder(address, config.agent.gateway_url.clone())
            .delivery_mode(config.agent.delivery_mode)
            .config(config.session.clone())
            .supported_schemas(config.agent.supported_schemas.clone());
        if let Some(key) = &config.agent.api_key {
            builder = builder.api_key(key.clone());
        }
        Ok(builder)
    }

    // ---- accessors ----

    /// Current address (may have been rewritten by registration)
    pub fn address(&self) -> String {
        read(&self.inner.address).clone()
    }

    /// Gateway base URL
    pub fn gateway_url(&self) -> &str {
        &self.inner.gateway_url
    }

    /// Delivery mode
    pub fn delivery_mode(&self) -> DeliveryMode {
        self.inner.mode
    }

    /// Session configuration
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Whether an auth token is held
    pub fn has_token(&self) -> bool {
        read(&self.inner.token).is_some()
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        if self.inner.running.load(Ordering::SeqCst) {
            SessionState::Running
        } else if self.inner.registered.load(Ordering::SeqCst) {
            SessionState::Registered
        } else if self.inner.connected.load(Ordering::SeqCst) {
            SessionState::Connected
        } else {
            SessionState::Idle
        }
    }

    /// Check if the session is running
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Check if a schema id is accepted by this agent.
    ///
    /// With no supported schemas configured every id is accepted.
    pub fn supports_schema(&self, schema_id: &str) -> bool {
        self.inner.supported_schemas.is_empty()
            || self
                .inner
                .supported_schemas
                .iter()
                .any(|pattern| schema_pattern_matches(pattern, schema_id))
    }

    /// Counter snapshot
    pub fn stats(&self) -> SessionStats {
        let c = &self.inner.counters;
        SessionStats {
            messages_sent: c.sent.load(Ordering::Relaxed),
            messages_received: c.received.load(Ordering::Relaxed),
            messages_acknowledged: c.acknowledged.load(Ordering::Relaxed),
            replies_sent: c.replies.load(Ordering::Relaxed),
            delivery_failures: c.failures.load(Ordering::Relaxed),
        }
    }

    /// Set the handler invoked for every pulled message
    pub fn on_message(&self, handler: impl MessageHandler) {
        *write(&self.inner.message_handler) = Some(Arc::new(handler));
    }

    /// Set the handler invoked for delivery failures
    pub fn on_error(&self, handler: impl ErrorHandler) {
        *write(&self.inner.error_handler) = Some(Arc::new(handler));
    }

    // ---- lifecycle ----

    /// Open the gateway connection and check `/health`. No-op when connected.
    pub async fn connect(&self) -> Result<()> {
        if self.inner.connected.load(Ordering::SeqCst) {
            return Ok(());
        }

        let connection = self
            .inner
            .connector
            .open(&self.inner.gateway_url, &self.inner.config)?;
        let client = GatewayClient::new(connection, Arc::clone(&self.inner.retry_policy));

        // The connection is dropped unless the liveness check passes.
        client
            .request(&GatewayRequest::get("/health"))
            .await
            .map_err(|e| AmtpError::Connection(format!("Failed to connect to gateway: {e}")))?;

        *write(&self.inner.client) = Some(client);
        self.inner.connected.store(true, Ordering::SeqCst);
        tracing::info!("Connected to AMTP gateway {}", self.inner.gateway_url);
        Ok(())
    }

    /// Release the gateway connection
    pub fn close(&self) {
        let had_client = write(&self.inner.client).take().is_some();
        self.inner.connected.store(false, Ordering::SeqCst);
        if had_client {
            tracing::info!("Disconnected from gateway");
        }
    }

    /// Register with the gateway, connecting first if needed. No-op when
    /// registered.
    pub async fn register(&self) -> Result<()> {
        if self.inner.registered.load(Ordering::SeqCst) {
            return Ok(());
        }

        self.connect()
            .await
            .map_err(|e| AmtpError::Registration(e.to_string()))?;
        let client = self
            .client()
            .map_err(|e| AmtpError::Registration(e.to_string()))?;

        let address = self.address();
        let mut body = json!({
            "address": address,
            "delivery_mode": self.inner.mode.as_str(),
        });
        if !self.inner.supported_schemas.is_empty() {
            body["supported_schemas"] = json!(self.inner.supported_schemas);
        }

        let response = client
            .request(&GatewayRequest::post("/v1/admin/agents", body))
            .await
            .map_err(|e| AmtpError::Registration(format!("Failed to register: {e}")))?;

        {
            let mut token = write(&self.inner.token);
            if let Some(issued) = issued_token(&response) {
                *token = Some(issued);
            }
            match token.as_deref() {
                Some(t) => tracing::debug!("Using API key {}...", token_prefix(t)),
                None => tracing::warn!("No API key received from gateway"),
            }
        }

        if let Some(assigned) = response.pointer("/agent/address").and_then(Value::as_str) {
            if !assigned.is_empty() && assigned != address {
                tracing::info!("Gateway assigned address {} (was {})", assigned, address);
                *write(&self.inner.address) = assigned.to_string();
            }
        }

        self.inner.registered.store(true, Ordering::SeqCst);
        tracing::info!(
            "Registered {} with {} delivery mode",
            self.address(),
            self.inner.mode
        );
        Ok(())
    }

    /// Best-effort unregistration. No-op when not registered; failures are
    /// logged and the registered flag is cleared regardless.
    pub async fn unregister(&self) {
        if !self.inner.registered.load(Ordering::SeqCst) {
            return;
        }

        let address = self.address();
        match self.client() {
            Ok(client) => {
                let request =
                    GatewayRequest::delete(format!("/v1/admin/agents/{}", local_part(&address)))
                        .bearer(self.token());
                match client.request(&request).await {
                    Ok(_) => tracing::info!("Unregistered {} from gateway", address),
                    Err(e) => tracing::warn!("Failed to unregister {}: {}", address, e),
                }
            }
            Err(e) => tracing::warn!("Failed to unregister {}: {}", address, e),
        }

        self.inner.registered.store(false, Ordering::SeqCst);
    }

    /// Connect, register and start serving. In pull mode this spawns the
    /// delivery loop.
    ///
    /// On failure the session is torn down and the cause is wrapped in
    /// [`AmtpError::Start`].
    pub async fn start(&self) -> Result<()> {
        let _guard = self.inner.lifecycle.lock().await;
        if self.inner.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        let outcome = match self.connect().await {
            Ok(()) => self.register().await,
            Err(e) => Err(e),
        };
        if let Err(cause) = outcome {
            tracing::error!("Failed to start session for {}: {}", self.address(), cause);
            self.teardown();
            return Err(AmtpError::Start(Box::new(cause)));
        }

        self.inner.running.store(true, Ordering::SeqCst);
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(
            "Session {} started in {} mode",
            self.address(),
            self.inner.mode
        );

        if self.inner.mode == DeliveryMode::Pull {
            tokio::spawn(delivery::run(self.clone(), generation));
        }
        Ok(())
    }

    /// Stop serving: clear the running flag, wake the delivery loop,
    /// unregister and close. No-op when not running.
    pub async fn stop(&self) {
        let _guard = self.inner.lifecycle.lock().await;
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }

        self.inner.shutdown.notify_waiters();
        self.unregister().await;
        self.close();
        tracing::info!("Session {} stopped", self.address());
    }

    /// Start, wait for `shutdown` to resolve, then stop
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        self.start().await?;
        shutdown.await;
        self.stop().await;
        Ok(())
    }

    fn teardown(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.registered.store(false, Ordering::SeqCst);
        self.close();
    }

    // ---- messaging ----

    /// Send a message, connecting first if needed.
    ///
    /// Fills in the sender, validates the message (and its payload when the
    /// attached schema registry knows its schema) and enforces the size
    /// quota before any network I/O. Returns the gateway-assigned message
    /// ID, or the local one if the gateway returned none.
    pub async fn send(&self, message: Message) -> Result<String> {
        let message = self.prepare(message)?;
        if !self.inner.connected.load(Ordering::SeqCst) {
            self.connect().await?;
        }
        self.submit(&message).await
    }

    /// Send on the current connection without reconnecting
    pub(super) async fn dispatch(&self, message: Message) -> Result<String> {
        let message = self.prepare(message)?;
        self.submit(&message).await
    }

    fn prepare(&self, mut message: Message) -> Result<Message> {
        if message.sender.is_empty() {
            message.sender = self.address();
        }
        message.validate()?;

        if let (Some(registry), Some(schema_id), Some(payload)) =
            (&self.inner.schemas, &message.schema, &message.payload)
        {
            if registry.contains(schema_id) {
                registry.validate(schema_id, payload)?;
            }
        }

        let size = message.size_bytes()?;
        let max = self.inner.config.max_message_size;
        if size > max {
            return Err(AmtpError::MessageTooLarge { size, max });
        }
        Ok(message)
    }

    async fn submit(&self, message: &Message) -> Result<String> {
        let client = self.client()?;
        let request = GatewayRequest::post("/v1/messages", message.to_transport()?)
            .bearer(self.token());
        let response = client.request(&request).await?;

        self.inner.counters.sent.fetch_add(1, Ordering::Relaxed);
        let message_id = response
            .get("message_id")
            .and_then(Value::as_str)
            .map_or_else(|| message.message_id.clone(), str::to_string);
        tracing::info!(
            "Message {} sent to {} recipient(s)",
            message_id,
            message.recipients.len()
        );
        Ok(message_id)
    }

    /// Pull up to `limit` messages from the inbox (pull mode only)
    pub async fn receive_batch(&self, limit: usize) -> Result<Vec<Message>> {
        self.require_pull("receive_batch")?;
        let client = self.client()?;

        let request = GatewayRequest::get(format!("/v1/inbox/{}", self.address()))
            .query("limit", limit)
            .bearer(self.token());
        let response = client.request(&request).await?;

        let messages = match response.get("messages") {
            Some(Value::Array(items)) => items
                .iter()
                .map(Message::from_transport)
                .collect::<Result<Vec<_>>>()?,
            _ => Vec::new(),
        };

        if !messages.is_empty() {
            self.inner
                .counters
                .received
                .fetch_add(messages.len() as u64, Ordering::Relaxed);
            tracing::debug!("Received {} message(s)", messages.len());
        }
        Ok(messages)
    }

    /// Remove a consumed message from the inbox (pull mode only)
    pub async fn acknowledge(&self, message_id: &str) -> Result<()> {
        self.require_pull("acknowledge")?;
        let client = self.client()?;

        let request =
            GatewayRequest::delete(format!("/v1/inbox/{}/{}", self.address(), message_id))
                .bearer(self.token());
        client.request(&request).await?;

        self.inner.counters.acknowledged.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Message {} acknowledged", message_id);
        Ok(())
    }

    fn require_pull(&self, operation: &str) -> Result<()> {
        if self.inner.mode == DeliveryMode::Pull {
            Ok(())
        } else {
            Err(AmtpError::Mode(format!(
                "{operation}() only works in pull delivery mode"
            )))
        }
    }

    fn client(&self) -> Result<GatewayClient> {
        read(&self.inner.client)
            .clone()
            .ok_or_else(|| AmtpError::Connection("Not connected to gateway".to_string()))
    }

    fn token(&self) -> Option<String> {
        read(&self.inner.token).clone()
    }

    // ---- delivery loop support ----

    /// Whether the loop started as `generation` should keep going
    pub(super) fn is_serving(&self, generation: u64) -> bool {
        self.inner.running.load(Ordering::SeqCst)
            && self.inner.generation.load(Ordering::SeqCst) == generation
    }

    /// Sleep for `duration`, returning early when the session stops
    pub(super) async fn pause(&self, duration: Duration, generation: u64) {
        let notified = self.inner.shutdown.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if !self.is_serving(generation) {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = notified => {}
        }
    }

    pub(super) fn message_handler(&self) -> Option<Arc<dyn MessageHandler>> {
        read(&self.inner.message_handler).clone()
    }

    pub(super) fn error_handler(&self) -> Option<Arc<dyn ErrorHandler>> {
        read(&self.inner.error_handler).clone()
    }

    pub(super) fn record_reply(&self) {
        self.inner.counters.replies.fetch_add(1, Ordering::Relaxed);
    }

    pub(super) fn record_failure(&self) {
        self.inner.counters.failures.fetch_add(1, Ordering::Relaxed);
    }
}

/// Token precedence: `agent.api_key`, `api_key`, `token`, `access_token`
fn issued_token(response: &Value) -> Option<String> {
    ["/agent/api_key", "/api_key", "/token", "/access_token"]
        .iter()
        .filter_map(|pointer| response.pointer(pointer).and_then(Value::as_str))
        .find(|t| !t.is_empty())
        .map(str::to_string)
}

fn token_prefix(token: &str) -> &str {
    token
        .char_indices()
        .nth(8)
        .map_or(token, |(idx, _)| &token[..idx])
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
