//! # AMTP - Agent Message Transfer Protocol client
//!
//! Client-side protocol engine for agents exchanging messages through an
//! AMTP gateway: session lifecycle, retrying transport, pull-mode delivery
//! and schema validation of message payloads.
//!
//! ## Features
//!
//! - **Session lifecycle**: connect, register, run, stop, with token and
//!   address handed out by the gateway
//! - **Retrying transport**: exponential backoff for connection-level
//!   failures, typed errors for application responses
//! - **Pull-mode delivery**: background loop that polls, dispatches to a
//!   handler, replies and acknowledges, isolating per-message failures
//! - **Schema validation**: versioned schemas checked recursively against
//!   arbitrary nested payloads
//!
//! ## Protocol Overview
//!
//! ### Architecture
//!
//! ```text
//! Agent A                       Gateway                        Agent B
//!    |                              |                               |
//!    |---- register (pull) -------->|<------- register (pull) ------|
//!    |<--- api_key, address --------|-------- api_key, address ---->|
//!    |                              |                               |
//!    |---- POST /v1/messages ------>|                               |
//!    |                              |<------- GET /v1/inbox --------|
//!    |                              |-------- [message] ----------->|
//!    |                              |<------- DELETE (ack) ---------|
//!    |                              |<------- POST reply -----------|
//!    |<--- GET /v1/inbox -----------|                               |
//! ```
//!
//! ### Message Envelope
//!
//! | Field             | Required | Notes                                   |
//! |-------------------|----------|-----------------------------------------|
//! | `version`         | yes      | `"1.0"`                                 |
//! | `message_id`      | yes      | UUIDv4, generated when absent           |
//! | `idempotency_key` | yes      | UUIDv4, generated when absent           |
//! | `timestamp`       | yes      | ISO-8601, microsecond precision         |
//! | `sender`          | yes      | `agent@domain`                          |
//! | `recipients`      | yes      | non-empty list of `agent@domain`        |
//! | `subject`         | no       |                                         |
//! | `payload`         | no       | structured JSON                         |
//! | `schema`          | no       | `namespace:category.subcategory.vN`     |
//! | `in_reply_to`     | no       | ID of the answered message              |
//! | `headers`         | no       | JSON object                             |
//! | `attachments`     | no       | JSON array                              |
//!
//! ## Quick Start
//!
//! ### Echo Agent
//!
//! ```rust,ignore
//! use amtp::{HandlerResponse, Message, Session};
//!
//! let session = Session::builder("echo@localhost", "http://localhost:8080").build()?;
//!
//! session.on_message(|msg: Message| async move {
//!     anyhow::Ok(HandlerResponse::Reply(serde_json::json!({
//!         "received": msg.payload,
//!     })))
//! });
//!
//! session.run_until(async { tokio::signal::ctrl_c().await.ok(); }).await?;
//! ```
//!
//! ### Sending With Schema Validation
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use amtp::{Message, Schema, SchemaRegistry, Session};
//!
//! let registry = Arc::new(SchemaRegistry::new());
//! registry.register(Schema::new("agntcy:commerce.order.v1", "Order", "v1", &order_def)?);
//!
//! let session = Session::builder("shop@localhost", "http://localhost:8080")
//!     .schema_registry(Arc::clone(&registry))
//!     .build()?;
//!
//! let message = Message::new("", ["warehouse@localhost"])
//!     .with_schema("agntcy:commerce.order.v1")
//!     .with_payload(order);
//! let id = session.send(message).await?;
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Messages, session lifecycle and the delivery loop
//! - [`schema`]: Schema definitions, registry and validator
//! - [`transport`]: Gateway requests with retry and status mapping
//! - [`config`]: Configuration management
//! - [`error`]: Error types and result aliases

pub mod config;
pub mod error;
pub mod protocol;
pub mod schema;
pub mod transport;

// Re-exports for convenience
pub use config::{AgentConfig, Config, SessionConfig};
pub use error::{AmtpError, Result, TransportError};
pub use protocol::{
    DeliveryFailure, DeliveryMode, HandlerResponse, Message, Session, SessionState, SessionStats,
    PROTOCOL_VERSION,
};
pub use schema::{Schema, SchemaRegistry, SchemaViolation};
pub use transport::{Connector, HttpConnector};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
