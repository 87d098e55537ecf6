//! AMTP session lifecycle, messages and pull-mode delivery.
//!
//! An agent talks to its gateway through a [`Session`]: it connects,
//! registers its address, and then either polls its inbox (pull mode) or
//! waits for the gateway to deliver (push mode).
//!
//! ## Message Flow
//!
//! ```text
//! Agent                             Gateway
//!    |                                 |
//!    |-------- GET /health ---------->|  connect
//!    |-------- POST /v1/admin/agents->|  register (address, mode)
//!    |<------- {agent: {api_key}} ----|
//!    |                                 |
//!    |-------- POST /v1/messages ---->|  send
//!    |                                 |
//!    |-------- GET /v1/inbox/{addr} ->|  poll (pull mode)
//!    |<------- {messages: [...]} -----|
//!    |-------- DELETE .../{id} ------>|  acknowledge
//!    |                                 |
//!    |-------- DELETE /v1/admin/... ->|  unregister
//! ```
//!
//! ## State Machine
//!
//! | State        | Description                         | Valid Transitions   |
//! |--------------|-------------------------------------|---------------------|
//! | `Idle`       | No connection                       | → Connected         |
//! | `Connected`  | Gateway reachable                   | → Registered, Idle  |
//! | `Registered` | Address known to the gateway        | → Running, Idle     |
//! | `Running`    | Serving (delivery loop in pull mode)| → Idle              |
//!
//! # Usage
//!
//! ```rust,ignore
//! use amtp::protocol::{HandlerResponse, Message, Session};
//!
//! let session = Session::builder("echo@localhost", "http://localhost:8080").build()?;
//! session.on_message(|msg: Message| async move {
//!     anyhow::Ok(HandlerResponse::Reply(msg.payload.unwrap_or_default()))
//! });
//! session.start().await?;
//! session.send(Message::new("", ["other@localhost"]).with_subject("hi")).await?;
//! session.stop().await;
//! ```

mod delivery;
mod message;
mod session;

pub use delivery::{DeliveryFailure, ErrorHandler, HandlerResponse, MessageHandler};
pub use message::{
    format_timestamp, is_valid_address, is_valid_schema_ref, local_part, parse_timestamp, Message,
};
pub use session::{Session, SessionBuilder, SessionState, SessionStats};

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Protocol version
pub const PROTOCOL_VERSION: &str = "1.0";

/// How inbound messages reach the agent
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// The agent polls its inbox and acknowledges what it consumed
    #[default]
    Pull,
    /// The gateway delivers directly
    Push,
}

impl DeliveryMode {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pull => "pull",
            Self::Push => "push",
        }
    }
}

impl fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pull" => Ok(Self::Pull),
            "push" => Ok(Self::Push),
            _ => Err(format!("Unknown delivery mode: {}", s)),
        }
    }
}
