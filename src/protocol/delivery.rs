//! Pull-mode delivery loop.
//!
//! One task per [`Session::start`](super::Session::start) in pull mode. It
//! polls the inbox, hands each message to the registered
//! [`MessageHandler`], sends the handler's reply (if any) and acknowledges
//! the message. A failure while processing one message is reported to the
//! [`ErrorHandler`] and leaves that message unacknowledged; the rest of the
//! batch and the loop carry on.

use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use thiserror::Error;

use super::message::Message;
use super::session::Session;
use crate::error::AmtpError;

/// What a message handler wants done after processing
#[derive(Debug, Clone, Default, PartialEq)]
pub enum HandlerResponse {
    /// Acknowledge only
    #[default]
    NoReply,
    /// Send this payload back to the sender, then acknowledge
    Reply(Value),
}

impl HandlerResponse {
    /// Reply payload, if it is worth sending.
    ///
    /// `null`, `{}`, `[]` and `""` count as no reply.
    pub fn into_reply(self) -> Option<Value> {
        match self {
            Self::NoReply => None,
            Self::Reply(payload) if is_empty(&payload) => None,
            Self::Reply(payload) => Some(payload),
        }
    }
}

impl From<Option<Value>> for HandlerResponse {
    fn from(payload: Option<Value>) -> Self {
        payload.map_or(Self::NoReply, Self::Reply)
    }
}

fn is_empty(payload: &Value) -> bool {
    match payload {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

/// Processes pulled messages.
///
/// Implemented for any `Fn(Message) -> impl Future<Output = anyhow::Result<HandlerResponse>>`.
pub trait MessageHandler: Send + Sync + 'static {
    /// Handle one message
    fn handle(&self, message: Message) -> BoxFuture<'static, anyhow::Result<HandlerResponse>>;
}

impl<F, Fut> MessageHandler for F
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<HandlerResponse>> + Send + 'static,
{
    fn handle(&self, message: Message) -> BoxFuture<'static, anyhow::Result<HandlerResponse>> {
        Box::pin(self(message))
    }
}

/// Receives delivery failures.
///
/// Implemented for any `Fn(DeliveryFailure) -> impl Future<Output = anyhow::Result<()>>`.
pub trait ErrorHandler: Send + Sync + 'static {
    /// Handle one failure
    fn handle(&self, failure: DeliveryFailure) -> BoxFuture<'static, anyhow::Result<()>>;
}

impl<F, Fut> ErrorHandler for F
where
    F: Fn(DeliveryFailure) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn handle(&self, failure: DeliveryFailure) -> BoxFuture<'static, anyhow::Result<()>> {
        Box::pin(self(failure))
    }
}

/// A failure inside the delivery loop
#[derive(Error, Debug)]
pub enum DeliveryFailure {
    /// The message handler returned an error or panicked
    #[error("Handler failed for message {message_id}: {error}")]
    Handler {
        /// Message being processed
        message_id: String,
        /// Handler error
        error: anyhow::Error,
    },

    /// The reply could not be sent
    #[error("Failed to reply to message {message_id}: {error}")]
    Reply {
        /// Message being answered
        message_id: String,
        /// Send error
        #[source]
        error: AmtpError,
    },

    /// The message could not be acknowledged
    #[error("Failed to acknowledge message {message_id}: {error}")]
    Acknowledge {
        /// Message being acknowledged
        message_id: String,
        /// Acknowledge error
        #[source]
        error: AmtpError,
    },

    /// The inbox poll failed
    #[error("Failed to poll inbox: {0}")]
    Poll(#[source] AmtpError),
}

impl DeliveryFailure {
    /// ID of the message involved, if any
    pub fn message_id(&self) -> Option<&str> {
        match self {
            Self::Handler { message_id, .. }
            | Self::Reply { message_id, .. }
            | Self::Acknowledge { message_id, .. } => Some(message_id),
            Self::Poll(_) => None,
        }
    }
}

pub(super) async fn run(session: Session, generation: u64) {
    let address = session.address();
    let config = session.config().clone();
    tracing::info!("Delivery loop started for {}", address);

    if !session.has_token() {
        tracing::warn!("No API key available, continuing without authentication");
    }

    while session.is_serving(generation) {
        match session.receive_batch(config.batch_size).await {
            Ok(messages) => {
                for message in messages {
                    if !session.is_serving(generation) {
                        break;
                    }
                    process(&session, message).await;
                }
                session.pause(config.poll_interval(), generation).await;
            }
            Err(err) => {
                if !session.is_serving(generation) {
                    break;
                }
                report(&session, DeliveryFailure::Poll(err)).await;
                session.pause(config.retry_delay(), generation).await;
            }
        }
    }

    tracing::info!("Delivery loop stopped for {}", address);
}

async fn process(session: &Session, message: Message) {
    let message_id = message.message_id.clone();

    let response = match session.message_handler() {
        Some(handler) => {
            let invocation = AssertUnwindSafe(async { handler.handle(message.clone()).await });
            match invocation.catch_unwind().await {
                Ok(Ok(response)) => response,
                Ok(Err(error)) => {
                    report(session, DeliveryFailure::Handler { message_id, error }).await;
                    return;
                }
                Err(panic) => {
                    let error = anyhow::anyhow!("handler panicked: {}", panic_message(&*panic));
                    report(session, DeliveryFailure::Handler { message_id, error }).await;
                    return;
                }
            }
        }
        None => HandlerResponse::NoReply,
    };

    if let Some(payload) = response.into_reply() {
        if !message.sender.is_empty() {
            match session.dispatch(message.reply(payload, None)).await {
                Ok(_) => session.record_reply(),
                Err(error) => {
                    report(session, DeliveryFailure::Reply { message_id, error }).await;
                    return;
                }
            }
        }
    }

    if let Err(error) = session.acknowledge(&message_id).await {
        report(session, DeliveryFailure::Acknowledge { message_id, error }).await;
    }
}

async fn report(session: &Session, failure: DeliveryFailure) {
    session.record_failure();
    tracing::error!("{}", failure);

    let Some(handler) = session.error_handler() else {
        return;
    };
    let invocation = AssertUnwindSafe(async { handler.handle(failure).await });
    match invocation.catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("Error in error handler: {}", e),
        Err(panic) => tracing::error!("Error handler panicked: {}", panic_message(&*panic)),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::protocol::DeliveryMode;
    use crate::transport::testing::{json_response, MockGateway};
    use reqwest::Method;
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn inbox(messages: Vec<Message>) -> Arc<MockGateway> {
        let wire: Vec<Value> = messages.iter().map(|m| m.to_transport().unwrap()).collect();
        let served = std::sync::atomic::AtomicBool::new(false);
        MockGateway::new(move |req| match (req.method.clone(), req.path.as_str()) {
            (Method::GET, "/health") => json_response(200, json!({})),
            (Method::POST, "/v1/admin/agents") => {
                json_response(201, json!({"agent": {"address": "echo@localhost", "api_key": "k"}}))
            }
            (Method::GET, _) => {
                // Serve the batch once, then an empty inbox
                if served.swap(true, std::sync::atomic::Ordering::SeqCst) {
                    json_response(200, json!({"messages": []}))
                } else {
                    json_response(200, json!({"messages": wire.clone()}))
                }
            }
            _ => json_response(200, json!({})),
        })
    }

    fn session(gateway: &Arc<MockGateway>) -> Session {
        Session::builder("echo@localhost", "http://gateway.test")
            .delivery_mode(DeliveryMode::Pull)
            .config(
                SessionConfig::default()
                    .with_poll_interval(Duration::from_secs(60))
                    .with_retry_delay(Duration::from_millis(10)),
            )
            .connector(Arc::clone(gateway))
            .build()
            .unwrap()
    }

    fn inbound(n: usize) -> Message {
        Message::new("shop@localhost", ["echo@localhost"])
            .with_subject(format!("order {n}"))
            .with_payload(json!({"n": n}))
    }

    async fn wait_for(mut done: impl FnMut() -> bool) {
        for _ in 0..200 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_handler_response_emptiness() {
        assert_eq!(HandlerResponse::NoReply.into_reply(), None);
        assert_eq!(HandlerResponse::Reply(json!({})).into_reply(), None);
        assert_eq!(HandlerResponse::Reply(Value::Null).into_reply(), None);
        assert_eq!(HandlerResponse::Reply(json!("")).into_reply(), None);
        assert_eq!(
            HandlerResponse::Reply(json!({"ok": true})).into_reply(),
            Some(json!({"ok": true}))
        );
        assert_eq!(HandlerResponse::from(Some(json!(0))).into_reply(), Some(json!(0)));
    }

    #[test]
    fn test_failure_message_id() {
        let failure = DeliveryFailure::Handler {
            message_id: "m-1".into(),
            error: anyhow::anyhow!("boom"),
        };
        assert_eq!(failure.message_id(), Some("m-1"));
        assert_eq!(failure.to_string(), "Handler failed for message m-1: boom");

        let poll = DeliveryFailure::Poll(AmtpError::Connection("down".into()));
        assert_eq!(poll.message_id(), None);
    }

    #[tokio::test]
    async fn test_replies_and_acknowledges() {
        let messages = vec![inbound(1), inbound(2)];
        let ids: Vec<String> = messages.iter().map(|m| m.message_id.clone()).collect();
        let gateway = inbox(messages);
        let session = session(&gateway);

        session.on_message(|msg: Message| async move {
            anyhow::Ok(HandlerResponse::Reply(json!({"echo": msg.payload})))
        });
        session.start().await.unwrap();

        wait_for(|| session.stats().messages_acknowledged == 2).await;
        session.stop().await;

        let requests = gateway.requests();
        let replies: Vec<_> = requests
            .iter()
            .filter(|r| r.method == Method::POST && r.path == "/v1/messages")
            .map(|r| r.body.clone().unwrap())
            .collect();
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0]["in_reply_to"], ids[0].as_str());
        assert_eq!(replies[0]["subject"], "Re: order 1");
        assert_eq!(replies[0]["sender"], "echo@localhost");
        assert_eq!(replies[0]["recipients"], json!(["shop@localhost"]));

        let acks: Vec<_> = requests
            .iter()
            .filter(|r| r.method == Method::DELETE && r.path.starts_with("/v1/inbox/"))
            .map(|r| r.path.clone())
            .collect();
        assert_eq!(
            acks,
            vec![
                format!("/v1/inbox/echo@localhost/{}", ids[0]),
                format!("/v1/inbox/echo@localhost/{}", ids[1]),
            ]
        );

        let stats = session.stats();
        assert_eq!(stats.messages_received, 2);
        assert_eq!(stats.replies_sent, 2);
        assert_eq!(stats.delivery_failures, 0);
    }

    #[tokio::test]
    async fn test_without_handler_only_acknowledges() {
        let gateway = inbox(vec![inbound(1)]);
        let session = session(&gateway);

        session.start().await.unwrap();
        wait_for(|| session.stats().messages_acknowledged == 1).await;
        session.stop().await;

        assert!(!gateway.calls().contains(&"POST /v1/messages".to_string()));
    }

    #[tokio::test]
    async fn test_failure_isolated_to_one_message() {
        let messages = vec![inbound(1), inbound(2), inbound(3)];
        let failing_id = messages[1].message_id.clone();
        let gateway = inbox(messages);
        let session = session(&gateway);

        session.on_message(|msg: Message| async move {
            if msg.payload == Some(json!({"n": 2})) {
                anyhow::bail!("cannot process order 2");
            }
            anyhow::Ok(HandlerResponse::NoReply)
        });

        let failures = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&failures);
        session.on_error(move |failure: DeliveryFailure| {
            let seen = Arc::clone(&seen);
            async move {
                seen.lock().unwrap().push(failure.message_id().map(str::to_string));
                anyhow::Ok(())
            }
        });

        session.start().await.unwrap();
        wait_for(|| session.stats().messages_acknowledged == 2).await;
        session.stop().await;

        assert_eq!(*failures.lock().unwrap(), vec![Some(failing_id.clone())]);
        assert!(!gateway
            .calls()
            .contains(&format!("DELETE /v1/inbox/echo@localhost/{failing_id}")));
        assert_eq!(session.stats().delivery_failures, 1);
    }

    #[tokio::test]
    async fn test_handler_panic_is_contained() {
        let gateway = inbox(vec![inbound(1), inbound(2)]);
        let session = session(&gateway);

        session.on_message(|msg: Message| async move {
            if msg.payload == Some(json!({"n": 1})) {
                panic!("handler bug");
            }
            anyhow::Ok(HandlerResponse::NoReply)
        });
        // A failing error handler must not take the loop down either
        session.on_error(|_failure: DeliveryFailure| async move {
            Err::<(), _>(anyhow::anyhow!("error handler failed"))
        });

        session.start().await.unwrap();
        wait_for(|| session.stats().messages_acknowledged == 1).await;
        assert!(session.is_running());
        session.stop().await;

        assert_eq!(session.stats().delivery_failures, 1);
    }

    #[tokio::test]
    async fn test_poll_failure_reported_and_retried() {
        let polls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&polls);
        let gateway = MockGateway::new(move |req| match (req.method.clone(), req.path.as_str()) {
            (Method::GET, "/health") => json_response(200, json!({})),
            (Method::POST, _) => json_response(201, json!({"api_key": "k"})),
            (Method::GET, _) => {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                json_response(500, json!({"error": "inbox unavailable"}))
            }
            _ => json_response(200, json!({})),
        });
        let session = session(&gateway);

        let polled = Arc::new(Mutex::new(0));
        let seen = Arc::clone(&polled);
        session.on_error(move |failure: DeliveryFailure| {
            let seen = Arc::clone(&seen);
            async move {
                if matches!(failure, DeliveryFailure::Poll(_)) {
                    *seen.lock().unwrap() += 1;
                }
                anyhow::Ok(())
            }
        });

        session.start().await.unwrap();
        wait_for(|| *polled.lock().unwrap() >= 2).await;
        session.stop().await;

        assert!(polls.load(std::sync::atomic::Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_stop_interrupts_poll_sleep() {
        let gateway = inbox(Vec::new());
        let session = session(&gateway);

        session.start().await.unwrap();
        wait_for(|| gateway.calls().iter().any(|c| c.starts_with("GET /v1/inbox/"))).await;

        // Poll interval is 60s; stop must not wait for it
        tokio::time::timeout(Duration::from_secs(5), session.stop())
            .await
            .unwrap();
        assert!(!session.is_running());
    }
}
