//! In-memory gateway for unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use serde_json::Value;

use super::{Connection, ConnectionFailure, Connector, GatewayRequest, RawResponse};
use crate::config::SessionConfig;
use crate::error::Result;

type Route =
    dyn Fn(&GatewayRequest) -> std::result::Result<RawResponse, ConnectionFailure> + Send + Sync;

/// Answers every request with a routing closure and records what it saw.
pub(crate) struct MockGateway {
    route: Box<Route>,
    requests: Mutex<Vec<GatewayRequest>>,
    opens: AtomicUsize,
}

impl MockGateway {
    pub(crate) fn new<F>(route: F) -> Arc<Self>
    where
        F: Fn(&GatewayRequest) -> std::result::Result<RawResponse, ConnectionFailure>
            + Send
            + Sync
            + 'static,
    {
        Arc::new(Self {
            route: Box::new(route),
            requests: Mutex::new(Vec::new()),
            opens: AtomicUsize::new(0),
        })
    }

    pub(crate) fn requests(&self) -> Vec<GatewayRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// `"METHOD path"` of every request, in order
    pub(crate) fn calls(&self) -> Vec<String> {
        self.requests()
            .iter()
            .map(|r| format!("{} {}", r.method, r.path))
            .collect()
    }

    pub(crate) fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl Connection for MockGateway {
    fn execute<'a>(
        &'a self,
        request: &'a GatewayRequest,
    ) -> BoxFuture<'a, std::result::Result<RawResponse, ConnectionFailure>> {
        self.requests.lock().unwrap().push(request.clone());
        let outcome = (self.route)(request);
        Box::pin(async move { outcome })
    }
}

impl Connector for Arc<MockGateway> {
    fn open(&self, _gateway_url: &str, _config: &SessionConfig) -> Result<Arc<dyn Connection>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::clone(self) as Arc<dyn Connection>)
    }
}

pub(crate) fn json_response(
    status: u16,
    body: Value,
) -> std::result::Result<RawResponse, ConnectionFailure> {
    Ok(RawResponse {
        status,
        content_type: Some("application/json".to_string()),
        body: body.to_string(),
    })
}
