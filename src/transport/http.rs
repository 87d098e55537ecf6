//! reqwest-backed gateway connection.

use std::sync::Arc;

use futures::future::BoxFuture;
use reqwest::header::{ACCEPT, CONTENT_TYPE};

use super::{Connection, ConnectionFailure, Connector, GatewayRequest, RawResponse};
use crate::config::SessionConfig;
use crate::error::{AmtpError, Result};

/// Opens HTTP connections with the session's connect and read timeouts.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpConnector;

impl Connector for HttpConnector {
    fn open(&self, gateway_url: &str, config: &SessionConfig) -> Result<Arc<dyn Connection>> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.read_timeout())
            .user_agent(concat!("amtp/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| AmtpError::Connection(format!("Failed to create HTTP client: {e}")))?;

        Ok(Arc::new(HttpConnection {
            client,
            base_url: gateway_url.trim_end_matches('/').to_string(),
        }))
    }
}

struct HttpConnection {
    client: reqwest::Client,
    base_url: String,
}

impl Connection for HttpConnection {
    fn execute<'a>(
        &'a self,
        request: &'a GatewayRequest,
    ) -> BoxFuture<'a, std::result::Result<RawResponse, ConnectionFailure>> {
        Box::pin(async move {
            let url = format!("{}{}", self.base_url, request.path);
            let mut builder = self
                .client
                .request(request.method.clone(), &url)
                .header(ACCEPT, "application/json");

            if !request.query.is_empty() {
                builder = builder.query(&request.query);
            }
            if let Some(token) = &request.bearer {
                builder = builder.bearer_auth(token);
            }
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            if let Some(body) = &request.body {
                builder = builder.json(body);
            }

            let response = builder.send().await.map_err(classify)?;
            let status = response.status().as_u16();
            let content_type = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let body = response.text().await.map_err(classify)?;

            Ok(RawResponse {
                status,
                content_type,
                body,
            })
        })
    }
}

fn classify(err: reqwest::Error) -> ConnectionFailure {
    if err.is_timeout() {
        ConnectionFailure::Timeout
    } else {
        ConnectionFailure::Network(err.to_string())
    }
}
