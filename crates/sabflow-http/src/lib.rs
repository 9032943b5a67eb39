//! `reqwest`-backed implementation of the SabFlow [`ApiClient`] trait.
//!
//! The client enforces connect and total-request timeouts so a slow API can
//! never stall flow processing indefinitely. Any HTTP status is a successful
//! call from the client's perspective; the engine decides what a non-2xx
//! status means for the flow.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use sabflow_core::domain::flow_definition::HttpMethod;
use sabflow_core::{ApiCallBody, ApiCallRequest, ApiCallResponse, ApiClient, EngineError};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP client for CallApi nodes
pub struct ReqwestApiClient {
    client: reqwest::Client,
}

impl ReqwestApiClient {
    /// Create a client with the default timeouts (5s connect, 30s total)
    pub fn new() -> Result<Self, EngineError> {
        Self::with_timeouts(DEFAULT_CONNECT_TIMEOUT, DEFAULT_REQUEST_TIMEOUT)
    }

    /// Create a client with explicit timeouts
    pub fn with_timeouts(connect: Duration, total: Duration) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect)
            .timeout(total)
            .build()
            .map_err(|e| EngineError::Configuration(format!("HTTP client build failed: {}", e)))?;
        Ok(Self { client })
    }

    fn method(&self, method: HttpMethod) -> reqwest::Method {
        match method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
        }
    }
}

#[async_trait]
impl ApiClient for ReqwestApiClient {
    async fn execute(&self, request: ApiCallRequest) -> Result<ApiCallResponse, EngineError> {
        let mut builder = self
            .client
            .request(self.method(request.method), &request.url);

        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some((username, password)) = &request.basic_auth {
            builder = builder.basic_auth(username, Some(password));
        }
        match request.body {
            Some(ApiCallBody::Json(ref value)) => {
                builder = builder.json(value);
            }
            Some(ApiCallBody::Form(ref fields)) => {
                builder = builder.form(fields);
            }
            None => {}
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                EngineError::ExternalCall(format!("Request timed out: {}", e))
            } else {
                EngineError::ExternalCall(format!("Request failed: {}", e))
            }
        })?;

        let status = response.status().as_u16();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.to_string(), v.to_string()))
            })
            .collect();

        let text = response
            .text()
            .await
            .map_err(|e| EngineError::ExternalCall(format!("Failed to read body: {}", e)))?;

        // JSON when it parses, otherwise the raw text as a JSON string
        let body = match serde_json::from_str::<Value>(&text) {
            Ok(value) => value,
            Err(_) => Value::String(text),
        };

        tracing::debug!(status, url = %request.url, "API call finished");

        Ok(ApiCallResponse {
            status,
            headers,
            body,
        })
    }
}
