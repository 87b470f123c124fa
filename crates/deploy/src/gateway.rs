//! JSON-RPC client for a control-plane gateway.
//!
//! The gateway fronts the control plane, identity broker, object store and
//! cache distribution behind one HTTP endpoint. Requests are JSON-RPC 2.0 with
//! named parameters; transient failures are retried with exponential backoff.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use backon::{ExponentialBuilder, Retryable};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use reqwest::{StatusCode, header::HeaderMap};
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::{Value, json};
use url::Url;

use crate::{
    CacheDistribution, ControlPlane, IdentityBroker, ObjectStore, ProviderError,
    types::{
        ObjectPage, RemoteStack, ScopedCredentials, StackDescriptor, StackEvent, TemplateSource,
        UpdateOutcome,
    },
};

/// Default timeout for one HTTP request.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Retries after the first attempt of a transiently failing call.
const DEFAULT_MAX_RETRIES: usize = 3;

/// First backoff delay; doubles on every retry.
const DEFAULT_MIN_DELAY: Duration = Duration::from_millis(500);

/// JSON-RPC error codes the gateway uses for outcomes callers act on.
pub mod codes {
    pub const ACCESS_DENIED: i64 = -32001;
    pub const NOT_FOUND: i64 = -32004;
    pub const NO_CHANGES: i64 = -32010;
    pub const THROTTLED: i64 = -32029;
    pub const INTERNAL: i64 = -32603;
}

const HEADER_ACCESS_KEY: &str = "x-stackdrop-access-key";
const HEADER_SECRET_KEY: &str = "x-stackdrop-secret-key";
const HEADER_SESSION_TOKEN: &str = "x-stackdrop-session-token";

/// Why a gateway call failed.
#[derive(Debug, Clone, PartialEq, Eq)]
enum GatewayError {
    /// The gateway answered with a JSON-RPC error object.
    Rpc { code: i64, message: String },
    /// The call failed before a JSON-RPC answer was read.
    Provider(ProviderError),
}

impl GatewayError {
    fn is_transient(&self) -> bool {
        match self {
            GatewayError::Rpc { code, .. } => {
                matches!(*code, codes::THROTTLED | codes::INTERNAL)
            }
            GatewayError::Provider(e) => e.is_transient(),
        }
    }

    fn is_code(&self, expected: i64) -> bool {
        matches!(self, GatewayError::Rpc { code, .. } if *code == expected)
    }
}

impl From<GatewayError> for ProviderError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Provider(e) => e,
            GatewayError::Rpc { code, message } => match code {
                codes::ACCESS_DENIED => ProviderError::AccessDenied(message),
                codes::THROTTLED | codes::INTERNAL => ProviderError::Transient(message),
                _ => ProviderError::Request(format!("{message} (code {code})")),
            },
        }
    }
}

/// Map a non-success HTTP status to a provider error.
fn status_error(status: StatusCode, body: &str) -> ProviderError {
    let message = format!("gateway answered {status}: {}", body.trim());
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        ProviderError::Transient(message)
    } else if status == StatusCode::FORBIDDEN || status == StatusCode::UNAUTHORIZED {
        ProviderError::AccessDenied(message)
    } else {
        ProviderError::Request(message)
    }
}

/// Credentials as the gateway encodes them.
#[derive(Deserialize)]
struct CredentialsWire {
    access_key: String,
    secret_key: String,
    session_token: String,
    expires_at: DateTime<Utc>,
}

impl From<CredentialsWire> for ScopedCredentials {
    fn from(wire: CredentialsWire) -> Self {
        Self {
            access_key: wire.access_key,
            secret_key: wire.secret_key,
            session_token: wire.session_token,
            expires_at: wire.expires_at,
        }
    }
}

#[derive(Deserialize)]
struct InvalidationWire {
    id: String,
    #[serde(default)]
    status: Option<String>,
}

/// [`CloudBackend`](crate::CloudBackend) backed by a JSON-RPC gateway.
pub struct HttpGateway {
    client: reqwest::Client,
    url: Url,
    backoff: ExponentialBuilder,
    next_id: AtomicU64,
}

impl HttpGateway {
    pub fn new(url: Url) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| ProviderError::Request(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            url,
            backoff: ExponentialBuilder::default()
                .with_min_delay(DEFAULT_MIN_DELAY)
                .with_max_times(DEFAULT_MAX_RETRIES),
            next_id: AtomicU64::new(1),
        })
    }

    /// Override the retry policy for transient failures.
    pub fn with_retry(mut self, min_delay: Duration, max_retries: usize) -> Self {
        self.backoff = ExponentialBuilder::default()
            .with_min_delay(min_delay)
            .with_max_times(max_retries);
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Make a JSON-RPC call, retrying transient failures.
    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
        credentials: Option<&ScopedCredentials>,
    ) -> Result<T, GatewayError> {
        let result = (|| self.call_once(method, &params, credentials))
            .retry(self.backoff)
            .when(GatewayError::is_transient)
            .notify(|err, delay| {
                tracing::debug!(method, ?err, ?delay, "Gateway call failed, retrying...");
            })
            .await?;

        decode(method, result)
    }

    /// Make a JSON-RPC call exactly once.
    ///
    /// For requests that start an operation: a lost response may hide an
    /// accepted request, and sending it again would be rejected.
    async fn call_unretried<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, GatewayError> {
        let result = self.call_once(method, &params, None).await?;
        decode(method, result)
    }

    async fn call_once(
        &self,
        method: &str,
        params: &Value,
        credentials: Option<&ScopedCredentials>,
    ) -> Result<Value, GatewayError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let mut request = self.client.post(self.url.clone()).json(&json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": id
        }));
        if let Some(credentials) = credentials {
            request = request.headers(credential_headers(credentials)?);
        }

        let response = request.send().await.map_err(|e| {
            GatewayError::Provider(ProviderError::Transient(format!(
                "failed to send {method} request: {e}"
            )))
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Provider(status_error(status, &body)));
        }

        let body: Value = response.json().await.map_err(|e| {
            GatewayError::Provider(ProviderError::Transient(format!(
                "failed to parse {method} response: {e}"
            )))
        })?;

        parse_response(body)
    }
}

fn decode<T: DeserializeOwned>(method: &str, result: Value) -> Result<T, GatewayError> {
    serde_json::from_value(result).map_err(|e| {
        GatewayError::Provider(ProviderError::Request(format!(
            "failed to deserialize {method} result: {e}"
        )))
    })
}

/// Split a JSON-RPC response into its result or error.
fn parse_response(mut body: Value) -> Result<Value, GatewayError> {
    if let Some(error) = body.get("error").filter(|e| !e.is_null()) {
        return Err(GatewayError::Rpc {
            code: error.get("code").and_then(Value::as_i64).unwrap_or(0),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
        });
    }

    match body.get_mut("result") {
        Some(result) => Ok(result.take()),
        None => Err(GatewayError::Provider(ProviderError::Request(
            "no result in response".to_string(),
        ))),
    }
}

fn credential_headers(credentials: &ScopedCredentials) -> Result<HeaderMap, GatewayError> {
    let invalid = |_| {
        GatewayError::Provider(ProviderError::Request(
            "credentials contain characters not allowed in a header".to_string(),
        ))
    };

    let mut headers = HeaderMap::new();
    headers.insert(HEADER_ACCESS_KEY, credentials.access_key.parse().map_err(invalid)?);
    headers.insert(HEADER_SECRET_KEY, credentials.secret_key.parse().map_err(invalid)?);
    headers.insert(
        HEADER_SESSION_TOKEN,
        credentials.session_token.parse().map_err(invalid)?,
    );
    Ok(headers)
}

/// Stack parameters of a create or update call. File templates are sent
/// inline.
async fn stack_params(descriptor: &StackDescriptor) -> Result<Value, ProviderError> {
    let mut params = json!({
        "name": descriptor.name,
        "parameters": descriptor.parameters,
        "capabilities": descriptor.capabilities,
        "execution_role": descriptor.execution_role,
    });

    match &descriptor.template {
        TemplateSource::File(path) => {
            let body = tokio::fs::read_to_string(path).await.map_err(|e| {
                ProviderError::Request(format!("failed to read template {}: {e}", path.display()))
            })?;
            params["template_body"] = Value::String(body);
        }
        TemplateSource::Url(url) => {
            params["template_url"] = Value::String(url.to_string());
        }
    }

    Ok(params)
}

impl ControlPlane for HttpGateway {
    async fn describe_stack(&self, name: &str) -> Result<Option<RemoteStack>, ProviderError> {
        match self
            .call("stack.describe", json!({ "name": name }), None)
            .await
        {
            Ok(stack) => Ok(stack),
            Err(e) if e.is_code(codes::NOT_FOUND) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_stack(&self, descriptor: &StackDescriptor) -> Result<(), ProviderError> {
        let params = stack_params(descriptor).await?;
        self.call_unretried::<Value>("stack.create", params).await?;
        Ok(())
    }

    async fn update_stack(
        &self,
        descriptor: &StackDescriptor,
    ) -> Result<UpdateOutcome, ProviderError> {
        let params = stack_params(descriptor).await?;
        match self.call_unretried::<Value>("stack.update", params).await {
            Ok(_) => Ok(UpdateOutcome::Started),
            Err(e) if e.is_code(codes::NO_CHANGES) => Ok(UpdateOutcome::NoChanges),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_stack(&self, name: &str) -> Result<(), ProviderError> {
        self.call::<Value>("stack.delete", json!({ "name": name }), None)
            .await?;
        Ok(())
    }

    async fn list_stack_events(&self, name: &str) -> Result<Vec<StackEvent>, ProviderError> {
        Ok(self
            .call("stack.events", json!({ "name": name }), None)
            .await?)
    }
}

impl IdentityBroker for HttpGateway {
    async fn assume_role(
        &self,
        role_arn: &str,
        session_name: &str,
        external_id: &str,
        duration_secs: u32,
    ) -> Result<ScopedCredentials, ProviderError> {
        let wire: CredentialsWire = self
            .call(
                "identity.assume_role",
                json!({
                    "role_arn": role_arn,
                    "session_name": session_name,
                    "external_id": external_id,
                    "duration_secs": duration_secs,
                }),
                None,
            )
            .await?;
        Ok(wire.into())
    }
}

impl ObjectStore for HttpGateway {
    async fn put_object(
        &self,
        credentials: &ScopedCredentials,
        bucket: &str,
        key: &str,
        body: &[u8],
        content_type: &str,
    ) -> Result<(), ProviderError> {
        self.call::<Value>(
            "objects.put",
            json!({
                "bucket": bucket,
                "key": key,
                "body": BASE64.encode(body),
                "content_type": content_type,
            }),
            Some(credentials),
        )
        .await?;
        Ok(())
    }

    async fn delete_object(
        &self,
        credentials: &ScopedCredentials,
        bucket: &str,
        key: &str,
    ) -> Result<(), ProviderError> {
        self.call::<Value>(
            "objects.delete",
            json!({ "bucket": bucket, "key": key }),
            Some(credentials),
        )
        .await?;
        Ok(())
    }

    async fn list_objects(
        &self,
        credentials: &ScopedCredentials,
        bucket: &str,
        continuation_token: Option<&str>,
    ) -> Result<ObjectPage, ProviderError> {
        Ok(self
            .call(
                "objects.list",
                json!({ "bucket": bucket, "continuation_token": continuation_token }),
                Some(credentials),
            )
            .await?)
    }
}

impl CacheDistribution for HttpGateway {
    async fn create_invalidation(
        &self,
        distribution_id: &str,
        paths: &[String],
        caller_reference: &str,
    ) -> Result<String, ProviderError> {
        let invalidation: InvalidationWire = self
            .call(
                "cache.create_invalidation",
                json!({
                    "distribution_id": distribution_id,
                    "paths": paths,
                    "caller_reference": caller_reference,
                }),
                None,
            )
            .await?;
        Ok(invalidation.id)
    }

    async fn get_invalidation(
        &self,
        distribution_id: &str,
        invalidation_id: &str,
    ) -> Result<String, ProviderError> {
        let invalidation: InvalidationWire = self
            .call(
                "cache.get_invalidation",
                json!({ "distribution_id": distribution_id, "id": invalidation_id }),
                None,
            )
            .await?;
        invalidation.status.ok_or_else(|| {
            ProviderError::Request(format!("invalidation {} has no status", invalidation.id))
        })
    }
}
