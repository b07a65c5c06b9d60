//! REST gateway client for the `exec_sql` helper function.
//!
//! Calls `POST {api_url}/rest/v1/rpc/exec_sql` with the service-role key
//! when one is configured, otherwise the public key.

use crate::config::ClientConfig;
use crate::database::traits::RpcTransport;
use crate::error::{RpcError, RpcResult};
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Name of the helper function exposed through the REST gateway.
pub const HELPER_FUNCTION: &str = "exec_sql";

/// Error codes meaning the gateway does not know the helper function.
const FUNCTION_NOT_FOUND_CODES: &[&str] = &["PGRST202", "42883"];

/// Error body shape returned by the REST gateway.
#[derive(Debug, Default, Deserialize)]
struct GatewayErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    details: Option<Value>,
    #[serde(default)]
    hint: Option<String>,
}

/// HTTP client for the helper function.
pub struct RestRpcClient {
    client: Client,
    endpoint: String,
    api_key: String,
}

impl RestRpcClient {
    /// Build a client with the given request timeout.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Transport`] if the HTTP client cannot be built.
    pub fn new(config: &ClientConfig, timeout: Duration) -> RpcResult<Self> {
        let client = Client::builder()
            .connect_timeout(timeout.min(Duration::from_secs(10)))
            .timeout(timeout)
            .build()
            .map_err(|e| RpcError::Transport(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: format!(
                "{}/rest/v1/rpc/{}",
                config.api_url.trim_end_matches('/'),
                HELPER_FUNCTION
            ),
            api_key: config.bearer_key().to_string(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn build_headers(&self) -> RpcResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        let key = HeaderValue::from_str(&self.api_key)
            .map_err(|_| RpcError::Transport("API key is not a valid header value".into()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.api_key))
            .map_err(|_| RpcError::Transport("API key is not a valid header value".into()))?;
        headers.insert("apikey", key);
        headers.insert(AUTHORIZATION, bearer);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }
}

#[async_trait]
impl RpcTransport for RestRpcClient {
    #[instrument(skip(self, sql), fields(endpoint = %self.endpoint, read_only))]
    async fn exec_sql(&self, sql: &str, read_only: bool) -> RpcResult<Value> {
        let response = self
            .client
            .post(&self.endpoint)
            .headers(self.build_headers()?)
            .json(&json!({ "query": sql, "read_only": read_only }))
            .send()
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| RpcError::Transport(format!("failed to read response body: {e}")))?;
        debug!("RPC responded with status {}", status);
        parse_rpc_response(status, &body)
    }
}

/// Interpret a REST gateway response.
///
/// Success bodies must be JSON; an empty body reads as `null`. Error bodies
/// are decoded as gateway errors, falling back to `HTTP_<status>`.
pub fn parse_rpc_response(status: StatusCode, body: &str) -> RpcResult<Value> {
    if status.is_success() {
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        return serde_json::from_str(body)
            .map_err(|e| RpcError::Format(format!("response is not valid JSON: {e}")));
    }

    let parsed: GatewayErrorBody = serde_json::from_str(body).unwrap_or_default();
    let message = parsed
        .message
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| match body.trim() {
            "" => status
                .canonical_reason()
                .unwrap_or("request failed")
                .to_string(),
            raw => raw.to_string(),
        });

    if let Some(code) = parsed.code.as_deref() {
        if FUNCTION_NOT_FOUND_CODES.contains(&code) {
            return Err(RpcError::FunctionNotFound(message));
        }
    }

    warn!("RPC call failed with status {}: {}", status, message);
    Err(RpcError::Api {
        status: status.as_u16(),
        code: parsed
            .code
            .unwrap_or_else(|| format!("HTTP_{}", status.as_u16())),
        message,
        details: parsed.details.map(|d| match d {
            Value::String(s) => s,
            other => other.to_string(),
        }),
        hint: parsed.hint,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_with_rows() {
        let value = parse_rpc_response(StatusCode::OK, r#"[{"id":1}]"#).unwrap();
        assert_eq!(value, json!([{ "id": 1 }]));
    }

    #[test]
    fn test_empty_success_body_is_null() {
        assert_eq!(
            parse_rpc_response(StatusCode::NO_CONTENT, "").unwrap(),
            Value::Null
        );
    }

    #[test]
    fn test_invalid_json_is_format_error() {
        let err = parse_rpc_response(StatusCode::OK, "<html>").unwrap_err();
        assert!(matches!(err, RpcError::Format(_)));
        assert_eq!(err.code(), "RPC_FORMAT_ERROR");
    }

    #[test]
    fn test_missing_function_codes() {
        let body = r#"{"code":"PGRST202","message":"Could not find the function public.exec_sql","details":null,"hint":null}"#;
        let err = parse_rpc_response(StatusCode::NOT_FOUND, body).unwrap_err();
        assert!(matches!(err, RpcError::FunctionNotFound(_)));

        let body = r#"{"code":"42883","message":"function exec_sql(text, boolean) does not exist"}"#;
        let err = parse_rpc_response(StatusCode::NOT_FOUND, body).unwrap_err();
        assert!(matches!(err, RpcError::FunctionNotFound(_)));
    }

    #[test]
    fn test_api_error_keeps_postgres_fields() {
        let body = r#"{"code":"42P01","message":"relation \"nope\" does not exist","details":"schema public","hint":"check the name"}"#;
        match parse_rpc_response(StatusCode::BAD_REQUEST, body).unwrap_err() {
            RpcError::Api {
                status,
                code,
                message,
                details,
                hint,
            } => {
                assert_eq!(status, 400);
                assert_eq!(code, "42P01");
                assert_eq!(message, "relation \"nope\" does not exist");
                assert_eq!(details.as_deref(), Some("schema public"));
                assert_eq!(hint.as_deref(), Some("check the name"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_unstructured_error_uses_http_code() {
        match parse_rpc_response(StatusCode::BAD_GATEWAY, "upstream down").unwrap_err() {
            RpcError::Api { code, message, .. } => {
                assert_eq!(code, "HTTP_502");
                assert_eq!(message, "upstream down");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_endpoint_and_headers() {
        let config = ClientConfig::builder()
            .api_url("https://abc.supabase.co/")
            .public_key("anon")
            .admin_key("service")
            .build()
            .unwrap();
        let client = RestRpcClient::new(&config, Duration::from_secs(5)).unwrap();
        assert_eq!(
            client.endpoint(),
            "https://abc.supabase.co/rest/v1/rpc/exec_sql"
        );
        let headers = client.build_headers().unwrap();
        assert_eq!(headers["apikey"], "service");
        assert_eq!(headers[AUTHORIZATION], "Bearer service");
    }
}
