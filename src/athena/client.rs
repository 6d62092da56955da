//! Athena JSON-RPC client over HTTPS

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

use super::{DeviceRpc, RpcError};
use crate::config::AthenaUrls;
use crate::identity::Identity;

#[derive(Serialize)]
struct RpcRequest<'a> {
    method: &'a str,
    params: Value,
    id: u32,
    jsonrpc: &'static str,
}

#[derive(Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Deserialize)]
struct RpcErrorBody {
    #[serde(default)]
    message: Option<String>,
}

pub struct AthenaClient {
    http: reqwest::Client,
    urls: AthenaUrls,
}

impl AthenaClient {
    pub fn new(urls: AthenaUrls, timeout: Duration) -> Result<Self, RpcError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RpcError::Transport(e.to_string()))?;
        Ok(Self { http, urls })
    }

    async fn call(&self, identity: &Identity, method: &str, params: Value) -> Result<Value, RpcError> {
        let url = format!(
            "{}/{}",
            self.urls.for_provider(identity.provider).trim_end_matches('/'),
            identity.dongle_id
        );
        let body = serde_json::to_vec(&RpcRequest {
            method,
            params,
            id: 0,
            jsonrpc: "2.0",
        })
        .map_err(|e| RpcError::InvalidResponse(e.to_string()))?;

        debug!("{} athena {}", identity.tag(), method);

        let response = self
            .http
            .post(&url)
            .header("Content-Type", "application/json")
            .header("Authorization", format!("JWT {}", identity.token()))
            .body(body)
            .send()
            .await
            .map_err(map_transport)?;

        let status = response.status();
        // Athena answers 404 for unknown/disconnected devices and 202 when
        // the message was queued for a device that is not online.
        if status == StatusCode::NOT_FOUND || status == StatusCode::ACCEPTED {
            return Err(RpcError::DeviceOffline);
        }
        if !status.is_success() {
            warn!("{} athena {} failed: HTTP {}", identity.tag(), method, status);
            return Err(RpcError::Rejected(format!("HTTP {}", status)));
        }

        let bytes = response.bytes().await.map_err(map_transport)?;
        let parsed: RpcResponse = serde_json::from_slice(&bytes)
            .map_err(|e| RpcError::InvalidResponse(e.to_string()))?;

        if let Some(err) = parsed.error {
            return Err(RpcError::Rejected(
                err.message.unwrap_or_else(|| "Device error".to_string()),
            ));
        }
        Ok(parsed.result.unwrap_or(Value::Null))
    }
}

fn map_transport(err: reqwest::Error) -> RpcError {
    if err.is_timeout() {
        RpcError::Timeout
    } else {
        RpcError::Transport(err.to_string())
    }
}

#[async_trait]
impl DeviceRpc for AthenaClient {
    async fn start_local_proxy(
        &self,
        identity: &Identity,
        remote_ws_uri: &str,
        local_port: u16,
    ) -> Result<(), RpcError> {
        self.call(
            identity,
            "startLocalProxy",
            json!({ "remote_ws_uri": remote_ws_uri, "local_port": local_port }),
        )
        .await
        .map(|_| ())
    }

    async fn get_ssh_authorized_keys(&self, identity: &Identity) -> Result<String, RpcError> {
        match self.call(identity, "getSshAuthorizedKeys", Value::Null).await? {
            Value::String(keys) => Ok(keys),
            Value::Null => Ok(String::new()),
            other => Err(RpcError::InvalidResponse(format!(
                "expected string, got {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Provider;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    /// Serve one canned HTTP response; the task yields the raw request.
    async fn serve_once(response: String) -> (AthenaUrls, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let task = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
                if request_complete(&request) {
                    break;
                }
            }
            stream.write_all(response.as_bytes()).await.unwrap();
            let _ = stream.shutdown().await;
            String::from_utf8_lossy(&request).into_owned()
        });
        let urls = AthenaUrls {
            asius: base.clone(),
            comma: base.clone(),
            konik: base,
        };
        (urls, task)
    }

    fn request_complete(raw: &[u8]) -> bool {
        let text = String::from_utf8_lossy(raw);
        let Some(split) = text.find("\r\n\r\n") else {
            return false;
        };
        let length = text[..split]
            .lines()
            .find_map(|l| {
                let (name, value) = l.split_once(':')?;
                name.eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse::<usize>().ok())
                    .flatten()
            })
            .unwrap_or(0);
        raw.len() >= split + 4 + length
    }

    fn http_response(status: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            body.len(),
            body
        )
    }

    fn identity() -> Identity {
        Identity::new(Provider::Asius, "abc123", "tok1")
    }

    #[tokio::test]
    async fn test_start_local_proxy_request_shape() {
        let (urls, server) =
            serve_once(http_response("200 OK", r#"{"result":0,"id":0,"jsonrpc":"2.0"}"#)).await;
        let client = AthenaClient::new(urls, Duration::from_secs(5)).unwrap();

        client
            .start_local_proxy(&identity(), "wss://relay.test/ssh/s1", 22)
            .await
            .unwrap();

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /abc123 "));
        assert!(request.to_ascii_lowercase().contains("authorization: jwt tok1"));
        let body = &request[request.find("\r\n\r\n").unwrap() + 4..];
        let json: Value = serde_json::from_str(body).unwrap();
        assert_eq!(json["method"], "startLocalProxy");
        assert_eq!(json["params"]["remote_ws_uri"], "wss://relay.test/ssh/s1");
        assert_eq!(json["params"]["local_port"], 22);
        assert_eq!(json["jsonrpc"], "2.0");
    }

    #[tokio::test]
    async fn test_authorized_keys_string() {
        let (urls, _server) = serve_once(http_response(
            "200 OK",
            r#"{"result":"ssh-ed25519 AAAA a\nssh-rsa BBBB b","id":0}"#,
        ))
        .await;
        let client = AthenaClient::new(urls, Duration::from_secs(5)).unwrap();
        let keys = client.get_ssh_authorized_keys(&identity()).await.unwrap();
        assert_eq!(keys.lines().count(), 2);
    }

    #[tokio::test]
    async fn test_rpc_error_is_rejection() {
        let (urls, _server) = serve_once(http_response(
            "200 OK",
            r#"{"error":{"code":-1,"message":"not allowed"},"id":0}"#,
        ))
        .await;
        let client = AthenaClient::new(urls, Duration::from_secs(5)).unwrap();
        let err = client
            .start_local_proxy(&identity(), "wss://x/ssh/s", 22)
            .await
            .unwrap_err();
        assert_eq!(err, RpcError::Rejected("not allowed".into()));
    }

    #[tokio::test]
    async fn test_not_found_is_offline() {
        let (urls, _server) = serve_once(http_response("404 Not Found", "{}")).await;
        let client = AthenaClient::new(urls, Duration::from_secs(5)).unwrap();
        let err = client.get_ssh_authorized_keys(&identity()).await.unwrap_err();
        assert_eq!(err, RpcError::DeviceOffline);
        assert!(err.is_unreachable());
    }

    #[tokio::test]
    async fn test_server_error_is_rejection() {
        let (urls, _server) = serve_once(http_response("500 Internal Server Error", "{}")).await;
        let client = AthenaClient::new(urls, Duration::from_secs(5)).unwrap();
        let err = client.get_ssh_authorized_keys(&identity()).await.unwrap_err();
        assert!(matches!(err, RpcError::Rejected(ref m) if m.contains("500")));
    }

    #[tokio::test]
    async fn test_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        // accept but never answer
        let _hold = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(stream);
        });
        let urls = AthenaUrls {
            asius: base.clone(),
            comma: base.clone(),
            konik: base,
        };
        let client = AthenaClient::new(urls, Duration::from_millis(200)).unwrap();
        let err = client.get_ssh_authorized_keys(&identity()).await.unwrap_err();
        assert_eq!(err, RpcError::Timeout);
    }
}
