//! Read-through proxy from the query connection to the core RPC endpoint
//!
//! Request data must decode as a JSON object; it is POSTed as JSON to
//! `{base_url}/{path}` and the JSON object reply is returned as the value.

use crate::types::{Code, ResponseQuery};
use serde_json::{Map, Value};
use std::fmt;
use tracing::{debug, warn};

pub type JsonObject = Map<String, Value>;

#[derive(Debug)]
pub enum ForwardError {
    Transport(reqwest::Error),
    Status(u16, String),
    Decode(reqwest::Error),
    Encode(serde_json::Error),
}

impl fmt::Display for ForwardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForwardError::Transport(e) if e.is_timeout() => write!(f, "request timed out: {}", e),
            ForwardError::Transport(e) => write!(f, "request failed: {}", e),
            ForwardError::Status(status, body) => {
                write!(f, "remote returned status {}", status)?;
                if !body.is_empty() {
                    write!(f, ": {}", body)?;
                }
                Ok(())
            }
            ForwardError::Decode(e) => write!(f, "invalid response: {}", e),
            ForwardError::Encode(e) => write!(f, "cannot encode response: {}", e),
        }
    }
}

impl std::error::Error for ForwardError {}

#[derive(Clone)]
pub struct QueryForwarder {
    base_url: String,
    client: reqwest::Client,
}

impl QueryForwarder {
    pub fn new(base_url: &str, client: reqwest::Client) -> Self {
        QueryForwarder {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        if path.is_empty() {
            self.base_url.clone()
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    pub async fn query(&self, path: &str, data: &[u8]) -> ResponseQuery {
        debug!(path, bytes = data.len(), "Query");
        let request: JsonObject = match serde_json::from_slice(data) {
            Ok(request) => request,
            Err(e) => return ResponseQuery::error(Code::EncodingError, e.to_string()),
        };

        match self.forward(path, &request).await {
            Ok(value) => ResponseQuery {
                code: Code::Ok,
                value,
                log: String::new(),
            },
            Err(e) => {
                warn!(path, error = %e, "Query forwarding failed");
                ResponseQuery::error(Code::InternalError, e.to_string())
            }
        }
    }

    async fn forward(&self, path: &str, request: &JsonObject) -> Result<Vec<u8>, ForwardError> {
        let response = self
            .client
            .post(self.endpoint(path))
            .json(request)
            .send()
            .await
            .map_err(ForwardError::Transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ForwardError::Status(status.as_u16(), body));
        }

        let result: JsonObject = response.json().await.map_err(ForwardError::Decode)?;
        serde_json::to_vec(&result).map_err(ForwardError::Encode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{web, App, HttpResponse, HttpServer};
    use serde_json::json;
    use std::time::Duration;

    async fn echo(body: web::Json<Value>) -> HttpResponse {
        HttpResponse::Ok().json(json!({ "echo": body.into_inner() }))
    }

    async fn broken() -> HttpResponse {
        HttpResponse::InternalServerError().body("core unavailable")
    }

    async fn list() -> HttpResponse {
        HttpResponse::Ok().json(json!([1, 2, 3]))
    }

    async fn slow() -> HttpResponse {
        tokio::time::sleep(Duration::from_secs(2)).await;
        HttpResponse::Ok().json(json!({}))
    }

    fn start_core() -> String {
        let server = HttpServer::new(|| {
            App::new()
                .route("/v1/echo", web::post().to(echo))
                .route("/broken", web::post().to(broken))
                .route("/list", web::post().to(list))
                .route("/slow", web::post().to(slow))
        })
        .workers(1)
        .bind(("127.0.0.1", 0))
        .unwrap();
        let addr = server.addrs()[0];
        actix_rt::spawn(server.run());
        format!("http://{}", addr)
    }

    fn client(timeout: Duration) -> reqwest::Client {
        reqwest::Client::builder().timeout(timeout).build().unwrap()
    }

    #[test]
    fn test_endpoint_joining() {
        let forwarder = QueryForwarder::new("http://localhost:1999/", reqwest::Client::new());
        assert_eq!(forwarder.base_url(), "http://localhost:1999");
        assert_eq!(forwarder.endpoint("/v1/list"), "http://localhost:1999/v1/list");
        assert_eq!(forwarder.endpoint("info"), "http://localhost:1999/info");
        assert_eq!(forwarder.endpoint(""), "http://localhost:1999");
    }

    #[actix_rt::test]
    async fn test_forward_success() {
        let forwarder = QueryForwarder::new(&start_core(), client(Duration::from_secs(5)));
        let response = forwarder.query("/v1/echo", br#"{"id": 7}"#).await;
        assert_eq!(response.code, Code::Ok, "log: {}", response.log);

        let value: Value = serde_json::from_slice(&response.value).unwrap();
        assert_eq!(value, json!({"echo": {"id": 7}}));
    }

    #[actix_rt::test]
    async fn test_bad_payload_is_encoding_error() {
        let forwarder = QueryForwarder::new("http://127.0.0.1:1", reqwest::Client::new());
        let payloads: [&[u8]; 3] = [b"", b"not json", b"[1, 2]"];
        for data in payloads {
            let response = forwarder.query("/v1/echo", data).await;
            assert_eq!(response.code, Code::EncodingError);
            assert!(response.value.is_empty());
            assert!(!response.log.is_empty());
        }
    }

    #[actix_rt::test]
    async fn test_unreachable_core_is_internal_error() {
        let forwarder = QueryForwarder::new("http://127.0.0.1:1", client(Duration::from_secs(2)));
        let response = forwarder.query("some/path", b"{}").await;
        assert_eq!(response.code, Code::InternalError);
        assert!(response.log.contains("request failed"));
    }

    #[actix_rt::test]
    async fn test_remote_failures_are_internal_errors() {
        let forwarder = QueryForwarder::new(&start_core(), client(Duration::from_millis(500)));

        let response = forwarder.query("broken", b"{}").await;
        assert_eq!(response.code, Code::InternalError);
        assert!(response.log.contains("500"));
        assert!(response.log.contains("core unavailable"));

        let response = forwarder.query("list", b"{}").await;
        assert_eq!(response.code, Code::InternalError);
        assert!(response.log.contains("invalid response"));

        let response = forwarder.query("slow", b"{}").await;
        assert_eq!(response.code, Code::InternalError);
        assert!(response.log.contains("timed out"));
    }
}
