//! Timeout-bounded HTTP execution
//!
//! [`Transport::execute`] runs a single attempt under a deadline that
//! covers both the response headers and the body.
//! [`Transport::execute_with_retry`] replays the request on transient
//! failures according to a [`RetryPolicy`].

use super::retry::{parse_retry_after, with_retry, RetryPolicy};
use crate::model::Provider;
use crate::{ChangeflowError, Result};
use chrono::Utc;
use reqwest::header::HeaderMap;
use reqwest::{header, Client, Request, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

/// Statuses that signal a transient provider failure
const RETRYABLE_STATUSES: [u16; 6] = [408, 429, 500, 502, 503, 504];

/// Whether a response status should be retried
pub fn is_retryable_status(status: StatusCode) -> bool {
    RETRYABLE_STATUSES.contains(&status.as_u16())
}

/// A response whose body has been read in full
#[derive(Debug, Clone)]
pub struct HttpResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Body as text, replacing invalid UTF-8
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Decode the body as JSON
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// HTTP executor shared by every provider call
#[derive(Debug, Clone)]
pub struct Transport {
    client: Client,
}

impl Transport {
    /// Create a transport with a default client
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("changeflow/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    /// Wrap an existing client
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    /// Client used to build requests
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Execute one attempt, aborting it when `timeout` elapses.
    ///
    /// The deadline spans sending the request and reading the whole body.
    /// Dropping the in-flight future cancels the request.
    pub async fn execute(&self, request: Request, timeout: Duration) -> Result<HttpResponse> {
        let url = request.url().to_string();

        match tokio::time::timeout(timeout, self.send_and_read(request)).await {
            Err(_) => Err(ChangeflowError::Timeout { url, after: timeout }),
            Ok(Err(e)) if e.is_timeout() => Err(ChangeflowError::Timeout { url, after: timeout }),
            Ok(Err(e)) => Err(ChangeflowError::Network(e.to_string())),
            Ok(Ok(response)) => Ok(response),
        }
    }

    async fn send_and_read(&self, request: Request) -> std::result::Result<HttpResponse, reqwest::Error> {
        let response: Response = self.client.execute(request).await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;
        Ok(HttpResponse::new(status, headers, body.to_vec()))
    }

    /// Execute a request, retrying transient failures.
    ///
    /// Non-retryable responses (including 4xx other than 408/429) are returned
    /// as-is for the caller to classify. A timed-out attempt is never retried.
    /// Exhausted retries surface as [`ChangeflowError::UpstreamUnavailable`].
    pub async fn execute_with_retry(
        &self,
        provider: Provider,
        request: Request,
        policy: &RetryPolicy,
    ) -> Result<HttpResponse> {
        let operation = format!("{} {} {}", provider, request.method(), request.url().path());

        let result = with_retry(policy, &operation, || {
            let attempt = request.try_clone();
            async move {
                let attempt = attempt.ok_or_else(|| {
                    ChangeflowError::Other("Request body cannot be replayed".to_string())
                })?;

                let response = self.execute(attempt, policy.request_timeout).await?;
                let status = response.status();

                if is_retryable_status(status) {
                    let retry_after = response
                        .headers()
                        .get(header::RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| parse_retry_after(v, Utc::now()));
                    return Err(ChangeflowError::RetryableStatus {
                        status: status.as_u16(),
                        retry_after,
                    });
                }

                debug!(provider = %provider, status = status.as_u16(), "Request completed");
                Ok(response)
            }
        })
        .await;

        result.map_err(|failure| match failure.error {
            ChangeflowError::RetryableStatus { status, .. } => {
                ChangeflowError::UpstreamUnavailable {
                    provider,
                    status: Some(status),
                    attempts: failure.attempts,
                }
            }
            ChangeflowError::Network(_) => ChangeflowError::UpstreamUnavailable {
                provider,
                status: None,
                attempts: failure.attempts,
            },
            other => other,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn get(transport: &Transport, url: String) -> Request {
        transport.client().get(url).build().unwrap()
    }

    #[test]
    fn test_retryable_statuses() {
        for code in [408, 429, 500, 502, 503, 504] {
            assert!(is_retryable_status(StatusCode::from_u16(code).unwrap()));
        }
        for code in [200, 400, 401, 403, 404, 422, 501] {
            assert!(!is_retryable_status(StatusCode::from_u16(code).unwrap()));
        }
    }

    #[tokio::test]
    async fn test_timeout_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/slow"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .expect(1)
            .mount(&server)
            .await;

        let transport = Transport::new().unwrap();
        let policy = RetryPolicy {
            request_timeout: Duration::from_millis(50),
            ..RetryPolicy::quick()
        };

        let result = transport
            .execute_with_retry(
                Provider::GitHub,
                get(&transport, format!("{}/slow", server.uri())),
                &policy,
            )
            .await;

        assert!(matches!(result, Err(ChangeflowError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_transient_status_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        let transport = Transport::new().unwrap();
        let response = transport
            .execute_with_retry(
                Provider::Jira,
                get(&transport, format!("{}/flaky", server.uri())),
                &RetryPolicy::quick(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.text(), "ok");
    }

    #[tokio::test]
    async fn test_client_error_returned_without_retry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let transport = Transport::new().unwrap();
        let response = transport
            .execute_with_retry(
                Provider::Linear,
                get(&transport, format!("{}/missing", server.uri())),
                &RetryPolicy::quick(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_as_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/down"))
            .respond_with(ResponseTemplate::new(502))
            .expect(4)
            .mount(&server)
            .await;

        let transport = Transport::new().unwrap();
        let result = transport
            .execute_with_retry(
                Provider::GitHub,
                get(&transport, format!("{}/down", server.uri())),
                &RetryPolicy::quick(),
            )
            .await;

        match result {
            Err(ChangeflowError::UpstreamUnavailable {
                provider,
                status,
                attempts,
            }) => {
                assert_eq!(provider, Provider::GitHub);
                assert_eq!(status, Some(502));
                assert_eq!(attempts, 4);
            }
            other => panic!("expected UpstreamUnavailable, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_retry_after_header_is_honored() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/limited"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "1"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/limited"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let transport = Transport::new().unwrap();
        let started = std::time::Instant::now();
        let response = transport
            .execute_with_retry(
                Provider::GitHub,
                get(&transport, format!("{}/limited", server.uri())),
                &RetryPolicy::quick(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        // quick() caps computed backoff at 100ms; the hint must win
        assert!(started.elapsed() >= Duration::from_secs(1));
    }

    /// Serves headers and a truncated body, then holds the connection open
    async fn stalled_body_server() -> std::net::SocketAddr {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = socket.read(&mut buf).await;
                    let _ = socket
                        .write_all(
                            b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 100\r\n\r\n{\"a\":",
                        )
                        .await;
                    tokio::time::sleep(Duration::from_secs(30)).await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_stalled_body_hits_the_deadline() {
        let addr = stalled_body_server().await;
        let transport = Transport::new().unwrap();

        let started = std::time::Instant::now();
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            transport.execute(
                get(&transport, format!("http://{}/stall", addr)),
                Duration::from_millis(200),
            ),
        )
        .await
        .expect("per-attempt deadline must fire before the outer one");

        assert!(matches!(result, Err(ChangeflowError::Timeout { .. })));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_stalled_body_is_not_retried() {
        let addr = stalled_body_server().await;
        let transport = Transport::new().unwrap();
        let policy = RetryPolicy {
            request_timeout: Duration::from_millis(200),
            ..RetryPolicy::quick()
        };

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            transport.execute_with_retry(
                Provider::Jira,
                get(&transport, format!("http://{}/stall", addr)),
                &policy,
            ),
        )
        .await
        .unwrap();

        assert!(matches!(result, Err(ChangeflowError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_connection_refused_is_network_error() {
        // Bind and drop a listener to get a port nothing listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = Transport::new().unwrap();
        let result = transport
            .execute(
                get(&transport, format!("http://{}/", addr)),
                Duration::from_secs(2),
            )
            .await;

        assert!(matches!(result, Err(ChangeflowError::Network(_))));
    }
}
