//! Provider gateway: limiter in front of the retrying transport
//!
//! Every outbound provider request, data or token, goes through
//! [`Gateway::send`], so it counts against that provider's concurrency pool.

use super::http::{HttpResponse, Transport};
use super::retry::RetryPolicy;
use crate::limiter::ProviderLimiter;
use crate::model::Provider;
use crate::{ChangeflowError, Result};
use reqwest::{Client, Request, StatusCode};
use serde::de::DeserializeOwned;
use std::sync::Arc;

/// Longest error body kept in an upstream error message
const MAX_ERROR_BODY: usize = 500;

/// Shared entry point for provider HTTP traffic
#[derive(Debug, Clone)]
pub struct Gateway {
    transport: Transport,
    limiter: Arc<ProviderLimiter>,
    policy: RetryPolicy,
}

impl Gateway {
    pub fn new(transport: Transport, limiter: Arc<ProviderLimiter>, policy: RetryPolicy) -> Self {
        Self {
            transport,
            limiter,
            policy,
        }
    }

    /// Client used to build requests
    pub fn client(&self) -> &Client {
        self.transport.client()
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn limiter(&self) -> &ProviderLimiter {
        &self.limiter
    }

    /// Send one logical request.
    ///
    /// A single permit is acquired before the first attempt and released
    /// after the final one.
    pub async fn send(&self, provider: Provider, request: Request) -> Result<HttpResponse> {
        self.limiter
            .run_under_limit(
                provider,
                self.transport
                    .execute_with_retry(provider, request, &self.policy),
            )
            .await
    }

    /// Send a request and decode a successful JSON body
    pub async fn send_json<T: DeserializeOwned>(
        &self,
        provider: Provider,
        request: Request,
    ) -> Result<T> {
        let response = self.send(provider, request).await?;
        decode_response(provider, response)
    }
}

/// Map a non-success response to a typed error, or decode the body.
///
/// 401 becomes [`ChangeflowError::AuthExpired`]; any other non-2xx status
/// becomes [`ChangeflowError::Upstream`].
pub fn decode_response<T: DeserializeOwned>(provider: Provider, response: HttpResponse) -> Result<T> {
    check_status(provider, response)?.json()
}

/// Pass a 2xx response through; convert anything else to a typed error
pub fn check_status(provider: Provider, response: HttpResponse) -> Result<HttpResponse> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    if status == StatusCode::UNAUTHORIZED {
        return Err(ChangeflowError::AuthExpired(provider));
    }

    let mut message = response.text();
    if message.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !message.is_char_boundary(cut) {
            cut -= 1;
        }
        message.truncate(cut);
    }

    Err(ChangeflowError::Upstream {
        provider,
        status: status.as_u16(),
        message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, Request as MockRequest, Respond, ResponseTemplate};

    fn gateway(permits: usize) -> Gateway {
        Gateway::new(
            Transport::new().unwrap(),
            Arc::new(ProviderLimiter::uniform(permits)),
            RetryPolicy::quick(),
        )
    }

    #[tokio::test]
    async fn test_unauthorized_maps_to_auth_expired() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let gateway = gateway(1);
        let request = gateway.client().get(server.uri()).build().unwrap();
        let result: Result<serde_json::Value> = gateway.send_json(Provider::Linear, request).await;

        assert!(matches!(result, Err(ChangeflowError::AuthExpired(Provider::Linear))));
    }

    #[tokio::test]
    async fn test_client_error_maps_to_upstream() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(422).set_body_string("Validation Failed"))
            .expect(1)
            .mount(&server)
            .await;

        let gateway = gateway(1);
        let request = gateway.client().get(server.uri()).build().unwrap();
        let result: Result<serde_json::Value> = gateway.send_json(Provider::GitHub, request).await;

        match result {
            Err(ChangeflowError::Upstream {
                status, message, ..
            }) => {
                assert_eq!(status, 422);
                assert_eq!(message, "Validation Failed");
            }
            other => panic!("expected Upstream, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stalled_error_body_releases_the_permit() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let _ = socket
                    .write_all(b"HTTP/1.1 422 Unprocessable Entity\r\nContent-Length: 64\r\n\r\nValid")
                    .await;
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
        });

        let gateway = Gateway::new(
            Transport::new().unwrap(),
            Arc::new(ProviderLimiter::uniform(1)),
            RetryPolicy {
                request_timeout: Duration::from_millis(200),
                ..RetryPolicy::quick()
            },
        );
        let request = gateway
            .client()
            .get(format!("http://{}/", addr))
            .build()
            .unwrap();

        let result: Result<serde_json::Value> = tokio::time::timeout(
            Duration::from_secs(5),
            gateway.send_json(Provider::GitHub, request),
        )
        .await
        .unwrap();

        assert!(matches!(result, Err(ChangeflowError::Timeout { .. })));
        assert_eq!(gateway.limiter().available(Provider::GitHub), 1);
    }

    /// Responds 503 twice then 200, tracking concurrent requests
    struct CountingResponder {
        calls: Arc<AtomicUsize>,
    }

    impl Respond for CountingResponder {
        fn respond(&self, _request: &MockRequest) -> ResponseTemplate {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                ResponseTemplate::new(503)
            } else {
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true}))
            }
        }
    }

    #[tokio::test]
    async fn test_retries_hold_a_single_permit() {
        let server = MockServer::start().await;
        let calls = Arc::new(AtomicUsize::new(0));
        Mock::given(method("GET"))
            .and(path("/retry"))
            .respond_with(CountingResponder {
                calls: Arc::clone(&calls),
            })
            .mount(&server)
            .await;

        let gateway = Arc::new(gateway(1));
        let request = gateway
            .client()
            .get(format!("{}/retry", server.uri()))
            .build()
            .unwrap();

        let pending = {
            let gateway = Arc::clone(&gateway);
            tokio::spawn(async move {
                gateway
                    .send_json::<serde_json::Value>(Provider::GitHub, request)
                    .await
            })
        };

        // While the retry sequence runs, its one permit stays taken
        while calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        let available = gateway.limiter().available(Provider::GitHub);
        if calls.load(Ordering::SeqCst) < 3 {
            assert_eq!(available, 0);
        }

        let body = pending.await.unwrap().unwrap();
        assert_eq!(body["ok"], true);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(gateway.limiter().available(Provider::GitHub), 1);
    }
}
