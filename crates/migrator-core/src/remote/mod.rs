//! JSON-over-HTTP adapters for the collaborator traits.
//!
//! Every adapter shares one [`RemoteClient`]: a reqwest client with timeouts,
//! an optional bearer token, and a process-wide request rate limit.

mod services;

pub use services::{
    HttpAdvertisementQueue, HttpBlobStore, HttpClaimPublisher, HttpGatewayAuthorizer,
    HttpIndexBuilder, HttpIndexRegistrar, HttpIndexingOracle, HttpOwnershipIndex,
    HttpOwnershipScanner, HttpSizeTable, HttpUploadCounter, HttpUploadSource, RemoteServices,
};

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::num::NonZeroU32;
use std::sync::Arc;
use tracing::debug;
use url::Url;

use crate::config::RemoteDefaults;
use crate::error::{MigrationError, Result};

/// Which error family a service's failures belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    /// The content claims / indexing service: failures map to
    /// [`MigrationError::IndexingService`].
    Indexing,
    Other,
}

/// Shared HTTP plumbing for the adapters.
#[derive(Clone)]
pub struct RemoteClient {
    http: Client,
    limiter: Option<Arc<DefaultDirectRateLimiter>>,
    auth_token: Option<String>,
}

impl RemoteClient {
    /// Build a client. `requests_per_second == 0` disables rate limiting.
    pub fn new(requests_per_second: u32, auth_token: Option<String>) -> Result<Self> {
        let http = Client::builder()
            .timeout(RemoteDefaults::REQUEST_TIMEOUT)
            .connect_timeout(RemoteDefaults::CONNECT_TIMEOUT)
            .user_agent(RemoteDefaults::USER_AGENT)
            .build()
            .map_err(|e| MigrationError::Config {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        let limiter = NonZeroU32::new(requests_per_second)
            .map(|rps| Arc::new(RateLimiter::direct(Quota::per_second(rps))));

        Ok(Self {
            http,
            limiter,
            auth_token,
        })
    }

    pub fn get(&self, url: Url) -> RequestBuilder {
        self.authorize(self.http.get(url))
    }

    pub fn post(&self, url: Url) -> RequestBuilder {
        self.authorize(self.http.post(url))
    }

    pub fn put(&self, url: Url) -> RequestBuilder {
        self.authorize(self.http.put(url))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Send a request after waiting for the rate limiter, mapping error statuses.
    pub async fn send(
        &self,
        service: &str,
        kind: ServiceKind,
        request: RequestBuilder,
    ) -> Result<Response> {
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }

        let response = request.send().await.map_err(|e| match kind {
            ServiceKind::Indexing if !e.is_timeout() => MigrationError::IndexingService {
                status: e.status().map(|s| s.as_u16()).unwrap_or(503),
                message: e.to_string(),
            },
            _ => MigrationError::from(e),
        })?;

        let status = response.status();
        debug!("{} {} -> {}", service, response.url(), status);
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(status_error(service, kind, status, body))
    }

    /// Like [`send`](Self::send), but a 404 yields `None`.
    pub async fn send_optional(
        &self,
        service: &str,
        kind: ServiceKind,
        request: RequestBuilder,
    ) -> Result<Option<Response>> {
        match self.send(service, kind, request).await {
            Ok(response) => Ok(Some(response)),
            Err(MigrationError::Http { status: 404, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Decode a JSON body; a malformed one is a collaborator error.
    pub async fn json<T: DeserializeOwned>(service: &str, response: Response) -> Result<T> {
        response.json::<T>().await.map_err(|e| {
            MigrationError::collaborator(service, format!("invalid response body: {}", e))
        })
    }
}

/// Map a non-success status to the error class the engine understands.
pub fn status_error(
    service: &str,
    kind: ServiceKind,
    status: StatusCode,
    body: String,
) -> MigrationError {
    match (kind, status) {
        (_, StatusCode::TOO_MANY_REQUESTS) => MigrationError::Throughput {
            service: service.to_string(),
        },
        (ServiceKind::Indexing, s) if s.is_server_error() => MigrationError::IndexingService {
            status: s.as_u16(),
            message: body,
        },
        (_, s) => MigrationError::Http {
            service: service.to_string(),
            status: s.as_u16(),
            message: body,
        },
    }
}

/// Join `segments` (percent-encoded) onto `base` and append `query`.
pub fn endpoint(base: &str, segments: &[&str], query: &[(&str, &str)]) -> Result<Url> {
    let path = segments
        .iter()
        .map(|s| urlencoding::encode(s).into_owned())
        .collect::<Vec<_>>()
        .join("/");
    let raw = format!("{}/{}", base.trim_end_matches('/'), path);
    let mut url = Url::parse(&raw).map_err(|e| MigrationError::Config {
        message: format!("invalid service URL '{}': {}", raw, e),
    })?;
    if !query.is_empty() {
        url.query_pairs_mut().extend_pairs(query.iter().copied());
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_encodes_segments() {
        let url = endpoint(
            "https://uploads.example/v1/",
            &["spaces", "did:key:z6Mk/abc", "uploads"],
            &[("cursor", "a b"), ("limit", "100")],
        )
        .unwrap();
        assert_eq!(
            url.as_str(),
            "https://uploads.example/v1/spaces/did%3Akey%3Az6Mk%2Fabc/uploads?cursor=a+b&limit=100"
        );
    }

    #[test]
    fn test_endpoint_rejects_bad_base() {
        assert!(matches!(
            endpoint("not a url", &["x"], &[]),
            Err(MigrationError::Config { .. })
        ));
    }

    #[test]
    fn test_status_mapping() {
        let throttled = status_error(
            "uploads",
            ServiceKind::Other,
            StatusCode::TOO_MANY_REQUESTS,
            String::new(),
        );
        assert!(throttled.is_retryable());

        let outage = status_error(
            "indexing",
            ServiceKind::Indexing,
            StatusCode::INTERNAL_SERVER_ERROR,
            "boom".into(),
        );
        assert!(outage.is_indexing_outage());

        let other = status_error(
            "claims",
            ServiceKind::Other,
            StatusCode::INTERNAL_SERVER_ERROR,
            "boom".into(),
        );
        assert!(matches!(other, MigrationError::Http { status: 500, .. }));
        assert!(!other.is_retryable());

        let unavailable = status_error(
            "sizes",
            ServiceKind::Other,
            StatusCode::SERVICE_UNAVAILABLE,
            String::new(),
        );
        assert!(unavailable.is_retryable());
    }

    #[test]
    fn test_client_builds_with_and_without_limit() {
        assert!(RemoteClient::new(0, None).unwrap().limiter.is_none());
        assert!(RemoteClient::new(50, Some("token".into()))
            .unwrap()
            .limiter
            .is_some());
    }
}
