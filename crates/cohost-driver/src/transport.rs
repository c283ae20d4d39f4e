//! HTTP transport for instance agents and victim endpoints

use crate::error::{classify_http_error, DriverError, Result};
use crate::round::InstanceHandle;
use async_trait::async_trait;
use cohost_core::{
    Identity, InstanceControl, InstanceDescriptor, LockAck, LockRequest, ProbeReport, VictimTarget,
};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;
use url::Url;

/// Error body returned by the agent
#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
    #[serde(default)]
    category: Option<String>,
}

/// Build the shared HTTP client
pub fn build_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| DriverError::Configuration(format!("Failed to create HTTP client: {}", e)))
}

/// Append a path to a base URL, keeping any path prefix of the base
pub fn endpoint_url(base: &Url, path: &str) -> cohost_core::Result<Url> {
    let joined = format!(
        "{}/{}",
        base.as_str().trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    Ok(Url::parse(&joined)?)
}

/// Turn a non-success response into a categorized error
async fn check_status(response: Response) -> cohost_core::Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let (message, category) = match serde_json::from_str::<ErrorBody>(&body) {
        Ok(parsed) => (parsed.error, parsed.category),
        Err(_) => (format!("{}: {}", status, body.trim()), None),
    };

    Err(match (status, category.as_deref()) {
        (_, Some("contention_setup")) => cohost_core::Error::contention_setup(message),
        (_, Some("probe_setup")) => cohost_core::Error::probe_setup(message),
        (StatusCode::SERVICE_UNAVAILABLE, _) | (StatusCode::TOO_MANY_REQUESTS, _) => {
            cohost_core::Error::unavailable(message)
        }
        (StatusCode::GATEWAY_TIMEOUT, _) | (StatusCode::REQUEST_TIMEOUT, _) => {
            cohost_core::Error::timeout(message)
        }
        (StatusCode::NOT_FOUND, _) => cohost_core::Error::not_found(message),
        (s, _) if s.is_client_error() => cohost_core::Error::invalid_request(message),
        _ => cohost_core::Error::transport(message),
    })
}

/// Instance agent reached over HTTP
#[derive(Debug, Clone)]
pub struct HttpInstance {
    client: Client,
    endpoint: Url,
    timeout: Duration,
}

impl HttpInstance {
    pub fn new(endpoint: Url, timeout: Duration) -> Result<Self> {
        Ok(Self::with_client(build_client(timeout)?, endpoint, timeout))
    }

    pub fn with_client(client: Client, endpoint: Url, timeout: Duration) -> Self {
        Self {
            client,
            endpoint,
            timeout,
        }
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn get(&self, path: &str, timeout: Duration) -> cohost_core::Result<RequestBuilder> {
        let url = endpoint_url(&self.endpoint, path)?;
        debug!("GET {}", url);
        Ok(self.client.get(url).timeout(timeout))
    }

    /// Blocking locks get their duration on top of the request timeout
    fn lock_request(&self, request: &LockRequest) -> cohost_core::Result<RequestBuilder> {
        let timeout = if request.detach {
            self.timeout
        } else {
            self.timeout + request.duration()
        };
        Ok(self.get("lock", timeout)?.query(request))
    }

    fn probe_request(&self, repetitions: usize) -> cohost_core::Result<RequestBuilder> {
        Ok(self
            .get("probe", self.timeout)?
            .query(&[("repetitions", repetitions)]))
    }
}

async fn send_json<T: DeserializeOwned>(request: RequestBuilder) -> cohost_core::Result<T> {
    let response = request.send().await.map_err(classify_http_error)?;
    let response = check_status(response).await?;
    response.json::<T>().await.map_err(classify_http_error)
}

#[async_trait]
impl InstanceControl for HttpInstance {
    async fn lock(&self, request: &LockRequest) -> cohost_core::Result<LockAck> {
        send_json(self.lock_request(request)?).await
    }

    async fn probe(&self, repetitions: usize) -> cohost_core::Result<ProbeReport> {
        send_json(self.probe_request(repetitions)?).await
    }

    async fn identity(&self) -> cohost_core::Result<Identity> {
        send_json(self.get("identity", self.timeout)?).await
    }

    async fn stop(&self) -> cohost_core::Result<LockAck> {
        send_json(self.get("stop", self.timeout)?).await
    }
}

/// Victim endpoint timed end to end
#[derive(Debug, Clone)]
pub struct HttpVictim {
    client: Client,
    url: Url,
}

impl HttpVictim {
    pub fn new(url: Url, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            url,
        })
    }
}

#[async_trait]
impl VictimTarget for HttpVictim {
    async fn request(&self) -> cohost_core::Result<Duration> {
        let started = Instant::now();
        let response = self
            .client
            .get(self.url.clone())
            .send()
            .await
            .map_err(classify_http_error)?;
        let response = check_status(response).await?;
        // The full body is part of the measured round trip
        response.bytes().await.map_err(classify_http_error)?;
        Ok(started.elapsed())
    }
}

/// Build HTTP handles for every descriptor, sharing one client
pub fn connect_instances(
    descriptors: &[InstanceDescriptor],
    timeout: Duration,
) -> Result<Vec<InstanceHandle>> {
    let client = build_client(timeout)?;
    Ok(descriptors
        .iter()
        .map(|descriptor| {
            let control: Arc<dyn InstanceControl> = Arc::new(HttpInstance::with_client(
                client.clone(),
                descriptor.endpoint.clone(),
                timeout,
            ));
            InstanceHandle::new(descriptor.id(), control)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_url() {
        let base = Url::parse("http://a.example/api/").unwrap();
        assert_eq!(
            endpoint_url(&base, "lock").unwrap().as_str(),
            "http://a.example/api/lock"
        );

        let base = Url::parse("http://a.example/api").unwrap();
        assert_eq!(
            endpoint_url(&base, "/probe").unwrap().as_str(),
            "http://a.example/api/probe"
        );

        let base = Url::parse("http://b.example:8080").unwrap();
        assert_eq!(
            endpoint_url(&base, "identity").unwrap().as_str(),
            "http://b.example:8080/identity"
        );
    }

    #[test]
    fn test_connect_instances() {
        let descriptors = vec![
            InstanceDescriptor::parse("http://a.example/").unwrap(),
            InstanceDescriptor::parse("http://b.example/").unwrap(),
        ];
        let handles = connect_instances(&descriptors, Duration::from_secs(1)).unwrap();
        assert_eq!(handles.len(), 2);
        assert_eq!(handles[1].id.as_str(), "http://b.example/");
    }

    #[tokio::test]
    async fn test_unreachable_instance_is_network_error() {
        // Port 9 (discard) on localhost is expected to refuse connections
        let instance = HttpInstance::new(
            Url::parse("http://127.0.0.1:9/").unwrap(),
            Duration::from_millis(500),
        )
        .unwrap();

        let err = instance.identity().await.unwrap_err();
        assert!(matches!(err, cohost_core::Error::Network(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_probe_carries_repetitions() {
        let instance = HttpInstance::new(
            Url::parse("http://a.example/agent/").unwrap(),
            Duration::from_secs(1),
        )
        .unwrap();

        let request = instance.probe_request(250).unwrap().build().unwrap();
        assert_eq!(
            request.url().as_str(),
            "http://a.example/agent/probe?repetitions=250"
        );
    }

    #[test]
    fn test_until_stopped_lock_query() {
        let instance = HttpInstance::new(
            Url::parse("http://a.example/").unwrap(),
            Duration::from_secs(1),
        )
        .unwrap();
        let lock = LockRequest::default().continuous();

        let request = instance.lock_request(&lock).unwrap().build().unwrap();
        let query = request.url().query().unwrap_or_default();
        assert!(query.contains("detach=true"));
        assert!(query.contains("until_stopped=true"));
        assert_eq!(request.timeout(), Some(&Duration::from_secs(1)));
    }
}
