//! Client for one probe-service endpoint.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use hyper::header::{HeaderValue, CONTENT_TYPE, HOST, USER_AGENT};
use hyper::{Body, Method, Request};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::core::errors::EngineError;
use crate::core::http::{read_body, HttpClient};

use super::model::{
    CheckInConfig, CheckInInfo, EndpointKind, Measurement, ReportTemplate, ServiceEndpoint,
};

/// Talks to a single endpoint. Construction fails for endpoints the
/// current transport cannot reach (an onion address without a proxy).
pub struct Client {
    base_url: Url,
    /// Real backend host when domain fronting is in use; goes into the
    /// `Host` header while the URL (and so TLS) names the front.
    host_header: Option<String>,
    http: Arc<HttpClient>,
    user_agent: String,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("base_url", &self.base_url)
            .field("host_header", &self.host_header)
            .field("user_agent", &self.user_agent)
            .finish_non_exhaustive()
    }
}

impl Client {
    pub fn new(
        endpoint: &ServiceEndpoint,
        http: Arc<HttpClient>,
        user_agent: String,
        proxied: bool,
    ) -> Result<Self> {
        match endpoint.kind {
            EndpointKind::Https => {
                let base_url = Url::parse(&endpoint.address)
                    .with_context(|| format!("parse {}", endpoint.address))?;
                Ok(Self {
                    base_url,
                    host_header: None,
                    http,
                    user_agent,
                })
            }
            EndpointKind::Cloudfront => {
                let address = Url::parse(&endpoint.address)
                    .with_context(|| format!("parse {}", endpoint.address))?;
                let front = endpoint.front.as_deref().ok_or_else(|| {
                    EngineError::UnsupportedEndpoint(format!(
                        "cloudfront endpoint without front: {}",
                        endpoint.address
                    ))
                })?;
                let mut base_url = address.clone();
                base_url
                    .set_host(Some(front))
                    .map_err(|_| anyhow!("invalid front: {front}"))?;
                let host_header = address.host_str().map(|h| h.to_string());
                Ok(Self {
                    base_url,
                    host_header,
                    http,
                    user_agent,
                })
            }
            EndpointKind::Onion => {
                if !proxied {
                    return Err(EngineError::UnsupportedEndpoint(format!(
                        "onion endpoint without a tunnel: {}",
                        endpoint.address
                    ))
                    .into());
                }
                let base_url = Url::parse(&endpoint.address)
                    .with_context(|| format!("parse {}", endpoint.address))?;
                Ok(Self {
                    base_url,
                    host_header: None,
                    http,
                    user_agent,
                })
            }
        }
    }

    /// POST the check-in request; the backend answers with the URLs this
    /// probe should measure.
    pub async fn check_in(
        &self,
        token: &CancellationToken,
        config: &CheckInConfig,
    ) -> Result<CheckInInfo> {
        self.post_json(token, "/api/v1/check-in", config).await
    }

    /// Fetch the test-helper index; doubles as the selector's benchmark
    /// probe because it is cheap and unauthenticated.
    pub async fn fetch_test_helpers(
        &self,
        token: &CancellationToken,
    ) -> Result<HashMap<String, Vec<ServiceEndpoint>>> {
        self.get_json(token, "/api/v1/test-helpers").await
    }

    /// Open a report for the given template, returning its id.
    pub async fn open_report(
        &self,
        token: &CancellationToken,
        template: &ReportTemplate,
    ) -> Result<String> {
        let response: OpenReportResponse = self.post_json(token, "/report", template).await?;
        if response.report_id.is_empty() {
            return Err(anyhow!("collector answered without a report id"));
        }
        Ok(response.report_id)
    }

    /// Attach one measurement to an open report.
    pub async fn submit_measurement(
        &self,
        token: &CancellationToken,
        report_id: &str,
        measurement: &Measurement,
    ) -> Result<()> {
        let body = SubmitMeasurementRequest {
            format: "json",
            content: measurement,
        };
        let _: serde_json::Value = self
            .post_json(token, &format!("/report/{report_id}"), &body)
            .await?;
        Ok(())
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        token: &CancellationToken,
        path: &str,
    ) -> Result<T> {
        let req = self.request_builder(Method::GET, path)?.body(Body::empty())?;
        self.roundtrip(token, req).await
    }

    async fn post_json<T: DeserializeOwned, B: Serialize>(
        &self,
        token: &CancellationToken,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let payload = serde_json::to_vec(body).context("serialize request body")?;
        let req = self
            .request_builder(Method::POST, path)?
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .body(Body::from(payload))?;
        self.roundtrip(token, req).await
    }

    fn request_builder(&self, method: Method, path: &str) -> Result<hyper::http::request::Builder> {
        let url = self
            .base_url
            .join(path)
            .with_context(|| format!("join {path}"))?;
        let mut builder = Request::builder()
            .method(method)
            .uri(url.as_str())
            .header(USER_AGENT, HeaderValue::from_str(&self.user_agent)?);
        if let Some(host) = &self.host_header {
            builder = builder.header(HOST, HeaderValue::from_str(host)?);
        }
        Ok(builder)
    }

    async fn roundtrip<T: DeserializeOwned>(
        &self,
        token: &CancellationToken,
        req: Request<Body>,
    ) -> Result<T> {
        let response = self.http.request(token, req).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::HttpStatus(status.as_u16()).into());
        }
        let body = read_body(response).await?;
        serde_json::from_slice(&body).context("parse response body")
    }
}

#[derive(Debug, Serialize)]
struct SubmitMeasurementRequest<'a> {
    format: &'static str,
    content: &'a Measurement,
}

#[derive(Debug, Default, Deserialize)]
struct OpenReportResponse {
    #[serde(default)]
    report_id: String,
    #[serde(default)]
    #[allow(dead_code)]
    backend_version: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bytecounter::ByteCounter;
    use crate::core::net::Dialer;
    use crate::core::tactics::{Policy, TacticStream};
    use tokio::sync::RwLock;

    struct EmptyPolicy;

    impl Policy for EmptyPolicy {
        fn lookup_tactics(
            &self,
            _token: &CancellationToken,
            _domain: &str,
            _port: u16,
        ) -> TacticStream {
            TacticStream::empty()
        }
    }

    fn new_http() -> Arc<HttpClient> {
        Arc::new(HttpClient::new(Dialer::new(
            std::sync::Arc::new(EmptyPolicy),
            Arc::new(ByteCounter::new()),
            Arc::new(RwLock::new(None)),
        )))
    }

    fn endpoint(kind: EndpointKind, address: &str, front: Option<&str>) -> ServiceEndpoint {
        ServiceEndpoint {
            address: address.to_string(),
            kind,
            front: front.map(|f| f.to_string()),
        }
    }

    #[test]
    fn https_endpoint_builds() {
        let client = Client::new(
            &endpoint(EndpointKind::Https, "https://api.ooni.io", None),
            new_http(),
            "test/0.1".to_string(),
            false,
        )
        .unwrap();
        assert_eq!(client.base_url.as_str(), "https://api.ooni.io/");
        assert!(client.host_header.is_none());
    }

    #[test]
    fn cloudfront_endpoint_fronts_the_connection() {
        let client = Client::new(
            &endpoint(
                EndpointKind::Cloudfront,
                "https://api.ooni.io",
                Some("d33d1gs9kpq1c5.cloudfront.net"),
            ),
            new_http(),
            "test/0.1".to_string(),
            false,
        )
        .unwrap();
        assert_eq!(
            client.base_url.host_str(),
            Some("d33d1gs9kpq1c5.cloudfront.net")
        );
        assert_eq!(client.host_header.as_deref(), Some("api.ooni.io"));
    }

    #[test]
    fn onion_endpoint_requires_a_proxy() {
        let onion = endpoint(
            EndpointKind::Onion,
            "https://nkvphnp3p6agi5qq.onion",
            None,
        );
        let err = Client::new(&onion, new_http(), "test/0.1".to_string(), false).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::UnsupportedEndpoint(_))
        ));
        assert!(Client::new(&onion, new_http(), "test/0.1".to_string(), true).is_ok());
    }
}
