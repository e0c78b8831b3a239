//! HTTPS client built on hand-dialed connections so every request goes
//! through the tactics dialer (and its byte accounting) instead of a
//! stock connector.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use hyper::body::HttpBody as _;
use hyper::client::conn::{self, SendRequest};
use hyper::header::{HeaderValue, HOST};
use hyper::{Body, Request, Response, Uri};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::core::errors::EngineError;
use crate::core::net::Dialer;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Cap on buffered response bodies. The probe-services API answers are
/// small; anything bigger than this is a broken or hostile peer.
const MAX_BODY_BYTES: usize = 8 << 20;

/// Keep-alive HTTP/1.1 client. One pooled connection per `host:port`,
/// re-dialed on demand through the tactics dialer.
pub struct HttpClient {
    dialer: Dialer,
    pool: Mutex<HashMap<String, SendRequest<Body>>>,
}

impl HttpClient {
    pub fn new(dialer: Dialer) -> Self {
        Self {
            dialer,
            pool: Mutex::new(HashMap::new()),
        }
    }

    pub fn dialer(&self) -> &Dialer {
        &self.dialer
    }

    /// Send one request. The URI must be absolute and `https`; it is
    /// rewritten to origin-form before hitting the wire, and a `Host`
    /// header is filled in unless the caller already set one (domain
    /// fronting relies on that).
    pub async fn request(
        &self,
        token: &CancellationToken,
        mut req: Request<Body>,
    ) -> Result<Response<Body>> {
        if token.is_cancelled() {
            return Err(EngineError::Interrupted.into());
        }
        let uri: Uri = req.uri().clone();
        if uri.scheme_str() != Some("https") {
            return Err(anyhow!("only https URLs are supported"));
        }
        let host = uri
            .host()
            .ok_or_else(|| anyhow!("url host missing"))?
            .to_string();
        let port = uri.port_u16().unwrap_or(443);
        let key = format!("{host}:{port}");

        let path = uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .to_string();
        *req.uri_mut() = path.parse().context("rebuild origin-form uri")?;
        if !req.headers().contains_key(HOST) {
            let value = if port == 443 {
                HeaderValue::from_str(&host)
            } else {
                HeaderValue::from_str(&key)
            }
            .context("host header value")?;
            req.headers_mut().insert(HOST, value);
        }

        let mut sender = match self.checkout(&key).await {
            Some(sender) => sender,
            None => self.handshake(token, &host, port).await?,
        };

        let outcome = tokio::select! {
            _ = token.cancelled() => return Err(EngineError::Interrupted.into()),
            outcome = timeout(REQUEST_TIMEOUT, sender.send_request(req)) => outcome,
        };
        let response = outcome
            .map_err(|_| anyhow!("request to {key} timed out"))?
            .with_context(|| format!("request to {key}"))?;
        self.checkin(key, sender);
        Ok(response)
    }

    /// Drop every pooled connection.
    pub fn close_idle_connections(&self) {
        if let Ok(mut guard) = self.pool.lock() {
            guard.clear();
        }
    }

    async fn checkout(&self, key: &str) -> Option<SendRequest<Body>> {
        let sender = {
            let mut guard = self.pool.lock().ok()?;
            guard.remove(key)?
        };
        let mut sender = sender;
        // A pooled connection may have been closed by the peer meanwhile.
        match std::future::poll_fn(|cx| sender.poll_ready(cx)).await {
            Ok(()) => Some(sender),
            Err(err) => {
                tracing::debug!(
                    target = "http",
                    key,
                    error = %err,
                    "pooled connection went away, redialing"
                );
                None
            }
        }
    }

    fn checkin(&self, key: String, sender: SendRequest<Body>) {
        if let Ok(mut guard) = self.pool.lock() {
            guard.insert(key, sender);
        }
    }

    async fn handshake(
        &self,
        token: &CancellationToken,
        host: &str,
        port: u16,
    ) -> Result<SendRequest<Body>> {
        let stream = self.dialer.dial_tls(token, host, port).await?;
        let (sender, connection) = conn::Builder::new()
            .handshake::<_, Body>(stream)
            .await
            .with_context(|| format!("http handshake with {host}:{port}"))?;
        let peer = format!("{host}:{port}");
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                tracing::debug!(target = "http", peer, error = %err, "connection closed");
            }
        });
        Ok(sender)
    }
}

/// Read at most [`MAX_BODY_BYTES`] of a response body.
pub async fn read_body(response: Response<Body>) -> Result<Vec<u8>> {
    let mut body = response.into_body();
    let mut out = Vec::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk.context("read response body")?;
        if out.len() + chunk.len() > MAX_BODY_BYTES {
            return Err(anyhow!("response body exceeds {MAX_BODY_BYTES} bytes"));
        }
        out.extend_from_slice(&chunk);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bytecounter::ByteCounter;
    use crate::core::tactics::{Policy, TacticStream};
    use std::sync::Arc;
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

    fn new_client() -> HttpClient {
        HttpClient::new(Dialer::new(
            Arc::new(EmptyPolicy),
            Arc::new(ByteCounter::new()),
            Arc::new(RwLock::new(None)),
        ))
    }

    #[tokio::test]
    async fn rejects_plain_http() {
        let client = new_client();
        let token = CancellationToken::new();
        let req = Request::get("http://www.example.com/")
            .body(Body::empty())
            .unwrap();
        let err = client.request(&token, req).await.unwrap_err();
        assert!(err.to_string().contains("only https"));
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits() {
        let client = new_client();
        let token = CancellationToken::new();
        token.cancel();
        let req = Request::get("https://www.example.com/")
            .body(Body::empty())
            .unwrap();
        let err = client.request(&token, req).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::Interrupted)
        ));
    }

    #[tokio::test]
    async fn undialable_host_surfaces_dialer_error() {
        let client = new_client();
        let token = CancellationToken::new();
        let req = Request::get("https://www.example.com/path")
            .body(Body::empty())
            .unwrap();
        let err = client.request(&token, req).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::NoWorkingTactic { .. })
        ));
    }
}
