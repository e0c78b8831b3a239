//! Connection tactics: the parameterizations the dialer races to open one
//! TLS connection towards a possibly censored backend.

pub mod bridges;
pub mod dns;

pub use bridges::BridgesPolicy;
pub use dns::DnsPolicy;

use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// One attempt to establish a TLS connection.
///
/// `sni` is what goes on the wire in the ClientHello; `verify_hostname` is
/// what the peer certificate is validated against. Keeping the two apart is
/// what lets a connection survive SNI-based filtering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct Tactic {
    pub address: String,
    pub port: u16,
    pub initial_delay: Duration,
    pub sni: String,
    pub verify_hostname: String,
}

/// Bounded capacity of a tactics channel. Producers block (and observe
/// cancellation) rather than buffering the whole stream.
const STREAM_CAPACITY: usize = 8;

/// A policy turns `(domain, port)` into a lazy, finite, single-pass
/// sequence of tactics, highest priority first.
pub trait Policy: Send + Sync {
    fn lookup_tactics(
        &self,
        token: &CancellationToken,
        domain: &str,
        port: u16,
    ) -> TacticStream;
}

/// Consumer side of a tactics channel.
pub struct TacticStream {
    rx: mpsc::Receiver<Tactic>,
}

impl TacticStream {
    /// Create a connected producer/consumer pair. The producer observes
    /// `token` on every send, so a cancelled consumer never strands it.
    pub fn channel(token: CancellationToken) -> (TacticSender, TacticStream) {
        let (tx, rx) = mpsc::channel(STREAM_CAPACITY);
        (TacticSender { tx, token }, TacticStream { rx })
    }

    /// A stream that is already closed; useful when a policy has nothing
    /// to say.
    pub fn empty() -> TacticStream {
        let (_, rx) = mpsc::channel(1);
        TacticStream { rx }
    }

    pub async fn next(&mut self) -> Option<Tactic> {
        self.rx.recv().await
    }

    /// Drain the remainder of the stream. Test helper more than anything;
    /// the dialer consumes tactics one by one.
    pub async fn collect(mut self) -> Vec<Tactic> {
        let mut out = Vec::new();
        while let Some(tactic) = self.next().await {
            out.push(tactic);
        }
        out
    }
}

impl std::fmt::Debug for TacticStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TacticStream").finish_non_exhaustive()
    }
}

/// Producer side of a tactics channel.
pub struct TacticSender {
    tx: mpsc::Sender<Tactic>,
    token: CancellationToken,
}

impl TacticSender {
    /// Send one tactic. Returns `false` when the consumer is gone or the
    /// token fired; the producer must stop then.
    pub async fn send(&self, tactic: Tactic) -> bool {
        tokio::select! {
            _ = self.token.cancelled() => false,
            sent = self.tx.send(tactic) => sent.is_ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(address: &str) -> Tactic {
        Tactic {
            address: address.to_string(),
            port: 443,
            initial_delay: Duration::ZERO,
            sni: "www.example.com".to_string(),
            verify_hostname: "www.example.com".to_string(),
        }
    }

    #[tokio::test]
    async fn stream_is_single_pass_and_finite() {
        let token = CancellationToken::new();
        let (sender, stream) = TacticStream::channel(token);
        tokio::spawn(async move {
            assert!(sender.send(sample("10.0.0.1")).await);
            assert!(sender.send(sample("10.0.0.2")).await);
        });
        let tactics = stream.collect().await;
        assert_eq!(tactics.len(), 2);
        assert_eq!(tactics[0].address, "10.0.0.1");
        assert_eq!(tactics[1].address, "10.0.0.2");
    }

    #[tokio::test]
    async fn cancellation_unblocks_the_producer() {
        let token = CancellationToken::new();
        let (sender, mut stream) = TacticStream::channel(token.clone());
        let producer = tokio::spawn(async move {
            let mut delivered = 0usize;
            // More than the channel capacity, so the producer must block.
            for i in 0..64 {
                if !sender.send(sample(&format!("10.0.0.{i}"))).await {
                    break;
                }
                delivered += 1;
            }
            delivered
        });
        assert!(stream.next().await.is_some());
        token.cancel();
        let delivered = producer.await.unwrap();
        assert!(delivered < 64, "producer must observe cancellation");
    }

    #[tokio::test]
    async fn empty_stream_yields_nothing() {
        let mut stream = TacticStream::empty();
        assert!(stream.next().await.is_none());
    }
}
