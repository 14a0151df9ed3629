//! HTTP egress through a rotating proxy pool.
//!
//! Repository traffic leaves through whichever proxy the pool hands out
//! next, so no single egress path is a single point of failure. Tests
//! implement `HttpFetch` directly with scripted responses.

use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use futures::{Stream, StreamExt};

use crate::config::ProxyEndpoint;
use crate::error::{DeployError, Result};

#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    pub body: String,
}

/// Chunked body of one binary download.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>>> + Send>>;

#[async_trait]
pub trait HttpFetch: Send + Sync {
    /// Fetch a textual document (directory listings, checksum sidecars).
    async fn fetch(&self, url: &str) -> Result<FetchResponse>;

    /// Fetch a small binary body fully buffered.
    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>>;

    /// Fetch a binary body as a chunk stream. Artifact downloads go
    /// through here so an EAR is never held in memory whole.
    async fn fetch_stream(&self, url: &str) -> Result<ByteStream>;
}

/// Round-robin pool of reqwest clients, one per configured proxy.
///
/// With no proxies configured the pool degenerates to a single direct
/// client.
pub struct ProxyPool {
    clients: Vec<reqwest::Client>,
    next: AtomicUsize,
}

impl ProxyPool {
    pub fn new(proxies: &[ProxyEndpoint]) -> anyhow::Result<Self> {
        let mut clients = Vec::new();
        for proxy in proxies {
            let client = reqwest::Client::builder()
                .user_agent("drydock/0.1.0")
                .proxy(reqwest::Proxy::all(proxy.url())?)
                .build()?;
            clients.push(client);
        }
        if clients.is_empty() {
            clients.push(
                reqwest::Client::builder()
                    .user_agent("drydock/0.1.0")
                    .build()?,
            );
        }
        Ok(Self {
            clients,
            next: AtomicUsize::new(0),
        })
    }

    fn client(&self) -> &reqwest::Client {
        let slot = self.next.fetch_add(1, Ordering::Relaxed);
        &self.clients[slot % self.clients.len()]
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response> {
        self.client().get(url).send().await.map_err(|err| {
            DeployError::Http {
                url: url.to_string(),
                reason: err.to_string(),
            }
        })
    }
}

#[async_trait]
impl HttpFetch for ProxyPool {
    async fn fetch(&self, url: &str) -> Result<FetchResponse> {
        let response = self.get(url).await?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(|err| DeployError::Http {
            url: url.to_string(),
            reason: err.to_string(),
        })?;
        Ok(FetchResponse { status, body })
    }

    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>> {
        let response = self.get(url).await?;
        if !response.status().is_success() {
            return Err(DeployError::Http {
                url: url.to_string(),
                reason: format!("HTTP {}", response.status()),
            });
        }
        let bytes = response.bytes().await.map_err(|err| DeployError::Http {
            url: url.to_string(),
            reason: err.to_string(),
        })?;
        Ok(bytes.to_vec())
    }

    async fn fetch_stream(&self, url: &str) -> Result<ByteStream> {
        let response = self.get(url).await?;
        if !response.status().is_success() {
            return Err(DeployError::Http {
                url: url.to_string(),
                reason: format!("HTTP {}", response.status()),
            });
        }
        let url = url.to_string();
        let stream = response.bytes_stream().map(move |chunk| {
            chunk
                .map(|bytes| bytes.to_vec())
                .map_err(|err| DeployError::Http {
                    url: url.clone(),
                    reason: err.to_string(),
                })
        });
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_without_proxies_builds_a_direct_client() {
        let pool = ProxyPool::new(&[]).unwrap();
        assert_eq!(pool.clients.len(), 1);
    }

    #[test]
    fn pool_rotates_across_clients() {
        let proxies = vec![
            ProxyEndpoint {
                address: "127.0.0.1".into(),
                port: 8888,
            },
            ProxyEndpoint {
                address: "127.0.0.2".into(),
                port: 8888,
            },
        ];
        let pool = ProxyPool::new(&proxies).unwrap();
        let first = pool.next.load(Ordering::Relaxed);
        pool.client();
        pool.client();
        assert_eq!(pool.next.load(Ordering::Relaxed), first + 2);
    }
}
