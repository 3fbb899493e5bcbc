//! Connection state machine for the event source and the target store.
//!
//! ```text
//!  Disconnected ──acquire──▶ Connecting ──ok──▶ Connected
//!       ▲                        │                 │
//!       └──retries exhausted─────┘        probe/operation failure
//!                                                  ▼
//!                         Connecting ◀──acquire── Stale
//! ```
//!
//! A stale handle is released before a replacement is opened; nothing is ever
//! issued on a handle known to be dead.

use async_trait::async_trait;
use resilience::{with_retry, with_timeout, RetryConfig};
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{Endpoint, ReplicatorError, Result};
use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Disconnected,
    Connecting,
    Connected,
    Stale,
}

/// Knows how to open, probe and close one kind of handle
#[async_trait]
pub trait Connector: Send + Sync {
    type Handle: Send + Sync;

    fn endpoint(&self) -> Endpoint;

    /// Human-readable address for logs (never includes credentials)
    fn describe(&self) -> String;

    async fn connect(&self) -> Result<Self::Handle>;

    /// Cheap liveness round trip
    async fn probe(&self, handle: &Self::Handle) -> Result<()>;

    async fn release(&self, handle: Self::Handle);
}

/// Owns at most one live handle and replaces it with backoff when it goes bad
pub struct ConnectionManager<C: Connector> {
    connector: C,
    handle: Option<C::Handle>,
    state: HandleState,
    retry: RetryConfig,
    connect_timeout: Duration,
    connects: u64,
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(connector: C, retry: RetryConfig, connect_timeout: Duration) -> Self {
        Self {
            connector,
            handle: None,
            state: HandleState::Disconnected,
            retry,
            connect_timeout,
            connects: 0,
        }
    }

    pub fn state(&self) -> HandleState {
        self.state
    }

    /// Successful connections so far, including the first
    pub fn connects(&self) -> u64 {
        self.connects
    }

    /// Return the live handle, opening one (with backoff) if there is none.
    ///
    /// Exhausting the retry budget yields `ReplicatorError::Unreachable`.
    pub async fn acquire(&mut self) -> Result<&mut C::Handle> {
        if self.state == HandleState::Stale {
            self.release_current().await;
        }

        if self.handle.is_none() {
            self.state = HandleState::Connecting;
            let endpoint = self.connector.endpoint();
            let label = endpoint.to_string();
            let connector = &self.connector;
            let timeout = self.connect_timeout;

            match with_retry(&self.retry, &label, || {
                with_timeout(timeout, connector.connect())
            })
            .await
            {
                Ok(handle) => {
                    if self.connects > 0 {
                        metrics::record_reconnect(endpoint);
                    }
                    self.connects += 1;
                    self.handle = Some(handle);
                    self.state = HandleState::Connected;
                    info!(
                        endpoint = endpoint.as_str(),
                        address = %self.connector.describe(),
                        "Connected to {}",
                        endpoint
                    );
                }
                Err(e) => {
                    self.state = HandleState::Disconnected;
                    return Err(ReplicatorError::Unreachable {
                        endpoint,
                        attempts: e.attempts(),
                        last_error: e.into_last().to_string(),
                    });
                }
            }
        }

        self.handle
            .as_mut()
            .ok_or_else(|| ReplicatorError::Unavailable {
                endpoint: self.connector.endpoint(),
                reason: "no handle after connect".to_string(),
            })
    }

    /// Acquire, then probe; a failed probe marks the handle stale and a fresh one
    /// is acquired before returning.
    pub async fn health_check(&mut self) -> Result<&mut C::Handle> {
        self.acquire().await?;

        let probe = match self.handle.as_ref() {
            Some(handle) => {
                with_timeout(self.connect_timeout, self.connector.probe(handle)).await
            }
            None => return self.acquire().await,
        };

        if let Err(e) = probe {
            self.mark_stale(&e.to_string());
        }

        self.acquire().await
    }

    /// The handle failed an operation; it is replaced on the next acquire
    pub fn mark_stale(&mut self, reason: &str) {
        if self.handle.is_some() && self.state != HandleState::Stale {
            warn!(
                endpoint = self.connector.endpoint().as_str(),
                reason = %reason,
                "Stale {} handle, will reconnect",
                self.connector.endpoint()
            );
            self.state = HandleState::Stale;
        }
    }

    /// Current handle if connected; never connects
    pub fn current(&mut self) -> Option<&mut C::Handle> {
        match self.state {
            HandleState::Connected => self.handle.as_mut(),
            _ => None,
        }
    }

    /// Release the handle for good
    pub async fn shutdown(&mut self) {
        self.release_current().await;
    }

    async fn release_current(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.connector.release(handle).await;
        }
        self.state = HandleState::Disconnected;
    }
}
