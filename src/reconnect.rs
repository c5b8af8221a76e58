//! Reconnect controller
//!
//! Keeps a client channel usable across backend restarts. The controller is
//! a small state machine:
//!
//! ```text
//!   Connected --channel failure--> Reconnecting --probe ok--> Connected
//!                                       |
//!                                       +--attempts > max--> Failed (terminal)
//!
//!   any state --close()--> Closed (terminal)
//! ```
//!
//! A channel failure is either a terminal channel (its resolver stopped) or
//! a call failing with a retryable-class status. Each reconnect attempt
//! sleeps `min(initial * multiplier^attempt, max)` first, then builds a fresh
//! channel and probes it. Reconnection is a plain loop; one mutex admits a
//! single sequence at a time, and callers that fail while a sequence is in
//! flight wait for it and reuse its channel.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tonic::Status;

use crate::config::ConfigError;
use crate::discovery::{DiscoveredChannel, DiscoveryBackend, RoundRobin, Target};
use crate::error::{Error, Result};
use crate::retry::{describe_status, is_retryable};

// ============================================================================
// Configuration
// ============================================================================

/// Reconnect backoff configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Delay before the first attempt in milliseconds
    pub initial_backoff_ms: u64,

    /// Growth factor per attempt
    pub multiplier: f64,

    /// Delay cap in milliseconds
    pub max_backoff_ms: u64,

    /// Attempts before giving up
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 1000,
            multiplier: 2.0,
            max_backoff_ms: 30_000,
            max_attempts: 5,
        }
    }
}

impl ReconnectConfig {
    /// Delay before attempt number `attempt` (0-based)
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponential = self.initial_backoff_ms as f64 * self.multiplier.powi(attempt as i32);
        let capped = exponential.min(self.max_backoff_ms as f64);
        Duration::from_millis(capped as u64)
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.initial_backoff_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "reconnect.initial_backoff_ms".to_string(),
                reason: "Must be positive".to_string(),
            });
        }

        if self.multiplier < 1.0 {
            return Err(ConfigError::InvalidValue {
                field: "reconnect.multiplier".to_string(),
                reason: "Must be at least 1.0".to_string(),
            });
        }

        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(ConfigError::InvalidValue {
                field: "reconnect.max_backoff_ms".to_string(),
                reason: "Must not be lower than initial_backoff_ms".to_string(),
            });
        }

        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "reconnect.max_attempts".to_string(),
                reason: "Must allow at least 1 attempt".to_string(),
            });
        }

        Ok(())
    }
}

// ============================================================================
// Connection State
// ============================================================================

/// Externally visible controller state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Reconnecting,
    Failed,

    /// Shut down by its owner
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connected => write!(f, "CONNECTED"),
            Self::Reconnecting => write!(f, "RECONNECTING"),
            Self::Failed => write!(f, "FAILED"),
            Self::Closed => write!(f, "CLOSED"),
        }
    }
}

// ============================================================================
// Channel Factory
// ============================================================================

/// Builds and checks the channels a controller hands out
#[async_trait]
pub trait ChannelFactory: Send + Sync + 'static {
    type Channel: Clone + Send + Sync + 'static;

    /// Build a fresh channel
    async fn connect(&self) -> Result<Self::Channel>;

    /// Check that a fresh channel can reach a backend
    async fn probe(&self, channel: &Self::Channel) -> Result<()>;

    /// Whether the channel can never recover on its own
    fn is_terminal(&self, _channel: &Self::Channel) -> bool {
        false
    }

    /// Release a channel that is being replaced
    fn close(&self, _channel: &Self::Channel) {}
}

/// Factory opening [`DiscoveredChannel`]s for one target
///
/// Every connect builds a new channel with its own resolver.
pub struct DiscoveryChannelFactory {
    target: Target,
    backend: Option<DiscoveryBackend>,
    connect_timeout: Duration,
}

impl DiscoveryChannelFactory {
    pub fn new(target: Target, backend: Option<DiscoveryBackend>, connect_timeout: Duration) -> Self {
        Self {
            target,
            backend,
            connect_timeout,
        }
    }
}

#[async_trait]
impl ChannelFactory for DiscoveryChannelFactory {
    type Channel = Arc<DiscoveredChannel>;

    async fn connect(&self) -> Result<Self::Channel> {
        let channel =
            DiscoveredChannel::open(self.target.clone(), self.backend.clone(), self.connect_timeout)
                .await?;
        Ok(Arc::new(channel))
    }

    /// Wait for an address, then open a real transport connection to it
    async fn probe(&self, channel: &Self::Channel) -> Result<()> {
        let (address, _) = channel.pick_ready(self.connect_timeout).await?;
        RoundRobin::endpoint(&address, self.connect_timeout)?
            .connect()
            .await?;
        tracing::debug!(address = %address, "Probe connected");
        Ok(())
    }

    fn is_terminal(&self, channel: &Self::Channel) -> bool {
        channel.is_terminal()
    }

    fn close(&self, channel: &Self::Channel) {
        channel.close();
    }
}

// ============================================================================
// Reconnect Controller
// ============================================================================

struct Inner<C> {
    channel: C,

    /// Bumped on every channel replacement
    generation: u64,

    attempts: u32,
    current_backoff: Duration,
    last_error: Option<String>,
}

/// Owns a channel and replaces it when it fails
pub struct ReconnectController<F: ChannelFactory> {
    factory: F,
    config: ReconnectConfig,
    inner: Mutex<Inner<F::Channel>>,
    state_tx: watch::Sender<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
}

impl<F: ChannelFactory> ReconnectController<F> {
    /// Build the first channel and start in `Connected`
    pub async fn connect(factory: F, config: ReconnectConfig) -> Result<Self> {
        let channel = factory.connect().await?;
        let (state_tx, _) = watch::channel(ConnectionState::Connected);
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            factory,
            config,
            inner: Mutex::new(Inner {
                channel,
                generation: 0,
                attempts: 0,
                current_backoff: Duration::ZERO,
                last_error: None,
            }),
            state_tx,
            shutdown_tx,
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Receiver of state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn config(&self) -> &ReconnectConfig {
        &self.config
    }

    /// Current channel; waits while a reconnect is in flight
    pub async fn channel(&self) -> Result<F::Channel> {
        self.ensure_usable().await?;
        Ok(self.inner.lock().await.channel.clone())
    }

    fn is_closed(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    async fn ensure_usable(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        if self.state() == ConnectionState::Failed {
            return Err(self.exhausted(&*self.inner.lock().await));
        }
        Ok(())
    }

    fn exhausted(&self, inner: &Inner<F::Channel>) -> Error {
        Error::ReconnectExhausted {
            attempts: inner.attempts,
            last_error: inner
                .last_error
                .clone()
                .unwrap_or_else(|| "unknown".to_string()),
        }
    }

    /// Run `op` on the current channel
    ///
    /// A channel-level failure triggers a reconnect followed by exactly one
    /// retry of `op`. Application-level statuses are returned untouched.
    pub async fn call<T, Op, Fut>(&self, mut op: Op) -> Result<T>
    where
        Op: FnMut(F::Channel) -> Fut,
        Fut: Future<Output = std::result::Result<T, Status>>,
    {
        self.ensure_usable().await?;

        let (channel, generation) = {
            let inner = self.inner.lock().await;
            (inner.channel.clone(), inner.generation)
        };

        let failure = if self.factory.is_terminal(&channel) {
            "channel is terminal".to_string()
        } else {
            match op(channel).await {
                Ok(value) => return Ok(value),
                Err(status) if !is_retryable(&status) => return Err(Error::Rpc(status)),
                Err(status) => describe_status(&status),
            }
        };

        tracing::warn!(generation, "Channel failure: {failure}");
        let channel = self.reconnect(generation, failure).await?;
        op(channel).await.map_err(Error::Rpc)
    }

    /// Replace the channel observed at `generation`
    ///
    /// If another caller already replaced it, that result is reused.
    pub async fn reconnect(&self, generation: u64, reason: String) -> Result<F::Channel> {
        let mut inner = self.inner.lock().await;

        if self.is_closed() {
            return Err(Error::Closed);
        }
        if self.state() == ConnectionState::Failed {
            return Err(self.exhausted(&inner));
        }
        if inner.generation != generation {
            tracing::debug!(
                observed = generation,
                current = inner.generation,
                "Channel already replaced"
            );
            return Ok(inner.channel.clone());
        }

        inner.last_error = Some(reason);
        self.state_tx.send_replace(ConnectionState::Reconnecting);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            if inner.attempts >= self.config.max_attempts {
                self.state_tx.send_replace(ConnectionState::Failed);
                let err = self.exhausted(&inner);
                tracing::error!("Max reconnect attempts reached: {err}");
                return Err(err);
            }

            let delay = self.config.backoff_for(inner.attempts);
            inner.attempts += 1;
            inner.current_backoff = delay;
            tracing::info!(
                attempt = inner.attempts,
                max_attempts = self.config.max_attempts,
                delay_ms = delay.as_millis() as u64,
                "Reconnecting"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_rx.wait_for(|closed| *closed) => {
                    tracing::info!("Reconnect canceled during backoff");
                    return Err(Error::Closed);
                }
            }

            let established = tokio::select! {
                result = self.establish() => result,
                _ = shutdown_rx.wait_for(|closed| *closed) => {
                    tracing::info!("Reconnect canceled while connecting");
                    return Err(Error::Closed);
                }
            };

            match established {
                Ok(channel) if self.is_closed() => {
                    self.factory.close(&channel);
                    return Err(Error::Closed);
                }
                Ok(channel) => {
                    self.factory.close(&inner.channel);
                    inner.channel = channel.clone();
                    inner.generation += 1;
                    inner.attempts = 0;
                    inner.current_backoff = Duration::ZERO;
                    inner.last_error = None;
                    self.state_tx.send_replace(ConnectionState::Connected);
                    tracing::info!(generation = inner.generation, "Reconnected");
                    return Ok(channel);
                }
                Err(e) => {
                    tracing::warn!(attempt = inner.attempts, "Reconnect attempt failed: {e}");
                    inner.last_error = Some(e.to_string());
                }
            }
        }
    }

    async fn establish(&self) -> Result<F::Channel> {
        let channel = self.factory.connect().await?;
        if let Err(e) = self.factory.probe(&channel).await {
            self.factory.close(&channel);
            return Err(e);
        }
        Ok(channel)
    }

    /// Attempts spent in the current reconnect sequence
    pub async fn attempts(&self) -> u32 {
        self.inner.lock().await.attempts
    }

    /// Stop the controller
    ///
    /// An in-flight reconnect is canceled, whether it is sleeping or
    /// connecting, and the state moves to `Closed`.
    pub async fn close(&self) {
        self.shutdown_tx.send_replace(true);
        let inner = self.inner.lock().await;
        self.factory.close(&inner.channel);
        self.state_tx.send_replace(ConnectionState::Closed);
        tracing::debug!("Reconnect controller closed");
    }
}
