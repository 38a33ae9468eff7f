// Copyright (c) 2025, The RabbitHutch Authors
// MIT License
// All rights reserved.

//! # Connection Lifecycle Management
//!
//! A [`ConnectionManager`] owns exactly one broker session for one publisher or
//! consumer and brings it back whenever it is lost. [`ConnectionManager::ensure_connected`]
//! is the retry state machine:
//!
//! - already active: returns `true` immediately, no side effect
//! - `max_retries == 0`: a single attempt, no delay
//! - `max_retries == N > 0`: at most `N + 1` attempts
//! - `max_retries < 0`: attempts until connected or cancelled
//!
//! Between attempts it waits `reconnect_delay`; cancelling the token aborts the
//! wait (never an attempt already in flight) and the call returns `false`.

use crate::{
    channel::{BrokerConnector, BrokerEndpointConfig, BrokerSession},
    errors::AmqpError,
};
use async_trait::async_trait;
use serde::Deserialize;
use std::{sync::Arc, time::Duration};
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Retry policy consulted on every reconnect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConnectionLifecycleProfile {
    /// `-1` retries forever, `0` never retries.
    pub max_retries: i32,
    #[serde(rename = "reconnect_delay_ms", with = "millis")]
    pub reconnect_delay: Duration,
}

impl Default for ConnectionLifecycleProfile {
    fn default() -> Self {
        ConnectionLifecycleProfile {
            max_retries: -1,
            reconnect_delay: Duration::from_secs(5),
        }
    }
}

impl ConnectionLifecycleProfile {
    pub fn new(max_retries: i32, reconnect_delay: Duration) -> ConnectionLifecycleProfile {
        ConnectionLifecycleProfile {
            max_retries,
            reconnect_delay,
        }
    }

    /// Whether another attempt is allowed after `failed` failed attempts.
    fn allows_retry(&self, failed: u32) -> bool {
        match self.max_retries {
            n if n < 0 => true,
            0 => false,
            n => failed <= n as u32,
        }
    }
}

/// Connection state of one [`ConnectionManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Disconnected,
    Connecting,
    Connected,
    /// Terminal, reached on explicit shutdown.
    Closed,
}

/// Post-connect work run on every fresh session: topology, qos, confirms.
///
/// An error fails the attempt and the session is discarded.
#[async_trait]
pub trait SessionSetup: Send + Sync {
    async fn setup(
        &self,
        session: &dyn BrokerSession,
        cancel: &CancellationToken,
    ) -> Result<(), AmqpError>;
}

/// Setup that does nothing.
pub struct NoSetup;

#[async_trait]
impl SessionSetup for NoSetup {
    async fn setup(&self, _: &dyn BrokerSession, _: &CancellationToken) -> Result<(), AmqpError> {
        Ok(())
    }
}

/// Owns the connection/channel pair of a single publisher or consumer.
pub struct ConnectionManager {
    connector: Arc<dyn BrokerConnector>,
    endpoint: BrokerEndpointConfig,
    profile: ConnectionLifecycleProfile,
    setup: Arc<dyn SessionSetup>,
    session: Option<Box<dyn BrokerSession>>,
    state: watch::Sender<LifecycleState>,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn BrokerConnector>,
        endpoint: BrokerEndpointConfig,
        profile: ConnectionLifecycleProfile,
        setup: Arc<dyn SessionSetup>,
    ) -> ConnectionManager {
        ConnectionManager {
            connector,
            endpoint,
            profile,
            setup,
            session: None,
            state: watch::channel(LifecycleState::Disconnected).0,
        }
    }

    pub fn endpoint(&self) -> &BrokerEndpointConfig {
        &self.endpoint
    }

    pub fn profile(&self) -> &ConnectionLifecycleProfile {
        &self.profile
    }

    pub fn is_active(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.is_active())
    }

    pub fn state(&self) -> LifecycleState {
        match *self.state.borrow() {
            LifecycleState::Connected if !self.is_active() => LifecycleState::Disconnected,
            state => state,
        }
    }

    /// Follows the state transitions without locking the manager; a session
    /// that dies between two connects still reads as `Connected` here.
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    fn is_closed(&self) -> bool {
        *self.state.borrow() == LifecycleState::Closed
    }

    /// The live session, if any.
    pub fn session(&self) -> Option<&dyn BrokerSession> {
        self.session.as_deref().filter(|s| s.is_active())
    }

    /// Makes sure a live session exists, retrying per the lifecycle profile.
    ///
    /// Ordinary connect failures are logged and yield `Ok(false)`; only a
    /// malformed endpoint is returned as an error.
    pub async fn ensure_connected(&mut self, cancel: &CancellationToken) -> Result<bool, AmqpError> {
        if self.is_closed() {
            debug!("connection manager is closed");
            return Ok(false);
        }

        if self.is_active() {
            return Ok(true);
        }

        self.discard_session().await;

        self.state.send_replace(LifecycleState::Connecting);
        let connected = self.connect_with_retries(cancel).await;
        self.state.send_replace(match connected {
            Ok(true) => LifecycleState::Connected,
            _ => LifecycleState::Disconnected,
        });

        connected
    }

    async fn connect_with_retries(&mut self, cancel: &CancellationToken) -> Result<bool, AmqpError> {
        let mut failed: u32 = 0;

        loop {
            match self.attempt(cancel).await {
                Ok(session) => {
                    info!(host = self.endpoint.host(), "broker connection established");
                    self.session = Some(session);
                    return Ok(true);
                }
                Err(AmqpError::InvalidEndpoint(uri)) => return Err(AmqpError::InvalidEndpoint(uri)),
                Err(err) => {
                    failed += 1;
                    warn!(
                        error = err.to_string(),
                        attempt = failed,
                        max_retries = self.profile.max_retries,
                        host = self.endpoint.host(),
                        "broker connection attempt failed"
                    );
                }
            }

            if !self.profile.allows_retry(failed) {
                warn!(attempts = failed, "giving up on broker connection");
                return Ok(false);
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("reconnect wait cancelled");
                    return Ok(false);
                }
                _ = tokio::time::sleep(self.profile.reconnect_delay) => {}
            }
        }
    }

    async fn attempt(&self, cancel: &CancellationToken) -> Result<Box<dyn BrokerSession>, AmqpError> {
        let session = self.connector.connect(&self.endpoint).await?;

        if let Err(err) = self.setup.setup(session.as_ref(), cancel).await {
            if let Err(close_err) = session.close().await {
                debug!(error = close_err.to_string(), "unable to close failed session");
            }
            return Err(err);
        }

        if !session.is_active() {
            if let Err(close_err) = session.close().await {
                debug!(error = close_err.to_string(), "unable to close inactive session");
            }
            return Err(AmqpError::ConnectionError("session is not active".to_owned()));
        }

        Ok(session)
    }

    /// Closes and forgets the current session, keeping the manager usable.
    pub async fn discard_session(&mut self) {
        if let Some(session) = self.session.take() {
            if let Err(err) = session.close().await {
                debug!(error = err.to_string(), "unable to close stale session");
            }
        }
        self.state.send_if_modified(|state| {
            let connected = *state == LifecycleState::Connected;
            if connected {
                *state = LifecycleState::Disconnected;
            }
            connected
        });
    }

    /// Closes the session and moves to the terminal `Closed` state.
    pub async fn close(&mut self) {
        if let Some(session) = self.session.take() {
            if let Err(err) = session.close().await {
                warn!(error = err.to_string(), "unable to close the broker session");
            }
        }
        self.state.send_replace(LifecycleState::Closed);
    }
}

/// State of a background worker (drain worker or consumer loop).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Stopped,
    Running,
    Stopping,
}

/// A spawned worker and the two signals it honours: `stop` asks it to finish
/// its current work and exit, `stop_now` asks it to abandon that work.
pub(crate) struct Worker<R> {
    handle: JoinHandle<R>,
    stop: CancellationToken,
    stop_now: CancellationToken,
}

impl<R> Worker<R>
where
    R: Send + 'static,
{
    pub(crate) fn spawn<F>(stop: CancellationToken, stop_now: CancellationToken, task: F) -> Worker<R>
    where
        F: std::future::Future<Output = R> + Send + 'static,
    {
        Worker {
            handle: tokio::spawn(task),
            stop,
            stop_now,
        }
    }

    /// Signals `stop` and waits up to `timeout`; then signals `stop_now` and
    /// waits up to `grace` before aborting the task.
    ///
    /// Returns the task output, when it finished, and whether the stop was forced.
    pub(crate) async fn stop(mut self, timeout: Duration, grace: Duration) -> (Option<R>, bool) {
        self.stop.cancel();

        if let Ok(joined) = tokio::time::timeout(timeout, &mut self.handle).await {
            return (Self::output(joined), false);
        }

        warn!(
            timeout_ms = timeout.as_millis() as u64,
            "worker did not stop in time, stopping now (possible loss of in-flight messages)"
        );
        self.stop_now.cancel();

        match tokio::time::timeout(grace, &mut self.handle).await {
            Ok(joined) => (Self::output(joined), true),
            Err(_) => {
                error!("worker ignored the stop signal, aborting it");
                self.handle.abort();
                (None, true)
            }
        }
    }

    fn output(joined: Result<R, tokio::task::JoinError>) -> Option<R> {
        joined
            .map_err(|err| error!(error = err.to_string(), "worker failed"))
            .ok()
    }
}

/// Waits `delay` unless `cancel` fires first.
pub(crate) async fn pause(delay: Duration, cancel: &CancellationToken) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::time::sleep(delay) => {}
    }
}

pub(crate) mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
