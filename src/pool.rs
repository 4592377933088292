// Copyright (c) 2024, VURM Contributors.
// All rights reserved.
//
// This VURM Software is licensed under the BSD-3-Clause license.
// Please see the LICENSE file for more details.

//! A reconnecting, round-robin pool of persistent RPC sessions to a fixed
//! set of endpoints.
//!
//! Grounded on the original `ReconnectingConnectionsPool` /
//! `ProtocolUpdater` pair: each endpoint owns an auto-reconnecting factory
//! loop; callers either get the live session immediately or a future that
//! resolves on the next successful connect. `get_next_connection` advances a
//! shared cursor, cycling through endpoints indefinitely.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use regex::Regex;
use tokio::sync::{oneshot, Notify};

use crate::error::{Error, Result};

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// A single resolved `host:port` endpoint, after range expansion.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointDescriptor {
    pub raw: String,
    pub host: String,
    pub port: u16,
}

impl EndpointDescriptor {
    pub fn uri(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// Parses a list of endpoint descriptor strings, expanding any bracketed
/// host range (`name[01-10]`, zero-padded to the width of the lower bound)
/// into one descriptor per integer in range.
pub fn parse_endpoints(raw: &[String]) -> Result<Vec<EndpointDescriptor>> {
    let mut out = Vec::new();
    for entry in raw {
        out.extend(expand_one(entry)?);
    }
    Ok(out)
}

fn expand_one(entry: &str) -> Result<Vec<EndpointDescriptor>> {
    let range_re = Regex::new(r"(?s)^(.*?host=[a-zA-Z0-9_.\-]+)\[(\d+)-(\d+)\](.*)$").unwrap();

    if let Some(caps) = range_re.captures(entry) {
        let prefix = &caps[1];
        let lo: u32 = caps[2].parse().map_err(|_| Error::InvalidEndpoint(entry.to_string()))?;
        let hi: u32 = caps[3].parse().map_err(|_| Error::InvalidEndpoint(entry.to_string()))?;
        let width = caps[2].len();
        let suffix = &caps[4];

        let mut out = Vec::new();
        for i in lo..=hi {
            let expanded = format!("{prefix}{i:0width$}{suffix}", width = width);
            out.push(parse_single(&expanded)?);
        }
        Ok(out)
    } else {
        Ok(vec![parse_single(entry)?])
    }
}

/// Parses a single (non-ranged) `tcp:host=<hostname>:port=<n>` descriptor,
/// the form used for the binaries' own listen/dial endpoints.
pub fn parse_endpoint(raw: &str) -> Result<EndpointDescriptor> {
    parse_single(raw)
}

fn parse_single(entry: &str) -> Result<EndpointDescriptor> {
    let single_re = Regex::new(r"^tcp:host=([a-zA-Z0-9_.\-]+):port=(\d+)$").unwrap();
    let caps = single_re
        .captures(entry)
        .ok_or_else(|| Error::InvalidEndpoint(entry.to_string()))?;
    let port: u16 = caps[2].parse().map_err(|_| Error::InvalidEndpoint(entry.to_string()))?;
    Ok(EndpointDescriptor {
        raw: entry.to_string(),
        host: caps[1].to_string(),
        port,
    })
}

/// Establishes a new session against a resolved endpoint. Implemented once
/// per RPC client type (the remote-virt provisioner uses it to build
/// `AgentClient<Channel>` sessions).
#[async_trait]
pub trait SessionFactory: Send + Sync + 'static {
    type Session: Clone + Send + Sync + 'static;

    async fn connect(&self, endpoint: &EndpointDescriptor) -> Result<Self::Session>;
}

struct EndpointState<S> {
    descriptor: EndpointDescriptor,
    live: Mutex<Option<S>>,
    waiters: Mutex<Vec<oneshot::Sender<S>>>,
    kick: Notify,
    stopped: std::sync::atomic::AtomicBool,
}

/// A reconnecting round-robin pool over a fixed set of endpoints.
///
/// Starting the pool twice is a programming error
/// ([`Error::PoolAlreadyStarted`]), matching the original's assertion.
pub struct ReconnectingConnectionsPool<F: SessionFactory> {
    factory: F,
    states: Vec<std::sync::Arc<EndpointState<F::Session>>>,
    cursor: AtomicUsize,
    started: std::sync::atomic::AtomicBool,
}

impl<F: SessionFactory> ReconnectingConnectionsPool<F> {
    pub fn new(factory: F, endpoints: Vec<EndpointDescriptor>) -> Self {
        let states = endpoints
            .into_iter()
            .map(|descriptor| {
                std::sync::Arc::new(EndpointState {
                    descriptor,
                    live: Mutex::new(None),
                    waiters: Mutex::new(Vec::new()),
                    kick: Notify::new(),
                    stopped: std::sync::atomic::AtomicBool::new(false),
                })
            })
            .collect();

        Self {
            factory,
            states,
            cursor: AtomicUsize::new(0),
            started: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn endpoint_count(&self) -> usize {
        self.states.len()
    }

    /// Spawns one reconnect loop per endpoint. Each loop connects
    /// immediately, retrying with exponential backoff (reset on success) and
    /// re-triggering whenever [`Self::mark_disconnected`] is called for its
    /// endpoint.
    pub fn start(self: &std::sync::Arc<Self>) -> Result<()>
    where
        F: Clone,
    {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::PoolAlreadyStarted);
        }

        for state in &self.states {
            let state = state.clone();
            let factory = self.factory.clone();
            tokio::spawn(async move {
                loop {
                    if state.stopped.load(Ordering::SeqCst) {
                        return;
                    }

                    let mut backoff = INITIAL_BACKOFF;
                    loop {
                        if state.stopped.load(Ordering::SeqCst) {
                            return;
                        }
                        match factory.connect(&state.descriptor).await {
                            Ok(session) => {
                                debug!("connected to {}", state.descriptor.raw);
                                *state.live.lock().expect("pool mutex poisoned") =
                                    Some(session.clone());
                                let waiters = std::mem::take(
                                    &mut *state.waiters.lock().expect("pool mutex poisoned"),
                                );
                                for waiter in waiters {
                                    let _ = waiter.send(session.clone());
                                }
                                break;
                            }
                            Err(err) => {
                                warn!(
                                    "connection attempt to {} failed: {err}",
                                    state.descriptor.raw
                                );
                                tokio::time::sleep(backoff).await;
                                backoff = std::cmp::min(backoff * 2, MAX_BACKOFF);
                            }
                        }
                    }

                    // Wait until the caller reports the session lost, then
                    // reconnect from scratch.
                    state.kick.notified().await;
                }
            });
        }

        Ok(())
    }

    /// Stops all reconnection attempts. Live sessions are simply dropped;
    /// closing them is the session type's own responsibility (`Drop`).
    pub fn stop(&self) {
        for state in &self.states {
            state.stopped.store(true, Ordering::SeqCst);
            state.kick.notify_waiters();
        }
    }

    /// Clears the live slot for `endpoint` and wakes its reconnect loop.
    pub fn mark_disconnected(&self, endpoint: &EndpointDescriptor) {
        if let Some(state) = self.states.iter().find(|s| s.descriptor == *endpoint) {
            *state.live.lock().expect("pool mutex poisoned") = None;
            state.kick.notify_one();
        }
    }

    /// Returns the live session for `index`, or a future that resolves on
    /// the endpoint's next successful connect.
    pub async fn get_connection(&self, index: usize) -> Result<F::Session> {
        let state = &self.states[index];

        let existing = state.live.lock().expect("pool mutex poisoned").clone();
        if let Some(session) = existing {
            return Ok(session);
        }

        let (tx, rx) = oneshot::channel();
        state.waiters.lock().expect("pool mutex poisoned").push(tx);
        rx.await.map_err(|_| Error::ConnectError(state.descriptor.raw.clone()))
    }

    /// Round-robins across endpoints, cycling indefinitely.
    pub async fn get_next_connection(&self) -> Result<F::Session> {
        let (_, session) = self.get_next_connection_indexed().await?;
        Ok(session)
    }

    /// As [`Self::get_next_connection`], but also returns the endpoint index
    /// chosen, so the caller can route follow-up calls to the same physical
    /// endpoint rather than round-robining again.
    pub async fn get_next_connection_indexed(&self) -> Result<(usize, F::Session)> {
        let index = self.cursor.fetch_add(1, Ordering::SeqCst) % self.states.len();
        let session = self.get_connection(index).await?;
        Ok((index, session))
    }

    pub fn descriptor(&self, index: usize) -> &EndpointDescriptor {
        &self.states[index].descriptor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_range_expands_with_zero_padding() {
        let expanded = parse_endpoints(&["tcp:host=h[01-10]:port=9".to_string()]).unwrap();
        assert_eq!(expanded.len(), 10);
        assert_eq!(expanded[0].host, "h01");
        assert_eq!(expanded[9].host, "h10");
        assert!(expanded.iter().all(|e| e.port == 9));
    }

    #[test]
    fn plain_endpoint_parses_without_range() {
        let parsed = parse_endpoints(&["tcp:host=h1:port=42".to_string()]).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].host, "h1");
        assert_eq!(parsed[0].port, 42);
    }

    #[derive(Clone)]
    struct StubFactory;

    #[async_trait]
    impl SessionFactory for StubFactory {
        type Session = String;

        async fn connect(&self, endpoint: &EndpointDescriptor) -> Result<String> {
            Ok(endpoint.host.clone())
        }
    }

    #[tokio::test]
    async fn round_robins_across_endpoints_in_order() {
        let endpoints = parse_endpoints(&["tcp:host=h[1-3]:port=9".to_string()]).unwrap();
        let pool = std::sync::Arc::new(ReconnectingConnectionsPool::new(StubFactory, endpoints));
        pool.start().unwrap();

        let mut order = Vec::new();
        for _ in 0..6 {
            order.push(pool.get_next_connection().await.unwrap());
        }

        assert_eq!(order, vec!["h1", "h2", "h3", "h1", "h2", "h3"]);
        pool.stop();
    }

    #[tokio::test]
    async fn starting_twice_is_an_error() {
        let endpoints = parse_endpoints(&["tcp:host=h1:port=9".to_string()]).unwrap();
        let pool = std::sync::Arc::new(ReconnectingConnectionsPool::new(StubFactory, endpoints));
        pool.start().unwrap();
        assert!(matches!(pool.start(), Err(Error::PoolAlreadyStarted)));
        pool.stop();
    }
}
