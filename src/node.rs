// Copyright (c) 2024, VURM Contributors.
// All rights reserved.
//
// This VURM Software is licensed under the BSD-3-Clause license.
// Please see the LICENSE file for more details.

//! The node abstraction: the boundary adapter between a provisioner's
//! backend and the controller.

use async_trait::async_trait;
use std::fmt;

use crate::error::Result;

/// Lifecycle state of a [`Node`].
///
/// `spawn` is legal only from `Waiting`; `release` is legal only from
/// `Started` and is a no-op otherwise. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Waiting,
    Started,
    Terminating,
    Stopped,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeState::Waiting => "WAITING",
            NodeState::Started => "STARTED",
            NodeState::Terminating => "TERMINATING",
            NodeState::Stopped => "STOPPED",
        };
        write!(f, "{s}")
    }
}

/// A single worker-daemon endpoint, local child process or VM guest.
///
/// Implementors own their state-machine enforcement: `spawn` and `release`
/// must reject calls made from an illegal state with
/// [`crate::error::Error::NodeStateViolation`], which is a programmer error,
/// not a remotable fault.
#[async_trait]
pub trait Node: Send + Sync {
    /// The `NodeName` entry for this node in the scheduler configuration.
    fn node_name(&self) -> &str;

    /// The hostname the scheduler's controller daemon connects to.
    fn hostname(&self) -> &str;

    /// The port the worker daemon listens on.
    fn port(&self) -> u16;

    /// Current lifecycle state.
    fn state(&self) -> NodeState;

    /// True iff `state() == NodeState::Started`.
    fn running(&self) -> bool {
        self.state() == NodeState::Started
    }

    /// Starts the worker daemon for this node. Transitions `Waiting` ->
    /// `Started`.
    async fn spawn(&self) -> Result<()>;

    /// Stops the worker daemon for this node if running. Idempotent:
    /// returns `Ok(())` immediately when not `Started`.
    async fn release(&self) -> Result<()>;

    /// The exact line to splice into the scheduler configuration:
    /// `NodeName=<n> NodeHostname=<h> Port=<p>`.
    fn render_config_line(&self) -> String {
        format!(
            "NodeName={} NodeHostname={} Port={}",
            self.node_name(),
            self.hostname(),
            self.port()
        )
    }
}
