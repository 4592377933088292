// Copyright (c) 2024, VURM Contributors.
// All rights reserved.
//
// This VURM Software is licensed under the BSD-3-Clause license.
// Please see the LICENSE file for more details.

//! Spawns worker daemons as local child processes, using SLURM's support
//! for multiple `slurmd` instances on one host.
//!
//! Only supported by SLURM when it was built with multiple-daemon support;
//! see the SLURM programmer guide.

use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{oneshot, watch};

use crate::error::{Error, Result};
use crate::node::{Node, NodeState};
use crate::provisioners::Provisioner;

/// A monotonically increasing port counter shared across every
/// `LocalMultiProvisioner` built from the same configuration, avoiding a
/// hidden process-wide static.
#[derive(Clone)]
pub struct PortAllocator(Arc<AtomicU16>);

impl PortAllocator {
    pub fn new(baseport: u16) -> Self {
        Self(Arc::new(AtomicU16::new(baseport)))
    }

    pub fn next(&self) -> u16 {
        self.0.fetch_add(1, Ordering::SeqCst)
    }
}

struct Inner {
    state: NodeState,
    /// Fires the reaper task's select arm that sends SIGKILL. The `Child`
    /// is owned by the reaper task itself (so only one place ever calls its
    /// `&mut self` methods); this channel is how `release` reaches it.
    kill_tx: Option<oneshot::Sender<()>>,
}

/// A single local child process and its lifecycle state.
pub struct LocalNode {
    name: String,
    hostname: String,
    port: u16,
    command_template: String,
    inner: Arc<tokio::sync::Mutex<Inner>>,
    state_tx: watch::Sender<NodeState>,
}

impl LocalNode {
    pub fn new(name: String, hostname: String, port: u16, command_template: String) -> Self {
        let (state_tx, _rx) = watch::channel(NodeState::Waiting);
        Self {
            name,
            hostname,
            port,
            command_template,
            inner: Arc::new(tokio::sync::Mutex::new(Inner {
                state: NodeState::Waiting,
                kill_tx: None,
            })),
            state_tx,
        }
    }
}

#[async_trait]
impl Node for LocalNode {
    fn node_name(&self) -> &str {
        &self.name
    }

    fn hostname(&self) -> &str {
        &self.hostname
    }

    fn port(&self) -> u16 {
        self.port
    }

    fn state(&self) -> NodeState {
        *self.state_tx.borrow()
    }

    async fn spawn(&self) -> Result<()> {
        let mut guard = self.inner.lock().await;
        if guard.state != NodeState::Waiting {
            return Err(Error::NodeStateViolation(format!(
                "cannot spawn node {} from state {}",
                self.name, guard.state
            )));
        }

        let cmd = self
            .command_template
            .replace("{nodeName}", &self.name)
            .replace("{hostname}", &self.hostname)
            .replace("{port}", &self.port.to_string());

        info!("spawning new slurmd process for {}", self.name);
        debug!("command line: `{cmd}`");

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(pid) = child.id() {
            debug!("new slurmd process for {} started with pid {pid}", self.name);
        }

        if let Some(stdout) = child.stdout.take() {
            let name = self.name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("[{name}] {line}");
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let name = self.name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("[{name}] {line}");
                }
            });
        }

        let (kill_tx, mut kill_rx) = oneshot::channel();
        guard.kill_tx = Some(kill_tx);
        guard.state = NodeState::Started;
        let _ = self.state_tx.send(NodeState::Started);
        drop(guard);

        let inner = self.inner.clone();
        let state_tx = self.state_tx.clone();
        let name = self.name.clone();
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    let mut guard = inner.lock().await;
                    if guard.state == NodeState::Terminating {
                        debug!("process for {name} exited normally: {status:?}");
                    } else {
                        warn!("process for {name} quit unexpectedly: {status:?}");
                    }
                    guard.state = NodeState::Stopped;
                    guard.kill_tx = None;
                    let _ = state_tx.send(NodeState::Stopped);
                }
                _ = &mut kill_rx => {
                    let _ = child.start_kill();
                    let status = child.wait().await;
                    debug!("process for {name} killed: {status:?}");
                    let mut guard = inner.lock().await;
                    guard.state = NodeState::Stopped;
                    guard.kill_tx = None;
                    let _ = state_tx.send(NodeState::Stopped);
                }
            }
        });

        Ok(())
    }

    async fn release(&self) -> Result<()> {
        let mut rx = self.state_tx.subscribe();
        let kill_tx = {
            let mut guard = self.inner.lock().await;
            match guard.state {
                NodeState::Started => {
                    guard.state = NodeState::Terminating;
                    let _ = self.state_tx.send(NodeState::Terminating);
                    guard.kill_tx.take()
                }
                _ => return Ok(()),
            }
        };
        if let Some(kill_tx) = kill_tx {
            // Ignore a send failure: it means the reaper already observed
            // the process exit on its own between our state check and here.
            let _ = kill_tx.send(());
        }
        let _ = rx.wait_for(|s| *s == NodeState::Stopped).await;
        Ok(())
    }
}

/// Allocates `N` child-process nodes on localhost. Always succeeds with
/// `count` ready-to-spawn nodes; it does not enforce a resource ceiling.
pub struct LocalMultiProvisioner {
    command_template: String,
    ports: PortAllocator,
}

impl LocalMultiProvisioner {
    pub fn new(command_template: String, ports: PortAllocator) -> Self {
        Self {
            command_template,
            ports,
        }
    }
}

#[async_trait]
impl Provisioner for LocalMultiProvisioner {
    async fn get_nodes(
        &self,
        count: usize,
        names: &mut dyn Iterator<Item = String>,
    ) -> Result<Vec<Arc<dyn Node>>> {
        let mut nodes = Vec::with_capacity(count);
        for _ in 0..count {
            let name = names.next().expect("node name iterator exhausted");
            let port = self.ports.next();
            nodes.push(Arc::new(LocalNode::new(
                name,
                "localhost".to_string(),
                port,
                self.command_template.clone(),
            )) as Arc<dyn Node>);
        }
        Ok(nodes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawn_then_release_is_idempotent() {
        // A long-running process that never exits on its own: release()
        // must only ever reach STOPPED by actually sending SIGKILL.
        let node = LocalNode::new(
            "nd-test-0".to_string(),
            "localhost".to_string(),
            17000,
            "sleep 300".to_string(),
        );

        assert_eq!(node.state(), NodeState::Waiting);
        node.spawn().await.unwrap();
        assert!(node.running());

        tokio::time::timeout(std::time::Duration::from_secs(5), node.release())
            .await
            .expect("release should kill a still-running process promptly")
            .unwrap();
        assert_eq!(node.state(), NodeState::Stopped);

        // Releasing an already-stopped node is a no-op, not an error.
        node.release().await.unwrap();
    }

    #[tokio::test]
    async fn spawn_twice_is_a_state_violation() {
        let node = LocalNode::new(
            "nd-test-1".to_string(),
            "localhost".to_string(),
            17001,
            "sleep 300".to_string(),
        );
        node.spawn().await.unwrap();
        assert!(matches!(
            node.spawn().await,
            Err(Error::NodeStateViolation(_))
        ));
        node.release().await.unwrap();
    }

    #[tokio::test]
    async fn port_allocator_hands_out_sequential_ports() {
        let allocator = PortAllocator::new(20000);
        assert_eq!(allocator.next(), 20000);
        assert_eq!(allocator.next(), 20001);
        let cloned = allocator.clone();
        assert_eq!(cloned.next(), 20002);
    }
}
