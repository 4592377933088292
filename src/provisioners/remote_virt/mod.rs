// Copyright (c) 2024, VURM Contributors.
// All rights reserved.
//
// This VURM Software is licensed under the BSD-3-Clause license.
// Please see the LICENSE file for more details.

//! Client of the reconnecting pool (C4) targeting domain-manager agents
//! (C5), presenting the node interface to the controller.

pub mod agent;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::debug;
use tonic::transport::Channel;
use tonic::Request;

use crate::agent_rpc::agent_client::AgentClient;
use crate::agent_rpc::{CreateDomainRequest, DestroyDomainRequest, SpawnSlurmDaemonRequest};
use crate::error::{Error, Result};
use crate::node::{Node, NodeState};
use crate::pool::{EndpointDescriptor, ReconnectingConnectionsPool, SessionFactory};
use crate::provisioners::Provisioner;

/// The SLURM default `slurmdPort` used by every VM-backed node.
const DEFAULT_SLURMD_PORT: u16 = 6818;

/// Establishes gRPC sessions to the `vurm.agent.Agent` service.
#[derive(Clone, Default)]
pub struct AgentSessionFactory;

#[async_trait]
impl SessionFactory for AgentSessionFactory {
    type Session = AgentClient<Channel>;

    async fn connect(&self, endpoint: &EndpointDescriptor) -> Result<Self::Session> {
        debug!("dialing agent at {}", endpoint.uri());
        let channel = tonic::transport::Endpoint::from_shared(endpoint.uri())?
            .connect()
            .await?;
        Ok(AgentClient::new(channel))
    }
}

/// A VM-backed node, spoken to over the same agent session that booted it.
pub struct VirtualNode {
    pool: Arc<ReconnectingConnectionsPool<AgentSessionFactory>>,
    pool_index: usize,
    node_name: String,
    hostname: String,
    slurmconfig_path: PathBuf,
    state: Mutex<NodeState>,
}

impl VirtualNode {
    fn new(
        pool: Arc<ReconnectingConnectionsPool<AgentSessionFactory>>,
        pool_index: usize,
        node_name: String,
        hostname: String,
        slurmconfig_path: PathBuf,
    ) -> Self {
        Self {
            pool,
            pool_index,
            node_name,
            hostname,
            slurmconfig_path,
            state: Mutex::new(NodeState::Waiting),
        }
    }

    async fn session(&self) -> Result<AgentClient<Channel>> {
        self.pool.get_connection(self.pool_index).await
    }

    fn note_transport_failure(&self, status: &tonic::Status) {
        if status.code() == tonic::Code::Unavailable {
            self.pool
                .mark_disconnected(self.pool.descriptor(self.pool_index));
        }
    }
}

#[async_trait]
impl Node for VirtualNode {
    fn node_name(&self) -> &str {
        &self.node_name
    }

    fn hostname(&self) -> &str {
        &self.hostname
    }

    fn port(&self) -> u16 {
        DEFAULT_SLURMD_PORT
    }

    fn state(&self) -> NodeState {
        *self.state.lock().expect("node state mutex poisoned")
    }

    async fn spawn(&self) -> Result<()> {
        {
            let mut guard = self.state.lock().expect("node state mutex poisoned");
            if *guard != NodeState::Waiting {
                return Err(Error::NodeStateViolation(format!(
                    "cannot spawn node {} from state {}",
                    self.node_name, guard
                )));
            }
        }

        let config = tokio::fs::read(&self.slurmconfig_path).await?;
        let mut session = self.session().await?;
        let request = Request::new(SpawnSlurmDaemonRequest {
            node_name: self.node_name.clone(),
            slurm_config: config,
        });

        match session.spawn_slurm_daemon(request).await {
            Ok(_) => {
                *self.state.lock().expect("node state mutex poisoned") = NodeState::Started;
                Ok(())
            }
            Err(status) => {
                self.note_transport_failure(&status);
                Err(crate::error::error_from_status(status))
            }
        }
    }

    async fn release(&self) -> Result<()> {
        {
            let mut guard = self.state.lock().expect("node state mutex poisoned");
            if *guard != NodeState::Started {
                return Ok(());
            }
            *guard = NodeState::Terminating;
        }

        let mut session = self.session().await?;
        let request = Request::new(DestroyDomainRequest {
            node_name: self.node_name.clone(),
        });

        let result = match session.destroy_domain(request).await {
            Ok(_) => Ok(()),
            Err(status) => {
                self.note_transport_failure(&status);
                Err(crate::error::error_from_status(status))
            }
        };

        *self.state.lock().expect("node state mutex poisoned") = NodeState::Stopped;
        result
    }
}

/// Presents the node interface on top of the reconnecting pool and the
/// agent RPCs. Each call to `get_nodes` loads the domain description
/// template fresh from disk, so an operator can edit it between
/// allocations.
pub struct RemoteVirtProvisioner {
    pool: Arc<ReconnectingConnectionsPool<AgentSessionFactory>>,
    domain_xml_path: PathBuf,
    slurmconfig_path: PathBuf,
}

impl RemoteVirtProvisioner {
    pub fn new(
        endpoints: Vec<EndpointDescriptor>,
        domain_xml_path: PathBuf,
        slurmconfig_path: PathBuf,
    ) -> Result<Arc<Self>> {
        let pool = Arc::new(ReconnectingConnectionsPool::new(
            AgentSessionFactory,
            endpoints,
        ));
        pool.start()?;

        Ok(Arc::new(Self {
            pool,
            domain_xml_path,
            slurmconfig_path,
        }))
    }
}

#[async_trait]
impl Provisioner for RemoteVirtProvisioner {
    async fn get_nodes(
        &self,
        count: usize,
        names: &mut dyn Iterator<Item = String>,
    ) -> Result<Vec<Arc<dyn Node>>> {
        let template = tokio::fs::read_to_string(&self.domain_xml_path).await?;

        let mut nodes = Vec::with_capacity(count);
        for _ in 0..count {
            let node_name = names.next().expect("node name iterator exhausted");
            let description = set_domain_name(&template, &node_name)?;

            let (index, mut session) = self.pool.get_next_connection_indexed().await?;
            let request = Request::new(CreateDomainRequest { description });

            match session.create_domain(request).await {
                Ok(reply) => {
                    let hostname = reply.into_inner().hostname;
                    nodes.push(Arc::new(VirtualNode::new(
                        self.pool.clone(),
                        index,
                        node_name,
                        hostname,
                        self.slurmconfig_path.clone(),
                    )) as Arc<dyn Node>);
                }
                Err(status) => {
                    debug!("failed to create domain for {node_name}: {status}");
                    if status.code() == tonic::Code::Unavailable {
                        self.pool.mark_disconnected(self.pool.descriptor(index));
                    }
                    // Best-effort: drop this slot and let the controller try
                    // the next provisioner for the shortfall.
                }
            }
        }

        Ok(nodes)
    }
}

/// Rewrites the `<name>` element of the domain description template to
/// `node_name`, leaving everything else byte-identical.
fn set_domain_name(template: &str, node_name: &str) -> Result<String> {
    use quick_xml::events::{BytesText, Event};
    use quick_xml::{Reader, Writer};

    let mut reader = Reader::from_str(template);
    reader.trim_text(false);
    let mut writer = Writer::new(Vec::new());

    let mut in_name = false;
    loop {
        match reader.read_event()? {
            Event::Eof => break,
            Event::Start(e) if e.name().as_ref() == b"name" => {
                in_name = true;
                writer.write_event(Event::Start(e))?;
            }
            Event::End(e) if e.name().as_ref() == b"name" => {
                in_name = false;
                writer.write_event(Event::End(e))?;
            }
            Event::Text(_) if in_name => {
                writer.write_event(Event::Text(BytesText::new(node_name)))?;
            }
            event => {
                writer.write_event(event)?;
            }
        }
    }

    Ok(String::from_utf8_lossy(&writer.into_inner()).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_domain_name_rewrites_only_the_name_element() {
        let template = "<domain><name>placeholder</name><devices/></domain>";
        let rewritten = set_domain_name(template, "nd-abc1234-0").unwrap();
        assert!(rewritten.contains("<name>nd-abc1234-0</name>"));
        assert!(rewritten.contains("<devices/>"));
    }
}
