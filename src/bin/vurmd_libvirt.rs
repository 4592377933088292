// Copyright (c) 2024, VURM Contributors.
// All rights reserved.
//
// This VURM Software is licensed under the BSD-3-Clause license.
// Please see the LICENSE file for more details.

//! The hypervisor-side agent: creates, destroys and bootstraps libvirt
//! guests on request from the controller's remote-virt provisioner.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use color_eyre::Result;
use log::info;

use vurm::config;
use vurm::pool;
use vurm::provisioners::remote_virt::agent::{AgentService, DomainManager};
use vurm::agent_rpc::agent_server::AgentServer;

/// The VURM libvirt domain-manager agent.
#[derive(Parser, Debug)]
#[clap(name = "vurmd-libvirt", version = env!("CARGO_PKG_VERSION"))]
struct Opt {
    /// Path to the configuration file. Defaults to /etc/vurm/vurm.conf, then
    /// ~/.vurm.conf.
    #[clap(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    env_logger::init();

    let opt = Opt::parse();
    let settings = config::load(opt.config.as_deref())?;
    let section = settings.vurmd_libvirt()?;

    let manager = Arc::new(DomainManager::new(section.clone()));

    let endpoint = pool::parse_endpoint(&section.endpoint)?;
    let addr = format!("{}:{}", endpoint.host, endpoint.port).parse()?;

    info!("vurmd-libvirt listening on {addr}");
    tonic::transport::Server::builder()
        .add_service(AgentServer::new(AgentService::new(
            manager,
            settings.vurm.debug,
        )))
        .serve(addr)
        .await?;

    Ok(())
}
