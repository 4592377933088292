// Copyright (c) 2024, VURM Contributors.
// All rights reserved.
//
// This VURM Software is licensed under the BSD-3-Clause license.
// Please see the LICENSE file for more details.

//! The controller daemon: listens for client RPCs and dispatches allocation
//! requests to the configured provisioners.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use color_eyre::Result;
use log::info;

use vurm::config;
use vurm::controller::{ControllerService, VurmController};
use vurm::controller_rpc::controller_server::ControllerServer;
use vurm::pool;
use vurm::provisioners::local_multi::{LocalMultiProvisioner, PortAllocator};
use vurm::provisioners::remote_virt::RemoteVirtProvisioner;
use vurm::provisioners::Provisioner;

/// The dynamic SLURM node controller.
#[derive(Parser, Debug)]
#[clap(name = "vurmctld", version = env!("CARGO_PKG_VERSION"))]
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
    let vurmctld = settings.vurmctld()?;

    let mut provisioners: Vec<Arc<dyn Provisioner>> = Vec::new();

    if let Ok(multilocal) = settings.multilocal() {
        info!("local-multi provisioner enabled (baseport {})", multilocal.baseport);
        provisioners.push(Arc::new(LocalMultiProvisioner::new(
            multilocal.slurmd.clone(),
            PortAllocator::new(multilocal.baseport),
        )));
    }

    if let Ok(libvirt) = settings.libvirt() {
        info!("remote-virt provisioner enabled ({} hypervisor endpoints)", libvirt.nodes.len());
        let endpoints = pool::parse_endpoints(&libvirt.nodes)?;
        provisioners.push(RemoteVirtProvisioner::new(
            endpoints,
            libvirt.domain_xml.clone(),
            vurmctld.slurmconfig.clone(),
        )?);
    }

    let controller = Arc::new(VurmController::new(
        provisioners,
        vurmctld.slurmconfig.clone(),
        vurmctld.reconfigure.clone(),
    ));

    let endpoint = pool::parse_endpoint(&vurmctld.endpoint)?;
    let addr = format!("{}:{}", endpoint.host, endpoint.port).parse()?;

    info!("vurmctld listening on {addr}");
    tonic::transport::Server::builder()
        .add_service(ControllerServer::new(ControllerService::new(
            controller,
            settings.vurm.debug,
        )))
        .serve(addr)
        .await?;

    Ok(())
}
