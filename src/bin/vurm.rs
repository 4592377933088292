// Copyright (c) 2024, VURM Contributors.
// All rights reserved.
//
// This VURM Software is licensed under the BSD-3-Clause license.
// Please see the LICENSE file for more details.

//! The operator CLI: dials the controller and prints the result of an
//! `alloc` or `release` request.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::eyre::eyre;
use color_eyre::Result;

use vurm::config;
use vurm::controller_rpc::controller_client::ControllerClient;
use vurm::controller_rpc::{
    CreateVirtualClusterRequest, DestroyAllVirtualClustersRequest, DestroyVirtualClusterRequest,
};
use vurm::pool;

/// The VURM operator CLI.
#[derive(Parser, Debug)]
#[clap(name = "vurm", version = env!("CARGO_PKG_VERSION"))]
struct Opt {
    /// Path to the configuration file. Defaults to /etc/vurm/vurm.conf, then
    /// ~/.vurm.conf.
    #[clap(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Allocates a new virtual cluster.
    Alloc {
        /// Number of nodes requested.
        size: u32,
        /// Minimum acceptable nodes; defaults to `size`.
        #[clap(long)]
        min_size: Option<u32>,
    },
    /// Releases a virtual cluster by name, or every cluster with `--all`.
    Release {
        /// Name of the cluster to release.
        #[clap(required_unless_present = "all")]
        cluster_name: Option<String>,
        /// Release every currently allocated cluster.
        #[clap(long)]
        all: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    env_logger::init();

    let opt = Opt::parse();
    let settings = config::load(opt.config.as_deref())?;
    let client_section = settings.vurm_client()?;

    let endpoint = pool::parse_endpoint(&client_section.endpoint)?;
    let mut client = ControllerClient::connect(endpoint.uri()).await?;

    match opt.command {
        Commands::Alloc { size, min_size } => {
            let reply = client
                .create_virtual_cluster(CreateVirtualClusterRequest { size, min_size })
                .await?
                .into_inner();
            println!("{}", reply.cluster_name);
        }
        Commands::Release {
            cluster_name,
            all,
        } => {
            if all {
                let reply = client
                    .destroy_all_virtual_clusters(DestroyAllVirtualClustersRequest {})
                    .await?
                    .into_inner();
                println!("released {} cluster(s)", reply.destroyed_count);
            } else {
                let cluster_name = cluster_name.ok_or_else(|| eyre!("missing cluster name"))?;
                client
                    .destroy_virtual_cluster(DestroyVirtualClusterRequest { cluster_name })
                    .await?;
                println!("released");
            }
        }
    }

    Ok(())
}
