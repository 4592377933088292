// Copyright (c) 2024, VURM Contributors.
// All rights reserved.
//
// This VURM Software is licensed under the BSD-3-Clause license.
// Please see the LICENSE file for more details.

//! The controller allocation engine (C7) and its RPC surface (C8).
//!
//! Grounded on `original_source/vurm/controller.py`'s `VurmController`:
//! `remote_createVirtualCluster` / `remote_destroyVirtualCluster`, and the
//! `updateSlurmConfig` lock/read/replace/write sequence shared with
//! `original_source/vurm/bin/vurmctld.py`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::sync::Mutex;
use tonic::{Request, Response, Status};

use crate::cluster::{NodeNameIter, VirtualCluster};
use crate::controller_rpc::controller_server::Controller;
use crate::controller_rpc::{
    CreateVirtualClusterReply, CreateVirtualClusterRequest, DestroyAllVirtualClustersReply,
    DestroyAllVirtualClustersRequest, DestroyVirtualClusterReply, DestroyVirtualClusterRequest,
};
use crate::error::{Error, Result};
use crate::node::Node;
use crate::provisioners::Provisioner;

/// Owns the live set of virtual clusters and the provisioners they are
/// drawn from, and serializes every edit to the scheduler configuration
/// file behind an advisory exclusive lock.
pub struct VurmController {
    provisioners: Vec<Arc<dyn Provisioner>>,
    naming: crate::cluster::NamingAuthority,
    clusters: Mutex<HashMap<String, Arc<VirtualCluster>>>,
    slurmconfig_path: PathBuf,
    reconfigure_cmd: String,
}

impl VurmController {
    pub fn new(
        provisioners: Vec<Arc<dyn Provisioner>>,
        slurmconfig_path: PathBuf,
        reconfigure_cmd: String,
    ) -> Self {
        Self {
            provisioners,
            naming: crate::cluster::NamingAuthority::new(),
            clusters: Mutex::new(HashMap::new()),
            slurmconfig_path,
            reconfigure_cmd,
        }
    }

    /// Allocates a new cluster of up to `size` nodes, accepting as few as
    /// `min_size` (defaults to `size`). Provisioners are tried in configured
    /// order, each asked for the remaining shortfall, until `size` is
    /// reached or every provisioner has been tried.
    pub async fn create_virtual_cluster(
        &self,
        size: usize,
        min_size: Option<usize>,
    ) -> Result<String> {
        let min_size = min_size.unwrap_or(size);
        let cluster_name = self.naming.generate_cluster_name();
        let index_width = NodeNameIter::index_width(size);
        let mut names = NodeNameIter::new(&cluster_name, index_width);

        let mut nodes: Vec<Arc<dyn Node>> = Vec::with_capacity(size);
        for provisioner in &self.provisioners {
            if nodes.len() >= size {
                break;
            }
            let remaining = size - nodes.len();
            match provisioner.get_nodes(remaining, &mut names).await {
                Ok(mut obtained) => nodes.append(&mut obtained),
                Err(err) => warn!("a provisioner failed to produce nodes: {err}"),
            }
        }

        if nodes.len() < min_size {
            error!(
                "insufficient resources for cluster {cluster_name:?}: obtained {}/{min_size}",
                nodes.len()
            );
            release_all(&nodes).await;
            return Err(Error::InsufficientResources {
                obtained: nodes.len(),
                min_size,
            });
        }

        let cluster = Arc::new(VirtualCluster::new(cluster_name.clone(), nodes, index_width));
        let fragment = cluster.config_fragment();

        self.clusters
            .lock()
            .await
            .insert(cluster_name.clone(), cluster.clone());

        if let Err(err) = self.update_slurm_config("", &fragment, true).await {
            error!("failed to reconfigure the scheduler for {cluster_name:?}: {err}");
            self.clusters.lock().await.remove(&cluster_name);
            cluster.release_all().await;
            if let Err(undo_err) = self.update_slurm_config(&fragment, "", false).await {
                error!("failed to undo the partial config append for {cluster_name:?}: {undo_err}");
            }
            return Err(err);
        }

        let results = cluster.spawn_all().await;
        for (node, result) in cluster.nodes.iter().zip(results) {
            if let Err(err) = result {
                warn!("node {:?} failed to start its worker daemon: {err}", node.node_name());
            }
        }

        info!("virtual cluster {cluster_name:?} ready");
        Ok(cluster_name)
    }

    /// Tears down a cluster by name: releases every node, then removes its
    /// fragment from the scheduler config. A reconfiguration failure here
    /// still surfaces to the caller even though the cluster is already gone
    /// from the registry; reconciling the scheduler config is left to the
    /// administrator.
    pub async fn destroy_virtual_cluster(&self, name: &str) -> Result<()> {
        let cluster = self
            .clusters
            .lock()
            .await
            .remove(name)
            .ok_or_else(|| Error::InvalidClusterName(name.to_string()))?;

        release_all(&cluster.nodes).await;

        let fragment = cluster.config_fragment();
        self.update_slurm_config(&fragment, "", true).await
    }

    /// Tears down every currently registered cluster. Best-effort: a
    /// per-cluster failure is logged and counted, not propagated, so one
    /// stubborn cluster doesn't block the rest.
    pub async fn destroy_all_virtual_clusters(&self) -> usize {
        let names: Vec<String> = self.clusters.lock().await.keys().cloned().collect();
        let mut destroyed = 0;
        for name in names {
            match self.destroy_virtual_cluster(&name).await {
                Ok(()) => destroyed += 1,
                Err(err) => error!("failed to destroy cluster {name:?}: {err}"),
            }
        }
        destroyed
    }

    /// The only code path that touches the scheduler config file: under an
    /// exclusive advisory lock (acquired on a blocking worker, never the
    /// async scheduling thread), read the whole file, delete every
    /// occurrence of `remove`, append `add`, and rewrite it in place. If
    /// `notify`, also run the configured reconfigure command and fail with
    /// [`Error::ReconfigurationError`] on a nonzero exit.
    async fn update_slurm_config(&self, remove: &str, add: &str, notify: bool) -> Result<()> {
        let path = self.slurmconfig_path.clone();
        let remove = remove.to_string();
        let add = add.to_string();

        tokio::task::spawn_blocking(move || -> Result<()> {
            use fs4::FileExt;
            use std::io::{Read, Seek, SeekFrom, Write};

            let mut file = std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .open(&path)?;
            file.lock_exclusive()?;

            let mut contents = String::new();
            file.read_to_string(&mut contents)?;

            let mut updated = contents.replace(&remove, "");
            updated.push_str(&add);

            file.seek(SeekFrom::Start(0))?;
            file.set_len(0)?;
            file.write_all(updated.as_bytes())?;
            file.sync_all()?;

            fs4::FileExt::unlock(&file)?;
            Ok(())
        })
        .await??;

        if notify {
            debug!("running reconfigure command: `{}`", self.reconfigure_cmd);
            let output = tokio::process::Command::new("sh")
                .arg("-c")
                .arg(&self.reconfigure_cmd)
                .output()
                .await?;
            if !output.status.success() {
                return Err(Error::ReconfigurationError(
                    output.status.code().unwrap_or(-1),
                ));
            }
        }

        Ok(())
    }
}

async fn release_all(nodes: &[Arc<dyn Node>]) {
    let results = futures::future::join_all(nodes.iter().map(|n| n.release())).await;
    for (node, result) in nodes.iter().zip(results) {
        if let Err(err) = result {
            warn!("failed to release node {:?}: {err}", node.node_name());
        }
    }
}

/// Adapts [`VurmController`] to the generated `vurm.controller.Controller`
/// service.
pub struct ControllerService {
    controller: Arc<VurmController>,
    /// Whether internal error detail is included in the `Status` sent back
    /// to RPC callers, per the `[vurm] debug` config flag.
    debug: bool,
}

impl ControllerService {
    pub fn new(controller: Arc<VurmController>, debug: bool) -> Self {
        Self { controller, debug }
    }
}

#[tonic::async_trait]
impl Controller for ControllerService {
    async fn create_virtual_cluster(
        &self,
        request: Request<CreateVirtualClusterRequest>,
    ) -> std::result::Result<Response<CreateVirtualClusterReply>, Status> {
        let request = request.into_inner();
        let cluster_name = self
            .controller
            .create_virtual_cluster(
                request.size as usize,
                request.min_size.map(|n| n as usize),
            )
            .await
            .map_err(|e| e.into_status(self.debug))?;
        Ok(Response::new(CreateVirtualClusterReply { cluster_name }))
    }

    async fn destroy_virtual_cluster(
        &self,
        request: Request<DestroyVirtualClusterRequest>,
    ) -> std::result::Result<Response<DestroyVirtualClusterReply>, Status> {
        let cluster_name = request.into_inner().cluster_name;
        self.controller
            .destroy_virtual_cluster(&cluster_name)
            .await
            .map_err(|e| e.into_status(self.debug))?;
        Ok(Response::new(DestroyVirtualClusterReply {}))
    }

    async fn destroy_all_virtual_clusters(
        &self,
        _request: Request<DestroyAllVirtualClustersRequest>,
    ) -> std::result::Result<Response<DestroyAllVirtualClustersReply>, Status> {
        let destroyed_count = self.controller.destroy_all_virtual_clusters().await as u32;
        Ok(Response::new(DestroyAllVirtualClustersReply { destroyed_count }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeState;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeNode {
        name: String,
        state: std::sync::Mutex<NodeState>,
    }

    #[async_trait]
    impl Node for FakeNode {
        fn node_name(&self) -> &str {
            &self.name
        }
        fn hostname(&self) -> &str {
            "localhost"
        }
        fn port(&self) -> u16 {
            1234
        }
        fn state(&self) -> NodeState {
            *self.state.lock().unwrap()
        }
        async fn spawn(&self) -> Result<()> {
            *self.state.lock().unwrap() = NodeState::Started;
            Ok(())
        }
        async fn release(&self) -> Result<()> {
            *self.state.lock().unwrap() = NodeState::Stopped;
            Ok(())
        }
    }

    struct FakeProvisioner {
        available: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Provisioner for FakeProvisioner {
        async fn get_nodes(
            &self,
            count: usize,
            names: &mut dyn Iterator<Item = String>,
        ) -> Result<Vec<Arc<dyn Node>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let give = count.min(self.available);
            Ok((0..give)
                .map(|_| {
                    Arc::new(FakeNode {
                        name: names.next().unwrap(),
                        state: std::sync::Mutex::new(NodeState::Waiting),
                    }) as Arc<dyn Node>
                })
                .collect())
        }
    }

    fn controller_with(
        provisioners: Vec<Arc<dyn Provisioner>>,
        slurmconfig_path: PathBuf,
    ) -> VurmController {
        VurmController::new(provisioners, slurmconfig_path, "true".to_string())
    }

    #[tokio::test]
    async fn creates_cluster_spanning_multiple_provisioners() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let provisioners: Vec<Arc<dyn Provisioner>> = vec![
            Arc::new(FakeProvisioner {
                available: 1,
                calls: AtomicUsize::new(0),
            }),
            Arc::new(FakeProvisioner {
                available: 5,
                calls: AtomicUsize::new(0),
            }),
        ];
        let controller = controller_with(provisioners, file.path().to_path_buf());

        let name = controller.create_virtual_cluster(3, None).await.unwrap();
        assert!(name.starts_with("vc-"));

        let contents = std::fs::read_to_string(file.path()).unwrap();
        assert!(contents.contains(&format!("# [{name}]")));
    }

    #[tokio::test]
    async fn insufficient_resources_releases_partial_allocation() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let provisioners: Vec<Arc<dyn Provisioner>> = vec![Arc::new(FakeProvisioner {
            available: 1,
            calls: AtomicUsize::new(0),
        })];
        let controller = controller_with(provisioners, file.path().to_path_buf());

        let err = controller.create_virtual_cluster(3, None).await.unwrap_err();
        assert!(matches!(err, Error::InsufficientResources { obtained: 1, min_size: 3 }));

        let contents = std::fs::read_to_string(file.path()).unwrap();
        assert!(contents.is_empty());
    }

    #[tokio::test]
    async fn destroy_removes_fragment_and_unknown_name_errors() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let provisioners: Vec<Arc<dyn Provisioner>> = vec![Arc::new(FakeProvisioner {
            available: 2,
            calls: AtomicUsize::new(0),
        })];
        let controller = controller_with(provisioners, file.path().to_path_buf());

        let name = controller.create_virtual_cluster(2, None).await.unwrap();
        controller.destroy_virtual_cluster(&name).await.unwrap();

        let contents = std::fs::read_to_string(file.path()).unwrap();
        assert!(!contents.contains(&format!("# [{name}]")));

        assert!(matches!(
            controller.destroy_virtual_cluster("vc-0000000").await,
            Err(Error::InvalidClusterName(_))
        ));
    }
}
