// Copyright (c) 2024, VURM Contributors.
// All rights reserved.
//
// This VURM Software is licensed under the BSD-3-Clause license.
// Please see the LICENSE file for more details.

//! Pluggable resource provisioners: backends that produce ready-to-spawn
//! nodes on request.

pub mod local_multi;
pub mod remote_virt;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::node::Node;

/// A backend that produces nodes of one kind.
///
/// `get_nodes` is best-effort: if the provisioner can't satisfy the full
/// `count`, it returns fewer nodes rather than failing outright, and the
/// controller moves on to the next provisioner in its list. Nodes returned
/// here are not yet running their worker daemon — they only have the
/// resources reserved; `Node::spawn` is what actually starts the daemon.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Requests `count` nodes, drawing names from `names` in order (one
    /// name per node actually obtained — unused names are left for the
    /// caller's next provisioner, if any).
    async fn get_nodes(
        &self,
        count: usize,
        names: &mut dyn Iterator<Item = String>,
    ) -> Result<Vec<Arc<dyn Node>>>;
}
