// Copyright (c) 2024, VURM Contributors.
// All rights reserved.
//
// This VURM Software is licensed under the BSD-3-Clause license.
// Please see the LICENSE file for more details.

//! Virtual clusters: a named set of nodes exposed as one scheduler
//! partition.

use std::sync::{Arc, Mutex};

use futures::future::join_all;
use log::{debug, info};
use rand::Rng;

use crate::node::Node;

/// The characters used to generate virtual cluster names.
pub const CLUSTER_NAME_CHARS: &[u8] = b"0123456789abcdef";

/// The length of the generated cluster id, excluding the prefix.
pub const CLUSTER_NAME_LENGTH: usize = 7;

/// Prefix applied to every generated cluster name.
pub const CLUSTER_NAME_PREFIX: &str = "vc-";

/// Prefix applied to every node name within a cluster.
pub const NODE_NAME_PREFIX: &str = "nd-";

/// Owns the process-wide set of cluster names in use, guaranteeing no two
/// calls to [`NamingAuthority::generate_cluster_name`] ever return the same
/// name while the earlier one is still registered.
///
/// This replaces the process-wide static set from the original
/// implementation with a value owned by the top-level application and
/// injected wherever a unique name is needed, per the no-global-mutable-state
/// design.
#[derive(Default)]
pub struct NamingAuthority {
    names: Mutex<std::collections::HashSet<String>>,
}

impl NamingAuthority {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generates a cluster name of the form `vc-<7 lowercase hex chars>`,
    /// guaranteed unique among names generated by this authority.
    pub fn generate_cluster_name(&self) -> String {
        let mut names = self.names.lock().expect("naming authority mutex poisoned");
        loop {
            let id = random_hex_id(CLUSTER_NAME_LENGTH);
            if !names.contains(&id) {
                names.insert(id.clone());
                return format!("{CLUSTER_NAME_PREFIX}{id}");
            }
        }
    }
}

fn random_hex_id(length: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| CLUSTER_NAME_CHARS[rng.gen_range(0..CLUSTER_NAME_CHARS.len())] as char)
        .collect()
}

/// Produces the sequence of node names for a cluster: `nd-<id>-0`,
/// `nd-<id>-1`, ... in construction order, where `<id>` is the cluster's
/// name with the `vc-` prefix stripped. Indexes are zero-padded to `width`
/// digits, matching §3's `len(str(N-1))` rule where `N` is the cluster's
/// target size: since the final node count can only ever be at most the
/// requested size (a shortfall is possible, never a surplus), padding
/// against the requested size is always wide enough for the nodes actually
/// obtained.
pub struct NodeNameIter {
    prefix: String,
    width: usize,
    next: usize,
}

impl NodeNameIter {
    pub fn new(cluster_name: &str, width: usize) -> Self {
        let id = cluster_name
            .strip_prefix(CLUSTER_NAME_PREFIX)
            .unwrap_or(cluster_name);
        Self {
            prefix: format!("{NODE_NAME_PREFIX}{id}-"),
            width,
            next: 0,
        }
    }

    /// The zero-padded index width for a cluster whose target size is
    /// `size`: `len(str(size - 1))`, per §3.
    pub fn index_width(size: usize) -> usize {
        size.saturating_sub(1).to_string().len()
    }
}

impl Iterator for NodeNameIter {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        let name = format!("{}{:0width$}", self.prefix, self.next, width = self.width);
        self.next += 1;
        Some(name)
    }
}

/// A named set of nodes, owned by the controller for the duration of its
/// lifecycle.
pub struct VirtualCluster {
    pub name: String,
    pub nodes: Vec<Arc<dyn Node>>,
    index_width: usize,
}

impl VirtualCluster {
    /// `index_width` must match the width used to generate the nodes' own
    /// names (see [`NodeNameIter::index_width`]), so the partition's
    /// `Nodes=nd-<id>-[0-N]` range lines up digit-for-digit with the actual
    /// `NodeName=` entries above it.
    pub fn new(name: String, nodes: Vec<Arc<dyn Node>>, index_width: usize) -> Self {
        info!("new virtual cluster {name:?} created with {} nodes", nodes.len());
        Self {
            name,
            nodes,
            index_width,
        }
    }

    /// Spawns every node's worker daemon concurrently. Collects every
    /// outcome rather than short-circuiting on the first failure, mirroring
    /// the original's `DeferredList` semantics; the caller decides the
    /// failure policy.
    pub async fn spawn_all(&self) -> Vec<crate::error::Result<()>> {
        debug!("spawning slurm daemons on all nodes of {:?}", self.name);
        join_all(self.nodes.iter().map(|n| n.spawn())).await
    }

    /// Releases every node concurrently, tolerating nodes in any state.
    /// Always succeeds in aggregate per-node idempotence; individual
    /// failures are still reported to the caller.
    pub async fn release_all(&self) -> Vec<crate::error::Result<()>> {
        debug!("releasing all nodes of {:?}", self.name);
        join_all(self.nodes.iter().map(|n| n.release())).await
    }

    /// Renders this cluster's delimited scheduler-config fragment. This
    /// exact text is used as both insert-payload and remove-key when
    /// editing the scheduler config, so it must stay byte-stable across
    /// calls for an unchanged node set.
    pub fn config_fragment(&self) -> String {
        let id = self
            .name
            .strip_prefix(CLUSTER_NAME_PREFIX)
            .unwrap_or(&self.name);
        let last_index = self.nodes.len().saturating_sub(1);

        let mut lines = Vec::with_capacity(self.nodes.len() + 3);
        lines.push(format!("# [{}]", self.name));
        for node in &self.nodes {
            lines.push(node.render_config_line());
        }
        lines.push(format!(
            "PartitionName={} Nodes={}{}-[{:0width$}-{:0width$}] Default=NO MaxTime=INFINITE State=UP",
            self.name, NODE_NAME_PREFIX, id, 0, last_index, width = self.index_width
        ));
        lines.push(format!("# [/{}]", self.name));

        let mut fragment = lines.join("\n");
        fragment.push('\n');
        fragment
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::node::NodeState;
    use async_trait::async_trait;

    struct StubNode {
        name: String,
    }

    #[async_trait]
    impl Node for StubNode {
        fn node_name(&self) -> &str {
            &self.name
        }
        fn hostname(&self) -> &str {
            "localhost"
        }
        fn port(&self) -> u16 {
            6818
        }
        fn state(&self) -> NodeState {
            NodeState::Started
        }
        async fn spawn(&self) -> Result<()> {
            Ok(())
        }
        async fn release(&self) -> Result<()> {
            Ok(())
        }
    }

    fn stub_cluster(size: usize) -> VirtualCluster {
        let cluster_name = "vc-0000001".to_string();
        let width = NodeNameIter::index_width(size);
        let names = NodeNameIter::new(&cluster_name, width);
        let nodes: Vec<Arc<dyn Node>> = names
            .take(size)
            .map(|name| Arc::new(StubNode { name }) as Arc<dyn Node>)
            .collect();
        VirtualCluster::new(cluster_name, nodes, width)
    }

    #[test]
    fn naming_authority_never_repeats() {
        let authority = NamingAuthority::new();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..200 {
            let name = authority.generate_cluster_name();
            assert!(name.starts_with(CLUSTER_NAME_PREFIX));
            assert!(seen.insert(name));
        }
    }

    #[test]
    fn node_name_iter_is_sequential_with_no_padding_for_small_clusters() {
        let mut iter = NodeNameIter::new("vc-abc1234", NodeNameIter::index_width(3));
        assert_eq!(iter.next().unwrap(), "nd-abc1234-0");
        assert_eq!(iter.next().unwrap(), "nd-abc1234-1");
        assert_eq!(iter.next().unwrap(), "nd-abc1234-2");
    }

    #[test]
    fn node_name_iter_zero_pads_for_double_digit_clusters() {
        let mut iter = NodeNameIter::new("vc-abc1234", NodeNameIter::index_width(11));
        assert_eq!(iter.next().unwrap(), "nd-abc1234-00");
        for _ in 0..9 {
            iter.next();
        }
        assert_eq!(iter.next().unwrap(), "nd-abc1234-10");
    }

    #[test]
    fn config_fragment_range_matches_unpadded_small_cluster() {
        let cluster = stub_cluster(3);
        let fragment = cluster.config_fragment();
        assert!(fragment.contains("NodeName=nd-0000001-0 "));
        assert!(fragment.contains("Nodes=nd-0000001-[0-2]"));
        assert!(fragment.starts_with("# [vc-0000001]\n"));
        assert!(fragment.ends_with("# [/vc-0000001]\n"));
    }

    #[test]
    fn config_fragment_range_is_zero_padded_for_double_digit_cluster() {
        let cluster = stub_cluster(11);
        let fragment = cluster.config_fragment();
        assert!(fragment.contains("NodeName=nd-0000001-00 "));
        assert!(fragment.contains("NodeName=nd-0000001-10 "));
        assert!(fragment.contains("Nodes=nd-0000001-[00-10]"));
    }
}
