// Copyright (c) 2024, VURM Contributors.
// All rights reserved.
//
// This VURM Software is licensed under the BSD-3-Clause license.
// Please see the LICENSE file for more details.

pub mod cluster;
pub mod config;
pub mod controller;
pub mod error;
pub mod node;
pub mod pool;
pub mod provisioners;

/// Generated client/server stubs for the `vurm.controller.Controller` RPC service.
pub mod controller_rpc {
    tonic::include_proto!("vurm.controller");
}

/// Generated client/server stubs for the `vurm.agent.Agent` RPC service.
pub mod agent_rpc {
    tonic::include_proto!("vurm.agent");
}
