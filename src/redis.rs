//! Redis連接模組
//!
//! 此模組按部署模式（單節點、哨兵、靜態主從、集群）建立連接，
//! 並提供統一的操作接口、基於游標的鍵掃描以及連接註冊表。

pub mod client;
pub mod commands;
pub mod connection;
pub mod endpoint;
pub mod manager;
pub mod registry;
pub mod scan;
pub mod topology;

#[cfg(test)]
pub mod test_config;

pub use client::*;
pub use commands::{parse_cluster_primaries, parse_replication_role, NodeRole};
pub use connection::{
    ClusterConnection, MasterReplicaConnection, ReplicaAwareConnection, SentinelConnection,
    StandaloneConnection,
};
pub use endpoint::{parse_node_list, EndpointKey, NodeAddr, SentinelEndpoint};
pub use manager::{RedisHandle, RedisManager};
pub use registry::{CloseFailure, CloseReport, CloseStage, ConnectionRegistry};
pub use scan::{scan_collect, scan_keys, ScanCursor, ScanPage, ScanSource, ScanStats};
pub use topology::ClusterTopology;
