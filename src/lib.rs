//! Control-plane library for a microVM sandbox platform.
//!
//! Sandbox lifecycle (create/resume/pause/snapshot/checkpoint/clone),
//! template builds and tagging, and the proxy resume fast path, behind
//! `Store`/`Orchestrator`/`DistributedLock` ports so the relational store,
//! cluster scheduler, and distributed lock service -- all out of scope here --
//! can be swapped for real implementations without touching the coordinators.

pub mod build;
pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod http_api;
pub mod lifecycle;
pub mod lock;
pub mod logs;
pub mod model;
pub mod network_policy;
pub mod orchestrator;
pub mod proxy_service;
pub mod resume;
pub mod store;
pub mod tags;
pub mod template_manager;
pub mod token;
pub mod volumes;

pub mod proxy {
    pub mod v1 {
        tonic::include_proto!("agentkernel.proxy.v1");
    }
}
