//! fleetsim simulator library.
//!
//! This crate primarily ships a `fleet-simulator` binary, but we expose the
//! core components to enable integration testing and embedding the fleet in
//! autoscaler test harnesses.

pub mod api;
pub mod backup;
pub mod catalog;
pub mod chaos;
pub mod cluster;
pub mod config;
pub mod election;
pub mod events;
pub mod instance;
pub mod janitor;
pub mod leadership;
pub mod provider;
pub mod restore;
pub mod runtime;
pub mod simulator;
pub mod snapshot;
pub mod state;
pub mod storage;
pub mod store;
pub mod worker;
