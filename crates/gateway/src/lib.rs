// Module layout for the dexgate control-plane gateway.

// Container engine access
pub mod docker;
pub mod runtime;

// Core mechanisms
pub mod correlator;
pub mod rpc;
pub mod tracker;

// Domain modules
pub mod attach;
pub mod fleet;
pub mod service;
pub mod setup;

// Process wiring
pub mod boot;
pub mod config;
pub mod server;
pub mod state;
