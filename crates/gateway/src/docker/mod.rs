pub mod client;
pub mod container;
pub mod event;
pub mod exec;
mod runtime;

pub use client::{DockerClient, DockerError};
