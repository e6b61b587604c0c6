//! Handlers for the burst, echo and throughput services

pub mod burst;
pub mod echo;
pub mod throughput;

pub use burst::handle_burst;
pub use echo::serve_echo;
pub use throughput::{serve_throughput, Service};
