//! Host-facing contract and stdio bridge for embedding the engine in a
//! native or web shell.

pub mod contract;
pub mod handler;
pub mod stdio;

pub use handler::HostHandler;
