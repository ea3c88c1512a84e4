//! JSON-RPC API Layer
//!
//! Exposes the queue operations as JSON-RPC 2.0 methods on localhost.

pub mod error;
pub mod handler;
pub mod server;
pub mod types;

pub use server::{RpcServer, RpcServerConfig};
