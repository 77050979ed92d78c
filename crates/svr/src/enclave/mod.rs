//! enclave side of the protocol
//!
//! the client never needs this; it exists so the whole exchange can run
//! in-process (tests) or behind a local websocket (svr-dev-enclave).
//!
//! implementations:
//! - software: in-memory records, software attestation, NOT for production
//! - loopback: a [`WebSocketFactory`](crate::transport::WebSocketFactory)
//!   wired straight into a software enclave

pub mod loopback;
pub mod software;

pub use loopback::{ConnectionPlan, LoopbackConnector};
pub use software::{EnclaveConnection, Record, Reply, RequestCounts, SoftwareEnclave};
