//! Network side: the transport seam and the login/progress client.

pub mod client;
pub mod transport;

pub use client::{Fetched, Login, Pushed, RemoteSyncClient};
pub use transport::{Method, ReqwestTransport, Transport, TransportRequest, TransportResponse};
