//! Tether lifecycle-management (LCM) surface
//!
//! This crate defines everything an external controller needs to drive a
//! tether agent:
//! - the request/response model for codeletset load and unload
//!   (`api` module)
//! - the packed binary wire codec used over the LCM IPC socket
//!   (`wire` module)
//! - a one-request-per-connection UNIX-socket server and client
//!   (`server` / `client` modules)
//! - stream-id parsing and deterministic derivation (`stream_id` module)
//!
//! The agent core (`tether-agent`) plugs its lifecycle controller into
//! `server::LcmServer`; command-line tooling (`tether-cli`) builds
//! requests and ships them with `client`.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod api;
pub mod client;
pub mod server;
pub mod stream_id;
pub mod wire;

pub use api::{
    CodeletDesc, CodeletsetLoadReq, CodeletsetUnloadReq, IoChannelDesc, LinkedMapDesc, LoadError,
    UnloadError,
};
pub use client::{send_load_req, send_unload_req, IpcError};
pub use server::{LcmServer, LcmServerConfig};
pub use stream_id::StreamId;
