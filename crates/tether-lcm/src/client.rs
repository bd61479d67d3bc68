//! LCM IPC client
//!
//! Opens one connection per request, ships the packed message and maps
//! the response outcome back to a `Result`.

use crate::api::{CodeletsetLoadReq, CodeletsetUnloadReq};
use crate::wire::{self, WireError};
use log::debug;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

/// Failures while talking to the LCM IPC socket.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    /// Could not connect, write or read the socket.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The response could not be decoded.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// The agent rejected the request; payload is the error message from
    /// the response.
    #[error("request rejected: {0}")]
    Rejected(String),
}

fn exchange(address: &Path, payload: &[u8]) -> Result<(), IpcError> {
    let mut stream = UnixStream::connect(address)?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    stream.set_write_timeout(Some(Duration::from_secs(5)))?;
    wire::write_message(&mut stream, payload)?;
    let response = wire::read_message(&mut stream)?;
    let (ok, msg) = wire::decode_response(&response)?;
    debug!("LCM IPC response ok={ok} msg={msg:?}");
    if ok {
        Ok(())
    } else {
        Err(IpcError::Rejected(msg))
    }
}

/// Send a codeletset load request to the agent at `address`.
pub fn send_load_req(address: &Path, req: &CodeletsetLoadReq) -> Result<(), IpcError> {
    exchange(address, &wire::encode_load_req(req))
}

/// Send a codeletset unload request to the agent at `address`.
pub fn send_unload_req(address: &Path, req: &CodeletsetUnloadReq) -> Result<(), IpcError> {
    exchange(address, &wire::encode_unload_req(req))
}
