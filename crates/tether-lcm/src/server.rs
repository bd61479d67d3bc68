//! LCM IPC server
//!
//! A thin framing layer over a UNIX-domain stream socket. Each
//! connection carries exactly one request and one response; the actual
//! lifecycle work happens in callbacks injected by the agent.

use crate::api::{CodeletsetLoadReq, CodeletsetUnloadReq, LoadError, UnloadError};
use crate::wire::{
    self, Request, WireError, OUTCOME_FAIL, OUTCOME_SUCCESS,
};
use log::{debug, error, info, warn};
use std::io;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Callback invoked for each decoded load request.
pub type LoadCallback = Box<dyn Fn(&CodeletsetLoadReq) -> Result<(), LoadError> + Send + Sync>;
/// Callback invoked for each decoded unload request.
pub type UnloadCallback =
    Box<dyn Fn(&CodeletsetUnloadReq) -> Result<(), UnloadError> + Send + Sync>;

/// Configuration for [`LcmServer`].
pub struct LcmServerConfig {
    /// Filesystem path of the UNIX socket.
    pub address: PathBuf,
    /// Load request handler.
    pub load_cb: LoadCallback,
    /// Unload request handler.
    pub unload_cb: UnloadCallback,
}

/// Handle used to stop a running server from another thread.
#[derive(Clone)]
pub struct ServerHandle {
    running: Arc<AtomicBool>,
}

impl ServerHandle {
    /// Ask the accept loop to exit. Takes effect within one poll tick.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}

/// One-request-per-connection LCM IPC server.
pub struct LcmServer {
    listener: UnixListener,
    address: PathBuf,
    load_cb: LoadCallback,
    unload_cb: UnloadCallback,
    running: Arc<AtomicBool>,
}

impl LcmServer {
    /// Bind the server socket, replacing any stale socket file.
    pub fn bind(config: LcmServerConfig) -> io::Result<Self> {
        if config.address.exists() {
            std::fs::remove_file(&config.address)?;
        }
        let listener = UnixListener::bind(&config.address)?;
        // Accept with a poll cadence so stop() can interrupt the loop.
        listener.set_nonblocking(true)?;
        info!("LCM IPC server listening at {}", config.address.display());
        Ok(Self {
            listener,
            address: config.address,
            load_cb: config.load_cb,
            unload_cb: config.unload_cb,
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    /// Socket path this server is bound to.
    pub fn address(&self) -> &Path {
        &self.address
    }

    /// Get a handle that can stop the accept loop.
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            running: self.running.clone(),
        }
    }

    /// Serve requests until [`ServerHandle::stop`] is called.
    pub fn run(&self) {
        while self.running.load(Ordering::Acquire) {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    if let Err(err) = self.serve_connection(stream) {
                        warn!("LCM IPC connection failed: {err}");
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(err) => {
                    error!("LCM IPC accept failed: {err}");
                    std::thread::sleep(Duration::from_millis(50));
                }
            }
        }
        let _ = std::fs::remove_file(&self.address);
        info!("LCM IPC server stopped");
    }

    fn serve_connection(&self, mut stream: UnixStream) -> Result<(), WireError> {
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(Duration::from_secs(5)))?;
        stream.set_write_timeout(Some(Duration::from_secs(5)))?;

        let payload = wire::read_message(&mut stream)?;
        let response = match wire::decode_request(&payload) {
            Ok(Request::Load(req)) => {
                debug!("LCM IPC load request for codeletset {}", req.codeletset_id);
                match (self.load_cb)(&req) {
                    Ok(()) => wire::encode_response(OUTCOME_SUCCESS, "Codeletset is loaded OK."),
                    Err(err) => {
                        warn!("codeletset {} load rejected: {err}", req.codeletset_id);
                        wire::encode_response(OUTCOME_FAIL, &err.to_string())
                    }
                }
            }
            Ok(Request::Unload(req)) => {
                debug!(
                    "LCM IPC unload request for codeletset {}",
                    req.codeletset_id
                );
                match (self.unload_cb)(&req) {
                    Ok(()) => wire::encode_response(OUTCOME_SUCCESS, "Codeletset unloaded."),
                    Err(err) => {
                        warn!("codeletset {} unload rejected: {err}", req.codeletset_id);
                        wire::encode_response(OUTCOME_FAIL, &err.to_string())
                    }
                }
            }
            Err(err) => {
                warn!("malformed LCM IPC request: {err}");
                wire::encode_response(OUTCOME_FAIL, &err.to_string())
            }
        };
        wire::write_message(&mut stream, &response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client;
    use std::sync::atomic::AtomicUsize;

    fn spawn_server(
        dir: &tempfile::TempDir,
        load_hits: Arc<AtomicUsize>,
    ) -> (PathBuf, ServerHandle, std::thread::JoinHandle<()>) {
        let _ = env_logger::builder().is_test(true).try_init();
        let address = dir.path().join("lcm_sock");
        let server = LcmServer::bind(LcmServerConfig {
            address: address.clone(),
            load_cb: Box::new(move |req| {
                load_hits.fetch_add(1, Ordering::SeqCst);
                if req.codeletset_id == "reject" {
                    Err(LoadError::ParamInvalid("rejected by test".into()))
                } else {
                    Ok(())
                }
            }),
            unload_cb: Box::new(|_| Ok(())),
        })
        .unwrap();
        let handle = server.handle();
        let join = std::thread::spawn(move || server.run());
        (address, handle, join)
    }

    #[test]
    fn test_load_roundtrip_over_socket() {
        let dir = tempfile::tempdir().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let (address, handle, join) = spawn_server(&dir, hits.clone());

        let req = CodeletsetLoadReq {
            codeletset_id: "set1".into(),
            codelets: vec![crate::api::CodeletDesc::new("c1", "test1", "/tmp/c1.o")],
        };
        client::send_load_req(&address, &req).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let rejected = CodeletsetLoadReq {
            codeletset_id: "reject".into(),
            codelets: vec![crate::api::CodeletDesc::new("c1", "test1", "/tmp/c1.o")],
        };
        let err = client::send_load_req(&address, &rejected).unwrap_err();
        assert!(err.to_string().contains("rejected by test"));

        handle.stop();
        join.join().unwrap();
    }

    #[test]
    fn test_unload_roundtrip_over_socket() {
        let dir = tempfile::tempdir().unwrap();
        let (address, handle, join) = spawn_server(&dir, Arc::new(AtomicUsize::new(0)));

        client::send_unload_req(
            &address,
            &CodeletsetUnloadReq {
                codeletset_id: "set1".into(),
            },
        )
        .unwrap();

        handle.stop();
        join.join().unwrap();
    }
}
