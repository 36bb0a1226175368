// The well-known port loop and the single-session slot.
//
// One transfer at a time: the server holds at most one running session.
// A read request is accepted only while the slot is empty; a request
// arriving mid-transfer gets a "server busy" error and the active
// session is left alone. The runtime is single threaded, so slot
// occupancy is the mutual exclusion; there is no lock anywhere.

use crate::config::Config;
use crate::conn::{self, SessionRunner};
use crate::source::{FileSource, OpenError};
use crate::tftp::{ErrorCode, FileMode, Packet, SocketError, TftpSocket};
use crate::transfer::{Outcome, ReadTransfer};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::task::JoinHandle;

/// How long the accept loop waits for a datagram before it checks on the
/// active session again.
const SLOT_POLL: Duration = Duration::from_millis(500);

/// How long an in-flight transfer may keep running after an interrupt.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

struct Session {
    peer: SocketAddr,
    handle: JoinHandle<()>,
}

/// Listens on the well-known TFTP port and owns the single-session slot.
pub struct Server {
    sock: TftpSocket,
    directory: PathBuf,
    retry_timeout: Duration,
    max_retries: u8,
    active: Option<Session>,
}

fn open_error_code(error: &OpenError) -> ErrorCode {
    match error {
        OpenError::NotFound => ErrorCode::FileNotFound,
        OpenError::Forbidden => ErrorCode::AccessViolation,
        OpenError::Unreadable(_) => ErrorCode::AccessViolation,
    }
}

impl Server {
    pub fn new(config: &Config) -> Result<Server, SocketError> {
        let sock = TftpSocket::bind(SocketAddr::from((config.ip_address, config.port)))?;

        Ok(Server {
            sock,
            directory: config.directory.clone(),
            retry_timeout: config.timeout,
            max_retries: config.retries,
            active: None,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, SocketError> {
        self.sock.local_addr()
    }

    /// Runs the accept loop until an operator interrupt, then gives the
    /// in-flight session a bounded grace to finish.
    pub async fn run(&mut self) -> Result<(), SocketError> {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                match result {
                    Ok(()) => log::info!("interrupt received, shutting down"),
                    Err(e) => log::error!("failed to listen for interrupt: {e}"),
                }
            }
            _ = self.serve() => {}
        }

        self.drain().await;
        Ok(())
    }

    /// The accept loop: decodes each datagram on the well-known port and
    /// dispatches it. Does not return.
    pub async fn serve(&mut self) {
        loop {
            self.reap_finished();

            match self.sock.recv_with_timeout(SLOT_POLL).await {
                Ok((Ok(packet), from)) => self.handle_datagram(packet, from).await,
                Ok((Err(e), from)) => {
                    log::warn!("{from}: undecodable datagram: {e}");
                    self.send_error(from, ErrorCode::Illegal, &e.to_string()).await;
                }
                Err(SocketError::Timeout(_)) => {}
                Err(SocketError::IO(e)) => {
                    log::error!("receive failed on the listening socket: {e}");
                }
            }
        }
    }

    async fn handle_datagram(&mut self, packet: Packet, from: SocketAddr) {
        match packet {
            Packet::ReadReq { path, mode } => self.handle_read_request(path, mode, from).await,
            Packet::WriteReq { path, .. } => {
                log::warn!("{from}: refusing write request for '{path}'");
                self.send_error(from, ErrorCode::Illegal, "write requests are not supported")
                    .await;
            }
            Packet::Error { code, message } => {
                log::info!("{from}: client error on the listening port: {code:?}: '{message}'");
            }
            Packet::Data { .. } | Packet::Ack { .. } => {
                // Strays; transfers live on their session ports.
                log::debug!("{from}: ignoring stray {packet:?} on the listening port");
            }
        }
    }

    async fn handle_read_request(&mut self, path: String, mode: FileMode, from: SocketAddr) {
        log::info!("{from}: read request for '{path}' ({mode:?})");

        self.reap_finished();
        if self.active.is_some() {
            log::warn!("{from}: rejecting request, a transfer is already in progress");
            self.send_error(from, ErrorCode::Undefined, "server busy").await;
            return;
        }

        if mode != FileMode::Octet {
            log::warn!("{from}: rejecting request, only octet mode is supported");
            self.send_error(from, ErrorCode::Illegal, "only octet mode is supported").await;
            return;
        }

        let source = match FileSource::open(&self.directory, &path).await {
            Ok(source) => source,
            Err(e) => {
                log::warn!("{from}: cannot serve '{path}': {e}");
                self.send_error(from, open_error_code(&e), &e.to_string()).await;
                return;
            }
        };

        self.start_session(source, from);
    }

    /// Binds the session-private endpoint and occupies the slot.
    fn start_session(&mut self, source: FileSource, peer: SocketAddr) {
        let sock = conn::bind_session_socket();
        let path = source.path().display().to_string();
        let transfer = ReadTransfer::new(source, self.max_retries);
        let runner = SessionRunner::new(sock, peer, transfer, self.retry_timeout);

        log::info!("{peer}: sending {path}");
        let handle = tokio::spawn(async move {
            match runner.run().await {
                Outcome::Completed => log::info!("{peer}: sent {path}"),
                Outcome::Failed(cause) => {
                    log::warn!("{peer}: transfer of {path} failed: {cause:?}")
                }
            }
        });

        self.active = Some(Session { peer, handle });
    }

    /// Vacates the slot once the session task has reached its terminal
    /// state.
    fn reap_finished(&mut self) {
        if self.active.as_ref().is_some_and(|session| session.handle.is_finished()) {
            if let Some(session) = self.active.take() {
                log::debug!("{}: session retired, slot free", session.peer);
            }
        }
    }

    /// Lets the in-flight session finish after an interrupt, within a
    /// bounded grace period.
    async fn drain(&mut self) {
        if let Some(mut session) = self.active.take() {
            if session.handle.is_finished() {
                return;
            }
            log::info!(
                "waiting up to {SHUTDOWN_GRACE:?} for the transfer to {} to finish",
                session.peer
            );
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut session.handle).await.is_err() {
                log::warn!("{}: transfer did not finish in time, aborting it", session.peer);
                session.handle.abort();
            }
        }
    }

    async fn send_error(&self, to: SocketAddr, code: ErrorCode, message: &str) {
        // Courtesy reply; delivery is best effort.
        let packet = Packet::Error { code, message: message.to_string() };
        if let Err(e) = self.sock.send(&packet, to).await {
            log::warn!("{to}: unable to send error reply: {e}");
        }
    }
}
