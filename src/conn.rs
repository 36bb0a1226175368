// The session-side connection driver.
//
// A session begins when the server accepts a read request. The reply
// comes from a freshly bound ephemeral port (the session-private
// endpoint, per TFTP convention); the client's acks arrive there and the
// whole DATA/ACK exchange stays on it for the life of the transfer. The
// driver owns that socket and the transfer state machine: send the
// pending packet, wait for the peer with the retransmission timeout as
// the upper bound, feed what happened into the machine, act on what it
// answers.

use crate::tftp::{SocketError, TftpSocket};
use crate::transfer::{Outcome, ReadTransfer, ResultAction};
use rand::Rng;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Binds a session socket on a random ephemeral port, retrying until one
/// succeeds.
pub fn bind_session_socket() -> TftpSocket {
    let mut rng = rand::thread_rng();
    loop {
        match TftpSocket::bind((Ipv4Addr::UNSPECIFIED, rng.gen_range(1024..65535)).into()) {
            Ok(sock) => return sock,
            Err(e) => log::warn!("couldn't bind session socket: {e}"),
        }
    }
}

/// Runs one accepted read request to its terminal state.
pub struct SessionRunner {
    sock: TftpSocket,
    peer: SocketAddr,
    transfer: ReadTransfer,
    retry_timeout: Duration,
}

impl SessionRunner {
    pub fn new(
        sock: TftpSocket,
        peer: SocketAddr,
        transfer: ReadTransfer,
        retry_timeout: Duration,
    ) -> SessionRunner {
        SessionRunner { sock, peer, transfer, retry_timeout }
    }

    /// Does the work of sending and receiving data over the connection
    /// until the transfer completes or fails.
    pub async fn run(mut self) -> Outcome {
        let mut action = self.transfer.first_packet().await;

        loop {
            let out_packet = match action {
                ResultAction::SendPacketAndAwait(packet) => packet,
                ResultAction::RetryRecv => {
                    action = self.await_event().await;
                    continue;
                }
                ResultAction::CloseConnection(outcome) => return outcome,
                ResultAction::TerminateWithPacket(packet, outcome) => {
                    // Courtesy error packet; it is never retransmitted.
                    let _ = self.sock.send(&packet, self.peer).await;
                    return outcome;
                }
            };

            if let Err(e) = self.sock.send(&out_packet, self.peer).await {
                // A failed send looks like a lost datagram to the peer;
                // the retransmission timer picks it up.
                log::warn!("unable to send packet to {}: {e}", self.peer);
            }

            action = self.await_event().await;
        }
    }

    /// Waits for the next event the state machine cares about: a packet
    /// from the peer, an undecodable datagram from the peer, or timer
    /// expiry.
    async fn await_event(&mut self) -> ResultAction {
        loop {
            match self.sock.recv_with_timeout(self.retry_timeout).await {
                Ok((decoded, src)) => {
                    if src != self.peer {
                        // Stray datagram aimed at our ephemeral port; it
                        // is no part of this session.
                        log::debug!(
                            "ignoring datagram from {src} during transfer with {}",
                            self.peer
                        );
                        continue;
                    }

                    match decoded {
                        Ok(packet) => {
                            log::debug!("got packet from {src}: {packet:?}");
                            match self.transfer.process_packet(&packet).await {
                                ResultAction::RetryRecv => continue,
                                action => return action,
                            }
                        }
                        Err(e) => return self.transfer.reject_malformed(&e),
                    }
                }
                Err(SocketError::Timeout(_)) => return self.transfer.retransmit(),
                Err(SocketError::IO(e)) => {
                    // Bounded like a lost packet: receive failures count
                    // against the retry budget.
                    log::warn!("socket error while waiting for {}: {e}", self.peer);
                    return self.transfer.retransmit();
                }
            }
        }
    }
}
