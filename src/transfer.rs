// The per-request read state machine.
//
// The machine is pure with respect to time and sockets: the caller feeds
// it events (session start, packet from the peer, retransmission timer
// expiry, undecodable datagram) and it answers with the single action to
// take. The whole DATA/ACK cycle is drivable from tests without a socket
// or a clock.

use crate::source::FileSource;
use crate::tftp::{DecodeError, ErrorCode, Packet, DATA_BUFFER_SIZE};
use std::io;

/// Represents an action the caller of [`ReadTransfer`] should take in
/// response to an event.
#[derive(Debug, PartialEq)]
pub enum ResultAction {
    /// Caller should send the packet and await the next event.
    SendPacketAndAwait(Packet),

    /// Caller should keep waiting for the next packet; nothing changed.
    RetryRecv,

    /// Caller should close the session without sending anything further.
    CloseConnection(Outcome),

    /// Caller should send the packet, then close the session.
    TerminateWithPacket(Packet, Outcome),
}

/// How a session ended.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Outcome {
    Completed,
    Failed(FailureCause),
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum FailureCause {
    /// The retry budget ran out with no matching ack.
    Timeout,
    /// The client sent an Error packet.
    PeerAborted,
    /// The client sent something other than an ack, or bytes that do not
    /// decode at all.
    Malformed,
    /// The served file stopped being readable mid-transfer.
    FileRead(io::ErrorKind),
}

/// Data blocks are numbered from 1; the field wraps at 16 bits and 0
/// never names a data block, so 65535 is followed by 1.
fn next_block_number(block: u16) -> u16 {
    match block.wrapping_add(1) {
        0 => 1,
        next => next,
    }
}

/// The state machine for one read request: sends blocks in sequence,
/// advances on matching acks, retransmits the retained packet on timer
/// expiry, and reports how the session ended.
pub struct ReadTransfer {
    source: FileSource,
    block: u16,
    retries: u8,
    max_retries: u8,
    last_sent: Option<Packet>,
    last_was_short: bool,
}

impl ReadTransfer {
    pub fn new(source: FileSource, max_retries: u8) -> ReadTransfer {
        ReadTransfer {
            source,
            block: 0,
            retries: 0,
            max_retries,
            last_sent: None,
            last_was_short: false,
        }
    }

    /// Builds the first data packet of the session.
    pub async fn first_packet(&mut self) -> ResultAction {
        self.send_next_block().await
    }

    /// Reacts to a packet that arrived on the session endpoint from the
    /// session's peer.
    pub async fn process_packet(&mut self, packet: &Packet) -> ResultAction {
        match packet {
            &Packet::Ack { block } if block == self.block => {
                if self.last_was_short {
                    ResultAction::CloseConnection(Outcome::Completed)
                } else {
                    self.send_next_block().await
                }
            }
            Packet::Ack { block } => {
                // Duplicate or premature ack; sit tight and let the timer
                // drive retransmission.
                log::debug!(
                    "ignoring ack for block {block} while block {} is outstanding",
                    self.block
                );
                ResultAction::RetryRecv
            }
            Packet::Error { code, message } => {
                log::warn!("client aborted transfer: {code:?}: '{message}'");
                ResultAction::CloseConnection(Outcome::Failed(FailureCause::PeerAborted))
            }
            _ => ResultAction::TerminateWithPacket(
                Packet::Error {
                    code: ErrorCode::Illegal,
                    message: "expected an ack packet".to_string(),
                },
                Outcome::Failed(FailureCause::Malformed),
            ),
        }
    }

    /// Reacts to the retransmission timer expiring with no matching ack.
    pub fn retransmit(&mut self) -> ResultAction {
        self.retries += 1;
        if self.retries > self.max_retries {
            return ResultAction::TerminateWithPacket(
                Packet::Error {
                    code: ErrorCode::Undefined,
                    message: "transfer timed out".to_string(),
                },
                Outcome::Failed(FailureCause::Timeout),
            );
        }

        match &self.last_sent {
            Some(packet) => ResultAction::SendPacketAndAwait(packet.clone()),
            // The timer cannot fire before the first send; treat it as a
            // timeout if it somehow does.
            None => ResultAction::CloseConnection(Outcome::Failed(FailureCause::Timeout)),
        }
    }

    /// Reacts to a datagram from the peer that did not decode.
    pub fn reject_malformed(&self, error: &DecodeError) -> ResultAction {
        ResultAction::TerminateWithPacket(
            Packet::Error {
                code: ErrorCode::Illegal,
                message: error.to_string(),
            },
            Outcome::Failed(FailureCause::Malformed),
        )
    }

    async fn send_next_block(&mut self) -> ResultAction {
        match self.source.next_block().await {
            Ok(data) => {
                self.block = next_block_number(self.block);
                self.retries = 0;
                self.last_was_short = data.len() < DATA_BUFFER_SIZE;
                let packet = Packet::Data { block: self.block, data };
                self.last_sent = Some(packet.clone());
                ResultAction::SendPacketAndAwait(packet)
            }
            Err(e) => ResultAction::TerminateWithPacket(
                Packet::Error {
                    code: e.kind().into(),
                    message: format!("failed to read from file: {e}"),
                },
                Outcome::Failed(FailureCause::FileRead(e.kind())),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    async fn transfer_for(contents: &[u8], max_retries: u8) -> (TempDir, ReadTransfer) {
        let dir = TempDir::new("scratch").unwrap();
        tokio::fs::write(dir.path().join("test.bin"), contents).await.unwrap();
        let source = FileSource::open(dir.path(), "test.bin").await.unwrap();
        (dir, ReadTransfer::new(source, max_retries))
    }

    #[tokio::test]
    async fn test_read_multiple_blocks_succeeds() {
        let mut contents = vec![0x78; 1024];
        contents.extend_from_slice(b"testing");
        let (_dir, mut transfer) = transfer_for(&contents, 5).await;

        assert_eq!(
            transfer.first_packet().await,
            ResultAction::SendPacketAndAwait(Packet::Data {
                block: 1,
                data: vec![0x78; 512]
            })
        );

        assert_eq!(
            transfer.process_packet(&Packet::Ack { block: 1 }).await,
            ResultAction::SendPacketAndAwait(Packet::Data {
                block: 2,
                data: vec![0x78; 512]
            })
        );

        assert_eq!(
            transfer.process_packet(&Packet::Ack { block: 2 }).await,
            ResultAction::SendPacketAndAwait(Packet::Data {
                block: 3,
                data: b"testing".to_vec()
            })
        );

        assert_eq!(
            transfer.process_packet(&Packet::Ack { block: 3 }).await,
            ResultAction::CloseConnection(Outcome::Completed)
        );
    }

    #[tokio::test]
    async fn test_exact_block_multiple_sends_trailing_empty_block() {
        let (_dir, mut transfer) = transfer_for(&[0x42; 1024], 5).await;

        assert_eq!(
            transfer.first_packet().await,
            ResultAction::SendPacketAndAwait(Packet::Data { block: 1, data: vec![0x42; 512] })
        );
        assert_eq!(
            transfer.process_packet(&Packet::Ack { block: 1 }).await,
            ResultAction::SendPacketAndAwait(Packet::Data { block: 2, data: vec![0x42; 512] })
        );
        assert_eq!(
            transfer.process_packet(&Packet::Ack { block: 2 }).await,
            ResultAction::SendPacketAndAwait(Packet::Data { block: 3, data: vec![] })
        );
        assert_eq!(
            transfer.process_packet(&Packet::Ack { block: 3 }).await,
            ResultAction::CloseConnection(Outcome::Completed)
        );
    }

    #[tokio::test]
    async fn test_empty_file_sends_single_empty_block() {
        let (_dir, mut transfer) = transfer_for(&[], 5).await;

        assert_eq!(
            transfer.first_packet().await,
            ResultAction::SendPacketAndAwait(Packet::Data { block: 1, data: vec![] })
        );
        assert_eq!(
            transfer.process_packet(&Packet::Ack { block: 1 }).await,
            ResultAction::CloseConnection(Outcome::Completed)
        );
    }

    #[tokio::test]
    async fn test_stale_and_future_acks_are_discarded() {
        let (_dir, mut transfer) = transfer_for(&[0x78; 600], 5).await;

        let _ = transfer.first_packet().await;
        let _ = transfer.process_packet(&Packet::Ack { block: 1 }).await;

        // A re-ack of the previous block changes nothing.
        assert_eq!(
            transfer.process_packet(&Packet::Ack { block: 1 }).await,
            ResultAction::RetryRecv
        );
        // Neither does an ack for a block that was never sent.
        assert_eq!(
            transfer.process_packet(&Packet::Ack { block: 7 }).await,
            ResultAction::RetryRecv
        );

        // The matching ack still completes the transfer afterwards.
        assert_eq!(
            transfer.process_packet(&Packet::Ack { block: 2 }).await,
            ResultAction::CloseConnection(Outcome::Completed)
        );
    }

    #[tokio::test]
    async fn test_retransmits_same_packet_until_budget_runs_out() {
        let (_dir, mut transfer) = transfer_for(&[0x78; 600], 2).await;

        let first = match transfer.first_packet().await {
            ResultAction::SendPacketAndAwait(packet) => packet,
            action => panic!("expected a data packet, got {action:?}"),
        };

        assert_eq!(transfer.retransmit(), ResultAction::SendPacketAndAwait(first.clone()));
        assert_eq!(transfer.retransmit(), ResultAction::SendPacketAndAwait(first));

        match transfer.retransmit() {
            ResultAction::TerminateWithPacket(
                Packet::Error { .. },
                Outcome::Failed(FailureCause::Timeout),
            ) => {}
            action => panic!("expected a timeout failure, got {action:?}"),
        }
    }

    #[tokio::test]
    async fn test_retry_counter_resets_on_matching_ack() {
        let (_dir, mut transfer) = transfer_for(&[0x78; 600], 2).await;

        let _ = transfer.first_packet().await;
        let _ = transfer.retransmit();
        let _ = transfer.retransmit();

        // The ack lands just in time; the next block gets a fresh budget.
        let second = match transfer.process_packet(&Packet::Ack { block: 1 }).await {
            ResultAction::SendPacketAndAwait(packet) => packet,
            action => panic!("expected a data packet, got {action:?}"),
        };
        assert_eq!(transfer.retransmit(), ResultAction::SendPacketAndAwait(second.clone()));
        assert_eq!(transfer.retransmit(), ResultAction::SendPacketAndAwait(second));
    }

    #[tokio::test]
    async fn test_peer_error_packet_aborts_quietly() {
        let (_dir, mut transfer) = transfer_for(&[0x78; 600], 5).await;

        let _ = transfer.first_packet().await;
        assert_eq!(
            transfer
                .process_packet(&Packet::Error {
                    code: ErrorCode::Undefined,
                    message: "whoops".to_string()
                })
                .await,
            ResultAction::CloseConnection(Outcome::Failed(FailureCause::PeerAborted))
        );
    }

    #[tokio::test]
    async fn test_non_ack_packet_terminates_with_error() {
        let (_dir, mut transfer) = transfer_for(&[0x78; 600], 5).await;

        let _ = transfer.first_packet().await;
        match transfer
            .process_packet(&Packet::Data { block: 1, data: vec![0x01] })
            .await
        {
            ResultAction::TerminateWithPacket(
                Packet::Error { code: ErrorCode::Illegal, .. },
                Outcome::Failed(FailureCause::Malformed),
            ) => {}
            action => panic!("expected a malformed failure, got {action:?}"),
        }
    }

    #[test]
    fn test_block_numbers_wrap_past_zero() {
        assert_eq!(next_block_number(0), 1);
        assert_eq!(next_block_number(1), 2);
        assert_eq!(next_block_number(u16::MAX), 1);
    }
}
