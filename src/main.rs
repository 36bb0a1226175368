// This is a read-only TFTP server (RFC 1350), octet mode only.
//
// A transfer begins with a read request on the well-known port. If the
// server grants the request, the file is sent in blocks of 512 bytes,
// each from a freshly chosen ephemeral port (the transfer identifier
// convention: the client keeps its source port, the server answers from
// a new one, and the pair identifies the transfer from then on).
//
// Each data packet carries one block and must be acked before the next
// one is sent. A data packet shorter than 512 bytes signals the end of
// the transfer, so a file whose size is an exact multiple of 512 needs
// one trailing empty data packet.
//
// On loss, the sender times out and retransmits the last data packet;
// it keeps exactly one packet around for that. Duplicate acks are
// ignored where they arrive.
//
// Most error conditions terminate the transfer. The error is signaled
// with an error packet, which is never acked and never retransmitted.
// Timeouts cover the case where the error packet itself gets lost.
//
// Packet formats, opcode first (2 bytes, network order):
//
// opcode   operation
// 1        Read request  | filename | 0 | mode | 0
// 2        Write request (recognized, always refused)
// 3        Data          | block # (2 bytes) | data (0-512 bytes)
// 4        Ack           | block # (2 bytes)
// 5        Error         | code (2 bytes) | message | 0
//
// This server answers write requests, non-octet modes, and datagrams it
// cannot parse with error packets; it serves a single transfer at a
// time, and a read request arriving mid-transfer is answered with a
// "server busy" error.

pub mod config;
pub mod conn;
pub mod server;
pub mod source;
pub mod tftp;
pub mod transfer;

use std::env;

use anyhow::{Context, Result};
use config::Config;
use server::Server;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    env_logger::init();

    let config = Config::new(env::args())?;

    let mut server = Server::new(&config)
        .with_context(|| format!("failed to bind {}:{}", config.ip_address, config.port))?;

    log::info!(
        "serving {} on {}:{}",
        config.directory.display(),
        config.ip_address,
        config.port
    );

    server.run().await?;

    Ok(())
}
