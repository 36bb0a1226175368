use async_io::Async;
use std::error;
use std::fmt;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;
use tokio::time::error::Elapsed;
use tokio::time::timeout;

/// TFTP fixes the data payload at 512 bytes; the first shorter payload
/// marks the end of a transfer.
pub const DATA_BUFFER_SIZE: usize = 512;

/// Largest datagram the server handles: 2-byte opcode, 2-byte block
/// number, full data payload.
const MAX_PACKET_SIZE: usize = 4 + DATA_BUFFER_SIZE;

///////////////////////////////////////////////////////////////
// Error-handling objects

/// Represents an error returned from the TFTP socket wrapper.
#[derive(Debug)]
pub enum SocketError {
    IO(io::Error),
    Timeout(Elapsed),
}

impl error::Error for SocketError {}

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SocketError::IO(e) => write!(f, "Socket IO error: {:#?}", e),
            SocketError::Timeout(e) => write!(f, "Socket IO timeout: {:#?}", e),
        }
    }
}

impl From<io::Error> for SocketError {
    fn from(e: io::Error) -> Self {
        SocketError::IO(e)
    }
}

impl From<Elapsed> for SocketError {
    fn from(e: Elapsed) -> Self {
        SocketError::Timeout(e)
    }
}

type TftpResult<T> = Result<T, SocketError>;

/// A datagram that could not be understood as a TFTP packet.
#[derive(Debug, PartialEq)]
pub enum DecodeError {
    Malformed(String),
    UnknownOpcode(u16),
}

impl error::Error for DecodeError {}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DecodeError::Malformed(msg) => write!(f, "malformed packet: {msg}"),
            DecodeError::UnknownOpcode(code) => write!(f, "unknown opcode {code}"),
        }
    }
}

/// Represents the mode for a file the client wishes to read.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum FileMode { NetAscii, Octet, Mail }

impl FileMode {
    fn as_str(&self) -> &'static str {
        match self {
            FileMode::NetAscii => "netascii",
            FileMode::Octet => "octet",
            FileMode::Mail => "mail",
        }
    }
}

/// Represents a TFTP error code surfaced by a TFTP Error packet.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ErrorCode { Undefined, FileNotFound, AccessViolation, DiskFull, Illegal, UnknownTid, FileAlreadyExists, NoSuchUser }

impl ErrorCode {
    fn from_u16(raw: u16) -> ErrorCode {
        match raw {
            0 => ErrorCode::Undefined,
            1 => ErrorCode::FileNotFound,
            2 => ErrorCode::AccessViolation,
            3 => ErrorCode::DiskFull,
            4 => ErrorCode::Illegal,
            5 => ErrorCode::UnknownTid,
            6 => ErrorCode::FileAlreadyExists,
            7 => ErrorCode::NoSuchUser,
            _ => ErrorCode::Undefined,
        }
    }

    fn as_u16(&self) -> u16 {
        match self {
            ErrorCode::Undefined => 0,
            ErrorCode::FileNotFound => 1,
            ErrorCode::AccessViolation => 2,
            ErrorCode::DiskFull => 3,
            ErrorCode::Illegal => 4,
            ErrorCode::UnknownTid => 5,
            ErrorCode::FileAlreadyExists => 6,
            ErrorCode::NoSuchUser => 7,
        }
    }
}

impl From<io::ErrorKind> for ErrorCode {
    fn from(kind: io::ErrorKind) -> ErrorCode {
        match kind {
            io::ErrorKind::NotFound => ErrorCode::FileNotFound,
            io::ErrorKind::PermissionDenied => ErrorCode::AccessViolation,
            _ => ErrorCode::Undefined,
        }
    }
}

/// An enum representing a TFTP packet and its associated data.
#[derive(Debug, PartialEq, Clone)]
pub enum Packet {
    /// A read request packet
    ReadReq {
        /// The file path the client wants to read.
        path: String,

        /// The file mode.
        mode: FileMode,
    },

    /// A write request packet. Recognized so it can be refused; this
    /// server never services writes.
    WriteReq {
        path: String,
        mode: FileMode,
    },

    /// A data packet
    Data {
        /// The block number for this data packet.
        block: u16,

        /// The contents of the data itself.
        data: Vec<u8>,
    },

    /// An acknowledgment packet
    Ack {
        /// The block being acknowledged.
        block: u16,
    },

    /// An error packet.
    Error {
        code: ErrorCode,
        message: String,
    },
}

fn u16_from_buffer(buf: &[u8]) -> u16 {
    (u16::from(buf[0]) << 8) + u16::from(buf[1])
}

/// Given a buffer, assumes the string begins at the beginning of the buffer
/// and concatenates until it finds a 0 byte, which it assumes terminates
/// the string.
///
/// Returns the string extracted from the buffer as well as the position of
/// the 0 byte in the buffer it was given (or the size of the buffer, if no
/// 0 byte was encountered)
fn string_from_buffer(buf: &[u8]) -> (String, usize) {
    let mut s = String::new();
    for i in 0..buf.len() {
        let c = buf[i];
        if c == 0x00 {
            return (s, i)
        }
        s.push(char::from(c));
    }

    (s, buf.len())
}

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum OpCode { Rrq = 1, Wrq = 2, Data = 3, Ack = 4, Error = 5 }

fn retrieve_op_code(buf: &[u8]) -> Result<OpCode, DecodeError> {
    let rawcode = u16_from_buffer(&buf[..2]);
    match rawcode {
        1 => Ok(OpCode::Rrq),
        2 => Ok(OpCode::Wrq),
        3 => Ok(OpCode::Data),
        4 => Ok(OpCode::Ack),
        5 => Ok(OpCode::Error),
        _ => Err(DecodeError::UnknownOpcode(rawcode)),
    }
}

/// Parses the body of a request packet: a null-terminated filename
/// followed by a null-terminated mode string. Clients may append
/// negotiation options after the mode; those bytes are ignored.
fn parse_path_and_mode(buf: &[u8]) -> Result<(String, FileMode), DecodeError> {
    let (path, path_end) = string_from_buffer(buf);

    if path_end == buf.len() {
        return Err(DecodeError::Malformed("request filename is not null-terminated".to_string()));
    }

    if path.is_empty() {
        return Err(DecodeError::Malformed("request filename is empty".to_string()));
    }

    let (raw_mode, mode_end) = string_from_buffer(&buf[path_end + 1..]);

    if path_end + 1 + mode_end >= buf.len() {
        return Err(DecodeError::Malformed("request mode is not null-terminated".to_string()));
    }

    let mode = match raw_mode.to_lowercase().as_str() {
        "netascii" => FileMode::NetAscii,
        "octet" => FileMode::Octet,
        "mail" => FileMode::Mail,
        _ => return Err(DecodeError::Malformed(format!("unknown file mode '{raw_mode}'"))),
    };

    Ok((path, mode))
}

fn parse_read_req(buf: &[u8]) -> Result<Packet, DecodeError> {
    let (path, mode) = parse_path_and_mode(&buf[2..])?;
    Ok(Packet::ReadReq { path, mode })
}

fn parse_write_req(buf: &[u8]) -> Result<Packet, DecodeError> {
    let (path, mode) = parse_path_and_mode(&buf[2..])?;
    Ok(Packet::WriteReq { path, mode })
}

fn parse_data(buf: &[u8]) -> Result<Packet, DecodeError> {
    let block = u16_from_buffer(&buf[2..4]);
    let data = &buf[4..];
    if data.len() > DATA_BUFFER_SIZE {
        return Err(DecodeError::Malformed(format!(
            "data payload of {} bytes exceeds the {DATA_BUFFER_SIZE} byte limit",
            data.len()
        )));
    }
    Ok(Packet::Data { block, data: Vec::from(data) })
}

fn parse_ack(buf: &[u8]) -> Result<Packet, DecodeError> {
    let block = u16_from_buffer(&buf[2..4]);
    Ok(Packet::Ack { block })
}

fn parse_error(buf: &[u8]) -> Result<Packet, DecodeError> {
    let code = ErrorCode::from_u16(u16_from_buffer(&buf[2..4]));
    let (message, _) = string_from_buffer(&buf[4..]);
    Ok(Packet::Error { code, message })
}

fn push_u16(buf: &mut Vec<u8>, val: u16) {
    buf.extend_from_slice(&val.to_be_bytes());
}

fn push_zstr(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    buf.push(0x00);
}

impl Packet {
    pub fn parse_from_buf(buf: &[u8]) -> Result<Packet, DecodeError> {
        if buf.len() < 4 {
            return Err(DecodeError::Malformed("packet too short".to_string()));
        }

        match retrieve_op_code(&buf[..2])? {
            OpCode::Rrq => parse_read_req(buf),
            OpCode::Wrq => parse_write_req(buf),
            OpCode::Data => parse_data(buf),
            OpCode::Ack => parse_ack(buf),
            OpCode::Error => parse_error(buf),
        }
    }

    /// Serializes the packet into a UDP payload. Data payloads are the
    /// caller's responsibility to keep at or under [`DATA_BUFFER_SIZE`];
    /// the codec never truncates.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(MAX_PACKET_SIZE);
        match self {
            Packet::ReadReq { path, mode } => {
                push_u16(&mut buf, OpCode::Rrq as u16);
                push_zstr(&mut buf, path);
                push_zstr(&mut buf, mode.as_str());
            }
            Packet::WriteReq { path, mode } => {
                push_u16(&mut buf, OpCode::Wrq as u16);
                push_zstr(&mut buf, path);
                push_zstr(&mut buf, mode.as_str());
            }
            Packet::Data { block, data } => {
                push_u16(&mut buf, OpCode::Data as u16);
                push_u16(&mut buf, *block);
                buf.extend_from_slice(data);
            }
            Packet::Ack { block } => {
                push_u16(&mut buf, OpCode::Ack as u16);
                push_u16(&mut buf, *block);
            }
            Packet::Error { code, message } => {
                push_u16(&mut buf, OpCode::Error as u16);
                push_u16(&mut buf, code.as_u16());
                push_zstr(&mut buf, message);
            }
        }
        buf
    }
}

///////////////////////////////////////////////////////////////
/// Wrapper around a UDP socket that parses TFTP headers and
/// returns the packets in a more structured format.
pub struct TftpSocket {
    sock: Async<UdpSocket>,
}

impl TftpSocket {
    pub fn bind(addr: SocketAddr) -> TftpResult<TftpSocket> {
        Ok(TftpSocket {
            sock: Async::<UdpSocket>::bind(addr)?,
        })
    }

    pub fn local_addr(&self) -> TftpResult<SocketAddr> {
        Ok(self.sock.get_ref().local_addr()?)
    }

    pub async fn send(&self, packet: &Packet, dst: SocketAddr) -> TftpResult<()> {
        self.sock.send_to(&packet.to_bytes(), dst).await?;
        Ok(())
    }

    /// Waits up to `ttl` for a datagram. A decode failure comes back as a
    /// value next to the sender address, so the caller can still answer
    /// the sender with an Error packet.
    pub async fn recv_with_timeout(
        &mut self,
        ttl: Duration,
    ) -> TftpResult<(Result<Packet, DecodeError>, SocketAddr)> {
        let mut buf = [0; MAX_PACKET_SIZE];
        let (total_written, src) = timeout(ttl, self.sock.recv_from(&mut buf)).await??;

        Ok((Packet::parse_from_buf(&buf[..total_written]), src))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_read_req() {
        let buf = vec![
            // opcode
            0x00, 0x01,
            // path: /path/to/data.txt with terminating nullchar
            0x2F, 0x70, 0x61, 0x74, 0x68, 0x2F, 0x74, 0x6F, 0x2F, 0x64, 0x61, 0x74, 0x61, 0x2E, 0x74, 0x78, 0x74, 0x00,
            // mode: octet
            0x6F, 0x63, 0x74, 0x65, 0x74, 0x00];

        let packet = Packet::parse_from_buf(&buf);
        assert!(packet.is_ok());
        assert_eq!(packet.unwrap(), Packet::ReadReq { path: "/path/to/data.txt".to_string(), mode: FileMode::Octet });
    }

    #[test]
    fn test_packet_read_req_mode_is_case_insensitive() {
        let buf = vec![
            // opcode
            0x00, 0x01,
            // path: a
            0x61, 0x00,
            // mode: OcTeT
            0x4F, 0x63, 0x54, 0x65, 0x54, 0x00];

        let packet = Packet::parse_from_buf(&buf);
        assert_eq!(packet.unwrap(), Packet::ReadReq { path: "a".to_string(), mode: FileMode::Octet });
    }

    #[test]
    fn test_packet_read_req_ignores_trailing_options() {
        // blksize negotiation appended after the mode is dropped
        let buf = [
            &[0x00, 0x01][..],
            &b"data.bin\x00octet\x00blksize\x001024\x00"[..],
        ]
        .concat();

        let packet = Packet::parse_from_buf(&buf);
        assert_eq!(packet.unwrap(), Packet::ReadReq { path: "data.bin".to_string(), mode: FileMode::Octet });
    }

    #[test]
    fn test_packet_write_req() {
        let buf = vec![
            // opcode
            0x00, 0x02,
            // path: /path/to/data.txt with terminating nullchar
            0x2F, 0x70, 0x61, 0x74, 0x68, 0x2F, 0x74, 0x6F, 0x2F, 0x64, 0x61, 0x74, 0x61, 0x2E, 0x74, 0x78, 0x74, 0x00,
            // mode: mail
            0x6D, 0x61, 0x69, 0x6C, 0x00];

        let packet = Packet::parse_from_buf(&buf);
        assert!(packet.is_ok());
        assert_eq!(packet.unwrap(), Packet::WriteReq { path: "/path/to/data.txt".to_string(), mode: FileMode::Mail });
    }

    #[test]
    fn test_packet_parses_data() {
        let buf = vec![
            // opcode
            0x00, 0x03,
            // block number
            0x12, 0x34,
            // data
            0xDE, 0xAD, 0xBE, 0xEF];

        let packet = Packet::parse_from_buf(&buf);
        assert!(packet.is_ok());
        assert_eq!(packet.unwrap(), Packet::Data { block: 0x1234, data: vec![0xDE, 0xAD, 0xBE, 0xEF] });
    }

    #[test]
    fn test_packet_parses_ack() {
        let buf = vec![0x00, 0x04, 0x10, 0x2f];
        let packet = Packet::parse_from_buf(&buf);
        assert!(packet.is_ok());
        assert_eq!(packet.unwrap(), Packet::Ack { block: 0x102f } );
    }

    #[test]
    fn test_packet_parses_error() {
        let buf = vec![
            // opcode
            0x00, 0x05,
            // Error code
            0x00, 0x04,
            // Error message: Illegal!
            0x49, 0x6C, 0x6C, 0x65, 0x67, 0x61, 0x6C, 0x21];

        let packet = Packet::parse_from_buf(&buf);
        assert!(packet.is_ok());
        assert_eq!(packet.unwrap(), Packet::Error { code: ErrorCode::Illegal, message: "Illegal!".to_string() });
    }

    #[test]
    fn test_packet_parse_failures() {
        // Too short
        assert!(Packet::parse_from_buf(&vec![0x10]).is_err());
        assert!(Packet::parse_from_buf(&vec![0x10, 0x00]).is_err());
        // Invalid read path
        assert!(Packet::parse_from_buf(&vec![0x00, 0x01, 0x68, 0x69]).is_err());
        // Missing mode string
        assert!(Packet::parse_from_buf(&vec![0x00, 0x01, 0x68, 0x69, 0x00]).is_err());
        // Unterminated mode string
        assert!(Packet::parse_from_buf(&vec![0x00, 0x01, 0x68, 0x69, 0x00, 0x6F, 0x63, 0x74, 0x65, 0x74]).is_err());
        // Invalid mode string
        assert!(Packet::parse_from_buf(&vec![0x00, 0x01, 0x68, 0x69, 0x00, 0x62, 0x61, 0x64, 0x00]).is_err());
        // Empty filename
        assert!(Packet::parse_from_buf(&vec![0x00, 0x01, 0x00, 0x6F, 0x63, 0x74, 0x65, 0x74, 0x00]).is_err());
    }

    #[test]
    fn test_unknown_opcodes_are_distinguished() {
        // Opcode 6 is OACK from the negotiation extension; this server
        // does not speak it.
        assert_eq!(
            Packet::parse_from_buf(&vec![0x00, 0x06, 0x62, 0x6C, 0x6B, 0x00]),
            Err(DecodeError::UnknownOpcode(6))
        );
        assert_eq!(
            Packet::parse_from_buf(&vec![0x00, 0x09, 0x00, 0x00]),
            Err(DecodeError::UnknownOpcode(9))
        );
    }

    #[test]
    fn test_oversized_data_payload_is_rejected() {
        let mut buf = vec![0x00, 0x03, 0x00, 0x01];
        buf.extend_from_slice(&[0xAA; DATA_BUFFER_SIZE + 1]);
        assert!(Packet::parse_from_buf(&buf).is_err());
    }

    #[test]
    fn test_data_encodes() {
        assert_eq!(
            Packet::Data { block: 0x1234, data: vec![0xDE, 0xAD, 0xBE, 0xEF] }.to_bytes(),
            vec![0x00, 0x03, 0x12, 0x34, 0xDE, 0xAD, 0xBE, 0xEF]
        );
    }

    #[test]
    fn test_ack_encodes() {
        assert_eq!(
            Packet::Ack { block: 0x102f }.to_bytes(),
            vec![0x00, 0x04, 0x10, 0x2f]
        );
    }

    #[test]
    fn test_error_encodes() {
        assert_eq!(
            Packet::Error { code: ErrorCode::FileNotFound, message: "nope".to_string() }.to_bytes(),
            vec![0x00, 0x05, 0x00, 0x01, 0x6E, 0x6F, 0x70, 0x65, 0x00]
        );
    }

    #[test]
    fn test_read_req_encodes() {
        let bytes = Packet::ReadReq { path: "hi".to_string(), mode: FileMode::Octet }.to_bytes();
        assert_eq!(bytes, vec![0x00, 0x01, 0x68, 0x69, 0x00, 0x6F, 0x63, 0x74, 0x65, 0x74, 0x00]);
        assert_eq!(
            Packet::parse_from_buf(&bytes).unwrap(),
            Packet::ReadReq { path: "hi".to_string(), mode: FileMode::Octet }
        );
    }
}
