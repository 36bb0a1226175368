use anyhow::{bail, Result};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process;
use std::time::Duration;

/// Directory served when no --directory flag is given.
pub const DEFAULT_DIRECTORY: &str = "/srv/tftp";

/// The IANA-assigned TFTP port.
const DEFAULT_PORT: u16 = 69;

const DEFAULT_TIMEOUT_SECS: u64 = 5;
const DEFAULT_RETRIES: u8 = 5;

/// Startup configuration parsed from the command line.
pub struct Config {
    /// Bind address of the listening socket. (default: 0.0.0.0)
    pub ip_address: Ipv4Addr,
    /// Listening UDP port. (default: 69)
    pub port: u16,
    /// Directory the server reads files from. (default: /srv/tftp)
    pub directory: PathBuf,
    /// How long a sent block waits for its ack before retransmission.
    pub timeout: Duration,
    /// Retransmissions of a block before the transfer is abandoned.
    pub retries: u8,
}

impl Config {
    /// Creates a configuration by walking the supplied arguments. It is
    /// intended for use with [`std::env::args()`].
    pub fn new<T: Iterator<Item = String>>(mut args: T) -> Result<Config> {
        let mut config = Config {
            ip_address: Ipv4Addr::UNSPECIFIED,
            port: DEFAULT_PORT,
            directory: PathBuf::from(DEFAULT_DIRECTORY),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            retries: DEFAULT_RETRIES,
        };

        args.next();

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-i" | "--ip-address" => {
                    let Some(ip_str) = args.next() else {
                        bail!("missing ip address after {arg}");
                    };
                    config.ip_address = ip_str.parse::<Ipv4Addr>()?;
                }
                "-p" | "--port" => {
                    let Some(port_str) = args.next() else {
                        bail!("missing port number after {arg}");
                    };
                    config.port = port_str.parse::<u16>()?;
                }
                "-d" | "--directory" => {
                    let Some(dir_str) = args.next() else {
                        bail!("missing directory after {arg}");
                    };
                    config.directory = PathBuf::from(dir_str);
                }
                "-t" | "--timeout" => {
                    let Some(timeout_str) = args.next() else {
                        bail!("missing timeout after {arg}");
                    };
                    let secs = timeout_str.parse::<u64>()?;
                    if secs == 0 {
                        bail!("timeout must be at least one second");
                    }
                    config.timeout = Duration::from_secs(secs);
                }
                "-r" | "--retries" => {
                    let Some(retries_str) = args.next() else {
                        bail!("missing retry count after {arg}");
                    };
                    config.retries = retries_str.parse::<u8>()?;
                }
                "-h" | "--help" => {
                    println!("rotftpd - read-only TFTP server\n");
                    println!("Usage: rotftpd [OPTIONS]\n");
                    println!("Options:");
                    println!("  -i, --ip-address <IP ADDRESS>\tBind address of the server (default: 0.0.0.0)");
                    println!("  -p, --port <PORT>\t\tListening port of the server (default: {DEFAULT_PORT})");
                    println!("  -d, --directory <DIRECTORY>\tServing directory (default: {DEFAULT_DIRECTORY})");
                    println!("  -t, --timeout <SECONDS>\tSeconds a block waits for its ack (default: {DEFAULT_TIMEOUT_SECS})");
                    println!("  -r, --retries <COUNT>\t\tRetransmissions before a transfer is abandoned (default: {DEFAULT_RETRIES})");
                    println!("  -h, --help\t\t\tPrint help information");
                    process::exit(0);
                }
                invalid => bail!("invalid flag: {invalid}"),
            }
        }

        if !config.directory.is_dir() {
            bail!(
                "serving directory {} is not usable (override it with --directory)",
                config.directory.display()
            );
        }

        Ok(config)
    }
}
