//! Opening transports and logging the bytes that cross them.
//!
//! The engine accepts any `AsyncRead + AsyncWrite` stream. These helpers cover
//! the two common cases: a USB serial link and a network-attached board.

use std::net::SocketAddr;
use std::time::Duration;

use log::{info, trace};
use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use tokio::net::TcpStream;
use tokio_serial::{SerialPortBuilderExt, SerialStream};

use crate::board::BoardConfig;
use crate::error::{Error, Result};
use crate::protocol::byte_name;

/// Target of the byte-level traffic log.
pub const TRAFFIC_TARGET: &str = "firmata::traffic";

const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const TCP_KEEPALIVE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Sent,
    Received,
}

impl Direction {
    fn arrow(self) -> &'static str {
        match self {
            Self::Sent => ">>",
            Self::Received => "<<",
        }
    }
}

/// Logs every byte of `bytes` on the traffic target.
pub fn log_traffic(direction: Direction, bytes: &[u8]) {
    if !log::log_enabled!(target: TRAFFIC_TARGET, log::Level::Trace) {
        return;
    }
    for &byte in bytes {
        trace!(
            target: TRAFFIC_TARGET,
            "{} {:#04x} ({})",
            direction.arrow(),
            byte,
            byte_name(byte)
        );
    }
}

/// Opens the serial port named in the configuration.
pub fn open_serial(config: &BoardConfig) -> Result<SerialStream> {
    config.validate_serial()?;
    let port = tokio_serial::new(&config.port, config.baud_rate).open_native_async()?;
    info!("Opened serial port {} at {} baud", config.port, config.baud_rate);
    Ok(port)
}

/// Connects to a board exposing Firmata over TCP.
pub async fn connect_tcp(addr: SocketAddr) -> Result<TcpStream> {
    let std_stream = tokio::task::spawn_blocking(move || -> Result<std::net::TcpStream> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.connect_timeout(&addr.into(), TCP_CONNECT_TIMEOUT)?;
        socket.set_nonblocking(true)?;
        Ok(socket.into())
    })
    .await
    .map_err(|e| Error::Io(std::io::Error::other(e)))??;

    let stream = TcpStream::from_std(std_stream)?;
    stream.set_nodelay(true)?;
    SockRef::from(&stream).set_tcp_keepalive(&TcpKeepalive::new().with_time(TCP_KEEPALIVE))?;
    info!("Connected to {}", addr);
    Ok(stream)
}
