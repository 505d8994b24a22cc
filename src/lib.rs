//! Firmata Client Library
//!
//! This library controls and queries a microcontroller running Firmata
//! firmware over a serial link or a TCP connection.
//!
//! # Features
//! - Digital and analog I/O, PWM and pin mode control
//! - Capability, analog mapping, firmware and pin state queries
//! - I2C reads and writes correlated with the board's replies
//! - Listeners for any message the board sends
//!
//! # Engine
//! - Lexer: turns the byte stream into typed [`Token`]s
//! - Dispatcher: applies tokens to the [`BoardState`] and notifies listeners
//! - Command writer: sends queued commands in order
//!
//! # Examples
//!
//! ## Blink over USB serial
//! ```no_run
//! use std::time::Duration;
//! use firmata::{BoardConfig, PinMode};
//!
//! #[tokio::main]
//! async fn main() -> firmata::Result<()> {
//!     let config = BoardConfig::new()
//!         .with_port("/dev/ttyACM0")
//!         .with_baud_rate(57600);
//!
//!     let board = firmata::connect_serial(config).await?;
//!     println!("{} {}", board.firmware_name(), board.firmware_version());
//!
//!     board.pin_mode(13, PinMode::Output)?;
//!     for level in [1, 0, 1, 0] {
//!         board.digital_write(13, level)?;
//!         tokio::time::sleep(Duration::from_millis(500)).await;
//!     }
//!     board.stop().await
//! }
//! ```
//!
//! ## Reading an I2C sensor over the network
//! ```no_run
//! use std::time::Duration;
//! use firmata::BoardConfig;
//!
//! #[tokio::main]
//! async fn main() -> firmata::Result<()> {
//!     let addr = "192.168.1.100:3030".parse().unwrap();
//!     let board = firmata::connect_network(addr, BoardConfig::new()).await?;
//!
//!     board.i2c_config(0)?;
//!     let data = board.i2c_read(0x4F, Some(0x00), 2, Duration::from_secs(1)).await?;
//!     println!("temperature raw: {:02x?}", data);
//!     board.stop().await
//! }
//! ```

mod board;
mod error;
pub mod protocol;
mod transport;

pub use board::{
    AnalogChannelMap, Board, BoardConfig, BoardIdentity, BoardState, CommandSender,
    CommandWriter, Dispatcher, I2cReply, Listener, ListenerAction, ListenerRegistry, PinState,
    DEFAULT_BAUD_RATE, DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_QUERY_TIMEOUT, DEFAULT_TOKEN_BUFFER,
    I2C_REPLY_QUEUE, MAX_I2C_ADDRESS, PINS_PER_PORT,
};
pub use error::{Error, Result};
pub use protocol::{
    decode_sequence, encode_sequence, PinCapabilities, PinMode, Token, TokenKind,
};
pub use transport::{connect_tcp, log_traffic, open_serial, Direction, TRAFFIC_TARGET};

use std::net::SocketAddr;

/// Opens the configured serial port and initializes the board on it.
pub async fn connect_serial(config: BoardConfig) -> Result<Board> {
    let port = open_serial(&config)?;
    Board::open(port, config).await
}

/// Connects to a network-attached board and initializes it.
pub async fn connect_network(addr: SocketAddr, config: BoardConfig) -> Result<Board> {
    let stream = connect_tcp(addr).await?;
    Board::open(stream, config).await
}
