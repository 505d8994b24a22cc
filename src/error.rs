use thiserror::Error;

use crate::protocol::PinMode;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Timeout")]
    Timeout,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    #[error("I2C is not enabled, call i2c_config first")]
    I2cNotEnabled,

    #[error("Invalid I2C address: {0:#04x}")]
    InvalidI2cAddress(u8),

    #[error("Invalid pin: {0}")]
    InvalidPin(u8),

    #[error("Invalid port: {0}")]
    InvalidPort(u8),

    #[error("Pin {pin} does not support mode {mode:?}")]
    UnsupportedMode { pin: u8, mode: PinMode },

    #[error("Value {value} out of range for {what}")]
    InvalidValue { what: &'static str, value: u32 },

    #[error("Board communication is not running")]
    NotRunning,

    #[error("Invalid configuration: {0}")]
    Configuration(String),
}

pub type Result<T> = std::result::Result<T, Error>;
