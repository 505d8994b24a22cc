use std::time::Duration;

use crate::error::{Error, Result};
use crate::protocol::MAX_U14;

pub const DEFAULT_BAUD_RATE: u32 = 57600;
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_TOKEN_BUFFER: usize = 256;

#[derive(Debug, Clone)]
pub struct BoardConfig {
    pub port: String,
    pub baud_rate: u32,
    /// How long to wait for the firmware report after the link opens.
    /// Boards that reset on connect take a few seconds to answer.
    pub handshake_timeout: Duration,
    /// How long capability and analog mapping queries wait for a reply.
    pub query_timeout: Duration,
    pub token_buffer: usize,
    pub log_traffic: bool,
    /// Sampling interval in milliseconds sent during initialization.
    pub sampling_interval: Option<u16>,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            token_buffer: DEFAULT_TOKEN_BUFFER,
            log_traffic: false,
            sampling_interval: None,
        }
    }
}

impl BoardConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_port(mut self, port: impl Into<String>) -> Self {
        self.port = port.into();
        self
    }

    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    pub fn with_token_buffer(mut self, size: usize) -> Self {
        self.token_buffer = size;
        self
    }

    pub fn with_traffic_log(mut self, enabled: bool) -> Self {
        self.log_traffic = enabled;
        self
    }

    pub fn with_sampling_interval(mut self, millis: u16) -> Self {
        self.sampling_interval = Some(millis);
        self
    }

    /// Checks the settings the engine itself depends on. The port is only
    /// required by [`crate::open_serial`].
    pub fn validate(&self) -> Result<()> {
        if self.token_buffer == 0 {
            return Err(Error::Configuration("token buffer must not be empty".into()));
        }
        if self.query_timeout.is_zero() || self.handshake_timeout.is_zero() {
            return Err(Error::Configuration("timeouts must be non-zero".into()));
        }
        if self.sampling_interval.is_some_and(|ms| ms > MAX_U14) {
            return Err(Error::Configuration(format!(
                "sampling interval must not exceed {} ms",
                MAX_U14
            )));
        }
        Ok(())
    }

    pub(crate) fn validate_serial(&self) -> Result<()> {
        self.validate()?;
        if self.port.is_empty() {
            return Err(Error::Configuration("serial port must be specified".into()));
        }
        if self.baud_rate == 0 {
            return Err(Error::Configuration("baud rate must be non-zero".into()));
        }
        Ok(())
    }
}
