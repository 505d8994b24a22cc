use std::sync::Mutex;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::protocol::command;
use crate::protocol::lexer::{token_stream, TokenStream};
use crate::protocol::{PinCapabilities, PinMode, Token, TokenKind, MAX_U14};

mod config;
mod dispatch;
mod i2c;
mod state;
mod writer;

pub use config::*;
pub use dispatch::{Dispatcher, Listener, ListenerAction, ListenerRegistry};
pub use i2c::{I2cReply, I2C_REPLY_QUEUE, MAX_I2C_ADDRESS};
pub use state::{AnalogChannelMap, BoardIdentity, BoardState, PinState, PINS_PER_PORT};
pub use writer::{CommandSender, CommandWriter};

use dispatch::{lock, read, SharedListeners, SharedState};
use i2c::I2c;

/// Ports a `DIGITAL_MESSAGE` can address.
const MAX_PORTS: usize = 16;

/// Channels a `REPORT_ANALOG` can address.
const MAX_ANALOG_CHANNELS: u8 = 16;

struct Tasks {
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
}

/// A Firmata board behind an asynchronous byte stream.
///
/// [`Board::start`] spawns three tasks: a reader lexing the transport into
/// tokens, a writer draining queued commands to the transport, and a
/// dispatcher applying tokens to the board state. Pin numbers in this API
/// are physical pin indices.
pub struct Board {
    config: BoardConfig,
    state: SharedState,
    listeners: SharedListeners,
    commands: CommandSender,
    i2c: I2c,
    /// Output levels last written to each digital port.
    output_ports: Mutex<[u8; MAX_PORTS]>,
    reader_stop: CancellationToken,
    session: CancellationToken,
    tasks: Mutex<Option<Tasks>>,
}

impl Board {
    /// Starts communicating over `transport` without waiting for the board.
    /// Must be called from within a tokio runtime.
    pub fn start<T>(transport: T, config: BoardConfig) -> Result<Self>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        config.validate()?;

        let (read_half, write_half) = tokio::io::split(transport);
        let state = SharedState::default();
        let listeners = SharedListeners::default();
        let reader_stop = CancellationToken::new();
        let session = CancellationToken::new();

        let (mut writer, commands) = CommandWriter::new(write_half, config.log_traffic);
        let (token_tx, token_rx) = mpsc::channel(config.token_buffer);

        let reader = tokio::spawn(read_tokens(
            token_stream(read_half, config.log_traffic),
            token_tx,
            reader_stop.clone(),
            commands.clone(),
        ));

        let writer_stop = reader_stop.clone();
        let writer = tokio::spawn(async move {
            if let Err(e) = writer.drain().await {
                error!("Transport write failed: {}", e);
                writer_stop.cancel();
            }
        });

        let dispatcher = tokio::spawn(
            Dispatcher::new(state.clone(), listeners.clone()).run(token_rx, session.clone()),
        );

        info!("Board communication started");
        Ok(Self {
            config,
            state,
            listeners,
            commands,
            i2c: I2c::new(),
            output_ports: Mutex::new([0; MAX_PORTS]),
            reader_stop,
            session,
            tasks: Mutex::new(Some(Tasks {
                reader,
                writer,
                dispatcher,
            })),
        })
    }

    /// Starts communicating and runs the [`Board::initialize`] handshake.
    pub async fn open<T>(transport: T, config: BoardConfig) -> Result<Self>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let board = Self::start(transport, config)?;
        if let Err(e) = board.initialize().await {
            board.stop().await?;
            return Err(e);
        }
        Ok(board)
    }

    /// Waits for the firmware report, then learns the pin layout.
    pub async fn initialize(&self) -> Result<()> {
        info!("Waiting for firmware report");
        let identity = self
            .request_identity(self.config.handshake_timeout)
            .await?;
        info!(
            "Connected to {} version {}",
            identity.firmware_name, identity.firmware_version
        );

        if let Some(millis) = self.config.sampling_interval {
            self.set_sampling_interval(millis)?;
        }
        let pins = self.query_capabilities().await?;
        let channels = self.query_analog_mapping().await?;
        info!(
            "Board has {} pins, {} analog channels",
            pins.len(),
            channels.iter().flatten().count()
        );
        Ok(())
    }

    /// Stops the reader, lets the writer finish what is queued, stops the
    /// dispatcher and waits for all three tasks.
    pub async fn stop(&self) -> Result<()> {
        let Some(tasks) = lock(&self.tasks).take() else {
            return Ok(());
        };
        info!("Stopping board communication");
        self.reader_stop.cancel();
        self.commands.shutdown();
        self.session.cancel();

        let (reader, writer, dispatcher) =
            tokio::join!(tasks.reader, tasks.writer, tasks.dispatcher);
        for result in [reader, writer, dispatcher] {
            result.map_err(|e| Error::Io(std::io::Error::other(e)))?;
        }
        info!("Board communication stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        !self.commands.is_closed() && !self.session.is_cancelled()
    }

    pub fn config(&self) -> &BoardConfig {
        &self.config
    }

    /// Registers `listener` for the next token of `kind`. It runs on the
    /// dispatch task before the board state is updated.
    pub fn add_listener<F>(&self, kind: TokenKind, listener: F)
    where
        F: FnMut(&Token) -> ListenerAction + Send + 'static,
    {
        lock(&self.listeners).add(kind, Box::new(listener));
    }

    fn listen(&self, kind: TokenKind) -> oneshot::Receiver<Token> {
        let (tx, rx) = oneshot::channel();
        let mut tx = Some(tx);
        self.add_listener(kind, move |token: &Token| {
            if let Some(tx) = tx.take() {
                let _ = tx.send(token.clone());
            }
            ListenerAction::once()
        });
        rx
    }

    async fn receive<T>(rx: oneshot::Receiver<T>, timeout: Duration) -> Result<T> {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(Error::NotRunning),
            Err(_) => Err(Error::Timeout),
        }
    }

    /// Waits for the next token of `kind`. The board state already reflects
    /// the token when this returns.
    pub async fn wait_for(&self, kind: TokenKind, timeout: Duration) -> Result<Token> {
        if !self.is_running() {
            return Err(Error::NotRunning);
        }
        Self::receive(self.listen(kind), timeout).await
    }

    async fn request(
        &self,
        kind: TokenKind,
        request: bytes::Bytes,
        timeout: Duration,
    ) -> Result<Token> {
        let reply = self.listen(kind);
        self.commands.enqueue(request)?;
        Self::receive(reply, timeout).await
    }

    /// Resolves once every command sent so far was written to the transport.
    pub async fn flush(&self) -> Result<()> {
        self.commands.flush().await
    }

    fn send(&self, command: bytes::Bytes) -> Result<()> {
        debug!("Sending {:02x?}", &command[..]);
        self.commands.enqueue(command)
    }

    // Queries

    pub async fn query_capabilities(&self) -> Result<Vec<PinCapabilities>> {
        let reply = self
            .request(
                TokenKind::CapabilityResponse,
                command::capability_query(),
                self.config.query_timeout,
            )
            .await?;
        match reply {
            Token::CapabilityResponse { pins } => Ok(pins),
            other => Err(unexpected(other)),
        }
    }

    /// Returns the analog channel of every physical pin.
    pub async fn query_analog_mapping(&self) -> Result<Vec<Option<u8>>> {
        let reply = self
            .request(
                TokenKind::AnalogMappingResponse,
                command::analog_mapping_query(),
                self.config.query_timeout,
            )
            .await?;
        match reply {
            Token::AnalogMappingResponse { channels } => Ok(channels),
            other => Err(unexpected(other)),
        }
    }

    async fn request_identity(&self, timeout: Duration) -> Result<BoardIdentity> {
        self.request(TokenKind::ReportFirmware, command::firmware_query(), timeout)
            .await?;
        Ok(read(&self.state).identity.clone())
    }

    pub async fn query_firmware(&self) -> Result<BoardIdentity> {
        self.request_identity(self.config.query_timeout).await
    }

    pub async fn query_protocol_version(&self) -> Result<String> {
        self.request(
            TokenKind::ProtocolVersion,
            command::protocol_version_query(),
            self.config.query_timeout,
        )
        .await?;
        Ok(read(&self.state).identity.protocol_version.clone())
    }

    pub async fn query_pin_state(&self, pin: u8) -> Result<PinState> {
        self.check_pin(pin)?;
        let (tx, rx) = oneshot::channel();
        let mut tx = Some(tx);
        self.add_listener(TokenKind::PinStateResponse, move |token: &Token| {
            let Some(waiting) = tx.as_ref() else {
                return ListenerAction::once();
            };
            if waiting.is_closed() {
                return ListenerAction::once();
            }
            match token {
                Token::PinStateResponse {
                    pin: reported,
                    mode,
                    data,
                } if *reported == pin => {
                    if let Some(tx) = tx.take() {
                        let _ = tx.send(PinState {
                            mode: *mode,
                            value: *data,
                        });
                    }
                    ListenerAction::once()
                }
                // Another pin's state; keep waiting for ours.
                _ => ListenerAction::keep(),
            }
        });
        self.send(command::pin_state_query(pin))?;
        Self::receive(rx, self.config.query_timeout).await
    }

    // Pin I/O

    fn check_pin(&self, pin: u8) -> Result<()> {
        if usize::from(pin) >= read(&self.state).pin_count() {
            return Err(Error::InvalidPin(pin));
        }
        Ok(())
    }

    fn check_mode(&self, pin: u8, mode: PinMode) -> Result<()> {
        let state = read(&self.state);
        match state.capabilities(pin) {
            None => Err(Error::InvalidPin(pin)),
            Some(caps) if !caps.supports(mode) => Err(Error::UnsupportedMode { pin, mode }),
            Some(_) => Ok(()),
        }
    }

    /// Sets the mode of `pin`, then asks the board for the pin's state so the
    /// board state picks up the new mode.
    pub fn pin_mode(&self, pin: u8, mode: PinMode) -> Result<()> {
        self.check_mode(pin, mode)?;
        self.send(command::set_pin_mode(pin, mode))?;
        self.send(command::pin_state_query(pin))
    }

    /// Drives `pin` low (0) or high (1). The pin must support output. The
    /// whole port is written, using the levels previously written to the
    /// other pins of the port.
    pub fn digital_write(&self, pin: u8, value: u8) -> Result<()> {
        if value > 1 {
            return Err(Error::InvalidValue {
                what: "digital value",
                value: u32::from(value),
            });
        }
        self.check_mode(pin, PinMode::Output)?;
        let port = pin / PINS_PER_PORT;
        if usize::from(port) >= MAX_PORTS {
            return Err(Error::InvalidPin(pin));
        }
        let bit = 1 << (pin % PINS_PER_PORT);
        let mask = {
            let mut ports = lock(&self.output_ports);
            let levels = &mut ports[usize::from(port)];
            if value == 1 {
                *levels |= bit;
            } else {
                *levels &= !bit;
            }
            *levels
        };
        self.send(command::digital_port(port, mask))
    }

    /// Last reported digital level of `pin`.
    pub fn digital_read(&self, pin: u8) -> Result<u8> {
        let state = read(&self.state);
        let pin_state = state.pin(pin).ok_or(Error::InvalidPin(pin))?;
        Ok(u8::from(pin_state.value != 0))
    }

    /// Writes a PWM duty cycle (0..=255) to `pin`.
    pub fn analog_write(&self, pin: u8, value: u16) -> Result<()> {
        if value > 0xFF {
            return Err(Error::InvalidValue {
                what: "PWM duty cycle",
                value: u32::from(value),
            });
        }
        self.check_mode(pin, PinMode::Pwm)?;
        self.send(command::analog_write(pin, value))
    }

    /// Last reported analog value of physical `pin`.
    pub fn analog_read(&self, pin: u8) -> Result<u16> {
        let state = read(&self.state);
        let pin_state = state.pin(pin).ok_or(Error::InvalidPin(pin))?;
        Ok(pin_state.value.min(u32::from(MAX_U14)) as u16)
    }

    fn analog_channel(&self, pin: u8) -> Result<u8> {
        read(&self.state)
            .analog_channels
            .channel(pin)
            .filter(|&channel| channel < MAX_ANALOG_CHANNELS)
            .ok_or(Error::InvalidPin(pin))
    }

    pub fn enable_analog_reporting(&self, pin: u8) -> Result<()> {
        let channel = self.analog_channel(pin)?;
        self.send(command::report_analog(channel, true))
    }

    pub fn disable_analog_reporting(&self, pin: u8) -> Result<()> {
        let channel = self.analog_channel(pin)?;
        self.send(command::report_analog(channel, false))
    }

    fn check_port(&self, port: u8) -> Result<()> {
        let first = usize::from(port) * usize::from(PINS_PER_PORT);
        if usize::from(port) >= MAX_PORTS || first >= read(&self.state).pin_count() {
            return Err(Error::InvalidPort(port));
        }
        Ok(())
    }

    pub fn enable_digital_reporting(&self, port: u8) -> Result<()> {
        self.check_port(port)?;
        self.send(command::report_digital(port, true))
    }

    pub fn disable_digital_reporting(&self, port: u8) -> Result<()> {
        self.check_port(port)?;
        self.send(command::report_digital(port, false))
    }

    pub fn set_sampling_interval(&self, millis: u16) -> Result<()> {
        if millis > MAX_U14 {
            return Err(Error::InvalidValue {
                what: "sampling interval",
                value: u32::from(millis),
            });
        }
        self.send(command::sampling_interval(millis))
    }

    pub fn system_reset(&self) -> Result<()> {
        *lock(&self.output_ports) = [0; MAX_PORTS];
        self.send(command::system_reset())
    }

    // I2C

    pub fn i2c_config(&self, delay_micros: u16) -> Result<()> {
        self.i2c
            .configure(&self.commands, &self.listeners, delay_micros)
    }

    pub fn i2c_write(&self, addr: u8, reg: Option<u8>, data: &[u8]) -> Result<()> {
        self.i2c.write(&self.commands, addr, reg, data)
    }

    pub async fn i2c_read(
        &self,
        addr: u8,
        reg: Option<u8>,
        count: u16,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        self.i2c
            .read(&self.commands, addr, reg, count, timeout)
            .await
    }

    pub fn i2c_read_continuously(&self, addr: u8, reg: Option<u8>, count: u16) -> Result<()> {
        self.i2c
            .read_continuously(&self.commands, addr, reg, count)
    }

    pub fn i2c_stop_reading(&self, addr: u8) -> Result<()> {
        self.i2c.stop_reading(&self.commands, addr)
    }

    pub async fn i2c_next_reply(&self, timeout: Duration) -> Result<I2cReply> {
        self.i2c.next_reply(timeout).await
    }

    // Snapshots

    pub fn state(&self) -> BoardState {
        read(&self.state).clone()
    }

    pub fn firmware_name(&self) -> String {
        read(&self.state).identity.firmware_name.clone()
    }

    pub fn firmware_version(&self) -> String {
        read(&self.state).identity.firmware_version.clone()
    }

    pub fn protocol_version(&self) -> String {
        read(&self.state).identity.protocol_version.clone()
    }

    pub fn pin_count(&self) -> usize {
        read(&self.state).pin_count()
    }

    pub fn pin_capabilities(&self, pin: u8) -> Option<PinCapabilities> {
        read(&self.state).capabilities(pin).cloned()
    }

    /// Physical pin behind analog channel `channel`.
    pub fn analog_pin(&self, channel: u8) -> Option<u8> {
        read(&self.state).analog_channels.pin(channel)
    }

    pub fn errors(&self) -> Vec<String> {
        read(&self.state).errors.iter().cloned().collect()
    }
}

impl Drop for Board {
    fn drop(&mut self) {
        if lock(&self.tasks).is_some() {
            debug!("Board dropped without stop, cancelling tasks");
            self.reader_stop.cancel();
            self.commands.shutdown();
            self.session.cancel();
        }
    }
}

fn unexpected(token: Token) -> Error {
    Error::Protocol(format!("unexpected reply {:?}", token.kind()))
}

async fn read_tokens<R>(
    mut tokens: TokenStream<R>,
    tx: mpsc::Sender<Token>,
    stop: CancellationToken,
    commands: CommandSender,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let next = tokio::select! {
            _ = stop.cancelled() => {
                debug!("Reader stopped");
                return;
            }
            next = tokens.next() => next,
        };
        let token = match next {
            Some(Ok(token)) => token,
            Some(Err(e)) => {
                error!("Transport read failed: {}", e);
                break;
            }
            None => {
                warn!("Transport closed");
                break;
            }
        };
        tokio::select! {
            _ = stop.cancelled() => {
                debug!("Reader stopped");
                return;
            }
            sent = tx.send(token) => {
                if sent.is_err() {
                    debug!("Dispatcher gone, reader exiting");
                    break;
                }
            }
        }
    }
    // The link is gone, so the writer has nothing left to do either.
    commands.shutdown();
}
