//! Byte lexer turning an unframed Firmata byte stream into [`Token`]s.
//!
//! The lexer is a state machine. Every state is a function of the input
//! cursor returning either the next state or a finished token. A stanza that
//! is not complete yet is re-lexed from [`State::Initial`] once more bytes
//! arrive, so the only state carried between `decode` calls is whether the
//! lexer is recovering from a framing error.
//!
//! On a framing error the lexer emits [`Token::Error`] and then discards bytes
//! until the next byte with the high bit set (a plausible command start, kept)
//! or a stray `SYSEX_END` (dropped).

use bytes::{Buf, BytesMut};
use log::warn;
use tokio::io::AsyncRead;
use tokio_util::codec::{Decoder, FramedRead};

use super::{byte_name, Command, PinCapabilities, PinMode, SysexCommand, Token, NOT_AVAILABLE};
use crate::error::Error;
use crate::transport::{log_traffic, Direction};

const SYSEX_START: u8 = Command::SysexStart as u8;
const SYSEX_END: u8 = Command::SysexEnd as u8;
const PROTOCOL_VERSION: u8 = Command::ProtocolVersion as u8;

/// Longest sysex frame accepted before it is treated as a framing error.
pub const MAX_SYSEX_LEN: usize = 4096;

/// Token stream read from the board side of a transport.
pub type TokenStream<R> = FramedRead<R, FirmataCodec>;

pub fn token_stream<R: AsyncRead>(reader: R, log_traffic: bool) -> TokenStream<R> {
    FramedRead::new(reader, FirmataCodec::new().with_traffic_log(log_traffic))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Initial,
    AnalogMessage,
    DigitalMessage,
    ProtocolVersion,
    Sysex,
    ReservedCommand,
    ReportFirmware,
    AnalogMappingResponse,
    CapabilityResponse,
    PinStateResponse,
    I2cReply,
    StringData,
    Recover,
}

enum Step {
    Next(State),
    Emit(Token),
}

#[derive(Debug)]
enum LexError {
    Incomplete,
    Framing(String),
}

type Lexed = Result<Step, LexError>;

/// Read position over the buffered bytes with single-byte pushback.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Every read goes through here, so no stanza grows past
    /// [`MAX_SYSEX_LEN`].
    fn next(&mut self) -> Result<u8, LexError> {
        if self.pos >= MAX_SYSEX_LEN {
            return Err(LexError::Framing(format!(
                "sysex frame longer than {} bytes",
                MAX_SYSEX_LEN
            )));
        }
        let byte = *self.buf.get(self.pos).ok_or(LexError::Incomplete)?;
        self.pos += 1;
        Ok(byte)
    }

    fn peek(&mut self) -> Result<u8, LexError> {
        let byte = self.next()?;
        self.backup();
        Ok(byte)
    }

    fn backup(&mut self) {
        self.pos -= 1;
    }

    /// Next 7-bit data byte. A command byte is pushed back and reported.
    fn data(&mut self) -> Result<u8, LexError> {
        let byte = self.next()?;
        if byte & 0x80 != 0 {
            self.backup();
            return Err(LexError::Framing(format!(
                "unexpected {:#04x} ({}) where a data byte was expected",
                byte,
                byte_name(byte)
            )));
        }
        Ok(byte)
    }

    /// Next sysex payload byte, or `None` once `SYSEX_END` is consumed.
    fn data_or_end(&mut self) -> Result<Option<u8>, LexError> {
        if self.peek()? == SYSEX_END {
            self.pos += 1;
            return Ok(None);
        }
        self.data().map(Some)
    }

    fn u14(&mut self) -> Result<u16, LexError> {
        let lsb = self.data()?;
        let msb = self.data()?;
        Ok(u16::from(lsb) | (u16::from(msb) << 7))
    }

    /// Next 14-bit pair of a sysex payload, or `None` at `SYSEX_END`.
    fn u14_or_end(&mut self) -> Result<Option<u16>, LexError> {
        match self.data_or_end()? {
            Some(lsb) => {
                let msb = self.data()?;
                Ok(Some(u16::from(lsb) | (u16::from(msb) << 7)))
            }
            None => Ok(None),
        }
    }
}

/// [`Decoder`] producing one [`Token`] per complete stanza.
#[derive(Debug)]
pub struct FirmataCodec {
    state: State,
    log_traffic: bool,
}

impl Default for FirmataCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FirmataCodec {
    pub fn new() -> Self {
        Self {
            state: State::Initial,
            log_traffic: false,
        }
    }

    pub fn with_traffic_log(mut self, enabled: bool) -> Self {
        self.log_traffic = enabled;
        self
    }

    fn consume(&self, src: &mut BytesMut, count: usize) {
        if self.log_traffic {
            log_traffic(Direction::Received, &src[..count]);
        }
        src.advance(count);
    }

    /// Drops bytes until a plausible command start. Returns false when the
    /// buffer ran out before recovery finished.
    fn recover(&mut self, src: &mut BytesMut) -> bool {
        let mut skipped = 0;
        let mut recovered = false;
        while let Some(&byte) = src.get(skipped) {
            if byte == SYSEX_END {
                skipped += 1;
                recovered = true;
                break;
            }
            if byte & 0x80 != 0 {
                recovered = true;
                break;
            }
            skipped += 1;
        }
        if skipped > 0 {
            warn!("Discarded {} bytes while resynchronizing", skipped);
            self.consume(src, skipped);
        }
        if recovered {
            self.state = State::Initial;
        }
        recovered
    }

    fn lex(&self, state: State, cur: &mut Cursor<'_>) -> Lexed {
        match state {
            State::Initial => lex_initial(cur),
            State::AnalogMessage => lex_analog_message(cur),
            State::DigitalMessage => lex_digital_message(cur),
            State::ProtocolVersion => lex_protocol_version(cur),
            State::Sysex => lex_sysex(cur),
            State::ReservedCommand => lex_reserved_command(cur),
            State::ReportFirmware => lex_report_firmware(cur),
            State::AnalogMappingResponse => lex_analog_mapping_response(cur),
            State::CapabilityResponse => lex_capability_response(cur),
            State::PinStateResponse => lex_pin_state_response(cur),
            State::I2cReply => lex_i2c_reply(cur),
            State::StringData => lex_string_data(cur),
            State::Recover => Err(LexError::Framing("lexer is recovering".into())),
        }
    }
}

impl Decoder for FirmataCodec {
    type Item = Token;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Token>, Error> {
        if self.state == State::Recover && !self.recover(src) {
            return Ok(None);
        }
        if src.is_empty() {
            return Ok(None);
        }

        let mut cur = Cursor::new(src);
        let mut state = State::Initial;
        let outcome = loop {
            match self.lex(state, &mut cur) {
                Ok(Step::Next(next)) => state = next,
                Ok(Step::Emit(token)) => break Ok(token),
                Err(err) => break Err(err),
            }
        };
        let consumed = cur.pos;

        match outcome {
            Ok(token) => {
                self.consume(src, consumed);
                Ok(Some(token))
            }
            Err(LexError::Incomplete) => Ok(None),
            Err(LexError::Framing(message)) => {
                warn!("Framing error: {}", message);
                // Always make progress, even when the very first byte is bad.
                self.consume(src, consumed.max(1));
                self.state = State::Recover;
                Ok(Some(Token::error(message)))
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Token>, Error> {
        if let Some(token) = self.decode(src)? {
            return Ok(Some(token));
        }
        if !src.is_empty() {
            warn!("Discarding {} bytes of an unfinished message", src.len());
            src.clear();
        }
        Ok(None)
    }
}

fn lex_initial(cur: &mut Cursor<'_>) -> Lexed {
    let byte = cur.peek()?;
    match byte {
        0xE0..=0xEF => Ok(Step::Next(State::AnalogMessage)),
        0x90..=0x9F => Ok(Step::Next(State::DigitalMessage)),
        PROTOCOL_VERSION => Ok(Step::Next(State::ProtocolVersion)),
        SYSEX_START => Ok(Step::Next(State::Sysex)),
        other => Err(LexError::Framing(format!(
            "no message starts with {:#04x} ({})",
            other,
            byte_name(other)
        ))),
    }
}

fn lex_analog_message(cur: &mut Cursor<'_>) -> Lexed {
    let command = cur.next()?;
    let value = cur.u14()?;
    Ok(Step::Emit(Token::AnalogMessage {
        pin: command - Command::AnalogMessage.byte(),
        value,
    }))
}

fn lex_digital_message(cur: &mut Cursor<'_>) -> Lexed {
    let command = cur.next()?;
    let mask = cur.u14()?;
    let mut bits = [false; 8];
    for (i, bit) in bits.iter_mut().enumerate() {
        *bit = (mask >> i) & 1 == 1;
    }
    Ok(Step::Emit(Token::DigitalMessage {
        port: command - Command::DigitalMessage.byte(),
        bits,
    }))
}

fn lex_protocol_version(cur: &mut Cursor<'_>) -> Lexed {
    cur.next()?;
    let major = cur.data()?;
    let minor = cur.data()?;
    Ok(Step::Emit(Token::ProtocolVersion { major, minor }))
}

fn lex_sysex(cur: &mut Cursor<'_>) -> Lexed {
    cur.next()?;
    let command = cur.data()?;
    match SysexCommand::try_from(command) {
        Ok(SysexCommand::Reserved) => Ok(Step::Next(State::ReservedCommand)),
        Ok(SysexCommand::ReportFirmware) => Ok(Step::Next(State::ReportFirmware)),
        Ok(SysexCommand::AnalogMappingResponse) => Ok(Step::Next(State::AnalogMappingResponse)),
        Ok(SysexCommand::CapabilityResponse) => Ok(Step::Next(State::CapabilityResponse)),
        Ok(SysexCommand::PinStateResponse) => Ok(Step::Next(State::PinStateResponse)),
        Ok(SysexCommand::I2cReply) => Ok(Step::Next(State::I2cReply)),
        Ok(SysexCommand::StringData) => Ok(Step::Next(State::StringData)),
        Ok(other) => Err(LexError::Framing(format!(
            "unexpected sysex command {} from board",
            other.name()
        ))),
        Err(unknown) => Err(LexError::Framing(format!(
            "unknown sysex command {:#04x}",
            unknown
        ))),
    }
}

fn lex_reserved_command(cur: &mut Cursor<'_>) -> Lexed {
    let mut data = Vec::new();
    while let Some(byte) = cur.data_or_end()? {
        data.push(byte);
    }
    Ok(Step::Emit(Token::ReservedCommand { data }))
}

fn lex_text(cur: &mut Cursor<'_>) -> Result<String, LexError> {
    let mut text = String::new();
    while let Some(code) = cur.u14_or_end()? {
        text.push(char::from_u32(u32::from(code)).unwrap_or(char::REPLACEMENT_CHARACTER));
    }
    Ok(text)
}

fn lex_report_firmware(cur: &mut Cursor<'_>) -> Lexed {
    let major = cur.data()?;
    let minor = cur.data()?;
    let name = lex_text(cur)?;
    Ok(Step::Emit(Token::ReportFirmware { major, minor, name }))
}

fn lex_string_data(cur: &mut Cursor<'_>) -> Lexed {
    let text = lex_text(cur)?;
    Ok(Step::Emit(Token::error(format!("board says: {}", text))))
}

fn lex_analog_mapping_response(cur: &mut Cursor<'_>) -> Lexed {
    let mut channels = Vec::new();
    while let Some(byte) = cur.data_or_end()? {
        channels.push((byte != NOT_AVAILABLE).then_some(byte));
    }
    Ok(Step::Emit(Token::AnalogMappingResponse { channels }))
}

fn lex_capability_response(cur: &mut Cursor<'_>) -> Lexed {
    let mut pins = Vec::new();
    while let Some(first) = cur.data_or_end()? {
        let mut pin = PinCapabilities::new();
        let mut mode = first;
        while mode != NOT_AVAILABLE {
            let resolution = cur.data()?;
            pin.insert(PinMode::from(mode), resolution);
            mode = cur.data()?;
        }
        pins.push(pin);
    }
    Ok(Step::Emit(Token::CapabilityResponse { pins }))
}

fn lex_pin_state_response(cur: &mut Cursor<'_>) -> Lexed {
    let pin = cur.data()?;
    let mode = PinMode::from(cur.data()?);
    let mut data: u32 = 0;
    let mut shift = 0;
    while let Some(byte) = cur.data_or_end()? {
        if shift < u32::BITS {
            data |= u32::from(byte) << shift;
        }
        shift += 7;
    }
    Ok(Step::Emit(Token::PinStateResponse { pin, mode, data }))
}

fn lex_i2c_reply(cur: &mut Cursor<'_>) -> Lexed {
    let addr = cur.u14()?;
    let reg = cur.u14()?;
    let mut data = Vec::new();
    while let Some(value) = cur.u14_or_end()? {
        data.push((value & 0xFF) as u8);
    }
    Ok(Step::Emit(Token::I2cReply { addr, reg, data }))
}
