//! Firmata wire protocol: byte constants, tokens, the lexer and outgoing frames.

pub mod command;
pub mod lexer;
mod types;
mod utils;

pub use self::lexer::FirmataCodec;
pub use self::types::{PinCapabilities, Token, TokenKind};
pub use self::utils::{decode_sequence, encode_sequence, encode_u14};

use std::fmt;

/// Largest value carried by a two-byte (LSB, MSB) pair.
pub const MAX_U14: u16 = 0x3FFF;

/// Terminator of a pin entry in a capability response and the
/// "unmapped" marker in an analog mapping response.
pub const NOT_AVAILABLE: u8 = 0x7F;

/// Top-level command bytes.
///
/// Commands that carry a pin, channel or port in their low nibble are
/// represented by their base value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    DigitalMessage = 0x90,
    ReportAnalog = 0xC0,
    ReportDigital = 0xD0,
    AnalogMessage = 0xE0,
    SysexStart = 0xF0,
    SetPinMode = 0xF4,
    SysexEnd = 0xF7,
    ProtocolVersion = 0xF9,
    SystemReset = 0xFF,
}

impl Command {
    pub fn byte(self) -> u8 {
        self as u8
    }

    /// Command byte with a pin, channel or port packed into the low nibble.
    pub fn with_nibble(self, nibble: u8) -> u8 {
        self.byte() | (nibble & 0x0F)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::DigitalMessage => "DIGITAL_MESSAGE",
            Self::ReportAnalog => "REPORT_ANALOG",
            Self::ReportDigital => "REPORT_DIGITAL",
            Self::AnalogMessage => "ANALOG_MESSAGE",
            Self::SysexStart => "SYSEX_START",
            Self::SetPinMode => "SET_PIN_MODE",
            Self::SysexEnd => "SYSEX_END",
            Self::ProtocolVersion => "PROTOCOL_VERSION",
            Self::SystemReset => "SYSTEM_RESET",
        }
    }
}

impl TryFrom<u8> for Command {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x90..=0x9F => Ok(Self::DigitalMessage),
            0xC0..=0xCF => Ok(Self::ReportAnalog),
            0xD0..=0xDF => Ok(Self::ReportDigital),
            0xE0..=0xEF => Ok(Self::AnalogMessage),
            0xF0 => Ok(Self::SysexStart),
            0xF4 => Ok(Self::SetPinMode),
            0xF7 => Ok(Self::SysexEnd),
            0xF9 => Ok(Self::ProtocolVersion),
            0xFF => Ok(Self::SystemReset),
            other => Err(other),
        }
    }
}

/// Sub-command byte following `SYSEX_START`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SysexCommand {
    Reserved = 0x00,
    AnalogMappingQuery = 0x69,
    AnalogMappingResponse = 0x6A,
    CapabilityQuery = 0x6B,
    CapabilityResponse = 0x6C,
    PinStateQuery = 0x6D,
    PinStateResponse = 0x6E,
    ExtendedAnalog = 0x6F,
    StringData = 0x71,
    I2cRequest = 0x76,
    I2cReply = 0x77,
    I2cConfig = 0x78,
    ReportFirmware = 0x79,
    SamplingInterval = 0x7A,
}

impl SysexCommand {
    pub fn byte(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Reserved => "RESERVED_COMMAND",
            Self::AnalogMappingQuery => "ANALOG_MAPPING_QUERY",
            Self::AnalogMappingResponse => "ANALOG_MAPPING_RESPONSE",
            Self::CapabilityQuery => "CAPABILITY_QUERY",
            Self::CapabilityResponse => "CAPABILITY_RESPONSE",
            Self::PinStateQuery => "PIN_STATE_QUERY",
            Self::PinStateResponse => "PIN_STATE_RESPONSE",
            Self::ExtendedAnalog => "EXTENDED_ANALOG",
            Self::StringData => "STRING_DATA",
            Self::I2cRequest => "I2C_REQUEST",
            Self::I2cReply => "I2C_REPLY",
            Self::I2cConfig => "I2C_CONFIG",
            Self::ReportFirmware => "REPORT_FIRMWARE",
            Self::SamplingInterval => "SAMPLING_INTERVAL",
        }
    }
}

impl TryFrom<u8> for SysexCommand {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Self::Reserved),
            0x69 => Ok(Self::AnalogMappingQuery),
            0x6A => Ok(Self::AnalogMappingResponse),
            0x6B => Ok(Self::CapabilityQuery),
            0x6C => Ok(Self::CapabilityResponse),
            0x6D => Ok(Self::PinStateQuery),
            0x6E => Ok(Self::PinStateResponse),
            0x6F => Ok(Self::ExtendedAnalog),
            0x71 => Ok(Self::StringData),
            0x76 => Ok(Self::I2cRequest),
            0x77 => Ok(Self::I2cReply),
            0x78 => Ok(Self::I2cConfig),
            0x79 => Ok(Self::ReportFirmware),
            0x7A => Ok(Self::SamplingInterval),
            other => Err(other),
        }
    }
}

/// Diagnostic name of a byte seen on the wire, used by the traffic log.
pub fn byte_name(byte: u8) -> &'static str {
    Command::try_from(byte).map(Command::name).unwrap_or("DATA")
}

/// Pin mode as reported in capability and pin state responses.
///
/// Modes this crate does not drive itself are preserved as `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PinMode {
    Input,
    Output,
    Analog,
    Pwm,
    Servo,
    Shift,
    I2c,
    Other(u8),
}

impl PinMode {
    pub fn byte(self) -> u8 {
        match self {
            Self::Input => 0,
            Self::Output => 1,
            Self::Analog => 2,
            Self::Pwm => 3,
            Self::Servo => 4,
            Self::Shift => 5,
            Self::I2c => 6,
            Self::Other(mode) => mode,
        }
    }
}

impl From<u8> for PinMode {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Input,
            1 => Self::Output,
            2 => Self::Analog,
            3 => Self::Pwm,
            4 => Self::Servo,
            5 => Self::Shift,
            6 => Self::I2c,
            other => Self::Other(other),
        }
    }
}

impl fmt::Display for PinMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Other(mode) => write!(f, "MODE_{:#04x}", mode),
            mode => write!(f, "{:?}", mode),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_lookup_covers_nibble_ranges() {
        assert_eq!(Command::try_from(0x91), Ok(Command::DigitalMessage));
        assert_eq!(Command::try_from(0xEF), Ok(Command::AnalogMessage));
        assert_eq!(Command::try_from(0xC3), Ok(Command::ReportAnalog));
        assert_eq!(Command::try_from(0xF9), Ok(Command::ProtocolVersion));
        assert_eq!(Command::try_from(0xA0), Err(0xA0));
        assert_eq!(Command::DigitalMessage.with_nibble(1), 0x91);
    }

    #[test]
    fn test_sysex_lookup() {
        assert_eq!(SysexCommand::try_from(0x79), Ok(SysexCommand::ReportFirmware));
        assert_eq!(SysexCommand::I2cReply.name(), "I2C_REPLY");
        assert!(SysexCommand::try_from(0x55).is_err());
    }

    #[test]
    fn test_byte_names() {
        assert_eq!(byte_name(0xF0), "SYSEX_START");
        assert_eq!(byte_name(0x05), "DATA");
    }

    #[test]
    fn test_pin_mode_roundtrip_keeps_unknown_modes() {
        assert_eq!(PinMode::from(3), PinMode::Pwm);
        assert_eq!(PinMode::from(0x0B), PinMode::Other(0x0B));
        assert_eq!(PinMode::Other(0x0B).byte(), 0x0B);
        assert_eq!(PinMode::I2c.byte(), 6);
    }
}
