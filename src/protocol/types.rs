use std::collections::BTreeMap;

use super::PinMode;

/// Supported modes of one physical pin and the resolution (in bits) of each.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PinCapabilities {
    modes: BTreeMap<PinMode, u8>,
}

impl PinCapabilities {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, mode: PinMode, resolution: u8) {
        self.modes.insert(mode, resolution);
    }

    pub fn supports(&self, mode: PinMode) -> bool {
        self.modes.contains_key(&mode)
    }

    pub fn resolution(&self, mode: PinMode) -> Option<u8> {
        self.modes.get(&mode).copied()
    }

    pub fn modes(&self) -> impl Iterator<Item = (PinMode, u8)> + '_ {
        self.modes.iter().map(|(&mode, &resolution)| (mode, resolution))
    }

    pub fn is_empty(&self) -> bool {
        self.modes.is_empty()
    }
}

impl FromIterator<(PinMode, u8)> for PinCapabilities {
    fn from_iter<I: IntoIterator<Item = (PinMode, u8)>>(iter: I) -> Self {
        Self {
            modes: iter.into_iter().collect(),
        }
    }
}

/// A fully parsed message received from the board.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    ProtocolVersion {
        major: u8,
        minor: u8,
    },
    ReportFirmware {
        major: u8,
        minor: u8,
        name: String,
    },
    /// Indexed by physical pin; `None` marks a pin without an analog channel.
    AnalogMappingResponse {
        channels: Vec<Option<u8>>,
    },
    CapabilityResponse {
        pins: Vec<PinCapabilities>,
    },
    PinStateResponse {
        pin: u8,
        mode: PinMode,
        data: u32,
    },
    /// `pin` is the analog channel, not the physical pin.
    AnalogMessage {
        pin: u8,
        value: u16,
    },
    DigitalMessage {
        port: u8,
        bits: [bool; 8],
    },
    I2cReply {
        addr: u16,
        reg: u16,
        data: Vec<u8>,
    },
    ReservedCommand {
        data: Vec<u8>,
    },
    Error {
        message: String,
    },
}

/// Tag of a [`Token`] variant, used to key listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    ProtocolVersion,
    ReportFirmware,
    AnalogMappingResponse,
    CapabilityResponse,
    PinStateResponse,
    AnalogMessage,
    DigitalMessage,
    I2cReply,
    ReservedCommand,
    Error,
}

impl Token {
    pub fn kind(&self) -> TokenKind {
        match self {
            Self::ProtocolVersion { .. } => TokenKind::ProtocolVersion,
            Self::ReportFirmware { .. } => TokenKind::ReportFirmware,
            Self::AnalogMappingResponse { .. } => TokenKind::AnalogMappingResponse,
            Self::CapabilityResponse { .. } => TokenKind::CapabilityResponse,
            Self::PinStateResponse { .. } => TokenKind::PinStateResponse,
            Self::AnalogMessage { .. } => TokenKind::AnalogMessage,
            Self::DigitalMessage { .. } => TokenKind::DigitalMessage,
            Self::I2cReply { .. } => TokenKind::I2cReply,
            Self::ReservedCommand { .. } => TokenKind::ReservedCommand,
            Self::Error { .. } => TokenKind::Error,
        }
    }

    pub(crate) fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}
