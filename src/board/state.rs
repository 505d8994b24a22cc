//! In-memory projection of the board's state.
//!
//! Only the dispatcher mutates a [`BoardState`]; everyone else reads it
//! through the shared lock.

use std::collections::{BTreeMap, VecDeque};

use crate::protocol::{PinCapabilities, PinMode};

pub const UNKNOWN: &str = "Unknown";

/// Oldest entries are dropped once the error log holds this many.
pub const ERROR_LOG_CAPACITY: usize = 256;

/// Pins addressed together by one digital message.
pub const PINS_PER_PORT: u8 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinState {
    pub mode: PinMode,
    pub value: u32,
}

impl Default for PinState {
    fn default() -> Self {
        Self {
            mode: PinMode::Output,
            value: 0,
        }
    }
}

/// Analog channel (A0, A1, ...) to physical pin mapping and its inverse.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnalogChannelMap {
    channel_to_pin: BTreeMap<u8, u8>,
    pin_to_channel: BTreeMap<u8, u8>,
}

impl AnalogChannelMap {
    /// Builds the map from a mapping response indexed by physical pin.
    /// A channel claimed by more than one pin keeps its lowest pin.
    pub fn from_response(channels: &[Option<u8>]) -> Self {
        let mut map = Self::default();
        for (pin, channel) in channels.iter().enumerate() {
            let (Some(channel), Ok(pin)) = (*channel, u8::try_from(pin)) else {
                continue;
            };
            if map.channel_to_pin.contains_key(&channel) {
                continue;
            }
            map.channel_to_pin.insert(channel, pin);
            map.pin_to_channel.insert(pin, channel);
        }
        map
    }

    pub fn pin(&self, channel: u8) -> Option<u8> {
        self.channel_to_pin.get(&channel).copied()
    }

    pub fn channel(&self, pin: u8) -> Option<u8> {
        self.pin_to_channel.get(&pin).copied()
    }

    pub fn len(&self) -> usize {
        self.channel_to_pin.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channel_to_pin.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardIdentity {
    pub firmware_name: String,
    pub firmware_version: String,
    pub protocol_version: String,
}

impl Default for BoardIdentity {
    fn default() -> Self {
        Self {
            firmware_name: UNKNOWN.into(),
            firmware_version: UNKNOWN.into(),
            protocol_version: UNKNOWN.into(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BoardState {
    pub capabilities: Vec<PinCapabilities>,
    pub pins: Vec<PinState>,
    pub analog_channels: AnalogChannelMap,
    pub identity: BoardIdentity,
    pub errors: VecDeque<String>,
}

impl BoardState {
    pub fn pin(&self, pin: u8) -> Option<&PinState> {
        self.pins.get(usize::from(pin))
    }

    pub(crate) fn pin_mut(&mut self, pin: u8) -> Option<&mut PinState> {
        self.pins.get_mut(usize::from(pin))
    }

    pub fn capabilities(&self, pin: u8) -> Option<&PinCapabilities> {
        self.capabilities.get(usize::from(pin))
    }

    pub fn pin_count(&self) -> usize {
        self.pins.len()
    }

    pub(crate) fn push_error(&mut self, message: impl Into<String>) {
        if self.errors.len() == ERROR_LOG_CAPACITY {
            self.errors.pop_front();
        }
        self.errors.push_back(message.into());
    }

    pub(crate) fn set_capabilities(&mut self, pins: Vec<PinCapabilities>) {
        self.pins.resize(pins.len(), PinState::default());
        self.capabilities = pins;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_map_is_bidirectional() {
        let map = AnalogChannelMap::from_response(&[None, None, Some(0), Some(1), None]);
        assert_eq!(map.pin(0), Some(2));
        assert_eq!(map.pin(1), Some(3));
        assert_eq!(map.channel(3), Some(1));
        assert_eq!(map.channel(0), None);
        assert_eq!(map.pin(2), None);
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_channel_map_keeps_first_claim() {
        let map = AnalogChannelMap::from_response(&[Some(0), Some(0)]);
        assert_eq!(map.pin(0), Some(0));
        assert_eq!(map.channel(1), None);
    }

    #[test]
    fn test_defaults() {
        let state = BoardState::default();
        assert_eq!(state.identity.firmware_name, "Unknown");
        assert_eq!(state.pin_count(), 0);
        assert_eq!(PinState::default().mode, PinMode::Output);
    }

    #[test]
    fn test_error_log_is_bounded() {
        let mut state = BoardState::default();
        for i in 0..ERROR_LOG_CAPACITY + 5 {
            state.push_error(format!("error {}", i));
        }
        assert_eq!(state.errors.len(), ERROR_LOG_CAPACITY);
        assert_eq!(state.errors.front().map(String::as_str), Some("error 5"));
    }

    #[test]
    fn test_capabilities_resize_pins() {
        let mut state = BoardState::default();
        state.set_capabilities(vec![PinCapabilities::new(); 20]);
        assert_eq!(state.pin_count(), 20);
        state.set_capabilities(vec![PinCapabilities::new(); 4]);
        assert_eq!(state.pin_count(), 4);
    }
}
