//! Applies tokens to the board state and routes them to listeners.

use std::collections::HashMap;
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::{debug, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::state::{AnalogChannelMap, BoardState, PINS_PER_PORT};
use crate::protocol::{PinMode, Token, TokenKind};

/// What a listener wants done after it saw a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ListenerAction {
    /// Stay registered for the next token of the same kind.
    pub keep: bool,
    /// Skip the dispatcher's own handling of this token.
    pub suppress_default: bool,
}

impl ListenerAction {
    pub fn once() -> Self {
        Self::default()
    }

    pub fn keep() -> Self {
        Self {
            keep: true,
            suppress_default: false,
        }
    }

    pub fn suppress_default(mut self) -> Self {
        self.suppress_default = true;
        self
    }
}

/// Runs on the dispatch task with the board state locked, so it must only
/// signal (e.g. through a channel) and never block.
pub type Listener = Box<dyn FnMut(&Token) -> ListenerAction + Send>;

#[derive(Default)]
pub struct ListenerRegistry {
    listeners: HashMap<TokenKind, Vec<Listener>>,
}

impl ListenerRegistry {
    pub fn add(&mut self, kind: TokenKind, listener: Listener) {
        self.listeners.entry(kind).or_default().push(listener);
    }

    pub fn count(&self, kind: TokenKind) -> usize {
        self.listeners.get(&kind).map_or(0, Vec::len)
    }

    /// Drops every listener, waking hosts that wait on one.
    pub fn clear(&mut self) {
        self.listeners.clear();
    }

    fn take(&mut self, kind: TokenKind) -> Vec<Listener> {
        self.listeners.remove(&kind).unwrap_or_default()
    }

    /// Puts kept listeners back ahead of any registered while they ran.
    fn restore(&mut self, kind: TokenKind, kept: Vec<Listener>) {
        let entry = self.listeners.entry(kind).or_default();
        let added = mem::replace(entry, kept);
        entry.extend(added);
    }
}

pub type SharedState = Arc<RwLock<BoardState>>;
pub type SharedListeners = Arc<Mutex<ListenerRegistry>>;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

pub struct Dispatcher {
    state: SharedState,
    listeners: SharedListeners,
}

impl Dispatcher {
    pub fn new(state: SharedState, listeners: SharedListeners) -> Self {
        Self { state, listeners }
    }

    /// Hands `token` to its listeners and then, unless one of them suppressed
    /// it, applies it to the board state.
    ///
    /// Listeners and the state update run under the state write lock, so a
    /// caller woken by a listener reads the state after the update. Returns
    /// false when the token could not be applied.
    pub fn dispatch(&self, token: &Token) -> bool {
        let kind = token.kind();
        let pending = lock(&self.listeners).take(kind);
        let mut state = write(&self.state);

        let mut suppressed = false;
        let mut kept = Vec::new();
        for mut listener in pending {
            let action = listener(token);
            suppressed |= action.suppress_default;
            if action.keep {
                kept.push(listener);
            }
        }
        if !kept.is_empty() {
            lock(&self.listeners).restore(kind, kept);
        }

        if suppressed {
            return true;
        }
        apply(&mut state, token)
    }

    /// Dispatches tokens in arrival order until the token channel closes or
    /// the session is cancelled, then drops all listeners. Tokens that cannot
    /// be applied are logged and do not end the session.
    pub async fn run(self, mut tokens: mpsc::Receiver<Token>, session: CancellationToken) {
        loop {
            let token = tokio::select! {
                _ = session.cancelled() => break,
                token = tokens.recv() => match token {
                    Some(token) => token,
                    None => break,
                },
            };
            if !self.dispatch(&token) {
                warn!("Could not apply {:?} to the board state", token.kind());
            }
        }
        // Pending requests see their reply channel close instead of timing out.
        lock(&self.listeners).clear();
        debug!("Dispatcher stopped");
    }
}

fn apply(state: &mut BoardState, token: &Token) -> bool {
    match token {
        Token::ProtocolVersion { major, minor } => {
            state.identity.protocol_version = format!("{}.{}", major, minor);
            true
        }
        Token::ReportFirmware { major, minor, name } => {
            state.identity.firmware_name = name.clone();
            state.identity.firmware_version = format!("{}.{}", major, minor);
            true
        }
        Token::CapabilityResponse { pins } => {
            debug!("Board reports {} pins", pins.len());
            state.set_capabilities(pins.clone());
            true
        }
        Token::AnalogMappingResponse { channels } => {
            state.analog_channels = AnalogChannelMap::from_response(channels);
            debug!("Board maps {} analog channels", state.analog_channels.len());
            true
        }
        Token::AnalogMessage { pin: channel, value } => {
            let pin = state.analog_channels.pin(*channel);
            if let Some(pin_state) = pin.and_then(|pin| state.pin_mut(pin)) {
                pin_state.value = u32::from(*value);
                return true;
            }
            state.push_error(format!("analog message for unmapped channel {}", channel));
            false
        }
        Token::DigitalMessage { port, bits } => {
            let first = usize::from(*port) * usize::from(PINS_PER_PORT);
            if first >= state.pin_count() {
                state.push_error(format!("digital message for unknown port {}", port));
                return false;
            }
            for (offset, &bit) in bits.iter().enumerate() {
                let Some(pin_state) = state.pins.get_mut(first + offset) else {
                    break;
                };
                if pin_state.mode != PinMode::Analog {
                    pin_state.value = u32::from(bit);
                }
            }
            true
        }
        Token::PinStateResponse { pin, mode, data } => {
            if let Some(pin_state) = state.pin_mut(*pin) {
                pin_state.mode = *mode;
                pin_state.value = *data;
                return true;
            }
            state.push_error(format!("pin state for unknown pin {}", pin));
            false
        }
        Token::I2cReply { addr, .. } => {
            debug!("Unclaimed I2C reply from {:#04x}", addr);
            true
        }
        Token::ReservedCommand { data } => {
            state.push_error(format!("reserved command: {:02x?}", data));
            true
        }
        Token::Error { message } => {
            state.push_error(message.clone());
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PinCapabilities;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn dispatcher() -> (Dispatcher, SharedState, SharedListeners) {
        let state = SharedState::default();
        let listeners = SharedListeners::default();
        (
            Dispatcher::new(state.clone(), listeners.clone()),
            state,
            listeners,
        )
    }

    fn counting_listener(counter: &Arc<AtomicUsize>, action: ListenerAction) -> Listener {
        let counter = counter.clone();
        Box::new(move |_: &Token| {
            counter.fetch_add(1, Ordering::SeqCst);
            action
        })
    }

    fn board_with_pins(dispatcher: &Dispatcher, count: usize) {
        assert!(dispatcher.dispatch(&Token::CapabilityResponse {
            pins: vec![PinCapabilities::new(); count],
        }));
    }

    #[test]
    fn test_once_listener_is_removed_after_one_dispatch() {
        let (dispatcher, _, listeners) = dispatcher();
        let counter = Arc::new(AtomicUsize::new(0));
        lock(&listeners).add(
            TokenKind::ProtocolVersion,
            counting_listener(&counter, ListenerAction::once()),
        );

        let token = Token::ProtocolVersion { major: 2, minor: 5 };
        dispatcher.dispatch(&token);
        assert_eq!(lock(&listeners).count(TokenKind::ProtocolVersion), 0);
        dispatcher.dispatch(&token);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_kept_listener_stays_registered() {
        let (dispatcher, _, listeners) = dispatcher();
        let counter = Arc::new(AtomicUsize::new(0));
        lock(&listeners).add(
            TokenKind::ProtocolVersion,
            counting_listener(&counter, ListenerAction::keep()),
        );

        let token = Token::ProtocolVersion { major: 2, minor: 5 };
        dispatcher.dispatch(&token);
        dispatcher.dispatch(&token);
        assert_eq!(lock(&listeners).count(TokenKind::ProtocolVersion), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_listeners_only_see_their_kind() {
        let (dispatcher, _, listeners) = dispatcher();
        let counter = Arc::new(AtomicUsize::new(0));
        lock(&listeners).add(
            TokenKind::I2cReply,
            counting_listener(&counter, ListenerAction::once()),
        );
        dispatcher.dispatch(&Token::ProtocolVersion { major: 2, minor: 5 });
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(lock(&listeners).count(TokenKind::I2cReply), 1);
    }

    #[test]
    fn test_listener_can_register_another_listener() {
        let (dispatcher, _, listeners) = dispatcher();
        let registry = listeners.clone();
        let order = Arc::new(Mutex::new(Vec::new()));
        let seen = order.clone();
        lock(&listeners).add(
            TokenKind::Error,
            Box::new(move |_: &Token| {
                lock(&seen).push("first");
                let seen = seen.clone();
                lock(&registry).add(
                    TokenKind::Error,
                    Box::new(move |_: &Token| {
                        lock(&seen).push("added");
                        ListenerAction::once()
                    }),
                );
                ListenerAction::keep()
            }),
        );

        dispatcher.dispatch(&Token::error("a"));
        assert_eq!(lock(&listeners).count(TokenKind::Error), 2);
        dispatcher.dispatch(&Token::error("b"));
        assert_eq!(*lock(&order), vec!["first", "first", "added"]);
    }

    #[test]
    fn test_suppressed_token_skips_default_handling() {
        let (dispatcher, state, listeners) = dispatcher();
        lock(&listeners).add(
            TokenKind::ProtocolVersion,
            Box::new(|_: &Token| ListenerAction::once().suppress_default()),
        );
        assert!(dispatcher.dispatch(&Token::ProtocolVersion { major: 2, minor: 5 }));
        assert_eq!(read(&state).identity.protocol_version, "Unknown");

        dispatcher.dispatch(&Token::ProtocolVersion { major: 2, minor: 5 });
        assert_eq!(read(&state).identity.protocol_version, "2.5");
    }

    #[test]
    fn test_firmware_identity() {
        let (dispatcher, state, _) = dispatcher();
        dispatcher.dispatch(&Token::ReportFirmware {
            major: 2,
            minor: 5,
            name: "StandardFirmata.ino".into(),
        });
        let state = read(&state);
        assert_eq!(state.identity.firmware_name, "StandardFirmata.ino");
        assert_eq!(state.identity.firmware_version, "2.5");
    }

    #[test]
    fn test_analog_message_updates_mapped_physical_pin() {
        let (dispatcher, state, _) = dispatcher();
        board_with_pins(&dispatcher, 20);
        let mut channels = vec![None; 20];
        channels[14] = Some(0);
        channels[15] = Some(1);
        dispatcher.dispatch(&Token::AnalogMappingResponse { channels });

        assert!(dispatcher.dispatch(&Token::AnalogMessage { pin: 0, value: 0x23 }));
        let state = read(&state);
        assert_eq!(state.pin(14).map(|p| p.value), Some(0x23));
        assert_eq!(state.pin(0).map(|p| p.value), Some(0));
    }

    #[test]
    fn test_analog_message_for_unmapped_channel_is_not_fatal() {
        let (dispatcher, state, _) = dispatcher();
        board_with_pins(&dispatcher, 4);
        assert!(!dispatcher.dispatch(&Token::AnalogMessage { pin: 3, value: 1 }));
        assert_eq!(read(&state).errors.len(), 1);
    }

    #[test]
    fn test_new_mapping_replaces_old_one() {
        let (dispatcher, state, _) = dispatcher();
        board_with_pins(&dispatcher, 4);
        dispatcher.dispatch(&Token::AnalogMappingResponse {
            channels: vec![None, Some(0), None, None],
        });
        dispatcher.dispatch(&Token::AnalogMappingResponse {
            channels: vec![None, None, None, Some(0)],
        });
        let state = read(&state);
        assert_eq!(state.analog_channels.pin(0), Some(3));
        assert_eq!(state.analog_channels.channel(1), None);
    }

    #[test]
    fn test_digital_message_updates_its_port() {
        let (dispatcher, state, _) = dispatcher();
        board_with_pins(&dispatcher, 16);
        dispatcher.dispatch(&Token::PinStateResponse {
            pin: 9,
            mode: PinMode::Analog,
            data: 500,
        });
        let mut bits = [false; 8];
        bits[0] = true;
        bits[1] = true;
        assert!(dispatcher.dispatch(&Token::DigitalMessage { port: 1, bits }));

        let state = read(&state);
        assert_eq!(state.pin(8).map(|p| p.value), Some(1));
        assert_eq!(state.pin(9).map(|p| p.value), Some(500));
        assert_eq!(state.pin(0).map(|p| p.value), Some(0));
    }

    #[test]
    fn test_digital_message_for_unknown_port() {
        let (dispatcher, _, _) = dispatcher();
        board_with_pins(&dispatcher, 8);
        assert!(!dispatcher.dispatch(&Token::DigitalMessage {
            port: 3,
            bits: [true; 8]
        }));
    }

    #[test]
    fn test_pin_state_response() {
        let (dispatcher, state, _) = dispatcher();
        board_with_pins(&dispatcher, 4);
        assert!(dispatcher.dispatch(&Token::PinStateResponse {
            pin: 2,
            mode: PinMode::Pwm,
            data: 128,
        }));
        assert!(!dispatcher.dispatch(&Token::PinStateResponse {
            pin: 40,
            mode: PinMode::Pwm,
            data: 128,
        }));
        let state = read(&state);
        assert_eq!(state.pin(2).map(|p| (p.mode, p.value)), Some((PinMode::Pwm, 128)));
    }

    #[test]
    fn test_errors_are_logged() {
        let (dispatcher, state, _) = dispatcher();
        dispatcher.dispatch(&Token::error("bad frame"));
        dispatcher.dispatch(&Token::ReservedCommand { data: vec![1, 2] });
        let state = read(&state);
        assert_eq!(state.errors.len(), 2);
        assert_eq!(state.errors[0], "bad frame");
    }

    #[tokio::test]
    async fn test_run_stops_when_channel_closes() {
        let (dispatcher, state, _) = dispatcher();
        let (tx, rx) = mpsc::channel(4);
        let task = tokio::spawn(dispatcher.run(rx, CancellationToken::new()));
        tx.send(Token::ProtocolVersion { major: 2, minor: 6 }).await.unwrap();
        tx.send(Token::AnalogMessage { pin: 0, value: 1 }).await.unwrap();
        tx.send(Token::ProtocolVersion { major: 2, minor: 7 }).await.unwrap();
        drop(tx);
        task.await.unwrap();
        assert_eq!(read(&state).identity.protocol_version, "2.7");
    }

    #[tokio::test]
    async fn test_run_drops_listeners_on_exit() {
        let (dispatcher, _, listeners) = dispatcher();
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel::<Token>();
        let mut reply_tx = Some(reply_tx);
        lock(&listeners).add(
            TokenKind::CapabilityResponse,
            Box::new(move |token: &Token| {
                if let Some(tx) = reply_tx.take() {
                    let _ = tx.send(token.clone());
                }
                ListenerAction::once()
            }),
        );

        let session = CancellationToken::new();
        let (_tx, rx) = mpsc::channel(4);
        let task = tokio::spawn(dispatcher.run(rx, session.clone()));
        session.cancel();
        task.await.unwrap();

        assert_eq!(lock(&listeners).count(TokenKind::CapabilityResponse), 0);
        assert!(reply_rx.await.is_err());
    }
}
