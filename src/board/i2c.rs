//! I2C client on top of the dispatcher's listener mechanism.
//!
//! Replies arrive asynchronously on the dispatch task. A persistent listener
//! installed by [`I2c::configure`] forwards them into a queue of
//! [`I2C_REPLY_QUEUE`] replies that reads wait on. While the queue is full,
//! new replies are dropped with a warning, so a continuous read nobody
//! consumes cannot grow memory.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;

use super::dispatch::{lock, ListenerAction, SharedListeners};
use super::writer::CommandSender;
use crate::error::{Error, Result};
use crate::protocol::command::{self, I2cMode};
use crate::protocol::{Token, TokenKind, MAX_U14};

/// Highest 7-bit I2C address.
pub const MAX_I2C_ADDRESS: u8 = 0x7F;

/// Replies held until a read or [`I2c::next_reply`] picks them up.
pub const I2C_REPLY_QUEUE: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct I2cReply {
    pub addr: u16,
    pub reg: u16,
    pub data: Vec<u8>,
}

pub struct I2c {
    enabled: AtomicBool,
    tx: mpsc::Sender<I2cReply>,
    replies: Mutex<mpsc::Receiver<I2cReply>>,
}

impl Default for I2c {
    fn default() -> Self {
        Self::new()
    }
}

impl I2c {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(I2C_REPLY_QUEUE);
        Self {
            enabled: AtomicBool::new(false),
            tx,
            replies: Mutex::new(rx),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Sends the I2C config frame. The reply listener is installed on the
    /// first call only.
    pub fn configure(
        &self,
        commands: &CommandSender,
        listeners: &SharedListeners,
        delay_micros: u16,
    ) -> Result<()> {
        if delay_micros > MAX_U14 {
            return Err(Error::InvalidValue {
                what: "I2C delay",
                value: u32::from(delay_micros),
            });
        }
        commands.enqueue(command::i2c_config(delay_micros))?;

        if !self.enabled.swap(true, Ordering::AcqRel) {
            let tx = self.tx.clone();
            lock(listeners).add(
                TokenKind::I2cReply,
                Box::new(move |token: &Token| {
                    if let Token::I2cReply { addr, reg, data } = token {
                        let reply = I2cReply {
                            addr: *addr,
                            reg: *reg,
                            data: data.clone(),
                        };
                        if let Err(mpsc::error::TrySendError::Full(reply)) = tx.try_send(reply) {
                            warn!(
                                "I2C reply queue full, dropping reply from {:#04x}",
                                reply.addr
                            );
                        }
                    }
                    ListenerAction::keep().suppress_default()
                }),
            );
            debug!("I2C enabled with {}us read delay", delay_micros);
        }
        Ok(())
    }

    fn check(&self, addr: u8) -> Result<()> {
        if !self.is_enabled() {
            return Err(Error::I2cNotEnabled);
        }
        if addr > MAX_I2C_ADDRESS {
            return Err(Error::InvalidI2cAddress(addr));
        }
        Ok(())
    }

    pub fn write(
        &self,
        commands: &CommandSender,
        addr: u8,
        reg: Option<u8>,
        data: &[u8],
    ) -> Result<()> {
        self.check(addr)?;
        let payload: Vec<u16> = data.iter().map(|&byte| u16::from(byte)).collect();
        commands.enqueue(command::i2c_request(addr, I2cMode::Write, reg, &payload))
    }

    /// Requests `count` bytes and waits up to `timeout` for the reply from
    /// `addr` (and `reg`, when given). Replies already queued, including
    /// those of continuous reads, are discarded first, as are replies from
    /// other devices or registers while waiting.
    pub async fn read(
        &self,
        commands: &CommandSender,
        addr: u8,
        reg: Option<u8>,
        count: u16,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        self.check(addr)?;
        if count > MAX_U14 {
            return Err(Error::InvalidValue {
                what: "I2C read length",
                value: u32::from(count),
            });
        }

        let mut replies = self.replies.lock().await;
        while let Ok(stale) = replies.try_recv() {
            debug!("Dropping stale I2C reply from {:#04x}", stale.addr);
        }
        commands.enqueue(command::i2c_request(addr, I2cMode::ReadOnce, reg, &[count]))?;

        let deadline = Instant::now() + timeout;
        loop {
            let reply = tokio::time::timeout_at(deadline, replies.recv())
                .await
                .map_err(|_| Error::Timeout)?
                .ok_or(Error::NotRunning)?;
            let reg_matches = reg.map_or(true, |reg| reply.reg == u16::from(reg));
            if reply.addr == u16::from(addr) && reg_matches {
                return Ok(reply.data);
            }
            warn!(
                "Discarding I2C reply from {:#04x} register {:#04x} while waiting for {:#04x}",
                reply.addr, reply.reg, addr
            );
        }
    }

    /// Asks the board to keep reading `count` bytes from `addr` every
    /// sampling interval. Replies are picked up with [`I2c::next_reply`].
    pub fn read_continuously(
        &self,
        commands: &CommandSender,
        addr: u8,
        reg: Option<u8>,
        count: u16,
    ) -> Result<()> {
        self.check(addr)?;
        commands.enqueue(command::i2c_request(
            addr,
            I2cMode::ReadContinuously,
            reg,
            &[count.min(MAX_U14)],
        ))
    }

    pub fn stop_reading(&self, commands: &CommandSender, addr: u8) -> Result<()> {
        self.check(addr)?;
        commands.enqueue(command::i2c_request(addr, I2cMode::StopReading, None, &[]))
    }

    pub async fn next_reply(&self, timeout: Duration) -> Result<I2cReply> {
        if !self.is_enabled() {
            return Err(Error::I2cNotEnabled);
        }
        let mut replies = self.replies.lock().await;
        tokio::time::timeout(timeout, replies.recv())
            .await
            .map_err(|_| Error::Timeout)?
            .ok_or(Error::NotRunning)
    }
}
