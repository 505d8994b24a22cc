use bytes::Bytes;
use log::debug;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result};
use crate::transport::{log_traffic, Direction};

#[derive(Debug)]
enum WriterMessage {
    Command(Bytes),
    Flush(oneshot::Sender<()>),
    Shutdown,
}

/// Handle for queueing commands to the writer task.
#[derive(Debug, Clone)]
pub struct CommandSender {
    tx: mpsc::UnboundedSender<WriterMessage>,
}

impl CommandSender {
    /// Queues one command. Never waits for the transport.
    pub fn enqueue(&self, command: impl Into<Bytes>) -> Result<()> {
        self.tx
            .send(WriterMessage::Command(command.into()))
            .map_err(|_| Error::NotRunning)
    }

    /// Resolves once every command queued before this call was written.
    pub async fn flush(&self) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(WriterMessage::Flush(done_tx))
            .map_err(|_| Error::NotRunning)?;
        done_rx.await.map_err(|_| Error::NotRunning)
    }

    /// Asks the writer to stop after the commands already queued.
    pub fn shutdown(&self) {
        let _ = self.tx.send(WriterMessage::Shutdown);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Writes queued commands to the transport, one write per command, in the
/// order they were queued.
pub struct CommandWriter<W> {
    writer: W,
    rx: mpsc::UnboundedReceiver<WriterMessage>,
    log_traffic: bool,
}

impl<W: AsyncWrite + Unpin> CommandWriter<W> {
    pub fn new(writer: W, log_traffic: bool) -> (Self, CommandSender) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                writer,
                rx,
                log_traffic,
            },
            CommandSender { tx },
        )
    }

    /// Runs until the shutdown sentinel arrives or every sender is dropped.
    pub async fn drain(&mut self) -> Result<()> {
        while let Some(message) = self.rx.recv().await {
            match message {
                WriterMessage::Command(command) => {
                    if self.log_traffic {
                        log_traffic(Direction::Sent, &command);
                    }
                    self.writer.write_all(&command).await?;
                    self.writer.flush().await?;
                }
                WriterMessage::Flush(done) => {
                    let _ = done.send(());
                }
                WriterMessage::Shutdown => break,
            }
        }
        debug!("Command writer stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_commands_are_written_in_order() {
        let (mut writer, sender) = CommandWriter::new(Vec::new(), false);
        sender.enqueue(vec![0xF9]).unwrap();
        sender.enqueue(vec![0xF0, 0x6B, 0xF7]).unwrap();
        sender.enqueue(vec![0x91, 0x00, 0x00]).unwrap();
        sender.shutdown();

        writer.drain().await.unwrap();
        assert_eq!(
            writer.writer,
            vec![0xF9, 0xF0, 0x6B, 0xF7, 0x91, 0x00, 0x00]
        );
    }

    #[tokio::test]
    async fn test_commands_after_shutdown_are_dropped() {
        let (mut writer, sender) = CommandWriter::new(Vec::new(), false);
        sender.enqueue(vec![0xFF]).unwrap();
        sender.shutdown();
        sender.enqueue(vec![0xF9]).unwrap();

        writer.drain().await.unwrap();
        assert_eq!(writer.writer, vec![0xFF]);
    }

    #[tokio::test]
    async fn test_flush_waits_for_earlier_commands() {
        let (mut writer, sender) = CommandWriter::new(Vec::new(), false);
        let task = tokio::spawn(async move {
            writer.drain().await.unwrap();
            writer.writer
        });

        sender.enqueue(vec![0xF0, 0x79, 0xF7]).unwrap();
        sender.flush().await.unwrap();
        sender.shutdown();
        assert_eq!(task.await.unwrap(), vec![0xF0, 0x79, 0xF7]);
        assert!(matches!(sender.flush().await, Err(Error::NotRunning)));
    }
}
