//! Message-level transport for an established association

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use dicom_ul::association::AsyncClientAssociation;
use dicom_ul::pdu::Pdu;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::association::Association;
use crate::command::DimseMessage;
use crate::types::CommandField;
use crate::wire::{self, MessageAssembler};
use crate::{DimseError, Result};

/// Buffered events between the reader task and the association worker
const EVENT_BUFFER: usize = 32;

/// Something the peer did on the association
#[derive(Debug)]
pub enum Incoming {
    Message(DimseMessage),
    /// A-RELEASE-RQ; the peer waits for our reply
    ReleaseRequested,
    /// A-RELEASE-RP answering our own release request
    ReleaseReplied,
    Aborted,
}

/// Exchange of DIMSE messages over one association
#[async_trait]
pub trait DimseChannel: Send {
    /// Wait for the next event from the peer
    async fn receive(&mut self) -> Result<Incoming>;

    async fn send(&mut self, message: DimseMessage) -> Result<()>;

    /// Whether a C-CANCEL-RQ for `message_id` has already arrived.
    ///
    /// Never waits. A matching cancel is consumed; every other event stays
    /// queued for `receive` in arrival order.
    fn cancel_requested(&mut self, message_id: u16) -> bool;

    /// Answer a peer's release request
    async fn acknowledge_release(&mut self) -> Result<()>;

    /// Ask the peer to release and wait for its reply
    async fn request_release(&mut self) -> Result<()>;

    async fn abort(&mut self) -> Result<()>;

    /// Drop the connection; later calls do nothing
    async fn close(&mut self);
}

/// [`DimseChannel`] over a TCP connection
pub struct TcpChannel {
    writer: OwnedWriteHalf,
    events: mpsc::Receiver<Result<Incoming>>,
    backlog: VecDeque<Result<Incoming>>,
    reader: JoinHandle<()>,
    peer_max_pdu_length: u32,
    acse_timeout: Duration,
    closed: bool,
}

impl TcpChannel {
    pub fn new(stream: TcpStream, association: &Association) -> Self {
        let (read_half, writer) = stream.into_split();
        let (tx, events) = mpsc::channel(EVENT_BUFFER);
        let reader = tokio::spawn(read_events(read_half, association.max_pdu_length(), tx));
        Self {
            writer,
            events,
            backlog: VecDeque::new(),
            reader,
            peer_max_pdu_length: association.peer_max_pdu_length(),
            acse_timeout: association.acse_timeout(),
            closed: false,
        }
    }

    async fn write(&mut self, pdu: &Pdu) -> Result<()> {
        if self.closed {
            return Err(DimseError::protocol("Association already closed"));
        }
        wire::write_pdu(&mut self.writer, pdu).await
    }

    async fn await_release_reply(&mut self) -> Result<()> {
        loop {
            match self.receive().await? {
                Incoming::ReleaseReplied => return Ok(()),
                Incoming::Aborted => return Err(DimseError::Aborted),
                Incoming::ReleaseRequested => {
                    // Release collision: answer and treat as released
                    self.write(&Pdu::ReleaseRP).await?;
                    return Ok(());
                }
                Incoming::Message(message) => {
                    warn!("Discarding {} received while releasing", message.command_field());
                }
            }
        }
    }

    fn drain_arrived(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.backlog.push_back(event);
        }
    }
}

impl Drop for TcpChannel {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[async_trait]
impl DimseChannel for TcpChannel {
    async fn receive(&mut self) -> Result<Incoming> {
        if let Some(event) = self.backlog.pop_front() {
            return event;
        }
        match self.events.recv().await {
            Some(event) => event,
            None => Err(DimseError::Network(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed by peer",
            ))),
        }
    }

    async fn send(&mut self, message: DimseMessage) -> Result<()> {
        trace!(
            command = %message.command_field(),
            context = message.presentation_context_id,
            "Sending DIMSE message"
        );
        for pdu in wire::fragment_message(&message, self.peer_max_pdu_length)? {
            self.write(&pdu).await?;
        }
        Ok(())
    }

    fn cancel_requested(&mut self, message_id: u16) -> bool {
        self.drain_arrived();
        take_cancel(&mut self.backlog, message_id)
    }

    async fn acknowledge_release(&mut self) -> Result<()> {
        self.write(&Pdu::ReleaseRP).await
    }

    async fn request_release(&mut self) -> Result<()> {
        self.write(&Pdu::ReleaseRQ).await?;
        tokio::time::timeout(self.acse_timeout, self.await_release_reply())
            .await
            .map_err(|_| DimseError::Timeout("no A-RELEASE-RP from peer".to_string()))?
    }

    async fn abort(&mut self) -> Result<()> {
        self.write(&wire::abort()).await
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.reader.abort();
        if let Err(e) = self.writer.shutdown().await {
            debug!("Error shutting down connection: {}", e);
        }
    }
}

/// [`DimseChannel`] over an association this node requested.
///
/// Dropping the channel while the association is still up sends A-ABORT, so a
/// caller abandoning an operation midway never leaves the peer waiting.
pub struct ClientChannel {
    association: Option<AsyncClientAssociation<TcpStream>>,
    assembler: MessageAssembler,
    backlog: VecDeque<DimseMessage>,
    acse_timeout: Duration,
}

impl ClientChannel {
    pub fn new(association: AsyncClientAssociation<TcpStream>, acse_timeout: Duration) -> Self {
        Self {
            association: Some(association),
            assembler: MessageAssembler::default(),
            backlog: VecDeque::new(),
            acse_timeout,
        }
    }

    /// Whether the association has not been released, aborted or closed yet
    pub fn is_open(&self) -> bool {
        self.association.is_some()
    }

    fn open(&mut self) -> Result<&mut AsyncClientAssociation<TcpStream>> {
        self.association
            .as_mut()
            .ok_or_else(|| DimseError::protocol("Association already closed"))
    }
}

impl Drop for ClientChannel {
    fn drop(&mut self) {
        let Some(association) = self.association.take() else {
            return;
        };
        debug!("Association dropped while open, sending A-ABORT");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = association.abort().await {
                        debug!("A-ABORT on dropped association failed: {}", e);
                    }
                });
            }
            Err(_) => warn!("No runtime to abort a dropped association; closing the socket only"),
        }
    }
}

#[async_trait]
impl DimseChannel for ClientChannel {
    async fn receive(&mut self) -> Result<Incoming> {
        loop {
            if let Some(message) = self.backlog.pop_front() {
                return Ok(Incoming::Message(message));
            }
            let pdu = self.open()?.receive().await?;
            match pdu {
                Pdu::PData { data } => {
                    for pdv in data {
                        if let Some(message) = self.assembler.push(pdv)? {
                            self.backlog.push_back(message);
                        }
                    }
                }
                Pdu::ReleaseRQ => return Ok(Incoming::ReleaseRequested),
                Pdu::ReleaseRP => return Ok(Incoming::ReleaseReplied),
                Pdu::AbortRQ { source } => {
                    debug!("A-ABORT received from {:?}", source);
                    self.association = None;
                    return Ok(Incoming::Aborted);
                }
                other => {
                    return Err(DimseError::protocol(format!(
                        "Unexpected PDU on established association: {}",
                        other.short_description()
                    )))
                }
            }
        }
    }

    async fn send(&mut self, message: DimseMessage) -> Result<()> {
        trace!(
            command = %message.command_field(),
            context = message.presentation_context_id,
            "Sending DIMSE message"
        );
        let association = self.open()?;
        for pdu in wire::fragment_message(&message, association.acceptor_max_pdu_length())? {
            association.send(&pdu).await?;
        }
        Ok(())
    }

    /// Requestors are never sent C-CANCEL-RQ
    fn cancel_requested(&mut self, _message_id: u16) -> bool {
        false
    }

    async fn acknowledge_release(&mut self) -> Result<()> {
        self.open()?.send(&Pdu::ReleaseRP).await?;
        Ok(())
    }

    async fn request_release(&mut self) -> Result<()> {
        let association = self
            .association
            .take()
            .ok_or_else(|| DimseError::protocol("Association already closed"))?;
        tokio::time::timeout(self.acse_timeout, association.release())
            .await
            .map_err(|_| DimseError::Timeout("no A-RELEASE-RP from peer".to_string()))??;
        Ok(())
    }

    async fn abort(&mut self) -> Result<()> {
        match self.association.take() {
            Some(association) => Ok(association.abort().await?),
            None => Ok(()),
        }
    }

    async fn close(&mut self) {
        if let Some(mut association) = self.association.take() {
            if let Err(e) = association.inner_stream().shutdown().await {
                debug!("Error shutting down connection: {}", e);
            }
        }
    }
}

/// Remove a C-CANCEL-RQ aimed at `message_id` from already-arrived events
pub(crate) fn take_cancel(backlog: &mut VecDeque<Result<Incoming>>, message_id: u16) -> bool {
    let position = backlog.iter().position(|event| match event {
        Ok(Incoming::Message(message)) => {
            message.command.command_field == CommandField::CCancelRq
                && message.command.message_id_being_responded_to == Some(message_id)
        }
        _ => false,
    });
    match position {
        Some(index) => {
            backlog.remove(index);
            true
        }
        None => false,
    }
}

/// Reader task: turns PDUs into events until the association ends
async fn read_events(mut reader: OwnedReadHalf, max_pdu_length: u32, tx: mpsc::Sender<Result<Incoming>>) {
    let mut assembler = MessageAssembler::default();
    loop {
        let pdu = match wire::read_pdu(&mut reader, max_pdu_length).await {
            Ok(pdu) => pdu,
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                return;
            }
        };

        let event = match pdu {
            Pdu::PData { data } => {
                for pdv in data {
                    match assembler.push(pdv) {
                        Ok(Some(message)) => {
                            if tx.send(Ok(Incoming::Message(message))).await.is_err() {
                                return;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            let _ = tx.send(Err(e)).await;
                            return;
                        }
                    }
                }
                continue;
            }
            Pdu::ReleaseRQ => Ok(Incoming::ReleaseRequested),
            Pdu::ReleaseRP => Ok(Incoming::ReleaseReplied),
            Pdu::AbortRQ { source } => {
                debug!("A-ABORT received from {:?}", source);
                Ok(Incoming::Aborted)
            }
            other => Err(DimseError::protocol(format!(
                "Unexpected PDU on established association: {}",
                other.short_description()
            ))),
        };

        let last = !matches!(event, Ok(Incoming::Message(_)));
        if tx.send(event).await.is_err() || last {
            return;
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandSet;

    fn message(command: CommandSet) -> Result<Incoming> {
        Ok(Incoming::Message(DimseMessage::new(1, command)))
    }

    #[test]
    fn test_take_cancel_keeps_other_events_in_order() {
        let mut backlog = VecDeque::new();
        backlog.push_back(message(CommandSet::cancel(4)));
        backlog.push_back(Ok(Incoming::ReleaseRequested));
        backlog.push_back(message(CommandSet::cancel(7)));

        assert!(take_cancel(&mut backlog, 7));
        assert!(!take_cancel(&mut backlog, 7));
        assert_eq!(backlog.len(), 2);
        assert!(matches!(
            backlog.pop_front(),
            Some(Ok(Incoming::Message(m))) if m.command.message_id_being_responded_to == Some(4)
        ));
        assert!(matches!(backlog.pop_front(), Some(Ok(Incoming::ReleaseRequested))));
    }
}
