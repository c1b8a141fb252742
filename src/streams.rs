//! The fixed 64-slot stream table.
//!
//! Slot index equals stream id; each slot carries at most one command
//! machine plus its lifecycle phase. The table is owned exclusively by
//! the session's inbound task: open, tick, close and release all run
//! there, serialized per id.

use std::io;
use std::time::Duration;

use tracing::{debug, warn};

use crate::{
    command::{CommandConfig, CommandSet},
    error::ProtocolError,
    fetch::{FetchReader, LimitedReader},
    frame::{Header, InitialHeader, StreamHeader},
    fsm::Machine,
    sender::{SharedSender, StreamResponder},
    spec::{HEADER_DATA_MAX, STREAM_COUNT},
};

/// Where a stream slot is in its lifecycle.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub enum StreamPhase {
    /// Never opened, or re-usable after completion.
    #[default]
    Idle,

    /// A machine is running; stream frames tick it.
    Running,

    /// We answered the peer's Close and are waiting for the id to be
    /// re-opened; the machine stays until release.
    ClosedAwaitingCompleted,

    /// The peer acknowledged our Close; the id may be re-opened.
    Completed,
}

struct StreamSlot {
    machine: Option<Box<dyn Machine>>,
    closed: bool,
    phase: StreamPhase,
}

impl StreamSlot {
    fn new() -> Self {
        Self {
            machine: None,
            closed: false,
            phase: StreamPhase::Idle,
        }
    }

    fn running(&self) -> bool {
        self.machine.is_some()
    }
}

/// The per-session stream table.
pub(crate) struct StreamTable {
    slots: [StreamSlot; STREAM_COUNT],
}

impl StreamTable {
    pub(crate) fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| StreamSlot::new()),
        }
    }

    fn slot(&mut self, id: u8) -> Result<&mut StreamSlot, ProtocolError> {
        if id > HEADER_DATA_MAX {
            return Err(ProtocolError::InvalidStreamId { received: id });
        }
        Ok(&mut self.slots[usize::from(id)])
    }

    /// Whether the slot holds a machine (running or awaiting the
    /// peer's Completed).
    pub(crate) fn running(&self, id: u8) -> bool {
        self.slots
            .get(usize::from(id))
            .is_some_and(StreamSlot::running)
    }

    /// The lifecycle phase of `id`.
    pub(crate) fn phase(&self, id: u8) -> StreamPhase {
        self.slots
            .get(usize::from(id))
            .map(|s| s.phase)
            .unwrap_or_default()
    }

    /// Opens `id`: reads the initial sub-header, builds and boots the
    /// command, replies with the open ack or failure.
    pub(crate) async fn open(
        &mut self,
        header: Header,
        r: &mut FetchReader,
        sender: &SharedSender,
        commands: &CommandSet,
        cfg: &CommandConfig,
        send_delay: Duration,
    ) -> io::Result<()> {
        let slot = self.slot(header.data())?;

        let mut init = [0u8; 2];
        r.read_exact(&mut init).await?;
        let init = InitialHeader::from_bytes(init);
        let declared = usize::from(init.data());

        let responder = StreamResponder::new(sender.clone(), header, send_delay);
        let mut machine = match commands.build(init.command(), responder, cfg) {
            Ok(machine) => machine,
            Err(code) => {
                warn!(command = init.command(), "unknown command requested");
                let reply = InitialHeader::new(init.command(), code.0, false)?;
                sender.signal(header, &reply.to_bytes()).await?;
                let mut lr = LimitedReader::new(r, declared);
                return lr.ditch().await;
            }
        };

        let mut lr = LimitedReader::new(r, declared);
        let booted = machine.bootup(&mut lr).await;
        lr.ditch().await?;

        match booted {
            Ok(()) => {
                slot.machine = Some(machine);
                slot.closed = false;
                slot.phase = StreamPhase::Running;

                let reply = InitialHeader::new(init.command(), 0, true)?;
                sender.signal(header, &reply.to_bytes()).await?;
                debug!(stream = header.data(), command = init.command(), "stream started");
                Ok(())
            }
            Err(e) => {
                warn!(
                    command = init.command(),
                    error = %e,
                    "command failed to boot",
                );
                let reply = InitialHeader::new(init.command(), e.code().0, false)?;
                sender.signal(header, &reply.to_bytes()).await?;
                Ok(())
            }
        }
    }

    /// Ticks the running machine at `id` with one stream frame.
    pub(crate) async fn tick(&mut self, id: u8, r: &mut FetchReader) -> io::Result<()> {
        let slot = self.slot(id)?;
        if !slot.running() {
            return Err(ProtocolError::OperateInactiveStream.into());
        }
        if slot.closed {
            return Err(ProtocolError::MachineClosed.into());
        }

        let mut sub = [0u8; 2];
        r.read_exact(&mut sub).await?;
        let sub = StreamHeader::from_bytes(sub);

        let machine = slot.machine.as_mut().expect("running slot has a machine");
        let mut lr = LimitedReader::new(r, usize::from(sub.len()));
        let stepped = machine.step(&mut lr, sub).await;

        // The machine may refuse part of the frame; the table keeps the
        // byte stream in sync regardless.
        let ditched = lr.ditch().await;
        stepped.and(ditched)
    }

    /// Closes the running machine at `id` in response to the peer's
    /// Close header. The caller answers with Completed afterwards.
    pub(crate) async fn close(&mut self, id: u8) -> io::Result<()> {
        let slot = self.slot(id)?;
        if !slot.running() || slot.closed {
            return Err(ProtocolError::ClosingInactiveStream.into());
        }

        slot.closed = true;
        slot.phase = StreamPhase::ClosedAwaitingCompleted;
        slot.machine
            .as_mut()
            .expect("running slot has a machine")
            .close()
            .await
    }

    /// Releases the machine at `id` on receipt of the peer's
    /// Completed header; the id becomes reusable.
    pub(crate) async fn release(&mut self, id: u8) -> io::Result<()> {
        let slot = self.slot(id)?;
        if !slot.running() {
            return Err(ProtocolError::ReleasingInactiveStream.into());
        }

        let mut machine = slot.machine.take().expect("running slot has a machine");
        if !slot.closed {
            machine.close().await?;
        }
        slot.closed = false;
        slot.phase = StreamPhase::Completed;
        machine.release().await
    }

    /// Closes and releases every running slot. Per-slot failures are
    /// logged and do not stop the sweep.
    pub(crate) async fn shutdown(&mut self) {
        for id in 0..STREAM_COUNT as u8 {
            if !self.running(id) {
                continue;
            }
            if !self.slots[usize::from(id)].closed {
                if let Err(e) = self.close(id).await {
                    debug!(stream = id, error = %e, "close during shutdown failed");
                    continue;
                }
            }
            if let Err(e) = self.release(id).await {
                debug!(stream = id, error = %e, "release during shutdown failed");
            }
        }
    }
}

impl core::fmt::Debug for StreamTable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let running = self.slots.iter().filter(|s| s.running()).count();
        f.debug_struct("StreamTable").field("running", &running).finish()
    }
}
