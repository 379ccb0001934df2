// serializer.rs - per-interface exclusive execution of NDP commands
//! At most one initiator/responder/end/end-all command is active per interface; the rest wait in
//! FIFO order. A command is handed to firmware when it activates, not when it is submitted.
//! Every command that was built for submission is passed to [`CommandLifecycle::on_release`]
//! exactly once, whichever way it leaves.

use std::{
    collections::VecDeque,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::{Duration, Instant},
};

use ahash::AHashMap;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::{runtime::Handle, task::JoinHandle, time};
use tracing::{debug, warn};

use crate::{
    api::{
        EndAllRequest, EndRequest, FirmwareCommand, FirmwareError, InitiatorRequest,
        ResponderRequest,
    },
    metrics::Metrics,
    registry::InterfaceContext,
    types::{TransactionId, VdevId},
};

/// Identifier assigned to a submitted command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandId(pub u64);

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cmd{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Initiator,
    Responder,
    End,
    EndAll,
}

impl CommandKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            CommandKind::Initiator => "initiator",
            CommandKind::Responder => "responder",
            CommandKind::End => "end",
            CommandKind::EndAll => "end_all",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandPayload {
    Initiator(InitiatorRequest),
    Responder(ResponderRequest),
    End(EndRequest),
    EndAll(EndAllRequest),
}

impl CommandPayload {
    pub fn kind(&self) -> CommandKind {
        match self {
            CommandPayload::Initiator(_) => CommandKind::Initiator,
            CommandPayload::Responder(_) => CommandKind::Responder,
            CommandPayload::End(_) => CommandKind::End,
            CommandPayload::EndAll(_) => CommandKind::EndAll,
        }
    }

    /// End-all carries no host transaction id.
    pub fn txn(&self) -> TransactionId {
        match self {
            CommandPayload::Initiator(req) => req.txn,
            CommandPayload::Responder(req) => req.txn,
            CommandPayload::End(req) => req.txn,
            CommandPayload::EndAll(_) => TransactionId::default(),
        }
    }
}

impl From<CommandPayload> for FirmwareCommand {
    fn from(payload: CommandPayload) -> Self {
        match payload {
            CommandPayload::Initiator(req) => FirmwareCommand::Initiator(req),
            CommandPayload::Responder(req) => FirmwareCommand::Responder(req),
            CommandPayload::End(req) => FirmwareCommand::End(req),
            CommandPayload::EndAll(req) => FirmwareCommand::EndAll(req),
        }
    }
}

/// A serialized command. Holds the interface reference taken at submission.
#[derive(Debug)]
pub struct Command {
    id: CommandId,
    iface: Arc<InterfaceContext>,
    payload: CommandPayload,
    submitted_at: Instant,
}

impl Command {
    pub fn id(&self) -> CommandId {
        self.id
    }

    pub fn kind(&self) -> CommandKind {
        self.payload.kind()
    }

    pub fn txn(&self) -> TransactionId {
        self.payload.txn()
    }

    pub fn vdev(&self) -> VdevId {
        self.iface.id()
    }

    pub fn interface(&self) -> &Arc<InterfaceContext> {
        &self.iface
    }

    pub fn payload(&self) -> &CommandPayload {
        &self.payload
    }

    pub fn age(&self) -> Duration {
        self.submitted_at.elapsed()
    }
}

/// Why a command left the queue without running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    Cancelled,
    /// The interface was torn down.
    Flushed,
    /// Firmware refused the command at activation.
    ActivationFailed,
}

/// Callbacks invoked as commands move through the serializer.
///
/// Callbacks run inside serializer bookkeeping and must not call back into the serializer.
pub trait CommandLifecycle: Send + Sync + 'static {
    /// The command is now the active one on its interface; transmit it.
    fn on_activate(&self, command: &Command) -> Result<(), FirmwareError>;

    fn on_cancel(&self, command: &Command, reason: CancelReason);

    fn on_timeout(&self, command: &Command);

    /// Final callback; dropping `command` drops the interface reference.
    fn on_release(&self, command: Command);
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SerializerError {
    #[error("command queue of {0} is full")]
    QueueFull(VdevId),
    #[error("interface {0} is closing")]
    InterfaceClosing(VdevId),
    #[error("{0} is active and cannot be cancelled")]
    Active(CommandId),
    #[error("{0} is not queued")]
    NotFound(CommandId),
}

/// Summary of a command completed by a firmware response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completed {
    pub id: CommandId,
    pub kind: CommandKind,
    pub txn: TransactionId,
}

struct Active {
    command: Command,
    timer: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Queue {
    active: Option<Active>,
    pending: VecDeque<Command>,
}

struct Inner {
    lifecycle: Arc<dyn CommandLifecycle>,
    metrics: Arc<Metrics>,
    timeout: Duration,
    max_pending: usize,
    next_id: AtomicU64,
    queues: Mutex<AHashMap<VdevId, Queue>>,
}

/// Cloneable handle to the command serializer.
#[derive(Clone)]
pub struct Serializer {
    inner: Arc<Inner>,
}

impl Serializer {
    pub fn new(
        lifecycle: Arc<dyn CommandLifecycle>,
        metrics: Arc<Metrics>,
        timeout: Duration,
        max_pending: usize,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                lifecycle,
                metrics,
                timeout,
                max_pending: max_pending.max(1),
                next_id: AtomicU64::new(1),
                queues: Mutex::new(AHashMap::default()),
            }),
        }
    }

    /// Admits a command for `iface`. It activates immediately when the interface is idle.
    pub fn submit(
        &self,
        iface: Arc<InterfaceContext>,
        payload: CommandPayload,
    ) -> Result<CommandId, SerializerError> {
        let inner = &self.inner;
        let vdev = iface.id();
        let command = Command {
            id: CommandId(inner.next_id.fetch_add(1, Ordering::Relaxed)),
            iface,
            payload,
            submitted_at: Instant::now(),
        };
        let id = command.id;
        let kind = command.kind();

        // A closing interface only admits the end-all that drains it.
        if command.iface.is_closing() && kind != CommandKind::EndAll {
            inner.lifecycle.on_release(command);
            return Err(SerializerError::InterfaceClosing(vdev));
        }

        let rejected = {
            let mut queues = inner.queues.lock();
            let queue = queues.entry(vdev).or_default();
            if queue.pending.len() >= inner.max_pending {
                Some(command)
            } else {
                queue.pending.push_back(command);
                inner.metrics.commands_queued.inc();
                None
            }
        };
        if let Some(command) = rejected {
            warn!(%vdev, %id, %kind, "command queue full; submission rejected");
            inner.lifecycle.on_release(command);
            return Err(SerializerError::QueueFull(vdev));
        }

        debug!(%vdev, %id, %kind, "command queued");
        inner.pump(vdev);
        Ok(id)
    }

    /// Completes the active command of `kind` on `vdev`.
    ///
    /// When firmware echoes a transaction id it must match the active command's.
    pub fn complete(
        &self,
        vdev: VdevId,
        kind: CommandKind,
        txn: Option<TransactionId>,
    ) -> Option<Completed> {
        let inner = &self.inner;
        let finished = {
            let mut queues = inner.queues.lock();
            let queue = queues.get_mut(&vdev)?;
            let matches = queue.active.as_ref().is_some_and(|active| {
                active.command.kind() == kind
                    && txn.map_or(true, |txn| txn == active.command.txn())
            });
            if matches {
                queue.active.take()
            } else {
                None
            }
        };

        let Some(Active { command, timer }) = finished else {
            warn!(%vdev, %kind, ?txn, "response without a matching active command ignored");
            return None;
        };
        if let Some(timer) = timer {
            timer.abort();
        }
        let completed = Completed {
            id: command.id(),
            kind: command.kind(),
            txn: command.txn(),
        };
        debug!(%vdev, id = %completed.id, %kind, elapsed = ?command.age(), "command completed");
        inner.lifecycle.on_release(command);
        inner.pump(vdev);
        Some(completed)
    }

    /// Cancels a queued command. Active commands only end by response or timeout.
    pub fn cancel(&self, vdev: VdevId, id: CommandId) -> Result<(), SerializerError> {
        let inner = &self.inner;
        let removed = {
            let mut queues = inner.queues.lock();
            let queue = queues.get_mut(&vdev).ok_or(SerializerError::NotFound(id))?;
            if queue
                .active
                .as_ref()
                .is_some_and(|active| active.command.id() == id)
            {
                return Err(SerializerError::Active(id));
            }
            let position = queue
                .pending
                .iter()
                .position(|command| command.id() == id)
                .ok_or(SerializerError::NotFound(id))?;
            inner.metrics.commands_queued.dec();
            queue.pending.remove(position)
        };
        if let Some(command) = removed {
            inner.retire(command, CancelReason::Cancelled);
        }
        Ok(())
    }

    /// Cancels every queued command of `vdev`, returning how many were dropped.
    pub fn flush(&self, vdev: VdevId) -> usize {
        let inner = &self.inner;
        let drained: Vec<Command> = {
            let mut queues = inner.queues.lock();
            match queues.get_mut(&vdev) {
                Some(queue) => {
                    let drained: Vec<_> = queue.pending.drain(..).collect();
                    if queue.active.is_none() {
                        queues.remove(&vdev);
                    }
                    drained
                }
                None => Vec::new(),
            }
        };
        let count = drained.len();
        inner.metrics.commands_queued.sub(count as i64);
        for command in drained {
            inner.retire(command, CancelReason::Flushed);
        }
        if count > 0 {
            debug!(%vdev, count, "queued commands flushed");
        }
        count
    }

    /// Id and kind of the active command on `vdev`.
    pub fn active(&self, vdev: VdevId) -> Option<(CommandId, CommandKind)> {
        self.inner.queues.lock().get(&vdev).and_then(|queue| {
            queue
                .active
                .as_ref()
                .map(|active| (active.command.id(), active.command.kind()))
        })
    }

    /// Number of commands waiting behind the active one on `vdev`.
    pub fn pending(&self, vdev: VdevId) -> usize {
        self.inner
            .queues
            .lock()
            .get(&vdev)
            .map_or(0, |queue| queue.pending.len())
    }

    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }
}

impl Inner {
    fn pump(self: &Arc<Self>, vdev: VdevId) {
        let mut failed = Vec::new();
        {
            let mut queues = self.queues.lock();
            loop {
                let Some(queue) = queues.get_mut(&vdev) else {
                    break;
                };
                if queue.active.is_some() {
                    break;
                }
                let Some(command) = queue.pending.pop_front() else {
                    queues.remove(&vdev);
                    break;
                };
                self.metrics.commands_queued.dec();
                // Activation happens under the queue lock so a fast response cannot miss it.
                match self.lifecycle.on_activate(&command) {
                    Ok(()) => {
                        let kind = command.kind();
                        self.metrics
                            .commands_activated
                            .with_label_values(&[kind.as_str()])
                            .inc();
                        debug!(%vdev, id = %command.id(), %kind, "command activated");
                        let timer = self.arm_timer(vdev, command.id());
                        queue.active = Some(Active { command, timer });
                        break;
                    }
                    Err(err) => {
                        warn!(%vdev, id = %command.id(), error = %err, "command activation failed");
                        failed.push(command);
                    }
                }
            }
        }
        for command in failed {
            self.retire(command, CancelReason::ActivationFailed);
        }
    }

    fn arm_timer(self: &Arc<Self>, vdev: VdevId, id: CommandId) -> Option<JoinHandle<()>> {
        let Ok(handle) = Handle::try_current() else {
            warn!(%vdev, %id, "no runtime available; command timer not armed");
            return None;
        };
        let weak: Weak<Inner> = Arc::downgrade(self);
        let timeout = self.timeout;
        Some(handle.spawn(async move {
            time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                inner.expire(vdev, id);
            }
        }))
    }

    fn expire(self: &Arc<Self>, vdev: VdevId, id: CommandId) {
        let expired = {
            let mut queues = self.queues.lock();
            queues.get_mut(&vdev).and_then(|queue| {
                if queue
                    .active
                    .as_ref()
                    .is_some_and(|active| active.command.id() == id)
                {
                    queue.active.take()
                } else {
                    None
                }
            })
        };
        let Some(Active { command, .. }) = expired else {
            return;
        };
        self.metrics.commands_timed_out.inc();
        warn!(%vdev, %id, kind = %command.kind(), timeout = ?self.timeout, "command timed out");
        self.lifecycle.on_timeout(&command);
        self.lifecycle.on_release(command);
        self.pump(vdev);
    }

    fn retire(&self, command: Command, reason: CancelReason) {
        self.metrics.commands_cancelled.inc();
        debug!(vdev = %command.vdev(), id = %command.id(), ?reason, "command cancelled");
        self.lifecycle.on_cancel(&command, reason);
        self.lifecycle.on_release(command);
    }
}
