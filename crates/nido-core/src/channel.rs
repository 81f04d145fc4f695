//! Control → real-time handover of topology changes.
//!
//! The control thread submits each API call's [`GraphChange`]s as one batch.
//! Changes enter a control-side backlog first and move onto a bounded
//! crossbeam channel as room allows; the real-time thread drains that channel
//! at the start of every cycle and signals once per drain through the
//! context's [`Rendezvous`].
//!
//! While the context is *live* a submit hands the whole backlog over, waiting
//! for drains whenever the channel is full, and returns once its last change
//! has been applied. A root context is live while a host drives its engine; a
//! nested context is live while its macro client is active inside a live
//! parent. While not live nothing waits: whatever does not fit stays in the
//! backlog until a later call (or [`ContextRouter::flush`]) moves it over.
//!
//! Anything the real-time thread must give up (buffers of unregistered ports,
//! replaced or released process handlers) travels back on a second bounded
//! queue so it is freed on the control thread. Every drained change hands back
//! at most one item, and the sender collects the queue before each hand-over,
//! so a reclaim queue at least as large as the change channel never fills.
//!
//! [`ContextRouter::flush`]: crate::ContextRouter::flush

use crate::arena::Key;
use crate::bridge::BridgeLink;
use crate::buffer::PortBuffer;
use crate::graph::{ClientId, PortDirection, PortId};
use crate::process::ProcessHandler;
use crossbeam_channel::{Receiver, Sender, TryRecvError, TrySendError, bounded};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

/// How long a waiter sleeps before re-checking liveness.
const LIVENESS_POLL: Duration = Duration::from_millis(50);

/// One topology mutation, addressed by arena keys.
pub(crate) enum GraphChange {
    /// A client starts taking part in scheduling.
    Activate {
        client: Key,
        id: ClientId,
        /// Output buffers are written by a bridge, not zeroed before the callback.
        preserve_outputs: bool,
    },
    /// A client stops taking part in scheduling. Its ports are unregistered first.
    Deactivate { client: Key },
    /// A port of an active client gets a twin and a buffer.
    RegisterPort {
        port: Key,
        client: Key,
        id: PortId,
        direction: PortDirection,
        buffer: Box<PortBuffer>,
    },
    /// A port twin is dropped; its buffer is handed back.
    UnregisterPort { port: Key },
    /// Output feeds input. `rank` orders the input's peers the way the
    /// control plane orders its connections.
    Connect { output: Key, input: Key, rank: u64 },
    /// Output no longer feeds input.
    Disconnect { output: Key, input: Key },
    /// No real-time consequence; keeps ordering with the other events.
    Rename { port: Key },
    /// Installs a process handler, handing back any previous one.
    InstallHandler {
        client: Key,
        handler: Box<dyn ProcessHandler>,
    },
    /// Hands a client's process handler back to the control thread.
    ReleaseHandler { client: Key },
    /// Pairs a bridge port with its parent-side port.
    BridgeLink(Box<BridgeLink>),
}

/// Items returned from the real-time thread for deallocation.
pub(crate) enum Reclaimed {
    /// Buffer of an unregistered port twin.
    Buffer(PortId, Box<PortBuffer>),
    /// A released or replaced process handler.
    Handler(Box<dyn ProcessHandler>),
}

struct Sequenced {
    seq: u64,
    change: GraphChange,
}

/// Drain counter plus the condition variable control-thread callers wait on.
pub struct Rendezvous {
    drained: AtomicU64,
    attached: AtomicBool,
    parent: Option<Arc<Rendezvous>>,
    lock: Mutex<()>,
    cond: Condvar,
}

impl Rendezvous {
    pub(crate) fn new(parent: Option<Arc<Rendezvous>>) -> Self {
        Self {
            drained: AtomicU64::new(0),
            attached: AtomicBool::new(false),
            parent,
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    /// Returns true while some thread drives this context's engine.
    pub fn is_live(&self) -> bool {
        self.attached.load(Ordering::Acquire) && self.parent.as_ref().is_none_or(|p| p.is_live())
    }

    /// Highest sequence number applied by the real-time thread.
    pub fn drained(&self) -> u64 {
        self.drained.load(Ordering::Acquire)
    }

    pub(crate) fn set_attached(&self, attached: bool) {
        self.attached.store(attached, Ordering::Release);
        let _guard = self.lock.lock();
        self.cond.notify_all();
    }

    fn publish(&self, seq: u64) {
        self.drained.store(seq, Ordering::Release);
        let _guard = self.lock.lock();
        self.cond.notify_all();
    }

    /// Blocks until `seq` has been drained or the context stops being live.
    fn wait_for(&self, seq: u64) {
        loop {
            if self.drained() >= seq || !self.is_live() {
                return;
            }
            let mut guard = self.lock.lock();
            if self.drained() >= seq || !self.is_live() {
                return;
            }
            // Liveness of an ancestor can change without notifying us.
            self.cond.wait_for(&mut guard, LIVENESS_POLL);
        }
    }
}

/// Control-thread end of a context's channel.
pub(crate) struct ChangeSender {
    tx: Sender<Sequenced>,
    reclaim_rx: Receiver<Reclaimed>,
    rendezvous: Arc<Rendezvous>,
    submitted: u64,
    /// Changes not yet on the channel, oldest first.
    backlog: VecDeque<GraphChange>,
    /// Items taken off the reclaim queue but not yet freed.
    reclaimed: Vec<Reclaimed>,
}

/// Real-time end of a context's channel.
pub(crate) struct ChangeReceiver {
    rx: Receiver<Sequenced>,
    reclaim_tx: Sender<Reclaimed>,
    rendezvous: Arc<Rendezvous>,
}

/// Creates a connected sender/receiver pair.
///
/// The reclaim queue is never smaller than the change channel.
pub(crate) fn channel(
    capacity: usize,
    reclaim_capacity: usize,
    parent: Option<Arc<Rendezvous>>,
) -> (ChangeSender, ChangeReceiver) {
    let capacity = capacity.max(1);
    let (tx, rx) = bounded(capacity);
    let (reclaim_tx, reclaim_rx) = bounded(reclaim_capacity.max(capacity));
    let rendezvous = Arc::new(Rendezvous::new(parent));
    (
        ChangeSender {
            tx,
            reclaim_rx,
            rendezvous: Arc::clone(&rendezvous),
            submitted: 0,
            backlog: VecDeque::new(),
            reclaimed: Vec::new(),
        },
        ChangeReceiver {
            rx,
            reclaim_tx,
            rendezvous,
        },
    )
}

impl ChangeSender {
    pub(crate) fn rendezvous(&self) -> &Arc<Rendezvous> {
        &self.rendezvous
    }

    /// Queues a batch behind every earlier change and hands over what it can.
    pub(crate) fn submit(&mut self, batch: Vec<GraphChange>) {
        if batch.is_empty() && self.backlog.is_empty() {
            return;
        }
        self.backlog.extend(batch);
        self.flush();
    }

    /// Moves backlogged changes onto the channel.
    ///
    /// While the context is live this waits for drains until the backlog is
    /// empty and its last change has been applied. Otherwise it sends what
    /// fits and returns at once.
    pub(crate) fn flush(&mut self) {
        loop {
            self.collect();
            while let Some(change) = self.backlog.pop_front() {
                let seq = self.submitted + 1;
                match self.tx.try_send(Sequenced { seq, change }) {
                    Ok(()) => self.submitted = seq,
                    Err(TrySendError::Full(Sequenced { change, .. })) => {
                        self.backlog.push_front(change);
                        break;
                    }
                    Err(TrySendError::Disconnected(_)) => {
                        // Nothing will ever apply these; free them here.
                        #[cfg(feature = "tracing")]
                        tracing::warn!(
                            dropped = self.backlog.len() + 1,
                            "graph changes dropped, engine is gone"
                        );
                        self.backlog.clear();
                        return;
                    }
                }
            }
            if !self.rendezvous.is_live() {
                return;
            }
            self.rendezvous.wait_for(self.submitted);
            if self.backlog.is_empty() {
                return;
            }
        }
    }

    /// Number of events submitted but not yet drained, backlog included.
    pub(crate) fn pending(&self) -> usize {
        self.tx.len() + self.backlog.len()
    }

    /// Number of events still waiting for room on the channel.
    pub(crate) fn backlogged(&self) -> usize {
        self.backlog.len()
    }

    /// Empties the reclaim queue into the control-side list.
    fn collect(&mut self) {
        while let Ok(item) = self.reclaim_rx.try_recv() {
            self.reclaimed.push(item);
        }
    }

    /// Takes every item handed back by the real-time thread so far.
    pub(crate) fn take_reclaimed(&mut self) -> Vec<Reclaimed> {
        self.collect();
        std::mem::take(&mut self.reclaimed)
    }
}

impl ChangeReceiver {
    pub(crate) fn rendezvous(&self) -> &Arc<Rendezvous> {
        &self.rendezvous
    }

    /// Applies every pending change, then signals waiters once.
    pub(crate) fn drain(&mut self, mut apply: impl FnMut(GraphChange, &Sender<Reclaimed>)) {
        let mut last = None;
        loop {
            match self.rx.try_recv() {
                Ok(Sequenced { seq, change }) => {
                    apply(change, &self.reclaim_tx);
                    last = Some(seq);
                }
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }
        if let Some(seq) = last {
            self.rendezvous.publish(seq);
        }
    }
}

impl Drop for ChangeReceiver {
    fn drop(&mut self) {
        self.rendezvous.set_attached(false);
    }
}

/// Hands an item back to the control thread.
///
/// The queue is sized so this cannot fail while the sender exists; once it is
/// gone the item is freed where it is.
pub(crate) fn give_back(reclaim: &Sender<Reclaimed>, item: Reclaimed) {
    let _ = reclaim.try_send(item);
}
