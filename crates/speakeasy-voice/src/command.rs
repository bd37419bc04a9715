//! Out-of-band control: the command bus and the per-stage inbox.
//!
//! CLEAR never travels through the data queues. The bus bumps a shared
//! generation counter and then broadcasts, so a stage that has not yet
//! seen the broadcast can still recognise stale data by its stamp.

use crate::message::{Envelope, Generation};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

/// The only control value the pipeline understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    Clear,
}

/// A control signal together with the generation it opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    pub signal: ControlSignal,
    pub generation: Generation,
}

#[derive(Debug, Clone)]
pub struct CommandBus {
    tx: broadcast::Sender<Command>,
    generation: Arc<AtomicU64>,
}

impl CommandBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Current generation. Data stamped lower than this is stale.
    pub fn generation(&self) -> Generation {
        self.generation.load(Ordering::Acquire)
    }

    pub fn is_current(&self, generation: Generation) -> bool {
        generation >= self.generation()
    }

    /// Open a new generation and tell every listening stage about it.
    pub fn clear(&self) -> Generation {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let listeners = self
            .tx
            .send(Command {
                signal: ControlSignal::Clear,
                generation,
            })
            .unwrap_or(0);
        info!(generation, listeners, "CLEAR issued");
        generation
    }

    pub fn listener(&self) -> CommandListener {
        CommandListener {
            rx: self.tx.subscribe(),
            bus: self.clone(),
        }
    }
}

/// One stage's view of the bus.
pub struct CommandListener {
    rx: broadcast::Receiver<Command>,
    bus: CommandBus,
}

impl CommandListener {
    /// Wait for the next command. Cancel safe, so it can sit in `select!`.
    ///
    /// A lagged receiver only ever missed CLEARs, so lag collapses into a
    /// single CLEAR for the newest generation.
    pub async fn recv(&mut self) -> Command {
        match self.rx.recv().await {
            Ok(command) => command,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "command listener lagged; collapsing into one CLEAR");
                Command {
                    signal: ControlSignal::Clear,
                    generation: self.bus.generation(),
                }
            }
            // The listener holds a sender clone, so this only happens if the
            // bus is torn down underneath us. Never resolve again.
            Err(broadcast::error::RecvError::Closed) => std::future::pending().await,
        }
    }

    pub fn bus(&self) -> &CommandBus {
        &self.bus
    }
}

/// A stage's input queue plus a small backlog of items kept back while
/// draining stale data after a CLEAR.
pub struct Inbox<T> {
    rx: mpsc::Receiver<Envelope<T>>,
    backlog: VecDeque<Envelope<T>>,
}

impl<T> Inbox<T> {
    pub fn new(rx: mpsc::Receiver<Envelope<T>>) -> Self {
        Self {
            rx,
            backlog: VecDeque::new(),
        }
    }

    /// Next item, backlog first. Cancel safe. A closed queue reads as
    /// end-of-session.
    pub async fn recv(&mut self) -> Envelope<T> {
        if let Some(item) = self.backlog.pop_front() {
            return item;
        }
        self.rx.recv().await.unwrap_or(Envelope::EndOfSession)
    }

    /// Discard every queued item for which `is_stale` holds. Everything
    /// else, including end-of-session, is kept in order. Returns how many
    /// items were dropped.
    pub fn drain_stale(&mut self, mut is_stale: impl FnMut(&T) -> bool) -> usize {
        let mut kept = VecDeque::new();
        let mut dropped = 0;
        let queued = std::mem::take(&mut self.backlog)
            .into_iter()
            .chain(std::iter::from_fn(|| self.rx.try_recv().ok()));
        for item in queued {
            match &item {
                Envelope::Data(data) if is_stale(data) => dropped += 1,
                _ => kept.push_back(item),
            }
        }
        self.backlog = kept;
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn clear_bumps_generation_and_broadcasts() {
        let bus = CommandBus::new(4);
        let mut a = bus.listener();
        let mut b = bus.listener();
        assert_eq!(bus.generation(), 0);

        let generation = bus.clear();
        assert_eq!(generation, 1);
        assert!(!bus.is_current(0));
        assert!(bus.is_current(1));

        assert_eq!(a.recv().await.generation, 1);
        assert_eq!(b.recv().await.signal, ControlSignal::Clear);
    }

    #[tokio::test]
    async fn lagged_listener_sees_latest_generation() {
        let bus = CommandBus::new(1);
        let mut listener = bus.listener();
        bus.clear();
        bus.clear();
        bus.clear();
        let command = listener.recv().await;
        assert_eq!(command.generation, 3);
    }

    #[test]
    fn listener_waits_until_clear() {
        use tokio_test::{assert_pending, assert_ready, task};

        let bus = CommandBus::new(4);
        let mut listener = bus.listener();
        let mut recv = task::spawn(listener.recv());
        assert_pending!(recv.poll());

        bus.clear();
        assert!(recv.is_woken());
        let command = assert_ready!(recv.poll());
        assert_eq!(command.generation, 1);
    }

    #[tokio::test]
    async fn drain_keeps_fresh_items_and_session_end() {
        let (tx, rx) = mpsc::channel(8);
        let mut inbox = Inbox::new(rx);
        for n in [1, 2, 7, 3] {
            tx.send(Envelope::Data(n)).await.unwrap();
        }
        tx.send(Envelope::EndOfSession).await.unwrap();

        let dropped = inbox.drain_stale(|n| *n < 5);
        assert_eq!(dropped, 3);
        assert_eq!(inbox.recv().await, Envelope::Data(7));
        assert_eq!(inbox.recv().await, Envelope::EndOfSession);

        drop(tx);
        assert_eq!(inbox.recv().await, Envelope::EndOfSession);
    }
}
