//! Subscriber queues
//!
//! Each subscription owns one queue. The mediator holds any number of writer
//! handles (`QueueSender`) for it (instant lane, delayed lane, shutdown
//! paths); exactly one sink task reads it through [`SubscriberQueue`].
//!
//! Termination travels through the queue as an explicit
//! `QueueItem::Unsubscribe` item rather than a nullable slot, so a real
//! marker can never be mistaken for the sentinel.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::Stream;
use tokio::sync::mpsc::{self, error::TryRecvError};

use crate::marker::Marker;
use crate::{Error, Result};

/// One entry in a subscriber queue
#[derive(Debug, Clone)]
pub(crate) enum QueueItem {
    Marker(Arc<Marker>),
    Unsubscribe,
}

/// State shared by every handle on one queue
#[derive(Debug, Default)]
struct QueueShared {
    depth: AtomicUsize,
    disconnected: AtomicBool,
}

/// Create a connected writer/reader pair
pub(crate) fn channel() -> (QueueSender, SubscriberQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    let shared = Arc::new(QueueShared::default());
    (
        QueueSender {
            tx,
            shared: Arc::clone(&shared),
        },
        SubscriberQueue {
            rx,
            shared,
            retired: false,
        },
    )
}

/// Writer side of a subscriber queue
///
/// Pushing never blocks. The depth counter lets the mediator see a backlog
/// without touching the reader.
#[derive(Debug, Clone)]
pub(crate) struct QueueSender {
    tx: mpsc::UnboundedSender<QueueItem>,
    shared: Arc<QueueShared>,
}

impl QueueSender {
    /// Enqueue a marker
    ///
    /// Returns false if the marker was not enqueued because the reader is
    /// gone or the queue was disconnected.
    pub(crate) fn push_marker(&self, marker: Arc<Marker>) -> bool {
        if self.is_disconnected() {
            return false;
        }
        self.push(QueueItem::Marker(marker))
    }

    /// Enqueue the termination sentinel. Returns false if the reader is gone.
    pub(crate) fn push_sentinel(&self) -> bool {
        self.push(QueueItem::Unsubscribe)
    }

    /// Push a sentinel and refuse every later marker
    ///
    /// Only the first call pushes; returns whether this call did.
    pub(crate) fn disconnect(&self) -> bool {
        if self.shared.disconnected.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.push_sentinel();
        true
    }

    fn push(&self, item: QueueItem) -> bool {
        self.shared.depth.fetch_add(1, Ordering::AcqRel);
        if self.tx.send(item).is_err() {
            self.shared.depth.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        true
    }

    /// Items enqueued and not yet read (markers and sentinels)
    pub(crate) fn len(&self) -> usize {
        self.shared.depth.load(Ordering::Acquire)
    }

    /// True once the reader has been dropped
    pub(crate) fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub(crate) fn is_disconnected(&self) -> bool {
        self.shared.disconnected.load(Ordering::Acquire)
    }

    /// True if nothing more will ever be delivered through this queue
    pub(crate) fn is_dead(&self) -> bool {
        self.is_closed() || self.is_disconnected()
    }
}

/// Reader side of a subscription, owned by exactly one sink
///
/// Once the sentinel has been read the queue is retired: every later listen
/// returns [`Error::Unsubscribed`] without waiting. Dropping every writer has
/// the same effect.
#[derive(Debug)]
pub struct SubscriberQueue {
    rx: mpsc::UnboundedReceiver<QueueItem>,
    shared: Arc<QueueShared>,
    retired: bool,
}

impl SubscriberQueue {
    /// Wait for the next marker with no time limit
    ///
    /// # Errors
    /// `Unsubscribed` when the sentinel arrives (or has already arrived).
    pub async fn listen(&mut self) -> Result<Arc<Marker>> {
        if self.retired {
            return Err(Error::Unsubscribed);
        }
        let item = self.rx.recv().await;
        self.accept(item)
    }

    /// Wait up to `timeout` for the next marker
    ///
    /// Returns `Ok(None)` when nothing arrived in time, so the caller can do
    /// other work (protocol keepalives, termination checks) and come back.
    pub async fn listen_timeout(&mut self, timeout: Duration) -> Result<Option<Arc<Marker>>> {
        if self.retired {
            return Err(Error::Unsubscribed);
        }
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(item) => self.accept(item).map(Some),
            Err(_elapsed) => Ok(None),
        }
    }

    /// Take the next marker if one is already waiting
    pub fn try_listen(&mut self) -> Result<Option<Arc<Marker>>> {
        if self.retired {
            return Err(Error::Unsubscribed);
        }
        match self.rx.try_recv() {
            Ok(item) => self.accept(Some(item)).map(Some),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => self.accept(None).map(Some),
        }
    }

    /// Markers as a stream
    ///
    /// Yields markers until either `timeout` passes with nothing queued (the
    /// stream ends) or the sentinel arrives (one `Err(Unsubscribed)` is
    /// yielded, then the stream ends). Each call starts a fresh stream over
    /// the same queue.
    pub fn markers(
        &mut self,
        timeout: Option<Duration>,
    ) -> impl Stream<Item = Result<Arc<Marker>>> + '_ {
        async_stream::stream! {
            loop {
                let next = match timeout {
                    Some(timeout) => self.listen_timeout(timeout).await,
                    None => self.listen().await.map(Some),
                };
                match next {
                    Ok(Some(marker)) => yield Ok(marker),
                    Ok(None) => break,
                    Err(e) => {
                        yield Err(e);
                        break;
                    }
                }
            }
        }
    }

    /// Items waiting to be read
    pub fn len(&self) -> usize {
        self.shared.depth.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True once the sentinel has been consumed
    pub fn is_retired(&self) -> bool {
        self.retired
    }

    fn accept(&mut self, item: Option<QueueItem>) -> Result<Arc<Marker>> {
        match item {
            Some(QueueItem::Marker(marker)) => {
                self.shared.depth.fetch_sub(1, Ordering::AcqRel);
                Ok(marker)
            }
            Some(QueueItem::Unsubscribe) => {
                self.shared.depth.fetch_sub(1, Ordering::AcqRel);
                self.retired = true;
                Err(Error::Unsubscribed)
            }
            // Every writer dropped
            None => {
                self.retired = true;
                Err(Error::Unsubscribed)
            }
        }
    }
}
