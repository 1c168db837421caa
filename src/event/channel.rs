use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Creates an unbounded FIFO event channel. Producers never block; sends after
/// `close()` (or after the receiver is dropped) are silently discarded.
pub fn event_channel<T>() -> (EventSender<T>, EventReceiver<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let closed = Arc::new(AtomicBool::new(false));
    (
        EventSender {
            tx,
            closed: Arc::clone(&closed),
        },
        EventReceiver { rx, closed },
    )
}

pub struct EventSender<T> {
    tx: mpsc::UnboundedSender<T>,
    closed: Arc<AtomicBool>,
}

impl<T> Clone for EventSender<T> {
    fn clone(&self) -> Self {
        EventSender {
            tx: self.tx.clone(),
            closed: Arc::clone(&self.closed),
        }
    }
}

impl<T> EventSender<T> {
    pub fn send(&self, event: T) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let _ = self.tx.send(event);
    }
}

pub struct EventReceiver<T> {
    rx: mpsc::UnboundedReceiver<T>,
    closed: Arc<AtomicBool>,
}

impl<T> EventReceiver<T> {
    /// Next event in arrival order, or `None` once closed and drained.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Stops accepting new events. Buffered events remain readable.
    pub fn close(&mut self) {
        self.closed.store(true, Ordering::Release);
        self.rx.close();
    }
}
