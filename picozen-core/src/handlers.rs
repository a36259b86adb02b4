//! Handler channels: the bridge between session callbacks and pull-style
//! consumers.
//!
//! A handler pairs a [`Callback`] (the producer-facing sink invoked by the
//! session) with a receiver handle (the consumer-facing source). Two
//! disciplines exist:
//!
//! - **FIFO**: bounded capacity; a push blocks the producer when the
//!   channel is full; `recv` blocks until data or close.
//! - **Ring**: bounded capacity with drop-oldest-on-overflow; `try_recv`
//!   never blocks.
//!
//! Close is monotonic: once the producing callback is dropped, the
//! receiver drains whatever is buffered and then reports
//! [`ZError::ChannelDisconnected`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::collections::RingBuffer;
use crate::error::{ZError, ZResult};

/// A user-supplied callback plus its drop hook.
///
/// The session holds exactly one strong reference to each declared
/// callback. Invocations are serialized through an internal mutex, so a
/// given callback is never executed concurrently with itself. The drop
/// hook runs exactly once, when the `Callback` value is dropped.
pub struct Callback<T> {
    call: Mutex<Box<dyn FnMut(T) + Send>>,
    on_drop: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl<T> Callback<T> {
    pub fn new(f: impl FnMut(T) + Send + 'static) -> Self {
        Self {
            call: Mutex::new(Box::new(f)),
            on_drop: Mutex::new(None),
        }
    }

    /// Attach a hook that runs when this callback is dropped.
    #[must_use]
    pub fn with_drop(self, on_drop: impl FnOnce() + Send + 'static) -> Self {
        *self.on_drop.lock() = Some(Box::new(on_drop));
        self
    }

    /// Invoke the callback. Blocks if another invocation is in flight.
    pub fn call(&self, value: T) {
        (self.call.lock())(value);
    }
}

impl<T> Drop for Callback<T> {
    fn drop(&mut self) {
        if let Some(hook) = self.on_drop.lock().take() {
            hook();
        }
    }
}

impl<T> std::fmt::Debug for Callback<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callback")
            .field("has_drop", &self.on_drop.lock().is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// FIFO discipline
// ---------------------------------------------------------------------------

/// Consumer half of a FIFO handler.
#[derive(Debug, Clone)]
pub struct FifoHandler<T> {
    rx: flume::Receiver<T>,
}

impl<T> FifoHandler<T> {
    /// Block until an element arrives or the producer side is gone.
    pub fn recv(&self) -> ZResult<T> {
        self.rx.recv().map_err(|_| ZError::ChannelDisconnected)
    }

    /// Non-blocking receive.
    pub fn try_recv(&self) -> ZResult<T> {
        match self.rx.try_recv() {
            Ok(v) => Ok(v),
            Err(flume::TryRecvError::Empty) => Err(ZError::ChannelNoData),
            Err(flume::TryRecvError::Disconnected) => Err(ZError::ChannelDisconnected),
        }
    }

    /// Async receive, for consumers living on the runtime.
    pub async fn recv_async(&self) -> ZResult<T> {
        self.rx
            .recv_async()
            .await
            .map_err(|_| ZError::ChannelDisconnected)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// Build a FIFO handler of the given capacity.
///
/// The returned [`Callback`] blocks its caller while the channel is full,
/// giving lossless delivery at the price of backpressure on the dispatch
/// path.
#[must_use]
pub fn fifo_channel<T: Send + 'static>(capacity: usize) -> (Callback<T>, FifoHandler<T>) {
    let (tx, rx) = flume::bounded(capacity.max(1));
    let callback = Callback::new(move |value| {
        let _ = tx.send(value);
    });
    (callback, FifoHandler { rx })
}

// ---------------------------------------------------------------------------
// Ring discipline
// ---------------------------------------------------------------------------

struct RingShared<T> {
    ring: Mutex<RingBuffer<T>>,
    closed: AtomicBool,
    not_empty: Condvar,
}

/// Consumer half of a Ring handler.
pub struct RingHandler<T> {
    shared: Arc<RingShared<T>>,
}

impl<T> RingHandler<T> {
    /// Block until an element is available or the producer side is gone.
    pub fn recv(&self) -> ZResult<T> {
        let mut guard = self.shared.ring.lock();
        loop {
            if let Some(v) = guard.pull() {
                return Ok(v);
            }
            if self.shared.closed.load(Ordering::Acquire) {
                return Err(ZError::ChannelDisconnected);
            }
            self.shared.not_empty.wait(&mut guard);
        }
    }

    /// Non-blocking receive.
    pub fn try_recv(&self) -> ZResult<T> {
        let mut guard = self.shared.ring.lock();
        match guard.pull() {
            Some(v) => Ok(v),
            None if self.shared.closed.load(Ordering::Acquire) => {
                Err(ZError::ChannelDisconnected)
            }
            None => Err(ZError::ChannelNoData),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.ring.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Build a Ring handler of the given capacity.
///
/// Pushes never block: when the ring is full the oldest buffered element
/// is silently replaced. Select the FIFO handler instead when drops must
/// be visible as backpressure.
#[must_use]
pub fn ring_channel<T: Send + 'static>(capacity: usize) -> (Callback<T>, RingHandler<T>) {
    let shared = Arc::new(RingShared {
        ring: Mutex::new(RingBuffer::new(capacity.max(1))),
        closed: AtomicBool::new(false),
        not_empty: Condvar::new(),
    });
    let producer = shared.clone();
    let closer = shared.clone();
    let callback = Callback::new(move |value| {
        let mut guard = producer.ring.lock();
        let _ = guard.push(value);
        drop(guard);
        producer.not_empty.notify_one();
    })
    .with_drop(move || {
        closer.closed.store(true, Ordering::Release);
        closer.not_empty.notify_all();
    });
    (callback, RingHandler { shared })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_delivers_in_order() {
        let (cb, rx) = fifo_channel::<u32>(8);
        cb.call(1);
        cb.call(2);
        cb.call(3);
        assert_eq!(rx.recv().unwrap(), 1);
        assert_eq!(rx.recv().unwrap(), 2);
        assert_eq!(rx.recv().unwrap(), 3);
        assert!(matches!(rx.try_recv(), Err(ZError::ChannelNoData)));
    }

    #[test]
    fn fifo_drains_then_disconnects() {
        let (cb, rx) = fifo_channel::<u32>(8);
        cb.call(7);
        drop(cb);
        assert_eq!(rx.recv().unwrap(), 7);
        assert!(matches!(rx.recv(), Err(ZError::ChannelDisconnected)));
    }

    #[test]
    fn ring_overflow_drops_oldest() {
        let (cb, rx) = ring_channel::<u32>(2);
        cb.call(1);
        cb.call(2);
        cb.call(3);
        assert_eq!(rx.try_recv().unwrap(), 2);
        assert_eq!(rx.try_recv().unwrap(), 3);
        assert!(matches!(rx.try_recv(), Err(ZError::ChannelNoData)));
    }

    #[test]
    fn ring_close_is_monotonic() {
        let (cb, rx) = ring_channel::<u32>(2);
        cb.call(9);
        drop(cb);
        assert_eq!(rx.try_recv().unwrap(), 9);
        assert!(matches!(rx.try_recv(), Err(ZError::ChannelDisconnected)));
        assert!(matches!(rx.recv(), Err(ZError::ChannelDisconnected)));
    }

    #[test]
    fn callback_drop_hook_runs_once() {
        use std::sync::atomic::AtomicU32;
        let drops = Arc::new(AtomicU32::new(0));
        let d = drops.clone();
        let cb = Callback::new(|_: u32| {}).with_drop(move || {
            d.fetch_add(1, Ordering::SeqCst);
        });
        cb.call(1);
        drop(cb);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn fifo_blocking_producer_unblocks_consumer() {
        let (cb, rx) = fifo_channel::<u32>(1);
        cb.call(1);
        let t = std::thread::spawn(move || {
            // Second push blocks until the consumer pulls
            cb.call(2);
        });
        assert_eq!(rx.recv().unwrap(), 1);
        assert_eq!(rx.recv().unwrap(), 2);
        t.join().unwrap();
    }
}
