//! Reply correlation by transaction tag.
//!
//! The reader side [`deliver`](Correlator::deliver)s every correlatable packet
//! into the pending set and wakes the caller registered for that tag, if any.
//! Callers claim their reply from the pending set once woken. Replies nobody
//! is waiting for stay in the set until claimed or until the correlator is
//! closed.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::error::Error;
use crate::protocol::Packet;

/// Wake-up handle for one in-flight request.
pub type ReplySignal = oneshot::Receiver<()>;

/// Removes the waiter for `tag` when dropped, so a caller that gives up early
/// (dropped future, outer timeout) does not leave its waiter behind.
pub struct WaiterGuard<'a> {
    correlator: &'a Correlator,
    tag: u32,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.correlator.cancel(self.tag);
    }
}

#[derive(Debug, Default)]
struct State {
    waiters: HashMap<u32, oneshot::Sender<()>>,
    pending: Vec<Packet>,
    closed: bool,
}

#[derive(Debug, Default)]
pub struct Correlator {
    state: Mutex<State>,
}

impl Correlator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register interest in the reply tagged `tag`. Must happen before the
    /// request is written so the wake-up cannot be missed.
    ///
    /// # Errors
    ///
    /// Returns `Error::Disconnected` once the correlator has been closed.
    pub fn register(&self, tag: u32) -> Result<ReplySignal, Error> {
        let mut state = self.lock();
        if state.closed {
            return Err(Error::Disconnected);
        }
        let (tx, rx) = oneshot::channel();
        if state.waiters.insert(tag, tx).is_some() {
            debug!("Replaced existing waiter for tag {}", tag);
        }
        Ok(rx)
    }

    /// Guard that cancels the waiter for `tag` when it goes out of scope.
    #[must_use]
    pub fn guard(&self, tag: u32) -> WaiterGuard<'_> {
        WaiterGuard {
            correlator: self,
            tag,
        }
    }

    /// Drop the waiter for `tag` without touching the pending set.
    pub fn cancel(&self, tag: u32) {
        self.lock().waiters.remove(&tag);
    }

    /// Append a reply to the pending set and wake its waiter.
    pub fn deliver(&self, packet: Packet) {
        let mut state = self.lock();
        if state.closed {
            trace!("Discarding reply tag {} after close", packet.tag());
            return;
        }
        let tag = packet.tag();
        state.pending.push(packet);
        if let Some(waiter) = state.waiters.remove(&tag) {
            let _ = waiter.send(());
        } else {
            trace!("No waiter for tag {}; reply left pending", tag);
        }
    }

    /// Remove every pending reply tagged `tag`, returning the most recent.
    pub fn take(&self, tag: u32) -> Option<Packet> {
        let mut state = self.lock();
        let mut found = None;
        state.pending.retain(|packet| {
            if packet.tag() == tag {
                found = Some(packet.clone());
                false
            } else {
                true
            }
        });
        found
    }

    /// Wait for the reply to `tag` for at most `timeout`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Timeout` if no reply arrived in time, or
    /// `Error::Disconnected` if the correlator was closed while waiting.
    pub async fn wait(
        &self,
        tag: u32,
        signal: ReplySignal,
        timeout: Duration,
    ) -> Result<Packet, Error> {
        let _guard = self.guard(tag);
        match tokio::time::timeout(timeout, signal).await {
            Ok(Ok(())) => self.take(tag).ok_or(Error::Disconnected),
            Ok(Err(_)) => Err(Error::Disconnected),
            Err(_) => {
                self.cancel(tag);
                self.take(tag).ok_or(Error::Timeout)
            }
        }
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    /// Callers currently registered for a reply.
    #[must_use]
    pub fn waiting_len(&self) -> usize {
        self.lock().waiters.len()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Release every waiter and clear the pending set. Waiting callers return
    /// `Error::Disconnected`.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        let released = state.waiters.len();
        state.waiters.clear();
        state.pending.clear();
        if released > 0 {
            debug!("Released {} waiting callers on close", released);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{PLIST_MESSAGE, PLIST_VERSION, PacketHeader};
    use std::sync::Arc;

    fn reply(tag: u32) -> Packet {
        Packet::inbound(
            PacketHeader {
                length: 16,
                version: PLIST_VERSION,
                message: PLIST_MESSAGE,
                tag,
            },
            Some(plist::Dictionary::new()),
        )
    }

    #[tokio::test]
    async fn test_deliver_wakes_matching_waiter() {
        let correlator = Correlator::new();
        let signal = correlator.register(5).unwrap();
        correlator.deliver(reply(5));

        let packet = correlator
            .wait(5, signal, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(packet.tag(), 5);
        assert_eq!(correlator.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_replies_routed_by_tag_in_either_order() {
        for reverse in [false, true] {
            let correlator = Arc::new(Correlator::new());
            let first = correlator.register(10).unwrap();
            let second = correlator.register(11).unwrap();

            let c1 = correlator.clone();
            let c2 = correlator.clone();
            let h1 = tokio::spawn(async move { c1.wait(10, first, Duration::from_secs(5)).await });
            let h2 = tokio::spawn(async move { c2.wait(11, second, Duration::from_secs(5)).await });

            if reverse {
                correlator.deliver(reply(11));
                correlator.deliver(reply(10));
            } else {
                correlator.deliver(reply(10));
                correlator.deliver(reply(11));
            }

            assert_eq!(h1.await.unwrap().unwrap().tag(), 10);
            assert_eq!(h2.await.unwrap().unwrap().tag(), 11);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_without_reply() {
        let correlator = Correlator::new();
        let signal = correlator.register(3).unwrap();

        let started = tokio::time::Instant::now();
        let result = correlator.wait(3, signal, Duration::from_secs(5)).await;
        let elapsed = started.elapsed();

        assert!(matches!(result, Err(Error::Timeout)));
        assert!(elapsed >= Duration::from_secs(5));
        assert!(elapsed < Duration::from_millis(5100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_reply_stays_pending() {
        let correlator = Correlator::new();
        let signal = correlator.register(4).unwrap();
        let result = correlator.wait(4, signal, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(Error::Timeout)));

        correlator.deliver(reply(4));
        assert_eq!(correlator.pending_len(), 1);
        assert_eq!(correlator.take(4).map(|p| p.tag()), Some(4));
    }

    #[tokio::test]
    async fn test_close_releases_waiters() {
        let correlator = Arc::new(Correlator::new());
        let signal = correlator.register(8).unwrap();
        correlator.deliver(reply(99));

        let waiting = correlator.clone();
        let handle =
            tokio::spawn(async move { waiting.wait(8, signal, Duration::from_secs(30)).await });

        correlator.close();
        assert!(matches!(handle.await.unwrap(), Err(Error::Disconnected)));
        assert_eq!(correlator.pending_len(), 0);
        assert!(correlator.is_closed());
        assert!(matches!(correlator.register(9), Err(Error::Disconnected)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_wait_drops_its_waiter() {
        let correlator = Correlator::new();
        let signal = correlator.register(12).unwrap();
        assert_eq!(correlator.waiting_len(), 1);

        let outer = tokio::time::timeout(
            Duration::from_millis(10),
            correlator.wait(12, signal, Duration::from_secs(30)),
        )
        .await;
        assert!(outer.is_err());
        assert_eq!(correlator.waiting_len(), 0);

        // A reply arriving afterwards is kept for a later claim
        correlator.deliver(reply(12));
        assert_eq!(correlator.pending_len(), 1);
    }

    #[test]
    fn test_guard_cancels_registration() {
        let correlator = Correlator::new();
        let _signal = correlator.register(13).unwrap();
        drop(correlator.guard(13));
        assert_eq!(correlator.waiting_len(), 0);
    }

    #[test]
    fn test_take_removes_all_matching() {
        let correlator = Correlator::new();
        correlator.deliver(reply(1));
        correlator.deliver(reply(2));
        correlator.deliver(reply(1));

        assert!(correlator.take(1).is_some());
        assert_eq!(correlator.pending_len(), 1);
        assert!(correlator.take(1).is_none());
    }
}
