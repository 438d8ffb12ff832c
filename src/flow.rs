use std::sync::{
    atomic::{AtomicU32, Ordering},
    Mutex,
};
use tokio::sync::Notify;

/// RFC 7540 §6.9.1: flow-control windows must not exceed 2^31-1.
pub const MAX_WINDOW: i64 = (1 << 31) - 1;

#[derive(Debug)]
struct WindowState {
    /// May go negative after a SETTINGS_INITIAL_WINDOW_SIZE decrease.
    window: i64,
    closed: bool,
}

/// Outbound credit counter for one flow-control scope (the connection or a
/// single stream). Senders take credit with [`reserve_upto`], WINDOW_UPDATE
/// arrivals give it back with [`release`], SETTINGS changes shift it with
/// [`adjust`].
///
/// Waiters are woken through a notify cascade: each wakeup re-notifies when
/// credit (or closure) remains observable, so a single `notify_one` permit
/// is never lost between competing senders.
#[derive(Debug)]
pub struct FlowWindow {
    state: Mutex<WindowState>,
    readable: Notify,
}

impl FlowWindow {
    #[must_use]
    pub fn new(initial: u32) -> Self {
        Self {
            state: Mutex::new(WindowState {
                window: i64::from(initial),
                closed: false,
            }),
            readable: Notify::new(),
        }
    }

    #[must_use]
    pub fn available(&self) -> i64 {
        self.state.lock().expect("window lock").window
    }

    /// Takes between 1 and `want` octets of credit, waiting until at least
    /// one is available. Returns `None` once the window is closed
    /// (connection poisoned); the caller looks up the cause.
    pub async fn reserve_upto(&self, want: usize) -> Option<usize> {
        loop {
            {
                let mut state = self.state.lock().expect("window lock");
                if state.closed {
                    drop(state);
                    self.readable.notify_one();
                    return None;
                }
                if state.window > 0 {
                    let take = state.window.min(want as i64);
                    state.window -= take;
                    let more = state.window > 0;
                    drop(state);
                    if more {
                        self.readable.notify_one();
                    }
                    return Some(take as usize);
                }
            }
            self.readable.notified().await;
        }
    }

    /// Credits the window (WINDOW_UPDATE, or hand-back of an over-reserve).
    /// Exceeding 2^31-1 is a FLOW_CONTROL_ERROR surfaced as `Err`.
    pub fn release(&self, n: u32) -> std::result::Result<(), ()> {
        let mut state = self.state.lock().expect("window lock");
        state.window += i64::from(n);
        let overflow = state.window > MAX_WINDOW;
        let readable = state.window > 0;
        drop(state);
        if readable {
            self.readable.notify_one();
        }
        if overflow {
            Err(())
        } else {
            Ok(())
        }
    }

    /// Applies a SETTINGS_INITIAL_WINDOW_SIZE delta; the window may go
    /// negative. Exceeding 2^31-1 is a FLOW_CONTROL_ERROR surfaced as `Err`.
    pub fn adjust(&self, delta: i64) -> std::result::Result<(), ()> {
        let mut state = self.state.lock().expect("window lock");
        state.window += delta;
        let overflow = state.window > MAX_WINDOW;
        let readable = state.window > 0;
        drop(state);
        if readable {
            self.readable.notify_one();
        }
        if overflow {
            Err(())
        } else {
            Ok(())
        }
    }

    /// Wakes every waiter with `None`; used at connection teardown.
    pub fn close(&self) {
        self.state.lock().expect("window lock").closed = true;
        self.readable.notify_one();
    }
}

/// Inbound credit accumulator. Consumed DATA octets pile up here until they
/// cross the flush threshold (or the periodic tick fires) and become one
/// WINDOW_UPDATE frame.
#[derive(Debug)]
pub struct WindowCredit {
    accumulated: AtomicU32,
    threshold: u32,
}

impl WindowCredit {
    #[must_use]
    pub fn new(threshold: u32) -> Self {
        Self {
            accumulated: AtomicU32::new(0),
            threshold: threshold.max(1),
        }
    }

    /// Adds consumed octets; returns the pending credit when it is time to
    /// flush immediately.
    pub fn add(&self, n: u32) -> Option<u32> {
        let total = self.accumulated.fetch_add(n, Ordering::AcqRel) + n;
        if total >= self.threshold {
            self.take()
        } else {
            None
        }
    }

    /// Drains the pending credit, if any. Called by the flow ticker.
    pub fn take(&self) -> Option<u32> {
        match self.accumulated.swap(0, Ordering::AcqRel) {
            0 => None,
            n => Some(n),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, time::Duration};

    #[tokio::test]
    async fn reserve_takes_at_most_available() {
        let window = FlowWindow::new(1024);
        assert_eq!(window.reserve_upto(4096).await, Some(1024));
        assert_eq!(window.available(), 0);
    }

    #[tokio::test]
    async fn reserve_waits_for_release() {
        let window = Arc::new(FlowWindow::new(0));
        let waiter = {
            let window = window.clone();
            tokio::spawn(async move { window.reserve_upto(100).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());
        window.release(40).unwrap();
        assert_eq!(waiter.await.unwrap(), Some(40));
    }

    #[tokio::test]
    async fn close_wakes_all_waiters() {
        let window = Arc::new(FlowWindow::new(0));
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let window = window.clone();
                tokio::spawn(async move { window.reserve_upto(1).await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(10)).await;
        window.close();
        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), None);
        }
    }

    #[tokio::test]
    async fn overflow_is_reported() {
        let window = FlowWindow::new(u32::MAX >> 1);
        assert!(window.release(1).is_err());

        let window = FlowWindow::new(65_535);
        assert!(window.adjust(MAX_WINDOW).is_err());
        // negative windows are legal
        let window = FlowWindow::new(0);
        assert!(window.adjust(-500).is_ok());
        assert_eq!(window.available(), -500);
    }

    #[test]
    fn credit_flushes_at_threshold() {
        let credit = WindowCredit::new(100);
        assert_eq!(credit.add(40), None);
        assert_eq!(credit.add(70), Some(110));
        assert_eq!(credit.take(), None);
        assert_eq!(credit.add(10), None);
        assert_eq!(credit.take(), Some(10));
    }
}
