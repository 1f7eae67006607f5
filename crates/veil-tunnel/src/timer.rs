//! Controller timers
//!
//! One cancellable slot per [`TimerKind`]. Arming a kind replaces whatever
//! was armed before. Every firing is delivered to the owner's mailbox with
//! the token it was armed with; [`Timers::accept`] rejects firings whose slot
//! has since been re-armed or cancelled.

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Shortest period accepted for repeating timers
const MIN_PERIOD: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum TimerKind {
    ConnectTimeout,
    Reconnect,
    Sampling,
    StopDeadline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TimerFired {
    pub kind: TimerKind,
    pub token: u64,
}

struct Slot {
    token: u64,
    repeating: bool,
    task: JoinHandle<()>,
}

pub(crate) struct Timers<M> {
    tx: mpsc::UnboundedSender<M>,
    slots: HashMap<TimerKind, Slot>,
    next_token: u64,
}

impl<M> Timers<M>
where
    M: From<TimerFired> + Send + 'static,
{
    pub fn new(tx: mpsc::UnboundedSender<M>) -> Self {
        Self {
            tx,
            slots: HashMap::new(),
            next_token: 0,
        }
    }

    /// Fire `kind` once after `delay`
    pub fn once(&mut self, kind: TimerKind, delay: Duration) -> u64 {
        let token = self.arm(kind);
        let tx = self.tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(M::from(TimerFired { kind, token }));
        });
        self.slots.insert(
            kind,
            Slot {
                token,
                repeating: false,
                task,
            },
        );
        token
    }

    /// Fire `kind` every `period`, starting one period from now
    pub fn repeating(&mut self, kind: TimerKind, period: Duration) -> u64 {
        let token = self.arm(kind);
        let period = period.max(MIN_PERIOD);
        let tx = self.tx.clone();
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if tx.send(M::from(TimerFired { kind, token })).is_err() {
                    break;
                }
            }
        });
        self.slots.insert(
            kind,
            Slot {
                token,
                repeating: true,
                task,
            },
        );
        token
    }

    /// Cancel `kind`. Returns `true` if it was armed.
    pub fn cancel(&mut self, kind: TimerKind) -> bool {
        match self.slots.remove(&kind) {
            Some(slot) => {
                slot.task.abort();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, slot) in self.slots.drain() {
            slot.task.abort();
        }
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.slots.contains_key(&kind)
    }

    /// Whether `fired` belongs to the currently armed slot.
    ///
    /// An accepted one-shot firing disarms its slot.
    pub fn accept(&mut self, fired: &TimerFired) -> bool {
        let (current, repeating) = match self.slots.get(&fired.kind) {
            Some(slot) => (slot.token == fired.token, slot.repeating),
            None => return false,
        };
        if current && !repeating {
            self.slots.remove(&fired.kind);
        }
        current
    }

    fn arm(&mut self, kind: TimerKind) -> u64 {
        self.cancel(kind);
        self.next_token += 1;
        self.next_token
    }
}

impl<M> Drop for Timers<M> {
    fn drop(&mut self) {
        for (_, slot) in self.slots.drain() {
            slot.task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Msg(TimerFired);

    impl From<TimerFired> for Msg {
        fn from(fired: TimerFired) -> Self {
            Msg(fired)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_once_fires_after_delay() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = Timers::<Msg>::new(tx);

        let token = timers.once(TimerKind::ConnectTimeout, Duration::from_secs(30));
        assert!(timers.is_armed(TimerKind::ConnectTimeout));

        let started = Instant::now();
        let Msg(fired) = rx.recv().await.unwrap();
        assert_eq!(started.elapsed(), Duration::from_secs(30));
        assert_eq!(fired.kind, TimerKind::ConnectTimeout);
        assert_eq!(fired.token, token);

        assert!(timers.accept(&fired));
        assert!(!timers.is_armed(TimerKind::ConnectTimeout));
        assert!(!timers.accept(&fired));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_rejects_stale_firing() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = Timers::<Msg>::new(tx);

        let first = timers.once(TimerKind::Reconnect, Duration::ZERO);
        tokio::task::yield_now().await;
        let Msg(stale) = rx.recv().await.unwrap();
        assert_eq!(stale.token, first);

        let second = timers.once(TimerKind::Reconnect, Duration::from_secs(2));
        assert_ne!(first, second);
        assert!(!timers.accept(&stale));
        assert!(timers.is_armed(TimerKind::Reconnect));

        let Msg(fresh) = rx.recv().await.unwrap();
        assert!(timers.accept(&fresh));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_firing() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = Timers::<Msg>::new(tx);

        timers.once(TimerKind::StopDeadline, Duration::from_secs(5));
        assert!(timers.cancel(TimerKind::StopDeadline));
        assert!(!timers.cancel(TimerKind::StopDeadline));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeating_skips_immediate_tick() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = Timers::<Msg>::new(tx);

        let started = Instant::now();
        let token = timers.repeating(TimerKind::Sampling, Duration::from_secs(1));

        for n in 1..=3u64 {
            let Msg(fired) = rx.recv().await.unwrap();
            assert_eq!(started.elapsed(), Duration::from_secs(n));
            assert_eq!(fired.token, token);
            assert!(timers.accept(&fired));
        }
        assert!(timers.is_armed(TimerKind::Sampling));

        timers.cancel_all();
        assert!(!timers.is_armed(TimerKind::Sampling));
    }
}
