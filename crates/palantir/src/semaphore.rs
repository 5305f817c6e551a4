//! Counting semaphore with FIFO admission.
//!
//! Every blocked caller parks on its own oneshot channel. In fair mode
//! `release()` hands the permit straight to the head of the queue instead of
//! bumping a counter and waking everyone, so a freed permit can never be
//! stolen by a later arrival and no waiter is woken just to find it gone.
//!
//! In unfair mode the permit goes back to the counter and only the head waiter
//! is woken to compete for it; a caller arriving in between may take it first.
//! The loser goes back to the front of the queue.
//!
//! Per-waiter states: Queued → Granted | Competing | Cancelled | Closed.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::AcquireError;

/// What a parked waiter is woken with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wake {
    /// The permit is already yours.
    Granted,
    /// A permit was returned to the counter; try to take it.
    Compete,
}

struct Waiter {
    ticket: u64,
    wake: oneshot::Sender<Wake>,
}

struct State {
    /// May go negative: more permits owed than exist.
    permits: isize,
    waiters: VecDeque<Waiter>,
    next_ticket: u64,
    closed: bool,
}

enum Admission {
    Granted,
    Queued {
        ticket: u64,
        wake: oneshot::Receiver<Wake>,
    },
}

pub struct FairSemaphore {
    state: Mutex<State>,
    fair: bool,
}

impl FairSemaphore {
    /// `fair == false` lets a new arrival take a returned permit even while
    /// others are queued; queued waiters are still woken in FIFO order.
    pub fn new(permits: isize, fair: bool) -> Self {
        Self {
            state: Mutex::new(State {
                permits,
                waiters: VecDeque::new(),
                next_ticket: 0,
                closed: false,
            }),
            fair,
        }
    }

    pub fn is_fair(&self) -> bool {
        self.fair
    }

    pub fn available_permits(&self) -> isize {
        self.state.lock().permits
    }

    /// Number of callers currently queued.
    pub fn waiting(&self) -> usize {
        self.state.lock().waiters.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        !state.closed && self.take_permit(&mut state)
    }

    /// Wait for a permit in arrival order.
    ///
    /// Returns `Cancelled` if `cancel` fires first. A cancelled or dropped
    /// acquire leaves the queue without consuming a permit; if the permit was
    /// handed over at the same instant it is passed on to the next waiter.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), AcquireError> {
        self.wait(Some(cancel)).await
    }

    /// Wait for a permit, ignoring cancellation. Only `close()` ends the wait early.
    ///
    /// A caller's token that fires meanwhile stays cancelled; nothing here resets it.
    pub async fn acquire_uninterruptibly(&self) -> Result<(), AcquireError> {
        self.wait(None).await
    }

    /// Return one permit to the longest-waiting caller.
    pub fn release(&self) {
        let mut state = self.state.lock();
        self.release_locked(&mut state);
    }

    /// Fail every queued waiter with `Closed` and refuse new acquires.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        let dropped = state.waiters.len();
        // Dropping the senders wakes each receiver with an error.
        state.waiters.clear();
        tracing::debug!(dropped, "Semaphore closed");
    }

    async fn wait(&self, cancel: Option<&CancellationToken>) -> Result<(), AcquireError> {
        let mut retry = false;
        loop {
            let mut pending = match self.admit(retry)? {
                Admission::Granted => return Ok(()),
                Admission::Queued { ticket, wake } => Pending::new(self, ticket, wake),
            };

            let wake = match cancel {
                Some(cancel) => tokio::select! {
                    biased;
                    wake = &mut pending.wake => pending.settle(wake)?,
                    _ = cancel.cancelled() => {
                        pending.withdraw();
                        return Err(AcquireError::Cancelled);
                    }
                },
                None => {
                    let wake = (&mut pending.wake).await;
                    pending.settle(wake)?
                }
            };

            match wake {
                Wake::Granted => return Ok(()),
                Wake::Compete => retry = true,
            }
        }
    }

    fn take_permit(&self, state: &mut State) -> bool {
        let may_barge = !self.fair || state.waiters.is_empty();
        if state.permits > 0 && may_barge {
            state.permits -= 1;
            true
        } else {
            false
        }
    }

    /// Take a permit or join the queue. A waiter that lost a race after being
    /// woken (`retry`) rejoins at the front.
    fn admit(&self, retry: bool) -> Result<Admission, AcquireError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(AcquireError::Closed);
        }
        if self.take_permit(&mut state) {
            return Ok(Admission::Granted);
        }

        let ticket = state.next_ticket;
        state.next_ticket += 1;
        let (tx, rx) = oneshot::channel();
        let waiter = Waiter { ticket, wake: tx };
        if retry {
            state.waiters.push_front(waiter);
        } else {
            state.waiters.push_back(waiter);
        }
        tracing::trace!(ticket, retry, queued = state.waiters.len(), "Waiter queued");

        Ok(Admission::Queued { ticket, wake: rx })
    }

    fn release_locked(&self, state: &mut State) {
        if state.closed {
            return;
        }
        state.permits += 1;
        if !self.fair {
            Self::wake_competitor(state);
            return;
        }
        while state.permits > 0 {
            let Some(waiter) = state.waiters.pop_front() else {
                break;
            };
            if waiter.wake.send(Wake::Granted).is_ok() {
                state.permits -= 1;
                tracing::trace!(ticket = waiter.ticket, "Permit handed to waiter");
            }
        }
    }

    /// Unfair mode: wake the head waiter to race for the counter.
    fn wake_competitor(state: &mut State) {
        if state.permits <= 0 {
            return;
        }
        while let Some(waiter) = state.waiters.pop_front() {
            if waiter.wake.send(Wake::Compete).is_ok() {
                tracing::trace!(ticket = waiter.ticket, "Waiter woken to compete");
                break;
            }
        }
    }

    /// Remove a waiter that stopped waiting.
    ///
    /// Wakes are sent under the state lock, so once we hold it a missing ticket
    /// means the waiter was already woken (or the semaphore closed). A granted
    /// permit is forwarded; a wake to compete is passed on to the next waiter.
    fn withdraw(&self, ticket: u64, wake: &mut oneshot::Receiver<Wake>) {
        let mut state = self.state.lock();
        if let Some(pos) = state.waiters.iter().position(|w| w.ticket == ticket) {
            state.waiters.remove(pos);
            tracing::trace!(ticket, "Waiter withdrawn");
            return;
        }
        match wake.try_recv() {
            Ok(Wake::Granted) => {
                tracing::trace!(ticket, "Withdrawn waiter already granted, forwarding permit");
                self.release_locked(&mut state);
            }
            Ok(Wake::Compete) => Self::wake_competitor(&mut state),
            Err(_) => {}
        }
    }
}

/// A queued acquire. Withdraws itself from the queue if dropped before settling.
struct Pending<'a> {
    semaphore: &'a FairSemaphore,
    ticket: u64,
    wake: oneshot::Receiver<Wake>,
    settled: bool,
}

impl<'a> Pending<'a> {
    fn new(semaphore: &'a FairSemaphore, ticket: u64, wake: oneshot::Receiver<Wake>) -> Self {
        Self {
            semaphore,
            ticket,
            wake,
            settled: false,
        }
    }

    fn settle(&mut self, wake: Result<Wake, oneshot::error::RecvError>) -> Result<Wake, AcquireError> {
        self.settled = true;
        wake.map_err(|_| AcquireError::Closed)
    }

    fn withdraw(&mut self) {
        self.settled = true;
        self.semaphore.withdraw(self.ticket, &mut self.wake);
    }
}

impl Drop for Pending<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.semaphore.withdraw(self.ticket, &mut self.wake);
        }
    }
}
