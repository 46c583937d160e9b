//
// Copyright (c) The vrrpd Contributors
//
// SPDX-License-Identifier: MIT
//

//! Timer primitives (C2). `Task` owns a spawned future and cancels it on
//! drop; `TimeoutTask`/`IntervalTask` layer a resettable one-shot/periodic
//! timer on top, driven entirely by the single-threaded runtime's reactor —
//! no background OS thread is involved.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;
use tokio::{task, time};
use tracing::{error, Instrument};

/// A handle which can be used to manipulate the task created by
/// [`Task::spawn`].
///
/// Dropping this handle cancels the task.
#[derive(Debug)]
pub struct Task<T> {
    join_handle: task::JoinHandle<T>,
    detached: bool,
}

/// A handle to a one-shot timeout task created by [`TimeoutTask::new`].
///
/// Dropping this handle cancels the timeout.
#[derive(Debug)]
pub struct TimeoutTask {
    inner: TimeoutTaskInner,
}

#[derive(Debug)]
struct TimeoutTaskInner {
    _task: Task<()>,
    control: UnboundedSender<Message>,
    next: Arc<Mutex<Instant>>,
}

/// A handle to a periodic interval task created by [`IntervalTask::new`].
///
/// Dropping this handle cancels the interval.
#[derive(Debug)]
pub struct IntervalTask {
    inner: IntervalTaskInner,
}

#[derive(Debug)]
struct IntervalTaskInner {
    _task: Task<()>,
    control: UnboundedSender<Message>,
    next: Arc<Mutex<Instant>>,
}

#[derive(Debug)]
enum Message {
    Reset(Option<Duration>),
}

// ===== impl Task =====

impl<T> Task<T> {
    /// Spawns a new asynchronous task, returning a handle for it.
    pub fn spawn<Fut>(future: Fut) -> Task<T>
    where
        Fut: Future<Output = T> + 'static,
        T: 'static,
    {
        Task {
            join_handle: task::spawn_local(future),
            detached: false,
        }
    }

    /// Detaches the task so dropping this handle no longer cancels it.
    pub fn detach(&mut self) {
        self.detached = true;
    }
}

impl<T> Future for Task<T> {
    type Output = Result<T, task::JoinError>;

    fn poll(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        Pin::new(&mut self.join_handle).poll(cx)
    }
}

impl<T> Drop for Task<T> {
    fn drop(&mut self) {
        if !self.detached {
            self.join_handle.abort();
        }
    }
}

// ===== impl TimeoutTask =====

impl TimeoutTask {
    /// Spawns a task that calls `cb` once `timeout` elapses.
    pub fn new<F, Fut>(timeout: Duration, cb: F) -> TimeoutTask
    where
        F: FnOnce() -> Fut + 'static,
        Fut: Future<Output = ()>,
    {
        let (control_tx, mut control_rx) = mpsc::unbounded_channel();

        let next = Instant::now() + timeout;
        let next = Arc::new(Mutex::new(next));
        let next_child = next.clone();

        let task = Task::spawn(
            async move {
                let timeout_fut = tokio::time::sleep(timeout);
                tokio::pin!(timeout_fut);

                loop {
                    tokio::select! {
                        _ = &mut timeout_fut => {
                            (cb)().await;
                            break;
                        }
                        message = control_rx.recv() => {
                            match message {
                                Some(Message::Reset(None)) => {
                                    let next = Instant::now() + timeout;
                                    timeout_fut.as_mut().reset(next);
                                    *next_child.lock().unwrap() = next;
                                },
                                Some(Message::Reset(Some(new_timeout))) => {
                                    let next = Instant::now() + new_timeout;
                                    timeout_fut.as_mut().reset(next);
                                    *next_child.lock().unwrap() = next;
                                },
                                None => break,
                            }
                        }
                    }
                }
            }
            .in_current_span(),
        );

        TimeoutTask {
            inner: TimeoutTaskInner {
                _task: task,
                control: control_tx,
                next,
            },
        }
    }

    /// Resets the timeout, regardless of whether it already expired.
    ///
    /// Reuses the last duration when `timeout` is `None`.
    pub fn reset(&mut self, timeout: Option<Duration>) {
        if self.inner.control.send(Message::Reset(timeout)).is_err() {
            error!("failed to reset timeout");
        }
    }

    /// Returns the time remaining before expiry.
    pub fn remaining(&self) -> Duration {
        let next = self.inner.next.lock().unwrap();
        next.saturating_duration_since(Instant::now())
    }
}

// ===== impl IntervalTask =====

impl IntervalTask {
    /// Spawns a task that calls `cb` every time `interval` elapses.
    ///
    /// When `tick_on_start` is false the first tick is delayed by one full
    /// interval, matching the VRRP Master state's advertisement cadence
    /// (the first advertisement is sent immediately on entry by the caller,
    /// not by this timer).
    pub fn new<F, Fut>(
        interval: Duration,
        tick_on_start: bool,
        mut cb: F,
    ) -> IntervalTask
    where
        F: FnMut() -> Fut + 'static,
        Fut: Future<Output = ()>,
    {
        let (control_tx, mut control_rx) = mpsc::unbounded_channel();

        let next = Instant::now() + interval;
        let next = Arc::new(Mutex::new(next));
        let next_child = next.clone();

        let task = Task::spawn(
            async move {
                let mut interval_fut = if tick_on_start {
                    time::interval(interval)
                } else {
                    let start = Instant::now() + interval;
                    time::interval_at(start, interval)
                };

                loop {
                    tokio::select! {
                        _ = interval_fut.tick() => {
                            let next = Instant::now() + interval;
                            (cb)().await;
                            *next_child.lock().unwrap() = next;
                        }
                        message = control_rx.recv() => {
                            match message {
                                Some(Message::Reset(None)) => {
                                    let next = Instant::now() + interval;
                                    interval_fut = time::interval(interval);
                                    *next_child.lock().unwrap() = next;
                                },
                                Some(Message::Reset(Some(new_interval))) => {
                                    let next = Instant::now() + new_interval;
                                    interval_fut = time::interval(new_interval);
                                    *next_child.lock().unwrap() = next;
                                },
                                None => break,
                            }
                        }
                    }
                }
            }
            .in_current_span(),
        );

        IntervalTask {
            inner: IntervalTaskInner {
                _task: task,
                control: control_tx,
                next,
            },
        }
    }

    /// Resets the interval, reusing the last duration when `interval` is
    /// `None`.
    pub fn reset(&mut self, interval: Option<Duration>) {
        if self.inner.control.send(Message::Reset(interval)).is_err() {
            error!("failed to reset interval");
        }
    }

    /// Returns the time remaining before the next tick.
    pub fn remaining(&self) -> Duration {
        let next = self.inner.next.lock().unwrap();
        next.saturating_duration_since(Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn timeout_fires_once() {
        tokio::task::LocalSet::new()
            .run_until(async {
                let (tx, mut rx) = mpsc::unbounded_channel::<()>();
                let _timer = TimeoutTask::new(Duration::from_millis(10), move || {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send(());
                    }
                });
                tokio::time::sleep(Duration::from_millis(50)).await;
                assert!(rx.try_recv().is_ok());
            })
            .await;
    }

    #[tokio::test]
    async fn interval_ticks_repeatedly() {
        tokio::task::LocalSet::new()
            .run_until(async {
                let (tx, mut rx) = mpsc::unbounded_channel::<()>();
                let _timer = IntervalTask::new(
                    Duration::from_millis(10),
                    true,
                    move || {
                        let tx = tx.clone();
                        async move {
                            let _ = tx.send(());
                        }
                    },
                );
                tokio::time::sleep(Duration::from_millis(55)).await;
                let mut count = 0;
                while rx.try_recv().is_ok() {
                    count += 1;
                }
                assert!(count >= 3);
            })
            .await;
    }
}
