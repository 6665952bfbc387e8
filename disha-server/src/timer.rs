//! Deferred-task scheduling on a single worker thread.
//!
//! One `TimerQueue` serves the whole process: link-request expiry, rate
//! limiter eviction and per-session idle checks all run here. A task is a
//! closure returning `Option<Duration>`: `Some(delay)` re-arms it after
//! `delay`, `None` retires it. Tasks run outside the queue lock, so a
//! task may call back into `schedule`; firing is cooperative and never
//! preempts an in-progress handler.

use log::debug;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

type TimerTask = Box<dyn FnMut() -> Option<Duration> + Send>;

struct Entry {
    deadline: Instant,
    seq: u64,
    task: TimerTask,
}

// Min-heap by deadline; seq breaks ties in scheduling order.
impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct State {
    entries: BinaryHeap<Entry>,
    next_seq: u64,
    stopped: bool,
}

struct Shared {
    state: Mutex<State>,
    wakeup: Condvar,
}

pub struct TimerQueue {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TimerQueue {
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                entries: BinaryHeap::new(),
                next_seq: 0,
                stopped: false,
            }),
            wakeup: Condvar::new(),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("timer-queue".to_string())
            .spawn(move || Self::worker_loop(&worker_shared))
            .expect("failed to spawn timer-queue thread");

        Self {
            shared,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Arm `task` to run once after `delay`. The task re-arms itself by
    /// returning the next delay.
    pub fn schedule<F>(&self, delay: Duration, task: F)
    where
        F: FnMut() -> Option<Duration> + Send + 'static,
    {
        let mut state = self.shared.state.lock();
        if state.stopped {
            debug!("timer queue stopped, task dropped");
            return;
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.entries.push(Entry {
            deadline: Instant::now() + delay,
            seq,
            task: Box::new(task),
        });
        drop(state);
        self.shared.wakeup.notify_one();
    }

    /// Stop the worker and drop all pending tasks. Idempotent.
    pub fn stop(&self) {
        {
            let mut state = self.shared.state.lock();
            state.stopped = true;
            state.entries.clear();
        }
        self.shared.wakeup.notify_one();
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }

    fn worker_loop(shared: &Shared) {
        let mut state = shared.state.lock();
        loop {
            if state.stopped {
                break;
            }

            let next_deadline = state.entries.peek().map(|entry| entry.deadline);
            match next_deadline {
                None => {
                    shared.wakeup.wait(&mut state);
                    continue;
                }
                Some(deadline) if deadline > Instant::now() => {
                    let _ = shared.wakeup.wait_until(&mut state, deadline);
                    continue;
                }
                Some(_) => {}
            }

            if let Some(mut entry) = state.entries.pop() {
                // run the task with the queue unlocked so it can schedule
                let next = MutexGuard::unlocked(&mut state, || (entry.task)());
                if let Some(delay) = next {
                    if !state.stopped {
                        entry.deadline = Instant::now() + delay;
                        entry.seq = state.next_seq;
                        state.next_seq += 1;
                        state.entries.push(entry);
                    }
                }
            }
        }
    }
}

impl Default for TimerQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TimerQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_one_shot_task_fires_once() {
        let timers = TimerQueue::new();
        let (tx, rx) = mpsc::channel();
        timers.schedule(Duration::from_millis(10), move || {
            tx.send(()).ok();
            None
        });

        assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        timers.stop();
    }

    #[test]
    fn test_task_reschedules_itself() {
        let timers = TimerQueue::new();
        let (tx, rx) = mpsc::channel();
        let mut remaining = 3u32;
        timers.schedule(Duration::from_millis(5), move || {
            tx.send(()).ok();
            remaining -= 1;
            (remaining > 0).then(|| Duration::from_millis(5))
        });

        for _ in 0..3 {
            assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
        }
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        timers.stop();
    }

    #[test]
    fn test_tasks_fire_in_deadline_order() {
        let timers = TimerQueue::new();
        let (tx, rx) = mpsc::channel();
        let tx2 = tx.clone();
        timers.schedule(Duration::from_millis(60), move || {
            tx.send("late").ok();
            None
        });
        timers.schedule(Duration::from_millis(10), move || {
            tx2.send("early").ok();
            None
        });

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)), Ok("early"));
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)), Ok("late"));
        timers.stop();
    }

    #[test]
    fn test_stop_drops_pending_tasks() {
        let timers = TimerQueue::new();
        let (tx, rx) = mpsc::channel();
        timers.schedule(Duration::from_millis(200), move || {
            tx.send(()).ok();
            None
        });
        timers.stop();
        assert!(rx.recv_timeout(Duration::from_millis(400)).is_err());
    }
}
