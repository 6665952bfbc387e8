//! Per-address admission filter for control requests.
//!
//! Each remote IP gets one free request, then has to wait out the
//! configured minimum interval. A request may declare one expected
//! follow-up message id; that exact id is admitted once without waiting,
//! which is how a monitor's `MonitorLinkRequest` can be chased
//! immediately by its `StreamOpenRequest` on the same connection.
//!
//! Expiry walks an insertion-ordered list and stops at the first entry
//! that has not aged out yet. That early return is only correct because
//! `Instant::now()` is monotone within the process, so first-seen times
//! are non-decreasing along the list.

use crate::timer::TimerQueue;
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::hash_map::Entry::{Occupied, Vacant};
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct RequestEntry {
    first_seen: Instant,
    /// Message id admitted once without an interval check; 0 = none.
    follow_up: u16,
}

#[derive(Default)]
struct Inner {
    by_addr: HashMap<IpAddr, RequestEntry>,
    order: VecDeque<IpAddr>,
}

pub struct RateLimiter {
    min_interval: Duration,
    inner: Mutex<Inner>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Admit or reject a request from `addr`. `follow_up` names the one
    /// message id the same address may send next without waiting (0 for
    /// none). Arms the eviction timer when the first entry appears.
    pub fn check(
        self: &Arc<Self>,
        timers: &TimerQueue,
        addr: IpAddr,
        message_id: u16,
        follow_up: u16,
    ) -> bool {
        let now = Instant::now();
        let (allowed, arm_timer) = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            match inner.by_addr.entry(addr) {
                Occupied(mut slot) => {
                    let entry = slot.get_mut();
                    if entry.follow_up == message_id {
                        entry.follow_up = 0;
                        (true, false)
                    } else {
                        (
                            now.saturating_duration_since(entry.first_seen)
                                >= self.min_interval,
                            false,
                        )
                    }
                }
                Vacant(slot) => {
                    let arm_timer = inner.order.is_empty();
                    slot.insert(RequestEntry {
                        first_seen: now,
                        follow_up,
                    });
                    inner.order.push_back(addr);
                    (true, arm_timer)
                }
            }
        };

        if arm_timer {
            debug!(
                "rate limiter: arming eviction timer @ {:?}",
                self.min_interval
            );
            let limiter = Arc::downgrade(self);
            timers.schedule(self.min_interval, move || {
                limiter.upgrade().and_then(|l| l.evict_expired())
            });
        }

        if !allowed {
            warn!("exceeded request rate from {}, message {}", addr, message_id);
        }
        allowed
    }

    /// Drop entries older than the minimum interval; returns the delay
    /// until the next survivor expires, or `None` to let the timer stop.
    fn evict_expired(&self) -> Option<Duration> {
        let now = Instant::now();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        while let Some(&addr) = inner.order.front() {
            let remaining = inner.by_addr.get(&addr).and_then(|entry| {
                let age = now.saturating_duration_since(entry.first_seen);
                (age < self.min_interval).then(|| self.min_interval - age)
            });
            match remaining {
                Some(delay) => return Some(delay),
                None => {
                    inner.by_addr.remove(&addr);
                    inner.order.pop_front();
                }
            }
        }
        None
    }
}
