//! Heavy-task semaphore
//!
//! Counting semaphore bounding how many memory-hungry operations run at
//! once. Only names in [`HEAVY_TASKS`] are throttled; a slot is held by a
//! [`HeavyTaskPermit`] and returned when the permit is released or dropped,
//! so every exit path (including unwinding) gives the slot back.

use crate::error::{ResourceError, Result};
use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Operations considered heavy (high memory/compute cost).
pub const HEAVY_TASKS: &[&str] = &[
    "semantic_redundancy",
    "embeddings_full",
    "coreference_resolution",
    "llm_analysis",
    "spacy_full_pipeline",
];

pub fn is_heavy_task(name: &str) -> bool {
    HEAVY_TASKS.contains(&name)
}

struct Slots {
    max_concurrent: usize,
    active: Vec<String>,
}

pub struct HeavyTaskSemaphore {
    slots: Mutex<Slots>,
    freed: Condvar,
}

impl HeavyTaskSemaphore {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            slots: Mutex::new(Slots {
                max_concurrent: max_concurrent.max(1),
                active: Vec::new(),
            }),
            freed: Condvar::new(),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.slots.lock().max_concurrent
    }

    /// Resize in place. Outstanding permits keep their slots; when shrinking,
    /// new acquirers wait until the holders drop below the new bound.
    pub fn set_max_concurrent(&self, max_concurrent: usize) {
        let mut slots = self.slots.lock();
        let previous = slots.max_concurrent;
        slots.max_concurrent = max_concurrent.max(1);
        let current = slots.max_concurrent;
        drop(slots);

        if current != previous {
            debug!("Heavy task slots resized: {} -> {}", previous, current);
            self.freed.notify_all();
        }
    }

    /// Wait for a slot. `None` waits forever; `Some(d)` fails with
    /// [`ResourceError::Timeout`] once `d` has elapsed.
    pub fn acquire(&self, task: &str, timeout: Option<Duration>) -> Result<HeavyTaskPermit<'_>> {
        if !is_heavy_task(task) {
            return Err(ResourceError::NotHeavyTask(task.to_string()));
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        let mut slots = self.slots.lock();

        while slots.active.len() >= slots.max_concurrent {
            match deadline {
                Some(deadline) => {
                    if self.freed.wait_until(&mut slots, deadline).timed_out()
                        && slots.active.len() >= slots.max_concurrent
                    {
                        let active_now = slots.active.clone();
                        drop(slots);
                        warn!("Timeout waiting for resources for: {}", task);
                        return Err(ResourceError::Timeout {
                            task: task.to_string(),
                            timeout_ms: timeout.map_or(0, |t| t.as_millis() as u64),
                            active: active_now,
                        });
                    }
                }
                None => self.freed.wait(&mut slots),
            }
        }

        slots.active.push(task.to_string());
        debug!(
            "Heavy task started: {} ({}/{})",
            task,
            slots.active.len(),
            slots.max_concurrent
        );

        Ok(HeavyTaskPermit {
            semaphore: self,
            task: task.to_string(),
            released: false,
        })
    }

    /// Non-blocking acquire.
    pub fn try_acquire(&self, task: &str) -> Result<HeavyTaskPermit<'_>> {
        self.acquire(task, Some(Duration::ZERO))
    }

    /// Names of tasks currently holding a slot.
    pub fn active_tasks(&self) -> Vec<String> {
        self.slots.lock().active.clone()
    }

    pub fn available_slots(&self) -> usize {
        let slots = self.slots.lock();
        slots.max_concurrent.saturating_sub(slots.active.len())
    }

    fn release_slot(&self, task: &str) {
        let mut slots = self.slots.lock();
        if let Some(pos) = slots.active.iter().position(|t| t == task) {
            slots.active.remove(pos);
        }
        drop(slots);
        self.freed.notify_one();
        debug!("Heavy task finished: {}", task);
    }
}

impl std::fmt::Debug for HeavyTaskSemaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slots = self.slots.lock();
        f.debug_struct("HeavyTaskSemaphore")
            .field("max_concurrent", &slots.max_concurrent)
            .field("active", &slots.active)
            .finish()
    }
}

/// A held heavy-task slot.
#[derive(Debug)]
#[must_use = "the slot is released as soon as the permit is dropped"]
pub struct HeavyTaskPermit<'a> {
    semaphore: &'a HeavyTaskSemaphore,
    task: String,
    released: bool,
}

impl HeavyTaskPermit<'_> {
    pub fn task(&self) -> &str {
        &self.task
    }

    /// Release explicitly (dropping the permit does the same).
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.released = true;
            self.semaphore.release_slot(&self.task);
        }
    }
}

impl Drop for HeavyTaskPermit<'_> {
    fn drop(&mut self) {
        self.release_inner();
    }
}
