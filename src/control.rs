//! Cooperative cancellation and progress reporting for long stages
//!
//! Work units (a channel, an epoch) are committed only when they finish
//! before the token is cancelled. An interrupted unit is dropped, so a
//! cancelled result only ever contains complete units.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub use tokio_util::sync::CancellationToken;

/// Progress callback: `(completed_units, total_units)`
pub type ProgressFn = Arc<dyn Fn(usize, usize) + Send + Sync>;

/// Whether a stage ran to completion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Completion {
    Complete,
    Cancelled { completed: usize, total: usize },
}

impl Completion {
    pub fn is_complete(&self) -> bool {
        matches!(self, Completion::Complete)
    }
}

/// Execution controls threaded through long-running operations
#[derive(Clone)]
pub struct RunControl {
    pub cancel: CancellationToken,
    /// Fan out channels/epochs over the rayon pool
    pub parallel: bool,
    pub progress: Option<ProgressFn>,
}

impl Default for RunControl {
    fn default() -> Self {
        Self {
            cancel: CancellationToken::new(),
            parallel: true,
            progress: None,
        }
    }
}

impl std::fmt::Debug for RunControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunControl")
            .field("cancelled", &self.cancel.is_cancelled())
            .field("parallel", &self.parallel)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

impl RunControl {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            ..Default::default()
        }
    }

    pub fn sequential(mut self) -> Self {
        self.parallel = false;
        self
    }

    pub fn with_progress<F>(mut self, progress: F) -> Self
    where
        F: Fn(usize, usize) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(progress));
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Run `work` for every index in `0..total`, writing each outcome into
    /// its own pre-allocated slot.
    ///
    /// `work` receives the cancellation token so it can abandon a unit
    /// between chunks by returning `None`. A unit that completes after
    /// cancellation is discarded as well.
    pub(crate) fn fan_out<T, F>(&self, total: usize, work: F) -> (Vec<Option<T>>, Completion)
    where
        T: Send,
        F: Fn(usize, &CancellationToken) -> Option<T> + Sync + Send,
    {
        let mut slots: Vec<Option<T>> = Vec::with_capacity(total);
        slots.resize_with(total, || None);
        let done = AtomicUsize::new(0);

        let run_one = |idx: usize, slot: &mut Option<T>| {
            if self.cancel.is_cancelled() {
                return;
            }
            let outcome = work(idx, &self.cancel);
            if self.cancel.is_cancelled() {
                return;
            }
            if let Some(value) = outcome {
                *slot = Some(value);
                let completed = done.fetch_add(1, Ordering::SeqCst) + 1;
                if let Some(progress) = &self.progress {
                    progress(completed, total);
                }
            }
        };

        if self.parallel {
            slots
                .par_iter_mut()
                .enumerate()
                .for_each(|(idx, slot)| run_one(idx, slot));
        } else {
            slots
                .iter_mut()
                .enumerate()
                .for_each(|(idx, slot)| run_one(idx, slot));
        }

        let completed = done.load(Ordering::SeqCst);
        let completion = if self.cancel.is_cancelled() && completed < total {
            log::info!("Cancelled after {}/{} units", completed, total);
            Completion::Cancelled { completed, total }
        } else {
            Completion::Complete
        };
        (slots, completion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fan_out_fills_every_slot() {
        let control = RunControl::default();
        let (slots, completion) = control.fan_out(8, |i, _| Some(i * 2));
        assert!(completion.is_complete());
        let values: Vec<usize> = slots.into_iter().flatten().collect();
        assert_eq!(values, vec![0, 2, 4, 6, 8, 10, 12, 14]);
    }

    #[test]
    fn test_fan_out_stops_after_cancel() {
        let token = CancellationToken::new();
        let trigger = token.clone();
        let control = RunControl::new(token)
            .sequential()
            .with_progress(move |done, _| {
                if done == 3 {
                    trigger.cancel();
                }
            });

        let (slots, completion) = control.fan_out(10, |i, _| Some(i));
        assert_eq!(
            completion,
            Completion::Cancelled {
                completed: 3,
                total: 10
            }
        );
        assert_eq!(slots.iter().filter(|s| s.is_some()).count(), 3);
        assert!(slots[3..].iter().all(|s| s.is_none()));
    }
}
