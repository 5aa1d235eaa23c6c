//! Iteration/duration bounded execution loop
//!
//! Repeats an operation, folds its results with an [`Accumulator`], and runs
//! an optional cleanup callback exactly once however the loop ends.

use crate::cancel::{CancellationToken, POLL_QUANTUM};
use crate::error::is_cancellation;
use crate::util::units::format_duration;
use crate::{DiskPakError, Result};
use std::collections::HashMap;
use std::hash::Hash;
use std::ops::AddAssign;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// Loop bounds; `None` means unbounded
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopSpec {
    pub iterations: Option<u64>,
    pub duration: Option<Duration>,
}

impl LoopSpec {
    /// Negative values mean unbounded
    pub fn from_raw(iterations: i64, duration_secs: f64) -> Self {
        Self {
            iterations: u64::try_from(iterations).ok(),
            duration: (duration_secs >= 0.0 && duration_secs.is_finite())
                .then(|| Duration::from_secs_f64(duration_secs)),
        }
    }

    pub fn iterations(n: u64) -> Self {
        Self {
            iterations: Some(n),
            duration: None,
        }
    }

    pub fn duration(d: Duration) -> Self {
        Self {
            iterations: None,
            duration: Some(d),
        }
    }

    pub fn with_iterations(mut self, n: Option<u64>) -> Self {
        self.iterations = n;
        self
    }

    pub fn with_duration(mut self, d: Option<Duration>) -> Self {
        self.duration = d;
        self
    }

    pub fn is_unbounded(&self) -> bool {
        self.iterations.is_none() && self.duration.is_none()
    }
}

/// How per-iteration results are combined
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultMode {
    /// Keep the last result
    Singleton,
    /// Sum results
    Accumulate,
    /// Collect results in order
    Append,
    /// Merge maps; later keys overwrite earlier ones
    Map,
}

pub trait Accumulator<T> {
    type Output;

    fn mode(&self) -> ResultMode;
    fn push(&mut self, value: T);
    fn finish(self) -> Self::Output;
}

#[derive(Debug)]
pub struct Singleton<T>(Option<T>);

impl<T> Default for Singleton<T> {
    fn default() -> Self {
        Self(None)
    }
}

impl<T> Accumulator<T> for Singleton<T> {
    type Output = Option<T>;

    fn mode(&self) -> ResultMode {
        ResultMode::Singleton
    }

    fn push(&mut self, value: T) {
        self.0 = Some(value);
    }

    fn finish(self) -> Option<T> {
        self.0
    }
}

#[derive(Debug, Default)]
pub struct Sum<T>(T);

impl<T: AddAssign> Accumulator<T> for Sum<T> {
    type Output = T;

    fn mode(&self) -> ResultMode {
        ResultMode::Accumulate
    }

    fn push(&mut self, value: T) {
        self.0 += value;
    }

    fn finish(self) -> T {
        self.0
    }
}

#[derive(Debug)]
pub struct Append<T>(Vec<T>);

impl<T> Default for Append<T> {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<T> Accumulator<T> for Append<T> {
    type Output = Vec<T>;

    fn mode(&self) -> ResultMode {
        ResultMode::Append
    }

    fn push(&mut self, value: T) {
        self.0.push(value);
    }

    fn finish(self) -> Vec<T> {
        self.0
    }
}

#[derive(Debug)]
pub struct MapMerge<K, V>(HashMap<K, V>);

impl<K, V> Default for MapMerge<K, V> {
    fn default() -> Self {
        Self(HashMap::new())
    }
}

impl<K: Eq + Hash, V> Accumulator<HashMap<K, V>> for MapMerge<K, V> {
    type Output = HashMap<K, V>;

    fn mode(&self) -> ResultMode {
        ResultMode::Map
    }

    fn push(&mut self, value: HashMap<K, V>) {
        self.0.extend(value);
    }

    fn finish(self) -> HashMap<K, V> {
        self.0
    }
}

/// Why a loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    IterationLimit,
    DurationLimit,
    /// The token was set by someone else, or the operation reported cancellation
    Cancelled,
}

#[derive(Debug)]
pub struct LoopOutcome<O> {
    pub result: O,
    pub iterations: u64,
    pub elapsed: Duration,
    pub stop: StopReason,
}

/// Runs the cleanup callback on drop, so it also runs on error and panic
struct CleanupGuard<'a>(Option<Box<dyn FnOnce() + 'a>>);

impl Drop for CleanupGuard<'_> {
    fn drop(&mut self) {
        if let Some(cleanup) = self.0.take() {
            cleanup();
        }
    }
}

/// Background countdown that sets the token when the duration expires
struct Countdown {
    done: Arc<AtomicBool>,
    expired: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Countdown {
    fn start(duration: Duration, cancel: &CancellationToken) -> Self {
        let done = Arc::new(AtomicBool::new(false));
        let expired = Arc::new(AtomicBool::new(false));
        let token = cancel.clone();
        let (done_flag, expired_flag) = (done.clone(), expired.clone());
        let handle = std::thread::spawn(move || {
            let deadline = Instant::now() + duration;
            while !done_flag.load(Ordering::SeqCst) && !token.is_cancelled() {
                let now = Instant::now();
                if now >= deadline {
                    expired_flag.store(true, Ordering::SeqCst);
                    token.cancel();
                    return;
                }
                std::thread::sleep(POLL_QUANTUM.min(deadline - now));
            }
        });
        Self {
            done,
            expired,
            handle: Some(handle),
        }
    }

    fn expired(&self) -> bool {
        self.expired.load(Ordering::SeqCst)
    }
}

impl Drop for Countdown {
    fn drop(&mut self) {
        self.done.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Repeats an operation under a [`LoopSpec`]
pub struct LoopController<'a> {
    description: String,
    cancel: CancellationToken,
    cleanup: Option<Box<dyn FnOnce() + 'a>>,
}

impl<'a> LoopController<'a> {
    pub fn new(description: impl Into<String>, cancel: &CancellationToken) -> Self {
        Self {
            description: description.into(),
            cancel: cancel.clone(),
            cleanup: None,
        }
    }

    /// Callback run exactly once when the loop ends, however it ends
    pub fn with_cleanup(mut self, cleanup: impl FnOnce() + 'a) -> Self {
        self.cleanup = Some(Box::new(cleanup));
        self
    }

    /// Iterations win over duration; with neither bound, run until cancelled.
    pub fn run_bounded<T, A, F>(self, spec: LoopSpec, mut acc: A, mut op: F) -> Result<LoopOutcome<A::Output>>
    where
        A: Accumulator<T>,
        F: FnMut() -> Result<T>,
    {
        let _cleanup = CleanupGuard(self.cleanup);
        info!(
            "{}: looping {} with {:?} results",
            self.description,
            describe(&spec),
            acc.mode()
        );

        let start = Instant::now();
        let mut done = 0u64;
        let stop = loop {
            if self.cancel.is_cancelled() {
                break StopReason::Cancelled;
            }
            match (spec.iterations, spec.duration) {
                (Some(n), _) if done >= n => break StopReason::IterationLimit,
                (None, Some(d)) if start.elapsed() >= d => break StopReason::DurationLimit,
                _ => {}
            }
            match run_once(&self.description, done, &mut op)? {
                Some(value) => acc.push(value),
                None => break StopReason::Cancelled,
            }
            done += 1;
        };

        Ok(finish(&self.description, acc, done, start, stop))
    }

    /// Stop at whichever bound is hit first; at least one bound is required.
    ///
    /// The duration bound is enforced by a timer thread that sets the token,
    /// and reaching the iteration bound sets the token too, so anything else
    /// watching it stops along with the loop.
    pub fn run_either<T, A, F>(self, spec: LoopSpec, mut acc: A, mut op: F) -> Result<LoopOutcome<A::Output>>
    where
        A: Accumulator<T>,
        F: FnMut() -> Result<T>,
    {
        let _cleanup = CleanupGuard(self.cleanup);
        if spec.is_unbounded() {
            return Err(DiskPakError::InvalidConfiguration(
                "Either iterations or duration must be bounded".to_string(),
            ));
        }
        info!(
            "{}: looping {} (whichever first) with {:?} results",
            self.description,
            describe(&spec),
            acc.mode()
        );

        let countdown = spec.duration.map(|d| Countdown::start(d, &self.cancel));
        let start = Instant::now();
        let mut done = 0u64;
        let stop = loop {
            if self.cancel.is_cancelled() {
                break StopReason::Cancelled;
            }
            if spec.iterations.is_some_and(|n| done >= n) {
                self.cancel.cancel();
                break StopReason::IterationLimit;
            }
            match run_once(&self.description, done, &mut op)? {
                Some(value) => acc.push(value),
                None => break StopReason::Cancelled,
            }
            done += 1;
        };
        let stop = match (&countdown, stop) {
            (Some(timer), StopReason::Cancelled) if timer.expired() => StopReason::DurationLimit,
            (_, stop) => stop,
        };
        drop(countdown);

        Ok(finish(&self.description, acc, done, start, stop))
    }
}

/// `Ok(None)` when the operation reported cancellation
fn run_once<T, F>(description: &str, index: u64, op: &mut F) -> Result<Option<T>>
where
    F: FnMut() -> Result<T>,
{
    debug!("{}: iteration {}", description, index + 1);
    match op() {
        Ok(value) => Ok(Some(value)),
        Err(e) if is_cancellation(&e) => {
            info!("{}: operation cancelled: {}", description, e);
            Ok(None)
        }
        Err(e) => {
            error!("{}: iteration {} failed: {}", description, index + 1, e);
            Err(e)
        }
    }
}

fn finish<T, A: Accumulator<T>>(
    description: &str,
    acc: A,
    iterations: u64,
    start: Instant,
    stop: StopReason,
) -> LoopOutcome<A::Output> {
    let elapsed = start.elapsed();
    info!(
        "{}: {} iteration(s) in {}, stopped by {:?}",
        description,
        iterations,
        format_duration(elapsed),
        stop
    );
    LoopOutcome {
        result: acc.finish(),
        iterations,
        elapsed,
        stop,
    }
}

fn describe(spec: &LoopSpec) -> String {
    match (spec.iterations, spec.duration) {
        (Some(n), Some(d)) => format!("{} iterations / {}", n, format_duration(d)),
        (Some(n), None) => format!("{} iterations", n),
        (None, Some(d)) => format!("for {}", format_duration(d)),
        (None, None) => "until cancelled".to_string(),
    }
}
