//! Throughput probe
//!
//! Times repeated appends of buffers across a ladder of sizes and keeps the
//! size with the highest write rate.

use crate::cancel::CancellationToken;
use crate::error::is_cancellation;
use crate::io::disk::DiskIO;
use crate::pattern::{generate, BufferSource, FillPolicy, PatternBuffer};
use crate::util::units::{calculate_throughput_mbps, format_bytes, format_duration};
use crate::{DiskPakError, Result, KB};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// One measured candidate
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThroughputSample {
    pub candidate_size_bytes: u64,
    pub rate_mb_per_sec: f64,
    pub elapsed: Duration,
}

/// Winning buffer plus every sample taken
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub buffer: PatternBuffer,
    pub rate_mb_per_sec: f64,
    pub samples: Vec<ThroughputSample>,
}

/// Candidate sizes in bytes, ascending: {1, 4, 16} KiB and the same in MiB,
/// plus two and three times each.
pub fn candidate_ladder() -> Vec<u64> {
    let mut kib: Vec<u64> = vec![1, 4, 16];
    kib.extend([1, 4, 16].iter().map(|k| k * 1024));
    let scaled: Vec<u64> = kib.iter().flat_map(|k| [k * 2, k * 3]).collect();
    kib.extend(scaled);
    kib.sort_unstable();
    kib.dedup();
    kib.into_iter().map(|k| k * KB).collect()
}

/// Index of the highest rate; ties keep the earliest (smallest) candidate.
pub fn select_sweet_spot(samples: &[ThroughputSample]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (i, sample) in samples.iter().enumerate() {
        match best {
            Some(b) if sample.rate_mb_per_sec <= samples[b].rate_mb_per_sec => {}
            _ => best = Some(i),
        }
    }
    best
}

/// Something that can time writes of a buffer
pub trait RateMeter {
    fn measure(
        &mut self,
        buffer: &PatternBuffer,
        cancel: &CancellationToken,
    ) -> Result<ThroughputSample>;
}

/// How long each candidate is measured
#[derive(Debug, Clone, Copy)]
pub struct ProbeBudget {
    /// Minimum appends per candidate
    pub min_repetitions: u32,
    /// Minimum time per candidate
    pub min_elapsed: Duration,
}

impl Default for ProbeBudget {
    fn default() -> Self {
        Self {
            min_repetitions: 5,
            min_elapsed: Duration::from_millis(6900),
        }
    }
}

/// Appends to a scratch file next to the data file, removed after each candidate
pub struct DiskRateMeter<'a> {
    disk: &'a dyn DiskIO,
    scratch_path: PathBuf,
    budget: ProbeBudget,
}

impl<'a> DiskRateMeter<'a> {
    pub fn new(disk: &'a dyn DiskIO, data_path: &Path, budget: ProbeBudget) -> Self {
        let dir = data_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let scratch_path = dir.join(format!("DISKPAK_probe_{}.dat", std::process::id()));
        Self {
            disk,
            scratch_path,
            budget,
        }
    }

    fn append_until_budget(
        &self,
        buffer: &PatternBuffer,
        cancel: &CancellationToken,
    ) -> Result<(u64, Duration)> {
        let mut file = self.disk.open_append(&self.scratch_path)?;
        let start = Instant::now();
        let mut written = 0u64;
        let mut repetitions = 0u32;
        loop {
            let outcome = file.write_chunk(buffer.as_bytes())?;
            written += outcome.bytes() as u64;
            repetitions += 1;
            let elapsed = start.elapsed();
            if outcome.is_disk_full() {
                warn!("disk full while probing {}", format_bytes(buffer.len() as u64));
                return Ok((written, elapsed));
            }
            if cancel.is_cancelled()
                || (repetitions >= self.budget.min_repetitions
                    && elapsed > self.budget.min_elapsed)
            {
                return Ok((written, elapsed));
            }
        }
    }
}

impl RateMeter for DiskRateMeter<'_> {
    fn measure(
        &mut self,
        buffer: &PatternBuffer,
        cancel: &CancellationToken,
    ) -> Result<ThroughputSample> {
        let measured = self.append_until_budget(buffer, cancel);
        if let Err(e) = self.disk.remove(&self.scratch_path) {
            debug!("could not remove probe scratch file: {}", e);
        }
        let (written, elapsed) = measured?;
        Ok(ThroughputSample {
            candidate_size_bytes: buffer.len() as u64,
            rate_mb_per_sec: calculate_throughput_mbps(written, elapsed),
            elapsed,
        })
    }
}

/// Probe the full candidate ladder against the disk holding `data_path`
pub fn find_best_chunk(
    disk: &dyn DiskIO,
    data_path: &Path,
    fill: FillPolicy,
    budget: ProbeBudget,
    cancel: &CancellationToken,
) -> Result<ProbeOutcome> {
    let mut meter = DiskRateMeter::new(disk, data_path, budget);
    probe_ladder(&mut meter, &candidate_ladder(), fill, cancel)
}

/// Measure each size in `ladder` and return the sweet spot.
///
/// Stops between candidates once cancelled; the best sample so far still
/// wins, and cancelling before any sample is an error.
pub fn probe_ladder(
    meter: &mut dyn RateMeter,
    ladder: &[u64],
    fill: FillPolicy,
    cancel: &CancellationToken,
) -> Result<ProbeOutcome> {
    let mut samples = Vec::with_capacity(ladder.len());
    let mut best: Option<(usize, PatternBuffer)> = None;

    for (k, &size) in ladder.iter().enumerate() {
        if cancel.is_cancelled() {
            break;
        }
        debug!("{} / {} - {}", k + 1, ladder.len(), format_bytes(size));
        let measured = generate(size, fill, cancel)
            .and_then(|buffer| meter.measure(&buffer, cancel).map(|sample| (buffer, sample)));
        let (buffer, sample) = match measured {
            Ok(pair) => pair,
            Err(e) if is_cancellation(&e) && best.is_some() => {
                debug!("probe interrupted at {}", format_bytes(size));
                break;
            }
            Err(e) => return Err(e),
        };
        info!(
            "{} / {} - {} - {:.3} MiB/s over {}",
            k + 1,
            ladder.len(),
            format_bytes(size),
            sample.rate_mb_per_sec,
            format_duration(sample.elapsed)
        );
        samples.push(sample);

        // Only the current winner's buffer is kept alive
        if select_sweet_spot(&samples) == Some(samples.len() - 1) {
            best = Some((samples.len() - 1, buffer));
        }
    }

    let (index, buffer) = best.ok_or_else(|| {
        DiskPakError::Cancelled("Throughput probe stopped before any candidate was measured".to_string())
    })?;
    let rate = samples[index].rate_mb_per_sec;
    info!(
        "{} - {:.3} MiB/s - sweet spot",
        format_bytes(buffer.len() as u64),
        rate
    );
    Ok(ProbeOutcome {
        buffer: buffer.with_source(BufferSource::Probed),
        rate_mb_per_sec: rate,
        samples,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::memory::MemoryDiskIO;
    use crate::MB;

    /// Replays fixed rates in order
    struct ScriptedMeter {
        rates: Vec<f64>,
        calls: usize,
    }

    impl RateMeter for ScriptedMeter {
        fn measure(
            &mut self,
            buffer: &PatternBuffer,
            _cancel: &CancellationToken,
        ) -> Result<ThroughputSample> {
            let rate = self.rates[self.calls];
            self.calls += 1;
            Ok(ThroughputSample {
                candidate_size_bytes: buffer.len() as u64,
                rate_mb_per_sec: rate,
                elapsed: Duration::from_secs(1),
            })
        }
    }

    fn sample(rate: f64) -> ThroughputSample {
        ThroughputSample {
            candidate_size_bytes: 0,
            rate_mb_per_sec: rate,
            elapsed: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_candidate_ladder() {
        let ladder = candidate_ladder();
        let kib: Vec<u64> = ladder.iter().map(|b| b / KB).collect();
        assert_eq!(
            kib,
            vec![
                1, 2, 3, 4, 8, 12, 16, 32, 48, 1024, 2048, 3072, 4096, 8192, 12288, 16384,
                32768, 49152
            ]
        );
    }

    #[test]
    fn test_select_sweet_spot() {
        let samples: Vec<_> = [10.0, 50.0, 30.0, 80.0, 20.0].map(sample).to_vec();
        assert_eq!(select_sweet_spot(&samples), Some(3));
        assert_eq!(select_sweet_spot(&[]), None);

        // Ties keep the smaller candidate
        let samples: Vec<_> = [40.0, 40.0, 10.0].map(sample).to_vec();
        assert_eq!(select_sweet_spot(&samples), Some(0));
    }

    #[test]
    fn test_probe_with_injected_rates() {
        let mut meter = ScriptedMeter {
            rates: vec![10.0, 50.0, 30.0, 80.0, 20.0],
            calls: 0,
        };
        let ladder = [KB, 2 * KB, 3 * KB, 4 * KB, 8 * KB];
        let outcome =
            probe_ladder(&mut meter, &ladder, FillPolicy::Constant(1), &CancellationToken::new())
                .unwrap();

        assert_eq!(outcome.buffer.len() as u64, 4 * KB);
        assert_eq!(outcome.rate_mb_per_sec, 80.0);
        assert_eq!(outcome.samples.len(), 5);
        assert_eq!(outcome.buffer.source(), BufferSource::Probed);
        assert_eq!(outcome.buffer.fill(), FillPolicy::Constant(1));
    }

    /// Reports `rate` once, then behaves as if cancelled mid-measurement
    struct InterruptedMeter {
        rate: f64,
        calls: usize,
    }

    impl RateMeter for InterruptedMeter {
        fn measure(
            &mut self,
            buffer: &PatternBuffer,
            _cancel: &CancellationToken,
        ) -> Result<ThroughputSample> {
            self.calls += 1;
            if self.calls > 1 {
                return Err(DiskPakError::Cancelled("measurement interrupted".to_string()));
            }
            Ok(ThroughputSample {
                candidate_size_bytes: buffer.len() as u64,
                rate_mb_per_sec: self.rate,
                elapsed: Duration::from_secs(1),
            })
        }
    }

    #[test]
    fn test_probe_interrupted_keeps_best_sample() {
        let mut meter = InterruptedMeter { rate: 80.0, calls: 0 };
        let ladder = [KB, 4 * KB, 16 * KB];

        let outcome =
            probe_ladder(&mut meter, &ladder, FillPolicy::Random, &CancellationToken::new()).unwrap();

        assert_eq!(meter.calls, 2);
        assert_eq!(outcome.samples.len(), 1);
        assert_eq!(outcome.buffer.len() as u64, KB);
        assert_eq!(outcome.rate_mb_per_sec, 80.0);
    }

    #[test]
    fn test_probe_cancelled_before_first_candidate() {
        let mut meter = ScriptedMeter {
            rates: vec![10.0],
            calls: 0,
        };
        let token = CancellationToken::new();
        token.cancel();
        let err = probe_ladder(&mut meter, &[KB], FillPolicy::Random, &token).unwrap_err();
        assert!(matches!(err, DiskPakError::Cancelled(_)));
        assert_eq!(meter.calls, 0);
    }

    #[test]
    fn test_disk_meter_removes_scratch_file() {
        let disk = MemoryDiskIO::with_capacity(16 * MB);
        let data_path = Path::new("/mem/data.dat");
        let budget = ProbeBudget {
            min_repetitions: 5,
            min_elapsed: Duration::ZERO,
        };
        let mut meter = DiskRateMeter::new(&disk, data_path, budget);
        let buffer = generate(4 * KB, FillPolicy::Random, &CancellationToken::new()).unwrap();

        let sample = meter.measure(&buffer, &CancellationToken::new()).unwrap();

        assert_eq!(sample.candidate_size_bytes, 4 * KB);
        assert!(disk.writes() >= 5);
        assert_eq!(disk.free_space(data_path).unwrap(), 16 * MB);
    }
}
