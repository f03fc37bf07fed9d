//! Timing and statistics.
//!
//! Every iteration is bracketed by barriers and its duration is reduced to the
//! slowest rank before it is recorded, so every rank ends up with the same
//! samples.

use std::time::{Duration, Instant};

use bytemuck::Pod;

use crate::error::{BenchError, Result};
use crate::group::{ProcessGroup, Rank};
use crate::pattern::Comm;

/// Order statistics of a sample set, in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Summary {
    pub min: f64,
    pub median: f64,
    pub max: f64,
    pub mean: f64,
}

impl Summary {
    /// Summarize ascending `sorted` samples. The median is `sorted[n / 2]`.
    pub fn from_sorted(sorted: &[f64]) -> Option<Self> {
        let n = sorted.len();
        if n == 0 {
            return None;
        }
        Some(Self {
            min: sorted[0],
            median: sorted[n / 2],
            max: sorted[n - 1],
            mean: sorted.iter().sum::<f64>() / n as f64,
        })
    }

    /// Bytes per second for each statistic.
    pub fn throughput(&self, bytes: usize) -> Summary {
        let rate = |t: f64| bytes as f64 / t;
        Summary {
            min: rate(self.min),
            median: rate(self.median),
            max: rate(self.max),
            mean: rate(self.mean),
        }
    }
}

/// Measured iterations of one benchmark, identical on every rank.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    /// Time from iteration start until every transfer was issued, ascending.
    pub issue: Vec<f64>,
    /// Time from iteration start until every transfer completed, ascending.
    pub total: Vec<f64>,
    /// Bytes moved per iteration, summed over all ranks.
    pub bytes: usize,
}

impl Measurement {
    pub fn new(mut issue: Vec<f64>, mut total: Vec<f64>, bytes: usize) -> Result<Self> {
        if total.is_empty() || issue.len() != total.len() {
            return Err(BenchError::Usage(format!(
                "{} issue and {} total samples do not form a measurement",
                issue.len(),
                total.len()
            )));
        }
        issue.sort_by(f64::total_cmp);
        total.sort_by(f64::total_cmp);
        Ok(Self {
            issue,
            total,
            bytes,
        })
    }

    pub fn iterations(&self) -> usize {
        self.total.len()
    }

    /// Statistics of the total iteration time.
    pub fn summary(&self) -> Summary {
        Summary::from_sorted(&self.total).unwrap_or(Summary {
            min: f64::NAN,
            median: f64::NAN,
            max: f64::NAN,
            mean: f64::NAN,
        })
    }

    pub fn issue_summary(&self) -> Summary {
        Summary::from_sorted(&self.issue).unwrap_or(Summary {
            min: f64::NAN,
            median: f64::NAN,
            max: f64::NAN,
            mean: f64::NAN,
        })
    }

    /// Bytes per second for each statistic of the total time.
    pub fn throughput(&self) -> Summary {
        self.summary().throughput(self.bytes)
    }
}

/// Run `warmup + iterations` barrier-bracketed iterations of `step`, which
/// returns (time to issue, total time) for one iteration on this rank.
/// Warmup timings are logged on `print_rank`.
pub(crate) fn run<F>(
    group: &ProcessGroup,
    print_rank: Rank,
    warmup: usize,
    iterations: usize,
    bytes: usize,
    mut step: F,
) -> Result<Measurement>
where
    F: FnMut() -> Result<(Duration, Duration)>,
{
    if iterations == 0 {
        return Err(BenchError::Usage("at least one measured iteration is required".into()));
    }
    let _span = tracing::info_span!("measure", warmup, iterations).entered();

    let mut issue = Vec::with_capacity(iterations);
    let mut total = Vec::with_capacity(iterations);
    for iter in 0..warmup + iterations {
        group.barrier()?;
        let (local_issue, local_total) = step()?;
        group.barrier()?;
        let slowest_issue = group.all_reduce_max(local_issue.as_secs_f64())?;
        let slowest_total = group.all_reduce_max(local_total.as_secs_f64())?;
        if iter < warmup {
            if group.rank() == print_rank {
                tracing::debug!(
                    iter,
                    startup_us = slowest_issue * 1e6,
                    warmup_us = slowest_total * 1e6,
                    "warmup"
                );
            }
        } else {
            issue.push(slowest_issue);
            total.push(slowest_total);
        }
    }
    Measurement::new(issue, total, bytes)
}

impl<T: Pod> Comm<'_, T> {
    /// Measure this pattern. Bytes moved are the sum of every rank's
    /// outgoing edges.
    pub fn measure(&mut self, warmup: usize, iterations: usize) -> Result<Measurement> {
        let bytes = self.group().all_reduce_sum(self.send_bytes() as u64)? as usize;
        self.measure_bytes(warmup, iterations, bytes)
    }

    /// Measure this pattern, reporting throughput against `bytes`.
    pub fn measure_bytes(&mut self, warmup: usize, iterations: usize, bytes: usize) -> Result<Measurement> {
        let group = self.group();
        let print_rank = self.options().print_rank;
        run(group, print_rank, warmup, iterations, bytes, || {
            let begin = Instant::now();
            self.start()?;
            let issued = begin.elapsed();
            self.wait()?;
            Ok((issued, begin.elapsed()))
        })
    }
}

/// The group shared by `patterns` and the first pattern's print rank.
fn common_group<'a, T: Pod>(patterns: &[Comm<'a, T>]) -> Result<(&'a ProcessGroup, Rank)> {
    let first = patterns
        .first()
        .ok_or_else(|| BenchError::Usage("no patterns to measure".into()))?;
    let group = first.group();
    if patterns.iter().any(|p| !std::ptr::eq(p.group(), group)) {
        return Err(BenchError::Usage("patterns belong to different groups".into()));
    }
    Ok((group, first.options().print_rank))
}

fn credited_bytes<T>(count: usize) -> Result<usize> {
    count
        .checked_mul(std::mem::size_of::<T>())
        .ok_or_else(|| BenchError::Usage(format!("{count} elements overflow a byte count")))
}

/// Measure `patterns` one after another: each is started and waited before
/// the next one starts. `count` elements are credited per iteration.
pub fn measure_async<T: Pod>(
    patterns: &mut [Comm<'_, T>],
    warmup: usize,
    iterations: usize,
    count: usize,
) -> Result<Measurement> {
    let (group, print_rank) = common_group(patterns)?;
    let bytes = credited_bytes::<T>(count)?;
    run(group, print_rank, warmup, iterations, bytes, || {
        let begin = Instant::now();
        let mut issued = Duration::ZERO;
        for pattern in patterns.iter_mut() {
            let before = Instant::now();
            pattern.start()?;
            issued += before.elapsed();
            pattern.wait()?;
        }
        Ok((issued, begin.elapsed()))
    })
}

/// Measure `patterns` overlapped: all are started, then all are waited.
pub fn measure_concur<T: Pod>(
    patterns: &mut [Comm<'_, T>],
    warmup: usize,
    iterations: usize,
    count: usize,
) -> Result<Measurement> {
    let (group, print_rank) = common_group(patterns)?;
    let bytes = credited_bytes::<T>(count)?;
    run(group, print_rank, warmup, iterations, bytes, || {
        let begin = Instant::now();
        for pattern in patterns.iter_mut() {
            pattern.start()?;
        }
        let issued = begin.elapsed();
        for pattern in patterns.iter_mut() {
            pattern.wait()?;
        }
        Ok((issued, begin.elapsed()))
    })
}
