//! Stage orchestration: a bounded pool of row jobs feeding one writer.

pub mod stages;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info, warn};

use crate::checkpoint::{CheckpointSummary, CheckpointTracker, FailureOutcome};
use crate::config::PipelineConfig;
use crate::errors::RowError;
use crate::store::{InputRow, RowSink};

/// Work done for one input row. Runs on a worker task; its output goes to
/// the stage writer.
#[async_trait]
pub trait RowJob: Send + Sync + 'static {
    type Output: Send + 'static;

    async fn run(&self, row: &InputRow) -> Result<Self::Output, RowError>;
}

#[derive(Debug, Clone)]
pub struct StageOptions {
    pub workers: usize,
    pub batch_size: usize,
    pub show_progress: bool,
}

impl StageOptions {
    pub fn from_config(config: &PipelineConfig, show_progress: bool) -> Self {
        StageOptions {
            workers: config.workers,
            batch_size: config.batch_size,
            show_progress,
        }
    }
}

/// Shared stop request. Rows not yet started when it is set stay pending.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// First Ctrl-C requests a graceful stop, a second one exits at once.
    pub fn watch_ctrl_c(&self) {
        let flag = self.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            warn!("Interrupt received: finishing in-flight rows, press Ctrl-C again to abort");
            flag.cancel();
            if tokio::signal::ctrl_c().await.is_ok() {
                std::process::exit(130);
            }
        });
    }
}

#[derive(Debug, Clone, Default)]
pub struct StageReport {
    pub stage: String,
    pub processed: usize,
    pub ok: usize,
    pub failed: usize,
    pub rounds: u32,
    pub cancelled: bool,
    pub summary: CheckpointSummary,
    pub elapsed: Duration,
}

impl StageReport {
    pub fn print(&self) {
        println!("\n{} finished in {}", self.stage, format_duration(self.elapsed));
        println!("  Processed this run: {} ({} ok, {} failed)", self.processed, self.ok, self.failed);
        if self.rounds > 1 {
            println!("  Retry rounds:       {}", self.rounds - 1);
        }
        println!(
            "  Checkpoint:         {} done, {} pending, {} retryable, {} failed permanently (of {})",
            self.summary.done,
            self.summary.pending,
            self.summary.retryable,
            self.summary.terminal.len(),
            self.summary.total
        );
        for row in self.summary.terminal.iter().take(20) {
            println!("    row {} {} ({} attempts): {}", row.row_number, row.url, row.attempts, row.last_error);
        }
        if self.summary.terminal.len() > 20 {
            println!("    ... and {} more", self.summary.terminal.len() - 20);
        }
        if self.cancelled {
            println!("  Interrupted: rerun the same command to resume.");
        }
    }
}

enum Outcome<T> {
    Done(u64, T),
    Failed(InputRow, RowError),
}

/// Run `job` over every pending row of `tracker`.
///
/// Outputs are appended to `sink` and flushed before their row is marked
/// done. Failed rows are retried in later rounds until their attempt budget
/// runs out. Row errors never abort the stage; sink and checkpoint errors do.
pub async fn run_stage<J: RowJob>(
    job: Arc<J>,
    tracker: &CheckpointTracker,
    sink: &mut dyn RowSink<J::Output>,
    opts: &StageOptions,
    cancel: &CancelFlag,
) -> Result<StageReport> {
    let start = Instant::now();
    let workers = opts.workers.max(1);
    let semaphore = Arc::new(Semaphore::new(workers));
    let mut report = StageReport {
        stage: tracker.stage().to_string(),
        ..Default::default()
    };

    for round in 1..=tracker.max_attempts().max(1) {
        if cancel.is_cancelled() {
            break;
        }
        let pending = tracker.pending_rows()?;
        if pending.is_empty() {
            break;
        }
        report.rounds = round;
        if round == 1 {
            info!("{}: {} rows pending", tracker.stage(), pending.len());
        } else {
            info!("{}: retry round {} for {} rows", tracker.stage(), round - 1, pending.len());
        }

        let pb = progress_bar(pending.len() as u64, opts.show_progress)?;
        for batch in pending.chunks(opts.batch_size.max(1)) {
            if cancel.is_cancelled() {
                break;
            }

            // Channel: workers send outcomes, this loop is the only writer
            let (tx, mut rx) = mpsc::channel::<Outcome<J::Output>>(workers * 2);
            for row in batch.iter().cloned() {
                let job = Arc::clone(&job);
                let sem = Arc::clone(&semaphore);
                let tx = tx.clone();
                let cancel = cancel.clone();

                tokio::spawn(async move {
                    let Ok(_permit) = sem.acquire_owned().await else {
                        return;
                    };
                    if cancel.is_cancelled() {
                        return;
                    }
                    let outcome = match job.run(&row).await {
                        Ok(output) => Outcome::Done(row.row_number, output),
                        Err(e) => Outcome::Failed(row, e),
                    };
                    let _ = tx.send(outcome).await;
                });
            }
            drop(tx);

            while let Some(outcome) = rx.recv().await {
                match outcome {
                    Outcome::Done(row, output) => {
                        sink.append(&output)?;
                        tracker.mark_done(row)?;
                        report.ok += 1;
                    }
                    Outcome::Failed(row, e) => {
                        match tracker.mark_failed(row.row_number, &e.to_string())? {
                            FailureOutcome::Terminal { attempts } => warn!(
                                "Row {} failed permanently after {} attempt(s): {}",
                                row.row_number, attempts, e
                            ),
                            FailureOutcome::Retryable { attempts } => debug!(
                                "Row {} failed (attempt {}), will retry: {}",
                                row.row_number, attempts, e
                            ),
                            FailureOutcome::AlreadyDone => {}
                        }
                        report.failed += 1;
                    }
                }
                report.processed += 1;
                pb.inc(1);
            }
            tracker.persist()?;
        }
        pb.finish_and_clear();
    }

    tracker.persist()?;
    report.cancelled = cancel.is_cancelled();
    report.summary = tracker.summary()?;
    report.elapsed = start.elapsed();
    info!(
        "{}: {} ok, {} failed this run ({} still pending)",
        report.stage,
        report.ok,
        report.failed,
        report.summary.pending + report.summary.retryable
    );
    Ok(report)
}

fn progress_bar(len: u64, visible: bool) -> Result<ProgressBar> {
    if !visible {
        return Ok(ProgressBar::hidden());
    }
    let pb = ProgressBar::new(len);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40} {pos}/{len} ({per_sec}, eta {eta})")?
            .progress_chars("=> "),
    );
    Ok(pb)
}

pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 3600 {
        format!("{}h {:02}m {:02}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    } else if secs >= 60 {
        format!("{}m {:02}s", secs / 60, secs % 60)
    } else {
        format!("{:.1}s", d.as_secs_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{ExtractionError, FetchError, FetchErrorKind};
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Fails the listed rows a fixed number of times, then succeeds.
    struct Flaky {
        failures: Mutex<HashMap<u64, u32>>,
        permanent: Vec<u64>,
    }

    #[async_trait]
    impl RowJob for Flaky {
        type Output = u64;

        async fn run(&self, row: &InputRow) -> Result<u64, RowError> {
            if self.permanent.contains(&row.row_number) {
                return Err(ExtractionError::NoApiName(row.url.clone()).into());
            }
            let mut failures = self.failures.lock().unwrap();
            if let Some(left) = failures.get_mut(&row.row_number) {
                if *left > 0 {
                    *left -= 1;
                    return Err(FetchError {
                        kind: FetchErrorKind::Timeout,
                        url: row.url.clone(),
                        status: None,
                        attempts: 1,
                        message: "slow".into(),
                    }
                    .into());
                }
            }
            Ok(row.row_number * 10)
        }
    }

    #[derive(Default)]
    struct VecSink(Vec<u64>);

    impl RowSink<u64> for VecSink {
        fn append(&mut self, item: &u64) -> Result<()> {
            self.0.push(*item);
            Ok(())
        }
    }

    fn rows(n: u64) -> Vec<InputRow> {
        (2..2 + n)
            .map(|row_number| InputRow { row_number, url: format!("https://x.dev/{}", row_number) })
            .collect()
    }

    fn opts() -> StageOptions {
        StageOptions { workers: 3, batch_size: 4, show_progress: false }
    }

    #[tokio::test]
    async fn retries_until_success_or_budget() {
        let tracker = CheckpointTracker::in_memory("test", 3).unwrap();
        tracker.register(&rows(10)).unwrap();
        let job = Arc::new(Flaky {
            failures: Mutex::new(HashMap::from([(3, 1), (5, 2), (7, 5)])),
            permanent: vec![9],
        });
        let mut sink = VecSink::default();

        let report = run_stage(job, &tracker, &mut sink, &opts(), &CancelFlag::new()).await.unwrap();

        let mut written = sink.0.clone();
        written.sort();
        assert_eq!(written, vec![20, 30, 40, 50, 60, 80, 100, 110]);
        assert_eq!(report.rounds, 3);
        assert_eq!(report.summary.done, 8);
        let terminal: Vec<u64> = report.summary.terminal.iter().map(|r| r.row_number).collect();
        assert_eq!(terminal, vec![7, 9]);
        assert!(tracker.pending_rows().unwrap().is_empty());
    }

    #[tokio::test]
    async fn done_rows_are_not_rerun() {
        let tracker = CheckpointTracker::in_memory("test", 3).unwrap();
        tracker.register(&rows(5)).unwrap();
        tracker.mark_done(2).unwrap();
        tracker.mark_done(4).unwrap();
        let job = Arc::new(Flaky { failures: Mutex::new(HashMap::new()), permanent: vec![] });
        let mut sink = VecSink::default();

        let report = run_stage(job, &tracker, &mut sink, &opts(), &CancelFlag::new()).await.unwrap();
        let mut written = sink.0.clone();
        written.sort();
        assert_eq!(written, vec![30, 50, 60]);
        assert_eq!(report.processed, 3);
    }

    #[tokio::test]
    async fn cancelled_stage_leaves_rows_pending() {
        let tracker = CheckpointTracker::in_memory("test", 3).unwrap();
        tracker.register(&rows(6)).unwrap();
        let cancel = CancelFlag::new();
        cancel.cancel();
        let job = Arc::new(Flaky { failures: Mutex::new(HashMap::new()), permanent: vec![] });
        let mut sink = VecSink::default();

        let report = run_stage(job, &tracker, &mut sink, &opts(), &cancel).await.unwrap();
        assert!(report.cancelled);
        assert!(sink.0.is_empty());
        assert_eq!(tracker.pending_rows().unwrap().len(), 6);
    }

    #[test]
    fn durations() {
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.5s");
        assert_eq!(format_duration(Duration::from_secs(125)), "2m 05s");
        assert_eq!(format_duration(Duration::from_secs(3725)), "1h 02m 05s");
    }
}
