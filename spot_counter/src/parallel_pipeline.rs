// THEORY:
// The `parallel_pipeline` runs a whole batch. Counting one photograph takes
// seconds, a batch holds thousands, and the machine running it may be stopped
// at any moment. The design therefore aims for two properties: every core is
// busy, and the ledger on disk always reflects exactly the work completed.
//
// Key architectural principles:
// 1.  **Two Queues, No Shared State**: Workers never touch the ledger. They pull
//     `Job`s from one unbounded MPMC queue and push `JobOutcome`s onto another.
//     Each worker owns its own copy of the immutable profile. Every outcome
//     carries its own `(sample, depth)` address, so completion order is
//     irrelevant.
// 2.  **Sentinel Shutdown**: All real jobs are queued first, then exactly one
//     `Job::Stop` per worker. FIFO order guarantees each worker sees a stop only
//     after the real jobs are gone, however fast or slow the others are.
// 3.  **Message-Driven Cancellation**: Workers wait on the input queue and a
//     control channel with a bounded timeout. `Control::Cancel`, or the pool
//     being dropped (which disconnects the control channel), ends them. No worker
//     outlives its orchestrator waiting on an empty queue.
// 4.  **Single Writer, Save per Result**: Only the draining loop mutates the
//     `ProgressTable`, and it saves the full table after every single result. A
//     crash loses at most the jobs still in flight, and those cells stay empty
//     for the next run to pick up.
// 5.  **Isolated Failures**: An unreadable photograph comes back as
//     `JobOutcome::Failed` and leaves its cell empty. A panicking worker ends
//     alone; its in-flight job is lost and the rest of the pool carries on.
//     Workers are threads, not processes: an abort inside one (allocation
//     failure, stack overflow while decoding) still takes the whole process
//     down. Results saved before that point survive, and the next run resumes
//     from them.
//
// There is no per-job timeout. A photograph that hangs a worker stalls that
// worker until the run is interrupted.

use crate::config::{BatchSettings, SpotProfile};
use crate::core_modules::blob_detector::{BlobDetector, ThresholdSweepDetector};
use crate::core_modules::discovery::{
    Resolution, ResolveIssue, SampleFolder, sample_directories, survey_image_counts,
};
use crate::core_modules::progress_table::{ProgressTable, TableLayout};
use crate::error::BatchError;
use crate::pipeline::SpotCounter;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, select, unbounded};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// One photograph belonging to one sample and one depth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageElement {
    /// 0-based sample row in the progress table.
    pub sample: usize,
    /// 0-based depth index.
    pub depth: usize,
    pub path: PathBuf,
}

/// Counts for one photograph, one per category in declared order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobResult {
    pub sample: usize,
    pub depth: usize,
    pub counts: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Job {
    Image(ImageElement),
    Stop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Counted(JobResult),
    Failed { element: ImageElement, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Cancel,
}

/// Pool sizing and timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    pub workers: usize,
    pub stagger: Duration,
    pub poll_interval: Duration,
}

/// A fixed set of worker threads fed from one queue.
pub struct WorkerPool {
    task_sender: Sender<Job>,
    result_receiver: Receiver<JobOutcome>,
    control_sender: Sender<Control>,
    workers: Vec<JoinHandle<()>>,
    poll_interval: Duration,
    dispatched: usize,
}

impl WorkerPool {
    /// Queues `jobs` and one stop per worker, then starts the workers one by
    /// one, `stagger` apart. `make_handler` builds each worker's job handler.
    pub fn start<M, H>(
        jobs: Vec<ImageElement>,
        config: PoolConfig,
        make_handler: M,
    ) -> Result<Self, BatchError>
    where
        M: Fn(usize) -> H,
        H: FnMut(&ImageElement) -> JobOutcome + Send + 'static,
    {
        let workers = config.workers.max(1);
        let (task_sender, task_receiver) = unbounded::<Job>();
        let (result_sender, result_receiver) = unbounded::<JobOutcome>();
        let (control_sender, control_receiver) = unbounded::<Control>();

        let dispatched = jobs.len();
        for element in jobs {
            // The receiver is alive in this scope, so sending cannot fail.
            let _ = task_sender.send(Job::Image(element));
        }
        for _ in 0..workers {
            let _ = task_sender.send(Job::Stop);
        }

        let mut pool = Self {
            task_sender,
            result_receiver,
            control_sender,
            workers: Vec::with_capacity(workers),
            poll_interval: config.poll_interval,
            dispatched,
        };

        for index in 0..workers {
            if index > 0 && !config.stagger.is_zero() {
                thread::sleep(config.stagger);
            }
            let input = task_receiver.clone();
            let output = result_sender.clone();
            let control = control_receiver.clone();
            let handler = make_handler(index);
            let poll_interval = config.poll_interval;

            let handle = thread::Builder::new()
                .name(format!("spot-worker-{index}"))
                .spawn(move || worker_loop(index, input, output, control, poll_interval, handler))
                .map_err(|source| {
                    pool.cancel();
                    BatchError::Spawn { index, source }
                })?;
            debug!(worker = index, "worker started");
            pool.workers.push(handle);
        }

        // Only the workers hold result senders from here on, so the result
        // queue disconnects once the last of them exits.
        drop(result_sender);
        Ok(pool)
    }

    pub fn dispatched(&self) -> usize {
        self.dispatched
    }

    pub fn alive(&self) -> usize {
        self.workers.iter().filter(|handle| !handle.is_finished()).count()
    }

    /// Asks every worker to stop after its current job.
    pub fn cancel(&self) {
        for _ in 0..self.workers.len().max(1) {
            let _ = self.control_sender.send(Control::Cancel);
        }
    }

    /// Hands every outcome to `on_outcome` until no worker is alive and the
    /// result queue is empty. Returns the number of outcomes received.
    pub fn drain<F>(&self, mut on_outcome: F) -> Result<usize, BatchError>
    where
        F: FnMut(JobOutcome) -> Result<(), BatchError>,
    {
        let mut received = 0;
        loop {
            match self.result_receiver.recv_timeout(self.poll_interval) {
                Ok(outcome) => {
                    received += 1;
                    if let Err(error) = on_outcome(outcome) {
                        self.cancel();
                        return Err(error);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    let alive = self.alive();
                    if alive == 0 && self.result_receiver.is_empty() {
                        break;
                    }
                    info!(
                        remaining = self.dispatched.saturating_sub(received),
                        alive, "waiting for results"
                    );
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        let lost = self.dispatched.saturating_sub(received);
        if lost > 0 {
            warn!(lost, "workers ended before returning every job");
        }
        Ok(received)
    }

    /// Waits for every worker thread to end. Returns how many panicked.
    pub fn join(self) -> usize {
        let Self { task_sender, workers, .. } = self;
        drop(task_sender);
        workers
            .into_iter()
            .map(JoinHandle::join)
            .filter(Result::is_err)
            .count()
    }
}

fn worker_loop<H>(
    index: usize,
    input: Receiver<Job>,
    output: Sender<JobOutcome>,
    control: Receiver<Control>,
    poll_interval: Duration,
    mut handler: H,
) where
    H: FnMut(&ImageElement) -> JobOutcome,
{
    loop {
        select! {
            recv(input) -> job => match job {
                Ok(Job::Image(element)) => {
                    let outcome = handler(&element);
                    if output.send(outcome).is_err() {
                        debug!(worker = index, "result queue closed");
                        break;
                    }
                }
                Ok(Job::Stop) | Err(_) => break,
            },
            recv(control) -> message => match message {
                Ok(Control::Cancel) => {
                    debug!(worker = index, "cancelled");
                    break;
                }
                Err(_) => {
                    debug!(worker = index, "orchestrator gone");
                    break;
                }
            },
            default(poll_interval) => {}
        }
    }
    debug!(worker = index, "worker stopped");
}

/// Everything decided before the first job is queued.
#[derive(Debug, Clone)]
pub struct BatchPlan {
    pub table: ProgressTable,
    pub jobs: Vec<ImageElement>,
    pub issues: Vec<ResolveIssue>,
}

/// Summary of a finished run.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub progress_path: PathBuf,
    pub dispatched: usize,
    pub recorded: usize,
    pub failed: Vec<(ImageElement, String)>,
    pub issues: Vec<ResolveIssue>,
    /// Cells already filled before the run.
    pub already_done: usize,
}

impl BatchReport {
    /// Jobs queued but neither recorded nor reported as failed.
    pub fn lost(&self) -> usize {
        self.dispatched
            .saturating_sub(self.recorded + self.failed.len())
    }
}

pub struct BatchEngine {
    profile: SpotProfile,
    settings: BatchSettings,
    detector: Arc<dyn BlobDetector>,
}

impl BatchEngine {
    pub fn new(profile: SpotProfile, settings: BatchSettings) -> Self {
        Self {
            profile,
            settings,
            detector: Arc::new(ThresholdSweepDetector),
        }
    }

    pub fn with_detector(mut self, detector: Arc<dyn BlobDetector>) -> Self {
        self.detector = detector;
        self
    }

    pub fn settings(&self) -> &BatchSettings {
        &self.settings
    }

    /// Opens the ledger, checks it against the folders, and resolves every
    /// unprocessed cell to a photograph.
    pub fn plan(&self) -> Result<BatchPlan, BatchError> {
        if self.settings.depths.is_empty() {
            return Err(BatchError::NoDepths);
        }
        let folders = sample_directories(&self.settings.image_root)?;
        for (sample, count) in survey_image_counts(&folders, self.settings.depths.len()) {
            warn!(
                %sample,
                images = count,
                expected = self.settings.depths.len(),
                "unexpected number of images"
            );
        }

        let names: Vec<String> = folders.iter().map(|folder| folder.name.clone()).collect();
        let layout = TableLayout::new(self.profile.names.clone(), self.settings.depths.clone());
        let table = ProgressTable::open_or_create(&self.settings.progress_path, layout, &names)?;

        let patterns = self
            .settings
            .depths
            .iter()
            .map(|depth| self.settings.pattern.regex_for(depth))
            .collect::<Result<Vec<_>, _>>()?;

        let mut jobs = Vec::new();
        let mut issues = Vec::new();
        for folder in &folders {
            let Some(sample) = table.sample_row(&folder.name) else {
                continue;
            };
            for (depth, pattern) in patterns.iter().enumerate() {
                if table.is_processed(sample, depth) {
                    continue;
                }
                if let Some(path) = self.resolve(folder, depth, pattern, &mut issues) {
                    jobs.push(ImageElement { sample, depth, path });
                }
            }
        }

        Ok(BatchPlan { table, jobs, issues })
    }

    fn resolve(
        &self,
        folder: &SampleFolder,
        depth: usize,
        pattern: &regex::Regex,
        issues: &mut Vec<ResolveIssue>,
    ) -> Option<PathBuf> {
        let depth_name = &self.settings.depths[depth];
        match folder.resolve(pattern) {
            Resolution::Unique(path) => Some(path),
            Resolution::Ambiguous { chosen, candidates } => {
                warn!(
                    sample = %folder.name,
                    depth = %depth_name,
                    ?candidates,
                    "several files match, using the first"
                );
                issues.push(ResolveIssue::Ambiguous {
                    sample: folder.name.clone(),
                    depth: depth_name.clone(),
                    candidates,
                });
                Some(chosen)
            }
            Resolution::Missing => {
                warn!(sample = %folder.name, depth = %depth_name, "no file matches, cell skipped");
                issues.push(ResolveIssue::Missing {
                    sample: folder.name.clone(),
                    depth: depth_name.clone(),
                });
                None
            }
        }
    }

    /// Counts every photograph that still lacks a result and records each one
    /// as soon as it arrives.
    pub fn run(&self) -> Result<BatchReport, BatchError> {
        let BatchPlan { mut table, jobs, issues } = self.plan()?;
        let total_cells = table.sample_count() * table.layout().depth_count();
        let mut report = BatchReport {
            progress_path: table.path().to_path_buf(),
            dispatched: jobs.len(),
            already_done: total_cells - table.pending().len(),
            issues,
            ..BatchReport::default()
        };

        if !table.path().exists() {
            table.save()?;
            info!(path = %table.path().display(), "progress file created");
        }
        if jobs.is_empty() {
            info!("nothing left to count");
            return Ok(report);
        }

        let workers = self.settings.workers.max(1).min(jobs.len());
        info!(jobs = jobs.len(), workers, "starting batch");
        let config = PoolConfig {
            workers,
            stagger: self.settings.stagger,
            poll_interval: self.settings.poll_interval,
        };
        let pool = WorkerPool::start(jobs, config, |_| {
            let counter =
                SpotCounter::with_detector(self.profile.clone(), Arc::clone(&self.detector));
            move |element: &ImageElement| count_element(&counter, element)
        })?;

        let dispatched = pool.dispatched();
        pool.drain(|outcome| {
            match outcome {
                JobOutcome::Counted(result) => {
                    table.record(result.sample, result.depth, &result.counts)?;
                    table.save()?;
                    report.recorded += 1;
                    info!(
                        sample = result.sample,
                        depth = result.depth,
                        remaining = dispatched - report.recorded - report.failed.len(),
                        "result saved"
                    );
                }
                JobOutcome::Failed { element, reason } => {
                    error!(path = %element.path.display(), %reason, "image skipped");
                    report.failed.push((element, reason));
                }
            }
            Ok(())
        })?;

        let panicked = pool.join();
        if panicked > 0 {
            error!(panicked, "worker threads panicked");
        }
        info!(
            recorded = report.recorded,
            failed = report.failed.len(),
            lost = report.lost(),
            "batch finished"
        );
        Ok(report)
    }
}

fn count_element(counter: &SpotCounter, element: &ImageElement) -> JobOutcome {
    match counter.count_file(&element.path) {
        Ok(counts) => JobOutcome::Counted(JobResult {
            sample: element.sample,
            depth: element.depth,
            counts,
        }),
        Err(error) => JobOutcome::Failed {
            element: element.clone(),
            reason: error.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn elements(n: usize) -> Vec<ImageElement> {
        (0..n)
            .map(|i| ImageElement {
                sample: i,
                depth: i % 3,
                path: PathBuf::from(format!("img_{i}.png")),
            })
            .collect()
    }

    fn config(workers: usize) -> PoolConfig {
        PoolConfig {
            workers,
            stagger: Duration::ZERO,
            poll_interval: Duration::from_millis(20),
        }
    }

    fn echo(worker: usize) -> impl FnMut(&ImageElement) -> JobOutcome + Send + 'static {
        move |element: &ImageElement| {
            // Uneven speeds across workers.
            thread::sleep(Duration::from_millis(((element.sample + worker) % 4) as u64));
            JobOutcome::Counted(JobResult {
                sample: element.sample,
                depth: element.depth,
                counts: vec![worker as u64],
            })
        }
    }

    fn collect(pool: &WorkerPool) -> Vec<JobOutcome> {
        let mut outcomes = Vec::new();
        pool.drain(|outcome| {
            outcomes.push(outcome);
            Ok(())
        })
        .unwrap();
        outcomes
    }

    #[test]
    fn every_job_yields_exactly_one_result() {
        for (jobs, workers) in [(60, 4), (3, 8), (0, 2), (25, 1)] {
            let pool = WorkerPool::start(elements(jobs), config(workers), echo).unwrap();
            let outcomes = collect(&pool);
            assert_eq!(outcomes.len(), jobs);

            let samples: HashSet<usize> = outcomes
                .iter()
                .map(|outcome| match outcome {
                    JobOutcome::Counted(result) => result.sample,
                    JobOutcome::Failed { element, .. } => element.sample,
                })
                .collect();
            assert_eq!(samples, (0..jobs).collect::<HashSet<_>>());
            assert_eq!(pool.join(), 0);
        }
    }

    #[test]
    fn panicking_worker_only_loses_its_own_job() {
        let pool = WorkerPool::start(elements(12), config(3), |worker| {
            let mut inner = echo(worker);
            move |element: &ImageElement| {
                if element.sample == 5 {
                    panic!("decoder blew up");
                }
                inner(element)
            }
        })
        .unwrap();

        let outcomes = collect(&pool);
        assert_eq!(outcomes.len(), 11);
        assert!(outcomes.iter().all(|outcome| !matches!(
            outcome,
            JobOutcome::Counted(JobResult { sample: 5, .. })
        )));
        assert_eq!(pool.join(), 1);
    }

    #[test]
    fn cancelled_workers_stop_early() {
        let pool = WorkerPool::start(elements(200), config(2), |_| {
            |element: &ImageElement| {
                thread::sleep(Duration::from_millis(5));
                JobOutcome::Failed {
                    element: element.clone(),
                    reason: "skipped".into(),
                }
            }
        })
        .unwrap();
        pool.cancel();
        let outcomes = collect(&pool);
        assert!(outcomes.len() < 200);
        assert_eq!(pool.join(), 0);
    }

    #[test]
    fn failing_handler_aborts_the_drain() {
        let pool = WorkerPool::start(elements(10), config(2), echo).unwrap();
        let result = pool.drain(|_| Err(BatchError::NoDepths));
        assert!(matches!(result, Err(BatchError::NoDepths)));
        pool.join();
    }
}
