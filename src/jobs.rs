//! In-memory job queue for fetch runs.
//!
//! Submissions are queued FIFO and drained by a single worker task. Each job
//! spawns the `fetch_video` binary for one identifier and follows its stdout
//! and stderr line by line: percentages found in the output drive the job's
//! progress, the latest line becomes its status message, and every line lands
//! in a bounded log ring that clients can tail.

use std::{
    collections::{HashMap, VecDeque},
    path::PathBuf,
    process::Stdio,
    sync::{
        Arc, LazyLock,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use regex::Regex;
use serde::Serialize;
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::Command,
    sync::mpsc,
};
use tracing::{info, warn};

use crate::{
    identifier::{self, IdentifierError},
    library::Library,
};

pub const MAX_LOG_LINES: usize = 3000;
/// Finished jobs kept for polling; older ones are forgotten.
pub const MAX_FINISHED_JOBS: usize = 200;
const MESSAGE_TAIL_CHARS: usize = 200;
const NUDGE_CAP: u8 = 95;

static PERCENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{1,3}(?:\.\d+)?)\s*%").expect("percent pattern compiles"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Error,
}

impl JobStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Error)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub task_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    pub plate: String,
    pub status: JobStatus,
    pub percent: u8,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Media URL of the finished video.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogLine {
    pub seq: u64,
    pub line: String,
}

/// Log lines newer than a given sequence number, plus whether more can come.
#[derive(Debug, Clone, PartialEq)]
pub struct LogBatch {
    pub lines: Vec<LogLine>,
    pub finished: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchReceipt {
    pub batch_id: String,
    pub task_ids: Vec<String>,
    pub count: usize,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error(transparent)]
    Identifier(#[from] IdentifierError),
    #[error("the uploaded list contains no valid identifiers")]
    EmptyBatch,
}

/// Turns child output into a monotonic percentage.
#[derive(Debug, Default, Clone)]
pub struct ProgressTracker {
    percent: u8,
}

impl ProgressTracker {
    pub fn percent(&self) -> u8 {
        self.percent
    }

    /// The last percentage on the line wins, but progress never goes back.
    /// Lines without one nudge the value forward until [`NUDGE_CAP`].
    pub fn observe(&mut self, line: &str) -> u8 {
        match parse_percent(line) {
            Some(percent) => self.percent = self.percent.max(percent),
            None if self.percent < NUDGE_CAP => self.percent += 1,
            None => {}
        }
        self.percent
    }

    fn complete(&mut self) {
        self.percent = 100;
    }
}

fn parse_percent(line: &str) -> Option<u8> {
    let caps = PERCENT_RE.captures_iter(line).last()?;
    let value: f64 = caps.get(1)?.as_str().parse().ok()?;
    Some(value.clamp(0.0, 100.0) as u8)
}

fn tail_chars(line: &str, max: usize) -> &str {
    let count = line.chars().count();
    if count <= max {
        return line;
    }
    line.char_indices()
        .nth(count - max)
        .map_or(line, |(index, _)| &line[index..])
}

/// How to launch one fetch: `program <args_prefix...> <ID>`.
#[derive(Debug, Clone)]
pub struct FetchCommand {
    pub program: PathBuf,
    pub args_prefix: Vec<String>,
}

impl FetchCommand {
    fn command(&self, id: &str) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args_prefix)
            .arg(id)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

struct Job {
    snapshot: JobSnapshot,
    tracker: ProgressTracker,
    logs: VecDeque<LogLine>,
    next_seq: u64,
}

impl Job {
    fn new(task_id: String, batch_id: Option<String>, plate: String) -> Self {
        let now = Utc::now();
        Self {
            snapshot: JobSnapshot {
                task_id,
                batch_id,
                plate,
                status: JobStatus::Queued,
                percent: 0,
                message: "queued".to_string(),
                created_at: now,
                updated_at: now,
                file: None,
            },
            tracker: ProgressTracker::default(),
            logs: VecDeque::new(),
            next_seq: 1,
        }
    }

    fn push_log(&mut self, line: &str) {
        if self.logs.len() == MAX_LOG_LINES {
            self.logs.pop_front();
        }
        self.logs.push_back(LogLine {
            seq: self.next_seq,
            line: line.to_string(),
        });
        self.next_seq += 1;
    }

    fn record_output(&mut self, line: &str) {
        self.push_log(line);
        self.snapshot.percent = self.tracker.observe(line);
        self.snapshot.message = tail_chars(line.trim(), MESSAGE_TAIL_CHARS).to_string();
        self.snapshot.updated_at = Utc::now();
    }

    fn set_status(&mut self, status: JobStatus, message: &str) {
        self.snapshot.status = status;
        self.snapshot.message = message.to_string();
        self.snapshot.updated_at = Utc::now();
    }
}

#[derive(Clone)]
pub struct JobManager {
    inner: Arc<JobManagerInner>,
}

struct JobManagerInner {
    jobs: Mutex<HashMap<String, Job>>,
    counter: AtomicUsize,
    finished: AtomicU64,
    queue: mpsc::UnboundedSender<String>,
    command: FetchCommand,
    library: Library,
}

impl JobManager {
    /// Creates the manager and spawns its worker on the current runtime.
    pub fn start(command: FetchCommand, library: Library) -> Self {
        let (queue, receiver) = mpsc::unbounded_channel();
        let inner = Arc::new(JobManagerInner {
            jobs: Mutex::new(HashMap::new()),
            counter: AtomicUsize::new(1),
            finished: AtomicU64::new(0),
            queue,
            command,
            library,
        });
        tokio::spawn(run_worker(inner.clone(), receiver));
        Self { inner }
    }

    /// Queues a fetch for `plate`, or returns the job already queued or
    /// running for it.
    pub fn submit(&self, plate: &str) -> Result<JobSnapshot, SubmitError> {
        let plate = identifier::parse(plate)?;
        Ok(self.enqueue(plate, None))
    }

    /// Queues every valid identifier in `content`, one per line. Invalid lines
    /// are skipped.
    pub fn submit_batch(&self, content: &str) -> Result<BatchReceipt, SubmitError> {
        let (plates, rejected) = identifier::parse_lines(content);
        for err in &rejected {
            warn!("batch upload: {err}");
        }
        if plates.is_empty() {
            return Err(SubmitError::EmptyBatch);
        }

        let batch_id = format!("batch-{}", self.next_id());
        let task_ids: Vec<String> = plates
            .into_iter()
            .map(|plate| self.enqueue(plate, Some(batch_id.clone())).task_id)
            .collect();
        info!("queued batch {batch_id} with {} jobs", task_ids.len());
        Ok(BatchReceipt {
            batch_id,
            count: task_ids.len(),
            task_ids,
        })
    }

    pub fn snapshot(&self, task_id: &str) -> Option<JobSnapshot> {
        self.inner
            .jobs
            .lock()
            .get(task_id)
            .map(|job| job.snapshot.clone())
    }

    pub fn logs_after(&self, task_id: &str, after_seq: u64) -> Option<LogBatch> {
        let jobs = self.inner.jobs.lock();
        let job = jobs.get(task_id)?;
        Some(LogBatch {
            lines: job
                .logs
                .iter()
                .filter(|entry| entry.seq > after_seq)
                .cloned()
                .collect(),
            finished: job.snapshot.status.is_finished(),
        })
    }

    /// Number of jobs that have finished so far. Changes whenever the
    /// catalog may have changed.
    pub fn finished_count(&self) -> u64 {
        self.inner.finished.load(Ordering::SeqCst)
    }

    fn next_id(&self) -> usize {
        self.inner.counter.fetch_add(1, Ordering::SeqCst)
    }

    fn enqueue(&self, plate: String, batch_id: Option<String>) -> JobSnapshot {
        let mut jobs = self.inner.jobs.lock();
        if let Some(existing) = jobs
            .values()
            .find(|job| job.snapshot.plate == plate && !job.snapshot.status.is_finished())
        {
            info!(
                "{plate} is already in flight as {}",
                existing.snapshot.task_id
            );
            return existing.snapshot.clone();
        }

        let task_id = format!("task-{}", self.next_id());
        let mut job = Job::new(task_id.clone(), batch_id, plate);
        if self.inner.queue.send(task_id.clone()).is_err() {
            job.set_status(JobStatus::Error, "job worker is not running");
        }
        let snapshot = job.snapshot.clone();
        jobs.insert(task_id, job);
        snapshot
    }
}

impl JobManagerInner {
    fn update<F>(&self, task_id: &str, apply: F)
    where
        F: FnOnce(&mut Job),
    {
        if let Some(job) = self.jobs.lock().get_mut(task_id) {
            apply(job);
        }
    }

    fn begin(&self, task_id: &str) -> Option<String> {
        let mut jobs = self.jobs.lock();
        let job = jobs.get_mut(task_id)?;
        job.set_status(JobStatus::Running, "starting");
        Some(job.snapshot.plate.clone())
    }

    fn fail(&self, task_id: &str, message: &str) {
        warn!("{task_id}: {message}");
        self.update(task_id, |job| {
            job.push_log(message);
            job.set_status(JobStatus::Error, message);
        });
        self.finish();
    }

    fn finish(&self) {
        self.finished.fetch_add(1, Ordering::SeqCst);
        prune_finished(&mut self.jobs.lock(), MAX_FINISHED_JOBS);
    }

    fn succeed(&self, task_id: &str, plate: &str) {
        let file = self
            .library
            .find_video_file(plate)
            .and_then(|path| self.library.media_url(plate, &path));
        info!("{task_id}: {plate} done");
        self.update(task_id, |job| {
            job.tracker.complete();
            job.snapshot.percent = job.tracker.percent();
            job.snapshot.file = file;
            job.set_status(JobStatus::Done, "done");
        });
        self.finish();
    }
}

/// Drops the least recently updated finished jobs beyond `keep`.
fn prune_finished(jobs: &mut HashMap<String, Job>, keep: usize) {
    let mut finished: Vec<(DateTime<Utc>, String)> = jobs
        .values()
        .filter(|job| job.snapshot.status.is_finished())
        .map(|job| (job.snapshot.updated_at, job.snapshot.task_id.clone()))
        .collect();
    let excess = finished.len().saturating_sub(keep);
    if excess == 0 {
        return;
    }
    finished.sort();
    for (_, task_id) in finished.into_iter().take(excess) {
        jobs.remove(&task_id);
    }
}

async fn run_worker(inner: Arc<JobManagerInner>, mut receiver: mpsc::UnboundedReceiver<String>) {
    while let Some(task_id) = receiver.recv().await {
        run_job(&inner, &task_id).await;
    }
}

async fn run_job(inner: &JobManagerInner, task_id: &str) {
    let Some(plate) = inner.begin(task_id) else {
        return;
    };
    info!("{task_id}: fetching {plate}");

    let mut child = match inner.command.command(&plate).spawn() {
        Ok(child) => child,
        Err(err) => {
            inner.fail(
                task_id,
                &format!(
                    "could not start {}: {err}",
                    inner.command.program.display()
                ),
            );
            return;
        }
    };

    let (lines_tx, mut lines_rx) = mpsc::unbounded_channel();
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(forward_lines(stdout, lines_tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_lines(stderr, lines_tx.clone()));
    }
    drop(lines_tx);

    while let Some(line) = lines_rx.recv().await {
        // Progress bars redraw with carriage returns.
        for segment in line.split('\r').filter(|segment| !segment.trim().is_empty()) {
            inner.update(task_id, |job| job.record_output(segment));
        }
    }

    match child.wait().await {
        Ok(status) if status.success() => inner.succeed(task_id, &plate),
        Ok(status) => {
            let reason = match status.code() {
                Some(code) => format!("fetch failed with exit code {code}"),
                None => "fetch was terminated by a signal".to_string(),
            };
            inner.fail(task_id, &reason);
        }
        Err(err) => inner.fail(task_id, &format!("waiting for fetch failed: {err}")),
    }
}

async fn forward_lines<R>(reader: R, sender: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if sender.send(line).is_err() {
            break;
        }
    }
}
