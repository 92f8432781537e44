//! Benchmark runs: one worker per core hammering a shared lock.

use anyhow::{Context, Result, bail};
use dlock_core::ThreadLock;
use dlock_io::LockKind;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::baseline::SpinLock;
use crate::stats::LatencyStats;
use crate::workload::{LIST_GAP, LIST_LEN, ListWorkload, Workload, busy_delay};

/// Requests between two monitor progress lines.
const MONITOR_INTERVAL: u64 = 1000;

/// List rounds are long enough to report every one of them.
const LIST_MONITOR_INTERVAL: u64 = 1;

/// Parameters of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BenchConfig {
    /// Worker threads, each standing in for one core.
    pub cpus: usize,
    /// Requests issued by every worker.
    pub nr_bench: u64,
    /// Busy delay inside each critical section, in microseconds.
    pub delay_us: u64,
    /// Combiner budget of the delegate lock.
    pub budget: u32,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            cpus: 2,
            nr_bench: 500_000,
            delay_us: 0,
            budget: u32::MAX,
        }
    }
}

/// Outcome of a finished run.
///
/// For the list kinds a request is one round of [`LIST_LEN`] adds followed
/// by [`LIST_LEN`] removals, and `counter` counts the list operations.
#[derive(Debug, Clone)]
pub struct BenchReport {
    pub kind: LockKind,
    pub cpus: usize,
    /// Requests completed by all workers together.
    pub requests: u64,
    pub counter: u64,
    pub elapsed: Duration,
    pub latency: LatencyStats,
    /// Whether the stop flag cut the run short.
    pub stopped: bool,
}

impl BenchReport {
    pub fn throughput(&self) -> f64 {
        let seconds = self.elapsed.as_secs_f64();
        if seconds == 0.0 {
            0.0
        } else {
            self.requests as f64 / seconds
        }
    }

    /// Value `counter` must reach once every completed request is accounted
    /// for.
    pub fn expected_counter(&self) -> u64 {
        expected_counter(self.kind, self.requests)
    }

    pub fn print(&self) {
        println!("Results ({:?} lock, {} cpus)", self.kind, self.cpus);
        if self.stopped {
            println!("Stopped early after {} requests", self.requests);
        }
        println!("Time: {:.4} s", self.elapsed.as_secs_f64());
        println!("Throughput: {:.2} requests/s", self.throughput());
        println!("Counter: {}/{}", self.counter, self.expected_counter());
        self.latency.print_report();
    }
}

fn expected_counter(kind: LockKind, requests: u64) -> u64 {
    if kind.is_list() {
        requests * 2 * LIST_LEN as u64
    } else {
        requests
    }
}

/// Locks a run can target, shared with the thread driving the run.
///
/// The delegate locks carry the combiner budget, so changing the budget
/// means building new ones with [`Targets::new`].
#[derive(Clone)]
pub struct Targets {
    pub delegate: Arc<ThreadLock<Workload>>,
    pub spin: Arc<SpinLock<Workload>>,
    pub delegate_list: Arc<ThreadLock<ListWorkload>>,
    pub spin_list: Arc<SpinLock<ListWorkload>>,
}

impl Targets {
    /// Fresh locks; the delegate ones use `budget`.
    pub fn new(budget: u32) -> Self {
        Self {
            delegate: Arc::new(ThreadLock::with_budget(Workload::new(), budget)),
            spin: Arc::new(SpinLock::new(Workload::new())),
            delegate_list: Arc::new(ThreadLock::with_budget(ListWorkload::new(0), budget)),
            spin_list: Arc::new(SpinLock::new(ListWorkload::new(0))),
        }
    }

    fn reset(&self, kind: LockKind, cpus: usize) {
        match kind {
            LockKind::Delegate => self.delegate.run(|w| *w = Workload::new()),
            LockKind::Spin => *self.spin.lock() = Workload::new(),
            LockKind::DelegateList => self
                .delegate_list
                .run(move |l| *l = ListWorkload::for_workers(cpus)),
            LockKind::SpinList => *self.spin_list.lock() = ListWorkload::for_workers(cpus),
        }
    }

    /// One request of `kind` issued by worker `index`.
    fn request(&self, kind: LockKind, index: usize, delay_us: u64) {
        match kind {
            LockKind::Delegate => {
                self.delegate.run(move |w| w.increment(delay_us));
            }
            LockKind::Spin => {
                self.spin.lock().increment(delay_us);
            }
            LockKind::DelegateList => list_round(index, |entry, add| {
                self.delegate_list.run(move |l| {
                    if add { l.push_front(entry) } else { l.remove(entry) }
                });
            }),
            LockKind::SpinList => list_round(index, |entry, add| {
                let mut list = self.spin_list.lock();
                if add {
                    list.push_front(entry);
                } else {
                    list.remove(entry);
                }
            }),
        }
    }

    /// Checks the workload of `kind` against `requests` completed requests
    /// and returns its counter.
    fn verify(&self, kind: LockKind, requests: u64) -> Result<u64> {
        let expected = expected_counter(kind, requests);
        let counter = match kind {
            LockKind::Delegate => self.delegate.run(|w| w.counter),
            LockKind::Spin => self.spin.lock().counter,
            LockKind::DelegateList => {
                let (ops, misses, len, linked) = self
                    .delegate_list
                    .run(|l| (l.ops, l.misses, l.len(), l.iter().count()));
                check_list(kind, misses, len, linked)?;
                ops
            }
            LockKind::SpinList => {
                let list = self.spin_list.lock();
                check_list(kind, list.misses, list.len(), list.iter().count())?;
                list.ops
            }
        };
        if counter != expected {
            bail!(
                "{:?} lock lost updates: counter {} after {} requests, expected {}",
                kind,
                counter,
                requests,
                expected
            );
        }
        Ok(counter)
    }
}

/// `linked` is the number of entries reachable from the head.
fn check_list(kind: LockKind, misses: u64, len: usize, linked: usize) -> Result<()> {
    if misses != 0 || len != 0 || linked != 0 {
        bail!(
            "{:?} lock corrupted the list: {} misses, {} entries left linked, {} reachable",
            kind,
            misses,
            len,
            linked
        );
    }
    Ok(())
}

/// Links every entry worker `index` owns, then unlinks them again, pausing
/// [`LIST_GAP`] between two operations.
fn list_round<F>(index: usize, op: F)
where
    F: Fn(usize, bool),
{
    let first = index * LIST_LEN;
    for add in [true, false] {
        for entry in first..first + LIST_LEN {
            op(entry, add);
            busy_delay(LIST_GAP);
        }
    }
}

/// Runs up to `config.nr_bench` requests on each of `config.cpus` workers.
///
/// Worker 0 is the monitor: it times each of its requests and logs its
/// progress. Workers check `stop` before every request and leave early once
/// it is set.
///
/// # Arguments
///
/// * `kind` - Lock and workload to exercise.
/// * `config` - Worker count, requests per worker and critical section delay.
/// * `targets` - Locks shared with whoever started the run.
/// * `stop` - Raised by the session to cut the run short.
///
/// # Returns
///
/// The report of the run, or an error if the workers could not be started
/// or the workload does not account for every completed request.
pub fn run_benchmark(
    kind: LockKind,
    config: &BenchConfig,
    targets: &Targets,
    stop: &AtomicBool,
) -> Result<BenchReport> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.cpus)
        .thread_name(|i| format!("dlock-bench/{i}"))
        .build()
        .context("Failed to start benchmark workers")?;

    targets.reset(kind, config.cpus);

    let delay = config.delay_us;
    let nr_bench = config.nr_bench;
    let interval = if kind.is_list() {
        LIST_MONITOR_INTERVAL
    } else {
        MONITOR_INTERVAL
    };
    log::info!("starting {:?} run: {:?}", kind, config);

    let start = Instant::now();
    let outcomes = pool.broadcast(|ctx| {
        let index = ctx.index();
        let request = || targets.request(kind, index, delay);
        if index == 0 {
            monitor(nr_bench, interval, stop, request)
        } else {
            worker(nr_bench, stop, request)
        }
    });
    let elapsed = start.elapsed();

    let mut latency = LatencyStats::new();
    let mut requests = 0;
    for outcome in &outcomes {
        requests += outcome.done;
        if let Some(stats) = &outcome.latency {
            latency.merge(stats);
        }
    }

    let counter = targets.verify(kind, requests)?;
    let stopped = requests < config.cpus as u64 * nr_bench;
    if stopped {
        log::info!("{:?} run stopped after {} requests", kind, requests);
    }

    Ok(BenchReport {
        kind,
        cpus: config.cpus,
        requests,
        counter,
        elapsed,
        latency,
        stopped,
    })
}

/// What one worker got through before finishing or being stopped.
struct Outcome {
    done: u64,
    latency: Option<LatencyStats>,
}

fn worker<F>(nr_bench: u64, stop: &AtomicBool, request: F) -> Outcome
where
    F: Fn(),
{
    let mut done = 0;
    while done < nr_bench && !stop.load(Ordering::Relaxed) {
        request();
        done += 1;
    }
    Outcome { done, latency: None }
}

fn monitor<F>(nr_bench: u64, interval: u64, stop: &AtomicBool, request: F) -> Outcome
where
    F: Fn(),
{
    let mut stats = LatencyStats::new();
    let mut window = Instant::now();
    let mut done = 0;
    while done < nr_bench && !stop.load(Ordering::Relaxed) {
        if done > 0 && done % interval == 0 {
            log::debug!("monitor thread {}th [{:?}]", done, window.elapsed());
            window = Instant::now();
        }
        let start = Instant::now();
        request();
        stats.update(start.elapsed().as_nanos() as u64);
        done += 1;
    }
    log::debug!("monitor thread {}th [{:?}]", done, window.elapsed());
    Outcome {
        done,
        latency: Some(stats),
    }
}
