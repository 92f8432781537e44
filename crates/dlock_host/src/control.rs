//! Control session: applies commands to the benchmark configuration and
//! triggers runs.

use anyhow::{Context, Result, anyhow, bail};
use dlock_common::MAX_CPUS;
use dlock_common::nesting::Level;
use dlock_core::{ThreadCpus, Topology, pool};
use dlock_io::{Command, LockKind};
use std::fmt::Write;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use crate::bench::{self, BenchConfig, BenchReport, Targets};

/// Worker count accepted by `cpu`. One identity stays free for the thread
/// driving the run.
pub const CPU_RANGE: RangeInclusive<u64> = 1..=(MAX_CPUS as u64 - 1);
pub const NR_BENCH_RANGE: RangeInclusive<u64> = 1..=500_000;
pub const DELAY_RANGE: RangeInclusive<u64> = 0..=100;

/// What the caller should do after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

/// A run started by `trigger` whose report has not been collected yet.
struct Run {
    kind: LockKind,
    /// Polled by every worker; raised by `quit`.
    stop: Arc<AtomicBool>,
    handle: JoinHandle<Result<BenchReport>>,
}

/// Configuration plus the locks it drives. The locks outlive single runs.
///
/// `trigger` starts a run on a background thread and returns at once, so
/// `status` and `ready` stay usable while workers are busy. At most one run
/// is in progress at a time; its report is printed when it is collected by
/// `ready`, `wait`, `quit` or the next `trigger`.
pub struct Session {
    config: BenchConfig,
    targets: Targets,
    run: Option<Run>,
    last: Option<BenchReport>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

fn checked(what: &str, value: u64, range: RangeInclusive<u64>) -> Result<u64> {
    if !range.contains(&value) {
        bail!(
            "{} {} out of range {}..={}",
            what,
            value,
            range.start(),
            range.end()
        );
    }
    Ok(value)
}

impl Session {
    pub fn new() -> Self {
        let config = BenchConfig::default();
        Self {
            config,
            targets: Targets::new(config.budget),
            run: None,
            last: None,
        }
    }

    pub fn config(&self) -> &BenchConfig {
        &self.config
    }

    pub fn last_report(&self) -> Option<&BenchReport> {
        self.last.as_ref()
    }

    /// Applies one command. A rejected value leaves the configuration as
    /// it was. Configuration changes take effect with the next `trigger`.
    pub fn apply(&mut self, command: Command) -> Result<Flow> {
        match command {
            Command::Cpu(n) => {
                self.config.cpus = checked("cpu", n, CPU_RANGE)? as usize;
            }
            Command::NrBench(n) => {
                self.config.nr_bench = checked("nr_bench", n, NR_BENCH_RANGE)?;
            }
            Command::Delay(n) => {
                self.config.delay_us = checked("delay", n, DELAY_RANGE)?;
            }
            Command::Budget(n) => {
                let Ok(budget) = u32::try_from(n) else {
                    bail!("budget {} does not fit in 32 bits", n);
                };
                if budget != self.config.budget {
                    // The budget is fixed per lock, so the locks are rebuilt.
                    // A run in progress keeps the ones it started with.
                    self.targets = Targets::new(budget);
                    self.config.budget = budget;
                }
            }
            Command::Trigger(kind) => self.trigger(kind)?,
            Command::Status => print!("{}", self.status()),
            Command::Ready => println!("{}", u8::from(self.ready()?)),
            Command::Wait => self.wait()?,
            Command::Quit => {
                self.stop();
                self.wait()?;
                return Ok(Flow::Quit);
            }
        }
        log::debug!("applied {:?}", command);
        Ok(Flow::Continue)
    }

    /// Applies commands in order, stopping at `quit` or the first error.
    pub fn apply_all<I>(&mut self, commands: I) -> Result<Flow>
    where
        I: IntoIterator<Item = Command>,
    {
        for command in commands {
            if self.apply(command)? == Flow::Quit {
                return Ok(Flow::Quit);
            }
        }
        Ok(Flow::Continue)
    }

    /// Waits for a run still in progress. Call before dropping the session.
    pub fn finish(&mut self) -> Result<()> {
        self.wait()
    }

    fn trigger(&mut self, kind: LockKind) -> Result<()> {
        self.ready()?;
        if let Some(run) = &self.run {
            bail!("{:?} run still in progress, cannot start {:?}", run.kind, kind);
        }

        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let targets = self.targets.clone();
        let config = self.config;
        let handle = thread::Builder::new()
            .name("dlock-run".into())
            .spawn(move || bench::run_benchmark(kind, &config, &targets, &flag))
            .context("Failed to start benchmark run")?;

        self.run = Some(Run { kind, stop, handle });
        Ok(())
    }

    /// Whether every worker has finished. Collects a finished run.
    ///
    /// # Returns
    ///
    /// `true` when no run is in progress, or the error of a run that
    /// finished unsuccessfully.
    pub fn ready(&mut self) -> Result<bool> {
        match &self.run {
            Some(run) if !run.handle.is_finished() => Ok(false),
            _ => self.wait().map(|()| true),
        }
    }

    /// Raises the stop flag of the run in progress, if any.
    fn stop(&self) {
        if let Some(run) = &self.run {
            log::info!("stopping {:?} run", run.kind);
            run.stop.store(true, Ordering::Relaxed);
        }
    }

    /// Blocks until the run in progress ends, then records its report.
    fn wait(&mut self) -> Result<()> {
        let Some(run) = self.run.take() else {
            return Ok(());
        };
        let report = run
            .handle
            .join()
            .map_err(|_| anyhow!("{:?} run panicked", run.kind))??;
        report.print();
        self.last = Some(report);
        Ok(())
    }

    /// Human-readable configuration, lock words and node pools in use.
    pub fn status(&self) -> String {
        let mut out = String::new();
        let counter_addr = self.targets.delegate.raw() as *const _ as usize;
        let list_addr = self.targets.delegate_list.raw() as *const _ as usize;

        let _ = writeln!(out, "cpu: {}", self.config.cpus);
        let _ = writeln!(out, "nr_bench: {}", self.config.nr_bench);
        let _ = writeln!(out, "delay: {} us", self.config.delay_us);
        let _ = writeln!(out, "budget: {}", self.config.budget);
        let _ = writeln!(out, "lock word: {:?}", self.targets.delegate.raw().state());
        let _ = writeln!(
            out,
            "list lock word: {:?}",
            self.targets.delegate_list.raw().state()
        );
        {
            let list = self.targets.spin_list.lock();
            let _ = writeln!(out, "spin list: {}/{} entries", list.len(), list.capacity());
        }
        match &self.run {
            Some(run) if !run.handle.is_finished() => {
                let _ = writeln!(out, "run: {:?} in progress", run.kind);
            }
            Some(run) => {
                let _ = writeln!(out, "run: {:?} finished", run.kind);
            }
            None => {
                let _ = writeln!(out, "run: idle");
            }
        }

        for cpu in 0..ThreadCpus::online() {
            let Some(snap) = pool::snapshot(cpu) else {
                continue;
            };
            if snap.depth == 0 && snap.slots.iter().all(|s| s.lock == 0) {
                continue;
            }
            let _ = write!(out, "cpu {:3} depth {}:", cpu, snap.depth);
            for (idx, slot) in snap.slots.iter().enumerate() {
                let owner = match slot.lock {
                    0 => "-",
                    addr if addr == counter_addr => "counter",
                    addr if addr == list_addr => "list",
                    _ => "other",
                };
                let level = Level::from_index(idx).map_or("?", Level::name);
                let _ = write!(out, " [{} {} {:?}]", level, owner, slot.state);
            }
            out.push('\n');
        }

        if let Some(report) = &self.last {
            let _ = writeln!(
                out,
                "last run: {:?} lock, {} requests, {:.2} requests/s",
                report.kind,
                report.requests,
                report.throughput()
            );
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_module_parameters() {
        let session = Session::new();
        assert_eq!(session.config().cpus, 2);
        assert_eq!(session.config().nr_bench, 500_000);
        assert_eq!(session.config().delay_us, 0);
        assert!(session.last_report().is_none());
    }

    #[test]
    fn out_of_range_values_leave_config_unchanged() {
        let mut session = Session::new();
        let before = *session.config();

        assert!(session.apply(Command::Cpu(0)).is_err());
        assert!(session.apply(Command::Cpu(MAX_CPUS as u64)).is_err());
        assert!(session.apply(Command::NrBench(0)).is_err());
        assert!(session.apply(Command::NrBench(500_001)).is_err());
        assert!(session.apply(Command::Delay(101)).is_err());
        assert!(session.apply(Command::Budget(u64::MAX)).is_err());
        assert_eq!(*session.config(), before);
    }

    #[test]
    fn in_range_values_are_applied() {
        let mut session = Session::new();
        session
            .apply_all([
                Command::Cpu(4),
                Command::NrBench(1),
                Command::Delay(100),
                Command::Budget(8),
            ])
            .unwrap();
        let config = session.config();
        assert_eq!((config.cpus, config.nr_bench, config.delay_us, config.budget), (4, 1, 100, 8));
        assert_eq!(session.targets.delegate.raw().budget(), 8);
        assert_eq!(session.targets.delegate_list.raw().budget(), 8);
    }

    #[test]
    fn trigger_records_report() {
        let mut session = Session::new();
        let flow = session
            .apply_all([
                Command::Cpu(3),
                Command::NrBench(500),
                Command::Trigger(LockKind::Delegate),
                Command::Wait,
                Command::Trigger(LockKind::Spin),
                Command::Wait,
            ])
            .unwrap();
        assert_eq!(flow, Flow::Continue);

        let report = session.last_report().unwrap();
        assert_eq!(report.kind, LockKind::Spin);
        assert_eq!(report.counter, 1_500);
        assert!(session.status().contains("last run: Spin lock, 1500 requests"));
    }

    #[test]
    fn quit_stops_remaining_commands() {
        let mut session = Session::new();
        let flow = session
            .apply_all([Command::Quit, Command::Cpu(7)])
            .unwrap();
        assert_eq!(flow, Flow::Quit);
        assert_eq!(session.config().cpus, 2);
    }

    #[test]
    fn status_shows_free_lock_between_runs() {
        let session = Session::new();
        let status = session.status();
        assert!(status.contains("lock word: Free"));
        assert!(status.contains("list lock word: Free"));
        assert!(status.contains("run: idle"));
        assert!(status.contains("budget: 4294967295"));
    }

    #[test]
    fn ready_is_set_without_a_run() {
        let mut session = Session::new();
        assert!(session.ready().unwrap());
        session.finish().unwrap();
        assert!(session.last_report().is_none());
    }

    #[test]
    fn list_trigger_runs_in_the_background() {
        let mut session = Session::new();
        session
            .apply_all([
                Command::Cpu(2),
                Command::NrBench(5),
                Command::Trigger(LockKind::DelegateList),
                Command::Wait,
            ])
            .unwrap();
        assert!(session.ready().unwrap());

        let report = session.last_report().unwrap();
        assert_eq!(report.kind, LockKind::DelegateList);
        assert_eq!(report.requests, 10);
        assert_eq!(report.counter, report.expected_counter());
        assert!(session.targets.delegate_list.run(|l| l.is_empty()));
    }

    #[test]
    fn quit_stops_a_run_in_progress() {
        let mut session = Session::new();
        session
            .apply_all([
                Command::Cpu(2),
                Command::NrBench(500_000),
                Command::Delay(100),
                Command::Trigger(LockKind::Delegate),
            ])
            .unwrap();

        assert!(!session.ready().unwrap());
        assert!(session.status().contains("run: Delegate in progress"));
        let err = session.apply(Command::Trigger(LockKind::Spin)).unwrap_err();
        assert!(err.to_string().contains("still in progress"));

        assert_eq!(session.apply(Command::Quit).unwrap(), Flow::Quit);
        assert!(session.ready().unwrap());
        let report = session.last_report().unwrap();
        assert!(report.stopped);
        assert!(report.requests < 1_000_000);
        assert_eq!(report.counter, report.requests);
    }
}
