mod baseline;
mod bench;
mod control;
mod stats;
mod workload;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use dlock_io::{Command, LockKind};
use std::io::{self, BufRead};
use std::path::PathBuf;

use control::{Flow, Session};

#[derive(Parser)]
#[command(name = "dlock", about = "Delegate lock benchmark driver")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LockArg {
    Delegate,
    Spin,
    DelegateList,
    SpinList,
}

impl From<LockArg> for LockKind {
    fn from(arg: LockArg) -> Self {
        match arg {
            LockArg::Delegate => LockKind::Delegate,
            LockArg::Spin => LockKind::Spin,
            LockArg::DelegateList => LockKind::DelegateList,
            LockArg::SpinList => LockKind::SpinList,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run one benchmark with the given parameters.
    Bench {
        #[arg(long, value_enum, default_value_t = LockArg::Delegate)]
        lock: LockArg,
        #[arg(short, long, default_value_t = 2)]
        threads: u64,
        #[arg(short = 'n', long, default_value_t = 500_000)]
        iters: u64,
        #[arg(short, long, default_value_t = 0)]
        delay: u64,
        #[arg(short, long)]
        budget: Option<u64>,
    },
    /// Execute a control script.
    Run { script: PathBuf },
    /// Read control commands from stdin.
    Console,
}

fn console(session: &mut Session) -> Result<()> {
    let stdin = io::stdin();
    for (idx, line) in stdin.lock().lines().enumerate() {
        let line = line.context("Failed to read stdin")?;
        let command = match Command::parse(idx + 1, &line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                log::error!("{}", e);
                continue;
            }
        };
        match session.apply(command) {
            Ok(Flow::Quit) => break,
            Ok(Flow::Continue) => {}
            Err(e) => log::error!("{:#}", e),
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let mut session = Session::new();

    match cli.command {
        Commands::Bench {
            lock,
            threads,
            iters,
            delay,
            budget,
        } => {
            let mut commands = vec![
                Command::Cpu(threads),
                Command::NrBench(iters),
                Command::Delay(delay),
            ];
            commands.extend(budget.map(Command::Budget));
            commands.extend([Command::Trigger(lock.into()), Command::Wait]);
            session.apply_all(commands)?;
        }
        Commands::Run { script } => {
            let commands = dlock_io::script::load_script(&script)?;
            log::info!("{} commands from {}", commands.len(), script.display());
            session.apply_all(commands)?;
        }
        Commands::Console => console(&mut session)?,
    }
    session.finish()
}
