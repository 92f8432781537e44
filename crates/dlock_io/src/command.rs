use std::fmt;

use nom::IResult;
use nom::bytes::complete::take_while1;
use nom::character::complete::{digit1, space0, space1};
use nom::combinator::{all_consuming, map_res, opt};
use nom::sequence::{delimited, pair, preceded};

/// Which lock a benchmark run exercises.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    /// The delegate lock, requests shipped with `run_delegated`.
    Delegate,
    /// Plain test-and-set spinlock, for comparison.
    Spin,
    /// Linked list add/remove rounds through the delegate lock.
    DelegateList,
    /// Linked list add/remove rounds under the spinlock.
    SpinList,
}

impl LockKind {
    /// The kind selected by `trigger <n>`.
    pub const fn from_trigger(n: u64) -> Option<Self> {
        match n {
            1 => Some(LockKind::Delegate),
            2 => Some(LockKind::Spin),
            3 => Some(LockKind::DelegateList),
            4 => Some(LockKind::SpinList),
            _ => None,
        }
    }

    /// Whether requests go through the delegate lock.
    pub const fn is_delegate(self) -> bool {
        matches!(self, LockKind::Delegate | LockKind::DelegateList)
    }

    /// Whether each request is a round of list operations.
    pub const fn is_list(self) -> bool {
        matches!(self, LockKind::DelegateList | LockKind::SpinList)
    }
}

/// One control command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Number of worker cores for the next run.
    Cpu(u64),
    /// Requests issued by each worker.
    NrBench(u64),
    /// Artificial delay inside the critical section, in microseconds.
    Delay(u64),
    /// Combiner budget of the delegate lock.
    Budget(u64),
    /// Start a run in the background. `trigger 1` runs the delegate lock,
    /// `trigger 2` the baseline spinlock, `trigger 3` and `trigger 4` the
    /// same pair on the linked list workload.
    Trigger(LockKind),
    /// Print configuration and lock state.
    Status,
    /// Print `1` once the workers of the last run have finished, else `0`.
    Ready,
    /// Block until the current run has finished.
    Wait,
    /// Ask running workers to stop, then end the session.
    Quit,
}

/// A line that is not a valid command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub line: usize,
    pub text: String,
    pub reason: &'static str,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {} ({:?})", self.line, self.reason, self.text)
    }
}

impl std::error::Error for ParseError {}

fn name(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_')(input)
}

fn number(input: &str) -> IResult<&str, u64> {
    map_res(digit1, str::parse::<u64>)(input)
}

fn command_line(input: &str) -> IResult<&str, (&str, Option<u64>)> {
    all_consuming(delimited(
        space0,
        pair(name, opt(preceded(space1, number))),
        space0,
    ))(input)
}

impl Command {
    /// Parses one line; `line` is only used for error reporting.
    ///
    /// Returns `Ok(None)` for blank lines and comments.
    pub fn parse(line: usize, text: &str) -> Result<Option<Command>, ParseError> {
        let body = text.split('#').next().unwrap_or("").trim_end();
        if body.trim().is_empty() {
            return Ok(None);
        }

        let err = |reason| ParseError {
            line,
            text: text.to_string(),
            reason,
        };

        let (_, (name, value)) = command_line(body).map_err(|_| err("malformed command"))?;
        let needs_value = |value: Option<u64>| value.ok_or_else(|| err("missing value"));

        let command = match name {
            "cpu" => Command::Cpu(needs_value(value)?),
            "nr_bench" => Command::NrBench(needs_value(value)?),
            "delay" => Command::Delay(needs_value(value)?),
            "budget" => Command::Budget(needs_value(value)?),
            "trigger" => match LockKind::from_trigger(needs_value(value)?) {
                Some(kind) => Command::Trigger(kind),
                None => return Err(err("unknown trigger")),
            },
            "status" | "ready" | "wait" | "quit" if value.is_some() => {
                return Err(err("unexpected value"));
            }
            "status" => Command::Status,
            "ready" => Command::Ready,
            "wait" => Command::Wait,
            "quit" => Command::Quit,
            _ => return Err(err("unknown command")),
        };
        Ok(Some(command))
    }
}
