//! Text control interface for the lock benchmark.
//!
//! A benchmark session is driven by short `name value` commands, one per
//! line, in the spirit of writing numbers into control files. This crate
//! turns such lines into typed commands and loads whole command scripts.

/// Grammar and typed representation of control commands.
///
/// Parses a single line such as `cpu 4` or `trigger 1` into a [`Command`].
/// Blank lines and `#` comments produce no command.
pub mod command;

/// Loading of command scripts from files and strings.
///
/// Reads a script, parses every line and reports the first malformed line
/// with its line number.
pub mod script;

pub use command::{Command, LockKind, ParseError};
