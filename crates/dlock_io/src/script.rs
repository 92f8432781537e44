use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

use crate::command::Command;

/// Parses every line of `text` into commands.
///
/// Stops at the first malformed line.
pub fn parse_script(text: &str) -> Result<Vec<Command>> {
    let mut commands = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        if let Some(command) = Command::parse(idx + 1, line)? {
            commands.push(command);
        }
    }
    Ok(commands)
}

/// Loads a command script from disk.
pub fn load_script<P: AsRef<Path>>(path: P) -> Result<Vec<Command>> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read script {}", path.display()))?;
    parse_script(&text).with_context(|| format!("Invalid script {}", path.display()))
}
