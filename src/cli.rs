//! CLI utilities for rime.
//!
//! The utilities present in this module can be used to create an interactive client
//! on top of a [`Session`](crate::Session).
use std::io::{BufRead, Write};

use crate::statement::Consistency;

/// Possible commands from a user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// Exit command `.exit`
    Exit,
    /// Change the consistency used for following statements, `.consistency QUORUM`
    Consistency(Consistency),
    /// Mark following statements idempotent or not, `.idempotent on`
    Idempotent(bool),
    /// Print session counters `.metrics`
    Metrics,
    /// Query text sent to the cluster
    Statement(String),
}

/// Prompt user for a valid rime command.
///
/// # Errors
/// If the reader or the writer fail, or the input is not a valid command.
pub fn prompt<R, W>(mut reader: R, mut writer: W) -> Result<Command, String>
where
    R: BufRead,
    W: Write,
{
    let mut s = String::default();
    write!(&mut writer, "> ").map_err(|e| e.to_string())?;
    writer.flush().map_err(|e| e.to_string())?;
    if reader.read_line(&mut s).map_err(|e| e.to_string())? == 0 {
        return Ok(Command::Exit);
    }

    parse(s.trim_end())
}

fn parse(s: &str) -> Result<Command, String> {
    let mut parts = s.split_whitespace();
    match parts.next() {
        Some(".exit") => Ok(Command::Exit),
        Some(".metrics") => Ok(Command::Metrics),
        Some(".consistency") => {
            let level = parts.next().unwrap_or_default();
            Consistency::from_name(level)
                .map(Command::Consistency)
                .ok_or_else(|| format!("unknown consistency level '{level}'"))
        }
        Some(".idempotent") => match parts.next() {
            Some("on") => Ok(Command::Idempotent(true)),
            Some("off") => Ok(Command::Idempotent(false)),
            _ => Err("usage: .idempotent on|off".to_string()),
        },
        _ if !s.starts_with('.') => Ok(Command::Statement(s.to_string())),
        _ => Err(format!("unrecognized command '{}'", s)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_prints_correctly() {
        let input = b".exit\n";
        let mut output = Vec::new();

        prompt(&input[..], &mut output).unwrap();

        let output = String::from_utf8(output).expect("not valid UTF-8");
        assert_eq!("> ", output);
    }

    #[test]
    fn prompt_handles_statements() {
        let input = b"\n";
        let mut output = Vec::new();

        let res = prompt(&input[..], &mut output).unwrap();
        assert_eq!(Command::Statement(String::default()), res);
    }

    #[test]
    fn prompt_exits_at_end_of_input() {
        let mut output = Vec::new();

        let res = prompt(&b""[..], &mut output).unwrap();
        assert_eq!(Command::Exit, res);
    }

    #[test]
    fn prompt_handles_settings() {
        let mut output = Vec::new();

        let res = prompt(&b".consistency quorum\n"[..], &mut output).unwrap();
        assert_eq!(Command::Consistency(Consistency::Quorum), res);

        let res = prompt(&b".idempotent off\n"[..], &mut output).unwrap();
        assert_eq!(Command::Idempotent(false), res);
    }

    #[test]
    #[should_panic(expected = "unknown consistency level 'most'")]
    fn prompt_unknown_consistency() {
        let mut output = Vec::new();

        prompt(&b".consistency most\n"[..], &mut output).unwrap();
    }

    #[test]
    #[should_panic(expected = "unrecognized command '.something_wrong'")]
    fn prompt_unrecognized_command() {
        let input = b".something_wrong\n";
        let mut output = Vec::new();

        prompt(&input[..], &mut output).unwrap();
    }
}
