//! IPC bridge: stdin reader and stdout event emitter.
//!
//! A blocking stdin reader thread sends deserialized commands through an
//! mpsc channel; events go out as JSON lines on stdout. Diagnostics never
//! touch stdout.

use std::io::{self, BufRead, Write};

use tokio::sync::mpsc;
use tracing::{debug, error};

use super::{TutorCommand, TutorEvent};

/// Emit a `TutorEvent` as a JSON line on stdout and flush.
pub fn emit_event(event: &TutorEvent) {
    let stdout = io::stdout();
    let mut handle = stdout.lock();
    // Pipe may be closed.
    let _ = write_event(&mut handle, event);
}

/// Write one event line to `out`.
pub fn write_event<W: Write>(out: &mut W, event: &TutorEvent) -> io::Result<()> {
    let json = serde_json::to_string(event).map_err(io::Error::other)?;
    writeln!(out, "{}", json)?;
    out.flush()
}

/// Emit an error event that is not tied to a voice session failure.
pub fn emit_error(kind: &str, message: &str) {
    emit_event(&TutorEvent::Error {
        kind: kind.to_string(),
        message: message.to_string(),
    });
}

/// If the object has a `"type"` field but no `"command"` field, rename
/// `"type"` to `"command"` so serde can deserialize it.
fn normalize_command_json(input: &str) -> String {
    if let Ok(mut obj) = serde_json::from_str::<serde_json::Map<String, serde_json::Value>>(input)
    {
        if !obj.contains_key("command") {
            if let Some(type_val) = obj.remove("type") {
                obj.insert("command".to_string(), type_val);
                if let Ok(json) = serde_json::to_string(&obj) {
                    return json;
                }
            }
        }
    }
    input.to_string()
}

/// Parse one input line into a command.
pub fn parse_command(line: &str) -> Result<TutorCommand, serde_json::Error> {
    serde_json::from_str(&normalize_command_json(line))
}

/// Spawn a blocking thread that reads JSON lines from stdin and forwards the
/// parsed commands through the returned channel.
///
/// The thread exits when stdin is closed (host gone) or on a read error.
pub fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<TutorCommand> {
    let (tx, rx) = mpsc::unbounded_channel();

    std::thread::spawn(move || {
        let stdin = io::stdin();
        let reader = stdin.lock();
        for line in reader.lines() {
            match line {
                Ok(text) => {
                    let trimmed = text.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    match parse_command(trimmed) {
                        Ok(cmd) => {
                            debug!(?cmd, "Received command");
                            if tx.send(cmd).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            // Context can be long; keep the log line short.
                            let preview: String = trimmed.chars().take(120).collect();
                            error!("Invalid JSON command: {} (input: {})", e, preview);
                            emit_error("invalid_command", &format!("Invalid JSON command: {}", e));
                        }
                    }
                }
                Err(e) => {
                    error!("stdin read error: {}", e);
                    break;
                }
            }
        }
        debug!("stdin reader thread exiting");
    });

    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_key_is_accepted_as_command() {
        assert_eq!(parse_command(r#"{"type": "ping"}"#).unwrap(), TutorCommand::Ping {});
        assert_eq!(
            normalize_command_json(r#"{"command": "ping", "type": "x"}"#),
            r#"{"command": "ping", "type": "x"}"#
        );
    }

    #[test]
    fn test_invalid_json_is_an_error() {
        assert!(parse_command("not json").is_err());
        assert!(parse_command(r#"{"context": "no command"}"#).is_err());
    }

    #[test]
    fn test_write_event_is_one_line() {
        let mut out = Vec::new();
        write_event(&mut out, &TutorEvent::Ready {}).unwrap();
        write_event(&mut out, &TutorEvent::Stopping {}).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(
            text,
            "{\"event\":\"ready\",\"data\":{}}\n{\"event\":\"stopping\",\"data\":{}}\n"
        );
    }
}
