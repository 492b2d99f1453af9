//! Wire codec for the gateway line link.
//!
//! Outbound commands are single ASCII lines of the form
//! `<verb> <node_id>[ <args>]`; root-scope verbs (`reboot`, `routes`,
//! `wdt_feed`, ...) omit the node id. Inbound lines are classified into typed
//! responses: `###ACK`, `###STATUS`, `###TIMEOUT`, `###PEND` and `###ERR`
//! notifications, plus the gateway command prompt `MASTER>` which may be
//! embedded anywhere in a line. Everything else is passed through as
//! [`Response::Other`] and never mutates state.

use std::fmt;

/// Ack code on a `connect` meaning the node still holds our previous session.
pub const STILL_CONFIGURED: u32 = 3;

// ─── Outbound ───────────────────────────────────────────────────────────────

/// Destination of an outbound command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// The gateway board itself.
    Root,
    /// A leaf node, addressed by its numeric id.
    Node(u32),
}

/// A fully formatted command line (no trailing newline).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub target: Target,
    line: String,
}

impl Command {
    /// Node command without arguments.
    pub fn node(id: u32, verb: &str) -> Self {
        Command {
            target: Target::Node(id),
            line: format!("{verb} {id}"),
        }
    }

    /// Node command with a pre-formatted argument tail. An empty tail
    /// degrades to the bare form.
    pub fn node_with_args(id: u32, verb: &str, args: impl fmt::Display) -> Self {
        let line = format!("{verb} {id} {args}");
        Command {
            target: Target::Node(id),
            line: line.trim_end().to_string(),
        }
    }

    /// Root-scope command, verb plus optional arguments.
    pub fn root(line: impl Into<String>) -> Self {
        Command {
            target: Target::Root,
            line: line.into(),
        }
    }

    pub fn as_line(&self) -> &str {
        &self.line
    }

    pub fn into_line(self) -> String {
        self.line
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.line)
    }
}

// ─── Inbound ────────────────────────────────────────────────────────────────

/// One classified inbound line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// The gateway is ready for the next command line.
    Prompt,
    /// The in-flight command was acknowledged with a result code.
    Ack { node: u32, code: u32 },
    /// The in-flight command timed out on the radio path.
    Timeout { node: u32 },
    /// The gateway accepted the command and is forwarding it; the real
    /// ACK or TIMEOUT follows later.
    Pend { node: u32 },
    /// Unsolicited sensor status notification.
    Status { node: u32, value: u32 },
    /// The gateway rejected the command.
    Err { node: u32 },
    /// Anything the grammar does not recognise.
    Other(String),
}

/// Classify one inbound line.
///
/// Grammar: `###<TYPE>[ -]?<NODE>([ -]<RESULT>)?` with TYPE matched
/// case-insensitively; the `###` marker may be preceded by line noise.
pub fn parse_line(raw: &str) -> Response {
    let line = raw.trim();

    if line.contains("MASTER>") {
        return Response::Prompt;
    }

    let Some(pos) = line.find("###") else {
        return Response::Other(line.to_string());
    };
    let rest = &line[pos + 3..];

    let ty_len = rest
        .bytes()
        .take_while(|b| b.is_ascii_alphabetic())
        .count();
    let (ty, tail) = rest.split_at(ty_len);

    // Optional separator between type and node id.
    let tail = match tail.as_bytes().first() {
        Some(b' ') | Some(b'-') => &tail[1..],
        _ => tail,
    };

    let node_len = tail.bytes().take_while(|b| b.is_ascii_digit()).count();
    let (node_str, tail) = tail.split_at(node_len);
    let Ok(node) = node_str.parse::<u32>() else {
        return Response::Other(line.to_string());
    };

    // Mandatory separator before the optional result field.
    let result = match tail.as_bytes().first() {
        Some(b' ') | Some(b'-') => {
            let t = &tail[1..];
            let len = t.bytes().take_while(|b| b.is_ascii_digit()).count();
            t[..len].parse::<u32>().ok()
        }
        _ => None,
    };

    match ty.to_ascii_uppercase().as_str() {
        "ACK" => Response::Ack {
            node,
            code: result.unwrap_or(0),
        },
        "STATUS" => Response::Status {
            node,
            value: result.unwrap_or(0),
        },
        "TIMEOUT" => Response::Timeout { node },
        "PEND" => Response::Pend { node },
        "ERR" => Response::Err { node },
        _ => Response::Other(line.to_string()),
    }
}
