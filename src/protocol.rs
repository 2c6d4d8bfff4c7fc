//! Control protocol between manager and daemons.
//!
//! Requests and replies are single ASCII lines:
//!
//! ```text
//! manager -> daemon   STATE | BYE | START [run] | STOP
//! daemon  -> manager  OK | ERROR [detail] | STARTED [name ...]
//! ```

use std::collections::BTreeSet;
use std::fmt;

/// Run identifier used when `START` carries no (or a blank) argument.
pub const DEFAULT_RUN: &str = "default";

/// Instruction received on a control channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Subscribe to component list pushes
    State,
    /// End a state subscription
    Bye,
    /// Start the platform for the given run
    Start(String),
    /// Stop the platform
    Stop,
    /// Anything else, kept verbatim for logging
    Unknown(String),
}

impl Command {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        let (instr, arg) = match line.split_once(char::is_whitespace) {
            Some((instr, arg)) => (instr, arg.trim()),
            None => (line, ""),
        };

        match (instr, arg) {
            ("STATE", "") => Command::State,
            ("BYE", "") => Command::Bye,
            ("STOP", "") => Command::Stop,
            ("START", "") => Command::Start(DEFAULT_RUN.to_string()),
            ("START", run) => Command::Start(run.to_string()),
            _ => Command::Unknown(line.to_string()),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::State => f.write_str("STATE"),
            Command::Bye => f.write_str("BYE"),
            Command::Start(run) => write!(f, "START {run}"),
            Command::Stop => f.write_str("STOP"),
            Command::Unknown(raw) => f.write_str(raw),
        }
    }
}

/// Set of running component names.
///
/// Kept sorted so that two lists compare equal regardless of the order the
/// supervisor reported them in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComponentList(BTreeSet<String>);

impl ComponentList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>) {
        self.0.insert(name.into());
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for ComponentList {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

/// Line sent back by a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ok,
    Error(Option<String>),
    Started(ComponentList),
}

impl Reply {
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        let (word, rest) = match line.split_once(' ') {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };

        match word {
            "OK" => Some(Reply::Ok),
            "ERROR" if rest.is_empty() => Some(Reply::Error(None)),
            "ERROR" => Some(Reply::Error(Some(rest.to_string()))),
            "STARTED" => Some(Reply::Started(rest.split_whitespace().collect())),
            _ => None,
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Ok => f.write_str("OK"),
            Reply::Error(None) => f.write_str("ERROR"),
            Reply::Error(Some(detail)) => write!(f, "ERROR {detail}"),
            Reply::Started(list) => {
                f.write_str("STARTED")?;
                for name in list.iter() {
                    write!(f, " {name}")?;
                }
                Ok(())
            }
        }
    }
}
