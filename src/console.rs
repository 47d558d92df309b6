// src/console.rs

//! The interactive surface of the `famon` binary.
//!
//! Commands arrive as lines on an auxiliary input source of the
//! [`EventLoop`](crate::event_loop::EventLoop); events update a [`Listing`] of the
//! monitored members and produce the lines printed to the user.

use crate::event::{Event, EventCode};
use std::collections::BTreeSet;
use std::path::PathBuf;

/// A command typed at the prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `ls`: print the current listing.
    List,
    /// `q` or `quit`: stop monitoring.
    Quit,
    Unknown(String),
}

impl Command {
    /// Parses one input line. Blank lines yield `None`.
    #[must_use]
    pub fn parse(line: &str) -> Option<Self> {
        let word = line.split_whitespace().next()?;
        Some(match word.to_ascii_lowercase().as_str() {
            "ls" => Self::List,
            "q" | "quit" => Self::Quit,
            _ => Self::Unknown(line.trim().to_string()),
        })
    }
}

/// Members seen through existence scans and live events.
#[derive(Debug, Default)]
pub struct Listing {
    members: BTreeSet<PathBuf>,
}

impl Listing {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `event` and returns the line to show the user, if any.
    ///
    /// Scan events are recorded silently.
    pub fn apply(&mut self, event: &Event) -> Option<String> {
        let path = event.path.display();
        match event.code {
            EventCode::Exists => {
                self.members.insert(event.path.clone());
                None
            }
            EventCode::EndExist => None,
            EventCode::Created => {
                self.members.insert(event.path.clone());
                Some(format!("File created: {path}"))
            }
            EventCode::Deleted => {
                self.members.remove(&event.path);
                Some(format!("File deleted: {path}"))
            }
            EventCode::Changed => Some(format!("File changed: {path}")),
            EventCode::Moved => Some(format!("File moved: {path}")),
            EventCode::StartExecuting => Some(format!("File started executing: {path}")),
            EventCode::StopExecuting => Some(format!("File stopped executing: {path}")),
            EventCode::Acknowledge => None,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Comma-separated member list.
    #[must_use]
    pub fn render(&self) -> String {
        self.members
            .iter()
            .map(|member| member.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::RequestId;

    #[test]
    fn parses_commands() {
        assert_eq!(Command::parse("ls\n"), Some(Command::List));
        assert_eq!(Command::parse("  LS -l"), Some(Command::List));
        assert_eq!(Command::parse("q"), Some(Command::Quit));
        assert_eq!(Command::parse("quit"), Some(Command::Quit));
        assert_eq!(
            Command::parse("help me\n"),
            Some(Command::Unknown("help me".to_string()))
        );
        assert_eq!(Command::parse("   \n"), None);
    }

    #[test]
    fn listing_tracks_scan_and_live_events() {
        let id = RequestId::new(1);
        let mut listing = Listing::new();
        assert_eq!(listing.apply(&Event::new(EventCode::Exists, "d/a", id)), None);
        assert_eq!(listing.apply(&Event::new(EventCode::Exists, "d/b", id)), None);
        assert_eq!(listing.apply(&Event::new(EventCode::EndExist, "d", id)), None);
        assert_eq!(
            listing.apply(&Event::new(EventCode::Created, "d/c", id)),
            Some("File created: d/c".to_string())
        );
        assert_eq!(
            listing.apply(&Event::new(EventCode::Deleted, "d/a", id)),
            Some("File deleted: d/a".to_string())
        );
        assert_eq!(listing.len(), 2);
        assert_eq!(listing.render(), "d/b, d/c");
    }
}
