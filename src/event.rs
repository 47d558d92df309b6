// src/event.rs
use crate::request::RequestId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// The kind of change an [`Event`] reports.
///
/// `Exists` and `EndExist` bracket the existence scan emitted when a directory or
/// collection subscription is established; every other code reports a live change.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventCode {
    Changed,
    Deleted,
    StartExecuting,
    StopExecuting,
    Created,
    Moved,
    Acknowledge,
    Exists,
    EndExist,
}

impl EventCode {
    /// Returns `true` for the codes that belong to an existence scan.
    #[must_use]
    pub const fn is_scan(self) -> bool {
        matches!(self, Self::Exists | Self::EndExist)
    }

    /// The numeric code used on the FAM wire protocol.
    #[must_use]
    pub const fn as_raw(self) -> u32 {
        match self {
            Self::Changed => 1,
            Self::Deleted => 2,
            Self::StartExecuting => 3,
            Self::StopExecuting => 4,
            Self::Created => 5,
            Self::Moved => 6,
            Self::Acknowledge => 7,
            Self::Exists => 8,
            Self::EndExist => 9,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Changed => "Changed",
            Self::Deleted => "Deleted",
            Self::StartExecuting => "StartExecuting",
            Self::StopExecuting => "StopExecuting",
            Self::Created => "Created",
            Self::Moved => "Moved",
            Self::Acknowledge => "Acknowledge",
            Self::Exists => "Exists",
            Self::EndExist => "EndExist",
        }
    }
}

impl TryFrom<u32> for EventCode {
    type Error = u32;

    fn try_from(raw: u32) -> Result<Self, Self::Error> {
        Ok(match raw {
            1 => Self::Changed,
            2 => Self::Deleted,
            3 => Self::StartExecuting,
            4 => Self::StopExecuting,
            5 => Self::Created,
            6 => Self::Moved,
            7 => Self::Acknowledge,
            8 => Self::Exists,
            9 => Self::EndExist,
            other => return Err(other),
        })
    }
}

impl fmt::Display for EventCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One change notification, decoded by a [`Session`](crate::session::Session).
///
/// # Fields
/// - `code`: What happened.
/// - `path`: The affected path. For directory and collection requests this is usually a
///   member of the subscribed path, joined onto it.
/// - `source`: The request that produced the event. The request may have been cancelled
///   since; queued events are still delivered.
/// - `hostname`: The host the change happened on.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub code: EventCode,
    pub path: PathBuf,
    pub source: RequestId,
    pub hostname: String,
}

impl Event {
    #[must_use]
    pub fn new(code: EventCode, path: impl Into<PathBuf>, source: RequestId) -> Self {
        Self {
            code,
            path: path.into(),
            source,
            hostname: "localhost".to_string(),
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} \"{}\" ({})", self.code, self.path.display(), self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_codes_follow_the_protocol_numbering() {
        for raw in 1..=9 {
            let code = EventCode::try_from(raw).unwrap();
            assert_eq!(code.as_raw(), raw);
        }
        assert_eq!(EventCode::try_from(0), Err(0));
        assert_eq!(EventCode::try_from(10), Err(10));
    }

    #[test]
    fn display_matches_protocol_dump_format() {
        let ev = Event::new(EventCode::Created, "/tmp/d/new.txt", RequestId::new(4));
        assert_eq!(ev.to_string(), "Created \"/tmp/d/new.txt\" (4)");
        assert_eq!(ev.hostname, "localhost");
    }

    #[test]
    fn serializes_as_json() {
        let ev = Event::new(EventCode::EndExist, "/srv", RequestId::new(2));
        let json = serde_json::to_string(&ev).unwrap();
        assert_eq!(
            json,
            r#"{"code":"EndExist","path":"/srv","source":2,"hostname":"localhost"}"#
        );
    }
}
