// src/lib.rs

#![doc = r#"
# famon

famon is a client for file alteration monitoring. A [`Session`](session::Session) registers
files, directories and collections with a notification backend and hands back a stream of
change events through a non-blocking `pending()` / `next_event()` pair. An
[`EventLoop`](event_loop::EventLoop) interleaves those events with other input, such as
interactive commands, on a single task.

## Modules

- [`backend`]: The backend interface, the `notify`-based filesystem backend and an in-memory backend.
- [`config`]: Configuration loading and merging from CLI, file, and environment.
- [`console`]: Command parsing and member listing for the interactive monitor.
- [`error`]: Error taxonomy.
- [`event`]: Change events and event codes.
- [`event_loop`]: Cooperative loop over a session and auxiliary input sources.
- [`registry`]: Request identifiers and lifecycle bookkeeping.
- [`request`]: Monitor requests and their state machine.
- [`session`]: Backend connection, subscriptions and event decoding.

## Example

```no_run
use famon::session::Session;

# fn main() -> famon::error::Result<()> {
let mut session = Session::open("example")?;
let request = session.monitor_directory("/tmp")?;

while session.pending()? {
    let event = session.next_event()?;
    println!("{event}");
}
session.cancel(request.id())?;
# Ok(())
# }
```
"#]

pub mod backend;
pub mod config;
pub mod console;
pub mod error;
pub mod event;
pub mod event_loop;
pub mod registry;
pub mod request;
pub mod session;

pub use error::{MonitorError, Result};
pub use event::{Event, EventCode};
pub use event_loop::EventLoop;
pub use request::{MonitorRequest, RequestId, RequestKind, RequestState};
pub use session::Session;
