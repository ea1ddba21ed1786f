//! Debug logging for the marking engine.
//!
//! Logging is disabled by default and has near-zero cost in that state: the
//! event-construction closure handed to [`Logger::log`] is never invoked.
//! To enable it, set the `PARMARK_LOG` environment variable to one of
//!
//! * `all`: stream every event to stderr as it happens;
//! * `all:<path>`: the same, into a file;
//! * `tail:<n>`: keep the final `n` events and dump them when the phase
//!   ends;
//! * `tail:<n>:<path>`: the same, into a file.
//!
//! Events are shipped over a channel to a writer thread so workers never
//! block on I/O while holding the global-queue mutex.

use std::collections::VecDeque;
use std::env;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::thread;

use crossbeam_channel::{Receiver, Sender};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Event {
    /// A worker entered its run loop.
    WorkerStart { worker: usize },
    /// A worker left its run loop.
    WorkerTerminate { worker: usize },
    /// The initiator began enumerating roots on its own stack.
    RootScanStart { worker: usize },
    RootScanDone { worker: usize },
    /// A worker donated `count` objects to the global queue.
    ObjectsOffered { worker: usize, count: usize },
    /// A worker transferred `count` objects from the global queue.
    ObjectsGrabbed { worker: usize, count: usize },
    /// A worker parked on the global queue; `waiters` counts it.
    WorkerWaiting { worker: usize, waiters: usize },
    WorkerWoken { worker: usize },
    /// This worker was the last to park: the phase is complete.
    QuiescenceReached { worker: usize },
    /// Both queues were full; a reference was marked by direct recursion.
    DeferOverflow { worker: usize },
    /// Write out anything buffered.
    Flush,
}

/// Handle for emitting [`Event`]s; owned by the registry, shared by
/// reference with every worker.
pub(crate) struct Logger {
    sender: Option<Sender<Event>>,
    writer: Option<thread::JoinHandle<()>>,
}

impl Logger {
    pub(crate) fn new() -> Logger {
        let env_log = match env::var("PARMARK_LOG") {
            Ok(value) => value,
            Err(_) => return Logger::disabled(),
        };

        let (sender, receiver) = crossbeam_channel::unbounded();
        let writer = if let Some(rest) = strip_prefix(&env_log, "tail") {
            let (capacity, sink) = parse_tail(rest);
            thread::spawn(move || tail_writer(receiver, capacity, sink))
        } else if let Some(rest) = strip_prefix(&env_log, "all") {
            let sink = open_sink(strip_colon(rest));
            thread::spawn(move || all_writer(receiver, sink))
        } else {
            panic!("unrecognized PARMARK_LOG value: {}", env_log);
        };

        Logger {
            sender: Some(sender),
            writer: Some(writer),
        }
    }

    pub(crate) fn disabled() -> Logger {
        Logger {
            sender: None,
            writer: None,
        }
    }

    #[inline]
    pub(crate) fn log(&self, event: impl FnOnce() -> Event) {
        if let Some(sender) = &self.sender {
            // The writer never hangs up first, but a send error must not
            // take a worker down mid-phase.
            let _ = sender.send(event());
        }
    }
}

impl Drop for Logger {
    fn drop(&mut self) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(Event::Flush);
        }
        // Dropping the sender above disconnects the channel; the writer
        // drains what is left and exits.
        if let Some(writer) = self.writer.take() {
            let _ = writer.join();
        }
    }
}

fn strip_prefix<'a>(value: &'a str, prefix: &str) -> Option<&'a str> {
    if value.starts_with(prefix) {
        Some(&value[prefix.len()..])
    } else {
        None
    }
}

fn strip_colon(rest: &str) -> Option<&str> {
    if rest.is_empty() {
        None
    } else if rest.starts_with(':') {
        Some(&rest[1..])
    } else {
        panic!("unrecognized PARMARK_LOG suffix: {}", rest);
    }
}

fn parse_tail(rest: &str) -> (usize, Box<dyn Write + Send>) {
    let rest = match strip_colon(rest) {
        Some(rest) => rest,
        None => panic!("PARMARK_LOG=tail requires a capacity, e.g. tail:1000"),
    };
    let (capacity, path) = match rest.find(':') {
        Some(split) => (&rest[..split], Some(&rest[split + 1..])),
        None => (rest, None),
    };
    let capacity = capacity
        .parse()
        .unwrap_or_else(|_| panic!("invalid PARMARK_LOG tail capacity: {}", capacity));
    (capacity, open_sink(path))
}

fn open_sink(path: Option<&str>) -> Box<dyn Write + Send> {
    match path {
        Some(path) => {
            let file = File::create(path)
                .unwrap_or_else(|err| panic!("failed to open log file {}: {}", path, err));
            Box::new(BufWriter::new(file))
        }
        None => Box::new(io::stderr()),
    }
}

fn all_writer(receiver: Receiver<Event>, mut sink: Box<dyn Write + Send>) {
    for event in receiver {
        if event == Event::Flush {
            let _ = sink.flush();
        } else {
            let _ = writeln!(sink, "{:?}", event);
        }
    }
    let _ = sink.flush();
}

fn tail_writer(receiver: Receiver<Event>, capacity: usize, mut sink: Box<dyn Write + Send>) {
    let mut ring = VecDeque::with_capacity(capacity);
    let mut skipped = false;
    for event in receiver {
        if event == Event::Flush {
            if skipped {
                let _ = writeln!(sink, "...earlier events dropped...");
            }
            for event in ring.drain(..) {
                let _ = writeln!(sink, "{:?}", event);
            }
            let _ = sink.flush();
            skipped = false;
        } else {
            if ring.len() >= capacity {
                ring.pop_front();
                skipped = true;
            }
            ring.push_back(event);
        }
    }
    let _ = sink.flush();
}
