//! Dedicated reader threads per child (§9: "the equivalent in a threaded
//! language is two dedicated reader threads per child writing into a
//! bounded channel that the supervisor consumes"). Using nonblocking
//! buffered channels keeps one stream from stalling because the other is
//! quiet.

use std::io::{BufRead, BufReader, Read};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::thread;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamSource {
    Stdout,
    Stderr,
}

#[derive(Debug)]
pub enum LineMessage {
    Line(StreamSource, String),
    Closed(StreamSource),
}

/// Spawn a reader thread over `reader`, sending each line (stripped of the
/// trailing newline) to `tx`, followed by a `Closed` marker on EOF.
pub fn spawn_line_pump<R>(source: StreamSource, reader: R, tx: Sender<LineMessage>)
where
    R: Read + Send + 'static,
{
    let name = match source {
        StreamSource::Stdout => "fetchd-supervisor-stdout",
        StreamSource::Stderr => "fetchd-supervisor-stderr",
    };
    let result = thread::Builder::new().name(name.to_string()).spawn(move || {
        let mut buf_reader = BufReader::new(reader);
        let mut line = String::new();
        loop {
            line.clear();
            match buf_reader.read_line(&mut line) {
                Ok(0) => break,
                Ok(_) => {
                    let trimmed = line.trim_end_matches(['\n', '\r']).to_string();
                    if tx.send(LineMessage::Line(source, trimmed)).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
        let _ = tx.send(LineMessage::Closed(source));
    });
    if let Err(err) = result {
        crate::debug_eprintln!("failed to spawn {name} reader thread: {err}");
        let _ = tx.send(LineMessage::Closed(source));
    }
}

pub fn new_channel() -> (Sender<LineMessage>, Receiver<LineMessage>) {
    channel()
}
