/// Bounded output collection
///
/// Each stream is drained by its own thread until EOF. Bytes past the limit
/// are counted and discarded, never buffered; the reader keeps draining so a
/// chatty program cannot block on a full pipe and hide its real outcome.
use std::io::{ErrorKind, Read};
use std::thread::{self, JoinHandle};

const CHUNK_SIZE: usize = 8192;

/// Bytes collected from one stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedStream {
    /// At most `limit` bytes.
    pub data: Vec<u8>,
    /// Bytes the program wrote, including discarded ones.
    pub total_bytes: usize,
    pub truncated: bool,
    /// Set when the read failed for a reason other than EOF.
    pub read_error: Option<String>,
}

impl CapturedStream {
    /// Lossy UTF-8 text with the truncation marker appended when needed.
    pub fn render(&self, limit: usize) -> String {
        let mut text = String::from_utf8_lossy(&self.data).into_owned();
        if self.truncated {
            text.push_str(&truncation_marker(limit));
        }
        text
    }
}

pub fn truncation_marker(limit: usize) -> String {
    format!("\n[output truncated after {} bytes]", limit)
}

/// Read `stream` to EOF, keeping the first `limit` bytes.
pub fn collect_bounded<R: Read>(mut stream: R, limit: usize) -> CapturedStream {
    let mut captured = CapturedStream::default();
    let mut chunk = [0u8; CHUNK_SIZE];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                captured.total_bytes = captured.total_bytes.saturating_add(n);
                let room = limit.saturating_sub(captured.data.len());
                if n > room {
                    captured.truncated = true;
                }
                captured.data.extend_from_slice(&chunk[..n.min(room)]);
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                captured.read_error = Some(e.to_string());
                break;
            }
        }
    }

    captured
}

/// Drain `stream` on a background thread.
pub fn spawn_collector<R>(name: &str, stream: R, limit: usize) -> std::io::Result<JoinHandle<CapturedStream>>
where
    R: Read + Send + 'static,
{
    thread::Builder::new()
        .name(format!("twibox-{}", name))
        .spawn(move || collect_bounded(stream, limit))
}

/// Join a collector, treating a panicked reader as an empty stream.
pub fn join_collector(handle: Option<JoinHandle<CapturedStream>>) -> CapturedStream {
    match handle {
        Some(handle) => handle.join().unwrap_or_else(|_| {
            log::error!("Output collector thread panicked");
            CapturedStream {
                read_error: Some("collector panicked".to_string()),
                ..CapturedStream::default()
            }
        }),
        None => CapturedStream::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn keeps_everything_under_the_limit() {
        let captured = collect_bounded(Cursor::new(b"hello\n".to_vec()), 64);
        assert_eq!(captured.data, b"hello\n");
        assert!(!captured.truncated);
        assert_eq!(captured.render(64), "hello\n");
    }

    #[test]
    fn truncates_but_counts_everything() {
        let input = vec![b'a'; 3 * CHUNK_SIZE + 17];
        let captured = collect_bounded(Cursor::new(input), 100);
        assert_eq!(captured.data.len(), 100);
        assert_eq!(captured.total_bytes, 3 * CHUNK_SIZE + 17);
        assert!(captured.truncated);
        assert!(captured
            .render(100)
            .ends_with("\n[output truncated after 100 bytes]"));
    }

    #[test]
    fn exact_limit_is_not_truncation() {
        let captured = collect_bounded(Cursor::new(vec![b'x'; 10]), 10);
        assert!(!captured.truncated);
        assert_eq!(captured.data.len(), 10);
    }

    #[test]
    fn collector_thread_drains_pipe() {
        let handle = spawn_collector("test", Cursor::new(b"abc".to_vec()), 2).unwrap();
        let captured = join_collector(Some(handle));
        assert_eq!(captured.data, b"ab");
        assert!(captured.truncated);
        assert_eq!(join_collector(None), CapturedStream::default());
    }
}
