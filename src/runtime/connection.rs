//! Connection state machine for the echo relay.
//!
//! A `Connection` ties one non-blocking stream to one `ConnectionBuffer` and
//! implements the echo policy: pull at most the buffer's free space from the
//! peer, then immediately push buffered bytes back in bounded chunks.
//!
//! ```text
//! Accepted --activate--> Active --peer EOF--> Closing --flushed--> Closed
//!                          |                     |
//!                          +------ I/O error ----+----> (dropped by dispatcher)
//! ```
//!
//! The handler never blocks. It is driven by readiness notifications from
//! the dispatcher and reports what it needs next through
//! [`Connection::interest`].

use crate::runtime::buffer::ConnectionBuffer;
use mio::Interest;
use std::io::{self, Read, Write};
use tracing::trace;

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Accepted but not yet registered for readiness.
    Accepted,
    /// Reading and writing interleaved.
    Active,
    /// Peer sent EOF; flushing what is left, no more reads.
    Closing,
    /// Fully flushed after EOF; ready to be dropped.
    Closed,
}

/// Per-connection buffer policy shared by every handler of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnSettings {
    /// Bytes of buffer per connection.
    pub buffer_capacity: usize,
    /// Upper bound on bytes handed to one write call.
    pub write_chunk: usize,
}

/// Result of a single read cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadOutcome {
    /// The read filled all free space; more may be waiting in the stream.
    Capped,
    /// Fewer bytes than requested, or an interrupted read.
    Short,
    /// Nothing left to read right now, or the peer closed.
    Exhausted,
}

/// A single client connection.
#[derive(Debug)]
pub struct Connection<S> {
    stream: S,
    buffer: ConnectionBuffer,
    state: ConnState,
    write_chunk: usize,
    /// Unwritten tail of a chunk the OS only partly accepted. These bytes sit
    /// at the head of `buffer` and go out alone before a new chunk is cut.
    pending: usize,
    /// A capped read left bytes in the stream. They stay there until the
    /// next readable notification, which then drains the stream.
    holding: bool,
    /// Reads stopped on a full buffer; resumed once the flush completes.
    stalled: bool,
    /// Last flush stopped on `WouldBlock`.
    write_blocked: bool,
}

impl<S: Read + Write> Connection<S> {
    /// Create a new connection in the accepted state.
    pub fn new(stream: S, settings: ConnSettings) -> Self {
        Self {
            stream,
            buffer: ConnectionBuffer::new(settings.buffer_capacity),
            state: ConnState::Accepted,
            write_chunk: settings.write_chunk,
            pending: 0,
            holding: false,
            stalled: false,
            write_blocked: false,
        }
    }

    /// Transition to active once the stream is registered.
    pub fn activate(&mut self) {
        if self.state == ConnState::Accepted {
            self.state = ConnState::Active;
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.state == ConnState::Closed
    }

    #[cfg(test)]
    pub fn is_holding(&self) -> bool {
        self.holding
    }

    /// Number of bytes received but not yet echoed.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    #[cfg(test)]
    pub fn stream(&self) -> &S {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Handle a read-readiness notification.
    ///
    /// Reads until the stream is exhausted, except that a capped read stops
    /// the cycle and leaves the rest in the stream for the next
    /// notification. A notification that arrives while bytes are held, or
    /// after the peer has shut down its write half (`read_closed`), drains
    /// the stream completely so held bytes coalesce with the new ones.
    pub fn on_readable(&mut self, read_closed: bool) -> io::Result<()> {
        let drain = std::mem::take(&mut self.holding) || read_closed;
        self.read_until_exhausted(drain)
    }

    /// Handle a write-readiness notification.
    pub fn on_writable(&mut self) -> io::Result<()> {
        self.flush()?;
        if self.stalled && self.buffer.is_empty() {
            self.read_until_exhausted(true)?;
        }
        Ok(())
    }

    /// Readiness the connection must be registered for, `None` once closed.
    pub fn interest(&self) -> Option<Interest> {
        match self.state {
            ConnState::Closed => None,
            ConnState::Closing => Some(Interest::WRITABLE),
            ConnState::Accepted | ConnState::Active if self.write_blocked => {
                Some(Interest::READABLE | Interest::WRITABLE)
            }
            ConnState::Accepted | ConnState::Active => Some(Interest::READABLE),
        }
    }

    fn read_until_exhausted(&mut self, drain: bool) -> io::Result<()> {
        self.stalled = false;
        while self.state == ConnState::Active {
            if self.buffer.is_full() {
                // Writes are blocked; pick reading up again after the flush
                self.stalled = true;
                return Ok(());
            }
            match self.read_cycle()? {
                ReadOutcome::Capped if !drain => {
                    self.holding = true;
                    return Ok(());
                }
                ReadOutcome::Capped | ReadOutcome::Short => {}
                ReadOutcome::Exhausted => return Ok(()),
            }
        }
        Ok(())
    }

    /// One read of at most the buffer's free space, followed by a flush.
    fn read_cycle(&mut self) -> io::Result<ReadOutcome> {
        let requested = self.buffer.remaining();

        let outcome = match self.buffer.fill_from(&mut self.stream) {
            Ok(0) => {
                trace!(buffered = self.buffer.len(), "Peer closed its write half");
                self.state = ConnState::Closing;
                ReadOutcome::Exhausted
            }
            Ok(n) if n == requested => {
                trace!(n, "Read, capped");
                ReadOutcome::Capped
            }
            Ok(n) => {
                trace!(n, "Read");
                ReadOutcome::Short
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                return Ok(ReadOutcome::Exhausted);
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                return Ok(ReadOutcome::Short);
            }
            Err(e) => return Err(e),
        };

        self.flush()?;
        Ok(outcome)
    }

    /// Write buffered bytes back until empty or the stream would block.
    fn flush(&mut self) -> io::Result<()> {
        while !self.buffer.is_empty() {
            let limit = if self.pending > 0 {
                self.pending
            } else {
                self.write_chunk
            };
            let chunk_len = self.buffer.peek_chunk(limit).len();

            match self.buffer.write_to(&mut self.stream, limit) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
                }
                Ok(n) => {
                    trace!(n, chunk_len, "Wrote");
                    self.pending = chunk_len - n;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.write_blocked = true;
                    return Ok(());
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        self.write_blocked = false;
        if self.state == ConnState::Closing {
            self.state = ConnState::Closed;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Scripted stream: reads come from a queue of steps, writes are
    /// recorded call by call and may be throttled.
    #[derive(Debug, Default)]
    struct ScriptedStream {
        pub reads: VecDeque<io::Result<Vec<u8>>>,
        /// Bytes each write call accepts; `None` blocks, missing means unlimited.
        pub write_budget: VecDeque<Option<usize>>,
        pub writes: Vec<Vec<u8>>,
        pub read_sizes: Vec<usize>,
    }

    impl ScriptedStream {
        pub fn echoed(&self) -> Vec<u8> {
            self.writes.concat()
        }
    }

    impl Read for ScriptedStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            assert!(!buf.is_empty(), "zero-length read issued");
            self.read_sizes.push(buf.len());
            match self.reads.pop_front() {
                None => Err(io::ErrorKind::WouldBlock.into()),
                Some(Err(e)) => Err(e),
                Some(Ok(data)) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    if n < data.len() {
                        self.reads.push_front(Ok(data[n..].to_vec()));
                    }
                    Ok(n)
                }
            }
        }
    }

    impl Write for ScriptedStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let n = match self.write_budget.pop_front() {
                Some(None) => return Err(io::ErrorKind::WouldBlock.into()),
                Some(Some(budget)) => budget.min(buf.len()),
                None => buf.len(),
            };
            self.writes.push(buf[..n].to_vec());
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn settings(capacity: usize) -> ConnSettings {
        ConnSettings {
            buffer_capacity: capacity,
            write_chunk: capacity,
        }
    }

    fn active(stream: ScriptedStream, capacity: usize) -> Connection<ScriptedStream> {
        let mut conn = Connection::new(stream, settings(capacity));
        conn.activate();
        conn
    }

    #[test]
    fn test_state_transitions() {
        let mut stream = ScriptedStream::default();
        stream.reads.push_back(Ok(b"hi".to_vec()));
        stream.reads.push_back(Ok(Vec::new()));
        let mut conn = Connection::new(stream, settings(16));

        assert_eq!(conn.state(), ConnState::Accepted);
        conn.activate();
        assert_eq!(conn.state(), ConnState::Active);
        assert_eq!(conn.interest(), Some(Interest::READABLE));

        // A short read keeps reading, so the EOF right behind it is seen
        conn.on_readable(false).unwrap();
        assert!(conn.is_closed());
        assert_eq!(conn.interest(), None);
        assert_eq!(conn.stream().echoed(), b"hi");
    }

    #[test]
    fn test_observed_trace() {
        let mut stream = ScriptedStream::default();
        stream.reads.push_back(Ok(b"12345678".to_vec()));
        let mut conn = active(stream, 16);

        conn.on_readable(false).unwrap();
        assert_eq!(conn.stream().writes, vec![b"12345678".to_vec()]);
        assert!(!conn.is_holding());

        // A 20-byte burst: one capped read, 4 bytes stay in the stream
        conn.stream_mut()
            .reads
            .push_back(Ok(b"12345678123456781234".to_vec()));
        conn.on_readable(false).unwrap();
        assert_eq!(conn.stream().writes.len(), 2);
        assert_eq!(conn.stream().writes[1], b"1234567812345678");
        assert!(conn.is_holding());
        assert_eq!(conn.stream().reads.len(), 1);

        // The next send releases the held bytes together with the new ones
        conn.stream_mut()
            .reads
            .push_back(Ok(b"56781234567812345678".to_vec()));
        conn.on_readable(false).unwrap();

        let tail: Vec<u8> = conn.stream().writes[2..].concat();
        assert_eq!(tail, b"123456781234567812345678");
        assert!(conn.stream().writes.iter().all(|w| w.len() <= 16));
        assert!(conn.stream().read_sizes.iter().all(|&n| n <= 16));
        assert!(conn.stream().reads.is_empty());
        assert!(!conn.is_holding());
        assert_eq!(conn.buffered(), 0);
        assert_eq!(conn.state(), ConnState::Active);
    }

    #[test]
    fn test_capped_read_waits_for_next_notification() {
        let mut stream = ScriptedStream::default();
        stream.reads.push_back(Ok(b"abcdefghijklmnopqrstuvwxyz".to_vec()));
        let mut conn = active(stream, 8);

        conn.on_readable(false).unwrap();
        assert_eq!(conn.stream().echoed(), b"abcdefgh");
        assert_eq!(conn.stream().read_sizes, vec![8]);

        // Held bytes are drained in capacity-sized steps on the next one
        conn.on_readable(false).unwrap();
        assert_eq!(conn.stream().echoed(), b"abcdefghijklmnopqrstuvwxyz");
        assert_eq!(conn.stream().read_sizes, vec![8, 8, 8, 8, 8]);
        assert!(!conn.is_holding());
    }

    #[test]
    fn test_read_closed_drains_without_holding() {
        let mut stream = ScriptedStream::default();
        stream.reads.push_back(Ok(b"12345678123456781234".to_vec()));
        stream.reads.push_back(Ok(Vec::new()));
        let mut conn = active(stream, 16);

        conn.on_readable(true).unwrap();
        assert!(conn.is_closed());
        assert_eq!(conn.stream().echoed(), b"12345678123456781234");
    }

    #[test]
    fn test_partial_write_is_retried_alone() {
        let mut stream = ScriptedStream::default();
        stream.reads.push_back(Ok(b"abcdefgh".to_vec()));
        stream.write_budget.extend([Some(3), None]);
        let mut conn = Connection::new(
            stream,
            ConnSettings {
                buffer_capacity: 8,
                write_chunk: 4,
            },
        );
        conn.activate();

        conn.on_readable(false).unwrap();
        assert_eq!(conn.stream().writes, vec![b"abc".to_vec()]);
        assert_eq!(conn.buffered(), 5);
        assert_eq!(
            conn.interest(),
            Some(Interest::READABLE | Interest::WRITABLE)
        );

        conn.on_writable().unwrap();
        // "d" finishes the first chunk before "efgh" is cut
        assert_eq!(
            conn.stream().writes,
            vec![b"abc".to_vec(), b"d".to_vec(), b"efgh".to_vec()]
        );
        assert_eq!(conn.interest(), Some(Interest::READABLE));
    }

    #[test]
    fn test_full_buffer_skips_read() {
        let mut stream = ScriptedStream::default();
        stream.reads.push_back(Ok(b"0123456789abcdefXYZ".to_vec()));
        stream.write_budget.push_back(None);
        let mut conn = active(stream, 16);

        conn.on_readable(false).unwrap();
        assert_eq!(conn.buffered(), 16);

        // Full: no zero-length read, no EOF misdetection
        conn.on_readable(false).unwrap();
        assert_eq!(conn.state(), ConnState::Active);
        assert_eq!(conn.stream().read_sizes, vec![16]);

        // Reading resumes once the flush frees the buffer
        conn.on_writable().unwrap();
        assert_eq!(conn.buffered(), 0);
        assert_eq!(conn.stream().echoed(), b"0123456789abcdefXYZ");
    }

    #[test]
    fn test_eof_flushes_before_close() {
        let mut stream = ScriptedStream::default();
        stream.reads.push_back(Ok(b"bye".to_vec()));
        stream.write_budget.push_back(None);
        let mut conn = active(stream, 16);

        conn.on_readable(false).unwrap();
        assert_eq!(conn.buffered(), 3);

        conn.stream_mut().reads.push_back(Ok(Vec::new()));
        conn.stream_mut().write_budget.push_back(None);
        conn.on_readable(false).unwrap();
        assert_eq!(conn.state(), ConnState::Closing);
        assert_eq!(conn.interest(), Some(Interest::WRITABLE));
        let reads = conn.stream().read_sizes.len();

        // Closing never reads again
        conn.on_readable(false).unwrap();
        assert_eq!(conn.stream().read_sizes.len(), reads);

        conn.on_writable().unwrap();
        assert!(conn.is_closed());
        assert_eq!(conn.stream().echoed(), b"bye");
    }

    #[test]
    fn test_io_error_is_returned() {
        let mut stream = ScriptedStream::default();
        stream
            .reads
            .push_back(Err(io::ErrorKind::ConnectionReset.into()));
        let mut conn = active(stream, 16);

        let err = conn.on_readable(false).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    }

    #[test]
    fn test_write_zero_is_fatal() {
        let mut stream = ScriptedStream::default();
        stream.reads.push_back(Ok(b"x".to_vec()));
        stream.write_budget.push_back(Some(0));
        let mut conn = active(stream, 16);

        let err = conn.on_readable(false).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WriteZero);
    }
}
