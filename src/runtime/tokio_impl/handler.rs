//! Per-connection echo task.

use crate::runtime::{ConnSettings, ConnectionBuffer};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Echo everything read from `stream` back to it until the peer sends EOF.
///
/// Each read pulls at most the buffer's free space and each write hands over
/// at most `write_chunk` bytes. When a write is short, the unwritten tail of
/// that chunk is retried on its own before the next chunk is cut.
///
/// A capped read means more may already be waiting. Whatever is immediately
/// available after it is pulled into the buffer but not echoed; it goes out
/// together with the peer's next send, or at EOF.
pub async fn handle_connection<S>(mut stream: S, settings: ConnSettings) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buffer = ConnectionBuffer::new(settings.buffer_capacity);

    'conn: loop {
        let holding = !buffer.is_empty();
        let requested = buffer.remaining();
        let n = stream.read(buffer.spare_mut()).await?;
        if n == 0 {
            trace!(held = buffer.len(), "Peer closed its write half");
            break;
        }
        buffer.commit(n);
        trace!(n, "Read");
        flush(&mut stream, &mut buffer, settings.write_chunk).await?;

        if holding {
            // Release everything that is already waiting
            while let Some(n) = try_fill(&mut stream, &mut buffer).await? {
                flush(&mut stream, &mut buffer, settings.write_chunk).await?;
                if n == 0 {
                    break 'conn;
                }
            }
            continue;
        }

        let mut capped = n == requested;
        while capped {
            match try_fill(&mut stream, &mut buffer).await? {
                None => break,
                Some(0) => break 'conn,
                Some(_) if buffer.is_full() => {
                    flush(&mut stream, &mut buffer, settings.write_chunk).await?;
                }
                Some(n) => {
                    trace!(n, "Holding");
                    capped = false;
                }
            }
        }
    }

    flush(&mut stream, &mut buffer, settings.write_chunk).await?;
    stream.shutdown().await
}

/// One read that does not wait: `None` when nothing is available yet.
async fn try_fill<S>(
    stream: &mut S,
    buffer: &mut ConnectionBuffer,
) -> io::Result<Option<usize>>
where
    S: AsyncRead + Unpin,
{
    if buffer.is_full() {
        return Ok(None);
    }
    let read = tokio::select! {
        biased;
        res = stream.read(buffer.spare_mut()) => Some(res),
        _ = std::future::ready(()) => None,
    };
    match read {
        None => Ok(None),
        Some(res) => {
            let n = res?;
            buffer.commit(n);
            Ok(Some(n))
        }
    }
}

/// Write the whole buffer back in chunks of at most `write_chunk` bytes.
async fn flush<S>(
    stream: &mut S,
    buffer: &mut ConnectionBuffer,
    write_chunk: usize,
) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut pending = 0;
    while !buffer.is_empty() {
        let limit = if pending > 0 { pending } else { write_chunk };
        let chunk = buffer.peek_chunk(limit);
        let chunk_len = chunk.len();

        let written = stream.write(chunk).await?;
        if written == 0 {
            return Err(io::ErrorKind::WriteZero.into());
        }
        buffer.drain(written);
        pending = chunk_len - written;
    }
    Ok(())
}
