//! Full-duplex byte pump between two open connections.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const BUFFER_SIZE: usize = 8192;

/// How long the surviving direction may keep flowing once the other has ended.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Relay bytes between `a` and `b` until either direction ends.
///
/// When one direction reaches EOF the write side towards the other peer is
/// shut down, and the remaining direction gets [`DRAIN_TIMEOUT`] to finish
/// before both streams are dropped. A peer that never closes cannot keep the
/// relay alive. If either direction fails the error is returned and both
/// streams are dropped.
///
/// Returns (bytes_a_to_b, bytes_b_to_a).
pub async fn pipe<A, B>(a: A, b: B, idle_timeout: Option<Duration>) -> io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite,
    B: AsyncRead + AsyncWrite,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let mut a_to_b = 0u64;
    let mut b_to_a = 0u64;
    {
        let forward = copy_half(&mut a_read, &mut b_write, idle_timeout, &mut a_to_b);
        let backward = copy_half(&mut b_read, &mut a_write, idle_timeout, &mut b_to_a);
        tokio::pin!(forward, backward);

        tokio::select! {
            result = &mut forward => {
                result?;
                drain(backward.as_mut()).await?;
            }
            result = &mut backward => {
                result?;
                drain(forward.as_mut()).await?;
            }
        }
    }

    Ok((a_to_b, b_to_a))
}

/// Let the surviving direction finish, abandoning it after [`DRAIN_TIMEOUT`].
async fn drain<F>(remaining: Pin<&mut F>) -> io::Result<()>
where
    F: Future<Output = io::Result<()>>,
{
    match tokio::time::timeout(DRAIN_TIMEOUT, remaining).await {
        Ok(result) => result,
        Err(_) => Ok(()),
    }
}

async fn copy_half<R, W>(
    reader: &mut R,
    writer: &mut W,
    idle_timeout: Option<Duration>,
    total: &mut u64,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    loop {
        let read_result = if let Some(timeout) = idle_timeout {
            match tokio::time::timeout(timeout, reader.read(&mut buf)).await {
                Ok(result) => result,
                Err(_) => return Err(io::Error::new(io::ErrorKind::TimedOut, "idle timeout")),
            }
        } else {
            reader.read(&mut buf).await
        };

        match read_result? {
            0 => break,
            n => {
                writer.write_all(&buf[..n]).await?;
                *total += n as u64;
            }
        }
    }
    // Peer may already be gone; the relay is finished either way.
    let _ = writer.shutdown().await;
    Ok(())
}
