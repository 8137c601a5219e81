//! Low-latency hand-off of the sidecar's mixed PCM output.

use crate::constants::{STDOUT_BUFFER_FRAMES, STEREO_FRAME_BYTE_SIZE};
use flume::{Receiver, Sender};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::trace;

/// The mixed audio produced by a mixer sidecar, framed for the voice
/// sender.
///
/// Frames are raw interleaved stereo PCM, 48 kHz, signed 16-bit
/// little-endian, 3840 bytes each. The internal buffer holds at most
/// [`STDOUT_BUFFER_FRAMES`] frames so a deck switch becomes audible within
/// ~40 ms; backpressure beyond that lands in the OS pipe.
///
/// [`STDOUT_BUFFER_FRAMES`]: crate::constants::STDOUT_BUFFER_FRAMES
#[derive(Debug)]
pub struct PcmStream {
    rx: Receiver<Vec<u8>>,
}

impl PcmStream {
    /// Receives the next full audio frame, or `None` once the sidecar's
    /// stdout has closed and the buffer has drained.
    pub async fn next_frame(&self) -> Option<Vec<u8>> {
        self.rx.recv_async().await.ok()
    }

    /// Receives a frame if one is already buffered.
    #[must_use]
    pub fn try_next_frame(&self) -> Option<Vec<u8>> {
        self.rx.try_recv().ok()
    }

    /// Adapts the stream for `Stream`-oriented voice senders.
    pub fn into_stream(self) -> impl futures::Stream<Item = Vec<u8>> {
        self.rx.into_stream()
    }
}

/// Reads sidecar stdout into frames until EOF or error, then signals the
/// returned future's holder by dropping the sender.
pub(crate) fn frame_reader<R>(stdout: R) -> (PcmStream, impl std::future::Future<Output = bool>)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let (tx, rx) = flume::bounded(STDOUT_BUFFER_FRAMES);

    (PcmStream { rx }, pump(stdout, tx))
}

/// Returns `true` on clean EOF, `false` on a read error.
async fn pump<R>(mut stdout: R, tx: Sender<Vec<u8>>) -> bool
where
    R: AsyncRead + Send + Unpin + 'static,
{
    loop {
        let mut frame = vec![0u8; STEREO_FRAME_BYTE_SIZE];

        match stdout.read_exact(&mut frame).await {
            Ok(_) => {
                if tx.send_async(frame).await.is_err() {
                    // Voice sender went away; stop pulling audio.
                    trace!("PCM consumer dropped, stopping stdout pump.");
                    return true;
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                trace!("Sidecar stdout reached EOF.");
                return true;
            },
            Err(e) => {
                trace!("Sidecar stdout read failed: {}", e);
                return false;
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn frames_are_cut_at_voice_frame_size() {
        let (mut wr, rd) = tokio::io::duplex(64 * 1024);
        let (stream, pump) = frame_reader(rd);
        let task = tokio::spawn(pump);

        wr.write_all(&vec![7u8; STEREO_FRAME_BYTE_SIZE * 2]).await.unwrap();
        drop(wr);

        let first = stream.next_frame().await.expect("first frame");
        let second = stream.next_frame().await.expect("second frame");
        assert_eq!(first.len(), STEREO_FRAME_BYTE_SIZE);
        assert_eq!(second.len(), STEREO_FRAME_BYTE_SIZE);
        assert!(stream.next_frame().await.is_none());

        assert!(task.await.unwrap());
    }

    #[tokio::test]
    async fn partial_trailing_frame_is_dropped_at_eof() {
        let (mut wr, rd) = tokio::io::duplex(64 * 1024);
        let (stream, pump) = frame_reader(rd);
        let task = tokio::spawn(pump);

        let mut bytes = vec![1u8; STEREO_FRAME_BYTE_SIZE];
        bytes.extend_from_slice(&[2u8; 100]);
        wr.write_all(&bytes).await.unwrap();
        drop(wr);

        assert!(stream.next_frame().await.is_some());
        assert!(stream.next_frame().await.is_none());
        assert!(task.await.unwrap());
    }
}
