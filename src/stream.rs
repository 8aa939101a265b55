use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};

use bytes::Bytes;
use tokio::io::AsyncWrite;
use tracing::debug;

const SEGMENT_SIZE: usize = 16 * 1024;

// Body bytes accumulate in fixed-size segments so capture never asks the
// allocator for one huge contiguous block and dropping the buffer is cheap.
#[derive(Debug, Default)]
struct SegmentedBuffer {
    segments: Vec<Vec<u8>>,
    len: u64,
}

impl SegmentedBuffer {
    fn append(&mut self, mut data: &[u8]) {
        self.len += data.len() as u64;
        while !data.is_empty() {
            let segment = match self.segments.last_mut() {
                Some(segment) if segment.len() < SEGMENT_SIZE => segment,
                _ => {
                    self.segments.push(Vec::with_capacity(SEGMENT_SIZE));
                    self.segments.last_mut().expect("just pushed")
                }
            };
            let take = data.len().min(SEGMENT_SIZE - segment.len());
            segment.extend_from_slice(&data[..take]);
            data = &data[take..];
        }
    }

    fn clear(&mut self) {
        self.segments = Vec::new();
        self.len = 0;
    }

    fn concat(&self) -> Bytes {
        let mut out = Vec::with_capacity(self.len as usize);
        for segment in &self.segments {
            out.extend_from_slice(segment);
        }
        Bytes::from(out)
    }
}

/// Write-through tee over the outbound response sink.
///
/// Every write is forwarded to the inner sink; bytes actually written are
/// also buffered for capture until the cumulative total would pass the
/// ceiling, at which point the buffer is dropped and buffering stays off for
/// the rest of the response. Forwarding is never affected.
pub struct CaptureStream<S> {
    inner: S,
    buffer: SegmentedBuffer,
    buffering_enabled: bool,
    max_bytes: u64,
}

impl<S> CaptureStream<S> {
    pub fn new(inner: S, max_bytes: u64) -> Self {
        Self {
            inner,
            buffer: SegmentedBuffer::default(),
            buffering_enabled: true,
            max_bytes,
        }
    }

    pub fn buffering_enabled(&self) -> bool {
        self.buffering_enabled
    }

    pub fn bytes_captured(&self) -> u64 {
        self.buffer.len
    }

    /// Releases the capture buffer immediately; forwarding continues.
    pub fn disable_buffering(&mut self) {
        self.buffering_enabled = false;
        self.buffer.clear();
    }

    /// The captured body. Only meaningful while buffering is enabled.
    pub fn captured_body(&self) -> Bytes {
        self.buffer.concat()
    }

    /// Uncaptured access to the inner sink, for head bytes.
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S> AsyncWrite for CaptureStream<S>
where
    S: AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(written)) => {
                if this.buffering_enabled && written > 0 {
                    if this.buffer.len + written as u64 > this.max_bytes {
                        debug!(
                            limit = this.max_bytes,
                            "response body passed the capture ceiling, buffering off"
                        );
                        this.disable_buffering();
                    } else {
                        this.buffer.append(&buf[..written]);
                    }
                }
                Poll::Ready(Ok(written))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
