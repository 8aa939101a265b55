use anyhow::{Result, bail};
use http::{HeaderMap, HeaderValue, StatusCode};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::stream::CaptureStream;

/// Status line and headers of the outbound response.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

impl ResponseHead {
    pub fn new() -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
        }
    }
}

impl Default for ResponseHead {
    fn default() -> Self {
        Self::new()
    }
}

enum BodySink<'a, S> {
    Plain(&'a mut S),
    Capture(CaptureStream<&'a mut S>),
}

/// The response surface handed to downstream handlers.
///
/// Status and headers stay mutable until the first body byte; that first
/// write latches the response as started, fires the one-shot start callback,
/// and puts the encoded head on the wire. Body bytes then flow through the
/// plain sink or, during capture, through a [`CaptureStream`] tee.
pub struct ResponseWriter<'a, S> {
    head: ResponseHead,
    sink: Option<BodySink<'a, S>>,
    started: bool,
    on_start: Option<Box<dyn FnOnce() + Send + 'a>>,
    date_source: Option<Box<dyn FnOnce() -> Option<HeaderValue> + Send + 'a>>,
}

impl<'a, S> ResponseWriter<'a, S>
where
    S: AsyncWrite + Send + Unpin,
{
    pub fn new(sink: &'a mut S) -> Self {
        Self {
            head: ResponseHead::new(),
            sink: Some(BodySink::Plain(sink)),
            started: false,
            on_start: None,
            date_source: None,
        }
    }

    /// Registers the one-shot callback fired when the response starts.
    pub fn set_on_start(&mut self, callback: Box<dyn FnOnce() + Send + 'a>) {
        self.on_start = Some(callback);
    }

    /// Supplies the `Date` value to inject at start time when the handler
    /// set none. Evaluated after the start callback, so it can observe the
    /// latched response time; returning `None` leaves the head untouched.
    pub fn set_date_source(
        &mut self,
        source: Box<dyn FnOnce() -> Option<HeaderValue> + Send + 'a>,
    ) {
        self.date_source = Some(source);
    }

    /// Wraps the sink in a capture tee. Call before the handler runs.
    pub fn enable_capture(&mut self, max_bytes: u64) {
        if let Some(BodySink::Plain(sink)) = self.sink.take() {
            self.sink = Some(BodySink::Capture(CaptureStream::new(sink, max_bytes)));
        } else {
            unreachable!("capture enabled twice or sink missing");
        }
    }

    pub fn started(&self) -> bool {
        self.started
    }

    pub fn status(&self) -> StatusCode {
        self.head.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.head.headers
    }

    pub fn set_status(&mut self, status: StatusCode) -> Result<()> {
        if self.started {
            bail!("response already started, status is frozen");
        }
        self.head.status = status;
        Ok(())
    }

    pub fn headers_mut(&mut self) -> Result<&mut HeaderMap> {
        if self.started {
            bail!("response already started, headers are frozen");
        }
        Ok(&mut self.head.headers)
    }

    /// Writes body bytes, starting the response on the first call.
    pub async fn write_body(&mut self, data: &[u8]) -> Result<()> {
        self.ensure_started().await?;
        match self.sink.as_mut().expect("sink present") {
            BodySink::Plain(sink) => sink.write_all(data).await?,
            BodySink::Capture(capture) => capture.write_all(data).await?,
        }
        Ok(())
    }

    /// Starts the response if the handler never wrote a body byte, then
    /// flushes the sink.
    pub async fn finish(&mut self) -> Result<()> {
        self.ensure_started().await?;
        match self.sink.as_mut().expect("sink present") {
            BodySink::Plain(sink) => sink.flush().await?,
            BodySink::Capture(capture) => capture.flush().await?,
        }
        Ok(())
    }

    async fn ensure_started(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }
        self.started = true;
        if let Some(callback) = self.on_start.take() {
            callback();
        }
        if let Some(source) = self.date_source.take()
            && !self.head.headers.contains_key(http::header::DATE)
            && let Some(date) = source()
        {
            self.head.headers.insert(http::header::DATE, date);
        }

        let head = encode_head(&self.head);
        // Head bytes go straight to the wire; only body bytes are captured.
        match self.sink.as_mut().expect("sink present") {
            BodySink::Plain(sink) => sink.write_all(&head).await?,
            BodySink::Capture(capture) => capture.get_mut().write_all(&head).await?,
        }
        Ok(())
    }

    pub fn buffering_enabled(&self) -> bool {
        matches!(
            self.sink.as_ref(),
            Some(BodySink::Capture(capture)) if capture.buffering_enabled()
        )
    }

    pub fn captured_body(&self) -> bytes::Bytes {
        match self.sink.as_ref() {
            Some(BodySink::Capture(capture)) => capture.captured_body(),
            _ => bytes::Bytes::new(),
        }
    }

    pub fn disable_buffering(&mut self) {
        if let Some(BodySink::Capture(capture)) = self.sink.as_mut() {
            capture.disable_buffering();
        }
    }
}

fn encode_head(head: &ResponseHead) -> Vec<u8> {
    let reason = head.status.canonical_reason().unwrap_or("Unknown");
    let mut out = format!("HTTP/1.1 {} {}\r\n", head.status.as_u16(), reason).into_bytes();
    for (name, value) in &head.headers {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out
}
