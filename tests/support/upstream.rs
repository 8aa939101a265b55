use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use http::{Request, StatusCode};
use outcache::middleware::Handler;
use outcache::response::ResponseWriter;
use tokio::io::AsyncWrite;

/// Downstream handler standing in for the application: programmable
/// response, counted invocations, optional delay to hold a coalescing
/// window open.
pub struct MockUpstream {
    status: StatusCode,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    delay: Option<Duration>,
    hits: Arc<AtomicUsize>,
}

impl MockUpstream {
    pub fn new(body: &str) -> Self {
        Self {
            status: StatusCode::OK,
            headers: Vec::new(),
            body: body.as_bytes().to_vec(),
            delay: None,
            hits: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_body_bytes(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<S> Handler<S> for MockUpstream
where
    S: AsyncWrite + Send + Unpin,
{
    async fn handle(
        &self,
        _request: &Request<()>,
        response: &mut ResponseWriter<'_, S>,
    ) -> Result<()> {
        self.hits.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        response.set_status(self.status)?;
        for (name, value) in &self.headers {
            response.headers_mut()?.append(
                http::HeaderName::try_from(name.as_str())?,
                http::HeaderValue::from_str(value)?,
            );
        }
        if !self.body.is_empty() {
            response.write_body(&self.body).await?;
        }
        Ok(())
    }
}
