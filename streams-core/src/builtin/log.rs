use async_trait::async_trait;

use super::wired;
use crate::envelope::Envelope;
use crate::error::Result;
use crate::position::{Origin, Position};
use crate::router::Router;
use crate::stage::Sink;

/// Logs every envelope and marks its position as processed.
pub struct LogSink<P: Position> {
    router: Option<Router<P>>,
}

impl<P: Position> Default for LogSink<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Position> LogSink<P> {
    pub fn new() -> Self {
        Self { router: None }
    }
}

#[async_trait]
impl<P: Position> Sink<P> for LogSink<P> {
    fn with_router(&mut self, router: Router<P>) -> Result<()> {
        self.router = Some(router);
        Ok(())
    }

    async fn process(&mut self, mut envelope: Envelope<P>) -> Result<()> {
        let router = wired(&self.router)?;

        let mut headers = String::new();
        envelope.headers.iter().for_each(|(k, v)| {
            headers.push_str(&format!("{k}: {v}, "));
        });
        let log_line = format!(
            "Payload - {} Key - {} Headers - {}",
            envelope
                .value
                .as_deref()
                .map(String::from_utf8_lossy)
                .unwrap_or_default(),
            envelope
                .key
                .as_deref()
                .map(String::from_utf8_lossy)
                .unwrap_or_default(),
            headers,
        );
        tracing::info!(stage = router.stage(), "{}", log_line);

        if let Some(position) = envelope.take_position() {
            router.mark(position.with_origin(Origin::Processing));
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
