use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::envelope::Envelope;
use crate::error::Result;
use crate::position::Position;
use crate::stage::Source;

/// Source reading envelopes sent on a tokio channel. Nothing is acknowledged upstream, commits are
/// only logged.
pub struct ChannelSource<P> {
    rx: mpsc::Receiver<Envelope<P>>,
    read_timeout: Duration,
}

impl<P: Position> ChannelSource<P> {
    pub fn new(rx: mpsc::Receiver<Envelope<P>>, read_timeout: Duration) -> Self {
        Self { rx, read_timeout }
    }

    /// Creates the source along with the sender feeding it.
    pub fn channel(capacity: usize, read_timeout: Duration) -> (mpsc::Sender<Envelope<P>>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self::new(rx, read_timeout))
    }
}

#[async_trait]
impl<P: Position> Source<P> for ChannelSource<P> {
    async fn consume(&mut self) -> Result<Envelope<P>> {
        match tokio::time::timeout(self.read_timeout, self.rx.recv()).await {
            Ok(Some(envelope)) => Ok(envelope),
            Ok(None) => {
                // every sender is gone, wait out the timeout instead of spinning.
                tokio::time::sleep(self.read_timeout).await;
                Ok(Envelope::empty())
            }
            Err(_) => Ok(Envelope::empty()),
        }
    }

    async fn commit(&mut self, position: Option<P>) -> Result<()> {
        debug!(?position, "Channel source commit");
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.rx.close();
        let mut dropped = 0;
        while self.rx.try_recv().is_ok() {
            dropped += 1;
        }
        info!(dropped, "Channel source closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::LogPosition;

    #[tokio::test]
    async fn test_consume_returns_sent_then_empty() {
        let (tx, mut source) =
            ChannelSource::<LogPosition>::channel(2, Duration::from_millis(1));
        tx.send(Envelope::new("k", "v")).await.unwrap();

        let envelope = source.consume().await.unwrap();
        assert_eq!(envelope.value.as_deref(), Some(&b"v"[..]));

        assert!(source.consume().await.unwrap().is_empty());

        drop(tx);
        assert!(source.consume().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_close_rejects_senders() {
        let (tx, mut source) =
            ChannelSource::<LogPosition>::channel(2, Duration::from_millis(1));
        tx.send(Envelope::new("k", "v")).await.unwrap();

        source.commit(None).await.unwrap();
        source.close().await.unwrap();

        assert!(tx.send(Envelope::new("k", "v")).await.is_err());
    }
}
