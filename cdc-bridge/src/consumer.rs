//! A module representing the logic behind handing over change events.
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use crate::cdc_types::ChangeEvent;

/// Trait used to represent the callback a connector pushes its change events into.
/// Events must be consumed in the order the connector emits them.
///
/// An error returned from [`consume_cdc`](Consumer::consume_cdc) tells the
/// connector to stop its run loop and return that error.
#[async_trait]
pub trait Consumer: Send {
    async fn consume_cdc(&mut self, event: ChangeEvent) -> anyhow::Result<()>;
}

/// Returned to a connector when the queue it delivers into no longer accepts events,
/// because the engine is stopping or the reader went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("event queue closed")]
pub struct QueueClosed;

/// Consumer feeding the bounded queue between a connector and a reader.
///
/// A full queue blocks the connector instead of dropping events.
/// A stop request releases a blocked connector with [`QueueClosed`].
pub(crate) struct QueueConsumer {
    sender: mpsc::Sender<ChangeEvent>,
    stop: watch::Receiver<bool>,
}

impl QueueConsumer {
    pub(crate) fn new(sender: mpsc::Sender<ChangeEvent>, stop: watch::Receiver<bool>) -> Self {
        QueueConsumer { sender, stop }
    }
}

#[async_trait]
impl Consumer for QueueConsumer {
    async fn consume_cdc(&mut self, event: ChangeEvent) -> anyhow::Result<()> {
        if *self.stop.borrow() {
            return Err(QueueClosed.into());
        }

        tokio::select! {
            sent = self.sender.send(event) => sent.map_err(|_| anyhow::Error::from(QueueClosed)),
            _ = raised(&mut self.stop) => Err(anyhow::Error::from(QueueClosed)),
        }
    }
}

/// Resolves once the flag behind `signal` turns `true`, or its sender is gone.
pub(crate) async fn raised(signal: &mut watch::Receiver<bool>) {
    let _ = signal.wait_for(|raised| *raised).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdc_types::{RowImage, SourceMetadata, SourceOffset, SourcePartition};
    use std::time::Duration;

    fn event(seq: u64) -> ChangeEvent {
        ChangeEvent::insert(
            SourcePartition::new("p"),
            SourceOffset::new().with("seq", seq),
            SourceMetadata::default(),
            RowImage::new().with("id", seq),
        )
    }

    #[tokio::test]
    async fn full_queue_blocks_until_drained() {
        let (sender, mut receiver) = mpsc::channel(1);
        let (_stop_sender, stop) = watch::channel(false);
        let mut consumer = QueueConsumer::new(sender, stop);

        consumer.consume_cdc(event(1)).await.unwrap();
        let blocked =
            tokio::time::timeout(Duration::from_millis(50), consumer.consume_cdc(event(2))).await;
        assert!(blocked.is_err(), "second event must wait for free capacity");

        let producer = tokio::spawn(async move {
            consumer.consume_cdc(event(2)).await.unwrap();
        });
        assert_eq!(
            receiver.recv().await.unwrap().offset().get_u64("seq"),
            Some(1)
        );
        producer.await.unwrap();
        assert_eq!(
            receiver.recv().await.unwrap().offset().get_u64("seq"),
            Some(2)
        );
    }

    #[tokio::test]
    async fn stop_releases_blocked_producer() {
        let (sender, _receiver) = mpsc::channel(1);
        let (stop_sender, stop) = watch::channel(false);
        let mut consumer = QueueConsumer::new(sender, stop);

        consumer.consume_cdc(event(1)).await.unwrap();
        let producer = tokio::spawn(async move { consumer.consume_cdc(event(2)).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        stop_sender.send_replace(true);

        let err = producer.await.unwrap().unwrap_err();
        assert!(err.downcast_ref::<QueueClosed>().is_some());
    }

    #[tokio::test]
    async fn dropped_receiver_closes_queue() {
        let (sender, receiver) = mpsc::channel(1);
        let (_stop_sender, stop) = watch::channel(false);
        let mut consumer = QueueConsumer::new(sender, stop);
        drop(receiver);

        let err = consumer.consume_cdc(event(1)).await.unwrap_err();
        assert!(err.is::<QueueClosed>());
    }
}
