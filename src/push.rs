//! Out-of-band push channel.
//!
//! Tools broadcast [`PushEvent`]s (camera feeds, images, "running query"
//! notices) to every connected console, independently of the chat
//! response stream. Delivery is best-effort: no replay for late
//! subscribers, and a subscriber that falls more than `capacity` events
//! behind skips the ones it missed.

use iiot_assistant_core::models::PushEvent;
use tokio::sync::broadcast;

pub const DEFAULT_PUSH_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct PushChannel {
    tx: broadcast::Sender<PushEvent>,
}

impl PushChannel {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_PUSH_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Fire-and-forget. Returns the number of subscribers the event was
    /// queued for; zero means it was discarded.
    pub fn broadcast(&self, event: PushEvent) -> usize {
        let media_type = event.media_type;
        match self.tx.send(event) {
            Ok(n) => {
                tracing::debug!(?media_type, subscribers = n, "push event broadcast");
                n
            }
            Err(_) => {
                tracing::debug!(?media_type, "push event dropped, no subscribers");
                0
            }
        }
    }

    pub fn subscribe(&self) -> PushReceiver {
        PushReceiver {
            rx: self.tx.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for PushChannel {
    fn default() -> Self {
        Self::new()
    }
}

pub struct PushReceiver {
    rx: broadcast::Receiver<PushEvent>,
}

impl PushReceiver {
    /// Next event, or `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<PushEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "push subscriber lagged, events skipped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iiot_assistant_core::models::MediaType;

    #[tokio::test]
    async fn delivered_to_every_subscriber_in_order() {
        let channel = PushChannel::new();
        let mut a = channel.subscribe();
        let mut b = channel.subscribe();
        assert_eq!(channel.subscriber_count(), 2);

        assert_eq!(channel.broadcast(PushEvent::text("one")), 2);
        channel.broadcast(PushEvent::media(MediaType::Image, "two", "/files/a.png"));

        for rx in [&mut a, &mut b] {
            assert_eq!(rx.recv().await.unwrap().content, "one");
            assert_eq!(rx.recv().await.unwrap().content, "two");
        }
    }

    #[tokio::test]
    async fn no_replay_for_late_subscribers() {
        let channel = PushChannel::new();
        assert_eq!(channel.broadcast(PushEvent::text("early")), 0);
        let mut late = channel.subscribe();
        channel.broadcast(PushEvent::text("late"));
        assert_eq!(late.recv().await.unwrap().content, "late");
    }

    #[tokio::test]
    async fn lagging_subscriber_skips_and_continues() {
        let channel = PushChannel::with_capacity(2);
        let mut rx = channel.subscribe();
        for i in 0..5 {
            channel.broadcast(PushEvent::text(format!("e{i}")));
        }
        assert_eq!(rx.recv().await.unwrap().content, "e3");
        assert_eq!(rx.recv().await.unwrap().content, "e4");
    }

    #[tokio::test]
    async fn dropped_subscriber_does_not_affect_others() {
        let channel = PushChannel::new();
        let dropped = channel.subscribe();
        let mut kept = channel.subscribe();
        drop(dropped);
        channel.broadcast(PushEvent::text("still here"));
        assert_eq!(kept.recv().await.unwrap().content, "still here");
        assert_eq!(channel.subscriber_count(), 1);
    }
}
