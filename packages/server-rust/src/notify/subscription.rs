//! Listener handle returned by [`NotificationChannel::subscribe`](crate::traits::NotificationChannel::subscribe).

use std::fmt;

use kombo_core::NotificationEvent;
use tokio::sync::mpsc;
use tracing::warn;

/// A live subscription to one event on one topic.
///
/// Frames arrive as encoded `MsgPack` and are decoded on receipt; malformed
/// frames are logged and skipped. The subscription is released exactly once,
/// either by [`Subscription::unsubscribe`] or on drop, so every exit path of
/// the owning task (success, timeout, cancellation, error) cleans it up.
pub struct Subscription {
    topic: String,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Creates a subscription fed by `rx`; `release` runs when it is dropped.
    pub fn new(
        topic: String,
        rx: mpsc::UnboundedReceiver<Vec<u8>>,
        release: impl FnOnce() + Send + Sync + 'static,
    ) -> Self {
        Self {
            topic,
            rx,
            release: Some(Box::new(release)),
        }
    }

    /// Topic this subscription listens on.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Waits for the next well-formed event.
    ///
    /// Returns `None` once the channel side has closed the subscription.
    pub async fn recv(&mut self) -> Option<NotificationEvent> {
        loop {
            let frame = self.rx.recv().await?;
            match NotificationEvent::decode(&frame) {
                Ok(event) => return Some(event),
                Err(e) => {
                    warn!(topic = %self.topic, error = %e, "dropping malformed notification frame");
                }
            }
        }
    }

    /// Releases the subscription now.
    pub fn unsubscribe(mut self) {
        self.release_now();
    }

    fn release_now(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
        self.rx.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release_now();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("released", &self.release.is_none())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use kombo_core::AcceptPayload;

    use super::*;

    fn accept(provider_id: &str) -> Vec<u8> {
        NotificationEvent::Accept(AcceptPayload {
            provider_id: provider_id.to_string(),
        })
        .encode()
        .unwrap()
    }

    #[tokio::test]
    async fn skips_malformed_frames() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut sub = Subscription::new("job_1".to_string(), rx, || {});

        tx.send(vec![0xc1]).unwrap();
        tx.send(accept("p1")).unwrap();

        let event = sub.recv().await.unwrap();
        assert_eq!(
            event,
            NotificationEvent::Accept(AcceptPayload {
                provider_id: "p1".to_string()
            })
        );
    }

    #[tokio::test]
    async fn recv_returns_none_when_sender_gone() {
        let (tx, rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let mut sub = Subscription::new("job_1".to_string(), rx, || {});
        drop(tx);
        assert!(sub.recv().await.is_none());
    }

    #[test]
    fn release_runs_once() {
        let released = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&released);
        let (_tx, rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let sub = Subscription::new("job_1".to_string(), rx, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        sub.unsubscribe();
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drop_releases() {
        let released = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&released);
        let (_tx, rx) = mpsc::unbounded_channel::<Vec<u8>>();
        {
            let _sub = Subscription::new("job_1".to_string(), rx, move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }
}
