// SPDX-License-Identifier: PolyForm-Shield-1.0

use protocol::LifecycleEvent;
use tokio::sync::broadcast;
use tracing::trace;

/// Fan-out of lifecycle events to observers.
///
/// Publishing never blocks and never fails; with no subscribers the event is
/// simply dropped.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<LifecycleEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: LifecycleEvent) {
        if self.tx.send(event).is_err() {
            trace!("studio::events: no subscribers; event dropped");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::ModelName;

    #[test]
    fn publish_without_subscribers_is_silent() {
        let bus = EventBus::new(4);
        bus.publish(LifecycleEvent::Busy {
            model: ModelName::FluxDev,
        });
    }

    #[tokio::test]
    async fn subscribers_see_events_in_order() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        bus.publish(LifecycleEvent::LoadStarted {
            model: ModelName::FluxDev,
        });
        bus.publish(LifecycleEvent::Evicted {
            model: ModelName::FluxDev,
        });

        assert_eq!(
            rx.recv().await.unwrap(),
            LifecycleEvent::LoadStarted {
                model: ModelName::FluxDev
            }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            LifecycleEvent::Evicted {
                model: ModelName::FluxDev
            }
        );
    }
}
