use tokio::sync::broadcast;
use ulid::Ulid;

const CHANNEL_CAPACITY: usize = 1024;

/// What caused a recompute trigger. Carried for logging and metrics labels;
/// the actuator reacts identically to all of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerCause {
    Uplink,
    ReservationCreated,
    ReservationCancelled,
    OverrideSet,
    OverrideCleared,
    OverrideExpired,
    ReservationBoundary,
    SpaceChanged,
}

impl TriggerCause {
    pub fn label(&self) -> &'static str {
        match self {
            TriggerCause::Uplink => "uplink",
            TriggerCause::ReservationCreated => "reservation_created",
            TriggerCause::ReservationCancelled => "reservation_cancelled",
            TriggerCause::OverrideSet => "override_set",
            TriggerCause::OverrideCleared => "override_cleared",
            TriggerCause::OverrideExpired => "override_expired",
            TriggerCause::ReservationBoundary => "reservation_boundary",
            TriggerCause::SpaceChanged => "space_changed",
        }
    }
}

/// A request to recompute one space's display command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trigger {
    pub tenant: String,
    pub space: Ulid,
    pub cause: TriggerCause,
}

/// Broadcast hub carrying recompute triggers from ledger mutations to the
/// actuator. One stream for all spaces — the single consumer wants all of
/// them, and producers never block.
pub struct TriggerHub {
    sender: broadcast::Sender<Trigger>,
}

impl Default for TriggerHub {
    fn default() -> Self {
        Self::new()
    }
}

impl TriggerHub {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Trigger> {
        self.sender.subscribe()
    }

    /// Publish a trigger. No-op if nobody is listening.
    pub fn send(&self, trigger: Trigger) {
        let _ = self.sender.send(trigger);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = TriggerHub::new();
        let mut rx = hub.subscribe();

        let trigger = Trigger {
            tenant: "city-north".into(),
            space: Ulid::new(),
            cause: TriggerCause::Uplink,
        };
        hub.send(trigger.clone());

        let received = rx.recv().await.unwrap();
        assert_eq!(received, trigger);
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = TriggerHub::new();
        // No subscriber — should not panic
        hub.send(Trigger {
            tenant: "t".into(),
            space: Ulid::new(),
            cause: TriggerCause::SpaceChanged,
        });
    }

    #[tokio::test]
    async fn all_subscribers_see_all_triggers() {
        let hub = TriggerHub::new();
        let mut rx1 = hub.subscribe();
        let mut rx2 = hub.subscribe();

        let trigger = Trigger {
            tenant: "t".into(),
            space: Ulid::new(),
            cause: TriggerCause::ReservationCreated,
        };
        hub.send(trigger.clone());

        assert_eq!(rx1.recv().await.unwrap(), trigger);
        assert_eq!(rx2.recv().await.unwrap(), trigger);
    }
}
