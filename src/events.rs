//! Core event channel
//!
//! One typed channel for everything the eventing consumer (logging/evidence
//! subsystem) subscribes to. Consumers take a subscription handle via
//! [`EventBus::subscribe`]; a small ring buffer keeps recent events queryable
//! for late joiners.

use crate::device::{Device, DeviceStatus};
use crate::recording::RecordingStats;
use serde::Serialize;
use std::collections::VecDeque;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

/// Events emitted by the camera core
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum CoreEvent {
    CameraAdded { device: Device },
    CameraRemoved { device_id: String },
    CameraStatusChanged { device_id: String, status: DeviceStatus },
    StreamStarted { device_id: String },
    StreamStopped { device_id: String },
    StreamError { device_id: String, message: String },
    RecordingStarted { device_id: String, session_id: Uuid },
    RecordingStopped { device_id: String, session_id: Uuid },
    RecordingError { device_id: String, message: String },
    RecordingStats { device_id: String, stats: RecordingStats },
}

/// Broadcast channel plus a bounded history ring
pub struct EventBus {
    tx: broadcast::Sender<CoreEvent>,
    history: RwLock<VecDeque<CoreEvent>>,
    capacity: usize,
}

impl EventBus {
    /// Create a bus retaining `capacity` recent events
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(256);
        Self {
            tx,
            history: RwLock::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Publish an event to all subscribers and record it in the ring
    pub async fn publish(&self, event: CoreEvent) {
        {
            let mut history = self.history.write().await;
            if history.len() >= self.capacity {
                history.pop_front();
            }
            history.push_back(event.clone());
        }
        // No subscribers is not an error
        let _ = self.tx.send(event);
    }

    /// Take a subscription handle
    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.tx.subscribe()
    }

    /// Most recent events, newest first
    pub async fn recent(&self, count: usize) -> Vec<CoreEvent> {
        let history = self.history.read().await;
        history.iter().rev().take(count).cloned().collect()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(512)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_and_subscribe() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        bus.publish(CoreEvent::CameraRemoved {
            device_id: "rtsp:10.0.0.5:554".to_string(),
        })
        .await;

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, CoreEvent::CameraRemoved { .. }));
    }

    #[tokio::test]
    async fn test_history_ring_evicts_oldest() {
        let bus = EventBus::new(2);
        for i in 0..3 {
            bus.publish(CoreEvent::CameraRemoved {
                device_id: format!("local:video{}", i),
            })
            .await;
        }

        let recent = bus.recent(10).await;
        assert_eq!(recent.len(), 2);
        // Newest first
        match &recent[0] {
            CoreEvent::CameraRemoved { device_id } => assert_eq!(device_id, "local:video2"),
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
