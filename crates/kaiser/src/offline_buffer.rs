//! Bounded ring of unsent MQTT publishes, replayed in order on reconnect.
//! Generalizes the teacher's `state.rs` event ring buffer (`VecDeque` capped
//! at `MAX_EVENTS`, oldest-drop on overflow) to hold outbound publishes
//! instead of UI events.

use std::collections::VecDeque;
use std::sync::Mutex;

use rumqttc::QoS;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferedPublish {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QosKind,
    pub retain: bool,
}

/// `rumqttc::QoS` doesn't implement `PartialEq`/`Eq`/`Clone` the way we need
/// for buffer assertions in tests, so we mirror it with our own enum and
/// convert at the publish boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QosKind {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl From<QosKind> for QoS {
    fn from(k: QosKind) -> Self {
        match k {
            QosKind::AtMostOnce => QoS::AtMostOnce,
            QosKind::AtLeastOnce => QoS::AtLeastOnce,
            QosKind::ExactlyOnce => QoS::ExactlyOnce,
        }
    }
}

pub struct OfflineBuffer {
    capacity: usize,
    items: Mutex<VecDeque<BufferedPublish>>,
}

impl OfflineBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            items: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
        }
    }

    /// Enqueue a publish, dropping the oldest entry if at capacity.
    pub fn push(&self, item: BufferedPublish) {
        let mut items = self.items.lock().unwrap();
        if items.len() >= self.capacity {
            items.pop_front();
        }
        items.push_back(item);
    }

    /// Drain the whole buffer in insertion (FIFO) order for replay.
    pub fn drain(&self) -> Vec<BufferedPublish> {
        let mut items = self.items.lock().unwrap();
        items.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    /// Read-only copy of the current contents, oldest first, without
    /// draining — used by status/introspection callers and tests that need
    /// to assert ordering before a replay consumes the queue.
    pub fn snapshot(&self) -> Vec<BufferedPublish> {
        self.items.lock().unwrap().iter().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
