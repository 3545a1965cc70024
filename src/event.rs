//! Device event handle
//!
//! `DeviceEvent`s are movable, not copyable, wrappers around raw device
//! events. The raw event is constructed lazily on first record and is tied
//! to the device of the recording stream from then on.

use std::sync::Arc;

use crate::device::{
    DeviceGuard, DeviceIndex, DeviceResult, DeviceStream, EventStatus, RawDevice, RawEventHandle,
};

/// Completion fence over one raw device event.
pub struct DeviceEvent {
    device: Arc<dyn RawDevice>,
    device_index: Option<DeviceIndex>,
    stream_id: Option<usize>,
    raw: Option<RawEventHandle>,
}

impl DeviceEvent {
    /// An empty event; the raw handle is acquired on first [`record`].
    ///
    /// [`record`]: DeviceEvent::record
    pub fn new(device: Arc<dyn RawDevice>) -> Self {
        DeviceEvent {
            device,
            device_index: None,
            stream_id: None,
            raw: None,
        }
    }

    /// Whether the raw event has been created yet
    pub fn is_created(&self) -> bool {
        self.raw.is_some()
    }

    /// Device the event is bound to, once recorded
    pub fn device_index(&self) -> Option<DeviceIndex> {
        self.device_index
    }

    /// Id of the last stream this event was recorded on
    pub fn stream_id(&self) -> Option<usize> {
        self.stream_id
    }

    /// Record the event on `stream`, creating the raw event on the stream's
    /// device if this is the first record.
    ///
    /// # Panics
    ///
    /// If the event was previously bound to a different device than the
    /// recording stream's. That is a caller bug, not a runtime condition.
    pub fn record(&mut self, stream: &DeviceStream) -> DeviceResult<()> {
        if self.raw.is_none() {
            self.device_index = Some(stream.device_index());
            let _guard = DeviceGuard::new(self.device.as_ref(), stream.device_index());
            self.raw = Some(self.device.create_event()?);
        }
        assert_eq!(
            self.device_index,
            Some(stream.device_index()),
            "event bound to device {:?} cannot record on stream of device {}",
            self.device_index,
            stream.device_index(),
        );
        let raw = self.raw.expect("raw event created above");
        let _guard = DeviceGuard::new(self.device.as_ref(), stream.device_index());
        self.device.record_event(raw, stream.raw())?;
        self.stream_id = Some(stream.id());
        Ok(())
    }

    /// Record on the calling thread's current stream
    pub fn record_current(&mut self) -> DeviceResult<()> {
        let index = self.device.current_device()?;
        let stream = self.device.current_stream(index);
        self.record(&stream)
    }

    /// Record only if this event has never been recorded
    pub fn record_once(&mut self, stream: &DeviceStream) -> DeviceResult<()> {
        if self.stream_id.is_none() {
            self.record(stream)?;
        }
        Ok(())
    }

    /// True when the event has completed, or was never recorded.
    ///
    /// Driver errors while polling are reported as not-ready so drain loops
    /// keep the entry queued instead of releasing memory early.
    pub fn query(&self) -> bool {
        let (raw, index) = match (self.raw, self.device_index) {
            (Some(raw), Some(index)) => (raw, index),
            _ => return true,
        };
        let _guard = DeviceGuard::new(self.device.as_ref(), index);
        match self.device.event_status(raw) {
            Ok(EventStatus::Ready) => true,
            Ok(EventStatus::NotReady) => false,
            Err(e) => {
                tracing::warn!("DeviceEvent: status query failed: {}", e);
                false
            }
        }
    }

    /// Make `stream` wait for this event without blocking the host
    pub fn wait(&self, stream: &DeviceStream) -> DeviceResult<()> {
        if let Some(raw) = self.raw {
            let _guard = DeviceGuard::new(self.device.as_ref(), stream.device_index());
            self.device.stream_wait_event(stream.raw(), raw)?;
        }
        Ok(())
    }

    /// Block the calling thread until the event completes
    pub fn synchronize(&self) -> DeviceResult<()> {
        if let Some(raw) = self.raw {
            self.device.wait_event(raw)?;
        }
        Ok(())
    }

    /// Milliseconds between this event and `other`.
    ///
    /// # Panics
    ///
    /// If either event has not been recorded.
    pub fn elapsed_time(&self, other: &DeviceEvent) -> DeviceResult<f32> {
        assert!(
            self.is_created() && other.is_created(),
            "both events must be recorded before calculating elapsed time"
        );
        self.device.event_elapsed_time(
            self.raw.expect("checked above"),
            other.raw.expect("checked above"),
        )
    }
}

impl Drop for DeviceEvent {
    fn drop(&mut self) {
        if let (Some(raw), Some(index)) = (self.raw.take(), self.device_index) {
            let _guard = DeviceGuard::new(self.device.as_ref(), index);
            if let Err(e) = self.device.destroy_event(raw) {
                tracing::warn!("DeviceEvent: destroy failed: {}", e);
            }
        }
    }
}

impl std::fmt::Debug for DeviceEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceEvent")
            .field("device_index", &self.device_index)
            .field("stream_id", &self.stream_id)
            .field("created", &self.is_created())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MockDevice;

    #[test]
    fn test_unrecorded_event_is_ready() {
        let dev = Arc::new(MockDevice::new());
        let event = DeviceEvent::new(dev);
        assert!(!event.is_created());
        assert!(event.query());
    }

    #[test]
    fn test_record_binds_device_and_stream() {
        let dev = Arc::new(MockDevice::new());
        let stream = dev.current_stream(0);
        let mut event = DeviceEvent::new(dev);
        event.record(&stream).unwrap();
        assert!(event.is_created());
        assert_eq!(event.device_index(), Some(0));
        assert_eq!(event.stream_id(), Some(0));
    }

    #[test]
    fn test_held_event_not_ready_until_released() {
        let dev = Arc::new(MockDevice::new());
        dev.hold_events();
        let stream = dev.current_stream(0);
        let mut event = DeviceEvent::new(dev.clone());
        event.record(&stream).unwrap();
        assert!(!event.query());
        dev.release_events();
        assert!(event.query());
        event.synchronize().unwrap();
    }

    #[test]
    fn test_record_once_records_a_single_time() {
        let dev = Arc::new(MockDevice::new());
        let stream = dev.current_stream(0);
        let mut event = DeviceEvent::new(dev.clone());
        event.record_once(&stream).unwrap();
        let first = event.stream_id();
        event.record_once(&stream).unwrap();
        assert_eq!(event.stream_id(), first);
    }

    #[test]
    #[should_panic(expected = "cannot record on stream")]
    fn test_cross_device_record_panics() {
        let dev = Arc::new(MockDevice::new());
        let mut event = DeviceEvent::new(dev.clone());
        event.record(&dev.current_stream(0)).unwrap();
        let other = DeviceStream::new(0, 1, 0);
        let _ = event.record(&other);
    }

    #[test]
    #[should_panic(expected = "must be recorded")]
    fn test_elapsed_time_requires_recorded_events() {
        let dev = Arc::new(MockDevice::new());
        let a = DeviceEvent::new(dev.clone());
        let b = DeviceEvent::new(dev);
        let _ = a.elapsed_time(&b);
    }
}
