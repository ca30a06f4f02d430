use crate::types::FrameBuffer;

/// Capacity-1 frame queue with overwrite-on-full semantics.
///
/// Enqueueing while occupied releases the previous frame before the new one
/// is stored, so a slow consumer only ever sees the newest capture.
#[derive(Debug, Default)]
pub struct LatestFrameSlot {
    slot: Option<FrameBuffer>,
    evicted: u64,
}

impl LatestFrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `frame`, returning the timestamp of the frame it evicted.
    pub fn enqueue(&mut self, frame: FrameBuffer) -> Option<f64> {
        let stale = self.slot.replace(frame)?;
        let timestamp = stale.timestamp_ms();
        log::trace!("evicting stale frame captured at {timestamp:.1}ms");
        stale.release();
        self.evicted += 1;
        Some(timestamp)
    }

    pub fn dequeue_latest(&mut self) -> Option<FrameBuffer> {
        self.slot.take()
    }

    /// Releases the queued frame, if any. Returns how many were released.
    pub fn drain(&mut self) -> usize {
        match self.slot.take() {
            Some(frame) => {
                frame.release();
                1
            }
            None => 0,
        }
    }

    pub fn len(&self) -> usize {
        usize::from(self.slot.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.slot.is_none()
    }

    pub fn peek_timestamp(&self) -> Option<f64> {
        self.slot.as_ref().map(FrameBuffer::timestamp_ms)
    }

    /// Total frames evicted by a newer enqueue over the slot's lifetime.
    pub fn evicted_count(&self) -> u64 {
        self.evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{CountingImage, Counter};

    fn frame(ts: f64, closes: &Counter) -> FrameBuffer {
        FrameBuffer::new(CountingImage::with_counter(1, 1, closes), ts, [])
    }

    #[test]
    fn holds_only_the_newest_of_many_enqueues() {
        for n in 1..=6 {
            let counters: Vec<Counter> = (0..n).map(|_| Counter::default()).collect();
            let mut slot = LatestFrameSlot::new();
            for (i, closes) in counters.iter().enumerate() {
                slot.enqueue(frame(i as f64, closes));
                assert_eq!(slot.len(), 1);
            }

            assert_eq!(slot.peek_timestamp(), Some((n - 1) as f64));
            assert_eq!(slot.evicted_count(), (n - 1) as u64);
            for closes in &counters[..n - 1] {
                assert_eq!(closes.get(), 1);
            }
            assert_eq!(counters[n - 1].get(), 0);

            let latest = slot.dequeue_latest().unwrap();
            assert_eq!(latest.timestamp_ms(), (n - 1) as f64);
            assert!(slot.is_empty());
            drop(latest);
            assert_eq!(counters[n - 1].get(), 1);
        }
    }

    #[test]
    fn enqueue_reports_the_evicted_timestamp() {
        let closes = Counter::default();
        let mut slot = LatestFrameSlot::new();
        assert_eq!(slot.enqueue(frame(10.0, &closes)), None);
        assert_eq!(slot.enqueue(frame(20.0, &closes)), Some(10.0));
        assert_eq!(closes.get(), 1);
    }

    #[test]
    fn dequeue_on_empty_slot_signals_empty() {
        let mut slot = LatestFrameSlot::new();
        assert!(slot.dequeue_latest().is_none());
        assert_eq!(slot.drain(), 0);
    }

    #[test]
    fn drain_releases_the_occupant() {
        let closes = Counter::default();
        let mut slot = LatestFrameSlot::new();
        slot.enqueue(frame(1.0, &closes));
        assert_eq!(slot.drain(), 1);
        assert_eq!(closes.get(), 1);
        assert!(slot.is_empty());
    }

    #[test]
    fn dropping_the_slot_releases_the_occupant() {
        let closes = Counter::default();
        {
            let mut slot = LatestFrameSlot::new();
            slot.enqueue(frame(1.0, &closes));
        }
        assert_eq!(closes.get(), 1);
    }
}
