//! The frame history ring buffer (C8).
//!
//! A delta frame only makes sense against the exact snapshot its sender built
//! it from, so both ends of a connection keep a bounded window of recent
//! frames keyed by frame index. This is the same "sequence buffer" shape
//! reliable UDP stacks use for ack bitfields, applied here to whole
//! snapshots instead of packet headers.

use ecs_core::prelude::Reflector;

use crate::delta::{decode_delta, DeltaError, DeltaFrame};
use crate::snapshot::Snapshot;
use crate::wire::{decode_frame, DecodedFrame};

pub const HISTORY_SIZE: usize = 64;

#[derive(Debug, Clone, Default)]
struct Slot {
    valid: bool,
    frame_index: u64,
    snapshot: Snapshot,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HistoryError {
    #[error("full frame {frame_index} is older than this history's retained window (latest {latest})")]
    TooOld { frame_index: u64, latest: u64 },
    #[error("delta frame referenced previous frame {prev_frame_index}, which is not present or was invalidated")]
    PreviousFrameInvalid { prev_frame_index: u64 },
    #[error(transparent)]
    Delta(#[from] DeltaError),
}

/// A bounded ring of the last [`HISTORY_SIZE`] snapshots, indexed by frame
/// index modulo the ring size.
pub struct FrameHistory {
    slots: Vec<Slot>,
    latest_frame_index: Option<u64>,
}

impl Default for FrameHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameHistory {
    pub fn new() -> Self {
        Self { slots: (0..HISTORY_SIZE).map(|_| Slot::default()).collect(), latest_frame_index: None }
    }

    fn slot_index(frame_index: u64) -> usize {
        (frame_index as usize) % HISTORY_SIZE
    }

    /// As the window advances past `frame_index`, any slot still holding a
    /// frame index older than the new window's floor is invalidated -- the
    /// ring has wrapped around it, and its storage will be overwritten by a
    /// frame index it no longer belongs to.
    fn advance_latest(&mut self, frame_index: u64) {
        let floor = frame_index.saturating_sub(HISTORY_SIZE as u64 - 1);
        for slot in self.slots.iter_mut() {
            if slot.valid && slot.frame_index < floor {
                slot.valid = false;
            }
        }
        self.latest_frame_index = Some(self.latest_frame_index.map_or(frame_index, |l| l.max(frame_index)));
    }

    /// Record a fully self-contained frame (no baseline required).
    pub fn receive_full(&mut self, frame_index: u64, snapshot: Snapshot) -> Result<(), HistoryError> {
        if let Some(latest) = self.latest_frame_index {
            if frame_index + (HISTORY_SIZE as u64 - 1) < latest {
                return Err(HistoryError::TooOld { frame_index, latest });
            }
        }
        self.advance_latest(frame_index);
        let idx = Self::slot_index(frame_index);
        self.slots[idx] = Slot { valid: true, frame_index, snapshot };
        Ok(())
    }

    /// Apply a delta frame against its declared baseline, rejecting it if
    /// that baseline is no longer held (either never received, or aged out
    /// of the window).
    pub fn receive_delta(
        &mut self,
        frame_index: u64,
        prev_frame_index: u64,
        delta: &DeltaFrame,
    ) -> Result<&Snapshot, HistoryError> {
        let prev_idx = Self::slot_index(prev_frame_index);
        let baseline = {
            let slot = &self.slots[prev_idx];
            if !slot.valid || slot.frame_index != prev_frame_index {
                return Err(HistoryError::PreviousFrameInvalid { prev_frame_index });
            }
            slot.snapshot.clone()
        };

        let rebuilt = decode_delta(&baseline, delta)?;
        self.advance_latest(frame_index);
        let idx = Self::slot_index(frame_index);
        self.slots[idx] = Slot { valid: true, frame_index, snapshot: rebuilt };
        Ok(&self.slots[idx].snapshot)
    }

    pub fn get(&self, frame_index: u64) -> Option<&Snapshot> {
        let slot = &self.slots[Self::slot_index(frame_index)];
        (slot.valid && slot.frame_index == frame_index).then_some(&slot.snapshot)
    }

    pub fn latest_frame_index(&self) -> Option<u64> {
        self.latest_frame_index
    }

    /// Decode a wire transmission and fold it into this history, returning
    /// the resulting snapshot only when the transmission turned out to carry
    /// the newest frame this history has ever seen.
    ///
    /// A transmission that fails to decode, or whose delta baseline is no
    /// longer retained, is logged and dropped rather than propagated as an
    /// error -- a dropped frame is recovered by the next full frame the
    /// sender transmits, not by the caller retrying this one.
    pub fn try_receive_frame_transmission(&mut self, bytes: &[u8], reflector: &Reflector) -> Option<&Snapshot> {
        let decoded = match decode_frame(bytes, reflector) {
            Ok(decoded) => decoded,
            Err(error) => {
                tracing::warn!(%error, "dropping an unparseable frame transmission");
                return None;
            }
        };

        let frame_index = match decoded {
            DecodedFrame::Full { frame_index, snapshot } => {
                if let Err(error) = self.receive_full(frame_index, snapshot) {
                    tracing::warn!(%error, frame_index, "dropping a full frame transmission");
                    return None;
                }
                frame_index
            }
            DecodedFrame::Delta { frame_index, prev_frame_index, delta } => {
                if let Err(error) = self.receive_delta(frame_index, prev_frame_index, &delta) {
                    tracing::warn!(%error, frame_index, prev_frame_index, "dropping a delta frame transmission");
                    return None;
                }
                frame_index
            }
        };

        if self.latest_frame_index() == Some(frame_index) {
            self.get(frame_index)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::encode_delta;

    fn snapshot_with(byte: u8) -> Snapshot {
        Snapshot { bytes: vec![byte; 10], component_views: Default::default(), entity_views: vec![(0, 10)] }
    }

    #[test]
    fn full_then_delta_roundtrips() {
        let mut history = FrameHistory::new();
        let a = snapshot_with(1);
        let b = snapshot_with(2);
        history.receive_full(0, a.clone()).unwrap();
        let delta = encode_delta(&a, &b).unwrap();
        let rebuilt = history.receive_delta(1, 0, &delta).unwrap();
        assert_eq!(rebuilt.bytes, b.bytes);
    }

    #[test]
    fn delta_against_missing_baseline_is_rejected() {
        let mut history = FrameHistory::new();
        let delta = DeltaFrame::default();
        let err = history.receive_delta(5, 3, &delta);
        assert_eq!(err, Err(HistoryError::PreviousFrameInvalid { prev_frame_index: 3 }));
    }

    #[test]
    fn a_baseline_outside_the_window_is_invalidated_and_then_rejected() {
        let mut history = FrameHistory::new();
        history.receive_full(0, snapshot_with(1)).unwrap();
        // Advance far enough that frame 0's slot is reused and its old
        // content no longer matches frame 0.
        history.receive_full(HISTORY_SIZE as u64 * 2, snapshot_with(9)).unwrap();
        let delta = DeltaFrame::default();
        let err = history.receive_delta(HISTORY_SIZE as u64 * 2 + 1, 0, &delta);
        assert_eq!(err, Err(HistoryError::PreviousFrameInvalid { prev_frame_index: 0 }));
    }

    #[test]
    fn stale_full_frame_is_rejected() {
        let mut history = FrameHistory::new();
        history.receive_full(1000, snapshot_with(1)).unwrap();
        let err = history.receive_full(0, snapshot_with(2));
        assert_eq!(err, Err(HistoryError::TooOld { frame_index: 0, latest: 1000 }));
    }

    #[test]
    fn try_receive_frame_transmission_returns_the_snapshot_for_the_newest_frame() {
        use crate::wire::encode_full_frame;
        use ecs_core::prelude::Reflector;

        let reflector = Reflector::new();
        let snapshot = snapshot_with(3);
        let wire = encode_full_frame(0, &snapshot, &reflector);

        let mut history = FrameHistory::new();
        let received = history.try_receive_frame_transmission(&wire, &reflector).unwrap();
        assert_eq!(received.bytes, snapshot.bytes);
    }

    #[test]
    fn try_receive_frame_transmission_returns_none_for_an_out_of_order_frame() {
        use crate::wire::encode_full_frame;
        use ecs_core::prelude::Reflector;

        let reflector = Reflector::new();
        let mut history = FrameHistory::new();
        history.receive_full(5, snapshot_with(1)).unwrap();

        let stale_wire = encode_full_frame(2, &snapshot_with(2), &reflector);
        assert!(history.try_receive_frame_transmission(&stale_wire, &reflector).is_none());
    }

    #[test]
    fn try_receive_frame_transmission_returns_none_for_unparseable_bytes() {
        use ecs_core::prelude::Reflector;

        let reflector = Reflector::new();
        let mut history = FrameHistory::new();
        assert!(history.try_receive_frame_transmission(&[0xff; 4], &reflector).is_none());
    }
}
