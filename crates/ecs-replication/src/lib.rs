//! Replication (C7/C8/C9): flattening live entity state into deterministic
//! snapshots, diffing snapshots against a bounded frame history, and
//! framing the result for the wire.

pub mod codec;
pub mod delta;
pub mod history;
pub mod receive;
pub mod snapshot;
pub mod wire;

pub mod prelude {
    pub use crate::codec::{self, CodecError};
    pub use crate::delta::{decode_delta, encode_delta, ComponentDeltaRecord, DeltaError, DeltaFrame, TypeDelta};
    pub use crate::history::{FrameHistory, HistoryError, HISTORY_SIZE};
    pub use crate::receive::{apply_snapshot_to_manager, ApplyError};
    pub use crate::snapshot::{build_snapshot, parse_entity_records, ByteView, EntityRecord, Snapshot, SnapshotError};
    pub use crate::wire::{
        decode_frame, encode_delta_frame, encode_full_frame, ClientChannels, ClientId, DecodedFrame, WireError,
        DELTA_MARKER, FULL_MARKER,
    };
}
