//! The wire frame envelope (C7/C8's external surface): `marker, frame_index,
//! body`, with a full-snapshot body and a delta body per the external
//! interface's frame grammar. Network-order (big-endian) scalars throughout,
//! distinct from the codec's internal little-endian length prefix, which is
//! purely an implementation detail of that one primitive.

use std::collections::{BTreeMap, HashMap};

use ecs_core::prelude::{ComponentType, Reflector};

use crate::delta::{encode_delta, ComponentDeltaRecord, DeltaError, DeltaFrame, TypeDelta};
use crate::history::{FrameHistory, HistoryError};
use crate::snapshot::{Snapshot, SnapshotError};

pub const FULL_MARKER: u32 = 0xF011_0FFF;
pub const DELTA_MARKER: u32 = 0xDE11_A000;

const RECORD_TAG_NEW: u8 = 0;
const RECORD_TAG_CHANGED: u8 = 1;
const RECORD_TAG_REMOVED: u8 = 2;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WireError {
    #[error("frame truncated")]
    Truncated,
    #[error("unknown frame marker 0x{0:08x}")]
    UnknownMarker(u32),
    #[error("unknown component delta record tag {0}")]
    UnknownRecordTag(u8),
    #[error("component type name was not valid UTF-8")]
    InvalidTypeName,
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error(transparent)]
    Delta(#[from] DeltaError),
    #[error(transparent)]
    History(#[from] HistoryError),
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_be_bytes());
}
fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_be_bytes());
}
fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    put_u32(out, bytes.len() as u32);
    out.extend_from_slice(bytes);
}
fn put_cstring(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(s.as_bytes());
    out.push(0);
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }
    fn u32(&mut self) -> Result<u32, WireError> {
        let slice = self.buf.get(self.pos..self.pos + 4).ok_or(WireError::Truncated)?;
        self.pos += 4;
        Ok(u32::from_be_bytes(slice.try_into().unwrap()))
    }
    fn u64(&mut self) -> Result<u64, WireError> {
        let slice = self.buf.get(self.pos..self.pos + 8).ok_or(WireError::Truncated)?;
        self.pos += 8;
        Ok(u64::from_be_bytes(slice.try_into().unwrap()))
    }
    fn u8(&mut self) -> Result<u8, WireError> {
        let b = *self.buf.get(self.pos).ok_or(WireError::Truncated)?;
        self.pos += 1;
        Ok(b)
    }
    fn bytes(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        let slice = self.buf.get(self.pos..self.pos + len).ok_or(WireError::Truncated)?;
        self.pos += len;
        Ok(slice)
    }
    fn length_prefixed(&mut self) -> Result<&'a [u8], WireError> {
        let len = self.u32()? as usize;
        self.bytes(len)
    }
    fn cstring(&mut self) -> Result<String, WireError> {
        let start = self.pos;
        let nul = self.buf[start..].iter().position(|&b| b == 0).ok_or(WireError::Truncated)?;
        let slice = &self.buf[start..start + nul];
        self.pos = start + nul + 1;
        String::from_utf8(slice.to_vec()).map_err(|_| WireError::InvalidTypeName)
    }
}

/// `ViewTables` per the external grammar: a view-table entry per component
/// type (looked up by name, since type hashes are not portable across
/// independently compiled binaries in the same way names are) plus the
/// entity view table, followed by the raw blob.
fn encode_full_body(out: &mut Vec<u8>, snapshot: &Snapshot, reflector: &Reflector) {
    put_u32(out, snapshot.component_views.len() as u32);
    for (ty, views) in &snapshot.component_views {
        let name = reflector.name_of(*ty).expect("networked component type must be registered");
        put_cstring(out, name);
        put_u32(out, views.len() as u32);
        for &(b, e) in views {
            put_u32(out, b);
            put_u32(out, e);
        }
    }
    put_u32(out, snapshot.entity_views.len() as u32);
    for &(b, e) in &snapshot.entity_views {
        put_u32(out, b);
        put_u32(out, e);
    }
    put_bytes(out, &snapshot.bytes);
}

fn decode_full_body(reader: &mut Reader, reflector: &Reflector) -> Result<Snapshot, WireError> {
    let n_types = reader.u32()?;
    let mut component_views = BTreeMap::new();
    for _ in 0..n_types {
        let name = reader.cstring()?;
        let ty = reflector.type_of_name(&name).unwrap_or_else(|| ComponentType::of(&name));
        let n_views = reader.u32()?;
        let mut views = Vec::with_capacity(n_views as usize);
        for _ in 0..n_views {
            views.push((reader.u32()?, reader.u32()?));
        }
        component_views.insert(ty, views);
    }
    let n_entity_views = reader.u32()?;
    let mut entity_views = Vec::with_capacity(n_entity_views as usize);
    for _ in 0..n_entity_views {
        entity_views.push((reader.u32()?, reader.u32()?));
    }
    let bytes = reader.length_prefixed()?.to_vec();
    Ok(Snapshot { bytes, component_views, entity_views })
}

fn encode_delta_body(out: &mut Vec<u8>, prev_frame_index: u64, delta: &DeltaFrame, reflector: &Reflector) {
    put_u64(out, prev_frame_index);
    put_bytes(out, &delta.entity_delta);
    put_u32(out, delta.type_deltas.len() as u32);
    for type_delta in &delta.type_deltas {
        let name = reflector.name_of(type_delta.ty).expect("networked component type must be registered");
        put_cstring(out, name);
        put_u32(out, type_delta.records.len() as u32);
        for record in &type_delta.records {
            match record {
                ComponentDeltaRecord::New { unique, payload } => {
                    out.push(RECORD_TAG_NEW);
                    put_u64(out, *unique);
                    put_bytes(out, payload);
                }
                ComponentDeltaRecord::Changed { unique, delta } => {
                    out.push(RECORD_TAG_CHANGED);
                    put_u64(out, *unique);
                    put_bytes(out, delta);
                }
                ComponentDeltaRecord::Removed { unique } => {
                    out.push(RECORD_TAG_REMOVED);
                    put_u64(out, *unique);
                }
            }
        }
    }
}

fn decode_delta_body(reader: &mut Reader, reflector: &Reflector) -> Result<(u64, DeltaFrame), WireError> {
    let prev_frame_index = reader.u64()?;
    let entity_delta = reader.length_prefixed()?.to_vec();
    let n_types = reader.u32()?;
    let mut type_deltas = Vec::with_capacity(n_types as usize);
    for _ in 0..n_types {
        let name = reader.cstring()?;
        let ty = reflector.type_of_name(&name).unwrap_or_else(|| ComponentType::of(&name));
        let n_records = reader.u32()?;
        let mut records = Vec::with_capacity(n_records as usize);
        for _ in 0..n_records {
            let tag = reader.u8()?;
            let unique = reader.u64()?;
            let record = match tag {
                RECORD_TAG_NEW => ComponentDeltaRecord::New { unique, payload: reader.length_prefixed()?.to_vec() },
                RECORD_TAG_CHANGED => ComponentDeltaRecord::Changed { unique, delta: reader.length_prefixed()?.to_vec() },
                RECORD_TAG_REMOVED => ComponentDeltaRecord::Removed { unique },
                other => return Err(WireError::UnknownRecordTag(other)),
            };
            records.push(record);
        }
        type_deltas.push(TypeDelta { ty, records });
    }
    Ok((prev_frame_index, DeltaFrame { entity_delta, type_deltas }))
}

/// Serialize a full frame: `marker, frame_index, ViewTables, blob`.
pub fn encode_full_frame(frame_index: u64, snapshot: &Snapshot, reflector: &Reflector) -> Vec<u8> {
    let mut out = Vec::new();
    put_u32(&mut out, FULL_MARKER);
    put_u64(&mut out, frame_index);
    encode_full_body(&mut out, snapshot, reflector);
    out
}

/// Serialize a delta frame: `marker, frame_index, prev_frame_index, delta`.
pub fn encode_delta_frame(frame_index: u64, prev_frame_index: u64, delta: &DeltaFrame, reflector: &Reflector) -> Vec<u8> {
    let mut out = Vec::new();
    put_u32(&mut out, DELTA_MARKER);
    put_u64(&mut out, frame_index);
    encode_delta_body(&mut out, prev_frame_index, delta, reflector);
    out
}

pub enum DecodedFrame {
    Full { frame_index: u64, snapshot: Snapshot },
    Delta { frame_index: u64, prev_frame_index: u64, delta: DeltaFrame },
}

pub fn decode_frame(bytes: &[u8], reflector: &Reflector) -> Result<DecodedFrame, WireError> {
    let mut reader = Reader::new(bytes);
    let marker = reader.u32()?;
    let frame_index = reader.u64()?;
    match marker {
        FULL_MARKER => Ok(DecodedFrame::Full { frame_index, snapshot: decode_full_body(&mut reader, reflector)? }),
        DELTA_MARKER => {
            let (prev_frame_index, delta) = decode_delta_body(&mut reader, reflector)?;
            Ok(DecodedFrame::Delta { frame_index, prev_frame_index, delta })
        }
        other => Err(WireError::UnknownMarker(other)),
    }
}

/// Opaque client identity, assigned by whatever transport owns the
/// connection; this crate only ever uses it as a map key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u64);

/// Per-client replication state the server side keeps: the last frame index
/// each client has acknowledged, used to decide whether the next
/// transmission can be a delta (against that frame) or must be a full frame.
#[derive(Default)]
pub struct ClientChannels {
    last_acknowledged: HashMap<ClientId, u64>,
}

impl ClientChannels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify_of_frame_acknowledgement(&mut self, client: ClientId, frame_index: u64) {
        self.last_acknowledged
            .entry(client)
            .and_modify(|existing| *existing = (*existing).max(frame_index))
            .or_insert(frame_index);
    }

    pub fn last_acknowledged(&self, client: ClientId) -> Option<u64> {
        self.last_acknowledged.get(&client).copied()
    }

    /// Build the bytes to send `client` for `frame_index`, given the sender's
    /// own frame history. Sends a delta against the client's last
    /// acknowledged frame when that frame is still retained, otherwise falls
    /// back to a full frame (e.g. a new client, or one that fell too far
    /// behind for the window to still hold its baseline).
    pub fn transmit_frame(
        &self,
        client: ClientId,
        frame_index: u64,
        history: &FrameHistory,
        current: &Snapshot,
        reflector: &Reflector,
    ) -> Result<Vec<u8>, WireError> {
        match self.last_acknowledged(client).and_then(|prev| history.get(prev).map(|s| (prev, s))) {
            Some((prev_frame_index, baseline)) => {
                let delta = encode_delta(baseline, current)?;
                Ok(encode_delta_frame(frame_index, prev_frame_index, &delta, reflector))
            }
            None => Ok(encode_full_frame(frame_index, current, reflector)),
        }
    }
}
