//! The byte-level run-length delta codec (C9): the general-purpose
//! compression primitive every other part of this crate's wire format is
//! built on.
//!
//! There is no teacher precedent for this exact algorithm (the teacher crate
//! has no network layer at all); it is written from the literal section-type
//! grammar this workspace's specification prescribes, grounded on nothing
//! more than that grammar itself. The `other_examples/` replication-adjacent
//! reference files (lightyear, rerun) use different strategies entirely
//! (interest management, columnar diffing), so there was nothing to adapt
//! from them for this particular primitive.

/// Two-byte sentinel emitted in place of the whole stream when the two
/// input buffers are bit-identical.
pub const IDENTICAL_MARKER: [u8; 2] = [0xFF, 0xFF];

const SECTION_UNCHANGED: u8 = 0;
const SECTION_CHANGED: u8 = 1;
const SECTION_TRAILING: u8 = 2;
const SECTION_TERMINATOR: u8 = 3;

const MAX_SECTION_LEN: usize = 255;
const MIN_UNCHANGED_RUN: usize = 3;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("delta stream truncated")]
    Truncated,
    #[error("unchanged section referenced bytes past the end of the baseline buffer")]
    OutOfBounds,
    #[error("unknown delta section type byte {0}")]
    UnknownSectionType(u8),
    #[error("decoded length {actual} did not match the declared length {expected}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("payload of {0} bytes exceeds the codec's 65535-byte bound; callers must chunk")]
    PayloadTooLarge(usize),
}

/// Produce a delta stream turning `last_seen` into `current`.
pub fn encode(last_seen: &[u8], current: &[u8]) -> Result<Vec<u8>, CodecError> {
    if last_seen == current {
        return Ok(IDENTICAL_MARKER.to_vec());
    }
    if current.len() > u16::MAX as usize {
        return Err(CodecError::PayloadTooLarge(current.len()));
    }

    let mut out = Vec::new();
    out.extend_from_slice(&(current.len() as u16).to_le_bytes());

    let overlap = last_seen.len().min(current.len());
    let mut i = 0usize;
    while i < overlap {
        let run_len = unchanged_run_len(last_seen, current, i, overlap);
        if run_len >= MIN_UNCHANGED_RUN {
            emit_section(&mut out, SECTION_UNCHANGED, run_len, None);
            i += run_len;
            continue;
        }

        let window_end = (i + MAX_SECTION_LEN).min(overlap);
        let mut changed_end = window_end;
        let mut k = i;
        while k < window_end {
            if unchanged_run_len(last_seen, current, k, overlap) >= MIN_UNCHANGED_RUN {
                changed_end = k;
                break;
            }
            k += 1;
        }
        emit_section(&mut out, SECTION_CHANGED, changed_end - i, Some(&current[i..changed_end]));
        i = changed_end;
    }

    let mut t = overlap;
    while t < current.len() {
        let chunk_len = (current.len() - t).min(MAX_SECTION_LEN);
        emit_section(&mut out, SECTION_TRAILING, chunk_len, Some(&current[t..t + chunk_len]));
        t += chunk_len;
    }

    out.push(SECTION_TERMINATOR);
    Ok(out)
}

fn unchanged_run_len(last_seen: &[u8], current: &[u8], start: usize, overlap: usize) -> usize {
    let mut j = start;
    while j < overlap && j - start < MAX_SECTION_LEN && last_seen[j] == current[j] {
        j += 1;
    }
    j - start
}

fn emit_section(out: &mut Vec<u8>, kind: u8, size: usize, payload: Option<&[u8]>) {
    debug_assert!(size <= MAX_SECTION_LEN);
    out.push(kind);
    out.push(size as u8);
    if let Some(p) = payload {
        out.extend_from_slice(p);
    }
}

/// Reconstruct `current` from `last_seen` and a stream produced by [`encode`].
pub fn decode(last_seen: &[u8], encoded: &[u8]) -> Result<Vec<u8>, CodecError> {
    if encoded == IDENTICAL_MARKER {
        return Ok(last_seen.to_vec());
    }
    if encoded.len() < 2 {
        return Err(CodecError::Truncated);
    }
    let declared_len = u16::from_le_bytes([encoded[0], encoded[1]]) as usize;

    let mut out = Vec::with_capacity(declared_len);
    let mut pos = 2usize;
    loop {
        let kind = *encoded.get(pos).ok_or(CodecError::Truncated)?;
        pos += 1;
        if kind == SECTION_TERMINATOR {
            break;
        }
        let size = *encoded.get(pos).ok_or(CodecError::Truncated)? as usize;
        pos += 1;
        match kind {
            SECTION_UNCHANGED => {
                let start = out.len();
                let end = start.checked_add(size).ok_or(CodecError::OutOfBounds)?;
                let slice = last_seen.get(start..end).ok_or(CodecError::OutOfBounds)?;
                out.extend_from_slice(slice);
            }
            SECTION_CHANGED | SECTION_TRAILING => {
                let end = pos.checked_add(size).ok_or(CodecError::Truncated)?;
                let slice = encoded.get(pos..end).ok_or(CodecError::Truncated)?;
                out.extend_from_slice(slice);
                pos = end;
            }
            other => return Err(CodecError::UnknownSectionType(other)),
        }
    }

    if out.len() != declared_len {
        return Err(CodecError::LengthMismatch { expected: declared_len, actual: out.len() });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_buffers_encode_to_exact_sentinel() {
        let buf = [0u8, 1, 2, 3, 4];
        let encoded = encode(&buf, &buf).unwrap();
        assert_eq!(encoded, vec![0xFF, 0xFF]);
    }

    #[test]
    fn roundtrip_on_small_mutation() {
        let last = b"the quick brown fox jumps over the lazy dog".to_vec();
        let mut current = last.clone();
        current[4..9].copy_from_slice(b"SLOW!");
        let encoded = encode(&last, &current).unwrap();
        let decoded = decode(&last, &encoded).unwrap();
        assert_eq!(decoded, current);
    }

    #[test]
    fn roundtrip_when_current_is_longer() {
        let last = vec![1u8, 2, 3];
        let current = vec![1u8, 2, 3, 4, 5, 6, 7];
        let encoded = encode(&last, &current).unwrap();
        let decoded = decode(&last, &encoded).unwrap();
        assert_eq!(decoded, current);
    }

    #[test]
    fn roundtrip_when_current_is_shorter() {
        let last = vec![1u8, 2, 3, 4, 5, 6, 7];
        let current = vec![1u8, 2, 3];
        let encoded = encode(&last, &current).unwrap();
        let decoded = decode(&last, &encoded).unwrap();
        assert_eq!(decoded, current);
    }

    #[test]
    fn roundtrip_totally_different_buffers() {
        let last = vec![0u8; 300];
        let current: Vec<u8> = (0..300).map(|i| (i % 251) as u8).collect();
        let encoded = encode(&last, &current).unwrap();
        let decoded = decode(&last, &encoded).unwrap();
        assert_eq!(decoded, current);
    }

    #[test]
    fn unknown_section_type_is_a_hard_decode_error() {
        let mut malformed = vec![0u8, 0u8]; // declared length 0
        malformed.push(99); // bogus section type
        let err = decode(&[], &malformed);
        assert_eq!(err, Err(CodecError::UnknownSectionType(99)));
    }

    #[test]
    fn truncated_stream_is_rejected() {
        let err = decode(&[], &[0u8]);
        assert_eq!(err, Err(CodecError::Truncated));
    }

    #[test]
    fn oversized_payload_is_rejected_at_encode_time() {
        let huge = vec![0u8; u16::MAX as usize + 1];
        let err = encode(&[], &huge);
        assert!(matches!(err, Err(CodecError::PayloadTooLarge(_))));
    }

    #[cfg(test)]
    mod proptests {
        use super::super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn roundtrip_over_arbitrary_buffers(
                last in prop::collection::vec(any::<u8>(), 0..2000),
                current in prop::collection::vec(any::<u8>(), 0..2000),
            ) {
                let encoded = encode(&last, &current).unwrap();
                let decoded = decode(&last, &encoded).unwrap();
                prop_assert_eq!(decoded, current);
            }
        }
    }
}
