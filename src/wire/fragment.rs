//! Message fragmentation and reassembly.
//!
//! An application message is split at byte boundaries into at most 127
//! fragments, each carried by one data frame. The receiving side holds a
//! fixed-size slot table per `(peer, message_index)` and emits the ordered
//! concatenation once every slot is filled.
//!
//! A duplicate fragment overwrites its slot, last write wins. The slot
//! table is sized by the first fragment seen for the message; a later
//! fragment carrying a different count does not resize it.

use std::collections::HashMap;

use crate::core::DeviceId;
use crate::core::FragmentError;
use crate::core::constants::MAX_FRAGMENT_COUNT;

/// Split `message` into payloads of at most `max_payload` bytes.
///
/// Returns [`FragmentError::TooManyFragments`] if the message would need
/// more than 127 fragments; nothing is transmitted in that case. An empty
/// message yields a single empty fragment so that it still crosses the
/// wire as one frame.
pub fn fragment(message: &[u8], max_payload: usize) -> Result<Vec<Vec<u8>>, FragmentError> {
    if max_payload == 0 {
        return Err(FragmentError::ZeroPayload);
    }
    if message.is_empty() {
        return Ok(vec![Vec::new()]);
    }
    let needed = message.len().div_ceil(max_payload);
    if needed > MAX_FRAGMENT_COUNT {
        return Err(FragmentError::TooManyFragments {
            len: message.len(),
            needed,
            limit: MAX_FRAGMENT_COUNT,
        });
    }
    Ok(message
        .chunks(max_payload)
        .map(|chunk| chunk.to_vec())
        .collect())
}

/// In-progress reassembly of one message.
#[derive(Debug)]
struct SlotTable {
    slots: Vec<Option<Vec<u8>>>,
    filled: usize,
}

impl SlotTable {
    fn new(fragment_count: u8) -> Self {
        Self {
            slots: (0..fragment_count).map(|_| None).collect(),
            filled: 0,
        }
    }

    /// Insert a fragment; returns the completed message when the last
    /// slot fills.
    fn insert(&mut self, index: u8, payload: Vec<u8>) -> Option<Vec<u8>> {
        let slot = self.slots.get_mut(index as usize)?;
        if slot.is_none() {
            self.filled += 1;
        }
        // Last write wins on a duplicate.
        *slot = Some(payload);

        if self.filled == self.slots.len() {
            let mut message = Vec::new();
            for slot in self.slots.drain(..) {
                message.extend_from_slice(&slot.expect("all slots filled"));
            }
            Some(message)
        } else {
            None
        }
    }
}

/// Reassembles inbound fragments into messages, keyed by
/// `(peer, message_index)`.
#[derive(Debug, Default)]
pub struct Reassembler {
    pending: HashMap<(DeviceId, u32), SlotTable>,
}

impl Reassembler {
    /// Create an empty reassembler.
    pub fn new() -> Self {
        Self {
            pending: HashMap::new(),
        }
    }

    /// Insert one fragment received from `peer`.
    ///
    /// Returns the complete message when this fragment fills the last
    /// slot; the slot table is discarded at that point.
    pub fn insert(
        &mut self,
        peer: DeviceId,
        message_index: u32,
        fragment_index: u8,
        fragment_count: u8,
        payload: Vec<u8>,
    ) -> Option<Vec<u8>> {
        let key = (peer, message_index);
        let table = self
            .pending
            .entry(key)
            .or_insert_with(|| SlotTable::new(fragment_count));
        let complete = table.insert(fragment_index, payload);
        if complete.is_some() {
            self.pending.remove(&key);
        }
        complete
    }

    /// Number of messages currently mid-reassembly.
    pub fn in_progress(&self) -> usize {
        self.pending.len()
    }

    /// Drop all partial messages (session teardown).
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PEER: DeviceId = DeviceId(2);

    #[test]
    fn test_fragment_single() {
        let frags = fragment(b"hi", 64).unwrap();
        assert_eq!(frags, vec![b"hi".to_vec()]);
    }

    #[test]
    fn test_fragment_boundaries() {
        let frags = fragment(b"abcdefgh", 3).unwrap();
        assert_eq!(
            frags,
            vec![b"abc".to_vec(), b"def".to_vec(), b"gh".to_vec()]
        );
    }

    #[test]
    fn test_fragment_exact_multiple() {
        let frags = fragment(&[7u8; 12], 4).unwrap();
        assert_eq!(frags.len(), 3);
        assert!(frags.iter().all(|f| f.len() == 4));
    }

    #[test]
    fn test_fragment_empty_message() {
        let frags = fragment(b"", 16).unwrap();
        assert_eq!(frags, vec![Vec::<u8>::new()]);
    }

    #[test]
    fn test_too_many_fragments() {
        let message = vec![0u8; 128];
        let result = fragment(&message, 1);
        assert!(matches!(
            result,
            Err(FragmentError::TooManyFragments {
                len: 128,
                needed: 128,
                limit: 127,
            })
        ));
    }

    #[test]
    fn test_limit_boundary() {
        // Exactly 127 fragments is fine.
        let message = vec![0u8; 127];
        assert_eq!(fragment(&message, 1).unwrap().len(), 127);
    }

    #[test]
    fn test_roundtrip_in_order() {
        let message = b"the quick brown fox jumps over the lazy dog".to_vec();
        let frags = fragment(&message, 5).unwrap();
        let count = frags.len() as u8;

        let mut reassembler = Reassembler::new();
        let mut result = None;
        for (i, frag) in frags.into_iter().enumerate() {
            result = reassembler.insert(PEER, 0, i as u8, count, frag);
        }
        assert_eq!(result.unwrap(), message);
        assert_eq!(reassembler.in_progress(), 0);
    }

    #[test]
    fn test_roundtrip_out_of_order() {
        let message = b"0123456789abcdef".to_vec();
        let frags = fragment(&message, 3).unwrap();
        let count = frags.len() as u8;

        let mut reassembler = Reassembler::new();
        let mut indexed: Vec<(u8, Vec<u8>)> = frags
            .into_iter()
            .enumerate()
            .map(|(i, f)| (i as u8, f))
            .collect();
        indexed.reverse();

        let mut result = None;
        for (i, frag) in indexed {
            assert!(result.is_none());
            result = reassembler.insert(PEER, 0, i, count, frag);
        }
        assert_eq!(result.unwrap(), message);
    }

    #[test]
    fn test_duplicate_overwrites_slot() {
        let mut reassembler = Reassembler::new();
        assert!(reassembler.insert(PEER, 0, 0, 2, b"old".to_vec()).is_none());
        // Same slot again: last write wins.
        assert!(reassembler.insert(PEER, 0, 0, 2, b"new".to_vec()).is_none());
        let message = reassembler.insert(PEER, 0, 1, 2, b"!".to_vec()).unwrap();
        assert_eq!(message, b"new!".to_vec());
    }

    #[test]
    fn test_interleaved_messages_and_peers() {
        let mut reassembler = Reassembler::new();
        reassembler.insert(DeviceId(2), 0, 0, 2, b"a".to_vec());
        reassembler.insert(DeviceId(3), 0, 0, 2, b"x".to_vec());
        reassembler.insert(DeviceId(2), 1, 0, 1, b"solo".to_vec());
        assert_eq!(reassembler.in_progress(), 2);

        let m2 = reassembler.insert(DeviceId(2), 0, 1, 2, b"b".to_vec()).unwrap();
        let m3 = reassembler.insert(DeviceId(3), 0, 1, 2, b"y".to_vec()).unwrap();
        assert_eq!(m2, b"ab".to_vec());
        assert_eq!(m3, b"xy".to_vec());
        assert_eq!(reassembler.in_progress(), 0);
    }

    #[test]
    fn test_conflicting_count_keeps_first_table() {
        let mut reassembler = Reassembler::new();
        reassembler.insert(PEER, 0, 0, 2, b"a".to_vec());
        // Count of 5 disagrees with the existing table; index 4 has no slot.
        assert!(reassembler.insert(PEER, 0, 4, 5, b"zz".to_vec()).is_none());
        let message = reassembler.insert(PEER, 0, 1, 2, b"b".to_vec()).unwrap();
        assert_eq!(message, b"ab".to_vec());
    }

    #[test]
    fn test_clear_drops_partials() {
        let mut reassembler = Reassembler::new();
        reassembler.insert(PEER, 0, 0, 3, b"a".to_vec());
        reassembler.clear();
        assert_eq!(reassembler.in_progress(), 0);
    }
}
