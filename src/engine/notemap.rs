// Copyright (c) 2026 Robert L. Snyder, Sierra Vista, AZ
// Licensed under the MIT License. See LICENSE file in the project root for details.

//! Keyed counters for the currently-sounding notes and held pedals.
//!
//! Each entry maps a `(device, track, channel, note)` key to the number of
//! outstanding note-ons for that key. A note slot of [`PEDAL`] records the
//! sustain-pedal-down state for the channel. The map is ordered
//! lexicographically so that all entries for one device and track form a
//! contiguous subrange.

use std::collections::BTreeMap;

use crate::midi::ALL_TRACKS;

/// Note slot denoting the sustain pedal rather than a key.
pub const PEDAL: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct NoteKey {
    device: i32,
    track: i32,
    channel: i32,
    note: i32,
}

/// Map from `(device, track, channel, note)` to an active-count.
#[derive(Debug, Default)]
pub struct NoteMap {
    map: BTreeMap<NoteKey, i32>,
}

impl NoteMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment the count for a key, returning the previous count.
    pub fn push(&mut self, device: i32, track: i32, channel: i32, note: i32) -> i32 {
        let count = self
            .map
            .entry(NoteKey {
                device,
                track,
                channel,
                note,
            })
            .or_insert(0);
        let previous = *count;
        *count += 1;
        previous
    }

    /// Decrement the count for a key, returning the new count. The entry is
    /// removed when it reaches zero; an absent key reports zero.
    pub fn pop(&mut self, device: i32, track: i32, channel: i32, note: i32) -> i32 {
        let key = NoteKey {
            device,
            track,
            channel,
            note,
        };
        match self.map.get_mut(&key) {
            Some(count) => {
                *count -= 1;
                let remaining = *count;
                if remaining == 0 {
                    self.map.remove(&key);
                }
                remaining
            }
            None => 0,
        }
    }

    /// Insert a key with the given count only if it is absent.
    pub fn set(&mut self, device: i32, track: i32, channel: i32, note: i32, count: i32) {
        self.map
            .entry(NoteKey {
                device,
                track,
                channel,
                note,
            })
            .or_insert(count);
    }

    /// Remove every entry.
    pub fn clear(&mut self) {
        self.map.clear();
    }

    /// Remove every entry for one device, track and channel.
    pub fn clear_channel(&mut self, device: i32, track: i32, channel: i32) {
        self.map
            .retain(|k, _| !(k.device == device && k.track == track && k.channel == channel));
    }

    /// Remove every entry for a device and track (or all tracks), calling
    /// the visitor exactly once per removed entry with
    /// `(device, track, channel, note, count)`.
    pub fn clear_and_call<F>(&mut self, device: i32, track: i32, mut visitor: F)
    where
        F: FnMut(i32, i32, i32, i32, i32),
    {
        let removed: Vec<(NoteKey, i32)> = self
            .map
            .iter()
            .filter(|(k, _)| k.device == device && (track == ALL_TRACKS || k.track == track))
            .map(|(k, c)| (*k, *c))
            .collect();
        for (key, count) in removed {
            self.map.remove(&key);
            visitor(key.device, key.track, key.channel, key.note, count);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_returns_previous_count() {
        let mut map = NoteMap::new();
        assert_eq!(map.push(0, 0, 1, 60), 0);
        assert_eq!(map.push(0, 0, 1, 60), 1);
        assert_eq!(map.push(0, 0, 1, 60), 2);
    }

    #[test]
    fn test_pop_returns_new_count_and_removes_at_zero() {
        let mut map = NoteMap::new();
        map.push(0, 0, 1, 60);
        map.push(0, 0, 1, 60);
        assert_eq!(map.pop(0, 0, 1, 60), 1);
        assert_eq!(map.pop(0, 0, 1, 60), 0);
        assert!(map.is_empty());
        // popping an absent key is a no-op reporting zero
        assert_eq!(map.pop(0, 0, 1, 60), 0);
        assert!(map.is_empty());
    }

    #[test]
    fn test_set_only_inserts_when_absent() {
        let mut map = NoteMap::new();
        map.set(0, 2, 3, PEDAL, 1);
        map.set(0, 2, 3, PEDAL, 99);
        assert_eq!(map.pop(0, 2, 3, PEDAL), 0);
        assert!(map.is_empty());
    }

    #[test]
    fn test_clear_channel() {
        let mut map = NoteMap::new();
        map.push(0, 0, 1, 60);
        map.push(0, 0, 1, 62);
        map.push(0, 0, 2, 60);
        map.clear_channel(0, 0, 1);
        assert_eq!(map.pop(0, 0, 2, 60), 0); // still present, drops to zero
        assert!(map.is_empty());
    }

    #[test]
    fn test_clear_and_call_single_track() {
        let mut map = NoteMap::new();
        map.push(0, 1, 0, 60);
        map.push(0, 1, 0, 60);
        map.push(0, 2, 0, 64);
        map.push(1, 1, 0, 67);

        let mut visited = Vec::new();
        map.clear_and_call(0, 1, |d, tk, ch, n, count| {
            visited.push((d, tk, ch, n, count));
        });
        assert_eq!(visited, vec![(0, 1, 0, 60, 2)]);
        // the other entries survive
        assert_eq!(map.pop(0, 2, 0, 64), 0);
        assert_eq!(map.pop(1, 1, 0, 67), 0);
        assert!(map.is_empty());
    }

    #[test]
    fn test_clear_and_call_all_tracks() {
        let mut map = NoteMap::new();
        map.push(0, 1, 0, 60);
        map.push(0, 2, 5, 64);
        map.set(0, 3, 0, PEDAL, 1);
        map.push(1, 0, 0, 70);

        let mut visited = Vec::new();
        map.clear_and_call(0, ALL_TRACKS, |_, _, ch, n, count| {
            visited.push((ch, n, count));
        });
        // lexicographic order over (track, channel, note)
        assert_eq!(visited, vec![(0, 60, 1), (5, 64, 1), (0, PEDAL, 1)]);
        assert_eq!(map.pop(1, 0, 0, 70), 0);
        assert!(map.is_empty());
    }
}
