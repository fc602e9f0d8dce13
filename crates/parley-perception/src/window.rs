//! Recognition window ring buffer.
//!
//! A bounded recent-history buffer holding one slot per ingested frame:
//! the recognized person id (if matching succeeded), the face embedding (if
//! detection succeeded), and the raw frame. Continuously overwritten, never
//! persisted. [`resolver`][crate::resolver] votes over the most recent slots.

use std::collections::VecDeque;

use parley_types::PersonId;

use crate::Frame;

/// Default ring capacity (slightly larger than the 10-slot vote span so the
/// vote always has a full view even while new frames land).
pub const DEFAULT_CAPACITY: usize = 15;

/// One frame's recognition outcome.
#[derive(Debug, Clone, Default)]
pub struct WindowSlot {
    /// Matched identity; `None` when the frame was rejected or unmatched.
    pub person: Option<PersonId>,
    /// Face embedding; present whenever detection succeeded, even if the
    /// match against the enrolled set failed.
    pub embedding: Option<Vec<f32>>,
    /// The raw frame, kept for enrollment snapshots.
    pub frame: Option<Frame>,
}

impl WindowSlot {
    /// A slot for a frame where detection itself failed (no face, too small,
    /// side pose, provider error).
    pub fn rejected() -> Self {
        Self::default()
    }
}

/// Fixed-capacity ring of [`WindowSlot`]s, oldest overwritten first.
#[derive(Debug)]
pub struct RecognitionWindow {
    slots: VecDeque<WindowSlot>,
    capacity: usize,
}

impl RecognitionWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Append a slot, evicting the oldest when full.
    pub fn push(&mut self, slot: WindowSlot) {
        if self.slots.len() == self.capacity {
            self.slots.pop_front();
        }
        self.slots.push_back(slot);
    }

    /// The most recent `n` slots, oldest first.
    pub fn last_n(&self, n: usize) -> impl Iterator<Item = &WindowSlot> {
        let skip = self.slots.len().saturating_sub(n);
        self.slots.iter().skip(skip)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl Default for RecognitionWindow {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot_for(id: u64) -> WindowSlot {
        WindowSlot {
            person: Some(PersonId::from_face_number(id)),
            embedding: Some(vec![id as f32]),
            frame: None,
        }
    }

    #[test]
    fn push_evicts_oldest_at_capacity() {
        let mut win = RecognitionWindow::new(3);
        for i in 1..=4 {
            win.push(slot_for(i));
        }
        assert_eq!(win.len(), 3);
        let ids: Vec<_> = win
            .last_n(3)
            .map(|s| s.person.as_ref().unwrap().as_str().to_string())
            .collect();
        assert_eq!(ids, vec!["face_2", "face_3", "face_4"]);
    }

    #[test]
    fn last_n_with_fewer_slots_returns_all() {
        let mut win = RecognitionWindow::new(10);
        win.push(slot_for(1));
        win.push(slot_for(2));
        assert_eq!(win.last_n(10).count(), 2);
    }

    #[test]
    fn rejected_slot_is_empty() {
        let slot = WindowSlot::rejected();
        assert!(slot.person.is_none());
        assert!(slot.embedding.is_none());
        assert!(slot.frame.is_none());
    }

    #[test]
    fn zero_capacity_clamped_to_one() {
        let mut win = RecognitionWindow::new(0);
        win.push(slot_for(1));
        win.push(slot_for(2));
        assert_eq!(win.len(), 1);
    }
}
