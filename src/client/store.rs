//! Local copy of a room's shared shape map.
//!
//! DESIGN
//! ======
//! The server publishes every accepted write to every member of the room,
//! the writer included, in acceptance order. Applying those frames in
//! arrival order therefore ends on the canonical map. The only extra state
//! is a per-key count of own writes still waiting for their echo:
//!
//! - Own write: applied immediately, count + 1.
//! - Own echo or `storage-reject`: count - 1. Once the count is back to
//!   zero the carried value is applied; before that a newer own write is
//!   still on its way and would only flicker back.
//! - Peer write to a key with a pending own write: skipped. It was
//!   accepted before ours (otherwise our echo would have arrived first),
//!   so our echo or reject settles the key.
//!
//! A snapshot replaces everything and clears the counts.

use std::collections::HashMap;

use crate::model::Shape;

#[derive(Debug, Default)]
pub struct LocalShapeStore {
    shapes: HashMap<String, Shape>,
    in_flight: HashMap<String, u32>,
    synced: bool,
}

impl LocalShapeStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// False until the first snapshot, and again while reconnecting.
    #[must_use]
    pub fn is_synced(&self) -> bool {
        self.synced
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Shape> {
        self.shapes.get(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.shapes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shapes.is_empty()
    }

    /// Shapes back to front: `zIndex`, then id.
    #[must_use]
    pub fn ordered(&self) -> Vec<&Shape> {
        let mut shapes: Vec<&Shape> = self.shapes.values().collect();
        shapes.sort_by(|a, b| a.z_index.cmp(&b.z_index).then_with(|| a.id.cmp(&b.id)));
        shapes
    }

    #[must_use]
    pub fn has_pending(&self, key: &str) -> bool {
        self.in_flight.contains_key(key)
    }

    // =========================================================================
    // LOCAL WRITES
    // =========================================================================

    /// Optimistically store `shape`. Returns the value it replaced.
    pub fn put_local(&mut self, shape: Shape) -> Option<Shape> {
        *self.in_flight.entry(shape.id.clone()).or_insert(0) += 1;
        self.shapes.insert(shape.id.clone(), shape)
    }

    /// Optimistically remove `key`. Returns the removed value.
    pub fn delete_local(&mut self, key: &str) -> Option<Shape> {
        *self.in_flight.entry(key.to_owned()).or_insert(0) += 1;
        self.shapes.remove(key)
    }

    /// `key` rewritten to sit above every other shape, or `None` if absent.
    #[must_use]
    pub fn raised(&self, key: &str) -> Option<Shape> {
        let shape = self.shapes.get(key)?;
        let top = self.shapes.values().filter(|s| s.id != key).map(|s| s.z_index).max();
        Some(Shape { z_index: top.map_or(shape.z_index, |z| z.saturating_add(1)), ..shape.clone() })
    }

    /// `key` rewritten to sit below every other shape, or `None` if absent.
    #[must_use]
    pub fn lowered(&self, key: &str) -> Option<Shape> {
        let shape = self.shapes.get(key)?;
        let bottom = self.shapes.values().filter(|s| s.id != key).map(|s| s.z_index).min();
        Some(Shape { z_index: bottom.map_or(shape.z_index, |z| z.saturating_sub(1)), ..shape.clone() })
    }

    // =========================================================================
    // SERVER FRAMES
    // =========================================================================

    /// Own write echoed back, or the authoritative value after a rejection.
    /// Returns whether the visible value changed.
    pub fn settle(&mut self, key: &str, value: Option<Shape>) -> bool {
        if let Some(count) = self.in_flight.get_mut(key) {
            *count = count.saturating_sub(1);
            if *count > 0 {
                return false;
            }
            self.in_flight.remove(key);
        }
        self.set(key, value)
    }

    /// A peer's write. Returns whether the visible value changed.
    pub fn apply_remote(&mut self, key: &str, value: Option<Shape>) -> bool {
        if self.in_flight.contains_key(key) {
            return false;
        }
        self.set(key, value)
    }

    /// Replace the whole map with a snapshot.
    pub fn resync(&mut self, shapes: Vec<Shape>) {
        self.shapes = shapes.into_iter().map(|shape| (shape.id.clone(), shape)).collect();
        self.in_flight.clear();
        self.synced = true;
    }

    /// The map may be behind the server until the next snapshot.
    pub fn mark_unsynced(&mut self) {
        self.synced = false;
    }

    fn set(&mut self, key: &str, value: Option<Shape>) -> bool {
        match value {
            Some(shape) => self.shapes.insert(key.to_owned(), shape.clone()).as_ref() != Some(&shape),
            None => self.shapes.remove(key).is_some(),
        }
    }
}
