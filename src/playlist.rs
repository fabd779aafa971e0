#![forbid(unsafe_code)]

// Playlist - ordered video queue kept as a doubly-linked node chain plus a position index

use crate::error::{Error, Result};
use std::collections::HashMap;

/// A single queued video. Links are slots in the node arena.
#[derive(Debug, Clone)]
struct VideoNode {
    video_id: String,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Ordered sequence of video ids with positional add/remove/move.
///
/// Nodes live in an arena (`Vec<Option<VideoNode>>`) and are linked by slot
/// number. `index` maps an ordinal position to the slot holding that node and
/// is brought back in line with the chain after every completed mutation.
#[derive(Debug, Clone, Default)]
pub struct PlaylistStore {
    nodes: Vec<Option<VideoNode>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    index: HashMap<usize, usize>,
}

impl PlaylistStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a playlist from a stored snapshot, preserving order
    pub fn from_snapshot<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut playlist = Self::new();
        for id in ids {
            playlist.append(id);
        }
        playlist
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Links a new node at the tail and records it at the last position
    pub fn append(&mut self, video_id: impl Into<String>) {
        let position = self.len();
        let slot = self.alloc(VideoNode {
            video_id: video_id.into(),
            prev: None,
            next: None,
        });
        self.link_at_tail(slot);
        self.index.insert(position, slot);
    }

    /// Video id at `position`
    pub fn id_at(&self, position: usize) -> Result<&str> {
        let slot = self.slot_at(position)?;
        Ok(&self.node(slot).video_id)
    }

    /// Removes the node at `position` and shifts every later position down by one
    pub fn remove_at(&mut self, position: usize) -> Result<String> {
        let slot = self.slot_at(position)?;
        let prior_len = self.len();

        self.detach(slot);
        let removed = self.release(slot);

        for i in (position + 1)..prior_len {
            if let Some(next_slot) = self.index.get(&i).copied() {
                self.index.insert(i - 1, next_slot);
            }
        }
        self.index.remove(&(prior_len - 1));

        Ok(removed.video_id)
    }

    /// Moves the node at `old_position` next to the node currently at `new_position`.
    ///
    /// Moving forward places it after that neighbour, moving backward places it
    /// before, so from `[a, b, c]` a move of `0 -> 2` yields `[b, c, a]`.
    pub fn move_to_index(&mut self, old_position: usize, new_position: usize) -> Result<()> {
        if old_position == new_position {
            return Ok(());
        }

        let moved = self.slot_at(old_position)?;
        let neighbor = self.slot_at(new_position)?;

        self.detach(moved);
        if old_position < new_position {
            self.insert_after(neighbor, moved);
        } else {
            self.insert_before(neighbor, moved);
        }

        self.rebuild_index();
        Ok(())
    }

    /// Ordered walk of the chain, used for wire transmission and storage
    pub fn snapshot_ids(&self) -> Vec<String> {
        let mut ids = Vec::with_capacity(self.len());
        let mut cursor = self.head;
        while let Some(slot) = cursor {
            let node = self.node(slot);
            ids.push(node.video_id.clone());
            cursor = node.next;
        }
        ids
    }

    fn slot_at(&self, position: usize) -> Result<usize> {
        self.index
            .get(&position)
            .copied()
            .ok_or_else(|| Error::NotFound(format!("playlist index {position}")))
    }

    fn node(&self, slot: usize) -> &VideoNode {
        self.nodes[slot]
            .as_ref()
            .unwrap_or_else(|| unreachable!("slot {slot} is linked but vacant"))
    }

    fn node_mut(&mut self, slot: usize) -> &mut VideoNode {
        self.nodes[slot]
            .as_mut()
            .unwrap_or_else(|| unreachable!("slot {slot} is linked but vacant"))
    }

    fn alloc(&mut self, node: VideoNode) -> usize {
        match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = Some(node);
                slot
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        }
    }

    fn release(&mut self, slot: usize) -> VideoNode {
        let node = self.nodes[slot]
            .take()
            .unwrap_or_else(|| unreachable!("slot {slot} released twice"));
        self.free.push(slot);
        node
    }

    fn link_at_tail(&mut self, slot: usize) {
        match self.tail {
            Some(tail) => {
                self.node_mut(tail).next = Some(slot);
                self.node_mut(slot).prev = Some(tail);
            }
            None => self.head = Some(slot),
        }
        self.tail = Some(slot);
    }

    /// Unlinks a node from its neighbours; the node itself stays allocated
    fn detach(&mut self, slot: usize) {
        let (prev, next) = {
            let node = self.node(slot);
            (node.prev, node.next)
        };

        match prev {
            Some(p) => self.node_mut(p).next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.node_mut(n).prev = prev,
            None => self.tail = prev,
        }

        let node = self.node_mut(slot);
        node.prev = None;
        node.next = None;
    }

    fn insert_after(&mut self, anchor: usize, slot: usize) {
        let next = self.node(anchor).next;
        self.node_mut(slot).prev = Some(anchor);
        self.node_mut(slot).next = next;
        self.node_mut(anchor).next = Some(slot);
        match next {
            Some(n) => self.node_mut(n).prev = Some(slot),
            None => self.tail = Some(slot),
        }
    }

    fn insert_before(&mut self, anchor: usize, slot: usize) {
        let prev = self.node(anchor).prev;
        self.node_mut(slot).next = Some(anchor);
        self.node_mut(slot).prev = prev;
        self.node_mut(anchor).prev = Some(slot);
        match prev {
            Some(p) => self.node_mut(p).next = Some(slot),
            None => self.head = Some(slot),
        }
    }

    fn rebuild_index(&mut self) {
        self.index.clear();
        let mut cursor = self.head;
        let mut position = 0;
        while let Some(slot) = cursor {
            self.index.insert(position, slot);
            position += 1;
            cursor = self.node(slot).next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn abc() -> PlaylistStore {
        PlaylistStore::from_snapshot(["a", "b", "c"])
    }

    #[test]
    fn append_keeps_insertion_order() {
        let playlist = abc();
        assert_eq!(playlist.snapshot_ids(), vec!["a", "b", "c"]);
        assert_eq!(playlist.len(), 3);
        assert_eq!(playlist.id_at(2).unwrap(), "c");
    }

    #[test]
    fn remove_shifts_later_positions() {
        let mut playlist = abc();
        assert_eq!(playlist.remove_at(1).unwrap(), "b");
        assert_eq!(playlist.snapshot_ids(), vec!["a", "c"]);
        assert_eq!(playlist.id_at(1).unwrap(), "c");
        assert!(matches!(playlist.id_at(2), Err(Error::NotFound(_))));
    }

    #[test]
    fn remove_missing_index_is_not_found() {
        let mut playlist = abc();
        assert!(matches!(playlist.remove_at(3), Err(Error::NotFound(_))));
        assert_eq!(playlist.snapshot_ids(), vec!["a", "b", "c"]);
    }

    #[test]
    fn move_forward_inserts_after_target() {
        let mut playlist = abc();
        playlist.move_to_index(0, 2).unwrap();
        assert_eq!(playlist.snapshot_ids(), vec!["b", "c", "a"]);
        assert_eq!(playlist.id_at(0).unwrap(), "b");
        assert_eq!(playlist.id_at(2).unwrap(), "a");
    }

    #[test]
    fn move_backward_inserts_before_target() {
        let mut playlist = abc();
        playlist.move_to_index(2, 0).unwrap();
        assert_eq!(playlist.snapshot_ids(), vec!["c", "a", "b"]);

        let mut playlist = abc();
        playlist.move_to_index(2, 1).unwrap();
        assert_eq!(playlist.snapshot_ids(), vec!["a", "c", "b"]);
    }

    #[test]
    fn move_to_same_index_is_noop() {
        let mut playlist = abc();
        playlist.move_to_index(1, 1).unwrap();
        assert_eq!(playlist.snapshot_ids(), vec!["a", "b", "c"]);
    }

    #[test]
    fn move_with_missing_index_leaves_list_intact() {
        let mut playlist = abc();
        assert!(matches!(playlist.move_to_index(0, 7), Err(Error::NotFound(_))));
        assert_eq!(playlist.snapshot_ids(), vec!["a", "b", "c"]);
    }

    #[test]
    fn index_stays_consistent_across_mixed_edits() {
        let mut playlist = abc();
        playlist.append("d");
        playlist.remove_at(0).unwrap();
        playlist.move_to_index(0, 2).unwrap();
        playlist.append("e");

        let ids = playlist.snapshot_ids();
        assert_eq!(ids, vec!["c", "d", "b", "e"]);
        for (i, id) in ids.iter().enumerate() {
            assert_eq!(playlist.id_at(i).unwrap(), id);
        }
    }
}
