//! Priority tree and flow-control bookkeeping (RFC 7540 Sections 5.3
//! and 6.9).
//!
//! Nodes live in a dense slot vector with a free list; the dependency
//! graph uses indices, never owned pointers, so reparenting cycles cost
//! nothing and iteration is a linear scan. Slot 0 is the connection
//! pseudo-node: its `flow`/`inflow` are the connection-level windows.

use std::collections::HashMap;

use crate::frame::{FrameWriter, Priority};
use crate::stream::Stream;

pub(crate) const MAX_WINDOW: i64 = 0x7fff_ffff;
pub(crate) const DEFAULT_WINDOW: i64 = 65535;

/// Default priority weight on the wire is 16; the field stores value-1.
const DEFAULT_WEIGHT: u8 = 15;

const ROOT: usize = 0;

struct Node {
    id: u32,
    parent: usize,
    weight: u8,
    children: Vec<usize>,
    /// Remaining outbound credit.
    flow: i64,
    /// Remaining inbound credit we have advertised.
    inflow: i64,
    /// `None` only for the connection pseudo-node.
    stream: Option<Stream>,
    /// Closed and awaiting eviction.
    marked: bool,
}

enum Slot {
    Free,
    Node(Node),
}

pub(crate) struct PriorityTree {
    slots: Vec<Slot>,
    free: Vec<usize>,
    index: HashMap<u32, usize>,
}

impl PriorityTree {
    pub fn new(connection_flow: i64, connection_inflow: i64) -> Self {
        Self {
            slots: vec![Slot::Node(Node {
                id: 0,
                parent: ROOT,
                weight: DEFAULT_WEIGHT,
                children: Vec::new(),
                flow: connection_flow,
                inflow: connection_inflow,
                stream: None,
                marked: false,
            })],
            free: Vec::new(),
            index: HashMap::new(),
        }
    }

    fn node(&self, idx: usize) -> &Node {
        match &self.slots[idx] {
            Slot::Node(node) => node,
            Slot::Free => unreachable!("dangling tree index"),
        }
    }

    fn node_mut(&mut self, idx: usize) -> &mut Node {
        match &mut self.slots[idx] {
            Slot::Node(node) => node,
            Slot::Free => unreachable!("dangling tree index"),
        }
    }

    fn slot_of(&self, id: u32) -> Option<usize> {
        if id == 0 {
            Some(ROOT)
        } else {
            self.index.get(&id).copied()
        }
    }

    // -- Membership --

    pub fn contains(&self, id: u32) -> bool {
        self.index.contains_key(&id)
    }

    pub fn stream(&self, id: u32) -> Option<&Stream> {
        let idx = *self.index.get(&id)?;
        self.node(idx).stream.as_ref()
    }

    pub fn stream_mut(&mut self, id: u32) -> Option<&mut Stream> {
        let idx = *self.index.get(&id)?;
        self.node_mut(idx).stream.as_mut()
    }

    /// Insert a stream, optionally already prioritized. New nodes hang off
    /// the connection node with the default weight.
    pub fn add(&mut self, stream: Stream, priority: Option<Priority>, flow: i64, inflow: i64) {
        let id = stream.id;
        debug_assert!(!self.contains(id), "stream {id} added twice");
        let node = Node {
            id,
            parent: ROOT,
            weight: DEFAULT_WEIGHT,
            children: Vec::new(),
            flow,
            inflow,
            stream: Some(stream),
            marked: false,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Slot::Node(node);
                idx
            }
            None => {
                self.slots.push(Slot::Node(node));
                self.slots.len() - 1
            }
        };
        self.index.insert(id, idx);
        self.node_mut(ROOT).children.push(idx);
        if let Some(pri) = priority {
            self.reprioritize(id, pri);
        }
    }

    /// All live stream ids, in no particular order.
    pub fn ids(&self) -> Vec<u32> {
        self.index.keys().copied().collect()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.index.len()
    }

    // -- Flow accounting --

    pub fn flow(&self, id: u32) -> i64 {
        self.slot_of(id).map_or(0, |idx| self.node(idx).flow)
    }

    #[cfg(test)]
    fn inflow(&self, id: u32) -> i64 {
        self.slot_of(id).map_or(0, |idx| self.node(idx).inflow)
    }

    /// Grow the outbound window. False when the result would exceed
    /// 2^31-1; the window is left untouched in that case.
    pub fn add_flow(&mut self, id: u32, delta: i64) -> bool {
        let Some(idx) = self.slot_of(id) else {
            return true;
        };
        let node = self.node_mut(idx);
        if node.flow + delta > MAX_WINDOW {
            return false;
        }
        node.flow += delta;
        true
    }

    /// Grow the inbound window; same overflow contract as `add_flow`.
    pub fn add_inflow(&mut self, id: u32, delta: i64) -> bool {
        let Some(idx) = self.slot_of(id) else {
            return true;
        };
        let node = self.node_mut(idx);
        if node.inflow + delta > MAX_WINDOW {
            return false;
        }
        node.inflow += delta;
        true
    }

    /// Debit received payload bytes. May push the window negative on error
    /// paths; the dispatcher checks `allowed_to_receive` first on the
    /// well-behaved path.
    pub fn deduct_inflow(&mut self, id: u32, n: u32) {
        if let Some(idx) = self.slot_of(id) {
            self.node_mut(idx).inflow -= i64::from(n);
        }
    }

    /// Whether the stream's inbound window admits `n` more bytes, given
    /// that the connection window was already debited for them.
    pub fn allowed_to_receive(&self, id: u32, n: u32) -> bool {
        let Some(idx) = self.slot_of(id) else {
            return false;
        };
        self.node(ROOT).inflow >= 0 && self.node(idx).inflow >= i64::from(n)
    }

    // -- Priority maintenance --

    fn is_descendant(&self, idx: usize, of: usize) -> bool {
        let mut at = idx;
        while at != ROOT {
            at = self.node(at).parent;
            if at == of {
                return true;
            }
        }
        false
    }

    fn detach(&mut self, idx: usize) {
        let parent = self.node(idx).parent;
        let siblings = &mut self.node_mut(parent).children;
        siblings.retain(|&c| c != idx);
    }

    fn attach(&mut self, idx: usize, parent: usize) {
        self.node_mut(idx).parent = parent;
        self.node_mut(parent).children.push(idx);
    }

    /// Re-hang a stream per a PRIORITY directive (RFC 7540 Section 5.3.3).
    /// Self-dependency is rejected at the dispatch layer before this call.
    pub fn reprioritize(&mut self, id: u32, pri: Priority) {
        let Some(&idx) = self.index.get(&id) else {
            return;
        };
        debug_assert_ne!(pri.dependency, id, "self-dependency reaches the tree");
        let new_parent = if pri.dependency == 0 {
            ROOT
        } else {
            // Unknown dependencies collapse to the root (RFC 7540 5.3.1).
            self.index.get(&pri.dependency).copied().unwrap_or(ROOT)
        };
        // A dependency on one's own descendant first moves that descendant
        // up into our old spot.
        if self.is_descendant(new_parent, idx) {
            let old_parent = self.node(idx).parent;
            self.detach(new_parent);
            self.attach(new_parent, old_parent);
        }
        self.detach(idx);
        if pri.exclusive {
            let adopted = std::mem::take(&mut self.node_mut(new_parent).children);
            for &child in &adopted {
                self.node_mut(child).parent = idx;
            }
            self.node_mut(idx).children.extend(adopted);
        }
        self.attach(idx, new_parent);
        self.node_mut(idx).weight = pri.weight;
    }

    // -- Removal --

    /// Queue a closed stream for eviction at the next flush. The node
    /// stays findable until then so late frames from the peer still
    /// resolve to a Closed stream rather than to nothing.
    pub fn mark_for_removal(&mut self, id: u32) {
        if let Some(&idx) = self.index.get(&id) {
            self.node_mut(idx).marked = true;
        }
    }

    fn remove_node(&mut self, idx: usize) {
        self.detach(idx);
        let node = match std::mem::replace(&mut self.slots[idx], Slot::Free) {
            Slot::Node(node) => node,
            Slot::Free => unreachable!("dangling tree index"),
        };
        for &child in &node.children {
            self.node_mut(child).parent = node.parent;
        }
        self.node_mut(node.parent).children.extend(node.children);
        self.index.remove(&node.id);
        self.free.push(idx);
    }

    fn evict_marked(&mut self) {
        let marked: Vec<usize> = self
            .index
            .values()
            .copied()
            .filter(|&idx| {
                let node = self.node(idx);
                node.marked
                    && node
                        .stream
                        .as_ref()
                        .is_none_or(|s| !s.requires_output())
            })
            .collect();
        for idx in marked {
            self.remove_node(idx);
        }
    }

    // -- Output --

    pub fn any_output(&self) -> bool {
        self.index.values().any(|&idx| {
            self.node(idx)
                .stream
                .as_ref()
                .is_some_and(|s| s.requires_output())
        })
    }

    /// Walk the tree in priority order and drain response bodies into the
    /// writer, bounded by each stream's window and the connection window.
    /// Returns the streams whose final DATA frame went out during this
    /// flush.
    pub fn flush(&mut self, writer: &mut FrameWriter) -> Vec<u32> {
        self.evict_marked();
        let mut completed = Vec::new();
        self.flush_subtree(ROOT, writer, &mut completed);
        completed
    }

    fn flush_subtree(&mut self, idx: usize, writer: &mut FrameWriter, completed: &mut Vec<u32>) {
        let mut order = self.node(idx).children.clone();
        order.sort_by_key(|&child| std::cmp::Reverse(self.node(child).weight));
        for child in order {
            self.flush_stream(child, writer, completed);
            self.flush_subtree(child, writer, completed);
        }
    }

    fn flush_stream(&mut self, idx: usize, writer: &mut FrameWriter, completed: &mut Vec<u32>) {
        let connection_flow = self.node(ROOT).flow;
        let written;
        let finished_now;
        let id;
        {
            let node = self.node_mut(idx);
            let Some(stream) = node.stream.as_mut() else {
                return;
            };
            // Response headers go out through the engine's preamble pass;
            // body bytes never overtake them.
            if stream.is_closed() || !stream.response_headers_sent {
                return;
            }
            id = stream.id;
            let budget = node.flow.min(connection_flow).max(0) as usize;
            let mut shared = stream.shared.borrow_mut();
            if !shared.response_body.has_output() {
                return;
            }
            let was_final = shared.response_body.final_frame_sent();
            written = shared.response_body.transfer_to_writer(
                writer,
                id,
                stream.max_frame_size,
                budget,
            );
            finished_now = !was_final && shared.response_body.final_frame_sent();
            drop(shared);
            node.flow -= written as i64;
        }
        self.node_mut(ROOT).flow -= written as i64;
        if finished_now {
            completed.push(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{OpenPhase, StreamShared, StreamState};

    fn open_stream(id: u32) -> Stream {
        let mut s = Stream::new(id, 16384, StreamShared::new(64, 64));
        s.state = StreamState::Open(OpenPhase::FullHeaders);
        s
    }

    fn tree_with(ids: &[u32]) -> PriorityTree {
        let mut tree = PriorityTree::new(DEFAULT_WINDOW, DEFAULT_WINDOW);
        for &id in ids {
            tree.add(open_stream(id), None, DEFAULT_WINDOW, DEFAULT_WINDOW);
        }
        tree
    }

    #[test]
    fn flow_overflow_detected() {
        let mut tree = tree_with(&[1]);
        assert!(tree.add_flow(1, 100));
        assert!(!tree.add_flow(1, MAX_WINDOW));
        // Untouched after a failed add.
        assert_eq!(tree.flow(1), DEFAULT_WINDOW + 100);
    }

    #[test]
    fn connection_window_is_slot_zero() {
        let mut tree = tree_with(&[1]);
        tree.deduct_inflow(0, 1000);
        assert_eq!(tree.inflow(0), DEFAULT_WINDOW - 1000);
        assert_eq!(tree.inflow(1), DEFAULT_WINDOW);
    }

    #[test]
    fn allowed_to_receive_consults_both_windows() {
        let mut tree = tree_with(&[1]);
        assert!(tree.allowed_to_receive(1, 1000));
        tree.deduct_inflow(1, (DEFAULT_WINDOW - 10) as u32);
        assert!(!tree.allowed_to_receive(1, 11));
        assert!(tree.allowed_to_receive(1, 10));
        // Connection window overdrawn: nothing is allowed.
        tree.deduct_inflow(0, (DEFAULT_WINDOW + 1) as u32);
        assert!(!tree.allowed_to_receive(1, 1));
    }

    #[test]
    fn reprioritize_moves_descendant_up_first() {
        let mut tree = tree_with(&[1, 3, 5]);
        // 3 under 1, 5 under 3.
        tree.reprioritize(
            3,
            Priority {
                exclusive: false,
                dependency: 1,
                weight: 10,
            },
        );
        tree.reprioritize(
            5,
            Priority {
                exclusive: false,
                dependency: 3,
                weight: 10,
            },
        );
        // Now hang 1 off its own grandchild 5; 5 must move up first.
        tree.reprioritize(
            1,
            Priority {
                exclusive: false,
                dependency: 5,
                weight: 10,
            },
        );
        let idx1 = *tree.index.get(&1).unwrap();
        let idx5 = *tree.index.get(&5).unwrap();
        assert_eq!(tree.node(idx1).parent, idx5);
        assert_eq!(tree.node(idx5).parent, ROOT);
        assert!(!tree.is_descendant(idx5, idx1));
    }

    #[test]
    fn exclusive_insertion_adopts_siblings() {
        let mut tree = tree_with(&[1, 3, 5]);
        tree.reprioritize(
            5,
            Priority {
                exclusive: true,
                dependency: 0,
                weight: 31,
            },
        );
        let idx5 = *tree.index.get(&5).unwrap();
        assert_eq!(tree.node(ROOT).children, vec![idx5]);
        assert_eq!(tree.node(idx5).children.len(), 2);
    }

    #[test]
    fn unknown_dependency_falls_back_to_root() {
        let mut tree = tree_with(&[1]);
        tree.reprioritize(
            1,
            Priority {
                exclusive: false,
                dependency: 99,
                weight: 7,
            },
        );
        let idx1 = *tree.index.get(&1).unwrap();
        assert_eq!(tree.node(idx1).parent, ROOT);
        assert_eq!(tree.node(idx1).weight, 7);
    }

    #[test]
    fn eviction_reparents_children() {
        let mut tree = tree_with(&[1, 3]);
        tree.reprioritize(
            3,
            Priority {
                exclusive: false,
                dependency: 1,
                weight: 10,
            },
        );
        tree.stream_mut(1).unwrap().finish(crate::stream::ClosedReason::Finished);
        tree.mark_for_removal(1);
        let mut writer = FrameWriter::new();
        tree.flush(&mut writer);
        assert!(!tree.contains(1));
        let idx3 = *tree.index.get(&3).unwrap();
        assert_eq!(tree.node(idx3).parent, ROOT);
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn flush_respects_connection_window() {
        let mut tree = PriorityTree::new(10, DEFAULT_WINDOW);
        let mut s = open_stream(1);
        s.response_headers_sent = true;
        s.shared.borrow_mut().response_body.write_bytes(&[0u8; 50]);
        tree.add(s, None, DEFAULT_WINDOW, DEFAULT_WINDOW);
        let mut writer = FrameWriter::new();
        let completed = tree.flush(&mut writer);
        assert!(completed.is_empty());
        // Only the 10 connection-window bytes moved.
        assert_eq!(tree.flow(0), 0);
        assert_eq!(tree.flow(1), DEFAULT_WINDOW - 10);
        let stream = tree.stream(1).unwrap();
        assert!(stream.requires_output());
    }

    #[test]
    fn flush_reports_completion_once() {
        let mut tree = PriorityTree::new(DEFAULT_WINDOW, DEFAULT_WINDOW);
        let mut s = open_stream(1);
        s.response_headers_sent = true;
        {
            let mut shared = s.shared.borrow_mut();
            shared.response_body.write_str("done");
            shared.response_body.close_writer();
        }
        tree.add(s, None, DEFAULT_WINDOW, DEFAULT_WINDOW);
        let mut writer = FrameWriter::new();
        assert_eq!(tree.flush(&mut writer), vec![1]);
        assert!(tree.flush(&mut writer).is_empty());
    }
}
