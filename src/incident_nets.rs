use crate::{EdgeId, NodeId};

/// One incident net of a vertex. An entry is active iff its version is
/// greater or equal to the `current_version` of its list header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    pub edge: EdgeId,
    pub version: u32,
}

/// Header of the incident-net list of a vertex. The lists of vertices
/// contracted into one representative are concatenated in a doubly linked
/// ring; a second ring (`it_prev`/`it_next`) skips empty lists during
/// iteration. All links are vertex ids into the arena, never pointers, so the
/// backing storage can be reallocated freely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Header {
    prev: NodeId,
    next: NodeId,
    it_prev: NodeId,
    it_next: NodeId,
    // Previous tail of this vertex' ring, captured when it was appended to a
    // representative. Needed to cut the ring back apart on uncontraction.
    tail: NodeId,
    // Active entries of this list live in [0, size).
    size: u32,
    // Total active degree of the chain. Only meaningful at the chain head.
    degree: u32,
    current_version: u32,
}

impl Header {
    fn new(u: NodeId) -> Self {
        Header {
            prev: u,
            next: u,
            it_prev: u,
            it_next: u,
            tail: u,
            size: 0,
            degree: 0,
            current_version: 0,
        }
    }
}

/// Incident-net arena supporting in-place contraction and uncontraction.
///
/// Contraction appends the incident-net ring of the contraction partner v to
/// its representative u in O(1) and deactivates all nets shared between the
/// two. Uncontraction must happen in reverse contraction order; it splices
/// v's ring back out and reactivates the shared nets via the version counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncidentNetArray {
    headers: Vec<Header>,
    offsets: Vec<usize>,
    entries: Vec<Entry>,
}

impl IncidentNetArray {
    /// Builds the arena from the pin lists of all hyperedges.
    pub fn new(num_nodes: usize, edges: &[Vec<NodeId>]) -> Self {
        let mut degrees = vec![0usize; num_nodes + 1];
        for pins in edges {
            for &pin in pins {
                debug_assert!((pin as usize) < num_nodes);
                degrees[pin as usize + 1] += 1;
            }
        }
        for i in 1..=num_nodes {
            degrees[i] += degrees[i - 1];
        }
        let offsets = degrees;

        let mut entries = vec![Entry { edge: 0, version: 0 }; offsets[num_nodes]];
        let mut pos = offsets.clone();
        for (e, pins) in edges.iter().enumerate() {
            for &pin in pins {
                entries[pos[pin as usize]] = Entry { edge: e as EdgeId, version: 0 };
                pos[pin as usize] += 1;
            }
        }

        let mut headers = Vec::with_capacity(num_nodes);
        for u in 0..num_nodes {
            let mut header = Header::new(u as NodeId);
            header.size = (offsets[u + 1] - offsets[u]) as u32;
            header.degree = header.size;
            headers.push(header);
        }

        IncidentNetArray { headers, offsets, entries }
    }

    /// Active degree of the chain headed by u.
    pub fn degree(&self, u: NodeId) -> u32 {
        self.headers[u as usize].degree
    }

    /// Iterates over the active incident nets of the chain headed by u.
    pub fn incident_edges(&self, u: NodeId) -> IncidentEdgeIter<'_> {
        IncidentEdgeIter {
            arena: self,
            current: u,
            last: self.headers[u as usize].it_prev,
            pos: 0,
        }
    }

    /// Contracts the incident-net rings of u (representative) and v. Nets for
    /// which `is_shared` returns true are deactivated in v's chain; all other
    /// nets of v survive under the new version. The caller must hold
    /// exclusive access to u while the rings are concatenated, which is what
    /// the `acquire_lock`/`release_lock` closures provide.
    pub fn contract(
        &mut self,
        u: NodeId,
        v: NodeId,
        is_shared: impl Fn(EdgeId) -> bool,
        acquire_lock: impl FnOnce(NodeId),
        release_lock: impl FnOnce(NodeId),
    ) {
        let mut current_v = v;
        loop {
            let off = self.offsets[current_v as usize];
            let header = &mut self.headers[current_v as usize];
            header.current_version += 1;
            let new_version = header.current_version;
            let mut end = header.size as usize;
            let next = header.next;

            let mut i = 0;
            let mut removed = 0u32;
            while i < end {
                if is_shared(self.entries[off + i].edge) {
                    // Net is shared between u and v: deactivate by swapping
                    // it behind the active range. Its version stays put so
                    // uncontraction can find it again.
                    end -= 1;
                    self.entries.swap(off + i, off + end);
                    removed += 1;
                } else {
                    self.entries[off + i].version = new_version;
                    i += 1;
                }
            }
            self.headers[current_v as usize].size = end as u32;
            self.headers[v as usize].degree -= removed;

            if end == 0 && current_v != v {
                self.remove_empty_list(current_v);
            }
            current_v = next;
            if current_v == v {
                break;
            }
        }

        acquire_lock(u);
        let degree_v = self.headers[v as usize].degree;
        self.append(u, v);
        self.headers[u as usize].degree += degree_v;
        release_lock(u);
    }

    /// Uncontracts a previously contracted pair. `on_survivor` is invoked for
    /// every net of v's chain that stayed active through the contraction (u
    /// replaced v in its pin list); `on_reactivated` for every shared net
    /// that is being reactivated (its pin list regains v). Must be called in
    /// reverse contraction order.
    pub fn uncontract(
        &mut self,
        u: NodeId,
        v: NodeId,
        mut on_survivor: impl FnMut(EdgeId),
        mut on_reactivated: impl FnMut(EdgeId),
        acquire_lock: impl FnOnce(NodeId),
        release_lock: impl FnOnce(NodeId),
    ) {
        debug_assert_ne!(self.headers[v as usize].prev, v);
        acquire_lock(u);
        self.splice(v);
        let degree_v = self.headers[v as usize].degree;
        self.headers[u as usize].degree -= degree_v;
        release_lock(u);

        let mut current_v = v;
        let mut last_non_empty = crate::INVALID_NODE;
        loop {
            let off = self.offsets[current_v as usize];
            let capacity = self.offsets[current_v as usize + 1] - off;
            let header = &mut self.headers[current_v as usize];
            debug_assert!(header.current_version > 0);
            header.current_version -= 1;
            let new_version = header.current_version;
            let size = header.size as usize;
            let next = header.next;

            for i in 0..size {
                on_survivor(self.entries[off + i].edge);
            }

            // Reactivate shared nets: they sit right behind the active range
            // with exactly the version we just restored.
            let mut pos = size;
            let mut reactivated = 0u32;
            while pos < capacity && self.entries[off + pos].version == new_version {
                on_reactivated(self.entries[off + pos].edge);
                reactivated += 1;
                pos += 1;
            }
            self.headers[current_v as usize].size = pos as u32;
            self.headers[v as usize].degree += reactivated;

            let restored_size = self.headers[current_v as usize].size;
            if restored_size > 0 || current_v == v {
                if last_non_empty != crate::INVALID_NODE
                    && self.headers[current_v as usize].it_prev != last_non_empty
                {
                    self.headers[last_non_empty as usize].it_next = current_v;
                    self.headers[current_v as usize].it_prev = last_non_empty;
                }
                last_non_empty = current_v;
            }
            current_v = next;
            if current_v == v {
                break;
            }
        }

        debug_assert_ne!(last_non_empty, crate::INVALID_NODE);
        self.headers[v as usize].it_prev = last_non_empty;
        self.headers[last_non_empty as usize].it_next = v;
    }

    /// Deactivates all nets of u's chain for which `should_remove` returns
    /// true. Restored by `restore_incident_nets` in reverse call order.
    pub fn remove_incident_nets(&mut self, u: NodeId, should_remove: impl Fn(EdgeId) -> bool) {
        let mut current_u = u;
        loop {
            let off = self.offsets[current_u as usize];
            let header = &mut self.headers[current_u as usize];
            header.current_version += 1;
            let new_version = header.current_version;
            let mut end = header.size as usize;
            let next = header.next;

            let mut i = 0;
            let mut removed = 0u32;
            while i < end {
                if should_remove(self.entries[off + i].edge) {
                    end -= 1;
                    self.entries.swap(off + i, off + end);
                    removed += 1;
                } else {
                    self.entries[off + i].version = new_version;
                    i += 1;
                }
            }
            self.headers[current_u as usize].size = end as u32;
            self.headers[u as usize].degree -= removed;

            if end == 0 && current_u != u {
                self.remove_empty_list(current_u);
            }
            current_u = next;
            if current_u == u {
                break;
            }
        }
    }

    /// Restores all nets removed by the matching `remove_incident_nets` call.
    /// All uncontractions that happened between the two calls must already be
    /// processed.
    pub fn restore_incident_nets(&mut self, u: NodeId) {
        let mut current_u = u;
        let mut last_non_empty = u;
        loop {
            let off = self.offsets[current_u as usize];
            let capacity = self.offsets[current_u as usize + 1] - off;
            let header = &mut self.headers[current_u as usize];
            debug_assert!(header.current_version > 0);
            header.current_version -= 1;
            let new_version = header.current_version;
            let size = header.size as usize;
            let next = header.next;

            let mut pos = size;
            let mut restored = 0u32;
            while pos < capacity && self.entries[off + pos].version == new_version {
                restored += 1;
                pos += 1;
            }
            self.headers[current_u as usize].size = pos as u32;
            self.headers[u as usize].degree += restored;

            if self.headers[current_u as usize].size > 0 && current_u != u {
                if self.headers[current_u as usize].it_prev != last_non_empty {
                    self.headers[last_non_empty as usize].it_next = current_u;
                    self.headers[current_u as usize].it_prev = last_non_empty;
                }
                last_non_empty = current_u;
            }
            current_u = next;
            if current_u == u {
                break;
            }
        }

        if last_non_empty == self.headers[last_non_empty as usize].it_next {
            self.headers[last_non_empty as usize].it_next = u;
            self.headers[u as usize].it_prev = last_non_empty;
        }
    }

    // Concatenates the rings of u and v and records v's previous tail.
    fn append(&mut self, u: NodeId, v: NodeId) {
        let tail_u = self.headers[u as usize].prev;
        let tail_v = self.headers[v as usize].prev;
        self.headers[tail_u as usize].next = v;
        self.headers[u as usize].prev = tail_v;
        self.headers[v as usize].tail = tail_v;
        self.headers[v as usize].prev = tail_u;
        self.headers[tail_v as usize].next = u;

        let it_tail_u = self.headers[u as usize].it_prev;
        let it_tail_v = self.headers[v as usize].it_prev;
        self.headers[it_tail_u as usize].it_next = v;
        self.headers[u as usize].it_prev = it_tail_v;
        self.headers[v as usize].it_prev = it_tail_u;
        self.headers[it_tail_v as usize].it_next = u;

        if self.headers[v as usize].size == 0 {
            self.remove_empty_list(v);
        }
    }

    // Restores the ring of v to the state before it was appended to its
    // representative.
    fn splice(&mut self, v: NodeId) {
        // Repair the iterator ring of the representative so it skips the
        // lists that belong to v's ring.
        let tail = self.headers[v as usize].tail;
        let mut non_empty_prev_v = v;
        let mut non_empty_next_tail = tail;
        while non_empty_prev_v == v || self.headers[non_empty_prev_v as usize].size == 0 {
            non_empty_prev_v = self.headers[non_empty_prev_v as usize].prev;
        }
        while non_empty_next_tail == tail || self.headers[non_empty_next_tail as usize].size == 0 {
            non_empty_next_tail = self.headers[non_empty_next_tail as usize].next;
        }
        debug_assert!(
            non_empty_prev_v != non_empty_next_tail
                || self.headers[non_empty_prev_v as usize].it_next == non_empty_next_tail
                || self.headers[non_empty_prev_v as usize].size > 0,
            "splice hit a singleton iterator cycle in an inconsistent state"
        );
        self.headers[non_empty_prev_v as usize].it_next = non_empty_next_tail;
        self.headers[non_empty_next_tail as usize].it_prev = non_empty_prev_v;

        // Cut v's ring [v, tail] back out of the representative's ring.
        let prev_v = self.headers[v as usize].prev;
        let next_tail = self.headers[tail as usize].next;
        self.headers[v as usize].prev = tail;
        self.headers[tail as usize].next = v;
        self.headers[next_tail as usize].prev = prev_v;
        self.headers[prev_v as usize].next = next_tail;
    }

    fn remove_empty_list(&mut self, u: NodeId) {
        debug_assert_eq!(self.headers[u as usize].size, 0);
        let it_prev = self.headers[u as usize].it_prev;
        let it_next = self.headers[u as usize].it_next;
        self.headers[it_prev as usize].it_next = it_next;
        self.headers[it_next as usize].it_prev = it_prev;
        self.headers[u as usize].it_next = u;
        self.headers[u as usize].it_prev = u;
    }

    fn list_size(&self, u: NodeId) -> u32 {
        self.headers[u as usize].size
    }
}

pub struct IncidentEdgeIter<'a> {
    arena: &'a IncidentNetArray,
    current: NodeId,
    last: NodeId,
    pos: u32,
}

impl<'a> Iterator for IncidentEdgeIter<'a> {
    type Item = EdgeId;

    fn next(&mut self) -> Option<EdgeId> {
        loop {
            if self.pos < self.arena.list_size(self.current) {
                let off = self.arena.offsets[self.current as usize];
                let edge = self.arena.entries[off + self.pos as usize].edge;
                self.pos += 1;
                return Some(edge);
            }
            if self.current == self.last {
                return None;
            }
            self.current = self.arena.headers[self.current as usize].it_next;
            self.pos = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toy_edges() -> Vec<Vec<NodeId>> {
        // e0 = {0, 2}, e1 = {0, 1, 3, 4}, e2 = {3, 4, 6}, e3 = {2, 5, 6}
        vec![vec![0, 2], vec![0, 1, 3, 4], vec![3, 4, 6], vec![2, 5, 6]]
    }

    fn active_edges(arr: &IncidentNetArray, u: NodeId) -> Vec<EdgeId> {
        let mut edges: Vec<EdgeId> = arr.incident_edges(u).collect();
        edges.sort_unstable();
        edges
    }

    #[test]
    fn test_construction_degrees() {
        let arr = IncidentNetArray::new(7, &toy_edges());
        assert_eq!(arr.degree(0), 2);
        assert_eq!(arr.degree(1), 1);
        assert_eq!(arr.degree(4), 2);
        assert_eq!(arr.degree(6), 2);
        assert_eq!(active_edges(&arr, 3), vec![1, 2]);
    }

    #[test]
    fn test_contract_deactivates_shared_nets() {
        let mut arr = IncidentNetArray::new(7, &toy_edges());
        // Contract 4 into 3: e1 and e2 are shared, so 3 keeps degree 2.
        let shared = [1u32, 2u32];
        arr.contract(3, 4, |e| shared.contains(&e), |_| {}, |_| {});
        assert_eq!(arr.degree(3), 2);
        assert_eq!(active_edges(&arr, 3), vec![1, 2]);
    }

    #[test]
    fn test_contract_concatenates_nonshared_nets() {
        let mut arr = IncidentNetArray::new(7, &toy_edges());
        // Contract 2 into 0: only e0 is shared; 0 gains e3 from 2.
        arr.contract(0, 2, |e| e == 0, |_| {}, |_| {});
        assert_eq!(arr.degree(0), 2);
        assert_eq!(active_edges(&arr, 0), vec![1, 3]);
    }

    // Active net sets, degrees and list sizes of every vertex. This is the
    // observable state that contraction round trips must restore exactly;
    // the physical entry order inside a list may differ.
    fn observable_state(arr: &IncidentNetArray, num_nodes: usize) -> Vec<(Vec<EdgeId>, u32, u32)> {
        (0..num_nodes as NodeId)
            .map(|u| (active_edges(arr, u), arr.degree(u), arr.list_size(u)))
            .collect()
    }

    #[test]
    fn test_uncontract_restores_state() {
        let arr = IncidentNetArray::new(7, &toy_edges());
        let mut work = arr.clone();

        let mut survivors = Vec::new();
        let mut reactivated = Vec::new();
        work.contract(0, 2, |e| e == 0, |_| {}, |_| {});
        work.uncontract(
            0,
            2,
            |e| survivors.push(e),
            |e| reactivated.push(e),
            |_| {},
            |_| {},
        );

        assert_eq!(survivors, vec![3]);
        assert_eq!(reactivated, vec![0]);
        assert_eq!(observable_state(&work, 7), observable_state(&arr, 7));
    }

    #[test]
    fn test_nested_contraction_round_trip() {
        let arr = IncidentNetArray::new(7, &toy_edges());
        let mut work = arr.clone();

        // 4 -> 3, then (3+4) -> 0. Reverse order restores everything.
        work.contract(3, 4, |e| e == 1 || e == 2, |_| {}, |_| {});
        let after_first = observable_state(&work, 7);
        work.contract(0, 3, |e| e == 1, |_| {}, |_| {});

        work.uncontract(0, 3, |_| {}, |_| {}, |_| {}, |_| {});
        assert_eq!(observable_state(&work, 7), after_first);
        work.uncontract(3, 4, |_| {}, |_| {}, |_| {}, |_| {});
        assert_eq!(observable_state(&work, 7), observable_state(&arr, 7));
    }

    #[test]
    fn test_remove_and_restore_incident_nets() {
        let arr = IncidentNetArray::new(7, &toy_edges());
        let mut work = arr.clone();

        work.remove_incident_nets(6, |e| e == 2);
        assert_eq!(arr.degree(6), 2);
        assert_eq!(work.degree(6), 1);
        assert_eq!(active_edges(&work, 6), vec![3]);

        work.restore_incident_nets(6);
        assert_eq!(work.degree(6), 2);
        assert_eq!(active_edges(&work, 6), vec![2, 3]);
    }
}
