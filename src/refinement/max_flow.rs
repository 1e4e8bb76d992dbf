use std::time::Instant;

/// Capacity value treated as unbounded.
pub const INF: i64 = i64::MAX / 4;

#[derive(Debug, Clone, Copy)]
struct FlowArc {
    to: u32,
    cap: i64,
}

/// Dinic max-flow over an explicit flow network. Arcs are stored in pairs,
/// arc `i ^ 1` is the reverse of arc `i`, so the residual update is a
/// single index flip.
pub struct FlowNetwork {
    arcs: Vec<FlowArc>,
    adjacency: Vec<Vec<u32>>,
    levels: Vec<i32>,
    iter: Vec<usize>,
}

impl FlowNetwork {
    pub fn new(num_nodes: usize) -> Self {
        FlowNetwork {
            arcs: Vec::new(),
            adjacency: vec![Vec::new(); num_nodes],
            levels: vec![-1; num_nodes],
            iter: vec![0; num_nodes],
        }
    }

    pub fn num_nodes(&self) -> usize {
        self.adjacency.len()
    }

    pub fn add_node(&mut self) -> u32 {
        self.adjacency.push(Vec::new());
        self.levels.push(-1);
        self.iter.push(0);
        (self.adjacency.len() - 1) as u32
    }

    pub fn add_arc(&mut self, from: u32, to: u32, cap: i64) {
        let id = self.arcs.len() as u32;
        self.arcs.push(FlowArc { to, cap });
        self.arcs.push(FlowArc { to: from, cap: 0 });
        self.adjacency[from as usize].push(id);
        self.adjacency[to as usize].push(id + 1);
    }

    /// Computes the maximum flow from `source` to `sink`. Returns `None`
    /// when the deadline fires mid-computation; the network is then in an
    /// unspecified residual state and must be discarded.
    pub fn max_flow(&mut self, source: u32, sink: u32, deadline: Option<Instant>) -> Option<i64> {
        let mut flow = 0;
        loop {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return None;
            }
            if !self.build_levels(source, sink) {
                return Some(flow);
            }
            self.iter.iter_mut().for_each(|i| *i = 0);
            loop {
                let pushed = self.blocking_flow(source, sink, INF);
                if pushed == 0 {
                    break;
                }
                flow += pushed;
            }
        }
    }

    // BFS layering over residual arcs; false iff the sink is unreachable.
    fn build_levels(&mut self, source: u32, sink: u32) -> bool {
        self.levels.iter_mut().for_each(|l| *l = -1);
        self.levels[source as usize] = 0;
        let mut queue = std::collections::VecDeque::new();
        queue.push_back(source);
        while let Some(u) = queue.pop_front() {
            for &arc_id in &self.adjacency[u as usize] {
                let arc = self.arcs[arc_id as usize];
                if arc.cap > 0 && self.levels[arc.to as usize] < 0 {
                    self.levels[arc.to as usize] = self.levels[u as usize] + 1;
                    queue.push_back(arc.to);
                }
            }
        }
        self.levels[sink as usize] >= 0
    }

    fn blocking_flow(&mut self, u: u32, sink: u32, limit: i64) -> i64 {
        if u == sink {
            return limit;
        }
        while self.iter[u as usize] < self.adjacency[u as usize].len() {
            let arc_id = self.adjacency[u as usize][self.iter[u as usize]] as usize;
            let FlowArc { to, cap } = self.arcs[arc_id];
            if cap > 0 && self.levels[to as usize] == self.levels[u as usize] + 1 {
                let pushed = self.blocking_flow(to, sink, limit.min(cap));
                if pushed > 0 {
                    self.arcs[arc_id].cap -= pushed;
                    self.arcs[arc_id ^ 1].cap += pushed;
                    return pushed;
                }
            }
            self.iter[u as usize] += 1;
        }
        0
    }

    /// After `max_flow`: the source side of a minimum cut (nodes reachable
    /// from the source in the residual network).
    pub fn source_side(&self, source: u32) -> Vec<bool> {
        let mut reachable = vec![false; self.num_nodes()];
        reachable[source as usize] = true;
        let mut queue = std::collections::VecDeque::new();
        queue.push_back(source);
        while let Some(u) = queue.pop_front() {
            for &arc_id in &self.adjacency[u as usize] {
                let arc = self.arcs[arc_id as usize];
                if arc.cap > 0 && !reachable[arc.to as usize] {
                    reachable[arc.to as usize] = true;
                    queue.push_back(arc.to);
                }
            }
        }
        reachable
    }

    /// After `max_flow`: the sink side of a minimum cut (nodes from which
    /// the sink is still reachable in the residual network). The complement
    /// is a second, usually different, minimum cut.
    pub fn sink_side(&self, sink: u32) -> Vec<bool> {
        let mut reaches = vec![false; self.num_nodes()];
        reaches[sink as usize] = true;
        let mut queue = std::collections::VecDeque::new();
        queue.push_back(sink);
        // Walk reverse residual arcs: u reaches the sink through arc (u, v)
        // iff the arc has residual capacity and v reaches the sink.
        while let Some(v) = queue.pop_front() {
            for &arc_id in &self.adjacency[v as usize] {
                // arc_id points away from v; its pair points into v.
                let reverse = self.arcs[(arc_id ^ 1) as usize];
                let from = self.arcs[arc_id as usize].to;
                if reverse.cap > 0 && !reaches[from as usize] {
                    reaches[from as usize] = true;
                    queue.push_back(from);
                }
            }
        }
        reaches
    }
}
