//! Relay routing over a directed reachability graph.
//!
//! Nodes carry their current score, an edge `a -> b` means `a` can reach
//! `b` directly. Paths start at the local instance and are compared first by
//! hop count, then by the sum of the scores of the nodes they pass through.
//!
//! Traversal visits neighbours in insertion order so results are stable for
//! a given graph.

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{HashMap, HashSet, VecDeque};

/// A route as node IDs, starting with the local instance.
pub type Path = Vec<String>;

/// Score sums closer than this are ties.
const SCORE_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone)]
struct Vertex {
    id: String,
    score: f64,
}

#[derive(Debug, Clone)]
pub struct ReachabilityGraph {
    graph: DiGraph<Vertex, ()>,
    index: HashMap<String, NodeIndex>,
    root: NodeIndex,
}

impl ReachabilityGraph {
    /// New graph containing only the local instance.
    pub fn new(instance_id: impl Into<String>) -> Self {
        let mut graph = DiGraph::new();
        let id = instance_id.into();
        let root = graph.add_node(Vertex {
            id: id.clone(),
            score: 0.0,
        });
        let mut index = HashMap::new();
        index.insert(id, root);
        Self { graph, index, root }
    }

    pub fn instance_id(&self) -> &str {
        &self.graph[self.root].id
    }

    /// Add a node, or update its score if already present.
    pub fn add_node(&mut self, node_id: &str, score: f64) {
        match self.index.get(node_id) {
            Some(&ix) => self.graph[ix].score = score,
            None => {
                let ix = self.graph.add_node(Vertex {
                    id: node_id.to_string(),
                    score,
                });
                self.index.insert(node_id.to_string(), ix);
            }
        }
    }

    /// Add a reachability edge. Unknown endpoints are added with score 0.
    pub fn add_edge(&mut self, from: &str, to: &str) {
        if !self.index.contains_key(from) {
            self.add_node(from, 0.0);
        }
        if !self.index.contains_key(to) {
            self.add_node(to, 0.0);
        }
        let (a, b) = (self.index[from], self.index[to]);
        if self.graph.find_edge(a, b).is_none() {
            self.graph.add_edge(a, b, ());
        }
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.index.contains_key(node_id)
    }

    pub fn score(&self, node_id: &str) -> Option<f64> {
        self.index.get(node_id).map(|&ix| self.graph[ix].score)
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Successors in insertion order.
    fn successors(&self, ix: NodeIndex) -> Vec<NodeIndex> {
        let mut out: Vec<NodeIndex> = self.graph.neighbors_directed(ix, Direction::Outgoing).collect();
        out.sort();
        out
    }
}

/// Breadth-first search from the root that keeps every shortest-path parent.
struct ShortestPaths {
    parents: HashMap<NodeIndex, Vec<NodeIndex>>,
    depth: HashMap<NodeIndex, usize>,
    /// Discovery order, root excluded.
    order: Vec<NodeIndex>,
}

impl ShortestPaths {
    fn from_root(g: &ReachabilityGraph) -> Self {
        let mut parents: HashMap<NodeIndex, Vec<NodeIndex>> = HashMap::new();
        let mut depth = HashMap::new();
        let mut order = Vec::new();
        let mut queue = VecDeque::new();

        depth.insert(g.root, 0usize);
        queue.push_back(g.root);
        while let Some(ix) = queue.pop_front() {
            let d = depth[&ix];
            for next in g.successors(ix) {
                match depth.get(&next) {
                    None => {
                        depth.insert(next, d + 1);
                        parents.insert(next, vec![ix]);
                        order.push(next);
                        queue.push_back(next);
                    }
                    Some(&nd) if nd == d + 1 => {
                        parents.entry(next).or_default().push(ix);
                    }
                    Some(_) => {}
                }
            }
        }
        Self { parents, depth, order }
    }

    /// Every shortest path from the root to `target`, as vertex lists.
    fn all_paths(&self, root: NodeIndex, target: NodeIndex) -> Vec<Vec<NodeIndex>> {
        if target == root {
            return vec![vec![root]];
        }
        let Some(parents) = self.parents.get(&target) else {
            return Vec::new();
        };
        parents
            .iter()
            .flat_map(|&p| self.all_paths(root, p))
            .map(|mut path| {
                path.push(target);
                path
            })
            .collect()
    }
}

/// Finds relay routes within the hop budget of a relay envelope.
#[derive(Debug, Clone, Copy)]
pub struct Router {
    default_ttl: u32,
}

impl Router {
    pub fn new(default_ttl: u32) -> Self {
        Self { default_ttl }
    }

    /// A path is usable when its node count stays below the TTL: the
    /// sender's direct attempt already spent one unit of it.
    fn within_bound(&self, nodes: usize) -> bool {
        nodes < self.default_ttl as usize
    }

    /// Best paths from the local instance to `target`.
    ///
    /// Reachable target: every shortest path with the highest score sum, or
    /// nothing if the shortest path is too long. Unreachable or unknown
    /// target: one best path to each reachable node within the bound,
    /// ordered by that node's score, so the caller can try the nodes most
    /// likely to extend its reach first.
    pub fn find_path_to_node(&self, graph: &ReachabilityGraph, target: &str) -> Vec<Path> {
        if target == graph.instance_id() {
            return Vec::new();
        }
        let sp = ShortestPaths::from_root(graph);

        if let Some(&tix) = graph.index.get(target) {
            if let Some(&d) = sp.depth.get(&tix) {
                if !self.within_bound(d + 1) {
                    tracing::debug!(target, hops = d, "route: target beyond hop bound");
                    return Vec::new();
                }
                let paths = best_paths(graph, sp.all_paths(graph.root, tix));
                return paths.into_iter().map(|p| to_ids(graph, &p)).collect();
            }
        }

        let mut endpoints: Vec<NodeIndex> = sp
            .order
            .iter()
            .copied()
            .filter(|ix| self.within_bound(sp.depth[ix] + 1))
            .collect();
        // Stable: discovery order breaks score ties.
        endpoints.sort_by(|a, b| graph.graph[*b].score.total_cmp(&graph.graph[*a].score));

        let paths: Vec<Path> = endpoints
            .into_iter()
            .filter_map(|ix| {
                best_paths(graph, sp.all_paths(graph.root, ix))
                    .into_iter()
                    .next()
                    .map(|p| to_ids(graph, &p))
            })
            .collect();
        tracing::debug!(target, candidates = paths.len(), "route: target unreachable, ranking endpoints");
        paths
    }

    /// Directly adjacent nodes that cover `targets` between them: the
    /// distinct first hops of their best paths, highest score first.
    /// Targets with no path inside the bound contribute nothing.
    pub fn find_relay_nodes(&self, graph: &ReachabilityGraph, targets: &[String]) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut hops: Vec<String> = Vec::new();
        for target in targets {
            for path in self.find_path_to_node(graph, target) {
                if let Some(hop) = path.get(1) {
                    if seen.insert(hop.clone()) {
                        hops.push(hop.clone());
                    }
                }
            }
        }
        let score = |id: &String| graph.score(id).unwrap_or(0.0);
        hops.sort_by(|a, b| score(b).total_cmp(&score(a)));
        hops
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new(5)
    }
}

fn path_score(graph: &ReachabilityGraph, path: &[NodeIndex]) -> f64 {
    path.iter().map(|&ix| graph.graph[ix].score).sum()
}

/// Paths sharing the maximum score sum, in enumeration order.
fn best_paths(graph: &ReachabilityGraph, paths: Vec<Vec<NodeIndex>>) -> Vec<Vec<NodeIndex>> {
    let best = paths
        .iter()
        .map(|p| path_score(graph, p))
        .fold(f64::NEG_INFINITY, f64::max);
    paths
        .into_iter()
        .filter(|p| (path_score(graph, p) - best).abs() < SCORE_EPSILON)
        .collect()
}

fn to_ids(graph: &ReachabilityGraph, path: &[NodeIndex]) -> Path {
    path.iter().map(|&ix| graph.graph[ix].id.clone()).collect()
}
