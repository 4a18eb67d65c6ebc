//! Chain validation and scheduling order.
//!
//! Nodes are addressed by their index in `Chain::nodes`; every ordering
//! decision breaks ties by that index so runs are reproducible.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::error::OrchestratorError;
use crate::types::{Chain, NodeKind};

/// Aliases the token resolver always provides.
pub const RESERVED_ALIASES: [&str; 2] = ["input", "root"];

#[derive(Debug, Clone)]
pub struct ChainGraph {
    parents: Vec<Vec<usize>>,
    children: Vec<Vec<usize>>,
    order: Vec<usize>,
    ancestors: Vec<BTreeSet<usize>>,
}

impl ChainGraph {
    /// Validates `chain` and computes a stable topological order.
    pub fn build(chain: &Chain) -> Result<Self, OrchestratorError> {
        let mut index: HashMap<&str, usize> = HashMap::new();
        let mut names: HashSet<&str> = HashSet::new();
        for (i, node) in chain.nodes.iter().enumerate() {
            if node.id.trim().is_empty() {
                return Err(OrchestratorError::InvalidChain(format!(
                    "node #{} has an empty id",
                    i
                )));
            }
            if index.insert(node.id.as_str(), i).is_some() {
                return Err(OrchestratorError::InvalidChain(format!(
                    "duplicate node id '{}'",
                    node.id
                )));
            }
            if node.kind == NodeKind::AgentCall
                && node.agent_ref.as_deref().map(str::trim).unwrap_or("").is_empty()
            {
                return Err(OrchestratorError::InvalidChain(format!(
                    "agent-call node '{}' has no agent_ref",
                    node.id
                )));
            }
            let alias = node.alias.as_deref().filter(|a| *a != node.id);
            for name in std::iter::once(node.id.as_str()).chain(alias) {
                if RESERVED_ALIASES.contains(&name) {
                    return Err(OrchestratorError::InvalidChain(format!(
                        "'{}' is a reserved token alias",
                        name
                    )));
                }
                if !names.insert(name) {
                    return Err(OrchestratorError::InvalidChain(format!(
                        "alias '{}' is already used by another node",
                        name
                    )));
                }
            }
        }

        let n = chain.nodes.len();
        let mut parents = vec![Vec::new(); n];
        let mut children = vec![Vec::new(); n];
        for edge in &chain.edges {
            let from = *index.get(edge.from.as_str()).ok_or_else(|| {
                OrchestratorError::InvalidChain(format!("edge source '{}' is not a node", edge.from))
            })?;
            let to = *index.get(edge.to.as_str()).ok_or_else(|| {
                OrchestratorError::InvalidChain(format!("edge target '{}' is not a node", edge.to))
            })?;
            if !parents[to].contains(&from) {
                parents[to].push(from);
                children[from].push(to);
            }
        }
        for list in parents.iter_mut().chain(children.iter_mut()) {
            list.sort_unstable();
        }

        // Kahn's algorithm; the ready set is ordered by definition index
        let mut indegree: Vec<usize> = parents.iter().map(Vec::len).collect();
        let mut ready: BTreeSet<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
        let mut order = Vec::with_capacity(n);
        while let Some(next) = ready.pop_first() {
            order.push(next);
            for &child in &children[next] {
                indegree[child] -= 1;
                if indegree[child] == 0 {
                    ready.insert(child);
                }
            }
        }
        if order.len() < n {
            let nodes = (0..n)
                .filter(|&i| indegree[i] > 0)
                .map(|i| chain.nodes[i].id.clone())
                .collect();
            return Err(OrchestratorError::GraphCycle { nodes });
        }

        // Parents come earlier in `order`, so their sets are complete
        let mut ancestors = vec![BTreeSet::new(); n];
        for &node in &order {
            let mut set = BTreeSet::new();
            for &parent in &parents[node] {
                set.insert(parent);
                set.extend(ancestors[parent].iter().copied());
            }
            ancestors[node] = set;
        }

        Ok(Self {
            parents,
            children,
            order,
            ancestors,
        })
    }

    pub fn len(&self) -> usize {
        self.parents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parents.is_empty()
    }

    /// Parents of `node`, in definition order.
    pub fn parents(&self, node: usize) -> &[usize] {
        &self.parents[node]
    }

    pub fn children(&self, node: usize) -> &[usize] {
        &self.children[node]
    }

    /// Every node with a path to `node`. Only these outputs are visible to
    /// its template.
    pub fn ancestors(&self, node: usize) -> &BTreeSet<usize> {
        &self.ancestors[node]
    }

    pub fn topological_order(&self) -> &[usize] {
        &self.order
    }

    /// Nodes without outgoing edges, in definition order.
    pub fn terminals(&self) -> Vec<usize> {
        (0..self.len())
            .filter(|&i| self.children[i].is_empty())
            .collect()
    }

    pub fn ready_queue(&self) -> ReadyQueue<'_> {
        ReadyQueue::new(self)
    }
}

/// Hands out batches of nodes whose parents have all completed.
#[derive(Debug)]
pub struct ReadyQueue<'g> {
    graph: &'g ChainGraph,
    pending_parents: Vec<usize>,
    ready: BTreeSet<usize>,
}

impl<'g> ReadyQueue<'g> {
    fn new(graph: &'g ChainGraph) -> Self {
        let pending_parents: Vec<usize> = graph.parents.iter().map(Vec::len).collect();
        let ready = (0..graph.len())
            .filter(|&i| pending_parents[i] == 0)
            .collect();
        Self {
            graph,
            pending_parents,
            ready,
        }
    }

    /// Up to `max` ready nodes, lowest definition index first.
    pub fn next_batch(&mut self, max: usize) -> Vec<usize> {
        let mut batch = Vec::with_capacity(max.min(self.ready.len()));
        while batch.len() < max.max(1) {
            match self.ready.pop_first() {
                Some(i) => batch.push(i),
                None => break,
            }
        }
        batch
    }

    /// Marks `node` as finished and releases children whose parents are all
    /// done.
    pub fn complete(&mut self, node: usize) {
        for &child in self.graph.children(node) {
            self.pending_parents[child] -= 1;
            if self.pending_parents[child] == 0 {
                self.ready.insert(child);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Node;

    fn diamond() -> Chain {
        Chain::new("diamond")
            .node(Node::agent("d", "agents/d"))
            .node(Node::agent("b", "agents/b"))
            .node(Node::agent("c", "agents/c"))
            .node(Node::agent("a", "agents/a"))
            .edge("a", "b")
            .edge("a", "c")
            .edge("b", "d")
            .edge("c", "d")
    }

    #[test]
    fn test_topological_order_is_stable() {
        let graph = ChainGraph::build(&diamond()).unwrap();
        // a=3, b=1, c=2, d=0
        assert_eq!(graph.topological_order(), &[3, 1, 2, 0]);
        assert_eq!(graph.parents(0), &[1, 2]);
        assert_eq!(graph.terminals(), vec![0]);
    }

    #[test]
    fn test_ancestors_are_transitive() {
        let chain = diamond().node(Node::transformer("loose"));
        let graph = ChainGraph::build(&chain).unwrap();
        assert_eq!(graph.ancestors(0).iter().copied().collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(graph.ancestors(1).iter().copied().collect::<Vec<_>>(), vec![3]);
        assert!(graph.ancestors(3).is_empty());
        assert!(graph.ancestors(4).is_empty());
    }

    #[test]
    fn test_ready_queue_batches() {
        let chain = diamond();
        let graph = ChainGraph::build(&chain).unwrap();
        let mut queue = graph.ready_queue();
        assert_eq!(queue.next_batch(5), vec![3]);
        queue.complete(3);
        assert_eq!(queue.next_batch(1), vec![1]);
        assert_eq!(queue.next_batch(5), vec![2]);
        queue.complete(1);
        assert!(queue.next_batch(5).is_empty());
        queue.complete(2);
        assert_eq!(queue.next_batch(5), vec![0]);
    }

    #[test]
    fn test_cycle_lists_remaining_nodes() {
        let chain = Chain::new("loop")
            .node(Node::agent("start", "s"))
            .node(Node::agent("x", "x"))
            .node(Node::agent("y", "y"))
            .edge("start", "x")
            .edge("x", "y")
            .edge("y", "x");
        match ChainGraph::build(&chain) {
            Err(OrchestratorError::GraphCycle { nodes }) => {
                assert_eq!(nodes, vec!["x".to_string(), "y".to_string()])
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_invalid_chains() {
        let unknown = Chain::new("c").node(Node::agent("a", "a")).edge("a", "ghost");
        assert!(matches!(
            ChainGraph::build(&unknown),
            Err(OrchestratorError::InvalidChain(_))
        ));

        let duplicate = Chain::new("c")
            .node(Node::agent("a", "a"))
            .node(Node::agent("a", "b"));
        assert!(matches!(
            ChainGraph::build(&duplicate),
            Err(OrchestratorError::InvalidChain(_))
        ));

        let missing_ref = Chain::new("c").node(Node::agent("a", " "));
        assert!(matches!(
            ChainGraph::build(&missing_ref),
            Err(OrchestratorError::InvalidChain(_))
        ));

        let reserved = Chain::new("c").node(Node::transformer("t").with_alias("root"));
        assert!(matches!(
            ChainGraph::build(&reserved),
            Err(OrchestratorError::InvalidChain(_))
        ));

        let self_loop = Chain::new("c").node(Node::transformer("t")).edge("t", "t");
        assert!(matches!(
            ChainGraph::build(&self_loop),
            Err(OrchestratorError::GraphCycle { .. })
        ));
    }
}
