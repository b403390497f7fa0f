//! Directed graph and tree primitives used to derive service maps and to
//! validate stop hierarchies.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;

/// Node labels. Ordering is part of the contract: traversals and sorts use it
/// for deterministic output.
pub trait Label: Clone + Ord + Eq + Hash + Debug {}

impl<T: Clone + Ord + Eq + Hash + Debug> Label for T {}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("graph is not sortable: it contains a cycle")]
pub struct NotSortableError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TraversalOrder {
    Pre,
    Post,
}

#[derive(Debug, Clone)]
struct Node<T: Label> {
    incoming: BTreeSet<T>,
    outgoing: BTreeSet<T>,
}

impl<T: Label> Default for Node<T> {
    fn default() -> Self {
        Node {
            incoming: BTreeSet::new(),
            outgoing: BTreeSet::new(),
        }
    }
}

/// A directed graph. Cycles and multiple paths to the same node are allowed;
/// every operation terminates on any input.
#[derive(Debug, Default, Clone)]
pub struct Graph<T: Label> {
    nodes: BTreeMap<T, Node<T>>,
}

impl<T: Label> Graph<T> {
    pub fn new() -> Self {
        Graph {
            nodes: BTreeMap::new(),
        }
    }

    pub fn add_node(&mut self, label: T) {
        self.nodes.entry(label).or_default();
    }

    /// Adds an edge, creating either endpoint if needed. Self loops and
    /// duplicate edges are stored once.
    pub fn add_edge(&mut self, from: T, to: T) {
        self.nodes
            .entry(from.clone())
            .or_default()
            .outgoing
            .insert(to.clone());
        self.nodes.entry(to).or_default().incoming.insert(from);
    }

    pub fn contains(&self, label: &T) -> bool {
        self.nodes.contains_key(label)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn num_edges(&self) -> usize {
        self.nodes.values().map(|n| n.outgoing.len()).sum()
    }

    pub fn labels(&self) -> impl Iterator<Item = &T> {
        self.nodes.keys()
    }

    pub fn out_neighbors(&self, label: &T) -> impl DoubleEndedIterator<Item = &T> {
        self.nodes.get(label).into_iter().flat_map(|n| n.outgoing.iter())
    }

    pub fn in_neighbors(&self, label: &T) -> impl DoubleEndedIterator<Item = &T> {
        self.nodes.get(label).into_iter().flat_map(|n| n.incoming.iter())
    }

    /// Nodes with zero in-degree, in ascending label order.
    pub fn roots(&self) -> Vec<T> {
        self.nodes
            .iter()
            .filter(|(_, n)| n.incoming.is_empty())
            .map(|(l, _)| l.clone())
            .collect()
    }

    /// Iterative depth-first traversal from `root`. A node reachable along
    /// several paths is emitted once; on cyclic graphs the traversal
    /// terminates, with the order meaningful only relative to `root`.
    pub fn depth_first_traverse(&self, root: &T, order: TraversalOrder) -> Vec<T> {
        enum Step<T> {
            Enter(T),
            Exit(T),
        }

        let mut result = Vec::new();
        if !self.contains(root) {
            return result;
        }

        let mut seen: BTreeSet<T> = BTreeSet::new();
        let mut stack = vec![Step::Enter(root.clone())];
        while let Some(step) = stack.pop() {
            match step {
                Step::Enter(label) => {
                    if !seen.insert(label.clone()) {
                        continue;
                    }
                    if order == TraversalOrder::Pre {
                        result.push(label.clone());
                    }
                    stack.push(Step::Exit(label.clone()));
                    // Reversed so children are entered in ascending order.
                    for next in self.out_neighbors(&label).rev() {
                        if !seen.contains(next) {
                            stack.push(Step::Enter(next.clone()));
                        }
                    }
                }
                Step::Exit(label) => {
                    if order == TraversalOrder::Post {
                        result.push(label);
                    }
                }
            }
        }
        result
    }

    /// The subgraph induced on everything reachable from `root`.
    pub fn reachable_from(&self, root: &T) -> Graph<T> {
        let reachable: BTreeSet<T> = self
            .depth_first_traverse(root, TraversalOrder::Pre)
            .into_iter()
            .collect();
        let mut sub = Graph::new();
        for label in &reachable {
            sub.add_node(label.clone());
            for next in self.out_neighbors(label) {
                if reachable.contains(next) {
                    sub.add_edge(label.clone(), next.clone());
                }
            }
        }
        sub
    }

    /// Kahn's algorithm. Zero-in-degree nodes are pushed in descending label
    /// order so that pop order is ascending, making the result deterministic.
    /// Fails iff a cycle prevents a total order.
    pub fn sort_basic(&self) -> Result<Vec<T>, NotSortableError> {
        let mut in_degree: HashMap<&T, usize> = self
            .nodes
            .iter()
            .map(|(l, n)| (l, n.incoming.len()))
            .collect();

        let mut stack: Vec<&T> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.incoming.is_empty())
            .map(|(l, _)| l)
            .rev()
            .collect();

        let mut ordering = Vec::with_capacity(self.len());
        while let Some(label) = stack.pop() {
            ordering.push(label.clone());
            for next in self.out_neighbors(label).rev() {
                let degree = match in_degree.get_mut(next) {
                    Some(d) => d,
                    None => continue,
                };
                *degree -= 1;
                if *degree == 0 {
                    stack.push(next);
                }
            }
        }

        if ordering.len() < self.len() {
            return Err(NotSortableError);
        }
        Ok(ordering)
    }
}

/// A rooted tree with labelled nodes, usually obtained from a [`Graph`] whose
/// edges point from parent to child.
#[derive(Debug, Clone)]
pub struct Tree<T: Label> {
    root: T,
    children: BTreeMap<T, Vec<T>>,
    parent: BTreeMap<T, T>,
}

impl<T: Label> Tree<T> {
    /// Succeeds iff the graph has exactly one root, every node is reachable
    /// from it, and there are exactly `V - 1` edges.
    pub fn from_graph(graph: &Graph<T>) -> Option<Tree<T>> {
        let roots = graph.roots();
        if roots.len() != 1 {
            return None;
        }
        let root = roots.into_iter().next()?;
        if graph.num_edges() != graph.len() - 1 {
            return None;
        }
        let reachable = graph.depth_first_traverse(&root, TraversalOrder::Pre);
        if reachable.len() != graph.len() {
            return None;
        }

        let mut children: BTreeMap<T, Vec<T>> = BTreeMap::new();
        let mut parent: BTreeMap<T, T> = BTreeMap::new();
        for label in graph.labels() {
            let out: Vec<T> = graph.out_neighbors(label).cloned().collect();
            for child in &out {
                parent.insert(child.clone(), label.clone());
            }
            children.insert(label.clone(), out);
        }
        Some(Tree {
            root,
            children,
            parent,
        })
    }

    pub fn root(&self) -> &T {
        &self.root
    }

    pub fn parent(&self, label: &T) -> Option<&T> {
        self.parent.get(label)
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Pre-order with siblings at every level ordered by subtree size
    /// ascending, ties broken by label. Keeps small branches together when
    /// the tree is rendered.
    pub fn sort(&self) -> Vec<T> {
        let sizes = self.subtree_sizes();
        let mut result = Vec::with_capacity(self.len());
        let mut stack = vec![self.root.clone()];
        while let Some(label) = stack.pop() {
            result.push(label.clone());
            if let Some(children) = self.children.get(&label) {
                let mut ordered: Vec<&T> = children.iter().collect();
                ordered.sort_by_key(|c| (sizes.get(*c).copied().unwrap_or(1), (*c).clone()));
                // Reversed so the smallest subtree is popped first.
                for child in ordered.into_iter().rev() {
                    stack.push(child.clone());
                }
            }
        }
        result
    }

    fn subtree_sizes(&self) -> HashMap<T, usize> {
        let mut sizes = HashMap::new();
        // Post-order so children are counted before their parent.
        let mut stack = vec![(self.root.clone(), false)];
        while let Some((label, expanded)) = stack.pop() {
            if expanded {
                let total: usize = 1 + self
                    .children
                    .get(&label)
                    .into_iter()
                    .flatten()
                    .map(|c| sizes.get(c).copied().unwrap_or(0))
                    .sum::<usize>();
                sizes.insert(label, total);
            } else {
                stack.push((label.clone(), true));
                for child in self.children.get(&label).into_iter().flatten() {
                    stack.push((child.clone(), false));
                }
            }
        }
        sizes
    }
}
