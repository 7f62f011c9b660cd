use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

/// Thread-safe cyclic iterator over a changing list.
///
/// Walks a snapshot of the list and takes a fresh snapshot each time it wraps
/// around, so items added or removed mid-cycle show up on the next cycle.
/// An empty snapshot yields `None` until items appear again.
pub struct ConcurrentCycler<T> {
    snapshot: Box<dyn Fn() -> Vec<T> + Send + Sync>,
    cursor: Mutex<Cursor<T>>,
}

struct Cursor<T> {
    items: Vec<T>,
    position: usize,
}

impl<T: Clone> ConcurrentCycler<T> {
    /// Create a cycler that reads its items from `snapshot`
    pub fn new(snapshot: impl Fn() -> Vec<T> + Send + Sync + 'static) -> Self {
        Self {
            snapshot: Box::new(snapshot),
            cursor: Mutex::new(Cursor {
                items: Vec::new(),
                position: 0,
            }),
        }
    }

    /// Get the next item, refreshing the snapshot at the end of a cycle
    pub fn next(&self) -> Option<T> {
        let mut cursor = self.cursor.lock();

        if cursor.position >= cursor.items.len() {
            cursor.items = (self.snapshot)();
            cursor.position = 0;
        }

        let item = cursor.items.get(cursor.position).cloned()?;
        cursor.position += 1;
        Some(item)
    }

    /// Drop the current cycle; the next call starts from a fresh snapshot
    pub fn restart(&self) {
        let mut cursor = self.cursor.lock();
        cursor.items.clear();
        cursor.position = 0;
    }
}

impl<T> fmt::Debug for ConcurrentCycler<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cursor = self.cursor.lock();
        f.debug_struct("ConcurrentCycler")
            .field("cycle_len", &cursor.items.len())
            .field("position", &cursor.position)
            .finish()
    }
}

/// Node selection policy.
///
/// `select_node` returning `None` means no node is available right now;
/// callers count that as a failed attempt rather than waiting for one.
pub trait LoadBalancingStrategy<N>: Send + Sync {
    /// Replace the working set
    fn initialise(&self, nodes: Vec<N>);

    /// Pick the node for the next operation
    fn select_node(&self) -> Option<N>;

    /// Add a node; no-op if already present
    fn add_node(&self, node: N);

    /// Remove a node; no-op if absent
    fn remove_node(&self, node: &N);
}

/// Round-robin load balancer for nodes
pub struct RoundRobinStrategy<N> {
    nodes: Arc<RwLock<Vec<N>>>,
    cycler: ConcurrentCycler<N>,
}

impl<N> RoundRobinStrategy<N>
where
    N: Clone + PartialEq + Send + Sync + 'static,
{
    /// Create an empty strategy
    pub fn new() -> Self {
        let nodes = Arc::new(RwLock::new(Vec::new()));
        let source = nodes.clone();
        Self {
            nodes,
            cycler: ConcurrentCycler::new(move || source.read().clone()),
        }
    }

    /// Create a strategy over a static node list
    pub fn with_nodes(nodes: Vec<N>) -> Self {
        let strategy = Self::new();
        strategy.initialise(nodes);
        strategy
    }

    /// Get the number of nodes
    pub fn node_count(&self) -> usize {
        self.nodes.read().len()
    }

    /// Get list of all nodes
    pub fn nodes(&self) -> Vec<N> {
        self.nodes.read().clone()
    }
}

impl<N> Default for RoundRobinStrategy<N>
where
    N: Clone + PartialEq + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<N> LoadBalancingStrategy<N> for RoundRobinStrategy<N>
where
    N: Clone + PartialEq + Send + Sync + 'static,
{
    fn initialise(&self, nodes: Vec<N>) {
        {
            let mut current = self.nodes.write();
            current.clear();
            for node in nodes {
                if !current.contains(&node) {
                    current.push(node);
                }
            }
        }
        self.cycler.restart();
    }

    fn select_node(&self) -> Option<N> {
        self.cycler.next()
    }

    fn add_node(&self, node: N) {
        let mut nodes = self.nodes.write();
        if !nodes.contains(&node) {
            nodes.push(node);
        }
    }

    fn remove_node(&self, node: &N) {
        self.nodes.write().retain(|n| n != node);
    }
}

impl<N: fmt::Debug> fmt::Debug for RoundRobinStrategy<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoundRobinStrategy")
            .field("nodes", &*self.nodes.read())
            .field("cycler", &self.cycler)
            .finish()
    }
}
