//! The shaper tree: an arena of buckets addressed by [`NodeId`].

use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[cfg(feature = "tracing")]
use tracing::debug;

/// Opaque handle to a bucket inside a [`TokenShaper`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) usize);

/// Errors returned by [`TokenShaper::create_child`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TokenShaperError {
    /// The requested rate exceeds what the parent has left to guarantee.
    #[error("rate limit overflow")]
    RateOverflow,
    /// The requested ceiling lies below the rate or above the parent's ceiling.
    #[error("ceil limit overflow")]
    CeilOverflow,
    /// A bucket with that name already exists.
    #[error("name conflict")]
    NameConflict,
    /// The bucket definition itself is invalid (e.g. an empty name).
    #[error("invalid child node")]
    InvalidChild,
}

struct Queued<T> {
    item: T,
    ctime: Instant,
}

struct Node<T> {
    name: String,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    /// Guaranteed share, as a fraction of the parent's rate.
    rate_frac: f64,
    /// Hard ceiling, as a fraction of the parent's ceiling.
    ceil_frac: f64,
    /// Absolute guaranteed tokens; recomputed on resize.
    rate: usize,
    /// Absolute ceiling; recomputed on resize.
    ceil: usize,
    /// Unallocated tokens. Goes negative after a shrink below the committed
    /// amount, in which case grants are refused until drains occur.
    available: i64,
    queue: VecDeque<Queued<T>>,
    /// Rotating sibling cursor for dequeue fairness.
    cursor: usize,
}

/// A hierarchical token shaper over items of type `T`.
///
/// The root's rate and ceiling equal the total capacity; both are adjusted
/// through [`resize`](TokenShaper::resize) as capacity comes and goes.
pub struct TokenShaper<T> {
    nodes: Vec<Node<T>>,
}

const ROOT: NodeId = NodeId(0);

impl<T> TokenShaper<T> {
    /// Creates a shaper whose root holds `capacity` tokens.
    pub fn new(capacity: usize) -> Self {
        let root = Node {
            name: "root".to_string(),
            parent: None,
            children: Vec::new(),
            rate_frac: 1.0,
            ceil_frac: 1.0,
            rate: capacity,
            ceil: capacity,
            available: capacity as i64,
            queue: VecDeque::new(),
            cursor: 0,
        };
        Self { nodes: vec![root] }
    }

    pub fn root(&self) -> NodeId {
        ROOT
    }

    /// The root's ceiling, i.e. the total token budget.
    pub fn capacity(&self) -> usize {
        self.nodes[ROOT.0].ceil
    }

    /// Creates a bucket directly under the root.
    pub fn create_node(
        &mut self,
        name: &str,
        rate: f64,
        ceil: f64,
    ) -> Result<NodeId, TokenShaperError> {
        self.create_child(ROOT, name, rate, ceil)
    }

    /// Creates a bucket under `parent`.
    ///
    /// `rate` is the guaranteed share as a fraction of the parent's rate,
    /// `ceil` the ceiling as a fraction of the parent's ceiling; both lie in
    /// `[0, 1]`. A zero `ceil` defaults to `rate`.
    pub fn create_child(
        &mut self,
        parent: NodeId,
        name: &str,
        rate: f64,
        ceil: f64,
    ) -> Result<NodeId, TokenShaperError> {
        let ceil = if ceil == 0.0 { rate } else { ceil };

        if name.is_empty() {
            return Err(TokenShaperError::InvalidChild);
        }
        if self.find_node(name).is_some() || name == self.nodes[ROOT.0].name {
            return Err(TokenShaperError::NameConflict);
        }
        if !(0.0..=1.0).contains(&rate) {
            return Err(TokenShaperError::RateOverflow);
        }
        if !(0.0..=1.0).contains(&ceil) || ceil < rate {
            return Err(TokenShaperError::CeilOverflow);
        }

        let committed: f64 = self.nodes[parent.0]
            .children
            .iter()
            .map(|c| self.nodes[c.0].rate_frac)
            .sum();
        if committed + rate > 1.0 + 1e-9 {
            return Err(TokenShaperError::RateOverflow);
        }

        let abs_rate = fraction_of(rate, self.nodes[parent.0].rate);
        let abs_ceil = fraction_of(ceil, self.nodes[parent.0].ceil);

        // the guaranteed share is reserved from the parent up front; a
        // drained parent yields a zero reservation until the next resize
        let reserved = self.get_some(parent, abs_rate);

        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            name: name.to_string(),
            parent: Some(parent),
            children: Vec::new(),
            rate_frac: rate,
            ceil_frac: ceil,
            rate: reserved,
            ceil: abs_ceil,
            available: abs_ceil as i64,
            queue: VecDeque::new(),
            cursor: 0,
        });
        self.nodes[parent.0].children.push(id);

        #[cfg(feature = "tracing")]
        debug!(bucket = name, rate = abs_rate, ceil = abs_ceil, "bucket created");

        Ok(id)
    }

    /// Finds a bucket by name, depth-first below the root.
    pub fn find_node(&self, name: &str) -> Option<NodeId> {
        self.find_below(ROOT, name)
    }

    fn find_below(&self, id: NodeId, name: &str) -> Option<NodeId> {
        for &child in &self.nodes[id.0].children {
            if self.nodes[child.0].name == name {
                return Some(child);
            }
            if let Some(found) = self.find_below(child, name) {
                return Some(found);
            }
        }
        None
    }

    pub fn name(&self, id: NodeId) -> &str {
        &self.nodes[id.0].name
    }

    pub fn rate(&self, id: NodeId) -> usize {
        self.nodes[id.0].rate
    }

    pub fn ceil(&self, id: NodeId) -> usize {
        self.nodes[id.0].ceil
    }

    pub fn rate_fraction(&self, id: NodeId) -> f64 {
        self.nodes[id.0].rate_frac
    }

    pub fn ceil_fraction(&self, id: NodeId) -> f64 {
        self.nodes[id.0].ceil_frac
    }

    pub fn available(&self, id: NodeId) -> i64 {
        self.nodes[id.0].available
    }

    /// Tokens currently committed through this bucket.
    pub fn actual_rate(&self, id: NodeId) -> usize {
        let node = &self.nodes[id.0];
        (node.ceil as i64 - node.available).max(0) as usize
    }

    /// Portion of the committed tokens borrowed beyond the guaranteed rate.
    pub fn over_rate(&self, id: NodeId) -> usize {
        self.actual_rate(id).saturating_sub(self.nodes[id.0].rate)
    }

    /// Buckets directly under the root.
    pub fn top_buckets(&self) -> Vec<NodeId> {
        self.nodes[ROOT.0].children.clone()
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id.0].children
    }

    /// Attempts to reserve `n` tokens through this bucket, borrowing from
    /// the parent chain up to the ceiling. All-or-nothing: either the full
    /// reservation is granted or nothing changes.
    pub fn get(&mut self, id: NodeId, n: usize) -> bool {
        n == 0 || self.get_some(id, n) == n
    }

    fn get_some(&mut self, id: NodeId, n: usize) -> usize {
        let node = &self.nodes[id.0];
        let actual = node.ceil as i64 - node.available;

        // never exceed this bucket's ceiling
        if actual + n as i64 > node.ceil as i64 {
            return 0;
        }

        // the portion covered by the guaranteed (pre-reserved) rate; the
        // remainder must be borrowed from the parent chain
        let within = (node.rate as i64 - actual).clamp(0, n as i64) as usize;
        let borrow = n - within;

        if borrow > 0 {
            match node.parent {
                Some(parent) => {
                    if self.get_some(parent, borrow) != borrow {
                        return 0;
                    }
                }
                None => return 0,
            }
        }

        self.nodes[id.0].available -= n as i64;
        n
    }

    /// Returns `n` tokens to this bucket. The borrowed portion flows back up
    /// to the parent chain; the guaranteed portion stays reserved here.
    pub fn put(&mut self, id: NodeId, n: usize) {
        if n == 0 {
            return;
        }

        let red = self.over_rate(id).min(n);
        if red > 0 {
            if let Some(parent) = self.nodes[id.0].parent {
                self.put(parent, red);
            }
        }

        self.nodes[id.0].available += n as i64;
    }

    /// Appends a waiter to this bucket's FIFO.
    pub fn enqueue(&mut self, id: NodeId, item: T, now: Instant) {
        self.nodes[id.0].queue.push_back(Queued { item, ctime: now });

        #[cfg(feature = "metrics")]
        metrics::gauge!("director_shaper_queued", "bucket" => self.nodes[id.0].name.clone())
            .set(self.nodes[id.0].queue.len() as f64);
    }

    /// Number of waiters queued at this bucket.
    pub fn queued(&self, id: NodeId) -> usize {
        self.nodes[id.0].queue.len()
    }

    /// Number of waiters queued across the whole tree.
    pub fn queued_total(&self) -> usize {
        self.nodes.iter().map(|n| n.queue.len()).sum()
    }

    /// Pops the next waiter that can be granted a token, visiting siblings
    /// round-robin across successive calls. The granted token is already
    /// reserved against the waiter's bucket when this returns.
    pub fn dequeue(&mut self) -> Option<(NodeId, T)> {
        self.dequeue_at(ROOT)
    }

    fn dequeue_at(&mut self, id: NodeId) -> Option<(NodeId, T)> {
        let child_count = self.nodes[id.0].children.len();
        if child_count > 0 {
            let start = self.nodes[id.0].cursor % child_count;
            for i in 0..child_count {
                let idx = (start + i) % child_count;
                let child = self.nodes[id.0].children[idx];
                if let Some(found) = self.dequeue_at(child) {
                    self.nodes[id.0].cursor = (idx + 1) % child_count;
                    return Some(found);
                }
            }
        }

        if !self.nodes[id.0].queue.is_empty() && self.get(id, 1) {
            if let Some(entry) = self.nodes[id.0].queue.pop_front() {
                return Some((id, entry.item));
            }
            // queue raced empty; hand the token back
            self.put(id, 1);
        }

        None
    }

    /// Removes and returns every waiter that has been queued for `timeout`
    /// or longer.
    pub fn expire_queued(&mut self, timeout: Duration, now: Instant) -> Vec<T> {
        let mut expired = Vec::new();
        for node in &mut self.nodes {
            while let Some(front) = node.queue.front() {
                if now.duration_since(front.ctime) < timeout {
                    break;
                }
                if let Some(entry) = node.queue.pop_front() {
                    expired.push(entry.item);
                }
            }
        }
        expired
    }

    /// Sets the root's rate and ceiling to `new_capacity` and recomputes
    /// every bucket's absolute budget from its configured fractions.
    ///
    /// Shrinking below the currently committed tokens leaves buckets with
    /// negative `available`; further grants are refused until enough tokens
    /// drain back.
    pub fn resize(&mut self, new_capacity: usize) {
        let old_ceil = self.nodes[ROOT.0].ceil;
        self.nodes[ROOT.0].rate = new_capacity;
        self.nodes[ROOT.0].ceil = new_capacity;
        self.nodes[ROOT.0].available += new_capacity as i64 - old_ceil as i64;

        #[cfg(feature = "tracing")]
        debug!(from = old_ceil, to = new_capacity, "shaper resized");

        let children = self.nodes[ROOT.0].children.clone();
        for child in children {
            self.resize_below(child);
        }
    }

    fn resize_below(&mut self, id: NodeId) {
        let parent = match self.nodes[id.0].parent {
            Some(p) => p,
            None => return,
        };
        let new_rate = fraction_of(self.nodes[id.0].rate_frac, self.nodes[parent.0].rate);
        let new_ceil = fraction_of(self.nodes[id.0].ceil_frac, self.nodes[parent.0].ceil);
        let old_rate = self.nodes[id.0].rate;
        let old_ceil = self.nodes[id.0].ceil;

        // move the reservation delta at the parent, then stretch (or shrink)
        // this bucket's own headroom
        self.nodes[parent.0].available -= new_rate as i64 - old_rate as i64;
        self.nodes[id.0].rate = new_rate;
        self.nodes[id.0].ceil = new_ceil;
        self.nodes[id.0].available += new_ceil as i64 - old_ceil as i64;

        let children = self.nodes[id.0].children.clone();
        for child in children {
            self.resize_below(child);
        }
    }
}

fn fraction_of(frac: f64, base: usize) -> usize {
    (frac * base as f64).round() as usize
}
