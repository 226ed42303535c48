//! Wait-for graph used for deadlock detection.
//!
//! An edge `waiter -> holder` exists while `waiter` is blocked on a lock that
//! `holder` owns. Edges are reference counted: one transaction can wait on the
//! same holder through several lock requests, and retiring one of them must
//! not erase the others.

use parking_lot::Mutex;
use std::collections::HashMap;

use crate::transaction::TransactionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

#[derive(Debug, Default)]
struct Graph {
    /// waiter -> (holder -> multiplicity)
    edges: HashMap<TransactionId, HashMap<TransactionId, usize>>,
}

impl Graph {
    fn add(&mut self, waiter: TransactionId, holder: TransactionId) {
        *self
            .edges
            .entry(waiter)
            .or_default()
            .entry(holder)
            .or_insert(0) += 1;
    }

    fn remove(&mut self, waiter: TransactionId, holder: TransactionId) -> bool {
        let Some(holders) = self.edges.get_mut(&waiter) else {
            return false;
        };
        let Some(count) = holders.get_mut(&holder) else {
            return false;
        };
        *count -= 1;
        if *count == 0 {
            holders.remove(&holder);
            if holders.is_empty() {
                self.edges.remove(&waiter);
            }
        }
        true
    }

    /// Three-color DFS from `waiter` over the graph plus the virtual edge
    /// `waiter -> holder`. Reaching a gray node is a back edge.
    fn would_cycle(&self, waiter: TransactionId, holder: TransactionId) -> bool {
        if waiter == holder {
            return false;
        }
        let mut colors: HashMap<TransactionId, Color> = HashMap::new();
        self.visit(waiter, (waiter, holder), &mut colors)
    }

    fn visit(
        &self,
        node: TransactionId,
        extra: (TransactionId, TransactionId),
        colors: &mut HashMap<TransactionId, Color>,
    ) -> bool {
        colors.insert(node, Color::Gray);

        let existing = self
            .edges
            .get(&node)
            .into_iter()
            .flat_map(|holders| holders.keys().copied());
        let virtual_edge = (node == extra.0).then_some(extra.1);

        for next in existing.chain(virtual_edge) {
            if next == node {
                continue;
            }
            match colors.get(&next).copied().unwrap_or(Color::White) {
                Color::Gray => return true,
                Color::White => {
                    if self.visit(next, extra, colors) {
                        return true;
                    }
                }
                Color::Black => {}
            }
        }

        colors.insert(node, Color::Black);
        false
    }
}

#[derive(Debug, Default)]
pub struct WaitForGraph {
    inner: Mutex<Graph>,
}

impl WaitForGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_edge(&self, waiter: TransactionId, holder: TransactionId) {
        if waiter != holder {
            self.inner.lock().add(waiter, holder);
        }
    }

    /// Removes one occurrence of the edge. Returns false if it was absent.
    pub fn remove_edge(&self, waiter: TransactionId, holder: TransactionId) -> bool {
        self.inner.lock().remove(waiter, holder)
    }

    /// Answers whether adding `waiter -> holder` would close a cycle, without
    /// changing the graph.
    pub fn would_cycle(&self, waiter: TransactionId, holder: TransactionId) -> bool {
        self.inner.lock().would_cycle(waiter, holder)
    }

    /// Registers `waiter -> h` for every holder other than the waiter itself,
    /// checking each edge for a cycle first. All checks and insertions happen
    /// in one critical section. On a cycle every edge added by this call is
    /// rolled back and the offending holder is returned.
    pub fn wait_on(
        &self,
        waiter: TransactionId,
        holders: &[TransactionId],
    ) -> Result<(), TransactionId> {
        let mut graph = self.inner.lock();
        let mut added = Vec::with_capacity(holders.len());
        for &holder in holders.iter().filter(|&&h| h != waiter) {
            if graph.would_cycle(waiter, holder) {
                for &h in &added {
                    graph.remove(waiter, h);
                }
                return Err(holder);
            }
            graph.add(waiter, holder);
            added.push(holder);
        }
        Ok(())
    }

    /// Retires the edges a previous successful [`wait_on`](Self::wait_on)
    /// registered for the same holders.
    pub fn stop_waiting(&self, waiter: TransactionId, holders: &[TransactionId]) {
        let mut graph = self.inner.lock();
        for &holder in holders.iter().filter(|&&h| h != waiter) {
            graph.remove(waiter, holder);
        }
    }

    pub fn edge_count(&self) -> usize {
        self.inner.lock().edges.values().map(|h| h.values().sum::<usize>()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().edges.is_empty()
    }
}
