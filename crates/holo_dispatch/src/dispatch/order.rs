//! Remaining-replica ordering for one dispatch attempt.
//!
//! The candidate array is fixed for the life of a session; this module only
//! tracks which candidate indexes are still to be tried and in what order.
//! Invariants:
//! - every index in `remaining` is `< len`
//! - no index appears twice in `remaining`
//! - `remaining` only shrinks, except that a reinsertion is size-preserving

use std::collections::VecDeque;

/// How `promote` satisfied the request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Promotion {
    /// The index was still pending and now sits at the front.
    Moved,
    /// The index had already been tried; it was put back at the front and
    /// the least preferred pending index was dropped.
    Reinserted { evicted: usize },
}

#[derive(Clone, Debug)]
pub(crate) struct ReplicaOrder {
    len: usize,
    remaining: VecDeque<usize>,
}

impl ReplicaOrder {
    pub(crate) fn new(len: usize) -> Self {
        Self {
            len,
            remaining: (0..len).collect(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.remaining.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.remaining.len()
    }

    pub(crate) fn pop_front(&mut self) -> Option<usize> {
        self.remaining.pop_front()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.remaining.iter().copied()
    }

    /// Put `index` at the front of the remaining order.
    ///
    /// Returns `None` when there is no pending entry to trade for an already
    /// tried index (the order is empty) or the index is out of range.
    pub(crate) fn promote(&mut self, index: usize) -> Option<Promotion> {
        if index >= self.len {
            return None;
        }
        if let Some(pos) = self.remaining.iter().position(|i| *i == index) {
            if let Some(moved) = self.remaining.remove(pos) {
                self.remaining.push_front(moved);
            }
            return Some(Promotion::Moved);
        }
        let evicted = self.remaining.pop_back()?;
        self.remaining.push_front(index);
        Some(Promotion::Reinserted { evicted })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(order: &ReplicaOrder) -> Vec<usize> {
        order.iter().collect()
    }

    #[test]
    fn pops_in_construction_order() {
        let mut order = ReplicaOrder::new(3);
        assert_eq!(order.pop_front(), Some(0));
        assert_eq!(order.pop_front(), Some(1));
        assert_eq!(order.pop_front(), Some(2));
        assert_eq!(order.pop_front(), None);
        assert!(order.is_empty());
    }

    #[test]
    fn promote_pending_moves_to_front() {
        let mut order = ReplicaOrder::new(4);
        assert_eq!(order.promote(2), Some(Promotion::Moved));
        assert_eq!(drain(&order), vec![2, 0, 1, 3]);
        assert_eq!(order.promote(2), Some(Promotion::Moved));
        assert_eq!(drain(&order), vec![2, 0, 1, 3]);
    }

    #[test]
    fn promote_tried_evicts_tail() {
        let mut order = ReplicaOrder::new(4);
        order.pop_front();
        order.pop_front();
        assert_eq!(
            order.promote(0),
            Some(Promotion::Reinserted { evicted: 3 })
        );
        assert_eq!(drain(&order), vec![0, 2]);
        assert_eq!(order.len(), 2);
    }

    #[test]
    fn promote_refuses_when_nothing_to_trade() {
        let mut order = ReplicaOrder::new(1);
        order.pop_front();
        assert_eq!(order.promote(0), None);
        assert!(order.is_empty());
        assert_eq!(ReplicaOrder::new(2).promote(5), None);
    }

    #[test]
    fn repeated_promotions_never_duplicate() {
        let mut order = ReplicaOrder::new(5);
        order.pop_front();
        order.pop_front();
        for index in [0, 1, 4, 0, 3, 1] {
            order.promote(index);
            let mut seen = drain(&order);
            let before = seen.len();
            seen.sort_unstable();
            seen.dedup();
            assert_eq!(seen.len(), before);
            assert_eq!(order.len(), 3);
        }
    }
}
