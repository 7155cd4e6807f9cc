//! Placement strategies: which child a bucket tries next.
//!
//! Each bucket keeps one cursor per affinity name. Both strategies iterate
//! the bucket's child slots from the remembered cursor, skip holes left by
//! removed children, and give up after one full rotation so the caller can
//! detect "no eligible child".
//!
//! `Spread` advances the cursor after every suggestion, successful or not,
//! so consecutive placements land on different children. `Pack` only
//! advances when the previously suggested child is exhausted, so it keeps
//! filling the same child.

use serde::{Deserialize, Serialize};

use crate::node::NodeId;

/// Strategy flavor, configurable per bucket and affinity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlacementStrategy {
    /// Rotate across children on every placement.
    #[default]
    Spread,
    /// Fill the current child until it rejects, then move on.
    Pack,
}

/// A strategy cursor over a bucket's child slots.
#[derive(Debug, Clone)]
pub struct StrategyCursor {
    kind: PlacementStrategy,
    idx: usize,
}

impl StrategyCursor {
    #[must_use]
    pub fn new(kind: PlacementStrategy) -> Self {
        Self { kind, idx: 0 }
    }

    #[must_use]
    pub fn kind(&self) -> PlacementStrategy {
        self.kind
    }

    /// The child slot to try first, or `None` if every slot is a hole.
    pub fn suggested(&mut self, children: &[Option<NodeId>]) -> Option<usize> {
        if children.is_empty() {
            return None;
        }
        match self.kind {
            PlacementStrategy::Spread => {
                for _ in 0..children.len() {
                    let current = self.idx;
                    self.idx = (self.idx + 1) % children.len();
                    if children[current].is_some() {
                        return Some(current);
                    }
                }
                None
            }
            PlacementStrategy::Pack => {
                for _ in 0..children.len() {
                    if children[self.idx].is_some() {
                        return Some(self.idx);
                    }
                    self.idx = (self.idx + 1) % children.len();
                }
                None
            }
        }
    }

    /// The next child slot after the previous suggestion was rejected.
    pub fn next(&mut self, children: &[Option<NodeId>]) -> Option<usize> {
        if children.is_empty() {
            return None;
        }
        match self.kind {
            PlacementStrategy::Spread => self.suggested(children),
            PlacementStrategy::Pack => {
                self.idx = (self.idx + 1) % children.len();
                self.suggested(children)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slots(present: &[bool]) -> Vec<Option<NodeId>> {
        present
            .iter()
            .enumerate()
            .map(|(i, p)| p.then(|| NodeId::from_index(i)))
            .collect()
    }

    #[test]
    fn test_spread_rotates_on_every_suggestion() {
        let children = slots(&[true, true, true]);
        let mut cursor = StrategyCursor::new(PlacementStrategy::Spread);
        assert_eq!(cursor.suggested(&children), Some(0));
        assert_eq!(cursor.suggested(&children), Some(1));
        assert_eq!(cursor.suggested(&children), Some(2));
        assert_eq!(cursor.suggested(&children), Some(0));
    }

    #[test]
    fn test_pack_sticks_until_next() {
        let children = slots(&[true, true]);
        let mut cursor = StrategyCursor::new(PlacementStrategy::Pack);
        assert_eq!(cursor.suggested(&children), Some(0));
        assert_eq!(cursor.suggested(&children), Some(0));
        assert_eq!(cursor.next(&children), Some(1));
        assert_eq!(cursor.suggested(&children), Some(1));
    }

    #[test]
    fn test_holes_are_skipped() {
        let children = slots(&[false, true, false, true]);
        let mut spread = StrategyCursor::new(PlacementStrategy::Spread);
        assert_eq!(spread.suggested(&children), Some(1));
        assert_eq!(spread.suggested(&children), Some(3));
        assert_eq!(spread.suggested(&children), Some(1));

        let mut pack = StrategyCursor::new(PlacementStrategy::Pack);
        assert_eq!(pack.suggested(&children), Some(1));
        assert_eq!(pack.next(&children), Some(3));
    }

    #[test]
    fn test_all_holes_gives_up() {
        let children = slots(&[false, false]);
        let mut cursor = StrategyCursor::new(PlacementStrategy::Spread);
        assert_eq!(cursor.suggested(&children), None);
        let mut pack = StrategyCursor::new(PlacementStrategy::Pack);
        assert_eq!(pack.suggested(&children), None);
        assert_eq!(pack.next(&children), None);
    }

    #[test]
    fn test_empty_children() {
        let children: Vec<Option<NodeId>> = Vec::new();
        let mut cursor = StrategyCursor::new(PlacementStrategy::Spread);
        assert_eq!(cursor.suggested(&children), None);
        assert_eq!(cursor.next(&children), None);
    }
}
