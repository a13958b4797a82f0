//! Edit kinds and what they cost

use crate::error::QueueError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Catalogue of edits the executor understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Replace floor material
    Flooring,
    /// Repaint or retexture walls
    Walls,
    /// Virtual staging
    Furniture,
    /// Erase an object under a mask
    Remove,
    /// Produce a selection mask
    Masking,
    /// Exterior enhancement (sky, lawn, lighting)
    Exterior,
}

impl OperationKind {
    /// Every kind, in catalogue order
    pub const ALL: [Self; 6] = [
        Self::Flooring,
        Self::Walls,
        Self::Furniture,
        Self::Remove,
        Self::Masking,
        Self::Exterior,
    ];

    /// Wire name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flooring => "flooring",
            Self::Walls => "walls",
            Self::Furniture => "furniture",
            Self::Remove => "remove",
            Self::Masking => "masking",
            Self::Exterior => "exterior",
        }
    }

    /// Object removal cannot run without a mask
    #[inline]
    #[must_use]
    pub fn requires_mask(self) -> bool {
        matches!(self, Self::Remove)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| QueueError::UnknownOperationKind(s.to_string()))
    }
}

/// Credits charged per edit kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CostTable {
    costs: BTreeMap<OperationKind, u64>,
    /// Charged for kinds missing from `costs`
    default_cost: u64,
}

impl Default for CostTable {
    fn default() -> Self {
        Self::empty(1)
            .with_cost(OperationKind::Flooring, 1)
            .with_cost(OperationKind::Walls, 1)
            .with_cost(OperationKind::Furniture, 1)
            .with_cost(OperationKind::Remove, 2)
            .with_cost(OperationKind::Masking, 1)
            .with_cost(OperationKind::Exterior, 2)
    }
}

impl CostTable {
    /// Table with no entries; every kind costs `default_cost`
    #[must_use]
    pub fn empty(default_cost: u64) -> Self {
        Self {
            costs: BTreeMap::new(),
            default_cost,
        }
    }

    /// With an explicit cost for one kind
    #[inline]
    #[must_use]
    pub fn with_cost(mut self, kind: OperationKind, cost: u64) -> Self {
        self.costs.insert(kind, cost);
        self
    }

    /// Cost of one edit of `kind`
    #[must_use]
    pub fn cost_of(&self, kind: OperationKind) -> u64 {
        self.costs.get(&kind).copied().unwrap_or(self.default_cost)
    }

    /// Fallback cost
    #[inline]
    #[must_use]
    pub fn default_cost(&self) -> u64 {
        self.default_cost
    }

    /// Resolved cost of every kind, in catalogue order
    #[must_use]
    pub fn entries(&self) -> Vec<(OperationKind, u64)> {
        OperationKind::ALL
            .into_iter()
            .map(|kind| (kind, self.cost_of(kind)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_case_insensitively() {
        assert_eq!("Flooring".parse::<OperationKind>(), Ok(OperationKind::Flooring));
        assert_eq!(" remove ".parse::<OperationKind>(), Ok(OperationKind::Remove));
        assert_eq!(
            "repaint".parse::<OperationKind>(),
            Err(QueueError::UnknownOperationKind("repaint".into()))
        );
    }

    #[test]
    fn display_round_trips_through_from_str() {
        for kind in OperationKind::ALL {
            assert_eq!(kind.to_string().parse::<OperationKind>(), Ok(kind));
        }
    }

    #[test]
    fn standard_costs() {
        let table = CostTable::default();
        assert_eq!(table.cost_of(OperationKind::Flooring), 1);
        assert_eq!(table.cost_of(OperationKind::Remove), 2);
        assert_eq!(table.cost_of(OperationKind::Exterior), 2);
        assert_eq!(table.entries().len(), 6);
    }

    #[test]
    fn missing_kind_uses_default_cost() {
        let table = CostTable::empty(3).with_cost(OperationKind::Walls, 5);
        assert_eq!(table.cost_of(OperationKind::Walls), 5);
        assert_eq!(table.cost_of(OperationKind::Masking), 3);
    }

    #[test]
    fn only_remove_requires_mask() {
        let needing: Vec<_> = OperationKind::ALL
            .into_iter()
            .filter(|k| k.requires_mask())
            .collect();
        assert_eq!(needing, vec![OperationKind::Remove]);
    }
}
