//! Label remapping tables
//!
//! A segmentation produced under one labelling convention is translated to
//! another before it is handed to a reconstruction tool. The table is plain
//! configuration: pipelines receive it as a value and pass it to the
//! remapping step as a parameter.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Source label -> target label
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelMapping {
    mappings: BTreeMap<u16, u16>,
}

impl LabelMapping {
    pub fn new(mappings: impl IntoIterator<Item = (u16, u16)>) -> Self {
        Self {
            mappings: mappings.into_iter().collect(),
        }
    }

    /// FreeSurfer aseg labels -> M-CRIB-S labels
    pub fn fs2mcribs() -> Self {
        Self::new([
            (2, 51),
            (3, 21),
            (4, 49),
            (5, 0),
            (7, 17),
            (8, 17),
            (10, 43),
            (11, 41),
            (12, 47),
            (13, 47),
            (14, 0),
            (15, 0),
            (16, 19),
            (17, 1),
            (18, 3),
            (26, 41),
            (28, 45),
            (31, 49),
            (41, 52),
            (42, 20),
            (43, 50),
            (44, 0),
            (46, 18),
            (47, 18),
            (49, 42),
            (50, 40),
            (51, 46),
            (52, 46),
            (53, 2),
            (54, 4),
            (58, 40),
            (60, 44),
            (63, 50),
            (253, 48),
        ])
    }

    pub fn get(&self, label: u16) -> Option<u16> {
        self.mappings.get(&label).copied()
    }

    /// Label after remapping; unmapped labels are kept
    pub fn apply(&self, label: u16) -> u16 {
        self.get(label).unwrap_or(label)
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    /// `[from, to, from, to, ...]` in ascending source-label order
    pub fn to_param(&self) -> Value {
        Value::Array(
            self.mappings
                .iter()
                .flat_map(|(from, to)| [Value::from(*from), Value::from(*to)])
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fs2mcribs_table() {
        let table = LabelMapping::fs2mcribs();
        assert_eq!(table.len(), 34);
        assert_eq!(table.get(2), Some(51));
        assert_eq!(table.get(253), Some(48));
        // Several labels collapse onto background
        assert_eq!(table.apply(14), 0);
        // Unmapped labels are kept
        assert_eq!(table.apply(24), 24);
    }

    #[test]
    fn test_param_pairs() {
        let table = LabelMapping::new([(41, 52), (2, 51)]);
        assert_eq!(table.to_param(), serde_json::json!([2, 51, 41, 52]));
    }
}
