// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Subscriber stream filters.
//!
//! A [`Filter`] narrows a subscriber's stream to a set of object types
//! and/or parent references. Both selectors are optional; empty means no
//! restriction. Selectors within one field are OR'd, the two fields are
//! AND'd. The same filter is applied in live-tail and replicate modes so
//! a resume across a mode switch sees a consistent stream.

use std::collections::HashSet;

use crate::operation::OperationData;

#[derive(Debug, Clone, Default)]
pub struct Filter {
    /// Object types to match (None = match all).
    types: Option<HashSet<String>>,
    /// `type/id` parent references to match (None = match all).
    parents: Option<HashSet<String>>,
}

impl Filter {
    /// An empty filter that matches everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from the selector lists of a subscribe request. Empty lists
    /// are treated as "no restriction".
    #[must_use]
    pub fn from_lists(types: Vec<String>, parents: Vec<String>) -> Self {
        let mut filter = Self::new();
        if !types.is_empty() {
            filter.types = Some(types.into_iter().collect());
        }
        if !parents.is_empty() {
            filter.parents = Some(parents.into_iter().collect());
        }
        filter
    }

    /// Restrict to the given object types.
    #[must_use]
    pub fn with_types(mut self, types: Vec<String>) -> Self {
        self.types = Some(types.into_iter().collect());
        self
    }

    /// Restrict to objects with any of the given `type/id` parents.
    #[must_use]
    pub fn with_parents(mut self, parents: Vec<String>) -> Self {
        self.parents = Some(parents.into_iter().collect());
        self
    }

    /// True when the filter matches everything.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.types.is_none() && self.parents.is_none()
    }

    /// Predicate applied to every candidate event. Hot path: HashSet
    /// lookups on fields already present in the payload.
    #[inline]
    #[must_use]
    pub fn matches(&self, data: &OperationData) -> bool {
        if let Some(ref types) = self.types {
            if !types.contains(&data.object_type) {
                return false;
            }
        }
        if let Some(ref parents) = self.parents {
            if !data.parents.iter().any(|p| parents.contains(p)) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(object_type: &str, parents: &[&str]) -> OperationData {
        OperationData {
            object_type: object_type.to_string(),
            object_id: "obj".to_string(),
            parents: parents.iter().map(|p| p.to_string()).collect(),
            timestamp: 0,
            ref_url: None,
        }
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        let filter = Filter::new();
        assert!(filter.is_empty());
        assert!(filter.matches(&data("video", &[])));
        assert!(filter.matches(&data("user", &["channel/c1"])));
    }

    #[test]
    fn test_type_filter() {
        let filter = Filter::new().with_types(vec!["video".into(), "user".into()]);
        assert!(filter.matches(&data("video", &[])));
        assert!(filter.matches(&data("user", &[])));
        assert!(!filter.matches(&data("playlist", &[])));
    }

    #[test]
    fn test_parent_filter_matches_any() {
        let filter = Filter::new().with_parents(vec!["user/u1".into()]);
        assert!(filter.matches(&data("video", &["user/u1", "channel/c1"])));
        assert!(!filter.matches(&data("video", &["user/u2"])));
        assert!(!filter.matches(&data("video", &[])));
    }

    #[test]
    fn test_type_and_parent_are_conjunctive() {
        let filter = Filter::new()
            .with_types(vec!["video".into()])
            .with_parents(vec!["user/u1".into()]);
        assert!(filter.matches(&data("video", &["user/u1"])));
        assert!(!filter.matches(&data("video", &["user/u2"])));
        assert!(!filter.matches(&data("playlist", &["user/u1"])));
    }

    #[test]
    fn test_from_lists_empty_means_unrestricted() {
        let filter = Filter::from_lists(vec![], vec![]);
        assert!(filter.is_empty());

        let filter = Filter::from_lists(vec!["video".into()], vec![]);
        assert!(!filter.is_empty());
        assert!(filter.matches(&data("video", &[])));
        assert!(!filter.matches(&data("user", &[])));
    }
}
