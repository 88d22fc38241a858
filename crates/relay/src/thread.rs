// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Parent/child reconstruction from flat records plus thread signals.
//!
//! Feeds describe threading redundantly: an item's permalink names its
//! parent, and a separate canonical listing names a parent's children.
//! Every signal is reduced to a `(child, parent, precedence)` claim. Each
//! named parent lists the child; the strongest claim per child sets its
//! `parent`.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Anything with a stable id.
pub trait Identified {
    fn id(&self) -> &str;
}

impl Identified for String {
    fn id(&self) -> &str {
        self
    }
}

/// One piece of threading evidence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ThreadSignal {
    /// An item's permalink points at its parent.
    Permalink { item_id: String, parent_id: String },
    /// A parent's canonical child listing.
    Canonical { parent_id: String, child_ids: Vec<String> },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipRecord {
    pub parent: Option<String>,
    pub children: BTreeSet<String>,
}

pub type RelationshipMap = BTreeMap<String, RelationshipRecord>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    Permalink,
    Canonical,
}

#[derive(Debug, Clone, Copy)]
struct Claim<'a> {
    precedence: Precedence,
    parent: &'a str,
}

impl Claim<'_> {
    /// Higher precedence wins; equal precedence picks the smaller parent id.
    fn outranks(&self, other: &Claim<'_>) -> bool {
        (self.precedence, std::cmp::Reverse(self.parent))
            > (other.precedence, std::cmp::Reverse(other.parent))
    }
}

fn claims(signal: &ThreadSignal) -> Vec<(&str, Claim<'_>)> {
    match signal {
        ThreadSignal::Permalink { item_id, parent_id } => {
            vec![(item_id.as_str(), Claim { precedence: Precedence::Permalink, parent: parent_id })]
        }
        ThreadSignal::Canonical { parent_id, child_ids } => child_ids
            .iter()
            .map(|child| {
                (child.as_str(), Claim { precedence: Precedence::Canonical, parent: parent_id })
            })
            .collect(),
    }
}

/// Build the relationship map for `records` under `signals`.
///
/// Every id seen in either input gets an entry. A parent keeps every child
/// any signal gives it, even when a stronger claim moves the child's own
/// `parent` elsewhere. The result does not depend on the order of records or
/// signals.
pub fn reconstruct<R: Identified>(records: &[R], signals: &[ThreadSignal]) -> RelationshipMap {
    let mut map = RelationshipMap::new();
    for record in records {
        map.entry(record.id().to_owned()).or_default();
    }

    let mut winners: BTreeMap<&str, Claim<'_>> = BTreeMap::new();
    for (child, claim) in signals.iter().flat_map(claims) {
        map.entry(child.to_owned()).or_default();
        map.entry(claim.parent.to_owned()).or_default();
        if child == claim.parent {
            tracing::debug!(id = child, "ignoring self-parent signal");
            continue;
        }
        if let Some(record) = map.get_mut(claim.parent) {
            record.children.insert(child.to_owned());
        }
        winners
            .entry(child)
            .and_modify(|current| {
                if claim.outranks(current) {
                    *current = claim;
                }
            })
            .or_insert(claim);
    }

    for (child, claim) in winners {
        if let Some(record) = map.get_mut(child) {
            record.parent = Some(claim.parent.to_owned());
        }
    }
    map
}

/// Ids without a parent, in id order.
pub fn roots(map: &RelationshipMap) -> Vec<&str> {
    map.iter().filter(|(_, r)| r.parent.is_none()).map(|(id, _)| id.as_str()).collect()
}

#[cfg(test)]
#[path = "thread_tests.rs"]
mod tests;
