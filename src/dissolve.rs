//! Merges member boundaries (counties) into one geometry per group key.

use crate::boundary::Boundary;
use crate::errors::PipelineError;
use crate::normalize::{Field, NormalizedTable};
use crate::types::Level;
use geo::{BooleanOps, MultiPolygon};
use indexmap::IndexMap;
use rayon::prelude::*;
use std::collections::{BTreeMap, HashMap};
use tracing::warn;

/// Which group each member (county FIPS) belongs to.
#[derive(Debug, Clone, Default)]
pub struct GroupAssignment {
    members: IndexMap<String, String>,
    /// Members seen with a second, different group; the first one was kept.
    pub conflicts: usize,
}

impl GroupAssignment {
    /// First assignment of a member wins.
    pub fn from_pairs<I, M, G>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (M, G)>,
        M: Into<String>,
        G: Into<String>,
    {
        let mut assignment = Self::default();
        for (member, group) in pairs {
            assignment.assign(member.into(), group.into());
        }
        assignment
    }

    fn assign(&mut self, member: String, group: String) {
        match self.members.get(&member) {
            Some(existing) if *existing != group => self.conflicts += 1,
            Some(_) => {}
            None => {
                self.members.insert(member, group);
            }
        }
    }

    pub fn group_of(&self, member: &str) -> Option<&str> {
        self.members.get(member).map(String::as_str)
    }

    pub fn members(&self) -> impl Iterator<Item = &str> {
        self.members.keys().map(String::as_str)
    }

    /// Members of each group, in member-key order.
    pub fn members_of(&self, group: &str) -> Vec<&str> {
        let mut members: Vec<&str> = self
            .members
            .iter()
            .filter(|(_, g)| g.as_str() == group)
            .map(|(m, _)| m.as_str())
            .collect();
        members.sort_unstable();
        members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Builds the county-to-group map for `level` from rows usable at that level.
pub fn assign_counties(table: &NormalizedTable, level: Level) -> Result<GroupAssignment, PipelineError> {
    table.key_field(Level::County)?;
    table.key_field(level)?;

    let pairs = (0..table.len()).filter_map(|row| {
        let group = table.group_key(level, row)?;
        let county = table.key(Field::Fips, row)?;
        Some((county, group))
    });
    let assignment = GroupAssignment::from_pairs(pairs);

    if assignment.conflicts > 0 {
        warn!(%level, conflicts = assignment.conflicts, "counties assigned to more than one group; kept first");
    }
    Ok(assignment)
}

/// Unions the boundaries of each group's members. Members without a boundary
/// are left out; groups with no boundary at all are absent from the result.
/// The result does not depend on the order members were assigned in.
pub fn dissolve(
    base: &HashMap<String, Boundary>,
    assignment: &GroupAssignment,
) -> HashMap<String, MultiPolygon<f64>> {
    let mut groups: BTreeMap<&str, Vec<(&str, &MultiPolygon<f64>)>> = BTreeMap::new();
    for (member, group) in &assignment.members {
        if let Some(geometry) = base.get(member) {
            groups
                .entry(group.as_str())
                .or_default()
                .push((member.as_str(), geometry.as_ref()));
        }
    }

    groups
        .into_par_iter()
        .map(|(group, mut members)| {
            members.sort_by(|a, b| a.0.cmp(b.0));
            let parts: Vec<&MultiPolygon<f64>> = members.into_iter().map(|(_, g)| g).collect();
            (group.to_string(), union_all(&parts))
        })
        .collect()
}

/// Pairwise union in a balanced tree over a fixed order.
pub fn union_all(parts: &[&MultiPolygon<f64>]) -> MultiPolygon<f64> {
    match parts {
        [] => MultiPolygon::new(Vec::new()),
        [single] => (*single).clone(),
        _ => {
            let mut layer: Vec<MultiPolygon<f64>> = parts.iter().map(|p| (*p).clone()).collect();
            while layer.len() > 1 {
                layer = layer
                    .chunks(2)
                    .map(|pair| {
                        pair[1..]
                            .iter()
                            .fold(pair[0].clone(), |acc, next| acc.union(next))
                    })
                    .collect();
            }
            layer.pop().unwrap_or_else(|| MultiPolygon::new(Vec::new()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{polygon, Area};
    use std::sync::Arc;

    fn square(x: f64, y: f64) -> MultiPolygon<f64> {
        MultiPolygon::new(vec![polygon![
            (x: x, y: y),
            (x: x + 1.0, y: y),
            (x: x + 1.0, y: y + 1.0),
            (x: x, y: y + 1.0),
            (x: x, y: y),
        ]])
    }

    fn base() -> HashMap<String, Boundary> {
        [("A", square(0.0, 0.0)), ("B", square(1.0, 0.0)), ("C", square(5.0, 5.0))]
            .into_iter()
            .map(|(k, g)| (k.to_string(), Arc::new(g)))
            .collect()
    }

    #[test]
    fn dissolve_is_order_independent() {
        let forward = GroupAssignment::from_pairs([("A", "NYC"), ("B", "NYC"), ("C", "NYC")]);
        let reverse = GroupAssignment::from_pairs([("C", "NYC"), ("B", "NYC"), ("A", "NYC")]);
        let a = dissolve(&base(), &forward);
        let b = dissolve(&base(), &reverse);
        assert_eq!(a["NYC"], b["NYC"]);
    }

    #[test]
    fn non_contiguous_members_stay_multi_part() {
        let assignment = GroupAssignment::from_pairs([("A", "NYC"), ("B", "NYC"), ("C", "NYC")]);
        let dissolved = dissolve(&base(), &assignment);
        let nyc = &dissolved["NYC"];
        assert_eq!(nyc.0.len(), 2);
        assert!((nyc.unsigned_area() - 3.0).abs() < 1e-9);
    }

    #[test]
    fn unresolved_members_do_not_block_the_group() {
        let assignment = GroupAssignment::from_pairs([("A", "NYC"), ("Z", "NYC"), ("Y", "Elsewhere")]);
        let dissolved = dissolve(&base(), &assignment);
        assert_eq!(dissolved.len(), 1);
        assert_eq!(dissolved["NYC"], square(0.0, 0.0));
    }

    #[test]
    fn first_assignment_wins() {
        let assignment = GroupAssignment::from_pairs([("A", "NYC"), ("A", "LI"), ("A", "NYC")]);
        assert_eq!(assignment.group_of("A"), Some("NYC"));
        assert_eq!(assignment.conflicts, 1);
        assert_eq!(assignment.members_of("NYC"), vec!["A"]);
    }

    #[test]
    fn union_of_nothing_is_empty() {
        assert!(union_all(&[]).0.is_empty());
    }
}
