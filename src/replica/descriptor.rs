//! Static, declared-at-config-time description of one read replica
//! (`spec.md` §4.10).

use std::collections::HashMap;

use crate::config::ConnectionDescriptor;

/// A replica as the caller declares it in configuration — before it has
/// any runtime health state, which lives in [`super::info::ReplicaInfo`]
/// instead.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicaDescriptor {
    pub id: String,
    pub connection: ConnectionDescriptor,
    /// Used by the weighted/smooth-weighted strategies; must be >= 1
    /// (`spec.md` §4.10: "weight defaults to 1 and is clamped to >= 1").
    pub weight: u32,
    pub max_connections: u32,
    pub region: Option<String>,
    pub tags: HashMap<String, String>,
}

impl ReplicaDescriptor {
    pub fn new(id: impl Into<String>, connection: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            connection: ConnectionDescriptor::new(connection),
            weight: 1,
            max_connections: 10,
            region: None,
            tags: HashMap::new(),
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight.max(1);
        self
    }

    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weight_is_clamped_to_at_least_one() {
        let d = ReplicaDescriptor::new("r1", "postgres://host/db").with_weight(0);
        assert_eq!(d.weight, 1);
    }
}
