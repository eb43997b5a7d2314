//! Best-effort node geolocation bookkeeping.

use starling_api::protocol::Location;
use starling_api::NodeId;
use std::collections::HashMap;
use std::sync::Arc;

/// Derives a location from a node's network address, e.g. through a
/// geo-ip database. Absent by default; lookups then simply yield nothing.
pub trait LocationResolver: 'static + Send + Sync + std::fmt::Debug {
    /// Resolve an address to a location, if possible.
    fn resolve(&self, address: &str) -> Option<Location>;
}

/// Trait-object [LocationResolver].
pub type DynLocationResolver = Arc<dyn LocationResolver>;

/// Tracks the last known location per node. Self-reported locations win;
/// for nodes that report none, the resolver fills in what the connection
/// address reveals.
#[derive(Debug, Default)]
pub struct LocationManager {
    locations: HashMap<NodeId, Location>,
    resolver: Option<DynLocationResolver>,
}

impl LocationManager {
    /// Construct a manager with an optional address resolver.
    pub fn new(resolver: Option<DynLocationResolver>) -> Self {
        Self {
            locations: HashMap::new(),
            resolver,
        }
    }

    /// Record what is known about a node's location.
    pub fn update_location(
        &mut self,
        node: &NodeId,
        reported: Option<Location>,
        address: Option<String>,
    ) {
        if let Some(location) = reported.filter(Location::is_valid) {
            self.locations.insert(node.clone(), location);
            return;
        }
        let already_known = self
            .locations
            .get(node)
            .is_some_and(Location::is_valid);
        if already_known {
            return;
        }
        if let (Some(resolver), Some(address)) = (&self.resolver, address) {
            if let Some(location) = resolver.resolve(&address) {
                self.locations.insert(node.clone(), location);
            }
        }
    }

    /// The last known location of a node.
    pub fn node_location(&self, node: &NodeId) -> Option<&Location> {
        self.locations.get(node)
    }

    /// Every known node location.
    pub fn all_node_locations(&self) -> &HashMap<NodeId, Location> {
        &self.locations
    }

    /// Forget a node that left.
    pub fn remove_node(&mut self, node: &NodeId) {
        self.locations.remove(node);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Debug)]
    struct CountryFromAddress;

    impl LocationResolver for CountryFromAddress {
        fn resolve(&self, address: &str) -> Option<Location> {
            address.starts_with("10.").then(|| Location {
                country: Some("XX".to_string()),
                ..Location::default()
            })
        }
    }

    fn reported() -> Location {
        Location {
            city: Some("Helsinki".to_string()),
            country: Some("FI".to_string()),
            ..Location::default()
        }
    }

    #[test]
    fn self_reported_location_wins() {
        let mut manager =
            LocationManager::new(Some(Arc::new(CountryFromAddress)));
        manager.update_location(
            &"node".into(),
            Some(reported()),
            Some("10.0.0.1".to_string()),
        );
        assert_eq!(
            Some("FI"),
            manager
                .node_location(&"node".into())
                .and_then(|l| l.country.as_deref())
        );
    }

    #[test]
    fn address_fallback_fills_missing_location() {
        let mut manager =
            LocationManager::new(Some(Arc::new(CountryFromAddress)));
        manager.update_location(
            &"node".into(),
            None,
            Some("10.1.2.3".to_string()),
        );
        assert_eq!(
            Some("XX"),
            manager
                .node_location(&"node".into())
                .and_then(|l| l.country.as_deref())
        );
    }

    #[test]
    fn fallback_does_not_overwrite_a_known_location() {
        let mut manager =
            LocationManager::new(Some(Arc::new(CountryFromAddress)));
        manager.update_location(&"node".into(), Some(reported()), None);
        manager.update_location(
            &"node".into(),
            None,
            Some("10.1.2.3".to_string()),
        );
        assert_eq!(
            Some("FI"),
            manager
                .node_location(&"node".into())
                .and_then(|l| l.country.as_deref())
        );
    }

    #[test]
    fn unresolvable_node_has_no_location() {
        let mut manager = LocationManager::new(None);
        manager.update_location(&"node".into(), None, Some("x".to_string()));
        assert!(manager.node_location(&"node".into()).is_none());
        manager.remove_node(&"node".into());
    }
}
