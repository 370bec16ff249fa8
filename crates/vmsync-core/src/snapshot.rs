use crate::{Resource, ResourceId, ResourcePatch};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;

/// Ordered, id-keyed collection of resources as of one synchronization.
///
/// Entries are shared `Arc`s: a merge that finds a resource unchanged hands
/// out the previous allocation again, so consumers can skip work with
/// `Arc::ptr_eq` instead of comparing fields.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    resources: Vec<Arc<Resource>>,
    index: HashMap<ResourceId, usize>,
    last_synced_at: Option<DateTime<Utc>>,
    version: u64,
}

impl Snapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_resources(resources: Vec<Resource>, synced_at: DateTime<Utc>) -> Self {
        Self::empty().merged(resources, synced_at)
    }

    /// Builds the successor snapshot from a freshly fetched list.
    ///
    /// Resources whose tracked fields are unchanged keep their previous `Arc`.
    /// Resources missing from `next` are dropped. If `next` repeats an id the
    /// last record wins, at the position of the first one.
    pub fn merged(&self, next: Vec<Resource>, synced_at: DateTime<Utc>) -> Snapshot {
        let mut resources: Vec<Arc<Resource>> = Vec::with_capacity(next.len());
        let mut index = HashMap::with_capacity(next.len());

        for incoming in next {
            let shared = match self.get(incoming.id) {
                Some(previous) if previous.same_tracked_fields(&incoming) => Arc::clone(previous),
                _ => Arc::new(incoming),
            };

            match index.get(&shared.id) {
                Some(&position) => resources[position] = shared,
                None => {
                    index.insert(shared.id, resources.len());
                    resources.push(shared);
                }
            }
        }

        Snapshot {
            resources,
            index,
            last_synced_at: Some(synced_at),
            version: self.version + 1,
        }
    }

    /// Copy of this snapshot with `patch` applied to one resource, or `None`
    /// when the id is not present. Never adds or removes entries.
    pub fn patched(&self, id: ResourceId, patch: &ResourcePatch) -> Option<Snapshot> {
        let position = *self.index.get(&id)?;

        let mut updated = Resource::clone(&self.resources[position]);
        patch.apply_to(&mut updated);

        let mut resources = self.resources.clone();
        resources[position] = Arc::new(updated);

        Some(Snapshot {
            resources,
            index: self.index.clone(),
            last_synced_at: self.last_synced_at,
            version: self.version + 1,
        })
    }

    pub fn get(&self, id: ResourceId) -> Option<&Arc<Resource>> {
        self.index.get(&id).map(|&position| &self.resources[position])
    }

    pub fn contains(&self, id: ResourceId) -> bool {
        self.index.contains_key(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Resource>> {
        self.resources.iter()
    }

    pub fn ids(&self) -> Vec<ResourceId> {
        self.resources.iter().map(|r| r.id).collect()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn last_synced_at(&self) -> Option<DateTime<Utc>> {
        self.last_synced_at
    }

    /// Bumped by every merge or patch.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn is_stale(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        match self.last_synced_at {
            Some(synced_at) => now - synced_at > max_age,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ResourceStatus;

    fn vm(id: ResourceId, status: ResourceStatus) -> Resource {
        Resource::new(id, status).with_name(format!("vm-{id}"))
    }

    #[test]
    fn test_merge_reuses_unchanged_resource() {
        let first = Snapshot::from_resources(
            vec![vm(5, ResourceStatus::PoweredOn), vm(6, ResourceStatus::PoweredOff)],
            Utc::now(),
        );
        let second = first.merged(
            vec![vm(5, ResourceStatus::PoweredOn), vm(6, ResourceStatus::PoweredOn)],
            Utc::now(),
        );

        assert!(Arc::ptr_eq(first.get(5).unwrap(), second.get(5).unwrap()));
        assert!(!Arc::ptr_eq(first.get(6).unwrap(), second.get(6).unwrap()));
        assert_eq!(second.get(6).unwrap().status, ResourceStatus::PoweredOn);
    }

    #[test]
    fn test_merge_drops_absent_resource() {
        let first = Snapshot::from_resources(
            vec![vm(7, ResourceStatus::PoweredOn), vm(8, ResourceStatus::PoweredOn)],
            Utc::now(),
        );
        let second = first.merged(vec![vm(8, ResourceStatus::PoweredOn)], Utc::now());

        assert!(!second.contains(7));
        assert_eq!(second.ids(), vec![8]);
    }

    #[test]
    fn test_merge_follows_incoming_order() {
        let first = Snapshot::from_resources(
            vec![vm(1, ResourceStatus::PoweredOn), vm(2, ResourceStatus::PoweredOn)],
            Utc::now(),
        );
        let second = first.merged(
            vec![vm(3, ResourceStatus::PoweredOn), vm(2, ResourceStatus::PoweredOn), vm(1, ResourceStatus::PoweredOn)],
            Utc::now(),
        );
        assert_eq!(second.ids(), vec![3, 2, 1]);
    }

    #[test]
    fn test_merge_collapses_duplicate_ids() {
        let snapshot = Snapshot::from_resources(
            vec![
                vm(1, ResourceStatus::PoweredOn),
                vm(2, ResourceStatus::PoweredOn),
                vm(1, ResourceStatus::Suspended),
            ],
            Utc::now(),
        );

        assert_eq!(snapshot.ids(), vec![1, 2]);
        assert_eq!(snapshot.get(1).unwrap().status, ResourceStatus::Suspended);
    }

    #[test]
    fn test_patch_changes_only_target() {
        let snapshot = Snapshot::from_resources(
            vec![vm(1, ResourceStatus::PoweredOn), vm(2, ResourceStatus::PoweredOff)],
            Utc::now(),
        );
        let patched = snapshot
            .patched(1, &ResourcePatch::status(ResourceStatus::Restarting))
            .unwrap();

        assert_eq!(patched.get(1).unwrap().status, ResourceStatus::Restarting);
        assert_eq!(patched.get(1).unwrap().name, "vm-1");
        assert!(Arc::ptr_eq(snapshot.get(2).unwrap(), patched.get(2).unwrap()));
        assert_eq!(patched.last_synced_at(), snapshot.last_synced_at());
        assert_eq!(patched.version(), snapshot.version() + 1);
    }

    #[test]
    fn test_patch_absent_id_is_none() {
        let snapshot = Snapshot::from_resources(vec![vm(1, ResourceStatus::PoweredOn)], Utc::now());
        assert!(snapshot
            .patched(99, &ResourcePatch::status(ResourceStatus::PoweredOff))
            .is_none());
    }

    #[test]
    fn test_staleness() {
        let empty = Snapshot::empty();
        assert!(empty.is_stale(Utc::now(), Duration::seconds(30)));

        let synced_at = Utc::now();
        let snapshot = Snapshot::from_resources(vec![], synced_at);
        assert!(!snapshot.is_stale(synced_at + Duration::seconds(10), Duration::seconds(30)));
        assert!(snapshot.is_stale(synced_at + Duration::seconds(31), Duration::seconds(30)));
    }

    /// Merging a list whose tracked fields did not change must hand back the
    /// very same allocations, and nothing outside the list may survive.
    mod merge_properties {
        use super::*;
        use proptest::prelude::*;

        fn status_strategy() -> impl Strategy<Value = ResourceStatus> {
            prop_oneof![
                Just(ResourceStatus::PoweredOn),
                Just(ResourceStatus::PoweredOff),
                Just(ResourceStatus::Suspended),
                Just(ResourceStatus::Unknown),
            ]
        }

        fn resources_strategy() -> impl Strategy<Value = Vec<Resource>> {
            prop::collection::btree_map(0u64..200, (status_strategy(), 1u32..16), 0..40).prop_map(
                |entries| {
                    entries
                        .into_iter()
                        .map(|(id, (status, cpu))| {
                            let mut resource = Resource::new(id, status).with_name(format!("vm-{id}"));
                            resource.cpu = Some(cpu);
                            resource
                        })
                        .collect()
                },
            )
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(100))]

            #[test]
            fn property_unchanged_resources_keep_identity(resources in resources_strategy()) {
                let first = Snapshot::from_resources(resources.clone(), Utc::now());
                let second = first.merged(resources, Utc::now());

                prop_assert_eq!(first.len(), second.len());
                for resource in first.iter() {
                    let next = second.get(resource.id).unwrap();
                    prop_assert!(Arc::ptr_eq(resource, next));
                }
            }

            #[test]
            fn property_merge_contains_exactly_incoming_ids(
                before in resources_strategy(),
                after in resources_strategy(),
            ) {
                let first = Snapshot::from_resources(before, Utc::now());
                let expected: Vec<ResourceId> = after.iter().map(|r| r.id).collect();
                let second = first.merged(after, Utc::now());

                prop_assert_eq!(second.ids(), expected);
                for id in first.ids() {
                    if !second.ids().contains(&id) {
                        prop_assert!(second.get(id).is_none());
                    }
                }
            }
        }
    }
}
