//! Ownership inventory: the set of objects a managed object currently owns.
//!
//! Only ever replaced wholesale after a successful apply and GC pass, so any two
//! inventories compared by [`Inventory::diff`] are complete snapshots.

use rustc_hash::FxHashSet;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::ResourceRef;

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Inventory {
    #[serde(default)]
    pub entries: Vec<ResourceRef>,
}

impl Inventory {
    pub fn new() -> Self { Self::default() }

    /// Build from a list, keeping the first occurrence of each identity.
    /// A later duplicate only refreshes the recorded version.
    pub fn from_refs<I: IntoIterator<Item = ResourceRef>>(refs: I) -> Self {
        let mut inv = Self::new();
        for r in refs {
            inv.add(r);
        }
        inv
    }

    pub fn add(&mut self, r: ResourceRef) {
        match self.entries.iter_mut().find(|e| e.same_object(&r)) {
            Some(existing) => existing.version = r.version,
            None => self.entries.push(r),
        }
    }

    pub fn contains(&self, r: &ResourceRef) -> bool {
        self.entries.iter().any(|e| e.same_object(r))
    }

    pub fn list(&self) -> &[ResourceRef] { &self.entries }
    pub fn len(&self) -> usize { self.entries.len() }
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    /// Objects in `old` that are absent from `new`, in `old` order.
    pub fn diff(old: &Inventory, new: &Inventory) -> Vec<ResourceRef> {
        let keep: FxHashSet<String> = new.entries.iter().map(|r| r.id()).collect();
        let mut seen: FxHashSet<String> = FxHashSet::default();
        old.entries
            .iter()
            .filter(|r| {
                let id = r.id();
                !keep.contains(&id) && seen.insert(id)
            })
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn cm(name: &str) -> ResourceRef { ResourceRef::new("v1", "ConfigMap", Some("ns"), name) }

    #[test]
    fn add_dedupes_by_identity_and_refreshes_version() {
        let mut inv = Inventory::new();
        inv.add(ResourceRef::new("autoscaling/v1", "HorizontalPodAutoscaler", Some("ns"), "h"));
        inv.add(cm("a"));
        inv.add(ResourceRef::new("autoscaling/v2", "HorizontalPodAutoscaler", Some("ns"), "h"));
        assert_eq!(inv.len(), 2);
        assert_eq!(inv.list()[0].version, "v2");
        assert_eq!(inv.list()[1].name, "a");
    }

    #[test]
    fn diff_is_order_stable_by_old() {
        let old = Inventory::from_refs(vec![cm("c"), cm("a"), cm("b"), cm("d")]);
        let new = Inventory::from_refs(vec![cm("a"), cm("x")]);
        let stale: Vec<String> = Inventory::diff(&old, &new).into_iter().map(|r| r.name).collect();
        assert_eq!(stale, vec!["c", "b", "d"]);
    }

    #[test]
    fn diff_of_identical_snapshots_is_empty() {
        let inv = Inventory::from_refs(vec![cm("a"), cm("b")]);
        assert!(Inventory::diff(&inv, &inv.clone()).is_empty());
        assert!(Inventory::diff(&Inventory::new(), &inv).is_empty());
    }

    #[test]
    fn diff_ignores_version_changes() {
        let old = Inventory::from_refs(vec![ResourceRef::new("batch/v1beta1", "CronJob", Some("ns"), "job")]);
        let new = Inventory::from_refs(vec![ResourceRef::new("batch/v1", "CronJob", Some("ns"), "job")]);
        assert!(Inventory::diff(&old, &new).is_empty());
    }

    #[test]
    fn serializes_as_entries_list() {
        let inv = Inventory::from_refs(vec![ResourceRef::new("v1", "Namespace", None, "apps")]);
        let v = serde_json::to_value(&inv).unwrap();
        assert_eq!(v, serde_json::json!({ "entries": [ { "group": "", "kind": "Namespace", "name": "apps", "version": "v1" } ] }));
    }

    proptest! {
        #[test]
        fn diff_is_set_difference(old in proptest::collection::vec(0u8..24, 0..32), new in proptest::collection::vec(0u8..24, 0..32)) {
            let old_inv = Inventory::from_refs(old.iter().map(|n| cm(&format!("o{n}"))));
            let new_inv = Inventory::from_refs(new.iter().map(|n| cm(&format!("o{n}"))));
            let stale = Inventory::diff(&old_inv, &new_inv);
            for r in &stale {
                prop_assert!(old_inv.contains(r));
                prop_assert!(!new_inv.contains(r));
            }
            for r in old_inv.list() {
                prop_assert_eq!(new_inv.contains(r), !stale.iter().any(|s| s.same_object(r)));
            }
        }
    }
}
