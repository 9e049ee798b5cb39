#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use keel_apply::{ApplyEngine, ApplyError, EngineOptions};
use keel_core::store::OwnerSelector;
use keel_core::{ChangeAction, ClusterStore, Inventory, ResourceRef};
use keel_store::MemStore;
use serde_json::{json, Value as Json};

fn cm(name: &str, value: &str) -> Json {
    json!({ "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": name }, "data": { "v": value } })
}

fn cm_ref(name: &str) -> ResourceRef { ResourceRef::new("v1", "ConfigMap", Some("default"), name) }

fn opts() -> EngineOptions {
    EngineOptions { default_namespace: Some("default".into()), ..Default::default() }
}

fn setup() -> (Arc<MemStore>, ApplyEngine) {
    let store = Arc::new(MemStore::new());
    let engine = ApplyEngine::new(store.clone());
    (store, engine)
}

#[tokio::test]
async fn second_apply_of_unchanged_set_is_a_no_op() {
    let (_store, engine) = setup();
    let owner = OwnerSelector::new("ResourceGroup", "app", "default");
    let first = engine.apply(&owner, vec![cm("a", "1"), cm("b", "1")], &Inventory::new(), &opts()).await.unwrap();
    assert_eq!(first.change_set.count(ChangeAction::Created), 2);

    let second = engine.apply(&owner, vec![cm("a", "1"), cm("b", "1")], &first.inventory, &opts()).await.unwrap();
    assert!(second.change_set.changed().is_empty());
    assert!(!second.change_set.has_notable());
    assert_eq!(second.inventory, first.inventory);
}

#[tokio::test]
async fn objects_are_stamped_with_owner_labels() {
    let (store, engine) = setup();
    let owner = OwnerSelector::new("ResourceGroup", "app", "team");
    engine.apply(&owner, vec![cm("a", "1")], &Inventory::new(), &opts()).await.unwrap();
    let live = store.get(&cm_ref("a")).await.unwrap();
    assert_eq!(live["metadata"]["labels"]["keel.dev/kind"], "ResourceGroup");
    assert_eq!(live["metadata"]["labels"]["keel.dev/name"], "app");
    assert_eq!(live["metadata"]["labels"]["keel.dev/namespace"], "team");
}

#[tokio::test]
async fn removed_resources_are_garbage_collected() {
    let (store, engine) = setup();
    let owner = OwnerSelector::new("ResourceGroup", "app", "default");
    let first = engine.apply(&owner, vec![cm("a", "1"), cm("b", "1")], &Inventory::new(), &opts()).await.unwrap();
    let second = engine.apply(&owner, vec![cm("a", "1")], &first.inventory, &opts()).await.unwrap();

    assert_eq!(second.change_set.count(ChangeAction::Deleted), 1);
    assert!(!second.inventory.contains(&cm_ref("b")));
    assert!(!store.contains(&cm_ref("b")));
    assert!(store.contains(&cm_ref("a")));
}

#[tokio::test]
async fn owners_never_delete_each_others_objects() {
    let (store, engine) = setup();
    let a = OwnerSelector::new("ResourceGroup", "a", "default");
    let b = OwnerSelector::new("ResourceGroup", "b", "default");
    let inv_a = engine.apply(&a, vec![cm("a-1", "1")], &Inventory::new(), &opts()).await.unwrap().inventory;
    let inv_b = engine.apply(&b, vec![cm("b-1", "1")], &Inventory::new(), &opts()).await.unwrap().inventory;

    // A's recorded inventory wrongly claims B's object
    let mut polluted = inv_a.clone();
    polluted.add(cm_ref("b-1"));
    let (opts_a, opts_b) = (opts(), opts());
    let (ra, rb) = tokio::join!(
        engine.apply(&a, vec![], &polluted, &opts_a),
        engine.apply(&b, vec![cm("b-1", "1")], &inv_b, &opts_b),
    );
    let ra = ra.unwrap();
    rb.unwrap();
    assert_eq!(ra.change_set.count(ChangeAction::Deleted), 1);
    assert_eq!(ra.change_set.count(ChangeAction::Unmanaged), 1);
    assert!(store.contains(&cm_ref("b-1")));
    assert!(!store.contains(&cm_ref("a-1")));
}

#[tokio::test]
async fn invalid_input_fails_before_any_mutation() {
    let (store, engine) = setup();
    let owner = OwnerSelector::new("ResourceGroup", "app", "default");
    let err = engine.apply(&owner, vec![cm("a", "1"), cm("a", "2")], &Inventory::new(), &opts()).await.unwrap_err();
    assert!(err.is_validation());

    let err = engine
        .apply(&owner, vec![cm("ok", "1"), json!({ "kind": "ConfigMap", "metadata": { "name": "x" } })], &Inventory::new(), &opts())
        .await
        .unwrap_err();
    assert!(err.is_validation());
    assert_eq!(store.stats().mutations(), 0);
}

#[tokio::test]
async fn namespaces_and_crds_are_applied_first() {
    let (store, engine) = setup();
    let owner = OwnerSelector::new("ResourceGroup", "app", "default");
    let widget = json!({ "apiVersion": "example.com/v1", "kind": "Widget", "metadata": { "name": "w", "namespace": "apps" } });
    let crd = json!({
        "apiVersion": "apiextensions.k8s.io/v1",
        "kind": "CustomResourceDefinition",
        "metadata": { "name": "widgets.example.com" },
        "spec": { "group": "example.com", "scope": "Namespaced", "names": { "kind": "Widget", "plural": "widgets" } }
    });
    let mut config = cm("cfg", "1");
    config["metadata"]["namespace"] = json!("apps");
    let ns = json!({ "apiVersion": "v1", "kind": "Namespace", "metadata": { "name": "apps" } });

    let out = engine.apply(&owner, vec![widget, config, crd, ns], &Inventory::new(), &opts()).await.unwrap();
    assert_eq!(out.change_set.count(ChangeAction::Created), 4);
    let kinds: Vec<&str> = out.change_set.entries.iter().map(|e| e.object.kind.as_str()).collect();
    assert_eq!(kinds[..2], ["CustomResourceDefinition", "Namespace"]);
    assert!(store.contains(&ResourceRef::new("example.com/v1", "Widget", Some("apps"), "w")));
}

#[tokio::test]
async fn cluster_scoped_objects_lose_namespace() {
    let (_store, engine) = setup();
    let owner = OwnerSelector::new("ResourceGroup", "app", "default");
    let role = json!({ "apiVersion": "rbac.authorization.k8s.io/v1", "kind": "ClusterRole", "metadata": { "name": "r", "namespace": "x" } });
    let out = engine.apply(&owner, vec![role], &Inventory::new(), &opts()).await.unwrap();
    assert_eq!(out.inventory.list()[0].namespace, None);
}

#[tokio::test]
async fn skip_kinds_and_prune_markers_survive_gc() {
    let (store, engine) = setup();
    let owner = OwnerSelector::new("ResourceGroup", "app", "default");
    let ns = json!({ "apiVersion": "v1", "kind": "Namespace", "metadata": { "name": "apps" } });
    let mut keep = cm("keep", "1");
    keep["metadata"]["annotations"] = json!({ "keel.dev/prune": "disabled" });
    let o = EngineOptions { skip_kinds: vec!["Namespace".into()], ..opts() };

    let first = engine.apply(&owner, vec![ns, keep, cm("drop", "1")], &Inventory::new(), &o).await.unwrap();
    let second = engine.apply(&owner, vec![], &first.inventory, &o).await.unwrap();

    assert!(second.inventory.is_empty());
    assert!(store.contains(&ResourceRef::new("v1", "Namespace", None, "apps")));
    assert!(store.contains(&cm_ref("keep")));
    assert!(!store.contains(&cm_ref("drop")));
    assert_eq!(second.change_set.count(ChangeAction::Unmanaged), 1);
}

#[tokio::test]
async fn ignored_objects_stay_in_inventory() {
    let (store, engine) = setup();
    let owner = OwnerSelector::new("ResourceGroup", "app", "default");
    let mut ignored = cm("ignored", "1");
    ignored["metadata"]["annotations"] = json!({ "keel.dev/ssa": "Ignore" });
    let out = engine.apply(&owner, vec![ignored], &Inventory::new(), &opts()).await.unwrap();
    assert_eq!(out.change_set.entries[0].action, ChangeAction::Unmanaged);
    assert!(out.inventory.contains(&cm_ref("ignored")));
    assert!(!store.contains(&cm_ref("ignored")));
}

#[tokio::test]
async fn apply_failure_is_returned_as_is() {
    let (store, engine) = setup();
    let owner = OwnerSelector::new("ResourceGroup", "app", "default");
    store.fail_apply(&cm_ref("b"), "admission webhook denied the request");
    let err = engine.apply(&owner, vec![cm("a", "1"), cm("b", "1")], &Inventory::new(), &opts()).await.unwrap_err();
    assert!(matches!(err, ApplyError::Apply { .. }));
    assert!(err.to_string().contains("admission webhook denied"));
}

#[tokio::test(start_paused = true)]
async fn wait_ready_names_the_failing_object() {
    let (store, engine) = setup();
    let owner = OwnerSelector::new("ResourceGroup", "app", "default");
    let deploy = json!({ "apiVersion": "apps/v1", "kind": "Deployment", "metadata": { "name": "web" }, "spec": { "replicas": 1 } });
    let out = engine.apply(&owner, vec![deploy], &Inventory::new(), &opts()).await.unwrap();

    let err = engine.wait_ready(&out, Duration::from_secs(10)).await.unwrap_err();
    assert!(err.to_string().contains("Deployment/default/web"));

    let r = ResourceRef::new("apps/v1", "Deployment", Some("default"), "web");
    store
        .set_status(&r, json!({ "conditions": [ { "type": "Progressing", "status": "False", "reason": "ProgressDeadlineExceeded", "message": "rollout stuck" } ] }))
        .unwrap();
    let err = engine.wait_ready(&out, Duration::from_secs(10)).await.unwrap_err();
    assert!(err.to_string().contains("rollout stuck"));
}

#[tokio::test]
async fn delete_all_uninstalls_inventory() {
    let (store, engine) = setup();
    let owner = OwnerSelector::new("ResourceGroup", "app", "default");
    let out = engine.apply(&owner, vec![cm("a", "1"), cm("b", "1")], &Inventory::new(), &opts()).await.unwrap();
    let cs = engine.delete_all(&owner, &out.inventory, &opts()).await.unwrap();
    assert_eq!(cs.count(ChangeAction::Deleted), 2);
    assert!(!store.contains(&cm_ref("a")));
}
