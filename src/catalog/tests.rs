//! Pool catalog tests: registration, routing, caching, capability
//! enforcement and the admin surfaces.

use std::sync::Arc;

use serde_json::json;

use crate::backend::{
    Capability, ControlBackend, FlavorUpdate, MemoryConnector, MemoryControl, PoolUpdate,
};
use crate::config::EngineConfig;
use crate::core::error::StorageError;

use super::Catalog;

/// A second scheme whose driver does not guarantee strict ordering;
/// stands in for a heterogeneous storage technology.
const RELAXED_CAPABILITIES: &[Capability] = &[
    Capability::Claims,
    Capability::AtLeastOnceDelivery,
    Capability::HighThroughput,
];

fn catalog_with(connector: MemoryConnector, config: EngineConfig) -> (Arc<MemoryControl>, Catalog) {
    let control = Arc::new(MemoryControl::new());
    let catalog = Catalog::new(control.clone(), Arc::new(connector), config);
    (control, catalog)
}

fn catalog() -> (Arc<MemoryControl>, Catalog) {
    catalog_with(MemoryConnector::new(), EngineConfig::default())
}

async fn add_pool(catalog: &Catalog, name: &str, weight: u32, group: Option<&str>) {
    catalog
        .pools()
        .create(name, weight, &format!("mem://{name}"), group, json!({}))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_register_assigns_a_pool_once() {
    let (_, catalog) = catalog();
    add_pool(&catalog, "a", 1, None).await;
    add_pool(&catalog, "b", 1, None).await;

    catalog.register("q1", Some("p"), None).await.unwrap();
    let first = catalog.catalogue().get(Some("p"), "q1").await.unwrap();
    assert!(first.pool == "a" || first.pool == "b");

    // Registration is idempotent: the mapping never moves on re-register.
    for _ in 0..10 {
        catalog.register("q1", Some("p"), None).await.unwrap();
        let again = catalog.catalogue().get(Some("p"), "q1").await.unwrap();
        assert_eq!(again.pool, first.pool);
    }
}

#[tokio::test]
async fn test_register_with_flavor_selects_from_its_group() {
    let (_, catalog) = catalog();
    add_pool(&catalog, "plain", 100, None).await;
    add_pool(&catalog, "fast", 1, Some("ssd")).await;
    catalog
        .flavors()
        .create("gold", Some("p"), "ssd", vec![Capability::Fifo])
        .await
        .unwrap();

    catalog
        .register("q1", Some("p"), Some("gold"))
        .await
        .unwrap();
    let entry = catalog.catalogue().get(Some("p"), "q1").await.unwrap();
    assert_eq!(entry.pool, "fast");
}

#[tokio::test]
async fn test_register_failures() {
    let (_, catalog) = catalog();

    // No pools registered at all.
    let err = catalog.register("q1", Some("p"), None).await.unwrap_err();
    assert!(matches!(err, StorageError::NoPoolFound));

    // Unknown flavor.
    add_pool(&catalog, "a", 1, None).await;
    let err = catalog
        .register("q1", Some("p"), Some("missing"))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::FlavorDoesNotExist { .. }));
}

#[tokio::test]
async fn test_virtual_pool_serves_unmapped_queues() {
    let config = EngineConfig::from_toml_str(
        r#"
        [catalog]
        enable_virtual_pool = true
        default_pool_uri = "mem://default"
        "#,
    )
    .unwrap();
    let (_, catalog) = catalog_with(MemoryConnector::new(), config);

    // No pools exist; registration quietly leaves the queue unmapped.
    catalog.register("q1", Some("p"), None).await.unwrap();
    assert!(!catalog.catalogue().exists(Some("p"), "q1").await.unwrap());

    // Lookups still resolve to a usable driver on the default URI.
    let driver = catalog.lookup("q1", Some("p")).await.unwrap().unwrap();
    assert!(driver
        .queues
        .create("q1", Some("p"), json!({}))
        .await
        .unwrap());
}

#[tokio::test]
async fn test_lookup_cache_outlives_catalogue_delete_until_purged() {
    let (control, catalog) = catalog();
    add_pool(&catalog, "a", 1, None).await;
    catalog.register("q1", Some("p"), None).await.unwrap();

    assert_eq!(
        catalog.lookup_pool("q1", Some("p")).await.unwrap(),
        Some("a".to_string())
    );

    // Remove the entry behind the catalog's back: the cached mapping
    // keeps answering within its TTL. This is the documented staleness
    // window.
    control.catalogue_delete(Some("p"), "q1").await.unwrap();
    assert_eq!(
        catalog.lookup_pool("q1", Some("p")).await.unwrap(),
        Some("a".to_string())
    );

    // Deregister purges the cache entry along with the mapping.
    catalog.deregister("q1", Some("p")).await.unwrap();
    assert_eq!(catalog.lookup_pool("q1", Some("p")).await.unwrap(), None);
}

#[tokio::test]
async fn test_pool_joining_group_must_match_capabilities() {
    let connector = MemoryConnector::new().with_scheme("volatile", RELAXED_CAPABILITIES);
    let (_, catalog) = catalog_with(connector, EngineConfig::default());

    add_pool(&catalog, "a", 1, Some("g")).await;

    // A driver with a different capability set may not join the group.
    let err = catalog
        .pools()
        .create("b", 1, "volatile://b", Some("g"), json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::PoolCapabilitiesMismatch));

    // A like-for-like driver may.
    catalog
        .pools()
        .create("c", 1, "mem://c", Some("g"), json!({}))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_pool_update_cannot_change_capabilities() {
    let connector = MemoryConnector::new().with_scheme("volatile", RELAXED_CAPABILITIES);
    let (_, catalog) = catalog_with(connector, EngineConfig::default());
    add_pool(&catalog, "a", 1, None).await;

    let err = catalog
        .pools()
        .update(
            "a",
            PoolUpdate {
                uri: Some("volatile://a2".to_string()),
                ..PoolUpdate::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::PoolCapabilitiesMismatch));

    catalog
        .pools()
        .update(
            "a",
            PoolUpdate {
                uri: Some("mem://a2".to_string()),
                weight: Some(5),
                ..PoolUpdate::default()
            },
        )
        .await
        .unwrap();
    let pool = catalog.pools().get("a", true).await.unwrap();
    assert_eq!(pool.uri, "mem://a2");
    assert_eq!(pool.weight, 5);
}

#[tokio::test]
async fn test_sole_group_member_cannot_be_deleted_while_flavor_uses_it() {
    let (_, catalog) = catalog();
    add_pool(&catalog, "a", 1, Some("g")).await;
    catalog
        .flavors()
        .create("gold", Some("p"), "g", vec![])
        .await
        .unwrap();

    let err = catalog.pools().delete("a").await.unwrap_err();
    assert!(matches!(
        err,
        StorageError::PoolInUseByFlavor { ref pool, ref flavor } if pool == "a" && flavor == "gold"
    ));

    // With a second member in the group the deletion goes through.
    add_pool(&catalog, "b", 1, Some("g")).await;
    catalog.pools().delete("a").await.unwrap();
    assert!(!catalog.pools().exists("a").await.unwrap());
}

#[tokio::test]
async fn test_get_driver_memoizes_per_pool() {
    let (_, catalog) = catalog();
    add_pool(&catalog, "a", 1, None).await;

    let first = catalog.get_driver("a").await.unwrap();
    let second = catalog.get_driver("a").await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));

    let err = catalog.get_driver("ghost").await.unwrap_err();
    assert!(matches!(err, StorageError::PoolDoesNotExist { .. }));
}

#[tokio::test]
async fn test_pool_listing_hides_options_unless_detailed() {
    let (_, catalog) = catalog();
    catalog
        .pools()
        .create("a", 1, "mem://a", None, json!({"fifo": false}))
        .await
        .unwrap();

    let plain = catalog.pools().list(None, 10, false).await.unwrap();
    assert!(plain[0].options.is_null());

    let detailed = catalog.pools().list(None, 10, true).await.unwrap();
    assert_eq!(detailed[0].options, json!({"fifo": false}));
}

#[tokio::test]
async fn test_catalogue_admin_surface() {
    let (_, catalog) = catalog();
    let catalogue = catalog.catalogue();

    catalogue.insert(Some("p"), "q1", "a").await.unwrap();
    assert!(catalogue.exists(Some("p"), "q1").await.unwrap());
    assert_eq!(catalogue.get(Some("p"), "q1").await.unwrap().pool, "a");

    catalogue.update(Some("p"), "q1", "b").await.unwrap();
    assert_eq!(catalogue.get(Some("p"), "q1").await.unwrap().pool, "b");

    let err = catalogue.update(Some("p"), "ghost", "b").await.unwrap_err();
    assert!(matches!(err, StorageError::QueueNotMapped { .. }));

    catalogue.insert(Some("p"), "q2", "a").await.unwrap();
    let listed = catalogue.list(Some("p")).await.unwrap();
    assert_eq!(listed.len(), 2);
    // Listing is scoped to the project.
    assert!(catalogue.list(Some("other")).await.unwrap().is_empty());

    catalogue.delete(Some("p"), "q1").await.unwrap();
    assert!(!catalogue.exists(Some("p"), "q1").await.unwrap());

    catalogue.drop_all().await.unwrap();
    assert!(catalogue.list(Some("p")).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_flavor_admin_surface() {
    let (_, catalog) = catalog();
    let flavors = catalog.flavors();

    flavors
        .create("gold", Some("p"), "ssd", vec![Capability::Fifo, Capability::Claims])
        .await
        .unwrap();
    assert!(flavors.exists("gold", Some("p")).await.unwrap());

    let flavor = flavors.get("gold", Some("p")).await.unwrap();
    assert_eq!(flavor.pool_group, "ssd");
    assert_eq!(flavor.capabilities.len(), 2);

    flavors
        .update(
            "gold",
            Some("p"),
            FlavorUpdate {
                pool_group: Some("nvme".to_string()),
                capabilities: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(
        flavors.get("gold", Some("p")).await.unwrap().pool_group,
        "nvme"
    );

    let err = flavors
        .update("ghost", Some("p"), FlavorUpdate::default())
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::FlavorDoesNotExist { .. }));

    // Flavors are project-scoped.
    assert!(!flavors.exists("gold", Some("other")).await.unwrap());

    flavors.delete("gold", Some("p")).await.unwrap();
    assert!(!flavors.exists("gold", Some("p")).await.unwrap());
}
