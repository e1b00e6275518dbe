use jvpstore::config::DEFAULT_METADATA_URI;
use jvpstore::hypervisor::DomainStateCode;
use jvpstore::{
    FilterRequest, InMemoryHypervisor, Instance, InstanceState, MetadataStore, ResourceClass,
    StoreConfig,
};
use std::sync::Arc;
use tempfile::{TempDir, tempdir};

async fn open() -> (TempDir, MetadataStore, InMemoryHypervisor) {
    let dir = tempdir().unwrap();
    let hv = InMemoryHypervisor::new();
    hv.fail_volume_listing(true).await;
    hv.add_domain("web", DomainStateCode::RUNNING, 2 * 1024 * 1024, 2)
        .await;
    hv.add_domain("batch", DomainStateCode::SHUTOFF, 1024 * 1024, 1)
        .await;
    let config = StoreConfig::new(dir.path()).without_refresh();
    let store = MetadataStore::new(config, Arc::new(hv.clone())).unwrap();
    store.initialize().await.unwrap();
    (dir, store, hv)
}

fn ids(instances: &[Instance]) -> Vec<&str> {
    instances.iter().map(|i| i.id.as_str()).collect()
}

#[tokio::test]
async fn test_unmanaged_domains_are_adopted() {
    let (_dir, store, _hv) = open().await;

    let instances = store.list_instances().await.unwrap();
    assert_eq!(ids(&instances), vec!["batch", "web"]);

    let web = store.get_instance("web").await.unwrap();
    assert!(web.is_adopted());
    assert_eq!(web.name, "web");
    assert_eq!(web.state, InstanceState::Running);
    assert_eq!(web.memory_mib, 2048);
    assert_eq!(web.vcpus, 2);
    assert!(web.image_id.is_none());
}

#[tokio::test]
async fn test_saving_a_fragment_replaces_the_adopted_entry() {
    let (_dir, store, hv) = open().await;

    let mut instance = Instance::new("i-1", "web");
    instance.name = "frontend".to_string();
    instance.image_id = Some("img-1".to_string());
    instance.state = InstanceState::Terminated;
    let saved = store.save_instance(instance).await.unwrap();
    // Runtime state always comes from the domain.
    assert_eq!(saved.state, InstanceState::Running);

    let xml = hv.raw_metadata("web", DEFAULT_METADATA_URI).await.unwrap();
    assert!(xml.contains("<id>i-1</id>"));
    let flags = hv.last_metadata_flags().await.unwrap();
    assert!(flags.live && flags.config);

    let instances = store.list_instances().await.unwrap();
    assert_eq!(ids(&instances), vec!["batch", "i-1"]);
    assert!(store.get_instance("web").await.unwrap_err().is_not_found());

    let by_image = store
        .describe_instances(&FilterRequest::new().filter("image-id", ["img-1"]))
        .await
        .unwrap();
    assert_eq!(ids(&by_image), vec!["i-1"]);
    assert_eq!(by_image[0].name, "frontend");
}

#[tokio::test]
async fn test_inactive_domain_gets_persistent_metadata_only() {
    let (_dir, store, hv) = open().await;
    store
        .save_instance(Instance::new("i-2", "batch"))
        .await
        .unwrap();
    let flags = hv.last_metadata_flags().await.unwrap();
    assert!(!flags.live);
    assert!(flags.config);
}

#[tokio::test]
async fn test_state_follows_the_live_domain() {
    let (_dir, store, hv) = open().await;
    store
        .save_instance(Instance::new("i-1", "web"))
        .await
        .unwrap();

    hv.set_state("web", DomainStateCode::SHUTOFF).await;
    let instance = store.get_instance("i-1").await.unwrap();
    assert_eq!(instance.state, InstanceState::Stopped);

    store.rebuild().await.unwrap();
    let stopped = store
        .describe_instances(&FilterRequest::new().filter("instance-state-name", ["stopped"]))
        .await
        .unwrap();
    assert_eq!(ids(&stopped), vec!["batch", "i-1"]);
}

#[tokio::test]
async fn test_delete_clears_metadata_and_keeps_domain() {
    let (_dir, store, hv) = open().await;
    store
        .save_instance(Instance::new("i-1", "web"))
        .await
        .unwrap();

    store.delete_instance("i-1").await.unwrap();
    assert!(hv.raw_metadata("web", DEFAULT_METADATA_URI).await.is_none());
    assert!(store.get_instance("i-1").await.unwrap_err().is_not_found());
    assert!(store.get_instance("web").await.unwrap().is_adopted());
}

#[tokio::test]
async fn test_corrupt_fragment_falls_back_to_adoption() {
    let (_dir, store, hv) = open().await;
    hv.set_raw_metadata("web", DEFAULT_METADATA_URI, "<instance><name>x")
        .await;

    store.rebuild().await.unwrap();
    let web = store.get_instance("web").await.unwrap();
    assert!(web.is_adopted());
}

#[tokio::test]
async fn test_unavailable_hypervisor_keeps_previous_index() {
    let (_dir, store, hv) = open().await;
    let before = store.stats().unwrap();
    assert_eq!(before.counts.get(&ResourceClass::Instance), Some(&2));

    hv.set_unavailable(true).await;
    let after = store.rebuild().await.unwrap();
    assert_eq!(after.counts.get(&ResourceClass::Instance), Some(&2));
    assert!(after.generation > before.generation);
}

#[tokio::test]
async fn test_adopted_domain_with_spaces_is_addressable() {
    let (_dir, store, hv) = open().await;
    hv.add_domain("Windows 10", DomainStateCode::RUNNING, 4 * 1024 * 1024, 4)
        .await;
    store.rebuild().await.unwrap();

    let instances = store.list_instances().await.unwrap();
    assert!(ids(&instances).contains(&"Windows 10"));

    let windows = store.get_instance("Windows 10").await.unwrap();
    assert!(windows.is_adopted());
    assert_eq!(windows.vcpus, 4);

    let by_id = store
        .describe_instances(&FilterRequest::new().with_ids(["Windows 10"]))
        .await
        .unwrap();
    assert_eq!(ids(&by_id), vec!["Windows 10"]);

    store.delete_instance("Windows 10").await.unwrap();
    assert!(store.get_instance("Windows 10").await.unwrap().is_adopted());
    assert!(store.get_instance("").await.is_err());
}
