use std::sync::Arc;

use anyhow::Result;

use manifest_mirror::run::Mirror;
use manifest_mirror::state::StateFiles;

use super::infra::{
    AcceptingSession, Catalog, PayloadTransport, configure_git_identity, temp_dir, test_config,
    write_credentials,
};

#[tokio::test]
async fn first_run_mirrors_every_listed_version() -> Result<()> {
    let root = temp_dir("mm-it-first");
    let config = test_config(&root);
    write_credentials(&config.state_dir(), &[("alice", "s3cret")]).await?;

    let catalog = Catalog::new();
    catalog.entitle("alice", &[100]);
    catalog.set_owner(100, "game", &[(1, "v1"), (2, "v2")]);
    let transport = PayloadTransport::new();

    let mirror = Mirror::open(config.clone()).await?;
    configure_git_identity(&root);
    let summary = mirror
        .run(Arc::new(AcceptingSession), catalog.clone(), transport.clone())
        .await?;

    assert_eq!(summary.passes, 1);
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.jobs_succeeded, 2);
    assert_eq!(summary.jobs_failed, 0);

    // Both versions are tagged and recorded.
    assert!(mirror.store().exists(1, "v1").await?);
    assert!(mirror.store().exists(2, "v2").await?);
    let blob_dir = root.join("owners/100");
    assert!(blob_dir.join("1_v1.manifest").exists());
    assert!(blob_dir.join("2_v2.manifest").exists());
    assert!(blob_dir.join("keys.json").exists());

    // Persisted state survives a reload.
    let files = StateFiles::new(config.state_dir());
    let accounts = files.load_account_state().await?;
    assert!(accounts["alice"].owners.contains(&100));
    assert!(accounts["alice"].last_update > 0);
    let versions = files.load_versions().await?;
    assert_eq!(versions.get(&1).map(String::as_str), Some("v1"));
    assert_eq!(versions.get(&2).map(String::as_str), Some("v2"));

    std::fs::remove_dir_all(&root).ok();
    Ok(())
}

#[tokio::test]
async fn second_run_fetches_nothing_new() -> Result<()> {
    let root = temp_dir("mm-it-rerun");
    let config = test_config(&root);
    write_credentials(&config.state_dir(), &[("alice", "s3cret")]).await?;

    let catalog = Catalog::new();
    catalog.entitle("alice", &[100]);
    catalog.set_owner(100, "game", &[(1, "v1")]);
    let transport = PayloadTransport::new();

    let mirror = Mirror::open(config.clone()).await?;
    configure_git_identity(&root);
    mirror
        .run(Arc::new(AcceptingSession), catalog.clone(), transport.clone())
        .await?;
    assert_eq!(transport.fetch_count(), 1);

    // Same provider snapshot: the rescan schedules zero fetches.
    let mirror = Mirror::open(config).await?;
    mirror
        .run(Arc::new(AcceptingSession), catalog.clone(), transport.clone())
        .await?;
    assert_eq!(transport.fetch_count(), 1);

    std::fs::remove_dir_all(&root).ok();
    Ok(())
}

#[tokio::test]
async fn new_version_is_fetched_without_touching_the_old() -> Result<()> {
    let root = temp_dir("mm-it-update");
    let config = test_config(&root);
    write_credentials(&config.state_dir(), &[("alice", "s3cret")]).await?;

    let catalog = Catalog::new();
    catalog.entitle("alice", &[100]);
    catalog.set_owner(100, "game", &[(1, "v1")]);
    let transport = PayloadTransport::new();

    let mirror = Mirror::open(config.clone()).await?;
    configure_git_identity(&root);
    mirror
        .run(Arc::new(AcceptingSession), catalog.clone(), transport.clone())
        .await?;

    // Provider publishes a new version for the artifact.
    catalog.set_version(100, 1, "v2");
    let mirror = Mirror::open(config).await?;
    mirror
        .run(Arc::new(AcceptingSession), catalog.clone(), transport.clone())
        .await?;

    assert_eq!(transport.fetch_count(), 2);
    // The old version is never overwritten; both are stored.
    assert!(mirror.store().exists(1, "v1").await?);
    assert!(mirror.store().exists(1, "v2").await?);
    let blob_dir = root.join("owners/100");
    assert!(blob_dir.join("1_v1.manifest").exists());
    assert!(blob_dir.join("1_v2.manifest").exists());

    std::fs::remove_dir_all(&root).ok();
    Ok(())
}

#[tokio::test]
async fn change_detection_skips_unchanged_accounts() -> Result<()> {
    let root = temp_dir("mm-it-change");
    let mut config = test_config(&root);
    write_credentials(&config.state_dir(), &[("alice", "s3cret")]).await?;

    let catalog = Catalog::new();
    catalog.entitle("alice", &[100]);
    catalog.set_owner(100, "game", &[(1, "v1")]);
    let transport = PayloadTransport::new();

    // First run seeds state (never-seen accounts are always due).
    config.check_changes = true;
    let mirror = Mirror::open(config.clone()).await?;
    configure_git_identity(&root);
    let summary = mirror
        .run(Arc::new(AcceptingSession), catalog.clone(), transport.clone())
        .await?;
    assert_eq!(summary.passes, 1);
    assert_eq!(transport.fetch_count(), 1);

    // Nothing changed: the account is not due, no pass runs.
    let mirror = Mirror::open(config.clone()).await?;
    let summary = mirror
        .run(Arc::new(AcceptingSession), catalog.clone(), transport.clone())
        .await?;
    assert_eq!(summary.passes, 0);
    assert_eq!(transport.fetch_count(), 1);

    // A changed version makes the owning account due again.
    catalog.set_version(100, 1, "v9");
    let mirror = Mirror::open(config).await?;
    let summary = mirror
        .run(Arc::new(AcceptingSession), catalog.clone(), transport.clone())
        .await?;
    assert_eq!(summary.passes, 1);
    assert_eq!(transport.fetch_count(), 2);
    assert!(mirror.store().exists(1, "v9").await?);

    std::fs::remove_dir_all(&root).ok();
    Ok(())
}

#[tokio::test]
async fn transient_transport_failures_are_absorbed() -> Result<()> {
    let root = temp_dir("mm-it-retry");
    let config = test_config(&root);
    write_credentials(&config.state_dir(), &[("alice", "s3cret")]).await?;

    let catalog = Catalog::new();
    catalog.entitle("alice", &[100]);
    catalog.set_owner(100, "game", &[(1, "v1")]);
    let transport = PayloadTransport::with_failures(vec![
        PayloadTransport::network_error(),
        PayloadTransport::network_error(),
    ]);

    let mirror = Mirror::open(config).await?;
    configure_git_identity(&root);
    let summary = mirror
        .run(Arc::new(AcceptingSession), catalog.clone(), transport.clone())
        .await?;

    assert_eq!(summary.jobs_succeeded, 1);
    assert_eq!(summary.jobs_failed, 0);
    assert_eq!(transport.fetch_count(), 3);
    assert!(mirror.store().exists(1, "v1").await?);

    std::fs::remove_dir_all(&root).ok();
    Ok(())
}

#[tokio::test]
async fn account_filter_limits_the_run() -> Result<()> {
    let root = temp_dir("mm-it-filter");
    let mut config = test_config(&root);
    write_credentials(&config.state_dir(), &[("alice", "a"), ("bob", "b")]).await?;
    config.account_filter = ["alice".to_string()].into();

    let catalog = Catalog::new();
    catalog.entitle("alice", &[100]);
    catalog.entitle("bob", &[200]);
    catalog.set_owner(100, "game", &[(1, "v1")]);
    catalog.set_owner(200, "game", &[(5, "v5")]);
    let transport = PayloadTransport::new();

    let mirror = Mirror::open(config).await?;
    configure_git_identity(&root);
    let summary = mirror
        .run(Arc::new(AcceptingSession), catalog.clone(), transport.clone())
        .await?;

    assert_eq!(summary.passes, 1);
    assert!(mirror.store().exists(1, "v1").await?);
    assert!(!mirror.store().exists(5, "v5").await?);

    std::fs::remove_dir_all(&root).ok();
    Ok(())
}
