use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use chrono::{DateTime, Utc};

use manifest_mirror::normalize::{FileEntry, ManifestBlob};
use manifest_mirror::run::Mirror;

use super::infra::{configure_git_identity, temp_dir, test_config};

fn at(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).expect("timestamp")
}

fn blob(owner: u32, artifact: u32, gid: &str, created_secs: i64) -> ManifestBlob {
    ManifestBlob::build(
        owner,
        artifact,
        gid,
        at(created_secs),
        vec![FileEntry {
            path: format!("content/{artifact}.bin"),
            size: 64,
            chunks: Vec::new(),
        }],
    )
    .expect("building blob")
}

/// Lay out a proposal directory: `<dir>/<owner>/<artifact>_<gid>.manifest`
/// plus the owner's key registry.
async fn write_proposal(
    dir: &Path,
    owner: u32,
    blobs: &[(&ManifestBlob, &str)],
) -> Result<()> {
    let owner_dir = dir.join(owner.to_string());
    tokio::fs::create_dir_all(&owner_dir).await?;
    let mut keys: BTreeMap<String, String> = BTreeMap::new();
    for (blob, key) in blobs {
        let name = format!("{}_{}.manifest", blob.metadata.artifact, blob.metadata.gid);
        tokio::fs::write(owner_dir.join(name), blob.to_vec()?).await?;
        keys.insert(blob.metadata.artifact.to_string(), (*key).to_string());
    }
    tokio::fs::write(owner_dir.join("keys.json"), serde_json::to_vec_pretty(&keys)?).await?;
    Ok(())
}

#[tokio::test]
async fn earlier_created_candidate_supersedes_the_record() -> Result<()> {
    let root = temp_dir("mm-merge-adopt");
    let config = test_config(&root);
    let mirror = Mirror::open(config).await?;
    configure_git_identity(&root);

    // Current record: v1 created at t=20.
    mirror.store().put(&blob(100, 1, "v1", 20), &"aa".repeat(32)).await?;
    mirror.state().set_version(1, "v1");

    // Proposal: v0 created at t=10 — live first, therefore authoritative.
    let proposals = temp_dir("mm-merge-adopt-src");
    write_proposal(&proposals, 100, &[(&blob(100, 1, "v0", 10), &"bb".repeat(32))]).await?;

    let adopted = mirror.merge_external(&proposals).await?;
    assert_eq!(adopted, 1);

    // v0 replaces v1: file, tag, key entry, and recorded version.
    let owner_dir = root.join("owners/100");
    assert!(owner_dir.join("1_v0.manifest").exists());
    assert!(!owner_dir.join("1_v1.manifest").exists());
    assert!(mirror.store().exists(1, "v0").await?);
    mirror.store().invalidate_caches();
    assert!(!mirror.store().exists(1, "v1").await?);
    assert_eq!(mirror.state().recorded_version(1), Some("v0".to_string()));

    let keys: BTreeMap<String, String> =
        serde_json::from_slice(&std::fs::read(owner_dir.join("keys.json"))?)?;
    assert_eq!(keys.get("1").map(String::as_str), Some("bb".repeat(32).as_str()));

    std::fs::remove_dir_all(&root).ok();
    std::fs::remove_dir_all(&proposals).ok();
    Ok(())
}

#[tokio::test]
async fn later_created_candidate_is_rejected() -> Result<()> {
    let root = temp_dir("mm-merge-keep");
    let config = test_config(&root);
    let mirror = Mirror::open(config).await?;
    configure_git_identity(&root);

    mirror.store().put(&blob(100, 1, "v1", 20), &"aa".repeat(32)).await?;
    mirror.state().set_version(1, "v1");

    let proposals = temp_dir("mm-merge-keep-src");
    write_proposal(&proposals, 100, &[(&blob(100, 1, "v2", 30), &"bb".repeat(32))]).await?;

    let adopted = mirror.merge_external(&proposals).await?;
    assert_eq!(adopted, 0);

    let owner_dir = root.join("owners/100");
    assert!(owner_dir.join("1_v1.manifest").exists());
    assert!(!owner_dir.join("1_v2.manifest").exists());
    assert_eq!(mirror.state().recorded_version(1), Some("v1".to_string()));

    std::fs::remove_dir_all(&root).ok();
    std::fs::remove_dir_all(&proposals).ok();
    Ok(())
}

#[tokio::test]
async fn proposals_for_unknown_artifacts_are_adopted_outright() -> Result<()> {
    let root = temp_dir("mm-merge-new");
    let config = test_config(&root);
    let mirror = Mirror::open(config).await?;
    configure_git_identity(&root);

    let proposals = temp_dir("mm-merge-new-src");
    write_proposal(
        &proposals,
        200,
        &[
            (&blob(200, 5, "g5", 50), &"cc".repeat(32)),
            (&blob(200, 6, "g6", 60), &"dd".repeat(32)),
        ],
    )
    .await?;

    let adopted = mirror.merge_external(&proposals).await?;
    assert_eq!(adopted, 2);
    assert!(mirror.store().exists(5, "g5").await?);
    assert!(mirror.store().exists(6, "g6").await?);
    assert_eq!(mirror.state().recorded_version(5), Some("g5".to_string()));

    // Non-owner directories are ignored entirely.
    std::fs::create_dir_all(proposals.join("not-an-owner"))?;
    let adopted = mirror.merge_external(&proposals).await?;
    assert_eq!(adopted, 0); // everything already recorded

    std::fs::remove_dir_all(&root).ok();
    std::fs::remove_dir_all(&proposals).ok();
    Ok(())
}
