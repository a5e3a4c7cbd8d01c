mod common;

use common::{sha256_hex, TestEnv};
use hvnode_core::{HvnodeError, ImageStatus};
use pretty_assertions::assert_eq;
use std::io::Write;
use std::path::Path;

fn cache_dir_entries(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

fn tar_gz(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, *data).unwrap();
    }
    let tar = builder.into_inner().unwrap();
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
    encoder.write_all(&tar).unwrap();
    encoder.finish().unwrap()
}

fn zip_archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    for (name, data) in entries {
        writer
            .start_file(*name, zip::write::FileOptions::default())
            .unwrap();
        writer.write_all(data).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

#[tokio::test]
async fn test_refresh_then_fetch_installs_verified_image() {
    let env = TestEnv::new();
    let payload = b"kutti 1.24 disk image";
    let source = env.write_source("kutti-1.24.vhdx", payload);
    let checksum = sha256_hex(payload);
    let manifest = env.write_manifest(&[("1.24", &checksum, source.to_str().unwrap())]);

    let mut cache = env.open_cache().await;
    cache.refresh_catalog(&manifest).await.unwrap();
    assert_eq!(
        cache.get_image("1.24").unwrap().status(),
        ImageStatus::NotDownloaded
    );

    cache.fetch_image("1.24").await.unwrap();

    let image = cache.get_image("1.24").unwrap();
    assert_eq!(image.status(), ImageStatus::Downloaded);
    assert_eq!(image.checksum(), checksum);
    let installed = cache.image_path("1.24");
    assert_eq!(std::fs::read(&installed).unwrap(), payload);
    assert_eq!(
        cache_dir_entries(cache.cache_dir()),
        vec!["kutti-1.24.vhdx".to_string()]
    );

    let persisted = env.persisted_index();
    assert_eq!(persisted["1.24"].status(), ImageStatus::Downloaded);
}

#[tokio::test]
async fn test_tampered_fetch_leaves_existing_copy_untouched() {
    let env = TestEnv::new();
    let payload = b"good image";
    let mut cache = env.cache_with_image("1.24", payload).await;

    // Same source, different bytes.
    env.write_source("kutti-1.24.vhdx", b"evil image");

    let result = cache.fetch_image("1.24").await;
    assert!(matches!(result, Err(HvnodeError::Integrity { .. })));

    assert_eq!(std::fs::read(cache.image_path("1.24")).unwrap(), payload);
    assert_eq!(
        cache.get_image("1.24").unwrap().status(),
        ImageStatus::Downloaded
    );
    assert_eq!(
        cache_dir_entries(cache.cache_dir()),
        vec!["kutti-1.24.vhdx".to_string()]
    );
}

#[tokio::test]
async fn test_first_fetch_with_bad_checksum_installs_nothing() {
    let env = TestEnv::new();
    let source = env.write_source("kutti-1.25.vhdx", b"payload");
    let manifest = env.write_manifest(&[("1.25", &sha256_hex(b"other"), source.to_str().unwrap())]);

    let mut cache = env.open_cache().await;
    cache.refresh_catalog(&manifest).await.unwrap();

    match cache.fetch_image("1.25").await {
        Err(HvnodeError::Integrity {
            version,
            expected,
            actual,
        }) => {
            assert_eq!(version, "1.25");
            assert_eq!(expected, sha256_hex(b"other"));
            assert_eq!(actual, sha256_hex(b"payload"));
        }
        other => panic!("expected integrity error, got {:?}", other),
    }

    assert_eq!(
        cache.get_image("1.25").unwrap().status(),
        ImageStatus::NotDownloaded
    );
    assert!(cache_dir_entries(cache.cache_dir()).is_empty());
}

#[tokio::test]
async fn test_fetch_unknown_version() {
    let env = TestEnv::new();
    let mut cache = env.open_cache().await;
    assert!(matches!(
        cache.fetch_image("0.0").await,
        Err(HvnodeError::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_fetch_archived_payload_reports_progress() {
    let env = TestEnv::new();
    let disk = vec![42u8; 300_000];
    let archive = tar_gz(&[("kutti-1.24.vhdx", &disk)]);
    let source = env.write_source("kutti-1.24.vhdx.tar.gz", &archive);
    let manifest = env.write_manifest(&[("1.24", &sha256_hex(&disk), source.to_str().unwrap())]);

    let mut cache = env.open_cache().await;
    cache.refresh_catalog(&manifest).await.unwrap();

    let mut reports = Vec::new();
    let mut record = |so_far: u64, total: u64| reports.push((so_far, total));
    cache
        .fetch_image_with_progress("1.24", &mut record)
        .await
        .unwrap();

    let total = archive.len() as u64;
    assert_eq!(reports.last(), Some(&(total, total)));
    assert!(reports.windows(2).all(|w| w[0].0 <= w[1].0));
    assert_eq!(std::fs::read(cache.image_path("1.24")).unwrap(), disk);
}

#[tokio::test]
async fn test_import_local_archive() {
    let env = TestEnv::new();
    let disk = b"imported disk".to_vec();
    let manifest = env.write_manifest(&[("1.24", &sha256_hex(&disk), "https://unused.invalid/1.24")]);
    let archive = env.write_source("download.tgz", &tar_gz(&[("disk.vhdx", &disk)]));

    let mut cache = env.open_cache().await;
    cache.refresh_catalog(&manifest).await.unwrap();
    cache.import_local_file("1.24", &archive).await.unwrap();

    assert_eq!(
        cache.get_image("1.24").unwrap().status(),
        ImageStatus::Downloaded
    );
    assert_eq!(std::fs::read(cache.image_path("1.24")).unwrap(), disk);
    assert!(archive.exists(), "the user's file is left in place");
}

#[tokio::test]
async fn test_import_rejects_bad_archives() {
    let env = TestEnv::new();
    let disk = b"disk".to_vec();
    let manifest = env.write_manifest(&[("1.24", &sha256_hex(&disk), "https://unused.invalid/1.24")]);
    let mut cache = env.open_cache().await;
    cache.refresh_catalog(&manifest).await.unwrap();

    let two_entries = env.write_source(
        "two.tar.gz",
        &tar_gz(&[("a.vhdx", &disk), ("b.vhdx", &disk)]),
    );
    assert!(matches!(
        cache.import_local_file("1.24", &two_entries).await,
        Err(HvnodeError::Format { .. })
    ));

    let empty = env.write_source("empty.tar.gz", &tar_gz(&[]));
    assert!(matches!(
        cache.import_local_file("1.24", &empty).await,
        Err(HvnodeError::Format { .. })
    ));

    let rar = env.write_source("image.rar", b"Rar!");
    assert!(matches!(
        cache.import_local_file("1.24", &rar).await,
        Err(HvnodeError::Format { .. })
    ));

    assert_eq!(
        cache.get_image("1.24").unwrap().status(),
        ImageStatus::NotDownloaded
    );
    assert!(cache_dir_entries(cache.cache_dir()).is_empty());
}

#[tokio::test]
async fn test_fetch_zipped_payload() {
    let env = TestEnv::new();
    let disk = vec![7u8; 100_000];
    let source = env.write_source(
        "kutti-k8s-1.24.zip",
        &zip_archive(&[("kutti-k8s-1.24.vhdx", &disk)]),
    );
    let manifest = env.write_manifest(&[("1.24", &sha256_hex(&disk), source.to_str().unwrap())]);

    let mut cache = env.open_cache().await;
    cache.refresh_catalog(&manifest).await.unwrap();
    cache.fetch_image("1.24").await.unwrap();

    assert_eq!(
        cache.get_image("1.24").unwrap().status(),
        ImageStatus::Downloaded
    );
    assert_eq!(std::fs::read(cache.image_path("1.24")).unwrap(), disk);
    assert_eq!(
        cache_dir_entries(cache.cache_dir()),
        vec!["kutti-1.24.vhdx".to_string()]
    );
}

#[tokio::test]
async fn test_import_zipped_payload() {
    let env = TestEnv::new();
    let disk = b"zipped disk".to_vec();
    let manifest = env.write_manifest(&[("1.24", &sha256_hex(&disk), "https://unused.invalid/1.24")]);
    let archive = env.write_source("kutti-k8s-1.24.zip", &zip_archive(&[("disk.vhdx", &disk)]));

    let mut cache = env.open_cache().await;
    cache.refresh_catalog(&manifest).await.unwrap();
    cache.import_local_file("1.24", &archive).await.unwrap();

    assert_eq!(
        cache.get_image("1.24").unwrap().status(),
        ImageStatus::Downloaded
    );
    assert_eq!(std::fs::read(cache.image_path("1.24")).unwrap(), disk);
}

#[tokio::test]
async fn test_zip_must_hold_exactly_one_file() {
    let env = TestEnv::new();
    let disk = b"disk".to_vec();
    let two = env.write_source(
        "two.zip",
        &zip_archive(&[("a.vhdx", &disk), ("b.vhdx", &disk)]),
    );
    let empty = env.write_source("empty.zip", &zip_archive(&[]));
    let manifest = env.write_manifest(&[("1.24", &sha256_hex(&disk), two.to_str().unwrap())]);

    let mut cache = env.open_cache().await;
    cache.refresh_catalog(&manifest).await.unwrap();

    // Downloaded and imported archives go through the same check.
    assert!(matches!(
        cache.fetch_image("1.24").await,
        Err(HvnodeError::Format { .. })
    ));
    for archive in [&two, &empty] {
        assert!(matches!(
            cache.import_local_file("1.24", archive).await,
            Err(HvnodeError::Format { .. })
        ));
    }

    assert_eq!(
        cache.get_image("1.24").unwrap().status(),
        ImageStatus::NotDownloaded
    );
    assert!(cache_dir_entries(cache.cache_dir()).is_empty());
}

#[tokio::test]
async fn test_import_raw_disk_with_wrong_checksum() {
    let env = TestEnv::new();
    let manifest = env.write_manifest(&[("1.24", &sha256_hex(b"expected"), "https://unused.invalid/1.24")]);
    let mut cache = env.open_cache().await;
    cache.refresh_catalog(&manifest).await.unwrap();

    let disk = env.write_source("local.vhdx", b"unexpected");
    assert!(matches!(
        cache.import_local_file("1.24", &disk).await,
        Err(HvnodeError::Integrity { .. })
    ));
    assert!(!cache.image_path("1.24").exists());
}

#[tokio::test]
async fn test_purge_local() {
    let env = TestEnv::new();
    let mut cache = env.cache_with_image("1.24", b"payload").await;

    cache.purge_local("1.24").await.unwrap();
    assert!(!cache.image_path("1.24").exists());
    assert_eq!(
        cache.get_image("1.24").unwrap().status(),
        ImageStatus::NotDownloaded
    );
    assert_eq!(
        env.persisted_index()["1.24"].status(),
        ImageStatus::NotDownloaded
    );

    // Purging again is a no-op.
    cache.purge_local("1.24").await.unwrap();
}

#[tokio::test]
async fn test_purge_with_file_already_gone() {
    let env = TestEnv::new();
    let mut cache = env.cache_with_image("1.24", b"payload").await;
    std::fs::remove_file(cache.image_path("1.24")).unwrap();

    cache.purge_local("1.24").await.unwrap();
    assert_eq!(
        cache.get_image("1.24").unwrap().status(),
        ImageStatus::NotDownloaded
    );
}

#[tokio::test]
async fn test_refresh_merges_download_status() {
    let env = TestEnv::new();
    let mut cache = env.cache_with_image("1.24", b"payload 1.24").await;
    let source = env.write_source("kutti-1.24.vhdx", b"payload 1.24");
    let source = source.to_str().unwrap();

    // Unchanged entry keeps its status; a new one arrives NotDownloaded.
    let manifest = env.write_manifest(&[
        ("1.24", &sha256_hex(b"payload 1.24"), source),
        ("1.25", &sha256_hex(b"payload 1.25"), "https://unused.invalid/1.25"),
    ]);
    cache.refresh_catalog(&manifest).await.unwrap();
    assert_eq!(
        cache.get_image("1.24").unwrap().status(),
        ImageStatus::Downloaded
    );
    assert_eq!(
        cache.get_image("1.25").unwrap().status(),
        ImageStatus::NotDownloaded
    );
    let versions: Vec<&str> = cache.list_images().iter().map(|i| i.k8s_version()).collect();
    assert_eq!(versions, vec!["1.24", "1.25"]);

    // A new checksum invalidates the cached payload; dropped versions vanish.
    let manifest = env.write_manifest(&[("1.24", &sha256_hex(b"rebuilt 1.24"), source)]);
    cache.refresh_catalog(&manifest).await.unwrap();
    assert_eq!(
        cache.get_image("1.24").unwrap().status(),
        ImageStatus::NotDownloaded
    );
    assert!(cache.get_image("1.25").is_none());
    assert_eq!(env.persisted_index().len(), 1);
}

#[tokio::test]
async fn test_failed_refresh_keeps_index() {
    let env = TestEnv::new();
    let mut cache = env.cache_with_image("1.24", b"payload").await;
    let before = env.persisted_index();

    let bad = env.write_source("bad.json", b"{ not json");
    assert!(cache.refresh_catalog(bad.to_str().unwrap()).await.is_err());

    let missing = env.dir.path().join("missing.json");
    assert!(cache.refresh_catalog(missing.to_str().unwrap()).await.is_err());

    assert_eq!(
        cache.get_image("1.24").unwrap().status(),
        ImageStatus::Downloaded
    );
    assert_eq!(env.persisted_index(), before);
    assert_eq!(
        cache_dir_entries(cache.cache_dir()),
        vec!["kutti-1.24.vhdx".to_string()]
    );
}

#[tokio::test]
async fn test_index_survives_reopen() {
    let env = TestEnv::new();
    let cache = env.cache_with_image("1.24", b"payload").await;
    drop(cache);

    let reopened = env.open_cache().await;
    assert_eq!(
        reopened.get_image("1.24").unwrap().status(),
        ImageStatus::Downloaded
    );
    assert!(reopened.cached_path("1.24").is_ok());
}

#[tokio::test]
async fn test_verify_cached_detects_corruption() {
    let env = TestEnv::new();
    let cache = env.cache_with_image("1.24", b"payload").await;
    assert!(cache.verify_cached("1.24").await.unwrap());

    std::fs::write(cache.image_path("1.24"), b"bit rot").unwrap();
    assert!(!cache.verify_cached("1.24").await.unwrap());
}
