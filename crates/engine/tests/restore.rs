mod common;

use coffer_engine::{RestoreRequest, backup, restore};
use common::{Fixture, modified};
use rstest::rstest;
use std::fs;

fn request(fixture: &Fixture, collection: u64, pattern: &str) -> RestoreRequest {
    RestoreRequest {
        collection,
        pattern: pattern.to_string(),
        destination: fixture.restore.path().to_path_buf(),
        preview: false,
        skip_verify: false,
    }
}

#[tokio::test]
async fn test_restore_brings_back_bytes_and_times() {
    let fixture = Fixture::new();
    let text = fixture.write("docs/notes.txt", "a honey jar\n".repeat(200).as_bytes(), 3600);
    let random = fixture.write("bin/blob", &(0..=255u8).cycle().take(5000).collect::<Vec<_>>(), 7200);
    let empty = fixture.write("empty", b"", 60);
    let group = fixture.open().await;
    backup::run(&group).await.unwrap();

    let report = restore::run(&group, &request(&fixture, 1, "*")).await.unwrap();
    assert_eq!((report.matched, report.restored), (3, 3));
    assert!(report.issues.is_empty(), "{:?}", report.issues);
    assert!(report.caveats.is_empty(), "{:?}", report.caveats);
    for source in [&text, &random, &empty] {
        let target = fixture.restored(source);
        assert_eq!(fs::read(&target).unwrap(), fs::read(source).unwrap());
        let expected = modified(source).duration_since(std::time::UNIX_EPOCH).unwrap().as_secs();
        let actual = modified(&target).duration_since(std::time::UNIX_EPOCH).unwrap().as_secs();
        assert_eq!(actual, expected);
    }
    group.close().await;
}

#[rstest]
#[case::everything("*", 2)]
#[case::by_extension("*.txt", 1)]
#[case::nothing("*.flac", 0)]
#[tokio::test]
async fn test_pattern_selects_files(#[case] pattern: &str, #[case] expected: u64) {
    let fixture = Fixture::new();
    fixture.write("a.txt", b"alpha", 60);
    fixture.write("deep/down/b.bin", b"beta", 60);
    let group = fixture.open().await;
    backup::run(&group).await.unwrap();

    let mut preview = request(&fixture, 1, pattern);
    preview.preview = true;
    let report = restore::run(&group, &preview).await.unwrap();
    assert_eq!(report.matched, expected);
    assert_eq!(report.paths.len() as u64, expected);
    assert_eq!(report.restored, 0);
    assert!(fs::read_dir(fixture.restore.path()).unwrap().next().is_none());
    group.close().await;
}

#[tokio::test]
async fn test_older_collection_restores_newest_content_with_a_caveat() {
    let fixture = Fixture::new();
    let path = fixture.write("a.txt", b"alpha", 600);
    let group = fixture.open().await;
    backup::run(&group).await.unwrap();
    fixture.write("a.txt", b"omega!", 60);
    backup::run(&group).await.unwrap();

    let report = restore::run(&group, &request(&fixture, 1, "*")).await.unwrap();
    assert_eq!(report.restored, 1);
    assert_eq!(report.caveats.len(), 1);
    assert_eq!(fs::read(fixture.restored(&path)).unwrap(), b"omega!");
    group.close().await;
}

#[tokio::test]
async fn test_files_gone_before_the_chosen_collection_are_not_restored() {
    let fixture = Fixture::new();
    fixture.write("a.txt", b"alpha", 60);
    let gone = fixture.write("b.txt", b"beta", 60);
    let group = fixture.open().await;
    backup::run(&group).await.unwrap();
    fs::remove_file(&gone).unwrap();
    backup::run(&group).await.unwrap();

    let report = restore::run(&group, &request(&fixture, 2, "*")).await.unwrap();
    assert_eq!(report.restored, 1);
    assert!(!fixture.restored(&gone).exists());
    group.close().await;
}

#[tokio::test]
async fn test_missing_archive_is_an_issue() {
    let fixture = Fixture::new();
    let path = fixture.write("a.txt", b"alpha", 60);
    let group = fixture.open().await;
    let backup = backup::run(&group).await.unwrap();
    fs::remove_file(group.layout().ready().join(&backup.archives[0])).unwrap();

    let report = restore::run(&group, &request(&fixture, 1, "*")).await.unwrap();
    assert_eq!(report.restored, 0);
    assert_eq!(report.issues.len(), 1);
    assert_eq!(report.issues[0].path.as_deref(), Some(path.as_path()));
    group.close().await;
}
