//! 백업 생성/복원 왕복 테스트

use std::fs;
use std::io::Read;

use mcman_core::backup::BackupManager;
use mcman_core::host::HostCapabilities;
use mcman_core::instance::{self, ServerInstance};
use mcman_core::supervisor::{ServerSupervisor, SupervisorError};
use tokio::sync::watch;

#[tokio::test]
async fn test_single_file_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let data: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
    fs::create_dir_all(dir.path().join("world/data")).unwrap();
    fs::write(dir.path().join("world/data/raids.dat"), &data).unwrap();

    let (_tx, rx) = watch::channel(false);
    let mgr = BackupManager::new(ServerInstance::new("rt", dir.path()), rx);
    mgr.create(Some("b1")).await.unwrap();

    // the archive never contains the backups folder itself
    let mut archive = zip::ZipArchive::new(fs::File::open(dir.path().join("backups/b1.zip")).unwrap()).unwrap();
    for i in 0..archive.len() {
        assert!(!archive.by_index(i).unwrap().name().starts_with("backups"));
    }
    let mut entry = archive.by_name("world/data/raids.dat").unwrap();
    let mut packed = Vec::new();
    entry.read_to_end(&mut packed).unwrap();
    assert_eq!(packed, data);

    fs::remove_dir_all(dir.path().join("world")).unwrap();
    mgr.restore("b1").await.unwrap();
    assert_eq!(fs::read(dir.path().join("world/data/raids.dat")).unwrap(), data);

    println!("✓ backup round-trip");
}

#[tokio::test]
async fn test_restore_keeps_other_backups() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("server.properties"), "motd=one\n").unwrap();

    let (_tx, rx) = watch::channel(false);
    let mgr = BackupManager::new(ServerInstance::new("rt", dir.path()), rx);
    mgr.create(Some("one")).await.unwrap();
    fs::write(dir.path().join("server.properties"), "motd=two\n").unwrap();
    mgr.create(Some("two")).await.unwrap();

    mgr.restore("one").await.unwrap();
    assert_eq!(fs::read_to_string(dir.path().join("server.properties")).unwrap(), "motd=one\n");

    let mut names: Vec<String> = mgr.list().unwrap().into_iter().map(|b| b.name).collect();
    names.sort();
    assert_eq!(names, ["one", "two"]);
}

#[tokio::test]
async fn test_supervisor_backups_follow_running_flag() {
    let servers = tempfile::tempdir().unwrap();
    fs::create_dir_all(servers.path().join("alpha")).unwrap();
    fs::write(servers.path().join("alpha/level.dat"), b"lvl").unwrap();

    let instance = ServerInstance::open(servers.path(), "alpha").unwrap();
    let sup = ServerSupervisor::new(instance, HostCapabilities::new(false, "java"));
    let info = sup.backups().create(None).await.unwrap();
    assert!(info.name.starts_with("backup_"));

    // not running: restore is allowed
    sup.backups().restore(&info.name).await.unwrap();
    assert!(matches!(
        sup.backups().restore("nope").await,
        Err(SupervisorError::BackupNotFound(_))
    ));
    assert!(matches!(
        sup.backups().create(Some("../escape")).await,
        Err(SupervisorError::InvalidName(_))
    ));
    assert_eq!(
        instance::list_instances(servers.path()).unwrap(),
        vec!["alpha".to_string()]
    );
}
