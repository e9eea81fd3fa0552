//! S4: a driver launched with a device label and config path sees them as
//! `HYDROGENDEV`/`HYDROGENCONFIG` in its environment.

use std::os::unix::fs::PermissionsExt;
use std::time::Duration;

use hydrogend::driver_local::{spawn, LocalDriverConfig};

#[tokio::test]
async fn spawned_driver_sees_device_and_config_path_as_env_vars() {
    let dir = tempfile::tempdir().unwrap();
    let script_path = dir.path().join("fake-driver.sh");
    std::fs::write(&script_path, b"#!/bin/sh\nprintf '%s %s' \"$HYDROGENDEV\" \"$HYDROGENCONFIG\"\n").unwrap();
    let mut perms = std::fs::metadata(&script_path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&script_path, perms).unwrap();

    let cfg = LocalDriverConfig {
        path: script_path.to_string_lossy().into_owned(),
        device: Some("cam".to_owned()),
        config_path: Some("/etc/foo.cfg".to_owned()),
        skel_path: None,
        prefix: None,
        use_socketpair: false,
    };

    let spawned = spawn(&cfg).unwrap();

    let mut buf = [0u8; 256];
    let (n, _fds) = tokio::time::timeout(Duration::from_secs(2), spawned.transport.read(&mut buf))
        .await
        .expect("timed out waiting for driver output")
        .unwrap();
    assert_eq!(&buf[..n], b"cam /etc/foo.cfg");

    let mut status = 0i32;
    unsafe { libc::waitpid(spawned.pid, &mut status, 0) };
}

#[tokio::test]
async fn spawned_driver_over_socketpair_sees_same_env_vars() {
    let dir = tempfile::tempdir().unwrap();
    let script_path = dir.path().join("fake-driver.sh");
    std::fs::write(&script_path, b"#!/bin/sh\nprintf '%s' \"$HYDROGENDEV\"\n").unwrap();
    let mut perms = std::fs::metadata(&script_path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&script_path, perms).unwrap();

    let cfg = LocalDriverConfig {
        path: script_path.to_string_lossy().into_owned(),
        device: Some("weatherstation".to_owned()),
        config_path: None,
        skel_path: None,
        prefix: None,
        use_socketpair: true,
    };

    let spawned = spawn(&cfg).unwrap();

    let mut buf = [0u8; 256];
    let (n, _fds) = tokio::time::timeout(Duration::from_secs(2), spawned.transport.read(&mut buf))
        .await
        .expect("timed out waiting for driver output")
        .unwrap();
    assert_eq!(&buf[..n], b"weatherstation");

    let mut status = 0i32;
    unsafe { libc::waitpid(spawned.pid, &mut status, 0) };
}
