#![cfg(unix)]

mod common;

use common::*;
use git_pack_scanner::{CancellationToken, Error, ObjectKind, PackScanner, PktLine, ScanOptions};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

/// Stands in for `ssh`: records its arguments and the request it was sent,
/// then replays canned upload-pack output.
fn fake_ssh(name: &str, advertisement: &[u8], response: &[u8]) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "git-pack-scanner-{}-{name}",
        std::process::id()
    ));
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("advertisement"), advertisement).unwrap();
    fs::write(dir.join("response"), response).unwrap();

    let script = dir.join("ssh");
    fs::write(
        &script,
        format!(
            "#!/bin/sh\n\
             dir='{dir}'\n\
             printf '%s\\n' \"$@\" > \"$dir/args\"\n\
             cat \"$dir/advertisement\"\n\
             cat > \"$dir/request\"\n\
             cat \"$dir/response\"\n",
            dir = dir.display()
        ),
    )
    .unwrap();
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
    script
}

#[tokio::test]
async fn it_fetches_over_ssh() {
    let commit = b"tree 9edeb164f449abb91c7abd81d82ea4fe80a8ed8a\n\nfirst\n".to_vec();
    let blob = b"fn main() {}\n".to_vec();
    let pack = build_pack(&[
        (ObjectKind::Commit, &commit),
        (ObjectKind::Tree, b"40000 src\0bbbbbbbbbbbbbbbbbbbb"),
        (ObjectKind::Blob, &blob),
    ]);

    let script = fake_ssh(
        "fetch",
        &ssh_advertisement(H1, FULL_CAPABILITIES),
        &nak_then(&pack),
    );
    let dir = script.parent().unwrap().to_path_buf();

    let scanner = PackScanner::new("ssh://git@example.com:2222/org/it's.git", &[H1], &[H2])
        .unwrap()
        .with_options(ScanOptions::default().ssh_command(script.display().to_string()));
    let mut reader = scanner.scan_packfile(CancellationToken::new()).unwrap();

    assert_eq!(reader.next_chunk().await.unwrap().unwrap().to_vec(), commit);
    assert_eq!(reader.next_chunk().await.unwrap().unwrap().to_vec(), blob);
    assert!(reader.next_chunk().await.is_none());

    let args = fs::read_to_string(dir.join("args")).unwrap();
    assert_eq!(
        args.lines().collect::<Vec<_>>(),
        vec![
            "-p",
            "2222",
            "git@example.com",
            r"git-upload-pack '/org/it'\''s.git'"
        ]
    );

    let request = fs::read_to_string(dir.join("request")).unwrap();
    assert!(request.starts_with(&format!("0046want {H1} thin-pack ofs-delta\n")));
    assert!(request.contains(&format!("have {H2}\n")));
    assert!(request.ends_with("0009done\n"));

    // A server that refuses the want reports it through the reader.
    fs::write(
        dir.join("response"),
        PktLine::from(format!("ERR upload-pack: not our ref {H1}\n")).encode(),
    )
    .unwrap();
    let mut reader = scanner.scan_packfile(CancellationToken::new()).unwrap();
    let err = reader.next_chunk().await.unwrap().unwrap_err();
    assert!(matches!(err, Error::NegotiationRejected(_)), "{err:?}");

    let _ = fs::remove_dir_all(dir);
}
