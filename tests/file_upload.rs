//! File upload over the stream protocol: happy path, filename rejection,
//! offset mismatches, and viewer gating. Uploads land in the shell's
//! working directory, discovered through the live process.

mod common;

use bytes::Bytes;
use common::*;
use std::path::Path;
use webterm::protocol::{AckStatus, Frame};
use webterm::pty::SpawnOptions;
use webterm::session::Session;

/// Create a session whose shell runs in `dir`, and attach a writer stream.
async fn upload_session(server: &TestServer, dir: &Path) -> (Session, Ws) {
    let session = server
        .state
        .sessions
        .create(
            TEST_USER,
            Some("upload".into()),
            SpawnOptions {
                cwd: Some(dir.to_path_buf()),
                shell: Some("/bin/sh".into()),
                ..Default::default()
            },
        )
        .expect("session spawn");
    let mut ws = server.connect_stream(&session.id).await;
    ws.resize(80, 24).await;
    ws.expect_write_state(true).await;
    (session, ws)
}

fn file_start(size: u32, name: &[u8]) -> Frame {
    Frame::FileStart {
        size,
        name: Bytes::copy_from_slice(name),
    }
}

fn file_chunk(offset: u32, data: &[u8]) -> Frame {
    Frame::FileChunk {
        offset,
        data: Bytes::copy_from_slice(data),
    }
}

#[tokio::test]
async fn upload_happy_path() {
    let server = start_server().await;
    let dir = tempfile::tempdir().unwrap();
    let (_session, mut ws) = upload_session(&server, dir.path()).await;

    ws.send_frame(file_start(10, b"hi.txt")).await;
    ws.expect_ack(AckStatus::Progress, "").await;

    ws.send_frame(file_chunk(0, b"helloworld")).await;
    ws.expect_ack(AckStatus::Success, "hi.txt").await;

    let content = std::fs::read(dir.path().join("hi.txt")).unwrap();
    assert_eq!(content, b"helloworld");
}

#[tokio::test]
async fn upload_in_multiple_chunks() {
    let server = start_server().await;
    let dir = tempfile::tempdir().unwrap();
    let (_session, mut ws) = upload_session(&server, dir.path()).await;

    ws.send_frame(file_start(12, b"chunked.bin")).await;
    ws.expect_ack(AckStatus::Progress, "").await;

    ws.send_frame(file_chunk(0, b"first-")).await;
    ws.expect_ack(AckStatus::Progress, "").await;
    ws.send_frame(file_chunk(6, b"second")).await;
    ws.expect_ack(AckStatus::Success, "chunked.bin").await;

    let content = std::fs::read(dir.path().join("chunked.bin")).unwrap();
    assert_eq!(content, b"first-second");
}

#[tokio::test]
async fn rejected_filenames_create_no_files() {
    let server = start_server().await;
    let dir = tempfile::tempdir().unwrap();
    let (_session, mut ws) = upload_session(&server, dir.path()).await;

    let bad_names: [&[u8]; 5] = [b"", b".hidden", b"a/b", b"..\\x", b"a\x01b"];
    for name in bad_names {
        ws.send_frame(file_start(10, name)).await;
        ws.expect_ack(AckStatus::Error, "invalid filename").await;
    }
    assert_eq!(
        std::fs::read_dir(dir.path()).unwrap().count(),
        0,
        "no files may be created for rejected names"
    );
}

#[tokio::test]
async fn oversized_declaration_rejected() {
    let server = start_server().await;
    let dir = tempfile::tempdir().unwrap();
    let (_session, mut ws) = upload_session(&server, dir.path()).await;

    ws.send_frame(file_start(101 * 1024 * 1024, b"big.bin")).await;
    ws.expect_ack(AckStatus::Error, "file too large (max 100MB)").await;
    assert!(!dir.path().join("big.bin").exists());
}

#[tokio::test]
async fn existing_file_is_never_overwritten() {
    let server = start_server().await;
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("keep.txt"), b"original").unwrap();
    let (_session, mut ws) = upload_session(&server, dir.path()).await;

    ws.send_frame(file_start(5, b"keep.txt")).await;
    ws.expect_ack(AckStatus::Error, "file already exists").await;
    assert_eq!(
        std::fs::read(dir.path().join("keep.txt")).unwrap(),
        b"original"
    );
}

#[tokio::test]
async fn offset_mismatch_aborts_transfer() {
    let server = start_server().await;
    let dir = tempfile::tempdir().unwrap();
    let (_session, mut ws) = upload_session(&server, dir.path()).await;

    ws.send_frame(file_start(10, b"x")).await;
    ws.expect_ack(AckStatus::Progress, "").await;

    ws.send_frame(file_chunk(5, b"hello")).await;
    ws.expect_ack(AckStatus::Error, "offset mismatch").await;

    // The transfer is gone; later chunks have nothing to land in.
    ws.send_frame(file_chunk(0, b"hello")).await;
    ws.expect_ack(AckStatus::Error, "no active transfer").await;

    assert!(
        !dir.path().join("x").exists(),
        "partial file must be removed on abort"
    );
}

#[tokio::test]
async fn new_start_replaces_inflight_transfer() {
    let server = start_server().await;
    let dir = tempfile::tempdir().unwrap();
    let (_session, mut ws) = upload_session(&server, dir.path()).await;

    ws.send_frame(file_start(100, b"abandoned.bin")).await;
    ws.expect_ack(AckStatus::Progress, "").await;
    ws.send_frame(file_chunk(0, b"partial")).await;
    ws.expect_ack(AckStatus::Progress, "").await;

    // Starting a new upload silently drops the old one and its partial file.
    ws.send_frame(file_start(4, b"fresh.bin")).await;
    ws.expect_ack(AckStatus::Progress, "").await;
    ws.send_frame(file_chunk(0, b"data")).await;
    ws.expect_ack(AckStatus::Success, "fresh.bin").await;

    assert!(!dir.path().join("abandoned.bin").exists());
    assert_eq!(std::fs::read(dir.path().join("fresh.bin")).unwrap(), b"data");
}

#[tokio::test]
async fn viewer_cannot_upload() {
    let server = start_server().await;
    let dir = tempfile::tempdir().unwrap();
    let (session, mut writer_ws) = upload_session(&server, dir.path()).await;

    let mut viewer = server.connect_stream(&session.id).await;
    viewer.resize(80, 24).await;
    viewer.expect_write_state(false).await;

    viewer.send_frame(file_start(10, b"blocked.txt")).await;
    viewer
        .expect_ack(AckStatus::Error, "viewer cannot upload files")
        .await;
    assert!(!dir.path().join("blocked.txt").exists());

    // The writer is unaffected.
    writer_ws.send_frame(file_start(2, b"ok.txt")).await;
    writer_ws.expect_ack(AckStatus::Progress, "").await;
    writer_ws.send_frame(file_chunk(0, b"ok")).await;
    writer_ws.expect_ack(AckStatus::Success, "ok.txt").await;
}

#[tokio::test]
async fn disconnect_discards_partial_upload() {
    let server = start_server().await;
    let dir = tempfile::tempdir().unwrap();
    let (_session, mut ws) = upload_session(&server, dir.path()).await;

    ws.send_frame(file_start(100, b"dropped.bin")).await;
    ws.expect_ack(AckStatus::Progress, "").await;
    ws.send_frame(file_chunk(0, b"some bytes")).await;
    ws.expect_ack(AckStatus::Progress, "").await;

    ws.close().await;

    // The partial file is unlinked during disconnect cleanup.
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
    while dir.path().join("dropped.bin").exists() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "partial upload still on disk after disconnect"
        );
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
}
