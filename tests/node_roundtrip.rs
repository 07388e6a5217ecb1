//
// Copyright (c) 2022 chiya.dev
//
// Use of this source code is governed by the MIT License
// which can be found in the LICENSE file and at:
//
//   https://opensource.org/licenses/MIT
//
use std::time::Duration;
use stria::{client::Client, disk::DiskStore, node::NodeService, proto::NodeServer};
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
};
use tokio_util::sync::CancellationToken;

/// Binds a real storage node on an ephemeral port and runs it until the
/// returned token is dropped by the test.
async fn start_node() -> (tempfile::TempDir, String, CancellationToken) {
    let dir = tempfile::tempdir().unwrap();
    let store = DiskStore::new(dir.path()).unwrap();

    let server = NodeServer::bind(0, NodeService::new(store)).await.unwrap();
    let addr = format!("127.0.0.1:{}", server.local_addr().unwrap().port());

    let cancel = CancellationToken::new();
    tokio::spawn(server.run(cancel.clone()));

    (dir, addr, cancel)
}

#[tokio::test]
async fn save_then_get_round_trips() {
    let (_dir, addr, _cancel) = start_node().await;
    let client = Client::new(addr);

    let payload: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();
    client
        .save_file("f.0", &mut &payload[..], payload.len() as i64)
        .await
        .unwrap();

    let mut output = Vec::new();
    client
        .get_file("f.0", &mut output, payload.len() as i64)
        .await
        .unwrap();

    assert_eq!(output, payload);
}

#[tokio::test]
async fn empty_payload_round_trips() {
    let (_dir, addr, _cancel) = start_node().await;
    let client = Client::new(addr);

    client.save_file("empty", &mut &b""[..], 0).await.unwrap();

    let mut output = Vec::new();
    client.get_file("empty", &mut output, 0).await.unwrap();
    assert!(output.is_empty());
}

#[tokio::test]
async fn save_header_framing_yields_written_count() {
    let (dir, addr, _cancel) = start_node().await;

    let mut stream = TcpStream::connect(&addr).await.unwrap();
    stream.write_all(b"save_file:10:x\n").await.unwrap();
    stream.write_all(b"0123456789").await.unwrap();

    let mut reader = BufReader::new(stream);
    let mut response = String::new();
    reader.read_line(&mut response).await.unwrap();
    assert_eq!(response, "10\n");

    assert_eq!(std::fs::read(dir.path().join("x")).unwrap(), b"0123456789");
}

#[tokio::test]
async fn unknown_verb_closes_without_reply() {
    let (_dir, addr, _cancel) = start_node().await;

    let mut stream = TcpStream::connect(&addr).await.unwrap();
    stream.write_all(b"nope:x\n").await.unwrap();

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    assert!(response.is_empty());
}

#[tokio::test]
async fn invalid_object_name_fails_the_save() {
    let (_dir, addr, _cancel) = start_node().await;
    let client = Client::new(addr);

    let result = client.save_file("a/b", &mut &b"bytes"[..], 5).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn delete_through_the_wire_is_idempotent() {
    let (dir, addr, _cancel) = start_node().await;
    let client = Client::new(addr);

    client.save_file("f.0", &mut &b"bytes"[..], 5).await.unwrap();

    // deletes carry no acknowledgement; poll for the blob to disappear
    client.delete_file("f.0").await.unwrap();
    let path = dir.path().join("f.0");
    for _ in 0..100 {
        if !path.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(!path.exists());

    client.delete_file("f.0").await.unwrap();
}

#[tokio::test]
async fn short_get_is_reported_in_the_trailer_but_succeeds() {
    let (_dir, addr, _cancel) = start_node().await;
    let client = Client::new(addr);

    client.save_file("f.0", &mut &b"01234"[..], 5).await.unwrap();

    // asking for less than the blob holds is the client's business; the
    // node only logs the trailer mismatch
    let mut output = Vec::new();
    client.get_file("f.0", &mut output, 3).await.unwrap();
    assert_eq!(output, b"012");
}

#[tokio::test]
async fn written_count_mismatch_fails_the_save() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    // a node that under-reports what it persisted
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut reader = BufReader::new(stream);

        let mut header = String::new();
        reader.read_line(&mut header).await.unwrap();
        assert_eq!(header, "save_file:5:x\n");

        let mut payload = [0u8; 5];
        reader.read_exact(&mut payload).await.unwrap();

        reader.into_inner().write_all(b"4\n").await.unwrap();
    });

    let client = Client::new(addr);
    let err = client
        .save_file("x", &mut &b"01234"[..], 5)
        .await
        .unwrap_err();
    assert!(err
        .to_string()
        .contains("written size does not match file size"));
}

#[tokio::test]
async fn error_trailer_fails_the_save() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut reader = BufReader::new(stream);

        let mut header = String::new();
        reader.read_line(&mut header).await.unwrap();

        let mut payload = [0u8; 5];
        reader.read_exact(&mut payload).await.unwrap();

        reader
            .into_inner()
            .write_all(b"error:disk full\n")
            .await
            .unwrap();
    });

    let client = Client::new(addr);
    let err = client
        .save_file("x", &mut &b"01234"[..], 5)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("failed to parse written size"));
}
