//! Handle-level semantics: OSARGS, OSGBPB, the handle range and open-file
//! conflict rules, driven through wire-shaped requests.

use std::path::Path;
use std::sync::Arc;

use beeblink::config::Config;
use beeblink::fs::{scan_volumes, VOLUME_MARKER};
use beeblink::wire::{Request, RequestCode, Response, ResponseCode};
use beeblink::{ServerContext, Session};

async fn session_with_volume(root: &Path) -> Session {
    let volume = root.join("V");
    tokio::fs::create_dir_all(volume.join("0")).await.unwrap();
    tokio::fs::write(volume.join(VOLUME_MARKER), "dfs\n").await.unwrap();
    let volumes = scan_volumes(&[root.to_path_buf()]).await.unwrap();
    let ctx = ServerContext::new(Arc::new(volumes), Arc::new(Config::default()), None);
    Session::new(&ctx).unwrap()
}

async fn roundtrip(session: &mut Session, code: RequestCode, payload: Vec<u8>) -> Response {
    session
        .handle_request(&Request::new(code as u8, payload))
        .await
        .expect("response expected")
}

async fn save_file(session: &mut Session, name: &str, data: &[u8]) {
    let mut payload = vec![0u8];
    payload.extend_from_slice(&[0u8; 16]);
    payload.extend_from_slice(name.as_bytes());
    payload.push(0x0d);
    payload.extend_from_slice(data);
    let response = roundtrip(session, RequestCode::Osfile, payload).await;
    assert_eq!(response.code, ResponseCode::Osfile);
}

async fn open(session: &mut Session, mode: u8, name: &str) -> Response {
    let mut payload = vec![mode];
    payload.extend_from_slice(name.as_bytes());
    payload.push(0x0d);
    roundtrip(session, RequestCode::OsfindOpen, payload).await
}

fn osargs_payload(a: u8, handle: u8, value: u32) -> Vec<u8> {
    let mut payload = vec![a, handle];
    payload.extend_from_slice(&value.to_le_bytes());
    payload
}

fn osargs_value(response: &Response) -> u32 {
    assert_eq!(response.code, ResponseCode::Osargs);
    u32::from_le_bytes(response.payload[..4].try_into().unwrap())
}

fn osgbpb_payload(a: u8, handle: u8, size: u32, ptr: u32, data: &[u8]) -> Vec<u8> {
    let mut payload = vec![a, handle];
    payload.extend_from_slice(&size.to_le_bytes());
    payload.extend_from_slice(&ptr.to_le_bytes());
    payload.extend_from_slice(data);
    payload
}

#[tokio::test]
async fn osargs_pointer_and_extent() {
    let root = tempfile::tempdir().unwrap();
    let mut session = session_with_volume(root.path()).await;
    save_file(&mut session, "$.DATA", &[0xaa, 0xbb, 0xcc]).await;

    let handle = open(&mut session, 0x40, "$.DATA").await.payload[0];
    assert_ne!(handle, 0);

    // EXT
    let ext = roundtrip(&mut session, RequestCode::Osargs, osargs_payload(2, handle, 0)).await;
    assert_eq!(osargs_value(&ext), 3);

    // set PTR, read the byte there
    roundtrip(&mut session, RequestCode::Osargs, osargs_payload(1, handle, 1)).await;
    let byte = roundtrip(&mut session, RequestCode::Osbget, vec![handle]).await;
    assert_eq!(byte.payload, [0xbb]);

    // PTR moved on
    let ptr = roundtrip(&mut session, RequestCode::Osargs, osargs_payload(0, handle, 0)).await;
    assert_eq!(osargs_value(&ptr), 2);

    // setting EXT on a read handle is refused
    let response =
        roundtrip(&mut session, RequestCode::Osargs, osargs_payload(3, handle, 1)).await;
    assert_eq!(response.code, ResponseCode::Error);
    assert_eq!(response.payload[1], 193);
}

#[tokio::test]
async fn osargs_identity_and_flush() {
    let root = tempfile::tempdir().unwrap();
    let mut session = session_with_volume(root.path()).await;

    // A=0 with handle 0: the filing system identity
    let id = roundtrip(&mut session, RequestCode::Osargs, osargs_payload(0, 0, 0)).await;
    assert_eq!(osargs_value(&id), 0x14);

    // a buffered write reaches the host on OSARGS flush
    let handle = open(&mut session, 0x80, "$.FLUSH").await.payload[0];
    roundtrip(&mut session, RequestCode::Osbput, vec![handle, 0x42]).await;
    roundtrip(&mut session, RequestCode::Osargs, osargs_payload(0xff, handle, 0)).await;
    let contents = tokio::fs::read(root.path().join("V/0/$.FLUSH")).await.unwrap();
    assert_eq!(contents, [0x42]);
}

#[tokio::test]
async fn osgbpb_block_transfers() {
    let root = tempfile::tempdir().unwrap();
    let mut session = session_with_volume(root.path()).await;

    let handle = open(&mut session, 0x80, "$.BLOCK").await.payload[0];

    // A=1: write at a given pointer
    let response = roundtrip(
        &mut session,
        RequestCode::Osgbpb,
        osgbpb_payload(1, handle, 4, 0, b"ABCD"),
    )
    .await;
    assert_eq!(response.payload[0], 0); // no carry
    assert_eq!(&response.payload[5..9], &4u32.to_le_bytes()); // new ptr

    // A=3: read from pointer 1, asking for more than remains
    let response = roundtrip(
        &mut session,
        RequestCode::Osgbpb,
        osgbpb_payload(3, handle, 8, 1, &[]),
    )
    .await;
    assert_eq!(response.payload[0], 1); // carry: short transfer
    assert_eq!(&response.payload[1..5], &5u32.to_le_bytes()); // residual
    assert_eq!(&response.payload[5..9], &4u32.to_le_bytes()); // ptr at EOF
    assert_eq!(&response.payload[9..], b"BCD");
}

#[tokio::test]
async fn osgbpb_media_and_directory_info() {
    let root = tempfile::tempdir().unwrap();
    let mut session = session_with_volume(root.path()).await;

    roundtrip(&mut session, RequestCode::StarCommand, b"TITLE MYDISC".to_vec()).await;
    roundtrip(&mut session, RequestCode::Opt, vec![4, 2]).await;
    roundtrip(&mut session, RequestCode::StarCommand, b"DIR :1.W".to_vec()).await;
    roundtrip(&mut session, RequestCode::StarCommand, b"LIB :0.L".to_vec()).await;

    // A=5 reports the current drive's title and boot option
    roundtrip(&mut session, RequestCode::StarCommand, b"DRIVE 0".to_vec()).await;
    let response =
        roundtrip(&mut session, RequestCode::Osgbpb, osgbpb_payload(5, 0, 0, 0, &[])).await;
    assert_eq!(&response.payload[9..], b"\x06MYDISC\x02\x30");

    // A=6 and A=7: CSD and library
    roundtrip(&mut session, RequestCode::StarCommand, b"DIR :1.W".to_vec()).await;
    let response =
        roundtrip(&mut session, RequestCode::Osgbpb, osgbpb_payload(6, 0, 0, 0, &[])).await;
    assert_eq!(&response.payload[9..], b"\x011\x01W");
    let response =
        roundtrip(&mut session, RequestCode::Osgbpb, osgbpb_payload(7, 0, 0, 0, &[])).await;
    assert_eq!(&response.payload[9..], b"\x010\x01L");
}

#[tokio::test]
async fn handle_range_and_exhaustion() {
    let root = tempfile::tempdir().unwrap();
    let mut session = session_with_volume(root.path()).await;

    let response =
        roundtrip(&mut session, RequestCode::SetFileHandleRange, vec![0xb0, 0xb1]).await;
    assert_eq!(response.code, ResponseCode::Yes);

    assert_eq!(open(&mut session, 0x80, "$.ONE").await.payload, [0xb0]);
    assert_eq!(open(&mut session, 0x80, "$.TWO").await.payload, [0xb1]);

    let response = open(&mut session, 0x80, "$.THREE").await;
    assert_eq!(response.code, ResponseCode::Error);
    assert_eq!(response.payload[1], 192);
}

#[tokio::test]
async fn open_conflicts() {
    let root = tempfile::tempdir().unwrap();
    let mut session = session_with_volume(root.path()).await;
    save_file(&mut session, "$.SHARED", b"x").await;

    // two readers are fine
    let first = open(&mut session, 0x40, "$.SHARED").await.payload[0];
    let second = open(&mut session, 0x40, "$.SHARED").await.payload[0];
    assert_ne!(first, 0);
    assert_ne!(second, 0);
    assert_ne!(first, second);

    // a writer on an already-open file is not
    let response = open(&mut session, 0xc0, "$.SHARED").await;
    assert_eq!(response.code, ResponseCode::Error);
    assert_eq!(response.payload[1], 194);

    // reading a missing file quietly fails with handle 0
    let response = open(&mut session, 0x40, "$.MISSING").await;
    assert_eq!(response.code, ResponseCode::Osfind);
    assert_eq!(response.payload, [0]);
}

#[tokio::test]
async fn update_mode_keeps_existing_contents() {
    let root = tempfile::tempdir().unwrap();
    let mut session = session_with_volume(root.path()).await;
    save_file(&mut session, "$.KEEP", b"old").await;

    // 0xC0 opens for update without truncating
    let handle = open(&mut session, 0xc0, "$.KEEP").await.payload[0];
    let ext = roundtrip(&mut session, RequestCode::Osargs, osargs_payload(2, handle, 0)).await;
    assert_eq!(osargs_value(&ext), 3);

    // 0x80 truncates
    roundtrip(&mut session, RequestCode::OsfindClose, vec![handle]).await;
    let handle = open(&mut session, 0x80, "$.KEEP").await.payload[0];
    let ext = roundtrip(&mut session, RequestCode::Osargs, osargs_payload(2, handle, 0)).await;
    assert_eq!(osargs_value(&ext), 0);
}
