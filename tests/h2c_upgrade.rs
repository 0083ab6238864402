//! The clear-text upgrade path: an HTTP/1.1 request carrying
//! `Upgrade: h2c` is answered with `101 Switching Protocols` and becomes
//! stream 1 of an HTTP/2 connection on the same socket.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use blixt::http::h2::frame::{
    HEADER_LEN, Head, Kind, PREFACE, Settings, StreamId, encode_headers_frames, flags,
};
use blixt::http::parser::Parser;
use blixt::http::{Http1Parser, Http2Parser, HttpRouter, default_app};
use blixt::server::Connection;
use blixt::{Application, Request, Response};

fn candidates() -> Vec<Box<dyn Parser>> {
    vec![
        Box::new(Http2Parser::new()),
        Box::new(Http1Parser::new()),
    ]
}

async fn started(router: HttpRouter) -> Arc<Application> {
    let mut app = default_app(router).unwrap();
    app.start().await.unwrap();
    Arc::new(app)
}

fn settings_token() -> String {
    let mut settings = Settings::new();
    settings.initial_window_size = Some(65_535);
    let mut frame = BytesMut::new();
    settings.encode(&mut frame);
    URL_SAFE_NO_PAD.encode(&frame[HEADER_LEN..])
}

#[tokio::test]
async fn upgrade_request_becomes_stream_one() {
    let mut router = HttpRouter::new();
    router
        .get("/first", |req: Request| async move {
            Response::new(200, format!("stream={}", req.stream()))
        })
        .unwrap();
    router
        .get("/second", |_req: Request| async { Response::new(200, "next") })
        .unwrap();
    let app = started(router).await;

    let (server_io, mut client) = tokio::io::duplex(64 * 1024);
    let conn = tokio::spawn(Connection::new(app, None).serve(server_io, candidates()));

    let upgrade = format!(
        "GET /first HTTP/1.1\r\nhost: t\r\nconnection: upgrade, http2-settings\r\nupgrade: h2c\r\nhttp2-settings: {}\r\n\r\n",
        settings_token()
    );
    client.write_all(upgrade.as_bytes()).await.unwrap();

    // the 101 arrives as http/1.1 text before any frames
    let mut preamble = Vec::new();
    while !preamble.windows(4).any(|w| w == b"\r\n\r\n") {
        let mut byte = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut byte))
            .await
            .expect("timed out waiting for 101")
            .unwrap();
        assert!(n > 0);
        preamble.extend_from_slice(&byte);
    }
    let text = String::from_utf8(preamble).unwrap();
    assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"), "got {text}");

    // client completes the upgrade: preface plus its real SETTINGS
    let mut wire = BytesMut::new();
    wire.extend_from_slice(PREFACE);
    Settings::new().encode(&mut wire);
    client.write_all(&wire).await.unwrap();

    // stream 1 carries the upgraded request's response
    let frames = read_frames_until(&mut client, |frames| data_end_of(frames, 1)).await;
    let mut decoder = hpack::Decoder::new();
    let (_, headers_payload) = frames
        .iter()
        .find(|(head, _)| head.kind() == Kind::Headers && u32::from(head.stream_id()) == 1)
        .expect("response headers on stream 1");
    let decoded = decoder.decode(headers_payload).unwrap();
    assert!(decoded.iter().any(|(n, v)| n == b":status" && v == b"200"));
    let (_, body) = frames
        .iter()
        .find(|(head, _)| head.kind() == Kind::Data && u32::from(head.stream_id()) == 1)
        .unwrap();
    assert_eq!(body.as_ref(), b"stream=1");

    // subsequent streams parse normally on the same socket
    let mut encoder = hpack::Encoder::new();
    let pairs: Vec<(Vec<u8>, Vec<u8>)> = vec![
        (b":method".to_vec(), b"GET".to_vec()),
        (b":path".to_vec(), b"/second".to_vec()),
        (b":scheme".to_vec(), b"http".to_vec()),
    ];
    let block = encoder.encode(pairs.iter().map(|(n, v)| (n.as_slice(), v.as_slice())));
    let mut wire = BytesMut::new();
    for frame in encode_headers_frames(StreamId::from(3), &block, true, 16_384) {
        wire.extend_from_slice(&frame);
    }
    client.write_all(&wire).await.unwrap();

    let frames = read_frames_until(&mut client, |frames| data_end_of(frames, 3)).await;
    let (_, body) = frames
        .iter()
        .find(|(head, _)| head.kind() == Kind::Data && u32::from(head.stream_id()) == 3)
        .unwrap();
    assert_eq!(body.as_ref(), b"next");

    drop(client);
    conn.await.unwrap();
}

#[tokio::test]
async fn plain_h1_still_works_when_upgrade_is_absent() {
    let mut router = HttpRouter::new();
    router
        .get("/plain", |_req: Request| async { Response::new(200, "h1") })
        .unwrap();
    let app = started(router).await;

    let (server_io, mut client) = tokio::io::duplex(16 * 1024);
    let conn = tokio::spawn(Connection::new(app, None).serve(server_io, candidates()));

    client
        .write_all(b"GET /plain HTTP/1.1\r\nhost: t\r\nconnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut out = Vec::new();
    client.read_to_end(&mut out).await.unwrap();
    let text = String::from_utf8(out).unwrap();
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "got {text}");
    assert!(text.ends_with("h1"), "got {text}");
    conn.await.unwrap();
}

async fn read_frames_until(
    client: &mut tokio::io::DuplexStream,
    enough: impl Fn(&[(Head, Bytes)]) -> bool,
) -> Vec<(Head, Bytes)> {
    let mut buf = BytesMut::new();
    let mut frames: Vec<(Head, Bytes)> = Vec::new();
    loop {
        if enough(&frames) {
            return frames;
        }
        let mut chunk = [0u8; 4096];
        let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut chunk))
            .await
            .expect("timed out waiting for frames")
            .expect("read failed");
        assert!(n > 0, "unexpected eof; frames so far: {frames:?}");
        buf.extend_from_slice(&chunk[..n]);
        while buf.len() >= HEADER_LEN {
            let (head, len) = Head::parse(&buf);
            if buf.len() < HEADER_LEN + len {
                break;
            }
            buf.advance(HEADER_LEN);
            frames.push((head, buf.split_to(len).freeze()));
        }
    }
}

fn data_end_of(frames: &[(Head, Bytes)], stream: u32) -> bool {
    frames.iter().any(|(head, _)| {
        head.kind() == Kind::Data
            && u32::from(head.stream_id()) == stream
            && head.flag() & flags::END_STREAM != 0
    })
}
