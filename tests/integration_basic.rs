//! End-to-end exercise of the full stack over a real TCP connection: accept
//! loop, session dispatch, routing, and a KeyManager/ValueNode pair.

use curiodb::config::Config;
use curiodb::server;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

async fn start_server() -> String {
    let mut config = Config::default();
    config.listen = "127.0.0.1:0".to_string();
    config.keynodes = 2;
    let dir = tempfile::tempdir().unwrap();
    config.data_dir = dir.into_path();

    // Port 0 means the OS picks a free port; bind it ourselves here so the
    // test knows the address before the server takes ownership of the
    // listener inside `server::run`.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    config.listen = addr.to_string();

    tokio::spawn(async move {
        server::run(config).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    addr.to_string()
}

fn encode(args: &[&str]) -> Vec<u8> {
    let mut buf = format!("*{}\r\n", args.len()).into_bytes();
    for arg in args {
        buf.extend(format!("${}\r\n{}\r\n", arg.len(), arg).into_bytes());
    }
    buf
}

async fn roundtrip(stream: &mut TcpStream, args: &[&str]) -> String {
    stream.write_all(&encode(args)).await.unwrap();
    let mut buf = vec![0u8; 4096];
    let n = stream.read(&mut buf).await.unwrap();
    String::from_utf8_lossy(&buf[..n]).to_string()
}

#[tokio::test]
async fn ping_without_arguments_replies_pong() {
    let addr = start_server().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let reply = roundtrip(&mut stream, &["PING"]).await;
    assert_eq!(reply, "+PONG\r\n");
}

#[tokio::test]
async fn set_then_get_round_trips_through_a_value_node() {
    let addr = start_server().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let reply = roundtrip(&mut stream, &["SET", "greeting", "hello"]).await;
    assert_eq!(reply, "+OK\r\n");

    let reply = roundtrip(&mut stream, &["GET", "greeting"]).await;
    assert_eq!(reply, "$5\r\nhello\r\n");
}

#[tokio::test]
async fn get_of_a_missing_key_is_nil() {
    let addr = start_server().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let reply = roundtrip(&mut stream, &["GET", "nosuchkey"]).await;
    assert_eq!(reply, "$-1\r\n");
}

#[tokio::test]
async fn select_out_of_range_is_rejected() {
    let addr = start_server().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let reply = roundtrip(&mut stream, &["SELECT", "999"]).await;
    assert!(reply.starts_with('-'));
}

#[tokio::test]
async fn mget_fans_out_across_partitions() {
    let addr = start_server().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    assert_eq!(roundtrip(&mut stream, &["SET", "a", "1"]).await, "+OK\r\n");
    assert_eq!(roundtrip(&mut stream, &["SET", "b", "2"]).await, "+OK\r\n");

    let reply = roundtrip(&mut stream, &["MGET", "a", "b", "missing"]).await;
    assert_eq!(reply, "*3\r\n$1\r\n1\r\n$1\r\n2\r\n$-1\r\n");
}
