//! Wire-level checks against a live listener: the eight-byte header
//! exchange and what happens to peers that get it wrong.

use compio::buf::BufResult;
use compio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use compio::net::TcpStream;
use std::net::SocketAddr;

use spaceframe::{pair, wire};

async fn read_to_eof(stream: &mut TcpStream, cap: usize) -> Vec<u8> {
    let mut total = Vec::new();
    loop {
        let BufResult(res, buf) = stream.read(vec![0u8; 64]).await;
        match res {
            Ok(0) | Err(_) => return total,
            Ok(n) => {
                total.extend_from_slice(&buf[..n]);
                assert!(total.len() <= cap, "peer kept talking past the handshake");
            }
        }
    }
}

fn raw_addr(url: &str) -> SocketAddr {
    url.strip_prefix("tcp://").unwrap().parse().unwrap()
}

#[compio::test]
async fn garbage_header_is_disconnected() {
    let server = pair::socket();
    let l = server.new_listener("tcp://127.0.0.1:0", &[]).unwrap();
    l.listen().await.unwrap();

    let mut stream = TcpStream::connect(raw_addr(&l.address())).await.unwrap();
    let BufResult(res, _) = stream.write_all(vec![0xFFu8; 8]).await;
    res.unwrap();

    // The listener speaks first with its own header, then hangs up on us.
    // No application frame may follow.
    let bytes = read_to_eof(&mut stream, 64).await;
    assert!(bytes.len() <= 8);

    server.close().await.unwrap();
}

#[compio::test]
async fn wrong_version_is_disconnected() {
    let server = pair::socket();
    let l = server.new_listener("tcp://127.0.0.1:0", &[]).unwrap();
    l.listen().await.unwrap();

    let mut header = wire::encode_handshake(wire::PROTO_PAIR).to_vec();
    header[3] = 9;

    let mut stream = TcpStream::connect(raw_addr(&l.address())).await.unwrap();
    let BufResult(res, _) = stream.write_all(header).await;
    res.unwrap();

    let bytes = read_to_eof(&mut stream, 64).await;
    assert!(bytes.len() <= 8);

    server.close().await.unwrap();
}

#[compio::test]
async fn correct_header_stays_connected() {
    let server = pair::socket();
    let l = server.new_listener("tcp://127.0.0.1:0", &[]).unwrap();
    l.listen().await.unwrap();

    let mut stream = TcpStream::connect(raw_addr(&l.address())).await.unwrap();
    let BufResult(res, _) = stream
        .write_all(wire::encode_handshake(wire::PROTO_PAIR).to_vec())
        .await;
    res.unwrap();

    // The peer's half of the exchange comes back and the stream stays up.
    let hdr = [0u8; 8];
    let BufResult(res, hdr) = stream.read_exact(hdr).await;
    res.unwrap();
    assert!(wire::check_handshake(&hdr, wire::PROTO_PAIR).is_ok());

    // An application frame now flows: length, then empty header + body.
    let mut frame = 5u64.to_be_bytes().to_vec();
    frame.extend_from_slice(b"hello");
    let BufResult(res, _) = stream.write_all(frame).await;
    res.unwrap();

    server
        .set_option(
            spaceframe::options::OPT_RECV_DEADLINE,
            spaceframe::OptionValue::Duration(std::time::Duration::from_secs(5)),
        )
        .unwrap();
    assert_eq!(server.recv().await.unwrap(), b"hello");

    server.close().await.unwrap();
}
