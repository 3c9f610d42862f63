//! PAIR sockets end to end: plain round trips, peer exclusivity, handshake
//! policing, and port hooks.

use std::rc::Rc;
use std::time::Duration;

use spaceframe::options::OPT_RECV_DEADLINE;
use spaceframe::{pair, publish, Error, OptionValue, PortAction};

fn deadline(sock: &spaceframe::Socket, d: Duration) {
    sock.set_option(OPT_RECV_DEADLINE, OptionValue::Duration(d))
        .unwrap();
}

#[compio::test]
async fn tcp_round_trip() {
    let node0 = pair::socket();
    let l = node0.new_listener("tcp://127.0.0.1:0", &[]).unwrap();
    l.listen().await.unwrap();
    let addr = l.address();

    let node1 = pair::socket();
    node1.dial(&addr).unwrap();

    deadline(&node0, Duration::from_secs(5));
    deadline(&node1, Duration::from_secs(5));

    node1.send(b"hello").await.unwrap();
    let msg = node0.recv_msg().await.unwrap();
    assert_eq!(msg.body(), b"hello");
    assert!(msg.header().is_empty());

    // And back the other way.
    node0.send(b"world").await.unwrap();
    assert_eq!(node1.recv().await.unwrap(), b"world");

    node1.close().await.unwrap();
    node0.close().await.unwrap();
}

#[compio::test]
async fn inproc_round_trip() {
    let node0 = pair::socket();
    node0.listen("inproc://pair-smoke").await.unwrap();

    let node1 = pair::socket();
    node1.dial("inproc://pair-smoke").unwrap();

    deadline(&node0, Duration::from_secs(5));

    node1.send(b"ping").await.unwrap();
    assert_eq!(node0.recv().await.unwrap(), b"ping");

    node1.close().await.unwrap();
    node0.close().await.unwrap();
}

#[compio::test]
async fn header_and_body_travel_together() {
    let node0 = pair::socket();
    let l = node0.new_listener("tcp://127.0.0.1:0", &[]).unwrap();
    l.listen().await.unwrap();

    let node1 = pair::socket();
    node1.dial(&l.address()).unwrap();
    deadline(&node0, Duration::from_secs(5));

    // On the wire a frame is one contiguous header‖body payload; the
    // receiving side owns the split, and for patterns without routing
    // headers everything lands in the body.
    let mut msg = spaceframe::Message::from_body(b"-body");
    msg.header_mut().extend_from_slice(b"head");
    node1.send_msg(msg).await.unwrap();

    let got = node0.recv_msg().await.unwrap();
    assert!(got.header().is_empty());
    assert_eq!(got.body(), b"head-body");

    node1.close().await.unwrap();
    node0.close().await.unwrap();
}

#[compio::test]
async fn second_peer_is_rejected() {
    let server = pair::socket();
    let l = server.new_listener("tcp://127.0.0.1:0", &[]).unwrap();
    l.listen().await.unwrap();
    let addr = l.address();

    let first = pair::socket();
    first.dial(&addr).unwrap();

    deadline(&server, Duration::from_secs(5));
    first.send(b"one").await.unwrap();
    assert_eq!(server.recv().await.unwrap(), b"one");

    // The second connection completes its handshake and is then dropped;
    // nothing it sends may surface.
    let second = pair::socket();
    second.dial(&addr).unwrap();
    compio::time::sleep(Duration::from_millis(200)).await;
    let _ = second.send(b"two").await;

    deadline(&server, Duration::from_millis(300));
    assert!(matches!(server.recv().await, Err(Error::RecvTimeout)));

    // The original peer still works.
    deadline(&server, Duration::from_secs(5));
    first.send(b"three").await.unwrap();
    assert_eq!(server.recv().await.unwrap(), b"three");

    second.close().await.unwrap();
    first.close().await.unwrap();
    server.close().await.unwrap();
}

#[compio::test]
async fn mismatched_protocols_never_connect() {
    let server = publish::socket();
    let l = server.new_listener("tcp://127.0.0.1:0", &[]).unwrap();
    l.listen().await.unwrap();
    let addr = l.address();

    // PAIR is not a valid peer for PUB; both sides tear the stream down at
    // the handshake and the dialer just keeps retrying.
    let client = pair::socket();
    client.dial(&addr).unwrap();

    deadline(&client, Duration::from_millis(400));
    assert!(matches!(client.recv().await, Err(Error::RecvTimeout)));

    client.close().await.unwrap();
    server.close().await.unwrap();
}

#[compio::test]
async fn port_hook_can_veto_peers() {
    let server = pair::socket();
    // Refuse every inbound connection; removals pass through.
    let veto: spaceframe::PortHook = Rc::new(|action, port: &spaceframe::Endpoint| {
        !(action == PortAction::Add && port.is_server())
    });
    server.set_port_hook(Some(veto));

    let l = server.new_listener("tcp://127.0.0.1:0", &[]).unwrap();
    l.listen().await.unwrap();
    let addr = l.address();

    let client = pair::socket();
    client.dial(&addr).unwrap();
    compio::time::sleep(Duration::from_millis(200)).await;

    let _ = client.send(b"nope").await;
    deadline(&server, Duration::from_millis(300));
    assert!(matches!(server.recv().await, Err(Error::RecvTimeout)));

    // Dropping the hook lets the next reconnect through.
    server.set_port_hook(None);
    deadline(&server, Duration::from_secs(5));
    client.send(b"finally").await.unwrap();
    assert_eq!(server.recv().await.unwrap(), b"finally");

    client.close().await.unwrap();
    server.close().await.unwrap();
}
