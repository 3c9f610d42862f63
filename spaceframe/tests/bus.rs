//! BUS meshes: everyone hears a message once, and nobody hears their own.

use std::time::Duration;

use spaceframe::options::OPT_RECV_DEADLINE;
use spaceframe::{bus, Error, OptionValue};

fn deadline(sock: &spaceframe::Socket, d: Duration) {
    sock.set_option(OPT_RECV_DEADLINE, OptionValue::Duration(d))
        .unwrap();
}

#[compio::test]
async fn ring_delivery_without_loopback() {
    // Three nodes, each listening once and dialing the next: every node
    // ends up with a pipe to both of the others.
    let node0 = bus::socket();
    let node1 = bus::socket();
    let node2 = bus::socket();

    let l0 = node0.new_listener("tcp://127.0.0.1:0", &[]).unwrap();
    l0.listen().await.unwrap();
    let l1 = node1.new_listener("tcp://127.0.0.1:0", &[]).unwrap();
    l1.listen().await.unwrap();
    let l2 = node2.new_listener("tcp://127.0.0.1:0", &[]).unwrap();
    l2.listen().await.unwrap();

    node0.dial(&l1.address()).unwrap();
    node1.dial(&l2.address()).unwrap();
    node2.dial(&l0.address()).unwrap();

    compio::time::sleep(Duration::from_millis(300)).await;

    node0.send(b"x").await.unwrap();

    deadline(&node1, Duration::from_secs(5));
    deadline(&node2, Duration::from_secs(5));
    let got1 = node1.recv_msg().await.unwrap();
    assert_eq!(got1.body(), b"x");
    assert!(got1.header().is_empty());
    assert_eq!(node2.recv().await.unwrap(), b"x");

    // Exactly once each, and never back to the sender.
    deadline(&node0, Duration::from_millis(300));
    deadline(&node1, Duration::from_millis(300));
    deadline(&node2, Duration::from_millis(300));
    assert!(matches!(node0.recv().await, Err(Error::RecvTimeout)));
    assert!(matches!(node1.recv().await, Err(Error::RecvTimeout)));
    assert!(matches!(node2.recv().await, Err(Error::RecvTimeout)));

    node0.close().await.unwrap();
    node1.close().await.unwrap();
    node2.close().await.unwrap();
}

#[compio::test]
async fn rebroadcast_skips_the_origin() {
    // Hub-and-spoke: the hub relays raw messages, and the origin header
    // keeps the relay from echoing a message back where it came from.
    let hub = bus::socket();
    hub.set_option(spaceframe::options::OPT_RAW, OptionValue::Bool(true))
        .unwrap();
    let l = hub.new_listener("tcp://127.0.0.1:0", &[]).unwrap();
    l.listen().await.unwrap();
    let addr = l.address();

    let spoke_a = bus::socket();
    spoke_a.dial(&addr).unwrap();
    let spoke_b = bus::socket();
    spoke_b.dial(&addr).unwrap();

    compio::time::sleep(Duration::from_millis(300)).await;

    spoke_a.send(b"from a").await.unwrap();

    // The hub sees the message with the origin pipe ID in the header and
    // rebroadcasts it verbatim.
    deadline(&hub, Duration::from_secs(5));
    let relayed = hub.recv_msg().await.unwrap();
    assert_eq!(relayed.header().len(), 4);
    assert_eq!(relayed.body(), b"from a");
    hub.send_msg(relayed).await.unwrap();

    deadline(&spoke_b, Duration::from_secs(5));
    assert_eq!(spoke_b.recv().await.unwrap(), b"from a");

    deadline(&spoke_a, Duration::from_millis(300));
    assert!(matches!(spoke_a.recv().await, Err(Error::RecvTimeout)));

    spoke_a.close().await.unwrap();
    spoke_b.close().await.unwrap();
    hub.close().await.unwrap();
}
