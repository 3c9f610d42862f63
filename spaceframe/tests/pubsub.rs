//! PUB/SUB: prefix filtering, fanout, and the one-way contracts.

use std::time::Duration;

use spaceframe::options::{OPT_RECV_DEADLINE, OPT_SUBSCRIBE, OPT_UNSUBSCRIBE};
use spaceframe::{publish, subscribe, Error, OptionValue};

fn deadline(sock: &spaceframe::Socket, d: Duration) {
    sock.set_option(OPT_RECV_DEADLINE, OptionValue::Duration(d))
        .unwrap();
}

#[compio::test]
async fn prefix_filtering() {
    let publisher = publish::socket();
    let l = publisher.new_listener("tcp://127.0.0.1:0", &[]).unwrap();
    l.listen().await.unwrap();
    let addr = l.address();

    let sub = subscribe::socket();
    sub.set_option(OPT_SUBSCRIBE, OptionValue::from("foo"))
        .unwrap();
    sub.dial(&addr).unwrap();
    compio::time::sleep(Duration::from_millis(300)).await;

    for body in [&b"foobar"[..], b"bar", b"foo", b"fo"] {
        publisher.send(body).await.unwrap();
    }

    deadline(&sub, Duration::from_secs(5));
    assert_eq!(sub.recv().await.unwrap(), b"foobar");
    assert_eq!(sub.recv().await.unwrap(), b"foo");

    // Non-matching bodies were dropped at the engine.
    deadline(&sub, Duration::from_millis(300));
    assert!(matches!(sub.recv().await, Err(Error::RecvTimeout)));

    sub.close().await.unwrap();
    publisher.close().await.unwrap();
}

#[compio::test]
async fn fanout_reaches_every_subscriber() {
    let publisher = publish::socket();
    let l = publisher.new_listener("tcp://127.0.0.1:0", &[]).unwrap();
    l.listen().await.unwrap();
    let addr = l.address();

    let sub_a = subscribe::socket();
    sub_a
        .set_option(OPT_SUBSCRIBE, OptionValue::from(""))
        .unwrap();
    sub_a.dial(&addr).unwrap();

    let sub_b = subscribe::socket();
    sub_b
        .set_option(OPT_SUBSCRIBE, OptionValue::from(""))
        .unwrap();
    sub_b.dial(&addr).unwrap();

    compio::time::sleep(Duration::from_millis(300)).await;

    publisher.send(b"news at 11").await.unwrap();

    deadline(&sub_a, Duration::from_secs(5));
    deadline(&sub_b, Duration::from_secs(5));
    assert_eq!(sub_a.recv().await.unwrap(), b"news at 11");
    assert_eq!(sub_b.recv().await.unwrap(), b"news at 11");

    sub_a.close().await.unwrap();
    sub_b.close().await.unwrap();
    publisher.close().await.unwrap();
}

#[compio::test]
async fn direction_is_enforced() {
    let publisher = publish::socket();
    assert!(matches!(publisher.recv().await, Err(Error::ProtoOp)));

    let sub = subscribe::socket();
    assert!(matches!(sub.send(b"backwards").await, Err(Error::ProtoOp)));

    publisher.close().await.unwrap();
    sub.close().await.unwrap();
}

#[compio::test]
async fn subscription_bookkeeping() {
    let sub = subscribe::socket();
    sub.set_option(OPT_SUBSCRIBE, OptionValue::from("alpha"))
        .unwrap();
    // Again: silently fine.
    sub.set_option(OPT_SUBSCRIBE, OptionValue::from("alpha"))
        .unwrap();
    sub.set_option(OPT_UNSUBSCRIBE, OptionValue::from("alpha"))
        .unwrap();
    assert!(matches!(
        sub.set_option(OPT_UNSUBSCRIBE, OptionValue::from("alpha")),
        Err(Error::BadValue)
    ));
    sub.close().await.unwrap();
}
