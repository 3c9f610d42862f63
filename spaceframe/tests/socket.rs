//! Socket-core behavior that is the same for every pattern: option
//! plumbing, deadlines, close semantics, and address validation.

use std::time::Duration;

use spaceframe::options::{
    OPT_LINGER, OPT_MAX_RECV_SIZE, OPT_READQ_LEN, OPT_RECV_DEADLINE, OPT_WRITEQ_LEN,
};
use spaceframe::{pair, pull, push, Error, OptionValue};

#[compio::test]
async fn queue_depths_lock_after_activation() {
    let sock = pair::socket();
    sock.set_option(OPT_WRITEQ_LEN, OptionValue::Int(64)).unwrap();
    sock.set_option(OPT_READQ_LEN, OptionValue::Int(64)).unwrap();
    assert_eq!(
        sock.get_option(OPT_WRITEQ_LEN).unwrap(),
        OptionValue::Int(64)
    );

    let l = sock.new_listener("tcp://127.0.0.1:0", &[]).unwrap();
    l.listen().await.unwrap();

    assert!(matches!(
        sock.set_option(OPT_WRITEQ_LEN, OptionValue::Int(32)),
        Err(Error::BadOption)
    ));
    assert!(matches!(
        sock.set_option(OPT_READQ_LEN, OptionValue::Int(32)),
        Err(Error::BadOption)
    ));
    sock.close().await.unwrap();
}

#[compio::test]
async fn option_validation() {
    let sock = pair::socket();
    assert!(matches!(
        sock.set_option("NO-SUCH-OPTION", OptionValue::Bool(true)),
        Err(Error::BadOption)
    ));
    assert!(matches!(
        sock.set_option(OPT_WRITEQ_LEN, OptionValue::Int(-1)),
        Err(Error::BadValue)
    ));
    assert!(matches!(
        sock.set_option(OPT_MAX_RECV_SIZE, OptionValue::Bool(true)),
        Err(Error::BadValue)
    ));
    assert!(matches!(
        sock.get_option("NO-SUCH-OPTION"),
        Err(Error::BadOption)
    ));
    sock.close().await.unwrap();
}

#[compio::test]
async fn recv_deadline_expires() {
    let sock = pull::socket();
    sock.set_option(
        OPT_RECV_DEADLINE,
        OptionValue::Duration(Duration::from_millis(100)),
    )
    .unwrap();
    assert!(matches!(sock.recv().await, Err(Error::RecvTimeout)));
    sock.close().await.unwrap();
}

#[compio::test]
async fn close_is_terminal() {
    let sock = pair::socket();
    sock.set_option(OPT_LINGER, OptionValue::Duration(Duration::from_millis(50)))
        .unwrap();
    sock.close().await.unwrap();
    assert!(matches!(sock.close().await, Err(Error::Closed)));
    assert!(matches!(sock.send(b"too late").await, Err(Error::Closed)));
    assert!(matches!(sock.recv().await, Err(Error::Closed)));
}

#[compio::test]
async fn close_respects_the_linger_budget() {
    let sock = push::socket();
    sock.set_option(OPT_LINGER, OptionValue::Duration(Duration::from_millis(200)))
        .unwrap();

    // Nothing will ever drain these; close must give up once the linger
    // budget is spent rather than waiting for delivery.
    for _ in 0..8 {
        sock.send(b"stranded").await.unwrap();
    }

    let started = std::time::Instant::now();
    sock.close().await.unwrap();
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(150), "gave up too early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(700), "overstayed linger: {elapsed:?}");
}

#[compio::test]
async fn bad_addresses_are_rejected_synchronously() {
    let sock = pair::socket();
    assert!(matches!(
        sock.dial("carrier-pigeon://coop"),
        Err(Error::BadTran)
    ));
    assert!(matches!(sock.dial("no-scheme-at-all"), Err(Error::BadTran)));
    assert!(matches!(sock.dial("tcp://not an address"), Err(Error::BadAddr)));
    assert!(matches!(sock.listen("inproc://").await, Err(Error::BadAddr)));
    sock.close().await.unwrap();
}

#[compio::test]
async fn dialers_run_once_and_close_once() {
    let sock = pair::socket();
    let d = sock.new_dialer("tcp://127.0.0.1:9", &[]).unwrap();
    d.dial().unwrap();
    assert!(matches!(d.dial(), Err(Error::AddrInUse)));
    d.close().unwrap();
    assert!(matches!(d.close(), Err(Error::Closed)));
    sock.close().await.unwrap();
}

#[compio::test]
async fn listener_address_reports_bound_port() {
    let sock = pull::socket();
    let l = sock.new_listener("tcp://127.0.0.1:0", &[]).unwrap();
    l.listen().await.unwrap();
    let addr = l.address();
    assert!(addr.starts_with("tcp://127.0.0.1:"));
    assert!(!addr.ends_with(":0"));
    sock.close().await.unwrap();
}

#[compio::test]
async fn listen_on_a_taken_address_fails() {
    let a = pull::socket();
    let l = a.new_listener("tcp://127.0.0.1:0", &[]).unwrap();
    l.listen().await.unwrap();
    let addr = l.address();

    let b = pull::socket();
    assert!(matches!(b.listen(&addr).await, Err(Error::AddrInUse)));

    b.close().await.unwrap();
    a.close().await.unwrap();
}
