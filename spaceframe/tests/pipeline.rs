//! PUSH/PULL pipelines: ordering, linger on close, best-effort sends, and
//! the inbound size cap.

use std::time::Duration;

use spaceframe::options::{
    OPT_BEST_EFFORT, OPT_LINGER, OPT_MAX_RECV_SIZE, OPT_RECV_DEADLINE, OPT_SEND_DEADLINE,
    OPT_WRITEQ_LEN,
};
use spaceframe::{pull, push, Error, OptionValue};

#[compio::test]
async fn ordered_delivery_through_close() {
    let sink = pull::socket();
    let l = sink.new_listener("tcp://127.0.0.1:0", &[]).unwrap();
    l.listen().await.unwrap();
    let addr = l.address();

    let source = push::socket();
    source
        .set_option(OPT_LINGER, OptionValue::Duration(Duration::from_secs(1)))
        .unwrap();
    source.dial(&addr).unwrap();

    source.send(b"AAAAAAAAAAAAAAAA").await.unwrap();
    source.send(b"BBBBBBBBBBBBBBBB").await.unwrap();
    source.send(b"CCCCCCCCCCCCCCCC").await.unwrap();
    source.close().await.unwrap();

    sink.set_option(OPT_RECV_DEADLINE, OptionValue::Duration(Duration::from_secs(5)))
        .unwrap();
    assert_eq!(sink.recv().await.unwrap(), b"AAAAAAAAAAAAAAAA");
    assert_eq!(sink.recv().await.unwrap(), b"BBBBBBBBBBBBBBBB");
    assert_eq!(sink.recv().await.unwrap(), b"CCCCCCCCCCCCCCCC");

    sink.close().await.unwrap();
}

#[cfg(unix)]
#[compio::test]
async fn pipeline_over_unix_sockets() {
    let path = format!(
        "ipc:///tmp/spaceframe-pipe-{}.sock",
        std::process::id()
    );

    let sink = pull::socket();
    sink.listen(&path).await.unwrap();

    let source = push::socket();
    source.dial(&path).unwrap();

    sink.set_option(OPT_RECV_DEADLINE, OptionValue::Duration(Duration::from_secs(5)))
        .unwrap();
    source.send(b"over the file system").await.unwrap();
    assert_eq!(sink.recv().await.unwrap(), b"over the file system");

    source.close().await.unwrap();
    sink.close().await.unwrap();
}

#[compio::test]
async fn best_effort_send_never_blocks() {
    let source = push::socket();
    source
        .set_option(OPT_WRITEQ_LEN, OptionValue::Int(1))
        .unwrap();
    source
        .set_option(OPT_BEST_EFFORT, OptionValue::Bool(true))
        .unwrap();

    // No peer will ever drain the queue; every send must still succeed.
    for _ in 0..32 {
        source.send(b"into the void").await.unwrap();
    }
    source
        .set_option(OPT_LINGER, OptionValue::Duration(Duration::from_millis(50)))
        .unwrap();
    source.close().await.unwrap();
}

#[compio::test]
async fn blocking_send_honors_deadline() {
    let source = push::socket();
    source
        .set_option(OPT_WRITEQ_LEN, OptionValue::Int(1))
        .unwrap();
    source
        .set_option(OPT_SEND_DEADLINE, OptionValue::Duration(Duration::from_millis(100)))
        .unwrap();

    // First send fills the queue; the second has nowhere to go.
    source.send(b"fits").await.unwrap();
    assert!(matches!(
        source.send(b"stuck").await,
        Err(Error::SendTimeout)
    ));

    source
        .set_option(OPT_LINGER, OptionValue::Duration(Duration::from_millis(50)))
        .unwrap();
    source.close().await.unwrap();
}

#[compio::test]
async fn oversized_frames_kill_the_pipe() {
    let sink = pull::socket();
    sink.set_option(OPT_MAX_RECV_SIZE, OptionValue::Int(16))
        .unwrap();
    let l = sink.new_listener("tcp://127.0.0.1:0", &[]).unwrap();
    l.listen().await.unwrap();
    let addr = l.address();

    let source = push::socket();
    source.dial(&addr).unwrap();
    source.send(&[0x55u8; 64]).await.unwrap();

    sink.set_option(
        OPT_RECV_DEADLINE,
        OptionValue::Duration(Duration::from_millis(500)),
    )
    .unwrap();
    assert!(matches!(sink.recv().await, Err(Error::RecvTimeout)));

    source.close().await.unwrap();
    sink.close().await.unwrap();
}
