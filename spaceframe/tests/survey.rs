//! SURVEYOR/RESPONDENT: fan-out questions, gathered answers, and the
//! survey window closing behind them.

use std::time::Duration;

use spaceframe::options::{OPT_RECV_DEADLINE, OPT_SURVEY_TIME};
use spaceframe::{respondent, surveyor, Error, OptionValue};

#[compio::test]
async fn gather_responses_until_the_window_closes() {
    let boss = surveyor::socket();
    boss.set_option(
        OPT_SURVEY_TIME,
        OptionValue::Duration(Duration::from_millis(500)),
    )
    .unwrap();
    let l = boss.new_listener("tcp://127.0.0.1:0", &[]).unwrap();
    l.listen().await.unwrap();
    let addr = l.address();

    let worker1 = respondent::socket();
    worker1.dial(&addr).unwrap();
    let worker2 = respondent::socket();
    worker2.dial(&addr).unwrap();

    for w in [&worker1, &worker2] {
        w.set_option(OPT_RECV_DEADLINE, OptionValue::Duration(Duration::from_secs(5)))
            .unwrap();
    }
    // Let both workers finish connecting before the survey goes out.
    compio::time::sleep(Duration::from_millis(300)).await;

    boss.send(b"Q").await.unwrap();

    assert_eq!(worker1.recv().await.unwrap(), b"Q");
    worker1.send(b"R1").await.unwrap();
    assert_eq!(worker2.recv().await.unwrap(), b"Q");
    worker2.send(b"R2").await.unwrap();

    boss.set_option(OPT_RECV_DEADLINE, OptionValue::Duration(Duration::from_secs(5)))
        .unwrap();
    let mut got = vec![
        boss.recv().await.unwrap(),
        boss.recv().await.unwrap(),
    ];
    got.sort();
    assert_eq!(got, vec![b"R1".to_vec(), b"R2".to_vec()]);

    // Window expires; further receives report the state, not a timeout.
    compio::time::sleep(Duration::from_millis(600)).await;
    assert!(matches!(boss.recv().await, Err(Error::ProtoState)));

    worker1.close().await.unwrap();
    worker2.close().await.unwrap();
    boss.close().await.unwrap();
}

#[compio::test]
async fn respondent_cannot_answer_unasked() {
    let worker = respondent::socket();
    assert!(matches!(
        worker.send(b"unprompted").await,
        Err(Error::ProtoState)
    ));
    worker.close().await.unwrap();
}

#[compio::test]
async fn surveys_are_closed_before_first_send() {
    let boss = surveyor::socket();
    // No survey has ever been posted, so receives are refused outright.
    assert!(matches!(boss.recv().await, Err(Error::ProtoState)));
    boss.close().await.unwrap();
}

#[compio::test]
async fn late_answers_to_an_old_survey_are_dropped() {
    let boss = surveyor::socket();
    boss.set_option(OPT_SURVEY_TIME, OptionValue::Duration(Duration::ZERO))
        .unwrap();
    boss.listen("inproc://survey-stale").await.unwrap();

    let worker = respondent::socket();
    worker.dial("inproc://survey-stale").unwrap();
    worker
        .set_option(OPT_RECV_DEADLINE, OptionValue::Duration(Duration::from_secs(5)))
        .unwrap();
    compio::time::sleep(Duration::from_millis(200)).await;

    // Worker catches the first survey but answers only after the second
    // one has replaced it.
    boss.send(b"first").await.unwrap();
    assert_eq!(worker.recv().await.unwrap(), b"first");

    boss.send(b"second").await.unwrap();
    worker.send(b"stale answer").await.unwrap();

    boss.set_option(
        OPT_RECV_DEADLINE,
        OptionValue::Duration(Duration::from_millis(400)),
    )
    .unwrap();
    assert!(matches!(boss.recv().await, Err(Error::RecvTimeout)));

    worker.close().await.unwrap();
    boss.close().await.unwrap();
}
