//! End-to-end scenario 5: tether ordering. Ingress three `user.message`
//! frames on one session; each "guest reply" appends one `assistant.done`
//! frame (there is no live guest driving this in-process, so the reply
//! side is simulated directly against the same `TetherStore` the guest's
//! `log`/tether-producing RPCs would append to in a full boot).

use std::time::Duration;

use aegisvm::tether::{Filter, Session, TetherFrame, TetherStore};

fn user_message(n: usize) -> TetherFrame {
    TetherFrame::new(
        "user.message",
        Session { channel: "host".into(), id: "s1".into() },
        Some(format!("m{n}")),
        format!("hello {n}").into_bytes(),
    )
}

fn assistant_done(reply_to: usize) -> TetherFrame {
    TetherFrame::new(
        "assistant.done",
        Session { channel: "host".into(), id: "s1".into() },
        Some(format!("m{reply_to}")),
        Vec::new(),
    )
}

#[tokio::test]
async fn ingress_and_replies_are_strictly_ordered_and_interleaved() {
    let store = TetherStore::default();

    for n in 0..3 {
        store.append("i1", user_message(n));
        store.append("i1", assistant_done(n));
    }

    let result = store.poll("i1", &Filter::default(), 0, 10, Duration::ZERO).await;
    assert_eq!(result.frames.len(), 6);

    let seqs: Vec<u64> = result.frames.iter().map(|f| f.seq).collect();
    let mut sorted = seqs.clone();
    sorted.sort_unstable();
    assert_eq!(seqs, sorted, "seqs must be strictly increasing");

    for pair in result.frames.chunks(2) {
        assert_eq!(pair[0].frame_type, "user.message");
        assert_eq!(pair[1].frame_type, "assistant.done");
        assert_eq!(pair[0].msg_id, pair[1].msg_id);
    }
}

#[tokio::test]
async fn poll_with_after_seq_only_returns_newer_frames() {
    let store = TetherStore::default();
    let first = store.append("i1", user_message(0));
    store.append("i1", assistant_done(0));

    let result = store.poll("i1", &Filter::default(), first, 10, Duration::ZERO).await;
    assert_eq!(result.frames.len(), 1);
    assert_eq!(result.frames[0].frame_type, "assistant.done");
}

#[tokio::test]
async fn session_filter_excludes_other_sessions() {
    let store = TetherStore::default();
    store.append(
        "i1",
        TetherFrame::new("user.message", Session { channel: "host".into(), id: "other".into() }, None, Vec::new()),
    );
    store.append("i1", user_message(0));

    let filter = Filter { session_id: Some("s1".into()), ..Default::default() };
    let result = store.poll("i1", &filter, 0, 10, Duration::ZERO).await;
    assert_eq!(result.frames.len(), 1);
    assert_eq!(result.frames[0].session.id, "s1");
}
