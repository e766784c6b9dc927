// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use proptest::prelude::*;

use super::*;

// ── SeqBuffer ─────────────────────────────────────────────────────────────

#[test]
fn in_order_items_pass_straight_through() {
    let mut buf = SeqBuffer::new();
    assert_eq!(buf.push(0, "a"), Push::Ready(vec!["a"]));
    assert_eq!(buf.push(1, "b"), Push::Ready(vec!["b"]));
    assert_eq!(buf.next_expected(), 2);
}

#[test]
fn gap_is_held_until_filled() {
    let mut buf = SeqBuffer::new();
    assert_eq!(buf.push(1, "b"), Push::Buffered);
    assert_eq!(buf.push(2, "c"), Push::Buffered);
    // Filling the gap releases everything in order.
    assert_eq!(buf.push(0, "a"), Push::Ready(vec!["a", "b", "c"]));
}

#[test]
fn duplicates_are_dropped() {
    let mut buf = SeqBuffer::new();
    assert_eq!(buf.push(0, "a"), Push::Ready(vec!["a"]));
    assert_eq!(buf.push(0, "a-again"), Push::Duplicate);

    assert_eq!(buf.push(5, "f"), Push::Buffered);
    assert_eq!(buf.push(5, "f-again"), Push::Duplicate);
}

proptest! {
    /// Any at-least-once, arbitrarily reordered delivery of 0..n comes
    /// out exactly once each, in order (P5 for the cross-replica hop).
    #[test]
    fn reordered_duplicated_delivery_restores_producer_order(
        mut order in proptest::collection::vec(0u64..32, 1..64),
    ) {
        let max = *order.iter().max().unwrap_or(&0);
        // Ensure every sequence up to max is delivered at least once.
        order.extend(0..=max);

        let mut buf = SeqBuffer::new();
        let mut delivered = Vec::new();
        for seq in order {
            if let Push::Ready(items) = buf.push(seq, seq) {
                delivered.extend(items);
            }
        }
        let expected: Vec<u64> = (0..=max).collect();
        prop_assert_eq!(delivered, expected);
    }
}

// ── OperatorSession ───────────────────────────────────────────────────────

#[tokio::test]
async fn output_is_reordered_before_the_operator_sees_it() -> anyhow::Result<()> {
    let (session, mut out_rx, _ready_rx) = OperatorSession::new(
        "sess-1".into(),
        "probe-1".into(),
        "op-1".into(),
        Route::Local,
    );

    assert!(session.deliver_output(1, "d29ybGQ=".into()).await);
    assert!(session.deliver_output(0, "aGVsbG8=".into()).await);

    let first = out_rx.recv().await;
    let second = out_rx.recv().await;
    match (first, second) {
        (
            Some(OperatorEvent::Output { data: a }),
            Some(OperatorEvent::Output { data: b }),
        ) => {
            assert_eq!(a, "aGVsbG8=");
            assert_eq!(b, "d29ybGQ=");
        }
        other => anyhow::bail!("expected two outputs, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn duplicate_output_is_not_redelivered() -> anyhow::Result<()> {
    let (session, mut out_rx, _ready_rx) = OperatorSession::new(
        "sess-1".into(),
        "probe-1".into(),
        "op-1".into(),
        Route::Local,
    );

    assert!(session.deliver_output(0, "once".into()).await);
    assert!(session.deliver_output(0, "twice".into()).await);

    assert!(matches!(out_rx.recv().await, Some(OperatorEvent::Output { .. })));
    assert!(out_rx.try_recv().is_err(), "duplicate must be dropped");
    Ok(())
}

#[tokio::test]
async fn ready_resolves_exactly_once() -> anyhow::Result<()> {
    let (session, _out_rx, ready_rx) = OperatorSession::new(
        "sess-1".into(),
        "probe-1".into(),
        "op-1".into(),
        Route::Local,
    );

    assert!(session.resolve_ready(Ok(())).await);
    assert!(!session.resolve_ready(Ok(())).await, "second resolve is a no-op");
    assert!(matches!(ready_rx.await, Ok(Ok(()))));
    Ok(())
}

#[tokio::test]
async fn input_sequence_is_monotonic() {
    let (session, _out_rx, _ready_rx) = OperatorSession::new(
        "sess-1".into(),
        "probe-1".into(),
        "op-1".into(),
        Route::Remote { replica_id: "r2".into() },
    );
    assert_eq!(session.next_input_seq(), 0);
    assert_eq!(session.next_input_seq(), 1);
    assert_eq!(session.next_input_seq(), 2);
}

#[tokio::test]
async fn binding_reorders_operator_commands() -> anyhow::Result<()> {
    let binding = RemoteBinding::new("sess-1".into(), "probe-1".into(), "r1".into());

    let none = binding.accept(1, picket_wire::TerminalOp::Resize { rows: 50, cols: 132 }).await;
    assert!(none.is_empty(), "out-of-order command is held");

    let ready = binding
        .accept(0, picket_wire::TerminalOp::Input { data: "bHM=".into() })
        .await;
    assert_eq!(ready.len(), 2, "gap fill releases both in order");
    assert!(matches!(ready[0], picket_wire::TerminalOp::Input { .. }));
    assert!(matches!(ready[1], picket_wire::TerminalOp::Resize { .. }));
    Ok(())
}
