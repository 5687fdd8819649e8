//! Property tests for framing, reconnect backoff and correlation.

use bytes::BytesMut;
use futures::FutureExt;
use lsp_peer::lsp::config::ReconnectPolicy;
use lsp_peer::lsp::correlator::Correlator;
use lsp_peer::lsp::error::CorrelationError;
use lsp_peer::lsp::framed::{encode_frame, ContentLengthCodec};
use proptest::prelude::*;
use serde_json::json;
use std::time::Duration;
use tokio_util::codec::Decoder;

fn arb_body() -> impl Strategy<Value = String> {
    (1i64..=10_000, "[a-zA-Z0-9 /é中]{0,48}").prop_map(|(id, text)| {
        json!({"jsonrpc": "2.0", "id": id, "method": "test/echo", "params": {"text": text}}).to_string()
    })
}

#[derive(Debug, Clone)]
enum Op {
    Resolve(usize),
    Reject(usize),
}

fn arb_ops(ids: usize) -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(
        prop_oneof![
            (0..ids).prop_map(Op::Resolve),
            (0..ids).prop_map(Op::Reject),
        ],
        0..40,
    )
}

proptest! {
    #[test]
    fn framing_survives_arbitrary_splits(
        bodies in prop::collection::vec(arb_body(), 1..6),
        cuts in prop::collection::vec(any::<prop::sample::Index>(), 0..8),
    ) {
        let mut stream = Vec::new();
        for body in &bodies {
            stream.extend_from_slice(&encode_frame(body));
        }
        let mut points: Vec<usize> = cuts.iter().map(|c| c.index(stream.len() + 1)).collect();
        points.push(0);
        points.push(stream.len());
        points.sort_unstable();
        points.dedup();

        let mut codec = ContentLengthCodec::new();
        let mut buf = BytesMut::new();
        let mut decoded = Vec::new();
        for window in points.windows(2) {
            buf.extend_from_slice(&stream[window[0]..window[1]]);
            while let Some(item) = codec.decode(&mut buf).unwrap() {
                let body = item.unwrap();
                decoded.push(String::from_utf8(body.to_vec()).unwrap());
            }
        }
        prop_assert_eq!(decoded, bodies);
        prop_assert!(buf.is_empty());
    }

    #[test]
    fn backoff_is_non_decreasing_and_bounded(
        base_ms in 1u64..5_000,
        max_ms in 1u64..60_000,
        multiplier in 1.0f64..4.0,
        attempts in 1u32..40,
    ) {
        let policy = ReconnectPolicy {
            enabled: true,
            base_delay: Duration::from_millis(base_ms),
            multiplier,
            max_delay: Duration::from_millis(max_ms),
            max_attempts: attempts,
        };
        let mut previous = Duration::ZERO;
        for attempt in 1..=attempts {
            let delay = policy.delay_for(attempt);
            prop_assert!(delay >= previous, "attempt {} went from {:?} to {:?}", attempt, previous, delay);
            prop_assert!(delay <= policy.max_delay);
            previous = delay;
        }
        prop_assert_eq!(policy.delay_for(1), policy.base_delay.min(policy.max_delay));
    }

    #[test]
    fn correlator_settles_each_id_at_most_once(ops in arb_ops(5)) {
        let correlator = Correlator::new();
        let mut entries: Vec<_> = (0..5).map(|i| correlator.create(&format!("m{}", i), None)).collect();
        let mut first: Vec<Option<bool>> = vec![None; entries.len()];

        for op in &ops {
            let (index, resolved, settled) = match *op {
                Op::Resolve(i) => (i, true, correlator.resolve(&entries[i].0, json!(i))),
                Op::Reject(i) => (i, false, correlator.reject(&entries[i].0, CorrelationError::ConnectionClosed)),
            };
            prop_assert_eq!(settled, first[index].is_none());
            if settled {
                first[index] = Some(resolved);
            }
        }

        let ids: Vec<_> = entries.iter().map(|(id, _)| id.clone()).collect();
        let mut unique = ids.clone();
        unique.sort_by_key(|id| id.to_string());
        unique.dedup();
        prop_assert_eq!(unique.len(), ids.len());

        for (index, (_, pending)) in entries.drain(..).enumerate() {
            let outcome = pending.now_or_never();
            match first[index] {
                None => prop_assert!(outcome.is_none()),
                Some(true) => prop_assert_eq!(outcome, Some(Ok(json!(index)))),
                Some(false) => prop_assert!(matches!(outcome, Some(Err(_)))),
            }
        }
        prop_assert_eq!(correlator.len(), first.iter().filter(|f| f.is_none()).count());
    }
}
