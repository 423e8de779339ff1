//! Property-based invariants for the codec and protocol layers, plus the
//! concurrency properties that need a live connection to observe.


use proptest::prelude::*;

use ilp_stream::crypto::EncryptionKey;
use ilp_stream::oer::Writer;
use ilp_stream::packet::{Frame, IlpPacketType, Packet};
use ilp_stream::receipt::{create_receipt, decode_receipt, verify_receipt};
use ilp_stream::Reassembler;

fn arb_frame() -> impl Strategy<Value = Frame> {
    let stream_id = 1u64..10_000;
    prop_oneof![
        (stream_id.clone(), any::<u64>())
            .prop_map(|(stream_id, shares)| Frame::StreamMoney { stream_id, shares }),
        (stream_id.clone(), any::<u64>(), any::<u64>()).prop_map(
            |(stream_id, receive_max, total_received)| Frame::StreamMaxMoney {
                stream_id,
                receive_max,
                total_received,
            }
        ),
        (
            stream_id.clone(),
            any::<u64>(),
            prop::collection::vec(any::<u8>(), 0..256)
        )
            .prop_map(|(stream_id, offset, data)| Frame::StreamData {
                stream_id,
                offset,
                data,
            }),
        (stream_id, any::<u64>()).prop_map(|(stream_id, max_offset)| Frame::StreamMaxData {
            stream_id,
            max_offset,
        }),
        "[a-z.]{1,30}".prop_map(|source_account| Frame::ConnectionNewAddress { source_account }),
        any::<u64>().prop_map(|max_offset| Frame::ConnectionMaxData { max_offset }),
    ]
}

proptest! {
    /// Invariant 1: packet encode/decode round-trips.
    #[test]
    fn packet_roundtrip(
        sequence in any::<u64>(),
        prepare_amount in any::<u64>(),
        frames in prop::collection::vec(arb_frame(), 0..24),
    ) {
        let packet = Packet::new(sequence, IlpPacketType::Prepare, prepare_amount, frames);
        prop_assert_eq!(Packet::decode(&packet.encode()).unwrap(), packet);
    }

    /// Invariant 2: the AEAD envelope round-trips under its key.
    #[test]
    fn encryption_roundtrip(
        key in any::<[u8; 32]>(),
        plaintext in prop::collection::vec(any::<u8>(), 0..4096),
    ) {
        let key = EncryptionKey::new(key);
        let envelope = key.encrypt(&plaintext).unwrap();
        prop_assert_eq!(key.decrypt(&envelope).unwrap(), plaintext);
    }

    /// Invariant 3: an unknown frame type is skipped without disturbing the
    /// recognized frames around it.
    #[test]
    fn unknown_frame_skipped(
        frames in prop::collection::vec(arb_frame(), 1..8),
        position in 0usize..8,
        junk in prop::collection::vec(any::<u8>(), 0..64),
    ) {
        let position = position.min(frames.len());
        let mut w = Writer::new();
        w.write_u8(1); // version
        w.write_u8(IlpPacketType::Prepare as u8);
        w.write_var_uint(42);
        w.write_var_uint(0);
        w.write_var_uint(frames.len() as u64 + 1);
        for (i, frame) in frames.iter().enumerate() {
            if i == position {
                w.write_u8(0xFE);
                w.write_var_octet_string(&junk);
            }
            frame.encode(&mut w);
        }
        if position == frames.len() {
            w.write_u8(0xFE);
            w.write_var_octet_string(&junk);
        }

        let decoded = Packet::decode(&w.into_inner()).unwrap();
        prop_assert_eq!(decoded.frames, frames);
    }

    /// Invariant 4: keeping the receipt with the largest total produces a
    /// non-decreasing sequence of observed totals, regardless of delivery
    /// order.
    #[test]
    fn receipt_monotonicity(totals in prop::collection::vec(any::<u64>(), 1..32)) {
        let secret = [3u8; 32];
        let nonce = [5u8; 16];

        let mut latest: Option<Vec<u8>> = None;
        let mut observed = Vec::new();
        for total in totals {
            let blob = create_receipt(&nonce, 1, total, &secret).unwrap().to_vec();
            prop_assert!(verify_receipt(&blob, &secret));
            let newer = match &latest {
                Some(existing) => {
                    decode_receipt(&blob).unwrap().total_received
                        >= decode_receipt(existing).unwrap().total_received
                }
                None => true,
            };
            if newer {
                latest = Some(blob);
            }
            observed.push(decode_receipt(latest.as_ref().unwrap()).unwrap().total_received);
        }
        prop_assert!(observed.windows(2).all(|w| w[0] <= w[1]));
    }

    /// Invariant 8: chunks covering `[0, len)` pushed in any order read back
    /// as the original bytes, exactly once.
    #[test]
    fn reassembler_random_order(
        data in prop::collection::vec(any::<u8>(), 1..2048),
        order_seed in any::<u64>(),
    ) {
        let mut boundaries = vec![0usize];
        let mut pos = 0usize;
        let mut state = order_seed | 1;
        while pos < data.len() {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            pos += (state % 64 + 1) as usize;
            boundaries.push(pos.min(data.len()));
        }
        let mut chunks: Vec<(u64, &[u8])> = boundaries
            .windows(2)
            .map(|w| (w[0] as u64, &data[w[0]..w[1]]))
            .collect();
        for i in (1..chunks.len()).rev() {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            chunks.swap(i, (state % (i as u64 + 1)) as usize);
        }

        let mut reassembler = Reassembler::new();
        for (offset, chunk) in &chunks {
            reassembler.push(*offset, chunk).unwrap();
        }
        let mut out = Vec::new();
        while let Some(chunk) = reassembler.read() {
            out.extend_from_slice(&chunk);
        }
        prop_assert_eq!(out, data);
        prop_assert!(reassembler.read().is_none());
    }
}

mod live {
    //! Invariants 5–7 need a running connection pair to observe.

    use super::test_helpers::plugin_pair;
    use ilp_stream::client::{create_connection, ConnectOptions};
    use ilp_stream::plugin::Plugin;
    use ilp_stream::server::StreamServer;
    use ilp_stream::stream::ReceiveMax;
    use std::sync::Arc;
    use std::time::Duration;

    /// Invariants 6 and 7: with `F08` resizing forcing many packets and two
    /// streams sending concurrently, at most one Prepare is ever in flight
    /// and totals never overshoot the send caps.
    #[tokio::test]
    async fn single_prepare_in_flight_under_concurrency() {
        let (client_plugin, server_plugin) = plugin_pair(1.0, Some(700));
        let server = StreamServer::new(
            Arc::clone(&server_plugin) as Arc<dyn Plugin>,
            [7u8; 32],
        );
        server.listen().await.unwrap();
        let (destination, secret) = server.generate_address_and_secret(None).await.unwrap();

        // Accept every stream and open its receive cap.
        let receiver = tokio::spawn({
            let server = server.clone();
            async move {
                let connection = server.accept_connection().await.expect("connection");
                while let Some(stream) = connection.accept_stream().await {
                    stream.set_receive_max(ReceiveMax::Unbounded).await;
                }
            }
        });

        let connection = create_connection(
            Arc::clone(&client_plugin) as Arc<dyn Plugin>,
            ConnectOptions::new(destination, secret),
        )
        .await
        .unwrap();

        let stream_a = connection.create_stream().await;
        let stream_b = connection.create_stream().await;
        let send_a = {
            let stream = stream_a.clone();
            tokio::spawn(async move { stream.send_total(3000).await })
        };
        let send_b = {
            let stream = stream_b.clone();
            tokio::spawn(async move { stream.send_total(2000).await })
        };
        tokio::time::timeout(Duration::from_secs(20), async {
            send_a.await.unwrap().unwrap();
            send_b.await.unwrap().unwrap();
        })
        .await
        .expect("sends finished");
        receiver.abort();

        // Invariant 7: never more than one outstanding Prepare.
        assert_eq!(client_plugin.max_in_flight(), 1);

        // Invariant 6: totals match the caps exactly; holds never pushed a
        // stream past its send_max.
        assert_eq!(stream_a.total_sent().await, 3000);
        assert_eq!(stream_b.total_sent().await, 2000);
        assert_eq!(connection.total_sent().await, 5000);

        tokio::time::sleep(Duration::from_millis(100)).await;
        // Invariant 5 (receiver side): nothing beyond what was sent.
        assert_eq!(connection.total_delivered().await, 5000);
    }
}
