//! End-to-end pipeline tests: ingest -> classify -> correlate -> score
//! over an in-memory store, with captures synthesized in the legacy and
//! next-generation container formats.

use std::io::Write as _;

use etherparse::PacketBuilder;
use tokio_util::sync::CancellationToken;
use veiltrace_core::{
    load_directory, Classifier, CorrelateOptions, Correlator, IngestOptions,
    Ingestor, Scorer, SignatureSet, Store,
};
use veiltrace_model::{
    ConfidenceCategory, CorrelationKind, FlowKey, NewFlow, Transport,
};

const BASE_TS: f64 = 1_700_000_000.0;

fn tcp_frame(
    src: [u8; 4],
    sport: u16,
    dst: [u8; 4],
    dport: u16,
    payload: &[u8],
) -> Vec<u8> {
    let builder =
        PacketBuilder::ethernet2([2, 0, 0, 0, 0, 1], [2, 0, 0, 0, 0, 2])
            .ipv4(src, dst, 64)
            .tcp(sport, dport, 0, 65535);
    let mut frame = Vec::with_capacity(builder.size(payload.len()));
    builder.write(&mut frame, payload).unwrap();
    frame
}

fn udp_frame(
    src: [u8; 4],
    sport: u16,
    dst: [u8; 4],
    dport: u16,
    payload: &[u8],
) -> Vec<u8> {
    let builder =
        PacketBuilder::ethernet2([2, 0, 0, 0, 0, 1], [2, 0, 0, 0, 0, 2])
            .ipv4(src, dst, 64)
            .udp(sport, dport);
    let mut frame = Vec::with_capacity(builder.size(payload.len()));
    builder.write(&mut frame, payload).unwrap();
    frame
}

/// Build a legacy capture from `(timestamp, wire_len, frame)` records.
fn legacy_pcap(records: &[(f64, u32, Vec<u8>)]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&0xa1b2_c3d4u32.to_le_bytes());
    out.extend_from_slice(&2u16.to_le_bytes());
    out.extend_from_slice(&4u16.to_le_bytes());
    out.extend_from_slice(&0i32.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&65535u32.to_le_bytes());
    out.extend_from_slice(&1u32.to_le_bytes());

    for (timestamp, wire_len, frame) in records {
        let ts_sec = timestamp.trunc() as u32;
        let ts_usec = ((timestamp - timestamp.trunc()) * 1_000_000.0).round()
            as u32;
        out.extend_from_slice(&ts_sec.to_le_bytes());
        out.extend_from_slice(&ts_usec.to_le_bytes());
        out.extend_from_slice(&(frame.len() as u32).to_le_bytes());
        out.extend_from_slice(&wire_len.to_le_bytes());
        out.extend_from_slice(frame);
    }
    out
}

/// Minimal pcapng capture: one section, one Ethernet interface, and one
/// enhanced packet block per record.
fn pcapng_capture(records: &[(f64, u32, Vec<u8>)]) -> Vec<u8> {
    let mut out = Vec::new();

    // Section header block.
    out.extend_from_slice(&0x0a0d_0d0au32.to_le_bytes());
    out.extend_from_slice(&28u32.to_le_bytes());
    out.extend_from_slice(&0x1a2b_3c4du32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&u64::MAX.to_le_bytes());
    out.extend_from_slice(&28u32.to_le_bytes());

    // Interface description block, linktype 1 (Ethernet), no options.
    out.extend_from_slice(&1u32.to_le_bytes());
    out.extend_from_slice(&20u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&20u32.to_le_bytes());

    for (timestamp, wire_len, frame) in records {
        let ticks = (timestamp * 1_000_000.0).round() as u64;
        let padding = (4 - frame.len() % 4) % 4;
        let block_len = 32 + frame.len() + padding;

        out.extend_from_slice(&6u32.to_le_bytes());
        out.extend_from_slice(&(block_len as u32).to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&((ticks >> 32) as u32).to_le_bytes());
        out.extend_from_slice(&(ticks as u32).to_le_bytes());
        out.extend_from_slice(&(frame.len() as u32).to_le_bytes());
        out.extend_from_slice(&wire_len.to_le_bytes());
        out.extend_from_slice(frame);
        out.extend_from_slice(&vec![0u8; padding]);
        out.extend_from_slice(&(block_len as u32).to_le_bytes());
    }
    out
}

fn write_temp(bytes: &[u8], suffix: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(suffix)
        .tempfile()
        .unwrap();
    file.write_all(bytes).unwrap();
    file.flush().unwrap();
    file
}

async fn ingest_bytes(store: &Store, bytes: &[u8], eager: bool) -> u64 {
    let file = write_temp(bytes, ".pcap");
    let options = IngestOptions {
        eager,
        ..Default::default()
    };
    Ingestor::new(store, options)
        .ingest(file.path(), &CancellationToken::new())
        .await
        .unwrap()
        .flows_persisted
}

async fn load_relays(store: &Store, records: serde_json::Value) {
    let file = write_temp(records.to_string().as_bytes(), ".json");
    load_directory(store, file.path()).await.unwrap();
}

async fn classify_all(store: &Store) -> u64 {
    Classifier::new(store, SignatureSet::default(), 100)
        .run(&CancellationToken::new())
        .await
        .unwrap()
}

async fn score_all(store: &Store) -> u64 {
    Scorer::new(store, SignatureSet::default(), 100)
        .run(&CancellationToken::new())
        .await
        .unwrap()
}

fn new_flow(
    src: &str,
    sport: u16,
    dst: &str,
    dport: u16,
    start_offset: f64,
    duration: f64,
    pkt_count: u64,
    byte_count: u64,
    payload: Option<Vec<u8>>,
) -> NewFlow {
    let start = chrono::DateTime::from_timestamp_micros(
        ((BASE_TS + start_offset) * 1_000_000.0) as i64,
    )
    .unwrap();
    let end = start
        + chrono::Duration::microseconds((duration * 1_000_000.0) as i64);
    NewFlow {
        key: FlowKey {
            src_addr: src.parse().unwrap(),
            src_port: sport,
            dst_addr: dst.parse().unwrap(),
            dst_port: dport,
            transport: Transport::Tcp,
        },
        ts_start: start,
        ts_end: end,
        pkt_count,
        byte_count,
        payload_prefix: payload,
    }
}

#[tokio::test]
async fn ingest_reconstructs_distinct_flows() {
    let store = Store::open_in_memory().await.unwrap();

    // Three distinct 5-tuples over seven packets.
    let mut records = Vec::new();
    for i in 0..4 {
        records.push((
            BASE_TS + i as f64,
            60,
            tcp_frame([192, 168, 1, 100], 50000, [185, 220, 101, 1], 9001, b""),
        ));
    }
    for i in 0..2 {
        records.push((
            BASE_TS + i as f64,
            60,
            tcp_frame([192, 168, 1, 100], 50001, [185, 220, 101, 1], 9001, b""),
        ));
    }
    records.push((
        BASE_TS,
        80,
        udp_frame([192, 168, 1, 101], 60000, [8, 8, 8, 8], 53, b"dns"),
    ));

    let flows = ingest_bytes(&store, &legacy_pcap(&records), false).await;
    assert_eq!(flows, 3);

    let all = store.flows().page_after(0, 100).await.unwrap();
    assert_eq!(all.len(), 3);
    let total_packets: u64 = all.iter().map(|f| f.pkt_count).sum();
    assert_eq!(total_packets, 7);

    for flow in &all {
        assert!(flow.pkt_count >= 1);
        assert!(flow.byte_count >= flow.pkt_count);
        assert!(flow.ts_start <= flow.ts_end);
        assert!(
            flow.payload_prefix.as_ref().map_or(true, |p| p.len() <= 512)
        );
    }

    let udp_flow = all
        .iter()
        .find(|f| f.key.transport == Transport::Udp)
        .unwrap();
    assert_eq!(udp_flow.payload_prefix.as_deref(), Some(&b"dns"[..]));
    assert_eq!(udp_flow.key.dst_port, 53);
}

#[tokio::test]
async fn ingest_takes_first_nonempty_payload() {
    let store = Store::open_in_memory().await.unwrap();

    let records = vec![
        (
            BASE_TS,
            60,
            tcp_frame([10, 0, 0, 1], 1000, [10, 0, 0, 2], 2000, b""),
        ),
        (
            BASE_TS + 1.0,
            60,
            tcp_frame([10, 0, 0, 1], 1000, [10, 0, 0, 2], 2000, b"first"),
        ),
        (
            BASE_TS + 2.0,
            60,
            tcp_frame([10, 0, 0, 1], 1000, [10, 0, 0, 2], 2000, b"second"),
        ),
    ];
    ingest_bytes(&store, &legacy_pcap(&records), false).await;

    let all = store.flows().page_after(0, 10).await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].payload_prefix.as_deref(), Some(&b"first"[..]));
    assert_eq!(all[0].pkt_count, 3);
}

#[tokio::test]
async fn ingest_skips_non_ip_packets_without_aborting() {
    let store = Store::open_in_memory().await.unwrap();

    // An ARP frame between two TCP packets.
    let arp = vec![
        0x02, 0, 0, 0, 0, 1, 0x02, 0, 0, 0, 0, 2, 0x08, 0x06, 0, 1, 8, 0,
        6, 4, 0, 1,
    ];
    let records = vec![
        (
            BASE_TS,
            60,
            tcp_frame([10, 0, 0, 1], 1000, [10, 0, 0, 2], 2000, b""),
        ),
        (BASE_TS + 0.5, 22, arp),
        (
            BASE_TS + 1.0,
            60,
            tcp_frame([10, 0, 0, 1], 1001, [10, 0, 0, 2], 2000, b""),
        ),
    ];

    let file = write_temp(&legacy_pcap(&records), ".pcap");
    let outcome = Ingestor::new(&store, IngestOptions::default())
        .ingest(file.path(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.packets_seen, 3);
    assert_eq!(outcome.packets_skipped, 1);
    assert_eq!(outcome.flows_persisted, 2);
}

#[tokio::test]
async fn ingest_reads_pcapng_captures() {
    let store = Store::open_in_memory().await.unwrap();

    let records = vec![(
        BASE_TS + 0.25,
        60,
        tcp_frame([192, 168, 1, 100], 50000, [185, 220, 101, 1], 9001, b"x"),
    )];
    let flows =
        ingest_bytes(&store, &pcapng_capture(&records), false).await;
    assert_eq!(flows, 1);

    let all = store.flows().page_after(0, 10).await.unwrap();
    assert_eq!(all[0].ts_start.timestamp_micros() % 1_000_000, 250_000);
    assert_eq!(all[0].payload_prefix.as_deref(), Some(&b"x"[..]));
}

#[tokio::test]
async fn eager_and_streaming_modes_agree() {
    let records: Vec<(f64, u32, Vec<u8>)> = (0..20)
        .map(|i| {
            (
                BASE_TS + i as f64 * 0.1,
                60,
                tcp_frame(
                    [10, 0, 0, 1],
                    40000 + (i % 4) as u16,
                    [10, 0, 0, 2],
                    443,
                    b"",
                ),
            )
        })
        .collect();
    let capture = legacy_pcap(&records);

    let streaming_store = Store::open_in_memory().await.unwrap();
    let streamed = ingest_bytes(&streaming_store, &capture, false).await;

    let eager_store = Store::open_in_memory().await.unwrap();
    let eager = ingest_bytes(&eager_store, &capture, true).await;

    assert_eq!(streamed, eager);

    let mut streamed_keys: Vec<FlowKey> = streaming_store
        .flows()
        .page_after(0, 100)
        .await
        .unwrap()
        .iter()
        .map(|f| f.key)
        .collect();
    let mut eager_keys: Vec<FlowKey> = eager_store
        .flows()
        .page_after(0, 100)
        .await
        .unwrap()
        .iter()
        .map(|f| f.key)
        .collect();
    streamed_keys.sort_by_key(|k| (k.src_port, k.dst_port));
    eager_keys.sort_by_key(|k| (k.src_port, k.dst_port));
    assert_eq!(streamed_keys, eager_keys);
}

#[tokio::test]
async fn ingest_rejects_garbage_input() {
    let store = Store::open_in_memory().await.unwrap();
    let file = write_temp(b"this is not a capture file at all", ".pcap");

    let result = Ingestor::new(&store, IngestOptions::default())
        .ingest(file.path(), &CancellationToken::new())
        .await;
    assert!(result.is_err());
    assert_eq!(store.flows().count().await.unwrap(), 0);
}

#[tokio::test]
async fn directory_port_flow_gets_directory_fetch() {
    let store = Store::open_in_memory().await.unwrap();
    store
        .flows()
        .insert_batch(&[new_flow(
            "192.168.1.100",
            50000,
            "5.6.7.8",
            9030,
            0.0,
            1.0,
            10,
            1000,
            None,
        )])
        .await
        .unwrap();

    let flagged = classify_all(&store).await;
    assert_eq!(flagged, 1);

    let flow = &store.flows().page_after(0, 10).await.unwrap()[0];
    assert!(flow.indicators.directory_fetch);
    assert!(flow.indicators.relay_comm);
}

#[tokio::test]
async fn empty_payload_never_trips_payload_rules() {
    let store = Store::open_in_memory().await.unwrap();
    store
        .flows()
        .insert_batch(&[new_flow(
            "192.168.1.100",
            50000,
            "5.6.7.8",
            443,
            0.0,
            1.0,
            10,
            1000,
            None,
        )])
        .await
        .unwrap();

    classify_all(&store).await;
    let flow = &store.flows().page_after(0, 10).await.unwrap()[0];
    assert!(!flow.indicators.possible_handshake);
    assert!(!flow.indicators.obfuscated_candidate);
}

/// Solo connection to a known guard relay, no correlations: the
/// relay-match component clamps at its budget and the shape component
/// adds the relay port.
#[tokio::test]
async fn solo_relay_connection_scores_medium() {
    let store = Store::open_in_memory().await.unwrap();

    // 100 packets, 10000 bytes on the wire, no payload.
    let records: Vec<(f64, u32, Vec<u8>)> = (0..100)
        .map(|_| {
            (
                BASE_TS,
                100,
                tcp_frame(
                    [192, 168, 1, 100],
                    50000,
                    [185, 220, 101, 1],
                    9001,
                    b"",
                ),
            )
        })
        .collect();
    ingest_bytes(&store, &legacy_pcap(&records), false).await;

    load_relays(
        &store,
        serde_json::json!([{
            "address": "185.220.101.1",
            "port": 9001,
            "fingerprint": "ABC123",
            "nickname": "TestRelay",
            "flags": ["Guard", "Fast", "Stable"]
        }]),
    )
    .await;

    classify_all(&store).await;
    score_all(&store).await;

    let flow = &store.flows().page_after(0, 10).await.unwrap()[0];
    assert_eq!(flow.pkt_count, 100);
    assert_eq!(flow.byte_count, 10000);
    assert!(flow.indicators.relay_comm);
    assert!(!flow.indicators.possible_handshake);

    let scorer = Scorer::new(&store, SignatureSet::default(), 100);
    let breakdown = scorer.score_flow(flow.id).await.unwrap();
    // Node match 20 + Guard 8 + Fast 4 + relay_comm 12 = 44, clamped to 40.
    assert_eq!(breakdown.relay_match, 40.0);
    assert_eq!(breakdown.timing_correlation, 0.0);
    assert_eq!(breakdown.payload_patterns, 0.0);
    // Relay port only: exactly 100 packets and a zero-length duration add
    // nothing.
    assert_eq!(breakdown.traffic_shape, 5.0);
    assert_eq!(flow.confidence_score, breakdown.total);
    assert_eq!(
        flow.confidence_category,
        Some(ConfidenceCategory::Medium)
    );
}

/// Guard-then-open-destination pair half a second apart from the same
/// private host: exactly one entry/exit correlation.
#[tokio::test]
async fn entry_exit_pair_emits_one_correlation() {
    let store = Store::open_in_memory().await.unwrap();

    let handshake = {
        let mut p = vec![0x16, 0x03, 0x01];
        p.extend_from_slice(&[0x00, 0x00, 0x00]);
        p
    };
    store
        .flows()
        .insert_batch(&[
            new_flow(
                "192.168.1.100",
                50000,
                "185.220.101.1",
                9001,
                0.0,
                5.0,
                100,
                10000,
                None,
            ),
            new_flow(
                "192.168.1.100",
                50001,
                "8.8.8.8",
                443,
                0.5,
                5.0,
                100,
                10000,
                Some(handshake),
            ),
        ])
        .await
        .unwrap();

    load_relays(
        &store,
        serde_json::json!([{
            "address": "185.220.101.1",
            "flags": ["Guard"]
        }]),
    )
    .await;

    let flagged = classify_all(&store).await;
    assert_eq!(flagged, 2);
    assert!(store
        .flows()
        .page_after(0, 10)
        .await
        .unwrap()
        .iter()
        .all(|f| f.has_indicator()));

    let outcome = Correlator::new(&store, CorrelateOptions::default())
        .run()
        .await
        .unwrap();
    assert_eq!(outcome.correlations_persisted, 1);
    assert_eq!(outcome.candidate_circuits.len(), 1);

    let flows = store.flows().page_after(0, 10).await.unwrap();
    let correlations =
        store.correlations().touching(flows[0].id).await.unwrap();
    assert_eq!(correlations.len(), 1);
    let correlation = &correlations[0];
    assert_eq!(correlation.kind, CorrelationKind::EntryExit);
    // 0.4 timing + 0.3 entry/exit + 0.2 identical sizing + 0.1 same source.
    assert!(correlation.weight >= 0.8);
    assert!(correlation.flow_a < correlation.flow_b);
}

/// Public-source flows are classified but never correlated.
#[tokio::test]
async fn public_sources_never_enter_correlations() {
    let store = Store::open_in_memory().await.unwrap();

    store
        .flows()
        .insert_batch(&[
            new_flow(
                "8.8.4.4",
                40000,
                "185.220.101.1",
                9001,
                0.0,
                1.0,
                10,
                1000,
                None,
            ),
            new_flow(
                "192.168.1.100",
                50000,
                "185.220.101.1",
                9001,
                0.1,
                1.0,
                10,
                1000,
                None,
            ),
        ])
        .await
        .unwrap();

    load_relays(
        &store,
        serde_json::json!([{ "address": "185.220.101.1", "flags": ["Guard"] }]),
    )
    .await;

    let flagged = classify_all(&store).await;
    assert_eq!(flagged, 2);

    let outcome = Correlator::new(&store, CorrelateOptions::default())
        .run()
        .await
        .unwrap();
    // Only one private-source candidate: nothing to pair.
    assert_eq!(outcome.correlations_persisted, 0);
}

/// A long markerless high-diversity payload trips the obfuscation rule
/// and dominates the payload component.
#[tokio::test]
async fn obfuscated_payload_lifts_score() {
    let store = Store::open_in_memory().await.unwrap();

    let payload: Vec<u8> = (0..200u16).map(|i| (i % 251) as u8).collect();
    store
        .flows()
        .insert_batch(&[new_flow(
            "192.168.1.100",
            50000,
            "203.0.113.7",
            443,
            0.0,
            1.0,
            10,
            1000,
            Some(payload),
        )])
        .await
        .unwrap();

    classify_all(&store).await;
    score_all(&store).await;

    let flow = &store.flows().page_after(0, 10).await.unwrap()[0];
    assert!(flow.indicators.obfuscated_candidate);

    let scorer = Scorer::new(&store, SignatureSet::default(), 100);
    let breakdown = scorer.score_flow(flow.id).await.unwrap();
    assert_eq!(breakdown.payload_patterns, 16.0);
    assert_eq!(breakdown.relay_match, 16.0);
}

/// Two weakly related flows below the weight threshold: no row.
#[tokio::test]
async fn threshold_gates_weak_pairs() {
    let store = Store::open_in_memory().await.unwrap();

    store
        .flows()
        .insert_batch(&[
            new_flow(
                "192.168.1.1",
                40000,
                "198.51.100.1",
                9050,
                0.0,
                1.0,
                1,
                1_000_000,
                None,
            ),
            new_flow(
                "192.168.1.2",
                40001,
                "198.51.100.2",
                9050,
                9.5,
                1.0,
                1000,
                1000,
                None,
            ),
        ])
        .await
        .unwrap();

    classify_all(&store).await;
    let outcome = Correlator::new(&store, CorrelateOptions::default())
        .run()
        .await
        .unwrap();
    assert_eq!(outcome.correlations_persisted, 0);
}

/// Flows outside the window are never even paired.
#[tokio::test]
async fn window_cutoff_excludes_distant_flows() {
    let store = Store::open_in_memory().await.unwrap();

    store
        .flows()
        .insert_batch(&[
            new_flow(
                "192.168.1.100",
                50000,
                "185.220.101.1",
                9001,
                0.0,
                1.0,
                100,
                10000,
                None,
            ),
            new_flow(
                "192.168.1.100",
                50001,
                "185.220.102.2",
                9001,
                11.0,
                1.0,
                100,
                10000,
                None,
            ),
        ])
        .await
        .unwrap();

    load_relays(
        &store,
        serde_json::json!([{ "address": "185.220.101.1", "flags": ["Guard"] }]),
    )
    .await;
    let flagged = classify_all(&store).await;
    assert_eq!(flagged, 2);

    // Inside the window this same-source pair would clear the threshold;
    // at 11 seconds apart it is never considered.
    let outcome = Correlator::new(&store, CorrelateOptions::default())
        .run()
        .await
        .unwrap();
    assert_eq!(outcome.correlations_persisted, 0);
}

#[tokio::test]
async fn classifier_is_idempotent() {
    let store = Store::open_in_memory().await.unwrap();

    store
        .flows()
        .insert_batch(&[
            new_flow(
                "192.168.1.100",
                50000,
                "185.220.101.1",
                9001,
                0.0,
                1.0,
                10,
                1000,
                Some(vec![0x16, 0x03, 0x00, 0x00, 0x00]),
            ),
            new_flow(
                "192.168.1.101",
                50001,
                "8.8.8.8",
                53,
                1.0,
                1.0,
                5,
                500,
                None,
            ),
        ])
        .await
        .unwrap();

    let first = classify_all(&store).await;
    let snapshot_one: Vec<_> = store
        .flows()
        .page_after(0, 10)
        .await
        .unwrap()
        .iter()
        .map(|f| f.indicators)
        .collect();

    let second = classify_all(&store).await;
    let snapshot_two: Vec<_> = store
        .flows()
        .page_after(0, 10)
        .await
        .unwrap()
        .iter()
        .map(|f| f.indicators)
        .collect();

    assert_eq!(first, second);
    assert_eq!(snapshot_one, snapshot_two);
}

#[tokio::test]
async fn scorer_is_idempotent() {
    let store = Store::open_in_memory().await.unwrap();

    store
        .flows()
        .insert_batch(&[
            new_flow(
                "192.168.1.100",
                50000,
                "185.220.101.1",
                9001,
                0.0,
                120.0,
                150,
                20000,
                None,
            ),
            new_flow(
                "192.168.1.100",
                50001,
                "8.8.8.8",
                443,
                0.5,
                120.0,
                150,
                20000,
                None,
            ),
        ])
        .await
        .unwrap();

    load_relays(
        &store,
        serde_json::json!([{ "address": "185.220.101.1", "flags": ["Guard", "Exit"] }]),
    )
    .await;
    classify_all(&store).await;
    Correlator::new(&store, CorrelateOptions::default())
        .run()
        .await
        .unwrap();

    score_all(&store).await;
    let first: Vec<(f64, Option<ConfidenceCategory>)> = store
        .flows()
        .page_after(0, 10)
        .await
        .unwrap()
        .iter()
        .map(|f| (f.confidence_score, f.confidence_category))
        .collect();

    score_all(&store).await;
    let second: Vec<(f64, Option<ConfidenceCategory>)> = store
        .flows()
        .page_after(0, 10)
        .await
        .unwrap()
        .iter()
        .map(|f| (f.confidence_score, f.confidence_category))
        .collect();

    assert_eq!(first, second);
    for (score, category) in &first {
        assert!((0.0..=100.0).contains(score));
        assert_eq!(
            *category,
            Some(ConfidenceCategory::from_score(*score))
        );
    }
}

#[tokio::test]
async fn raising_threshold_never_adds_correlations() {
    let store = Store::open_in_memory().await.unwrap();

    // A burst of same-source relay flows produces a spread of weights.
    let flows: Vec<NewFlow> = (0..6)
        .map(|i| {
            new_flow(
                "192.168.1.100",
                50000 + i as u16,
                "185.220.101.1",
                9001,
                i as f64 * 1.8,
                2.0,
                10 + i,
                1000 + 300 * i,
                None,
            )
        })
        .collect();
    store.flows().insert_batch(&flows).await.unwrap();

    load_relays(
        &store,
        serde_json::json!([{ "address": "185.220.101.1", "flags": ["Guard"] }]),
    )
    .await;
    classify_all(&store).await;

    let mut previous = u64::MAX;
    for threshold in [0.1, 0.3, 0.5, 0.8, 1.2] {
        let outcome = Correlator::new(
            &store,
            CorrelateOptions {
                min_weight: threshold,
                ..Default::default()
            },
        )
        .run()
        .await
        .unwrap();
        assert!(
            outcome.correlations_persisted <= previous,
            "threshold {threshold} increased the correlation count"
        );
        previous = outcome.correlations_persisted;

        // The persisted set is rebuilt from scratch on each pass.
        assert_eq!(
            store.correlations().count().await.unwrap(),
            outcome.correlations_persisted
        );
    }
}

#[tokio::test]
async fn deleting_a_flow_cascades_its_correlations() {
    let store = Store::open_in_memory().await.unwrap();

    store
        .flows()
        .insert_batch(&[
            new_flow(
                "192.168.1.100",
                50000,
                "185.220.101.1",
                9001,
                0.0,
                1.0,
                10,
                1000,
                None,
            ),
            new_flow(
                "192.168.1.100",
                50001,
                "185.220.101.1",
                9001,
                0.4,
                1.0,
                10,
                1000,
                None,
            ),
        ])
        .await
        .unwrap();

    load_relays(
        &store,
        serde_json::json!([{ "address": "185.220.101.1", "flags": ["Guard"] }]),
    )
    .await;
    classify_all(&store).await;
    let outcome = Correlator::new(&store, CorrelateOptions::default())
        .run()
        .await
        .unwrap();
    assert!(outcome.correlations_persisted >= 1);

    let flows = store.flows().page_after(0, 10).await.unwrap();
    assert!(store.flows().delete(flows[0].id).await.unwrap());
    assert_eq!(store.correlations().count().await.unwrap(), 0);
}

#[tokio::test]
async fn directory_reload_upserts_by_address() {
    let store = Store::open_in_memory().await.unwrap();

    load_relays(
        &store,
        serde_json::json!([{
            "address": "185.220.101.1",
            "port": 9001,
            "nickname": "first",
            "flags": ["Guard"]
        }]),
    )
    .await;

    let original = store
        .relays()
        .find_by_address("185.220.101.1".parse().unwrap())
        .await
        .unwrap()
        .unwrap();

    load_relays(
        &store,
        serde_json::json!([{
            "address": "185.220.101.1",
            "port": 9002,
            "nickname": "renamed",
            "flags": ["Guard", "Exit"]
        }]),
    )
    .await;

    let updated = store
        .relays()
        .find_by_address("185.220.101.1".parse().unwrap())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(store.relays().count().await.unwrap(), 1);
    assert_eq!(updated.id, original.id);
    assert_eq!(updated.port, 9002);
    assert_eq!(updated.nickname.as_deref(), Some("renamed"));
    assert_eq!(updated.flags, vec!["Guard", "Exit"]);

    let exits = store
        .relays()
        .by_flag(veiltrace_model::RelayFlag::Exit)
        .await
        .unwrap();
    assert_eq!(exits.len(), 1);
    assert_eq!(exits[0].id, original.id);
}

#[tokio::test]
async fn classifier_stops_at_batch_boundary_when_cancelled() {
    let store = Store::open_in_memory().await.unwrap();

    store
        .flows()
        .insert_batch(&[
            new_flow(
                "192.168.1.100",
                50000,
                "1.2.3.4",
                9030,
                0.0,
                1.0,
                10,
                1000,
                None,
            ),
            new_flow(
                "192.168.1.101",
                50001,
                "1.2.3.4",
                9030,
                1.0,
                1.0,
                10,
                1000,
                None,
            ),
        ])
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();

    // Batch size 1: exactly one batch commits before the cancel is seen.
    let flagged = Classifier::new(&store, SignatureSet::default(), 1)
        .run(&cancel)
        .await
        .unwrap();
    assert_eq!(flagged, 1);

    let flows = store.flows().page_after(0, 10).await.unwrap();
    assert!(flows[0].indicators.directory_fetch);
    assert!(!flows[1].indicators.directory_fetch);
}

#[tokio::test]
async fn store_lookups_cover_indexed_columns() {
    let store = Store::open_in_memory().await.unwrap();

    store
        .flows()
        .insert_batch(&[
            new_flow(
                "192.168.1.100",
                50000,
                "185.220.101.1",
                9001,
                0.0,
                1.0,
                10,
                1000,
                None,
            ),
            new_flow(
                "192.168.1.101",
                50001,
                "8.8.8.8",
                53,
                5.0,
                1.0,
                5,
                500,
                None,
            ),
        ])
        .await
        .unwrap();
    classify_all(&store).await;
    score_all(&store).await;

    let by_src = store
        .flows()
        .by_src_addr("192.168.1.100".parse().unwrap())
        .await
        .unwrap();
    assert_eq!(by_src.len(), 1);

    let by_dst = store
        .flows()
        .by_dst_addr("8.8.8.8".parse().unwrap())
        .await
        .unwrap();
    assert_eq!(by_dst.len(), 1);
    assert_eq!(by_dst[0].key.dst_port, 53);

    let base = chrono::DateTime::from_timestamp_micros(
        (BASE_TS * 1_000_000.0) as i64,
    )
    .unwrap();
    let in_range = store
        .flows()
        .in_time_range(base, base + chrono::Duration::seconds(2))
        .await
        .unwrap();
    assert_eq!(in_range.len(), 1);

    let scored = store.flows().with_min_score(0.0).await.unwrap();
    assert_eq!(scored.len(), 2);
    assert!(scored[0].confidence_score >= scored[1].confidence_score);

    let low = store
        .flows()
        .by_category(ConfidenceCategory::Low)
        .await
        .unwrap();
    for flow in &low {
        assert_eq!(
            flow.confidence_category,
            Some(ConfidenceCategory::Low)
        );
    }
}

#[tokio::test]
async fn flow_stream_is_ordered_by_start_time() {
    let store = Store::open_in_memory().await.unwrap();

    // Insert out of chronological order; ids and timestamps disagree.
    store
        .flows()
        .insert_batch(&[
            new_flow(
                "10.0.0.1", 1000, "10.0.0.2", 80, 5.0, 1.0, 1, 100, None,
            ),
            new_flow(
                "10.0.0.1", 1001, "10.0.0.2", 80, 1.0, 1.0, 1, 100, None,
            ),
            new_flow(
                "10.0.0.1", 1002, "10.0.0.2", 80, 3.0, 1.0, 1, 100, None,
            ),
        ])
        .await
        .unwrap();

    use futures::StreamExt;
    let mut stream = store.flows().stream_by_start();
    let mut starts = Vec::new();
    while let Some(flow) = stream.next().await {
        starts.push(flow.unwrap().ts_start);
    }
    assert_eq!(starts.len(), 3);
    assert!(starts.windows(2).all(|w| w[0] <= w[1]));
}

#[tokio::test]
async fn reports_are_append_only_counters() {
    let store = Store::open_in_memory().await.unwrap();

    let id = store
        .reports()
        .append(&veiltrace_model::NewReport {
            title: "first pass".into(),
            report_type: Some("summary".into()),
            file_path: None,
            summary: Some("empty store".into()),
            total_flows: 0,
            suspect_flows: 0,
            critical_flows: 0,
        })
        .await
        .unwrap();
    assert!(id > 0);

    let listed = store.reports().list().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].title, "first pass");
    assert_eq!(store.reports().count().await.unwrap(), 1);
}

#[tokio::test]
async fn reset_drops_all_state() {
    let store = Store::open_in_memory().await.unwrap();

    store
        .flows()
        .insert_batch(&[new_flow(
            "192.168.1.100",
            50000,
            "185.220.101.1",
            9001,
            0.0,
            1.0,
            10,
            1000,
            None,
        )])
        .await
        .unwrap();
    load_relays(
        &store,
        serde_json::json!([{ "address": "185.220.101.1" }]),
    )
    .await;

    store.reset().await.unwrap();

    assert_eq!(store.flows().count().await.unwrap(), 0);
    assert_eq!(store.relays().count().await.unwrap(), 0);
    assert_eq!(store.correlations().count().await.unwrap(), 0);
    assert_eq!(store.reports().count().await.unwrap(), 0);
}

#[tokio::test]
async fn contract_violations_abort_the_batch() {
    let store = Store::open_in_memory().await.unwrap();

    let mut zero_packets = new_flow(
        "192.168.1.100",
        50000,
        "185.220.101.1",
        9001,
        0.0,
        1.0,
        10,
        1000,
        None,
    );
    zero_packets.pkt_count = 0;
    zero_packets.byte_count = 0;

    let result = store.flows().insert_batch(&[zero_packets]).await;
    assert!(matches!(
        result,
        Err(veiltrace_core::PipelineError::Contract(_))
    ));
    assert_eq!(store.flows().count().await.unwrap(), 0);
}
