//! Tests for daemon stream normalization: legacy NDJSON shapes, trace
//! envelopes, and the multi-producer message channel.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use abox::protocol::{
    message_channel, parse_line, parse_push_status, AuxPayload, ResponseMessage,
};

// =============================================================================
// Legacy NDJSON shapes
// =============================================================================

#[test]
fn test_status_with_progress() {
    let messages = parse_line(r#"{"status":"Downloading","progress":"[=>  ] 12MB/96MB"}"#);
    assert_eq!(
        messages,
        vec![ResponseMessage::Status {
            message: "Downloading".to_string(),
            progress: Some("[=>  ] 12MB/96MB".to_string()),
        }]
    );
}

#[test]
fn test_stream_text_is_preserved() {
    let messages = parse_line(r#"{"stream":"Step 2/4 : RUN make\n"}"#);
    assert_eq!(
        messages,
        vec![ResponseMessage::Stream("Step 2/4 : RUN make\n".to_string())]
    );
    assert_eq!(messages[0].summary(), "Step 2/4 : RUN make");
}

#[test]
fn test_error_detail_wins_over_error() {
    let messages = parse_line(r#"{"error":"short","errorDetail":{"message":"the long story"}}"#);
    assert_eq!(
        messages,
        vec![ResponseMessage::Error("the long story".to_string())]
    );
}

#[test]
fn test_unparseable_lines_degrade_to_stream() {
    let messages = parse_line("plain text that is not json");
    assert_eq!(
        messages,
        vec![ResponseMessage::Stream(
            "plain text that is not json".to_string()
        )]
    );
}

#[test]
fn test_blank_lines_produce_nothing() {
    assert!(parse_line("   ").is_empty());
    assert!(parse_line("").is_empty());
}

// =============================================================================
// Push digests
// =============================================================================

#[test]
fn test_push_digest_status_becomes_aux() {
    let payload = parse_push_status("v2: digest: sha256:00ff size: 1424").unwrap();
    assert_eq!(
        payload,
        AuxPayload::PushResult {
            tag: "v2".to_string(),
            digest: "sha256:00ff".to_string(),
            size: 1424,
        }
    );
}

#[test]
fn test_ordinary_push_statuses_are_not_digests() {
    assert!(parse_push_status("Pushing [==>]").is_none());
    assert!(parse_push_status("v2: digest: md5:nope size: 12").is_none());
    assert!(parse_push_status("v2: digest: sha256:00ff").is_none());
}

// =============================================================================
// Trace envelopes
// =============================================================================

#[test]
fn test_trace_vertexes_statuses_and_logs() {
    let report = serde_json::json!({
        "vertexes": [
            {"name": "[2/5] RUN apk add git", "completed": "2025-01-01T00:00:00Z"},
            {"name": "[3/5] COPY . .", "cached": true},
        ],
        "statuses": [{"id": "extracting", "current": 10, "total": 40}],
        "logs": [{"msg": "fetch https://dl-cdn.alpinelinux.org\n"}],
    });
    let encoded = BASE64.encode(serde_json::to_vec(&report).unwrap());
    let line = format!(r#"{{"id":"moby.buildkit.trace","aux":"{encoded}"}}"#);

    let summaries: Vec<String> = parse_line(&line).iter().map(|m| m.summary()).collect();
    assert!(summaries.contains(&"[2/5] RUN apk add git".to_string()));
    assert!(summaries.contains(&"CACHED [3/5] COPY . .".to_string()));
    assert!(summaries.contains(&"extracting 10/40".to_string()));
    assert!(summaries.contains(&"fetch https://dl-cdn.alpinelinux.org".to_string()));
}

#[test]
fn test_undecodable_trace_payloads_do_not_fail_the_stream() {
    let line = r#"{"id":"moby.buildkit.trace","aux":"!!! not base64 !!!"}"#;
    let messages = parse_line(line);
    assert_eq!(messages.len(), 1);
    assert!(matches!(messages[0], ResponseMessage::Status { .. }));
}

// =============================================================================
// Message channel
// =============================================================================

#[tokio::test]
async fn test_reader_waits_for_every_producer() {
    let (sender, mut reader) = message_channel(2);
    let second = sender.clone();

    sender.send(ResponseMessage::status("from the first"));
    sender.finish();
    // One EOF down, the stream must stay open for the second producer.
    second.send(ResponseMessage::status("from the second"));
    second.finish();

    let mut seen = Vec::new();
    while let Some(message) = reader.next().await {
        seen.push(message.summary());
    }
    assert_eq!(seen, vec!["from the first", "from the second"]);
}

#[tokio::test]
async fn test_listen_collects_aux_and_surfaces_errors() {
    let (sender, reader) = message_channel(1);
    sender.send(ResponseMessage::Aux(AuxPayload::ImageId(
        "sha256:beef".to_string(),
    )));
    sender.send(ResponseMessage::Error("ran out of space".to_string()));
    sender.finish();

    let mut observed = 0;
    let result = reader.listen(|_| observed += 1).await;
    assert_eq!(observed, 2);
    assert!(result.is_err());
}

#[tokio::test]
async fn test_listen_returns_aux_payloads_on_success() {
    let (sender, reader) = message_channel(1);
    sender.send(ResponseMessage::status("pushing"));
    sender.send(ResponseMessage::Aux(AuxPayload::PushResult {
        tag: "v1".to_string(),
        digest: "sha256:aa".to_string(),
        size: 3,
    }));
    sender.finish();

    let aux = reader.listen(|_| {}).await.unwrap();
    assert_eq!(aux.len(), 1);
}

#[tokio::test]
async fn test_ndjson_feeder_parses_and_finishes() {
    let (sender, mut reader) = message_channel(1);
    let input: &[u8] = b"{\"status\":\"Pulling\"}\n{\"stream\":\"done\\n\"}\n";
    sender.feed_ndjson(input);

    let mut seen = Vec::new();
    while let Some(message) = reader.next().await {
        seen.push(message.summary());
    }
    assert_eq!(seen, vec!["Pulling", "done"]);
}
