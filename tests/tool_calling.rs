/// End-to-end tests for tool invocations flowing through a stream session
///
/// Exercises tool-call requests, fragmented tool-use events, failures, and
/// the argument aggregator against arbitrary fragment boundaries.
use eventstream_gateway::config::StreamConfig;
use eventstream_gateway::models::claude::{Delta, StopReason, StreamEvent};
use eventstream_gateway::streaming::frame::{encode_event, encode_message};
use eventstream_gateway::streaming::headers::{EVENT_TYPE, Headers, MESSAGE_TYPE};
use eventstream_gateway::streaming::{
    ArgumentAggregator, RequestDescriptor, StreamSession, ToolLifecycleManager, ToolStatus,
};
use serde_json::json;

fn session() -> StreamSession {
    let request = RequestDescriptor {
        model: "claude-sonnet-4-5".to_string(),
        stream: true,
        input_tokens: 42,
    };
    let mut session = StreamSession::new(&request, &StreamConfig::default());
    session.start().unwrap();
    session
}

fn names(events: &[StreamEvent]) -> Vec<&'static str> {
    events.iter().map(StreamEvent::event_name).collect()
}

#[test]
fn test_get_weather_tool_call_request() {
    let mut session = session();

    let events = session
        .ingest(&encode_event(
            "toolCallRequest",
            &json!({
                "toolCallId": "toolu_weather",
                "name": "get_weather",
                "arguments": {"location": "SF"}
            }),
        ))
        .unwrap();

    // intro text block, closed as soon as the tool block starts
    assert_eq!(
        names(&events),
        vec![
            "content_block_start",
            "content_block_delta",
            "content_block_stop",
            "content_block_start",
            "content_block_delta"
        ]
    );
    assert_eq!(events[1], StreamEvent::text_delta(0, ""));
    assert_eq!(
        events[3],
        StreamEvent::tool_use_start(1, "toolu_weather", "get_weather")
    );
    assert_eq!(
        events[4],
        StreamEvent::input_json_delta(1, r#"{"location":"SF"}"#)
    );

    let events = session
        .ingest(&encode_event("completion", &json!({"content": ""})))
        .unwrap();
    assert_eq!(events, vec![StreamEvent::ContentBlockStop { index: 1 }]);

    let end = session.finish().unwrap();
    assert_eq!(names(&end), vec!["message_delta", "message_stop"]);
    match &end[0] {
        StreamEvent::MessageDelta { delta, usage } => {
            assert_eq!(delta.stop_reason, Some(StopReason::ToolUse));
            assert_eq!(usage.input_tokens, 42);
            // 12 structural + 17 chars of arguments / 4
            assert_eq!(usage.output_tokens, 16);
        }
        other => panic!("Expected message_delta, got {:?}", other),
    }
}

#[test]
fn test_text_then_two_fragmented_tools() {
    let mut session = session();
    let mut events = Vec::new();

    events.extend(
        session
            .ingest(&encode_event(
                "assistantResponseEvent",
                &json!({"content": "Let me look."}),
            ))
            .unwrap(),
    );
    for (id, input, stop) in [
        ("a", "{\"path\":", false),
        ("b", "{}", true),
        ("a", "\"src\"}", true),
    ] {
        events.extend(
            session
                .ingest(&encode_event(
                    "toolUseEvent",
                    &json!({"toolUseId": id, "name": "Read", "input": input, "stop": stop}),
                ))
                .unwrap(),
        );
    }
    events.extend(session.finish().unwrap());

    let starts: Vec<usize> = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::ContentBlockStart { index, .. } => Some(*index),
            _ => None,
        })
        .collect();
    assert_eq!(starts, vec![0, 1, 2]);

    let args_a: String = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::ContentBlockDelta {
                index: 1,
                delta: Delta::InputJsonDelta { partial_json },
            } => Some(partial_json.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(args_a, r#"{"path":"src"}"#);

    // real text plus the empty intro delta sent with the first tool
    let text_deltas = events
        .iter()
        .filter(|e| matches!(e, StreamEvent::ContentBlockDelta { index: 0, .. }))
        .count();
    assert_eq!(text_deltas, 2);

    let stops: Vec<usize> = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::ContentBlockStop { index } => Some(*index),
            _ => None,
        })
        .collect();
    assert_eq!(stops, vec![0, 2, 1]);
    assert_eq!(names(&events).last(), Some(&"message_stop"));
}

#[test]
fn test_tool_call_error() {
    let mut session = session();
    session
        .ingest(&encode_event(
            "toolCallRequest",
            &json!({"toolCallId": "c1", "name": "run", "arguments": "{}"}),
        ))
        .unwrap();
    let events = session
        .ingest(&encode_event(
            "toolCallError",
            &json!({"toolCallId": "c1", "error": "sandbox denied"}),
        ))
        .unwrap();

    assert_eq!(names(&events), vec!["error", "content_block_stop"]);
    match &events[0] {
        StreamEvent::Error { error } => assert!(error.message.contains("sandbox denied")),
        other => panic!("Expected error, got {:?}", other),
    }

    // later fragments for the failed tool are ignored
    let late = session
        .ingest(&encode_event(
            "toolUseEvent",
            &json!({"toolUseId": "c1", "name": "run", "input": "{}", "stop": true}),
        ))
        .unwrap();
    assert!(late.is_empty());
}

#[test]
fn test_multibyte_character_split_between_tool_events() {
    let mut session = session();
    let headers = Headers::new()
        .with_str(MESSAGE_TYPE, "event")
        .with_str(EVENT_TYPE, "toolUseEvent");

    let mut events = Vec::new();
    for payload in [
        &b"{\"toolUseId\":\"t1\",\"name\":\"geo\",\"input\":\"{\\\"city\\\":\\\"Z\xC3\",\"stop\":false}"[..],
        &b"{\"toolUseId\":\"t1\",\"name\":\"geo\",\"input\":\"\xBCrich\\\"}\",\"stop\":true}"[..],
    ] {
        events.extend(session.ingest(&encode_message(&headers, payload)).unwrap());
    }
    events.extend(session.finish().unwrap());

    let arguments: String = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::ContentBlockDelta {
                index: 1,
                delta: Delta::InputJsonDelta { partial_json },
            } => Some(partial_json.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(arguments, r#"{"city":"Zürich"}"#);
    let parsed: serde_json::Value = serde_json::from_str(&arguments).unwrap();
    assert_eq!(parsed, json!({"city": "Zürich"}));

    let summary = session.release(None);
    assert_eq!(summary.stop_reason, Some(StopReason::ToolUse));
}

#[test]
fn test_block_indices_survive_failures() {
    let mut tools = ToolLifecycleManager::new();
    tools.register_or_update("one", "a", &json!({}));
    tools.fail("one", "boom");
    tools.register_or_update("two", "b", &json!({}));
    tools.register_or_update("one", "a", &json!({}));
    tools.register_or_update("three", "c", &json!({}));

    assert_eq!(tools.block_index("one"), Some(1));
    assert_eq!(tools.block_index("two"), Some(2));
    assert_eq!(tools.block_index("three"), Some(3));
    assert_eq!(tools.get("one").unwrap().status, ToolStatus::Error);
    assert_eq!(tools.get("two").unwrap().status, ToolStatus::Running);
}

#[test]
fn test_aggregator_any_split_point() {
    let original = json!({"pattern": "**/*.go", "note": "naïve café ✓ 🚀"});
    let text = original.to_string();
    let bytes = text.as_bytes();

    for first in 1..bytes.len() {
        for second in first..bytes.len() {
            let mut aggregator = ArgumentAggregator::new();
            let a = aggregator.process("t", "Glob", &bytes[..first], false);
            let b = aggregator.process("t", "Glob", &bytes[first..second], false);
            let c = aggregator.process("t", "Glob", &bytes[second..], true);

            assert!(!a.complete && !b.complete && c.complete);
            let emitted = format!("{}{}{}", a.emitted, b.emitted, c.emitted);
            assert_eq!(emitted, text);
            assert_eq!(c.parsed, original);
            assert_eq!(aggregator.active_count(), 0);
        }
    }
}

#[test]
fn test_aggregator_documented_example() {
    let mut aggregator = ArgumentAggregator::new();
    aggregator.process("t", "Glob", br#"{"pattern""#, false);
    aggregator.process("t", "Glob", br#":"**/*.go""#, false);
    let done = aggregator.process("t", "Glob", b"}", true);
    assert!(done.complete);
    assert_eq!(done.arguments, r#"{"pattern":"**/*.go"}"#);
    assert_eq!(done.parsed, json!({"pattern": "**/*.go"}));

    let empty = aggregator.process("z", "Noop", b" {} ", true);
    assert!(empty.complete);
    assert_eq!(empty.parsed, json!({}));
}
