use std::sync::Arc;

use serde_json::json;

use boardwalk_core::config::HarnessConfig;
use boardwalk_core::error::BoardwalkError;
use boardwalk_core::event::{EventBus, RunEvent};
use boardwalk_core::types::{Edge, GraphDescriptor, NodeDescriptor};
use boardwalk_runtime::{core_kit, HandlerRegistry, Harness, Run, SnapshotKind};
use boardwalk_test_utils::*;

fn registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register("passthrough", PassthroughHandler);
    registry.register("reverser", ReverserHandler);
    registry
}

async fn drain(run: &mut Run) -> Vec<RunEvent> {
    let mut events = Vec::new();
    while let Some(event) = run.next().await {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_linear_board_end_to_end() {
    let harness = Harness::new(registry());
    let mut run = harness.run(linear_board());

    let mut events = drain(&mut run).await;
    let pending = run.pending().expect("run should wait for input");
    assert_eq!(pending.node.id, "a");
    assert_eq!(pending.kind, SnapshotKind::Input);
    assert_eq!(pending.inputs["schema"]["required"], json!(["text"]));

    run.provide_input(values(json!({"text": "hello"}))).unwrap();
    events.extend(drain(&mut run).await);
    assert!(run.is_finished());
    assert!(run.error().is_none());

    assert_eq!(events_named(&events, "input").len(), 1);
    let outputs = events_named(&events, "output");
    assert_eq!(outputs.len(), 1);
    match outputs[0] {
        RunEvent::Output(data) => {
            assert_eq!(data.outputs, values(json!({"text": "hello"})));
            assert!(!data.bubbled);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(started_nodes(&events), vec!["a", "b", "c"]);
    assert_eq!(
        event_names(&events),
        vec![
            "start", "graphstart", "nodestart", "input", "pause", "resume", "nodeend",
            "nodestart", "nodeend", "nodestart", "output", "nodeend", "graphend", "end",
        ]
    );
    assert_eq!(run.outputs(), &[values(json!({"text": "hello"}))]);
}

#[tokio::test]
async fn test_preset_inputs_answer_root_input() {
    let harness = Harness::new(registry());
    let mut run = harness.run_with_inputs(linear_board(), values(json!({"text": "hi"})));
    let events = drain(&mut run).await;
    assert!(run.pending().is_none());
    assert_eq!(events_named(&events, "input").len(), 1);
    assert!(events_named(&events, "pause").is_empty());
    assert_eq!(run.outputs(), &[values(json!({"text": "hi"}))]);
}

#[tokio::test]
async fn test_preset_without_required_key_still_suspends() {
    let harness = Harness::new(registry());
    let mut run = harness.run_with_inputs(linear_board(), values(json!({"other": 1})));
    drain(&mut run).await;
    assert_eq!(run.pending().unwrap().node.id, "a");
}

#[tokio::test]
async fn test_unreachable_output_reports_stalled_ports() {
    let harness = Harness::new(registry());
    let mut run = harness.run(unreachable_board());
    drain(&mut run).await;
    run.provide_input(values(json!({"foo": "x"}))).unwrap();
    let events = drain(&mut run).await;

    assert_eq!(
        event_names(&events),
        vec!["resume", "nodeend", "skip", "skip", "error", "end"]
    );
    match &events[4] {
        RunEvent::Error(data) => {
            assert_eq!(data.kind, "OutputUnreachable");
            assert!(data.message.contains("b missing [bar]"));
        }
        other => panic!("unexpected {:?}", other),
    }
    match run.error() {
        Some(BoardwalkError::OutputUnreachable { outputs, stalled }) => {
            assert_eq!(outputs, &vec!["c".to_string()]);
            assert_eq!(stalled[0].node, "b");
            assert_eq!(stalled[0].missing, vec!["bar".to_string()]);
            assert_eq!(stalled[1].node, "c");
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_portless_edges_from_skipped_node_stay_unreachable() {
    for edge in [Edge::wildcard("b", "c"), Edge::control("b", "c")] {
        let board = GraphDescriptor::new(
            vec![
                NodeDescriptor::new("a", "input"),
                NodeDescriptor::new("b", "passthrough"),
                NodeDescriptor::new("c", "output"),
            ],
            vec![Edge::new("a", "text", "b", "bar"), edge],
        );
        let mut run = Harness::new(registry()).run_with_inputs(board, values(json!({"foo": "x"})));
        let events = drain(&mut run).await;

        assert_eq!(
            event_names(&events),
            vec!["start", "graphstart", "nodestart", "input", "nodeend", "skip", "skip", "error", "end"]
        );
        assert!(run.outputs().is_empty());
        match run.error() {
            Some(BoardwalkError::OutputUnreachable { outputs, stalled }) => {
                assert_eq!(outputs, &vec!["c".to_string()]);
                assert_eq!(stalled[1].node, "c");
                assert_eq!(stalled[1].missing, vec!["*".to_string()]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_run_once_surfaces_unreachable() {
    let harness = Harness::new(registry());
    let err = harness
        .run_once(unreachable_board(), values(json!({"foo": "x"})))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "OutputUnreachable");

    let out = harness
        .run_once(linear_board(), values(json!({"text": "once"})))
        .await
        .unwrap();
    assert_eq!(out, values(json!({"text": "once"})));
}

#[tokio::test]
async fn test_visit_order_is_deterministic() {
    let mut orders = Vec::new();
    for _ in 0..2 {
        let recorder = RecordingHandler::new();
        let mut registry = HandlerRegistry::new();
        registry.register("record", recorder.clone());
        let mut run = Harness::new(registry).run(diamond_board());
        let events = drain(&mut run).await;
        assert!(run.error().is_none());
        assert_eq!(events_named(&events, "output").len(), 2);
        orders.push(recorder.calls());
    }
    assert_eq!(orders[0], vec!["s", "l", "r", "j", "j"]);
    assert_eq!(orders[0], orders[1]);
}

#[tokio::test]
async fn test_stop_on_output_ends_after_first_output() {
    let mut registry = HandlerRegistry::new();
    registry.register("record", RecordingHandler::new());
    let config = HarnessConfig {
        stop_on_output: true,
        ..HarnessConfig::default()
    };
    let mut run = Harness::new(registry).with_config(config).run(diamond_board());
    let events = drain(&mut run).await;
    assert_eq!(events_named(&events, "output").len(), 1);
    assert_eq!(event_names(&events).last(), Some(&"end"));
    assert!(run.is_finished());
}

#[tokio::test]
async fn test_constant_edge_reaches_every_invocation() {
    let mut board = diamond_board();
    board.nodes.push(NodeDescriptor::new("k", "record"));
    board.edges.push(Edge::new("k", "out", "j", "tag").constant());

    let recorder = RecordingHandler::new();
    let mut registry = HandlerRegistry::new();
    registry.register("record", recorder.clone());
    let mut run = Harness::new(registry).run(board);
    let events = drain(&mut run).await;

    assert!(run.error().is_none());
    assert_eq!(recorder.calls(), vec!["s", "k", "l", "r", "j", "j"]);
    let tags: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            RunEvent::NodeStart(d) if d.node.id == "j" => Some(d.inputs["tag"].clone()),
            _ => None,
        })
        .collect();
    assert_eq!(tags, vec![json!("k"), json!("k")]);
    let skipped: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            RunEvent::Skip(d) => Some(d.node.id.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(skipped, vec!["j", "out"]);
}

#[tokio::test]
async fn test_handler_not_found_ends_run() {
    let board = GraphDescriptor::new(vec![NodeDescriptor::new("m", "mystery")], vec![]);
    let mut run = Harness::new(HandlerRegistry::new()).run(board);
    let events = drain(&mut run).await;
    assert_eq!(
        event_names(&events),
        vec!["start", "graphstart", "nodestart", "error", "end"]
    );
    match &events[3] {
        RunEvent::Error(data) => {
            assert_eq!(data.kind, "HandlerNotFound");
            assert_eq!(data.node.as_deref(), Some("m"));
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(run.is_finished());
    assert!(run.next().await.is_none());
}

#[tokio::test]
async fn test_handler_failure_leaves_no_output() {
    let mut registry = registry();
    registry.register("passthrough", FailingHandler("upstream exploded".into()));
    let mut run = Harness::new(registry).run_with_inputs(linear_board(), values(json!({"text": "x"})));
    let events = drain(&mut run).await;

    assert!(events_named(&events, "output").is_empty());
    let errors = events_named(&events, "error");
    assert_eq!(errors.len(), 1);
    match errors[0] {
        RunEvent::Error(data) => {
            assert_eq!(data.kind, "HandlerInvocationFailure");
            assert_eq!(data.node.as_deref(), Some("b"));
            assert!(data.message.contains("upstream exploded"));
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_unhandled_error_port_fails_run() {
    let mut registry = HandlerRegistry::new();
    registry.register_kit(core_kit());
    let board = GraphDescriptor::new(
        vec![
            NodeDescriptor::new("f", "fail").with_config("message", json!("boom")),
            NodeDescriptor::new("o", "output"),
        ],
        vec![Edge::new("f", "result", "o", "result")],
    );
    let mut run = Harness::new(registry).run(board);
    drain(&mut run).await;
    match run.error() {
        Some(BoardwalkError::HandlerInvocation { node, message }) => {
            assert_eq!(node, "f");
            assert_eq!(message, "boom");
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_no_entry_node() {
    let board = GraphDescriptor::new(
        vec![NodeDescriptor::new("a", "passthrough"), NodeDescriptor::new("b", "passthrough")],
        vec![Edge::new("a", "out", "b", "in"), Edge::new("b", "out", "a", "in")],
    );
    let mut run = Harness::new(registry()).run(board);
    let events = drain(&mut run).await;
    assert_eq!(event_names(&events), vec!["start", "error", "end"]);
    assert!(matches!(run.error(), Some(BoardwalkError::NoEntryNode)));
}

#[tokio::test]
async fn test_invalid_board_is_reported() {
    let board = GraphDescriptor::new(
        vec![NodeDescriptor::new("a", "passthrough")],
        vec![Edge::new("a", "out", "ghost", "in")],
    );
    let mut run = Harness::new(registry()).run(board);
    drain(&mut run).await;
    assert_eq!(run.error().map(|e| e.kind()), Some("InvalidGraph"));
}

#[tokio::test]
async fn test_step_limit() {
    let config = HarnessConfig {
        max_steps: 2,
        ..HarnessConfig::default()
    };
    let mut run = Harness::new(registry())
        .with_config(config)
        .run_with_inputs(linear_board(), values(json!({"text": "x"})));
    drain(&mut run).await;
    assert!(matches!(run.error(), Some(BoardwalkError::StepLimitExceeded(2))));
}

#[tokio::test]
async fn test_cancelled_between_steps() {
    let harness = Harness::new(registry());
    harness.cancel_token().cancel();
    let mut run = harness.run_with_inputs(linear_board(), values(json!({"text": "x"})));
    let events = drain(&mut run).await;
    assert_eq!(event_names(&events), vec!["start", "graphstart", "error", "end"]);
    assert!(matches!(run.error(), Some(BoardwalkError::Cancelled)));
}

#[tokio::test]
async fn test_streaming_handler_outputs_are_folded() {
    let mut registry = HandlerRegistry::new();
    registry.register(
        "stream",
        StreamingHandler(vec![
            values(json!({"a": 1})),
            values(json!({"b": 2})),
            values(json!({"a": 3})),
        ]),
    );
    let board = GraphDescriptor::new(
        vec![NodeDescriptor::new("s", "stream"), NodeDescriptor::new("o", "output")],
        vec![Edge::wildcard("s", "o")],
    );
    let mut run = Harness::new(registry).run(board);
    drain(&mut run).await;
    assert_eq!(run.outputs(), &[values(json!({"a": 3, "b": 2}))]);
}

#[tokio::test]
async fn test_provided_outputs_bubble_before_node_end() {
    let mut registry = HandlerRegistry::new();
    registry.register("progress", ProgressHandler(2));
    let board = GraphDescriptor::new(
        vec![NodeDescriptor::new("p", "progress"), NodeDescriptor::new("o", "output")],
        vec![Edge::new("p", "out", "o", "status")],
    );
    let mut run = Harness::new(registry).run(board);
    let events = drain(&mut run).await;
    assert_eq!(
        event_names(&events),
        vec![
            "start", "graphstart", "nodestart", "output", "output", "nodeend", "nodestart",
            "output", "nodeend", "graphend", "end",
        ]
    );
    match &events[3] {
        RunEvent::Output(data) => {
            assert!(data.bubbled);
            assert_eq!(data.outputs["progress"], 1);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_secrets_node_suspends_for_secret() {
    let board = GraphDescriptor::new(
        vec![
            NodeDescriptor::new("keys", "secrets").with_config("keys", json!(["API_KEY"])),
            NodeDescriptor::new("use", "passthrough"),
            NodeDescriptor::new("o", "output"),
        ],
        vec![
            Edge::new("keys", "API_KEY", "use", "in"),
            Edge::new("use", "out", "o", "key"),
        ],
    );
    let mut run = Harness::new(registry()).run(board);
    let events = drain(&mut run).await;
    match events_named(&events, "secret")[0] {
        RunEvent::Secret(data) => assert_eq!(data.keys, vec!["API_KEY"]),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(run.save().unwrap().kind, SnapshotKind::Secret);

    let err = run.provide_input(values(json!({"API_KEY": "k"}))).unwrap_err();
    assert_eq!(err.kind(), "RunState");
    run.provide_secrets(values(json!({"API_KEY": "k"}))).unwrap();
    drain(&mut run).await;
    assert_eq!(run.outputs(), &[values(json!({"key": "k"}))]);
}

#[tokio::test]
async fn test_events_published_to_bus() {
    let bus = Arc::new(EventBus::new(64));
    let mut rx = bus.subscribe();
    let mut run = Harness::new(registry())
        .with_event_bus(bus.clone())
        .run_with_inputs(linear_board(), values(json!({"text": "x"})));
    let events = drain(&mut run).await;

    let mut published = Vec::new();
    while let Ok(event) = rx.try_recv() {
        published.push(event);
    }
    assert_eq!(published, events);
}

#[tokio::test]
async fn test_not_waiting_rejects_answers() {
    let mut run = Harness::new(registry()).run_with_inputs(linear_board(), values(json!({"text": "x"})));
    drain(&mut run).await;
    assert!(run.provide_input(values(json!({"text": "y"}))).is_err());
    assert!(run.save().is_err());
}
