//! Session-level tests driving the proxy with canned client and server
//! messages through in-memory sinks.

use papyrus_proxy::script::ScriptLookup;
use papyrus_proxy::session::{Session, SessionConfig, SessionState};
use papyrus_proxy::transport::MessageSink;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Clone)]
struct RecordingSink(Arc<Mutex<Vec<Value>>>);

impl MessageSink for RecordingSink {
    fn send(&mut self, message: &Value) -> anyhow::Result<()> {
        self.0.lock().unwrap().push(message.clone());
        Ok(())
    }
}

/// Canned directory layout: path -> declared script name.
struct FakeLookup(HashMap<PathBuf, String>);

impl ScriptLookup for FakeLookup {
    fn declared_script_name(&self, path: &Path) -> Option<String> {
        self.0.get(path).cloned()
    }

    fn file_exists(&self, path: &Path) -> bool {
        self.0.contains_key(path)
    }
}

struct Harness {
    session: Session,
    to_client: Arc<Mutex<Vec<Value>>>,
    to_server: Arc<Mutex<Vec<Value>>>,
    start: Instant,
    next_seq: i64,
}

impl Harness {
    fn new() -> Harness {
        let mut scripts = HashMap::new();
        scripts.insert(
            PathBuf::from("/ws/MyMod/MyScript.psc"),
            "MyMod:MyScript".to_owned(),
        );
        Harness::with_scripts(scripts)
    }

    fn with_scripts(scripts: HashMap<PathBuf, String>) -> Harness {
        let to_client = Arc::new(Mutex::new(Vec::new()));
        let to_server = Arc::new(Mutex::new(Vec::new()));
        let session = Session::new(
            Box::new(RecordingSink(to_client.clone())),
            Box::new(RecordingSink(to_server.clone())),
            Box::new(FakeLookup(scripts)),
            SessionConfig {
                workspace: PathBuf::from("/ws"),
                base_scripts: Some(PathBuf::from("/base")),
            },
        );
        Harness {
            session,
            to_client,
            to_server,
            start: Instant::now(),
            next_seq: 0,
        }
    }

    fn request(&mut self, command: &str, arguments: Value) -> i64 {
        self.next_seq += 1;
        let seq = self.next_seq;
        let message = json!({
            "seq": seq,
            "type": "request",
            "command": command,
            "arguments": arguments,
        });
        self.session
            .handle_client_message(message, self.start)
            .unwrap();
        seq
    }

    fn server_requests(&self, command: &str) -> Vec<Value> {
        self.to_server
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m["command"] == json!(command))
            .cloned()
            .collect()
    }

    fn last_server_request(&self) -> Value {
        self.to_server.lock().unwrap().last().cloned().unwrap()
    }

    /// Answer the most recent forwarded request in the server's voice.
    fn server_answers(&mut self, success: bool, message: Option<&str>, body: Option<Value>) {
        let request = self.last_server_request();
        let mut response = json!({
            "type": "response",
            "request_seq": request["seq"],
            "command": request["command"],
            "success": success,
        });
        if let Some(message) = message {
            response["message"] = json!(message);
        }
        if let Some(body) = body {
            response["body"] = body;
        }
        self.session
            .handle_server_message(response, self.start)
            .unwrap();
    }

    fn server_emits(&mut self, event: &str, body: Value) {
        let message = json!({"type": "event", "event": event, "body": body});
        self.session
            .handle_server_message(message, self.start)
            .unwrap();
    }

    fn client_messages(&self) -> Vec<Value> {
        self.to_client.lock().unwrap().clone()
    }

    fn response_for(&self, request_seq: i64) -> Value {
        self.client_messages()
            .into_iter()
            .find(|m| m["type"] == json!("response") && m["request_seq"] == json!(request_seq))
            .unwrap_or_else(|| panic!("no response for request {request_seq}"))
    }

    fn client_events(&self, event: &str) -> Vec<Value> {
        self.client_messages()
            .into_iter()
            .filter(|m| m["type"] == json!("event") && m["event"] == json!(event))
            .collect()
    }

    /// A one-frame stack for thread 1, registering frame id 1000.
    fn paused_with_frame(&mut self) -> i64 {
        let seq = self.request("stackTrace", json!({"threadId": 1}));
        self.server_answers(
            true,
            None,
            Some(json!({"stackFrames": [{
                "name": "MyMod:MyScript..OnInit(...)",
                "object": "MyMod:MyScript",
                "line": 12,
                "column": 0,
            }]})),
        );
        let response = self.response_for(seq);
        response["body"]["stackFrames"][0]["id"].as_i64().unwrap()
    }
}

#[test]
fn initialize_is_answered_locally_with_no_capabilities() {
    let mut h = Harness::new();
    let seq = h.request("initialize", json!({"adapterID": "papyrus"}));

    assert!(h.to_server.lock().unwrap().is_empty());
    let response = h.response_for(seq);
    assert_eq!(response["success"], json!(true));
    let capabilities = response["body"].as_object().unwrap();
    assert!(!capabilities.is_empty());
    for (name, supported) in capabilities {
        assert_eq!(supported, &json!(false), "capability {name} must be off");
    }
}

#[test]
fn launch_acknowledges_and_emits_initialized() {
    let mut h = Harness::new();
    let seq = h.request("launch", json!({"name": "papyrus"}));

    assert!(h.to_server.lock().unwrap().is_empty());
    assert_eq!(h.response_for(seq)["success"], json!(true));
    assert_eq!(h.client_events("initialized").len(), 1);
}

#[test]
fn stack_frames_get_synthesized_ids_and_sources() {
    let mut h = Harness::new();
    let seq = h.request("stackTrace", json!({"threadId": 3}));
    h.server_answers(
        true,
        None,
        Some(json!({"stackFrames": [
            {"name": "MyMod:MyScript..OnInit(...)", "object": "MyMod:MyScript", "line": 5, "column": 0},
            {"name": "MyMod:MyScript..OnUpdate(...)", "object": "MyMod:MyScript", "line": 9, "column": 2},
        ]})),
    );

    let frames = h.response_for(seq)["body"]["stackFrames"].clone();
    assert_eq!(frames[0]["id"], json!(3000));
    assert_eq!(frames[1]["id"], json!(3001));
    assert_eq!(frames[0]["moduleId"], json!("MyMod:MyScript"));
    // zero columns are clamped into the protocol's 1-based space
    assert_eq!(frames[0]["column"], json!(1));
    assert_eq!(frames[1]["column"], json!(2));
    assert_eq!(
        frames[0]["source"],
        json!({"name": "MyScript.psc", "path": "/ws/MyMod/MyScript.psc"})
    );
}

#[test]
fn frames_for_unresolvable_objects_carry_no_source() {
    let mut h = Harness::new();
    let seq = h.request("stackTrace", json!({"threadId": 1}));
    h.server_answers(
        true,
        None,
        Some(json!({"stackFrames": [
            {"name": "Ghost..Walk(...)", "object": "Ghost:Script", "line": 1, "column": 1},
        ]})),
    );

    let frame = h.response_for(seq)["body"]["stackFrames"][0].clone();
    assert!(frame.get("source").is_none());
}

#[test]
fn scope_handles_derive_from_frame_id_and_repeat() {
    let mut h = Harness::new();
    let frame_id = h.paused_with_frame();

    let first = h.request("scopes", json!({"frameId": frame_id}));
    let second = h.request("scopes", json!({"frameId": frame_id}));

    let scopes = h.response_for(first)["body"]["scopes"].clone();
    assert_eq!(scopes[0]["name"], json!("Local"));
    assert_eq!(scopes[0]["variablesReference"], json!(frame_id * 10));
    assert_eq!(scopes[1]["name"], json!("Global"));
    assert_eq!(scopes[1]["variablesReference"], json!(frame_id * 10 + 1));
    assert_eq!(
        h.response_for(second)["body"]["scopes"],
        h.response_for(first)["body"]["scopes"]
    );
}

#[test]
fn resume_invalidates_frames_and_handles() {
    let mut h = Harness::new();
    let frame_id = h.paused_with_frame();
    let scopes_seq = h.request("scopes", json!({"frameId": frame_id}));
    let local = h.response_for(scopes_seq)["body"]["scopes"][0]["variablesReference"]
        .as_i64()
        .unwrap();

    let resume_seq = h.request("continue", json!({"threadId": 1}));
    h.server_answers(true, None, None);
    assert_eq!(h.response_for(resume_seq)["success"], json!(true));

    // the old scope handle must now be unknown, not stale
    let vars_seq = h.request("variables", json!({"variablesReference": local}));
    let response = h.response_for(vars_seq);
    assert_eq!(response["success"], json!(false));
    assert_eq!(response["body"]["error"]["id"], json!(1106));

    // and the old frame id yields no scopes at all
    let stale_seq = h.request("scopes", json!({"frameId": frame_id}));
    let response = h.response_for(stale_seq);
    assert_eq!(response["success"], json!(true));
    assert_eq!(response["body"]["scopes"], json!([]));
}

#[test]
fn variables_are_translated_and_synthetic_locals_unwrapped() {
    let mut h = Harness::new();
    let frame_id = h.paused_with_frame();
    h.request("scopes", json!({"frameId": frame_id}));

    let seq = h.request("variables", json!({"variablesReference": frame_id * 10}));
    let forwarded = h.last_server_request();
    assert_eq!(forwarded["command"], json!("variables"));
    assert_eq!(
        forwarded["arguments"]["root"],
        json!({"type": "stackFrame", "threadId": 1, "stackFrameIndex": 0})
    );
    assert_eq!(forwarded["arguments"]["path"], json!(["OnInit"]));

    h.server_answers(
        true,
        None,
        Some(json!({"variables": [
            {"name": "::Health_var", "value": 50, "type": "int"},
            {"name": "target", "value": "none", "type": "ObjectReference", "compound": true},
        ]})),
    );
    let variables = h.response_for(seq)["body"]["variables"].clone();
    assert_eq!(variables[0]["name"], json!("Health"));
    assert_eq!(variables[0]["presentationHint"], json!({"kind": "property"}));
    assert_eq!(variables[0]["variablesReference"], json!(0));
    assert_eq!(variables[1]["name"], json!("target"));
    assert!(variables[1].get("presentationHint").is_none());
}

#[test]
fn threads_while_running_are_served_from_the_roster() {
    let mut h = Harness::new();
    let seq = h.request("threads", json!({}));
    h.server_answers(false, Some("VM is not paused"), None);

    let response = h.response_for(seq);
    assert_eq!(response["success"], json!(true));
    let threads = response["body"]["threads"].as_array().unwrap().clone();
    assert_eq!(threads.len(), 1);
    assert_eq!(threads[0]["id"], json!(0));
}

#[test]
fn finished_threads_are_filtered_and_an_empty_roster_gets_the_placeholder() {
    let mut h = Harness::new();
    let seq = h.request("threads", json!({}));
    h.server_answers(
        true,
        None,
        Some(json!({"threads": [
            {"id": 1, "name": "main"},
            {"id": 2, "name": ""},
        ]})),
    );
    let threads = h.response_for(seq)["body"]["threads"].clone();
    assert_eq!(threads, json!([{"id": 1, "name": "main"}]));

    let seq = h.request("threads", json!({}));
    h.server_answers(true, None, Some(json!({"threads": [{"id": 2, "name": ""}]})));
    let threads = h.response_for(seq)["body"]["threads"]
        .as_array()
        .unwrap()
        .clone();
    assert_eq!(threads.len(), 1);
    assert_eq!(threads[0]["id"], json!(0));
}

#[test]
fn thread_events_keep_the_roster_current() {
    let mut h = Harness::new();
    h.server_emits("thread", json!({"reason": "started", "threadId": 7}));

    let seq = h.request("threads", json!({}));
    h.server_answers(false, Some("VM is not paused"), None);
    let threads = h.response_for(seq)["body"]["threads"].clone();
    assert_eq!(threads, json!([{"id": 7, "name": "<thread 7>"}]));

    h.server_emits("thread", json!({"reason": "exited", "threadId": 7}));
    let seq = h.request("threads", json!({}));
    h.server_answers(false, Some("VM is not paused"), None);
    let threads = h.response_for(seq)["body"]["threads"].as_array().unwrap().clone();
    assert_eq!(threads[0]["id"], json!(0));
}

#[test]
fn breakpoint_sources_are_sent_as_object_names() {
    let mut h = Harness::new();
    h.request(
        "setBreakpoints",
        json!({
            "source": {"name": "MyScript.psc", "path": "/ws/MyMod/MyScript.psc"},
            "breakpoints": [{"line": 3}],
        }),
    );
    let forwarded = h.last_server_request();
    assert_eq!(forwarded["arguments"]["source"], json!("MyMod:MyScript"));
}

#[test]
fn failed_breakpoint_responses_are_fabricated_from_the_request() {
    let mut h = Harness::new();
    let source = json!({"name": "MyScript.psc", "path": "/ws/MyMod/MyScript.psc"});
    let seq = h.request(
        "setBreakpoints",
        json!({"source": source, "breakpoints": [{"line": 3}, {"line": 7}]}),
    );
    h.server_answers(false, Some("no such script"), None);

    let response = h.response_for(seq);
    let breakpoints = response["body"]["breakpoints"].as_array().unwrap().clone();
    assert_eq!(breakpoints.len(), 2);
    assert_eq!(breakpoints[0]["verified"], json!(false));
    assert_eq!(breakpoints[0]["line"], json!(3));
    assert_eq!(breakpoints[1]["verified"], json!(false));
    assert_eq!(breakpoints[1]["line"], json!(7));
    assert_eq!(breakpoints[0]["source"], source);
}

#[test]
fn verified_breakpoints_get_their_source_objects_back() {
    let mut h = Harness::new();
    let source = json!({"name": "MyScript.psc", "path": "/ws/MyMod/MyScript.psc"});
    let seq = h.request(
        "setBreakpoints",
        json!({"source": source, "breakpoints": [{"line": 3}]}),
    );
    h.server_answers(
        true,
        None,
        Some(json!({"breakpoints": [
            {"verified": true, "line": 3, "source": "MyMod:MyScript"},
            {"verified": true, "line": 9, "source": "Unknown:Script"},
        ]})),
    );

    let breakpoints = h.response_for(seq)["body"]["breakpoints"].clone();
    assert_eq!(breakpoints[0]["source"], source);
    assert!(breakpoints[1].get("source").is_none());
}

#[test]
fn pause_is_retried_exactly_once_on_timeout() {
    let mut h = Harness::new();
    let seq = h.request("pause", json!({"threadId": 1}));
    assert_eq!(h.server_requests("pause").len(), 1);

    h.session
        .expire_due(h.start + Duration::from_secs(6))
        .unwrap();
    assert_eq!(h.server_requests("pause").len(), 2);

    h.session
        .expire_due(h.start + Duration::from_secs(12))
        .unwrap();
    assert_eq!(h.server_requests("pause").len(), 2);
    let response = h.response_for(seq);
    assert_eq!(response["success"], json!(false));
    assert_eq!(response["message"], json!("timeout"));
}

#[test]
fn already_paused_is_success_plus_stopped_event() {
    let mut h = Harness::new();
    let seq = h.request("pause", json!({"threadId": 4}));
    h.server_answers(false, Some("VM already paused (freeze lock)"), None);

    assert_eq!(h.response_for(seq)["success"], json!(true));
    let stopped = h.client_events("stopped");
    assert_eq!(stopped.len(), 1);
    assert_eq!(stopped[0]["body"]["reason"], json!("pause"));
    assert_eq!(stopped[0]["body"]["threadId"], json!(4));
    assert_eq!(stopped[0]["body"]["allThreadsStopped"], json!(true));
}

#[test]
fn evaluate_repopulates_the_local_scope_exactly_once() {
    let mut h = Harness::new();
    let frame_id = h.paused_with_frame();
    let seq = h.request(
        "evaluate",
        json!({"expression": "self.Health", "frameId": frame_id}),
    );

    // first round trip: list the routine's locals
    let listing = h.last_server_request();
    assert_eq!(listing["command"], json!("variables"));
    assert_eq!(listing["arguments"]["path"], json!(["OnInit"]));
    h.server_answers(
        true,
        None,
        Some(json!({"variables": [{"name": "::Health_var", "value": 50, "type": "int"}]})),
    );

    // second round trip: the value itself, no further listings
    let lookup = h.last_server_request();
    assert_eq!(lookup["command"], json!("value"));
    assert_eq!(lookup["arguments"]["path"], json!(["self", "Health"]));
    assert_eq!(h.server_requests("variables").len(), 1);
    h.server_answers(true, None, Some(json!({"value": 50, "type": "int"})));

    let response = h.response_for(seq);
    assert_eq!(response["success"], json!(true));
    assert_eq!(response["body"]["result"], json!("50"));
    assert_eq!(response["body"]["type"], json!("int"));
    // the value response carries no nesting hint, but the result still
    // hands back a usable handle
    let reference = response["body"]["variablesReference"].as_i64().unwrap();
    assert!(reference >= 1_000_000_000);

    // the result is also echoed into the debug console
    let outputs = h.client_events("output");
    assert_eq!(outputs[0]["body"]["output"], json!("50\n"));
    assert_eq!(outputs[0]["body"]["category"], json!("console"));
}

#[test]
fn evaluating_an_unknown_head_reports_the_global_limitation() {
    let mut h = Harness::new();
    let frame_id = h.paused_with_frame();
    let seq = h.request(
        "evaluate",
        json!({"expression": "GameState.Flag", "frameId": frame_id}),
    );
    h.server_answers(
        true,
        None,
        Some(json!({"variables": [{"name": "::Health_var", "value": 50, "type": "int"}]})),
    );

    let response = h.response_for(seq);
    assert_eq!(response["success"], json!(false));
    assert_eq!(response["body"]["error"]["id"], json!(1108));
    assert_eq!(h.server_requests("value").len(), 0);
}

#[test]
fn evaluation_results_are_expandable() {
    let mut h = Harness::new();
    let frame_id = h.paused_with_frame();
    let seq = h.request(
        "evaluate",
        json!({"expression": "self.Target", "frameId": frame_id}),
    );
    h.server_answers(
        true,
        None,
        Some(json!({"variables": [{"name": "count", "value": 1, "type": "int"}]})),
    );
    h.server_answers(
        true,
        None,
        Some(json!({"value": "[ObjectReference]", "type": "ObjectReference"})),
    );

    let response = h.response_for(seq);
    assert_eq!(response["success"], json!(true));
    let reference = response["body"]["variablesReference"].as_i64().unwrap();
    assert!(reference >= 1_000_000_000);

    // the handle can be expanded like any other scope
    let vars_seq = h.request("variables", json!({"variablesReference": reference}));
    let forwarded = h.last_server_request();
    assert_eq!(forwarded["arguments"]["path"], json!(["self", "Target"]));
    h.server_answers(true, None, Some(json!({"variables": []})));
    assert_eq!(h.response_for(vars_seq)["success"], json!(true));
}

#[test]
fn malformed_client_requests_do_not_end_the_session() {
    let mut h = Harness::new();
    let alive = h
        .session
        .handle_client_message(json!({"seq": 9, "type": "request", "command": 7}), h.start)
        .unwrap();
    assert!(alive);
    let response = h.response_for(9);
    assert_eq!(response["success"], json!(false));
    assert_eq!(response["body"]["error"]["id"], json!(1104));
    assert_eq!(response["body"]["error"]["sendTelemetry"], json!(true));

    // without a usable seq there is nothing to answer; logged and dropped
    let alive = h
        .session
        .handle_client_message(
            json!({"seq": "nine", "type": "request", "command": "threads"}),
            h.start,
        )
        .unwrap();
    assert!(alive);
    assert!(h.to_server.lock().unwrap().is_empty());

    // the session keeps serving well-formed requests afterwards
    let seq = h.request("initialize", json!({}));
    assert_eq!(h.response_for(seq)["success"], json!(true));
}

#[test]
fn unrecognized_requests_fail_fast_without_touching_the_server() {
    let mut h = Harness::new();
    let seq = h.request("restartFrame", json!({"frameId": 1}));

    assert!(h.to_server.lock().unwrap().is_empty());
    let response = h.response_for(seq);
    assert_eq!(response["success"], json!(false));
    assert_eq!(response["body"]["error"]["id"], json!(1014));
    assert_eq!(response["body"]["error"]["showUser"], json!(true));
}

#[test]
fn output_events_gain_a_trailing_newline() {
    let mut h = Harness::new();
    h.server_emits("output", json!({"category": "console", "output": "hello"}));

    let outputs = h.client_events("output");
    assert_eq!(outputs[0]["body"]["output"], json!("hello\n"));
}

#[test]
fn disconnect_ends_the_session() {
    let mut h = Harness::new();
    let seq = h.request("disconnect", json!({}));
    h.server_answers(true, None, None);

    assert_eq!(h.response_for(seq)["success"], json!(true));
    assert_eq!(h.session.state(), SessionState::Terminated);
}
