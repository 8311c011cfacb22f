//! Proxy session: one DAP client talking to one Papyrus debug server.
//!
//! All state mutation happens synchronously inside `handle_*`; the event
//! pump delivers one inbound message (or one deadline expiry) at a time, so
//! the registries and the handle tree need no locking. Anything that spans
//! a server round trip is a continuation parked in the pending table.

pub mod eval;
pub mod handles;
pub mod pending;
pub mod registry;

use crate::error::{self, Error};
use crate::protocol::{self, DapRequest, ErrorDestination};
use crate::script::{self, ScriptLookup};
use crate::transport::MessageSink;
use handles::{HandleTree, ScopeKind};
use itertools::Itertools;
use log::{debug, warn};
use pending::{Continuation, Outcome, PendingTable};
use registry::{Registry, StackFrame, Thread};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Pause gets a shorter leash because the first one is often dropped and
/// retried; see `handle_pause`.
pub const PAUSE_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
pub const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// The server's synthetic auto-property backing locals look like
/// `::Health_var`; the client should see `Health` tagged as a property.
const SYNTHETIC_LOCAL_PREFIX: &str = "::";
const SYNTHETIC_LOCAL_SUFFIX: &str = "_var";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Initialized,
    Running,
    Paused,
    Terminated,
}

/// Commands with a dedicated handler. The server silently drops requests it
/// does not know, so anything else gets a synthesized 1014 failure instead
/// of a forward the client would wait on forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientCommand {
    Initialize,
    Launch,
    Attach,
    Disconnect,
    SetBreakpoints,
    Continue,
    Next,
    StepIn,
    StepOut,
    Pause,
    StackTrace,
    Scopes,
    Variables,
    Threads,
    Evaluate,
    Source,
    Unrecognized,
}

impl ClientCommand {
    fn parse(command: &str) -> ClientCommand {
        match command {
            "initialize" => ClientCommand::Initialize,
            "launch" => ClientCommand::Launch,
            "attach" => ClientCommand::Attach,
            "disconnect" => ClientCommand::Disconnect,
            "setBreakpoints" => ClientCommand::SetBreakpoints,
            "continue" => ClientCommand::Continue,
            "next" => ClientCommand::Next,
            "stepIn" => ClientCommand::StepIn,
            "stepOut" => ClientCommand::StepOut,
            "pause" => ClientCommand::Pause,
            "stackTrace" => ClientCommand::StackTrace,
            "scopes" => ClientCommand::Scopes,
            "variables" => ClientCommand::Variables,
            "threads" => ClientCommand::Threads,
            "evaluate" => ClientCommand::Evaluate,
            "source" => ClientCommand::Source,
            _ => ClientCommand::Unrecognized,
        }
    }
}

pub struct SessionConfig {
    /// Project root holding the workspace's `.psc` sources.
    pub workspace: PathBuf,
    /// Fallback root with the base-game scripts.
    pub base_scripts: Option<PathBuf>,
}

pub struct Session {
    client: Box<dyn MessageSink>,
    server: Box<dyn MessageSink>,
    lookup: Box<dyn ScriptLookup>,
    config: SessionConfig,
    state: SessionState,
    registry: Registry,
    tree: HandleTree,
    pending: PendingTable,
    out_seq: i64,
    server_alive: bool,
}

impl Session {
    pub fn new(
        client: Box<dyn MessageSink>,
        server: Box<dyn MessageSink>,
        lookup: Box<dyn ScriptLookup>,
        config: SessionConfig,
    ) -> Session {
        Session {
            client,
            server,
            lookup,
            config,
            state: SessionState::Uninitialized,
            registry: Registry::new(),
            tree: HandleTree::new(),
            pending: PendingTable::default(),
            out_seq: 1,
            server_alive: true,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Earliest bounded-wait deadline among in-flight server requests.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.next_deadline()
    }

    // ---------------------------------------------------------------------
    // inbound entry points
    // ---------------------------------------------------------------------

    /// Returns `false` once the session is over and the pump should stop.
    pub fn handle_client_message(&mut self, message: Value, now: Instant) -> anyhow::Result<bool> {
        if !self.server_alive {
            // nothing left to talk to; tell the client to wind down
            self.send_event("terminated", None)?;
            return Ok(self.state != SessionState::Terminated);
        }
        if protocol::message_type(&message) == Some("request") {
            let seq = message.get("seq").and_then(Value::as_i64);
            let command = message
                .get("command")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned();
            match serde_json::from_value::<DapRequest>(message) {
                Ok(request) => self.dispatch_request(request, now)?,
                // a broken request must not take the session down with it;
                // answer it as an internal fault when it can be answered
                Err(err) => match seq {
                    Some(seq) => {
                        let mut variables = HashMap::new();
                        variables.insert("_stack".to_owned(), err.to_string());
                        self.send_error_response(
                            seq,
                            &command,
                            error::INTERNAL_EXCEPTION,
                            "{_stack}",
                            Some(variables),
                            ErrorDestination::Telemetry,
                        )?;
                    }
                    None => {
                        warn!(target: "proxy", "dropping unparseable client request: {err}");
                    }
                },
            }
        } else {
            self.forward_raw_to_server(message)?;
        }
        Ok(self.state != SessionState::Terminated)
    }

    pub fn handle_server_message(&mut self, message: Value, now: Instant) -> anyhow::Result<bool> {
        match protocol::message_type(&message) {
            Some("response") => {
                let request_seq = message
                    .get("request_seq")
                    .and_then(Value::as_i64)
                    .unwrap_or(-1);
                if let Some(continuation) = self.pending.take(request_seq) {
                    continuation(self, Outcome::Response(message), now)?;
                } else {
                    // correlation miss (the server has been seen reusing
                    // sequence numbers); relay so the client still sees it
                    self.send_to_client(message)?;
                }
            }
            Some("event") => self.handle_server_event(message)?,
            _ => self.send_to_client(message)?,
        }
        Ok(self.state != SessionState::Terminated)
    }

    pub fn handle_server_closed(&mut self) -> anyhow::Result<bool> {
        warn!(target: "proxy", "debug server connection closed");
        self.server_alive = false;
        Ok(self.state != SessionState::Terminated)
    }

    /// Run the continuations of every request whose bounded wait expired.
    pub fn expire_due(&mut self, now: Instant) -> anyhow::Result<bool> {
        for (seq, continuation) in self.pending.take_expired(now) {
            debug!(target: "proxy", "request {seq} timed out");
            continuation(self, Outcome::Timeout, now)?;
        }
        Ok(self.state != SessionState::Terminated)
    }

    // ---------------------------------------------------------------------
    // outbound plumbing
    // ---------------------------------------------------------------------

    fn next_seq(&mut self) -> i64 {
        let seq = self.out_seq;
        self.out_seq += 1;
        seq
    }

    fn send_to_client(&mut self, mut message: Value) -> anyhow::Result<()> {
        message["seq"] = json!(self.next_seq());
        self.client.send(&message)
    }

    fn send_event(&mut self, event: &str, body: Option<Value>) -> anyhow::Result<()> {
        let mut message = json!({"type": "event", "event": event});
        if let Some(body) = body {
            message["body"] = body;
        }
        self.send_to_client(message)
    }

    fn respond(
        &mut self,
        request_seq: i64,
        command: &str,
        success: bool,
        message: Option<String>,
        body: Option<Value>,
    ) -> anyhow::Result<()> {
        let mut response = json!({
            "type": "response",
            "request_seq": request_seq,
            "command": command,
            "success": success,
        });
        if let Some(message) = message {
            response["message"] = json!(message);
        }
        if let Some(body) = body {
            response["body"] = body;
        }
        self.send_to_client(response)
    }

    fn send_error_response(
        &mut self,
        request_seq: i64,
        command: &str,
        code: i64,
        format: &str,
        variables: Option<HashMap<String, String>>,
        destination: ErrorDestination,
    ) -> anyhow::Result<()> {
        let empty = HashMap::new();
        let rendered = protocol::format_pii(format, true, variables.as_ref().unwrap_or(&empty));
        let body = protocol::error_body(code, format, destination);
        self.respond(request_seq, command, false, Some(rendered), Some(body))
    }

    fn domain_error_response(
        &mut self,
        request_seq: i64,
        command: &str,
        err: &Error,
    ) -> anyhow::Result<()> {
        let destination = if err.telemetry_only() {
            ErrorDestination::Telemetry
        } else {
            ErrorDestination::User
        };
        self.send_error_response(
            request_seq,
            command,
            err.code(),
            &err.to_string(),
            None,
            destination,
        )
    }

    fn send_request_to_server(
        &mut self,
        command: &str,
        arguments: Value,
        timeout: Duration,
        now: Instant,
        continuation: Continuation,
    ) -> anyhow::Result<()> {
        let seq = self.next_seq();
        let message = json!({
            "seq": seq,
            "type": "request",
            "command": command,
            "arguments": arguments,
        });
        self.server.send(&message)?;
        self.pending.register(seq, Some(timeout), now, continuation);
        Ok(())
    }

    fn forward_raw_to_server(&mut self, mut message: Value) -> anyhow::Result<()> {
        message["seq"] = json!(self.next_seq());
        self.server.send(&message)
    }

    /// Default continuation: hand the server's answer (or a synthesized
    /// timeout failure) to the client under the original request identity.
    fn relay_outcome(
        &mut self,
        request_seq: i64,
        command: &str,
        outcome: Outcome,
    ) -> anyhow::Result<()> {
        match outcome {
            Outcome::Response(mut response) => {
                response["request_seq"] = json!(request_seq);
                response["command"] = json!(command);
                self.send_to_client(response)
            }
            Outcome::Timeout => {
                self.respond(request_seq, command, false, Some("timeout".to_owned()), None)
            }
        }
    }

    // ---------------------------------------------------------------------
    // client request dispatch
    // ---------------------------------------------------------------------

    fn dispatch_request(&mut self, request: DapRequest, now: Instant) -> anyhow::Result<()> {
        debug!(target: "proxy", "{}: {}", request.seq, request.command);
        let result = match ClientCommand::parse(&request.command) {
            ClientCommand::Initialize => self.handle_initialize(&request),
            ClientCommand::Launch | ClientCommand::Attach => self.handle_launch_or_attach(&request),
            ClientCommand::Disconnect => self.handle_disconnect(&request, now),
            ClientCommand::SetBreakpoints => self.handle_set_breakpoints(&request, now),
            ClientCommand::Continue
            | ClientCommand::Next
            | ClientCommand::StepIn
            | ClientCommand::StepOut => self.handle_resume(&request, now),
            ClientCommand::Pause => self.handle_pause(&request, now),
            ClientCommand::StackTrace => self.handle_stack_trace(&request, now),
            ClientCommand::Scopes => self.handle_scopes(&request),
            ClientCommand::Variables => self.handle_variables(&request, now),
            ClientCommand::Threads => self.handle_threads(&request, now),
            ClientCommand::Evaluate => self.handle_evaluate(&request, now),
            ClientCommand::Source | ClientCommand::Unrecognized => {
                self.handle_unrecognized(&request)
            }
        };
        match result {
            Ok(()) => Ok(()),
            Err(err) => self.report_handler_error(&request, err),
        }
    }

    /// Dispatch boundary: a failed handler becomes an error response, never
    /// a dead client request. Domain errors keep their own code; everything
    /// else is an internal exception whose detail goes to telemetry.
    fn report_handler_error(
        &mut self,
        request: &DapRequest,
        err: anyhow::Error,
    ) -> anyhow::Result<()> {
        match err.downcast_ref::<Error>() {
            Some(domain) if !domain.telemetry_only() => {
                let code = domain.code();
                let format = domain.to_string();
                self.send_error_response(
                    request.seq,
                    &request.command,
                    code,
                    &format,
                    None,
                    ErrorDestination::User,
                )
            }
            _ => {
                let mut variables = HashMap::new();
                variables.insert("_stack".to_owned(), format!("{err:#}"));
                self.send_error_response(
                    request.seq,
                    &request.command,
                    error::INTERNAL_EXCEPTION,
                    "{_stack}",
                    Some(variables),
                    ErrorDestination::Telemetry,
                )
            }
        }
    }

    // ---------------------------------------------------------------------
    // handlers: locally synthesized
    // ---------------------------------------------------------------------

    fn handle_initialize(&mut self, request: &DapRequest) -> anyhow::Result<()> {
        // The server has no initialize handshake at all; answer locally and
        // advertise none of the protocol's optional capabilities.
        self.state = SessionState::Initialized;
        self.respond(
            request.seq,
            &request.command,
            true,
            None,
            Some(unsupported_capabilities()),
        )
    }

    fn handle_launch_or_attach(&mut self, request: &DapRequest) -> anyhow::Result<()> {
        // No launch/attach handshake on the server either: the game is
        // already running when the proxy connects. Acknowledge locally and
        // kick the client straight into breakpoint configuration.
        self.clear_execution_state();
        self.state = SessionState::Initialized;
        self.respond(request.seq, &request.command, true, None, None)?;
        self.send_event("initialized", None)
    }

    fn handle_scopes(&mut self, request: &DapRequest) -> anyhow::Result<()> {
        let frame_id = request
            .arguments
            .get("frameId")
            .and_then(Value::as_i64)
            .ok_or(Error::MalformedRequest("scopes", "missing frameId"))?;
        let mut scopes = Vec::new();
        // a frame id from before the last resume stays unknown on purpose
        if self.registry.frame(frame_id).is_some() {
            let (local, global) = self.tree.make_frame_scopes(frame_id);
            self.registry.bind_variables_reference(local, frame_id);
            self.registry.bind_variables_reference(global, frame_id);
            scopes.push(json!({
                "name": "Local",
                "presentationHint": "locals",
                "variablesReference": local,
                "expensive": false,
            }));
            scopes.push(json!({
                "name": "Global",
                "variablesReference": global,
                "expensive": false,
            }));
        }
        self.respond(
            request.seq,
            &request.command,
            true,
            None,
            Some(json!({ "scopes": scopes })),
        )
    }

    fn handle_unrecognized(&mut self, request: &DapRequest) -> anyhow::Result<()> {
        self.send_error_response(
            request.seq,
            &request.command,
            error::UNRECOGNIZED_REQUEST,
            "unrecognized request",
            None,
            ErrorDestination::User,
        )
    }

    // ---------------------------------------------------------------------
    // handlers: forwarded with compensation
    // ---------------------------------------------------------------------

    fn handle_resume(&mut self, request: &DapRequest, now: Instant) -> anyhow::Result<()> {
        // every frame id, scope handle and variable handle dies here
        self.clear_execution_state();
        self.state = SessionState::Running;
        let seq = request.seq;
        let command = request.command.clone();
        self.send_request_to_server(
            &request.command,
            request.arguments.clone(),
            DEFAULT_REQUEST_TIMEOUT,
            now,
            Box::new(move |session, outcome, _| session.relay_outcome(seq, &command, outcome)),
        )
    }

    fn handle_disconnect(&mut self, request: &DapRequest, now: Instant) -> anyhow::Result<()> {
        let seq = request.seq;
        let command = request.command.clone();
        self.send_request_to_server(
            &request.command,
            request.arguments.clone(),
            DISCONNECT_TIMEOUT,
            now,
            Box::new(move |session, outcome, _| {
                // whatever the server says, this session is over
                session.state = SessionState::Terminated;
                session.relay_outcome(seq, &command, outcome)
            }),
        )
    }

    fn handle_threads(&mut self, request: &DapRequest, now: Instant) -> anyhow::Result<()> {
        let seq = request.seq;
        self.send_request_to_server(
            "threads",
            request.arguments.clone(),
            DEFAULT_REQUEST_TIMEOUT,
            now,
            Box::new(move |session, outcome, _| session.finish_threads(seq, outcome)),
        )
    }

    fn finish_threads(&mut self, request_seq: i64, outcome: Outcome) -> anyhow::Result<()> {
        let mut response = match outcome {
            Outcome::Response(response) => response,
            Outcome::Timeout => return self.relay_outcome(request_seq, "threads", Outcome::Timeout),
        };
        let success = response
            .get("success")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let message = response
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if !success && message == "VM is not paused" {
            // The server refuses to enumerate threads while running, but the
            // client needs a thread list before it will ever send the pause
            // that would stop the VM. Answer from the last-known roster.
            response["success"] = json!(true);
            response["message"] = json!("");
            response["body"] = json!({ "threads": self.registry.threads() });
        } else if success {
            let threads: Vec<Thread> = response
                .pointer("/body/threads")
                .and_then(|threads| serde_json::from_value(threads.clone()).ok())
                .unwrap_or_default();
            // zero-length names are threads that finished during the pause
            // but have not been reaped yet
            let alive = threads
                .into_iter()
                .filter(|thread| !thread.name.is_empty())
                .collect_vec();
            self.registry.replace_threads(alive);
            response["body"] = json!({ "threads": self.registry.threads() });
        }
        self.relay_outcome(request_seq, "threads", Outcome::Response(response))
    }

    fn handle_pause(&mut self, request: &DapRequest, now: Instant) -> anyhow::Result<()> {
        let first_try = request.clone();
        self.send_request_to_server(
            "pause",
            request.arguments.clone(),
            PAUSE_REQUEST_TIMEOUT,
            now,
            Box::new(move |session, outcome, now| match outcome {
                Outcome::Timeout => {
                    // the server regularly drops the first pause on the
                    // floor; retry exactly once
                    let retry = first_try.clone();
                    session.send_request_to_server(
                        "pause",
                        first_try.arguments.clone(),
                        PAUSE_REQUEST_TIMEOUT,
                        now,
                        Box::new(move |session, outcome, _| session.finish_pause(&retry, outcome)),
                    )
                }
                response => session.finish_pause(&first_try, response),
            }),
        )
    }

    fn finish_pause(&mut self, request: &DapRequest, outcome: Outcome) -> anyhow::Result<()> {
        let response = match outcome {
            Outcome::Response(response) => response,
            Outcome::Timeout => return self.relay_outcome(request.seq, "pause", Outcome::Timeout),
        };
        let success = response
            .get("success")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let message = response
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if !success && message.starts_with("VM already paused") {
            // benign: the pause button should not surface an error just
            // because the VM beat us to it
            self.state = SessionState::Paused;
            self.respond(request.seq, "pause", true, None, None)?;
            let thread_id = request
                .arguments
                .get("threadId")
                .cloned()
                .unwrap_or(Value::Null);
            self.send_event(
                "stopped",
                Some(json!({
                    "reason": "pause",
                    "threadId": thread_id,
                    "allThreadsStopped": true,
                })),
            )
        } else {
            self.relay_outcome(request.seq, "pause", Outcome::Response(response))
        }
    }

    fn handle_set_breakpoints(&mut self, request: &DapRequest, now: Instant) -> anyhow::Result<()> {
        let source = request
            .arguments
            .get("source")
            .cloned()
            .ok_or(Error::MalformedRequest("setBreakpoints", "missing source"))?;
        // the server only understands bare object names where the protocol
        // puts Source objects
        let object = self.source_to_object_name(&source);
        let mut forwarded = request.arguments.clone();
        forwarded["source"] = json!(object);
        let original = request.clone();
        self.send_request_to_server(
            "setBreakpoints",
            forwarded,
            DEFAULT_REQUEST_TIMEOUT,
            now,
            Box::new(move |session, outcome, _| session.finish_set_breakpoints(&original, outcome)),
        )
    }

    fn finish_set_breakpoints(
        &mut self,
        request: &DapRequest,
        outcome: Outcome,
    ) -> anyhow::Result<()> {
        let mut response = match outcome {
            Outcome::Response(response) => response,
            Outcome::Timeout => {
                return self.relay_outcome(request.seq, "setBreakpoints", Outcome::Timeout);
            }
        };
        let success = response
            .get("success")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let entries = response
            .pointer("/body/breakpoints")
            .and_then(Value::as_array)
            .map(Vec::len)
            .unwrap_or(0);
        if !success && entries == 0 {
            // put the requested lines back so the client renders them as
            // unverified instead of silently dropping them
            let requested = request
                .arguments
                .get("breakpoints")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            let source = request
                .arguments
                .get("source")
                .cloned()
                .unwrap_or(Value::Null);
            let fabricated = requested
                .iter()
                .map(|breakpoint| {
                    json!({
                        "verified": false,
                        "line": breakpoint.get("line").cloned().unwrap_or(Value::Null),
                        "source": source.clone(),
                    })
                })
                .collect_vec();
            response["body"] = json!({ "breakpoints": fabricated });
        } else if let Some(breakpoints) = response
            .pointer_mut("/body/breakpoints")
            .and_then(Value::as_array_mut)
        {
            // the server reports breakpoints with bare object-name strings
            // where Source objects belong
            for breakpoint in breakpoints.iter_mut() {
                let object = breakpoint
                    .get("source")
                    .and_then(Value::as_str)
                    .map(str::to_owned);
                if let Some(object) = object {
                    match self.registry.source_for_object(&object) {
                        Some(cached) => breakpoint["source"] = cached.clone(),
                        None => {
                            if let Some(fields) = breakpoint.as_object_mut() {
                                fields.remove("source");
                            }
                        }
                    }
                }
            }
        }
        self.relay_outcome(request.seq, "setBreakpoints", Outcome::Response(response))
    }

    fn handle_stack_trace(&mut self, request: &DapRequest, now: Instant) -> anyhow::Result<()> {
        let thread_id = request
            .arguments
            .get("threadId")
            .and_then(Value::as_i64)
            .ok_or(Error::MalformedRequest("stackTrace", "missing threadId"))?;
        let seq = request.seq;
        self.send_request_to_server(
            "stackTrace",
            request.arguments.clone(),
            DEFAULT_REQUEST_TIMEOUT,
            now,
            Box::new(move |session, outcome, _| session.finish_stack_trace(seq, thread_id, outcome)),
        )
    }

    fn finish_stack_trace(
        &mut self,
        request_seq: i64,
        thread_id: i64,
        outcome: Outcome,
    ) -> anyhow::Result<()> {
        let mut response = match outcome {
            Outcome::Response(response) => response,
            Outcome::Timeout => {
                return self.relay_outcome(request_seq, "stackTrace", Outcome::Timeout);
            }
        };
        let frames = response
            .pointer_mut("/body/stackFrames")
            .map(Value::take);
        if let Some(Value::Array(frames)) = frames {
            let mut translated = Vec::with_capacity(frames.len());
            for (ordinal, mut frame) in frames.into_iter().enumerate() {
                let object = frame
                    .get("object")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned();
                match self.resolve_frame_source(&object, frame.get("source")) {
                    Some(source) => frame["source"] = source,
                    None => {
                        // leave source absent so the client does not try to
                        // open something that is not there
                        if let Some(fields) = frame.as_object_mut() {
                            fields.remove("source");
                        }
                    }
                }
                frame["moduleId"] = json!(object);
                let line = frame.get("line").and_then(Value::as_i64).unwrap_or(0).max(1);
                let column = frame
                    .get("column")
                    .and_then(Value::as_i64)
                    .unwrap_or(0)
                    .max(1);
                frame["line"] = json!(line);
                frame["column"] = json!(column);
                let id = registry::frame_id(thread_id, ordinal);
                frame["id"] = json!(id);
                self.registry.add_frame(StackFrame {
                    id,
                    thread_id,
                    object,
                    name: frame
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_owned(),
                    source: frame.get("source").cloned(),
                    line,
                    column,
                });
                translated.push(frame);
            }
            response["body"]["stackFrames"] = Value::Array(translated);
        }
        self.relay_outcome(request_seq, "stackTrace", Outcome::Response(response))
    }

    fn handle_variables(&mut self, request: &DapRequest, now: Instant) -> anyhow::Result<()> {
        let variables_reference = request
            .arguments
            .get("variablesReference")
            .and_then(Value::as_i64)
            .ok_or(Error::MalformedRequest(
                "variables",
                "missing variablesReference",
            ))?;
        let scope = self
            .tree
            .scope(variables_reference)
            .cloned()
            .ok_or(Error::UnknownVariablesReference(variables_reference))?;
        let frame_id = self
            .registry
            .frame_of_variables_reference(variables_reference)
            .unwrap_or(scope.frame_id);
        let frame = self
            .registry
            .frame(frame_id)
            .cloned()
            .ok_or(Error::FrameNotFound(frame_id))?;
        let path = match scope.kind {
            // the frame's routine-local group is addressed by a name buried
            // in the frame's display name
            ScopeKind::Local => routine_local_path(&frame.name),
            // the server has no global listing per se; "self" is the
            // closest thing the Global scope can show
            ScopeKind::Global => vec!["self".to_owned()],
            ScopeKind::SelfObject | ScopeKind::ObjectMember => scope.path.clone(),
        };
        let arguments = self.frame_rooted_arguments(frame_id, json!(path));
        let seq = request.seq;
        self.send_request_to_server(
            "variables",
            arguments,
            DEFAULT_REQUEST_TIMEOUT,
            now,
            Box::new(move |session, outcome, _| {
                session.finish_variables(seq, variables_reference, outcome)
            }),
        )
    }

    fn finish_variables(
        &mut self,
        request_seq: i64,
        scope_handle: i64,
        outcome: Outcome,
    ) -> anyhow::Result<()> {
        let mut response = match outcome {
            Outcome::Response(response) => response,
            Outcome::Timeout => {
                return self.relay_outcome(request_seq, "variables", Outcome::Timeout);
            }
        };
        let raw = response.pointer("/body/variables").cloned();
        let translated = self.translate_variables(scope_handle, raw.as_ref());
        response["body"] = json!({ "variables": translated });
        self.relay_outcome(request_seq, "variables", Outcome::Response(response))
    }

    /// Translate server variable entries into client-facing ones, recording
    /// each as a `VariableNode` owned by `scope_handle` so the evaluator
    /// can see what is in scope.
    fn translate_variables(&mut self, scope_handle: i64, raw: Option<&Value>) -> Vec<Value> {
        let Some(list) = raw.and_then(Value::as_array) else {
            return Vec::new();
        };
        let mut out = Vec::with_capacity(list.len());
        for variable in list {
            let raw_name = variable
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let (name, synthetic) = unwrap_synthetic_local(raw_name);
            let value = variable.get("value").cloned().unwrap_or(Value::Null);
            let type_name = variable
                .get("type")
                .and_then(Value::as_str)
                .map(str::to_owned);
            let expandable = variable
                .get("compound")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let display = display_value(&value);
            let mut client_variable = json!({
                "name": name,
                "value": display,
                "type": variable.get("type").cloned().unwrap_or(Value::Null),
                "variablesReference": 0,
            });
            if synthetic {
                client_variable["presentationHint"] = json!({ "kind": "property" });
            }
            self.tree
                .insert_variable(name.to_owned(), display, type_name, scope_handle, expandable);
            out.push(client_variable);
        }
        out
    }

    // ---------------------------------------------------------------------
    // server events
    // ---------------------------------------------------------------------

    fn handle_server_event(&mut self, mut message: Value) -> anyhow::Result<()> {
        let event = message
            .get("event")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        match event.as_str() {
            "output" => {
                // the server omits trailing newlines
                if let Some(output) = message.pointer("/body/output").and_then(Value::as_str) {
                    let terminated = format!("{output}\n");
                    message["body"]["output"] = json!(terminated);
                }
                self.send_to_client(message)
            }
            "thread" => {
                let reason = message
                    .pointer("/body/reason")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let thread_id = message
                    .pointer("/body/threadId")
                    .and_then(Value::as_i64)
                    .unwrap_or_default();
                match reason {
                    "started" => self.registry.thread_started(thread_id),
                    "exited" => self.registry.thread_exited(thread_id),
                    _ => {}
                }
                self.send_to_client(message)
            }
            "stopped" => {
                self.state = SessionState::Paused;
                self.send_to_client(message)
            }
            // version and everything else pass through untouched
            _ => self.send_to_client(message),
        }
    }

    // ---------------------------------------------------------------------
    // shared helpers
    // ---------------------------------------------------------------------

    /// Drop all frame-scoped state: frames, scopes, variables, and the
    /// variables-reference bindings. Handles are not reused afterwards.
    fn clear_execution_state(&mut self) {
        self.registry.clear_frame_state();
        self.tree.clear();
    }

    /// Server-dialect arguments addressing a frame by thread + trace index.
    fn frame_rooted_arguments(&self, frame_id: i64, path: Value) -> Value {
        let thread_id = self.registry.thread_of_frame(frame_id).unwrap_or(0);
        let frame_index = frame_id - thread_id * registry::FRAME_ID_STRIDE;
        json!({
            "root": {
                "type": "stackFrame",
                "threadId": thread_id,
                "stackFrameIndex": frame_index,
            },
            "path": path,
        })
    }

    /// Map a client Source object to the server's object name, feeding the
    /// identity caches along the way.
    fn source_to_object_name(&mut self, source: &Value) -> String {
        let name = source
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let path = source
            .get("path")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let mut object = name.split('.').next().unwrap_or_default().to_owned();
        let known = self.registry.object_for_path(path).map(str::to_owned);
        if let Some(known) = known {
            object = known;
            self.registry.cache_source(&object, source.clone());
        } else if !path.is_empty() {
            match self.lookup.declared_script_name(Path::new(path)) {
                Some(declared) => {
                    object = declared;
                    self.registry.cache_path_object(path, &object);
                    self.registry.cache_source(&object, source.clone());
                }
                None => warn!(target: "proxy", "did not find script name in file: {path}"),
            }
        } else if self.registry.source_for_object(&object).is_some() {
            self.registry.cache_source(&object, source.clone());
        }
        object
    }

    /// Source resolution for a stack frame, in fidelity order: identity
    /// cache, a literal path the server leaked, then a probe of the source
    /// roots. `None` means the client gets no source at all.
    fn resolve_frame_source(&mut self, object: &str, server_source: Option<&Value>) -> Option<Value> {
        if let Some(cached) = self.registry.source_for_object(object) {
            return Some(cached.clone());
        }
        if let Some(path) = server_source.and_then(Value::as_str) {
            if self.lookup.file_exists(Path::new(path)) {
                let name = Path::new(path)
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.to_owned());
                let source = json!({ "name": name, "path": path });
                self.registry.cache_source(object, source.clone());
                return Some(source);
            }
        }
        self.find_source_for_object(object)
    }

    fn find_source_for_object(&mut self, object: &str) -> Option<Value> {
        if object.is_empty() {
            return None;
        }
        let relative = script::object_relative_path(object);
        let name = relative
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())?;
        let mut candidates = vec![self.config.workspace.join(&relative)];
        if let Some(base) = &self.config.base_scripts {
            candidates.push(base.join(&relative));
        }
        for candidate in candidates {
            if script::object_declared_at(self.lookup.as_ref(), object, &candidate) {
                let source = json!({
                    "name": name,
                    "path": candidate.to_string_lossy(),
                });
                self.registry.cache_source(object, source.clone());
                return Some(source);
            }
        }
        None
    }
}

/// Every optional capability the protocol defines, advertised unsupported:
/// the server's dialect backs none of them.
fn unsupported_capabilities() -> Value {
    json!({
        "supportsConditionalBreakpoints": false,
        "supportsHitConditionalBreakpoints": false,
        "supportsFunctionBreakpoints": false,
        "supportsConfigurationDoneRequest": false,
        "supportsEvaluateForHovers": false,
        "supportsStepBack": false,
        "supportsSetVariable": false,
        "supportsRestartFrame": false,
        "supportsStepInTargetsRequest": false,
        "supportsGotoTargetsRequest": false,
        "supportsCompletionsRequest": false,
        "supportsRestartRequest": false,
        "supportsExceptionOptions": false,
        "supportsValueFormattingOptions": false,
        "supportsExceptionInfoRequest": false,
        "supportTerminateDebuggee": false,
        "supportsDelayedStackTraceLoading": false,
        "supportsLoadedSourcesRequest": false,
        "supportsLogPoints": false,
        "supportsTerminateThreadsRequest": false,
        "supportsSetExpression": false,
        "supportsTerminateRequest": false,
        "supportsDataBreakpoints": false,
        "supportsReadMemoryRequest": false,
        "supportsDisassembleRequest": false,
        "supportsCancelRequest": false,
        "supportsBreakpointLocationsRequest": false,
        "supportsClipboardContext": false,
        "supportsSteppingGranularity": false,
        "supportsInstructionBreakpoints": false,
        "supportsExceptionFilterOptions": false,
        "supportsSingleThreadExecutionRequests": false,
    })
}

/// `::Health_var` → `("Health", true)`; anything else passes through.
fn unwrap_synthetic_local(name: &str) -> (&str, bool) {
    match name
        .strip_prefix(SYNTHETIC_LOCAL_PREFIX)
        .and_then(|rest| rest.strip_suffix(SYNTHETIC_LOCAL_SUFFIX))
    {
        Some(stripped) if !stripped.is_empty() => (stripped, true),
        _ => (name, false),
    }
}

/// Best effort: server frame names look like `Object..Routine(...)`, and
/// the routine-local group is addressed by the part after the `..` marker.
/// Names without the marker fall back to the scope itself (empty path).
fn routine_local_path(frame_name: &str) -> Vec<String> {
    let name = frame_name.trim_end_matches("(...)");
    match name.splitn(2, "..").nth(1) {
        Some(local) if !local.is_empty() => vec![local.to_owned()],
        _ => Vec::new(),
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
