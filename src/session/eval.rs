//! Expression evaluation against a paused frame.
//!
//! The server has no expression engine, only hierarchical value lookups, so
//! an evaluate request is resolved by turning the expression text into a
//! handle-tree path and asking the server for the value at that path. The
//! local scope may not have been listed yet when the user types into the
//! REPL; in that case it is populated once, then resolution is re-attempted.

use super::{DEFAULT_REQUEST_TIMEOUT, Session, routine_local_path};
use crate::error::Error;
use crate::protocol::DapRequest;
use crate::session::handles::Root;
use crate::session::pending::Outcome;
use crate::session::registry;
use itertools::Itertools;
use serde_json::{Value, json};
use std::time::Instant;

impl Session {
    pub(crate) fn handle_evaluate(&mut self, request: &DapRequest, now: Instant) -> anyhow::Result<()> {
        let expression = request
            .arguments
            .get("expression")
            .ok_or(Error::InvalidEvaluate)?;
        let path = path_from_expression(expression)?;
        let frame_id = request
            .arguments
            .get("frameId")
            .and_then(Value::as_i64)
            // no owning frame means a global lookup, which the server's
            // dialect has no addressing for
            .ok_or(Error::GlobalEvalUnsupported)?;
        self.resolve_expression(request.seq, frame_id, path, false, now)
    }

    /// One resolution attempt. `repopulated` caps the local-scope refresh at
    /// a single round trip per evaluate request.
    fn resolve_expression(
        &mut self,
        request_seq: i64,
        frame_id: i64,
        path: Vec<String>,
        repopulated: bool,
        now: Instant,
    ) -> anyhow::Result<()> {
        let frame = match self.registry.frame(frame_id).cloned() {
            Some(frame) => frame,
            None => {
                return self.domain_error_response(
                    request_seq,
                    "evaluate",
                    &Error::FrameNotFound(frame_id),
                );
            }
        };
        let local = match self.tree.find_scope(frame_id, &[]) {
            Some(scope) => scope.handle,
            None => self.tree.make_frame_scopes(frame_id).0,
        };
        let populated = self.tree.variables_in_scope(local).next().is_some();
        if !populated {
            if repopulated {
                return self.domain_error_response(
                    request_seq,
                    "evaluate",
                    &Error::LocalScopeNotFound(frame_id),
                );
            }
            return self.repopulate_locals(request_seq, frame_id, &frame.name, local, path, now);
        }
        let head = &path[0];
        let visible = head.eq_ignore_ascii_case("self")
            || self
                .tree
                .variables_in_scope(local)
                .any(|variable| variable.name.eq_ignore_ascii_case(head));
        if !visible {
            return self.domain_error_response(
                request_seq,
                "evaluate",
                &Error::GlobalEvalUnsupported,
            );
        }
        let root = self.frame_root(frame_id);
        let parent = match self.tree.get_or_create_parent_scope(root, Some(frame_id), &path) {
            Ok(parent) => parent,
            Err(err) => return self.domain_error_response(request_seq, "evaluate", &err),
        };
        let arguments = self.frame_rooted_arguments(frame_id, json!(path));
        self.send_request_to_server(
            "value",
            arguments,
            DEFAULT_REQUEST_TIMEOUT,
            now,
            Box::new(move |session, outcome, _| {
                session.finish_evaluate(request_seq, frame_id, &path, parent, outcome)
            }),
        )
    }

    /// List the frame's routine locals into its Local scope, then retry the
    /// resolution exactly once.
    fn repopulate_locals(
        &mut self,
        request_seq: i64,
        frame_id: i64,
        frame_name: &str,
        local: i64,
        path: Vec<String>,
        now: Instant,
    ) -> anyhow::Result<()> {
        let arguments = self.frame_rooted_arguments(frame_id, json!(routine_local_path(frame_name)));
        self.send_request_to_server(
            "variables",
            arguments,
            DEFAULT_REQUEST_TIMEOUT,
            now,
            Box::new(move |session, outcome, now| match outcome {
                Outcome::Response(response)
                    if response.get("success").and_then(Value::as_bool) == Some(true) =>
                {
                    let raw = response.pointer("/body/variables").cloned();
                    session.translate_variables(local, raw.as_ref());
                    session.resolve_expression(request_seq, frame_id, path, true, now)
                }
                _ => session.domain_error_response(
                    request_seq,
                    "evaluate",
                    &Error::LocalScopeNotFound(frame_id),
                ),
            }),
        )
    }

    fn finish_evaluate(
        &mut self,
        request_seq: i64,
        frame_id: i64,
        path: &[String],
        parent_scope: i64,
        outcome: Outcome,
    ) -> anyhow::Result<()> {
        let response = match outcome {
            Outcome::Response(response) => response,
            Outcome::Timeout => {
                return self.relay_outcome(request_seq, "evaluate", Outcome::Timeout);
            }
        };
        if response.get("success").and_then(Value::as_bool) != Some(true) {
            return self.relay_outcome(request_seq, "evaluate", Outcome::Response(response));
        }
        let value = response.pointer("/body/value").cloned().unwrap_or(Value::Null);
        let type_name = response
            .pointer("/body/type")
            .and_then(Value::as_str)
            .map(str::to_owned);
        let leaf = path.last().cloned().unwrap_or_default();
        let display = super::display_value(&value);
        // the server's value response says nothing about nesting; anything
        // reached through a member chain is compound, a bare routine local
        // is a leaf
        let compound = path.len() > 1;
        self.tree
            .insert_variable(leaf, display.clone(), type_name.clone(), parent_scope, compound);
        // the result always hands back the scope at the full path, so the
        // client can expand it like any other variables reference
        let root = self.frame_root(frame_id);
        let variables_reference =
            match self.tree.get_or_create_scope(root, Some(frame_id), path) {
                Ok(handle) => {
                    self.registry.bind_variables_reference(handle, frame_id);
                    handle
                }
                Err(err) => return self.domain_error_response(request_seq, "evaluate", &err),
            };
        let mut body = json!({
            "result": display,
            "variablesReference": variables_reference,
        });
        if let Some(type_name) = type_name {
            body["type"] = json!(type_name);
        }
        self.respond(request_seq, "evaluate", true, None, Some(body))?;
        // REPL results also land in the debug console
        self.send_event(
            "output",
            Some(json!({"category": "console", "output": format!("{display}\n")})),
        )
    }

    fn frame_root(&self, frame_id: i64) -> Root {
        let thread_id = self.registry.thread_of_frame(frame_id).unwrap_or(0);
        Root::StackFrame {
            thread_id,
            frame_index: frame_id - thread_id * registry::FRAME_ID_STRIDE,
        }
    }
}

/// Turn REPL text into a lookup path. A JSON array of segments is taken
/// verbatim; a string is split on member-access dots.
fn path_from_expression(expression: &Value) -> Result<Vec<String>, Error> {
    let path = match expression {
        Value::Array(segments) => segments
            .iter()
            .map(|segment| segment.as_str().map(str::to_owned).ok_or(Error::InvalidEvaluate))
            .try_collect()?,
        Value::String(text) => text
            .split('.')
            .map(|segment| segment.trim().to_owned())
            .collect_vec(),
        _ => return Err(Error::InvalidEvaluate),
    };
    if path.is_empty() || path.iter().any(String::is_empty) {
        return Err(Error::InvalidEvaluate);
    }
    Ok(path)
}
