//! Identity registries: the thread roster, the stack-frame table, and the
//! opportunistic object-name/source caches.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// The server reaps threads lazily and sometimes reports none at all, but a
/// client must never observe an empty roster (it would have nothing to ask
/// a pause for). Id 0 is reserved for this stand-in.
pub const PLACEHOLDER_THREAD_ID: i64 = 0;
pub const PLACEHOLDER_THREAD_NAME: &str = "<no threads>";

/// Frame ids encode their owning thread: `thread_id * 1000 + ordinal`.
pub const FRAME_ID_STRIDE: i64 = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thread {
    pub id: i64,
    pub name: String,
}

impl Thread {
    pub fn placeholder() -> Thread {
        Thread {
            id: PLACEHOLDER_THREAD_ID,
            name: PLACEHOLDER_THREAD_NAME.to_owned(),
        }
    }
}

/// A client-facing stack frame synthesized from one server trace entry.
#[derive(Debug, Clone)]
pub struct StackFrame {
    pub id: i64,
    pub thread_id: i64,
    /// Object name of the script unit that owns the frame.
    pub object: String,
    pub name: String,
    pub source: Option<Value>,
    pub line: i64,
    pub column: i64,
}

pub fn frame_id(thread_id: i64, ordinal: usize) -> i64 {
    thread_id * FRAME_ID_STRIDE + ordinal as i64
}

/// Reverse of [`frame_id`]. One-way arithmetic: it recovers the thread but
/// cannot validate that the frame ever existed, which is why a frame →
/// thread map is kept alongside.
pub fn thread_of_frame_id(frame_id: i64) -> i64 {
    frame_id / FRAME_ID_STRIDE
}

pub struct Registry {
    threads: Vec<Thread>,
    frames: HashMap<i64, StackFrame>,
    frame_threads: HashMap<i64, i64>,
    varref_frames: HashMap<i64, i64>,
    // Object identifiers and their files are stable for the life of a
    // session; these two are never invalidated.
    object_sources: HashMap<String, Value>,
    path_objects: HashMap<String, String>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry {
            threads: vec![Thread::placeholder()],
            frames: HashMap::new(),
            frame_threads: HashMap::new(),
            varref_frames: HashMap::new(),
            object_sources: HashMap::new(),
            path_objects: HashMap::new(),
        }
    }

    pub fn threads(&self) -> &[Thread] {
        &self.threads
    }

    pub fn thread_started(&mut self, id: i64) {
        if self.threads.len() == 1 && self.threads[0].id == PLACEHOLDER_THREAD_ID {
            self.threads.clear();
        }
        self.threads.push(Thread {
            id,
            name: format!("<thread {id}>"),
        });
    }

    pub fn thread_exited(&mut self, id: i64) {
        self.threads.retain(|thread| thread.id != id);
        if self.threads.is_empty() {
            self.threads.push(Thread::placeholder());
        }
    }

    /// Replace the roster with a server-reported list, substituting the
    /// placeholder when the list is empty.
    pub fn replace_threads(&mut self, threads: Vec<Thread>) {
        self.threads = if threads.is_empty() {
            vec![Thread::placeholder()]
        } else {
            threads
        };
    }

    pub fn add_frame(&mut self, frame: StackFrame) {
        self.frame_threads.insert(frame.id, frame.thread_id);
        self.frames.insert(frame.id, frame);
    }

    pub fn frame(&self, id: i64) -> Option<&StackFrame> {
        self.frames.get(&id)
    }

    pub fn thread_of_frame(&self, frame_id: i64) -> Option<i64> {
        self.frame_threads.get(&frame_id).copied()
    }

    pub fn bind_variables_reference(&mut self, variables_reference: i64, frame_id: i64) {
        self.varref_frames.insert(variables_reference, frame_id);
    }

    pub fn frame_of_variables_reference(&self, variables_reference: i64) -> Option<i64> {
        self.varref_frames.get(&variables_reference).copied()
    }

    pub fn cache_source(&mut self, object: &str, source: Value) {
        self.object_sources.insert(object.to_owned(), source);
    }

    pub fn source_for_object(&self, object: &str) -> Option<&Value> {
        self.object_sources.get(object)
    }

    pub fn cache_path_object(&mut self, path: &str, object: &str) {
        self.path_objects.insert(path.to_owned(), object.to_owned());
    }

    pub fn object_for_path(&self, path: &str) -> Option<&str> {
        self.path_objects.get(path).map(String::as_str)
    }

    /// Tear down everything whose validity died with the last pause. The
    /// object-name caches survive; threads do too (the roster is event
    /// driven, not frame scoped).
    pub fn clear_frame_state(&mut self) {
        self.frames.clear();
        self.frame_threads.clear();
        self.varref_frames.clear();
    }
}

impl Default for Registry {
    fn default() -> Self {
        Registry::new()
    }
}
