//! Papyrus script discovery.
//!
//! The server names compiled script units by object name (`MyMod:MyScript`)
//! while the client only understands file paths. Resolving one to the other
//! means probing the source roots for a `.psc` file whose declared
//! `scriptname` matches.

use log::warn;
use std::fs;
use std::path::{MAIN_SEPARATOR_STR, Path, PathBuf};

/// Filesystem probing used by source resolution. A trait so session tests
/// can substitute a canned directory layout.
pub trait ScriptLookup: Send {
    /// Object name declared on the first `scriptname` line of a script
    /// file, if any.
    fn declared_script_name(&self, path: &Path) -> Option<String>;

    fn file_exists(&self, path: &Path) -> bool;
}

pub struct FsScriptLookup;

impl ScriptLookup for FsScriptLookup {
    fn declared_script_name(&self, path: &Path) -> Option<String> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) => {
                warn!(target: "proxy", "error reading {}: {err}", path.display());
                return None;
            }
        };
        match declared_script_name_in(&text) {
            Some(name) => Some(name),
            None => {
                warn!(target: "proxy", "no scriptname declaration in {}", path.display());
                None
            }
        }
    }

    fn file_exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

fn declared_script_name_in(text: &str) -> Option<String> {
    for line in text.lines() {
        let line = line.trim();
        if line.to_lowercase().starts_with("scriptname") {
            return line.split_whitespace().nth(1).map(str::to_owned);
        }
    }
    None
}

/// `MyMod:MyScript` → `MyMod/MyScript.psc`, relative to a source root.
pub fn object_relative_path(object: &str) -> PathBuf {
    PathBuf::from(format!(
        "{}.psc",
        object.replace(':', MAIN_SEPARATOR_STR)
    ))
}

/// True when a script file exists at `path` and declares `object`
/// (case-insensitively, as the compiler treats script names).
pub fn object_declared_at(lookup: &dyn ScriptLookup, object: &str, path: &Path) -> bool {
    lookup.file_exists(path)
        && lookup
            .declared_script_name(path)
            .is_some_and(|declared| declared.eq_ignore_ascii_case(object))
}
