//! papyrus-proxy - a translation proxy between a Debug Adapter Protocol
//! client (VSCode and friends) and the Starfield Papyrus debug server.
//!
//! The in-game server speaks a partial, non-standard dialect of DAP: it
//! addresses values by `root + path` instead of integer handles, identifies
//! sources by object name instead of file paths, ignores requests it does
//! not know, and refuses or mangles several standard requests. The proxy
//! sits in the middle and makes the server look compliant: it answers
//! requests locally where the server never will, rewrites addressing in
//! both directions, and compensates for known server defects (dropped pause
//! responses, "VM is not paused" thread refusals, and so on).

pub mod args;
pub mod error;
pub mod protocol;
pub mod script;
pub mod session;
pub mod tracer;
pub mod transport;
