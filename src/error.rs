use std::io;

/// Error codes surfaced to the client, following the vscode debug adapter
/// numbering the original extension uses.
pub const UNRECOGNIZED_REQUEST: i64 = 1014;
pub const INTERNAL_EXCEPTION: i64 = 1104;
pub const SCOPE_RESOLUTION: i64 = 1106;
pub const STATE_RETRIEVAL: i64 = 1108;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- generic errors --------------------------------------------
    #[error(transparent)]
    IO(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("malformed {0} request: {1}")]
    MalformedRequest(&'static str, &'static str),

    // --------------------------------- state retrieval (1108) ------------------------------------
    #[error("could not retrieve stack frame for {0}")]
    FrameNotFound(i64),
    #[error("could not retrieve local scope for frame {0}")]
    LocalScopeNotFound(i64),
    #[error("global variable evaluation not supported yet")]
    GlobalEvalUnsupported,
    #[error("invalid evaluate request")]
    InvalidEvaluate,

    // --------------------------------- scope resolution (1106) -----------------------------------
    #[error("could not resolve scope for variables reference {0}")]
    UnknownVariablesReference(i64),
    #[error("could not resolve value-rooted scopes yet")]
    ValueRootUnsupported,
}

impl Error {
    /// The DAP error code this failure surfaces as.
    pub fn code(&self) -> i64 {
        match self {
            Error::FrameNotFound(_)
            | Error::LocalScopeNotFound(_)
            | Error::GlobalEvalUnsupported
            | Error::InvalidEvaluate => STATE_RETRIEVAL,
            Error::UnknownVariablesReference(_) | Error::ValueRootUnsupported => SCOPE_RESOLUTION,
            Error::IO(_) | Error::Json(_) | Error::MalformedRequest(..) => INTERNAL_EXCEPTION,
        }
    }

    /// Internal faults carry their detail to telemetry, not to the user.
    pub fn telemetry_only(&self) -> bool {
        self.code() == INTERNAL_EXCEPTION
    }
}
