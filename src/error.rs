//! Error types for the export pipeline.

use thiserror::Error;

/// Errors surfaced by an export run.
///
/// `Render` and `Assembly` carry everything a caller needs to offer a
/// resume: the failing page, whether a checkpoint of earlier chunks was
/// persisted, and the session id to resume from. `Cancelled` is not a
/// failure and should not be reported to users.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("export cancelled")]
    Cancelled,

    #[error("page render failed (page {}): {message}", display_page(.page_index))]
    Render {
        page_index: Option<usize>,
        message: String,
        resumable: bool,
        session_id: String,
    },

    #[error("page {page_index} could not be assembled: {message}")]
    Assembly {
        page_index: usize,
        message: String,
        resumable: bool,
        session_id: String,
    },

    #[error("failed to merge chunk documents: {0}")]
    Merge(String),

    #[error("failed to deliver export: {0}")]
    Delivery(String),

    #[error("invalid export request: {0}")]
    InvalidRequest(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

fn display_page(page_index: &Option<usize>) -> String {
    match page_index {
        Some(index) => index.to_string(),
        None => "unknown".to_string(),
    }
}

impl ExportError {
    /// True for the cancellation tag, which callers treat as "nothing to report".
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ExportError::Cancelled)
    }

    /// True when a checkpoint exists that a later run can resume from.
    pub fn is_resumable(&self) -> bool {
        match self {
            ExportError::Render { resumable, .. } | ExportError::Assembly { resumable, .. } => {
                *resumable
            }
            _ => false,
        }
    }

    /// Session id to pass back in for a resume attempt.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            ExportError::Render { session_id, .. } | ExportError::Assembly { session_id, .. } => {
                Some(session_id)
            }
            _ => None,
        }
    }

    /// Export-wide index of the page that caused the failure, if known.
    pub fn page_index(&self) -> Option<usize> {
        match self {
            ExportError::Render { page_index, .. } => *page_index,
            ExportError::Assembly { page_index, .. } => Some(*page_index),
            _ => None,
        }
    }
}

/// Why a single chunk operation stopped short of completion.
///
/// This is the coordinator's view; the pipeline enriches it with session
/// details when converting into [`ExportError`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChunkFailure {
    #[error("page render failed: {message}")]
    Render {
        page_index: Option<usize>,
        message: String,
    },

    #[error("page {page_index} could not be assembled: {message}")]
    Assembly { page_index: usize, message: String },
}

impl ChunkFailure {
    /// Turns chunk-local page indices into export-wide ones.
    pub fn offset_pages(self, first_page: usize) -> Self {
        match self {
            ChunkFailure::Render {
                page_index,
                message,
            } => ChunkFailure::Render {
                page_index: page_index.map(|index| index + first_page),
                message,
            },
            ChunkFailure::Assembly {
                page_index,
                message,
            } => ChunkFailure::Assembly {
                page_index: page_index + first_page,
                message,
            },
        }
    }

    pub(crate) fn into_export_error(self, resumable: bool, session_id: String) -> ExportError {
        match self {
            ChunkFailure::Render {
                page_index,
                message,
            } => ExportError::Render {
                page_index,
                message,
                resumable,
                session_id,
            },
            ChunkFailure::Assembly {
                page_index,
                message,
            } => ExportError::Assembly {
                page_index,
                message,
                resumable,
                session_id,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancelled_is_not_resumable() {
        let err = ExportError::Cancelled;
        assert!(err.is_cancelled());
        assert!(!err.is_resumable());
        assert!(err.session_id().is_none());
    }

    #[test]
    fn test_chunk_failure_carries_session_details() {
        let failure = ChunkFailure::Render {
            page_index: Some(4),
            message: "gpu lost".to_string(),
        };

        let err = failure.into_export_error(true, "session-1".to_string());

        assert!(!err.is_cancelled());
        assert!(err.is_resumable());
        assert_eq!(err.session_id(), Some("session-1"));
        assert_eq!(err.page_index(), Some(4));
        assert_eq!(err.to_string(), "page render failed (page 4): gpu lost");
    }

    #[test]
    fn test_render_error_without_page() {
        let err = ChunkFailure::Render {
            page_index: None,
            message: "no context".to_string(),
        }
        .into_export_error(false, "s".to_string());

        assert_eq!(err.to_string(), "page render failed (page unknown): no context");
    }

    #[test]
    fn test_offset_pages() {
        let failure = ChunkFailure::Assembly {
            page_index: 1,
            message: "truncated".to_string(),
        };
        assert_eq!(
            failure.offset_pages(6),
            ChunkFailure::Assembly {
                page_index: 7,
                message: "truncated".to_string(),
            }
        );

        let failure = ChunkFailure::Render {
            page_index: None,
            message: "x".to_string(),
        };
        assert_eq!(failure.clone().offset_pages(6), failure);
    }
}
