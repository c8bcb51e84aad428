//! Error types for the GPU profiler

use crate::cupti::bindings::ApiStatus;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GpuError {
    /// A CUPTI/driver call failed. These are not retried.
    #[error("{op} failed{}: {status}", context_suffix(.context))]
    Driver {
        op: &'static str,
        context: Option<u32>,
        status: ApiStatus,
    },

    #[error("PC sampling is not initialized for context {context}")]
    NotInitialized { context: u32 },

    #[error("invalid PC sampling configuration: {0}")]
    InvalidConfig(String),

    #[error("PC sampling drain for context {context} still pending after {rounds} rounds")]
    DrainIncomplete { context: u32, rounds: u32 },
}

fn context_suffix(context: &Option<u32>) -> String {
    match context {
        Some(id) => format!(" for context {}", id),
        None => String::new(),
    }
}

impl GpuError {
    pub(crate) fn driver(op: &'static str, context: Option<u32>) -> impl FnOnce(ApiStatus) -> Self {
        move |status| GpuError::Driver {
            op,
            context,
            status,
        }
    }

    /// Fill in the context of a driver error raised below the context layer
    pub(crate) fn for_context(self, context_id: u32) -> Self {
        match self {
            GpuError::Driver {
                op,
                context: None,
                status,
            } => GpuError::Driver {
                op,
                context: Some(context_id),
                status,
            },
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, GpuError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_error_names_operation_and_context() {
        let err = GpuError::driver("cuptiPCSamplingStart", Some(7))(ApiStatus::INVALID_CONTEXT);
        let msg = err.to_string();
        assert!(msg.contains("cuptiPCSamplingStart"));
        assert!(msg.contains("context 7"));
        assert!(msg.contains("CUPTI_ERROR_INVALID_CONTEXT"));
    }

    #[test]
    fn test_driver_error_without_context() {
        let err = GpuError::driver("cuptiGetCubinCrc", None)(ApiStatus::UNKNOWN);
        assert_eq!(err.to_string(), "cuptiGetCubinCrc failed: CUPTI_ERROR_UNKNOWN (999)");
    }

    #[test]
    fn test_for_context_keeps_existing_context() {
        let err = GpuError::driver("cuptiGetSassToSourceCorrelation", None)(ApiStatus::UNKNOWN)
            .for_context(4);
        assert!(matches!(err, GpuError::Driver { context: Some(4), .. }));

        let err = GpuError::driver("cuptiPCSamplingStop", Some(2))(ApiStatus::UNKNOWN).for_context(4);
        assert!(matches!(err, GpuError::Driver { context: Some(2), .. }));

        let err = GpuError::NotInitialized { context: 1 }.for_context(4);
        assert!(matches!(err, GpuError::NotInitialized { context: 1 }));
    }
}
