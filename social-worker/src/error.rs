use social_common::store;
use thiserror::Error;

use crate::sink::SinkError;

/// Ways a single staged item can fail to make it through enrichment and the
/// sink. None of these delete or acknowledge the item: it stays in the store
/// for a retry or for manual inspection.
#[derive(Error, Debug)]
pub enum ItemError {
    #[error("failed to decode staged document: {0}")]
    DecodeError(#[from] serde_json::Error),
    #[error("no valid text to classify")]
    EmptyContent,
    #[error("sink write failed: {0}")]
    SinkError(#[from] SinkError),
}

/// Enumeration of errors related to initialization and running of the worker.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("a store error occurred: {0}")]
    StoreError(#[from] store::StoreError),
    #[error("failed to initialize the sink: {0}")]
    SinkInitError(#[from] SinkError),
}
