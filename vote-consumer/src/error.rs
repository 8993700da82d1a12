use thiserror::Error;
use vote_common::counter::CounterError;
use vote_common::stream::StreamError;

/// Enumeration of errors that stop the vote consumer from starting.
/// Once the consumption loop runs, failures are handled per batch and per event instead.
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("event log error: {0}")]
    EventLog(#[from] StreamError),
    #[error("counter store error: {0}")]
    CounterStore(#[from] CounterError),
    #[error("failed to install {0} signal handler: {1}")]
    SignalHandler(&'static str, std::io::Error),
}
