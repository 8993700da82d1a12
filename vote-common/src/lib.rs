pub mod counter;
pub mod health;
pub mod metrics;
pub mod retry;
pub mod stream;
pub mod test_utils;
pub mod vote;
