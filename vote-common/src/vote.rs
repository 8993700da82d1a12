//! # Vote
//!
//! The vote event as written to the stream by the submission API, and the closed set of
//! options a vote may be cast for.
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stream field names, shared by producers and consumers.
pub const OPTION_FIELD: &str = "option";
pub const TIMESTAMP_FIELD: &str = "timestamp";
pub const REQUEST_ID_FIELD: &str = "request_id";

/// Enumeration of errors that make a vote event permanently unprocessable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VoteEventError {
    #[error("vote event has no 'option' field")]
    MissingOption,
    #[error("{0} is not a valid vote option")]
    UnknownOption(String),
}

/// The fixed set of options a vote can be cast for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoteOption {
    Cats,
    Dogs,
}

impl VoteOption {
    pub const ALL: [VoteOption; 2] = [VoteOption::Cats, VoteOption::Dogs];

    pub fn as_str(&self) -> &'static str {
        match self {
            VoteOption::Cats => "cats",
            VoteOption::Dogs => "dogs",
        }
    }
}

impl FromStr for VoteOption {
    type Err = VoteEventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cats" => Ok(VoteOption::Cats),
            "dogs" => Ok(VoteOption::Dogs),
            invalid => Err(VoteEventError::UnknownOption(invalid.to_owned())),
        }
    }
}

impl fmt::Display for VoteOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A vote as recorded in the stream.
///
/// Only `option` decides whether an event can be processed. `timestamp` and `request_id`
/// are carried for tracing and are `None` when absent or unparseable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteEvent {
    pub option: VoteOption,
    pub timestamp: Option<i64>,
    pub request_id: Option<String>,
}

impl VoteEvent {
    /// Build a new event as the submission API would, stamped now with a fresh request id.
    pub fn new(option: VoteOption) -> Self {
        Self {
            option,
            timestamp: Some(Utc::now().timestamp_millis()),
            request_id: Some(uuid::Uuid::new_v4().to_string()),
        }
    }

    /// Interpret the field/value pairs of a stream entry.
    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self, VoteEventError> {
        let option = fields
            .get(OPTION_FIELD)
            .ok_or(VoteEventError::MissingOption)?
            .parse::<VoteOption>()?;

        let timestamp = fields
            .get(TIMESTAMP_FIELD)
            .and_then(|ts| ts.parse::<i64>().ok());
        let request_id = fields
            .get(REQUEST_ID_FIELD)
            .filter(|id| !id.is_empty())
            .cloned();

        Ok(Self {
            option,
            timestamp,
            request_id,
        })
    }

    /// Field/value pairs in the order they are appended to the stream.
    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = vec![(OPTION_FIELD, self.option.as_str().to_owned())];
        if let Some(timestamp) = self.timestamp {
            fields.push((TIMESTAMP_FIELD, timestamp.to_string()));
        }
        if let Some(request_id) = &self.request_id {
            fields.push((REQUEST_ID_FIELD, request_id.clone()));
        }
        fields
    }

    /// Producer-side capture time, if the event carried a valid one.
    pub fn captured_at(&self) -> Option<DateTime<Utc>> {
        self.timestamp.and_then(DateTime::from_timestamp_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_full_event() {
        let event = VoteEvent::from_fields(&fields(&[
            ("option", "cats"),
            ("timestamp", "1700000000000"),
            ("request_id", "8d7c1f1e-1111-4a4a-9b9b-000000000000"),
        ]))
        .expect("failed to parse a valid event");

        assert_eq!(event.option, VoteOption::Cats);
        assert_eq!(event.timestamp, Some(1_700_000_000_000));
        assert_eq!(
            event.request_id.as_deref(),
            Some("8d7c1f1e-1111-4a4a-9b9b-000000000000")
        );
        assert_eq!(
            event.captured_at().map(|dt| dt.timestamp()),
            Some(1_700_000_000)
        );
    }

    #[test]
    fn test_missing_option_is_invalid() {
        let result = VoteEvent::from_fields(&fields(&[("timestamp", "1")]));
        assert_eq!(result, Err(VoteEventError::MissingOption));
    }

    #[test]
    fn test_unknown_option_is_invalid() {
        let result = VoteEvent::from_fields(&fields(&[("option", "parrots")]));
        assert_eq!(
            result,
            Err(VoteEventError::UnknownOption("parrots".to_owned()))
        );

        // Options are case sensitive, as the submission API only ever writes lowercase.
        let result = VoteEvent::from_fields(&fields(&[("option", "Dogs")]));
        assert!(matches!(result, Err(VoteEventError::UnknownOption(_))));
    }

    #[test]
    fn test_tracing_fields_do_not_invalidate() {
        let event = VoteEvent::from_fields(&fields(&[
            ("option", "dogs"),
            ("timestamp", "yesterday"),
            ("request_id", ""),
        ]))
        .expect("tracing fields must not invalidate an event");

        assert_eq!(event.option, VoteOption::Dogs);
        assert_eq!(event.timestamp, None);
        assert_eq!(event.request_id, None);
    }

    #[test]
    fn test_new_event_fields() {
        let event = VoteEvent::new(VoteOption::Dogs);
        let fields = event.to_fields();

        assert_eq!(fields[0], ("option", "dogs".to_owned()));
        assert_eq!(fields[1].0, "timestamp");
        assert_eq!(fields[2].0, "request_id");
        assert!(event.request_id.is_some());
    }

    #[test]
    fn test_option_serde() {
        let json = serde_json::to_string(&VoteOption::Cats).unwrap();
        assert_eq!(json, "\"cats\"");
        let option: VoteOption = serde_json::from_str("\"dogs\"").unwrap();
        assert_eq!(option, VoteOption::Dogs);
    }
}
