use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Datetime format used on the wire for the work period of an upload.
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A single named value of a payload, optionally commented or explicitly skipped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestValue {
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub skipped: bool,
    /// Name of the uploaded file, for values of upload tests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    /// How an uploaded file is encoded in `value`, `text` or `base64`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
}

impl TestValue {
    pub fn new(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            comment: None,
            skipped: false,
            filename: None,
            encoding: None,
        }
    }

    /// The value of an upload test: file contents encoded as `encoding`.
    pub fn file(contents: impl Into<String>, filename: &str, encoding: &str) -> Self {
        Self {
            filename: Some(filename.to_owned()),
            encoding: Some(encoding.to_owned()),
            ..Self::new(contents.into())
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    /// A value the target should record as intentionally not performed.
    pub fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::new(Value::Null)
        }
    }
}

mod datetime {
    use chrono::NaiveDateTime;
    use serde::{self, Deserialize, Deserializer, Serializer};

    use super::DATETIME_FORMAT;

    pub fn serialize<S>(dt: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&dt.format(DATETIME_FORMAT).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<NaiveDateTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        NaiveDateTime::parse_from_str(&s, DATETIME_FORMAT).map_err(serde::de::Error::custom)
    }
}

/// The uploadable form of a record. Built fresh for every upload attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub unit_test_collection: String,
    #[serde(with = "datetime")]
    pub work_started: NaiveDateTime,
    #[serde(with = "datetime")]
    pub work_completed: NaiveDateTime,
    pub tests: BTreeMap<String, TestValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    /// Idempotency key of the record this payload was built from. Target clients decide how to
    /// transmit it.
    #[serde(skip)]
    pub key: String,
}

impl Payload {
    /// Mark each of `tests` as skipped, adding entries for tests the payload did not contain.
    pub fn skip_tests(&mut self, tests: &[String]) {
        for test in tests {
            self.tests.insert(test.clone(), TestValue::skipped());
        }
    }
}
