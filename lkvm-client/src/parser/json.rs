//! JSON output parsing.

use serde::Deserialize;
use serde_json::de::StrRead;
use serde_json::StreamDeserializer;

use crate::error::ParseError;
use crate::types::{InstanceState, Record};

/// One instance object. Unknown fields are ignored.
#[derive(Debug, Deserialize)]
struct JsonRecord {
    name: String,
    state: String,
    #[serde(default)]
    pid: Option<u32>,
    #[serde(default, alias = "mem", alias = "memory")]
    memory_mib: Option<u64>,
    #[serde(default, alias = "cpus")]
    vcpus: Option<u32>,
}

impl TryFrom<JsonRecord> for Record {
    type Error = ParseError;

    fn try_from(json: JsonRecord) -> Result<Self, ParseError> {
        if json.name.trim().is_empty() {
            return Err(ParseError::UnexpectedFormat(
                "JSON record has an empty name".to_string(),
            ));
        }
        Ok(Record {
            name: json.name,
            state: InstanceState::from_tool_word(&json.state),
            pid: json.pid,
            memory_mib: json.memory_mib,
            vcpus: json.vcpus,
        })
    }
}

fn classify(error: serde_json::Error) -> ParseError {
    if error.is_eof() {
        ParseError::TruncatedOutput(format!("JSON ended early: {}", error))
    } else {
        ParseError::UnexpectedFormat(format!("invalid JSON record: {}", error))
    }
}

/// Parse a JSON array of instance objects.
pub(crate) fn parse_array(raw: &str) -> Result<Vec<Record>, ParseError> {
    let records: Vec<JsonRecord> = serde_json::from_str(raw).map_err(classify)?;
    records.into_iter().map(Record::try_from).collect()
}

/// Newline-delimited JSON objects, decoded one at a time.
pub(crate) struct JsonRows<'a> {
    stream: StreamDeserializer<'a, StrRead<'a>, JsonRecord>,
    done: bool,
}

impl<'a> JsonRows<'a> {
    pub(crate) fn new(raw: &'a str) -> Self {
        Self {
            stream: serde_json::Deserializer::from_str(raw).into_iter::<JsonRecord>(),
            done: false,
        }
    }
}

impl<'a> Iterator for JsonRows<'a> {
    type Item = Result<Record, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.stream.next()? {
            Ok(record) => {
                let row = Record::try_from(record);
                self.done = row.is_err();
                Some(row)
            }
            Err(e) => {
                self.done = true;
                Some(Err(classify(e)))
            }
        }
    }
}
