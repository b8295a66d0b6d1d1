//! Output parsing for the hypervisor tool's `list` command.
//!
//! Every output layout the client understands is a tagged schema with its own
//! row parser. A probe over the first meaningful line picks the schema:
//!
//! ```text
//!   first line               schema
//!   ──────────────────────   ─────────────────────────────
//!   `[` or `{`               Json (array, or one object per line)
//!   `PID NAME STATE`         Tabular V1 (lkvm's native layout)
//!   `PID NAME STATE MEM CPUS` Tabular V2
//!   `<pid|-> <name> <state>` FixedColumns (headerless fallback)
//!   anything else            ParseError::UnexpectedFormat
//! ```
//!
//! Header columns are matched by name, so reordered or re-spaced columns
//! still parse. A header that is not known is an error: a silently empty
//! list would report live VMs as gone.

mod json;
mod tabular;

pub use tabular::{Column, TableVersion};

use std::fmt;

use crate::error::ParseError;
use crate::types::{CommandResult, Record};

/// A known output layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputSchema {
    /// JSON array or newline-delimited objects
    Json,
    /// Whitespace table with a named-column header
    Tabular(TableVersion),
    /// Headerless `<pid> <name> <state...>` rows
    FixedColumns,
}

impl fmt::Display for OutputSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputSchema::Json => f.write_str("json"),
            OutputSchema::Tabular(version) => write!(f, "tabular-{}", version),
            OutputSchema::FixedColumns => f.write_str("fixed-columns"),
        }
    }
}

/// Lazy, single-pass sequence of parsed records.
///
/// The first row error ends the sequence.
pub struct Records<'a> {
    schema: Option<OutputSchema>,
    rows: Rows<'a>,
}

enum Rows<'a> {
    Empty,
    Table(tabular::TableRows<'a>),
    JsonArray(std::vec::IntoIter<Record>),
    JsonStream(json::JsonRows<'a>),
}

impl<'a> Records<'a> {
    /// Detected schema, `None` for output with no content.
    pub fn schema(&self) -> Option<OutputSchema> {
        self.schema
    }
}

impl<'a> Iterator for Records<'a> {
    type Item = Result<Record, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.rows {
            Rows::Empty => None,
            Rows::Table(rows) => rows.next(),
            Rows::JsonArray(rows) => rows.next().map(Ok),
            Rows::JsonStream(rows) => rows.next(),
        }
    }
}

/// Identify the schema of `raw` from its first meaningful line.
///
/// Returns `Ok(None)` when the output has no content at all.
pub fn detect(raw: &str) -> Result<Option<OutputSchema>, ParseError> {
    let Some(first) = raw.lines().map(str::trim).find(|line| !line.is_empty()) else {
        return Ok(None);
    };

    if first.starts_with('[') || first.starts_with('{') {
        return Ok(Some(OutputSchema::Json));
    }

    if tabular::looks_like_row(first) {
        return Ok(Some(OutputSchema::FixedColumns));
    }

    let (version, _) = tabular::header_columns(first)?;
    Ok(Some(OutputSchema::Tabular(version)))
}

/// Parse tool output into records.
///
/// When `expected` is set, output in any other schema is rejected.
pub fn parse(raw: &str, expected: Option<OutputSchema>) -> Result<Records<'_>, ParseError> {
    let Some(schema) = detect(raw)? else {
        return Ok(Records {
            schema: None,
            rows: Rows::Empty,
        });
    };

    if let Some(expected) = expected {
        if expected != schema {
            return Err(ParseError::UnexpectedFormat(format!(
                "expected {} output, detected {}",
                expected, schema
            )));
        }
    }

    let rows = match schema {
        OutputSchema::Json => {
            if raw.trim_start().starts_with('[') {
                Rows::JsonArray(json::parse_array(raw)?.into_iter())
            } else {
                Rows::JsonStream(json::JsonRows::new(raw))
            }
        }
        OutputSchema::Tabular(_) => Rows::Table(tabular::TableRows::with_header(raw)?),
        OutputSchema::FixedColumns => Rows::Table(tabular::TableRows::fixed(raw)),
    };

    Ok(Records {
        schema: Some(schema),
        rows,
    })
}

/// Parse and collect the stdout of a finished invocation.
pub fn parse_command_output(
    result: &CommandResult,
    expected: Option<OutputSchema>,
) -> Result<Vec<Record>, ParseError> {
    if result.truncated {
        return Err(ParseError::TruncatedOutput(format!(
            "output exceeded the capture limit after {} bytes",
            result.stdout.len()
        )));
    }
    let raw = std::str::from_utf8(&result.stdout)
        .map_err(|e| ParseError::UnexpectedFormat(format!("output is not UTF-8: {}", e)))?;
    parse(raw, expected)?.collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::InstanceState;

    const LKVM_LIST: &str = "  PID NAME                 STATE\n\
                             ------------------------------------\n\
                             \x20 4242 vm1                  running\n\
                             \x20    - vm2                  shut off\n";

    #[test]
    fn test_native_lkvm_listing() {
        let records: Vec<Record> = parse(LKVM_LIST, None).unwrap().collect::<Result<_, _>>().unwrap();
        assert_eq!(records.len(), 2);

        assert_eq!(records[0].name, "vm1");
        assert_eq!(records[0].pid, Some(4242));
        assert_eq!(records[0].state, InstanceState::Running);

        assert_eq!(records[1].name, "vm2");
        assert_eq!(records[1].pid, None);
        assert_eq!(records[1].state, InstanceState::Stopped);
    }

    #[test]
    fn test_reordered_columns_and_whitespace() {
        let raw = "STATE   NAME  PID   CPUS MEM\n\
                   paused  vm3   77    2    1024\n";
        let records = parse(raw, None).unwrap();
        assert_eq!(records.schema(), Some(OutputSchema::Tabular(TableVersion::V2)));

        let records: Vec<Record> = records.collect::<Result<_, _>>().unwrap();
        assert_eq!(records[0].name, "vm3");
        assert_eq!(records[0].state, InstanceState::Paused);
        assert_eq!(records[0].pid, Some(77));
        assert_eq!(records[0].memory_mib, Some(1024));
        assert_eq!(records[0].vcpus, Some(2));
    }

    #[test]
    fn test_multiword_state_in_middle_column() {
        let raw = "PID NAME STATE MEM CPUS\n- vm2 shut off 512 1\n";
        let records: Vec<Record> = parse(raw, None).unwrap().collect::<Result<_, _>>().unwrap();
        assert_eq!(records[0].state, InstanceState::Stopped);
        assert_eq!(records[0].memory_mib, Some(512));
        assert_eq!(records[0].vcpus, Some(1));
    }

    #[test]
    fn test_unknown_header_is_rejected() {
        let raw = "ID DOMAIN STATUS\n1 vm1 up\n";
        assert!(matches!(parse(raw, None), Err(ParseError::UnexpectedFormat(_))));

        // Known words, but no version has this column set
        let raw = "NAME STATE\nvm1 running\n";
        assert!(matches!(parse(raw, None), Err(ParseError::UnexpectedFormat(_))));
    }

    #[test]
    fn test_headerless_fallback() {
        let raw = "4242 vm1 running\n - vm2 shut off\n";
        let records = parse(raw, None).unwrap();
        assert_eq!(records.schema(), Some(OutputSchema::FixedColumns));

        let records: Vec<Record> = records.collect::<Result<_, _>>().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].state, InstanceState::Stopped);
    }

    #[test]
    fn test_short_row_is_truncation() {
        let raw = "PID NAME STATE\n4242 vm1 running\n4243 vm2\n";
        let results: Vec<_> = parse(raw, None).unwrap().collect();
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(ParseError::TruncatedOutput(_))));
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn test_bad_pid_is_unexpected_format() {
        let raw = "PID NAME STATE\nabc vm1 running\n";
        let results: Vec<_> = parse(raw, None).unwrap().collect();
        assert!(matches!(results[0], Err(ParseError::UnexpectedFormat(_))));
    }

    #[test]
    fn test_empty_and_header_only_output() {
        assert_eq!(parse("", None).unwrap().count(), 0);
        assert_eq!(parse("\n  \n", None).unwrap().count(), 0);
        assert_eq!(parse("  PID NAME STATE\n-----\n", None).unwrap().count(), 0);
    }

    #[test]
    fn test_json_array_and_stream() {
        let array = r#"[{"name":"vm1","state":"running","pid":10,"mem":512,"cpus":1}]"#;
        let records: Vec<Record> = parse(array, None).unwrap().collect::<Result<_, _>>().unwrap();
        assert_eq!(records[0].memory_mib, Some(512));
        assert_eq!(records[0].vcpus, Some(1));

        let stream = "{\"name\":\"vm1\",\"state\":\"running\"}\n{\"name\":\"vm2\",\"state\":\"paused\"}\n";
        let records: Vec<Record> = parse(stream, None).unwrap().collect::<Result<_, _>>().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].state, InstanceState::Paused);
    }

    #[test]
    fn test_json_cut_off_is_truncation() {
        let array = r#"[{"name":"vm1","state":"runn"#;
        assert!(matches!(parse(array, None), Err(ParseError::TruncatedOutput(_))));

        let stream = "{\"name\":\"vm1\",\"state\":\"running\"}\n{\"name\":\"vm2\",";
        let results: Vec<_> = parse(stream, None).unwrap().collect();
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(ParseError::TruncatedOutput(_))));
    }

    #[test]
    fn test_pinned_schema_mismatch() {
        let result = parse(LKVM_LIST, Some(OutputSchema::Json));
        assert!(matches!(result, Err(ParseError::UnexpectedFormat(_))));
        assert!(parse(LKVM_LIST, Some(OutputSchema::Tabular(TableVersion::V1))).is_ok());
    }

    #[test]
    fn test_truncated_capture_rejected() {
        let result = CommandResult {
            stdout: LKVM_LIST.as_bytes().to_vec(),
            truncated: true,
            ..Default::default()
        };
        assert!(matches!(
            parse_command_output(&result, None),
            Err(ParseError::TruncatedOutput(_))
        ));
    }
}
