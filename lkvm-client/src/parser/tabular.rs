//! Whitespace-separated table parsing.

use std::collections::HashSet;
use std::fmt;
use std::iter::Enumerate;
use std::str::Lines;

use crate::error::ParseError;
use crate::types::{InstanceState, Record};

/// A named table column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Column {
    Pid,
    Name,
    State,
    Mem,
    Cpus,
}

impl Column {
    fn from_header(word: &str) -> Option<Self> {
        match word.to_ascii_uppercase().as_str() {
            "PID" => Some(Column::Pid),
            "NAME" => Some(Column::Name),
            "STATE" => Some(Column::State),
            "MEM" | "MEMORY" => Some(Column::Mem),
            "CPUS" | "VCPUS" => Some(Column::Cpus),
            _ => None,
        }
    }
}

/// Known table layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableVersion {
    /// `PID NAME STATE`, as printed by `lkvm list`
    V1,
    /// V1 plus `MEM` (MiB) and `CPUS`
    V2,
}

impl TableVersion {
    const ALL: [TableVersion; 2] = [TableVersion::V1, TableVersion::V2];

    /// Exact column set of this version.
    pub fn columns(&self) -> &'static [Column] {
        match self {
            TableVersion::V1 => &[Column::Pid, Column::Name, Column::State],
            TableVersion::V2 => &[
                Column::Pid,
                Column::Name,
                Column::State,
                Column::Mem,
                Column::Cpus,
            ],
        }
    }
}

impl fmt::Display for TableVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableVersion::V1 => f.write_str("v1"),
            TableVersion::V2 => f.write_str("v2"),
        }
    }
}

/// Map a header line to a known version and its column order.
pub(crate) fn header_columns(header: &str) -> Result<(TableVersion, Vec<Column>), ParseError> {
    let mut columns = Vec::new();
    for word in header.split_whitespace() {
        let column = Column::from_header(word).ok_or_else(|| {
            ParseError::UnexpectedFormat(format!("unknown column {:?} in header {:?}", word, header))
        })?;
        if columns.contains(&column) {
            return Err(ParseError::UnexpectedFormat(format!(
                "duplicate column {:?} in header {:?}",
                word, header
            )));
        }
        columns.push(column);
    }

    let seen: HashSet<Column> = columns.iter().copied().collect();
    TableVersion::ALL
        .into_iter()
        .find(|version| {
            let wanted: HashSet<Column> = version.columns().iter().copied().collect();
            wanted == seen
        })
        .map(|version| (version, columns))
        .ok_or_else(|| {
            ParseError::UnexpectedFormat(format!("header {:?} matches no known schema", header))
        })
}

/// A data row starts with a pid or the `-` placeholder.
pub(crate) fn looks_like_row(line: &str) -> bool {
    match line.split_whitespace().next() {
        Some("-") => true,
        Some(token) => token.parse::<u32>().is_ok(),
        None => false,
    }
}

fn is_separator(line: &str) -> bool {
    !line.is_empty() && line.chars().all(|c| c == '-' || c == '=' || c == '+' || c == ' ')
}

/// Rows of a table, parsed on demand.
pub(crate) struct TableRows<'a> {
    lines: Enumerate<Lines<'a>>,
    columns: Vec<Column>,
    done: bool,
}

impl<'a> TableRows<'a> {
    /// Consume the header line and parse the rest by its columns.
    pub(crate) fn with_header(raw: &'a str) -> Result<Self, ParseError> {
        let mut lines = raw.lines().enumerate();
        let header = lines
            .by_ref()
            .map(|(_, line)| line.trim())
            .find(|line| !line.is_empty())
            .ok_or_else(|| ParseError::UnexpectedFormat("missing header".to_string()))?;
        let (_, columns) = header_columns(header)?;
        Ok(Self {
            lines,
            columns,
            done: false,
        })
    }

    /// Headerless rows in the documented `<pid> <name> <state...>` layout.
    pub(crate) fn fixed(raw: &'a str) -> Self {
        Self {
            lines: raw.lines().enumerate(),
            columns: TableVersion::V1.columns().to_vec(),
            done: false,
        }
    }

    fn parse_row(&self, line_no: usize, line: &str) -> Result<Record, ParseError> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() < self.columns.len() {
            return Err(ParseError::TruncatedOutput(format!(
                "line {}: expected {} fields, found {}: {:?}",
                line_no,
                self.columns.len(),
                tokens.len(),
                line
            )));
        }

        // Surplus tokens belong to the state ("shut off")
        let extra = tokens.len() - self.columns.len();
        let mut name = None;
        let mut record = Record::new("", InstanceState::Unknown);
        let mut pos = 0;

        for column in &self.columns {
            let width = if *column == Column::State { extra + 1 } else { 1 };
            let value = tokens[pos..pos + width].join(" ");
            pos += width;

            match column {
                Column::Name => name = Some(value),
                Column::State => record.state = InstanceState::from_tool_word(&value),
                Column::Pid => record.pid = parse_optional(&value, line_no, "pid")?,
                Column::Mem => record.memory_mib = parse_optional(strip_mib(&value), line_no, "mem")?,
                Column::Cpus => record.vcpus = parse_optional(&value, line_no, "cpus")?,
            }
        }

        // "-" is the empty-cell placeholder, never a name
        record.name = match name {
            Some(name) if !name.is_empty() && name != "-" => name,
            _ => {
                return Err(ParseError::UnexpectedFormat(format!(
                    "line {}: row has no instance name: {:?}",
                    line_no, line
                )));
            }
        };
        Ok(record)
    }
}

impl<'a> Iterator for TableRows<'a> {
    type Item = Result<Record, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        for (idx, line) in self.lines.by_ref() {
            let line = line.trim();
            if line.is_empty() || is_separator(line) {
                continue;
            }
            let row = self.parse_row(idx + 1, line);
            if row.is_err() {
                self.done = true;
            }
            return Some(row);
        }
        self.done = true;
        None
    }
}

fn strip_mib(value: &str) -> &str {
    let lower = value.to_ascii_lowercase();
    for suffix in ["mib", "mb", "m"] {
        if lower.ends_with(suffix) {
            return &value[..value.len() - suffix.len()];
        }
    }
    value
}

fn parse_optional<T: std::str::FromStr>(
    value: &str,
    line_no: usize,
    field: &str,
) -> Result<Option<T>, ParseError> {
    if value == "-" {
        return Ok(None);
    }
    value.parse::<T>().map(Some).map_err(|_| {
        ParseError::UnexpectedFormat(format!("line {}: invalid {} value {:?}", line_no, field, value))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_versions() {
        let (version, columns) = header_columns("PID NAME STATE").unwrap();
        assert_eq!(version, TableVersion::V1);
        assert_eq!(columns, vec![Column::Pid, Column::Name, Column::State]);

        let (version, _) = header_columns("name pid vcpus memory state").unwrap();
        assert_eq!(version, TableVersion::V2);

        assert!(header_columns("PID NAME NAME STATE").is_err());
        assert!(header_columns("PID NAME STATE MEM").is_err());
    }

    #[test]
    fn test_mem_suffixes() {
        assert_eq!(strip_mib("512"), "512");
        assert_eq!(strip_mib("512MiB"), "512");
        assert_eq!(strip_mib("512M"), "512");
    }

    #[test]
    fn test_row_without_name_rejected() {
        let mut rows = TableRows::with_header("PID NAME STATE\n4242 vm1 running\n4243 - running\n").unwrap();
        assert_eq!(rows.next().unwrap().unwrap().name, "vm1");
        assert!(matches!(rows.next(), Some(Err(ParseError::UnexpectedFormat(_)))));
        assert!(rows.next().is_none());
    }

    #[test]
    fn test_row_detection() {
        assert!(looks_like_row("4242 vm1 running"));
        assert!(looks_like_row("- vm2 shut off"));
        assert!(!looks_like_row("PID NAME STATE"));
    }
}
