//! Lease store parsers
//!
//! Two externally defined formats are supported, selected by configuration:
//! - ISC dhcpd `dhcpd.leases`: `lease <ip> { ... }` stanzas
//! - Kea memfile CSV: header line followed by one lease per row
//!
//! Structural errors abort the parse and return no records. Field level
//! problems in Kea rows are collected and returned next to the rows that
//! could be recovered.

use super::{Lease, LeaseSet};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use thiserror::Error;
use tracing::warn;

const ISC_DATE_FORMAT: &str = "%Y/%m/%d %H:%M:%S";

/// Lease store format used by the local DHCP server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseFormat {
    /// ISC dhcpd block format
    Isc,
    /// Kea memfile CSV format
    Kea,
}

/// Fatal structural error, no records are returned
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LeaseParseError {
    #[error("expecting \"lease <ip> {{\" on line {line}, got: {got}")]
    InvalidOpening { line: usize, got: String },

    #[error("expecting \"{directive} <whatever-number> <date> <time>;\" on line {line}, got: {got}")]
    InvalidTimestamp {
        directive: String,
        line: usize,
        got: String,
    },

    #[error("expecting \"hardware ethernet <mac>;\" on line {line}, got: {got}")]
    InvalidHardware { line: usize, got: String },

    #[error("stray \"{directive}\" outside of a lease entry on line {line}")]
    StrayField { directive: String, line: usize },

    #[error("closing brace without open lease entry on line {line}")]
    UnmatchedBrace { line: usize },

    #[error("lease entry on line {line} opened before entry from line {opened} was closed")]
    NestedLease { line: usize, opened: usize },

    #[error("lease entry opened on line {line} was not closed")]
    Unterminated { line: usize },

    #[error("invalid Kea lease file header: {0}")]
    InvalidHeader(String),
}

/// Skipped row of a lenient parse
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowError {
    pub line: usize,
    pub reason: String,
}

impl fmt::Display for RowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.reason)
    }
}

/// Parse result: recovered leases plus the rows that had to be skipped
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedLeases {
    pub leases: LeaseSet,
    pub skipped: Vec<RowError>,
}

impl ParsedLeases {
    /// All skipped rows joined into one message, `None` when nothing was skipped
    pub fn skipped_summary(&self) -> Option<String> {
        if self.skipped.is_empty() {
            return None;
        }
        Some(
            self.skipped
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}

/// Parse raw lease store content in the given format
pub fn parse(format: LeaseFormat, raw: &str) -> Result<ParsedLeases, LeaseParseError> {
    match format {
        LeaseFormat::Isc => parse_isc(raw),
        LeaseFormat::Kea => parse_kea(raw),
    }
}

/// Lease stanza being accumulated
struct Candidate {
    line: usize,
    ip: String,
    begin: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    mac: Option<String>,
}

impl Candidate {
    fn open(line: usize, raw: &str, tokens: &[&str]) -> Result<Self, LeaseParseError> {
        let invalid = || LeaseParseError::InvalidOpening {
            line,
            got: raw.to_string(),
        };
        if tokens.len() != 3 || tokens[2] != "{" {
            return Err(invalid());
        }
        tokens[1].parse::<IpAddr>().map_err(|_| invalid())?;

        Ok(Self {
            line,
            ip: tokens[1].to_string(),
            begin: None,
            end: None,
            mac: None,
        })
    }

    fn close(self) -> Option<Lease> {
        match (self.begin, self.end, self.mac) {
            (Some(begin), Some(end), Some(mac)) => Some(Lease {
                mac,
                ip: self.ip,
                begin: Some(begin),
                end,
            }),
            (begin, end, mac) => {
                let mut missing = Vec::new();
                if begin.is_none() {
                    missing.push("starts");
                }
                if end.is_none() {
                    missing.push("ends");
                }
                if mac.is_none() {
                    missing.push("hardware ethernet");
                }
                warn!(
                    ip = %self.ip,
                    line = self.line,
                    "skipping incomplete lease entry, missing: {}",
                    missing.join(", ")
                );
                None
            }
        }
    }
}

fn parse_isc(raw: &str) -> Result<ParsedLeases, LeaseParseError> {
    let mut leases = Vec::new();
    let mut open: Option<Candidate> = None;

    for (idx, raw_line) in raw.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let tokens: Vec<&str> = line.split_whitespace().collect();

        match tokens[0] {
            "lease" => {
                if let Some(current) = &open {
                    return Err(LeaseParseError::NestedLease {
                        line: line_no,
                        opened: current.line,
                    });
                }
                open = Some(Candidate::open(line_no, line, &tokens)?);
            }
            directive @ ("starts" | "ends") => {
                let Some(current) = open.as_mut() else {
                    return Err(LeaseParseError::StrayField {
                        directive: directive.to_string(),
                        line: line_no,
                    });
                };
                let ts = parse_timestamp(directive, line_no, line, &tokens)?;
                if directive == "starts" {
                    current.begin = Some(ts);
                } else {
                    current.end = Some(ts);
                }
            }
            "hardware" => {
                let Some(current) = open.as_mut() else {
                    return Err(LeaseParseError::StrayField {
                        directive: "hardware".to_string(),
                        line: line_no,
                    });
                };
                if tokens.get(1) != Some(&"ethernet") {
                    // only ethernet hardware addresses identify a BMC
                    continue;
                }
                if tokens.len() != 3 || !tokens[2].ends_with(';') {
                    return Err(LeaseParseError::InvalidHardware {
                        line: line_no,
                        got: line.to_string(),
                    });
                }
                current.mac = Some(tokens[2].trim_end_matches(';').to_string());
            }
            "}" => {
                let Some(current) = open.take() else {
                    return Err(LeaseParseError::UnmatchedBrace { line: line_no });
                };
                if let Some(lease) = current.close() {
                    leases.push(lease);
                }
            }
            _ => {}
        }
    }

    if let Some(current) = open {
        return Err(LeaseParseError::Unterminated { line: current.line });
    }

    Ok(ParsedLeases {
        leases: LeaseSet::from(leases),
        skipped: Vec::new(),
    })
}

fn parse_timestamp(
    directive: &str,
    line: usize,
    raw: &str,
    tokens: &[&str],
) -> Result<DateTime<Utc>, LeaseParseError> {
    let invalid = || LeaseParseError::InvalidTimestamp {
        directive: directive.to_string(),
        line,
        got: raw.to_string(),
    };
    if tokens.len() != 4 || !tokens[3].ends_with(';') {
        return Err(invalid());
    }
    let text = format!("{} {}", tokens[2], tokens[3].trim_end_matches(';'));
    NaiveDateTime::parse_from_str(&text, ISC_DATE_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|_| invalid())
}

fn parse_kea(raw: &str) -> Result<ParsedLeases, LeaseParseError> {
    let mut rows = raw
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty());

    let Some((_, header)) = rows.next() else {
        return Err(LeaseParseError::InvalidHeader("missing header line".to_string()));
    };
    let columns: Vec<&str> = header.split(',').map(str::trim).collect();
    if columns.len() < 5 || columns[0] != "address" || columns[1] != "hwaddr" {
        return Err(LeaseParseError::InvalidHeader(header.trim().to_string()));
    }

    let mut leases = Vec::new();
    let mut skipped = Vec::new();
    for (idx, row) in rows {
        match parse_kea_row(row) {
            Ok(lease) => leases.push(lease),
            Err(reason) => skipped.push(RowError {
                line: idx + 1,
                reason,
            }),
        }
    }

    Ok(ParsedLeases {
        leases: LeaseSet::from(leases),
        skipped,
    })
}

fn parse_kea_row(row: &str) -> Result<Lease, String> {
    let fields: Vec<&str> = row.split(',').map(str::trim).collect();
    if fields.len() < 5 {
        return Err(format!(
            "incomplete record, expected at least 5 fields, got {}",
            fields.len()
        ));
    }

    let expire: i64 = fields[4]
        .parse()
        .map_err(|e| format!("invalid expire timestamp '{}': {}", fields[4], e))?;
    let end = Utc
        .timestamp_opt(expire, 0)
        .single()
        .ok_or_else(|| format!("expire timestamp '{}' out of range", expire))?;

    let ip = fields[0];
    if ip.is_empty() {
        return Err("empty ip address".to_string());
    }
    let mac = fields[1];
    if mac.is_empty() {
        return Err("empty mac address".to_string());
    }

    let begin = fields[3]
        .parse::<i64>()
        .ok()
        .and_then(|lifetime| expire.checked_sub(lifetime))
        .and_then(|start| Utc.timestamp_opt(start, 0).single());

    Ok(Lease {
        mac: mac.to_string(),
        ip: ip.to_string(),
        begin,
        end,
    })
}
