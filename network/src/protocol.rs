use std::fmt;
use std::str::{FromStr, SplitWhitespace};

use crate::{NetworkError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub filename: String,
    pub size: u64,
}

impl FileEntry {
    pub fn new(filename: impl Into<String>, size: u64) -> Self {
        Self {
            filename: filename.into(),
            size,
        }
    }
}

/// One file a node must push to other nodes during a rebalance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebalanceSend {
    pub filename: String,
    pub size: u64,
    pub destinations: Vec<u16>,
}

/// Every line exchanged between clients, storage nodes and the controller.
///
/// Lines are newline-delimited and space-separated; filenames therefore never
/// contain whitespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    JoinDstore { port: u16 },
    JoinAck,
    ErrorDstorePortInUse,
    Store { filename: String, size: u64 },
    StoreTo { ports: Vec<u16> },
    StoreAck { filename: String },
    StoreComplete,
    Load { filename: String },
    Reload { filename: String },
    LoadFrom { port: u16, size: u64 },
    LoadData { filename: String },
    ErrorLoad,
    Remove { filename: String },
    RemoveAck { filename: String },
    RemoveComplete,
    /// A bare `LIST` request.
    List,
    /// A `LIST` reply; an empty one still carries its separator (`"LIST "`).
    Listing { entries: Vec<FileEntry> },
    Rebalance {
        sends: Vec<RebalanceSend>,
        removals: Vec<String>,
    },
    RebalanceStore { filename: String, size: u64 },
    RebalanceComplete { entries: Vec<FileEntry> },
    ErrorNotEnoughDstores,
    ErrorFileAlreadyExists,
    /// Sent bare to clients; storage nodes name the file they could not remove.
    ErrorFileDoesNotExist { filename: Option<String> },
}

impl Message {
    pub fn parse(line: &str) -> Result<Self> {
        let mut tokens = Tokens::new(line);
        let command = tokens.word("command")?;

        let message = match command {
            "JOIN_DSTORE" => Message::JoinDstore {
                port: tokens.number("port")?,
            },
            "JOIN_ACK" => Message::JoinAck,
            "ERROR_DSTORE_PORT_IN_USE" => Message::ErrorDstorePortInUse,
            "STORE" => Message::Store {
                filename: tokens.filename()?,
                size: tokens.number("size")?,
            },
            "STORE_TO" => {
                let ports = tokens.remaining_numbers("port")?;
                if ports.is_empty() {
                    return Err(tokens.invalid("STORE_TO without ports"));
                }
                Message::StoreTo { ports }
            }
            "STORE_ACK" => Message::StoreAck {
                filename: tokens.filename()?,
            },
            "STORE_COMPLETE" => Message::StoreComplete,
            "LOAD" => Message::Load {
                filename: tokens.filename()?,
            },
            "RELOAD" => Message::Reload {
                filename: tokens.filename()?,
            },
            "LOAD_FROM" => Message::LoadFrom {
                port: tokens.number("port")?,
                size: tokens.number("size")?,
            },
            "LOAD_DATA" => Message::LoadData {
                filename: tokens.filename()?,
            },
            "ERROR_LOAD" => Message::ErrorLoad,
            "REMOVE" => Message::Remove {
                filename: tokens.filename()?,
            },
            "REMOVE_ACK" => Message::RemoveAck {
                filename: tokens.filename()?,
            },
            "REMOVE_COMPLETE" => Message::RemoveComplete,
            "LIST" if line.trim_end_matches(['\r', '\n']) == "LIST" => Message::List,
            "LIST" => Message::Listing {
                entries: tokens.entries()?,
            },
            "REBALANCE" => tokens.rebalance()?,
            "REBALANCE_STORE" => Message::RebalanceStore {
                filename: tokens.filename()?,
                size: tokens.number("size")?,
            },
            "REBALANCE_COMPLETE" => Message::RebalanceComplete {
                entries: tokens.entries()?,
            },
            "ERROR_NOT_ENOUGH_DSTORES" => Message::ErrorNotEnoughDstores,
            "ERROR_FILE_ALREADY_EXISTS" => Message::ErrorFileAlreadyExists,
            "ERROR_FILE_DOES_NOT_EXIST" => Message::ErrorFileDoesNotExist {
                filename: tokens.optional_word().map(str::to_string),
            },
            other => return Err(tokens.invalid(&format!("unknown command {}", other))),
        };

        tokens.finish()?;
        Ok(message)
    }

    pub fn command(&self) -> &'static str {
        match self {
            Message::JoinDstore { .. } => "JOIN_DSTORE",
            Message::JoinAck => "JOIN_ACK",
            Message::ErrorDstorePortInUse => "ERROR_DSTORE_PORT_IN_USE",
            Message::Store { .. } => "STORE",
            Message::StoreTo { .. } => "STORE_TO",
            Message::StoreAck { .. } => "STORE_ACK",
            Message::StoreComplete => "STORE_COMPLETE",
            Message::Load { .. } => "LOAD",
            Message::Reload { .. } => "RELOAD",
            Message::LoadFrom { .. } => "LOAD_FROM",
            Message::LoadData { .. } => "LOAD_DATA",
            Message::ErrorLoad => "ERROR_LOAD",
            Message::Remove { .. } => "REMOVE",
            Message::RemoveAck { .. } => "REMOVE_ACK",
            Message::RemoveComplete => "REMOVE_COMPLETE",
            Message::List | Message::Listing { .. } => "LIST",
            Message::Rebalance { .. } => "REBALANCE",
            Message::RebalanceStore { .. } => "REBALANCE_STORE",
            Message::RebalanceComplete { .. } => "REBALANCE_COMPLETE",
            Message::ErrorNotEnoughDstores => "ERROR_NOT_ENOUGH_DSTORES",
            Message::ErrorFileAlreadyExists => "ERROR_FILE_ALREADY_EXISTS",
            Message::ErrorFileDoesNotExist { .. } => "ERROR_FILE_DOES_NOT_EXIST",
        }
    }
}

impl FromStr for Message {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self> {
        Message::parse(s)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.command())?;

        match self {
            Message::JoinDstore { port } => write!(f, " {}", port),
            Message::Store { filename, size }
            | Message::RebalanceStore { filename, size } => write!(f, " {} {}", filename, size),
            Message::StoreTo { ports } => {
                for port in ports {
                    write!(f, " {}", port)?;
                }
                Ok(())
            }
            Message::StoreAck { filename }
            | Message::Load { filename }
            | Message::Reload { filename }
            | Message::LoadData { filename }
            | Message::Remove { filename }
            | Message::RemoveAck { filename } => write!(f, " {}", filename),
            Message::LoadFrom { port, size } => write!(f, " {} {}", port, size),
            Message::Listing { entries } if entries.is_empty() => f.write_str(" "),
            Message::Listing { entries } => write_entries(f, entries),
            Message::RebalanceComplete { entries } => write_entries(f, entries),
            Message::Rebalance { sends, removals } => {
                write!(f, " {}", sends.len())?;
                for send in sends {
                    write!(
                        f,
                        " {} {} {}",
                        send.filename,
                        send.size,
                        send.destinations.len()
                    )?;
                    for port in &send.destinations {
                        write!(f, " {}", port)?;
                    }
                }
                write!(f, " {}", removals.len())?;
                for filename in removals {
                    write!(f, " {}", filename)?;
                }
                Ok(())
            }
            Message::ErrorFileDoesNotExist {
                filename: Some(filename),
            } => write!(f, " {}", filename),
            _ => Ok(()),
        }
    }
}

fn write_entries(f: &mut fmt::Formatter<'_>, entries: &[FileEntry]) -> fmt::Result {
    for entry in entries {
        write!(f, " {} {}", entry.filename, entry.size)?;
    }
    Ok(())
}

struct Tokens<'a> {
    line: &'a str,
    inner: SplitWhitespace<'a>,
}

impl<'a> Tokens<'a> {
    fn new(line: &'a str) -> Self {
        Self {
            line,
            inner: line.split_whitespace(),
        }
    }

    fn invalid(&self, reason: &str) -> NetworkError {
        NetworkError::InvalidMessage(format!("{} in {:?}", reason, self.line))
    }

    fn word(&mut self, field: &str) -> Result<&'a str> {
        match self.inner.next() {
            Some(token) => Ok(token),
            None => Err(self.invalid(&format!("missing {}", field))),
        }
    }

    fn optional_word(&mut self) -> Option<&'a str> {
        self.inner.next()
    }

    fn filename(&mut self) -> Result<String> {
        self.word("filename").map(str::to_string)
    }

    fn number<T: FromStr>(&mut self, field: &str) -> Result<T> {
        let token = self.word(field)?;
        token
            .parse::<T>()
            .map_err(|_| self.invalid(&format!("invalid {} {:?}", field, token)))
    }

    fn remaining_numbers<T: FromStr>(&mut self, field: &str) -> Result<Vec<T>> {
        let mut values = Vec::new();
        while let Some(token) = self.inner.next() {
            let value = token
                .parse::<T>()
                .map_err(|_| self.invalid(&format!("invalid {} {:?}", field, token)))?;
            values.push(value);
        }
        Ok(values)
    }

    fn entries(&mut self) -> Result<Vec<FileEntry>> {
        let mut entries = Vec::new();
        while let Some(filename) = self.inner.next() {
            let size = self.number("size")?;
            entries.push(FileEntry::new(filename, size));
        }
        Ok(entries)
    }

    fn rebalance(&mut self) -> Result<Message> {
        let send_count: usize = self.number("send count")?;
        let mut sends = Vec::with_capacity(send_count);
        for _ in 0..send_count {
            let filename = self.filename()?;
            let size = self.number("size")?;
            let destination_count: usize = self.number("destination count")?;
            if destination_count == 0 {
                return Err(self.invalid("send without destinations"));
            }
            let mut destinations = Vec::with_capacity(destination_count);
            for _ in 0..destination_count {
                destinations.push(self.number("port")?);
            }
            sends.push(RebalanceSend {
                filename,
                size,
                destinations,
            });
        }

        let removal_count: usize = self.number("remove count")?;
        let mut removals = Vec::with_capacity(removal_count);
        for _ in 0..removal_count {
            removals.push(self.filename()?);
        }

        Ok(Message::Rebalance { sends, removals })
    }

    fn finish(&mut self) -> Result<()> {
        match self.inner.next() {
            None => Ok(()),
            Some(extra) => Err(self.invalid(&format!("unexpected token {:?}", extra))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_client_requests() {
        assert_eq!(
            Message::parse("STORE x.txt 100").unwrap(),
            Message::Store {
                filename: "x.txt".to_string(),
                size: 100
            }
        );
        assert_eq!(
            Message::parse("RELOAD x.txt").unwrap(),
            Message::Reload {
                filename: "x.txt".to_string()
            }
        );
        assert_eq!(Message::parse("LIST").unwrap(), Message::List);
        assert_eq!(Message::List.to_string(), "LIST");
    }

    #[test]
    fn listing_keeps_trailing_separator() {
        let empty = Message::Listing { entries: vec![] };
        assert_eq!(empty.to_string(), "LIST ");
        assert_eq!(Message::parse("LIST ").unwrap(), empty);

        let one = Message::Listing {
            entries: vec![FileEntry::new("x.txt", 100)],
        };
        assert_eq!(one.to_string(), "LIST x.txt 100");
    }

    #[test]
    fn node_listing_reply_is_parsed_as_pairs() {
        let message = Message::parse("LIST a.txt 10 b.txt 20").unwrap();
        assert_eq!(
            message,
            Message::Listing {
                entries: vec![FileEntry::new("a.txt", 10), FileEntry::new("b.txt", 20)]
            }
        );

        assert!(Message::parse("LIST a.txt").is_err());
        assert!(Message::parse("LIST a.txt ten").is_err());
    }

    #[test]
    fn rebalance_command_layout() {
        let message = Message::Rebalance {
            sends: vec![
                RebalanceSend {
                    filename: "a.txt".to_string(),
                    size: 10,
                    destinations: vec![4001, 4002],
                },
                RebalanceSend {
                    filename: "b.txt".to_string(),
                    size: 7,
                    destinations: vec![4003],
                },
            ],
            removals: vec!["c.txt".to_string()],
        };

        let line = message.to_string();
        assert_eq!(
            line,
            "REBALANCE 2 a.txt 10 2 4001 4002 b.txt 7 1 4003 1 c.txt"
        );
        assert_eq!(Message::parse(&line).unwrap(), message);

        let empty = Message::Rebalance {
            sends: vec![],
            removals: vec![],
        };
        assert_eq!(empty.to_string(), "REBALANCE 0 0");
    }

    #[test]
    fn rebalance_rejects_truncated_lines() {
        assert!(Message::parse("REBALANCE 1 a.txt 10 2 4001 0").is_err());
        assert!(Message::parse("REBALANCE 0 2 a.txt").is_err());
        assert!(Message::parse("REBALANCE 1 a.txt 10 0 0").is_err());
    }

    #[test]
    fn store_to_requires_ports() {
        assert!(Message::parse("STORE_TO").is_err());
        assert_eq!(
            Message::parse("STORE_TO 4001 4002").unwrap(),
            Message::StoreTo {
                ports: vec![4001, 4002]
            }
        );
    }

    #[test]
    fn file_missing_error_carries_optional_name() {
        assert_eq!(
            Message::parse("ERROR_FILE_DOES_NOT_EXIST").unwrap(),
            Message::ErrorFileDoesNotExist { filename: None }
        );
        let from_node = Message::parse("ERROR_FILE_DOES_NOT_EXIST x.txt").unwrap();
        assert_eq!(from_node.to_string(), "ERROR_FILE_DOES_NOT_EXIST x.txt");
    }

    #[test]
    fn rejects_unknown_and_malformed_lines() {
        assert!(Message::parse("").is_err());
        assert!(Message::parse("FROBNICATE").is_err());
        assert!(Message::parse("STORE x.txt").is_err());
        assert!(Message::parse("STORE x.txt -5").is_err());
        assert!(Message::parse("JOIN_DSTORE 70000").is_err());
        assert!(Message::parse("LOAD x.txt extra").is_err());
    }
}
