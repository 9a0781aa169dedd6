//! Line-oriented wire protocol for ringkv
//!
//! One message per line, space-separated tokens, `\r\n` terminated.
//! Requests flow client->node, node->node (hashed-key writes during
//! replication and hand-off) and coordinator->node (control messages);
//! nodes speak to the coordinator with `register`/`deregister`.

use crate::common::ring::NodeAddr;
use crate::common::{Error, Result};
use std::fmt;

/// Escape a value for the wire (values may contain newlines, the framing
/// may not).
pub fn escape_value(value: &str) -> String {
    value.replace('\n', "\\n")
}

/// Undo [`escape_value`].
pub fn unescape_value(value: &str) -> String {
    value.replace("\\n", "\n")
}

/// A request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Put { key: String, value: String },
    /// Peer write carrying an already-hashed key; the receiver must not
    /// rehash it.
    PutHash { key: u128, value: String },
    Get { key: String },
    Delete { key: String },
    DeleteHash { key: u128 },
    Keyrange,
    KeyrangeRead,
    /// Coordinator push of a full ring snapshot (serialized range list).
    Metadata { ranges: String },
    /// Lock writes and hand matching keys to `target`. `shutdown` marks the
    /// final transfer of a deregistering node; `target` is `None` when there
    /// is nothing to transfer (sole node leaving).
    SetWriteLock {
        target: Option<NodeAddr>,
        shutdown: bool,
    },
    StartServer,
    Register { addr: NodeAddr },
    Deregister { addr: NodeAddr },
    Ping,
}

impl Request {
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        let mut tokens = line.split(' ');
        let verb = tokens.next().unwrap_or("");
        let rest: Vec<&str> = tokens.collect();

        let arg = |i: usize| -> Result<&str> {
            rest.get(i)
                .copied()
                .ok_or_else(|| Error::Protocol(format!("{}: missing argument {}", verb, i + 1)))
        };

        match verb {
            "put" => Ok(Request::Put {
                key: arg(0)?.to_string(),
                value: unescape_value(&rest[1..].join(" ")),
            }),
            "put_hash" => Ok(Request::PutHash {
                key: parse_hash(arg(0)?)?,
                value: unescape_value(&rest[1..].join(" ")),
            }),
            "get" => Ok(Request::Get {
                key: arg(0)?.to_string(),
            }),
            "delete" => Ok(Request::Delete {
                key: arg(0)?.to_string(),
            }),
            "delete_hash" => Ok(Request::DeleteHash {
                key: parse_hash(arg(0)?)?,
            }),
            "keyrange" => Ok(Request::Keyrange),
            "keyrange_read" => Ok(Request::KeyrangeRead),
            "metadata" => Ok(Request::Metadata {
                ranges: arg(0)?.to_string(),
            }),
            "set_write_lock" => {
                let host = arg(0)?;
                let port: u16 = arg(1)?
                    .parse()
                    .map_err(|_| Error::Protocol("set_write_lock: invalid port".into()))?;
                let target = if port == 0 {
                    None
                } else {
                    Some(NodeAddr::new(host, port))
                };
                Ok(Request::SetWriteLock {
                    target,
                    shutdown: rest.get(2).is_some_and(|flag| *flag == "1"),
                })
            }
            "start_server" => Ok(Request::StartServer),
            "register" => Ok(Request::Register {
                addr: parse_addr(arg(0)?, arg(1)?)?,
            }),
            "deregister" => Ok(Request::Deregister {
                addr: parse_addr(arg(0)?, arg(1)?)?,
            }),
            "ping" => Ok(Request::Ping),
            other => Err(Error::Protocol(format!("unknown command: {}", other))),
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Request::Put { key, value } => write!(f, "put {} {}", key, escape_value(value)),
            Request::PutHash { key, value } => {
                write!(f, "put_hash {:032x} {}", key, escape_value(value))
            }
            Request::Get { key } => write!(f, "get {}", key),
            Request::Delete { key } => write!(f, "delete {}", key),
            Request::DeleteHash { key } => write!(f, "delete_hash {:032x}", key),
            Request::Keyrange => write!(f, "keyrange"),
            Request::KeyrangeRead => write!(f, "keyrange_read"),
            Request::Metadata { ranges } => write!(f, "metadata {}", ranges),
            Request::SetWriteLock { target, shutdown } => {
                match target {
                    Some(addr) => write!(f, "set_write_lock {} {}", addr.host, addr.port)?,
                    None => write!(f, "set_write_lock - 0")?,
                }
                write!(f, " {}", u8::from(*shutdown))
            }
            Request::StartServer => write!(f, "start_server"),
            Request::Register { addr } => write!(f, "register {} {}", addr.host, addr.port),
            Request::Deregister { addr } => write!(f, "deregister {} {}", addr.host, addr.port),
            Request::Ping => write!(f, "ping"),
        }
    }
}

/// A response line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    PutSuccess(String),
    PutUpdate(String),
    PutError(String),
    GetSuccess { key: String, value: String },
    GetError(String),
    DeleteSuccess(String),
    DeleteError(String),
    KeyrangeSuccess(String),
    KeyrangeReadSuccess(String),
    ServerNotResponsible,
    ServerWriteLock,
    ServerStopped,
    /// Reply to `deregister`: the departing node's hand-off target, with
    /// the flag echoed as `0` (the deregister context itself marks the
    /// transfer as final).
    SetWriteLock {
        target: Option<NodeAddr>,
        shutdown: bool,
    },
    Ack,
    Error(String),
}

impl Response {
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        let (verb, rest) = line.split_once(' ').unwrap_or((line, ""));

        match verb {
            "put_success" => Ok(Response::PutSuccess(rest.to_string())),
            "put_update" => Ok(Response::PutUpdate(rest.to_string())),
            "put_error" => Ok(Response::PutError(rest.to_string())),
            "get_success" => {
                let (key, value) = rest
                    .split_once(' ')
                    .ok_or_else(|| Error::Protocol("get_success: missing value".into()))?;
                Ok(Response::GetSuccess {
                    key: key.to_string(),
                    value: unescape_value(value),
                })
            }
            "get_error" => Ok(Response::GetError(rest.to_string())),
            "delete_success" => Ok(Response::DeleteSuccess(rest.to_string())),
            "delete_error" => Ok(Response::DeleteError(rest.to_string())),
            "keyrange_success" => Ok(Response::KeyrangeSuccess(rest.to_string())),
            "keyrange_read_success" => Ok(Response::KeyrangeReadSuccess(rest.to_string())),
            "server_not_responsible" => Ok(Response::ServerNotResponsible),
            "server_write_lock" => Ok(Response::ServerWriteLock),
            "server_stopped" => Ok(Response::ServerStopped),
            "set_write_lock" => {
                let req = Request::parse(line)?;
                match req {
                    Request::SetWriteLock { target, shutdown } => {
                        Ok(Response::SetWriteLock { target, shutdown })
                    }
                    _ => unreachable!(),
                }
            }
            "ack" => Ok(Response::Ack),
            "error" => Ok(Response::Error(rest.to_string())),
            other => Err(Error::Protocol(format!("unknown response: {}", other))),
        }
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Response::PutSuccess(key) => write!(f, "put_success {}", key),
            Response::PutUpdate(key) => write!(f, "put_update {}", key),
            Response::PutError(args) => write!(f, "put_error {}", args),
            Response::GetSuccess { key, value } => {
                write!(f, "get_success {} {}", key, escape_value(value))
            }
            Response::GetError(key) => write!(f, "get_error {}", key),
            Response::DeleteSuccess(key) => write!(f, "delete_success {}", key),
            Response::DeleteError(key) => write!(f, "delete_error {}", key),
            Response::KeyrangeSuccess(ranges) => write!(f, "keyrange_success {}", ranges),
            Response::KeyrangeReadSuccess(ranges) => {
                write!(f, "keyrange_read_success {}", ranges)
            }
            Response::ServerNotResponsible => write!(f, "server_not_responsible"),
            Response::ServerWriteLock => write!(f, "server_write_lock"),
            Response::ServerStopped => write!(f, "server_stopped"),
            Response::SetWriteLock { target, shutdown } => {
                let req = Request::SetWriteLock {
                    target: target.clone(),
                    shutdown: *shutdown,
                };
                write!(f, "{}", req)
            }
            Response::Ack => write!(f, "ack"),
            Response::Error(reason) => write!(f, "error {}", reason),
        }
    }
}

fn parse_hash(s: &str) -> Result<u128> {
    u128::from_str_radix(s, 16).map_err(|_| Error::Protocol(format!("invalid key hash: {}", s)))
}

fn parse_addr(host: &str, port: &str) -> Result<NodeAddr> {
    let port = port
        .parse()
        .map_err(|_| Error::Protocol(format!("invalid port: {}", port)))?;
    Ok(NodeAddr::new(host, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_round_trip() {
        let cases = vec![
            Request::Put {
                key: "k".into(),
                value: "a value with spaces".into(),
            },
            Request::Put {
                key: "k".into(),
                value: "first line\nsecond line".into(),
            },
            Request::PutHash {
                key: 0xdeadbeef,
                value: "v".into(),
            },
            Request::Get { key: "k".into() },
            Request::Delete { key: "k".into() },
            Request::DeleteHash { key: u128::MAX },
            Request::Keyrange,
            Request::KeyrangeRead,
            Request::SetWriteLock {
                target: Some(NodeAddr::new("10.0.0.1", 7001)),
                shutdown: false,
            },
            Request::SetWriteLock {
                target: None,
                shutdown: true,
            },
            Request::StartServer,
            Request::Register {
                addr: NodeAddr::new("127.0.0.1", 9000),
            },
            Request::Ping,
        ];
        for req in cases {
            let line = req.to_string();
            assert_eq!(Request::parse(&line).unwrap(), req, "line: {}", line);
        }
    }

    #[test]
    fn test_hashed_key_width() {
        let line = Request::PutHash { key: 1, value: "v".into() }.to_string();
        assert!(line.starts_with("put_hash 00000000000000000000000000000001 "));
    }

    #[test]
    fn test_response_round_trip() {
        let cases = vec![
            Response::PutSuccess("k".into()),
            Response::PutUpdate("k".into()),
            Response::GetSuccess {
                key: "k".into(),
                value: "multi word value".into(),
            },
            Response::GetSuccess {
                key: "k".into(),
                value: "spans\ntwo lines".into(),
            },
            Response::GetError("k".into()),
            Response::DeleteSuccess("k".into()),
            Response::ServerNotResponsible,
            Response::ServerWriteLock,
            Response::ServerStopped,
            Response::SetWriteLock {
                target: Some(NodeAddr::new("h", 1)),
                shutdown: true,
            },
            Response::Ack,
            Response::Error("unknown command".into()),
        ];
        for resp in cases {
            let line = resp.to_string();
            assert_eq!(Response::parse(&line).unwrap(), resp, "line: {}", line);
        }
    }

    #[test]
    fn test_write_lock_flag_by_value() {
        // the flag is read by value, so an explicit 0 is not a shutdown
        let req = Request::parse("set_write_lock 10.0.0.1 7001 0").unwrap();
        assert_eq!(
            req,
            Request::SetWriteLock {
                target: Some(NodeAddr::new("10.0.0.1", 7001)),
                shutdown: false,
            }
        );
        // and an absent flag means the same thing
        let req = Request::parse("set_write_lock 10.0.0.1 7001").unwrap();
        assert!(matches!(req, Request::SetWriteLock { shutdown: false, .. }));

        let line = Request::SetWriteLock {
            target: Some(NodeAddr::new("10.0.0.1", 7001)),
            shutdown: false,
        }
        .to_string();
        assert_eq!(line, "set_write_lock 10.0.0.1 7001 0");
    }

    #[test]
    fn test_unknown_verb_rejected() {
        assert!(Request::parse("frobnicate now").is_err());
        assert!(Response::parse("sideways").is_err());
    }

    #[test]
    fn test_value_escaping() {
        let escaped = escape_value("line one\nline two");
        assert!(!escaped.contains('\n'));
        assert_eq!(unescape_value(&escaped), "line one\nline two");
    }
}
