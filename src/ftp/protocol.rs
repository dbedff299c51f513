//! Command/reply codec (RFC 959 §4).
//!
//! The control connection accumulates raw bytes in a buffer; this module
//! decides when a syntactically complete reply is present and classifies
//! it. Multi-line replies open with `NNN-` and end with a line that
//! repeats `NNN ` (code, space).

use crate::ftp::error::{FtpError, FtpResult};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Outcome class: first digit of the reply code.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReplyClass {
    /// 1xx: provisional, the real reply follows.
    Provisional,
    /// 2xx: success.
    Success,
    /// 3xx: partial success, protocol continuation required.
    Partial,
    /// 4xx: transient failure, may retry unmodified.
    TransientError,
    /// 5xx: permanent failure, must not retry unmodified.
    PermanentError,
}

/// Subject group: second digit of the reply code.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReplyGroup {
    Syntax,
    Information,
    Connection,
    Authentication,
    Unspecified,
    Filesystem,
    Other,
}

/// A single complete FTP reply (possibly multi-line).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Reply {
    /// Full reply text (all lines joined).
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }

    /// Reply text without the leading "NNN " of the last line, the part
    /// worth showing to a user.
    pub fn detail(&self) -> String {
        let last = self.lines.last().map(String::as_str).unwrap_or("");
        if last.len() > 4 {
            last[4..].to_string()
        } else {
            last.to_string()
        }
    }

    pub fn class(&self) -> ReplyClass {
        match self.code / 100 {
            1 => ReplyClass::Provisional,
            2 => ReplyClass::Success,
            3 => ReplyClass::Partial,
            4 => ReplyClass::TransientError,
            _ => ReplyClass::PermanentError,
        }
    }

    pub fn group(&self) -> ReplyGroup {
        match (self.code / 10) % 10 {
            0 => ReplyGroup::Syntax,
            1 => ReplyGroup::Information,
            2 => ReplyGroup::Connection,
            3 => ReplyGroup::Authentication,
            4 => ReplyGroup::Unspecified,
            5 => ReplyGroup::Filesystem,
            _ => ReplyGroup::Other,
        }
    }

    pub fn is_provisional(&self) -> bool {
        self.class() == ReplyClass::Provisional
    }

    pub fn is_success(&self) -> bool {
        self.class() == ReplyClass::Success
    }

    pub fn is_partial(&self) -> bool {
        self.class() == ReplyClass::Partial
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self.class(),
            ReplyClass::TransientError | ReplyClass::PermanentError
        )
    }

    /// Error carrying this reply's code and text.
    pub fn to_error(&self) -> FtpError {
        FtpError::from_reply(self.code, &self.detail())
    }

    /// Byte-count hint embedded in a provisional reply, e.g.
    /// `150 Opening BINARY mode data connection for x (12345 bytes)`.
    /// Captured for progress display, never trusted over a known size.
    pub fn byte_count_hint(&self) -> Option<u64> {
        lazy_static! {
            static ref HINT_RE: Regex = Regex::new(r"\((\d+)\s*[Bb]ytes?\)").unwrap();
        }
        HINT_RE
            .captures(&self.text())
            .and_then(|c| c[1].parse::<u64>().ok())
    }
}

/// Try to extract one complete reply from the front of `buf`.
///
/// Returns the reply and the number of bytes consumed, or `None` when
/// more bytes are needed. Interim garbage lines inside a multi-line
/// reply are kept verbatim.
pub fn parse_reply(buf: &[u8]) -> FtpResult<Option<(Reply, usize)>> {
    let mut offset = 0usize;
    let mut lines: Vec<String> = Vec::new();
    let mut code: Option<u16> = None;
    let mut terminator: Option<String> = None;

    loop {
        let rest = &buf[offset..];
        let nl = match rest.iter().position(|&b| b == b'\n') {
            Some(p) => p,
            None => return Ok(None), // incomplete line
        };
        let line_end = offset + nl + 1;
        let raw = &buf[offset..offset + nl];
        let line = String::from_utf8_lossy(raw)
            .trim_end_matches(['\r', '\n'])
            .to_string();
        offset = line_end;

        match &terminator {
            None => {
                // First line of the reply.
                let parsed = parse_code(&line)?;
                code = Some(parsed);
                let multi = line.len() >= 4 && line.as_bytes()[3] == b'-';
                lines.push(line);
                if !multi {
                    break;
                }
                terminator = Some(format!("{} ", parsed));
            }
            Some(term) => {
                let done = line.starts_with(term.as_str()) || line == term.trim_end();
                lines.push(line);
                if done {
                    break;
                }
            }
        }
    }

    let code = code.ok_or_else(|| FtpError::protocol_error("Empty reply"))?;
    Ok(Some((Reply { code, lines }, offset)))
}

/// Parse the 3-digit reply code from the start of a line.
fn parse_code(line: &str) -> FtpResult<u16> {
    if line.len() < 3 || !line.as_bytes()[..3].iter().all(u8::is_ascii_digit) {
        return Err(FtpError::protocol_error(format!(
            "Malformed reply line: '{}'",
            line
        )));
    }
    line[..3]
        .parse::<u16>()
        .map_err(|_| FtpError::protocol_error(format!("Invalid reply code in: '{}'", line)))
}

// ─── Passive/active address helpers ──────────────────────────────────

/// Extract the data address from a 227 PASV reply,
/// `Entering Passive Mode (h1,h2,h3,h4,p1,p2)`.
pub fn parse_passive_addr(text: &str) -> Option<SocketAddr> {
    lazy_static! {
        static ref PASV_RE: Regex =
            Regex::new(r"(\d{1,3}),(\d{1,3}),(\d{1,3}),(\d{1,3}),(\d{1,3}),(\d{1,3})").unwrap();
    }
    let c = PASV_RE.captures(text)?;
    let oct = |i: usize| c[i].parse::<u8>().ok();
    let ip = Ipv4Addr::new(oct(1)?, oct(2)?, oct(3)?, oct(4)?);
    let port = u16::from(oct(5)?) << 8 | u16::from(oct(6)?);
    Some(SocketAddr::new(IpAddr::V4(ip), port))
}

/// Extract the data port from a 229 EPSV reply, `(|||port|)`.
pub fn parse_extended_passive_port(text: &str) -> Option<u16> {
    lazy_static! {
        static ref EPSV_RE: Regex = Regex::new(r"\(\|\|\|(\d{1,5})\|\)").unwrap();
    }
    EPSV_RE.captures(text).and_then(|c| c[1].parse::<u16>().ok())
}

/// Format the argument of a PORT command for a local IPv4 address.
pub fn format_port_args(addr: SocketAddr) -> Option<String> {
    match addr.ip() {
        IpAddr::V4(ip) => {
            let o = ip.octets();
            let p = addr.port();
            Some(format!(
                "{},{},{},{},{},{}",
                o[0],
                o[1],
                o[2],
                o[3],
                p >> 8,
                p & 0xff
            ))
        }
        IpAddr::V6(_) => None,
    }
}

/// Format the argument of an EPRT command (RFC 2428), any address family.
pub fn format_extended_port_args(addr: SocketAddr) -> String {
    let family = if addr.is_ipv4() { 1 } else { 2 };
    format!("|{}|{}|{}|", family, addr.ip(), addr.port())
}

// ─── Command formatting ──────────────────────────────────────────────

/// A command ready to go onto the wire, paired with the text that is
/// safe to put into the connection log.
#[derive(Debug, Clone)]
pub struct CommandText {
    pub wire: String,
    pub log: String,
}

impl CommandText {
    /// Plain command whose log form equals its wire form.
    pub fn plain(cmd: impl Into<String>) -> Self {
        let cmd = cmd.into();
        let log = cmd.clone();
        Self {
            wire: terminate(cmd),
            log,
        }
    }

    /// Command with a secret argument; the log shows a placeholder.
    pub fn masked(verb: &str, secret_arg: &str) -> Self {
        Self {
            wire: terminate(format!("{} {}", verb, secret_arg)),
            log: format!("{} (hidden)", verb),
        }
    }
}

fn terminate(mut cmd: String) -> String {
    cmd.push_str("\r\n");
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_line_reply() {
        let (r, used) = parse_reply(b"220 Ready\r\n").unwrap().unwrap();
        assert_eq!(r.code, 220);
        assert_eq!(used, 11);
        assert_eq!(r.class(), ReplyClass::Success);
        assert_eq!(r.group(), ReplyGroup::Connection);
    }

    #[test]
    fn incomplete_reply_waits() {
        assert!(parse_reply(b"220 Read").unwrap().is_none());
        assert!(parse_reply(b"220-hello\r\n220-more\r\n").unwrap().is_none());
    }

    #[test]
    fn multi_line_reply() {
        let raw = b"211-Features:\r\n MDTM\r\n SIZE\r\n211 End\r\n";
        let (r, used) = parse_reply(raw).unwrap().unwrap();
        assert_eq!(r.code, 211);
        assert_eq!(r.lines.len(), 4);
        assert_eq!(used, raw.len());
    }

    #[test]
    fn two_replies_consume_only_first() {
        let raw = b"226 Done\r\n226 Done again\r\n";
        let (r, used) = parse_reply(raw).unwrap().unwrap();
        assert_eq!(r.code, 226);
        assert_eq!(used, 10);
        let (r2, _) = parse_reply(&raw[used..]).unwrap().unwrap();
        assert_eq!(r2.detail(), "Done again");
    }

    #[test]
    fn malformed_line_is_error() {
        assert!(parse_reply(b"oops\r\n").is_err());
    }

    #[test]
    fn classes_and_groups() {
        let r = Reply {
            code: 530,
            lines: vec!["530 Not logged in".into()],
        };
        assert_eq!(r.class(), ReplyClass::PermanentError);
        assert_eq!(r.group(), ReplyGroup::Authentication);
        let r = Reply {
            code: 450,
            lines: vec!["450 busy".into()],
        };
        assert_eq!(r.class(), ReplyClass::TransientError);
        assert_eq!(r.group(), ReplyGroup::Filesystem);
    }

    #[test]
    fn byte_count_hint() {
        let r = Reply {
            code: 150,
            lines: vec!["150 Opening BINARY mode data connection for f (12345 bytes)".into()],
        };
        assert_eq!(r.byte_count_hint(), Some(12345));
        let r = Reply {
            code: 150,
            lines: vec!["150 Opening data connection".into()],
        };
        assert_eq!(r.byte_count_hint(), None);
    }

    #[test]
    fn passive_addr_parsed() {
        let addr =
            parse_passive_addr("Entering Passive Mode (192,168,1,10,19,137)").unwrap();
        assert_eq!(addr.to_string(), "192.168.1.10:5001");
        assert!(parse_passive_addr("Entering Passive Mode").is_none());
    }

    #[test]
    fn extended_passive_port_parsed() {
        assert_eq!(
            parse_extended_passive_port("Entering Extended Passive Mode (|||6446|)"),
            Some(6446)
        );
        assert_eq!(parse_extended_passive_port("no port here"), None);
    }

    #[test]
    fn port_args_formatted() {
        let addr: SocketAddr = "10.0.0.2:5001".parse().unwrap();
        assert_eq!(format_port_args(addr).unwrap(), "10,0,0,2,19,137");
        assert_eq!(format_extended_port_args(addr), "|1|10.0.0.2|5001|");
        let v6: SocketAddr = "[::1]:21".parse().unwrap();
        assert!(format_port_args(v6).is_none());
    }

    #[test]
    fn masked_command_hides_password() {
        let c = CommandText::masked("PASS", "s3cret");
        assert_eq!(c.wire, "PASS s3cret\r\n");
        assert_eq!(c.log, "PASS (hidden)");
    }
}
