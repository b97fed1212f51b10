// (c) 2025 Ross Younger

//! The session command grammar.
//!
//! Peers negotiate transfers by exchanging NUL-terminated ASCII command
//! strings over the link:
//!
//! ```text
//! S from to user -options temp 0mode notify [size]   send request
//! SY / SN2 / SN4 / SN6 / SN                          ... reply
//! R from to user -options [size]                     receive request
//! RY 0mode / RN2 / RN6 / RN                          ... reply
//! X from to user -options                            execution request
//! XY / XN                                            ... reply
//! CY / CN5                                           file-arrival confirmation
//! H / HY / HN                                        hangup negotiation
//! ```
//!
//! Options ride with a leading dash even when empty; modes are octal with
//! a leading `0`; a size-bearing `S` command serializes an empty notify
//! field as `""`. [`Command`]'s `Display` impl produces the wire form and
//! its `FromStr` impl parses it.

use std::fmt::Display;
use std::str::FromStr;

use crate::files::TransferFailure;

/// The request fields shared by `S`, `R` and `X` commands.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferRequest {
    /// Source file name.
    pub from: String,
    /// Destination file name.
    pub to: String,
    /// Requesting user.
    pub user: String,
    /// Option letters (serialized with a leading dash, even when empty).
    pub options: String,
    /// Sender's temporary file name. Carried for compatibility; the
    /// receiver ignores it.
    pub temp: String,
    /// File permission bits.
    pub mode: u32,
    /// Who to notify on completion, if anyone.
    pub notify: String,
    /// File size in bytes for size-bearing requests: the actual size on a
    /// send, the largest acceptable size on a receive.
    pub size: Option<u64>,
}

/// One parsed session command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `S ...` — the peer (or we) would like to send a file.
    Send(TransferRequest),
    /// `R ...` — a request to receive a file.
    Receive(TransferRequest),
    /// `X ...` — a request to execute a transfer remotely.
    Execute(TransferRequest),
    /// `SY` — send request accepted.
    SendAccepted,
    /// `SN*` — send request refused.
    SendRefused(TransferFailure),
    /// `RY 0mode` — receive request accepted; the file will arrive with
    /// these permissions.
    ReceiveAccepted {
        /// Permission bits for the incoming file.
        mode: u32,
    },
    /// `RN*` — receive request refused.
    ReceiveRefused(TransferFailure),
    /// `XY` — execution request accepted.
    ExecuteAccepted,
    /// `XN` — execution request refused.
    ExecuteRefused,
    /// `CY` — the received file was stored successfully.
    Stored,
    /// `CN5` — the received file could not be moved into its final
    /// location.
    NotStored,
    /// `H` — the peer has no more work and proposes hanging up.
    Hangup,
    /// `HY` — hangup agreed.
    HangupYes,
    /// `HN` — hangup denied; the peer has work for us after all.
    HangupNo,
}

/// A command string that could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unparseable command \"{0}\"")]
pub struct CommandParseError(pub String);

impl TransferFailure {
    /// The digit this failure travels as in an `SN` reply.
    fn send_code(self) -> &'static str {
        match self {
            TransferFailure::Permission => "2",
            TransferFailure::WorkSpace => "4",
            TransferFailure::Size => "6",
            TransferFailure::Other => "",
        }
    }

    /// The digit this failure travels as in an `RN` reply.
    ///
    /// There is no work-file digit on the receive side, so `WorkSpace`
    /// travels as the generic refusal; giving it `RN2` would come back
    /// as a permanent "no such file" on the far side.
    fn receive_code(self) -> &'static str {
        match self {
            TransferFailure::Permission => "2",
            TransferFailure::Size => "6",
            TransferFailure::WorkSpace | TransferFailure::Other => "",
        }
    }

    fn from_send_code(code: &str) -> Self {
        match code {
            "2" => TransferFailure::Permission,
            "4" => TransferFailure::WorkSpace,
            "6" => TransferFailure::Size,
            _ => TransferFailure::Other,
        }
    }

    fn from_receive_code(code: &str) -> Self {
        match code {
            "2" => TransferFailure::Permission,
            "6" => TransferFailure::Size,
            _ => TransferFailure::Other,
        }
    }
}

impl Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Send(r) => {
                write!(
                    f,
                    "S {} {} {} -{} {} 0{:o}",
                    r.from, r.to, r.user, r.options, r.temp, r.mode
                )?;
                if let Some(size) = r.size {
                    let notify = if r.notify.is_empty() { "\"\"" } else { &r.notify };
                    write!(f, " {notify} {size}")
                } else if r.notify.is_empty() {
                    Ok(())
                } else {
                    write!(f, " {}", r.notify)
                }
            }
            Command::Receive(r) => {
                write!(f, "R {} {} {} -{}", r.from, r.to, r.user, r.options)?;
                match r.size {
                    Some(size) => write!(f, " {size}"),
                    None => Ok(()),
                }
            }
            Command::Execute(r) => {
                write!(f, "X {} {} {} -{}", r.from, r.to, r.user, r.options)
            }
            Command::SendAccepted => write!(f, "SY"),
            Command::SendRefused(why) => write!(f, "SN{}", why.send_code()),
            Command::ReceiveAccepted { mode } => write!(f, "RY 0{mode:o}"),
            Command::ReceiveRefused(why) => write!(f, "RN{}", why.receive_code()),
            Command::ExecuteAccepted => write!(f, "XY"),
            Command::ExecuteRefused => write!(f, "XN"),
            Command::Stored => write!(f, "CY"),
            Command::NotStored => write!(f, "CN5"),
            Command::Hangup => write!(f, "H"),
            Command::HangupYes => write!(f, "HY"),
            Command::HangupNo => write!(f, "HN"),
        }
    }
}

/// Parses `0mode` octal notation; bare digits are accepted too.
fn parse_mode(word: &str) -> Option<u32> {
    u32::from_str_radix(word, 8).ok()
}

fn parse_request(words: &[&str], with_temp_and_mode: bool) -> Option<TransferRequest> {
    let mut req = TransferRequest {
        from: (*words.first()?).to_string(),
        to: (*words.get(1)?).to_string(),
        user: (*words.get(2)?).to_string(),
        options: words.get(3)?.strip_prefix('-')?.to_string(),
        ..Default::default()
    };
    let mut rest = &words[4..];
    if with_temp_and_mode {
        req.temp = (*rest.first()?).to_string();
        req.mode = parse_mode(rest.get(1)?)?;
        if let Some(notify) = rest.get(2) {
            if *notify != "\"\"" {
                req.notify = (*notify).to_string();
            }
        }
        rest = if rest.len() > 3 { &rest[3..] } else { &[] };
    }
    if let Some(size) = rest.first() {
        req.size = Some(size.parse().ok()?);
    }
    Some(req)
}

impl FromStr for Command {
    type Err = CommandParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fail = || CommandParseError(s.to_string());
        let words: Vec<&str> = s.split_whitespace().collect();
        let &first = words.first().ok_or_else(fail)?;

        let cmd = match first {
            "S" => Command::Send(parse_request(&words[1..], true).ok_or_else(fail)?),
            "R" => Command::Receive(parse_request(&words[1..], false).ok_or_else(fail)?),
            "X" => Command::Execute(parse_request(&words[1..], false).ok_or_else(fail)?),
            "SY" => Command::SendAccepted,
            "RY" => {
                // The mode should follow as "0mode"; fall back to 0666.
                let mode = words.get(1).copied().and_then(parse_mode).unwrap_or(0);
                Command::ReceiveAccepted {
                    mode: if mode == 0 { 0o666 } else { mode },
                }
            }
            "XY" => Command::ExecuteAccepted,
            "XN" => Command::ExecuteRefused,
            "CY" => Command::Stored,
            "H" => Command::Hangup,
            "HY" => Command::HangupYes,
            "HN" => Command::HangupNo,
            _ => {
                if let Some(code) = first.strip_prefix("SN") {
                    Command::SendRefused(TransferFailure::from_send_code(code))
                } else if let Some(code) = first.strip_prefix("RN") {
                    Command::ReceiveRefused(TransferFailure::from_receive_code(code))
                } else if first.starts_with("CN") {
                    Command::NotStored
                } else {
                    return Err(fail());
                }
            }
        };
        Ok(cmd)
    }
}
