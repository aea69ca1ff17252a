//! Responses and manipulations the milter sends, and their frame encoding.
//!
//! Responses are closed sum types per stage, so a hook cannot hand the
//! session a reply that would be illegal where it runs; what remains to
//! check at encode time is the action-flag agreement from negotiation.

use crate::proto::flags::{ActionFlags, MacroStage, ProtocolFlags, VERSION};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncodeError {
    #[error("manipulation {action} was not negotiated")]
    ActionNotPermitted { action: &'static str },
    #[error("reply code {0} out of range, must be 4xx or 5xx")]
    BadReplyCode(u16),
    #[error("enhanced status class must match the reply code class")]
    MismatchedEnhancedCode,
    #[error("header name {0:?} is not a legal field name")]
    BadHeaderName(String),
    #[error("quarantine reason cannot be empty")]
    EmptyQuarantineReason,
}

/// An SMTP reply `smtp-code [enhanced-code] text`, restricted to 4xx/5xx as
/// the protocol demands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyCode {
    code: u16,
    enhanced: Option<(u8, u16, u16)>,
    text: String,
}

impl ReplyCode {
    pub fn new(
        code: u16,
        enhanced: Option<(u8, u16, u16)>,
        text: impl Into<String>,
    ) -> Result<Self, EncodeError> {
        if !(400..600).contains(&code) {
            return Err(EncodeError::BadReplyCode(code));
        }
        if let Some((class, _, _)) = enhanced {
            if u16::from(class) != code / 100 {
                return Err(EncodeError::MismatchedEnhancedCode);
            }
        }
        Ok(ReplyCode {
            code,
            enhanced,
            text: text.into(),
        })
    }

    /// Permanent failure, `550` unless you need another 5xx.
    pub fn reject(enhanced: Option<(u8, u16, u16)>, text: impl Into<String>) -> Self {
        ReplyCode {
            code: 550,
            enhanced,
            text: text.into(),
        }
    }

    /// Temporary failure, `451`.
    pub fn tempfail(enhanced: Option<(u8, u16, u16)>, text: impl Into<String>) -> Self {
        ReplyCode {
            code: 451,
            enhanced,
            text: text.into(),
        }
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    fn render(&self) -> Vec<u8> {
        let mut out = self.code.to_string();
        if let Some((class, subject, detail)) = self.enhanced {
            out.push_str(&format!(" {}.{}.{}", class, subject, detail));
        }
        if !self.text.is_empty() {
            out.push(' ');
            out.push_str(&self.text);
        }
        out.into_bytes()
    }
}

/// What a hook decides about the stage it was called for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Proceed to the next stage.
    Continue,
    /// Accept the message outright; no further callbacks for it.
    Accept,
    /// Reject permanently (5xx).
    Reject,
    /// Reject temporarily (4xx).
    Tempfail,
    /// Pretend to accept, then drop the message silently.
    Discard,
    /// Make the SMTP connection itself fail.
    ConnectionFail,
    /// Reject or tempfail with a specific SMTP reply.
    Reply(ReplyCode),
}

/// Body-chunk hooks may additionally skip the remaining chunks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyReply {
    Verdict(Verdict),
    Skip,
}

impl From<Verdict> for BodyReply {
    fn from(verdict: Verdict) -> Self {
        BodyReply::Verdict(verdict)
    }
}

/// A message change requested at end of message. Each kind is gated by the
/// matching action flag from negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Manipulation {
    /// Append a header at the end.
    AddHeader { name: Vec<u8>, value: Vec<u8> },
    /// Add a header at the given position.
    InsertHeader {
        index: u32,
        name: Vec<u8>,
        value: Vec<u8>,
    },
    /// Replace the nth occurrence of the named header; an empty value
    /// deletes it.
    ChangeHeader {
        index: u32,
        name: Vec<u8>,
        value: Vec<u8>,
    },
    /// Replace the envelope sender, optionally with ESMTP arguments.
    ChangeMailFrom {
        address: Vec<u8>,
        args: Option<Vec<u8>>,
    },
    AddRecipient { address: Vec<u8> },
    AddRecipientWithArgs { address: Vec<u8>, args: Vec<u8> },
    RemoveRecipient { address: Vec<u8> },
    /// Replace the message body; repeat for bodies over one frame.
    ReplaceBody { chunk: Vec<u8> },
}

impl Manipulation {
    fn required_action(&self) -> (ActionFlags, &'static str) {
        match self {
            Manipulation::AddHeader { .. } | Manipulation::InsertHeader { .. } => {
                (ActionFlags::ADD_HEADER, "add-header")
            }
            Manipulation::ChangeHeader { .. } => (ActionFlags::CHANGE_HEADER, "change-header"),
            Manipulation::ChangeMailFrom { .. } => (ActionFlags::CHANGE_FROM, "change-from"),
            Manipulation::AddRecipient { .. } => (ActionFlags::ADD_RCPT, "add-rcpt"),
            Manipulation::AddRecipientWithArgs { .. } => {
                (ActionFlags::ADD_RCPT_PAR, "add-rcpt-with-args")
            }
            Manipulation::RemoveRecipient { .. } => (ActionFlags::DELETE_RCPT, "delete-rcpt"),
            Manipulation::ReplaceBody { .. } => (ActionFlags::CHANGE_BODY, "change-body"),
        }
    }
}

/// Terminal decision at end of message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EomVerdict {
    Verdict(Verdict),
    /// Hold the message in the MTA's quarantine queue. The reason must not
    /// be empty.
    Quarantine { reason: Vec<u8> },
}

impl From<Verdict> for EomVerdict {
    fn from(verdict: Verdict) -> Self {
        EomVerdict::Verdict(verdict)
    }
}

/// End-of-message reply: manipulations in order, then one terminal verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EomReply {
    pub manipulations: Vec<Manipulation>,
    pub verdict: EomVerdict,
}

impl EomReply {
    pub fn new(verdict: impl Into<EomVerdict>) -> Self {
        EomReply {
            manipulations: vec![],
            verdict: verdict.into(),
        }
    }

    pub fn with(mut self, manipulation: Manipulation) -> Self {
        self.manipulations.push(manipulation);
        self
    }
}

impl Default for EomReply {
    fn default() -> Self {
        EomReply::new(Verdict::Continue)
    }
}

impl From<Verdict> for EomReply {
    fn from(verdict: Verdict) -> Self {
        EomReply::new(verdict)
    }
}

/// Reply to the options-negotiate command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiateReply {
    pub version: u32,
    pub actions: ActionFlags,
    pub protocol: ProtocolFlags,
    /// Per-stage macro interest, appended to the reply payload when the
    /// set-symbol-list action was agreed.
    pub symbols: Vec<(MacroStage, Vec<String>)>,
}

impl NegotiateReply {
    pub fn new(actions: ActionFlags, protocol: ProtocolFlags) -> Self {
        NegotiateReply {
            version: VERSION,
            actions,
            protocol,
            symbols: vec![],
        }
    }
}

/// Anything the milter can write to the MTA, one frame each.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Negotiate(NegotiateReply),
    Continue,
    Accept,
    Reject,
    Tempfail,
    Discard,
    ConnectionFail,
    /// Skip the remaining commands of the current stage.
    Skip,
    /// Still working; resets the MTA's reply timer.
    Progress,
    Reply(ReplyCode),
    Quarantine { reason: Vec<u8> },
    Manipulation(Manipulation),
}

impl From<Verdict> for Response {
    fn from(verdict: Verdict) -> Self {
        match verdict {
            Verdict::Continue => Response::Continue,
            Verdict::Accept => Response::Accept,
            Verdict::Reject => Response::Reject,
            Verdict::Tempfail => Response::Tempfail,
            Verdict::Discard => Response::Discard,
            Verdict::ConnectionFail => Response::ConnectionFail,
            Verdict::Reply(code) => Response::Reply(code),
        }
    }
}

impl Response {
    /// Encode into a frame `(code, body)`. `allowed` is the action set fixed
    /// at negotiation; manipulations and quarantine check against it.
    pub fn encode(&self, allowed: ActionFlags) -> Result<(u8, Vec<u8>), EncodeError> {
        Ok(match self {
            Response::Negotiate(reply) => (b'O', encode_negotiate(reply)),
            Response::Continue => (b'c', vec![]),
            Response::Accept => (b'a', vec![]),
            Response::Reject => (b'r', vec![]),
            Response::Tempfail => (b't', vec![]),
            Response::Discard => (b'd', vec![]),
            Response::ConnectionFail => (b'f', vec![]),
            Response::Skip => (b's', vec![]),
            Response::Progress => (b'p', vec![]),
            Response::Reply(code) => {
                let mut body = code.render();
                body.push(0);
                (b'y', body)
            }
            Response::Quarantine { reason } => {
                if reason.is_empty() {
                    return Err(EncodeError::EmptyQuarantineReason);
                }
                if !allowed.contains(ActionFlags::QUARANTINE) {
                    return Err(EncodeError::ActionNotPermitted {
                        action: "quarantine",
                    });
                }
                let mut body = reason.clone();
                body.push(0);
                (b'q', body)
            }
            Response::Manipulation(manipulation) => {
                let (action, name) = manipulation.required_action();
                if !allowed.contains(action) {
                    return Err(EncodeError::ActionNotPermitted { action: name });
                }
                encode_manipulation(manipulation)?
            }
        })
    }
}

/// Field names must be printable US-ASCII without space or colon.
fn check_header_name(name: &[u8]) -> Result<(), EncodeError> {
    let ok = !name.is_empty()
        && name
            .iter()
            .all(|b| (33u8..=126).contains(b) && *b != b':');
    if ok {
        Ok(())
    } else {
        Err(EncodeError::BadHeaderName(
            String::from_utf8_lossy(name).into_owned(),
        ))
    }
}

fn nul_terminated(fields: &[&[u8]]) -> Vec<u8> {
    let mut body = Vec::new();
    for field in fields {
        body.extend_from_slice(field);
        body.push(0);
    }
    body
}

fn encode_manipulation(manipulation: &Manipulation) -> Result<(u8, Vec<u8>), EncodeError> {
    Ok(match manipulation {
        Manipulation::AddHeader { name, value } => {
            check_header_name(name)?;
            (b'h', nul_terminated(&[name, value]))
        }
        Manipulation::InsertHeader { index, name, value } => {
            check_header_name(name)?;
            let mut body = index.to_be_bytes().to_vec();
            body.extend_from_slice(&nul_terminated(&[name, value]));
            (b'i', body)
        }
        Manipulation::ChangeHeader { index, name, value } => {
            check_header_name(name)?;
            let mut body = index.to_be_bytes().to_vec();
            body.extend_from_slice(&nul_terminated(&[name, value]));
            (b'm', body)
        }
        Manipulation::ChangeMailFrom { address, args } => match args {
            Some(args) => (b'e', nul_terminated(&[address, args])),
            None => (b'e', nul_terminated(&[address])),
        },
        Manipulation::AddRecipient { address } => (b'+', nul_terminated(&[address])),
        Manipulation::AddRecipientWithArgs { address, args } => {
            (b'2', nul_terminated(&[address, args]))
        }
        Manipulation::RemoveRecipient { address } => (b'-', nul_terminated(&[address])),
        Manipulation::ReplaceBody { chunk } => (b'b', chunk.clone()),
    })
}

fn encode_negotiate(reply: &NegotiateReply) -> Vec<u8> {
    let mut body = Vec::with_capacity(12);
    body.extend_from_slice(&reply.version.to_be_bytes());
    body.extend_from_slice(&reply.actions.bits().to_be_bytes());
    body.extend_from_slice(&reply.protocol.bits().to_be_bytes());
    for (stage, names) in &reply.symbols {
        body.extend_from_slice(&stage.code().to_be_bytes());
        let mut names = names.clone();
        names.sort();
        body.extend_from_slice(names.join(" ").as_bytes());
        body.push(0);
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(response: Response) -> (u8, Vec<u8>) {
        response.encode(ActionFlags::from_bits(u32::MAX)).expect("encodes")
    }

    #[test]
    fn bare_responses_have_empty_bodies() {
        assert_eq!(encode(Response::Continue), (b'c', vec![]));
        assert_eq!(encode(Response::Accept), (b'a', vec![]));
        assert_eq!(encode(Response::Reject), (b'r', vec![]));
        assert_eq!(encode(Response::Tempfail), (b't', vec![]));
        assert_eq!(encode(Response::Discard), (b'd', vec![]));
        assert_eq!(encode(Response::ConnectionFail), (b'f', vec![]));
        assert_eq!(encode(Response::Skip), (b's', vec![]));
        assert_eq!(encode(Response::Progress), (b'p', vec![]));
    }

    #[test]
    fn reply_code_with_enhanced_code_and_text() {
        let code = ReplyCode::new(550, Some((5, 7, 1)), "not allowed").unwrap();
        assert_eq!(
            encode(Response::Reply(code)),
            (b'y', b"550 5.7.1 not allowed\0".to_vec())
        );
    }

    #[test]
    fn reply_code_plain() {
        let code = ReplyCode::new(451, None, "").unwrap();
        assert_eq!(encode(Response::Reply(code)), (b'y', b"451\0".to_vec()));
    }

    #[test]
    fn reply_code_validation() {
        assert_eq!(
            ReplyCode::new(250, None, "ok").unwrap_err(),
            EncodeError::BadReplyCode(250)
        );
        assert_eq!(
            ReplyCode::new(600, None, "").unwrap_err(),
            EncodeError::BadReplyCode(600)
        );
        assert_eq!(
            ReplyCode::new(550, Some((4, 7, 1)), "").unwrap_err(),
            EncodeError::MismatchedEnhancedCode
        );
        assert_eq!(ReplyCode::tempfail(None, "busy").code(), 451);
        assert_eq!(ReplyCode::reject(Some((5, 7, 1)), "no").code(), 550);
    }

    #[test]
    fn add_header() {
        assert_eq!(
            encode(Response::Manipulation(Manipulation::AddHeader {
                name: b"X-Tag".to_vec(),
                value: b"v".to_vec(),
            })),
            (b'h', b"X-Tag\0v\0".to_vec())
        );
    }

    #[test]
    fn insert_and_change_header_carry_an_index() {
        assert_eq!(
            encode(Response::Manipulation(Manipulation::InsertHeader {
                index: 2,
                name: b"X-Tag".to_vec(),
                value: b"v".to_vec(),
            })),
            (b'i', b"\x00\x00\x00\x02X-Tag\0v\0".to_vec())
        );
        assert_eq!(
            encode(Response::Manipulation(Manipulation::ChangeHeader {
                index: 0,
                name: b"Subject".to_vec(),
                value: b"".to_vec(),
            })),
            (b'm', b"\x00\x00\x00\x00Subject\0\0".to_vec())
        );
    }

    #[test]
    fn header_name_is_validated() {
        let bad = Response::Manipulation(Manipulation::AddHeader {
            name: b"X Tag".to_vec(),
            value: b"v".to_vec(),
        });
        assert!(matches!(
            bad.encode(ActionFlags::ADD_HEADER),
            Err(EncodeError::BadHeaderName(_))
        ));
        let bad = Response::Manipulation(Manipulation::AddHeader {
            name: b"X:Tag".to_vec(),
            value: b"v".to_vec(),
        });
        assert!(matches!(
            bad.encode(ActionFlags::ADD_HEADER),
            Err(EncodeError::BadHeaderName(_))
        ));
        let bad = Response::Manipulation(Manipulation::AddHeader {
            name: b"".to_vec(),
            value: b"v".to_vec(),
        });
        assert!(matches!(
            bad.encode(ActionFlags::ADD_HEADER),
            Err(EncodeError::BadHeaderName(_))
        ));
    }

    #[test]
    fn envelope_manipulations() {
        assert_eq!(
            encode(Response::Manipulation(Manipulation::ChangeMailFrom {
                address: b"<new@example.com>".to_vec(),
                args: None,
            })),
            (b'e', b"<new@example.com>\0".to_vec())
        );
        assert_eq!(
            encode(Response::Manipulation(Manipulation::ChangeMailFrom {
                address: b"<new@example.com>".to_vec(),
                args: Some(b"BODY=8BITMIME".to_vec()),
            })),
            (b'e', b"<new@example.com>\0BODY=8BITMIME\0".to_vec())
        );
        assert_eq!(
            encode(Response::Manipulation(Manipulation::AddRecipient {
                address: b"<cc@example.com>".to_vec(),
            })),
            (b'+', b"<cc@example.com>\0".to_vec())
        );
        assert_eq!(
            encode(Response::Manipulation(Manipulation::AddRecipientWithArgs {
                address: b"<cc@example.com>".to_vec(),
                args: b"NOTIFY=NEVER".to_vec(),
            })),
            (b'2', b"<cc@example.com>\0NOTIFY=NEVER\0".to_vec())
        );
        assert_eq!(
            encode(Response::Manipulation(Manipulation::RemoveRecipient {
                address: b"<cc@example.com>".to_vec(),
            })),
            (b'-', b"<cc@example.com>\0".to_vec())
        );
    }

    #[test]
    fn replace_body_is_raw() {
        assert_eq!(
            encode(Response::Manipulation(Manipulation::ReplaceBody {
                chunk: b"new body".to_vec(),
            })),
            (b'b', b"new body".to_vec())
        );
    }

    #[test]
    fn quarantine() {
        assert_eq!(
            encode(Response::Quarantine {
                reason: b"looks shady".to_vec(),
            }),
            (b'q', b"looks shady\0".to_vec())
        );
        assert_eq!(
            Response::Quarantine { reason: vec![] }
                .encode(ActionFlags::QUARANTINE)
                .unwrap_err(),
            EncodeError::EmptyQuarantineReason
        );
    }

    #[test]
    fn manipulations_require_their_action_flag() {
        let add = Response::Manipulation(Manipulation::AddHeader {
            name: b"X-Tag".to_vec(),
            value: b"v".to_vec(),
        });
        assert_eq!(
            add.encode(ActionFlags::CHANGE_BODY).unwrap_err(),
            EncodeError::ActionNotPermitted {
                action: "add-header",
            }
        );
        assert!(add.encode(ActionFlags::ADD_HEADER).is_ok());

        let quarantine = Response::Quarantine {
            reason: b"r".to_vec(),
        };
        assert_eq!(
            quarantine.encode(ActionFlags::empty()).unwrap_err(),
            EncodeError::ActionNotPermitted {
                action: "quarantine",
            }
        );
    }

    #[test]
    fn negotiate_reply_without_symbols() {
        let reply = NegotiateReply::new(
            ActionFlags::empty(),
            ProtocolFlags::from_bits(0x1f_ffff),
        );
        assert_eq!(
            encode(Response::Negotiate(reply)),
            (b'O', b"\x00\x00\x00\x06\x00\x00\x00\x00\x00\x1f\xff\xff".to_vec())
        );
    }

    #[test]
    fn negotiate_reply_with_symbol_blocks() {
        let mut reply =
            NegotiateReply::new(ActionFlags::SET_SYMLIST, ProtocolFlags::empty());
        reply.symbols = vec![
            (
                MacroStage::MailFrom,
                vec!["{auth_authen}".to_owned(), "i".to_owned()],
            ),
            (MacroStage::Connect, vec![]),
        ];
        let (code, body) = encode(Response::Negotiate(reply));
        assert_eq!(code, b'O');
        let mut expected = b"\x00\x00\x00\x06\x00\x00\x01\x00\x00\x00\x00\x00".to_vec();
        expected.extend_from_slice(b"\x00\x00\x00\x02i {auth_authen}\0");
        expected.extend_from_slice(b"\x00\x00\x00\x00\0");
        assert_eq!(body, expected);
    }
}
