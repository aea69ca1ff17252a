//! Options negotiation: the first exchange of every session.
//!
//! The MTA offers a protocol version and two flag words; the milter answers
//! with the most restrictive set consistent with what the application
//! declared. Callbacks without a hook get their no-call bit, hooks that
//! never reply get their no-reply bit, and the manipulation set must be a
//! subset of what the MTA offers. The result is frozen for the session.

use crate::app::AppDecl;
use crate::proto::flags::{ActionFlags, MacroStage, ProtocolFlags, VERSION};
use crate::proto::response::NegotiateReply;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NegotiateError {
    #[error("MTA offers milter protocol version {offered}, version 6 required")]
    UnsupportedVersion { offered: u32 },
    #[error("MTA does not offer required actions: {missing:?}")]
    ActionNotOffered { missing: ActionFlags },
}

/// Flag sets effective for one session once the reply is on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    pub protocol: ProtocolFlags,
    pub actions: ActionFlags,
}

impl Negotiated {
    pub fn allows(&self, action: ActionFlags) -> bool {
        self.actions.contains(action)
    }

    /// Whether the MTA awaits a reply for this stage. End of message always
    /// replies; abort and quit never do.
    pub fn wants_reply(&self, stage: MacroStage) -> bool {
        match no_reply_bit(stage) {
            Some(bit) => !self.protocol.contains(bit),
            None => stage == MacroStage::EndOfMessage,
        }
    }

    pub fn skip_allowed(&self) -> bool {
        self.protocol.contains(ProtocolFlags::SKIP)
    }
}

fn no_call_bit(stage: MacroStage) -> Option<ProtocolFlags> {
    Some(match stage {
        MacroStage::Connect => ProtocolFlags::NO_CONNECT,
        MacroStage::Helo => ProtocolFlags::NO_HELO,
        MacroStage::MailFrom => ProtocolFlags::NO_MAIL,
        MacroStage::RcptTo => ProtocolFlags::NO_RCPT,
        MacroStage::Data => ProtocolFlags::NO_DATA,
        MacroStage::Header => ProtocolFlags::NO_HEADERS,
        MacroStage::EndOfHeaders => ProtocolFlags::NO_EOH,
        MacroStage::Body => ProtocolFlags::NO_BODY,
        MacroStage::Unknown => ProtocolFlags::NO_UNKNOWN,
        // end of message cannot be skipped
        MacroStage::EndOfMessage => return None,
    })
}

fn no_reply_bit(stage: MacroStage) -> Option<ProtocolFlags> {
    Some(match stage {
        MacroStage::Connect => ProtocolFlags::NO_REPLY_CONNECT,
        MacroStage::Helo => ProtocolFlags::NO_REPLY_HELO,
        MacroStage::MailFrom => ProtocolFlags::NO_REPLY_MAIL,
        MacroStage::RcptTo => ProtocolFlags::NO_REPLY_RCPT,
        MacroStage::Data => ProtocolFlags::NO_REPLY_DATA,
        MacroStage::Header => ProtocolFlags::NO_REPLY_HEADER,
        MacroStage::EndOfHeaders => ProtocolFlags::NO_REPLY_EOH,
        MacroStage::Body => ProtocolFlags::NO_REPLY_BODY,
        MacroStage::Unknown => ProtocolFlags::NO_REPLY_UNKNOWN,
        MacroStage::EndOfMessage => return None,
    })
}

/// Compute the reply to an options-negotiate offer and the flag sets to
/// freeze on the session.
pub fn negotiate(
    version: u32,
    offered_actions: ActionFlags,
    offered_protocol: ProtocolFlags,
    decl: &AppDecl,
) -> Result<(Negotiated, NegotiateReply), NegotiateError> {
    if version < VERSION {
        return Err(NegotiateError::UnsupportedVersion { offered: version });
    }

    let wanted_actions = decl.actions();
    if !offered_actions.contains(wanted_actions) {
        return Err(NegotiateError::ActionNotOffered {
            missing: wanted_actions.difference(offered_actions),
        });
    }

    let mut wanted_protocol = ProtocolFlags::empty();
    for stage in MacroStage::ALL {
        if !decl.handles(stage) {
            if let Some(bit) = no_call_bit(stage) {
                wanted_protocol |= bit;
            }
        }
        if !decl.replies(stage) {
            if let Some(bit) = no_reply_bit(stage) {
                wanted_protocol |= bit;
            }
        }
    }
    if decl.include_rejected_rcpts {
        wanted_protocol |= ProtocolFlags::RCPT_REJ;
    }
    if decl.allow_body_skip {
        wanted_protocol |= ProtocolFlags::SKIP;
    }
    if decl.headers_with_leading_space {
        wanted_protocol |= ProtocolFlags::HEADER_LEADING_SPACE;
    }

    let protocol = wanted_protocol.intersection(offered_protocol);
    let mut actions = wanted_actions;

    let mut reply = NegotiateReply::new(actions, protocol);
    if !decl.symbols.is_empty() {
        if offered_actions.contains(ActionFlags::SET_SYMLIST) {
            actions |= ActionFlags::SET_SYMLIST;
            reply.actions = actions;
            reply.symbols = decl.symbols.clone();
        } else {
            warn!("MTA does not accept a symbol list; macro restriction ignored");
        }
    }

    Ok((Negotiated { protocol, actions }, reply))
}
