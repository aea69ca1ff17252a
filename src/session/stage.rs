//! The command sequence one session must follow.
//!
//! Milter commands mirror the SMTP transaction, so their order is fixed.
//! Macro definitions and unknown SMTP verbs may appear between any two
//! stages; everything else advances the stage or is a protocol violation
//! that terminates the session.

use crate::proto::command::Command;
use thiserror::Error;

/// Session stages. `Quit` leads to the socket closing; a violation or an IO
/// error ends the session from any stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    AwaitingOptions,
    Negotiated,
    Connected,
    Helo,
    MailFrom,
    RcptTo,
    Data,
    Header,
    EndOfHeaders,
    Body,
    EndOfMessage,
    Aborted,
    Quit,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("command {command} not valid in stage {stage:?}")]
pub struct ProtocolViolation {
    pub stage: Stage,
    pub command: &'static str,
}

impl Stage {
    /// The stage after `command`, or the violation that refuses it.
    pub fn advance(self, command: &Command) -> Result<Stage, ProtocolViolation> {
        use Command as C;
        use Stage as S;
        Ok(match (self, command) {
            // macros and unknown SMTP verbs carry no stage of their own
            (stage, C::DefineMacro { .. }) if stage != S::AwaitingOptions => stage,
            (stage, C::Unknown(_)) if stage != S::AwaitingOptions => stage,

            (S::AwaitingOptions, C::OptionsNegotiate { .. }) => S::Negotiated,

            (S::Negotiated | S::Aborted, C::Connect(_)) => S::Connected,
            (S::Connected, C::Helo(_)) => S::Helo,
            (S::Connected | S::Helo | S::Aborted, C::MailFrom(_)) => S::MailFrom,
            (S::MailFrom | S::RcptTo, C::RcptTo(_)) => S::RcptTo,
            (S::RcptTo, C::Data) => S::Data,
            (S::Data | S::Header, C::Header(_)) => S::Header,
            (S::Data | S::Header, C::EndOfHeaders) => S::EndOfHeaders,
            (S::EndOfHeaders | S::Body, C::BodyChunk(_)) => S::Body,
            (S::EndOfHeaders | S::Body, C::EndOfMessage) => S::EndOfMessage,

            // anything in-flight can be dropped; an MTA may even abort twice
            (
                S::Connected | S::Helo | S::MailFrom | S::RcptTo | S::Data | S::Header
                | S::EndOfHeaders | S::Body | S::EndOfMessage | S::Aborted,
                C::Abort,
            ) => S::Aborted,

            (stage, C::Quit | C::QuitNewConnection) if stage != S::AwaitingOptions => S::Quit,

            (stage, command) => {
                return Err(ProtocolViolation {
                    stage,
                    command: command.verb(),
                })
            }
        })
    }
}
