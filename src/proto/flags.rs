//! Protocol and action flag sets and the macro stage identifiers.
//!
//! Numeric values follow Sendmail's libmilter headers, which is what Postfix
//! speaks. Flag semantics: a protocol `NO_*` bit asks the MTA not to send
//! that callback at all, a `NO_REPLY_*` bit promises the MTA it need not
//! wait for a reply to it, and an action bit claims the right to perform a
//! message manipulation at end of message.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

/// The protocol version this crate speaks and requires as a minimum offer.
pub const VERSION: u32 = 6;

macro_rules! flag_set {
    ($(#[$doc:meta])* $name:ident { $($flag:ident = $value:expr => $label:expr,)* }) => {
        $(#[$doc])*
        #[derive(Default, Clone, Copy, PartialEq, Eq)]
        pub struct $name(u32);

        impl $name {
            $(pub const $flag: $name = $name($value);)*

            pub const fn empty() -> Self {
                $name(0)
            }

            pub const fn from_bits(bits: u32) -> Self {
                $name(bits)
            }

            pub const fn bits(self) -> u32 {
                self.0
            }

            pub const fn is_empty(self) -> bool {
                self.0 == 0
            }

            pub const fn contains(self, other: Self) -> bool {
                (self.0 & other.0) == other.0
            }

            pub const fn intersection(self, other: Self) -> Self {
                $name(self.0 & other.0)
            }

            pub const fn union(self, other: Self) -> Self {
                $name(self.0 | other.0)
            }

            /// Bits present in `self` but not in `other`.
            pub const fn difference(self, other: Self) -> Self {
                $name(self.0 & !other.0)
            }

            pub fn insert(&mut self, other: Self) {
                self.0 |= other.0;
            }

            fn known_names(self) -> Vec<&'static str> {
                let mut names = vec![];
                $(
                    if self.contains($name::$flag) {
                        names.push($label);
                    }
                )*
                names
            }
        }

        impl BitOr for $name {
            type Output = Self;
            fn bitor(self, rhs: Self) -> Self {
                self.union(rhs)
            }
        }

        impl BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: Self) {
                self.insert(rhs)
            }
        }

        impl BitAnd for $name {
            type Output = Self;
            fn bitand(self, rhs: Self) -> Self {
                self.intersection(rhs)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#010x}", stringify!($name), self.0)?;
                for name in self.known_names() {
                    write!(f, " {}", name)?;
                }
                f.write_str(")")
            }
        }
    };
}

flag_set! {
    /// Which callbacks the MTA may skip or not await a reply for, plus the
    /// handful of behaviour toggles sharing the same word on the wire.
    ProtocolFlags {
        NO_CONNECT = 0x0000_0001 => "no-connect",
        NO_HELO = 0x0000_0002 => "no-helo",
        NO_MAIL = 0x0000_0004 => "no-mail",
        NO_RCPT = 0x0000_0008 => "no-rcpt",
        NO_BODY = 0x0000_0010 => "no-body",
        NO_HEADERS = 0x0000_0020 => "no-headers",
        NO_EOH = 0x0000_0040 => "no-eoh",
        NO_REPLY_HEADER = 0x0000_0080 => "no-reply-header",
        NO_UNKNOWN = 0x0000_0100 => "no-unknown",
        NO_DATA = 0x0000_0200 => "no-data",
        SKIP = 0x0000_0400 => "skip-allowed",
        RCPT_REJ = 0x0000_0800 => "include-rejected-rcpts",
        NO_REPLY_CONNECT = 0x0000_1000 => "no-reply-connect",
        NO_REPLY_HELO = 0x0000_2000 => "no-reply-helo",
        NO_REPLY_MAIL = 0x0000_4000 => "no-reply-mail",
        NO_REPLY_RCPT = 0x0000_8000 => "no-reply-rcpt",
        NO_REPLY_DATA = 0x0001_0000 => "no-reply-data",
        NO_REPLY_UNKNOWN = 0x0002_0000 => "no-reply-unknown",
        NO_REPLY_EOH = 0x0004_0000 => "no-reply-eoh",
        NO_REPLY_BODY = 0x0008_0000 => "no-reply-body",
        HEADER_LEADING_SPACE = 0x0010_0000 => "headers-with-leading-space",
    }
}

flag_set! {
    /// Which message manipulations the milter may perform.
    ActionFlags {
        ADD_HEADER = 0x0000_0001 => "add-header",
        CHANGE_BODY = 0x0000_0002 => "change-body",
        ADD_RCPT = 0x0000_0004 => "add-rcpt",
        DELETE_RCPT = 0x0000_0008 => "delete-rcpt",
        CHANGE_HEADER = 0x0000_0010 => "change-header",
        QUARANTINE = 0x0000_0020 => "quarantine",
        CHANGE_FROM = 0x0000_0040 => "change-from",
        ADD_RCPT_PAR = 0x0000_0080 => "add-rcpt-with-args",
        SET_SYMLIST = 0x0000_0100 => "set-symbol-list",
    }
}

/// SMTP transaction stages the milter protocol exposes. Used as the key for
/// macro (symbol) scoping and for the per-stage hook declarations.
///
/// `code()` values are the libmilter SMFIM_* numbering; the stages libmilter
/// leaves unnumbered still appear on the wire from Postfix.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MacroStage {
    Connect,
    Helo,
    MailFrom,
    RcptTo,
    Data,
    Header,
    EndOfHeaders,
    Body,
    EndOfMessage,
    Unknown,
}

impl MacroStage {
    pub const ALL: [MacroStage; 10] = [
        MacroStage::Connect,
        MacroStage::Helo,
        MacroStage::MailFrom,
        MacroStage::RcptTo,
        MacroStage::Data,
        MacroStage::Header,
        MacroStage::EndOfHeaders,
        MacroStage::Body,
        MacroStage::EndOfMessage,
        MacroStage::Unknown,
    ];

    /// Stage id in the symbol-list payload of the negotiation reply.
    pub fn code(self) -> u32 {
        match self {
            MacroStage::Connect => 0,
            MacroStage::Helo => 1,
            MacroStage::MailFrom => 2,
            MacroStage::RcptTo => 3,
            MacroStage::Data => 4,
            MacroStage::EndOfMessage => 5,
            MacroStage::EndOfHeaders => 6,
            MacroStage::Header => 7,
            MacroStage::Body => 8,
            MacroStage::Unknown => 9,
        }
    }

    /// Macro definitions name the stage they apply to by the command byte of
    /// that stage.
    pub fn from_command_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            b'C' => MacroStage::Connect,
            b'H' => MacroStage::Helo,
            b'M' => MacroStage::MailFrom,
            b'R' => MacroStage::RcptTo,
            b'T' => MacroStage::Data,
            b'L' => MacroStage::Header,
            b'N' => MacroStage::EndOfHeaders,
            b'B' => MacroStage::Body,
            b'E' => MacroStage::EndOfMessage,
            b'U' => MacroStage::Unknown,
            _ => return None,
        })
    }

    pub(crate) fn index(self) -> usize {
        match self {
            MacroStage::Connect => 0,
            MacroStage::Helo => 1,
            MacroStage::MailFrom => 2,
            MacroStage::RcptTo => 3,
            MacroStage::Data => 4,
            MacroStage::Header => 5,
            MacroStage::EndOfHeaders => 6,
            MacroStage::Body => 7,
            MacroStage::EndOfMessage => 8,
            MacroStage::Unknown => 9,
        }
    }
}
