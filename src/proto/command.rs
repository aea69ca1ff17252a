//! Commands the MTA sends, decoded from frame bodies.
//!
//! Field bytes are preserved as received; the protocol makes no character
//! set promise for addresses, header values or macro values, so neither
//! does this module.

use crate::proto::flags::{ActionFlags, MacroStage, ProtocolFlags};
use std::net::{Ipv4Addr, Ipv6Addr};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unknown command code {code:#04x}")]
    UnknownCode { code: u8 },
    #[error("unexpected payload for {command}")]
    UnexpectedPayload { command: &'static str },
    #[error("{command}: field is not NUL-terminated")]
    MissingTerminator { command: &'static str },
    #[error("{command}: {detail}")]
    Malformed {
        command: &'static str,
        detail: &'static str,
    },
    #[error("unsupported address family {family:#04x}")]
    BadAddressFamily { family: u8 },
    #[error("cannot parse {family} address literal {literal:?}")]
    BadAddress {
        family: &'static str,
        literal: String,
    },
    #[error("duplicate ESMTP parameter {name:?}")]
    DuplicateParam { name: String },
    #[error("macro data does not split into symbol/value pairs")]
    UnpairedMacro,
}

/// Where the MTA says the SMTP client came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectInfo {
    Ipv4 { addr: Ipv4Addr, port: u16 },
    Ipv6 { addr: Ipv6Addr, port: u16 },
    Unix { path: Vec<u8> },
    /// The MTA could not establish the client address; the connect hostname
    /// carries whatever description it had, the literal whatever followed.
    Unknown { literal: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub hostname: Vec<u8>,
    pub info: ConnectInfo,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Helo {
    pub hostname: Vec<u8>,
}

/// ESMTP parameters of a MAIL FROM / RCPT TO, in wire order. A parameter is
/// either a bare keyword or `KEY=VALUE`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EsmtpParams(Vec<(Vec<u8>, Option<Vec<u8>>)>);

impl EsmtpParams {
    pub fn get(&self, key: &[u8]) -> Option<&Option<Vec<u8>>> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[u8], Option<&[u8]>)> {
        self.0.iter().map(|(k, v)| (k.as_slice(), v.as_deref()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    fn push(&mut self, key: Vec<u8>, value: Option<Vec<u8>>) -> Result<(), DecodeError> {
        if self.0.iter().any(|(k, _)| k.eq_ignore_ascii_case(&key)) {
            return Err(DecodeError::DuplicateParam {
                name: String::from_utf8_lossy(&key).into_owned(),
            });
        }
        self.0.push((key, value));
        Ok(())
    }
}

/// Envelope address of a MAIL FROM or RCPT TO, angle brackets stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub address: Vec<u8>,
    pub params: EsmtpParams,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: Vec<u8>,
    pub value: Vec<u8>,
}

impl Header {
    /// Header names compare ASCII-case-insensitively.
    pub fn name_is(&self, name: &[u8]) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    OptionsNegotiate {
        version: u32,
        actions: ActionFlags,
        protocol: ProtocolFlags,
    },
    DefineMacro {
        stage: MacroStage,
        macros: Vec<(Vec<u8>, Vec<u8>)>,
    },
    Connect(Connect),
    Helo(Helo),
    MailFrom(Envelope),
    RcptTo(Envelope),
    Data,
    Header(Header),
    EndOfHeaders,
    BodyChunk(Vec<u8>),
    EndOfMessage,
    Abort,
    Quit,
    QuitNewConnection,
    Unknown(Vec<u8>),
}

impl Command {
    /// Decode one frame body. `code` is the leading byte of the frame.
    pub fn decode(code: u8, body: &[u8]) -> Result<Command, DecodeError> {
        match code {
            b'O' => decode_options_negotiate(body),
            b'D' => decode_define_macro(body),
            b'C' => decode_connect(body),
            b'H' => Ok(Command::Helo(Helo {
                hostname: take_terminated(body, "helo")?.0.to_vec(),
            })),
            b'M' => Ok(Command::MailFrom(decode_envelope(body, "mail-from")?)),
            b'R' => Ok(Command::RcptTo(decode_envelope(body, "rcpt-to")?)),
            b'T' => dataless(Command::Data, body, "data"),
            b'L' => decode_header(body),
            b'N' => dataless(Command::EndOfHeaders, body, "end-of-headers"),
            b'B' => Ok(Command::BodyChunk(body.to_vec())),
            b'E' => dataless(Command::EndOfMessage, body, "end-of-message"),
            b'A' => dataless(Command::Abort, body, "abort"),
            b'Q' => dataless(Command::Quit, body, "quit"),
            b'K' => dataless(Command::QuitNewConnection, body, "quit-new-connection"),
            b'U' => Ok(Command::Unknown(strip_terminator(body).to_vec())),
            code => Err(DecodeError::UnknownCode { code }),
        }
    }

    /// Short name for log lines and violation reports.
    pub fn verb(&self) -> &'static str {
        match self {
            Command::OptionsNegotiate { .. } => "options-negotiate",
            Command::DefineMacro { .. } => "define-macro",
            Command::Connect(_) => "connect",
            Command::Helo(_) => "helo",
            Command::MailFrom(_) => "mail-from",
            Command::RcptTo(_) => "rcpt-to",
            Command::Data => "data",
            Command::Header(_) => "header",
            Command::EndOfHeaders => "end-of-headers",
            Command::BodyChunk(_) => "body-chunk",
            Command::EndOfMessage => "end-of-message",
            Command::Abort => "abort",
            Command::Quit => "quit",
            Command::QuitNewConnection => "quit-new-connection",
            Command::Unknown(_) => "unknown",
        }
    }
}

fn dataless(
    command: Command,
    body: &[u8],
    name: &'static str,
) -> Result<Command, DecodeError> {
    if body.is_empty() {
        Ok(command)
    } else {
        Err(DecodeError::UnexpectedPayload { command: name })
    }
}

/// First NUL-terminated field and the rest.
fn take_terminated<'a>(
    data: &'a [u8],
    command: &'static str,
) -> Result<(&'a [u8], &'a [u8]), DecodeError> {
    match data.iter().position(|b| *b == 0) {
        Some(at) => Ok((&data[..at], &data[at + 1..])),
        None => Err(DecodeError::MissingTerminator { command }),
    }
}

fn strip_terminator(data: &[u8]) -> &[u8] {
    match data.last() {
        Some(0) => &data[..data.len() - 1],
        _ => data,
    }
}

/// Split a NUL-terminated array of fields, requiring the final terminator.
fn decode_array<'a>(
    data: &'a [u8],
    command: &'static str,
) -> Result<Vec<&'a [u8]>, DecodeError> {
    if data.is_empty() {
        return Ok(vec![]);
    }
    match data.last() {
        Some(0) => Ok(data[..data.len() - 1].split(|b| *b == 0).collect()),
        _ => Err(DecodeError::MissingTerminator { command }),
    }
}

fn decode_options_negotiate(body: &[u8]) -> Result<Command, DecodeError> {
    if body.len() != 12 {
        return Err(DecodeError::Malformed {
            command: "options-negotiate",
            detail: "expected exactly three 32-bit words",
        });
    }
    let word = |at: usize| {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&body[at..at + 4]);
        u32::from_be_bytes(bytes)
    };
    Ok(Command::OptionsNegotiate {
        version: word(0),
        actions: ActionFlags::from_bits(word(4)),
        protocol: ProtocolFlags::from_bits(word(8)),
    })
}

fn decode_define_macro(body: &[u8]) -> Result<Command, DecodeError> {
    let stage_byte = *body.first().ok_or(DecodeError::Malformed {
        command: "define-macro",
        detail: "missing stage byte",
    })?;
    let stage = MacroStage::from_command_byte(stage_byte).ok_or(DecodeError::Malformed {
        command: "define-macro",
        detail: "stage byte names no known stage",
    })?;
    let items = decode_array(&body[1..], "define-macro")?;
    if items.len() % 2 != 0 {
        return Err(DecodeError::UnpairedMacro);
    }
    let macros = items
        .chunks(2)
        .map(|pair| (pair[0].to_vec(), pair[1].to_vec()))
        .collect();
    Ok(Command::DefineMacro { stage, macros })
}

fn decode_connect(body: &[u8]) -> Result<Command, DecodeError> {
    let (hostname, socket_data) = take_terminated(body, "connect")?;
    let family = *socket_data.first().ok_or(DecodeError::Malformed {
        command: "connect",
        detail: "socket data empty",
    })?;
    let info = match family {
        b'4' | b'6' => {
            // family byte, u16be port, address literal
            if socket_data.len() < 6 {
                return Err(DecodeError::Malformed {
                    command: "connect",
                    detail: "socket data too short for an IP address",
                });
            }
            let port = u16::from_be_bytes([socket_data[1], socket_data[2]]);
            let literal = strip_terminator(&socket_data[3..]);
            let literal_str =
                std::str::from_utf8(literal).map_err(|_| DecodeError::BadAddress {
                    family: ip_family_name(family),
                    literal: String::from_utf8_lossy(literal).into_owned(),
                })?;
            if family == b'4' {
                let addr = literal_str.parse::<Ipv4Addr>().map_err(|_| {
                    DecodeError::BadAddress {
                        family: "IPv4",
                        literal: literal_str.to_owned(),
                    }
                })?;
                ConnectInfo::Ipv4 { addr, port }
            } else {
                let addr = literal_str.parse::<Ipv6Addr>().map_err(|_| {
                    DecodeError::BadAddress {
                        family: "IPv6",
                        literal: literal_str.to_owned(),
                    }
                })?;
                ConnectInfo::Ipv6 { addr, port }
            }
        }
        b'L' => {
            if socket_data.len() < 3 {
                return Err(DecodeError::Malformed {
                    command: "connect",
                    detail: "socket data too short for a unix socket path",
                });
            }
            ConnectInfo::Unix {
                path: strip_terminator(&socket_data[3..]).to_vec(),
            }
        }
        b'U' => ConnectInfo::Unknown {
            literal: strip_terminator(&socket_data[1..]).to_vec(),
        },
        family => return Err(DecodeError::BadAddressFamily { family }),
    };
    Ok(Command::Connect(Connect {
        hostname: hostname.to_vec(),
        info,
    }))
}

fn ip_family_name(family: u8) -> &'static str {
    if family == b'4' {
        "IPv4"
    } else {
        "IPv6"
    }
}

fn decode_envelope(body: &[u8], command: &'static str) -> Result<Envelope, DecodeError> {
    let (address_field, rest) = take_terminated(body, command)?;
    if address_field.is_empty() && rest.is_empty() {
        return Err(DecodeError::Malformed {
            command,
            detail: "envelope address is empty",
        });
    }
    let address = if address_field.first() == Some(&b'<') && address_field.last() == Some(&b'>') {
        address_field[1..address_field.len() - 1].to_vec()
    } else {
        warn!(
            "{} address {:?} not enclosed in angle brackets",
            command,
            String::from_utf8_lossy(address_field)
        );
        address_field.to_vec()
    };

    let mut params = EsmtpParams::default();
    for token in decode_array(rest, command)? {
        // a leading '=' would make an empty keyword; treat it as part of none
        match token.iter().skip(1).position(|b| *b == b'=') {
            Some(at) => params.push(token[..at + 1].to_vec(), Some(token[at + 2..].to_vec()))?,
            None => params.push(token.to_vec(), None)?,
        }
    }
    Ok(Envelope { address, params })
}

fn decode_header(body: &[u8]) -> Result<Command, DecodeError> {
    let fields = decode_array(body, "header")?;
    if fields.len() != 2 {
        return Err(DecodeError::Malformed {
            command: "header",
            detail: "expected exactly name and value",
        });
    }
    Ok(Command::Header(Header {
        name: fields[0].to_vec(),
        value: fields[1].to_vec(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(code: u8, body: &[u8]) -> Command {
        Command::decode(code, body).expect("decodes")
    }

    #[test]
    fn options_negotiate() {
        let cmd = decode(b'O', b"\x00\x00\x00\x06\x00\x00\x01\xff\x00\x1f\xff\xff");
        assert_eq!(
            cmd,
            Command::OptionsNegotiate {
                version: 6,
                actions: ActionFlags::from_bits(0x1ff),
                protocol: ProtocolFlags::from_bits(0x1f_ffff),
            }
        );
    }

    #[test]
    fn options_negotiate_wrong_size() {
        assert!(Command::decode(b'O', b"\x00\x00\x00\x06").is_err());
        assert!(Command::decode(b'O', b"").is_err());
    }

    #[test]
    fn connect_ipv4() {
        let cmd = decode(b'C', b"[172.17.0.1]\x004\xc36172.17.0.1\x00");
        assert_eq!(
            cmd,
            Command::Connect(Connect {
                hostname: b"[172.17.0.1]".to_vec(),
                info: ConnectInfo::Ipv4 {
                    addr: "172.17.0.1".parse().unwrap(),
                    port: 49974,
                },
            })
        );
    }

    #[test]
    fn connect_ipv6_with_reverse_dns() {
        let cmd = decode(
            b'C',
            b"mail-oi1-x234.google.com\x006\x82.2607:f8b0:4864:20::234\x00",
        );
        assert_eq!(
            cmd,
            Command::Connect(Connect {
                hostname: b"mail-oi1-x234.google.com".to_vec(),
                info: ConnectInfo::Ipv6 {
                    addr: "2607:f8b0:4864:20::234".parse().unwrap(),
                    port: 33326,
                },
            })
        );
    }

    #[test]
    fn connect_unix_socket() {
        let cmd = decode(b'C', b"ignored_hostname\x00L\x00\x00/run/mysock\x00");
        assert_eq!(
            cmd,
            Command::Connect(Connect {
                hostname: b"ignored_hostname".to_vec(),
                info: ConnectInfo::Unix {
                    path: b"/run/mysock".to_vec(),
                },
            })
        );
    }

    #[test]
    fn connect_unknown_family() {
        let cmd = decode(b'C', b"unknown\x00U");
        assert_eq!(
            cmd,
            Command::Connect(Connect {
                hostname: b"unknown".to_vec(),
                info: ConnectInfo::Unknown { literal: vec![] },
            })
        );
    }

    #[test]
    fn connect_invalid() {
        // no NUL after hostname
        assert!(Command::decode(b'C', b"[172.17.0.1]").is_err());
        // no socket data at all
        assert!(Command::decode(b'C', b"[172.17.0.1]\x00").is_err());
        // socket data too short
        assert!(Command::decode(b'C', b"[172.17.0.1]\x004\xc361\x00").is_err());
        // not an address
        assert!(Command::decode(b'C', b"[256.17.0.1]\x004\xc36256.17.0.1\x00").is_err());
        assert!(Command::decode(
            b'C',
            b"[2607:f8b0::748]\x006\xa3\x162607:f8b0:4864:20:::748\x00"
        )
        .is_err());
        // there is no IPv5
        assert_eq!(
            Command::decode(b'C', b"[172.17.0.1]\x005\xc36172.17.0.1\x00"),
            Err(DecodeError::BadAddressFamily { family: b'5' })
        );
    }

    #[test]
    fn helo() {
        assert_eq!(
            decode(b'H', b"mx.example.com\x00"),
            Command::Helo(Helo {
                hostname: b"mx.example.com".to_vec(),
            })
        );
        // HELO bytes are preserved even when they are not valid UTF-8
        assert_eq!(
            decode(b'H', b"foo\xffbar\x00"),
            Command::Helo(Helo {
                hostname: b"foo\xffbar".to_vec(),
            })
        );
        assert!(Command::decode(b'H', b"foobar").is_err());
    }

    #[test]
    fn mail_from_plain() {
        let cmd = decode(b'M', b"<g@example.org>\x00");
        match cmd {
            Command::MailFrom(env) => {
                assert_eq!(env.address, b"g@example.org");
                assert!(env.params.is_empty());
            }
            other => panic!("expected mail-from, got {:?}", other),
        }
    }

    #[test]
    fn mail_from_with_params() {
        let cmd = decode(b'M', b"<test@example.com>\x00BODY=8BITMIME\x00FOO\x00");
        match cmd {
            Command::MailFrom(env) => {
                assert_eq!(env.address, b"test@example.com");
                assert_eq!(
                    env.params.get(b"BODY"),
                    Some(&Some(b"8BITMIME".to_vec()))
                );
                assert_eq!(env.params.get(b"FOO"), Some(&None));
                assert_eq!(env.params.get(b"BAR"), None);
                assert_eq!(env.params.len(), 2);
            }
            other => panic!("expected mail-from, got {:?}", other),
        }
    }

    #[test]
    fn rcpt_to_duplicate_param_is_an_error() {
        assert_eq!(
            Command::decode(b'R', b"<a@b.c>\x00FOO=1\x00FOO=2\x00"),
            Err(DecodeError::DuplicateParam {
                name: "FOO".to_owned(),
            })
        );
    }

    #[test]
    fn rcpt_without_brackets_is_taken_verbatim() {
        let cmd = decode(b'R', b"postmaster\x00");
        match cmd {
            Command::RcptTo(env) => assert_eq!(env.address, b"postmaster"),
            other => panic!("expected rcpt-to, got {:?}", other),
        }
    }

    #[test]
    fn empty_envelope_is_an_error() {
        assert!(Command::decode(b'M', b"\x00").is_err());
        assert!(Command::decode(b'M', b"").is_err());
    }

    #[test]
    fn header() {
        let cmd = decode(b'L', b"From\x00Display Name <user@example.com>\x00");
        match cmd {
            Command::Header(header) => {
                assert!(header.name_is(b"from"));
                assert_eq!(header.value, b"Display Name <user@example.com>");
            }
            other => panic!("expected header, got {:?}", other),
        }
    }

    #[test]
    fn header_value_spacing_is_untouched() {
        let cmd = decode(b'L', b"Subject\x00 leading space kept\x00");
        match cmd {
            Command::Header(header) => {
                assert_eq!(header.value, b" leading space kept");
            }
            other => panic!("expected header, got {:?}", other),
        }
    }

    #[test]
    fn header_needs_both_fields() {
        assert!(Command::decode(b'L', b"From\x00").is_err());
        assert!(Command::decode(b'L', b"From\x00a\x00b\x00").is_err());
    }

    #[test]
    fn body_chunk_is_raw() {
        assert_eq!(
            decode(b'B', b"some\r\nbody\x00bytes"),
            Command::BodyChunk(b"some\r\nbody\x00bytes".to_vec())
        );
        assert_eq!(decode(b'B', b""), Command::BodyChunk(vec![]));
    }

    #[test]
    fn define_macro() {
        let cmd = decode(b'D', b"Cj\x00myhost.sub.example.com\x00{daemon_addr}\x00172.17.0.2\x00");
        assert_eq!(
            cmd,
            Command::DefineMacro {
                stage: MacroStage::Connect,
                macros: vec![
                    (b"j".to_vec(), b"myhost.sub.example.com".to_vec()),
                    (b"{daemon_addr}".to_vec(), b"172.17.0.2".to_vec()),
                ],
            }
        );
    }

    #[test]
    fn define_macro_empty_list() {
        assert_eq!(
            decode(b'D', b"M"),
            Command::DefineMacro {
                stage: MacroStage::MailFrom,
                macros: vec![],
            }
        );
    }

    #[test]
    fn define_macro_invalid() {
        assert!(Command::decode(b'D', b"").is_err());
        // 'x' is not a stage
        assert!(Command::decode(b'D', b"xj\x00host\x00").is_err());
        // odd number of items
        assert_eq!(
            Command::decode(b'D', b"Cj\x00host\x00leftover\x00"),
            Err(DecodeError::UnpairedMacro)
        );
        // missing final NUL
        assert!(Command::decode(b'D', b"Cj\x00host").is_err());
    }

    #[test]
    fn dataless_commands_refuse_payload() {
        assert_eq!(decode(b'T', b""), Command::Data);
        assert_eq!(decode(b'N', b""), Command::EndOfHeaders);
        assert_eq!(decode(b'E', b""), Command::EndOfMessage);
        assert_eq!(decode(b'A', b""), Command::Abort);
        assert_eq!(decode(b'Q', b""), Command::Quit);
        assert_eq!(decode(b'K', b""), Command::QuitNewConnection);
        assert!(Command::decode(b'E', b"x").is_err());
        assert!(Command::decode(b'Q', b"x").is_err());
    }

    #[test]
    fn unknown_smtp_verb() {
        assert_eq!(decode(b'U', b"HELP\x00"), Command::Unknown(b"HELP".to_vec()));
        assert_eq!(decode(b'U', b"HELP"), Command::Unknown(b"HELP".to_vec()));
    }

    #[test]
    fn unknown_command_code() {
        assert_eq!(
            Command::decode(b'z', b""),
            Err(DecodeError::UnknownCode { code: b'z' })
        );
    }
}
