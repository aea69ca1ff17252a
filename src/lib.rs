//! A milter server library. Speak the Sendmail/Postfix milter protocol
//! (version 6) and plug per-message decision and manipulation logic into an
//! MTA pipeline.
//!
//! The MTA connects to the milter once per SMTP session and reports each
//! stage of it - connect, HELO, MAIL FROM, every RCPT TO, DATA, each header,
//! end of headers, body chunks, end of message. The application replies with
//! verdicts (continue, accept, reject, tempfail, discard...) and, at end of
//! message, with message manipulations (headers, body, envelope, quarantine).
//!
//! Declare hooks with [`MilterBuilder`], hand the result to [`MilterServer`]:
//!
//! ```no_run
//! use milterop::{BindConfig, Milter, MilterServer, Verdict};
//!
//! # #[async_std::main] async fn main() -> milterop::common::Result<()> {
//! let milter = Milter::builder("no-bananas")
//!     .on_mail_from(|envelope, _macros| async move {
//!         if envelope.address.starts_with(b"banana@") {
//!             Ok(Verdict::Reject)
//!         } else {
//!             Ok(Verdict::Continue)
//!         }
//!     })
//!     .build();
//!
//! MilterServer::new(milter)
//!     .serve(BindConfig::new("127.0.0.1", 9000))
//!     .await
//! # }
//! ```
//!
//! Only the hooks the application declares are negotiated with the MTA; the
//! rest of the SMTP session is skipped on the wire. One task serves one MTA
//! connection; sessions share nothing.

#[macro_use]
extern crate log;

pub mod app;
pub mod proto;
pub mod server;
pub mod session;

pub use app::{AppDecl, HookResult, Milter, MilterBuilder, MilterHandler};
pub use proto::command::{Command, Connect, ConnectInfo, Envelope, EsmtpParams, Header, Helo};
pub use proto::flags::{ActionFlags, MacroStage, ProtocolFlags};
pub use proto::response::{
    BodyReply, EomReply, EomVerdict, Manipulation, ReplyCode, Response, Verdict,
};
pub use server::{BindConfig, MilterServer};
pub use session::macros::MacroMap;
pub use session::{Session, SessionConfig, StopSignal};

pub mod common {
    pub type Error = Box<dyn std::error::Error + Send + Sync + 'static>;
    pub type Result<T> = std::result::Result<T, Error>;
    pub use async_std::io;
    pub use async_std::io::prelude::{ReadExt, WriteExt};
    pub use async_std::io::{Read, Write};
    pub use std::future::*;
    pub type S3Fut<T> = Pin<Box<dyn Future<Output = T> + Sync + Send + 'static>>;
    pub type S1Fut<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
    pub use std::fmt;
    pub use std::pin::Pin;
    pub use std::sync::Arc;
    pub use std::task::{Context, Poll};

    /// Short random token identifying one MTA connection in diagnostics.
    /// Never persisted, never sent on the wire.
    #[derive(Clone, Debug, PartialEq, Eq, Hash)]
    pub struct SessionId(String);

    impl SessionId {
        pub fn generate() -> Self {
            let full = uuid::Uuid::new_v4().simple().to_string();
            SessionId(full[..8].to_owned())
        }
        pub fn as_str(&self) -> &str {
            self.0.as_str()
        }
    }

    impl fmt::Display for SessionId {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.0)
        }
    }

    /// Lossy view of protocol bytes for log lines.
    pub fn display_bytes(bytes: &[u8]) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(bytes)
    }

}
