//! The seam between a session and the application: a handler trait with one
//! method per stage, the declaration that drives options negotiation, and
//! the configured application bundle handed to the server.

mod builder;

pub use builder::MilterBuilder;

use crate::common::*;
use crate::proto::command::{Connect, Envelope, Header, Helo};
use crate::proto::flags::{ActionFlags, MacroStage};
use crate::proto::response::{BodyReply, EomReply, Verdict};
use crate::session::macros::MacroMap;

pub type HookResult<T> = crate::common::Result<T>;

/// Per-session application logic. One instance is created per MTA
/// connection by the [`Milter`]'s factory and dropped when it closes.
///
/// Every method defaults to "no decision", so an implementation overrides
/// exactly the stages it declares in its [`AppDecl`]. Returning `None` from
/// a stage hook means no reply goes on the wire, which is only sound for
/// stages declared silent; the session logs and repairs anything else.
pub trait MilterHandler: Send + Sync {
    fn on_connect<'f>(
        &'f mut self,
        connect: Connect,
        macros: MacroMap,
    ) -> S1Fut<'f, HookResult<Option<Verdict>>> {
        let _ = (connect, macros);
        Box::pin(ready(Ok(None)))
    }

    fn on_helo<'f>(
        &'f mut self,
        helo: Helo,
        macros: MacroMap,
    ) -> S1Fut<'f, HookResult<Option<Verdict>>> {
        let _ = (helo, macros);
        Box::pin(ready(Ok(None)))
    }

    fn on_mail_from<'f>(
        &'f mut self,
        envelope: Envelope,
        macros: MacroMap,
    ) -> S1Fut<'f, HookResult<Option<Verdict>>> {
        let _ = (envelope, macros);
        Box::pin(ready(Ok(None)))
    }

    /// Called once per recipient.
    fn on_rcpt_to<'f>(
        &'f mut self,
        envelope: Envelope,
        macros: MacroMap,
    ) -> S1Fut<'f, HookResult<Option<Verdict>>> {
        let _ = (envelope, macros);
        Box::pin(ready(Ok(None)))
    }

    fn on_data<'f>(&'f mut self, macros: MacroMap) -> S1Fut<'f, HookResult<Option<Verdict>>> {
        let _ = macros;
        Box::pin(ready(Ok(None)))
    }

    /// Called once per message header.
    fn on_header<'f>(
        &'f mut self,
        header: Header,
        macros: MacroMap,
    ) -> S1Fut<'f, HookResult<Option<Verdict>>> {
        let _ = (header, macros);
        Box::pin(ready(Ok(None)))
    }

    fn on_end_of_headers<'f>(
        &'f mut self,
        macros: MacroMap,
    ) -> S1Fut<'f, HookResult<Option<Verdict>>> {
        let _ = macros;
        Box::pin(ready(Ok(None)))
    }

    fn on_body_chunk<'f>(
        &'f mut self,
        chunk: Vec<u8>,
        macros: MacroMap,
    ) -> S1Fut<'f, HookResult<Option<BodyReply>>> {
        let _ = (chunk, macros);
        Box::pin(ready(Ok(None)))
    }

    /// The one stage that always answers; the default accepts nothing and
    /// changes nothing, it just lets the message continue.
    fn on_end_of_message<'f>(&'f mut self, macros: MacroMap) -> S1Fut<'f, HookResult<EomReply>> {
        let _ = macros;
        Box::pin(ready(Ok(EomReply::default())))
    }

    /// Unknown SMTP verb seen by the MTA.
    fn on_unknown<'f>(
        &'f mut self,
        verb: Vec<u8>,
        macros: MacroMap,
    ) -> S1Fut<'f, HookResult<Option<Verdict>>> {
        let _ = (verb, macros);
        Box::pin(ready(Ok(None)))
    }

    /// The MTA dropped the current transaction. Macros survive an abort,
    /// transaction state should not.
    fn on_abort<'f>(&'f mut self) -> S1Fut<'f, HookResult<()>> {
        Box::pin(ready(Ok(())))
    }

    fn on_quit<'f>(&'f mut self) -> S1Fut<'f, HookResult<()>> {
        Box::pin(ready(Ok(())))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum HookMode {
    Absent,
    Silent,
    Replying,
}

/// What the application declares up front: which stage hooks exist, whether
/// each replies, and which manipulations it must be allowed to perform.
/// Consumed by options negotiation; see
/// [`negotiate`](crate::session::negotiate::negotiate).
#[derive(Debug, Clone)]
pub struct AppDecl {
    hooks: [HookMode; 10],
    actions: ActionFlags,
    /// Ask the MTA to also report recipients it already rejected.
    pub include_rejected_rcpts: bool,
    /// Offer to skip remaining body chunks once the hook says so.
    pub allow_body_skip: bool,
    /// Ask the MTA to keep the leading space byte of header values.
    pub headers_with_leading_space: bool,
    /// Per-stage macro interest; an empty name list mutes the stage.
    pub symbols: Vec<(MacroStage, Vec<String>)>,
}

impl Default for AppDecl {
    fn default() -> Self {
        AppDecl {
            hooks: [HookMode::Absent; 10],
            actions: ActionFlags::empty(),
            include_rejected_rcpts: false,
            allow_body_skip: true,
            headers_with_leading_space: false,
            symbols: vec![],
        }
    }
}

impl AppDecl {
    /// Declare a hook for `stage`; a non-`replying` hook promises the MTA it
    /// will never answer there.
    pub fn declare(&mut self, stage: MacroStage, replying: bool) {
        self.hooks[stage.index()] = if replying {
            HookMode::Replying
        } else {
            HookMode::Silent
        };
    }

    /// Declare a required manipulation capability.
    pub fn require(&mut self, actions: ActionFlags) {
        self.actions.insert(actions);
    }

    pub fn handles(&self, stage: MacroStage) -> bool {
        self.hooks[stage.index()] != HookMode::Absent
    }

    pub fn replies(&self, stage: MacroStage) -> bool {
        self.hooks[stage.index()] == HookMode::Replying
    }

    pub fn actions(&self) -> ActionFlags {
        self.actions
    }
}

/// Factory producing one handler per session, keyed by the session id for
/// log correlation.
pub type HandlerFactory = Arc<dyn Fn(SessionId) -> Box<dyn MilterHandler> + Send + Sync>;

/// A configured milter application: a name for the logs, the negotiation
/// declaration, and the per-session handler factory.
#[derive(Clone)]
pub struct Milter {
    name: String,
    decl: AppDecl,
    factory: HandlerFactory,
}

impl Milter {
    pub fn new(
        name: impl Into<String>,
        decl: AppDecl,
        factory: HandlerFactory,
    ) -> Self {
        Milter {
            name: name.into(),
            decl,
            factory,
        }
    }

    /// Start declaring hooks for a closure-based milter.
    pub fn builder(name: impl Into<String>) -> MilterBuilder {
        MilterBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn decl(&self) -> &AppDecl {
        &self.decl
    }

    pub fn handler(&self, id: SessionId) -> Box<dyn MilterHandler> {
        (self.factory)(id)
    }
}

impl fmt::Debug for Milter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Milter")
            .field("name", &self.name)
            .field("decl", &self.decl)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decl_defaults_to_nothing_declared() {
        let decl = AppDecl::default();
        for stage in MacroStage::ALL {
            assert!(!decl.handles(stage));
            assert!(!decl.replies(stage));
        }
        assert_eq!(decl.actions(), ActionFlags::empty());
        assert!(decl.allow_body_skip);
    }

    #[test]
    fn declared_stages_are_tracked() {
        let mut decl = AppDecl::default();
        decl.declare(MacroStage::RcptTo, true);
        decl.declare(MacroStage::Header, false);
        assert!(decl.handles(MacroStage::RcptTo));
        assert!(decl.replies(MacroStage::RcptTo));
        assert!(decl.handles(MacroStage::Header));
        assert!(!decl.replies(MacroStage::Header));
        assert!(!decl.handles(MacroStage::Body));
    }

    #[test]
    fn default_handler_stays_quiet() {
        struct Noop;
        impl MilterHandler for Noop {}

        let mut handler = Noop;
        let verdict =
            async_std::task::block_on(handler.on_data(MacroMap::default())).expect("ok");
        assert_eq!(verdict, None);
        let reply = async_std::task::block_on(handler.on_end_of_message(MacroMap::default()))
            .expect("ok");
        assert_eq!(reply, EomReply::default());
    }
}
