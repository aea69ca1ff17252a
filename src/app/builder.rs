//! Closure-based milter assembly.
//!
//! `on_*` registrations reply to the MTA and their stage is negotiated as a
//! replying callback; `observe_*` registrations only watch, which lets the
//! session promise the MTA a no-reply stage and saves a round trip. Either
//! registration also clears the stage's no-call bit, so the MTA sends it at
//! all. Capabilities (`can_*`) become the action flags claimed during
//! negotiation - a manipulation returned at end of message without its
//! capability is dropped on the floor with a diagnostic.

use super::{AppDecl, HookResult, Milter, MilterHandler};
use crate::common::*;
use crate::proto::command::{Connect, Envelope, Header, Helo};
use crate::proto::flags::{ActionFlags, MacroStage};
use crate::proto::response::{BodyReply, EomReply, Verdict};
use crate::session::macros::MacroMap;

type CommandHook<C, R> =
    Arc<dyn Fn(C, MacroMap) -> S1Fut<'static, HookResult<R>> + Send + Sync>;
type BareHook<R> = Arc<dyn Fn(MacroMap) -> S1Fut<'static, HookResult<R>> + Send + Sync>;
type PlainHook = Arc<dyn Fn() -> S1Fut<'static, HookResult<()>> + Send + Sync>;

#[derive(Clone, Default)]
struct HookSet {
    connect: Option<CommandHook<Connect, Option<Verdict>>>,
    helo: Option<CommandHook<Helo, Option<Verdict>>>,
    mail_from: Option<CommandHook<Envelope, Option<Verdict>>>,
    rcpt_to: Option<CommandHook<Envelope, Option<Verdict>>>,
    data: Option<BareHook<Option<Verdict>>>,
    header: Option<CommandHook<Header, Option<Verdict>>>,
    end_of_headers: Option<BareHook<Option<Verdict>>>,
    body_chunk: Option<CommandHook<Vec<u8>, Option<BodyReply>>>,
    end_of_message: Option<BareHook<EomReply>>,
    unknown: Option<CommandHook<Vec<u8>, Option<Verdict>>>,
    abort: Option<PlainHook>,
    quit: Option<PlainHook>,
}

impl MilterHandler for HookSet {
    fn on_connect<'f>(
        &'f mut self,
        connect: Connect,
        macros: MacroMap,
    ) -> S1Fut<'f, HookResult<Option<Verdict>>> {
        match &self.connect {
            Some(hook) => hook(connect, macros),
            None => Box::pin(ready(Ok(None))),
        }
    }

    fn on_helo<'f>(
        &'f mut self,
        helo: Helo,
        macros: MacroMap,
    ) -> S1Fut<'f, HookResult<Option<Verdict>>> {
        match &self.helo {
            Some(hook) => hook(helo, macros),
            None => Box::pin(ready(Ok(None))),
        }
    }

    fn on_mail_from<'f>(
        &'f mut self,
        envelope: Envelope,
        macros: MacroMap,
    ) -> S1Fut<'f, HookResult<Option<Verdict>>> {
        match &self.mail_from {
            Some(hook) => hook(envelope, macros),
            None => Box::pin(ready(Ok(None))),
        }
    }

    fn on_rcpt_to<'f>(
        &'f mut self,
        envelope: Envelope,
        macros: MacroMap,
    ) -> S1Fut<'f, HookResult<Option<Verdict>>> {
        match &self.rcpt_to {
            Some(hook) => hook(envelope, macros),
            None => Box::pin(ready(Ok(None))),
        }
    }

    fn on_data<'f>(&'f mut self, macros: MacroMap) -> S1Fut<'f, HookResult<Option<Verdict>>> {
        match &self.data {
            Some(hook) => hook(macros),
            None => Box::pin(ready(Ok(None))),
        }
    }

    fn on_header<'f>(
        &'f mut self,
        header: Header,
        macros: MacroMap,
    ) -> S1Fut<'f, HookResult<Option<Verdict>>> {
        match &self.header {
            Some(hook) => hook(header, macros),
            None => Box::pin(ready(Ok(None))),
        }
    }

    fn on_end_of_headers<'f>(
        &'f mut self,
        macros: MacroMap,
    ) -> S1Fut<'f, HookResult<Option<Verdict>>> {
        match &self.end_of_headers {
            Some(hook) => hook(macros),
            None => Box::pin(ready(Ok(None))),
        }
    }

    fn on_body_chunk<'f>(
        &'f mut self,
        chunk: Vec<u8>,
        macros: MacroMap,
    ) -> S1Fut<'f, HookResult<Option<BodyReply>>> {
        match &self.body_chunk {
            Some(hook) => hook(chunk, macros),
            None => Box::pin(ready(Ok(None))),
        }
    }

    fn on_end_of_message<'f>(&'f mut self, macros: MacroMap) -> S1Fut<'f, HookResult<EomReply>> {
        match &self.end_of_message {
            Some(hook) => hook(macros),
            None => Box::pin(ready(Ok(EomReply::default()))),
        }
    }

    fn on_unknown<'f>(
        &'f mut self,
        verb: Vec<u8>,
        macros: MacroMap,
    ) -> S1Fut<'f, HookResult<Option<Verdict>>> {
        match &self.unknown {
            Some(hook) => hook(verb, macros),
            None => Box::pin(ready(Ok(None))),
        }
    }

    fn on_abort<'f>(&'f mut self) -> S1Fut<'f, HookResult<()>> {
        match &self.abort {
            Some(hook) => hook(),
            None => Box::pin(ready(Ok(()))),
        }
    }

    fn on_quit<'f>(&'f mut self) -> S1Fut<'f, HookResult<()>> {
        match &self.quit {
            Some(hook) => hook(),
            None => Box::pin(ready(Ok(()))),
        }
    }
}

/// Collects hooks and capabilities, then produces a [`Milter`].
pub struct MilterBuilder {
    name: String,
    decl: AppDecl,
    hooks: HookSet,
}

macro_rules! verdict_hooks {
    ($(#[$doc:meta])* $on:ident, $observe:ident, $slot:ident, $command:ty, $stage:expr) => {
        $(#[$doc])*
        pub fn $on<F, Fut>(mut self, hook: F) -> Self
        where
            F: Fn($command, MacroMap) -> Fut + Send + Sync + 'static,
            Fut: Future<Output = HookResult<Verdict>> + Send + 'static,
        {
            self.decl.declare($stage, true);
            self.hooks.$slot = Some(Arc::new(move |command, macros| {
                let fut = hook(command, macros);
                Box::pin(async move { fut.await.map(Some) })
            }));
            self
        }

        /// Like the replying registration, but the stage is negotiated
        /// silent: the hook only watches and the MTA does not wait.
        pub fn $observe<F, Fut>(mut self, hook: F) -> Self
        where
            F: Fn($command, MacroMap) -> Fut + Send + Sync + 'static,
            Fut: Future<Output = HookResult<()>> + Send + 'static,
        {
            self.decl.declare($stage, false);
            self.hooks.$slot = Some(Arc::new(move |command, macros| {
                let fut = hook(command, macros);
                Box::pin(async move { fut.await.map(|()| None) })
            }));
            self
        }
    };
}

macro_rules! bare_verdict_hooks {
    ($(#[$doc:meta])* $on:ident, $observe:ident, $slot:ident, $stage:expr) => {
        $(#[$doc])*
        pub fn $on<F, Fut>(mut self, hook: F) -> Self
        where
            F: Fn(MacroMap) -> Fut + Send + Sync + 'static,
            Fut: Future<Output = HookResult<Verdict>> + Send + 'static,
        {
            self.decl.declare($stage, true);
            self.hooks.$slot = Some(Arc::new(move |macros| {
                let fut = hook(macros);
                Box::pin(async move { fut.await.map(Some) })
            }));
            self
        }

        /// Like the replying registration, but the stage is negotiated
        /// silent: the hook only watches and the MTA does not wait.
        pub fn $observe<F, Fut>(mut self, hook: F) -> Self
        where
            F: Fn(MacroMap) -> Fut + Send + Sync + 'static,
            Fut: Future<Output = HookResult<()>> + Send + 'static,
        {
            self.decl.declare($stage, false);
            self.hooks.$slot = Some(Arc::new(move |macros| {
                let fut = hook(macros);
                Box::pin(async move { fut.await.map(|()| None) })
            }));
            self
        }
    };
}

impl MilterBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        MilterBuilder {
            name: name.into(),
            decl: AppDecl::default(),
            hooks: HookSet::default(),
        }
    }

    verdict_hooks!(
        /// Decide on the SMTP client connection.
        on_connect, observe_connect, connect, Connect, MacroStage::Connect
    );
    verdict_hooks!(
        /// Decide on HELO/EHLO.
        on_helo, observe_helo, helo, Helo, MacroStage::Helo
    );
    verdict_hooks!(
        /// Decide on the envelope sender.
        on_mail_from, observe_mail_from, mail_from, Envelope, MacroStage::MailFrom
    );
    verdict_hooks!(
        /// Decide on each envelope recipient.
        on_rcpt_to, observe_rcpt_to, rcpt_to, Envelope, MacroStage::RcptTo
    );
    bare_verdict_hooks!(
        /// Decide at the DATA command.
        on_data, observe_data, data, MacroStage::Data
    );
    verdict_hooks!(
        /// Decide on each message header.
        on_header, observe_header, header, Header, MacroStage::Header
    );
    bare_verdict_hooks!(
        /// Decide once all headers are in.
        on_end_of_headers, observe_end_of_headers, end_of_headers, MacroStage::EndOfHeaders
    );
    verdict_hooks!(
        /// Decide on unknown SMTP verbs.
        on_unknown, observe_unknown, unknown, Vec<u8>, MacroStage::Unknown
    );

    /// Decide on each body chunk; may also return
    /// [`BodyReply::Skip`](crate::BodyReply::Skip) to stop receiving body.
    pub fn on_body_chunk<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Vec<u8>, MacroMap) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HookResult<BodyReply>> + Send + 'static,
    {
        self.decl.declare(MacroStage::Body, true);
        self.hooks.body_chunk = Some(Arc::new(move |chunk, macros| {
            let fut = hook(chunk, macros);
            Box::pin(async move { fut.await.map(Some) })
        }));
        self
    }

    /// Watch body chunks without replying to each.
    pub fn observe_body_chunk<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Vec<u8>, MacroMap) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HookResult<()>> + Send + 'static,
    {
        self.decl.declare(MacroStage::Body, false);
        self.hooks.body_chunk = Some(Arc::new(move |chunk, macros| {
            let fut = hook(chunk, macros);
            Box::pin(async move { fut.await.map(|()| None) })
        }));
        self
    }

    /// Produce the final verdict and any manipulations for the message.
    pub fn on_end_of_message<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(MacroMap) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HookResult<EomReply>> + Send + 'static,
    {
        self.decl.declare(MacroStage::EndOfMessage, true);
        self.hooks.end_of_message = Some(Arc::new(move |macros| {
            let fut = hook(macros);
            Box::pin(fut)
        }));
        self
    }

    /// Run when the MTA drops the current transaction.
    pub fn on_abort<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HookResult<()>> + Send + 'static,
    {
        self.hooks.abort = Some(Arc::new(move || Box::pin(hook())));
        self
    }

    /// Run when the MTA closes the session.
    pub fn on_quit<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HookResult<()>> + Send + 'static,
    {
        self.hooks.quit = Some(Arc::new(move || Box::pin(hook())));
        self
    }

    pub fn can_add_headers(mut self) -> Self {
        self.decl.require(ActionFlags::ADD_HEADER);
        self
    }

    pub fn can_change_headers(mut self) -> Self {
        self.decl.require(ActionFlags::CHANGE_HEADER);
        self
    }

    pub fn can_change_body(mut self) -> Self {
        self.decl.require(ActionFlags::CHANGE_BODY);
        self
    }

    pub fn can_add_recipients(mut self) -> Self {
        self.decl.require(ActionFlags::ADD_RCPT);
        self
    }

    pub fn can_add_recipients_with_args(mut self) -> Self {
        self.decl.require(ActionFlags::ADD_RCPT_PAR);
        self
    }

    pub fn can_remove_recipients(mut self) -> Self {
        self.decl.require(ActionFlags::DELETE_RCPT);
        self
    }

    pub fn can_change_mail_from(mut self) -> Self {
        self.decl.require(ActionFlags::CHANGE_FROM);
        self
    }

    pub fn can_quarantine(mut self) -> Self {
        self.decl.require(ActionFlags::QUARANTINE);
        self
    }

    /// Also deliver recipients the MTA already rejected.
    pub fn include_rejected_recipients(mut self) -> Self {
        self.decl.include_rejected_rcpts = true;
        self
    }

    /// Ask the MTA to keep the leading space byte of header values.
    pub fn headers_with_leading_space(mut self) -> Self {
        self.decl.headers_with_leading_space = true;
        self
    }

    /// Restrict which macros the MTA sends ahead of `stage`. An empty list
    /// mutes the stage's macros entirely.
    pub fn restrict_symbols(
        mut self,
        stage: MacroStage,
        names: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.decl
            .symbols
            .push((stage, names.into_iter().map(Into::into).collect()));
        self
    }

    pub fn build(self) -> Milter {
        let hooks = self.hooks;
        Milter::new(
            self.name,
            self.decl,
            Arc::new(move |_id| Box::new(hooks.clone())),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_await_test::async_test;

    #[async_test]
    async fn replying_hook_declares_and_runs() {
        let milter = Milter::builder("test")
            .on_mail_from(|envelope, _macros| async move {
                assert_eq!(envelope.address, b"a@b.c");
                Ok(Verdict::Reject)
            })
            .build();

        assert!(milter.decl().handles(MacroStage::MailFrom));
        assert!(milter.decl().replies(MacroStage::MailFrom));
        assert!(!milter.decl().handles(MacroStage::Connect));

        let mut handler = milter.handler(SessionId::generate());
        let verdict = handler
            .on_mail_from(
                Envelope {
                    address: b"a@b.c".to_vec(),
                    params: Default::default(),
                },
                MacroMap::default(),
            )
            .await
            .expect("hook runs");
        assert_eq!(verdict, Some(Verdict::Reject));
    }

    #[async_test]
    async fn observer_hook_returns_no_reply() {
        let milter = Milter::builder("test")
            .observe_header(|_header, _macros| async move { Ok(()) })
            .build();

        assert!(milter.decl().handles(MacroStage::Header));
        assert!(!milter.decl().replies(MacroStage::Header));

        let mut handler = milter.handler(SessionId::generate());
        let verdict = handler
            .on_header(
                Header {
                    name: b"From".to_vec(),
                    value: b"x".to_vec(),
                },
                MacroMap::default(),
            )
            .await
            .expect("hook runs");
        assert_eq!(verdict, None);
    }

    #[async_test]
    async fn undeclared_stage_stays_quiet() {
        let milter = Milter::builder("test").build();
        let mut handler = milter.handler(SessionId::generate());
        assert_eq!(
            handler.on_data(MacroMap::default()).await.expect("ok"),
            None
        );
        assert_eq!(
            handler
                .on_end_of_message(MacroMap::default())
                .await
                .expect("ok"),
            EomReply::default()
        );
    }

    #[test]
    fn capabilities_become_action_flags() {
        let milter = Milter::builder("test")
            .can_add_headers()
            .can_quarantine()
            .build();
        assert_eq!(
            milter.decl().actions(),
            ActionFlags::ADD_HEADER | ActionFlags::QUARANTINE
        );
    }
}
