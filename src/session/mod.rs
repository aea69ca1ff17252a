//! One MTA connection, from accept to close.
//!
//! A session runs two halves: a reader task that turns the byte stream into
//! decoded commands and feeds them to a bounded queue, and the dispatch loop
//! that owns the write half. The queue bound is the backpressure on a slow
//! application; the dispatch loop takes commands strictly in arrival order
//! and writes each reply before taking the next command.

pub mod macros;
pub mod negotiate;
pub mod stage;

pub use stage::{ProtocolViolation, Stage};

use crate::app::{AppDecl, Milter, MilterHandler};
use crate::common::*;
use crate::proto::command::{Command, DecodeError};
use crate::proto::flags::{ActionFlags, MacroStage};
use crate::proto::packet::{FrameError, PacketCodec, DEFAULT_MAX_BODY};
use crate::proto::response::{BodyReply, EomReply, EomVerdict, Response, Verdict};
use async_std::channel::{bounded, Receiver, Sender};
use async_std::future::timeout;
use async_std::task;
use futures_util::io::{AsyncReadExt as _, AsyncWriteExt as _};
use futures_util::{pin_mut, select, FutureExt};
use macros::MacroMap;
use negotiate::{negotiate, Negotiated, NegotiateError};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Violation(#[from] ProtocolViolation),
    #[error("negotiation failed: {0}")]
    Negotiate(#[from] NegotiateError),
    #[error("hook for {stage} missed its deadline")]
    HookDeadline { stage: &'static str },
    #[error("hook for {stage} failed: {reason}")]
    HookFailure {
        stage: &'static str,
        reason: String,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cooperative shutdown")]
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Largest frame body accepted or produced.
    pub max_body_size: usize,
    /// Commands buffered between the reader and the dispatch loop.
    pub queue_capacity: usize,
    /// How long one hook invocation may take.
    pub hook_deadline: Duration,
    /// Verdict written when the end-of-message hook misses its deadline.
    pub eom_fallback: Verdict,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            max_body_size: DEFAULT_MAX_BODY,
            queue_capacity: 8,
            hook_deadline: Duration::from_secs(8),
            eom_fallback: Verdict::Tempfail,
        }
    }
}

/// Cooperative stop shared by the acceptor and its sessions. Cloned freely;
/// `trigger` wakes every `wait`er at once.
#[derive(Clone, Debug)]
pub struct StopSignal {
    guard: Arc<std::sync::Mutex<Option<Sender<()>>>>,
    watch: Receiver<()>,
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, rx) = bounded(1);
        StopSignal {
            guard: Arc::new(std::sync::Mutex::new(Some(tx))),
            watch: rx,
        }
    }

    pub fn trigger(&self) {
        if let Ok(mut guard) = self.guard.lock() {
            guard.take();
        }
    }

    pub fn triggered(&self) -> bool {
        self.watch.is_closed()
    }

    /// Resolves once the signal is triggered.
    pub async fn wait(&self) {
        let _ = self.watch.recv().await;
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        StopSignal::new()
    }
}

type QueueItem = std::result::Result<Command, SessionError>;

/// Per-connection state: the stage machine, the macro accumulator, the
/// frozen negotiation result and the application handler instance.
pub struct Session {
    id: SessionId,
    decl: AppDecl,
    handler: Box<dyn MilterHandler>,
    config: SessionConfig,
    stage: Stage,
    macros: MacroMap,
    negotiated: Option<Negotiated>,
}

impl Session {
    pub fn new(milter: &Milter, config: SessionConfig) -> Self {
        let id = SessionId::generate();
        let handler = milter.handler(id.clone());
        Session {
            id,
            decl: milter.decl().clone(),
            handler,
            config,
            stage: Stage::AwaitingOptions,
            macros: MacroMap::default(),
            negotiated: None,
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Drive the session over `io` until the MTA quits, the stream closes,
    /// an error terminates it, or `stop` asks it to wind down.
    pub async fn run<IO>(
        mut self,
        io: IO,
        stop: StopSignal,
    ) -> std::result::Result<(), SessionError>
    where
        IO: Read + Write + Send + Unpin + 'static,
    {
        let (read_half, write_half) = io.split();
        let mut writer = PacketCodec::with_max_body(write_half, self.config.max_body_size);
        let (queue_tx, queue_rx) = bounded(self.config.queue_capacity.max(1));
        let reader = task::spawn(read_loop(
            read_half,
            queue_tx,
            stop.clone(),
            self.config.max_body_size,
            self.id.clone(),
        ));

        let result = self.dispatch(&queue_rx, &mut writer, &stop).await;

        drop(queue_rx);
        reader.cancel().await;
        let mut write_half = writer.into_inner();
        if let Err(e) = write_half.close().await {
            trace!("{}: error closing the stream: {}", self.id, e);
        }

        match &result {
            Ok(()) => debug!("{}: session closed", self.id),
            Err(SessionError::Shutdown) => debug!("{}: session stopped for shutdown", self.id),
            Err(e) => debug!("{}: session failed: {}", self.id, e),
        }
        result
    }

    async fn dispatch<W>(
        &mut self,
        queue: &Receiver<QueueItem>,
        writer: &mut PacketCodec<W>,
        stop: &StopSignal,
    ) -> std::result::Result<(), SessionError>
    where
        W: Write + Unpin,
    {
        loop {
            if stop.triggered() {
                return Err(SessionError::Shutdown);
            }
            let item = {
                let next = queue.recv().fuse();
                let stopped = stop.wait().fuse();
                pin_mut!(next, stopped);
                select! {
                    item = next => item,
                    _ = stopped => return Err(SessionError::Shutdown),
                }
            };
            let command = match item {
                Ok(Ok(command)) => command,
                Ok(Err(error)) => return Err(error),
                // reader is gone: the MTA closed the stream on a frame
                // boundary, which is the normal end of a session
                Err(_) => return Ok(()),
            };

            trace!("{}: <- {}", self.id, command.verb());
            self.stage = self.stage.advance(&command)?;

            match command {
                Command::OptionsNegotiate {
                    version,
                    actions,
                    protocol,
                } => {
                    let (negotiated, reply) = negotiate(version, actions, protocol, &self.decl)?;
                    debug!(
                        "{}: negotiated {:?} {:?}",
                        self.id, negotiated.protocol, negotiated.actions
                    );
                    let allowed = negotiated.actions;
                    self.negotiated = Some(negotiated);
                    write_response(&self.id, writer, &Response::Negotiate(reply), allowed)
                        .await?;
                }
                Command::DefineMacro { stage, macros } => {
                    trace!(
                        "{}: {} macro(s) for {:?}",
                        self.id,
                        macros.len(),
                        stage
                    );
                    for (symbol, value) in &macros {
                        self.macros.define(symbol, value);
                    }
                }
                Command::Connect(connect) => {
                    self.verdict_stage(writer, MacroStage::Connect, HookCall::Connect(connect))
                        .await?
                }
                Command::Helo(helo) => {
                    self.verdict_stage(writer, MacroStage::Helo, HookCall::Helo(helo))
                        .await?
                }
                Command::MailFrom(envelope) => {
                    self.verdict_stage(writer, MacroStage::MailFrom, HookCall::MailFrom(envelope))
                        .await?
                }
                Command::RcptTo(envelope) => {
                    self.verdict_stage(writer, MacroStage::RcptTo, HookCall::RcptTo(envelope))
                        .await?
                }
                Command::Data => {
                    self.verdict_stage(writer, MacroStage::Data, HookCall::Data)
                        .await?
                }
                Command::Header(header) => {
                    self.verdict_stage(writer, MacroStage::Header, HookCall::Header(header))
                        .await?
                }
                Command::EndOfHeaders => {
                    self.verdict_stage(writer, MacroStage::EndOfHeaders, HookCall::EndOfHeaders)
                        .await?
                }
                Command::Unknown(verb) => {
                    self.verdict_stage(writer, MacroStage::Unknown, HookCall::Unknown(verb))
                        .await?
                }
                Command::BodyChunk(chunk) => self.body_stage(writer, chunk).await?,
                Command::EndOfMessage => self.end_of_message(writer).await?,
                Command::Abort => {
                    // transaction state dies, macros and the handler live on
                    let deadline = self.config.hook_deadline;
                    match timeout(deadline, self.handler.on_abort()).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            error!("{}: abort hook failed: {}", self.id, e);
                            return Err(SessionError::HookFailure {
                                stage: "abort",
                                reason: e.to_string(),
                            });
                        }
                        Err(_) => {
                            warn!("{}: abort hook missed its deadline", self.id);
                            return Err(SessionError::HookDeadline { stage: "abort" });
                        }
                    }
                }
                // no MTA reuses the session for a new connection, so both
                // quit flavors close; reuse would loop back to
                // AwaitingOptions here
                Command::Quit | Command::QuitNewConnection => {
                    if let Ok(Err(e)) =
                        timeout(self.config.hook_deadline, self.handler.on_quit()).await
                    {
                        debug!("{}: quit hook failed: {}", self.id, e);
                    }
                    return Ok(());
                }
            }
        }
    }

    fn frozen(&self, stage: MacroStage) -> std::result::Result<Negotiated, SessionError> {
        match &self.negotiated {
            Some(negotiated) => Ok(negotiated.clone()),
            None => Err(SessionError::Violation(ProtocolViolation {
                stage: self.stage,
                command: stage_label(stage),
            })),
        }
    }

    async fn verdict_stage<W>(
        &mut self,
        writer: &mut PacketCodec<W>,
        stage: MacroStage,
        call: HookCall,
    ) -> std::result::Result<(), SessionError>
    where
        W: Write + Unpin,
    {
        let negotiated = self.frozen(stage)?;
        let label = stage_label(stage);
        let wants_reply = negotiated.wants_reply(stage);
        if !self.decl.handles(stage) {
            trace!("{}: no hook for {}, delivered for ordering only", self.id, label);
            if wants_reply {
                // the MTA kept this stage synchronous, keep it moving
                write_response(&self.id, writer, &Response::Continue, negotiated.actions)
                    .await?;
            }
            return Ok(());
        }
        let deadline = self.config.hook_deadline;
        let snapshot = self.macros.clone();
        let id = self.id.clone();

        let outcome = {
            let fut = call.invoke(self.handler.as_mut(), snapshot);
            timeout(deadline, fut).await
        };

        match outcome {
            Err(_) => {
                warn!(
                    "{}: {} hook missed its {:?} deadline",
                    id, label, deadline
                );
                if wants_reply {
                    write_response(&id, writer, &Response::Tempfail, negotiated.actions).await?;
                    Ok(())
                } else {
                    Err(SessionError::HookDeadline { stage: label })
                }
            }
            Ok(Err(e)) => {
                error!("{}: {} hook failed: {}", id, label, e);
                if wants_reply {
                    write_response(&id, writer, &Response::Tempfail, negotiated.actions).await?;
                    Ok(())
                } else {
                    Err(SessionError::HookFailure {
                        stage: label,
                        reason: e.to_string(),
                    })
                }
            }
            Ok(Ok(Some(verdict))) => {
                if wants_reply {
                    write_response(&id, writer, &Response::from(verdict), negotiated.actions)
                        .await?;
                } else {
                    warn!(
                        "{}: {} hook returned a verdict for a no-reply stage, dropping it",
                        id, label
                    );
                }
                Ok(())
            }
            Ok(Ok(None)) => {
                if wants_reply {
                    if self.decl.replies(stage) {
                        warn!(
                            "{}: {} hook is negotiated replying but returned nothing, continuing",
                            id, label
                        );
                    }
                    write_response(&id, writer, &Response::Continue, negotiated.actions).await?;
                }
                Ok(())
            }
        }
    }

    async fn body_stage<W>(
        &mut self,
        writer: &mut PacketCodec<W>,
        chunk: Vec<u8>,
    ) -> std::result::Result<(), SessionError>
    where
        W: Write + Unpin,
    {
        let negotiated = self.frozen(MacroStage::Body)?;
        let wants_reply = negotiated.wants_reply(MacroStage::Body);
        if !self.decl.handles(MacroStage::Body) {
            trace!("{}: no hook for body-chunk, delivered for ordering only", self.id);
            if wants_reply {
                write_response(&self.id, writer, &Response::Continue, negotiated.actions)
                    .await?;
            }
            return Ok(());
        }
        let deadline = self.config.hook_deadline;
        let snapshot = self.macros.clone();
        let id = self.id.clone();

        let outcome = {
            let fut = self.handler.on_body_chunk(chunk, snapshot);
            timeout(deadline, fut).await
        };

        let reply = match outcome {
            Err(_) => {
                warn!("{}: body-chunk hook missed its {:?} deadline", id, deadline);
                if wants_reply {
                    write_response(&id, writer, &Response::Tempfail, negotiated.actions).await?;
                    return Ok(());
                }
                return Err(SessionError::HookDeadline {
                    stage: "body-chunk",
                });
            }
            Ok(Err(e)) => {
                error!("{}: body-chunk hook failed: {}", id, e);
                if wants_reply {
                    write_response(&id, writer, &Response::Tempfail, negotiated.actions).await?;
                    return Ok(());
                }
                return Err(SessionError::HookFailure {
                    stage: "body-chunk",
                    reason: e.to_string(),
                });
            }
            Ok(Ok(reply)) => reply,
        };

        match reply {
            Some(BodyReply::Verdict(verdict)) => {
                if wants_reply {
                    write_response(&id, writer, &Response::from(verdict), negotiated.actions)
                        .await?;
                } else {
                    warn!(
                        "{}: body-chunk hook returned a verdict for a no-reply stage, dropping it",
                        id
                    );
                }
            }
            Some(BodyReply::Skip) => {
                if !wants_reply {
                    warn!(
                        "{}: body-chunk hook returned skip for a no-reply stage, dropping it",
                        id
                    );
                } else if negotiated.skip_allowed() {
                    write_response(&id, writer, &Response::Skip, negotiated.actions).await?;
                } else {
                    warn!("{}: skip was not negotiated, degrading to continue", id);
                    write_response(&id, writer, &Response::Continue, negotiated.actions).await?;
                }
            }
            None => {
                if wants_reply {
                    if self.decl.replies(MacroStage::Body) {
                        warn!(
                            "{}: body-chunk hook is negotiated replying but returned nothing, continuing",
                            id
                        );
                    }
                    write_response(&id, writer, &Response::Continue, negotiated.actions).await?;
                }
            }
        }
        Ok(())
    }

    async fn end_of_message<W>(
        &mut self,
        writer: &mut PacketCodec<W>,
    ) -> std::result::Result<(), SessionError>
    where
        W: Write + Unpin,
    {
        let negotiated = self.frozen(MacroStage::EndOfMessage)?;
        let id = self.id.clone();
        let reply = if self.decl.handles(MacroStage::EndOfMessage) {
            let deadline = self.config.hook_deadline;
            let snapshot = self.macros.clone();
            let outcome = {
                let fut = self.handler.on_end_of_message(snapshot);
                timeout(deadline, fut).await
            };
            match outcome {
                Err(_) => {
                    warn!(
                        "{}: end-of-message hook missed its {:?} deadline, replying {:?}",
                        id, deadline, self.config.eom_fallback
                    );
                    EomReply::new(self.config.eom_fallback.clone())
                }
                Ok(Err(e)) => {
                    error!("{}: end-of-message hook failed: {}", id, e);
                    EomReply::new(Verdict::Tempfail)
                }
                Ok(Ok(reply)) => reply,
            }
        } else {
            EomReply::default()
        };

        for manipulation in reply.manipulations {
            // a dropped manipulation must not silence the rest
            write_checked(
                &id,
                writer,
                &Response::Manipulation(manipulation),
                negotiated.actions,
            )
            .await?;
        }
        match reply.verdict {
            EomVerdict::Verdict(verdict) => {
                write_response(&id, writer, &Response::from(verdict), negotiated.actions)
                    .await?;
            }
            EomVerdict::Quarantine { reason } => {
                let wrote = write_checked(
                    &id,
                    writer,
                    &Response::Quarantine { reason },
                    negotiated.actions,
                )
                .await?;
                if !wrote {
                    write_response(&id, writer, &Response::Continue, negotiated.actions).await?;
                }
            }
        }

        // the MTA may start another transaction on this session
        self.stage = Stage::Connected;
        Ok(())
    }
}

enum HookCall {
    Connect(crate::proto::command::Connect),
    Helo(crate::proto::command::Helo),
    MailFrom(crate::proto::command::Envelope),
    RcptTo(crate::proto::command::Envelope),
    Data,
    Header(crate::proto::command::Header),
    EndOfHeaders,
    Unknown(Vec<u8>),
}

impl HookCall {
    fn invoke<'h>(
        self,
        handler: &'h mut dyn MilterHandler,
        macros: MacroMap,
    ) -> S1Fut<'h, crate::app::HookResult<Option<Verdict>>> {
        match self {
            HookCall::Connect(connect) => handler.on_connect(connect, macros),
            HookCall::Helo(helo) => handler.on_helo(helo, macros),
            HookCall::MailFrom(envelope) => handler.on_mail_from(envelope, macros),
            HookCall::RcptTo(envelope) => handler.on_rcpt_to(envelope, macros),
            HookCall::Data => handler.on_data(macros),
            HookCall::Header(header) => handler.on_header(header, macros),
            HookCall::EndOfHeaders => handler.on_end_of_headers(macros),
            HookCall::Unknown(verb) => handler.on_unknown(verb, macros),
        }
    }
}

fn stage_label(stage: MacroStage) -> &'static str {
    match stage {
        MacroStage::Connect => "connect",
        MacroStage::Helo => "helo",
        MacroStage::MailFrom => "mail-from",
        MacroStage::RcptTo => "rcpt-to",
        MacroStage::Data => "data",
        MacroStage::Header => "header",
        MacroStage::EndOfHeaders => "end-of-headers",
        MacroStage::Body => "body-chunk",
        MacroStage::EndOfMessage => "end-of-message",
        MacroStage::Unknown => "unknown",
    }
}

/// Write a response that must be encodable; encoding failures here are
/// internal errors and still only cost a diagnostic, not the session.
async fn write_response<W>(
    id: &SessionId,
    writer: &mut PacketCodec<W>,
    response: &Response,
    allowed: ActionFlags,
) -> std::result::Result<(), SessionError>
where
    W: Write + Unpin,
{
    write_checked(id, writer, response, allowed).await.map(|_| ())
}

/// Write a response, dropping it with a diagnostic when negotiation does not
/// permit it. Returns whether anything went on the wire.
async fn write_checked<W>(
    id: &SessionId,
    writer: &mut PacketCodec<W>,
    response: &Response,
    allowed: ActionFlags,
) -> std::result::Result<bool, SessionError>
where
    W: Write + Unpin,
{
    match response.encode(allowed) {
        Ok((code, body)) => {
            trace!("{}: -> {:?} ({} byte body)", id, code as char, body.len());
            writer.write_packet(code, &body).await?;
            Ok(true)
        }
        Err(e) => {
            warn!("{}: dropping response: {}", id, e);
            Ok(false)
        }
    }
}

async fn read_loop<R>(
    io: R,
    queue: Sender<QueueItem>,
    stop: StopSignal,
    max_body: usize,
    id: SessionId,
) where
    R: Read + Unpin,
{
    let mut codec = PacketCodec::with_max_body(io, max_body);
    loop {
        let packet = {
            let read = codec.read_packet().fuse();
            let stopped = stop.wait().fuse();
            pin_mut!(read, stopped);
            select! {
                packet = read => packet,
                _ = stopped => break,
            }
        };
        match packet {
            Ok(None) => break,
            Ok(Some((code, body))) => match Command::decode(code, &body) {
                Ok(command) => {
                    if queue.send(Ok(command)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    let _ = queue.send(Err(e.into())).await;
                    break;
                }
            },
            Err(e) => {
                let _ = queue.send(Err(e.into())).await;
                break;
            }
        }
    }
    trace!("{}: reader finished", id);
}
