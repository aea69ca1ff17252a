//! The TCP acceptor: bind once, accept until told to stop, then drain.

use super::SessionRegistry;
use crate::app::Milter;
use crate::common::*;
use crate::session::{Session, SessionConfig, StopSignal};
use async_std::net::{TcpListener, ToSocketAddrs};
use async_std::stream::StreamExt;
use async_std::task;
use futures_util::{pin_mut, select, FutureExt};
use signal_hook::consts::{SIGINT, SIGTERM};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Where and how to listen.
#[derive(Debug, Clone)]
pub struct BindConfig {
    pub host: String,
    pub port: u16,
    pub backlog: i32,
    /// How long shutdown waits for live sessions before cancelling them.
    pub drain_timeout: Duration,
}

impl BindConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        BindConfig {
            host: host.into(),
            port,
            backlog: 128,
            drain_timeout: Duration::from_secs(10),
        }
    }

    pub fn backlog(mut self, backlog: i32) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }
}

/// Serves one [`Milter`] on one listening socket.
#[derive(Debug)]
pub struct MilterServer {
    milter: Milter,
    session_config: SessionConfig,
}

impl MilterServer {
    pub fn new(milter: Milter) -> Self {
        MilterServer {
            milter,
            session_config: SessionConfig::default(),
        }
    }

    pub fn with_session_config(mut self, session_config: SessionConfig) -> Self {
        self.session_config = session_config;
        self
    }

    /// Bind the listening socket without accepting yet. Binding port 0 and
    /// asking [`BoundServer::local_addr`] is how tests get a free port.
    pub async fn bind(self, config: BindConfig) -> Result<BoundServer> {
        let addr = resolve(&config.host, config.port).await?;
        let listener = bind_listener(addr, config.backlog)?;
        info!(
            "{}: listening on {}",
            self.milter.name(),
            listener.local_addr()?
        );
        Ok(BoundServer {
            milter: self.milter,
            session_config: self.session_config,
            listener,
            drain_timeout: config.drain_timeout,
            stop: StopSignal::new(),
        })
    }

    /// Bind and serve until SIGINT or SIGTERM, then drain and return.
    pub async fn serve(self, config: BindConfig) -> Result<()> {
        let bound = self.bind(config).await?;
        watch_signals(bound.stop_signal())?;
        bound.run().await
    }
}

/// A listening milter server; `run` accepts until the stop signal fires.
pub struct BoundServer {
    milter: Milter,
    session_config: SessionConfig,
    listener: TcpListener,
    drain_timeout: Duration,
    stop: StopSignal,
}

impl BoundServer {
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// The signal that stops `run`; trigger it to shut the server down.
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    pub async fn run(self) -> Result<()> {
        let registry = Arc::new(SessionRegistry::default());
        let mut incoming = self.listener.incoming();

        loop {
            let accepted = {
                let next = incoming.next().fuse();
                let stopped = self.stop.wait().fuse();
                pin_mut!(next, stopped);
                select! {
                    stream = next => stream,
                    _ = stopped => break,
                }
            };
            let stream = match accepted {
                Some(Ok(stream)) => stream,
                Some(Err(e)) => {
                    warn!("failed to accept a connection: {}", e);
                    continue;
                }
                None => break,
            };

            let session = Session::new(&self.milter, self.session_config.clone());
            let id = session.id().clone();
            debug!(
                "{}: MTA connected from {:?}",
                id,
                stream.peer_addr().ok()
            );

            registry.announce(id.clone());
            let task_registry = registry.clone();
            let task_id = id.clone();
            let stop = self.stop.clone();
            let handle = task::spawn(async move {
                if let Err(e) = session.run(stream, stop).await {
                    warn!("{}: session failed: {}", task_id, e);
                }
                task_registry.retire(&task_id);
            });
            registry.attach(&id, handle);
        }

        drop(incoming);
        self.stop.trigger();
        drain(&registry, self.drain_timeout).await;
        info!("{}: shutdown complete", self.milter.name());
        Ok(())
    }
}

/// Wait for live sessions to finish their current command and retire; any
/// leftovers after the timeout are cancelled outright.
async fn drain(registry: &SessionRegistry, drain_timeout: Duration) {
    let waiting_since = Instant::now();
    while registry.len() > 0 {
        if waiting_since.elapsed() >= drain_timeout {
            let leftovers = registry.take_handles();
            warn!(
                "drain timeout after {:?}, cancelling {} session(s)",
                drain_timeout,
                leftovers.len()
            );
            for handle in leftovers {
                handle.cancel().await;
            }
            return;
        }
        task::sleep(Duration::from_millis(20)).await;
    }
    debug!(
        "all sessions drained in {:?}",
        waiting_since.elapsed()
    );
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    let mut addrs = (host, port).to_socket_addrs().await?;
    addrs
        .next()
        .ok_or_else(|| format!("cannot resolve {}:{}", host, port).into())
}

/// Plain `TcpListener::bind` would leave SO_REUSEADDR off and the backlog at
/// the library default; restarting a milter must not trade mail for
/// TIME_WAIT.
fn bind_listener(addr: SocketAddr, backlog: i32) -> Result<TcpListener> {
    use socket2::{Domain, Protocol, Socket, Type};
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    socket.set_nonblocking(true)?;
    let listener: std::net::TcpListener = socket.into();
    Ok(TcpListener::from(listener))
}

/// SIGINT and SIGTERM both mean "stop accepting and drain".
fn watch_signals(stop: StopSignal) -> Result<()> {
    let flag = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(SIGTERM, flag.clone())?;
    signal_hook::flag::register(SIGINT, flag.clone())?;
    task::spawn(async move {
        loop {
            if flag.load(Ordering::Relaxed) {
                info!("shutdown signal received");
                stop.trigger();
                return;
            }
            if stop.triggered() {
                return;
            }
            task::sleep(Duration::from_millis(100)).await;
        }
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[async_std::test]
    async fn binds_port_zero_and_reports_the_address() {
        let milter = Milter::builder("bind-test").build();
        let bound = MilterServer::new(milter)
            .bind(BindConfig::new("127.0.0.1", 0))
            .await
            .expect("binds");
        let addr = bound.local_addr().expect("has address");
        assert_eq!(addr.ip().to_string(), "127.0.0.1");
        assert_ne!(addr.port(), 0);
    }

    #[async_std::test]
    async fn stopped_server_returns() {
        let milter = Milter::builder("stop-test").build();
        let bound = MilterServer::new(milter)
            .bind(BindConfig::new("127.0.0.1", 0).drain_timeout(Duration::from_millis(200)))
            .await
            .expect("binds");
        let stop = bound.stop_signal();
        let server = task::spawn(bound.run());
        stop.trigger();
        server.await.expect("clean shutdown");
    }
}
