//! Trigger sources deciding when the next file cycle starts.
//!
//! - [`ExternalTrigger`]: listens on a TCP port for a line reading
//!   `triggered`. Any other line is logged and ignored.
//! - [`FixedDelayTrigger`]: fires after a constant delay, for setups without
//!   trigger hardware.
//!
//! [`TriggerSet`] holds one of each and hands out exactly one per cycle, so
//! the two variants are never waited on at the same time.

use crate::config::TriggerConfig;
use crate::core::TriggerMode;
use crate::error::AppResult;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::task::JoinSet;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

/// Literal payload that fires the external trigger.
pub const TRIGGER_MESSAGE: &str = "triggered";

/// Longest line accepted from a trigger connection.
pub const MAX_TRIGGER_LINE: u64 = 256;

/// Outcome of one wait.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TriggerEvent {
    pub mode: TriggerMode,
    /// Time spent waiting.
    pub waited: Duration,
    /// Peer that sent the trigger, for external triggers.
    pub peer: Option<SocketAddr>,
}

/// Something a cycle can wait on before it arms the recorder.
#[async_trait]
pub trait TriggerSource: Send + Sync {
    fn mode(&self) -> TriggerMode;

    /// Block until the trigger condition is met.
    async fn await_trigger(&mut self) -> AppResult<TriggerEvent>;
}

// =============================================================================
// External trigger
// =============================================================================

/// Waits for a `triggered` line on a TCP port.
///
/// The port is bound only for the duration of a wait and released after it,
/// with `SO_REUSEADDR` so a connection lingering from the previous wait does
/// not block the next bind.
#[derive(Clone, Debug)]
pub struct ExternalTrigger {
    addr: SocketAddr,
}

impl ExternalTrigger {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Bind the trigger port. The returned listener is what `await_trigger`
    /// waits on; binding separately lets a caller learn the actual port.
    pub fn listen(&self) -> AppResult<TriggerListener> {
        let socket = if self.addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(self.addr)?;
        let listener = socket.listen(16)?;
        debug!("trigger listener bound to {}", listener.local_addr()?);
        Ok(TriggerListener { listener })
    }
}

#[async_trait]
impl TriggerSource for ExternalTrigger {
    fn mode(&self) -> TriggerMode {
        TriggerMode::Automatic
    }

    async fn await_trigger(&mut self) -> AppResult<TriggerEvent> {
        self.listen()?.wait().await
    }
}

/// A bound trigger port waiting for its message.
#[derive(Debug)]
pub struct TriggerListener {
    listener: TcpListener,
}

impl TriggerListener {
    pub fn local_addr(&self) -> AppResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until one of them sends `triggered`.
    ///
    /// Every connection is read on its own task, so a silent peer never holds
    /// up the others. Connections still open when the trigger fires are
    /// dropped.
    pub async fn wait(self) -> AppResult<TriggerEvent> {
        let started = Instant::now();
        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (socket, peer) = accepted?;
                    debug!("trigger connection from {}", peer);
                    connections.spawn(read_trigger(socket, peer));
                }
                Some(joined) = connections.join_next() => {
                    if let Ok(Some(peer)) = joined {
                        info!("external trigger received from {}", peer);
                        return Ok(TriggerEvent {
                            mode: TriggerMode::Automatic,
                            waited: started.elapsed(),
                            peer: Some(peer),
                        });
                    }
                }
            }
        }
    }
}

/// Read lines from one connection. Returns the peer once it sends
/// `triggered`, `None` when the connection closes or misbehaves.
async fn read_trigger(socket: TcpStream, peer: SocketAddr) -> Option<SocketAddr> {
    let mut reader = BufReader::new(socket);
    let mut line = String::new();
    loop {
        line.clear();
        match (&mut reader).take(MAX_TRIGGER_LINE).read_line(&mut line).await {
            Ok(0) => return None,
            Ok(_) if line.trim() == TRIGGER_MESSAGE => return Some(peer),
            Ok(n) if n as u64 >= MAX_TRIGGER_LINE && !line.ends_with('\n') => {
                warn!(
                    "dropping trigger connection from {}: line exceeds {} bytes",
                    peer, MAX_TRIGGER_LINE
                );
                return None;
            }
            Ok(_) => warn!("ignoring trigger message '{}' from {}", line.trim(), peer),
            Err(e) => {
                warn!("trigger connection from {} failed: {}", peer, e);
                return None;
            }
        }
    }
}

// =============================================================================
// Fixed delay
// =============================================================================

/// Fires a constant delay after it is awaited.
#[derive(Clone, Copy, Debug)]
pub struct FixedDelayTrigger {
    delay: Duration,
}

impl FixedDelayTrigger {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Default for FixedDelayTrigger {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

#[async_trait]
impl TriggerSource for FixedDelayTrigger {
    fn mode(&self) -> TriggerMode {
        TriggerMode::Manual
    }

    async fn await_trigger(&mut self) -> AppResult<TriggerEvent> {
        sleep(self.delay).await;
        Ok(TriggerEvent {
            mode: TriggerMode::Manual,
            waited: self.delay,
            peer: None,
        })
    }
}

// =============================================================================
// Mode selector
// =============================================================================

/// One trigger per mode; the sequencer picks one per cycle.
pub struct TriggerSet {
    automatic: Box<dyn TriggerSource>,
    manual: Box<dyn TriggerSource>,
}

impl TriggerSet {
    pub fn new(automatic: Box<dyn TriggerSource>, manual: Box<dyn TriggerSource>) -> Self {
        Self { automatic, manual }
    }

    pub fn from_config(config: &TriggerConfig) -> Self {
        Self::new(
            Box::new(ExternalTrigger::new(config.addr())),
            Box::new(FixedDelayTrigger::new(config.manual_delay)),
        )
    }

    pub fn select(&mut self, mode: TriggerMode) -> &mut dyn TriggerSource {
        match mode {
            TriggerMode::Automatic => self.automatic.as_mut(),
            TriggerMode::Manual => self.manual.as_mut(),
        }
    }
}
