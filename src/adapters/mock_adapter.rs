//! Mock instrument transport for testing
//!
//! Stands in for an instrument socket without hardware. It provides:
//! - Scripted replies per query command
//! - Controllable failure injection
//! - A shared call log for verifying command order
//!
//! Clones share state, so a test can keep one handle for inspection and move
//! another into the controller under test.

use crate::adapters::ScpiTransport;
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug)]
enum Script {
    /// Replies consumed in order; the last one repeats forever.
    Sticky(VecDeque<String>),
    /// Replies repeated as a loop.
    Cycle(Vec<String>, usize),
}

impl Script {
    fn next_reply(&mut self) -> Option<String> {
        match self {
            Script::Sticky(replies) if replies.len() > 1 => replies.pop_front(),
            Script::Sticky(replies) => replies.front().cloned(),
            Script::Cycle(replies, _) if replies.is_empty() => None,
            Script::Cycle(replies, next) => {
                let reply = replies[*next % replies.len()].clone();
                *next += 1;
                Some(reply)
            }
        }
    }
}

#[derive(Debug, Default)]
struct MockState {
    connected: bool,
    sent: Vec<String>,
    scripts: HashMap<String, Script>,
    pending: VecDeque<String>,
    fail_on: HashSet<String>,
    fail_next: bool,
}

/// Scripted [`ScpiTransport`].
///
/// # Example
///
/// ```
/// use iq_daq::adapters::{MockAdapter, ScpiTransport};
///
/// # tokio_test::block_on(async {
/// let mock = MockAdapter::new("recorder").on_query("STATus:RECorder?", ["2", "1"]);
/// let mut transport = mock.clone();
/// assert_eq!(transport.query("STATus:RECorder?").await.unwrap(), "2");
/// assert_eq!(transport.query("STATus:RECorder?").await.unwrap(), "1");
/// assert_eq!(transport.query("STATus:RECorder?").await.unwrap(), "1");
/// assert_eq!(mock.sent().len(), 3);
/// # });
/// ```
#[derive(Clone, Debug)]
pub struct MockAdapter {
    name: String,
    state: Arc<Mutex<MockState>>,
}

impl MockAdapter {
    /// Create a connected mock with no scripted replies.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Arc::new(Mutex::new(MockState {
                connected: true,
                ..MockState::default()
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reply to `command` with `replies` in order, repeating the last one.
    pub fn on_query<I, S>(self, command: &str, replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let replies = replies.into_iter().map(Into::into).collect();
        self.state()
            .scripts
            .insert(command.to_string(), Script::Sticky(replies));
        self
    }

    /// Reply to `command` with `replies` in a loop.
    pub fn on_query_cycle<I, S>(self, command: &str, replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let replies = replies.into_iter().map(Into::into).collect();
        self.state()
            .scripts
            .insert(command.to_string(), Script::Cycle(replies, 0));
        self
    }

    /// Fail every send of `command` with a transport error.
    pub fn fail_on(self, command: &str) -> Self {
        self.state().fail_on.insert(command.to_string());
        self
    }

    /// Inject a failure for the next send.
    pub fn inject_next_failure(&self) {
        self.state().fail_next = true;
    }

    /// Every command sent so far, in order.
    pub fn sent(&self) -> Vec<String> {
        self.state().sent.clone()
    }

    /// Number of times `command` was sent.
    pub fn count(&self, command: &str) -> usize {
        self.state().sent.iter().filter(|c| *c == command).count()
    }

    pub fn clear_log(&self) {
        self.state().sent.clear();
    }
}

#[async_trait]
impl ScpiTransport for MockAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&mut self, command: &str) -> AppResult<()> {
        let mut state = self.state();
        if !state.connected {
            return Err(DaqError::NotConnected);
        }
        if std::mem::take(&mut state.fail_next) || state.fail_on.contains(command) {
            return Err(DaqError::Transport(format!(
                "injected failure on '{}'",
                command
            )));
        }
        state.sent.push(command.to_string());
        if let Some(reply) = state.scripts.get_mut(command).and_then(Script::next_reply) {
            state.pending.push_back(reply);
        }
        Ok(())
    }

    async fn receive(&mut self) -> AppResult<String> {
        let mut state = self.state();
        if !state.connected {
            return Err(DaqError::NotConnected);
        }
        state
            .pending
            .pop_front()
            .ok_or_else(|| DaqError::Transport(format!("{}: no reply pending", self.name)))
    }

    async fn disconnect(&mut self) -> AppResult<()> {
        let mut state = self.state();
        if state.connected {
            state.connected = false;
            state.sent.push("<disconnect>".to_string());
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state().connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cycle_script_loops() {
        let mut mock = MockAdapter::new("recorder").on_query_cycle("STATus:RECorder?", ["1", "0"]);
        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(mock.query("STATus:RECorder?").await.unwrap());
        }
        assert_eq!(seen, ["1", "0", "1", "0"]);
    }

    #[tokio::test]
    async fn test_unscripted_query_has_no_reply() {
        let mut mock = MockAdapter::new("analyzer");
        mock.send("INITiate").await.unwrap();
        assert!(mock.receive().await.is_err());
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let mut mock = MockAdapter::new("recorder").fail_on("SYSTem:ARCHive:STARt");
        assert!(mock.send("SYSTem:ARCHive:STARt").await.is_err());
        mock.inject_next_failure();
        assert!(mock.send("*CLS").await.is_err());
        assert!(mock.send("*CLS").await.is_ok());
        assert_eq!(mock.sent(), vec!["*CLS".to_string()]);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let mut mock = MockAdapter::new("analyzer");
        let observer = mock.clone();
        mock.disconnect().await.unwrap();
        mock.disconnect().await.unwrap();
        assert!(!observer.is_connected());
        assert_eq!(observer.count("<disconnect>"), 1);
        assert!(matches!(mock.send("*IDN?").await, Err(DaqError::NotConnected)));
    }
}
