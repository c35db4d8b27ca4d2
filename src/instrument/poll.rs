//! Bounded fixed-cadence polling of instrument status registers.
//!
//! Instruments do not push state changes, so every wait in a cycle is a
//! query loop. [`Poller`] paces the loop and turns an exhausted budget into
//! [`DaqError::ProtocolTimeout`] instead of spinning forever.
//!
//! ```rust,ignore
//! let mut poller = Poller::start(&settings, CyclePhase::Arm, settings.timeout);
//! loop {
//!     if transport.query("STATus:RECorder?").await? == "1" {
//!         break;
//!     }
//!     poller.wait().await?;
//! }
//! ```

use crate::core::CyclePhase;
use crate::error::{AppResult, DaqError};
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// Cadence and bound shared by every poll loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollSettings {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(100),
            timeout: Duration::from_secs(120),
        }
    }
}

/// Pacing state of one poll loop.
#[derive(Debug)]
pub struct Poller {
    phase: CyclePhase,
    interval: Duration,
    started: Instant,
    deadline: Instant,
}

impl Poller {
    /// Begin a loop for `phase` that may run for at most `budget`.
    pub fn start(settings: &PollSettings, phase: CyclePhase, budget: Duration) -> Self {
        let started = Instant::now();
        Self {
            phase,
            interval: settings.interval,
            started,
            deadline: started + budget,
        }
    }

    /// Time since the loop started.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Sleep one interval before the next check.
    ///
    /// Fails with `ProtocolTimeout` once the budget is spent.
    pub async fn wait(&mut self) -> AppResult<()> {
        if Instant::now() >= self.deadline {
            return Err(DaqError::ProtocolTimeout {
                phase: self.phase,
                waited: self.elapsed(),
            });
        }
        sleep(self.interval).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_wait_paces_at_interval() {
        let settings = PollSettings {
            interval: Duration::from_millis(100),
            timeout: Duration::from_secs(1),
        };
        let mut poller = Poller::start(&settings, CyclePhase::Arm, settings.timeout);
        for _ in 0..5 {
            poller.wait().await.unwrap();
        }
        let elapsed = poller.elapsed();
        assert!(elapsed >= Duration::from_millis(500), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(510), "{:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_exhaustion_times_out() {
        let settings = PollSettings {
            interval: Duration::from_millis(100),
            timeout: Duration::from_millis(300),
        };
        let mut poller = Poller::start(&settings, CyclePhase::Wipe, settings.timeout);
        let mut ticks = 0;
        let err = loop {
            match poller.wait().await {
                Ok(()) => ticks += 1,
                Err(e) => break e,
            }
        };
        assert_eq!(ticks, 3);
        assert!(matches!(
            err,
            DaqError::ProtocolTimeout {
                phase: CyclePhase::Wipe,
                ..
            }
        ));
    }
}
