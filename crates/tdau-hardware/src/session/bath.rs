//! Thermal bath session.
//!
//! Wraps a [`BathDriver`] with the set-and-wait policy the run engine relies on:
//! send the set-point, poll until the reading is within tolerance, then let the
//! units under test settle. The wait is bounded by [`BathPolicy::max_wait`].

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use std::time::Duration;
use tdau_core::driver::BathDriver;
use tdau_core::{AppResult, BenchError, FormatError};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Set-point used when the bath is parked at the end of a run.
pub const DEFAULT_TEMPERATURE: f64 = 25.0;

static FLOAT_LITERAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[-+]?\d*\.\d+").expect("valid float regex"));
static INTEGER_LITERAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[-+]?\d+").expect("valid integer regex"));

/// Extract the first numeric literal from a bath reply.
///
/// A decimal literal is preferred; an integer literal is accepted when the reply
/// has none.
pub fn parse_first_float(line: &str) -> Result<f64, FormatError> {
    FLOAT_LITERAL
        .find(line)
        .or_else(|| INTEGER_LITERAL.find(line))
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .ok_or_else(|| FormatError::NoNumber(line.to_string()))
}

/// Convergence policy for [`BathSession::set_temperature`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BathPolicy {
    /// Accepted |reading - target| in °C.
    pub tolerance: f64,
    #[serde(with = "secs")]
    pub poll_interval: Duration,
    /// Upper bound on the time spent waiting for convergence.
    #[serde(with = "secs")]
    pub max_wait: Duration,
    /// Extra wait after convergence for the units to reach equilibrium.
    #[serde(with = "secs")]
    pub settle_time: Duration,
}

impl Default for BathPolicy {
    fn default() -> Self {
        Self {
            tolerance: 0.2,
            poll_interval: Duration::from_secs(10),
            max_wait: Duration::from_secs(2 * 60 * 60),
            settle_time: Duration::from_secs(300),
        }
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

pub struct BathSession {
    driver: Box<dyn BathDriver>,
    policy: BathPolicy,
    address: Option<String>,
}

impl BathSession {
    pub fn new(driver: Box<dyn BathDriver>, policy: BathPolicy) -> Self {
        Self {
            driver,
            policy,
            address: None,
        }
    }

    pub fn policy(&self) -> &BathPolicy {
        &self.policy
    }

    pub fn is_open(&self) -> bool {
        self.driver.is_open()
    }

    fn ensure_open(&self) -> AppResult<()> {
        if self.driver.is_open() {
            Ok(())
        } else {
            Err(BenchError::NotConnected(format!(
                "bath at {} is not open",
                self.address.as_deref().unwrap_or("<unassigned>")
            )))
        }
    }

    #[instrument(skip(self), err)]
    pub async fn open(&mut self, address: &str, baud_rate: u32) -> AppResult<()> {
        self.driver.open(address, baud_rate).await?;
        self.address = Some(address.to_string());
        info!(address, baud_rate, "Bath opened");
        Ok(())
    }

    /// Current bath temperature in °C.
    pub async fn get_temperature(&self) -> AppResult<f64> {
        self.ensure_open()?;
        let line = self.driver.query_temperature_line().await?;
        Ok(parse_first_float(&line)?)
    }

    /// Move the bath to `target` and block until it has converged and settled.
    ///
    /// # Errors
    ///
    /// [`BenchError::BathTimeout`] if the reading is not within tolerance after
    /// `max_wait`; transport failures as [`BenchError::Connection`].
    #[instrument(skip(self), err)]
    pub async fn set_temperature(&self, target: f64) -> AppResult<()> {
        self.ensure_open()?;
        self.driver.send_set_point(target).await?;

        let started = Instant::now();
        let mut last = None;
        loop {
            match self.get_temperature().await {
                Ok(current) => {
                    last = Some(current);
                    if (current - target).abs() <= self.policy.tolerance {
                        break;
                    }
                    debug!(current, target, "Bath still converging");
                }
                Err(e) if e.is_recoverable() => {
                    warn!(error = %e, "Unreadable bath reply, polling again");
                }
                Err(e) => return Err(e),
            }

            let waited = started.elapsed();
            if waited >= self.policy.max_wait {
                return Err(BenchError::BathTimeout {
                    target,
                    last,
                    waited_secs: waited.as_secs(),
                });
            }
            tokio::time::sleep(self.policy.poll_interval).await;
        }

        info!(
            target,
            waited_secs = started.elapsed().as_secs(),
            settle_secs = self.policy.settle_time.as_secs(),
            "Bath converged, settling"
        );
        tokio::time::sleep(self.policy.settle_time).await;
        Ok(())
    }

    /// Park the bath at 25 °C without waiting.
    pub async fn set_default(&self) -> AppResult<()> {
        self.ensure_open()?;
        self.driver.send_set_point(DEFAULT_TEMPERATURE).await?;
        Ok(())
    }

    /// Idempotent.
    pub async fn close(&mut self) -> AppResult<()> {
        if !self.driver.is_open() {
            return Ok(());
        }
        self.driver.close().await?;
        debug!(address = ?self.address, "Bath closed");
        Ok(())
    }
}
