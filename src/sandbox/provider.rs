use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::models::CommandOutput;
use crate::errors::ProviderError;

pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Remote sandbox runtime.
///
/// `create` and `connect` both (re)arm the sandbox lifetime ceiling. Every
/// call may fail with [`ProviderError::Unreachable`] on transport errors;
/// `connect` returns [`ProviderError::NotFound`] once the sandbox is gone.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    async fn create(
        &self,
        template: &str,
        lifetime: Duration,
        metadata: &BTreeMap<String, String>,
    ) -> ProviderResult<String>;

    async fn connect(&self, sandbox_id: &str, lifetime: Duration) -> ProviderResult<()>;

    async fn pause(&self, sandbox_id: &str) -> ProviderResult<()>;

    async fn kill(&self, sandbox_id: &str) -> ProviderResult<()>;

    async fn write_file(&self, sandbox_id: &str, path: &str, content: &str) -> ProviderResult<()>;

    async fn read_file(&self, sandbox_id: &str, path: &str) -> ProviderResult<String>;

    async fn run_command(
        &self,
        sandbox_id: &str,
        command: &str,
        timeout: Duration,
    ) -> ProviderResult<CommandOutput>;

    /// Public host serving `port` inside the sandbox.
    fn host(&self, sandbox_id: &str, port: u16) -> String;
}

/// `https://{port}-{sandbox_id}.{domain}`
pub fn preview_host(domain: &str, sandbox_id: &str, port: u16) -> String {
    format!("https://{}-{}.{}", port, sandbox_id, domain)
}

/// Source of "now" for lifecycle decisions.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Hand-advanced clock for tests.
#[cfg(test)]
pub struct ManualClock {
    now: std::sync::Mutex<DateTime<Utc>>,
}

#[cfg(test)]
impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: std::sync::Mutex::new(start),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preview_host_format() {
        assert_eq!(
            preview_host("sandbox.local", "abc123", 3000),
            "https://3000-abc123.sandbox.local"
        );
    }

    #[test]
    fn test_manual_clock_advances() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        clock.advance(chrono::Duration::seconds(90));
        assert_eq!(clock.now(), start + chrono::Duration::seconds(90));
    }
}
