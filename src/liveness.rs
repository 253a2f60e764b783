// 💓 Liveness - tell an external monitor that a tick finished

use log::{debug, warn};
use std::time::Duration;

use crate::orchestrator::TickReport;

const PING_TIMEOUT: Duration = Duration::from_secs(10);

pub trait LivenessReporter: Send + Sync {
    /// Called after every non-degraded tick. Must never fail the tick.
    fn tick_completed(&self, report: &TickReport);
}

/// No monitor configured
pub struct NoLiveness;

impl LivenessReporter for NoLiveness {
    fn tick_completed(&self, _report: &TickReport) {}
}

/// GET a healthcheck URL (healthchecks.io style) once per completed tick.
///
/// Uses its own client: pings are not SEC traffic and must not spend the
/// filings source's rate budget.
pub struct HealthcheckPinger {
    url: String,
    client: reqwest::blocking::Client,
}

impl HealthcheckPinger {
    pub fn new(url: impl Into<String>) -> Result<Self, reqwest::Error> {
        let client = reqwest::blocking::Client::builder()
            .timeout(PING_TIMEOUT)
            .build()?;
        Ok(HealthcheckPinger {
            url: url.into(),
            client,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl LivenessReporter for HealthcheckPinger {
    fn tick_completed(&self, report: &TickReport) {
        match self.client.get(&self.url).send() {
            Ok(response) if response.status().is_success() => {
                debug!("liveness ping ok ({} persisted)", report.persisted);
            }
            Ok(response) => warn!("liveness ping to {} returned {}", self.url, response.status()),
            Err(e) => warn!("liveness ping to {} failed: {}", self.url, e),
        }
    }
}
