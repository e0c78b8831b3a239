//! Submits measurements to the selected collector.

use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::client::Client;
use super::model::{Measurement, ReportTemplate};

/// Capability experiments use to hand their results to the backend.
#[async_trait]
pub trait Submitter: Send + Sync {
    /// Post `measurement`, stamping its `report_id`, and return that id.
    async fn submit(
        &self,
        token: &CancellationToken,
        measurement: &mut Measurement,
    ) -> Result<String>;
}

impl std::fmt::Debug for dyn Submitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("dyn Submitter").finish_non_exhaustive()
    }
}

/// Submitter backed by a probe-services client. A report stays open as
/// long as consecutive measurements share the same template, so a run of
/// the same experiment lands in a single report.
pub struct ProbeServicesSubmitter {
    client: Client,
    open_report: Mutex<Option<(ReportTemplate, String)>>,
}

impl ProbeServicesSubmitter {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            open_report: Mutex::new(None),
        }
    }

    fn cached_report_id(&self, template: &ReportTemplate) -> Option<String> {
        let guard = self.open_report.lock().ok()?;
        match guard.as_ref() {
            Some((open_template, id)) if open_template == template => Some(id.clone()),
            _ => None,
        }
    }

    fn remember_report(&self, template: ReportTemplate, id: String) {
        if let Ok(mut guard) = self.open_report.lock() {
            *guard = Some((template, id));
        }
    }
}

#[async_trait]
impl Submitter for ProbeServicesSubmitter {
    async fn submit(
        &self,
        token: &CancellationToken,
        measurement: &mut Measurement,
    ) -> Result<String> {
        let template = ReportTemplate::from_measurement(measurement);
        let report_id = match self.cached_report_id(&template) {
            Some(id) => id,
            None => {
                let id = self.client.open_report(token, &template).await?;
                tracing::info!(target = "services", report_id = %id, "opened report");
                self.remember_report(template, id.clone());
                id
            }
        };
        measurement.report_id = report_id.clone();
        self.client
            .submit_measurement(token, &report_id, measurement)
            .await?;
        tracing::info!(
            target = "services",
            report_id = %report_id,
            test_name = %measurement.test_name,
            "submitted measurement"
        );
        Ok(report_id)
    }
}
