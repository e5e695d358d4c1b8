use saga_core::{SagaError, SagaEvent, SagaExecution, SagaId, SagaStepExecution, StepStatus};

/// Snapshot returned by [`Engine::get_saga_status`](crate::Engine::get_saga_status).
#[derive(Debug, Clone)]
pub struct SagaStatusReport {
    pub execution: SagaExecution,
    /// Step rows ordered by index. Steps never reached have no row.
    pub steps: Vec<SagaStepExecution>,
    /// Audit trail in insertion order.
    pub events: Vec<SagaEvent>,
}

impl SagaStatusReport {
    #[must_use]
    pub fn step(&self, index: usize) -> Option<&SagaStepExecution> {
        self.steps.iter().find(|s| s.step_index == index)
    }

    #[must_use]
    pub fn step_named(&self, name: &str) -> Option<&SagaStepExecution> {
        self.steps.iter().find(|s| s.step_name == name)
    }

    /// One line for the saga followed by one line per step.
    #[must_use]
    pub fn summary(&self) -> String {
        let execution = &self.execution;
        let mut lines = vec![format!(
            "saga {} ({}) {} at step {}/{}",
            execution.id,
            execution.saga_type,
            execution.status,
            execution.current_step,
            execution.total_steps
        )];
        for step in &self.steps {
            let symbol = match step.status {
                StepStatus::Pending => "·",
                StepStatus::Running => "▶",
                StepStatus::Completed => "✓",
                StepStatus::Failed => "✗",
                StepStatus::Retrying => "↻",
                StepStatus::Compensating => "⚠",
                StepStatus::Compensated => "↩",
                StepStatus::Skipped => "-",
            };
            let mut line = format!("{symbol} {}", step.step_name);
            if step.attempt_count > 1 {
                line.push_str(&format!(" ({} attempts)", step.attempt_count));
            }
            if let Some(error) = &step.error {
                line.push_str(&format!(": {error}"));
            }
            lines.push(line);
        }
        lines.join("\n")
    }
}

/// Result of resuming one saga during recovery.
#[derive(Debug)]
pub struct RecoveryOutcome {
    pub saga_id: SagaId,
    pub result: Result<SagaExecution, SagaError>,
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use saga_core::{Payload, SagaStatus, StepExecutionId};

    use super::*;

    fn step(index: usize, name: &str, status: StepStatus) -> SagaStepExecution {
        SagaStepExecution {
            id: StepExecutionId(i64::try_from(index).unwrap_or_default()),
            saga_execution_id: SagaId(1),
            step_name: name.to_string(),
            step_index: index,
            status,
            input: Payload::empty(),
            output: None,
            error: None,
            attempt_count: 1,
            max_retries: 3,
            next_retry_at: None,
            started_at: None,
            completed_at: None,
            compensated_at: None,
        }
    }

    #[test]
    fn summary_lists_each_step() {
        let now = Utc::now();
        let mut failed = step(2, "charge_quota", StepStatus::Failed);
        failed.attempt_count = 3;
        failed.error = Some("quota exceeded".to_string());
        let report = SagaStatusReport {
            execution: SagaExecution {
                id: SagaId(1),
                saga_type: "file_upload".to_string(),
                request_id: "req".to_string(),
                status: SagaStatus::Compensated,
                current_step: 2,
                total_steps: 4,
                context: Payload::empty(),
                error: None,
                error_code: None,
                compensation_error: None,
                started_at: now,
                completed_at: Some(now),
                updated_at: now,
            },
            steps: vec![
                step(0, "store_blob", StepStatus::Compensated),
                step(1, "register_file", StepStatus::Compensated),
                failed,
            ],
            events: Vec::new(),
        };

        let summary = report.summary();
        assert!(summary.starts_with("saga 1 (file_upload) compensated at step 2/4"));
        assert!(summary.contains("↩ store_blob"));
        assert!(summary.contains("✗ charge_quota (3 attempts): quota exceeded"));
        assert_eq!(
            report.step_named("register_file").map(|s| s.step_index),
            Some(1)
        );
        assert!(report.step(3).is_none());
    }
}
