//! Sequencer: drive an ordered list of messages through the sender for one user.
//!
//! Best effort: a failed step is reported and the next step still runs.

use std::fmt;
use std::time::Duration;

use crate::message::EventType;
use crate::observer::DeliveryObserver;
use crate::sender::{MessageSender, SendResult};

const DEFAULT_CHECK_LIMIT: u32 = 5;

/// One message to send, then how long to wait before the next one.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub text: String,
    pub delay: Duration,
    pub event_type: EventType,
}

impl Step {
    pub fn new(text: impl Into<String>, delay_secs: u64) -> Self {
        Self {
            text: text.into(),
            delay: Duration::from_secs(delay_secs),
            event_type: EventType::Text,
        }
    }

    pub fn with_event_type(mut self, event_type: EventType) -> Self {
        self.event_type = event_type;
        self
    }
}

/// Enrollment flow for a new user.
pub fn default_enrollment() -> Vec<Step> {
    vec![
        Step::new("start", 0),
        Step::new("1-9", 10),
        Step::new("Yes, let us do it!", 10),
        Step::new("10:00", 5),
    ]
}

/// Short conversation used for end-to-end checks against a known user.
pub fn smoke_steps() -> Vec<Step> {
    vec![
        Step::new("start", 3),
        Step::new("Hello from Python test", 3),
        Step::new("1-9", 3).with_event_type(EventType::QuickReply),
        Step::new("Yes, let's do it!", 3).with_event_type(EventType::QuickReply),
        Step::new("10:00", 3),
    ]
}

/// Replace every step's delay.
pub fn with_uniform_delay(steps: Vec<Step>, delay: Duration) -> Vec<Step> {
    steps
        .into_iter()
        .map(|s| Step { delay, ..s })
        .collect()
}

#[derive(Debug)]
pub struct StepOutcome {
    pub text: String,
    pub result: SendResult,
    /// Log records dated at or after this step's send time; None when the log was not checked.
    pub replies: Option<usize>,
}

#[derive(Debug)]
pub struct SequenceReport {
    pub user_id: String,
    pub steps: Vec<StepOutcome>,
}

impl SequenceReport {
    pub fn total(&self) -> usize {
        self.steps.len()
    }

    pub fn succeeded(&self) -> usize {
        self.steps.iter().filter(|s| s.result.ok).count()
    }

    pub fn failed(&self) -> usize {
        self.total() - self.succeeded()
    }
}

impl fmt::Display for SequenceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} of {} succeeded", self.succeeded(), self.total())
    }
}

pub struct Sequencer<'a> {
    sender: &'a MessageSender,
    observer: Option<&'a DeliveryObserver>,
    check_limit: u32,
}

impl<'a> Sequencer<'a> {
    pub fn new(sender: &'a MessageSender) -> Self {
        Self {
            sender,
            observer: None,
            check_limit: DEFAULT_CHECK_LIMIT,
        }
    }

    /// Check the delivery log after every step.
    pub fn with_observer(mut self, observer: &'a DeliveryObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn with_check_limit(mut self, limit: u32) -> Self {
        self.check_limit = limit;
        self
    }

    pub async fn run(&self, user_id: &str, external_id: Option<&str>, steps: &[Step]) -> SequenceReport {
        self.run_with_progress(user_id, external_id, steps, |_, _| {}).await
    }

    /// Run all steps in order. `on_step(index, outcome)` is called after each step, before its delay.
    /// The log is only checked when both an observer and `external_id` are present.
    pub async fn run_with_progress<F>(
        &self,
        user_id: &str,
        external_id: Option<&str>,
        steps: &[Step],
        mut on_step: F,
    ) -> SequenceReport
    where
        F: FnMut(usize, &StepOutcome),
    {
        let mut outcomes = Vec::with_capacity(steps.len());
        for (i, step) in steps.iter().enumerate() {
            let result = self.sender.send(user_id, &step.text, step.event_type).await;
            if result.ok {
                log::info!("step {}/{} {:?}: ok ({:.0}ms)", i + 1, steps.len(), step.text, result.elapsed_ms);
            } else {
                log::warn!(
                    "step {}/{} {:?} failed: {}",
                    i + 1,
                    steps.len(),
                    step.text,
                    result
                        .error
                        .as_ref()
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| "unknown error".to_string())
                );
            }

            let replies = match (self.observer, external_id) {
                (Some(observer), Some(ext)) => {
                    let records = observer.check_messages(ext, self.check_limit).await;
                    Some(records.iter().filter(|r| r.created_at >= result.sent_at).count())
                }
                _ => None,
            };

            let outcome = StepOutcome {
                text: step.text.clone(),
                result,
                replies,
            };
            on_step(i, &outcome);
            outcomes.push(outcome);

            if i + 1 < steps.len() && !step.delay.is_zero() {
                tokio::time::sleep(step.delay).await;
            }
        }
        SequenceReport {
            user_id: user_id.to_string(),
            steps: outcomes,
        }
    }
}

/// Latency and success summary of a load run.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadReport {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
}

impl LoadReport {
    pub fn from_samples(samples: &[(bool, f64)]) -> Self {
        let total = samples.len();
        let succeeded = samples.iter().filter(|(ok, _)| *ok).count();
        if total == 0 {
            return Self {
                total,
                succeeded,
                failed: 0,
                avg_ms: 0.0,
                min_ms: 0.0,
                max_ms: 0.0,
            };
        }
        let times = samples.iter().map(|(_, ms)| *ms);
        Self {
            total,
            succeeded,
            failed: total - succeeded,
            avg_ms: times.clone().sum::<f64>() / total as f64,
            min_ms: times.clone().fold(f64::INFINITY, f64::min),
            max_ms: times.fold(0.0, f64::max),
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.succeeded as f64 / self.total as f64 * 100.0
        }
    }
}

impl fmt::Display for LoadReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Total: {}", self.total)?;
        writeln!(f, "Success: {} ({:.1}%)", self.succeeded, self.success_rate())?;
        writeln!(f, "Failed: {}", self.failed)?;
        writeln!(f, "Avg Response: {:.0}ms", self.avg_ms)?;
        writeln!(f, "Min Response: {:.0}ms", self.min_ms)?;
        write!(f, "Max Response: {:.0}ms", self.max_ms)
    }
}

/// Send `count` numbered messages to `user_id`, `delay` apart, and summarize latency.
pub async fn load_test(sender: &MessageSender, user_id: &str, count: usize, delay: Duration) -> LoadReport {
    let mut samples = Vec::with_capacity(count);
    for i in 0..count {
        let text = format!(
            "Load test message {}/{} at {}",
            i + 1,
            count,
            chrono::Local::now().format("%H:%M:%S")
        );
        let result = sender.send(user_id, &text, EventType::Text).await;
        samples.push((result.ok, result.elapsed_ms));
        if i + 1 < count && !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
    LoadReport::from_samples(&samples)
}
