//! The run's telemetry sink: logs, process errors, diagnoses, and
//! measurement series.
//!
//! Logs flow straight into `tracing`; errors, diagnoses and measurements
//! are also recorded on the step so the orchestrator (and the test suite)
//! can count and inspect them after the fact. Steps are cheap to clone and
//! safe to share across worker threads.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Symptom string attached to software/process errors.
pub const PROCESS_ERROR: &str = "process-error";

/// Verdict for a data miscompare localized to a memory word.
pub const MEMORY_MISCOMPARE_FAIL: &str = "memory-miscompare-fail";
/// Verdict for an address-tag word that did not equal its own address.
pub const TAG_MISCOMPARE_FAIL: &str = "address-tag-miscompare-fail";
/// Verdict for a whole CRC block matching a different pattern.
pub const BLOCK_PATTERN_MISMATCH_FAIL: &str = "block-pattern-mismatch-fail";
/// Verdict for a cache-coherency counter mismatch.
pub const CACHE_COHERENCY_FAIL: &str = "cache-coherency-fail";
/// Verdict for a CPU running below the configured frequency threshold.
pub const CPU_FREQUENCY_TOO_LOW_FAIL: &str = "cpu-frequency-too-low-fail";

/// Log severity, mapped onto `tracing` levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Chatty progress detail.
    Debug,
    /// Run milestones.
    Info,
    /// Suspicious but non-fatal conditions.
    Warning,
    /// Software faults.
    Error,
}

/// Whether a diagnosis reports healthy or failing hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DiagnosisKind {
    /// Hardware behaved as expected.
    Pass,
    /// Hardware misbehaved.
    Fail,
}

/// A hardware verdict emitted by a worker or probe.
#[derive(Debug, Clone, Serialize)]
pub struct Diagnosis {
    /// Machine-parseable verdict string (one of the constants above).
    pub verdict: String,
    /// Pass or fail.
    pub kind: DiagnosisKind,
    /// Human-readable localization detail.
    pub message: String,
}

/// A single named scalar observation.
#[derive(Debug, Clone, Serialize)]
pub struct Measurement {
    /// Measurement name.
    pub name: String,
    /// Unit string, empty when dimensionless.
    pub unit: String,
    /// Observed value.
    pub value: f64,
}

#[derive(Debug, Clone, Serialize)]
struct SeriesRecord {
    name: String,
    unit: String,
    values: Vec<f64>,
}

struct StepInner {
    name: String,
    errors: AtomicU64,
    diagnoses: Mutex<Vec<Diagnosis>>,
    measurements: Mutex<Vec<Measurement>>,
    series: Mutex<Vec<SeriesRecord>>,
}

/// One named phase of the run, shared by every thread working in it.
#[derive(Clone)]
pub struct Step {
    inner: Arc<StepInner>,
}

impl Step {
    /// Open a step.
    #[must_use]
    pub fn new(name: &str) -> Self {
        tracing::info!(step = name, "step started");
        Self {
            inner: Arc::new(StepInner {
                name: name.to_string(),
                errors: AtomicU64::new(0),
                diagnoses: Mutex::new(Vec::new()),
                measurements: Mutex::new(Vec::new()),
                series: Mutex::new(Vec::new()),
            }),
        }
    }

    /// The step's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Emit a log line attributed to this step.
    pub fn log(&self, severity: Severity, message: impl AsRef<str>) {
        let message = message.as_ref();
        match severity {
            Severity::Debug => tracing::debug!(step = %self.inner.name, "{message}"),
            Severity::Info => tracing::info!(step = %self.inner.name, "{message}"),
            Severity::Warning => tracing::warn!(step = %self.inner.name, "{message}"),
            Severity::Error => tracing::error!(step = %self.inner.name, "{message}"),
        }
    }

    /// Shorthand for [`Severity::Debug`] logs.
    pub fn debug(&self, message: impl AsRef<str>) {
        self.log(Severity::Debug, message);
    }

    /// Record a software/process error.
    pub fn add_error(&self, symptom: &str, message: impl AsRef<str>) {
        self.inner.errors.fetch_add(1, Ordering::Relaxed);
        tracing::error!(step = %self.inner.name, symptom, "{}", message.as_ref());
    }

    /// Record a hardware diagnosis.
    pub fn add_diagnosis(&self, verdict: &str, kind: DiagnosisKind, message: impl Into<String>) {
        let diagnosis = Diagnosis {
            verdict: verdict.to_string(),
            kind,
            message: message.into(),
        };
        match kind {
            DiagnosisKind::Fail => {
                tracing::error!(
                    step = %self.inner.name,
                    verdict,
                    "{}",
                    diagnosis.message
                );
            }
            DiagnosisKind::Pass => {
                tracing::info!(step = %self.inner.name, verdict, "{}", diagnosis.message);
            }
        }
        self.inner.diagnoses.lock().push(diagnosis);
    }

    /// Record a scalar measurement.
    pub fn add_measurement(&self, name: &str, unit: &str, value: f64) {
        tracing::info!(step = %self.inner.name, name, unit, value, "measurement");
        self.inner.measurements.lock().push(Measurement {
            name: name.to_string(),
            unit: unit.to_string(),
            value,
        });
    }

    /// Open a measurement series on this step.
    #[must_use]
    pub fn series(&self, name: &str, unit: &str) -> MeasurementSeries {
        let mut series = self.inner.series.lock();
        series.push(SeriesRecord {
            name: name.to_string(),
            unit: unit.to_string(),
            values: Vec::new(),
        });
        MeasurementSeries { step: self.clone(), index: series.len() - 1 }
    }

    /// Count of process errors recorded so far.
    #[must_use]
    pub fn error_count(&self) -> u64 {
        self.inner.errors.load(Ordering::Relaxed)
    }

    /// Snapshot of every diagnosis recorded so far.
    #[must_use]
    pub fn diagnoses(&self) -> Vec<Diagnosis> {
        self.inner.diagnoses.lock().clone()
    }

    /// Count of fail diagnoses recorded so far.
    #[must_use]
    pub fn fail_count(&self) -> u64 {
        self.inner
            .diagnoses
            .lock()
            .iter()
            .filter(|d| d.kind == DiagnosisKind::Fail)
            .count() as u64
    }

    /// Snapshot of every scalar measurement recorded so far.
    #[must_use]
    pub fn measurements(&self) -> Vec<Measurement> {
        self.inner.measurements.lock().clone()
    }

    /// Values recorded under the series called `name`, if any.
    #[must_use]
    pub fn series_values(&self, name: &str) -> Option<Vec<f64>> {
        self.inner
            .series
            .lock()
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.values.clone())
    }
}

/// Handle appending elements to one series of a step.
pub struct MeasurementSeries {
    step: Step,
    index: usize,
}

impl MeasurementSeries {
    /// Append one element.
    pub fn add_element(&mut self, value: f64) {
        let mut series = self.step.inner.series.lock();
        if let Some(record) = series.get_mut(self.index) {
            record.values.push(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_counts_errors() {
        let step = Step::new("setup");
        assert_eq!(step.error_count(), 0);
        step.add_error(PROCESS_ERROR, "mutex failure");
        step.add_error(PROCESS_ERROR, "page pop failure");
        assert_eq!(step.error_count(), 2);
    }

    #[test]
    fn test_step_records_diagnoses() {
        let step = Step::new("run");
        step.add_diagnosis(MEMORY_MISCOMPARE_FAIL, DiagnosisKind::Fail, "bad word");
        step.add_diagnosis("healthy", DiagnosisKind::Pass, "all clear");
        assert_eq!(step.diagnoses().len(), 2);
        assert_eq!(step.fail_count(), 1);
        assert_eq!(step.diagnoses()[0].verdict, MEMORY_MISCOMPARE_FAIL);
    }

    #[test]
    fn test_clones_share_state() {
        let step = Step::new("shared");
        let clone = step.clone();
        clone.add_error(PROCESS_ERROR, "from clone");
        assert_eq!(step.error_count(), 1);
    }

    #[test]
    fn test_measurements_and_series() {
        let step = Step::new("analysis");
        step.add_measurement("Total Bandwidth", "MB/s", 1234.5);
        let mut series = step.series("Reads per page", "pages");
        series.add_element(3.0);
        series.add_element(61.0);

        assert_eq!(step.measurements().len(), 1);
        assert_eq!(step.series_values("Reads per page").unwrap(), vec![3.0, 61.0]);
        assert!(step.series_values("missing").is_none());
    }

    #[test]
    fn test_step_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Step>();
    }

    #[test]
    fn test_records_are_serializable() {
        fn assert_serialize<T: serde::Serialize>() {}
        assert_serialize::<Diagnosis>();
        assert_serialize::<Measurement>();
    }
}
