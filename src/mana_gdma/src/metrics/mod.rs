/*
Copyright 2026  The Hyperlight Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

//! Metrics emitted by the transport.
//!
//! Nothing is recorded unless the application installs a `metrics` recorder.

use std::sync::Once;
use std::time::{Duration, Instant};

#[macro_use]
mod metrics_macro;

use metrics_macro::NamedMetric;

use crate::queue::QueueKind;

static LABEL_MSG_TYPE: &str = "msg_type";
static LABEL_REASON: &str = "reason";
static LABEL_QUEUE_KIND: &str = "queue_kind";

define_metrics! {
    CounterMetric {
        HwcTimeouts { msg_type: u32 } => {
            name: "mana_hwc_timeouts_total",
            description: "Number of hardware channel requests that got no response in time",
            unit: metrics::Unit::Count,
        },
        HwcProtocolErrors { reason: &'static str } => {
            name: "mana_hwc_protocol_errors_total",
            description: "Number of malformed or unexpected hardware channel messages",
            unit: metrics::Unit::Count,
        },
        QueueOverflows { kind: QueueKind } => {
            name: "mana_queue_overflows_total",
            description: "Number of completion or event queue overflows detected",
            unit: metrics::Unit::Count,
        },
    }
    HistogramMetric {
        HwcRequestDuration { msg_type: u32, duration: Duration } => {
            name: "mana_hwc_request_duration_seconds",
            description: "Round trip time of hardware channel requests",
            unit: metrics::Unit::Seconds,
        },
    }
}

impl CounterMetric {
    #[must_use]
    pub(crate) fn hwc_timeout(msg_type: u32) -> Self {
        CounterMetric::HwcTimeouts { msg_type }
    }

    #[must_use]
    pub(crate) fn hwc_protocol_error(reason: &'static str) -> Self {
        CounterMetric::HwcProtocolErrors { reason }
    }

    #[must_use]
    pub(crate) fn queue_overflow(kind: QueueKind) -> Self {
        CounterMetric::QueueOverflows { kind }
    }
}

impl HistogramMetric {
    /// Runs `f` and records how long it took as a request round trip of `msg_type`.
    pub(crate) fn time_hwc_request<T, F: FnOnce() -> T>(msg_type: u32, f: F) -> T {
        let start = Instant::now();
        let result = f();
        HistogramMetric::HwcRequestDuration {
            msg_type,
            duration: start.elapsed(),
        }
        .emit();
        result
    }
}

/// A metric which can be emitted to the installed recorder
pub(crate) trait EmittableMetric {
    /// Emits the metric. The first emission of each variant also describes it.
    fn emit(self);
}

impl EmittableMetric for CounterMetric {
    fn emit(self) {
        let name = self.name();
        let unit = self.unit();
        let description = self.description();

        match self {
            CounterMetric::HwcTimeouts { msg_type } => {
                static DESCRIBE: Once = Once::new();
                DESCRIBE.call_once(|| metrics::describe_counter!(name, unit, description));
                metrics::counter!(name, LABEL_MSG_TYPE => msg_type.to_string()).increment(1);
            }
            CounterMetric::HwcProtocolErrors { reason } => {
                static DESCRIBE: Once = Once::new();
                DESCRIBE.call_once(|| metrics::describe_counter!(name, unit, description));
                metrics::counter!(name, LABEL_REASON => reason).increment(1);
            }
            CounterMetric::QueueOverflows { kind } => {
                static DESCRIBE: Once = Once::new();
                DESCRIBE.call_once(|| metrics::describe_counter!(name, unit, description));
                metrics::counter!(name, LABEL_QUEUE_KIND => kind.as_str()).increment(1);
            }
        }
    }
}

impl EmittableMetric for HistogramMetric {
    fn emit(self) {
        let name = self.name();
        let unit = self.unit();
        let description = self.description();

        match self {
            HistogramMetric::HwcRequestDuration { msg_type, duration } => {
                static DESCRIBE: Once = Once::new();
                DESCRIBE.call_once(|| metrics::describe_histogram!(name, unit, description));
                metrics::histogram!(name, LABEL_MSG_TYPE => msg_type.to_string()).record(duration);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use metrics::{Key, Label};
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};
    use metrics_util::{CompositeKey, MetricKind};

    use super::*;

    #[test]
    fn counters_carry_labels() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        let snapshot = metrics::with_local_recorder(&recorder, || {
            CounterMetric::hwc_timeout(12).emit();
            CounterMetric::hwc_timeout(12).emit();
            CounterMetric::hwc_protocol_error("unknown_msg_id").emit();
            CounterMetric::queue_overflow(QueueKind::Completion).emit();
            snapshotter.snapshot()
        });

        #[expect(clippy::mutable_key_type)]
        let snapshot = snapshot.into_hashmap();
        assert_eq!(snapshot.len(), 3);

        let key = CompositeKey::new(
            MetricKind::Counter,
            Key::from_parts(
                "mana_hwc_timeouts_total",
                vec![Label::new(LABEL_MSG_TYPE, "12")],
            ),
        );
        assert_eq!(snapshot.get(&key).unwrap().2, DebugValue::Counter(2));

        let key = CompositeKey::new(
            MetricKind::Counter,
            Key::from_parts(
                "mana_hwc_protocol_errors_total",
                vec![Label::new(LABEL_REASON, "unknown_msg_id")],
            ),
        );
        assert_eq!(snapshot.get(&key).unwrap().2, DebugValue::Counter(1));

        let key = CompositeKey::new(
            MetricKind::Counter,
            Key::from_parts(
                "mana_queue_overflows_total",
                vec![Label::new(LABEL_QUEUE_KIND, "cq")],
            ),
        );
        assert_eq!(snapshot.get(&key).unwrap().2, DebugValue::Counter(1));
    }

    #[test]
    fn request_duration_is_recorded() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        let (value, snapshot) = metrics::with_local_recorder(&recorder, || {
            let value = HistogramMetric::time_hwc_request(4, || 7);
            HistogramMetric::HwcRequestDuration {
                msg_type: 4,
                duration: Duration::from_secs(2),
            }
            .emit();
            (value, snapshotter.snapshot())
        });
        assert_eq!(value, 7);

        #[expect(clippy::mutable_key_type)]
        let snapshot = snapshot.into_hashmap();
        let key = CompositeKey::new(
            MetricKind::Histogram,
            Key::from_parts(
                "mana_hwc_request_duration_seconds",
                vec![Label::new(LABEL_MSG_TYPE, "4")],
            ),
        );
        assert!(matches!(
            &snapshot.get(&key).unwrap().2,
            DebugValue::Histogram(samples) if samples.len() == 2 && samples[1].0 == 2.0
        ));
    }

    #[test]
    fn metric_names_are_unique() {
        let mut names: Vec<_> = CounterMetric::NAMES
            .iter()
            .chain(HistogramMetric::NAMES)
            .collect();
        let total = names.len();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), total);
    }
}
