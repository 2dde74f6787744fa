//! A `Recorder` that narrates metric activity through `tracing` instead of
//! shipping it anywhere

use std::sync::Arc;

use super::{hist, Metric, Unit, SPAN_LEVEL};

use metrics::{
    Counter, CounterFn, Gauge, GaugeFn, Histogram, Key, KeyName, Metadata, SharedString,
};
use metrics_util::registry::{Registry, Storage};
use parking_lot::Mutex;
use tracing::{debug, span};

pub struct CounterHandle(pub Mutex<Metric<u64>>);

impl CounterHandle {
    fn new(key: Key, unit: Option<Unit>) -> Self {
        Self(Metric::new(key, 0, unit))
    }
}

impl CounterFn for CounterHandle {
    fn absolute(&self, value: u64) {
        let mut counter = self.0.lock();
        counter.value = value;

        let key = counter.key.name();
        let unit = counter.unit.as_canonical_label();
        let span = span!(SPAN_LEVEL, "counter", %key);
        let _enter = span.enter();
        debug!("set to {value}{unit}");
    }

    fn increment(&self, value: u64) {
        let mut counter = self.0.lock();
        counter.value = counter.value.saturating_add(value);

        let key = counter.key.name();
        let unit = counter.unit.as_canonical_label();
        let counter_value = counter.value;
        let span = span!(SPAN_LEVEL, "counter", %key);
        let _enter = span.enter();
        debug!("incremented by {value}{unit} to {counter_value}{unit}",);
    }
}

pub struct GaugeHandle(pub Mutex<Metric<f64>>);

impl GaugeHandle {
    fn new(key: Key, unit: Option<Unit>) -> Self {
        Self(Metric::new(key, 0.0, unit))
    }
}

impl GaugeFn for GaugeHandle {
    fn increment(&self, value: f64) {
        let mut gauge = self.0.lock();
        gauge.value += value;

        let key = gauge.key.name();
        let unit = gauge.unit.as_canonical_label();
        let gauge_value = gauge.value;
        let span = span!(SPAN_LEVEL, "gauge", %key);
        let _enter = span.enter();
        debug!("incremented by {value}{unit} to {gauge_value}{unit}",);
    }

    fn decrement(&self, value: f64) {
        let mut gauge = self.0.lock();
        gauge.value -= value;

        let key = gauge.key.name();
        let unit = gauge.unit.as_canonical_label();
        let gauge_value = gauge.value;
        let span = span!(SPAN_LEVEL, "gauge", %key);
        let _enter = span.enter();
        debug!("decremented by {value}{unit} to {gauge_value}{unit}",);
    }

    fn set(&self, value: f64) {
        let mut gauge = self.0.lock();
        gauge.value = value;

        let key = gauge.key.name();
        let unit = gauge.unit.as_canonical_label();
        let span = span!(SPAN_LEVEL, "gauge", %key);
        let _enter = span.enter();
        debug!("set to {value}{unit}",);
    }
}

struct MetricStore;

impl Storage<Key> for MetricStore {
    type Counter = Arc<CounterHandle>;
    type Gauge = Arc<GaugeHandle>;
    type Histogram = Arc<hist::Handle>;

    fn counter(&self, key: &Key) -> Self::Counter {
        Arc::new(CounterHandle::new(key.to_owned(), None))
    }

    fn gauge(&self, key: &Key) -> Self::Gauge {
        Arc::new(GaugeHandle::new(key.to_owned(), None))
    }

    fn histogram(&self, key: &Key) -> Self::Histogram {
        Arc::new(hist::Handle::new(key.to_owned(), None))
    }
}

pub struct LogRecorder(Registry<Key, MetricStore>);

impl Default for LogRecorder {
    fn default() -> Self {
        Self(Registry::new(MetricStore))
    }
}

impl metrics::Recorder for LogRecorder {
    fn describe_gauge(&self, key: KeyName, unit: Option<Unit>, _desc: SharedString) {
        let key = Key::from_name(key);
        let gauge = self.0.get_or_create_gauge(&key, Arc::clone);
        gauge.0.lock().unit = unit.unwrap_or(Unit::Count);
    }

    fn register_gauge(&self, key: &Key, _: &Metadata<'_>) -> Gauge {
        let gauge = self.0.get_or_create_gauge(key, Arc::clone);
        Gauge::from_arc(gauge)
    }

    fn describe_counter(&self, key: KeyName, unit: Option<Unit>, _desc: SharedString) {
        let key = Key::from_name(key);
        let counter = self.0.get_or_create_counter(&key, Arc::clone);
        counter.0.lock().unit = unit.unwrap_or(Unit::Count);
    }

    fn register_counter(&self, key: &Key, _: &Metadata<'_>) -> Counter {
        let counter = self.0.get_or_create_counter(key, Arc::clone);
        Counter::from_arc(counter)
    }

    fn describe_histogram(&self, key: KeyName, unit: Option<Unit>, _desc: SharedString) {
        let key = Key::from_name(key);
        let hist = self.0.get_or_create_histogram(&key, Arc::clone);
        hist.0.lock().unit = unit.unwrap_or(Unit::Count);
    }

    fn register_histogram(&self, key: &Key, _: &Metadata<'_>) -> Histogram {
        let hist = self.0.get_or_create_histogram(key, Arc::clone);
        Histogram::from_arc(hist)
    }
}
