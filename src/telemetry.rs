//! Sliding-window telemetry.
//!
//! A [`Metric`] keeps a deque of time-stamped points, newest at the
//! front, trimmed on every write by count cap or TTL. Writes land on
//! every request admission, completion and failure, so the write path
//! is a short lock around a deque operation. Aggregations scan from
//! the newest point backward until they fall off the window.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, LazyLock, Mutex};
use std::time::{Duration, Instant};

/// Reference point for frame quantization; only differences matter.
static EPOCH: LazyLock<Instant> = LazyLock::new(Instant::now);

#[derive(Debug, Clone, Copy)]
struct Point {
    frame: i64,
    time: Instant,
    value: f64,
}

/// How a metric retains its points.
#[derive(Debug, Clone, Copy)]
enum Retention {
    /// Keep at most this many points.
    Count(usize),
    /// Keep points younger than the TTL, quantized into frames.
    Window { ttl: Duration, frame: Duration },
}

/// A named series of time-stamped samples with windowed aggregation.
#[derive(Debug)]
pub struct Metric {
    name: String,
    retention: Retention,
    points: Mutex<VecDeque<Point>>,
}

impl Metric {
    /// Window-retained metric with the default 100 ms frame.
    pub fn windowed(name: impl Into<String>, ttl: Duration) -> Self {
        Metric::windowed_with_frame(name, ttl, Duration::from_millis(100))
    }

    pub fn windowed_with_frame(name: impl Into<String>, ttl: Duration, frame: Duration) -> Self {
        Metric {
            name: name.into(),
            retention: Retention::Window { ttl, frame },
            points: Mutex::new(VecDeque::new()),
        }
    }

    /// Count-retained metric: adds accumulate into one running point,
    /// sets replace it, and the deque never outgrows `count`.
    pub fn counted(name: impl Into<String>, count: usize) -> Self {
        Metric {
            name: name.into(),
            retention: Retention::Count(count.max(1)),
            points: Mutex::new(VecDeque::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Replace the value of the current frame (or open a new one).
    pub fn set_value(&self, value: f64) {
        self.record(value, Instant::now(), false);
    }

    /// Accumulate into the current frame (or open a new one).
    pub fn add_value(&self, value: f64) {
        self.record(value, Instant::now(), true);
    }

    /// Write with an explicit timestamp; used by tests and replayers.
    pub fn record(&self, value: f64, time: Instant, accumulate: bool) {
        let frame_index = self.frame_index(time);
        let mut points = self.points.lock().unwrap();

        match self.retention {
            Retention::Count(cap) => {
                while points.len() > cap {
                    points.pop_back();
                }
            }
            Retention::Window { ttl, .. } => {
                if !ttl.is_zero() {
                    let expire = time.checked_sub(ttl);
                    while let Some(last) = points.back() {
                        match expire {
                            Some(expire) if last.time < expire => {
                                points.pop_back();
                            }
                            _ => break,
                        }
                    }
                }
            }
        }

        match points.front_mut() {
            Some(front) if front.frame == frame_index => {
                front.time = time;
                if accumulate {
                    front.value += value;
                } else {
                    front.value = value;
                }
            }
            _ => points.push_front(Point {
                frame: frame_index,
                time,
                value,
            }),
        }
    }

    fn frame_index(&self, time: Instant) -> i64 {
        // Signed so that samples replayed from before the lazy epoch
        // still land in distinct frames.
        let nanos = match time.checked_duration_since(*EPOCH) {
            Some(d) => d.as_nanos() as i128,
            None => -(EPOCH.duration_since(time).as_nanos() as i128),
        };
        match self.retention {
            // Count retention uses one infinite frame: adds accumulate
            // into a single running point, sets replace it.
            Retention::Count(_) => 0,
            Retention::Window { frame, .. } => {
                let frame = frame.as_nanos().max(1) as i128;
                nanos.div_euclid(frame) as i64
            }
        }
    }

    /// Sum of values inside the trailing `interval`.
    pub fn sum(&self, interval: Duration) -> f64 {
        self.fold_window(interval).0
    }

    /// Average value of the points inside the trailing `interval`.
    pub fn avg(&self, interval: Duration) -> f64 {
        let (sum, count, _) = self.fold_window(interval);
        if count == 0 {
            0.0
        } else {
            sum / count as f64
        }
    }

    /// Rate per second over the trailing `interval`: sum divided by the
    /// span between the newest and oldest in-window points. Zero when
    /// the span is zero.
    pub fn avg_per_sec(&self, interval: Duration) -> f64 {
        let (sum, _, span) = self.fold_window(interval);
        let seconds = span.as_secs_f64();
        if seconds > 0.0 {
            sum / seconds
        } else {
            0.0
        }
    }

    /// Sum of the newest `count` points.
    pub fn sum_count(&self, count: usize) -> f64 {
        let points = self.points.lock().unwrap();
        points.iter().take(count).map(|p| p.value).sum()
    }

    /// Average of the newest `count` points.
    pub fn avg_count(&self, count: usize) -> f64 {
        let points = self.points.lock().unwrap();
        let taken = points.len().min(count);
        if taken == 0 {
            return 0.0;
        }
        points.iter().take(taken).map(|p| p.value).sum::<f64>() / taken as f64
    }

    pub fn point_count(&self) -> usize {
        self.points.lock().unwrap().len()
    }

    fn fold_window(&self, interval: Duration) -> (f64, usize, Duration) {
        let points = self.points.lock().unwrap();
        let Some(front) = points.front() else {
            return (0.0, 0, Duration::ZERO);
        };
        let earliest = Instant::now().checked_sub(interval);

        let newest = front.time;
        let mut oldest = newest;
        let mut sum = 0.0;
        let mut count = 0usize;
        for point in points.iter() {
            if let Some(earliest) = earliest {
                if point.time < earliest {
                    break;
                }
            }
            oldest = point.time;
            sum += point.value;
            count += 1;
        }

        (sum, count, newest.duration_since(oldest))
    }
}

/// Name-keyed metric registry.
///
/// `metric_*` calls are create-or-get, so call sites can look their
/// metric up lazily on the hot path. The instance behind the free
/// functions is process-wide; tests build their own.
#[derive(Debug, Default)]
pub struct TelemetryManager {
    metrics: Mutex<BTreeMap<String, Arc<Metric>>>,
}

impl TelemetryManager {
    pub fn new() -> Self {
        TelemetryManager::default()
    }

    /// Create-or-get a window-retained metric.
    pub fn metric_windowed(&self, name: &str, ttl: Duration) -> Arc<Metric> {
        let mut metrics = self.metrics.lock().unwrap();
        metrics
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Metric::windowed(name, ttl)))
            .clone()
    }

    /// Create-or-get a count-retained metric.
    pub fn metric_counted(&self, name: &str, count: usize) -> Arc<Metric> {
        let mut metrics = self.metrics.lock().unwrap();
        metrics
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Metric::counted(name, count)))
            .clone()
    }

    /// Snapshot of every registered metric, name-ordered.
    pub fn metrics(&self) -> Vec<Arc<Metric>> {
        self.metrics.lock().unwrap().values().cloned().collect()
    }
}

static GLOBAL: LazyLock<TelemetryManager> = LazyLock::new(TelemetryManager::new);

/// Process-wide create-or-get of a window-retained metric.
pub fn metric_windowed(name: &str, ttl: Duration) -> Arc<Metric> {
    GLOBAL.metric_windowed(name, ttl)
}

/// Process-wide create-or-get of a count-retained metric.
pub fn metric_counted(name: &str, count: usize) -> Arc<Metric> {
    GLOBAL.metric_counted(name, count)
}

/// Snapshot of the process-wide registry.
pub fn metrics() -> Vec<Arc<Metric>> {
    GLOBAL.metrics()
}
