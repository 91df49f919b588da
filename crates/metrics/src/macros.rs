/// Register an `IntCounter` with the default Prometheus registry, storing it
/// in a lazily-initialized static.
#[macro_export]
macro_rules! register_counter {
    ($NAME:ident, $METRIC:literal, $HELP:literal) => {
        static $NAME: std::sync::LazyLock<$crate::prometheus::IntCounter> =
            std::sync::LazyLock::new(|| {
                $crate::prometheus::register_int_counter!($METRIC, $HELP)
                    .expect("metric registration failed")
            });
    };
}

/// Register an `IntCounterVec` with the default Prometheus registry.
#[macro_export]
macro_rules! register_counter_vec {
    ($NAME:ident, $METRIC:literal, $HELP:literal, $LABELS:expr) => {
        static $NAME: std::sync::LazyLock<$crate::prometheus::IntCounterVec> =
            std::sync::LazyLock::new(|| {
                $crate::prometheus::register_int_counter_vec!($METRIC, $HELP, $LABELS)
                    .expect("metric registration failed")
            });
    };
}

/// Register a `HistogramVec` keyed by a `status` label, for use with
/// [`crate::StatusTimer`].
#[macro_export]
macro_rules! register_status_histogram {
    ($NAME:ident, $METRIC:literal, $HELP:literal) => {
        static $NAME: std::sync::LazyLock<$crate::prometheus::HistogramVec> =
            std::sync::LazyLock::new(|| {
                $crate::prometheus::register_histogram_vec!($METRIC, $HELP, &["status"])
                    .expect("metric registration failed")
            });
    };
}

/// Register a plain `Histogram`.
#[macro_export]
macro_rules! register_histogram {
    ($NAME:ident, $METRIC:literal, $HELP:literal) => {
        static $NAME: std::sync::LazyLock<$crate::prometheus::Histogram> =
            std::sync::LazyLock::new(|| {
                $crate::prometheus::register_histogram!($METRIC, $HELP)
                    .expect("metric registration failed")
            });
    };
}
