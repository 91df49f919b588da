use std::sync::LazyLock;

use prometheus::{
    register_int_counter,
    IntCounter,
};

macro_rules! counter {
    ($name:ident, $metric:literal, $help:literal) => {
        pub static $name: LazyLock<IntCounter> =
            LazyLock::new(|| register_int_counter!($metric, $help).unwrap());
    };
}

counter!(
    PARSE_ERROR_TOTAL,
    "sync_parse_error_total",
    "Number of parse_error responses"
);
counter!(
    VALIDATION_ERROR_TOTAL,
    "sync_validation_error_total",
    "Number of validation_error responses"
);
counter!(
    NOT_FOUND_ERROR_TOTAL,
    "sync_not_found_error_total",
    "Number of not_found responses"
);
counter!(
    UNAUTHORIZED_ERROR_TOTAL,
    "sync_unauthorized_error_total",
    "Number of unauthorized responses"
);
counter!(
    EXECUTION_ERROR_TOTAL,
    "sync_execution_error_total",
    "Number of execution_error responses"
);
counter!(
    PATCH_APPLICATION_ERROR_TOTAL,
    "sync_patch_application_error_total",
    "Number of patch_application_error responses"
);
counter!(
    INTERNAL_ERROR_TOTAL,
    "sync_internal_error_total",
    "Number of internal_error responses"
);
