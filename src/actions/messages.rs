pub const EXPLORER_METRICS_DEFINITION_DOESNT_EXIST: &str = "Metrics definition does not exist.";
pub const EXPLORER_SOURCE_MODEL_DOESNT_EXIST: &str =
    "Source model does not exist. Select a valid model for the metrics definition.";
pub const EXPLORER_SOURCE_MODEL_IS_INVALID: &str =
    "Source model is invalid. Fix the errors in the model query.";
pub const EXPLORER_TIME_DIMENSION_DOESNT_EXIST: &str =
    "Time dimension does not exist. Select a timestamp column from the source model.";
pub const NO_VALID_MEASURES: &str = "None of the requested measures are valid.";
