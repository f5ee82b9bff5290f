use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    FigmentError(#[from] figment::Error),
    #[error("invalid timeout for `{field}`: {value} seconds")]
    InvalidTimeout { field: &'static str, value: f64 },
}
