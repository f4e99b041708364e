use thiserror::Error;

#[derive(Error, Debug)]
pub enum EndpointError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown endpoint: {0}")]
    UnknownEndpoint(String),

    #[error("Expression error: {0}")]
    Expression(String),
}

impl From<fc_config::ConfigError> for EndpointError {
    fn from(err: fc_config::ConfigError) -> Self {
        EndpointError::Config(err.to_string())
    }
}
