//! Configuration and I/O errors shared across the workspace

use thiserror::Error;

/// Common error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Result alias using common Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_names_the_bad_setting() {
        let err = Error::Config("backend_url must start with http:// or https://".into());
        assert_eq!(
            err.to_string(),
            "Configuration error: backend_url must start with http:// or https://"
        );
    }

    #[test]
    fn io_error_converts_with_question_mark() {
        fn read() -> Result<String> {
            Ok(std::fs::read_to_string("/nonexistent/session-gateway.toml")?)
        }
        let err = read().unwrap_err();
        assert!(
            err.to_string().starts_with("I/O error:"),
            "got: {err}"
        );
    }

    #[test]
    fn toml_error_converts_with_question_mark() {
        fn parse() -> Result<toml::Value> {
            Ok(toml::from_str("[cookies\npath = ")?)
        }
        let err = parse().unwrap_err();
        assert!(matches!(err, Error::Toml(_)), "got: {err:?}");
    }
}
