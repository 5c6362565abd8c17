use thiserror::Error;

/// Why an embed could not be created.
///
/// Every variant is reported before the instance exists. When a step fails
/// after the iframe was mounted, the iframe is removed again first.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    /// No mount target was given, or the selector was empty
    #[error("\"target\" is required")]
    MissingTarget,

    /// The selector did not match any element on the page
    #[error("No element matches target {0:?}")]
    TargetNotFound(String),

    /// The sandbox location is not an absolute URL with a usable origin
    #[error("Invalid sandbox URL: {0}")]
    InvalidSandboxUrl(String),

    /// The initial state could not be encoded into the iframe URL
    #[error("Initial state could not be encoded: {0}")]
    InvalidInitialState(String),

    /// The page refused to create the iframe or register the listener
    #[error("Host page error: {0}")]
    Host(String),
}
