use thiserror::Error;

#[derive(Debug, Error)]
pub enum OcservError {
    #[error("Failed to run `{command}`: {source}")]
    ProcessError {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Required binary `{0}` is not installed")]
    MissingBinary(&'static str),
    #[error("`{command}` exited with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },
    #[error("Failed to parse occtl output: {0}")]
    InvalidOutput(#[from] serde_json::Error),
}
