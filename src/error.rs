use reqwest::StatusCode;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("api request failed: {status} - {body}")]
    Api { status: StatusCode, body: String },
    #[error("tool call arguments did not match the `{name}` schema: {source}")]
    ToolArguments {
        name: String,
        source: serde_json::Error,
    },
    #[error("no search results found for query: {query}")]
    NoResults { query: String },
    #[error("fetch failed: {0}")]
    Fetch(String),
    #[error("request cancelled")]
    Cancelled,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Intentional cancellations are suppressed in user-facing output,
    /// everything else is reported.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
