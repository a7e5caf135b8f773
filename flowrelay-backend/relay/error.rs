/// Connection-level failures of a relay session.
///
/// Per-record parse failures never become a `RelayError`; they are logged
/// and skipped inside the parser.
#[derive(thiserror::Error, Debug)]
pub enum RelayError {
    #[error("could not connect to automation backend: {0}")]
    Connect(String),

    #[error("automation backend returned {status}: {body}")]
    UpstreamStatus { status: u16, body: String },

    #[error("automation backend reported an error: {0}")]
    Upstream(String),

    #[error("upstream transport error: {0}")]
    Transport(String),

    #[error("timeout")]
    Timeout,

    #[error("cancelled")]
    Cancelled,
}

impl RelayError {
    /// Text shown to the end user in a terminal `error` event.
    pub fn user_message(&self) -> String {
        match self {
            RelayError::Timeout => {
                "The automation backend took too long to answer. Please try again.".to_string()
            }
            RelayError::Cancelled => "Request cancelled".to_string(),
            RelayError::Connect(_) => {
                "Could not reach the automation backend. Please try again later.".to_string()
            }
            RelayError::UpstreamStatus { status, .. } => {
                format!("The automation backend rejected the request (HTTP {status}).")
            }
            RelayError::Upstream(message) => message.clone(),
            RelayError::Transport(_) => {
                "The connection to the automation backend was interrupted.".to_string()
            }
        }
    }
}

impl From<reqwest::Error> for RelayError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            RelayError::Timeout
        } else if e.is_connect() {
            RelayError::Connect(e.to_string())
        } else {
            RelayError::Transport(e.to_string())
        }
    }
}
