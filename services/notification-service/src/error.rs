/// Errors surfaced from dedup-insert and notifier calls. There is no HTTP
/// surface here, so this exists only to give consumer handlers a single
/// `Result` type to propagate through `?` before the consumer loop decides
/// ack vs. nack.
#[derive(Debug)]
pub enum HandlerError {
    Decode(String),
    Transient(anyhow::Error),
}

impl From<anyhow::Error> for HandlerError {
    fn from(e: anyhow::Error) -> Self {
        HandlerError::Transient(e)
    }
}

impl From<sqlx::Error> for HandlerError {
    fn from(e: sqlx::Error) -> Self {
        HandlerError::Transient(anyhow::Error::from(e))
    }
}
