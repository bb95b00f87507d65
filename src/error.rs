pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // Parsing errors
    #[error("{0}")]
    ParsingError(String),
    // Bounce classifier errors
    #[error("Failed to classify bounce message: {0}")]
    BounceClassification(String),
    // Database errors
    #[error(transparent)]
    DatabaseError(#[from] sqlx::Error),
}
