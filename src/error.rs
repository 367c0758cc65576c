use thiserror::Error;

pub type Result<T> = std::result::Result<T, TopoError>;

#[derive(Debug, Error)]
pub enum TopoError {
    #[error("Input error: {0}")]
    Input(String),
    #[error("Goal error: {0}")]
    Goal(String),
    #[error("Solver error: {0}")]
    Solver(String),
    #[error("Reconstruct error: {0}")]
    Reconstruct(String),
    #[error("Output error: {0}")]
    Output(String),
    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Json error: {0}")]
    Json(#[from] serde_json::Error),
}
