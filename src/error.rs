use thiserror::Error;

/// Error taxonomy shared by every core component (spec §7).
///
/// Kinds, not exception hierarchies: callers match on the variant, the
/// message carries the specifics.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("invalid: {0}")]
    Invalid(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    /// Map a sqlx error onto the taxonomy, turning unique-constraint
    /// violations into `AlreadyExists` with the offending key named.
    pub fn from_sqlx(err: sqlx::Error, context: &str) -> Self {
        if let sqlx::Error::Database(ref db_err) = err {
            if db_err.code().as_deref() == Some("23505") {
                let constraint = db_err.constraint().unwrap_or("unknown constraint");
                return CoreError::AlreadyExists(format!(
                    "{context}: duplicate value violates constraint `{constraint}`"
                ));
            }
        }
        CoreError::Fatal(format!("{context}: {err}"))
    }
}
