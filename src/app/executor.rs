use super::ApiError;

/// Run blocking work (store access) on Tokio's blocking pool.
///
/// A panic in `f` surfaces as [`ApiError::Internal`].
pub async fn run_blocking<F, T>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    Ok(tokio::task::spawn_blocking(f).await?)
}
