//! Mapping of `git2` failures onto the classified error taxonomy.

use corral_core::Error;
use git2::{ErrorClass, ErrorCode};
use tracing::warn;

/// Classify a failure talking to `url`.
///
/// A missing `reference` becomes [`Error::RefNotFound`]; everything else is a
/// transient [`Error::Remote`].
pub(crate) fn remote_failure(url: &str, reference: Option<&str>, err: &git2::Error) -> Error {
    if let Some(reference) = reference
        && is_missing_reference(err, reference)
    {
        return Error::RefNotFound {
            reference: reference.to_owned(),
        };
    }
    warn!(
        code = ?err.code(),
        class = ?err.class(),
        error = %corral_core::redact::redact_url(err.message()),
        "remote git operation failed"
    );
    Error::remote(url, err.message())
}

fn is_missing_reference(err: &git2::Error, reference: &str) -> bool {
    let names_reference = err.message().contains(reference);
    match err.code() {
        ErrorCode::NotFound => names_reference,
        _ => {
            names_reference
                && matches!(err.class(), ErrorClass::Reference | ErrorClass::Object | ErrorClass::Odb)
                && err.message().contains("not found")
        }
    }
}

/// Wrap a local git failure as an internal error and log its correlation id.
pub(crate) fn local_failure(operation: &'static str, err: &git2::Error) -> Error {
    let error = Error::internal(operation, None, err.message());
    if let Some(correlation_id) = error.correlation_id() {
        warn!(%correlation_id, operation, code = ?err.code(), error = %err, "local git operation failed");
    }
    error
}
