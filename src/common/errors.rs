use anyhow::Error;
use log::error;

/// Log the full error chain and hand the error back for propagation.
pub fn handle_error(error: Error) -> Error {
    error!("{:?}", error);
    error
}
