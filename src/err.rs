use thiserror::Error;

/// Error kinds shared by every layer of the crate.
///
/// Operations store errors in their records and compare them at branch
/// points (e.g. growing a buffer on `TooManyTasks`, treating `Eof` as a
/// normal end of enumeration), so the type is `Clone + PartialEq` rather
/// than wrapping source errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("Bad parameters")]
    BadParms,
    #[error("Buffer allocation or capacity exceeded")]
    Buffer,
    #[error("Unrecognised asynchronous operation handle")]
    BadAsyncHandle,
    #[error("Asynchronous operation in an unexpected state")]
    BadAsyncState,
    #[error("Not a supported asynchronous operation")]
    BadAsyncOp,
    #[error("Not a supported unified operation")]
    BadUnifiedOp,
    #[error("Unrecognised pollword handle")]
    BadPollwordHandle,
    #[error("Invalid name")]
    BadName,
    #[error("End of file")]
    Eof,
    #[error("Not found")]
    NotFound,
    #[error("Operation not supported by the remote device")]
    RemoteNotSupported,
    #[error("Drive empty")]
    DriveEmpty,
    #[error("Remote device not ready")]
    RemoteNotReady,
    #[error("Device not found")]
    DeviceNotFound,
    #[error("Not connected to a remote server")]
    NoRemoteService,
    #[error("Operation in use")]
    InUse,
    #[error("Too many tasks for the supplied buffer")]
    TooManyTasks,
    #[error("Escape")]
    Escape,
    #[error("Clients are still registered")]
    ClientsRegistered,
    /// Catch-all for errors raised on the far side of the wire.
    #[error("Remote error: {0}")]
    Remote(String),
    /// Host filesystem failure, reduced to its message.
    #[error("{0}")]
    Host(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        match err.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound,
            std::io::ErrorKind::UnexpectedEof => Error::Eof,
            _ => Error::Host(err.to_string()),
        }
    }
}
