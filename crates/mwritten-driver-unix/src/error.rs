/// Error type for the Linux process driver.
#[derive(Debug)]
pub enum Error {
    /// An I/O error occurred.
    Io(std::io::Error),

    /// A line of the mapping table could not be parsed.
    MalformedMapping,

    /// A fault handler is already installed in this process.
    AlreadyAttached,

    /// Operation not supported.
    NotSupported,
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Self::Io(error)
    }
}

impl From<Error> for mwritten_core::TrackerError {
    fn from(error: Error) -> Self {
        match error {
            Error::Io(error) => Self::Io(error),
            Error::MalformedMapping => Self::Other("malformed mapping table entry"),
            Error::AlreadyAttached => Self::Other("a fault handler is already attached"),
            Error::NotSupported => Self::NotSupported,
        }
    }
}
