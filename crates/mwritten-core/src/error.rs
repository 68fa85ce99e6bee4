/// An error that can occur when tracking writes.
#[derive(thiserror::Error, Debug)]
pub enum TrackerError {
    /// The call is malformed: zero length, unknown flags, or a mandatory
    /// output is missing for the requested flags.
    #[error("Invalid argument")]
    InvalidArgument,

    /// The requested range is not fully contained in mapped, writable memory.
    #[error("Invalid range")]
    InvalidRange,

    /// An output buffer is missing, has zero capacity, or cannot hold the
    /// claimed number of entries.
    #[error("Faulty output buffer")]
    FaultyBuffer,

    /// An error occurred in the tracker driver.
    #[error(transparent)]
    Driver(Box<dyn std::error::Error + Send + Sync>),

    /// An I/O error occurred.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Operation not supported.
    #[error("Operation not supported.")]
    NotSupported,

    /// No free slot is left for a new monitored region.
    #[error("Region limit reached")]
    RegionLimit,

    /// Other error.
    #[error("{0}")]
    Other(&'static str),
}

/// The closed set of outcomes a query reports to its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultCode {
    /// The call succeeded.
    Success,

    /// See [`TrackerError::InvalidArgument`].
    InvalidArgument,

    /// See [`TrackerError::InvalidRange`].
    InvalidRange,

    /// See [`TrackerError::FaultyBuffer`].
    FaultyBuffer,
}

impl ResultCode {
    /// Returns the `errno` value conventionally used for this outcome.
    pub fn errno(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::InvalidArgument | Self::InvalidRange => libc::EINVAL,
            Self::FaultyBuffer => libc::EFAULT,
        }
    }
}

impl From<Result<(), TrackerError>> for ResultCode {
    fn from(value: Result<(), TrackerError>) -> Self {
        match value {
            Ok(()) => Self::Success,
            Err(err) => err.result_code(),
        }
    }
}

impl TrackerError {
    /// Maps the error onto the closed query taxonomy.
    ///
    /// Infrastructure failures (driver, I/O, region exhaustion) mean the
    /// range could not be proven valid, so they are reported as
    /// [`ResultCode::InvalidRange`].
    pub fn result_code(&self) -> ResultCode {
        match self {
            Self::InvalidArgument => ResultCode::InvalidArgument,
            Self::FaultyBuffer => ResultCode::FaultyBuffer,
            Self::InvalidRange
            | Self::Driver(_)
            | Self::Io(_)
            | Self::NotSupported
            | Self::RegionLimit
            | Self::Other(_) => ResultCode::InvalidRange,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(ResultCode::from(Ok(())).errno(), 0);
        assert_eq!(TrackerError::InvalidArgument.result_code().errno(), libc::EINVAL);
        assert_eq!(TrackerError::InvalidRange.result_code().errno(), libc::EINVAL);
        assert_eq!(TrackerError::FaultyBuffer.result_code().errno(), libc::EFAULT);
        assert_eq!(TrackerError::RegionLimit.result_code(), ResultCode::InvalidRange);
    }
}
