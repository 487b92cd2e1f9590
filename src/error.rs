use thiserror::Error;

/// The master error type.
#[derive(Debug, Error)]
pub enum StreamError {
	#[error("{0}")]
	Custom(String),
	#[error("IO Error: {0}")]
	IoError(#[from] std::io::Error),
	#[error("Invalid argument.")]
	InvalidArgument,
	#[error("Not enough free space in the stream to satisfy the allocation.")]
	OutOfSpace,
	#[error("Append would exceed the region payload.")]
	OutOfRange,
	#[error("Stream header magic or version mismatch.")]
	BadFormat,
	#[error("Invalid block size: {0}")]
	BadBlockSize(u64),
}

impl StreamError {
	#[inline(always)]
	pub fn custom<T, S: AsRef<str>>(msg: S) -> Result<T, Self> {
		Err(StreamError::Custom(msg.as_ref().to_owned()))
	}
}

pub type StreamResult<T> = Result<T, StreamError>;
