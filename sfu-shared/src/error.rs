use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    #[error("unknown method")]
    ErrUnknownMethod,
    #[error("router not found")]
    ErrRouterNotFound,
    #[error("producer not found")]
    ErrProducerNotFound,
    #[error("consumer not found")]
    ErrConsumerNotFound,
    #[error("duplicated id")]
    ErrDuplicatedId,
    #[error("missing internal.{0}")]
    ErrMissingInternalField(&'static str),
    #[error("missing data.{0}")]
    ErrMissingDataField(&'static str),
    #[error("invalid empty rtpParameters.encodings")]
    ErrEmptyEncodings,
    #[error("missing rtpParameters.encodings[0].ssrc")]
    ErrMissingEncodingSsrc,
    #[error("no codec matches the encoding payload type")]
    ErrNoMatchingCodec,
    #[error("consumer not enabled")]
    ErrConsumerNotEnabled,
    #[error("ssrc already handled by another stream")]
    ErrDuplicatedSsrc,
    #[error("channel frame exceeds maximum size")]
    ErrFrameTooLarge,
    #[error("invalid JSON in channel frame: {0}")]
    ErrInvalidJson(String),
    #[error("invalid request: {0}")]
    ErrInvalidRequest(String),
}
