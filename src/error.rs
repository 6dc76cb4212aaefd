#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("HAL_ERROR")]
    HalError,

    #[error("RAL_ERROR")]
    RalError,

    #[error("CODEC_ERROR")]
    CodecError,

    #[error("CONF_ERROR")]
    ConfError,

    #[error("XTIME_SESSION_MISMATCH")]
    XtimeSessionMismatch,
}
