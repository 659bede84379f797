use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    WebRTCError(#[from] webrtc::Error),
    #[error(transparent)]
    TransportError(#[from] TransportError),
    #[error(transparent)]
    SubscriberError(#[from] SubscriberError),
    #[error(transparent)]
    ReceiverError(#[from] ReceiverError),
    #[error(transparent)]
    DownTrackError(#[from] DownTrackError),
    #[error(transparent)]
    SignalError(#[from] SignalError),
}

#[derive(thiserror::Error)]
#[error("{kind}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

#[derive(thiserror::Error)]
#[error("{kind}: {message}")]
pub struct SubscriberError {
    pub kind: SubscriberErrorKind,
    pub message: String,
}

#[derive(thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ReceiverError {
    pub kind: ReceiverErrorKind,
    pub message: String,
}

#[derive(thiserror::Error)]
#[error("{kind}: {message}")]
pub struct DownTrackError {
    pub kind: DownTrackErrorKind,
    pub message: String,
}

#[derive(thiserror::Error)]
#[error("{kind}: {message}")]
pub struct SignalError {
    pub kind: SignalErrorKind,
    pub message: String,
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum TransportErrorKind {
    #[error("peer connection error")]
    PeerConnectionError,
    #[error("local description error")]
    LocalDescriptionError,
    #[error("ice candidate error")]
    ICECandidateError,
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum SubscriberErrorKind {
    #[error("track not found error")]
    TrackNotFoundError,
    #[error("codec not negotiated error")]
    CodecNotNegotiatedError,
    #[error("track attach error")]
    AttachError,
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ReceiverErrorKind {
    #[error("receiver closed error")]
    ClosedError,
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum DownTrackErrorKind {
    #[error("closed pipe error")]
    ClosedPipeError,
    #[error("track not bound error")]
    NotBoundError,
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum SignalErrorKind {
    #[error("malformed message error")]
    MalformedMessageError,
    #[error("queue closed error")]
    QueueClosedError,
}

impl Error {
    pub fn new_transport(message: String, kind: TransportErrorKind) -> Error {
        Error::TransportError(TransportError { kind, message })
    }

    pub fn new_subscriber(message: String, kind: SubscriberErrorKind) -> Error {
        Error::SubscriberError(SubscriberError { kind, message })
    }

    pub fn new_receiver(message: String, kind: ReceiverErrorKind) -> Error {
        Error::ReceiverError(ReceiverError { kind, message })
    }

    pub fn new_down_track(message: String, kind: DownTrackErrorKind) -> Error {
        Error::DownTrackError(DownTrackError { kind, message })
    }

    pub fn new_signal(message: String, kind: SignalErrorKind) -> Error {
        Error::SignalError(SignalError { kind, message })
    }

    /// True when the write failed because the other side of the transport is gone.
    pub(crate) fn is_closed_pipe(&self) -> bool {
        match self {
            Error::DownTrackError(e) => e.kind == DownTrackErrorKind::ClosedPipeError,
            Error::WebRTCError(e) => matches!(e, webrtc::Error::ErrConnectionClosed),
            _ => false,
        }
    }
}

impl fmt::Debug for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("mediamesh::TransportError");

        builder.field("kind", &self.kind);
        builder.field("message", &self.message);

        builder.finish()
    }
}

impl fmt::Debug for SubscriberError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("mediamesh::SubscriberError");

        builder.field("kind", &self.kind);
        builder.field("message", &self.message);

        builder.finish()
    }
}

impl fmt::Debug for ReceiverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("mediamesh::ReceiverError");

        builder.field("kind", &self.kind);
        builder.field("message", &self.message);

        builder.finish()
    }
}

impl fmt::Debug for DownTrackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("mediamesh::DownTrackError");

        builder.field("kind", &self.kind);
        builder.field("message", &self.message);

        builder.finish()
    }
}

impl fmt::Debug for SignalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("mediamesh::SignalError");

        builder.field("kind", &self.kind);
        builder.field("message", &self.message);

        builder.finish()
    }
}
