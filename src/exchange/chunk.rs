use std::sync::Arc;

use bytes::Bytes;

use crate::error::ChannelError;

/// A unit of request content handed from the transport to the application.
///
/// Data chunks carry bytes; `Eof` and `Error` are *special* chunks that mark
/// the end of the input. Once a producer has yielded a special chunk it must
/// keep yielding the same special chunk on every subsequent pull.
#[derive(Debug, Clone)]
pub enum Chunk {
    /// A chunk of request content
    Data(Bytes),
    /// Marks the end of the request content
    Eof,
    /// Marks the input as terminally failed
    Error(Arc<ChannelError>),
}

impl Chunk {
    /// Wraps a failure into a special error chunk.
    pub fn failure(error: ChannelError) -> Self {
        Chunk::Error(Arc::new(error))
    }

    /// Returns true for the terminal `Eof` and `Error` chunks
    #[inline]
    pub fn is_special(&self) -> bool {
        !matches!(self, Chunk::Data(_))
    }

    #[inline]
    pub fn is_eof(&self) -> bool {
        matches!(self, Chunk::Eof)
    }

    #[inline]
    pub fn is_error(&self) -> bool {
        matches!(self, Chunk::Error(_))
    }

    /// The number of content bytes carried by this chunk.
    pub fn len(&self) -> usize {
        match self {
            Chunk::Data(bytes) => bytes.len(),
            _ => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bytes(&self) -> Option<&Bytes> {
        match self {
            Chunk::Data(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn into_bytes(self) -> Option<Bytes> {
        match self {
            Chunk::Data(bytes) => Some(bytes),
            _ => None,
        }
    }
}

impl From<Bytes> for Chunk {
    fn from(bytes: Bytes) -> Self {
        Chunk::Data(bytes)
    }
}
