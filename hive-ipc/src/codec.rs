//! Newline-delimited JSON framing for stream transports

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use crate::error::{IpcError, IpcResult};
use crate::protocol::Envelope;

/// Decodes one envelope per line.
///
/// Malformed or oversize frames are yielded as `Ok(Some(Err(..)))` so the
/// surrounding `FramedRead` keeps reading; only I/O failures end the stream.
#[derive(Debug, Clone)]
pub struct EnvelopeCodec {
    lines: LinesCodec,
    max_frame_size: usize,
}

impl EnvelopeCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(max_frame_size),
            max_frame_size,
        }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    fn map_line(
        &self,
        line: Result<Option<String>, LinesCodecError>,
    ) -> Result<Option<IpcResult<Envelope>>, IpcError> {
        match line {
            Ok(Some(line)) if line.trim().is_empty() => Ok(None),
            Ok(Some(line)) => Ok(Some(Envelope::from_json(&line))),
            Ok(None) => Ok(None),
            Err(LinesCodecError::MaxLineLengthExceeded) => Ok(Some(Err(IpcError::too_large(
                self.max_frame_size + 1,
                self.max_frame_size,
            )))),
            Err(LinesCodecError::Io(e)) => Err(e.into()),
        }
    }
}

impl Decoder for EnvelopeCodec {
    type Item = IpcResult<Envelope>;
    type Error = IpcError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let line = self.lines.decode(src);
            // Blank lines are skipped without waiting for more input
            if matches!(&line, Ok(Some(l)) if l.trim().is_empty()) {
                continue;
            }
            return self.map_line(line);
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let line = self.lines.decode_eof(src);
            if matches!(&line, Ok(Some(l)) if l.trim().is_empty()) {
                continue;
            }
            return self.map_line(line);
        }
    }
}

impl Encoder<String> for EnvelopeCodec {
    type Error = IpcError;

    fn encode(&mut self, line: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.lines.encode(line, dst).map_err(|e| match e {
            LinesCodecError::Io(e) => e.into(),
            LinesCodecError::MaxLineLengthExceeded => {
                IpcError::too_large(self.max_frame_size + 1, self.max_frame_size)
            }
        })
    }
}

/// Serialize an envelope to a frame, enforcing the frame ceiling
pub fn encode_frame(envelope: &Envelope, max_frame_size: usize) -> IpcResult<String> {
    let line = envelope.to_json()?;
    if line.len() > max_frame_size {
        return Err(IpcError::too_large(line.len(), max_frame_size));
    }
    Ok(line)
}

/// Parse a single frame received outside a byte stream
pub fn decode_frame(line: &str, max_frame_size: usize) -> IpcResult<Envelope> {
    if line.len() > max_frame_size {
        return Err(IpcError::too_large(line.len(), max_frame_size));
    }
    Envelope::from_json(line.trim())
}
