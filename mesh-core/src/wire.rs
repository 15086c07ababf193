//! Host link framing: KISS/SLIP style delimiter + escape encoding.
//!
//! A frame on the wire is `FEND (escaped command, payload...) FEND`. The first decoded byte is the
//! command identifier; the rest is opaque payload.

pub const FEND: u8 = 0xC0;
pub const FESC: u8 = 0xDB;
pub const TFEND: u8 = 0xDC;
pub const TFESC: u8 = 0xDD;

/// Decoded frame capacity, command byte included.
pub const MAX_FRAME_SIZE: usize = 512;

/// Receiver of complete decoded frames.
pub trait FrameHandler {
    fn on_frame(&mut self, command: u8, payload: &[u8]);
}

impl<F: FnMut(u8, &[u8])> FrameHandler for F {
    fn on_frame(&mut self, command: u8, payload: &[u8]) {
        self(command, payload)
    }
}

/// Non-blocking duplex byte channel to the host.
pub trait SerialStream {
    fn bytes_available(&mut self) -> usize;
    fn read_byte(&mut self) -> Option<u8>;
    fn write_byte(&mut self, byte: u8);
    fn flush(&mut self);
}

/// Streaming decoder. Malformed escapes and overflow silently discard the partial frame.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    in_frame: bool,
    escape_pending: bool,
    dropped: u32,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(MAX_FRAME_SIZE),
            in_frame: false,
            escape_pending: false,
            dropped: 0,
        }
    }

    /// Abort any partial frame and wait for the next delimiter.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.in_frame = false;
        self.escape_pending = false;
    }

    /// Frames discarded for bad escapes or overflow.
    pub fn dropped(&self) -> u32 {
        self.dropped
    }

    pub fn push_bytes(&mut self, bytes: &[u8], handler: &mut impl FrameHandler) {
        for &b in bytes {
            self.push_byte(b, handler);
        }
    }

    pub fn push_byte(&mut self, byte: u8, handler: &mut impl FrameHandler) {
        if byte == FEND {
            if self.in_frame {
                if let Some((&command, payload)) = self.buffer.split_first() {
                    handler.on_frame(command, payload);
                }
            }
            self.buffer.clear();
            self.escape_pending = false;
            self.in_frame = true;
            return;
        }

        if !self.in_frame {
            return;
        }

        let byte = if self.escape_pending {
            self.escape_pending = false;
            match byte {
                TFEND => FEND,
                TFESC => FESC,
                other => {
                    tracing::debug!(byte = other, "invalid escape, frame discarded");
                    self.abort();
                    return;
                }
            }
        } else if byte == FESC {
            self.escape_pending = true;
            return;
        } else {
            byte
        };

        if self.buffer.len() >= MAX_FRAME_SIZE {
            tracing::debug!("frame overflow, discarded");
            self.abort();
            return;
        }
        self.buffer.push(byte);
    }

    fn abort(&mut self) {
        self.dropped = self.dropped.wrapping_add(1);
        self.reset();
    }
}

/// Encode one frame. The command byte counts against `MAX_FRAME_SIZE`.
pub fn encode_frame(command: u8, payload: &[u8]) -> Result<Vec<u8>, FrameEncodeError> {
    if payload.len() + 1 > MAX_FRAME_SIZE {
        return Err(FrameEncodeError::TooLarge(payload.len()));
    }
    let mut out = Vec::with_capacity(payload.len() + 4);
    out.push(FEND);
    push_escaped(&mut out, command);
    for &b in payload {
        push_escaped(&mut out, b);
    }
    out.push(FEND);
    Ok(out)
}

fn push_escaped(out: &mut Vec<u8>, byte: u8) {
    match byte {
        FEND => out.extend_from_slice(&[FESC, TFEND]),
        FESC => out.extend_from_slice(&[FESC, TFESC]),
        b => out.push(b),
    }
}

/// Encode a frame straight onto a serial stream and flush it.
pub fn write_frame<S: SerialStream>(
    stream: &mut S,
    command: u8,
    payload: &[u8],
) -> Result<(), FrameEncodeError> {
    let encoded = encode_frame(command, payload)?;
    for b in encoded {
        stream.write_byte(b);
    }
    stream.flush();
    Ok(())
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameEncodeError {
    #[error("payload of {0} bytes does not fit in a frame")]
    TooLarge(usize),
}

/// A serial stream paired with its decoder.
pub struct KissPort<S: SerialStream> {
    stream: S,
    decoder: FrameDecoder,
}

impl<S: SerialStream> KissPort<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            decoder: FrameDecoder::new(),
        }
    }

    /// Drain every byte currently available and dispatch complete frames.
    pub fn process(&mut self, handler: &mut impl FrameHandler) {
        while self.stream.bytes_available() > 0 {
            let Some(b) = self.stream.read_byte() else {
                break;
            };
            self.decoder.push_byte(b, handler);
        }
    }

    pub fn send_frame(&mut self, command: u8, payload: &[u8]) -> Result<(), FrameEncodeError> {
        write_frame(&mut self.stream, command, payload)
    }

    pub fn decoder(&self) -> &FrameDecoder {
        &self.decoder
    }

    pub fn stream(&self) -> &S {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }
}
