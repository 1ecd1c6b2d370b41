//! Wire codec: self-delimiting key/value frames.
//!
//! ```text
//! ┌───────────┬─────┬─────────────┬───────┐
//! │ u16 keylen│ key │ u16 valuelen│ value │  … repeated …
//! └───────────┴─────┴─────────────┴───────┘
//! ┌───────────┐
//! │ 0x00 0x00 │  empty key terminates the frame
//! └───────────┘
//! ```
//!
//! Lengths are big-endian. Keys are UTF-8 and at most 255 bytes, values at
//! most 65 535 bytes. The decoder accepts arbitrarily fragmented input and
//! keeps partial frames across calls.

use std::{mem, str};

use crate::error::ProtocolError;

pub const MAX_KEY_LEN: usize = 0xff;
pub const MAX_VALUE_LEN: usize = 0xffff;
/// Upper bound on bytes buffered for one unfinished frame.
pub const MAX_FRAME_LEN: usize = 1 << 20;

/// One frame: ordered key/value pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    fields: Vec<(String, Vec<u8>)>,
}

impl Frame {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `key`, replacing an existing value in place.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
        let key = key.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(k, _)| *k == key) {
            Some((_, v)) => *v = value,
            None => self.fields.push((key, value)),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_slice())
    }

    /// Value of `key` if present and valid UTF-8.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|v| str::from_utf8(v).ok())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Serialises one frame, terminator included.
pub fn encode(frame: &Frame) -> Result<Vec<u8>, ProtocolError> {
    let size: usize = frame
        .fields
        .iter()
        .map(|(k, v)| 4 + k.len() + v.len())
        .sum::<usize>()
        + 2;
    let mut out = Vec::with_capacity(size);

    for (key, value) in &frame.fields {
        if key.is_empty() {
            return Err(ProtocolError::MalformedFrame("empty key inside a frame".into()));
        }
        if key.len() > MAX_KEY_LEN {
            return Err(ProtocolError::FieldTooLong {
                key: key.clone(),
                len: key.len(),
                max: MAX_KEY_LEN,
            });
        }
        if value.len() > MAX_VALUE_LEN {
            return Err(ProtocolError::FieldTooLong {
                key: key.clone(),
                len: value.len(),
                max: MAX_VALUE_LEN,
            });
        }
        out.extend_from_slice(&(key.len() as u16).to_be_bytes());
        out.extend_from_slice(key.as_bytes());
        out.extend_from_slice(&(value.len() as u16).to_be_bytes());
        out.extend_from_slice(value);
    }
    out.extend_from_slice(&[0, 0]);
    Ok(out)
}

/// Incremental frame decoder.
///
/// Fields of an unfinished frame are parsed once; later input resumes at
/// the first incomplete field.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    /// Fields already parsed from the front of `buf`.
    partial: Frame,
    /// Offset in `buf` where `partial` ends.
    scanned: usize,
    poisoned: bool,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffers `bytes` and returns an iterator over every frame that is now
    /// complete. Frames are parsed lazily as the iterator is driven; anything
    /// left unconsumed stays buffered for the next call.
    ///
    /// After a [`ProtocolError::MalformedFrame`] the decoder is poisoned and
    /// ignores further input.
    pub fn feed(&mut self, bytes: &[u8]) -> Frames<'_> {
        self.push(bytes);
        Frames { decoder: self }
    }

    /// Buffers `bytes` without parsing; pair with [`FrameDecoder::next_frame`].
    pub fn push(&mut self, bytes: &[u8]) {
        if !self.poisoned {
            self.buf.extend_from_slice(bytes);
        }
    }

    /// Number of bytes held for an incomplete frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Declares end of stream. Leftover bytes mean the last frame was cut.
    pub fn finish(&mut self) -> Result<(), ProtocolError> {
        if self.poisoned || self.buf.is_empty() {
            return Ok(());
        }
        let left = self.buf.len();
        self.poison();
        Err(ProtocolError::MalformedFrame(format!(
            "stream ended inside a frame ({left} byte(s) buffered)"
        )))
    }

    fn poison(&mut self) {
        self.poisoned = true;
        self.buf.clear();
        self.partial = Frame::new();
        self.scanned = 0;
    }

    /// Takes the next complete frame out of the buffer, if any.
    pub fn next_frame(&mut self) -> Option<Result<Frame, ProtocolError>> {
        if self.poisoned {
            return None;
        }
        loop {
            match parse_field(&self.buf, self.scanned) {
                Ok(Some(Field::End(used))) => {
                    self.buf.drain(..used);
                    self.scanned = 0;
                    return Some(Ok(mem::take(&mut self.partial)));
                }
                Ok(Some(Field::Pair { key, value, next })) => {
                    self.partial.fields.push((key, value));
                    self.scanned = next;
                }
                Ok(None) if self.buf.len() > MAX_FRAME_LEN => {
                    let len = self.buf.len();
                    self.poison();
                    return Some(Err(ProtocolError::MalformedFrame(format!(
                        "unterminated frame exceeds {MAX_FRAME_LEN} bytes ({len} buffered)"
                    ))));
                }
                Ok(None) => return None,
                Err(e) => {
                    self.poison();
                    return Some(Err(e));
                }
            }
        }
    }
}

/// Iterator returned by [`FrameDecoder::feed`].
pub struct Frames<'a> {
    decoder: &'a mut FrameDecoder,
}

impl Iterator for Frames<'_> {
    type Item = Result<Frame, ProtocolError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.decoder.next_frame()
    }
}

fn read_len(buf: &[u8], pos: usize) -> Option<usize> {
    let raw = buf.get(pos..pos + 2)?;
    Some(u16::from_be_bytes([raw[0], raw[1]]) as usize)
}

enum Field {
    /// The terminator; the frame ends at this offset.
    End(usize),
    Pair { key: String, value: Vec<u8>, next: usize },
}

/// Parses the field starting at `pos`. `Ok(None)` means more bytes are
/// needed.
fn parse_field(buf: &[u8], pos: usize) -> Result<Option<Field>, ProtocolError> {
    let Some(key_len) = read_len(buf, pos) else {
        return Ok(None);
    };
    let pos = pos + 2;
    if key_len == 0 {
        return Ok(Some(Field::End(pos)));
    }
    if key_len > MAX_KEY_LEN {
        return Err(ProtocolError::MalformedFrame(format!(
            "key length {key_len} exceeds {MAX_KEY_LEN}"
        )));
    }
    let Some(raw_key) = buf.get(pos..pos + key_len) else {
        return Ok(None);
    };
    let pos = pos + key_len;
    let Some(value_len) = read_len(buf, pos) else {
        return Ok(None);
    };
    let pos = pos + 2;
    let Some(value) = buf.get(pos..pos + value_len) else {
        return Ok(None);
    };
    let key = str::from_utf8(raw_key)
        .map_err(|e| ProtocolError::MalformedFrame(format!("key is not utf-8: {e}")))?
        .to_owned();
    Ok(Some(Field::Pair {
        key,
        value: value.to_vec(),
        next: pos + value_len,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(n: i32) -> Frame {
        Frame::new()
            .with("_command", "Say")
            .with("_ask", format!("{n:x}"))
            .with("server_id", n.to_be_bytes().to_vec())
            .with("message", "")
    }

    #[test]
    fn encodes_known_layout() {
        let bytes = encode(&Frame::new().with("a", "xy")).unwrap();
        assert_eq!(bytes, vec![0, 1, b'a', 0, 2, b'x', b'y', 0, 0]);
        assert_eq!(encode(&Frame::new()).unwrap(), vec![0, 0]);
    }

    #[test]
    fn roundtrip_keeps_empty_and_boundary_values() {
        let frame = Frame::new()
            .with("zero", 0i32.to_be_bytes().to_vec())
            .with("max", i32::MAX.to_be_bytes().to_vec())
            .with("empty", "");
        let bytes = encode(&frame).unwrap();
        let mut dec = FrameDecoder::new();
        let frames: Vec<_> = dec.feed(&bytes).collect::<Result<_, _>>().unwrap();
        assert_eq!(frames, vec![frame]);
        assert_eq!(dec.buffered(), 0);
    }

    #[test]
    fn byte_at_a_time_matches_whole_feed() {
        let expected: Vec<Frame> = (0..5).map(sample).collect();
        let mut stream = Vec::new();
        for f in &expected {
            stream.extend(encode(f).unwrap());
        }

        let mut whole = FrameDecoder::new();
        let at_once: Vec<_> = whole.feed(&stream).collect::<Result<_, _>>().unwrap();

        let mut dec = FrameDecoder::new();
        let mut trickled = Vec::new();
        for b in &stream {
            for f in dec.feed(std::slice::from_ref(b)) {
                trickled.push(f.unwrap());
            }
        }

        assert_eq!(at_once, expected);
        assert_eq!(trickled, expected);
        assert!(dec.finish().is_ok());
    }

    #[test]
    fn uneven_chunks_keep_order() {
        let expected: Vec<Frame> = (10..14).map(sample).collect();
        let stream: Vec<u8> = expected.iter().flat_map(|f| encode(f).unwrap()).collect();

        let mut dec = FrameDecoder::new();
        let mut got = Vec::new();
        for chunk in stream.chunks(7) {
            got.extend(dec.feed(chunk).map(Result::unwrap));
        }
        assert_eq!(got, expected);
    }

    #[test]
    fn feed_is_lazy_and_keeps_remainder() {
        let stream: Vec<u8> = [sample(1), sample(2)]
            .iter()
            .flat_map(|f| encode(f).unwrap())
            .collect();
        let mut dec = FrameDecoder::new();
        {
            let mut it = dec.feed(&stream);
            assert_eq!(it.next().unwrap().unwrap(), sample(1));
        }
        // second frame was never pulled; it is still buffered
        assert!(dec.buffered() > 0);
        let rest: Vec<_> = dec.feed(&[]).map(Result::unwrap).collect();
        assert_eq!(rest, vec![sample(2)]);
    }

    #[test]
    fn complete_fields_are_not_parsed_again() {
        let bytes = encode(&sample(7)).unwrap();
        // first field plus half of the second
        let first = 2 + "_command".len() + 2 + "Say".len();
        let mut dec = FrameDecoder::new();
        assert!(dec.feed(&bytes[..first + 3]).next().is_none());
        assert_eq!(dec.scanned, first);
        assert_eq!(dec.partial.len(), 1);

        assert!(dec.feed(&bytes[first + 3..bytes.len() - 1]).next().is_none());
        assert_eq!(dec.partial.len(), 4);
        assert_eq!(dec.scanned, bytes.len() - 2);

        let frames: Vec<_> = dec.feed(&bytes[bytes.len() - 1..]).map(Result::unwrap).collect();
        assert_eq!(frames, vec![sample(7)]);
        assert_eq!((dec.scanned, dec.partial.len(), dec.buffered()), (0, 0, 0));
    }

    #[test]
    fn oversize_value_is_rejected_on_encode() {
        let frame = Frame::new().with("big", vec![b'x'; MAX_VALUE_LEN + 1]);
        assert!(matches!(
            encode(&frame),
            Err(ProtocolError::FieldTooLong { max: MAX_VALUE_LEN, .. })
        ));
    }

    #[test]
    fn truncated_stream_is_malformed_at_finish() {
        // value claims 10 bytes, only 3 ever arrive
        let bytes = [0, 1, b'k', 0, 10, b'a', b'b', b'c'];
        let mut dec = FrameDecoder::new();
        assert!(dec.feed(&bytes).next().is_none());
        assert!(matches!(dec.finish(), Err(ProtocolError::MalformedFrame(_))));
        assert!(dec.is_poisoned());
    }

    #[test]
    fn oversized_key_length_poisons_decoder() {
        let mut dec = FrameDecoder::new();
        let mut frames = dec.feed(&[0x01, 0x00, b'k']);
        assert!(matches!(frames.next(), Some(Err(ProtocolError::MalformedFrame(_)))));
        assert!(frames.next().is_none());
        assert!(dec.feed(&encode(&sample(1)).unwrap()).next().is_none());
    }
}
