//! Incremental decoding of JSON value streams

use bytes::{Buf, BytesMut};
use serde::de::DeserializeOwned;
use std::marker::PhantomData;

/// Decodes concatenated or newline-delimited JSON values from arbitrary chunks
pub struct JsonStreamDecoder<O> {
    buffer: BytesMut,
    _marker: PhantomData<fn() -> O>,
}

impl<O: DeserializeOwned> JsonStreamDecoder<O> {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
            _marker: PhantomData,
        }
    }

    /// Feed a chunk and return every value it completes.
    ///
    /// A value ending exactly at the end of the buffered input is held back:
    /// a number such as `12` may continue in the next chunk.
    pub fn decode(&mut self, chunk: &[u8]) -> Result<Vec<O>, serde_json::Error> {
        self.buffer.extend_from_slice(chunk);

        let mut values = Vec::new();
        let mut consumed = 0;
        {
            let mut stream = serde_json::Deserializer::from_slice(&self.buffer).into_iter::<O>();
            loop {
                match stream.next() {
                    Some(Ok(_)) if stream.byte_offset() == self.buffer.len() => break,
                    Some(Ok(value)) => {
                        values.push(value);
                        consumed = stream.byte_offset();
                    }
                    // Value continues in a later chunk
                    Some(Err(e)) if e.is_eof() => break,
                    Some(Err(e)) => return Err(e),
                    None => break,
                }
            }
        }
        self.buffer.advance(consumed);

        Ok(values)
    }

    /// End of input. Returns the value held back by the last `decode`, if any;
    /// anything else left over is a truncated value.
    pub fn finish(self) -> Result<Option<O>, serde_json::Error> {
        if self.buffer.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        serde_json::from_slice::<O>(&self.buffer).map(Some)
    }
}

impl<O: DeserializeOwned> Default for JsonStreamDecoder<O> {
    fn default() -> Self {
        Self::new()
    }
}
