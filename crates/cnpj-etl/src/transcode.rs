//! Streaming Windows-1252 to UTF-8 decoding.
//!
//! The upstream CSVs arrive in CP1252. This adapter sits between the file and
//! the CSV reader so the whole tree is decoded incrementally, never held in
//! memory. Windows-1252 maps every byte, so decoding itself cannot fail.

use std::io::Read;

use encoding_rs::{CoderResult, Decoder, WINDOWS_1252};

const INPUT_BUF: usize = 8 * 1024;

/// A [`Read`] adapter yielding the UTF-8 decoding of a CP1252 byte stream.
pub struct Windows1252Reader<R> {
    inner: R,
    decoder: Decoder,
    buf: [u8; INPUT_BUF],
    buf_pos: usize,
    buf_len: usize,
    // Decoded bytes that did not fit the caller's buffer.
    pending: Vec<u8>,
    eof: bool,
    // The decoder must not be called again after its final flush.
    finished: bool,
}

impl<R: Read> Windows1252Reader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            decoder: WINDOWS_1252.new_decoder(),
            buf: [0; INPUT_BUF],
            buf_pos: 0,
            buf_len: 0,
            pending: Vec::new(),
            eof: false,
            finished: false,
        }
    }

    fn drain_pending(&mut self, out: &mut [u8]) -> usize {
        let n = self.pending.len().min(out.len());
        out[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        n
    }
}

impl<R: Read> Read for Windows1252Reader<R> {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        if !self.pending.is_empty() {
            return Ok(self.drain_pending(out));
        }
        if self.finished {
            return Ok(0);
        }

        loop {
            if self.buf_pos == self.buf_len && !self.eof {
                let n = self.inner.read(&mut self.buf)?;
                self.buf_pos = 0;
                self.buf_len = n;
                if n == 0 {
                    self.eof = true;
                }
            }

            // A tiny caller buffer may not hold one scalar; decode through the
            // pending stash instead so progress is always possible.
            let written = if out.len() < 4 {
                let mut stash = [0u8; 64];
                let (result, read, written, _) = self.decoder.decode_to_utf8(
                    &self.buf[self.buf_pos..self.buf_len],
                    &mut stash,
                    self.eof,
                );
                self.buf_pos += read;
                self.pending.extend_from_slice(&stash[..written]);
                if self.eof && result == CoderResult::InputEmpty {
                    self.finished = true;
                }
                if !self.pending.is_empty() {
                    return Ok(self.drain_pending(out));
                }
                0
            } else {
                let (result, read, written, _) = self.decoder.decode_to_utf8(
                    &self.buf[self.buf_pos..self.buf_len],
                    out,
                    self.eof,
                );
                self.buf_pos += read;
                if self.eof && result == CoderResult::InputEmpty {
                    self.finished = true;
                }
                written
            };

            if written > 0 {
                return Ok(written);
            }
            if self.finished {
                return Ok(0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(bytes: &[u8]) -> String {
        let mut reader = Windows1252Reader::new(bytes);
        let mut out = String::new();
        reader.read_to_string(&mut out).unwrap();
        out
    }

    #[test]
    fn ascii_passes_through() {
        assert_eq!(decode_all(b"SAO PAULO;12345678;02"), "SAO PAULO;12345678;02");
    }

    #[test]
    fn high_bytes_decode_to_utf8() {
        // 0xC7 0xC3 0xD5 = "ÇÃÕ" in CP1252, 0xE9 = "é".
        assert_eq!(decode_all(&[0xC7, 0xC3, 0xD5]), "ÇÃÕ");
        assert_eq!(decode_all(&[b'J', 0xE9]), "Jé");
    }

    #[test]
    fn survives_tiny_output_buffers() {
        let mut reader = Windows1252Reader::new(&[0xC7, b'X', 0xE9][..]);
        let mut out = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            match reader.read(&mut byte).unwrap() {
                0 => break,
                n => out.extend_from_slice(&byte[..n]),
            }
        }
        assert_eq!(String::from_utf8(out).unwrap(), "ÇXé");
    }

    #[test]
    fn empty_input_is_empty_output() {
        assert_eq!(decode_all(b""), "");
    }
}
