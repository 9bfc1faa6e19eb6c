//! Incremental decoding of a top-level JSON array of users.
//!
//! The array brackets and separators are scanned by hand straight off the
//! `BufRead` window; each element is handed to `serde_json` on its own, so
//! only the current user is ever held in memory regardless of input size.

use crate::models::User;
use serde::Deserialize;
use std::io::{self, BufRead};
use thiserror::Error;

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("failed to read input: {0}")]
    Io(#[from] io::Error),
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("expected '[' at start of input, found {found:?}")]
    ExpectedArrayStart { found: char },
    #[error("expected ',' or ']' after record {index}, found {found:?}")]
    UnexpectedByte { index: usize, found: char },
    #[error("trailing comma after record {index}")]
    TrailingComma { index: usize },
    #[error("unexpected characters after closing ']'")]
    TrailingCharacters,
    #[error("record {index} is malformed: {source}")]
    Record {
        index: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("no records remain in the array")]
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Just past `[`; the next token is either `]` or the first element.
    First,
    /// Just past an element; the next token is `,` or `]`.
    Separator,
    /// Positioned at the start of an element.
    Ready,
    /// Past the closing `]`.
    Done,
    Failed,
}

/// Pull-based reader over the elements of a JSON array of users.
pub struct RecordStream<R> {
    reader: R,
    state: State,
    decoded: usize,
}

impl<R: BufRead> RecordStream<R> {
    /// Consume the opening `[` (after optional whitespace and BOM).
    pub fn new(mut reader: R) -> Result<Self, DecodeError> {
        skip_bom(&mut reader)?;
        match peek_significant(&mut reader)? {
            Some(b'[') => reader.consume(1),
            Some(byte) => {
                return Err(DecodeError::ExpectedArrayStart {
                    found: byte as char,
                });
            }
            None => return Err(DecodeError::UnexpectedEof),
        }

        Ok(Self {
            reader,
            state: State::First,
            decoded: 0,
        })
    }

    /// Number of records decoded so far.
    pub fn decoded(&self) -> usize {
        self.decoded
    }

    /// Whether another element follows. Safe to call repeatedly.
    pub fn has_more(&mut self) -> Result<bool, DecodeError> {
        match self.state {
            State::Ready => return Ok(true),
            State::Done | State::Failed => return Ok(false),
            State::First | State::Separator => {}
        }

        let result = self.advance();
        if result.is_err() {
            self.state = State::Failed;
        }
        result
    }

    fn advance(&mut self) -> Result<bool, DecodeError> {
        let byte = self.peek_required()?;

        match (self.state, byte) {
            (_, b']') => {
                self.reader.consume(1);
                self.state = State::Done;
                Ok(false)
            }
            (State::First, _) => {
                self.state = State::Ready;
                Ok(true)
            }
            (_, b',') => {
                self.reader.consume(1);
                if self.peek_required()? == b']' {
                    return Err(DecodeError::TrailingComma {
                        index: self.decoded - 1,
                    });
                }
                self.state = State::Ready;
                Ok(true)
            }
            (_, found) => Err(DecodeError::UnexpectedByte {
                index: self.decoded.saturating_sub(1),
                found: found as char,
            }),
        }
    }

    /// Decode exactly one array element.
    pub fn next_record(&mut self) -> Result<User, DecodeError> {
        if !self.has_more()? {
            return Err(DecodeError::Exhausted);
        }

        let index = self.decoded;
        let mut deserializer = serde_json::Deserializer::from_reader(&mut self.reader);
        match User::deserialize(&mut deserializer) {
            Ok(user) => {
                self.decoded += 1;
                self.state = State::Separator;
                Ok(user)
            }
            Err(source) => {
                self.state = State::Failed;
                Err(DecodeError::Record { index, source })
            }
        }
    }

    /// Verify that nothing but whitespace follows the closing `]`.
    pub fn finish(mut self) -> Result<(), DecodeError> {
        if self.has_more()? {
            return Err(DecodeError::UnexpectedByte {
                index: self.decoded,
                found: self.peek_required()? as char,
            });
        }

        match peek_significant(&mut self.reader)? {
            None => Ok(()),
            Some(_) => Err(DecodeError::TrailingCharacters),
        }
    }

    fn peek_required(&mut self) -> Result<u8, DecodeError> {
        peek_significant(&mut self.reader)?.ok_or(DecodeError::UnexpectedEof)
    }
}

impl<R: BufRead> Iterator for RecordStream<R> {
    type Item = Result<User, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.has_more() {
            Ok(true) => Some(self.next_record()),
            Ok(false) => None,
            Err(err) => Some(Err(err)),
        }
    }
}

/// Decode and discard every record in `reader`, returning how many there
/// are. Fails with the same error a full pass would hit, without
/// dispatching anything.
pub fn validate<R: BufRead>(reader: R) -> Result<usize, DecodeError> {
    let mut records = RecordStream::new(reader)?;
    while records.has_more()? {
        records.next_record()?;
    }
    let count = records.decoded();
    records.finish()?;
    Ok(count)
}

fn is_json_whitespace(byte: u8) -> bool {
    matches!(byte, b' ' | b'\t' | b'\n' | b'\r')
}

/// Skip JSON whitespace and return the next byte without consuming it.
fn peek_significant<R: BufRead>(reader: &mut R) -> io::Result<Option<u8>> {
    loop {
        let buffer = match reader.fill_buf() {
            Ok(buffer) => buffer,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };

        if buffer.is_empty() {
            return Ok(None);
        }

        match buffer.iter().position(|&byte| !is_json_whitespace(byte)) {
            Some(offset) => {
                let byte = buffer[offset];
                reader.consume(offset);
                return Ok(Some(byte));
            }
            None => {
                let len = buffer.len();
                reader.consume(len);
            }
        }
    }
}

fn skip_bom<R: BufRead>(reader: &mut R) -> io::Result<()> {
    let buffer = reader.fill_buf()?;
    if buffer.starts_with(UTF8_BOM) {
        reader.consume(UTF8_BOM.len());
    }
    Ok(())
}
