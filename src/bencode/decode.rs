use super::error::BencodeError;
use super::value::Value;
use bytes::Bytes;
use std::collections::BTreeMap;

/// Nesting levels accepted before a decode is rejected outright. Deeply
/// nested input is never legitimate KRPC and would otherwise recurse
/// without bound.
const MAX_DEPTH: usize = 32;

/// Decodes a single bencode value spanning the whole input.
///
/// Strict per BEP-3: integers reject leading zeros and a bare minus sign,
/// dictionary keys must be byte strings, and bytes after the outermost
/// value are an error.
pub fn decode(data: &[u8]) -> Result<Value, BencodeError> {
    let mut decoder = Decoder { data, pos: 0 };
    let value = decoder.value(0)?;

    if decoder.pos != data.len() {
        return Err(BencodeError::TrailingData);
    }

    Ok(value)
}

struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Decoder<'_> {
    fn peek(&self) -> Result<u8, BencodeError> {
        self.data.get(self.pos).copied().ok_or(BencodeError::Truncated)
    }

    fn expect(&mut self, byte: u8) -> Result<(), BencodeError> {
        if self.peek()? != byte {
            return Err(BencodeError::UnexpectedByte(self.data[self.pos]));
        }
        self.pos += 1;
        Ok(())
    }

    fn value(&mut self, depth: usize) -> Result<Value, BencodeError> {
        if depth > MAX_DEPTH {
            return Err(BencodeError::TooDeep);
        }

        match self.peek()? {
            b'i' => self.integer(),
            b'l' => self.list(depth),
            b'd' => self.dict(depth),
            b'0'..=b'9' => Ok(Value::Bytes(self.byte_string()?)),
            other => Err(BencodeError::UnexpectedByte(other)),
        }
    }

    fn integer(&mut self) -> Result<Value, BencodeError> {
        self.pos += 1; // consume 'i'

        let negative = if self.peek()? == b'-' {
            self.pos += 1;
            true
        } else {
            false
        };

        let digits_start = self.pos;
        let mut magnitude: i64 = 0;
        while let Ok(byte) = self.peek() {
            if !byte.is_ascii_digit() {
                break;
            }
            magnitude = magnitude
                .checked_mul(10)
                .and_then(|m| m.checked_add((byte - b'0') as i64))
                .ok_or(BencodeError::BadInteger)?;
            self.pos += 1;
        }

        let digit_count = self.pos - digits_start;
        if digit_count == 0 {
            return Err(BencodeError::BadInteger);
        }
        // "i-0e" and zero-padded forms like "i03e" are invalid per BEP-3.
        if self.data[digits_start] == b'0' && (digit_count > 1 || negative) {
            return Err(BencodeError::BadInteger);
        }

        self.expect(b'e')?;
        Ok(Value::Integer(if negative { -magnitude } else { magnitude }))
    }

    fn byte_string(&mut self) -> Result<Bytes, BencodeError> {
        let mut len: usize = 0;
        let digits_start = self.pos;
        while let Ok(byte) = self.peek() {
            if !byte.is_ascii_digit() {
                break;
            }
            len = len
                .checked_mul(10)
                .and_then(|l| l.checked_add((byte - b'0') as usize))
                .ok_or(BencodeError::BadLength)?;
            self.pos += 1;
        }
        if self.pos == digits_start {
            return Err(BencodeError::BadLength);
        }

        self.expect(b':')?;

        let end = self.pos.checked_add(len).ok_or(BencodeError::BadLength)?;
        if end > self.data.len() {
            return Err(BencodeError::Truncated);
        }

        let bytes = Bytes::copy_from_slice(&self.data[self.pos..end]);
        self.pos = end;
        Ok(bytes)
    }

    fn list(&mut self, depth: usize) -> Result<Value, BencodeError> {
        self.pos += 1; // consume 'l'
        let mut items = Vec::new();

        while self.peek()? != b'e' {
            items.push(self.value(depth + 1)?);
        }

        self.pos += 1; // consume 'e'
        Ok(Value::List(items))
    }

    fn dict(&mut self, depth: usize) -> Result<Value, BencodeError> {
        self.pos += 1; // consume 'd'
        let mut entries = BTreeMap::new();

        while self.peek()? != b'e' {
            if !self.peek()?.is_ascii_digit() {
                return Err(BencodeError::NonStringKey);
            }
            let key = self.byte_string()?;
            let value = self.value(depth + 1)?;
            entries.insert(key, value);
        }

        self.pos += 1; // consume 'e'
        Ok(Value::Dict(entries))
    }
}
