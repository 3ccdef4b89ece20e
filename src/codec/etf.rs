//! Erlang External Term Format codec.
//!
//! Covers the subset of terms a gateway exchanges: integers (small, 32-bit and
//! bignums up to 128 bits), floats, atoms, binaries, strings, lists, tuples and maps.
//! Decoding maps atoms `nil`/`null` to JSON null and `true`/`false` to booleans;
//! everything else becomes the closest JSON shape. Encoding mirrors erlpack: strings
//! go out as binaries and null/booleans as atoms.

use std::io::{Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde_json::{Map, Number, Value};

use super::CodecError;

const FORMAT_VERSION: u8 = 131;

const NEW_FLOAT_EXT: u8 = 70;
const SMALL_INTEGER_EXT: u8 = 97;
const INTEGER_EXT: u8 = 98;
const FLOAT_EXT: u8 = 99;
const ATOM_EXT: u8 = 100;
const SMALL_TUPLE_EXT: u8 = 104;
const LARGE_TUPLE_EXT: u8 = 105;
const NIL_EXT: u8 = 106;
const STRING_EXT: u8 = 107;
const LIST_EXT: u8 = 108;
const BINARY_EXT: u8 = 109;
const SMALL_BIG_EXT: u8 = 110;
const LARGE_BIG_EXT: u8 = 111;
const SMALL_ATOM_EXT: u8 = 115;
const MAP_EXT: u8 = 116;
const ATOM_UTF8_EXT: u8 = 118;
const SMALL_ATOM_UTF8_EXT: u8 = 119;

const MAX_DEPTH: usize = 256;

/// Decode a versioned ETF term.
pub fn decode(bytes: &[u8]) -> Result<Value, CodecError> {
    let mut cursor = Cursor::new(bytes);
    let version = cursor.read_u8()?;
    if version != FORMAT_VERSION {
        return Err(CodecError::InvalidVersion(version));
    }
    decode_term(&mut cursor, 0)
}

/// Encode a value as a versioned ETF term.
pub fn encode(value: &Value) -> Result<Vec<u8>, CodecError> {
    let mut buffer = Vec::with_capacity(64);
    buffer.write_u8(FORMAT_VERSION)?;
    encode_term(&mut buffer, value)?;
    Ok(buffer)
}

fn decode_term(cursor: &mut Cursor<&[u8]>, depth: usize) -> Result<Value, CodecError> {
    if depth > MAX_DEPTH {
        return Err(CodecError::TooDeep(MAX_DEPTH));
    }

    let tag = cursor.read_u8()?;
    let value = match tag {
        SMALL_INTEGER_EXT => Value::from(cursor.read_u8()?),
        INTEGER_EXT => Value::from(cursor.read_i32::<BigEndian>()?),
        NEW_FLOAT_EXT => float_value(cursor.read_f64::<BigEndian>()?)?,
        FLOAT_EXT => {
            let raw = read_bytes(cursor, 31)?;
            let text = latin1(&raw);
            let parsed = text
                .trim_end_matches('\0')
                .trim()
                .parse::<f64>()
                .map_err(|_| CodecError::Unrepresentable("float text"))?;
            float_value(parsed)?
        }
        ATOM_EXT | ATOM_UTF8_EXT => {
            let len = cursor.read_u16::<BigEndian>()? as usize;
            atom_value(read_atom(cursor, len, tag == ATOM_UTF8_EXT)?)
        }
        SMALL_ATOM_EXT | SMALL_ATOM_UTF8_EXT => {
            let len = cursor.read_u8()? as usize;
            atom_value(read_atom(cursor, len, tag == SMALL_ATOM_UTF8_EXT)?)
        }
        SMALL_TUPLE_EXT => {
            let arity = cursor.read_u8()? as usize;
            Value::Array(decode_elements(cursor, arity, depth)?)
        }
        LARGE_TUPLE_EXT => {
            let arity = cursor.read_u32::<BigEndian>()? as usize;
            Value::Array(decode_elements(cursor, arity, depth)?)
        }
        NIL_EXT => Value::Array(Vec::new()),
        STRING_EXT => {
            let len = cursor.read_u16::<BigEndian>()? as usize;
            Value::String(latin1(&read_bytes(cursor, len)?))
        }
        LIST_EXT => {
            let len = cursor.read_u32::<BigEndian>()? as usize;
            let mut items = decode_elements(cursor, len, depth)?;
            // Proper lists end in NIL_EXT; keep an improper tail as a final element.
            match decode_term(cursor, depth + 1)? {
                Value::Array(tail) if tail.is_empty() => {}
                tail => items.push(tail),
            }
            Value::Array(items)
        }
        BINARY_EXT => {
            let len = cursor.read_u32::<BigEndian>()? as usize;
            Value::String(String::from_utf8(read_bytes(cursor, len)?)?)
        }
        SMALL_BIG_EXT => {
            let len = cursor.read_u8()? as usize;
            decode_big(cursor, len)?
        }
        LARGE_BIG_EXT => {
            let len = cursor.read_u32::<BigEndian>()? as usize;
            decode_big(cursor, len)?
        }
        MAP_EXT => {
            let arity = cursor.read_u32::<BigEndian>()? as usize;
            check_remaining(cursor, arity.saturating_mul(2))?;
            let mut map = Map::with_capacity(arity);
            for _ in 0..arity {
                let key = map_key(decode_term(cursor, depth + 1)?)?;
                let value = decode_term(cursor, depth + 1)?;
                map.insert(key, value);
            }
            Value::Object(map)
        }
        other => return Err(CodecError::UnsupportedTag(other)),
    };

    Ok(value)
}

fn decode_elements(
    cursor: &mut Cursor<&[u8]>,
    count: usize,
    depth: usize,
) -> Result<Vec<Value>, CodecError> {
    // Every element needs at least its tag byte.
    check_remaining(cursor, count)?;
    let mut items = Vec::with_capacity(count);
    for _ in 0..count {
        items.push(decode_term(cursor, depth + 1)?);
    }
    Ok(items)
}

fn decode_big(cursor: &mut Cursor<&[u8]>, len: usize) -> Result<Value, CodecError> {
    let sign = cursor.read_u8()?;
    let digits = read_bytes(cursor, len)?;
    if digits.len() > 16 && digits[16..].iter().any(|&d| d != 0) {
        return Err(CodecError::Unrepresentable("integer wider than 128 bits"));
    }

    let magnitude = digits
        .iter()
        .take(16)
        .rev()
        .fold(0u128, |acc, &digit| (acc << 8) | u128::from(digit));

    if sign == 0 {
        return Ok(match u64::try_from(magnitude) {
            Ok(n) => Value::from(n),
            // Beyond u64 the value survives as decimal text, like snowflakes in JSON.
            Err(_) => Value::String(magnitude.to_string()),
        });
    }

    match i64::try_from(magnitude).ok().and_then(i64::checked_neg) {
        Some(n) => Ok(Value::from(n)),
        None if magnitude == 1u128 << 63 => Ok(Value::from(i64::MIN)),
        None => Ok(Value::String(format!("-{magnitude}"))),
    }
}

fn read_atom(cursor: &mut Cursor<&[u8]>, len: usize, utf8: bool) -> Result<String, CodecError> {
    let bytes = read_bytes(cursor, len)?;
    if utf8 {
        Ok(String::from_utf8(bytes)?)
    } else {
        Ok(latin1(&bytes))
    }
}

fn atom_value(name: String) -> Value {
    match name.as_str() {
        "nil" | "null" => Value::Null,
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::String(name),
    }
}

fn map_key(key: Value) -> Result<String, CodecError> {
    match key {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Null => Ok("nil".to_string()),
        Value::Array(_) | Value::Object(_) => Err(CodecError::Unrepresentable("compound map key")),
    }
}

fn float_value(f: f64) -> Result<Value, CodecError> {
    Number::from_f64(f)
        .map(Value::Number)
        .ok_or(CodecError::Unrepresentable("non-finite float"))
}

fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

fn check_remaining(cursor: &Cursor<&[u8]>, declared: usize) -> Result<(), CodecError> {
    let total = cursor.get_ref().len();
    let position = usize::try_from(cursor.position()).unwrap_or(total);
    let remaining = total.saturating_sub(position);
    if declared > remaining {
        return Err(CodecError::Truncated {
            declared,
            remaining,
        });
    }
    Ok(())
}

fn read_bytes(cursor: &mut Cursor<&[u8]>, len: usize) -> Result<Vec<u8>, CodecError> {
    check_remaining(cursor, len)?;
    let mut bytes = vec![0u8; len];
    cursor.read_exact(&mut bytes)?;
    Ok(bytes)
}

fn encode_term(buffer: &mut Vec<u8>, value: &Value) -> Result<(), CodecError> {
    match value {
        Value::Null => write_atom(buffer, "nil")?,
        Value::Bool(true) => write_atom(buffer, "true")?,
        Value::Bool(false) => write_atom(buffer, "false")?,
        Value::Number(n) => encode_number(buffer, n)?,
        Value::String(s) => write_binary(buffer, s.as_bytes())?,
        Value::Array(items) => {
            if items.is_empty() {
                buffer.write_u8(NIL_EXT)?;
            } else {
                buffer.write_u8(LIST_EXT)?;
                buffer.write_u32::<BigEndian>(length(items.len())?)?;
                for item in items {
                    encode_term(buffer, item)?;
                }
                buffer.write_u8(NIL_EXT)?;
            }
        }
        Value::Object(map) => {
            buffer.write_u8(MAP_EXT)?;
            buffer.write_u32::<BigEndian>(length(map.len())?)?;
            for (key, item) in map {
                write_binary(buffer, key.as_bytes())?;
                encode_term(buffer, item)?;
            }
        }
    }
    Ok(())
}

fn encode_number(buffer: &mut Vec<u8>, n: &Number) -> Result<(), CodecError> {
    if let Some(unsigned) = n.as_u64() {
        if let Ok(small) = u8::try_from(unsigned) {
            buffer.write_u8(SMALL_INTEGER_EXT)?;
            buffer.write_u8(small)?;
        } else if let Ok(int) = i32::try_from(unsigned) {
            buffer.write_u8(INTEGER_EXT)?;
            buffer.write_i32::<BigEndian>(int)?;
        } else {
            write_small_big(buffer, 0, unsigned)?;
        }
    } else if let Some(signed) = n.as_i64() {
        if let Ok(int) = i32::try_from(signed) {
            buffer.write_u8(INTEGER_EXT)?;
            buffer.write_i32::<BigEndian>(int)?;
        } else {
            write_small_big(buffer, 1, signed.unsigned_abs())?;
        }
    } else if let Some(float) = n.as_f64() {
        buffer.write_u8(NEW_FLOAT_EXT)?;
        buffer.write_f64::<BigEndian>(float)?;
    } else {
        return Err(CodecError::Unrepresentable("number"));
    }
    Ok(())
}

fn write_small_big(buffer: &mut Vec<u8>, sign: u8, magnitude: u64) -> Result<(), CodecError> {
    let digits: Vec<u8> = magnitude.to_le_bytes().into_iter().collect();
    let significant = digits.iter().rposition(|&d| d != 0).map_or(1, |i| i + 1);
    buffer.write_u8(SMALL_BIG_EXT)?;
    buffer.write_u8(significant as u8)?;
    buffer.write_u8(sign)?;
    buffer.extend_from_slice(&digits[..significant]);
    Ok(())
}

fn write_atom(buffer: &mut Vec<u8>, name: &str) -> Result<(), CodecError> {
    let len = u8::try_from(name.len()).map_err(|_| CodecError::TooLarge { len: name.len() })?;
    buffer.write_u8(SMALL_ATOM_UTF8_EXT)?;
    buffer.write_u8(len)?;
    buffer.extend_from_slice(name.as_bytes());
    Ok(())
}

fn write_binary(buffer: &mut Vec<u8>, bytes: &[u8]) -> Result<(), CodecError> {
    buffer.write_u8(BINARY_EXT)?;
    buffer.write_u32::<BigEndian>(length(bytes.len())?)?;
    buffer.extend_from_slice(bytes);
    Ok(())
}

fn length(len: usize) -> Result<u32, CodecError> {
    u32::try_from(len).map_err(|_| CodecError::TooLarge { len })
}
