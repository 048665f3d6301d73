//! Framed little-endian encoding of schemas, index directories and records.
//!
//! Strings are a u32 byte length followed by UTF-8 bytes. Scalar type codes:
//! text=0, real=1, boolean=2, instant=3, null=4. Reals and instants are
//! 8-byte doubles (instants as epoch milliseconds).

use chrono::{TimeZone, Utc};
use std::collections::BTreeMap;

use crate::error::{ModbError, Result};
use crate::index::IndexSpec;
use crate::value::{FieldKind, Fields, Record, Value};

/// Wire code for null values; kind codes 0..=3 come from `FieldKind::code`.
pub const NULL_CODE: u8 = 4;

fn value_code(value: &Value) -> u8 {
    match value.kind() {
        Some(kind) => kind.code(),
        None => NULL_CODE,
    }
}

// ── Writing primitives ──────────────────────────────────────────

pub fn write_u8(out: &mut Vec<u8>, v: u8) {
    out.push(v);
}

pub fn write_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub fn write_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub fn write_f64(out: &mut Vec<u8>, v: f64) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub fn write_string(out: &mut Vec<u8>, s: &str) {
    write_u32(out, s.len() as u32);
    out.extend_from_slice(s.as_bytes());
}

// ── Reading cursor ──────────────────────────────────────────────

/// Bounds-checked cursor over an input buffer. Every read past the end is a
/// `FormatError` rather than a panic.
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        ByteReader { buf, pos: 0 }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn seek(&mut self, pos: usize) -> Result<()> {
        if pos > self.buf.len() {
            return Err(ModbError::Format(format!(
                "seek to {pos} past end of {}-byte input",
                self.buf.len()
            )));
        }
        self.pos = pos;
        Ok(())
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(ModbError::Format(format!(
                "truncated input: wanted {n} bytes at offset {}, {} left",
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        let b = self.take(8)?;
        Ok(f64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| ModbError::Format(format!("invalid UTF-8 string: {e}")))
    }
}

// ── Schema section ──────────────────────────────────────────────

/// `u32 field count`, then per field: string name, u8 kind code.
pub fn encode_schema(kinds: &BTreeMap<String, FieldKind>, out: &mut Vec<u8>) {
    write_u32(out, kinds.len() as u32);
    for (name, kind) in kinds {
        write_string(out, name);
        write_u8(out, kind.code());
    }
}

pub fn decode_schema(r: &mut ByteReader<'_>) -> Result<BTreeMap<String, FieldKind>> {
    let count = r.read_u32()?;
    let mut kinds = BTreeMap::new();
    for _ in 0..count {
        let name = r.read_string()?;
        let code = r.read_u8()?;
        let kind = FieldKind::from_code(code)
            .ok_or_else(|| ModbError::Format(format!("unknown field kind code {code}")))?;
        kinds.insert(name, kind);
    }
    Ok(kinds)
}

// ── Index directory section ─────────────────────────────────────

/// `u32 index count`, then per index: string name, string field, u8 flags
/// (bit 0 = unique).
pub fn encode_index_directory(specs: &[IndexSpec], out: &mut Vec<u8>) {
    write_u32(out, specs.len() as u32);
    for spec in specs {
        write_string(out, &spec.name);
        write_string(out, &spec.field);
        write_u8(out, if spec.unique { 1 } else { 0 });
    }
}

pub fn decode_index_directory(r: &mut ByteReader<'_>) -> Result<Vec<IndexSpec>> {
    let count = r.read_u32()?;
    let mut specs = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let name = r.read_string()?;
        let field = r.read_string()?;
        let flags = r.read_u8()?;
        specs.push(IndexSpec {
            name,
            field,
            unique: flags & 1 != 0,
        });
    }
    Ok(specs)
}

// ── Records ─────────────────────────────────────────────────────

fn encode_value(out: &mut Vec<u8>, value: &Value) {
    write_u8(out, value_code(value));
    match value {
        Value::Null => write_u32(out, 0),
        Value::Text(s) => {
            write_u32(out, s.len() as u32);
            out.extend_from_slice(s.as_bytes());
        }
        Value::Real(v) => {
            write_u32(out, 8);
            write_f64(out, *v);
        }
        Value::Boolean(b) => {
            write_u32(out, 1);
            write_u8(out, u8::from(*b));
        }
        Value::Instant(t) => {
            write_u32(out, 8);
            write_f64(out, t.timestamp_millis() as f64);
        }
    }
}

/// `u32 length-of-rest`, id string, then one framed value per schema field
/// in schema order. Fields the record does not assign encode as null.
pub fn encode_record(record: &Record, kinds: &BTreeMap<String, FieldKind>, out: &mut Vec<u8>) {
    let mut body = Vec::new();
    write_string(&mut body, &record.id);
    for name in kinds.keys() {
        encode_value(&mut body, record.fields.get(name).unwrap_or(&Value::Null));
    }
    write_u32(out, body.len() as u32);
    out.extend_from_slice(&body);
}

fn decode_value(r: &mut ByteReader<'_>, declared: FieldKind) -> Result<Value> {
    let code = r.read_u8()?;
    let len = r.read_u32()? as usize;
    if code == NULL_CODE {
        if len != 0 {
            return Err(ModbError::Format(format!(
                "null value with non-zero length {len}"
            )));
        }
        return Ok(Value::Null);
    }
    let kind = FieldKind::from_code(code)
        .ok_or_else(|| ModbError::Format(format!("unknown value kind code {code}")))?;
    if kind != declared {
        return Err(ModbError::Format(format!(
            "value of kind {kind} where schema declares {declared}"
        )));
    }
    match kind {
        FieldKind::Text => {
            let bytes = r.take(len)?;
            let s = String::from_utf8(bytes.to_vec())
                .map_err(|e| ModbError::Format(format!("invalid UTF-8 text value: {e}")))?;
            Ok(Value::Text(s))
        }
        FieldKind::Real => {
            if len != 8 {
                return Err(ModbError::Format(format!("real value with length {len}")));
            }
            Ok(Value::Real(r.read_f64()?))
        }
        FieldKind::Boolean => {
            if len != 1 {
                return Err(ModbError::Format(format!("boolean value with length {len}")));
            }
            Ok(Value::Boolean(r.read_u8()? != 0))
        }
        FieldKind::Instant => {
            if len != 8 {
                return Err(ModbError::Format(format!("instant value with length {len}")));
            }
            let ms = r.read_f64()? as i64;
            let t = Utc
                .timestamp_millis_opt(ms)
                .single()
                .ok_or_else(|| ModbError::Format(format!("instant out of range: {ms} ms")))?;
            Ok(Value::Instant(t))
        }
    }
}

/// Decode one record framed by `encode_record`. Null-coded fields are left
/// absent, matching the engine's treatment of nulls as unassigned.
pub fn decode_record(
    r: &mut ByteReader<'_>,
    kinds: &BTreeMap<String, FieldKind>,
) -> Result<Record> {
    let body_len = r.read_u32()? as usize;
    let start = r.pos();
    let id = r.read_string()?;
    let mut fields = Fields::new();
    for (name, kind) in kinds {
        let value = decode_value(r, *kind)?;
        if !value.is_null() {
            fields.insert(name.clone(), value);
        }
    }
    let consumed = r.pos() - start;
    if consumed != body_len {
        return Err(ModbError::Format(format!(
            "record body declared {body_len} bytes, decoded {consumed}"
        )));
    }
    Ok(Record { id, fields })
}
