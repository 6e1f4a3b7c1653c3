//! On-disk framing of stored documents.
//!
//! A primary record is `ObjectHeader || token-encoded body`. The header
//! identifies the kind (by engine-level token) and carries the revision
//! and tombstone flag; the body is a tag-prefixed binary tree whose
//! property names are replaced by per-kind integer tokens. The token
//! dictionary lives with the kind and is append-only.

use crate::err::Error;
use crate::err::Result;
use crate::kind::TokenSet;
use crate::obj;
use serde_json::Map;
use serde_json::Number;
use serde_json::Value;

/// Current record format version.
const FRAME_VERSION: u8 = 1;

/// Header flag marking a tombstone.
const FLAG_DEL: u8 = 0x01;

const TAG_NULL: u8 = 0;
const TAG_FALSE: u8 = 1;
const TAG_TRUE: u8 = 2;
const TAG_INT: u8 = 3;
const TAG_FLOAT: u8 = 4;
const TAG_STRING: u8 = 5;
const TAG_ARRAY: u8 = 6;
const TAG_OBJECT: u8 = 7;

/// The fixed part at the front of every stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectHeader {
	pub kind_tok: i64,
	pub rev: i64,
	pub del: bool,
}

/// Frame a document for storage. Reserved keys are carried by the header
/// and the primary key, not the body.
pub fn encode_record(obj: &Value, kind_tok: i64, rev: i64, del: bool, tokens: &mut TokenSet) -> Result<Vec<u8>> {
	let map = obj.as_object().ok_or_else(|| Error::UnsupportedValue("document must be an object".into()))?;
	let mut out = Vec::with_capacity(64);
	out.push(FRAME_VERSION);
	out.push(if del {
		FLAG_DEL
	} else {
		0
	});
	write_varint(&mut out, zigzag(kind_tok));
	write_varint(&mut out, zigzag(rev));
	write_varint(&mut out, body_len(map) as u64);
	for (name, val) in map {
		if is_reserved(name) {
			continue;
		}
		let tok = tokens.intern(name);
		write_varint(&mut out, tok as u64);
		encode_value(&mut out, val, tokens);
	}
	Ok(out)
}

/// Parse a stored record back into its header and body document.
pub fn decode_record(data: &[u8], tokens: &TokenSet) -> Result<(ObjectHeader, Value)> {
	let mut pos = 0usize;
	let version = read_u8(data, &mut pos)?;
	if version != FRAME_VERSION {
		return Err(Error::CorruptHeader);
	}
	let flags = read_u8(data, &mut pos)?;
	let kind_tok = unzigzag(read_varint(data, &mut pos)?);
	let rev = unzigzag(read_varint(data, &mut pos)?);
	let header = ObjectHeader {
		kind_tok,
		rev,
		del: flags & FLAG_DEL != 0,
	};
	let count = read_varint(data, &mut pos)? as usize;
	let mut map = Map::with_capacity(count);
	for _ in 0..count {
		let tok = read_varint(data, &mut pos)? as u32;
		let name = tokens.name(tok).ok_or(Error::CorruptHeader)?;
		let val = decode_value(data, &mut pos, tokens)?;
		map.insert(name.to_string(), val);
	}
	Ok((header, Value::Object(map)))
}

/// Peek at a record's header without decoding the body.
pub fn peek_header(data: &[u8]) -> Result<ObjectHeader> {
	let mut pos = 0usize;
	let version = read_u8(data, &mut pos)?;
	if version != FRAME_VERSION {
		return Err(Error::CorruptHeader);
	}
	let flags = read_u8(data, &mut pos)?;
	let kind_tok = unzigzag(read_varint(data, &mut pos)?);
	let rev = unzigzag(read_varint(data, &mut pos)?);
	Ok(ObjectHeader {
		kind_tok,
		rev,
		del: flags & FLAG_DEL != 0,
	})
}

fn is_reserved(name: &str) -> bool {
	matches!(name, obj::ID_KEY | obj::KIND_KEY | obj::REV_KEY | obj::DEL_KEY)
}

fn body_len(map: &Map<String, Value>) -> usize {
	map.keys().filter(|k| !is_reserved(k)).count()
}

fn encode_value(out: &mut Vec<u8>, val: &Value, tokens: &mut TokenSet) {
	match val {
		Value::Null => out.push(TAG_NULL),
		Value::Bool(false) => out.push(TAG_FALSE),
		Value::Bool(true) => out.push(TAG_TRUE),
		Value::Number(n) => {
			if let Some(i) = n.as_i64() {
				out.push(TAG_INT);
				write_varint(out, zigzag(i));
			} else {
				out.push(TAG_FLOAT);
				out.extend_from_slice(&n.as_f64().unwrap_or(0.0).to_le_bytes());
			}
		}
		Value::String(s) => {
			out.push(TAG_STRING);
			write_varint(out, s.len() as u64);
			out.extend_from_slice(s.as_bytes());
		}
		Value::Array(items) => {
			out.push(TAG_ARRAY);
			write_varint(out, items.len() as u64);
			for item in items {
				encode_value(out, item, tokens);
			}
		}
		Value::Object(map) => {
			out.push(TAG_OBJECT);
			write_varint(out, map.len() as u64);
			for (name, val) in map {
				let tok = tokens.intern(name);
				write_varint(out, tok as u64);
				encode_value(out, val, tokens);
			}
		}
	}
}

fn decode_value(data: &[u8], pos: &mut usize, tokens: &TokenSet) -> Result<Value> {
	let tag = read_u8(data, pos)?;
	match tag {
		TAG_NULL => Ok(Value::Null),
		TAG_FALSE => Ok(Value::Bool(false)),
		TAG_TRUE => Ok(Value::Bool(true)),
		TAG_INT => Ok(Value::Number(unzigzag(read_varint(data, pos)?).into())),
		TAG_FLOAT => {
			let bytes = read_slice(data, pos, 8)?;
			let f = f64::from_le_bytes(bytes.try_into().map_err(|_| Error::CorruptHeader)?);
			Ok(Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null))
		}
		TAG_STRING => {
			let len = read_varint(data, pos)? as usize;
			let bytes = read_slice(data, pos, len)?;
			let s = std::str::from_utf8(bytes).map_err(|_| Error::CorruptHeader)?;
			Ok(Value::String(s.to_string()))
		}
		TAG_ARRAY => {
			let len = read_varint(data, pos)? as usize;
			let mut items = Vec::with_capacity(len.min(4096));
			for _ in 0..len {
				items.push(decode_value(data, pos, tokens)?);
			}
			Ok(Value::Array(items))
		}
		TAG_OBJECT => {
			let len = read_varint(data, pos)? as usize;
			let mut map = Map::with_capacity(len.min(4096));
			for _ in 0..len {
				let tok = read_varint(data, pos)? as u32;
				let name = tokens.name(tok).ok_or(Error::CorruptHeader)?;
				map.insert(name.to_string(), decode_value(data, pos, tokens)?);
			}
			Ok(Value::Object(map))
		}
		_ => Err(Error::CorruptHeader),
	}
}

fn zigzag(v: i64) -> u64 {
	((v << 1) ^ (v >> 63)) as u64
}

fn unzigzag(v: u64) -> i64 {
	((v >> 1) as i64) ^ -((v & 1) as i64)
}

fn write_varint(out: &mut Vec<u8>, mut v: u64) {
	loop {
		let byte = (v & 0x7f) as u8;
		v >>= 7;
		if v == 0 {
			out.push(byte);
			break;
		}
		out.push(byte | 0x80);
	}
}

fn read_varint(data: &[u8], pos: &mut usize) -> Result<u64> {
	let mut out = 0u64;
	let mut shift = 0u32;
	loop {
		let byte = read_u8(data, pos)?;
		out |= u64::from(byte & 0x7f) << shift;
		if byte & 0x80 == 0 {
			return Ok(out);
		}
		shift += 7;
		if shift > 63 {
			return Err(Error::CorruptHeader);
		}
	}
}

fn read_u8(data: &[u8], pos: &mut usize) -> Result<u8> {
	let byte = *data.get(*pos).ok_or(Error::CorruptHeader)?;
	*pos += 1;
	Ok(byte)
}

fn read_slice<'a>(data: &'a [u8], pos: &mut usize, len: usize) -> Result<&'a [u8]> {
	let end = pos.checked_add(len).ok_or(Error::CorruptHeader)?;
	let slice = data.get(*pos..end).ok_or(Error::CorruptHeader)?;
	*pos = end;
	Ok(slice)
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn record_round_trip() {
		let mut tokens = TokenSet::default();
		let doc = json!({
			"_id": "00000000abcd",
			"_kind": "Contact:1",
			"name": "Grace",
			"age": 52,
			"score": -1.5,
			"tags": ["a", "b"],
			"address": {"city": "Seoul", "zip": null},
		});
		let data = encode_record(&doc, 7, 42, false, &mut tokens).unwrap();
		let (header, body) = decode_record(&data, &tokens).unwrap();
		assert_eq!(header.kind_tok, 7);
		assert_eq!(header.rev, 42);
		assert!(!header.del);
		// reserved keys live in the header and key, not the body
		assert!(body.get("_id").is_none());
		assert!(body.get("_kind").is_none());
		assert_eq!(body["name"], json!("Grace"));
		assert_eq!(body["age"], json!(52));
		assert_eq!(body["score"], json!(-1.5));
		assert_eq!(body["tags"], json!(["a", "b"]));
		assert_eq!(body["address"], json!({"city": "Seoul", "zip": null}));
	}

	#[test]
	fn tombstone_flag_survives() {
		let mut tokens = TokenSet::default();
		let doc = json!({"_kind": "Contact:1", "x": 1});
		let data = encode_record(&doc, 1, 9, true, &mut tokens).unwrap();
		let header = peek_header(&data).unwrap();
		assert!(header.del);
		assert_eq!(header.rev, 9);
	}

	#[test]
	fn unknown_token_is_integrity_error() {
		let mut tokens = TokenSet::default();
		let doc = json!({"_kind": "Contact:1", "x": 1});
		let data = encode_record(&doc, 1, 9, false, &mut tokens).unwrap();
		// decoding against an empty dictionary must fail, not panic
		let empty = TokenSet::default();
		assert!(decode_record(&data, &empty).is_err());
	}
}
