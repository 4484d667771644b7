//! Bind-variable plumbing: the parameter value arena, format-code bitsets,
//! the three-way parameter type merge and the per-type value decoders.

#![allow(missing_docs)]

use crate::engine::{BindValue, BindVariables, ColumnType};
use crate::protocol::{DataTypeOid, FormatCode, PG_EPOCH_OFFSET_USEC};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use uuid::Uuid;

/// A compact grow-only bitset; bit *i* set means "binary" for slot *i*.
#[derive(Debug, Default, Clone)]
pub struct BitSet {
	words: Vec<u64>,
}

impl BitSet {
	pub fn set(&mut self, index: usize) {
		let word = index / 64;
		if word >= self.words.len() {
			self.words.resize(word + 1, 0);
		}
		self.words[word] |= 1 << (index % 64);
	}

	pub fn get(&self, index: usize) -> bool {
		self.words.get(index / 64).map_or(false, |w| w & (1 << (index % 64)) != 0)
	}

	pub fn clear(&mut self) {
		self.words.clear();
	}
}

/// Outcome of feeding BIND payload bytes to the arena.
#[derive(Debug, PartialEq, Eq)]
pub enum ArenaStatus {
	Complete,
	/// The frame ended before the declared value block did; feed the arena
	/// again once more bytes arrive.
	Incomplete { missing: usize },
}

/// Scratch memory mirroring the most recent BIND's raw value block, so
/// subsequent executions can re-read parameter values after the receive
/// buffer has been recycled. Grows by doubling, never shrinks, and is
/// released with the entry that owns it.
#[derive(Debug, Default)]
pub struct ParameterArena {
	buf: Vec<u8>,
	expected: usize,
	filled: usize,
}

impl ParameterArena {
	pub fn new() -> Self {
		Self::default()
	}

	/// Starts a new ingest of `area_size` bytes, discarding the previous
	/// payload. Capacity is rounded up to a power of two.
	pub fn begin(&mut self, area_size: usize) {
		let want = area_size.next_power_of_two();
		if self.buf.len() < want {
			self.buf.resize(want, 0);
		}
		self.expected = area_size;
		self.filled = 0;
	}

	/// Appends payload bytes, reporting whether the declared block is now
	/// complete. Bytes past the declared size are not consumed.
	pub fn ingest(&mut self, chunk: &[u8]) -> ArenaStatus {
		let take = chunk.len().min(self.expected - self.filled);
		self.buf[self.filled..self.filled + take].copy_from_slice(&chunk[..take]);
		self.filled += take;
		if self.filled < self.expected {
			ArenaStatus::Incomplete {
				missing: self.expected - self.filled,
			}
		} else {
			ArenaStatus::Complete
		}
	}

	pub fn is_complete(&self) -> bool {
		self.filled == self.expected
	}

	/// The complete value block of the last BIND.
	pub fn values(&self) -> &[u8] {
		&self.buf[..self.expected]
	}
}

/// Spreads the BIND message's parameter format codes over `value_count`
/// slots: one code broadcasts to every value, fewer codes than values leaves
/// the remainder text, extra codes are ignored.
pub fn spread_parameter_format_codes(codes: &[FormatCode], value_count: usize, bits: &mut BitSet) {
	bits.clear();
	match codes {
		[] => {}
		[single] => {
			if *single == FormatCode::Binary {
				for i in 0..value_count {
					bits.set(i);
				}
			}
		}
		many => {
			for (i, code) in many.iter().take(value_count).enumerate() {
				if *code == FormatCode::Binary {
					bits.set(i);
				}
			}
		}
	}
}

/// Merges client-declared parameter OIDs with compiler-inferred types.
///
/// The client's OID wins whenever it names a real type. Strict drivers
/// compare the OIDs they sent in PARSE against PARAMETER_DESCRIPTION and
/// abort on divergence, so the compiler's opinion is only used to fill gaps.
/// The inputs legitimately differ in length; every slot either side knows
/// about gets an entry.
pub fn reconcile_parameter_types(declared: &[DataTypeOid], inferred: &[Option<ColumnType>]) -> Vec<DataTypeOid> {
	let n = declared.len().max(inferred.len());
	let mut out = Vec::with_capacity(n);
	for i in 0..n {
		let mut oid = declared.get(i).copied().unwrap_or(DataTypeOid::Unspecified);
		if oid == DataTypeOid::Unspecified || oid == DataTypeOid::Void {
			oid = inferred
				.get(i)
				.and_then(|t| t.map(ColumnType::to_oid))
				.unwrap_or(DataTypeOid::Unspecified);
		}
		out.push(oid);
	}
	out
}

/// The engine type a parameter slot with this wire type binds as.
pub fn column_type_for_oid(oid: DataTypeOid) -> ColumnType {
	match oid {
		DataTypeOid::Bool => ColumnType::Bool,
		DataTypeOid::Bytea => ColumnType::Binary,
		DataTypeOid::Char => ColumnType::Char,
		DataTypeOid::Int2 => ColumnType::Short,
		DataTypeOid::Int4 => ColumnType::Int,
		DataTypeOid::Int8 => ColumnType::Long,
		DataTypeOid::Float4 => ColumnType::Float,
		DataTypeOid::Float8 => ColumnType::Double,
		DataTypeOid::Timestamp | DataTypeOid::Timestamptz => ColumnType::Timestamp,
		DataTypeOid::Date => ColumnType::Date,
		DataTypeOid::Uuid => ColumnType::Uuid,
		DataTypeOid::Unspecified => ColumnType::Null,
		_ => ColumnType::Varchar,
	}
}

#[derive(thiserror::Error, Debug)]
pub enum BindError {
	#[error("bad parameter value length for variable {variable}: required {required}, actual {actual}")]
	BadLength {
		variable: usize,
		required: usize,
		actual: usize,
	},
	#[error("invalid UTF-8 in value for variable {variable}")]
	BadUtf8 { variable: usize },
	#[error("bad value for variable {variable}: {message}")]
	BadValue { variable: usize, message: String },
	#[error("malformed bind variable block")]
	Malformed,
}

fn ensure_len(variable: usize, required: usize, actual: usize) -> Result<(), BindError> {
	if required == actual {
		Ok(())
	} else {
		Err(BindError::BadLength {
			variable,
			required,
			actual,
		})
	}
}

fn utf8<'a>(variable: usize, bytes: &'a [u8]) -> Result<&'a str, BindError> {
	std::str::from_utf8(bytes).map_err(|_| BindError::BadUtf8 { variable })
}

fn be_i16(bytes: &[u8]) -> i16 {
	i16::from_be_bytes([bytes[0], bytes[1]])
}

fn be_i32(bytes: &[u8]) -> i32 {
	i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn be_i64(bytes: &[u8]) -> i64 {
	i64::from_be_bytes([
		bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
	])
}

/// Parses timestamp text into unix microseconds. Accepts RFC 3339 as well as
/// the space-separated and date-only spellings Postgres clients produce.
pub fn parse_timestamp_text(value: &str) -> Option<i64> {
	if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
		return Some(dt.timestamp_micros());
	}
	for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
		if let Ok(dt) = NaiveDateTime::parse_from_str(value, format) {
			return Some(dt.and_utc().timestamp_micros());
		}
	}
	if let Ok(d) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
		return Some(d.and_hms_opt(0, 0, 0)?.and_utc().timestamp_micros());
	}
	None
}

fn decode_binary<'a>(variable: usize, target: ColumnType, value: &'a [u8]) -> Result<BindValue<'a>, BindError> {
	let size = value.len();
	let decoded = match target {
		ColumnType::Int => {
			ensure_len(variable, 4, size)?;
			BindValue::Int(be_i32(value))
		}
		ColumnType::Long => {
			ensure_len(variable, 8, size)?;
			BindValue::Long(be_i64(value))
		}
		ColumnType::Short => {
			ensure_len(variable, 2, size)?;
			BindValue::Short(be_i16(value))
		}
		ColumnType::Float => {
			ensure_len(variable, 4, size)?;
			BindValue::Float(f32::from_bits(be_i32(value) as u32))
		}
		ColumnType::Double => {
			ensure_len(variable, 8, size)?;
			BindValue::Double(f64::from_bits(be_i64(value) as u64))
		}
		// a curiosity of the protocol: booleans arrive as the *length* of
		// the textual literal, 4 for "true" and 5 for "false"
		ColumnType::Bool => match size {
			4 => BindValue::Bool(true),
			5 => BindValue::Bool(false),
			other => {
				return Err(BindError::BadValue {
					variable,
					message: format!("bad size for boolean parameter: {}", other),
				})
			}
		},
		ColumnType::Timestamp => {
			ensure_len(variable, 8, size)?;
			// the wire epoch is 2000-01-01, ours is 1970-01-01
			BindValue::Timestamp(be_i64(value) + PG_EPOCH_OFFSET_USEC)
		}
		ColumnType::Date => {
			ensure_len(variable, 8, size)?;
			BindValue::Date((be_i64(value) + PG_EPOCH_OFFSET_USEC) / 1000)
		}
		ColumnType::Char => {
			let text = utf8(variable, value)?;
			match text.chars().next() {
				Some(c) => BindValue::Char(c),
				None => BindValue::Null(ColumnType::Char),
			}
		}
		ColumnType::Uuid => {
			ensure_len(variable, 16, size)?;
			BindValue::Uuid(be_i64(&value[..8]), be_i64(&value[8..]))
		}
		ColumnType::Binary => BindValue::Binary(value),
		// binary and text representation of strings are the same
		_ => BindValue::Varchar(utf8(variable, value)?),
	};
	Ok(decoded)
}

fn decode_text<'a>(variable: usize, target: ColumnType, value: &'a [u8]) -> Result<BindValue<'a>, BindError> {
	let text = utf8(variable, value)?;
	let bad = |message: String| BindError::BadValue { variable, message };

	let decoded = match target {
		ColumnType::Int => BindValue::Int(text.parse().map_err(|_| bad(format!("invalid int: {}", text)))?),
		ColumnType::Long => BindValue::Long(text.parse().map_err(|_| bad(format!("invalid long: {}", text)))?),
		ColumnType::Short => BindValue::Short(text.parse().map_err(|_| bad(format!("invalid short: {}", text)))?),
		ColumnType::Byte => BindValue::Byte(text.parse().map_err(|_| bad(format!("invalid byte: {}", text)))?),
		ColumnType::Float => BindValue::Float(text.parse().map_err(|_| bad(format!("invalid float: {}", text)))?),
		ColumnType::Double => BindValue::Double(text.parse().map_err(|_| bad(format!("invalid double: {}", text)))?),
		ColumnType::Bool => match text {
			"t" | "true" | "TRUE" | "on" | "1" => BindValue::Bool(true),
			"f" | "false" | "FALSE" | "off" | "0" => BindValue::Bool(false),
			other => return Err(bad(format!("invalid boolean: {}", other))),
		},
		ColumnType::Timestamp => {
			BindValue::Timestamp(parse_timestamp_text(text).ok_or_else(|| bad(format!("invalid timestamp: {}", text)))?)
		}
		ColumnType::Date => {
			BindValue::Date(parse_timestamp_text(text).ok_or_else(|| bad(format!("invalid date: {}", text)))? / 1000)
		}
		ColumnType::Char => match text.chars().next() {
			Some(c) => BindValue::Char(c),
			None => BindValue::Null(ColumnType::Char),
		},
		ColumnType::Uuid => {
			let uuid = Uuid::parse_str(text).map_err(|_| bad(format!("invalid uuid: {}", text)))?;
			let v = uuid.as_u128();
			BindValue::Uuid((v >> 64) as i64, v as i64)
		}
		ColumnType::Binary => BindValue::Binary(value),
		// the target is string-shaped: hand the engine the bytes in place.
		// the slice borrows the arena and is valid for this execution only.
		_ => BindValue::Varchar(text),
	};
	Ok(decoded)
}

/// Decodes the arena's raw value block into typed engine bind slots.
///
/// One slot per reconciled parameter type: slots the client sent values for
/// are decoded according to their format code and wire type; slots beyond the
/// sent values bind as typed NULLs so the engine still sees every variable
/// the statement declares.
pub fn decode_bind_variables<'a>(
	arena: &'a [u8],
	value_count: usize,
	format_codes: &BitSet,
	parameter_types: &[DataTypeOid],
) -> Result<BindVariables<'a>, BindError> {
	let mut binds = BindVariables::with_capacity(parameter_types.len());
	let mut pos = 0usize;

	for (i, &oid) in parameter_types.iter().enumerate() {
		let target = column_type_for_oid(oid);
		if i >= value_count {
			binds.push(BindValue::Null(target));
			continue;
		}

		if pos + 4 > arena.len() {
			return Err(BindError::Malformed);
		}
		let value_len = be_i32(&arena[pos..pos + 4]);
		pos += 4;

		if value_len < 0 {
			// length -1: value not provided, bind a typed NULL
			binds.push(BindValue::Null(target));
			continue;
		}

		let value_len = value_len as usize;
		if pos + value_len > arena.len() {
			return Err(BindError::Malformed);
		}
		let value = &arena[pos..pos + value_len];
		pos += value_len;

		let decoded = if format_codes.get(i) {
			decode_binary(i, target, value)?
		} else {
			decode_text(i, target, value)?
		};
		binds.push(decoded);
	}

	Ok(binds)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn area(values: &[Option<&[u8]>]) -> Vec<u8> {
		let mut out = Vec::new();
		for v in values {
			match v {
				Some(bytes) => {
					out.extend_from_slice(&(bytes.len() as i32).to_be_bytes());
					out.extend_from_slice(bytes);
				}
				None => out.extend_from_slice(&(-1i32).to_be_bytes()),
			}
		}
		out
	}

	#[test]
	fn bitset_set_get() {
		let mut bits = BitSet::default();
		bits.set(0);
		bits.set(67);
		assert!(bits.get(0));
		assert!(!bits.get(1));
		assert!(bits.get(67));
		bits.clear();
		assert!(!bits.get(0));
	}

	#[test]
	fn arena_reports_incomplete_and_resumes() {
		let mut arena = ParameterArena::new();
		arena.begin(10);
		assert_eq!(arena.ingest(&[1, 2, 3, 4]), ArenaStatus::Incomplete { missing: 6 });
		assert!(!arena.is_complete());
		assert_eq!(arena.ingest(&[5, 6, 7, 8, 9, 10]), ArenaStatus::Complete);
		assert_eq!(arena.values(), &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
	}

	#[test]
	fn arena_grows_to_power_of_two() {
		let mut arena = ParameterArena::new();
		arena.begin(5);
		assert!(arena.buf.len() >= 8);
		arena.begin(100);
		assert!(arena.buf.len() >= 128);
	}

	#[test]
	fn reconcile_keeps_client_oids_in_place() {
		let declared = vec![DataTypeOid::Int8, DataTypeOid::Unspecified];
		let inferred = vec![Some(ColumnType::Int), Some(ColumnType::Varchar), Some(ColumnType::Double)];
		let merged = reconcile_parameter_types(&declared, &inferred);
		assert_eq!(merged, vec![DataTypeOid::Int8, DataTypeOid::Varchar, DataTypeOid::Float8]);
	}

	#[test]
	fn reconcile_void_falls_back_to_inferred() {
		let merged = reconcile_parameter_types(&[DataTypeOid::Void], &[Some(ColumnType::Long)]);
		assert_eq!(merged, vec![DataTypeOid::Int8]);
	}

	#[test]
	fn spread_single_binary_code_broadcasts() {
		let mut bits = BitSet::default();
		spread_parameter_format_codes(&[FormatCode::Binary], 3, &mut bits);
		assert!(bits.get(0) && bits.get(1) && bits.get(2));
	}

	#[test]
	fn spread_fewer_codes_than_values_leaves_text() {
		let mut bits = BitSet::default();
		spread_parameter_format_codes(&[FormatCode::Binary, FormatCode::Text], 3, &mut bits);
		assert!(bits.get(0));
		assert!(!bits.get(1));
		assert!(!bits.get(2));
	}

	#[test]
	fn binary_int_decodes() {
		let block = area(&[Some(&42i32.to_be_bytes())]);
		let mut bits = BitSet::default();
		bits.set(0);
		let binds = decode_bind_variables(&block, 1, &bits, &[DataTypeOid::Int4]).unwrap();
		assert_eq!(binds.get(0), Some(&BindValue::Int(42)));
	}

	#[test]
	fn binary_length_mismatch_is_reported() {
		let block = area(&[Some(&7i16.to_be_bytes())]);
		let mut bits = BitSet::default();
		bits.set(0);
		let err = decode_bind_variables(&block, 1, &bits, &[DataTypeOid::Int4]).unwrap_err();
		match err {
			BindError::BadLength {
				variable,
				required,
				actual,
			} => {
				assert_eq!((variable, required, actual), (0, 4, 2));
			}
			other => panic!("unexpected error {:?}", other),
		}
	}

	#[test]
	fn null_value_binds_typed_null() {
		let block = area(&[None]);
		let binds = decode_bind_variables(&block, 1, &BitSet::default(), &[DataTypeOid::Int8]).unwrap();
		assert_eq!(binds.get(0), Some(&BindValue::Null(ColumnType::Long)));
	}

	#[test]
	fn missing_values_pad_with_typed_nulls() {
		let block = area(&[Some(b"1")]);
		let binds =
			decode_bind_variables(&block, 1, &BitSet::default(), &[DataTypeOid::Int4, DataTypeOid::Varchar]).unwrap();
		assert_eq!(binds.len(), 2);
		assert_eq!(binds.get(1), Some(&BindValue::Null(ColumnType::Varchar)));
	}

	#[test]
	fn binary_bool_length_quirk() {
		let mut bits = BitSet::default();
		bits.set(0);
		let yes = area(&[Some(&[0, 0, 0, 0])]);
		let binds = decode_bind_variables(&yes, 1, &bits, &[DataTypeOid::Bool]).unwrap();
		assert_eq!(binds.get(0), Some(&BindValue::Bool(true)));

		let no = area(&[Some(&[0, 0, 0, 0, 0])]);
		let binds = decode_bind_variables(&no, 1, &bits, &[DataTypeOid::Bool]).unwrap();
		assert_eq!(binds.get(0), Some(&BindValue::Bool(false)));
	}

	#[test]
	fn binary_timestamp_shifts_epoch() {
		let wire: i64 = 1_000_000; // one second past the wire epoch
		let block = area(&[Some(&wire.to_be_bytes())]);
		let mut bits = BitSet::default();
		bits.set(0);
		let binds = decode_bind_variables(&block, 1, &bits, &[DataTypeOid::Timestamp]).unwrap();
		assert_eq!(binds.get(0), Some(&BindValue::Timestamp(PG_EPOCH_OFFSET_USEC + 1_000_000)));
	}

	#[test]
	fn binary_uuid_splits_halves() {
		let mut raw = [0u8; 16];
		raw[..8].copy_from_slice(&1i64.to_be_bytes());
		raw[8..].copy_from_slice(&2i64.to_be_bytes());
		let block = area(&[Some(&raw)]);
		let mut bits = BitSet::default();
		bits.set(0);
		let binds = decode_bind_variables(&block, 1, &bits, &[DataTypeOid::Uuid]).unwrap();
		assert_eq!(binds.get(0), Some(&BindValue::Uuid(1, 2)));
	}

	#[test]
	fn text_values_parse_per_type() {
		let block = area(&[Some(b"123"), Some(b"4.5"), Some(b"t"), Some(b"hello")]);
		let types = [
			DataTypeOid::Int8,
			DataTypeOid::Float8,
			DataTypeOid::Bool,
			DataTypeOid::Varchar,
		];
		let binds = decode_bind_variables(&block, 4, &BitSet::default(), &types).unwrap();
		assert_eq!(binds.get(0), Some(&BindValue::Long(123)));
		assert_eq!(binds.get(1), Some(&BindValue::Double(4.5)));
		assert_eq!(binds.get(2), Some(&BindValue::Bool(true)));
		assert_eq!(binds.get(3), Some(&BindValue::Varchar("hello")));
	}

	#[test]
	fn text_timestamp_accepts_rfc3339() {
		let block = area(&[Some(b"2024-01-01T00:00:00Z")]);
		let binds = decode_bind_variables(&block, 1, &BitSet::default(), &[DataTypeOid::Timestamp]).unwrap();
		match binds.get(0) {
			Some(BindValue::Timestamp(us)) => assert_eq!(*us, 1_704_067_200_000_000),
			other => panic!("unexpected {:?}", other),
		}
	}

	#[test]
	fn invalid_utf8_text_is_reported_with_slot() {
		let block = area(&[Some(&[0xff, 0xfe])]);
		let err = decode_bind_variables(&block, 1, &BitSet::default(), &[DataTypeOid::Varchar]).unwrap_err();
		assert!(matches!(err, BindError::BadUtf8 { variable: 0 }));
	}

	#[test]
	fn randomized_binary_and_text_values_round_trip() {
		use rand::Rng;

		let mut rng = rand::thread_rng();
		let mut bits = BitSet::default();
		bits.set(0);

		for _ in 0..64 {
			let expected: i64 = rng.gen();
			let block = area(&[Some(&expected.to_be_bytes())]);
			let binds = decode_bind_variables(&block, 1, &bits, &[DataTypeOid::Int8]).unwrap();
			assert_eq!(binds.get(0), Some(&BindValue::Long(expected)));

			let text = expected.to_string();
			let block = area(&[Some(text.as_bytes())]);
			let binds = decode_bind_variables(&block, 1, &BitSet::default(), &[DataTypeOid::Int8]).unwrap();
			assert_eq!(binds.get(0), Some(&BindValue::Long(expected)));

			let expected: f64 = rng.gen();
			let block = area(&[Some(&expected.to_bits().to_be_bytes())]);
			let binds = decode_bind_variables(&block, 1, &bits, &[DataTypeOid::Float8]).unwrap();
			assert_eq!(binds.get(0), Some(&BindValue::Double(expected)));
		}
	}

	#[test]
	fn text_uuid_round_trips_halves() {
		let block = area(&[Some(b"00000000-0000-0001-0000-000000000002")]);
		let binds = decode_bind_variables(&block, 1, &BitSet::default(), &[DataTypeOid::Uuid]).unwrap();
		assert_eq!(binds.get(0), Some(&BindValue::Uuid(1, 2)));
	}
}
