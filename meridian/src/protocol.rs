//! Contains types that represent the core Postgres wire protocol.

// this module requires a lot more work to document
// may want to build this automatically from Postgres docs if possible
#![allow(missing_docs)]

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::convert::TryFrom;
use std::fmt::Display;
use std::mem::size_of;
use tokio_util::codec::{Decoder, Encoder};

/// Offset between the unix epoch and the Postgres binary wire epoch (2000-01-01),
/// in microseconds. Binary timestamps shift by this amount in both directions.
pub const PG_EPOCH_OFFSET_USEC: i64 = 946_684_800_000_000;

macro_rules! data_types {
	($($name:ident = $oid:expr, $size: expr)*) => {
		#[derive(Debug, Copy, Clone, PartialEq, Eq)]
		/// Describes a Postgres data type.
		pub enum DataTypeOid {
			$(
				#[allow(missing_docs)]
				$name,
			)*
			/// A type which is not known to this crate.
			Unknown(u32),
		}

		impl DataTypeOid {
			/// Fetch the size in bytes for this data type.
			/// Variably-sized types return -1.
			pub fn size_bytes(&self) -> i16 {
				match self {
					$(
						Self::$name => $size,
					)*
					Self::Unknown(oid) => {
						tracing::warn!("unknown data type OID {}", oid);
						-1 // assume variable length
					}
				}
			}
		}

		impl From<u32> for DataTypeOid {
			fn from(value: u32) -> Self {
				match value {
					$(
						$oid => Self::$name,
					)*
					other => Self::Unknown(other),
				}
			}
		}

		impl From<DataTypeOid> for u32 {
			fn from(value: DataTypeOid) -> Self {
				match value {
					$(
						DataTypeOid::$name => $oid,
					)*
					DataTypeOid::Unknown(other) => other,
				}
			}
		}
	};
}

// For oid see:
// https://github.com/sfackler/rust-postgres/blob/master/postgres-types/src/type_gen.rs
//
// Only the types this front-end can bind or serialize, plus the handful of
// wire types clients commonly declare in PARSE. Catalog emulation is a non-goal.
data_types! {
	Unspecified = 0, 0
	Bool = 16, 1
	Bytea = 17, -1
	Char = 18, 1
	Name = 19, 64
	Int8 = 20, 8
	Int2 = 21, 2
	Int4 = 23, 4
	Text = 25, -1
	Oid = 26, 4
	Json = 114, -1
	Float4 = 700, 4
	Float8 = 701, 8
	Bpchar = 1042, -1
	Varchar = 1043, -1
	Date = 1082, 4
	Time = 1083, 8
	Timestamp = 1114, 8
	Timestamptz = 1184, 8
	Interval = 1186, 16
	Numeric = 1700, -1
	Void = 2278, -1
	Uuid = 2950, 16
	Jsonb = 3802, -1
}

/// Describes how to format a given value or set of values.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FormatCode {
	/// Use the stable text representation.
	Text = 0,
	/// Use the less-stable binary representation.
	Binary = 1,
}

impl TryFrom<i16> for FormatCode {
	type Error = ProtocolError;

	fn try_from(value: i16) -> Result<Self, Self::Error> {
		match value {
			0 => Ok(FormatCode::Text),
			1 => Ok(FormatCode::Binary),
			other => Err(ProtocolError::InvalidFormatCode(other)),
		}
	}
}

#[derive(Debug)]
pub struct Startup {
	pub requested_protocol_version: (i16, i16),
	pub parameters: HashMap<String, String>,
}

#[derive(Debug)]
pub enum Describe {
	Portal(String),
	PreparedStatement(String),
}

#[derive(Debug)]
pub struct Parse {
	pub prepared_statement_name: String,
	pub query: String,
	pub parameter_types: Vec<DataTypeOid>,
}

#[derive(Debug)]
pub struct Bind {
	pub portal: String,
	pub prepared_statement_name: String,
	/// Format codes for the parameter values, as sent: zero, one (broadcast)
	/// or one per value.
	pub parameter_format_codes: Vec<FormatCode>,
	/// Declared number of parameter values in this message.
	pub parameter_value_count: i16,
	/// The raw `{length, bytes}` value block, uninterpreted. The pipeline
	/// entry copies this into its parameter arena so later executions can
	/// re-read it after this buffer has been recycled.
	pub parameter_area: Bytes,
	/// Format codes for result columns: zero, one (broadcast) or one per column.
	pub result_format_codes: Vec<FormatCode>,
}

#[derive(Debug)]
pub enum Close {
	Portal(String),
	PreparedStatement(String),
}

#[derive(Debug)]
pub struct Execute {
	pub portal: String,
	pub max_rows: Option<i32>,
}

#[derive(Debug)]
pub enum ClientMessage {
	SSLRequest, // for SSL negotiation
	Startup(Startup),
	Parse(Parse),
	Describe(Describe),
	Bind(Bind),
	Sync,
	Execute(Execute),
	Query(String),
	Terminate,
	Close(Close),
}

// Message type tags for responses the pipeline entry streams through its
// output buffer rather than the codec.
pub const MESSAGE_TYPE_PARSE_COMPLETE: u8 = b'1';
pub const MESSAGE_TYPE_BIND_COMPLETE: u8 = b'2';
pub const MESSAGE_TYPE_CLOSE_COMPLETE: u8 = b'3';
pub const MESSAGE_TYPE_COMMAND_COMPLETE: u8 = b'C';
pub const MESSAGE_TYPE_DATA_ROW: u8 = b'D';
pub const MESSAGE_TYPE_EMPTY_QUERY: u8 = b'I';
pub const MESSAGE_TYPE_ERROR_RESPONSE: u8 = b'E';
pub const MESSAGE_TYPE_NO_DATA: u8 = b'n';
pub const MESSAGE_TYPE_PARAMETER_DESCRIPTION: u8 = b't';
pub const MESSAGE_TYPE_PORTAL_SUSPENDED: u8 = b's';
pub const MESSAGE_TYPE_ROW_DESCRIPTION: u8 = b'T';

pub trait BackendMessage: std::fmt::Debug {
	const TAG: u8;

	fn encode(&self, dst: &mut BytesMut);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlState {
	SuccessfulCompletion,
	FeatureNotSupported,
	InvalidCursorName,
	ConnectionException,
	InvalidSQLStatementName,
	DataException,
	ProtocolViolation,
	SyntaxError,
	InvalidDatetimeFormat,
	InFailedSqlTransaction,
}

impl SqlState {
	pub fn code(&self) -> &str {
		match self {
			Self::SuccessfulCompletion => "00000",
			Self::FeatureNotSupported => "0A000",
			Self::InvalidCursorName => "34000",
			Self::ConnectionException => "08000",
			Self::InvalidSQLStatementName => "26000",
			Self::DataException => "22000",
			Self::ProtocolViolation => "08P01",
			Self::SyntaxError => "42601",
			Self::InvalidDatetimeFormat => "22007",
			Self::InFailedSqlTransaction => "25P02",
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Severity {
	Error,
	Fatal,
}

impl Severity {
	pub fn code(&self) -> &str {
		match self {
			Self::Fatal => "FATAL",
			Self::Error => "ERROR",
		}
	}
}

#[derive(thiserror::Error, Debug, Clone)]
pub struct ErrorResponse {
	pub sql_state: SqlState,
	pub severity: Severity,
	pub message: String,
	/// 1-based position into the SQL text, if the error pinpoints one.
	pub position: Option<i32>,
	/// Reporting routine. Strict clients look for `RevalidateCachedQuery`
	/// here to decide whether to re-prepare after a stale-plan error.
	pub routine: Option<&'static str>,
}

impl ErrorResponse {
	pub fn new(sql_state: SqlState, severity: Severity, message: impl Into<String>) -> Self {
		ErrorResponse {
			sql_state,
			severity,
			message: message.into(),
			position: None,
			routine: None,
		}
	}

	pub fn error(sql_state: SqlState, message: impl Into<String>) -> Self {
		Self::new(sql_state, Severity::Error, message)
	}

	pub fn fatal(sql_state: SqlState, message: impl Into<String>) -> Self {
		Self::new(sql_state, Severity::Fatal, message)
	}
}

impl Display for ErrorResponse {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "error: {}: {}", self.sql_state.code(), self.message)
	}
}

impl BackendMessage for ErrorResponse {
	const TAG: u8 = b'E';

	fn encode(&self, dst: &mut BytesMut) {
		dst.put_u8(b'C');
		dst.put_slice(self.sql_state.code().as_bytes());
		dst.put_u8(0);
		if let Some(routine) = self.routine {
			dst.put_u8(b'R');
			dst.put_slice(routine.as_bytes());
			dst.put_u8(0);
		}
		dst.put_u8(b'M');
		dst.put_slice(self.message.as_bytes());
		dst.put_u8(0);
		dst.put_u8(b'S');
		dst.put_slice(self.severity.code().as_bytes());
		dst.put_u8(0);
		if let Some(position) = self.position {
			dst.put_u8(b'P');
			dst.put_slice(position.to_string().as_bytes());
			dst.put_u8(0);
		}

		dst.put_u8(0); // tag
	}
}

#[derive(Debug)]
pub struct AuthenticationOk;

impl BackendMessage for AuthenticationOk {
	const TAG: u8 = b'R';

	fn encode(&self, dst: &mut BytesMut) {
		dst.put_i32(0);
	}
}

/// Transaction status byte reported in READY_FOR_QUERY.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransactionStatus {
	Idle,
	Transaction,
	FailedTransaction,
}

impl TransactionStatus {
	pub fn code(&self) -> u8 {
		match self {
			Self::Idle => b'I',
			Self::Transaction => b'T',
			Self::FailedTransaction => b'E',
		}
	}
}

#[derive(Debug)]
pub struct ReadyForQuery(pub TransactionStatus);

impl BackendMessage for ReadyForQuery {
	const TAG: u8 = b'Z';

	fn encode(&self, dst: &mut BytesMut) {
		dst.put_u8(self.0.code());
	}
}

#[derive(Debug)]
pub struct ParameterStatus {
	name: String,
	value: String,
}

impl BackendMessage for ParameterStatus {
	const TAG: u8 = b'S';

	fn encode(&self, dst: &mut BytesMut) {
		dst.put_slice(self.name.as_bytes());
		dst.put_u8(0);
		dst.put_slice(self.value.as_bytes());
		dst.put_u8(0);
	}
}

impl ParameterStatus {
	pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			value: value.into(),
		}
	}
}

#[derive(Default, Debug)]
pub struct ConnectionCodec {
	// most state tracking is handled at a higher level
	// however, the actual wire format uses a different header for startup vs normal messages
	// so we need to be able to differentiate inside the decoder
	startup_received: bool,
}

impl ConnectionCodec {
	pub fn new() -> Self {
		Self {
			startup_received: false,
		}
	}
}

#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
	#[error("io error: {0}")]
	Io(#[from] std::io::Error),
	#[error("utf8 error: {0}")]
	Utf8(#[from] std::string::FromUtf8Error),
	#[error("protocol violation: {0}")]
	BadMessage(&'static str),
	#[error("invalid message type: {0}")]
	InvalidMessageType(u8),
	#[error("invalid format code: {0}")]
	InvalidFormatCode(i16),
}

// length prefix, two version components
const STARTUP_HEADER_SIZE: usize = size_of::<i32>() + (size_of::<i16>() * 2);
// message tag, length prefix
const MESSAGE_HEADER_SIZE: usize = size_of::<u8>() + size_of::<i32>();

// Bounds-checked reads against the message body. The framing layer has
// verified the body is complete; these guard against lengths that lie.
fn read_u8(body: &mut Bytes, what: &'static str) -> Result<u8, ProtocolError> {
	if body.remaining() < 1 {
		return Err(ProtocolError::BadMessage(what));
	}
	Ok(body.get_u8())
}

fn read_i16(body: &mut Bytes, what: &'static str) -> Result<i16, ProtocolError> {
	if body.remaining() < 2 {
		return Err(ProtocolError::BadMessage(what));
	}
	Ok(body.get_i16())
}

fn read_i32(body: &mut Bytes, what: &'static str) -> Result<i32, ProtocolError> {
	if body.remaining() < 4 {
		return Err(ProtocolError::BadMessage(what));
	}
	Ok(body.get_i32())
}

fn read_cstr(body: &mut Bytes) -> Result<String, ProtocolError> {
	let next_null = body
		.iter()
		.position(|&b| b == 0)
		.ok_or(ProtocolError::BadMessage("unterminated string"))?;
	let bytes = body.split_to(next_null);
	body.advance(1);
	Ok(String::from_utf8(bytes.to_vec())?)
}

fn read_format_codes(body: &mut Bytes, what: &'static str) -> Result<Vec<FormatCode>, ProtocolError> {
	let count = read_i16(body, what)?;
	let mut codes = Vec::with_capacity(count.max(0) as usize);
	for _ in 0..count {
		codes.push(FormatCode::try_from(read_i16(body, what)?)?);
	}
	Ok(codes)
}

/// Walks the `{length, bytes}` parameter block without interpreting values,
/// returning its total size. Lengths of -1 (NULL) contribute no value bytes.
fn parameter_area_size(body: &Bytes, value_count: i16, what: &'static str) -> Result<usize, ProtocolError> {
	let mut probe = body.clone();
	let mut size = 0usize;
	for _ in 0..value_count {
		let value_len = read_i32(&mut probe, what)?;
		size += size_of::<i32>();
		if value_len > 0 {
			if probe.remaining() < value_len as usize {
				return Err(ProtocolError::BadMessage(what));
			}
			probe.advance(value_len as usize);
			size += value_len as usize;
		}
	}
	Ok(size)
}

impl Decoder for ConnectionCodec {
	type Item = ClientMessage;
	type Error = ProtocolError;

	fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
		if !self.startup_received {
			if src.len() < STARTUP_HEADER_SIZE {
				return Ok(None);
			}

			let mut header_buf = src.clone();
			let message_len = header_buf.get_i32() as usize;
			let protocol_version_major = header_buf.get_i16();
			let protocol_version_minor = header_buf.get_i16();

			if protocol_version_major == 1234i16 && protocol_version_minor == 5679i16 {
				src.advance(STARTUP_HEADER_SIZE);
				return Ok(Some(ClientMessage::SSLRequest));
			}

			if message_len < STARTUP_HEADER_SIZE {
				return Err(ProtocolError::BadMessage("startup message length too small"));
			}

			if src.len() < message_len {
				src.reserve(message_len - src.len());
				return Ok(None);
			}

			src.advance(STARTUP_HEADER_SIZE);

			let mut parameters = HashMap::new();

			let mut param_str_start_pos = 0;
			let mut current_key = None;
			for (i, &byte) in src[..message_len - STARTUP_HEADER_SIZE].iter().enumerate() {
				if byte == 0 {
					let string_value = String::from_utf8(src[param_str_start_pos..i].to_owned())?;
					param_str_start_pos = i + 1;

					current_key = match current_key {
						Some(key) => {
							parameters.insert(key, string_value);
							None
						}
						None => Some(string_value),
					}
				}
			}

			src.advance(message_len - STARTUP_HEADER_SIZE);

			self.startup_received = true;
			return Ok(Some(ClientMessage::Startup(Startup {
				requested_protocol_version: (protocol_version_major, protocol_version_minor),
				parameters,
			})));
		}

		if src.len() < MESSAGE_HEADER_SIZE {
			src.reserve(MESSAGE_HEADER_SIZE);
			return Ok(None);
		}

		let mut header_buf = src.clone();
		let message_tag = header_buf.get_u8();
		let message_len = header_buf.get_i32() as usize;

		if message_len < size_of::<i32>() {
			return Err(ProtocolError::BadMessage("message length too small"));
		}

		// the length prefix counts itself but not the tag byte
		if src.len() < message_len + 1 {
			src.reserve(message_len + 1 - src.len());
			return Ok(None);
		}

		src.advance(MESSAGE_HEADER_SIZE);
		// detach the body so reads cannot stray into the next message
		let mut body: Bytes = src.split_to(message_len - size_of::<i32>()).freeze();

		let message = match message_tag {
			b'P' => {
				// String: prepared statement name (empty selects the unnamed statement)
				// String: the query text
				// Int16: number of pre-specified parameter data types
				// Int32[n]: parameter type OIDs, zero leaves a type unspecified
				let prepared_statement_name = read_cstr(&mut body)?;
				let query = read_cstr(&mut body)?;
				let num_params = read_i16(&mut body, "could not read parameter type count")?;

				let mut parameter_types = Vec::with_capacity(num_params.max(0) as usize);
				for _ in 0..num_params {
					let oid = read_i32(&mut body, "could not read parameter type oid")?;
					parameter_types.push(DataTypeOid::from(oid as u32));
				}

				ClientMessage::Parse(Parse {
					prepared_statement_name,
					query,
					parameter_types,
				})
			}
			b'D' => {
				// Byte1: 'S' to describe a prepared statement, 'P' a portal
				// String: the name to describe (empty selects the unnamed one)
				let target_type = read_u8(&mut body, "could not read describe target")?;
				let name = read_cstr(&mut body)?;

				ClientMessage::Describe(match target_type {
					b'P' => Describe::Portal(name),
					b'S' => Describe::PreparedStatement(name),
					_ => return Err(ProtocolError::BadMessage("invalid describe target")),
				})
			}
			b'S' => ClientMessage::Sync,
			b'B' => {
				// String: destination portal (empty selects the unnamed portal)
				// String: source prepared statement (empty selects the unnamed statement)
				// Int16 + Int16[C]: parameter format codes
				// Int16 + {Int32 len, bytes}[n]: parameter values; len -1 is NULL
				// Int16 + Int16[R]: result-column format codes
				let portal = read_cstr(&mut body)?;
				let prepared_statement_name = read_cstr(&mut body)?;

				let parameter_format_codes = read_format_codes(&mut body, "could not read parameter formats")?;

				let parameter_value_count = read_i16(&mut body, "could not read parameter value count")?;
				let area_size = parameter_area_size(&body, parameter_value_count, "malformed bind variable")?;
				let parameter_area = body.split_to(area_size);

				let result_format_codes = read_format_codes(&mut body, "could not read result formats")?;

				ClientMessage::Bind(Bind {
					portal,
					prepared_statement_name,
					parameter_format_codes,
					parameter_value_count,
					parameter_area,
					result_format_codes,
				})
			}
			b'E' => {
				// String: the portal to execute (empty selects the unnamed portal)
				// Int32: maximum number of rows to return; zero denotes no limit
				let portal = read_cstr(&mut body)?;

				let max_rows = if body.has_remaining() {
					Some(read_i32(&mut body, "could not read row limit")?)
				} else {
					None
				};
				ClientMessage::Execute(Execute { portal, max_rows })
			}
			b'Q' => {
				let query = read_cstr(&mut body)?;
				ClientMessage::Query(query)
			}
			b'X' => ClientMessage::Terminate,
			b'C' => {
				let target_type = read_u8(&mut body, "could not read close target")?;
				let name = read_cstr(&mut body)?;

				ClientMessage::Close(match target_type {
					b'P' => Close::Portal(name),
					b'S' => Close::PreparedStatement(name),
					_ => return Err(ProtocolError::BadMessage("invalid close target")),
				})
			}
			other => {
				tracing::warn!("unknown message type {:?}", other as char);
				return Err(ProtocolError::InvalidMessageType(other));
			}
		};

		Ok(Some(message))
	}
}

impl<T: BackendMessage> Encoder<T> for ConnectionCodec {
	type Error = ProtocolError;

	fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
		let mut body = BytesMut::new();
		item.encode(&mut body);

		dst.put_u8(T::TAG);
		dst.put_i32((body.len() + 4) as i32);
		dst.put_slice(&body);
		Ok(())
	}
}

pub struct SSLResponse(pub bool);

impl Encoder<SSLResponse> for ConnectionCodec {
	type Error = ProtocolError;

	fn encode(&mut self, item: SSLResponse, dst: &mut BytesMut) -> Result<(), Self::Error> {
		dst.put_u8(if item.0 { b'S' } else { b'N' });
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn put_cstr(dst: &mut BytesMut, s: &str) {
		dst.put_slice(s.as_bytes());
		dst.put_u8(0);
	}

	fn frame(tag: u8, body: &[u8]) -> BytesMut {
		let mut out = BytesMut::new();
		out.put_u8(tag);
		out.put_i32((body.len() + 4) as i32);
		out.put_slice(body);
		out
	}

	fn codec_past_startup() -> ConnectionCodec {
		ConnectionCodec {
			startup_received: true,
		}
	}

	#[test]
	fn decode_parse_keeps_parameter_types() {
		let mut body = BytesMut::new();
		put_cstr(&mut body, "s1");
		put_cstr(&mut body, "select $1");
		body.put_i16(2);
		body.put_i32(23);
		body.put_i32(0);

		let mut src = frame(b'P', &body);
		let msg = codec_past_startup().decode(&mut src).unwrap().unwrap();
		match msg {
			ClientMessage::Parse(parse) => {
				assert_eq!(parse.prepared_statement_name, "s1");
				assert_eq!(parse.query, "select $1");
				assert_eq!(parse.parameter_types, vec![DataTypeOid::Int4, DataTypeOid::Unspecified]);
			}
			other => panic!("expected parse, got {:?}", other),
		}
	}

	#[test]
	fn decode_bind_captures_raw_value_area() {
		let mut body = BytesMut::new();
		put_cstr(&mut body, "");
		put_cstr(&mut body, "s1");
		body.put_i16(1);
		body.put_i16(1); // all binary
		body.put_i16(2); // two values
		body.put_i32(4);
		body.put_i32(42);
		body.put_i32(-1); // NULL
		body.put_i16(0); // default result format

		let mut src = frame(b'B', &body);
		let msg = codec_past_startup().decode(&mut src).unwrap().unwrap();
		match msg {
			ClientMessage::Bind(bind) => {
				assert_eq!(bind.parameter_format_codes, vec![FormatCode::Binary]);
				assert_eq!(bind.parameter_value_count, 2);
				// 4-byte length + 4-byte value + 4-byte NULL length
				assert_eq!(bind.parameter_area.len(), 12);
				assert!(bind.result_format_codes.is_empty());
			}
			other => panic!("expected bind, got {:?}", other),
		}
	}

	#[test]
	fn decode_bind_rejects_lying_value_length() {
		let mut body = BytesMut::new();
		put_cstr(&mut body, "");
		put_cstr(&mut body, "");
		body.put_i16(0);
		body.put_i16(1);
		body.put_i32(1000); // claims more bytes than the message holds
		body.put_u8(1);

		let mut src = frame(b'B', &body);
		let result = codec_past_startup().decode(&mut src);
		assert!(matches!(result, Err(ProtocolError::BadMessage(_))));
	}

	#[test]
	fn decode_waits_for_full_message() {
		let mut body = BytesMut::new();
		put_cstr(&mut body, "");
		put_cstr(&mut body, "select 1");
		body.put_i16(0);

		let full = frame(b'P', &body);
		let mut partial = BytesMut::from(&full[..full.len() - 3]);

		let mut codec = codec_past_startup();
		assert!(codec.decode(&mut partial).unwrap().is_none());

		partial.put_slice(&full[full.len() - 3..]);
		assert!(codec.decode(&mut partial).unwrap().is_some());
	}

	#[test]
	fn error_response_encodes_routine_and_position() {
		let mut err = ErrorResponse::error(SqlState::FeatureNotSupported, "cached plan must not change result type");
		err.routine = Some("RevalidateCachedQuery");
		err.position = Some(1);

		let mut body = BytesMut::new();
		err.encode(&mut body);
		let text = String::from_utf8_lossy(&body).into_owned();
		assert!(text.contains("0A000"));
		assert!(text.contains("RevalidateCachedQuery"));
	}
}
