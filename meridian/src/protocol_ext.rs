//! Extends the basic protocol types with a bounded, resumable response buffer.

#![allow(missing_docs)]

use crate::protocol::MESSAGE_TYPE_DATA_ROW;

/// Raised when a write does not fit the remaining buffer space. The caller is
/// expected to flush the bookmarked prefix and re-enter the emission that
/// failed; everything written after the last bookmark is discarded by the
/// flush and will be regenerated.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("no space left in response buffer")]
pub struct OutOfSpace;

/// Handle for a length-prefixed message in flight: four bytes are reserved at
/// creation and back-patched by [OutputBuffer::finish_message].
#[must_use]
pub struct MessageFrame(usize);

/// A bounded response buffer.
///
/// All multi-byte integers are written big-endian. The bookmark marks the end
/// of the last fully-emitted message: flushing sends `[0, bookmark)` and
/// discards the tail, so a partially-written message is never observed on the
/// wire. Emitters bookmark after each complete message (and after each data
/// row) and re-enter at unchanged state after a flush.
pub struct OutputBuffer {
	data: Vec<u8>,
	limit: usize,
	bookmark: usize,
	max_blob_size: usize,
}

impl OutputBuffer {
	pub fn new(limit: usize, max_blob_size: usize) -> Self {
		Self {
			data: Vec::with_capacity(limit.min(16 * 1024)),
			limit,
			bookmark: 0,
			max_blob_size,
		}
	}

	/// Largest binary column value this buffer will accept; exceeding it
	/// aborts the result set rather than the connection.
	pub fn max_blob_size(&self) -> usize {
		self.max_blob_size
	}

	pub fn len(&self) -> usize {
		self.data.len()
	}

	pub fn is_empty(&self) -> bool {
		self.data.is_empty()
	}

	fn ensure(&mut self, extra: usize) -> Result<(), OutOfSpace> {
		if self.data.len() + extra > self.limit {
			return Err(OutOfSpace);
		}
		Ok(())
	}

	pub fn put_u8(&mut self, value: u8) -> Result<(), OutOfSpace> {
		self.ensure(1)?;
		self.data.push(value);
		Ok(())
	}

	pub fn put_i16(&mut self, value: i16) -> Result<(), OutOfSpace> {
		self.put_slice(&value.to_be_bytes())
	}

	pub fn put_i32(&mut self, value: i32) -> Result<(), OutOfSpace> {
		self.put_slice(&value.to_be_bytes())
	}

	pub fn put_u32(&mut self, value: u32) -> Result<(), OutOfSpace> {
		self.put_slice(&value.to_be_bytes())
	}

	pub fn put_i64(&mut self, value: i64) -> Result<(), OutOfSpace> {
		self.put_slice(&value.to_be_bytes())
	}

	pub fn put_slice(&mut self, bytes: &[u8]) -> Result<(), OutOfSpace> {
		self.ensure(bytes.len())?;
		self.data.extend_from_slice(bytes);
		Ok(())
	}

	pub fn put_cstr(&mut self, value: &str) -> Result<(), OutOfSpace> {
		self.ensure(value.len() + 1)?;
		self.data.extend_from_slice(value.as_bytes());
		self.data.push(0);
		Ok(())
	}

	/// Writes a length-prefixed value: a four-byte length followed by the bytes.
	pub fn put_sized(&mut self, bytes: &[u8]) -> Result<(), OutOfSpace> {
		self.ensure(4 + bytes.len())?;
		self.data.extend_from_slice(&(bytes.len() as i32).to_be_bytes());
		self.data.extend_from_slice(bytes);
		Ok(())
	}

	/// Writes the NULL value marker: a length of -1 with no bytes following.
	pub fn put_null_value(&mut self) -> Result<(), OutOfSpace> {
		self.put_i32(-1)
	}

	/// Starts a length-prefixed message: writes the tag, reserves four bytes
	/// for the length and returns the handle used to back-patch it.
	pub fn begin_message(&mut self, tag: u8) -> Result<MessageFrame, OutOfSpace> {
		self.ensure(5)?;
		self.data.push(tag);
		let offset = self.data.len();
		self.data.extend_from_slice(&[0; 4]);
		Ok(MessageFrame(offset))
	}

	/// Back-patches the reserved length of a message started with
	/// [Self::begin_message]. The length includes itself but not the tag byte.
	pub fn finish_message(&mut self, frame: MessageFrame) {
		let len = (self.data.len() - frame.0) as i32;
		self.data[frame.0..frame.0 + 4].copy_from_slice(&len.to_be_bytes());
	}

	/// Shorthand for the body-less messages (PARSE_COMPLETE and friends).
	pub fn put_simple_message(&mut self, tag: u8) -> Result<(), OutOfSpace> {
		self.bookmark();
		let frame = self.begin_message(tag)?;
		self.finish_message(frame);
		self.bookmark();
		Ok(())
	}

	/// Starts a DATA_ROW message with the given column count.
	pub fn begin_row(&mut self, column_count: usize) -> Result<MessageFrame, OutOfSpace> {
		let frame = self.begin_message(MESSAGE_TYPE_DATA_ROW)?;
		self.put_i16(column_count as i16)?;
		Ok(frame)
	}

	pub fn bookmark(&mut self) {
		self.bookmark = self.data.len();
	}

	/// Discards everything written since the last bookmark. Used when a row
	/// or message must be withdrawn (pause, error) before anything is sent.
	pub fn reset_to_bookmark(&mut self) {
		self.data.truncate(self.bookmark);
	}

	/// Number of bytes that are safe to flush.
	pub fn flush_len(&self) -> usize {
		self.bookmark
	}

	/// The flushable prefix: complete messages only.
	pub fn flushable(&self) -> &[u8] {
		&self.data[..self.bookmark]
	}

	/// Drops the flushed prefix and the incomplete tail. The tail belongs to
	/// an emission that will be re-entered from scratch, so nothing is kept.
	pub fn consume_flushed(&mut self) {
		self.data.clear();
		self.bookmark = 0;
	}

	/// Everything written so far. Only safe to send once emission has
	/// completed; mid-emission, use [Self::flushable].
	pub fn written(&self) -> &[u8] {
		&self.data
	}

	pub fn clear(&mut self) {
		self.data.clear();
		self.bookmark = 0;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn back_patches_message_length() {
		let mut out = OutputBuffer::new(64, 64);
		let frame = out.begin_message(b'C').unwrap();
		out.put_cstr("SELECT 1").unwrap();
		out.finish_message(frame);

		assert_eq!(out.data[0], b'C');
		// length = 4 (self) + 8 (text) + 1 (nul)
		assert_eq!(&out.data[1..5], &13i32.to_be_bytes());
	}

	#[test]
	fn overflow_leaves_tail_for_reset() {
		let mut out = OutputBuffer::new(8, 64);
		out.put_simple_message(b'1').unwrap();
		assert_eq!(out.flush_len(), 5);

		// the next message cannot fit
		assert_eq!(out.begin_message(b'T').err(), Some(OutOfSpace));

		// flushing keeps only complete messages
		assert_eq!(out.flushable().len(), 5);
		out.consume_flushed();
		assert!(out.is_empty());
		assert_eq!(out.flush_len(), 0);
	}

	#[test]
	fn reset_discards_partial_row() {
		let mut out = OutputBuffer::new(64, 64);
		out.put_simple_message(b'2').unwrap();
		let before = out.len();

		let frame = out.begin_row(1).unwrap();
		out.put_sized(b"42").unwrap();
		out.reset_to_bookmark();
		drop(frame);

		assert_eq!(out.len(), before);
		assert_eq!(out.flush_len(), before);
	}

	#[test]
	fn sized_and_null_values() {
		let mut out = OutputBuffer::new(64, 64);
		out.put_sized(b"abc").unwrap();
		out.put_null_value().unwrap();

		assert_eq!(&out.data[..4], &3i32.to_be_bytes());
		assert_eq!(&out.data[4..7], b"abc");
		assert_eq!(&out.data[7..], &(-1i32).to_be_bytes());
	}

	#[test]
	fn respects_hard_limit() {
		let mut out = OutputBuffer::new(4, 64);
		out.put_i32(7).unwrap();
		assert_eq!(out.put_u8(0).err(), Some(OutOfSpace));
	}
}
