use std::ffi::CString;
use std::io::{Read, Write};

use derivative::Derivative;

use crate::archive::{Archive, Direction, IdentityMap};
use crate::errors::{ArchiveError, Result};
use crate::version::{transfer_header, Version, VersionMap};

const BUFFER_SIZE: usize = 1024;

/// Writing half of the binary encoding: fixed-width little-endian values
/// coalesced through a small buffer, strings and bulk blocks length-
/// prefixed and written straight to the stream.
///
/// The stream carries no framing beyond the reference sentinels; it is
/// only portable between hosts of matching integer width and byte order.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct BinaryWriter<W: Write> {
	#[derivative(Debug = "ignore")]
	stream: W,
	#[derivative(Debug = "ignore")]
	buffer: Box<[u8; BUFFER_SIZE]>,
	position: usize,
	#[derivative(Debug = "ignore")]
	identity: IdentityMap,
	versions: VersionMap,
}

impl<W: Write> BinaryWriter<W> {
	/// Opens a writing session and emits the library-version header.
	#[cfg_attr(feature = "tracing", tracing::instrument(skip_all))]
	pub fn new(stream: W) -> Result<Self> {
		let mut writer = Self {
			stream,
			buffer: Box::new([0; BUFFER_SIZE]),
			position: 0,
			identity: IdentityMap::default(),
			versions: VersionMap::new(),
		};
		writer.versions = transfer_header(&mut writer)?;
		Ok(writer)
	}

	fn flush_buffer(&mut self) -> Result<()> {
		if self.position > 0 {
			self.stream.write_all(&self.buffer[..self.position])?;
			self.position = 0;
		}
		Ok(())
	}

	fn put(&mut self, bytes: &[u8]) -> Result<()> {
		if self.position + bytes.len() > BUFFER_SIZE {
			self.flush_buffer()?;
		}
		self.buffer[self.position..self.position + bytes.len()].copy_from_slice(bytes);
		self.position += bytes.len();
		Ok(())
	}

	/// Length-prefixed payloads bypass the buffer; flush first so the
	/// stream order stays unambiguous.
	fn put_payload(&mut self, bytes: &[u8]) -> Result<()> {
		self.flush_buffer()?;
		Ok(self.stream.write_all(bytes)?)
	}
}

impl<W: Write> Archive for BinaryWriter<W> {
	fn direction(&self) -> Direction {
		Direction::Writing
	}

	fn xfer_f64(&mut self, value: &mut f64) -> Result<()> {
		self.put(&value.to_le_bytes())
	}

	fn xfer_i16(&mut self, value: &mut i16) -> Result<()> {
		self.put(&value.to_le_bytes())
	}

	fn xfer_i32(&mut self, value: &mut i32) -> Result<()> {
		self.put(&value.to_le_bytes())
	}

	fn xfer_i64(&mut self, value: &mut i64) -> Result<()> {
		self.put(&value.to_le_bytes())
	}

	fn xfer_u8(&mut self, value: &mut u8) -> Result<()> {
		self.put(&[*value])
	}

	fn xfer_usize(&mut self, value: &mut usize) -> Result<()> {
		self.put(&value.to_le_bytes())
	}

	fn xfer_bool(&mut self, value: &mut bool) -> Result<()> {
		self.put(&[*value as u8])
	}

	fn xfer_string(&mut self, value: &mut String) -> Result<()> {
		let mut len = value.len() as i32;
		self.xfer_i32(&mut len)?;
		self.put_payload(value.as_bytes())
	}

	fn xfer_c_string(&mut self, value: &mut Option<CString>) -> Result<()> {
		match value {
			None => {
				let mut len = -1i64;
				self.xfer_i64(&mut len)
			},
			Some(text) => {
				let bytes = text.as_bytes().to_vec();
				let mut len = bytes.len() as i64;
				self.xfer_i64(&mut len)?;
				self.put_payload(&bytes)
			},
		}
	}

	fn xfer_f64_slice(&mut self, values: &mut [f64]) -> Result<()> {
		let bytes = unsafe {
			std::slice::from_raw_parts(values.as_ptr() as *const u8, std::mem::size_of_val(values))
		};
		self.put_payload(bytes)
	}

	fn xfer_i32_slice(&mut self, values: &mut [i32]) -> Result<()> {
		let bytes = unsafe {
			std::slice::from_raw_parts(values.as_ptr() as *const u8, std::mem::size_of_val(values))
		};
		self.put_payload(bytes)
	}

	fn xfer_u8_slice(&mut self, values: &mut [u8]) -> Result<()> {
		self.put_payload(values)
	}

	fn flush(&mut self) -> Result<()> {
		self.flush_buffer()?;
		Ok(self.stream.flush()?)
	}

	fn version_of(&self, library: &str) -> Option<Version> {
		self.versions.get(library).copied()
	}

	fn identity(&mut self) -> &mut IdentityMap {
		&mut self.identity
	}
}

impl<W: Write> Drop for BinaryWriter<W> {
	fn drop(&mut self) {
		let _ = self.flush_buffer();
		let _ = self.stream.flush();
	}
}

/// Reading half of the binary encoding.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct BinaryReader<R: Read> {
	#[derivative(Debug = "ignore")]
	stream: R,
	#[derivative(Debug = "ignore")]
	identity: IdentityMap,
	versions: VersionMap,
}

impl<R: Read> BinaryReader<R> {
	/// Opens a reading session and consumes the library-version header.
	#[cfg_attr(feature = "tracing", tracing::instrument(skip_all))]
	pub fn new(stream: R) -> Result<Self> {
		let mut reader = Self {
			stream,
			identity: IdentityMap::default(),
			versions: VersionMap::new(),
		};
		reader.versions = transfer_header(&mut reader)?;
		Ok(reader)
	}

	fn take<const N: usize>(&mut self) -> Result<[u8; N]> {
		let mut bytes = [0u8; N];
		self.stream.read_exact(&mut bytes)?;
		Ok(bytes)
	}

	fn take_payload(&mut self, len: usize) -> Result<Vec<u8>> {
		let mut bytes = vec![0u8; len];
		self.stream.read_exact(&mut bytes)?;
		Ok(bytes)
	}
}

impl<R: Read> Archive for BinaryReader<R> {
	fn direction(&self) -> Direction {
		Direction::Reading
	}

	fn xfer_f64(&mut self, value: &mut f64) -> Result<()> {
		*value = f64::from_le_bytes(self.take()?);
		Ok(())
	}

	fn xfer_i16(&mut self, value: &mut i16) -> Result<()> {
		*value = i16::from_le_bytes(self.take()?);
		Ok(())
	}

	fn xfer_i32(&mut self, value: &mut i32) -> Result<()> {
		*value = i32::from_le_bytes(self.take()?);
		Ok(())
	}

	fn xfer_i64(&mut self, value: &mut i64) -> Result<()> {
		*value = i64::from_le_bytes(self.take()?);
		Ok(())
	}

	fn xfer_u8(&mut self, value: &mut u8) -> Result<()> {
		*value = self.take::<1>()?[0];
		Ok(())
	}

	fn xfer_usize(&mut self, value: &mut usize) -> Result<()> {
		*value = usize::from_le_bytes(self.take()?);
		Ok(())
	}

	fn xfer_bool(&mut self, value: &mut bool) -> Result<()> {
		*value = self.take::<1>()?[0] != 0;
		Ok(())
	}

	fn xfer_string(&mut self, value: &mut String) -> Result<()> {
		let mut len = 0i32;
		self.xfer_i32(&mut len)?;
		if len < 0 {
			return Err(ArchiveError::FormatMismatch(format!("negative string length {len}")));
		}
		let bytes = self.take_payload(len as usize)?;
		*value = String::from_utf8(bytes)
			.map_err(|_| ArchiveError::FormatMismatch("non-utf8 string".to_string()))?;
		Ok(())
	}

	fn xfer_c_string(&mut self, value: &mut Option<CString>) -> Result<()> {
		let mut len = 0i64;
		self.xfer_i64(&mut len)?;
		*value = match len {
			-1 => None,
			len if len >= 0 => {
				let bytes = self.take_payload(len as usize)?;
				Some(CString::new(bytes).map_err(|_| {
					ArchiveError::FormatMismatch("interior nul in c string".to_string())
				})?)
			},
			len => {
				return Err(ArchiveError::FormatMismatch(format!(
					"negative c string length {len}"
				)))
			},
		};
		Ok(())
	}

	fn xfer_f64_slice(&mut self, values: &mut [f64]) -> Result<()> {
		let bytes = unsafe {
			std::slice::from_raw_parts_mut(
				values.as_mut_ptr() as *mut u8,
				std::mem::size_of_val(values),
			)
		};
		Ok(self.stream.read_exact(bytes)?)
	}

	fn xfer_i32_slice(&mut self, values: &mut [i32]) -> Result<()> {
		let bytes = unsafe {
			std::slice::from_raw_parts_mut(
				values.as_mut_ptr() as *mut u8,
				std::mem::size_of_val(values),
			)
		};
		Ok(self.stream.read_exact(bytes)?)
	}

	fn xfer_u8_slice(&mut self, values: &mut [u8]) -> Result<()> {
		Ok(self.stream.read_exact(values)?)
	}

	fn version_of(&self, library: &str) -> Option<Version> {
		self.versions.get(library).copied()
	}

	fn identity(&mut self) -> &mut IdentityMap {
		&mut self.identity
	}
}

#[test]
fn values_straddle_the_buffer_boundary() {
	let mut buffer = Vec::new();
	{
		let mut writer = BinaryWriter::new(&mut buffer).unwrap();
		// 129 * 8 bytes crosses the 1024-byte coalescing buffer
		for i in 0..129 {
			let mut value = i as f64;
			writer.xfer_f64(&mut value).unwrap();
		}
		writer.flush().unwrap();
	}

	let mut reader = BinaryReader::new(buffer.as_slice()).unwrap();
	for i in 0..129 {
		let mut value = 0f64;
		reader.xfer_f64(&mut value).unwrap();
		assert_eq!(value, i as f64);
	}
}

#[test]
fn drop_flushes_pending_bytes() {
	let mut buffer = Vec::new();
	{
		let mut writer = BinaryWriter::new(&mut buffer).unwrap();
		let mut value = 42i32;
		writer.xfer_i32(&mut value).unwrap();
	}
	// header (empty version map: one usize) + the i32
	assert_eq!(buffer.len(), std::mem::size_of::<usize>() + 4);
}

#[test]
fn short_streams_surface_stream_failures() {
	let mut buffer = Vec::new();
	{
		let mut writer = BinaryWriter::new(&mut buffer).unwrap();
		let mut value = 1.5f64;
		writer.xfer_f64(&mut value).unwrap();
		writer.flush().unwrap();
	}
	buffer.truncate(buffer.len() - 4);

	let mut reader = BinaryReader::new(buffer.as_slice()).unwrap();
	let mut value = 0f64;
	let error = reader.xfer_f64(&mut value).unwrap_err();
	assert!(matches!(
		error,
		ArchiveError::IoError(ref e) if e.kind() == std::io::ErrorKind::UnexpectedEof
	));
}
