use std::ffi::CString;
use std::io::{Read, Write};
use std::str::FromStr;

use derivative::Derivative;

use crate::archive::{Archive, Direction, IdentityMap};
use crate::errors::{ArchiveError, Result};
use crate::version::{transfer_header, Version, VersionMap};

/// Writing half of the line-oriented text encoding: one token per line,
/// booleans as `t`/`f`, strings as a length line followed by the raw
/// bytes and a newline.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct TextWriter<W: Write> {
	#[derivative(Debug = "ignore")]
	stream: W,
	#[derivative(Debug = "ignore")]
	identity: IdentityMap,
	versions: VersionMap,
}

impl<W: Write> TextWriter<W> {
	/// Opens a writing session and emits the library-version header.
	#[cfg_attr(feature = "tracing", tracing::instrument(skip_all))]
	pub fn new(stream: W) -> Result<Self> {
		let mut writer = Self {
			stream,
			identity: IdentityMap::default(),
			versions: VersionMap::new(),
		};
		writer.versions = transfer_header(&mut writer)?;
		Ok(writer)
	}

	fn put_line(&mut self, token: impl std::fmt::Display) -> Result<()> {
		Ok(write!(self.stream, "{token}\n")?)
	}
}

impl<W: Write> Archive for TextWriter<W> {
	fn direction(&self) -> Direction {
		Direction::Writing
	}

	fn xfer_f64(&mut self, value: &mut f64) -> Result<()> {
		self.put_line(*value)
	}

	fn xfer_i16(&mut self, value: &mut i16) -> Result<()> {
		self.put_line(*value)
	}

	fn xfer_i32(&mut self, value: &mut i32) -> Result<()> {
		self.put_line(*value)
	}

	fn xfer_i64(&mut self, value: &mut i64) -> Result<()> {
		self.put_line(*value)
	}

	fn xfer_u8(&mut self, value: &mut u8) -> Result<()> {
		self.put_line(*value)
	}

	fn xfer_usize(&mut self, value: &mut usize) -> Result<()> {
		self.put_line(*value)
	}

	fn xfer_bool(&mut self, value: &mut bool) -> Result<()> {
		self.put_line(if *value { 't' } else { 'f' })
	}

	fn xfer_string(&mut self, value: &mut String) -> Result<()> {
		self.put_line(value.len())?;
		self.stream.write_all(value.as_bytes())?;
		Ok(self.stream.write_all(b"\n")?)
	}

	fn xfer_c_string(&mut self, value: &mut Option<CString>) -> Result<()> {
		match value {
			None => self.put_line(-1),
			Some(text) => {
				self.put_line(text.as_bytes().len())?;
				self.stream.write_all(text.as_bytes())?;
				Ok(self.stream.write_all(b"\n")?)
			},
		}
	}

	fn flush(&mut self) -> Result<()> {
		Ok(self.stream.flush()?)
	}

	fn version_of(&self, library: &str) -> Option<Version> {
		self.versions.get(library).copied()
	}

	fn identity(&mut self) -> &mut IdentityMap {
		&mut self.identity
	}
}

/// Reading half of the text encoding: a whitespace-separated token
/// scanner. String payloads are consumed by exact byte count after their
/// length token's separator.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct TextReader<R: Read> {
	#[derivative(Debug = "ignore")]
	stream: R,
	#[derivative(Debug = "ignore")]
	identity: IdentityMap,
	versions: VersionMap,
}

impl<R: Read> TextReader<R> {
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

	fn next_byte(&mut self) -> Result<Option<u8>> {
		let mut byte = [0u8; 1];
		match self.stream.read_exact(&mut byte) {
			Ok(()) => Ok(Some(byte[0])),
			Err(error) if error.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
			Err(error) => Err(error.into()),
		}
	}

	/// Skips leading whitespace, then collects bytes up to and including
	/// one trailing separator.
	fn next_token(&mut self) -> Result<String> {
		let mut token = Vec::new();
		loop {
			match self.next_byte()? {
				None => break,
				Some(byte) if byte.is_ascii_whitespace() => {
					if token.is_empty() {
						continue;
					}
					break;
				},
				Some(byte) => token.push(byte),
			}
		}
		if token.is_empty() {
			return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
		}
		String::from_utf8(token)
			.map_err(|_| ArchiveError::FormatMismatch("non-utf8 token".to_string()))
	}

	fn parse<T: FromStr>(&mut self) -> Result<T> {
		let token = self.next_token()?;
		token
			.parse()
			.map_err(|_| ArchiveError::FormatMismatch(format!("unexpected token `{token}`")))
	}

	fn take_payload(&mut self, len: usize) -> Result<Vec<u8>> {
		let mut bytes = vec![0u8; len];
		self.stream.read_exact(&mut bytes)?;
		Ok(bytes)
	}
}

impl<R: Read> Archive for TextReader<R> {
	fn direction(&self) -> Direction {
		Direction::Reading
	}

	fn xfer_f64(&mut self, value: &mut f64) -> Result<()> {
		*value = self.parse()?;
		Ok(())
	}

	fn xfer_i16(&mut self, value: &mut i16) -> Result<()> {
		*value = self.parse()?;
		Ok(())
	}

	fn xfer_i32(&mut self, value: &mut i32) -> Result<()> {
		*value = self.parse()?;
		Ok(())
	}

	fn xfer_i64(&mut self, value: &mut i64) -> Result<()> {
		*value = self.parse()?;
		Ok(())
	}

	fn xfer_u8(&mut self, value: &mut u8) -> Result<()> {
		*value = self.parse()?;
		Ok(())
	}

	fn xfer_usize(&mut self, value: &mut usize) -> Result<()> {
		*value = self.parse()?;
		Ok(())
	}

	fn xfer_bool(&mut self, value: &mut bool) -> Result<()> {
		let token = self.next_token()?;
		*value = match token.as_str() {
			"t" => true,
			"f" => false,
			_ => {
				return Err(ArchiveError::FormatMismatch(format!(
					"unexpected boolean token `{token}`"
				)))
			},
		};
		Ok(())
	}

	fn xfer_string(&mut self, value: &mut String) -> Result<()> {
		let len: usize = self.parse()?;
		let bytes = self.take_payload(len)?;
		*value = String::from_utf8(bytes)
			.map_err(|_| ArchiveError::FormatMismatch("non-utf8 string".to_string()))?;
		Ok(())
	}

	fn xfer_c_string(&mut self, value: &mut Option<CString>) -> Result<()> {
		let len: i64 = self.parse()?;
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

	fn version_of(&self, library: &str) -> Option<Version> {
		self.versions.get(library).copied()
	}

	fn identity(&mut self) -> &mut IdentityMap {
		&mut self.identity
	}
}

#[test]
fn tokens_are_newline_separated() {
	let mut buffer = Vec::new();
	{
		let mut writer = TextWriter::new(&mut buffer).unwrap();
		let mut int = -7i32;
		let mut flag = true;
		let mut byte = 200u8;
		let mut text = "two words".to_string();
		writer.xfer_i32(&mut int).unwrap();
		writer.xfer_bool(&mut flag).unwrap();
		writer.xfer_u8(&mut byte).unwrap();
		writer.xfer_string(&mut text).unwrap();
	}
	// header (empty version map) then the four values
	assert_eq!(std::str::from_utf8(&buffer).unwrap(), "0\n-7\nt\n200\n9\ntwo words\n");

	let mut reader = TextReader::new(buffer.as_slice()).unwrap();
	let mut int = 0i32;
	let mut flag = false;
	let mut byte = 0u8;
	let mut text = String::new();
	reader.xfer_i32(&mut int).unwrap();
	reader.xfer_bool(&mut flag).unwrap();
	reader.xfer_u8(&mut byte).unwrap();
	reader.xfer_string(&mut text).unwrap();
	assert_eq!((int, flag, byte, text.as_str()), (-7, true, 200, "two words"));
}

#[test]
fn string_payloads_keep_embedded_separators() {
	let mut buffer = Vec::new();
	{
		let mut writer = TextWriter::new(&mut buffer).unwrap();
		let mut text = "line one\nline two".to_string();
		writer.xfer_string(&mut text).unwrap();
	}

	let mut reader = TextReader::new(buffer.as_slice()).unwrap();
	let mut text = String::new();
	reader.xfer_string(&mut text).unwrap();
	assert_eq!(text, "line one\nline two");
}

#[test]
fn malformed_tokens_are_format_mismatches() {
	let mut reader = TextReader::new("0\nnot-a-number\n".as_bytes()).unwrap();
	let mut value = 0i32;
	assert!(matches!(
		reader.xfer_i32(&mut value),
		Err(ArchiveError::FormatMismatch(_))
	));

	let mut reader = TextReader::new("0\nx\n".as_bytes()).unwrap();
	let mut flag = false;
	assert!(matches!(
		reader.xfer_bool(&mut flag),
		Err(ArchiveError::FormatMismatch(_))
	));
}
