use std::any::{Any, TypeId};
use std::collections::{BTreeMap, HashMap};
use std::ffi::CString;
use std::hash::{BuildHasher, Hash};
use std::rc::Rc;

use fxhash::FxHashMap;
use paste::paste;

use crate::errors::{ArchiveError, Result};
use crate::version::Version;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Direction {
	Writing,
	Reading,
}

/// A bidirectional codec session bound to one byte stream.
///
/// Every `xfer_*` operation is symmetric: a writing archive emits the
/// current value, a reading archive overwrites it with the decoded one.
/// The direction is fixed for the archive's whole lifetime.
pub trait Archive {
	fn direction(&self) -> Direction;

	fn is_output(&self) -> bool {
		self.direction() == Direction::Writing
	}

	fn is_input(&self) -> bool {
		self.direction() == Direction::Reading
	}

	fn xfer_f64(&mut self, value: &mut f64) -> Result<()>;
	fn xfer_i16(&mut self, value: &mut i16) -> Result<()>;
	fn xfer_i32(&mut self, value: &mut i32) -> Result<()>;
	fn xfer_i64(&mut self, value: &mut i64) -> Result<()>;
	fn xfer_u8(&mut self, value: &mut u8) -> Result<()>;
	fn xfer_usize(&mut self, value: &mut usize) -> Result<()>;
	fn xfer_bool(&mut self, value: &mut bool) -> Result<()>;
	fn xfer_string(&mut self, value: &mut String) -> Result<()>;
	/// Optional owned C string; `None` round-trips as a null marker.
	fn xfer_c_string(&mut self, value: &mut Option<CString>) -> Result<()>;

	/// Bulk transfer of a contiguous block. Encoders may override this
	/// with a single copy; the result must match element-wise transfer.
	fn xfer_f64_slice(&mut self, values: &mut [f64]) -> Result<()> {
		for value in values {
			self.xfer_f64(value)?;
		}
		Ok(())
	}

	fn xfer_i32_slice(&mut self, values: &mut [i32]) -> Result<()> {
		for value in values {
			self.xfer_i32(value)?;
		}
		Ok(())
	}

	fn xfer_u8_slice(&mut self, values: &mut [u8]) -> Result<()> {
		for value in values {
			self.xfer_u8(value)?;
		}
		Ok(())
	}

	/// Forces buffered output down to the underlying stream.
	fn flush(&mut self) -> Result<()> {
		Ok(())
	}

	/// The version of `library` recorded in this stream's header.
	/// On the write side this reflects the process table at construction.
	fn version_of(&self, library: &str) -> Option<Version>;

	#[doc(hidden)]
	fn identity(&mut self) -> &mut IdentityMap;
}

/// Object-safe access to the concrete value behind a base trait object.
pub trait AsAny: Any {
	fn as_any(&self) -> &dyn Any;
	fn as_any_mut(&mut self) -> &mut dyn Any;
	fn dyn_type_name(&self) -> &'static str;
}

impl<T: Any> AsAny for T {
	fn as_any(&self) -> &dyn Any {
		self
	}

	fn as_any_mut(&mut self) -> &mut dyn Any {
		self
	}

	fn dyn_type_name(&self) -> &'static str {
		std::any::type_name::<T>()
	}
}

/// Supertrait for every base trait whose implementors are archived
/// through trait objects: `trait Shape: Polymorphic { .. }`.
pub trait Polymorphic: Transfer + AsAny {}

impl<T: Transfer + AsAny + ?Sized> Polymorphic for T {}

/// The single hook a type implements to take part in archiving.
///
/// Writing and reading share one body; the archive's direction decides
/// which way values flow. Aggregates forward field by field (or derive
/// the impl); containers and reference handles are provided here.
pub trait Transfer {
	fn transfer(&mut self, archive: &mut dyn Archive) -> Result<()>;
}

macro_rules! impl_transfer_primitive {
	($($ty:ident),*) => {$(
		paste! {
			impl Transfer for $ty {
				#[inline]
				fn transfer(&mut self, archive: &mut dyn Archive) -> Result<()> {
					archive.[<xfer_ $ty>](self)
				}
			}
		}
	)*};
}

impl_transfer_primitive!(f64, i16, i32, i64, u8, usize, bool);

impl Transfer for String {
	#[inline]
	fn transfer(&mut self, archive: &mut dyn Archive) -> Result<()> {
		archive.xfer_string(self)
	}
}

impl Transfer for Option<CString> {
	#[inline]
	fn transfer(&mut self, archive: &mut dyn Archive) -> Result<()> {
		archive.xfer_c_string(self)
	}
}

impl<T: Transfer + Default> Transfer for Vec<T> {
	fn transfer(&mut self, archive: &mut dyn Archive) -> Result<()> {
		let mut len = self.len();
		archive.xfer_usize(&mut len)?;
		match archive.direction() {
			Direction::Writing => {
				for value in self.iter_mut() {
					value.transfer(archive)?;
				}
			},
			Direction::Reading => {
				self.clear();
				self.reserve(len.min(1 << 16));
				for _ in 0..len {
					let mut value = T::default();
					value.transfer(archive)?;
					self.push(value);
				}
			},
		}
		Ok(())
	}
}

impl<K, V> Transfer for BTreeMap<K, V>
where
	K: Transfer + Default + Clone + Ord,
	V: Transfer + Default,
{
	fn transfer(&mut self, archive: &mut dyn Archive) -> Result<()> {
		let mut len = self.len();
		archive.xfer_usize(&mut len)?;
		match archive.direction() {
			Direction::Writing => {
				for (key, value) in self.iter_mut() {
					let mut key = key.clone();
					key.transfer(archive)?;
					value.transfer(archive)?;
				}
			},
			Direction::Reading => {
				self.clear();
				for _ in 0..len {
					let mut key = K::default();
					let mut value = V::default();
					key.transfer(archive)?;
					value.transfer(archive)?;
					self.insert(key, value);
				}
			},
		}
		Ok(())
	}
}

impl<K, V, S> Transfer for HashMap<K, V, S>
where
	K: Transfer + Default + Clone + Eq + Hash,
	V: Transfer + Default,
	S: BuildHasher + Default,
{
	fn transfer(&mut self, archive: &mut dyn Archive) -> Result<()> {
		let mut len = self.len();
		archive.xfer_usize(&mut len)?;
		match archive.direction() {
			Direction::Writing => {
				for (key, value) in self.iter_mut() {
					let mut key = key.clone();
					key.transfer(archive)?;
					value.transfer(archive)?;
				}
			},
			Direction::Reading => {
				self.clear();
				for _ in 0..len {
					let mut key = K::default();
					let mut value = V::default();
					key.transfer(archive)?;
					value.transfer(archive)?;
					self.insert(key, value);
				}
			},
		}
		Ok(())
	}
}

impl<T: Transfer> Transfer for num_complex::Complex<T> {
	fn transfer(&mut self, archive: &mut dyn Archive) -> Result<()> {
		self.re.transfer(archive)?;
		self.im.transfer(archive)
	}
}

/// A handle reconstructed on the read side, stored under its stream id.
/// The erased `Rc` always owns a `RefCell` of the concrete type.
pub(crate) struct SharedEntry {
	pub handle: Rc<dyn Any>,
	pub type_id: TypeId,
}

#[derive(Copy, Clone)]
pub(crate) struct RawEntry {
	pub address: *mut (),
	pub type_id: TypeId,
}

/// Per-session bookkeeping that keeps object identity stable across the
/// stream: addresses map to dense ids on the write side, ids map back to
/// live handles on the read side. The shared and raw tiers are numbered
/// independently.
#[derive(Default)]
pub struct IdentityMap {
	shared_ids: FxHashMap<usize, i64>,
	raw_ids: FxHashMap<usize, i64>,
	shared_count: i64,
	raw_count: i64,
	shared_handles: Vec<SharedEntry>,
	raw_addresses: Vec<RawEntry>,
}

impl IdentityMap {
	pub(crate) fn shared_id(&self, address: usize) -> Option<i64> {
		self.shared_ids.get(&address).copied()
	}

	pub(crate) fn raw_id(&self, address: usize) -> Option<i64> {
		self.raw_ids.get(&address).copied()
	}

	pub(crate) fn assign_shared_id(&mut self, address: usize) -> i64 {
		let id = self.shared_count;
		self.shared_count += 1;
		self.shared_ids.insert(address, id);
		id
	}

	pub(crate) fn assign_raw_id(&mut self, address: usize) -> i64 {
		let id = self.raw_count;
		self.raw_count += 1;
		self.raw_ids.insert(address, id);
		id
	}

	pub(crate) fn record_shared(&mut self, entry: SharedEntry) -> i64 {
		self.shared_handles.push(entry);
		self.shared_handles.len() as i64 - 1
	}

	pub(crate) fn record_raw(&mut self, entry: RawEntry) -> i64 {
		self.raw_addresses.push(entry);
		self.raw_addresses.len() as i64 - 1
	}

	pub(crate) fn shared_entry(&self, id: i64) -> Result<&SharedEntry> {
		usize::try_from(id)
			.ok()
			.and_then(|index| self.shared_handles.get(index))
			.ok_or_else(|| ArchiveError::FormatMismatch(format!("unknown shared reference {id}")))
	}

	pub(crate) fn raw_entry(&self, id: i64) -> Result<RawEntry> {
		usize::try_from(id)
			.ok()
			.and_then(|index| self.raw_addresses.get(index).copied())
			.ok_or_else(|| ArchiveError::FormatMismatch(format!("unknown reference {id}")))
	}
}
