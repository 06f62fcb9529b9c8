use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::ptr::NonNull;
use std::rc::Rc;

use crate::archive::{Archive, Direction, Polymorphic, RawEntry, SharedEntry, Transfer};
use crate::errors::{ArchiveError, Result};
use crate::registry;

/// First occurrence of an object; the body follows inline.
pub(crate) const NEW_INLINE: i64 = -1;
/// A null reference.
pub(crate) const NULL_REF: i64 = -2;
/// First occurrence of a polymorphic object; the dynamic type name and
/// the body follow.
pub(crate) const NEW_POLYMORPHIC: i64 = -3;

fn write_id(archive: &mut dyn Archive, id: i64) -> Result<()> {
	let mut id = id;
	archive.xfer_i64(&mut id)
}

fn read_id(archive: &mut dyn Archive) -> Result<i64> {
	let mut id = 0i64;
	archive.xfer_i64(&mut id)?;
	Ok(id)
}

fn write_bool(archive: &mut dyn Archive, value: bool) -> Result<()> {
	let mut value = value;
	archive.xfer_bool(&mut value)
}

fn read_bool(archive: &mut dyn Archive) -> Result<bool> {
	let mut value = false;
	archive.xfer_bool(&mut value)?;
	Ok(value)
}

fn write_str(archive: &mut dyn Archive, text: &str) -> Result<()> {
	let mut text = text.to_string();
	archive.xfer_string(&mut text)
}

fn read_string(archive: &mut dyn Archive) -> Result<String> {
	let mut text = String::new();
	archive.xfer_string(&mut text)?;
	Ok(text)
}

fn cannot_adopt(id: i64) -> ArchiveError {
	ArchiveError::FormatMismatch(format!("shared handle cannot adopt raw allocation {id}"))
}

fn cannot_own(id: i64) -> ArchiveError {
	ArchiveError::FormatMismatch(format!("back-reference {id} cannot be owned uniquely"))
}

/// Transfers a nullable shared handle whose static type is concrete.
///
/// The identity map guarantees that every `Rc` clone of one allocation
/// round-trips to a clone of one allocation, cycles included.
pub fn xfer_shared<T>(archive: &mut dyn Archive, value: &mut Option<Rc<RefCell<T>>>) -> Result<()>
where
	T: Transfer + Default + Any,
{
	match archive.direction() {
		Direction::Writing => write_shared(archive, value),
		Direction::Reading => {
			*value = read_shared(archive)?;
			Ok(())
		},
	}
}

fn write_shared<T: Transfer + Any>(
	archive: &mut dyn Archive,
	value: &Option<Rc<RefCell<T>>>,
) -> Result<()> {
	let Some(handle) = value else {
		return write_id(archive, NULL_REF);
	};

	let address = Rc::as_ptr(handle) as usize;
	if let Some(id) = archive.identity().shared_id(address) {
		write_id(archive, id)?;
		return write_bool(archive, false);
	}

	write_id(archive, NEW_INLINE)?;
	archive.identity().assign_shared_id(address);
	write_bool(archive, false)?;

	// Inner raw record, keyed on the value inside the cell so that later
	// raw aliases to this object back-reference it.
	let value_address = handle.as_ptr() as usize;
	if let Some(id) = archive.identity().raw_id(value_address) {
		write_id(archive, id)?;
		write_bool(archive, false)
	} else {
		write_id(archive, NEW_INLINE)?;
		archive.identity().assign_raw_id(value_address);
		handle.borrow_mut().transfer(archive)
	}
}

fn read_shared<T: Transfer + Default + Any>(
	archive: &mut dyn Archive,
) -> Result<Option<Rc<RefCell<T>>>> {
	let id = read_id(archive)?;
	match id {
		NULL_REF => Ok(None),
		NEW_INLINE => {
			let needed_downcast = read_bool(archive)?;
			let inner = read_id(archive)?;
			match (needed_downcast, inner) {
				(false, NEW_INLINE) => {
					let handle = Rc::new(RefCell::new(T::default()));
					let erased: Rc<dyn Any> = handle.clone();
					let identity = archive.identity();
					identity.record_shared(SharedEntry {
						handle: erased,
						type_id: TypeId::of::<T>(),
					});
					identity.record_raw(RawEntry {
						address: handle.as_ptr() as *mut (),
						type_id: TypeId::of::<T>(),
					});
					handle.borrow_mut().transfer(archive)?;
					Ok(Some(handle))
				},
				(true, NEW_POLYMORPHIC) => {
					let name = read_string(archive)?;
					Err(ArchiveError::CastFailure {
						type_name: name,
						target: std::any::type_name::<T>(),
					})
				},
				(_, id) if id >= 0 => Err(cannot_adopt(id)),
				_ => Err(ArchiveError::FormatMismatch("malformed shared record".to_string())),
			}
		},
		NEW_POLYMORPHIC => Err(ArchiveError::FormatMismatch(
			"bare polymorphic record in shared position".to_string(),
		)),
		id => {
			let handle = archive.identity().shared_entry(id)?.handle.clone();
			let needed_downcast = read_bool(archive)?;
			if needed_downcast {
				let name = read_string(archive)?;
				return Err(ArchiveError::CastFailure {
					type_name: name,
					target: std::any::type_name::<T>(),
				});
			}
			match handle.downcast::<RefCell<T>>() {
				Ok(handle) => Ok(Some(handle)),
				Err(_) => Err(ArchiveError::CastFailure {
					type_name: format!("shared reference {id}"),
					target: std::any::type_name::<T>(),
				}),
			}
		},
	}
}

/// Transfers a nullable shared handle through a registered base trait.
/// The most-derived type is written by name and rebuilt through the type
/// registry on the way back.
pub fn xfer_shared_dyn<B>(archive: &mut dyn Archive, value: &mut Option<Rc<RefCell<B>>>) -> Result<()>
where
	B: Polymorphic + ?Sized + 'static,
{
	match archive.direction() {
		Direction::Writing => write_shared_dyn(archive, value),
		Direction::Reading => {
			*value = read_shared_dyn(archive)?;
			Ok(())
		},
	}
}

fn write_shared_dyn<B: Polymorphic + ?Sized + 'static>(
	archive: &mut dyn Archive,
	value: &Option<Rc<RefCell<B>>>,
) -> Result<()> {
	let Some(handle) = value else {
		return write_id(archive, NULL_REF);
	};

	let descriptor = {
		let cell = handle.borrow();
		registry::lookup_type_id(cell.as_any().type_id(), cell.dyn_type_name())?
	};

	let address = Rc::as_ptr(handle) as *const () as usize;
	if let Some(id) = archive.identity().shared_id(address) {
		write_id(archive, id)?;
		write_bool(archive, true)?;
		return write_str(archive, descriptor.name());
	}

	write_id(archive, NEW_INLINE)?;
	archive.identity().assign_shared_id(address);
	write_bool(archive, true)?;

	let value_address = handle.as_ptr() as *mut () as usize;
	if let Some(id) = archive.identity().raw_id(value_address) {
		write_id(archive, id)?;
		write_bool(archive, true)?;
		write_str(archive, descriptor.name())
	} else {
		write_id(archive, NEW_POLYMORPHIC)?;
		write_str(archive, descriptor.name())?;
		archive.identity().assign_raw_id(value_address);
		handle.borrow_mut().transfer(archive)
	}
}

fn read_shared_dyn<B: Polymorphic + ?Sized + 'static>(
	archive: &mut dyn Archive,
) -> Result<Option<Rc<RefCell<B>>>> {
	let id = read_id(archive)?;
	match id {
		NULL_REF => Ok(None),
		NEW_INLINE => {
			let needed_downcast = read_bool(archive)?;
			let inner = read_id(archive)?;
			match (needed_downcast, inner) {
				(true, NEW_POLYMORPHIC) => {
					let name = read_string(archive)?;
					let descriptor = registry::lookup(&name)?;
					let erased = descriptor.construct_shared()?;
					let address = descriptor
						.cell_address(erased.as_ref())
						.ok_or_else(|| ArchiveError::CastFailure {
							type_name: name.clone(),
							target: "registered handle",
						})?;
					let identity = archive.identity();
					identity.record_shared(SharedEntry {
						handle: erased.clone(),
						type_id: descriptor.type_id(),
					});
					identity.record_raw(RawEntry { address, type_id: descriptor.type_id() });
					descriptor.transfer_cell(erased.as_ref(), archive)?;
					let caster = descriptor.caster::<B>()?;
					match (caster.shared)(erased) {
						Some(handle) => Ok(Some(handle)),
						None => Err(ArchiveError::CastFailure {
							type_name: name,
							target: std::any::type_name::<B>(),
						}),
					}
				},
				(false, NEW_INLINE) => {
					Err(ArchiveError::NotDefaultConstructible(std::any::type_name::<B>()))
				},
				(_, id) if id >= 0 => Err(cannot_adopt(id)),
				_ => Err(ArchiveError::FormatMismatch("malformed shared record".to_string())),
			}
		},
		NEW_POLYMORPHIC => Err(ArchiveError::FormatMismatch(
			"bare polymorphic record in shared position".to_string(),
		)),
		id => {
			let (handle, stored_type) = {
				let entry = archive.identity().shared_entry(id)?;
				(entry.handle.clone(), entry.type_id)
			};
			let needed_downcast = read_bool(archive)?;
			let descriptor = if needed_downcast {
				let name = read_string(archive)?;
				registry::lookup(&name)?
			} else {
				registry::lookup_type_id(stored_type, "<shared back-reference>")?
			};
			let caster = descriptor.caster::<B>()?;
			match (caster.shared)(handle) {
				Some(handle) => Ok(Some(handle)),
				None => Err(ArchiveError::CastFailure {
					type_name: descriptor.name().to_string(),
					target: std::any::type_name::<B>(),
				}),
			}
		},
	}
}

/// Transfers a nullable owning box with a concrete static type.
///
/// A box is sole owner of its value, so its record is always written
/// inline; a back-reference arriving at a box destination is a protocol
/// error.
pub fn xfer_unique<T>(archive: &mut dyn Archive, value: &mut Option<Box<T>>) -> Result<()>
where
	T: Transfer + Default + Any,
{
	match archive.direction() {
		Direction::Writing => write_unique(archive, value),
		Direction::Reading => {
			*value = read_unique(archive)?;
			Ok(())
		},
	}
}

fn write_unique<T: Transfer + Any>(
	archive: &mut dyn Archive,
	value: &mut Option<Box<T>>,
) -> Result<()> {
	let Some(boxed) = value else {
		return write_id(archive, NULL_REF);
	};

	let address = &**boxed as *const T as usize;
	if let Some(id) = archive.identity().raw_id(address) {
		write_id(archive, id)?;
		return write_bool(archive, false);
	}

	write_id(archive, NEW_INLINE)?;
	archive.identity().assign_raw_id(address);
	boxed.transfer(archive)
}

fn read_unique<T: Transfer + Default + Any>(archive: &mut dyn Archive) -> Result<Option<Box<T>>> {
	let id = read_id(archive)?;
	match id {
		NULL_REF => Ok(None),
		NEW_INLINE => {
			let mut boxed = Box::new(T::default());
			archive.identity().record_raw(RawEntry {
				address: &mut *boxed as *mut T as *mut (),
				type_id: TypeId::of::<T>(),
			});
			boxed.transfer(archive)?;
			Ok(Some(boxed))
		},
		NEW_POLYMORPHIC => {
			let name = read_string(archive)?;
			let descriptor = registry::lookup(&name)?;
			if descriptor.type_id() != TypeId::of::<T>() {
				return Err(ArchiveError::CastFailure {
					type_name: name,
					target: std::any::type_name::<T>(),
				});
			}
			let mut erased = descriptor.construct_unique()?;
			archive.identity().record_raw(RawEntry {
				address: erased.as_mut() as *mut dyn Any as *mut (),
				type_id: descriptor.type_id(),
			});
			descriptor.transfer_value(erased.as_mut(), archive)?;
			match erased.downcast::<T>() {
				Ok(boxed) => Ok(Some(boxed)),
				Err(_) => Err(ArchiveError::CastFailure {
					type_name: name,
					target: std::any::type_name::<T>(),
				}),
			}
		},
		id => {
			archive.identity().raw_entry(id)?;
			Err(cannot_own(id))
		},
	}
}

/// Transfers a nullable owning box through a registered base trait.
pub fn xfer_unique_dyn<B>(archive: &mut dyn Archive, value: &mut Option<Box<B>>) -> Result<()>
where
	B: Polymorphic + ?Sized + 'static,
{
	match archive.direction() {
		Direction::Writing => write_unique_dyn(archive, value),
		Direction::Reading => {
			*value = read_unique_dyn(archive)?;
			Ok(())
		},
	}
}

fn write_unique_dyn<B: Polymorphic + ?Sized + 'static>(
	archive: &mut dyn Archive,
	value: &mut Option<Box<B>>,
) -> Result<()> {
	let Some(boxed) = value else {
		return write_id(archive, NULL_REF);
	};

	let descriptor =
		registry::lookup_type_id((**boxed).as_any().type_id(), (**boxed).dyn_type_name())?;

	let address = &**boxed as *const B as *const () as usize;
	if let Some(id) = archive.identity().raw_id(address) {
		write_id(archive, id)?;
		write_bool(archive, true)?;
		return write_str(archive, descriptor.name());
	}

	write_id(archive, NEW_POLYMORPHIC)?;
	write_str(archive, descriptor.name())?;
	archive.identity().assign_raw_id(address);
	(**boxed).transfer(archive)
}

fn read_unique_dyn<B: Polymorphic + ?Sized + 'static>(
	archive: &mut dyn Archive,
) -> Result<Option<Box<B>>> {
	let id = read_id(archive)?;
	match id {
		NULL_REF => Ok(None),
		NEW_POLYMORPHIC => {
			let name = read_string(archive)?;
			let descriptor = registry::lookup(&name)?;
			let mut erased = descriptor.construct_unique()?;
			archive.identity().record_raw(RawEntry {
				address: erased.as_mut() as *mut dyn Any as *mut (),
				type_id: descriptor.type_id(),
			});
			descriptor.transfer_value(erased.as_mut(), archive)?;
			let caster = descriptor.caster::<B>()?;
			match (caster.unique)(erased) {
				Some(boxed) => Ok(Some(boxed)),
				None => Err(ArchiveError::CastFailure {
					type_name: name,
					target: std::any::type_name::<B>(),
				}),
			}
		},
		NEW_INLINE => Err(ArchiveError::NotDefaultConstructible(std::any::type_name::<B>())),
		id => {
			archive.identity().raw_entry(id)?;
			Err(cannot_own(id))
		},
	}
}

/// Transfers a nullable aliasing pointer with a concrete static type.
///
/// # Safety
///
/// When writing, every `Some` pointer must reference a live object of
/// type `T` that is not mutably borrowed elsewhere for the duration of
/// the call. When reading, a first occurrence allocates; the allocation
/// belongs to whoever claims the resulting pointer and is reclaimed with
/// [`Box::from_raw`]. Back-references alias storage owned elsewhere in
/// the reconstructed graph and must not outlive it.
pub unsafe fn xfer_raw<T>(archive: &mut dyn Archive, value: &mut Option<NonNull<T>>) -> Result<()>
where
	T: Transfer + Default + Any,
{
	match archive.direction() {
		Direction::Writing => write_raw(archive, *value),
		Direction::Reading => {
			*value = read_raw(archive)?;
			Ok(())
		},
	}
}

unsafe fn write_raw<T: Transfer + Any>(
	archive: &mut dyn Archive,
	value: Option<NonNull<T>>,
) -> Result<()> {
	let Some(pointer) = value else {
		return write_id(archive, NULL_REF);
	};

	let address = pointer.as_ptr() as usize;
	if let Some(id) = archive.identity().raw_id(address) {
		write_id(archive, id)?;
		return write_bool(archive, false);
	}

	write_id(archive, NEW_INLINE)?;
	archive.identity().assign_raw_id(address);
	(*pointer.as_ptr()).transfer(archive)
}

unsafe fn read_raw<T: Transfer + Default + Any>(
	archive: &mut dyn Archive,
) -> Result<Option<NonNull<T>>> {
	let id = read_id(archive)?;
	match id {
		NULL_REF => Ok(None),
		NEW_INLINE => {
			let pointer = Box::into_raw(Box::new(T::default()));
			archive.identity().record_raw(RawEntry {
				address: pointer as *mut (),
				type_id: TypeId::of::<T>(),
			});
			(*pointer).transfer(archive)?;
			Ok(NonNull::new(pointer))
		},
		NEW_POLYMORPHIC => {
			let name = read_string(archive)?;
			let descriptor = registry::lookup(&name)?;
			if descriptor.type_id() != TypeId::of::<T>() {
				return Err(ArchiveError::CastFailure {
					type_name: name,
					target: std::any::type_name::<T>(),
				});
			}
			let address = descriptor.construct_raw()?;
			archive.identity().record_raw(RawEntry { address, type_id: descriptor.type_id() });
			descriptor.transfer_raw(address, archive)?;
			Ok(NonNull::new(address as *mut T))
		},
		id => {
			let entry = archive.identity().raw_entry(id)?;
			let needed_downcast = read_bool(archive)?;
			let stored = if needed_downcast {
				let name = read_string(archive)?;
				registry::lookup(&name)?.type_id()
			} else {
				entry.type_id
			};
			if stored != TypeId::of::<T>() {
				return Err(ArchiveError::CastFailure {
					type_name: format!("reference {id}"),
					target: std::any::type_name::<T>(),
				});
			}
			Ok(NonNull::new(entry.address as *mut T))
		},
	}
}

/// Transfers a nullable aliasing pointer through a registered base trait.
///
/// # Safety
///
/// Same contract as [`xfer_raw`], with the object's most-derived type
/// resolved through the registry on both sides.
pub unsafe fn xfer_raw_dyn<B>(archive: &mut dyn Archive, value: &mut Option<NonNull<B>>) -> Result<()>
where
	B: Polymorphic + ?Sized + 'static,
{
	match archive.direction() {
		Direction::Writing => write_raw_dyn(archive, *value),
		Direction::Reading => {
			*value = read_raw_dyn(archive)?;
			Ok(())
		},
	}
}

unsafe fn write_raw_dyn<B: Polymorphic + ?Sized + 'static>(
	archive: &mut dyn Archive,
	value: Option<NonNull<B>>,
) -> Result<()> {
	let Some(pointer) = value else {
		return write_id(archive, NULL_REF);
	};

	let object = &mut *pointer.as_ptr();
	let descriptor = registry::lookup_type_id(object.as_any().type_id(), object.dyn_type_name())?;

	let address = pointer.as_ptr() as *mut () as usize;
	if let Some(id) = archive.identity().raw_id(address) {
		write_id(archive, id)?;
		write_bool(archive, true)?;
		return write_str(archive, descriptor.name());
	}

	write_id(archive, NEW_POLYMORPHIC)?;
	write_str(archive, descriptor.name())?;
	archive.identity().assign_raw_id(address);
	object.transfer(archive)
}

unsafe fn read_raw_dyn<B: Polymorphic + ?Sized + 'static>(
	archive: &mut dyn Archive,
) -> Result<Option<NonNull<B>>> {
	let id = read_id(archive)?;
	match id {
		NULL_REF => Ok(None),
		NEW_POLYMORPHIC => {
			let name = read_string(archive)?;
			let descriptor = registry::lookup(&name)?;
			let address = descriptor.construct_raw()?;
			archive.identity().record_raw(RawEntry { address, type_id: descriptor.type_id() });
			descriptor.transfer_raw(address, archive)?;
			let caster = descriptor.caster::<B>()?;
			Ok(NonNull::new((caster.raw)(address)))
		},
		NEW_INLINE => Err(ArchiveError::NotDefaultConstructible(std::any::type_name::<B>())),
		id => {
			let entry = archive.identity().raw_entry(id)?;
			let needed_downcast = read_bool(archive)?;
			let descriptor = if needed_downcast {
				let name = read_string(archive)?;
				registry::lookup(&name)?
			} else {
				registry::lookup_type_id(entry.type_id, "<raw back-reference>")?
			};
			let caster = descriptor.caster::<B>()?;
			Ok(NonNull::new((caster.raw)(entry.address)))
		},
	}
}

/// Selects the reference protocol for a pointee type: concrete types
/// transfer inline, registered base traits go through the type registry.
///
/// Every `Transfer + Default` concrete type implements this
/// automatically; [`impl_archive_base!`] implements it for `dyn Base`.
/// The handle forms (`Option<Rc<RefCell<_>>>`, `Option<Box<_>>`) get
/// their [`Transfer`] impls here in the engine crate, keyed on this
/// trait, so the only impl a user crate contributes lands on its own
/// `dyn Base` type.
pub trait Referent {
	fn xfer_shared(archive: &mut dyn Archive, value: &mut Option<Rc<RefCell<Self>>>) -> Result<()>;
	fn xfer_unique(archive: &mut dyn Archive, value: &mut Option<Box<Self>>) -> Result<()>;
}

impl<T: Transfer + Default + Any> Referent for T {
	fn xfer_shared(archive: &mut dyn Archive, value: &mut Option<Rc<RefCell<T>>>) -> Result<()> {
		xfer_shared(archive, value)
	}

	fn xfer_unique(archive: &mut dyn Archive, value: &mut Option<Box<T>>) -> Result<()> {
		xfer_unique(archive, value)
	}
}

impl<B: Referent + ?Sized> Transfer for Option<Rc<RefCell<B>>> {
	fn transfer(&mut self, archive: &mut dyn Archive) -> Result<()> {
		B::xfer_shared(archive, self)
	}
}

impl<B: Referent + ?Sized> Transfer for Option<Box<B>> {
	fn transfer(&mut self, archive: &mut dyn Archive) -> Result<()> {
		B::xfer_unique(archive, self)
	}
}

/// Implements [`Referent`] for the trait-object types of one or more
/// base traits, so that `Option<Rc<RefCell<dyn Base>>>` and
/// `Option<Box<dyn Base>>` fields take part in aggregate dispatch.
#[macro_export]
macro_rules! impl_archive_base {
	($($base:path),+ $(,)?) => {$(
		impl $crate::pointers::Referent for dyn $base {
			fn xfer_shared(
				archive: &mut dyn $crate::archive::Archive,
				value: &mut ::std::option::Option<
					::std::rc::Rc<::std::cell::RefCell<dyn $base>>,
				>,
			) -> $crate::errors::Result<()> {
				$crate::pointers::xfer_shared_dyn::<dyn $base>(archive, value)
			}

			fn xfer_unique(
				archive: &mut dyn $crate::archive::Archive,
				value: &mut ::std::option::Option<::std::boxed::Box<dyn $base>>,
			) -> $crate::errors::Result<()> {
				$crate::pointers::xfer_unique_dyn::<dyn $base>(archive, value)
			}
		}
	)*};
}
