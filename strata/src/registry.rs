use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::{Arc, LazyLock, PoisonError, RwLock};

use fxhash::FxHashMap;

use crate::archive::{Archive, Transfer};
use crate::errors::{ArchiveError, Result};

/// Converts erased handles of one concrete type into a registered base
/// trait-object form. One caster is installed per (type, base) pair.
///
/// Trait objects share the data pointer across every base, so these casts
/// only attach the right vtable; there is no offset arithmetic to compose.
pub struct Caster<B: ?Sized + 'static> {
	pub shared: fn(Rc<dyn Any>) -> Option<Rc<RefCell<B>>>,
	pub unique: fn(Box<dyn Any>) -> Option<Box<B>>,
	pub raw: fn(*mut ()) -> *mut B,
}

/// Everything an archive needs to rebuild a value whose concrete type is
/// known only from a name on the stream: constructors for each handle
/// form, erased body transfers, and the caster table.
pub struct TypeDescriptor {
	name: &'static str,
	id: TypeId,
	new_unique: Option<fn() -> Box<dyn Any>>,
	new_shared: Option<fn() -> Rc<dyn Any>>,
	new_raw: Option<fn() -> *mut ()>,
	address_of_cell: fn(&dyn Any) -> Option<*mut ()>,
	cell_body: fn(&dyn Any, &mut dyn Archive) -> Result<()>,
	value_body: fn(&mut dyn Any, &mut dyn Archive) -> Result<()>,
	raw_body: unsafe fn(*mut (), &mut dyn Archive) -> Result<()>,
	casters: FxHashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

fn address_of_cell<D: Any>(cell: &dyn Any) -> Option<*mut ()> {
	cell.downcast_ref::<RefCell<D>>().map(|cell| cell.as_ptr() as *mut ())
}

fn cell_body<D: Transfer + Any>(cell: &dyn Any, archive: &mut dyn Archive) -> Result<()> {
	match cell.downcast_ref::<RefCell<D>>() {
		Some(cell) => cell.borrow_mut().transfer(archive),
		None => Err(mismatched_handle::<D>()),
	}
}

fn value_body<D: Transfer + Any>(value: &mut dyn Any, archive: &mut dyn Archive) -> Result<()> {
	match value.downcast_mut::<D>() {
		Some(value) => value.transfer(archive),
		None => Err(mismatched_handle::<D>()),
	}
}

unsafe fn raw_body<D: Transfer>(address: *mut (), archive: &mut dyn Archive) -> Result<()> {
	(*(address as *mut D)).transfer(archive)
}

fn mismatched_handle<D>() -> ArchiveError {
	ArchiveError::CastFailure {
		type_name: std::any::type_name::<D>().to_string(),
		target: "registered handle",
	}
}

impl TypeDescriptor {
	pub fn new<D: Transfer + Default + Any>() -> Self {
		Self {
			name: std::any::type_name::<D>(),
			id: TypeId::of::<D>(),
			new_unique: Some(|| -> Box<dyn Any> { Box::new(D::default()) }),
			new_shared: Some(|| -> Rc<dyn Any> { Rc::new(RefCell::new(D::default())) }),
			new_raw: Some(|| Box::into_raw(Box::new(D::default())) as *mut ()),
			address_of_cell: address_of_cell::<D>,
			cell_body: cell_body::<D>,
			value_body: value_body::<D>,
			raw_body: raw_body::<D>,
			casters: FxHashMap::default(),
		}
	}

	/// A descriptor for a type without a default value. Casts and body
	/// transfers work; any sentinel that must construct the type fails
	/// with [`ArchiveError::NotDefaultConstructible`].
	pub fn cast_only<D: Transfer + Any>() -> Self {
		Self {
			name: std::any::type_name::<D>(),
			id: TypeId::of::<D>(),
			new_unique: None,
			new_shared: None,
			new_raw: None,
			address_of_cell: address_of_cell::<D>,
			cell_body: cell_body::<D>,
			value_body: value_body::<D>,
			raw_body: raw_body::<D>,
			casters: FxHashMap::default(),
		}
	}

	pub fn with_base<B: ?Sized + 'static>(mut self, caster: Caster<B>) -> Self {
		self.casters.insert(TypeId::of::<B>(), Box::new(caster));
		self
	}

	pub fn name(&self) -> &'static str {
		self.name
	}

	pub fn type_id(&self) -> TypeId {
		self.id
	}

	pub fn caster<B: ?Sized + 'static>(&self) -> Result<&Caster<B>> {
		self.casters
			.get(&TypeId::of::<B>())
			.and_then(|caster| caster.downcast_ref::<Caster<B>>())
			.ok_or_else(|| ArchiveError::CastFailure {
				type_name: self.name.to_string(),
				target: std::any::type_name::<B>(),
			})
	}

	pub(crate) fn construct_shared(&self) -> Result<Rc<dyn Any>> {
		match self.new_shared {
			Some(construct) => Ok(construct()),
			None => Err(ArchiveError::NotDefaultConstructible(self.name)),
		}
	}

	pub(crate) fn construct_unique(&self) -> Result<Box<dyn Any>> {
		match self.new_unique {
			Some(construct) => Ok(construct()),
			None => Err(ArchiveError::NotDefaultConstructible(self.name)),
		}
	}

	pub(crate) fn construct_raw(&self) -> Result<*mut ()> {
		match self.new_raw {
			Some(construct) => Ok(construct()),
			None => Err(ArchiveError::NotDefaultConstructible(self.name)),
		}
	}

	pub(crate) fn cell_address(&self, cell: &dyn Any) -> Option<*mut ()> {
		(self.address_of_cell)(cell)
	}

	pub(crate) fn transfer_cell(&self, cell: &dyn Any, archive: &mut dyn Archive) -> Result<()> {
		(self.cell_body)(cell, archive)
	}

	pub(crate) fn transfer_value(&self, value: &mut dyn Any, archive: &mut dyn Archive) -> Result<()> {
		(self.value_body)(value, archive)
	}

	pub(crate) unsafe fn transfer_raw(&self, address: *mut (), archive: &mut dyn Archive) -> Result<()> {
		(self.raw_body)(address, archive)
	}
}

#[derive(Default)]
struct Registry {
	by_name: FxHashMap<&'static str, Arc<TypeDescriptor>>,
	by_id: FxHashMap<TypeId, Arc<TypeDescriptor>>,
}

static REGISTRY: LazyLock<RwLock<Registry>> = LazyLock::new(Default::default);

/// Installs a descriptor in the process-wide registry.
///
/// Registration must be complete before the first archive session starts;
/// installing the same type again replaces its entry.
#[cfg_attr(feature = "tracing", tracing::instrument(skip_all))]
pub fn install(descriptor: TypeDescriptor) {
	let descriptor = Arc::new(descriptor);
	let mut registry = REGISTRY.write().unwrap_or_else(PoisonError::into_inner);
	registry.by_id.insert(descriptor.id, descriptor.clone());
	registry.by_name.insert(descriptor.name, descriptor);
}

pub fn lookup(name: &str) -> Result<Arc<TypeDescriptor>> {
	REGISTRY
		.read()
		.unwrap_or_else(PoisonError::into_inner)
		.by_name
		.get(name)
		.cloned()
		.ok_or_else(|| ArchiveError::UnregisteredPolymorphic(name.to_string()))
}

/// Write-side lookup by the dynamic type of a live object. `name` is only
/// used to report the failure.
pub fn lookup_type_id(id: TypeId, name: &str) -> Result<Arc<TypeDescriptor>> {
	REGISTRY
		.read()
		.unwrap_or_else(PoisonError::into_inner)
		.by_id
		.get(&id)
		.cloned()
		.ok_or_else(|| ArchiveError::UnregisteredPolymorphic(name.to_string()))
}

pub fn is_registered(name: &str) -> bool {
	REGISTRY
		.read()
		.unwrap_or_else(PoisonError::into_inner)
		.by_name
		.contains_key(name)
}

#[doc(hidden)]
#[macro_export]
macro_rules! __caster {
	($ty:ty => $base:path) => {
		$crate::registry::Caster::<dyn $base> {
			shared: |cell| {
				cell.downcast::<::std::cell::RefCell<$ty>>()
					.ok()
					.map(|cell| -> ::std::rc::Rc<::std::cell::RefCell<dyn $base>> { cell })
			},
			unique: |value| {
				value.downcast::<$ty>()
					.ok()
					.map(|value| -> ::std::boxed::Box<dyn $base> { value })
			},
			raw: |address| address as *mut $ty as *mut dyn $base,
		}
	};
}

/// Registers a concrete type, naming every base trait it is archived
/// through. Call once per type, before the first archive session.
///
/// The `cast_only` form registers a type without a default value; such a
/// type can be referenced and cast but never constructed by a reader.
#[macro_export]
macro_rules! register_archive_type {
	(cast_only $ty:ty) => {
		$crate::registry::install($crate::registry::TypeDescriptor::cast_only::<$ty>())
	};
	(cast_only $ty:ty : $($base:path),+ $(,)?) => {
		$crate::registry::install(
			$crate::registry::TypeDescriptor::cast_only::<$ty>()
				$(.with_base::<dyn $base>($crate::__caster!($ty => $base)))*
		)
	};
	($ty:ty) => {
		$crate::registry::install($crate::registry::TypeDescriptor::new::<$ty>())
	};
	($ty:ty : $($base:path),+ $(,)?) => {
		$crate::registry::install(
			$crate::registry::TypeDescriptor::new::<$ty>()
				$(.with_base::<dyn $base>($crate::__caster!($ty => $base)))*
		)
	};
}

#[test]
fn installs_and_resolves_descriptors() {
	#[derive(Default)]
	struct Probe {
		value: i32,
	}

	impl Transfer for Probe {
		fn transfer(&mut self, archive: &mut dyn Archive) -> Result<()> {
			self.value.transfer(archive)
		}
	}

	install(TypeDescriptor::new::<Probe>());
	let name = std::any::type_name::<Probe>();
	assert!(is_registered(name));
	assert!(!is_registered("strata::registry::NoSuchProbe"));

	let descriptor = lookup(name).unwrap();
	assert_eq!(descriptor.type_id(), TypeId::of::<Probe>());
	assert!(lookup_type_id(TypeId::of::<Probe>(), name).is_ok());
	assert!(lookup("strata::registry::NoSuchProbe").is_err());
}

#[test]
fn cast_only_descriptors_refuse_construction() {
	struct Opaque(#[allow(dead_code)] i32);

	impl Transfer for Opaque {
		fn transfer(&mut self, archive: &mut dyn Archive) -> Result<()> {
			self.0.transfer(archive)
		}
	}

	let descriptor = TypeDescriptor::cast_only::<Opaque>();
	assert!(matches!(
		descriptor.construct_shared(),
		Err(ArchiveError::NotDefaultConstructible(_))
	));
	assert!(matches!(
		descriptor.construct_unique(),
		Err(ArchiveError::NotDefaultConstructible(_))
	));
}
