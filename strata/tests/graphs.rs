mod common;

use std::cell::RefCell;
use std::ptr::NonNull;
use std::rc::Rc;

use common::{Node, Payload};
use strata::pointers::xfer_raw;
use strata::{Archive, BinaryReader, BinaryWriter, Transfer};

#[test]
fn shared_references_collapse_to_one_object() {
	let shared = Rc::new(RefCell::new(Payload { value: 8.25 }));
	let mut first = Some(shared.clone());
	let mut second = Some(shared.clone());
	let mut third = Some(Rc::new(RefCell::new(Payload { value: 8.25 })));

	let mut buffer = Vec::new();
	{
		let mut writer = BinaryWriter::new(&mut buffer).unwrap();
		first.transfer(&mut writer).unwrap();
		second.transfer(&mut writer).unwrap();
		third.transfer(&mut writer).unwrap();
		writer.flush().unwrap();
	}

	let mut loaded_first: Option<Rc<RefCell<Payload>>> = None;
	let mut loaded_second: Option<Rc<RefCell<Payload>>> = None;
	let mut loaded_third: Option<Rc<RefCell<Payload>>> = None;
	{
		let mut reader = BinaryReader::new(buffer.as_slice()).unwrap();
		loaded_first.transfer(&mut reader).unwrap();
		loaded_second.transfer(&mut reader).unwrap();
		loaded_third.transfer(&mut reader).unwrap();
	}

	let a = loaded_first.unwrap();
	let b = loaded_second.unwrap();
	let c = loaded_third.unwrap();
	assert!(Rc::ptr_eq(&a, &b));
	assert!(!Rc::ptr_eq(&a, &c));
	assert_eq!(a.borrow().value, 8.25);
	assert_eq!(c.borrow().value, 8.25);
	// the reader's session table is gone; only the two user handles remain
	assert_eq!(Rc::strong_count(&a), 2);
}

#[test]
fn self_loop_round_trips() {
	let node = Rc::new(RefCell::new(Node { tag: 7, next: None }));
	node.borrow_mut().next = Some(node.clone());

	let mut buffer = Vec::new();
	{
		let mut root = Some(node.clone());
		let mut writer = BinaryWriter::new(&mut buffer).unwrap();
		root.transfer(&mut writer).unwrap();
		writer.flush().unwrap();
	}
	node.borrow_mut().next = None;

	let mut loaded: Option<Rc<RefCell<Node>>> = None;
	{
		let mut reader = BinaryReader::new(buffer.as_slice()).unwrap();
		loaded.transfer(&mut reader).unwrap();
	}

	let loaded = loaded.unwrap();
	let next = loaded.borrow().next.clone().unwrap();
	assert!(Rc::ptr_eq(&loaded, &next));
	assert_eq!(loaded.borrow().tag, 7);
	loaded.borrow_mut().next = None;
}

#[test]
fn mutual_cycle_round_trips() {
	let a = Rc::new(RefCell::new(Node { tag: 1, next: None }));
	let b = Rc::new(RefCell::new(Node { tag: 2, next: None }));
	a.borrow_mut().next = Some(b.clone());
	b.borrow_mut().next = Some(a.clone());

	let mut buffer = Vec::new();
	{
		let mut root = Some(a.clone());
		let mut writer = BinaryWriter::new(&mut buffer).unwrap();
		root.transfer(&mut writer).unwrap();
		writer.flush().unwrap();
	}
	a.borrow_mut().next = None;
	b.borrow_mut().next = None;

	let mut loaded: Option<Rc<RefCell<Node>>> = None;
	{
		let mut reader = BinaryReader::new(buffer.as_slice()).unwrap();
		loaded.transfer(&mut reader).unwrap();
	}

	let loaded_a = loaded.unwrap();
	let loaded_b = loaded_a.borrow().next.clone().unwrap();
	let back = loaded_b.borrow().next.clone().unwrap();
	assert!(Rc::ptr_eq(&loaded_a, &back));
	assert!(!Rc::ptr_eq(&loaded_a, &loaded_b));
	assert_eq!(loaded_a.borrow().tag, 1);
	assert_eq!(loaded_b.borrow().tag, 2);
	loaded_a.borrow_mut().next = None;
	loaded_b.borrow_mut().next = None;
}

#[test]
fn null_references_round_trip() {
	let mut buffer = Vec::new();
	{
		let mut shared: Option<Rc<RefCell<Payload>>> = None;
		let mut unique: Option<Box<Payload>> = None;
		let mut raw: Option<NonNull<Payload>> = None;
		let mut writer = BinaryWriter::new(&mut buffer).unwrap();
		shared.transfer(&mut writer).unwrap();
		unique.transfer(&mut writer).unwrap();
		unsafe { xfer_raw(&mut writer, &mut raw).unwrap() };
		writer.flush().unwrap();
	}

	let mut backing = Payload::default();
	let mut shared = Some(Rc::new(RefCell::new(Payload::default())));
	let mut unique = Some(Box::new(Payload::default()));
	let mut raw = NonNull::new(&mut backing as *mut Payload);
	{
		let mut reader = BinaryReader::new(buffer.as_slice()).unwrap();
		shared.transfer(&mut reader).unwrap();
		unique.transfer(&mut reader).unwrap();
		unsafe { xfer_raw(&mut reader, &mut raw).unwrap() };
	}
	assert!(shared.is_none());
	assert!(unique.is_none());
	assert!(raw.is_none());
}

#[test]
fn unique_boxes_stay_distinct() {
	let mut first = Some(Box::new(Payload { value: 1.0 }));
	let mut second = Some(Box::new(Payload { value: 1.0 }));

	let mut buffer = Vec::new();
	{
		let mut writer = BinaryWriter::new(&mut buffer).unwrap();
		first.transfer(&mut writer).unwrap();
		second.transfer(&mut writer).unwrap();
		writer.flush().unwrap();
	}

	let mut loaded_first: Option<Box<Payload>> = None;
	let mut loaded_second: Option<Box<Payload>> = None;
	{
		let mut reader = BinaryReader::new(buffer.as_slice()).unwrap();
		loaded_first.transfer(&mut reader).unwrap();
		loaded_second.transfer(&mut reader).unwrap();
	}

	let a = loaded_first.unwrap();
	let b = loaded_second.unwrap();
	assert!(!std::ptr::eq(&*a, &*b));
	assert_eq!(*a, *b);
}

#[test]
fn raw_aliases_round_trip_to_one_allocation() {
	let pointer = NonNull::new(Box::into_raw(Box::new(Payload { value: 7.5 })));
	let mut first = pointer;
	let mut second = pointer;

	let mut buffer = Vec::new();
	{
		let mut writer = BinaryWriter::new(&mut buffer).unwrap();
		unsafe {
			xfer_raw(&mut writer, &mut first).unwrap();
			xfer_raw(&mut writer, &mut second).unwrap();
		}
		writer.flush().unwrap();
	}
	unsafe { drop(Box::from_raw(pointer.unwrap().as_ptr())) };

	let mut loaded_first: Option<NonNull<Payload>> = None;
	let mut loaded_second: Option<NonNull<Payload>> = None;
	{
		let mut reader = BinaryReader::new(buffer.as_slice()).unwrap();
		unsafe {
			xfer_raw(&mut reader, &mut loaded_first).unwrap();
			xfer_raw(&mut reader, &mut loaded_second).unwrap();
		}
	}

	let a = loaded_first.unwrap();
	assert_eq!(a.as_ptr(), loaded_second.unwrap().as_ptr());
	unsafe {
		assert_eq!((*a.as_ptr()).value, 7.5);
		drop(Box::from_raw(a.as_ptr()));
	}
}

#[test]
fn raw_alias_into_owned_box_back_references() {
	let mut owner = Some(Box::new(Payload { value: 4.5 }));
	let mut alias = owner.as_mut().map(|boxed| NonNull::from(&mut **boxed));

	let mut buffer = Vec::new();
	{
		let mut writer = BinaryWriter::new(&mut buffer).unwrap();
		owner.transfer(&mut writer).unwrap();
		unsafe { xfer_raw(&mut writer, &mut alias).unwrap() };
		writer.flush().unwrap();
	}

	let mut loaded_owner: Option<Box<Payload>> = None;
	let mut loaded_alias: Option<NonNull<Payload>> = None;
	{
		let mut reader = BinaryReader::new(buffer.as_slice()).unwrap();
		loaded_owner.transfer(&mut reader).unwrap();
		unsafe { xfer_raw(&mut reader, &mut loaded_alias).unwrap() };
	}

	let owner_box = loaded_owner.unwrap();
	assert!(std::ptr::eq(
		loaded_alias.unwrap().as_ptr() as *const Payload,
		&*owner_box,
	));
	assert_eq!(owner_box.value, 4.5);
}

#[test]
fn raw_alias_into_shared_object_back_references() {
	let shared = Rc::new(RefCell::new(Payload { value: 3.0 }));
	let mut shared_ref = Some(shared.clone());
	let mut alias = NonNull::new(shared.as_ptr());

	let mut buffer = Vec::new();
	{
		let mut writer = BinaryWriter::new(&mut buffer).unwrap();
		shared_ref.transfer(&mut writer).unwrap();
		unsafe { xfer_raw(&mut writer, &mut alias).unwrap() };
		writer.flush().unwrap();
	}

	let mut loaded_shared: Option<Rc<RefCell<Payload>>> = None;
	let mut loaded_alias: Option<NonNull<Payload>> = None;
	{
		let mut reader = BinaryReader::new(buffer.as_slice()).unwrap();
		loaded_shared.transfer(&mut reader).unwrap();
		unsafe { xfer_raw(&mut reader, &mut loaded_alias).unwrap() };
	}

	let handle = loaded_shared.unwrap();
	assert_eq!(loaded_alias.unwrap().as_ptr(), handle.as_ptr());
	assert_eq!(handle.borrow().value, 3.0);
}
