#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Once;

use strata::{impl_archive_base, register_archive_type, Archive, Polymorphic, Result, Transfer};

pub trait Shape: Polymorphic {
	fn area(&self) -> f64;
}

pub trait Named: Polymorphic {
	fn label(&self) -> String;
}

impl_archive_base!(Shape, Named);

#[derive(Default, Debug, PartialEq, Transfer)]
pub struct Circle {
	pub radius: f64,
}

impl Shape for Circle {
	fn area(&self) -> f64 {
		std::f64::consts::PI * self.radius * self.radius
	}
}

#[derive(Default, Debug, PartialEq, Transfer)]
pub struct Annulus {
	pub outer: f64,
	pub inner: f64,
}

impl Shape for Annulus {
	fn area(&self) -> f64 {
		std::f64::consts::PI * (self.outer * self.outer - self.inner * self.inner)
	}
}

impl Named for Annulus {
	fn label(&self) -> String {
		format!("annulus {}/{}", self.inner, self.outer)
	}
}

/// Registered `cast_only`: casts resolve, construction fails.
pub struct Halfplane {
	pub normal: (f64, f64),
}

impl Transfer for Halfplane {
	fn transfer(&mut self, archive: &mut dyn Archive) -> Result<()> {
		self.normal.0.transfer(archive)?;
		self.normal.1.transfer(archive)
	}
}

impl Shape for Halfplane {
	fn area(&self) -> f64 {
		f64::INFINITY
	}
}

#[derive(Default, Transfer)]
pub struct Node {
	pub tag: i32,
	pub next: Option<Rc<RefCell<Node>>>,
}

#[derive(Default, Debug, PartialEq, Transfer)]
pub struct Payload {
	pub value: f64,
}

pub fn register() {
	static INIT: Once = Once::new();
	INIT.call_once(|| {
		register_archive_type!(Circle: Shape);
		register_archive_type!(Annulus: Shape, Named);
		register_archive_type!(cast_only Halfplane: Shape);
	});
}
