use std::cell::RefCell;
use std::rc::Rc;
use std::time::SystemTime;

use memory_stats::memory_stats;
use tracing::Level;

use strata::{
	impl_archive_base, register_archive_type, set_library_version, Archive, BinaryReader,
	BinaryWriter, Polymorphic, TextWriter, Transfer, Version,
};

#[derive(Default, Transfer)]
struct Vertex {
	x: f64,
	y: f64,
	z: f64,
}

trait Element: Polymorphic {
	fn corners(&self) -> usize;
}

impl_archive_base!(Element);

#[derive(Default, Transfer)]
struct Triangle {
	indices: Vec<usize>,
}

impl Element for Triangle {
	fn corners(&self) -> usize {
		3
	}
}

#[derive(Default, Transfer)]
struct Quad {
	indices: Vec<usize>,
}

impl Element for Quad {
	fn corners(&self) -> usize {
		4
	}
}

#[derive(Default, Transfer)]
struct Mesh {
	vertices: Vec<Option<Rc<RefCell<Vertex>>>>,
	elements: Vec<Option<Box<dyn Element>>>,
}

fn build_mesh(quads: usize) -> Mesh {
	let side = quads + 1;
	let mut mesh = Mesh::default();

	for row in 0..side {
		for column in 0..side {
			mesh.vertices.push(Some(Rc::new(RefCell::new(Vertex {
				x: column as f64,
				y: row as f64,
				z: 0.0,
			}))));
		}
	}

	for row in 0..quads {
		for column in 0..quads {
			let base = row * side + column;
			if (row + column) % 2 == 0 {
				mesh.elements.push(Some(Box::new(Quad {
					indices: vec![base, base + 1, base + side + 1, base + side],
				})));
			} else {
				mesh.elements.push(Some(Box::new(Triangle {
					indices: vec![base, base + 1, base + side + 1],
				})));
				mesh.elements.push(Some(Box::new(Triangle {
					indices: vec![base, base + side + 1, base + side],
				})));
			}
		}
	}

	mesh
}

fn main() {
	tracing_subscriber::fmt()
		.with_max_level(Level::TRACE)
		.with_target(false)
		.init();

	register_archive_type!(Triangle: Element);
	register_archive_type!(Quad: Element);
	set_library_version("mesh-experiments", Version::new(0, 1, 0, 0));

	let mut start = SystemTime::now();
	let mut mesh = build_mesh(256);

	println! {
		"Mesh construction time: {:?}, RAM: {}MB",
		start.elapsed().unwrap(),
		memory_stats().unwrap().virtual_mem as f32 / 1000000.0,
	}

	start = SystemTime::now();
	let mut binary = Vec::new();
	{
		let mut writer = BinaryWriter::new(&mut binary).unwrap();
		mesh.transfer(&mut writer).unwrap();
		writer.flush().unwrap();
	}

	println! {
		"Binary save time: {:?}, stream: {}KB",
		start.elapsed().unwrap(),
		binary.len() / 1024,
	}

	start = SystemTime::now();
	let mut text = Vec::new();
	{
		let mut writer = TextWriter::new(&mut text).unwrap();
		mesh.transfer(&mut writer).unwrap();
		writer.flush().unwrap();
	}

	println! {
		"Text save time: {:?}, stream: {}KB",
		start.elapsed().unwrap(),
		text.len() / 1024,
	}

	start = SystemTime::now();
	let mut reloaded = Mesh::default();
	{
		let mut reader = BinaryReader::new(binary.as_slice()).unwrap();
		reloaded.transfer(&mut reader).unwrap();
	}

	println! {
		"Binary load time: {:?}, RAM: {}MB",
		start.elapsed().unwrap(),
		memory_stats().unwrap().virtual_mem as f32 / 1000000.0,
	}

	println!(
		"Loaded {} vertices, {} elements",
		reloaded.vertices.len(),
		reloaded.elements.len(),
	);
}
