use strata::{
	set_library_version, Archive, BinaryReader, BinaryWriter, Result, TextReader, TextWriter,
	Transfer, Version,
};

#[test]
fn readers_see_the_writers_version_table() {
	set_library_version("geomlib", Version::new(6, 2, 2105, 42));
	set_library_version("meshkit", Version::new(1, 0, 0, 0));

	let mut buffer = Vec::new();
	{
		let mut writer = BinaryWriter::new(&mut buffer).unwrap();
		assert_eq!(writer.version_of("geomlib"), Some(Version::new(6, 2, 2105, 42)));
		let mut value = 5i32;
		value.transfer(&mut writer).unwrap();
		writer.flush().unwrap();
	}

	let mut reader = BinaryReader::new(buffer.as_slice()).unwrap();
	assert_eq!(reader.version_of("geomlib"), Some(Version::new(6, 2, 2105, 42)));
	assert_eq!(reader.version_of("meshkit"), Some(Version::new(1, 0, 0, 0)));
	assert_eq!(reader.version_of("absent"), None);

	let mut value = 0i32;
	value.transfer(&mut reader).unwrap();
	assert_eq!(value, 5);
}

#[test]
fn text_streams_carry_the_header_too() {
	set_library_version("textlib", Version::new(2, 1, 0, 7));

	let mut buffer = Vec::new();
	{
		let mut writer = TextWriter::new(&mut buffer).unwrap();
		let mut value = true;
		value.transfer(&mut writer).unwrap();
	}

	let mut reader = TextReader::new(buffer.as_slice()).unwrap();
	assert_eq!(reader.version_of("textlib"), Some(Version::new(2, 1, 0, 7)));
	let mut value = false;
	value.transfer(&mut reader).unwrap();
	assert!(value);
}

#[test]
fn reads_can_branch_on_the_writer_era() {
	#[derive(Default)]
	struct Legacy {
		always: i32,
		since_v2: i32,
	}

	impl Transfer for Legacy {
		fn transfer(&mut self, archive: &mut dyn Archive) -> Result<()> {
			self.always.transfer(archive)?;
			let recent = archive
				.version_of("branch-lib")
				.is_some_and(|version| version.major >= 2);
			if recent {
				self.since_v2.transfer(archive)?;
			}
			Ok(())
		}
	}

	set_library_version("branch-lib", Version::new(1, 0, 0, 0));
	let mut old_stream = Vec::new();
	{
		let mut writer = BinaryWriter::new(&mut old_stream).unwrap();
		let mut value = Legacy { always: 3, since_v2: 9 };
		value.transfer(&mut writer).unwrap();
		writer.flush().unwrap();
	}

	set_library_version("branch-lib", Version::new(2, 0, 0, 0));
	let mut new_stream = Vec::new();
	{
		let mut writer = BinaryWriter::new(&mut new_stream).unwrap();
		let mut value = Legacy { always: 3, since_v2: 9 };
		value.transfer(&mut writer).unwrap();
		writer.flush().unwrap();
	}

	let mut reader = BinaryReader::new(old_stream.as_slice()).unwrap();
	let mut loaded = Legacy::default();
	loaded.transfer(&mut reader).unwrap();
	assert_eq!((loaded.always, loaded.since_v2), (3, 0));

	let mut reader = BinaryReader::new(new_stream.as_slice()).unwrap();
	let mut loaded = Legacy::default();
	loaded.transfer(&mut reader).unwrap();
	assert_eq!((loaded.always, loaded.since_v2), (3, 9));
}
