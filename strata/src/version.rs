use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::{PoisonError, RwLock};

use crate::archive::{Archive, Direction, Transfer};
use crate::errors::{ArchiveError, Result};

/// Mapping of library names to the version that wrote a stream.
pub type VersionMap = BTreeMap<String, Version>;

static LIBRARY_VERSIONS: RwLock<VersionMap> = RwLock::new(BTreeMap::new());

/// Records the version of a library taking part in archiving.
///
/// The table is process-wide; every writer emits a snapshot of it at the
/// start of its stream, before any payload.
pub fn set_library_version(library: &str, version: Version) {
	let mut table = LIBRARY_VERSIONS.write().unwrap_or_else(PoisonError::into_inner);
	table.insert(library.to_string(), version);
}

pub fn library_versions() -> VersionMap {
	LIBRARY_VERSIONS.read().unwrap_or_else(PoisonError::into_inner).clone()
}

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Version {
	pub major: u32,
	pub minor: u32,
	pub release: u32,
	pub patch: u32,
}

impl Version {
	pub const fn new(major: u32, minor: u32, release: u32, patch: u32) -> Self {
		Self { major, minor, release, patch }
	}
}

impl Display for Version {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		write!(f, "v{}.{}.{}-{}", self.major, self.minor, self.release, self.patch)
	}
}

impl FromStr for Version {
	type Err = ArchiveError;

	/// Accepts `v6.2.2105-42-g8f3c`, `6.2.2105`, `6.2`, `6`.
	/// Anything past the patch segment (a commit hash) is ignored.
	fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
		fn field(part: Option<&str>, whole: &str) -> Result<u32> {
			match part {
				None | Some("") => Ok(0),
				Some(digits) => digits.parse().map_err(|_| {
					ArchiveError::FormatMismatch(format!("invalid version `{whole}`"))
				}),
			}
		}

		let text = value.strip_prefix('v').unwrap_or(value);
		let mut segments = text.split('-');
		let mut numbers = segments.next().unwrap_or("").split('.');

		Ok(Self {
			major: field(numbers.next(), value)?,
			minor: field(numbers.next(), value)?,
			release: field(numbers.next(), value)?,
			patch: field(segments.next(), value)?,
		})
	}
}

impl Transfer for Version {
	fn transfer(&mut self, archive: &mut dyn Archive) -> Result<()> {
		let mut text = self.to_string();
		archive.xfer_string(&mut text)?;
		if archive.direction() == Direction::Reading {
			*self = text.parse()?;
		}
		Ok(())
	}
}

/// Transfers the library-version header every archive starts with.
/// Writers emit the current process table; readers decode theirs from the
/// stream. Runs before any payload transfer.
pub(crate) fn transfer_header(archive: &mut dyn Archive) -> Result<VersionMap> {
	let mut versions = match archive.direction() {
		Direction::Writing => library_versions(),
		Direction::Reading => VersionMap::new(),
	};
	versions.transfer(archive)?;
	Ok(versions)
}

#[test]
fn parses_tagged_versions() {
	let version: Version = "v6.2.2105-42-g8f3c91d".parse().unwrap();
	assert_eq!(version, Version::new(6, 2, 2105, 42));

	let version: Version = "6.2".parse().unwrap();
	assert_eq!(version, Version::new(6, 2, 0, 0));

	let version: Version = "7".parse().unwrap();
	assert_eq!(version, Version::new(7, 0, 0, 0));

	assert!("6.x".parse::<Version>().is_err());
}

#[test]
fn canonical_form_round_trips() {
	let version = Version::new(6, 2, 2105, 42);
	let text = version.to_string();
	assert_eq!(text, "v6.2.2105-42");
	assert_eq!(text.parse::<Version>().unwrap(), version);
}
