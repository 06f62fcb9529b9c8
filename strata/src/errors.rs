use std::fmt::{Display, Formatter};

pub type Result<T> = std::result::Result<T, ArchiveError>;

#[derive(Debug)]
pub enum ArchiveError {
	/// A transfer met a dynamic type with no entry in the type registry,
	/// or a stream carried a type name the registry does not know.
	UnregisteredPolymorphic(String),
	/// A read sentinel required default construction of a type whose
	/// descriptor installs no constructor.
	NotDefaultConstructible(&'static str),
	/// No registered cast leads from the stored type to the requested base.
	CastFailure {
		type_name: String,
		target: &'static str,
	},
	IoError(std::io::Error),
	/// A token on the stream cannot be parsed in the current encoding,
	/// or the token sequence violates the reference protocol.
	FormatMismatch(String),
}

impl Display for ArchiveError {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::UnregisteredPolymorphic(name) => {
				write!(f, "polymorphic type `{name}` is not registered")
			},
			Self::NotDefaultConstructible(name) => {
				write!(f, "type `{name}` cannot be default-constructed")
			},
			Self::CastFailure { type_name, target } => {
				write!(f, "no registered cast from `{type_name}` to `{target}`")
			},
			Self::IoError(err) => err.fmt(f),
			Self::FormatMismatch(token) => write!(f, "malformed stream: {token}"),
		}
	}
}

impl std::error::Error for ArchiveError {
	fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
		match self {
			Self::IoError(err) => Some(err),
			_ => None,
		}
	}
}

impl From<std::io::Error> for ArchiveError {
	fn from(value: std::io::Error) -> Self {
		Self::IoError(value)
	}
}
