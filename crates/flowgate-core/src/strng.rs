//! Cheap, cloneable, immutable strings used pervasively for names and keys.

pub use arcstr::ArcStr;
/// `strng::format!` builds a `Strng` without an intermediate `String` allocation.
pub use arcstr::format;
/// `strng::literal!` produces a zero-cost static `Strng`.
pub use arcstr::literal;

pub type Strng = ArcStr;

pub fn new<A: AsRef<str>>(s: A) -> Strng {
	ArcStr::from(s.as_ref())
}
