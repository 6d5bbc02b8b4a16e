use core::fmt::{self, Debug, Display};

use bilge::prelude::*;

#[bitsize(8)]
#[derive(FromBits)]
struct Bits {
	detail: u5,
	class: u3,
}

/// CoAP message code, conventionally written `c.dd` (3-bit class, 5-bit
/// detail).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Code(pub u8);

impl Code {
	pub const EMPTY: Code = Code::new(0, 0);

	pub const GET: Code = Code::new(0, 1);
	pub const POST: Code = Code::new(0, 2);
	pub const PUT: Code = Code::new(0, 3);
	pub const DELETE: Code = Code::new(0, 4);

	pub const CREATED: Code = Code::new(2, 1);
	pub const DELETED: Code = Code::new(2, 2);
	pub const VALID: Code = Code::new(2, 3);
	pub const CHANGED: Code = Code::new(2, 4);
	pub const CONTENT: Code = Code::new(2, 5);
	pub const CONTINUE: Code = Code::new(2, 31);

	pub const BAD_REQUEST: Code = Code::new(4, 0);
	pub const BAD_OPTION: Code = Code::new(4, 2);
	pub const NOT_FOUND: Code = Code::new(4, 4);
	pub const REQUEST_ENTITY_TOO_LARGE: Code = Code::new(4, 13);

	pub const INTERNAL_SERVER_ERROR: Code = Code::new(5, 0);

	pub const fn new(class: u8, detail: u8) -> Code {
		Code((class & 0x07) << 5 | (detail & 0x1f))
	}

	pub fn class(self) -> u8 {
		Bits::from(self.0).class().value()
	}

	pub fn detail(self) -> u8 {
		Bits::from(self.0).detail().value()
	}

	pub fn is_empty(self) -> bool {
		self == Code::EMPTY
	}

	/// Request codes have class 0 and a non-zero detail.
	pub fn is_request(self) -> bool {
		self.class() == 0 && !self.is_empty()
	}

	pub fn is_response(self) -> bool {
		matches!(self.class(), 2 | 4 | 5)
	}

	pub fn is_success(self) -> bool {
		self.class() == 2
	}
}

impl Display for Code {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}.{:02}", self.class(), self.detail())
	}
}

impl Debug for Code {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		<Self as Display>::fmt(self, f)
	}
}
