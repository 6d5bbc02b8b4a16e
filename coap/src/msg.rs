//! UDP frame codec: 4-byte header, token, options, payload marker.

use bilge::prelude::*;
use log::warn;

use crate::code::Code;
use crate::error::Error;
use crate::options::{self, OptionsView};
use crate::token::Token;

/// UDP message type from the header's two type bits.
#[bitsize(2)]
#[derive(FromBits, PartialEq, Eq, Clone, Copy, Debug)]
pub enum Kind {
	Confirmable = 0,
	NonConfirmable = 1,
	Acknowledgement = 2,
	Reset = 3,
}

#[bitsize(8)]
#[derive(FromBits)]
struct Meta {
	token_len: u4,
	kind: Kind,
	version: u2,
}

pub const HEADER_LEN: usize = 4;
pub const PAYLOAD_MARKER: u8 = 0xff;

const VERSION: u8 = 1;

/// Decoded view of one incoming datagram, borrowing the receive buffer.
pub struct Msg<'a> {
	pub kind: Kind,
	pub code: Code,
	pub msg_id: u16,
	pub token: Token,
	pub options: OptionsView<'a>,
	pub payload: &'a [u8],
}

/// Header and token of a datagram, without looking at the options region.
/// Used to attribute malformed or truncated datagrams to an exchange.
pub struct Head {
	pub kind: Kind,
	pub code: Code,
	pub msg_id: u16,
	pub token: Token,
}

/// Checks the constraints a code puts on the message shape: Empty messages
/// are exactly four header bytes, ACKs never carry request codes, Resets
/// are always Empty.
fn check_shape(kind: Kind, code: Code, token: &Token, rest_len: usize) -> Result<(), Error> {
	if code.is_empty() {
		if !token.is_empty() || rest_len != 0 {
			warn!("Empty message with token, options or payload");
			return Err(Error::Malformed);
		}

		return Ok(());
	}

	match kind {
		Kind::Acknowledgement if !code.is_response() => {
			warn!("ACK with non-response code {code}");
			Err(Error::Malformed)
		}
		Kind::Reset => {
			warn!("Reset with non-Empty code {code}");
			Err(Error::Malformed)
		}
		_ => Ok(()),
	}
}

fn parse_head(data: &[u8]) -> Result<(Head, &[u8]), Error> {
	if data.len() < HEADER_LEN {
		warn!("datagram of {} bytes is shorter than a header", data.len());
		return Err(Error::Malformed);
	}

	let meta = Meta::from(data[0]);

	if meta.version().value() != VERSION {
		warn!("unsupported protocol version {}", meta.version().value());
		return Err(Error::Malformed);
	}

	let token_len = meta.token_len().value() as usize;

	if token_len > Token::MAX_LEN {
		warn!("reserved token length {token_len}");
		return Err(Error::Malformed);
	}

	let token_bytes = data.get(HEADER_LEN..HEADER_LEN + token_len).ok_or_else(|| {
		warn!("datagram too short for its token");
		Error::Malformed
	})?;

	let head = Head {
		kind: meta.kind(),
		code: Code(data[1]),
		msg_id: u16::from_be_bytes([data[2], data[3]]),
		// Length was checked against MAX_LEN above.
		token: Token::new(token_bytes).ok_or(Error::Malformed)?,
	};

	let rest = &data[HEADER_LEN + token_len..];

	check_shape(head.kind, head.code, &head.token, rest.len())?;

	Ok((head, rest))
}

/// Strict parse of a whole datagram.
pub fn parse(data: &[u8]) -> Result<Msg<'_>, Error> {
	let (head, rest) = parse_head(data)?;
	let (opts, payload) = options::split_options(rest)?;

	Ok(Msg {
		kind: head.kind,
		code: head.code,
		msg_id: head.msg_id,
		token: head.token,
		options: OptionsView::new(opts),
		payload,
	})
}

/// Best-effort parse of header and token only. Used when the full parse
/// failed (broken options) or the datagram arrived truncated, to decide
/// whether some exchange should be failed or answered.
pub fn parse_head_only(data: &[u8]) -> Option<Head> {
	parse_head(data).ok().map(|(head, _)| head)
}

/// Serializes one message into `out`, returning the number of bytes
/// written. `options` is the pre-encoded option sequence.
pub fn serialize(
	kind: Kind,
	code: Code,
	msg_id: u16,
	token: &Token,
	options: &[u8],
	payload: &[u8],
	out: &mut [u8],
) -> Result<usize, Error> {
	let marker_len = if payload.is_empty() { 0 } else { 1 };
	let total = HEADER_LEN + token.len() + options.len() + marker_len + payload.len();

	if out.len() < total {
		warn!("output buffer of {} bytes cannot hold a {total}-byte message", out.len());
		return Err(Error::BufferTooSmall);
	}

	let meta = Meta::new(
		u4::new(token.len() as u8),
		kind,
		u2::new(VERSION),
	);

	out[0] = meta.into();
	out[1] = code.0;
	out[2..4].copy_from_slice(&msg_id.to_be_bytes());

	let mut pos = HEADER_LEN;

	out[pos..pos + token.len()].copy_from_slice(token.as_bytes());
	pos += token.len();

	out[pos..pos + options.len()].copy_from_slice(options);
	pos += options.len();

	if !payload.is_empty() {
		out[pos] = PAYLOAD_MARKER;
		pos += 1;
		out[pos..pos + payload.len()].copy_from_slice(payload);
		pos += payload.len();
	}

	Ok(pos)
}
