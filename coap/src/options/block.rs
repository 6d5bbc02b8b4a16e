use log::warn;

use super::{BLOCK1, BLOCK2};
use crate::error::Error;

/// Which of the two block-transfer options this value belongs to: Block1
/// fragments request payloads, Block2 fragments response payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
	Block1,
	Block2,
}

impl BlockKind {
	pub fn number(self) -> u16 {
		match self {
			BlockKind::Block1 => BLOCK1,
			BlockKind::Block2 => BLOCK2,
		}
	}
}

/// Decoded Block1/Block2 option. `size` is always a power of two in
/// 16..=1024; SZX=7 (BERT) is rejected on both encode and decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockOption {
	pub kind: BlockKind,
	pub seq_num: u32,
	pub size: u16,
	pub has_more: bool,
}

pub const MAX_SEQ_NUM: u32 = (1 << 20) - 1;
pub const MIN_SIZE: u16 = 16;
pub const MAX_SIZE: u16 = 1024;

fn size_to_szx(size: u16) -> Option<u8> {
	if !(MIN_SIZE..=MAX_SIZE).contains(&size) || !size.is_power_of_two() {
		return None;
	}

	Some((size.trailing_zeros() - 4) as u8)
}

impl BlockOption {
	pub fn new(kind: BlockKind, seq_num: u32, size: u16, has_more: bool) -> Result<BlockOption, Error> {
		if seq_num > MAX_SEQ_NUM {
			warn!("block seq number {seq_num} exceeds 20 bits");
			return Err(Error::InvalidBlockOption);
		}

		if size_to_szx(size).is_none() {
			warn!("{size} is not a valid block size");
			return Err(Error::InvalidBlockOption);
		}

		Ok(BlockOption { kind, seq_num, size, has_more })
	}

	/// Byte offset of the first payload byte covered by this block.
	pub fn offset(&self) -> usize {
		self.seq_num as usize * self.size as usize
	}

	pub(crate) fn from_value(kind: BlockKind, value: &[u8]) -> Result<BlockOption, Error> {
		if value.len() > 3 {
			warn!("block option value of {} bytes", value.len());
			return Err(Error::InvalidBlockOption);
		}

		let raw = value.iter().fold(0u32, |acc, b| acc << 8 | *b as u32);

		let szx = (raw & 0x07) as u8;
		if szx == 7 {
			warn!("BERT block size is not supported over plain UDP");
			return Err(Error::InvalidBlockOption);
		}

		Ok(BlockOption {
			kind,
			seq_num: raw >> 4,
			size: 1 << (szx + 4),
			has_more: raw & 0x08 != 0,
		})
	}

	pub(crate) fn to_value(&self) -> ([u8; 3], usize) {
		// new() guarantees the size maps to a valid SZX.
		let szx = size_to_szx(self.size).unwrap_or(0) as u32;
		let raw = self.seq_num << 4 | (self.has_more as u32) << 3 | szx;

		let len = match raw {
			0 => 0,
			1..=0xff => 1,
			0x100..=0xffff => 2,
			_ => 3,
		};

		let bytes = raw.to_be_bytes();
		let mut out = [0; 3];
		out[..len].copy_from_slice(&bytes[4 - len..]);

		(out, len)
	}
}
