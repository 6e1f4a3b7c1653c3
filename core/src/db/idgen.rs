//! Document id generation.
//!
//! An `_id` is the 8-hex-digit shard id followed by a 16-hex-digit
//! random tail; the main shard's prefix is all zeroes. Hex keeps the
//! byte order of ids equal to their numeric order, so every shard's
//! rows — the main shard included — form one contiguous run, a shard is
//! recoverable from any id in O(1), and a whole shard can be dropped by
//! prefix.

use crate::kvs::ShardId;
use crate::kvs::MAIN_SHARD;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::Rng;
use rand::SeedableRng;

/// Length of the shard prefix in characters.
const SHARD_LEN: usize = 8;

pub struct IdGenerator {
	rng: Mutex<StdRng>,
}

impl IdGenerator {
	pub fn new() -> Self {
		IdGenerator {
			rng: Mutex::new(StdRng::from_entropy()),
		}
	}

	/// A fresh id under the given shard prefix.
	pub fn id(&self, shard: ShardId) -> String {
		let tail: u64 = self.rng.lock().gen();
		format!("{shard:08x}{tail:016x}")
	}
}

impl Default for IdGenerator {
	fn default() -> Self {
		Self::new()
	}
}

/// Recover the shard prefix from an id. Internal rows with reserved,
/// non-hex ids belong to the main shard.
pub fn shard_of(id: &[u8]) -> ShardId {
	if id.len() < SHARD_LEN {
		return MAIN_SHARD;
	}
	match std::str::from_utf8(&id[..SHARD_LEN]).ok().and_then(|s| u32::from_str_radix(s, 16).ok()) {
		Some(shard) => shard,
		None => MAIN_SHARD,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn ids_carry_their_shard() {
		let ids = IdGenerator::new();
		let main = ids.id(MAIN_SHARD);
		assert!(main.starts_with("00000000"));
		assert_eq!(shard_of(main.as_bytes()), MAIN_SHARD);
		let sharded = ids.id(0x2a001122);
		assert!(sharded.starts_with("2a001122"));
		assert_eq!(shard_of(sharded.as_bytes()), 0x2a001122);
		assert_eq!(main.len(), sharded.len());
	}

	#[test]
	fn shard_rows_are_contiguous() {
		let ids = IdGenerator::new();
		let mut all: Vec<String> = Vec::new();
		for _ in 0..20 {
			all.push(ids.id(MAIN_SHARD));
			all.push(ids.id(0x2a001122));
		}
		all.sort();
		let shards: Vec<ShardId> = all.iter().map(|id| shard_of(id.as_bytes())).collect();
		// once sorted, each shard's ids form one unbroken run
		let mut runs = 1;
		for pair in shards.windows(2) {
			if pair[0] != pair[1] {
				runs += 1;
			}
		}
		assert_eq!(runs, 2);
	}

	#[test]
	fn reserved_ids_map_to_main() {
		assert_eq!(shard_of(b"_kinds/Contact:1"), MAIN_SHARD);
		assert_eq!(shard_of(b"x"), MAIN_SHARD);
	}
}
