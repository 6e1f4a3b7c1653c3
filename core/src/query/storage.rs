//! The storage query: a multi-range, multi-group scan over one index.
//!
//! Ranges are visited in key order (reversed when descending), ids are
//! deduplicated across groups by a running set, rows of inactive shards
//! are skipped, and a page token positions the scan mid-range.

use crate::db::idgen;
use crate::err::Result;
use crate::key;
use crate::kvs::Cursor;
use crate::kvs::ShardId;
use crate::kvs::MAIN_SHARD;
use crate::query::plan::QueryPlan;
use radix_trie::Trie;
use std::collections::HashSet;

pub struct StorageQuery {
	plan: QueryPlan,
	cursor: Box<dyn Cursor>,
	group: usize,
	positioned: bool,
	seen: Trie<Vec<u8>, bool>,
	active_shards: Option<HashSet<ShardId>>,
	done: bool,
}

impl StorageQuery {
	/// `active_shards` of `None` admits every shard.
	pub fn new(plan: QueryPlan, cursor: Box<dyn Cursor>, active_shards: Option<HashSet<ShardId>>) -> StorageQuery {
		let group = if plan.desc {
			plan.ranges.len().saturating_sub(1)
		} else {
			0
		};
		let done = plan.ranges.is_empty();
		StorageQuery {
			plan,
			cursor,
			group,
			positioned: false,
			seen: Trie::new(),
			active_shards,
			done,
		}
	}

	pub fn group_count(&self) -> usize {
		self.plan.ranges.len()
	}

	pub fn plan(&self) -> &QueryPlan {
		&self.plan
	}

	/// The next matching `(id, group, entry-key)` triple.
	pub fn next(&mut self) -> Result<Option<(Vec<u8>, u32, Vec<u8>)>> {
		loop {
			if self.done {
				return Ok(None);
			}
			let range = self.plan.ranges[self.group].clone();
			let row = if self.positioned {
				if self.plan.desc {
					self.cursor.prev()?
				} else {
					self.cursor.next()?
				}
			} else {
				// a page token from a previous run overrides the start
				// position of the group that contains it
				if let Some(page) = self.plan.page.clone() {
					if !self.plan.desc && page.as_slice() >= range.end.as_slice() {
						// everything in this group went out already
						self.advance_group();
						continue;
					}
					if self.plan.desc && page.as_slice() < range.start.as_slice() {
						self.advance_group();
						continue;
					}
				}
				self.positioned = true;
				match (&self.plan.page, self.plan.desc) {
					(Some(page), false) if page.as_slice() > range.start.as_slice() => self.cursor.seek(page)?,
					(Some(page), true) if page.as_slice() < range.end.as_slice() => self.cursor.seek_back(page)?,
					(_, false) => self.cursor.seek(&range.start)?,
					(_, true) => self.cursor.seek_back(&range.end)?,
				}
			};
			let Some((entry, _)) = row else {
				if self.plan.desc {
					// backward scans fall off the low end one group at a time
					self.advance_group();
					continue;
				}
				self.done = true;
				return Ok(None);
			};
			// leaving the range means moving to the next group
			if entry.as_slice() >= range.end.as_slice() {
				if self.plan.desc {
					// seek_back can land above the range when it is empty
					self.advance_group();
					continue;
				}
				self.advance_group();
				continue;
			}
			if entry.as_slice() < range.start.as_slice() {
				self.advance_group();
				continue;
			}
			let id = key::entry_id(&entry, self.plan.index_prop_count)?.to_vec();
			// one id can appear in several groups; emit it once
			if self.seen.get(&id).is_some() {
				continue;
			}
			self.seen.insert(id.clone(), true);
			if let Some(active) = &self.active_shards {
				let shard = idgen::shard_of(&id);
				if shard != MAIN_SHARD && !active.contains(&shard) {
					continue;
				}
			}
			let group = self.group as u32;
			return Ok(Some((id, group, entry)));
		}
	}

	fn advance_group(&mut self) {
		self.positioned = false;
		if self.plan.desc {
			if self.group == 0 {
				self.done = true;
			} else {
				self.group -= 1;
			}
		} else {
			self.group += 1;
			if self.group >= self.plan.ranges.len() {
				self.done = true;
			}
		}
	}
}
