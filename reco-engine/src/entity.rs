// ---------------------------------------------------------------------------
// EntityRegistry — natural key <-> dense index mapping
// ---------------------------------------------------------------------------
//
// One append-only map per entity kind. Indices are handed out in first-seen
// order starting at the map's floor and are never reused or compacted. Every
// ingestion path (keyed training rows, onboarding, interaction events) goes
// through this type.
// ---------------------------------------------------------------------------

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::RecoError;
use crate::types::EntityKind;

// ---------------------------------------------------------------------------
// KeyMap
// ---------------------------------------------------------------------------

/// Bidirectional key/index map for a single entity kind.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeyMap {
	forward: HashMap<String, usize>,
	reverse: HashMap<usize, String>,
	/// Allocation order, kept so serialization is stable.
	order: Vec<String>,
	next: usize,
}

impl KeyMap {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn len(&self) -> usize {
		self.forward.len()
	}

	pub fn is_empty(&self) -> bool {
		self.forward.is_empty()
	}

	/// Next index that `get_or_create` would allocate.
	pub fn next_index(&self) -> usize {
		self.next
	}

	pub fn index_of(&self, key: &str) -> Option<usize> {
		self.forward.get(key).copied()
	}

	pub fn key_of(&self, index: usize) -> Option<&str> {
		self.reverse.get(&index).map(String::as_str)
	}

	/// Largest index bound to any key.
	pub fn max_index(&self) -> Option<usize> {
		self.reverse.keys().copied().max()
	}

	pub fn get_or_create(&mut self, key: &str) -> usize {
		if let Some(&index) = self.forward.get(key) {
			return index;
		}
		let index = self.next;
		self.record(key.to_string(), index);
		index
	}

	/// Bind `key` to `index` explicitly. Re-binding an identical pair is a no-op.
	pub fn bind(&mut self, key: &str, index: usize) -> Result<(), RecoError> {
		if let Some(&existing) = self.forward.get(key) {
			if existing == index {
				return Ok(());
			}
			return Err(RecoError::Duplicate(format!(
				"key '{}' is already bound to index {}, cannot bind to {}",
				key, existing, index
			)));
		}
		if let Some(owner) = self.reverse.get(&index) {
			return Err(RecoError::Duplicate(format!(
				"index {} is already bound to key '{}', cannot bind '{}'",
				index, owner, key
			)));
		}
		self.record(key.to_string(), index);
		Ok(())
	}

	/// Make every future allocation land at or above `floor`.
	pub fn raise_floor(&mut self, floor: usize) {
		self.next = self.next.max(floor);
	}

	/// Bindings in allocation order.
	pub fn entries(&self) -> impl Iterator<Item = (&str, usize)> + '_ {
		self.order
			.iter()
			.map(move |key| (key.as_str(), self.forward[key]))
	}

	fn record(&mut self, key: String, index: usize) {
		self.forward.insert(key.clone(), index);
		self.reverse.insert(index, key.clone());
		self.order.push(key);
		self.next = self.next.max(index + 1);
	}
}

// ---------------------------------------------------------------------------
// Serialized form
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyMapData {
	pub next: usize,
	pub entries: Vec<(String, usize)>,
}

impl From<&KeyMap> for KeyMapData {
	fn from(map: &KeyMap) -> Self {
		Self {
			next: map.next,
			entries: map.entries().map(|(k, i)| (k.to_string(), i)).collect(),
		}
	}
}

impl TryFrom<KeyMapData> for KeyMap {
	type Error = RecoError;

	fn try_from(data: KeyMapData) -> Result<Self, Self::Error> {
		let mut map = KeyMap::new();
		for (key, index) in &data.entries {
			map.bind(key, *index)?;
		}
		map.raise_floor(data.next);
		Ok(map)
	}
}

// ---------------------------------------------------------------------------
// EntityRegistry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityRegistry {
	users: KeyMap,
	items: KeyMap,
}

impl EntityRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn map(&self, kind: EntityKind) -> &KeyMap {
		match kind {
			EntityKind::User => &self.users,
			EntityKind::Item => &self.items,
		}
	}

	fn map_mut(&mut self, kind: EntityKind) -> &mut KeyMap {
		match kind {
			EntityKind::User => &mut self.users,
			EntityKind::Item => &mut self.items,
		}
	}

	pub fn get_or_create_index(&mut self, key: &str, kind: EntityKind) -> usize {
		let map = self.map_mut(kind);
		let before = map.len();
		let index = map.get_or_create(key);
		if map.len() > before {
			tracing::trace!(%kind, key, index, "Allocated index");
		}
		index
	}

	pub fn index_of(&self, key: &str, kind: EntityKind) -> Option<usize> {
		self.map(kind).index_of(key)
	}

	pub fn key_of(&self, index: usize, kind: EntityKind) -> Option<&str> {
		self.map(kind).key_of(index)
	}

	pub fn bind(&mut self, key: &str, kind: EntityKind, index: usize) -> Result<(), RecoError> {
		self.map_mut(kind).bind(key, index)
	}

	pub fn raise_floor(&mut self, kind: EntityKind, floor: usize) {
		self.map_mut(kind).raise_floor(floor);
	}

	/// Copy every `kind` binding of `other` into `self`, failing on the
	/// first key/index that disagrees.
	pub fn absorb(&mut self, other: &EntityRegistry, kind: EntityKind) -> Result<(), RecoError> {
		let source = other.map(kind);
		let target = self.map_mut(kind);
		for (key, index) in source.entries() {
			target.bind(key, index)?;
		}
		target.raise_floor(source.next_index());
		Ok(())
	}

	/// Drop every `kind` binding. Allocation keeps its floor.
	pub fn clear(&mut self, kind: EntityKind) {
		let map = self.map_mut(kind);
		let floor = map.next_index();
		*map = KeyMap::new();
		map.raise_floor(floor);
	}

	pub fn to_data(&self) -> RegistryData {
		RegistryData {
			users: KeyMapData::from(&self.users),
			items: KeyMapData::from(&self.items),
		}
	}

	pub fn from_data(data: RegistryData) -> Result<Self, RecoError> {
		Ok(Self {
			users: KeyMap::try_from(data.users)?,
			items: KeyMap::try_from(data.items)?,
		})
	}
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryData {
	pub users: KeyMapData,
	pub items: KeyMapData,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn allocates_in_first_seen_order() {
		let mut registry = EntityRegistry::new();
		let keys = ["alice", "bob", "carol", "dave"];
		for (expected, key) in keys.iter().enumerate() {
			assert_eq!(registry.get_or_create_index(key, EntityKind::User), expected);
		}
		// Repeated lookups return the original index.
		assert_eq!(registry.get_or_create_index("bob", EntityKind::User), 1);
		assert_eq!(registry.map(EntityKind::User).len(), 4);
	}

	#[test]
	fn kinds_are_independent() {
		let mut registry = EntityRegistry::new();
		assert_eq!(registry.get_or_create_index("x", EntityKind::User), 0);
		assert_eq!(registry.get_or_create_index("x", EntityKind::Item), 0);
		assert_eq!(registry.get_or_create_index("y", EntityKind::Item), 1);
		assert_eq!(registry.key_of(1, EntityKind::Item), Some("y"));
		assert_eq!(registry.key_of(1, EntityKind::User), None);
	}

	#[test]
	fn floor_seeds_allocation_above_existing_rows() {
		let mut registry = EntityRegistry::new();
		registry.raise_floor(EntityKind::User, 100);
		assert_eq!(registry.get_or_create_index("new-user", EntityKind::User), 100);
		assert_eq!(registry.get_or_create_index("other", EntityKind::User), 101);
		// Lowering is not possible.
		registry.raise_floor(EntityKind::User, 5);
		assert_eq!(registry.get_or_create_index("third", EntityKind::User), 102);
	}

	#[test]
	fn conflicting_bind_is_a_duplicate_error() {
		let mut registry = EntityRegistry::new();
		registry.bind("Heat", EntityKind::Item, 3).unwrap();
		registry.bind("Heat", EntityKind::Item, 3).unwrap();
		assert!(matches!(
			registry.bind("Heat", EntityKind::Item, 4),
			Err(RecoError::Duplicate(_))
		));
		assert!(matches!(
			registry.bind("Ronin", EntityKind::Item, 3),
			Err(RecoError::Duplicate(_))
		));
		// Allocation continues after the explicit binding.
		assert_eq!(registry.get_or_create_index("Ronin", EntityKind::Item), 4);
	}

	#[test]
	fn data_roundtrip_preserves_order_and_floor() {
		let mut registry = EntityRegistry::new();
		registry.raise_floor(EntityKind::User, 10);
		registry.get_or_create_index("u1", EntityKind::User);
		registry.get_or_create_index("i1", EntityKind::Item);
		registry.get_or_create_index("i2", EntityKind::Item);

		let json = serde_json::to_string(&registry.to_data()).unwrap();
		let data: RegistryData = serde_json::from_str(&json).unwrap();
		let restored = EntityRegistry::from_data(data).unwrap();

		assert_eq!(restored, registry);
		let items: Vec<_> = restored.map(EntityKind::Item).entries().collect();
		assert_eq!(items, vec![("i1", 0), ("i2", 1)]);
	}

	#[test]
	fn from_data_rejects_inconsistent_mappings() {
		let data = RegistryData {
			users: KeyMapData {
				next: 2,
				entries: vec![("a".into(), 0), ("b".into(), 0)],
			},
			items: KeyMapData::default(),
		};
		assert!(matches!(
			EntityRegistry::from_data(data),
			Err(RecoError::Duplicate(_))
		));
	}

	#[test]
	fn absorb_merges_and_detects_conflicts() {
		let mut base = EntityRegistry::new();
		base.get_or_create_index("Heat", EntityKind::Item);
		base.get_or_create_index("ann", EntityKind::User);
		let mut shared = EntityRegistry::new();
		shared.absorb(&base, EntityKind::Item).unwrap();
		assert_eq!(shared.index_of("Heat", EntityKind::Item), Some(0));
		assert!(shared.map(EntityKind::User).is_empty());

		let mut conflicting = EntityRegistry::new();
		conflicting.bind("Heat", EntityKind::Item, 7).unwrap();
		assert!(shared.absorb(&conflicting, EntityKind::Item).is_err());
	}

	#[test]
	fn clear_keeps_the_allocation_floor() {
		let mut registry = EntityRegistry::new();
		registry.get_or_create_index("ann", EntityKind::User);
		registry.get_or_create_index("ben", EntityKind::User);
		registry.get_or_create_index("Heat", EntityKind::Item);
		registry.clear(EntityKind::User);
		assert_eq!(registry.index_of("ann", EntityKind::User), None);
		assert_eq!(registry.index_of("Heat", EntityKind::Item), Some(0));
		assert_eq!(registry.get_or_create_index("ann", EntityKind::User), 2);
	}
}
