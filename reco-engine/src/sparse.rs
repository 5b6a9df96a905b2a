// ---------------------------------------------------------------------------
// Sparse observed-interaction set
// ---------------------------------------------------------------------------
//
// Stores each observed (user, item, weight) twice: once in the user's row
// and once in the item's column, so both half-passes of the solver can walk
// their neighbours without scanning the whole set.
// ---------------------------------------------------------------------------

use crate::error::RecoError;
use crate::types::Interaction;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct InteractionSet {
	by_user: Vec<Vec<(usize, f64)>>,
	by_item: Vec<Vec<(usize, f64)>>,
	len: usize,
}

impl InteractionSet {
	pub fn with_shape(users: usize, items: usize) -> Self {
		Self {
			by_user: vec![Vec::new(); users],
			by_item: vec![Vec::new(); items],
			len: 0,
		}
	}

	/// Build from a list, sized to the observed id extents. Duplicate pairs
	/// accumulate their weights.
	pub fn from_interactions(interactions: &[Interaction]) -> Result<Self, RecoError> {
		if interactions.is_empty() {
			return Err(RecoError::Data("interaction set is empty".into()));
		}
		let mut users = 0;
		let mut items = 0;
		for (row, interaction) in interactions.iter().enumerate() {
			if !interaction.weight.is_finite() || interaction.weight <= 0.0 {
				return Err(RecoError::Data(format!(
					"interaction {} has invalid weight {}",
					row, interaction.weight
				)));
			}
			let (Some(user_rows), Some(item_rows)) =
				(interaction.user.checked_add(1), interaction.item.checked_add(1))
			else {
				return Err(RecoError::Data(format!("interaction {} has an unaddressable index", row)));
			};
			users = users.max(user_rows);
			items = items.max(item_rows);
		}

		let mut set = Self::with_shape(users, items);
		for interaction in interactions {
			set.accumulate(interaction.user, interaction.item, interaction.weight);
		}
		for row in set.by_user.iter_mut().chain(set.by_item.iter_mut()) {
			row.sort_by_key(|&(index, _)| index);
		}
		Ok(set)
	}

	pub fn len(&self) -> usize {
		self.len
	}

	pub fn is_empty(&self) -> bool {
		self.len == 0
	}

	pub fn users(&self) -> usize {
		self.by_user.len()
	}

	pub fn items(&self) -> usize {
		self.by_item.len()
	}

	pub fn user_row(&self, user: usize) -> &[(usize, f64)] {
		self.by_user.get(user).map(Vec::as_slice).unwrap_or(&[])
	}

	pub fn item_column(&self, item: usize) -> &[(usize, f64)] {
		self.by_item.get(item).map(Vec::as_slice).unwrap_or(&[])
	}

	pub fn weight(&self, user: usize, item: usize) -> Option<f64> {
		self.user_row(user)
			.iter()
			.find(|&&(i, _)| i == item)
			.map(|&(_, w)| w)
	}

	/// Number of users that interacted with each item.
	pub fn item_popularity(&self) -> Vec<usize> {
		self.by_item.iter().map(Vec::len).collect()
	}

	pub fn grow(&mut self, users: usize, items: usize) {
		if users > self.by_user.len() {
			self.by_user.resize(users, Vec::new());
		}
		if items > self.by_item.len() {
			self.by_item.resize(items, Vec::new());
		}
	}

	/// Record a pair, replacing the weight if it is already present.
	/// The caller must have grown the set to cover both indices.
	pub fn upsert(&mut self, user: usize, item: usize, weight: f64) {
		let user_row = &mut self.by_user[user];
		match user_row.iter_mut().find(|(i, _)| *i == item) {
			Some(entry) => {
				entry.1 = weight;
				if let Some(col) = self.by_item[item].iter_mut().find(|(u, _)| *u == user) {
					col.1 = weight;
				}
			}
			None => {
				user_row.push((item, weight));
				self.by_item[item].push((user, weight));
				self.len += 1;
			}
		}
	}

	/// Flattened `(user, item, weight)` triples in user-major order.
	pub fn to_triples(&self) -> Vec<Interaction> {
		self.by_user
			.iter()
			.enumerate()
			.flat_map(|(user, row)| {
				row.iter()
					.map(move |&(item, weight)| Interaction::new(user, item, weight))
			})
			.collect()
	}

	fn accumulate(&mut self, user: usize, item: usize, weight: f64) {
		let user_row = &mut self.by_user[user];
		match user_row.iter_mut().find(|(i, _)| *i == item) {
			Some(entry) => {
				entry.1 += weight;
				if let Some(col) = self.by_item[item].iter_mut().find(|(u, _)| *u == user) {
					col.1 += weight;
				}
			}
			None => {
				user_row.push((item, weight));
				self.by_item[item].push((user, weight));
				self.len += 1;
			}
		}
	}
}
