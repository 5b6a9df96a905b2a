// ---------------------------------------------------------------------------
// Onboarding — derive a tenant model from a base model plus an upload
// ---------------------------------------------------------------------------
//
// A batch of `{ userKey, itemTitle }` rows is resolved against the shared
// key maps (titles -> item indices above the base catalog, user keys ->
// user indices above the base user rows), the base model is cloned and grown
// to cover every allocated index, and each row is folded in with the online
// updater. The base model is only ever read.
//
// Uploaded user keys live in their own namespace. A key equal to one of the
// base model's user keys still gets a fresh row above the base rows, and the
// tenant clone drops the base user keys so the two never meet.
// ---------------------------------------------------------------------------

use crate::entity::EntityRegistry;
use crate::error::RecoError;
use crate::model::Model;
use crate::online::OnlineUpdater;
use crate::types::{DatasetRow, EntityKind, OnboardingReport, RowFailure};

/// Everything a completed batch produces. Nothing is persisted yet.
#[derive(Debug)]
pub struct Onboarded {
	pub model: Model,
	/// Shared maps including this batch's allocations.
	pub shared_maps: EntityRegistry,
	pub report: OnboardingReport,
}

/// Initial shared maps for a base model: its item bindings plus catalog
/// titles for item rows the base registry does not name. The user map starts
/// empty, floored at the base user rows.
pub fn seed_shared_maps(base: &Model, titles: &[(String, usize)]) -> Result<EntityRegistry, RecoError> {
	let mut maps = EntityRegistry::new();
	maps.absorb(base.registry(), EntityKind::Item)?;
	maps.raise_floor(EntityKind::User, base.store().user_count());
	for (title, index) in titles {
		let free = maps.index_of(title, EntityKind::Item).is_none()
			&& maps.key_of(*index, EntityKind::Item).is_none();
		if free {
			maps.bind(title, EntityKind::Item, *index)?;
		}
	}
	Ok(maps)
}

struct ResolvedRow {
	row: usize,
	user: usize,
	item: usize,
}

pub fn onboard(
	base: &Model,
	shared_maps: &EntityRegistry,
	rows: &[DatasetRow],
	dataset_name: &str,
	tenant_id: &str,
	max_rows: usize,
) -> Result<Onboarded, RecoError> {
	if rows.is_empty() {
		return Err(RecoError::Data("dataset has no rows".into()));
	}
	if rows.len() > max_rows {
		return Err(RecoError::Data(format!(
			"dataset has {} rows, the limit is {}",
			rows.len(),
			max_rows
		)));
	}

	let base_users = base.store().user_count();
	let base_items = base.store().item_count();
	let mut maps = shared_maps.clone();
	maps.raise_floor(EntityKind::User, base_users);
	maps.raise_floor(EntityKind::Item, base_items);

	let mut failures = Vec::new();
	let mut resolved = Vec::with_capacity(rows.len());
	let mut new_users: Vec<usize> = Vec::new();
	let mut new_items = 0;

	for (row, data) in rows.iter().enumerate() {
		let user_key = data.user_key.trim();
		let title = data.item_title.as_deref().map(str::trim).unwrap_or("");
		if user_key.is_empty() {
			failures.push(RowFailure {
				row,
				reason: "missing user key".into(),
			});
			continue;
		}
		if title.is_empty() {
			failures.push(RowFailure {
				row,
				reason: "missing item title".into(),
			});
			continue;
		}

		let known_item = maps.index_of(title, EntityKind::Item).is_some();
		let item = maps.get_or_create_index(title, EntityKind::Item);
		if !known_item {
			new_items += 1;
		}
		let known_user = maps.index_of(user_key, EntityKind::User).is_some();
		let user = maps.get_or_create_index(user_key, EntityKind::User);
		if !known_user {
			new_users.push(user);
		}
		resolved.push(ResolvedRow { row, user, item });
	}

	let mut model = base.clone().with_tenant(tenant_id);
	model.forget_keys(EntityKind::User);
	if let Some(max_user) = resolved.iter().map(|r| r.user).max() {
		model.store_mut().ensure_user_capacity(max_user);
	}
	if let Some(max_item) = resolved.iter().map(|r| r.item).max() {
		model.store_mut().ensure_item_capacity(max_item);
	}

	let mut applied = 0;
	for entry in &resolved {
		let data = &rows[entry.row];
		let outcome = bind_row(&mut model, data, entry, base_items)
			.and_then(|()| OnlineUpdater::update(model.store_mut(), entry.user, entry.item));
		match outcome {
			Ok(()) => applied += 1,
			Err(e) => failures.push(RowFailure {
				row: entry.row,
				reason: e.to_string(),
			}),
		}
	}
	failures.sort_by_key(|f| f.row);

	let assigned_user_range = new_users
		.iter()
		.min()
		.zip(new_users.iter().max())
		.map(|(&lo, &hi)| (lo, hi));

	tracing::info!(
		tenant = tenant_id,
		dataset = dataset_name,
		rows = rows.len(),
		applied,
		failed = failures.len(),
		new_users = new_users.len(),
		new_items,
		"Onboarded dataset"
	);

	Ok(Onboarded {
		model,
		shared_maps: maps,
		report: OnboardingReport {
			tenant_id: tenant_id.to_string(),
			assigned_user_range,
			new_users: new_users.len(),
			new_items,
			applied,
			failures,
		},
	})
}

/// Record the row's keys in the clone. Base-catalog items keep their index as
/// catalog id, so only titles above the base catalog are bound.
fn bind_row(
	model: &mut Model,
	data: &DatasetRow,
	entry: &ResolvedRow,
	base_items: usize,
) -> Result<(), RecoError> {
	model.bind(data.user_key.trim(), EntityKind::User, entry.user)?;
	if entry.item >= base_items {
		if let Some(title) = data.item_title.as_deref() {
			model.bind(title.trim(), EntityKind::Item, entry.item)?;
		}
	}
	Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;
	use crate::trainer::CancelToken;
	use crate::types::{Hyperparameters, Interaction, KeyedInteraction};

	fn base() -> Model {
		let hyper = Hyperparameters {
			factors: 4,
			iterations: 5,
			w0: 1.0,
			init_stdev: 0.1,
			..Default::default()
		};
		let interactions = [
			Interaction::new(0, 0, 1.0),
			Interaction::new(0, 1, 1.0),
			Interaction::new(1, 1, 1.0),
			Interaction::new(1, 2, 1.0),
		];
		Model::train("base", hyper, &interactions, &CancelToken::new())
			.unwrap()
			.0
	}

	fn row(user: &str, title: Option<&str>) -> DatasetRow {
		DatasetRow {
			user_key: user.into(),
			item_title: title.map(str::to_string),
		}
	}

	fn titles() -> Vec<(String, usize)> {
		vec![("Heat".into(), 0), ("Ronin".into(), 1), ("Alien".into(), 2)]
	}

	#[test]
	fn extends_clone_and_leaves_base_alone() {
		let base = base();
		let before_users = base.store().user_factors().clone();
		let before_items = base.store().item_factors().clone();
		let maps = seed_shared_maps(&base, &titles()).unwrap();

		let rows = [
			row("alice", Some("Heat")),
			row("alice", Some(" Inception ")),
			row("bob", Some("Inception")),
		];
		let done = onboard(&base, &maps, &rows, "shop.tsv", "tenant-1", 100).unwrap();

		assert_eq!(base.store().user_factors(), &before_users);
		assert_eq!(base.store().item_factors(), &before_items);
		assert_eq!(base.store().user_count(), 2);

		let report = &done.report;
		assert_eq!(report.tenant_id, "tenant-1");
		assert_eq!(report.assigned_user_range, Some((2, 3)));
		assert_eq!(report.new_users, 2);
		assert_eq!(report.new_items, 1);
		assert_eq!(report.applied, 3);
		assert!(report.failures.is_empty());

		let model = &done.model;
		assert_eq!(model.tenant_id(), "tenant-1");
		assert_eq!(model.store().user_count(), 4);
		assert_eq!(model.store().item_count(), 4);
		assert_eq!(model.resolve("bob", EntityKind::User).unwrap(), 3);
		assert_eq!(model.resolve("Inception", EntityKind::Item).unwrap(), 3);
		assert_eq!(model.item_catalog_id(0), "0");
		assert_eq!(model.store().interactions().weight(2, 0), Some(1.0));
		assert_eq!(done.shared_maps.index_of("Inception", EntityKind::Item), Some(3));
	}

	#[test]
	fn uploaded_users_never_reuse_base_rows() {
		let hyper = Hyperparameters {
			factors: 4,
			iterations: 5,
			w0: 1.0,
			init_stdev: 0.1,
			..Default::default()
		};
		let rows = [("1", "Heat"), ("1", "Ronin"), ("2", "Ronin"), ("2", "Alien")]
			.iter()
			.map(|(u, i)| KeyedInteraction {
				user_key: u.to_string(),
				item_key: i.to_string(),
				weight: None,
			})
			.collect::<Vec<_>>();
		let (base, _) = Model::train_keyed("base", hyper, &rows, &CancelToken::new()).unwrap();
		let before = base.store().user_factors().row(0).to_vec();

		let maps = seed_shared_maps(&base, &titles()).unwrap();
		assert_eq!(maps.index_of("1", EntityKind::User), None);
		let done = onboard(&base, &maps, &[row("1", Some("Heat"))], "shop.tsv", "tenant-1", 10).unwrap();

		assert_eq!(done.report.new_users, 1);
		assert_eq!(done.report.assigned_user_range, Some((2, 2)));
		assert_eq!(done.report.applied, 1);
		assert_eq!(done.model.resolve("1", EntityKind::User).unwrap(), 2);
		assert!(done.model.resolve("2", EntityKind::User).is_err());
		assert_eq!(done.model.store().user_factors().row(0), before.as_slice());
		assert_eq!(done.model.store().interactions().weight(2, 0), Some(1.0));
		assert_eq!(base.resolve("1", EntityKind::User).unwrap(), 0);
	}

	#[test]
	fn bad_rows_are_reported_not_skipped() {
		let base = base();
		let maps = seed_shared_maps(&base, &titles()).unwrap();
		let rows = [
			row("alice", Some("Heat")),
			row("", Some("Heat")),
			row("carol", None),
			row("dave", Some("   ")),
		];
		let done = onboard(&base, &maps, &rows, "shop.tsv", "tenant-1", 100).unwrap();
		assert_eq!(done.report.applied, 1);
		let failed: Vec<usize> = done.report.failures.iter().map(|f| f.row).collect();
		assert_eq!(failed, vec![1, 2, 3]);
		assert_eq!(done.report.assigned_user_range, Some((2, 2)));
	}

	#[test]
	fn second_batch_continues_allocation() {
		let base = base();
		let maps = seed_shared_maps(&base, &titles()).unwrap();
		let first = onboard(&base, &maps, &[row("alice", Some("Heat"))], "a", "tenant-1", 10).unwrap();
		let second = onboard(
			&base,
			&first.shared_maps,
			&[row("erin", Some("Heat")), row("alice", Some("Ronin"))],
			"b",
			"tenant-2",
			10,
		)
		.unwrap();
		assert_eq!(second.report.assigned_user_range, Some((3, 3)));
		assert_eq!(second.report.new_users, 1);
		assert_eq!(second.model.store().user_count(), 4);
		assert_eq!(second.model.resolve("alice", EntityKind::User).unwrap(), 2);
	}

	#[test]
	fn batch_bounds_are_enforced() {
		let base = base();
		let maps = seed_shared_maps(&base, &titles()).unwrap();
		assert!(matches!(
			onboard(&base, &maps, &[], "a", "tenant-1", 10),
			Err(RecoError::Data(_))
		));
		let rows = vec![row("u", Some("Heat")); 3];
		assert!(matches!(
			onboard(&base, &maps, &rows, "a", "tenant-1", 2),
			Err(RecoError::Data(_))
		));
	}

	#[test]
	fn seeding_skips_conflicting_titles() {
		let base = base();
		let titles = vec![("Heat".into(), 0), ("Heat".into(), 1), ("Other".into(), 0)];
		let maps = seed_shared_maps(&base, &titles).unwrap();
		assert_eq!(maps.index_of("Heat", EntityKind::Item), Some(0));
		assert_eq!(maps.index_of("Other", EntityKind::Item), None);
		assert_eq!(maps.key_of(1, EntityKind::Item), None);
	}
}
