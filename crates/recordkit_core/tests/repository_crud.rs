use recordkit_core::{
    AttributeDescriptor, AttributeType, ContextRegistry, EntitySchema, EntityState,
    EntityRepository, FetchRequest, Model, Predicate, RepoError, SchemaError, Store, StoreConfig,
    StoreError, StoreManager, Value,
};
use std::sync::Arc;

fn model() -> Model {
    Model::new("Model").with_entity(
        EntitySchema::new("Item")
            .with_attribute(AttributeDescriptor::new("name", AttributeType::Text))
            .with_attribute(AttributeDescriptor::new("rank", AttributeType::Integer))
            .with_attribute(AttributeDescriptor::new("score", AttributeType::Real)),
    )
}

fn registry() -> ContextRegistry {
    ContextRegistry::new(Store::open_in_memory(model()).unwrap())
}

fn items(store: &Arc<Store>) -> EntityRepository {
    store.repository("Item").unwrap()
}

fn seed(registry: &ContextRegistry, rows: &[(&str, i64)]) {
    let repo = items(registry.store());
    let ctx = registry.new_background_context();
    for (name, rank) in rows {
        let item = repo.create(&ctx).unwrap();
        item.set("name", *name).unwrap();
        item.set("rank", *rank).unwrap();
    }
    ctx.save().unwrap();
}

#[test]
fn configured_store_create_find_delete_scenario() {
    let dir = tempfile::tempdir().unwrap();
    let manager = StoreManager::new();
    manager.configure(
        StoreConfig::new("Model", "data.db")
            .with_data_dir(dir.path())
            .with_model(model()),
    );

    let store = manager.store().unwrap();
    assert_eq!(store.path(), Some(dir.path().join("data.db").as_path()));
    let ctx = manager.current_context().unwrap();
    assert!(ctx.is_main());
    let repo = items(&store);

    let created = repo.create(&ctx).unwrap();
    created.set("name", "a").unwrap();
    ctx.save().unwrap();

    let found = repo
        .find_first(&Predicate::eq("name", "a"), &ctx)
        .unwrap()
        .unwrap();
    assert!(found.ptr_eq(&created));

    assert_eq!(repo.delete_all(&Predicate::eq("name", "a"), &ctx).unwrap(), 1);
    assert!(created.is_deleted());
    assert!(repo
        .find_first(&Predicate::eq("name", "a"), &ctx)
        .unwrap()
        .is_none());
}

#[test]
fn saved_entity_refetched_in_other_context_has_equal_attributes() {
    let registry = registry();
    let repo = items(registry.store());
    let writer = registry.new_background_context();

    let created = repo.create(&writer).unwrap();
    created.set("name", "pen").unwrap();
    created.set("rank", 3).unwrap();
    created.set("score", 2).unwrap();
    writer.save().unwrap();
    assert_eq!(created.state(), EntityState::Saved);

    let reader = registry.new_background_context();
    let loaded = repo.find_by_id(created.id(), &reader).unwrap().unwrap();
    assert!(!loaded.ptr_eq(&created));
    assert_eq!(loaded.context_id(), reader.id());
    assert_eq!(loaded.attributes(), created.attributes());
    assert_eq!(loaded.get("score"), Some(Value::Real(2.0)));
}

#[test]
fn count_matches_find_all_with_pending_changes() {
    let registry = registry();
    seed(&registry, &[("a", 1), ("b", 2), ("c", 3)]);
    let repo = items(registry.store());
    let ctx = registry.main_context();

    let predicates = [
        Predicate::True,
        Predicate::ge("rank", 2),
        Predicate::contains("name", "a"),
        Predicate::is_null("score"),
        !Predicate::eq("name", "b"),
    ];
    let check = |label: &str| {
        for predicate in &predicates {
            let count = repo.count(predicate, &ctx).unwrap();
            let all = repo.find_all(predicate, &ctx).unwrap();
            assert_eq!(count, all.len(), "{label}: {predicate:?}");
        }
    };

    check("clean");

    let pending = repo.create(&ctx).unwrap();
    pending.set("name", "aa").unwrap();
    pending.set("rank", 9).unwrap();
    let b = repo.find_first_by("name", "b", &ctx).unwrap().unwrap();
    b.set("rank", 0).unwrap();
    check("pending");

    assert_eq!(repo.count(&Predicate::ge("rank", 2), &ctx).unwrap(), 2);
    ctx.save().unwrap();
    check("saved");
}

#[test]
fn find_all_sorted_is_monotonic_in_both_directions() {
    let registry = registry();
    seed(&registry, &[("d", 4), ("a", 1), ("c", 3), ("b", 2), ("b2", 2)]);
    let repo = items(registry.store());
    let ctx = registry.main_context();
    let pending = repo.create(&ctx).unwrap();
    pending.set("name", "e").unwrap();
    pending.set("rank", 0).unwrap();

    let ranks = |ascending: bool| -> Vec<i64> {
        repo.find_all_sorted("rank", ascending, &ctx)
            .unwrap()
            .iter()
            .map(|item| item.get("rank").and_then(|value| value.as_i64()).unwrap())
            .collect()
    };

    let ascending = ranks(true);
    assert_eq!(ascending.len(), 6);
    assert!(ascending.windows(2).all(|pair| pair[0] <= pair[1]));
    let descending = ranks(false);
    assert!(descending.windows(2).all(|pair| pair[0] >= pair[1]));
}

#[test]
fn fetch_applies_limit_after_merging_pending_entities() {
    let registry = registry();
    seed(&registry, &[("a", 5), ("b", 6)]);
    let repo = items(registry.store());
    let ctx = registry.main_context();
    let pending = repo.create(&ctx).unwrap();
    pending.set("name", "z").unwrap();
    pending.set("rank", 1).unwrap();

    let top = repo
        .fetch(&FetchRequest::new().sorted_by("rank", true).limit(2), &ctx)
        .unwrap();
    assert_eq!(top.len(), 2);
    assert!(top[0].ptr_eq(&pending));
    assert_eq!(top[1].get("name"), Some(Value::from("a")));
}

#[test]
fn find_first_or_create_is_idempotent_before_save() {
    let registry = registry();
    let repo = items(registry.store());
    let ctx = registry.main_context();

    let first = repo.find_first_or_create("name", "X", &ctx).unwrap();
    let second = repo.find_first_or_create("name", "X", &ctx).unwrap();
    assert!(first.ptr_eq(&second));
    assert_eq!(first.state(), EntityState::Unsaved);
    assert_eq!(first.get("name"), Some(Value::from("X")));

    ctx.save().unwrap();
    let third = repo.find_first_or_create("name", "X", &ctx).unwrap();
    assert!(third.ptr_eq(&first));
    assert_eq!(repo.find_all_by("name", "X", &ctx).unwrap().len(), 1);
}

#[test]
fn find_first_or_create_with_null_matches_unset_attribute() {
    let registry = registry();
    let repo = items(registry.store());
    let ctx = registry.main_context();

    let first = repo.find_first_or_create("name", Value::Null, &ctx).unwrap();
    let second = repo.find_first_or_create("name", Value::Null, &ctx).unwrap();
    assert!(first.ptr_eq(&second));
    assert_eq!(repo.count(&Predicate::True, &ctx).unwrap(), 1);

    ctx.save().unwrap();
    let third = repo.find_first_or_create("name", Value::Null, &ctx).unwrap();
    assert!(third.ptr_eq(&first));
    assert_eq!(repo.find_all_by("name", Value::Null, &ctx).unwrap().len(), 1);

    seed(&registry, &[("named", 1)]);
    assert!(repo
        .find_first_by("name", Value::Null, &ctx)
        .unwrap()
        .unwrap()
        .ptr_eq(&first));
}

#[test]
fn released_clean_entities_leave_the_identity_map() {
    let registry = registry();
    let rows: Vec<(String, i64)> = (0..200).map(|n| (format!("item-{n}"), n)).collect();
    let rows: Vec<(&str, i64)> = rows.iter().map(|(name, n)| (name.as_str(), *n)).collect();
    seed(&registry, &rows);
    let repo = items(registry.store());
    let ctx = registry.main_context();

    let all = repo.find_all(&Predicate::True, &ctx).unwrap();
    assert_eq!(all.len(), 200);
    assert_eq!(ctx.registered_count(), 200);

    let edited = all[0].id();
    all[0].set("rank", 999).unwrap();
    let kept = all[1].clone();
    drop(all);
    assert_eq!(ctx.registered_count(), 2);
    assert!(ctx.registered(edited).is_some());
    assert!(ctx.registered(kept.id()).unwrap().ptr_eq(&kept));

    ctx.save().unwrap();
    drop(kept);
    assert_eq!(ctx.registered_count(), 0);
    assert_eq!(repo.count(&Predicate::eq("rank", 999), &ctx).unwrap(), 1);
}

#[test]
fn required_attribute_blocks_save_and_keeps_pending_state() {
    let model = Model::new("Model").with_entity(
        EntitySchema::new("Tag")
            .with_attribute(AttributeDescriptor::new("label", AttributeType::Text).required()),
    );
    let registry = ContextRegistry::new(Store::open_in_memory(model).unwrap());
    let repo = registry.store().repository("Tag").unwrap();
    let ctx = registry.main_context();

    let tag = repo.create(&ctx).unwrap();
    let err = ctx.save().unwrap_err();
    assert!(matches!(
        err,
        StoreError::Schema(SchemaError::MissingRequired { .. })
    ));
    assert!(ctx.has_changes());

    tag.set("label", "ok").unwrap();
    ctx.save().unwrap();
    assert!(!ctx.has_changes());
    assert_eq!(repo.count(&Predicate::True, &ctx).unwrap(), 1);
}

#[test]
fn unknown_kind_and_invalid_sort_key_are_errors() {
    let registry = registry();
    assert!(matches!(
        registry.store().repository("Missing"),
        Err(StoreError::Schema(SchemaError::UnknownEntity(_)))
    ));

    let repo = items(registry.store());
    let err = repo
        .find_all_sorted("missing", true, &registry.main_context())
        .unwrap_err();
    assert!(matches!(
        err,
        RepoError::Schema(SchemaError::UnknownAttribute { .. })
    ));
}
