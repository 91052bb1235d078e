use recordkit_core::{
    AttributeDescriptor, AttributeType, ChangeSet, ContextRegistry, EntitySchema, EntityState,
    MergePolicy, Model, Predicate, Store, StoreError, UpdatedEntity, Value,
};
use std::collections::BTreeMap;
use std::thread;

fn registry() -> ContextRegistry {
    let model = Model::new("Model").with_entity(
        EntitySchema::new("Item")
            .with_attribute(AttributeDescriptor::new("name", AttributeType::Text))
            .with_attribute(AttributeDescriptor::new("rank", AttributeType::Integer)),
    );
    ContextRegistry::new(Store::open_in_memory(model).unwrap())
}

/// Saves one item from a background context and returns its id.
fn saved_item(registry: &ContextRegistry, name: &str, rank: i64) -> recordkit_core::EntityId {
    let repo = registry.store().repository("Item").unwrap();
    let ctx = registry.new_background_context();
    let item = repo.create(&ctx).unwrap();
    item.set("name", name).unwrap();
    item.set("rank", rank).unwrap();
    ctx.save().unwrap();
    item.id()
}

#[test]
fn background_save_is_merged_into_main_context() {
    let registry = registry();
    let repo = registry.store().repository("Item").unwrap();
    let main = registry.main_context();
    let id = saved_item(&registry, "a", 1);

    let in_main = repo.find_by_id(id, &main).unwrap().unwrap();

    let background = registry.new_background_context();
    let in_background = repo.find_by_id(id, &background).unwrap().unwrap();
    in_background.set("rank", 7).unwrap();
    background.save().unwrap();

    main.process_pending_changes();
    assert_eq!(in_main.get("rank"), Some(Value::Integer(7)));
    assert!(!in_main.has_changes());
}

#[test]
fn in_memory_wins_keeps_unsaved_main_edits_per_attribute() {
    let registry = registry();
    let repo = registry.store().repository("Item").unwrap();
    let main = registry.main_context();
    assert_eq!(main.merge_policy(), MergePolicy::InMemoryWins);
    let id = saved_item(&registry, "a", 1);

    let in_main = repo.find_by_id(id, &main).unwrap().unwrap();
    in_main.set("name", "local").unwrap();

    let background = registry.new_background_context();
    let remote = repo.find_by_id(id, &background).unwrap().unwrap();
    remote.set("name", "remote").unwrap();
    remote.set("rank", 2).unwrap();
    background.save().unwrap();

    main.process_pending_changes();
    assert_eq!(in_main.get("name"), Some(Value::from("local")));
    assert_eq!(in_main.get("rank"), Some(Value::Integer(2)));
    assert!(in_main.has_changes());

    main.save().unwrap();
    let fresh = registry.new_background_context();
    let stored = repo.find_by_id(id, &fresh).unwrap().unwrap();
    assert_eq!(stored.get("name"), Some(Value::from("local")));
    assert_eq!(stored.get("rank"), Some(Value::Integer(2)));
}

#[test]
fn store_wins_replaces_conflicting_edits() {
    let registry = registry();
    let repo = registry.store().repository("Item").unwrap();
    let main = registry.main_context();
    main.set_merge_policy(MergePolicy::StoreWins);
    let id = saved_item(&registry, "a", 1);

    let in_main = repo.find_by_id(id, &main).unwrap().unwrap();
    in_main.set("name", "local").unwrap();

    let background = registry.new_background_context();
    let remote = repo.find_by_id(id, &background).unwrap().unwrap();
    remote.set("name", "remote").unwrap();
    background.save().unwrap();

    main.process_pending_changes();
    assert_eq!(in_main.get("name"), Some(Value::from("remote")));
    assert!(!in_main.has_changes());
}

#[test]
fn delete_all_on_background_reconciles_main_context() {
    let registry = registry();
    let repo = registry.store().repository("Item").unwrap();
    let main = registry.main_context();
    let doomed = saved_item(&registry, "x", 1);
    saved_item(&registry, "keep", 2);

    let in_main = repo.find_by_id(doomed, &main).unwrap().unwrap();

    let background = registry.new_background_context();
    let predicate = Predicate::eq("name", "x");
    assert_eq!(repo.delete_all(&predicate, &background).unwrap(), 1);

    assert_eq!(repo.count(&predicate, &background).unwrap(), 0);
    assert_eq!(repo.count(&predicate, &main).unwrap(), 0);
    assert!(in_main.is_deleted());
    assert!(main.registered(doomed).is_none());
    assert_eq!(repo.count(&Predicate::True, &main).unwrap(), 1);
}

#[test]
fn delete_all_on_main_is_visible_to_other_contexts() {
    let registry = registry();
    let repo = registry.store().repository("Item").unwrap();
    let main = registry.main_context();
    saved_item(&registry, "x", 1);
    saved_item(&registry, "x", 2);

    let other = registry.new_background_context();
    let loaded = repo.find_all_by("name", "x", &other).unwrap();
    assert_eq!(loaded.len(), 2);

    let predicate = Predicate::eq("name", "x");
    assert_eq!(repo.delete_all(&predicate, &main).unwrap(), 2);
    assert_eq!(repo.count(&predicate, &main).unwrap(), 0);
    assert_eq!(repo.count(&predicate, &other).unwrap(), 0);
    assert_eq!(
        repo.count(&predicate, &registry.new_background_context())
            .unwrap(),
        0
    );
}

#[test]
fn delete_all_keeps_unsaved_inserts_of_acting_context() {
    let registry = registry();
    let repo = registry.store().repository("Item").unwrap();
    let main = registry.main_context();
    saved_item(&registry, "x", 1);

    let pending = repo.create(&main).unwrap();
    pending.set("name", "x").unwrap();

    assert_eq!(repo.delete_all(&Predicate::eq("name", "x"), &main).unwrap(), 1);
    assert_eq!(pending.state(), EntityState::Unsaved);
    assert_eq!(repo.count(&Predicate::eq("name", "x"), &main).unwrap(), 1);
}

#[test]
fn update_of_entity_deleted_elsewhere_fails_with_object_not_found() {
    let registry = registry();
    let repo = registry.store().repository("Item").unwrap();
    let id = saved_item(&registry, "x", 1);

    let editor = registry.new_background_context();
    let stale = repo.find_by_id(id, &editor).unwrap().unwrap();
    stale.set("rank", 9).unwrap();

    let deleter = registry.new_background_context();
    repo.delete_all(&Predicate::id_eq(id), &deleter).unwrap();

    let err = editor.save().unwrap_err();
    assert!(matches!(err, StoreError::ObjectNotFound(missing) if missing == id));
}

#[test]
fn explicit_merge_changes_marks_entities() {
    let registry = registry();
    let repo = registry.store().repository("Item").unwrap();
    let id = saved_item(&registry, "a", 1);
    let ctx = registry.new_background_context();
    let item = repo.find_by_id(id, &ctx).unwrap().unwrap();

    let mut values = BTreeMap::new();
    values.insert("rank".to_string(), Value::Integer(4));
    ctx.merge_changes(&ChangeSet {
        updated: vec![UpdatedEntity { id, values }],
        ..ChangeSet::default()
    });
    assert_eq!(item.get("rank"), Some(Value::Integer(4)));

    ctx.merge_changes(&ChangeSet {
        deleted: vec![id],
        ..ChangeSet::default()
    });
    assert!(item.is_deleted());
}

#[test]
fn saves_from_worker_threads_reach_main_context() {
    let registry = registry();
    let repo = registry.store().repository("Item").unwrap();
    let main = registry.main_context();
    let id = saved_item(&registry, "shared", 0);
    let in_main = repo.find_by_id(id, &main).unwrap().unwrap();

    thread::scope(|scope| {
        scope.spawn(|| {
            let ctx = registry.current_context();
            assert!(!ctx.is_main());
            let item = repo.find_by_id(id, &ctx).unwrap().unwrap();
            item.set("rank", 11).unwrap();
            ctx.save().unwrap();
        });
    });

    assert_eq!(repo.count(&Predicate::eq("rank", 11), &main).unwrap(), 1);
    assert_eq!(in_main.get("rank"), Some(Value::Integer(11)));
}
