mod common;

use common::{fixture, fixture_with};
use memoentity::{FieldValue, PersistenceRuntime, RuntimeConfig, StatementKind, Value};

async fn seed_cat(fixture: &common::Fixture, id: i64) {
    let mut session = fixture.session();
    session.begin().await.unwrap();
    let cat = session.new_entity("Cat").unwrap();
    session.set_key(cat, id).unwrap();
    session.set_field(cat, "name", "Tom").await.unwrap();
    session.set_field(cat, "created_by", "admin").await.unwrap();
    session.set_field(cat, "lives", 9).await.unwrap();
    session.set_field(cat, "toy", "mouse").await.unwrap();
    session.create(cat).await.unwrap();
    session.commit().await.unwrap();
}

#[tokio::test]
async fn test_insert_writes_every_table_root_first() {
    let fixture = fixture().await;
    seed_cat(&fixture, 1).await;

    assert_eq!(
        fixture.log().sql(),
        vec![
            "INSERT INTO animals (id, kind, name, version, created_by) VALUES (?, ?, ?, ?, ?)",
            "INSERT INTO cats (id, lives, toy) VALUES (?, ?, ?)",
        ]
    );
    assert_eq!(
        fixture.db.column("animals", 1, "kind").await,
        Some(Value::from("cat"))
    );
    assert_eq!(
        fixture.db.column("animals", 1, "created_by").await,
        Some(Value::from("admin"))
    );
    assert_eq!(
        fixture.db.column("cats", 1, "lives").await,
        Some(Value::Integer(9))
    );
}

#[tokio::test]
async fn test_find_through_the_root_resolves_the_subtype() {
    let fixture = fixture_with(RuntimeConfig::default().cache_enabled(false)).await;
    seed_cat(&fixture, 1).await;
    fixture.log().clear();

    let mut session = fixture.session();
    let animal = session.find("Animal", 1).await.unwrap();
    assert_eq!(
        fixture.log().sql(),
        vec!["SELECT name, version, kind FROM animals WHERE id = ?"]
    );
    assert_eq!(session.type_name(animal).unwrap(), "Cat");
    assert_eq!(
        session.get_field(animal, "lives").await.unwrap(),
        FieldValue::from(9)
    );
    assert_eq!(
        fixture.log().sql()[1],
        "SELECT lives FROM cats WHERE id = ?"
    );

    let same = session.reference("Cat", 1).unwrap();
    assert_eq!(same, animal);
}

#[tokio::test]
async fn test_cached_subtype_is_narrowed_without_io() {
    let fixture = fixture().await;
    seed_cat(&fixture, 1).await;
    fixture.log().clear();

    let mut session = fixture.session();
    let animal = session.find("Animal", 1).await.unwrap();
    assert_eq!(session.type_name(animal).unwrap(), "Cat");
    assert_eq!(
        session.get_field(animal, "toy").await.unwrap(),
        FieldValue::from("mouse")
    );
    assert!(fixture.log().is_empty());
}

#[tokio::test]
async fn test_find_under_an_unrelated_subtype_is_not_found() {
    for cache in [true, false] {
        let fixture = fixture_with(RuntimeConfig::default().cache_enabled(cache)).await;
        seed_cat(&fixture, 1).await;

        let mut session = fixture.session();
        assert!(session.find("Dog", 1).await.unwrap_err().is_not_found());
        let cat = session.find("Cat", 1).await.unwrap();
        assert_eq!(session.type_name(cat).unwrap(), "Cat");
    }
}

#[tokio::test]
async fn test_subtype_only_change_bumps_the_root_version() {
    let fixture = fixture().await;
    seed_cat(&fixture, 1).await;

    let mut session = fixture.session();
    session.begin().await.unwrap();
    let cat = session.find("Cat", 1).await.unwrap();
    session.set_field(cat, "lives", 8).await.unwrap();
    fixture.log().clear();
    session.commit().await.unwrap();

    assert_eq!(
        fixture.log().sql(),
        vec![
            "UPDATE cats SET lives = ? WHERE id = ?",
            "UPDATE animals SET version = ? WHERE id = ? AND version = ?",
        ]
    );
    assert_eq!(
        fixture.db.column("animals", 1, "version").await,
        Some(Value::Integer(2))
    );
}

#[tokio::test]
async fn test_mixed_change_checks_the_version_on_the_root_table_first() {
    let fixture = fixture().await;
    seed_cat(&fixture, 1).await;

    let mut session = fixture.session();
    session.begin().await.unwrap();
    let cat = session.find("Cat", 1).await.unwrap();
    session.set_field(cat, "toy", "ball").await.unwrap();
    session.set_field(cat, "created_by", "root").await.unwrap();
    fixture.log().clear();
    session.commit().await.unwrap();

    assert_eq!(
        fixture.log().sql(),
        vec![
            "UPDATE animals SET created_by = ?, version = ? WHERE id = ? AND version = ?",
            "UPDATE cats SET toy = ? WHERE id = ?",
        ]
    );
}

#[tokio::test]
async fn test_delete_runs_from_the_most_derived_table() {
    let fixture = fixture().await;
    seed_cat(&fixture, 1).await;

    let mut session = fixture.session();
    session.begin().await.unwrap();
    let cat = session.find("Animal", 1).await.unwrap();
    session.remove(cat).await.unwrap();
    fixture.log().clear();
    session.commit().await.unwrap();

    assert_eq!(
        fixture.log().sql(),
        vec![
            "DELETE FROM cats WHERE id = ?",
            "DELETE FROM animals WHERE id = ? AND version = ?",
        ]
    );
    assert_eq!(fixture.db.row_count("animals").await, 0);
    assert_eq!(fixture.db.row_count("cats").await, 0);
}

#[tokio::test]
async fn test_root_entities_share_the_root_table() {
    let fixture = fixture().await;
    let mut session = fixture.session();
    session.begin().await.unwrap();
    let animal = session.new_entity("Animal").unwrap();
    session.set_key(animal, 5).unwrap();
    session.set_field(animal, "name", "Generic").await.unwrap();
    session.create(animal).await.unwrap();
    session.commit().await.unwrap();

    assert_eq!(fixture.log().count(StatementKind::Insert), 1);
    assert_eq!(
        fixture.db.column("animals", 5, "kind").await,
        Some(Value::from("animal"))
    );

    let mut other = fixture.session();
    assert!(other.find("Cat", 5).await.unwrap_err().is_not_found());
    let found = other.find("Animal", 5).await.unwrap();
    assert_eq!(other.type_name(found).unwrap(), "Animal");
    // The loaded row settled the type; it cannot be narrowed afterwards.
    assert!(other.reference("Cat", 5).unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_runtime_exposes_the_registry_layouts() {
    let registry = common::registry();
    let runtime = PersistenceRuntime::new(registry, RuntimeConfig::default());
    let cat = runtime.registry().layout("Cat").unwrap();
    assert_eq!(cat.root(), "Animal");
    assert_eq!(cat.group_count(), 4);
    assert!(runtime.registry().is_subtype("Cat", "Audited"));
}
