mod common;

use common::{descriptors, fixture, fixture_for, new_customer, seed_customer};
use memoentity::entity::EntityView;
use memoentity::metadata::TypeDescriptor;
use memoentity::{
    Callback, DbError, EntityListener, EntityState, FieldValue, RuntimeConfig, StatementKind,
    TransactionContext, TypeRegistry, Value,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

struct Recorder {
    calls: Arc<Mutex<Vec<Callback>>>,
    reject: Option<Callback>,
}

impl EntityListener for Recorder {
    fn on_event(&self, callback: Callback, entity: &EntityView<'_>) -> memoentity::Result<()> {
        assert_eq!(entity.type_name(), "Customer");
        self.calls.lock().unwrap().push(callback);
        if self.reject == Some(callback) {
            return Err(DbError::IllegalState(format!("{:?} rejected", callback)));
        }
        Ok(())
    }
}

fn audited_registry(calls: Arc<Mutex<Vec<Callback>>>, reject: Option<Callback>) -> Arc<TypeRegistry> {
    let all = vec![
        Callback::PostLoad,
        Callback::PrePersist,
        Callback::PostPersist,
        Callback::PreUpdate,
        Callback::PostUpdate,
        Callback::PreRemove,
        Callback::PostRemove,
    ];
    let builder = descriptors()
        .into_iter()
        .map(|desc| {
            if desc.name == "Customer" {
                desc.listen("Audit")
            } else {
                desc
            }
        })
        .chain(std::iter::once(TypeDescriptor::listener("Audit", all)))
        .fold(TypeRegistry::builder(), |builder, desc| builder.register(desc))
        .bind_listener("Audit", Arc::new(Recorder { calls, reject }));
    Arc::new(builder.build().unwrap())
}

#[tokio::test]
async fn test_create_with_assigned_key_inserts_immediately() {
    let fixture = fixture().await;
    let mut session = fixture.session();
    session.begin().await.unwrap();

    let customer = new_customer(&mut session, 1, "Ada", "ada@example.com").await;
    assert_eq!(session.state(customer).unwrap(), EntityState::Transient);
    session.create(customer).await.unwrap();

    assert_eq!(session.state(customer).unwrap(), EntityState::Persisted);
    assert_eq!(fixture.log().count(StatementKind::Insert), 1);
    assert_eq!(session.version(customer).unwrap(), Some(1));

    session.commit().await.unwrap();
    assert_eq!(session.state(customer).unwrap(), EntityState::NonTransactional);
    assert_eq!(
        fixture.db.column("customers", 1, "version").await,
        Some(Value::Integer(1))
    );
    assert_eq!(
        fixture.db.column("customers", 1, "email").await,
        Some(Value::Text("ada@example.com".into()))
    );
}

#[tokio::test]
async fn test_identity_key_is_assigned_at_flush() {
    let fixture = fixture().await;
    let mut session = fixture.session();
    session.begin().await.unwrap();

    let order = session.new_entity("Order").unwrap();
    session.set_field(order, "total", 40).await.unwrap();
    session.create(order).await.unwrap();
    assert_eq!(session.state(order).unwrap(), EntityState::Persisting);
    assert_eq!(session.key(order).unwrap(), None);
    assert_eq!(fixture.log().count(StatementKind::Insert), 0);

    session.flush_all().await.unwrap();
    assert_eq!(session.state(order).unwrap(), EntityState::Persisted);
    let key = session.key(order).unwrap().expect("generated key");
    session.commit().await.unwrap();

    assert_eq!(
        fixture.db.column("orders", key, "total").await,
        Some(Value::Integer(40))
    );
}

#[tokio::test]
async fn test_operations_outside_transaction_are_rejected() {
    let fixture = fixture().await;
    seed_customer(&fixture, 1, "Ada", "ada@example.com").await;
    let mut session = fixture.session();

    let fresh = new_customer(&mut session, 2, "Bob", "bob@example.com").await;
    assert!(matches!(
        session.create(fresh).await,
        Err(DbError::NoActiveTransaction)
    ));

    let existing = session.find("Customer", 1).await.unwrap();
    assert!(matches!(
        session.set_field(existing, "email", "x@example.com").await,
        Err(DbError::NoActiveTransaction)
    ));
    assert!(matches!(
        session.remove(existing).await,
        Err(DbError::NoActiveTransaction)
    ));
    assert!(!session.is_in_transaction());
}

#[tokio::test]
async fn test_assigned_key_is_required_before_create() {
    let fixture = fixture().await;
    let mut session = fixture.session();
    session.begin().await.unwrap();

    let customer = session.new_entity("Customer").unwrap();
    session.set_field(customer, "name", "Nameless").await.unwrap();
    let err = session.create(customer).await.unwrap_err();
    assert!(err.is_illegal_state());
    assert_eq!(session.state(customer).unwrap(), EntityState::Transient);
}

#[tokio::test]
async fn test_duplicate_row_surfaces_constraint_violation() {
    let fixture = fixture().await;
    seed_customer(&fixture, 1, "Ada", "ada@example.com").await;

    let mut session = fixture.session();
    session.begin().await.unwrap();
    let clash = new_customer(&mut session, 1, "Imposter", "imp@example.com").await;
    let err = session.create(clash).await.unwrap_err();
    assert!(matches!(err, DbError::ConstraintViolation(_)));
    session.rollback().await.unwrap();

    assert_eq!(
        fixture.db.column("customers", 1, "name").await,
        Some(Value::Text("Ada".into()))
    );
}

#[tokio::test]
async fn test_second_instance_with_managed_key_is_illegal() {
    let fixture = fixture().await;
    seed_customer(&fixture, 1, "Ada", "ada@example.com").await;

    let mut session = fixture.session();
    session.find("Customer", 1).await.unwrap();
    session.begin().await.unwrap();
    let twin = new_customer(&mut session, 1, "Twin", "twin@example.com").await;
    assert!(session.create(twin).await.unwrap_err().is_illegal_state());
}

#[tokio::test]
async fn test_rollback_returns_created_entities_to_transient() {
    let fixture = fixture().await;
    let mut session = fixture.session();
    session.begin().await.unwrap();

    let customer = new_customer(&mut session, 7, "Cleo", "cleo@example.com").await;
    session.create(customer).await.unwrap();
    let order = session.new_entity("Order").unwrap();
    session.create(order).await.unwrap();
    session.flush_all().await.unwrap();
    assert_eq!(fixture.db.row_count("customers").await, 1);

    session.rollback().await.unwrap();
    assert_eq!(session.state(customer).unwrap(), EntityState::Transient);
    assert_eq!(session.state(order).unwrap(), EntityState::Transient);
    assert_eq!(session.key(order).unwrap(), None);
    assert!(session.load_mask(customer).unwrap().is_empty());
    assert_eq!(fixture.db.row_count("customers").await, 0);
    assert_eq!(fixture.db.row_count("orders").await, 0);

    // Values survive, so the entity can be created again.
    assert_eq!(
        session.get_field(customer, "name").await.unwrap(),
        FieldValue::from("Cleo")
    );
    session.begin().await.unwrap();
    session.create(customer).await.unwrap();
    session.commit().await.unwrap();
    assert_eq!(fixture.db.row_count("customers").await, 1);
}

#[tokio::test]
async fn test_remove_then_commit_deletes_the_row() {
    let fixture = fixture().await;
    seed_customer(&fixture, 1, "Ada", "ada@example.com").await;

    let mut session = fixture.session();
    session.begin().await.unwrap();
    let customer = session.find("Customer", 1).await.unwrap();
    session.remove(customer).await.unwrap();
    assert_eq!(session.state(customer).unwrap(), EntityState::Deleting);
    // Removing twice is a no-op.
    session.remove(customer).await.unwrap();
    session.commit().await.unwrap();

    assert_eq!(session.state(customer).unwrap(), EntityState::Deleted);
    assert_eq!(fixture.log().count(StatementKind::Delete), 1);
    assert!(fixture.db.row("customers", 1).await.is_none());

    session.begin().await.unwrap();
    assert!(session.flush(customer).await.unwrap_err().is_illegal_state());
    assert!(session.set_field(customer, "name", "Zed").await.unwrap_err().is_illegal_state());
    assert!(session.find("Customer", 1).await.unwrap_err().is_not_found());
    session.rollback().await.unwrap();

    let mut other = fixture.session();
    assert!(other.find("Customer", 1).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_removing_an_uninserted_entity_needs_no_io() {
    let fixture = fixture().await;
    let mut session = fixture.session();
    session.begin().await.unwrap();

    let order = session.new_entity("Order").unwrap();
    session.create(order).await.unwrap();
    session.remove(order).await.unwrap();
    assert_eq!(session.state(order).unwrap(), EntityState::Transient);
    session.commit().await.unwrap();

    assert!(fixture.log().is_empty());
    assert!(session.remove(order).await.is_err());
}

#[tokio::test]
async fn test_create_after_remove_inserts_again() {
    let fixture = fixture().await;
    let mut session = fixture.session();
    session.begin().await.unwrap();

    let order = session.new_entity("Order").unwrap();
    session.set_field(order, "total", 7).await.unwrap();
    session.create(order).await.unwrap();
    session.remove(order).await.unwrap();
    assert_eq!(session.state(order).unwrap(), EntityState::Transient);

    session.create(order).await.unwrap();
    assert_eq!(session.state(order).unwrap(), EntityState::Persisting);
    session.commit().await.unwrap();

    assert_eq!(fixture.log().count(StatementKind::Insert), 1);
    assert_eq!(session.state(order).unwrap(), EntityState::NonTransactional);
    let key = session.key(order).unwrap().unwrap();
    assert_eq!(
        fixture.db.column("orders", key, "total").await,
        Some(Value::Integer(7))
    );
}

#[tokio::test]
async fn test_create_after_remove_reaches_cascade_children_again() {
    let fixture = fixture().await;
    let mut session = fixture.session();
    session.begin().await.unwrap();

    let item = session.new_entity("Item").unwrap();
    session.set_field(item, "x", "a").await.unwrap();
    let parts: Vec<_> = (0..2).map(|_| session.new_entity("Part").unwrap()).collect();
    session
        .set_field(item, "parts", FieldValue::Collection(parts.clone()))
        .await
        .unwrap();
    session.create(item).await.unwrap();
    session.remove(item).await.unwrap();
    for &part in &parts {
        assert_eq!(session.state(part).unwrap(), EntityState::Transient);
    }

    session.create(item).await.unwrap();
    for &part in &parts {
        assert_eq!(session.state(part).unwrap(), EntityState::Persisting);
    }
    session.commit().await.unwrap();

    assert_eq!(fixture.db.row_count("items").await, 1);
    assert_eq!(fixture.db.row_count("parts").await, 2);
}

#[tokio::test]
async fn test_transaction_hooks_run_on_outcome() {
    let fixture = fixture().await;
    let mut session = fixture.session();

    let committed = Arc::new(AtomicBool::new(false));
    let rolled_back = Arc::new(AtomicBool::new(false));

    assert!(session.on_commit(Box::new(|| {})).is_err());

    let tx = session.begin().await.unwrap();
    assert_eq!(session.current_transaction(), Some(tx));
    assert!(session.begin().await.unwrap_err().is_illegal_state());
    let flag = committed.clone();
    session.on_commit(Box::new(move || flag.store(true, Ordering::SeqCst))).unwrap();
    let flag = rolled_back.clone();
    session.on_rollback(Box::new(move || flag.store(true, Ordering::SeqCst))).unwrap();
    session.commit().await.unwrap();

    assert!(committed.load(Ordering::SeqCst));
    assert!(!rolled_back.load(Ordering::SeqCst));
    assert!(!session.is_in_transaction());
    assert!(matches!(
        session.commit().await,
        Err(DbError::NoActiveTransaction)
    ));

    session.begin().await.unwrap();
    let flag = rolled_back.clone();
    session.on_rollback(Box::new(move || flag.store(true, Ordering::SeqCst))).unwrap();
    session.rollback().await.unwrap();
    assert!(rolled_back.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_close_rolls_back_open_transaction() {
    let fixture = fixture().await;
    let mut session = fixture.session();
    session.begin().await.unwrap();
    let customer = new_customer(&mut session, 3, "Dan", "dan@example.com").await;
    session.create(customer).await.unwrap();
    session.close().await.unwrap();

    assert_eq!(fixture.db.row_count("customers").await, 0);
}

#[tokio::test]
async fn test_handles_are_bound_to_their_session() {
    let fixture = fixture().await;
    seed_customer(&fixture, 1, "Ada", "ada@example.com").await;
    let mut first = fixture.session();
    let mut second = fixture.session();

    let customer = first.find("Customer", 1).await.unwrap();
    assert!(second.get_field(customer, "name").await.unwrap_err().is_illegal_state());
}

#[tokio::test]
async fn test_listeners_observe_the_life_cycle() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let fixture = fixture_for(audited_registry(calls.clone(), None), RuntimeConfig::default()).await;

    seed_customer(&fixture, 1, "Ada", "ada@example.com").await;
    assert_eq!(
        *calls.lock().unwrap(),
        vec![Callback::PrePersist, Callback::PostPersist]
    );
    calls.lock().unwrap().clear();

    let mut session = fixture.session();
    let customer = session.find("Customer", 1).await.unwrap();
    session.get_field(customer, "email").await.unwrap();
    session.find("Customer", 1).await.unwrap();
    assert_eq!(*calls.lock().unwrap(), vec![Callback::PostLoad]);
    calls.lock().unwrap().clear();

    session.begin().await.unwrap();
    session.set_field(customer, "email", "ada@new.example").await.unwrap();
    session.commit().await.unwrap();
    assert_eq!(
        *calls.lock().unwrap(),
        vec![Callback::PreUpdate, Callback::PostUpdate]
    );
    calls.lock().unwrap().clear();

    session.begin().await.unwrap();
    session.remove(customer).await.unwrap();
    session.commit().await.unwrap();
    assert_eq!(
        *calls.lock().unwrap(),
        vec![Callback::PreRemove, Callback::PostRemove]
    );
}

#[tokio::test]
async fn test_failing_pre_persist_listener_aborts_create() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let registry = audited_registry(calls.clone(), Some(Callback::PrePersist));
    let fixture = fixture_for(registry, RuntimeConfig::default()).await;

    let mut session = fixture.session();
    session.begin().await.unwrap();
    let customer = new_customer(&mut session, 1, "Ada", "ada@example.com").await;
    assert!(session.create(customer).await.is_err());
    assert_eq!(session.state(customer).unwrap(), EntityState::Transient);
    session.commit().await.unwrap();

    assert_eq!(fixture.log().count(StatementKind::Insert), 0);
    assert_eq!(*calls.lock().unwrap(), vec![Callback::PrePersist]);
}

#[tokio::test]
async fn test_post_load_fires_once_across_reloads() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let config = RuntimeConfig::default().cache_enabled(false);
    let fixture = fixture_for(audited_registry(calls.clone(), None), config).await;
    seed_customer(&fixture, 1, "Ada", "ada@example.com").await;
    calls.lock().unwrap().clear();
    fixture.log().clear();

    let mut session = fixture.session();
    let customer = session.find("Customer", 1).await.unwrap();

    // Write promotion selects the root group again.
    session.begin().await.unwrap();
    session.set_field(customer, "email", "ada@new.example").await.unwrap();
    session.rollback().await.unwrap();
    assert!(session.load_mask(customer).unwrap().is_empty());

    // After the rollback nothing is trusted, so the root group is read a third time.
    assert_eq!(
        session.get_field(customer, "name").await.unwrap(),
        FieldValue::from("Ada")
    );

    let root_selects = fixture
        .log()
        .sql()
        .into_iter()
        .filter(|sql| sql == "SELECT name, version FROM customers WHERE id = ?")
        .count();
    assert_eq!(root_selects, 3);
    let post_loads = calls
        .lock()
        .unwrap()
        .iter()
        .filter(|&&c| c == Callback::PostLoad)
        .count();
    assert_eq!(post_loads, 1);
}
