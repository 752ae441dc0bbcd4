mod common;

use common::{fixture, new_customer};
use memoentity::{CacheKey, EntityKey, EntityState, FieldValue, StatementKind, TransactionContext, Value};

#[tokio::test]
async fn test_customer_with_orders_full_lifecycle() {
    let fixture = fixture().await;

    // Create a customer and its orders through cascade.
    {
        let mut session = fixture.session();
        session.begin().await.unwrap();
        let customer = new_customer(&mut session, 1, "Ada", "ada@example.com").await;
        let mut orders = Vec::new();
        for total in [10, 20, 30] {
            let order = session.new_entity("Order").unwrap();
            session.set_field(order, "total", total).await.unwrap();
            orders.push(order);
        }
        session
            .set_field(customer, "orders", FieldValue::Collection(orders))
            .await
            .unwrap();
        session.create(customer).await.unwrap();
        session.commit().await.unwrap();
        assert!(!session.is_in_transaction());
        assert_eq!(session.state(customer).unwrap(), EntityState::NonTransactional);
        session.close().await.unwrap();
    }
    assert_eq!(fixture.log().count(StatementKind::Insert), 4);
    assert_eq!(fixture.db.row_count("orders").await, 3);

    // A fresh session reads the committed customer from the cache.
    fixture.log().clear();
    {
        let mut session = fixture.session();
        let customer = session.find("Customer", 1).await.unwrap();
        assert_eq!(
            session.get_field(customer, "email").await.unwrap(),
            FieldValue::from("ada@example.com")
        );
        assert_eq!(session.version(customer).unwrap(), Some(1));
    }
    assert_eq!(fixture.log().count(StatementKind::Select), 0);

    // Two writers race on the same version; the second one loses.
    let mut first = fixture.session();
    let mut second = fixture.session();
    first.begin().await.unwrap();
    second.begin().await.unwrap();
    let a = first.find("Customer", 1).await.unwrap();
    let b = second.find("Customer", 1).await.unwrap();
    first.set_field(a, "email", "first@example.com").await.unwrap();
    second.set_field(b, "email", "second@example.com").await.unwrap();

    first.commit().await.unwrap();
    let err = second.commit().await.unwrap_err();
    assert!(err.is_optimistic_lock());
    assert!(second.is_in_transaction());
    second.rollback().await.unwrap();
    assert_eq!(
        fixture.db.column("customers", 1, "email").await,
        Some(Value::from("first@example.com"))
    );

    // The loser retries against the committed state.
    {
        let mut session = fixture.session();
        session.begin().await.unwrap();
        let customer = session.find("Customer", 1).await.unwrap();
        assert_eq!(session.version(customer).unwrap(), Some(2));
        session.set_field(customer, "email", "second@example.com").await.unwrap();
        session.commit().await.unwrap();
        assert_eq!(session.version(customer).unwrap(), Some(3));
    }

    // Removing the customer removes its orders first.
    fixture.log().clear();
    {
        let mut session = fixture.session();
        session.begin().await.unwrap();
        let customer = session.find("Customer", 1).await.unwrap();
        session.remove(customer).await.unwrap();
        session.commit().await.unwrap();
        assert_eq!(session.state(customer).unwrap(), EntityState::Deleted);
    }
    let deletes: Vec<String> = fixture
        .log()
        .entries()
        .into_iter()
        .filter(|e| e.kind == StatementKind::Delete)
        .map(|e| e.table)
        .collect();
    assert_eq!(deletes.last().map(String::as_str), Some("customers"));
    assert_eq!(deletes.len(), 4);
    assert_eq!(fixture.db.row_count("orders").await, 0);
    assert_eq!(fixture.db.row_count("customers").await, 0);

    let cache = fixture.runtime.cache().unwrap();
    assert!(
        !cache
            .contains(&CacheKey::new("Customer", EntityKey::single(1i64)))
            .unwrap()
    );
}

#[tokio::test]
async fn test_identity_keyed_versioned_entity_round_trip() {
    let fixture = fixture().await;
    let mut session = fixture.session();
    session.begin().await.unwrap();

    let item = session.new_entity("Item").unwrap();
    session.set_field(item, "x", "a").await.unwrap();
    session.create(item).await.unwrap();
    assert_eq!(session.key(item).unwrap(), None);

    session.flush_all().await.unwrap();
    assert_eq!(session.state(item).unwrap(), EntityState::Persisted);
    let key = session.key(item).unwrap().unwrap();
    assert_eq!(session.version(item).unwrap(), Some(1));

    fixture.log().clear();
    session.set_field(item, "y", "b").await.unwrap();
    assert_eq!(fixture.log().count(StatementKind::Select), 0);
    session.flush_all().await.unwrap();
    assert_eq!(
        fixture.log().sql(),
        vec!["UPDATE items SET y = ?, version = ? WHERE id = ? AND version = ?"]
    );
    assert_eq!(
        fixture.log().entries()[0].bindings,
        vec![
            Value::from("b"),
            Value::Integer(2),
            key.as_column_value().unwrap().clone(),
            Value::Integer(1),
        ]
    );
    assert_eq!(session.version(item).unwrap(), Some(2));
    session.commit().await.unwrap();

    let cache = fixture.runtime.cache().unwrap();
    let cached = cache.get(&CacheKey::new("Item", key.clone())).unwrap().unwrap();
    assert_eq!(
        cached.group(0),
        Some(&[Value::from("a"), Value::Integer(2)][..])
    );
    assert_eq!(cached.group(1), Some(&[Value::from("b")][..]));
    assert_eq!(
        fixture.db.column("items", key, "version").await,
        Some(Value::Integer(2))
    );
}
