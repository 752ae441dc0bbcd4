#![allow(dead_code)]

use memoentity::metadata::{FieldDescriptor, RelationDescriptor, TypeDescriptor};
use memoentity::{
    CascadeSet, DataType, EntityHandle, MemoryDatabase, PersistenceRuntime, RuntimeConfig,
    Session, StatementLog, TypeRegistry,
};
use std::sync::Arc;

/// Customers own orders; orders embed an address; nodes reference each
/// other; items are identity-keyed, versioned and own parts; animals form a
/// discriminated hierarchy under a mapped superclass.
pub fn descriptors() -> Vec<TypeDescriptor> {
    vec![
        TypeDescriptor::entity("Customer", "customers")
            .key(FieldDescriptor::new("id", DataType::Integer))
            .field(FieldDescriptor::new("name", DataType::Text).not_null())
            .field(FieldDescriptor::new("version", DataType::Integer))
            .field(FieldDescriptor::new("email", DataType::Text).group(1))
            .field(FieldDescriptor::new("notes", DataType::Text).group(2))
            .version("version")
            .relation(
                RelationDescriptor::one_to_many("orders", "Order", "customer")
                    .cascade(CascadeSet::ALL),
            ),
        TypeDescriptor::embeddable("Address")
            .field(FieldDescriptor::new("street", DataType::Text))
            .field(FieldDescriptor::new("city", DataType::Text)),
        TypeDescriptor::entity("Order", "orders")
            .identity()
            .key(FieldDescriptor::new("id", DataType::Integer))
            .field(FieldDescriptor::new("total", DataType::Integer))
            .field(FieldDescriptor::embedded("ship_to", "Address").group(1))
            .relation(
                RelationDescriptor::many_to_one("customer", "Customer", "customer_id", 0)
                    .cascade(CascadeSet::PERSIST),
            ),
        TypeDescriptor::entity("Node", "nodes")
            .identity()
            .key(FieldDescriptor::new("id", DataType::Integer))
            .field(FieldDescriptor::new("label", DataType::Text))
            .relation(
                RelationDescriptor::many_to_one("next", "Node", "next_id", 0)
                    .cascade(CascadeSet::ALL),
            ),
        TypeDescriptor::entity("Peer", "peers")
            .key(FieldDescriptor::new("id", DataType::Integer))
            .field(FieldDescriptor::new("label", DataType::Text))
            .relation(
                RelationDescriptor::many_to_one("partner", "Peer", "partner_id", 0)
                    .cascade(CascadeSet::PERSIST),
            ),
        TypeDescriptor::entity("Item", "items")
            .identity()
            .key(FieldDescriptor::new("id", DataType::Integer))
            .field(FieldDescriptor::new("x", DataType::Text))
            .field(FieldDescriptor::new("version", DataType::Integer))
            .field(FieldDescriptor::new("y", DataType::Text).group(1))
            .version("version")
            .relation(
                RelationDescriptor::one_to_many("parts", "Part", "item").cascade(CascadeSet::ALL),
            ),
        TypeDescriptor::entity("Part", "parts")
            .identity()
            .key(FieldDescriptor::new("id", DataType::Integer))
            .relation(RelationDescriptor::many_to_one("item", "Item", "item_id", 0)),
        TypeDescriptor::mapped_superclass("Audited")
            .field(FieldDescriptor::new("created_by", DataType::Text).group(1)),
        TypeDescriptor::entity("Animal", "animals")
            .parent("Audited")
            .key(FieldDescriptor::new("id", DataType::Integer))
            .field(FieldDescriptor::new("name", DataType::Text))
            .field(FieldDescriptor::new("version", DataType::Integer))
            .version("version")
            .discriminator("kind")
            .discriminator_value("animal"),
        TypeDescriptor::entity("Cat", "cats")
            .parent("Animal")
            .discriminator_value("cat")
            .field(FieldDescriptor::new("lives", DataType::Integer))
            .field(FieldDescriptor::new("toy", DataType::Text).group(1)),
        TypeDescriptor::entity("Dog", "dogs")
            .parent("Animal")
            .discriminator_value("dog")
            .field(FieldDescriptor::new("breed", DataType::Text)),
    ]
}

pub fn registry() -> Arc<TypeRegistry> {
    let builder = descriptors()
        .into_iter()
        .fold(TypeRegistry::builder(), |builder, desc| builder.register(desc));
    Arc::new(builder.build().unwrap())
}

pub struct Fixture {
    pub db: MemoryDatabase,
    pub runtime: PersistenceRuntime,
}

impl Fixture {
    pub fn session(&self) -> Session {
        self.runtime.open_session(Box::new(self.db.connect()))
    }

    pub fn log(&self) -> &StatementLog {
        self.db.log()
    }
}

pub async fn fixture() -> Fixture {
    fixture_with(RuntimeConfig::default()).await
}

pub async fn fixture_with(config: RuntimeConfig) -> Fixture {
    fixture_for(registry(), config).await
}

pub async fn fixture_for(registry: Arc<TypeRegistry>, config: RuntimeConfig) -> Fixture {
    let db = MemoryDatabase::new();
    db.install(&registry).await.unwrap();
    let runtime = PersistenceRuntime::new(registry, config);
    Fixture { db, runtime }
}

/// Inserts and commits a customer with every group populated.
pub async fn seed_customer(fixture: &Fixture, id: i64, name: &str, email: &str) {
    let mut session = fixture.session();
    session.begin().await.unwrap();
    let customer = new_customer(&mut session, id, name, email).await;
    session.create(customer).await.unwrap();
    session.commit().await.unwrap();
    session.close().await.unwrap();
}

pub async fn new_customer(session: &mut Session, id: i64, name: &str, email: &str) -> EntityHandle {
    let customer = session.new_entity("Customer").unwrap();
    session.set_key(customer, id).unwrap();
    session.set_field(customer, "name", name).await.unwrap();
    session.set_field(customer, "email", email).await.unwrap();
    session.set_field(customer, "notes", "-").await.unwrap();
    customer
}
