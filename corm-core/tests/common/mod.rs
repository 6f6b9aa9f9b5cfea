//! Hand-built `Entity` impls standing in for what `#[derive(Entity)]` would
//! generate: `corm-core`'s own test suite exercises the engine directly,
//! without depending on the macro crate.

use corm_core::{AsValue, AttributeDecl, AttributeKind, AttributeTarget, Entity, EntityDecl, OrmError, Registry, Result, Value};
use std::collections::HashMap;
use std::sync::Arc;

fn mapping_err(ctx: &'static str) -> impl Fn(anyhow::Error) -> OrmError {
    move |e| OrmError::Mapping(format!("{ctx}: {e}"))
}

pub struct Author {
    pub id: Option<i64>,
    pub name: String,
}

impl Entity for Author {
    fn decl() -> &'static EntityDecl {
        static ATTRS: &[AttributeDecl] = &[
            AttributeDecl {
                name: "id",
                kind: AttributeKind::PrimaryKey,
                target: AttributeTarget::Scalar,
                reverse: None,
                column: None,
                unique_group: None,
                empty_value: <Option<i64> as AsValue>::empty_value,
            },
            AttributeDecl {
                name: "name",
                kind: AttributeKind::Required,
                target: AttributeTarget::Scalar,
                reverse: None,
                column: None,
                unique_group: None,
                empty_value: <String as AsValue>::empty_value,
            },
            AttributeDecl {
                name: "books",
                kind: AttributeKind::Set,
                target: AttributeTarget::Collection("Book"),
                reverse: None,
                column: None,
                unique_group: None,
                empty_value: Value::default,
            },
        ];
        static BASES: &[&str] = &[];
        static DECL: EntityDecl =
            EntityDecl { name: "Author", table: "author", direct_bases: BASES, attributes: ATTRS, discriminator_value: None };
        &DECL
    }

    fn initial_values(&self) -> Vec<(&'static str, Value)> {
        vec![("id", AsValue::into_value(self.id)), ("name", AsValue::into_value(self.name.clone()))]
    }

    fn from_values(values: &HashMap<&'static str, Value>) -> Result<Self> {
        Ok(Self {
            id: AsValue::try_from_value(values.get("id").cloned().unwrap_or(Value::Null)).map_err(mapping_err("Author.id"))?,
            name: AsValue::try_from_value(values.get("name").cloned().unwrap_or(Value::Null)).map_err(mapping_err("Author.name"))?,
        })
    }
}

pub struct Book {
    pub id: Option<i64>,
    pub title: String,
}

impl Entity for Book {
    fn decl() -> &'static EntityDecl {
        static ATTRS: &[AttributeDecl] = &[
            AttributeDecl {
                name: "id",
                kind: AttributeKind::PrimaryKey,
                target: AttributeTarget::Scalar,
                reverse: None,
                column: None,
                unique_group: None,
                empty_value: <Option<i64> as AsValue>::empty_value,
            },
            AttributeDecl {
                name: "title",
                kind: AttributeKind::Required,
                target: AttributeTarget::Scalar,
                reverse: None,
                column: None,
                unique_group: None,
                empty_value: <String as AsValue>::empty_value,
            },
            AttributeDecl {
                name: "author",
                kind: AttributeKind::Required,
                target: AttributeTarget::Reference("Author"),
                reverse: Some("books"),
                column: Some("author_id"),
                unique_group: None,
                empty_value: Value::default,
            },
        ];
        static BASES: &[&str] = &[];
        static DECL: EntityDecl =
            EntityDecl { name: "Book", table: "book", direct_bases: BASES, attributes: ATTRS, discriminator_value: None };
        &DECL
    }

    fn initial_values(&self) -> Vec<(&'static str, Value)> {
        vec![("id", AsValue::into_value(self.id)), ("title", AsValue::into_value(self.title.clone()))]
    }

    fn from_values(values: &HashMap<&'static str, Value>) -> Result<Self> {
        Ok(Self {
            id: AsValue::try_from_value(values.get("id").cloned().unwrap_or(Value::Null)).map_err(mapping_err("Book.id"))?,
            title: AsValue::try_from_value(values.get("title").cloned().unwrap_or(Value::Null)).map_err(mapping_err("Book.title"))?,
        })
    }
}

/// One side of a mutual optional one-to-one (spec scenario: neither row
/// can be inserted first since each references the other's not-yet-assigned
/// primary key), exercising `Session`'s deferred FK patch pass.
pub struct Husband {
    pub id: Option<i64>,
}

impl Entity for Husband {
    fn decl() -> &'static EntityDecl {
        static ATTRS: &[AttributeDecl] = &[
            AttributeDecl {
                name: "id",
                kind: AttributeKind::PrimaryKey,
                target: AttributeTarget::Scalar,
                reverse: None,
                column: None,
                unique_group: None,
                empty_value: <Option<i64> as AsValue>::empty_value,
            },
            AttributeDecl {
                name: "spouse",
                kind: AttributeKind::Optional,
                target: AttributeTarget::Reference("Wife"),
                reverse: None,
                column: Some("spouse_id"),
                unique_group: None,
                empty_value: Value::default,
            },
        ];
        static BASES: &[&str] = &[];
        static DECL: EntityDecl =
            EntityDecl { name: "Husband", table: "husband", direct_bases: BASES, attributes: ATTRS, discriminator_value: None };
        &DECL
    }

    fn initial_values(&self) -> Vec<(&'static str, Value)> {
        vec![("id", AsValue::into_value(self.id))]
    }

    fn from_values(values: &HashMap<&'static str, Value>) -> Result<Self> {
        Ok(Self { id: AsValue::try_from_value(values.get("id").cloned().unwrap_or(Value::Null)).map_err(mapping_err("Husband.id"))? })
    }
}

pub struct Wife {
    pub id: Option<i64>,
}

impl Entity for Wife {
    fn decl() -> &'static EntityDecl {
        static ATTRS: &[AttributeDecl] = &[
            AttributeDecl {
                name: "id",
                kind: AttributeKind::PrimaryKey,
                target: AttributeTarget::Scalar,
                reverse: None,
                column: None,
                unique_group: None,
                empty_value: <Option<i64> as AsValue>::empty_value,
            },
            AttributeDecl {
                name: "spouse",
                kind: AttributeKind::Optional,
                target: AttributeTarget::Reference("Husband"),
                reverse: None,
                column: Some("spouse_id"),
                unique_group: None,
                empty_value: Value::default,
            },
        ];
        static BASES: &[&str] = &[];
        static DECL: EntityDecl =
            EntityDecl { name: "Wife", table: "wife", direct_bases: BASES, attributes: ATTRS, discriminator_value: None };
        &DECL
    }

    fn initial_values(&self) -> Vec<(&'static str, Value)> {
        vec![("id", AsValue::into_value(self.id))]
    }

    fn from_values(values: &HashMap<&'static str, Value>) -> Result<Self> {
        Ok(Self { id: AsValue::try_from_value(values.get("id").cloned().unwrap_or(Value::Null)).map_err(mapping_err("Wife.id"))? })
    }
}

pub struct Account {
    pub id: Option<i64>,
    pub email: String,
}

impl Entity for Account {
    fn decl() -> &'static EntityDecl {
        static ATTRS: &[AttributeDecl] = &[
            AttributeDecl {
                name: "id",
                kind: AttributeKind::PrimaryKey,
                target: AttributeTarget::Scalar,
                reverse: None,
                column: None,
                unique_group: None,
                empty_value: <Option<i64> as AsValue>::empty_value,
            },
            AttributeDecl {
                name: "email",
                kind: AttributeKind::Unique,
                target: AttributeTarget::Scalar,
                reverse: None,
                column: None,
                unique_group: None,
                empty_value: <String as AsValue>::empty_value,
            },
        ];
        static BASES: &[&str] = &[];
        static DECL: EntityDecl =
            EntityDecl { name: "Account", table: "account", direct_bases: BASES, attributes: ATTRS, discriminator_value: None };
        &DECL
    }

    fn initial_values(&self) -> Vec<(&'static str, Value)> {
        vec![("id", AsValue::into_value(self.id)), ("email", AsValue::into_value(self.email.clone()))]
    }

    fn from_values(values: &HashMap<&'static str, Value>) -> Result<Self> {
        Ok(Self {
            id: AsValue::try_from_value(values.get("id").cloned().unwrap_or(Value::Null)).map_err(mapping_err("Account.id"))?,
            email: AsValue::try_from_value(values.get("email").cloned().unwrap_or(Value::Null)).map_err(mapping_err("Account.email"))?,
        })
    }
}

/// A true many-to-many pair (spec §4.1's m2m case, distinct from
/// `Author.books`/`Book.author`'s to-many/to-one pair): both sides declare
/// a `Set`, so the registry must back them with a shared link table
/// instead of a foreign-key column.
pub struct Student {
    pub id: Option<i64>,
    pub name: String,
}

impl Entity for Student {
    fn decl() -> &'static EntityDecl {
        static ATTRS: &[AttributeDecl] = &[
            AttributeDecl {
                name: "id",
                kind: AttributeKind::PrimaryKey,
                target: AttributeTarget::Scalar,
                reverse: None,
                column: None,
                unique_group: None,
                empty_value: <Option<i64> as AsValue>::empty_value,
            },
            AttributeDecl {
                name: "name",
                kind: AttributeKind::Required,
                target: AttributeTarget::Scalar,
                reverse: None,
                column: None,
                unique_group: None,
                empty_value: <String as AsValue>::empty_value,
            },
            AttributeDecl {
                name: "courses",
                kind: AttributeKind::Set,
                target: AttributeTarget::Collection("Course"),
                reverse: Some("students"),
                column: None,
                unique_group: None,
                empty_value: Value::default,
            },
        ];
        static BASES: &[&str] = &[];
        static DECL: EntityDecl =
            EntityDecl { name: "Student", table: "student", direct_bases: BASES, attributes: ATTRS, discriminator_value: None };
        &DECL
    }

    fn initial_values(&self) -> Vec<(&'static str, Value)> {
        vec![("id", AsValue::into_value(self.id)), ("name", AsValue::into_value(self.name.clone()))]
    }

    fn from_values(values: &HashMap<&'static str, Value>) -> Result<Self> {
        Ok(Self {
            id: AsValue::try_from_value(values.get("id").cloned().unwrap_or(Value::Null)).map_err(mapping_err("Student.id"))?,
            name: AsValue::try_from_value(values.get("name").cloned().unwrap_or(Value::Null)).map_err(mapping_err("Student.name"))?,
        })
    }
}

pub struct Course {
    pub id: Option<i64>,
    pub title: String,
}

impl Entity for Course {
    fn decl() -> &'static EntityDecl {
        static ATTRS: &[AttributeDecl] = &[
            AttributeDecl {
                name: "id",
                kind: AttributeKind::PrimaryKey,
                target: AttributeTarget::Scalar,
                reverse: None,
                column: None,
                unique_group: None,
                empty_value: <Option<i64> as AsValue>::empty_value,
            },
            AttributeDecl {
                name: "title",
                kind: AttributeKind::Required,
                target: AttributeTarget::Scalar,
                reverse: None,
                column: None,
                unique_group: None,
                empty_value: <String as AsValue>::empty_value,
            },
            AttributeDecl {
                name: "students",
                kind: AttributeKind::Set,
                target: AttributeTarget::Collection("Student"),
                reverse: Some("courses"),
                column: None,
                unique_group: None,
                empty_value: Value::default,
            },
        ];
        static BASES: &[&str] = &[];
        static DECL: EntityDecl =
            EntityDecl { name: "Course", table: "course", direct_bases: BASES, attributes: ATTRS, discriminator_value: None };
        &DECL
    }

    fn initial_values(&self) -> Vec<(&'static str, Value)> {
        vec![("id", AsValue::into_value(self.id)), ("title", AsValue::into_value(self.title.clone()))]
    }

    fn from_values(values: &HashMap<&'static str, Value>) -> Result<Self> {
        Ok(Self {
            id: AsValue::try_from_value(values.get("id").cloned().unwrap_or(Value::Null)).map_err(mapping_err("Course.id"))?,
            title: AsValue::try_from_value(values.get("title").cloned().unwrap_or(Value::Null)).map_err(mapping_err("Course.title"))?,
        })
    }
}

/// Single-table inheritance root (spec §4.1's discriminator case): neither
/// `Vehicle` nor its subclasses declare a `#[discriminator]` attribute, so
/// the registry auto-creates one the moment `Car` joins `Vehicle`'s chain.
pub struct Vehicle {
    pub id: Option<i64>,
    pub plate: String,
}

impl Entity for Vehicle {
    fn decl() -> &'static EntityDecl {
        static ATTRS: &[AttributeDecl] = &[
            AttributeDecl {
                name: "id",
                kind: AttributeKind::PrimaryKey,
                target: AttributeTarget::Scalar,
                reverse: None,
                column: None,
                unique_group: None,
                empty_value: <Option<i64> as AsValue>::empty_value,
            },
            AttributeDecl {
                name: "plate",
                kind: AttributeKind::Required,
                target: AttributeTarget::Scalar,
                reverse: None,
                column: None,
                unique_group: None,
                empty_value: <String as AsValue>::empty_value,
            },
        ];
        static BASES: &[&str] = &[];
        static DECL: EntityDecl =
            EntityDecl { name: "Vehicle", table: "vehicle", direct_bases: BASES, attributes: ATTRS, discriminator_value: None };
        &DECL
    }

    fn initial_values(&self) -> Vec<(&'static str, Value)> {
        vec![("id", AsValue::into_value(self.id)), ("plate", AsValue::into_value(self.plate.clone()))]
    }

    fn from_values(values: &HashMap<&'static str, Value>) -> Result<Self> {
        Ok(Self {
            id: AsValue::try_from_value(values.get("id").cloned().unwrap_or(Value::Null)).map_err(mapping_err("Vehicle.id"))?,
            plate: AsValue::try_from_value(values.get("plate").cloned().unwrap_or(Value::Null)).map_err(mapping_err("Vehicle.plate"))?,
        })
    }
}

pub struct Car {
    pub id: Option<i64>,
    pub plate: String,
    pub doors: i64,
}

impl Entity for Car {
    fn decl() -> &'static EntityDecl {
        static ATTRS: &[AttributeDecl] = &[AttributeDecl {
            name: "doors",
            kind: AttributeKind::Required,
            target: AttributeTarget::Scalar,
            reverse: None,
            column: None,
            unique_group: None,
            empty_value: <i64 as AsValue>::empty_value,
        }];
        static BASES: &[&str] = &["Vehicle"];
        static DECL: EntityDecl =
            EntityDecl { name: "Car", table: "vehicle", direct_bases: BASES, attributes: ATTRS, discriminator_value: None };
        &DECL
    }

    fn initial_values(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("id", AsValue::into_value(self.id)),
            ("plate", AsValue::into_value(self.plate.clone())),
            ("doors", AsValue::into_value(self.doors)),
        ]
    }

    fn from_values(values: &HashMap<&'static str, Value>) -> Result<Self> {
        Ok(Self {
            id: AsValue::try_from_value(values.get("id").cloned().unwrap_or(Value::Null)).map_err(mapping_err("Car.id"))?,
            plate: AsValue::try_from_value(values.get("plate").cloned().unwrap_or(Value::Null)).map_err(mapping_err("Car.plate"))?,
            doors: AsValue::try_from_value(values.get("doors").cloned().unwrap_or(Value::Null)).map_err(mapping_err("Car.doors"))?,
        })
    }
}

pub struct Truck {
    pub id: Option<i64>,
    pub plate: String,
    pub payload_tons: i64,
}

impl Entity for Truck {
    fn decl() -> &'static EntityDecl {
        static ATTRS: &[AttributeDecl] = &[AttributeDecl {
            name: "payload_tons",
            kind: AttributeKind::Required,
            target: AttributeTarget::Scalar,
            reverse: None,
            column: None,
            unique_group: None,
            empty_value: <i64 as AsValue>::empty_value,
        }];
        static BASES: &[&str] = &["Vehicle"];
        static DECL: EntityDecl =
            EntityDecl { name: "Truck", table: "vehicle", direct_bases: BASES, attributes: ATTRS, discriminator_value: None };
        &DECL
    }

    fn initial_values(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("id", AsValue::into_value(self.id)),
            ("plate", AsValue::into_value(self.plate.clone())),
            ("payload_tons", AsValue::into_value(self.payload_tons)),
        ]
    }

    fn from_values(values: &HashMap<&'static str, Value>) -> Result<Self> {
        Ok(Self {
            id: AsValue::try_from_value(values.get("id").cloned().unwrap_or(Value::Null)).map_err(mapping_err("Truck.id"))?,
            plate: AsValue::try_from_value(values.get("plate").cloned().unwrap_or(Value::Null)).map_err(mapping_err("Truck.plate"))?,
            payload_tons: AsValue::try_from_value(values.get("payload_tons").cloned().unwrap_or(Value::Null))
                .map_err(mapping_err("Truck.payload_tons"))?,
        })
    }
}

/// Registers every test entity and finalizes the mapping, the equivalent of
/// the original's `generate_mapping()` call at startup.
pub fn schema() -> Arc<Registry> {
    let mut registry = Registry::new();
    registry.register::<Author>().expect("register Author");
    registry.register::<Book>().expect("register Book");
    registry.register::<Husband>().expect("register Husband");
    registry.register::<Wife>().expect("register Wife");
    registry.register::<Account>().expect("register Account");
    registry.register::<Student>().expect("register Student");
    registry.register::<Course>().expect("register Course");
    registry.register::<Vehicle>().expect("register Vehicle");
    registry.register::<Car>().expect("register Car");
    registry.register::<Truck>().expect("register Truck");
    registry.generate_mapping().expect("generate_mapping");
    Arc::new(registry)
}
