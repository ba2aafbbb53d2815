//! Secondary-index behavior: scan order, maintenance under updates and
//! deletes, null filtering and uniqueness.

use meridiandb::{
    ColumnDef, Database, ErrorCode, IndexDef, Key, KeySet, Mutation, ReadArg, Schema, TableDef,
    Type, Value,
};

fn users_database() -> Database {
    meridian_log::init_for_tests();
    let schema = Schema::builder()
        .table(
            TableDef::new("Users")
                .column(ColumnDef::new("ID", Type::Int64).not_null())
                .column(ColumnDef::new("Name", Type::String))
                .column(ColumnDef::new("Age", Type::Int64))
                .primary_key("ID"),
        )
        .index(IndexDef::new("UsersByName", "Users").column("Name"))
        .index(IndexDef::new("UsersByNameDescending", "Users").column_desc("Name"))
        .index(
            IndexDef::new("UsersByNameNullFiltered", "Users")
                .column("Name")
                .column("Age")
                .null_filtered(),
        )
        .index(
            IndexDef::new("UsersByNameAgeUnique", "Users")
                .column("Name")
                .column("Age")
                .unique(),
        )
        .index(
            IndexDef::new("UsersByNameUniqueFiltered", "Users")
                .column("Name")
                .null_filtered()
                .unique(),
        )
        .build()
        .unwrap();
    Database::new(schema)
}

fn i(v: i64) -> Value {
    Value::Int64(v)
}

fn s(v: &str) -> Value {
    Value::from(v)
}

fn insert(db: &Database, row: Vec<Value>) -> Result<(), meridiandb::Error> {
    db.write(vec![Mutation::insert("Users", &["ID", "Name", "Age"], vec![row])])
        .map(|_| ())
}

fn update(db: &Database, row: Vec<Value>) {
    db.write(vec![Mutation::update("Users", &["ID", "Name", "Age"], vec![row])])
        .unwrap();
}

fn delete_ids(db: &Database, ids: &[i64]) {
    let keys = ids.iter().map(|&id| Key::new(vec![i(id)])).collect();
    db.write(vec![Mutation::delete("Users", KeySet::points(keys))])
        .unwrap();
}

fn read_index(db: &Database, index: &str, columns: &[&str]) -> Vec<Vec<Value>> {
    db.read(&ReadArg::scan("Users", columns).with_index(index))
        .unwrap()
        .into_values()
}

fn seed_five_users(db: &Database) {
    insert(db, vec![i(0), s("Adam"), i(20)]).unwrap();
    insert(db, vec![i(1), s("John"), i(22)]).unwrap();
    insert(db, vec![i(2), s("Peter"), i(41)]).unwrap();
    insert(db, vec![i(4), s("Matthew"), i(33)]).unwrap();
    insert(db, vec![i(5), Value::Null, i(18)]).unwrap();
}

#[test]
fn returns_rows_in_descending_order() {
    let db = users_database();
    seed_five_users(&db);

    assert_eq!(
        read_index(&db, "UsersByNameDescending", &["Name", "ID"]),
        vec![
            vec![s("Peter"), i(2)],
            vec![s("Matthew"), i(4)],
            vec![s("John"), i(1)],
            vec![s("Adam"), i(0)],
            vec![Value::Null, i(5)],
        ]
    );
}

#[test]
fn returns_rows_in_ascending_order() {
    let db = users_database();
    seed_five_users(&db);

    assert_eq!(
        read_index(&db, "UsersByName", &["Name", "ID"]),
        vec![
            vec![Value::Null, i(5)],
            vec![s("Adam"), i(0)],
            vec![s("John"), i(1)],
            vec![s("Matthew"), i(4)],
            vec![s("Peter"), i(2)],
        ]
    );
}

#[test]
fn index_entries_are_updated() {
    let db = users_database();
    insert(&db, vec![i(0), s("Adam"), i(20)]).unwrap();
    insert(&db, vec![i(1), s("John"), i(22)]).unwrap();
    insert(&db, vec![i(2), s("Peter"), i(41)]).unwrap();
    insert(&db, vec![i(4), s("Matthew"), i(33)]).unwrap();
    update(&db, vec![i(2), s("Samantha"), i(24)]);
    update(&db, vec![i(4), s("Alice"), i(21)]);

    assert_eq!(
        read_index(&db, "UsersByName", &["Name", "ID"]),
        vec![
            vec![s("Adam"), i(0)],
            vec![s("Alice"), i(4)],
            vec![s("John"), i(1)],
            vec![s("Samantha"), i(2)],
        ]
    );
}

#[test]
fn index_entries_are_deleted() {
    let db = users_database();
    insert(&db, vec![i(0), s("Adam"), i(20)]).unwrap();
    insert(&db, vec![i(1), s("John"), i(22)]).unwrap();
    insert(&db, vec![i(2), s("Peter"), i(41)]).unwrap();
    insert(&db, vec![i(4), s("Matthew"), i(33)]).unwrap();

    delete_ids(&db, &[0, 2]);
    assert_eq!(
        read_index(&db, "UsersByName", &["Name", "ID"]),
        vec![vec![s("John"), i(1)], vec![s("Matthew"), i(4)]]
    );

    delete_ids(&db, &[1, 4]);
    assert_eq!(read_index(&db, "UsersByName", &["Name", "ID"]), Vec::<Vec<Value>>::new());
}

#[test]
fn empty_index_returns_zero_rows() {
    let db = users_database();
    assert!(db
        .read(&ReadArg::scan("Users", &["ID", "Name", "Age"]))
        .unwrap()
        .into_values()
        .is_empty());
    assert!(read_index(&db, "UsersByName", &["Name", "ID"]).is_empty());
}

#[test]
fn null_entries_are_filtered() {
    let db = users_database();
    insert(&db, vec![i(0), s("Adam"), i(20)]).unwrap();
    insert(&db, vec![i(1), s(""), i(22)]).unwrap();
    insert(&db, vec![i(2), Value::Null, i(41)]).unwrap();
    insert(&db, vec![i(3), s("John"), i(28)]).unwrap();
    insert(&db, vec![i(4), s("Matthew"), Value::Null]).unwrap();

    // Empty string participates; typed null does not.
    assert_eq!(
        read_index(&db, "UsersByNameNullFiltered", &["Name", "Age", "ID"]),
        vec![
            vec![s(""), i(22), i(1)],
            vec![s("Adam"), i(20), i(0)],
            vec![s("John"), i(28), i(3)],
        ]
    );
}

#[test]
fn all_entries_are_unique() {
    let db = users_database();
    insert(&db, vec![i(0), s("Adam"), i(20)]).unwrap();
    insert(&db, vec![i(1), s(""), i(22)]).unwrap();
    insert(&db, vec![i(2), Value::Null, i(41)]).unwrap();
    insert(&db, vec![i(3), s("John"), i(28)]).unwrap();

    // Exact duplicate of (Adam, 20).
    assert_eq!(
        insert(&db, vec![i(4), s("Adam"), i(20)]).unwrap_err().code(),
        ErrorCode::AlreadyExists
    );
    // Duplicate "" name collides in the null-filtered unique Name index.
    assert_eq!(
        insert(&db, vec![i(5), s(""), i(20)]).unwrap_err().code(),
        ErrorCode::AlreadyExists
    );
    // Nulls participate in the non-null-filtered unique (Name, Age) index.
    assert_eq!(
        insert(&db, vec![i(6), Value::Null, i(41)]).unwrap_err().code(),
        ErrorCode::AlreadyExists
    );
    insert(&db, vec![i(7), s("Matthew"), Value::Null]).unwrap();

    assert_eq!(
        read_index(&db, "UsersByNameAgeUnique", &["Name", "Age", "ID"]),
        vec![
            vec![Value::Null, i(41), i(2)],
            vec![s(""), i(22), i(1)],
            vec![s("Adam"), i(20), i(0)],
            vec![s("John"), i(28), i(3)],
            vec![s("Matthew"), Value::Null, i(7)],
        ]
    );
}

#[test]
fn implicit_nulls_trigger_unique_violation_across_transactions() {
    let db = users_database();
    // Only the key is supplied; Name and Age default to NULL, producing the
    // index key (NULL, NULL) in the unique (Name, Age) index.
    db.write(vec![Mutation::insert("Users", &["ID"], vec![vec![i(0)]])])
        .unwrap();
    let err = db
        .write(vec![Mutation::insert("Users", &["ID"], vec![vec![i(1)]])])
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::AlreadyExists);
}

#[test]
fn implicit_nulls_trigger_unique_violation_within_one_transaction() {
    let db = users_database();
    let err = db
        .write(vec![
            Mutation::insert_or_update("Users", &["ID"], vec![vec![i(0)]]),
            Mutation::insert("Users", &["ID"], vec![vec![i(1)]]),
        ])
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::AlreadyExists);
    // The failed batch wrote nothing.
    assert!(db
        .read(&ReadArg::scan("Users", &["ID"]))
        .unwrap()
        .into_values()
        .is_empty());
}

#[test]
fn null_filtered_unique_index_allows_null_duplicates() {
    // No non-null-filtered unique index here: only the null-filtered one.
    let schema = Schema::builder()
        .table(
            TableDef::new("Users")
                .column(ColumnDef::new("ID", Type::Int64).not_null())
                .column(ColumnDef::new("Name", Type::String))
                .column(ColumnDef::new("Age", Type::Int64))
                .primary_key("ID"),
        )
        .index(
            IndexDef::new("UsersByNameUniqueFiltered", "Users")
                .column("Name")
                .null_filtered()
                .unique(),
        )
        .build()
        .unwrap();
    let db = Database::new(schema);

    // Both rows project Name = NULL, generate no entry, and never collide.
    db.write(vec![Mutation::insert("Users", &["ID"], vec![vec![i(0)]])])
        .unwrap();
    db.write(vec![Mutation::insert("Users", &["ID"], vec![vec![i(1)]])])
        .unwrap();

    assert!(read_index_on(&db, "UsersByNameUniqueFiltered", &["Name", "ID"]).is_empty());

    // Non-null duplicates still collide.
    insert_on(&db, vec![i(2), s("Adam"), i(20)]).unwrap();
    assert_eq!(
        insert_on(&db, vec![i(3), s("Adam"), i(25)]).unwrap_err().code(),
        ErrorCode::AlreadyExists
    );
}

#[test]
fn unique_and_null_filtered_entries() {
    let db = users_database();
    insert(&db, vec![i(0), s("Adam"), i(20)]).unwrap();
    insert(&db, vec![i(1), s(""), i(22)]).unwrap();
    insert(&db, vec![i(2), Value::Null, i(41)]).unwrap();
    insert(&db, vec![i(3), s("John"), i(28)]).unwrap();

    assert_eq!(
        insert(&db, vec![i(4), s("Adam"), i(20)]).unwrap_err().code(),
        ErrorCode::AlreadyExists
    );
    assert_eq!(
        insert(&db, vec![i(5), s(""), i(22)]).unwrap_err().code(),
        ErrorCode::AlreadyExists
    );
    // A null-bearing duplicate differs in Age, and Name NULL is filtered
    // from the unique Name index, so it passes.
    insert(&db, vec![i(6), Value::Null, i(43)]).unwrap();
    insert(&db, vec![i(7), s("Matthew"), Value::Null]).unwrap();

    assert_eq!(
        read_index(&db, "UsersByNameUniqueFiltered", &["Name", "ID"]),
        vec![
            vec![s(""), i(1)],
            vec![s("Adam"), i(0)],
            vec![s("John"), i(3)],
            vec![s("Matthew"), i(7)],
        ]
    );
}

#[test]
fn covering_columns_are_readable_through_the_index() {
    let schema = Schema::builder()
        .table(
            TableDef::new("Users")
                .column(ColumnDef::new("ID", Type::Int64).not_null())
                .column(ColumnDef::new("Name", Type::String))
                .column(ColumnDef::new("Age", Type::Int64))
                .primary_key("ID"),
        )
        .index(IndexDef::new("UsersByName", "Users").column("Name").storing("Age"))
        .build()
        .unwrap();
    let db = Database::new(schema);
    insert_on(&db, vec![i(0), s("Adam"), i(20)]).unwrap();

    assert_eq!(
        read_index_on(&db, "UsersByName", &["Name", "Age", "ID"]),
        vec![vec![s("Adam"), i(20), i(0)]]
    );
    // A stored column tracks updates of its base row.
    db.write(vec![Mutation::update(
        "Users",
        &["ID", "Age"],
        vec![vec![i(0), i(21)]],
    )])
    .unwrap();
    assert_eq!(
        read_index_on(&db, "UsersByName", &["Age"]),
        vec![vec![i(21)]]
    );
}

#[test]
fn non_index_columns_cannot_be_read_through_an_index() {
    let db = users_database();
    seed_five_users(&db);
    let err = db
        .read(&ReadArg::scan("Users", &["Name", "Age"]).with_index("UsersByName"))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::FailedPrecondition);
}

// Helpers for the tests that build their own schema.

fn insert_on(db: &Database, row: Vec<Value>) -> Result<(), meridiandb::Error> {
    db.write(vec![Mutation::insert("Users", &["ID", "Name", "Age"], vec![row])])
        .map(|_| ())
}

fn read_index_on(db: &Database, index: &str, columns: &[&str]) -> Vec<Vec<Value>> {
    db.read(&ReadArg::scan("Users", columns).with_index(index))
        .unwrap()
        .into_values()
}
