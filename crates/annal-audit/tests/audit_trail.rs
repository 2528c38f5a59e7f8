//! End-to-end audit trail tests over the in-memory host runtime.

use annal_audit::memory::{MemorySession, MemoryStore};
use annal_audit::{
    AuditError, AuditRegistry, DetectionError, RecordId, RecordIdGenerator, WriteError,
    install_audit_hooks, install_interceptor,
};
use annal_audit::{ChangeInterceptor, EntityKey};
use annal_core::{
    AuditConfig, CaptureMode, Column, ColumnType, DetectionFailurePolicy, EntitySchema,
    RecordIdStrategy, Relationship, SchemaError, Value, WritePolicy,
};
use chrono::NaiveDate;
use pretty_assertions::assert_eq;
use std::sync::Arc;

fn user_schema() -> Arc<EntitySchema> {
    let mut s = EntitySchema::new("User", "users");
    s.add_column(Column::new("id", ColumnType::Integer).primary_key())
        .unwrap();
    s.add_column(Column::new("email", ColumnType::Text).not_null().unique())
        .unwrap();
    s.seal().unwrap()
}

fn reservation_schema() -> Arc<EntitySchema> {
    let mut s = EntitySchema::new("Reservation", "reservations");
    s.add_column(Column::new("id", ColumnType::Integer).primary_key())
        .unwrap();
    s.add_column(Column::new("name", ColumnType::Text).not_null())
        .unwrap();
    s.add_column(Column::new("date", ColumnType::Date)).unwrap();
    s.add_column(Column::new("party", ColumnType::Integer).default_expr("2"))
        .unwrap();
    s.add_column(Column::new("owner_id", ColumnType::Integer).references("users", "id"))
        .unwrap();
    s.add_relationship(Relationship::new("owner", "User").via("owner_id"))
        .unwrap();
    s.seal().unwrap()
}

fn registry_with(config: AuditConfig) -> Arc<AuditRegistry> {
    let mut registry = AuditRegistry::new(config).unwrap();
    registry.make_auditable(reservation_schema()).unwrap();
    Arc::new(registry)
}

fn session(store: &Arc<MemoryStore>, registry: &Arc<AuditRegistry>) -> MemorySession {
    let mut session = MemorySession::new(store.clone());
    install_audit_hooks(&mut session, registry.clone());
    session
}

fn date(y: i32, m: u32, d: u32) -> Value {
    Value::Date(NaiveDate::from_ymd_opt(y, m, d).unwrap())
}

fn create_reservation(store: &Arc<MemoryStore>, registry: &Arc<AuditRegistry>) {
    let mut s = session(store, registry);
    s.add(
        "Reservation",
        "r:1",
        [
            ("id", Value::Int(1)),
            ("name", Value::from("Me")),
            ("date", date(2015, 4, 2)),
            ("party", Value::Int(2)),
        ],
    )
    .unwrap();
    s.commit().unwrap();
}

const RESERVATIONS: &str = "reservations_audit";

#[test]
fn test_reservation_lifecycle() {
    let registry = registry_with(AuditConfig::default());
    let store = MemoryStore::new();

    create_reservation(&store, &registry);
    let rows = store.audit_rows_in(RESERVATIONS);
    assert_eq!(rows.len(), 1);
    assert!(!rows[0].is_delete);
    assert_eq!(rows[0].get("name"), Some(&Value::from("Me")));
    assert_eq!(rows[0].get("date"), Some(&date(2015, 4, 2)));
    assert_eq!(rows[0].get("party"), Some(&Value::Int(2)));

    let mut s = session(&store, &registry);
    s.set("r:1", "party", 5).unwrap();
    s.commit().unwrap();

    let rows = store.audit_rows_in(RESERVATIONS);
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[1].get("party"), Some(&Value::Int(5)));
    assert_eq!(rows[1].get("name"), Some(&Value::from("Me")));
    assert_eq!(rows[1].get("date"), Some(&date(2015, 4, 2)));
    assert!(!rows[1].is_delete);

    let mut s = session(&store, &registry);
    s.delete("r:1").unwrap();
    s.commit().unwrap();

    let rows = store.audit_rows_in(RESERVATIONS);
    assert_eq!(rows.len(), 3);
    let last = &rows[2];
    assert!(last.is_delete);
    assert_eq!(last.get("id"), Some(&Value::Int(1)));
    for column in ["name", "date", "party", "owner_id"] {
        assert_eq!(last.get(column), Some(&Value::Null), "{column}");
    }
    assert!(!store.contains(&EntityKey::from("r:1")));

    let record_ids: std::collections::HashSet<RecordId> =
        rows.iter().map(|r| r.record_id).collect();
    assert_eq!(record_ids.len(), 3);
}

#[test]
fn test_reassigning_current_value_writes_nothing() {
    let registry = registry_with(AuditConfig::default());
    let store = MemoryStore::new();
    create_reservation(&store, &registry);

    let mut s = session(&store, &registry);
    s.set("r:1", "party", 2).unwrap();
    let report = s.commit().unwrap();

    assert_eq!(report.inspected, 1);
    assert_eq!(report.changed, 0);
    assert_eq!(store.audit_rows_in(RESERVATIONS).len(), 1);
}

#[test]
fn test_one_row_per_flush_in_timestamp_order() {
    let registry = registry_with(AuditConfig::default());
    let store = MemoryStore::new();
    let interceptor = Arc::new(ChangeInterceptor::new(registry.clone()));

    for (party, key) in [(2, None), (3, Some("r:1")), (4, Some("r:1")), (5, Some("r:1"))] {
        let mut s = MemorySession::new(store.clone());
        install_interceptor(&mut s, interceptor.clone());
        match key {
            None => s
                .add(
                    "Reservation",
                    "r:1",
                    [("id", Value::Int(1)), ("name", Value::from("Me")), ("party", Value::Int(party))],
                )
                .unwrap(),
            Some(key) => s.set(key, "party", party).unwrap(),
        }
        s.commit().unwrap();
    }

    let rows = store.audit_rows_in(RESERVATIONS);
    let parties: Vec<&Value> = rows.iter().filter_map(|r| r.get("party")).collect();
    assert_eq!(
        parties,
        vec![&Value::Int(2), &Value::Int(3), &Value::Int(4), &Value::Int(5)]
    );
    assert!(rows.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
}

#[test]
fn test_several_flushes_in_one_transaction() {
    let registry = registry_with(AuditConfig::default());
    let store = MemoryStore::new();
    create_reservation(&store, &registry);

    let mut s = session(&store, &registry);
    s.set("r:1", "party", 3).unwrap();
    s.flush().unwrap();
    s.set("r:1", "party", 4).unwrap();
    s.flush().unwrap();
    assert_eq!(s.pending_audit_rows().len(), 2);
    assert_eq!(store.audit_rows_in(RESERVATIONS).len(), 1);

    s.commit().unwrap();
    let rows = store.audit_rows_in(RESERVATIONS);
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[2].get("party"), Some(&Value::Int(4)));
}

#[test]
fn test_nullable_round_trip() {
    let registry = registry_with(AuditConfig::default());
    let store = MemoryStore::new();

    let mut s = session(&store, &registry);
    s.add(
        "Reservation",
        "r:2",
        [("id", Value::Int(2)), ("name", Value::from("Solo"))],
    )
    .unwrap();
    s.commit().unwrap();

    let mut s = session(&store, &registry);
    s.set("r:2", "date", date(2020, 1, 1)).unwrap();
    s.set("r:2", "party", 1).unwrap();
    s.commit().unwrap();

    let rows = store.audit_rows_in(RESERVATIONS);
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].get("date"), Some(&Value::Null));
    assert_eq!(rows[0].get("party"), Some(&Value::Null));
    assert_eq!(rows[0].get("owner_id"), Some(&Value::Null));
    assert_eq!(rows[1].get("date"), Some(&date(2020, 1, 1)));
    assert_eq!(rows[1].get("party"), Some(&Value::Int(1)));
    assert_eq!(rows[1].get("name"), Some(&Value::from("Solo")));
}

#[test]
fn test_audit_columns_never_more_restrictive() {
    let mut registry = AuditRegistry::new(AuditConfig::default()).unwrap();
    registry.make_auditable(user_schema()).unwrap();
    registry.make_auditable(reservation_schema()).unwrap();

    for table in registry.tables() {
        for column in table.business_columns() {
            assert!(column.nullable, "{}.{}", table.name, column.name);
            assert_eq!(column.default, None, "{}.{}", table.name, column.name);
            assert!(!column.primary_key);
        }
    }
}

#[test]
fn test_deferred_attribute_is_materialized() {
    let registry = registry_with(AuditConfig::default());
    let store = MemoryStore::new();
    create_reservation(&store, &registry);

    let mut s = session(&store, &registry);
    s.load_deferred("r:1", &["name", "date"]).unwrap();
    s.set("r:1", "party", 6).unwrap();
    s.commit().unwrap();

    let rows = store.audit_rows_in(RESERVATIONS);
    assert_eq!(rows[1].get("name"), Some(&Value::from("Me")));
    assert_eq!(rows[1].get("date"), Some(&date(2015, 4, 2)));
}

#[test]
fn test_assignment_over_unloaded_value_counts_as_change() {
    let registry = registry_with(AuditConfig::default());
    let store = MemoryStore::new();
    create_reservation(&store, &registry);

    let mut s = session(&store, &registry);
    s.load_deferred("r:1", &["party"]).unwrap();
    s.set("r:1", "party", 2).unwrap();
    s.commit().unwrap();

    assert_eq!(store.audit_rows_in(RESERVATIONS).len(), 2);
}

#[test]
fn test_relationship_swap_is_a_change() {
    let registry = registry_with(AuditConfig::default());
    let store = MemoryStore::new();

    let mut s = session(&store, &registry);
    s.add("User", "u:1", [("id", Value::Int(10))]).unwrap();
    s.add("User", "u:2", [("id", Value::Int(20))]).unwrap();
    s.add(
        "Reservation",
        "r:1",
        [("id", Value::Int(1)), ("name", Value::from("Me"))],
    )
    .unwrap();
    s.relate("r:1", "owner", Some(EntityKey::from("u:1")), "owner_id", "id")
        .unwrap();
    s.commit().unwrap();

    let rows = store.audit_rows_in(RESERVATIONS);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("owner_id"), Some(&Value::Int(10)));

    let mut s = session(&store, &registry);
    s.relate("r:1", "owner", Some(EntityKey::from("u:2")), "owner_id", "id")
        .unwrap();
    s.commit().unwrap();

    let rows = store.audit_rows_in(RESERVATIONS);
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[1].get("owner_id"), Some(&Value::Int(20)));

    // Users are not audited.
    assert!(store.audit_rows().iter().all(|r| r.table == RESERVATIONS));
}

#[test]
fn test_reassigning_same_related_object_writes_nothing() {
    let registry = registry_with(AuditConfig::default());
    let store = MemoryStore::new();

    let mut s = session(&store, &registry);
    s.add("User", "u:1", [("id", Value::Int(10))]).unwrap();
    s.add(
        "Reservation",
        "r:1",
        [("id", Value::Int(1)), ("name", Value::from("Me"))],
    )
    .unwrap();
    s.relate("r:1", "owner", Some(EntityKey::from("u:1")), "owner_id", "id")
        .unwrap();
    s.commit().unwrap();

    let mut s = session(&store, &registry);
    s.relate("r:1", "owner", Some(EntityKey::from("u:1")), "owner_id", "id")
        .unwrap();
    s.commit().unwrap();

    assert_eq!(store.audit_rows_in(RESERVATIONS).len(), 1);
}

fn employee_registry(config: AuditConfig) -> Arc<AuditRegistry> {
    let mut employee = EntitySchema::new("Employee", "employees");
    employee
        .add_column(Column::new("id", ColumnType::Integer).primary_key())
        .unwrap();
    employee
        .add_column(Column::new("name", ColumnType::Text))
        .unwrap();
    employee
        .add_column(Column::new("kind", ColumnType::Text))
        .unwrap();
    employee.set_discriminator("kind");
    employee.set_polymorphic_identity("employee");
    let employee = employee.seal().unwrap();

    let mut engineer = EntitySchema::single("Engineer", employee.clone());
    engineer
        .add_column(Column::new("language", ColumnType::Text))
        .unwrap();
    engineer.set_polymorphic_identity("engineer");

    let mut manager = EntitySchema::joined("Manager", "managers", employee.clone());
    manager
        .add_column(
            Column::new("manager_id", ColumnType::Integer)
                .primary_key()
                .mapped_by("id")
                .references("employees", "id"),
        )
        .unwrap();
    manager
        .add_column(Column::new("budget", ColumnType::Float))
        .unwrap();
    manager.set_polymorphic_identity("manager");

    let mut registry = AuditRegistry::new(config).unwrap();
    registry.make_auditable(employee).unwrap();
    registry.make_auditable(engineer.seal().unwrap()).unwrap();
    registry.make_auditable(manager.seal().unwrap()).unwrap();
    Arc::new(registry)
}

#[test]
fn test_joined_insert_writes_one_row_per_level() {
    let registry = employee_registry(AuditConfig::default());
    let store = MemoryStore::new();

    let mut s = session(&store, &registry);
    s.add(
        "Manager",
        "m:1",
        [
            ("id", Value::Int(1)),
            ("name", Value::from("Grace")),
            ("kind", Value::from("manager")),
            ("budget", Value::Float(100.0)),
        ],
    )
    .unwrap();
    let report = s.commit().unwrap();
    assert_eq!(report.rows_staged, 2);

    let rows = store.audit_rows();
    let tables: Vec<&str> = rows.iter().map(|r| r.table.as_str()).collect();
    assert_eq!(tables, vec!["employees_audit", "managers_audit"]);
    assert_eq!(rows[0].record_id, rows[1].record_id);
    assert_eq!(rows[0].timestamp, rows[1].timestamp);
    assert_eq!(rows[0].shadow_type, "ManagerAudit");

    assert_eq!(rows[0].get("name"), Some(&Value::from("Grace")));
    assert_eq!(rows[0].get("kind"), Some(&Value::from("manager")));
    // Declared by a sibling single-table subtype.
    assert_eq!(rows[0].get("language"), Some(&Value::Null));
    assert_eq!(rows[1].get("manager_id"), Some(&Value::Int(1)));
    assert_eq!(rows[1].get("budget"), Some(&Value::Float(100.0)));
}

#[test]
fn test_joined_delete_nulls_every_level() {
    let registry = employee_registry(AuditConfig::default());
    let store = MemoryStore::new();

    let mut s = session(&store, &registry);
    s.add(
        "Manager",
        "m:1",
        [
            ("id", Value::Int(1)),
            ("name", Value::from("Grace")),
            ("kind", Value::from("manager")),
            ("budget", Value::Float(100.0)),
        ],
    )
    .unwrap();
    s.commit().unwrap();

    let mut s = session(&store, &registry);
    s.delete("m:1").unwrap();
    s.commit().unwrap();

    let rows = store.audit_rows();
    assert_eq!(rows.len(), 4);
    let deletion = &rows[2..];
    assert!(deletion.iter().all(|r| r.is_delete));
    assert_eq!(deletion[0].record_id, deletion[1].record_id);
    assert_eq!(deletion[0].get("id"), Some(&Value::Int(1)));
    assert_eq!(deletion[0].get("name"), Some(&Value::Null));
    assert_eq!(deletion[1].get("manager_id"), Some(&Value::Int(1)));
    assert_eq!(deletion[1].get("budget"), Some(&Value::Null));
}

#[test]
fn test_single_table_subtype_writes_one_row() {
    let registry = employee_registry(AuditConfig::default());
    let store = MemoryStore::new();

    let mut s = session(&store, &registry);
    s.add(
        "Engineer",
        "e:1",
        [
            ("id", Value::Int(2)),
            ("name", Value::from("Linus")),
            ("kind", Value::from("engineer")),
            ("language", Value::from("c")),
        ],
    )
    .unwrap();
    s.commit().unwrap();

    let rows = store.audit_rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].table, "employees_audit");
    assert_eq!(rows[0].shadow_type, "EngineerAudit");
    assert_eq!(rows[0].get("language"), Some(&Value::from("c")));
}

#[test]
fn test_always_policy_writes_on_every_save() {
    let config = AuditConfig {
        write_policy: WritePolicy::Always,
        ..Default::default()
    };
    let registry = registry_with(config);
    let store = MemoryStore::new();
    create_reservation(&store, &registry);

    let mut s = session(&store, &registry);
    s.set("r:1", "party", 2).unwrap();
    s.commit().unwrap();

    assert_eq!(store.audit_rows_in(RESERVATIONS).len(), 2);
}

#[test]
fn test_superseded_capture_records_prior_value() {
    let config = AuditConfig {
        capture: CaptureMode::Superseded,
        ..Default::default()
    };
    let registry = registry_with(config);
    let store = MemoryStore::new();
    create_reservation(&store, &registry);

    let mut s = session(&store, &registry);
    s.set("r:1", "party", 5).unwrap();
    s.commit().unwrap();

    let rows = store.audit_rows_in(RESERVATIONS);
    assert_eq!(rows[1].get("party"), Some(&Value::Int(2)));
}

#[test]
fn test_detection_failure_aborts_transaction() {
    let registry = registry_with(AuditConfig::default());
    let store = MemoryStore::new();
    create_reservation(&store, &registry);

    let mut s = session(&store, &registry);
    s.load_deferred("r:1", &["name"]).unwrap();
    s.make_unloadable("r:1", "name");
    s.set("r:1", "party", 9).unwrap();
    let err = s.commit().unwrap_err();

    assert!(matches!(
        err,
        AuditError::Detection(DetectionError::Load { .. })
    ));
    // Neither the primary write nor any audit row persisted.
    let row = store.row(&EntityKey::from("r:1")).unwrap();
    assert_eq!(row.get("party"), Some(&Value::Int(2)));
    assert_eq!(store.audit_rows_in(RESERVATIONS).len(), 1);
}

#[test]
fn test_detection_failure_skip_policy() {
    let config = AuditConfig {
        on_detection_error: DetectionFailurePolicy::Skip,
        ..Default::default()
    };
    let registry = registry_with(config);
    let store = MemoryStore::new();
    create_reservation(&store, &registry);

    let mut s = session(&store, &registry);
    s.load_deferred("r:1", &["name"]).unwrap();
    s.make_unloadable("r:1", "name");
    s.set("r:1", "party", 9).unwrap();
    let report = s.commit().unwrap();

    assert_eq!(report.skipped, 1);
    assert_eq!(report.rows_staged, 0);
    let row = store.row(&EntityKey::from("r:1")).unwrap();
    assert_eq!(row.get("party"), Some(&Value::Int(9)));
    assert_eq!(store.audit_rows_in(RESERVATIONS).len(), 1);
}

#[test]
fn test_sequence_record_ids() {
    let config = AuditConfig {
        record_id: RecordIdStrategy::Sequence,
        ..Default::default()
    };
    let registry = registry_with(config);
    let store = MemoryStore::new();

    let interceptor = Arc::new(
        ChangeInterceptor::new(registry.clone())
            .with_ids(RecordIdGenerator::starting_at(RecordIdStrategy::Sequence, 100)),
    );

    let mut s = MemorySession::new(store.clone());
    install_interceptor(&mut s, interceptor.clone());
    s.add("Reservation", "r:1", [("id", Value::Int(1)), ("name", Value::from("A"))])
        .unwrap();
    s.commit().unwrap();

    let mut s = MemorySession::new(store.clone());
    install_interceptor(&mut s, interceptor);
    s.set("r:1", "name", "B").unwrap();
    s.commit().unwrap();

    let ids: Vec<RecordId> = store.audit_rows().iter().map(|r| r.record_id).collect();
    assert_eq!(ids, vec![RecordId::Sequence(100), RecordId::Sequence(101)]);
}

#[test]
fn test_untracked_types_are_ignored() {
    let registry = registry_with(AuditConfig::default());
    let store = MemoryStore::new();

    let mut s = session(&store, &registry);
    s.add("Note", "n:1", [("id", Value::Int(1))]).unwrap();
    let report = s.commit().unwrap();

    assert_eq!(report.inspected, 0);
    assert!(store.audit_rows().is_empty());
    assert!(store.contains(&EntityKey::from("n:1")));
}

#[test]
fn test_installing_twice_is_idempotent() {
    let registry = registry_with(AuditConfig::default());
    let store = MemoryStore::new();

    let mut s = MemorySession::new(store.clone());
    install_audit_hooks(&mut s, registry.clone());
    install_audit_hooks(&mut s, registry.clone());
    s.add("Reservation", "r:1", [("id", Value::Int(1)), ("name", Value::from("A"))])
        .unwrap();
    s.commit().unwrap();

    assert_eq!(store.audit_rows().len(), 1);
}

#[test]
fn test_registration_errors() {
    let mut registry = AuditRegistry::new(AuditConfig::default()).unwrap();

    let mut orphan = EntitySchema::new("Orphan", "orphans");
    orphan
        .add_column(Column::new("name", ColumnType::Text))
        .unwrap();
    assert_eq!(
        orphan.seal().unwrap_err(),
        SchemaError::MissingPrimaryKey {
            entity: "Orphan".to_string()
        }
    );

    let mut clash = EntitySchema::new("Clash", "clashes");
    clash
        .add_column(Column::new("id", ColumnType::Integer).primary_key())
        .unwrap();
    clash
        .add_column(Column::new("audit_isdelete", ColumnType::Boolean))
        .unwrap();
    let err = registry.make_auditable(clash.seal().unwrap()).unwrap_err();
    assert!(matches!(err, SchemaError::ReservedColumn { .. }));

    let parent = user_schema();
    let mut child = EntitySchema::joined("Admin", "admins", parent);
    child
        .add_column(
            Column::new("id", ColumnType::Integer)
                .primary_key()
                .references("users", "id"),
        )
        .unwrap();
    let err = registry.make_auditable(child.seal().unwrap()).unwrap_err();
    assert!(matches!(err, SchemaError::ParentNotRegistered { .. }));
    assert!(registry.tables().is_empty());

    let audit_err: AuditError = err.into();
    assert!(matches!(audit_err, AuditError::Schema(_)));
}

#[test]
fn test_write_failure_aborts_transaction() {
    let registry = employee_registry(AuditConfig::default());
    let store = MemoryStore::new();

    let mut s = session(&store, &registry);
    s.add(
        "Manager",
        "m:1",
        [
            ("id", Value::Int(1)),
            ("name", Value::from("Grace")),
            ("kind", Value::from("manager")),
            ("budget", Value::Float(100.0)),
        ],
    )
    .unwrap();
    s.commit().unwrap();
    let before = store.audit_rows();

    // The root row stages, the managers_audit row is refused.
    let mut s = session(&store, &registry);
    s.limit_staging(1);
    s.set("m:1", "budget", 250.0).unwrap();
    let err = s.commit().unwrap_err();

    match err {
        AuditError::Write(WriteError::Staging { table, .. }) => {
            assert_eq!(table, "managers_audit")
        }
        other => panic!("unexpected error: {other}"),
    }
    let row = store.row(&EntityKey::from("m:1")).unwrap();
    assert_eq!(row.get("budget"), Some(&Value::Float(100.0)));
    assert_eq!(store.audit_rows(), before);

    let mut s = session(&store, &registry);
    s.limit_staging(1);
    s.add(
        "Manager",
        "m:2",
        [
            ("id", Value::Int(2)),
            ("name", Value::from("Alan")),
            ("kind", Value::from("manager")),
            ("budget", Value::Float(3.0)),
        ],
    )
    .unwrap();
    assert!(matches!(s.commit(), Err(AuditError::Write(_))));
    assert!(!store.contains(&EntityKey::from("m:2")));
    assert_eq!(store.audit_rows(), before);
}

#[test]
fn test_sequence_ids_unique_across_sessions() {
    let config = AuditConfig {
        record_id: RecordIdStrategy::Sequence,
        ..Default::default()
    };
    let registry = registry_with(config);
    registry.record_ids().advance_to(7);
    let store = MemoryStore::new();

    create_reservation(&store, &registry);
    let mut s = session(&store, &registry);
    s.set("r:1", "party", 3).unwrap();
    s.commit().unwrap();
    let mut s = session(&store, &registry);
    s.delete("r:1").unwrap();
    s.commit().unwrap();

    let ids: Vec<RecordId> = store.audit_rows().iter().map(|r| r.record_id).collect();
    assert_eq!(
        ids,
        vec![
            RecordId::Sequence(7),
            RecordId::Sequence(8),
            RecordId::Sequence(9)
        ]
    );
}
