//! Integration tests for the day aggregation family
//!
//! Runs the orchestrator against a real SQLite file and checks the rolling
//! and daily tables against an in-memory merge of the seeded epochs.
//!
//! Key integration points tested:
//! - Genesis offset (short first day) and partition naming
//! - Rerun idempotence and catch-up after downtime
//! - Concurrent invocations of the same family
//! - The same engine driving a day to week rollup

#[cfg(test)]
mod aggregation_integration_tests {
    use epochflow::aggregation::config::{MAINNET_GENESIS_TIMESTAMP, RollingTarget};
    use epochflow::aggregation::db::{
        create_partition_table, ensure_partition_registry, ensure_source_table, insert_source_rows,
        read_rolling_rows,
    };
    use epochflow::aggregation::partitions::PartitionManager;
    use epochflow::aggregation::{
        AggregateRow, AggregationBudget, AggregationConfig, AggregationError, AggregationFamily,
        AggregationOrchestrator, FieldMergeSpec, FieldValue, SourceRow, SqliteStore,
        TimeUnitClock, UnitBounds,
    };
    use std::sync::Arc;
    use tempfile::{tempdir, TempDir};

    const VALIDATORS: u64 = 3;

    fn day_family() -> AggregationFamily {
        AggregationConfig::from_env().day_family().unwrap()
    }

    fn setup() -> (TempDir, SqliteStore) {
        let dir = tempdir().unwrap();
        let store = SqliteStore::new(dir.path().join("epochflow.db"));
        (dir, store)
    }

    fn unit_row(spec: &FieldMergeSpec, unit: u64, validator: u64) -> SourceRow {
        SourceRow::zeroed(unit, validator, spec)
            .with(spec, "attestations_reward", FieldValue::Integer((unit % 5 + validator) as i64))
            .with(spec, "blocks_proposed", FieldValue::Integer((unit % 32 == validator) as i64))
            .with(spec, "sync_chance", FieldValue::Real(0.5))
            .with(spec, "slashed", FieldValue::Bool(validator == 2 && unit == 100))
            .with(spec, "last_executed_duty_epoch", FieldValue::Integer(unit as i64))
            .with_balances(32_000_000_000 + unit as i64, 32_000_000_000 + unit as i64 + 1)
    }

    fn seed(store: &SqliteStore, family: &AggregationFamily, units: std::ops::Range<u64>) -> Vec<SourceRow> {
        let mut conn = store.open().unwrap();
        ensure_source_table(&conn, &family.source_table, &family.fields).unwrap();
        let rows: Vec<SourceRow> = units
            .flat_map(|unit| (0..VALIDATORS).map(move |v| (unit, v)))
            .map(|(unit, v)| unit_row(&family.fields, unit, v))
            .collect();
        insert_source_rows(&mut conn, &family.source_table, &family.fields, &rows).unwrap();
        rows
    }

    /// Merge the seeded rows of one validator over `[start, end)` in memory
    fn reference(spec: &FieldMergeSpec, rows: &[SourceRow], validator: u64, start: u64, end: u64) -> Vec<FieldValue> {
        rows.iter()
            .filter(|r| r.validator_index == validator)
            .filter(|r| start <= r.bounds.epoch_start && r.bounds.epoch_start < end)
            .map(|r| r.values.clone())
            .reduce(|acc, values| {
                spec.fields()
                    .iter()
                    .zip(acc.into_iter().zip(values))
                    .map(|(field, (a, b))| field.op.merge(a, b))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn daily_rows(store: &SqliteStore, family: &AggregationFamily) -> Vec<AggregateRow> {
        let conn = store.open().unwrap();
        PartitionManager::new(&family.fixed_table)
            .unwrap()
            .read_all(&conn, &family.fields)
            .unwrap()
    }

    fn rolling_rows(store: &SqliteStore, family: &AggregationFamily) -> Vec<AggregateRow> {
        let conn = store.open().unwrap();
        let table = &family.rolling.as_ref().unwrap().table;
        read_rolling_rows(&conn, table, &family.fields).unwrap()
    }

    #[tokio::test]
    async fn test_first_day_after_genesis() {
        let (_dir, store) = setup();
        let family = day_family();
        let rows = seed(&store, &family, 0..250);

        let orchestrator =
            AggregationOrchestrator::from_family(store.clone(), &family, AggregationBudget::new(4)).unwrap();
        orchestrator.run_aggregation(true).await.unwrap();

        // genesis is 112 epochs after midnight: day one is [0, 113)
        let daily = daily_rows(&store, &family);
        assert_eq!(daily.len(), 2 * VALIDATORS as usize);
        assert_eq!(daily[0].bounds, UnitBounds::new(0, 113));
        assert_eq!(daily[0].bucket, Some(MAINNET_GENESIS_TIMESTAMP));
        // day two is still open
        assert_eq!(daily[3].bounds, UnitBounds::new(113, 250));

        for row in &daily {
            let start = row.bounds.epoch_start;
            let end = row.bounds.epoch_end;
            assert_eq!(row.values, reference(&family.fields, &rows, row.validator_index, start, end));
        }
        assert_eq!(daily[2].value(&family.fields, "slashed"), Some(FieldValue::Bool(true)));
        assert_eq!(daily[5].value(&family.fields, "slashed"), Some(FieldValue::Bool(false)));
        assert_eq!(daily[0].balances.balance_start, Some(32_000_000_000));
        assert_eq!(daily[0].balances.balance_end, Some(32_000_000_113));

        let conn = store.open().unwrap();
        let partitions = PartitionManager::new(&family.fixed_table)
            .unwrap()
            .partitions(&conn)
            .unwrap();
        assert_eq!(partitions.len(), 1);
        assert_eq!(partitions[0].name, "validator_dashboard_data_daily_20201201_20201207");

        // rolling window is the last 225 epochs: [25, 249]
        let rolling = rolling_rows(&store, &family);
        assert_eq!(rolling.len(), VALIDATORS as usize);
        for row in &rolling {
            assert_eq!(row.bounds, UnitBounds::new(25, 250));
            assert_eq!(row.values, reference(&family.fields, &rows, row.validator_index, 25, 250));
        }
    }

    #[tokio::test]
    async fn test_rerun_is_idempotent() {
        let (_dir, store) = setup();
        let family = day_family();
        seed(&store, &family, 0..400);

        let orchestrator =
            AggregationOrchestrator::from_family(store.clone(), &family, AggregationBudget::new(4)).unwrap();
        orchestrator.run_aggregation(true).await.unwrap();
        let daily = daily_rows(&store, &family);
        let rolling = rolling_rows(&store, &family);

        orchestrator.run_aggregation(true).await.unwrap();
        orchestrator.run_aggregation(false).await.unwrap();
        assert_eq!(daily_rows(&store, &family), daily);
        assert_eq!(rolling_rows(&store, &family), rolling);
    }

    #[tokio::test]
    async fn test_catch_up_after_downtime() {
        let (_dir, store) = setup();
        let family = day_family();
        seed(&store, &family, 0..250);

        let orchestrator =
            AggregationOrchestrator::from_family(store.clone(), &family, AggregationBudget::new(4)).unwrap();
        orchestrator.run_aggregation(true).await.unwrap();

        // one new epoch slides, a long outage rebuilds
        let mut rows = seed(&store, &family, 0..251);
        orchestrator.run_aggregation(true).await.unwrap();
        let rolling = rolling_rows(&store, &family);
        assert_eq!(rolling[0].bounds, UnitBounds::new(26, 251));

        rows = [rows, seed(&store, &family, 251..600)].concat();
        orchestrator.run_aggregation(true).await.unwrap();

        let daily = daily_rows(&store, &family);
        let bounds: Vec<UnitBounds> = daily.iter().step_by(VALIDATORS as usize).map(|r| r.bounds).collect();
        assert_eq!(
            bounds,
            vec![
                UnitBounds::new(0, 113),
                UnitBounds::new(113, 338),
                UnitBounds::new(338, 563),
                UnitBounds::new(563, 600),
            ]
        );
        for row in &daily {
            let expected = reference(&family.fields, &rows, row.validator_index, row.bounds.epoch_start, row.bounds.epoch_end);
            assert_eq!(row.values, expected);
        }

        let rolling = rolling_rows(&store, &family);
        for row in &rolling {
            assert_eq!(row.bounds, UnitBounds::new(375, 600));
            assert_eq!(row.values, reference(&family.fields, &rows, row.validator_index, 375, 600));
        }
    }

    #[tokio::test]
    async fn test_fresh_database_is_not_an_error() {
        let (_dir, store) = setup();
        let family = day_family();

        let orchestrator =
            AggregationOrchestrator::from_family(store.clone(), &family, AggregationBudget::new(4)).unwrap();
        orchestrator.run_aggregation(true).await.unwrap();

        assert!(daily_rows(&store, &family).is_empty());
        assert!(rolling_rows(&store, &family).is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_invocations() {
        let (_dir, store) = setup();
        let family = day_family();
        let rows = seed(&store, &family, 0..500);

        let orchestrator = Arc::new(
            AggregationOrchestrator::from_family(store.clone(), &family, AggregationBudget::new(10)).unwrap(),
        );
        let mut handles = Vec::new();
        for i in 0..4 {
            let orchestrator = orchestrator.clone();
            handles.push(tokio::spawn(async move { orchestrator.run_aggregation(i % 2 == 0).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let daily = daily_rows(&store, &family);
        assert_eq!(daily.len(), 3 * VALIDATORS as usize);
        for row in &daily {
            let expected = reference(&family.fields, &rows, row.validator_index, row.bounds.epoch_start, row.bounds.epoch_end);
            assert_eq!(row.values, expected);
        }
        for row in &rolling_rows(&store, &family) {
            assert_eq!(row.bounds, UnitBounds::new(275, 500));
        }
    }

    #[tokio::test]
    async fn test_partition_conflict_aborts_pass() {
        let (_dir, store) = setup();
        let family = day_family();
        seed(&store, &family, 0..50);

        // a partition with another shape already covers genesis
        let existing = "validator_dashboard_data_daily_20201130_20201202";
        {
            let conn = store.open().unwrap();
            ensure_partition_registry(&conn, &family.fixed_table).unwrap();
            create_partition_table(&conn, existing, &family.fields).unwrap();
            conn.execute(
                &format!(
                    "INSERT INTO {}_partitions (name, range_start, range_end) VALUES (?1, ?2, ?3)",
                    family.fixed_table
                ),
                rusqlite::params![
                    existing,
                    MAINNET_GENESIS_TIMESTAMP - 86_400,
                    MAINNET_GENESIS_TIMESTAMP + 86_400
                ],
            )
            .unwrap();
        }

        let orchestrator =
            AggregationOrchestrator::from_family(store.clone(), &family, AggregationBudget::new(4)).unwrap();
        let err = orchestrator.run_aggregation(false).await.unwrap_err();
        assert!(err.to_string().contains("conflicts with existing partition"));

        // the lock is free again and the failure is repeatable
        let err = orchestrator.run_aggregation(false).await.unwrap_err();
        assert!(!matches!(err, AggregationError::Task { .. }));
    }

    #[tokio::test]
    async fn test_week_family_from_daily_rows() {
        let (_dir, store) = setup();
        let fields = Arc::new(FieldMergeSpec::validator_dashboard());
        let week = AggregationFamily {
            name: "week".to_string(),
            clock: TimeUnitClock::new(0, 384, 225 * 7, 4).with_genesis_offset(0),
            fields: fields.clone(),
            source_table: "validator_dashboard_data_day_export".to_string(),
            rolling: Some(RollingTarget {
                table: "validator_dashboard_data_rolling_weekly".to_string(),
                window_units: 225 * 7,
                bootstrap_threshold: 225,
            }),
            fixed_table: "validator_dashboard_data_weekly".to_string(),
        };

        // nine days of day-level rows, each covering 225 epochs
        let mut conn = store.open().unwrap();
        ensure_source_table(&conn, &week.source_table, &fields).unwrap();
        let days: Vec<SourceRow> = (0..9u64)
            .map(|day| {
                let mut row = SourceRow::zeroed(day * 225, 0, &fields)
                    .with(&fields, "attestations_reward", FieldValue::Integer(10))
                    .with(&fields, "last_executed_duty_epoch", FieldValue::Integer((day * 225 + 224) as i64))
                    .with_balances(day as i64 * 100, day as i64 * 100 + 100);
                row.bounds = UnitBounds::new(day * 225, day * 225 + 225);
                row
            })
            .collect();
        insert_source_rows(&mut conn, &week.source_table, &fields, &days).unwrap();

        let orchestrator =
            AggregationOrchestrator::from_family(store.clone(), &week, AggregationBudget::new(2)).unwrap();
        orchestrator.run_aggregation(true).await.unwrap();

        let weekly = daily_rows(&store, &week);
        assert_eq!(weekly.len(), 2);
        assert_eq!(weekly[0].bounds, UnitBounds::new(0, 1575));
        assert_eq!(weekly[0].value(&fields, "attestations_reward"), Some(FieldValue::Integer(70)));
        assert_eq!(weekly[0].balances.balance_start, Some(0));
        assert_eq!(weekly[0].balances.balance_end, Some(700));
        assert_eq!(weekly[1].bounds, UnitBounds::new(1575, 2025));
        assert_eq!(weekly[1].value(&fields, "attestations_reward"), Some(FieldValue::Integer(20)));

        // last seven days: day rows [450, 2025)
        let rolling = rolling_rows(&store, &week);
        assert_eq!(rolling.len(), 1);
        assert_eq!(rolling[0].bounds, UnitBounds::new(450, 2025));
        assert_eq!(rolling[0].bounds.epoch_end - rolling[0].bounds.epoch_start, 225 * 7);
        assert_eq!(rolling[0].balances.balance_start, Some(200));
        assert_eq!(rolling[0].balances.balance_end, Some(900));
        assert_eq!(rolling[0].value(&fields, "attestations_reward"), Some(FieldValue::Integer(70)));
        assert_eq!(
            rolling[0].value(&fields, "last_executed_duty_epoch"),
            Some(FieldValue::Integer(2024))
        );
    }
}
