use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use card_txn_etl::config::PipelineConfig;
use card_txn_etl::error::PipelineError;
use card_txn_etl::pipeline::{Pipeline, Stage};
use card_txn_etl::storage::{SqliteStore, TransactionStore};
use chrono::NaiveDate;
use rusqlite::Connection;
use tempfile::{tempdir, TempDir};

const HEADER: &str = "trans_date_trans_time,cc_num,merchant,category,amt,first,last,gender,street,city,state,zip,lat,long,city_pop,job,dob,trans_num,unix_time,merch_lat,merch_long,is_fraud";

fn row(time: &str, cc: &str, category: &str, amt: &str) -> String {
    format!(
        "{time},{cc},\"fraud_Rippin, Kub and Mann\",{category},{amt},Jennifer,Banks,F,561 Perry Cove,Moravian Falls,NC,28654,36.0788,-81.1781,3495,\"Psychologist, counselling\",1988-03-09,0b242abb623afc578575680df30655b9,1325376018,36.011293,-82.048315,0"
    )
}

fn five_rows() -> Vec<String> {
    vec![
        row("2019-01-01 00:00:18", "2703186189652095", "misc_net", "4.97"),
        row("2019-01-01 00:00:44", "630423337322", "grocery_pos", "107.23"),
        row("2019-01-01 00:00:51", "38859492057661", "entertainment", "220.11"),
        row("2019-01-01 00:01:16", "3534093764340240", "gas_transport", "45.00"),
        row("2019-01-01 00:03:06", "375534208663984", "misc_pos", "41.96"),
    ]
}

fn write_csv(dir: &Path, name: &str, header: &str, rows: &[String]) -> Result<PathBuf> {
    let path = dir.join(name);
    let mut body = String::from(header);
    body.push('\n');
    for r in rows {
        body.push_str(r);
        body.push('\n');
    }
    fs::write(&path, body)?;
    Ok(path)
}

struct Fixture {
    dir: TempDir,
    config: PipelineConfig,
}

impl Fixture {
    fn new() -> Result<Self> {
        let dir = tempdir()?;
        let mut config = PipelineConfig::default();
        config.database.path = dir.path().join("warehouse.db");
        config.log_dir = dir.path().join("logs");
        config.chunk_size = 2;
        Ok(Self { dir, config })
    }

    fn source(&mut self, name: &str, header: &str, rows: &[String]) -> Result<()> {
        self.config.source_path = write_csv(self.dir.path(), name, header, rows)?;
        Ok(())
    }

    fn store(&self) -> Result<SqliteStore> {
        Ok(SqliteStore::open(&self.config)?)
    }

    fn count(&self, table: &str) -> Result<Option<i64>> {
        let conn = Connection::open(&self.config.database.path)?;
        let exists: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [table],
            |r| r.get(0),
        )?;
        if exists == 0 {
            return Ok(None);
        }
        let n = conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |r| r.get(0))?;
        Ok(Some(n))
    }
}

fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2020, 1, 1).unwrap()
}

#[test]
fn first_run_loads_every_row() -> Result<()> {
    let mut fx = Fixture::new()?;
    fx.source("train.csv", HEADER, &five_rows())?;
    let mut store = fx.store()?;

    let summary = Pipeline::new(&fx.config, &mut store).with_today(today()).run()?;

    assert_eq!(summary.ingested, Some(5));
    assert_eq!(summary.fetched, Some(5));
    assert_eq!(summary.transformed, Some(5));
    assert_eq!(summary.staged, Some(5));
    assert_eq!(summary.merged, Some(5));
    assert_eq!(summary.warehouse_total, Some(5));
    assert!(summary.warnings.is_empty());
    drop(store);

    assert_eq!(fx.count("transactions_raw")?, Some(5));
    assert_eq!(fx.count("transactions_staging")?, Some(5));
    assert_eq!(fx.count("transactions_processed")?, Some(5));
    Ok(())
}

#[test]
fn warehouse_rows_carry_derived_columns_only() -> Result<()> {
    let mut fx = Fixture::new()?;
    fx.source("train.csv", HEADER, &five_rows())?;
    let mut store = fx.store()?;
    Pipeline::new(&fx.config, &mut store).with_today(today()).run()?;
    drop(store);

    let conn = Connection::open(&fx.config.database.path)?;
    let (month, day, hour, age): (i64, i64, i64, i64) = conn.query_row(
        "SELECT trans_month, trans_day, trans_hour, age FROM transactions_processed ORDER BY id LIMIT 1",
        [],
        |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
    )?;
    assert_eq!((month, day, hour), (1, 1, 0));
    // 11620 days between 1988-03-09 and 2020-01-01
    assert_eq!(age, 31);

    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info('transactions_processed')")?;
    let columns: Vec<String> = stmt
        .query_map([], |r| r.get(0))?
        .collect::<rusqlite::Result<_>>()?;
    for dropped in ["cc_num", "first", "last", "trans_num", "unix_time", "merchant", "dob"] {
        assert!(!columns.iter().any(|c| c == dropped), "{} leaked", dropped);
    }
    assert!(columns.iter().any(|c| c == "record_key"));
    assert!(columns.iter().any(|c| c == "run_id"));
    Ok(())
}

#[test]
fn rerunning_the_same_extract_adds_nothing() -> Result<()> {
    let mut fx = Fixture::new()?;
    fx.source("train.csv", HEADER, &five_rows())?;

    let mut store = fx.store()?;
    Pipeline::new(&fx.config, &mut store).with_today(today()).run()?;
    let second = Pipeline::new(&fx.config, &mut store).with_today(today()).run()?;

    assert_eq!(second.staged, Some(5));
    assert_eq!(second.merged, Some(0));
    assert_eq!(second.skipped_duplicates, Some(5));
    assert_eq!(second.warehouse_total, Some(5));
    assert_eq!(
        second.verification.as_deref(),
        Some("Verification: total rows in transactions_processed: 5 (0 new rows)")
    );
    Ok(())
}

#[test]
fn one_odd_amount_does_not_rekey_the_rest_of_the_extract() -> Result<()> {
    let mut fx = Fixture::new()?;
    let clean = vec![
        row("2019-01-01 00:00:18", "111", "misc_net", "4.50"),
        row("2019-01-01 00:00:44", "222", "grocery_pos", "10.00"),
    ];
    fx.source("day1.csv", HEADER, &clean)?;
    let mut store = fx.store()?;
    Pipeline::new(&fx.config, &mut store).with_today(today()).run()?;

    // "n/a" turns the whole amt column into text for this batch
    let mut day2 = clean.clone();
    day2.push(row("2019-01-01 00:00:51", "333", "entertainment", "n/a"));
    fx.source("day2.csv", HEADER, &day2)?;
    let second = Pipeline::new(&fx.config, &mut store).with_today(today()).run()?;

    assert_eq!(second.merged, Some(1));
    assert_eq!(second.skipped_duplicates, Some(2));
    assert_eq!(second.warehouse_total, Some(3));
    Ok(())
}

#[test]
fn renamed_column_fails_before_any_write() -> Result<()> {
    let mut fx = Fixture::new()?;
    fx.source("train.csv", HEADER, &five_rows())?;
    let mut store = fx.store()?;
    Pipeline::new(&fx.config, &mut store).with_today(today()).run()?;

    let renamed = HEADER.replace(",category,", ",merchant_category,");
    fx.source("renamed.csv", &renamed, &five_rows()[..2])?;
    let failure = Pipeline::new(&fx.config, &mut store)
        .with_today(today())
        .run()
        .unwrap_err();

    assert_eq!(failure.stage, Stage::Ingesting);
    match &failure.error {
        PipelineError::SchemaValidation { missing } => {
            assert!(missing.contains("category"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(failure.error.to_string().contains("category"));
    drop(store);

    // the previous run's raw and staging contents are untouched
    assert_eq!(fx.count("transactions_raw")?, Some(5));
    assert_eq!(fx.count("transactions_staging")?, Some(5));
    assert_eq!(fx.count("transactions_processed")?, Some(5));
    Ok(())
}

#[test]
fn extra_source_columns_are_tolerated() -> Result<()> {
    let mut fx = Fixture::new()?;
    let header = format!("{HEADER},notes");
    let rows: Vec<String> = five_rows().into_iter().map(|r| format!("{r},hello")).collect();
    fx.source("wide.csv", &header, &rows)?;
    let mut store = fx.store()?;

    let summary = Pipeline::new(&fx.config, &mut store).with_today(today()).run()?;
    assert_eq!(summary.merged, Some(5));
    drop(store);

    let conn = Connection::open(&fx.config.database.path)?;
    let leaked: i64 = conn.query_row(
        "SELECT COUNT(*) FROM pragma_table_info('transactions_processed') WHERE name = 'notes'",
        [],
        |r| r.get(0),
    )?;
    assert_eq!(leaked, 0);
    Ok(())
}

#[test]
fn unparseable_timestamp_writes_nothing() -> Result<()> {
    let mut fx = Fixture::new()?;
    let mut rows = five_rows();
    rows[3] = row("01/01/2019 00:01", "3534093764340240", "gas_transport", "45.00");
    fx.source("bad.csv", HEADER, &rows)?;
    let mut store = fx.store()?;

    let failure = Pipeline::new(&fx.config, &mut store)
        .with_today(today())
        .run()
        .unwrap_err();
    assert_eq!(failure.stage, Stage::Ingesting);
    assert!(matches!(
        failure.error,
        PipelineError::TimestampParse { row: 4, .. }
    ));
    drop(store);

    assert_eq!(fx.count("transactions_raw")?, None);
    assert_eq!(fx.count("transactions_processed")?, None);
    Ok(())
}

#[test]
fn empty_extract_runs_clean() -> Result<()> {
    let mut fx = Fixture::new()?;
    fx.source("empty.csv", HEADER, &[])?;
    let mut store = fx.store()?;

    let summary = Pipeline::new(&fx.config, &mut store).with_today(today()).run()?;
    assert_eq!(summary.ingested, Some(0));
    assert_eq!(summary.merged, Some(0));
    assert_eq!(summary.warehouse_total, Some(0));
    Ok(())
}

#[test]
fn persisted_encodings_keep_codes_across_runs() -> Result<()> {
    let mut fx = Fixture::new()?;
    fx.config.encoding.persist = true;
    fx.source("day1.csv", HEADER, &five_rows()[..2])?;
    let mut store = fx.store()?;

    let first = Pipeline::new(&fx.config, &mut store).with_today(today()).run()?;
    assert!(first.stable_encodings);
    let day1 = store.load_encodings()?;
    let grocery = day1["category"].code("grocery_pos");
    let misc = day1["category"].code("misc_net");
    assert_eq!((grocery, misc), (Some(0), Some(1)));

    // "food_dining" sorts first but must not renumber existing labels
    let day2 = vec![
        row("2019-01-02 10:00:00", "4000000000000000", "food_dining", "12.00"),
        row("2019-01-02 11:00:00", "4000000000000001", "misc_net", "13.00"),
    ];
    fx.source("day2.csv", HEADER, &day2)?;
    let second = Pipeline::new(&fx.config, &mut store).with_today(today()).run()?;
    assert_eq!(second.merged, Some(2));

    let after = store.load_encodings()?;
    let category = &after["category"];
    assert_eq!(category.code("grocery_pos"), Some(0));
    assert_eq!(category.code("misc_net"), Some(1));
    assert_eq!(category.code("food_dining"), Some(2));
    assert!(category.version > day1["category"].version);
    Ok(())
}

#[test]
fn split_commands_match_a_full_run() -> Result<()> {
    let mut fx = Fixture::new()?;
    fx.source("train.csv", HEADER, &five_rows())?;
    let mut store = fx.store()?;

    Pipeline::new(&fx.config, &mut store).run_ingest()?;
    let transformed = Pipeline::new(&fx.config, &mut store)
        .with_today(today())
        .run_transform()?;
    assert_eq!(transformed.staged, Some(5));
    assert_eq!(store.count_warehouse()?, 0);

    let merged = Pipeline::new(&fx.config, &mut store).run_merge()?;
    assert_eq!(merged.merged, Some(5));

    let verified = Pipeline::new(&fx.config, &mut store).run_verify()?;
    assert_eq!(verified.warehouse_total, Some(5));
    Ok(())
}

#[test]
fn merge_fails_cleanly_while_another_writer_holds_the_lock() -> Result<()> {
    let mut fx = Fixture::new()?;
    fx.config.database.busy_timeout_ms = 50;
    fx.source("train.csv", HEADER, &five_rows())?;
    let mut store = fx.store()?;
    Pipeline::new(&fx.config, &mut store).run_ingest()?;
    Pipeline::new(&fx.config, &mut store)
        .with_today(today())
        .run_transform()?;

    let other = Connection::open(&fx.config.database.path)?;
    other.execute_batch("BEGIN IMMEDIATE")?;

    let failure = Pipeline::new(&fx.config, &mut store).run_merge().unwrap_err();
    assert_eq!(failure.stage, Stage::Merging);
    assert!(matches!(failure.error, PipelineError::Connection(_)));

    other.execute_batch("ROLLBACK")?;
    assert_eq!(store.count_warehouse()?, 0);

    let retried = Pipeline::new(&fx.config, &mut store).run_merge()?;
    assert_eq!(retried.merged, Some(5));
    Ok(())
}

#[test]
fn empty_first_run_still_declares_real_amounts() -> Result<()> {
    let mut fx = Fixture::new()?;
    fx.source("empty.csv", HEADER, &[])?;
    let mut store = fx.store()?;
    Pipeline::new(&fx.config, &mut store).with_today(today()).run()?;

    fx.source("train.csv", HEADER, &five_rows())?;
    Pipeline::new(&fx.config, &mut store).with_today(today()).run()?;
    drop(store);

    let conn = Connection::open(&fx.config.database.path)?;
    let declared: String = conn.query_row(
        "SELECT type FROM pragma_table_info('transactions_processed') WHERE name = 'amt'",
        [],
        |r| r.get(0),
    )?;
    assert_eq!(declared, "REAL");
    let stored: String = conn.query_row(
        "SELECT typeof(amt) FROM transactions_processed WHERE amt = 45.0",
        [],
        |r| r.get(0),
    )?;
    assert_eq!(stored, "real");
    Ok(())
}

#[test]
fn unparseable_dob_writes_nothing() -> Result<()> {
    let mut fx = Fixture::new()?;
    let mut rows = five_rows();
    rows[1] = rows[1].replace("1988-03-09", "03/09/1988");
    fx.source("bad_dob.csv", HEADER, &rows)?;
    let mut store = fx.store()?;

    let failure = Pipeline::new(&fx.config, &mut store)
        .with_today(today())
        .run()
        .unwrap_err();
    assert_eq!(failure.stage, Stage::Ingesting);
    match &failure.error {
        PipelineError::TimestampParse { row, value, .. } => {
            assert_eq!(*row, 2);
            assert_eq!(value, "03/09/1988");
        }
        other => panic!("expected a timestamp error, got {other:?}"),
    }
    drop(store);

    assert_eq!(fx.count("transactions_raw")?, None);
    Ok(())
}
