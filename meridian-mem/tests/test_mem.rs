use meridian::engine::ColumnType;
use meridian::server::{self, ServerOptions};
use meridian_mem::table::{Catalog, Value};
use meridian_mem::MemEngine;
use std::sync::Arc;
use tokio_postgres::error::SqlState;
use tokio_postgres::{connect, NoTls};

async fn start_server(catalog: Catalog) -> u16 {
	server::run_background(
		ServerOptions::new().with_port(0),
		Arc::new(move || {
			let catalog = catalog.clone();
			Box::pin(async move { MemEngine::new(catalog) })
		}),
	)
	.await
	.unwrap()
}

async fn client_for(catalog: Catalog) -> tokio_postgres::Client {
	let port = start_server(catalog).await;
	let (client, conn) = connect(&format!("postgres://localhost:{}/qdb", port), NoTls)
		.await
		.expect("failed to connect");
	tokio::spawn(async move { conn.await.unwrap() });
	client
}

fn trades_catalog() -> Catalog {
	let catalog = Catalog::new();
	catalog
		.create_table(
			"trades",
			vec![
				("ts".to_string(), ColumnType::Timestamp),
				("price".to_string(), ColumnType::Double),
				("qty".to_string(), ColumnType::Long),
				("venue".to_string(), ColumnType::Varchar),
			],
		)
		.unwrap();
	catalog
}

#[tokio::test]
async fn parameter_description_echoes_declared_types() {
	// PARSE with an unspecified OID; the description must carry the
	// compiler-inferred INT4 and the row must decode as one
	let client = client_for(trades_catalog()).await;
	let row = client.query_one("select $1::int", &[&42i32]).await.unwrap();
	let value: i32 = row.get(0);
	assert_eq!(value, 42);
}

#[tokio::test]
async fn insert_outside_transaction_commits_in_place() {
	let catalog = trades_catalog();
	let client = client_for(catalog.clone()).await;

	// binary wire timestamp: the 2000-epoch shift happens in the binder
	let ts = std::time::UNIX_EPOCH + std::time::Duration::from_micros(1_704_067_200_000_000);
	let affected = client
		.execute(
			"insert into trades values ($1, $2, $3, $4)",
			&[&ts, &1.25f64, &100i64, &"NYSE"],
		)
		.await
		.unwrap();
	assert_eq!(affected, 1);

	// the implicit transaction committed: the row is visible in the catalog
	let snapshot = catalog.snapshot("trades").unwrap();
	assert_eq!(snapshot.row_count(), 1);
	assert_eq!(snapshot.rows()[0][0], Value::Timestamp(1_704_067_200_000_000));
	assert_eq!(snapshot.rows()[0][3], Value::Str("NYSE".to_string()));
}

#[tokio::test]
async fn insert_in_transaction_defers_to_commit() {
	let catalog = trades_catalog();
	let mut client = client_for(catalog.clone()).await;

	let txn = client.transaction().await.unwrap();
	txn.execute(
		"insert into trades values ($1::text, $2, $3, $4)",
		&[&"2024-01-01T00:00:00Z", &1.0f64, &1i64, &"A"],
	)
	.await
	.unwrap();
	// pending writer: nothing visible yet
	assert_eq!(catalog.snapshot("trades").unwrap().row_count(), 0);

	txn.commit().await.unwrap();
	assert_eq!(catalog.snapshot("trades").unwrap().row_count(), 1);
}

#[tokio::test]
async fn rolled_back_transaction_discards_writes() {
	let catalog = trades_catalog();
	let mut client = client_for(catalog.clone()).await;

	let txn = client.transaction().await.unwrap();
	txn.execute(
		"insert into trades values ($1::text, $2, $3, $4)",
		&[&"2024-01-01T00:00:00Z", &1.0f64, &1i64, &"A"],
	)
	.await
	.unwrap();
	txn.rollback().await.unwrap();

	assert_eq!(catalog.snapshot("trades").unwrap().row_count(), 0);
}

#[tokio::test]
async fn null_parameters_round_trip() {
	let catalog = trades_catalog();
	let client = client_for(catalog.clone()).await;

	client
		.execute(
			"insert into trades values ($1::text, $2, $3, $4)",
			&[
				&"2024-01-01T00:00:00Z",
				&Option::<f64>::None,
				&5i64,
				&Option::<&str>::None,
			],
		)
		.await
		.unwrap();

	let row = client.query_one("select price, venue from trades", &[]).await.unwrap();
	let price: Option<f64> = row.get(0);
	let venue: Option<String> = row.get(1);
	assert_eq!(price, None);
	assert_eq!(venue, None);
}

#[tokio::test]
async fn update_reports_affected_rows() {
	let catalog = trades_catalog();
	catalog
		.append_rows(
			"trades",
			vec![
				vec![Value::Timestamp(0), Value::Double(1.0), Value::Long(1), Value::Str("A".into())],
				vec![Value::Timestamp(1), Value::Double(2.0), Value::Long(1), Value::Str("B".into())],
				vec![Value::Timestamp(2), Value::Double(3.0), Value::Long(2), Value::Str("C".into())],
			],
		)
		.unwrap();
	let client = client_for(catalog.clone()).await;

	let affected = client
		.execute("update trades set price = $1 where qty = $2", &[&9.5f64, &1i64])
		.await
		.unwrap();
	assert_eq!(affected, 2);

	let snapshot = catalog.snapshot("trades").unwrap();
	assert_eq!(snapshot.rows()[0][1], Value::Double(9.5));
	assert_eq!(snapshot.rows()[2][1], Value::Double(3.0));
}

#[tokio::test]
async fn stale_prepared_plan_reports_feature_not_supported() {
	let catalog = trades_catalog();
	let client = client_for(catalog.clone()).await;

	let statement = client.prepare("select * from trades").await.unwrap();
	client.query(&statement, &[]).await.unwrap();

	// concurrent schema change: the cached plan's result shape is now stale
	catalog.add_column("trades", "flags", ColumnType::Long).unwrap();

	let err = client.query(&statement, &[]).await.expect_err("expected stale plan error");
	let db_err = err.as_db_error().expect("expected db error");
	assert_eq!(db_err.code(), &SqlState::FEATURE_NOT_SUPPORTED);
	assert_eq!(db_err.message(), "cached plan must not change result type");
}

#[tokio::test]
async fn portal_batches_run_to_completion() {
	let catalog = trades_catalog();
	let rows: Vec<Vec<Value>> = (0..100)
		.map(|i| {
			vec![
				Value::Timestamp(i),
				Value::Double(i as f64),
				Value::Long(i),
				Value::Str(format!("venue{}", i)),
			]
		})
		.collect();
	catalog.append_rows("trades", rows).unwrap();
	let mut client = client_for(catalog).await;

	let txn = client.transaction().await.unwrap();
	let portal = txn.bind("select qty from trades", &[]).await.unwrap();

	let mut seen = Vec::new();
	let mut batches = 0;
	loop {
		let rows = txn.query_portal(&portal, 10).await.unwrap();
		let batch_len = rows.len();
		batches += 1;
		for row in rows {
			let qty: i64 = row.get(0);
			seen.push(qty);
		}
		if batch_len < 10 {
			break;
		}
	}
	txn.commit().await.unwrap();

	// ten full batches, then an empty one carrying COMMAND_COMPLETE
	assert_eq!(batches, 11);
	assert_eq!(seen, (0..100).collect::<Vec<i64>>());
}

#[tokio::test]
async fn cold_rows_pause_without_observable_effect() {
	let catalog = trades_catalog();
	let rows: Vec<Vec<Value>> = (0..10)
		.map(|i| vec![Value::Timestamp(i), Value::Double(0.0), Value::Long(i), Value::Null])
		.collect();
	catalog.append_rows("trades", rows).unwrap();
	// rows 3 and 7 live in "cold storage": the scan pauses on each once
	catalog.mark_cold("trades", 3).unwrap();
	catalog.mark_cold("trades", 7).unwrap();

	let client = client_for(catalog).await;
	let rows = client.query("select qty from trades", &[]).await.unwrap();
	let seen: Vec<i64> = rows.iter().map(|r| r.get(0)).collect();
	assert_eq!(seen, (0..10).collect::<Vec<i64>>());
}

#[tokio::test]
async fn large_results_stream_through_a_small_buffer() {
	let catalog = trades_catalog();
	let rows: Vec<Vec<Value>> = (0..500)
		.map(|i| {
			vec![
				Value::Timestamp(i),
				Value::Double(i as f64),
				Value::Long(i),
				Value::Str(format!("some-venue-with-a-longer-name-{}", i)),
			]
		})
		.collect();
	catalog.append_rows("trades", rows).unwrap();

	// a deliberately tiny send buffer forces mid-result flushes
	let port = {
		let catalog = catalog.clone();
		server::run_background(
			ServerOptions::new()
				.with_port(0)
				.with_connection_options(meridian::connection::ConnectionOptions::new().with_send_buffer_size(512)),
			Arc::new(move || {
				let catalog = catalog.clone();
				Box::pin(async move { MemEngine::new(catalog) })
			}),
		)
		.await
		.unwrap()
	};
	let (client, conn) = connect(&format!("postgres://localhost:{}/qdb", port), NoTls)
		.await
		.unwrap();
	tokio::spawn(async move { conn.await.unwrap() });

	let rows = client.query("select venue from trades", &[]).await.unwrap();
	assert_eq!(rows.len(), 500);
	let first: &str = rows[0].get(0);
	assert_eq!(first, "some-venue-with-a-longer-name-0");
	let last: &str = rows[499].get(0);
	assert_eq!(last, "some-venue-with-a-longer-name-499");
}

#[tokio::test]
async fn ddl_round_trip_via_simple_query() {
	let catalog = Catalog::new();
	let client = client_for(catalog.clone()).await;

	client
		.simple_query("create table metrics (ts timestamp, val double precision)")
		.await
		.unwrap();
	assert!(catalog.version_of("metrics").is_ok());

	client.simple_query("drop table metrics").await.unwrap();
	assert!(catalog.version_of("metrics").is_err());
}

#[tokio::test]
async fn alter_recompiles_unchanged_plans_quietly() {
	let catalog = trades_catalog();
	catalog
		.append_rows(
			"trades",
			vec![vec![Value::Timestamp(0), Value::Double(1.0), Value::Long(7), Value::Null]],
		)
		.unwrap();
	let client = client_for(catalog.clone()).await;

	let row = client.query_one("select qty from trades", &[]).await.unwrap();
	let qty: i64 = row.get(0);
	assert_eq!(qty, 7);

	// alter bumps the table version; since the recompiled plan has the same
	// result shape, the statement quietly recompiles instead of failing
	client.simple_query("alter table trades add column extra bigint").await.unwrap();
	let row = client.query_one("select qty from trades", &[]).await.unwrap();
	let qty: i64 = row.get(0);
	assert_eq!(qty, 7);
}
