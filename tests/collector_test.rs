mod common;

use chrono::{NaiveDate, TimeZone, Utc};
use common::RecordingSink;
use pg_mirror::config::ProcessorConfig;
use pg_mirror::event::InsertEvent;
use pg_mirror::postgres::PgChangeSource;
use pg_mirror::{Collector, DataChangeEvent, Field, FieldValue, Processor, Transaction};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

fn start_collector(
    config: &pg_mirror::config::CollectorConfig,
    sink: Arc<RecordingSink>,
) -> Collector {
    let source = PgChangeSource::new(common::connection_config().pg_config(), config);
    Collector::new(config.clone(), Arc::new(source), sink)
}

#[tokio::test]
#[ignore] // Run with: cargo test --ignored collector_test::test_scalar_types_survive_capture
async fn test_scalar_types_survive_capture() {
    common::init_tracing();
    let client = common::connect().await;
    let schema = common::create_schema(&client).await;
    client
        .batch_execute(&format!(
            "CREATE TABLE {schema}.all_types (
                id int4 PRIMARY KEY,
                small int2, big int8, single float4, dbl float8, flag bool,
                body text, label varchar(10), code char(3), doc json, docb jsonb,
                uid uuid, raw bytea, day date, tm time, ts timestamp, tstz timestamptz,
                tags text[], scores int4[]
            )"
        ))
        .await
        .unwrap();

    let config = common::collector_config(&schema);
    let sink = Arc::new(RecordingSink::default());
    let collector = start_collector(&config, sink.clone());
    collector.start().await.unwrap();

    client
        .batch_execute(&format!(
            "INSERT INTO {schema}.all_types VALUES (
                1, -2, 9000000000, 1.5, 2.25, true,
                'hello', 'label', 'ab', '{{\"a\": 1}}', '{{\"b\": 2}}',
                'a0eebc99-9c0b-4ef8-bb6d-6bb9bd380a11', '\\x0102ff', '2024-02-29', '13:45:30.25',
                '2024-02-29 13:45:30.123456', '2024-02-29 13:45:30+02',
                ARRAY['x', 'y,z'], ARRAY[1, 2, 3]
            )"
        ))
        .await
        .unwrap();

    let received = sink.wait_for(1, Duration::from_secs(10)).await;
    collector.stop().await;
    common::cleanup(&client, &schema, &config).await;

    assert_eq!(received.len(), 1);
    assert_eq!(received[0].source_name, "test-source");
    let DataChangeEvent::Insert(insert) = &received[0].events[0] else {
        panic!("expected insert, got {:?}", received[0].events[0]);
    };

    let value = |name: &str| {
        insert
            .fields
            .iter()
            .find(|f| f.name == name)
            .map(|f| f.value.clone())
            .unwrap_or_else(|| panic!("missing field {}", name))
    };

    assert_eq!(value("id"), FieldValue::Int32(1));
    assert_eq!(value("small"), FieldValue::Int16(-2));
    assert_eq!(value("big"), FieldValue::Int64(9_000_000_000));
    assert_eq!(value("single"), FieldValue::Float(1.5));
    assert_eq!(value("dbl"), FieldValue::Double(2.25));
    assert_eq!(value("flag"), FieldValue::Boolean(true));
    assert_eq!(value("body"), FieldValue::Text("hello".into()));
    assert_eq!(value("label"), FieldValue::Text("label".into()));
    assert_eq!(value("code"), FieldValue::Char("ab ".into()));
    assert_eq!(value("doc"), FieldValue::Json(r#"{"a": 1}"#.into()));
    assert_eq!(value("docb"), FieldValue::Jsonb(r#"{"b": 2}"#.into()));
    assert_eq!(
        value("uid"),
        FieldValue::Uuid(Uuid::parse_str("a0eebc99-9c0b-4ef8-bb6d-6bb9bd380a11").unwrap())
    );
    assert_eq!(value("raw"), FieldValue::Bytes(vec![0x01, 0x02, 0xff]));
    assert_eq!(
        value("day"),
        FieldValue::Date(NaiveDate::from_ymd_opt(2024, 2, 29).unwrap())
    );
    let day = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
    assert_eq!(
        value("tm"),
        FieldValue::Time(chrono::NaiveTime::from_hms_milli_opt(13, 45, 30, 250).unwrap())
    );
    assert_eq!(
        value("ts"),
        FieldValue::Timestamp(day.and_hms_micro_opt(13, 45, 30, 123_456).unwrap())
    );
    let FieldValue::TimestampTz(tstz) = value("tstz") else {
        panic!("expected timestamptz");
    };
    assert_eq!(tstz, Utc.with_ymd_and_hms(2024, 2, 29, 11, 45, 30).unwrap());
    assert_eq!(
        value("tags"),
        FieldValue::TextArray(vec!["x".into(), "y,z".into()])
    );
    assert_eq!(value("scores"), FieldValue::Int32Array(vec![1, 2, 3]));
}

#[tokio::test]
#[ignore] // Run with: cargo test --ignored collector_test::test_update_identified_by_primary_key
async fn test_update_identified_by_primary_key() {
    common::init_tracing();
    let client = common::connect().await;
    let schema = common::create_schema(&client).await;
    client
        .batch_execute(&format!(
            "CREATE TABLE {schema}.items (id int4 PRIMARY KEY, name text, qty int4);
             INSERT INTO {schema}.items VALUES (1, 'widget', 5);"
        ))
        .await
        .unwrap();

    let config = common::collector_config(&schema);
    let sink = Arc::new(RecordingSink::default());
    let collector = start_collector(&config, sink.clone());
    collector.start().await.unwrap();

    // Setup switched the table to full replica identity.
    let identity: i8 = client
        .query_one(
            "SELECT relreplident::\"char\" FROM pg_class c JOIN pg_namespace n ON n.oid = c.relnamespace \
             WHERE n.nspname = $1 AND c.relname = 'items'",
            &[&schema],
        )
        .await
        .unwrap()
        .get(0);
    assert_eq!(identity as u8, b'f');

    client
        .batch_execute(&format!("UPDATE {schema}.items SET qty = 6 WHERE id = 1"))
        .await
        .unwrap();
    client
        .batch_execute(&format!("DELETE FROM {schema}.items WHERE id = 1"))
        .await
        .unwrap();

    let received = sink.wait_for(2, Duration::from_secs(10)).await;
    collector.stop().await;
    common::cleanup(&client, &schema, &config).await;

    assert_eq!(received.len(), 2);
    let DataChangeEvent::Update(update) = &received[0].events[0] else {
        panic!("expected update");
    };
    assert_eq!(update.identifying_fields, vec![Field::new("id", FieldValue::Int32(1))]);
    assert!(update
        .updated_fields
        .contains(&Field::new("qty", FieldValue::Int32(6))));

    let DataChangeEvent::Delete(delete) = &received[1].events[0] else {
        panic!("expected delete");
    };
    assert_eq!(delete.identifying_fields, vec![Field::new("id", FieldValue::Int32(1))]);
    assert!(received[0].created_at >= received[0].committed_at);
}

#[tokio::test]
#[ignore] // Run with: cargo test --ignored collector_test::test_mirrored_transactions_are_not_collected
async fn test_mirrored_transactions_are_not_collected() {
    common::init_tracing();
    let client = common::connect().await;
    let schema = common::create_schema(&client).await;
    client
        .batch_execute(&format!(
            "CREATE TABLE {schema}.items (id int4 PRIMARY KEY, name text)"
        ))
        .await
        .unwrap();

    let config = common::collector_config(&schema);
    let sink = Arc::new(RecordingSink::default());
    let collector = start_collector(&config, sink.clone());
    collector.start().await.unwrap();

    // Written by a processor: carries the loop marker.
    let processor = Processor::new(
        common::connection_config().pg_config(),
        ProcessorConfig::default(),
    )
    .unwrap();
    processor
        .apply(&Transaction::new(
            "other-source",
            vec![DataChangeEvent::Insert(InsertEvent {
                id: Uuid::new_v4(),
                namespace: schema.clone(),
                table: "items".into(),
                transaction_id: 42,
                fields: vec![
                    Field::new("id", FieldValue::Int32(1)),
                    Field::new("name", FieldValue::Text("mirrored".into())),
                ],
            })],
            Utc::now(),
        ))
        .await
        .unwrap();

    client
        .batch_execute(&format!("INSERT INTO {schema}.items VALUES (2, 'local')"))
        .await
        .unwrap();

    let received = sink.wait_for(1, Duration::from_secs(10)).await;
    // Give a wrongly delivered mirrored transaction time to show up.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let received_later = sink.received();
    collector.stop().await;
    common::cleanup(&client, &schema, &config).await;

    assert_eq!(received.len(), 1);
    assert_eq!(received_later.len(), 1);
    let DataChangeEvent::Insert(insert) = &received[0].events[0] else {
        panic!("expected insert");
    };
    assert_eq!(insert.fields[1], Field::new("name", FieldValue::Text("local".into())));
}
