//! Tests for the chunked data producer against scripted fakes.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::*;
use crate::model::{ColumnInfo, ColumnRole, DataSetDefinition, DataType, FieldValue};
use crate::source::QueryResponse;

const EXTRACTOR_ID: &str = "extract_cpu";

fn cpu_def() -> Arc<DataSetDefinition> {
    Arc::new(DataSetDefinition {
        name: "cpu".to_string(),
        columns: vec![
            ColumnInfo::new("time", DataType::Timestamp, ColumnRole::Time),
            ColumnInfo::new("value", DataType::Float, ColumnRole::Field),
        ],
    })
}

fn chunk(rows: &[(&str, f64)]) -> QueryResponse {
    let values: Vec<_> = rows
        .iter()
        .map(|(time, value)| serde_json::json!([time, value]))
        .collect();
    serde_json::from_value(serde_json::json!({
        "results": [{"series": [{"name": "cpu", "columns": ["time", "value"], "values": values}]}]
    }))
    .unwrap()
}

#[derive(Default)]
struct Counters {
    chunk_requests: Arc<AtomicUsize>,
    stream_closes: Arc<AtomicUsize>,
    client_closes: Arc<AtomicUsize>,
    connects: Arc<AtomicUsize>,
}

struct ScriptedStream {
    responses: VecDeque<Result<QueryResponse>>,
    chunk_requests: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
    after_first_response: Option<Box<dyn FnOnce() + Send>>,
}

impl std::fmt::Debug for ScriptedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedStream").finish()
    }
}

#[async_trait]
impl ChunkStream for ScriptedStream {
    async fn next_response(&mut self) -> Result<Option<QueryResponse>> {
        self.chunk_requests.fetch_add(1, Ordering::SeqCst);
        let next = match self.responses.pop_front() {
            Some(Ok(response)) => Ok(Some(response)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        };
        if let Some(hook) = self.after_first_response.take() {
            hook();
        }
        next
    }

    async fn close(&mut self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug)]
struct FakeClient {
    stream: Mutex<Option<ScriptedStream>>,
    closes: Arc<AtomicUsize>,
}

#[async_trait]
impl SourceClient for FakeClient {
    async fn query(&self, _query: &SourceQuery) -> Result<QueryResponse> {
        panic!("the producer must not issue plain queries");
    }

    async fn query_chunked(&self, _query: &SourceQuery) -> Result<Box<dyn ChunkStream>> {
        let stream = self
            .stream
            .lock()
            .take()
            .expect("chunked query issued twice");
        Ok(Box::new(stream))
    }

    async fn close(&mut self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct FakeFactory {
    client: Mutex<Option<FakeClient>>,
    connects: Arc<AtomicUsize>,
    refuse: bool,
}

#[async_trait]
impl ClientFactory for FakeFactory {
    async fn connect(&self, _params: &SourceParams) -> Result<Box<dyn SourceClient>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.refuse {
            return Err(Error::SourceConnection("connection refused".to_string()));
        }
        Ok(Box::new(
            self.client.lock().take().expect("connect called twice"),
        ))
    }
}

struct Harness {
    producer: DataProducer,
    args: ProducerArgs,
    rows: mpsc::Receiver<Row>,
    counters: Counters,
}

fn harness(responses: Vec<Result<QueryResponse>>) -> Harness {
    harness_with_hook(responses, None)
}

fn harness_with_hook(
    responses: Vec<Result<QueryResponse>>,
    after_first_response: Option<Box<dyn FnOnce() + Send>>,
) -> Harness {
    let counters = Counters::default();
    let stream = ScriptedStream {
        responses: responses.into_iter().collect(),
        chunk_requests: Arc::clone(&counters.chunk_requests),
        closes: Arc::clone(&counters.stream_closes),
        after_first_response,
    };
    let client = FakeClient {
        stream: Mutex::new(Some(stream)),
        closes: Arc::clone(&counters.client_closes),
    };
    let factory = FakeFactory {
        client: Mutex::new(Some(client)),
        connects: Arc::clone(&counters.connects),
        refuse: false,
    };
    build_harness(factory, counters)
}

fn refusing_harness() -> Harness {
    let counters = Counters::default();
    let factory = FakeFactory {
        client: Mutex::new(None),
        connects: Arc::clone(&counters.connects),
        refuse: true,
    };
    build_harness(factory, counters)
}

fn build_harness(factory: FakeFactory, counters: Counters) -> Harness {
    let (sender, rows) = mpsc::channel(4);
    let args = ProducerArgs {
        params: SourceParams {
            url: "http://localhost:8086".to_string(),
            username: None,
            password: None,
        },
        query: SourceQuery::new("SELECT \"time\", \"value\"\nFROM \"cpu\"", "telegraf", None)
            .chunked(2),
        sender,
        converter: RowConverter::new(cpu_def()),
    };
    Harness {
        producer: DataProducer::new(EXTRACTOR_ID, Arc::new(factory)),
        args,
        rows,
        counters,
    }
}

async fn collect_rows(mut rows: mpsc::Receiver<Row>) -> Vec<Row> {
    let mut collected = Vec::new();
    while let Some(row) = rows.recv().await {
        collected.push(row);
    }
    collected
}

#[tokio::test]
async fn test_streams_chunks_in_order_then_closes() {
    let h = harness(vec![
        Ok(chunk(&[("2020-01-01T00:00:00Z", 0.1), ("2020-01-01T00:00:10Z", 0.2)])),
        Ok(chunk(&[("2020-01-01T00:00:20Z", 0.3), ("2020-01-01T00:00:30Z", 0.4)])),
        Ok(chunk(&[("2020-01-01T00:00:40Z", 0.5), ("2020-01-01T00:00:50Z", 0.6)])),
    ]);
    let bus = ErrorBroadcaster::new();
    let mut watcher = bus.subscribe("watcher").unwrap();

    let collector = tokio::spawn(collect_rows(h.rows));
    let outcome = h.producer.fetch(h.args, &bus).await.unwrap();
    let rows = collector.await.unwrap();

    assert_eq!(outcome, FetchOutcome::Completed);
    assert_eq!(rows.len(), 6);
    let values: Vec<f64> = rows
        .iter()
        .map(|row| match row[1] {
            FieldValue::Float(v) => v,
            ref other => panic!("unexpected value {other:?}"),
        })
        .collect();
    assert_eq!(values, vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6]);

    assert!(watcher.try_recv().is_err(), "no broadcast on success");
    assert_eq!(h.counters.chunk_requests.load(Ordering::SeqCst), 4);
    assert_eq!(h.counters.stream_closes.load(Ordering::SeqCst), 1);
    assert_eq!(h.counters.client_closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_zero_rows_is_a_valid_completion() {
    let h = harness(vec![]);
    let bus = ErrorBroadcaster::new();

    let collector = tokio::spawn(collect_rows(h.rows));
    let outcome = h.producer.fetch(h.args, &bus).await.unwrap();

    assert_eq!(outcome, FetchOutcome::Completed);
    assert!(collector.await.unwrap().is_empty());
}

#[tokio::test]
async fn test_empty_series_response_completes() {
    let empty: QueryResponse =
        serde_json::from_value(serde_json::json!({"results": [{"series": []}]})).unwrap();
    let h = harness(vec![Ok(empty)]);
    let bus = ErrorBroadcaster::new();

    let collector = tokio::spawn(collect_rows(h.rows));
    let outcome = h.producer.fetch(h.args, &bus).await.unwrap();

    assert_eq!(outcome, FetchOutcome::Completed);
    assert!(collector.await.unwrap().is_empty());
    assert_eq!(h.counters.chunk_requests.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_halts_at_chunk_boundary_after_sibling_failure() {
    let bus = Arc::new(ErrorBroadcaster::new());
    let bus_for_hook = Arc::clone(&bus);
    let h = harness_with_hook(
        vec![
            Ok(chunk(&[("2020-01-01T00:00:00Z", 0.1), ("2020-01-01T00:00:10Z", 0.2)])),
            Ok(chunk(&[("2020-01-01T00:00:20Z", 0.3), ("2020-01-01T00:00:30Z", 0.4)])),
        ],
        Some(Box::new(move || {
            bus_for_hook.broadcast(
                "sibling",
                Arc::new(Error::Extraction("sibling blew up".to_string())),
            );
        })),
    );
    let mut watcher = bus.subscribe("watcher").unwrap();

    let collector = tokio::spawn(collect_rows(h.rows));
    let outcome = h.producer.fetch(h.args, &bus).await.unwrap();
    let rows = collector.await.unwrap();

    assert_eq!(outcome, FetchOutcome::Aborted);
    assert_eq!(rows.len(), 2, "only the first chunk is emitted");
    assert_eq!(h.counters.chunk_requests.load(Ordering::SeqCst), 1);
    assert_eq!(h.counters.stream_closes.load(Ordering::SeqCst), 1);
    assert_eq!(h.counters.client_closes.load(Ordering::SeqCst), 1);

    // The watcher saw only the sibling's broadcast, nothing from the
    // aborted producer.
    assert!(watcher.try_recv().unwrap().to_string().contains("sibling blew up"));
    assert!(watcher.try_recv().is_err());

    // The subscription was released.
    assert!(bus.subscribe(EXTRACTOR_ID).is_ok());
}

#[tokio::test]
async fn test_multi_series_response_broadcasts_once_and_fails() {
    let two_series: QueryResponse = serde_json::from_value(serde_json::json!({
        "results": [{"series": [
            {"name": "cpu", "columns": ["time", "value"], "values": []},
            {"name": "cpu2", "columns": ["time", "value"], "values": []}
        ]}]
    }))
    .unwrap();
    let h = harness(vec![
        Ok(two_series),
        Ok(chunk(&[("2020-01-01T00:00:00Z", 0.1)])),
    ]);
    let bus = ErrorBroadcaster::new();
    let mut watcher = bus.subscribe("watcher").unwrap();

    let collector = tokio::spawn(collect_rows(h.rows));
    let err = h.producer.fetch(h.args, &bus).await.unwrap_err();

    assert!(err.to_string().contains("more than one series"));
    assert!(collector.await.unwrap().is_empty());
    assert_eq!(h.counters.chunk_requests.load(Ordering::SeqCst), 1, "no further chunk requests");

    let broadcast = watcher.try_recv().unwrap();
    assert!(broadcast.to_string().contains(EXTRACTOR_ID));
    assert!(watcher.try_recv().is_err(), "exactly one broadcast");

    assert_eq!(h.counters.stream_closes.load(Ordering::SeqCst), 1);
    assert_eq!(h.counters.client_closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_response_level_error_is_fatal() {
    let broken: QueryResponse =
        serde_json::from_value(serde_json::json!({"error": "query engine on fire"})).unwrap();
    let h = harness(vec![Ok(broken)]);
    let bus = ErrorBroadcaster::new();

    let collector = tokio::spawn(collect_rows(h.rows));
    let err = h.producer.fetch(h.args, &bus).await.unwrap_err();

    assert!(err.to_string().contains("query engine on fire"));
    assert!(collector.await.unwrap().is_empty());
}

#[tokio::test]
async fn test_decode_failure_broadcasts_and_fails() {
    let h = harness(vec![
        Ok(chunk(&[("2020-01-01T00:00:00Z", 0.1)])),
        Err(Error::Extraction("truncated chunk".to_string())),
    ]);
    let bus = ErrorBroadcaster::new();
    let mut watcher = bus.subscribe("watcher").unwrap();

    let collector = tokio::spawn(collect_rows(h.rows));
    let err = h.producer.fetch(h.args, &bus).await.unwrap_err();
    let rows = collector.await.unwrap();

    assert!(err.to_string().contains("truncated chunk"));
    assert_eq!(rows.len(), 1);
    assert!(watcher.try_recv().unwrap().to_string().contains(EXTRACTOR_ID));
    assert!(watcher.try_recv().is_err());
}

#[tokio::test]
async fn test_malformed_row_is_fatal() {
    let bad_row: QueryResponse = serde_json::from_value(serde_json::json!({
        "results": [{"series": [{"name": "cpu", "columns": ["time", "value"],
                                 "values": [["2020-01-01T00:00:00Z", "not a float"]]}]}]
    }))
    .unwrap();
    let h = harness(vec![Ok(bad_row)]);
    let bus = ErrorBroadcaster::new();

    let collector = tokio::spawn(collect_rows(h.rows));
    let err = h.producer.fetch(h.args, &bus).await.unwrap_err();

    assert!(err.to_string().contains(EXTRACTOR_ID));
    assert!(collector.await.unwrap().is_empty());
}

#[tokio::test]
async fn test_duplicate_identifier_broadcasts_and_fails() {
    let h = harness(vec![Ok(chunk(&[("2020-01-01T00:00:00Z", 0.1)]))]);
    let bus = ErrorBroadcaster::new();
    let mut impostor = bus.subscribe(EXTRACTOR_ID).unwrap();
    let mut watcher = bus.subscribe("watcher").unwrap();

    let collector = tokio::spawn(collect_rows(h.rows));
    let err = h.producer.fetch(h.args, &bus).await.unwrap_err();

    assert!(err.to_string().contains("could not subscribe"));
    assert_eq!(h.counters.connects.load(Ordering::SeqCst), 0, "never touched the source");
    assert!(collector.await.unwrap().is_empty(), "channel still closed");

    assert!(watcher.try_recv().unwrap().to_string().contains(EXTRACTOR_ID));
    // The broadcast excludes the sender's own identifier.
    assert!(impostor.try_recv().is_err());
}

#[tokio::test]
async fn test_connection_refusal_broadcasts_and_fails() {
    let h = refusing_harness();
    let bus = ErrorBroadcaster::new();
    let mut watcher = bus.subscribe("watcher").unwrap();

    let collector = tokio::spawn(collect_rows(h.rows));
    let err = h.producer.fetch(h.args, &bus).await.unwrap_err();

    assert!(err.to_string().contains("connection refused"));
    assert!(collector.await.unwrap().is_empty());
    assert!(watcher.try_recv().unwrap().to_string().contains(EXTRACTOR_ID));
    assert!(bus.subscribe(EXTRACTOR_ID).is_ok(), "subscription released");
}

#[tokio::test]
async fn test_unsubscribes_after_completion() {
    let h = harness(vec![]);
    let bus = ErrorBroadcaster::new();

    let collector = tokio::spawn(collect_rows(h.rows));
    h.producer.fetch(h.args, &bus).await.unwrap();
    collector.await.unwrap();

    assert!(bus.subscribe(EXTRACTOR_ID).is_ok());
}
