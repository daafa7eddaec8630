//! End-to-end federation scenarios over in-memory members and
//! fault-injecting triple sources.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use fedra::{
    BindingSet, BindingStream, Endpoint, EndpointId, EndpointType, FederationConfig,
    FederationEngine, FederationError, MemoryTripleSource, PreparedQuery, Statement, Term,
    TriplePattern, TripleSource,
};

const EX: &str = "http://example.org/";

fn iri(local: &str) -> Term {
    Term::iri(format!("{EX}{local}"))
}

fn stmt(s: &str, p: &str, o: &str) -> Statement {
    Statement::new(iri(s), iri(p), iri(o))
}

fn memory_member(id: &str, statements: Vec<Statement>) -> Endpoint {
    Endpoint::with_triple_source(
        id,
        id,
        EndpointType::NativeStore,
        Arc::new(MemoryTripleSource::with_statements(
            EndpointId::new(id),
            statements,
        )),
    )
}

async fn engine_with(members: Vec<Endpoint>, config: FederationConfig) -> FederationEngine {
    let mut builder = FederationEngine::builder().with_config(config);
    for member in members {
        builder = builder.with_member(member);
    }
    builder.build().await.expect("engine builds")
}

fn small_pools() -> FederationConfig {
    FederationConfig {
        join_worker_threads: 4,
        union_worker_threads: 2,
        ..FederationConfig::default()
    }
}

// --- scenario: two sources answering one pattern -------------------------

#[tokio::test]
async fn union_over_two_sources_sums_row_counts() {
    let dbpedia = memory_member(
        "dbpedia",
        vec![
            stmt("conf/iswc", "type", "ConferenceEvent"),
            stmt("conf/eswc", "type", "ConferenceEvent"),
        ],
    );
    let dogfood = memory_member(
        "dogfood",
        vec![
            stmt("conf/www", "type", "ConferenceEvent"),
            stmt("conf/kcap", "type", "ConferenceEvent"),
            stmt("conf/ekaw", "type", "ConferenceEvent"),
        ],
    );
    let engine = engine_with(vec![dbpedia, dogfood], small_pools()).await;

    let result = engine
        .query(&format!(
            "SELECT ?c WHERE {{ ?c <{EX}type> <{EX}ConferenceEvent> }}"
        ))
        .await
        .unwrap();
    let rows = result.into_bindings().await.unwrap();
    assert_eq!(rows.len(), 5);
    assert!(rows.iter().all(|row| row.get("c").is_some()));
    engine.shutdown();
}

// --- scenario: exclusive group ships as one sub-query --------------------

#[derive(Debug)]
struct CountingSource {
    inner: MemoryTripleSource,
    evaluations: AtomicUsize,
}

impl CountingSource {
    fn new(id: &str, statements: Vec<Statement>) -> Arc<Self> {
        Arc::new(CountingSource {
            inner: MemoryTripleSource::with_statements(EndpointId::new(id), statements),
            evaluations: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl TripleSource for CountingSource {
    async fn evaluate(
        &self,
        query: PreparedQuery,
        bindings: &BindingSet,
        timeout: Option<Duration>,
    ) -> fedra::Result<BindingStream> {
        self.evaluations.fetch_add(1, Ordering::SeqCst);
        self.inner.evaluate(query, bindings, timeout).await
    }

    async fn ask(
        &self,
        pattern: &TriplePattern,
        bindings: &BindingSet,
        timeout: Option<Duration>,
    ) -> fedra::Result<bool> {
        self.inner.ask(pattern, bindings, timeout).await
    }

    async fn statements(
        &self,
        s: Option<&Term>,
        p: Option<&Term>,
        o: Option<&Term>,
        timeout: Option<Duration>,
    ) -> fedra::Result<fedra::triple_source::StatementStream> {
        self.inner.statements(s, p, o, timeout).await
    }

    fn use_prepared_query(&self) -> bool {
        false
    }

    fn endpoint_id(&self) -> &EndpointId {
        self.inner.endpoint_id()
    }
}

#[tokio::test]
async fn exclusive_group_is_shipped_as_one_subquery() {
    let counting = CountingSource::new(
        "dbpedia",
        vec![
            stmt("conf/iswc", "type", "ConferenceEvent"),
            stmt("conf/iswc", "city", "Vienna"),
            stmt("conf/eswc", "type", "ConferenceEvent"),
            stmt("conf/eswc", "city", "Crete"),
        ],
    );
    let dbpedia = Endpoint::with_triple_source(
        "dbpedia",
        "dbpedia",
        EndpointType::NativeStore,
        counting.clone(),
    );
    // a second member that cannot answer either pattern
    let other = memory_member("other", vec![stmt("a", "unrelated", "b")]);
    let engine = engine_with(vec![dbpedia, other], small_pools()).await;

    let result = engine
        .query(&format!(
            "SELECT ?c ?city WHERE {{ ?c <{EX}type> <{EX}ConferenceEvent> . ?c <{EX}city> ?city }}"
        ))
        .await
        .unwrap();
    let rows = result.into_bindings().await.unwrap();
    assert_eq!(rows.len(), 2);
    // both patterns went to the only source in a single sub-query
    assert_eq!(counting.evaluations.load(Ordering::SeqCst), 1);
    engine.shutdown();
}

// --- scenario: federated join with bound-join batching -------------------

/// Remote-style source recording the sub-queries it receives and
/// answering each with preset rows. Probes answer positively only for
/// the configured predicate, so the mock stays out of foreign patterns.
#[derive(Debug)]
struct RecordingRemoteSource {
    endpoint: EndpointId,
    answers_predicate: Term,
    queries: Mutex<Vec<String>>,
    rows: Vec<BindingSet>,
}

impl RecordingRemoteSource {
    fn new(id: &str, answers_predicate: Term, rows: Vec<BindingSet>) -> Arc<Self> {
        Arc::new(RecordingRemoteSource {
            endpoint: EndpointId::new(id),
            answers_predicate,
            queries: Mutex::new(Vec::new()),
            rows,
        })
    }

    fn received(&self) -> Vec<String> {
        self.queries.lock().clone()
    }
}

#[async_trait]
impl TripleSource for RecordingRemoteSource {
    async fn evaluate(
        &self,
        query: PreparedQuery,
        _bindings: &BindingSet,
        _timeout: Option<Duration>,
    ) -> fedra::Result<BindingStream> {
        match query {
            PreparedQuery::Sparql(text) => {
                self.queries.lock().push(text);
                Ok(BindingStream::from_rows(self.rows.clone()))
            }
            PreparedQuery::Algebra(_) => Err(FederationError::IllegalState(
                "remote mock expects SPARQL text".into(),
            )),
        }
    }

    async fn ask(
        &self,
        pattern: &TriplePattern,
        _bindings: &BindingSet,
        _timeout: Option<Duration>,
    ) -> fedra::Result<bool> {
        Ok(pattern.predicate.as_term() == Some(&self.answers_predicate))
    }

    async fn statements(
        &self,
        _s: Option<&Term>,
        _p: Option<&Term>,
        _o: Option<&Term>,
        _timeout: Option<Duration>,
    ) -> fedra::Result<fedra::triple_source::StatementStream> {
        Ok(Box::pin(futures::stream::iter(Vec::new())))
    }

    fn use_prepared_query(&self) -> bool {
        true
    }

    fn endpoint_id(&self) -> &EndpointId {
        &self.endpoint
    }
}

#[tokio::test]
async fn bound_join_batches_left_bindings_into_values_subqueries() {
    // five conferences with locations, exclusively on the local member
    let mut statements = Vec::new();
    for i in 0..5 {
        statements.push(stmt(&format!("conf/{i}"), "type", "ConferenceEvent"));
        statements.push(stmt(&format!("conf/{i}"), "near", &format!("loc/{i}")));
    }
    let local = memory_member("local", statements);

    // the country pattern is answered only by the remote mock; every
    // batch gets one row back, tagged for the first left binding
    let remote_rows = vec![BindingSet::from_iter([
        ("country".to_string(), iri("Germany")),
        (
            "__fedra_index".to_string(),
            Term::Literal(fedra::Literal::integer(0)),
        ),
    ])];
    let recording = RecordingRemoteSource::new("geo", iri("country"), remote_rows);
    let geo = Endpoint::with_triple_source(
        "geo",
        "geo",
        EndpointType::SparqlEndpoint,
        recording.clone(),
    );

    let config = FederationConfig {
        bound_join_block_size: 2,
        ..small_pools()
    };
    let engine = engine_with(vec![local, geo], config).await;

    let result = engine
        .query(&format!(
            "SELECT ?conf ?country WHERE {{ \
                ?conf <{EX}type> <{EX}ConferenceEvent> . \
                ?conf <{EX}near> ?loc . \
                ?loc <{EX}country> ?country }}"
        ))
        .await
        .unwrap();
    let rows = result.into_bindings().await.unwrap();

    // 5 left rows in blocks of 2 -> 3 VALUES sub-queries, each answering
    // for its first left binding
    let received = recording.received();
    assert_eq!(received.len(), 3);
    assert!(received.iter().all(|q| q.contains("VALUES")));
    assert!(received.iter().all(|q| q.contains("__fedra_index")));
    assert_eq!(rows.len(), 3);
    assert!(rows.iter().all(|row| row.get("country") == Some(&iri("Germany"))));
    assert!(rows.iter().all(|row| row.get("conf").is_some()));
    engine.shutdown();
}

#[tokio::test]
async fn batch_size_covering_all_left_rows_degrades_to_one_call() {
    let mut statements = Vec::new();
    for i in 0..5 {
        statements.push(stmt(&format!("conf/{i}"), "type", "ConferenceEvent"));
        statements.push(stmt(&format!("conf/{i}"), "near", &format!("loc/{i}")));
    }
    let local = memory_member("local", statements);
    let recording = RecordingRemoteSource::new("geo", iri("country"), Vec::new());
    let geo = Endpoint::with_triple_source(
        "geo",
        "geo",
        EndpointType::SparqlEndpoint,
        recording.clone(),
    );
    // the default block size exceeds the left cardinality
    let engine = engine_with(vec![local, geo], small_pools()).await;

    let result = engine
        .query(&format!(
            "SELECT ?conf ?country WHERE {{ \
                ?conf <{EX}type> <{EX}ConferenceEvent> . \
                ?conf <{EX}near> ?loc . \
                ?loc <{EX}country> ?country }}"
        ))
        .await
        .unwrap();
    let _ = result.into_bindings().await.unwrap();
    assert_eq!(recording.received().len(), 1);
    engine.shutdown();
}

#[tokio::test]
async fn bound_join_with_empty_left_issues_no_requests() {
    // the left member claims to answer the pattern but delivers no rows
    let left = RecordingRemoteSource::new("left", iri("near"), Vec::new());
    let left_member = Endpoint::with_triple_source(
        "left",
        "left",
        EndpointType::SparqlEndpoint,
        left.clone(),
    );
    let geo = RecordingRemoteSource::new("geo", iri("country"), Vec::new());
    let geo_member = Endpoint::with_triple_source(
        "geo",
        "geo",
        EndpointType::SparqlEndpoint,
        geo.clone(),
    );
    let engine = engine_with(vec![left_member, geo_member], small_pools()).await;

    let result = engine
        .query(&format!(
            "SELECT ?conf ?country WHERE {{ \
                ?conf <{EX}near> ?loc . \
                ?loc <{EX}country> ?country }}"
        ))
        .await
        .unwrap();
    let rows = result.into_bindings().await.unwrap();
    assert!(rows.is_empty());
    // the left sub-query ran, but no batch was ever shipped to the right
    assert_eq!(left.received().len(), 1);
    assert!(geo.received().is_empty());
    engine.shutdown();
}

// --- scenario: pattern with zero sources ---------------------------------

#[tokio::test]
async fn pattern_without_sources_evaluates_to_zero_rows_without_io() {
    let counting = CountingSource::new("a", vec![stmt("s", "p", "o")]);
    let member = Endpoint::with_triple_source(
        "a",
        "a",
        EndpointType::NativeStore,
        counting.clone(),
    );
    let engine = engine_with(vec![member], small_pools()).await;

    let result = engine
        .query(&format!("SELECT ?s WHERE {{ ?s <{EX}missing> ?o }}"))
        .await
        .unwrap();
    let rows = result.into_bindings().await.unwrap();
    assert!(rows.is_empty());
    assert_eq!(counting.evaluations.load(Ordering::SeqCst), 0);
    engine.shutdown();
}

// --- scenario: probe timeout ---------------------------------------------

#[derive(Debug)]
struct SlowAskSource {
    endpoint: EndpointId,
}

#[async_trait]
impl TripleSource for SlowAskSource {
    async fn evaluate(
        &self,
        _query: PreparedQuery,
        _bindings: &BindingSet,
        _timeout: Option<Duration>,
    ) -> fedra::Result<BindingStream> {
        Ok(BindingStream::empty())
    }

    async fn ask(
        &self,
        _pattern: &TriplePattern,
        _bindings: &BindingSet,
        _timeout: Option<Duration>,
    ) -> fedra::Result<bool> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(true)
    }

    async fn statements(
        &self,
        _s: Option<&Term>,
        _p: Option<&Term>,
        _o: Option<&Term>,
        _timeout: Option<Duration>,
    ) -> fedra::Result<fedra::triple_source::StatementStream> {
        Ok(Box::pin(futures::stream::iter(Vec::new())))
    }

    fn use_prepared_query(&self) -> bool {
        true
    }

    fn endpoint_id(&self) -> &EndpointId {
        &self.endpoint
    }
}

#[tokio::test]
async fn slow_probe_fails_source_selection_with_timeout() {
    let slow = Endpoint::with_triple_source(
        "slow",
        "slow",
        EndpointType::SparqlEndpoint,
        Arc::new(SlowAskSource {
            endpoint: EndpointId::new("slow"),
        }),
    );
    let config = FederationConfig {
        enforce_max_query_time: 1,
        ..small_pools()
    };
    let engine = engine_with(vec![slow], config).await;

    let error = engine
        .query(&format!("SELECT ?s WHERE {{ ?s <{EX}p> ?o }}"))
        .await
        .unwrap_err();
    match error {
        FederationError::Optimization(message) => assert!(message.contains("timeout")),
        other => panic!("unexpected error: {other}"),
    }
    engine.shutdown();
}

// --- scenario: evaluation failure surfaces the endpoint ------------------

#[derive(Debug)]
struct FailingSource {
    endpoint: EndpointId,
}

#[async_trait]
impl TripleSource for FailingSource {
    async fn evaluate(
        &self,
        _query: PreparedQuery,
        _bindings: &BindingSet,
        _timeout: Option<Duration>,
    ) -> fedra::Result<BindingStream> {
        Err(FederationError::evaluation(
            &self.endpoint,
            "connection reset",
        ))
    }

    async fn ask(
        &self,
        _pattern: &TriplePattern,
        _bindings: &BindingSet,
        _timeout: Option<Duration>,
    ) -> fedra::Result<bool> {
        Ok(true)
    }

    async fn statements(
        &self,
        _s: Option<&Term>,
        _p: Option<&Term>,
        _o: Option<&Term>,
        _timeout: Option<Duration>,
    ) -> fedra::Result<fedra::triple_source::StatementStream> {
        Ok(Box::pin(futures::stream::iter(Vec::new())))
    }

    fn use_prepared_query(&self) -> bool {
        true
    }

    fn endpoint_id(&self) -> &EndpointId {
        &self.endpoint
    }
}

#[tokio::test]
async fn union_member_failure_cancels_the_query_with_endpoint_id() {
    let good = memory_member(
        "good",
        vec![
            stmt("a", "p", "b"),
            stmt("c", "p", "d"),
        ],
    );
    let broken = Endpoint::with_triple_source(
        "broken",
        "broken",
        EndpointType::SparqlEndpoint,
        Arc::new(FailingSource {
            endpoint: EndpointId::new("broken"),
        }),
    );
    let engine = engine_with(vec![good, broken], small_pools()).await;

    let result = engine
        .query(&format!("SELECT ?s WHERE {{ ?s <{EX}p> ?o }}"))
        .await
        .unwrap();
    // partial federated answers are misleading: the failure of one
    // source cancels the whole query
    let error = result.into_bindings().await.unwrap_err();
    match error {
        FederationError::Evaluation { endpoint, .. } => {
            assert_eq!(endpoint, EndpointId::new("broken"));
        }
        other => panic!("unexpected error: {other}"),
    }
    engine.shutdown();
}

// --- scenario: cancellation ----------------------------------------------

#[derive(Debug)]
struct HangingSource {
    endpoint: EndpointId,
}

#[async_trait]
impl TripleSource for HangingSource {
    async fn evaluate(
        &self,
        _query: PreparedQuery,
        _bindings: &BindingSet,
        _timeout: Option<Duration>,
    ) -> fedra::Result<BindingStream> {
        let (tx, mut stream) = BindingStream::channel(4);
        let producer = tokio::spawn(async move {
            let row = BindingSet::from_iter([(
                "s",
                Term::iri("http://example.org/first"),
            )]);
            let _ = tx.send(Ok(row)).await;
            // the remaining rows never arrive
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        stream.attach_producer(producer.abort_handle());
        Ok(stream)
    }

    async fn ask(
        &self,
        _pattern: &TriplePattern,
        _bindings: &BindingSet,
        _timeout: Option<Duration>,
    ) -> fedra::Result<bool> {
        Ok(true)
    }

    async fn statements(
        &self,
        _s: Option<&Term>,
        _p: Option<&Term>,
        _o: Option<&Term>,
        _timeout: Option<Duration>,
    ) -> fedra::Result<fedra::triple_source::StatementStream> {
        Ok(Box::pin(futures::stream::iter(Vec::new())))
    }

    fn use_prepared_query(&self) -> bool {
        true
    }

    fn endpoint_id(&self) -> &EndpointId {
        &self.endpoint
    }
}

#[tokio::test]
async fn abort_after_first_row_closes_the_stream_promptly() {
    let hanging = Endpoint::with_triple_source(
        "hanging",
        "hanging",
        EndpointType::SparqlEndpoint,
        Arc::new(HangingSource {
            endpoint: EndpointId::new("hanging"),
        }),
    );
    let engine = engine_with(vec![hanging], small_pools()).await;

    let mut result = engine
        .query(&format!("SELECT ?s WHERE {{ ?s <{EX}p> ?o }}"))
        .await
        .unwrap();
    let first = result.next().await.expect("first row").unwrap();
    assert_eq!(first.get("s"), Some(&Term::iri("http://example.org/first")));

    result.abort();
    // the stream must end within one poll, silently
    let next = tokio::time::timeout(Duration::from_secs(2), result.next())
        .await
        .expect("next() returns promptly after abort");
    assert!(next.is_none());
    assert!(result.close().is_ok());
    engine.shutdown();
}

// --- cross-cutting: filters and distinct ---------------------------------

#[tokio::test]
async fn filters_drop_rows_locally_or_remotely() {
    let member = memory_member(
        "m",
        vec![
            Statement::new(iri("a"), iri("age"), Term::Literal(fedra::Literal::integer(30))),
            Statement::new(iri("b"), iri("age"), Term::Literal(fedra::Literal::integer(9))),
        ],
    );
    let engine = engine_with(vec![member], small_pools()).await;

    let rows = engine
        .query(&format!(
            "SELECT ?s WHERE {{ ?s <{EX}age> ?age FILTER (?age > 18) }}"
        ))
        .await
        .unwrap()
        .into_bindings()
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("s"), Some(&iri("a")));
    engine.shutdown();
}

#[tokio::test]
async fn distinct_deduplicates_projected_rows() {
    let member = memory_member(
        "m",
        vec![
            stmt("a", "p", "x"),
            stmt("a", "p", "y"),
            stmt("b", "p", "z"),
        ],
    );
    let engine = engine_with(vec![member], small_pools()).await;

    let rows = engine
        .query(&format!("SELECT DISTINCT ?s WHERE {{ ?s <{EX}p> ?o }}"))
        .await
        .unwrap()
        .into_bindings()
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);
    engine.shutdown();
}
