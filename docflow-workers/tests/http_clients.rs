//! HTTP client tests against mock email and search services.
//!
//! wiremock stands in for the email provider and the search cluster, so the
//! tests check the exact requests the workers send and how provider
//! failures map onto handler errors.
//!
//! Covered:
//! 1. email send: path, bearer token and JSON body
//! 2. email provider failures: auth, throttling, validation
//! 3. search create, update and delete requests
//! 4. search deletes of missing entries succeed
//! 5. index mutation published on the bus reaches the cluster

use docflow_events::producers::SearchIndexProducer;
use docflow_events::types::IndexKind;
use docflow_events::{
    streams, BrokerPort, HandlerError, HandlerRegistry, MemoryQueueBroker, MessagingConfig,
    MessagingSystem, Topology,
};
use docflow_workers::handlers::IndexMutationHandler;
use docflow_workers::{
    EmailError, EmailSender, HttpEmailSender, HttpSearchIndex, OutboundEmail, SearchError,
    SearchIndex, ServiceEndpoint,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Mock provider and cluster with clients pointed at them.
struct TestFixture {
    /// Mock email provider.
    email_server: MockServer,
    /// Mock search cluster.
    search_server: MockServer,
}

impl TestFixture {
    async fn new() -> Self {
        Self {
            email_server: MockServer::start().await,
            search_server: MockServer::start().await,
        }
    }

    fn email_client(&self) -> HttpEmailSender {
        let endpoint = ServiceEndpoint {
            base_url: self.email_server.uri(),
            api_key: Some("test-mail-key".to_string()),
        };
        HttpEmailSender::new(endpoint, "noreply@docflow.dev", Duration::from_secs(5)).unwrap()
    }

    fn search_client(&self) -> HttpSearchIndex {
        let endpoint = ServiceEndpoint {
            base_url: self.search_server.uri(),
            api_key: Some("test-search-key".to_string()),
        };
        HttpSearchIndex::new(endpoint, "docflow", Duration::from_secs(5)).unwrap()
    }
}

fn welcome_email() -> OutboundEmail {
    OutboundEmail {
        to: "ada@example.com".to_string(),
        subject: "Verify your email".to_string(),
        template: "verify-email".to_string(),
        variables: json!({ "verificationUrl": "https://app.docflow.dev/auth/verify-email?token=tok123" }),
    }
}

// =============================================================================
// Email
// =============================================================================

#[tokio::test]
async fn test_email_send_request_shape() {
    let fixture = TestFixture::new().await;

    Mock::given(method("POST"))
        .and(path("/v1/send"))
        .and(header("Authorization", "Bearer test-mail-key"))
        .and(body_partial_json(json!({
            "from": "noreply@docflow.dev",
            "to": "ada@example.com",
            "template": "verify-email",
            "variables": {
                "verificationUrl": "https://app.docflow.dev/auth/verify-email?token=tok123"
            }
        })))
        .respond_with(ResponseTemplate::new(202).set_body_json(json!({ "id": "msg-1" })))
        .expect(1)
        .mount(&fixture.email_server)
        .await;

    fixture.email_client().send(&welcome_email()).await.unwrap();
}

#[tokio::test]
async fn test_email_auth_failure_is_permanent() {
    let fixture = TestFixture::new().await;

    Mock::given(method("POST"))
        .and(path("/v1/send"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&fixture.email_server)
        .await;

    let err = fixture
        .email_client()
        .send(&welcome_email())
        .await
        .unwrap_err();

    assert!(matches!(err, EmailError::AuthenticationFailed));
    assert!(matches!(HandlerError::from(err), HandlerError::Permanent(_)));
}

#[tokio::test]
async fn test_email_throttling_is_transient() {
    let fixture = TestFixture::new().await;

    Mock::given(method("POST"))
        .and(path("/v1/send"))
        .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
        .mount(&fixture.email_server)
        .await;

    let err = fixture
        .email_client()
        .send(&welcome_email())
        .await
        .unwrap_err();

    match &err {
        EmailError::ApiError { status, message } => {
            assert_eq!(*status, 429);
            assert_eq!(message, "slow down");
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(matches!(HandlerError::from(err), HandlerError::Transient(_)));
}

#[tokio::test]
async fn test_email_rejected_recipient_is_permanent() {
    let fixture = TestFixture::new().await;

    Mock::given(method("POST"))
        .and(path("/v1/send"))
        .respond_with(ResponseTemplate::new(422).set_body_string("invalid recipient"))
        .mount(&fixture.email_server)
        .await;

    let err = fixture
        .email_client()
        .send(&welcome_email())
        .await
        .unwrap_err();

    assert!(!err.is_transient());
}

// =============================================================================
// Search
// =============================================================================

#[tokio::test]
async fn test_search_upsert_puts_document() {
    let fixture = TestFixture::new().await;

    Mock::given(method("PUT"))
        .and(path("/docflow-user/_doc/u-1"))
        .and(header("Authorization", "Bearer test-search-key"))
        .and(body_partial_json(json!({ "email": "ada@example.com" })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "result": "created" })))
        .expect(1)
        .mount(&fixture.search_server)
        .await;

    fixture
        .search_client()
        .upsert(IndexKind::User, "u-1", &json!({ "email": "ada@example.com" }))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_search_update_merges_fields() {
    let fixture = TestFixture::new().await;

    Mock::given(method("POST"))
        .and(path("/docflow-document/_update/d-9"))
        .and(body_partial_json(json!({
            "doc": { "category": "invoice" },
            "doc_as_upsert": true
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "result": "updated" })))
        .expect(1)
        .mount(&fixture.search_server)
        .await;

    fixture
        .search_client()
        .update(IndexKind::Document, "d-9", &json!({ "category": "invoice" }))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_search_delete_of_missing_entry_succeeds() {
    let fixture = TestFixture::new().await;

    Mock::given(method("DELETE"))
        .and(path("/docflow-payment/_doc/pay-404"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({ "result": "not_found" })))
        .expect(1)
        .mount(&fixture.search_server)
        .await;

    fixture
        .search_client()
        .delete(IndexKind::Payment, "pay-404")
        .await
        .unwrap();
}

#[tokio::test]
async fn test_search_cluster_error_is_transient() {
    let fixture = TestFixture::new().await;

    Mock::given(method("DELETE"))
        .and(path("/docflow-subscription/_doc/sub-1"))
        .respond_with(ResponseTemplate::new(500).set_body_string("shard failure"))
        .mount(&fixture.search_server)
        .await;

    let err = fixture
        .search_client()
        .delete(IndexKind::Subscription, "sub-1")
        .await
        .unwrap_err();

    assert!(matches!(err, SearchError::ApiError { status: 500, .. }));
    assert!(matches!(HandlerError::from(err), HandlerError::Transient(_)));
}

// =============================================================================
// Bus to cluster
// =============================================================================

#[tokio::test]
async fn test_published_mutation_reaches_cluster() {
    let fixture = TestFixture::new().await;

    Mock::given(method("PUT"))
        .and(path("/docflow-user/_doc/u-42"))
        .and(body_partial_json(json!({ "name": "Ada" })))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&fixture.search_server)
        .await;

    let topology = Arc::new(Topology::platform());
    let broker = MemoryQueueBroker::new(topology.clone());
    let port: Arc<dyn BrokerPort> = Arc::new(broker.clone());
    let registry = HandlerRegistry::builder()
        .register_all(IndexMutationHandler::all(Arc::new(fixture.search_client())))
        .unwrap()
        .build();

    let system = MessagingSystem::start_with_broker(
        port,
        &MessagingConfig::default(),
        topology,
        Arc::new(registry),
    )
    .await
    .unwrap();

    SearchIndexProducer::new(system.publisher())
        .create(IndexKind::User, "u-42", json!({ "name": "Ada" }))
        .await
        .unwrap();

    let wait = async {
        while system.stats().events_handled == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("mutation handled");

    assert_eq!(broker.unacked(streams::SEARCH_INDEX_USER), 0);
    assert!(broker.dead_letters(streams::SEARCH_INDEX_USER).is_empty());

    system.shutdown().await;
    fixture.search_server.verify().await;
}
