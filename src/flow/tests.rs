use super::*;
use crate::broker::CompletionEvent;
use crate::cluster::ClusterNotifier;
use crate::credentials::Token;
use crate::store::{KvStore, MemoryKvStore, StoreError};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

const KEY: &str = "0123456789abcdef0123456789abcdef";

fn token(access: &str) -> Token {
    Token {
        access_token: access.to_string(),
        token_type: "Bearer".to_string(),
        refresh_token: None,
        expires_at: None,
        scopes: vec!["preference:read".to_string()],
    }
}

#[derive(Clone, Copy)]
enum Behaviour {
    Succeed,
    Reject,
    Stall,
    Panic,
}

struct StubProvider {
    behaviour: Behaviour,
    username: Option<String>,
    exchange_calls: AtomicUsize,
    verifiers: Mutex<Vec<String>>,
}

impl StubProvider {
    fn new(behaviour: Behaviour) -> Self {
        Self {
            behaviour,
            username: None,
            exchange_calls: AtomicUsize::new(0),
            verifiers: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> usize {
        self.exchange_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IdentityProvider for StubProvider {
    fn authorization_url(&self, state: &str, code_challenge: &str) -> String {
        format!(
            "https://provider.test/oauth?state={}&code_challenge={}&code_challenge_method=S256",
            state, code_challenge
        )
    }

    async fn exchange(&self, code: &str, verifier: &str) -> Result<crate::credentials::Token, ExchangeError> {
        self.exchange_calls.fetch_add(1, Ordering::SeqCst);
        self.verifiers.lock().unwrap().push(verifier.to_string());
        match self.behaviour {
            Behaviour::Succeed => Ok(token(&format!("T1-for-{}", code))),
            Behaviour::Reject => Err(ExchangeError::Rejected {
                status: 400,
                body: "invalid_grant".to_string(),
            }),
            Behaviour::Stall => {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(token("too-late"))
            }
            Behaviour::Panic => panic!("provider exploded"),
        }
    }

    async fn account_username(&self, _token: &Token) -> anyhow::Result<Option<String>> {
        Ok(self.username.clone())
    }
}

#[derive(Default)]
struct RecordingNotifier {
    events: Mutex<Vec<CompletionEvent>>,
}

impl ClusterNotifier for RecordingNotifier {
    fn broadcast(&self, event: CompletionEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl RecordingNotifier {
    fn count(&self) -> usize {
        self.events.lock().unwrap().len()
    }
}

/// Store whose backend is down.
struct BrokenStore;

impl KvStore for BrokenStore {
    fn set(&self, _: &str, _: &[u8], _: Option<Duration>) -> Result<(), StoreError> {
        Err(StoreError("disk on fire".to_string()))
    }
    fn get(&self, _: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Err(StoreError("disk on fire".to_string()))
    }
    fn delete(&self, _: &str) -> Result<bool, StoreError> {
        Err(StoreError("disk on fire".to_string()))
    }
    fn purge_expired(&self) -> Result<usize, StoreError> {
        Ok(0)
    }
}

struct Harness {
    flow: FlowController,
    provider: Arc<StubProvider>,
    notifier: Arc<RecordingNotifier>,
    kv: Arc<dyn KvStore>,
}

fn harness_with(provider: StubProvider, kv: Arc<dyn KvStore>, timings: FlowTimings) -> Harness {
    let provider = Arc::new(provider);
    let notifier = Arc::new(RecordingNotifier::default());
    let broker = Arc::new(CompletionBroker::new(notifier.clone()));
    let sessions = SessionStore::new(kv.clone(), Duration::from_secs(600));
    let vault = TokenVault::new(kv.clone(), KEY).unwrap();

    Harness {
        flow: FlowController::new(sessions, vault, provider.clone(), broker, timings),
        provider,
        notifier,
        kv,
    }
}

fn harness(behaviour: Behaviour) -> Harness {
    harness_with(
        StubProvider::new(behaviour),
        Arc::new(MemoryKvStore::new()),
        FlowTimings::default(),
    )
}

fn query_param(url: &str, name: &str) -> String {
    reqwest::Url::parse(url)
        .unwrap()
        .query_pairs()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
        .unwrap()
}

#[tokio::test]
async fn test_full_connect_scenario() {
    let h = harness(Behaviour::Succeed);

    let url = h.flow.initiate("U1").await.unwrap();
    let state = query_param(&url, "state");
    assert_eq!(state.len(), STATE_LENGTH);

    let mut waiter = h.flow.broker().subscribe("U1");

    let connected = h.flow.complete("U1", &state, "abc").await.unwrap();
    assert_eq!(connected.user_id, "U1");

    let stored = h.flow.vault().load("U1").unwrap();
    assert_eq!(stored.token.access_token, "T1-for-abc");

    assert_eq!(
        waiter.wait(Duration::from_secs(1)).await,
        WaitOutcome::Delivered(LoginResult::Connected)
    );
    assert_eq!(h.notifier.count(), 1);
}

#[tokio::test]
async fn test_exchange_receives_matching_verifier() {
    let h = harness(Behaviour::Succeed);

    let url = h.flow.initiate("U1").await.unwrap();
    let state = query_param(&url, "state");
    let challenge = query_param(&url, "code_challenge");

    h.flow.complete("U1", &state, "abc").await.unwrap();

    let verifiers = h.provider.verifiers.lock().unwrap();
    assert_eq!(verifiers.len(), 1);
    assert_eq!(verifiers[0].len(), VERIFIER_LENGTH);
    assert_eq!(code_challenge(&verifiers[0]), challenge);
}

#[tokio::test]
async fn test_never_issued_state() {
    let h = harness(Behaviour::Succeed);
    let mut waiter = h.flow.broker().subscribe("U1");

    let err = h.flow.complete("U1", "never-issued", "abc").await.unwrap_err();

    assert!(matches!(err, FlowError::InvalidOrExpiredState));
    assert_eq!(h.provider.calls(), 0);
    assert!(matches!(
        h.flow.vault().load("U1"),
        Err(VaultError::NotConnected)
    ));
    assert!(matches!(
        waiter.wait(Duration::from_secs(1)).await,
        WaitOutcome::Delivered(LoginResult::Failed(_))
    ));
}

#[tokio::test]
async fn test_replayed_callback_succeeds_once() {
    let h = harness(Behaviour::Succeed);
    let state = query_param(&h.flow.initiate("U1").await.unwrap(), "state");

    assert!(h.flow.complete("U1", &state, "abc").await.is_ok());
    let replay = h.flow.complete("U1", &state, "abc").await;

    assert!(matches!(replay, Err(FlowError::InvalidOrExpiredState)));
    assert_eq!(h.provider.calls(), 1);
    assert_eq!(h.notifier.count(), 2);
}

#[tokio::test]
async fn test_missing_code_with_valid_state() {
    let h = harness(Behaviour::Succeed);
    let state = query_param(&h.flow.initiate("U1").await.unwrap(), "state");

    let err = h.flow.complete("U1", &state, "").await.unwrap_err();

    assert!(matches!(err, FlowError::MissingCode));
    assert_eq!(h.provider.calls(), 0);

    // The attempt is terminal: the session was consumed
    let retry = h.flow.complete("U1", &state, "abc").await;
    assert!(matches!(retry, Err(FlowError::InvalidOrExpiredState)));
}

#[tokio::test]
async fn test_missing_code_with_unknown_state() {
    let h = harness(Behaviour::Succeed);

    let err = h.flow.complete("U1", "never-issued", "").await.unwrap_err();

    assert!(matches!(err, FlowError::MissingCode));
    assert_eq!(h.provider.calls(), 0);
}

#[tokio::test]
async fn test_state_mismatch() {
    let h = harness(Behaviour::Succeed);

    // A record filed under one state but bound to another
    let forged = PendingAuthorization::new(
        "U1",
        "some-other-state".to_string(),
        "v".repeat(VERIFIER_LENGTH),
        Duration::from_secs(600),
    );
    h.kv
        .set(
            "oauth_state_presented-state",
            &serde_json::to_vec(&forged).unwrap(),
            Some(Duration::from_secs(600)),
        )
        .unwrap();

    let err = h
        .flow
        .complete("U1", "presented-state", "abc")
        .await
        .unwrap_err();

    assert!(matches!(err, FlowError::StateMismatch));
    assert_eq!(h.provider.calls(), 0);
}

#[tokio::test]
async fn test_user_mismatch() {
    let h = harness(Behaviour::Succeed);
    let state = query_param(&h.flow.initiate("U1").await.unwrap(), "state");
    let mut intruder_waiter = h.flow.broker().subscribe("U2");

    let err = h.flow.complete("U2", &state, "abc").await.unwrap_err();

    assert!(matches!(err, FlowError::UserMismatch));
    assert_eq!(err.public_message(), "not authorized, incorrect user");
    assert_eq!(h.provider.calls(), 0);
    assert!(matches!(
        h.flow.vault().load("U2"),
        Err(VaultError::NotConnected)
    ));
    assert!(matches!(
        intruder_waiter.wait(Duration::from_secs(1)).await,
        WaitOutcome::Delivered(LoginResult::Failed(_))
    ));

    // The hijacked session cannot be reused by its owner either
    let owner = h.flow.complete("U1", &state, "abc").await;
    assert!(matches!(owner, Err(FlowError::InvalidOrExpiredState)));
}

#[tokio::test]
async fn test_exchange_rejected() {
    let h = harness(Behaviour::Reject);
    let state = query_param(&h.flow.initiate("U1").await.unwrap(), "state");
    let mut waiter = h.flow.broker().subscribe("U1");

    let err = h.flow.complete("U1", &state, "abc").await.unwrap_err();

    assert!(matches!(err, FlowError::Exchange(ExchangeError::Rejected { .. })));
    assert_eq!(
        waiter.wait(Duration::from_secs(1)).await,
        WaitOutcome::Delivered(LoginResult::Failed(
            "failed to exchange authorization code".to_string()
        ))
    );
    assert!(matches!(
        h.flow.vault().load("U1"),
        Err(VaultError::NotConnected)
    ));
}

#[tokio::test]
async fn test_exchange_bounded_by_deadline() {
    let timings = FlowTimings {
        callback_budget: Duration::from_millis(50),
        ..FlowTimings::default()
    };
    let h = harness_with(
        StubProvider::new(Behaviour::Stall),
        Arc::new(MemoryKvStore::new()),
        timings,
    );
    let state = query_param(&h.flow.initiate("U1").await.unwrap(), "state");

    let err = h.flow.complete("U1", &state, "abc").await.unwrap_err();

    assert!(matches!(err, FlowError::Exchange(ExchangeError::TimedOut)));
    assert_eq!(h.notifier.count(), 1);
}

#[tokio::test]
async fn test_panic_still_publishes() {
    let h = harness(Behaviour::Panic);
    let state = query_param(&h.flow.initiate("U1").await.unwrap(), "state");
    let mut waiter = h.flow.broker().subscribe("U1");

    let err = h.flow.complete("U1", &state, "abc").await.unwrap_err();

    assert!(matches!(err, FlowError::Internal(ref msg) if msg.contains("provider exploded")));
    assert!(matches!(
        waiter.wait(Duration::from_secs(1)).await,
        WaitOutcome::Delivered(LoginResult::Failed(_))
    ));
    assert_eq!(h.notifier.count(), 1);
}

#[tokio::test]
async fn test_racing_callbacks_only_one_wins() {
    let h = harness(Behaviour::Succeed);
    let state = query_param(&h.flow.initiate("U1").await.unwrap(), "state");

    let (first, second) = tokio::join!(
        h.flow.complete("U1", &state, "abc"),
        h.flow.complete("U1", &state, "abc")
    );

    assert_eq!([first.is_ok(), second.is_ok()].iter().filter(|ok| **ok).count(), 1);
    assert_eq!(h.provider.calls(), 1);
}

#[tokio::test]
async fn test_initiate_waiter_unsubscribes_after_window() {
    let timings = FlowTimings {
        completion_wait: Duration::from_millis(50),
        ..FlowTimings::default()
    };
    let h = harness_with(
        StubProvider::new(Behaviour::Succeed),
        Arc::new(MemoryKvStore::new()),
        timings,
    );

    h.flow.initiate("U1").await.unwrap();
    assert_eq!(h.flow.broker().subscriber_count("U1"), 1);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.flow.broker().subscriber_count("U1"), 0);
}

#[tokio::test]
async fn test_initiate_waiter_released_on_completion() {
    let h = harness(Behaviour::Succeed);
    let state = query_param(&h.flow.initiate("U1").await.unwrap(), "state");
    assert_eq!(h.flow.broker().subscriber_count("U1"), 1);

    h.flow.complete("U1", &state, "abc").await.unwrap();
    assert_eq!(h.flow.broker().subscriber_count("U1"), 0);
}

#[tokio::test]
async fn test_external_username_recorded() {
    let mut provider = StubProvider::new(Behaviour::Succeed);
    provider.username = Some("magnus".to_string());
    let h = harness_with(
        provider,
        Arc::new(MemoryKvStore::new()),
        FlowTimings::default(),
    );
    let state = query_param(&h.flow.initiate("U1").await.unwrap(), "state");

    let connected = h.flow.complete("U1", &state, "abc").await.unwrap();

    assert_eq!(connected.external_username.as_deref(), Some("magnus"));
    assert_eq!(
        h.flow.vault().load("U1").unwrap().external_username.as_deref(),
        Some("magnus")
    );
}

#[tokio::test]
async fn test_store_unavailable() {
    let h = harness_with(
        StubProvider::new(Behaviour::Succeed),
        Arc::new(BrokenStore),
        FlowTimings::default(),
    );

    let initiate = h.flow.initiate("U1").await;
    assert!(matches!(initiate, Err(FlowError::StoreUnavailable(_))));

    let complete = h.flow.complete("U1", "any-state", "abc").await;
    assert!(matches!(complete, Err(FlowError::StoreUnavailable(_))));
    assert_eq!(h.provider.calls(), 0);
    assert_eq!(h.notifier.count(), 1);
}

#[test]
fn test_error_classification() {
    assert!(FlowError::InvalidOrExpiredState.is_client_error());
    assert!(FlowError::UserMismatch.is_client_error());
    assert!(!FlowError::StoreUnavailable("x".into()).is_client_error());
    assert!(!FlowError::Exchange(ExchangeError::TimedOut).is_client_error());

    // Internal detail never leaks into the public message
    let err = FlowError::StoreUnavailable("sqlite: disk I/O error".into());
    assert!(!err.public_message().contains("sqlite"));
}

#[tokio::test]
async fn test_connection_and_disconnect() {
    let h = harness(Behaviour::Succeed);
    assert!(h.flow.connection("U1").unwrap().is_none());
    assert!(!h.flow.disconnect("U1").unwrap());

    let state = query_param(&h.flow.initiate("U1").await.unwrap(), "state");
    h.flow.complete("U1", &state, "abc").await.unwrap();

    let credential = h.flow.connection("U1").unwrap().unwrap();
    assert_eq!(credential.token.access_token, "T1-for-abc");

    assert!(h.flow.disconnect("U1").unwrap());
    assert!(h.flow.connection("U1").unwrap().is_none());
}

#[tokio::test]
async fn test_connection_under_rotated_key_requires_reconnect() {
    let h = harness(Behaviour::Succeed);
    let state = query_param(&h.flow.initiate("U1").await.unwrap(), "state");
    h.flow.complete("U1", &state, "abc").await.unwrap();

    let rotated = TokenVault::new(h.kv.clone(), "ZYXWVUTSRQPONMLKJIHGFEDCBA987654").unwrap();
    let flow = FlowController::new(
        SessionStore::new(h.kv.clone(), Duration::from_secs(600)),
        rotated,
        h.provider.clone(),
        h.flow.broker().clone(),
        FlowTimings::default(),
    );

    assert!(matches!(flow.connection("U1"), Err(FlowError::Decryption(_))));
}
