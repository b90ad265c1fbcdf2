//! Shared fixtures for the dispatcher scenario tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use ldapd_core::{
    AuthState, BindRequest, Dn, Entry, ExtendedRequest, Filter, LdapResult, Operation, Request,
    SearchRequest, SearchScope,
};
use ldapd_server::memory::WHO_AM_I_OID;
use ldapd_server::{
    AdmissionDispatcher, Backend, BackendError, IdentityMapper, InMemoryDirectory, SaslConfig,
    ServerConfig, ServerContext, StoredPassword, UserRecord,
};
use tokio::sync::mpsc::UnboundedReceiver;

pub const REALM: &str = "test.realm";
pub const ALICE_DN: &str = "uid=alice,ou=people,o=test";
pub const BOB_DN: &str = "uid=bob,ou=people,o=test";
pub const CAROL_DN: &str = "uid=carol,ou=people,o=test";

/// Entries visible to anonymous clients under `o=test`.
pub const ANONYMOUS_VISIBLE: usize = 5;
/// Entries visible to any authenticated client under `o=test`.
pub const AUTHENTICATED_VISIBLE: usize = 7;

pub fn dn(s: &str) -> Dn {
    Dn::parse(s).unwrap()
}

/// `o=test` with three users and a restricted `ou=staff` subtree.
///
/// alice: pre-digested DIGEST-MD5 secret for `REALM`, password `wonderland`.
/// bob: cleartext `builder`.
/// carol: salted SHA-256 `one-way`, unusable for DIGEST-MD5.
pub fn directory() -> Arc<InMemoryDirectory> {
    let directory = InMemoryDirectory::new().with_restricted_subtree(dn("ou=staff,o=test"));
    directory.insert(Entry::new(dn("o=test")).with("objectClass", "organization"));
    directory.insert(Entry::new(dn("ou=people,o=test")).with("objectClass", "organizationalUnit"));
    directory.insert(Entry::new(dn("ou=staff,o=test")).with("objectClass", "organizationalUnit"));
    directory.insert(Entry::new(dn("cn=payroll,ou=staff,o=test")).with("objectClass", "document"));
    directory.insert(
        Entry::new(dn(ALICE_DN))
            .with("objectClass", "person")
            .with("uid", "alice")
            .with(
                "userPassword",
                StoredPassword::digest_md5("alice", REALM, "wonderland").encode(),
            )
            .with("ds-privilege-name", "proxied-auth"),
    );
    directory.insert(
        Entry::new(dn(BOB_DN))
            .with("objectClass", "person")
            .with("uid", "bob")
            .with("userPassword", "{CLEAR}builder"),
    );
    directory.insert(
        Entry::new(dn(CAROL_DN))
            .with("objectClass", "person")
            .with("uid", "carol")
            .with("userPassword", StoredPassword::ssha256("one-way", b"pepper").encode()),
    );
    Arc::new(directory)
}

pub fn config(workers: u32) -> ServerConfig {
    ServerConfig {
        worker_threads: workers,
        sasl: SaslConfig {
            realm: Some(REALM.to_string()),
            ..SaslConfig::default()
        },
        drain_timeout_ms: 5_000,
        ..ServerConfig::default()
    }
}

pub fn start(config: ServerConfig) -> AdmissionDispatcher {
    start_with(config, directory())
}

pub fn start_with<B>(config: ServerConfig, backend: Arc<B>) -> AdmissionDispatcher
where
    B: Backend + IdentityMapper + 'static,
{
    let identities: Arc<dyn IdentityMapper> = backend.clone();
    let backend: Arc<dyn Backend> = backend;
    AdmissionDispatcher::start(ServerContext::new(config, backend, identities)).unwrap()
}

pub async fn recv(results: &mut UnboundedReceiver<LdapResult>) -> LdapResult {
    tokio::time::timeout(Duration::from_secs(5), results.recv())
        .await
        .expect("timed out waiting for a result")
        .expect("result channel closed")
}

/// Receives `count` results and returns them sorted by message id.
pub async fn recv_all(results: &mut UnboundedReceiver<LdapResult>, count: usize) -> Vec<LdapResult> {
    let mut all = Vec::with_capacity(count);
    for _ in 0..count {
        all.push(recv(results).await);
    }
    all.sort_by_key(|r| r.message_id);
    all
}

/// Nothing further arrives within a short grace period.
pub async fn assert_quiet(results: &mut UnboundedReceiver<LdapResult>) {
    let extra = tokio::time::timeout(Duration::from_millis(100), results.recv()).await;
    assert!(extra.is_err(), "unexpected result: {extra:?}");
}

pub fn search_all() -> Request {
    Request::Search(SearchRequest::new(
        dn("o=test"),
        SearchScope::Subtree,
        Filter::match_all(),
    ))
}

pub fn who_am_i() -> Request {
    Request::Extended(ExtendedRequest {
        oid: WHO_AM_I_OID.to_string(),
        value: None,
    })
}

pub fn authzid(result: &LdapResult) -> String {
    let value = result.response_value.clone().unwrap_or_default();
    String::from_utf8(value.to_vec()).unwrap()
}

pub fn digest_start() -> Request {
    Request::Bind(BindRequest::sasl("DIGEST-MD5", None))
}

pub fn digest_continue(response: Bytes) -> Request {
    Request::Bind(BindRequest::sasl("DIGEST-MD5", Some(response)))
}

pub fn simple(name: &str, password: &str) -> Request {
    Request::Bind(BindRequest::simple(name, Bytes::copy_from_slice(password.as_bytes())))
}

/// Blocks searches whose base is `o=block` until released, panics on
/// `o=panic`, and sends everything else to an in-memory directory.
pub struct ScriptedBackend {
    pub directory: Arc<InMemoryDirectory>,
    release: AtomicBool,
    pub started: AtomicBool,
}

impl ScriptedBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            directory: directory(),
            release: AtomicBool::new(false),
            started: AtomicBool::new(false),
        })
    }

    pub fn release(&self) {
        self.release.store(true, Ordering::Release);
    }

    pub fn wait_started(&self) {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !self.started.load(Ordering::Acquire) {
            assert!(std::time::Instant::now() < deadline, "blocking search never started");
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

pub fn search_base(base: &str) -> Request {
    Request::Search(SearchRequest::new(dn(base), SearchScope::Base, Filter::match_all()))
}

impl Backend for ScriptedBackend {
    fn execute(&self, operation: &Operation, auth: &AuthState) -> Result<LdapResult, BackendError> {
        if let Request::Search(search) = operation.request() {
            if search.base == dn("o=panic") {
                panic!("scripted backend failure");
            }
            if search.base == dn("o=block") {
                self.started.store(true, Ordering::Release);
                while !self.release.load(Ordering::Acquire) {
                    std::thread::sleep(Duration::from_millis(1));
                }
                return Ok(LdapResult::success(operation.message_id()));
            }
        }
        self.directory.execute(operation, auth)
    }
}

impl IdentityMapper for ScriptedBackend {
    fn find_by_username(&self, username: &str) -> Result<Option<UserRecord>, BackendError> {
        self.directory.find_by_username(username)
    }

    fn find_by_dn(&self, dn: &Dn) -> Result<Option<UserRecord>, BackendError> {
        self.directory.find_by_dn(dn)
    }
}
