//! Bind negotiation as seen by a client: held operations, identity hand-off,
//! and failure recovery.

mod common;

use std::sync::Arc;

use bytes::Bytes;
use common::*;
use ldapd_core::{BindRequest, MessageId, Request, ResultCode};
use ldapd_server::sasl::DigestMd5Client;
use ldapd_server::{Admission, FailedBindPolicy};

fn id(n: u32) -> MessageId {
    MessageId(n)
}

#[tokio::test]
async fn digest_bind_releases_held_search_with_new_identity() {
    let dispatcher = start(config(4));
    let (conn, mut results) = dispatcher.open_connection("127.0.0.1:40001");

    assert_eq!(dispatcher.submit(&conn, id(1), digest_start()), Admission::Queued);
    assert_eq!(dispatcher.submit(&conn, id(2), search_all()), Admission::Held);

    let challenge = recv(&mut results).await;
    assert_eq!(challenge.message_id, id(1));
    assert_eq!(challenge.code, ResultCode::SaslBindInProgress);
    let challenge = challenge.server_sasl_credentials.unwrap();

    let response = DigestMd5Client::new("alice", "wonderland", "localhost")
        .respond(&challenge)
        .unwrap();
    assert_eq!(dispatcher.submit(&conn, id(3), digest_continue(response)), Admission::Queued);

    let bound = recv(&mut results).await;
    assert_eq!(bound.message_id, id(3));
    assert_eq!(bound.code, ResultCode::Success);
    let rspauth = bound.server_sasl_credentials.unwrap();
    assert!(rspauth.starts_with(b"rspauth="));

    let search = recv(&mut results).await;
    assert_eq!(search.message_id, id(2));
    assert_eq!(search.code, ResultCode::Success);
    assert_eq!(search.entries.len(), AUTHENTICATED_VISIBLE);
    assert_eq!(conn.auth().identity(), Some(&dn(ALICE_DN)));
}

#[tokio::test]
async fn wrong_password_leaves_connection_anonymous() {
    let dispatcher = start(config(4));
    let (conn, mut results) = dispatcher.open_connection("127.0.0.1:40002");

    dispatcher.submit(&conn, id(1), digest_start());
    dispatcher.submit(&conn, id(2), search_all());
    let challenge = recv(&mut results).await.server_sasl_credentials.unwrap();
    let response = DigestMd5Client::new("alice", "looking-glass", "localhost")
        .respond(&challenge)
        .unwrap();
    dispatcher.submit(&conn, id(3), digest_continue(response));

    let bound = recv(&mut results).await;
    assert_eq!(bound.code, ResultCode::InvalidCredentials);
    let search = recv(&mut results).await;
    assert_eq!(search.message_id, id(2));
    assert_eq!(search.entries.len(), ANONYMOUS_VISIBLE);
    assert!(conn.auth().is_anonymous());
    assert!(!conn.auth().is_bind_in_progress());
}

#[tokio::test]
async fn unknown_user_is_indistinguishable_from_bad_password() {
    let dispatcher = start(config(2));
    let mut outcomes = Vec::new();
    for (n, (user, password)) in [("alice", "nope"), ("mallory", "nope"), ("carol", "one-way")]
        .into_iter()
        .enumerate()
    {
        let (conn, mut results) = dispatcher.open_connection(format!("127.0.0.1:{}", 41000 + n));
        dispatcher.submit(&conn, id(1), digest_start());
        let challenge = recv(&mut results).await.server_sasl_credentials.unwrap();
        let response = DigestMd5Client::new(user, password, "localhost")
            .respond(&challenge)
            .unwrap();
        dispatcher.submit(&conn, id(2), digest_continue(response));
        let bound = recv(&mut results).await;
        outcomes.push((bound.code, bound.diagnostic_message));
    }
    assert_eq!(outcomes[0].0, ResultCode::InvalidCredentials);
    assert_eq!(outcomes[0], outcomes[1]);
    assert_eq!(outcomes[0], outcomes[2]);
}

#[tokio::test]
async fn malformed_continuation_is_a_protocol_error() {
    let dispatcher = start(config(2));
    let (conn, mut results) = dispatcher.open_connection("127.0.0.1:40003");

    dispatcher.submit(&conn, id(1), digest_start());
    recv(&mut results).await;
    dispatcher.submit(&conn, id(2), digest_continue(Bytes::from_static(b"not a digest response")));
    dispatcher.submit(&conn, id(3), who_am_i());

    let bound = recv(&mut results).await;
    assert_eq!(bound.message_id, id(2));
    assert_eq!(bound.code, ResultCode::ProtocolError);
    let whoami = recv(&mut results).await;
    assert_eq!(authzid(&whoami), "");
}

#[tokio::test]
async fn concurrent_connections_bind_independently() {
    let dispatcher = start(config(4));
    let (alice, mut alice_results) = dispatcher.open_connection("127.0.0.1:40004");
    let (bob, mut bob_results) = dispatcher.open_connection("127.0.0.1:40005");

    dispatcher.submit(&alice, id(1), digest_start());
    dispatcher.submit(&bob, id(1), digest_start());
    dispatcher.submit(&alice, id(2), who_am_i());
    dispatcher.submit(&bob, id(2), who_am_i());

    let alice_challenge = recv(&mut alice_results).await.server_sasl_credentials.unwrap();
    let bob_challenge = recv(&mut bob_results).await.server_sasl_credentials.unwrap();
    assert_ne!(alice_challenge, bob_challenge);

    let bob_response = DigestMd5Client::new("bob", "builder", "localhost")
        .respond(&bob_challenge)
        .unwrap();
    let alice_response = DigestMd5Client::new("alice", "wonderland", "localhost")
        .respond(&alice_challenge)
        .unwrap();
    dispatcher.submit(&bob, id(3), digest_continue(bob_response));
    dispatcher.submit(&alice, id(3), digest_continue(alice_response));

    assert_eq!(recv(&mut alice_results).await.code, ResultCode::Success);
    assert_eq!(authzid(&recv(&mut alice_results).await), format!("dn:{ALICE_DN}"));
    assert_eq!(recv(&mut bob_results).await.code, ResultCode::Success);
    assert_eq!(authzid(&recv(&mut bob_results).await), format!("dn:{BOB_DN}"));
}

#[tokio::test]
async fn pipelined_plain_continuation_waits_for_challenge() {
    let dispatcher = start(config(2));
    let (conn, mut results) = dispatcher.open_connection("127.0.0.1:40006");

    // Credentials are sent before the empty challenge has been issued.
    dispatcher.submit(&conn, id(1), Request::Bind(BindRequest::sasl("PLAIN", None)));
    let credentials = Bytes::from_static(b"\0bob\0builder");
    dispatcher.submit(&conn, id(2), Request::Bind(BindRequest::sasl("PLAIN", Some(credentials))));
    dispatcher.submit(&conn, id(3), who_am_i());

    let challenge = recv(&mut results).await;
    assert_eq!(challenge.message_id, id(1));
    assert_eq!(challenge.code, ResultCode::SaslBindInProgress);
    let bound = recv(&mut results).await;
    assert_eq!(bound.message_id, id(2));
    assert_eq!(bound.code, ResultCode::Success);
    let whoami = recv(&mut results).await;
    assert_eq!(whoami.message_id, id(3));
    assert_eq!(authzid(&whoami), format!("dn:{BOB_DN}"));
}

#[tokio::test]
async fn pipelined_continuation_behind_held_operation_is_admitted() {
    let backend = ScriptedBackend::new();
    let dispatcher = start_with(config(1), Arc::clone(&backend));
    let (conn, mut results) = dispatcher.open_connection("127.0.0.1:40010");

    // The only worker is busy, so the bind step cannot issue its challenge yet.
    dispatcher.submit(&conn, id(1), search_base("o=block"));
    backend.wait_started();
    dispatcher.submit(&conn, id(2), Request::Bind(BindRequest::sasl("PLAIN", None)));
    assert_eq!(dispatcher.submit(&conn, id(3), who_am_i()), Admission::Held);
    let credentials = Bytes::from_static(b"\0bob\0builder");
    assert_eq!(
        dispatcher.submit(&conn, id(4), Request::Bind(BindRequest::sasl("PLAIN", Some(credentials)))),
        Admission::Held
    );
    backend.release();

    assert_eq!(recv(&mut results).await.message_id, id(1));
    let challenge = recv(&mut results).await;
    assert_eq!(challenge.message_id, id(2));
    assert_eq!(challenge.code, ResultCode::SaslBindInProgress);
    let bound = recv(&mut results).await;
    assert_eq!(bound.message_id, id(4));
    assert_eq!(bound.code, ResultCode::Success);
    let whoami = recv(&mut results).await;
    assert_eq!(whoami.message_id, id(3));
    assert_eq!(authzid(&whoami), format!("dn:{BOB_DN}"));
    assert_eq!(conn.held_count(), 0);
}

#[tokio::test]
async fn simple_bind_chain_applies_identities_in_order() {
    let dispatcher = start(config(4));
    let (conn, mut results) = dispatcher.open_connection("127.0.0.1:40007");

    dispatcher.submit(&conn, id(1), simple(ALICE_DN, "wonderland"));
    dispatcher.submit(&conn, id(2), who_am_i());
    dispatcher.submit(&conn, id(3), simple(BOB_DN, "builder"));
    dispatcher.submit(&conn, id(4), who_am_i());
    dispatcher.submit(&conn, id(5), simple("", ""));
    dispatcher.submit(&conn, id(6), who_am_i());

    let all = recv_all(&mut results, 6).await;
    assert!(all.iter().step_by(2).all(|r| r.code == ResultCode::Success));
    assert_eq!(authzid(&all[1]), format!("dn:{ALICE_DN}"));
    assert_eq!(authzid(&all[3]), format!("dn:{BOB_DN}"));
    assert_eq!(authzid(&all[5]), "");
}

#[tokio::test]
async fn failed_bind_policy_controls_identity_after_failure() {
    for (policy, expected) in [
        (FailedBindPolicy::RetainPrevious, format!("dn:{BOB_DN}")),
        (FailedBindPolicy::ResetToAnonymous, String::new()),
    ] {
        let mut config = config(2);
        config.failed_bind = policy;
        let dispatcher = start(config);
        let (conn, mut results) = dispatcher.open_connection("127.0.0.1:40008");

        dispatcher.submit(&conn, id(1), simple(BOB_DN, "builder"));
        dispatcher.submit(&conn, id(2), simple(ALICE_DN, "wrong"));
        dispatcher.submit(&conn, id(3), who_am_i());

        let all = recv_all(&mut results, 3).await;
        assert_eq!(all[0].code, ResultCode::Success);
        assert_eq!(all[1].code, ResultCode::InvalidCredentials);
        assert_eq!(authzid(&all[2]), expected, "{policy:?}");
    }
}

#[tokio::test]
async fn disabled_mechanism_is_refused() {
    let mut config = config(2);
    config.sasl.enabled_mechanisms = vec!["DIGEST-MD5".to_string()];
    let dispatcher = start(config);
    let (conn, mut results) = dispatcher.open_connection("127.0.0.1:40009");

    dispatcher.submit(&conn, id(1), Request::Bind(BindRequest::sasl("PLAIN", None)));
    dispatcher.submit(&conn, id(2), who_am_i());

    let bound = recv(&mut results).await;
    assert_eq!(bound.code, ResultCode::AuthMethodNotSupported);
    assert_eq!(recv(&mut results).await.code, ResultCode::Success);
}
