//! Session handling as seen through API calls

mod common;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use common::{CONTROLLER_URL, client, init_tracing, legacy_config};
use decs_controller::api;
use decs_controller::mock::{MockReply, MockTransport};
use decs_controller::{
    AuthFailure, AuthMode, CallTimeout, CredentialConfig, DecsError, FormParams, TokenKind,
};
use tokio_test::{assert_err, assert_ok};

fn jwt_for(user: &str) -> String {
    format!(
        "{}.{}.sig",
        URL_SAFE_NO_PAD.encode(br#"{"alg":"ES384"}"#),
        URL_SAFE_NO_PAD.encode(format!(r#"{{"username":"{}","exp":4102444800}}"#, user))
    )
}

#[tokio::test]
async fn every_mode_yields_a_session_with_token_and_user() {
    init_tracing();

    let legacy = MockTransport::new();
    legacy.on(api::LEGACY_LOGIN_API, MockReply::ok("\"sid-legacy\""));
    let session = assert_ok!(client(legacy_config(), &legacy).session().await);
    assert_eq!(session.kind(), TokenKind::SessionId);
    assert_eq!(session.token(), "sid-legacy");
    assert_eq!(session.username(), "admin");

    let oauth = MockTransport::new();
    oauth
        .on(api::OAUTH2_TOKEN_API, MockReply::ok(jwt_for("robot")))
        .on(api::JWT_EXCHANGE_API, MockReply::ok("\"robot@decs\""));
    let config = CredentialConfig::builder()
        .controller_url(CONTROLLER_URL)
        .mode(AuthMode::OAuth2)
        .oauth2_url("https://sso.example.com")
        .app_id("app")
        .app_secret("secret")
        .build()
        .unwrap();
    let session = assert_ok!(client(config, &oauth).session().await);
    assert_eq!(session.kind(), TokenKind::Bearer);
    assert!(!session.token().is_empty());
    assert_eq!(session.username(), "robot@decs");

    let jwt = MockTransport::new();
    jwt.on(api::JWT_EXCHANGE_API, MockReply::ok(""));
    let config = CredentialConfig::builder()
        .controller_url(CONTROLLER_URL)
        .mode(AuthMode::Jwt)
        .jwt(jwt_for("alice"))
        .build()
        .unwrap();
    let session = assert_ok!(client(config, &jwt).session().await);
    assert_eq!(session.username(), "alice");
    assert_eq!(jwt.call_count(api::JWT_EXCHANGE_API), 1);
}

#[test]
fn incomplete_credentials_never_produce_a_config() {
    let cases = [
        (
            CredentialConfig::builder()
                .controller_url(CONTROLLER_URL)
                .mode(AuthMode::Legacy)
                .legacy_user("admin"),
            "password",
        ),
        (
            CredentialConfig::builder()
                .controller_url(CONTROLLER_URL)
                .mode(AuthMode::OAuth2)
                .app_id("app")
                .app_secret("secret"),
            "oauth2_url",
        ),
        (
            CredentialConfig::builder()
                .controller_url(CONTROLLER_URL)
                .mode(AuthMode::Jwt),
            "jwt",
        ),
    ];

    // without a config there is no client, so nothing can reach the network
    for (builder, field) in cases {
        let err = assert_err!(builder.build());
        assert!(matches!(&err, DecsError::InvalidConfig(msg) if msg.contains(field)));
    }
}

#[tokio::test]
async fn bearer_sessions_use_the_authorization_header() {
    let mock = MockTransport::new();
    let jwt = jwt_for("alice");
    mock.on(api::JWT_EXCHANGE_API, MockReply::ok(""))
        .on(api::MACHINE_LIST_API, MockReply::ok("[]"));
    let config = CredentialConfig::builder()
        .controller_url(CONTROLLER_URL)
        .mode(AuthMode::Jwt)
        .jwt(jwt.clone())
        .build()
        .unwrap();
    let client = client(config, &mock);

    assert_ok!(
        client
            .invoker()
            .post(api::MACHINE_LIST_API, &FormParams::new(), CallTimeout::Read)
            .await
    );
    let call = &mock.calls_to(api::MACHINE_LIST_API)[0];
    assert_eq!(call.bearer.as_deref(), Some(jwt.as_str()));
    assert_eq!(call.param("authkey"), None);
}

#[tokio::test]
async fn ensure_valid_twice_authenticates_once() {
    let mock = MockTransport::new();
    mock.on(api::LEGACY_LOGIN_API, MockReply::ok("sid"));
    let client = client(legacy_config(), &mock);

    assert_ok!(client.auth().ensure_valid().await);
    assert_ok!(client.auth().ensure_valid().await);
    assert_eq!(mock.call_count(api::LEGACY_LOGIN_API), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_share_one_authentication() {
    let mock = MockTransport::new();
    mock.on(api::LEGACY_LOGIN_API, MockReply::ok("sid"))
        .on(api::MACHINE_LIST_API, MockReply::ok("[]"));
    let client = client(legacy_config(), &mock);

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .invoker()
                    .post(api::MACHINE_LIST_API, &FormParams::new(), CallTimeout::Read)
                    .await
            })
        })
        .collect();
    for task in tasks {
        assert_ok!(task.await.unwrap());
    }

    assert_eq!(mock.call_count(api::LEGACY_LOGIN_API), 1);
    assert_eq!(mock.call_count(api::MACHINE_LIST_API), 16);
}

#[tokio::test]
async fn expired_session_is_renewed_once_and_the_call_retried() {
    init_tracing();
    let mock = MockTransport::new();
    mock.on(api::LEGACY_LOGIN_API, MockReply::ok("sid-1"))
        .on(api::LEGACY_LOGIN_API, MockReply::ok("sid-2"))
        .on(api::MACHINE_GET_API, MockReply::status(401, "session expired"))
        .on(api::MACHINE_GET_API, MockReply::ok(r#"{"id": 5}"#));
    let client = client(legacy_config(), &mock);

    let params = FormParams::new().with("machineId", 5);
    let body = assert_ok!(
        client
            .invoker()
            .post(api::MACHINE_GET_API, &params, CallTimeout::Read)
            .await
    );
    assert_eq!(body, r#"{"id": 5}"#);

    assert_eq!(mock.call_count(api::LEGACY_LOGIN_API), 2);
    let calls = mock.calls_to(api::MACHINE_GET_API);
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].param("authkey"), Some("sid-1"));
    assert_eq!(calls[1].param("authkey"), Some("sid-2"));
}

#[tokio::test]
async fn second_consecutive_rejection_surfaces_api_error() {
    let mock = MockTransport::new();
    mock.on(api::LEGACY_LOGIN_API, MockReply::ok("sid"))
        .on(api::MACHINE_GET_API, MockReply::status(401, "session expired"));
    let client = client(legacy_config(), &mock);

    let err = assert_err!(
        client
            .invoker()
            .post(api::MACHINE_GET_API, &FormParams::new(), CallTimeout::Read)
            .await
    );
    assert!(matches!(err, DecsError::Api { status: 401, .. }));
    assert_eq!(mock.call_count(api::MACHINE_GET_API), 2);
    assert_eq!(mock.call_count(api::LEGACY_LOGIN_API), 2);
}

#[tokio::test]
async fn rejected_renewal_is_an_auth_error() {
    let mock = MockTransport::new();
    mock.on(api::LEGACY_LOGIN_API, MockReply::ok("sid"))
        .on(api::LEGACY_LOGIN_API, MockReply::status(403, "account disabled"))
        .on(api::MACHINE_GET_API, MockReply::status(401, "session expired"));
    let client = client(legacy_config(), &mock);

    let err = assert_err!(
        client
            .invoker()
            .post(api::MACHINE_GET_API, &FormParams::new(), CallTimeout::Read)
            .await
    );
    assert_eq!(err.auth_reason(), Some(AuthFailure::Rejected));
    assert_eq!(mock.call_count(api::MACHINE_GET_API), 1);
}
