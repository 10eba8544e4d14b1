//! Integration tests for the gql-chat binary.
//! Runs the binary with assert_cmd against a temp config, a mock HTTP endpoint
//! and an in-process `graphql-ws` server.

use assert_cmd::cargo::cargo_bin_cmd;
use assert_cmd::Command;
use futures_util::{SinkExt, StreamExt};
use predicates::prelude::*;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use wiremock::matchers::{body_partial_json, body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Binary with a clean environment: no config path, no `EIGHTBASE_*`
/// overrides, and a home directory without a default config.
fn gql_chat(home: &Path) -> Command {
    let mut cmd = Command::from(cargo_bin_cmd!("gql-chat"));
    cmd.env("HOME", home)
        .env("USERPROFILE", home)
        .env_remove("GQL_CHAT_CONFIG")
        .env_remove("EIGHTBASE_API_ENDPOINT")
        .env_remove("EIGHTBASE_WS_ENDPOINT")
        .env_remove("EIGHTBASE_WORKSPACE_ID");
    cmd
}

fn write_config(dir: &tempfile::TempDir, api: &str, ws: &str) -> PathBuf {
    let path = dir.path().join("config.yaml");
    std::fs::write(
        &path,
        format!(
            "workspace_id: ck-cli\n\
             api:\n  endpoint: {api}\n\
             subscriptions:\n  endpoint: {ws}\n  reconnect: false\n"
        ),
    )
    .unwrap();
    path
}

/// Runs the command off the async runtime so mock servers keep serving.
async fn run(mut cmd: Command) -> assert_cmd::assert::Assert {
    tokio::task::spawn_blocking(move || cmd.timeout(Duration::from_secs(20)).assert())
        .await
        .unwrap()
}

#[test]
fn unknown_command_fails_with_usage() {
    let home = tempfile::tempdir().unwrap();
    gql_chat(home.path())
        .arg("dance")
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown command: dance"))
        .stderr(predicate::str::contains("usage: gql-chat"));
}

#[test]
fn send_without_content_fails() {
    let home = tempfile::tempdir().unwrap();
    gql_chat(home.path())
        .args(["send", "42"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("send needs message content"));
}

#[test]
fn missing_workspace_is_reported() {
    let home = tempfile::tempdir().unwrap();
    gql_chat(home.path())
        .env("EIGHTBASE_API_ENDPOINT", "http://127.0.0.1:9")
        .arg("history")
        .assert()
        .failure()
        .stderr(predicate::str::contains(
            "Error: missing config value: workspace_id",
        ));
}

#[test]
fn unreadable_config_is_reported() {
    let home = tempfile::tempdir().unwrap();
    let missing = home.path().join("nope.yaml");
    gql_chat(home.path())
        .env("GQL_CHAT_CONFIG", &missing)
        .arg("history")
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to load config"));
}

#[tokio::test(flavor = "multi_thread")]
async fn history_prints_users_and_messages() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/ck-cli"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {
                "usersList": {"items": [{"id": "1", "email": "a@x.com"}]},
                "messagesList": {"items": [{
                    "content": "hello there",
                    "createdAt": "2024-01-01T00:00:00.000Z",
                    "author": {"id": "1", "email": "a@x.com"}
                }]}
            }
        })))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let config_path = write_config(&dir, &server.uri(), "ws://127.0.0.1:9");
    let mut cmd = gql_chat(dir.path());
    cmd.arg("--config").arg(&config_path).arg("history");

    run(cmd)
        .await
        .success()
        .stdout(predicate::str::contains("1 a@x.com"))
        .stdout(predicate::str::contains("[a@x.com] hello there"));
}

#[tokio::test(flavor = "multi_thread")]
async fn mutations_print_their_results() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_string_contains("userCreate"))
        .and(body_partial_json(json!({"variables": {"email": "new@x.com"}})))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"data": {"userCreate": {"id": "42"}}})),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_string_contains("userDelete"))
        .and(body_partial_json(json!({"variables": {"id": "42"}})))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"data": {"userDelete": {"success": true}}})),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_string_contains("messageCreate"))
        .and(body_partial_json(json!({"variables": {"id": "42", "content": "hi all"}})))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"data": {"messageCreate": {"id": "m-7"}}})),
        )
        .mount(&server)
        .await;

    // Config from the environment only. `send` reuses the author id, so each
    // mock is keyed on its mutation field too.
    let home = tempfile::tempdir().unwrap();
    let env_cmd = |args: &[&str]| {
        let mut cmd = gql_chat(home.path());
        cmd.env("EIGHTBASE_API_ENDPOINT", server.uri())
            .env("EIGHTBASE_WORKSPACE_ID", "ck-cli")
            .args(args);
        cmd
    };

    run(env_cmd(&["create-user", "new@x.com"]))
        .await
        .success()
        .stdout(predicate::str::diff("42\n"));
    run(env_cmd(&["delete-user", "42"]))
        .await
        .success()
        .stdout(predicate::str::diff("deleted\n"));
    run(env_cmd(&["send", "42", "hi", "all"]))
        .await
        .success()
        .stdout(predicate::str::diff("m-7\n"));
}

#[tokio::test(flavor = "multi_thread")]
async fn graphql_error_exits_non_zero() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": null,
            "errors": [{"message": "Not authorized"}]
        })))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let config_path = write_config(&dir, &server.uri(), "ws://127.0.0.1:9");
    let mut cmd = gql_chat(dir.path());
    cmd.env("GQL_CHAT_CONFIG", &config_path).arg("history");

    run(cmd)
        .await
        .failure()
        .stderr(predicate::str::contains("Error: GraphQL errors: Not authorized"));
}

/// Acks the connection, waits for both subscriptions, pushes one user event,
/// then drops the connection.
async fn serve_one_watch(listener: tokio::net::TcpListener) {
    let (tcp, _) = listener.accept().await.unwrap();
    let echo_protocol = |req: &Request, mut resp: Response| -> Result<Response, ErrorResponse> {
        if let Some(protocol) = req.headers().get("Sec-WebSocket-Protocol") {
            resp.headers_mut()
                .insert("Sec-WebSocket-Protocol", protocol.clone());
        }
        Ok(resp)
    };
    let mut ws = tokio_tungstenite::accept_hdr_async(tcp, echo_protocol)
        .await
        .unwrap();

    let mut starts = Vec::new();
    while starts.len() < 2 {
        let Some(Ok(Message::Text(text))) = ws.next().await else {
            panic!("client went away");
        };
        let frame: Value = serde_json::from_str(&text).unwrap();
        match frame["type"].as_str() {
            Some("connection_init") => {
                assert_eq!(frame["payload"]["workspaceId"], "ck-cli");
                ws.send(Message::Text(json!({"type": "connection_ack"}).to_string()))
                    .await
                    .unwrap();
            }
            Some("start") => starts.push(frame),
            _ => {}
        }
    }

    let users = starts
        .iter()
        .find(|s| s["payload"]["query"].as_str().unwrap_or("").contains("Users"))
        .unwrap();
    let event = json!({
        "type": "data",
        "id": users["id"],
        "payload": {"data": {"Users": {
            "mutation": "create",
            "node": {"id": "42", "email": "a@x.com"}
        }}}
    });
    ws.send(Message::Text(event.to_string())).await.unwrap();

    // Give the client time to print before the connection drops.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let _ = ws.close(None).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn watch_prints_events_until_connection_is_lost() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = tokio::spawn(serve_one_watch(listener));

    let dir = tempfile::tempdir().unwrap();
    let config_path = write_config(&dir, "http://127.0.0.1:9", &format!("ws://127.0.0.1:{port}"));
    let mut cmd = gql_chat(dir.path());
    cmd.arg("--config").arg(&config_path).arg("watch");

    run(cmd)
        .await
        .failure()
        .stdout(predicate::str::contains("user created 42 a@x.com"))
        .stderr(predicate::str::contains("connection lost"));
    server.await.unwrap();
}
