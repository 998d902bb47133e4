// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use kadira_agent::{
    agent::Agent,
    config::Config,
    errors::SendError,
    send::{retry::RetryPolicy, transport::HttpTransport, DeliveryChannel, ProcessRole},
    trace::{Exception, MethodTrace, TraceMetrics},
};
use mockito::{Matcher, Server};
use serde_json::json;
use std::net::UdpSocket;
use std::sync::Arc;
use std::time::Duration;

fn connected_config(endpoint: String) -> Config {
    Config {
        endpoint: Some(endpoint),
        app_id: Some("app-1".to_string()),
        app_secret: Some("s3cret".to_string()),
        ..Config::default()
    }
}

fn method_trace(name: &str, total: f64) -> MethodTrace {
    MethodTrace {
        id: format!("{name}-trace"),
        name: name.to_string(),
        kind: "method".to_string(),
        metrics: TraceMetrics {
            db: total / 2.0,
            total,
            ..Default::default()
        },
        ..Default::default()
    }
}

#[tokio::test]
async fn agent_ships_errors_and_methods_on_shutdown() {
    let mut server = Server::new_async().await;
    let errors_mock = server
        .mock("POST", "/errors")
        .match_header("KADIRA-APP-ID", "app-1")
        .match_header("KADIRA-APP-SECRET", "s3cret")
        .match_body(Matcher::PartialJson(json!([
            { "appId": "app-1", "name": "x failed", "type": "method", "count": 3 }
        ])))
        .with_status(200)
        .expect(1)
        .create_async()
        .await;
    let metrics_mock = server
        .mock("POST", "/metrics")
        .match_body(Matcher::PartialJson(json!({
            "methodMetrics": [{ "methods": { "posts.insert": { "count": 2 } } }]
        })))
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let mut agent = Agent::new(connected_config(server.url())).expect("agent");
    agent.start();

    let trace = method_trace("posts.insert", 20.0);
    for _ in 0..3 {
        agent
            .errors()
            .track_error(&Exception::new("x failed").with_stack("at x()"), &trace);
    }
    agent.methods().process_method(&method_trace("posts.insert", 20.0));
    agent.methods().process_method(&method_trace("posts.insert", 40.0));
    agent.methods().process_method(&method_trace("kadira.ping", 1.0));

    agent.shutdown().await;

    errors_mock.assert_async().await;
    metrics_mock.assert_async().await;
}

#[tokio::test]
async fn channel_gives_up_after_five_attempts() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/errors")
        .with_status(503)
        .expect(5)
        .create_async()
        .await;

    let transport = HttpTransport::new(&server.url(), "app-1", "s3cret", Duration::from_secs(5))
        .expect("transport");
    let channel = DeliveryChannel::new(Some(Arc::new(transport)), None, ProcessRole::InProcess)
        .with_retry_policy(RetryPolicy::immediate(5));

    let result = channel.send("errors", &json!([])).await;

    assert!(matches!(
        result,
        Err(SendError::Exhausted { attempts: 5, .. })
    ));
    mock.assert_async().await;
}

#[tokio::test]
async fn proxied_agent_sends_through_relay() {
    let mut server = Server::new_async().await;
    let relay_mock = server
        .mock("POST", "/relay")
        .match_body(Matcher::PartialJson(json!({
            "endpoint": "/errors",
            "payload": [{ "name": "boom" }]
        })))
        .with_status(200)
        .expect(1)
        .create_async()
        .await;
    let direct_mock = server
        .mock("POST", "/errors")
        .expect(0)
        .create_async()
        .await;

    let config = Config {
        process_role: ProcessRole::Proxied,
        relay_url: Some(format!("{}/relay", server.url())),
        ..connected_config(server.url())
    };
    let mut agent = Agent::new(config).expect("agent");
    agent.start();
    agent
        .errors()
        .track_error(&Exception::new("boom"), &method_trace("posts.insert", 5.0));
    agent.shutdown().await;

    relay_mock.assert_async().await;
    direct_mock.assert_async().await;
}

#[tokio::test]
async fn method_calls_are_forwarded_to_dogstatsd() {
    let socket = UdpSocket::bind("127.0.0.1:0").expect("bind");
    socket
        .set_read_timeout(Some(Duration::from_secs(2)))
        .expect("timeout");
    let port = socket.local_addr().expect("addr").port();

    let config = Config {
        datadog_agent_host: Some("127.0.0.1".to_string()),
        datadog_agent_port: port,
        ..Config::default()
    };
    let agent = Agent::new(config).expect("agent");
    agent.methods().process_method(&method_trace("posts.insert", 20.0));

    let mut buf = [0u8; 1024];
    let len = socket.recv(&mut buf).expect("datagram");
    assert_eq!(
        std::str::from_utf8(&buf[..len]).expect("utf8"),
        "kadira.method.calls:1|c|#method:posts.insert"
    );
    agent.shutdown().await;
}
