use super::*;
use crate::broker::{ChannelBroker, MessageProperties, OutboundMessage, QueueSpec};
use crate::config::TopologyConfig;
use crate::envelope::Envelope;
use crate::handler::{HandlerError, Request};
use serde_json::json;

fn server(broker: &ChannelBroker) -> RpcServer {
    server_with(broker, ServerConfig::default())
}

fn server_with(broker: &ChannelBroker, config: ServerConfig) -> RpcServer {
    let topology = Topology::new(&TopologyConfig {
        exchange: "test.rpc".to_string(),
        queue_prefix: "svc".to_string(),
        durable: false,
        bind_attempts: 1,
    });
    RpcServer::new(
        Arc::new(broker.clone()),
        topology,
        config,
        "svc",
    )
}

async fn echo(request: Request) -> crate::handler::HandlerResult {
    Ok(request.into_payload())
}

#[tokio::test]
async fn test_register_binds_operation_queue() {
    let broker = ChannelBroker::new();
    let server = server(&broker);

    server.register("get-task", echo).await.unwrap();

    assert!(broker.queue_exists("svc.get-task"));
    assert_eq!(
        broker.bound_queues("test.rpc", "get-task"),
        vec!["svc.get-task".to_string()]
    );
}

#[tokio::test]
async fn test_register_rejects_duplicate_routing_key() {
    let broker = ChannelBroker::new();
    let server = server(&broker);

    server.register("get-task", echo).await.unwrap();
    let result = server.register("get-task", echo).await;

    assert!(matches!(result, Err(ServerError::DuplicateRoutingKey(key)) if key == "get-task"));
}

#[tokio::test]
async fn test_register_rejects_invalid_routing_key() {
    let broker = ChannelBroker::new();
    let server = server(&broker);

    let result = server.register("tasks.*", echo).await;

    assert!(matches!(
        result,
        Err(ServerError::Topology(TopologyError::InvalidRoutingKey { .. }))
    ));
    assert!(server.routing_keys().await.is_empty());
}

#[tokio::test]
async fn test_register_reports_bind_failure() {
    let broker = ChannelBroker::new();
    broker.fail_next_binds(5);
    let server = server(&broker);

    let result = server.register("get-task", echo).await;

    assert!(matches!(
        result,
        Err(ServerError::Topology(TopologyError::Bind { .. }))
    ));
}

#[tokio::test]
async fn test_routing_keys_are_sorted() {
    let broker = ChannelBroker::new();
    let server = server(&broker);

    server.register("update-task", echo).await.unwrap();
    server.register("create-task", echo).await.unwrap();

    let keys: Vec<String> = server
        .routing_keys()
        .await
        .iter()
        .map(ToString::to_string)
        .collect();
    assert_eq!(keys, vec!["create-task", "update-task"]);
}

#[tokio::test]
async fn test_registered_handler_answers_requests() {
    let broker = ChannelBroker::new();
    let server = server(&broker);
    server
        .register("double", |request: Request| async move {
            let n: i64 = request.parse()?;
            Ok::<_, HandlerError>(json!(n * 2))
        })
        .await
        .unwrap();

    broker
        .declare_queue(&QueueSpec::transient("replies"))
        .await
        .unwrap();
    let mut replies = broker.consume("replies", 1).await.unwrap();

    let properties = MessageProperties::default()
        .with_correlation_id("t.1")
        .with_reply_to("replies");
    broker
        .publish(
            "test.rpc",
            "double",
            OutboundMessage::new(b"5".to_vec()).with_properties(properties),
        )
        .await
        .unwrap();

    let reply = replies.next().await.unwrap().unwrap();
    assert_eq!(Envelope::decode(&reply.body).unwrap(), Envelope::Success(json!(10)));
    assert_eq!(reply.properties.correlation_id.as_deref(), Some("t.1"));
}

#[tokio::test]
async fn test_run_returns_after_shutdown() {
    let broker = ChannelBroker::new();
    let server = Arc::new(server(&broker));
    server.register("get-task", echo).await.unwrap();

    let running = Arc::clone(&server);
    let run = tokio::spawn(async move { running.run().await });

    tokio::time::sleep(Duration::from_millis(20)).await;
    server.shutdown().await;

    let result = tokio::time::timeout(Duration::from_secs(1), run)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_run_after_shutdown_returns_immediately() {
    let broker = ChannelBroker::new();
    let server = server(&broker);
    server.shutdown().await;

    let result = tokio::time::timeout(Duration::from_millis(100), server.run()).await;
    assert!(matches!(result, Ok(Ok(()))));
}

#[test]
fn test_failure_policy_from_config() {
    assert_eq!(
        FailurePolicy::from_config(&FailurePolicyConfig::Drop).unwrap(),
        FailurePolicy::Drop
    );

    let policy = FailurePolicy::from_config(&FailurePolicyConfig::Retry {
        max_attempts: 3,
        dead_letter_key: Some("task-failed".to_string()),
    })
    .unwrap();
    assert_eq!(
        policy,
        FailurePolicy::Retry {
            max_attempts: 3,
            dead_letter: Some(RoutingKey::new("task-failed").unwrap()),
        }
    );
}

#[test]
fn test_failure_policy_rejects_invalid_dead_letter_key() {
    let result = FailurePolicy::from_config(&FailurePolicyConfig::Retry {
        max_attempts: 3,
        dead_letter_key: Some("has space".to_string()),
    });
    assert!(result.is_err());
}

async fn request_double(broker: &ChannelBroker, reply_queue: &str, n: i64) -> Envelope {
    broker
        .declare_queue(&QueueSpec::transient(reply_queue))
        .await
        .unwrap();
    let mut replies = broker.consume(reply_queue, 1).await.unwrap();

    let properties = MessageProperties::default()
        .with_correlation_id("t.1")
        .with_reply_to(reply_queue);
    broker
        .publish(
            "test.rpc",
            "double",
            OutboundMessage::new(n.to_string().into_bytes()).with_properties(properties),
        )
        .await
        .unwrap();

    let reply = tokio::time::timeout(Duration::from_secs(2), replies.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    Envelope::decode(&reply.body).unwrap()
}

async fn double(request: Request) -> crate::handler::HandlerResult {
    let n: i64 = request.parse()?;
    Ok(json!(n * 2))
}

#[tokio::test]
async fn test_consumer_resubscribes_after_stream_ends() {
    let broker = ChannelBroker::new();
    let server = server(&broker);
    server.register("double", double).await.unwrap();
    assert_eq!(broker.consume_calls(), 1);

    assert!(broker.close_consumer("svc.double"));

    let reply = request_double(&broker, "replies", 4).await;
    assert_eq!(reply, Envelope::Success(json!(8)));
    assert_eq!(broker.consume_calls(), 3);
}

#[tokio::test]
async fn test_consumer_exhausting_reconnects_stops_run() {
    let broker = ChannelBroker::new();
    let server = server_with(
        &broker,
        ServerConfig {
            reconnect_attempts: 2,
            ..Default::default()
        },
    );
    server.register("double", double).await.unwrap();

    broker.fail_next_consumes(10);
    assert!(broker.close_consumer("svc.double"));

    let result = tokio::time::timeout(Duration::from_secs(5), server.run())
        .await
        .unwrap();

    match result {
        Err(ServerError::ConsumerExhausted {
            queue,
            attempts,
            source,
        }) => {
            assert_eq!(queue, "svc.double");
            assert_eq!(attempts, 2);
            assert!(matches!(source, BrokerError::Subscribe(_)));
        }
        other => panic!("expected ConsumerExhausted, got {:?}", other),
    }
    // One initial subscription plus exactly two reconnect attempts
    assert_eq!(broker.consume_calls(), 3);
}
