use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::{sync::Notify, time::timeout};

use typebus::{
    envelope::codec, handler_fn, header, type_topic, BrokerProducer, ContextBag, DispatchError,
    HandlerError, InMemoryBroker, InMemorySubscriptionStore, IncomingMessage, LogicalAddress,
    OutgoingMessage, PumpError, PumpState, StatusCode, TopicProvisioner, TransportInfrastructure,
    TransportOperation, TransportOperations, TransportSettings, TransportTransaction,
    TypeDescriptor, TypeRegistry,
};

fn settings(endpoint: &str) -> TransportSettings {
    TransportSettings {
        max_concurrency: 1,
        poll_timeout_ms: 20,
        poll_retry_delay_ms: 5,
        redelivery_delay_ms: 5,
        stop_timeout_ms: 2_000,
        ..TransportSettings::new(endpoint, "memory")
    }
}

fn infrastructure(
    broker: &InMemoryBroker,
    settings: TransportSettings,
) -> TransportInfrastructure {
    infrastructure_with_store(
        broker,
        settings,
        Arc::new(InMemorySubscriptionStore::new()),
    )
}

fn infrastructure_with_store(
    broker: &InMemoryBroker,
    settings: TransportSettings,
    store: Arc<InMemorySubscriptionStore>,
) -> TransportInfrastructure {
    let registry = TypeRegistry::builder()
        .register(TypeDescriptor::class("PlaceOrder"))
        .register(TypeDescriptor::class("OrderAccepted"))
        .register(TypeDescriptor::class("OrderEvent"))
        .register(TypeDescriptor::class("OrderPlaced").extends("OrderEvent"))
        .build()
        .unwrap();
    TransportInfrastructure::new(
        settings,
        Arc::new(broker.clone()),
        Arc::new(registry),
        store,
    )
    .unwrap()
}

fn send(
    message_type: &str,
    destination: &str,
) -> TransportOperation {
    TransportOperation::send(
        OutgoingMessage::builder(message_type)
            .body(Bytes::from_static(b"{}"))
            .build(),
        LogicalAddress::new(destination),
    )
}

/// Собирает идентификаторы доставленных сообщений.
fn collecting_handler(
    seen: Arc<Mutex<Vec<String>>>
) -> Arc<dyn typebus::MessageHandler> {
    Arc::new(handler_fn(move |msg: IncomingMessage| {
        let seen = Arc::clone(&seen);
        async move {
            seen.lock()
                .push(msg.message_id().unwrap_or_default().to_string());
            Ok(())
        }
    }))
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Тест проверяет, что send пишет ровно одну запись в топик получателя и
/// ставит адрес для ответа; ответ возвращается отправителю.
#[tokio::test]
async fn test_send_and_reply() {
    let broker = InMemoryBroker::new();
    let client = infrastructure(&broker, settings("client"));
    let server = infrastructure(&broker, settings("server"));
    client.provision().await.unwrap();

    let server_dispatcher = server.dispatcher().await.unwrap();
    let server_handler = handler_fn(move |msg: IncomingMessage| {
        let dispatcher = Arc::clone(&server_dispatcher);
        async move {
            let reply_to = msg
                .reply_to()
                .ok_or_else(|| HandlerError::new("request without reply address"))?
                .to_string();
            let reply = OutgoingMessage::builder("OrderAccepted")
                .body(msg.body.clone())
                .build();
            dispatcher
                .dispatch(
                    TransportOperation::reply(reply, reply_to),
                    &TransportTransaction::new(),
                    &ContextBag::new(),
                )
                .await
                .map_err(HandlerError::from_error)?;
            Ok(())
        }
    });
    server
        .start_receiving(Arc::new(server_handler), None)
        .await
        .unwrap();

    let replies = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&replies);
    client
        .start_receiving(
            Arc::new(handler_fn(move |msg: IncomingMessage| {
                let sink = Arc::clone(&sink);
                async move {
                    sink.lock().push((
                        msg.message_type().unwrap_or_default().to_string(),
                        msg.header(header::MESSAGE_INTENT)
                            .unwrap_or_default()
                            .to_string(),
                    ));
                    Ok(())
                }
            })),
            None,
        )
        .await
        .unwrap();

    let outcome = client
        .dispatcher()
        .await
        .unwrap()
        .dispatch(
            send("PlaceOrder", "server"),
            &TransportTransaction::new(),
            &ContextBag::new(),
        )
        .await
        .unwrap();
    assert_eq!(outcome.total_writes(), 1);
    assert_eq!(&*outcome.operations[0].positions[0].topic, "server");

    wait_until(|| !replies.lock().is_empty()).await;
    assert_eq!(
        replies.lock().clone(),
        vec![("OrderAccepted".to_string(), "Reply".to_string())]
    );

    let requests = broker.records("server");
    assert_eq!(requests.len(), 1);
    let request = codec().decode(&requests[0].payload).unwrap();
    assert_eq!(request.headers[header::REPLY_TO_ADDRESS], "client");
    assert_eq!(request.headers[header::MESSAGE_INTENT], "Send");

    client.stop_receiving().await.unwrap();
    server.stop_receiving().await.unwrap();
}

/// Тест проверяет доставку «как минимум один раз»: сбой обработчика не
/// фиксирует смещение, запись приходит повторно.
#[tokio::test]
async fn test_handler_failure_redelivers() {
    let broker = InMemoryBroker::new();
    let infra = infrastructure(&broker, settings("billing"));
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);

    infra
        .start_receiving(
            Arc::new(handler_fn(move |_msg| {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(HandlerError::new("database is busy"))
                    } else {
                        Ok(())
                    }
                }
            })),
            None,
        )
        .await
        .unwrap();

    infra
        .dispatcher()
        .await
        .unwrap()
        .dispatch(
            send("PlaceOrder", "billing"),
            &TransportTransaction::new(),
            &ContextBag::new(),
        )
        .await
        .unwrap();

    let pump = infra.pump();
    wait_until(|| pump.stats().delivered == 1).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(pump.stats().failed, 2);
    assert_eq!(broker.committed_offset("billing", "billing", 0), Some(1));
    infra.stop_receiving().await.unwrap();
}

/// Тест проверяет порядок доставки внутри партиции.
#[tokio::test]
async fn test_partition_order_is_preserved() {
    let broker = InMemoryBroker::new();
    let infra = infrastructure(
        &broker,
        TransportSettings {
            max_concurrency: 2,
            poll_batch_size: 3,
            ..settings("billing")
        },
    );
    infra.provision().await.unwrap();

    let mut operations = TransportOperations::new();
    let mut expected = Vec::new();
    for i in 0..20 {
        let message = OutgoingMessage::builder("PlaceOrder")
            .message_id(format!("order-{i:02}"))
            .build();
        expected.push(message.message_id.clone());
        operations.push(TransportOperation::send(message, LogicalAddress::new("billing")));
    }
    let outcome = infra
        .dispatcher()
        .await
        .unwrap()
        .dispatch(operations, &TransportTransaction::new(), &ContextBag::new())
        .await
        .unwrap();
    assert_eq!(outcome.total_writes(), 20);

    let seen = Arc::new(Mutex::new(Vec::new()));
    infra
        .start_receiving(collecting_handler(Arc::clone(&seen)), None)
        .await
        .unwrap();
    wait_until(|| seen.lock().len() == 20).await;
    assert_eq!(*seen.lock(), expected);
    infra.stop_receiving().await.unwrap();
}

/// Тест проверяет парковку нечитаемой записи в топике ошибок; следующая
/// корректная запись доставляется как обычно.
#[tokio::test]
async fn test_poison_record_is_parked() {
    let broker = InMemoryBroker::new();
    let infra = infrastructure(&broker, settings("billing"));
    infra.provision().await.unwrap();

    broker
        .produce("billing", None, Bytes::from_static(b"not an envelope"))
        .await
        .unwrap();
    infra
        .dispatcher()
        .await
        .unwrap()
        .dispatch(
            send("PlaceOrder", "billing"),
            &TransportTransaction::new(),
            &ContextBag::new(),
        )
        .await
        .unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    infra
        .start_receiving(collecting_handler(Arc::clone(&seen)), None)
        .await
        .unwrap();
    wait_until(|| seen.lock().len() == 1).await;

    let parked = broker.records("error");
    assert_eq!(parked.len(), 1);
    let envelope = codec().decode(&parked[0].payload).unwrap();
    assert_eq!(&envelope.body[..], b"not an envelope");
    assert_eq!(envelope.headers[header::FAILED_QUEUE], "billing");
    assert!(envelope.headers.contains_key(header::EXCEPTION_MESSAGE));

    let stats = infra.pump().stats();
    assert_eq!(stats.parked, 1);
    assert_eq!(stats.delivered, 1);
    assert_eq!(broker.committed_offset("billing", "billing", 0), Some(2));
    infra.stop_receiving().await.unwrap();
}

/// Тест проверяет, что сообщение с истёкшим TTL подтверждается без вызова
/// обработчика.
#[tokio::test]
async fn test_expired_message_is_discarded() {
    let broker = InMemoryBroker::new();
    let infra = infrastructure(&broker, settings("billing"));
    infra.provision().await.unwrap();
    let dispatcher = infra.dispatcher().await.unwrap();

    let stale = OutgoingMessage::builder("PlaceOrder")
        .message_id("stale")
        .time_to_be_received(Duration::from_millis(1))
        .build();
    let fresh = OutgoingMessage::builder("PlaceOrder")
        .message_id("fresh")
        .time_to_be_received(Duration::from_secs(60))
        .build();
    dispatcher
        .dispatch(
            TransportOperation::send(stale, LogicalAddress::new("billing")),
            &TransportTransaction::new(),
            &ContextBag::new(),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    dispatcher
        .dispatch(
            TransportOperation::send(fresh, LogicalAddress::new("billing")),
            &TransportTransaction::new(),
            &ContextBag::new(),
        )
        .await
        .unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    infra
        .start_receiving(collecting_handler(Arc::clone(&seen)), None)
        .await
        .unwrap();
    wait_until(|| seen.lock().len() == 1).await;
    assert_eq!(*seen.lock(), vec!["fresh".to_string()]);
    assert_eq!(infra.pump().stats().discarded, 1);
    infra.stop_receiving().await.unwrap();
}

/// Тест проверяет, что постоянные сбои чтения переводят насос в `Faulted`,
/// а затем в `Stopped` с сохранённой причиной.
#[tokio::test]
async fn test_connectivity_loss_faults_the_pump() {
    let broker = InMemoryBroker::new();
    let infra = infrastructure(
        &broker,
        TransportSettings {
            max_poll_failures: 3,
            ..settings("billing")
        },
    );
    let seen = Arc::new(Mutex::new(Vec::new()));
    infra
        .start_receiving(collecting_handler(seen), None)
        .await
        .unwrap();

    let pump = infra.pump();
    let mut states = pump.watch_state();
    broker.fail_next_polls(u32::MAX);
    timeout(
        Duration::from_secs(5),
        states.wait_for(|s| *s == PumpState::Stopped),
    )
    .await
    .unwrap()
    .unwrap();
    assert!(matches!(
        pump.last_error(),
        Some(PumpError::Faulted { failures: 3, .. })
    ));
    assert_eq!(broker.member_count("billing"), 0);
    broker.fail_next_polls(0);

    // После сбоя насос можно запустить снова.
    infra
        .start_receiving(collecting_handler(Arc::new(Mutex::new(Vec::new()))), None)
        .await
        .unwrap();
    assert_eq!(pump.state(), PumpState::Running);
    assert!(pump.last_error().is_none());
    infra.stop_receiving().await.unwrap();
}

/// Тест проверяет таймаут остановки: обработчик не прерывается, повторный
/// вызов `stop` дожидается его завершения.
#[tokio::test]
async fn test_stop_timeout_keeps_waiting() {
    let broker = InMemoryBroker::new();
    let infra = infrastructure(
        &broker,
        TransportSettings {
            stop_timeout_ms: 50,
            ..settings("billing")
        },
    );
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let (entered_tx, release_rx) = (Arc::clone(&entered), Arc::clone(&release));

    infra
        .start_receiving(
            Arc::new(handler_fn(move |_msg| {
                let entered = Arc::clone(&entered_tx);
                let release = Arc::clone(&release_rx);
                async move {
                    entered.notify_one();
                    release.notified().await;
                    Ok(())
                }
            })),
            None,
        )
        .await
        .unwrap();
    infra
        .dispatcher()
        .await
        .unwrap()
        .dispatch(
            send("PlaceOrder", "billing"),
            &TransportTransaction::new(),
            &ContextBag::new(),
        )
        .await
        .unwrap();
    timeout(Duration::from_secs(5), entered.notified())
        .await
        .unwrap();

    let err = infra.stop_receiving().await.unwrap_err();
    assert_eq!(err.status_code(), StatusCode::StopTimeout);
    let pump = infra.pump();
    assert_eq!(pump.state(), PumpState::Stopping);

    release.notify_one();
    timeout(Duration::from_secs(5), async {
        while infra.stop_receiving().await.is_err() {}
    })
    .await
    .unwrap();
    assert_eq!(pump.state(), PumpState::Stopped);
    assert_eq!(pump.stats().delivered, 1);
}

/// Тест проверяет, что после начала остановки новые записи не доставляются:
/// вторая запись из той же пачки остаётся неподтверждённой.
#[tokio::test]
async fn test_no_delivery_after_stopping_begins() {
    let broker = InMemoryBroker::new();
    let infra = infrastructure(
        &broker,
        TransportSettings {
            stop_timeout_ms: 50,
            ..settings("billing")
        },
    );
    infra.provision().await.unwrap();

    let dispatcher = infra.dispatcher().await.unwrap();
    for id in ["first", "second"] {
        dispatcher
            .dispatch(
                TransportOperation::send(
                    OutgoingMessage::builder("PlaceOrder").message_id(id).build(),
                    LogicalAddress::new("billing"),
                ),
                &TransportTransaction::new(),
                &ContextBag::new(),
            )
            .await
            .unwrap();
    }

    let seen = Arc::new(Mutex::new(Vec::new()));
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let (sink, entered_tx, release_rx) = (
        Arc::clone(&seen),
        Arc::clone(&entered),
        Arc::clone(&release),
    );
    infra
        .start_receiving(
            Arc::new(handler_fn(move |msg: IncomingMessage| {
                let sink = Arc::clone(&sink);
                let entered = Arc::clone(&entered_tx);
                let release = Arc::clone(&release_rx);
                async move {
                    sink.lock()
                        .push(msg.message_id().unwrap_or_default().to_string());
                    entered.notify_one();
                    release.notified().await;
                    Ok(())
                }
            })),
            None,
        )
        .await
        .unwrap();
    timeout(Duration::from_secs(5), entered.notified())
        .await
        .unwrap();

    // Первая запись ещё в обработчике, насос уже останавливается.
    let err = infra.stop_receiving().await.unwrap_err();
    assert_eq!(err.status_code(), StatusCode::StopTimeout);
    release.notify_one();
    timeout(Duration::from_secs(5), async {
        while infra.stop_receiving().await.is_err() {}
    })
    .await
    .unwrap();

    let pump = infra.pump();
    assert_eq!(pump.state(), PumpState::Stopped);
    assert_eq!(*seen.lock(), vec!["first".to_string()]);
    assert_eq!(pump.stats().delivered, 1);
    assert_eq!(broker.committed_offset("billing", "billing", 0), Some(1));
    assert_eq!(broker.records("billing").len(), 2);
}

/// Тест проверяет частичный сбой публикации: уже записанное остаётся,
/// ошибка перечисляет доставленные и недоставленные топики.
#[tokio::test]
async fn test_partial_fanout_is_reported() {
    let broker = InMemoryBroker::new();
    let store = Arc::new(InMemorySubscriptionStore::new());
    let publisher = infrastructure_with_store(&broker, settings("publisher"), store.clone());
    let audit = infrastructure_with_store(&broker, settings("audit"), store.clone());
    let shipping = infrastructure_with_store(&broker, settings("shipping"), store);

    audit
        .subscription_manager()
        .await
        .unwrap()
        .subscribe("OrderEvent", &ContextBag::new())
        .await
        .unwrap();
    shipping
        .subscription_manager()
        .await
        .unwrap()
        .subscribe("OrderPlaced", &ContextBag::new())
        .await
        .unwrap();
    let (placed, event) = (
        type_topic("OrderPlaced").unwrap(),
        type_topic("OrderEvent").unwrap(),
    );
    broker.set_topic_unavailable(&placed, true);

    let err = publisher
        .dispatcher()
        .await
        .unwrap()
        .dispatch(
            TransportOperation::publish(OutgoingMessage::builder("OrderPlaced").build()),
            &TransportTransaction::new(),
            &ContextBag::new(),
        )
        .await
        .unwrap_err();
    match err {
        DispatchError::PartialFanout {
            delivered, failed, ..
        } => {
            assert_eq!(delivered, vec![event.clone()]);
            assert_eq!(failed.len(), 1);
            assert_eq!(failed[0].0, placed);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(broker.records(&event).len(), 1);
    assert!(broker.records(&placed).is_empty());
}

/// Тест проверяет, что публикация незарегистрированного типа отклоняется до
/// записи, а отправка по некорректному адресу не доходит до брокера.
#[tokio::test]
async fn test_dispatch_rejects_invalid_input() {
    let broker = InMemoryBroker::new();
    let infra = infrastructure(&broker, settings("billing"));
    let dispatcher = infra.dispatcher().await.unwrap();

    let err = dispatcher
        .dispatch(
            TransportOperation::publish(OutgoingMessage::builder("Unknown").build()),
            &TransportTransaction::new(),
            &ContextBag::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::UnknownMessageType(_)));

    let err = dispatcher
        .dispatch(
            send("PlaceOrder", "bad topic"),
            &TransportTransaction::new(),
            &ContextBag::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::InvalidAddress(_)));
    assert!(broker.topic_names().is_empty());
}

/// Тест проверяет идемпотентность создания топиков.
#[tokio::test]
async fn test_ensure_topics_twice() {
    let broker = InMemoryBroker::new();
    let provisioner = TopicProvisioner::new(Arc::new(broker.clone()), 3, 1);
    provisioner.ensure_topics(&["orders"]).await.unwrap();

    // Второй экземпляр не знает о первом и опирается на брокера.
    let other = TopicProvisioner::new(Arc::new(broker.clone()), 3, 1);
    other.ensure_topics(&["orders"]).await.unwrap();
    other.ensure_topics(&["orders"]).await.unwrap();

    assert_eq!(broker.topic_names(), vec!["orders".to_string()]);
    assert_eq!(broker.partition_count("orders"), Some(3));
}
