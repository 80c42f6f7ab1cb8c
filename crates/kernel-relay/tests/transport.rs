//! Integration tests for the kernel transport.
//!
//! These tests run a scripted fake kernel behind a local WebSocket server
//! and drive it through `KernelClient`.

use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use jupyter_wire::{Channel, KernelMessage, WireFrame};
use kernel_relay::cell::Cell;
use kernel_relay::comm::{CommError, CommEvent, CommManager};
use kernel_relay::{
    ConnectionState, ExecuteOptions, KernelClient, KernelConnectionConfig, KernelError,
    KernelEvent, KernelEvents, KernelHandle, ReconnectPolicy,
};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use url::Url;

const WAIT: Duration = Duration::from_secs(5);
const COMM_BUFFER: &[u8] = b"\0\xffraw";

struct FakeKernel {
    url: Url,
    /// Every message the kernel received, in order.
    received: mpsc::UnboundedReceiver<KernelMessage>,
    /// `Authorization` header of each accepted connection.
    auth: mpsc::UnboundedReceiver<Option<String>>,
}

impl FakeKernel {
    async fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (received_tx, received) = mpsc::unbounded_channel();
        let (auth_tx, auth) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve_connection(stream, received_tx.clone(), auth_tx.clone()));
            }
        });

        Self {
            url: Url::parse(&format!(
                "ws://127.0.0.1:{}/api/kernels/fake/channels?session_id=test",
                port
            ))
            .unwrap(),
            received,
            auth,
        }
    }

    /// Wait for a received message of `msg_type`.
    async fn expect(&mut self, msg_type: &str) -> KernelMessage {
        tokio::time::timeout(WAIT, async {
            loop {
                let msg = self.received.recv().await.expect("fake kernel stopped");
                if msg.msg_type() == msg_type {
                    return msg;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("kernel never received {}", msg_type))
    }
}

fn reply_to(req: &KernelMessage, channel: Channel, msg_type: &str, content: Value) -> KernelMessage {
    KernelMessage::new("fake-kernel", "kernel", channel, msg_type, content).with_parent(&req.header)
}

fn status(req: &KernelMessage, state: &str) -> KernelMessage {
    reply_to(req, Channel::IOPub, "status", json!({ "execution_state": state }))
}

fn stream(req: &KernelMessage, text: &str) -> KernelMessage {
    reply_to(req, Channel::IOPub, "stream", json!({ "name": "stdout", "text": text }))
}

fn execute_reply(req: &KernelMessage) -> KernelMessage {
    reply_to(
        req,
        Channel::Shell,
        "execute_reply",
        json!({ "status": "ok", "execution_count": 1, "user_expressions": {} }),
    )
}

/// Scripted kernel state for one connection.
#[derive(Default)]
struct Script {
    waiting_for_input: Option<KernelMessage>,
}

impl Script {
    /// Messages to send back, or `None` to drop the connection.
    fn respond(&mut self, req: &KernelMessage) -> Option<Vec<KernelMessage>> {
        let out = match req.msg_type() {
            "kernel_info_request" => vec![reply_to(
                req,
                Channel::Shell,
                "kernel_info_reply",
                json!({
                    "status": "ok",
                    "protocol_version": "5.3",
                    "implementation": "fake",
                    "language_info": { "name": "python" }
                }),
            )],
            "complete_request" => vec![reply_to(
                req,
                Channel::Shell,
                "complete_reply",
                json!({ "status": "ok", "matches": ["print"], "cursor_start": 0, "cursor_end": 2, "metadata": {} }),
            )],
            "inspect_request" => vec![reply_to(
                req,
                Channel::Shell,
                "inspect_reply",
                json!({
                    "status": "ok",
                    "found": true,
                    "data": { "text/plain": format!("{} docs", req.content["code"].as_str().unwrap()) },
                    "metadata": {}
                }),
            )],
            "is_complete_request" => {
                let code = req.content["code"].as_str().unwrap_or_default();
                let content = if code.trim_end().ends_with(':') {
                    json!({ "status": "incomplete", "indent": "    " })
                } else {
                    json!({ "status": "complete" })
                };
                vec![reply_to(req, Channel::Shell, "is_complete_reply", content)]
            }
            // Greet client-opened comms with a message carrying a binary buffer.
            "comm_open" => vec![KernelMessage::new(
                "fake-kernel",
                "kernel",
                Channel::IOPub,
                "comm_msg",
                json!({
                    "comm_id": req.content["comm_id"],
                    "data": { "opened": req.content["target_name"] }
                }),
            )
            .with_buffers(vec![Bytes::from_static(COMM_BUFFER)])],
            "execute_request" => {
                let code = req.content["code"].as_str().unwrap_or_default().to_string();
                self.execute(req, &code)?
            }
            "input_reply" => match self.waiting_for_input.take() {
                Some(exec) => vec![
                    stream(&exec, &format!("Hello, {}\n", req.content["value"].as_str().unwrap())),
                    execute_reply(&exec),
                    status(&exec, "idle"),
                ],
                None => vec![],
            },
            "comm_msg" => vec![KernelMessage::new(
                "fake-kernel",
                "kernel",
                Channel::IOPub,
                "comm_msg",
                json!({ "comm_id": req.content["comm_id"], "data": { "echo": req.content["data"] } }),
            )],
            // history_request and anything else goes unanswered
            _ => vec![],
        };
        Some(out)
    }

    fn execute(&mut self, req: &KernelMessage, code: &str) -> Option<Vec<KernelMessage>> {
        let out = match code {
            "crash" => return None,
            "input" => {
                self.waiting_for_input = Some(req.clone());
                vec![
                    status(req, "busy"),
                    reply_to(
                        req,
                        Channel::Stdin,
                        "input_request",
                        json!({ "prompt": "Name: ", "password": false }),
                    ),
                ]
            }
            "open_comm" => vec![
                status(req, "busy"),
                reply_to(
                    req,
                    Channel::IOPub,
                    "comm_open",
                    json!({ "comm_id": "c-1", "target_name": "echo", "data": { "state": { "value": 1 } } }),
                ),
                reply_to(
                    req,
                    Channel::IOPub,
                    "comm_msg",
                    json!({ "comm_id": "c-1", "data": { "method": "update", "state": { "value": 2 } } }),
                ),
                execute_reply(req),
                status(req, "idle"),
            ],
            "open_and_close" => vec![
                status(req, "busy"),
                reply_to(
                    req,
                    Channel::IOPub,
                    "comm_open",
                    json!({ "comm_id": "c-2", "target_name": "echo", "data": {} }),
                ),
                reply_to(
                    req,
                    Channel::IOPub,
                    "comm_close",
                    json!({ "comm_id": "c-2", "data": {} }),
                ),
                execute_reply(req),
                status(req, "idle"),
            ],
            "open_unknown" => vec![
                status(req, "busy"),
                reply_to(
                    req,
                    Channel::IOPub,
                    "comm_open",
                    json!({ "comm_id": "c-unknown", "target_name": "nobody", "data": {} }),
                ),
                execute_reply(req),
                status(req, "idle"),
            ],
            "orphan" => {
                let stranger = KernelMessage::new("other", "", Channel::Shell, "execute_request", json!({}));
                vec![
                    status(req, "busy"),
                    reply_to(
                        &stranger,
                        Channel::IOPub,
                        "display_data",
                        json!({ "data": { "text/plain": "stray" }, "metadata": {} }),
                    ),
                    execute_reply(req),
                    status(req, "idle"),
                ]
            }
            _ => vec![
                status(req, "busy"),
                reply_to(req, Channel::IOPub, "execute_input", json!({ "code": code, "execution_count": 1 })),
                stream(req, "hello\n"),
                reply_to(
                    req,
                    Channel::IOPub,
                    "execute_result",
                    json!({ "execution_count": 1, "data": { "text/plain": "42" }, "metadata": {} }),
                ),
                execute_reply(req),
                // Output after the reply still belongs to the request.
                stream(req, "late\n"),
                status(req, "idle"),
            ],
        };
        Some(out)
    }
}

async fn serve_connection(
    stream: TcpStream,
    received: mpsc::UnboundedSender<KernelMessage>,
    auth: mpsc::UnboundedSender<Option<String>>,
) {
    let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        let header = req
            .headers()
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let _ = auth.send(header);
        Ok(resp)
    };
    let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
        return;
    };
    let (mut sink, mut source) = ws.split();
    let mut script = Script::default();

    while let Some(Ok(incoming)) = source.next().await {
        let frame = match incoming {
            Message::Text(text) => WireFrame::Text(text),
            Message::Binary(data) => WireFrame::Binary(data),
            Message::Close(_) => break,
            _ => continue,
        };
        let req = frame.decode().unwrap();
        let _ = received.send(req.clone());

        let Some(responses) = script.respond(&req) else {
            // Drop the socket without a close handshake.
            return;
        };
        for msg in responses {
            let out = match WireFrame::encode(&msg).unwrap() {
                WireFrame::Text(text) => Message::Text(text),
                WireFrame::Binary(data) => Message::Binary(data),
            };
            if sink.send(out).await.is_err() {
                return;
            }
        }
    }
}

async fn connect(config: KernelConnectionConfig) -> (KernelHandle, KernelEvents) {
    let (handle, events) = KernelClient::connect(config);
    handle.wait_connected(WAIT).await.unwrap();
    (handle, events)
}

async fn wait_for_event(
    events: &mut KernelEvents,
    pred: impl Fn(&KernelEvent) -> bool,
) -> KernelEvent {
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Some(event) if pred(&event) => return event,
                Some(_) => continue,
                None => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

#[tokio::test]
async fn test_execute_collects_outputs_and_reply() {
    let mut kernel = FakeKernel::spawn().await;
    let mut config = KernelConnectionConfig::new(kernel.url.clone());
    config.token = Some("secret".to_string());
    let (handle, _events) = connect(config).await;

    assert_eq!(
        kernel.auth.recv().await.unwrap().as_deref(),
        Some("token secret")
    );

    let execution = handle.execute("1 + 1", ExecuteOptions::default()).unwrap();
    let msg_id = execution.msg_id().to_string();
    let outcome = tokio::time::timeout(WAIT, execution.collect())
        .await
        .unwrap()
        .unwrap();

    let types: Vec<_> = outcome.outputs.iter().map(|m| m.msg_type()).collect();
    assert_eq!(
        types,
        vec!["status", "execute_input", "stream", "execute_result", "stream", "status"]
    );
    assert!(outcome
        .outputs
        .iter()
        .all(|m| m.parent_msg_id() == Some(msg_id.as_str())));
    assert_eq!(outcome.outputs[4].content["text"], "late\n");
    assert_eq!(outcome.reply.msg_type(), "execute_reply");
    assert_eq!(outcome.reply.content["execution_count"], 1);

    let request = kernel.expect("execute_request").await;
    assert_eq!(request.msg_id(), msg_id);
    assert_eq!(request.header.session, handle.session_id());
    assert_eq!(request.content["store_history"], true);

    handle.close().unwrap();
}

#[tokio::test]
async fn test_shell_requests() {
    let kernel = FakeKernel::spawn().await;
    let (handle, _events) = connect(KernelConnectionConfig::new(kernel.url.clone())).await;

    let info = handle.kernel_info().await.unwrap();
    assert_eq!(info.msg_type(), "kernel_info_reply");
    assert_eq!(info.content["implementation"], "fake");

    let completion = handle.complete("pr", 2).await.unwrap();
    assert_eq!(completion.content["matches"], json!(["print"]));

    handle.close().unwrap();
}

#[tokio::test]
async fn test_inspect_and_is_complete() {
    let mut kernel = FakeKernel::spawn().await;
    let (handle, _events) = connect(KernelConnectionConfig::new(kernel.url.clone())).await;

    let inspection = handle.inspect("len", 3, 1).await.unwrap();
    assert_eq!(inspection.msg_type(), "inspect_reply");
    assert_eq!(inspection.content["found"], true);
    assert_eq!(inspection.content["data"]["text/plain"], "len docs");

    let request = kernel.expect("inspect_request").await;
    assert_eq!(request.content["cursor_pos"], 3);
    assert_eq!(request.content["detail_level"], 1);

    let open_block = handle.is_complete("for i in range(3):").await.unwrap();
    assert_eq!(open_block.content["status"], "incomplete");
    assert_eq!(open_block.content["indent"], "    ");

    let statement = handle.is_complete("x = 1").await.unwrap();
    assert_eq!(statement.content["status"], "complete");

    handle.close().unwrap();
}

#[tokio::test]
async fn test_unanswered_request_times_out() {
    let mut kernel = FakeKernel::spawn().await;
    let config = KernelConnectionConfig::new(kernel.url.clone())
        .with_request_timeout(Duration::from_millis(200));
    let (handle, _events) = connect(config).await;

    let err = handle.history_tail(5).await.unwrap_err();
    assert!(matches!(err, KernelError::Timeout(_)));

    let request = kernel.expect("history_request").await;
    assert_eq!(request.content["hist_access_type"], "tail");
    assert_eq!(request.content["n"], 5);

    handle.close().unwrap();
}

#[tokio::test]
async fn test_input_request_round_trip() {
    let kernel = FakeKernel::spawn().await;
    let (handle, _events) = connect(KernelConnectionConfig::new(kernel.url.clone())).await;

    let mut execution = handle.execute("input", ExecuteOptions::default()).unwrap();
    let ask = tokio::time::timeout(WAIT, execution.next_input_request())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ask.content["prompt"], "Name: ");
    execution.input_reply("Ada").unwrap();

    let outcome = tokio::time::timeout(WAIT, execution.collect())
        .await
        .unwrap()
        .unwrap();
    assert!(outcome
        .outputs
        .iter()
        .any(|m| m.msg_type() == "stream" && m.content["text"] == "Hello, Ada\n"));
    assert_eq!(outcome.reply.content["status"], "ok");

    handle.close().unwrap();
}

#[tokio::test]
async fn test_cell_run_fills_outputs() {
    let kernel = FakeKernel::spawn().await;
    let (handle, _events) = connect(KernelConnectionConfig::new(kernel.url.clone())).await;

    let mut cell = Cell::code("6 * 7");
    tokio::time::timeout(WAIT, cell.run(&handle))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(cell.execution_count, Some(1));
    assert_eq!(cell.input_prompt(), "In [1]:");
    assert!(!cell.is_running());
    assert_eq!(cell.outputs.len(), 3);

    let nb = cell.to_nbformat();
    assert_eq!(nb["outputs"][1]["output_type"], "execute_result");
    assert_eq!(nb["outputs"][2]["text"], "late\n");

    handle.close().unwrap();
}

#[tokio::test]
async fn test_cancelled_cell_run_is_not_left_running() {
    let kernel = FakeKernel::spawn().await;
    let (handle, _events) = connect(KernelConnectionConfig::new(kernel.url.clone())).await;

    // The kernel waits for input that never comes, so the run never ends.
    let mut cell = Cell::code("input");
    let cancelled = tokio::time::timeout(Duration::from_millis(200), cell.run(&handle)).await;
    assert!(cancelled.is_err());

    assert!(!cell.is_running());
    assert_eq!(cell.input_prompt(), "In [ ]:");

    handle.close().unwrap();
}

#[tokio::test]
async fn test_unsolicited_message_is_published() {
    let kernel = FakeKernel::spawn().await;
    let (handle, mut events) = connect(KernelConnectionConfig::new(kernel.url.clone())).await;

    let execution = handle.execute("orphan", ExecuteOptions::default()).unwrap();
    let event = wait_for_event(&mut events, |e| matches!(e, KernelEvent::Unsolicited(_))).await;
    match event {
        KernelEvent::Unsolicited(msg) => {
            assert_eq!(msg.msg_type(), "display_data");
            assert_eq!(msg.content["data"]["text/plain"], "stray");
        }
        other => panic!("unexpected event: {:?}", other),
    }

    let outcome = execution.collect().await.unwrap();
    assert!(outcome.outputs.iter().all(|m| m.msg_type() != "display_data"));

    handle.close().unwrap();
}

#[tokio::test]
async fn test_kernel_opened_comm() {
    let kernel = FakeKernel::spawn().await;
    let (handle, _events) = connect(KernelConnectionConfig::new(kernel.url.clone())).await;
    let comms = CommManager::start(handle.clone()).unwrap();
    let mut targets = comms.register_target("echo").await;

    let execution = handle.execute("open_comm", ExecuteOptions::default()).unwrap();
    execution.collect().await.unwrap();

    let mut comm = tokio::time::timeout(WAIT, targets.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(comm.comm_id(), "c-1");
    assert_eq!(comm.target_name(), "echo");

    match comm.recv().await.unwrap() {
        CommEvent::Message { data, .. } => assert_eq!(data["state"]["value"], 2),
        other => panic!("unexpected event: {:?}", other),
    }
    let snapshots = comms.snapshots().await;
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].state["value"], 2);

    comm.send(json!({ "ping": 1 })).await.unwrap();
    match tokio::time::timeout(WAIT, comm.recv()).await.unwrap().unwrap() {
        CommEvent::Message { data, .. } => assert_eq!(data["echo"]["ping"], 1),
        other => panic!("unexpected event: {:?}", other),
    }

    comm.close(json!({})).await.unwrap();
    assert!(comms.snapshots().await.is_empty());

    handle.close().unwrap();
}

#[tokio::test]
async fn test_client_opened_comm_receives_binary_buffers() {
    let mut kernel = FakeKernel::spawn().await;
    let (handle, _events) = connect(KernelConnectionConfig::new(kernel.url.clone())).await;
    let comms = CommManager::start(handle.clone()).unwrap();

    let mut comm = comms
        .open("echo.client", json!({ "state": { "value": 7 } }))
        .await
        .unwrap();
    assert_eq!(comm.target_name(), "echo.client");

    let open = kernel.expect("comm_open").await;
    assert_eq!(open.content["comm_id"], comm.comm_id());
    assert_eq!(open.content["target_name"], "echo.client");
    assert_eq!(open.content["data"]["state"]["value"], 7);

    match tokio::time::timeout(WAIT, comm.recv()).await.unwrap().unwrap() {
        CommEvent::Message { data, buffers } => {
            assert_eq!(data["opened"], "echo.client");
            assert_eq!(buffers.len(), 1);
            assert_eq!(buffers[0].as_ref(), COMM_BUFFER);
        }
        other => panic!("unexpected event: {:?}", other),
    }

    let snapshots = comms.snapshots().await;
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].comm_id, comm.comm_id());
    assert_eq!(snapshots[0].state["value"], 7);

    handle.close().unwrap();
}

#[tokio::test]
async fn test_send_fails_on_comm_closed_by_kernel() {
    let kernel = FakeKernel::spawn().await;
    let (handle, _events) = connect(KernelConnectionConfig::new(kernel.url.clone())).await;
    let comms = CommManager::start(handle.clone()).unwrap();
    let mut targets = comms.register_target("echo").await;

    handle
        .execute("open_and_close", ExecuteOptions::default())
        .unwrap()
        .collect()
        .await
        .unwrap();
    let comm = tokio::time::timeout(WAIT, targets.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(comm.comm_id(), "c-2");

    tokio::time::timeout(WAIT, async {
        while !comms.snapshots().await.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("comm was never closed");

    // recv() was never called, so only the table knows about the close.
    match comm.send(json!({ "ping": 1 })).await {
        Err(CommError::Closed(comm_id)) => assert_eq!(comm_id, "c-2"),
        other => panic!("unexpected result: {:?}", other),
    }

    handle.close().unwrap();
}

#[tokio::test]
async fn test_unknown_comm_target_is_closed() {
    let mut kernel = FakeKernel::spawn().await;
    let (handle, _events) = connect(KernelConnectionConfig::new(kernel.url.clone())).await;
    let _comms = CommManager::start(handle.clone()).unwrap();

    handle
        .execute("open_unknown", ExecuteOptions::default())
        .unwrap()
        .collect()
        .await
        .unwrap();

    let close = kernel.expect("comm_close").await;
    assert_eq!(close.content["comm_id"], "c-unknown");

    handle.close().unwrap();
}

#[tokio::test]
async fn test_lost_connection_abandons_and_reconnects() {
    let kernel = FakeKernel::spawn().await;
    let config = KernelConnectionConfig::new(kernel.url.clone())
        .with_policy(ReconnectPolicy::new(Duration::from_millis(50), 3));
    let (handle, mut events) = connect(config).await;

    let mut execution = handle.execute("crash", ExecuteOptions::default()).unwrap();
    let err = tokio::time::timeout(WAIT, execution.reply())
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, KernelError::Abandoned(_)));
    assert!(execution.next_output().await.is_none());

    wait_for_event(&mut events, |e| {
        matches!(e, KernelEvent::Reconnecting { attempt: 1, .. })
    })
    .await;
    handle.wait_connected(WAIT).await.unwrap();

    let info = handle.kernel_info().await.unwrap();
    assert_eq!(info.msg_type(), "kernel_info_reply");

    handle.close().unwrap();
}

#[tokio::test]
async fn test_retries_are_capped_and_dead_fires_once() {
    // Bind and release a port so nothing is listening on it.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let url = Url::parse(&format!("ws://127.0.0.1:{}/api/kernels/k/channels", port)).unwrap();
    let config = KernelConnectionConfig::new(url)
        .with_policy(ReconnectPolicy::new(Duration::from_millis(10), 2));
    let (handle, mut events) = KernelClient::connect(config);

    let mut failures = 0;
    let mut retries = 0;
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await.unwrap() {
                KernelEvent::ConnectionFailed { .. } => failures += 1,
                KernelEvent::Reconnecting { .. } => retries += 1,
                KernelEvent::ConnectionDead => break,
                _ => {}
            }
        }
    })
    .await
    .expect("connection never declared dead");

    assert_eq!(failures, 3);
    assert_eq!(retries, 2);
    assert_eq!(handle.state(), ConnectionState::Dead);

    // Nothing else happens until an explicit reconnect.
    let quiet = tokio::time::timeout(Duration::from_millis(300), async {
        loop {
            if let Some(KernelEvent::ConnectionDead) = events.recv().await {
                return;
            }
        }
    })
    .await;
    assert!(quiet.is_err(), "dead event fired twice");

    let err = handle
        .send(Channel::Shell, "kernel_info_request", json!({}), Default::default())
        .unwrap_err();
    assert!(matches!(err, KernelError::NotConnected(_)));

    handle.reconnect().unwrap();
    wait_for_event(&mut events, |e| matches!(e, KernelEvent::ConnectionDead)).await;

    handle.close().unwrap();
    wait_for_event(&mut events, |e| {
        matches!(e, KernelEvent::State(ConnectionState::Disconnected))
    })
    .await;
    assert_eq!(handle.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_close_stops_the_transport() {
    let kernel = FakeKernel::spawn().await;
    let (handle, mut events) = connect(KernelConnectionConfig::new(kernel.url.clone())).await;

    handle.close().unwrap();
    wait_for_event(&mut events, |e| {
        matches!(
            e,
            KernelEvent::State(ConnectionState::Disconnected)
        )
    })
    .await;

    match handle.execute("1", ExecuteOptions::default()) {
        Err(KernelError::NotConnected(_)) => {}
        Err(other) => panic!("unexpected error: {:?}", other),
        Ok(_) => panic!("execute succeeded on a closed connection"),
    }
}
