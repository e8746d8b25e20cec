use serde_json::{json, Value};
use synapse_desk::app::{Action, App};
use synapse_desk::config::Config;
use synapse_desk::controller::{DEFAULT_IMAGE_PROMPT, FAILURE_TEXT};
use synapse_desk::store::Role;
use tempfile::tempdir;
use tokio::sync::mpsc;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config_for(server: &MockServer) -> Config {
    Config {
        ollama_url: server.uri(),
        ..Config::default()
    }
}

async fn mount_reply(server: &MockServer, content: &str) {
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "model": "llama3.2-vision",
            "message": { "role": "assistant", "content": content },
            "done": true
        })))
        .mount(server)
        .await;
}

async fn chat_bodies(server: &MockServer) -> Vec<Value> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|r| r.url.path() == "/api/chat")
        .map(|r| serde_json::from_slice(&r.body).expect("request body is JSON"))
        .collect()
}

/// Runs one action and feeds back the single follow-up action it produces.
async fn round_trip(app: &mut App, rx: &mut mpsc::UnboundedReceiver<Action>, action: Action) {
    app.update(action);
    let follow_up = rx.recv().await.expect("follow-up action");
    app.update(follow_up);
}

#[tokio::test]
async fn test_text_turn_end_to_end() {
    let server = MockServer::start().await;
    mount_reply(&server, "hello").await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut app = App::new(tx, &config_for(&server)).unwrap();
    let id = app.controller.active_id().unwrap();

    round_trip(&mut app, &mut rx, Action::SendMessage("hi".into())).await;

    let messages = app.controller.store().get(id).unwrap().messages().to_vec();
    assert_eq!(messages.len(), 2);
    assert_eq!((messages[0].role, messages[0].content.as_str()), (Role::User, "hi"));
    assert_eq!(
        (messages[1].role, messages[1].content.as_str()),
        (Role::Assistant, "hello")
    );
    assert!(app.take_output().contains(&"assistant: hello".to_string()));

    let bodies = chat_bodies(&server).await;
    assert_eq!(bodies.len(), 1);
    assert_eq!(bodies[0]["model"], json!("llama3.2-vision"));
    assert_eq!(bodies[0]["stream"], json!(false));
    assert_eq!(bodies[0]["temperature"], json!(0.7));
    assert_eq!(bodies[0]["messages"], json!([{ "role": "user", "content": "hi" }]));
}

#[tokio::test]
async fn test_second_turn_sends_history() {
    let server = MockServer::start().await;
    mount_reply(&server, "ok").await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut app = App::new(tx, &config_for(&server)).unwrap();

    round_trip(&mut app, &mut rx, Action::SendMessage("first".into())).await;
    round_trip(&mut app, &mut rx, Action::SendMessage("second".into())).await;

    let bodies = chat_bodies(&server).await;
    assert_eq!(
        bodies[1]["messages"],
        json!([
            { "role": "user", "content": "first" },
            { "role": "assistant", "content": "ok" },
            { "role": "user", "content": "second" }
        ])
    );
}

#[tokio::test]
async fn test_image_turn_end_to_end() {
    let server = MockServer::start().await;
    mount_reply(&server, "a cat").await;

    let dir = tempdir().unwrap();
    let image_path = dir.path().join("cat.png");
    std::fs::write(&image_path, b"hello").unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut app = App::new(tx, &config_for(&server)).unwrap();
    let id = app.controller.active_id().unwrap();

    round_trip(&mut app, &mut rx, Action::SendMessage("earlier".into())).await;
    round_trip(&mut app, &mut rx, Action::AttachImage(image_path.clone())).await;
    assert!(app.controller.attachment().image().is_some());

    round_trip(&mut app, &mut rx, Action::SendMessage(String::new())).await;

    let bodies = chat_bodies(&server).await;
    assert_eq!(
        bodies[1]["messages"],
        json!([{
            "role": "user",
            "content": DEFAULT_IMAGE_PROMPT,
            "images": ["aGVsbG8="]
        }])
    );

    let messages = app.controller.store().get(id).unwrap().messages().to_vec();
    assert_eq!(messages.len(), 4);
    assert_eq!(
        messages[2].image.as_deref(),
        Some("data:image/png;base64,aGVsbG8=")
    );
    assert_eq!(messages[3].content, "a cat");
    assert!(app.controller.attachment().is_empty());
}

#[tokio::test]
async fn test_late_encode_failure_keeps_newer_image() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();
    let good = dir.path().join("good.png");
    std::fs::write(&good, b"hello").unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut app = App::new(tx, &config_for(&server)).unwrap();

    // First pick points at a file that does not exist; its failure arrives
    // only after the second pick has been encoded.
    app.update(Action::AttachImage(dir.path().join("missing.png")));
    let first_result = rx.recv().await.unwrap();
    round_trip(&mut app, &mut rx, Action::AttachImage(good.clone())).await;
    assert!(app.controller.attachment().image().is_some());
    app.take_output();

    assert!(matches!(first_result, Action::ImageEncoded(_, Err(_))));
    assert!(!app.update(first_result));

    assert_eq!(app.controller.attachment().path(), Some(good.as_path()));
    assert!(app.controller.attachment().image().is_some());
    assert!(app.take_output().is_empty());
}

#[tokio::test]
async fn test_encode_failure_of_current_image_is_reported() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut app = App::new(tx, &config_for(&server)).unwrap();
    round_trip(&mut app, &mut rx, Action::AttachImage(dir.path().join("missing.png"))).await;

    assert!(app.controller.attachment().is_empty());
    assert!(app.take_output().iter().any(|l| l.starts_with("error:")));
}

#[tokio::test]
async fn test_server_failure_becomes_fallback_message() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(ResponseTemplate::new(502).set_body_string("Bad Gateway"))
        .mount(&server)
        .await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut app = App::new(tx, &config_for(&server)).unwrap();
    let id = app.controller.active_id().unwrap();

    round_trip(&mut app, &mut rx, Action::SendMessage("hi".into())).await;

    let messages = app.controller.store().get(id).unwrap().messages().to_vec();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].content, FAILURE_TEXT);
    assert_eq!(app.controller.draft(), "");
}

#[tokio::test]
async fn test_reply_lands_in_origin_after_switching() {
    let server = MockServer::start().await;
    mount_reply(&server, "late answer").await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut app = App::new(tx, &config_for(&server)).unwrap();
    let first = app.controller.active_id().unwrap();

    app.update(Action::SendMessage("question".into()));
    app.update(Action::NewConversation);
    let second = app.controller.active_id().unwrap();
    assert_ne!(first, second);

    let completion = rx.recv().await.unwrap();
    app.update(completion);

    assert_eq!(app.controller.store().get(first).unwrap().messages().len(), 2);
    assert!(app.controller.store().get(second).unwrap().messages().is_empty());
    assert!(app
        .take_output()
        .iter()
        .any(|l| l.contains("new reply in")));
}

#[tokio::test]
async fn test_models_loaded_at_startup() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/tags"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "models": [{ "name": "llama3.2-vision:latest" }, { "model": "moondream" }]
        })))
        .mount(&server)
        .await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut app = App::new(tx, &config_for(&server)).unwrap();
    round_trip(&mut app, &mut rx, Action::LoadModels).await;

    assert_eq!(
        app.controller.model_choices(),
        vec!["llama3.2-vision:latest", "moondream"]
    );
}

#[tokio::test]
async fn test_model_discovery_failure_is_not_fatal() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/tags"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "tags": [] })))
        .mount(&server)
        .await;
    mount_reply(&server, "fine").await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut app = App::new(tx, &config_for(&server)).unwrap();
    round_trip(&mut app, &mut rx, Action::LoadModels).await;
    assert!(app.controller.catalog().is_empty());

    round_trip(&mut app, &mut rx, Action::SendMessage("still there?".into())).await;
    let id = app.controller.active_id().unwrap();
    assert_eq!(
        app.controller.store().get(id).unwrap().messages()[1].content,
        "fine"
    );
}

#[tokio::test]
async fn test_conversation_management_actions() {
    let server = MockServer::start().await;
    let (tx, _rx) = mpsc::unbounded_channel();
    let mut app = App::new(tx, &config_for(&server)).unwrap();
    let first = app.controller.active_id().unwrap();

    app.update(Action::RenameConversation(0, "   ".into()));
    assert_eq!(app.controller.store().get(first).unwrap().name(), "New Chat");
    app.update(Action::RenameConversation(0, "Trip Planning".into()));
    assert_eq!(app.controller.store().get(first).unwrap().name(), "Trip Planning");

    app.update(Action::SetTemperature(1.4));
    assert_eq!(app.controller.store().get(first).unwrap().temperature(), 0.7);
    assert!(app.take_output().iter().any(|l| l.starts_with("error:")));
    app.update(Action::SetTemperature(0.2));
    assert_eq!(app.controller.store().get(first).unwrap().temperature(), 0.2);

    app.update(Action::NewConversation);
    let second = app.controller.active_id().unwrap();
    app.update(Action::DeleteConversation(1));
    assert_eq!(app.controller.active_id(), Some(first));
    assert!(!app.controller.store().contains(second));

    app.update(Action::DeleteConversation(0));
    assert_eq!(app.controller.active_id(), None);
    app.take_output();
    app.update(Action::SendMessage("nobody home".into()));
    assert!(app
        .take_output()
        .iter()
        .any(|l| l.contains("no active conversation")));
    assert!(app.prompt().contains("no conversation"));
}
