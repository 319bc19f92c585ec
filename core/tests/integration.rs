//! End-to-end tests against the live mock server.
//!
//! # Design
//! Each test starts its own mock server on a random port with a fresh
//! `AppState`, so request logs never leak between tests. The client runs over
//! real sockets; the server-side log shows what actually reached the wire.

use std::sync::{Arc, Mutex};

use courier_core::header::{AUTHORIZATION, CONTENT_LENGTH};
use courier_core::{
    ApiError, Client, ClientConfig, Event, FormData, HeaderValue, Output, RequestOptions,
    ResponseBody, DEFAULT_FILE_NAME,
};
use mock_server::AppState;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

async fn start_server() -> (String, AppState) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let state = AppState::new();
    tokio::spawn(mock_server::run_with_state(listener, state.clone()));
    (format!("http://localhost:{port}"), state)
}

fn client() -> Client {
    Client::new(ClientConfig::default()).unwrap()
}

fn collector() -> (Arc<Mutex<Vec<Event>>>, impl Fn(Event) + Send + Sync + 'static) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = {
        let events = Arc::clone(&events);
        move |event: Event| events.lock().unwrap().push(event)
    };
    (events, sink)
}

fn read_total(events: &[Event]) -> u64 {
    events
        .iter()
        .filter_map(|e| match e {
            Event::Read(p) => Some(p.delta),
            _ => None,
        })
        .sum()
}

// --- plain requests ---

#[tokio::test]
async fn get_text_page() {
    let (base, _) = start_server().await;
    let body = client()
        .get(&format!("{base}/page1"), RequestOptions::new())
        .await
        .unwrap();
    assert_eq!(body, ResponseBody::Text("A page".to_string()));
}

#[tokio::test]
async fn get_json_page() {
    let (base, _) = start_server().await;
    let body = client()
        .get(&format!("{base}/json"), RequestOptions::new())
        .await
        .unwrap();
    assert_eq!(body.as_json(), Some(&json!({ "key": 12 })));
}

#[tokio::test]
async fn delete_with_empty_response() {
    let (base, state) = start_server().await;
    let body = client()
        .delete(&format!("{base}/delete"), RequestOptions::new())
        .await
        .unwrap();
    assert_eq!(body, ResponseBody::Text(String::new()));
    assert_eq!(state.requests_to("/delete").await[0].method, "DELETE");
}

#[tokio::test]
async fn default_headers_reach_the_server() {
    let (base, state) = start_server().await;
    client()
        .get(&format!("{base}/page1"), RequestOptions::new())
        .await
        .unwrap();
    let recorded = &state.requests_to("/page1").await[0];
    assert!(recorded.header("user-agent").unwrap().starts_with("courier/"));
    assert_eq!(recorded.header("connection"), Some("close"));
    assert!(recorded.header("host").unwrap().starts_with("localhost:"));
}

// --- redirects ---

#[tokio::test]
async fn follows_absolute_redirect() {
    let (base, _) = start_server().await;
    let body = client()
        .get(&format!("{base}/absolute_redirect"), RequestOptions::new())
        .await
        .unwrap();
    assert_eq!(body.as_text(), Some("A page"));
}

#[tokio::test]
async fn follows_relative_redirect() {
    let (base, _) = start_server().await;
    let body = client()
        .get(&format!("{base}/relative_redirect"), RequestOptions::new())
        .await
        .unwrap();
    assert_eq!(body.as_text(), Some("A page"));
}

#[tokio::test]
async fn follows_redirect_chain() {
    let (base, state) = start_server().await;
    let body = client()
        .get(&format!("{base}/chain/a"), RequestOptions::new())
        .await
        .unwrap();
    assert_eq!(body.as_text(), Some("end of chain"));
    let paths: Vec<String> = state.requests().await.into_iter().map(|r| r.path).collect();
    assert_eq!(paths, ["/chain/a", "/chain/b", "/chain/c"]);

    let direct = client()
        .get(&format!("{base}/chain/c"), RequestOptions::new())
        .await
        .unwrap();
    assert_eq!(body, direct);
}

#[tokio::test]
async fn redirect_loop_is_bounded() {
    let (base, state) = start_server().await;
    let config = ClientConfig {
        max_redirects: 3,
        ..ClientConfig::default()
    };
    let err = Client::new(config)
        .unwrap()
        .get(&format!("{base}/loop"), RequestOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::TooManyRedirects { limit: 3, .. }));
    assert_eq!(state.requests_to("/loop").await.len(), 4);
}

#[tokio::test]
async fn authorization_dropped_on_cross_host_redirect() {
    let (base, state) = start_server().await;
    let body = client()
        .get(
            &format!("{base}/cross_host"),
            RequestOptions::new().header(AUTHORIZATION, HeaderValue::from_static("token")),
        )
        .await
        .unwrap();
    assert_eq!(body.as_json(), Some(&json!({ "key": 12 })));

    let first = &state.requests_to("/cross_host").await[0];
    assert_eq!(first.header("authorization"), Some("token"));
    let second = &state.requests_to("/json").await[0];
    assert_eq!(second.header("authorization"), None);
    assert!(second.header("host").unwrap().starts_with("127.0.0.1:"));
}

#[tokio::test]
async fn authorization_kept_on_same_host_redirect() {
    let (base, state) = start_server().await;
    client()
        .get(
            &format!("{base}/relative_redirect"),
            RequestOptions::new().header(AUTHORIZATION, HeaderValue::from_static("token")),
        )
        .await
        .unwrap();
    let hop = &state.requests_to("/page1").await[0];
    assert_eq!(hop.header("authorization"), Some("token"));
}

#[tokio::test]
async fn redirect_without_location_is_an_error() {
    let (base, _) = start_server().await;
    let err = client()
        .get(&format!("{base}/no_location"), RequestOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(302));
    assert_eq!(err.to_string(), "moved somewhere");
}

// --- error responses ---

#[tokio::test]
async fn not_found_is_http_error() {
    let (base, _) = start_server().await;
    let err = client()
        .get(&format!("{base}/missing"), RequestOptions::new())
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(err.to_string(), "404: File Not Found");
}

#[tokio::test]
async fn json_error_message_is_extracted() {
    let (base, _) = start_server().await;
    let err = client()
        .get(&format!("{base}/error/422/bad%20input"), RequestOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(422));
    assert_eq!(err.to_string(), "bad input");
}

#[tokio::test]
async fn error_body_is_never_saved() {
    let (base, _) = start_server().await;
    let dir = tempfile::tempdir().unwrap();
    let err = client()
        .get(
            &format!("{base}/text_error"),
            RequestOptions::new().save_to(dir.path()),
        )
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(500));
    assert_eq!(err.to_string(), "server exploded");
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn connection_refused_is_transport_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let err = client()
        .get(&format!("http://127.0.0.1:{port}/"), RequestOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::Transport { .. }));
}

#[tokio::test]
async fn truncated_body_is_an_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 1024];
        let _ = socket.read(&mut buf).await.unwrap();
        socket
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\nonly a little")
            .await
            .unwrap();
    });

    let err = client()
        .get(&format!("http://127.0.0.1:{port}/"), RequestOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::Transport { .. }));
}

// --- uploads ---

#[tokio::test]
async fn multipart_upload_reaches_server() {
    let (base, state) = start_server().await;
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("app.zip");
    std::fs::write(&file, b"PK fake zip bytes").unwrap();

    let form = FormData::new()
        .field("field1", "hello")
        .field("meta", json!({ "x": 2 }))
        .file("file1", &file);
    let body = client()
        .post(&format!("{base}/upload"), RequestOptions::new().data(form))
        .await
        .unwrap();

    let receipt = body.as_json().unwrap();
    assert_eq!(receipt["method"], "POST");
    let upload = &state.uploads().await[0];
    assert_eq!(upload.field("field1"), Some("hello"));
    assert_eq!(upload.field("meta"), Some(r#"{"x":2}"#));
    assert_eq!(upload.files.len(), 1);
    assert_eq!(upload.files[0].field, "file1");
    assert_eq!(upload.files[0].file_name, "app.zip");
    assert_eq!(upload.files[0].size, 17);
    assert_eq!(
        upload.files[0].content_type.as_deref(),
        Some("application/octet-stream")
    );
}

#[tokio::test]
async fn post_and_put_forms() {
    let (base, state) = start_server().await;
    let client = client();
    let post = client
        .post(
            &format!("{base}/post"),
            RequestOptions::new().data(FormData::new().field("a", "1")),
        )
        .await
        .unwrap();
    assert_eq!(post.as_text(), Some("A post request"));

    let put = client
        .put(
            &format!("{base}/put"),
            RequestOptions::new().data(FormData::new().field("a", "2")),
        )
        .await
        .unwrap();
    assert_eq!(put.as_text(), Some("A put request"));

    let uploads = state.uploads().await;
    assert_eq!(uploads.len(), 2);
    assert_eq!(uploads[1].method, "PUT");
    assert_eq!(uploads[1].field("a"), Some("2"));
}

#[tokio::test]
async fn upload_progress_adds_up_to_content_length() {
    let (base, state) = start_server().await;
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("big.bin");
    std::fs::write(&file, vec![7u8; 200 * 1024]).unwrap();

    let (events, sink) = collector();
    client()
        .post(
            &format!("{base}/upload"),
            RequestOptions::new()
                .data(FormData::new().field("name", "big").file("file", &file))
                .events(sink),
        )
        .await
        .unwrap();

    let declared: u64 = state.requests_to("/upload").await[0]
        .header(CONTENT_LENGTH.as_str())
        .unwrap()
        .parse()
        .unwrap();
    let events = events.lock().unwrap();
    let writes: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            Event::Write(p) => Some(*p),
            _ => None,
        })
        .collect();
    assert!(writes.len() > 4);
    assert_eq!(writes.iter().map(|p| p.delta).sum::<u64>(), declared);
    assert_eq!(writes.last().unwrap().pos, declared);
    assert!(writes.iter().all(|p| p.size == Some(declared)));
    assert!(writes.windows(2).all(|w| w[0].pos <= w[1].pos));
}

#[tokio::test]
async fn missing_upload_file_sends_nothing() {
    let (base, state) = start_server().await;
    let err = client()
        .post(
            &format!("{base}/upload"),
            RequestOptions::new().data(FormData::new().file("file1", "/no/such/file.zip")),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::Encoding(_)));
    assert!(state.requests().await.is_empty());
}

#[tokio::test]
async fn form_is_resent_after_redirect() {
    let (base, state) = start_server().await;
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("app.zip");
    std::fs::write(&file, b"PK fake zip bytes").unwrap();

    let body = client()
        .post(
            &format!("{base}/upload_redirect"),
            RequestOptions::new().data(FormData::new().field("k", "v").file("file1", &file)),
        )
        .await
        .unwrap();
    assert_eq!(body.as_json().unwrap()["method"], "POST");

    let first = &state.requests_to("/upload_redirect").await[0];
    let second = &state.requests_to("/upload").await[0];
    assert_eq!(second.method, "POST");
    assert_eq!(first.header("content-length"), second.header("content-length"));

    let upload = &state.uploads().await[0];
    assert_eq!(upload.field("k"), Some("v"));
    assert_eq!(upload.files[0].size, 17);
}

// --- downloads ---

#[tokio::test]
async fn save_to_directory_uses_url_name() {
    let (base, _) = start_server().await;
    let dir = tempfile::tempdir().unwrap();
    let body = client()
        .get(
            &format!("{base}/files/report.txt"),
            RequestOptions::new().save_to(dir.path()),
        )
        .await
        .unwrap();
    let path = dir.path().join("report.txt");
    assert_eq!(body, ResponseBody::Saved(path.clone()));
    assert_eq!(std::fs::read_to_string(path).unwrap(), "contents of report.txt");
}

#[tokio::test]
async fn save_to_explicit_file_creates_directories() {
    let (base, _) = start_server().await;
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("nested/deeper/custom_filename");
    let body = client()
        .get(
            &format!("{base}/page1"),
            RequestOptions::new().save_to(&target),
        )
        .await
        .unwrap();
    assert_eq!(body.path(), Some(&target));
    assert_eq!(std::fs::read_to_string(target).unwrap(), "A page");
}

#[tokio::test]
async fn save_root_url_uses_default_name() {
    let (base, _) = start_server().await;
    let dir = tempfile::tempdir().unwrap();
    let body = client()
        .get(&base, RequestOptions::new().save_to(dir.path()))
        .await
        .unwrap();
    assert_eq!(body.path(), Some(&dir.path().join(DEFAULT_FILE_NAME)));
}

#[tokio::test]
async fn save_after_redirect_names_file_after_final_url() {
    let (base, _) = start_server().await;
    let dir = tempfile::tempdir().unwrap();
    let body = client()
        .get(
            &format!("{base}/relative_redirect"),
            RequestOptions::new().save_to(dir.path()),
        )
        .await
        .unwrap();
    assert_eq!(body.path(), Some(&dir.path().join("page1")));
}

#[tokio::test]
async fn unwritable_destination_is_sink_error() {
    let (base, _) = start_server().await;
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("plain_file");
    std::fs::write(&blocker, "x").unwrap();

    let err = client()
        .get(
            &format!("{base}/page1"),
            RequestOptions::new().save_to(blocker.join("child/out.txt")),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::Sink { .. }));
}

#[tokio::test]
async fn stream_into_writer() {
    let (base, _) = start_server().await;
    let (writer, mut reader) = tokio::io::duplex(64 * 1024);
    let body = client()
        .get(
            &format!("{base}/bytes/5000"),
            RequestOptions::new().output(Output::writer(writer)),
        )
        .await
        .unwrap();
    assert_eq!(body, ResponseBody::Streamed { bytes: 5000 });

    let mut got = Vec::new();
    reader.read_to_end(&mut got).await.unwrap();
    assert_eq!(got, vec![b'x'; 5000]);
}

#[tokio::test]
async fn download_progress_with_known_length() {
    let (base, _) = start_server().await;
    let (events, sink) = collector();
    let dir = tempfile::tempdir().unwrap();
    client()
        .get(
            &format!("{base}/bytes/40000"),
            RequestOptions::new().save_to(dir.path()).events(sink),
        )
        .await
        .unwrap();

    let events = events.lock().unwrap();
    assert_eq!(read_total(&events), 40000);
    let connect = events
        .iter()
        .find_map(|e| match e {
            Event::Connect(info) => Some(info.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(connect.status, 200);
    assert_eq!(connect.size, Some(40000));
    assert_eq!(connect.path, Some(dir.path().join("40000")));
    assert!(events.iter().all(|e| match e {
        Event::Read(p) => p.size == Some(40000),
        _ => true,
    }));
}

#[tokio::test]
async fn download_progress_with_chunked_body() {
    let (base, _) = start_server().await;
    let (events, sink) = collector();
    let body = client()
        .get(
            &format!("{base}/chunked/2500"),
            RequestOptions::new().events(sink),
        )
        .await
        .unwrap();
    assert_eq!(body.as_text().map(str::len), Some(2500));

    let events = events.lock().unwrap();
    assert_eq!(read_total(&events), 2500);
    assert!(events.iter().all(|e| match e {
        Event::Read(p) => p.size.is_none(),
        _ => true,
    }));
}

// --- events ---

#[tokio::test]
async fn events_follow_exchange_order() {
    let (base, _) = start_server().await;
    let (events, sink) = collector();
    client()
        .get(
            &format!("{base}/relative_redirect"),
            RequestOptions::new().events(sink),
        )
        .await
        .unwrap();

    let events = events.lock().unwrap();
    let names: Vec<&str> = events.iter().map(Event::name).collect();
    assert_eq!(names.first(), Some(&"api/headers"));
    assert_eq!(names.iter().filter(|n| **n == "api/headers").count(), 2);
    assert_eq!(names.iter().filter(|n| **n == "api/connect").count(), 1);

    let debug: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            Event::Debug(message) => Some(message.as_str()),
            _ => None,
        })
        .collect();
    assert!(debug[0].starts_with("GET "));
    assert!(debug
        .iter()
        .any(|m| m.contains("-> 302 ") && m.ends_with("/page1")));
}

#[tokio::test]
async fn client_level_event_sink() {
    let (base, _) = start_server().await;
    let (events, sink) = collector();
    let client = client().with_events(sink);
    client
        .get(&format!("{base}/page1"), RequestOptions::new())
        .await
        .unwrap();
    assert_eq!(read_total(&events.lock().unwrap()), 6);
}

// --- concurrency ---

#[tokio::test]
async fn concurrent_requests_share_a_client() {
    let (base, state) = start_server().await;
    let client = client();
    let mut handles = Vec::new();
    for i in 0..8 {
        let client = client.clone();
        let url = format!("{base}/bytes/{}", 1000 + i);
        handles.push(tokio::spawn(async move {
            client.get(&url, RequestOptions::new()).await
        }));
    }
    for (i, handle) in handles.into_iter().enumerate() {
        let body = handle.await.unwrap().unwrap();
        assert_eq!(body.as_text().map(str::len), Some(1000 + i));
    }
    assert_eq!(state.requests().await.len(), 8);
}
