//! Two nodes talking over real sockets

mod common;

use common::{test_config, wait_for};
use elohim_replica::ledger::today;
use elohim_replica::record::{DayStat, FileRecord, UploadResult};
use elohim_replica::{HttpServer, Node};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;

const WAIT: Duration = Duration::from_secs(15);

struct Served {
    node: Arc<Node>,
    url: String,
    _dir: TempDir,
}

async fn serve_pair() -> (Served, Served) {
    let listeners = [
        TcpListener::bind("127.0.0.1:0").await.unwrap(),
        TcpListener::bind("127.0.0.1:0").await.unwrap(),
    ];
    let urls: Vec<String> = listeners
        .iter()
        .map(|l| format!("http://{}", l.local_addr().unwrap()))
        .collect();

    let mut served = Vec::new();
    for (i, listener) in listeners.into_iter().enumerate() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path(), &urls[i], vec![urls[1 - i].clone()]);
        let node = Node::open_with_http(config).await.unwrap();
        node.start();
        let server = Arc::new(HttpServer::new(node.clone(), listener.local_addr().unwrap()));
        tokio::spawn(server.serve(listener));
        served.push(Served {
            node,
            url: urls[i].clone(),
            _dir: dir,
        });
    }
    let b = served.pop().unwrap();
    let a = served.pop().unwrap();
    (a, b)
}

async fn upload(client: &Client, base: &str, name: &str, data: &'static [u8]) -> UploadResult {
    let form = Form::new()
        .text("scene", "docs")
        .text("output", "json")
        .part("file", Part::bytes(data).file_name(name.to_string()));
    let response = client
        .post(format!("{}/upload", base))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    response.json().await.unwrap()
}

async fn check_file_exist(client: &Client, base: &str, md5: &str) -> FileRecord {
    client
        .post(format!("{}/check_file_exist", base))
        .form(&[("md5", md5)])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_upload_replicates_and_downloads_from_peer() {
    let (a, b) = serve_pair().await;
    let client = Client::new();

    let result = upload(&client, &a.url, "notes.txt", b"over the wire").await;
    assert!(result.url.starts_with(&a.url));
    assert!(result.path.starts_with("/group1/docs/"));
    assert_eq!(result.scene, "docs");

    let md5 = result.md5.clone();
    let (client_ref, b_url) = (&client, b.url.as_str());
    let replicated = wait_for(WAIT, move || {
        let md5 = md5.clone();
        async move { !check_file_exist(client_ref, b_url, &md5).await.is_empty() }
    })
    .await;
    assert!(replicated, "peer never received the upload");

    let body = client
        .get(format!("{}{}", b.url, result.path))
        .send()
        .await
        .unwrap();
    assert_eq!(body.status(), StatusCode::OK);
    assert_eq!(body.bytes().await.unwrap().as_ref(), b"over the wire");

    let hashes = client
        .post(format!("{}/get_md5s_by_date", b.url))
        .form(&[("date", today())])
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(hashes, result.md5);

    let stats: Vec<DayStat> = client
        .get(format!("{}/stat", a.url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let day = stats.iter().find(|r| r.date == today()).unwrap();
    assert_eq!(day.file_count, 1);

    a.node.shutdown().await.unwrap();
    b.node.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unknown_paths_and_bad_requests() {
    let (a, b) = serve_pair().await;
    let client = Client::new();

    let missing = client
        .get(format!("{}/group1/docs/nothing/here.txt", a.url))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);

    let unrouted = client.get(format!("{}/nowhere", a.url)).send().await.unwrap();
    assert_eq!(unrouted.status(), StatusCode::NOT_FOUND);

    let traversal = client
        .get(format!("{}/group1/docs/%2E%2E%2F%2E%2E%2Fsecret", a.url))
        .send()
        .await
        .unwrap();
    assert_eq!(traversal.status(), StatusCode::BAD_REQUEST);

    let bad_date = client
        .post(format!("{}/get_md5s_by_date", a.url))
        .form(&[("date", "yesterday")])
        .send()
        .await
        .unwrap();
    assert_eq!(bad_date.status(), StatusCode::BAD_REQUEST);

    let absent = check_file_exist(&client, &a.url, "0123456789abcdef0123456789abcdef").await;
    assert!(absent.is_empty());

    a.node.shutdown().await.unwrap();
    b.node.shutdown().await.unwrap();
}
