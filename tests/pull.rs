//! Pull flow against a stub registry: idempotence and id discovery.

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;

use carton::images;
use carton::registry::RegistryClient;
use carton::storage::FileStorage;

const MANIFEST_DIGEST: &str = "sha256:1111111111111111111111111111111111111111111111111111111111111111";
const CONFIG_DIGEST: &str = "sha256:2222222222222222222222222222222222222222222222222222222222222222";
const LAYER_DIGEST: &str = "sha256:3333333333333333333333333333333333333333333333333333333333333333";

fn layer_blob() -> Vec<u8> {
    let mut builder = tar::Builder::new(flate2::write::GzEncoder::new(
        Vec::new(),
        flate2::Compression::default(),
    ));
    let files: [(&str, &[u8]); 2] = [
        (
            "etc/passwd",
            b"root:x:0:0:root:/root:/bin/sh\nguest:x:405:100:guest:/:/sbin/nologin\n",
        ),
        ("etc/group", b"root:x:0:\nusers:x:100:\n"),
    ];
    for (path, content) in files {
        let mut header = tar::Header::new_gnu();
        header.set_path(path).unwrap();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append(&header, content).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

fn respond(stream: &mut TcpStream, status: &str, content_type: &str, body: &[u8]) {
    let head = format!(
        "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len(),
    );
    let _ = stream.write_all(head.as_bytes());
    let _ = stream.write_all(body);
}

fn handle(mut stream: TcpStream, requests: &Arc<Mutex<Vec<String>>>) {
    let mut reader = BufReader::new(stream.try_clone().unwrap());
    let mut request_line = String::new();
    if reader.read_line(&mut request_line).is_err() || request_line.is_empty() {
        return;
    }
    // drain the headers
    loop {
        let mut line = String::new();
        match reader.read_line(&mut line) {
            Ok(0) => break,
            Ok(_) if line == "\r\n" => break,
            Ok(_) => {}
            Err(_) => return,
        }
    }

    let path = request_line
        .split_whitespace()
        .nth(1)
        .unwrap_or_default()
        .to_string();
    requests.lock().unwrap().push(path.clone());

    if path.starts_with("/token") {
        let body = format!(
            r#"{{"token":"stub-token","expires_in":300,"issued_at":"{}"}}"#,
            chrono::Utc::now().to_rfc3339(),
        );
        respond(&mut stream, "200 OK", "application/json", body.as_bytes());
    } else if path == "/v2/library/alpine/manifests/latest" {
        let body = format!(
            r#"{{"manifests":[
                {{"digest":"sha256:ffff","mediaType":"mt","platform":{{"architecture":"arm64"}}}},
                {{"digest":"{MANIFEST_DIGEST}","mediaType":"application/vnd.oci.image.manifest.v1+json","platform":{{"architecture":"amd64"}}}}
            ]}}"#,
        );
        respond(&mut stream, "200 OK", "application/json", body.as_bytes());
    } else if path == format!("/v2/library/alpine/manifests/{MANIFEST_DIGEST}") {
        let body = format!(
            r#"{{"config":{{"digest":"{CONFIG_DIGEST}","mediaType":"application/vnd.oci.image.config.v1+json"}},
                "layers":[{{"digest":"{LAYER_DIGEST}","mediaType":"application/vnd.oci.image.layer.v1.tar+gzip"}}]}}"#,
        );
        respond(&mut stream, "200 OK", "application/json", body.as_bytes());
    } else if path == format!("/v2/library/alpine/blobs/{CONFIG_DIGEST}") {
        let body = r#"{"architecture":"amd64","os":"linux","config":{"Cmd":["/bin/sh"]}}"#;
        respond(&mut stream, "200 OK", "application/json", body.as_bytes());
    } else if path == format!("/v2/library/alpine/blobs/{LAYER_DIGEST}") {
        respond(
            &mut stream,
            "200 OK",
            "application/octet-stream",
            &layer_blob(),
        );
    } else {
        respond(&mut stream, "404 Not Found", "text/plain", b"not found");
    }
}

/// Single-threaded HTTP stub serving the token endpoint and the registry
/// API. Records every request path.
fn start_stub() -> (String, Arc<Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    let requests = Arc::new(Mutex::new(Vec::new()));

    let recorded = requests.clone();
    thread::spawn(move || {
        for stream in listener.incoming().flatten() {
            handle(stream, &recorded);
        }
    });
    (url, requests)
}

fn blob_requests(requests: &Arc<Mutex<Vec<String>>>) -> usize {
    requests
        .lock()
        .unwrap()
        .iter()
        .filter(|path| path.contains("/blobs/"))
        .count()
}

#[test]
fn second_pull_hits_only_the_cache() {
    let (url, requests) = start_stub();
    let dir = tempfile::tempdir().unwrap();
    let storage = FileStorage::open(dir.path().join("store")).unwrap();
    let client = RegistryClient::with_endpoints(&url, &url);

    let image = images::resolve(&storage, &client, "docker.io/library/alpine:latest").unwrap();
    assert_eq!(image.manifest.digest.0, MANIFEST_DIGEST);
    assert_eq!(image.layers.len(), 1);
    // ids discovered from the extracted layer and persisted
    assert_eq!(image.config.uids, vec![0, 405]);
    assert_eq!(image.config.gids, vec![0, 100]);
    let first_blob_requests = blob_requests(&requests);
    assert_eq!(first_blob_requests, 2); // config + one layer

    // second pull: everything is cached, zero blob fetches
    let image = images::resolve(&storage, &client, "docker.io/library/alpine:latest").unwrap();
    assert_eq!(image.manifest.digest.0, MANIFEST_DIGEST);
    assert_eq!(image.config.uids, vec![0, 405]);
    assert_eq!(blob_requests(&requests), first_blob_requests);

    let index = storage.image_index().unwrap();
    assert_eq!(index.len(), 1);
    assert_eq!(index[0].digest.0, MANIFEST_DIGEST);
    assert_eq!(index[0].tags, vec!["latest"]);
}

#[test]
fn unknown_registry_prefix_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let storage = FileStorage::open(dir.path().join("store")).unwrap();
    let client = RegistryClient::docker();

    let err = images::resolve(&storage, &client, "quay.io/library/alpine").unwrap_err();
    assert!(err.to_string().contains("unknown image reference"));
}

#[test]
fn missing_platform_manifest_is_an_error() {
    let (url, _requests) = start_stub();
    let dir = tempfile::tempdir().unwrap();
    let storage = FileStorage::open(dir.path().join("store")).unwrap();
    let client = RegistryClient::with_endpoints(&url, &url);

    // the stub only knows library/alpine; everything else 404s
    let err = images::resolve(&storage, &client, "docker.io/library/nosuch:latest").unwrap_err();
    assert!(format!("{err:#}").contains("manifest index"));
}
