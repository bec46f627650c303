//! Integration tests for the HTTP serving path.
//!
//! Each test publishes a fixture tree through the real publisher, starts an
//! in-process server on an ephemeral port, and exercises it with plain
//! blocking HTTP requests.

use std::io::Read;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::prelude::*;
use flate2::Compression;
use flate2::write::GzEncoder;
use tempfile::TempDir;
use tokio::sync::oneshot;

use fsserve::db::{DbMode, SqliteTreeDb, TreeDb};
use fsserve::hash::hash_bytes;
use fsserve::serve::{Route, ServeOpts, Server, ServerConfig};
use fsserve::store::FsStore;
use fsserve::tree::{EncodedAlt, SyncConfig, SyncDirConfig, Tree};

const ICON_BODY: &[u8] = b"this is a test image file";
const JS_BODY: &[u8] = b"this is a test js file";
const INDEX_BODY: &[u8] = b"this is a test index html file";
const UNKNOWN_EXT_BODY: &[u8] = b"<!DOCTYPE HTML>";

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    std::io::Write::write_all(&mut enc, data).unwrap();
    enc.finish().unwrap()
}

fn gunzip(data: &[u8]) -> Vec<u8> {
    let mut dec = flate2::read::GzDecoder::new(data);
    let mut out = Vec::new();
    dec.read_to_end(&mut out).unwrap();
    out
}

fn write_file(path: &Path, data: &[u8]) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, data).unwrap();
}

fn routes() -> Vec<Route> {
    vec![
        Route {
            prefix: "/static/icon/".into(),
            dir: true,
            path: "static/icon".into(),
            cache_control: "public, max-age=31536000, no-cache".into(),
            ..Route::default()
        },
        Route {
            prefix: "/static/".into(),
            dir: true,
            path: "static".into(),
            cache_control: "public, max-age=31536000, immutable".into(),
            include: ".{2,}".into(),
            exclude: "^hideme$".into(),
            encodings: vec!["gzip".into()],
            default_content_type: "text/plain".into(),
            ..Route::default()
        },
        Route {
            prefix: "/bogus".into(),
            path: "bogus".into(),
            ..Route::default()
        },
        Route {
            prefix: "/subdir".into(),
            path: "subdir".into(),
            ..Route::default()
        },
        Route {
            prefix: "/".into(),
            path: "index.html".into(),
            cache_control: "public, max-age=31536000, no-cache".into(),
            encodings: vec!["gzip".into()],
            ..Route::default()
        },
    ]
}

struct TestServer {
    addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    #[allow(dead_code)]
    runtime: Arc<tokio::runtime::Runtime>,
    root: TempDir,
}

impl TestServer {
    fn start() -> Self {
        let runtime = Arc::new(tokio::runtime::Runtime::new().unwrap());
        let root = TempDir::new().unwrap();
        let src = root.path().join("src");
        let content = root.path().join("content");
        let db_path = root.path().join("tree.db");

        write_file(&src.join("static/icon/someicon.png"), ICON_BODY);
        write_file(&src.join("static/testfile.js"), JS_BODY);
        write_file(&src.join("static/testfile.js.gz"), &gzip(JS_BODY));
        write_file(&src.join("static/fileunknownext"), UNKNOWN_EXT_BODY);
        write_file(&src.join("static/hideme"), b"should be hidden");
        write_file(&src.join("static/a"), b"x");
        write_file(&src.join("index.html"), INDEX_BODY);
        write_file(&src.join("index.html.gz"), &gzip(INDEX_BODY));

        let sync_cfg = SyncConfig {
            dirs: vec![
                SyncDirConfig {
                    dst: "static".into(),
                    content_type: String::new(),
                    exact: false,
                    src: src.join("static").to_string_lossy().into_owned(),
                    match_pattern: r"^(icon/.*\.png|testfile\.js|fileunknownext|hideme|a)$"
                        .into(),
                    alts: vec![EncodedAlt {
                        code: "gzip".into(),
                        suffix: ".gz".into(),
                        name: String::new(),
                    }],
                },
                SyncDirConfig {
                    dst: "index.html".into(),
                    content_type: String::new(),
                    exact: true,
                    src: src.join("index.html").to_string_lossy().into_owned(),
                    match_pattern: String::new(),
                    alts: vec![EncodedAlt {
                        code: "gzip".into(),
                        suffix: String::new(),
                        name: src.join("index.html.gz").to_string_lossy().into_owned(),
                    }],
                },
            ],
        };

        // publish the fixture tree with the real publisher
        runtime.block_on(async {
            let store = FsStore::new(&content);
            store.init().await.unwrap();
            let db = SqliteTreeDb::open(&db_path, DbMode::Create).unwrap();
            let tree = Tree::new(store, db);
            tree.setup().unwrap();
            tree.sync(&sync_cfg, false).await.unwrap();

            // a record whose blob is a directory on disk: serving it must
            // be refused as a bad request
            let dir_hash = hash_bytes(b"subdir stand-in");
            std::fs::create_dir(content.join(dir_hash.as_str())).unwrap();
            tree.db()
                .insert(
                    "subdir",
                    &fsserve::db::ContentRecord {
                        hash: dir_hash,
                        content_type: String::new(),
                        encodings: vec![],
                    },
                )
                .unwrap();
        });

        let server = Server::new(
            FsStore::new(&content),
            SqliteTreeDb::open(&db_path, DbMode::ReadOnly).unwrap(),
            routes(),
            ServerConfig {
                instance: "testinstance".into(),
                proxies: vec!["10.0.0.0/8".parse().unwrap()],
            },
        )
        .unwrap();

        let listener = runtime
            .block_on(async { tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap() });
        let addr = listener.local_addr().unwrap();

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let rt = Arc::clone(&runtime);
        std::thread::spawn(move || {
            rt.block_on(async move {
                server
                    .serve(listener, ServeOpts::default(), async {
                        let _ = shutdown_rx.await;
                    })
                    .await
                    .unwrap();
            });
        });
        std::thread::sleep(std::time::Duration::from_millis(50));

        TestServer {
            addr,
            shutdown_tx: Some(shutdown_tx),
            runtime,
            root,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    fn blob_path(&self, data: &[u8]) -> PathBuf {
        self.root
            .path()
            .join("content")
            .join(hash_bytes(data).as_str())
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

fn strong_etag(body: &[u8]) -> String {
    format!("\"{}\"", hash_bytes(body))
}

fn weak_etag_for(path: &Path) -> String {
    let meta = std::fs::metadata(path).unwrap();
    let mtime_ms = meta
        .modified()
        .unwrap()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64;
    let mut packed = [0u8; 16];
    packed[..8].copy_from_slice(&mtime_ms.to_be_bytes());
    packed[8..].copy_from_slice(&meta.len().to_be_bytes());
    format!("W/\"{}\"", BASE64_URL_SAFE_NO_PAD.encode(packed))
}

#[test]
fn plain_fetch_without_alternate() {
    let server = TestServer::start();
    let client = reqwest::blocking::Client::new();

    let res = client
        .get(server.url("/static/icon/someicon.png"))
        .header("Accept-Encoding", "gzip")
        .send()
        .unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(res.headers()["content-type"], "image/png");
    assert_eq!(
        res.headers()["cache-control"],
        "public, max-age=31536000, no-cache"
    );
    assert_eq!(res.headers()["vary"], "Accept-Encoding");
    assert_eq!(res.headers()["etag"], strong_etag(ICON_BODY).as_str());
    assert_eq!(res.headers()["accept-ranges"], "bytes");
    assert!(res.headers().get("content-encoding").is_none());
    assert!(res.headers().get("last-modified").is_some());
    assert_eq!(res.bytes().unwrap().as_ref(), ICON_BODY);
}

#[test]
fn compressed_alternate_selected() {
    let server = TestServer::start();
    let client = reqwest::blocking::Client::new();

    let res = client
        .get(server.url("/static/testfile.js"))
        .header("Accept-Encoding", "gzip")
        .send()
        .unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(res.headers()["content-encoding"], "gzip");
    assert_eq!(
        res.headers()["content-type"],
        "text/javascript; charset=utf-8"
    );
    assert_eq!(
        res.headers()["cache-control"],
        "public, max-age=31536000, immutable"
    );
    let etag = res.headers()["etag"].to_str().unwrap().to_string();
    let body = res.bytes().unwrap();
    assert_eq!(etag, strong_etag(&body));
    assert_eq!(gunzip(&body), JS_BODY);

    // without gzip in Accept-Encoding the primary blob is served
    let res = client
        .get(server.url("/static/testfile.js"))
        .header("Accept-Encoding", "zstd;q=1.0, br")
        .send()
        .unwrap();
    assert_eq!(res.status(), 200);
    assert!(res.headers().get("content-encoding").is_none());
    assert_eq!(res.bytes().unwrap().as_ref(), JS_BODY);
}

#[test]
fn conditional_requests() {
    let server = TestServer::start();
    let client = reqwest::blocking::Client::new();

    let res = client
        .get(server.url("/static/testfile.js"))
        .header("Accept-Encoding", "gzip")
        .send()
        .unwrap();
    let etag = res.headers()["etag"].to_str().unwrap().to_string();

    // strong validator
    let res = client
        .get(server.url("/static/testfile.js"))
        .header("Accept-Encoding", "gzip")
        .header("If-None-Match", etag.as_str())
        .send()
        .unwrap();
    assert_eq!(res.status(), 304);
    assert!(res.headers().get("content-type").is_none());
    assert!(res.headers().get("content-encoding").is_none());
    assert_eq!(res.headers()["vary"], "Accept-Encoding");
    assert_eq!(
        res.headers()["cache-control"],
        "public, max-age=31536000, immutable"
    );
    assert_eq!(res.headers()["etag"], etag.as_str());

    // weak validator, in a list of candidates
    let weak = weak_etag_for(&server.blob_path(&gzip(JS_BODY)));
    let res = client
        .get(server.url("/static/testfile.js"))
        .header("Accept-Encoding", "gzip")
        .header("If-None-Match", format!("\"other\", {weak}"))
        .send()
        .unwrap();
    assert_eq!(res.status(), 304);

    // non-matching validator still serves the body
    let res = client
        .get(server.url("/static/testfile.js"))
        .header("Accept-Encoding", "gzip")
        .header("If-None-Match", "\"stale\"")
        .send()
        .unwrap();
    assert_eq!(res.status(), 200);
}

#[test]
fn route_default_content_type() {
    let server = TestServer::start();
    let client = reqwest::blocking::Client::new();

    let res = client
        .get(server.url("/static/fileunknownext"))
        .send()
        .unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(res.headers()["content-type"], "text/plain");
    assert_eq!(res.bytes().unwrap().as_ref(), UNKNOWN_EXT_BODY);
}

#[test]
fn index_file_route_catches_all() {
    let server = TestServer::start();
    let client = reqwest::blocking::Client::new();

    let res = client
        .get(server.url("/someotherpath"))
        .header("Accept-Encoding", "gzip")
        .send()
        .unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(res.headers()["content-encoding"], "gzip");
    assert_eq!(res.headers()["content-type"], "text/html; charset=utf-8");
    assert_eq!(gunzip(&res.bytes().unwrap()), INDEX_BODY);
}

#[test]
fn not_found_responses_strip_headers() {
    let server = TestServer::start();
    let client = reqwest::blocking::Client::new();

    for path in ["/static/missing.js", "/bogus", "/static/hideme", "/static/a"] {
        let res = client.get(server.url(path)).send().unwrap();
        assert_eq!(res.status(), 404, "{path}");
        for header in ["cache-control", "content-encoding", "etag", "vary"] {
            assert!(res.headers().get(header).is_none(), "{path} {header}");
        }
        assert_eq!(res.text().unwrap(), "Not Found\n", "{path}");
    }
}

#[test]
fn directory_record_is_refused() {
    let server = TestServer::start();
    let client = reqwest::blocking::Client::new();

    let res = client.get(server.url("/subdir")).send().unwrap();
    assert_eq!(res.status(), 400);
    for header in ["cache-control", "content-encoding", "etag", "vary"] {
        assert!(res.headers().get(header).is_none());
    }
    assert_eq!(res.text().unwrap(), "Bad Request\n");
}

#[test]
fn disallowed_methods() {
    let server = TestServer::start();
    let client = reqwest::blocking::Client::new();

    let res = client.post(server.url("/")).body("x").send().unwrap();
    assert_eq!(res.status(), 405);
    let res = client.delete(server.url("/")).send().unwrap();
    assert_eq!(res.status(), 405);
    let res = client
        .put(server.url("/static/testfile.js"))
        .send()
        .unwrap();
    assert_eq!(res.status(), 405);
}

#[test]
fn head_requests_send_headers_only() {
    let server = TestServer::start();
    let client = reqwest::blocking::Client::new();

    let res = client
        .head(server.url("/static/icon/someicon.png"))
        .send()
        .unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(
        res.headers()["content-length"],
        ICON_BODY.len().to_string().as_str()
    );
    assert_eq!(res.headers()["etag"], strong_etag(ICON_BODY).as_str());
    assert_eq!(res.bytes().unwrap().len(), 0);
}

#[test]
fn byte_ranges() {
    let server = TestServer::start();
    let client = reqwest::blocking::Client::new();

    let res = client
        .get(server.url("/static/icon/someicon.png"))
        .header("Range", "bytes=0-3")
        .send()
        .unwrap();
    assert_eq!(res.status(), 206);
    assert_eq!(
        res.headers()["content-range"],
        format!("bytes 0-3/{}", ICON_BODY.len()).as_str()
    );
    assert_eq!(res.bytes().unwrap().as_ref(), b"this");

    let res = client
        .get(server.url("/static/icon/someicon.png"))
        .header("Range", "bytes=-4")
        .send()
        .unwrap();
    assert_eq!(res.status(), 206);
    assert_eq!(res.bytes().unwrap().as_ref(), b"file");

    let res = client
        .get(server.url("/static/icon/someicon.png"))
        .header("Range", "bytes=9999-")
        .send()
        .unwrap();
    assert_eq!(res.status(), 416);
    assert_eq!(
        res.headers()["content-range"],
        format!("bytes */{}", ICON_BODY.len()).as_str()
    );

    // a malformed range header is ignored
    let res = client
        .get(server.url("/static/icon/someicon.png"))
        .header("Range", "bytes=tail")
        .send()
        .unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(res.bytes().unwrap().as_ref(), ICON_BODY);
}
