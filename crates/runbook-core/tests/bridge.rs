use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpListener;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rhai::{Array, Dynamic, Engine, INT, Map, Variant};
use tempfile::TempDir;
use tokio::runtime::Runtime;

use runbook_core::*;
use runbook_exec::{
    ExecError, RemoteConnector, ResolvedTarget, Secret, SecretStore, ShellResult, SshAuth, Tunnel,
};

// Mock implementations
#[derive(Default)]
struct MockRemote {
    calls: Mutex<Vec<(String, ResolvedTarget)>>,
}

impl MockRemote {
    fn record(&self, op: &str, target: &ResolvedTarget) {
        self.calls
            .lock()
            .unwrap()
            .push((op.to_string(), target.clone()));
    }

    fn calls(&self) -> Vec<(String, ResolvedTarget)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteConnector for MockRemote {
    async fn exec(&self, target: &ResolvedTarget, cmd: &str) -> Result<ShellResult, ExecError> {
        self.record("exec", target);
        let err = if cmd.contains("fail") {
            "remote failure\n".to_string()
        } else {
            String::new()
        };
        Ok(ShellResult {
            code: i32::from(!err.is_empty()),
            out: format!("ran {cmd}\n"),
            err,
            duration: Duration::ZERO,
        })
    }

    async fn upload(
        &self,
        target: &ResolvedTarget,
        local: &Path,
        _remote: &str,
    ) -> Result<u64, ExecError> {
        self.record("upload", target);
        std::fs::metadata(local)
            .map(|m| m.len())
            .map_err(|e| ExecError::IoError(e.to_string()))
    }

    async fn download(
        &self,
        target: &ResolvedTarget,
        _remote: &str,
        local: &Path,
    ) -> Result<u64, ExecError> {
        self.record("download", target);
        std::fs::write(local, "remote-content").map_err(|e| ExecError::IoError(e.to_string()))?;
        Ok(14)
    }

    async fn open_tunnel(
        &self,
        target: &ResolvedTarget,
        _local_port: u16,
        _remote_host: &str,
        _remote_port: u16,
    ) -> Result<Tunnel, ExecError> {
        self.record("tunnel", target);
        Err(ExecError::ConnectionFailed("tunnels unavailable".to_string()))
    }
}

struct Harness {
    engine: Engine,
    ctx: Arc<ExecutionContext>,
    remote: Arc<MockRemote>,
    dir: TempDir,
    _runtime: Runtime,
}

impl Harness {
    fn new() -> Self {
        Self::with_secrets(SecretStore::new())
    }

    fn with_secrets(secrets: SecretStore) -> Self {
        let runtime = Runtime::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let ctx = Arc::new(ExecutionContext::new(secrets));
        let remote = Arc::new(MockRemote::default());

        let bridge = HostBridge::new(Arc::clone(&ctx), &RunConfig::default(), runtime.handle().clone())
            .with_remote(Arc::clone(&remote) as Arc<dyn RemoteConnector>)
            .with_cwd(dir.path());
        let mut engine = Engine::new();
        Arc::new(bridge).register(&mut engine);

        Self {
            engine,
            ctx,
            remote,
            dir,
            _runtime: runtime,
        }
    }

    fn eval<T: Variant + Clone>(&self, script: &str) -> T {
        self.engine
            .eval::<T>(script)
            .unwrap_or_else(|e| panic!("script failed: {e}\n{script}"))
    }

    fn eval_err(&self, script: &str) -> RunError {
        let err = self
            .engine
            .eval::<Dynamic>(script)
            .expect_err("script should fail");
        RunError::from_script(&err)
    }

    fn path(&self, name: &str) -> String {
        self.dir.path().join(name).display().to_string()
    }
}

fn field(map: &Map, name: &str) -> Dynamic {
    map.get(name).cloned().unwrap_or_else(|| panic!("missing {name}"))
}

#[test]
fn test_sh_result_shape() {
    let h = Harness::new();

    let result: Map = h.eval(r#"sh("echo hi")"#);
    assert_eq!(field(&result, "code").as_int().unwrap(), 0);
    assert_eq!(field(&result, "out").into_string().unwrap(), "hi\n");
    assert_eq!(field(&result, "err").into_string().unwrap(), "");

    let code: INT = h.eval(r#"sh("exit 7").code"#);
    assert_eq!(code, 7);
}

#[test]
fn test_sh_timeout_is_catchable() {
    let h = Harness::new();
    let start = Instant::now();

    let kind: String = h.eval(
        r#"
        try {
            sh("sleep 5", #{ timeout: 1 });
            "finished"
        } catch (e) {
            e.kind
        }
        "#,
    );

    assert_eq!(kind, "timeout");
    assert!(start.elapsed() < Duration::from_secs(3));
}

#[test]
fn test_sh_options() {
    let h = Harness::new();

    let out: String = h.eval(
        r#"
        sh("cat; printf '%s|%s' \"$A\" \"$B\"", #{
            "in": "first",
            ins: ["second"],
            env: ["A=1", "B=2"],
        }).out
        "#,
    );
    assert_eq!(out, "first\nsecond\n1|2");

    let out: String = h.eval(r#"sh("printf %s \"$K\"", #{ env: #{ K: "from-map" } }).out"#);
    assert_eq!(out, "from-map");

    let err = h.eval_err(r#"sh("true", #{ timeout: "soon" })"#);
    assert_eq!(err.kind(), ErrorKind::Type);
    assert!(err.message().contains("sh.timeout"), "{err}");

    let err = h.eval_err(r#"sh("true", 42)"#);
    assert_eq!(err.kind(), ErrorKind::Type);
}

#[test]
fn test_out_of_range_timeout_is_catchable() {
    let h = Harness::new();

    let kind: String = h.eval(
        r#"
        try {
            sh("true", #{ timeout: 1e20 });
            "finished"
        } catch (e) {
            e.kind
        }
        "#,
    );
    assert_eq!(kind, "type");

    let err = h.eval_err(r#"http_get("http://127.0.0.1:1/", #{ timeout: 1e30 })"#);
    assert_eq!(err.kind(), ErrorKind::Type);
    assert!(err.message().contains("http_get.timeout"), "{err}");
}

#[test]
fn test_non_string_option_values_are_rejected() {
    let h = Harness::new();

    let err = h.eval_err(r#"sh("true", #{ env: #{ A: 5 } })"#);
    assert_eq!(err.kind(), ErrorKind::Type);
    assert!(err.message().contains("sh.env.A"), "{err}");

    let err = h.eval_err(r#"sh("true", #{ env: ["A=1", 2] })"#);
    assert_eq!(err.kind(), ErrorKind::Type);

    let err = h.eval_err(r#"http_get("http://127.0.0.1:1/", #{ cookies: #{ sid: 1 } })"#);
    assert_eq!(err.kind(), ErrorKind::Type);
    assert!(err.message().contains("cookies.sid"), "{err}");

    let err = h.eval_err(r#"http_post_form("http://127.0.0.1:1/", #{ count: 1 })"#);
    assert_eq!(err.kind(), ErrorKind::Type);
    assert!(err.message().contains("fields.count"), "{err}");

    let err = h.eval_err(r#"http_post_form("http://127.0.0.1:1/", #{}, #{ upload: true })"#);
    assert_eq!(err.kind(), ErrorKind::Type);
}

#[test]
fn test_map_body_labelled_text_is_rejected() {
    let h = Harness::new();

    let err = h.eval_err(
        r#"http_post("http://127.0.0.1:1/", #{ a: 1 }, #{ content_type: "text" })"#,
    );
    assert_eq!(err.kind(), ErrorKind::Type);
}

#[test]
fn test_cd_is_per_run() {
    let h = Harness::new();
    std::fs::create_dir(h.dir.path().join("sub")).unwrap();
    let before = std::env::current_dir().unwrap();

    let out: String = h.eval(r#"cd("sub"); sh("pwd -P").out"#);
    let expected = h.dir.path().join("sub").canonicalize().unwrap();
    assert_eq!(out.trim(), expected.display().to_string());
    assert_eq!(std::env::current_dir().unwrap(), before);

    let pwd: String = h.eval("pwd()");
    assert!(pwd.ends_with("sub"));

    let err = h.eval_err(r#"cd("does-not-exist")"#);
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn test_sh_script_runs_file() {
    let h = Harness::new();
    std::fs::write(h.dir.path().join("build.sh"), "echo building\nexit 3\n").unwrap();

    let result: Map = h.eval(r#"sh_script("build.sh")"#);
    assert_eq!(field(&result, "out").into_string().unwrap(), "building\n");
    assert_eq!(field(&result, "code").as_int().unwrap(), 3);
}

#[test]
fn test_env_returns_process_environment() {
    let h = Harness::new();
    let has_path: bool = h.eval(r#"env().contains("PATH")"#);
    assert!(has_path);
}

#[test]
fn test_secrets() {
    let store = SecretStore::new();
    store.add("token", Secret::text("t0k3n")).unwrap();
    store
        .add("deploy", Secret::ssh_identity("git", "KEY MATERIAL", Some("pp".into())))
        .unwrap();
    store.add("db", Secret::user_password("admin", "pw")).unwrap();
    let h = Harness::with_secrets(store);

    let token: String = h.eval(r#"get_text_secret("token")"#);
    assert_eq!(token, "t0k3n");

    let ssh: Map = h.eval(r#"get_ssh_secret("deploy")"#);
    assert_eq!(field(&ssh, "user").into_string().unwrap(), "git");
    assert_eq!(field(&ssh, "passphrase").into_string().unwrap(), "pp");
    let key_file = field(&ssh, "private_key_file").into_string().unwrap();
    assert_eq!(std::fs::read_to_string(&key_file).unwrap().trim(), "KEY MATERIAL");
    let mode = std::fs::metadata(&key_file).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o600);

    let again: String = h.eval(r#"get_ssh_secret("deploy").private_key_file"#);
    assert_eq!(again, key_file);

    let pair: Map = h.eval(r#"get_userpass_secret("db")"#);
    assert_eq!(field(&pair, "password").into_string().unwrap(), "pw");

    assert_eq!(
        h.eval_err(r#"get_text_secret("nope")"#).kind(),
        ErrorKind::NotFound
    );
    assert_eq!(h.eval_err(r#"get_ssh_secret("db")"#).kind(), ErrorKind::Type);

    assert!(h.ctx.close());
    assert!(!Path::new(&key_file).exists());
}

#[test]
fn test_fs_operations() {
    let h = Harness::new();

    let text: String = h.eval(
        r#"
        fs_create_dir("data/nested");
        fs_write("data/a.txt", "alpha");
        fs_copy("data/a.txt", "data/nested");
        fs_move("data/a.txt", "data/b.txt");
        fs_read("data/nested/a.txt")
        "#,
    );
    assert_eq!(text, "alpha");
    assert!(!h.dir.path().join("data/a.txt").exists());
    assert!(h.dir.path().join("data/b.txt").exists());

    let is_blob: bool = h.eval(
        r#"
        let b = blob(3, 0xff);
        fs_write("raw.bin", b);
        type_of(fs_read("raw.bin")) == "blob"
        "#,
    );
    assert!(is_blob);

    let files: Array = h.eval(r#"fs_list("data", "f")"#);
    let files: Vec<String> = files.into_iter().map(|f| f.into_string().unwrap()).collect();
    assert_eq!(files, vec![h.path("data/b.txt"), h.path("data/nested/a.txt")]);

    let dirs: Array = h.eval(r#"fs_list("data", "d")"#);
    assert_eq!(dirs.len(), 1);

    let title: String = h.eval(r#"fs_split("/srv/app/release.tar.gz").title"#);
    assert_eq!(title, "release.tar");

    let joined: String = h.eval(r#"fs_join(["/srv", "app", "..", "data"])"#);
    assert_eq!(joined, "/srv/data");

    let abs: String = h.eval(r#"fs_abs("data/../raw.bin")"#);
    assert_eq!(abs, h.path("raw.bin"));

    h.eval::<()>(r#"fs_remove("raw.bin"); fs_remove("raw.bin"); fs_remove_dir("data")"#);
    assert!(!h.dir.path().join("raw.bin").exists());
    assert!(!h.dir.path().join("data").exists());

    let err = h.eval_err(r#"fs_read("missing.txt")"#);
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let err = h.eval_err(r#"fs_write("x.txt", 42)"#);
    assert_eq!(err.kind(), ErrorKind::Type);
}

#[test]
fn test_fs_move_reports_rename_failure() {
    let h = Harness::new();
    h.eval::<()>(r#"fs_create_dir("tree/sub"); fs_write("tree/leaf.txt", "x")"#);

    let err = h.eval_err(r#"fs_move("tree", "tree/sub")"#);
    assert_eq!(err.kind(), ErrorKind::Execution);
    assert!(!h.dir.path().join("tree/sub/tree").exists());
    assert!(h.dir.path().join("tree/leaf.txt").exists());

    let err = h.eval_err(r#"fs_move("absent.txt", "moved.txt")"#);
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn test_archive_round_trip() {
    let h = Harness::new();

    let count: INT = h.eval(
        r#"
        fs_create_dir("src/inner");
        fs_write("src/one.txt", "1");
        fs_write("src/inner/two.txt", "2");
        let zipped = ar_zip("bundle.zip", "src");
        let unzipped = ar_unzip("bundle.zip", "out");
        if zipped.len() != unzipped.len() { throw "count mismatch"; }
        unzipped.len()
        "#,
    );
    assert_eq!(count, 2);
    assert_eq!(
        std::fs::read_to_string(h.dir.path().join("out/inner/two.txt")).unwrap(),
        "2"
    );
}

#[test]
fn test_hashes() {
    let h = Harness::new();
    std::fs::write(h.dir.path().join("abc.txt"), "abc").unwrap();

    let md5: String = h.eval(r#"hash_md5_text("abc")"#);
    assert_eq!(md5, "900150983cd24fb0d6963f7d28e17f72");

    let sha1: String = h.eval(r#"hash_sha1_file("abc.txt")"#);
    assert_eq!(sha1, "a9993e364706816aba3e25717850c26c9cd0d89d");

    let sha256: String = h.eval(
        r#"
        let b = blob();
        b.push(0x61); b.push(0x62); b.push(0x63);
        hash_sha256_buffer(b)
        "#,
    );
    assert_eq!(
        sha256,
        "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
    );

    assert_eq!(
        h.eval_err(r#"hash_md5_file("nope")"#).kind(),
        ErrorKind::NotFound
    );
}

#[test]
fn test_rsh_with_inline_and_secret_credentials() {
    let store = SecretStore::new();
    store.add("ops", Secret::user_password("ops", "pw")).unwrap();
    store.add("note", Secret::text("not a credential")).unwrap();
    let h = Harness::with_secrets(store);

    let result: Map = h.eval(
        r#"rsh(#{ address: "10.0.0.5:2222", user: "root", password: "hunter2" }, "uptime")"#,
    );
    assert_eq!(field(&result, "out").into_string().unwrap(), "ran uptime\n");
    assert_eq!(field(&result, "code").as_int().unwrap(), 0);

    let code: INT = h.eval(r#"rsh(#{ address: "h", secret_id: "ops" }, "fail now").code"#);
    assert_eq!(code, 1);

    let calls = h.remote.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].1.host, "10.0.0.5");
    assert_eq!(calls[0].1.port, 2222);
    assert_eq!(calls[0].1.auth, SshAuth::Password("hunter2".into()));
    assert_eq!(calls[1].1.user, "ops");
    assert_eq!(calls[1].1.auth, SshAuth::Password("pw".into()));

    let err = h.eval_err(r#"rsh(#{ address: "h", user: "u", secret_id: "note" }, "id")"#);
    assert_eq!(err.kind(), ErrorKind::Type);
    assert_eq!(h.remote.calls().len(), 2);

    let err = h.eval_err(r#"rsh(#{ address: "h", user: "u" }, "id")"#);
    assert_eq!(err.kind(), ErrorKind::Configuration);
}

#[test]
fn test_transfers_and_tunnel_errors() {
    let h = Harness::new();
    std::fs::write(h.dir.path().join("local.txt"), "12345").unwrap();

    let up: INT = h.eval(
        r#"sh_upload(#{ address: "h", user: "u", password: "p" }, "local.txt", "/tmp/x")"#,
    );
    assert_eq!(up, 5);

    let down: INT = h.eval(
        r#"sh_download(#{ address: "h", user: "u", password: "p" }, "/tmp/x", "copy.txt")"#,
    );
    assert_eq!(down, 14);
    assert_eq!(
        std::fs::read_to_string(h.dir.path().join("copy.txt")).unwrap(),
        "remote-content"
    );

    let kind: String = h.eval(
        r#"
        try {
            sh_tunnel(#{ address: "h", user: "u", password: "p" }, 0, "db", 5432);
            "opened"
        } catch (e) {
            e.kind
        }
        "#,
    );
    assert_eq!(kind, "network");

    let err = h.eval_err(r#"sh_tunnel(#{ address: "h", user: "u", password: "p" }, 70000, "db", 1)"#);
    assert_eq!(err.kind(), ErrorKind::Configuration);

    let closed: bool = h.eval("sh_tunnel_close(99)");
    assert!(!closed);
}

#[test]
fn test_abort_cannot_be_caught() {
    let h = Harness::new();
    h.ctx.abort();

    let err = h.eval_err(
        r#"
        try {
            sh("echo never");
        } catch (e) {
            "swallowed"
        }
        "#,
    );
    assert_eq!(err, RunError::Aborted);
}

#[test]
fn test_logging_functions_accept_any_value() {
    let h = Harness::new();
    h.eval::<()>(r#"log_info("hello"); log_warn(42); log_error(#{ a: 1 });"#);
}

/// Serve one canned HTTP response and hand back the raw request
fn serve_once(response: &'static str) -> (String, std::thread::JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let url = format!("http://{}/", listener.local_addr().unwrap());
    let server = std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut reader = BufReader::new(stream.try_clone().unwrap());

        let mut head = String::new();
        let mut content_length = 0;
        loop {
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            if let Some(value) = line.to_ascii_lowercase().strip_prefix("content-length:") {
                content_length = value.trim().parse().unwrap();
            }
            head.push_str(&line);
            if line == "\r\n" || line.is_empty() {
                break;
            }
        }
        let mut body = vec![0u8; content_length];
        reader.read_exact(&mut body).unwrap();

        stream.write_all(response.as_bytes()).unwrap();
        stream.flush().unwrap();
        head + String::from_utf8_lossy(&body).as_ref()
    });
    (url, server)
}

#[test]
fn test_http_get_response_shape() {
    let h = Harness::new();
    let (url, server) = serve_once(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: application/json\r\n\
         Set-Cookie: sid=42; Path=/\r\n\
         X-Multi: a\r\n\
         X-Multi: b\r\n\
         Content-Length: 11\r\n\
         Connection: close\r\n\r\n\
         {\"ok\":true}",
    );

    let response: Map = h.eval(&format!(
        r#"http_get("{url}", #{{ header: #{{ "X-Test": "yes" }}, cookies: #{{ a: "b" }} }})"#
    ));
    let request = server.join().unwrap();

    assert_eq!(field(&response, "status").as_int().unwrap(), 200);
    let body = field(&response, "body");
    let body = body.read_lock::<Map>().unwrap();
    assert!(field(&body, "ok").as_bool().unwrap());

    let cookies = field(&response, "cookies");
    assert_eq!(
        field(&cookies.read_lock::<Map>().unwrap(), "sid").into_string().unwrap(),
        "42"
    );

    let header = field(&response, "header");
    let header = header.read_lock::<Map>().unwrap();
    assert_eq!(field(&header, "x-multi").read_lock::<Array>().unwrap().len(), 2);
    assert_eq!(
        field(&header, "content-type").into_string().unwrap(),
        "application/json"
    );
    assert!(field(&response, "raw_body").is_blob());

    let request = request.to_ascii_lowercase();
    assert!(request.starts_with("get / http/1.1"));
    assert!(request.contains("x-test: yes"));
    assert!(request.contains("cookie: a=b"));
}

#[test]
fn test_http_post_json_body() {
    let h = Harness::new();
    let (url, server) = serve_once(
        "HTTP/1.1 201 Created\r\nContent-Length: 4\r\nConnection: close\r\n\r\ndone",
    );

    let body: String = h.eval(&format!(r#"http_post("{url}", #{{ name: "web", replicas: 2 }}).body"#));
    let request = server.join().unwrap();

    assert_eq!(body, "done");
    assert!(request.to_ascii_lowercase().contains("content-type: application/json"));
    assert!(request.ends_with(r#"{"name":"web","replicas":2}"#));
}

#[test]
fn test_http_connection_refused_is_network_error() {
    let h = Harness::new();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = h.eval_err(&format!(r#"http_get("http://{addr}/")"#));
    assert_eq!(err.kind(), ErrorKind::Network);
}
