use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_habilidadesd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn habilidadesd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({ "id": id, "method": method, "params": params });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown error")
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn career_names(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>) -> Vec<String> {
    let list = request_ok(stdin, reader, "cl", "careers.list", json!({}));
    list.get("careers")
        .and_then(|v| v.as_array())
        .unwrap()
        .iter()
        .map(|c| c.get("name").and_then(|v| v.as_str()).unwrap().to_string())
        .collect()
}

#[test]
fn export_then_import_restores_the_snapshot() {
    let workspace = temp_dir("habilidades-bundle-roundtrip");
    let bundle_path = temp_dir("habilidades-bundle-out").join("snapshot.zip");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    request_ok(&mut stdin, &mut reader, "2", "careers.create", json!({ "name": "Software" }));

    let export = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "workspace.exportBundle",
        json!({ "outPath": bundle_path.to_string_lossy() }),
    );
    assert_eq!(
        export.get("bundleFormat").and_then(|v| v.as_str()),
        Some("habilidades-workspace-v1")
    );
    let exported_sha = export
        .get("dbSha256")
        .and_then(|v| v.as_str())
        .unwrap()
        .to_string();
    assert!(bundle_path.is_file());

    // Diverge from the snapshot, then roll back to it.
    request_ok(&mut stdin, &mut reader, "4", "careers.create", json!({ "name": "Redes" }));
    assert_eq!(career_names(&mut stdin, &mut reader).len(), 2);

    let import = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "workspace.importBundle",
        json!({ "inPath": bundle_path.to_string_lossy() }),
    );
    assert_eq!(
        import.get("bundleFormat").and_then(|v| v.as_str()),
        Some("habilidades-workspace-v1")
    );
    assert_eq!(
        import.get("dbSha256").and_then(|v| v.as_str()),
        Some(exported_sha.as_str())
    );

    assert_eq!(career_names(&mut stdin, &mut reader), vec!["Software".to_string()]);

    // The restored database accepts writes.
    request_ok(&mut stdin, &mut reader, "6", "careers.create", json!({ "name": "Redes" }));
    assert_eq!(career_names(&mut stdin, &mut reader).len(), 2);
}

#[test]
fn import_of_a_missing_bundle_fails_cleanly() {
    let workspace = temp_dir("habilidades-bundle-missing");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let missing = workspace.join("no-such.zip");
    let res = request(
        &mut stdin,
        &mut reader,
        "2",
        "workspace.importBundle",
        json!({ "inPath": missing.to_string_lossy() }),
    );
    assert_eq!(res.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        res.get("error").and_then(|e| e.get("code")).and_then(|v| v.as_str()),
        Some("not_found")
    );

    // The daemon still serves requests afterwards.
    request_ok(&mut stdin, &mut reader, "3", "careers.create", json!({ "name": "Software" }));
}
