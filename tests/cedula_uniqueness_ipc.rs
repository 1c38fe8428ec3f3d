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

fn error_code(value: &serde_json::Value) -> Option<&str> {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
}

#[test]
fn student_cedula_blocks_a_user_with_the_same_cedula() {
    let workspace = temp_dir("habilidades-cedula-su");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "students.create",
        json!({ "cedula": "1710034065", "firstNames": "Ana", "lastNames": "Mora" }),
    );

    let res = request(
        &mut stdin,
        &mut reader,
        "3",
        "users.create",
        json!({
            "cedula": "1710034065",
            "firstNames": "Ana",
            "lastNames": "Mora",
            "email": "ana.mora@uni.edu.ec",
            "password": "secreta",
            "role": "docente"
        }),
    );
    assert_eq!(res.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(error_code(&res), Some("conflict"));
}

#[test]
fn user_cedula_blocks_a_student_with_the_same_cedula() {
    let workspace = temp_dir("habilidades-cedula-us");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "users.create",
        json!({
            "cedula": "0926687856",
            "firstNames": "Luis",
            "lastNames": "Vera",
            "email": "luis.vera@uni.edu.ec",
            "password": "secreta",
            "role": "docente"
        }),
    );

    let res = request(
        &mut stdin,
        &mut reader,
        "3",
        "students.create",
        json!({ "cedula": "0926687856", "firstNames": "Luis", "lastNames": "Vera" }),
    );
    assert_eq!(res.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(error_code(&res), Some("conflict"));
    assert_eq!(
        res.get("error").and_then(|e| e.get("message")).and_then(|v| v.as_str()),
        Some("Cédula '0926687856' ya registrada como usuario.")
    );
}

#[test]
fn bulk_student_import_skips_rows_held_by_users() {
    let workspace = temp_dir("habilidades-cedula-bulk");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "users.create",
        json!({
            "cedula": "0926687856",
            "firstNames": "Luis",
            "lastNames": "Vera",
            "email": "luis.vera@uni.edu.ec",
            "password": "secreta",
            "role": "docente"
        }),
    );

    let content = "0926687856,Luis,Vera,\n1710034065,Ana,Mora,ana.mora@mail.com\n";
    let res = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.import",
        json!({ "content": content }),
    );
    assert_eq!(res.get("creados").and_then(|v| v.as_i64()), Some(1));
    let errores = res.get("errores").and_then(|v| v.as_array()).cloned().unwrap();
    assert_eq!(errores.len(), 1);
    assert_eq!(
        errores[0].as_str(),
        Some("Fila 1: Cédula '0926687856' ya registrada como usuario.")
    );
}

#[test]
fn invalid_checksum_is_rejected_everywhere() {
    let workspace = temp_dir("habilidades-cedula-checksum");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    // Last digit off by one.
    let res = request(
        &mut stdin,
        &mut reader,
        "2",
        "students.create",
        json!({ "cedula": "1710034066", "firstNames": "Ana", "lastNames": "Mora" }),
    );
    assert_eq!(res.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(error_code(&res), Some("bad_params"));

    let bulk = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.import",
        json!({ "content": "1710034066,Ana,Mora,\n" }),
    );
    assert_eq!(bulk.get("creados").and_then(|v| v.as_i64()), Some(0));
    let errores = bulk.get("errores").and_then(|v| v.as_array()).cloned().unwrap();
    assert_eq!(errores[0].as_str(), Some("Fila 1: Cédula '1710034066' inválida."));
}
