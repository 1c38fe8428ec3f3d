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

const CEDULA: &str = "1710034065";

fn seed(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>) {
    request_ok(stdin, reader, "s1", "careers.create", json!({ "name": "Software" }));
    for (i, cycle) in ["II", "III", "V"].iter().enumerate() {
        request_ok(
            stdin,
            reader,
            &format!("s2-{}", i),
            "cycles.create",
            json!({ "name": cycle }),
        );
    }
    request_ok(
        stdin,
        reader,
        "s3",
        "students.create",
        json!({ "cedula": CEDULA, "firstNames": "Ana", "lastNames": "Mora" }),
    );
    let period = request_ok(
        stdin,
        reader,
        "s4",
        "periods.create",
        json!({ "name": "2025-A", "startDate": "2025-04-01", "endDate": "2025-08-31" }),
    );
    let period_id = period.get("periodId").and_then(|v| v.as_str()).unwrap().to_string();
    request_ok(stdin, reader, "s5", "periods.activate", json!({ "periodId": period_id }));
}

fn active_period_id(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>) -> String {
    let periods = request_ok(stdin, reader, "pl", "periods.list", json!({}));
    periods
        .get("periods")
        .and_then(|v| v.as_array())
        .unwrap()
        .iter()
        .find(|p| p.get("active").and_then(|v| v.as_bool()) == Some(true))
        .and_then(|p| p.get("id"))
        .and_then(|v| v.as_str())
        .expect("an active period")
        .to_string()
}

fn single_enrollment(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    period_id: &str,
) -> serde_json::Value {
    let list = request_ok(
        stdin,
        reader,
        "el",
        "enrollments.list",
        json!({ "periodId": period_id }),
    );
    let rows = list.get("enrollments").and_then(|v| v.as_array()).cloned().unwrap();
    assert_eq!(rows.len(), 1, "expected exactly one enrollment");
    rows[0].clone()
}

#[test]
fn reimport_never_downgrades_the_cycle() {
    let workspace = temp_dir("habilidades-enroll-downgrade");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    seed(&mut stdin, &mut reader);
    let period_id = active_period_id(&mut stdin, &mut reader);

    let first = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "enrollments.import",
        json!({ "content": format!("{},Software,III", CEDULA) }),
    );
    assert_eq!(first.get("creados").and_then(|v| v.as_i64()), Some(1));

    // A lower cycle on re-import counts as an update but keeps III.
    let second = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "enrollments.import",
        json!({ "content": format!("{},Software,II", CEDULA) }),
    );
    assert_eq!(second.get("creados").and_then(|v| v.as_i64()), Some(0));
    assert_eq!(second.get("actualizados").and_then(|v| v.as_i64()), Some(1));

    let row = single_enrollment(&mut stdin, &mut reader, &period_id);
    assert_eq!(row.get("cycle").and_then(|v| v.as_str()), Some("III"));

    let students = request_ok(&mut stdin, &mut reader, "4", "students.list", json!({}));
    let student = &students.get("students").and_then(|v| v.as_array()).unwrap()[0];
    assert_eq!(student.get("cycle").and_then(|v| v.as_str()), Some("III"));

    // A higher cycle does go through.
    let third = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "enrollments.import",
        json!({ "content": format!("{},Software,V", CEDULA) }),
    );
    assert_eq!(third.get("actualizados").and_then(|v| v.as_i64()), Some(1));
    let row = single_enrollment(&mut stdin, &mut reader, &period_id);
    assert_eq!(row.get("cycle").and_then(|v| v.as_str()), Some("V"));
}

#[test]
fn reimport_with_new_paralelo_moves_the_row() {
    let workspace = temp_dir("habilidades-enroll-move");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    seed(&mut stdin, &mut reader);
    let period_id = active_period_id(&mut stdin, &mut reader);

    request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "enrollments.import",
        json!({ "content": format!("{},Software,III", CEDULA) }),
    );
    let moved = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "enrollments.import",
        json!({ "content": format!("{},Software,III,B", CEDULA) }),
    );
    assert_eq!(moved.get("creados").and_then(|v| v.as_i64()), Some(0));
    assert_eq!(moved.get("actualizados").and_then(|v| v.as_i64()), Some(1));

    let row = single_enrollment(&mut stdin, &mut reader, &period_id);
    assert_eq!(row.get("paralelo").and_then(|v| v.as_str()), Some("B"));
}

#[test]
fn import_without_active_period_is_rejected() {
    let workspace = temp_dir("habilidades-enroll-noperiod");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let res = request(
        &mut stdin,
        &mut reader,
        "2",
        "enrollments.import",
        json!({ "content": format!("{},Software,III", CEDULA) }),
    );
    assert_eq!(res.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        res.get("error").and_then(|e| e.get("code")).and_then(|v| v.as_str()),
        Some("no_active_period")
    );
}

#[test]
fn unknown_student_is_an_itemized_row_error() {
    let workspace = temp_dir("habilidades-enroll-unknown");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    seed(&mut stdin, &mut reader);

    // Checksum-valid cédula that no student record carries.
    let res = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "enrollments.import",
        json!({ "content": "0926687856,Software,III" }),
    );
    assert_eq!(res.get("creados").and_then(|v| v.as_i64()), Some(0));
    let errores = res.get("errores").and_then(|v| v.as_array()).cloned().unwrap();
    assert_eq!(
        errores[0].as_str(),
        Some("Fila 1: Estudiante con cédula '0926687856' no encontrado.")
    );
}
