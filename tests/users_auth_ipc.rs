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

#[test]
fn bulk_import_covers_roles_and_rejects_bad_rows() {
    let workspace = temp_dir("habilidades-users-import");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    request_ok(&mut stdin, &mut reader, "2", "careers.create", json!({ "name": "Software" }));

    let content = "\
1710034065,Juan,Pérez,juan.perez@uni.edu.ec,clave1,docente
0926687856,María,Salas,maria.salas@uni.edu.ec,clave2,coordinador,Software
0102030400,Pedro,Luna,pedro.luna@uni.edu.ec,clave3,administrador
1725364853,Rosa,Díaz,rosa.diaz@uni.edu.ec,clave4,Tutor
1304050600,Ana,Vega,ana.vega@gmail.com,clave5,docente
0901020305,Iván,Cruz,ivan.cruz@uni.edu.ec,clave6,coordinador
";
    let res = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "users.import",
        json!({ "content": content }),
    );
    assert_eq!(res.get("creados").and_then(|v| v.as_i64()), Some(3));
    assert_eq!(res.get("actualizados").and_then(|v| v.as_i64()), Some(0));
    let errores = res.get("errores").and_then(|v| v.as_array()).cloned().unwrap();
    let errores: Vec<&str> = errores.iter().map(|e| e.as_str().unwrap()).collect();
    assert_eq!(
        errores,
        vec![
            "Fila 4: Rol 'Tutor' inválido.",
            "Fila 5: Correo 'ana.vega@gmail.com' no es institucional.",
            "Fila 6: Coordinador requiere columna Carrera.",
        ]
    );

    let list = request_ok(&mut stdin, &mut reader, "4", "users.list", json!({}));
    let users = list.get("users").and_then(|v| v.as_array()).cloned().unwrap();
    assert_eq!(users.len(), 3);
    let coordinator = users
        .iter()
        .find(|u| u.get("role").and_then(|v| v.as_str()) == Some("coordinador"))
        .expect("a coordinator");
    assert_eq!(coordinator.get("career").and_then(|v| v.as_str()), Some("Software"));
}

#[test]
fn login_returns_the_principal_or_rejects() {
    let workspace = temp_dir("habilidades-users-login");
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
            "cedula": "1710034065",
            "firstNames": "Juan",
            "lastNames": "Pérez",
            "email": "Juan.Perez@uni.edu.ec",
            "password": "clave1",
            "role": "docente"
        }),
    );

    // Lookup is case-insensitive on the address.
    let principal = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "auth.login",
        json!({ "email": "juan.perez@uni.edu.ec", "password": "clave1" }),
    );
    assert_eq!(principal.get("role").and_then(|v| v.as_str()), Some("docente"));
    assert_eq!(principal.get("firstNames").and_then(|v| v.as_str()), Some("Juan"));
    assert!(principal.get("userId").and_then(|v| v.as_str()).is_some());

    let denied = request(
        &mut stdin,
        &mut reader,
        "4",
        "auth.login",
        json!({ "email": "juan.perez@uni.edu.ec", "password": "otra" }),
    );
    assert_eq!(denied.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        denied.get("error").and_then(|e| e.get("code")).and_then(|v| v.as_str()),
        Some("invalid_credentials")
    );
}

#[test]
fn coordinator_requires_a_career_reference() {
    let workspace = temp_dir("habilidades-users-coord");
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
        "users.create",
        json!({
            "cedula": "0926687856",
            "firstNames": "María",
            "lastNames": "Salas",
            "email": "maria.salas@uni.edu.ec",
            "password": "clave2",
            "role": "coordinador"
        }),
    );
    assert_eq!(res.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        res.get("error").and_then(|e| e.get("code")).and_then(|v| v.as_str()),
        Some("bad_params")
    );
}
