use crate::cedula;
use crate::importer::{self, ImportSummary};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, opt_str, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use sha2::{Digest, Sha256};
use uuid::Uuid;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Role {
    Administrador,
    Coordinador,
    Docente,
}

impl Role {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "administrador" => Some(Self::Administrador),
            "coordinador" => Some(Self::Coordinador),
            "docente" => Some(Self::Docente),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Administrador => "administrador",
            Self::Coordinador => "coordinador",
            Self::Docente => "docente",
        }
    }
}

fn hash_password(password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for b in digest {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

/// Accounts must use an institutional address.
fn is_institutional_email(email: &str) -> bool {
    email.contains('@') && email.ends_with(".edu.ec")
}

fn cedula_used_by_student(conn: &Connection, ced: &str) -> rusqlite::Result<bool> {
    conn.query_row("SELECT 1 FROM students WHERE cedula = ?", [ced], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
}

fn career_id_by_name(conn: &Connection, name: &str) -> rusqlite::Result<Option<String>> {
    conn.query_row(
        "SELECT id FROM careers WHERE name_norm = ?",
        [importer::normalize_key(name)],
        |r| r.get(0),
    )
    .optional()
}

fn handle_users_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };

    let mut stmt = match conn.prepare(
        "SELECT u.id, u.cedula, u.first_names, u.last_names, u.email, u.role, u.career_id, c.name
         FROM users u
         LEFT JOIN careers c ON c.id = u.career_id
         ORDER BY u.last_names, u.first_names",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let ced: String = row.get(1)?;
            let first: String = row.get(2)?;
            let last: String = row.get(3)?;
            let email: String = row.get(4)?;
            let role: String = row.get(5)?;
            let career_id: Option<String> = row.get(6)?;
            let career: Option<String> = row.get(7)?;
            Ok(json!({
                "id": id,
                "cedula": ced,
                "firstNames": first,
                "lastNames": last,
                "email": email,
                "role": role,
                "careerId": career_id,
                "career": career
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(users) => ok(&req.id, json!({ "users": users })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_users_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let ced = match required_str(req, "cedula") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let first = match required_str(req, "firstNames") {
        Ok(v) => importer::normalize_text(&v),
        Err(e) => return e,
    };
    let last = match required_str(req, "lastNames") {
        Ok(v) => importer::normalize_text(&v),
        Err(e) => return e,
    };
    let email = match required_str(req, "email") {
        Ok(v) => v.to_lowercase(),
        Err(e) => return e,
    };
    let password = match required_str(req, "password") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let role = match required_str(req, "role") {
        Ok(v) => match Role::parse(&v) {
            Some(r) => r,
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    "role must be one of: administrador, coordinador, docente",
                    Some(json!({ "role": v })),
                )
            }
        },
        Err(e) => return e,
    };

    if !cedula::is_valid(&ced) {
        return err(
            &req.id,
            "bad_params",
            format!("Cédula '{}' inválida.", ced),
            None,
        );
    }
    if !is_institutional_email(&email) {
        return err(
            &req.id,
            "bad_params",
            format!("Correo '{}' no es institucional.", email),
            None,
        );
    }

    match cedula_used_by_student(conn, &ced) {
        Ok(true) => {
            return err(
                &req.id,
                "conflict",
                format!("Cédula '{}' ya registrada como estudiante.", ced),
                None,
            )
        }
        Ok(false) => {}
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let duplicate: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM users WHERE cedula = ? OR email = ?",
            [&ced, &email],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if duplicate.is_some() {
        return err(
            &req.id,
            "conflict",
            "cédula o correo ya registrados",
            None,
        );
    }

    // Only coordinators carry a career reference.
    let career_id = if role == Role::Coordinador {
        match required_str(req, "careerId") {
            Ok(v) => Some(v),
            Err(e) => return e,
        }
    } else {
        None
    };

    let user_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO users(id, cedula, first_names, last_names, email, password_hash, role, career_id)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &user_id,
            &ced,
            &first,
            &last,
            &email,
            hash_password(&password),
            role.as_str(),
            &career_id,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "users" })),
        );
    }

    ok(
        &req.id,
        json!({ "userId": user_id, "email": email, "role": role.as_str() }),
    )
}

fn handle_users_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let user_id = match required_str(req, "userId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let first = match required_str(req, "firstNames") {
        Ok(v) => importer::normalize_text(&v),
        Err(e) => return e,
    };
    let last = match required_str(req, "lastNames") {
        Ok(v) => importer::normalize_text(&v),
        Err(e) => return e,
    };
    let email = match required_str(req, "email") {
        Ok(v) => v.to_lowercase(),
        Err(e) => return e,
    };
    if !is_institutional_email(&email) {
        return err(
            &req.id,
            "bad_params",
            format!("Correo '{}' no es institucional.", email),
            None,
        );
    }

    let taken: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM users WHERE email = ? AND id != ?",
            [&email, &user_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if taken.is_some() {
        return err(
            &req.id,
            "conflict",
            format!("Correo '{}' ya registrado.", email),
            None,
        );
    }

    let res = if let Some(password) = opt_str(req, "password") {
        conn.execute(
            "UPDATE users SET first_names = ?, last_names = ?, email = ?, password_hash = ? WHERE id = ?",
            (&first, &last, &email, hash_password(&password), &user_id),
        )
    } else {
        conn.execute(
            "UPDATE users SET first_names = ?, last_names = ?, email = ? WHERE id = ?",
            (&first, &last, &email, &user_id),
        )
    };
    match res {
        Ok(0) => err(&req.id, "not_found", "user not found", None),
        Ok(_) => ok(&req.id, json!({ "userId": user_id })),
        Err(e) => err(&req.id, "db_update_failed", e.to_string(), None),
    }
}

fn handle_users_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let user_id = match required_str(req, "userId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let in_use: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM assignments WHERE user_id = ? LIMIT 1",
            [&user_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if in_use.is_some() {
        return err(&req.id, "conflict", "user has subject assignments", None);
    }

    match conn.execute("DELETE FROM users WHERE id = ?", [&user_id]) {
        Ok(0) => err(&req.id, "not_found", "user not found", None),
        Ok(_) => ok(&req.id, json!({ "ok": true })),
        Err(e) => err(&req.id, "db_delete_failed", e.to_string(), None),
    }
}

/// Verifies credentials and returns the principal. No session is held
/// server side; callers thread the returned identity through later
/// requests themselves.
fn handle_auth_login(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let email = match required_str(req, "email") {
        Ok(v) => v.to_lowercase(),
        Err(e) => return e,
    };
    let password = match required_str(req, "password") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let row: Option<(String, String, String, String, String, Option<String>)> = match conn
        .query_row(
            "SELECT id, first_names, last_names, role, password_hash, career_id
             FROM users WHERE email = ?",
            [&email],
            |r| {
                Ok((
                    r.get(0)?,
                    r.get(1)?,
                    r.get(2)?,
                    r.get(3)?,
                    r.get(4)?,
                    r.get(5)?,
                ))
            },
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let Some((user_id, first, last, role, stored_hash, career_id)) = row else {
        return err(&req.id, "invalid_credentials", "correo o contraseña incorrectos", None);
    };
    if hash_password(&password) != stored_hash {
        return err(&req.id, "invalid_credentials", "correo o contraseña incorrectos", None);
    }

    ok(
        &req.id,
        json!({
            "userId": user_id,
            "firstNames": first,
            "lastNames": last,
            "email": email,
            "role": role,
            "careerId": career_id
        }),
    )
}

/// Bulk CSV import: `Cedula, Nombres, Apellidos, Email, Password, Rol,
/// [Carrera]`. Upsert keyed by cédula; the career column is resolved
/// only for coordinators. Whole file in one transaction.
fn handle_users_import(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let content = match required_str(req, "content") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let delimiter = importer::detect_delimiter(&content);
    let rows = importer::parse_rows(&content, delimiter);

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    let mut summary = ImportSummary::default();
    for row in &rows {
        if row.fields.len() < 6 || row.fields[0].is_empty() {
            summary.error(row.fila, "fila incompleta, se esperaban 6 columnas.");
            continue;
        }

        let ced = row.fields[0].replace(' ', "");
        let first = importer::normalize_text(&row.fields[1]);
        let last = importer::normalize_text(&row.fields[2]);
        let email = row.fields[3].trim().to_lowercase();
        let password = row.fields[4].clone();
        let role = match Role::parse(&row.fields[5]) {
            Some(r) => r,
            None => {
                summary.error(row.fila, format!("Rol '{}' inválido.", row.fields[5]));
                continue;
            }
        };

        if !cedula::is_valid(&ced) {
            summary.error(row.fila, format!("Cédula '{}' inválida.", ced));
            continue;
        }
        if !is_institutional_email(&email) {
            summary.error(row.fila, format!("Correo '{}' no es institucional.", email));
            continue;
        }
        if password.is_empty() {
            summary.error(row.fila, "contraseña vacía.");
            continue;
        }

        match cedula_used_by_student(&tx, &ced) {
            Ok(true) => {
                summary.error(
                    row.fila,
                    format!("Cédula '{}' ya registrada como estudiante.", ced),
                );
                continue;
            }
            Ok(false) => {}
            Err(e) => {
                let _ = tx.rollback();
                return err(&req.id, "db_query_failed", e.to_string(), None);
            }
        }

        let career_id = if role == Role::Coordinador {
            let raw = row.fields.get(6).map(|s| s.as_str()).unwrap_or("");
            let career = importer::normalize_text(raw);
            if career.is_empty() {
                summary.error(row.fila, "Coordinador requiere columna Carrera.");
                continue;
            }
            match career_id_by_name(&tx, &career) {
                Ok(Some(v)) => Some(v),
                Ok(None) => {
                    summary.error(row.fila, format!("Carrera '{}' inválida.", career));
                    continue;
                }
                Err(e) => {
                    let _ = tx.rollback();
                    return err(&req.id, "db_query_failed", e.to_string(), None);
                }
            }
        } else {
            None
        };

        let email_taken: Option<i64> = match tx
            .query_row(
                "SELECT 1 FROM users WHERE email = ? AND cedula != ?",
                [&email, &ced],
                |r| r.get(0),
            )
            .optional()
        {
            Ok(v) => v,
            Err(e) => {
                let _ = tx.rollback();
                return err(&req.id, "db_query_failed", e.to_string(), None);
            }
        };
        if email_taken.is_some() {
            summary.error(row.fila, format!("Correo '{}' ya registrado.", email));
            continue;
        }

        let existing: Option<String> = match tx
            .query_row("SELECT id FROM users WHERE cedula = ?", [&ced], |r| r.get(0))
            .optional()
        {
            Ok(v) => v,
            Err(e) => {
                let _ = tx.rollback();
                return err(&req.id, "db_query_failed", e.to_string(), None);
            }
        };

        let res = match existing {
            Some(user_id) => tx
                .execute(
                    "UPDATE users
                     SET first_names = ?, last_names = ?, email = ?, password_hash = ?, role = ?, career_id = ?
                     WHERE id = ?",
                    (
                        &first,
                        &last,
                        &email,
                        hash_password(&password),
                        role.as_str(),
                        &career_id,
                        &user_id,
                    ),
                )
                .map(|_| false),
            None => tx
                .execute(
                    "INSERT INTO users(id, cedula, first_names, last_names, email, password_hash, role, career_id)
                     VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
                    (
                        Uuid::new_v4().to_string(),
                        &ced,
                        &first,
                        &last,
                        &email,
                        hash_password(&password),
                        role.as_str(),
                        &career_id,
                    ),
                )
                .map(|_| true),
        };
        match res {
            Ok(true) => summary.creados += 1,
            Ok(false) => summary.actualizados += 1,
            Err(e) => {
                let _ = tx.rollback();
                return err(&req.id, "db_insert_failed", e.to_string(), None);
            }
        }
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({
            "message": "Importación de usuarios completada",
            "creados": summary.creados,
            "actualizados": summary.actualizados,
            "errores": summary.errores
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "users.list" => Some(handle_users_list(state, req)),
        "users.create" => Some(handle_users_create(state, req)),
        "users.update" => Some(handle_users_update(state, req)),
        "users.delete" => Some(handle_users_delete(state, req)),
        "users.import" => Some(handle_users_import(state, req)),
        "auth.login" => Some(handle_auth_login(state, req)),
        _ => None,
    }
}
