use crate::cedula;
use crate::importer::{self, ImportSummary};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, opt_str, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn now_ts() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Cédulas are unique across students and users combined; the sibling
/// table is always consulted before an insert.
fn cedula_used_by_user(conn: &Connection, cedula: &str) -> rusqlite::Result<bool> {
    conn.query_row("SELECT 1 FROM users WHERE cedula = ?", [cedula], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
}

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };

    let mut stmt = match conn.prepare(
        "SELECT id, cedula, first_names, last_names, email, career, cycle
         FROM students
         ORDER BY last_names, first_names",
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
            let email: Option<String> = row.get(4)?;
            let career: Option<String> = row.get(5)?;
            let cycle: Option<String> = row.get(6)?;
            Ok(json!({
                "id": id,
                "cedula": ced,
                "firstNames": first,
                "lastNames": last,
                "email": email,
                "career": career,
                "cycle": cycle
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(students) => ok(&req.id, json!({ "students": students })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_students_create(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let email = opt_str(req, "email").map(|e| e.to_lowercase());

    if !cedula::is_valid(&ced) {
        return err(
            &req.id,
            "bad_params",
            format!("Cédula '{}' inválida.", ced),
            None,
        );
    }

    match cedula_used_by_user(conn, &ced) {
        Ok(true) => {
            return err(
                &req.id,
                "conflict",
                format!("Cédula '{}' ya registrada como usuario.", ced),
                None,
            )
        }
        Ok(false) => {}
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let duplicate: Option<i64> = match conn
        .query_row("SELECT 1 FROM students WHERE cedula = ?", [&ced], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if duplicate.is_some() {
        return err(
            &req.id,
            "conflict",
            format!("Cédula '{}' ya registrada como estudiante.", ced),
            None,
        );
    }

    if let Some(em) = &email {
        let taken: Option<i64> = match conn
            .query_row("SELECT 1 FROM students WHERE email = ?", [em], |r| r.get(0))
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        if taken.is_some() {
            return err(
                &req.id,
                "conflict",
                format!("Correo '{}' ya registrado.", em),
                None,
            );
        }
    }

    let student_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO students(id, cedula, first_names, last_names, email, career, cycle, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &student_id,
            &ced,
            &first,
            &last,
            &email,
            opt_str(req, "career").map(|c| importer::normalize_text(&c)),
            opt_str(req, "cycle").map(|c| importer::normalize_text(&c)),
            now_ts(),
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }

    ok(&req.id, json!({ "studentId": student_id, "cedula": ced }))
}

fn handle_students_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
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
    let email = opt_str(req, "email").map(|e| e.to_lowercase());

    if let Some(em) = &email {
        let taken: Option<i64> = match conn
            .query_row(
                "SELECT 1 FROM students WHERE email = ? AND id != ?",
                [em, &student_id],
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
                format!("Correo '{}' ya registrado.", em),
                None,
            );
        }
    }

    match conn.execute(
        "UPDATE students SET first_names = ?, last_names = ?, email = ?, updated_at = ? WHERE id = ?",
        (&first, &last, &email, now_ts(), &student_id),
    ) {
        Ok(0) => err(&req.id, "not_found", "student not found", None),
        Ok(_) => ok(&req.id, json!({ "studentId": student_id })),
        Err(e) => err(&req.id, "db_update_failed", e.to_string(), None),
    }
}

fn handle_students_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let in_use: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM enrollments WHERE student_id = ?
             UNION ALL
             SELECT 1 FROM evaluations WHERE student_id = ?
             LIMIT 1",
            [&student_id, &student_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if in_use.is_some() {
        return err(
            &req.id,
            "conflict",
            "student has enrollments or evaluations",
            None,
        );
    }

    match conn.execute("DELETE FROM students WHERE id = ?", [&student_id]) {
        Ok(0) => err(&req.id, "not_found", "student not found", None),
        Ok(_) => ok(&req.id, json!({ "ok": true })),
        Err(e) => err(&req.id, "db_delete_failed", e.to_string(), None),
    }
}

/// Bulk CSV import: `Cedula, Nombres, Apellidos, Email` per row, upsert
/// keyed by cédula. Checksum and cross-table conflicts become itemized
/// row errors; the whole file runs in one transaction.
fn handle_students_import(state: &mut AppState, req: &Request) -> serde_json::Value {
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
        if row.fields.len() < 4 || row.fields[0].is_empty() {
            summary.error(row.fila, "fila incompleta, se esperaban 4 columnas.");
            continue;
        }

        let ced = row.fields[0].replace(' ', "");
        let first = importer::normalize_text(&row.fields[1]);
        let last = importer::normalize_text(&row.fields[2]);
        let email = row.fields[3].trim().to_lowercase();
        let email: Option<&str> = if email.is_empty() {
            None
        } else {
            Some(email.as_str())
        };

        if !cedula::is_valid(&ced) {
            summary.error(row.fila, format!("Cédula '{}' inválida.", ced));
            continue;
        }

        match cedula_used_by_user(&tx, &ced) {
            Ok(true) => {
                summary.error(
                    row.fila,
                    format!("Cédula '{}' ya registrada como usuario.", ced),
                );
                continue;
            }
            Ok(false) => {}
            Err(e) => {
                let _ = tx.rollback();
                return err(&req.id, "db_query_failed", e.to_string(), None);
            }
        }

        if let Some(em) = email {
            let taken: Option<i64> = match tx
                .query_row(
                    "SELECT 1 FROM students WHERE email = ? AND cedula != ?",
                    [em, ced.as_str()],
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
            if taken.is_some() {
                summary.error(row.fila, format!("Correo '{}' ya registrado.", em));
                continue;
            }
        }

        let existing: Option<String> = match tx
            .query_row("SELECT id FROM students WHERE cedula = ?", [&ced], |r| {
                r.get(0)
            })
            .optional()
        {
            Ok(v) => v,
            Err(e) => {
                let _ = tx.rollback();
                return err(&req.id, "db_query_failed", e.to_string(), None);
            }
        };

        let res = match existing {
            Some(student_id) => tx
                .execute(
                    "UPDATE students SET first_names = ?, last_names = ?, email = ?, updated_at = ?
                     WHERE id = ?",
                    (&first, &last, email, now_ts(), &student_id),
                )
                .map(|_| false),
            None => tx
                .execute(
                    "INSERT INTO students(id, cedula, first_names, last_names, email, updated_at)
                     VALUES(?, ?, ?, ?, ?, ?)",
                    (
                        Uuid::new_v4().to_string(),
                        &ced,
                        &first,
                        &last,
                        email,
                        now_ts(),
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
            "message": "Importación de estudiantes completada",
            "creados": summary.creados,
            "actualizados": summary.actualizados,
            "errores": summary.errores
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.list" => Some(handle_students_list(state, req)),
        "students.create" => Some(handle_students_create(state, req)),
        "students.update" => Some(handle_students_update(state, req)),
        "students.delete" => Some(handle_students_delete(state, req)),
        "students.import" => Some(handle_students_import(state, req)),
        _ => None,
    }
}
