use crate::importer::{self, ImportSummary};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn lookup_catalog_id(
    conn: &Connection,
    table: &str,
    name: &str,
) -> rusqlite::Result<Option<String>> {
    let sql = format!("SELECT id FROM {} WHERE name_norm = ?", table);
    conn.query_row(&sql, [importer::normalize_key(name)], |r| r.get(0))
        .optional()
}

fn handle_subjects_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };

    // One joined query; never a lookup per subject.
    let mut stmt = match conn.prepare(
        "SELECT s.id, s.name, ca.id, ca.name, cy.id, cy.name, u.id, u.name
         FROM subjects s
         JOIN careers ca ON ca.id = s.career_id
         JOIN cycles cy ON cy.id = s.cycle_id
         JOIN curricular_units u ON u.id = s.curricular_unit_id
         ORDER BY ca.name, cy.ordinal, s.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let career_id: String = row.get(2)?;
            let career: String = row.get(3)?;
            let cycle_id: String = row.get(4)?;
            let cycle: String = row.get(5)?;
            let unit_id: String = row.get(6)?;
            let unit: String = row.get(7)?;
            Ok(json!({
                "id": id,
                "name": name,
                "careerId": career_id,
                "career": career,
                "cycleId": cycle_id,
                "cycle": cycle,
                "unitId": unit_id,
                "unit": unit
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(subjects) => ok(&req.id, json!({ "subjects": subjects })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_subjects_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => importer::normalize_text(&v),
        Err(e) => return e,
    };
    let career_id = match required_str(req, "careerId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let cycle_id = match required_str(req, "cycleId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let unit_id = match required_str(req, "unitId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let name_norm = importer::normalize_key(&name);

    let existing: Option<String> = match conn
        .query_row(
            "SELECT id FROM subjects WHERE name_norm = ? AND career_id = ?",
            [&name_norm, &career_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if existing.is_some() {
        return err(
            &req.id,
            "conflict",
            "subject already exists for this career",
            Some(json!({ "name": name })),
        );
    }

    let subject_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO subjects(id, name, name_norm, career_id, cycle_id, curricular_unit_id)
         VALUES(?, ?, ?, ?, ?, ?)",
        (&subject_id, &name, &name_norm, &career_id, &cycle_id, &unit_id),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "subjects" })),
        );
    }

    ok(&req.id, json!({ "subjectId": subject_id, "name": name }))
}

fn handle_subjects_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => importer::normalize_text(&v),
        Err(e) => return e,
    };
    let career_id = match required_str(req, "careerId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let cycle_id = match required_str(req, "cycleId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let unit_id = match required_str(req, "unitId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let name_norm = importer::normalize_key(&name);

    let taken: Option<String> = match conn
        .query_row(
            "SELECT id FROM subjects WHERE name_norm = ? AND career_id = ? AND id != ?",
            [&name_norm, &career_id, &subject_id],
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
            "another subject already uses this name for the career",
            Some(json!({ "name": name })),
        );
    }

    match conn.execute(
        "UPDATE subjects
         SET name = ?, name_norm = ?, career_id = ?, cycle_id = ?, curricular_unit_id = ?
         WHERE id = ?",
        (&name, &name_norm, &career_id, &cycle_id, &unit_id, &subject_id),
    ) {
        Ok(0) => err(&req.id, "not_found", "subject not found", None),
        Ok(_) => ok(&req.id, json!({ "subjectId": subject_id, "name": name })),
        Err(e) => err(&req.id, "db_update_failed", e.to_string(), None),
    }
}

fn handle_subjects_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let in_use: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM assignments WHERE subject_id = ? LIMIT 1",
            [&subject_id],
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
            "subject has teacher assignments",
            None,
        );
    }

    match conn.execute("DELETE FROM subjects WHERE id = ?", [&subject_id]) {
        Ok(0) => err(&req.id, "not_found", "subject not found", None),
        Ok(_) => ok(&req.id, json!({ "ok": true })),
        Err(e) => err(&req.id, "db_delete_failed", e.to_string(), None),
    }
}

/// Bulk CSV import: `Name, Career, Cycle, CurricularUnit` per row.
/// Upsert key is (normalized name, career); a match refreshes the cycle
/// and curricular unit. The whole file runs in one transaction; row
/// errors skip the row without aborting the rest.
fn handle_subjects_import(state: &mut AppState, req: &Request) -> serde_json::Value {
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

        let name = importer::normalize_text(&row.fields[0]);
        let career = importer::normalize_text(&row.fields[1]);
        let cycle = importer::normalize_text(&row.fields[2]);
        let unit = importer::normalize_text(&row.fields[3]);

        let career_id = match lookup_catalog_id(&tx, "careers", &career) {
            Ok(Some(v)) => v,
            Ok(None) => {
                summary.error(
                    row.fila,
                    format!("Carrera '{}' inválida para '{}'.", career, name),
                );
                continue;
            }
            Err(e) => {
                let _ = tx.rollback();
                return err(&req.id, "db_query_failed", e.to_string(), None);
            }
        };
        let cycle_id = match lookup_catalog_id(&tx, "cycles", &cycle) {
            Ok(Some(v)) => v,
            Ok(None) => {
                summary.error(
                    row.fila,
                    format!("Ciclo '{}' inválido para '{}'.", cycle, name),
                );
                continue;
            }
            Err(e) => {
                let _ = tx.rollback();
                return err(&req.id, "db_query_failed", e.to_string(), None);
            }
        };
        let unit_id = match lookup_catalog_id(&tx, "curricular_units", &unit) {
            Ok(Some(v)) => v,
            Ok(None) => {
                summary.error(
                    row.fila,
                    format!("Unidad '{}' inválida para '{}'.", unit, name),
                );
                continue;
            }
            Err(e) => {
                let _ = tx.rollback();
                return err(&req.id, "db_query_failed", e.to_string(), None);
            }
        };

        let name_norm = importer::normalize_key(&name);
        let existing: Option<String> = match tx
            .query_row(
                "SELECT id FROM subjects WHERE name_norm = ? AND career_id = ?",
                [&name_norm, &career_id],
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

        let res = match existing {
            Some(subject_id) => tx
                .execute(
                    "UPDATE subjects SET cycle_id = ?, curricular_unit_id = ? WHERE id = ?",
                    (&cycle_id, &unit_id, &subject_id),
                )
                .map(|_| false),
            None => tx
                .execute(
                    "INSERT INTO subjects(id, name, name_norm, career_id, cycle_id, curricular_unit_id)
                     VALUES(?, ?, ?, ?, ?, ?)",
                    (
                        Uuid::new_v4().to_string(),
                        &name,
                        &name_norm,
                        &career_id,
                        &cycle_id,
                        &unit_id,
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
            "message": "Importación de asignaturas completada",
            "creados": summary.creados,
            "actualizados": summary.actualizados,
            "errores": summary.errores
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "subjects.list" => Some(handle_subjects_list(state, req)),
        "subjects.create" => Some(handle_subjects_create(state, req)),
        "subjects.update" => Some(handle_subjects_update(state, req)),
        "subjects.delete" => Some(handle_subjects_delete(state, req)),
        "subjects.import" => Some(handle_subjects_import(state, req)),
        _ => None,
    }
}
