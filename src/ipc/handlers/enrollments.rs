use crate::importer::{self, ImportSummary};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn active_period_id(conn: &Connection) -> rusqlite::Result<Option<String>> {
    conn.query_row("SELECT id FROM periods WHERE active = 1", [], |r| r.get(0))
        .optional()
}

fn handle_enrollments_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let period_id = match required_str(req, "periodId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let mut stmt = match conn.prepare(
        "SELECT e.id, s.id, s.cedula, s.first_names, s.last_names, cy.name, e.paralelo
         FROM enrollments e
         JOIN students s ON s.id = e.student_id
         JOIN cycles cy ON cy.id = e.cycle_id
         WHERE e.period_id = ?
         ORDER BY e.paralelo, s.last_names, s.first_names",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([&period_id], |row| {
            let id: String = row.get(0)?;
            let student_id: String = row.get(1)?;
            let ced: String = row.get(2)?;
            let first: String = row.get(3)?;
            let last: String = row.get(4)?;
            let cycle: String = row.get(5)?;
            let paralelo: String = row.get(6)?;
            Ok(json!({
                "id": id,
                "studentId": student_id,
                "cedula": ced,
                "firstNames": first,
                "lastNames": last,
                "cycle": cycle,
                "paralelo": paralelo
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(enrollments) => ok(&req.id, json!({ "enrollments": enrollments })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_enrollments_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let enrollment_id = match required_str(req, "enrollmentId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    match conn.execute("DELETE FROM enrollments WHERE id = ?", [&enrollment_id]) {
        Ok(0) => err(&req.id, "not_found", "enrollment not found", None),
        Ok(_) => ok(&req.id, json!({ "ok": true })),
        Err(e) => err(&req.id, "db_delete_failed", e.to_string(), None),
    }
}

/// Bulk CSV import into the active period: `Cedula, Carrera, Ciclo,
/// [Paralelo]` (paralelo defaults to A).
///
/// Reconciliation is three-tier so re-imports never trip the
/// (student, period, paralelo) unique constraint:
/// 1. exact section match: keep the row, upgrade the cycle only when
///    the incoming Roman ordinal outranks the stored one;
/// 2. same student and period in another section: move that row
///    (cycle + paralelo) instead of inserting a duplicate;
/// 3. otherwise create.
fn handle_enrollments_import(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let content = match required_str(req, "content") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let period_id = match active_period_id(conn) {
        Ok(Some(v)) => v,
        Ok(None) => {
            return err(
                &req.id,
                "no_active_period",
                "no hay un periodo académico activo",
                None,
            )
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let delimiter = importer::detect_delimiter(&content);
    let rows = importer::parse_rows(&content, delimiter);

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    let mut summary = ImportSummary::default();
    for row in &rows {
        if row.fields.len() < 3 || row.fields[0].is_empty() {
            summary.error(row.fila, "fila incompleta, se esperaban al menos 3 columnas.");
            continue;
        }

        let ced = row.fields[0].replace(' ', "");
        let career = importer::normalize_text(&row.fields[1]);
        let cycle = importer::normalize_text(&row.fields[2]);
        let paralelo = row
            .fields
            .get(3)
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "A".to_string());

        let student_id: String = match tx
            .query_row("SELECT id FROM students WHERE cedula = ?", [&ced], |r| {
                r.get(0)
            })
            .optional()
        {
            Ok(Some(v)) => v,
            Ok(None) => {
                summary.error(
                    row.fila,
                    format!("Estudiante con cédula '{}' no encontrado.", ced),
                );
                continue;
            }
            Err(e) => {
                let _ = tx.rollback();
                return err(&req.id, "db_query_failed", e.to_string(), None);
            }
        };

        let career_exists: Option<i64> = match tx
            .query_row(
                "SELECT 1 FROM careers WHERE name_norm = ?",
                [importer::normalize_key(&career)],
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
        if career_exists.is_none() {
            summary.error(row.fila, format!("Carrera '{}' inválida.", career));
            continue;
        }

        let cycle_row: Option<(String, i64)> = match tx
            .query_row(
                "SELECT id, ordinal FROM cycles WHERE name_norm = ?",
                [importer::normalize_key(&cycle)],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()
        {
            Ok(v) => v,
            Err(e) => {
                let _ = tx.rollback();
                return err(&req.id, "db_query_failed", e.to_string(), None);
            }
        };
        let Some((cycle_id, new_ordinal)) = cycle_row else {
            summary.error(row.fila, format!("Ciclo '{}' inválido.", cycle));
            continue;
        };

        // Tier 1: same section.
        let same_section: Option<(String, i64, String)> = match tx
            .query_row(
                "SELECT e.id, cy.ordinal, cy.name
                 FROM enrollments e
                 JOIN cycles cy ON cy.id = e.cycle_id
                 WHERE e.student_id = ? AND e.period_id = ? AND e.paralelo = ?",
                [&student_id, &period_id, &paralelo],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .optional()
        {
            Ok(v) => v,
            Err(e) => {
                let _ = tx.rollback();
                return err(&req.id, "db_query_failed", e.to_string(), None);
            }
        };

        let mut effective_cycle = cycle.clone();
        let applied = if let Some((enrollment_id, stored_ordinal, stored_name)) = same_section {
            if new_ordinal > stored_ordinal {
                if let Err(e) = tx.execute(
                    "UPDATE enrollments SET cycle_id = ? WHERE id = ?",
                    [&cycle_id, &enrollment_id],
                ) {
                    let _ = tx.rollback();
                    return err(&req.id, "db_update_failed", e.to_string(), None);
                }
            } else {
                // No downgrade: the stored cycle stays authoritative.
                effective_cycle = stored_name;
            }
            false
        } else {
            // Tier 2: same student and period, different section.
            let other_section: Option<String> = match tx
                .query_row(
                    "SELECT id FROM enrollments WHERE student_id = ? AND period_id = ?",
                    [&student_id, &period_id],
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

            if let Some(enrollment_id) = other_section {
                if let Err(e) = tx.execute(
                    "UPDATE enrollments SET cycle_id = ?, paralelo = ? WHERE id = ?",
                    [&cycle_id, &paralelo, &enrollment_id],
                ) {
                    let _ = tx.rollback();
                    return err(&req.id, "db_update_failed", e.to_string(), None);
                }
                false
            } else {
                // Tier 3: new enrollment.
                if let Err(e) = tx.execute(
                    "INSERT INTO enrollments(id, student_id, period_id, cycle_id, paralelo)
                     VALUES(?, ?, ?, ?, ?)",
                    (
                        Uuid::new_v4().to_string(),
                        &student_id,
                        &period_id,
                        &cycle_id,
                        &paralelo,
                    ),
                ) {
                    let _ = tx.rollback();
                    return err(&req.id, "db_insert_failed", e.to_string(), None);
                }
                true
            }
        };

        // Keep the student's denormalized career/cycle labels current.
        if let Err(e) = tx.execute(
            "UPDATE students SET career = ?, cycle = ?, updated_at = ? WHERE id = ?",
            (
                &career,
                &effective_cycle,
                chrono::Utc::now().to_rfc3339(),
                &student_id,
            ),
        ) {
            let _ = tx.rollback();
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }

        if applied {
            summary.creados += 1;
        } else {
            summary.actualizados += 1;
        }
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({
            "message": "Importación de matrículas completada",
            "creados": summary.creados,
            "actualizados": summary.actualizados,
            "errores": summary.errores
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "enrollments.list" => Some(handle_enrollments_list(state, req)),
        "enrollments.import" => Some(handle_enrollments_import(state, req)),
        "enrollments.delete" => Some(handle_enrollments_delete(state, req)),
        _ => None,
    }
}
