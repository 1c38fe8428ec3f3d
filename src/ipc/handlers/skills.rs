use crate::importer::{self, ImportSummary};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;
use uuid::Uuid;

fn insert_activity_if_new(
    conn: &Connection,
    skill_id: &str,
    description: &str,
) -> rusqlite::Result<bool> {
    let exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM skill_activities WHERE skill_id = ? AND description = ?",
            [skill_id, description],
            |r| r.get(0),
        )
        .optional()?;
    if exists.is_some() {
        return Ok(false);
    }
    conn.execute(
        "INSERT INTO skill_activities(id, skill_id, description) VALUES(?, ?, ?)",
        (Uuid::new_v4().to_string(), skill_id, description),
    )?;
    Ok(true)
}

fn handle_skills_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };

    let mut stmt = match conn.prepare("SELECT id, name, description FROM skills ORDER BY name") {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let skills: Vec<(String, String, String)> = match stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    // Activities in one batched child query, grouped in memory.
    let mut act_stmt = match conn.prepare(
        "SELECT skill_id, description FROM skill_activities ORDER BY skill_id, rowid",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let mut activities: HashMap<String, Vec<String>> = HashMap::new();
    let act_rows = act_stmt
        .query_map([], |row| {
            let skill_id: String = row.get(0)?;
            let description: String = row.get(1)?;
            Ok((skill_id, description))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match act_rows {
        Ok(rows) => {
            for (skill_id, description) in rows {
                activities.entry(skill_id).or_default().push(description);
            }
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let out: Vec<serde_json::Value> = skills
        .into_iter()
        .map(|(id, name, description)| {
            let acts = activities.remove(&id).unwrap_or_default();
            json!({ "id": id, "name": name, "description": description, "activities": acts })
        })
        .collect();

    ok(&req.id, json!({ "skills": out }))
}

fn handle_skills_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => importer::normalize_text(&v),
        Err(e) => return e,
    };
    let description = req
        .params
        .get("description")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .trim()
        .to_string();
    let name_norm = importer::normalize_key(&name);

    let exists: Option<String> = match conn
        .query_row(
            "SELECT id FROM skills WHERE name_norm = ?",
            [&name_norm],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_some() {
        return err(
            &req.id,
            "conflict",
            "skill already exists",
            Some(json!({ "name": name })),
        );
    }

    let skill_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO skills(id, name, name_norm, description) VALUES(?, ?, ?, ?)",
        (&skill_id, &name, &name_norm, &description),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "skills" })),
        );
    }

    if let Some(acts) = req.params.get("activities").and_then(|v| v.as_array()) {
        for act in acts {
            let Some(text) = act.as_str().map(|s| s.trim()).filter(|s| !s.is_empty()) else {
                continue;
            };
            if let Err(e) = insert_activity_if_new(conn, &skill_id, text) {
                return err(&req.id, "db_insert_failed", e.to_string(), None);
            }
        }
    }

    ok(&req.id, json!({ "skillId": skill_id, "name": name }))
}

fn handle_skills_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let skill_id = match required_str(req, "skillId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => importer::normalize_text(&v),
        Err(e) => return e,
    };
    let description = req
        .params
        .get("description")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .trim()
        .to_string();
    let name_norm = importer::normalize_key(&name);

    let taken: Option<String> = match conn
        .query_row(
            "SELECT id FROM skills WHERE name_norm = ? AND id != ?",
            [&name_norm, &skill_id],
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
            "another skill already uses this name",
            Some(json!({ "name": name })),
        );
    }

    match conn.execute(
        "UPDATE skills SET name = ?, name_norm = ?, description = ? WHERE id = ?",
        (&name, &name_norm, &description, &skill_id),
    ) {
        Ok(0) => err(&req.id, "not_found", "skill not found", None),
        Ok(_) => ok(&req.id, json!({ "skillId": skill_id, "name": name })),
        Err(e) => err(&req.id, "db_update_failed", e.to_string(), None),
    }
}

fn handle_skills_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let skill_id = match required_str(req, "skillId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let in_use: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM planning_skills WHERE skill_id = ?
             UNION ALL
             SELECT 1 FROM evaluations WHERE skill_id = ?
             LIMIT 1",
            [&skill_id, &skill_id],
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
            "skill is referenced by plannings or evaluations",
            None,
        );
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute("DELETE FROM skill_activities WHERE skill_id = ?", [&skill_id]) {
        let _ = tx.rollback();
        return err(&req.id, "db_delete_failed", e.to_string(), None);
    }
    let deleted = match tx.execute("DELETE FROM skills WHERE id = ?", [&skill_id]) {
        Ok(n) => n,
        Err(e) => {
            let _ = tx.rollback();
            return err(&req.id, "db_delete_failed", e.to_string(), None);
        }
    };
    if deleted == 0 {
        let _ = tx.rollback();
        return err(&req.id, "not_found", "skill not found", None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

/// Bulk CSV import: `Name, Description, Activity1, Activity2, ...` with
/// a variable activity tail. Upsert keyed by normalized name; activity
/// text is first-or-create per skill so re-imports never duplicate it.
fn handle_skills_import(state: &mut AppState, req: &Request) -> serde_json::Value {
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
        if row.fields.len() < 2 || row.fields[0].is_empty() {
            summary.error(row.fila, "fila incompleta, se esperaban al menos 2 columnas.");
            continue;
        }

        let name = importer::normalize_text(&row.fields[0]);
        let name_norm = importer::normalize_key(&name);
        let description = row.fields[1].trim().to_string();

        let existing: Option<String> = match tx
            .query_row(
                "SELECT id FROM skills WHERE name_norm = ?",
                [&name_norm],
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

        let (skill_id, created) = match existing {
            Some(id) => {
                if let Err(e) = tx.execute(
                    "UPDATE skills SET description = ? WHERE id = ?",
                    (&description, &id),
                ) {
                    let _ = tx.rollback();
                    return err(&req.id, "db_update_failed", e.to_string(), None);
                }
                (id, false)
            }
            None => {
                let id = Uuid::new_v4().to_string();
                if let Err(e) = tx.execute(
                    "INSERT INTO skills(id, name, name_norm, description) VALUES(?, ?, ?, ?)",
                    (&id, &name, &name_norm, &description),
                ) {
                    let _ = tx.rollback();
                    return err(&req.id, "db_insert_failed", e.to_string(), None);
                }
                (id, true)
            }
        };

        for activity in row.fields.iter().skip(2) {
            let text = activity.trim();
            if text.is_empty() {
                continue;
            }
            if let Err(e) = insert_activity_if_new(&tx, &skill_id, text) {
                let _ = tx.rollback();
                return err(&req.id, "db_insert_failed", e.to_string(), None);
            }
        }

        if created {
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
            "message": "Importación de habilidades completada",
            "creados": summary.creados,
            "actualizados": summary.actualizados,
            "errores": summary.errores
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "skills.list" => Some(handle_skills_list(state, req)),
        "skills.create" => Some(handle_skills_create(state, req)),
        "skills.update" => Some(handle_skills_update(state, req)),
        "skills.delete" => Some(handle_skills_delete(state, req)),
        "skills.import" => Some(handle_skills_import(state, req)),
        _ => None,
    }
}
