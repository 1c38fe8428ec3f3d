use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use std::collections::HashSet;
use uuid::Uuid;

/// Academic term half. Only 1 and 2 exist.
fn parse_parcial(req: &Request) -> Result<i64, serde_json::Value> {
    match req.params.get("parcial").and_then(|v| v.as_i64()) {
        Some(p) if p == 1 || p == 2 => Ok(p),
        Some(p) => Err(err(
            &req.id,
            "bad_params",
            "parcial must be 1 or 2",
            Some(json!({ "parcial": p })),
        )),
        None => Err(err(&req.id, "bad_params", "missing parcial", None)),
    }
}

fn handle_planning_status(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let assignment_id = match required_str(req, "assignmentId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let mut parciales: Vec<serde_json::Value> = Vec::new();
    for parcial in 1..=2i64 {
        let planning: Option<String> = match conn
            .query_row(
                "SELECT id FROM plannings WHERE assignment_id = ? AND parcial = ?",
                (&assignment_id, parcial),
                |r| r.get(0),
            )
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        parciales.push(json!({
            "parcial": parcial,
            "exists": planning.is_some(),
            "planningId": planning
        }));
    }

    ok(&req.id, json!({ "parciales": parciales }))
}

fn handle_planning_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let assignment_id = match required_str(req, "assignmentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let parcial = match parse_parcial(req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let planning: Option<(String, Option<String>)> = match conn
        .query_row(
            "SELECT id, created_at FROM plannings WHERE assignment_id = ? AND parcial = ?",
            (&assignment_id, parcial),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((planning_id, created_at)) = planning else {
        return err(&req.id, "not_found", "planning not found", None);
    };

    let mut stmt = match conn.prepare(
        "SELECT sk.id, sk.name, sk.description
         FROM planning_skills ps
         JOIN skills sk ON sk.id = ps.skill_id
         WHERE ps.planning_id = ?
         ORDER BY sk.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let skills = stmt
        .query_map([&planning_id], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let description: String = row.get(2)?;
            Ok(json!({ "id": id, "name": name, "description": description }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match skills {
        Ok(skills) => ok(
            &req.id,
            json!({
                "planningId": planning_id,
                "parcial": parcial,
                "createdAt": created_at,
                "skills": skills
            }),
        ),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

/// Creates or replaces the skill set a teacher plans to evaluate in one
/// parcial. A planned skill that already has recorded evaluations
/// cannot be dropped from the set.
fn handle_planning_save(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let assignment_id = match required_str(req, "assignmentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let parcial = match parse_parcial(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(skill_ids) = req.params.get("skillIds").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing skillIds", None);
    };
    let skill_ids: Vec<String> = skill_ids
        .iter()
        .filter_map(|v| v.as_str())
        .map(|s| s.to_string())
        .collect();
    if skill_ids.is_empty() {
        return err(&req.id, "bad_params", "skillIds must not be empty", None);
    }

    let assignment_exists: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM assignments WHERE id = ?",
            [&assignment_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if assignment_exists.is_none() {
        return err(&req.id, "not_found", "assignment not found", None);
    }

    for skill_id in &skill_ids {
        let exists: Option<i64> = match conn
            .query_row("SELECT 1 FROM skills WHERE id = ?", [skill_id], |r| r.get(0))
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        if exists.is_none() {
            return err(
                &req.id,
                "not_found",
                "skill not found",
                Some(json!({ "skillId": skill_id })),
            );
        }
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    let existing: Option<String> = match tx
        .query_row(
            "SELECT id FROM plannings WHERE assignment_id = ? AND parcial = ?",
            (&assignment_id, parcial),
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

    let (planning_id, created) = match existing {
        Some(id) => (id, false),
        None => {
            let id = Uuid::new_v4().to_string();
            if let Err(e) = tx.execute(
                "INSERT INTO plannings(id, assignment_id, parcial, created_at) VALUES(?, ?, ?, ?)",
                (&id, &assignment_id, parcial, chrono::Utc::now().to_rfc3339()),
            ) {
                let _ = tx.rollback();
                return err(&req.id, "db_insert_failed", e.to_string(), None);
            }
            (id, true)
        }
    };

    let wanted: HashSet<&str> = skill_ids.iter().map(|s| s.as_str()).collect();

    // A skill leaves the planning only if nothing was graded against it.
    let current: Vec<String> = {
        let fetched = tx
            .prepare("SELECT skill_id FROM planning_skills WHERE planning_id = ?")
            .and_then(|mut stmt| {
                stmt.query_map([&planning_id], |r| r.get::<_, String>(0))
                    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            });
        match fetched {
            Ok(v) => v,
            Err(e) => {
                let _ = tx.rollback();
                return err(&req.id, "db_query_failed", e.to_string(), None);
            }
        }
    };
    for skill_id in &current {
        if wanted.contains(skill_id.as_str()) {
            continue;
        }
        let graded: Option<i64> = match tx
            .query_row(
                "SELECT 1 FROM evaluations WHERE planning_id = ? AND skill_id = ? LIMIT 1",
                [&planning_id, skill_id],
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
        if graded.is_some() {
            let _ = tx.rollback();
            return err(
                &req.id,
                "conflict",
                "cannot remove a planned skill that already has evaluations",
                Some(json!({ "skillId": skill_id })),
            );
        }
        if let Err(e) = tx.execute(
            "DELETE FROM planning_skills WHERE planning_id = ? AND skill_id = ?",
            [&planning_id, skill_id],
        ) {
            let _ = tx.rollback();
            return err(&req.id, "db_delete_failed", e.to_string(), None);
        }
    }

    let current_set: HashSet<String> = current.into_iter().collect();
    for skill_id in &skill_ids {
        if current_set.contains(skill_id) {
            continue;
        }
        if let Err(e) = tx.execute(
            "INSERT INTO planning_skills(planning_id, skill_id) VALUES(?, ?)",
            [&planning_id, skill_id],
        ) {
            let _ = tx.rollback();
            return err(&req.id, "db_insert_failed", e.to_string(), None);
        }
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({
            "planningId": planning_id,
            "parcial": parcial,
            "created": created,
            "skillCount": skill_ids.len()
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "planning.status" => Some(handle_planning_status(state, req)),
        "planning.get" => Some(handle_planning_get(state, req)),
        "planning.save" => Some(handle_planning_save(state, req)),
        _ => None,
    }
}
