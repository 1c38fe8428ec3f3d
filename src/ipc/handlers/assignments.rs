use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn handle_assignments_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let period_id = match required_str(req, "periodId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let mut stmt = match conn.prepare(
        "SELECT a.id, a.paralelo,
                u.id, u.first_names, u.last_names,
                s.id, s.name, ca.name, cy.name
         FROM assignments a
         JOIN users u ON u.id = a.user_id
         JOIN subjects s ON s.id = a.subject_id
         JOIN careers ca ON ca.id = s.career_id
         JOIN cycles cy ON cy.id = s.cycle_id
         WHERE a.period_id = ?
         ORDER BY ca.name, s.name, a.paralelo",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([&period_id], |row| {
            let id: String = row.get(0)?;
            let paralelo: String = row.get(1)?;
            let user_id: String = row.get(2)?;
            let first: String = row.get(3)?;
            let last: String = row.get(4)?;
            let subject_id: String = row.get(5)?;
            let subject: String = row.get(6)?;
            let career: String = row.get(7)?;
            let cycle: String = row.get(8)?;
            Ok(json!({
                "id": id,
                "paralelo": paralelo,
                "userId": user_id,
                "teacher": format!("{} {}", first, last),
                "subjectId": subject_id,
                "subject": subject,
                "career": career,
                "cycle": cycle
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(assignments) => ok(&req.id, json!({ "assignments": assignments })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_assignments_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let user_id = match required_str(req, "userId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let period_id = match required_str(req, "periodId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let paralelo = match required_str(req, "paralelo") {
        Ok(v) => v.to_uppercase(),
        Err(e) => return e,
    };

    let role: Option<String> = match conn
        .query_row("SELECT role FROM users WHERE id = ?", [&user_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    match role.as_deref() {
        None => return err(&req.id, "not_found", "user not found", None),
        Some("docente") => {}
        Some(other) => {
            return err(
                &req.id,
                "bad_params",
                "only docente users can be assigned to subjects",
                Some(json!({ "role": other })),
            )
        }
    }

    let subject_exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM subjects WHERE id = ?", [&subject_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if subject_exists.is_none() {
        return err(&req.id, "not_found", "subject not found", None);
    }

    let taken: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM assignments WHERE subject_id = ? AND period_id = ? AND paralelo = ?",
            [&subject_id, &period_id, &paralelo],
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
            "this subject section already has a teacher for the period",
            Some(json!({ "paralelo": paralelo })),
        );
    }

    let assignment_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO assignments(id, user_id, subject_id, period_id, paralelo)
         VALUES(?, ?, ?, ?, ?)",
        (&assignment_id, &user_id, &subject_id, &period_id, &paralelo),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "assignments" })),
        );
    }

    ok(&req.id, json!({ "assignmentId": assignment_id }))
}

fn handle_assignments_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let assignment_id = match required_str(req, "assignmentId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let in_use: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM plannings WHERE assignment_id = ? LIMIT 1",
            [&assignment_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if in_use.is_some() {
        return err(&req.id, "conflict", "assignment has plannings", None);
    }

    match conn.execute("DELETE FROM assignments WHERE id = ?", [&assignment_id]) {
        Ok(0) => err(&req.id, "not_found", "assignment not found", None),
        Ok(_) => ok(&req.id, json!({ "ok": true })),
        Err(e) => err(&req.id, "db_delete_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "assignments.list" => Some(handle_assignments_list(state, req)),
        "assignments.create" => Some(handle_assignments_create(state, req)),
        "assignments.delete" => Some(handle_assignments_delete(state, req)),
        _ => None,
    }
}
