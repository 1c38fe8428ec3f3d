use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

struct PlanningContext {
    period_id: String,
    paralelo: String,
}

fn planning_context(
    conn: &Connection,
    planning_id: &str,
) -> rusqlite::Result<Option<PlanningContext>> {
    conn.query_row(
        "SELECT a.period_id, a.paralelo
         FROM plannings p
         JOIN assignments a ON a.id = p.assignment_id
         WHERE p.id = ?",
        [planning_id],
        |r| {
            Ok(PlanningContext {
                period_id: r.get(0)?,
                paralelo: r.get(1)?,
            })
        },
    )
    .optional()
}

/// Enrolled students crossed with the planned skills, with any recorded
/// scores filled in. Three queries total regardless of grid size.
fn handle_evaluations_grid(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let planning_id = match required_str(req, "planningId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let ctx = match planning_context(conn, &planning_id) {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "not_found", "planning not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut skill_stmt = match conn.prepare(
        "SELECT sk.id, sk.name
         FROM planning_skills ps
         JOIN skills sk ON sk.id = ps.skill_id
         WHERE ps.planning_id = ?
         ORDER BY sk.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let skills: Vec<(String, String)> = match skill_stmt
        .query_map([&planning_id], |r| Ok((r.get(0)?, r.get(1)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut student_stmt = match conn.prepare(
        "SELECT s.id, s.cedula, s.first_names, s.last_names
         FROM enrollments e
         JOIN students s ON s.id = e.student_id
         WHERE e.period_id = ? AND e.paralelo = ?
         ORDER BY s.last_names, s.first_names",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let students: Vec<(String, String, String, String)> = match student_stmt
        .query_map([&ctx.period_id, &ctx.paralelo], |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut score_stmt = match conn.prepare(
        "SELECT student_id, skill_id, score, remark FROM evaluations WHERE planning_id = ?",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let mut scores: HashMap<(String, String), (f64, Option<String>)> = HashMap::new();
    let score_rows = score_stmt
        .query_map([&planning_id], |r| {
            let student_id: String = r.get(0)?;
            let skill_id: String = r.get(1)?;
            let score: f64 = r.get(2)?;
            let remark: Option<String> = r.get(3)?;
            Ok((student_id, skill_id, score, remark))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match score_rows {
        Ok(rows) => {
            for (student_id, skill_id, score, remark) in rows {
                scores.insert((student_id, skill_id), (score, remark));
            }
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let student_rows: Vec<serde_json::Value> = students
        .into_iter()
        .map(|(id, ced, first, last)| {
            let cells: Vec<serde_json::Value> = skills
                .iter()
                .map(|(skill_id, _)| {
                    match scores.get(&(id.clone(), skill_id.clone())) {
                        Some((score, remark)) => json!({
                            "skillId": skill_id,
                            "score": score,
                            "remark": remark
                        }),
                        None => json!({ "skillId": skill_id, "score": null, "remark": null }),
                    }
                })
                .collect();
            json!({
                "studentId": id,
                "cedula": ced,
                "firstNames": first,
                "lastNames": last,
                "cells": cells
            })
        })
        .collect();

    let skill_cols: Vec<serde_json::Value> = skills
        .iter()
        .map(|(id, name)| json!({ "id": id, "name": name }))
        .collect();

    ok(
        &req.id,
        json!({
            "planningId": planning_id,
            "skills": skill_cols,
            "students": student_rows
        }),
    )
}

/// Bulk upsert of rubric scores. Every entry is validated before any
/// write: a bad entry rejects the whole request with no partial state.
fn handle_evaluations_record(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let planning_id = match required_str(req, "planningId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(entries) = req.params.get("scores").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing scores", None);
    };
    if entries.is_empty() {
        return err(&req.id, "bad_params", "scores must not be empty", None);
    }

    let ctx = match planning_context(conn, &planning_id) {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "not_found", "planning not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let planned: HashSet<String> = {
        let mut stmt = match conn
            .prepare("SELECT skill_id FROM planning_skills WHERE planning_id = ?")
        {
            Ok(s) => s,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        match stmt
            .query_map([&planning_id], |r| r.get::<_, String>(0))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        {
            Ok(v) => v.into_iter().collect(),
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    };

    let enrolled: HashSet<String> = {
        let mut stmt = match conn.prepare(
            "SELECT student_id FROM enrollments WHERE period_id = ? AND paralelo = ?",
        ) {
            Ok(s) => s,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        match stmt
            .query_map([&ctx.period_id, &ctx.paralelo], |r| r.get::<_, String>(0))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        {
            Ok(v) => v.into_iter().collect(),
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    };

    struct ScoreEntry {
        student_id: String,
        skill_id: String,
        score: f64,
        remark: Option<String>,
    }

    let mut parsed: Vec<ScoreEntry> = Vec::with_capacity(entries.len());
    for (i, entry) in entries.iter().enumerate() {
        let Some(student_id) = entry.get("studentId").and_then(|v| v.as_str()) else {
            return err(
                &req.id,
                "bad_params",
                "scores entry missing studentId",
                Some(json!({ "index": i })),
            );
        };
        let Some(skill_id) = entry.get("skillId").and_then(|v| v.as_str()) else {
            return err(
                &req.id,
                "bad_params",
                "scores entry missing skillId",
                Some(json!({ "index": i })),
            );
        };
        let Some(score) = entry.get("score").and_then(|v| v.as_f64()) else {
            return err(
                &req.id,
                "bad_params",
                "scores entry missing numeric score",
                Some(json!({ "index": i })),
            );
        };
        if !(0.0..=10.0).contains(&score) {
            return err(
                &req.id,
                "bad_params",
                "score must be between 0 and 10",
                Some(json!({ "index": i, "score": score })),
            );
        }
        if !planned.contains(skill_id) {
            return err(
                &req.id,
                "bad_params",
                "skill is not part of this planning",
                Some(json!({ "index": i, "skillId": skill_id })),
            );
        }
        if !enrolled.contains(student_id) {
            return err(
                &req.id,
                "bad_params",
                "student is not enrolled in this section",
                Some(json!({ "index": i, "studentId": student_id })),
            );
        }
        parsed.push(ScoreEntry {
            student_id: student_id.to_string(),
            skill_id: skill_id.to_string(),
            score,
            remark: entry
                .get("remark")
                .and_then(|v| v.as_str())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
        });
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    let now = chrono::Utc::now().to_rfc3339();
    for entry in &parsed {
        if let Err(e) = tx.execute(
            "INSERT INTO evaluations(id, planning_id, student_id, skill_id, score, remark, updated_at)
             VALUES(?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(planning_id, student_id, skill_id) DO UPDATE SET
               score = excluded.score,
               remark = excluded.remark,
               updated_at = excluded.updated_at",
            (
                Uuid::new_v4().to_string(),
                &planning_id,
                &entry.student_id,
                &entry.skill_id,
                entry.score,
                &entry.remark,
                &now,
            ),
        ) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "evaluations" })),
            );
        }
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "recorded": parsed.len() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "evaluations.grid" => Some(handle_evaluations_grid(state, req)),
        "evaluations.record" => Some(handle_evaluations_record(state, req)),
        _ => None,
    }
}
