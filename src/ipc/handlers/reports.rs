use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, opt_str, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::{params_from_iter, OptionalExtension};
use serde_json::json;

fn handle_reports_dashboard(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };

    let counts = conn.query_row(
        "SELECT
           (SELECT COUNT(*) FROM students),
           (SELECT COUNT(*) FROM users),
           (SELECT COUNT(*) FROM subjects),
           (SELECT COUNT(*) FROM skills),
           (SELECT COUNT(*) FROM careers)",
        [],
        |r| {
            Ok((
                r.get::<_, i64>(0)?,
                r.get::<_, i64>(1)?,
                r.get::<_, i64>(2)?,
                r.get::<_, i64>(3)?,
                r.get::<_, i64>(4)?,
            ))
        },
    );
    let (students, users, subjects, skills, careers) = match counts {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let active: Option<(String, String)> = match conn
        .query_row(
            "SELECT id, name FROM periods WHERE active = 1",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(
        &req.id,
        json!({
            "students": students,
            "users": users,
            "subjects": subjects,
            "skills": skills,
            "careers": careers,
            "activePeriod": active.map(|(id, name)| json!({ "id": id, "name": name }))
        }),
    )
}

/// Average recorded score per skill for a period, optionally narrowed
/// to one career. One aggregate query; no per-skill round trips.
fn handle_reports_skill_summary(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let period_id = match required_str(req, "periodId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let career_id = opt_str(req, "careerId");

    let mut sql = String::from(
        "SELECT sk.id, sk.name, COUNT(ev.id), AVG(ev.score)
         FROM evaluations ev
         JOIN skills sk ON sk.id = ev.skill_id
         JOIN plannings p ON p.id = ev.planning_id
         JOIN assignments a ON a.id = p.assignment_id
         JOIN subjects su ON su.id = a.subject_id
         WHERE a.period_id = ?",
    );
    let mut params: Vec<String> = vec![period_id.clone()];
    if let Some(cid) = career_id {
        sql.push_str(" AND su.career_id = ?");
        params.push(cid);
    }
    sql.push_str(" GROUP BY sk.id, sk.name ORDER BY sk.name");

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(params_from_iter(params.iter()), |row| {
            let skill_id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let evaluated: i64 = row.get(2)?;
            let average: Option<f64> = row.get(3)?;
            Ok(json!({
                "skillId": skill_id,
                "skill": name,
                "evaluated": evaluated,
                "average": average
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(summary) => ok(
            &req.id,
            json!({ "periodId": period_id, "skills": summary }),
        ),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_reports_student_summary(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let period_id = match required_str(req, "periodId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let mut stmt = match conn.prepare(
        "SELECT sk.id, sk.name, COUNT(ev.id), AVG(ev.score)
         FROM evaluations ev
         JOIN skills sk ON sk.id = ev.skill_id
         JOIN plannings p ON p.id = ev.planning_id
         JOIN assignments a ON a.id = p.assignment_id
         WHERE ev.student_id = ? AND a.period_id = ?
         GROUP BY sk.id, sk.name
         ORDER BY sk.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([&student_id, &period_id], |row| {
            let skill_id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let evaluated: i64 = row.get(2)?;
            let average: Option<f64> = row.get(3)?;
            Ok(json!({
                "skillId": skill_id,
                "skill": name,
                "evaluated": evaluated,
                "average": average
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(summary) => ok(
            &req.id,
            json!({ "studentId": student_id, "periodId": period_id, "skills": summary }),
        ),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.dashboard" => Some(handle_reports_dashboard(state, req)),
        "reports.skillSummary" => Some(handle_reports_skill_summary(state, req)),
        "reports.studentSummary" => Some(handle_reports_student_summary(state, req)),
        _ => None,
    }
}
